use std::sync::{Arc, Mutex, MutexGuard, PoisonError};

use serde::Serialize;

use crate::error::StorageError;

pub const ERASED_BYTE: u8 = 0xFF;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum SlotKind {
    Factory,
    Ota(u8),
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct Slot {
    pub label: String,
    pub kind: SlotKind,
    pub size: u64,
}

impl Slot {
    pub fn is_ota(&self) -> bool {
        matches!(self.kind, SlotKind::Ota(_))
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct SlotMetadata {
    /// Image length as recorded by the image header and segment table.
    pub declared_length: u64,
}

/// Application partitions plus the boot selection record (otadata).
pub trait SlotStore: Send {
    fn running_slot(&self) -> Result<Slot, StorageError>;
    fn app_slots(&self) -> Result<Vec<Slot>, StorageError>;
    fn boot_slot(&self) -> Result<Option<Slot>, StorageError>;
    fn read(&self, slot: &Slot, offset: u64, buf: &mut [u8]) -> Result<(), StorageError>;
    fn erase(&mut self, slot: &Slot, offset: u64, len: u64) -> Result<(), StorageError>;
    fn write(&mut self, slot: &Slot, offset: u64, data: &[u8]) -> Result<(), StorageError>;
    /// `None` when the slot holds no recognisable image.
    fn metadata(&self, slot: &Slot) -> Result<Option<SlotMetadata>, StorageError>;
    fn mark_bootable(&mut self, slot: &Slot) -> Result<(), StorageError>;
    fn select_factory(&mut self) -> Result<(), StorageError>;
    fn erase_boot_selection(&mut self) -> Result<(), StorageError>;

    /// The OTA slot after the running one, wrapping around. Never the
    /// running slot.
    fn find_inactive_slot(&self) -> Result<Option<Slot>, StorageError> {
        let running = self.running_slot()?;
        let ota: Vec<Slot> = self
            .app_slots()?
            .into_iter()
            .filter(Slot::is_ota)
            .collect();

        let start = ota
            .iter()
            .position(|slot| slot.label == running.label)
            .map_or(0, |idx| idx + 1);
        Ok((0..ota.len())
            .map(|step| &ota[(start + step) % ota.len()])
            .find(|slot| slot.label != running.label)
            .cloned())
    }

    fn factory_slot(&self) -> Result<Option<Slot>, StorageError> {
        Ok(self
            .app_slots()?
            .into_iter()
            .find(|slot| slot.kind == SlotKind::Factory))
    }
}

pub(crate) fn check_bounds(slot: &Slot, offset: u64, len: u64) -> Result<(), StorageError> {
    match offset.checked_add(len) {
        Some(end) if end <= slot.size => Ok(()),
        _ => Err(StorageError::OutOfBounds {
            slot: slot.label.clone(),
            offset,
            len,
        }),
    }
}

#[derive(Debug)]
struct MemorySlot {
    slot: Slot,
    data: Vec<u8>,
    high_water: u64,
    declared_override: Option<u64>,
    bootable: bool,
}

#[derive(Debug, Default)]
struct MemorySlotsInner {
    slots: Vec<MemorySlot>,
    running: String,
    boot: Option<String>,
    writes: usize,
    erases: usize,
    fail_mark_bootable: bool,
    fail_erase: bool,
    stuck_erase: bool,
}

/// RAM-backed [`SlotStore`] with a factory slot and OTA slots. Clones share
/// contents.
#[derive(Debug, Clone, Default)]
pub struct MemorySlotStore {
    inner: Arc<Mutex<MemorySlotsInner>>,
}

impl MemorySlotStore {
    /// `factory` plus `ota_0..ota_{ota_count-1}`, each `size` bytes, running
    /// from `running`.
    pub fn new(ota_count: u8, size: u64, running: &str) -> Self {
        let mut slots = vec![MemorySlot::new("factory", SlotKind::Factory, size)];
        for idx in 0..ota_count {
            slots.push(MemorySlot::new(&format!("ota_{idx}"), SlotKind::Ota(idx), size));
        }

        Self {
            inner: Arc::new(Mutex::new(MemorySlotsInner {
                slots,
                running: running.to_string(),
                boot: Some(running.to_string()),
                ..MemorySlotsInner::default()
            })),
        }
    }

    /// OTA slots only, as on a layout without a factory partition.
    pub fn without_factory(ota_count: u8, size: u64, running: &str) -> Self {
        let store = Self::new(ota_count, size, running);
        store
            .lock()
            .slots
            .retain(|s| s.slot.kind != SlotKind::Factory);
        store
    }

    fn lock(&self) -> MutexGuard<'_, MemorySlotsInner> {
        self.inner.lock().unwrap_or_else(PoisonError::into_inner)
    }

    pub fn set_running(&self, label: &str) {
        self.lock().running = label.to_string();
    }

    pub fn set_declared_length(&self, label: &str, declared: Option<u64>) {
        if let Some(slot) = self.lock().slots.iter_mut().find(|s| s.slot.label == label) {
            slot.declared_override = declared;
        }
    }

    pub fn set_fail_mark_bootable(&self, fail: bool) {
        self.lock().fail_mark_bootable = fail;
    }

    pub fn set_fail_erase(&self, fail: bool) {
        self.lock().fail_erase = fail;
    }

    /// Erases report success but leave the last byte of the range at zero.
    pub fn set_stuck_erase(&self, stuck: bool) {
        self.lock().stuck_erase = stuck;
    }

    pub fn fill(&self, label: &str, data: &[u8]) {
        if let Some(slot) = self.lock().slots.iter_mut().find(|s| s.slot.label == label) {
            slot.data[..data.len()].copy_from_slice(data);
            slot.high_water = data.len() as u64;
        }
    }

    pub fn contents(&self, label: &str) -> Option<Vec<u8>> {
        self.lock()
            .slots
            .iter()
            .find(|s| s.slot.label == label)
            .map(|s| s.data.clone())
    }

    pub fn is_bootable(&self, label: &str) -> bool {
        self.lock()
            .slots
            .iter()
            .any(|s| s.slot.label == label && s.bootable)
    }

    pub fn boot_label(&self) -> Option<String> {
        self.lock().boot.clone()
    }

    pub fn writes(&self) -> usize {
        self.lock().writes
    }

    pub fn erases(&self) -> usize {
        self.lock().erases
    }
}

impl MemorySlot {
    fn new(label: &str, kind: SlotKind, size: u64) -> Self {
        Self {
            slot: Slot {
                label: label.to_string(),
                kind,
                size,
            },
            data: vec![ERASED_BYTE; size as usize],
            high_water: 0,
            declared_override: None,
            bootable: false,
        }
    }
}

fn not_found(slot: &Slot) -> StorageError {
    StorageError::SlotNotFound(slot.label.clone())
}

impl SlotStore for MemorySlotStore {
    fn running_slot(&self) -> Result<Slot, StorageError> {
        let inner = self.lock();
        inner
            .slots
            .iter()
            .find(|s| s.slot.label == inner.running)
            .map(|s| s.slot.clone())
            .ok_or_else(|| StorageError::SlotNotFound(inner.running.clone()))
    }

    fn app_slots(&self) -> Result<Vec<Slot>, StorageError> {
        Ok(self.lock().slots.iter().map(|s| s.slot.clone()).collect())
    }

    fn boot_slot(&self) -> Result<Option<Slot>, StorageError> {
        let inner = self.lock();
        Ok(inner.boot.as_ref().and_then(|label| {
            inner
                .slots
                .iter()
                .find(|s| &s.slot.label == label)
                .map(|s| s.slot.clone())
        }))
    }

    fn read(&self, slot: &Slot, offset: u64, buf: &mut [u8]) -> Result<(), StorageError> {
        check_bounds(slot, offset, buf.len() as u64)?;
        let inner = self.lock();
        let stored = inner
            .slots
            .iter()
            .find(|s| s.slot.label == slot.label)
            .ok_or_else(|| not_found(slot))?;
        let start = offset as usize;
        buf.copy_from_slice(&stored.data[start..start + buf.len()]);
        Ok(())
    }

    fn erase(&mut self, slot: &Slot, offset: u64, len: u64) -> Result<(), StorageError> {
        check_bounds(slot, offset, len)?;
        let mut inner = self.lock();
        if inner.fail_erase {
            return Err(StorageError::Flash {
                slot: slot.label.clone(),
                reason: "injected erase failure".to_string(),
            });
        }
        inner.erases += 1;
        let stuck = inner.stuck_erase;
        let stored = inner
            .slots
            .iter_mut()
            .find(|s| s.slot.label == slot.label)
            .ok_or_else(|| not_found(slot))?;
        let start = offset as usize;
        let end = start + len as usize;
        stored.data[start..end].fill(ERASED_BYTE);
        if stuck && end > start {
            stored.data[end - 1] = 0x00;
        }
        if offset == 0 {
            stored.high_water = 0;
            stored.bootable = false;
        }
        Ok(())
    }

    fn write(&mut self, slot: &Slot, offset: u64, data: &[u8]) -> Result<(), StorageError> {
        check_bounds(slot, offset, data.len() as u64)?;
        let mut inner = self.lock();
        inner.writes += 1;
        let stored = inner
            .slots
            .iter_mut()
            .find(|s| s.slot.label == slot.label)
            .ok_or_else(|| not_found(slot))?;
        let start = offset as usize;
        // NOR flash only clears bits.
        for (dst, src) in stored.data[start..start + data.len()].iter_mut().zip(data) {
            *dst &= *src;
        }
        stored.high_water = stored.high_water.max(offset + data.len() as u64);
        Ok(())
    }

    fn metadata(&self, slot: &Slot) -> Result<Option<SlotMetadata>, StorageError> {
        let inner = self.lock();
        let stored = inner
            .slots
            .iter()
            .find(|s| s.slot.label == slot.label)
            .ok_or_else(|| not_found(slot))?;
        if let Some(declared_length) = stored.declared_override {
            return Ok(Some(SlotMetadata { declared_length }));
        }
        if stored.high_water == 0 || stored.data.first() == Some(&ERASED_BYTE) {
            return Ok(None);
        }
        Ok(Some(SlotMetadata {
            declared_length: stored.high_water,
        }))
    }

    fn mark_bootable(&mut self, slot: &Slot) -> Result<(), StorageError> {
        let mut inner = self.lock();
        if inner.fail_mark_bootable {
            return Err(StorageError::Flash {
                slot: slot.label.clone(),
                reason: "injected boot selection failure".to_string(),
            });
        }
        let stored = inner
            .slots
            .iter_mut()
            .find(|s| s.slot.label == slot.label)
            .ok_or_else(|| not_found(slot))?;
        stored.bootable = true;
        inner.boot = Some(slot.label.clone());
        Ok(())
    }

    fn select_factory(&mut self) -> Result<(), StorageError> {
        let mut inner = self.lock();
        let label = inner
            .slots
            .iter()
            .find(|s| s.slot.kind == SlotKind::Factory)
            .map(|s| s.slot.label.clone())
            .ok_or_else(|| StorageError::SlotNotFound("factory".to_string()))?;
        inner.boot = Some(label);
        Ok(())
    }

    fn erase_boot_selection(&mut self) -> Result<(), StorageError> {
        self.lock().boot = None;
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use pretty_assertions::assert_eq;

    use super::*;

    #[test]
    fn inactive_slot_is_never_the_running_one() {
        let slots = MemorySlotStore::new(2, 4096, "ota_0");
        assert_eq!(slots.find_inactive_slot().unwrap().unwrap().label, "ota_1");

        slots.set_running("ota_1");
        assert_eq!(slots.find_inactive_slot().unwrap().unwrap().label, "ota_0");

        slots.set_running("factory");
        assert_eq!(slots.find_inactive_slot().unwrap().unwrap().label, "ota_0");
    }

    #[test]
    fn single_ota_slot_running_leaves_nothing_inactive() {
        let slots = MemorySlotStore::new(1, 4096, "ota_0");
        assert_eq!(slots.find_inactive_slot().unwrap(), None);
    }

    #[test]
    fn writes_outside_the_slot_are_rejected() {
        let mut slots = MemorySlotStore::new(2, 1024, "ota_0");
        let target = slots.find_inactive_slot().unwrap().unwrap();
        assert!(matches!(
            slots.write(&target, 1000, &[0_u8; 64]),
            Err(StorageError::OutOfBounds { .. })
        ));
    }

    #[test]
    fn metadata_tracks_written_image() {
        let mut slots = MemorySlotStore::new(2, 1024, "ota_0");
        let target = slots.find_inactive_slot().unwrap().unwrap();
        assert_eq!(slots.metadata(&target).unwrap(), None);

        slots.write(&target, 0, &[0xE9; 300]).unwrap();
        assert_eq!(
            slots.metadata(&target).unwrap(),
            Some(SlotMetadata {
                declared_length: 300
            })
        );
    }
}
