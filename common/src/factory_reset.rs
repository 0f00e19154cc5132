use log::{error, info, warn};
use serde::Serialize;

use crate::{
    config::FactoryResetConfig,
    error::StorageError,
    keys::{NS_FIRMWARE, NS_LIFECYCLE, NS_UPDATE, NS_WIFI},
    platform::Platform,
    records::PendingErase,
    restart_counter::RestartCounter,
    slot::{Slot, SlotStore, ERASED_BYTE},
    store::{erase_namespace, ConfigStore},
};

const VERIFY_CHUNK: u64 = 4096;

/// What a factory reset got done before the restart.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
pub struct FactoryResetReport {
    pub erased_namespaces: Vec<String>,
    pub erased_slots: Vec<String>,
    pub deferred_slot: Option<String>,
    pub failures: Vec<String>,
}

impl FactoryResetReport {
    fn failed(&mut self, step: &str, err: impl std::fmt::Display) {
        error!("factory reset: {step} failed: {err}");
        self.failures.push(format!("{step}: {err}"));
    }
}

/// Wipes user state and returns the device to its factory image.
///
/// Every step runs even when an earlier one fails. The last step restarts the
/// device.
pub fn execute_factory_reset<S, P>(
    store: &dyn ConfigStore,
    slots: &mut S,
    platform: &P,
    counter: &mut RestartCounter,
    config: &FactoryResetConfig,
) -> FactoryResetReport
where
    S: SlotStore + ?Sized,
    P: Platform + ?Sized,
{
    warn!("factory reset starting");
    let mut report = FactoryResetReport::default();

    counter.reset(store);
    platform.feed_watchdog();

    if let Err(err) = platform.restore_network_defaults() {
        report.failed("network restore", err);
    }
    if let Err(err) = platform.reset_accessory_state() {
        report.failed("accessory reset", err);
    }

    let mut namespaces = vec![NS_FIRMWARE, NS_LIFECYCLE, NS_UPDATE];
    if config.erase_wifi_credentials {
        namespaces.push(NS_WIFI);
    }
    for namespace in namespaces {
        match erase_namespace(store, namespace) {
            Ok(()) => report.erased_namespaces.push(namespace.to_string()),
            Err(err) => report.failed(&format!("erase namespace {namespace}"), err),
        }
        platform.feed_watchdog();
    }

    if let Err(err) = slots.erase_boot_selection() {
        report.failed("erase boot selection", err);
    }

    if config.erase_inactive_slots {
        erase_ota_slots(store, slots, platform, &mut report);
    }

    info!(
        "factory reset done: {} namespaces, {} slots erased, {} failures; restarting",
        report.erased_namespaces.len(),
        report.erased_slots.len(),
        report.failures.len()
    );
    platform.restart();
    report
}

fn erase_ota_slots<S, P>(
    store: &dyn ConfigStore,
    slots: &mut S,
    platform: &P,
    report: &mut FactoryResetReport,
) where
    S: SlotStore + ?Sized,
    P: Platform + ?Sized,
{
    // Without a factory slot the OTA slots hold the only bootable image.
    match slots.factory_slot() {
        Ok(Some(_)) => {}
        Ok(None) => {
            warn!("no factory slot, keeping OTA slots");
            return;
        }
        Err(err) => {
            report.failed("find factory slot", err);
            return;
        }
    }

    let (running, app_slots) = match (slots.running_slot(), slots.app_slots()) {
        (Ok(running), Ok(app_slots)) => (running, app_slots),
        (Err(err), _) | (_, Err(err)) => {
            report.failed("list slots", err);
            return;
        }
    };

    for slot in app_slots.iter().filter(|slot| slot.is_ota()) {
        if slot.label == running.label {
            continue;
        }
        platform.feed_watchdog();
        match slots.erase(slot, 0, slot.size) {
            Ok(()) => report.erased_slots.push(slot.label.clone()),
            Err(err) => report.failed(&format!("erase slot {}", slot.label), err),
        }
    }

    if running.is_ota() {
        info!("{} is running, erase deferred to next boot", running.label);
        let pending = PendingErase {
            slot_label: running.label.clone(),
            attempts: 0,
        };
        match pending.save(store) {
            Ok(()) => report.deferred_slot = Some(running.label),
            Err(err) => report.failed("record pending erase", err),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum PendingEraseOutcome {
    Nothing,
    Completed(String),
    /// Still the running slot; kept for a later boot.
    StillRunning(String),
    Retrying { slot_label: String, attempts: u32 },
    /// Recorded slot no longer exists; marker dropped.
    UnknownSlot(String),
}

/// Finishes a slot erase left over from a factory reset that ran while the
/// slot was executing.
pub fn resume_pending_erase<S, P>(
    store: &dyn ConfigStore,
    slots: &mut S,
    platform: &P,
) -> PendingEraseOutcome
where
    S: SlotStore + ?Sized,
    P: Platform + ?Sized,
{
    let pending = match PendingErase::load(store) {
        Ok(Some(pending)) => pending,
        Ok(None) => return PendingEraseOutcome::Nothing,
        Err(err) => {
            warn!("unreadable pending erase marker, dropping it: {err}");
            clear_marker(store);
            return PendingEraseOutcome::Nothing;
        }
    };

    let slot = slots.app_slots().ok().and_then(|all| {
        all.into_iter()
            .find(|slot| slot.label == pending.slot_label)
    });
    let Some(slot) = slot else {
        warn!("pending erase names unknown slot {}", pending.slot_label);
        clear_marker(store);
        return PendingEraseOutcome::UnknownSlot(pending.slot_label);
    };

    if slots
        .running_slot()
        .map(|running| running.label == slot.label)
        .unwrap_or(true)
    {
        return PendingEraseOutcome::StillRunning(pending.slot_label);
    }

    platform.feed_watchdog();
    let erased = slots
        .erase(&slot, 0, slot.size)
        .and_then(|()| is_erased(&*slots, &slot));
    platform.feed_watchdog();

    match erased {
        Ok(true) => {
            info!("deferred erase of {} completed", slot.label);
            clear_marker(store);
            PendingEraseOutcome::Completed(slot.label)
        }
        outcome => {
            match outcome {
                Err(err) => error!("deferred erase of {} failed: {err}", slot.label),
                _ => error!("{} did not read back erased", slot.label),
            }
            let retry = PendingErase {
                attempts: pending.attempts.saturating_add(1),
                ..pending
            };
            if let Err(err) = retry.save(store) {
                warn!("could not update pending erase marker: {err}");
            }
            PendingEraseOutcome::Retrying {
                slot_label: retry.slot_label,
                attempts: retry.attempts,
            }
        }
    }
}

fn clear_marker(store: &dyn ConfigStore) {
    if let Err(err) = PendingErase::clear(store) {
        warn!("could not clear pending erase marker: {err}");
    }
}

/// Reads back the first and last chunk.
fn is_erased<S: SlotStore + ?Sized>(slots: &S, slot: &Slot) -> Result<bool, StorageError> {
    let len = VERIFY_CHUNK.min(slot.size);
    let mut chunk = vec![0_u8; len as usize];
    for offset in [0, slot.size - len] {
        slots.read(slot, offset, &mut chunk)?;
        if chunk.iter().any(|byte| *byte != ERASED_BYTE) {
            return Ok(false);
        }
    }
    Ok(true)
}

#[cfg(test)]
mod tests {
    use pretty_assertions::assert_eq;

    use super::*;
    use crate::{
        config::RestartCounterConfig,
        keys::{KEY_REPOSITORY, KEY_WIFI_SSID},
        platform::ResetReason,
        records::{FirmwareConfig, RestartCounterRecord, UpdateIntent},
        slot::MemorySlotStore,
        store::MemoryStore,
        testing::RecordingPlatform,
    };

    fn seeded_store() -> MemoryStore {
        let store = MemoryStore::new();
        FirmwareConfig {
            repository: "acme/widget".to_string(),
            prefer_prerelease: true,
        }
        .save(&store)
        .unwrap();
        UpdateIntent::set(&store).unwrap();
        RestartCounterRecord {
            count: 10,
            last_timestamp: 99,
        }
        .save(&store)
        .unwrap();
        store.insert_raw(NS_WIFI, KEY_WIFI_SSID, b"home");
        store
    }

    fn reset(
        store: &MemoryStore,
        slots: &mut MemorySlotStore,
        platform: &RecordingPlatform,
    ) -> FactoryResetReport {
        let mut counter = RestartCounter::new(RestartCounterConfig::default());
        execute_factory_reset(
            store,
            slots,
            platform,
            &mut counter,
            &FactoryResetConfig::default(),
        )
    }

    #[test]
    fn wipes_state_and_restarts_last() {
        let store = seeded_store();
        let mut slots = MemorySlotStore::new(2, 8192, "factory");
        slots.fill("ota_0", &[0xE9; 1000]);
        let platform = RecordingPlatform::new(ResetReason::PowerOn, "1.0.0");

        let report = reset(&store, &mut slots, &platform);

        assert_eq!(report.failures, Vec::<String>::new());
        assert_eq!(
            report.erased_namespaces,
            vec!["fwcfg", "lcm", "lcm_ota", "wifi_cfg"]
        );
        assert_eq!(report.erased_slots, vec!["ota_0", "ota_1"]);
        assert_eq!(report.deferred_slot, None);
        assert!(store.is_namespace_empty(NS_FIRMWARE));
        assert!(store.is_namespace_empty(NS_UPDATE));
        assert!(store.is_namespace_empty(NS_WIFI));
        assert_eq!(RestartCounterRecord::load(&store).unwrap().count, 0);
        assert_eq!(slots.boot_label(), None);
        assert!(slots.contents("ota_0").unwrap().iter().all(|b| *b == 0xFF));
        assert_eq!(
            platform.log(),
            vec!["restore_network", "reset_accessory", "restart"]
        );
    }

    #[test]
    fn failed_network_restore_does_not_stop_the_rest() {
        let store = seeded_store();
        let mut slots = MemorySlotStore::new(2, 8192, "factory");
        let platform = RecordingPlatform::new(ResetReason::PowerOn, "1.0.0");
        platform.set_fail_network_restore(true);

        let report = reset(&store, &mut slots, &platform);

        assert_eq!(report.failures.len(), 1);
        assert_eq!(store.raw(NS_FIRMWARE, KEY_REPOSITORY), None);
        assert_eq!(platform.restarts(), 1);
    }

    #[test]
    fn running_ota_slot_is_deferred() {
        let store = seeded_store();
        let mut slots = MemorySlotStore::new(2, 8192, "ota_1");
        slots.fill("ota_1", &[0xE9; 1000]);
        let platform = RecordingPlatform::new(ResetReason::PowerOn, "1.0.0");

        let report = reset(&store, &mut slots, &platform);

        assert_eq!(report.erased_slots, vec!["ota_0"]);
        assert_eq!(report.deferred_slot.as_deref(), Some("ota_1"));
        assert_eq!(
            PendingErase::load(&store).unwrap(),
            Some(PendingErase {
                slot_label: "ota_1".to_string(),
                attempts: 0
            })
        );
        assert_eq!(slots.contents("ota_1").unwrap()[0], 0xE9);
    }

    #[test]
    fn no_factory_slot_keeps_ota_images() {
        let store = seeded_store();
        let mut slots = MemorySlotStore::without_factory(2, 8192, "ota_0");
        slots.fill("ota_1", &[0xE9; 64]);
        let platform = RecordingPlatform::new(ResetReason::PowerOn, "1.0.0");

        let report = reset(&store, &mut slots, &platform);

        assert!(report.erased_slots.is_empty());
        assert_eq!(report.deferred_slot, None);
        assert_eq!(slots.contents("ota_1").unwrap()[0], 0xE9);
        assert!(store.is_namespace_empty(NS_FIRMWARE));
    }

    #[test]
    fn wifi_credentials_can_be_kept() {
        let store = seeded_store();
        let mut slots = MemorySlotStore::new(2, 8192, "factory");
        let platform = RecordingPlatform::new(ResetReason::PowerOn, "1.0.0");
        let mut counter = RestartCounter::new(RestartCounterConfig::default());

        let report = execute_factory_reset(
            &store,
            &mut slots,
            &platform,
            &mut counter,
            &FactoryResetConfig {
                erase_inactive_slots: false,
                erase_wifi_credentials: false,
            },
        );

        assert!(report.erased_slots.is_empty());
        assert!(!store.is_namespace_empty(NS_WIFI));
    }

    #[test]
    fn pending_erase_completes_after_reboot() {
        let store = MemoryStore::new();
        let mut slots = MemorySlotStore::new(2, 8192, "factory");
        slots.fill("ota_1", &[0xE9; 8192]);
        PendingErase {
            slot_label: "ota_1".to_string(),
            attempts: 0,
        }
        .save(&store)
        .unwrap();
        let platform = RecordingPlatform::new(ResetReason::Software, "1.0.0");

        assert_eq!(
            resume_pending_erase(&store, &mut slots, &platform),
            PendingEraseOutcome::Completed("ota_1".to_string())
        );
        assert_eq!(PendingErase::load(&store).unwrap(), None);
        assert!(slots.contents("ota_1").unwrap().iter().all(|b| *b == 0xFF));
        assert_eq!(
            resume_pending_erase(&store, &mut slots, &platform),
            PendingEraseOutcome::Nothing
        );
    }

    #[test]
    fn pending_erase_waits_while_slot_runs_and_retries_on_failure() {
        let store = MemoryStore::new();
        let mut slots = MemorySlotStore::new(2, 8192, "ota_1");
        PendingErase {
            slot_label: "ota_1".to_string(),
            attempts: 0,
        }
        .save(&store)
        .unwrap();
        let platform = RecordingPlatform::new(ResetReason::Software, "1.0.0");

        assert_eq!(
            resume_pending_erase(&store, &mut slots, &platform),
            PendingEraseOutcome::StillRunning("ota_1".to_string())
        );

        slots.set_running("factory");
        slots.set_fail_erase(true);
        assert_eq!(
            resume_pending_erase(&store, &mut slots, &platform),
            PendingEraseOutcome::Retrying {
                slot_label: "ota_1".to_string(),
                attempts: 1
            }
        );
        assert_eq!(PendingErase::load(&store).unwrap().unwrap().attempts, 1);
    }

    #[test]
    fn pending_erase_that_does_not_read_back_is_retried() {
        let store = MemoryStore::new();
        let mut slots = MemorySlotStore::new(2, 8192, "factory");
        slots.fill("ota_1", &[0xE9; 8192]);
        slots.set_stuck_erase(true);
        PendingErase {
            slot_label: "ota_1".to_string(),
            attempts: 0,
        }
        .save(&store)
        .unwrap();
        let platform = RecordingPlatform::new(ResetReason::Software, "1.0.0");

        assert_eq!(
            resume_pending_erase(&store, &mut slots, &platform),
            PendingEraseOutcome::Retrying {
                slot_label: "ota_1".to_string(),
                attempts: 1
            }
        );
        assert_eq!(slots.erases(), 1);
        assert_eq!(PendingErase::load(&store).unwrap().unwrap().attempts, 1);

        slots.set_stuck_erase(false);
        assert_eq!(
            resume_pending_erase(&store, &mut slots, &platform),
            PendingEraseOutcome::Completed("ota_1".to_string())
        );
    }

    #[test]
    fn pending_erase_of_unknown_slot_is_dropped() {
        let store = MemoryStore::new();
        let mut slots = MemorySlotStore::new(2, 8192, "factory");
        PendingErase {
            slot_label: "ota_7".to_string(),
            attempts: 2,
        }
        .save(&store)
        .unwrap();
        let platform = RecordingPlatform::new(ResetReason::Software, "1.0.0");

        assert_eq!(
            resume_pending_erase(&store, &mut slots, &platform),
            PendingEraseOutcome::UnknownSlot("ota_7".to_string())
        );
        assert_eq!(PendingErase::load(&store).unwrap(), None);
    }
}
