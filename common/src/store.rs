use std::{
    collections::BTreeMap,
    sync::{Arc, Mutex, MutexGuard, PoisonError},
};

use crate::error::StorageError;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum OpenMode {
    ReadOnly,
    ReadWrite,
}

/// One open namespace. Writes become durable on [`StoreHandle::commit`];
/// dropping the handle closes it.
pub trait StoreHandle {
    fn get(&self, key: &str) -> Result<Option<Vec<u8>>, StorageError>;
    fn set(&mut self, key: &str, value: &[u8]) -> Result<(), StorageError>;
    fn erase_key(&mut self, key: &str) -> Result<(), StorageError>;
    fn erase_all(&mut self) -> Result<(), StorageError>;
    fn commit(&mut self) -> Result<(), StorageError>;
}

/// Namespaced durable key-value storage (NVS on the device).
///
/// Opening a namespace that does not exist yet yields an empty view.
pub trait ConfigStore: Send {
    fn open(
        &self,
        namespace: &str,
        mode: OpenMode,
    ) -> Result<Box<dyn StoreHandle + '_>, StorageError>;
}

pub trait StoreHandleExt: StoreHandle {
    fn get_u32(&self, key: &str) -> Result<Option<u32>, StorageError> {
        self.get(key)?
            .map(|raw| {
                <[u8; 4]>::try_from(raw.as_slice())
                    .map(u32::from_le_bytes)
                    .map_err(|_| decode_error(key, "expected 4 bytes"))
            })
            .transpose()
    }

    fn set_u32(&mut self, key: &str, value: u32) -> Result<(), StorageError> {
        self.set(key, &value.to_le_bytes())
    }

    fn get_u64(&self, key: &str) -> Result<Option<u64>, StorageError> {
        self.get(key)?
            .map(|raw| {
                <[u8; 8]>::try_from(raw.as_slice())
                    .map(u64::from_le_bytes)
                    .map_err(|_| decode_error(key, "expected 8 bytes"))
            })
            .transpose()
    }

    fn set_u64(&mut self, key: &str, value: u64) -> Result<(), StorageError> {
        self.set(key, &value.to_le_bytes())
    }

    fn get_bool(&self, key: &str) -> Result<Option<bool>, StorageError> {
        self.get(key)?
            .map(|raw| match raw.as_slice() {
                [0] => Ok(false),
                [_] => Ok(true),
                _ => Err(decode_error(key, "expected 1 byte")),
            })
            .transpose()
    }

    fn set_bool(&mut self, key: &str, value: bool) -> Result<(), StorageError> {
        self.set(key, &[u8::from(value)])
    }

    fn get_str(&self, key: &str) -> Result<Option<String>, StorageError> {
        self.get(key)?
            .map(|raw| String::from_utf8(raw).map_err(|_| decode_error(key, "not utf-8")))
            .transpose()
    }

    fn set_str(&mut self, key: &str, value: &str) -> Result<(), StorageError> {
        self.set(key, value.as_bytes())
    }
}

impl<T: StoreHandle + ?Sized> StoreHandleExt for T {}

fn decode_error(key: &str, reason: &str) -> StorageError {
    StorageError::Decode {
        key: key.to_string(),
        reason: reason.to_string(),
    }
}

pub fn erase_namespace(store: &dyn ConfigStore, namespace: &str) -> Result<(), StorageError> {
    let mut handle = store.open(namespace, OpenMode::ReadWrite)?;
    handle.erase_all()?;
    handle.commit()
}

type Namespaces = BTreeMap<String, BTreeMap<String, Vec<u8>>>;

#[derive(Debug, Default)]
struct MemoryInner {
    namespaces: Namespaces,
    fail_open: bool,
    fail_commit: bool,
    commits: usize,
}

/// RAM-backed [`ConfigStore`]. Clones share contents.
#[derive(Debug, Clone, Default)]
pub struct MemoryStore {
    inner: Arc<Mutex<MemoryInner>>,
}

impl MemoryStore {
    pub fn new() -> Self {
        Self::default()
    }

    fn lock(&self) -> MutexGuard<'_, MemoryInner> {
        self.inner.lock().unwrap_or_else(PoisonError::into_inner)
    }

    pub fn set_fail_open(&self, fail: bool) {
        self.lock().fail_open = fail;
    }

    pub fn set_fail_commit(&self, fail: bool) {
        self.lock().fail_commit = fail;
    }

    pub fn commits(&self) -> usize {
        self.lock().commits
    }

    pub fn raw(&self, namespace: &str, key: &str) -> Option<Vec<u8>> {
        self.lock()
            .namespaces
            .get(namespace)
            .and_then(|entries| entries.get(key))
            .cloned()
    }

    pub fn insert_raw(&self, namespace: &str, key: &str, value: &[u8]) {
        self.lock()
            .namespaces
            .entry(namespace.to_string())
            .or_default()
            .insert(key.to_string(), value.to_vec());
    }

    pub fn is_namespace_empty(&self, namespace: &str) -> bool {
        self.lock()
            .namespaces
            .get(namespace)
            .map_or(true, BTreeMap::is_empty)
    }
}

impl ConfigStore for MemoryStore {
    fn open(
        &self,
        namespace: &str,
        mode: OpenMode,
    ) -> Result<Box<dyn StoreHandle + '_>, StorageError> {
        if self.lock().fail_open {
            return Err(StorageError::Open {
                namespace: namespace.to_string(),
                reason: "injected failure".to_string(),
            });
        }

        Ok(Box::new(MemoryHandle {
            store: self,
            namespace: namespace.to_string(),
            mode,
            staged: BTreeMap::new(),
            cleared: false,
        }))
    }
}

struct MemoryHandle<'a> {
    store: &'a MemoryStore,
    namespace: String,
    mode: OpenMode,
    staged: BTreeMap<String, Option<Vec<u8>>>,
    cleared: bool,
}

impl MemoryHandle<'_> {
    fn ensure_writable(&self) -> Result<(), StorageError> {
        match self.mode {
            OpenMode::ReadWrite => Ok(()),
            OpenMode::ReadOnly => Err(StorageError::ReadOnly(self.namespace.clone())),
        }
    }
}

impl StoreHandle for MemoryHandle<'_> {
    fn get(&self, key: &str) -> Result<Option<Vec<u8>>, StorageError> {
        if let Some(staged) = self.staged.get(key) {
            return Ok(staged.clone());
        }
        if self.cleared {
            return Ok(None);
        }
        Ok(self.store.raw(&self.namespace, key))
    }

    fn set(&mut self, key: &str, value: &[u8]) -> Result<(), StorageError> {
        self.ensure_writable()?;
        self.staged.insert(key.to_string(), Some(value.to_vec()));
        Ok(())
    }

    fn erase_key(&mut self, key: &str) -> Result<(), StorageError> {
        self.ensure_writable()?;
        self.staged.insert(key.to_string(), None);
        Ok(())
    }

    fn erase_all(&mut self) -> Result<(), StorageError> {
        self.ensure_writable()?;
        self.staged.clear();
        self.cleared = true;
        Ok(())
    }

    fn commit(&mut self) -> Result<(), StorageError> {
        let mut inner = self.store.lock();
        if inner.fail_commit {
            return Err(StorageError::Commit("injected failure".to_string()));
        }

        let entries = inner.namespaces.entry(self.namespace.clone()).or_default();
        if self.cleared {
            entries.clear();
        }
        for (key, value) in std::mem::take(&mut self.staged) {
            match value {
                Some(value) => {
                    entries.insert(key, value);
                }
                None => {
                    entries.remove(&key);
                }
            }
        }
        self.cleared = false;
        inner.commits += 1;
        Ok(())
    }
}
