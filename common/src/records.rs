use serde::{Deserialize, Serialize};

use crate::{
    error::StorageError,
    keys::{
        KEY_INSTALLED_SLOT, KEY_INSTALLED_VERSION, KEY_PENDING_ERASE, KEY_PRERELEASE,
        KEY_REPOSITORY, KEY_RESTART_COUNT, KEY_RESTART_TS, KEY_UPDATE_INTENT, NS_FIRMWARE,
        NS_LIFECYCLE, NS_UPDATE,
    },
    store::{ConfigStore, OpenMode, StoreHandleExt},
};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
pub struct RestartCounterRecord {
    pub count: u32,
    pub last_timestamp: u64,
}

impl RestartCounterRecord {
    pub fn load(store: &dyn ConfigStore) -> Result<Self, StorageError> {
        let handle = store.open(NS_LIFECYCLE, OpenMode::ReadOnly)?;
        Ok(Self {
            count: handle.get_u32(KEY_RESTART_COUNT)?.unwrap_or(0),
            last_timestamp: handle.get_u64(KEY_RESTART_TS)?.unwrap_or(0),
        })
    }

    pub fn save(&self, store: &dyn ConfigStore) -> Result<(), StorageError> {
        let mut handle = store.open(NS_LIFECYCLE, OpenMode::ReadWrite)?;
        handle.set_u32(KEY_RESTART_COUNT, self.count)?;
        handle.set_u64(KEY_RESTART_TS, self.last_timestamp)?;
        handle.commit()
    }
}

/// Which release feed to follow. Edited on the configuration page.
#[derive(Debug, Clone, PartialEq, Eq, Default, Serialize, Deserialize)]
pub struct FirmwareConfig {
    pub repository: String,
    pub prefer_prerelease: bool,
}

impl FirmwareConfig {
    pub fn load(store: &dyn ConfigStore) -> Result<Self, StorageError> {
        let handle = store.open(NS_FIRMWARE, OpenMode::ReadOnly)?;
        Ok(Self {
            repository: handle.get_str(KEY_REPOSITORY)?.unwrap_or_default(),
            prefer_prerelease: handle.get_bool(KEY_PRERELEASE)?.unwrap_or(false),
        })
    }

    pub fn save(&self, store: &dyn ConfigStore) -> Result<(), StorageError> {
        let mut handle = store.open(NS_FIRMWARE, OpenMode::ReadWrite)?;
        handle.set_str(KEY_REPOSITORY, self.repository.trim())?;
        handle.set_bool(KEY_PRERELEASE, self.prefer_prerelease)?;
        handle.commit()
    }

    pub fn is_configured(&self) -> bool {
        valid_repository(&self.repository)
    }
}

/// `owner/name` with no whitespace or further separators.
pub fn valid_repository(repository: &str) -> bool {
    let mut parts = repository.trim().split('/');
    let (Some(owner), Some(name), None) = (parts.next(), parts.next(), parts.next()) else {
        return false;
    };
    let ok = |part: &str| {
        !part.is_empty()
            && part
                .chars()
                .all(|c| c.is_ascii_alphanumeric() || matches!(c, '-' | '_' | '.'))
    };
    ok(owner) && ok(name)
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct InstalledVersionRecord {
    pub version: String,
    pub slot_label: Option<String>,
}

impl InstalledVersionRecord {
    pub fn load(store: &dyn ConfigStore) -> Result<Option<Self>, StorageError> {
        let handle = store.open(NS_FIRMWARE, OpenMode::ReadOnly)?;
        let Some(version) = handle.get_str(KEY_INSTALLED_VERSION)? else {
            return Ok(None);
        };
        Ok(Some(Self {
            version,
            slot_label: handle.get_str(KEY_INSTALLED_SLOT)?,
        }))
    }

    pub fn save(&self, store: &dyn ConfigStore) -> Result<(), StorageError> {
        let mut handle = store.open(NS_FIRMWARE, OpenMode::ReadWrite)?;
        handle.set_str(KEY_INSTALLED_VERSION, &self.version)?;
        match &self.slot_label {
            Some(label) => handle.set_str(KEY_INSTALLED_SLOT, label)?,
            None => handle.erase_key(KEY_INSTALLED_SLOT)?,
        }
        handle.commit()
    }

    /// Puts back whatever was stored before, including nothing.
    pub fn restore(previous: Option<&Self>, store: &dyn ConfigStore) -> Result<(), StorageError> {
        match previous {
            Some(record) => record.save(store),
            None => {
                let mut handle = store.open(NS_FIRMWARE, OpenMode::ReadWrite)?;
                handle.erase_key(KEY_INSTALLED_VERSION)?;
                handle.erase_key(KEY_INSTALLED_SLOT)?;
                handle.commit()
            }
        }
    }
}

pub struct UpdateIntent;

impl UpdateIntent {
    pub fn is_set(store: &dyn ConfigStore) -> Result<bool, StorageError> {
        let handle = store.open(NS_UPDATE, OpenMode::ReadOnly)?;
        Ok(handle.get_bool(KEY_UPDATE_INTENT)?.unwrap_or(false))
    }

    pub fn set(store: &dyn ConfigStore) -> Result<(), StorageError> {
        let mut handle = store.open(NS_UPDATE, OpenMode::ReadWrite)?;
        handle.set_bool(KEY_UPDATE_INTENT, true)?;
        handle.commit()
    }

    pub fn clear(store: &dyn ConfigStore) -> Result<(), StorageError> {
        let mut handle = store.open(NS_UPDATE, OpenMode::ReadWrite)?;
        handle.erase_key(KEY_UPDATE_INTENT)?;
        handle.commit()
    }
}

/// The running slot cannot be erased while it executes; this survives
/// the reboot so the erase completes afterwards.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct PendingErase {
    pub slot_label: String,
    #[serde(default)]
    pub attempts: u32,
}

impl PendingErase {
    pub fn load(store: &dyn ConfigStore) -> Result<Option<Self>, StorageError> {
        let handle = store.open(NS_UPDATE, OpenMode::ReadOnly)?;
        handle
            .get_str(KEY_PENDING_ERASE)?
            .map(|raw| {
                serde_json::from_str(&raw).map_err(|err| StorageError::Decode {
                    key: KEY_PENDING_ERASE.to_string(),
                    reason: err.to_string(),
                })
            })
            .transpose()
    }

    pub fn save(&self, store: &dyn ConfigStore) -> Result<(), StorageError> {
        let payload = serde_json::to_string(self).map_err(|err| StorageError::Write {
            key: KEY_PENDING_ERASE.to_string(),
            reason: err.to_string(),
        })?;
        let mut handle = store.open(NS_UPDATE, OpenMode::ReadWrite)?;
        handle.set_str(KEY_PENDING_ERASE, &payload)?;
        handle.commit()
    }

    pub fn clear(store: &dyn ConfigStore) -> Result<(), StorageError> {
        let mut handle = store.open(NS_UPDATE, OpenMode::ReadWrite)?;
        handle.erase_key(KEY_PENDING_ERASE)?;
        handle.commit()
    }
}

#[cfg(test)]
mod tests {
    use pretty_assertions::assert_eq;

    use super::*;
    use crate::store::MemoryStore;

    #[test]
    fn installed_version_survives_unrelated_writes() {
        let store = MemoryStore::new();
        let record = InstalledVersionRecord {
            version: "2.1.0".to_string(),
            slot_label: Some("ota_1".to_string()),
        };
        record.save(&store).unwrap();

        FirmwareConfig {
            repository: "acme/widget".to_string(),
            prefer_prerelease: true,
        }
        .save(&store)
        .unwrap();
        RestartCounterRecord {
            count: 4,
            last_timestamp: 99,
        }
        .save(&store)
        .unwrap();
        UpdateIntent::set(&store).unwrap();

        assert_eq!(InstalledVersionRecord::load(&store).unwrap(), Some(record));
    }

    #[test]
    fn missing_records_load_as_defaults() {
        let store = MemoryStore::new();
        assert_eq!(
            RestartCounterRecord::load(&store).unwrap(),
            RestartCounterRecord::default()
        );
        assert_eq!(FirmwareConfig::load(&store).unwrap(), FirmwareConfig::default());
        assert_eq!(InstalledVersionRecord::load(&store).unwrap(), None);
        assert!(!UpdateIntent::is_set(&store).unwrap());
        assert_eq!(PendingErase::load(&store).unwrap(), None);
    }

    #[test]
    fn restore_without_previous_record_erases_it() {
        let store = MemoryStore::new();
        InstalledVersionRecord {
            version: "1.0.0".to_string(),
            slot_label: None,
        }
        .save(&store)
        .unwrap();

        InstalledVersionRecord::restore(None, &store).unwrap();
        assert_eq!(InstalledVersionRecord::load(&store).unwrap(), None);
    }

    #[test]
    fn pending_erase_round_trips_through_json() {
        let store = MemoryStore::new();
        let pending = PendingErase {
            slot_label: "ota_0".to_string(),
            attempts: 2,
        };
        pending.save(&store).unwrap();
        assert_eq!(PendingErase::load(&store).unwrap(), Some(pending));

        PendingErase::clear(&store).unwrap();
        assert_eq!(PendingErase::load(&store).unwrap(), None);
    }

    #[test]
    fn repository_must_be_owner_and_name() {
        assert!(valid_repository("acme/widget-fw"));
        assert!(valid_repository(" acme/widget.fw "));
        assert!(!valid_repository(""));
        assert!(!valid_repository("acme"));
        assert!(!valid_repository("acme/"));
        assert!(!valid_repository("acme/widget/extra"));
        assert!(!valid_repository("ac me/widget"));
    }
}
