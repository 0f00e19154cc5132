pub mod config;
pub mod error;
pub mod factory_reset;
pub mod form;
pub mod html;
pub mod http;
pub mod keys;
pub mod manager;
pub mod pipeline;
pub mod platform;
pub mod records;
pub mod release;
pub mod restart_counter;
pub mod slot;
pub mod store;
pub mod topics;
pub mod verify;
pub mod version;
pub mod worker;

#[cfg(test)]
mod testing;

pub use config::{
    FactoryResetConfig, HttpClientConfig, LifecycleConfig, PipelineConfig, ReleaseFeedConfig,
    RestartCounterConfig, SignatureScheme,
};
pub use error::{
    IntegrityError, LifecycleError, LifecycleResult, ProtocolError, StateError, StorageError,
    TransportError,
};
pub use http::{HttpResponse, HttpTransport};
pub use manager::{LifecycleManager, LifecycleStatus, UpdateCheck, UpdateRequest};
pub use pipeline::{InstalledImage, UpdatePhase, UpdateStatus};
pub use platform::{Platform, ResetReason};
pub use records::{FirmwareConfig, InstalledVersionRecord};
pub use restart_counter::{spawn_decay_timer, BootDecision, DecayTimer};
pub use slot::{MemorySlotStore, Slot, SlotKind, SlotMetadata, SlotStore};
pub use store::{ConfigStore, MemoryStore, OpenMode, StoreHandle, StoreHandleExt};
pub use topics::*;
pub use version::Version;
pub use worker::{spawn_worker, LifecycleEvent, LifecycleHandle, SubmitResult};
