use std::sync::{
    atomic::{AtomicBool, Ordering},
    Arc, Mutex,
};

use ed25519_dalek::VerifyingKey;
use log::{error, info, warn};
use serde::Serialize;

use crate::{
    config::{LifecycleConfig, SignatureScheme},
    error::LifecycleResult,
    factory_reset::{execute_factory_reset, resume_pending_erase, FactoryResetReport},
    http::HttpTransport,
    pipeline::{lock_status, ImagePipeline, InstalledImage, SharedStatus, UpdateStatus},
    platform::Platform,
    records::{FirmwareConfig, InstalledVersionRecord, UpdateIntent},
    release::{ReleaseResolver, ResolvedRelease},
    restart_counter::{lock_counter, BootDecision, DecayTimer, RestartCounter, SharedCounter},
    slot::SlotStore,
    store::ConfigStore,
    verify::parse_public_key,
    version::{evaluate_update, Version},
};

const COUNTDOWN_TICK_MS: u64 = 1_000;

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(tag = "result", rename_all = "snake_case")]
pub enum UpdateCheck {
    NotConfigured,
    UpToDate { current: String, candidate: String },
    Installed(InstalledImage),
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum UpdateRequest {
    /// Intent stored and the factory image selected; the device restarts.
    RebootingToFactory,
    Checked(UpdateCheck),
}

#[derive(Debug, Clone, Default, Serialize)]
pub struct LifecycleStatus {
    pub firmware_version: String,
    pub installed_version: Option<String>,
    pub running_slot: Option<String>,
    pub restart_count: u32,
    pub update_intent: bool,
    pub repository: Option<String>,
    pub prefer_prerelease: bool,
    pub last_check: Option<String>,
    pub update: UpdateStatus,
}

pub struct LifecycleManager<C, S, T, P> {
    config: LifecycleConfig,
    store: C,
    slots: S,
    transport: T,
    platform: P,
    counter: SharedCounter,
    verifying_key: Option<VerifyingKey>,
    status: SharedStatus,
    deferred_reset: Arc<AtomicBool>,
    last_check: Option<String>,
}

impl<C, S, T, P> LifecycleManager<C, S, T, P>
where
    C: ConfigStore,
    S: SlotStore,
    T: HttpTransport,
    P: Platform,
{
    pub fn new(mut config: LifecycleConfig, store: C, slots: S, transport: T, platform: P) -> Self {
        config.sanitize();

        let verifying_key = match config.pipeline.scheme {
            SignatureScheme::Sha384Length => None,
            SignatureScheme::Ed25519 => match parse_public_key(&config.pipeline.public_key_hex) {
                Ok(key) => Some(key),
                Err(err) => {
                    error!("configured verifying key is unusable, every image will be refused: {err}");
                    None
                }
            },
        };

        Self {
            counter: Arc::new(Mutex::new(RestartCounter::new(
                config.restart_counter.clone(),
            ))),
            config,
            store,
            slots,
            transport,
            platform,
            verifying_key,
            status: SharedStatus::default(),
            deferred_reset: Arc::new(AtomicBool::new(false)),
            last_check: None,
        }
    }

    pub fn status_handle(&self) -> SharedStatus {
        self.status.clone()
    }

    /// Set while an update runs to have the factory reset follow it.
    pub fn deferred_reset_flag(&self) -> Arc<AtomicBool> {
        self.deferred_reset.clone()
    }

    pub fn config(&self) -> &LifecycleConfig {
        &self.config
    }

    pub fn store(&self) -> &C {
        &self.store
    }

    pub fn slots(&self) -> &S {
        &self.slots
    }

    pub fn platform(&self) -> &P {
        &self.platform
    }

    pub fn on_boot(&mut self) -> BootDecision {
        let reason = self.platform.reset_reason();
        info!(
            "boot: reset reason {}, firmware {}",
            reason.as_str(),
            self.platform.firmware_version()
        );

        // Counted before any slot erase so a power cut during it still counts.
        let decision =
            lock_counter(&self.counter).on_boot(&self.store, reason, self.platform.now_ms());

        let pending = resume_pending_erase(&self.store, &mut self.slots, &self.platform);
        info!("pending erase: {pending:?}");

        if decision == BootDecision::FactoryReset {
            for remaining in (1..=self.config.restart_counter.countdown_secs).rev() {
                warn!("Factory reset in {remaining}");
                self.platform.feed_watchdog();
                self.platform.sleep_ms(COUNTDOWN_TICK_MS);
            }
            self.factory_reset();
        }
        decision
    }

    pub fn restart_count(&self) -> u32 {
        lock_counter(&self.counter).count()
    }

    /// Timer over the same counter, to be run next to the worker with
    /// [`spawn_decay_timer`](crate::restart_counter::spawn_decay_timer).
    pub fn decay_timer(&self) -> DecayTimer<C>
    where
        C: Clone,
    {
        DecayTimer::new(self.store.clone(), self.counter.clone())
    }

    /// Resolve, compare and install. Safe to call on every network-ready
    /// event.
    pub fn check_for_update(&mut self) -> LifecycleResult<UpdateCheck> {
        let result = self.run_check();
        self.last_check = Some(match &result {
            Ok(UpdateCheck::NotConfigured) => "not configured".to_string(),
            Ok(UpdateCheck::UpToDate { current, candidate }) => {
                format!("up to date: running {current}, newest {candidate}")
            }
            Ok(UpdateCheck::Installed(image)) => format!("installed {}", image.version),
            Err(err) => format!("failed: {err}"),
        });
        if let Err(err) = &result {
            warn!("update check failed: {err}");
        }
        result
    }

    fn run_check(&mut self) -> LifecycleResult<UpdateCheck> {
        let firmware = FirmwareConfig::load(&self.store)?;
        if !firmware.is_configured() {
            info!("no release repository configured, skipping update check");
            return Ok(UpdateCheck::NotConfigured);
        }

        let release = ReleaseResolver::new(
            &self.transport,
            &self.config.release_feed,
            &self.config.http,
        )
        .resolve(&firmware.repository, firmware.prefer_prerelease)?;

        let current = self.current_version();
        let candidate = release.descriptor.tag.clone();
        if !evaluate_update(&current, &candidate) {
            info!("running {current}, newest release {candidate}: nothing to do");
            if UpdateIntent::is_set(&self.store).unwrap_or(false) {
                if let Err(err) = UpdateIntent::clear(&self.store) {
                    warn!("failed to clear update intent: {err}");
                }
            }
            return Ok(UpdateCheck::UpToDate { current, candidate });
        }

        info!("update available: {current} -> {candidate}");
        self.install(&release).map(UpdateCheck::Installed)
    }

    /// Version of the running image. The installed record wins when it was
    /// written for the slot that is running now.
    pub fn current_version(&self) -> String {
        let running = self.slots.running_slot().ok().map(|slot| slot.label);
        match InstalledVersionRecord::load(&self.store) {
            Ok(Some(record))
                if record.slot_label.is_none() || record.slot_label == running =>
            {
                record.version
            }
            Ok(_) => self.platform.firmware_version(),
            Err(err) => {
                warn!("could not read installed version: {err}");
                self.platform.firmware_version()
            }
        }
    }

    /// Installs `release` and restarts. Runs a deferred factory reset in
    /// place of the plain restart.
    pub fn install(&mut self, release: &ResolvedRelease) -> LifecycleResult<InstalledImage> {
        let version = release
            .descriptor
            .tag
            .parse::<Version>()
            .map(|version| version.to_string())
            .unwrap_or_else(|_| release.descriptor.tag.trim().to_string());

        let image = ImagePipeline {
            store: &self.store,
            slots: &mut self.slots,
            transport: &self.transport,
            platform: &self.platform,
            http: &self.config.http,
            config: &self.config.pipeline,
            verifying_key: self.verifying_key.as_ref(),
            status: &self.status,
        }
        .install(&release.image_url, &release.signature_url, &version)?;

        info!("installed {} into {}", image.version, image.slot_label);
        if self.deferred_reset.swap(false, Ordering::SeqCst) {
            info!("factory reset was requested during the update");
            self.factory_reset();
        } else {
            self.platform.restart();
        }
        Ok(image)
    }

    /// Stores the intent. With a factory image to fall back on the device
    /// reboots into it; otherwise the update runs from here.
    pub fn request_update(&mut self) -> LifecycleResult<UpdateRequest> {
        UpdateIntent::set(&self.store)?;

        let factory = self.slots.factory_slot()?;
        let running = self.slots.running_slot()?;
        if let Some(factory) = factory {
            if factory.label != running.label {
                info!("update requested, rebooting into {}", factory.label);
                self.slots.select_factory()?;
                if self.deferred_reset.swap(false, Ordering::SeqCst) {
                    info!("factory reset was requested during the update request");
                    self.factory_reset();
                } else {
                    self.platform.restart();
                }
                return Ok(UpdateRequest::RebootingToFactory);
            }
        }
        self.check_for_update().map(UpdateRequest::Checked)
    }

    pub fn cancel_update_intent(&mut self) -> LifecycleResult<()> {
        UpdateIntent::clear(&self.store)?;
        info!("update intent cleared");
        Ok(())
    }

    pub fn factory_reset(&mut self) -> FactoryResetReport {
        self.deferred_reset.store(false, Ordering::SeqCst);
        let mut counter = lock_counter(&self.counter);
        execute_factory_reset(
            &self.store,
            &mut self.slots,
            &self.platform,
            &mut counter,
            &self.config.factory_reset,
        )
    }

    pub fn status(&self) -> LifecycleStatus {
        let firmware = FirmwareConfig::load(&self.store).unwrap_or_default();
        LifecycleStatus {
            firmware_version: self.platform.firmware_version(),
            installed_version: InstalledVersionRecord::load(&self.store)
                .ok()
                .flatten()
                .map(|record| record.version),
            running_slot: self.slots.running_slot().ok().map(|slot| slot.label),
            restart_count: lock_counter(&self.counter).count(),
            update_intent: UpdateIntent::is_set(&self.store).unwrap_or(false),
            repository: firmware
                .is_configured()
                .then(|| firmware.repository.clone()),
            prefer_prerelease: firmware.prefer_prerelease,
            last_check: self.last_check.clone(),
            update: lock_status(&self.status).clone(),
        }
    }
}
