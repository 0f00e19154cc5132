use std::{
    io,
    sync::{Arc, Mutex, MutexGuard, PoisonError},
    thread::{self, JoinHandle},
    time::Duration,
};

use log::{error, info, warn};

use crate::{
    config::RestartCounterConfig,
    platform::ResetReason,
    records::RestartCounterRecord,
    store::ConfigStore,
};

const DECAY_POLL_MS: u64 = 100;
const DECAY_STACK_BYTES: usize = 8 * 1024;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum BootDecision {
    Continue,
    FactoryReset,
}

/// Counts consecutive abnormal power cycles. A boot that stays up for
/// `reset_timeout_ms` clears the count; reaching `threshold_min` asks for a
/// factory reset.
#[derive(Debug, Clone)]
pub struct RestartCounter {
    config: RestartCounterConfig,
    count: u32,
    decay_deadline_ms: Option<u64>,
}

impl RestartCounter {
    pub fn new(config: RestartCounterConfig) -> Self {
        Self {
            config,
            count: 0,
            decay_deadline_ms: None,
        }
    }

    pub fn count(&self) -> u32 {
        self.count
    }

    pub fn decay_deadline_ms(&self) -> Option<u64> {
        self.decay_deadline_ms
    }

    pub fn config(&self) -> &RestartCounterConfig {
        &self.config
    }

    pub fn on_boot(
        &mut self,
        store: &dyn ConfigStore,
        reason: ResetReason,
        now_ms: u64,
    ) -> BootDecision {
        let mut record = RestartCounterRecord::load(store).unwrap_or_else(|err| {
            error!("could not read restart counter, assuming 0: {err}");
            RestartCounterRecord::default()
        });

        if !reason.is_abnormal() {
            self.decay_deadline_ms = None;
            if record.count != 0 {
                info!(
                    "reset reason {} is not a power cycle, clearing restart count {}",
                    reason.as_str(),
                    record.count
                );
                self.persist(store, 0, record.last_timestamp);
            }
            self.count = 0;
            return BootDecision::Continue;
        }

        record.count = record.count.saturating_add(1).min(self.config.count_cap);
        record.last_timestamp = now_ms;
        self.persist(store, record.count, record.last_timestamp);
        self.count = record.count;
        info!(
            "restart count {}/{} after {}",
            self.count,
            self.config.threshold_min,
            reason.as_str()
        );

        if self.count >= self.config.threshold_min {
            warn!(
                "restart count {} reached threshold {}",
                self.count, self.config.threshold_min
            );
            self.decay_deadline_ms = None;
            return BootDecision::FactoryReset;
        }

        self.decay_deadline_ms = Some(now_ms.saturating_add(self.config.reset_timeout_ms));
        BootDecision::Continue
    }

    /// Returns true when the decay deadline passed and the count was cleared.
    pub fn tick(&mut self, store: &dyn ConfigStore, now_ms: u64) -> bool {
        match self.decay_deadline_ms {
            Some(deadline) if now_ms >= deadline => {
                info!("stable for {} ms, clearing restart count", self.config.reset_timeout_ms);
                self.reset(store);
                true
            }
            _ => false,
        }
    }

    pub fn reset(&mut self, store: &dyn ConfigStore) {
        self.decay_deadline_ms = None;
        self.count = 0;
        self.persist(store, 0, 0);
    }

    fn persist(&self, store: &dyn ConfigStore, count: u32, last_timestamp: u64) {
        let record = RestartCounterRecord {
            count,
            last_timestamp,
        };
        if let Err(err) = record.save(store) {
            error!("failed to persist restart count {count}: {err}");
        }
    }
}

/// Owned by the manager and the decay timer at once.
pub type SharedCounter = Arc<Mutex<RestartCounter>>;

pub fn lock_counter(counter: &SharedCounter) -> MutexGuard<'_, RestartCounter> {
    counter.lock().unwrap_or_else(PoisonError::into_inner)
}

/// Clears the restart count once the boot has been stable for
/// `reset_timeout_ms`, whatever the lifecycle worker is busy with.
pub struct DecayTimer<C> {
    store: C,
    counter: SharedCounter,
}

impl<C: ConfigStore> DecayTimer<C> {
    pub fn new(store: C, counter: SharedCounter) -> Self {
        Self { store, counter }
    }

    pub fn deadline_ms(&self) -> Option<u64> {
        lock_counter(&self.counter).decay_deadline_ms()
    }

    /// Returns true when this poll cleared the count.
    pub fn poll(&self, now_ms: u64) -> bool {
        lock_counter(&self.counter).tick(&self.store, now_ms)
    }
}

/// Runs `timer` on its own thread until the deadline has passed or was
/// dropped by a factory reset. Returns at once when no deadline is armed.
pub fn spawn_decay_timer<C, F>(timer: DecayTimer<C>, clock: F) -> io::Result<JoinHandle<()>>
where
    C: ConfigStore + 'static,
    F: Fn() -> u64 + Send + 'static,
{
    thread::Builder::new()
        .name("lcm-decay".to_string())
        .stack_size(DECAY_STACK_BYTES)
        .spawn(move || {
            while let Some(deadline) = timer.deadline_ms() {
                let now = clock();
                if now >= deadline {
                    timer.poll(now);
                    continue;
                }
                thread::sleep(Duration::from_millis((deadline - now).min(DECAY_POLL_MS)));
            }
        })
}
