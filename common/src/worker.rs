use std::{
    io,
    sync::{
        atomic::{AtomicBool, Ordering},
        mpsc::{self, Receiver, Sender},
        Arc, Mutex, PoisonError,
    },
    thread::{self, JoinHandle},
};

use log::{info, warn};
use serde::Serialize;

use crate::{
    http::HttpTransport,
    manager::{LifecycleManager, LifecycleStatus, UpdateCheck, UpdateRequest},
    pipeline::{lock_status, SharedStatus},
    platform::Platform,
    slot::SlotStore,
    store::ConfigStore,
};

const WORKER_STACK_BYTES: usize = 16 * 1024;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum LifecycleEvent {
    NetworkReady,
    CheckForUpdate,
    RequestUpdate,
    CancelUpdateIntent,
    FactoryReset,
    Shutdown,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum SubmitResult {
    Accepted,
    AlreadyRunning,
    /// Runs once the update in progress has finished.
    Deferred,
    Stopped,
}

/// Cloneable front of the lifecycle worker. All downloads and flash writes
/// happen on the worker thread.
#[derive(Clone)]
pub struct LifecycleHandle {
    tx: Sender<LifecycleEvent>,
    busy: Arc<AtomicBool>,
    deferred_reset: Arc<AtomicBool>,
    update: SharedStatus,
    snapshot: Arc<Mutex<LifecycleStatus>>,
}

impl LifecycleHandle {
    pub fn network_ready(&self) -> SubmitResult {
        self.submit_update(LifecycleEvent::NetworkReady)
    }

    pub fn check_for_update(&self) -> SubmitResult {
        self.submit_update(LifecycleEvent::CheckForUpdate)
    }

    pub fn request_update(&self) -> SubmitResult {
        self.submit_update(LifecycleEvent::RequestUpdate)
    }

    pub fn cancel_update_intent(&self) -> SubmitResult {
        self.send(LifecycleEvent::CancelUpdateIntent)
    }

    pub fn factory_reset(&self) -> SubmitResult {
        // Flag first: a finishing update clears busy before it checks the flag.
        self.deferred_reset.store(true, Ordering::SeqCst);
        if self.busy.load(Ordering::SeqCst) {
            info!("factory reset queued behind the running update");
            return SubmitResult::Deferred;
        }
        if !self.deferred_reset.swap(false, Ordering::SeqCst) {
            // The worker picked the flag up in between.
            return SubmitResult::Deferred;
        }
        self.send(LifecycleEvent::FactoryReset)
    }

    pub fn shutdown(&self) -> SubmitResult {
        self.send(LifecycleEvent::Shutdown)
    }

    pub fn is_busy(&self) -> bool {
        self.busy.load(Ordering::SeqCst)
    }

    pub fn status(&self) -> LifecycleStatus {
        let mut status = self
            .snapshot
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .clone();
        status.update = lock_status(&self.update).clone();
        status
    }

    fn submit_update(&self, event: LifecycleEvent) -> SubmitResult {
        if self.busy.swap(true, Ordering::SeqCst) {
            return SubmitResult::AlreadyRunning;
        }
        let result = self.send(event);
        if result == SubmitResult::Stopped {
            self.busy.store(false, Ordering::SeqCst);
        }
        result
    }

    fn send(&self, event: LifecycleEvent) -> SubmitResult {
        match self.tx.send(event) {
            Ok(()) => SubmitResult::Accepted,
            Err(_) => {
                warn!("lifecycle worker stopped, dropping {event:?}");
                SubmitResult::Stopped
            }
        }
    }
}

pub struct Worker<C, S, T, P> {
    manager: LifecycleManager<C, S, T, P>,
    rx: Receiver<LifecycleEvent>,
    busy: Arc<AtomicBool>,
    deferred_reset: Arc<AtomicBool>,
    snapshot: Arc<Mutex<LifecycleStatus>>,
}

/// Pairs a handle with the worker that serves it, without starting a thread.
pub fn channel<C, S, T, P>(
    manager: LifecycleManager<C, S, T, P>,
) -> (LifecycleHandle, Worker<C, S, T, P>)
where
    C: ConfigStore,
    S: SlotStore,
    T: HttpTransport,
    P: Platform,
{
    let (tx, rx) = mpsc::channel();
    let busy = Arc::new(AtomicBool::new(false));
    let deferred_reset = manager.deferred_reset_flag();
    let snapshot = Arc::new(Mutex::new(manager.status()));

    let handle = LifecycleHandle {
        tx,
        busy: busy.clone(),
        deferred_reset: deferred_reset.clone(),
        update: manager.status_handle(),
        snapshot: snapshot.clone(),
    };
    let worker = Worker {
        manager,
        rx,
        busy,
        deferred_reset,
        snapshot,
    };
    (handle, worker)
}

pub fn spawn_worker<C, S, T, P>(
    manager: LifecycleManager<C, S, T, P>,
) -> io::Result<(LifecycleHandle, JoinHandle<()>)>
where
    C: ConfigStore + 'static,
    S: SlotStore + 'static,
    T: HttpTransport + 'static,
    P: Platform + 'static,
{
    let (handle, worker) = channel(manager);
    let join = thread::Builder::new()
        .name("lcm-worker".to_string())
        .stack_size(WORKER_STACK_BYTES)
        .spawn(move || worker.run())?;
    Ok((handle, join))
}

impl<C, S, T, P> Worker<C, S, T, P>
where
    C: ConfigStore,
    S: SlotStore,
    T: HttpTransport,
    P: Platform,
{
    pub fn run(mut self) {
        info!("lifecycle worker started");
        while let Ok(event) = self.rx.recv() {
            if !self.handle(event) {
                break;
            }
        }
        info!("lifecycle worker stopped");
    }

    /// Handles whatever is queued and returns.
    #[cfg(test)]
    pub(crate) fn drain(&mut self) {
        while let Ok(event) = self.rx.try_recv() {
            if !self.handle(event) {
                break;
            }
        }
    }

    fn handle(&mut self, event: LifecycleEvent) -> bool {
        match event {
            LifecycleEvent::NetworkReady | LifecycleEvent::CheckForUpdate => {
                if let Ok(check) = self.manager.check_for_update() {
                    log_check(&check);
                }
                self.finish_update();
            }
            LifecycleEvent::RequestUpdate => {
                match self.manager.request_update() {
                    Ok(UpdateRequest::RebootingToFactory) => {}
                    Ok(UpdateRequest::Checked(check)) => log_check(&check),
                    Err(err) => warn!("update request failed: {err}"),
                }
                self.finish_update();
            }
            LifecycleEvent::CancelUpdateIntent => {
                if let Err(err) = self.manager.cancel_update_intent() {
                    warn!("could not clear update intent: {err}");
                }
            }
            LifecycleEvent::FactoryReset => {
                self.manager.factory_reset();
            }
            LifecycleEvent::Shutdown => return false,
        }

        *self
            .snapshot
            .lock()
            .unwrap_or_else(PoisonError::into_inner) = self.manager.status();
        true
    }

    fn finish_update(&mut self) {
        self.busy.store(false, Ordering::SeqCst);
        // A successful update already ran the deferred reset.
        if self.deferred_reset.swap(false, Ordering::SeqCst) {
            info!("running factory reset deferred by the update");
            self.manager.factory_reset();
        }
    }

    pub fn manager(&self) -> &LifecycleManager<C, S, T, P> {
        &self.manager
    }
}

fn log_check(check: &UpdateCheck) {
    match check {
        UpdateCheck::NotConfigured => info!("update check: no repository configured"),
        UpdateCheck::UpToDate { current, candidate } => {
            info!("update check: {current} is current (newest {candidate})")
        }
        UpdateCheck::Installed(image) => {
            info!("update check: installed {} into {}", image.version, image.slot_label)
        }
    }
}
