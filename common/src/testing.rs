//! Scripted collaborators shared by the unit tests.

use std::{
    collections::HashMap,
    fmt,
    sync::{
        atomic::{AtomicU64, AtomicUsize, Ordering},
        Arc, Mutex,
    },
};

use crate::{
    error::{StorageError, TransportError},
    http::{Headers, HttpResponse, HttpTransport},
    platform::{Platform, ResetReason},
    records::RestartCounterRecord,
    slot::{MemorySlotStore, Slot, SlotMetadata, SlotStore},
    store::MemoryStore,
    verify::sha384,
};

pub fn sha384_artifact(image: &[u8]) -> Vec<u8> {
    let mut raw = sha384(image).to_vec();
    raw.extend_from_slice(&(image.len() as u32).to_be_bytes());
    raw
}

#[derive(Debug, Clone)]
pub struct ScriptedResponse {
    status: u16,
    headers: Vec<(String, String)>,
    body: Vec<u8>,
}

impl ScriptedResponse {
    pub fn ok(body: Vec<u8>) -> Self {
        Self {
            status: 200,
            headers: Vec::new(),
            body,
        }
    }

    pub fn json(body: &str) -> Self {
        Self::ok(body.as_bytes().to_vec()).with_header("Content-Type", "application/json")
    }

    pub fn status(status: u16) -> Self {
        Self {
            status,
            headers: Vec::new(),
            body: Vec::new(),
        }
    }

    pub fn redirect(location: &str) -> Self {
        Self::status(302).with_header("Location", location)
    }

    pub fn with_header(mut self, name: &str, value: &str) -> Self {
        self.headers.push((name.to_string(), value.to_string()));
        self
    }

    pub fn into_response(self) -> Box<dyn HttpResponse> {
        Box::new(ScriptedBody {
            response: self,
            pos: 0,
        })
    }
}

struct ScriptedBody {
    response: ScriptedResponse,
    pos: usize,
}

impl HttpResponse for ScriptedBody {
    fn status(&self) -> u16 {
        self.response.status
    }

    fn header(&self, name: &str) -> Option<String> {
        self.response
            .headers
            .iter()
            .find(|(key, _)| key.eq_ignore_ascii_case(name))
            .map(|(_, value)| value.clone())
    }

    fn read(&mut self, buf: &mut [u8]) -> Result<usize, TransportError> {
        // Short reads, like a socket.
        let remaining = &self.response.body[self.pos..];
        let take = remaining.len().min(buf.len()).min(1500);
        buf[..take].copy_from_slice(&remaining[..take]);
        self.pos += take;
        Ok(take)
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RecordedRequest {
    pub url: String,
    pub headers: Vec<(String, String)>,
}

#[derive(Clone)]
struct RequestHook(Arc<dyn Fn(&str) + Send + Sync>);

impl fmt::Debug for RequestHook {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str("RequestHook")
    }
}

#[derive(Debug, Default)]
struct TransportInner {
    routes: HashMap<String, ScriptedResponse>,
    requests: Vec<RecordedRequest>,
    hook: Option<RequestHook>,
}

/// Unrouted URLs fail like an unreachable host.
#[derive(Debug, Clone, Default)]
pub struct ScriptedTransport {
    inner: Arc<Mutex<TransportInner>>,
}

impl ScriptedTransport {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn route(&self, url: &str, response: ScriptedResponse) {
        self.inner
            .lock()
            .unwrap()
            .routes
            .insert(url.to_string(), response);
    }

    /// `start` redirects `hops` times before answering with `last`.
    pub fn redirect_chain(&self, start: &str, hops: usize, last: ScriptedResponse) {
        let mut current = start.to_string();
        for hop in 1..=hops {
            let next = format!("{start}/hop{hop}");
            self.route(&current, ScriptedResponse::redirect(&next));
            current = next;
        }
        self.route(&current, last);
    }

    /// Runs `hook` on the caller's thread before each request is answered.
    pub fn on_request(&self, hook: impl Fn(&str) + Send + Sync + 'static) {
        self.inner.lock().unwrap().hook = Some(RequestHook(Arc::new(hook)));
    }

    pub fn requests(&self) -> Vec<RecordedRequest> {
        self.inner.lock().unwrap().requests.clone()
    }

    pub fn request_urls(&self) -> Vec<String> {
        self.requests().into_iter().map(|r| r.url).collect()
    }
}

impl HttpTransport for ScriptedTransport {
    fn get(&self, url: &str, headers: &Headers<'_>) -> Result<Box<dyn HttpResponse>, TransportError> {
        let hook = self.inner.lock().unwrap().hook.clone();
        if let Some(RequestHook(hook)) = hook {
            (*hook)(url);
        }

        let mut inner = self.inner.lock().unwrap();
        inner.requests.push(RecordedRequest {
            url: url.to_string(),
            headers: headers
                .iter()
                .map(|(k, v)| (k.to_string(), v.to_string()))
                .collect(),
        });
        inner
            .routes
            .get(url)
            .cloned()
            .map(ScriptedResponse::into_response)
            .ok_or_else(|| TransportError::Connect {
                url: url.to_string(),
                reason: "no route".to_string(),
            })
    }
}

#[derive(Debug, Default)]
struct PlatformInner {
    indicator: Vec<bool>,
    log: Vec<String>,
    fail_network_restore: bool,
}

#[derive(Debug, Clone)]
pub struct RecordingPlatform {
    reason: Arc<Mutex<ResetReason>>,
    version: Arc<Mutex<String>>,
    now_ms: Arc<AtomicU64>,
    restarts: Arc<AtomicUsize>,
    feeds: Arc<AtomicUsize>,
    inner: Arc<Mutex<PlatformInner>>,
}

impl RecordingPlatform {
    pub fn new(reason: ResetReason, version: &str) -> Self {
        Self {
            reason: Arc::new(Mutex::new(reason)),
            version: Arc::new(Mutex::new(version.to_string())),
            now_ms: Arc::new(AtomicU64::new(0)),
            restarts: Arc::new(AtomicUsize::new(0)),
            feeds: Arc::new(AtomicUsize::new(0)),
            inner: Arc::new(Mutex::new(PlatformInner::default())),
        }
    }

    pub fn set_reason(&self, reason: ResetReason) {
        *self.reason.lock().unwrap() = reason;
    }

    pub fn advance(&self, ms: u64) {
        self.now_ms.fetch_add(ms, Ordering::SeqCst);
    }

    pub fn restarts(&self) -> usize {
        self.restarts.load(Ordering::SeqCst)
    }

    pub fn watchdog_feeds(&self) -> usize {
        self.feeds.load(Ordering::SeqCst)
    }

    pub fn indicator_history(&self) -> Vec<bool> {
        self.inner.lock().unwrap().indicator.clone()
    }

    /// Ordered list of side effects other than watchdog feeds and sleeps.
    pub fn log(&self) -> Vec<String> {
        self.inner.lock().unwrap().log.clone()
    }

    pub fn set_fail_network_restore(&self, fail: bool) {
        self.inner.lock().unwrap().fail_network_restore = fail;
    }

    fn record(&self, entry: &str) {
        self.inner.lock().unwrap().log.push(entry.to_string());
    }
}

impl Platform for RecordingPlatform {
    fn reset_reason(&self) -> ResetReason {
        *self.reason.lock().unwrap()
    }

    fn firmware_version(&self) -> String {
        self.version.lock().unwrap().clone()
    }

    fn now_ms(&self) -> u64 {
        self.now_ms.load(Ordering::SeqCst)
    }

    fn sleep_ms(&self, ms: u64) {
        self.advance(ms);
    }

    fn feed_watchdog(&self) {
        self.feeds.fetch_add(1, Ordering::SeqCst);
    }

    fn restart(&self) {
        self.restarts.fetch_add(1, Ordering::SeqCst);
        self.record("restart");
    }

    fn set_indicator(&self, active: bool) {
        self.inner.lock().unwrap().indicator.push(active);
    }

    fn restore_network_defaults(&self) -> Result<(), StorageError> {
        self.record("restore_network");
        if self.inner.lock().unwrap().fail_network_restore {
            return Err(StorageError::Commit("wifi restore failed".to_string()));
        }
        Ok(())
    }

    fn reset_accessory_state(&self) -> Result<(), StorageError> {
        self.record("reset_accessory");
        Ok(())
    }
}

/// Notes the persisted restart count whenever a slot is erased.
#[derive(Debug, Clone)]
pub struct EraseSpySlots {
    slots: MemorySlotStore,
    store: MemoryStore,
    counts: Arc<Mutex<Vec<u32>>>,
}

impl EraseSpySlots {
    pub fn new(slots: MemorySlotStore, store: MemoryStore) -> Self {
        Self {
            slots,
            store,
            counts: Arc::default(),
        }
    }

    pub fn counts_at_erase(&self) -> Vec<u32> {
        self.counts.lock().unwrap().clone()
    }
}

impl SlotStore for EraseSpySlots {
    fn running_slot(&self) -> Result<Slot, StorageError> {
        self.slots.running_slot()
    }

    fn app_slots(&self) -> Result<Vec<Slot>, StorageError> {
        self.slots.app_slots()
    }

    fn boot_slot(&self) -> Result<Option<Slot>, StorageError> {
        self.slots.boot_slot()
    }

    fn read(&self, slot: &Slot, offset: u64, buf: &mut [u8]) -> Result<(), StorageError> {
        self.slots.read(slot, offset, buf)
    }

    fn erase(&mut self, slot: &Slot, offset: u64, len: u64) -> Result<(), StorageError> {
        let count = RestartCounterRecord::load(&self.store)
            .map(|record| record.count)
            .unwrap_or(u32::MAX);
        self.counts.lock().unwrap().push(count);
        self.slots.erase(slot, offset, len)
    }

    fn write(&mut self, slot: &Slot, offset: u64, data: &[u8]) -> Result<(), StorageError> {
        self.slots.write(slot, offset, data)
    }

    fn metadata(&self, slot: &Slot) -> Result<Option<SlotMetadata>, StorageError> {
        self.slots.metadata(slot)
    }

    fn mark_bootable(&mut self, slot: &Slot) -> Result<(), StorageError> {
        self.slots.mark_bootable(slot)
    }

    fn select_factory(&mut self) -> Result<(), StorageError> {
        self.slots.select_factory()
    }

    fn erase_boot_selection(&mut self) -> Result<(), StorageError> {
        self.slots.erase_boot_selection()
    }
}
