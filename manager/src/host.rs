use std::{
    collections::BTreeMap,
    fs::{self, File, OpenOptions},
    io::{ErrorKind, Read, Seek, SeekFrom, Write},
    net::SocketAddr,
    path::{Path, PathBuf},
    sync::{Arc, Mutex, MutexGuard, OnceLock, PoisonError},
    time::{Duration, Instant},
};

use anyhow::Context;
use axum::{
    extract::State,
    http::StatusCode,
    response::{Html, IntoResponse},
    routing::{get, post},
    Json, Router,
};
use rumqttc::{AsyncClient, Event, Incoming, MqttOptions, QoS};
use serde::{Deserialize, Serialize};
use tokio::net::TcpListener;
use tracing::{info, warn};

use lifecycle_common::{
    form, html,
    keys::MAX_KEY_LEN,
    records::valid_repository,
    spawn_decay_timer, spawn_worker,
    BootDecision, ConfigStore, FirmwareConfig, HttpClientConfig, HttpResponse, HttpTransport,
    LifecycleConfig, LifecycleHandle, LifecycleManager, LifecycleStatus, OpenMode, Platform,
    ResetReason, Slot, SlotKind, SlotMetadata, SlotStore, StorageError, StoreHandle,
    SubmitResult, TransportError, TOPIC_CMD_CANCEL_UPDATE, TOPIC_CMD_CHECK,
    TOPIC_CMD_FACTORY_RESET, TOPIC_CMD_UPDATE, TOPIC_LIFECYCLE_EVENT, TOPIC_LIFECYCLE_STATE,
};

const MAX_MQTT_PAYLOAD_BYTES: usize = 512;
const DEFAULT_SLOT_SIZE: u64 = 1_536 * 1024;
const OTA_SLOT_COUNT: u8 = 2;
const ERASE_BLOCK: usize = 4096;
const FACTORY_RESET_CONFIRMATION: &str = "confirm";

#[derive(Clone)]
struct AppState {
    lifecycle: LifecycleHandle,
    mqtt: AsyncClient,
    store: FileConfigStore,
}

#[derive(Debug, Serialize)]
struct ErrorBody {
    error: String,
}

#[derive(Debug, Serialize)]
struct SubmitBody {
    result: SubmitResult,
}

#[derive(Debug, Serialize)]
struct CommandEvent<'a> {
    command: &'a str,
    result: SubmitResult,
}

#[derive(Debug, Serialize)]
struct FirmwareConfigView {
    repository: String,
    #[serde(rename = "preferPrerelease")]
    prefer_prerelease: bool,
    configured: bool,
}

#[derive(Debug, Deserialize)]
struct FirmwareConfigUpdate {
    repository: String,
    #[serde(rename = "preferPrerelease", default)]
    prefer_prerelease: bool,
}

pub async fn run() -> anyhow::Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(tracing_subscriber::EnvFilter::from_default_env())
        .init();

    let data_dir = std::env::var("LCM_DATA_DIR")
        .map(PathBuf::from)
        .unwrap_or_else(|_| PathBuf::from("./.lifecycle"));
    let config = load_lifecycle_config(&data_dir.join("config.json"))
        .await
        .unwrap_or_else(|err| {
            warn!("failed to load lifecycle config: {err:#}");
            LifecycleConfig::default()
        });

    let store = FileConfigStore::new(data_dir.join("nvs"));
    seed_firmware_config(&store).context("failed to seed firmware config from environment")?;

    let lifecycle = {
        let store = store.clone();
        let slot_dir = data_dir.join("slots");
        tokio::task::spawn_blocking(move || boot_lifecycle(config, store, slot_dir))
            .await
            .context("lifecycle boot task panicked")??
    };

    let mqtt_host = std::env::var("MQTT_HOST").unwrap_or_else(|_| "localhost".to_string());
    let mqtt_port = std::env::var("MQTT_PORT")
        .ok()
        .and_then(|value| value.parse::<u16>().ok())
        .unwrap_or(1883);

    let mut mqtt_options = MqttOptions::new("lifecycle-manager-host", mqtt_host, mqtt_port);
    let mqtt_user = std::env::var("MQTT_USER").unwrap_or_default();
    let mqtt_pass = std::env::var("MQTT_PASS").unwrap_or_default();
    if !mqtt_user.is_empty() {
        mqtt_options.set_credentials(mqtt_user, mqtt_pass);
    }

    let (mqtt, eventloop) = AsyncClient::new(mqtt_options, 64);

    let app_state = AppState {
        lifecycle,
        mqtt,
        store,
    };

    subscribe_topics(&app_state.mqtt).await?;
    spawn_mqtt_loop(app_state.clone(), eventloop);
    spawn_state_publish_loop(app_state.clone());

    let app = Router::new()
        .route("/api/status", get(handle_get_status))
        .route("/api/update/check", post(handle_update_check))
        .route("/api/update/request", post(handle_update_request))
        .route("/api/update/cancel", post(handle_update_cancel))
        .route("/api/factory-reset", post(handle_factory_reset))
        .route(
            "/api/firmware-config",
            get(handle_get_firmware_config).put(handle_put_firmware_config),
        )
        .route("/config", get(handle_get_config_page).post(handle_post_config_page))
        .with_state(app_state.clone());

    let port = std::env::var("LCM_HTTP_PORT")
        .ok()
        .and_then(|value| value.parse::<u16>().ok())
        .unwrap_or(8080);
    let addr = SocketAddr::from(([0, 0, 0, 0], port));
    let listener = TcpListener::bind(addr)
        .await
        .with_context(|| format!("failed to bind lifecycle server at {addr}"))?;

    info!("lifecycle manager listening on http://{addr}");
    // The host network is up as soon as we can serve.
    info!("network ready: {:?}", app_state.lifecycle.network_ready());

    axum::serve(listener, app).await?;
    Ok(())
}

fn boot_lifecycle(
    config: LifecycleConfig,
    store: FileConfigStore,
    slot_dir: PathBuf,
) -> anyhow::Result<LifecycleHandle> {
    let slot_size = std::env::var("LCM_SLOT_SIZE")
        .ok()
        .and_then(|value| value.parse::<u64>().ok())
        .unwrap_or(DEFAULT_SLOT_SIZE);
    let slots = FileSlotStore::open(slot_dir, slot_size).context("failed to open slot images")?;
    let transport = ReqwestTransport::new(&config.http).context("failed to build http client")?;
    let platform = HostPlatform::from_env();

    let mut manager = LifecycleManager::new(config, store, slots, transport, platform);
    if manager.on_boot() == BootDecision::FactoryReset {
        warn!("factory reset ran during boot");
    }
    // Runs apart from the worker so a long download cannot hold the count.
    spawn_decay_timer(manager.decay_timer(), monotonic_ms)
        .context("failed to spawn restart counter timer")?;

    let (handle, _worker) = spawn_worker(manager).context("failed to spawn lifecycle worker")?;
    Ok(handle)
}

fn seed_firmware_config(store: &FileConfigStore) -> anyhow::Result<()> {
    let Ok(repository) = std::env::var("LCM_REPOSITORY") else {
        return Ok(());
    };
    let prefer_prerelease = std::env::var("LCM_PRERELEASE")
        .map(|value| matches!(value.trim(), "1" | "true" | "yes" | "on"))
        .unwrap_or(false);
    if !valid_repository(&repository) {
        warn!("ignoring LCM_REPOSITORY `{repository}`: expected owner/name");
        return Ok(());
    }

    FirmwareConfig {
        repository,
        prefer_prerelease,
    }
    .save(store)?;
    Ok(())
}

async fn load_lifecycle_config(path: &Path) -> anyhow::Result<LifecycleConfig> {
    match tokio::fs::read(path).await {
        Ok(raw) => Ok(serde_json::from_slice::<LifecycleConfig>(&raw)?),
        Err(err) if err.kind() == ErrorKind::NotFound => Ok(LifecycleConfig::default()),
        Err(err) => Err(err.into()),
    }
}

async fn subscribe_topics(mqtt: &AsyncClient) -> anyhow::Result<()> {
    let topics = [
        TOPIC_CMD_CHECK,
        TOPIC_CMD_UPDATE,
        TOPIC_CMD_CANCEL_UPDATE,
        TOPIC_CMD_FACTORY_RESET,
    ];

    for topic in topics {
        mqtt.subscribe(topic, QoS::AtMostOnce).await?;
    }
    Ok(())
}

fn spawn_mqtt_loop(app_state: AppState, mut eventloop: rumqttc::EventLoop) {
    tokio::spawn(async move {
        loop {
            match eventloop.poll().await {
                Ok(Event::Incoming(Incoming::Publish(message))) => {
                    if let Err(err) =
                        handle_mqtt_message(&app_state, &message.topic, message.payload.to_vec())
                            .await
                    {
                        warn!("mqtt message handling error: {err:#}");
                    }
                }
                Ok(Event::Incoming(Incoming::ConnAck(_))) => {
                    info!("mqtt connected");
                }
                Ok(_) => {}
                Err(err) => {
                    warn!("mqtt poll error: {err}");
                    tokio::time::sleep(Duration::from_secs(2)).await;
                }
            }
        }
    });
}

fn spawn_state_publish_loop(app_state: AppState) {
    tokio::spawn(async move {
        let mut interval = tokio::time::interval(Duration::from_secs(10));
        loop {
            interval.tick().await;

            match serde_json::to_vec(&app_state.lifecycle.status()) {
                Ok(body) => {
                    if let Err(err) = app_state
                        .mqtt
                        .publish(TOPIC_LIFECYCLE_STATE, QoS::AtLeastOnce, true, body)
                        .await
                    {
                        warn!("lifecycle state publish failed: {err}");
                    }
                }
                Err(err) => warn!("lifecycle state serialization failed: {err}"),
            }
        }
    });
}

async fn handle_mqtt_message(
    app_state: &AppState,
    topic: &str,
    payload: Vec<u8>,
) -> anyhow::Result<()> {
    if payload.len() > MAX_MQTT_PAYLOAD_BYTES {
        warn!(
            "dropping oversized MQTT payload on topic {} ({} bytes)",
            topic,
            payload.len()
        );
        return Ok(());
    }

    let message = String::from_utf8(payload).context("non utf8 mqtt payload")?;
    let lifecycle = &app_state.lifecycle;

    let (command, result) = match topic {
        TOPIC_CMD_CHECK => ("check", lifecycle.check_for_update()),
        TOPIC_CMD_UPDATE => ("update", lifecycle.request_update()),
        TOPIC_CMD_CANCEL_UPDATE => ("cancel_update", lifecycle.cancel_update_intent()),
        TOPIC_CMD_FACTORY_RESET => {
            if !message.trim().eq_ignore_ascii_case(FACTORY_RESET_CONFIRMATION) {
                warn!("factory reset over mqtt needs payload `{FACTORY_RESET_CONFIRMATION}`");
                return Ok(());
            }
            ("factory_reset", lifecycle.factory_reset())
        }
        _ => return Ok(()),
    };

    info!("mqtt command {command}: {result:?}");
    let body = serde_json::to_vec(&CommandEvent { command, result })?;
    app_state
        .mqtt
        .publish(TOPIC_LIFECYCLE_EVENT, QoS::AtLeastOnce, false, body)
        .await?;
    Ok(())
}

async fn handle_get_status(State(state): State<AppState>) -> impl IntoResponse {
    Json(state.lifecycle.status())
}

async fn handle_update_check(State(state): State<AppState>) -> impl IntoResponse {
    submit_response(state.lifecycle.check_for_update())
}

async fn handle_update_request(State(state): State<AppState>) -> impl IntoResponse {
    submit_response(state.lifecycle.request_update())
}

async fn handle_update_cancel(State(state): State<AppState>) -> impl IntoResponse {
    submit_response(state.lifecycle.cancel_update_intent())
}

async fn handle_factory_reset(State(state): State<AppState>) -> impl IntoResponse {
    submit_response(state.lifecycle.factory_reset())
}

async fn handle_get_firmware_config(State(state): State<AppState>) -> impl IntoResponse {
    match with_store(&state.store, |store| FirmwareConfig::load(store)).await {
        Ok(config) => Json(firmware_config_view(&config)).into_response(),
        Err(err) => {
            warn!("failed to load firmware config: {err:#}");
            error_response(
                StatusCode::INTERNAL_SERVER_ERROR,
                "Failed to load firmware config",
            )
        }
    }
}

async fn handle_put_firmware_config(
    State(state): State<AppState>,
    Json(update): Json<FirmwareConfigUpdate>,
) -> impl IntoResponse {
    let repository = update.repository.trim().to_string();
    if !repository.is_empty() && !valid_repository(&repository) {
        return error_response(
            StatusCode::BAD_REQUEST,
            "repository must look like owner/name",
        );
    }

    let config = FirmwareConfig {
        repository,
        prefer_prerelease: update.prefer_prerelease,
    };
    let saved = config.clone();
    match with_store(&state.store, move |store| saved.save(store)).await {
        Ok(()) => Json(firmware_config_view(&config)).into_response(),
        Err(err) => {
            warn!("failed to persist firmware config: {err:#}");
            error_response(
                StatusCode::INTERNAL_SERVER_ERROR,
                "Failed to persist firmware config",
            )
        }
    }
}

async fn handle_get_config_page(State(state): State<AppState>) -> impl IntoResponse {
    let config = with_store(&state.store, |store| FirmwareConfig::load(store))
        .await
        .unwrap_or_default();
    Html(render_config_page(&config, &state.lifecycle.status(), None))
}

async fn handle_post_config_page(State(state): State<AppState>, body: String) -> impl IntoResponse {
    let fields = form::parse(&body);
    let repository = form::value(&fields, "repo").unwrap_or("").trim().to_string();
    let config = FirmwareConfig {
        repository,
        prefer_prerelease: form::find(&fields, "pre").is_some(),
    };

    if !config.repository.is_empty() && !valid_repository(&config.repository) {
        let page = render_config_page(
            &config,
            &state.lifecycle.status(),
            Some("Repository must look like owner/name."),
        );
        return (StatusCode::BAD_REQUEST, Html(page)).into_response();
    }

    let saved = config.clone();
    let message = match with_store(&state.store, move |store| saved.save(store)).await {
        Ok(()) => "Saved.",
        Err(err) => {
            warn!("failed to persist firmware config: {err:#}");
            "Saving failed."
        }
    };
    Html(render_config_page(&config, &state.lifecycle.status(), Some(message))).into_response()
}

fn render_config_page(
    config: &FirmwareConfig,
    status: &LifecycleStatus,
    message: Option<&str>,
) -> String {
    let checked = if config.prefer_prerelease { " checked" } else { "" };
    let notice = message
        .map(|text| format!("<p class=\"notice\">{}</p>", html::escape(text)))
        .unwrap_or_default();
    let installed = status.installed_version.as_deref().unwrap_or("-");
    let last_check = status.last_check.as_deref().unwrap_or("-");

    format!(
        r#"<!doctype html>
<html>
<head><meta charset="utf-8"><title>Firmware updates</title></head>
<body>
<h1>Firmware updates</h1>
{notice}
<p>Running {firmware} from {slot}, installed {installed}. Last check: {last_check}</p>
<form method="post" action="/config">
  <label>Repository <input name="repo" value="{repo}" placeholder="owner/name"></label>
  <label><input type="checkbox" name="pre"{checked}> Install pre-releases</label>
  <button type="submit">Save</button>
</form>
</body>
</html>
"#,
        firmware = html::escape(&status.firmware_version),
        slot = html::escape(status.running_slot.as_deref().unwrap_or("?")),
        installed = html::escape(installed),
        last_check = html::escape(last_check),
        repo = html::escape(&config.repository),
    )
}

fn firmware_config_view(config: &FirmwareConfig) -> FirmwareConfigView {
    FirmwareConfigView {
        repository: config.repository.clone(),
        prefer_prerelease: config.prefer_prerelease,
        configured: config.is_configured(),
    }
}

async fn with_store<R, F>(store: &FileConfigStore, op: F) -> anyhow::Result<R>
where
    R: Send + 'static,
    F: FnOnce(&FileConfigStore) -> Result<R, StorageError> + Send + 'static,
{
    let store = store.clone();
    Ok(tokio::task::spawn_blocking(move || op(&store)).await??)
}

fn submit_response(result: SubmitResult) -> axum::response::Response {
    let status = match result {
        SubmitResult::Accepted | SubmitResult::Deferred => StatusCode::ACCEPTED,
        SubmitResult::AlreadyRunning => StatusCode::CONFLICT,
        SubmitResult::Stopped => StatusCode::SERVICE_UNAVAILABLE,
    };
    (status, Json(SubmitBody { result })).into_response()
}

fn error_response(status: StatusCode, message: &str) -> axum::response::Response {
    (
        status,
        Json(ErrorBody {
            error: message.to_string(),
        }),
    )
        .into_response()
}

fn monotonic_ms() -> u64 {
    static START: OnceLock<Instant> = OnceLock::new();
    START
        .get_or_init(Instant::now)
        .elapsed()
        .as_millis()
        .try_into()
        .unwrap_or(u64::MAX)
}

/// One JSON file per namespace, values hex encoded.
#[derive(Clone)]
struct FileConfigStore {
    dir: Arc<PathBuf>,
    lock: Arc<Mutex<()>>,
}

type Entries = BTreeMap<String, Vec<u8>>;

impl FileConfigStore {
    fn new(dir: PathBuf) -> Self {
        Self {
            dir: Arc::new(dir),
            lock: Arc::new(Mutex::new(())),
        }
    }

    fn guard(&self) -> MutexGuard<'_, ()> {
        self.lock.lock().unwrap_or_else(PoisonError::into_inner)
    }

    fn path(&self, namespace: &str) -> PathBuf {
        self.dir.join(format!("{namespace}.json"))
    }

    fn read_entries(&self, namespace: &str) -> Result<Entries, StorageError> {
        let raw = match fs::read(self.path(namespace)) {
            Ok(raw) => raw,
            Err(err) if err.kind() == ErrorKind::NotFound => return Ok(Entries::new()),
            Err(err) => {
                return Err(StorageError::Open {
                    namespace: namespace.to_string(),
                    reason: err.to_string(),
                })
            }
        };

        let encoded: BTreeMap<String, String> =
            serde_json::from_slice(&raw).map_err(|err| StorageError::Open {
                namespace: namespace.to_string(),
                reason: err.to_string(),
            })?;
        encoded
            .into_iter()
            .map(|(key, value)| match hex::decode(&value) {
                Ok(bytes) => Ok((key, bytes)),
                Err(_) => Err(StorageError::Decode {
                    key,
                    reason: "not hex".to_string(),
                }),
            })
            .collect()
    }

    fn write_entries(&self, namespace: &str, entries: &Entries) -> Result<(), StorageError> {
        let encoded: BTreeMap<&str, String> = entries
            .iter()
            .map(|(key, value)| (key.as_str(), hex::encode(value)))
            .collect();
        let payload =
            serde_json::to_vec_pretty(&encoded).map_err(|err| commit_error(namespace, err))?;

        fs::create_dir_all(self.dir.as_path()).map_err(|err| commit_error(namespace, err))?;
        let path = self.path(namespace);
        let tmp = path.with_extension("json.tmp");
        fs::write(&tmp, payload).map_err(|err| commit_error(namespace, err))?;
        fs::rename(&tmp, &path).map_err(|err| commit_error(namespace, err))
    }
}

fn commit_error(namespace: &str, err: impl std::fmt::Display) -> StorageError {
    StorageError::Commit(format!("{namespace}: {err}"))
}

impl ConfigStore for FileConfigStore {
    fn open(
        &self,
        namespace: &str,
        mode: OpenMode,
    ) -> Result<Box<dyn StoreHandle + '_>, StorageError> {
        if namespace.is_empty() || namespace.len() > MAX_KEY_LEN {
            return Err(StorageError::Open {
                namespace: namespace.to_string(),
                reason: format!("namespace must be 1..={MAX_KEY_LEN} bytes"),
            });
        }
        Ok(Box::new(FileHandle {
            store: self,
            namespace: namespace.to_string(),
            mode,
            staged: BTreeMap::new(),
            cleared: false,
        }))
    }
}

struct FileHandle<'a> {
    store: &'a FileConfigStore,
    namespace: String,
    mode: OpenMode,
    staged: BTreeMap<String, Option<Vec<u8>>>,
    cleared: bool,
}

impl FileHandle<'_> {
    fn ensure_writable(&self, key: &str) -> Result<(), StorageError> {
        if self.mode == OpenMode::ReadOnly {
            return Err(StorageError::ReadOnly(self.namespace.clone()));
        }
        if key.len() > MAX_KEY_LEN {
            return Err(StorageError::Write {
                key: key.to_string(),
                reason: format!("keys are limited to {MAX_KEY_LEN} bytes"),
            });
        }
        Ok(())
    }
}

impl StoreHandle for FileHandle<'_> {
    fn get(&self, key: &str) -> Result<Option<Vec<u8>>, StorageError> {
        if let Some(staged) = self.staged.get(key) {
            return Ok(staged.clone());
        }
        if self.cleared {
            return Ok(None);
        }
        let _guard = self.store.guard();
        Ok(self.store.read_entries(&self.namespace)?.remove(key))
    }

    fn set(&mut self, key: &str, value: &[u8]) -> Result<(), StorageError> {
        self.ensure_writable(key)?;
        self.staged.insert(key.to_string(), Some(value.to_vec()));
        Ok(())
    }

    fn erase_key(&mut self, key: &str) -> Result<(), StorageError> {
        self.ensure_writable(key)?;
        self.staged.insert(key.to_string(), None);
        Ok(())
    }

    fn erase_all(&mut self) -> Result<(), StorageError> {
        self.ensure_writable("")?;
        self.staged.clear();
        self.cleared = true;
        Ok(())
    }

    fn commit(&mut self) -> Result<(), StorageError> {
        if self.staged.is_empty() && !self.cleared {
            return Ok(());
        }

        let _guard = self.store.guard();
        let mut entries = if self.cleared {
            Entries::new()
        } else {
            self.store.read_entries(&self.namespace)?
        };
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
        self.store.write_entries(&self.namespace, &entries)?;
        self.cleared = false;
        Ok(())
    }
}

#[derive(Debug, Default, Serialize, Deserialize)]
struct SlotState {
    boot: Option<String>,
    #[serde(default)]
    bootable: Vec<String>,
    #[serde(default)]
    image_len: BTreeMap<String, u64>,
}

/// Slot images as files plus a `slots.json` standing in for otadata. On
/// open the boot selection becomes the running slot, like a bootloader
/// falling back to the factory image.
struct FileSlotStore {
    dir: PathBuf,
    slots: Vec<Slot>,
    running: String,
    state: SlotState,
}

impl FileSlotStore {
    fn open(dir: PathBuf, slot_size: u64) -> anyhow::Result<Self> {
        fs::create_dir_all(&dir)?;
        let mut slots = vec![Slot {
            label: "factory".to_string(),
            kind: SlotKind::Factory,
            size: slot_size,
        }];
        slots.extend((0..OTA_SLOT_COUNT).map(|idx| Slot {
            label: format!("ota_{idx}"),
            kind: SlotKind::Ota(idx),
            size: slot_size,
        }));

        let state = match fs::read(dir.join("slots.json")) {
            Ok(raw) => serde_json::from_slice::<SlotState>(&raw)?,
            Err(err) if err.kind() == ErrorKind::NotFound => SlotState::default(),
            Err(err) => return Err(err.into()),
        };

        let running = match state.boot.as_deref() {
            Some(label) if state.bootable.iter().any(|b| b == label) => label.to_string(),
            Some(label) if label != "factory" => {
                warn!("boot slot {label} holds no verified image, falling back to factory");
                "factory".to_string()
            }
            _ => "factory".to_string(),
        };
        info!("host bootloader selected {running}");

        Ok(Self {
            dir,
            slots,
            running,
            state,
        })
    }

    fn image_path(&self, slot: &Slot) -> PathBuf {
        self.dir.join(format!("{}.bin", slot.label))
    }

    fn known(&self, slot: &Slot) -> Result<(), StorageError> {
        if self.slots.iter().any(|known| known.label == slot.label) {
            Ok(())
        } else {
            Err(StorageError::SlotNotFound(slot.label.clone()))
        }
    }

    fn save_state(&self) -> Result<(), StorageError> {
        let otadata_error = |err: String| StorageError::Flash {
            slot: "otadata".to_string(),
            reason: err,
        };
        let payload = serde_json::to_vec_pretty(&self.state)
            .map_err(|err| otadata_error(err.to_string()))?;
        fs::write(self.dir.join("slots.json"), payload)
            .map_err(|err| otadata_error(err.to_string()))
    }

    fn open_image(&self, slot: &Slot) -> Result<File, StorageError> {
        OpenOptions::new()
            .read(true)
            .write(true)
            .create(true)
            .truncate(false)
            .open(self.image_path(slot))
            .map_err(|err| flash_error(slot, err))
    }
}

fn flash_error(slot: &Slot, err: impl std::fmt::Display) -> StorageError {
    StorageError::Flash {
        slot: slot.label.clone(),
        reason: err.to_string(),
    }
}

fn check_bounds(slot: &Slot, offset: u64, len: u64) -> Result<(), StorageError> {
    match offset.checked_add(len) {
        Some(end) if end <= slot.size => Ok(()),
        _ => Err(StorageError::OutOfBounds {
            slot: slot.label.clone(),
            offset,
            len,
        }),
    }
}

impl SlotStore for FileSlotStore {
    fn running_slot(&self) -> Result<Slot, StorageError> {
        self.slots
            .iter()
            .find(|slot| slot.label == self.running)
            .cloned()
            .ok_or_else(|| StorageError::SlotNotFound(self.running.clone()))
    }

    fn app_slots(&self) -> Result<Vec<Slot>, StorageError> {
        Ok(self.slots.clone())
    }

    fn boot_slot(&self) -> Result<Option<Slot>, StorageError> {
        Ok(self.state.boot.as_ref().and_then(|label| {
            self.slots.iter().find(|slot| &slot.label == label).cloned()
        }))
    }

    fn read(&self, slot: &Slot, offset: u64, buf: &mut [u8]) -> Result<(), StorageError> {
        self.known(slot)?;
        check_bounds(slot, offset, buf.len() as u64)?;
        buf.fill(0xFF);

        let mut file = match File::open(self.image_path(slot)) {
            Ok(file) => file,
            Err(err) if err.kind() == ErrorKind::NotFound => return Ok(()),
            Err(err) => return Err(flash_error(slot, err)),
        };
        file.seek(SeekFrom::Start(offset))
            .map_err(|err| flash_error(slot, err))?;
        // Past the end of the file reads as erased flash.
        let mut filled = 0;
        while filled < buf.len() {
            match file.read(&mut buf[filled..]) {
                Ok(0) => break,
                Ok(read) => filled += read,
                Err(err) if err.kind() == ErrorKind::Interrupted => {}
                Err(err) => return Err(flash_error(slot, err)),
            }
        }
        Ok(())
    }

    fn erase(&mut self, slot: &Slot, offset: u64, len: u64) -> Result<(), StorageError> {
        self.known(slot)?;
        check_bounds(slot, offset, len)?;
        if slot.label == self.running {
            return Err(flash_error(slot, "refusing to erase the running slot"));
        }

        let mut file = self.open_image(slot)?;
        let file_len = file
            .metadata()
            .map_err(|err| flash_error(slot, err))?
            .len();
        if offset == 0 && len >= file_len {
            file.set_len(0).map_err(|err| flash_error(slot, err))?;
        } else {
            file.seek(SeekFrom::Start(offset))
                .map_err(|err| flash_error(slot, err))?;
            let block = [0xFF_u8; ERASE_BLOCK];
            let mut remaining = len.min(file_len.saturating_sub(offset));
            while remaining > 0 {
                let take = remaining.min(ERASE_BLOCK as u64) as usize;
                file.write_all(&block[..take])
                    .map_err(|err| flash_error(slot, err))?;
                remaining -= take as u64;
            }
        }

        if offset == 0 {
            self.state.image_len.remove(&slot.label);
            self.state.bootable.retain(|label| label != &slot.label);
            self.save_state()?;
        }
        Ok(())
    }

    fn write(&mut self, slot: &Slot, offset: u64, data: &[u8]) -> Result<(), StorageError> {
        self.known(slot)?;
        check_bounds(slot, offset, data.len() as u64)?;

        let mut file = self.open_image(slot)?;
        file.seek(SeekFrom::Start(offset))
            .map_err(|err| flash_error(slot, err))?;
        file.write_all(data).map_err(|err| flash_error(slot, err))?;

        let end = offset + data.len() as u64;
        let len = self.state.image_len.entry(slot.label.clone()).or_insert(0);
        *len = (*len).max(end);
        Ok(())
    }

    fn metadata(&self, slot: &Slot) -> Result<Option<SlotMetadata>, StorageError> {
        let Some(len) = self.state.image_len.get(&slot.label).copied() else {
            return Ok(None);
        };
        let mut magic = [0_u8; 1];
        self.read(slot, 0, &mut magic)?;
        if len == 0 || magic[0] == 0xFF {
            return Ok(None);
        }
        Ok(Some(SlotMetadata {
            declared_length: len,
        }))
    }

    fn mark_bootable(&mut self, slot: &Slot) -> Result<(), StorageError> {
        self.known(slot)?;
        if !self.state.bootable.contains(&slot.label) {
            self.state.bootable.push(slot.label.clone());
        }
        self.state.boot = Some(slot.label.clone());
        self.save_state()
    }

    fn select_factory(&mut self) -> Result<(), StorageError> {
        self.state.boot = Some("factory".to_string());
        self.save_state()
    }

    fn erase_boot_selection(&mut self) -> Result<(), StorageError> {
        self.state.boot = None;
        self.save_state()
    }
}

/// Blocking client without automatic redirects; the pipeline follows them.
struct ReqwestTransport {
    client: reqwest::blocking::Client,
}

impl ReqwestTransport {
    fn new(http: &HttpClientConfig) -> anyhow::Result<Self> {
        let client = reqwest::blocking::Client::builder()
            .redirect(reqwest::redirect::Policy::none())
            .timeout(Duration::from_millis(http.timeout_ms))
            .build()?;
        Ok(Self { client })
    }
}

impl HttpTransport for ReqwestTransport {
    fn get(
        &self,
        url: &str,
        headers: &[(&str, &str)],
    ) -> Result<Box<dyn HttpResponse>, TransportError> {
        let mut request = self.client.get(url);
        for (name, value) in headers {
            request = request.header(*name, *value);
        }

        let response = request.send().map_err(|err| {
            if err.is_timeout() {
                TransportError::Timeout {
                    url: url.to_string(),
                }
            } else {
                TransportError::Connect {
                    url: url.to_string(),
                    reason: err.to_string(),
                }
            }
        })?;
        Ok(Box::new(ReqwestResponse { inner: response }))
    }
}

struct ReqwestResponse {
    inner: reqwest::blocking::Response,
}

impl HttpResponse for ReqwestResponse {
    fn status(&self) -> u16 {
        self.inner.status().as_u16()
    }

    fn header(&self, name: &str) -> Option<String> {
        self.inner
            .headers()
            .get(name)
            .and_then(|value| value.to_str().ok())
            .map(str::to_string)
    }

    fn read(&mut self, buf: &mut [u8]) -> Result<usize, TransportError> {
        Read::read(&mut self.inner, buf).map_err(|err| TransportError::Read(err.to_string()))
    }
}

struct HostPlatform {
    reset_reason: ResetReason,
    firmware_version: String,
}

impl HostPlatform {
    fn from_env() -> Self {
        let reset_reason = std::env::var("LCM_RESET_REASON")
            .map(|label| ResetReason::from_label(&label))
            .unwrap_or(ResetReason::PowerOn);
        let firmware_version = std::env::var("LCM_FIRMWARE_VERSION")
            .unwrap_or_else(|_| env!("CARGO_PKG_VERSION").to_string());
        Self {
            reset_reason,
            firmware_version,
        }
    }
}

impl Platform for HostPlatform {
    fn reset_reason(&self) -> ResetReason {
        self.reset_reason
    }

    fn firmware_version(&self) -> String {
        self.firmware_version.clone()
    }

    fn now_ms(&self) -> u64 {
        monotonic_ms()
    }

    fn sleep_ms(&self, ms: u64) {
        std::thread::sleep(Duration::from_millis(ms));
    }

    fn feed_watchdog(&self) {}

    fn restart(&self) {
        warn!("restart requested; exiting so the supervisor boots the selected slot");
        std::process::exit(0);
    }

    fn set_indicator(&self, active: bool) {
        info!("update indicator {}", if active { "on" } else { "off" });
    }

    fn restore_network_defaults(&self) -> Result<(), StorageError> {
        info!("host network needs no reset");
        Ok(())
    }

    fn reset_accessory_state(&self) -> Result<(), StorageError> {
        info!("no accessory pairing on the host");
        Ok(())
    }
}
