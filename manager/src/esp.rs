use core::convert::TryInto;
use std::{
    collections::BTreeMap,
    ffi::CStr,
    ptr,
    sync::{
        atomic::{AtomicBool, Ordering},
        Arc, Mutex, OnceLock, PoisonError,
    },
    thread,
    time::{Duration, Instant},
};

use anyhow::{anyhow, Context};
use embedded_svc::{
    http::{Headers, Method, Status},
    io::{Read, Write},
    mqtt::client::{Details, EventPayload, QoS},
    wifi::{AccessPointConfiguration, AuthMethod, ClientConfiguration, Configuration},
};
use esp_idf_hal::gpio::{AnyIOPin, AnyOutputPin, PinDriver, Pull};
use esp_idf_svc::{
    eventloop::EspSystemEventLoop,
    hal::{modem::Modem, prelude::Peripherals},
    http::client::{
        Configuration as HttpClientConfiguration, EspHttpConnection as EspClientConnection,
        FollowRedirectsPolicy,
    },
    http::server::{Configuration as HttpConfiguration, EspHttpConnection, EspHttpServer, Request},
    log::EspLogger,
    mqtt::client::{EspMqttClient, EspMqttConnection, MqttClientConfiguration},
    nvs::{EspDefaultNvsPartition, EspNvs, NvsDefault},
    ota::EspOta,
    sys::{self, EspError},
    wifi::{BlockingWifi, EspWifi},
};
use log::{info, warn};
use serde::Serialize;

use lifecycle_common::{
    form, html,
    keys::{KEY_MQTT_URL, KEY_WIFI_PASSWORD, KEY_WIFI_SSID, MAX_KEY_LEN, NS_WIFI},
    records::valid_repository,
    spawn_decay_timer, spawn_worker,
    store::erase_namespace,
    BootDecision, ConfigStore, FirmwareConfig, HttpClientConfig, HttpResponse, HttpTransport,
    LifecycleConfig, LifecycleHandle, LifecycleManager, LifecycleStatus, OpenMode, Platform,
    ResetReason, Slot, SlotKind, SlotMetadata, SlotStore, StorageError, StoreHandle,
    StoreHandleExt, SubmitResult, TransportError, TOPIC_CMD_CANCEL_UPDATE, TOPIC_CMD_CHECK,
    TOPIC_CMD_FACTORY_RESET, TOPIC_CMD_UPDATE, TOPIC_LIFECYCLE_EVENT, TOPIC_LIFECYCLE_STATE,
};

const MAX_HTTP_BODY: usize = 4096;
const MAX_MQTT_PAYLOAD_BYTES: usize = 512;
const PROVISIONING_AP_SSID: &str = "Lifecycle-Setup";
const PROVISIONING_AP_PASSWORD: &str = "LifecycleSetup";
const WATCHDOG_TIMEOUT_SEC: u32 = 30;
const WIFI_CONNECT_ATTEMPTS: u32 = 5;
const WIFI_RETRY_DELAY_MS: u64 = 3_000;
const STATUS_LED_PIN: i32 = 2;
const LED_BLINK_MS: u64 = 200;
const LIFECYCLE_BUTTON_PIN: i32 = 0;
const BUTTON_HOLD_MS: u64 = 3_000;
const BUTTON_POLL_MS: u64 = 50;
const STATE_PUBLISH_INTERVAL_MS: u64 = 10_000;
const FLASH_SECTOR: u64 = 4096;
const WIFI_DRIVER_NAMESPACE: &str = "nvs.net80211";
const FACTORY_RESET_CONFIRMATION: &str = "confirm";

enum WifiStartup {
    Connected(EspWifi<'static>),
    Provisioning(EspWifi<'static>),
}

struct WifiCredentials {
    ssid: String,
    password: String,
}

type MqttHandle = Arc<Mutex<EspMqttClient<'static>>>;

pub fn run() -> anyhow::Result<()> {
    esp_idf_svc::sys::link_patches();
    EspLogger::initialize_default();

    let sys_loop = EspSystemEventLoop::take()?;
    let nvs_partition = EspDefaultNvsPartition::take()?;
    let store = NvsConfigStore::new(nvs_partition.clone());

    init_watchdog(WATCHDOG_TIMEOUT_SEC)?;
    let indicator = Arc::new(AtomicBool::new(false));
    spawn_status_led(STATUS_LED_PIN, indicator.clone());

    // The restart counter runs before Wi-Fi so boot loops count even offline.
    let config = LifecycleConfig::default();
    let slots = PartitionSlotStore::discover().context("failed to read partition table")?;
    let transport = EspTransport::new(&config.http);
    let platform = EspPlatform {
        indicator,
        store: store.clone(),
    };
    let mut manager = LifecycleManager::new(config, store.clone(), slots, transport, platform);
    if manager.on_boot() == BootDecision::FactoryReset {
        warn!("factory reset returned without a restart");
    }
    spawn_decay_timer(manager.decay_timer(), monotonic_ms)
        .context("failed to spawn restart counter timer")?;

    let (lifecycle, _worker) = spawn_worker(manager).context("failed to spawn lifecycle worker")?;
    spawn_button_watch(LIFECYCLE_BUTTON_PIN, lifecycle.clone());

    let Peripherals { modem, .. } = Peripherals::take()?;
    let credentials = load_wifi_credentials(&store);
    let startup = connect_wifi(modem, sys_loop, nvs_partition, credentials.as_ref())
        .context("wifi startup failed")?;

    if let Ok(mut ota) = EspOta::new() {
        if let Err(err) = ota.mark_running_slot_valid() {
            warn!("failed to mark running OTA slot valid: {err:?}");
        }
    }

    let server = create_http_server(lifecycle.clone(), store.clone())?;

    let (wifi, mqtt) = match startup {
        WifiStartup::Connected(wifi) => {
            info!("wifi connected, network ready: {:?}", lifecycle.network_ready());
            let mqtt = match load_mqtt_url(&store) {
                Some(url) => match start_mqtt(&url, lifecycle.clone()) {
                    Ok(mqtt) => Some(mqtt),
                    Err(err) => {
                        warn!("mqtt unavailable: {err:#}");
                        None
                    }
                },
                None => {
                    info!("no mqtt broker configured");
                    None
                }
            };
            (wifi, mqtt)
        }
        WifiStartup::Provisioning(wifi) => {
            warn!(
                "wifi station connection unavailable; provisioning AP `{}` is up",
                PROVISIONING_AP_SSID
            );
            (wifi, None)
        }
    };

    spawn_control_loop(lifecycle, mqtt);

    // Keep services alive for the program lifetime.
    let _wifi = wifi;
    let _server = server;

    loop {
        thread::sleep(Duration::from_secs(60));
    }
}

fn load_wifi_credentials(store: &NvsConfigStore) -> Option<WifiCredentials> {
    let read = || -> Result<Option<WifiCredentials>, StorageError> {
        let handle = store.open(NS_WIFI, OpenMode::ReadOnly)?;
        let Some(ssid) = handle.get_str(KEY_WIFI_SSID)? else {
            return Ok(None);
        };
        let password = handle.get_str(KEY_WIFI_PASSWORD)?.unwrap_or_default();
        Ok(Some(WifiCredentials { ssid, password }))
    };

    match read() {
        Ok(credentials) => credentials.filter(|c| !c.ssid.trim().is_empty()),
        Err(err) => {
            warn!("failed to load wifi credentials: {err}");
            None
        }
    }
}

fn load_mqtt_url(store: &NvsConfigStore) -> Option<String> {
    let handle = store.open(NS_WIFI, OpenMode::ReadOnly).ok()?;
    handle
        .get_str(KEY_MQTT_URL)
        .ok()
        .flatten()
        .filter(|url| !url.trim().is_empty())
}

fn connect_wifi(
    modem: Modem,
    sys_loop: EspSystemEventLoop,
    nvs_partition: EspDefaultNvsPartition,
    credentials: Option<&WifiCredentials>,
) -> anyhow::Result<WifiStartup> {
    let mut esp_wifi = EspWifi::new(modem, sys_loop.clone(), Some(nvs_partition))?;
    let mut wifi = BlockingWifi::wrap(&mut esp_wifi, sys_loop)?;

    let Some(credentials) = credentials else {
        warn!("wifi credentials missing; entering provisioning AP mode");
        start_provisioning_ap(&mut wifi)?;
        return Ok(WifiStartup::Provisioning(esp_wifi));
    };

    let auth_method = if credentials.password.is_empty() {
        AuthMethod::None
    } else {
        AuthMethod::WPAWPA2Personal
    };

    wifi.set_configuration(&Configuration::Client(ClientConfiguration {
        ssid: credentials
            .ssid
            .as_str()
            .try_into()
            .map_err(|_| anyhow!("wifi ssid too long"))?,
        password: credentials
            .password
            .as_str()
            .try_into()
            .map_err(|_| anyhow!("wifi password too long"))?,
        auth_method,
        ..Default::default()
    }))?;

    wifi.start()?;
    info!("wifi started, connecting to `{}`", credentials.ssid);

    let mut last_err = None;
    for attempt in 1..=WIFI_CONNECT_ATTEMPTS {
        info!("wifi connect attempt {attempt}/{WIFI_CONNECT_ATTEMPTS}");
        match wifi.connect().and_then(|()| wifi.wait_netif_up()) {
            Ok(()) => {
                info!("wifi connected and netif up on attempt {attempt}");
                last_err = None;
                break;
            }
            Err(err) => {
                warn!("wifi connect failed on attempt {attempt}: {err:#}");
                last_err = Some(err);
            }
        }

        if attempt < WIFI_CONNECT_ATTEMPTS {
            let _ = wifi.disconnect();
            thread::sleep(Duration::from_millis(WIFI_RETRY_DELAY_MS));
        }
    }

    match last_err {
        None => Ok(WifiStartup::Connected(esp_wifi)),
        Some(err) => {
            warn!("all {WIFI_CONNECT_ATTEMPTS} wifi connect attempts failed; last error: {err:#}");
            let _ = wifi.disconnect();
            let _ = wifi.stop();
            start_provisioning_ap(&mut wifi)?;
            Ok(WifiStartup::Provisioning(esp_wifi))
        }
    }
}

fn start_provisioning_ap(wifi: &mut BlockingWifi<&mut EspWifi<'static>>) -> anyhow::Result<()> {
    wifi.set_configuration(&Configuration::AccessPoint(AccessPointConfiguration {
        ssid: PROVISIONING_AP_SSID
            .try_into()
            .map_err(|_| anyhow!("provisioning AP SSID too long"))?,
        password: PROVISIONING_AP_PASSWORD
            .try_into()
            .map_err(|_| anyhow!("provisioning AP password too long"))?,
        auth_method: AuthMethod::WPA2Personal,
        channel: 1,
        ..Default::default()
    }))?;
    wifi.start()?;
    wifi.wait_netif_up()?;
    info!("provisioning AP started on `{PROVISIONING_AP_SSID}`");
    Ok(())
}

fn create_http_server(
    lifecycle: LifecycleHandle,
    store: NvsConfigStore,
) -> anyhow::Result<EspHttpServer<'static>> {
    let conf = HttpConfiguration {
        stack_size: 16 * 1024,
        ..Default::default()
    };
    let mut server = EspHttpServer::new(&conf)?;

    for path in [
        "/",
        "/config",
        "/generate_204",
        "/gen_204",
        "/hotspot-detect.html",
        "/connecttest.txt",
        "/ncsi.txt",
        "/fwlink",
    ] {
        let lifecycle = lifecycle.clone();
        let store = store.clone();
        server.fn_handler::<anyhow::Error, _>(path, Method::Get, move |req| {
            let page = render_config_page(&store, &lifecycle.status(), None);
            write_html(req, 200, &page)
        })?;
    }

    {
        let lifecycle = lifecycle.clone();
        let store = store.clone();
        server.fn_handler::<anyhow::Error, _>("/config", Method::Post, move |mut req| {
            let body = read_request_body(&mut req)?;
            let body = String::from_utf8_lossy(&body);
            let fields = form::parse(&body);

            let repository = form::value(&fields, "repo").unwrap_or("").trim().to_string();
            if !repository.is_empty() && !valid_repository(&repository) {
                let page = render_config_page(
                    &store,
                    &lifecycle.status(),
                    Some("Repository must look like owner/name."),
                );
                return write_html(req, 400, &page);
            }

            let firmware = FirmwareConfig {
                repository,
                prefer_prerelease: form::find(&fields, "pre").is_some(),
            };
            let network_changed = match save_config_form(&store, &fields, &firmware) {
                Ok(changed) => changed,
                Err(err) => {
                    warn!("failed to persist config form: {err}");
                    let page =
                        render_config_page(&store, &lifecycle.status(), Some("Saving failed."));
                    return write_html(req, 500, &page);
                }
            };

            let message = if network_changed {
                schedule_restart(Duration::from_secs(3));
                "Saved. Restarting to join the network."
            } else {
                "Saved."
            };
            let page = render_config_page(&store, &lifecycle.status(), Some(message));
            write_html(req, 200, &page)
        })?;
    }

    {
        let lifecycle = lifecycle.clone();
        server.fn_handler::<anyhow::Error, _>("/api/status", Method::Get, move |req| {
            write_json(req, 200, &lifecycle.status())
        })?;
    }

    let commands: [(&str, fn(&LifecycleHandle) -> SubmitResult); 4] = [
        ("/api/update/check", LifecycleHandle::check_for_update),
        ("/api/update/request", LifecycleHandle::request_update),
        ("/api/update/cancel", LifecycleHandle::cancel_update_intent),
        ("/api/factory-reset", LifecycleHandle::factory_reset),
    ];
    for (path, command) in commands {
        let lifecycle = lifecycle.clone();
        server.fn_handler::<anyhow::Error, _>(path, Method::Post, move |req| {
            let result = command(&lifecycle);
            let status = match result {
                SubmitResult::Accepted | SubmitResult::Deferred => 202,
                SubmitResult::AlreadyRunning => 409,
                SubmitResult::Stopped => 503,
            };
            write_json(req, status, &serde_json::json!({ "result": result }))
        })?;
    }

    Ok(server)
}

/// Returns whether the network settings changed.
fn save_config_form(
    store: &NvsConfigStore,
    fields: &[form::FormField],
    firmware: &FirmwareConfig,
) -> Result<bool, StorageError> {
    firmware.save(store)?;

    let mut handle = store.open(NS_WIFI, OpenMode::ReadWrite)?;
    let mut changed = false;
    if let Some(ssid) = form::value(fields, "ssid").map(str::trim) {
        if !ssid.is_empty() && handle.get_str(KEY_WIFI_SSID)?.as_deref() != Some(ssid) {
            handle.set_str(KEY_WIFI_SSID, ssid)?;
            changed = true;
        }
    }
    // An empty password field keeps the stored one.
    if let Some(password) = form::value(fields, "pass").filter(|p| !p.is_empty()) {
        handle.set_str(KEY_WIFI_PASSWORD, password)?;
        changed = true;
    }
    if let Some(url) = form::value(fields, "mqtt").map(str::trim) {
        if handle.get_str(KEY_MQTT_URL)?.as_deref().unwrap_or("") != url {
            handle.set_str(KEY_MQTT_URL, url)?;
            changed = true;
        }
    }
    handle.commit()?;
    Ok(changed)
}

fn render_config_page(
    store: &NvsConfigStore,
    status: &LifecycleStatus,
    message: Option<&str>,
) -> String {
    let firmware = FirmwareConfig::load(store).unwrap_or_default();
    let (ssid, mqtt) = match store.open(NS_WIFI, OpenMode::ReadOnly) {
        Ok(handle) => (
            handle
                .get(KEY_WIFI_SSID)
                .ok()
                .flatten()
                .map(|raw| html::sanitize_ssid(&raw))
                .unwrap_or_default(),
            handle.get_str(KEY_MQTT_URL).ok().flatten().unwrap_or_default(),
        ),
        Err(_) => (String::new(), String::new()),
    };

    let checked = if firmware.prefer_prerelease { " checked" } else { "" };
    let notice = message
        .map(|text| format!("<p class=\"notice\">{}</p>", html::escape(text)))
        .unwrap_or_default();

    format!(
        r#"<!doctype html>
<html>
<head><meta charset="utf-8"><meta name="viewport" content="width=device-width,initial-scale=1"><title>Device setup</title></head>
<body>
<h1>Device setup</h1>
{notice}
<p>Firmware {firmware_version} on {slot}. Last update check: {last_check}</p>
<form method="post" action="/config">
  <fieldset><legend>Network</legend>
    <label>Wi-Fi SSID <input name="ssid" maxlength="{max_ssid}" value="{ssid}"></label>
    <label>Password <input name="pass" type="password" placeholder="unchanged"></label>
    <label>MQTT broker <input name="mqtt" value="{mqtt}" placeholder="mqtt://host:1883"></label>
  </fieldset>
  <fieldset><legend>Firmware updates</legend>
    <label>Repository <input name="repo" value="{repo}" placeholder="owner/name"></label>
    <label><input type="checkbox" name="pre"{checked}> Install pre-releases</label>
  </fieldset>
  <button type="submit">Save</button>
</form>
</body>
</html>
"#,
        firmware_version = html::escape(&status.firmware_version),
        slot = html::escape(status.running_slot.as_deref().unwrap_or("?")),
        last_check = html::escape(status.last_check.as_deref().unwrap_or("-")),
        max_ssid = html::MAX_SSID_BYTES,
        ssid = html::escape(&ssid),
        mqtt = html::escape(&mqtt),
        repo = html::escape(&firmware.repository),
    )
}

fn read_request_body(req: &mut Request<&mut EspHttpConnection<'_>>) -> anyhow::Result<Vec<u8>> {
    let len = req.content_len().unwrap_or(0) as usize;
    if len > MAX_HTTP_BODY {
        return Err(anyhow!("request body too large"));
    }

    let mut body = vec![0_u8; len];
    if len > 0 {
        req.read_exact(&mut body)?;
    }
    Ok(body)
}

fn write_json<T: Serialize>(
    req: Request<&mut EspHttpConnection<'_>>,
    status_code: u16,
    payload: &T,
) -> anyhow::Result<()> {
    let body = serde_json::to_vec(payload)?;
    req.into_response(
        status_code,
        None,
        &[("Content-Type", "application/json; charset=utf-8")],
    )?
    .write_all(&body)?;
    Ok(())
}

fn write_html(
    req: Request<&mut EspHttpConnection<'_>>,
    status_code: u16,
    page: &str,
) -> anyhow::Result<()> {
    req.into_response(status_code, None, &[("Content-Type", "text/html; charset=utf-8")])?
        .write_all(page.as_bytes())?;
    Ok(())
}

fn schedule_restart(delay: Duration) {
    let spawned = thread::Builder::new()
        .name("prov-restart".into())
        .spawn(move || {
            thread::sleep(delay);
            unsafe { esp_idf_svc::sys::esp_restart() };
        });
    if let Err(err) = spawned {
        warn!("failed to spawn restart thread: {err}");
    }
}

fn start_mqtt(url: &str, lifecycle: LifecycleHandle) -> anyhow::Result<MqttHandle> {
    let conf = MqttClientConfiguration {
        client_id: Some("lifecycle-manager"),
        ..Default::default()
    };
    let (client, conn) = EspMqttClient::new(url, &conf)?;
    let mqtt = Arc::new(Mutex::new(client));

    subscribe_topics(&mqtt)?;
    spawn_mqtt_receiver(lifecycle, conn, mqtt.clone())?;
    info!("mqtt client started for {url}");
    Ok(mqtt)
}

fn subscribe_topics(mqtt: &MqttHandle) -> anyhow::Result<()> {
    let topics = [
        TOPIC_CMD_CHECK,
        TOPIC_CMD_UPDATE,
        TOPIC_CMD_CANCEL_UPDATE,
        TOPIC_CMD_FACTORY_RESET,
    ];

    let mut mqtt = mqtt.lock().unwrap_or_else(PoisonError::into_inner);
    for topic in topics {
        mqtt.subscribe(topic, QoS::AtMostOnce)?;
    }
    Ok(())
}

fn spawn_mqtt_receiver(
    lifecycle: LifecycleHandle,
    mut conn: EspMqttConnection,
    mqtt: MqttHandle,
) -> anyhow::Result<()> {
    thread::Builder::new()
        .name("mqtt-rx".into())
        .stack_size(12 * 1024)
        .spawn(move || loop {
            match conn.next() {
                Ok(event) => {
                    if let EventPayload::Received {
                        topic: Some(topic),
                        data,
                        details,
                        ..
                    } = event.payload()
                    {
                        // Only complete payloads.
                        if !matches!(details, Details::Complete) {
                            continue;
                        }
                        if data.len() > MAX_MQTT_PAYLOAD_BYTES {
                            warn!(
                                "dropping oversized MQTT payload on topic {} ({} bytes)",
                                topic,
                                data.len()
                            );
                            continue;
                        }
                        if let Ok(message) = core::str::from_utf8(data) {
                            handle_mqtt_message(&lifecycle, &mqtt, topic, message);
                        }
                    }
                }
                Err(err) => {
                    warn!("mqtt receive loop error: {err:?}");
                    thread::sleep(Duration::from_secs(2));
                    if let Err(sub_err) = subscribe_topics(&mqtt) {
                        warn!("mqtt re-subscribe failed: {sub_err:#}");
                    }
                }
            }
        })
        .context("failed to spawn mqtt receiver thread")?;
    Ok(())
}

fn handle_mqtt_message(lifecycle: &LifecycleHandle, mqtt: &MqttHandle, topic: &str, message: &str) {
    let (command, result) = match topic {
        TOPIC_CMD_CHECK => ("check", lifecycle.check_for_update()),
        TOPIC_CMD_UPDATE => ("update", lifecycle.request_update()),
        TOPIC_CMD_CANCEL_UPDATE => ("cancel_update", lifecycle.cancel_update_intent()),
        TOPIC_CMD_FACTORY_RESET => {
            if !message.trim().eq_ignore_ascii_case(FACTORY_RESET_CONFIRMATION) {
                warn!("factory reset over mqtt needs payload `{FACTORY_RESET_CONFIRMATION}`");
                return;
            }
            ("factory_reset", lifecycle.factory_reset())
        }
        _ => return,
    };

    info!("mqtt command {command}: {result:?}");
    let body = serde_json::json!({ "command": command, "result": result }).to_string();
    let mut client = mqtt.lock().unwrap_or_else(PoisonError::into_inner);
    if let Err(err) = client.publish(TOPIC_LIFECYCLE_EVENT, QoS::AtLeastOnce, false, body.as_bytes())
    {
        warn!("lifecycle event publish failed: {err}");
    }
}

fn spawn_control_loop(lifecycle: LifecycleHandle, mqtt: Option<MqttHandle>) {
    let spawned = thread::Builder::new()
        .name("control-loop".into())
        .stack_size(12 * 1024)
        .spawn(move || {
            if let Err(err) = add_current_task_to_watchdog() {
                warn!("failed to register control loop with watchdog: {err:#}");
            }

            let mut last_publish_ms = 0_u64;
            loop {
                feed_watchdog();
                let now_ms = monotonic_ms();

                if let Some(mqtt) = mqtt.as_ref() {
                    if now_ms.saturating_sub(last_publish_ms) >= STATE_PUBLISH_INTERVAL_MS {
                        last_publish_ms = now_ms;
                        publish_state(mqtt, &lifecycle.status());
                    }
                }

                thread::sleep(Duration::from_millis(200));
            }
        });
    if let Err(err) = spawned {
        warn!("failed to spawn control loop: {err}");
    }
}

fn publish_state(mqtt: &MqttHandle, status: &LifecycleStatus) {
    let body = match serde_json::to_vec(status) {
        Ok(body) => body,
        Err(err) => {
            warn!("lifecycle state serialization failed: {err}");
            return;
        }
    };
    let mut client = mqtt.lock().unwrap_or_else(PoisonError::into_inner);
    if let Err(err) = client.publish(TOPIC_LIFECYCLE_STATE, QoS::AtLeastOnce, true, &body) {
        warn!("lifecycle state publish failed: {err}");
    }
}

/// Holding the lifecycle button requests a factory reset.
fn spawn_button_watch(pin: i32, lifecycle: LifecycleHandle) {
    let mut button = match unsafe { PinDriver::input(AnyIOPin::new(pin)) } {
        Ok(button) => button,
        Err(err) => {
            // A device whose reset button cannot be read must not run on.
            warn!("lifecycle button on GPIO{pin} unavailable ({err}); restarting");
            unsafe { esp_idf_svc::sys::esp_restart() };
            return;
        }
    };
    if let Err(err) = button.set_pull(Pull::Up) {
        warn!("failed to enable pull-up on GPIO{pin}: {err}");
    }

    let spawned = thread::Builder::new()
        .name("lcm-button".into())
        .stack_size(4 * 1024)
        .spawn(move || {
            let mut pressed_since: Option<u64> = None;
            let mut fired = false;
            loop {
                let now_ms = monotonic_ms();
                if button.is_low() {
                    let since = *pressed_since.get_or_insert(now_ms);
                    if !fired && now_ms.saturating_sub(since) >= BUTTON_HOLD_MS {
                        fired = true;
                        warn!("lifecycle button held, factory reset: {:?}", lifecycle.factory_reset());
                    }
                } else {
                    pressed_since = None;
                    fired = false;
                }
                thread::sleep(Duration::from_millis(BUTTON_POLL_MS));
            }
        });
    if let Err(err) = spawned {
        warn!("failed to spawn button watch: {err}");
    }
}

fn spawn_status_led(pin: i32, indicator: Arc<AtomicBool>) {
    let mut led = match unsafe { PinDriver::output(AnyOutputPin::new(pin)) } {
        Ok(led) => led,
        Err(err) => {
            warn!("status LED unavailable on GPIO{pin}: {err}");
            return;
        }
    };
    let _ = led.set_low();

    let spawned = thread::Builder::new()
        .name("status-led".into())
        .stack_size(3 * 1024)
        .spawn(move || {
            let mut lit = false;
            loop {
                let desired = indicator.load(Ordering::Relaxed) && !lit;
                if desired != lit {
                    let result = if desired { led.set_high() } else { led.set_low() };
                    match result {
                        Ok(()) => lit = desired,
                        Err(err) => warn!("failed to drive status LED: {err}"),
                    }
                }
                thread::sleep(Duration::from_millis(LED_BLINK_MS));
            }
        });
    if let Err(err) = spawned {
        warn!("failed to spawn status LED thread: {err}");
    }
}

fn init_watchdog(timeout_sec: u32) -> anyhow::Result<()> {
    let config = sys::esp_task_wdt_config_t {
        timeout_ms: timeout_sec.saturating_mul(1000),
        idle_core_mask: 0,
        trigger_panic: true,
    };
    let rc = unsafe { sys::esp_task_wdt_init(&config) };
    if rc == sys::ESP_OK || rc == sys::ESP_ERR_INVALID_STATE {
        return Ok(());
    }
    Err(anyhow!("esp_task_wdt_init failed with code {}", rc))
}

fn add_current_task_to_watchdog() -> anyhow::Result<()> {
    let rc = unsafe { sys::esp_task_wdt_add(ptr::null_mut()) };
    if rc == sys::ESP_OK || rc == sys::ESP_ERR_INVALID_STATE {
        return Ok(());
    }
    Err(anyhow!("esp_task_wdt_add failed with code {}", rc))
}

fn feed_watchdog() {
    let _ = unsafe { sys::esp_task_wdt_reset() };
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

struct EspPlatform {
    indicator: Arc<AtomicBool>,
    store: NvsConfigStore,
}

impl Platform for EspPlatform {
    fn reset_reason(&self) -> ResetReason {
        match unsafe { sys::esp_reset_reason() } {
            sys::esp_reset_reason_t_ESP_RST_POWERON => ResetReason::PowerOn,
            sys::esp_reset_reason_t_ESP_RST_EXT => ResetReason::External,
            sys::esp_reset_reason_t_ESP_RST_SW => ResetReason::Software,
            sys::esp_reset_reason_t_ESP_RST_PANIC => ResetReason::Panic,
            sys::esp_reset_reason_t_ESP_RST_INT_WDT => ResetReason::InterruptWatchdog,
            sys::esp_reset_reason_t_ESP_RST_TASK_WDT => ResetReason::TaskWatchdog,
            sys::esp_reset_reason_t_ESP_RST_WDT => ResetReason::Watchdog,
            sys::esp_reset_reason_t_ESP_RST_DEEPSLEEP => ResetReason::DeepSleep,
            sys::esp_reset_reason_t_ESP_RST_BROWNOUT => ResetReason::Brownout,
            sys::esp_reset_reason_t_ESP_RST_SDIO => ResetReason::Sdio,
            _ => ResetReason::Unknown,
        }
    }

    fn firmware_version(&self) -> String {
        EspOta::new()
            .ok()
            .and_then(|ota| ota.get_running_slot().ok())
            .and_then(|slot| slot.firmware)
            .map(|firmware| firmware.version.as_str().to_string())
            .unwrap_or_else(|| env!("CARGO_PKG_VERSION").to_string())
    }

    fn now_ms(&self) -> u64 {
        monotonic_ms()
    }

    fn sleep_ms(&self, ms: u64) {
        thread::sleep(Duration::from_millis(ms));
    }

    fn feed_watchdog(&self) {
        feed_watchdog();
    }

    fn restart(&self) {
        info!("restarting");
        unsafe { sys::esp_restart() };
    }

    fn set_indicator(&self, active: bool) {
        self.indicator.store(active, Ordering::Relaxed);
    }

    fn restore_network_defaults(&self) -> Result<(), StorageError> {
        // The Wi-Fi driver keeps its station config here.
        erase_namespace(&self.store, WIFI_DRIVER_NAMESPACE)
    }

    fn reset_accessory_state(&self) -> Result<(), StorageError> {
        info!("no accessory pairing to reset");
        Ok(())
    }
}

/// NVS through `EspNvs`. `EspNvs` commits every write on its own, so a handle
/// stages changes and applies them in `commit`.
#[derive(Clone)]
struct NvsConfigStore {
    partition: EspDefaultNvsPartition,
}

impl NvsConfigStore {
    fn new(partition: EspDefaultNvsPartition) -> Self {
        Self { partition }
    }
}

impl ConfigStore for NvsConfigStore {
    fn open(
        &self,
        namespace: &str,
        mode: OpenMode,
    ) -> Result<Box<dyn StoreHandle + '_>, StorageError> {
        let open_error = |reason: String| StorageError::Open {
            namespace: namespace.to_string(),
            reason,
        };
        if namespace.len() > MAX_KEY_LEN {
            return Err(open_error(format!("longer than {MAX_KEY_LEN} bytes")));
        }

        let read_write = mode == OpenMode::ReadWrite;
        let nvs = match EspNvs::new(self.partition.clone(), namespace, read_write) {
            Ok(nvs) => Some(nvs),
            // Namespace never written: an empty view.
            Err(err)
                if !read_write && err.code() == sys::ESP_ERR_NVS_NOT_FOUND as sys::esp_err_t =>
            {
                None
            }
            Err(err) => return Err(open_error(err.to_string())),
        };

        Ok(Box::new(NvsHandle {
            nvs,
            namespace: namespace.to_string(),
            mode,
            staged: BTreeMap::new(),
            cleared: false,
        }))
    }
}

struct NvsHandle {
    nvs: Option<EspNvs<NvsDefault>>,
    namespace: String,
    mode: OpenMode,
    staged: BTreeMap<String, Option<Vec<u8>>>,
    cleared: bool,
}

impl NvsHandle {
    fn ensure_writable(&self) -> Result<(), StorageError> {
        match (self.mode, &self.nvs) {
            (OpenMode::ReadWrite, Some(_)) => Ok(()),
            _ => Err(StorageError::ReadOnly(self.namespace.clone())),
        }
    }
}

fn check_key(key: &str) -> Result<(), StorageError> {
    if key.len() > MAX_KEY_LEN {
        return Err(StorageError::Write {
            key: key.to_string(),
            reason: format!("longer than {MAX_KEY_LEN} bytes"),
        });
    }
    Ok(())
}

impl StoreHandle for NvsHandle {
    fn get(&self, key: &str) -> Result<Option<Vec<u8>>, StorageError> {
        if let Some(staged) = self.staged.get(key) {
            return Ok(staged.clone());
        }
        let Some(nvs) = self.nvs.as_ref().filter(|_| !self.cleared) else {
            return Ok(None);
        };
        let read_error = |err: EspError| StorageError::Read {
            key: key.to_string(),
            reason: err.to_string(),
        };

        let Some(len) = nvs.blob_len(key).map_err(read_error)? else {
            return Ok(None);
        };
        let mut buffer = vec![0_u8; len];
        Ok(nvs
            .get_blob(key, &mut buffer)
            .map_err(read_error)?
            .map(<[u8]>::to_vec))
    }

    fn set(&mut self, key: &str, value: &[u8]) -> Result<(), StorageError> {
        self.ensure_writable()?;
        check_key(key)?;
        self.staged.insert(key.to_string(), Some(value.to_vec()));
        Ok(())
    }

    fn erase_key(&mut self, key: &str) -> Result<(), StorageError> {
        self.ensure_writable()?;
        check_key(key)?;
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
        if self.mode != OpenMode::ReadWrite {
            return Ok(());
        }
        let Some(nvs) = self.nvs.as_mut() else {
            return Ok(());
        };
        let commit_error =
            |err: EspError| StorageError::Commit(format!("{}: {err}", self.namespace));

        if self.cleared {
            // EspNvs has no whole-namespace erase.
            let handle = nvs.handle();
            EspError::convert(unsafe { sys::nvs_erase_all(handle) }).map_err(commit_error)?;
            EspError::convert(unsafe { sys::nvs_commit(handle) }).map_err(commit_error)?;
            self.cleared = false;
        }
        for (key, value) in std::mem::take(&mut self.staged) {
            match value {
                Some(value) => nvs.set_blob(&key, &value).map_err(commit_error)?,
                None => {
                    nvs.remove(&key).map_err(commit_error)?;
                }
            }
        }
        Ok(())
    }
}

#[derive(Clone, Copy)]
struct PartitionPtr(*const sys::esp_partition_t);

// Partition table entries live in static memory and are never freed.
unsafe impl Send for PartitionPtr {}

impl PartitionPtr {
    fn get(&self) -> &'static sys::esp_partition_t {
        unsafe { &*self.0 }
    }
}

/// The app partitions of the flash partition table plus otadata.
struct PartitionSlotStore {
    slots: Vec<(Slot, PartitionPtr)>,
}

impl PartitionSlotStore {
    fn discover() -> anyhow::Result<Self> {
        let mut slots = Vec::new();
        let mut iter = unsafe {
            sys::esp_partition_find(
                sys::esp_partition_type_t_ESP_PARTITION_TYPE_APP,
                sys::esp_partition_subtype_t_ESP_PARTITION_SUBTYPE_ANY,
                ptr::null(),
            )
        };
        // esp_partition_next releases the iterator once it runs out.
        while !iter.is_null() {
            let part = PartitionPtr(unsafe { sys::esp_partition_get(iter) });
            if let Some(slot) = slot_from_partition(part.get()) {
                info!(
                    "app slot {} at 0x{:x}, {} bytes",
                    slot.label,
                    part.get().address,
                    slot.size
                );
                slots.push((slot, part));
            }
            iter = unsafe { sys::esp_partition_next(iter) };
        }

        if slots.is_empty() {
            return Err(anyhow!("partition table has no app partitions"));
        }
        Ok(Self { slots })
    }

    fn partition(&self, slot: &Slot) -> Result<&'static sys::esp_partition_t, StorageError> {
        self.slots
            .iter()
            .find(|(known, _)| known.label == slot.label)
            .map(|(_, part)| part.get())
            .ok_or_else(|| StorageError::SlotNotFound(slot.label.clone()))
    }

    fn slot_at(&self, part: *const sys::esp_partition_t) -> Option<Slot> {
        if part.is_null() {
            return None;
        }
        let address = unsafe { (*part).address };
        self.slots
            .iter()
            .find(|(_, known)| known.get().address == address)
            .map(|(slot, _)| slot.clone())
    }
}

fn slot_from_partition(part: &sys::esp_partition_t) -> Option<Slot> {
    let subtype = part.subtype;
    let kind = if subtype == sys::esp_partition_subtype_t_ESP_PARTITION_SUBTYPE_APP_FACTORY {
        SlotKind::Factory
    } else if (sys::esp_partition_subtype_t_ESP_PARTITION_SUBTYPE_APP_OTA_MIN
        ..sys::esp_partition_subtype_t_ESP_PARTITION_SUBTYPE_APP_OTA_MAX)
        .contains(&subtype)
    {
        let index = subtype - sys::esp_partition_subtype_t_ESP_PARTITION_SUBTYPE_APP_OTA_MIN;
        SlotKind::Ota(u8::try_from(index).ok()?)
    } else {
        return None;
    };

    let label = unsafe { CStr::from_ptr(part.label.as_ptr()) }
        .to_string_lossy()
        .into_owned();
    Some(Slot {
        label,
        kind,
        size: u64::from(part.size),
    })
}

fn flash_error(slot: &Slot, err: EspError) -> StorageError {
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

impl SlotStore for PartitionSlotStore {
    fn running_slot(&self) -> Result<Slot, StorageError> {
        let part = unsafe { sys::esp_ota_get_running_partition() };
        self.slot_at(part)
            .ok_or_else(|| StorageError::SlotNotFound("running".to_string()))
    }

    fn app_slots(&self) -> Result<Vec<Slot>, StorageError> {
        Ok(self.slots.iter().map(|(slot, _)| slot.clone()).collect())
    }

    fn boot_slot(&self) -> Result<Option<Slot>, StorageError> {
        Ok(self.slot_at(unsafe { sys::esp_ota_get_boot_partition() }))
    }

    fn read(&self, slot: &Slot, offset: u64, buf: &mut [u8]) -> Result<(), StorageError> {
        check_bounds(slot, offset, buf.len() as u64)?;
        let part = self.partition(slot)?;
        let rc = unsafe {
            sys::esp_partition_read(part, offset as usize, buf.as_mut_ptr().cast(), buf.len())
        };
        EspError::convert(rc).map_err(|err| flash_error(slot, err))
    }

    fn erase(&mut self, slot: &Slot, offset: u64, len: u64) -> Result<(), StorageError> {
        check_bounds(slot, offset, len)?;
        if self.running_slot()?.label == slot.label {
            return Err(StorageError::Flash {
                slot: slot.label.clone(),
                reason: "refusing to erase the running slot".to_string(),
            });
        }
        let part = self.partition(slot)?;
        // Erase works on whole sectors.
        let len = len.div_ceil(FLASH_SECTOR) * FLASH_SECTOR;
        let len = len.min(slot.size - offset);
        let rc = unsafe { sys::esp_partition_erase_range(part, offset as usize, len as usize) };
        EspError::convert(rc).map_err(|err| flash_error(slot, err))
    }

    fn write(&mut self, slot: &Slot, offset: u64, data: &[u8]) -> Result<(), StorageError> {
        check_bounds(slot, offset, data.len() as u64)?;
        let part = self.partition(slot)?;
        let rc = unsafe {
            sys::esp_partition_write(part, offset as usize, data.as_ptr().cast(), data.len())
        };
        EspError::convert(rc).map_err(|err| flash_error(slot, err))
    }

    fn metadata(&self, slot: &Slot) -> Result<Option<SlotMetadata>, StorageError> {
        let part = self.partition(slot)?;
        let pos = sys::esp_partition_pos_t {
            offset: part.address,
            size: part.size,
        };
        let mut metadata = sys::esp_image_metadata_t::default();
        let rc = unsafe { sys::esp_image_get_metadata(&pos, &mut metadata) };
        if rc != sys::ESP_OK {
            warn!("slot {} holds no readable image header (esp_err_t={rc})", slot.label);
            return Ok(None);
        }
        Ok(Some(SlotMetadata {
            declared_length: u64::from(metadata.image_len),
        }))
    }

    fn mark_bootable(&mut self, slot: &Slot) -> Result<(), StorageError> {
        let part = self.partition(slot)?;
        let rc = unsafe { sys::esp_ota_set_boot_partition(part) };
        EspError::convert(rc).map_err(|err| flash_error(slot, err))
    }

    fn select_factory(&mut self) -> Result<(), StorageError> {
        let factory = self
            .factory_slot()?
            .ok_or_else(|| StorageError::SlotNotFound("factory".to_string()))?;
        self.mark_bootable(&factory)
    }

    fn erase_boot_selection(&mut self) -> Result<(), StorageError> {
        let otadata = unsafe {
            sys::esp_partition_find_first(
                sys::esp_partition_type_t_ESP_PARTITION_TYPE_DATA,
                sys::esp_partition_subtype_t_ESP_PARTITION_SUBTYPE_DATA_OTA,
                ptr::null(),
            )
        };
        if otadata.is_null() {
            return Err(StorageError::SlotNotFound("otadata".to_string()));
        }
        let size = unsafe { (*otadata).size } as usize;
        let rc = unsafe { sys::esp_partition_erase_range(otadata, 0, size) };
        EspError::convert(rc).map_err(|err| StorageError::Flash {
            slot: "otadata".to_string(),
            reason: err.to_string(),
        })
    }
}

/// Opens one `EspHttpConnection` per request with redirects left to the caller.
struct EspTransport {
    http: HttpClientConfig,
}

impl EspTransport {
    fn new(http: &HttpClientConfig) -> Self {
        Self { http: http.clone() }
    }
}

impl HttpTransport for EspTransport {
    fn get(
        &self,
        url: &str,
        headers: &[(&str, &str)],
    ) -> Result<Box<dyn HttpResponse>, TransportError> {
        let connect_error = |err: EspError| TransportError::Connect {
            url: url.to_string(),
            reason: err.to_string(),
        };

        let conf = HttpClientConfiguration {
            buffer_size: Some(self.http.header_buffer_bytes),
            buffer_size_tx: Some(self.http.header_buffer_bytes),
            timeout: Some(Duration::from_millis(self.http.timeout_ms)),
            follow_redirects_policy: FollowRedirectsPolicy::FollowNone,
            crt_bundle_attach: Some(esp_idf_svc::sys::esp_crt_bundle_attach),
            ..Default::default()
        };
        let mut conn = EspClientConnection::new(&conf).map_err(connect_error)?;
        conn.initiate_request(Method::Get, url, headers)
            .map_err(connect_error)?;
        conn.initiate_response().map_err(connect_error)?;
        Ok(Box::new(EspResponse { conn }))
    }
}

struct EspResponse {
    conn: EspClientConnection,
}

impl HttpResponse for EspResponse {
    fn status(&self) -> u16 {
        Status::status(&self.conn)
    }

    fn header(&self, name: &str) -> Option<String> {
        Headers::header(&self.conn, name).map(str::to_string)
    }

    fn read(&mut self, buf: &mut [u8]) -> Result<usize, TransportError> {
        Read::read(&mut self.conn, buf).map_err(|err| TransportError::Read(format!("{err:?}")))
    }
}
