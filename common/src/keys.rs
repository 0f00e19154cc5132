pub const NS_LIFECYCLE: &str = "lcm";
pub const KEY_RESTART_COUNT: &str = "restart_count";
pub const KEY_RESTART_TS: &str = "restart_ts";

pub const NS_FIRMWARE: &str = "fwcfg";
pub const KEY_REPOSITORY: &str = "repo";
pub const KEY_PRERELEASE: &str = "pre";
pub const KEY_INSTALLED_VERSION: &str = "installed_ver";
pub const KEY_INSTALLED_SLOT: &str = "installed_slot";

pub const NS_UPDATE: &str = "lcm_ota";
pub const KEY_UPDATE_INTENT: &str = "do_update";
pub const KEY_PENDING_ERASE: &str = "pending_erase";

pub const NS_WIFI: &str = "wifi_cfg";
pub const KEY_WIFI_SSID: &str = "wifi_ssid";
pub const KEY_WIFI_PASSWORD: &str = "wifi_password";
pub const KEY_MQTT_URL: &str = "mqtt_url";

/// NVS namespace and key names are limited to 15 bytes.
pub const MAX_KEY_LEN: usize = 15;
