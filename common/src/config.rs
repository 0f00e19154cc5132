use serde::{Deserialize, Serialize};

pub const DEFAULT_API_BASE: &str = "https://api.github.com";
pub const DEFAULT_USER_AGENT: &str = "esp32-ota";
pub const DEFAULT_IMAGE_ASSET: &str = "main.bin";
pub const DEFAULT_SIGNATURE_ASSET: &str = "main.bin.sig";

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct RestartCounterConfig {
    pub threshold_min: u32,
    pub count_cap: u32,
    pub reset_timeout_ms: u64,
    pub countdown_secs: u32,
}

impl Default for RestartCounterConfig {
    fn default() -> Self {
        Self {
            threshold_min: 10,
            count_cap: 12,
            reset_timeout_ms: 5_000,
            countdown_secs: 10,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ReleaseFeedConfig {
    pub api_base: String,
    pub per_page: u8,
    pub max_pages: u8,
    pub image_asset: String,
    pub signature_asset: String,
    pub max_json_bytes: usize,
}

impl Default for ReleaseFeedConfig {
    fn default() -> Self {
        Self {
            api_base: DEFAULT_API_BASE.to_string(),
            per_page: 5,
            max_pages: 2,
            image_asset: DEFAULT_IMAGE_ASSET.to_string(),
            signature_asset: DEFAULT_SIGNATURE_ASSET.to_string(),
            max_json_bytes: 256 * 1024,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct HttpClientConfig {
    pub header_buffer_bytes: usize,
    pub max_redirects: u8,
    pub timeout_ms: u64,
    pub user_agent: String,
}

impl Default for HttpClientConfig {
    fn default() -> Self {
        Self {
            header_buffer_bytes: 32 * 1024,
            max_redirects: 5,
            timeout_ms: 30_000,
            user_agent: DEFAULT_USER_AGENT.to_string(),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, Default)]
#[serde(rename_all = "snake_case")]
pub enum SignatureScheme {
    /// 48 byte SHA-384 digest followed by the image length as u32 big endian.
    #[default]
    Sha384Length,
    /// 64 byte Ed25519 signature over the SHA-384 digest, then the length.
    Ed25519,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct PipelineConfig {
    pub scheme: SignatureScheme,
    /// Hex encoded Ed25519 verifying key, only read for [`SignatureScheme::Ed25519`].
    #[serde(default)]
    pub public_key_hex: String,
    pub copy_chunk_size: usize,
    pub hash_chunk_size: usize,
    pub max_signature_bytes: usize,
    pub progress_step_pct: u8,
}

impl Default for PipelineConfig {
    fn default() -> Self {
        Self {
            scheme: SignatureScheme::Sha384Length,
            public_key_hex: String::new(),
            copy_chunk_size: 4096,
            hash_chunk_size: 4096,
            max_signature_bytes: 512,
            progress_step_pct: 10,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct FactoryResetConfig {
    pub erase_inactive_slots: bool,
    pub erase_wifi_credentials: bool,
}

impl Default for FactoryResetConfig {
    fn default() -> Self {
        Self {
            erase_inactive_slots: true,
            erase_wifi_credentials: true,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize, Default)]
pub struct LifecycleConfig {
    #[serde(default)]
    pub restart_counter: RestartCounterConfig,
    #[serde(default)]
    pub release_feed: ReleaseFeedConfig,
    #[serde(default)]
    pub http: HttpClientConfig,
    #[serde(default)]
    pub pipeline: PipelineConfig,
    #[serde(default)]
    pub factory_reset: FactoryResetConfig,
}

impl LifecycleConfig {
    pub fn sanitize(&mut self) {
        self.restart_counter.sanitize();
        self.release_feed.sanitize();
        self.http.sanitize();
        self.pipeline.sanitize();
    }
}

impl RestartCounterConfig {
    pub fn sanitize(&mut self) {
        self.threshold_min = self.threshold_min.max(1);
        self.count_cap = self.count_cap.max(self.threshold_min);
        self.reset_timeout_ms = self.reset_timeout_ms.max(1);
        self.countdown_secs = self.countdown_secs.min(60);
    }
}

impl ReleaseFeedConfig {
    pub fn sanitize(&mut self) {
        let trimmed = self.api_base.trim().trim_end_matches('/');
        self.api_base = if trimmed.is_empty() {
            DEFAULT_API_BASE.to_string()
        } else {
            trimmed.to_string()
        };

        self.per_page = self.per_page.clamp(1, 100);
        self.max_pages = self.max_pages.clamp(1, 10);

        if self.image_asset.trim().is_empty() {
            self.image_asset = DEFAULT_IMAGE_ASSET.to_string();
        }
        if self.signature_asset.trim().is_empty() {
            self.signature_asset = DEFAULT_SIGNATURE_ASSET.to_string();
        }

        self.max_json_bytes = self.max_json_bytes.clamp(4 * 1024, 1024 * 1024);
    }
}

impl HttpClientConfig {
    pub fn sanitize(&mut self) {
        // Asset redirects carry very long signed Location headers.
        self.header_buffer_bytes = self.header_buffer_bytes.clamp(32 * 1024, 64 * 1024);
        self.max_redirects = self.max_redirects.min(10);
        self.timeout_ms = self.timeout_ms.clamp(1_000, 120_000);
        if self.user_agent.trim().is_empty() {
            self.user_agent = DEFAULT_USER_AGENT.to_string();
        }
    }
}

impl PipelineConfig {
    pub fn sanitize(&mut self) {
        self.copy_chunk_size = self.copy_chunk_size.clamp(512, 16 * 1024);
        self.hash_chunk_size = self.hash_chunk_size.clamp(512, 16 * 1024);
        self.max_signature_bytes = self.max_signature_bytes.clamp(128, 4096);
        self.progress_step_pct = self.progress_step_pct.clamp(1, 100);
        self.public_key_hex = self.public_key_hex.trim().to_ascii_lowercase();
    }
}

#[cfg(test)]
mod tests {
    use pretty_assertions::assert_eq;

    use super::*;

    #[test]
    fn defaults_match_the_field_constants() {
        let config = LifecycleConfig::default();
        assert_eq!(config.restart_counter.threshold_min, 10);
        assert_eq!(config.restart_counter.count_cap, 12);
        assert_eq!(config.restart_counter.reset_timeout_ms, 5_000);
        assert_eq!(config.http.header_buffer_bytes, 32_768);
        assert_eq!(config.http.max_redirects, 5);
        assert_eq!(config.release_feed.image_asset, "main.bin");
        assert_eq!(config.release_feed.signature_asset, "main.bin.sig");
    }

    #[test]
    fn sanitize_keeps_cap_at_or_above_threshold() {
        let mut config = RestartCounterConfig {
            threshold_min: 0,
            count_cap: 0,
            reset_timeout_ms: 0,
            countdown_secs: 600,
        };
        config.sanitize();
        assert_eq!(config.threshold_min, 1);
        assert_eq!(config.count_cap, 1);
        assert_eq!(config.reset_timeout_ms, 1);
        assert_eq!(config.countdown_secs, 60);
    }

    #[test]
    fn sanitize_restores_feed_defaults() {
        let mut feed = ReleaseFeedConfig {
            api_base: "https://ghe.example.com/api/v3/ ".to_string(),
            per_page: 0,
            max_pages: 50,
            image_asset: " ".to_string(),
            signature_asset: String::new(),
            max_json_bytes: 1,
        };
        feed.sanitize();
        assert_eq!(feed.api_base, "https://ghe.example.com/api/v3");
        assert_eq!(feed.per_page, 1);
        assert_eq!(feed.max_pages, 10);
        assert_eq!(feed.image_asset, "main.bin");
        assert_eq!(feed.signature_asset, "main.bin.sig");
        assert_eq!(feed.max_json_bytes, 4096);
    }

    #[test]
    fn header_buffer_never_drops_below_redirect_minimum() {
        let mut http = HttpClientConfig {
            header_buffer_bytes: 1024,
            ..HttpClientConfig::default()
        };
        http.sanitize();
        assert_eq!(http.header_buffer_bytes, 32 * 1024);
    }

    #[test]
    fn partial_json_fills_in_defaults() {
        let config: LifecycleConfig =
            serde_json::from_str(r#"{"pipeline":{"scheme":"ed25519","public_key_hex":"AB","copy_chunk_size":4096,"hash_chunk_size":4096,"max_signature_bytes":512,"progress_step_pct":10}}"#)
                .unwrap();
        assert_eq!(config.pipeline.scheme, SignatureScheme::Ed25519);
        assert_eq!(config.restart_counter, RestartCounterConfig::default());
    }
}
