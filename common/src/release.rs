use log::{info, warn};
use serde::{Deserialize, Serialize};

use crate::{
    config::{HttpClientConfig, ReleaseFeedConfig},
    error::{LifecycleError, LifecycleResult, ProtocolError},
    http::{is_success, open_following_redirects, read_body_bounded, HttpTransport},
};

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct ReleaseAsset {
    pub name: String,
    pub url: String,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct ReleaseDescriptor {
    pub tag: String,
    pub is_prerelease: bool,
    pub assets: Vec<ReleaseAsset>,
}

impl ReleaseDescriptor {
    pub fn asset_url(&self, name: &str) -> Option<&str> {
        self.assets
            .iter()
            .find(|asset| asset.name == name)
            .map(|asset| asset.url.as_str())
    }
}

/// A release whose image and signature assets were both found.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct ResolvedRelease {
    pub descriptor: ReleaseDescriptor,
    pub image_url: String,
    pub signature_url: String,
}

#[derive(Debug, Deserialize)]
struct ReleaseJson {
    tag_name: String,
    #[serde(default)]
    prerelease: bool,
    #[serde(default)]
    draft: bool,
    #[serde(default)]
    assets: Vec<AssetJson>,
}

#[derive(Debug, Deserialize)]
struct AssetJson {
    name: String,
    browser_download_url: String,
}

impl From<ReleaseJson> for ReleaseDescriptor {
    fn from(release: ReleaseJson) -> Self {
        Self {
            tag: release.tag_name,
            is_prerelease: release.prerelease,
            assets: release
                .assets
                .into_iter()
                .map(|asset| ReleaseAsset {
                    name: asset.name,
                    url: asset.browser_download_url,
                })
                .collect(),
        }
    }
}

pub struct ReleaseResolver<'a, T: HttpTransport + ?Sized> {
    transport: &'a T,
    feed: &'a ReleaseFeedConfig,
    http: &'a HttpClientConfig,
}

impl<'a, T: HttpTransport + ?Sized> ReleaseResolver<'a, T> {
    pub fn new(transport: &'a T, feed: &'a ReleaseFeedConfig, http: &'a HttpClientConfig) -> Self {
        Self {
            transport,
            feed,
            http,
        }
    }

    pub fn resolve(
        &self,
        repository: &str,
        prefer_prerelease: bool,
    ) -> LifecycleResult<ResolvedRelease> {
        let repository = repository.trim();
        let descriptor = if prefer_prerelease {
            self.newest_release(repository)?
        } else {
            self.newest_stable_release(repository)?
        };
        info!(
            "selected release {} (prerelease={}) from {repository}",
            descriptor.tag, descriptor.is_prerelease
        );
        self.with_assets(descriptor)
    }

    fn newest_release(&self, repository: &str) -> LifecycleResult<ReleaseDescriptor> {
        self.fetch_page(repository, 1)?
            .into_iter()
            .next()
            .ok_or_else(|| ProtocolError::EmptyReleaseList.into())
    }

    fn newest_stable_release(&self, repository: &str) -> LifecycleResult<ReleaseDescriptor> {
        match self.fetch_latest(repository) {
            Ok(release) if !release.is_prerelease => return Ok(release),
            Ok(release) => {
                warn!(
                    "latest release {} is flagged prerelease; scanning release list",
                    release.tag
                );
            }
            Err(err) => {
                warn!("latest release lookup failed ({err}); scanning release list");
            }
        }

        for page in 1..=self.feed.max_pages {
            let releases = self.fetch_page(repository, page)?;
            if releases.is_empty() {
                break;
            }
            if let Some(stable) = releases.into_iter().find(|r| !r.is_prerelease) {
                return Ok(stable);
            }
        }
        Err(ProtocolError::NoStableRelease.into())
    }

    fn fetch_latest(&self, repository: &str) -> LifecycleResult<ReleaseDescriptor> {
        let url = format!("{}/repos/{repository}/releases/latest", self.feed.api_base);
        let body = self.fetch_json(&url)?;
        let release: ReleaseJson = serde_json::from_slice(&body)
            .map_err(|err| ProtocolError::MalformedBody(err.to_string()))?;
        Ok(release.into())
    }

    /// Drafts are skipped; the feed lists newest first.
    fn fetch_page(&self, repository: &str, page: u8) -> LifecycleResult<Vec<ReleaseDescriptor>> {
        let mut url = format!(
            "{}/repos/{repository}/releases?per_page={}",
            self.feed.api_base, self.feed.per_page
        );
        if page > 1 {
            url.push_str(&format!("&page={page}"));
        }
        let body = self.fetch_json(&url)?;
        let releases: Vec<ReleaseJson> = serde_json::from_slice(&body)
            .map_err(|err| ProtocolError::MalformedBody(err.to_string()))?;
        Ok(releases
            .into_iter()
            .filter(|release| !release.draft)
            .map(ReleaseDescriptor::from)
            .collect())
    }

    fn fetch_json(&self, url: &str) -> LifecycleResult<Vec<u8>> {
        let headers = [
            ("User-Agent", self.http.user_agent.as_str()),
            ("Accept", "application/vnd.github+json"),
        ];
        let mut response =
            open_following_redirects(self.transport, url, &headers, self.http.max_redirects)?;
        let status = response.status();
        if !is_success(status) {
            warn!("release feed answered HTTP {status} for {url}");
            return Err(ProtocolError::UnexpectedStatus {
                url: url.to_string(),
                status,
            }
            .into());
        }
        read_body_bounded(response.as_mut(), self.feed.max_json_bytes)
    }

    fn with_assets(&self, descriptor: ReleaseDescriptor) -> LifecycleResult<ResolvedRelease> {
        let image = descriptor.asset_url(&self.feed.image_asset).map(str::to_string);
        let signature = descriptor
            .asset_url(&self.feed.signature_asset)
            .map(str::to_string);

        match (image, signature) {
            (Some(image_url), Some(signature_url)) => Ok(ResolvedRelease {
                descriptor,
                image_url,
                signature_url,
            }),
            (image, signature) => {
                let missing: Vec<&str> = [
                    image.is_none().then_some(self.feed.image_asset.as_str()),
                    signature.is_none().then_some(self.feed.signature_asset.as_str()),
                ]
                .into_iter()
                .flatten()
                .collect();
                Err(LifecycleError::Protocol(ProtocolError::MissingAssets {
                    tag: descriptor.tag,
                    missing: missing.join(", "),
                }))
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use pretty_assertions::assert_eq;

    use super::*;
    use crate::{
        error::TransportError,
        testing::{ScriptedResponse, ScriptedTransport},
    };

    const BASE: &str = "https://api.github.com/repos/acme/fw/releases";

    fn release_json(tag: &str, prerelease: bool) -> String {
        format!(
            r#"{{"tag_name":"{tag}","prerelease":{prerelease},"assets":[
                {{"name":"main.bin","browser_download_url":"https://dl.test/{tag}/main.bin"}},
                {{"name":"main.bin.sig","browser_download_url":"https://dl.test/{tag}/main.bin.sig"}}
            ]}}"#
        )
    }

    fn resolve(transport: &ScriptedTransport, prefer_prerelease: bool) -> LifecycleResult<ResolvedRelease> {
        let feed = ReleaseFeedConfig::default();
        let http = HttpClientConfig::default();
        ReleaseResolver::new(transport, &feed, &http).resolve("acme/fw", prefer_prerelease)
    }

    #[test]
    fn stable_mode_uses_latest_endpoint() {
        let transport = ScriptedTransport::new();
        transport.route(
            &format!("{BASE}/latest"),
            ScriptedResponse::json(&release_json("v1.4.0", false)),
        );

        let resolved = resolve(&transport, false).unwrap();
        assert_eq!(resolved.descriptor.tag, "v1.4.0");
        assert_eq!(resolved.image_url, "https://dl.test/v1.4.0/main.bin");
        assert_eq!(resolved.signature_url, "https://dl.test/v1.4.0/main.bin.sig");
        assert_eq!(transport.request_urls(), vec![format!("{BASE}/latest")]);

        let request = &transport.requests()[0];
        assert!(request
            .headers
            .contains(&("User-Agent".to_string(), "esp32-ota".to_string())));
    }

    #[test]
    fn stable_mode_skips_prereleases_in_list() {
        let transport = ScriptedTransport::new();
        transport.route(&format!("{BASE}/latest"), ScriptedResponse::status(404));
        transport.route(
            &format!("{BASE}?per_page=5"),
            ScriptedResponse::json(&format!(
                "[{},{}]",
                release_json("v2.0.0", true),
                release_json("v1.5.0", false)
            )),
        );

        let resolved = resolve(&transport, false).unwrap();
        assert_eq!(resolved.descriptor.tag, "v1.5.0");
        assert!(!resolved.descriptor.is_prerelease);
    }

    #[test]
    fn prerelease_latest_falls_back_to_list() {
        let transport = ScriptedTransport::new();
        transport.route(
            &format!("{BASE}/latest"),
            ScriptedResponse::json(&release_json("v3.0.0-beta", true)),
        );
        transport.route(
            &format!("{BASE}?per_page=5"),
            ScriptedResponse::json(&format!("[{}]", release_json("v2.9.1", false))),
        );

        assert_eq!(resolve(&transport, false).unwrap().descriptor.tag, "v2.9.1");
    }

    #[test]
    fn stable_scan_walks_a_second_page() {
        let transport = ScriptedTransport::new();
        transport.route(
            &format!("{BASE}?per_page=5"),
            ScriptedResponse::json(&format!("[{}]", release_json("v2.0.0", true))),
        );
        transport.route(
            &format!("{BASE}?per_page=5&page=2"),
            ScriptedResponse::json(&format!("[{}]", release_json("v1.0.0", false))),
        );

        assert_eq!(resolve(&transport, false).unwrap().descriptor.tag, "v1.0.0");
    }

    #[test]
    fn only_prereleases_means_no_stable_release() {
        let transport = ScriptedTransport::new();
        transport.route(
            &format!("{BASE}?per_page=5"),
            ScriptedResponse::json(&format!("[{}]", release_json("v2.0.0", true))),
        );
        transport.route(&format!("{BASE}?per_page=5&page=2"), ScriptedResponse::json("[]"));

        assert_eq!(
            resolve(&transport, false),
            Err(LifecycleError::Protocol(ProtocolError::NoStableRelease))
        );
    }

    #[test]
    fn prerelease_mode_takes_first_entry() {
        let transport = ScriptedTransport::new();
        transport.route(
            &format!("{BASE}?per_page=5"),
            ScriptedResponse::json(&format!(
                "[{},{}]",
                release_json("v2.0.0", true),
                release_json("v1.5.0", false)
            )),
        );

        let resolved = resolve(&transport, true).unwrap();
        assert_eq!(resolved.descriptor.tag, "v2.0.0");
        assert!(resolved.descriptor.is_prerelease);
    }

    #[test]
    fn prerelease_mode_with_empty_list() {
        let transport = ScriptedTransport::new();
        transport.route(&format!("{BASE}?per_page=5"), ScriptedResponse::json("[]"));
        assert_eq!(
            resolve(&transport, true),
            Err(LifecycleError::Protocol(ProtocolError::EmptyReleaseList))
        );
    }

    #[test]
    fn missing_signature_asset_is_reported() {
        let transport = ScriptedTransport::new();
        transport.route(
            &format!("{BASE}/latest"),
            ScriptedResponse::json(
                r#"{"tag_name":"v1.0.0","prerelease":false,"assets":[
                    {"name":"main.bin","browser_download_url":"https://dl.test/main.bin"}]}"#,
            ),
        );

        assert_eq!(
            resolve(&transport, false),
            Err(LifecycleError::Protocol(ProtocolError::MissingAssets {
                tag: "v1.0.0".to_string(),
                missing: "main.bin.sig".to_string(),
            }))
        );
    }

    #[test]
    fn malformed_list_body_is_a_protocol_error() {
        let transport = ScriptedTransport::new();
        transport.route(&format!("{BASE}?per_page=5"), ScriptedResponse::json("{not json"));
        assert!(matches!(
            resolve(&transport, true),
            Err(LifecycleError::Protocol(ProtocolError::MalformedBody(_)))
        ));
    }

    #[test]
    fn unreachable_feed_is_a_transport_error() {
        let transport = ScriptedTransport::new();
        assert!(matches!(
            resolve(&transport, true),
            Err(LifecycleError::Transport(TransportError::Connect { .. }))
        ));
    }
}
