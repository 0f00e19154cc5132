use std::sync::{Arc, Mutex, MutexGuard, PoisonError};

use chrono::Utc;
use ed25519_dalek::VerifyingKey;
use log::{error, info, warn};
use serde::Serialize;

use crate::{
    config::{HttpClientConfig, PipelineConfig},
    error::{IntegrityError, LifecycleError, LifecycleResult, ProtocolError, StateError},
    http::{
        content_length, is_success, open_following_redirects, read_body_bounded, HttpTransport,
        HEADER_CONTENT_TYPE,
    },
    platform::{IndicatorGuard, Platform},
    records::{InstalledVersionRecord, UpdateIntent},
    slot::{Slot, SlotStore},
    store::ConfigStore,
    verify::{digest_slot, SignatureArtifact},
};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum UpdatePhase {
    #[default]
    Idle,
    Checking,
    DownloadingSignature,
    Erasing,
    Writing,
    Verifying,
    Committing,
    Rebooting,
    Failed,
}

/// Progress of the current or last update, read by the status endpoints.
#[derive(Debug, Clone, Default, Serialize)]
pub struct UpdateStatus {
    pub in_progress: bool,
    pub phase: UpdatePhase,
    pub target_version: Option<String>,
    pub target_slot: Option<String>,
    pub bytes_written: u64,
    pub total_bytes: Option<u64>,
    pub progress_pct: Option<u8>,
    pub last_error: Option<String>,
    pub last_digest: Option<String>,
    pub last_installed_version: Option<String>,
    pub last_completed_epoch: Option<i64>,
}

pub type SharedStatus = Arc<Mutex<UpdateStatus>>;

pub fn lock_status(status: &SharedStatus) -> MutexGuard<'_, UpdateStatus> {
    status.lock().unwrap_or_else(PoisonError::into_inner)
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct InstalledImage {
    pub version: String,
    pub slot_label: String,
    pub bytes_written: u64,
    pub digest_hex: String,
}

const ACCEPT_BINARY: &str = "application/octet-stream";

pub struct ImagePipeline<'a, C: ?Sized, S: ?Sized, T: ?Sized, P: ?Sized> {
    pub store: &'a C,
    pub slots: &'a mut S,
    pub transport: &'a T,
    pub platform: &'a P,
    pub http: &'a HttpClientConfig,
    pub config: &'a PipelineConfig,
    pub verifying_key: Option<&'a VerifyingKey>,
    pub status: &'a SharedStatus,
}

impl<C, S, T, P> ImagePipeline<'_, C, S, T, P>
where
    C: ConfigStore,
    S: SlotStore + ?Sized,
    T: HttpTransport + ?Sized,
    P: Platform + ?Sized,
{
    /// Streams the image into the inactive slot and verifies it. On success
    /// the slot is bootable and the caller must restart; on failure the
    /// running image stays selected.
    pub fn install(
        &mut self,
        image_url: &str,
        signature_url: &str,
        expected_version: &str,
    ) -> LifecycleResult<InstalledImage> {
        let _indicator = IndicatorGuard::start(self.platform);
        {
            let mut status = lock_status(self.status);
            status.in_progress = true;
            status.phase = UpdatePhase::DownloadingSignature;
            status.target_version = Some(expected_version.to_string());
            status.target_slot = None;
            status.bytes_written = 0;
            status.total_bytes = None;
            status.progress_pct = None;
            status.last_error = None;
        }

        let result = self.run(image_url, signature_url, expected_version);

        let mut status = lock_status(self.status);
        status.in_progress = false;
        status.last_completed_epoch = Some(Utc::now().timestamp());
        match &result {
            Ok(image) => {
                status.phase = UpdatePhase::Rebooting;
                status.progress_pct = Some(100);
                status.last_digest = Some(image.digest_hex.clone());
                status.last_installed_version = Some(image.version.clone());
            }
            Err(err) => {
                status.phase = UpdatePhase::Failed;
                status.last_error = Some(err.to_string());
            }
        }
        result
    }

    fn run(
        &mut self,
        image_url: &str,
        signature_url: &str,
        expected_version: &str,
    ) -> LifecycleResult<InstalledImage> {
        let artifact = self.fetch_signature(signature_url)?;
        info!(
            "signature artifact accepted, image declares {} bytes",
            artifact.declared_length()
        );

        let running = self.slots.running_slot()?;
        let target = self
            .slots
            .find_inactive_slot()?
            .ok_or(StateError::NoInactiveSlot)?;
        if target.label == running.label {
            return Err(StateError::RunningSlot(target.label).into());
        }
        if artifact.declared_length() > target.size {
            return Err(ProtocolError::ImageTooLarge {
                capacity: target.size,
            }
            .into());
        }
        lock_status(self.status).target_slot = Some(target.label.clone());
        info!(
            "running from {}, writing {} into {}",
            running.label, expected_version, target.label
        );

        let written = self.copy_image(image_url, &target)?;

        self.set_phase(UpdatePhase::Verifying);
        let declared = self
            .slots
            .metadata(&target)?
            .ok_or_else(|| IntegrityError::MissingImageHeader(target.label.clone()))?
            .declared_length;
        if declared != artifact.declared_length() {
            error!(
                "image length mismatch in {}: header says {declared}, signature says {}, downloaded {written}",
                target.label,
                artifact.declared_length()
            );
            return Err(IntegrityError::LengthMismatch {
                declared,
                expected: artifact.declared_length(),
            }
            .into());
        }

        let digest = digest_slot(
            &*self.slots,
            &target,
            declared,
            self.config.hash_chunk_size,
            self.platform,
        )?;
        if let Err(err) = artifact.verify(&digest, self.verifying_key) {
            error!("refusing image in {}: {err}", target.label);
            return Err(err.into());
        }
        let digest_hex = hex::encode(digest);
        info!("image in {} verified, sha384={digest_hex}", target.label);

        self.set_phase(UpdatePhase::Committing);
        self.commit(&target, expected_version)?;

        Ok(InstalledImage {
            version: expected_version.to_string(),
            slot_label: target.label,
            bytes_written: written,
            digest_hex,
        })
    }

    fn fetch_signature(&self, url: &str) -> LifecycleResult<SignatureArtifact> {
        let headers = [
            ("User-Agent", self.http.user_agent.as_str()),
            ("Accept", ACCEPT_BINARY),
        ];
        let mut response =
            open_following_redirects(self.transport, url, &headers, self.http.max_redirects)?;
        let status = response.status();
        if !is_success(status) {
            warn!("signature download failed with HTTP {status}");
            return Err(ProtocolError::UnexpectedStatus {
                url: url.to_string(),
                status,
            }
            .into());
        }

        // An HTML error page or API JSON in place of the artifact.
        if let Some(content_type) = response.header(HEADER_CONTENT_TYPE) {
            let lowered = content_type.to_ascii_lowercase();
            if lowered.starts_with("text/") || lowered.contains("json") {
                warn!("signature download returned content type {content_type}");
                return Err(ProtocolError::UnexpectedContentType(content_type).into());
            }
        }

        let raw = read_body_bounded(&mut *response, self.config.max_signature_bytes)?;
        SignatureArtifact::parse(self.config.scheme, &raw).map_err(|err| {
            warn!("signature artifact rejected ({} bytes): {err}", raw.len());
            LifecycleError::from(err)
        })
    }

    fn copy_image(&mut self, url: &str, target: &Slot) -> LifecycleResult<u64> {
        let headers = [
            ("User-Agent", self.http.user_agent.as_str()),
            ("Accept", ACCEPT_BINARY),
        ];
        // The whole redirect chain resolves before the slot is touched.
        let mut response =
            open_following_redirects(self.transport, url, &headers, self.http.max_redirects)?;
        let status = response.status();
        if !is_success(status) {
            warn!("image download failed with HTTP {status}");
            return Err(ProtocolError::UnexpectedStatus {
                url: url.to_string(),
                status,
            }
            .into());
        }

        let total = content_length(&*response);
        if total.is_some_and(|total| total > target.size) {
            return Err(ProtocolError::ImageTooLarge {
                capacity: target.size,
            }
            .into());
        }

        self.set_phase(UpdatePhase::Erasing);
        self.platform.feed_watchdog();
        self.slots.erase(target, 0, target.size)?;
        self.platform.feed_watchdog();

        {
            let mut status = lock_status(self.status);
            status.phase = UpdatePhase::Writing;
            status.total_bytes = total;
        }

        let mut chunk = vec![0_u8; self.config.copy_chunk_size];
        let mut written = 0_u64;
        let mut next_report = self.config.progress_step_pct;
        loop {
            let read = response.read(&mut chunk)?;
            if read == 0 {
                break;
            }
            if written + read as u64 > target.size {
                return Err(ProtocolError::ImageTooLarge {
                    capacity: target.size,
                }
                .into());
            }

            self.slots.write(target, written, &chunk[..read])?;
            written += read as u64;
            self.platform.feed_watchdog();

            let pct = total
                .filter(|total| *total > 0)
                .map(|total| (written.saturating_mul(100) / total).min(100) as u8);
            {
                let mut status = lock_status(self.status);
                status.bytes_written = written;
                status.progress_pct = pct;
            }
            if let Some(pct) = pct {
                if pct >= next_report {
                    info!("download progress {pct}% ({written} bytes)");
                    next_report = pct
                        .saturating_add(self.config.progress_step_pct)
                        .min(100);
                }
            }
        }

        if written == 0 {
            return Err(ProtocolError::EmptyImage.into());
        }
        info!("wrote {written} bytes into {}", target.label);
        Ok(written)
    }

    fn commit(&mut self, target: &Slot, version: &str) -> LifecycleResult<()> {
        let previous = InstalledVersionRecord::load(self.store).unwrap_or_else(|err| {
            warn!("could not read installed version record: {err}");
            None
        });
        let intent_was_set = UpdateIntent::is_set(self.store).unwrap_or(false);

        let record = InstalledVersionRecord {
            version: version.to_string(),
            slot_label: Some(target.label.clone()),
        };
        if let Err(err) = record.save(self.store) {
            warn!("failed to persist installed version {version}: {err}");
        }
        if intent_was_set {
            if let Err(err) = UpdateIntent::clear(self.store) {
                warn!("failed to clear update intent: {err}");
            }
        }

        if let Err(err) = self.slots.mark_bootable(target) {
            error!("marking {} bootable failed: {err}", target.label);
            if let Err(err) = InstalledVersionRecord::restore(previous.as_ref(), self.store) {
                warn!("failed to roll back installed version record: {err}");
            }
            if intent_was_set {
                if let Err(err) = UpdateIntent::set(self.store) {
                    warn!("failed to restore update intent: {err}");
                }
            }
            return Err(err.into());
        }
        Ok(())
    }

    fn set_phase(&self, phase: UpdatePhase) {
        lock_status(self.status).phase = phase;
    }
}
