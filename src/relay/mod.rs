//! Device registration and settings uploads to the push relay.
//!
//! Each upload kind keeps at most one pending payload in the key-value store.
//! A payload stays pending until the relay answers 2xx, so a crash or a run of
//! failed attempts is picked up again by the next [`RelayUploader::flush_if_needed`].

mod silent_push;

pub use silent_push::SilentPushHandler;

use crate::db::Database;
use crate::errors::{AppError, AppResult};
use crate::install_id::install_id;
use crate::models::Preference;
use crate::settings::SchedulerSettings;
use chrono::{Local, NaiveTime, Timelike, Utc};
use serde::{Deserialize, Serialize};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use tokio::time::Duration;

const LAST_SENT_DEVICE_TOKEN_KEY: &str = "relay.last_sent_device_token";

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct DeviceRegistration {
    pub install_id: String,
    pub device_token: String,
    pub is_notification_enabled: bool,
    pub platform: String,
    pub app_version: String,
    pub sent_at: String,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct DeviceSettingsUpload {
    pub install_id: String,
    pub is_notification_enabled: bool,
    pub start_minutes: u32,
    pub end_minutes: u32,
    pub time_zone: String,
    pub platform: String,
    pub app_version: String,
    pub sent_at: String,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum UploadKind {
    DeviceRegistration,
    DeviceSettings,
}

impl UploadKind {
    pub fn as_str(self) -> &'static str {
        match self {
            Self::DeviceRegistration => "device-registration",
            Self::DeviceSettings => "device-settings",
        }
    }

    fn pending_key(self) -> &'static str {
        match self {
            Self::DeviceRegistration => "relay.pending_device_registration",
            Self::DeviceSettings => "relay.pending_device_settings",
        }
    }

    fn endpoint(self) -> &'static str {
        match self {
            Self::DeviceRegistration => "/api/device/register",
            Self::DeviceSettings => "/api/device/settings",
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FlushOutcome {
    NothingPending,
    Delivered { attempts: u32 },
    /// Registration for a token the relay already has; the pending copy is dropped.
    AlreadyDelivered,
    /// Another flush for the same kind is running.
    Busy,
    /// No relay base URL configured; the payload stays pending.
    NotConfigured,
    /// Every attempt failed; the payload stays pending.
    GaveUp { attempts: u32 },
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RetryPolicy {
    pub attempts: u32,
    pub base_delay: Duration,
    pub max_jitter: Duration,
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self {
            attempts: 5,
            base_delay: Duration::from_secs(1),
            max_jitter: Duration::from_millis(300),
        }
    }
}

impl RetryPolicy {
    /// Wait before attempt `attempt + 1`, doubling from `base_delay`.
    pub fn delay_after(&self, attempt: u32) -> Duration {
        let backoff = self.base_delay.saturating_mul(1u32 << attempt.saturating_sub(1).min(16));
        let jitter_ms = self.max_jitter.as_millis() as u64;
        let jitter = if jitter_ms == 0 {
            0
        } else {
            rand::random_range(0..=jitter_ms)
        };
        backoff + Duration::from_millis(jitter)
    }
}

/// Delivers one kind of payload with persisted pending state and bounded retries.
pub struct RelayUploader {
    db: Arc<Database>,
    kind: UploadKind,
    client: reqwest::Client,
    policy: RetryPolicy,
    sending: AtomicBool,
}

impl RelayUploader {
    pub fn new(db: Arc<Database>, kind: UploadKind, client: reqwest::Client, policy: RetryPolicy) -> Self {
        Self {
            db,
            kind,
            client,
            policy,
            sending: AtomicBool::new(false),
        }
    }

    pub fn kind(&self) -> UploadKind {
        self.kind
    }

    pub fn pending(&self) -> AppResult<Option<serde_json::Value>> {
        let Some(raw) = self.db.kv_get(self.kind.pending_key())? else {
            return Ok(None);
        };
        match serde_json::from_str(&raw) {
            Ok(value) => Ok(Some(value)),
            Err(error) => {
                tracing::warn!(kind = self.kind.as_str(), error = %error, "dropping unreadable pending payload");
                self.db.kv_remove(self.kind.pending_key())?;
                Ok(None)
            }
        }
    }

    /// Replace the pending payload without sending it.
    pub fn queue<P: Serialize>(&self, payload: &P) -> AppResult<()> {
        let raw = serde_json::to_string(payload)?;
        self.db.kv_set(self.kind.pending_key(), &raw)?;
        tracing::info!(kind = self.kind.as_str(), "upload queued");
        Ok(())
    }

    /// Replace the pending payload, then try to deliver it.
    pub async fn upsert<P: Serialize>(&self, payload: &P) -> AppResult<FlushOutcome> {
        self.queue(payload)?;
        self.flush_if_needed().await
    }

    pub async fn flush_if_needed(&self) -> AppResult<FlushOutcome> {
        if self
            .sending
            .compare_exchange(false, true, Ordering::AcqRel, Ordering::Acquire)
            .is_err()
        {
            return Ok(FlushOutcome::Busy);
        }
        let outcome = self.flush_pending().await;
        self.sending.store(false, Ordering::Release);
        outcome
    }

    async fn flush_pending(&self) -> AppResult<FlushOutcome> {
        let Some(payload) = self.pending()? else {
            return Ok(FlushOutcome::NothingPending);
        };

        let device_token = match self.kind {
            UploadKind::DeviceRegistration => payload
                .get("deviceToken")
                .and_then(serde_json::Value::as_str)
                .map(str::to_string),
            UploadKind::DeviceSettings => None,
        };
        if let Some(token) = device_token.as_deref() {
            if self.db.kv_get(LAST_SENT_DEVICE_TOKEN_KEY)?.as_deref() == Some(token) {
                tracing::info!(kind = self.kind.as_str(), "device token already delivered");
                self.db.kv_remove(self.kind.pending_key())?;
                return Ok(FlushOutcome::AlreadyDelivered);
            }
        }

        let settings = self.db.get_scheduler_settings()?;
        let Some(base_url) = settings.relay_base_url.as_deref().filter(|url| !url.trim().is_empty()) else {
            tracing::info!(kind = self.kind.as_str(), "relay not configured; upload stays pending");
            return Ok(FlushOutcome::NotConfigured);
        };
        let url = format!("{}{}", base_url.trim_end_matches('/'), self.kind.endpoint());

        for attempt in 1..=self.policy.attempts {
            match self.send(&url, &payload, settings.relay_timeout()).await {
                Ok(()) => {
                    if let Some(token) = device_token.as_deref() {
                        self.db.kv_set(LAST_SENT_DEVICE_TOKEN_KEY, token)?;
                    }
                    self.db.kv_remove(self.kind.pending_key())?;
                    tracing::info!(kind = self.kind.as_str(), attempt, "upload delivered");
                    return Ok(FlushOutcome::Delivered { attempts: attempt });
                }
                Err(error) => {
                    tracing::warn!(kind = self.kind.as_str(), attempt, error = %error, "upload attempt failed");
                }
            }

            if attempt < self.policy.attempts {
                tokio::time::sleep(self.policy.delay_after(attempt)).await;
            }
        }

        tracing::warn!(
            kind = self.kind.as_str(),
            attempts = self.policy.attempts,
            "upload gave up; payload kept for next flush"
        );
        Ok(FlushOutcome::GaveUp {
            attempts: self.policy.attempts,
        })
    }

    async fn send(&self, url: &str, payload: &serde_json::Value, timeout: Duration) -> AppResult<()> {
        let response = self.client.post(url).timeout(timeout).json(payload).send().await?;
        let status = response.status();
        if status.is_success() {
            return Ok(());
        }
        Err(AppError::Upload(format!("relay answered {}", status)))
    }
}

/// Builds relay payloads from local state and hands them to the two uploaders.
pub struct DeviceRelay {
    db: Arc<Database>,
    registration: RelayUploader,
    settings: RelayUploader,
}

impl DeviceRelay {
    pub fn new(db: Arc<Database>, policy: RetryPolicy) -> Self {
        let client = reqwest::Client::new();
        Self {
            registration: RelayUploader::new(db.clone(), UploadKind::DeviceRegistration, client.clone(), policy.clone()),
            settings: RelayUploader::new(db.clone(), UploadKind::DeviceSettings, client, policy),
            db,
        }
    }

    pub fn registration(&self) -> &RelayUploader {
        &self.registration
    }

    pub fn settings_uploader(&self) -> &RelayUploader {
        &self.settings
    }

    pub fn build_registration(&self, device_token: &str, is_notification_enabled: bool) -> AppResult<DeviceRegistration> {
        let settings = self.db.get_scheduler_settings()?;
        Ok(DeviceRegistration {
            install_id: install_id(&self.db)?,
            device_token: device_token.to_string(),
            is_notification_enabled,
            platform: settings.platform,
            app_version: settings.app_version,
            sent_at: Utc::now().to_rfc3339(),
        })
    }

    pub fn build_settings_upload(&self, pref: &Preference) -> AppResult<DeviceSettingsUpload> {
        let settings: SchedulerSettings = self.db.get_scheduler_settings()?;
        let (start_minutes, end_minutes) = window_minutes(pref.quiet_hours_start, pref.quiet_hours_end);
        Ok(DeviceSettingsUpload {
            install_id: install_id(&self.db)?,
            is_notification_enabled: pref.is_notification_enabled,
            start_minutes,
            end_minutes,
            time_zone: local_time_zone(),
            platform: settings.platform,
            app_version: settings.app_version,
            sent_at: Utc::now().to_rfc3339(),
        })
    }

    pub async fn register_device(&self, device_token: &str, is_notification_enabled: bool) -> AppResult<FlushOutcome> {
        let payload = self.build_registration(device_token, is_notification_enabled)?;
        self.registration.upsert(&payload).await
    }

    pub async fn upload_settings(&self, pref: &Preference) -> AppResult<FlushOutcome> {
        let payload = self.build_settings_upload(pref)?;
        self.settings.upsert(&payload).await
    }

    pub fn queue_settings(&self, pref: &Preference) -> AppResult<()> {
        let payload = self.build_settings_upload(pref)?;
        self.settings.queue(&payload)
    }

    /// Retry whatever is still pending for both kinds.
    pub async fn flush_if_needed(&self) {
        for uploader in [&self.registration, &self.settings] {
            if let Err(error) = uploader.flush_if_needed().await {
                tracing::warn!(kind = uploader.kind().as_str(), error = %error, "upload flush failed");
            }
        }
    }
}

/// Minutes of day for the alert window; no window means the whole day.
pub fn window_minutes(start: Option<NaiveTime>, end: Option<NaiveTime>) -> (u32, u32) {
    match (start, end) {
        (Some(start), Some(end)) => (start.hour() * 60 + start.minute(), end.hour() * 60 + end.minute()),
        _ => (0, 24 * 60),
    }
}

fn local_time_zone() -> String {
    std::env::var("TZ")
        .ok()
        .filter(|zone| !zone.trim().is_empty())
        .unwrap_or_else(|| Local::now().format("%:z").to_string())
}
