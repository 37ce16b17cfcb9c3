use serde::{Deserialize, Serialize};
use std::time::Duration;

pub const DEFAULT_TASK_IDENTIFIER: &str = "bnz.stepmon.stepcheck.refresh";

/// Tunables for the background scheduler and its collaborators. Stored as JSON
/// in the `settings` table under the `scheduler` key.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase", default)]
pub struct SchedulerSettings {
    pub task_identifier: String,
    pub earliest_begin_minutes: u32,
    pub submit_throttle_seconds: u64,
    pub background_resubmit_guard_minutes: u32,
    pub safety_timeout_seconds: u64,
    pub history_cap: u32,
    /// Only alert inside the preference's time-of-day window.
    pub quiet_hours_gating: bool,
    pub notify_on_unavailable_measurement: bool,
    pub notification_cooldown_seconds: u64,
    pub relay_base_url: Option<String>,
    pub relay_timeout_seconds: u64,
    pub platform: String,
    pub app_version: String,
}

impl Default for SchedulerSettings {
    fn default() -> Self {
        Self {
            task_identifier: DEFAULT_TASK_IDENTIFIER.to_string(),
            earliest_begin_minutes: 15,
            submit_throttle_seconds: 30,
            background_resubmit_guard_minutes: 12,
            safety_timeout_seconds: 25,
            history_cap: 30,
            quiet_hours_gating: false,
            notify_on_unavailable_measurement: true,
            notification_cooldown_seconds: 0,
            relay_base_url: None,
            relay_timeout_seconds: 8,
            platform: "ios".to_string(),
            app_version: env!("CARGO_PKG_VERSION").to_string(),
        }
    }
}

impl SchedulerSettings {
    pub fn earliest_begin(&self) -> chrono::Duration {
        chrono::Duration::minutes(i64::from(self.earliest_begin_minutes))
    }

    pub fn submit_throttle(&self) -> chrono::Duration {
        chrono::Duration::seconds(self.submit_throttle_seconds as i64)
    }

    pub fn background_resubmit_guard(&self) -> chrono::Duration {
        chrono::Duration::minutes(i64::from(self.background_resubmit_guard_minutes))
    }

    pub fn notification_cooldown(&self) -> chrono::Duration {
        chrono::Duration::seconds(self.notification_cooldown_seconds as i64)
    }

    pub fn safety_timeout(&self) -> Duration {
        Duration::from_secs(self.safety_timeout_seconds)
    }

    pub fn relay_timeout(&self) -> Duration {
        Duration::from_secs(self.relay_timeout_seconds)
    }
}

#[cfg(test)]
mod tests {
    use super::SchedulerSettings;
    use serde_json::json;

    #[test]
    fn partial_json_falls_back_to_defaults() {
        let settings: SchedulerSettings =
            serde_json::from_value(json!({ "historyCap": 100, "quietHoursGating": true })).expect("parse");
        assert_eq!(settings.history_cap, 100);
        assert!(settings.quiet_hours_gating);
        assert_eq!(settings.earliest_begin_minutes, 15);
        assert_eq!(settings.safety_timeout_seconds, 25);
    }
}
