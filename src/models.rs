use chrono::{DateTime, Duration, NaiveTime, Utc};
use serde::{Deserialize, Serialize};
use std::fmt;

/// Look-back window length offered in settings.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(try_from = "u32", into = "u32")]
pub enum CheckInterval {
    Fifteen,
    Thirty,
    #[default]
    Sixty,
    Ninety,
    OneTwenty,
}

impl CheckInterval {
    pub const ALL: [CheckInterval; 5] = [
        Self::Fifteen,
        Self::Thirty,
        Self::Sixty,
        Self::Ninety,
        Self::OneTwenty,
    ];

    pub fn minutes(self) -> u32 {
        match self {
            Self::Fifteen => 15,
            Self::Thirty => 30,
            Self::Sixty => 60,
            Self::Ninety => 90,
            Self::OneTwenty => 120,
        }
    }

    pub fn from_minutes(minutes: u32) -> Option<Self> {
        Self::ALL.into_iter().find(|interval| interval.minutes() == minutes)
    }

    pub fn duration(self) -> Duration {
        Duration::minutes(i64::from(self.minutes()))
    }
}

impl TryFrom<u32> for CheckInterval {
    type Error = String;

    fn try_from(value: u32) -> Result<Self, Self::Error> {
        Self::from_minutes(value).ok_or_else(|| format!("unsupported check interval: {} minutes", value))
    }
}

impl From<CheckInterval> for u32 {
    fn from(value: CheckInterval) -> Self {
        value.minutes()
    }
}

/// Who triggered a check.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum CheckSource {
    Foreground,
    BackgroundTask,
    SilentPush,
}

impl CheckSource {
    pub fn as_str(self) -> &'static str {
        match self {
            Self::Foreground => "foreground",
            Self::BackgroundTask => "background-task",
            Self::SilentPush => "silent-push",
        }
    }

    pub fn parse(raw: &str) -> Option<Self> {
        match raw {
            "foreground" => Some(Self::Foreground),
            "background-task" => Some(Self::BackgroundTask),
            "silent-push" => Some(Self::SilentPush),
            _ => None,
        }
    }
}

impl fmt::Display for CheckSource {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Why a schedule request was made.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum ScheduleOrigin {
    ForegroundActive,
    AppLaunch,
    BackgroundTransition,
    PostRunRelay,
}

impl ScheduleOrigin {
    pub fn as_str(self) -> &'static str {
        match self {
            Self::ForegroundActive => "foreground-active",
            Self::AppLaunch => "app-launch",
            Self::BackgroundTransition => "background-transition",
            Self::PostRunRelay => "post-run-relay",
        }
    }

    /// Origins that fire while the app is leaving or outside the foreground.
    pub fn is_background(self) -> bool {
        matches!(self, Self::BackgroundTransition | Self::PostRunRelay)
    }
}

impl fmt::Display for ScheduleOrigin {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum TaskState {
    Idle,
    Scheduled,
    Running,
}

impl TaskState {
    pub fn as_str(self) -> &'static str {
        match self {
            Self::Idle => "idle",
            Self::Scheduled => "scheduled",
            Self::Running => "running",
        }
    }
}

/// Result of a pedometer query. The sensor being unavailable is kept distinct
/// from a genuine zero so callers can decide how to treat it.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum StepMeasurement {
    Counted(u32),
    Unavailable,
}

impl StepMeasurement {
    pub fn steps(self) -> u32 {
        match self {
            Self::Counted(steps) => steps,
            Self::Unavailable => 0,
        }
    }

    pub fn is_available(self) -> bool {
        matches!(self, Self::Counted(_))
    }
}

/// Which signal ended a background run.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum CompletionPath {
    Finished,
    Expired,
    SafetyTimeout,
}

impl CompletionPath {
    pub fn as_str(self) -> &'static str {
        match self {
            Self::Finished => "finished",
            Self::Expired => "expired",
            Self::SafetyTimeout => "safety-timeout",
        }
    }
}

impl fmt::Display for CompletionPath {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ScheduleDecision {
    /// Refused because the previous attempt is too recent.
    Throttled,
    /// Refused by the background resubmit guard.
    Guarded,
    /// A request for the task is already queued with the OS.
    AlreadyPending { pending: usize },
    Submitted { earliest_begin: DateTime<Utc> },
    Failed { reason: String },
}

impl ScheduleDecision {
    /// True when a wake request is known to be queued after this decision.
    pub fn leaves_request_pending(&self) -> bool {
        matches!(self, Self::AlreadyPending { .. } | Self::Submitted { .. })
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct TaskRequest {
    pub identifier: String,
    pub earliest_begin: DateTime<Utc>,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct LocalAlert {
    pub id: String,
    pub title: String,
    pub body: String,
}

/// Single persisted preference row.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Preference {
    pub check_interval: CheckInterval,
    pub step_threshold: u32,
    pub is_notification_enabled: bool,
    /// Start of the window in which alerts may fire (time of day only).
    pub quiet_hours_start: Option<NaiveTime>,
    pub quiet_hours_end: Option<NaiveTime>,
    pub last_background_steps: Option<u32>,
    pub last_background_check_time: Option<DateTime<Utc>>,
    pub life_water: u32,
    pub tree_level: u32,
    pub worker_level: u32,
    pub tree_investment: u32,
    pub worker_investment: u32,
    pub last_win_at: Option<DateTime<Utc>>,
    pub is_super_user: bool,
}

impl Default for Preference {
    fn default() -> Self {
        Self {
            check_interval: CheckInterval::default(),
            step_threshold: 100,
            is_notification_enabled: true,
            quiet_hours_start: None,
            quiet_hours_end: None,
            last_background_steps: None,
            last_background_check_time: None,
            life_water: 0,
            tree_level: 1,
            worker_level: 1,
            tree_investment: 0,
            worker_investment: 0,
            last_win_at: None,
            is_super_user: false,
        }
    }
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct PreferenceUpdate {
    pub check_interval_minutes: Option<u32>,
    pub step_threshold: Option<u32>,
    pub is_notification_enabled: Option<bool>,
    pub quiet_hours_start: Option<NaiveTime>,
    pub quiet_hours_end: Option<NaiveTime>,
    #[serde(default)]
    pub clear_quiet_hours: bool,
}

/// Immutable record of one check.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct HistoryEntry {
    pub timestamp: DateTime<Utc>,
    pub steps_in_window: u32,
    pub threshold: u32,
    pub was_notified: bool,
    pub window_minutes: u32,
    pub source: CheckSource,
    pub measurement_available: bool,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct CheckReport {
    pub source: CheckSource,
    pub window_start: DateTime<Utc>,
    pub window_end: DateTime<Utc>,
    pub steps: u32,
    pub threshold: u32,
    pub notified: bool,
    pub measurement_available: bool,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RunReport {
    pub path: CompletionPath,
    pub success: bool,
    /// Re-arm decision taken before completion, refused wakes included.
    pub schedule: ScheduleDecision,
}

/// Answer returned to the push transport after a silent push.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FetchResult {
    NewData,
    NoData,
    Failed,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum InvestTarget {
    Tree,
    Worker,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum InvestOutcome {
    LeveledUp { level: u32 },
    Invested { investment: u32, cost: u32 },
    InsufficientWater { balance: u32 },
}

#[cfg(test)]
mod tests {
    use super::{CheckInterval, CheckSource, Preference, StepMeasurement};

    #[test]
    fn check_interval_accepts_only_offered_minutes() {
        assert_eq!(CheckInterval::from_minutes(90), Some(CheckInterval::Ninety));
        assert_eq!(CheckInterval::from_minutes(45), None);
        assert!(CheckInterval::try_from(0).is_err());
        assert_eq!(u32::from(CheckInterval::OneTwenty), 120);
    }

    #[test]
    fn check_interval_serializes_as_minutes() {
        let json = serde_json::to_string(&CheckInterval::Thirty).expect("serialize");
        assert_eq!(json, "30");
        let err = serde_json::from_str::<CheckInterval>("45");
        assert!(err.is_err());
    }

    #[test]
    fn check_source_round_trips_through_str() {
        for source in [CheckSource::Foreground, CheckSource::BackgroundTask, CheckSource::SilentPush] {
            assert_eq!(CheckSource::parse(source.as_str()), Some(source));
        }
        assert_eq!(CheckSource::parse("cron"), None);
    }

    #[test]
    fn unavailable_measurement_counts_as_zero() {
        assert_eq!(StepMeasurement::Unavailable.steps(), 0);
        assert!(!StepMeasurement::Unavailable.is_available());
        assert!(StepMeasurement::Counted(0).is_available());
    }

    #[test]
    fn default_preference_matches_first_launch_values() {
        let pref = Preference::default();
        assert_eq!(pref.check_interval, CheckInterval::Sixty);
        assert_eq!(pref.step_threshold, 100);
        assert!(pref.is_notification_enabled);
        assert_eq!(pref.tree_level, 1);
    }
}
