use crate::check::StepChecker;
use crate::db::Database;
use crate::errors::{AppError, AppResult};
use crate::garden::Garden;
use crate::guard::ScheduleGuard;
use crate::models::{
    CheckInterval, CheckReport, CheckSource, HistoryEntry, Preference, PreferenceUpdate, ScheduleDecision,
    ScheduleOrigin,
};
use crate::notifier::NotificationDispatcher;
use crate::platform::{NotificationCenter, StepSource, TaskScheduler};
use crate::relay::{DeviceRelay, FlushOutcome, RetryPolicy, SilentPushHandler};
use crate::scheduler::BackgroundScheduler;
use crate::settings::SchedulerSettings;
use crate::tracker::LiveStepTracker;
use chrono::Utc;
use std::path::{Path, PathBuf};
use std::sync::Arc;

pub const DATABASE_FILE: &str = "stepmon.db";
pub const THRESHOLD_MIN: u32 = 50;
pub const THRESHOLD_MAX: u32 = 1000;
pub const THRESHOLD_STEP: u32 = 50;

/// OS services the app is wired against.
#[derive(Clone)]
pub struct Platform {
    pub tasks: Arc<dyn TaskScheduler>,
    pub steps: Arc<dyn StepSource>,
    pub notifications: Arc<dyn NotificationCenter>,
}

pub struct App {
    data_dir: PathBuf,
    db: Arc<Database>,
    scheduler: Arc<BackgroundScheduler>,
    dispatcher: NotificationDispatcher,
    relay: Arc<DeviceRelay>,
    garden: Garden,
    tracker: LiveStepTracker,
    silent_push: SilentPushHandler,
}

impl App {
    pub fn open(data_dir: &Path, platform: Platform) -> AppResult<Self> {
        Self::open_with_retry(data_dir, platform, RetryPolicy::default())
    }

    /// Opens the store, wires services and registers the background task.
    /// Registration must happen before the first scheduling request.
    pub fn open_with_retry(data_dir: &Path, platform: Platform, retry: RetryPolicy) -> AppResult<Self> {
        std::fs::create_dir_all(data_dir)?;
        let db = Arc::new(Database::new(&data_dir.join(DATABASE_FILE))?);

        let dispatcher = NotificationDispatcher::new(platform.notifications.clone(), ScheduleGuard::new(db.clone()));
        let checker = StepChecker::new(db.clone(), platform.steps.clone(), dispatcher.clone());
        let scheduler = BackgroundScheduler::new(db.clone(), platform.tasks.clone(), checker);
        scheduler.register()?;

        Ok(Self {
            data_dir: data_dir.to_path_buf(),
            relay: Arc::new(DeviceRelay::new(db.clone(), retry)),
            garden: Garden::new(db.clone()),
            tracker: LiveStepTracker::new(db.clone(), platform.steps),
            silent_push: SilentPushHandler::new(scheduler.clone()),
            dispatcher,
            scheduler,
            db,
        })
    }

    pub fn data_dir(&self) -> &Path {
        &self.data_dir
    }

    pub fn database(&self) -> &Arc<Database> {
        &self.db
    }

    pub fn scheduler(&self) -> &Arc<BackgroundScheduler> {
        &self.scheduler
    }

    pub fn relay(&self) -> &Arc<DeviceRelay> {
        &self.relay
    }

    pub fn garden(&self) -> &Garden {
        &self.garden
    }

    pub fn tracker(&self) -> &LiveStepTracker {
        &self.tracker
    }

    pub fn silent_push(&self) -> &SilentPushHandler {
        &self.silent_push
    }

    pub async fn on_launch(&self) -> ScheduleDecision {
        self.dispatcher.request_authorization().await;
        self.spawn_relay_flush();
        self.scheduler.request_schedule(ScheduleOrigin::AppLaunch).await
    }

    pub async fn on_foreground_active(&self) -> ScheduleDecision {
        if let Err(error) = self.tracker.start(Utc::now()).await {
            tracing::warn!(error = %error, "live step tracking failed to start");
        }
        self.spawn_relay_flush();
        self.scheduler.request_schedule(ScheduleOrigin::ForegroundActive).await
    }

    pub async fn on_background_transition(&self) -> ScheduleDecision {
        self.tracker.stop();
        self.scheduler
            .request_schedule(ScheduleOrigin::BackgroundTransition)
            .await
    }

    /// Foreground "check now".
    pub async fn refresh_now(&self) -> AppResult<Option<CheckReport>> {
        self.scheduler.run_check(CheckSource::Foreground).await
    }

    pub fn preference(&self) -> AppResult<Preference> {
        self.db
            .get_preference()?
            .ok_or_else(|| AppError::NotFound("preference".to_string()))
    }

    pub fn history(&self, limit: usize) -> AppResult<Vec<HistoryEntry>> {
        self.db.list_history(limit)
    }

    pub fn scheduler_settings(&self) -> AppResult<SchedulerSettings> {
        self.db.get_scheduler_settings()
    }

    pub fn update_scheduler_settings(&self, update: serde_json::Value) -> AppResult<SchedulerSettings> {
        let settings = self.db.update_scheduler_settings(update)?;
        tracing::info!(identifier = %settings.task_identifier, "scheduler settings updated");
        Ok(settings)
    }

    /// Validate and store a preference edit. Changes that the relay cares
    /// about queue a settings upload, delivered in the background.
    pub fn update_preference(&self, update: PreferenceUpdate) -> AppResult<Preference> {
        let (next, current) = self.db.modify_preference(|pref| {
            let current = pref.clone();
            *pref = apply_preference_update(&current, &update)?;
            Ok(current)
        })?;

        let relay_relevant = current.is_notification_enabled != next.is_notification_enabled
            || current.quiet_hours_start != next.quiet_hours_start
            || current.quiet_hours_end != next.quiet_hours_end;
        if relay_relevant {
            self.relay.queue_settings(&next)?;
            self.spawn_relay_flush();
        }

        tracing::info!(
            interval_minutes = next.check_interval.minutes(),
            threshold = next.step_threshold,
            notifications = next.is_notification_enabled,
            relay_relevant,
            "preference updated"
        );
        Ok(next)
    }

    pub async fn register_device_token(&self, device_token: &str) -> AppResult<FlushOutcome> {
        let pref = self.preference()?;
        self.relay
            .register_device(device_token, pref.is_notification_enabled)
            .await
    }

    fn spawn_relay_flush(&self) {
        let relay = self.relay.clone();
        tokio::spawn(async move {
            relay.flush_if_needed().await;
        });
    }
}

pub fn apply_preference_update(current: &Preference, update: &PreferenceUpdate) -> AppResult<Preference> {
    let mut next = current.clone();

    if let Some(minutes) = update.check_interval_minutes {
        next.check_interval = CheckInterval::from_minutes(minutes).ok_or_else(|| {
            AppError::Validation(format!("check interval {} minutes is not offered", minutes))
        })?;
    }

    if let Some(threshold) = update.step_threshold {
        if !(THRESHOLD_MIN..=THRESHOLD_MAX).contains(&threshold) || threshold % THRESHOLD_STEP != 0 {
            return Err(AppError::Validation(format!(
                "step threshold {} must be a multiple of {} between {} and {}",
                threshold, THRESHOLD_STEP, THRESHOLD_MIN, THRESHOLD_MAX
            )));
        }
        next.step_threshold = threshold;
    }

    if let Some(enabled) = update.is_notification_enabled {
        next.is_notification_enabled = enabled;
    }

    if update.clear_quiet_hours {
        next.quiet_hours_start = None;
        next.quiet_hours_end = None;
    } else {
        if let Some(start) = update.quiet_hours_start {
            next.quiet_hours_start = Some(start);
        }
        if let Some(end) = update.quiet_hours_end {
            next.quiet_hours_end = Some(end);
        }
        if next.quiet_hours_start.is_some() != next.quiet_hours_end.is_some() {
            return Err(AppError::Validation(
                "quiet hours need both a start and an end".to_string(),
            ));
        }
    }

    Ok(next)
}
