use crate::db::Database;
use crate::errors::{AppError, AppResult};
use crate::models::{CheckReport, CheckSource, HistoryEntry, Preference, StepMeasurement};
use crate::notifier::NotificationDispatcher;
use crate::platform::StepSource;
use crate::settings::SchedulerSettings;
use chrono::{Local, NaiveTime, Timelike, Utc};
use std::sync::Arc;
use tokio_util::sync::CancellationToken;

/// Minute-granular window test; `start > end` wraps past midnight. Both ends inclusive.
pub fn is_within_window(now: NaiveTime, start: NaiveTime, end: NaiveTime) -> bool {
    let minute_of_day = |time: NaiveTime| time.hour() * 60 + time.minute();
    let (now, start, end) = (minute_of_day(now), minute_of_day(start), minute_of_day(end));
    if start <= end {
        now >= start && now <= end
    } else {
        now >= start || now <= end
    }
}

pub fn should_notify(
    measurement: StepMeasurement,
    pref: &Preference,
    settings: &SchedulerSettings,
    local_time: NaiveTime,
) -> bool {
    if !pref.is_notification_enabled || measurement.steps() >= pref.step_threshold {
        return false;
    }
    if !measurement.is_available() && !settings.notify_on_unavailable_measurement {
        return false;
    }
    if settings.quiet_hours_gating {
        if let (Some(start), Some(end)) = (pref.quiet_hours_start, pref.quiet_hours_end) {
            return is_within_window(local_time, start, end);
        }
    }
    true
}

/// The check-and-notify operation shared by every trigger.
#[derive(Clone)]
pub struct StepChecker {
    db: Arc<Database>,
    steps: Arc<dyn StepSource>,
    dispatcher: NotificationDispatcher,
}

impl StepChecker {
    pub fn new(db: Arc<Database>, steps: Arc<dyn StepSource>, dispatcher: NotificationDispatcher) -> Self {
        Self { db, steps, dispatcher }
    }

    /// Returns `Ok(None)` when no preference row exists yet. Fails with
    /// [`AppError::Cancelled`] if `cancel` fires before the result is stored;
    /// nothing is written in that case.
    pub async fn run(
        &self,
        source: CheckSource,
        settings: &SchedulerSettings,
        cancel: &CancellationToken,
    ) -> AppResult<Option<CheckReport>> {
        let Some(pref) = self.db.get_preference()? else {
            tracing::info!(source = %source, "no preference stored yet; skipping check");
            return Ok(None);
        };

        let now = Utc::now();
        let window_start = now - pref.check_interval.duration();
        tracing::info!(
            source = %source,
            interval_minutes = pref.check_interval.minutes(),
            start = %window_start,
            end = %now,
            "querying steps"
        );

        let measurement = tokio::select! {
            biased;
            _ = cancel.cancelled() => {
                return Err(AppError::Cancelled("step query abandoned".to_string()));
            }
            measurement = self.steps.query(window_start, now, cancel) => measurement,
        };
        if cancel.is_cancelled() {
            tracing::warn!(source = %source, "discarding step result that arrived after cancellation");
            return Err(AppError::Cancelled("step result arrived too late".to_string()));
        }
        if !measurement.is_available() {
            tracing::warn!(source = %source, "step measurement unavailable; counting as zero");
        }

        let steps = measurement.steps();
        let notify = should_notify(measurement, &pref, settings, Local::now().time());
        let entry = HistoryEntry {
            timestamp: now,
            steps_in_window: steps,
            threshold: pref.step_threshold,
            was_notified: notify,
            window_minutes: pref.check_interval.minutes(),
            source,
            measurement_available: measurement.is_available(),
        };

        let evicted = self.db.record_check(&entry, settings.history_cap).map_err(|error| {
            tracing::error!(error = %error, "save failed");
            error
        })?;
        tracing::info!(steps, notified = notify, evicted, "history saved");

        if notify {
            self.dispatcher
                .dispatch(steps, pref.step_threshold, now, settings.notification_cooldown())
                .await;
        }

        Ok(Some(CheckReport {
            source,
            window_start,
            window_end: now,
            steps,
            threshold: pref.step_threshold,
            notified: notify,
            measurement_available: measurement.is_available(),
        }))
    }
}
