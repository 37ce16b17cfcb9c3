use crate::guard::ScheduleGuard;
use crate::models::LocalAlert;
use crate::platform::NotificationCenter;
use chrono::{DateTime, Duration, Utc};
use std::sync::Arc;
use uuid::Uuid;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DispatchOutcome {
    Posted,
    CoolingDown,
    Failed,
}

/// Posts "move more" alerts. Failures are logged and never retried.
#[derive(Clone)]
pub struct NotificationDispatcher {
    center: Arc<dyn NotificationCenter>,
    guard: ScheduleGuard,
}

impl NotificationDispatcher {
    pub fn new(center: Arc<dyn NotificationCenter>, guard: ScheduleGuard) -> Self {
        Self { center, guard }
    }

    pub fn build_alert(steps: u32, threshold: u32) -> LocalAlert {
        LocalAlert {
            id: Uuid::new_v4().to_string(),
            title: "Time to move".to_string(),
            body: format!(
                "Goal: {} steps / now: {} steps. Take a short walk!",
                threshold, steps
            ),
        }
    }

    pub async fn request_authorization(&self) -> bool {
        match self.center.request_authorization().await {
            Ok(granted) => {
                tracing::info!(granted, "notification authorization resolved");
                granted
            }
            Err(error) => {
                tracing::warn!(error = %error, "notification authorization request failed");
                false
            }
        }
    }

    pub async fn dispatch(&self, steps: u32, threshold: u32, now: DateTime<Utc>, cooldown: Duration) -> DispatchOutcome {
        match self.guard.notification_cooldown_ok(now, cooldown) {
            Ok(true) => {}
            Ok(false) => {
                tracing::info!(steps, threshold, "alert suppressed by cooldown");
                return DispatchOutcome::CoolingDown;
            }
            Err(error) => {
                tracing::warn!(error = %error, "could not read notification guard; posting anyway");
            }
        }

        let alert = Self::build_alert(steps, threshold);
        match self.center.post(alert).await {
            Ok(()) => {
                tracing::info!(steps, threshold, "notification posted");
                if let Err(error) = self.guard.mark_notification_sent(now) {
                    tracing::warn!(error = %error, "failed to record notification timestamp");
                }
                DispatchOutcome::Posted
            }
            Err(error) => {
                tracing::error!(error = %error, "notification add error");
                DispatchOutcome::Failed
            }
        }
    }
}
