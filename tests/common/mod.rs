#![allow(dead_code)]

use serde_json::json;
use std::sync::Arc;
use std::time::Duration;
use stepmon_lib::platform::local::{LocalTaskScheduler, StepLedger, TracingNotificationCenter};
use stepmon_lib::relay::RetryPolicy;
use stepmon_lib::settings::DEFAULT_TASK_IDENTIFIER;
use stepmon_lib::{App, Platform};

pub struct TestApp {
    pub dir: tempfile::TempDir,
    pub app: App,
    pub tasks: Arc<LocalTaskScheduler>,
    pub steps: Arc<StepLedger>,
    pub notifications: Arc<TracingNotificationCenter>,
}

impl TestApp {
    pub async fn pending_count(&self) -> usize {
        use stepmon_lib::platform::TaskScheduler;
        self.tasks
            .pending_requests()
            .await
            .expect("pending")
            .iter()
            .filter(|request| request.identifier == DEFAULT_TASK_IDENTIFIER)
            .count()
    }

    pub async fn wake(&self) -> bool {
        self.tasks.wake_now(DEFAULT_TASK_IDENTIFIER).await.expect("wake")
    }
}

pub fn fast_retry(attempts: u32) -> RetryPolicy {
    RetryPolicy {
        attempts,
        base_delay: Duration::from_millis(5),
        max_jitter: Duration::ZERO,
    }
}

/// App over the in-process platform with the submit throttle disabled.
pub fn open_app() -> TestApp {
    open_app_with(json!({ "submitThrottleSeconds": 0 }))
}

pub fn open_app_with(settings: serde_json::Value) -> TestApp {
    let dir = tempfile::tempdir().expect("tempdir");
    let tasks = Arc::new(LocalTaskScheduler::new(Duration::from_secs(30)));
    let steps = Arc::new(StepLedger::new());
    let notifications = Arc::new(TracingNotificationCenter::new());
    let platform = Platform {
        tasks: tasks.clone(),
        steps: steps.clone(),
        notifications: notifications.clone(),
    };
    let app = App::open_with_retry(dir.path(), platform, fast_retry(2)).expect("open app");
    app.update_scheduler_settings(settings).expect("settings");
    TestApp {
        dir,
        app,
        tasks,
        steps,
        notifications,
    }
}
