pub mod local;

use crate::errors::AppResult;
use crate::models::{LocalAlert, StepMeasurement, TaskRequest};
use async_trait::async_trait;
use chrono::{DateTime, Utc};
use std::future::Future;
use std::pin::Pin;
use std::sync::Arc;
use tokio::sync::mpsc;
use tokio_util::sync::CancellationToken;

pub type WakeFuture = Pin<Box<dyn Future<Output = ()> + Send>>;
pub type WakeHandler = Arc<dyn Fn(WakeTask) -> WakeFuture + Send + Sync>;

/// The OS side of a wake. Must be told about completion exactly once.
pub trait TaskCompleter: Send + Sync {
    fn set_task_completed(&self, success: bool);
}

/// One OS-granted background execution window.
pub struct WakeTask {
    identifier: String,
    expiration: CancellationToken,
    completer: Arc<dyn TaskCompleter>,
}

impl WakeTask {
    pub fn new(identifier: impl Into<String>, expiration: CancellationToken, completer: Arc<dyn TaskCompleter>) -> Self {
        Self {
            identifier: identifier.into(),
            expiration,
            completer,
        }
    }

    pub fn identifier(&self) -> &str {
        &self.identifier
    }

    /// Cancelled by the OS when it revokes the remaining execution time.
    pub fn expiration(&self) -> CancellationToken {
        self.expiration.clone()
    }

    pub(crate) fn completer(&self) -> Arc<dyn TaskCompleter> {
        self.completer.clone()
    }
}

impl std::fmt::Debug for WakeTask {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("WakeTask")
            .field("identifier", &self.identifier)
            .field("expired", &self.expiration.is_cancelled())
            .finish()
    }
}

/// OS background-scheduling API.
#[async_trait]
pub trait TaskScheduler: Send + Sync {
    fn register(&self, identifier: &str, handler: WakeHandler) -> AppResult<()>;

    async fn pending_requests(&self) -> AppResult<Vec<TaskRequest>>;

    /// Submitting an identifier that is already pending replaces the request
    /// and with it the earliest begin date.
    async fn submit(&self, request: TaskRequest) -> AppResult<()>;
}

/// Device pedometer.
#[async_trait]
pub trait StepSource: Send + Sync {
    fn is_available(&self) -> bool {
        true
    }

    /// Steps between `from` and `to`. Implementations should stop work once
    /// `cancel` fires; callers stop waiting either way.
    async fn query(&self, from: DateTime<Utc>, to: DateTime<Utc>, cancel: &CancellationToken) -> StepMeasurement;

    /// Running totals since `start`, until `cancel` fires or the receiver is dropped.
    fn stream_since(&self, start: DateTime<Utc>, cancel: CancellationToken) -> mpsc::Receiver<u32>;
}

/// OS notification API.
#[async_trait]
pub trait NotificationCenter: Send + Sync {
    async fn request_authorization(&self) -> AppResult<bool>;

    async fn post(&self, alert: LocalAlert) -> AppResult<()>;
}
