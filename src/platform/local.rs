//! In-process stand-ins for the OS services, used by the host binary and tests.
//!
//! [`LocalTaskScheduler`] keeps the pending-request list and fires wakes once
//! their earliest begin date passes, revoking execution time after a fixed
//! budget. It deliberately does not serialize wakes per identifier; callers
//! must enforce single-flight themselves.

use super::{NotificationCenter, StepSource, TaskCompleter, TaskScheduler, WakeHandler, WakeTask};
use crate::errors::{AppError, AppResult};
use crate::models::{LocalAlert, StepMeasurement, TaskRequest};
use async_trait::async_trait;
use chrono::{DateTime, Utc};
use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::{Arc, RwLock};
use tokio::sync::{broadcast, mpsc, oneshot, Mutex, Notify};
use tokio::time::Duration;
use tokio_util::sync::CancellationToken;

/// How long a handler may take to report after its budget is revoked.
const EXPIRY_GRACE: Duration = Duration::from_secs(5);

#[derive(Clone)]
pub struct LocalTaskScheduler {
    handlers: Arc<RwLock<HashMap<String, WakeHandler>>>,
    pending: Arc<Mutex<Vec<TaskRequest>>>,
    notify: Arc<Notify>,
    execution_budget: Duration,
    submissions: Arc<AtomicUsize>,
    completions: Arc<AtomicUsize>,
}

impl LocalTaskScheduler {
    pub fn new(execution_budget: Duration) -> Self {
        Self {
            handlers: Arc::new(RwLock::new(HashMap::new())),
            pending: Arc::new(Mutex::new(Vec::new())),
            notify: Arc::new(Notify::new()),
            execution_budget,
            submissions: Arc::new(AtomicUsize::new(0)),
            completions: Arc::new(AtomicUsize::new(0)),
        }
    }

    /// Total accepted submissions since construction.
    pub fn submission_count(&self) -> usize {
        self.submissions.load(Ordering::SeqCst)
    }

    /// Total completion calls received, including contract violations.
    pub fn completion_count(&self) -> usize {
        self.completions.load(Ordering::SeqCst)
    }

    pub fn start(&self) {
        let scheduler = self.clone();
        tokio::spawn(async move {
            scheduler.run_loop().await;
        });
        self.notify.notify_one();
    }

    /// Consume the pending request for `identifier` (if any) and wake its
    /// handler immediately. Resolves with the success flag the handler reported.
    pub async fn wake_now(&self, identifier: &str) -> AppResult<bool> {
        {
            let mut pending = self.pending.lock().await;
            pending.retain(|request| request.identifier != identifier);
        }
        self.dispatch(identifier).await
    }

    async fn run_loop(self) {
        loop {
            self.notify.notified().await;
            loop {
                let (due, next_delay) = self.take_due_request().await;
                let Some(request) = due else {
                    if let Some(delay) = next_delay {
                        let notify = self.notify.clone();
                        tokio::spawn(async move {
                            tokio::time::sleep(delay).await;
                            notify.notify_one();
                        });
                    }
                    break;
                };

                let scheduler = self.clone();
                tokio::spawn(async move {
                    match scheduler.dispatch(&request.identifier).await {
                        Ok(success) => {
                            tracing::info!(identifier = %request.identifier, success, "background wake completed");
                        }
                        Err(error) => {
                            tracing::warn!(identifier = %request.identifier, error = %error, "background wake failed");
                        }
                    }
                });
            }
        }
    }

    async fn take_due_request(&self) -> (Option<TaskRequest>, Option<Duration>) {
        let mut pending = self.pending.lock().await;
        if pending.is_empty() {
            return (None, None);
        }

        let now = Utc::now();
        let due_index = pending
            .iter()
            .enumerate()
            .filter(|(_, request)| request.earliest_begin <= now)
            .min_by_key(|(_, request)| request.earliest_begin)
            .map(|(index, _)| index);

        if let Some(index) = due_index {
            return (Some(pending.remove(index)), None);
        }

        let delay = pending.iter().map(|request| request.earliest_begin).min().map(|at| {
            let diff = at.signed_duration_since(now).num_milliseconds();
            Duration::from_millis(diff.max(0) as u64)
        });
        (None, delay)
    }

    async fn dispatch(&self, identifier: &str) -> AppResult<bool> {
        let handler = self
            .handlers
            .read()
            .map_err(|_| AppError::Internal("task handler lock poisoned".to_string()))?
            .get(identifier)
            .cloned()
            .ok_or_else(|| AppError::NotFound(format!("no handler registered for {}", identifier)))?;

        let expiration = CancellationToken::new();
        let (sender, receiver) = oneshot::channel();
        let completer = Arc::new(LocalCompleter {
            identifier: identifier.to_string(),
            sender: std::sync::Mutex::new(Some(sender)),
            completions: self.completions.clone(),
        });

        let budget = self.execution_budget;
        let budget_token = expiration.clone();
        let budget_timer = tokio::spawn(async move {
            tokio::time::sleep(budget).await;
            budget_token.cancel();
        });

        tracing::info!(identifier, "granting background execution time");
        tokio::spawn(handler(WakeTask::new(identifier, expiration, completer)));

        let outcome = tokio::time::timeout(budget + EXPIRY_GRACE, receiver).await;
        budget_timer.abort();
        match outcome {
            Ok(Ok(success)) => Ok(success),
            Ok(Err(_)) => Err(AppError::Scheduling(format!(
                "handler for {} dropped without completing",
                identifier
            ))),
            Err(_) => Err(AppError::Scheduling(format!(
                "handler for {} never reported completion",
                identifier
            ))),
        }
    }
}

#[async_trait]
impl TaskScheduler for LocalTaskScheduler {
    fn register(&self, identifier: &str, handler: WakeHandler) -> AppResult<()> {
        let mut handlers = self
            .handlers
            .write()
            .map_err(|_| AppError::Internal("task handler lock poisoned".to_string()))?;
        handlers.insert(identifier.to_string(), handler);
        tracing::info!(identifier, "background task registered");
        Ok(())
    }

    async fn pending_requests(&self) -> AppResult<Vec<TaskRequest>> {
        let pending = self.pending.lock().await;
        Ok(pending.clone())
    }

    async fn submit(&self, request: TaskRequest) -> AppResult<()> {
        let registered = self
            .handlers
            .read()
            .map_err(|_| AppError::Internal("task handler lock poisoned".to_string()))?
            .contains_key(&request.identifier);
        if !registered {
            return Err(AppError::Scheduling(format!(
                "task identifier {} is not registered",
                request.identifier
            )));
        }

        {
            let mut pending = self.pending.lock().await;
            pending.retain(|queued| queued.identifier != request.identifier);
            pending.push(request);
        }
        self.submissions.fetch_add(1, Ordering::SeqCst);
        self.notify.notify_one();
        Ok(())
    }
}

struct LocalCompleter {
    identifier: String,
    sender: std::sync::Mutex<Option<oneshot::Sender<bool>>>,
    completions: Arc<AtomicUsize>,
}

impl TaskCompleter for LocalCompleter {
    fn set_task_completed(&self, success: bool) {
        self.completions.fetch_add(1, Ordering::SeqCst);
        let sender = match self.sender.lock() {
            Ok(mut slot) => slot.take(),
            Err(_) => None,
        };
        match sender {
            Some(sender) => {
                let _ = sender.send(success);
            }
            None => {
                tracing::error!(identifier = %self.identifier, "task completion reported more than once");
            }
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct StepSample {
    pub at: DateTime<Utc>,
    pub steps: u32,
}

/// Step source backed by recorded samples. Each sample is the number of steps
/// taken at that instant.
pub struct StepLedger {
    samples: Arc<std::sync::Mutex<Vec<StepSample>>>,
    updates: broadcast::Sender<()>,
    available: AtomicBool,
}

impl Default for StepLedger {
    fn default() -> Self {
        Self::new()
    }
}

impl StepLedger {
    pub fn new() -> Self {
        let (updates, _) = broadcast::channel(64);
        Self {
            samples: Arc::new(std::sync::Mutex::new(Vec::new())),
            updates,
            available: AtomicBool::new(true),
        }
    }

    pub fn record(&self, at: DateTime<Utc>, steps: u32) {
        if let Ok(mut samples) = self.samples.lock() {
            samples.push(StepSample { at, steps });
        }
        let _ = self.updates.send(());
    }

    pub fn set_available(&self, available: bool) {
        self.available.store(available, Ordering::SeqCst);
    }

    fn total_between(
        samples: &std::sync::Mutex<Vec<StepSample>>,
        from: DateTime<Utc>,
        to: Option<DateTime<Utc>>,
    ) -> Option<u32> {
        let samples = samples.lock().ok()?;
        let total = samples
            .iter()
            .filter(|sample| sample.at >= from && to.map(|to| sample.at <= to).unwrap_or(true))
            .fold(0u32, |acc, sample| acc.saturating_add(sample.steps));
        Some(total)
    }
}

#[async_trait]
impl StepSource for StepLedger {
    fn is_available(&self) -> bool {
        self.available.load(Ordering::SeqCst)
    }

    async fn query(&self, from: DateTime<Utc>, to: DateTime<Utc>, cancel: &CancellationToken) -> StepMeasurement {
        if !self.is_available() || cancel.is_cancelled() {
            return StepMeasurement::Unavailable;
        }
        match Self::total_between(&self.samples, from, Some(to)) {
            Some(total) => StepMeasurement::Counted(total),
            None => StepMeasurement::Unavailable,
        }
    }

    fn stream_since(&self, start: DateTime<Utc>, cancel: CancellationToken) -> mpsc::Receiver<u32> {
        let (sender, receiver) = mpsc::channel(32);
        if !self.is_available() {
            return receiver;
        }

        let samples = self.samples.clone();
        let mut updates = self.updates.subscribe();
        tokio::spawn(async move {
            let mut last_sent = None;
            loop {
                let total = StepLedger::total_between(&samples, start, None).unwrap_or(0);
                if last_sent != Some(total) {
                    if sender.send(total).await.is_err() {
                        break;
                    }
                    last_sent = Some(total);
                }

                tokio::select! {
                    _ = cancel.cancelled() => break,
                    update = updates.recv() => {
                        if let Err(broadcast::error::RecvError::Closed) = update {
                            break;
                        }
                    }
                }
            }
        });
        receiver
    }
}

/// Notification center that writes alerts to the log and remembers them.
#[derive(Default)]
pub struct TracingNotificationCenter {
    posted: std::sync::Mutex<Vec<LocalAlert>>,
}

impl TracingNotificationCenter {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn posted(&self) -> Vec<LocalAlert> {
        self.posted.lock().map(|alerts| alerts.clone()).unwrap_or_default()
    }
}

#[async_trait]
impl NotificationCenter for TracingNotificationCenter {
    async fn request_authorization(&self) -> AppResult<bool> {
        tracing::info!("notification authorization granted");
        Ok(true)
    }

    async fn post(&self, alert: LocalAlert) -> AppResult<()> {
        tracing::info!(id = %alert.id, title = %alert.title, body = %alert.body, "local alert posted");
        self.posted
            .lock()
            .map_err(|_| AppError::Internal("alert log lock poisoned".to_string()))?
            .push(alert);
        Ok(())
    }
}
