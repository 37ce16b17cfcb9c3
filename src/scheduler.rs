use crate::check::StepChecker;
use crate::db::Database;
use crate::errors::{AppError, AppResult};
use crate::guard::ScheduleGuard;
use crate::models::{
    CheckReport, CheckSource, CompletionPath, RunReport, ScheduleDecision, ScheduleOrigin, TaskRequest, TaskState,
};
use crate::platform::{TaskScheduler, WakeHandler, WakeTask};
use crate::settings::SchedulerSettings;
use chrono::{Local, Utc};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex};
use tokio::sync::oneshot;
use tokio_util::sync::CancellationToken;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Settlement {
    pub path: CompletionPath,
    pub success: bool,
}

/// First caller of [`CompletionLatch::settle`] wins; later calls are logged and ignored.
pub struct CompletionLatch {
    settled: AtomicBool,
    sender: Mutex<Option<oneshot::Sender<Settlement>>>,
}

impl CompletionLatch {
    pub fn new() -> (Arc<Self>, oneshot::Receiver<Settlement>) {
        let (sender, receiver) = oneshot::channel();
        let latch = Arc::new(Self {
            settled: AtomicBool::new(false),
            sender: Mutex::new(Some(sender)),
        });
        (latch, receiver)
    }

    pub fn settle(&self, path: CompletionPath, success: bool) -> bool {
        if self
            .settled
            .compare_exchange(false, true, Ordering::AcqRel, Ordering::Acquire)
            .is_err()
        {
            tracing::warn!(path = %path, success, "double-finish attempted");
            return false;
        }

        let sender = match self.sender.lock() {
            Ok(mut slot) => slot.take(),
            Err(_) => None,
        };
        if let Some(sender) = sender {
            let _ = sender.send(Settlement { path, success });
        }
        true
    }

    pub fn is_settled(&self) -> bool {
        self.settled.load(Ordering::Acquire)
    }
}

/// Holds the single in-flight slot; dropping it frees the slot, so a caller
/// that abandons a check midway cannot wedge later wakes.
struct SlotGuard<'a> {
    in_flight: &'a AtomicBool,
}

impl Drop for SlotGuard<'_> {
    fn drop(&mut self) {
        self.in_flight.store(false, Ordering::Release);
    }
}

/// Owns the single background refresh task: submission policy, wake handling
/// and re-arming. Construct once per process and share behind an `Arc`.
pub struct BackgroundScheduler {
    db: Arc<Database>,
    os: Arc<dyn TaskScheduler>,
    checker: StepChecker,
    guard: ScheduleGuard,
    state: Mutex<TaskState>,
    in_flight: AtomicBool,
}

impl BackgroundScheduler {
    pub fn new(db: Arc<Database>, os: Arc<dyn TaskScheduler>, checker: StepChecker) -> Arc<Self> {
        Arc::new(Self {
            guard: ScheduleGuard::new(db.clone()),
            db,
            os,
            checker,
            state: Mutex::new(TaskState::Idle),
            in_flight: AtomicBool::new(false),
        })
    }

    /// Install the wake handler with the OS. Call once at process start.
    pub fn register(self: &Arc<Self>) -> AppResult<()> {
        let identifier = self.settings().task_identifier;
        let weak = Arc::downgrade(self);
        let handler: WakeHandler = Arc::new(move |task: WakeTask| {
            let weak = weak.clone();
            Box::pin(async move {
                match weak.upgrade() {
                    Some(scheduler) => {
                        scheduler.on_wake(task).await;
                    }
                    None => task.completer().set_task_completed(false),
                }
            })
        });
        self.os.register(&identifier, handler)?;
        tracing::info!(identifier = %identifier, "registerBackgroundTask done");
        Ok(())
    }

    pub fn state(&self) -> TaskState {
        self.state.lock().map(|state| *state).unwrap_or(TaskState::Idle)
    }

    pub fn guard(&self) -> &ScheduleGuard {
        &self.guard
    }

    fn settings(&self) -> SchedulerSettings {
        self.db.get_scheduler_settings().unwrap_or_else(|error| {
            tracing::warn!(error = %error, "failed to load scheduler settings; using defaults");
            SchedulerSettings::default()
        })
    }

    fn set_state(&self, next: TaskState) {
        if let Ok(mut state) = self.state.lock() {
            if *state != next {
                tracing::debug!(from = state.as_str(), to = next.as_str(), "task state changed");
            }
            *state = next;
        }
    }

    fn state_after(&self, decision: &ScheduleDecision) {
        self.set_state(if decision.leaves_request_pending() {
            TaskState::Scheduled
        } else {
            TaskState::Idle
        });
    }

    fn note_scheduled(&self) {
        if let Ok(mut state) = self.state.lock() {
            if *state == TaskState::Idle {
                *state = TaskState::Scheduled;
            }
        }
    }

    fn reserve_slot(&self) -> Option<SlotGuard<'_>> {
        self.in_flight
            .compare_exchange(false, true, Ordering::AcqRel, Ordering::Acquire)
            .ok()
            .map(|_| SlotGuard {
                in_flight: &self.in_flight,
            })
    }

    /// Ask the OS for the next wake unless one is already pending.
    pub async fn request_schedule(&self, origin: ScheduleOrigin) -> ScheduleDecision {
        let settings = self.settings();
        let now = Utc::now();
        tracing::info!(origin = %origin, "schedule called");

        if origin != ScheduleOrigin::PostRunRelay {
            match self.guard.throttle_ok(now, settings.submit_throttle()) {
                Ok(true) => {}
                Ok(false) => {
                    tracing::info!(origin = %origin, "schedule throttled");
                    return ScheduleDecision::Throttled;
                }
                Err(error) => tracing::warn!(error = %error, "could not read submit throttle"),
            }
        }

        if origin == ScheduleOrigin::BackgroundTransition {
            match self.guard.background_guard_ok(now, settings.background_resubmit_guard()) {
                Ok(true) => {}
                Ok(false) => {
                    tracing::info!(origin = %origin, "background resubmit guard skip");
                    return ScheduleDecision::Guarded;
                }
                Err(error) => tracing::warn!(error = %error, "could not read background guard"),
            }
        }

        if let Err(error) = self.guard.mark_schedule_attempt(now) {
            tracing::warn!(error = %error, "failed to record schedule attempt");
        }

        let pending = match self.os.pending_requests().await {
            Ok(pending) => pending,
            Err(error) => {
                tracing::error!(origin = %origin, error = %error, "pending request query failed");
                return ScheduleDecision::Failed {
                    reason: error.to_string(),
                };
            }
        };
        let ours = pending
            .iter()
            .filter(|request| request.identifier == settings.task_identifier)
            .count();
        if ours > 0 {
            let ids = pending
                .iter()
                .map(|request| request.identifier.as_str())
                .collect::<Vec<_>>()
                .join(",");
            tracing::info!(origin = %origin, pending_count = pending.len(), ids = %ids, "request already pending");
            self.note_scheduled();
            return ScheduleDecision::AlreadyPending { pending: ours };
        }

        let earliest_begin = now + settings.earliest_begin();
        let request = TaskRequest {
            identifier: settings.task_identifier.clone(),
            earliest_begin,
        };
        match self.os.submit(request).await {
            Ok(()) => {
                if let Err(error) = self.guard.mark_submitted(now, origin.is_background()) {
                    tracing::warn!(error = %error, "failed to record submit timestamp");
                }
                tracing::info!(
                    origin = %origin,
                    earliest = %earliest_begin.with_timezone(&Local).format("%y.%m.%d %H:%M:%S"),
                    "submit success"
                );
                self.note_scheduled();
                ScheduleDecision::Submitted { earliest_begin }
            }
            Err(error) => {
                tracing::error!(origin = %origin, error = %error, "submit failed");
                ScheduleDecision::Failed {
                    reason: error.to_string(),
                }
            }
        }
    }

    /// Handle one OS wake: run the check under the expiration signal and the
    /// safety timeout, re-arm, then report completion exactly once.
    pub async fn on_wake(self: &Arc<Self>, task: WakeTask) -> RunReport {
        let completer = task.completer();
        let Some(slot) = self.reserve_slot() else {
            // The OS consumed its request to deliver this wake; the slot holder
            // may be a foreground check that never re-arms.
            tracing::warn!(identifier = task.identifier(), "wake arrived while a check is in flight");
            let schedule = self.request_schedule(ScheduleOrigin::PostRunRelay).await;
            if self.state() != TaskState::Running {
                self.state_after(&schedule);
            }
            completer.set_task_completed(false);
            return RunReport {
                path: CompletionPath::Finished,
                success: false,
                schedule,
            };
        };

        tracing::info!(identifier = task.identifier(), "background run start");
        self.set_state(TaskState::Running);
        let settings = self.settings();
        let (latch, settled) = CompletionLatch::new();
        let cancel = CancellationToken::new();

        let expiration = task.expiration();
        let expiry_latch = latch.clone();
        let expiry_watch = tokio::spawn(async move {
            expiration.cancelled().await;
            tracing::warn!("background run expired");
            expiry_latch.settle(CompletionPath::Expired, false);
        });

        let limit = settings.safety_timeout();
        let timeout_latch = latch.clone();
        let safety_timer = tokio::spawn(async move {
            tokio::time::sleep(limit).await;
            tracing::warn!(limit_secs = limit.as_secs(), "safety timeout reached");
            timeout_latch.settle(CompletionPath::SafetyTimeout, false);
        });

        let work_latch = latch.clone();
        let checker = self.checker.clone();
        let work_cancel = cancel.clone();
        let work_settings = settings.clone();
        tokio::spawn(async move {
            let success = match checker
                .run(CheckSource::BackgroundTask, &work_settings, &work_cancel)
                .await
            {
                Ok(_) => true,
                Err(AppError::Cancelled(reason)) => {
                    tracing::info!(reason = %reason, "check abandoned");
                    false
                }
                Err(error) => {
                    tracing::error!(error = %error, "check failed");
                    false
                }
            };
            work_latch.settle(CompletionPath::Finished, success);
        });

        let settlement = settled.await.unwrap_or(Settlement {
            path: CompletionPath::Finished,
            success: false,
        });
        cancel.cancel();
        expiry_watch.abort();
        safety_timer.abort();
        tracing::info!(path = %settlement.path, success = settlement.success, "background run end");

        let schedule = self.request_schedule(ScheduleOrigin::PostRunRelay).await;
        self.state_after(&schedule);
        drop(slot);
        completer.set_task_completed(settlement.success);

        RunReport {
            path: settlement.path,
            success: settlement.success,
            schedule,
        }
    }

    /// Run check-and-notify outside a wake (foreground refresh, silent push).
    /// Shares the in-flight slot with wakes and is bounded by the safety timeout.
    pub async fn run_check(&self, source: CheckSource) -> AppResult<Option<CheckReport>> {
        let Some(_slot) = self.reserve_slot() else {
            return Err(AppError::Scheduling("a check is already running".to_string()));
        };

        let settings = self.settings();
        let cancel = CancellationToken::new();
        let _cancel_on_drop = cancel.clone().drop_guard();
        let outcome = tokio::time::timeout(
            settings.safety_timeout(),
            self.checker.run(source, &settings, &cancel),
        )
        .await;

        match outcome {
            Ok(result) => result,
            Err(_) => {
                tracing::warn!(source = %source, "safety timeout reached");
                Err(AppError::Cancelled(format!(
                    "{} check exceeded {}s",
                    source,
                    settings.safety_timeout_seconds
                )))
            }
        }
    }
}
