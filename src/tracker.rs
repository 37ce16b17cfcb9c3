//! Foreground step counter for today, mirrored into a widget snapshot.

use crate::db::Database;
use crate::errors::AppResult;
use crate::platform::StepSource;
use chrono::{DateTime, Local, Utc};
use serde::{Deserialize, Serialize};
use std::sync::{Arc, Mutex};
use tokio::sync::watch;
use tokio_util::sync::CancellationToken;

pub const WIDGET_STEPS_KEY: &str = "widget_steps";
const SNAPSHOT_MIN_DELTA: u32 = 50;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct WidgetSnapshot {
    pub steps: u32,
    pub updated_at: DateTime<Utc>,
}

/// Local midnight of the day containing `now`, in UTC.
pub fn local_start_of_day(now: DateTime<Utc>) -> DateTime<Utc> {
    now.with_timezone(&Local)
        .date_naive()
        .and_hms_opt(0, 0, 0)
        .and_then(|midnight| midnight.and_local_timezone(Local).earliest())
        .map(|midnight| midnight.with_timezone(&Utc))
        .unwrap_or(now)
}

pub fn read_snapshot(db: &Database) -> AppResult<Option<WidgetSnapshot>> {
    let Some(raw) = db.kv_get(WIDGET_STEPS_KEY)? else {
        return Ok(None);
    };
    match serde_json::from_str(&raw) {
        Ok(snapshot) => Ok(Some(snapshot)),
        Err(error) => {
            tracing::warn!(error = %error, "ignoring malformed widget snapshot");
            Ok(None)
        }
    }
}

fn write_snapshot(db: &Database, steps: u32) -> AppResult<()> {
    let snapshot = WidgetSnapshot {
        steps,
        updated_at: Utc::now(),
    };
    db.kv_set(WIDGET_STEPS_KEY, &serde_json::to_string(&snapshot)?)
}

pub struct LiveStepTracker {
    db: Arc<Database>,
    steps: Arc<dyn StepSource>,
    today: watch::Sender<u32>,
    running: Mutex<Option<CancellationToken>>,
}

impl LiveStepTracker {
    pub fn new(db: Arc<Database>, steps: Arc<dyn StepSource>) -> Self {
        let (today, _) = watch::channel(0);
        Self {
            db,
            steps,
            today,
            running: Mutex::new(None),
        }
    }

    pub fn subscribe(&self) -> watch::Receiver<u32> {
        self.today.subscribe()
    }

    pub fn current(&self) -> u32 {
        *self.today.borrow()
    }

    pub fn is_running(&self) -> bool {
        self.running
            .lock()
            .map(|running| running.is_some())
            .unwrap_or(false)
    }

    /// Publish today's count and follow live updates until [`Self::stop`] or the next start.
    pub async fn start(&self, now: DateTime<Utc>) -> AppResult<u32> {
        self.stop();
        let cancel = CancellationToken::new();
        if let Ok(mut running) = self.running.lock() {
            *running = Some(cancel.clone());
        }

        let start = local_start_of_day(now);
        let initial = self.steps.query(start, now, &cancel).await.steps();
        self.today.send_replace(initial);
        write_snapshot(&self.db, initial)?;
        tracing::info!(steps = initial, since = %start, "live step tracking started");

        let mut updates = self.steps.stream_since(start, cancel.clone());
        let db = self.db.clone();
        let today = self.today.clone();
        tokio::spawn(async move {
            let mut persisted = initial;
            loop {
                let steps = tokio::select! {
                    _ = cancel.cancelled() => break,
                    update = updates.recv() => match update {
                        Some(steps) => steps,
                        None => break,
                    },
                };
                today.send_replace(steps);
                if steps.abs_diff(persisted) >= SNAPSHOT_MIN_DELTA {
                    match write_snapshot(&db, steps) {
                        Ok(()) => persisted = steps,
                        Err(error) => tracing::warn!(error = %error, "widget snapshot write failed"),
                    }
                }
            }
            tracing::debug!("live step tracking stopped");
        });

        Ok(initial)
    }

    pub fn stop(&self) {
        let previous = self.running.lock().ok().and_then(|mut running| running.take());
        if let Some(cancel) = previous {
            cancel.cancel();
        }
    }
}

impl Drop for LiveStepTracker {
    fn drop(&mut self) {
        self.stop();
    }
}
