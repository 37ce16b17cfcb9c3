//! Persisted "last time X happened" timestamps and the elapsed-time checks
//! built on them. Nothing here is historized; every write overwrites.

use crate::db::Database;
use crate::errors::AppResult;
use chrono::{DateTime, Duration, Utc};
use std::sync::Arc;

pub const LAST_SCHEDULE_ATTEMPT_KEY: &str = "guard.last_schedule_attempt_at";
pub const LAST_SUBMIT_KEY: &str = "guard.last_submit_at";
pub const LAST_BACKGROUND_SUBMIT_KEY: &str = "guard.last_background_submit_at";
pub const LAST_NOTIFICATION_SENT_KEY: &str = "guard.last_notification_sent_at";

/// True when at least `window` has passed since `last`. A missing timestamp
/// passes, and so does one in the future (wall clock moved backwards).
pub fn elapsed_at_least(last: Option<DateTime<Utc>>, now: DateTime<Utc>, window: Duration) -> bool {
    match last {
        None => true,
        Some(last) if last > now => true,
        Some(last) => now - last >= window,
    }
}

#[derive(Clone)]
pub struct ScheduleGuard {
    db: Arc<Database>,
}

impl ScheduleGuard {
    pub fn new(db: Arc<Database>) -> Self {
        Self { db }
    }

    pub fn last_schedule_attempt_at(&self) -> AppResult<Option<DateTime<Utc>>> {
        self.db.kv_get_timestamp(LAST_SCHEDULE_ATTEMPT_KEY)
    }

    pub fn last_submit_at(&self) -> AppResult<Option<DateTime<Utc>>> {
        self.db.kv_get_timestamp(LAST_SUBMIT_KEY)
    }

    pub fn last_background_submit_at(&self) -> AppResult<Option<DateTime<Utc>>> {
        self.db.kv_get_timestamp(LAST_BACKGROUND_SUBMIT_KEY)
    }

    pub fn last_notification_sent_at(&self) -> AppResult<Option<DateTime<Utc>>> {
        self.db.kv_get_timestamp(LAST_NOTIFICATION_SENT_KEY)
    }

    pub fn throttle_ok(&self, now: DateTime<Utc>, window: Duration) -> AppResult<bool> {
        Ok(elapsed_at_least(self.last_schedule_attempt_at()?, now, window))
    }

    pub fn background_guard_ok(&self, now: DateTime<Utc>, window: Duration) -> AppResult<bool> {
        Ok(elapsed_at_least(self.last_background_submit_at()?, now, window))
    }

    pub fn notification_cooldown_ok(&self, now: DateTime<Utc>, window: Duration) -> AppResult<bool> {
        if window <= Duration::zero() {
            return Ok(true);
        }
        Ok(elapsed_at_least(self.last_notification_sent_at()?, now, window))
    }

    pub fn mark_schedule_attempt(&self, now: DateTime<Utc>) -> AppResult<()> {
        self.db.kv_set_timestamp(LAST_SCHEDULE_ATTEMPT_KEY, now)
    }

    pub fn mark_submitted(&self, now: DateTime<Utc>, background: bool) -> AppResult<()> {
        self.db.kv_set_timestamp(LAST_SUBMIT_KEY, now)?;
        if background {
            self.db.kv_set_timestamp(LAST_BACKGROUND_SUBMIT_KEY, now)?;
        }
        Ok(())
    }

    pub fn mark_notification_sent(&self, now: DateTime<Utc>) -> AppResult<()> {
        self.db.kv_set_timestamp(LAST_NOTIFICATION_SENT_KEY, now)
    }
}

#[cfg(test)]
mod tests {
    use super::{elapsed_at_least, ScheduleGuard};
    use crate::db::Database;
    use chrono::{Duration, TimeZone, Utc};
    use std::sync::Arc;

    #[test]
    fn elapsed_check_boundaries() {
        let now = Utc.with_ymd_and_hms(2026, 1, 24, 12, 0, 0).single().expect("now");
        let window = Duration::seconds(30);
        assert!(elapsed_at_least(None, now, window));
        assert!(!elapsed_at_least(Some(now - Duration::seconds(29)), now, window));
        assert!(elapsed_at_least(Some(now - Duration::seconds(30)), now, window));
        assert!(elapsed_at_least(Some(now + Duration::minutes(5)), now, window));
    }

    #[test]
    fn background_submit_updates_both_keys() {
        let dir = tempfile::tempdir().expect("tempdir");
        let db = Arc::new(Database::new(&dir.path().join("guard.db")).expect("db"));
        let guard = ScheduleGuard::new(db);
        let now = Utc.with_ymd_and_hms(2026, 1, 24, 12, 0, 0).single().expect("now");

        guard.mark_submitted(now, false).expect("foreground submit");
        assert_eq!(guard.last_submit_at().expect("read"), Some(now));
        assert_eq!(guard.last_background_submit_at().expect("read"), None);

        let later = now + Duration::minutes(1);
        guard.mark_submitted(later, true).expect("background submit");
        assert_eq!(guard.last_background_submit_at().expect("read"), Some(later));
        assert!(!guard
            .background_guard_ok(later + Duration::minutes(11), Duration::minutes(12))
            .expect("guard"));
        assert!(guard
            .background_guard_ok(later + Duration::minutes(12), Duration::minutes(12))
            .expect("guard"));
    }

    #[test]
    fn zero_cooldown_never_blocks() {
        let dir = tempfile::tempdir().expect("tempdir");
        let db = Arc::new(Database::new(&dir.path().join("guard.db")).expect("db"));
        let guard = ScheduleGuard::new(db);
        let now = Utc::now();
        guard.mark_notification_sent(now).expect("mark");
        assert!(guard.notification_cooldown_ok(now, Duration::zero()).expect("cooldown"));
        assert!(!guard.notification_cooldown_ok(now, Duration::minutes(10)).expect("cooldown"));
    }
}
