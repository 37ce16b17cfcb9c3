use crate::errors::{AppError, AppResult};
use crate::models::{CheckInterval, CheckSource, HistoryEntry, Preference};
use crate::settings::SchedulerSettings;
use chrono::{DateTime, NaiveTime, Utc};
use rusqlite::{params, Connection, OptionalExtension};
use std::fs;
use std::path::{Path, PathBuf};
use std::sync::{Mutex, MutexGuard};

const SCHEMA_SQL: &str = include_str!("schema.sql");
const SCHEDULER_SETTINGS_KEY: &str = "scheduler";
const TIME_OF_DAY_FORMAT: &str = "%H:%M";

const PREFERENCE_COLUMNS: &str = "check_interval_minutes, step_threshold, is_notification_enabled,
     quiet_hours_start, quiet_hours_end, last_background_steps, last_background_check_time,
     life_water, tree_level, worker_level, tree_investment, worker_investment, last_win_at, is_super_user";

#[derive(Debug)]
pub struct Database {
    conn: Mutex<Connection>,
    db_path: PathBuf,
}

impl Database {
    pub fn new(path: &Path) -> AppResult<Self> {
        if let Some(parent) = path.parent() {
            fs::create_dir_all(parent).map_err(|err| AppError::Io(err.to_string()))?;
        }
        let conn = Connection::open(path).map_err(AppError::from)?;
        conn.execute_batch(SCHEMA_SQL).map_err(AppError::from)?;

        let db = Self {
            conn: Mutex::new(conn),
            db_path: path.to_path_buf(),
        };

        db.ensure_schema_extensions()?;
        db.ensure_default_settings()?;
        db.ensure_default_preference()?;

        Ok(db)
    }

    pub fn path(&self) -> &Path {
        &self.db_path
    }

    fn lock(&self) -> AppResult<MutexGuard<'_, Connection>> {
        self.conn
            .lock()
            .map_err(|_| AppError::Internal("database mutex poisoned".to_string()))
    }

    pub fn get_preference(&self) -> AppResult<Option<Preference>> {
        let conn = self.lock()?;
        let query = format!("SELECT {} FROM preferences WHERE id = 1", PREFERENCE_COLUMNS);
        let pref = conn.query_row(&query, [], parse_preference_row).optional()?;
        Ok(pref)
    }

    /// Overwrites the whole row, mirror columns included. Edits made while
    /// checks may run go through [`Database::modify_preference`].
    pub fn save_preference(&self, pref: &Preference) -> AppResult<()> {
        let conn = self.lock()?;
        write_preference(&conn, pref)?;
        Ok(())
    }

    /// Read, edit and write the preference row in one transaction under the
    /// connection lock, so a concurrent [`Database::record_check`] is never
    /// overwritten with stale mirror values. `edit` must not touch the database.
    pub fn modify_preference<T>(
        &self,
        edit: impl FnOnce(&mut Preference) -> AppResult<T>,
    ) -> AppResult<(Preference, T)> {
        let mut conn = self.lock()?;
        let tx = conn.transaction()?;
        let query = format!("SELECT {} FROM preferences WHERE id = 1", PREFERENCE_COLUMNS);
        let mut pref = tx
            .query_row(&query, [], parse_preference_row)
            .optional()?
            .ok_or_else(|| AppError::NotFound("preference".to_string()))?;
        let value = edit(&mut pref)?;
        write_preference(&tx, &pref)?;
        tx.commit()?;
        Ok((pref, value))
    }

    /// Persist one check atomically: mirror the result onto the preference row,
    /// append the history entry and trim history to `cap`. Returns the number
    /// of evicted entries.
    pub fn record_check(&self, entry: &HistoryEntry, cap: u32) -> AppResult<usize> {
        let mut conn = self.lock()?;
        let tx = conn.transaction()?;

        tx.execute(
            "UPDATE preferences
             SET last_background_steps = ?1, last_background_check_time = ?2, updated_at = ?3
             WHERE id = 1",
            params![
                entry.steps_in_window,
                entry.timestamp.to_rfc3339(),
                Utc::now().to_rfc3339()
            ],
        )?;
        insert_history(&tx, entry)?;
        let evicted = prune_history(&tx, cap)?;

        tx.commit()?;
        Ok(evicted)
    }

    /// Newest first.
    pub fn list_history(&self, limit: usize) -> AppResult<Vec<HistoryEntry>> {
        let conn = self.lock()?;
        let mut stmt = conn.prepare(
            "SELECT timestamp, steps_in_window, threshold, was_notified, window_minutes, source, measurement_available
             FROM history_entries
             ORDER BY timestamp DESC, id DESC
             LIMIT ?1",
        )?;
        let rows = stmt.query_map([limit as i64], parse_history_row)?;
        let mut entries = Vec::new();
        for row in rows {
            entries.push(row?);
        }
        Ok(entries)
    }

    pub fn history_count(&self) -> AppResult<usize> {
        let conn = self.lock()?;
        let count: i64 = conn.query_row("SELECT COUNT(1) FROM history_entries", [], |row| row.get(0))?;
        Ok(count.max(0) as usize)
    }

    pub fn kv_get(&self, key: &str) -> AppResult<Option<String>> {
        let conn = self.lock()?;
        let value = conn
            .query_row("SELECT value FROM kv_store WHERE key = ?1", [key], |row| {
                row.get::<_, String>(0)
            })
            .optional()?;
        Ok(value)
    }

    pub fn kv_set(&self, key: &str, value: &str) -> AppResult<()> {
        let conn = self.lock()?;
        conn.execute(
            "INSERT INTO kv_store (key, value, updated_at) VALUES (?1, ?2, ?3)
             ON CONFLICT(key) DO UPDATE SET value = excluded.value, updated_at = excluded.updated_at",
            params![key, value, Utc::now().to_rfc3339()],
        )?;
        Ok(())
    }

    pub fn kv_remove(&self, key: &str) -> AppResult<bool> {
        let conn = self.lock()?;
        let removed = conn.execute("DELETE FROM kv_store WHERE key = ?1", [key])?;
        Ok(removed > 0)
    }

    /// Unparseable timestamps read as absent so a corrupt guard never blocks scheduling.
    pub fn kv_get_timestamp(&self, key: &str) -> AppResult<Option<DateTime<Utc>>> {
        let Some(raw) = self.kv_get(key)? else {
            return Ok(None);
        };
        match DateTime::parse_from_rfc3339(&raw) {
            Ok(value) => Ok(Some(value.with_timezone(&Utc))),
            Err(error) => {
                tracing::warn!(key, error = %error, "ignoring malformed stored timestamp");
                Ok(None)
            }
        }
    }

    pub fn kv_set_timestamp(&self, key: &str, at: DateTime<Utc>) -> AppResult<()> {
        self.kv_set(key, &at.to_rfc3339())
    }

    pub fn get_scheduler_settings(&self) -> AppResult<SchedulerSettings> {
        let conn = self.lock()?;
        let raw = conn
            .query_row(
                "SELECT value_json FROM settings WHERE key = ?1",
                [SCHEDULER_SETTINGS_KEY],
                |row| row.get::<_, String>(0),
            )
            .optional()?;

        match raw {
            Some(raw) => match serde_json::from_str::<SchedulerSettings>(&raw) {
                Ok(settings) => Ok(settings),
                Err(error) => {
                    tracing::warn!(error = %error, "ignoring malformed scheduler settings; using defaults");
                    Ok(SchedulerSettings::default())
                }
            },
            None => Ok(SchedulerSettings::default()),
        }
    }

    pub fn update_scheduler_settings(&self, update: serde_json::Value) -> AppResult<SchedulerSettings> {
        let current = self.get_scheduler_settings()?;
        let mut merged = serde_json::to_value(current)?;
        merge_json(&mut merged, update);
        let settings: SchedulerSettings = serde_json::from_value(merged)
            .map_err(|error| AppError::Validation(format!("invalid scheduler settings: {}", error)))?;

        let conn = self.lock()?;
        conn.execute(
            "INSERT INTO settings (key, value_json, updated_at)
             VALUES (?1, ?2, ?3)
             ON CONFLICT(key) DO UPDATE SET value_json = excluded.value_json, updated_at = excluded.updated_at",
            params![
                SCHEDULER_SETTINGS_KEY,
                serde_json::to_string(&settings)?,
                Utc::now().to_rfc3339()
            ],
        )?;

        Ok(settings)
    }

    fn ensure_schema_extensions(&self) -> AppResult<()> {
        let conn = self.lock()?;

        if !column_exists(&conn, "history_entries", "source")? {
            conn.execute(
                "ALTER TABLE history_entries ADD COLUMN source TEXT NOT NULL DEFAULT 'background-task'",
                [],
            )?;
        }
        if !column_exists(&conn, "history_entries", "measurement_available")? {
            conn.execute(
                "ALTER TABLE history_entries ADD COLUMN measurement_available INTEGER NOT NULL DEFAULT 1",
                [],
            )?;
        }
        Ok(())
    }

    fn ensure_default_settings(&self) -> AppResult<()> {
        let conn = self.lock()?;
        let count: i64 = conn.query_row(
            "SELECT COUNT(1) FROM settings WHERE key = ?1",
            [SCHEDULER_SETTINGS_KEY],
            |row| row.get(0),
        )?;
        if count == 0 {
            conn.execute(
                "INSERT INTO settings (key, value_json, updated_at) VALUES (?1, ?2, ?3)",
                params![
                    SCHEDULER_SETTINGS_KEY,
                    serde_json::to_string(&SchedulerSettings::default())?,
                    Utc::now().to_rfc3339()
                ],
            )?;
        }
        Ok(())
    }

    fn ensure_default_preference(&self) -> AppResult<()> {
        let conn = self.lock()?;
        let count: i64 = conn.query_row("SELECT COUNT(1) FROM preferences", [], |row| row.get(0))?;
        if count == 0 {
            write_preference(&conn, &Preference::default())?;
            tracing::info!("created default preference row");
        }
        Ok(())
    }

    #[cfg(test)]
    pub(crate) fn delete_preference(&self) -> AppResult<()> {
        let conn = self.lock()?;
        conn.execute("DELETE FROM preferences", [])?;
        Ok(())
    }
}

fn write_preference(conn: &Connection, pref: &Preference) -> AppResult<()> {
    conn.execute(
        "INSERT INTO preferences (
           id, check_interval_minutes, step_threshold, is_notification_enabled,
           quiet_hours_start, quiet_hours_end, last_background_steps, last_background_check_time,
           life_water, tree_level, worker_level, tree_investment, worker_investment,
           last_win_at, is_super_user, updated_at
         ) VALUES (1, ?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9, ?10, ?11, ?12, ?13, ?14, ?15)
         ON CONFLICT(id) DO UPDATE SET
           check_interval_minutes = excluded.check_interval_minutes,
           step_threshold = excluded.step_threshold,
           is_notification_enabled = excluded.is_notification_enabled,
           quiet_hours_start = excluded.quiet_hours_start,
           quiet_hours_end = excluded.quiet_hours_end,
           last_background_steps = excluded.last_background_steps,
           last_background_check_time = excluded.last_background_check_time,
           life_water = excluded.life_water,
           tree_level = excluded.tree_level,
           worker_level = excluded.worker_level,
           tree_investment = excluded.tree_investment,
           worker_investment = excluded.worker_investment,
           last_win_at = excluded.last_win_at,
           is_super_user = excluded.is_super_user,
           updated_at = excluded.updated_at",
        params![
            pref.check_interval.minutes(),
            pref.step_threshold,
            pref.is_notification_enabled,
            pref.quiet_hours_start.map(format_time_of_day),
            pref.quiet_hours_end.map(format_time_of_day),
            pref.last_background_steps,
            pref.last_background_check_time.map(|at| at.to_rfc3339()),
            pref.life_water,
            pref.tree_level,
            pref.worker_level,
            pref.tree_investment,
            pref.worker_investment,
            pref.last_win_at.map(|at| at.to_rfc3339()),
            pref.is_super_user,
            Utc::now().to_rfc3339(),
        ],
    )?;
    Ok(())
}

fn insert_history(conn: &Connection, entry: &HistoryEntry) -> AppResult<()> {
    conn.execute(
        "INSERT INTO history_entries (
           timestamp, steps_in_window, threshold, was_notified, window_minutes, source, measurement_available
         ) VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7)",
        params![
            entry.timestamp.to_rfc3339(),
            entry.steps_in_window,
            entry.threshold,
            entry.was_notified,
            entry.window_minutes,
            entry.source.as_str(),
            entry.measurement_available,
        ],
    )?;
    Ok(())
}

fn prune_history(conn: &Connection, cap: u32) -> AppResult<usize> {
    let evicted = conn.execute(
        "DELETE FROM history_entries
         WHERE id NOT IN (
           SELECT id FROM history_entries ORDER BY timestamp DESC, id DESC LIMIT ?1
         )",
        [cap],
    )?;
    Ok(evicted)
}

fn parse_preference_row(row: &rusqlite::Row<'_>) -> rusqlite::Result<Preference> {
    Ok(Preference {
        check_interval: parse_interval(row.get::<_, u32>(0)?)?,
        step_threshold: row.get(1)?,
        is_notification_enabled: row.get(2)?,
        quiet_hours_start: row
            .get::<_, Option<String>>(3)?
            .map(|raw| parse_time_of_day(&raw))
            .transpose()?,
        quiet_hours_end: row
            .get::<_, Option<String>>(4)?
            .map(|raw| parse_time_of_day(&raw))
            .transpose()?,
        last_background_steps: row.get(5)?,
        last_background_check_time: row
            .get::<_, Option<String>>(6)?
            .map(|raw| parse_time(&raw))
            .transpose()?,
        life_water: row.get(7)?,
        tree_level: row.get(8)?,
        worker_level: row.get(9)?,
        tree_investment: row.get(10)?,
        worker_investment: row.get(11)?,
        last_win_at: row
            .get::<_, Option<String>>(12)?
            .map(|raw| parse_time(&raw))
            .transpose()?,
        is_super_user: row.get(13)?,
    })
}

fn parse_history_row(row: &rusqlite::Row<'_>) -> rusqlite::Result<HistoryEntry> {
    Ok(HistoryEntry {
        timestamp: parse_time(&row.get::<_, String>(0)?)?,
        steps_in_window: row.get(1)?,
        threshold: row.get(2)?,
        was_notified: row.get(3)?,
        window_minutes: row.get(4)?,
        source: parse_source(&row.get::<_, String>(5)?),
        measurement_available: row.get(6)?,
    })
}

fn column_exists(conn: &Connection, table: &str, column: &str) -> AppResult<bool> {
    let pragma = format!("PRAGMA table_info({})", table);
    let mut stmt = conn.prepare(&pragma)?;
    let mut rows = stmt.query([])?;
    while let Some(row) = rows.next()? {
        let name: String = row.get(1)?;
        if name == column {
            return Ok(true);
        }
    }
    Ok(false)
}

fn parse_interval(minutes: u32) -> rusqlite::Result<CheckInterval> {
    CheckInterval::from_minutes(minutes).ok_or_else(|| conversion_error(format!("Unknown check interval '{}'", minutes)))
}

fn parse_source(raw: &str) -> CheckSource {
    CheckSource::parse(raw).unwrap_or(CheckSource::BackgroundTask)
}

fn format_time_of_day(time: NaiveTime) -> String {
    time.format(TIME_OF_DAY_FORMAT).to_string()
}

fn parse_time_of_day(raw: &str) -> rusqlite::Result<NaiveTime> {
    NaiveTime::parse_from_str(raw, TIME_OF_DAY_FORMAT).map_err(|error| conversion_error(error.to_string()))
}

fn parse_time(raw: &str) -> rusqlite::Result<DateTime<Utc>> {
    DateTime::parse_from_rfc3339(raw)
        .map(|dt| dt.with_timezone(&Utc))
        .map_err(|error| conversion_error(error.to_string()))
}

fn conversion_error(message: String) -> rusqlite::Error {
    rusqlite::Error::FromSqlConversionFailure(
        0,
        rusqlite::types::Type::Text,
        Box::new(std::io::Error::new(std::io::ErrorKind::InvalidData, message)),
    )
}

fn merge_json(target: &mut serde_json::Value, update: serde_json::Value) {
    match (target, update) {
        (serde_json::Value::Object(target_map), serde_json::Value::Object(update_map)) => {
            for (key, value) in update_map {
                merge_json(target_map.entry(key).or_insert(serde_json::Value::Null), value);
            }
        }
        (target, update) => {
            *target = update;
        }
    }
}

#[cfg(test)]
mod tests {
    use super::Database;
    use crate::models::{CheckInterval, CheckSource, HistoryEntry, Preference};
    use chrono::{Duration, NaiveTime, TimeZone, Utc};
    use serde_json::json;

    fn open(dir: &tempfile::TempDir) -> Database {
        Database::new(&dir.path().join("test.db")).expect("db")
    }

    fn entry_at(minute: i64, steps: u32) -> HistoryEntry {
        HistoryEntry {
            timestamp: Utc.with_ymd_and_hms(2026, 1, 24, 9, 0, 0).single().expect("timestamp")
                + Duration::minutes(minute),
            steps_in_window: steps,
            threshold: 100,
            was_notified: steps < 100,
            window_minutes: 60,
            source: CheckSource::BackgroundTask,
            measurement_available: true,
        }
    }

    #[test]
    fn first_open_creates_default_preference() {
        let dir = tempfile::tempdir().expect("tempdir");
        let db = open(&dir);
        let pref = db.get_preference().expect("read").expect("present");
        assert_eq!(pref, Preference::default());
    }

    #[test]
    fn reopening_keeps_existing_preference() {
        let dir = tempfile::tempdir().expect("tempdir");
        {
            let db = open(&dir);
            let mut pref = Preference::default();
            pref.step_threshold = 450;
            db.save_preference(&pref).expect("save");
        }
        let db = open(&dir);
        let pref = db.get_preference().expect("read").expect("present");
        assert_eq!(pref.step_threshold, 450);
    }

    #[test]
    fn preference_round_trips_every_field() {
        let dir = tempfile::tempdir().expect("tempdir");
        let db = open(&dir);
        let pref = Preference {
            check_interval: CheckInterval::Ninety,
            step_threshold: 250,
            is_notification_enabled: false,
            quiet_hours_start: NaiveTime::from_hms_opt(22, 30, 0),
            quiet_hours_end: NaiveTime::from_hms_opt(7, 15, 0),
            last_background_steps: Some(42),
            last_background_check_time: Utc.with_ymd_and_hms(2026, 2, 1, 12, 0, 0).single(),
            life_water: 70,
            tree_level: 12,
            worker_level: 3,
            tree_investment: 40,
            worker_investment: 10,
            last_win_at: Utc.with_ymd_and_hms(2026, 2, 1, 11, 0, 0).single(),
            is_super_user: true,
        };
        db.save_preference(&pref).expect("save");
        let loaded = db.get_preference().expect("read").expect("present");
        assert_eq!(loaded, pref);
    }

    #[test]
    fn history_is_capped_and_keeps_newest_first() {
        let dir = tempfile::tempdir().expect("tempdir");
        let db = open(&dir);
        for minute in 0..30 {
            db.record_check(&entry_at(minute, minute as u32), 30).expect("record");
        }
        assert_eq!(db.history_count().expect("count"), 30);

        let evicted = db.record_check(&entry_at(30, 30), 30).expect("record 31st");
        assert_eq!(evicted, 1);
        assert_eq!(db.history_count().expect("count"), 30);

        let entries = db.list_history(100).expect("list");
        assert_eq!(entries.len(), 30);
        assert_eq!(entries[0].steps_in_window, 30);
        assert_eq!(entries[29].steps_in_window, 1);
        assert!(entries.windows(2).all(|pair| pair[0].timestamp > pair[1].timestamp));
    }

    #[test]
    fn record_check_mirrors_result_onto_preference() {
        let dir = tempfile::tempdir().expect("tempdir");
        let db = open(&dir);
        let entry = entry_at(5, 40);
        db.record_check(&entry, 30).expect("record");
        let pref = db.get_preference().expect("read").expect("present");
        assert_eq!(pref.last_background_steps, Some(40));
        assert_eq!(pref.last_background_check_time, Some(entry.timestamp));
    }

    #[test]
    fn modify_preference_keeps_mirror_written_since_last_read() {
        let dir = tempfile::tempdir().expect("tempdir");
        let db = open(&dir);
        let stale = db.get_preference().expect("read").expect("present");
        let entry = entry_at(5, 40);
        db.record_check(&entry, 30).expect("record");

        let (pref, previous) = db
            .modify_preference(|pref| {
                let previous = pref.step_threshold;
                pref.step_threshold = 300;
                Ok(previous)
            })
            .expect("modify");
        assert_eq!(previous, stale.step_threshold);
        assert_eq!(pref.step_threshold, 300);

        let loaded = db.get_preference().expect("read").expect("present");
        assert_eq!(loaded.step_threshold, 300);
        assert_eq!(loaded.last_background_steps, Some(40));
        assert_eq!(loaded.last_background_check_time, Some(entry.timestamp));
    }

    #[test]
    fn failed_edit_leaves_preference_untouched() {
        let dir = tempfile::tempdir().expect("tempdir");
        let db = open(&dir);
        let result = db.modify_preference(|pref| -> crate::errors::AppResult<()> {
            pref.step_threshold = 999;
            Err(crate::errors::AppError::Validation("rejected".to_string()))
        });
        assert!(result.is_err());
        assert_eq!(db.get_preference().expect("read").expect("present"), Preference::default());
    }

    #[test]
    fn malformed_scheduler_settings_fall_back_to_defaults() {
        let dir = tempfile::tempdir().expect("tempdir");
        let db = open(&dir);
        {
            let conn = db.lock().expect("lock");
            conn.execute("UPDATE settings SET value_json = 'not json' WHERE key = 'scheduler'", [])
                .expect("corrupt");
        }
        assert_eq!(db.get_scheduler_settings().expect("settings"), crate::settings::SchedulerSettings::default());
    }

    #[test]
    fn kv_timestamps_round_trip_and_tolerate_garbage() {
        let dir = tempfile::tempdir().expect("tempdir");
        let db = open(&dir);
        let at = Utc.with_ymd_and_hms(2026, 3, 1, 8, 0, 0).single().expect("timestamp");
        db.kv_set_timestamp("last_submit_at", at).expect("set");
        assert_eq!(db.kv_get_timestamp("last_submit_at").expect("get"), Some(at));

        db.kv_set("last_submit_at", "not a date").expect("set");
        assert_eq!(db.kv_get_timestamp("last_submit_at").expect("get"), None);

        assert!(db.kv_remove("last_submit_at").expect("remove"));
        assert_eq!(db.kv_get("last_submit_at").expect("get"), None);
    }

    #[test]
    fn scheduler_settings_merge_update() {
        let dir = tempfile::tempdir().expect("tempdir");
        let db = open(&dir);
        let updated = db
            .update_scheduler_settings(json!({ "historyCap": 100, "quietHoursGating": true }))
            .expect("update");
        assert_eq!(updated.history_cap, 100);
        assert!(updated.quiet_hours_gating);
        assert_eq!(updated.submit_throttle_seconds, 30);

        let reloaded = db.get_scheduler_settings().expect("reload");
        assert_eq!(reloaded, updated);

        let invalid = db.update_scheduler_settings(json!({ "historyCap": "lots" }));
        assert!(invalid.is_err());
    }
}
