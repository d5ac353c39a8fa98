//! Append-only audit log of change attempts.
//!
//! The same rows feed the executor's rate-limit and budget-velocity gates, so
//! the window queries here are the source of truth for both.

use chrono::{DateTime, Utc};
use rusqlite::{params, OptionalExtension, Row};

use super::*;
use crate::types::{ChangeRecord, NewChangeRecord};

const HISTORY_COLUMNS: &str = "id, change_id, entity_id, account_id, change_type, worker_id,
     attempt, requested_magnitude, applied_magnitude, previous_budget, new_budget, outcome,
     error_kind, detail, latency_ms, recorded_at";

fn map_record(row: &Row<'_>) -> rusqlite::Result<ChangeRecord> {
    Ok(ChangeRecord {
        id: row.get(0)?,
        change_id: row.get(1)?,
        entity_id: row.get(2)?,
        account_id: row.get(3)?,
        change_type: enum_col(row, 4)?,
        worker_id: row.get(5)?,
        attempt: row.get::<_, i64>(6)?.max(0) as u32,
        requested_magnitude: row.get(7)?,
        applied_magnitude: row.get(8)?,
        previous_budget: row.get(9)?,
        new_budget: row.get(10)?,
        outcome: enum_col(row, 11)?,
        error_kind: row.get(12)?,
        detail: row.get(13)?,
        latency_ms: row.get(14)?,
        recorded_at: ts_col(row, 15)?,
    })
}

impl PacerDb {
    /// Append one attempt to the audit log. Returns the row id.
    pub fn append_change_record(&self, record: &NewChangeRecord) -> Result<i64, DbError> {
        self.conn.execute(
            "INSERT INTO change_history (change_id, entity_id, account_id, change_type,
                 worker_id, attempt, requested_magnitude, applied_magnitude, previous_budget,
                 new_budget, outcome, error_kind, detail, latency_ms, recorded_at)
             VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9, ?10, ?11, ?12, ?13, ?14, ?15)",
            params![
                record.change_id,
                record.entity_id,
                record.account_id,
                record.change_type.as_str(),
                record.worker_id,
                record.attempt as i64,
                record.requested_magnitude,
                record.applied_magnitude,
                record.previous_budget,
                record.new_budget,
                record.outcome.as_str(),
                record.error_kind,
                record.detail,
                record.latency_ms,
                to_db_ts(record.recorded_at),
            ],
        )?;
        Ok(self.conn.last_insert_rowid())
    }

    /// Successful changes applied to an entity since `since`.
    pub fn count_entity_changes_since(
        &self,
        entity_id: &str,
        since: DateTime<Utc>,
    ) -> Result<u32, DbError> {
        let n: i64 = self.conn.query_row(
            "SELECT COUNT(*) FROM change_history
             WHERE entity_id = ?1 AND outcome = 'success' AND recorded_at >= ?2",
            params![entity_id, to_db_ts(since)],
            |row| row.get(0),
        )?;
        Ok(n.max(0) as u32)
    }

    /// Successful changes applied anywhere in an account since `since`.
    pub fn count_account_changes_since(
        &self,
        account_id: &str,
        since: DateTime<Utc>,
    ) -> Result<u32, DbError> {
        let n: i64 = self.conn.query_row(
            "SELECT COUNT(*) FROM change_history
             WHERE account_id = ?1 AND outcome = 'success' AND recorded_at >= ?2",
            params![account_id, to_db_ts(since)],
            |row| row.get(0),
        )?;
        Ok(n.max(0) as u32)
    }

    /// Time of the oldest successful change to an entity since `since`.
    pub fn oldest_entity_change_since(
        &self,
        entity_id: &str,
        since: DateTime<Utc>,
    ) -> Result<Option<DateTime<Utc>>, DbError> {
        let oldest = self.conn.query_row(
            "SELECT MIN(recorded_at) FROM change_history
             WHERE entity_id = ?1 AND outcome = 'success' AND recorded_at >= ?2",
            params![entity_id, to_db_ts(since)],
            |row| opt_ts_col(row, 0),
        )?;
        Ok(oldest)
    }

    /// Time of the oldest successful change in an account since `since`.
    pub fn oldest_account_change_since(
        &self,
        account_id: &str,
        since: DateTime<Utc>,
    ) -> Result<Option<DateTime<Utc>>, DbError> {
        let oldest = self.conn.query_row(
            "SELECT MIN(recorded_at) FROM change_history
             WHERE account_id = ?1 AND outcome = 'success' AND recorded_at >= ?2",
            params![account_id, to_db_ts(since)],
            |row| opt_ts_col(row, 0),
        )?;
        Ok(oldest)
    }

    /// Budget the entity had when its velocity window opened: the
    /// `previous_budget` of the oldest successful scale since `since`, and
    /// when that scale landed. `None` if nothing moved the budget in the window.
    pub fn velocity_baseline_since(
        &self,
        entity_id: &str,
        since: DateTime<Utc>,
    ) -> Result<Option<(f64, DateTime<Utc>)>, DbError> {
        let baseline = self
            .conn
            .query_row(
                "SELECT previous_budget, recorded_at FROM change_history
                 WHERE entity_id = ?1 AND outcome = 'success'
                   AND change_type IN ('scale_up', 'scale_down')
                   AND previous_budget IS NOT NULL
                   AND recorded_at >= ?2
                 ORDER BY recorded_at, id
                 LIMIT 1",
                params![entity_id, to_db_ts(since)],
                |row| Ok((row.get::<_, f64>(0)?, ts_col(row, 1)?)),
            )
            .optional()?;
        Ok(baseline)
    }

    /// Every attempt recorded for one change, oldest first.
    pub fn history_for_change(&self, change_id: &str) -> Result<Vec<ChangeRecord>, DbError> {
        let sql = format!(
            "SELECT {HISTORY_COLUMNS} FROM change_history WHERE change_id = ?1 ORDER BY id"
        );
        let mut stmt = self.conn.prepare(&sql)?;
        let rows = stmt.query_map(params![change_id], map_record)?;

        let mut records = Vec::new();
        for row in rows {
            records.push(row?);
        }
        Ok(records)
    }

    /// Most recent audit rows across all entities, newest first.
    pub fn recent_history(&self, limit: i64) -> Result<Vec<ChangeRecord>, DbError> {
        let sql = format!("SELECT {HISTORY_COLUMNS} FROM change_history ORDER BY id DESC LIMIT ?1");
        let mut stmt = self.conn.prepare(&sql)?;
        let rows = stmt.query_map(params![limit], map_record)?;

        let mut records = Vec::new();
        for row in rows {
            records.push(row?);
        }
        Ok(records)
    }
}
