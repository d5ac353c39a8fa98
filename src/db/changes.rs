//! Change queue: durable pending changes with an exclusive claim lifecycle.
//!
//! `pending -> claimed -> executing -> completed | failed`. Every transition
//! after the claim is guarded by `claimed_by`, so only the claiming worker can
//! move its row forward. The reaper is the only other writer.

use chrono::{DateTime, Duration, Utc};
use rusqlite::{params, OptionalExtension, Row};
use uuid::Uuid;

use super::*;
use crate::types::{ChangeStatus, NewChange, PendingChange};

const CHANGE_COLUMNS: &str = "change_id, entity_id, account_id, change_type, requested_magnitude,
     status, claimed_by, claimed_at, attempts, applied_magnitude, failure_reason,
     created_at, updated_at, available_at";

fn map_change(row: &Row<'_>) -> rusqlite::Result<PendingChange> {
    Ok(PendingChange {
        change_id: row.get(0)?,
        entity_id: row.get(1)?,
        account_id: row.get(2)?,
        change_type: enum_col(row, 3)?,
        requested_magnitude: row.get(4)?,
        status: enum_col(row, 5)?,
        claimed_by: row.get(6)?,
        claimed_at: opt_ts_col(row, 7)?,
        available_at: opt_ts_col(row, 13)?,
        attempts: row.get::<_, i64>(8)?.max(0) as u32,
        applied_magnitude: row.get(9)?,
        failure_reason: row.get(10)?,
        created_at: ts_col(row, 11)?,
        updated_at: ts_col(row, 12)?,
    })
}

fn is_unique_violation(err: &rusqlite::Error) -> bool {
    matches!(
        err,
        rusqlite::Error::SqliteFailure(e, _)
            if e.extended_code == rusqlite::ffi::SQLITE_CONSTRAINT_UNIQUE
    )
}

/// Result of one reaper pass.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, serde::Serialize)]
#[serde(rename_all = "camelCase")]
pub struct ReapReport {
    /// Claimed rows returned to `pending`.
    pub requeued: usize,
    /// Executing rows marked `failed`.
    pub failed: usize,
}

impl PacerDb {
    /// Enqueue a change. Fails with `OutstandingChange` if the entity already
    /// has a pending, claimed or executing change.
    pub fn enqueue_change(&self, change: &NewChange, now: DateTime<Utc>) -> Result<String, DbError> {
        self.with_transaction(|db| {
            if db.outstanding_change_for(&change.entity_id)?.is_some() {
                return Err(DbError::OutstandingChange(change.entity_id.clone()));
            }

            let change_id = format!("chg-{}", Uuid::new_v4());
            let ts = to_db_ts(now);
            db.conn
                .execute(
                    "INSERT INTO pending_changes (change_id, entity_id, account_id, change_type,
                         requested_magnitude, status, created_at, updated_at)
                     VALUES (?1, ?2, ?3, ?4, ?5, 'pending', ?6, ?6)",
                    params![
                        change_id,
                        change.entity_id,
                        change.account_id,
                        change.change_type.as_str(),
                        change.requested_magnitude,
                        ts,
                    ],
                )
                .map_err(|e| {
                    if is_unique_violation(&e) {
                        DbError::OutstandingChange(change.entity_id.clone())
                    } else {
                        DbError::Sqlite(e)
                    }
                })?;

            log::debug!(
                "Queue: enqueued {} {} {:+.4} for {}",
                change_id,
                change.change_type.as_str(),
                change.requested_magnitude,
                change.entity_id
            );
            Ok(change_id)
        })
    }

    /// Atomically claim the oldest due pending change for `worker_id`.
    ///
    /// Rows deferred into the future are skipped until `available_at`, and
    /// order by the time they became due. The select and the update are one
    /// statement inside an immediate transaction, so concurrent claimers
    /// serialize on the write lock and each sees the previous claimer's row
    /// as no longer pending.
    pub fn claim_next_change(
        &self,
        worker_id: &str,
        now: DateTime<Utc>,
    ) -> Result<Option<PendingChange>, DbError> {
        let sql = format!(
            "UPDATE pending_changes
             SET status = 'claimed', claimed_by = ?1, claimed_at = ?2, updated_at = ?2
             WHERE change_id = (
                 SELECT change_id FROM pending_changes
                 WHERE status = 'pending'
                   AND (available_at IS NULL OR available_at <= ?2)
                 ORDER BY COALESCE(available_at, created_at), created_at, change_id
                 LIMIT 1
             )
             AND status = 'pending'
             RETURNING {CHANGE_COLUMNS}"
        );
        let ts = to_db_ts(now);
        self.with_transaction(|db| {
            let claimed = db
                .conn
                .query_row(&sql, params![worker_id, ts], map_change)
                .optional()?;
            Ok(claimed)
        })
    }

    /// `claimed -> executing`. Returns false if the worker no longer holds the claim.
    pub fn mark_executing(
        &self,
        change_id: &str,
        worker_id: &str,
        now: DateTime<Utc>,
    ) -> Result<bool, DbError> {
        let updated = self.conn.execute(
            "UPDATE pending_changes SET status = 'executing', updated_at = ?3
             WHERE change_id = ?1 AND claimed_by = ?2 AND status = 'claimed'",
            params![change_id, worker_id, to_db_ts(now)],
        )?;
        Ok(updated == 1)
    }

    /// `executing -> completed`, recording what was actually applied.
    pub fn complete_change(
        &self,
        change_id: &str,
        worker_id: &str,
        applied_magnitude: f64,
        attempts: u32,
        now: DateTime<Utc>,
    ) -> Result<bool, DbError> {
        let updated = self.conn.execute(
            "UPDATE pending_changes
             SET status = 'completed', applied_magnitude = ?3, attempts = ?4, updated_at = ?5
             WHERE change_id = ?1 AND claimed_by = ?2 AND status = 'executing'",
            params![change_id, worker_id, applied_magnitude, attempts as i64, to_db_ts(now)],
        )?;
        Ok(updated == 1)
    }

    /// `claimed | executing -> failed` with the reason kept for alerting.
    pub fn fail_change(
        &self,
        change_id: &str,
        worker_id: &str,
        reason: &str,
        attempts: u32,
        now: DateTime<Utc>,
    ) -> Result<bool, DbError> {
        let updated = self.conn.execute(
            "UPDATE pending_changes
             SET status = 'failed', failure_reason = ?3, attempts = ?4, updated_at = ?5
             WHERE change_id = ?1 AND claimed_by = ?2 AND status IN ('claimed', 'executing')",
            params![change_id, worker_id, reason, attempts as i64, to_db_ts(now)],
        )?;
        Ok(updated == 1)
    }

    /// `claimed -> pending`, releasing the claim until `available_at`. Used
    /// when a safety gate defers a job; other changes are claimed meanwhile.
    pub fn requeue_change(
        &self,
        change_id: &str,
        worker_id: &str,
        available_at: DateTime<Utc>,
        now: DateTime<Utc>,
    ) -> Result<bool, DbError> {
        let updated = self.conn.execute(
            "UPDATE pending_changes
             SET status = 'pending', claimed_by = NULL, claimed_at = NULL,
                 available_at = ?3, updated_at = ?4
             WHERE change_id = ?1 AND claimed_by = ?2 AND status = 'claimed'",
            params![change_id, worker_id, to_db_ts(available_at), to_db_ts(now)],
        )?;
        Ok(updated == 1)
    }

    /// Changes in `account_id` currently executing on the platform, other than
    /// `exclude_change_id`. Rows without an account inherit their entity's.
    pub fn count_account_in_flight(
        &self,
        account_id: &str,
        exclude_change_id: &str,
    ) -> Result<u32, DbError> {
        let n: i64 = self.conn.query_row(
            "SELECT COUNT(*) FROM pending_changes pc
             WHERE pc.status = 'executing' AND pc.change_id <> ?2
               AND COALESCE(
                   pc.account_id,
                   (SELECT e.account_id FROM entities e WHERE e.entity_id = pc.entity_id)
               ) = ?1",
            params![account_id, exclude_change_id],
            |row| row.get(0),
        )?;
        Ok(n.max(0) as u32)
    }

    /// Delete a change nobody has claimed yet.
    pub fn cancel_change(&self, change_id: &str) -> Result<bool, DbError> {
        let deleted = self.conn.execute(
            "DELETE FROM pending_changes WHERE change_id = ?1 AND status = 'pending'",
            params![change_id],
        )?;
        Ok(deleted == 1)
    }

    /// Release claims older than `claim_timeout`.
    ///
    /// Claimed rows go back to `pending`. Executing rows are failed instead:
    /// the platform call may already have landed and must not run twice.
    pub fn reap_expired_claims(
        &self,
        now: DateTime<Utc>,
        claim_timeout: Duration,
    ) -> Result<ReapReport, DbError> {
        let cutoff = to_db_ts(now - claim_timeout);
        let ts = to_db_ts(now);
        let report = self.with_transaction(|db| -> Result<ReapReport, DbError> {
            let requeued = db.conn.execute(
                "UPDATE pending_changes
                 SET status = 'pending', claimed_by = NULL, claimed_at = NULL, updated_at = ?2
                 WHERE status = 'claimed' AND claimed_at < ?1",
                params![cutoff, ts],
            )?;
            let failed = db.conn.execute(
                "UPDATE pending_changes
                 SET status = 'failed', updated_at = ?2,
                     failure_reason = 'claim expired during execution'
                 WHERE status = 'executing' AND claimed_at < ?1",
                params![cutoff, ts],
            )?;
            Ok(ReapReport { requeued, failed })
        })?;

        if report.requeued > 0 || report.failed > 0 {
            log::warn!(
                "Reaper: requeued {} expired claims, failed {} stuck executions",
                report.requeued,
                report.failed
            );
        }
        Ok(report)
    }

    pub fn get_change(&self, change_id: &str) -> Result<Option<PendingChange>, DbError> {
        let sql = format!("SELECT {CHANGE_COLUMNS} FROM pending_changes WHERE change_id = ?1");
        let change = self
            .conn
            .query_row(&sql, params![change_id], map_change)
            .optional()?;
        Ok(change)
    }

    /// The entity's non-terminal change, if any.
    pub fn outstanding_change_for(&self, entity_id: &str) -> Result<Option<PendingChange>, DbError> {
        let sql = format!(
            "SELECT {CHANGE_COLUMNS} FROM pending_changes
             WHERE entity_id = ?1 AND status IN ('pending', 'claimed', 'executing')"
        );
        let change = self
            .conn
            .query_row(&sql, params![entity_id], map_change)
            .optional()?;
        Ok(change)
    }

    pub fn list_changes_by_status(
        &self,
        status: ChangeStatus,
        limit: i64,
    ) -> Result<Vec<PendingChange>, DbError> {
        let sql = format!(
            "SELECT {CHANGE_COLUMNS} FROM pending_changes
             WHERE status = ?1
             ORDER BY created_at, change_id
             LIMIT ?2"
        );
        let mut stmt = self.conn.prepare(&sql)?;
        let rows = stmt.query_map(params![status.as_str(), limit], map_change)?;

        let mut changes = Vec::new();
        for row in rows {
            changes.push(row?);
        }
        Ok(changes)
    }

    /// Queue depth per status, every status present (zero when empty).
    pub fn count_changes_by_status(&self) -> Result<Vec<(ChangeStatus, i64)>, DbError> {
        let mut counts = Vec::with_capacity(ChangeStatus::ALL.len());
        for status in ChangeStatus::ALL {
            let n: i64 = self.conn.query_row(
                "SELECT COUNT(*) FROM pending_changes WHERE status = ?1",
                params![status.as_str()],
                |row| row.get(0),
            )?;
            counts.push((status, n));
        }
        Ok(counts)
    }
}
