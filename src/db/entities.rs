use chrono::{DateTime, Utc};
use rusqlite::{params, OptionalExtension, Row};

use super::*;
use crate::types::{BanditParams, EntityState, EntityStatus};

const ENTITY_COLUMNS: &str = "entity_id, account_id, mode, status, impressions, clicks, spend,
     early_signal_value, late_signal_value, daily_budget, bandit_alpha, bandit_beta,
     first_seen_at, last_signal_at, updated_at";

fn map_entity(row: &Row<'_>) -> rusqlite::Result<EntityState> {
    Ok(EntityState {
        entity_id: row.get(0)?,
        account_id: row.get(1)?,
        mode: enum_col(row, 2)?,
        status: enum_col(row, 3)?,
        impressions: row.get::<_, i64>(4)?.max(0) as u64,
        clicks: row.get::<_, i64>(5)?.max(0) as u64,
        spend: row.get(6)?,
        early_signal_value: row.get(7)?,
        late_signal_value: row.get(8)?,
        daily_budget: row.get(9)?,
        bandit: BanditParams {
            alpha: row.get(10)?,
            beta: row.get(11)?,
        },
        first_seen_at: ts_col(row, 12)?,
        last_signal_at: opt_ts_col(row, 13)?,
        updated_at: ts_col(row, 14)?,
    })
}

impl PacerDb {
    // =========================================================================
    // Entity state
    // =========================================================================

    pub fn get_entity(&self, entity_id: &str) -> Result<Option<EntityState>, DbError> {
        let sql = format!("SELECT {ENTITY_COLUMNS} FROM entities WHERE entity_id = ?1");
        let entity = self
            .conn
            .query_row(&sql, params![entity_id], map_entity)
            .optional()?;
        Ok(entity)
    }

    pub fn list_entities_by_status(
        &self,
        status: EntityStatus,
    ) -> Result<Vec<EntityState>, DbError> {
        let sql = format!(
            "SELECT {ENTITY_COLUMNS} FROM entities WHERE status = ?1 ORDER BY entity_id"
        );
        let mut stmt = self.conn.prepare(&sql)?;
        let rows = stmt.query_map(params![status.as_str()], map_entity)?;

        let mut entities = Vec::new();
        for row in rows {
            entities.push(row?);
        }
        Ok(entities)
    }

    /// Entities the decision engine should evaluate.
    pub fn list_active_entities(&self) -> Result<Vec<EntityState>, DbError> {
        self.list_entities_by_status(EntityStatus::Active)
    }

    pub fn insert_entity(&self, entity: &EntityState) -> Result<(), DbError> {
        self.conn.execute(
            "INSERT INTO entities (entity_id, account_id, mode, status, impressions, clicks,
                 spend, early_signal_value, late_signal_value, daily_budget, bandit_alpha,
                 bandit_beta, first_seen_at, last_signal_at, updated_at)
             VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9, ?10, ?11, ?12, ?13, ?14, ?15)",
            params![
                entity.entity_id,
                entity.account_id,
                entity.mode.as_str(),
                entity.status.as_str(),
                entity.impressions as i64,
                entity.clicks as i64,
                entity.spend,
                entity.early_signal_value,
                entity.late_signal_value,
                entity.daily_budget,
                entity.bandit.alpha,
                entity.bandit.beta,
                to_db_ts(entity.first_seen_at),
                entity.last_signal_at.map(to_db_ts),
                to_db_ts(entity.updated_at),
            ],
        )?;
        Ok(())
    }

    /// Persist counters, posterior, budget and signal timestamps.
    ///
    /// Mode, status and `first_seen_at` are deliberately not written here.
    pub fn save_entity_counters(&self, entity: &EntityState) -> Result<(), DbError> {
        let updated = self.conn.execute(
            "UPDATE entities SET account_id = ?2, impressions = ?3, clicks = ?4, spend = ?5,
                 early_signal_value = ?6, late_signal_value = ?7, daily_budget = ?8,
                 bandit_alpha = ?9, bandit_beta = ?10, last_signal_at = ?11, updated_at = ?12
             WHERE entity_id = ?1",
            params![
                entity.entity_id,
                entity.account_id,
                entity.impressions as i64,
                entity.clicks as i64,
                entity.spend,
                entity.early_signal_value,
                entity.late_signal_value,
                entity.daily_budget,
                entity.bandit.alpha,
                entity.bandit.beta,
                entity.last_signal_at.map(to_db_ts),
                to_db_ts(entity.updated_at),
            ],
        )?;
        if updated == 0 {
            return Err(DbError::EntityNotFound(entity.entity_id.clone()));
        }
        Ok(())
    }

    /// Record the budget the platform confirmed for an entity.
    pub fn set_entity_budget_value(
        &self,
        entity_id: &str,
        budget: f64,
        now: DateTime<Utc>,
    ) -> Result<(), DbError> {
        let updated = self.conn.execute(
            "UPDATE entities SET daily_budget = ?2, updated_at = ?3 WHERE entity_id = ?1",
            params![entity_id, budget.max(0.0), to_db_ts(now)],
        )?;
        if updated == 0 {
            return Err(DbError::EntityNotFound(entity_id.to_string()));
        }
        Ok(())
    }

    /// Move an entity between lifecycle states. Returns false if it was unknown.
    pub fn set_entity_status(
        &self,
        entity_id: &str,
        status: EntityStatus,
        now: DateTime<Utc>,
    ) -> Result<bool, DbError> {
        let updated = self.conn.execute(
            "UPDATE entities SET status = ?2, updated_at = ?3 WHERE entity_id = ?1",
            params![entity_id, status.as_str(), to_db_ts(now)],
        )?;
        Ok(updated > 0)
    }

    /// Archive a killed entity. Active entities must be killed first.
    pub fn archive_entity(&self, entity_id: &str, now: DateTime<Utc>) -> Result<bool, DbError> {
        let updated = self.conn.execute(
            "UPDATE entities SET status = 'archived', updated_at = ?2
             WHERE entity_id = ?1 AND status = 'killed'",
            params![entity_id, to_db_ts(now)],
        )?;
        Ok(updated > 0)
    }

    // =========================================================================
    // Ingestion dedup ledger
    // =========================================================================

    /// Record that a signal event was applied. Returns false if it already was.
    pub fn insert_signal_event(
        &self,
        entity_id: &str,
        kind: &str,
        observed_at: DateTime<Utc>,
        payload: Option<&str>,
        now: DateTime<Utc>,
    ) -> Result<bool, DbError> {
        let inserted = self.conn.execute(
            "INSERT OR IGNORE INTO signal_events (entity_id, kind, observed_at, payload, applied_at)
             VALUES (?1, ?2, ?3, ?4, ?5)",
            params![entity_id, kind, to_db_ts(observed_at), payload, to_db_ts(now)],
        )?;
        Ok(inserted > 0)
    }

    /// Payload stored with an applied signal event. `None` if the event was
    /// never applied; `Some(None)` if it was stored without a payload.
    pub fn signal_event_payload(
        &self,
        entity_id: &str,
        kind: &str,
        observed_at: DateTime<Utc>,
    ) -> Result<Option<Option<String>>, DbError> {
        let payload = self
            .conn
            .query_row(
                "SELECT payload FROM signal_events
                 WHERE entity_id = ?1 AND kind = ?2 AND observed_at = ?3",
                params![entity_id, kind, to_db_ts(observed_at)],
                |row| row.get::<_, Option<String>>(0),
            )
            .optional()?;
        Ok(payload)
    }
}
