//! Ingestion boundary: the only path by which entity counters change.
//!
//! Both entry points are idempotent. Each event is keyed by
//! `(entity_id, kind, observed_at)` in `signal_events`; a replayed event is
//! reported as `Duplicate` and leaves the entity untouched. A second event
//! under the same key carrying different data is rejected, not dropped.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use crate::db::PacerDb;
use crate::error::IngestError;
use crate::types::{BanditParams, EntityState, EntityStatus, ModeKind};

const KIND_DELIVERY: &str = "delivery";
const KIND_ATTRIBUTION: &str = "attribution";

/// Attributed (late) value for an entity, as reported by the attribution system.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct SignalUpdate {
    pub entity_id: String,
    /// Absolute attributed value to date, not a delta.
    pub late_signal_value: f64,
    pub spend_delta: f64,
    pub observed_at: DateTime<Utc>,
}

/// Delivery counters for an entity since the previous report.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct DeliveryUpdate {
    pub entity_id: String,
    pub mode: ModeKind,
    #[serde(default)]
    pub account_id: Option<String>,
    pub impressions_delta: u64,
    pub clicks_delta: u64,
    pub early_signal_value_delta: f64,
    /// Budget currently live on the platform, if the report carries it.
    #[serde(default)]
    pub daily_budget: Option<f64>,
    pub observed_at: DateTime<Utc>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum IngestOutcome {
    Applied,
    Duplicate,
}

fn check_entity_id(entity_id: &str) -> Result<(), IngestError> {
    if entity_id.trim().is_empty() {
        return Err(IngestError::EmptyEntityId);
    }
    Ok(())
}

fn check_amount(field: &'static str, value: f64) -> Result<(), IngestError> {
    if !value.is_finite() {
        return Err(IngestError::NonFinite(field));
    }
    if value < 0.0 {
        return Err(IngestError::Negative(field));
    }
    Ok(())
}

/// Enter the event in the dedup ledger. Returns false for an exact replay.
fn record_event(
    db: &PacerDb,
    entity_id: &str,
    kind: &'static str,
    observed_at: DateTime<Utc>,
    payload: Option<&str>,
    now: DateTime<Utc>,
) -> Result<bool, IngestError> {
    if db.insert_signal_event(entity_id, kind, observed_at, payload, now)? {
        return Ok(true);
    }
    // Rows stored without a payload cannot be compared and count as replays.
    if let Some(stored) = db.signal_event_payload(entity_id, kind, observed_at)?.flatten() {
        if payload != Some(stored.as_str()) {
            log::warn!(
                "Ingest: conflicting {} for {} at {}, rejecting",
                kind,
                entity_id,
                observed_at
            );
            return Err(IngestError::ConflictingDuplicate {
                entity_id: entity_id.to_string(),
                kind,
                observed_at,
            });
        }
    }
    log::debug!("Ingest: duplicate {} for {} at {}", kind, entity_id, observed_at);
    Ok(false)
}

fn later(a: Option<DateTime<Utc>>, b: DateTime<Utc>) -> Option<DateTime<Utc>> {
    Some(a.map_or(b, |a| a.max(b)))
}

/// Apply an attribution update: replace the late value, add spend.
///
/// The entity must already exist; attribution never creates one.
pub fn update_entity_signal(
    db: &PacerDb,
    update: &SignalUpdate,
    now: DateTime<Utc>,
) -> Result<IngestOutcome, IngestError> {
    check_entity_id(&update.entity_id)?;
    check_amount("lateSignalValue", update.late_signal_value)?;
    check_amount("spendDelta", update.spend_delta)?;

    let payload = serde_json::to_string(update).ok();

    db.with_transaction(|db| {
        let mut entity = db
            .get_entity(&update.entity_id)?
            .ok_or_else(|| IngestError::UnknownEntity(update.entity_id.clone()))?;
        if entity.status == EntityStatus::Archived {
            return Err(IngestError::EntityArchived(entity.entity_id));
        }

        if !record_event(
            db,
            &update.entity_id,
            KIND_ATTRIBUTION,
            update.observed_at,
            payload.as_deref(),
            now,
        )? {
            return Ok(IngestOutcome::Duplicate);
        }

        if update.late_signal_value < entity.late_signal_value {
            return Err(IngestError::LateValueRegression {
                entity_id: entity.entity_id,
                previous: entity.late_signal_value,
                incoming: update.late_signal_value,
            });
        }

        entity.late_signal_value = update.late_signal_value;
        entity.spend += update.spend_delta;
        entity.last_signal_at = later(entity.last_signal_at, update.observed_at);
        entity.updated_at = now;
        db.save_entity_counters(&entity)?;

        log::debug!(
            "Ingest: {} late={:.2} spend={:.2}",
            entity.entity_id,
            entity.late_signal_value,
            entity.spend
        );
        Ok(IngestOutcome::Applied)
    })
}

/// Apply a delivery report: add impressions, clicks and early value, and
/// update the click posterior. Creates the entity on its first impression.
pub fn record_delivery(
    db: &PacerDb,
    update: &DeliveryUpdate,
    now: DateTime<Utc>,
) -> Result<IngestOutcome, IngestError> {
    check_entity_id(&update.entity_id)?;
    check_amount("earlySignalValueDelta", update.early_signal_value_delta)?;
    if let Some(budget) = update.daily_budget {
        check_amount("dailyBudget", budget)?;
    }
    if update.clicks_delta > update.impressions_delta {
        return Err(IngestError::ClicksExceedImpressions {
            clicks: update.clicks_delta,
            impressions: update.impressions_delta,
        });
    }

    let payload = serde_json::to_string(update).ok();

    db.with_transaction(|db| {
        let existing = db.get_entity(&update.entity_id)?;
        if existing.is_none() && update.impressions_delta == 0 {
            return Err(IngestError::UnknownEntity(update.entity_id.clone()));
        }
        if let Some(entity) = &existing {
            if entity.mode != update.mode {
                return Err(IngestError::ModeMismatch {
                    entity_id: entity.entity_id.clone(),
                    stored: entity.mode.as_str(),
                    requested: update.mode.as_str(),
                });
            }
            if entity.status == EntityStatus::Archived {
                return Err(IngestError::EntityArchived(entity.entity_id.clone()));
            }
        }

        if !record_event(
            db,
            &update.entity_id,
            KIND_DELIVERY,
            update.observed_at,
            payload.as_deref(),
            now,
        )? {
            return Ok(IngestOutcome::Duplicate);
        }

        let failures = (update.impressions_delta - update.clicks_delta) as f64;
        match existing {
            None => {
                let entity = EntityState {
                    entity_id: update.entity_id.clone(),
                    account_id: update.account_id.clone(),
                    mode: update.mode,
                    status: EntityStatus::Active,
                    impressions: update.impressions_delta,
                    clicks: update.clicks_delta,
                    spend: 0.0,
                    early_signal_value: update.early_signal_value_delta,
                    late_signal_value: 0.0,
                    daily_budget: update.daily_budget.unwrap_or(0.0),
                    bandit: BanditParams {
                        alpha: 1.0 + update.clicks_delta as f64,
                        beta: 1.0 + failures,
                    },
                    first_seen_at: update.observed_at,
                    last_signal_at: Some(update.observed_at),
                    updated_at: now,
                };
                db.insert_entity(&entity)?;
                log::info!(
                    "Ingest: new {} entity {} ({} impressions)",
                    entity.mode.as_str(),
                    entity.entity_id,
                    entity.impressions
                );
            }
            Some(mut entity) => {
                entity.impressions += update.impressions_delta;
                entity.clicks += update.clicks_delta;
                entity.early_signal_value += update.early_signal_value_delta;
                entity.bandit.alpha += update.clicks_delta as f64;
                entity.bandit.beta += failures;
                if let Some(budget) = update.daily_budget {
                    entity.daily_budget = budget;
                }
                if entity.account_id.is_none() {
                    entity.account_id = update.account_id.clone();
                }
                entity.last_signal_at = later(entity.last_signal_at, update.observed_at);
                entity.updated_at = now;
                db.save_entity_counters(&entity)?;
            }
        }
        Ok(IngestOutcome::Applied)
    })
}
