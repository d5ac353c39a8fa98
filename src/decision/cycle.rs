//! One decision cycle: load active entities, run a round, enqueue changes.

use chrono::{DateTime, Utc};
use serde::Serialize;

use crate::db::{DbError, PacerDb};
use crate::decision::{run_round, Action, Recommendation};
use crate::types::Config;

/// Summary of a decision cycle, logged and printed by `adpacer decide`.
#[derive(Debug, Clone, Default, PartialEq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct CycleReport {
    pub seed: u64,
    pub evaluated: usize,
    pub held: usize,
    pub kills: usize,
    pub scale_ups: usize,
    pub scale_downs: usize,
    /// Recommendations dropped because the entity already had a change in flight.
    pub skipped_outstanding: usize,
    pub enqueued: Vec<String>,
    /// Thompson allocation over every evaluated entity, in rank order.
    pub allocations: Vec<AllocationEntry>,
}

/// One entity's slice of the round.
#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct AllocationEntry {
    pub entity_id: String,
    pub rank: usize,
    pub sampled_value: f64,
    pub share: f64,
    pub action: Action,
    pub magnitude: f64,
}

impl From<&Recommendation> for AllocationEntry {
    fn from(rec: &Recommendation) -> Self {
        Self {
            entity_id: rec.entity_id.clone(),
            rank: rec.rank,
            sampled_value: rec.sampled_value,
            share: rec.allocation_share,
            action: rec.action,
            magnitude: rec.magnitude,
        }
    }
}

/// Seed precedence: explicit argument, then `allocation.seed`, then a fresh one.
pub fn resolve_seed(explicit: Option<u64>, config: &Config) -> u64 {
    explicit
        .or(config.allocation.seed)
        .unwrap_or_else(rand::random::<u64>)
}

pub fn run_decision_cycle(
    db: &PacerDb,
    config: &Config,
    now: DateTime<Utc>,
    seed: Option<u64>,
) -> Result<CycleReport, DbError> {
    let seed = resolve_seed(seed, config);
    let entities = db.list_active_entities()?;
    let round = run_round(&entities, config, now, seed);

    let mut report = CycleReport {
        seed,
        evaluated: round.recommendations.len(),
        allocations: round.recommendations.iter().map(AllocationEntry::from).collect(),
        ..CycleReport::default()
    };

    for rec in &round.recommendations {
        let Some(change) = rec.to_change() else {
            report.held += 1;
            continue;
        };

        match db.enqueue_change(&change, now) {
            Ok(change_id) => {
                match rec.action {
                    Action::Kill => report.kills += 1,
                    Action::ScaleUp => report.scale_ups += 1,
                    Action::ScaleDown => report.scale_downs += 1,
                    Action::Hold => {}
                }
                log::info!(
                    "Decision: {} {} {:+.4} (rank {}, share {:.3}): {}",
                    rec.entity_id,
                    change.change_type.as_str(),
                    change.requested_magnitude,
                    rec.rank,
                    rec.allocation_share,
                    rec.reason
                );
                report.enqueued.push(change_id);
            }
            Err(DbError::OutstandingChange(entity_id)) => {
                log::debug!("Decision: {} already has a change in flight, skipping", entity_id);
                report.skipped_outstanding += 1;
            }
            Err(e) => return Err(e),
        }
    }

    log::info!(
        "Decision cycle (seed {}): {} evaluated, {} enqueued ({} kill, {} up, {} down), {} held, {} skipped",
        report.seed,
        report.evaluated,
        report.enqueued.len(),
        report.kills,
        report.scale_ups,
        report.scale_downs,
        report.held,
        report.skipped_outstanding
    );
    Ok(report)
}
