//! Blended performance scorer.
//!
//! Early value (clicks-derived, immediate) and late value (attributed, arrives
//! days later) are each normalised by spend, then blended by exposure: the
//! more impressions, the more the late rate dominates. The blend is then
//! discounted by exposure fatigue.

use serde::Serialize;

use crate::signals::decay::{fatigue_multiplier, late_signal_weight};
use crate::types::{EntityState, ScoringConfig};

/// Scorer output for one entity.
#[derive(Debug, Clone, Copy, PartialEq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct BlendedScore {
    pub score: f64,
    /// 0 below the impression floor, then rising from 0.5 toward 1.
    pub confidence: f64,
    pub weight_late: f64,
    pub fatigue: f64,
    pub early_rate: f64,
    pub late_rate: f64,
}

impl BlendedScore {
    /// Score built from the early rate alone. Used while the late signal
    /// cannot yet be trusted.
    pub fn early_only(&self) -> f64 {
        self.early_rate * self.fatigue
    }
}

fn per_spend(value: f64, spend: f64) -> f64 {
    if spend > 0.0 && value.is_finite() {
        value / spend
    } else {
        0.0
    }
}

/// Confidence from exposure alone.
pub fn confidence_for(impressions: u64, min_impressions: u64) -> f64 {
    if impressions == 0 || impressions < min_impressions {
        return 0.0;
    }
    1.0 - 0.5 * (min_impressions as f64 / impressions as f64)
}

/// Score one entity.
pub fn score_entity(entity: &EntityState, config: &ScoringConfig) -> BlendedScore {
    let weight_late = late_signal_weight(entity.impressions, config.decay_constant);
    let fatigue = fatigue_multiplier(entity.impressions, config.fatigue_constant);
    let early_rate = per_spend(entity.early_signal_value, entity.spend);
    let late_rate = per_spend(entity.late_signal_value, entity.spend);

    let blended = (1.0 - weight_late) * early_rate + weight_late * late_rate;

    BlendedScore {
        score: blended * fatigue,
        confidence: confidence_for(entity.impressions, config.min_impressions_for_decision),
        weight_late,
        fatigue,
        early_rate,
        late_rate,
    }
}
