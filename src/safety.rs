//! Safety gates applied between claiming a change and calling the platform.
//!
//! Order matters: jitter, then rate limits, then the budget velocity cap,
//! then fuzz. Rate and velocity are read back from the audit log, so they
//! count only changes the platform actually accepted. The account limit also
//! counts changes still executing in other workers.

use chrono::{DateTime, Duration, Utc};
use rand::rngs::StdRng;
use rand_distr::{Distribution, Uniform};

use crate::db::{DbError, PacerDb};
use crate::types::{EntityState, PendingChange, SafetyConfig};

/// Velocity allowance at or below this is treated as exhausted.
const VELOCITY_EPSILON: f64 = 1e-9;

/// Earliest retry for a deferral whose window has no expiring row to wait on.
const MIN_DEFER_SECS: i64 = 60;

/// Outcome of the rate and velocity gates for one claimed change.
#[derive(Debug, Clone, PartialEq)]
pub enum GateDecision {
    Proceed {
        magnitude: f64,
        /// Remaining velocity allowance, or `None` for changes exempt from it.
        allowance: Option<f64>,
        clamped: bool,
    },
    Defer {
        reason: String,
        /// When the blocking window should have cleared.
        retry_at: DateTime<Utc>,
    },
}

/// Random pause before touching the platform.
pub fn jitter_duration(config: &SafetyConfig, rng: &mut StdRng) -> std::time::Duration {
    let lo = config.jitter_min_secs.max(0.0);
    let hi = config.jitter_max_secs.max(lo);
    let secs = match Uniform::new_inclusive(lo, hi) {
        Ok(dist) => dist.sample(rng),
        Err(_) => lo,
    };
    std::time::Duration::from_secs_f64(secs.max(0.0))
}

/// Shrink `magnitude` so its absolute value fits in `allowance`, keeping the sign.
pub fn clamp_to_allowance(magnitude: f64, allowance: f64) -> f64 {
    let allowance = allowance.max(0.0);
    if magnitude.abs() <= allowance {
        magnitude
    } else {
        allowance.copysign(magnitude)
    }
}

/// Perturb `magnitude` by up to `fuzz_pct` of itself, then clamp to `allowance`.
pub fn fuzz_magnitude(
    magnitude: f64,
    fuzz_pct: f64,
    allowance: Option<f64>,
    rng: &mut StdRng,
) -> f64 {
    let fuzzed = if fuzz_pct > 0.0 {
        match Uniform::new(-fuzz_pct, fuzz_pct) {
            Ok(dist) => magnitude * (1.0 + dist.sample(rng)),
            Err(_) => magnitude,
        }
    } else {
        magnitude
    };
    match allowance {
        Some(a) => clamp_to_allowance(fuzzed, a),
        None => fuzzed,
    }
}

/// Largest fractional move from `current` in the direction of `magnitude`
/// that keeps the budget within `cap` of `baseline`.
///
/// `None` when either budget is zero, since a fraction of nothing cannot be
/// bounded.
pub fn velocity_allowance(baseline: f64, current: f64, magnitude: f64, cap: f64) -> Option<f64> {
    if baseline <= 0.0 || current <= 0.0 {
        return None;
    }
    let allowance = if magnitude >= 0.0 {
        baseline * (1.0 + cap) / current - 1.0
    } else {
        1.0 - baseline * (1.0 - cap) / current
    };
    Some(allowance.max(0.0))
}

fn retry_after(window_opened: Option<DateTime<Utc>>, window: Duration, now: DateTime<Utc>) -> DateTime<Utc> {
    let floor = now + Duration::seconds(MIN_DEFER_SECS);
    window_opened.map_or(floor, |t| (t + window).max(floor))
}

/// Apply the per-entity and per-account rate limits and the velocity cap.
///
/// The velocity cap bounds the budget itself: `|new - baseline| / baseline`
/// stays within `velocityCapPct`, where the baseline is the budget before
/// the first change of the window. Successive changes compound, so the cap
/// is checked against the current budget rather than a sum of magnitudes.
pub fn check_gates(
    db: &PacerDb,
    change: &PendingChange,
    entity: &EntityState,
    config: &SafetyConfig,
    now: DateTime<Utc>,
) -> Result<GateDecision, DbError> {
    let hour = Duration::hours(1);
    let hour_ago = now - hour;

    let entity_actions = db.count_entity_changes_since(&entity.entity_id, hour_ago)?;
    if entity_actions >= config.max_actions_per_hour {
        let oldest = db.oldest_entity_change_since(&entity.entity_id, hour_ago)?;
        return Ok(GateDecision::Defer {
            reason: format!(
                "entity rate limit: {} changes in the last hour (max {})",
                entity_actions, config.max_actions_per_hour
            ),
            retry_at: retry_after(oldest, hour, now),
        });
    }

    let account = change.account_id.as_deref().or(entity.account_id.as_deref());
    if let Some(account_id) = account {
        let recent = db.count_account_changes_since(account_id, hour_ago)?;
        let in_flight = db.count_account_in_flight(account_id, &change.change_id)?;
        if recent + in_flight >= config.max_account_actions_per_hour {
            let oldest = db.oldest_account_change_since(account_id, hour_ago)?;
            return Ok(GateDecision::Defer {
                reason: format!(
                    "account {} rate limit: {} changes in the last hour, {} in flight (max {})",
                    account_id, recent, in_flight, config.max_account_actions_per_hour
                ),
                retry_at: retry_after(oldest, hour, now),
            });
        }
    }

    if !change.change_type.counts_toward_velocity() {
        return Ok(GateDecision::Proceed {
            magnitude: change.requested_magnitude,
            allowance: None,
            clamped: false,
        });
    }

    let window = config.velocity_window();
    let opened = db.velocity_baseline_since(&entity.entity_id, now - window)?;
    let baseline = opened.map_or(entity.daily_budget, |(budget, _)| budget);
    let Some(remaining) = velocity_allowance(
        baseline,
        entity.daily_budget,
        change.requested_magnitude,
        config.velocity_cap_pct,
    ) else {
        return Ok(GateDecision::Proceed {
            magnitude: change.requested_magnitude,
            allowance: None,
            clamped: false,
        });
    };

    if remaining <= VELOCITY_EPSILON {
        return Ok(GateDecision::Defer {
            reason: format!(
                "velocity cap: budget {:.2} is {:+.2}% from {:.2} at the start of the last {}h (max {:.2}%)",
                entity.daily_budget,
                (entity.daily_budget / baseline - 1.0) * 100.0,
                baseline,
                config.velocity_window_hours,
                config.velocity_cap_pct * 100.0
            ),
            retry_at: retry_after(opened.map(|(_, at)| at), window, now),
        });
    }

    let magnitude = clamp_to_allowance(change.requested_magnitude, remaining);
    Ok(GateDecision::Proceed {
        magnitude,
        allowance: Some(remaining),
        clamped: magnitude != change.requested_magnitude,
    })
}
