//! Decision engine: turns scored entities into kill / scale / hold
//! recommendations.
//!
//! A round is a pure function of the entity states, the config, `now` and a
//! seed. The seed drives one Thompson draw per entity; the draws rank
//! entities and set their allocation shares. A share above the even split
//! enlarges that entity's scale-up and a share below it shrinks it, and rank
//! decides which scale-ups are granted when the round has more candidates
//! than `maxScaleUpsPerCycle`.

use chrono::{DateTime, Utc};
use rand::rngs::StdRng;
use rand::SeedableRng;
use serde::Serialize;

use crate::signals::sampling::sample_posterior;
use crate::signals::scoring::{score_entity, BlendedScore};
use crate::types::{
    AllocationConfig, ChangeType, Config, EntityState, EntityStatus, Mode, NewChange,
};

pub mod cycle;

/// Where an entity sits in its lifecycle this round.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum EntityPhase {
    /// Not enough impressions for any decision.
    Observing,
    /// Protected from kills; only early-signal scale-ups allowed.
    IgnoranceZone,
    Decidable,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum Action {
    Kill,
    ScaleUp,
    ScaleDown,
    Hold,
}

impl Action {
    pub fn change_type(&self) -> Option<ChangeType> {
        match self {
            Action::Kill => Some(ChangeType::Kill),
            Action::ScaleUp => Some(ChangeType::ScaleUp),
            Action::ScaleDown => Some(ChangeType::ScaleDown),
            Action::Hold => None,
        }
    }
}

/// Verdict for one entity before any round-level allocation is applied.
#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct Evaluation {
    pub phase: EntityPhase,
    pub action: Action,
    /// Fractional budget delta. Kills carry -1.0, holds 0.0.
    pub magnitude: f64,
    pub score: BlendedScore,
    pub reason: String,
}

#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct Recommendation {
    pub entity_id: String,
    pub account_id: Option<String>,
    pub phase: EntityPhase,
    pub action: Action,
    pub magnitude: f64,
    pub confidence: f64,
    pub score: BlendedScore,
    /// Thompson draw from the click posterior.
    pub sampled_value: f64,
    /// `sampled_value / sum(sampled_values)` over the round.
    pub allocation_share: f64,
    /// 1-based position by sampled value.
    pub rank: usize,
    pub reason: String,
}

impl Recommendation {
    /// Queue row for this recommendation. Holds produce none.
    pub fn to_change(&self) -> Option<NewChange> {
        let change_type = self.action.change_type()?;
        Some(NewChange {
            entity_id: self.entity_id.clone(),
            account_id: self.account_id.clone(),
            change_type,
            requested_magnitude: self.magnitude,
        })
    }
}

/// Output of one round, in rank order.
#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct DecisionRound {
    pub seed: u64,
    pub evaluated_at: DateTime<Utc>,
    pub recommendations: Vec<Recommendation>,
}

/// Bounds on how far an allocation share can stretch a scale-up, relative
/// to an even split of the round.
const MIN_SHARE_WEIGHT: f64 = 0.5;
const MAX_SHARE_WEIGHT: f64 = 2.0;

fn scale_magnitude(distance: f64, allocation: &AllocationConfig) -> f64 {
    (allocation.scale_gain * distance.max(0.0)).min(allocation.max_budget_change_pct)
}

/// Scale-up magnitude after weighting by the entity's share of the round.
///
/// `share * n` is 1.0 for an even split; the weight is clamped to
/// `[MIN_SHARE_WEIGHT, MAX_SHARE_WEIGHT]` and the result to
/// `maxBudgetChangePct`.
pub fn share_weighted_magnitude(
    magnitude: f64,
    share: f64,
    round_size: usize,
    allocation: &AllocationConfig,
) -> f64 {
    let weight = (share * round_size.max(1) as f64).clamp(MIN_SHARE_WEIGHT, MAX_SHARE_WEIGHT);
    (magnitude * weight).min(allocation.max_budget_change_pct)
}

fn verdict(
    phase: EntityPhase,
    action: Action,
    magnitude: f64,
    score: BlendedScore,
    reason: String,
) -> Evaluation {
    Evaluation {
        phase,
        action,
        magnitude,
        score,
        reason,
    }
}

/// Classify one entity from its own state. No sampling happens here.
pub fn evaluate_entity(entity: &EntityState, config: &Config, now: DateTime<Utc>) -> Evaluation {
    let score = score_entity(entity, &config.scoring);
    let allocation = &config.allocation;

    if score.confidence <= 0.0 {
        return verdict(
            EntityPhase::Observing,
            Action::Hold,
            0.0,
            score,
            format!(
                "{} impressions, below the {} needed to decide",
                entity.impressions, config.scoring.min_impressions_for_decision
            ),
        );
    }

    let mode = config.mode_for(entity.mode);

    if let Mode::Pipeline(params) = &mode {
        let age_days = entity.age_days(now);
        if config.ignorance_zone.protects(age_days, entity.spend) {
            let early = score.early_only();
            if early > params.scale_threshold {
                return verdict(
                    EntityPhase::IgnoranceZone,
                    Action::ScaleUp,
                    scale_magnitude(early - params.scale_threshold, allocation),
                    score,
                    format!(
                        "early score {:.3} above {:.3} inside the ignorance zone",
                        early, params.scale_threshold
                    ),
                );
            }
            return verdict(
                EntityPhase::IgnoranceZone,
                Action::Hold,
                0.0,
                score,
                format!(
                    "ignorance zone: {:.1} days old, ${:.2} spent",
                    age_days, entity.spend
                ),
            );
        }
    }

    let kill = match &mode {
        Mode::Direct(p) => score.score < p.kill_threshold,
        Mode::Pipeline(p) => {
            score.score < p.kill_threshold_roas && entity.spend >= p.min_spend_for_kill
        }
    };
    if kill {
        return verdict(
            EntityPhase::Decidable,
            Action::Kill,
            -1.0,
            score,
            format!("score {:.3} below the {} kill threshold", score.score, mode.kind().as_str()),
        );
    }

    let scale_up_at = mode.scale_threshold();
    if score.score > scale_up_at {
        return verdict(
            EntityPhase::Decidable,
            Action::ScaleUp,
            scale_magnitude(score.score - scale_up_at, allocation),
            score,
            format!("score {:.3} above {:.3}", score.score, scale_up_at),
        );
    }

    let scale_down_at = mode.scale_down_threshold();
    if score.score < scale_down_at {
        return verdict(
            EntityPhase::Decidable,
            Action::ScaleDown,
            -scale_magnitude(scale_down_at - score.score, allocation),
            score,
            format!("score {:.3} below {:.3}", score.score, scale_down_at),
        );
    }

    verdict(
        EntityPhase::Decidable,
        Action::Hold,
        0.0,
        score,
        format!("score {:.3} within thresholds", score.score),
    )
}

/// Run one decision round over the active entities in `entities`.
///
/// Entities are visited in `entity_id` order so the same seed always maps to
/// the same draws regardless of how the caller ordered them.
pub fn run_round(
    entities: &[EntityState],
    config: &Config,
    now: DateTime<Utc>,
    seed: u64,
) -> DecisionRound {
    let mut active: Vec<&EntityState> = entities
        .iter()
        .filter(|e| e.status == EntityStatus::Active)
        .collect();
    active.sort_by(|a, b| a.entity_id.cmp(&b.entity_id));

    let mut rng = StdRng::seed_from_u64(seed);
    let samples: Vec<f64> = active
        .iter()
        .map(|e| sample_posterior(&e.bandit, &mut rng))
        .collect();

    let total: f64 = samples.iter().sum();
    let n = active.len().max(1) as f64;

    let mut order: Vec<usize> = (0..active.len()).collect();
    order.sort_by(|&a, &b| {
        samples[b]
            .total_cmp(&samples[a])
            .then_with(|| active[a].entity_id.cmp(&active[b].entity_id))
    });

    let scale_up_cap = config.allocation.max_scale_ups_per_cycle;
    let mut scale_ups_granted = 0usize;
    let mut recommendations = Vec::with_capacity(active.len());

    for (position, &idx) in order.iter().enumerate() {
        let entity = active[idx];
        let sampled_value = samples[idx];
        let share = if total > 0.0 {
            sampled_value / total
        } else {
            1.0 / n
        };

        let mut eval = evaluate_entity(entity, config, now);
        if eval.action == Action::ScaleUp {
            if scale_up_cap > 0 && scale_ups_granted >= scale_up_cap {
                eval.action = Action::Hold;
                eval.magnitude = 0.0;
                eval.reason = format!(
                    "{}; scale-up limit of {} reached this round",
                    eval.reason, scale_up_cap
                );
            } else {
                scale_ups_granted += 1;
                let weighted =
                    share_weighted_magnitude(eval.magnitude, share, active.len(), &config.allocation);
                if weighted != eval.magnitude {
                    eval.reason = format!(
                        "{}; share {:.3} of {} sets {:+.4} -> {:+.4}",
                        eval.reason,
                        share,
                        active.len(),
                        eval.magnitude,
                        weighted
                    );
                    eval.magnitude = weighted;
                }
            }
        }

        recommendations.push(Recommendation {
            entity_id: entity.entity_id.clone(),
            account_id: entity.account_id.clone(),
            phase: eval.phase,
            action: eval.action,
            magnitude: eval.magnitude,
            confidence: eval.score.confidence,
            score: eval.score,
            sampled_value,
            allocation_share: share,
            rank: position + 1,
            reason: eval.reason,
        });
    }

    DecisionRound {
        seed,
        evaluated_at: now,
        recommendations,
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::types::{BanditParams, IgnoranceZoneConfig, ModeKind, ZonePolicy};
    use chrono::{Duration, TimeZone};
    use proptest::prelude::*;

    fn now() -> DateTime<Utc> {
        Utc.with_ymd_and_hms(2026, 7, 10, 12, 0, 0).unwrap()
    }

    fn entity(
        id: &str,
        mode: ModeKind,
        age_days: i64,
        impressions: u64,
        spend: f64,
        early: f64,
        late: f64,
    ) -> EntityState {
        EntityState {
            entity_id: id.to_string(),
            account_id: Some("acct-1".into()),
            mode,
            status: EntityStatus::Active,
            impressions,
            clicks: impressions / 40,
            spend,
            early_signal_value: early,
            late_signal_value: late,
            daily_budget: 100.0,
            bandit: BanditParams {
                alpha: 1.0 + (impressions / 40) as f64,
                beta: 1.0 + (impressions - impressions / 40) as f64,
            },
            first_seen_at: now() - Duration::days(age_days),
            last_signal_at: None,
            updated_at: now(),
        }
    }

    fn zone_config(days: f64, spend: f64) -> Config {
        Config {
            ignorance_zone: IgnoranceZoneConfig {
                days,
                spend,
                policy: ZonePolicy::Both,
            },
            ..Config::default()
        }
    }

    #[test]
    fn test_young_cheap_pipeline_entity_not_killed() {
        let config = zone_config(2.0, 100.0);
        // Catastrophic score: nothing attributed, almost no early value.
        let e = entity("ad-1", ModeKind::Pipeline, 1, 20_000, 50.0, 0.01, 0.0);
        let eval = evaluate_entity(&e, &config, now());
        assert_eq!(eval.phase, EntityPhase::IgnoranceZone);
        assert_eq!(eval.action, Action::Hold);
    }

    #[test]
    fn test_both_policy_keeps_old_cheap_entity_protected() {
        let config = zone_config(2.0, 100.0);
        let e = entity("ad-1", ModeKind::Pipeline, 10, 20_000, 50.0, 0.0, 0.0);
        assert_eq!(evaluate_entity(&e, &config, now()).phase, EntityPhase::IgnoranceZone);
    }

    #[test]
    fn test_zone_allows_early_scale_up() {
        let config = zone_config(2.0, 100.0);
        // early rate 10/spend-dollar, far above the pipeline scale threshold
        let e = entity("ad-1", ModeKind::Pipeline, 1, 2_000, 20.0, 200.0, 0.0);
        let eval = evaluate_entity(&e, &config, now());
        assert_eq!(eval.phase, EntityPhase::IgnoranceZone);
        assert_eq!(eval.action, Action::ScaleUp);
        assert!((eval.magnitude - config.allocation.max_budget_change_pct).abs() < 1e-12);
    }

    #[test]
    fn test_pipeline_kill_out_of_zone() {
        let config = zone_config(2.0, 100.0);
        let e = entity("ad-1", ModeKind::Pipeline, 10, 20_000, 500.0, 10.0, 20.0);
        let eval = evaluate_entity(&e, &config, now());
        assert_eq!(eval.phase, EntityPhase::Decidable);
        assert_eq!(eval.action, Action::Kill);
        assert_eq!(eval.magnitude, -1.0);
    }

    #[test]
    fn test_pipeline_kill_needs_min_spend() {
        let mut config = zone_config(2.0, 100.0);
        config.pipeline.min_spend_for_kill = 1_000.0;
        let e = entity("ad-1", ModeKind::Pipeline, 10, 20_000, 500.0, 10.0, 20.0);
        let eval = evaluate_entity(&e, &config, now());
        assert_eq!(eval.action, Action::ScaleDown);
        assert!(eval.magnitude < 0.0);
        assert!(eval.magnitude >= -config.allocation.max_budget_change_pct);
    }

    #[test]
    fn test_direct_mode_has_no_zone() {
        let config = zone_config(2.0, 100.0);
        let e = entity("ad-1", ModeKind::Direct, 0, 5_000, 10.0, 1.0, 1.0);
        let eval = evaluate_entity(&e, &config, now());
        assert_eq!(eval.phase, EntityPhase::Decidable);
        assert_eq!(eval.action, Action::Kill);
    }

    #[test]
    fn test_observing_below_impression_floor() {
        let config = Config::default();
        let e = entity("ad-1", ModeKind::Direct, 5, 999, 10.0, 0.0, 0.0);
        let eval = evaluate_entity(&e, &config, now());
        assert_eq!(eval.phase, EntityPhase::Observing);
        assert_eq!(eval.action, Action::Hold);
    }

    #[test]
    fn test_scale_up_magnitude_proportional_then_capped() {
        let mut config = Config::default();
        config.scoring.fatigue_constant = 0.0;
        config.scoring.decay_constant = 0.0;
        // direct: early rate 2.5 vs threshold 2.0 → 0.1 * 0.5
        let e = entity("ad-1", ModeKind::Direct, 5, 2_000, 100.0, 250.0, 0.0);
        let eval = evaluate_entity(&e, &config, now());
        assert_eq!(eval.action, Action::ScaleUp);
        assert!((eval.magnitude - 0.05).abs() < 1e-9, "got {}", eval.magnitude);

        let e = entity("ad-2", ModeKind::Direct, 5, 2_000, 100.0, 2_500.0, 0.0);
        let eval = evaluate_entity(&e, &config, now());
        assert!((eval.magnitude - 0.20).abs() < 1e-12);
    }

    #[test]
    fn test_hold_between_thresholds() {
        let mut config = Config::default();
        config.scoring.fatigue_constant = 0.0;
        config.scoring.decay_constant = 0.0;
        let e = entity("ad-1", ModeKind::Direct, 5, 2_000, 100.0, 150.0, 0.0);
        let eval = evaluate_entity(&e, &config, now());
        assert_eq!(eval.action, Action::Hold);
        assert!(Recommendation {
            entity_id: e.entity_id.clone(),
            account_id: None,
            phase: eval.phase,
            action: eval.action,
            magnitude: 0.0,
            confidence: eval.score.confidence,
            score: eval.score,
            sampled_value: 0.5,
            allocation_share: 1.0,
            rank: 1,
            reason: eval.reason,
        }
        .to_change()
        .is_none());
    }

    #[test]
    fn test_round_is_deterministic_for_seed() {
        let config = Config::default();
        let entities: Vec<EntityState> = (0..8)
            .map(|i| entity(&format!("ad-{i}"), ModeKind::Direct, 5, 2_000 + i * 100, 100.0, 300.0, 0.0))
            .collect();
        let a = run_round(&entities, &config, now(), 99);
        let mut reversed = entities.clone();
        reversed.reverse();
        let b = run_round(&reversed, &config, now(), 99);
        assert_eq!(a, b);
    }

    #[test]
    fn test_round_shares_sum_to_one_and_ranks_by_sample() {
        let config = Config::default();
        let entities: Vec<EntityState> = (0..5)
            .map(|i| entity(&format!("ad-{i}"), ModeKind::Direct, 5, 4_000, 100.0, 150.0, 0.0))
            .collect();
        let round = run_round(&entities, &config, now(), 7);
        let total: f64 = round.recommendations.iter().map(|r| r.allocation_share).sum();
        assert!((total - 1.0).abs() < 1e-9);
        for pair in round.recommendations.windows(2) {
            assert!(pair[0].sampled_value >= pair[1].sampled_value);
            assert_eq!(pair[0].rank + 1, pair[1].rank);
        }
    }

    #[test]
    fn test_scale_ups_limited_per_round_in_rank_order() {
        let mut config = Config::default();
        config.allocation.max_scale_ups_per_cycle = 2;
        let entities: Vec<EntityState> = (0..5)
            .map(|i| entity(&format!("ad-{i}"), ModeKind::Direct, 5, 2_000, 100.0, 400.0, 0.0))
            .collect();
        let round = run_round(&entities, &config, now(), 3);
        let actions: Vec<Action> = round.recommendations.iter().map(|r| r.action).collect();
        assert_eq!(
            actions,
            vec![Action::ScaleUp, Action::ScaleUp, Action::Hold, Action::Hold, Action::Hold]
        );
    }

    #[test]
    fn test_share_weight_bounds() {
        let allocation = AllocationConfig::default();
        // Even split leaves the magnitude alone.
        assert!((share_weighted_magnitude(0.05, 0.25, 4, &allocation) - 0.05).abs() < 1e-12);
        assert!((share_weighted_magnitude(0.05, 0.0, 4, &allocation) - 0.025).abs() < 1e-12);
        assert!((share_weighted_magnitude(0.05, 0.6, 4, &allocation) - 0.10).abs() < 1e-12);
        assert_eq!(
            share_weighted_magnitude(0.15, 0.6, 4, &allocation),
            allocation.max_budget_change_pct
        );
    }

    #[test]
    fn test_larger_share_gets_larger_scale_up() {
        let mut config = Config::default();
        config.scoring.fatigue_constant = 0.0;
        config.scoring.decay_constant = 0.0;
        // Same score (0.05 before weighting); the posteriors differ.
        let mut strong = entity("ad-strong", ModeKind::Direct, 5, 2_000, 100.0, 250.0, 0.0);
        strong.bandit = BanditParams {
            alpha: 400.0,
            beta: 600.0,
        };
        let mut weak = entity("ad-weak", ModeKind::Direct, 5, 2_000, 100.0, 250.0, 0.0);
        weak.bandit = BanditParams {
            alpha: 20.0,
            beta: 980.0,
        };

        let round = run_round(&[weak, strong], &config, now(), 21);
        let top = &round.recommendations[0];
        let bottom = &round.recommendations[1];
        assert_eq!(top.entity_id, "ad-strong");
        assert!(top.allocation_share > bottom.allocation_share);
        assert_eq!(top.action, Action::ScaleUp);
        assert_eq!(bottom.action, Action::ScaleUp);
        assert!(
            top.magnitude > bottom.magnitude,
            "{} vs {}",
            top.magnitude,
            bottom.magnitude
        );
        assert!(top.magnitude <= config.allocation.max_budget_change_pct + 1e-12);
        assert!((bottom.magnitude - 0.05 * MIN_SHARE_WEIGHT).abs() < 0.01);
        assert!(top.reason.contains("share"));
    }

    #[test]
    fn test_round_skips_killed_entities() {
        let config = Config::default();
        let mut dead = entity("ad-0", ModeKind::Direct, 5, 2_000, 100.0, 0.0, 0.0);
        dead.status = EntityStatus::Killed;
        let live = entity("ad-1", ModeKind::Direct, 5, 2_000, 100.0, 150.0, 0.0);
        let round = run_round(&[dead, live], &config, now(), 1);
        assert_eq!(round.recommendations.len(), 1);
        assert_eq!(round.recommendations[0].entity_id, "ad-1");
    }

    proptest! {
        #[test]
        fn pipeline_entities_in_zone_never_killed(
            age_days in 0i64..2,
            impressions in 0u64..200_000,
            spend in 0.0f64..5_000.0,
            early in 0.0f64..1_000.0,
            late in 0.0f64..1_000.0,
        ) {
            let config = zone_config(2.0, 100.0);
            let e = entity("ad-p", ModeKind::Pipeline, age_days, impressions, spend, early, late);
            let round = run_round(&[e], &config, now(), 5);
            for rec in &round.recommendations {
                prop_assert_ne!(rec.action, Action::Kill);
                prop_assert_ne!(rec.action, Action::ScaleDown);
            }
        }

        #[test]
        fn magnitudes_respect_change_cap(
            impressions in 1_000u64..200_000,
            spend in 1.0f64..5_000.0,
            early in 0.0f64..100_000.0,
            late in 0.0f64..100_000.0,
        ) {
            let config = Config::default();
            let e = entity("ad-d", ModeKind::Direct, 5, impressions, spend, early, late);
            let eval = evaluate_entity(&e, &config, now());
            match eval.action {
                Action::Kill => prop_assert_eq!(eval.magnitude, -1.0),
                Action::Hold => prop_assert_eq!(eval.magnitude, 0.0),
                _ => prop_assert!(eval.magnitude.abs() <= config.allocation.max_budget_change_pct + 1e-12),
            }
        }
    }
}
