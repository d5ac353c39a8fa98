//! Exposure-driven weighting (pure math, no DB).

/// Largest representable weight strictly below 1.
const MAX_LATE_WEIGHT: f64 = 1.0 - f64::EPSILON;

/// Weight given to the late signal after `impressions` of exposure.
///
/// `1 - exp(-decay_constant * impressions)`, non-decreasing and in `[0, 1)`.
pub fn late_signal_weight(impressions: u64, decay_constant: f64) -> f64 {
    let k = if decay_constant.is_finite() {
        decay_constant.max(0.0)
    } else {
        0.0
    };
    let w = -(-k * impressions as f64).exp_m1();
    w.clamp(0.0, MAX_LATE_WEIGHT)
}

/// Multiplier that discounts heavily exposed entities, `exp(-fatigue_constant * impressions)`.
pub fn fatigue_multiplier(impressions: u64, fatigue_constant: f64) -> f64 {
    let k = if fatigue_constant.is_finite() {
        fatigue_constant.max(0.0)
    } else {
        0.0
    };
    (-k * impressions as f64).exp()
}
