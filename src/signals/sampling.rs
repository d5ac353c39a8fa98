//! Thompson sampling over the click posterior.
//!
//! Draws always come from a caller-supplied `StdRng`, so a decision round is
//! reproducible from its seed.

use rand::rngs::StdRng;
use rand_distr::{Beta, Distribution};

use crate::types::BanditParams;

/// Smallest shape parameter passed to `Beta::new`.
const MIN_SHAPE: f64 = 0.01;

/// One draw from `Beta(alpha, beta)`.
///
/// Falls back to the posterior mean if the parameters are unusable.
pub fn sample_posterior(params: &BanditParams, rng: &mut StdRng) -> f64 {
    let a = params.alpha.max(MIN_SHAPE);
    let b = params.beta.max(MIN_SHAPE);
    match Beta::new(a, b) {
        Ok(dist) => {
            let draw: f64 = dist.sample(rng);
            if draw.is_finite() {
                draw.clamp(0.0, 1.0)
            } else {
                posterior_mean(params)
            }
        }
        Err(_) => posterior_mean(params),
    }
}

/// Deterministic estimate: the Beta mean `alpha / (alpha + beta)`.
pub fn posterior_mean(params: &BanditParams) -> f64 {
    let a = params.alpha.max(MIN_SHAPE);
    let b = params.beta.max(MIN_SHAPE);
    a / (a + b)
}
