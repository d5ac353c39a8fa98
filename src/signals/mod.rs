//! Per-entity performance signals: exposure-weighted blending of the early
//! and late signal, exposure fatigue, and Beta posterior sampling.
//!
//! Everything here is pure math over an `EntityState`; nothing touches the DB.

pub mod decay;
pub mod sampling;
pub mod scoring;
