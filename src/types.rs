use chrono::{DateTime, Duration, Utc};
use serde::{Deserialize, Serialize};

use crate::error::ConfigError;

// =============================================================================
// Configuration
// =============================================================================

/// Main configuration loaded from `~/.adpacer/config.json`.
///
/// Every section falls back to its defaults, so `{}` is a valid config.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Config {
    /// Explicit database file. Defaults to `~/.adpacer/adpacer.db`.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub database_path: Option<String>,
    #[serde(default)]
    pub scoring: ScoringConfig,
    #[serde(default)]
    pub ignorance_zone: IgnoranceZoneConfig,
    #[serde(default)]
    pub direct: DirectParams,
    #[serde(default)]
    pub pipeline: PipelineParams,
    #[serde(default)]
    pub allocation: AllocationConfig,
    #[serde(default)]
    pub safety: SafetyConfig,
    #[serde(default)]
    pub execution: ExecutionConfig,
    #[serde(default)]
    pub schedule: ScheduleConfig,
    #[serde(default)]
    pub platform: PlatformConfig,
}

/// Blended scorer constants.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase", default)]
pub struct ScoringConfig {
    /// Rate at which weight shifts from the early to the late signal, per impression.
    pub decay_constant: f64,
    /// Exposure fatigue rate, per impression.
    pub fatigue_constant: f64,
    /// Below this many impressions the scorer reports zero confidence.
    pub min_impressions_for_decision: u64,
}

impl Default for ScoringConfig {
    fn default() -> Self {
        Self {
            decay_constant: 0.0001,
            fatigue_constant: 0.000_002,
            min_impressions_for_decision: 1000,
        }
    }
}

/// How the age and spend thresholds combine.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, Default)]
#[serde(rename_all = "lowercase")]
pub enum ZonePolicy {
    /// Both thresholds must clear before the entity leaves the zone.
    #[default]
    Both,
    /// Clearing either threshold releases the entity.
    Either,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase", default)]
pub struct IgnoranceZoneConfig {
    pub days: f64,
    pub spend: f64,
    pub policy: ZonePolicy,
}

impl Default for IgnoranceZoneConfig {
    fn default() -> Self {
        Self {
            days: 3.0,
            spend: 100.0,
            policy: ZonePolicy::Both,
        }
    }
}

impl IgnoranceZoneConfig {
    /// Whether an entity of this age and spend is still protected from kills.
    pub fn protects(&self, age_days: f64, spend: f64) -> bool {
        let young = age_days < self.days;
        let cheap = spend < self.spend;
        match self.policy {
            ZonePolicy::Both => young || cheap,
            ZonePolicy::Either => young && cheap,
        }
    }
}

/// Thresholds for entities whose revenue is attributable immediately.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase", default)]
pub struct DirectParams {
    pub kill_threshold: f64,
    pub scale_down_threshold: f64,
    pub scale_threshold: f64,
}

impl Default for DirectParams {
    fn default() -> Self {
        Self {
            kill_threshold: 0.8,
            scale_down_threshold: 1.2,
            scale_threshold: 2.0,
        }
    }
}

/// Thresholds for entities whose revenue arrives through a delayed pipeline.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase", default)]
pub struct PipelineParams {
    pub kill_threshold_roas: f64,
    pub scale_down_threshold: f64,
    pub scale_threshold: f64,
    pub min_spend_for_kill: f64,
}

impl Default for PipelineParams {
    fn default() -> Self {
        Self {
            kill_threshold_roas: 0.5,
            scale_down_threshold: 1.0,
            scale_threshold: 3.0,
            min_spend_for_kill: 200.0,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase", default)]
pub struct AllocationConfig {
    /// Largest fractional budget change a single recommendation may carry.
    pub max_budget_change_pct: f64,
    /// Fractional budget change per unit of score beyond a threshold.
    pub scale_gain: f64,
    /// Scale-ups granted per round, in sampled-rank order. 0 means unlimited.
    pub max_scale_ups_per_cycle: usize,
    /// Fixed sampling seed. Unset means a fresh seed per cycle.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub seed: Option<u64>,
}

impl Default for AllocationConfig {
    fn default() -> Self {
        Self {
            max_budget_change_pct: 0.20,
            scale_gain: 0.10,
            max_scale_ups_per_cycle: 10,
            seed: None,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase", default)]
pub struct SafetyConfig {
    pub jitter_min_secs: f64,
    pub jitter_max_secs: f64,
    pub max_actions_per_hour: u32,
    pub max_account_actions_per_hour: u32,
    pub velocity_window_hours: i64,
    /// Cumulative fractional budget change allowed per entity inside the window.
    pub velocity_cap_pct: f64,
    pub fuzz_pct: f64,
}

impl Default for SafetyConfig {
    fn default() -> Self {
        Self {
            jitter_min_secs: 3.0,
            jitter_max_secs: 18.0,
            max_actions_per_hour: 4,
            max_account_actions_per_hour: 20,
            velocity_window_hours: 6,
            velocity_cap_pct: 0.20,
            fuzz_pct: 0.03,
        }
    }
}

impl SafetyConfig {
    pub fn velocity_window(&self) -> Duration {
        Duration::hours(self.velocity_window_hours)
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase", default)]
pub struct ExecutionConfig {
    pub max_retries: u32,
    pub backoff_base_ms: u64,
    pub backoff_max_ms: u64,
    pub api_timeout_secs: u64,
    pub claim_timeout_secs: i64,
    pub worker_count: usize,
    pub poll_interval_secs: u64,
}

impl Default for ExecutionConfig {
    fn default() -> Self {
        Self {
            max_retries: 3,
            backoff_base_ms: 500,
            backoff_max_ms: 30_000,
            api_timeout_secs: 20,
            claim_timeout_secs: 600,
            worker_count: 2,
            poll_interval_secs: 5,
        }
    }
}

impl ExecutionConfig {
    pub fn claim_timeout(&self) -> Duration {
        Duration::seconds(self.claim_timeout_secs)
    }

    /// Longest a worker can hold one claim: the worst jitter, every attempt
    /// timing out, and a full `backoffMaxMs` wait before each retry (a
    /// Retry-After hint can stretch any backoff up to that cap).
    pub fn worst_case_hold(&self, safety: &SafetyConfig) -> std::time::Duration {
        use std::time::Duration as StdDuration;
        let jitter = StdDuration::try_from_secs_f64(safety.jitter_max_secs.max(0.0))
            .unwrap_or(StdDuration::MAX);
        let attempts = u64::from(self.max_retries) + 1;
        let calls = StdDuration::from_secs(self.api_timeout_secs.saturating_mul(attempts));
        let backoffs =
            StdDuration::from_millis(self.backoff_max_ms.saturating_mul(u64::from(self.max_retries)));
        jitter.saturating_add(calls).saturating_add(backoffs)
    }

    /// Backoff before retry `attempt` (1-based), doubling from the base up to the cap.
    pub fn backoff_for(&self, attempt: u32) -> std::time::Duration {
        let exp = attempt.saturating_sub(1).min(20);
        let ms = self.backoff_base_ms.saturating_mul(1u64 << exp);
        std::time::Duration::from_millis(ms.min(self.backoff_max_ms))
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase", default)]
pub struct ScheduleConfig {
    /// Six-field cron expression (seconds first) for decision cycles.
    pub decision_cron: String,
    pub timezone: String,
    pub reaper_interval_secs: u64,
}

impl Default for ScheduleConfig {
    fn default() -> Self {
        Self {
            decision_cron: "0 0 * * * *".to_string(),
            timezone: "UTC".to_string(),
            reaper_interval_secs: 60,
        }
    }
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(rename_all = "camelCase", default)]
pub struct PlatformConfig {
    /// Base URL of the ad platform budget API. Unset means dry-run.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub base_url: Option<String>,
}

impl Config {
    /// Resolve the mode-specific thresholds for an entity.
    pub fn mode_for(&self, kind: ModeKind) -> Mode {
        match kind {
            ModeKind::Direct => Mode::Direct(self.direct.clone()),
            ModeKind::Pipeline => Mode::Pipeline(self.pipeline.clone()),
        }
    }

    /// Reject values the engine or executor cannot operate with.
    pub fn validate(&self) -> Result<(), ConfigError> {
        let s = &self.scoring;
        if !(s.decay_constant.is_finite() && s.decay_constant >= 0.0) {
            return Err(ConfigError::Invalid("scoring.decayConstant must be >= 0".into()));
        }
        if !(s.fatigue_constant.is_finite() && s.fatigue_constant >= 0.0) {
            return Err(ConfigError::Invalid("scoring.fatigueConstant must be >= 0".into()));
        }
        if s.min_impressions_for_decision == 0 {
            return Err(ConfigError::Invalid(
                "scoring.minImpressionsForDecision must be > 0".into(),
            ));
        }
        if self.ignorance_zone.days < 0.0 || self.ignorance_zone.spend < 0.0 {
            return Err(ConfigError::Invalid("ignoranceZone thresholds must be >= 0".into()));
        }
        if self.direct.kill_threshold > self.direct.scale_threshold {
            return Err(ConfigError::Invalid(
                "direct.killThreshold must not exceed direct.scaleThreshold".into(),
            ));
        }
        if self.pipeline.kill_threshold_roas > self.pipeline.scale_threshold {
            return Err(ConfigError::Invalid(
                "pipeline.killThresholdRoas must not exceed pipeline.scaleThreshold".into(),
            ));
        }
        let a = &self.allocation;
        if !(a.max_budget_change_pct > 0.0 && a.max_budget_change_pct <= 1.0) {
            return Err(ConfigError::Invalid(
                "allocation.maxBudgetChangePct must be in (0, 1]".into(),
            ));
        }
        if a.scale_gain <= 0.0 {
            return Err(ConfigError::Invalid("allocation.scaleGain must be > 0".into()));
        }
        let safety = &self.safety;
        if safety.jitter_min_secs < 0.0 || safety.jitter_max_secs < safety.jitter_min_secs {
            return Err(ConfigError::Invalid(
                "safety jitter range must satisfy 0 <= min <= max".into(),
            ));
        }
        if safety.velocity_window_hours <= 0 || safety.velocity_cap_pct <= 0.0 {
            return Err(ConfigError::Invalid(
                "safety velocity window and cap must be > 0".into(),
            ));
        }
        if !(0.0..0.5).contains(&safety.fuzz_pct) {
            return Err(ConfigError::Invalid("safety.fuzzPct must be in [0, 0.5)".into()));
        }
        if self.execution.worker_count == 0 {
            return Err(ConfigError::Invalid("execution.workerCount must be > 0".into()));
        }
        if self.execution.claim_timeout_secs <= 0 {
            return Err(ConfigError::Invalid("execution.claimTimeoutSecs must be > 0".into()));
        }
        let hold = self.execution.worst_case_hold(safety);
        if (self.execution.claim_timeout_secs as f64) <= hold.as_secs_f64() {
            return Err(ConfigError::Invalid(format!(
                "execution.claimTimeoutSecs ({}) must exceed the longest a worker can hold a claim ({:.1}s)",
                self.execution.claim_timeout_secs,
                hold.as_secs_f64()
            )));
        }
        self.schedule.parse_cron()?;
        self.schedule.parse_timezone()?;
        Ok(())
    }
}

impl ScheduleConfig {
    pub fn parse_cron(&self) -> Result<cron::Schedule, ConfigError> {
        self.decision_cron.parse::<cron::Schedule>().map_err(|e| {
            ConfigError::Invalid(format!("Invalid decisionCron '{}': {}", self.decision_cron, e))
        })
    }

    pub fn parse_timezone(&self) -> Result<chrono_tz::Tz, ConfigError> {
        self.timezone
            .parse::<chrono_tz::Tz>()
            .map_err(|e| ConfigError::Invalid(format!("Invalid timezone '{}': {}", self.timezone, e)))
    }
}

// =============================================================================
// Modes
// =============================================================================

/// Stored mode tag. Immutable once an entity exists.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ModeKind {
    Direct,
    Pipeline,
}

impl ModeKind {
    /// String label for SQL storage.
    pub fn as_str(&self) -> &'static str {
        match self {
            ModeKind::Direct => "direct",
            ModeKind::Pipeline => "pipeline",
        }
    }
}

impl std::str::FromStr for ModeKind {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "direct" => Ok(ModeKind::Direct),
            "pipeline" => Ok(ModeKind::Pipeline),
            _ => Err(format!("Unknown mode: {}", s)),
        }
    }
}

/// Mode with its thresholds attached, matched inside the decision engine.
#[derive(Debug, Clone, PartialEq)]
pub enum Mode {
    Direct(DirectParams),
    Pipeline(PipelineParams),
}

impl Mode {
    pub fn kind(&self) -> ModeKind {
        match self {
            Mode::Direct(_) => ModeKind::Direct,
            Mode::Pipeline(_) => ModeKind::Pipeline,
        }
    }

    pub fn scale_threshold(&self) -> f64 {
        match self {
            Mode::Direct(p) => p.scale_threshold,
            Mode::Pipeline(p) => p.scale_threshold,
        }
    }

    pub fn scale_down_threshold(&self) -> f64 {
        match self {
            Mode::Direct(p) => p.scale_down_threshold,
            Mode::Pipeline(p) => p.scale_down_threshold,
        }
    }
}

// =============================================================================
// Entity state
// =============================================================================

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum EntityStatus {
    Active,
    Killed,
    Archived,
}

impl EntityStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            EntityStatus::Active => "active",
            EntityStatus::Killed => "killed",
            EntityStatus::Archived => "archived",
        }
    }
}

impl std::str::FromStr for EntityStatus {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "active" => Ok(EntityStatus::Active),
            "killed" => Ok(EntityStatus::Killed),
            "archived" => Ok(EntityStatus::Archived),
            _ => Err(format!("Unknown entity status: {}", s)),
        }
    }
}

/// Beta posterior over an entity's click success rate.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct BanditParams {
    /// successes + 1
    pub alpha: f64,
    /// failures + 1
    pub beta: f64,
}

impl Default for BanditParams {
    fn default() -> Self {
        Self {
            alpha: 1.0,
            beta: 1.0,
        }
    }
}

/// A row from the `entities` table.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct EntityState {
    pub entity_id: String,
    pub account_id: Option<String>,
    pub mode: ModeKind,
    pub status: EntityStatus,
    pub impressions: u64,
    pub clicks: u64,
    pub spend: f64,
    pub early_signal_value: f64,
    pub late_signal_value: f64,
    pub daily_budget: f64,
    pub bandit: BanditParams,
    pub first_seen_at: DateTime<Utc>,
    pub last_signal_at: Option<DateTime<Utc>>,
    pub updated_at: DateTime<Utc>,
}

impl EntityState {
    /// Fractional days since first exposure.
    pub fn age_days(&self, now: DateTime<Utc>) -> f64 {
        let secs = (now - self.first_seen_at).num_seconds() as f64;
        (secs / 86400.0).max(0.0)
    }
}

// =============================================================================
// Change queue
// =============================================================================

/// A change that can be materialized as a queue row. Holds never are.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ChangeType {
    Kill,
    ScaleUp,
    ScaleDown,
}

impl ChangeType {
    pub fn as_str(&self) -> &'static str {
        match self {
            ChangeType::Kill => "kill",
            ChangeType::ScaleUp => "scale_up",
            ChangeType::ScaleDown => "scale_down",
        }
    }

    /// Budget-velocity accounting applies to scale changes only.
    pub fn counts_toward_velocity(&self) -> bool {
        matches!(self, ChangeType::ScaleUp | ChangeType::ScaleDown)
    }
}

impl std::str::FromStr for ChangeType {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "kill" => Ok(ChangeType::Kill),
            "scale_up" => Ok(ChangeType::ScaleUp),
            "scale_down" => Ok(ChangeType::ScaleDown),
            _ => Err(format!("Unknown change type: {}", s)),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ChangeStatus {
    Pending,
    Claimed,
    Executing,
    Completed,
    Failed,
}

impl ChangeStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            ChangeStatus::Pending => "pending",
            ChangeStatus::Claimed => "claimed",
            ChangeStatus::Executing => "executing",
            ChangeStatus::Completed => "completed",
            ChangeStatus::Failed => "failed",
        }
    }

    pub fn is_terminal(&self) -> bool {
        matches!(self, ChangeStatus::Completed | ChangeStatus::Failed)
    }

    pub const ALL: [ChangeStatus; 5] = [
        ChangeStatus::Pending,
        ChangeStatus::Claimed,
        ChangeStatus::Executing,
        ChangeStatus::Completed,
        ChangeStatus::Failed,
    ];
}

impl std::str::FromStr for ChangeStatus {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "pending" => Ok(ChangeStatus::Pending),
            "claimed" => Ok(ChangeStatus::Claimed),
            "executing" => Ok(ChangeStatus::Executing),
            "completed" => Ok(ChangeStatus::Completed),
            "failed" => Ok(ChangeStatus::Failed),
            _ => Err(format!("Unknown change status: {}", s)),
        }
    }
}

/// A change produced by the decision engine, before it has an id.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct NewChange {
    pub entity_id: String,
    pub account_id: Option<String>,
    pub change_type: ChangeType,
    /// Fractional budget delta; kills carry -1.0.
    pub requested_magnitude: f64,
}

/// A row from the `pending_changes` table.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct PendingChange {
    pub change_id: String,
    pub entity_id: String,
    pub account_id: Option<String>,
    pub change_type: ChangeType,
    pub requested_magnitude: f64,
    pub status: ChangeStatus,
    pub claimed_by: Option<String>,
    pub claimed_at: Option<DateTime<Utc>>,
    /// Not claimable before this time. `None` once the row is due.
    pub available_at: Option<DateTime<Utc>>,
    pub attempts: u32,
    pub applied_magnitude: Option<f64>,
    pub failure_reason: Option<String>,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

// =============================================================================
// Audit log
// =============================================================================

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum AttemptOutcome {
    Success,
    Failed,
    /// Gate rejection; the job went back to the queue.
    Deferred,
}

impl AttemptOutcome {
    pub fn as_str(&self) -> &'static str {
        match self {
            AttemptOutcome::Success => "success",
            AttemptOutcome::Failed => "failed",
            AttemptOutcome::Deferred => "deferred",
        }
    }
}

impl std::str::FromStr for AttemptOutcome {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "success" => Ok(AttemptOutcome::Success),
            "failed" => Ok(AttemptOutcome::Failed),
            "deferred" => Ok(AttemptOutcome::Deferred),
            _ => Err(format!("Unknown attempt outcome: {}", s)),
        }
    }
}

/// An audit row to append.
#[derive(Debug, Clone, PartialEq)]
pub struct NewChangeRecord {
    pub change_id: String,
    pub entity_id: String,
    pub account_id: Option<String>,
    pub change_type: ChangeType,
    pub worker_id: String,
    pub attempt: u32,
    pub requested_magnitude: f64,
    pub applied_magnitude: Option<f64>,
    pub previous_budget: Option<f64>,
    pub new_budget: Option<f64>,
    pub outcome: AttemptOutcome,
    pub error_kind: Option<String>,
    pub detail: Option<String>,
    pub latency_ms: Option<i64>,
    pub recorded_at: DateTime<Utc>,
}

/// A row from the `change_history` table.
#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct ChangeRecord {
    pub id: i64,
    pub change_id: String,
    pub entity_id: String,
    pub account_id: Option<String>,
    pub change_type: ChangeType,
    pub worker_id: String,
    pub attempt: u32,
    pub requested_magnitude: f64,
    pub applied_magnitude: Option<f64>,
    pub previous_budget: Option<f64>,
    pub new_budget: Option<f64>,
    pub outcome: AttemptOutcome,
    pub error_kind: Option<String>,
    pub detail: Option<String>,
    pub latency_ms: Option<i64>,
    pub recorded_at: DateTime<Utc>,
}
