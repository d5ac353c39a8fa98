//! Safe executor: drains the change queue against the ad platform.
//!
//! Each worker owns one `SafeExecutor` with its own SQLite connection. Per
//! job: claim, jitter, load the entity, rate and velocity gates, fuzz, mark
//! executing, call the platform with retries, record. Every platform attempt
//! and every gate rejection appends an audit row.

use std::sync::Arc;
use std::time::{Duration, Instant};

use chrono::{DateTime, Utc};
use parking_lot::Mutex;
use rand::rngs::StdRng;
use rand::SeedableRng;
use tokio::sync::watch;

use crate::db::{DbError, PacerDb};
use crate::error::ExecutionError;
use crate::platform::{AdPlatform, PlatformAck};
use crate::safety::{check_gates, fuzz_magnitude, jitter_duration, GateDecision};
use crate::types::{
    AttemptOutcome, ChangeType, Config, EntityState, EntityStatus, NewChangeRecord, PendingChange,
};

/// Result of one `process_one` call.
#[derive(Debug, Clone, PartialEq)]
pub enum ProcessOutcome {
    /// Nothing pending.
    Idle,
    Executed {
        change_id: String,
        applied_magnitude: f64,
    },
    /// A safety gate deferred the job; it is pending again.
    Requeued { change_id: String, reason: String },
    Failed { change_id: String, reason: String },
    /// The claim was taken away (reaped) while this worker held it.
    LostClaim { change_id: String },
}

enum Prepared {
    Ready { entity: EntityState, magnitude: f64 },
    Done(ProcessOutcome),
}

pub struct SafeExecutor {
    worker_id: String,
    db: Mutex<PacerDb>,
    platform: Arc<dyn AdPlatform>,
    config: Arc<Config>,
    rng: Mutex<StdRng>,
}

impl SafeExecutor {
    pub fn new(
        worker_id: impl Into<String>,
        db: PacerDb,
        platform: Arc<dyn AdPlatform>,
        config: Arc<Config>,
        seed: u64,
    ) -> Self {
        Self {
            worker_id: worker_id.into(),
            db: Mutex::new(db),
            platform,
            config,
            rng: Mutex::new(StdRng::seed_from_u64(seed)),
        }
    }

    pub fn worker_id(&self) -> &str {
        &self.worker_id
    }

    /// Claim and fully process at most one change.
    pub async fn process_one(&self) -> Result<ProcessOutcome, DbError> {
        let claimed = self.db.lock().claim_next_change(&self.worker_id, Utc::now())?;
        let Some(change) = claimed else {
            return Ok(ProcessOutcome::Idle);
        };
        log::info!(
            "Worker {}: claimed {} ({} {:+.4} on {})",
            self.worker_id,
            change.change_id,
            change.change_type.as_str(),
            change.requested_magnitude,
            change.entity_id
        );

        let jitter = jitter_duration(&self.config.safety, &mut self.rng.lock());
        if !jitter.is_zero() {
            log::debug!("Worker {}: jitter {:?}", self.worker_id, jitter);
            tokio::time::sleep(jitter).await;
        }

        match self.prepare(&change)? {
            Prepared::Done(outcome) => Ok(outcome),
            Prepared::Ready { entity, magnitude } => {
                self.execute(&change, &entity, magnitude).await
            }
        }
    }

    /// Entity check, gates, fuzz and the `executing` transition. No awaits.
    ///
    /// Runs as one immediate transaction, so a second worker gating a change
    /// in the same account waits until this one is counted as in flight.
    fn prepare(&self, change: &PendingChange) -> Result<Prepared, DbError> {
        let db = self.db.lock();
        db.with_transaction(|db| self.prepare_in(db, change, Utc::now()))
    }

    fn prepare_in(
        &self,
        db: &PacerDb,
        change: &PendingChange,
        now: DateTime<Utc>,
    ) -> Result<Prepared, DbError> {
        let entity = match db.get_entity(&change.entity_id)? {
            Some(entity) if entity.status == EntityStatus::Active => entity,
            other => {
                let reason = match other {
                    Some(entity) => format!("entity {} is {}", entity.entity_id, entity.status.as_str()),
                    None => format!("entity {} not found", change.entity_id),
                };
                let mut row = self.audit_row(change, change.attempts, AttemptOutcome::Failed);
                row.error_kind = Some("entity_unavailable".to_string());
                row.detail = Some(reason.clone());
                db.append_change_record(&row)?;

                log::warn!("Worker {}: failing {}: {}", self.worker_id, change.change_id, reason);
                let failed =
                    db.fail_change(&change.change_id, &self.worker_id, &reason, change.attempts, now)?;
                return Ok(Prepared::Done(if failed {
                    ProcessOutcome::Failed {
                        change_id: change.change_id.clone(),
                        reason,
                    }
                } else {
                    self.lost(change)
                }));
            }
        };

        let (magnitude, allowance) =
            match check_gates(db, change, &entity, &self.config.safety, now)? {
                GateDecision::Defer { reason, retry_at } => {
                    let mut row = self.audit_row(change, change.attempts, AttemptOutcome::Deferred);
                    row.detail = Some(reason.clone());
                    db.append_change_record(&row)?;

                    log::info!(
                        "Worker {}: deferring {} until {}: {}",
                        self.worker_id,
                        change.change_id,
                        retry_at.to_rfc3339(),
                        reason
                    );
                    let requeued =
                        db.requeue_change(&change.change_id, &self.worker_id, retry_at, now)?;
                    return Ok(Prepared::Done(if requeued {
                        ProcessOutcome::Requeued {
                            change_id: change.change_id.clone(),
                            reason,
                        }
                    } else {
                        self.lost(change)
                    }));
                }
                GateDecision::Proceed {
                    magnitude,
                    allowance,
                    clamped,
                } => {
                    if clamped {
                        log::info!(
                            "Worker {}: {} clamped {:+.4} -> {:+.4} by velocity cap",
                            self.worker_id,
                            change.change_id,
                            change.requested_magnitude,
                            magnitude
                        );
                    }
                    (magnitude, allowance)
                }
            };

        let magnitude = match change.change_type {
            ChangeType::Kill => -1.0,
            ChangeType::ScaleUp | ChangeType::ScaleDown => fuzz_magnitude(
                magnitude,
                self.config.safety.fuzz_pct,
                allowance,
                &mut self.rng.lock(),
            ),
        };

        if !db.mark_executing(&change.change_id, &self.worker_id, now)? {
            return Ok(Prepared::Done(self.lost(change)));
        }
        Ok(Prepared::Ready { entity, magnitude })
    }

    /// Call the platform, retrying retryable failures with backoff.
    async fn execute(
        &self,
        change: &PendingChange,
        entity: &EntityState,
        magnitude: f64,
    ) -> Result<ProcessOutcome, DbError> {
        let exec = &self.config.execution;
        let previous = entity.daily_budget;
        let new_value = match change.change_type {
            ChangeType::Kill => 0.0,
            _ => (previous * (1.0 + magnitude)).max(0.0),
        };
        let call_timeout = Duration::from_secs(exec.api_timeout_secs);
        let max_attempts = exec.max_retries.saturating_add(1);
        let mut attempt = change.attempts;

        loop {
            attempt += 1;
            let started = Instant::now();
            let result = match tokio::time::timeout(
                call_timeout,
                self.platform.set_entity_budget(&change.entity_id, new_value),
            )
            .await
            {
                Ok(result) => result,
                Err(_) => Err(ExecutionError::Timeout(exec.api_timeout_secs)),
            };
            let latency_ms = started.elapsed().as_millis() as i64;

            let err = match result {
                Ok(ack) => {
                    return self.record_success(change, magnitude, previous, &ack, attempt, latency_ms)
                }
                Err(err) => err,
            };

            {
                let db = self.db.lock();
                let mut row = self.audit_row(change, attempt, AttemptOutcome::Failed);
                row.applied_magnitude = None;
                row.previous_budget = Some(previous);
                row.error_kind = Some(err.kind().to_string());
                row.detail = Some(err.to_string());
                row.latency_ms = Some(latency_ms);
                db.append_change_record(&row)?;
            }

            if err.is_retryable() && attempt - change.attempts < max_attempts {
                let backoff = exec.backoff_for(attempt - change.attempts);
                let wait = match err.retry_after() {
                    Some(asked) => backoff.max(asked.min(Duration::from_millis(exec.backoff_max_ms))),
                    None => backoff,
                };
                log::warn!(
                    "Worker {}: {} attempt {} failed ({}), retrying in {:?}",
                    self.worker_id,
                    change.change_id,
                    attempt,
                    err,
                    wait
                );
                tokio::time::sleep(wait).await;
                continue;
            }

            let reason = format!("{} after {} attempt(s)", err, attempt);
            log::error!("Worker {}: {} failed: {}", self.worker_id, change.change_id, reason);
            let failed = self.db.lock().fail_change(
                &change.change_id,
                &self.worker_id,
                &reason,
                attempt,
                Utc::now(),
            )?;
            return Ok(if failed {
                ProcessOutcome::Failed {
                    change_id: change.change_id.clone(),
                    reason,
                }
            } else {
                self.lost(change)
            });
        }
    }

    /// Complete the job, update the entity and append the success row in one
    /// transaction.
    fn record_success(
        &self,
        change: &PendingChange,
        magnitude: f64,
        previous: f64,
        ack: &PlatformAck,
        attempt: u32,
        latency_ms: i64,
    ) -> Result<ProcessOutcome, DbError> {
        let now = Utc::now();
        let mut row = self.audit_row(change, attempt, AttemptOutcome::Success);
        row.applied_magnitude = Some(magnitude);
        row.previous_budget = Some(previous);
        row.new_budget = Some(ack.applied_budget);
        row.detail = ack.request_id.clone();
        row.latency_ms = Some(latency_ms);
        row.recorded_at = now;

        let db = self.db.lock();
        let completed = db.with_transaction(|db| -> Result<bool, DbError> {
            let completed =
                db.complete_change(&change.change_id, &self.worker_id, magnitude, attempt, now)?;
            db.set_entity_budget_value(&change.entity_id, ack.applied_budget, now)?;
            if change.change_type == ChangeType::Kill {
                db.set_entity_status(&change.entity_id, EntityStatus::Killed, now)?;
            }
            // The platform accepted the change either way, so velocity must see it.
            db.append_change_record(&row)?;
            Ok(completed)
        })?;

        if !completed {
            log::warn!(
                "Worker {}: {} applied on the platform after its claim expired",
                self.worker_id,
                change.change_id
            );
            return Ok(self.lost(change));
        }

        log::info!(
            "Worker {}: {} done, {} budget {:.2} -> {:.2} ({:+.4}, attempt {}, {}ms)",
            self.worker_id,
            change.change_id,
            change.entity_id,
            previous,
            ack.applied_budget,
            magnitude,
            attempt,
            latency_ms
        );
        Ok(ProcessOutcome::Executed {
            change_id: change.change_id.clone(),
            applied_magnitude: magnitude,
        })
    }

    fn audit_row(
        &self,
        change: &PendingChange,
        attempt: u32,
        outcome: AttemptOutcome,
    ) -> NewChangeRecord {
        NewChangeRecord {
            change_id: change.change_id.clone(),
            entity_id: change.entity_id.clone(),
            account_id: change.account_id.clone(),
            change_type: change.change_type,
            worker_id: self.worker_id.clone(),
            attempt,
            requested_magnitude: change.requested_magnitude,
            applied_magnitude: None,
            previous_budget: None,
            new_budget: None,
            outcome,
            error_kind: None,
            detail: None,
            latency_ms: None,
            recorded_at: Utc::now(),
        }
    }

    fn lost(&self, change: &PendingChange) -> ProcessOutcome {
        log::warn!(
            "Worker {}: lost claim on {} (reaped)",
            self.worker_id,
            change.change_id
        );
        ProcessOutcome::LostClaim {
            change_id: change.change_id.clone(),
        }
    }

    /// Process jobs until `shutdown` flips to true, sleeping when idle, after
    /// a deferral or after a storage error.
    pub async fn run_worker(self: Arc<Self>, mut shutdown: watch::Receiver<bool>) {
        let poll = Duration::from_secs(self.config.execution.poll_interval_secs.max(1));
        log::info!(
            "Worker {} started ({} platform)",
            self.worker_id,
            self.platform.name()
        );

        loop {
            if *shutdown.borrow() {
                break;
            }

            let wait = match self.process_one().await {
                Ok(ProcessOutcome::Idle) => true,
                // Deferred rows are not due yet; give the window time to move.
                Ok(ProcessOutcome::Requeued { .. }) => true,
                Ok(outcome) => {
                    log::debug!("Worker {}: {:?}", self.worker_id, outcome);
                    false
                }
                Err(e) => {
                    log::error!("Worker {}: storage error: {}", self.worker_id, e);
                    true
                }
            };

            if wait {
                tokio::select! {
                    _ = tokio::time::sleep(poll) => {}
                    changed = shutdown.changed() => {
                        if changed.is_err() {
                            break;
                        }
                    }
                }
            }
        }
        log::info!("Worker {} stopped", self.worker_id);
    }
}

#[cfg(test)]
mod tests {
    use std::collections::VecDeque;

    use async_trait::async_trait;
    use chrono::Duration as ChronoDuration;

    use super::*;
    use crate::db::test_utils::test_db_with_path;
    use crate::types::{BanditParams, ChangeStatus, ModeKind, NewChange};

    /// Platform double: pops scripted results, echoes the request once empty.
    #[derive(Default)]
    struct MockPlatform {
        script: Mutex<VecDeque<Result<PlatformAck, ExecutionError>>>,
        calls: Mutex<Vec<(String, f64)>>,
        delay: Duration,
    }

    impl MockPlatform {
        fn scripted(results: Vec<Result<PlatformAck, ExecutionError>>) -> Self {
            Self {
                script: Mutex::new(results.into()),
                ..Self::default()
            }
        }

        fn slow(delay: Duration) -> Self {
            Self {
                delay,
                ..Self::default()
            }
        }

        fn calls(&self) -> Vec<(String, f64)> {
            self.calls.lock().clone()
        }
    }

    #[async_trait]
    impl AdPlatform for MockPlatform {
        async fn set_entity_budget(
            &self,
            entity_id: &str,
            new_value: f64,
        ) -> Result<PlatformAck, ExecutionError> {
            self.calls.lock().push((entity_id.to_string(), new_value));
            if !self.delay.is_zero() {
                tokio::time::sleep(self.delay).await;
            }
            let next = self.script.lock().pop_front();
            next.unwrap_or(Ok(PlatformAck {
                applied_budget: new_value,
                request_id: Some("req-1".into()),
            }))
        }

        fn name(&self) -> &'static str {
            "mock"
        }
    }

    fn test_config() -> Config {
        let mut config = Config::default();
        config.safety.jitter_min_secs = 0.0;
        config.safety.jitter_max_secs = 0.0;
        config.safety.fuzz_pct = 0.0;
        config.safety.max_actions_per_hour = 100;
        config.safety.max_account_actions_per_hour = 100;
        config.execution.backoff_base_ms = 1;
        config.execution.backoff_max_ms = 2;
        config
    }

    fn seed_entity(db: &PacerDb, entity_id: &str, daily_budget: f64) {
        let now = Utc::now();
        db.insert_entity(&EntityState {
            entity_id: entity_id.into(),
            account_id: Some("acct-1".into()),
            mode: ModeKind::Direct,
            status: EntityStatus::Active,
            impressions: 5_000,
            clicks: 100,
            spend: 200.0,
            early_signal_value: 0.0,
            late_signal_value: 0.0,
            daily_budget,
            bandit: BanditParams::default(),
            first_seen_at: now - ChronoDuration::days(5),
            last_signal_at: None,
            updated_at: now,
        })
        .expect("entity");
    }

    fn setup(config: Config, platform: Arc<MockPlatform>) -> (SafeExecutor, PacerDb) {
        let (db, path) = test_db_with_path();
        seed_entity(&db, "ad-1", 100.0);
        let worker_db = PacerDb::open_at(&path).expect("worker db");
        let executor = SafeExecutor::new("worker-0", worker_db, platform, Arc::new(config), 17);
        (executor, db)
    }

    fn enqueue(db: &PacerDb, change_type: ChangeType, magnitude: f64) -> String {
        enqueue_for(db, "ad-1", change_type, magnitude)
    }

    fn enqueue_for(db: &PacerDb, entity_id: &str, change_type: ChangeType, magnitude: f64) -> String {
        db.enqueue_change(
            &NewChange {
                entity_id: entity_id.into(),
                account_id: Some("acct-1".into()),
                change_type,
                requested_magnitude: magnitude,
            },
            Utc::now(),
        )
        .expect("enqueue")
    }

    #[tokio::test]
    async fn test_idle_when_queue_empty() {
        let (executor, _db) = setup(test_config(), Arc::new(MockPlatform::default()));
        assert_eq!(executor.process_one().await.unwrap(), ProcessOutcome::Idle);
    }

    #[tokio::test]
    async fn test_scale_up_applies_and_records() {
        let platform = Arc::new(MockPlatform::default());
        let (executor, db) = setup(test_config(), platform.clone());
        let id = enqueue(&db, ChangeType::ScaleUp, 0.1);

        let outcome = executor.process_one().await.unwrap();
        assert_eq!(
            outcome,
            ProcessOutcome::Executed {
                change_id: id.clone(),
                applied_magnitude: 0.1
            }
        );
        let calls = platform.calls();
        assert_eq!(calls.len(), 1);
        assert!((calls[0].1 - 110.0).abs() < 1e-9);

        let change = db.get_change(&id).unwrap().unwrap();
        assert_eq!(change.status, ChangeStatus::Completed);
        assert_eq!(change.attempts, 1);
        assert!((db.get_entity("ad-1").unwrap().unwrap().daily_budget - 110.0).abs() < 1e-9);

        let history = db.history_for_change(&id).unwrap();
        assert_eq!(history.len(), 1);
        assert_eq!(history[0].outcome, AttemptOutcome::Success);
        assert_eq!(history[0].previous_budget, Some(100.0));
        assert_eq!(history[0].detail.as_deref(), Some("req-1"));
    }

    #[tokio::test]
    async fn test_kill_zeroes_budget_and_marks_entity() {
        let platform = Arc::new(MockPlatform::default());
        let (executor, db) = setup(test_config(), platform.clone());
        let id = enqueue(&db, ChangeType::Kill, -1.0);

        let outcome = executor.process_one().await.unwrap();
        assert!(matches!(outcome, ProcessOutcome::Executed { .. }));
        assert_eq!(platform.calls()[0].1, 0.0);

        let entity = db.get_entity("ad-1").unwrap().unwrap();
        assert_eq!(entity.status, EntityStatus::Killed);
        assert_eq!(entity.daily_budget, 0.0);
        assert_eq!(db.get_change(&id).unwrap().unwrap().applied_magnitude, Some(-1.0));
    }

    #[tokio::test]
    async fn test_retryable_errors_then_success() {
        let platform = Arc::new(MockPlatform::scripted(vec![
            Err(ExecutionError::Timeout(20)),
            Err(ExecutionError::RateLimited {
                retry_after_secs: None,
            }),
        ]));
        let (executor, db) = setup(test_config(), platform.clone());
        let id = enqueue(&db, ChangeType::ScaleDown, -0.05);

        let outcome = executor.process_one().await.unwrap();
        assert!(matches!(outcome, ProcessOutcome::Executed { .. }));
        assert_eq!(platform.calls().len(), 3);

        let history = db.history_for_change(&id).unwrap();
        let outcomes: Vec<AttemptOutcome> = history.iter().map(|r| r.outcome).collect();
        assert_eq!(
            outcomes,
            vec![AttemptOutcome::Failed, AttemptOutcome::Failed, AttemptOutcome::Success]
        );
        assert_eq!(history[0].error_kind.as_deref(), Some("timeout"));
        assert_eq!(history[1].error_kind.as_deref(), Some("rate_limited"));
        assert_eq!(history[2].attempt, 3);
        assert_eq!(db.get_change(&id).unwrap().unwrap().attempts, 3);
    }

    #[tokio::test]
    async fn test_rejection_is_terminal() {
        let platform = Arc::new(MockPlatform::scripted(vec![Err(
            ExecutionError::PlatformRejected("budget below minimum".into()),
        )]));
        let (executor, db) = setup(test_config(), platform.clone());
        let id = enqueue(&db, ChangeType::ScaleUp, 0.1);

        let outcome = executor.process_one().await.unwrap();
        assert!(matches!(outcome, ProcessOutcome::Failed { .. }));
        assert_eq!(platform.calls().len(), 1);

        let change = db.get_change(&id).unwrap().unwrap();
        assert_eq!(change.status, ChangeStatus::Failed);
        assert!(change
            .failure_reason
            .unwrap()
            .contains("budget below minimum"));
        assert_eq!(db.get_entity("ad-1").unwrap().unwrap().daily_budget, 100.0);
    }

    #[tokio::test]
    async fn test_retries_exhausted() {
        let mut config = test_config();
        config.execution.max_retries = 2;
        let platform = Arc::new(MockPlatform::scripted(
            (0..5)
                .map(|_| Err(ExecutionError::Unknown("502 Bad Gateway".into())))
                .collect(),
        ));
        let (executor, db) = setup(config, platform.clone());
        let id = enqueue(&db, ChangeType::ScaleUp, 0.1);

        let outcome = executor.process_one().await.unwrap();
        assert!(matches!(outcome, ProcessOutcome::Failed { .. }));
        assert_eq!(platform.calls().len(), 3);
        assert_eq!(db.history_for_change(&id).unwrap().len(), 3);
        assert_eq!(db.get_change(&id).unwrap().unwrap().attempts, 3);
    }

    #[tokio::test]
    async fn test_rate_limit_requeues_with_deferred_row() {
        let mut config = test_config();
        config.safety.max_actions_per_hour = 1;
        let platform = Arc::new(MockPlatform::default());
        let (executor, db) = setup(config, platform.clone());

        enqueue(&db, ChangeType::ScaleUp, 0.05);
        assert!(matches!(
            executor.process_one().await.unwrap(),
            ProcessOutcome::Executed { .. }
        ));

        let second = enqueue(&db, ChangeType::ScaleUp, 0.05);
        let outcome = executor.process_one().await.unwrap();
        assert!(matches!(outcome, ProcessOutcome::Requeued { ref change_id, .. } if *change_id == second));
        assert_eq!(platform.calls().len(), 1);

        let change = db.get_change(&second).unwrap().unwrap();
        assert_eq!(change.status, ChangeStatus::Pending);
        assert!(change.claimed_by.is_none());
        let history = db.history_for_change(&second).unwrap();
        assert_eq!(history.len(), 1);
        assert_eq!(history[0].outcome, AttemptOutcome::Deferred);
    }

    #[tokio::test]
    async fn test_inactive_entity_fails_job() {
        let platform = Arc::new(MockPlatform::default());
        let (executor, db) = setup(test_config(), platform.clone());
        let id = enqueue(&db, ChangeType::ScaleUp, 0.1);
        db.set_entity_status("ad-1", EntityStatus::Killed, Utc::now()).unwrap();

        let outcome = executor.process_one().await.unwrap();
        assert!(matches!(outcome, ProcessOutcome::Failed { .. }));
        assert!(platform.calls().is_empty());
        assert_eq!(db.get_change(&id).unwrap().unwrap().status, ChangeStatus::Failed);
    }

    /// Runs `count` sequential changes of `step` each and returns
    /// (applied magnitudes, requeue count, final budget).
    async fn drive_velocity(config: Config, step: f64, count: usize) -> (Vec<f64>, usize, f64) {
        let (executor, db) = setup(config, Arc::new(MockPlatform::default()));
        let mut applied = Vec::new();
        let mut requeued = 0;
        for _ in 0..count {
            let id = enqueue(&db, ChangeType::ScaleUp, step);
            match executor.process_one().await.unwrap() {
                ProcessOutcome::Executed {
                    applied_magnitude, ..
                } => applied.push(applied_magnitude),
                ProcessOutcome::Requeued { .. } => {
                    requeued += 1;
                    assert!(db.cancel_change(&id).unwrap());
                }
                other => panic!("unexpected outcome {:?}", other),
            }
        }
        let budget = db.get_entity("ad-1").unwrap().unwrap().daily_budget;
        (applied, requeued, budget)
    }

    #[tokio::test]
    async fn test_velocity_cap_bounds_compounded_budget() {
        let (applied, requeued, budget) = drive_velocity(test_config(), 0.015, 20).await;
        // 1.015^12 is about 1.1956, so the 13th step is clamped to land on 120.
        assert_eq!(applied.len(), 13);
        assert!(applied[12] > 0.0 && applied[12] < 0.005, "got {}", applied[12]);
        assert_eq!(requeued, 7);
        assert!(budget <= 120.0 + 1e-6, "budget {} exceeds 20% over 100", budget);
        assert!(budget > 119.99, "cap should be reached, got {}", budget);
    }

    #[tokio::test]
    async fn test_velocity_cap_holds_with_fuzz() {
        let mut config = test_config();
        config.safety.fuzz_pct = 0.03;
        let (applied, requeued, budget) = drive_velocity(config, 0.0125, 30).await;
        assert!(budget <= 120.0 + 1e-6, "budget {} exceeds 20% over 100", budget);
        assert!(budget > 119.0, "cap should be nearly used, got {}", budget);
        assert!(requeued > 0);
        for m in &applied {
            assert!(*m > 0.0 && *m <= 0.0125 * 1.03 + 1e-12);
        }
    }

    #[tokio::test]
    async fn test_velocity_cap_bounds_cuts_too() {
        let (executor, db) = setup(test_config(), Arc::new(MockPlatform::default()));
        for _ in 0..10 {
            let id = enqueue(&db, ChangeType::ScaleDown, -0.05);
            if let ProcessOutcome::Requeued { .. } = executor.process_one().await.unwrap() {
                assert!(db.cancel_change(&id).unwrap());
            }
        }
        let budget = db.get_entity("ad-1").unwrap().unwrap().daily_budget;
        assert!(budget >= 80.0 - 1e-6, "budget {} fell more than 20% below 100", budget);
        assert!(budget < 80.01, "cut should reach the floor, got {}", budget);
    }

    #[tokio::test]
    async fn test_deferred_change_lets_newer_work_through() {
        let mut config = test_config();
        config.safety.velocity_cap_pct = 0.05;
        let platform = Arc::new(MockPlatform::default());
        let (executor, db) = setup(config, platform.clone());
        seed_entity(&db, "ad-2", 50.0);

        enqueue(&db, ChangeType::ScaleUp, 0.05);
        assert!(matches!(
            executor.process_one().await.unwrap(),
            ProcessOutcome::Executed { .. }
        ));

        let capped = enqueue(&db, ChangeType::ScaleUp, 0.05);
        let outcome = executor.process_one().await.unwrap();
        assert!(matches!(outcome, ProcessOutcome::Requeued { ref change_id, .. } if *change_id == capped));
        let deferred = db.get_change(&capped).unwrap().unwrap();
        assert_eq!(deferred.status, ChangeStatus::Pending);
        let retry_at = deferred.available_at.expect("deferred until the window slides");
        assert!(retry_at > Utc::now() + ChronoDuration::hours(5));

        let fresh = enqueue_for(&db, "ad-2", ChangeType::ScaleUp, 0.05);
        let outcome = executor.process_one().await.unwrap();
        assert!(
            matches!(outcome, ProcessOutcome::Executed { ref change_id, .. } if *change_id == fresh),
            "expected the fresh change to run, got {:?}",
            outcome
        );
        assert_eq!(executor.process_one().await.unwrap(), ProcessOutcome::Idle);
        assert_eq!(platform.calls().len(), 2);
        assert_eq!(db.get_change(&capped).unwrap().unwrap().status, ChangeStatus::Pending);
    }

    #[tokio::test]
    async fn test_account_limit_holds_across_concurrent_workers() {
        let mut config = test_config();
        config.safety.max_account_actions_per_hour = 1;
        let config = Arc::new(config);
        let platform = Arc::new(MockPlatform::slow(Duration::from_millis(100)));

        let (db, path) = test_db_with_path();
        seed_entity(&db, "ad-1", 100.0);
        seed_entity(&db, "ad-2", 100.0);
        let first = enqueue_for(&db, "ad-1", ChangeType::ScaleUp, 0.05);
        let second = enqueue_for(&db, "ad-2", ChangeType::ScaleUp, 0.05);

        let worker = |name: &str, seed: u64| {
            SafeExecutor::new(
                name,
                PacerDb::open_at(&path).expect("worker db"),
                platform.clone(),
                config.clone(),
                seed,
            )
        };
        let (a, b) = (worker("worker-a", 1), worker("worker-b", 2));
        let (ra, rb) = tokio::join!(a.process_one(), b.process_one());
        let outcomes = [ra.unwrap(), rb.unwrap()];

        let executed = outcomes
            .iter()
            .filter(|o| matches!(o, ProcessOutcome::Executed { .. }))
            .count();
        let requeued: Vec<&ProcessOutcome> = outcomes
            .iter()
            .filter(|o| matches!(o, ProcessOutcome::Requeued { .. }))
            .collect();
        assert_eq!(executed, 1, "got {:?}", outcomes);
        assert_eq!(requeued.len(), 1, "got {:?}", outcomes);
        assert!(matches!(requeued[0], ProcessOutcome::Requeued { reason, .. } if reason.contains("in flight")));
        assert_eq!(platform.calls().len(), 1);
        assert_eq!(db.count_account_changes_since("acct-1", Utc::now() - ChronoDuration::hours(1)).unwrap(), 1);

        let statuses = [
            db.get_change(&first).unwrap().unwrap().status,
            db.get_change(&second).unwrap().unwrap().status,
        ];
        assert!(statuses.contains(&ChangeStatus::Completed));
        assert!(statuses.contains(&ChangeStatus::Pending));
    }

    #[tokio::test]
    async fn test_claim_reaped_during_jitter_is_lost() {
        let mut config = test_config();
        config.safety.jitter_min_secs = 0.2;
        config.safety.jitter_max_secs = 0.2;
        let platform = Arc::new(MockPlatform::default());
        let (executor, db) = setup(config, platform.clone());
        let id = enqueue(&db, ChangeType::ScaleUp, 0.1);

        let (outcome, report) = tokio::join!(executor.process_one(), async {
            tokio::time::sleep(Duration::from_millis(50)).await;
            db.reap_expired_claims(Utc::now() + ChronoDuration::hours(1), ChronoDuration::minutes(10))
                .unwrap()
        });

        assert_eq!(report.requeued, 1);
        assert_eq!(outcome.unwrap(), ProcessOutcome::LostClaim { change_id: id.clone() });
        assert!(platform.calls().is_empty());
        let change = db.get_change(&id).unwrap().unwrap();
        assert_eq!(change.status, ChangeStatus::Pending);
        assert!(change.claimed_by.is_none());
        assert!(db.history_for_change(&id).unwrap().is_empty());
        assert_eq!(db.get_entity("ad-1").unwrap().unwrap().daily_budget, 100.0);
    }

    #[tokio::test]
    async fn test_claim_reaped_during_platform_call_keeps_audit() {
        let platform = Arc::new(MockPlatform::slow(Duration::from_millis(200)));
        let (executor, db) = setup(test_config(), platform.clone());
        let id = enqueue(&db, ChangeType::ScaleUp, 0.1);

        let (outcome, report) = tokio::join!(executor.process_one(), async {
            tokio::time::sleep(Duration::from_millis(50)).await;
            db.reap_expired_claims(Utc::now() + ChronoDuration::hours(1), ChronoDuration::minutes(10))
                .unwrap()
        });

        assert_eq!(report.failed, 1);
        assert_eq!(outcome.unwrap(), ProcessOutcome::LostClaim { change_id: id.clone() });
        assert_eq!(platform.calls().len(), 1);

        let change = db.get_change(&id).unwrap().unwrap();
        assert_eq!(change.status, ChangeStatus::Failed);
        assert_eq!(
            change.failure_reason.as_deref(),
            Some("claim expired during execution")
        );
        // The platform applied it, so the budget and the audit log reflect it.
        assert!((db.get_entity("ad-1").unwrap().unwrap().daily_budget - 110.0).abs() < 1e-9);
        let history = db.history_for_change(&id).unwrap();
        assert_eq!(history.len(), 1);
        assert_eq!(history[0].outcome, AttemptOutcome::Success);
        assert!((history[0].new_budget.expect("new budget") - 110.0).abs() < 1e-9);
    }
}
