//! Scheduler for decision cycles and claim reaping.
//!
//! Handles:
//! - Cron-driven decision cycles evaluated in the configured timezone
//! - Missed slots after a sleep/wake gap (runs once if within grace period)
//! - On-demand cycles sent over a channel
//! - Periodic reaping of expired claims

use std::sync::Arc;
use std::time::Duration;

use chrono::{DateTime, Utc};
use chrono_tz::Tz;
use cron::Schedule;
use parking_lot::Mutex;
use tokio::sync::{mpsc, oneshot, watch};

use crate::db::{DbError, PacerDb};
use crate::decision::cycle::{run_decision_cycle, CycleReport};
use crate::error::ConfigError;
use crate::types::Config;

/// Missed slots older than this are skipped rather than replayed (2 hours)
const MISSED_RUN_GRACE_PERIOD_SECS: i64 = 7200;

/// Time jump threshold to detect sleep/wake (5 minutes)
const TIME_JUMP_THRESHOLD_SECS: i64 = 300;

/// Poll interval for the scheduler loop
const POLL_INTERVAL_SECS: u64 = 15;

/// Channel buffer size for on-demand triggers
pub const TRIGGER_CHANNEL_SIZE: usize = 8;

/// Request for an immediate decision cycle.
#[derive(Debug)]
pub struct DecisionTrigger {
    pub seed: Option<u64>,
    /// Receives the cycle report, or the storage error message.
    pub reply: Option<oneshot::Sender<Result<CycleReport, String>>>,
}

pub struct DecisionScheduler {
    db: Mutex<PacerDb>,
    config: Arc<Config>,
    schedule: Schedule,
    tz: Tz,
    last_run: Mutex<Option<DateTime<Utc>>>,
}

impl DecisionScheduler {
    pub fn new(db: PacerDb, config: Arc<Config>) -> Result<Self, ConfigError> {
        let schedule = config.schedule.parse_cron()?;
        let tz = config.schedule.parse_timezone()?;
        Ok(Self {
            db: Mutex::new(db),
            config,
            schedule,
            tz,
            last_run: Mutex::new(None),
        })
    }

    /// Next scheduled decision time after `now`.
    pub fn next_run_after(&self, now: DateTime<Utc>) -> Option<DateTime<Utc>> {
        next_run_after(&self.schedule, self.tz, now)
    }

    /// Run the loop until `shutdown` flips to true or its sender is dropped.
    pub async fn run(
        self: Arc<Self>,
        mut triggers: mpsc::Receiver<DecisionTrigger>,
        mut shutdown: watch::Receiver<bool>,
    ) {
        let start = Utc::now();
        // Slots before startup are not replayed.
        *self.last_run.lock() = Some(start);
        let mut last_check = start;
        let mut last_reap = start;
        let mut triggers_open = true;
        let reap_every = chrono::Duration::seconds(
            self.config.schedule.reaper_interval_secs.max(1) as i64,
        );

        log::info!(
            "Scheduler started: decisions on '{}' ({}), next at {}",
            self.config.schedule.decision_cron,
            self.tz,
            self.next_run_after(start)
                .map(|t| t.to_rfc3339())
                .unwrap_or_else(|| "never".to_string())
        );

        loop {
            if *shutdown.borrow() {
                break;
            }

            tokio::select! {
                _ = tokio::time::sleep(Duration::from_secs(POLL_INTERVAL_SECS)) => {}
                trigger = triggers.recv(), if triggers_open => {
                    match trigger {
                        Some(trigger) => self.handle_trigger(trigger),
                        // Every trigger handle was dropped; keep serving the schedule.
                        None => triggers_open = false,
                    }
                    continue;
                }
                changed = shutdown.changed() => {
                    if changed.is_err() {
                        break;
                    }
                    continue;
                }
            }

            let now = Utc::now();

            let time_jump = (now - last_check).num_seconds();
            if time_jump > TIME_JUMP_THRESHOLD_SECS {
                log::info!(
                    "Detected system wake (time jumped {} seconds), checking for missed decision slots",
                    time_jump
                );
            }

            self.check_and_run_due(now);

            if now - last_reap >= reap_every {
                self.reap(now);
                last_reap = now;
            }

            last_check = now;
        }

        log::info!("Scheduler stopped");
    }

    /// Run a cycle if a scheduled slot fell due since the last run.
    pub fn check_and_run_due(&self, now: DateTime<Utc>) -> Option<CycleReport> {
        let last_run = *self.last_run.lock();
        let slot = due_slot(&self.schedule, self.tz, last_run, now)?;
        log::info!("Decision slot {} due", slot.to_rfc3339());
        *self.last_run.lock() = Some(now);
        match self.run_cycle(now, None) {
            Ok(report) => Some(report),
            Err(e) => {
                log::error!("Scheduled decision cycle failed: {}", e);
                None
            }
        }
    }

    /// One reaper pass. Errors are logged and retried on the next tick.
    pub fn reap(&self, now: DateTime<Utc>) {
        let result = self
            .db
            .lock()
            .reap_expired_claims(now, self.config.execution.claim_timeout());
        match result {
            Ok(report) if report.requeued + report.failed > 0 => {
                log::warn!(
                    "Reaper: {} expired claim(s) requeued, {} failed",
                    report.requeued,
                    report.failed
                );
            }
            Ok(_) => {}
            Err(e) => log::error!("Reaper pass failed: {}", e),
        }
    }

    fn handle_trigger(&self, trigger: DecisionTrigger) {
        log::info!("On-demand decision cycle requested");
        let now = Utc::now();
        let result = self.run_cycle(now, trigger.seed).map_err(|e| e.to_string());
        if let Err(e) = &result {
            log::error!("On-demand decision cycle failed: {}", e);
        }
        if let Some(reply) = trigger.reply {
            let _ = reply.send(result);
        }
    }

    fn run_cycle(&self, now: DateTime<Utc>, seed: Option<u64>) -> Result<CycleReport, DbError> {
        let db = self.db.lock();
        run_decision_cycle(&db, &self.config, now, seed)
    }
}

/// Next scheduled time strictly after `now`, in UTC.
pub fn next_run_after(schedule: &Schedule, tz: Tz, now: DateTime<Utc>) -> Option<DateTime<Utc>> {
    schedule
        .after(&now.with_timezone(&tz))
        .next()
        .map(|t| t.with_timezone(&Utc))
}

/// Latest scheduled slot in `(last_run, now]`, looking back at most the grace period.
///
/// Several slots missed during one gap collapse into a single run.
pub fn due_slot(
    schedule: &Schedule,
    tz: Tz,
    last_run: Option<DateTime<Utc>>,
    now: DateTime<Utc>,
) -> Option<DateTime<Utc>> {
    let grace_start = now - chrono::Duration::seconds(MISSED_RUN_GRACE_PERIOD_SECS);
    let from = match last_run {
        Some(last) if last > grace_start => last,
        _ => grace_start,
    };

    let mut latest = None;
    for scheduled in schedule.after(&from.with_timezone(&tz)) {
        let scheduled_utc = scheduled.with_timezone(&Utc);
        if scheduled_utc > now {
            break;
        }
        latest = Some(scheduled_utc);
    }
    latest
}
