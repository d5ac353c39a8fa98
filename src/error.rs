//! Error types for budget change execution, ingestion and configuration.
//!
//! Platform errors are classified by recoverability:
//! - Retryable: timeouts, platform rate limiting, unknown/5xx failures
//! - Terminal: the platform rejected the request outright

use chrono::{DateTime, Utc};
use thiserror::Error;

use crate::db::DbError;

/// Failure of a single `set_entity_budget` call against the ad platform.
#[derive(Debug, Clone, PartialEq, Error)]
pub enum ExecutionError {
    #[error("Platform call timed out after {0} seconds")]
    Timeout(u64),

    #[error("Platform rate limit exceeded")]
    RateLimited {
        retry_after_secs: Option<u64>,
    },

    #[error("Platform rejected change: {0}")]
    PlatformRejected(String),

    #[error("Platform call failed: {0}")]
    Unknown(String),
}

impl ExecutionError {
    /// Returns true if another attempt could succeed.
    pub fn is_retryable(&self) -> bool {
        matches!(
            self,
            ExecutionError::Timeout(_)
                | ExecutionError::RateLimited { .. }
                | ExecutionError::Unknown(_)
        )
    }

    /// Short label stored in the audit log.
    pub fn kind(&self) -> &'static str {
        match self {
            ExecutionError::Timeout(_) => "timeout",
            ExecutionError::RateLimited { .. } => "rate_limited",
            ExecutionError::PlatformRejected(_) => "platform_rejected",
            ExecutionError::Unknown(_) => "unknown",
        }
    }

    /// Minimum wait the platform asked for, if any.
    pub fn retry_after(&self) -> Option<std::time::Duration> {
        match self {
            ExecutionError::RateLimited {
                retry_after_secs: Some(secs),
            } => Some(std::time::Duration::from_secs(*secs)),
            _ => None,
        }
    }
}

impl From<reqwest::Error> for ExecutionError {
    fn from(err: reqwest::Error) -> Self {
        if err.is_timeout() {
            ExecutionError::Timeout(0)
        } else {
            ExecutionError::Unknown(err.to_string())
        }
    }
}

/// Rejected inbound signal. Nothing is written when one of these is returned.
#[derive(Debug, Error)]
pub enum IngestError {
    #[error("Entity id must not be empty")]
    EmptyEntityId,

    #[error("Unknown entity: {0}")]
    UnknownEntity(String),

    #[error("Entity {0} is archived")]
    EntityArchived(String),

    #[error("Field {0} must be a finite number")]
    NonFinite(&'static str),

    #[error("Field {0} must not be negative")]
    Negative(&'static str),

    #[error("Clicks ({clicks}) exceed impressions ({impressions})")]
    ClicksExceedImpressions { clicks: u64, impressions: u64 },

    #[error("Entity {entity_id} is {stored}, update claims {requested}")]
    ModeMismatch {
        entity_id: String,
        stored: &'static str,
        requested: &'static str,
    },

    #[error("Late signal for {entity_id} went backwards ({previous} -> {incoming})")]
    LateValueRegression {
        entity_id: String,
        previous: f64,
        incoming: f64,
    },

    #[error("{kind} event for {entity_id} at {observed_at} was already applied with different data")]
    ConflictingDuplicate {
        entity_id: String,
        kind: &'static str,
        observed_at: DateTime<Utc>,
    },

    #[error(transparent)]
    Db(#[from] DbError),
}

#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("Home directory not found")]
    HomeDirNotFound,

    #[error("Config file not found at {0}")]
    NotFound(String),

    #[error("Failed to read config: {0}")]
    Read(#[from] std::io::Error),

    #[error("Failed to parse config: {0}")]
    Parse(#[from] serde_json::Error),

    #[error("Invalid config: {0}")]
    Invalid(String),
}

/// Startup failures of the long-running service.
#[derive(Debug, Error)]
pub enum ServiceError {
    #[error(transparent)]
    Config(#[from] ConfigError),

    #[error(transparent)]
    Db(#[from] DbError),

    #[error("Platform client error: {0}")]
    Platform(String),
}
