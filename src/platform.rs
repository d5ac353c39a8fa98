//! Ad platform seam.
//!
//! The executor only knows `AdPlatform::set_entity_budget`. `HttpAdPlatform`
//! talks JSON to a budget endpoint; `DryRunPlatform` accepts everything and
//! logs, and is what runs when no `platform.baseUrl` is configured.

use std::time::Duration;

use async_trait::async_trait;
use serde::{Deserialize, Serialize};

use crate::error::{ExecutionError, ServiceError};
use crate::types::PlatformConfig;

/// What the platform confirmed after a budget change.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct PlatformAck {
    /// Budget now live on the platform. May differ from the request if the
    /// platform rounds or enforces minimums.
    pub applied_budget: f64,
    #[serde(default)]
    pub request_id: Option<String>,
}

#[async_trait]
pub trait AdPlatform: Send + Sync {
    /// Set the entity's daily budget to `new_value`. Zero pauses the entity.
    async fn set_entity_budget(
        &self,
        entity_id: &str,
        new_value: f64,
    ) -> Result<PlatformAck, ExecutionError>;

    fn name(&self) -> &'static str;
}

/// Budget API over HTTP: `POST {base_url}/entities/{entity_id}/budget`.
pub struct HttpAdPlatform {
    client: reqwest::Client,
    base_url: String,
    timeout_secs: u64,
}

#[derive(Serialize)]
#[serde(rename_all = "camelCase")]
struct BudgetRequest {
    daily_budget: f64,
}

#[derive(Deserialize)]
#[serde(rename_all = "camelCase")]
struct BudgetResponse {
    daily_budget: Option<f64>,
    request_id: Option<String>,
}

impl HttpAdPlatform {
    pub fn new(base_url: &str, timeout_secs: u64) -> Result<Self, ServiceError> {
        let client = reqwest::Client::builder()
            .timeout(Duration::from_secs(timeout_secs))
            .build()
            .map_err(|e| ServiceError::Platform(e.to_string()))?;
        Ok(Self {
            client,
            base_url: base_url.trim_end_matches('/').to_string(),
            timeout_secs,
        })
    }

    fn budget_url(&self, entity_id: &str) -> String {
        format!("{}/entities/{}/budget", self.base_url, entity_id)
    }
}

/// Map a non-success HTTP status to an execution error.
pub fn classify_status(status: u16, body: &str, retry_after_secs: Option<u64>) -> ExecutionError {
    match status {
        429 => ExecutionError::RateLimited { retry_after_secs },
        408 | 500..=599 => ExecutionError::Unknown(format!("HTTP {}: {}", status, body)),
        _ => ExecutionError::PlatformRejected(format!("HTTP {}: {}", status, body)),
    }
}

#[async_trait]
impl AdPlatform for HttpAdPlatform {
    async fn set_entity_budget(
        &self,
        entity_id: &str,
        new_value: f64,
    ) -> Result<PlatformAck, ExecutionError> {
        let resp = self
            .client
            .post(self.budget_url(entity_id))
            .json(&BudgetRequest {
                daily_budget: new_value,
            })
            .send()
            .await
            .map_err(|e| {
                if e.is_timeout() {
                    ExecutionError::Timeout(self.timeout_secs)
                } else {
                    ExecutionError::from(e)
                }
            })?;

        let status = resp.status();
        if !status.is_success() {
            let retry_after = resp
                .headers()
                .get(reqwest::header::RETRY_AFTER)
                .and_then(|v| v.to_str().ok())
                .and_then(|v| v.trim().parse::<u64>().ok());
            let text = resp.text().await.unwrap_or_default();
            return Err(classify_status(status.as_u16(), &text, retry_after));
        }

        // An empty or unexpected body still means the change landed.
        let body: Option<BudgetResponse> = resp.json().await.ok();
        let (applied_budget, request_id) = match body {
            Some(b) => (b.daily_budget.unwrap_or(new_value), b.request_id),
            None => (new_value, None),
        };
        Ok(PlatformAck {
            applied_budget,
            request_id,
        })
    }

    fn name(&self) -> &'static str {
        "http"
    }
}

/// Accepts every change without calling anything.
#[derive(Debug, Default)]
pub struct DryRunPlatform;

#[async_trait]
impl AdPlatform for DryRunPlatform {
    async fn set_entity_budget(
        &self,
        entity_id: &str,
        new_value: f64,
    ) -> Result<PlatformAck, ExecutionError> {
        log::info!("Dry run: would set {} daily budget to {:.2}", entity_id, new_value);
        Ok(PlatformAck {
            applied_budget: new_value,
            request_id: None,
        })
    }

    fn name(&self) -> &'static str {
        "dry-run"
    }
}

/// Build the platform client the config asks for.
pub fn platform_from_config(
    config: &PlatformConfig,
    timeout_secs: u64,
) -> Result<Box<dyn AdPlatform>, ServiceError> {
    match config.base_url.as_deref().map(str::trim) {
        Some(url) if !url.is_empty() => Ok(Box::new(HttpAdPlatform::new(url, timeout_secs)?)),
        _ => {
            log::warn!("No platform.baseUrl configured, budget changes will not be applied");
            Ok(Box::new(DryRunPlatform))
        }
    }
}
