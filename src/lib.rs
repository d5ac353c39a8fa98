pub mod db;
pub mod decision;
pub mod error;
pub mod executor;
pub mod ingest;
pub mod migrations;
pub mod platform;
pub mod safety;
pub mod scheduler;
pub mod signals;
pub mod state;
pub mod types;

use std::sync::Arc;

use tokio::sync::{mpsc, watch};

use db::PacerDb;
use error::ServiceError;
use executor::SafeExecutor;
use platform::{platform_from_config, AdPlatform};
use scheduler::{DecisionScheduler, DecisionTrigger, TRIGGER_CHANNEL_SIZE};
use types::Config;

/// Handles for a running service: on-demand decision triggers and shutdown.
pub struct ServiceHandle {
    pub triggers: mpsc::Sender<DecisionTrigger>,
    shutdown: watch::Sender<bool>,
    tasks: Vec<tokio::task::JoinHandle<()>>,
}

impl ServiceHandle {
    /// Signal every task to stop and wait for them.
    ///
    /// Workers finish the change they are processing first.
    pub async fn shutdown(self) {
        let _ = self.shutdown.send(true);
        for task in self.tasks {
            if let Err(e) = task.await {
                log::error!("Service task ended abnormally: {}", e);
            }
        }
    }
}

/// Open storage, then spawn the decision scheduler and `workerCount` executors.
///
/// Each task gets its own connection. Must be called inside a tokio runtime.
pub fn start_service(
    config: Arc<Config>,
    platform: Arc<dyn AdPlatform>,
) -> Result<ServiceHandle, ServiceError> {
    let path = PacerDb::resolve_path(&config)?;
    log::info!("Database: {}", path.display());

    let (shutdown_tx, shutdown_rx) = watch::channel(false);
    let (trigger_tx, trigger_rx) = mpsc::channel(TRIGGER_CHANNEL_SIZE);
    let mut tasks = Vec::with_capacity(config.execution.worker_count + 1);

    let scheduler = Arc::new(DecisionScheduler::new(PacerDb::open_at(&path)?, config.clone())?);
    tasks.push(tokio::spawn(scheduler.run(trigger_rx, shutdown_rx.clone())));

    for i in 0..config.execution.worker_count {
        let worker = Arc::new(SafeExecutor::new(
            format!("worker-{}-{}", std::process::id(), i),
            PacerDb::open_at(&path)?,
            platform.clone(),
            config.clone(),
            rand::random::<u64>(),
        ));
        tasks.push(tokio::spawn(worker.run_worker(shutdown_rx.clone())));
    }

    log::info!(
        "Service started: {} worker(s) against {} platform",
        config.execution.worker_count,
        platform.name()
    );

    Ok(ServiceHandle {
        triggers: trigger_tx,
        shutdown: shutdown_tx,
        tasks,
    })
}

/// Run the full service until Ctrl-C.
pub async fn run_service(config: Config) -> Result<(), ServiceError> {
    let config = Arc::new(config);
    let platform: Arc<dyn AdPlatform> =
        Arc::from(platform_from_config(&config.platform, config.execution.api_timeout_secs)?);

    let handle = start_service(config, platform)?;

    if let Err(e) = tokio::signal::ctrl_c().await {
        log::error!("Failed to listen for Ctrl-C: {}", e);
    }
    log::info!("Shutting down");
    handle.shutdown().await;
    Ok(())
}
