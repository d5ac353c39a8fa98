//! adpacer: budget pacing service and operator CLI.
//!
//! `adpacer run` starts the decision scheduler and executor workers until
//! Ctrl-C. The other subcommands do one unit of work against the same
//! database and exit.

use std::path::PathBuf;

use anyhow::{bail, Context, Result};
use chrono::Utc;
use clap::{Parser, Subcommand};

use adpacer_lib::db::PacerDb;
use adpacer_lib::decision::cycle::run_decision_cycle;
use adpacer_lib::state::{load_config, load_config_from, CONFIG_ENV};
use adpacer_lib::types::Config;

#[derive(Parser)]
#[command(name = "adpacer")]
#[command(about = "Bandit-driven budget pacing with a safe execution queue", long_about = None)]
#[command(version)]
struct Cli {
    /// Configuration file path
    #[arg(short, long, env = CONFIG_ENV)]
    config: Option<PathBuf>,

    #[command(subcommand)]
    command: Option<Commands>,
}

#[derive(Subcommand)]
enum Commands {
    /// Run the scheduler and executor workers until Ctrl-C (default)
    Run,

    /// Run one decision cycle now and enqueue its changes
    Decide {
        /// Seed for the Thompson draws
        #[arg(long)]
        seed: Option<u64>,
    },

    /// Release or fail claims that outlived the claim timeout
    Reap,

    /// Show queue depth by status and recent audit rows
    Status {
        /// Number of audit rows to show
        #[arg(long, default_value_t = 10)]
        history: i64,

        /// Print JSON instead of text
        #[arg(long)]
        json: bool,
    },

    /// Cancel a change that has not been claimed yet
    Cancel { change_id: String },
}

fn main() -> Result<()> {
    env_logger::Builder::from_env(env_logger::Env::default().default_filter_or("info")).init();

    let cli = Cli::parse();
    let config = match &cli.config {
        Some(path) => load_config_from(path),
        None => load_config(),
    }
    .context("Failed to load configuration")?;

    match cli.command.unwrap_or(Commands::Run) {
        Commands::Run => {
            let runtime = tokio::runtime::Builder::new_multi_thread()
                .enable_all()
                .build()
                .context("Failed to start tokio runtime")?;
            runtime.block_on(adpacer_lib::run_service(config))?;
        }
        Commands::Decide { seed } => {
            let db = open_db(&config)?;
            let report = run_decision_cycle(&db, &config, Utc::now(), seed)?;
            println!("{}", serde_json::to_string_pretty(&report)?);
        }
        Commands::Reap => {
            let db = open_db(&config)?;
            let report = db.reap_expired_claims(Utc::now(), config.execution.claim_timeout())?;
            println!(
                "requeued {} expired claim(s), failed {} stuck execution(s)",
                report.requeued, report.failed
            );
        }
        Commands::Status { history, json } => {
            let db = open_db(&config)?;
            print_status(&db, history, json)?;
        }
        Commands::Cancel { change_id } => {
            let db = open_db(&config)?;
            if !db.cancel_change(&change_id)? {
                bail!("{} is not pending (already claimed, finished or unknown)", change_id);
            }
            println!("cancelled {}", change_id);
        }
    }
    Ok(())
}

fn open_db(config: &Config) -> Result<PacerDb> {
    let path = PacerDb::resolve_path(config)?;
    PacerDb::open_at(&path).with_context(|| format!("Failed to open database {}", path.display()))
}

fn print_status(db: &PacerDb, history: i64, json: bool) -> Result<()> {
    let counts = db.count_changes_by_status()?;
    let recent = db.recent_history(history.max(0))?;

    if json {
        let queue: serde_json::Map<String, serde_json::Value> = counts
            .iter()
            .map(|(status, n)| (status.as_str().to_string(), serde_json::Value::from(*n)))
            .collect();
        let out = serde_json::json!({ "queue": queue, "recent": recent });
        println!("{}", serde_json::to_string_pretty(&out)?);
        return Ok(());
    }

    println!("Queue:");
    for (status, n) in &counts {
        println!("  {:<10} {}", status.as_str(), n);
    }
    let outstanding: i64 = counts
        .iter()
        .filter(|(status, _)| !status.is_terminal())
        .map(|(_, n)| n)
        .sum();
    println!("  {:<10} {}", "in flight", outstanding);

    if !recent.is_empty() {
        println!("\nRecent attempts:");
        for r in &recent {
            println!(
                "  {}  {:<9} {:<10} {:<8} {:+.4} {}",
                r.recorded_at.format("%Y-%m-%d %H:%M:%S"),
                r.outcome.as_str(),
                r.change_type.as_str(),
                r.entity_id,
                r.applied_magnitude.unwrap_or(r.requested_magnitude),
                r.detail.as_deref().unwrap_or("")
            );
        }
    }
    Ok(())
}
