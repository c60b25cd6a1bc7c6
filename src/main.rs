//! task-broker: maintenance daemon and admin commands for the task broker.

use anyhow::Result;
use clap::Parser;
use serde::Serialize;
use std::path::PathBuf;
use task_broker::cli::{Cli, Command};
use task_broker::config::ConfigLoader;
use task_broker::db::{now_secs, Database};
use task_broker::logging::{self, LogTarget};
use task_broker::scheduler::Scheduler;
use tracing::info;

fn print_json<T: Serialize>(value: &T) -> Result<()> {
    println!("{}", serde_json::to_string_pretty(value)?);
    Ok(())
}

#[tokio::main]
async fn main() -> Result<()> {
    let cli = Cli::parse();

    logging::init(&LogTarget::parse(&cli.log), cli.verbose)?;

    let loader = ConfigLoader::load(cli.config.as_ref().map(PathBuf::from))?;
    let config_path_used = loader
        .config_path()
        .map(|p| p.to_string_lossy().to_string());
    let tier = loader.tier();
    let mut config = loader.into_config();

    // Override paths from CLI arguments
    if let Some(db_path) = &cli.database {
        config.server.db_path = db_path.into();
    }

    config.ensure_db_dir()?;
    let db = Database::open(&config.server.db_path)?;

    match cli.command.unwrap_or(Command::Serve) {
        Command::Serve => {
            info!(
                "Starting task-broker (config: {}, from {})",
                config_path_used.as_deref().unwrap_or("defaults"),
                tier
            );
            info!("Database: {:?}", config.server.db_path);

            let scheduler = Scheduler::start(db, &config);
            tokio::signal::ctrl_c().await?;
            info!("Shutting down");
            scheduler.shutdown();
        }
        Command::Reclaim => {
            let reclaimed = db.reclaim_timed_out()?;
            print_json(&serde_json::json!({ "reclaimed": reclaimed }))?;
        }
        Command::Snapshot => {
            let report = db.take_snapshots(now_secs(), config.monitoring.history_secs)?;
            print_json(&report)?;
        }
        Command::ResetFailed { project } => {
            let reset = db.reset_failed(project)?;
            print_json(&serde_json::json!({ "project": project, "reset": reset }))?;
        }
        Command::HardReset { project } => {
            let deleted = db.hard_reset(project)?;
            print_json(&serde_json::json!({ "project": project, "deleted": deleted }))?;
        }
        Command::Stats { project } => {
            print_json(&db.project_stats(project)?)?;
        }
    }

    Ok(())
}
