//! Background maintenance loops.
//!
//! Each job ticks on its own interval and runs on the blocking pool, since
//! every store call takes the connection lock. A failed tick is logged and the
//! loop carries on with the next one.

use crate::config::Config;
use crate::db::{now_secs, Database};
use std::time::Duration;
use tokio::task::JoinHandle;
use tokio::time::MissedTickBehavior;
use tracing::{error, info};

/// Handles of the running maintenance loops. Dropping it stops nothing;
/// call [`Scheduler::shutdown`] to abort the loops.
pub struct Scheduler {
    handles: Vec<JoinHandle<()>>,
}

impl Scheduler {
    /// Start the reclaim and snapshot loops enabled in `config`.
    pub fn start(db: Database, config: &Config) -> Self {
        let mut handles = Vec::new();

        if let Some(every) = config.maintenance.reclaim_interval() {
            handles.push(spawn_reclaim(db.clone(), every));
        }

        if let Some(every) = config.monitoring.snapshot_interval() {
            handles.push(spawn_snapshots(db, every, config.monitoring.history_secs));
        }

        info!(jobs = handles.len(), "maintenance scheduler started");
        Self { handles }
    }

    pub fn job_count(&self) -> usize {
        self.handles.len()
    }

    /// Abort every loop.
    pub fn shutdown(self) {
        for handle in self.handles {
            handle.abort();
        }
    }
}

fn spawn_reclaim(db: Database, every: Duration) -> JoinHandle<()> {
    tokio::spawn(async move {
        let mut interval = tokio::time::interval(every);
        interval.set_missed_tick_behavior(MissedTickBehavior::Delay);

        loop {
            interval.tick().await;

            let db = db.clone();
            match tokio::task::spawn_blocking(move || db.reclaim_timed_out()).await {
                Ok(Ok(_)) => {}
                Ok(Err(e)) => error!(error = %e, "reclaim sweep failed"),
                Err(e) => error!(error = %e, "reclaim sweep panicked"),
            }
        }
    })
}

fn spawn_snapshots(db: Database, every: Duration, history_secs: i64) -> JoinHandle<()> {
    tokio::spawn(async move {
        let mut interval = tokio::time::interval(every);
        interval.set_missed_tick_behavior(MissedTickBehavior::Delay);

        loop {
            interval.tick().await;

            let db = db.clone();
            match tokio::task::spawn_blocking(move || db.take_snapshots(now_secs(), history_secs)).await {
                Ok(Ok(_)) => {}
                Ok(Err(e)) => error!(error = %e, "monitoring snapshot failed"),
                Err(e) => error!(error = %e, "monitoring snapshot panicked"),
            }
        }
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::types::NewProject;

    fn config(reclaim: u64, snapshot: u64) -> Config {
        let mut config = Config::default();
        config.maintenance.reclaim_interval_secs = reclaim;
        config.monitoring.snapshot_interval_secs = snapshot;
        config
    }

    #[tokio::test]
    async fn disabled_jobs_are_not_spawned() {
        let db = Database::open_in_memory().unwrap();
        let scheduler = Scheduler::start(db, &config(0, 0));
        assert_eq!(scheduler.job_count(), 0);
        scheduler.shutdown();
    }

    #[tokio::test]
    async fn snapshot_loop_runs_on_start() {
        let db = Database::open_in_memory().unwrap();
        let project = db
            .create_project(NewProject {
                name: "sched".to_string(),
                ..Default::default()
            })
            .unwrap();

        // The first interval tick completes immediately
        let scheduler = Scheduler::start(db.clone(), &config(0, 3600));
        assert_eq!(scheduler.job_count(), 1);

        let mut taken = Vec::new();
        for _ in 0..50 {
            tokio::time::sleep(Duration::from_millis(20)).await;
            taken = db.latest_snapshots(project.id, 10).unwrap();
            if !taken.is_empty() {
                break;
            }
        }
        scheduler.shutdown();

        assert_eq!(taken.len(), 1);
        assert_eq!(taken[0].project_id, project.id);
    }
}
