//! Timeout reclamation and monitoring snapshots.

use super::{now_secs, Database};
use crate::types::{MonitoringSnapshot, ProjectId};
use anyhow::Result;
use rusqlite::{params, Connection, Row};
use serde::Serialize;
use tracing::{debug, error, info};

/// Outcome of one snapshot sweep.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize)]
pub struct SnapshotReport {
    pub inserted: u64,
    pub pruned: u64,
    pub failed: u64,
}

fn parse_snapshot_row(row: &Row) -> rusqlite::Result<MonitoringSnapshot> {
    Ok(MonitoringSnapshot {
        project_id: row.get("project_id")?,
        new_task_count: row.get("new_task_count")?,
        failed_task_count: row.get("failed_task_count")?,
        closed_task_count: row.get("closed_task_count")?,
        worker_access_count: row.get("worker_access_count")?,
        awaiting_verification_count: row.get("awaiting_verification_count")?,
        timestamp: row.get("timestamp")?,
    })
}

fn insert_project_snapshot(conn: &Connection, project_id: ProjectId, now: i64) -> Result<()> {
    conn.execute(
        "INSERT INTO project_monitoring_snapshots (
            project_id, new_task_count, failed_task_count, closed_task_count,
            worker_access_count, awaiting_verification_count, timestamp
        )
        SELECT ?1,
            (SELECT COUNT(*) FROM tasks WHERE project_id = ?1 AND status = 'new'),
            (SELECT COUNT(*) FROM tasks WHERE project_id = ?1 AND status = 'failed'),
            (SELECT COUNT(*) FROM tasks WHERE project_id = ?1 AND status = 'closed'),
            (SELECT COUNT(*) FROM worker_access WHERE project_id = ?1 AND pending_request = 0),
            (SELECT COUNT(DISTINCT v.task_id) FROM worker_verifies_task v
                JOIN tasks t ON t.id = v.task_id
                WHERE t.project_id = ?1 AND t.status = 'new'),
            ?2",
        params![project_id, now],
    )?;
    Ok(())
}

impl Database {
    /// Free every assigned task whose deadline passed before `now`.
    pub fn reclaim_timed_out_at(&self, now: i64) -> Result<u64> {
        self.with_conn(|conn| {
            let reclaimed = conn.execute(
                "UPDATE tasks SET assignee = NULL, assign_time = NULL
                 WHERE status = 'new' AND assignee IS NOT NULL
                   AND assign_time + max_assign_time < ?1",
                params![now],
            )?;

            if reclaimed > 0 {
                info!(reclaimed, "reclaimed timed out tasks");
            }

            Ok(reclaimed as u64)
        })
    }

    pub fn reclaim_timed_out(&self) -> Result<u64> {
        self.reclaim_timed_out_at(now_secs())
    }

    /// Free every assigned task of a project, deadline or not.
    pub fn reclaim_assigned(&self, project_id: ProjectId) -> Result<u64> {
        self.with_conn(|conn| {
            let reclaimed = conn.execute(
                "UPDATE tasks SET assignee = NULL, assign_time = NULL
                 WHERE project_id = ?1 AND status = 'new' AND assignee IS NOT NULL",
                params![project_id],
            )?;

            debug!(project_id, reclaimed, "assigned tasks reclaimed");

            Ok(reclaimed as u64)
        })
    }

    /// Record one snapshot per project at `now` and prune rows older than
    /// `history_secs`. A project that fails is logged and skipped.
    pub fn take_snapshots(&self, now: i64, history_secs: i64) -> Result<SnapshotReport> {
        self.with_conn(|conn| {
            let project_ids = {
                let mut stmt = conn.prepare("SELECT id FROM projects ORDER BY id")?;
                stmt.query_map([], |row| row.get::<_, ProjectId>(0))?
                    .collect::<rusqlite::Result<Vec<_>>>()?
            };

            let mut report = SnapshotReport::default();
            for project_id in project_ids {
                match insert_project_snapshot(conn, project_id, now) {
                    Ok(()) => report.inserted += 1,
                    Err(e) => {
                        error!(project_id, error = %e, "snapshot failed");
                        report.failed += 1;
                    }
                }
            }

            let pruned = conn.execute(
                "DELETE FROM project_monitoring_snapshots WHERE timestamp < ?1",
                params![now - history_secs],
            )?;
            report.pruned = pruned as u64;

            debug!(
                inserted = report.inserted,
                pruned = report.pruned,
                failed = report.failed,
                "monitoring snapshots taken"
            );

            Ok(report)
        })
    }

    /// Snapshots of a project with `from <= timestamp <= to`, newest first.
    pub fn snapshots_between(&self, project_id: ProjectId, from: i64, to: i64) -> Result<Vec<MonitoringSnapshot>> {
        self.with_conn(|conn| {
            let mut stmt = conn.prepare(
                "SELECT * FROM project_monitoring_snapshots
                 WHERE project_id = ?1 AND timestamp BETWEEN ?2 AND ?3
                 ORDER BY timestamp DESC, id DESC",
            )?;
            let snapshots = stmt
                .query_map(params![project_id, from, to], parse_snapshot_row)?
                .collect::<rusqlite::Result<Vec<_>>>()?;
            Ok(snapshots)
        })
    }

    /// The `count` most recent snapshots of a project, newest first.
    pub fn latest_snapshots(&self, project_id: ProjectId, count: u32) -> Result<Vec<MonitoringSnapshot>> {
        self.with_conn(|conn| {
            let mut stmt = conn.prepare(
                "SELECT * FROM project_monitoring_snapshots
                 WHERE project_id = ?1
                 ORDER BY timestamp DESC, id DESC
                 LIMIT ?2",
            )?;
            let snapshots = stmt
                .query_map(params![project_id, count], parse_snapshot_row)?
                .collect::<rusqlite::Result<Vec<_>>>()?;
            Ok(snapshots)
        })
    }
}
