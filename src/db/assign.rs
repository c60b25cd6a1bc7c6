//! Atomic task claiming.

use super::Database;
use crate::types::{ProjectId, TaskId, WorkerId};
use anyhow::Result;
use rusqlite::{params, OptionalExtension};
use tracing::debug;

/// Select-and-claim in one statement. Eligible rows are New, unassigned, in a
/// non-paused project the worker may assign from, and not yet verified by the
/// same worker. Highest priority wins; equal priorities go oldest first.
const CLAIM_SQL: &str = "
    UPDATE tasks SET assignee = ?1, assign_time = ?3
    WHERE id = (
        SELECT t.id FROM tasks t
        JOIN projects p ON p.id = t.project_id
        WHERE t.project_id = ?2
          AND t.status = 'new'
          AND t.assignee IS NULL
          AND p.paused = 0
          AND (p.public = 1 OR EXISTS (
                SELECT 1 FROM worker_access a
                WHERE a.worker_id = ?1 AND a.project_id = p.id
                  AND a.can_assign = 1 AND a.pending_request = 0))
          AND NOT EXISTS (
                SELECT 1 FROM worker_verifies_task v
                WHERE v.task_id = t.id AND v.worker_id = ?1)
        ORDER BY t.priority DESC, t.id ASC
        LIMIT 1
    )
    RETURNING id";

impl Database {
    /// Claim the best eligible task of `project_id` for `worker_id` at `now`.
    ///
    /// Returns `None` when nothing is eligible. The caller is expected to have
    /// passed the rate and access checks and to hold the assignment lock.
    pub fn claim_task(&self, worker_id: WorkerId, project_id: ProjectId, now: i64) -> Result<Option<TaskId>> {
        self.with_conn(|conn| {
            let claimed: Option<TaskId> = conn
                .query_row(CLAIM_SQL, params![worker_id, project_id, now], |row| row.get(0))
                .optional()?;

            match claimed {
                Some(task_id) => debug!(task_id, worker_id, project_id, "task claimed"),
                None => debug!(worker_id, project_id, "no task available"),
            }

            Ok(claimed)
        })
    }
}
