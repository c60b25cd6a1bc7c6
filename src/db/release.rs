//! Result release: retry bookkeeping, verification quorum and chaining.

use super::Database;
use crate::types::{TaskId, TaskResult, WorkerId};
use anyhow::Result;
use rusqlite::{params, Connection, OptionalExtension};
use tracing::debug;

/// Close an assigned task. Returns false if the worker no longer holds it.
fn close_task(conn: &Connection, task_id: TaskId, worker_id: WorkerId) -> Result<bool> {
    let updated = conn.execute(
        "UPDATE tasks SET status = 'closed', assignee = NULL, assign_time = NULL
         WHERE id = ?1 AND assignee = ?2",
        params![task_id, worker_id],
    )?;
    Ok(updated == 1)
}

/// Hand the task back to the pool without touching retries.
fn free_task(conn: &Connection, task_id: TaskId, worker_id: WorkerId) -> Result<bool> {
    let updated = conn.execute(
        "UPDATE tasks SET status = 'new', assignee = NULL, assign_time = NULL
         WHERE id = ?1 AND assignee = ?2",
        params![task_id, worker_id],
    )?;
    Ok(updated == 1)
}

/// Create the follow-up task in the chain target project, if there is one.
fn chain_task(conn: &Connection, task_id: TaskId) -> Result<Option<TaskId>> {
    let inserted = conn.execute(
        "INSERT INTO tasks (
            project_id, max_retries, status, recipe, priority, max_assign_time, verification_count
        )
        SELECT p.chain_target_id, t.max_retries, 'new', t.recipe, t.priority,
               t.max_assign_time, t.verification_count
        FROM tasks t
        JOIN projects p ON p.id = t.project_id
        WHERE t.id = ?1 AND p.chain_target_id IS NOT NULL",
        params![task_id],
    )?;

    Ok((inserted == 1).then(|| conn.last_insert_rowid()))
}

fn close_and_chain(conn: &Connection, task_id: TaskId, worker_id: WorkerId) -> Result<bool> {
    if !close_task(conn, task_id, worker_id)? {
        return Ok(false);
    }
    if let Some(chained) = chain_task(conn, task_id)? {
        debug!(task_id, chained_task_id = chained, "task chained");
    }
    Ok(true)
}

/// Record a verification and close the task once `required` workers agree.
fn verify_task(
    conn: &Connection,
    task_id: TaskId,
    worker_id: WorkerId,
    required: i64,
    verification: i64,
) -> Result<bool> {
    let recorded = conn.execute(
        "INSERT OR IGNORE INTO worker_verifies_task (task_id, worker_id, verification)
         VALUES (?1, ?2, ?3)",
        params![task_id, worker_id, verification],
    )?;

    if recorded == 0 {
        debug!(task_id, worker_id, "duplicate verification ignored");
        free_task(conn, task_id, worker_id)?;
        return Ok(false);
    }

    let matching: i64 = conn.query_row(
        "SELECT COUNT(*) FROM worker_verifies_task WHERE task_id = ?1 AND verification = ?2",
        params![task_id, verification],
        |row| row.get(0),
    )?;

    if matching < required {
        debug!(task_id, worker_id, matching, required, "verification recorded");
        free_task(conn, task_id, worker_id)?;
        return Ok(false);
    }

    let closed = close_and_chain(conn, task_id, worker_id)?;
    if closed {
        conn.execute(
            "DELETE FROM worker_verifies_task WHERE task_id = ?1",
            params![task_id],
        )?;
        debug!(task_id, matching, "verification quorum reached");
    }
    Ok(closed)
}

impl Database {
    /// Apply a worker's result to a task it holds.
    ///
    /// Returns whether the task changed state in the way the result asked for.
    /// A task that does not exist or is not assigned to `worker_id` is left
    /// alone and reported as not updated.
    pub fn release_task(
        &self,
        task_id: TaskId,
        worker_id: WorkerId,
        result: TaskResult,
        verification: i64,
    ) -> Result<bool> {
        self.with_conn_mut(|conn| {
            let tx = conn.transaction()?;

            let updated = match result {
                TaskResult::Ok => {
                    let required: Option<i64> = tx
                        .query_row(
                            "SELECT verification_count FROM tasks WHERE id = ?1 AND assignee = ?2",
                            params![task_id, worker_id],
                            |row| row.get(0),
                        )
                        .optional()?;

                    match required {
                        None => false,
                        Some(n) if n <= 0 => close_and_chain(&tx, task_id, worker_id)?,
                        Some(n) => verify_task(&tx, task_id, worker_id, n, verification)?,
                    }
                }
                TaskResult::Fail => {
                    let changed = tx.execute(
                        "UPDATE tasks SET
                            status = CASE WHEN retries + 1 >= max_retries THEN 'failed' ELSE 'new' END,
                            assignee = NULL,
                            assign_time = NULL,
                            retries = retries + 1
                         WHERE id = ?1 AND assignee = ?2",
                        params![task_id, worker_id],
                    )?;
                    changed == 1
                }
                TaskResult::Skip => free_task(&tx, task_id, worker_id)?,
            };

            tx.commit()?;

            debug!(task_id, worker_id, ?result, verification, updated, "task released");

            Ok(updated)
        })
    }
}
