//! Task creation, lookup and bulk state resets.

use super::projects::get_project_internal;
use super::Database;
use crate::error::BrokerError;
use crate::types::{AssignedTask, DedupKey, NewTask, ProjectId, Task, TaskId, TaskStatus};
use anyhow::Result;
use rusqlite::types::Type;
use rusqlite::{params, Connection, OptionalExtension, Row};
use tracing::debug;

pub fn parse_task_row(row: &Row) -> rusqlite::Result<Task> {
    let status: String = row.get("status")?;
    let status = status
        .parse::<TaskStatus>()
        .map_err(|e| rusqlite::Error::FromSqlConversionFailure(0, Type::Text, e.into()))?;

    Ok(Task {
        id: row.get("id")?,
        project_id: row.get("project_id")?,
        assignee: row.get("assignee")?,
        retries: row.get("retries")?,
        max_retries: row.get("max_retries")?,
        status,
        recipe: row.get("recipe")?,
        priority: row.get("priority")?,
        max_assign_time: row.get("max_assign_time")?,
        assign_time: row.get("assign_time")?,
        verification_count: row.get("verification_count")?,
        hash64: row.get("hash64")?,
        unique_string: row.get("unique_string")?,
    })
}

/// Internal helper to get a task using an existing connection (avoids deadlock).
pub(crate) fn get_task_internal(conn: &Connection, task_id: TaskId) -> Result<Option<Task>> {
    let task = conn
        .query_row(
            "SELECT * FROM tasks WHERE id = ?1",
            params![task_id],
            parse_task_row,
        )
        .optional()?;
    Ok(task)
}

/// Insert one validated task. Dedup collisions surface as UNIQUE violations.
fn insert_task_internal(conn: &Connection, task: &NewTask) -> Result<TaskId> {
    let (hash64, unique_string) = match task.dedup_key()? {
        Some(DedupKey::Hash64(hash)) => (Some(hash), None),
        Some(DedupKey::UniqueString(s)) => (None, Some(s)),
        None => (None, None),
    };

    conn.execute(
        "INSERT INTO tasks (
            project_id, max_retries, status, recipe, priority, max_assign_time,
            verification_count, hash64, unique_string
        ) VALUES (?1, ?2, 'new', ?3, ?4, ?5, ?6, ?7, ?8)",
        params![
            task.project,
            task.max_retries,
            &task.recipe,
            task.priority,
            task.max_assign_time,
            task.verification_count,
            hash64,
            unique_string,
        ],
    )
    .map_err(|e| anyhow::Error::from(BrokerError::from(e)))?;

    Ok(conn.last_insert_rowid())
}

fn ensure_project(conn: &Connection, project_id: ProjectId) -> Result<()> {
    if get_project_internal(conn, project_id)?.is_none() {
        return Err(BrokerError::project_not_found(project_id).into());
    }
    Ok(())
}

impl Database {
    /// Create a single task. Access checks are the caller's job.
    pub fn create_task(&self, task: &NewTask) -> Result<TaskId> {
        task.validate()?;

        self.with_conn(|conn| {
            ensure_project(conn, task.project)?;
            let id = insert_task_internal(conn, task)?;

            debug!(task_id = id, project_id = task.project, priority = task.priority, "task created");

            Ok(id)
        })
    }

    /// Create a batch of tasks for one project, all or nothing.
    pub fn create_tasks_bulk(&self, tasks: &[NewTask]) -> Result<Vec<TaskId>> {
        let Some(first) = tasks.first() else {
            return Err(BrokerError::invalid_spec("requests", "Bulk submit needs at least one task").into());
        };
        for task in tasks {
            task.validate()?;
            if task.project != first.project {
                return Err(BrokerError::invalid_spec(
                    "project",
                    "All tasks of a bulk submit must target the same project",
                )
                .into());
            }
        }

        self.with_conn_mut(|conn| {
            let tx = conn.transaction()?;
            ensure_project(&tx, first.project)?;

            let mut ids = Vec::with_capacity(tasks.len());
            for task in tasks {
                ids.push(insert_task_internal(&tx, task)?);
            }

            tx.commit()?;

            debug!(project_id = first.project, count = ids.len(), "task batch created");

            Ok(ids)
        })
    }

    /// Get a task by ID.
    pub fn get_task(&self, task_id: TaskId) -> Result<Option<Task>> {
        self.with_conn(|conn| get_task_internal(conn, task_id))
    }

    /// Get a task joined with its project.
    pub fn get_assigned_task(&self, task_id: TaskId) -> Result<Option<AssignedTask>> {
        self.with_conn(|conn| {
            let Some(task) = get_task_internal(conn, task_id)? else {
                return Ok(None);
            };
            let project = get_project_internal(conn, task.project_id)?
                .ok_or_else(|| BrokerError::project_not_found(task.project_id))?;
            Ok(Some(AssignedTask {
                task,
                project: project.summary(),
            }))
        })
    }

    /// All tasks of a project in storage order.
    pub fn list_tasks(&self, project_id: ProjectId) -> Result<Vec<Task>> {
        self.with_conn(|conn| {
            let mut stmt = conn.prepare("SELECT * FROM tasks WHERE project_id = ?1 ORDER BY id")?;
            let tasks = stmt
                .query_map(params![project_id], parse_task_row)?
                .collect::<rusqlite::Result<Vec<_>>>()?;
            Ok(tasks)
        })
    }

    /// Tasks of a project in a given status.
    pub fn get_tasks_by_status(&self, project_id: ProjectId, status: TaskStatus) -> Result<Vec<Task>> {
        self.with_conn(|conn| {
            let mut stmt = conn.prepare(
                "SELECT * FROM tasks WHERE project_id = ?1 AND status = ?2 ORDER BY id",
            )?;
            let tasks = stmt
                .query_map(params![project_id, status.as_str()], parse_task_row)?
                .collect::<rusqlite::Result<Vec<_>>>()?;
            Ok(tasks)
        })
    }

    /// Put every Failed task of a project back to New with zero retries.
    pub fn reset_failed(&self, project_id: ProjectId) -> Result<u64> {
        self.with_conn(|conn| {
            let updated = conn.execute(
                "UPDATE tasks SET status = 'new', retries = 0, assignee = NULL, assign_time = NULL
                 WHERE project_id = ?1 AND status = 'failed'",
                params![project_id],
            )?;

            debug!(project_id, updated, "failed tasks reset");

            Ok(updated as u64)
        })
    }

    /// Delete every task of a project. Returns the number of deleted tasks.
    pub fn hard_reset(&self, project_id: ProjectId) -> Result<u64> {
        self.with_conn_mut(|conn| {
            let tx = conn.transaction()?;

            tx.execute(
                "UPDATE tasks SET assignee = NULL, assign_time = NULL WHERE project_id = ?1",
                params![project_id],
            )?;
            let deleted = tx.execute("DELETE FROM tasks WHERE project_id = ?1", params![project_id])?;

            tx.commit()?;

            debug!(project_id, deleted, "project tasks wiped");

            Ok(deleted as u64)
        })
    }
}
