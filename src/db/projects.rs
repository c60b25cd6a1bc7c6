//! Project CRUD, version bumps and statistics.

use super::{generate_secret, now_secs, Database};
use crate::error::BrokerError;
use crate::types::{
    validate_project_fields, AssigneeCount, NewProject, Project, ProjectId, ProjectStats,
    ProjectUpdate,
};
use anyhow::Result;
use rusqlite::{params, Connection, OptionalExtension, Row};
use tracing::debug;

const PROJECT_COLUMNS: &str = "id, name, priority, clone_url, repo_identifier, version, motd,
    public, hidden, chain_target_id, paused, assign_rate, submit_rate, secret, webhook_secret,
    created_at";

pub fn parse_project_row(row: &Row) -> rusqlite::Result<Project> {
    Ok(Project {
        id: row.get("id")?,
        name: row.get("name")?,
        priority: row.get("priority")?,
        clone_url: row.get("clone_url")?,
        repo_identifier: row.get("repo_identifier")?,
        version: row.get("version")?,
        motd: row.get("motd")?,
        public: row.get("public")?,
        hidden: row.get("hidden")?,
        chain_target_id: row.get("chain_target_id")?,
        paused: row.get("paused")?,
        assign_rate: row.get("assign_rate")?,
        submit_rate: row.get("submit_rate")?,
        secret: row.get("secret")?,
        webhook_secret: row.get("webhook_secret")?,
        created_at: row.get("created_at")?,
    })
}

/// Internal helper to get a project using an existing connection (avoids deadlock).
pub(crate) fn get_project_internal(conn: &Connection, project_id: ProjectId) -> Result<Option<Project>> {
    let sql = format!("SELECT {} FROM projects WHERE id = ?1", PROJECT_COLUMNS);
    let project = conn
        .query_row(&sql, params![project_id], parse_project_row)
        .optional()?;
    Ok(project)
}

/// A chain target must exist and must not be the project itself.
fn check_chain_target(
    conn: &Connection,
    project_id: Option<ProjectId>,
    chain_target_id: Option<ProjectId>,
) -> Result<()> {
    let Some(target) = chain_target_id else {
        return Ok(());
    };
    if Some(target) == project_id {
        return Err(
            BrokerError::invalid_spec("chain_target_id", "A project cannot chain to itself").into(),
        );
    }
    if get_project_internal(conn, target)?.is_none() {
        return Err(BrokerError::invalid_spec(
            "chain_target_id",
            &format!("Chain target project {} does not exist", target),
        )
        .into());
    }
    Ok(())
}

impl Database {
    /// Create a new project. Secrets are generated when not supplied.
    pub fn create_project(&self, new: NewProject) -> Result<Project> {
        validate_project_fields(
            &new.name,
            new.priority,
            new.public,
            new.hidden,
            new.assign_rate,
            new.submit_rate,
        )?;
        let now = now_secs();
        let secret = new.secret.unwrap_or_else(generate_secret);
        let webhook_secret = new.webhook_secret.unwrap_or_else(generate_secret);

        self.with_conn(|conn| {
            check_chain_target(conn, None, new.chain_target_id)?;

            conn.execute(
                "INSERT INTO projects (
                    name, priority, clone_url, repo_identifier, version, motd, public, hidden,
                    chain_target_id, paused, assign_rate, submit_rate, secret, webhook_secret, created_at
                ) VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9, 0, ?10, ?11, ?12, ?13, ?14)",
                params![
                    &new.name,
                    new.priority,
                    &new.clone_url,
                    &new.repo_identifier,
                    &new.version,
                    &new.motd,
                    new.public,
                    new.hidden,
                    new.chain_target_id,
                    new.assign_rate,
                    new.submit_rate,
                    &secret,
                    &webhook_secret,
                    now,
                ],
            )?;
            let id = conn.last_insert_rowid();

            debug!(project_id = id, name = %new.name, "project created");

            Ok(Project {
                id,
                name: new.name,
                priority: new.priority,
                clone_url: new.clone_url,
                repo_identifier: new.repo_identifier,
                version: new.version,
                motd: new.motd,
                public: new.public,
                hidden: new.hidden,
                chain_target_id: new.chain_target_id,
                paused: false,
                assign_rate: new.assign_rate,
                submit_rate: new.submit_rate,
                secret,
                webhook_secret,
                created_at: now,
            })
        })
    }

    /// Get a project by ID.
    pub fn get_project(&self, project_id: ProjectId) -> Result<Option<Project>> {
        self.with_conn(|conn| get_project_internal(conn, project_id))
    }

    /// List all projects, including hidden ones.
    pub fn list_projects(&self) -> Result<Vec<Project>> {
        self.with_conn(|conn| {
            let sql = format!("SELECT {} FROM projects ORDER BY id", PROJECT_COLUMNS);
            let mut stmt = conn.prepare(&sql)?;
            let projects = stmt
                .query_map([], parse_project_row)?
                .collect::<rusqlite::Result<Vec<_>>>()?;
            Ok(projects)
        })
    }

    /// Replace a project's mutable fields.
    pub fn update_project(&self, project_id: ProjectId, update: ProjectUpdate) -> Result<Project> {
        validate_project_fields(
            &update.name,
            update.priority,
            update.public,
            update.hidden,
            update.assign_rate,
            update.submit_rate,
        )?;

        self.with_conn(|conn| {
            check_chain_target(conn, Some(project_id), update.chain_target_id)?;

            let updated = conn.execute(
                "UPDATE projects SET name = ?1, priority = ?2, clone_url = ?3, repo_identifier = ?4,
                    version = ?5, motd = ?6, public = ?7, hidden = ?8, chain_target_id = ?9,
                    paused = ?10, assign_rate = ?11, submit_rate = ?12
                 WHERE id = ?13",
                params![
                    &update.name,
                    update.priority,
                    &update.clone_url,
                    &update.repo_identifier,
                    &update.version,
                    &update.motd,
                    update.public,
                    update.hidden,
                    update.chain_target_id,
                    update.paused,
                    update.assign_rate,
                    update.submit_rate,
                    project_id,
                ],
            )?;

            if updated == 0 {
                return Err(BrokerError::project_not_found(project_id).into());
            }

            debug!(project_id, paused = update.paused, "project updated");

            get_project_internal(conn, project_id)?
                .ok_or_else(|| BrokerError::project_not_found(project_id).into())
        })
    }

    /// Set the version of the project tracking `repo_identifier` (case-insensitive).
    /// Returns the updated project, or None when no project tracks that repository.
    pub fn set_project_version(&self, repo_identifier: &str, version: &str) -> Result<Option<Project>> {
        self.with_conn(|conn| {
            let id: Option<ProjectId> = conn
                .query_row(
                    "SELECT id FROM projects WHERE repo_identifier = ?1 COLLATE NOCASE",
                    params![repo_identifier],
                    |row| row.get(0),
                )
                .optional()?;

            let Some(id) = id else {
                return Ok(None);
            };

            conn.execute(
                "UPDATE projects SET version = ?1 WHERE id = ?2",
                params![version, id],
            )?;

            debug!(project_id = id, version, "project version bumped");

            get_project_internal(conn, id)
        })
    }

    /// Task counters and current assignees for a project.
    pub fn project_stats(&self, project_id: ProjectId) -> Result<ProjectStats> {
        self.with_conn(|conn| {
            if get_project_internal(conn, project_id)?.is_none() {
                return Err(BrokerError::project_not_found(project_id).into());
            }

            let (new_task_count, failed_task_count, closed_task_count): (i64, i64, i64) = conn
                .query_row(
                    "SELECT
                        COALESCE(SUM(status = 'new'), 0),
                        COALESCE(SUM(status = 'failed'), 0),
                        COALESCE(SUM(status = 'closed'), 0)
                     FROM tasks WHERE project_id = ?1",
                    params![project_id],
                    |row| Ok((row.get(0)?, row.get(1)?, row.get(2)?)),
                )?;

            let mut stmt = conn.prepare(
                "SELECT assignee, COUNT(*) FROM tasks
                 WHERE project_id = ?1 AND assignee IS NOT NULL
                 GROUP BY assignee ORDER BY COUNT(*) DESC, assignee",
            )?;
            let assignees = stmt
                .query_map(params![project_id], |row| {
                    Ok(AssigneeCount {
                        worker_id: row.get(0)?,
                        task_count: row.get(1)?,
                    })
                })?
                .collect::<rusqlite::Result<Vec<_>>>()?;

            Ok(ProjectStats {
                project_id,
                new_task_count,
                failed_task_count,
                closed_task_count,
                assignees,
            })
        })
    }
}
