//! Worker access grants: the authoritative store behind the access cache.

use super::projects::get_project_internal;
use super::workers::get_worker_internal;
use super::Database;
use crate::cache::AccessStore;
use crate::error::BrokerError;
use crate::types::{AccessKind, ProjectId, WorkerAccess, WorkerId};
use anyhow::Result;
use rusqlite::{params, Connection, OptionalExtension, Row};
use tracing::debug;

fn parse_access_row(row: &Row) -> rusqlite::Result<WorkerAccess> {
    Ok(WorkerAccess {
        worker_id: row.get("worker_id")?,
        project_id: row.get("project_id")?,
        can_assign: row.get("can_assign")?,
        can_submit: row.get("can_submit")?,
        pending_request: row.get("pending_request")?,
    })
}

/// Evaluate one access flag against the store.
///
/// Assignment is open on public projects; submission always needs an accepted grant.
pub(crate) fn access_allows(
    conn: &Connection,
    kind: AccessKind,
    worker_id: WorkerId,
    project_id: ProjectId,
) -> Result<bool> {
    let sql = match kind {
        AccessKind::Assign => {
            "SELECT p.public OR EXISTS (
                SELECT 1 FROM worker_access a
                WHERE a.worker_id = ?1 AND a.project_id = p.id
                  AND a.can_assign = 1 AND a.pending_request = 0)
             FROM projects p WHERE p.id = ?2"
        }
        AccessKind::Submit => {
            "SELECT EXISTS (
                SELECT 1 FROM worker_access a
                WHERE a.worker_id = ?1 AND a.project_id = p.id
                  AND a.can_submit = 1 AND a.pending_request = 0)
             FROM projects p WHERE p.id = ?2"
        }
    };

    let allowed: Option<bool> = conn
        .query_row(sql, params![worker_id, project_id], |row| row.get(0))
        .optional()?;
    Ok(allowed.unwrap_or(false))
}

impl Database {
    /// Record an access request. Returns false if a row already exists for the pair.
    pub fn insert_access_request(
        &self,
        worker_id: WorkerId,
        project_id: ProjectId,
        can_assign: bool,
        can_submit: bool,
    ) -> Result<bool> {
        if !can_assign && !can_submit {
            return Err(BrokerError::invalid_spec(
                "can_assign",
                "An access request must ask for assign or submit",
            )
            .into());
        }

        self.with_conn(|conn| {
            if get_project_internal(conn, project_id)?.is_none() {
                return Err(BrokerError::project_not_found(project_id).into());
            }
            if get_worker_internal(conn, worker_id)?.is_none() {
                return Err(BrokerError::worker_not_found(worker_id).into());
            }

            let inserted = conn.execute(
                "INSERT INTO worker_access (worker_id, project_id, can_assign, can_submit, pending_request)
                 VALUES (?1, ?2, ?3, ?4, 1)
                 ON CONFLICT (worker_id, project_id) DO NOTHING",
                params![worker_id, project_id, can_assign, can_submit],
            )?;

            debug!(worker_id, project_id, can_assign, can_submit, inserted, "access requested");

            Ok(inserted == 1)
        })
    }

    /// Accept a pending request. Returns false when there was nothing pending.
    pub fn accept_access_request(&self, worker_id: WorkerId, project_id: ProjectId) -> Result<bool> {
        self.with_conn(|conn| {
            let updated = conn.execute(
                "UPDATE worker_access SET pending_request = 0
                 WHERE worker_id = ?1 AND project_id = ?2 AND pending_request = 1",
                params![worker_id, project_id],
            )?;

            debug!(worker_id, project_id, updated, "access accepted");

            Ok(updated == 1)
        })
    }

    /// Reject a request or revoke a grant by deleting the row.
    pub fn delete_access(&self, worker_id: WorkerId, project_id: ProjectId) -> Result<bool> {
        self.with_conn(|conn| {
            let deleted = conn.execute(
                "DELETE FROM worker_access WHERE worker_id = ?1 AND project_id = ?2",
                params![worker_id, project_id],
            )?;

            debug!(worker_id, project_id, deleted, "access removed");

            Ok(deleted == 1)
        })
    }

    /// Get the access row for a pair, if any.
    pub fn get_access(&self, worker_id: WorkerId, project_id: ProjectId) -> Result<Option<WorkerAccess>> {
        self.with_conn(|conn| {
            let access = conn
                .query_row(
                    "SELECT * FROM worker_access WHERE worker_id = ?1 AND project_id = ?2",
                    params![worker_id, project_id],
                    parse_access_row,
                )
                .optional()?;
            Ok(access)
        })
    }

    /// All access rows of a project, pending or not.
    pub fn list_access(&self, project_id: ProjectId) -> Result<Vec<WorkerAccess>> {
        self.with_conn(|conn| {
            let mut stmt = conn.prepare(
                "SELECT * FROM worker_access WHERE project_id = ?1 ORDER BY worker_id",
            )?;
            let rows = stmt
                .query_map(params![project_id], parse_access_row)?
                .collect::<rusqlite::Result<Vec<_>>>()?;
            Ok(rows)
        })
    }

    /// Requests of a project still waiting for a manager decision.
    pub fn pending_requests(&self, project_id: ProjectId) -> Result<Vec<WorkerAccess>> {
        Ok(self
            .list_access(project_id)?
            .into_iter()
            .filter(|a| a.pending_request)
            .collect())
    }
}

impl AccessStore for Database {
    fn allows(&self, kind: AccessKind, worker_id: WorkerId, project_id: ProjectId) -> Result<bool> {
        self.with_conn(|conn| access_allows(conn, kind, worker_id, project_id))
    }

    fn request(
        &self,
        worker_id: WorkerId,
        project_id: ProjectId,
        can_assign: bool,
        can_submit: bool,
    ) -> Result<bool> {
        self.insert_access_request(worker_id, project_id, can_assign, can_submit)
    }

    fn accept(&self, worker_id: WorkerId, project_id: ProjectId) -> Result<bool> {
        self.accept_access_request(worker_id, project_id)
    }

    fn remove(&self, worker_id: WorkerId, project_id: ProjectId) -> Result<bool> {
        self.delete_access(worker_id, project_id)
    }
}
