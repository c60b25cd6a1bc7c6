//! Worker CRUD operations.

use super::{generate_secret, now_secs, Database};
use crate::error::BrokerError;
use crate::types::{Worker, WorkerId, RESERVED_WORKER_ALIAS};
use anyhow::Result;
use rusqlite::{params, Connection, OptionalExtension};
use tracing::debug;

fn check_alias(alias: Option<&str>) -> Result<()> {
    if alias == Some(RESERVED_WORKER_ALIAS) {
        return Err(BrokerError::invalid_spec(
            "alias",
            &format!("Alias '{}' is reserved", RESERVED_WORKER_ALIAS),
        )
        .into());
    }
    Ok(())
}

/// Internal helper to get a worker using an existing connection (avoids deadlock).
pub(crate) fn get_worker_internal(conn: &Connection, worker_id: WorkerId) -> Result<Option<Worker>> {
    let worker = conn
        .query_row(
            "SELECT id, created_at, alias, secret, paused FROM workers WHERE id = ?1",
            params![worker_id],
            |row| {
                Ok(Worker {
                    id: row.get(0)?,
                    created_at: row.get(1)?,
                    alias: row.get(2)?,
                    secret: row.get(3)?,
                    paused: row.get(4)?,
                })
            },
        )
        .optional()?;
    Ok(worker)
}

impl Database {
    /// Register a new worker with a freshly generated secret.
    pub fn create_worker(&self, alias: Option<String>) -> Result<Worker> {
        check_alias(alias.as_deref())?;
        let now = now_secs();
        let secret = generate_secret();

        self.with_conn(|conn| {
            conn.execute(
                "INSERT INTO workers (created_at, alias, secret, paused) VALUES (?1, ?2, ?3, 0)",
                params![now, &alias, &secret],
            )?;
            let id = conn.last_insert_rowid();

            debug!(worker_id = id, alias = ?alias, "worker created");

            Ok(Worker {
                id,
                created_at: now,
                alias,
                secret,
                paused: false,
            })
        })
    }

    /// Get a worker by ID.
    pub fn get_worker(&self, worker_id: WorkerId) -> Result<Option<Worker>> {
        self.with_conn(|conn| get_worker_internal(conn, worker_id))
    }

    /// Update a worker's alias and paused flag.
    pub fn update_worker(
        &self,
        worker_id: WorkerId,
        alias: Option<String>,
        paused: bool,
    ) -> Result<Worker> {
        check_alias(alias.as_deref())?;

        self.with_conn(|conn| {
            let updated = conn.execute(
                "UPDATE workers SET alias = ?1, paused = ?2 WHERE id = ?3",
                params![&alias, paused, worker_id],
            )?;

            if updated == 0 {
                return Err(BrokerError::worker_not_found(worker_id).into());
            }

            debug!(worker_id, paused, "worker updated");

            get_worker_internal(conn, worker_id)?
                .ok_or_else(|| BrokerError::worker_not_found(worker_id).into())
        })
    }
}
