//! Request-facing operations.
//!
//! `Broker` combines the store with the in-process caches and limiters. Every
//! worker-facing call is checked in the same order: admission control, then
//! authorization, then the store operation.

use crate::cache::{AccessCache, EntityCache};
use crate::db::maintenance::SnapshotReport;
use crate::db::{now_secs, Database};
use crate::error::{BrokerError, BrokerResult};
use crate::rate::RateLimiters;
use crate::types::{
    AccessKind, AssignedTask, MonitoringSnapshot, NewProject, NewTask, Project, ProjectId, ProjectStats,
    ProjectUpdate, TaskId, TaskResult, Worker, WorkerAccess, WorkerId,
};
use std::sync::{Arc, Mutex, PoisonError};
use std::time::Duration;
use tracing::{debug, warn};

pub struct Broker {
    db: Database,
    access: AccessCache,
    workers: EntityCache<WorkerId, Worker>,
    projects: EntityCache<ProjectId, Project>,
    limiters: RateLimiters,
    /// Serializes the claim statement across all assign calls.
    assign_lock: Mutex<()>,
}

impl Broker {
    pub fn new(db: Database) -> Self {
        Self {
            access: AccessCache::new(Arc::new(db.clone())),
            db,
            workers: EntityCache::new(),
            projects: EntityCache::new(),
            limiters: RateLimiters::new(),
            assign_lock: Mutex::new(()),
        }
    }

    /// Broker over a fresh in-memory database.
    pub fn in_memory() -> BrokerResult<Self> {
        Ok(Self::new(Database::open_in_memory()?))
    }

    pub fn db(&self) -> &Database {
        &self.db
    }

    pub fn access_cache(&self) -> &AccessCache {
        &self.access
    }

    pub fn limiters(&self) -> &RateLimiters {
        &self.limiters
    }

    // Projects

    pub fn create_project(&self, new: NewProject) -> BrokerResult<Project> {
        let project = self.db.create_project(new)?;
        self.projects.put(project.id, project.clone());
        Ok(project)
    }

    pub fn get_project(&self, project_id: ProjectId) -> BrokerResult<Option<Project>> {
        Ok(self.projects.get_or_load(project_id, |id| self.db.get_project(id))?)
    }

    fn require_project(&self, project_id: ProjectId) -> BrokerResult<Project> {
        self.get_project(project_id)?
            .ok_or_else(|| BrokerError::project_not_found(project_id))
    }

    /// Update a project. Visibility may change, so cached grants for it are dropped.
    pub fn update_project(&self, project_id: ProjectId, update: ProjectUpdate) -> BrokerResult<Project> {
        let project = self.db.update_project(project_id, update)?;
        self.projects.put(project_id, project.clone());
        self.access.invalidate_project(project_id);
        Ok(project)
    }

    pub fn set_project_version(&self, repo_identifier: &str, version: &str) -> BrokerResult<Option<Project>> {
        let project = self.db.set_project_version(repo_identifier, version)?;
        if let Some(ref project) = project {
            self.projects.put(project.id, project.clone());
        }
        Ok(project)
    }

    pub fn project_stats(&self, project_id: ProjectId) -> BrokerResult<ProjectStats> {
        Ok(self.db.project_stats(project_id)?)
    }

    // Workers

    pub fn create_worker(&self, alias: Option<String>) -> BrokerResult<Worker> {
        let worker = self.db.create_worker(alias)?;
        self.workers.put(worker.id, worker.clone());
        Ok(worker)
    }

    pub fn get_worker(&self, worker_id: WorkerId) -> BrokerResult<Option<Worker>> {
        Ok(self.workers.get_or_load(worker_id, |id| self.db.get_worker(id))?)
    }

    pub fn update_worker(&self, worker_id: WorkerId, alias: Option<String>, paused: bool) -> BrokerResult<Worker> {
        let worker = self.db.update_worker(worker_id, alias, paused)?;
        self.workers.put(worker_id, worker.clone());
        Ok(worker)
    }

    fn require_worker(&self, worker_id: WorkerId) -> BrokerResult<Worker> {
        self.get_worker(worker_id)?
            .ok_or_else(|| BrokerError::unauthorized(format!("Unknown worker: {}", worker_id)))
    }

    // Admission and authorization

    fn admit(&self, delay: Duration, worker_id: WorkerId, project_id: ProjectId, op: &str) -> BrokerResult<()> {
        if delay > Duration::ZERO {
            warn!(worker_id, project_id, op, delay_secs = delay.as_secs_f64(), "rate limited");
            return Err(BrokerError::rate_limited(delay));
        }
        Ok(())
    }

    fn authorize(&self, kind: AccessKind, worker_id: WorkerId, project_id: ProjectId) -> BrokerResult<()> {
        if !self.access.check(kind, worker_id, project_id)? {
            warn!(worker_id, project_id, ?kind, "access denied");
            let what = match kind {
                AccessKind::Assign => "assign from",
                AccessKind::Submit => "submit to",
            };
            return Err(BrokerError::unauthorized(format!(
                "Worker {} may not {} project {}",
                worker_id, what, project_id
            )));
        }
        Ok(())
    }

    // Tasks

    /// Submit one task on behalf of a worker.
    pub fn submit(&self, worker_id: WorkerId, task: NewTask) -> BrokerResult<TaskId> {
        task.validate()?;
        let project = self.require_project(task.project)?;

        self.require_worker(worker_id)?;
        self.admit(self.limiters.reserve_submit(&project, 1), worker_id, project.id, "submit")?;
        self.authorize(AccessKind::Submit, worker_id, project.id)?;

        Ok(self.db.create_task(&task)?)
    }

    /// Submit a batch of tasks for one project, all or nothing.
    pub fn submit_bulk(&self, worker_id: WorkerId, tasks: Vec<NewTask>) -> BrokerResult<Vec<TaskId>> {
        let Some(first) = tasks.first() else {
            return Err(BrokerError::invalid_spec("requests", "Bulk submit needs at least one task"));
        };
        let project_id = first.project;
        for task in &tasks {
            task.validate()?;
            if task.project != project_id {
                return Err(BrokerError::invalid_spec(
                    "project",
                    "All tasks of a bulk submit must target the same project",
                ));
            }
        }
        let project = self.require_project(project_id)?;

        let n = u32::try_from(tasks.len()).unwrap_or(u32::MAX);
        self.require_worker(worker_id)?;
        self.admit(self.limiters.reserve_submit(&project, n), worker_id, project_id, "submit_bulk")?;
        self.authorize(AccessKind::Submit, worker_id, project_id)?;

        Ok(self.db.create_tasks_bulk(&tasks)?)
    }

    /// Hand the best eligible task of a project to a worker.
    ///
    /// `Ok(None)` means nothing is available right now.
    pub fn assign(&self, worker_id: WorkerId, project_id: ProjectId) -> BrokerResult<Option<AssignedTask>> {
        let project = self.require_project(project_id)?;

        let worker = self.require_worker(worker_id)?;
        if worker.paused {
            warn!(worker_id, project_id, "paused worker asked for a task");
            return Err(BrokerError::unauthorized(format!("Worker {} is paused", worker_id)));
        }
        self.admit(self.limiters.reserve_assign(&project), worker_id, project_id, "assign")?;
        self.authorize(AccessKind::Assign, worker_id, project_id)?;

        let claimed = {
            let _guard = self.assign_lock.lock().unwrap_or_else(PoisonError::into_inner);
            self.db.claim_task(worker_id, project_id, now_secs())?
        };

        let Some(task_id) = claimed else {
            return Ok(None);
        };
        Ok(self.db.get_assigned_task(task_id)?)
    }

    /// Apply a worker's result. Returns whether the task was updated.
    pub fn release(
        &self,
        worker_id: WorkerId,
        task_id: TaskId,
        result: TaskResult,
        verification: i64,
    ) -> BrokerResult<bool> {
        let updated = self.db.release_task(task_id, worker_id, result, verification)?;
        if !updated {
            debug!(task_id, worker_id, ?result, "release did not update the task");
        }
        Ok(updated)
    }

    // Access lifecycle

    pub fn request_access(
        &self,
        worker_id: WorkerId,
        project_id: ProjectId,
        can_assign: bool,
        can_submit: bool,
    ) -> BrokerResult<bool> {
        Ok(self.access.request(&WorkerAccess {
            worker_id,
            project_id,
            can_assign,
            can_submit,
            pending_request: true,
        })?)
    }

    pub fn accept_access(&self, worker_id: WorkerId, project_id: ProjectId) -> BrokerResult<bool> {
        Ok(self.access.accept(worker_id, project_id)?)
    }

    pub fn reject_access(&self, worker_id: WorkerId, project_id: ProjectId) -> BrokerResult<bool> {
        Ok(self.access.reject(worker_id, project_id)?)
    }

    pub fn list_access(&self, project_id: ProjectId) -> BrokerResult<Vec<WorkerAccess>> {
        Ok(self.db.list_access(project_id)?)
    }

    pub fn pending_requests(&self, project_id: ProjectId) -> BrokerResult<Vec<WorkerAccess>> {
        Ok(self.db.pending_requests(project_id)?)
    }

    // Maintenance

    pub fn reset_failed(&self, project_id: ProjectId) -> BrokerResult<u64> {
        self.require_project(project_id)?;
        Ok(self.db.reset_failed(project_id)?)
    }

    pub fn hard_reset(&self, project_id: ProjectId) -> BrokerResult<u64> {
        self.require_project(project_id)?;
        Ok(self.db.hard_reset(project_id)?)
    }

    pub fn reclaim_assigned(&self, project_id: ProjectId) -> BrokerResult<u64> {
        self.require_project(project_id)?;
        Ok(self.db.reclaim_assigned(project_id)?)
    }

    pub fn reclaim_timed_out(&self) -> BrokerResult<u64> {
        Ok(self.db.reclaim_timed_out()?)
    }

    pub fn snapshot(&self, history_secs: i64) -> BrokerResult<SnapshotReport> {
        Ok(self.db.take_snapshots(now_secs(), history_secs)?)
    }

    pub fn snapshots_between(&self, project_id: ProjectId, from: i64, to: i64) -> BrokerResult<Vec<MonitoringSnapshot>> {
        Ok(self.db.snapshots_between(project_id, from, to)?)
    }

    pub fn latest_snapshots(&self, project_id: ProjectId, count: u32) -> BrokerResult<Vec<MonitoringSnapshot>> {
        Ok(self.db.latest_snapshots(project_id, count)?)
    }
}
