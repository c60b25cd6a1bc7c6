//! Core types for the task broker.

use crate::error::{BrokerError, BrokerResult};
use serde::{Deserialize, Serialize};
use std::fmt;
use std::str::FromStr;

pub type ProjectId = i64;
pub type WorkerId = i64;
pub type TaskId = i64;

/// Alias reserved for display of tasks without an assignee.
pub const RESERVED_WORKER_ALIAS: &str = "unassigned";

/// A project owning a queue of tasks.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Project {
    pub id: ProjectId,
    pub name: String,
    /// Display only; assignment never looks at it.
    pub priority: i64,
    pub clone_url: String,
    pub repo_identifier: String,
    pub version: String,
    pub motd: String,
    pub public: bool,
    pub hidden: bool,
    pub chain_target_id: Option<ProjectId>,
    pub paused: bool,
    /// Assign reservations refilled per second. Non-positive disables limiting.
    pub assign_rate: f64,
    /// Submit reservations refilled per second. Non-positive disables limiting.
    pub submit_rate: f64,
    #[serde(skip_serializing)]
    pub secret: String,
    #[serde(skip_serializing)]
    pub webhook_secret: String,
    pub created_at: i64,
}

impl Project {
    /// The worker-visible part of the project, embedded in assigned tasks.
    pub fn summary(&self) -> ProjectSummary {
        ProjectSummary {
            id: self.id,
            name: self.name.clone(),
            priority: self.priority,
            clone_url: self.clone_url.clone(),
            repo_identifier: self.repo_identifier.clone(),
            version: self.version.clone(),
            motd: self.motd.clone(),
            public: self.public,
            chain_target_id: self.chain_target_id,
        }
    }
}

/// Project fields handed to workers alongside an assigned task.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ProjectSummary {
    pub id: ProjectId,
    pub name: String,
    pub priority: i64,
    pub clone_url: String,
    pub repo_identifier: String,
    pub version: String,
    pub motd: String,
    pub public: bool,
    pub chain_target_id: Option<ProjectId>,
}

/// Input for creating a project.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct NewProject {
    pub name: String,
    #[serde(default)]
    pub priority: i64,
    #[serde(default)]
    pub clone_url: String,
    #[serde(default)]
    pub repo_identifier: String,
    #[serde(default)]
    pub version: String,
    #[serde(default)]
    pub motd: String,
    #[serde(default)]
    pub public: bool,
    #[serde(default)]
    pub hidden: bool,
    #[serde(default)]
    pub chain_target_id: Option<ProjectId>,
    #[serde(default)]
    pub assign_rate: f64,
    #[serde(default)]
    pub submit_rate: f64,
    /// Generated when absent.
    #[serde(default)]
    pub secret: Option<String>,
    /// Generated when absent.
    #[serde(default)]
    pub webhook_secret: Option<String>,
}

/// Replacement values for a project update. Secrets are left untouched.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct ProjectUpdate {
    pub name: String,
    #[serde(default)]
    pub priority: i64,
    #[serde(default)]
    pub clone_url: String,
    #[serde(default)]
    pub repo_identifier: String,
    #[serde(default)]
    pub version: String,
    #[serde(default)]
    pub motd: String,
    #[serde(default)]
    pub public: bool,
    #[serde(default)]
    pub hidden: bool,
    #[serde(default)]
    pub chain_target_id: Option<ProjectId>,
    #[serde(default)]
    pub paused: bool,
    #[serde(default)]
    pub assign_rate: f64,
    #[serde(default)]
    pub submit_rate: f64,
}

/// Shared field checks for project create and update.
pub(crate) fn validate_project_fields(
    name: &str,
    priority: i64,
    public: bool,
    hidden: bool,
    assign_rate: f64,
    submit_rate: f64,
) -> BrokerResult<()> {
    if name.trim().is_empty() {
        return Err(BrokerError::invalid_spec("name", "Project name cannot be empty"));
    }
    if priority < 0 {
        return Err(BrokerError::invalid_spec(
            "priority",
            "Project priority must be >= 0",
        ));
    }
    if public && hidden {
        return Err(BrokerError::invalid_spec(
            "hidden",
            "A hidden project cannot be public",
        ));
    }
    for (field, rate) in [("assign_rate", assign_rate), ("submit_rate", submit_rate)] {
        if rate.is_nan() || rate < 0.0 {
            return Err(BrokerError::invalid_spec(field, "Rates must be >= 0 (0 = unlimited)"));
        }
    }
    Ok(())
}

/// A worker pulling tasks.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Worker {
    pub id: WorkerId,
    pub created_at: i64,
    pub alias: Option<String>,
    #[serde(skip_serializing)]
    pub secret: String,
    pub paused: bool,
}

/// Access row for a (worker, project) pair.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct WorkerAccess {
    pub worker_id: WorkerId,
    pub project_id: ProjectId,
    pub can_assign: bool,
    pub can_submit: bool,
    /// Requested but not yet accepted; grants nothing while set.
    pub pending_request: bool,
}

/// Which access flag an operation needs.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum AccessKind {
    Assign,
    Submit,
}

/// Task lifecycle state.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum TaskStatus {
    /// Open: assignable when no assignee is set.
    New,
    /// Retries exhausted; waits for a manual reset.
    Failed,
    /// Terminal.
    Closed,
}

impl TaskStatus {
    pub fn as_str(self) -> &'static str {
        match self {
            TaskStatus::New => "new",
            TaskStatus::Failed => "failed",
            TaskStatus::Closed => "closed",
        }
    }
}

impl fmt::Display for TaskStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for TaskStatus {
    type Err = anyhow::Error;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "new" => Ok(TaskStatus::New),
            "failed" => Ok(TaskStatus::Failed),
            "closed" => Ok(TaskStatus::Closed),
            other => Err(anyhow::anyhow!("Unknown task status: {}", other)),
        }
    }
}

/// Outcome reported by a worker when releasing a task.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum TaskResult {
    Ok,
    Fail,
    Skip,
}

/// A stored task.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Task {
    pub id: TaskId,
    pub project_id: ProjectId,
    pub assignee: Option<WorkerId>,
    pub retries: i64,
    pub max_retries: i64,
    pub status: TaskStatus,
    pub recipe: String,
    pub priority: i64,
    /// Seconds the task may stay assigned before it is reclaimed.
    pub max_assign_time: i64,
    /// Epoch seconds of the current assignment.
    pub assign_time: Option<i64>,
    /// 0 = no quorum; N > 0 = N workers must report the same verification.
    pub verification_count: i64,
    pub hash64: Option<i64>,
    pub unique_string: Option<String>,
}

/// A task handed to a worker, with the project it belongs to.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct AssignedTask {
    #[serde(flatten)]
    pub task: Task,
    pub project: ProjectSummary,
}

/// Per-project deduplication key.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum DedupKey {
    Hash64(i64),
    UniqueString(String),
}

/// Submission payload for a single task.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct NewTask {
    pub project: ProjectId,
    #[serde(default)]
    pub max_retries: i64,
    pub recipe: String,
    #[serde(default)]
    pub priority: i64,
    #[serde(default)]
    pub max_assign_time: i64,
    #[serde(default, alias = "hash_u64")]
    pub hash64: Option<i64>,
    #[serde(default)]
    pub unique_string: Option<String>,
    #[serde(default)]
    pub verification_count: i64,
}

impl NewTask {
    pub fn new(project: ProjectId, recipe: impl Into<String>) -> Self {
        Self {
            project,
            recipe: recipe.into(),
            ..Default::default()
        }
    }

    pub fn with_priority(mut self, priority: i64) -> Self {
        self.priority = priority;
        self
    }

    pub fn with_max_retries(mut self, max_retries: i64) -> Self {
        self.max_retries = max_retries;
        self
    }

    pub fn with_max_assign_time(mut self, seconds: i64) -> Self {
        self.max_assign_time = seconds;
        self
    }

    pub fn with_verification_count(mut self, count: i64) -> Self {
        self.verification_count = count;
        self
    }

    pub fn with_hash64(mut self, hash: i64) -> Self {
        self.hash64 = Some(hash);
        self
    }

    pub fn with_unique_string(mut self, key: impl Into<String>) -> Self {
        self.unique_string = Some(key.into());
        self
    }

    /// Check field constraints. Does not touch storage.
    pub fn validate(&self) -> BrokerResult<()> {
        if self.project == 0 {
            return Err(BrokerError::invalid_spec("project", "project is required"));
        }
        if self.max_retries < 0 {
            return Err(BrokerError::invalid_spec(
                "max_retries",
                "max_retries must be >= 0",
            ));
        }
        if self.recipe.is_empty() {
            return Err(BrokerError::invalid_spec("recipe", "recipe cannot be empty"));
        }
        if self.max_assign_time < 0 {
            return Err(BrokerError::invalid_spec(
                "max_assign_time",
                "max_assign_time must be >= 0",
            ));
        }
        if self.verification_count < 0 {
            return Err(BrokerError::invalid_spec(
                "verification_count",
                "verification_count must be >= 0",
            ));
        }
        self.dedup_key().map(|_| ())
    }

    /// The dedup key, if any. Setting both kinds is rejected.
    pub fn dedup_key(&self) -> BrokerResult<Option<DedupKey>> {
        let unique = self.unique_string.as_deref().filter(|s| !s.is_empty());
        match (self.hash64, unique) {
            (Some(_), Some(_)) => Err(BrokerError::invalid_spec(
                "unique_string",
                "hash64 and unique_string are mutually exclusive",
            )),
            (Some(hash), None) => Ok(Some(DedupKey::Hash64(hash))),
            (None, Some(s)) => Ok(Some(DedupKey::UniqueString(s.to_string()))),
            (None, None) => Ok(None),
        }
    }
}

/// Per-project task counters.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct ProjectStats {
    pub project_id: ProjectId,
    pub new_task_count: i64,
    pub failed_task_count: i64,
    pub closed_task_count: i64,
    pub assignees: Vec<AssigneeCount>,
}

/// Number of tasks currently held by one worker.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct AssigneeCount {
    pub worker_id: WorkerId,
    pub task_count: i64,
}

/// Point-in-time counters recorded by the monitoring job.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct MonitoringSnapshot {
    pub project_id: ProjectId,
    pub new_task_count: i64,
    pub failed_task_count: i64,
    pub closed_task_count: i64,
    pub worker_access_count: i64,
    pub awaiting_verification_count: i64,
    pub timestamp: i64,
}
