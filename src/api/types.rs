//! API request and response types.

use serde::Serialize;
use std::path::PathBuf;

use crate::services::breaker::BreakerSnapshot;
use crate::task::{Task, TaskId, TaskStatus};

/// Response after accepting an upload.
#[derive(Debug, Clone, Serialize)]
pub struct UploadResponse {
    pub task_id: TaskId,
}

/// Returned with 202 while a task has not produced its artifacts yet.
#[derive(Debug, Clone, Serialize)]
pub struct PendingResponse {
    pub task_id: TaskId,
    pub status: TaskStatus,
    pub progress: u8,
}

impl From<&Task> for PendingResponse {
    fn from(task: &Task) -> Self {
        Self {
            task_id: task.id,
            status: task.status,
            progress: task.progress,
        }
    }
}

/// Task entry in the task list.
#[derive(Debug, Clone, Serialize)]
pub struct TaskSummary {
    pub id: TaskId,
    pub status: TaskStatus,
    pub progress: u8,
    pub source_path: PathBuf,
    pub created_at: chrono::DateTime<chrono::Utc>,
}

impl From<Task> for TaskSummary {
    fn from(task: Task) -> Self {
        Self {
            id: task.id,
            status: task.status,
            progress: task.progress,
            source_path: task.source_path,
            created_at: task.created_at,
        }
    }
}

/// Inference branch health: the breaker snapshot, or `"disabled"`.
#[derive(Debug, Clone, Serialize)]
#[serde(untagged)]
pub enum InferenceHealth {
    Breaker(BreakerSnapshot),
    Disabled(&'static str),
}

impl From<Option<BreakerSnapshot>> for InferenceHealth {
    fn from(snapshot: Option<BreakerSnapshot>) -> Self {
        match snapshot {
            Some(snapshot) => Self::Breaker(snapshot),
            None => Self::Disabled("disabled"),
        }
    }
}

/// Health check response.
#[derive(Debug, Clone, Serialize)]
pub struct HealthResponse {
    /// Service status
    pub status: String,

    /// Service version
    pub version: String,

    /// Number of tasks known to this process
    pub tasks: usize,

    pub inference: InferenceHealth,
}
