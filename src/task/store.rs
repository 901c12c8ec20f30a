//! In-memory task store.
//!
//! The only owner of task records. Every read returns a clone and every write
//! goes through [`TaskStore::update`], which applies the caller's mutation
//! under the write lock and then re-establishes the record invariants.

use std::collections::HashMap;
use std::sync::Arc;
use thiserror::Error;
use tokio::sync::RwLock;

use super::task::{Task, TaskId};

#[derive(Debug, Error, PartialEq, Eq)]
pub enum TaskStoreError {
    #[error("Task {0} already exists")]
    DuplicateId(TaskId),

    #[error("Task {0} not found")]
    NotFound(TaskId),
}

#[derive(Debug, Clone, Default)]
pub struct TaskStore {
    tasks: Arc<RwLock<HashMap<TaskId, Task>>>,
}

impl TaskStore {
    pub fn new() -> Self {
        Self::default()
    }

    /// Insert a new task.
    pub async fn create(&self, task: Task) -> Result<(), TaskStoreError> {
        let mut tasks = self.tasks.write().await;
        if tasks.contains_key(&task.id) {
            return Err(TaskStoreError::DuplicateId(task.id));
        }
        tasks.insert(task.id, task);
        Ok(())
    }

    /// Snapshot of a task.
    pub async fn get(&self, id: TaskId) -> Result<Task, TaskStoreError> {
        self.tasks
            .read()
            .await
            .get(&id)
            .cloned()
            .ok_or(TaskStoreError::NotFound(id))
    }

    /// Apply `mutation` to the stored task under the write lock.
    ///
    /// Returns whether the task existed. The mutation must be pure: it runs
    /// while the lock is held. After it runs the store restores the record
    /// invariants:
    /// - a task already in an `Error:*` state is left untouched
    /// - `id`, `source_path` and `created_at` cannot be changed
    /// - progress cannot go down
    /// - artifact paths, once set, cannot be replaced
    pub async fn update<F>(&self, id: TaskId, mutation: F) -> bool
    where
        F: FnOnce(&mut Task),
    {
        let mut tasks = self.tasks.write().await;
        let Some(task) = tasks.get_mut(&id) else {
            return false;
        };

        if task.status.is_failed() {
            tracing::debug!(task_id = %id, status = %task.status, "Ignoring update to failed task");
            return true;
        }

        let before = task.clone();
        mutation(task);

        task.id = before.id;
        task.source_path = before.source_path;
        task.created_at = before.created_at;
        task.progress = task.progress.clamp(before.progress, 100);
        if before.annotated_path.is_some() {
            task.annotated_path = before.annotated_path;
        }
        if before.report_path.is_some() {
            task.report_path = before.report_path;
        }
        true
    }

    /// All tasks, oldest first.
    pub async fn list(&self) -> Vec<Task> {
        let mut tasks: Vec<Task> = self.tasks.read().await.values().cloned().collect();
        tasks.sort_by(|a, b| a.created_at.cmp(&b.created_at));
        tasks
    }

    pub async fn len(&self) -> usize {
        self.tasks.read().await.len()
    }

    pub async fn is_empty(&self) -> bool {
        self.tasks.read().await.is_empty()
    }
}
