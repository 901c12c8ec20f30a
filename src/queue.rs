//! Dispatch queue feeding task ids to a fixed pool of workers.
//!
//! Intake never blocks: when the bounded queue is full the task is marked
//! `Queued` and a background task waits for room.

use std::sync::Arc;
use tokio::sync::{mpsc, Mutex};
use tokio::task::JoinHandle;

use crate::task::{TaskFailure, TaskId, TaskStatus, TaskStore};
use crate::worker::Orchestrator;

/// How an id entered the queue.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Enqueued {
    /// Went straight into the queue
    Immediate,
    /// Queue was full; delivery continues in the background
    Deferred,
    /// Workers are gone; the task will not run
    Rejected,
}

#[derive(Debug, Clone)]
pub struct DispatchQueue {
    tx: mpsc::Sender<TaskId>,
    store: TaskStore,
}

impl DispatchQueue {
    /// Create a queue and the receiving end for [`spawn_workers`].
    pub fn new(capacity: usize, store: TaskStore) -> (Self, mpsc::Receiver<TaskId>) {
        let (tx, rx) = mpsc::channel(capacity.max(1));
        (Self { tx, store }, rx)
    }

    /// Hand a task id to the workers without waiting.
    pub async fn enqueue(&self, id: TaskId) -> Enqueued {
        match self.tx.try_send(id) {
            Ok(()) => Enqueued::Immediate,
            Err(mpsc::error::TrySendError::Full(id)) => {
                self.store
                    .update(id, |t| {
                        if t.status == TaskStatus::Pending {
                            t.status = TaskStatus::Queued;
                        }
                    })
                    .await;
                tracing::info!(task_id = %id, "Dispatch queue full, task queued for background delivery");
                let tx = self.tx.clone();
                let store = self.store.clone();
                tokio::spawn(async move {
                    if tx.send(id).await.is_err() {
                        tracing::warn!(task_id = %id, "Dispatch queue closed before task was delivered");
                        fail_if_unfinished(&store, id).await;
                    }
                });
                Enqueued::Deferred
            }
            Err(mpsc::error::TrySendError::Closed(id)) => {
                tracing::warn!(task_id = %id, "Dispatch queue closed, task will not run");
                Enqueued::Rejected
            }
        }
    }
}

/// Mark a task that will never finish as `Error:internal`.
pub(crate) async fn fail_if_unfinished(store: &TaskStore, id: TaskId) {
    store
        .update(id, |t| {
            if !t.status.is_terminal() {
                t.fail(TaskFailure::Internal);
            }
        })
        .await;
}

/// Start `count` workers that share one receiver.
///
/// Each worker takes one task at a time and runs it to completion in its own
/// tokio task, so a panicking pipeline fails that task and the worker keeps
/// going. Workers exit once every sender is dropped and the queue is drained.
pub fn spawn_workers(
    count: usize,
    rx: mpsc::Receiver<TaskId>,
    orchestrator: Orchestrator,
) -> Vec<JoinHandle<()>> {
    let rx = Arc::new(Mutex::new(rx));
    (0..count.max(1))
        .map(|worker| {
            let rx = Arc::clone(&rx);
            let orchestrator = orchestrator.clone();
            tokio::spawn(async move {
                loop {
                    let next = rx.lock().await.recv().await;
                    let Some(id) = next else {
                        break;
                    };
                    tracing::debug!(worker, task_id = %id, "Worker picked up task");
                    let run = {
                        let orchestrator = orchestrator.clone();
                        tokio::spawn(async move { orchestrator.run(id).await })
                    };
                    if let Err(e) = run.await {
                        tracing::error!(worker, task_id = %id, "Task run aborted: {}", e);
                        fail_if_unfinished(orchestrator.store(), id).await;
                    }
                }
                tracing::debug!(worker, "Worker stopped");
            })
        })
        .collect()
}
