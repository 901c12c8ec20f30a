//! Audit engine: the operations exposed to the intake layer.
//!
//! - `submit(source_path) -> TaskId`
//! - `status(id) -> Task`
//! - `report(id) -> AuditReport | not ready`
//! - `artifacts(id) -> annotated / report paths`

use serde::Serialize;
use std::path::PathBuf;
use std::sync::Arc;
use thiserror::Error;
use tokio::task::JoinHandle;

use crate::audit::report::read_report;
use crate::audit::{AuditReport, ReportError};
use crate::config::Config;
use crate::queue::{fail_if_unfinished, spawn_workers, DispatchQueue, Enqueued};
use crate::services::breaker::{BreakerSnapshot, CircuitBreaker, GuardedInference};
use crate::services::http::{HttpInference, HttpParser, HttpRuleEngine};
use crate::services::InferenceService;
use crate::task::{Task, TaskId, TaskStatus, TaskStore, TaskStoreError};
use crate::worker::{Orchestrator, Services};

#[derive(Debug, Error)]
pub enum EngineError {
    #[error(transparent)]
    Store(#[from] TaskStoreError),

    #[error("Task {0} was not accepted: no workers are running")]
    QueueClosed(TaskId),

    #[error("Report for task {id} is unavailable: {source}")]
    Report {
        id: TaskId,
        #[source]
        source: ReportError,
    },
}

impl EngineError {
    pub fn is_not_found(&self) -> bool {
        matches!(self, Self::Store(TaskStoreError::NotFound(_)))
    }
}

/// Answer to a report request.
#[derive(Debug, Clone)]
pub enum ReportLookup {
    Ready(AuditReport),
    /// The task has not completed (or failed); carries its current status.
    NotReady(TaskStatus),
}

/// Files produced for a task.
#[derive(Debug, Clone, Serialize)]
pub struct Artifacts {
    pub task_id: TaskId,
    pub status: TaskStatus,
    pub annotated_path: Option<PathBuf>,
    pub report_path: Option<PathBuf>,
}

pub struct AuditEngine {
    store: TaskStore,
    queue: DispatchQueue,
    breaker: Option<Arc<CircuitBreaker>>,
    workers: Vec<JoinHandle<()>>,
}

impl AuditEngine {
    /// Build the HTTP service clients from `config` and start the workers.
    ///
    /// The inference client and its breaker are only constructed when
    /// `config.inference_enabled` is set.
    pub fn from_config(config: &Config) -> Self {
        let breaker = config
            .inference_enabled
            .then(|| Arc::new(CircuitBreaker::new(config.breaker.clone())));
        let inference = breaker.as_ref().map(|breaker| {
            let client: Arc<dyn InferenceService> =
                Arc::new(HttpInference::new(config.services.inference.clone()));
            Arc::new(GuardedInference::new(
                client,
                Arc::clone(breaker),
                config.timeouts.audit_call,
            )) as Arc<dyn InferenceService>
        });
        if inference.is_none() {
            tracing::info!("Semantic analysis disabled (INFERENCE_ENABLED=false)");
        }

        let services = Services {
            parser: Arc::new(HttpParser::new(config.services.parser.clone())),
            rule_engine: Arc::new(HttpRuleEngine::new(config.services.rule_engine.clone())),
            inference,
        };
        Self::start(config, services, breaker)
    }

    /// Start the engine with explicit services.
    pub fn start(
        config: &Config,
        services: Services,
        breaker: Option<Arc<CircuitBreaker>>,
    ) -> Self {
        let store = TaskStore::new();
        let orchestrator = Orchestrator::new(
            store.clone(),
            services,
            config.timeouts.clone(),
            config.scoring,
            config.docs_dir.clone(),
        );
        let (queue, rx) = DispatchQueue::new(config.queue_capacity, store.clone());
        let workers = spawn_workers(config.workers, rx, orchestrator);
        tracing::info!(
            workers = config.workers,
            queue_capacity = config.queue_capacity,
            "Audit engine started"
        );
        Self {
            store,
            queue,
            breaker,
            workers,
        }
    }

    /// Register a new task for `source_path` and enqueue it.
    pub async fn submit(&self, source_path: impl Into<PathBuf>) -> Result<TaskId, EngineError> {
        self.submit_as(TaskId::new(), source_path).await
    }

    /// Like [`submit`](Self::submit) with a caller-chosen id, for intake
    /// paths that name the stored upload after the task.
    pub async fn submit_as(
        &self,
        id: TaskId,
        source_path: impl Into<PathBuf>,
    ) -> Result<TaskId, EngineError> {
        self.store.create(Task::with_id(id, source_path)).await?;
        if self.queue.enqueue(id).await == Enqueued::Rejected {
            fail_if_unfinished(&self.store, id).await;
            return Err(EngineError::QueueClosed(id));
        }
        tracing::info!(task_id = %id, "Task submitted");
        Ok(id)
    }

    pub async fn status(&self, id: TaskId) -> Result<Task, EngineError> {
        Ok(self.store.get(id).await?)
    }

    pub async fn report(&self, id: TaskId) -> Result<ReportLookup, EngineError> {
        let task = self.store.get(id).await?;
        match (task.status, task.report_path) {
            (TaskStatus::Completed, Some(path)) => read_report(&path)
                .await
                .map(ReportLookup::Ready)
                .map_err(|source| EngineError::Report { id, source }),
            (status, _) => Ok(ReportLookup::NotReady(status)),
        }
    }

    pub async fn artifacts(&self, id: TaskId) -> Result<Artifacts, EngineError> {
        let task = self.store.get(id).await?;
        Ok(Artifacts {
            task_id: task.id,
            status: task.status,
            annotated_path: task.annotated_path,
            report_path: task.report_path,
        })
    }

    /// Inference breaker state, or `None` when inference is disabled.
    pub fn breaker_snapshot(&self) -> Option<BreakerSnapshot> {
        self.breaker.as_ref().map(|breaker| breaker.snapshot())
    }

    pub fn store(&self) -> &TaskStore {
        &self.store
    }

    /// Stop accepting work and wait for the workers to drain the queue.
    pub async fn shutdown(self) {
        drop(self.queue);
        for worker in self.workers {
            if let Err(e) = worker.await {
                tracing::error!("Worker ended abnormally: {}", e);
            }
        }
        tracing::info!("Audit engine stopped");
    }
}
