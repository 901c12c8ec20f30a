//! Core Task record for one document audit.
//!
//! # Invariants
//! - `id` is unique within a store and never changes
//! - `progress` never decreases while the task is non-terminal
//! - `annotated_path` / `report_path` are written at most once, together with
//!   the transition to `Completed`
//! - a task in an `Error:*` state is never mutated again

use serde::{Deserialize, Deserializer, Serialize, Serializer};
use std::path::PathBuf;
use uuid::Uuid;

/// Unique identifier for a task.
///
/// # Properties
/// - Globally unique within the process
/// - Immutable once created
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(transparent)]
pub struct TaskId(Uuid);

impl TaskId {
    /// Create a new unique task ID.
    pub fn new() -> Self {
        Self(Uuid::new_v4())
    }
}

impl Default for TaskId {
    fn default() -> Self {
        Self::new()
    }
}

impl std::fmt::Display for TaskId {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.0)
    }
}

/// Services the gateway talks to, used to label connectivity failures.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ServiceName {
    Parser,
    RuleEngine,
    Inference,
}

impl ServiceName {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Parser => "parser",
            Self::RuleEngine => "engine",
            Self::Inference => "inference",
        }
    }

    fn from_label(label: &str) -> Option<Self> {
        match label {
            "parser" => Some(Self::Parser),
            "engine" => Some(Self::RuleEngine),
            "inference" => Some(Self::Inference),
            _ => None,
        }
    }
}

impl std::fmt::Display for ServiceName {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Why a task reached a terminal error state.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TaskFailure {
    /// The parser rejected the document.
    Parse,
    /// A service could not be reached (or timed out) at an indispensable stage.
    Connect(ServiceName),
    /// The worker processing the task crashed.
    Internal,
}

/// Status of a task in its lifecycle.
///
/// # State Machine
/// ```text
/// Pending ──► Parsing ──► Auditing ──► Annotating ──► Completed
///    │           │
///    ▼           └──► Error:parse | Error:connect:<service>
/// Queued ──► Parsing
///
/// any non-terminal state ──► Error:internal   (worker crash)
/// ```
///
/// Serialized as the strings polling clients see, e.g. `"Auditing"` or
/// `"Error:connect:parser"`.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TaskStatus {
    /// Accepted, waiting in the dispatch queue
    Pending,
    /// Accepted while the queue was full; enqueued in the background
    Queued,
    Parsing,
    Auditing,
    Annotating,
    Completed,
    Failed(TaskFailure),
}

impl TaskStatus {
    /// Whether this is a final state.
    pub fn is_terminal(&self) -> bool {
        matches!(self, Self::Completed | Self::Failed(_))
    }

    pub fn is_failed(&self) -> bool {
        matches!(self, Self::Failed(_))
    }

    /// Whether the task is still waiting for a worker.
    pub fn is_waiting(&self) -> bool {
        matches!(self, Self::Pending | Self::Queued)
    }
}

impl std::fmt::Display for TaskStatus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Pending => f.write_str("Pending"),
            Self::Queued => f.write_str("Queued"),
            Self::Parsing => f.write_str("Parsing"),
            Self::Auditing => f.write_str("Auditing"),
            Self::Annotating => f.write_str("Annotating"),
            Self::Completed => f.write_str("Completed"),
            Self::Failed(TaskFailure::Parse) => f.write_str("Error:parse"),
            Self::Failed(TaskFailure::Connect(service)) => write!(f, "Error:connect:{}", service),
            Self::Failed(TaskFailure::Internal) => f.write_str("Error:internal"),
        }
    }
}

impl std::str::FromStr for TaskStatus {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "Pending" => Ok(Self::Pending),
            "Queued" => Ok(Self::Queued),
            "Parsing" => Ok(Self::Parsing),
            "Auditing" => Ok(Self::Auditing),
            "Annotating" => Ok(Self::Annotating),
            "Completed" => Ok(Self::Completed),
            "Error:parse" => Ok(Self::Failed(TaskFailure::Parse)),
            "Error:internal" => Ok(Self::Failed(TaskFailure::Internal)),
            other => other
                .strip_prefix("Error:connect:")
                .and_then(ServiceName::from_label)
                .map(|service| Self::Failed(TaskFailure::Connect(service)))
                .ok_or_else(|| format!("unknown task status: {}", other)),
        }
    }
}

impl Serialize for TaskStatus {
    fn serialize<S: Serializer>(&self, serializer: S) -> Result<S::Ok, S::Error> {
        serializer.collect_str(self)
    }
}

impl<'de> Deserialize<'de> for TaskStatus {
    fn deserialize<D: Deserializer<'de>>(deserializer: D) -> Result<Self, D::Error> {
        let raw = String::deserialize(deserializer)?;
        raw.parse().map_err(serde::de::Error::custom)
    }
}

/// One document-audit request and its lifecycle state.
///
/// Owned by the [`TaskStore`](super::TaskStore); callers only ever see clones.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Task {
    pub id: TaskId,
    pub status: TaskStatus,
    /// 0-100
    pub progress: u8,
    pub source_path: PathBuf,
    /// Empty until annotation succeeds
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub annotated_path: Option<PathBuf>,
    /// Empty until the report is written
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub report_path: Option<PathBuf>,
    pub created_at: chrono::DateTime<chrono::Utc>,
}

impl Task {
    /// Create a fresh `Pending` task for a source document.
    pub fn new(source_path: impl Into<PathBuf>) -> Self {
        Self::with_id(TaskId::new(), source_path)
    }

    pub fn with_id(id: TaskId, source_path: impl Into<PathBuf>) -> Self {
        Self {
            id,
            status: TaskStatus::Pending,
            progress: 0,
            source_path: source_path.into(),
            annotated_path: None,
            report_path: None,
            created_at: chrono::Utc::now(),
        }
    }

    /// Move to `status`, raising progress to at least `progress`.
    pub fn advance(&mut self, status: TaskStatus, progress: u8) {
        self.status = status;
        self.progress = self.progress.max(progress.min(100));
    }

    /// Terminal failure. Progress is left where it was.
    pub fn fail(&mut self, failure: TaskFailure) {
        self.status = TaskStatus::Failed(failure);
    }

    /// Terminal success with whatever artifacts were produced.
    pub fn complete(&mut self, annotated_path: Option<PathBuf>, report_path: PathBuf) {
        self.annotated_path = annotated_path;
        self.report_path = Some(report_path);
        self.advance(TaskStatus::Completed, 100);
    }
}
