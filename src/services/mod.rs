//! Analysis service abstractions.
//!
//! The gateway never parses documents, evaluates rules, or runs inference
//! itself. It talks to three collaborators through the capability traits in
//! this module:
//!
//! - [`DocumentParser`]: document structure extraction and comment injection
//! - [`RuleEngine`]: deterministic formatting / integrity rules
//! - [`InferenceService`]: semantic analysis (slow, least reliable)
//!
//! Transports live in [`http`]; [`breaker`] wraps the inference client.

pub mod breaker;
pub mod http;
#[cfg(test)]
pub(crate) mod testing;

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::future::Future;
use std::path::{Path, PathBuf};
use std::time::Duration;
use thiserror::Error;

pub use crate::task::ServiceName;

/// Identifier of a section, unique within one document and stable across stages.
pub type SectionId = u32;

/// Structural kind of a section.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum ElementType {
    Heading { level: u8 },
    Paragraph,
    Table,
    Equation,
}

/// A structural unit of a parsed document.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Section {
    pub id: SectionId,
    pub element_type: ElementType,
    pub raw_text: String,
    /// Open-ended style properties (font-size, line-height, ...)
    #[serde(default)]
    pub props: BTreeMap<String, String>,
}

/// Document-level metadata.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct DocumentMetadata {
    #[serde(default)]
    pub title: String,
    /// Global style attributes
    #[serde(default)]
    pub styles: BTreeMap<String, String>,
}

/// Output of [`DocumentParser::parse`]. Immutable once produced.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ParsedData {
    pub doc_id: String,
    #[serde(default)]
    pub metadata: DocumentMetadata,
    pub sections: Vec<Section>,
}

/// Issue severity. Ordered `Info < Medium < Critical`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(rename_all = "UPPERCASE")]
pub enum Severity {
    #[serde(alias = "LOW")]
    Info,
    Medium,
    #[serde(alias = "HIGH")]
    Critical,
}

/// Numeric protocol levels: 1 = low, 2 = medium, 3 = high.
impl TryFrom<u8> for Severity {
    type Error = String;

    fn try_from(level: u8) -> Result<Self, Self::Error> {
        match level {
            1 => Ok(Self::Info),
            2 => Ok(Self::Medium),
            3 => Ok(Self::Critical),
            other => Err(format!("unknown severity level {}", other)),
        }
    }
}

/// Which service reported an issue.
///
/// Declaration order is the merge preference: rule engine findings win ties.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum IssueSource {
    RuleEngine,
    Inference,
}

/// A single finding attributed to a section.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Issue {
    pub section_id: SectionId,
    /// Stable identifier, e.g. `ERR_FONT_001`
    pub code: String,
    pub message: String,
    pub severity: Severity,
    #[serde(default)]
    pub score_impact: f64,
    pub source: IssueSource,
}

impl Issue {
    pub fn new(
        section_id: SectionId,
        code: impl Into<String>,
        message: impl Into<String>,
        severity: Severity,
        source: IssueSource,
    ) -> Self {
        Self {
            section_id,
            code: code.into(),
            message: message.into(),
            severity,
            score_impact: 0.0,
            source,
        }
    }
}

/// Result of one audit branch.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct AuditOutcome {
    pub issues: Vec<Issue>,
    pub score_impact: f64,
}

impl AuditOutcome {
    pub fn empty() -> Self {
        Self::default()
    }
}

/// Error from a service call.
#[derive(Debug, Error)]
pub enum ServiceError {
    #[error("Cannot reach {service}: {message}")]
    Connect {
        service: ServiceName,
        message: String,
    },

    #[error("{service} did not answer within {after:?}")]
    Timeout {
        service: ServiceName,
        after: Duration,
    },

    #[error("Parse failed: {0}")]
    Parse(String),

    #[error("Rule audit failed: {0}")]
    Audit(String),

    #[error("Semantic analysis failed: {0}")]
    Inference(String),

    #[error("Annotation failed: {0}")]
    Annotate(String),

    #[error("Inference short-circuited: breaker is open")]
    ShortCircuited,

    #[error("Invalid response from {service}: {message}")]
    InvalidResponse {
        service: ServiceName,
        message: String,
    },
}

impl ServiceError {
    /// `Connect` and `Timeout` are treated the same by the pipeline.
    pub fn is_connectivity(&self) -> bool {
        matches!(self, Self::Connect { .. } | Self::Timeout { .. })
    }
}

#[async_trait]
pub trait DocumentParser: Send + Sync {
    /// Extract document structure.
    async fn parse(&self, path: &Path) -> Result<ParsedData, ServiceError>;

    /// Write a copy of the document with `issues` injected as comments.
    /// Returns the annotated copy's path.
    async fn annotate(&self, path: &Path, issues: &[Issue]) -> Result<PathBuf, ServiceError>;
}

#[async_trait]
pub trait RuleEngine: Send + Sync {
    async fn audit_rules(&self, parsed: &ParsedData) -> Result<AuditOutcome, ServiceError>;
}

#[async_trait]
pub trait InferenceService: Send + Sync {
    async fn analyze_semantics(&self, sections: &[Section]) -> Result<AuditOutcome, ServiceError>;
}

/// Run a service call under a deadline.
///
/// When the deadline passes the call future is dropped, which closes its
/// connection, and `ServiceError::Timeout` is returned.
pub async fn with_deadline<T, F>(
    service: ServiceName,
    deadline: Duration,
    call: F,
) -> Result<T, ServiceError>
where
    F: Future<Output = Result<T, ServiceError>>,
{
    match tokio::time::timeout(deadline, call).await {
        Ok(result) => result,
        Err(_) => Err(ServiceError::Timeout {
            service,
            after: deadline,
        }),
    }
}
