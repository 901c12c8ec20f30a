//! Structured audit report and its on-disk form.

use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};
use thiserror::Error;

use crate::services::{Issue, Severity};
use crate::task::TaskId;

#[derive(Debug, Error)]
pub enum ReportError {
    #[error("Report I/O failed: {0}")]
    Io(#[from] std::io::Error),

    #[error("Report is not valid JSON: {0}")]
    Json(#[from] serde_json::Error),
}

/// How an audit branch contributed to the report.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum BranchStatus {
    Ok,
    /// The call failed or timed out; contributed nothing
    Degraded,
    /// The breaker refused the call
    ShortCircuited,
    /// The service is not configured
    Disabled,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct BranchSummary {
    pub rule_engine: BranchStatus,
    pub inference: BranchStatus,
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct IssueCounts {
    pub info: usize,
    pub medium: usize,
    pub critical: usize,
}

impl IssueCounts {
    pub fn tally(issues: &[Issue]) -> Self {
        let mut counts = Self::default();
        for issue in issues {
            match issue.severity {
                Severity::Info => counts.info += 1,
                Severity::Medium => counts.medium += 1,
                Severity::Critical => counts.critical += 1,
            }
        }
        counts
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct AuditReport {
    pub task_id: TaskId,
    pub compliance_score: f64,
    /// Aggregated, ordered by document position
    pub issues: Vec<Issue>,
    pub issue_counts: IssueCounts,
    pub branches: BranchSummary,
    /// Whether an annotated copy of the document was produced
    pub annotated: bool,
    pub generated_at: chrono::DateTime<chrono::Utc>,
}

/// `<dir>/<task_id>-report.json`
pub fn report_path_for(dir: &Path, task_id: TaskId) -> PathBuf {
    dir.join(format!("{}-report.json", task_id))
}

/// Write the report as pretty JSON, replacing any previous file atomically.
pub async fn write_report(path: &Path, report: &AuditReport) -> Result<(), ReportError> {
    if let Some(parent) = path.parent() {
        tokio::fs::create_dir_all(parent).await?;
    }
    let contents = serde_json::to_vec_pretty(report)?;
    let tmp_path = path.with_extension("json.tmp");
    tokio::fs::write(&tmp_path, contents).await?;
    tokio::fs::rename(&tmp_path, path).await?;
    Ok(())
}

pub async fn read_report(path: &Path) -> Result<AuditReport, ReportError> {
    let contents = tokio::fs::read(path).await?;
    Ok(serde_json::from_slice(&contents)?)
}
