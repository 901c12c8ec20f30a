//! Audit results: merging findings, scoring, and the report artifact.

pub mod aggregate;
pub mod report;
pub mod score;

pub use aggregate::aggregate_issues;
pub use report::{AuditReport, BranchStatus, BranchSummary, IssueCounts, ReportError};
pub use score::compliance_score;
