//! JSON-over-HTTP clients for the analysis services.
//!
//! Each service exposes one POST endpoint per call. Transport-level failures
//! are classified as `Connect` / `Timeout`; everything else maps to the
//! call's own error so the pipeline can tell "service down" from "service
//! rejected the document".

use async_trait::async_trait;
use serde::de::DeserializeOwned;
use serde::{Deserialize, Deserializer, Serialize};
use serde_json::json;
use std::path::{Path, PathBuf};
use std::time::Duration;

use super::{
    AuditOutcome, DocumentParser, InferenceService, Issue, IssueSource, ParsedData, RuleEngine,
    Section, SectionId, ServiceError, ServiceName, Severity,
};

/// Author recorded on injected comments.
const COMMENT_AUTHOR: &str = "doc-auditor";

/// Connection establishment limit; overall call deadlines are applied by the caller.
const CONNECT_TIMEOUT: Duration = Duration::from_secs(5);

/// Shared plumbing: base URL handling and response classification.
#[derive(Clone)]
struct ServiceClient {
    service: ServiceName,
    base_url: String,
    client: reqwest::Client,
}

impl ServiceClient {
    fn new(service: ServiceName, base_url: impl Into<String>) -> Self {
        let mut base_url = base_url.into();
        while base_url.ends_with('/') {
            base_url.pop();
        }
        let client = reqwest::Client::builder()
            .connect_timeout(CONNECT_TIMEOUT)
            .build()
            .unwrap_or_else(|e| {
                tracing::warn!("Failed to build HTTP client for {}: {}", service, e);
                reqwest::Client::new()
            });
        Self {
            service,
            base_url,
            client,
        }
    }

    fn url(&self, path: &str) -> String {
        format!("{}/{}", self.base_url, path.trim_start_matches('/'))
    }

    /// POST `body` and decode the JSON response.
    ///
    /// Non-2xx statuses are reported through `on_status`, which builds the
    /// call-specific error.
    async fn post<B, R>(
        &self,
        path: &str,
        body: &B,
        on_status: fn(String) -> ServiceError,
    ) -> Result<R, ServiceError>
    where
        B: Serialize + ?Sized,
        R: DeserializeOwned,
    {
        let url = self.url(path);
        let resp = self
            .client
            .post(&url)
            .json(body)
            .send()
            .await
            .map_err(|e| self.transport_error(e))?;

        let status = resp.status();
        let text = resp.text().await.map_err(|e| self.transport_error(e))?;
        if !status.is_success() {
            return Err(on_status(format!("{} - {}", status, text)));
        }

        serde_json::from_str(&text).map_err(|e| ServiceError::InvalidResponse {
            service: self.service,
            message: format!("{}: {}", e, text),
        })
    }

    fn transport_error(&self, error: reqwest::Error) -> ServiceError {
        if error.is_timeout() {
            ServiceError::Timeout {
                service: self.service,
                after: CONNECT_TIMEOUT,
            }
        } else if error.is_connect() || error.is_request() {
            ServiceError::Connect {
                service: self.service,
                message: error.to_string(),
            }
        } else {
            ServiceError::InvalidResponse {
                service: self.service,
                message: error.to_string(),
            }
        }
    }
}

/// Issue as sent by the rule engine and inference services.
#[derive(Debug, Deserialize)]
struct WireIssue {
    section_id: SectionId,
    code: String,
    #[serde(default)]
    message: String,
    #[serde(deserialize_with = "severity_label_or_level")]
    severity: Severity,
    #[serde(default)]
    score_impact: f64,
}

/// Severity as a label (`"HIGH"`, `"CRITICAL"`, ...) or a protocol level (1-3).
fn severity_label_or_level<'de, D>(deserializer: D) -> Result<Severity, D::Error>
where
    D: Deserializer<'de>,
{
    #[derive(Deserialize)]
    #[serde(untagged)]
    enum WireSeverity {
        Level(u8),
        Label(Severity),
    }

    match WireSeverity::deserialize(deserializer)? {
        WireSeverity::Level(level) => Severity::try_from(level).map_err(serde::de::Error::custom),
        WireSeverity::Label(severity) => Ok(severity),
    }
}

impl WireIssue {
    fn into_issue(self, source: IssueSource) -> Issue {
        Issue {
            section_id: self.section_id,
            code: self.code,
            message: self.message,
            severity: self.severity,
            score_impact: self.score_impact,
            source,
        }
    }
}

#[derive(Debug, Deserialize)]
struct WireAuditResponse {
    #[serde(default)]
    issues: Vec<WireIssue>,
    #[serde(default)]
    score_impact: f64,
}

impl WireAuditResponse {
    fn into_outcome(self, source: IssueSource) -> AuditOutcome {
        AuditOutcome {
            issues: self
                .issues
                .into_iter()
                .map(|issue| issue.into_issue(source))
                .collect(),
            score_impact: self.score_impact,
        }
    }
}

#[derive(Debug, Deserialize)]
struct ParseResponse {
    success: bool,
    #[serde(default)]
    error_message: String,
    parsed_data: Option<ParsedData>,
}

#[derive(Debug, Serialize)]
struct Comment<'a> {
    section_id: SectionId,
    text: String,
    code: &'a str,
}

#[derive(Debug, Deserialize)]
struct AnnotateResponse {
    success: bool,
    #[serde(default)]
    error_message: String,
    #[serde(default)]
    output_file_path: String,
}

/// Where the annotated copy of `source` is written: `<stem>-annotated.<ext>`.
pub fn annotated_path_for(source: &Path) -> PathBuf {
    let stem = source
        .file_stem()
        .map(|s| s.to_string_lossy().to_string())
        .unwrap_or_else(|| "document".to_string());
    let file_name = match source.extension() {
        Some(ext) => format!("{}-annotated.{}", stem, ext.to_string_lossy()),
        None => format!("{}-annotated", stem),
    };
    source.with_file_name(file_name)
}

fn comment_text(issue: &Issue) -> String {
    format!("[{:?}] {}: {}", issue.severity, issue.code, issue.message)
}

/// Parser service client.
#[derive(Clone)]
pub struct HttpParser {
    inner: ServiceClient,
}

impl HttpParser {
    pub fn new(base_url: impl Into<String>) -> Self {
        Self {
            inner: ServiceClient::new(ServiceName::Parser, base_url),
        }
    }
}

#[async_trait]
impl DocumentParser for HttpParser {
    async fn parse(&self, path: &Path) -> Result<ParsedData, ServiceError> {
        let body = json!({ "file_path": path.to_string_lossy() });
        let resp: ParseResponse = self.inner.post("parse", &body, ServiceError::Parse).await?;
        if !resp.success {
            return Err(ServiceError::Parse(resp.error_message));
        }
        resp.parsed_data.ok_or_else(|| ServiceError::InvalidResponse {
            service: ServiceName::Parser,
            message: "success without parsed_data".to_string(),
        })
    }

    async fn annotate(&self, path: &Path, issues: &[Issue]) -> Result<PathBuf, ServiceError> {
        let output = annotated_path_for(path);
        let comments: Vec<Comment<'_>> = issues
            .iter()
            .map(|issue| Comment {
                section_id: issue.section_id,
                text: comment_text(issue),
                code: &issue.code,
            })
            .collect();
        let body = json!({
            "input_file_path": path.to_string_lossy(),
            "output_file_path": output.to_string_lossy(),
            "author": COMMENT_AUTHOR,
            "comments": comments,
        });
        let resp: AnnotateResponse = self
            .inner
            .post("annotate", &body, ServiceError::Annotate)
            .await?;
        if !resp.success {
            return Err(ServiceError::Annotate(resp.error_message));
        }
        if resp.output_file_path.is_empty() {
            Ok(output)
        } else {
            Ok(PathBuf::from(resp.output_file_path))
        }
    }
}

/// Rule engine client.
#[derive(Clone)]
pub struct HttpRuleEngine {
    inner: ServiceClient,
}

impl HttpRuleEngine {
    pub fn new(base_url: impl Into<String>) -> Self {
        Self {
            inner: ServiceClient::new(ServiceName::RuleEngine, base_url),
        }
    }
}

#[async_trait]
impl RuleEngine for HttpRuleEngine {
    async fn audit_rules(&self, parsed: &ParsedData) -> Result<AuditOutcome, ServiceError> {
        let body = json!({ "data": parsed });
        let resp: WireAuditResponse = self.inner.post("audit", &body, ServiceError::Audit).await?;
        Ok(resp.into_outcome(IssueSource::RuleEngine))
    }
}

/// Inference service client. Wrap it in a
/// [`GuardedInference`](super::breaker::GuardedInference) before use.
#[derive(Clone)]
pub struct HttpInference {
    inner: ServiceClient,
}

impl HttpInference {
    pub fn new(base_url: impl Into<String>) -> Self {
        Self {
            inner: ServiceClient::new(ServiceName::Inference, base_url),
        }
    }
}

#[async_trait]
impl InferenceService for HttpInference {
    async fn analyze_semantics(&self, sections: &[Section]) -> Result<AuditOutcome, ServiceError> {
        let body = json!({ "sections": sections });
        let resp: WireAuditResponse = self
            .inner
            .post("semantics", &body, ServiceError::Inference)
            .await?;
        Ok(resp.into_outcome(IssueSource::Inference))
    }
}
