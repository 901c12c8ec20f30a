//! Scripted service fakes for pipeline tests.

use async_trait::async_trait;
use std::collections::VecDeque;
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Mutex;
use std::time::Duration;

use super::{
    AuditOutcome, DocumentMetadata, DocumentParser, ElementType, InferenceService, Issue,
    IssueSource, ParsedData, RuleEngine, Section, ServiceError, ServiceName, Severity,
};

/// What a fake does on one call. The last script repeats once the rest are used.
#[derive(Clone)]
pub(crate) enum Script<T> {
    Ok(T),
    Fail(fn() -> ServiceError),
    /// Never answers
    Hang,
    /// Answers after a delay
    Delay(Duration, T),
    /// Panics inside the call
    Panic,
}

struct Scripted<T> {
    scripts: Mutex<VecDeque<Script<T>>>,
    calls: AtomicUsize,
}

impl<T: Clone> Scripted<T> {
    fn new(scripts: Vec<Script<T>>) -> Self {
        Self {
            scripts: Mutex::new(scripts.into()),
            calls: AtomicUsize::new(0),
        }
    }

    async fn next(&self) -> Result<T, ServiceError> {
        self.calls.fetch_add(1, Ordering::SeqCst);
        let script = {
            let mut scripts = self.scripts.lock().unwrap();
            if scripts.len() > 1 {
                scripts.pop_front()
            } else {
                scripts.front().cloned()
            }
        };
        match script {
            Some(Script::Ok(value)) => Ok(value),
            Some(Script::Fail(make)) => Err(make()),
            Some(Script::Hang) => std::future::pending().await,
            Some(Script::Delay(delay, value)) => {
                tokio::time::sleep(delay).await;
                Ok(value)
            }
            Some(Script::Panic) => panic!("scripted service panic"),
            None => panic!("fake called without a script"),
        }
    }

    fn calls(&self) -> usize {
        self.calls.load(Ordering::SeqCst)
    }
}

pub(crate) struct ScriptedParser {
    parse: Scripted<ParsedData>,
    annotate: Scripted<PathBuf>,
    annotated_with: Mutex<Vec<Vec<Issue>>>,
}

impl ScriptedParser {
    pub fn new(parse: Vec<Script<ParsedData>>, annotate: Vec<Script<PathBuf>>) -> Self {
        Self {
            parse: Scripted::new(parse),
            annotate: Scripted::new(annotate),
            annotated_with: Mutex::new(Vec::new()),
        }
    }

    /// Parser that always succeeds with `sample_document()`; the annotated path is never created.
    pub fn healthy() -> Self {
        Self::new(
            vec![Script::Ok(sample_document())],
            vec![Script::Ok(PathBuf::from("/nonexistent/annotated.docx"))],
        )
    }

    pub fn unreachable() -> Self {
        Self::new(vec![Script::Fail(parser_unreachable)], vec![Script::Hang])
    }

    pub fn parse_calls(&self) -> usize {
        self.parse.calls()
    }

    pub fn annotate_calls(&self) -> usize {
        self.annotate.calls()
    }

    /// Issue lists passed to `annotate`, in call order.
    pub fn annotated_with(&self) -> Vec<Vec<Issue>> {
        self.annotated_with.lock().unwrap().clone()
    }
}

#[async_trait]
impl DocumentParser for ScriptedParser {
    async fn parse(&self, _path: &Path) -> Result<ParsedData, ServiceError> {
        self.parse.next().await
    }

    async fn annotate(&self, _path: &Path, issues: &[Issue]) -> Result<PathBuf, ServiceError> {
        self.annotated_with.lock().unwrap().push(issues.to_vec());
        self.annotate.next().await
    }
}

pub(crate) struct ScriptedRuleEngine(Scripted<AuditOutcome>);

impl ScriptedRuleEngine {
    pub fn new(scripts: Vec<Script<AuditOutcome>>) -> Self {
        Self(Scripted::new(scripts))
    }

    pub fn calls(&self) -> usize {
        self.0.calls()
    }
}

#[async_trait]
impl RuleEngine for ScriptedRuleEngine {
    async fn audit_rules(&self, _parsed: &ParsedData) -> Result<AuditOutcome, ServiceError> {
        self.0.next().await
    }
}

pub(crate) struct ScriptedInference(Scripted<AuditOutcome>);

impl ScriptedInference {
    pub fn new(scripts: Vec<Script<AuditOutcome>>) -> Self {
        Self(Scripted::new(scripts))
    }

    pub fn calls(&self) -> usize {
        self.0.calls()
    }
}

#[async_trait]
impl InferenceService for ScriptedInference {
    async fn analyze_semantics(&self, _sections: &[Section]) -> Result<AuditOutcome, ServiceError> {
        self.0.next().await
    }
}

pub(crate) fn parser_unreachable() -> ServiceError {
    ServiceError::Connect {
        service: ServiceName::Parser,
        message: "connection refused".to_string(),
    }
}

pub(crate) fn corrupt_document() -> ServiceError {
    ServiceError::Parse("not a zip archive".to_string())
}

pub(crate) fn inference_down() -> ServiceError {
    ServiceError::Connect {
        service: ServiceName::Inference,
        message: "connection refused".to_string(),
    }
}

pub(crate) fn engine_error() -> ServiceError {
    ServiceError::Audit("rule set failed to load".to_string())
}

pub(crate) fn annotate_error() -> ServiceError {
    ServiceError::Annotate("comment part missing".to_string())
}

pub(crate) fn sample_document() -> ParsedData {
    let section = |id, element_type, text: &str| Section {
        id,
        element_type,
        raw_text: text.to_string(),
        props: [("font-size".to_string(), "12pt".to_string())]
            .into_iter()
            .collect(),
    };
    ParsedData {
        doc_id: "thesis-001".to_string(),
        metadata: DocumentMetadata {
            title: "A Study of Things".to_string(),
            styles: Default::default(),
        },
        sections: vec![
            section(1, ElementType::Heading { level: 1 }, "1 Introduction"),
            section(2, ElementType::Paragraph, "This paper studys things."),
            section(3, ElementType::Table, "Table 1"),
        ],
    }
}

pub(crate) fn issue(section_id: u32, code: &str, severity: Severity, source: IssueSource) -> Issue {
    Issue::new(section_id, code, format!("{} in section {}", code, section_id), severity, source)
}

pub(crate) fn outcome(issues: Vec<Issue>, score_impact: f64) -> AuditOutcome {
    AuditOutcome {
        issues,
        score_impact,
    }
}
