//! Orchestration worker: drives one task through the audit pipeline.
//!
//! ```text
//! Pending ─► Parsing (5) ─► Auditing (40) ─► Annotating (70) ─► Completed (100)
//!               │              │ rule engine ──┐
//!               │              │ inference  ───┤ join (parent deadline)
//!               ▼              ▼               ▼
//!         Error:parse     aggregate + score, annotate (best effort), report
//!         Error:connect:parser
//! ```
//!
//! Parsing is the only stage that can fail a task. Audit branches and the
//! annotation round-trip degrade to empty results instead.

use std::path::PathBuf;
use std::sync::Arc;
use tokio::task::JoinHandle;
use tokio::time::Instant;

use crate::audit::report::{report_path_for, write_report};
use crate::audit::{
    aggregate_issues, compliance_score, AuditReport, BranchStatus, BranchSummary, IssueCounts,
};
use crate::config::{PipelineTimeouts, ScoringWeights};
use crate::services::{
    with_deadline, AuditOutcome, DocumentParser, InferenceService, ParsedData, RuleEngine,
    ServiceError, ServiceName,
};
use crate::task::{Task, TaskFailure, TaskId, TaskStatus, TaskStore};

/// Progress reported when each stage starts.
pub const PROGRESS_PARSING: u8 = 5;
pub const PROGRESS_AUDITING: u8 = 40;
pub const PROGRESS_ANNOTATING: u8 = 70;
pub const PROGRESS_COMPLETED: u8 = 100;

/// The collaborators a worker calls.
#[derive(Clone)]
pub struct Services {
    pub parser: Arc<dyn DocumentParser>,
    pub rule_engine: Arc<dyn RuleEngine>,
    /// `None` when semantic analysis is disabled. When present this is
    /// normally a breaker-guarded client.
    pub inference: Option<Arc<dyn InferenceService>>,
}

/// Outcome of one audit branch after the join.
#[derive(Debug)]
struct Branch {
    outcome: AuditOutcome,
    status: BranchStatus,
}

impl Branch {
    fn ok(outcome: AuditOutcome) -> Self {
        Self {
            outcome,
            status: BranchStatus::Ok,
        }
    }

    fn empty(status: BranchStatus) -> Self {
        Self {
            outcome: AuditOutcome::empty(),
            status,
        }
    }
}

/// Terminal state for a failed parse.
fn parse_failure(error: &ServiceError) -> TaskFailure {
    if error.is_connectivity() {
        TaskFailure::Connect(ServiceName::Parser)
    } else {
        TaskFailure::Parse
    }
}

#[derive(Clone)]
pub struct Orchestrator {
    store: TaskStore,
    services: Services,
    timeouts: PipelineTimeouts,
    scoring: ScoringWeights,
    reports_dir: PathBuf,
}

impl Orchestrator {
    pub fn new(
        store: TaskStore,
        services: Services,
        timeouts: PipelineTimeouts,
        scoring: ScoringWeights,
        reports_dir: PathBuf,
    ) -> Self {
        Self {
            store,
            services,
            timeouts,
            scoring,
            reports_dir,
        }
    }

    pub fn store(&self) -> &TaskStore {
        &self.store
    }

    /// Process one task to a terminal state.
    ///
    /// Tasks that are unknown or no longer waiting are skipped.
    pub async fn run(&self, id: TaskId) {
        let task = match self.store.get(id).await {
            Ok(task) => task,
            Err(e) => {
                tracing::warn!(task_id = %id, "Dequeued task vanished: {}", e);
                return;
            }
        };
        if !task.status.is_waiting() {
            tracing::debug!(task_id = %id, status = %task.status, "Skipping task that is not waiting");
            return;
        }

        let Some(parsed) = self.parse_stage(&task).await else {
            return;
        };
        let (rules, semantic) = self.audit_stage(id, parsed).await;
        self.finish(&task, rules, semantic).await;
    }

    async fn parse_stage(&self, task: &Task) -> Option<ParsedData> {
        let id = task.id;
        self.store
            .update(id, |t| t.advance(TaskStatus::Parsing, PROGRESS_PARSING))
            .await;
        tracing::info!(task_id = %id, source = %task.source_path.display(), "Parsing document");

        let result = with_deadline(
            ServiceName::Parser,
            self.timeouts.parse,
            self.services.parser.parse(&task.source_path),
        )
        .await;

        match result {
            Ok(parsed) => {
                tracing::info!(
                    task_id = %id,
                    doc_id = %parsed.doc_id,
                    sections = parsed.sections.len(),
                    "Document parsed"
                );
                Some(parsed)
            }
            Err(e) => {
                let failure = parse_failure(&e);
                self.store.update(id, |t| t.fail(failure)).await;
                tracing::warn!(
                    task_id = %id,
                    status = %TaskStatus::Failed(failure),
                    "Parsing failed: {}",
                    e
                );
                None
            }
        }
    }

    /// Run the rule engine and inference concurrently and join them.
    ///
    /// Each branch has its own deadline and the join is bounded by the
    /// fan-out deadline; a branch that has not answered by then is aborted
    /// and treated as empty.
    async fn audit_stage(&self, id: TaskId, parsed: ParsedData) -> (Branch, Branch) {
        self.store
            .update(id, |t| t.advance(TaskStatus::Auditing, PROGRESS_AUDITING))
            .await;
        tracing::info!(task_id = %id, "Auditing document");

        let deadline = Instant::now() + self.timeouts.audit_fanout;
        let per_call = self.timeouts.audit_call;
        let parsed = Arc::new(parsed);

        let rules = {
            let engine = Arc::clone(&self.services.rule_engine);
            let parsed = Arc::clone(&parsed);
            tokio::spawn(async move {
                with_deadline(ServiceName::RuleEngine, per_call, engine.audit_rules(&parsed)).await
            })
        };

        let semantic = self.services.inference.as_ref().map(|inference| {
            let inference = Arc::clone(inference);
            let parsed = Arc::clone(&parsed);
            tokio::spawn(async move {
                with_deadline(
                    ServiceName::Inference,
                    per_call,
                    inference.analyze_semantics(&parsed.sections),
                )
                .await
            })
        });

        let rules = join_branch(id, ServiceName::RuleEngine, rules, deadline).await;
        let semantic = match semantic {
            Some(handle) => join_branch(id, ServiceName::Inference, handle, deadline).await,
            None => Branch::empty(BranchStatus::Disabled),
        };
        (rules, semantic)
    }

    async fn finish(&self, task: &Task, rules: Branch, semantic: Branch) {
        let id = task.id;
        self.store
            .update(id, |t| t.advance(TaskStatus::Annotating, PROGRESS_ANNOTATING))
            .await;

        let branches = BranchSummary {
            rule_engine: rules.status,
            inference: semantic.status,
        };
        let score = compliance_score(
            &self.scoring,
            rules.outcome.score_impact,
            semantic.outcome.score_impact,
        );
        let issues = aggregate_issues(rules.outcome.issues, semantic.outcome.issues);
        tracing::info!(
            task_id = %id,
            issues = issues.len(),
            compliance_score = score,
            "Annotating document"
        );

        let annotated_path = match with_deadline(
            ServiceName::Parser,
            self.timeouts.annotate,
            self.services.parser.annotate(&task.source_path, &issues),
        )
        .await
        {
            Ok(path) => Some(path),
            Err(e) => {
                tracing::warn!(task_id = %id, "Annotation skipped: {}", e);
                None
            }
        };

        let report_path = report_path_for(&self.reports_dir, id);
        let report = AuditReport {
            task_id: id,
            compliance_score: score,
            issue_counts: IssueCounts::tally(&issues),
            issues,
            branches,
            annotated: annotated_path.is_some(),
            generated_at: chrono::Utc::now(),
        };
        if let Err(e) = write_report(&report_path, &report).await {
            tracing::error!(
                task_id = %id,
                path = %report_path.display(),
                "Failed to write report: {}",
                e
            );
        }

        self.store
            .update(id, |t| t.complete(annotated_path, report_path))
            .await;
        tracing::info!(task_id = %id, compliance_score = score, "Audit completed");
    }
}

/// Wait for a branch until `deadline`, always producing exactly one result.
async fn join_branch(
    id: TaskId,
    service: ServiceName,
    mut handle: JoinHandle<Result<AuditOutcome, ServiceError>>,
    deadline: Instant,
) -> Branch {
    match tokio::time::timeout_at(deadline, &mut handle).await {
        Ok(Ok(Ok(outcome))) => {
            tracing::debug!(task_id = %id, service = %service, issues = outcome.issues.len(), "Branch finished");
            Branch::ok(outcome)
        }
        Ok(Ok(Err(ServiceError::ShortCircuited))) => {
            tracing::info!(task_id = %id, service = %service, "Branch short-circuited by breaker");
            Branch::empty(BranchStatus::ShortCircuited)
        }
        Ok(Ok(Err(e))) => {
            tracing::warn!(task_id = %id, service = %service, "Branch degraded: {}", e);
            Branch::empty(BranchStatus::Degraded)
        }
        Ok(Err(e)) => {
            tracing::error!(task_id = %id, service = %service, "Branch task failed: {}", e);
            Branch::empty(BranchStatus::Degraded)
        }
        Err(_) => {
            handle.abort();
            tracing::warn!(task_id = %id, service = %service, "Branch abandoned at fan-out deadline");
            Branch::empty(BranchStatus::Degraded)
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::audit::report::read_report;
    use crate::config::BreakerConfig;
    use crate::services::breaker::{BreakerState, CircuitBreaker, GuardedInference};
    use crate::services::testing::*;
    use crate::services::{IssueSource, Severity};
    use std::time::Duration;
    use tempfile::TempDir;

    struct Harness {
        orchestrator: Orchestrator,
        store: TaskStore,
        _dir: TempDir,
    }

    impl Harness {
        fn new(
            parser: Arc<ScriptedParser>,
            rules: Arc<ScriptedRuleEngine>,
            inference: Option<Arc<dyn InferenceService>>,
        ) -> Self {
            Self::with_timeouts(parser, rules, inference, PipelineTimeouts::default())
        }

        fn with_timeouts(
            parser: Arc<ScriptedParser>,
            rules: Arc<ScriptedRuleEngine>,
            inference: Option<Arc<dyn InferenceService>>,
            timeouts: PipelineTimeouts,
        ) -> Self {
            let dir = tempfile::tempdir().unwrap();
            let store = TaskStore::new();
            let orchestrator = Orchestrator::new(
                store.clone(),
                Services {
                    parser,
                    rule_engine: rules,
                    inference,
                },
                timeouts,
                ScoringWeights::default(),
                dir.path().to_path_buf(),
            );
            Self {
                orchestrator,
                store,
                _dir: dir,
            }
        }

        async fn submit(&self) -> TaskId {
            let task = Task::new("/tmp/thesis.docx");
            let id = task.id;
            self.store.create(task).await.unwrap();
            id
        }

        async fn run_one(&self) -> Task {
            let id = self.submit().await;
            self.orchestrator.run(id).await;
            self.store.get(id).await.unwrap()
        }
    }

    fn rule_findings() -> AuditOutcome {
        outcome(
            vec![
                issue(3, "ERR_FONT_001", Severity::Medium, IssueSource::RuleEngine),
                issue(1, "ERR_HEADING_002", Severity::Critical, IssueSource::RuleEngine),
            ],
            0.5,
        )
    }

    fn semantic_findings() -> AuditOutcome {
        outcome(
            vec![issue(2, "SEM_TYPO_001", Severity::Info, IssueSource::Inference)],
            0.25,
        )
    }

    fn inference(scripts: Vec<Script<AuditOutcome>>) -> Arc<ScriptedInference> {
        Arc::new(ScriptedInference::new(scripts))
    }

    #[tokio::test]
    async fn test_full_pipeline_completes() {
        let parser = Arc::new(ScriptedParser::healthy());
        let rules = Arc::new(ScriptedRuleEngine::new(vec![Script::Ok(rule_findings())]));
        let harness = Harness::new(
            parser.clone(),
            rules,
            Some(inference(vec![Script::Ok(semantic_findings())])),
        );

        let task = harness.run_one().await;
        assert_eq!(task.status, TaskStatus::Completed);
        assert_eq!(task.progress, 100);
        assert_eq!(task.annotated_path, Some(PathBuf::from("/nonexistent/annotated.docx")));

        let report = read_report(task.report_path.as_ref().unwrap()).await.unwrap();
        assert_eq!(report.task_id, task.id);
        assert_eq!(report.compliance_score, 60.0);
        let sections: Vec<u32> = report.issues.iter().map(|i| i.section_id).collect();
        assert_eq!(sections, vec![1, 2, 3]);
        assert_eq!(report.branches.rule_engine, BranchStatus::Ok);
        assert_eq!(report.branches.inference, BranchStatus::Ok);
        assert!(report.annotated);

        // Annotation sees the aggregated, ordered list.
        assert_eq!(parser.annotated_with(), vec![report.issues.clone()]);
    }

    #[tokio::test]
    async fn test_duplicate_finding_keeps_critical() {
        let rules = Arc::new(ScriptedRuleEngine::new(vec![Script::Ok(outcome(
            vec![issue(2, "ERR_FONT_001", Severity::Medium, IssueSource::RuleEngine)],
            0.1,
        ))]));
        let semantic = inference(vec![Script::Ok(outcome(
            vec![issue(2, "ERR_FONT_001", Severity::Critical, IssueSource::Inference)],
            0.1,
        ))]);
        let harness = Harness::new(Arc::new(ScriptedParser::healthy()), rules, Some(semantic));

        let task = harness.run_one().await;
        let report = read_report(task.report_path.as_ref().unwrap()).await.unwrap();
        assert_eq!(report.issues.len(), 1);
        assert_eq!(report.issues[0].severity, Severity::Critical);
    }

    #[tokio::test]
    async fn test_inference_failure_degrades_to_rule_issues() {
        let rules = Arc::new(ScriptedRuleEngine::new(vec![Script::Ok(rule_findings())]));
        let harness = Harness::new(
            Arc::new(ScriptedParser::healthy()),
            rules,
            Some(inference(vec![Script::Fail(inference_down)])),
        );

        let task = harness.run_one().await;
        assert_eq!(task.status, TaskStatus::Completed);
        let report = read_report(task.report_path.as_ref().unwrap()).await.unwrap();
        assert_eq!(report.branches.inference, BranchStatus::Degraded);
        assert_eq!(report.issues.len(), 2);
        assert!(report
            .issues
            .iter()
            .all(|i| i.source == IssueSource::RuleEngine));
        assert_eq!(report.compliance_score, 70.0);
    }

    #[tokio::test]
    async fn test_rule_engine_failure_degrades() {
        let rules = Arc::new(ScriptedRuleEngine::new(vec![Script::Fail(engine_error)]));
        let harness = Harness::new(
            Arc::new(ScriptedParser::healthy()),
            rules,
            Some(inference(vec![Script::Ok(semantic_findings())])),
        );

        let task = harness.run_one().await;
        assert_eq!(task.status, TaskStatus::Completed);
        let report = read_report(task.report_path.as_ref().unwrap()).await.unwrap();
        assert_eq!(report.branches.rule_engine, BranchStatus::Degraded);
        assert_eq!(report.issues.len(), 1);
    }

    #[tokio::test]
    async fn test_parse_error_is_terminal() {
        let parser = Arc::new(ScriptedParser::new(
            vec![Script::Fail(corrupt_document)],
            vec![Script::Hang],
        ));
        let rules = Arc::new(ScriptedRuleEngine::new(vec![Script::Ok(rule_findings())]));
        let harness = Harness::new(parser.clone(), rules.clone(), None);

        let task = harness.run_one().await;
        assert_eq!(task.status, TaskStatus::Failed(TaskFailure::Parse));
        assert_eq!(task.status.to_string(), "Error:parse");
        assert!(task.progress <= PROGRESS_PARSING);
        assert!(task.annotated_path.is_none());
        assert!(task.report_path.is_none());
        assert_eq!(rules.calls(), 0);
        assert_eq!(parser.annotate_calls(), 0);
    }

    #[tokio::test]
    async fn test_parser_unreachable() {
        let parser = Arc::new(ScriptedParser::unreachable());
        let rules = Arc::new(ScriptedRuleEngine::new(vec![Script::Ok(rule_findings())]));
        let harness = Harness::new(parser, rules, None);

        let task = harness.run_one().await;
        assert_eq!(task.status.to_string(), "Error:connect:parser");
        assert!(task.progress <= PROGRESS_PARSING);
        assert!(task.annotated_path.is_none());
        assert!(task.report_path.is_none());
    }

    #[tokio::test(start_paused = true)]
    async fn test_parse_timeout_counts_as_connect_failure() {
        let parser = Arc::new(ScriptedParser::new(vec![Script::Hang], vec![Script::Hang]));
        let rules = Arc::new(ScriptedRuleEngine::new(vec![Script::Ok(rule_findings())]));
        let harness = Harness::new(parser, rules, None);

        let started = Instant::now();
        let task = harness.run_one().await;
        assert_eq!(
            task.status,
            TaskStatus::Failed(TaskFailure::Connect(ServiceName::Parser))
        );
        assert_eq!(started.elapsed(), Duration::from_secs(30));
    }

    #[tokio::test]
    async fn test_annotation_failure_still_completes() {
        let parser = Arc::new(ScriptedParser::new(
            vec![Script::Ok(sample_document())],
            vec![Script::Fail(annotate_error)],
        ));
        let rules = Arc::new(ScriptedRuleEngine::new(vec![Script::Ok(rule_findings())]));
        let harness = Harness::new(parser, rules, None);

        let task = harness.run_one().await;
        assert_eq!(task.status, TaskStatus::Completed);
        assert!(task.annotated_path.is_none());
        let report = read_report(task.report_path.as_ref().unwrap()).await.unwrap();
        assert!(!report.annotated);
        assert_eq!(report.branches.inference, BranchStatus::Disabled);
    }

    #[tokio::test(start_paused = true)]
    async fn test_fanout_deadline_bounds_hung_branches() {
        let timeouts = PipelineTimeouts {
            audit_call: Duration::from_secs(120),
            audit_fanout: Duration::from_secs(45),
            ..PipelineTimeouts::default()
        };
        let rules = Arc::new(ScriptedRuleEngine::new(vec![Script::Delay(
            Duration::from_secs(10),
            rule_findings(),
        )]));
        let harness = Harness::with_timeouts(
            Arc::new(ScriptedParser::healthy()),
            rules,
            Some(inference(vec![Script::Hang])),
            timeouts,
        );

        let started = Instant::now();
        let task = harness.run_one().await;
        assert_eq!(started.elapsed(), Duration::from_secs(45));
        assert_eq!(task.status, TaskStatus::Completed);

        let report = read_report(task.report_path.as_ref().unwrap()).await.unwrap();
        assert_eq!(report.branches.rule_engine, BranchStatus::Ok);
        assert_eq!(report.branches.inference, BranchStatus::Degraded);
        assert_eq!(report.issues.len(), 2);
    }

    #[tokio::test(start_paused = true)]
    async fn test_breaker_opens_across_tasks() {
        let backend = inference(vec![Script::Hang]);
        let breaker = Arc::new(CircuitBreaker::new(BreakerConfig {
            failure_threshold: 2,
            cooldown: Duration::from_secs(60),
        }));
        let guarded: Arc<dyn InferenceService> = Arc::new(GuardedInference::new(
            backend.clone(),
            Arc::clone(&breaker),
            Duration::from_secs(25),
        ));
        let rules = Arc::new(ScriptedRuleEngine::new(vec![Script::Ok(rule_findings())]));
        let harness = Harness::new(Arc::new(ScriptedParser::healthy()), rules, Some(guarded));

        for _ in 0..2 {
            let task = harness.run_one().await;
            assert_eq!(task.status, TaskStatus::Completed);
        }
        assert_eq!(breaker.state(), BreakerState::Open);

        let started = Instant::now();
        let task = harness.run_one().await;
        assert_eq!(started.elapsed(), Duration::ZERO);
        assert_eq!(backend.calls(), 2);
        let report = read_report(task.report_path.as_ref().unwrap()).await.unwrap();
        assert_eq!(report.branches.inference, BranchStatus::ShortCircuited);
        assert_eq!(report.branches.rule_engine, BranchStatus::Ok);
    }

    #[tokio::test(start_paused = true)]
    async fn test_progress_is_monotonic_while_polled() {
        let parser = Arc::new(ScriptedParser::new(
            vec![Script::Delay(Duration::from_secs(3), sample_document())],
            vec![Script::Delay(Duration::from_secs(3), PathBuf::from("/tmp/a.docx"))],
        ));
        let rules = Arc::new(ScriptedRuleEngine::new(vec![Script::Delay(
            Duration::from_secs(5),
            rule_findings(),
        )]));
        let harness = Harness::new(
            parser,
            rules,
            Some(inference(vec![Script::Delay(
                Duration::from_secs(8),
                semantic_findings(),
            )])),
        );
        let id = harness.submit().await;

        let orchestrator = harness.orchestrator.clone();
        let run = tokio::spawn(async move { orchestrator.run(id).await });

        let mut seen = Vec::new();
        loop {
            let task = harness.store.get(id).await.unwrap();
            seen.push(task.progress);
            if task.status.is_terminal() {
                break;
            }
            tokio::time::sleep(Duration::from_millis(500)).await;
        }
        run.await.unwrap();

        assert!(seen.windows(2).all(|w| w[0] <= w[1]), "progress went backwards: {:?}", seen);
        assert!(seen.contains(&PROGRESS_PARSING));
        assert!(seen.contains(&PROGRESS_AUDITING));
        assert!(seen.contains(&PROGRESS_ANNOTATING));
        assert_eq!(seen.last(), Some(&PROGRESS_COMPLETED));
    }

    #[tokio::test]
    async fn test_skips_task_that_is_not_waiting() {
        let parser = Arc::new(ScriptedParser::healthy());
        let rules = Arc::new(ScriptedRuleEngine::new(vec![Script::Ok(rule_findings())]));
        let harness = Harness::new(parser.clone(), rules, None);

        let task = harness.run_one().await;
        assert_eq!(task.status, TaskStatus::Completed);

        harness.orchestrator.run(task.id).await;
        harness.orchestrator.run(TaskId::new()).await;
        assert_eq!(parser.parse_calls(), 1);
    }
}
