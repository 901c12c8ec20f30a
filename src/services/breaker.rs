//! Circuit breaker for the inference service.
//!
//! One breaker is shared by every task: it tracks backend health, not task
//! context. After `failure_threshold` consecutive failures the breaker opens
//! and calls are refused without touching the network. Once the cool-down
//! has elapsed a single trial call is let through; its outcome decides between
//! closing the breaker and restarting the cool-down.
//!
//! ```text
//!            N consecutive failures
//!   Closed ─────────────────────────► Open ◄────────┐
//!     ▲                                │            │ trial fails
//!     │ trial succeeds                 │ cool-down  │
//!     │                                ▼            │
//!     └─────────────────────────── HalfOpen ────────┘
//! ```

use async_trait::async_trait;
use serde::Serialize;
use std::sync::{Arc, Mutex, MutexGuard};
use std::time::Duration;
use tokio::time::Instant;

use super::{with_deadline, AuditOutcome, InferenceService, Section, ServiceError, ServiceName};
use crate::config::BreakerConfig;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum BreakerState {
    /// Calls pass through, failures are counted
    Closed,
    /// Calls are refused until the cool-down elapses
    Open,
    /// One trial call is in flight
    HalfOpen,
}

impl std::fmt::Display for BreakerState {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Closed => write!(f, "closed"),
            Self::Open => write!(f, "open"),
            Self::HalfOpen => write!(f, "half_open"),
        }
    }
}

#[derive(Debug)]
struct BreakerInner {
    state: BreakerState,
    consecutive_failures: u32,
    /// When the breaker last opened (cool-down start)
    opened_at: Option<Instant>,
    trial_in_flight: bool,
    /// Bumped each time the breaker opens; permits from an older closed
    /// period no longer count toward the current one
    generation: u64,
    total_calls: u64,
    total_failures: u64,
    total_short_circuits: u64,
    last_failure_at: Option<chrono::DateTime<chrono::Utc>>,
}

impl Default for BreakerInner {
    fn default() -> Self {
        Self {
            state: BreakerState::Closed,
            consecutive_failures: 0,
            opened_at: None,
            trial_in_flight: false,
            generation: 0,
            total_calls: 0,
            total_failures: 0,
            total_short_circuits: 0,
            last_failure_at: None,
        }
    }
}

/// Serializable view of the breaker for the health endpoint.
#[derive(Debug, Clone, Serialize)]
pub struct BreakerSnapshot {
    pub state: BreakerState,
    pub consecutive_failures: u32,
    pub threshold: u32,
    pub cooldown_secs: f64,
    pub cooldown_remaining_secs: Option<f64>,
    pub total_calls: u64,
    pub total_failures: u64,
    pub total_short_circuits: u64,
    pub last_failure_at: Option<chrono::DateTime<chrono::Utc>>,
}

/// Process-wide health guard for one backend.
#[derive(Debug)]
pub struct CircuitBreaker {
    inner: Mutex<BreakerInner>,
    config: BreakerConfig,
}

impl CircuitBreaker {
    pub fn new(config: BreakerConfig) -> Self {
        Self {
            inner: Mutex::new(BreakerInner::default()),
            config,
        }
    }

    fn lock(&self) -> MutexGuard<'_, BreakerInner> {
        // Counters stay consistent even if a holder panicked mid-update.
        self.inner.lock().unwrap_or_else(|e| e.into_inner())
    }

    pub fn state(&self) -> BreakerState {
        self.lock().state
    }

    /// Ask to make a call.
    ///
    /// Returns a permit that must be settled with the call's outcome, or
    /// `ServiceError::ShortCircuited` if the breaker refuses the call.
    pub fn acquire(self: &Arc<Self>) -> Result<CallPermit, ServiceError> {
        let mut inner = self.lock();
        let trial = match inner.state {
            BreakerState::Closed => false,
            BreakerState::Open => {
                let cooled_down = inner
                    .opened_at
                    .map(|opened| opened.elapsed() >= self.config.cooldown)
                    .unwrap_or(true);
                if !cooled_down {
                    inner.total_short_circuits += 1;
                    return Err(ServiceError::ShortCircuited);
                }
                inner.state = BreakerState::HalfOpen;
                tracing::info!("Inference breaker half-open, sending trial call");
                true
            }
            BreakerState::HalfOpen => {
                if inner.trial_in_flight {
                    inner.total_short_circuits += 1;
                    return Err(ServiceError::ShortCircuited);
                }
                true
            }
        };
        if trial {
            inner.trial_in_flight = true;
        }
        inner.total_calls += 1;
        Ok(CallPermit {
            breaker: Arc::clone(self),
            trial,
            generation: inner.generation,
            settled: false,
        })
    }

    fn record_success(&self, trial: bool, generation: u64) {
        let mut inner = self.lock();
        if !trial && generation != inner.generation {
            return;
        }
        if trial {
            inner.trial_in_flight = false;
            inner.state = BreakerState::Closed;
            inner.opened_at = None;
            inner.consecutive_failures = 0;
            tracing::info!("Inference breaker closed after successful trial");
        } else if inner.state == BreakerState::Closed {
            inner.consecutive_failures = 0;
        }
    }

    fn record_failure(&self, trial: bool, generation: u64) {
        let mut inner = self.lock();
        inner.total_failures += 1;
        inner.last_failure_at = Some(chrono::Utc::now());
        if !trial && generation != inner.generation {
            tracing::debug!("Ignoring failure of a call started before the breaker last opened");
            return;
        }
        inner.consecutive_failures = inner.consecutive_failures.saturating_add(1);

        if trial {
            inner.trial_in_flight = false;
            inner.state = BreakerState::Open;
            inner.opened_at = Some(Instant::now());
            inner.generation += 1;
            tracing::warn!(
                cooldown_secs = self.config.cooldown.as_secs_f64(),
                "Inference trial failed, breaker re-opened"
            );
            return;
        }

        if inner.state == BreakerState::Closed
            && inner.consecutive_failures >= self.config.failure_threshold
        {
            inner.state = BreakerState::Open;
            inner.opened_at = Some(Instant::now());
            inner.generation += 1;
            tracing::warn!(
                consecutive_failures = inner.consecutive_failures,
                cooldown_secs = self.config.cooldown.as_secs_f64(),
                "Circuit breaker tripped, inference calls short-circuited"
            );
        }
    }

    pub fn snapshot(&self) -> BreakerSnapshot {
        let inner = self.lock();
        let cooldown_remaining_secs = match (inner.state, inner.opened_at) {
            (BreakerState::Open, Some(opened)) => self
                .config
                .cooldown
                .checked_sub(opened.elapsed())
                .map(|d| d.as_secs_f64()),
            _ => None,
        };
        BreakerSnapshot {
            state: inner.state,
            consecutive_failures: inner.consecutive_failures,
            threshold: self.config.failure_threshold,
            cooldown_secs: self.config.cooldown.as_secs_f64(),
            cooldown_remaining_secs,
            total_calls: inner.total_calls,
            total_failures: inner.total_failures,
            total_short_circuits: inner.total_short_circuits,
            last_failure_at: inner.last_failure_at,
        }
    }
}

/// Permission to make one call through the breaker.
///
/// Dropping an unsettled permit counts as a failure: the caller abandoned the
/// call (deadline), which is a timeout from the breaker's point of view.
#[derive(Debug)]
pub struct CallPermit {
    breaker: Arc<CircuitBreaker>,
    trial: bool,
    generation: u64,
    settled: bool,
}

impl CallPermit {
    pub fn is_trial(&self) -> bool {
        self.trial
    }

    pub fn success(mut self) {
        self.settled = true;
        self.breaker.record_success(self.trial, self.generation);
    }

    pub fn failure(mut self) {
        self.settled = true;
        self.breaker.record_failure(self.trial, self.generation);
    }
}

impl Drop for CallPermit {
    fn drop(&mut self) {
        if !self.settled {
            self.breaker.record_failure(self.trial, self.generation);
        }
    }
}

/// Inference client behind the shared breaker.
///
/// The per-call deadline is applied inside the breaker so timeouts count as
/// failures.
pub struct GuardedInference {
    inner: Arc<dyn InferenceService>,
    breaker: Arc<CircuitBreaker>,
    deadline: Duration,
}

impl GuardedInference {
    pub fn new(
        inner: Arc<dyn InferenceService>,
        breaker: Arc<CircuitBreaker>,
        deadline: Duration,
    ) -> Self {
        Self {
            inner,
            breaker,
            deadline,
        }
    }
}

#[async_trait]
impl InferenceService for GuardedInference {
    async fn analyze_semantics(&self, sections: &[Section]) -> Result<AuditOutcome, ServiceError> {
        let permit = self.breaker.acquire()?;
        let result = with_deadline(
            ServiceName::Inference,
            self.deadline,
            self.inner.analyze_semantics(sections),
        )
        .await;
        match &result {
            Ok(_) => permit.success(),
            Err(_) => permit.failure(),
        }
        result
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::services::testing::{Script, ScriptedInference};

    fn breaker(threshold: u32, cooldown_secs: u64) -> Arc<CircuitBreaker> {
        Arc::new(CircuitBreaker::new(BreakerConfig {
            failure_threshold: threshold,
            cooldown: Duration::from_secs(cooldown_secs),
        }))
    }

    #[tokio::test(start_paused = true)]
    async fn test_opens_after_consecutive_failures() {
        let breaker = breaker(3, 30);
        for _ in 0..2 {
            breaker.acquire().unwrap().failure();
            assert_eq!(breaker.state(), BreakerState::Closed);
        }
        breaker.acquire().unwrap().failure();
        assert_eq!(breaker.state(), BreakerState::Open);
        assert!(matches!(
            breaker.acquire(),
            Err(ServiceError::ShortCircuited)
        ));
        assert_eq!(breaker.snapshot().total_short_circuits, 1);
    }

    #[tokio::test(start_paused = true)]
    async fn test_success_resets_consecutive_count() {
        let breaker = breaker(3, 30);
        breaker.acquire().unwrap().failure();
        breaker.acquire().unwrap().failure();
        breaker.acquire().unwrap().success();
        breaker.acquire().unwrap().failure();
        breaker.acquire().unwrap().failure();
        assert_eq!(breaker.state(), BreakerState::Closed);
    }

    #[tokio::test(start_paused = true)]
    async fn test_half_open_allows_exactly_one_trial() {
        let breaker = breaker(1, 30);
        breaker.acquire().unwrap().failure();
        assert_eq!(breaker.state(), BreakerState::Open);

        tokio::time::advance(Duration::from_secs(29)).await;
        assert!(breaker.acquire().is_err());

        tokio::time::advance(Duration::from_secs(1)).await;
        let trial = breaker.acquire().unwrap();
        assert!(trial.is_trial());
        assert_eq!(breaker.state(), BreakerState::HalfOpen);
        assert!(matches!(
            breaker.acquire(),
            Err(ServiceError::ShortCircuited)
        ));

        trial.success();
        assert_eq!(breaker.state(), BreakerState::Closed);
        assert!(!breaker.acquire().unwrap().is_trial());
    }

    #[tokio::test(start_paused = true)]
    async fn test_failed_trial_restarts_cooldown() {
        let breaker = breaker(1, 30);
        breaker.acquire().unwrap().failure();
        tokio::time::advance(Duration::from_secs(30)).await;

        breaker.acquire().unwrap().failure();
        assert_eq!(breaker.state(), BreakerState::Open);

        tokio::time::advance(Duration::from_secs(20)).await;
        assert!(breaker.acquire().is_err());
        let snapshot = breaker.snapshot();
        assert!(snapshot.cooldown_remaining_secs.unwrap() <= 10.0);

        tokio::time::advance(Duration::from_secs(10)).await;
        assert!(breaker.acquire().unwrap().is_trial());
    }

    #[tokio::test(start_paused = true)]
    async fn test_dropped_trial_counts_as_failure() {
        let breaker = breaker(1, 30);
        breaker.acquire().unwrap().failure();
        tokio::time::advance(Duration::from_secs(30)).await;

        drop(breaker.acquire().unwrap());
        assert_eq!(breaker.state(), BreakerState::Open);
    }

    #[tokio::test(start_paused = true)]
    async fn test_late_success_does_not_close_open_breaker() {
        let breaker = breaker(2, 30);
        let slow = breaker.acquire().unwrap();
        breaker.acquire().unwrap().failure();
        breaker.acquire().unwrap().failure();
        assert_eq!(breaker.state(), BreakerState::Open);

        slow.success();
        assert_eq!(breaker.state(), BreakerState::Open);
    }

    #[tokio::test(start_paused = true)]
    async fn test_stale_failure_does_not_count_toward_new_closed_period() {
        let breaker = breaker(2, 30);
        let stale = breaker.acquire().unwrap();
        breaker.acquire().unwrap().failure();
        breaker.acquire().unwrap().failure();
        assert_eq!(breaker.state(), BreakerState::Open);

        tokio::time::advance(Duration::from_secs(30)).await;
        breaker.acquire().unwrap().success();
        assert_eq!(breaker.state(), BreakerState::Closed);

        // Abandoned long after the breaker reopened and closed again.
        drop(stale);
        assert_eq!(breaker.snapshot().consecutive_failures, 0);

        breaker.acquire().unwrap().failure();
        assert_eq!(breaker.state(), BreakerState::Closed);
        breaker.acquire().unwrap().failure();
        assert_eq!(breaker.state(), BreakerState::Open);
    }

    #[tokio::test(start_paused = true)]
    async fn test_guarded_inference_counts_timeouts() {
        let inner = Arc::new(ScriptedInference::new(vec![
            Script::Hang,
            Script::Hang,
            Script::Ok(AuditOutcome::empty()),
        ]));
        let breaker = breaker(2, 60);
        let guarded = GuardedInference::new(inner.clone(), breaker.clone(), Duration::from_secs(25));

        for _ in 0..2 {
            let err = guarded.analyze_semantics(&[]).await.unwrap_err();
            assert!(matches!(err, ServiceError::Timeout { .. }));
        }
        assert_eq!(breaker.state(), BreakerState::Open);

        let started = Instant::now();
        let err = guarded.analyze_semantics(&[]).await.unwrap_err();
        assert!(matches!(err, ServiceError::ShortCircuited));
        assert_eq!(started.elapsed(), Duration::ZERO);
        assert_eq!(inner.calls(), 2);
    }
}
