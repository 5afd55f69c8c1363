use crate::adapter::{RelationshipStore, TupleChangeStream};
use crate::error::{RebacError, Result};
use crate::models::*;
use async_trait::async_trait;
use parking_lot::Mutex;
use rand::Rng;
use serde::{Deserialize, Serialize};
use std::time::{Duration, Instant};
use tracing::{debug, warn};

use crate::config::duration_millis;

/// Exponential backoff with jitter for transient transport failures.
/// Read-path and write-path calls carry independent policies.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RetryPolicy {
    pub max_attempts: u32,
    #[serde(with = "duration_millis")]
    pub base_backoff: Duration,
    #[serde(with = "duration_millis")]
    pub max_backoff: Duration,
    /// Fraction of the backoff added as random jitter (0.0 disables).
    pub jitter: f64,
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self {
            max_attempts: 3,
            base_backoff: Duration::from_millis(50),
            max_backoff: Duration::from_secs(2),
            jitter: 0.2,
        }
    }
}

impl RetryPolicy {
    /// No retries; used in tests and for callers that handle retry
    /// themselves.
    pub fn none() -> Self {
        Self {
            max_attempts: 1,
            ..Self::default()
        }
    }

    pub fn backoff_for(&self, attempt: u32) -> Duration {
        let exp = self
            .base_backoff
            .saturating_mul(2u32.saturating_pow(attempt))
            .min(self.max_backoff);
        if self.jitter <= 0.0 {
            return exp;
        }
        let jitter = rand::thread_rng().gen_range(0.0..=self.jitter);
        exp.mul_f64(1.0 + jitter)
    }
}

/// What the evaluator boundary does while the relationship store is
/// unreachable. Callers that do not choose a policy get fail-closed;
/// fail-open is never a silent default.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
pub enum FailurePolicy {
    #[default]
    FailClosed,
    FailOpen,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct BreakerConfig {
    /// Consecutive failures within `window` that trip the breaker.
    pub failure_threshold: u32,
    #[serde(with = "duration_millis")]
    pub window: Duration,
    /// Time the breaker stays open before admitting a probe call.
    #[serde(with = "duration_millis")]
    pub cooldown: Duration,
}

impl Default for BreakerConfig {
    fn default() -> Self {
        Self {
            failure_threshold: 5,
            window: Duration::from_secs(10),
            cooldown: Duration::from_secs(30),
        }
    }
}

#[derive(Debug)]
struct BreakerState {
    failures: Vec<Instant>,
    opened_at: Option<Instant>,
}

/// Sliding-window circuit breaker shared by all calls through one store.
#[derive(Debug)]
pub struct CircuitBreaker {
    config: BreakerConfig,
    state: Mutex<BreakerState>,
}

impl CircuitBreaker {
    pub fn new(config: BreakerConfig) -> Self {
        Self {
            config,
            state: Mutex::new(BreakerState {
                failures: Vec::new(),
                opened_at: None,
            }),
        }
    }

    /// Whether a call may proceed. After the cooldown one probe call is
    /// admitted; its outcome closes or re-opens the breaker.
    pub fn allow(&self) -> bool {
        let mut state = self.state.lock();
        match state.opened_at {
            None => true,
            Some(opened) => {
                if opened.elapsed() >= self.config.cooldown {
                    debug!("circuit breaker admitting probe after cooldown");
                    state.opened_at = None;
                    state.failures.clear();
                    true
                } else {
                    false
                }
            }
        }
    }

    pub fn is_open(&self) -> bool {
        !self.allow_peek()
    }

    fn allow_peek(&self) -> bool {
        let state = self.state.lock();
        match state.opened_at {
            None => true,
            Some(opened) => opened.elapsed() >= self.config.cooldown,
        }
    }

    pub fn record_success(&self) {
        let mut state = self.state.lock();
        state.failures.clear();
        state.opened_at = None;
    }

    pub fn record_failure(&self) {
        let now = Instant::now();
        let mut state = self.state.lock();
        let window = self.config.window;
        state.failures.retain(|at| now.duration_since(*at) < window);
        state.failures.push(now);
        if state.failures.len() as u32 >= self.config.failure_threshold
            && state.opened_at.is_none()
        {
            warn!(
                failures = state.failures.len(),
                "circuit breaker opened"
            );
            state.opened_at = Some(now);
        }
    }
}

/// Wraps any [`RelationshipStore`] with retry and circuit-breaker
/// behaviour. In production this wraps the transport-level RPC client;
/// in tests it wraps a failing fake.
pub struct ResilientStore<S> {
    inner: S,
    read_retry: RetryPolicy,
    write_retry: RetryPolicy,
    breaker: CircuitBreaker,
    failure_policy: FailurePolicy,
}

impl<S: RelationshipStore> ResilientStore<S> {
    pub fn new(inner: S) -> Self {
        Self {
            inner,
            read_retry: RetryPolicy::default(),
            write_retry: RetryPolicy::default(),
            breaker: CircuitBreaker::new(BreakerConfig::default()),
            failure_policy: FailurePolicy::FailClosed,
        }
    }

    pub fn with_read_retry(mut self, policy: RetryPolicy) -> Self {
        self.read_retry = policy;
        self
    }

    pub fn with_write_retry(mut self, policy: RetryPolicy) -> Self {
        self.write_retry = policy;
        self
    }

    pub fn with_breaker(mut self, config: BreakerConfig) -> Self {
        self.breaker = CircuitBreaker::new(config);
        self
    }

    pub fn with_failure_policy(mut self, policy: FailurePolicy) -> Self {
        self.failure_policy = policy;
        self
    }

    pub fn breaker(&self) -> &CircuitBreaker {
        &self.breaker
    }

    pub fn inner(&self) -> &S {
        &self.inner
    }

    fn open_error(&self) -> RebacError {
        RebacError::unavailable("circuit breaker open")
    }
}

/// Retries `$call` per `$policy`, recording outcomes on the breaker.
/// Only transient errors are retried, and only transient errors count
/// against the breaker: a misconfiguration must keep surfacing instead
/// of tripping into the failure policy.
macro_rules! with_retry {
    ($self:expr, $policy:expr, $call:expr) => {{
        let policy = &$policy;
        let mut attempt: u32 = 0;
        loop {
            match $call {
                Ok(value) => {
                    $self.breaker.record_success();
                    break Ok(value);
                }
                Err(err) => {
                    if err.is_transient() {
                        $self.breaker.record_failure();
                    }
                    attempt += 1;
                    if !err.is_transient() || attempt >= policy.max_attempts {
                        break Err(err);
                    }
                    let backoff = policy.backoff_for(attempt - 1);
                    debug!(attempt, ?backoff, "retrying store call");
                    tokio::time::sleep(backoff).await;
                }
            }
        }
    }};
}

#[async_trait]
impl<S: RelationshipStore> RelationshipStore for ResilientStore<S> {
    async fn check(&self, request: &CheckRequest) -> Result<bool> {
        if !self.breaker.allow() {
            return match self.failure_policy {
                FailurePolicy::FailOpen => {
                    warn!(object = %request.object, "breaker open, failing open");
                    Ok(true)
                }
                FailurePolicy::FailClosed => Err(self.open_error()),
            };
        }
        with_retry!(self, self.read_retry, self.inner.check(request).await)
    }

    async fn batch_check(&self, requests: &[CheckRequest]) -> Result<Vec<Result<bool>>> {
        if !self.breaker.allow() {
            return match self.failure_policy {
                FailurePolicy::FailOpen => {
                    Ok(requests.iter().map(|_| Ok(true)).collect())
                }
                FailurePolicy::FailClosed => Err(self.open_error()),
            };
        }
        with_retry!(self, self.read_retry, self.inner.batch_check(requests).await)
    }

    async fn lookup_resources(
        &self,
        subject: &SubjectRef,
        permission: &str,
        object_type: &str,
        page_token: Option<&str>,
        consistency: &ConsistencyMode,
    ) -> Result<ResourcePage> {
        // A lookup cannot fabricate a default result; an open breaker
        // always surfaces as unavailable regardless of policy.
        if !self.breaker.allow() {
            return Err(self.open_error());
        }
        with_retry!(
            self,
            self.read_retry,
            self.inner
                .lookup_resources(subject, permission, object_type, page_token, consistency)
                .await
        )
    }

    async fn lookup_subjects(
        &self,
        object: &ObjectRef,
        relation: &str,
        subject_type: &str,
    ) -> Result<Vec<String>> {
        if !self.breaker.allow() {
            return Err(self.open_error());
        }
        with_retry!(
            self,
            self.read_retry,
            self.inner.lookup_subjects(object, relation, subject_type).await
        )
    }

    async fn write_tuples(&self, batch: &[TupleWrite]) -> Result<ConsistencyToken> {
        if !self.breaker.allow() {
            return Err(self.open_error());
        }
        with_retry!(self, self.write_retry, self.inner.write_tuples(batch).await)
    }

    async fn delete_tuples(&self, batch: &[TupleKey]) -> Result<ConsistencyToken> {
        if !self.breaker.allow() {
            return Err(self.open_error());
        }
        with_retry!(self, self.write_retry, self.inner.delete_tuples(batch).await)
    }

    async fn publish_schema(&self, text: &str) -> Result<String> {
        if !self.breaker.allow() {
            return Err(self.open_error());
        }
        with_retry!(self, self.write_retry, self.inner.publish_schema(text).await)
    }

    fn supports_watch(&self) -> bool {
        self.inner.supports_watch()
    }

    fn watch(&self) -> Result<TupleChangeStream> {
        self.inner.watch()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicU32, Ordering};

    /// Store that fails the first `fail_first` calls, then succeeds.
    struct FlakyStore {
        fail_first: u32,
        calls: AtomicU32,
    }

    impl FlakyStore {
        fn new(fail_first: u32) -> Self {
            Self {
                fail_first,
                calls: AtomicU32::new(0),
            }
        }

        fn attempt(&self) -> Result<()> {
            let n = self.calls.fetch_add(1, Ordering::SeqCst);
            if n < self.fail_first {
                Err(RebacError::unavailable("transport down"))
            } else {
                Ok(())
            }
        }
    }

    #[async_trait]
    impl RelationshipStore for FlakyStore {
        async fn check(&self, _request: &CheckRequest) -> Result<bool> {
            self.attempt().map(|_| true)
        }

        async fn batch_check(&self, requests: &[CheckRequest]) -> Result<Vec<Result<bool>>> {
            self.attempt()?;
            Ok(requests.iter().map(|_| Ok(true)).collect())
        }

        async fn lookup_resources(
            &self,
            _subject: &SubjectRef,
            _permission: &str,
            _object_type: &str,
            _page_token: Option<&str>,
            _consistency: &ConsistencyMode,
        ) -> Result<ResourcePage> {
            self.attempt()?;
            Ok(ResourcePage {
                ids: vec![],
                next_page_token: None,
                consistency: ConsistencyToken::new("rev-0"),
            })
        }

        async fn lookup_subjects(
            &self,
            _object: &ObjectRef,
            _relation: &str,
            _subject_type: &str,
        ) -> Result<Vec<String>> {
            self.attempt().map(|_| vec![])
        }

        async fn write_tuples(&self, _batch: &[TupleWrite]) -> Result<ConsistencyToken> {
            self.attempt().map(|_| ConsistencyToken::new("rev-1"))
        }

        async fn delete_tuples(&self, _batch: &[TupleKey]) -> Result<ConsistencyToken> {
            self.attempt().map(|_| ConsistencyToken::new("rev-1"))
        }

        async fn publish_schema(&self, _text: &str) -> Result<String> {
            self.attempt().map(|_| "schema-1".to_string())
        }
    }

    fn request() -> CheckRequest {
        CheckRequest::new(
            SubjectRef::user("u1"),
            "view",
            ObjectRef::new("folder", "f1"),
        )
    }

    fn fast_retry(attempts: u32) -> RetryPolicy {
        RetryPolicy {
            max_attempts: attempts,
            base_backoff: Duration::from_millis(1),
            max_backoff: Duration::from_millis(2),
            jitter: 0.0,
        }
    }

    #[tokio::test]
    async fn test_transient_failures_are_retried() {
        let store = ResilientStore::new(FlakyStore::new(2)).with_read_retry(fast_retry(3));
        let allowed = store.check(&request()).await.unwrap();
        assert!(allowed);
        assert_eq!(store.inner().calls.load(Ordering::SeqCst), 3);
    }

    #[tokio::test]
    async fn test_retry_ceiling_surfaces_unavailable() {
        let store = ResilientStore::new(FlakyStore::new(10)).with_read_retry(fast_retry(3));
        let result = store.check(&request()).await;
        assert!(matches!(result, Err(RebacError::EngineUnavailable { .. })));
    }

    #[tokio::test]
    async fn test_breaker_opens_and_fails_closed() {
        let store = ResilientStore::new(FlakyStore::new(u32::MAX))
            .with_read_retry(RetryPolicy::none())
            .with_breaker(BreakerConfig {
                failure_threshold: 5,
                window: Duration::from_secs(10),
                cooldown: Duration::from_secs(60),
            });

        for _ in 0..5 {
            let _ = store.check(&request()).await;
        }
        assert!(store.breaker().is_open());

        let calls_before = store.inner().calls.load(Ordering::SeqCst);
        let result = store.check(&request()).await;
        assert!(matches!(result, Err(RebacError::EngineUnavailable { .. })));
        // No network call while open.
        assert_eq!(store.inner().calls.load(Ordering::SeqCst), calls_before);
    }

    #[tokio::test]
    async fn test_breaker_fail_open_returns_allow() {
        let store = ResilientStore::new(FlakyStore::new(u32::MAX))
            .with_read_retry(RetryPolicy::none())
            .with_failure_policy(FailurePolicy::FailOpen)
            .with_breaker(BreakerConfig {
                failure_threshold: 2,
                window: Duration::from_secs(10),
                cooldown: Duration::from_secs(60),
            });

        for _ in 0..2 {
            let _ = store.check(&request()).await;
        }
        let allowed = store.check(&request()).await.unwrap();
        assert!(allowed);
    }

    #[tokio::test]
    async fn test_misconfig_errors_do_not_trip_breaker() {
        /// Store whose checks always surface a misconfiguration.
        struct MisconfigStore {
            calls: AtomicU32,
        }

        #[async_trait]
        impl RelationshipStore for MisconfigStore {
            async fn check(&self, _request: &CheckRequest) -> Result<bool> {
                self.calls.fetch_add(1, Ordering::SeqCst);
                Err(RebacError::misconfig("permission not declared"))
            }

            async fn batch_check(&self, _requests: &[CheckRequest]) -> Result<Vec<Result<bool>>> {
                Err(RebacError::misconfig("permission not declared"))
            }

            async fn lookup_resources(
                &self,
                _subject: &SubjectRef,
                _permission: &str,
                _object_type: &str,
                _page_token: Option<&str>,
                _consistency: &ConsistencyMode,
            ) -> Result<ResourcePage> {
                Err(RebacError::misconfig("permission not declared"))
            }

            async fn lookup_subjects(
                &self,
                _object: &ObjectRef,
                _relation: &str,
                _subject_type: &str,
            ) -> Result<Vec<String>> {
                Err(RebacError::misconfig("permission not declared"))
            }

            async fn write_tuples(&self, _batch: &[TupleWrite]) -> Result<ConsistencyToken> {
                Err(RebacError::misconfig("permission not declared"))
            }

            async fn delete_tuples(&self, _batch: &[TupleKey]) -> Result<ConsistencyToken> {
                Err(RebacError::misconfig("permission not declared"))
            }

            async fn publish_schema(&self, _text: &str) -> Result<String> {
                Err(RebacError::misconfig("permission not declared"))
            }
        }

        let store = ResilientStore::new(MisconfigStore {
            calls: AtomicU32::new(0),
        })
        .with_read_retry(RetryPolicy::none())
        .with_failure_policy(FailurePolicy::FailOpen)
        .with_breaker(BreakerConfig {
            failure_threshold: 2,
            window: Duration::from_secs(10),
            cooldown: Duration::from_secs(60),
        });

        for _ in 0..3 {
            let result = store.check(&request()).await;
            // Keeps surfacing; fail-open never converts a
            // misconfiguration into an allow.
            assert!(matches!(result, Err(RebacError::PolicyMisconfig { .. })));
        }
        assert!(!store.breaker().is_open());
        assert_eq!(store.inner().calls.load(Ordering::SeqCst), 3);
    }

    #[tokio::test]
    async fn test_breaker_probe_after_cooldown() {
        let store = ResilientStore::new(FlakyStore::new(2))
            .with_read_retry(RetryPolicy::none())
            .with_breaker(BreakerConfig {
                failure_threshold: 2,
                window: Duration::from_secs(10),
                cooldown: Duration::from_millis(10),
            });

        for _ in 0..2 {
            let _ = store.check(&request()).await;
        }
        assert!(store.breaker().is_open());

        tokio::time::sleep(Duration::from_millis(20)).await;
        // Probe succeeds (flaky store recovered) and closes the breaker.
        let allowed = store.check(&request()).await.unwrap();
        assert!(allowed);
        assert!(!store.breaker().is_open());
    }
}
