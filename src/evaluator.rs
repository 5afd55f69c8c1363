use crate::adapter::RelationshipStore;
use crate::cache::DecisionCache;
use crate::error::{RebacError, Result};
use crate::graph::PolicyGraph;
use crate::models::*;
use crate::resilience::FailurePolicy;
use anyhow::anyhow;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::sync::Arc;
use std::time::{Duration, Instant};
use tracing::debug;

/// Whether denials are enforced or only recorded.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
pub enum EvaluationMode {
    #[default]
    Enforce,
    /// Always allow, recording the would-be decision for audit.
    Shadow,
}

/// Structured audit record emitted for every evaluation.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct DecisionRecord {
    pub subject: String,
    pub object: String,
    pub permission: String,
    /// Decision returned to the caller.
    pub allowed: bool,
    /// Shadow mode: the real decision was a deny.
    pub would_deny: bool,
    pub cache_hit: bool,
    pub latency_ms: u64,
    pub consistency: String,
    pub reason: Option<String>,
    pub at: DateTime<Utc>,
}

/// Request-scoped facade over the relationship store.
///
/// One evaluator is created per evaluation scope (typically one request)
/// and exclusively owned by it; scope state (memo, pending consistency
/// token) needs no locking. The scope moves `Open -> Closed`; a closed
/// scope refuses further checks but already-sent tuple writes stand.
pub struct PermissionEvaluator {
    subject: SubjectRef,
    store: Arc<dyn RelationshipStore>,
    graph: Arc<PolicyGraph>,
    cache: Arc<DecisionCache>,
    mode: EvaluationMode,
    failure_policy: FailurePolicy,
    timeout: Option<Duration>,
    default_context: Option<serde_json::Value>,
    memo: HashMap<(String, String), bool>,
    write_token: Option<ConsistencyToken>,
    audit: Vec<DecisionRecord>,
    closed: bool,
}

impl PermissionEvaluator {
    pub fn new(
        subject: SubjectRef,
        store: Arc<dyn RelationshipStore>,
        graph: Arc<PolicyGraph>,
        cache: Arc<DecisionCache>,
    ) -> Self {
        Self {
            subject,
            store,
            graph,
            cache,
            mode: EvaluationMode::Enforce,
            failure_policy: FailurePolicy::FailClosed,
            timeout: None,
            default_context: None,
            memo: HashMap::new(),
            write_token: None,
            audit: Vec::new(),
            closed: false,
        }
    }

    pub fn with_mode(mut self, mode: EvaluationMode) -> Self {
        self.mode = mode;
        self
    }

    pub fn with_failure_policy(mut self, policy: FailurePolicy) -> Self {
        self.failure_policy = policy;
        self
    }

    /// Caller-level deadline per adapter call, distinct from the
    /// adapter's own retry budget; elapsing cancels the in-flight
    /// attempt.
    pub fn with_timeout(mut self, timeout: Duration) -> Self {
        self.timeout = Some(timeout);
        self
    }

    pub fn with_context(mut self, context: serde_json::Value) -> Self {
        self.default_context = Some(context);
        self
    }

    pub fn subject(&self) -> &SubjectRef {
        &self.subject
    }

    /// Consistency token recorded from the latest write in this scope.
    pub fn last_write_token(&self) -> Option<&ConsistencyToken> {
        self.write_token.as_ref()
    }

    /// Audit records accumulated so far.
    pub fn records(&self) -> &[DecisionRecord] {
        &self.audit
    }

    /// Closes the scope and hands the audit trail to the caller.
    pub fn close(&mut self) -> Vec<DecisionRecord> {
        self.closed = true;
        std::mem::take(&mut self.audit)
    }

    pub async fn can(&mut self, permission: &str, object: &ObjectRef) -> Result<bool> {
        self.can_with_context(permission, object, None).await
    }

    pub async fn can_with_context(
        &mut self,
        permission: &str,
        object: &ObjectRef,
        context: Option<serde_json::Value>,
    ) -> Result<bool> {
        self.ensure_open()?;
        self.validate(permission, object)?;
        let started = Instant::now();

        let memo_key = (permission.to_string(), object.to_string());
        if let Some(&decision) = self.memo.get(&memo_key) {
            return Ok(self.finish(permission, object, decision, true, None, started));
        }
        if let Some(decision) = self.cache.get(&self.subject, permission, object) {
            self.memo.insert(memo_key, decision);
            return Ok(self.finish(permission, object, decision, true, None, started));
        }

        let request = self.request(permission, object, context);
        match self.checked(&request).await {
            Ok(decision) => {
                self.cache.insert(&self.subject, permission, object, decision);
                self.memo.insert(memo_key, decision);
                Ok(self.finish(permission, object, decision, false, None, started))
            }
            Err(err) => self.handle_failure(permission, object, err, started),
        }
    }

    /// One underlying batched round trip; per-item results in input
    /// order. An error for one object never fails the rest.
    pub async fn batch_can(
        &mut self,
        permission: &str,
        objects: &[ObjectRef],
    ) -> Result<Vec<Result<bool>>> {
        self.ensure_open()?;
        let started = Instant::now();
        let mut results: Vec<Option<Result<bool>>> = Vec::with_capacity(objects.len());
        let mut pending: Vec<(usize, CheckRequest)> = Vec::new();

        for (index, object) in objects.iter().enumerate() {
            if let Err(err) = self.validate(permission, object) {
                results.push(Some(Err(err)));
                continue;
            }
            let memo_key = (permission.to_string(), object.to_string());
            if let Some(&decision) = self.memo.get(&memo_key) {
                let visible = self.finish(permission, object, decision, true, None, started);
                results.push(Some(Ok(visible)));
                continue;
            }
            if let Some(decision) = self.cache.get(&self.subject, permission, object) {
                self.memo.insert(memo_key, decision);
                let visible = self.finish(permission, object, decision, true, None, started);
                results.push(Some(Ok(visible)));
                continue;
            }
            results.push(None);
            pending.push((index, self.request(permission, object, None)));
        }

        if !pending.is_empty() {
            let requests: Vec<CheckRequest> =
                pending.iter().map(|(_, req)| req.clone()).collect();
            match self.batch_checked(&requests).await {
                Ok(decisions) => {
                    for ((index, _), decision) in pending.iter().zip(decisions) {
                        let object = &objects[*index];
                        results[*index] = Some(match decision {
                            Ok(value) => {
                                self.cache.insert(&self.subject, permission, object, value);
                                self.memo
                                    .insert((permission.to_string(), object.to_string()), value);
                                Ok(self.finish(permission, object, value, false, None, started))
                            }
                            Err(err) => self.handle_failure(permission, object, err, started),
                        });
                    }
                }
                Err(err) => {
                    // Transport-level failure: apply the failure policy
                    // per item rather than failing the whole batch.
                    let reason = err.to_string();
                    for (index, _) in &pending {
                        let object = &objects[*index];
                        let item_err = match &err {
                            RebacError::Timeout { millis } => {
                                RebacError::Timeout { millis: *millis }
                            }
                            _ => RebacError::unavailable(reason.clone()),
                        };
                        results[*index] =
                            Some(self.handle_failure(permission, object, item_err, started));
                    }
                }
            }
        }

        Ok(results
            .into_iter()
            .map(|r| r.unwrap_or_else(|| Err(RebacError::Internal(anyhow!("missing decision")))))
            .collect())
    }

    /// Writes tuples through this scope, recording the consistency token
    /// so later reads in the scope see the write.
    pub async fn write(&mut self, writes: &[TupleWrite]) -> Result<ConsistencyToken> {
        self.ensure_open()?;
        let token = self.store.write_tuples(writes).await?;
        self.observe_write(token.clone());
        Ok(token)
    }

    pub async fn delete(&mut self, keys: &[TupleKey]) -> Result<ConsistencyToken> {
        self.ensure_open()?;
        let token = self.store.delete_tuples(keys).await?;
        self.observe_write(token.clone());
        Ok(token)
    }

    /// Records a token from a write performed elsewhere in this scope.
    pub fn observe_write(&mut self, token: ConsistencyToken) {
        self.write_token = Some(token);
    }

    fn ensure_open(&self) -> Result<()> {
        if self.closed {
            return Err(RebacError::Internal(anyhow!("evaluation scope is closed")));
        }
        Ok(())
    }

    /// An undeclared permission is a misconfiguration, surfaced rather
    /// than silently denied.
    fn validate(&self, permission: &str, object: &ObjectRef) -> Result<()> {
        self.graph
            .resolve_permission(&object.object_type, permission)
            .map_err(|_| {
                RebacError::misconfig(format!(
                    "permission '{}' is not declared for type '{}'",
                    permission, object.object_type
                ))
            })?;
        Ok(())
    }

    fn consistency(&self) -> ConsistencyMode {
        match self.write_token {
            Some(ref token) => ConsistencyMode::AtLeastAsFresh(token.clone()),
            None => ConsistencyMode::MinimizeLatency,
        }
    }

    fn request(
        &self,
        permission: &str,
        object: &ObjectRef,
        context: Option<serde_json::Value>,
    ) -> CheckRequest {
        CheckRequest {
            subject: self.subject.clone(),
            permission: permission.to_string(),
            object: object.clone(),
            context: merge_context(self.default_context.as_ref(), context),
            consistency: self.consistency(),
        }
    }

    async fn checked(&self, request: &CheckRequest) -> Result<bool> {
        match self.timeout {
            Some(limit) => tokio::time::timeout(limit, self.store.check(request))
                .await
                .map_err(|_| RebacError::Timeout {
                    millis: limit.as_millis() as u64,
                })?,
            None => self.store.check(request).await,
        }
    }

    async fn batch_checked(&self, requests: &[CheckRequest]) -> Result<Vec<Result<bool>>> {
        match self.timeout {
            Some(limit) => tokio::time::timeout(limit, self.store.batch_check(requests))
                .await
                .map_err(|_| RebacError::Timeout {
                    millis: limit.as_millis() as u64,
                })?,
            None => self.store.batch_check(requests).await,
        }
    }

    /// Maps an evaluation failure to the caller-visible outcome per mode
    /// and failure policy.
    fn handle_failure(
        &mut self,
        permission: &str,
        object: &ObjectRef,
        err: RebacError,
        started: Instant,
    ) -> Result<bool> {
        match err {
            // Misconfiguration is never converted to a decision.
            RebacError::Config(_) | RebacError::PolicyMisconfig { .. } => Err(err),
            _ => {
                let reason = err.to_string();
                let timed_out = matches!(err, RebacError::Timeout { .. });
                match self.mode {
                    EvaluationMode::Shadow => {
                        Ok(self.finish(permission, object, false, false, Some(reason), started))
                    }
                    EvaluationMode::Enforce => match self.failure_policy {
                        FailurePolicy::FailOpen => Ok(self.finish(
                            permission,
                            object,
                            true,
                            false,
                            Some(reason),
                            started,
                        )),
                        // A timeout is a decision deadline, not an outage;
                        // fail-closed turns it into a deny.
                        FailurePolicy::FailClosed if timed_out => Ok(self
                            .finish(permission, object, false, false, Some(reason), started)),
                        FailurePolicy::FailClosed => Err(err),
                    },
                }
            }
        }
    }

    /// Records the decision and returns what the caller should see.
    fn finish(
        &mut self,
        permission: &str,
        object: &ObjectRef,
        decision: bool,
        cache_hit: bool,
        reason: Option<String>,
        started: Instant,
    ) -> bool {
        let visible = match self.mode {
            EvaluationMode::Enforce => decision,
            EvaluationMode::Shadow => true,
        };
        let record = DecisionRecord {
            subject: self.subject.to_string(),
            object: object.to_string(),
            permission: permission.to_string(),
            allowed: visible,
            would_deny: self.mode == EvaluationMode::Shadow && !decision,
            cache_hit,
            latency_ms: started.elapsed().as_millis() as u64,
            consistency: match self.consistency() {
                ConsistencyMode::FullyConsistent => "fully_consistent".to_string(),
                ConsistencyMode::MinimizeLatency => "minimize_latency".to_string(),
                ConsistencyMode::AtLeastAsFresh(_) => "at_least_as_fresh".to_string(),
            },
            reason,
            at: Utc::now(),
        };
        debug!(
            subject = %record.subject,
            object = %record.object,
            permission = %record.permission,
            allowed = record.allowed,
            would_deny = record.would_deny,
            cache_hit = record.cache_hit,
            latency_ms = record.latency_ms,
            "permission decision"
        );
        self.audit.push(record);
        visible
    }
}

fn merge_context(
    default: Option<&serde_json::Value>,
    overlay: Option<serde_json::Value>,
) -> Option<serde_json::Value> {
    match (default, overlay) {
        (None, overlay) => overlay,
        (Some(default), None) => Some(default.clone()),
        (Some(default), Some(overlay)) => {
            if let (Some(base), Some(extra)) = (default.as_object(), overlay.as_object()) {
                let mut merged = base.clone();
                for (key, value) in extra {
                    merged.insert(key.clone(), value.clone());
                }
                return Some(serde_json::Value::Object(merged));
            }
            Some(overlay)
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::adapter::{InMemoryRelationshipStore, StoreOp};
    use crate::config::CacheConfig;
    use crate::graph::{BindingKind, TypeDefinition};
    use async_trait::async_trait;

    fn graph() -> Arc<PolicyGraph> {
        Arc::new(
            PolicyGraph::register(vec![
                TypeDefinition::new("folder")
                    .relation("owner", "user")
                    .relation("parent", "folder")
                    .permission("view", "owner + parent->view")
                    .permission("edit", "owner")
                    .parent("parent")
                    .binding("owner", "owner_id", BindingKind::SingleReference),
                TypeDefinition::new("note").relation("owner", "user"),
            ])
            .unwrap(),
        )
    }

    fn cache() -> Arc<DecisionCache> {
        Arc::new(DecisionCache::new(CacheConfig::default()))
    }

    async fn seeded_store(graph: &Arc<PolicyGraph>) -> Arc<InMemoryRelationshipStore> {
        let store = Arc::new(InMemoryRelationshipStore::new(graph.clone()));
        store
            .write_tuples(&[
                TupleWrite::new(TupleKey::new(
                    ObjectRef::new("folder", "f1"),
                    "owner",
                    SubjectRef::user("u1"),
                )),
                TupleWrite::new(TupleKey::new(
                    ObjectRef::new("folder", "f2"),
                    "owner",
                    SubjectRef::user("u2"),
                )),
                TupleWrite::new(TupleKey::new(
                    ObjectRef::new("folder", "f2"),
                    "parent",
                    SubjectRef::new("folder", "f1"),
                )),
            ])
            .await
            .unwrap();
        store
    }

    #[tokio::test]
    async fn test_inherited_view_scenario() {
        let graph = graph();
        let store = seeded_store(&graph).await;
        let cache = cache();

        let mut u1 =
            PermissionEvaluator::new(SubjectRef::user("u1"), store.clone(), graph.clone(), cache.clone());
        assert!(u1.can("view", &ObjectRef::new("folder", "f2")).await.unwrap());

        let mut u2 = PermissionEvaluator::new(SubjectRef::user("u2"), store, graph, cache);
        assert!(!u2.can("view", &ObjectRef::new("folder", "f1")).await.unwrap());
    }

    #[tokio::test]
    async fn test_memoized_within_scope() {
        let graph = graph();
        let store = seeded_store(&graph).await;
        let mut evaluator =
            PermissionEvaluator::new(SubjectRef::user("u1"), store.clone(), graph, cache());

        let object = ObjectRef::new("folder", "f1");
        assert!(evaluator.can("view", &object).await.unwrap());
        assert!(evaluator.can("view", &object).await.unwrap());

        let checks = store
            .operations()
            .iter()
            .filter(|op| matches!(op, StoreOp::Check))
            .count();
        assert_eq!(checks, 1);
        assert!(evaluator.records()[1].cache_hit);
    }

    #[tokio::test]
    async fn test_batch_can_order_and_partial_failure() {
        let graph = graph();
        let store = seeded_store(&graph).await;
        let mut evaluator =
            PermissionEvaluator::new(SubjectRef::user("u1"), store, graph, cache());

        let objects = vec![
            ObjectRef::new("folder", "f1"),
            // "edit" is not declared on note: per-item misconfig.
            ObjectRef::new("note", "n1"),
            ObjectRef::new("folder", "f2"),
        ];
        let decisions = evaluator.batch_can("edit", &objects).await.unwrap();
        assert_eq!(decisions.len(), 3);
        assert!(matches!(decisions[0], Ok(true)));
        assert!(matches!(decisions[1], Err(RebacError::PolicyMisconfig { .. })));
        assert!(matches!(decisions[2], Ok(false)));
    }

    #[tokio::test]
    async fn test_shadow_mode_records_would_deny() {
        let graph = graph();
        let store = seeded_store(&graph).await;
        let mut evaluator =
            PermissionEvaluator::new(SubjectRef::user("u2"), store, graph, cache())
                .with_mode(EvaluationMode::Shadow);

        // u2 lacks edit on f1; shadow still allows.
        let visible = evaluator.can("edit", &ObjectRef::new("folder", "f1")).await.unwrap();
        assert!(visible);

        let records = evaluator.close();
        assert_eq!(records.len(), 1);
        assert!(records[0].allowed);
        assert!(records[0].would_deny);
    }

    #[tokio::test]
    async fn test_undeclared_permission_raised() {
        let graph = graph();
        let store = seeded_store(&graph).await;
        let mut evaluator =
            PermissionEvaluator::new(SubjectRef::user("u1"), store, graph, cache());
        let result = evaluator.can("administer", &ObjectRef::new("folder", "f1")).await;
        assert!(matches!(result, Err(RebacError::PolicyMisconfig { .. })));
    }

    #[tokio::test]
    async fn test_write_records_consistency_token() {
        let graph = graph();
        let store = seeded_store(&graph).await;
        let mut evaluator =
            PermissionEvaluator::new(SubjectRef::user("u3"), store, graph, cache());
        assert!(evaluator.last_write_token().is_none());

        evaluator
            .write(&[TupleWrite::new(TupleKey::new(
                ObjectRef::new("folder", "f3"),
                "owner",
                SubjectRef::user("u3"),
            ))])
            .await
            .unwrap();
        assert!(evaluator.last_write_token().is_some());

        // Subsequent reads in this scope request at-least-as-fresh.
        assert!(evaluator.can("view", &ObjectRef::new("folder", "f3")).await.unwrap());
        let record = evaluator.records().last().unwrap();
        assert_eq!(record.consistency, "at_least_as_fresh");
    }

    #[tokio::test]
    async fn test_closed_scope_rejects_checks() {
        let graph = graph();
        let store = seeded_store(&graph).await;
        let mut evaluator =
            PermissionEvaluator::new(SubjectRef::user("u1"), store, graph, cache());
        evaluator.close();
        assert!(evaluator.can("view", &ObjectRef::new("folder", "f1")).await.is_err());
    }

    /// Store whose checks hang longer than any caller timeout.
    struct SlowStore;

    #[async_trait]
    impl RelationshipStore for SlowStore {
        async fn check(&self, _request: &CheckRequest) -> Result<bool> {
            tokio::time::sleep(Duration::from_secs(60)).await;
            Ok(true)
        }

        async fn batch_check(&self, _requests: &[CheckRequest]) -> Result<Vec<Result<bool>>> {
            tokio::time::sleep(Duration::from_secs(60)).await;
            Ok(vec![])
        }

        async fn lookup_resources(
            &self,
            _subject: &SubjectRef,
            _permission: &str,
            _object_type: &str,
            _page_token: Option<&str>,
            _consistency: &ConsistencyMode,
        ) -> Result<ResourcePage> {
            Err(RebacError::unavailable("slow"))
        }

        async fn lookup_subjects(
            &self,
            _object: &ObjectRef,
            _relation: &str,
            _subject_type: &str,
        ) -> Result<Vec<String>> {
            Err(RebacError::unavailable("slow"))
        }

        async fn write_tuples(&self, _batch: &[TupleWrite]) -> Result<ConsistencyToken> {
            Err(RebacError::unavailable("slow"))
        }

        async fn delete_tuples(&self, _batch: &[TupleKey]) -> Result<ConsistencyToken> {
            Err(RebacError::unavailable("slow"))
        }

        async fn publish_schema(&self, _text: &str) -> Result<String> {
            Err(RebacError::unavailable("slow"))
        }
    }

    #[tokio::test]
    async fn test_caller_timeout_denies_under_fail_closed() {
        let graph = graph();
        let mut evaluator = PermissionEvaluator::new(
            SubjectRef::user("u1"),
            Arc::new(SlowStore),
            graph,
            cache(),
        )
        .with_timeout(Duration::from_millis(10));

        let allowed = evaluator.can("view", &ObjectRef::new("folder", "f1")).await.unwrap();
        assert!(!allowed);
        let record = evaluator.records().last().unwrap();
        assert!(record.reason.as_deref().unwrap_or_default().contains("timed out"));
    }

    #[tokio::test]
    async fn test_caller_timeout_allows_under_fail_open() {
        let graph = graph();
        let mut evaluator = PermissionEvaluator::new(
            SubjectRef::user("u1"),
            Arc::new(SlowStore),
            graph,
            cache(),
        )
        .with_timeout(Duration::from_millis(10))
        .with_failure_policy(FailurePolicy::FailOpen);

        let allowed = evaluator.can("view", &ObjectRef::new("folder", "f1")).await.unwrap();
        assert!(allowed);
    }
}
