use crate::error::{RebacError, Result};
use crate::graph::{PermissionExpr, PolicyGraph};
use crate::models::*;
use async_trait::async_trait;
use chrono::Utc;
use dashmap::DashMap;
use parking_lot::Mutex;
use std::collections::{BTreeSet, HashSet};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use tokio::sync::broadcast;
use tracing::debug;

/// Stream of tuple mutations from the relationship store.
pub type TupleChangeStream = broadcast::Receiver<TupleChangeEvent>;

/// Abstract capability of the external relationship-store engine.
///
/// Two conforming implementations ship with the crate: the deterministic
/// [`InMemoryRelationshipStore`] for tests and development, and
/// [`crate::resilience::ResilientStore`] which wraps a transport-level
/// client with retry and circuit-breaker behaviour.
#[async_trait]
pub trait RelationshipStore: Send + Sync {
    /// Evaluates one permission, honouring the requested consistency mode.
    async fn check(&self, request: &CheckRequest) -> Result<bool>;

    /// Evaluates many checks in one round trip. Result ordering matches
    /// input ordering; a failure for one request does not fail the batch.
    async fn batch_check(&self, requests: &[CheckRequest]) -> Result<Vec<Result<bool>>>;

    /// Reverse lookup: one page of object ids the subject can reach.
    async fn lookup_resources(
        &self,
        subject: &SubjectRef,
        permission: &str,
        object_type: &str,
        page_token: Option<&str>,
        consistency: &ConsistencyMode,
    ) -> Result<ResourcePage>;

    /// All subject ids of `subject_type` holding `relation` on `object`.
    async fn lookup_subjects(
        &self,
        object: &ObjectRef,
        relation: &str,
        subject_type: &str,
    ) -> Result<Vec<String>>;

    async fn write_tuples(&self, batch: &[TupleWrite]) -> Result<ConsistencyToken>;

    async fn delete_tuples(&self, batch: &[TupleKey]) -> Result<ConsistencyToken>;

    /// Applies the compiled schema text, returning a schema version.
    async fn publish_schema(&self, text: &str) -> Result<String>;

    /// Whether this store can emit tuple-change events. Without watch,
    /// decision-cache invalidation degrades to TTL-only.
    fn supports_watch(&self) -> bool {
        false
    }

    fn watch(&self) -> Result<TupleChangeStream> {
        Err(RebacError::unavailable("watch not supported by this store"))
    }
}

/// Store operations recorded by the fake, for assertions on ordering and
/// round-trip counts.
#[derive(Debug, Clone, PartialEq)]
pub enum StoreOp {
    Write(Vec<TupleKey>),
    Delete(Vec<TupleKey>),
    Check,
    BatchCheck(usize),
    LookupResources,
    LookupSubjects,
    PublishSchema,
}

/// Deterministic in-memory relationship store.
///
/// Holds tuples keyed by their 5-tuple identity (idempotent writes) and
/// evaluates permission expressions against the supplied policy graph the
/// same way the real engine would: direct relation match, userset
/// expansion, and single-hop `parent->permission` traversal per level.
pub struct InMemoryRelationshipStore {
    graph: Arc<PolicyGraph>,
    tuples: DashMap<TupleKey, TupleWrite>,
    revision: AtomicU64,
    schema_versions: AtomicU64,
    published: Mutex<Option<String>>,
    ops: Mutex<Vec<StoreOp>>,
    watch_tx: broadcast::Sender<TupleChangeEvent>,
    page_size: usize,
}

const MAX_EVAL_DEPTH: u32 = 16;

impl InMemoryRelationshipStore {
    pub fn new(graph: Arc<PolicyGraph>) -> Self {
        let (watch_tx, _) = broadcast::channel(256);
        Self {
            graph,
            tuples: DashMap::new(),
            revision: AtomicU64::new(0),
            schema_versions: AtomicU64::new(0),
            published: Mutex::new(None),
            ops: Mutex::new(Vec::new()),
            watch_tx,
            page_size: 100,
        }
    }

    pub fn with_page_size(mut self, page_size: usize) -> Self {
        self.page_size = page_size.max(1);
        self
    }

    /// Recorded operations, oldest first.
    pub fn operations(&self) -> Vec<StoreOp> {
        self.ops.lock().clone()
    }

    pub fn tuple_count(&self) -> usize {
        self.tuples.len()
    }

    pub fn last_published_schema(&self) -> Option<String> {
        self.published.lock().clone()
    }

    fn token(&self) -> ConsistencyToken {
        ConsistencyToken::new(format!("rev-{}", self.revision.load(Ordering::SeqCst)))
    }

    fn record(&self, op: StoreOp) {
        self.ops.lock().push(op);
    }

    fn emit(&self, op: TupleChangeOp, key: &TupleKey) {
        // No receivers is fine; the send result only signals that.
        let _ = self.watch_tx.send(TupleChangeEvent {
            op,
            key: key.clone(),
            at: Utc::now(),
        });
    }

    fn check_sync(&self, subject: &SubjectRef, permission: &str, object: &ObjectRef) -> Result<bool> {
        let expr = self
            .graph
            .resolve_permission(&object.object_type, permission)
            .map_err(|_| {
                RebacError::misconfig(format!(
                    "permission '{}' is not declared for type '{}'",
                    permission, object.object_type
                ))
            })?;
        let mut visited = HashSet::new();
        self.eval_expr(subject, &expr, object, &mut visited, 0)
    }

    fn eval_expr(
        &self,
        subject: &SubjectRef,
        expr: &PermissionExpr,
        object: &ObjectRef,
        visited: &mut HashSet<String>,
        depth: u32,
    ) -> Result<bool> {
        if depth > MAX_EVAL_DEPTH {
            return Ok(false);
        }
        match expr {
            PermissionExpr::Relation(relation) => {
                self.eval_relation(subject, relation, object, visited, depth)
            }
            PermissionExpr::Inherited {
                relation,
                permission,
            } => {
                for entry in self.tuples.iter() {
                    let key = entry.key();
                    if key.object != *object || key.relation != *relation {
                        continue;
                    }
                    if key.subject.relation.is_some() {
                        continue;
                    }
                    let target = ObjectRef::new(&key.subject.subject_type, &key.subject.subject_id);
                    let Ok(target_expr) = self
                        .graph
                        .resolve_permission(&target.object_type, permission)
                    else {
                        continue;
                    };
                    if self.eval_expr(subject, &target_expr, &target, visited, depth + 1)? {
                        return Ok(true);
                    }
                }
                Ok(false)
            }
            PermissionExpr::Union(children) => {
                for child in children {
                    if self.eval_expr(subject, child, object, visited, depth)? {
                        return Ok(true);
                    }
                }
                Ok(false)
            }
        }
    }

    fn eval_relation(
        &self,
        subject: &SubjectRef,
        relation: &str,
        object: &ObjectRef,
        visited: &mut HashSet<String>,
        depth: u32,
    ) -> Result<bool> {
        let guard = format!("{object}#{relation}@{subject}");
        if !visited.insert(guard) {
            return Ok(false);
        }

        for entry in self.tuples.iter() {
            let key = entry.key();
            if key.object != *object || key.relation != *relation {
                continue;
            }
            match key.subject.relation {
                None => {
                    if key.subject.subject_type == subject.subject_type
                        && key.subject.subject_id == subject.subject_id
                    {
                        return Ok(true);
                    }
                }
                Some(ref userset_relation) => {
                    // Userset subject: membership in e.g. group:eng#member.
                    let userset_object =
                        ObjectRef::new(&key.subject.subject_type, &key.subject.subject_id);
                    if self.eval_relation(
                        subject,
                        userset_relation,
                        &userset_object,
                        visited,
                        depth + 1,
                    )? {
                        return Ok(true);
                    }
                }
            }
        }
        Ok(false)
    }

    fn lookup_resources_sync(
        &self,
        subject: &SubjectRef,
        permission: &str,
        object_type: &str,
    ) -> Result<Vec<String>> {
        let mut candidates: BTreeSet<String> = BTreeSet::new();
        for entry in self.tuples.iter() {
            let key = entry.key();
            if key.object.object_type == object_type {
                candidates.insert(key.object.object_id.clone());
            }
        }
        let mut allowed = Vec::new();
        for id in candidates {
            let object = ObjectRef::new(object_type, &id);
            if self.check_sync(subject, permission, &object)? {
                allowed.push(id);
            }
        }
        Ok(allowed)
    }
}

#[async_trait]
impl RelationshipStore for InMemoryRelationshipStore {
    async fn check(&self, request: &CheckRequest) -> Result<bool> {
        self.record(StoreOp::Check);
        debug!(
            subject = %request.subject,
            permission = %request.permission,
            object = %request.object,
            "fake store check"
        );
        self.check_sync(&request.subject, &request.permission, &request.object)
    }

    async fn batch_check(&self, requests: &[CheckRequest]) -> Result<Vec<Result<bool>>> {
        self.record(StoreOp::BatchCheck(requests.len()));
        let mut decisions = Vec::with_capacity(requests.len());
        for request in requests {
            decisions.push(self.check_sync(
                &request.subject,
                &request.permission,
                &request.object,
            ));
        }
        Ok(decisions)
    }

    async fn lookup_resources(
        &self,
        subject: &SubjectRef,
        permission: &str,
        object_type: &str,
        page_token: Option<&str>,
        _consistency: &ConsistencyMode,
    ) -> Result<ResourcePage> {
        self.record(StoreOp::LookupResources);
        let all = self.lookup_resources_sync(subject, permission, object_type)?;
        let offset = match page_token {
            Some(token) => token
                .parse::<usize>()
                .map_err(|_| RebacError::misconfig(format!("bad page token '{token}'")))?,
            None => 0,
        };
        let page: Vec<String> = all.iter().skip(offset).take(self.page_size).cloned().collect();
        let next = offset + page.len();
        let next_page_token = if next < all.len() {
            Some(next.to_string())
        } else {
            None
        };
        Ok(ResourcePage {
            ids: page,
            next_page_token,
            consistency: self.token(),
        })
    }

    async fn lookup_subjects(
        &self,
        object: &ObjectRef,
        relation: &str,
        subject_type: &str,
    ) -> Result<Vec<String>> {
        self.record(StoreOp::LookupSubjects);
        let mut ids: Vec<String> = self
            .tuples
            .iter()
            .filter(|entry| {
                let key = entry.key();
                key.object == *object
                    && key.relation == relation
                    && key.subject.subject_type == subject_type
                    && key.subject.relation.is_none()
            })
            .map(|entry| entry.key().subject.subject_id.clone())
            .collect();
        ids.sort();
        ids.dedup();
        Ok(ids)
    }

    async fn write_tuples(&self, batch: &[TupleWrite]) -> Result<ConsistencyToken> {
        self.record(StoreOp::Write(batch.iter().map(|w| w.key.clone()).collect()));
        for write in batch {
            self.tuples.insert(write.key.clone(), write.clone());
            self.emit(TupleChangeOp::Write, &write.key);
        }
        self.revision.fetch_add(1, Ordering::SeqCst);
        Ok(self.token())
    }

    async fn delete_tuples(&self, batch: &[TupleKey]) -> Result<ConsistencyToken> {
        self.record(StoreOp::Delete(batch.to_vec()));
        for key in batch {
            self.tuples.remove(key);
            self.emit(TupleChangeOp::Delete, key);
        }
        self.revision.fetch_add(1, Ordering::SeqCst);
        Ok(self.token())
    }

    async fn publish_schema(&self, text: &str) -> Result<String> {
        self.record(StoreOp::PublishSchema);
        *self.published.lock() = Some(text.to_string());
        let version = self.schema_versions.fetch_add(1, Ordering::SeqCst) + 1;
        Ok(format!("schema-{version}"))
    }

    fn supports_watch(&self) -> bool {
        true
    }

    fn watch(&self) -> Result<TupleChangeStream> {
        Ok(self.watch_tx.subscribe())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::graph::{BindingKind, TypeDefinition};

    fn folder_graph() -> Arc<PolicyGraph> {
        Arc::new(
            PolicyGraph::register(vec![
                TypeDefinition::new("folder")
                    .relation("owner", "user")
                    .relation("parent", "folder")
                    .permission("view", "owner + parent->view")
                    .parent("parent")
                    .binding("owner", "owner_id", BindingKind::SingleReference)
                    .binding("parent", "parent_id", BindingKind::SingleReference),
                TypeDefinition::new("group").relation("member", "user"),
                TypeDefinition::new("doc")
                    .relation("reader", "group#member")
                    .permission("read", "reader"),
            ])
            .unwrap(),
        )
    }

    fn owner_tuple(folder: &str, user: &str) -> TupleWrite {
        TupleWrite::new(TupleKey::new(
            ObjectRef::new("folder", folder),
            "owner",
            SubjectRef::user(user),
        ))
    }

    fn parent_tuple(child: &str, parent: &str) -> TupleWrite {
        TupleWrite::new(TupleKey::new(
            ObjectRef::new("folder", child),
            "parent",
            SubjectRef::new("folder", parent),
        ))
    }

    #[tokio::test]
    async fn test_direct_and_inherited_check() {
        let store = InMemoryRelationshipStore::new(folder_graph());
        store
            .write_tuples(&[owner_tuple("f1", "u1"), owner_tuple("f2", "u2")])
            .await
            .unwrap();
        store.write_tuples(&[parent_tuple("f2", "f1")]).await.unwrap();

        // U1 views F2 through parent inheritance.
        let allowed = store
            .check(&CheckRequest::new(
                SubjectRef::user("u1"),
                "view",
                ObjectRef::new("folder", "f2"),
            ))
            .await
            .unwrap();
        assert!(allowed);

        // U2 owns only F2 and cannot view F1.
        let allowed = store
            .check(&CheckRequest::new(
                SubjectRef::user("u2"),
                "view",
                ObjectRef::new("folder", "f1"),
            ))
            .await
            .unwrap();
        assert!(!allowed);
    }

    #[tokio::test]
    async fn test_userset_membership() {
        let store = InMemoryRelationshipStore::new(folder_graph());
        store
            .write_tuples(&[
                TupleWrite::new(TupleKey::new(
                    ObjectRef::new("group", "eng"),
                    "member",
                    SubjectRef::user("alice"),
                )),
                TupleWrite::new(TupleKey::new(
                    ObjectRef::new("doc", "d1"),
                    "reader",
                    SubjectRef::userset("group", "eng", "member"),
                )),
            ])
            .await
            .unwrap();

        let allowed = store
            .check(&CheckRequest::new(
                SubjectRef::user("alice"),
                "read",
                ObjectRef::new("doc", "d1"),
            ))
            .await
            .unwrap();
        assert!(allowed);

        let allowed = store
            .check(&CheckRequest::new(
                SubjectRef::user("bob"),
                "read",
                ObjectRef::new("doc", "d1"),
            ))
            .await
            .unwrap();
        assert!(!allowed);
    }

    #[tokio::test]
    async fn test_idempotent_writes() {
        let store = InMemoryRelationshipStore::new(folder_graph());
        let batch = [owner_tuple("f1", "u1")];
        store.write_tuples(&batch).await.unwrap();
        store.write_tuples(&batch).await.unwrap();
        assert_eq!(store.tuple_count(), 1);
    }

    #[tokio::test]
    async fn test_undeclared_permission_is_misconfig() {
        let store = InMemoryRelationshipStore::new(folder_graph());
        let result = store
            .check(&CheckRequest::new(
                SubjectRef::user("u1"),
                "administer",
                ObjectRef::new("folder", "f1"),
            ))
            .await;
        assert!(matches!(result, Err(RebacError::PolicyMisconfig { .. })));
    }

    #[tokio::test]
    async fn test_lookup_resources_paging() {
        let store = InMemoryRelationshipStore::new(folder_graph()).with_page_size(2);
        store
            .write_tuples(&[
                owner_tuple("f1", "u1"),
                owner_tuple("f2", "u1"),
                owner_tuple("f3", "u1"),
            ])
            .await
            .unwrap();

        let first = store
            .lookup_resources(
                &SubjectRef::user("u1"),
                "view",
                "folder",
                None,
                &ConsistencyMode::FullyConsistent,
            )
            .await
            .unwrap();
        assert_eq!(first.ids, vec!["f1", "f2"]);
        let token = first.next_page_token.unwrap();

        let second = store
            .lookup_resources(
                &SubjectRef::user("u1"),
                "view",
                "folder",
                Some(&token),
                &ConsistencyMode::FullyConsistent,
            )
            .await
            .unwrap();
        assert_eq!(second.ids, vec!["f3"]);
        assert!(second.next_page_token.is_none());
    }

    #[tokio::test]
    async fn test_lookup_subjects() {
        let store = InMemoryRelationshipStore::new(folder_graph());
        store
            .write_tuples(&[owner_tuple("f1", "u1"), owner_tuple("f1", "u2")])
            .await
            .unwrap();
        let ids = store
            .lookup_subjects(&ObjectRef::new("folder", "f1"), "owner", "user")
            .await
            .unwrap();
        assert_eq!(ids, vec!["u1", "u2"]);
    }

    #[tokio::test]
    async fn test_watch_emits_changes() {
        let store = InMemoryRelationshipStore::new(folder_graph());
        let mut rx = store.watch().unwrap();
        store.write_tuples(&[owner_tuple("f1", "u1")]).await.unwrap();
        let event = rx.recv().await.unwrap();
        assert_eq!(event.op, TupleChangeOp::Write);
        assert_eq!(event.key.object.object_type, "folder");
    }
}
