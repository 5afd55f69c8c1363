use crate::adapter::RelationshipStore;
use crate::error::{RebacError, Result};
use crate::graph::PolicyGraph;
use crate::models::*;
use async_trait::async_trait;
use chrono::{DateTime, Utc};
use parking_lot::Mutex;
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::sync::Arc;
use tracing::{debug, info};
use uuid::Uuid;

/// An explicit, optionally time-bounded share: one relation tuple with a
/// bookkeeping record around it so it can be listed, revoked and reaped.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Grant {
    pub id: Uuid,
    pub object: ObjectRef,
    pub relation: String,
    pub subject: SubjectRef,
    pub caveat: Option<Caveat>,
    pub expires_at: Option<DateTime<Utc>>,
    pub notes: Option<String>,
    pub created_at: DateTime<Utc>,
}

impl Grant {
    pub fn tuple_key(&self) -> TupleKey {
        TupleKey {
            object: self.object.clone(),
            relation: self.relation.clone(),
            subject: self.subject.clone(),
        }
    }

    pub fn is_expired(&self, now: DateTime<Utc>) -> bool {
        self.expires_at.is_some_and(|at| at <= now)
    }
}

/// Parameters for creating a grant.
#[derive(Debug, Clone)]
pub struct GrantRequest {
    pub object: ObjectRef,
    pub relation: String,
    pub subject: SubjectRef,
    pub caveat: Option<Caveat>,
    pub expires_at: Option<DateTime<Utc>>,
    pub notes: Option<String>,
}

impl GrantRequest {
    pub fn new(object: ObjectRef, relation: &str, subject: SubjectRef) -> Self {
        Self {
            object,
            relation: relation.to_string(),
            subject,
            caveat: None,
            expires_at: None,
            notes: None,
        }
    }

    pub fn expiring_at(mut self, at: DateTime<Utc>) -> Self {
        self.expires_at = Some(at);
        self
    }

    pub fn with_caveat(mut self, caveat: Caveat) -> Self {
        self.caveat = Some(caveat);
        self
    }

    pub fn with_notes(mut self, notes: &str) -> Self {
        self.notes = Some(notes.to_string());
        self
    }
}

/// Bookkeeping storage for grants, separate from the relationship store.
#[async_trait]
pub trait GrantStore: Send + Sync {
    async fn insert(&self, grant: Grant) -> Result<()>;
    async fn remove(&self, id: Uuid) -> Result<Option<Grant>>;
    async fn get(&self, id: Uuid) -> Result<Option<Grant>>;
    async fn list_for_object(&self, object: &ObjectRef) -> Result<Vec<Grant>>;
    /// Grants whose expiry is at or before `now`.
    async fn expired(&self, now: DateTime<Utc>) -> Result<Vec<Grant>>;
}

#[derive(Default)]
pub struct InMemoryGrantStore {
    grants: Mutex<BTreeMap<Uuid, Grant>>,
}

impl InMemoryGrantStore {
    pub fn new() -> Self {
        Self::default()
    }
}

#[async_trait]
impl GrantStore for InMemoryGrantStore {
    async fn insert(&self, grant: Grant) -> Result<()> {
        self.grants.lock().insert(grant.id, grant);
        Ok(())
    }

    async fn remove(&self, id: Uuid) -> Result<Option<Grant>> {
        Ok(self.grants.lock().remove(&id))
    }

    async fn get(&self, id: Uuid) -> Result<Option<Grant>> {
        Ok(self.grants.lock().get(&id).cloned())
    }

    async fn list_for_object(&self, object: &ObjectRef) -> Result<Vec<Grant>> {
        Ok(self
            .grants
            .lock()
            .values()
            .filter(|g| &g.object == object)
            .cloned()
            .collect())
    }

    async fn expired(&self, now: DateTime<Utc>) -> Result<Vec<Grant>> {
        Ok(self
            .grants
            .lock()
            .values()
            .filter(|g| g.is_expired(now))
            .cloned()
            .collect())
    }
}

/// Issues and revokes grants, keeping the relationship store and the
/// bookkeeping store in step.
pub struct GrantManager {
    graph: Arc<PolicyGraph>,
    store: Arc<dyn RelationshipStore>,
    grants: Arc<dyn GrantStore>,
}

impl GrantManager {
    pub fn new(
        graph: Arc<PolicyGraph>,
        store: Arc<dyn RelationshipStore>,
        grants: Arc<dyn GrantStore>,
    ) -> Self {
        Self {
            graph,
            store,
            grants,
        }
    }

    /// Creates the grant and writes its tuple. The returned token makes
    /// the grant immediately visible to at-least-as-fresh reads.
    pub async fn grant(&self, request: GrantRequest) -> Result<(Grant, ConsistencyToken)> {
        self.validate(&request)?;
        let grant = Grant {
            id: Uuid::new_v4(),
            object: request.object,
            relation: request.relation,
            subject: request.subject,
            caveat: request.caveat,
            expires_at: request.expires_at,
            notes: request.notes,
            created_at: Utc::now(),
        };

        let mut write = TupleWrite::new(grant.tuple_key());
        if let Some(ref caveat) = grant.caveat {
            write = write.with_caveat(caveat.clone());
        }
        let token = self.store.write_tuples(&[write]).await?;
        self.grants.insert(grant.clone()).await?;
        info!(grant = %grant.id, tuple = %grant.tuple_key(), "grant issued");
        Ok((grant, token))
    }

    /// Revokes a grant, deleting its tuple. Revoking an unknown id is a
    /// no-op returning `None`.
    pub async fn revoke(&self, id: Uuid) -> Result<Option<ConsistencyToken>> {
        let Some(grant) = self.grants.remove(id).await? else {
            return Ok(None);
        };
        let token = self.store.delete_tuples(&[grant.tuple_key()]).await?;
        info!(grant = %id, tuple = %grant.tuple_key(), "grant revoked");
        Ok(Some(token))
    }

    /// Deletes tuples for every grant expired as of `now`. Run
    /// periodically; between expiry and reaping a caveated store may
    /// already refuse the tuple, an uncaveated one will not.
    pub async fn reap_expired(&self, now: DateTime<Utc>) -> Result<usize> {
        let expired = self.grants.expired(now).await?;
        if expired.is_empty() {
            return Ok(0);
        }
        let keys: Vec<TupleKey> = expired.iter().map(Grant::tuple_key).collect();
        self.store.delete_tuples(&keys).await?;
        for grant in &expired {
            self.grants.remove(grant.id).await?;
        }
        debug!(reaped = expired.len(), "expired grants reaped");
        Ok(expired.len())
    }

    pub async fn list_for_object(&self, object: &ObjectRef) -> Result<Vec<Grant>> {
        self.grants.list_for_object(object).await
    }

    fn validate(&self, request: &GrantRequest) -> Result<()> {
        let Some(schema) = self.graph.get(&request.object.object_type) else {
            return Err(RebacError::misconfig(format!(
                "type '{}' is not registered",
                request.object.object_type
            )));
        };
        let Some(constraint) = schema.relations.get(&request.relation) else {
            return Err(RebacError::misconfig(format!(
                "relation '{}' is not declared for type '{}'",
                request.relation, request.object.object_type
            )));
        };
        let base = constraint.split('#').next().unwrap_or(constraint);
        if base != request.subject.subject_type {
            return Err(RebacError::misconfig(format!(
                "relation '{}' on '{}' accepts '{}' subjects, got '{}'",
                request.relation, request.object.object_type, base, request.subject.subject_type
            )));
        }
        Ok(())
    }
}
