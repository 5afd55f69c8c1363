use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::fmt;

/// Reference to an authorizable object (resource).
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct ObjectRef {
    pub object_type: String,
    pub object_id: String,
}

impl ObjectRef {
    pub fn new(object_type: &str, object_id: &str) -> Self {
        Self {
            object_type: object_type.to_string(),
            object_id: object_id.to_string(),
        }
    }
}

impl fmt::Display for ObjectRef {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}:{}", self.object_type, self.object_id)
    }
}

/// Reference to a subject. A subject with a `relation` is a userset
/// reference (e.g. `group:eng#member`).
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct SubjectRef {
    pub subject_type: String,
    pub subject_id: String,
    pub relation: Option<String>,
}

impl SubjectRef {
    pub fn new(subject_type: &str, subject_id: &str) -> Self {
        Self {
            subject_type: subject_type.to_string(),
            subject_id: subject_id.to_string(),
            relation: None,
        }
    }

    pub fn user(user_id: &str) -> Self {
        Self::new("user", user_id)
    }

    pub fn userset(subject_type: &str, subject_id: &str, relation: &str) -> Self {
        Self {
            subject_type: subject_type.to_string(),
            subject_id: subject_id.to_string(),
            relation: Some(relation.to_string()),
        }
    }
}

impl fmt::Display for SubjectRef {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self.relation {
            Some(ref relation) => {
                write!(f, "{}:{}#{}", self.subject_type, self.subject_id, relation)
            }
            None => write!(f, "{}:{}", self.subject_type, self.subject_id),
        }
    }
}

/// Identity of a relationship tuple. Two tuples with the same key are the
/// same edge; the store treats re-writes of an existing key as a no-op.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct TupleKey {
    pub object: ObjectRef,
    pub relation: String,
    pub subject: SubjectRef,
}

impl TupleKey {
    pub fn new(object: ObjectRef, relation: &str, subject: SubjectRef) -> Self {
        Self {
            object,
            relation: relation.to_string(),
            subject,
        }
    }
}

impl fmt::Display for TupleKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}#{}@{}", self.object, self.relation, self.subject)
    }
}

/// Caveat attached to a tuple: a named condition plus parameters evaluated
/// by the relationship store.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Caveat {
    pub name: String,
    pub params: serde_json::Value,
}

/// A tuple write: key plus optional caveat.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct TupleWrite {
    pub key: TupleKey,
    pub caveat: Option<Caveat>,
}

impl TupleWrite {
    pub fn new(key: TupleKey) -> Self {
        Self { key, caveat: None }
    }

    pub fn with_caveat(mut self, caveat: Caveat) -> Self {
        self.caveat = Some(caveat);
        self
    }
}

/// Opaque freshness marker returned by writes, used to request
/// read-after-write consistency.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct ConsistencyToken {
    pub token: String,
}

impl ConsistencyToken {
    pub fn new(token: impl Into<String>) -> Self {
        Self {
            token: token.into(),
        }
    }
}

impl fmt::Display for ConsistencyToken {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.token)
    }
}

/// Requested staleness bound for a read-path call.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub enum ConsistencyMode {
    FullyConsistent,
    MinimizeLatency,
    AtLeastAsFresh(ConsistencyToken),
}

impl Default for ConsistencyMode {
    fn default() -> Self {
        Self::MinimizeLatency
    }
}

/// One permission check request.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct CheckRequest {
    pub subject: SubjectRef,
    pub permission: String,
    pub object: ObjectRef,
    pub context: Option<serde_json::Value>,
    pub consistency: ConsistencyMode,
}

impl CheckRequest {
    pub fn new(subject: SubjectRef, permission: &str, object: ObjectRef) -> Self {
        Self {
            subject,
            permission: permission.to_string(),
            object,
            context: None,
            consistency: ConsistencyMode::default(),
        }
    }
}

/// One page of a reverse lookup.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ResourcePage {
    pub ids: Vec<String>,
    pub next_page_token: Option<String>,
    pub consistency: ConsistencyToken,
}

/// Kind of tuple mutation observed on the watch stream.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum TupleChangeOp {
    Write,
    Delete,
}

/// One tuple mutation observed on the watch stream.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct TupleChangeEvent {
    pub op: TupleChangeOp,
    pub key: TupleKey,
    pub at: DateTime<Utc>,
}

/// Value of a bound record field at some point in time.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub enum FieldValue {
    /// Single-reference field: at most one referenced id.
    Reference(Option<String>),
    /// Multi-reference or computed field: current member ids.
    References(Vec<String>),
}

/// Snapshot of the bound fields of one record.
pub type FieldValues = HashMap<String, FieldValue>;

/// Record mutation kind as reported by the record-store collaborator.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum RecordOp {
    Create,
    Update,
    Delete,
}

/// Record mutation event. For updates the collaborator must capture
/// `previous` before the underlying record is overwritten.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RecordEvent {
    pub op: RecordOp,
    pub type_name: String,
    pub record_id: String,
    pub previous: FieldValues,
    pub current: FieldValues,
}
