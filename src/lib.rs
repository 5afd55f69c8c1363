//! Relationship-based access control engine
//!
//! Implements a Zanzibar-style authorization layer that keeps a remote
//! relationship store in step with application records:
//! - Declarative policy graph with compile-validate-swap registration
//! - Tuple synchronization derived from record mutations, with an
//!   optional durable outbox
//! - Request-scoped permission evaluation with batching, caching and
//!   read-after-write consistency tokens
//! - Accessible-by planning that prefers predicate pushdown over store
//!   round trips
//! - Store adapter with retries and a circuit breaker
//!
//! # Core Concepts
//!
//! - **Object**: any resource that can be protected (e.g., folder, document)
//! - **Subject**: any entity that can hold permissions (e.g., user, group member)
//! - **Relation**: a named edge between subject and object (e.g., owner, parent)
//! - **Permission**: a rewrite expression over relations (`owner + parent->view`)
//! - **Tuple**: one stored edge: "subject has relation to object"
//!
//! # Example
//!
//! ```rust
//! use auth_rebac::{
//!     BindingKind, DecisionCache, InMemoryRelationshipStore, ObjectRef,
//!     PermissionEvaluator, PolicyGraph, SubjectRef, TupleKey, TupleWrite,
//!     TypeDefinition,
//! };
//! use auth_rebac::RelationshipStore;
//! use auth_rebac::CacheConfig;
//! use std::sync::Arc;
//!
//! #[tokio::main]
//! async fn main() -> Result<(), Box<dyn std::error::Error>> {
//!     let graph = Arc::new(PolicyGraph::register(vec![
//!         TypeDefinition::new("folder")
//!             .relation("owner", "user")
//!             .relation("parent", "folder")
//!             .permission("view", "owner + parent->view")
//!             .parent("parent")
//!             .binding("owner", "owner_id", BindingKind::SingleReference),
//!     ])?);
//!
//!     let store = Arc::new(InMemoryRelationshipStore::new(graph.clone()));
//!     store
//!         .write_tuples(&[TupleWrite::new(TupleKey::new(
//!             ObjectRef::new("folder", "f1"),
//!             "owner",
//!             SubjectRef::user("alice"),
//!         ))])
//!         .await?;
//!
//!     let cache = Arc::new(DecisionCache::new(CacheConfig::default()));
//!     let mut evaluator =
//!         PermissionEvaluator::new(SubjectRef::user("alice"), store, graph, cache);
//!     let allowed = evaluator.can("view", &ObjectRef::new("folder", "f1")).await?;
//!     assert!(allowed);
//!     Ok(())
//! }
//! ```

pub mod adapter;
pub mod cache;
pub mod config;
pub mod error;
pub mod evaluator;
pub mod grants;
pub mod graph;
pub mod models;
pub mod outbox;
pub mod planner;
pub mod sync;
pub mod resilience;

pub use adapter::{InMemoryRelationshipStore, RelationshipStore, StoreOp, TupleChangeStream};
pub use cache::{spawn_watch_invalidator, DecisionCache};
pub use config::{CacheConfig, OutboxConfig, PlannerConfig, RebacConfig};
pub use error::{ConfigError, RebacError, Result};
pub use evaluator::{DecisionRecord, EvaluationMode, PermissionEvaluator};
pub use grants::{Grant, GrantManager, GrantRequest, GrantStore, InMemoryGrantStore};
pub use graph::{
    Binding, BindingKind, CompiledSchema, PermissionExpr, PolicyGraph, TypeDefinition, TypeSchema,
};
pub use models::*;
pub use outbox::{InMemoryOutbox, OutboxDrain, OutboxEntry, OutboxStatus, OutboxStore, TupleBatch};
pub use planner::{
    AccessibleByPlanner, FilterPlan, LookupSpec, Memberships, PlanHint, PlanObservation,
    PlanOutcome, Predicate, PredicateClause,
};
pub use resilience::{BreakerConfig, CircuitBreaker, FailurePolicy, ResilientStore, RetryPolicy};
pub use sync::TupleSynchronizer;
