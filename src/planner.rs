use crate::adapter::RelationshipStore;
use crate::config::PlannerConfig;
use crate::error::{RebacError, Result};
use crate::graph::{BindingKind, PermissionExpr, PolicyGraph, TypeSchema};
use crate::models::*;
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::sync::Arc;
use tracing::debug;

/// Caller override for plan selection.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PlanHint {
    /// Require a pure predicate pushdown; planning fails if any disjunct
    /// cannot be expressed as a field predicate.
    ForceDirect,
    /// Skip predicate analysis and go straight to reverse lookup.
    ForceLookup,
}

/// One pushed-down filter clause against the backing record table.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub enum PredicateClause {
    /// Single-reference field equals the subject's id.
    FieldEquals { field: String, value: String },
    /// Single-reference field is one of the subject's memberships.
    FieldIn { field: String, values: Vec<String> },
    /// Multi-reference field contains the subject's id.
    FieldContains { field: String, value: String },
}

/// Disjunction of clauses; a record is accessible when any clause holds.
#[derive(Debug, Clone, PartialEq, Default, Serialize, Deserialize)]
pub struct Predicate {
    pub any_of: Vec<PredicateClause>,
}

impl Predicate {
    pub fn is_empty(&self) -> bool {
        self.any_of.is_empty()
    }
}

/// Reverse-lookup parameters for the non-pushable part of a plan.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct LookupSpec {
    pub object_type: String,
    pub permission: String,
}

/// Strategy chosen for one accessible-by query.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub enum FilterPlan {
    /// Every disjunct pushed down as a predicate; no store round trip.
    Direct(Predicate),
    /// Pushable disjuncts as a predicate, the rest via reverse lookup;
    /// the caller unions the two result sets.
    Hybrid {
        predicate: Predicate,
        lookup: LookupSpec,
    },
    /// Full reverse lookup through the store.
    Lookup(LookupSpec),
}

impl FilterPlan {
    pub fn strategy(&self) -> &'static str {
        match self {
            FilterPlan::Direct(_) => "direct",
            FilterPlan::Hybrid { .. } => "hybrid",
            FilterPlan::Lookup(_) => "lookup",
        }
    }
}

/// Precomputed membership ids for the querying subject, keyed by subject
/// type (`group` -> ids of groups the subject belongs to). Supplied by
/// the caller; the planner never resolves memberships itself.
#[derive(Debug, Clone, Default)]
pub struct Memberships {
    sets: HashMap<String, Vec<String>>,
}

impl Memberships {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with(mut self, subject_type: &str, ids: Vec<String>) -> Self {
        self.sets.insert(subject_type.to_string(), ids);
        self
    }

    pub fn get(&self, subject_type: &str) -> Option<&[String]> {
        self.sets.get(subject_type).map(|v| v.as_slice())
    }
}

/// What executing a plan cost.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct PlanObservation {
    pub strategy: String,
    pub round_trips: u32,
}

/// Result of executing a plan. `predicate` filters the record table;
/// `resource_ids` came back from reverse lookup. A caller with both
/// unions them.
#[derive(Debug, Clone)]
pub struct PlanOutcome {
    pub predicate: Option<Predicate>,
    pub resource_ids: Option<Vec<String>>,
    pub observation: PlanObservation,
}

/// Plans and executes "which objects of this type can the subject act
/// on" queries, preferring predicate pushdown over store round trips.
pub struct AccessibleByPlanner {
    graph: Arc<PolicyGraph>,
    store: Arc<dyn RelationshipStore>,
    config: PlannerConfig,
}

enum ClauseOutcome {
    Clause(PredicateClause),
    NeedsLookup,
}

impl AccessibleByPlanner {
    pub fn new(
        graph: Arc<PolicyGraph>,
        store: Arc<dyn RelationshipStore>,
        config: PlannerConfig,
    ) -> Self {
        Self {
            graph,
            store,
            config,
        }
    }

    /// Chooses a strategy for the given subject, permission and object
    /// type. Planning is pure; no store call is made here.
    pub fn plan(
        &self,
        subject: &SubjectRef,
        permission: &str,
        object_type: &str,
        memberships: &Memberships,
        hint: Option<PlanHint>,
    ) -> Result<FilterPlan> {
        let schema = self.graph.get(object_type).ok_or_else(|| {
            RebacError::misconfig(format!("type '{object_type}' is not registered"))
        })?;
        let expr = self.graph.resolve_permission(object_type, permission)?;
        let lookup = LookupSpec {
            object_type: object_type.to_string(),
            permission: permission.to_string(),
        };

        if hint == Some(PlanHint::ForceLookup) {
            return Ok(FilterPlan::Lookup(lookup));
        }

        let mut clauses = Vec::new();
        let mut needs_lookup = false;
        for disjunct in expr.disjuncts() {
            match classify(schema, disjunct, subject, memberships) {
                ClauseOutcome::Clause(clause) => clauses.push(clause),
                ClauseOutcome::NeedsLookup => needs_lookup = true,
            }
        }

        if hint == Some(PlanHint::ForceDirect) {
            if needs_lookup {
                return Err(RebacError::misconfig(format!(
                    "permission '{permission}' on '{object_type}' cannot be pushed down"
                )));
            }
            return Ok(FilterPlan::Direct(Predicate { any_of: clauses }));
        }

        // Too many clauses means the predicate no longer beats a single
        // indexed lookup call.
        if !needs_lookup && clauses.len() > self.config.direct_clause_limit {
            return Ok(FilterPlan::Lookup(lookup));
        }

        let plan = match (clauses.is_empty(), needs_lookup) {
            (false, false) => FilterPlan::Direct(Predicate { any_of: clauses }),
            (false, true) => FilterPlan::Hybrid {
                predicate: Predicate { any_of: clauses },
                lookup,
            },
            (true, _) => FilterPlan::Lookup(lookup),
        };
        debug!(
            subject = %subject,
            permission,
            object_type,
            strategy = plan.strategy(),
            "accessible-by plan chosen"
        );
        Ok(plan)
    }

    /// Executes a plan, paging any reverse lookup to completion. A pure
    /// pushdown plan costs zero round trips.
    pub async fn execute(
        &self,
        subject: &SubjectRef,
        plan: &FilterPlan,
        consistency: &ConsistencyMode,
    ) -> Result<PlanOutcome> {
        match plan {
            FilterPlan::Direct(predicate) => Ok(PlanOutcome {
                predicate: Some(predicate.clone()),
                resource_ids: None,
                observation: PlanObservation {
                    strategy: "direct".to_string(),
                    round_trips: 0,
                },
            }),
            FilterPlan::Hybrid { predicate, lookup } => {
                let (ids, round_trips) = self.page_lookup(subject, lookup, consistency).await?;
                Ok(PlanOutcome {
                    predicate: Some(predicate.clone()),
                    resource_ids: Some(ids),
                    observation: PlanObservation {
                        strategy: "hybrid".to_string(),
                        round_trips,
                    },
                })
            }
            FilterPlan::Lookup(lookup) => {
                let (ids, round_trips) = self.page_lookup(subject, lookup, consistency).await?;
                Ok(PlanOutcome {
                    predicate: None,
                    resource_ids: Some(ids),
                    observation: PlanObservation {
                        strategy: "lookup".to_string(),
                        round_trips,
                    },
                })
            }
        }
    }

    async fn page_lookup(
        &self,
        subject: &SubjectRef,
        lookup: &LookupSpec,
        consistency: &ConsistencyMode,
    ) -> Result<(Vec<String>, u32)> {
        let mut ids = Vec::new();
        let mut page_token: Option<String> = None;
        let mut round_trips = 0u32;
        loop {
            if round_trips >= self.config.max_lookup_pages {
                // A result set this large is a modelling problem; refusing
                // beats silently truncating.
                return Err(RebacError::misconfig(format!(
                    "reverse lookup for '{}' on '{}' exceeded {} pages",
                    lookup.permission, lookup.object_type, self.config.max_lookup_pages
                )));
            }
            let page = self
                .store
                .lookup_resources(
                    subject,
                    &lookup.permission,
                    &lookup.object_type,
                    page_token.as_deref(),
                    consistency,
                )
                .await?;
            round_trips += 1;
            ids.extend(page.ids);
            match page.next_page_token {
                Some(token) => page_token = Some(token),
                None => break,
            }
        }
        Ok((ids, round_trips))
    }
}

/// Classifies one disjunct: a field-bound relation on the queried type
/// becomes a predicate clause; anything else goes through the store.
fn classify(
    schema: &TypeSchema,
    disjunct: &PermissionExpr,
    subject: &SubjectRef,
    memberships: &Memberships,
) -> ClauseOutcome {
    let PermissionExpr::Relation(relation) = disjunct else {
        // Inherited references follow edges the record table cannot see.
        return ClauseOutcome::NeedsLookup;
    };
    let Some(binding) = schema.bindings.get(relation) else {
        return ClauseOutcome::NeedsLookup;
    };
    // Userset subjects never reach here: field binding is rejected for
    // them at registration.
    let Some(target_type) = schema.subject_type_of(relation) else {
        return ClauseOutcome::NeedsLookup;
    };

    match binding.kind {
        BindingKind::SingleReference => {
            if subject.relation.is_none() && target_type == subject.subject_type {
                return ClauseOutcome::Clause(PredicateClause::FieldEquals {
                    field: binding.field.clone(),
                    value: subject.subject_id.clone(),
                });
            }
            // A reference to an intermediary (e.g. group) is pushable when
            // the caller supplied the subject's memberships in it. An
            // empty membership set still pushes down and matches nothing.
            if let Some(ids) = memberships.get(target_type) {
                return ClauseOutcome::Clause(PredicateClause::FieldIn {
                    field: binding.field.clone(),
                    values: ids.to_vec(),
                });
            }
            ClauseOutcome::NeedsLookup
        }
        BindingKind::MultiReference | BindingKind::Computed => {
            if subject.relation.is_none() && target_type == subject.subject_type {
                return ClauseOutcome::Clause(PredicateClause::FieldContains {
                    field: binding.field.clone(),
                    value: subject.subject_id.clone(),
                });
            }
            ClauseOutcome::NeedsLookup
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::adapter::InMemoryRelationshipStore;
    use crate::graph::TypeDefinition;

    fn graph() -> Arc<PolicyGraph> {
        Arc::new(
            PolicyGraph::register(vec![
                TypeDefinition::new("document")
                    .relation("owner", "user")
                    .relation("team", "group")
                    .relation("editors", "user")
                    .relation("parent", "folder")
                    .permission("edit", "owner + editors")
                    .permission("view", "owner + team + parent->view")
                    .parent("parent")
                    .binding("owner", "owner_id", BindingKind::SingleReference)
                    .binding("team", "team_id", BindingKind::SingleReference)
                    .binding("editors", "editor_ids", BindingKind::MultiReference),
                TypeDefinition::new("folder")
                    .relation("owner", "user")
                    .permission("view", "owner")
                    .binding("owner", "owner_id", BindingKind::SingleReference),
            ])
            .unwrap(),
        )
    }

    fn planner(graph: Arc<PolicyGraph>) -> AccessibleByPlanner {
        let store = Arc::new(InMemoryRelationshipStore::new(graph.clone()));
        AccessibleByPlanner::new(graph, store, PlannerConfig::default())
    }

    #[test]
    fn test_direct_plan_for_bound_relations() {
        let graph = graph();
        let planner = planner(graph);
        let plan = planner
            .plan(
                &SubjectRef::user("u1"),
                "edit",
                "document",
                &Memberships::new(),
                None,
            )
            .unwrap();
        let FilterPlan::Direct(predicate) = plan else {
            panic!("expected direct plan");
        };
        assert!(predicate.any_of.contains(&PredicateClause::FieldEquals {
            field: "owner_id".to_string(),
            value: "u1".to_string(),
        }));
        assert!(predicate.any_of.contains(&PredicateClause::FieldContains {
            field: "editor_ids".to_string(),
            value: "u1".to_string(),
        }));
    }

    #[test]
    fn test_memberships_turn_reference_into_field_in() {
        let graph = graph();
        let planner = planner(graph);
        let memberships = Memberships::new().with("group", vec!["g1".to_string(), "g2".to_string()]);
        let plan = planner
            .plan(
                &SubjectRef::user("u1"),
                "view",
                "document",
                &memberships,
                None,
            )
            .unwrap();
        // parent->view still needs the store, so the plan is hybrid.
        let FilterPlan::Hybrid { predicate, lookup } = plan else {
            panic!("expected hybrid plan");
        };
        assert!(predicate.any_of.contains(&PredicateClause::FieldIn {
            field: "team_id".to_string(),
            values: vec!["g1".to_string(), "g2".to_string()],
        }));
        assert_eq!(lookup.permission, "view");
    }

    #[test]
    fn test_missing_memberships_fall_back_to_lookup_leg() {
        let graph = graph();
        let planner = planner(graph);
        let plan = planner
            .plan(
                &SubjectRef::user("u1"),
                "view",
                "document",
                &Memberships::new(),
                None,
            )
            .unwrap();
        assert!(matches!(plan, FilterPlan::Hybrid { .. }));
    }

    #[test]
    fn test_force_lookup_hint() {
        let graph = graph();
        let planner = planner(graph);
        let plan = planner
            .plan(
                &SubjectRef::user("u1"),
                "edit",
                "document",
                &Memberships::new(),
                Some(PlanHint::ForceLookup),
            )
            .unwrap();
        assert!(matches!(plan, FilterPlan::Lookup(_)));
    }

    #[test]
    fn test_force_direct_fails_on_inherited() {
        let graph = graph();
        let planner = planner(graph);
        let result = planner.plan(
            &SubjectRef::user("u1"),
            "view",
            "document",
            &Memberships::new(),
            Some(PlanHint::ForceDirect),
        );
        assert!(matches!(result, Err(RebacError::PolicyMisconfig { .. })));
    }

    #[test]
    fn test_clause_limit_degrades_to_lookup() {
        let graph = graph();
        let store = Arc::new(InMemoryRelationshipStore::new(graph.clone()));
        let planner = AccessibleByPlanner::new(
            graph,
            store,
            PlannerConfig {
                max_lookup_pages: 50,
                direct_clause_limit: 1,
            },
        );
        let plan = planner
            .plan(
                &SubjectRef::user("u1"),
                "edit",
                "document",
                &Memberships::new(),
                None,
            )
            .unwrap();
        assert!(matches!(plan, FilterPlan::Lookup(_)));
    }

    #[tokio::test]
    async fn test_direct_execution_costs_zero_round_trips() {
        let graph = graph();
        let planner = planner(graph);
        let plan = planner
            .plan(
                &SubjectRef::user("u1"),
                "edit",
                "document",
                &Memberships::new(),
                None,
            )
            .unwrap();
        let outcome = planner
            .execute(&SubjectRef::user("u1"), &plan, &ConsistencyMode::default())
            .await
            .unwrap();
        assert_eq!(outcome.observation.round_trips, 0);
        assert!(outcome.predicate.is_some());
        assert!(outcome.resource_ids.is_none());
    }

    #[tokio::test]
    async fn test_lookup_execution_pages_to_completion() {
        let graph = graph();
        let store = Arc::new(InMemoryRelationshipStore::new(graph.clone()).with_page_size(2));
        for i in 0..5 {
            store
                .write_tuples(&[TupleWrite::new(TupleKey::new(
                    ObjectRef::new("folder", &format!("f{i}")),
                    "owner",
                    SubjectRef::user("u1"),
                ))])
                .await
                .unwrap();
        }
        let planner = AccessibleByPlanner::new(graph, store, PlannerConfig::default());

        let plan = FilterPlan::Lookup(LookupSpec {
            object_type: "folder".to_string(),
            permission: "view".to_string(),
        });
        let outcome = planner
            .execute(&SubjectRef::user("u1"), &plan, &ConsistencyMode::default())
            .await
            .unwrap();
        let ids = outcome.resource_ids.unwrap();
        assert_eq!(ids.len(), 5);
        assert!(outcome.observation.round_trips >= 3);
    }

    #[tokio::test]
    async fn test_page_ceiling_enforced() {
        let graph = graph();
        let store = Arc::new(InMemoryRelationshipStore::new(graph.clone()).with_page_size(1));
        for i in 0..4 {
            store
                .write_tuples(&[TupleWrite::new(TupleKey::new(
                    ObjectRef::new("folder", &format!("f{i}")),
                    "owner",
                    SubjectRef::user("u1"),
                ))])
                .await
                .unwrap();
        }
        let planner = AccessibleByPlanner::new(
            graph,
            store,
            PlannerConfig {
                max_lookup_pages: 2,
                direct_clause_limit: 8,
            },
        );
        let plan = FilterPlan::Lookup(LookupSpec {
            object_type: "folder".to_string(),
            permission: "view".to_string(),
        });
        let result = planner
            .execute(&SubjectRef::user("u1"), &plan, &ConsistencyMode::default())
            .await;
        assert!(matches!(result, Err(RebacError::PolicyMisconfig { .. })));
    }
}
