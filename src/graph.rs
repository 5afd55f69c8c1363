use crate::error::{ConfigError, Result};
use petgraph::algo::toposort;
use petgraph::graph::{DiGraph, NodeIndex};
use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};
use std::collections::{BTreeMap, HashMap, HashSet};
use std::fmt;
use tracing::debug;

/// How a record field drives tuple derivation for a relation.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum BindingKind {
    /// Foreign-key style field: one referenced id, nullable.
    SingleReference,
    /// Membership style field: many referenced ids.
    MultiReference,
    /// Externally computed membership, delivered like a multi-reference.
    Computed,
}

/// Maps one record field to a relation on the same type.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Binding {
    pub field: String,
    pub kind: BindingKind,
}

impl Binding {
    pub fn new(field: &str, kind: BindingKind) -> Self {
        Self {
            field: field.to_string(),
            kind,
        }
    }
}

/// Permission rewrite expression. Built once at registration; evaluation
/// and planning walk the tree instead of re-parsing text per check.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub enum PermissionExpr {
    /// Reference to a relation (or, before normalization, to another
    /// permission on the same type).
    Relation(String),
    /// Inherited permission on the subject of a relation
    /// (`parent->view`).
    Inherited { relation: String, permission: String },
    /// Union of alternatives.
    Union(Vec<PermissionExpr>),
}

impl PermissionExpr {
    /// Parses the `a + b->c` text form used in declarations.
    fn parse(text: &str) -> std::result::Result<Self, String> {
        let mut terms = Vec::new();
        for raw in text.split('+') {
            let term = raw.trim();
            if term.is_empty() {
                return Err("empty term".to_string());
            }
            if let Some((relation, permission)) = term.split_once("->") {
                let relation = relation.trim();
                let permission = permission.trim();
                if relation.is_empty() || permission.is_empty() {
                    return Err(format!("malformed inherited reference '{term}'"));
                }
                terms.push(PermissionExpr::Inherited {
                    relation: relation.to_string(),
                    permission: permission.to_string(),
                });
            } else {
                terms.push(PermissionExpr::Relation(term.to_string()));
            }
        }
        if terms.len() == 1 {
            return Ok(terms.remove(0));
        }
        Ok(PermissionExpr::Union(terms))
    }

    /// Flattened union operands (a leaf yields itself).
    pub fn disjuncts(&self) -> Vec<&PermissionExpr> {
        match self {
            PermissionExpr::Union(children) => {
                children.iter().flat_map(|c| c.disjuncts()).collect()
            }
            leaf => vec![leaf],
        }
    }
}

impl fmt::Display for PermissionExpr {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            PermissionExpr::Relation(name) => write!(f, "{name}"),
            PermissionExpr::Inherited {
                relation,
                permission,
            } => write!(f, "{relation}->{permission}"),
            PermissionExpr::Union(children) => {
                let mut rendered: Vec<String> =
                    children.iter().map(|c| c.to_string()).collect();
                rendered.sort();
                write!(f, "{}", rendered.join(" + "))
            }
        }
    }
}

/// Declarative definition of one authorizable type.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct TypeDefinition {
    pub name: String,
    /// Identifier of the backing record model, when the type mirrors one.
    pub record_model: Option<String>,
    /// relation name -> subject type constraint (`user`, `group#member`, ...)
    pub relations: BTreeMap<String, String>,
    /// permission name -> expression text (`owner + parent->view`)
    pub permissions: BTreeMap<String, String>,
    /// Relation used for `parent->permission` traversal.
    pub parent_relation: Option<String>,
    /// relation name -> field binding driving tuple derivation.
    pub bindings: BTreeMap<String, Binding>,
}

impl TypeDefinition {
    pub fn new(name: &str) -> Self {
        Self {
            name: name.to_string(),
            record_model: None,
            relations: BTreeMap::new(),
            permissions: BTreeMap::new(),
            parent_relation: None,
            bindings: BTreeMap::new(),
        }
    }

    pub fn model(mut self, path: &str) -> Self {
        self.record_model = Some(path.to_string());
        self
    }

    pub fn relation(mut self, name: &str, subject_type: &str) -> Self {
        self.relations
            .insert(name.to_string(), subject_type.to_string());
        self
    }

    pub fn permission(mut self, name: &str, expression: &str) -> Self {
        self.permissions
            .insert(name.to_string(), expression.to_string());
        self
    }

    pub fn parent(mut self, relation: &str) -> Self {
        self.parent_relation = Some(relation.to_string());
        self
    }

    pub fn binding(mut self, relation: &str, field: &str, kind: BindingKind) -> Self {
        self.bindings
            .insert(relation.to_string(), Binding::new(field, kind));
        self
    }
}

/// Validated, normalized form of one type.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct TypeSchema {
    pub name: String,
    pub record_model: Option<String>,
    pub relations: BTreeMap<String, String>,
    /// Normalized expressions: unions flattened, same-type permission
    /// references inlined.
    pub permissions: BTreeMap<String, PermissionExpr>,
    pub parent_relation: Option<String>,
    pub bindings: BTreeMap<String, Binding>,
}

impl TypeSchema {
    /// Base subject type of a relation, with the userset relation
    /// stripped (`group#member` -> `group`).
    pub fn subject_type_of(&self, relation: &str) -> Option<&str> {
        self.relations
            .get(relation)
            .map(|c| subject_base(c).0)
    }
}

/// Deterministic schema artifact handed to `publish_schema`.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct CompiledSchema {
    pub text: String,
    pub hash: String,
}

/// Immutable registry of validated type definitions.
///
/// Built once per publish cycle through [`PolicyGraph::register`]; a failed
/// registration returns an error and the caller keeps whatever graph was
/// previously active (compile-validate-swap, never in place).
#[derive(Debug, Clone)]
pub struct PolicyGraph {
    types: BTreeMap<String, TypeSchema>,
    /// Types ordered so that every parent target precedes its children.
    parent_order: Vec<String>,
}

impl PolicyGraph {
    /// Validates and builds a graph from a batch of definitions. Any
    /// single invalid type rejects the entire batch.
    pub fn register(definitions: Vec<TypeDefinition>) -> Result<Self> {
        let mut defs: BTreeMap<String, TypeDefinition> = BTreeMap::new();
        for def in definitions {
            if defs.contains_key(&def.name) {
                return Err(ConfigError::DuplicateType {
                    type_name: def.name,
                }
                .into());
            }
            defs.insert(def.name.clone(), def);
        }

        // First pass: per-type structural checks and expression parsing.
        // Forward references across types are legal within one batch, so
        // cross-type checks wait for the second pass.
        let mut parsed: BTreeMap<String, BTreeMap<String, PermissionExpr>> = BTreeMap::new();
        for def in defs.values() {
            if let Some(ref parent) = def.parent_relation {
                if !def.relations.contains_key(parent) {
                    return Err(ConfigError::UnknownRelation {
                        type_name: def.name.clone(),
                        relation: parent.clone(),
                    }
                    .into());
                }
            }

            for (relation, binding) in &def.bindings {
                let Some(constraint) = def.relations.get(relation) else {
                    return Err(ConfigError::InvalidBinding {
                        type_name: def.name.clone(),
                        relation: relation.clone(),
                        reason: "binding names an undeclared relation".to_string(),
                    }
                    .into());
                };
                if subject_base(constraint).1.is_some() {
                    return Err(ConfigError::InvalidBinding {
                        type_name: def.name.clone(),
                        relation: relation.clone(),
                        reason: "userset subjects cannot be field-bound".to_string(),
                    }
                    .into());
                }
                if binding.field.is_empty() {
                    return Err(ConfigError::InvalidBinding {
                        type_name: def.name.clone(),
                        relation: relation.clone(),
                        reason: "empty field name".to_string(),
                    }
                    .into());
                }
            }

            let mut exprs = BTreeMap::new();
            for (permission, text) in &def.permissions {
                let expr = PermissionExpr::parse(text).map_err(|reason| {
                    ConfigError::InvalidExpression {
                        type_name: def.name.clone(),
                        permission: permission.clone(),
                        reason,
                    }
                })?;
                for leaf in expr.disjuncts() {
                    match leaf {
                        PermissionExpr::Relation(name) => {
                            if !def.relations.contains_key(name)
                                && !def.permissions.contains_key(name)
                            {
                                return Err(ConfigError::UnknownRelation {
                                    type_name: def.name.clone(),
                                    relation: name.clone(),
                                }
                                .into());
                            }
                        }
                        PermissionExpr::Inherited { relation, .. } => {
                            if !def.relations.contains_key(relation) {
                                return Err(ConfigError::UnknownRelation {
                                    type_name: def.name.clone(),
                                    relation: relation.clone(),
                                }
                                .into());
                            }
                        }
                        PermissionExpr::Union(_) => {}
                    }
                }
                exprs.insert(permission.clone(), expr);
            }
            parsed.insert(def.name.clone(), exprs);
        }

        // Second pass: inherited references must land on a permission (or
        // relation) declared by the target type.
        for def in defs.values() {
            let exprs = &parsed[&def.name];
            for expr in exprs.values() {
                for leaf in expr.disjuncts() {
                    if let PermissionExpr::Inherited {
                        relation,
                        permission,
                    } = leaf
                    {
                        let constraint = &def.relations[relation];
                        let target = subject_base(constraint).0;
                        let resolvable = defs.get(target).is_some_and(|t| {
                            t.permissions.contains_key(permission)
                                || t.relations.contains_key(permission)
                        });
                        if !resolvable {
                            return Err(ConfigError::UnknownPermission {
                                type_name: def.name.clone(),
                                permission: permission.clone(),
                            }
                            .into());
                        }
                    }
                }
            }
        }

        // Normalize: inline same-type permission references, flatten
        // unions, guard against self-referential permissions.
        let mut types = BTreeMap::new();
        for def in defs.values() {
            let exprs = &parsed[&def.name];
            let mut normalized = BTreeMap::new();
            for permission in exprs.keys() {
                let mut stack = HashSet::new();
                let expr = normalize(&def.name, permission, exprs, &def.relations, &mut stack)?;
                normalized.insert(permission.clone(), expr);
            }
            types.insert(
                def.name.clone(),
                TypeSchema {
                    name: def.name.clone(),
                    record_model: def.record_model.clone(),
                    relations: def.relations.clone(),
                    permissions: normalized,
                    parent_relation: def.parent_relation.clone(),
                    bindings: def.bindings.clone(),
                },
            );
        }

        let parent_order = validate_parent_edges(&types)?;
        debug!(types = types.len(), "policy graph registered");
        Ok(Self {
            types,
            parent_order,
        })
    }

    pub fn types(&self) -> impl Iterator<Item = &TypeSchema> {
        self.types.values()
    }

    pub fn get(&self, type_name: &str) -> Option<&TypeSchema> {
        self.types.get(type_name)
    }

    /// Types ordered parents-first; useful for traversal without
    /// recursion at evaluation time.
    pub fn parent_order(&self) -> &[String] {
        &self.parent_order
    }

    /// Reverse lookup from a record model identifier to its type name.
    pub fn type_for_model(&self, model: &str) -> Option<&str> {
        self.types
            .values()
            .find(|t| t.record_model.as_deref() == Some(model))
            .map(|t| t.name.as_str())
    }

    /// Returns the normalized expression for a permission. A declared
    /// relation resolves to a relation leaf so callers can check either.
    pub fn resolve_permission(&self, type_name: &str, name: &str) -> Result<PermissionExpr> {
        let schema = self.types.get(type_name).ok_or_else(|| ConfigError::UnknownPermission {
            type_name: type_name.to_string(),
            permission: name.to_string(),
        })?;
        if let Some(expr) = schema.permissions.get(name) {
            return Ok(expr.clone());
        }
        if schema.relations.contains_key(name) {
            return Ok(PermissionExpr::Relation(name.to_string()));
        }
        Err(ConfigError::UnknownPermission {
            type_name: type_name.to_string(),
            permission: name.to_string(),
        }
        .into())
    }

    /// Emits the deterministic schema text plus its content hash. Pure
    /// function of the registered definitions; reordering declarations
    /// does not change the hash.
    pub fn compile(&self) -> CompiledSchema {
        let mut sections = Vec::new();
        for schema in self.types.values() {
            let mut lines = vec![format!("type {}", schema.name)];
            if !schema.relations.is_empty() {
                lines.push("  relations".to_string());
                for (name, subject) in &schema.relations {
                    lines.push(format!("    define {name}: {subject}"));
                }
            }
            if !schema.permissions.is_empty() {
                lines.push("  permissions".to_string());
                for (name, expr) in &schema.permissions {
                    lines.push(format!("    define {name}: {expr}"));
                }
            }
            if let Some(ref parent) = schema.parent_relation {
                lines.push(format!("  parent {parent}"));
            }
            sections.push(lines.join("\n"));
        }
        let text = sections.join("\n\n");
        let digest = Sha256::digest(text.as_bytes());
        let hash: String = digest.iter().map(|b| format!("{b:02x}")).collect();
        CompiledSchema { text, hash }
    }
}

fn normalize(
    type_name: &str,
    permission: &str,
    exprs: &BTreeMap<String, PermissionExpr>,
    relations: &BTreeMap<String, String>,
    stack: &mut HashSet<String>,
) -> Result<PermissionExpr> {
    if !stack.insert(permission.to_string()) {
        return Err(ConfigError::CyclicPermission {
            type_name: type_name.to_string(),
            permission: permission.to_string(),
        }
        .into());
    }
    let expr = &exprs[permission];
    let mut flat = Vec::new();
    for leaf in expr.disjuncts() {
        match leaf {
            PermissionExpr::Relation(name) => {
                if relations.contains_key(name) {
                    flat.push(PermissionExpr::Relation(name.clone()));
                } else {
                    // Same-type permission reference: inline its
                    // normalized expansion.
                    let inner = normalize(type_name, name, exprs, relations, stack)?;
                    flat.extend(inner.disjuncts().into_iter().cloned());
                }
            }
            other => flat.push(other.clone()),
        }
    }
    stack.remove(permission);
    flat.sort_by_key(|e| e.to_string());
    flat.dedup();
    if flat.len() == 1 {
        return Ok(flat.remove(0));
    }
    Ok(PermissionExpr::Union(flat))
}

/// Builds the cross-type parent-edge graph and rejects cycles. A type
/// whose parent relation points back at itself (folder in folder) is a
/// hierarchy of instances, not a type cycle, and is allowed.
fn validate_parent_edges(types: &BTreeMap<String, TypeSchema>) -> Result<Vec<String>> {
    let mut graph: DiGraph<&str, ()> = DiGraph::new();
    let mut nodes: HashMap<&str, NodeIndex> = HashMap::new();
    for name in types.keys() {
        nodes.insert(name.as_str(), graph.add_node(name.as_str()));
    }
    for schema in types.values() {
        if let Some(ref parent) = schema.parent_relation {
            let Some(target) = schema.subject_type_of(parent) else {
                continue;
            };
            if target == schema.name {
                continue;
            }
            if let (Some(&from), Some(&to)) =
                (nodes.get(schema.name.as_str()), nodes.get(target))
            {
                graph.add_edge(from, to, ());
            }
        }
    }
    match toposort(&graph, None) {
        Ok(order) => {
            // Parents come last in petgraph's order (edges point child ->
            // parent), so reverse for a parents-first table.
            let mut names: Vec<String> =
                order.into_iter().map(|n| graph[n].to_string()).collect();
            names.reverse();
            Ok(names)
        }
        Err(cycle) => Err(ConfigError::CyclicParent {
            type_name: graph[cycle.node_id()].to_string(),
        }
        .into()),
    }
}

fn subject_base(constraint: &str) -> (&str, Option<&str>) {
    match constraint.split_once('#') {
        Some((base, relation)) => (base, Some(relation)),
        None => (constraint, None),
    }
}
