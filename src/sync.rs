use crate::adapter::RelationshipStore;
use crate::error::{RebacError, Result};
use crate::graph::{BindingKind, PolicyGraph, TypeSchema};
use crate::models::*;
use crate::outbox::{OutboxStore, TupleBatch};
use std::collections::BTreeSet;
use std::sync::Arc;
use tracing::{debug, warn};

const BACKFILL_BATCH_SIZE: usize = 100;

/// Translates record-level create/update/delete events into tuple
/// mutation batches and forwards them to the relationship store.
///
/// Effectively-exactly-once: tuple identity is the 5-tuple key, so
/// re-sending a batch is a no-op at the store and the synchronizer never
/// deduplicates before sending. In outbox mode batches are appended to a
/// durable [`OutboxStore`] instead of being sent inline.
pub struct TupleSynchronizer {
    graph: Arc<PolicyGraph>,
    store: Arc<dyn RelationshipStore>,
    outbox: Option<Arc<dyn OutboxStore>>,
}

impl TupleSynchronizer {
    pub fn new(graph: Arc<PolicyGraph>, store: Arc<dyn RelationshipStore>) -> Self {
        Self {
            graph,
            store,
            outbox: None,
        }
    }

    pub fn with_outbox(mut self, outbox: Arc<dyn OutboxStore>) -> Self {
        self.outbox = Some(outbox);
        self
    }

    /// Dispatches one record event to the matching handler.
    pub async fn apply(&self, event: &RecordEvent) -> Result<Option<ConsistencyToken>> {
        match event.op {
            RecordOp::Create => {
                self.on_create(&event.type_name, &event.record_id, &event.current)
                    .await
            }
            RecordOp::Update => {
                self.on_update(
                    &event.type_name,
                    &event.record_id,
                    &event.previous,
                    &event.current,
                )
                .await
            }
            RecordOp::Delete => {
                self.on_delete(&event.type_name, &event.record_id, &event.previous)
                    .await
            }
        }
    }

    pub async fn on_create(
        &self,
        type_name: &str,
        record_id: &str,
        values: &FieldValues,
    ) -> Result<Option<ConsistencyToken>> {
        let schema = self.schema(type_name)?;
        let writes = derive_writes(schema, record_id, values);
        self.dispatch(
            type_name,
            record_id,
            TupleBatch {
                deletes: vec![],
                writes,
            },
        )
        .await
    }

    /// `previous` must be captured before the mutation hits the record
    /// store; overwritten fields are otherwise unrecoverable.
    pub async fn on_update(
        &self,
        type_name: &str,
        record_id: &str,
        previous: &FieldValues,
        current: &FieldValues,
    ) -> Result<Option<ConsistencyToken>> {
        let schema = self.schema(type_name)?;
        let object = ObjectRef::new(type_name, record_id);
        let mut deletes = Vec::new();
        let mut writes = Vec::new();

        for (relation, binding) in &schema.bindings {
            let Some(subject_type) = schema.subject_type_of(relation) else {
                continue;
            };
            let old = member_ids(previous.get(binding.field.as_str()), binding.kind);
            let new = member_ids(current.get(binding.field.as_str()), binding.kind);

            // Symmetric difference; for a single-reference change this is
            // exactly one delete (old edge) followed by one write (new).
            for id in old.difference(&new) {
                deletes.push(TupleKey::new(
                    object.clone(),
                    relation,
                    SubjectRef::new(subject_type, id),
                ));
            }
            for id in new.difference(&old) {
                writes.push(TupleWrite::new(TupleKey::new(
                    object.clone(),
                    relation,
                    SubjectRef::new(subject_type, id),
                )));
            }
        }

        self.dispatch(type_name, record_id, TupleBatch { deletes, writes })
            .await
    }

    /// Removes every binding-derived edge of the record plus every
    /// inbound edge where the record is the subject (membership rows on
    /// other objects).
    pub async fn on_delete(
        &self,
        type_name: &str,
        record_id: &str,
        last_values: &FieldValues,
    ) -> Result<Option<ConsistencyToken>> {
        let schema = self.schema(type_name)?;
        let mut deletes: Vec<TupleKey> = derive_writes(schema, record_id, last_values)
            .into_iter()
            .map(|w| w.key)
            .collect();

        deletes.extend(self.inbound_edges(type_name, record_id).await?);
        self.dispatch(
            type_name,
            record_id,
            TupleBatch {
                deletes,
                writes: vec![],
            },
        )
        .await
    }

    /// Re-derives and re-writes all binding tuples for the given records.
    /// Idempotent at the store; used after a divergence window or for an
    /// initial backfill.
    pub async fn backfill(
        &self,
        type_name: &str,
        records: &[(String, FieldValues)],
    ) -> Result<usize> {
        let schema = self.schema(type_name)?;
        let mut buffer = Vec::new();
        let mut total = 0;
        for (record_id, values) in records {
            buffer.extend(derive_writes(schema, record_id, values));
            if buffer.len() >= BACKFILL_BATCH_SIZE {
                total += buffer.len();
                self.send_writes(type_name, &buffer).await?;
                buffer.clear();
            }
        }
        if !buffer.is_empty() {
            total += buffer.len();
            self.send_writes(type_name, &buffer).await?;
        }
        debug!(type_name, total, "backfill complete");
        Ok(total)
    }

    fn schema(&self, type_name: &str) -> Result<&TypeSchema> {
        self.graph.get(type_name).ok_or_else(|| {
            RebacError::misconfig(format!("no type registered for '{type_name}'"))
        })
    }

    /// Finds edges on other objects that point at this record, using the
    /// adapter's reverse lookup per (type, relation) whose subject
    /// constraint matches.
    async fn inbound_edges(&self, type_name: &str, record_id: &str) -> Result<Vec<TupleKey>> {
        let subject = SubjectRef::new(type_name, record_id);
        let mut keys = Vec::new();
        for schema in self.graph.types() {
            for relation in schema.relations.keys() {
                if schema.subject_type_of(relation) != Some(type_name) {
                    continue;
                }
                let mut page_token: Option<String> = None;
                loop {
                    let page = self
                        .store
                        .lookup_resources(
                            &subject,
                            relation,
                            &schema.name,
                            page_token.as_deref(),
                            &ConsistencyMode::FullyConsistent,
                        )
                        .await?;
                    for id in &page.ids {
                        keys.push(TupleKey::new(
                            ObjectRef::new(&schema.name, id),
                            relation,
                            subject.clone(),
                        ));
                    }
                    match page.next_page_token {
                        Some(token) => page_token = Some(token),
                        None => break,
                    }
                }
            }
        }
        Ok(keys)
    }

    async fn dispatch(
        &self,
        type_name: &str,
        record_id: &str,
        batch: TupleBatch,
    ) -> Result<Option<ConsistencyToken>> {
        if batch.is_empty() {
            return Ok(None);
        }

        if let Some(ref outbox) = self.outbox {
            let object = ObjectRef::new(type_name, record_id);
            outbox.append(object, batch).await?;
            return Ok(None);
        }

        let mut token = None;
        if !batch.deletes.is_empty() {
            token = Some(
                self.store
                    .delete_tuples(&batch.deletes)
                    .await
                    .map_err(|err| self.sync_error(type_name, record_id, &err))?,
            );
        }
        if !batch.writes.is_empty() {
            token = Some(
                self.store
                    .write_tuples(&batch.writes)
                    .await
                    .map_err(|err| self.sync_error(type_name, record_id, &err))?,
            );
        }
        Ok(token)
    }

    async fn send_writes(&self, type_name: &str, writes: &[TupleWrite]) -> Result<()> {
        self.store
            .write_tuples(writes)
            .await
            .map_err(|err| self.sync_error(type_name, "<backfill>", &err))?;
        Ok(())
    }

    /// The record store and relationship store are now divergent until a
    /// repair pass runs; surfaced, never swallowed.
    fn sync_error(&self, type_name: &str, record_id: &str, err: &RebacError) -> RebacError {
        warn!(type_name, record_id, error = %err, "tuple sync failed, stores divergent");
        RebacError::Sync {
            type_name: type_name.to_string(),
            record_id: record_id.to_string(),
            reason: err.to_string(),
        }
    }
}

fn derive_writes(schema: &TypeSchema, record_id: &str, values: &FieldValues) -> Vec<TupleWrite> {
    let object = ObjectRef::new(&schema.name, record_id);
    let mut writes = Vec::new();
    for (relation, binding) in &schema.bindings {
        let Some(subject_type) = schema.subject_type_of(relation) else {
            continue;
        };
        for id in member_ids(values.get(binding.field.as_str()), binding.kind) {
            writes.push(TupleWrite::new(TupleKey::new(
                object.clone(),
                relation,
                SubjectRef::new(subject_type, &id),
            )));
        }
    }
    writes
}

/// Current member ids of a bound field: zero or one for a
/// single-reference, the member set otherwise.
fn member_ids(value: Option<&FieldValue>, kind: BindingKind) -> BTreeSet<String> {
    match (kind, value) {
        (BindingKind::SingleReference, Some(FieldValue::Reference(Some(id)))) => {
            BTreeSet::from([id.clone()])
        }
        (BindingKind::SingleReference, _) => BTreeSet::new(),
        (
            BindingKind::MultiReference | BindingKind::Computed,
            Some(FieldValue::References(ids)),
        ) => ids.iter().cloned().collect(),
        (BindingKind::MultiReference | BindingKind::Computed, _) => BTreeSet::new(),
    }
}
