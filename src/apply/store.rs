//! Record store writer: the first stage of every chain.

use std::sync::Arc;

use rustc_hash::FxHashSet;
use tracing::trace;

use crate::apply::batch::BatchContext;
use crate::apply::command::{Command, CommandMode, RecordCommand, TransactionToApply};
use crate::apply::{dispatch, ApplicationMode, TransactionApplier};
use crate::ids::IdUpdates;
use crate::locking::verify::CommandVerifier;
use crate::locking::LockClient;
use crate::schema::SchemaCache;
use crate::storage::record::{
    GroupRecord, IdType, NodeRecord, PropertyRecord, Record, RelationshipRecord, SchemaRecord,
    TokenKind, TokenRecord,
};
use crate::storage::store::{RecordStore, Stores};
use crate::types::Result;

/// Writes command images to the record stores, keeps the schema cache in
/// step with schema commands and collects id updates for the batch.
pub struct StoreApplier {
    stores: Stores,
    schema: Arc<SchemaCache>,
    mode: ApplicationMode,
    verifier: Arc<dyn CommandVerifier>,
    locks: Option<Arc<dyn LockClient>>,
    id_updates: IdUpdates,
    written: usize,
}

impl StoreApplier {
    /// Writer over `stores` applying in `mode`.
    pub fn new(
        stores: Stores,
        schema: Arc<SchemaCache>,
        mode: ApplicationMode,
        verifier: Arc<dyn CommandVerifier>,
    ) -> Self {
        Self {
            stores,
            schema,
            mode,
            verifier,
            locks: None,
            id_updates: IdUpdates::default(),
            written: 0,
        }
    }

    fn write<R: Record>(
        &mut self,
        store: &dyn RecordStore<R>,
        id_type: IdType,
        command: &RecordCommand<R>,
    ) -> Result<()> {
        let image = if self.mode.is_reverse() {
            &command.before
        } else {
            &command.after
        };
        if image.is_light() {
            // Overflow content did not change; keep what the store holds.
            let mut heavy = image.clone();
            store.ensure_heavy(&mut heavy)?;
            store.update_record(&heavy)?;
        } else {
            store.update_record(image)?;
        }
        self.written += 1;
        if self.mode.needs_id_updates() {
            self.track_ids(id_type, command);
        }
        Ok(())
    }

    fn track_ids<R: Record>(&mut self, id_type: IdType, command: &RecordCommand<R>) {
        match command.mode() {
            CommandMode::Create => self.id_updates.used(id_type, command.id()),
            CommandMode::Delete => self.id_updates.deleted(id_type, command.id()),
            CommandMode::Update => {}
        }
        let Some(dynamic) = R::DYNAMIC_ID_TYPE else {
            return;
        };
        if command.before.is_light() || command.after.is_light() {
            return;
        }
        let mut before = FxHashSet::default();
        command.before.for_each_dynamic_id(&mut |id| {
            before.insert(id);
        });
        let mut after = FxHashSet::default();
        command.after.for_each_dynamic_id(&mut |id| {
            after.insert(id);
        });
        let mut used: Vec<u64> = after.difference(&before).copied().collect();
        let mut deleted: Vec<u64> = before.difference(&after).copied().collect();
        used.sort_unstable();
        deleted.sort_unstable();
        for id in used {
            self.id_updates.used(dynamic, id);
        }
        for id in deleted {
            self.id_updates.deleted(dynamic, id);
        }
    }
}

impl TransactionApplier for StoreApplier {
    fn name(&self) -> &'static str {
        "store"
    }

    fn begin(&mut self, tx: &TransactionToApply) -> Result<()> {
        self.locks = tx.locks.clone();
        self.written = 0;
        Ok(())
    }

    fn visit(&mut self, command: &Command, batch: &mut BatchContext) -> Result<()> {
        if !self.mode.is_reverse() {
            self.verifier
                .verify(&self.stores, command, self.locks.as_deref())?;
        }
        dispatch(self, command, batch)
    }

    fn visit_node(&mut self, command: &RecordCommand<NodeRecord>) -> Result<()> {
        let store = Arc::clone(&self.stores.nodes);
        self.write(&*store, IdType::Node, command)
    }

    fn visit_relationship(&mut self, command: &RecordCommand<RelationshipRecord>) -> Result<()> {
        let store = Arc::clone(&self.stores.relationships);
        self.write(&*store, IdType::Relationship, command)
    }

    fn visit_group(&mut self, command: &RecordCommand<GroupRecord>) -> Result<()> {
        let store = Arc::clone(&self.stores.groups);
        self.write(&*store, IdType::RelationshipGroup, command)
    }

    fn visit_property(&mut self, command: &RecordCommand<PropertyRecord>) -> Result<()> {
        let store = Arc::clone(&self.stores.properties);
        self.write(&*store, IdType::Property, command)
    }

    fn visit_token(&mut self, kind: TokenKind, command: &RecordCommand<TokenRecord>) -> Result<()> {
        let store = Arc::clone(self.stores.tokens(kind));
        self.write(&*store, kind.id_type(), command)
    }

    fn visit_schema_rule(
        &mut self,
        command: &RecordCommand<SchemaRecord>,
        _batch: &mut BatchContext,
    ) -> Result<()> {
        let store = Arc::clone(&self.stores.schema);
        self.write(&*store, IdType::Schema, command)?;
        let image = if self.mode.is_reverse() {
            &command.before
        } else {
            &command.after
        };
        match (&image.rule, image.in_use) {
            (Some(rule), true) => self.schema.add_schema_rule(rule.clone()),
            _ => {
                self.schema.remove_schema_rule(command.id());
            }
        }
        Ok(())
    }

    fn close(&mut self, batch: &mut BatchContext) -> Result<()> {
        trace!(
            written = self.written,
            ids = self.id_updates.0.len(),
            mode = ?self.mode,
            "apply.store.closed"
        );
        batch.add_id_updates(std::mem::take(&mut self.id_updates));
        self.locks = None;
        Ok(())
    }
}
