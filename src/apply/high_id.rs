use std::collections::BTreeMap;

use tracing::trace;

use crate::apply::batch::BatchContext;
use crate::apply::command::RecordCommand;
use crate::apply::TransactionApplier;
use crate::ids::IdGenerators;
use crate::storage::record::{
    GroupRecord, IdType, NodeRecord, PropertyRecord, Record, RelationshipRecord, SchemaRecord,
    TokenKind, TokenRecord,
};
use crate::types::Result;

/// Raises the high id of every id space to cover the ids written by
/// external and recovered transactions, which never went through the
/// local generators.
pub struct HighIdApplier {
    ids: IdGenerators,
    highest: BTreeMap<IdType, u64>,
}

impl HighIdApplier {
    /// Tracker reporting to `ids`.
    pub fn new(ids: IdGenerators) -> Self {
        Self {
            ids,
            highest: BTreeMap::new(),
        }
    }

    fn track(&mut self, id_type: IdType, id: u64) {
        let entry = self.highest.entry(id_type).or_insert(id);
        if id > *entry {
            *entry = id;
        }
    }

    fn track_record<R: Record>(&mut self, id_type: IdType, command: &RecordCommand<R>) {
        self.track(id_type, command.id());
        if let Some(dynamic) = R::DYNAMIC_ID_TYPE {
            let mut max = None;
            for image in [&command.before, &command.after] {
                image.for_each_dynamic_id(&mut |id| {
                    max = Some(max.map_or(id, |m: u64| m.max(id)));
                });
            }
            if let Some(id) = max {
                self.track(dynamic, id);
            }
        }
    }
}

impl TransactionApplier for HighIdApplier {
    fn name(&self) -> &'static str {
        "high_id"
    }

    fn visit_node(&mut self, command: &RecordCommand<NodeRecord>) -> Result<()> {
        self.track_record(IdType::Node, command);
        Ok(())
    }

    fn visit_relationship(&mut self, command: &RecordCommand<RelationshipRecord>) -> Result<()> {
        self.track_record(IdType::Relationship, command);
        Ok(())
    }

    fn visit_group(&mut self, command: &RecordCommand<GroupRecord>) -> Result<()> {
        self.track_record(IdType::RelationshipGroup, command);
        Ok(())
    }

    fn visit_property(&mut self, command: &RecordCommand<PropertyRecord>) -> Result<()> {
        self.track_record(IdType::Property, command);
        Ok(())
    }

    fn visit_token(&mut self, kind: TokenKind, command: &RecordCommand<TokenRecord>) -> Result<()> {
        self.track_record(kind.id_type(), command);
        Ok(())
    }

    fn visit_schema_rule(
        &mut self,
        command: &RecordCommand<SchemaRecord>,
        _batch: &mut BatchContext,
    ) -> Result<()> {
        self.track_record(IdType::Schema, command);
        Ok(())
    }

    fn close(&mut self, _batch: &mut BatchContext) -> Result<()> {
        for (id_type, id) in std::mem::take(&mut self.highest) {
            self.ids.get(id_type)?.mark_highest_written(id);
            trace!(id_type = ?id_type, id, "apply.high_id");
        }
        Ok(())
    }
}
