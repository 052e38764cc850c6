//! Index collaborators and the applier feeding them.

use std::sync::Arc;

use parking_lot::Mutex;
use rustc_hash::{FxHashMap, FxHashSet};
use tracing::{debug, info};

use crate::apply::batch::BatchContext;
use crate::apply::command::{Command, CommandMode, RecordCommand};
use crate::apply::worksync::Work;
use crate::apply::TransactionApplier;
use crate::derive::{
    derive_updates, IndexEntryUpdate, IndexUpdateKind, StorePropertyLoader, TokenIndexUpdate, Tokens,
};
use crate::schema::{IndexDescriptor, SchemaCache, SchemaRule};
use crate::storage::record::{NodeRecord, PropertyRecord, RelationshipRecord, SchemaRecord};
use crate::storage::store::Stores;
use crate::types::{CoreError, EntityKind, PropertyValue, Result};

/// Receives index lifecycle changes and entry updates.
pub trait IndexUpdateListener: Send + Sync {
    /// A new, empty index.
    fn create_index(&self, index: &IndexDescriptor) -> Result<()>;
    /// Removes an index and its entries.
    fn drop_index(&self, index: u64) -> Result<()>;
    /// Turns a populated index into the backing index of a uniqueness
    /// constraint. Fails with [`CoreError::ConstraintValidation`] when the
    /// entries violate the constraint and with [`CoreError::IndexUnusable`]
    /// when the index cannot serve it.
    fn activate_constraint_index(&self, index: &IndexDescriptor) -> Result<()>;
    /// Checks whether [`IndexUpdateListener::activate_constraint_index`]
    /// would succeed, without activating.
    fn validate_constraint_index(&self, _index: &IndexDescriptor) -> Result<()> {
        Ok(())
    }
    /// Checks entry updates without applying them. Fails with
    /// [`CoreError::ConstraintValidation`] when they would break an active
    /// uniqueness constraint.
    fn validate_updates(&self, _updates: &[IndexEntryUpdate]) -> Result<()> {
        Ok(())
    }
    /// Applies entry updates in order.
    fn apply_updates(&self, updates: &[IndexEntryUpdate]) -> Result<()>;
}

/// Receives entity token changes.
pub trait TokenIndexListener: Send + Sync {
    /// Applies token updates ordered by entity kind and id.
    fn apply_token_updates(&self, updates: &[TokenIndexUpdate]) -> Result<()>;
}

/// Index entry updates combined across transactions.
#[derive(Debug, Default)]
pub struct IndexUpdatesWork(pub Vec<IndexEntryUpdate>);

impl Work<dyn IndexUpdateListener> for IndexUpdatesWork {
    fn combine(&mut self, other: Self) {
        self.0.extend(other.0);
    }

    fn apply(self, target: &dyn IndexUpdateListener) -> Result<()> {
        if self.0.is_empty() {
            return Ok(());
        }
        target.apply_updates(&self.0)
    }
}

/// Token index updates combined across transactions.
#[derive(Debug, Default)]
pub struct TokenUpdatesWork(pub Vec<TokenIndexUpdate>);

impl Work<dyn TokenIndexListener> for TokenUpdatesWork {
    fn combine(&mut self, other: Self) {
        self.0.extend(other.0);
    }

    fn apply(mut self, target: &dyn TokenIndexListener) -> Result<()> {
        if self.0.is_empty() {
            return Ok(());
        }
        // Stable sort keeps the per-entity order of successive transactions.
        self.0.sort_by_key(|update| (update.entity_kind, update.entity));
        target.apply_token_updates(&self.0)
    }
}

#[derive(Debug)]
struct MemoryIndex {
    descriptor: IndexDescriptor,
    entries: FxHashMap<u64, Vec<PropertyValue>>,
    constraint_active: bool,
    failed: bool,
}

#[derive(Debug, Default)]
struct IndexesState {
    indexes: FxHashMap<u64, MemoryIndex>,
    tokens: FxHashMap<(EntityKind, u64), Tokens>,
    updates_applied: usize,
}

/// In-memory index and token index listener.
#[derive(Debug, Default)]
pub struct MemoryIndexes {
    state: Mutex<IndexesState>,
}

impl MemoryIndexes {
    /// An empty listener.
    pub fn new() -> Self {
        Self::default()
    }

    /// Ids of the existing indexes, ascending.
    pub fn index_ids(&self) -> Vec<u64> {
        let mut ids: Vec<u64> = self.state.lock().indexes.keys().copied().collect();
        ids.sort_unstable();
        ids
    }

    /// Entries of `index` ordered by entity id.
    pub fn entries(&self, index: u64) -> Vec<(u64, Vec<PropertyValue>)> {
        let state = self.state.lock();
        let mut entries: Vec<_> = state
            .indexes
            .get(&index)
            .map(|ix| ix.entries.iter().map(|(e, v)| (*e, v.clone())).collect())
            .unwrap_or_default();
        entries.sort_by_key(|(entity, _)| *entity);
        entries
    }

    /// Entities of `kind` carrying `token`, ascending.
    pub fn entities_with_token(&self, kind: EntityKind, token: u32) -> Vec<u64> {
        let state = self.state.lock();
        let mut ids: Vec<u64> = state
            .tokens
            .iter()
            .filter(|((k, _), tokens)| *k == kind && tokens.contains(&token))
            .map(|((_, id), _)| *id)
            .collect();
        ids.sort_unstable();
        ids
    }

    /// Whether `index` backs an active constraint.
    pub fn is_constraint_active(&self, index: u64) -> bool {
        self.state
            .lock()
            .indexes
            .get(&index)
            .is_some_and(|ix| ix.constraint_active)
    }

    /// Marks `index` as failed; it can no longer back a constraint.
    pub fn fail_index(&self, index: u64) {
        if let Some(ix) = self.state.lock().indexes.get_mut(&index) {
            ix.failed = true;
        }
    }

    /// Total entry updates applied.
    pub fn update_count(&self) -> usize {
        self.state.lock().updates_applied
    }
}

impl IndexUpdateListener for MemoryIndexes {
    fn create_index(&self, index: &IndexDescriptor) -> Result<()> {
        let mut state = self.state.lock();
        if state.indexes.contains_key(&index.id) {
            return Err(CoreError::Invalid(format!("index {} already exists", index.id)));
        }
        state.indexes.insert(
            index.id,
            MemoryIndex {
                descriptor: index.clone(),
                entries: FxHashMap::default(),
                constraint_active: false,
                failed: false,
            },
        );
        Ok(())
    }

    fn drop_index(&self, index: u64) -> Result<()> {
        self.state.lock().indexes.remove(&index);
        Ok(())
    }

    fn activate_constraint_index(&self, index: &IndexDescriptor) -> Result<()> {
        let mut state = self.state.lock();
        check_unique(&state, index)?;
        if let Some(ix) = state.indexes.get_mut(&index.id) {
            ix.constraint_active = true;
        }
        Ok(())
    }

    fn validate_constraint_index(&self, index: &IndexDescriptor) -> Result<()> {
        check_unique(&self.state.lock(), index)
    }

    fn validate_updates(&self, updates: &[IndexEntryUpdate]) -> Result<()> {
        check_updates(&self.state.lock(), updates)
    }

    fn apply_updates(&self, updates: &[IndexEntryUpdate]) -> Result<()> {
        let mut state = self.state.lock();
        check_updates(&state, updates)?;
        for update in updates {
            let Some(ix) = state.indexes.get_mut(&update.index) else {
                continue;
            };
            match &update.kind {
                IndexUpdateKind::Added(values) | IndexUpdateKind::Changed { after: values, .. } => {
                    ix.entries.insert(update.entity, values.clone());
                }
                IndexUpdateKind::Removed(_) => {
                    ix.entries.remove(&update.entity);
                }
            }
        }
        state.updates_applied += updates.len();
        Ok(())
    }
}

/// Fails when `index` is missing, failed or holds duplicate values.
fn check_unique(state: &IndexesState, index: &IndexDescriptor) -> Result<()> {
    let ix = state
        .indexes
        .get(&index.id)
        .ok_or_else(|| CoreError::IndexUnusable(format!("index {} does not exist", index.id)))?;
    if ix.failed {
        return Err(CoreError::IndexUnusable(format!(
            "index {} failed and cannot back a constraint",
            index.id
        )));
    }
    let mut seen: Vec<(&Vec<PropertyValue>, u64)> = Vec::with_capacity(ix.entries.len());
    for (entity, values) in &ix.entries {
        if let Some((_, other)) = seen.iter().find(|(v, _)| *v == values) {
            return Err(CoreError::ConstraintValidation(format!(
                "entities {other} and {entity} share values {values:?} in index {}",
                ix.descriptor.name
            )));
        }
        seen.push((values, *entity));
    }
    Ok(())
}

/// Rejects updates for missing or failed indexes and updates that would
/// give two entities the same values in a constraint-backing index.
fn check_updates(state: &IndexesState, updates: &[IndexEntryUpdate]) -> Result<()> {
    let mut staged: FxHashMap<u64, FxHashMap<u64, Option<&Vec<PropertyValue>>>> =
        FxHashMap::default();
    for update in updates {
        let ix = state.indexes.get(&update.index).ok_or_else(|| {
            CoreError::IndexUnusable(format!("update for unknown index {}", update.index))
        })?;
        if ix.failed {
            return Err(CoreError::IndexUnusable(format!(
                "index {} has failed",
                ix.descriptor.name
            )));
        }
        let values = match &update.kind {
            IndexUpdateKind::Added(values) | IndexUpdateKind::Changed { after: values, .. } => {
                Some(values)
            }
            IndexUpdateKind::Removed(_) => None,
        };
        staged
            .entry(update.index)
            .or_default()
            .insert(update.entity, values);
    }
    for (index, changes) in &staged {
        let Some(ix) = state.indexes.get(index).filter(|ix| ix.constraint_active) else {
            continue;
        };
        for (entity, values) in changes {
            let Some(values) = values else {
                continue;
            };
            let stored = ix
                .entries
                .iter()
                .filter(|(other, _)| !changes.contains_key(other))
                .map(|(other, v)| (*other, v));
            let incoming = changes
                .iter()
                .filter_map(|(other, v)| v.map(|v| (*other, v)));
            if let Some((other, _)) = stored
                .chain(incoming)
                .find(|(other, v)| other != entity && v == values)
            {
                return Err(CoreError::ConstraintValidation(format!(
                    "entities {other} and {entity} would share values {values:?} in index {}",
                    ix.descriptor.name
                )));
            }
        }
    }
    Ok(())
}

impl TokenIndexListener for MemoryIndexes {
    fn apply_token_updates(&self, updates: &[TokenIndexUpdate]) -> Result<()> {
        let mut state = self.state.lock();
        for update in updates {
            let key = (update.entity_kind, update.entity);
            if update.after.is_empty() {
                state.tokens.remove(&key);
            } else {
                state.tokens.insert(key, update.after.clone());
            }
        }
        Ok(())
    }
}

/// Collects node, relationship and property commands of a transaction and
/// turns them into index updates when it closes. Schema commands flush the
/// batch's pending updates before reaching the listener.
pub struct IndexApplier {
    stores: Stores,
    schema: Arc<SchemaCache>,
    listener: Arc<dyn IndexUpdateListener>,
    cycle_threshold: u64,
    pending: Vec<Command>,
    created_indexes: FxHashSet<u64>,
}

impl IndexApplier {
    /// Applier deriving against `schema` and reporting lifecycle changes to
    /// `listener`.
    pub fn new(
        stores: Stores,
        schema: Arc<SchemaCache>,
        listener: Arc<dyn IndexUpdateListener>,
        cycle_threshold: u64,
    ) -> Self {
        Self {
            stores,
            schema,
            listener,
            cycle_threshold,
            pending: Vec::new(),
            created_indexes: FxHashSet::default(),
        }
    }

    fn derive_pending(&mut self, batch: &mut BatchContext) -> Result<()> {
        if self.pending.is_empty() {
            return Ok(());
        }
        let commands = std::mem::take(&mut self.pending);
        let mut loader = StorePropertyLoader::new(&self.stores, self.cycle_threshold);
        let mut derived = derive_updates(&commands, &self.schema, &mut loader)?;
        // Indexes created by this transaction start empty; their population
        // is not fed by the commands that preceded their creation.
        if !self.created_indexes.is_empty() {
            derived
                .index
                .retain(|update| !self.created_indexes.contains(&update.index));
        }
        self.listener.validate_updates(&derived.index)?;
        batch.add_updates(derived)
    }

    fn activate(&self, index_id: u64) -> Result<()> {
        match self.schema.rule(index_id) {
            Some(SchemaRule::Index(index)) => {
                self.listener.activate_constraint_index(&index)?;
                info!(index = index.id, name = %index.name, "index.constraint.activated");
                Ok(())
            }
            _ => Err(CoreError::IndexUnusable(format!(
                "constraint references missing index {index_id}"
            ))),
        }
    }
}

impl TransactionApplier for IndexApplier {
    fn name(&self) -> &'static str {
        "index"
    }

    fn visit_node(&mut self, command: &RecordCommand<NodeRecord>) -> Result<()> {
        self.pending.push(Command::Node(command.clone()));
        Ok(())
    }

    fn visit_relationship(&mut self, command: &RecordCommand<RelationshipRecord>) -> Result<()> {
        self.pending.push(Command::Relationship(command.clone()));
        Ok(())
    }

    fn visit_property(&mut self, command: &RecordCommand<PropertyRecord>) -> Result<()> {
        self.pending.push(Command::Property(command.clone()));
        Ok(())
    }

    fn visit_schema_rule(
        &mut self,
        command: &RecordCommand<SchemaRecord>,
        batch: &mut BatchContext,
    ) -> Result<()> {
        self.derive_pending(batch)?;
        batch.flush_index_updates()?;
        match (command.mode(), &command.before.rule, &command.after.rule) {
            (CommandMode::Create, _, Some(SchemaRule::Index(index))) => {
                self.listener.create_index(index)?;
                self.created_indexes.insert(index.id);
                debug!(index = index.id, name = %index.name, "index.created");
            }
            (CommandMode::Create, _, Some(SchemaRule::Constraint(constraint))) => {
                if let Some(owned) = constraint.owned_index {
                    self.activate(owned)?;
                }
            }
            (
                CommandMode::Update,
                Some(SchemaRule::Index(before)),
                Some(SchemaRule::Index(after)),
            ) if before.owning_constraint.is_none() && after.owning_constraint.is_some() => {
                self.activate(after.id)?;
            }
            (CommandMode::Delete, Some(SchemaRule::Index(index)), _) => {
                self.listener.drop_index(index.id)?;
                debug!(index = index.id, name = %index.name, "index.dropped");
            }
            _ => {}
        }
        Ok(())
    }

    fn close(&mut self, batch: &mut BatchContext) -> Result<()> {
        let out = self.derive_pending(batch);
        self.created_indexes.clear();
        out
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::schema::SchemaDescriptor;

    fn descriptor(id: u64) -> IndexDescriptor {
        IndexDescriptor {
            id,
            name: format!("index_{id}"),
            schema: SchemaDescriptor::for_label(1, &[2]),
            unique: true,
            owning_constraint: None,
        }
    }

    fn added(entity: u64, value: i64) -> IndexEntryUpdate {
        IndexEntryUpdate {
            index: 7,
            entity,
            kind: IndexUpdateKind::Added(vec![PropertyValue::Int(value)]),
        }
    }

    #[test]
    fn duplicate_values_fail_constraint_activation() -> Result<()> {
        let indexes = MemoryIndexes::new();
        indexes.create_index(&descriptor(7))?;
        indexes.apply_updates(&[added(1, 10), added(2, 10)])?;
        assert!(matches!(
            indexes.validate_constraint_index(&descriptor(7)),
            Err(CoreError::ConstraintValidation(_))
        ));
        assert!(matches!(
            indexes.activate_constraint_index(&descriptor(7)),
            Err(CoreError::ConstraintValidation(_))
        ));
        indexes.apply_updates(&[IndexEntryUpdate {
            index: 7,
            entity: 2,
            kind: IndexUpdateKind::Removed(vec![PropertyValue::Int(10)]),
        }])?;
        indexes.validate_constraint_index(&descriptor(7))?;
        assert!(!indexes.is_constraint_active(7));
        indexes.activate_constraint_index(&descriptor(7))?;
        assert!(indexes.is_constraint_active(7));
        Ok(())
    }

    #[test]
    fn failed_index_is_unusable() -> Result<()> {
        let indexes = MemoryIndexes::new();
        indexes.create_index(&descriptor(7))?;
        indexes.fail_index(7);
        assert!(matches!(
            indexes.activate_constraint_index(&descriptor(7)),
            Err(CoreError::IndexUnusable(_))
        ));
        assert!(matches!(
            indexes.apply_updates(&[IndexEntryUpdate { index: 8, ..added(1, 1) }]),
            Err(CoreError::IndexUnusable(_))
        ));
        Ok(())
    }

    #[test]
    fn active_constraints_reject_duplicates_atomically() -> Result<()> {
        let indexes = MemoryIndexes::new();
        indexes.create_index(&descriptor(7))?;
        indexes.apply_updates(&[added(1, 10)])?;
        indexes.activate_constraint_index(&descriptor(7))?;

        let clash = [added(2, 11), added(3, 10)];
        assert!(matches!(
            indexes.validate_updates(&clash),
            Err(CoreError::ConstraintValidation(_))
        ));
        assert!(matches!(
            indexes.apply_updates(&clash),
            Err(CoreError::ConstraintValidation(_))
        ));
        assert_eq!(indexes.entries(7).len(), 1);

        // Moving the value away in the same batch frees it.
        indexes.apply_updates(&[
            IndexEntryUpdate {
                index: 7,
                entity: 1,
                kind: IndexUpdateKind::Changed {
                    before: vec![PropertyValue::Int(10)],
                    after: vec![PropertyValue::Int(12)],
                },
            },
            added(3, 10),
        ])?;
        assert_eq!(indexes.entries(7).len(), 2);
        Ok(())
    }

    #[test]
    fn token_work_sorts_before_applying() -> Result<()> {
        let indexes = MemoryIndexes::new();
        let update = |entity: u64, after: &[u32]| TokenIndexUpdate {
            entity_kind: EntityKind::Node,
            entity,
            before: Tokens::new(),
            after: Tokens::from_slice(after),
        };
        let mut work = TokenUpdatesWork(vec![update(5, &[1])]);
        work.combine(TokenUpdatesWork(vec![update(2, &[1]), update(5, &[])]));
        work.apply(&indexes as &dyn TokenIndexListener)?;
        assert_eq!(indexes.entities_with_token(EntityKind::Node, 1), vec![2]);
        Ok(())
    }
}
