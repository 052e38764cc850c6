//! Per-transaction record change tracking.
//!
//! Records are loaded lazily into proxies. The first mutation of a proxy
//! captures its before-image, registers it as dirty and bumps the change
//! counter shared by every tracker of the transaction.

use std::collections::hash_map::Entry;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;

use rustc_hash::FxHashMap;

use crate::storage::record::{
    GroupRecord, NodeRecord, PropertyRecord, Record, RelationshipRecord, SchemaRecord, TokenKind,
    TokenRecord,
};
use crate::storage::store::{RecordLoad, RecordStore, Stores};
use crate::types::{CoreError, Result};

/// Number of distinct records changed by a transaction.
#[derive(Clone, Debug, Default)]
pub struct ChangeCounter(Arc<AtomicUsize>);

impl ChangeCounter {
    /// Current count.
    pub fn get(&self) -> usize {
        self.0.load(Ordering::Relaxed)
    }

    fn increment(&self) {
        self.0.fetch_add(1, Ordering::Relaxed);
    }
}

#[derive(Debug)]
struct Tracked<R> {
    record: R,
    before: Option<R>,
    created: bool,
    changed: bool,
}

/// A record's before-image and current content.
#[derive(Debug)]
pub struct RecordChange<'a, R> {
    /// Content prior to the transaction (unused record for creations).
    pub before: &'a R,
    /// Content after the transaction's mutations.
    pub after: &'a R,
    /// Created by this transaction.
    pub created: bool,
}

impl<R> Clone for RecordChange<'_, R> {
    fn clone(&self) -> Self {
        *self
    }
}

impl<R> Copy for RecordChange<'_, R> {}

/// Tracks changes to records of one kind.
pub struct RecordChanges<R: Record> {
    store: Arc<dyn RecordStore<R>>,
    records: FxHashMap<u64, Tracked<R>>,
    dirty: Vec<u64>,
    counter: ChangeCounter,
}

impl<R: Record> std::fmt::Debug for RecordChanges<R> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("RecordChanges")
            .field("tracked", &self.records.len())
            .field("dirty", &self.dirty.len())
            .finish()
    }
}

impl<R: Record> RecordChanges<R> {
    /// A tracker reading from `store` and counting into `counter`.
    pub fn new(store: Arc<dyn RecordStore<R>>, counter: ChangeCounter) -> Self {
        Self {
            store,
            records: FxHashMap::default(),
            dirty: Vec::new(),
            counter,
        }
    }

    /// Backing store.
    pub fn store(&self) -> &Arc<dyn RecordStore<R>> {
        &self.store
    }

    /// Proxy for an in-use record, loading it on first access.
    pub fn get_or_load(&mut self, id: u64) -> Result<RecordProxy<'_, R>> {
        let store = &*self.store;
        let entry = match self.records.entry(id) {
            Entry::Occupied(occupied) => occupied.into_mut(),
            Entry::Vacant(vacant) => {
                let record = store
                    .get_record(id, RecordLoad::Normal)?
                    .ok_or_else(|| CoreError::NotFound(format!("record {id}")))?;
                vacant.insert(Tracked {
                    record,
                    before: None,
                    created: false,
                    changed: false,
                })
            }
        };
        Ok(RecordProxy {
            id,
            entry,
            store,
            dirty: &mut self.dirty,
            counter: &self.counter,
        })
    }

    /// Proxy for a new record. Fails when `id` is already tracked.
    pub fn create(&mut self, id: u64) -> Result<RecordProxy<'_, R>> {
        let store = &*self.store;
        let entry = match self.records.entry(id) {
            Entry::Occupied(_) => {
                return Err(CoreError::Invalid(format!(
                    "record {id} is already tracked by this transaction"
                )))
            }
            Entry::Vacant(vacant) => {
                let mut record = R::new_unused(id);
                record.set_created();
                vacant.insert(Tracked {
                    record,
                    before: None,
                    created: true,
                    changed: false,
                })
            }
        };
        let mut proxy = RecordProxy {
            id,
            entry,
            store,
            dirty: &mut self.dirty,
            counter: &self.counter,
        };
        proxy.prepare_for_change();
        Ok(proxy)
    }

    /// Current content of a tracked record without loading anything.
    pub fn get_if_loaded(&self, id: u64) -> Option<&R> {
        self.records.get(&id).map(|t| &t.record)
    }

    /// Whether the record was created by this transaction.
    pub fn is_created(&self, id: u64) -> bool {
        self.records.get(&id).map(|t| t.created).unwrap_or(false)
    }

    /// Drops a cached record that has not been changed, so the next access
    /// re-reads the store. Used after acquiring the lock guarding it.
    pub fn invalidate(&mut self, id: u64) {
        if let Entry::Occupied(occupied) = self.records.entry(id) {
            if !occupied.get().changed {
                occupied.remove();
            }
        }
    }

    /// Number of changed records.
    pub fn change_size(&self) -> usize {
        self.dirty.len()
    }

    /// Changed records in first-change order.
    pub fn changes(&self) -> impl Iterator<Item = RecordChange<'_, R>> {
        self.dirty.iter().filter_map(move |id| {
            self.records.get(id).map(|t| RecordChange {
                before: t.before.as_ref().unwrap_or(&t.record),
                after: &t.record,
                created: t.created,
            })
        })
    }

    /// Changed records ordered by id.
    pub fn sorted_changes(&self) -> Vec<RecordChange<'_, R>> {
        let mut changes: Vec<_> = self.changes().collect();
        changes.sort_by_key(|c| c.after.id());
        changes
    }

    /// Ids in flush order: preexisting records ascending, then created
    /// records descending so scans never see a new high id before the
    /// records below it.
    pub fn flush_order(&self) -> Vec<u64> {
        let mut existing: Vec<u64> = Vec::new();
        let mut created: Vec<u64> = Vec::new();
        for id in &self.dirty {
            match self.records.get(id) {
                Some(t) if t.created => created.push(*id),
                Some(_) => existing.push(*id),
                None => {}
            }
        }
        existing.sort_unstable();
        created.sort_unstable_by(|a, b| b.cmp(a));
        existing.extend(created);
        existing
    }

    /// Writes every changed record to the store.
    pub fn flush(&self) -> Result<()> {
        for id in self.flush_order() {
            if let Some(tracked) = self.records.get(&id) {
                self.store.update_record(&tracked.record)?;
            }
        }
        Ok(())
    }

    /// Forgets every tracked record.
    pub fn clear(&mut self) {
        self.records.clear();
        self.dirty.clear();
    }
}

/// Access to one tracked record.
pub struct RecordProxy<'a, R: Record> {
    id: u64,
    entry: &'a mut Tracked<R>,
    store: &'a dyn RecordStore<R>,
    dirty: &'a mut Vec<u64>,
    counter: &'a ChangeCounter,
}

impl<'a, R: Record> RecordProxy<'a, R> {
    /// Record id.
    pub fn id(&self) -> u64 {
        self.id
    }

    /// Whether the record was created by this transaction.
    pub fn is_created(&self) -> bool {
        self.entry.created
    }

    /// Before-image, once the record has been mutated.
    pub fn before(&self) -> Option<&R> {
        self.entry.before.as_ref()
    }

    /// Linkage fields; overflow content may be absent.
    pub fn for_reading_linkage(&self) -> &R {
        &self.entry.record
    }

    /// Full record including overflow content.
    pub fn for_reading_data(&mut self) -> Result<&R> {
        self.ensure_heavy()?;
        Ok(&self.entry.record)
    }

    /// Mutable linkage fields; marks the record changed.
    pub fn for_changing_linkage(&mut self) -> &mut R {
        self.prepare_for_change();
        &mut self.entry.record
    }

    /// Mutable full record; loads overflow content and marks the record changed.
    pub fn for_changing_data(&mut self) -> Result<&mut R> {
        self.ensure_heavy()?;
        self.prepare_for_change();
        Ok(&mut self.entry.record)
    }

    /// Mutable access for fields that are never persisted, such as a group's
    /// prev pointer. Does not mark the record changed.
    pub fn transient_mut(&mut self) -> &mut R {
        &mut self.entry.record
    }

    /// Consumes the proxy, keeping read access for the tracker's lifetime.
    pub fn into_linkage(self) -> &'a R {
        let entry: &'a mut Tracked<R> = self.entry;
        &entry.record
    }

    fn ensure_heavy(&mut self) -> Result<()> {
        if self.entry.record.is_light() {
            self.store.ensure_heavy(&mut self.entry.record)?;
        }
        if let Some(before) = self.entry.before.as_mut() {
            if before.is_light() && !self.entry.created {
                self.store.ensure_heavy(before)?;
            }
        }
        Ok(())
    }

    fn prepare_for_change(&mut self) {
        if self.entry.changed {
            return;
        }
        let before = if self.entry.created {
            R::new_unused(self.id)
        } else {
            self.entry.record.clone()
        };
        self.entry.before = Some(before);
        self.entry.changed = true;
        self.dirty.push(self.id);
        self.counter.increment();
    }
}

/// Trackers for every record kind a transaction may touch.
#[derive(Debug)]
pub struct RecordChangeSet {
    /// Node records.
    pub nodes: RecordChanges<NodeRecord>,
    /// Relationship records.
    pub relationships: RecordChanges<RelationshipRecord>,
    /// Relationship-group records.
    pub groups: RecordChanges<GroupRecord>,
    /// Property records.
    pub properties: RecordChanges<PropertyRecord>,
    /// Schema records.
    pub schema: RecordChanges<SchemaRecord>,
    /// Label token records.
    pub label_tokens: RecordChanges<TokenRecord>,
    /// Relationship type token records.
    pub type_tokens: RecordChanges<TokenRecord>,
    /// Property key token records.
    pub key_tokens: RecordChanges<TokenRecord>,
    counter: ChangeCounter,
}

impl RecordChangeSet {
    /// Empty trackers over `stores`, sharing one change counter.
    pub fn new(stores: &Stores) -> Self {
        let counter = ChangeCounter::default();
        Self {
            nodes: RecordChanges::new(Arc::clone(&stores.nodes), counter.clone()),
            relationships: RecordChanges::new(Arc::clone(&stores.relationships), counter.clone()),
            groups: RecordChanges::new(Arc::clone(&stores.groups), counter.clone()),
            properties: RecordChanges::new(Arc::clone(&stores.properties), counter.clone()),
            schema: RecordChanges::new(Arc::clone(&stores.schema), counter.clone()),
            label_tokens: RecordChanges::new(Arc::clone(&stores.label_tokens), counter.clone()),
            type_tokens: RecordChanges::new(Arc::clone(&stores.type_tokens), counter.clone()),
            key_tokens: RecordChanges::new(Arc::clone(&stores.key_tokens), counter.clone()),
            counter,
        }
    }

    /// Tracker of token records of `kind`.
    pub fn tokens_mut(&mut self, kind: TokenKind) -> &mut RecordChanges<TokenRecord> {
        match kind {
            TokenKind::Label => &mut self.label_tokens,
            TokenKind::RelationshipType => &mut self.type_tokens,
            TokenKind::PropertyKey => &mut self.key_tokens,
        }
    }

    /// Tracker of token records of `kind`, read only.
    pub fn tokens(&self, kind: TokenKind) -> &RecordChanges<TokenRecord> {
        match kind {
            TokenKind::Label => &self.label_tokens,
            TokenKind::RelationshipType => &self.type_tokens,
            TokenKind::PropertyKey => &self.key_tokens,
        }
    }

    /// Total number of changed records across all kinds.
    pub fn change_size(&self) -> usize {
        self.counter.get()
    }

    /// Whether anything changed.
    pub fn has_changes(&self) -> bool {
        self.change_size() > 0
    }

    /// Writes every changed record straight to the stores.
    pub fn flush(&self) -> Result<()> {
        self.label_tokens.flush()?;
        self.type_tokens.flush()?;
        self.key_tokens.flush()?;
        self.properties.flush()?;
        self.relationships.flush()?;
        self.groups.flush()?;
        self.nodes.flush()?;
        self.schema.flush()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::ids::IdGenerators;

    fn stores() -> Result<Stores> {
        Stores::in_memory(IdGenerators::in_memory())
    }

    #[test]
    fn first_change_captures_before_and_counts_once() -> Result<()> {
        let stores = stores()?;
        let mut original = NodeRecord::new(1);
        original.next_rel = 5;
        stores.nodes.update_record(&original)?;

        let mut changes = RecordChangeSet::new(&stores);
        {
            let mut proxy = changes.nodes.get_or_load(1)?;
            assert!(proxy.before().is_none());
            proxy.for_changing_linkage().next_rel = 6;
            proxy.for_changing_linkage().next_rel = 7;
        }
        assert_eq!(changes.change_size(), 1);
        let change = changes.nodes.changes().next().ok_or_else(|| CoreError::NotFound("change".into()))?;
        assert_eq!(change.before.next_rel, 5);
        assert_eq!(change.after.next_rel, 7);
        Ok(())
    }

    #[test]
    fn reads_do_not_mark_dirty() -> Result<()> {
        let stores = stores()?;
        stores.nodes.update_record(&NodeRecord::new(1))?;
        let mut changes = RecordChangeSet::new(&stores);
        let mut proxy = changes.nodes.get_or_load(1)?;
        proxy.for_reading_data()?;
        proxy.transient_mut().dense = true;
        assert!(!changes.has_changes());
        Ok(())
    }

    #[test]
    fn recreate_of_tracked_id_fails_fast() -> Result<()> {
        let stores = stores()?;
        let mut changes = RecordChangeSet::new(&stores);
        changes.nodes.create(3)?.for_changing_linkage().in_use = true;
        assert!(matches!(changes.nodes.create(3), Err(CoreError::Invalid(_))));
        Ok(())
    }

    #[test]
    fn created_records_have_unused_before_image() -> Result<()> {
        let stores = stores()?;
        let mut changes = RecordChangeSet::new(&stores);
        changes.relationships.create(4)?.for_changing_linkage().in_use = true;
        let change = changes.relationships.sorted_changes()[0];
        assert!(change.created);
        assert!(!change.before.in_use);
        assert!(change.after.in_use);
        assert_eq!(changes.change_size(), 1);
        Ok(())
    }

    #[test]
    fn flush_orders_existing_ascending_then_created_descending() -> Result<()> {
        let stores = stores()?;
        for id in [2, 8] {
            stores.nodes.update_record(&NodeRecord::new(id))?;
        }
        let mut changes = RecordChangeSet::new(&stores);
        changes.nodes.create(10)?.for_changing_linkage().in_use = true;
        changes.nodes.get_or_load(8)?.for_changing_linkage().dense = true;
        changes.nodes.create(12)?.for_changing_linkage().in_use = true;
        changes.nodes.get_or_load(2)?.for_changing_linkage().dense = true;
        assert_eq!(changes.nodes.flush_order(), vec![2, 8, 12, 10]);
        changes.flush()?;
        let stored = stores.nodes.get_record(12, RecordLoad::Normal)?;
        assert!(stored.map(|n| !n.created).unwrap_or(false));
        Ok(())
    }

    #[test]
    fn invalidate_keeps_changed_records() -> Result<()> {
        let stores = stores()?;
        stores.nodes.update_record(&NodeRecord::new(1))?;
        stores.nodes.update_record(&NodeRecord::new(2))?;
        let mut changes = RecordChangeSet::new(&stores);
        changes.nodes.get_or_load(1)?;
        changes.nodes.get_or_load(2)?.for_changing_linkage().dense = true;
        changes.nodes.invalidate(1);
        changes.nodes.invalidate(2);
        assert!(changes.nodes.get_if_loaded(1).is_none());
        assert!(changes.nodes.get_if_loaded(2).is_some());
        Ok(())
    }
}
