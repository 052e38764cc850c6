//! Counts store collaborator and the applier feeding it.

use std::sync::Arc;

use parking_lot::Mutex;
use rustc_hash::FxHashMap;

use crate::apply::batch::BatchContext;
use crate::apply::TransactionApplier;
use crate::types::{GroupId, LabelId, RelDirection, Result, TypeId};

/// Node counts, relationship counts and external group degrees.
pub trait CountsStore: Send + Sync {
    /// Adds `delta` to the node count of `label`.
    fn increment_node_count(&self, label: LabelId, delta: i64) -> Result<()>;
    /// Adds `delta` to a relationship count.
    fn increment_relationship_count(
        &self,
        start_label: LabelId,
        rel_type: TypeId,
        end_label: LabelId,
        delta: i64,
    ) -> Result<()>;
    /// Adds `delta` to the degree of a group in one direction.
    fn increment_degree(&self, group: GroupId, direction: RelDirection, delta: i64) -> Result<()>;
    /// Node count of `label`.
    fn node_count(&self, label: LabelId) -> i64;
    /// Relationship count for a (start label, type, end label) key.
    fn relationship_count(&self, start_label: LabelId, rel_type: TypeId, end_label: LabelId) -> i64;
    /// Stored degree of a group in one direction.
    fn degree(&self, group: GroupId, direction: RelDirection) -> i64;
}

#[derive(Debug, Default)]
struct Counts {
    nodes: FxHashMap<LabelId, i64>,
    relationships: FxHashMap<(LabelId, TypeId, LabelId), i64>,
    degrees: FxHashMap<(GroupId, RelDirection), i64>,
}

/// In-memory [`CountsStore`].
#[derive(Debug, Default)]
pub struct MemoryCountsStore {
    counts: Mutex<Counts>,
}

impl MemoryCountsStore {
    /// Empty counts.
    pub fn new() -> Self {
        Self::default()
    }
}

impl CountsStore for MemoryCountsStore {
    fn increment_node_count(&self, label: LabelId, delta: i64) -> Result<()> {
        *self.counts.lock().nodes.entry(label).or_insert(0) += delta;
        Ok(())
    }

    fn increment_relationship_count(
        &self,
        start_label: LabelId,
        rel_type: TypeId,
        end_label: LabelId,
        delta: i64,
    ) -> Result<()> {
        *self
            .counts
            .lock()
            .relationships
            .entry((start_label, rel_type, end_label))
            .or_insert(0) += delta;
        Ok(())
    }

    fn increment_degree(&self, group: GroupId, direction: RelDirection, delta: i64) -> Result<()> {
        *self
            .counts
            .lock()
            .degrees
            .entry((group, direction))
            .or_insert(0) += delta;
        Ok(())
    }

    fn node_count(&self, label: LabelId) -> i64 {
        self.counts.lock().nodes.get(&label).copied().unwrap_or(0)
    }

    fn relationship_count(&self, start_label: LabelId, rel_type: TypeId, end_label: LabelId) -> i64 {
        self.counts
            .lock()
            .relationships
            .get(&(start_label, rel_type, end_label))
            .copied()
            .unwrap_or(0)
    }

    fn degree(&self, group: GroupId, direction: RelDirection) -> i64 {
        self.counts
            .lock()
            .degrees
            .get(&(group, direction))
            .copied()
            .unwrap_or(0)
    }
}

enum Delta {
    Node(LabelId, i64),
    Relationship(LabelId, TypeId, LabelId, i64),
    Degree(GroupId, RelDirection, i64),
}

/// Buffers the counts commands of a transaction and hands them to the
/// counts store when the transaction closes.
pub struct CountsApplier {
    store: Arc<dyn CountsStore>,
    pending: Vec<Delta>,
}

impl CountsApplier {
    /// Applier writing to `store`.
    pub fn new(store: Arc<dyn CountsStore>) -> Self {
        Self {
            store,
            pending: Vec::new(),
        }
    }
}

impl TransactionApplier for CountsApplier {
    fn name(&self) -> &'static str {
        "counts"
    }

    fn visit_node_count(&mut self, label: LabelId, delta: i64) -> Result<()> {
        self.pending.push(Delta::Node(label, delta));
        Ok(())
    }

    fn visit_relationship_count(
        &mut self,
        start_label: LabelId,
        rel_type: TypeId,
        end_label: LabelId,
        delta: i64,
    ) -> Result<()> {
        self.pending
            .push(Delta::Relationship(start_label, rel_type, end_label, delta));
        Ok(())
    }

    fn visit_group_degree(&mut self, group: GroupId, direction: RelDirection, delta: i64) -> Result<()> {
        self.pending.push(Delta::Degree(group, direction, delta));
        Ok(())
    }

    fn close(&mut self, _batch: &mut BatchContext) -> Result<()> {
        for delta in self.pending.drain(..) {
            match delta {
                Delta::Node(label, delta) => self.store.increment_node_count(label, delta)?,
                Delta::Relationship(start, rel_type, end, delta) => self
                    .store
                    .increment_relationship_count(start, rel_type, end, delta)?,
                Delta::Degree(group, direction, delta) => {
                    self.store.increment_degree(group, direction, delta)?
                }
            }
        }
        Ok(())
    }
}
