//! Id allocation and reclamation bookkeeping.
//!
//! Ids handed out to a transaction are either confirmed by applying its
//! commands (created records mark their id used, deleted records mark theirs
//! deleted) or handed back when the transaction rolls back. Deleted ids only
//! become reusable after [`IdGenerator::maintenance`].

use std::collections::BTreeSet;
use std::sync::Arc;

use parking_lot::Mutex;
use rustc_hash::FxHashMap;
use tracing::trace;

use crate::apply::worksync::Work;
use crate::storage::record::IdType;
use crate::types::{CoreError, Result};

/// Id generator collaborator for one id space.
pub trait IdGenerator: Send + Sync {
    /// Allocates an id, reusing freed ids first.
    fn next_id(&self) -> u64;
    /// Confirms that `id` now holds an in-use record.
    fn mark_used(&self, id: u64);
    /// Records that `id` no longer holds an in-use record.
    fn mark_deleted(&self, id: u64);
    /// Returns an allocated but never used id to the free pool.
    fn mark_free(&self, id: u64);
    /// Raises the high id so that `id` is never handed out again.
    fn mark_highest_written(&self, id: u64);
    /// One past the highest id ever allocated or written.
    fn high_id(&self) -> u64;
    /// Moves deleted ids into the reusable pool.
    fn maintenance(&self) {}
}

#[derive(Debug, Default)]
struct IdState {
    high: u64,
    free: BTreeSet<u64>,
    deleted: Vec<u64>,
}

/// In-memory [`IdGenerator`].
#[derive(Debug, Default)]
pub struct MemoryIdGenerator {
    state: Mutex<IdState>,
}

impl MemoryIdGenerator {
    /// A generator starting at id 0.
    pub fn new() -> Self {
        Self::default()
    }
}

impl IdGenerator for MemoryIdGenerator {
    fn next_id(&self) -> u64 {
        let mut state = self.state.lock();
        if let Some(id) = state.free.pop_first() {
            return id;
        }
        let id = state.high;
        state.high += 1;
        id
    }

    fn mark_used(&self, id: u64) {
        let mut state = self.state.lock();
        state.free.remove(&id);
        if id >= state.high {
            state.high = id + 1;
        }
    }

    fn mark_deleted(&self, id: u64) {
        self.state.lock().deleted.push(id);
    }

    fn mark_free(&self, id: u64) {
        let mut state = self.state.lock();
        if id < state.high {
            state.free.insert(id);
        }
    }

    fn mark_highest_written(&self, id: u64) {
        let mut state = self.state.lock();
        if id >= state.high {
            state.high = id + 1;
        }
    }

    fn high_id(&self) -> u64 {
        self.state.lock().high
    }

    fn maintenance(&self) {
        let mut state = self.state.lock();
        let deleted = std::mem::take(&mut state.deleted);
        state.free.extend(deleted);
    }
}

/// One generator per [`IdType`].
#[derive(Clone)]
pub struct IdGenerators {
    generators: FxHashMap<IdType, Arc<dyn IdGenerator>>,
}

impl std::fmt::Debug for IdGenerators {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("IdGenerators")
            .field("spaces", &self.generators.len())
            .finish()
    }
}

impl IdGenerators {
    /// In-memory generators for every id space.
    pub fn in_memory() -> Self {
        let generators = IdType::ALL
            .iter()
            .map(|ty| (*ty, Arc::new(MemoryIdGenerator::new()) as Arc<dyn IdGenerator>))
            .collect();
        Self { generators }
    }

    /// Generator for `id_type`.
    pub fn get(&self, id_type: IdType) -> Result<&Arc<dyn IdGenerator>> {
        self.generators
            .get(&id_type)
            .ok_or_else(|| CoreError::Invalid(format!("no id generator for {id_type:?}")))
    }

    /// Allocates an id in `id_type`.
    pub fn next_id(&self, id_type: IdType) -> Result<u64> {
        Ok(self.get(id_type)?.next_id())
    }

    /// Runs maintenance on every generator.
    pub fn maintenance(&self) {
        for generator in self.generators.values() {
            generator.maintenance();
        }
    }
}

/// Whether an id became used or deleted.
#[derive(Copy, Clone, Debug, PartialEq, Eq)]
pub enum IdUpdateKind {
    /// Record created.
    Used,
    /// Record deleted.
    Deleted,
}

/// Id change produced by applying one command.
#[derive(Copy, Clone, Debug, PartialEq, Eq)]
pub struct IdUpdate {
    /// Id space.
    pub id_type: IdType,
    /// Record id.
    pub id: u64,
    /// Used or deleted.
    pub kind: IdUpdateKind,
}

/// Batched id updates applied through a [`crate::apply::worksync::WorkSync`].
#[derive(Debug, Default)]
pub struct IdUpdates(pub Vec<IdUpdate>);

impl IdUpdates {
    /// Records a used id.
    pub fn used(&mut self, id_type: IdType, id: u64) {
        self.0.push(IdUpdate {
            id_type,
            id,
            kind: IdUpdateKind::Used,
        });
    }

    /// Records a deleted id.
    pub fn deleted(&mut self, id_type: IdType, id: u64) {
        self.0.push(IdUpdate {
            id_type,
            id,
            kind: IdUpdateKind::Deleted,
        });
    }

    /// Whether nothing was recorded.
    pub fn is_empty(&self) -> bool {
        self.0.is_empty()
    }
}

impl Work<IdGenerators> for IdUpdates {
    fn combine(&mut self, other: Self) {
        self.0.extend(other.0);
    }

    fn apply(self, target: &IdGenerators) -> Result<()> {
        for update in self.0 {
            let generator = target.get(update.id_type)?;
            match update.kind {
                IdUpdateKind::Used => generator.mark_used(update.id),
                IdUpdateKind::Deleted => generator.mark_deleted(update.id),
            }
        }
        Ok(())
    }
}

/// Ids a transaction allocated, handed back on rollback.
#[derive(Debug)]
pub struct TransactionIds {
    generators: IdGenerators,
    allocated: Vec<(IdType, u64)>,
}

impl TransactionIds {
    /// Allocator drawing from `generators`.
    pub fn new(generators: IdGenerators) -> Self {
        Self {
            generators,
            allocated: Vec::new(),
        }
    }

    /// Allocates an id and remembers it.
    pub fn allocate(&mut self, id_type: IdType) -> Result<u64> {
        let id = self.generators.next_id(id_type)?;
        self.allocated.push((id_type, id));
        Ok(id)
    }

    /// Every allocated id, in allocation order.
    pub fn allocated(&self) -> &[(IdType, u64)] {
        &self.allocated
    }

    /// Returns one allocated id that ended up unused.
    pub fn free(&mut self, id_type: IdType, id: u64) -> Result<()> {
        self.allocated.retain(|entry| *entry != (id_type, id));
        self.generators.get(id_type)?.mark_free(id);
        Ok(())
    }

    /// Returns every allocated id to its generator.
    pub fn release(self) -> Result<()> {
        for (id_type, id) in self.allocated {
            trace!(?id_type, id, "ids.release");
            self.generators.get(id_type)?.mark_free(id);
        }
        Ok(())
    }
}
