//! Relationship chain traversal: cycle guard, read helpers and integrity checks.

use rustc_hash::FxHashSet;
use tracing::warn;

use crate::config::DEFAULT_CYCLE_DETECTION_THRESHOLD;
use crate::storage::record::{GroupRecord, NodeRecord, Record, RelationshipRecord};
use crate::storage::store::{RecordLoad, Stores};
use crate::txn::changes::RecordChangeSet;
use crate::types::{
    is_null, CoreError, Direction, GroupId, NodeId, RelDirection, RelId, Result, TypeId,
};

/// Detects cycles in record chains.
///
/// Walks are free for the first `threshold` hops; past that every visited id
/// is remembered and seeing one twice is reported as an inconsistency.
#[derive(Debug)]
pub struct CycleGuard {
    what: &'static str,
    owner: u64,
    threshold: u64,
    hops: u64,
    visited: Option<FxHashSet<u64>>,
}

impl CycleGuard {
    /// Guard for a walk over `what` chains owned by `owner`.
    pub fn new(what: &'static str, owner: u64, threshold: u64) -> Self {
        Self {
            what,
            owner,
            threshold,
            hops: 0,
            visited: None,
        }
    }

    /// Records a hop onto `id`.
    pub fn step(&mut self, id: u64) -> Result<()> {
        self.hops += 1;
        if self.hops <= self.threshold {
            return Ok(());
        }
        let visited = self.visited.get_or_insert_with(FxHashSet::default);
        if visited.insert(id) {
            return Ok(());
        }
        warn!(
            chain = self.what,
            owner = self.owner,
            record = id,
            hops = self.hops,
            "chain.cycle.detected"
        );
        Err(CoreError::Inconsistency(format!(
            "cycle in {} chain of {} at record {id} after {} hops",
            self.what, self.owner, self.hops
        )))
    }

    /// Hops taken so far.
    pub fn hops(&self) -> u64 {
        self.hops
    }
}

/// Read access to adjacency records.
pub trait RelationshipSource {
    /// Node record, `None` when not visible.
    fn node(&mut self, id: NodeId) -> Result<Option<NodeRecord>>;
    /// Relationship record, `None` when not visible.
    fn relationship(&mut self, id: RelId) -> Result<Option<RelationshipRecord>>;
    /// Group record, `None` when not visible.
    fn group(&mut self, id: GroupId) -> Result<Option<GroupRecord>>;
}

impl<S: RelationshipSource + ?Sized> RelationshipSource for &mut S {
    fn node(&mut self, id: NodeId) -> Result<Option<NodeRecord>> {
        (**self).node(id)
    }

    fn relationship(&mut self, id: RelId) -> Result<Option<RelationshipRecord>> {
        (**self).relationship(id)
    }

    fn group(&mut self, id: GroupId) -> Result<Option<GroupRecord>> {
        (**self).group(id)
    }
}

/// Committed store view with a fixed load mode.
#[derive(Debug, Clone, Copy)]
pub struct StoreSource<'a> {
    stores: &'a Stores,
    load: RecordLoad,
}

impl<'a> StoreSource<'a> {
    /// Lenient reads: a concurrently deleted record ends the walk.
    pub fn lenient(stores: &'a Stores) -> Self {
        Self {
            stores,
            load: RecordLoad::Lenient,
        }
    }

    /// Forced reads: deleted but not reused records are still followed.
    pub fn forced(stores: &'a Stores) -> Self {
        Self {
            stores,
            load: RecordLoad::Always,
        }
    }
}

impl RelationshipSource for StoreSource<'_> {
    fn node(&mut self, id: NodeId) -> Result<Option<NodeRecord>> {
        self.stores.nodes.get_record(id, self.load)
    }

    fn relationship(&mut self, id: RelId) -> Result<Option<RelationshipRecord>> {
        self.stores.relationships.get_record(id, self.load)
    }

    fn group(&mut self, id: GroupId) -> Result<Option<GroupRecord>> {
        self.stores.groups.get_record(id, self.load)
    }
}

/// Transaction view: tracked records as changed so far, committed ones otherwise.
impl RelationshipSource for RecordChangeSet {
    fn node(&mut self, id: NodeId) -> Result<Option<NodeRecord>> {
        match self.nodes.get_if_loaded(id) {
            Some(record) => Ok(Some(record.clone()).filter(|r| r.in_use)),
            None => self.nodes.store().get_record(id, RecordLoad::Lenient),
        }
    }

    fn relationship(&mut self, id: RelId) -> Result<Option<RelationshipRecord>> {
        match self.relationships.get_if_loaded(id) {
            Some(record) => Ok(Some(record.clone()).filter(|r| r.in_use)),
            None => self.relationships.store().get_record(id, RecordLoad::Lenient),
        }
    }

    fn group(&mut self, id: GroupId) -> Result<Option<GroupRecord>> {
        match self.groups.get_if_loaded(id) {
            Some(record) => Ok(Some(record.clone()).filter(|r| r.in_use)),
            None => self.groups.store().get_record(id, RecordLoad::Lenient),
        }
    }
}

/// One relationship as seen from a node.
#[derive(Copy, Clone, Debug, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct RelationshipRef {
    /// Relationship id.
    pub id: RelId,
    /// Relationship type.
    pub rel_type: TypeId,
    /// Start node.
    pub start: NodeId,
    /// End node.
    pub end: NodeId,
    /// Direction relative to the node the walk started from.
    pub direction: RelDirection,
}

/// Reads a node's relationships from sparse chains or dense groups.
pub struct RelationshipChains<S> {
    source: S,
    cycle_threshold: u64,
}

impl<S: RelationshipSource> RelationshipChains<S> {
    /// Reader over `source` using the default cycle threshold.
    pub fn new(source: S) -> Self {
        Self {
            source,
            cycle_threshold: DEFAULT_CYCLE_DETECTION_THRESHOLD,
        }
    }

    /// Overrides the cycle-detection threshold.
    pub fn with_cycle_threshold(mut self, threshold: u64) -> Self {
        self.cycle_threshold = threshold;
        self
    }

    /// Relationships of `node` with a type in `types` (all when `None`)
    /// passing the `dir` filter, in chain order.
    pub fn relationships(
        &mut self,
        node: NodeId,
        types: Option<&[TypeId]>,
        dir: Direction,
    ) -> Result<Vec<RelationshipRef>> {
        let Some(record) = self.source.node(node)? else {
            return Ok(Vec::new());
        };
        let mut out = Vec::new();
        if record.dense {
            for group in self.groups(node)? {
                if types.map(|t| !t.contains(&group.rel_type)).unwrap_or(false) {
                    continue;
                }
                for chain_dir in RelDirection::ALL {
                    if dir.matches(chain_dir) {
                        self.walk(node, group.head(chain_dir), &mut out)?;
                    }
                }
            }
        } else {
            let mut all = Vec::new();
            self.walk(node, record.next_rel, &mut all)?;
            out.extend(all.into_iter().filter(|r| {
                dir.matches(r.direction)
                    && types.map(|t| t.contains(&r.rel_type)).unwrap_or(true)
            }));
        }
        Ok(out)
    }

    /// Number of relationships matching the filters.
    pub fn degree(&mut self, node: NodeId, types: Option<&[TypeId]>, dir: Direction) -> Result<u64> {
        Ok(self.relationships(node, types, dir)?.len() as u64)
    }

    /// Groups of a dense node in chain order.
    pub fn groups(&mut self, node: NodeId) -> Result<Vec<GroupRecord>> {
        let Some(record) = self.source.node(node)? else {
            return Ok(Vec::new());
        };
        if !record.dense {
            return Ok(Vec::new());
        }
        let mut guard = CycleGuard::new("group", node, self.cycle_threshold);
        let mut groups = Vec::new();
        let mut current = record.next_rel;
        while !is_null(current) {
            guard.step(current)?;
            let Some(group) = self.source.group(current)? else {
                break;
            };
            current = group.next;
            if group.in_use {
                groups.push(group);
            }
        }
        Ok(groups)
    }

    fn walk(&mut self, node: NodeId, first: RelId, out: &mut Vec<RelationshipRef>) -> Result<()> {
        let mut guard = CycleGuard::new("relationship", node, self.cycle_threshold);
        let mut current = first;
        while !is_null(current) {
            guard.step(current)?;
            let Some(rel) = self.source.relationship(current)? else {
                break;
            };
            let (Some(direction), Some(next)) = (rel.direction_for(node), rel.next_for(node))
            else {
                return Err(CoreError::Inconsistency(format!(
                    "relationship {} in chain of node {node} does not reference it",
                    rel.id
                )));
            };
            if rel.in_use() {
                out.push(RelationshipRef {
                    id: rel.id,
                    rel_type: rel.rel_type,
                    start: rel.first_node,
                    end: rel.second_node,
                    direction,
                });
            }
            current = next;
        }
        Ok(())
    }

    /// Checks every chain of `node`: mutual prev/next links, head flags and
    /// stored chain lengths, group ordering and ownership.
    pub fn verify_node(&mut self, node: NodeId) -> Result<()> {
        let Some(record) = self.source.node(node)? else {
            return Ok(());
        };
        if !record.dense {
            return self.verify_chain(node, record.next_rel, None);
        }
        let mut last_type: Option<TypeId> = None;
        for group in self.groups(node)? {
            if group.owning_node != node {
                return Err(CoreError::Inconsistency(format!(
                    "group {} owned by {} found in chain of node {node}",
                    group.id, group.owning_node
                )));
            }
            if last_type.map(|t| t >= group.rel_type).unwrap_or(false) {
                return Err(CoreError::Inconsistency(format!(
                    "groups of node {node} not in ascending type order at group {}",
                    group.id
                )));
            }
            last_type = Some(group.rel_type);
            for dir in RelDirection::ALL {
                self.verify_chain(node, group.head(dir), Some((group.rel_type, dir)))?;
            }
        }
        Ok(())
    }

    fn verify_chain(
        &mut self,
        node: NodeId,
        first: RelId,
        group: Option<(TypeId, RelDirection)>,
    ) -> Result<()> {
        let mut guard = CycleGuard::new("relationship", node, self.cycle_threshold);
        let mut previous: Option<RelId> = None;
        let mut length = 0u64;
        let mut head_count = None;
        let mut current = first;
        while !is_null(current) {
            guard.step(current)?;
            let rel = self.source.relationship(current)?.ok_or_else(|| {
                CoreError::Inconsistency(format!(
                    "chain of node {node} references missing relationship {current}"
                ))
            })?;
            let broken = |what: &str| {
                CoreError::Inconsistency(format!(
                    "chain of node {node}: relationship {} {what}",
                    rel.id
                ))
            };
            if let Some((rel_type, dir)) = group {
                if rel.rel_type != rel_type || rel.direction_for(node) != Some(dir) {
                    return Err(broken("sits in the wrong group chain"));
                }
            }
            for side in rel.sides_of(node) {
                match previous {
                    None => {
                        if !rel.is_first_in_chain(side) {
                            return Err(broken("heads the chain without the first-in-chain flag"));
                        }
                        head_count = Some(rel.prev_field(side));
                    }
                    Some(prev) => {
                        if rel.is_first_in_chain(side) || rel.prev_field(side) != prev {
                            return Err(broken("has a prev pointer not matching its predecessor"));
                        }
                    }
                }
            }
            if rel.sides_of(node).is_empty() {
                return Err(broken("does not reference the node"));
            }
            length += 1;
            previous = Some(rel.id);
            current = rel.next_for(node).unwrap_or(crate::types::NULL_REF);
        }
        if let Some(count) = head_count {
            if count != length {
                return Err(CoreError::Inconsistency(format!(
                    "chain of node {node} holds {length} relationships but its head records {count}"
                )));
            }
        }
        Ok(())
    }
}
