//! Relationship chain insertion and removal.
//!
//! Sparse nodes thread every relationship through one chain hanging off the
//! node record. Dense nodes keep one chain per (type, direction) inside
//! relationship groups. New relationships are always linked in at the head
//! of their chain; the head stores the chain length in its prev field.

use tracing::{debug, trace};

use crate::config::EngineConfig;
use crate::ids::TransactionIds;
use crate::locking::{LockClient, LockMode, ResourceType};
use crate::storage::record::{ChainSide, RelationshipRecord};
use crate::txn::chain::CycleGuard;
use crate::txn::changes::RecordChangeSet;
use crate::txn::counts::DegreeDeltas;
use crate::txn::groups::{delete_group, find_group, get_or_create_group};
use crate::types::{
    is_null, CoreError, GroupId, NodeId, RelDirection, RelId, Result, TypeId, NULL_REF,
};

/// Mutates relationship chains inside one transaction's change set.
pub struct ChainModifier<'a> {
    changes: &'a mut RecordChangeSet,
    ids: &'a mut TransactionIds,
    locks: &'a dyn LockClient,
    degrees: &'a mut DegreeDeltas,
    config: &'a EngineConfig,
}

impl<'a> ChainModifier<'a> {
    /// Modifier over the given transaction state.
    pub fn new(
        changes: &'a mut RecordChangeSet,
        ids: &'a mut TransactionIds,
        locks: &'a dyn LockClient,
        degrees: &'a mut DegreeDeltas,
        config: &'a EngineConfig,
    ) -> Self {
        Self {
            changes,
            ids,
            locks,
            degrees,
            config,
        }
    }

    /// Creates relationship `id` of `rel_type` from `start` to `end` and
    /// links it into both endpoints' chains.
    pub fn create(&mut self, id: RelId, rel_type: TypeId, start: NodeId, end: NodeId) -> Result<()> {
        self.convert_to_dense_if_necessary(start)?;
        if end != start {
            self.convert_to_dense_if_necessary(end)?;
        }
        {
            let mut proxy = self.changes.relationships.create(id)?;
            *proxy.for_changing_linkage() = RelationshipRecord {
                created: true,
                ..RelationshipRecord::new(id, start, end, rel_type)
            };
        }
        self.connect_relationship(id, start, end)?;
        trace!(rel = id, rel_type, start, end, "chain.relationship.created");
        Ok(())
    }

    /// Unlinks relationship `id` from both endpoints' chains and marks it
    /// unused. Groups left empty are deleted when their locks are free.
    pub fn delete(&mut self, id: RelId) -> Result<()> {
        self.ensure_relationship_locked(id)?;
        let rel = self
            .changes
            .relationships
            .get_or_load(id)?
            .into_linkage()
            .clone();
        self.disconnect(&rel)?;
        self.update_nodes_for_deleted(&rel)?;
        self.changes
            .relationships
            .get_or_load(id)?
            .for_changing_linkage()
            .in_use = false;
        trace!(rel = id, "chain.relationship.deleted");
        Ok(())
    }

    /// Locks a relationship that the lock plan did not cover.
    ///
    /// Created records are private to the transaction. A record cached
    /// before the lock was taken is re-read once the lock is held.
    pub fn ensure_relationship_locked(&mut self, id: RelId) -> Result<()> {
        if self.changes.relationships.is_created(id)
            || self.locks.holds(ResourceType::Relationship, id, LockMode::Exclusive)
        {
            return Ok(());
        }
        self.locks.acquire_exclusive(ResourceType::Relationship, &[id])?;
        self.changes.relationships.invalidate(id);
        debug!(rel = id, "locks.relationship.late");
        Ok(())
    }

    fn is_dense(&mut self, node: NodeId) -> Result<bool> {
        Ok(self.changes.nodes.get_or_load(node)?.for_reading_linkage().dense)
    }

    fn node_head(&mut self, node: NodeId) -> Result<RelId> {
        Ok(self.changes.nodes.get_or_load(node)?.for_reading_linkage().next_rel)
    }

    fn convert_to_dense_if_necessary(&mut self, node: NodeId) -> Result<()> {
        let (dense, head) = {
            let record = self.changes.nodes.get_or_load(node)?.into_linkage();
            (record.dense, record.next_rel)
        };
        if dense || is_null(head) {
            return Ok(());
        }
        self.ensure_relationship_locked(head)?;
        let count = self
            .changes
            .relationships
            .get_or_load(head)?
            .into_linkage()
            .chain_count_for(node)
            .ok_or_else(|| {
                CoreError::Inconsistency(format!(
                    "relationship {head} heads the chain of node {node} without a count"
                ))
            })?;
        if count >= self.config.dense_node_threshold {
            self.convert_to_dense(node, head)?;
        }
        Ok(())
    }

    fn convert_to_dense(&mut self, node: NodeId, head: RelId) -> Result<()> {
        {
            let mut proxy = self.changes.nodes.get_or_load(node)?;
            let record = proxy.for_changing_linkage();
            record.dense = true;
            record.next_rel = NULL_REF;
        }
        let mut guard = CycleGuard::new("relationship", node, self.config.cycle_detection_threshold);
        let mut current = head;
        while !is_null(current) {
            guard.step(current)?;
            self.ensure_relationship_locked(current)?;
            let next = self
                .changes
                .relationships
                .get_or_load(current)?
                .into_linkage()
                .next_for(node)
                .ok_or_else(|| not_in_chain(current, node))?;
            self.connect_to_dense(node, current)?;
            current = next;
        }
        debug!(node, relationships = guard.hops(), "chain.dense.converted");
        Ok(())
    }

    fn connect_relationship(&mut self, id: RelId, start: NodeId, end: NodeId) -> Result<()> {
        let is_loop = start == end;
        let start_dense = self.is_dense(start)?;
        let end_dense = self.is_dense(end)?;
        let start_head = if start_dense { NULL_REF } else { self.node_head(start)? };
        let end_head = if end_dense { NULL_REF } else { self.node_head(end)? };
        {
            let mut proxy = self.changes.relationships.get_or_load(id)?;
            let record = proxy.for_changing_linkage();
            if !start_dense {
                record.first_next_rel = start_head;
            }
            if !end_dense {
                record.second_next_rel = end_head;
            }
        }
        if start_dense {
            self.connect_to_dense(start, id)?;
        } else {
            self.connect_sparse(start, start_head, id)?;
        }
        if !is_loop {
            if end_dense {
                self.connect_to_dense(end, id)?;
            } else {
                self.connect_sparse(end, end_head, id)?;
            }
        }
        if !start_dense {
            self.changes.nodes.get_or_load(start)?.for_changing_linkage().next_rel = id;
        }
        if !end_dense && !is_loop {
            self.changes.nodes.get_or_load(end)?.for_changing_linkage().next_rel = id;
        }
        Ok(())
    }

    /// Puts `rel` in front of the chain of `node` starting at `head` and
    /// returns the new chain length.
    fn connect_sparse(&mut self, node: NodeId, head: RelId, rel: RelId) -> Result<u64> {
        let mut count = 1;
        if !is_null(head) {
            self.ensure_relationship_locked(head)?;
            let mut proxy = self.changes.relationships.get_or_load(head)?;
            let sides = proxy.for_reading_linkage().sides_of(node);
            if sides.is_empty() {
                return Err(not_in_chain(head, node));
            }
            let record = proxy.for_changing_linkage();
            for side in sides {
                if !record.is_first_in_chain(side) {
                    return Err(CoreError::Inconsistency(format!(
                        "relationship {head} heads the chain of node {node} but is not flagged first"
                    )));
                }
                count = record.prev_field(side) + 1;
                record.set_prev(side, rel, false);
            }
        }
        let mut proxy = self.changes.relationships.get_or_load(rel)?;
        let record = proxy.for_changing_linkage();
        for side in record.sides_of(node) {
            record.set_prev(side, count, true);
        }
        Ok(count)
    }

    fn connect_to_dense(&mut self, node: NodeId, rel: RelId) -> Result<()> {
        let (rel_type, dir) = {
            let record = self.changes.relationships.get_or_load(rel)?.into_linkage();
            let dir = record
                .direction_for(node)
                .ok_or_else(|| not_in_chain(rel, node))?;
            (record.rel_type, dir)
        };
        let group = get_or_create_group(
            self.changes,
            self.ids,
            node,
            rel_type,
            self.config.cycle_detection_threshold,
        )?;
        let head = self
            .changes
            .groups
            .get_or_load(group)?
            .for_reading_linkage()
            .head(dir);
        {
            let mut proxy = self.changes.relationships.get_or_load(rel)?;
            let record = proxy.for_changing_linkage();
            for side in record.sides_of(node) {
                record.set_next(side, head);
            }
        }
        let count = self.connect_sparse(node, head, rel)?;
        self.changes
            .groups
            .get_or_load(group)?
            .for_changing_linkage()
            .set_head(dir, rel);
        self.degree_inserted(group, dir, count)
    }

    fn degree_inserted(&mut self, group: GroupId, dir: RelDirection, count: u64) -> Result<()> {
        let mut proxy = self.changes.groups.get_or_load(group)?;
        if proxy.for_reading_linkage().has_external_degrees(dir) {
            self.degrees.increment(group, dir, 1);
        } else if count > self.config.external_degrees_threshold {
            proxy.for_changing_linkage().set_external_degrees(dir, true);
            self.degrees.increment(group, dir, count as i64);
            debug!(group, ?dir, count, "chain.degrees.external");
        }
        Ok(())
    }

    fn degree_removed(&mut self, group: GroupId, dir: RelDirection) -> Result<()> {
        if self
            .changes
            .groups
            .get_or_load(group)?
            .for_reading_linkage()
            .has_external_degrees(dir)
        {
            self.degrees.increment(group, dir, -1);
        }
        Ok(())
    }

    /// Splices `rel` out of the chains of both endpoints by relinking its
    /// neighbours. The record itself is left untouched.
    fn disconnect(&mut self, rel: &RelationshipRecord) -> Result<()> {
        for side in [ChainSide::First, ChainSide::Second] {
            if side == ChainSide::Second && rel.is_loop() {
                break;
            }
            let node = rel.node(side);
            let prev = rel.prev(side);
            let next = rel.next(side);
            if !is_null(prev) {
                self.ensure_relationship_locked(prev)?;
                let mut proxy = self.changes.relationships.get_or_load(prev)?;
                let sides = proxy.for_reading_linkage().sides_of(node);
                if sides.is_empty() {
                    return Err(not_in_chain(prev, node));
                }
                let record = proxy.for_changing_linkage();
                for other in sides {
                    record.set_next(other, next);
                }
            }
            if !is_null(next) {
                self.ensure_relationship_locked(next)?;
                let mut proxy = self.changes.relationships.get_or_load(next)?;
                let sides = proxy.for_reading_linkage().sides_of(node);
                if sides.is_empty() {
                    return Err(not_in_chain(next, node));
                }
                let record = proxy.for_changing_linkage();
                for other in sides {
                    record.set_prev(other, rel.prev_field(side), rel.is_first_in_chain(side));
                }
            }
        }
        Ok(())
    }

    fn update_nodes_for_deleted(&mut self, rel: &RelationshipRecord) -> Result<()> {
        for side in [ChainSide::First, ChainSide::Second] {
            if side == ChainSide::Second && rel.is_loop() {
                break;
            }
            let node = rel.node(side);
            if self.is_dense(node)? {
                let dir = rel
                    .direction_for(node)
                    .ok_or_else(|| not_in_chain(rel.id, node))?;
                let group = find_group(
                    self.changes,
                    node,
                    rel.rel_type,
                    self.config.cycle_detection_threshold,
                )?
                .group
                .ok_or_else(|| {
                    CoreError::Inconsistency(format!(
                        "dense node {node} has no group for type {} of relationship {}",
                        rel.rel_type, rel.id
                    ))
                })?;
                if rel.is_first_in_chain(side) {
                    self.changes
                        .groups
                        .get_or_load(group)?
                        .for_changing_linkage()
                        .set_head(dir, rel.next(side));
                }
                let head = self
                    .changes
                    .groups
                    .get_or_load(group)?
                    .for_reading_linkage()
                    .head(dir);
                self.decrement_count(node, rel, side, head)?;
                self.degree_removed(group, dir)?;
                let empty = self
                    .changes
                    .groups
                    .get_or_load(group)?
                    .for_reading_linkage()
                    .is_empty();
                if empty {
                    self.delete_group_if_unlocked(node, group)?;
                }
            } else {
                if rel.is_first_in_chain(side) {
                    self.changes.nodes.get_or_load(node)?.for_changing_linkage().next_rel =
                        rel.next(side);
                }
                let head = self.node_head(node)?;
                self.decrement_count(node, rel, side, head)?;
            }
        }
        Ok(())
    }

    fn decrement_count(
        &mut self,
        node: NodeId,
        rel: &RelationshipRecord,
        side: ChainSide,
        head: RelId,
    ) -> Result<()> {
        if is_null(head) {
            return Ok(());
        }
        let count = if rel.is_first_in_chain(side) {
            rel.prev_field(side)
        } else {
            self.ensure_relationship_locked(head)?;
            self.changes
                .relationships
                .get_or_load(head)?
                .into_linkage()
                .chain_count_for(node)
                .ok_or_else(|| {
                    CoreError::Inconsistency(format!(
                        "relationship {head} heads the chain of node {node} without a count"
                    ))
                })?
        };
        let mut proxy = self.changes.relationships.get_or_load(head)?;
        let record = proxy.for_changing_linkage();
        for other in record.sides_of(node) {
            record.set_prev(other, count.saturating_sub(1), true);
        }
        Ok(())
    }

    /// Deletes an empty group when its deletion locks can be taken without
    /// waiting; otherwise the group stays and is reused later.
    fn delete_group_if_unlocked(&mut self, node: NodeId, group: GroupId) -> Result<()> {
        if !self.locks.try_exclusive(ResourceType::NodeGroupDelete, node)? {
            debug!(node, group, "chain.group.delete.skipped");
            return Ok(());
        }
        let is_head = self.node_head(node)? == group;
        if is_head
            && !self.locks.holds(ResourceType::Node, node, LockMode::Exclusive)
            && !self.locks.try_exclusive(ResourceType::Node, node)?
        {
            self.locks.release_exclusive(ResourceType::NodeGroupDelete, node);
            debug!(node, group, "chain.group.delete.skipped");
            return Ok(());
        }
        delete_group(
            self.changes,
            node,
            group,
            self.config.cycle_detection_threshold,
        )
    }
}

fn not_in_chain(rel: RelId, node: NodeId) -> CoreError {
    CoreError::Inconsistency(format!(
        "relationship {rel} in chain of node {node} does not reference it"
    ))
}
