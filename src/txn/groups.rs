//! Relationship-group chains of dense nodes.
//!
//! A dense node's `next_rel` points at its first group. Groups form a singly
//! linked list sorted by relationship type; the `prev` pointer is transient
//! and filled in while walking.

use tracing::{debug, trace};

use crate::ids::TransactionIds;
use crate::storage::record::{GroupRecord, IdType};
use crate::txn::chain::CycleGuard;
use crate::txn::changes::RecordChangeSet;
use crate::types::{is_null, CoreError, GroupId, NodeId, Result, TypeId, NULL_REF};

/// Outcome of a group lookup.
#[derive(Copy, Clone, Debug, PartialEq, Eq)]
pub struct GroupLookup {
    /// The group of the requested type.
    pub group: Option<GroupId>,
    /// Last group with a smaller type, where a new group would be linked in.
    pub closest_previous: Option<GroupId>,
}

/// Finds the group of `rel_type` owned by `node`.
///
/// The walk stops at the first group with a larger type. Every visited group
/// gets its transient prev pointer set.
pub fn find_group(
    changes: &mut RecordChangeSet,
    node: NodeId,
    rel_type: TypeId,
    cycle_threshold: u64,
) -> Result<GroupLookup> {
    let mut current = changes.nodes.get_or_load(node)?.for_reading_linkage().next_rel;
    let mut guard = CycleGuard::new("group", node, cycle_threshold);
    let mut previous: Option<GroupId> = None;
    while !is_null(current) {
        guard.step(current)?;
        let mut proxy = changes.groups.get_or_load(current)?;
        proxy.transient_mut().prev = previous.unwrap_or(NULL_REF);
        let group = proxy.for_reading_linkage();
        if group.owning_node != node {
            return Err(CoreError::Inconsistency(format!(
                "group {current} owned by {} found in chain of node {node}",
                group.owning_node
            )));
        }
        if group.rel_type == rel_type {
            return Ok(GroupLookup {
                group: Some(current),
                closest_previous: previous,
            });
        }
        if group.rel_type > rel_type {
            break;
        }
        previous = Some(current);
        current = group.next;
    }
    Ok(GroupLookup {
        group: None,
        closest_previous: previous,
    })
}

/// Creates the group of `rel_type` for `node`, linked in after
/// `closest_previous` or as the new head. Marks the node dense.
pub fn create_group(
    changes: &mut RecordChangeSet,
    ids: &mut TransactionIds,
    node: NodeId,
    rel_type: TypeId,
    closest_previous: Option<GroupId>,
) -> Result<GroupId> {
    let id = ids.allocate(IdType::RelationshipGroup)?;
    let next = match closest_previous {
        Some(prev) => changes.groups.get_or_load(prev)?.for_reading_linkage().next,
        None => changes.nodes.get_or_load(node)?.for_reading_linkage().next_rel,
    };
    {
        let mut proxy = changes.groups.create(id)?;
        let group = proxy.for_changing_linkage();
        *group = GroupRecord {
            created: true,
            next,
            prev: closest_previous.unwrap_or(NULL_REF),
            ..GroupRecord::new(id, rel_type, node)
        };
    }
    match closest_previous {
        Some(prev) => changes.groups.get_or_load(prev)?.for_changing_linkage().next = id,
        None => {
            let mut proxy = changes.nodes.get_or_load(node)?;
            let record = proxy.for_changing_linkage();
            record.next_rel = id;
            record.dense = true;
        }
    }
    if !is_null(next) {
        changes.groups.get_or_load(next)?.transient_mut().prev = id;
    }
    trace!(node, rel_type, group = id, "chain.group.created");
    Ok(id)
}

/// Returns the group of `rel_type`, creating it when missing.
pub fn get_or_create_group(
    changes: &mut RecordChangeSet,
    ids: &mut TransactionIds,
    node: NodeId,
    rel_type: TypeId,
    cycle_threshold: u64,
) -> Result<GroupId> {
    let lookup = find_group(changes, node, rel_type, cycle_threshold)?;
    match lookup.group {
        Some(group) => Ok(group),
        None => create_group(changes, ids, node, rel_type, lookup.closest_previous),
    }
}

/// Unlinks an empty group from its node's chain and marks it unused.
pub fn delete_group(
    changes: &mut RecordChangeSet,
    node: NodeId,
    group_id: GroupId,
    cycle_threshold: u64,
) -> Result<()> {
    let (rel_type, next, empty) = {
        let group = changes.groups.get_or_load(group_id)?.into_linkage();
        (group.rel_type, group.next, group.is_empty())
    };
    if !empty {
        return Err(CoreError::Invalid(format!(
            "group {group_id} of node {node} still has relationships"
        )));
    }
    let lookup = find_group(changes, node, rel_type, cycle_threshold)?;
    if lookup.group != Some(group_id) {
        return Err(CoreError::Inconsistency(format!(
            "group {group_id} not reachable from node {node}"
        )));
    }
    match lookup.closest_previous {
        Some(prev) => changes.groups.get_or_load(prev)?.for_changing_linkage().next = next,
        None => changes.nodes.get_or_load(node)?.for_changing_linkage().next_rel = next,
    }
    if !is_null(next) {
        changes.groups.get_or_load(next)?.transient_mut().prev =
            lookup.closest_previous.unwrap_or(NULL_REF);
    }
    changes.groups.get_or_load(group_id)?.for_changing_linkage().in_use = false;
    debug!(node, group = group_id, rel_type, "chain.group.deleted");
    Ok(())
}

/// Ids of every group in `node`'s chain, in chain order.
pub fn group_ids(
    changes: &mut RecordChangeSet,
    node: NodeId,
    cycle_threshold: u64,
) -> Result<Vec<GroupId>> {
    let mut current = changes.nodes.get_or_load(node)?.for_reading_linkage().next_rel;
    let mut guard = CycleGuard::new("group", node, cycle_threshold);
    let mut out = Vec::new();
    while !is_null(current) {
        guard.step(current)?;
        out.push(current);
        current = changes.groups.get_or_load(current)?.for_reading_linkage().next;
    }
    Ok(out)
}
