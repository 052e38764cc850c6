use std::collections::BTreeMap;

use tracing::debug;

use super::{LockClient, LockMode, ResourceType};
use crate::types::{EntityKind, NodeId, RelId, Result};

/// Locks a transaction needs, acquired together in global order.
///
/// Requests for the same resource merge to the strongest mode, so a plan
/// never takes a shared lock and then upgrades it.
#[derive(Debug, Default, Clone)]
pub struct LockPlan {
    wanted: BTreeMap<(ResourceType, u64), LockMode>,
}

impl LockPlan {
    /// An empty plan.
    pub fn new() -> Self {
        Self::default()
    }

    /// Requests a shared lock unless a stronger one is already planned.
    pub fn shared(&mut self, resource: ResourceType, id: u64) -> &mut Self {
        self.wanted.entry((resource, id)).or_insert(LockMode::Shared);
        self
    }

    /// Requests an exclusive lock.
    pub fn exclusive(&mut self, resource: ResourceType, id: u64) -> &mut Self {
        self.wanted.insert((resource, id), LockMode::Exclusive);
        self
    }

    /// Planned mode for a resource.
    pub fn mode(&self, resource: ResourceType, id: u64) -> Option<LockMode> {
        self.wanted.get(&(resource, id)).copied()
    }

    /// Number of planned locks.
    pub fn len(&self) -> usize {
        self.wanted.len()
    }

    /// Whether nothing is planned.
    pub fn is_empty(&self) -> bool {
        self.wanted.is_empty()
    }

    /// Whether holding this plan grants every lock `other` asks for.
    pub fn covers(&self, other: &LockPlan) -> bool {
        other
            .iter()
            .all(|(resource, id, mode)| self.mode(resource, id).is_some_and(|held| held >= mode))
    }

    /// Adds the requests of `other`, keeping the stronger mode.
    pub fn merge(&mut self, other: &LockPlan) -> &mut Self {
        for (resource, id, mode) in other.iter() {
            let held = self.wanted.entry((resource, id)).or_insert(mode);
            *held = (*held).max(mode);
        }
        self
    }

    /// Planned locks in acquisition order.
    pub fn iter(&self) -> impl Iterator<Item = (ResourceType, u64, LockMode)> + '_ {
        self.wanted.iter().map(|((ty, id), mode)| (*ty, *id, *mode))
    }

    /// Shared group-delete and degrees locks on both endpoints of a
    /// relationship being created or deleted.
    pub fn relationship_endpoints(&mut self, start: NodeId, end: NodeId) -> &mut Self {
        for node in [start.min(end), start.max(end)] {
            self.shared(ResourceType::NodeGroupDelete, node)
                .shared(ResourceType::Degrees, node);
        }
        self
    }

    /// Locks for deleting `rel` between `start` and `end`.
    pub fn relationship_delete(&mut self, rel: RelId, start: NodeId, end: NodeId) -> &mut Self {
        self.relationship_endpoints(start, end)
            .exclusive(ResourceType::RelationshipDelete, rel)
    }

    /// Locks for changing the adjacency chains of `node`: the node record
    /// of a sparse node, the group chain of a dense one.
    pub fn chain_change(&mut self, node: NodeId, dense: bool) -> &mut Self {
        if dense {
            self.exclusive(ResourceType::RelationshipGroup, node)
        } else {
            self.exclusive(ResourceType::Node, node)
        }
    }

    /// Locks for deleting `node`.
    pub fn node_delete(&mut self, node: NodeId) -> &mut Self {
        self.exclusive(ResourceType::NodeGroupDelete, node)
            .exclusive(ResourceType::Node, node)
            .exclusive(ResourceType::Degrees, node)
    }

    /// Locks for changing the labels of `node`.
    pub fn label_change(&mut self, node: NodeId) -> &mut Self {
        self.exclusive(ResourceType::Node, node)
            .exclusive(ResourceType::Degrees, node)
    }

    /// Locks for changing properties of an entity.
    pub fn property_change(&mut self, entity: EntityKind, id: u64) -> &mut Self {
        match entity {
            EntityKind::Node => self.exclusive(ResourceType::Node, id),
            EntityKind::Relationship => self.exclusive(ResourceType::Relationship, id),
        }
    }

    /// Acquires every planned lock in order.
    pub fn acquire(&self, client: &dyn LockClient) -> Result<()> {
        for (resource, id, mode) in self.iter() {
            match mode {
                LockMode::Shared => client.acquire_shared(resource, &[id])?,
                LockMode::Exclusive => client.acquire_exclusive(resource, &[id])?,
            }
        }
        debug!(client = client.client_id(), locks = self.len(), "locks.plan.acquired");
        Ok(())
    }

    /// Drops one hold of every planned lock.
    pub fn release(&self, client: &dyn LockClient) {
        for (resource, id, mode) in self.iter() {
            match mode {
                LockMode::Shared => client.release_shared(resource, id),
                LockMode::Exclusive => client.release_exclusive(resource, id),
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::locking::LockTable;

    #[test]
    fn plan_orders_by_type_then_id() {
        let mut plan = LockPlan::new();
        plan.exclusive(ResourceType::Relationship, 3)
            .relationship_endpoints(9, 2)
            .exclusive(ResourceType::Node, 9);
        let order: Vec<_> = plan.iter().map(|(ty, id, _)| (ty, id)).collect();
        assert_eq!(
            order,
            vec![
                (ResourceType::NodeGroupDelete, 2),
                (ResourceType::NodeGroupDelete, 9),
                (ResourceType::Node, 9),
                (ResourceType::Degrees, 2),
                (ResourceType::Degrees, 9),
                (ResourceType::Relationship, 3),
            ]
        );
    }

    #[test]
    fn exclusive_wins_over_shared() {
        let mut plan = LockPlan::new();
        plan.node_delete(4).relationship_endpoints(4, 5);
        assert_eq!(
            plan.mode(ResourceType::NodeGroupDelete, 4),
            Some(LockMode::Exclusive)
        );
        assert_eq!(plan.mode(ResourceType::Degrees, 5), Some(LockMode::Shared));
    }

    #[test]
    fn merged_plan_covers_both_sides() {
        let mut held = LockPlan::new();
        held.relationship_endpoints(1, 2)
            .exclusive(ResourceType::RelationshipGroup, 1);
        let mut wanted = LockPlan::new();
        wanted.relationship_endpoints(1, 2).chain_change(1, false);
        assert!(!held.covers(&wanted));
        held.merge(&wanted);
        assert!(held.covers(&wanted));
        assert_eq!(held.mode(ResourceType::Node, 1), Some(LockMode::Exclusive));
        assert_eq!(held.mode(ResourceType::Degrees, 2), Some(LockMode::Shared));

        let mut stronger = LockPlan::new();
        stronger.exclusive(ResourceType::Degrees, 2);
        assert!(!held.covers(&stronger));
    }

    #[test]
    fn release_gives_back_the_plan() -> Result<()> {
        let table = LockTable::new();
        let client = table.client();
        let mut plan = LockPlan::new();
        plan.relationship_delete(7, 1, 2);
        plan.acquire(&client)?;
        plan.release(&client);
        assert!(!client.holds(ResourceType::RelationshipDelete, 7, LockMode::Exclusive));
        assert!(!client.holds(ResourceType::Degrees, 1, LockMode::Shared));
        assert_eq!(table.snapshot().locked_resources, 0);
        Ok(())
    }

    #[test]
    fn acquire_takes_every_lock() -> Result<()> {
        let table = LockTable::new();
        let client = table.client();
        let mut plan = LockPlan::new();
        plan.relationship_delete(7, 1, 2).chain_change(1, true);
        plan.acquire(&client)?;
        assert!(client.holds(ResourceType::RelationshipDelete, 7, LockMode::Exclusive));
        assert!(client.holds(ResourceType::RelationshipGroup, 1, LockMode::Exclusive));
        assert!(client.holds(ResourceType::Degrees, 2, LockMode::Shared));
        Ok(())
    }
}
