use std::collections::BTreeSet;

use tracing::error;

use crate::apply::batch::BatchContext;
use crate::apply::command::RecordCommand;
use crate::apply::TransactionApplier;
use crate::storage::record::{ChainSide, GroupRecord, NodeRecord, RelationshipRecord};
use crate::storage::store::{RecordLoad, Stores};
use crate::types::{is_null, CoreError, GroupId, NodeId, RelDirection, RelId, Result};

/// Re-reads every node, relationship and group written by a transaction and
/// checks that their references land on in-use records pointing back.
pub struct ConsistencyCheckApplier {
    stores: Stores,
    nodes: BTreeSet<NodeId>,
    relationships: BTreeSet<RelId>,
    groups: BTreeSet<GroupId>,
}

impl ConsistencyCheckApplier {
    /// Checker reading `stores`.
    pub fn new(stores: Stores) -> Self {
        Self {
            stores,
            nodes: BTreeSet::new(),
            relationships: BTreeSet::new(),
            groups: BTreeSet::new(),
        }
    }

    fn node(&self, id: NodeId) -> Result<Option<NodeRecord>> {
        self.stores.nodes.get_record(id, RecordLoad::Lenient)
    }

    fn relationship(&self, id: RelId) -> Result<Option<RelationshipRecord>> {
        self.stores.relationships.get_record(id, RecordLoad::Lenient)
    }

    fn group(&self, id: GroupId) -> Result<Option<GroupRecord>> {
        self.stores.groups.get_record(id, RecordLoad::Lenient)
    }

    fn check_node(&self, id: NodeId) -> Result<()> {
        let Some(node) = self.node(id)? else {
            return Ok(());
        };
        if is_null(node.next_rel) {
            return Ok(());
        }
        if node.dense {
            match self.group(node.next_rel)? {
                Some(group) if group.owning_node == id => Ok(()),
                _ => Err(inconsistent(format!(
                    "dense node {id} references group {} it does not own",
                    node.next_rel
                ))),
            }
        } else {
            match self.relationship(node.next_rel)? {
                Some(rel) if rel.is_first_for(id) => Ok(()),
                _ => Err(inconsistent(format!(
                    "node {id} references relationship {} that does not head its chain",
                    node.next_rel
                ))),
            }
        }
    }

    fn check_relationship(&self, id: RelId) -> Result<()> {
        let Some(rel) = self.relationship(id)? else {
            return Ok(());
        };
        for side in [ChainSide::First, ChainSide::Second] {
            let node = rel.node(side);
            if self.node(node)?.is_none() {
                return Err(inconsistent(format!(
                    "relationship {id} references node {node} not in use"
                )));
            }
            let next = rel.next(side);
            if !is_null(next) {
                let linked = self
                    .relationship(next)?
                    .is_some_and(|other| other.sides_of(node).iter().any(|s| other.prev(*s) == id));
                if !linked {
                    return Err(inconsistent(format!(
                        "relationship {id} next {next} for node {node} does not point back"
                    )));
                }
            }
            let prev = rel.prev(side);
            if !is_null(prev) {
                let linked = self
                    .relationship(prev)?
                    .is_some_and(|other| other.sides_of(node).iter().any(|s| other.next(*s) == id));
                if !linked {
                    return Err(inconsistent(format!(
                        "relationship {id} prev {prev} for node {node} does not point forward"
                    )));
                }
            }
        }
        Ok(())
    }

    fn check_group(&self, id: GroupId) -> Result<()> {
        let Some(group) = self.group(id)? else {
            return Ok(());
        };
        match self.node(group.owning_node)? {
            Some(node) if node.dense => {}
            _ => {
                return Err(inconsistent(format!(
                    "group {id} owned by node {} that is not a dense node in use",
                    group.owning_node
                )))
            }
        }
        for dir in RelDirection::ALL {
            let head = group.head(dir);
            if !is_null(head) && self.relationship(head)?.is_none() {
                return Err(inconsistent(format!(
                    "group {id} {dir:?} head {head} not in use"
                )));
            }
        }
        if !is_null(group.next) {
            match self.group(group.next)? {
                Some(next) if next.rel_type > group.rel_type && next.owning_node == group.owning_node => {}
                _ => {
                    return Err(inconsistent(format!(
                        "group {id} next {} is out of order or foreign",
                        group.next
                    )))
                }
            }
        }
        Ok(())
    }
}

fn inconsistent(message: String) -> CoreError {
    error!(message = %message, "apply.consistency.failed");
    CoreError::Inconsistency(message)
}

impl TransactionApplier for ConsistencyCheckApplier {
    fn name(&self) -> &'static str {
        "consistency_check"
    }

    fn visit_node(&mut self, command: &RecordCommand<NodeRecord>) -> Result<()> {
        self.nodes.insert(command.id());
        Ok(())
    }

    fn visit_relationship(&mut self, command: &RecordCommand<RelationshipRecord>) -> Result<()> {
        self.relationships.insert(command.id());
        Ok(())
    }

    fn visit_group(&mut self, command: &RecordCommand<GroupRecord>) -> Result<()> {
        self.groups.insert(command.id());
        Ok(())
    }

    fn close(&mut self, _batch: &mut BatchContext) -> Result<()> {
        let nodes = std::mem::take(&mut self.nodes);
        let relationships = std::mem::take(&mut self.relationships);
        let groups = std::mem::take(&mut self.groups);
        for id in nodes {
            self.check_node(id)?;
        }
        for id in relationships {
            self.check_relationship(id)?;
        }
        for id in groups {
            self.check_group(id)?;
        }
        Ok(())
    }
}
