//! Transaction record state.
//!
//! Writes are recorded as logical operations and only turned into record
//! changes when commands are requested. At that point the transaction takes
//! every lock it needs in global order, applies the operations to its
//! change set and extracts ordered commands from the before/after images.

use std::collections::BTreeSet;
use std::hash::{Hash, Hasher};
use std::sync::Arc;

use rustc_hash::{FxHashMap, FxHashSet, FxHasher};
use smallvec::SmallVec;
use tracing::{debug, trace};

use crate::apply::command::{Command, CommandMode, RecordCommand};
use crate::config::EngineConfig;
use crate::ids::TransactionIds;
use crate::locking::{LockClient, LockPlan, ResourceType};
use crate::schema::SchemaRule;
use crate::storage::dynamic::write_chain;
use crate::storage::labels::{add_label, node_labels, remove_label};
use crate::storage::record::{
    IdType, NodeRecord, PropertyOwner, Record, SchemaRecord, TokenKind, TokenRecord,
};
use crate::storage::store::Stores;
use crate::txn::chain::{RelationshipChains, RelationshipSource, StoreSource};
use crate::txn::changes::{RecordChangeSet, RecordChanges};
use crate::txn::counts::{CountsDelta, DegreeDeltas};
use crate::txn::groups::{delete_group, group_ids};
use crate::txn::properties;
use crate::txn::relationships::ChainModifier;
use crate::types::{
    is_null, CoreError, Direction, EntityKind, LabelId, NodeId, PropKeyId, PropertyValue,
    RelDirection, RelId, Result, TypeId, NULL_REF,
};

#[derive(Clone, Debug)]
enum LogicalOp {
    TokenCreate {
        kind: TokenKind,
        id: u32,
        name: String,
        internal: bool,
    },
    NodeCreate {
        id: NodeId,
    },
    RelationshipCreate {
        id: RelId,
        rel_type: TypeId,
        start: NodeId,
        end: NodeId,
    },
    RelationshipDelete {
        id: RelId,
    },
    PropertySet {
        entity: EntityKind,
        id: u64,
        key: PropKeyId,
        value: PropertyValue,
    },
    PropertyRemove {
        entity: EntityKind,
        id: u64,
        key: PropKeyId,
    },
    LabelAdd {
        node: NodeId,
        label: LabelId,
    },
    LabelRemove {
        node: NodeId,
        label: LabelId,
    },
    NodeDelete {
        id: NodeId,
    },
    SchemaCreate {
        rule: SchemaRule,
    },
    SchemaDrop {
        id: u64,
    },
}

impl LogicalOp {
    /// Application order: operations run grouped by rank, in recorded order
    /// within a rank.
    fn rank(&self) -> u8 {
        match self {
            LogicalOp::TokenCreate { .. } => 0,
            LogicalOp::NodeCreate { .. } => 1,
            LogicalOp::RelationshipCreate { .. } => 2,
            LogicalOp::RelationshipDelete { .. } => 3,
            LogicalOp::PropertySet { .. } | LogicalOp::PropertyRemove { .. } => 4,
            LogicalOp::LabelAdd { .. } | LogicalOp::LabelRemove { .. } => 5,
            LogicalOp::NodeDelete { .. } => 6,
            LogicalOp::SchemaCreate { .. } | LogicalOp::SchemaDrop { .. } => 7,
        }
    }

    fn is_schema(&self) -> bool {
        matches!(
            self,
            LogicalOp::SchemaCreate { .. } | LogicalOp::SchemaDrop { .. }
        )
    }

    fn is_data(&self) -> bool {
        !self.is_schema() && !matches!(self, LogicalOp::TokenCreate { .. })
    }

    fn depends_on_schema(&self) -> bool {
        matches!(
            self,
            LogicalOp::PropertySet { .. }
                | LogicalOp::PropertyRemove { .. }
                | LogicalOp::LabelAdd { .. }
                | LogicalOp::LabelRemove { .. }
                | LogicalOp::SchemaCreate { .. }
                | LogicalOp::SchemaDrop { .. }
        )
    }
}

const MAX_RANK: u8 = 7;

fn token_lock_id(kind: TokenKind, id: u32) -> u64 {
    let space: u64 = match kind {
        TokenKind::Label => 0,
        TokenKind::RelationshipType => 1,
        TokenKind::PropertyKey => 2,
    };
    (space << 32) | u64::from(id)
}

fn schema_name_lock_id(name: &str) -> u64 {
    let mut hasher = FxHasher::default();
    name.hash(&mut hasher);
    hasher.finish()
}

fn owner(entity: EntityKind, id: u64) -> PropertyOwner {
    match entity {
        EntityKind::Node => PropertyOwner::Node(id),
        EntityKind::Relationship => PropertyOwner::Relationship(id),
    }
}

/// Write state of one transaction.
pub struct TransactionRecordState {
    stores: Stores,
    config: EngineConfig,
    locks: Arc<dyn LockClient>,
    schema_epoch: u64,
    changes: RecordChangeSet,
    ids: TransactionIds,
    degrees: DegreeDeltas,
    ops: Vec<LogicalOp>,
    created_nodes: FxHashSet<NodeId>,
    created_rels: FxHashSet<RelId>,
    deleted_nodes: FxHashSet<NodeId>,
    deleted_rels: FxHashSet<RelId>,
    prepared: bool,
}

impl std::fmt::Debug for TransactionRecordState {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("TransactionRecordState")
            .field("ops", &self.ops.len())
            .field("changes", &self.changes.change_size())
            .field("schema_epoch", &self.schema_epoch)
            .field("prepared", &self.prepared)
            .finish()
    }
}

impl TransactionRecordState {
    /// Empty state reading `stores`, locking through `locks`, started under
    /// schema epoch `schema_epoch`.
    pub fn new(
        stores: Stores,
        config: EngineConfig,
        locks: Arc<dyn LockClient>,
        schema_epoch: u64,
    ) -> Self {
        let changes = RecordChangeSet::new(&stores);
        let ids = TransactionIds::new(stores.ids.clone());
        Self {
            stores,
            config,
            locks,
            schema_epoch,
            changes,
            ids,
            degrees: DegreeDeltas::default(),
            ops: Vec::new(),
            created_nodes: FxHashSet::default(),
            created_rels: FxHashSet::default(),
            deleted_nodes: FxHashSet::default(),
            deleted_rels: FxHashSet::default(),
            prepared: false,
        }
    }

    /// Schema epoch the transaction started under.
    pub fn schema_epoch(&self) -> u64 {
        self.schema_epoch
    }

    /// Lock client of the transaction.
    pub fn locks(&self) -> &Arc<dyn LockClient> {
        &self.locks
    }

    /// Record changes made so far.
    pub fn changes(&self) -> &RecordChangeSet {
        &self.changes
    }

    /// Whether no write has been recorded.
    pub fn is_empty(&self) -> bool {
        self.ops.is_empty()
    }

    fn record(&mut self, op: LogicalOp) -> Result<()> {
        if self.prepared {
            return Err(CoreError::Invalid(
                "transaction already produced its commands".into(),
            ));
        }
        if (op.is_schema() && self.ops.iter().any(LogicalOp::is_data))
            || (op.is_data() && self.ops.iter().any(LogicalOp::is_schema))
        {
            return Err(CoreError::Invalid(
                "schema and data writes cannot share a transaction".into(),
            ));
        }
        trace!(?op, "txn.op");
        self.ops.push(op);
        Ok(())
    }

    fn node_visible(&self, node: NodeId) -> Result<bool> {
        if self.deleted_nodes.contains(&node) {
            return Ok(false);
        }
        if self.created_nodes.contains(&node) {
            return Ok(true);
        }
        Ok(self.stores.nodes.get_record(node, crate::storage::RecordLoad::Lenient)?.is_some())
    }

    fn relationship_record(&self, rel: RelId) -> Result<Option<(NodeId, NodeId)>> {
        if self.deleted_rels.contains(&rel) {
            return Ok(None);
        }
        if self.created_rels.contains(&rel) {
            return Ok(self.ops.iter().find_map(|op| match op {
                LogicalOp::RelationshipCreate { id, start, end, .. } if *id == rel => {
                    Some((*start, *end))
                }
                _ => None,
            }));
        }
        Ok(StoreSource::lenient(&self.stores)
            .relationship(rel)?
            .map(|r| (r.first_node, r.second_node)))
    }

    fn require_node(&self, node: NodeId) -> Result<()> {
        if self.node_visible(node)? {
            Ok(())
        } else {
            Err(CoreError::NotFound(format!("node {node}")))
        }
    }

    fn require_relationship(&self, rel: RelId) -> Result<()> {
        match self.relationship_record(rel)? {
            Some(_) => Ok(()),
            None => Err(CoreError::NotFound(format!("relationship {rel}"))),
        }
    }

    /// Creates a node and returns its id.
    pub fn node_create(&mut self) -> Result<NodeId> {
        let id = self.ids.allocate(IdType::Node)?;
        self.record(LogicalOp::NodeCreate { id })?;
        self.created_nodes.insert(id);
        Ok(id)
    }

    /// Deletes a node. It must have no relationships once the transaction's
    /// relationship deletions are applied.
    pub fn node_delete(&mut self, node: NodeId) -> Result<()> {
        self.require_node(node)?;
        self.record(LogicalOp::NodeDelete { id: node })?;
        self.deleted_nodes.insert(node);
        Ok(())
    }

    /// Creates a relationship and returns its id.
    pub fn relationship_create(
        &mut self,
        rel_type: TypeId,
        start: NodeId,
        end: NodeId,
    ) -> Result<RelId> {
        self.require_node(start)?;
        self.require_node(end)?;
        let id = self.ids.allocate(IdType::Relationship)?;
        self.record(LogicalOp::RelationshipCreate {
            id,
            rel_type,
            start,
            end,
        })?;
        self.created_rels.insert(id);
        Ok(id)
    }

    /// Deletes a relationship.
    pub fn relationship_delete(&mut self, rel: RelId) -> Result<()> {
        self.require_relationship(rel)?;
        self.record(LogicalOp::RelationshipDelete { id: rel })?;
        self.deleted_rels.insert(rel);
        Ok(())
    }

    /// Sets a node property.
    pub fn node_set_property(
        &mut self,
        node: NodeId,
        key: PropKeyId,
        value: impl Into<PropertyValue>,
    ) -> Result<()> {
        self.require_node(node)?;
        self.record(LogicalOp::PropertySet {
            entity: EntityKind::Node,
            id: node,
            key,
            value: value.into(),
        })
    }

    /// Removes a node property.
    pub fn node_remove_property(&mut self, node: NodeId, key: PropKeyId) -> Result<()> {
        self.require_node(node)?;
        self.record(LogicalOp::PropertyRemove {
            entity: EntityKind::Node,
            id: node,
            key,
        })
    }

    /// Sets a relationship property.
    pub fn relationship_set_property(
        &mut self,
        rel: RelId,
        key: PropKeyId,
        value: impl Into<PropertyValue>,
    ) -> Result<()> {
        self.require_relationship(rel)?;
        self.record(LogicalOp::PropertySet {
            entity: EntityKind::Relationship,
            id: rel,
            key,
            value: value.into(),
        })
    }

    /// Removes a relationship property.
    pub fn relationship_remove_property(&mut self, rel: RelId, key: PropKeyId) -> Result<()> {
        self.require_relationship(rel)?;
        self.record(LogicalOp::PropertyRemove {
            entity: EntityKind::Relationship,
            id: rel,
            key,
        })
    }

    /// Adds a label to a node.
    pub fn node_add_label(&mut self, node: NodeId, label: LabelId) -> Result<()> {
        self.require_node(node)?;
        self.record(LogicalOp::LabelAdd { node, label })
    }

    /// Removes a label from a node.
    pub fn node_remove_label(&mut self, node: NodeId, label: LabelId) -> Result<()> {
        self.require_node(node)?;
        self.record(LogicalOp::LabelRemove { node, label })
    }

    /// Creates a token of `kind` and returns its id.
    pub fn create_token(&mut self, kind: TokenKind, name: &str, internal: bool) -> Result<u32> {
        let raw = self.ids.allocate(kind.id_type())?;
        let id = u32::try_from(raw)
            .map_err(|_| CoreError::Invalid(format!("{kind:?} token id space exhausted")))?;
        self.record(LogicalOp::TokenCreate {
            kind,
            id,
            name: name.to_owned(),
            internal,
        })?;
        Ok(id)
    }

    /// Reserves an id for a schema rule.
    pub fn reserve_schema_id(&mut self) -> Result<u64> {
        self.ids.allocate(IdType::Schema)
    }

    /// Stores a new schema rule under its (reserved) id.
    pub fn create_schema_rule(&mut self, rule: SchemaRule) -> Result<()> {
        self.record(LogicalOp::SchemaCreate { rule })
    }

    /// Drops a stored schema rule.
    pub fn drop_schema_rule(&mut self, id: u64) -> Result<()> {
        self.record(LogicalOp::SchemaDrop { id })
    }

    /// Locks, applies the recorded operations and extracts the commands.
    ///
    /// Fails with [`CoreError::StaleTransaction`] when the schema moved past
    /// `current_schema_epoch` and the transaction depends on it.
    pub fn create_commands(&mut self, current_schema_epoch: u64) -> Result<Vec<Command>> {
        if self.prepared {
            return Err(CoreError::Invalid(
                "transaction already produced its commands".into(),
            ));
        }
        if current_schema_epoch != self.schema_epoch
            && self.ops.iter().any(LogicalOp::depends_on_schema)
        {
            return Err(CoreError::StaleTransaction(format!(
                "schema changed from epoch {} to {current_schema_epoch}",
                self.schema_epoch
            )));
        }
        self.prepared = true;
        self.acquire_locks()?;
        self.apply_ops()?;
        let commands = self.extract_commands()?;
        debug!(
            ops = self.ops.len(),
            records = self.changes.change_size(),
            commands = commands.len(),
            "txn.commands.created"
        );
        Ok(commands)
    }

    /// Gives back allocated ids and releases every lock.
    pub fn rollback(self) -> Result<()> {
        self.locks.release_all();
        debug!(ops = self.ops.len(), "txn.rollback");
        self.ids.release()
    }

    fn acquire_locks(&mut self) -> Result<()> {
        let (mut plan, creates_per_node) = self.plan_locks()?;
        loop {
            plan.acquire(&*self.locks)?;
            // Dense flags and groups read while planning may have changed
            // before the locks were granted; under them they cannot.
            let (current, _) = self.plan_locks()?;
            if plan.covers(&current) {
                break;
            }
            debug!(planned = plan.len(), wanted = current.len(), "txn.locks.replan");
            plan.release(&*self.locks);
            plan.merge(&current);
        }

        let source = StoreSource::lenient(&self.stores);
        let relationships = self.relationships_to_lock(source, &creates_per_node)?;
        self.locks
            .acquire_exclusive(ResourceType::Relationship, &relationships)?;
        debug!(
            planned = plan.len(),
            relationships = relationships.len(),
            "txn.locks.acquired"
        );
        Ok(())
    }

    /// Node, group and schema locks implied by the operations and the
    /// current dense state of the touched nodes, with the number of
    /// relationships each node gains.
    fn plan_locks(&self) -> Result<(LockPlan, FxHashMap<NodeId, u64>)> {
        let mut source = StoreSource::lenient(&self.stores);
        let mut plan = LockPlan::new();
        let mut creates_per_node: FxHashMap<NodeId, u64> = FxHashMap::default();
        for op in &self.ops {
            match op {
                LogicalOp::TokenCreate { kind, id, .. } => {
                    plan.exclusive(ResourceType::Token, token_lock_id(*kind, *id));
                }
                LogicalOp::SchemaCreate { rule } => {
                    plan.exclusive(ResourceType::SchemaName, schema_name_lock_id(rule.name()));
                }
                LogicalOp::SchemaDrop { id } => {
                    let stored = self
                        .stores
                        .schema
                        .get_record(*id, crate::storage::RecordLoad::Lenient)?;
                    if let Some(rule) = stored.and_then(|r| r.rule) {
                        plan.exclusive(ResourceType::SchemaName, schema_name_lock_id(rule.name()));
                    }
                }
                LogicalOp::NodeCreate { .. } => {}
                LogicalOp::NodeDelete { id } => {
                    if !self.created_nodes.contains(id) {
                        plan.node_delete(*id)
                            .exclusive(ResourceType::RelationshipGroup, *id);
                    }
                }
                LogicalOp::RelationshipCreate {
                    rel_type,
                    start,
                    end,
                    ..
                } => {
                    for node in endpoints(*start, *end) {
                        *creates_per_node.entry(node).or_insert(0) += 1;
                        if self.created_nodes.contains(&node) {
                            continue;
                        }
                        plan.shared(ResourceType::NodeGroupDelete, node)
                            .shared(ResourceType::Degrees, node);
                        let dense = source.node(node)?.map(|n| n.dense).unwrap_or(false);
                        if dense {
                            plan.exclusive(ResourceType::RelationshipGroup, node);
                            let has_group = RelationshipChains::new(source)
                                .groups(node)?
                                .iter()
                                .any(|g| g.rel_type == *rel_type);
                            if !has_group {
                                plan.exclusive(ResourceType::Node, node);
                            }
                        } else {
                            plan.exclusive(ResourceType::Node, node)
                                .exclusive(ResourceType::RelationshipGroup, node);
                        }
                    }
                }
                LogicalOp::RelationshipDelete { id } => {
                    if self.created_rels.contains(id) {
                        continue;
                    }
                    let rel = source
                        .relationship(*id)?
                        .ok_or_else(|| CoreError::NotFound(format!("relationship {id}")))?;
                    plan.relationship_delete(*id, rel.first_node, rel.second_node);
                    for node in endpoints(rel.first_node, rel.second_node) {
                        let dense = source.node(node)?.map(|n| n.dense).unwrap_or(false);
                        plan.chain_change(node, dense);
                    }
                }
                LogicalOp::PropertySet { entity, id, .. }
                | LogicalOp::PropertyRemove { entity, id, .. } => {
                    if *entity == EntityKind::Node && !self.created_nodes.contains(id) {
                        plan.property_change(EntityKind::Node, *id);
                    }
                }
                LogicalOp::LabelAdd { node, .. } | LogicalOp::LabelRemove { node, .. } => {
                    if !self.created_nodes.contains(node) {
                        plan.label_change(*node);
                    }
                }
            }
        }
        Ok((plan, creates_per_node))
    }

    /// Relationship records the operations will touch, read once the node
    /// and group locks keep their chains stable.
    fn relationships_to_lock(
        &self,
        mut source: StoreSource<'_>,
        creates_per_node: &FxHashMap<NodeId, u64>,
    ) -> Result<Vec<RelId>> {
        let mut rels: BTreeSet<RelId> = BTreeSet::new();
        let threshold = self.config.dense_node_threshold;
        for op in &self.ops {
            match op {
                LogicalOp::RelationshipCreate {
                    rel_type,
                    start,
                    end,
                    ..
                } => {
                    for node in endpoints(*start, *end) {
                        let Some(record) = source.node(node)? else {
                            continue;
                        };
                        if record.dense {
                            if let Some(dir) = RelDirection::of(node, *start, *end) {
                                let groups = RelationshipChains::new(source).groups(node)?;
                                if let Some(group) = groups.iter().find(|g| g.rel_type == *rel_type) {
                                    rels.insert(group.head(dir));
                                }
                            }
                        } else if !is_null(record.next_rel) {
                            rels.insert(record.next_rel);
                            let count = source
                                .relationship(record.next_rel)?
                                .and_then(|r| r.chain_count_for(node))
                                .unwrap_or(0);
                            let pending = creates_per_node.get(&node).copied().unwrap_or(0);
                            if count + pending >= threshold {
                                for rel in RelationshipChains::new(source)
                                    .with_cycle_threshold(self.config.cycle_detection_threshold)
                                    .relationships(node, None, Direction::Both)?
                                {
                                    rels.insert(rel.id);
                                }
                            }
                        }
                    }
                }
                LogicalOp::RelationshipDelete { id } if !self.created_rels.contains(id) => {
                    let Some(rel) = source.relationship(*id)? else {
                        continue;
                    };
                    rels.insert(*id);
                    for side in [
                        crate::storage::ChainSide::First,
                        crate::storage::ChainSide::Second,
                    ] {
                        rels.insert(rel.prev(side));
                        rels.insert(rel.next(side));
                        let node = rel.node(side);
                        let Some(record) = source.node(node)? else {
                            continue;
                        };
                        if !record.dense {
                            rels.insert(record.next_rel);
                        } else if let Some(dir) = rel.direction_for(node) {
                            let groups = RelationshipChains::new(source).groups(node)?;
                            if let Some(group) = groups.iter().find(|g| g.rel_type == rel.rel_type) {
                                rels.insert(group.head(dir));
                            }
                        }
                    }
                }
                LogicalOp::PropertySet {
                    entity: EntityKind::Relationship,
                    id,
                    ..
                }
                | LogicalOp::PropertyRemove {
                    entity: EntityKind::Relationship,
                    id,
                    ..
                } => {
                    rels.insert(*id);
                }
                _ => {}
            }
        }
        Ok(rels
            .into_iter()
            .filter(|id| !is_null(*id) && !self.created_rels.contains(id))
            .collect())
    }

    fn modifier(&mut self) -> ChainModifier<'_> {
        ChainModifier::new(
            &mut self.changes,
            &mut self.ids,
            &*self.locks,
            &mut self.degrees,
            &self.config,
        )
    }

    fn apply_ops(&mut self) -> Result<()> {
        let ops = std::mem::take(&mut self.ops);
        let result = (0..=MAX_RANK).try_for_each(|rank| {
            ops.iter()
                .filter(|op| op.rank() == rank)
                .try_for_each(|op| self.apply_op(op))
        });
        self.ops = ops;
        result
    }

    fn apply_op(&mut self, op: &LogicalOp) -> Result<()> {
        let cycle = self.config.cycle_detection_threshold;
        match op {
            LogicalOp::TokenCreate {
                kind,
                id,
                name,
                internal,
            } => {
                let mut alloc = || self.ids.allocate(IdType::TokenName);
                let name_records = write_chain(&[], name.as_bytes(), &mut alloc)?;
                let token = TokenRecord {
                    id: u64::from(*id),
                    in_use: true,
                    created: true,
                    internal: *internal,
                    name_id: name_records.first().map(|r| r.id).unwrap_or(NULL_REF),
                    name_records,
                    light: false,
                };
                *self
                    .changes
                    .tokens_mut(*kind)
                    .create(u64::from(*id))?
                    .for_changing_data()? = token;
            }
            LogicalOp::NodeCreate { id } => {
                *self.changes.nodes.create(*id)?.for_changing_data()? = NodeRecord {
                    created: true,
                    ..NodeRecord::new(*id)
                };
            }
            LogicalOp::RelationshipCreate {
                id,
                rel_type,
                start,
                end,
            } => self.modifier().create(*id, *rel_type, *start, *end)?,
            LogicalOp::RelationshipDelete { id } => {
                self.modifier().ensure_relationship_locked(*id)?;
                properties::delete_chain(&mut self.changes, PropertyOwner::Relationship(*id), cycle)?;
                self.modifier().delete(*id)?;
            }
            LogicalOp::PropertySet {
                entity,
                id,
                key,
                value,
            } => {
                if self.entity_deleted(*entity, *id) {
                    return Ok(());
                }
                if *entity == EntityKind::Relationship {
                    self.modifier().ensure_relationship_locked(*id)?;
                }
                properties::set_property(
                    &mut self.changes,
                    &mut self.ids,
                    owner(*entity, *id),
                    *key,
                    value.clone(),
                    cycle,
                )?;
            }
            LogicalOp::PropertyRemove { entity, id, key } => {
                if self.entity_deleted(*entity, *id) {
                    return Ok(());
                }
                if *entity == EntityKind::Relationship {
                    self.modifier().ensure_relationship_locked(*id)?;
                }
                properties::remove_property(&mut self.changes, owner(*entity, *id), *key, cycle)?;
            }
            LogicalOp::LabelAdd { node, label } => {
                if self.deleted_nodes.contains(node) {
                    return Ok(());
                }
                let mut proxy = self.changes.nodes.get_or_load(*node)?;
                if node_labels(proxy.for_reading_data()?)?.contains(label) {
                    return Ok(());
                }
                let mut alloc = || self.ids.allocate(IdType::NodeLabels);
                add_label(proxy.for_changing_data()?, *label, &mut alloc)?;
            }
            LogicalOp::LabelRemove { node, label } => {
                if self.deleted_nodes.contains(node) {
                    return Ok(());
                }
                let mut proxy = self.changes.nodes.get_or_load(*node)?;
                if !node_labels(proxy.for_reading_data()?)?.contains(label) {
                    return Ok(());
                }
                let mut alloc = || self.ids.allocate(IdType::NodeLabels);
                remove_label(proxy.for_changing_data()?, *label, &mut alloc)?;
            }
            LogicalOp::NodeDelete { id } => self.delete_node(*id)?,
            LogicalOp::SchemaCreate { rule } => {
                *self.changes.schema.create(rule.id())?.for_changing_data()? = SchemaRecord {
                    id: rule.id(),
                    in_use: true,
                    created: true,
                    constraint: rule.is_constraint(),
                    next_prop: NULL_REF,
                    rule: Some(rule.clone()),
                };
            }
            LogicalOp::SchemaDrop { id } => {
                properties::delete_chain(&mut self.changes, PropertyOwner::Schema(*id), cycle)?;
                self.changes.schema.get_or_load(*id)?.for_changing_data()?.in_use = false;
            }
        }
        Ok(())
    }

    fn entity_deleted(&self, entity: EntityKind, id: u64) -> bool {
        match entity {
            EntityKind::Node => self.deleted_nodes.contains(&id),
            EntityKind::Relationship => self.deleted_rels.contains(&id),
        }
    }

    fn delete_node(&mut self, id: NodeId) -> Result<()> {
        let cycle = self.config.cycle_detection_threshold;
        let (dense, head) = {
            let record = self.changes.nodes.get_or_load(id)?.into_linkage();
            (record.dense, record.next_rel)
        };
        let still_connected = || {
            CoreError::Invalid(format!("cannot delete node {id}: it still has relationships"))
        };
        if dense {
            for group in group_ids(&mut self.changes, id, cycle)? {
                let empty = self
                    .changes
                    .groups
                    .get_or_load(group)?
                    .for_reading_linkage()
                    .is_empty();
                if !empty {
                    return Err(still_connected());
                }
                delete_group(&mut self.changes, id, group, cycle)?;
            }
        } else if !is_null(head) {
            return Err(still_connected());
        }
        properties::delete_chain(&mut self.changes, PropertyOwner::Node(id), cycle)?;
        self.changes.nodes.get_or_load(id)?.for_changing_data()?.in_use = false;
        Ok(())
    }

    fn extract_commands(&mut self) -> Result<Vec<Command>> {
        let counts = self.derive_counts()?;
        self.free_unused_creations()?;
        let changes = &self.changes;
        let mut out = Vec::with_capacity(changes.change_size());

        for kind in [
            TokenKind::Label,
            TokenKind::RelationshipType,
            TokenKind::PropertyKey,
        ] {
            push_all(changes.tokens(kind), &mut out, |command| Command::Token {
                kind,
                command,
            });
        }
        for mode in [CommandMode::Create, CommandMode::Update] {
            push_mode(&changes.properties, mode, &mut out, Command::Property);
            push_mode(&changes.relationships, mode, &mut out, Command::Relationship);
            push_mode(&changes.groups, mode, &mut out, Command::RelationshipGroup);
            push_mode(&changes.nodes, mode, &mut out, Command::Node);
        }
        push_mode(&changes.relationships, CommandMode::Delete, &mut out, Command::Relationship);
        push_mode(&changes.groups, CommandMode::Delete, &mut out, Command::RelationshipGroup);
        push_mode(&changes.nodes, CommandMode::Delete, &mut out, Command::Node);
        for mode in [CommandMode::Delete, CommandMode::Create, CommandMode::Update] {
            push_mode(&changes.schema, mode, &mut out, Command::SchemaRule);
        }
        push_mode(&changes.properties, CommandMode::Delete, &mut out, Command::Property);

        for (label, delta) in counts.node_deltas() {
            out.push(Command::NodeCount { label, delta });
        }
        for ((start_label, rel_type, end_label), delta) in counts.relationship_deltas() {
            out.push(Command::RelationshipCount {
                start_label,
                rel_type,
                end_label,
                delta,
            });
        }
        for (group, direction, delta) in self.degrees.deltas() {
            out.push(Command::GroupDegree {
                group,
                direction,
                delta,
            });
        }
        Ok(out)
    }

    /// Records created and dropped again within the transaction produce no
    /// command; their ids go straight back to the generators.
    fn free_unused_creations(&mut self) -> Result<()> {
        let mut unused: Vec<(IdType, u64)> = Vec::new();
        collect_unused(&self.changes.nodes, &mut unused);
        collect_unused(&self.changes.relationships, &mut unused);
        collect_unused(&self.changes.groups, &mut unused);
        collect_unused(&self.changes.properties, &mut unused);
        collect_unused(&self.changes.schema, &mut unused);
        for (id_type, id) in unused {
            self.ids.free(id_type, id)?;
        }
        Ok(())
    }

    fn labels_of(&mut self, node: NodeId, before: bool) -> Result<SmallVec<[LabelId; 4]>> {
        let mut proxy = self.changes.nodes.get_or_load(node)?;
        proxy.for_reading_data()?;
        let record = match proxy.before() {
            Some(image) if before => image,
            _ => proxy.for_reading_linkage(),
        };
        if !record.in_use && !before {
            return Ok(SmallVec::new());
        }
        node_labels(record)
    }

    fn derive_counts(&mut self) -> Result<CountsDelta> {
        let mut counts = CountsDelta::default();
        let mut relabelled: Vec<(NodeId, Vec<LabelId>, Vec<LabelId>)> = Vec::new();
        for change in self.changes.nodes.sorted_changes() {
            let (before, after) = (change.before, change.after);
            match (before.in_use, after.in_use) {
                (false, true) => counts.node_with_labels(&node_labels(after)?, 1),
                (true, false) => counts.node_with_labels(&node_labels(before)?, -1),
                (true, true) if !before.is_light() && !after.is_light() => {
                    let old = node_labels(before)?;
                    let new = node_labels(after)?;
                    if old != new {
                        let removed: Vec<_> = old.iter().filter(|l| !new.contains(l)).copied().collect();
                        let added: Vec<_> = new.iter().filter(|l| !old.contains(l)).copied().collect();
                        for label in &removed {
                            counts.increment_node(*label, -1);
                        }
                        for label in &added {
                            counts.increment_node(*label, 1);
                        }
                        relabelled.push((after.id, removed, added));
                    }
                }
                _ => {}
            }
        }

        let rel_changes: Vec<(NodeId, NodeId, TypeId, i64)> = self
            .changes
            .relationships
            .sorted_changes()
            .into_iter()
            .filter_map(|c| match (c.before.in_use, c.after.in_use) {
                (false, true) => Some((c.after.first_node, c.after.second_node, c.after.rel_type, 1)),
                (true, false) => Some((c.before.first_node, c.before.second_node, c.before.rel_type, -1)),
                _ => None,
            })
            .collect();
        for (start, end, rel_type, delta) in rel_changes {
            let before = delta < 0;
            let start_labels = self.labels_of(start, before)?;
            let end_labels = self.labels_of(end, before)?;
            counts.relationship_with_labels(&start_labels, rel_type, &end_labels, delta);
        }

        let cycle = self.config.cycle_detection_threshold;
        for (node, removed, added) in relabelled {
            let rels = RelationshipChains::new(&mut self.changes)
                .with_cycle_threshold(cycle)
                .relationships(node, None, Direction::Both)?;
            for rel in rels {
                if !self.created_rels.contains(&rel.id) {
                    counts.relationship_label_change(rel.rel_type, rel.direction, &removed, &added);
                }
            }
        }
        Ok(counts)
    }
}

fn endpoints(start: NodeId, end: NodeId) -> SmallVec<[NodeId; 2]> {
    let mut nodes = SmallVec::new();
    nodes.push(start.min(end));
    if start != end {
        nodes.push(start.max(end));
    }
    nodes
}

fn is_dropped_creation<R: Record>(before: &R, after: &R, created: bool) -> bool {
    created && !before.in_use() && !after.in_use()
}

fn collect_unused<R: Record>(changes: &RecordChanges<R>, out: &mut Vec<(IdType, u64)>) {
    for change in changes.changes() {
        if is_dropped_creation(change.before, change.after, change.created) {
            out.push((R::ID_TYPE, change.after.id()));
            if let Some(dynamic) = R::DYNAMIC_ID_TYPE {
                change.after.for_each_dynamic_id(&mut |id| out.push((dynamic, id)));
            }
        }
    }
}

fn push_mode<R: Record>(
    changes: &RecordChanges<R>,
    mode: CommandMode,
    out: &mut Vec<Command>,
    wrap: impl Fn(RecordCommand<R>) -> Command,
) {
    for change in changes.sorted_changes() {
        if is_dropped_creation(change.before, change.after, change.created) {
            continue;
        }
        if CommandMode::of(change.before, change.after) == mode {
            out.push(wrap(RecordCommand::new(
                change.before.clone(),
                change.after.clone(),
            )));
        }
    }
}

fn push_all<R: Record>(
    changes: &RecordChanges<R>,
    out: &mut Vec<Command>,
    wrap: impl Fn(RecordCommand<R>) -> Command,
) {
    for change in changes.sorted_changes() {
        out.push(wrap(RecordCommand::new(
            change.before.clone(),
            change.after.clone(),
        )));
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::ids::IdGenerators;
    use crate::locking::LockTable;
    use crate::types::ANY_LABEL;

    fn state(stores: &Stores, table: &LockTable, config: EngineConfig) -> TransactionRecordState {
        TransactionRecordState::new(stores.clone(), config, Arc::new(table.client()), 0)
    }

    fn setup() -> Result<(Stores, LockTable)> {
        Ok((Stores::in_memory(IdGenerators::in_memory())?, LockTable::new()))
    }

    #[test]
    fn commands_follow_extraction_order() -> Result<()> {
        let (stores, table) = setup()?;
        let mut tx = state(&stores, &table, EngineConfig::new());
        let label = tx.create_token(TokenKind::Label, "Person", false)?;
        let a = tx.node_create()?;
        let b = tx.node_create()?;
        tx.node_add_label(a, label)?;
        tx.relationship_create(0, a, b)?;
        tx.node_set_property(a, 1, 42i64)?;
        let commands = tx.create_commands(0)?;
        let kinds: Vec<_> = commands.iter().map(Command::kind_name).collect();
        assert_eq!(kinds[0], "token");
        let first_node = kinds.iter().position(|k| *k == "node");
        let first_rel = kinds.iter().position(|k| *k == "relationship");
        let first_prop = kinds.iter().position(|k| *k == "property");
        assert!(first_prop < first_rel && first_rel < first_node);
        assert!(commands.contains(&Command::NodeCount { label, delta: 1 }));
        assert!(commands.contains(&Command::NodeCount {
            label: ANY_LABEL,
            delta: 2
        }));
        Ok(())
    }

    #[test]
    fn created_then_deleted_records_emit_nothing() -> Result<()> {
        let (stores, table) = setup()?;
        let mut tx = state(&stores, &table, EngineConfig::new());
        let a = tx.node_create()?;
        let r = tx.relationship_create(3, a, a)?;
        tx.relationship_delete(r)?;
        tx.node_delete(a)?;
        let commands = tx.create_commands(0)?;
        assert!(commands.is_empty(), "unexpected commands: {commands:?}");
        Ok(())
    }

    #[test]
    fn deleting_connected_node_fails() -> Result<()> {
        let (stores, table) = setup()?;
        let mut tx = state(&stores, &table, EngineConfig::new());
        let a = tx.node_create()?;
        let b = tx.node_create()?;
        tx.relationship_create(0, a, b)?;
        tx.node_delete(a)?;
        assert!(matches!(tx.create_commands(0), Err(CoreError::Invalid(_))));
        Ok(())
    }

    #[test]
    fn schema_move_makes_label_writes_stale() -> Result<()> {
        let (stores, table) = setup()?;
        let mut tx = state(&stores, &table, EngineConfig::new());
        let a = tx.node_create()?;
        tx.node_add_label(a, 1)?;
        let err = tx.create_commands(1);
        assert!(matches!(err, Err(CoreError::StaleTransaction(_))));

        let mut plain = state(&stores, &table, EngineConfig::new());
        plain.node_create()?;
        assert!(plain.create_commands(1).is_ok());
        Ok(())
    }

    #[test]
    fn rollback_returns_ids() -> Result<()> {
        let (stores, table) = setup()?;
        let mut tx = state(&stores, &table, EngineConfig::new());
        let a = tx.node_create()?;
        tx.rollback()?;
        assert_eq!(stores.ids.next_id(IdType::Node)?, a);
        assert_eq!(table.snapshot().locked_resources, 0);
        Ok(())
    }

    #[test]
    fn schema_and_data_writes_do_not_mix() -> Result<()> {
        let (stores, table) = setup()?;
        let mut tx = state(&stores, &table, EngineConfig::new());
        tx.create_token(TokenKind::Label, "Person", false)?;
        tx.node_create()?;
        assert!(matches!(tx.drop_schema_rule(3), Err(CoreError::Invalid(_))));
        Ok(())
    }

    #[test]
    fn missing_endpoints_are_rejected_early() -> Result<()> {
        let (stores, table) = setup()?;
        let mut tx = state(&stores, &table, EngineConfig::new());
        assert!(matches!(
            tx.relationship_create(0, 7, 8),
            Err(CoreError::NotFound(_))
        ));
        Ok(())
    }
}
