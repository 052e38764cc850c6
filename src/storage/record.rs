//! Fixed-layout record types operated on by the transactional core.
//!
//! Records are plain field bags. Byte-level encoding belongs to the store
//! implementation; the core only needs field access, the in-use/created
//! flags and a way to split "light" linkage from "heavy" overflow content.

use std::fmt::Debug;

use smallvec::SmallVec;

use crate::schema::SchemaRule;
use crate::types::{
    is_null, GroupId, LabelId, NodeId, PropKeyId, PropRecordId, PropertyValue, RelDirection,
    RelId, TypeId, NULL_REF,
};

/// Maximum number of blocks a property record holds.
pub const BLOCKS_PER_PROPERTY_RECORD: usize = 4;
/// Largest string/bytes payload stored inline in a property block.
pub const INLINE_VALUE_LIMIT: usize = 24;
/// Maximum number of labels kept inline in a node record.
pub const INLINE_LABEL_LIMIT: usize = 4;

/// Id space a record or dynamic record is allocated from.
#[derive(Copy, Clone, Eq, PartialEq, Ord, PartialOrd, Hash, Debug)]
pub enum IdType {
    /// Node records.
    Node,
    /// Relationship records.
    Relationship,
    /// Relationship-group records.
    RelationshipGroup,
    /// Property records.
    Property,
    /// Dynamic records holding overflowing property values.
    PropertyValue,
    /// Dynamic records holding overflowing node label lists.
    NodeLabels,
    /// Dynamic records holding token names.
    TokenName,
    /// Label token records.
    LabelToken,
    /// Relationship type token records.
    RelationshipTypeToken,
    /// Property key token records.
    PropertyKeyToken,
    /// Schema records.
    Schema,
}

impl IdType {
    /// Every id type, in declaration order.
    pub const ALL: [IdType; 11] = [
        IdType::Node,
        IdType::Relationship,
        IdType::RelationshipGroup,
        IdType::Property,
        IdType::PropertyValue,
        IdType::NodeLabels,
        IdType::TokenName,
        IdType::LabelToken,
        IdType::RelationshipTypeToken,
        IdType::PropertyKeyToken,
        IdType::Schema,
    ];
}

/// Common behaviour of every record kind tracked by the change tracker.
pub trait Record: Clone + Debug + PartialEq + Send + Sync + 'static {
    /// Id space of this record kind.
    const ID_TYPE: IdType;
    /// Id space of dynamic records owned by this record kind, if any.
    const DYNAMIC_ID_TYPE: Option<IdType> = None;

    /// A record that is not in use, as returned for never-written ids.
    fn new_unused(id: u64) -> Self;
    /// Record id.
    fn id(&self) -> u64;
    /// Whether the record is in use.
    fn in_use(&self) -> bool;
    /// Sets the in-use flag.
    fn set_in_use(&mut self, in_use: bool);
    /// Whether the record was created by the current transaction.
    fn is_created(&self) -> bool;
    /// Marks the record as created by the current transaction.
    fn set_created(&mut self);

    /// Whether overflow content has not been loaded yet.
    fn is_light(&self) -> bool {
        false
    }

    /// Drops loaded overflow content, leaving linkage fields intact.
    fn strip_heavy(&mut self) {}

    /// Copies overflow content from `full`, a heavy copy of the same record.
    fn load_heavy_from(&mut self, _full: &Self) {}

    /// Resets fields that never reach the store (created flag, transient pointers).
    fn clear_transient(&mut self);

    /// Invokes `f` with the id of every in-use dynamic record owned by this record.
    fn for_each_dynamic_id(&self, _f: &mut dyn FnMut(u64)) {}

    /// Equality of the persisted portion of two records.
    fn persistent_eq(&self, other: &Self) -> bool {
        let mut a = self.clone();
        let mut b = other.clone();
        a.strip_heavy();
        b.strip_heavy();
        a.clear_transient();
        b.clear_transient();
        a == b
    }
}

/// Overflow record holding a chunk of a label list, property value or token name.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct DynamicRecord {
    /// Record id.
    pub id: u64,
    /// Whether the record is in use.
    pub in_use: bool,
    /// Next record in the overflow chain or [`NULL_REF`].
    pub next: u64,
    /// Payload chunk.
    pub data: Vec<u8>,
}

impl DynamicRecord {
    /// An in-use record with payload `data`.
    pub fn new(id: u64, data: Vec<u8>) -> Self {
        Self {
            id,
            in_use: true,
            next: NULL_REF,
            data,
        }
    }
}

/// How a node stores its labels.
#[derive(Clone, Debug, PartialEq, Eq)]
pub enum LabelField {
    /// Sorted labels stored directly in the node record.
    Inline(SmallVec<[LabelId; INLINE_LABEL_LIMIT]>),
    /// Labels stored in a chain of dynamic records starting at this id.
    Dynamic(u64),
}

impl Default for LabelField {
    fn default() -> Self {
        LabelField::Inline(SmallVec::new())
    }
}

impl LabelField {
    /// Whether the label list lives in overflow storage.
    pub fn is_dynamic(&self) -> bool {
        matches!(self, LabelField::Dynamic(_))
    }
}

/// Node record.
#[derive(Clone, Debug, PartialEq)]
pub struct NodeRecord {
    /// Record id.
    pub id: NodeId,
    /// Whether the record is in use.
    pub in_use: bool,
    /// Created by the current transaction.
    pub created: bool,
    /// Relationships are partitioned into per-type groups.
    pub dense: bool,
    /// First relationship (sparse) or first relationship group (dense).
    pub next_rel: u64,
    /// First property record.
    pub next_prop: PropRecordId,
    /// Label storage.
    pub labels: LabelField,
    /// Loaded label overflow records when `labels` is dynamic.
    pub dynamic_labels: Vec<DynamicRecord>,
    /// Overflow records have not been loaded.
    pub light: bool,
}

impl NodeRecord {
    /// An in-use node without relationships, properties or labels.
    pub fn new(id: NodeId) -> Self {
        Self {
            in_use: true,
            ..Self::new_unused(id)
        }
    }
}

impl Record for NodeRecord {
    const ID_TYPE: IdType = IdType::Node;
    const DYNAMIC_ID_TYPE: Option<IdType> = Some(IdType::NodeLabels);

    fn new_unused(id: u64) -> Self {
        Self {
            id,
            in_use: false,
            created: false,
            dense: false,
            next_rel: NULL_REF,
            next_prop: NULL_REF,
            labels: LabelField::default(),
            dynamic_labels: Vec::new(),
            light: false,
        }
    }

    fn id(&self) -> u64 {
        self.id
    }

    fn in_use(&self) -> bool {
        self.in_use
    }

    fn set_in_use(&mut self, in_use: bool) {
        self.in_use = in_use;
    }

    fn is_created(&self) -> bool {
        self.created
    }

    fn set_created(&mut self) {
        self.created = true;
    }

    fn is_light(&self) -> bool {
        self.light && self.labels.is_dynamic()
    }

    fn strip_heavy(&mut self) {
        self.dynamic_labels.clear();
        self.light = true;
    }

    fn load_heavy_from(&mut self, full: &Self) {
        self.dynamic_labels = full.dynamic_labels.clone();
        self.light = false;
    }

    fn clear_transient(&mut self) {
        self.created = false;
    }

    fn for_each_dynamic_id(&self, f: &mut dyn FnMut(u64)) {
        for record in self.dynamic_labels.iter().filter(|r| r.in_use) {
            f(record.id);
        }
    }
}

/// One of the two chains a relationship record participates in.
#[derive(Copy, Clone, Eq, PartialEq, Debug)]
pub enum ChainSide {
    /// The chain of the start node.
    First,
    /// The chain of the end node.
    Second,
}

/// Relationship record.
///
/// A record sits in two doubly linked chains, one per endpoint. The record at
/// the head of a chain has its first-in-chain flag set for that side and keeps
/// the chain's length in the prev field instead of a pointer.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct RelationshipRecord {
    /// Record id.
    pub id: RelId,
    /// Whether the record is in use.
    pub in_use: bool,
    /// Created by the current transaction.
    pub created: bool,
    /// Start node.
    pub first_node: NodeId,
    /// End node.
    pub second_node: NodeId,
    /// Relationship type.
    pub rel_type: TypeId,
    /// Prev in the start node's chain, or the chain length when first.
    pub first_prev_rel: u64,
    /// Next in the start node's chain.
    pub first_next_rel: RelId,
    /// Prev in the end node's chain, or the chain length when first.
    pub second_prev_rel: u64,
    /// Next in the end node's chain.
    pub second_next_rel: RelId,
    /// Head of the start node's chain.
    pub first_in_first_chain: bool,
    /// Head of the end node's chain.
    pub first_in_second_chain: bool,
    /// First property record.
    pub next_prop: PropRecordId,
}

impl RelationshipRecord {
    /// An in-use relationship with unlinked chain pointers.
    pub fn new(id: RelId, first_node: NodeId, second_node: NodeId, rel_type: TypeId) -> Self {
        Self {
            in_use: true,
            first_node,
            second_node,
            rel_type,
            ..Self::new_unused(id)
        }
    }

    /// Endpoint node of `side`.
    pub fn node(&self, side: ChainSide) -> NodeId {
        match side {
            ChainSide::First => self.first_node,
            ChainSide::Second => self.second_node,
        }
    }

    /// Chain sides of this record that belong to `node`.
    pub fn sides_of(&self, node: NodeId) -> SmallVec<[ChainSide; 2]> {
        let mut sides = SmallVec::new();
        if self.first_node == node {
            sides.push(ChainSide::First);
        }
        if self.second_node == node {
            sides.push(ChainSide::Second);
        }
        sides
    }

    /// Whether both endpoints are the same node.
    pub fn is_loop(&self) -> bool {
        self.first_node == self.second_node
    }

    /// Next pointer on `side`.
    pub fn next(&self, side: ChainSide) -> RelId {
        match side {
            ChainSide::First => self.first_next_rel,
            ChainSide::Second => self.second_next_rel,
        }
    }

    /// Sets the next pointer on `side`.
    pub fn set_next(&mut self, side: ChainSide, next: RelId) {
        match side {
            ChainSide::First => self.first_next_rel = next,
            ChainSide::Second => self.second_next_rel = next,
        }
    }

    /// Raw prev field on `side` (a chain length when first in chain).
    pub fn prev_field(&self, side: ChainSide) -> u64 {
        match side {
            ChainSide::First => self.first_prev_rel,
            ChainSide::Second => self.second_prev_rel,
        }
    }

    /// Prev pointer on `side`, [`NULL_REF`] when first in chain.
    pub fn prev(&self, side: ChainSide) -> RelId {
        if self.is_first_in_chain(side) {
            NULL_REF
        } else {
            self.prev_field(side)
        }
    }

    /// Sets the raw prev field and the first-in-chain flag on `side`.
    pub fn set_prev(&mut self, side: ChainSide, value: u64, first_in_chain: bool) {
        match side {
            ChainSide::First => {
                self.first_prev_rel = value;
                self.first_in_first_chain = first_in_chain;
            }
            ChainSide::Second => {
                self.second_prev_rel = value;
                self.first_in_second_chain = first_in_chain;
            }
        }
    }

    /// Whether the record heads the chain of `side`.
    pub fn is_first_in_chain(&self, side: ChainSide) -> bool {
        match side {
            ChainSide::First => self.first_in_first_chain,
            ChainSide::Second => self.first_in_second_chain,
        }
    }

    /// Next relationship in `node`'s chain.
    pub fn next_for(&self, node: NodeId) -> Option<RelId> {
        self.sides_of(node).first().map(|side| self.next(*side))
    }

    /// Whether the record heads `node`'s chain.
    pub fn is_first_for(&self, node: NodeId) -> bool {
        self.sides_of(node)
            .first()
            .map(|side| self.is_first_in_chain(*side))
            .unwrap_or(false)
    }

    /// Chain length stored in the head record for `node`'s chain.
    pub fn chain_count_for(&self, node: NodeId) -> Option<u64> {
        self.sides_of(node)
            .first()
            .filter(|side| self.is_first_in_chain(**side))
            .map(|side| self.prev_field(*side))
    }

    /// Direction of this record as seen from `node`.
    pub fn direction_for(&self, node: NodeId) -> Option<RelDirection> {
        RelDirection::of(node, self.first_node, self.second_node)
    }
}

impl Record for RelationshipRecord {
    const ID_TYPE: IdType = IdType::Relationship;

    fn new_unused(id: u64) -> Self {
        Self {
            id,
            in_use: false,
            created: false,
            first_node: NULL_REF,
            second_node: NULL_REF,
            rel_type: 0,
            first_prev_rel: 1,
            first_next_rel: NULL_REF,
            second_prev_rel: 1,
            second_next_rel: NULL_REF,
            first_in_first_chain: true,
            first_in_second_chain: true,
            next_prop: NULL_REF,
        }
    }

    fn id(&self) -> u64 {
        self.id
    }

    fn in_use(&self) -> bool {
        self.in_use
    }

    fn set_in_use(&mut self, in_use: bool) {
        self.in_use = in_use;
    }

    fn is_created(&self) -> bool {
        self.created
    }

    fn set_created(&mut self) {
        self.created = true;
    }

    fn clear_transient(&mut self) {
        self.created = false;
    }
}

/// Relationship-group record: the chains of one type for one dense node.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct GroupRecord {
    /// Record id.
    pub id: GroupId,
    /// Whether the record is in use.
    pub in_use: bool,
    /// Created by the current transaction.
    pub created: bool,
    /// Relationship type of every relationship in this group.
    pub rel_type: TypeId,
    /// Dense node owning the group.
    pub owning_node: NodeId,
    /// Next group of the owning node (higher type id).
    pub next: GroupId,
    /// Previous group, populated while walking and never persisted.
    pub prev: GroupId,
    /// Head of the outgoing chain.
    pub first_out: RelId,
    /// Head of the incoming chain.
    pub first_in: RelId,
    /// Head of the loop chain.
    pub first_loop: RelId,
    /// Outgoing degree lives in the counts store.
    pub external_degrees_out: bool,
    /// Incoming degree lives in the counts store.
    pub external_degrees_in: bool,
    /// Loop degree lives in the counts store.
    pub external_degrees_loop: bool,
}

impl GroupRecord {
    /// An in-use, empty group.
    pub fn new(id: GroupId, rel_type: TypeId, owning_node: NodeId) -> Self {
        Self {
            in_use: true,
            rel_type,
            owning_node,
            ..Self::new_unused(id)
        }
    }

    /// Head of the chain for `dir`.
    pub fn head(&self, dir: RelDirection) -> RelId {
        match dir {
            RelDirection::Outgoing => self.first_out,
            RelDirection::Incoming => self.first_in,
            RelDirection::Loop => self.first_loop,
        }
    }

    /// Sets the head of the chain for `dir`.
    pub fn set_head(&mut self, dir: RelDirection, rel: RelId) {
        match dir {
            RelDirection::Outgoing => self.first_out = rel,
            RelDirection::Incoming => self.first_in = rel,
            RelDirection::Loop => self.first_loop = rel,
        }
    }

    /// Whether the degree of `dir` is kept in the counts store.
    pub fn has_external_degrees(&self, dir: RelDirection) -> bool {
        match dir {
            RelDirection::Outgoing => self.external_degrees_out,
            RelDirection::Incoming => self.external_degrees_in,
            RelDirection::Loop => self.external_degrees_loop,
        }
    }

    /// Sets the external-degrees flag of `dir`.
    pub fn set_external_degrees(&mut self, dir: RelDirection, external: bool) {
        match dir {
            RelDirection::Outgoing => self.external_degrees_out = external,
            RelDirection::Incoming => self.external_degrees_in = external,
            RelDirection::Loop => self.external_degrees_loop = external,
        }
    }

    /// All three chains are empty.
    pub fn is_empty(&self) -> bool {
        is_null(self.first_out) && is_null(self.first_in) && is_null(self.first_loop)
    }
}

impl Record for GroupRecord {
    const ID_TYPE: IdType = IdType::RelationshipGroup;

    fn new_unused(id: u64) -> Self {
        Self {
            id,
            in_use: false,
            created: false,
            rel_type: 0,
            owning_node: NULL_REF,
            next: NULL_REF,
            prev: NULL_REF,
            first_out: NULL_REF,
            first_in: NULL_REF,
            first_loop: NULL_REF,
            external_degrees_out: false,
            external_degrees_in: false,
            external_degrees_loop: false,
        }
    }

    fn id(&self) -> u64 {
        self.id
    }

    fn in_use(&self) -> bool {
        self.in_use
    }

    fn set_in_use(&mut self, in_use: bool) {
        self.in_use = in_use;
    }

    fn is_created(&self) -> bool {
        self.created
    }

    fn set_created(&mut self) {
        self.created = true;
    }

    fn clear_transient(&mut self) {
        self.created = false;
        self.prev = NULL_REF;
    }
}

/// Entity owning a property chain.
#[derive(Copy, Clone, Debug, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub enum PropertyOwner {
    /// Not owned (unused record).
    None,
    /// Node properties.
    Node(NodeId),
    /// Relationship properties.
    Relationship(RelId),
    /// Schema rule properties.
    Schema(u64),
}

/// Payload type of a property value stored in dynamic records.
#[derive(Copy, Clone, Debug, PartialEq, Eq)]
pub enum DynamicValueKind {
    /// UTF-8 string.
    String,
    /// Raw bytes.
    Bytes,
}

/// Value slot of a property block.
#[derive(Clone, Debug, PartialEq)]
pub enum BlockValue {
    /// Value stored in the block.
    Inline(PropertyValue),
    /// Value stored in a chain of dynamic records.
    Dynamic {
        /// Payload type.
        kind: DynamicValueKind,
        /// First dynamic record.
        first: u64,
        /// Loaded dynamic records, empty while light.
        records: Vec<DynamicRecord>,
    },
}

/// One key/value entry of a property record.
#[derive(Clone, Debug, PartialEq)]
pub struct PropertyBlock {
    /// Property key token.
    pub key: PropKeyId,
    /// Stored value.
    pub value: BlockValue,
}

/// Property record.
#[derive(Clone, Debug, PartialEq)]
pub struct PropertyRecord {
    /// Record id.
    pub id: PropRecordId,
    /// Whether the record is in use.
    pub in_use: bool,
    /// Created by the current transaction.
    pub created: bool,
    /// Previous record in the owner's chain.
    pub prev_prop: PropRecordId,
    /// Next record in the owner's chain.
    pub next_prop: PropRecordId,
    /// Owner of the chain.
    pub owner: PropertyOwner,
    /// Up to [`BLOCKS_PER_PROPERTY_RECORD`] blocks.
    pub blocks: Vec<PropertyBlock>,
    /// Dynamic value records have not been loaded.
    pub light: bool,
}

impl PropertyRecord {
    /// An in-use, empty property record owned by `owner`.
    pub fn new(id: PropRecordId, owner: PropertyOwner) -> Self {
        Self {
            in_use: true,
            owner,
            ..Self::new_unused(id)
        }
    }

    /// Block holding `key`.
    pub fn block(&self, key: PropKeyId) -> Option<&PropertyBlock> {
        self.blocks.iter().find(|b| b.key == key)
    }

    /// Whether another block fits.
    pub fn has_space(&self) -> bool {
        self.blocks.len() < BLOCKS_PER_PROPERTY_RECORD
    }
}

impl Record for PropertyRecord {
    const ID_TYPE: IdType = IdType::Property;
    const DYNAMIC_ID_TYPE: Option<IdType> = Some(IdType::PropertyValue);

    fn new_unused(id: u64) -> Self {
        Self {
            id,
            in_use: false,
            created: false,
            prev_prop: NULL_REF,
            next_prop: NULL_REF,
            owner: PropertyOwner::None,
            blocks: Vec::new(),
            light: false,
        }
    }

    fn id(&self) -> u64 {
        self.id
    }

    fn in_use(&self) -> bool {
        self.in_use
    }

    fn set_in_use(&mut self, in_use: bool) {
        self.in_use = in_use;
    }

    fn is_created(&self) -> bool {
        self.created
    }

    fn set_created(&mut self) {
        self.created = true;
    }

    fn is_light(&self) -> bool {
        self.light
            && self
                .blocks
                .iter()
                .any(|b| matches!(b.value, BlockValue::Dynamic { .. }))
    }

    fn strip_heavy(&mut self) {
        for block in &mut self.blocks {
            if let BlockValue::Dynamic { records, .. } = &mut block.value {
                records.clear();
            }
        }
        self.light = true;
    }

    fn load_heavy_from(&mut self, full: &Self) {
        for block in &mut self.blocks {
            if let BlockValue::Dynamic { records, first, .. } = &mut block.value {
                let loaded = full.blocks.iter().find_map(|b| match &b.value {
                    BlockValue::Dynamic {
                        first: other,
                        records,
                        ..
                    } if other == first => Some(records.clone()),
                    _ => None,
                });
                if let Some(loaded) = loaded {
                    *records = loaded;
                }
            }
        }
        self.light = false;
    }

    fn clear_transient(&mut self) {
        self.created = false;
    }

    fn for_each_dynamic_id(&self, f: &mut dyn FnMut(u64)) {
        for block in &self.blocks {
            if let BlockValue::Dynamic { records, .. } = &block.value {
                for record in records.iter().filter(|r| r.in_use) {
                    f(record.id);
                }
            }
        }
    }
}

/// Kind of token a token record names.
#[derive(Copy, Clone, Debug, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub enum TokenKind {
    /// Node labels.
    Label,
    /// Relationship types.
    RelationshipType,
    /// Property keys.
    PropertyKey,
}

impl TokenKind {
    /// Id space of token records of this kind.
    pub fn id_type(self) -> IdType {
        match self {
            TokenKind::Label => IdType::LabelToken,
            TokenKind::RelationshipType => IdType::RelationshipTypeToken,
            TokenKind::PropertyKey => IdType::PropertyKeyToken,
        }
    }
}

/// Token record: id to name mapping for labels, types and property keys.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct TokenRecord {
    /// Token id.
    pub id: u64,
    /// Whether the record is in use.
    pub in_use: bool,
    /// Created by the current transaction.
    pub created: bool,
    /// Internal tokens are hidden from users.
    pub internal: bool,
    /// First dynamic record of the name.
    pub name_id: u64,
    /// Loaded name records.
    pub name_records: Vec<DynamicRecord>,
    /// Name records have not been loaded.
    pub light: bool,
}

impl Record for TokenRecord {
    const ID_TYPE: IdType = IdType::LabelToken;
    const DYNAMIC_ID_TYPE: Option<IdType> = Some(IdType::TokenName);

    fn new_unused(id: u64) -> Self {
        Self {
            id,
            in_use: false,
            created: false,
            internal: false,
            name_id: NULL_REF,
            name_records: Vec::new(),
            light: false,
        }
    }

    fn id(&self) -> u64 {
        self.id
    }

    fn in_use(&self) -> bool {
        self.in_use
    }

    fn set_in_use(&mut self, in_use: bool) {
        self.in_use = in_use;
    }

    fn is_created(&self) -> bool {
        self.created
    }

    fn set_created(&mut self) {
        self.created = true;
    }

    fn is_light(&self) -> bool {
        self.light && !is_null(self.name_id)
    }

    fn strip_heavy(&mut self) {
        self.name_records.clear();
        self.light = true;
    }

    fn load_heavy_from(&mut self, full: &Self) {
        self.name_records = full.name_records.clone();
        self.light = false;
    }

    fn clear_transient(&mut self) {
        self.created = false;
    }

    fn for_each_dynamic_id(&self, f: &mut dyn FnMut(u64)) {
        for record in self.name_records.iter().filter(|r| r.in_use) {
            f(record.id);
        }
    }
}

/// Schema record holding one index or constraint rule.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct SchemaRecord {
    /// Rule id.
    pub id: u64,
    /// Whether the record is in use.
    pub in_use: bool,
    /// Created by the current transaction.
    pub created: bool,
    /// The rule is a constraint rather than an index.
    pub constraint: bool,
    /// First property record of the rule's properties.
    pub next_prop: PropRecordId,
    /// The stored rule.
    pub rule: Option<SchemaRule>,
}

impl Record for SchemaRecord {
    const ID_TYPE: IdType = IdType::Schema;

    fn new_unused(id: u64) -> Self {
        Self {
            id,
            in_use: false,
            created: false,
            constraint: false,
            next_prop: NULL_REF,
            rule: None,
        }
    }

    fn id(&self) -> u64 {
        self.id
    }

    fn in_use(&self) -> bool {
        self.in_use
    }

    fn set_in_use(&mut self, in_use: bool) {
        self.in_use = in_use;
    }

    fn is_created(&self) -> bool {
        self.created
    }

    fn set_created(&mut self) {
        self.created = true;
    }

    fn clear_transient(&mut self) {
        self.created = false;
    }
}
