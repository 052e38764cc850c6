//! Schema rules and the schema cache consulted when deriving index updates.

use std::collections::BTreeMap;
use std::sync::atomic::{AtomicU64, Ordering};

use parking_lot::RwLock;
use rustc_hash::FxHashMap;
use smallvec::SmallVec;

use crate::types::{EntityKind, PropKeyId};

/// Entity tokens and property keys an index or constraint covers.
#[derive(Clone, Debug, PartialEq, Eq, Hash)]
pub struct SchemaDescriptor {
    /// Entity kind the tokens refer to.
    pub entity: EntityKind,
    /// Labels or relationship types; an entity matches when it has any of them.
    pub tokens: SmallVec<[u32; 2]>,
    /// Indexed property keys, in index key order.
    pub properties: SmallVec<[PropKeyId; 4]>,
}

impl SchemaDescriptor {
    /// Descriptor over one label.
    pub fn for_label(label: u32, properties: &[PropKeyId]) -> Self {
        Self {
            entity: EntityKind::Node,
            tokens: SmallVec::from_slice(&[label]),
            properties: SmallVec::from_slice(properties),
        }
    }

    /// Descriptor over one relationship type.
    pub fn for_type(rel_type: u32, properties: &[PropKeyId]) -> Self {
        Self {
            entity: EntityKind::Relationship,
            tokens: SmallVec::from_slice(&[rel_type]),
            properties: SmallVec::from_slice(properties),
        }
    }

    /// Whether any descriptor token is in `tokens`.
    pub fn has_any_token(&self, tokens: &[u32]) -> bool {
        self.tokens.iter().any(|t| tokens.contains(t))
    }

    /// Whether any descriptor property is in `keys`.
    pub fn has_any_property(&self, keys: &[PropKeyId]) -> bool {
        self.properties.iter().any(|p| keys.contains(p))
    }
}

/// Index rule.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct IndexDescriptor {
    /// Rule id.
    pub id: u64,
    /// Unique rule name.
    pub name: String,
    /// Covered schema.
    pub schema: SchemaDescriptor,
    /// Backs a uniqueness constraint.
    pub unique: bool,
    /// Constraint owning this index once activated.
    pub owning_constraint: Option<u64>,
}

/// Kind of constraint.
#[derive(Copy, Clone, Debug, PartialEq, Eq)]
pub enum ConstraintKind {
    /// Property values are unique per token.
    Uniqueness,
    /// Properties must exist on every entity with the token.
    Existence,
}

/// Constraint rule.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct ConstraintDescriptor {
    /// Rule id.
    pub id: u64,
    /// Unique rule name.
    pub name: String,
    /// Covered schema.
    pub schema: SchemaDescriptor,
    /// Constraint kind.
    pub kind: ConstraintKind,
    /// Index enforcing a uniqueness constraint.
    pub owned_index: Option<u64>,
}

/// Index or constraint rule stored in the schema store.
#[derive(Clone, Debug, PartialEq, Eq)]
pub enum SchemaRule {
    /// Index rule.
    Index(IndexDescriptor),
    /// Constraint rule.
    Constraint(ConstraintDescriptor),
}

impl SchemaRule {
    /// Rule id.
    pub fn id(&self) -> u64 {
        match self {
            SchemaRule::Index(index) => index.id,
            SchemaRule::Constraint(constraint) => constraint.id,
        }
    }

    /// Rule name.
    pub fn name(&self) -> &str {
        match self {
            SchemaRule::Index(index) => &index.name,
            SchemaRule::Constraint(constraint) => &constraint.name,
        }
    }

    /// Covered schema.
    pub fn schema(&self) -> &SchemaDescriptor {
        match self {
            SchemaRule::Index(index) => &index.schema,
            SchemaRule::Constraint(constraint) => &constraint.schema,
        }
    }

    /// Whether this is a constraint rule.
    pub fn is_constraint(&self) -> bool {
        matches!(self, SchemaRule::Constraint(_))
    }
}

#[derive(Debug, Default)]
struct SchemaCacheState {
    rules: BTreeMap<u64, SchemaRule>,
    by_name: FxHashMap<String, u64>,
}

/// Cached view of the committed schema rules.
///
/// Every add/remove bumps the epoch; transactions remember the epoch they
/// started under to detect schema changes racing with them.
#[derive(Debug, Default)]
pub struct SchemaCache {
    state: RwLock<SchemaCacheState>,
    epoch: AtomicU64,
}

impl SchemaCache {
    /// An empty cache at epoch 0.
    pub fn new() -> Self {
        Self::default()
    }

    /// Current schema epoch.
    pub fn epoch(&self) -> u64 {
        self.epoch.load(Ordering::Acquire)
    }

    /// Adds or replaces a rule.
    pub fn add_schema_rule(&self, rule: SchemaRule) {
        let mut state = self.state.write();
        if let Some(old) = state.rules.get(&rule.id()) {
            let old_name = old.name().to_owned();
            state.by_name.remove(&old_name);
        }
        state.by_name.insert(rule.name().to_owned(), rule.id());
        state.rules.insert(rule.id(), rule);
        self.epoch.fetch_add(1, Ordering::AcqRel);
    }

    /// Removes a rule; returns it when it was cached.
    pub fn remove_schema_rule(&self, id: u64) -> Option<SchemaRule> {
        let mut state = self.state.write();
        let removed = state.rules.remove(&id);
        if let Some(rule) = &removed {
            state.by_name.remove(rule.name());
            self.epoch.fetch_add(1, Ordering::AcqRel);
        }
        removed
    }

    /// Rule by id.
    pub fn rule(&self, id: u64) -> Option<SchemaRule> {
        self.state.read().rules.get(&id).cloned()
    }

    /// Rule by name.
    pub fn rule_by_name(&self, name: &str) -> Option<SchemaRule> {
        let state = self.state.read();
        state
            .by_name
            .get(name)
            .and_then(|id| state.rules.get(id))
            .cloned()
    }

    /// Every index rule, ordered by id.
    pub fn indexes(&self) -> Vec<IndexDescriptor> {
        self.state
            .read()
            .rules
            .values()
            .filter_map(|rule| match rule {
                SchemaRule::Index(index) => Some(index.clone()),
                SchemaRule::Constraint(_) => None,
            })
            .collect()
    }

    /// Indexes an entity change may affect: those over a changed token, and
    /// those over an unchanged token that cover a changed property.
    pub fn related_indexes(
        &self,
        entity: EntityKind,
        changed_tokens: &[u32],
        unchanged_tokens: &[u32],
        changed_properties: &[PropKeyId],
    ) -> Vec<IndexDescriptor> {
        self.state
            .read()
            .rules
            .values()
            .filter_map(|rule| match rule {
                SchemaRule::Index(index) if index.schema.entity == entity => Some(index),
                _ => None,
            })
            .filter(|index| {
                index.schema.has_any_token(changed_tokens)
                    || (index.schema.has_any_token(unchanged_tokens)
                        && index.schema.has_any_property(changed_properties))
            })
            .cloned()
            .collect()
    }
}
