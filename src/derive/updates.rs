use std::collections::BTreeMap;

use smallvec::SmallVec;

use crate::derive::property_diff::PropertyEvent;
use crate::derive::tokens::{TokenChange, Tokens};
use crate::schema::IndexDescriptor;
use crate::storage::labels::node_labels;
use crate::storage::record::PropertyOwner;
use crate::storage::store::Stores;
use crate::txn::changes::RecordChangeSet;
use crate::txn::properties::read_properties;
use crate::types::{EntityKind, PropKeyId, PropertyValue, Result};

/// Reads committed entity state the commands themselves do not carry.
pub trait PropertyLoader {
    /// Every property of an entity, ordered by key.
    fn properties(&mut self, entity: EntityKind, id: u64) -> Result<Vec<(PropKeyId, PropertyValue)>>;
    /// Labels of a node or the type of a relationship.
    fn tokens(&mut self, entity: EntityKind, id: u64) -> Result<Tokens>;
}

/// [`PropertyLoader`] reading the record stores.
pub struct StorePropertyLoader {
    changes: RecordChangeSet,
    cycle_threshold: u64,
}

impl StorePropertyLoader {
    /// Loader over `stores`.
    pub fn new(stores: &Stores, cycle_threshold: u64) -> Self {
        Self {
            changes: RecordChangeSet::new(stores),
            cycle_threshold,
        }
    }
}

impl PropertyLoader for StorePropertyLoader {
    fn properties(&mut self, entity: EntityKind, id: u64) -> Result<Vec<(PropKeyId, PropertyValue)>> {
        let owner = match entity {
            EntityKind::Node => PropertyOwner::Node(id),
            EntityKind::Relationship => PropertyOwner::Relationship(id),
        };
        read_properties(&mut self.changes, owner, self.cycle_threshold)
    }

    fn tokens(&mut self, entity: EntityKind, id: u64) -> Result<Tokens> {
        match entity {
            EntityKind::Node => node_labels(self.changes.nodes.get_or_load(id)?.for_reading_data()?),
            EntityKind::Relationship => {
                let rel = self.changes.relationships.get_or_load(id)?.into_linkage();
                Ok(SmallVec::from_slice(&[rel.rel_type]))
            }
        }
    }
}

/// What happened to the entry of one entity in one index.
#[derive(Clone, Debug, PartialEq)]
pub enum IndexUpdateKind {
    /// The entity entered the index.
    Added(Vec<PropertyValue>),
    /// The entity's indexed values changed.
    Changed {
        /// Values before.
        before: Vec<PropertyValue>,
        /// Values after.
        after: Vec<PropertyValue>,
    },
    /// The entity left the index.
    Removed(Vec<PropertyValue>),
}

/// One index entry update.
#[derive(Clone, Debug, PartialEq)]
pub struct IndexEntryUpdate {
    /// Index id.
    pub index: u64,
    /// Node or relationship id.
    pub entity: u64,
    /// The change.
    pub kind: IndexUpdateKind,
}

/// Token set change of one entity for the token indexes.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct TokenIndexUpdate {
    /// Node or relationship.
    pub entity_kind: EntityKind,
    /// Entity id.
    pub entity: u64,
    /// Tokens before.
    pub before: Tokens,
    /// Tokens after.
    pub after: Tokens,
}

/// Logical change of one entity derived from its commands.
#[derive(Clone, Debug, PartialEq)]
pub struct EntityUpdates {
    /// Node or relationship.
    pub entity: EntityKind,
    /// Entity id.
    pub id: u64,
    /// Token change.
    pub tokens: TokenChange,
    /// Property events ordered by key.
    pub properties: Vec<PropertyEvent>,
    /// Whether the events cover every property, so no stored state is needed.
    pub complete: bool,
}

impl EntityUpdates {
    /// Keys with an event.
    pub fn changed_property_keys(&self) -> Vec<PropKeyId> {
        self.properties.iter().map(PropertyEvent::key).collect()
    }

    /// Token index update, if the tokens changed.
    pub fn token_update(&self) -> Option<TokenIndexUpdate> {
        self.tokens.changed.then(|| TokenIndexUpdate {
            entity_kind: self.entity,
            entity: self.id,
            before: self.tokens.before.clone(),
            after: self.tokens.after.clone(),
        })
    }

    /// Entry updates for `indexes`. Values of properties without an event
    /// come from `loader` unless the events are complete.
    pub fn index_updates(
        &self,
        indexes: &[IndexDescriptor],
        loader: &mut dyn PropertyLoader,
    ) -> Result<Vec<IndexEntryUpdate>> {
        let events: BTreeMap<PropKeyId, &PropertyEvent> =
            self.properties.iter().map(|e| (e.key(), e)).collect();
        let mut unchanged: Option<BTreeMap<PropKeyId, PropertyValue>> = None;
        let mut out = Vec::new();
        for index in indexes.iter().filter(|i| i.schema.entity == self.entity) {
            let keys = &index.schema.properties;
            if !self.complete
                && unchanged.is_none()
                && keys.iter().any(|k| !events.contains_key(k))
            {
                unchanged = Some(
                    loader
                        .properties(self.entity, self.id)?
                        .into_iter()
                        .filter(|(k, _)| !events.contains_key(k))
                        .collect(),
                );
            }
            let value = |key: &PropKeyId, after: bool| -> Option<PropertyValue> {
                match events.get(key) {
                    Some(event) if after => event.after().cloned(),
                    Some(event) => event.before().cloned(),
                    None => unchanged.as_ref().and_then(|u| u.get(key).cloned()),
                }
            };
            let side = |tokens: &Tokens, after: bool| -> Option<Vec<PropertyValue>> {
                if !index.schema.has_any_token(tokens) {
                    return None;
                }
                keys.iter().map(|k| value(k, after)).collect()
            };
            let kind = match (side(&self.tokens.before, false), side(&self.tokens.after, true)) {
                (None, Some(values)) => IndexUpdateKind::Added(values),
                (Some(values), None) => IndexUpdateKind::Removed(values),
                (Some(before), Some(after)) if before != after => {
                    IndexUpdateKind::Changed { before, after }
                }
                _ => continue,
            };
            out.push(IndexEntryUpdate {
                index: index.id,
                entity: self.id,
                kind,
            });
        }
        Ok(out)
    }
}
