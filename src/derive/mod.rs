//! Logical update derivation.
//!
//! Turns the physical commands of a batch into index entry updates and
//! token index updates without re-reading the graph: commands are grouped
//! per entity, property blocks are diffed and token fields compared. Stored
//! state is only consulted for property values an index needs but the
//! commands do not carry.

use tracing::trace;

use crate::apply::command::Command;
use crate::schema::SchemaCache;
use crate::types::{EntityKind, Result};

/// Per-entity command grouping.
pub mod grouper;
/// Property block diffing.
pub mod property_diff;
/// Label and type comparison.
pub mod tokens;
/// Entity updates and index entry updates.
pub mod updates;

pub use grouper::{EntityCommandGrouper, EntityGroup};
pub use property_diff::{collect_blocks, diff_properties, PropertyEvent};
pub use tokens::{node_token_change, relationship_token_change, TokenChange, Tokens};
pub use updates::{
    EntityUpdates, IndexEntryUpdate, IndexUpdateKind, PropertyLoader, StorePropertyLoader,
    TokenIndexUpdate,
};

/// Updates derived from a set of commands.
#[derive(Clone, Debug, Default, PartialEq)]
pub struct DerivedUpdates {
    /// Index entry updates, grouped by entity in id order.
    pub index: Vec<IndexEntryUpdate>,
    /// Token index updates ordered by entity kind and id.
    pub tokens: Vec<TokenIndexUpdate>,
}

impl DerivedUpdates {
    /// Whether nothing was derived.
    pub fn is_empty(&self) -> bool {
        self.index.is_empty() && self.tokens.is_empty()
    }
}

fn group_updates(
    kind: EntityKind,
    group: &EntityGroup<'_>,
    loader: &mut dyn PropertyLoader,
) -> Result<EntityUpdates> {
    let tokens = match group.entity {
        Some(Command::Node(command)) => node_token_change(command, loader)?,
        Some(Command::Relationship(command)) => relationship_token_change(command),
        _ => TokenChange::unchanged(loader.tokens(kind, group.id)?),
    };
    let (before, after) = collect_blocks(&group.properties)?;
    Ok(EntityUpdates {
        entity: kind,
        id: group.id,
        tokens,
        properties: diff_properties(before, after),
        complete: group.is_complete(),
    })
}

/// Logical changes of every node and relationship touched by `commands`,
/// nodes first, each kind in id order.
pub fn entity_updates(
    commands: &[Command],
    loader: &mut dyn PropertyLoader,
) -> Result<Vec<EntityUpdates>> {
    let mut out = Vec::new();
    for kind in [EntityKind::Node, EntityKind::Relationship] {
        let mut grouper = EntityCommandGrouper::new(kind);
        for command in commands {
            grouper.add(command);
        }
        for group in grouper.groups() {
            let updates = group_updates(kind, &group, loader)?;
            if updates.tokens.changed || !updates.properties.is_empty() {
                out.push(updates);
            }
        }
    }
    Ok(out)
}

/// Index and token index updates implied by `commands` under the indexes
/// cached in `schema`.
pub fn derive_updates(
    commands: &[Command],
    schema: &SchemaCache,
    loader: &mut dyn PropertyLoader,
) -> Result<DerivedUpdates> {
    let mut derived = DerivedUpdates::default();
    for entity in entity_updates(commands, loader)? {
        derived.tokens.extend(entity.token_update());
        let indexes = schema.related_indexes(
            entity.entity,
            &entity.tokens.changed_tokens(),
            &entity.tokens.unchanged_tokens(),
            &entity.changed_property_keys(),
        );
        if !indexes.is_empty() {
            derived.index.extend(entity.index_updates(&indexes, loader)?);
        }
    }
    derived
        .tokens
        .sort_by_key(|update| (update.entity_kind, update.entity));
    trace!(
        index = derived.index.len(),
        tokens = derived.tokens.len(),
        "derive.updates"
    );
    Ok(derived)
}
