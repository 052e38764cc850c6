use std::cmp::Ordering;

use crate::apply::command::RecordCommand;
use crate::storage::property::decode_block;
use crate::storage::record::PropertyRecord;
use crate::types::{PropKeyId, PropertyValue, Result};

/// Change of one property key.
#[derive(Clone, Debug, PartialEq)]
pub enum PropertyEvent {
    /// The key was set for the first time.
    Added {
        /// Property key.
        key: PropKeyId,
        /// New value.
        value: PropertyValue,
    },
    /// The key's value changed.
    Changed {
        /// Property key.
        key: PropKeyId,
        /// Value before.
        before: PropertyValue,
        /// Value after.
        after: PropertyValue,
    },
    /// The key was removed.
    Removed {
        /// Property key.
        key: PropKeyId,
        /// Value before.
        value: PropertyValue,
    },
}

impl PropertyEvent {
    /// Property key of the event.
    pub fn key(&self) -> PropKeyId {
        match self {
            PropertyEvent::Added { key, .. }
            | PropertyEvent::Changed { key, .. }
            | PropertyEvent::Removed { key, .. } => *key,
        }
    }

    /// Value before the change, absent for additions.
    pub fn before(&self) -> Option<&PropertyValue> {
        match self {
            PropertyEvent::Added { .. } => None,
            PropertyEvent::Changed { before, .. } => Some(before),
            PropertyEvent::Removed { value, .. } => Some(value),
        }
    }

    /// Value after the change, absent for removals.
    pub fn after(&self) -> Option<&PropertyValue> {
        match self {
            PropertyEvent::Added { value, .. } => Some(value),
            PropertyEvent::Changed { after, .. } => Some(after),
            PropertyEvent::Removed { .. } => None,
        }
    }
}

/// Before and after key/value pairs carried by property record commands.
pub fn collect_blocks(
    commands: &[&RecordCommand<PropertyRecord>],
) -> Result<(Vec<(PropKeyId, PropertyValue)>, Vec<(PropKeyId, PropertyValue)>)> {
    let mut before = Vec::new();
    let mut after = Vec::new();
    for command in commands {
        if command.before.in_use {
            for block in &command.before.blocks {
                before.push((block.key, decode_block(block)?));
            }
        }
        if command.after.in_use {
            for block in &command.after.blocks {
                after.push((block.key, decode_block(block)?));
            }
        }
    }
    Ok((before, after))
}

/// Merge-joins two key/value sets into change events ordered by key.
/// Keys holding equal values on both sides produce nothing.
pub fn diff_properties(
    mut before: Vec<(PropKeyId, PropertyValue)>,
    mut after: Vec<(PropKeyId, PropertyValue)>,
) -> Vec<PropertyEvent> {
    before.sort_by_key(|(key, _)| *key);
    after.sort_by_key(|(key, _)| *key);
    let mut events = Vec::new();
    let mut before = before.into_iter().peekable();
    let mut after = after.into_iter().peekable();
    loop {
        let order = match (before.peek(), after.peek()) {
            (None, None) => break,
            (Some(_), None) => Ordering::Less,
            (None, Some(_)) => Ordering::Greater,
            (Some((b, _)), Some((a, _))) => b.cmp(a),
        };
        match order {
            Ordering::Less => {
                if let Some((key, value)) = before.next() {
                    events.push(PropertyEvent::Removed { key, value });
                }
            }
            Ordering::Greater => {
                if let Some((key, value)) = after.next() {
                    events.push(PropertyEvent::Added { key, value });
                }
            }
            Ordering::Equal => {
                if let (Some((key, old)), Some((_, new))) = (before.next(), after.next()) {
                    if old != new {
                        events.push(PropertyEvent::Changed {
                            key,
                            before: old,
                            after: new,
                        });
                    }
                }
            }
        }
    }
    events
}
