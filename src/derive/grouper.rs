use crate::apply::command::{Command, CommandMode, RecordCommand};
use crate::storage::record::{PropertyOwner, PropertyRecord};
use crate::types::EntityKind;

#[derive(Clone, Copy, Debug)]
enum Entry<'a> {
    Entity(&'a Command),
    Property(&'a RecordCommand<PropertyRecord>),
}

impl Entry<'_> {
    fn rank(&self) -> u8 {
        match self {
            Entry::Entity(_) => 0,
            Entry::Property(_) => 1,
        }
    }
}

/// Commands touching one entity: its own record command, if any, followed
/// by the property commands of its chain.
#[derive(Debug, Clone)]
pub struct EntityGroup<'a> {
    /// Entity id.
    pub id: u64,
    /// Node or relationship command of the entity.
    pub entity: Option<&'a Command>,
    /// Property record commands owned by the entity.
    pub properties: Vec<&'a RecordCommand<PropertyRecord>>,
}

impl EntityGroup<'_> {
    /// Whether the property commands describe every property the entity had
    /// or has, which holds when the entity itself was created or deleted.
    pub fn is_complete(&self) -> bool {
        matches!(
            self.entity.and_then(Command::mode),
            Some(CommandMode::Create | CommandMode::Delete)
        )
    }
}

/// Buffers the commands of one entity kind and hands them back grouped by
/// entity id.
#[derive(Debug)]
pub struct EntityCommandGrouper<'a> {
    kind: EntityKind,
    entries: Vec<(u64, Entry<'a>)>,
}

impl<'a> EntityCommandGrouper<'a> {
    /// An empty grouper for `kind` entities.
    pub fn new(kind: EntityKind) -> Self {
        Self {
            kind,
            entries: Vec::new(),
        }
    }

    /// Buffers `command` if it concerns this grouper's entity kind; returns
    /// whether it was taken.
    pub fn add(&mut self, command: &'a Command) -> bool {
        match (self.kind, command) {
            (EntityKind::Node, Command::Node(c)) => {
                self.entries.push((c.id(), Entry::Entity(command)));
                true
            }
            (EntityKind::Relationship, Command::Relationship(c)) => {
                self.entries.push((c.id(), Entry::Entity(command)));
                true
            }
            (_, Command::Property(c)) => match (self.kind, property_owner(c)) {
                (EntityKind::Node, PropertyOwner::Node(id))
                | (EntityKind::Relationship, PropertyOwner::Relationship(id)) => {
                    self.entries.push((id, Entry::Property(c)));
                    true
                }
                _ => false,
            },
            _ => false,
        }
    }

    /// Number of buffered commands.
    pub fn len(&self) -> usize {
        self.entries.len()
    }

    /// Whether nothing is buffered.
    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    /// Sorts the buffer and iterates it one entity at a time, in id order.
    pub fn groups(mut self) -> EntityGroups<'a> {
        self.entries.sort_by_key(|(id, entry)| (*id, entry.rank()));
        EntityGroups {
            entries: self.entries.into_iter().peekable(),
        }
    }
}

/// Owner of a property record command. Records that were never in use on
/// either side have no owner.
fn property_owner(command: &RecordCommand<PropertyRecord>) -> PropertyOwner {
    if command.before.in_use {
        command.before.owner
    } else {
        command.after.owner
    }
}

/// Iterator returned by [`EntityCommandGrouper::groups`].
pub struct EntityGroups<'a> {
    entries: std::iter::Peekable<std::vec::IntoIter<(u64, Entry<'a>)>>,
}

impl<'a> Iterator for EntityGroups<'a> {
    type Item = EntityGroup<'a>;

    fn next(&mut self) -> Option<Self::Item> {
        let (id, first) = self.entries.next()?;
        let mut group = EntityGroup {
            id,
            entity: None,
            properties: Vec::new(),
        };
        let mut push = |entry: Entry<'a>| match entry {
            Entry::Entity(command) => group.entity = Some(command),
            Entry::Property(command) => group.properties.push(command),
        };
        push(first);
        while let Some((_, entry)) = self.entries.next_if(|(next, _)| *next == id) {
            push(entry);
        }
        Some(group)
    }
}
