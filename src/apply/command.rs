//! Commands: the logical form of a committed transaction.

use std::sync::Arc;

use serde::Serialize;

use crate::locking::LockClient;
use crate::storage::record::{
    GroupRecord, IdType, NodeRecord, PropertyRecord, Record, RelationshipRecord, SchemaRecord,
    TokenKind, TokenRecord,
};
use crate::types::{GroupId, LabelId, RelDirection, TxId, TypeId};

/// What a record command does to its record.
#[derive(Copy, Clone, Debug, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize)]
pub enum CommandMode {
    /// The record comes into use.
    Create,
    /// The record stays in use.
    Update,
    /// The record goes out of use.
    Delete,
}

impl CommandMode {
    /// Mode implied by a before and after image.
    pub fn of<R: Record>(before: &R, after: &R) -> Self {
        match (before.in_use(), after.in_use()) {
            (false, true) => CommandMode::Create,
            (true, false) => CommandMode::Delete,
            _ => CommandMode::Update,
        }
    }
}

/// Before and after image of one record.
#[derive(Clone, Debug, PartialEq)]
pub struct RecordCommand<R> {
    /// Content before the transaction.
    pub before: R,
    /// Content after the transaction.
    pub after: R,
}

impl<R: Record> RecordCommand<R> {
    /// Pairs two images of the same record.
    pub fn new(before: R, after: R) -> Self {
        Self { before, after }
    }

    /// Record id.
    pub fn id(&self) -> u64 {
        self.after.id()
    }

    /// Create, update or delete.
    pub fn mode(&self) -> CommandMode {
        CommandMode::of(&self.before, &self.after)
    }
}

/// One command of a transaction.
#[derive(Clone, Debug, PartialEq)]
pub enum Command {
    /// Node record change.
    Node(RecordCommand<NodeRecord>),
    /// Relationship record change.
    Relationship(RecordCommand<RelationshipRecord>),
    /// Relationship-group record change.
    RelationshipGroup(RecordCommand<GroupRecord>),
    /// Property record change.
    Property(RecordCommand<PropertyRecord>),
    /// Token record change.
    Token {
        /// Which token space.
        kind: TokenKind,
        /// The change.
        command: RecordCommand<TokenRecord>,
    },
    /// Schema record change.
    SchemaRule(RecordCommand<SchemaRecord>),
    /// Node count delta.
    NodeCount {
        /// Label or [`crate::types::ANY_LABEL`].
        label: LabelId,
        /// Signed change.
        delta: i64,
    },
    /// Relationship count delta.
    RelationshipCount {
        /// Start node label or wildcard.
        start_label: LabelId,
        /// Type or [`crate::types::ANY_TYPE`].
        rel_type: TypeId,
        /// End node label or wildcard.
        end_label: LabelId,
        /// Signed change.
        delta: i64,
    },
    /// Degree delta of a group whose degrees live in the counts store.
    GroupDegree {
        /// Group id.
        group: GroupId,
        /// Chain direction.
        direction: RelDirection,
        /// Signed change.
        delta: i64,
    },
}

impl Command {
    /// Id space and record id of record commands.
    pub fn record_key(&self) -> Option<(IdType, u64)> {
        match self {
            Command::Node(c) => Some((IdType::Node, c.id())),
            Command::Relationship(c) => Some((IdType::Relationship, c.id())),
            Command::RelationshipGroup(c) => Some((IdType::RelationshipGroup, c.id())),
            Command::Property(c) => Some((IdType::Property, c.id())),
            Command::Token { kind, command } => Some((kind.id_type(), command.id())),
            Command::SchemaRule(c) => Some((IdType::Schema, c.id())),
            Command::NodeCount { .. }
            | Command::RelationshipCount { .. }
            | Command::GroupDegree { .. } => None,
        }
    }

    /// Mode of record commands.
    pub fn mode(&self) -> Option<CommandMode> {
        match self {
            Command::Node(c) => Some(c.mode()),
            Command::Relationship(c) => Some(c.mode()),
            Command::RelationshipGroup(c) => Some(c.mode()),
            Command::Property(c) => Some(c.mode()),
            Command::Token { command, .. } => Some(command.mode()),
            Command::SchemaRule(c) => Some(c.mode()),
            _ => None,
        }
    }

    /// Short name used in logs.
    pub fn kind_name(&self) -> &'static str {
        match self {
            Command::Node(_) => "node",
            Command::Relationship(_) => "relationship",
            Command::RelationshipGroup(_) => "relationship_group",
            Command::Property(_) => "property",
            Command::Token { .. } => "token",
            Command::SchemaRule(_) => "schema_rule",
            Command::NodeCount { .. } => "node_count",
            Command::RelationshipCount { .. } => "relationship_count",
            Command::GroupDegree { .. } => "group_degree",
        }
    }
}

/// A transaction ready to be applied.
#[derive(Clone)]
pub struct TransactionToApply {
    /// Transaction id.
    pub tx_id: TxId,
    /// Commands in extraction order.
    pub commands: Vec<Command>,
    /// Locks held by the committing transaction, absent for external and
    /// recovered transactions.
    pub locks: Option<Arc<dyn LockClient>>,
}

impl std::fmt::Debug for TransactionToApply {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("TransactionToApply")
            .field("tx_id", &self.tx_id)
            .field("commands", &self.commands.len())
            .field("locked", &self.locks.is_some())
            .finish()
    }
}

impl TransactionToApply {
    /// A transaction without lock context.
    pub fn new(tx_id: TxId, commands: Vec<Command>) -> Self {
        Self {
            tx_id,
            commands,
            locks: None,
        }
    }

    /// Attaches the committing transaction's locks.
    pub fn with_locks(mut self, locks: Arc<dyn LockClient>) -> Self {
        self.locks = Some(locks);
        self
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn mode_follows_in_use_transitions() {
        let unused = NodeRecord::new_unused(1);
        let used = NodeRecord::new(1);
        assert_eq!(CommandMode::of(&unused, &used), CommandMode::Create);
        assert_eq!(CommandMode::of(&used, &used), CommandMode::Update);
        assert_eq!(CommandMode::of(&used, &unused), CommandMode::Delete);
    }

    #[test]
    fn token_commands_use_their_kind_id_space() {
        let command = Command::Token {
            kind: TokenKind::PropertyKey,
            command: RecordCommand::new(TokenRecord::new_unused(3), TokenRecord::new_unused(3)),
        };
        assert_eq!(command.record_key(), Some((IdType::PropertyKeyToken, 3)));
        assert_eq!(command.kind_name(), "token");
    }
}
