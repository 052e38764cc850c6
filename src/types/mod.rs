//! Identifier aliases, shared enums and the crate-wide error type.

use std::fmt;

/// Node record id.
pub type NodeId = u64;
/// Relationship record id.
pub type RelId = u64;
/// Relationship-group record id.
pub type GroupId = u64;
/// Property record id.
pub type PropRecordId = u64;
/// Label token id.
pub type LabelId = u32;
/// Relationship type token id.
pub type TypeId = u32;
/// Property key token id.
pub type PropKeyId = u32;
/// Transaction id assigned by the coordinator.
pub type TxId = u64;

/// Sentinel for an absent record reference (chain terminators, empty heads).
pub const NULL_REF: u64 = u64::MAX;

/// Wildcard label in counts keys.
pub const ANY_LABEL: LabelId = u32::MAX;
/// Wildcard relationship type in counts keys.
pub const ANY_TYPE: TypeId = u32::MAX;

/// Returns true when `id` is the absent-reference sentinel.
#[inline]
pub const fn is_null(id: u64) -> bool {
    id == NULL_REF
}

/// Kind of entity a schema descriptor, property chain or token update refers to.
#[derive(Copy, Clone, Eq, PartialEq, Ord, PartialOrd, Hash, Debug, serde::Serialize, serde::Deserialize)]
pub enum EntityKind {
    /// Node entities (tokens are labels).
    Node,
    /// Relationship entities (tokens are relationship types).
    Relationship,
}

/// Direction of a relationship as seen from one of its endpoints.
#[derive(Copy, Clone, Eq, PartialEq, Ord, PartialOrd, Hash, Debug)]
pub enum RelDirection {
    /// The endpoint is the start node.
    Outgoing,
    /// The endpoint is the end node.
    Incoming,
    /// Both endpoints are the same node.
    Loop,
}

impl RelDirection {
    /// All three directions in chain-slot order.
    pub const ALL: [RelDirection; 3] = [
        RelDirection::Outgoing,
        RelDirection::Incoming,
        RelDirection::Loop,
    ];

    /// Direction of a relationship from `(start, end)` as seen by `node`.
    pub fn of(node: NodeId, start: NodeId, end: NodeId) -> Option<Self> {
        if start == node && end == node {
            Some(RelDirection::Loop)
        } else if start == node {
            Some(RelDirection::Outgoing)
        } else if end == node {
            Some(RelDirection::Incoming)
        } else {
            None
        }
    }
}

/// Direction filter used by read helpers.
#[derive(Copy, Clone, Eq, PartialEq, Hash, Debug)]
pub enum Direction {
    /// Outgoing relationships and loops.
    Outgoing,
    /// Incoming relationships and loops.
    Incoming,
    /// Every relationship.
    Both,
}

impl Direction {
    /// Whether a relationship in chain direction `dir` passes this filter.
    pub fn matches(self, dir: RelDirection) -> bool {
        match (self, dir) {
            (Direction::Both, _) | (_, RelDirection::Loop) => true,
            (Direction::Outgoing, RelDirection::Outgoing) => true,
            (Direction::Incoming, RelDirection::Incoming) => true,
            _ => false,
        }
    }
}

/// Property value held in a property block.
#[derive(Clone, Debug, PartialEq)]
pub enum PropertyValue {
    /// Boolean value.
    Bool(bool),
    /// 64-bit signed integer.
    Int(i64),
    /// 64-bit float.
    Float(f64),
    /// UTF-8 string.
    String(String),
    /// Raw bytes.
    Bytes(Vec<u8>),
}

impl fmt::Display for PropertyValue {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            PropertyValue::Bool(v) => write!(f, "{v}"),
            PropertyValue::Int(v) => write!(f, "{v}"),
            PropertyValue::Float(v) => write!(f, "{v}"),
            PropertyValue::String(v) => write!(f, "{v:?}"),
            PropertyValue::Bytes(v) => write!(f, "<{} bytes>", v.len()),
        }
    }
}

impl From<i64> for PropertyValue {
    fn from(value: i64) -> Self {
        PropertyValue::Int(value)
    }
}

impl From<bool> for PropertyValue {
    fn from(value: bool) -> Self {
        PropertyValue::Bool(value)
    }
}

impl From<f64> for PropertyValue {
    fn from(value: f64) -> Self {
        PropertyValue::Float(value)
    }
}

impl From<&str> for PropertyValue {
    fn from(value: &str) -> Self {
        PropertyValue::String(value.to_owned())
    }
}

impl From<String> for PropertyValue {
    fn from(value: String) -> Self {
        PropertyValue::String(value)
    }
}

impl From<Vec<u8>> for PropertyValue {
    fn from(value: Vec<u8>) -> Self {
        PropertyValue::Bytes(value)
    }
}

/// Errors raised by the transactional core.
#[derive(thiserror::Error, Debug)]
pub enum CoreError {
    /// Corrupted or cyclic record structure detected while traversing.
    #[error("structural inconsistency: {0}")]
    Inconsistency(String),
    /// A command was generated without holding the lock it implies, or its
    /// before-image no longer matches the store.
    #[error("lock discipline violation: {0}")]
    LockViolation(String),
    /// Committing a schema change would violate a constraint.
    #[error("constraint validation failed: {0}")]
    ConstraintValidation(String),
    /// The index backing a schema change cannot be used.
    #[error("index unusable: {0}")]
    IndexUnusable(String),
    /// Applying a batch failed; the engine needs recovery before the next one.
    #[error("apply failed for tx {tx_id}: {source}")]
    Apply {
        /// Transaction that was being applied, or 0 for batch-level work.
        tx_id: TxId,
        /// Underlying failure.
        #[source]
        source: Box<CoreError>,
    },
    /// The schema changed since the transaction's read view began.
    #[error("stale transaction: {0}")]
    StaleTransaction(String),
    /// Underlying I/O failure reported by a collaborator.
    #[error("IO: {0}")]
    Io(#[from] std::io::Error),
    /// A record that must exist was not found or is not in use.
    #[error("not found: {0}")]
    NotFound(String),
    /// Invalid argument or misuse of an API.
    #[error("invalid argument: {0}")]
    Invalid(String),
    /// The engine is in a failed state and needs recovery.
    #[error("engine panicked: {0}")]
    Panicked(String),
}

impl CoreError {
    /// Errors after which the engine must not keep applying batches. Every
    /// apply failure is one: the batch may have been partly written.
    pub fn is_fatal(&self) -> bool {
        match self {
            CoreError::Inconsistency(_)
            | CoreError::LockViolation(_)
            | CoreError::IndexUnusable(_)
            | CoreError::Io(_)
            | CoreError::Apply { .. }
            | CoreError::Panicked(_) => true,
            CoreError::ConstraintValidation(_)
            | CoreError::StaleTransaction(_)
            | CoreError::NotFound(_)
            | CoreError::Invalid(_) => false,
        }
    }

    /// Errors a caller may retry after refreshing its view or fixing data.
    pub fn is_retryable(&self) -> bool {
        match self {
            CoreError::StaleTransaction(_) | CoreError::ConstraintValidation(_) => true,
            _ => false,
        }
    }

    /// Copies the error; I/O sources are rebuilt from their kind and message.
    pub fn duplicate(&self) -> CoreError {
        match self {
            CoreError::Inconsistency(m) => CoreError::Inconsistency(m.clone()),
            CoreError::LockViolation(m) => CoreError::LockViolation(m.clone()),
            CoreError::ConstraintValidation(m) => CoreError::ConstraintValidation(m.clone()),
            CoreError::IndexUnusable(m) => CoreError::IndexUnusable(m.clone()),
            CoreError::Apply { tx_id, source } => CoreError::Apply {
                tx_id: *tx_id,
                source: Box::new(source.duplicate()),
            },
            CoreError::StaleTransaction(m) => CoreError::StaleTransaction(m.clone()),
            CoreError::Io(err) => CoreError::Io(std::io::Error::new(err.kind(), err.to_string())),
            CoreError::NotFound(m) => CoreError::NotFound(m.clone()),
            CoreError::Invalid(m) => CoreError::Invalid(m.clone()),
            CoreError::Panicked(m) => CoreError::Panicked(m.clone()),
        }
    }

    /// Wraps `self` as an apply failure for `tx_id` unless it already is one.
    pub fn into_apply(self, tx_id: TxId) -> CoreError {
        match self {
            err @ CoreError::Apply { .. } => err,
            other => CoreError::Apply {
                tx_id,
                source: Box::new(other),
            },
        }
    }
}

/// Result alias used throughout the crate.
pub type Result<T> = std::result::Result<T, CoreError>;
