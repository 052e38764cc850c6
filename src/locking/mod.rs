//! Resource locks and the acquisition protocol that keeps them deadlock free.
//!
//! Every lock is keyed by a [`ResourceType`] and an id. Deadlocks between
//! writers are avoided by acquiring locks in one global order: resource types
//! in declaration order, ids ascending within a type.

use std::sync::Arc;

use serde::Serialize;

use crate::types::Result;

/// Lock table and per-transaction clients.
pub mod manager;
/// Lock plans built from a transaction's logical operations.
pub mod protocol;
/// Runtime verification of commands against held locks.
pub mod verify;

pub use manager::{LockClientHandle, LockTable};
pub use protocol::LockPlan;
pub use verify::{CommandVerifier, NoVerification, StrictVerification};

/// Lockable resource kinds in global acquisition order.
#[derive(Copy, Clone, Debug, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize)]
pub enum ResourceType {
    /// Token ids (label, type and property key creation).
    Token,
    /// Schema rule names.
    SchemaName,
    /// Guards deletion of a node's relationship groups, keyed by node id.
    NodeGroupDelete,
    /// Node records.
    Node,
    /// A node's degrees, keyed by node id.
    Degrees,
    /// Relationship deletion.
    RelationshipDelete,
    /// A node's relationship groups, keyed by node id.
    RelationshipGroup,
    /// Relationship records.
    Relationship,
}

/// Shared or exclusive.
#[derive(Copy, Clone, Debug, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize)]
pub enum LockMode {
    /// Compatible with other shared holders.
    Shared,
    /// Sole holder.
    Exclusive,
}

/// Lock operations of one transaction.
///
/// Locks are reentrant per client. A client that is the only shared holder
/// of a resource may upgrade it to exclusive.
pub trait LockClient: Send + Sync {
    /// Identifier of this client.
    fn client_id(&self) -> u64;
    /// Blocks until `resource` is held shared for every id.
    fn acquire_shared(&self, resource: ResourceType, ids: &[u64]) -> Result<()>;
    /// Blocks until `resource` is held exclusively for every id.
    fn acquire_exclusive(&self, resource: ResourceType, ids: &[u64]) -> Result<()>;
    /// Takes an exclusive lock if it is free right now.
    fn try_exclusive(&self, resource: ResourceType, id: u64) -> Result<bool>;
    /// Drops one shared hold.
    fn release_shared(&self, resource: ResourceType, id: u64);
    /// Drops one exclusive hold.
    fn release_exclusive(&self, resource: ResourceType, id: u64);
    /// Whether this client holds the lock in `mode` or stronger.
    fn holds(&self, resource: ResourceType, id: u64, mode: LockMode) -> bool;
    /// Drops everything this client holds.
    fn release_all(&self);
}

/// Source of lock clients.
pub trait LockManager: Send + Sync {
    /// A fresh client for one transaction.
    fn new_client(&self) -> Arc<dyn LockClient>;
}
