//! Transaction-side record handling: change tracking, chain maintenance and
//! command creation.

/// Relationship chain readers and the cycle guard.
pub mod chain;
/// Record change tracker.
pub mod changes;
/// Counts and degree deltas.
pub mod counts;
/// Relationship group lookup, creation and deletion.
pub mod groups;
/// Property chains.
pub mod properties;
/// Relationship chain insertion and deletion.
pub mod relationships;
/// Logical operations, locking and command extraction.
pub mod state;

pub use chain::{CycleGuard, RelationshipChains, RelationshipRef, RelationshipSource, StoreSource};
pub use changes::{ChangeCounter, RecordChange, RecordChangeSet, RecordChanges, RecordProxy};
pub use counts::{CountsDelta, DegreeDeltas};
pub use relationships::ChainModifier;
pub use state::TransactionRecordState;
