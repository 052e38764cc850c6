//! Record model and record store collaborators.
//!
//! The core never sees bytes: stores hand out typed records, split into a
//! light part (linkage and inline fields) and heavy overflow content that is
//! loaded on demand.

/// Overflow payload chunking.
pub mod dynamic;
/// Node label field handling.
pub mod labels;
/// Property block encoding.
pub mod property;
/// Record types.
pub mod record;
/// Store trait and in-memory implementation.
pub mod store;

pub use record::{
    BlockValue, ChainSide, DynamicRecord, DynamicValueKind, GroupRecord, IdType, LabelField,
    NodeRecord, PropertyBlock, PropertyOwner, PropertyRecord, Record, RelationshipRecord,
    SchemaRecord, TokenKind, TokenRecord,
};
pub use store::{MemoryRecordStore, RecordLoad, RecordStore, Stores};
