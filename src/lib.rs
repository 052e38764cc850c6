//! Chainstore: the transactional core of a record-based graph store.
//!
//! Nodes, relationships, relationship groups, properties, tokens and schema
//! rules live as fixed-size records. A [`TransactionRecordState`] turns
//! logical writes into before/after record commands while keeping the
//! doubly-linked relationship chains intact, and the [`apply`] pipeline
//! writes those commands to the stores and derives index, token index and
//! counts updates from them.
//!
//! [`RecordStorageEngine`] wires both halves to their collaborators.

#![warn(missing_docs)]

pub mod apply;
pub mod config;
pub mod derive;
pub mod engine;
pub mod health;
pub mod ids;
pub mod locking;
pub mod logging;
pub mod metrics;
pub mod schema;
pub mod storage;
pub mod tokens;
pub mod txn;
pub mod types;

pub use apply::{ApplicationMode, Command, TransactionApplier, TransactionToApply};
pub use config::{EngineConfig, VerificationMode};
pub use engine::{Collaborators, RecordStorageEngine};
pub use health::{DatabaseHealth, HealthReport};
pub use txn::TransactionRecordState;
pub use types::{CoreError, Direction, PropertyValue, Result};
