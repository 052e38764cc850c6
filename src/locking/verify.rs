use tracing::error;

use crate::apply::command::{Command, CommandMode, RecordCommand};
use crate::locking::{LockClient, LockMode, ResourceType};
use crate::storage::record::{PropertyOwner, Record};
use crate::storage::store::{RecordLoad, RecordStore, Stores};
use crate::types::{CoreError, Result};

/// Checks a command before it is applied.
pub trait CommandVerifier: Send + Sync {
    /// Fails when `command` must not be applied. `locks` is the committing
    /// transaction's lock client, absent for external or recovered batches.
    fn verify(&self, stores: &Stores, command: &Command, locks: Option<&dyn LockClient>) -> Result<()>;
}

/// Applies every command unchecked.
#[derive(Debug, Default, Clone, Copy)]
pub struct NoVerification;

impl CommandVerifier for NoVerification {
    fn verify(&self, _: &Stores, _: &Command, _: Option<&dyn LockClient>) -> Result<()> {
        Ok(())
    }
}

/// Re-reads the store to compare before-images and checks that the lock
/// implied by every update or delete is held.
#[derive(Debug, Default, Clone, Copy)]
pub struct StrictVerification;

impl StrictVerification {
    fn before_image<R: Record>(store: &dyn RecordStore<R>, command: &RecordCommand<R>) -> Result<()> {
        let id = command.id();
        let current = store.get_record(id, RecordLoad::Always)?;
        let matches = match (command.mode(), current) {
            (CommandMode::Create, None) => true,
            (CommandMode::Create, Some(record)) => !record.in_use(),
            (_, Some(record)) => record.persistent_eq(&command.before),
            (_, None) => false,
        };
        if matches {
            Ok(())
        } else {
            Err(violation(format!(
                "before-image of {:?} record {id} no longer matches the store",
                R::ID_TYPE
            )))
        }
    }

    fn required_lock(command: &Command) -> Option<(ResourceType, u64)> {
        if command.mode() == Some(CommandMode::Create) {
            return None;
        }
        match command {
            Command::Node(c) => Some((ResourceType::Node, c.id())),
            Command::Relationship(c) => Some((ResourceType::Relationship, c.id())),
            Command::RelationshipGroup(c) => {
                Some((ResourceType::RelationshipGroup, c.before.owning_node))
            }
            Command::Property(c) => match c.before.owner {
                PropertyOwner::Node(id) => Some((ResourceType::Node, id)),
                PropertyOwner::Relationship(id) => Some((ResourceType::Relationship, id)),
                PropertyOwner::Schema(_) | PropertyOwner::None => None,
            },
            _ => None,
        }
    }
}

fn violation(message: String) -> CoreError {
    error!(message = %message, "locks.verify.failed");
    CoreError::LockViolation(message)
}

impl CommandVerifier for StrictVerification {
    fn verify(&self, stores: &Stores, command: &Command, locks: Option<&dyn LockClient>) -> Result<()> {
        match command {
            Command::Node(c) => Self::before_image(&*stores.nodes, c)?,
            Command::Relationship(c) => Self::before_image(&*stores.relationships, c)?,
            Command::RelationshipGroup(c) => Self::before_image(&*stores.groups, c)?,
            Command::Property(c) => Self::before_image(&*stores.properties, c)?,
            _ => return Ok(()),
        }
        let (Some(locks), Some((resource, id))) = (locks, Self::required_lock(command)) else {
            return Ok(());
        };
        if locks.holds(resource, id, LockMode::Exclusive) {
            Ok(())
        } else {
            Err(violation(format!(
                "{} command for record {} applied without exclusive {resource:?} lock on {id}",
                command.kind_name(),
                command.record_key().map(|(_, id)| id).unwrap_or_default()
            )))
        }
    }
}
