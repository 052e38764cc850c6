//! Command application pipeline.
//!
//! A transaction's commands are dispatched to an ordered chain of appliers.
//! Each applier sees every command in chain order, and appliers close in
//! reverse order once the transaction's commands are exhausted. Work that
//! spans transactions (id updates, index updates) accumulates in a
//! [`BatchContext`] and is flushed once per batch.

use serde::Serialize;
use tracing::trace;

use crate::storage::record::{
    GroupRecord, NodeRecord, PropertyRecord, RelationshipRecord, SchemaRecord, TokenKind,
    TokenRecord,
};
use crate::types::{CoreError, GroupId, LabelId, RelDirection, Result, TypeId};

/// Batch-scoped cross-transaction work.
pub mod batch;
/// Token holder and schema cache maintenance for external batches.
pub mod cache;
/// Command types.
pub mod command;
/// Dangling-reference checks of applied records.
pub mod consistency;
/// Counts and degree store updates.
pub mod counts;
/// High id tracking.
pub mod high_id;
/// Index and token index updates.
pub mod index;
/// Record store writer.
pub mod store;
/// Work-combining dispatcher.
pub mod worksync;

pub use batch::BatchContext;
pub use command::{Command, CommandMode, RecordCommand, TransactionToApply};

/// Origin of a batch, selecting which appliers run.
#[derive(Copy, Clone, Debug, PartialEq, Eq, Hash, Serialize)]
pub enum ApplicationMode {
    /// Transactions committed by this engine.
    Internal,
    /// Transactions replicated from another instance.
    External,
    /// Transactions replayed forward while recovering.
    Recovery,
    /// Transactions undone while recovering; before-images are written.
    ReverseRecovery,
}

impl ApplicationMode {
    /// Whether counts, degrees and indexes are maintained.
    pub fn needs_auxiliary_stores(self) -> bool {
        !matches!(self, ApplicationMode::ReverseRecovery)
    }

    /// Whether the high id of every id space is raised to cover written ids.
    pub fn needs_high_id_tracking(self) -> bool {
        !matches!(self, ApplicationMode::Internal)
    }

    /// Whether token holders and caches learn about changes from commands.
    pub fn needs_cache_invalidation(self) -> bool {
        matches!(self, ApplicationMode::External | ApplicationMode::Recovery)
    }

    /// Whether used and deleted ids are reported to the id generators.
    pub fn needs_id_updates(self) -> bool {
        !matches!(self, ApplicationMode::ReverseRecovery)
    }

    /// Whether before-images are written instead of after-images.
    pub fn is_reverse(self) -> bool {
        matches!(self, ApplicationMode::ReverseRecovery)
    }
}

/// One stage of the pipeline. Every visit defaults to a no-op.
pub trait TransactionApplier: Send {
    /// Name used in logs.
    fn name(&self) -> &'static str;

    /// Called before the first command of `tx`.
    fn begin(&mut self, _tx: &TransactionToApply) -> Result<()> {
        Ok(())
    }

    /// Node record change.
    fn visit_node(&mut self, _command: &RecordCommand<NodeRecord>) -> Result<()> {
        Ok(())
    }

    /// Relationship record change.
    fn visit_relationship(&mut self, _command: &RecordCommand<RelationshipRecord>) -> Result<()> {
        Ok(())
    }

    /// Relationship group record change.
    fn visit_group(&mut self, _command: &RecordCommand<GroupRecord>) -> Result<()> {
        Ok(())
    }

    /// Property record change.
    fn visit_property(&mut self, _command: &RecordCommand<PropertyRecord>) -> Result<()> {
        Ok(())
    }

    /// Token record change.
    fn visit_token(&mut self, _kind: TokenKind, _command: &RecordCommand<TokenRecord>) -> Result<()> {
        Ok(())
    }

    /// Schema record change.
    fn visit_schema_rule(
        &mut self,
        _command: &RecordCommand<SchemaRecord>,
        _batch: &mut BatchContext,
    ) -> Result<()> {
        Ok(())
    }

    /// Node count delta.
    fn visit_node_count(&mut self, _label: LabelId, _delta: i64) -> Result<()> {
        Ok(())
    }

    /// Relationship count delta.
    fn visit_relationship_count(
        &mut self,
        _start_label: LabelId,
        _rel_type: TypeId,
        _end_label: LabelId,
        _delta: i64,
    ) -> Result<()> {
        Ok(())
    }

    /// Group degree delta.
    fn visit_group_degree(&mut self, _group: GroupId, _direction: RelDirection, _delta: i64) -> Result<()> {
        Ok(())
    }

    /// Called after the last command of the transaction; hands buffered work
    /// to the batch.
    fn close(&mut self, _batch: &mut BatchContext) -> Result<()> {
        Ok(())
    }

    /// Dispatches `command` to the matching visit.
    fn visit(&mut self, command: &Command, batch: &mut BatchContext) -> Result<()> {
        dispatch(self, command, batch)
    }
}

/// Routes `command` to the typed visit of `applier`. Appliers overriding
/// [`TransactionApplier::visit`] call this after their own handling.
pub fn dispatch<A: TransactionApplier + ?Sized>(
    applier: &mut A,
    command: &Command,
    batch: &mut BatchContext,
) -> Result<()> {
    match command {
        Command::Node(c) => applier.visit_node(c),
        Command::Relationship(c) => applier.visit_relationship(c),
        Command::RelationshipGroup(c) => applier.visit_group(c),
        Command::Property(c) => applier.visit_property(c),
        Command::Token { kind, command } => applier.visit_token(*kind, command),
        Command::SchemaRule(c) => applier.visit_schema_rule(c, batch),
        Command::NodeCount { label, delta } => applier.visit_node_count(*label, *delta),
        Command::RelationshipCount {
            start_label,
            rel_type,
            end_label,
            delta,
        } => applier.visit_relationship_count(*start_label, *rel_type, *end_label, *delta),
        Command::GroupDegree {
            group,
            direction,
            delta,
        } => applier.visit_group_degree(*group, *direction, *delta),
    }
}

#[derive(Copy, Clone, Debug, PartialEq, Eq)]
enum FacadeState {
    Open,
    Closed,
}

/// Runs a chain of appliers over one transaction.
pub struct ApplierFacade {
    appliers: Vec<Box<dyn TransactionApplier>>,
    state: FacadeState,
}

impl std::fmt::Debug for ApplierFacade {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let names: Vec<_> = self.appliers.iter().map(|a| a.name()).collect();
        f.debug_struct("ApplierFacade")
            .field("appliers", &names)
            .field("state", &self.state)
            .finish()
    }
}

impl ApplierFacade {
    /// Chain of `appliers`, dispatched in the given order.
    pub fn new(appliers: Vec<Box<dyn TransactionApplier>>) -> Self {
        Self {
            appliers,
            state: FacadeState::Open,
        }
    }

    /// Names of the appliers in dispatch order.
    pub fn applier_names(&self) -> Vec<&'static str> {
        self.appliers.iter().map(|a| a.name()).collect()
    }

    /// Dispatches every command of `tx` to every applier, then closes the
    /// appliers in reverse order.
    pub fn apply(&mut self, tx: &TransactionToApply, batch: &mut BatchContext) -> Result<()> {
        if self.state == FacadeState::Closed {
            return Err(CoreError::Invalid(
                "applier chain used after it was closed".into(),
            ));
        }
        for applier in &mut self.appliers {
            applier.begin(tx)?;
        }
        for command in &tx.commands {
            for applier in &mut self.appliers {
                applier.visit(command, batch)?;
            }
        }
        self.close(batch)?;
        trace!(tx_id = tx.tx_id, commands = tx.commands.len(), "apply.tx.done");
        Ok(())
    }

    fn close(&mut self, batch: &mut BatchContext) -> Result<()> {
        self.state = FacadeState::Closed;
        for applier in self.appliers.iter_mut().rev() {
            applier.close(batch)?;
        }
        Ok(())
    }
}
