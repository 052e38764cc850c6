//! The record storage engine: transaction state, command creation and batch
//! application wired to their collaborators.

use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;

use parking_lot::{Mutex, MutexGuard};
use tracing::{debug, error, info};

use crate::apply::batch::BatchSinks;
use crate::apply::command::CommandMode;
use crate::apply::cache::CacheInvalidationApplier;
use crate::apply::consistency::ConsistencyCheckApplier;
use crate::apply::counts::{CountsApplier, CountsStore, MemoryCountsStore};
use crate::apply::high_id::HighIdApplier;
use crate::apply::index::{IndexApplier, IndexUpdateListener, MemoryIndexes, TokenIndexListener};
use crate::apply::store::StoreApplier;
use crate::apply::{
    ApplicationMode, ApplierFacade, BatchContext, Command, TransactionApplier, TransactionToApply,
};
use crate::config::{EngineConfig, VerificationMode};
use crate::derive::{derive_updates, StorePropertyLoader};
use crate::health::{DatabaseHealth, HealthReport};
use crate::ids::IdGenerators;
use crate::locking::verify::{CommandVerifier, NoVerification, StrictVerification};
use crate::locking::{LockManager, LockTable};
use crate::metrics::{default_metrics, EngineMetrics};
use crate::schema::{
    ConstraintDescriptor, ConstraintKind, IndexDescriptor, SchemaCache, SchemaDescriptor,
    SchemaRule,
};
use crate::storage::record::{GroupRecord, PropertyOwner, TokenKind};
use crate::storage::store::{RecordLoad, Stores};
use crate::tokens::TokenHolders;
use crate::txn::chain::{RelationshipChains, RelationshipRef, StoreSource};
use crate::txn::changes::RecordChangeSet;
use crate::txn::properties::read_properties;
use crate::txn::TransactionRecordState;
use crate::types::{
    CoreError, Direction, EntityKind, NodeId, PropKeyId, PropertyValue, Result, TxId, TypeId,
};

/// External collaborators of the engine.
#[derive(Clone)]
pub struct Collaborators {
    /// Record stores and id generators.
    pub stores: Stores,
    /// Lock manager handing out per-transaction clients.
    pub locks: Arc<dyn LockManager>,
    /// Index lifecycle and entry update listener.
    pub indexes: Arc<dyn IndexUpdateListener>,
    /// Token index listener.
    pub token_index: Arc<dyn TokenIndexListener>,
    /// Counts and degrees store.
    pub counts: Arc<dyn CountsStore>,
    /// Metrics sink.
    pub metrics: Arc<dyn EngineMetrics>,
}

impl std::fmt::Debug for Collaborators {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Collaborators")
            .field("stores", &self.stores)
            .finish_non_exhaustive()
    }
}

impl Collaborators {
    /// In-memory reference collaborators.
    pub fn in_memory() -> Result<Self> {
        let indexes = Arc::new(MemoryIndexes::new());
        Ok(Self {
            stores: Stores::in_memory(IdGenerators::in_memory())?,
            locks: Arc::new(LockTable::new()),
            indexes: Arc::clone(&indexes) as Arc<dyn IndexUpdateListener>,
            token_index: indexes,
            counts: Arc::new(MemoryCountsStore::new()),
            metrics: default_metrics(),
        })
    }

    /// Uses `indexes` as both the index and the token index listener.
    pub fn with_indexes(mut self, indexes: Arc<MemoryIndexes>) -> Self {
        self.indexes = Arc::clone(&indexes) as Arc<dyn IndexUpdateListener>;
        self.token_index = indexes;
        self
    }

    /// Replaces the lock manager.
    pub fn with_locks(mut self, locks: Arc<dyn LockManager>) -> Self {
        self.locks = locks;
        self
    }

    /// Replaces the counts store.
    pub fn with_counts(mut self, counts: Arc<dyn CountsStore>) -> Self {
        self.counts = counts;
        self
    }

    /// Replaces the metrics sink.
    pub fn with_metrics(mut self, metrics: Arc<dyn EngineMetrics>) -> Self {
        self.metrics = metrics;
        self
    }
}

/// Transactional core of the graph store.
///
/// Writers open a [`TransactionRecordState`] with
/// [`RecordStorageEngine::new_transaction`], record their operations on it
/// and hand it to [`RecordStorageEngine::commit`]. Replicated and recovered
/// transactions enter through [`RecordStorageEngine::apply`].
pub struct RecordStorageEngine {
    config: EngineConfig,
    stores: Stores,
    schema: Arc<SchemaCache>,
    tokens: Arc<TokenHolders>,
    locks: Arc<dyn LockManager>,
    indexes: Arc<dyn IndexUpdateListener>,
    counts: Arc<dyn CountsStore>,
    metrics: Arc<dyn EngineMetrics>,
    sinks: BatchSinks,
    verifier: Arc<dyn CommandVerifier>,
    health: Arc<DatabaseHealth>,
    last_tx_id: AtomicU64,
    token_creation: Mutex<()>,
    constraint_checks: Mutex<()>,
}

impl std::fmt::Debug for RecordStorageEngine {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("RecordStorageEngine")
            .field("config", &self.config)
            .field("last_tx_id", &self.last_tx_id.load(Ordering::Relaxed))
            .field("healthy", &self.health.is_healthy())
            .finish()
    }
}

impl RecordStorageEngine {
    /// Opens an engine over in-memory collaborators.
    pub fn open(config: EngineConfig) -> Result<Self> {
        Self::with_collaborators(config, Collaborators::in_memory()?)
    }

    /// Opens an engine over `collaborators`.
    pub fn with_collaborators(config: EngineConfig, collaborators: Collaborators) -> Result<Self> {
        config.validate()?;
        let verifier: Arc<dyn CommandVerifier> = match config.verification {
            VerificationMode::Strict => Arc::new(StrictVerification),
            VerificationMode::Off => Arc::new(NoVerification),
        };
        let sinks = BatchSinks::new(
            collaborators.stores.ids.clone(),
            Arc::clone(&collaborators.indexes),
            Arc::clone(&collaborators.token_index),
        );
        info!(
            dense_node_threshold = config.dense_node_threshold,
            verification = ?config.verification,
            "engine.open"
        );
        Ok(Self {
            config,
            stores: collaborators.stores,
            schema: Arc::new(SchemaCache::new()),
            tokens: Arc::new(TokenHolders::new()),
            locks: collaborators.locks,
            indexes: collaborators.indexes,
            counts: collaborators.counts,
            metrics: collaborators.metrics,
            sinks,
            verifier,
            health: Arc::new(DatabaseHealth::new()),
            last_tx_id: AtomicU64::new(0),
            token_creation: Mutex::new(()),
            constraint_checks: Mutex::new(()),
        })
    }

    /// Engine configuration.
    pub fn config(&self) -> &EngineConfig {
        &self.config
    }

    /// Record stores.
    pub fn stores(&self) -> &Stores {
        &self.stores
    }

    /// Cached schema rules.
    pub fn schema(&self) -> &Arc<SchemaCache> {
        &self.schema
    }

    /// Token registries.
    pub fn tokens(&self) -> &Arc<TokenHolders> {
        &self.tokens
    }

    /// Counts and degrees store.
    pub fn counts(&self) -> &Arc<dyn CountsStore> {
        &self.counts
    }

    /// Health state shared with every batch.
    pub fn health(&self) -> &Arc<DatabaseHealth> {
        &self.health
    }

    /// Serializable health snapshot.
    pub fn health_report(&self) -> HealthReport {
        self.health.report()
    }

    /// Id of the last committed or applied transaction.
    pub fn last_tx_id(&self) -> TxId {
        self.last_tx_id.load(Ordering::Acquire)
    }

    /// Starts a transaction under the current schema epoch.
    pub fn new_transaction(&self) -> Result<TransactionRecordState> {
        self.health.assert_healthy()?;
        Ok(TransactionRecordState::new(
            self.stores.clone(),
            self.config.clone(),
            self.locks.new_client(),
            self.schema.epoch(),
        ))
    }

    /// Turns the recorded operations of `tx` into commands without applying
    /// them. The transaction keeps its locks until committed or rolled back.
    pub fn create_commands(&self, tx: &mut TransactionRecordState) -> Result<Vec<Command>> {
        tx.create_commands(self.schema.epoch())
    }

    /// Creates the commands of `tx`, applies them as an internal batch of
    /// one and releases the transaction's locks.
    pub fn commit(&self, mut tx: TransactionRecordState) -> Result<TxId> {
        self.health.assert_healthy()?;
        let commands = match self.create_commands(&mut tx) {
            Ok(commands) => commands,
            Err(err) => {
                debug!(error = %err, "txn.commit.rejected");
                tx.rollback()?;
                self.metrics.transaction_rolled_back();
                return Err(err);
            }
        };
        let locks = Arc::clone(tx.locks());
        let tx_id = self.last_tx_id.fetch_add(1, Ordering::AcqRel) + 1;
        if commands.is_empty() {
            locks.release_all();
            self.metrics.transaction_committed();
            return Ok(tx_id);
        }
        // Held until the batch is applied.
        let _constraints = match self.check_constraints(&commands) {
            Ok(guard) => guard,
            Err(err) => {
                debug!(tx_id, error = %err, "txn.commit.rejected");
                if err.is_fatal() {
                    self.health.panic(&err);
                }
                tx.rollback()?;
                self.metrics.transaction_rolled_back();
                return Err(err);
            }
        };
        let conversions = dense_conversions(&commands);
        let to_apply = TransactionToApply::new(tx_id, commands).with_locks(Arc::clone(&locks));
        if let Err(err) = self.apply(std::slice::from_ref(&to_apply), ApplicationMode::Internal) {
            locks.release_all();
            return Err(err);
        }
        let registered = self.tokens.apply_commands(&to_apply.commands, &self.stores);
        locks.release_all();
        registered?;
        for _ in 0..conversions {
            self.metrics.dense_conversion();
        }
        self.metrics.transaction_committed();
        Ok(tx_id)
    }

    /// Gives back everything `tx` allocated and locked.
    pub fn rollback(&self, tx: TransactionRecordState) -> Result<()> {
        tx.rollback()?;
        self.metrics.transaction_rolled_back();
        Ok(())
    }

    /// Applies a batch of transactions in `mode`. Any failure aborts the
    /// batch and panics the engine until [`DatabaseHealth::heal`]; records
    /// written before the failure are left for recovery.
    pub fn apply(&self, batch: &[TransactionToApply], mode: ApplicationMode) -> Result<()> {
        self.health.assert_healthy()?;
        match self.apply_batch(batch, mode) {
            Ok(()) => {
                if mode != ApplicationMode::Internal {
                    if let Some(last) = batch.iter().map(|tx| tx.tx_id).max() {
                        self.last_tx_id.fetch_max(last, Ordering::AcqRel);
                    }
                }
                self.metrics.batch_applied(batch.len());
                Ok(())
            }
            Err(err) => {
                error!(error = %err, mode = ?mode, transactions = batch.len(), "apply.batch.failed");
                self.metrics.batch_failed();
                self.health.panic(&err);
                Err(err)
            }
        }
    }

    fn apply_batch(&self, batch: &[TransactionToApply], mode: ApplicationMode) -> Result<()> {
        let mut context = BatchContext::new(self.sinks.clone(), self.config.index_flush_batch_limit);
        for tx in batch {
            let mut facade = ApplierFacade::new(self.appliers(mode));
            facade
                .apply(tx, &mut context)
                .map_err(|err| err.into_apply(tx.tx_id))?;
        }
        context.close().map_err(|err| err.into_apply(0))
    }

    /// Checks `commands` against uniqueness constraints before anything is
    /// written. The guard, when returned, serializes the check with the
    /// apply that follows it.
    fn check_constraints(&self, commands: &[Command]) -> Result<Option<MutexGuard<'_, ()>>> {
        let activations = constraint_activations(commands, &self.schema);
        let mut loader = StorePropertyLoader::new(&self.stores, self.config.cycle_detection_threshold);
        let derived = derive_updates(commands, &self.schema, &mut loader)?;
        let unique = derived.index.iter().any(|update| {
            matches!(self.schema.rule(update.index), Some(SchemaRule::Index(index)) if index.unique)
        });
        if activations.is_empty() && !unique {
            return Ok(None);
        }
        let guard = self.constraint_checks.lock();
        self.indexes.validate_updates(&derived.index)?;
        for index in &activations {
            self.indexes.validate_constraint_index(index)?;
        }
        Ok(Some(guard))
    }

    /// The applier chain for `mode`, in dispatch order.
    fn appliers(&self, mode: ApplicationMode) -> Vec<Box<dyn TransactionApplier>> {
        let mut chain: Vec<Box<dyn TransactionApplier>> = vec![Box::new(StoreApplier::new(
            self.stores.clone(),
            Arc::clone(&self.schema),
            mode,
            Arc::clone(&self.verifier),
        ))];
        if mode.needs_high_id_tracking() {
            chain.push(Box::new(HighIdApplier::new(self.stores.ids.clone())));
        }
        if mode.needs_cache_invalidation() {
            chain.push(Box::new(CacheInvalidationApplier::new(
                self.stores.clone(),
                Arc::clone(&self.tokens),
            )));
        }
        if mode.needs_auxiliary_stores() {
            chain.push(Box::new(CountsApplier::new(Arc::clone(&self.counts))));
            if self.config.consistency_check_on_apply {
                chain.push(Box::new(ConsistencyCheckApplier::new(self.stores.clone())));
            }
            chain.push(Box::new(IndexApplier::new(
                self.stores.clone(),
                Arc::clone(&self.schema),
                Arc::clone(&self.indexes),
                self.config.cycle_detection_threshold,
            )));
        }
        chain
    }

    /// Id of the token named `name`, creating it in its own transaction when
    /// it does not exist yet.
    pub fn get_or_create_token(&self, kind: TokenKind, name: &str) -> Result<u32> {
        if let Some(id) = self.tokens.id_of(kind, name) {
            return Ok(id);
        }
        let _guard = self.token_creation.lock();
        if let Some(id) = self.tokens.id_of(kind, name) {
            return Ok(id);
        }
        let mut tx = self.new_transaction()?;
        let id = tx.create_token(kind, name, false)?;
        self.commit(tx)?;
        Ok(id)
    }

    /// Creates an index and returns its rule id.
    pub fn create_index(&self, name: &str, schema: SchemaDescriptor) -> Result<u64> {
        self.create_index_rule(name, schema, false)
    }

    fn create_index_rule(&self, name: &str, schema: SchemaDescriptor, unique: bool) -> Result<u64> {
        if self.schema.rule_by_name(name).is_some() {
            return Err(CoreError::Invalid(format!("schema rule {name} already exists")));
        }
        let mut tx = self.new_transaction()?;
        let id = tx.reserve_schema_id()?;
        tx.create_schema_rule(SchemaRule::Index(IndexDescriptor {
            id,
            name: name.to_owned(),
            schema,
            unique,
            owning_constraint: None,
        }))?;
        self.commit(tx)?;
        Ok(id)
    }

    /// Creates a uniqueness constraint backed by a new unique index and
    /// returns the constraint's rule id. Fails with
    /// [`CoreError::ConstraintValidation`] when existing data violates it.
    pub fn create_uniqueness_constraint(&self, name: &str, schema: SchemaDescriptor) -> Result<u64> {
        let index_name = format!("{name}_index");
        let index = self.create_index_rule(&index_name, schema.clone(), true)?;
        let mut tx = self.new_transaction()?;
        let id = tx.reserve_schema_id()?;
        tx.create_schema_rule(SchemaRule::Constraint(ConstraintDescriptor {
            id,
            name: name.to_owned(),
            schema,
            kind: ConstraintKind::Uniqueness,
            owned_index: Some(index),
        }))?;
        match self.commit(tx) {
            Ok(_) => Ok(id),
            Err(err) => {
                if !err.is_fatal() {
                    self.drop_schema_rule(index)?;
                }
                Err(err)
            }
        }
    }

    /// Drops an index or constraint rule.
    pub fn drop_schema_rule(&self, id: u64) -> Result<()> {
        let mut tx = self.new_transaction()?;
        tx.drop_schema_rule(id)?;
        self.commit(tx)?;
        Ok(())
    }

    /// Relationships of `node` filtered by type and direction, read leniently.
    pub fn relationships(
        &self,
        node: NodeId,
        types: Option<&[TypeId]>,
        direction: Direction,
    ) -> Result<Vec<RelationshipRef>> {
        RelationshipChains::new(StoreSource::lenient(&self.stores))
            .with_cycle_threshold(self.config.cycle_detection_threshold)
            .relationships(node, types, direction)
    }

    /// Number of relationships of `node` matching the filters.
    pub fn degree(&self, node: NodeId, types: Option<&[TypeId]>, direction: Direction) -> Result<u64> {
        RelationshipChains::new(StoreSource::lenient(&self.stores))
            .with_cycle_threshold(self.config.cycle_detection_threshold)
            .degree(node, types, direction)
    }

    /// Relationship groups of a dense node in type order.
    pub fn groups(&self, node: NodeId) -> Result<Vec<GroupRecord>> {
        RelationshipChains::new(StoreSource::lenient(&self.stores))
            .with_cycle_threshold(self.config.cycle_detection_threshold)
            .groups(node)
    }

    /// Checks every adjacency chain of `node`, seeing deleted records too.
    pub fn verify_node(&self, node: NodeId) -> Result<()> {
        RelationshipChains::new(StoreSource::forced(&self.stores))
            .with_cycle_threshold(self.config.cycle_detection_threshold)
            .verify_node(node)
    }

    /// Whether `node` is in use.
    pub fn node_exists(&self, node: NodeId) -> Result<bool> {
        Ok(self.stores.nodes.get_record(node, RecordLoad::Lenient)?.is_some())
    }

    /// Whether `node` uses relationship groups.
    pub fn is_dense(&self, node: NodeId) -> Result<bool> {
        Ok(self
            .stores
            .nodes
            .get_record(node, RecordLoad::Lenient)?
            .is_some_and(|n| n.dense))
    }

    /// Properties of a node or relationship, ordered by key.
    pub fn properties(&self, entity: EntityKind, id: u64) -> Result<Vec<(PropKeyId, PropertyValue)>> {
        let owner = match entity {
            EntityKind::Node => PropertyOwner::Node(id),
            EntityKind::Relationship => PropertyOwner::Relationship(id),
        };
        let mut changes = RecordChangeSet::new(&self.stores);
        read_properties(&mut changes, owner, self.config.cycle_detection_threshold)
    }
}

/// Backing indexes of the uniqueness constraints `commands` create.
fn constraint_activations(commands: &[Command], schema: &SchemaCache) -> Vec<IndexDescriptor> {
    commands
        .iter()
        .filter_map(|command| match command {
            Command::SchemaRule(c) if c.mode() == CommandMode::Create => match &c.after.rule {
                Some(SchemaRule::Constraint(constraint)) => constraint.owned_index,
                _ => None,
            },
            _ => None,
        })
        .filter_map(|id| match schema.rule(id) {
            Some(SchemaRule::Index(index)) => Some(index),
            _ => None,
        })
        .collect()
}

fn dense_conversions(commands: &[Command]) -> usize {
    commands
        .iter()
        .filter(|command| match command {
            Command::Node(c) => c.before.in_use && !c.before.dense && c.after.dense,
            _ => false,
        })
        .count()
}
