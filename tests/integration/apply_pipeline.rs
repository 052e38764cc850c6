#![allow(missing_docs)]

use std::collections::BTreeSet;
use std::sync::atomic::Ordering;
use std::sync::Arc;

use parking_lot::Mutex;

use chainstore::apply::index::MemoryIndexes;
use chainstore::locking::{LockClient, LockManager, LockMode, LockTable, ResourceType};
use chainstore::metrics::{CounterMetrics, EngineMetrics};
use chainstore::schema::SchemaDescriptor;
use chainstore::storage::TokenKind;
use chainstore::types::{EntityKind, RelId, Result, TxId, ANY_LABEL};
use chainstore::{
    ApplicationMode, Collaborators, Command, CoreError, Direction, EngineConfig, PropertyValue,
    RecordStorageEngine, TransactionRecordState, TransactionToApply,
};

/// Applies `tx` on `engine` as an internal commit would and hands back the
/// commands it produced.
fn commit_capturing(
    engine: &RecordStorageEngine,
    tx_id: u64,
    mut tx: TransactionRecordState,
) -> Result<Vec<Command>> {
    let commands = engine.create_commands(&mut tx)?;
    let locks = Arc::clone(tx.locks());
    let to_apply = TransactionToApply::new(tx_id, commands.clone()).with_locks(Arc::clone(&locks));
    let applied = engine.apply(&[to_apply], ApplicationMode::Internal);
    locks.release_all();
    applied?;
    Ok(commands)
}

type Hook = Box<dyn FnOnce() + Send>;

/// Lock manager that runs a one-off hook right before the next lock
/// request of any client.
#[derive(Default)]
struct InterleavingLocks {
    table: LockTable,
    hook: Arc<Mutex<Option<Hook>>>,
}

impl InterleavingLocks {
    fn arm(&self, hook: impl FnOnce() + Send + 'static) {
        *self.hook.lock() = Some(Box::new(hook));
    }
}

impl LockManager for InterleavingLocks {
    fn new_client(&self) -> Arc<dyn LockClient> {
        Arc::new(InterleavingClient {
            inner: self.table.new_client(),
            hook: Arc::clone(&self.hook),
        })
    }
}

struct InterleavingClient {
    inner: Arc<dyn LockClient>,
    hook: Arc<Mutex<Option<Hook>>>,
}

impl InterleavingClient {
    fn run_hook(&self) {
        let hook = self.hook.lock().take();
        if let Some(hook) = hook {
            hook();
        }
    }
}

impl LockClient for InterleavingClient {
    fn client_id(&self) -> u64 {
        self.inner.client_id()
    }

    fn acquire_shared(&self, resource: ResourceType, ids: &[u64]) -> Result<()> {
        self.run_hook();
        self.inner.acquire_shared(resource, ids)
    }

    fn acquire_exclusive(&self, resource: ResourceType, ids: &[u64]) -> Result<()> {
        self.run_hook();
        self.inner.acquire_exclusive(resource, ids)
    }

    fn try_exclusive(&self, resource: ResourceType, id: u64) -> Result<bool> {
        self.inner.try_exclusive(resource, id)
    }

    fn release_shared(&self, resource: ResourceType, id: u64) {
        self.inner.release_shared(resource, id)
    }

    fn release_exclusive(&self, resource: ResourceType, id: u64) {
        self.inner.release_exclusive(resource, id)
    }

    fn holds(&self, resource: ResourceType, id: u64, mode: LockMode) -> bool {
        self.inner.holds(resource, id, mode)
    }

    fn release_all(&self) {
        self.inner.release_all()
    }
}

fn delete_relationship(engine: &RecordStorageEngine, rel: RelId) -> Result<TxId> {
    let mut tx = engine.new_transaction()?;
    tx.relationship_delete(rel)?;
    engine.commit(tx)
}

fn rel_ids(engine: &RecordStorageEngine, node: u64) -> Result<BTreeSet<RelId>> {
    Ok(engine
        .relationships(node, None, Direction::Both)?
        .into_iter()
        .map(|r| r.id)
        .collect())
}

#[test]
fn replicated_batches_reproduce_the_origin() -> Result<()> {
    let origin = RecordStorageEngine::open(EngineConfig::strict().dense_node_threshold(4))?;
    let replica = RecordStorageEngine::open(EngineConfig::strict().dense_node_threshold(4))?;

    let mut tx = origin.new_transaction()?;
    let hub = tx.node_create()?;
    let peer = tx.node_create()?;
    let mut rels = Vec::new();
    for rel_type in 0..6 {
        rels.push(tx.relationship_create(rel_type, hub, peer)?);
    }
    tx.node_set_property(hub, 1, "hub")?;
    let first = commit_capturing(&origin, 1, tx)?;

    let mut tx = origin.new_transaction()?;
    tx.relationship_delete(rels[2])?;
    tx.node_set_property(hub, 1, 7i64)?;
    let second = commit_capturing(&origin, 2, tx)?;

    replica.apply(
        &[
            TransactionToApply::new(1, first),
            TransactionToApply::new(2, second),
        ],
        ApplicationMode::External,
    )?;

    assert_eq!(replica.last_tx_id(), 2);
    assert!(replica.is_dense(hub)?);
    assert_eq!(rel_ids(&replica, hub)?, rel_ids(&origin, hub)?);
    assert_eq!(replica.properties(EntityKind::Node, hub)?, vec![(1, PropertyValue::Int(7))]);
    replica.verify_node(hub)?;
    replica.verify_node(peer)?;

    // Ids written by the replicated batch are not handed out again.
    let mut tx = replica.new_transaction()?;
    let fresh = tx.node_create()?;
    assert!(fresh > peer);
    replica.rollback(tx)?;
    Ok(())
}

#[test]
fn reverse_recovery_restores_before_images() -> Result<()> {
    let engine = RecordStorageEngine::open(EngineConfig::strict())?;
    let mut tx = engine.new_transaction()?;
    let a = tx.node_create()?;
    let b = tx.node_create()?;
    let rel = tx.relationship_create(3, a, b)?;
    tx.node_set_property(a, 2, true)?;
    commit_capturing(&engine, 1, tx)?;

    let mut tx = engine.new_transaction()?;
    tx.relationship_delete(rel)?;
    tx.node_remove_property(a, 2)?;
    tx.node_set_property(b, 4, "later")?;
    let mut undo = commit_capturing(&engine, 2, tx)?;
    assert!(rel_ids(&engine, a)?.is_empty());

    undo.reverse();
    engine.apply(
        &[TransactionToApply::new(2, undo)],
        ApplicationMode::ReverseRecovery,
    )?;
    assert_eq!(rel_ids(&engine, a)?, BTreeSet::from([rel]));
    assert_eq!(engine.properties(EntityKind::Node, a)?, vec![(2, PropertyValue::Bool(true))]);
    assert!(engine.properties(EntityKind::Node, b)?.is_empty());
    engine.verify_node(a)?;
    engine.verify_node(b)?;
    Ok(())
}

#[test]
fn external_batches_register_tokens() -> Result<()> {
    let origin = RecordStorageEngine::open(EngineConfig::strict())?;
    let replica = RecordStorageEngine::open(EngineConfig::strict())?;

    let mut tx = origin.new_transaction()?;
    let label = tx.create_token(TokenKind::Label, "Person", false)?;
    let key = tx.create_token(TokenKind::PropertyKey, "name", false)?;
    let commands = commit_capturing(&origin, 1, tx)?;

    replica.apply(&[TransactionToApply::new(1, commands)], ApplicationMode::External)?;
    assert_eq!(replica.tokens().id_of(TokenKind::Label, "Person"), Some(label));
    assert_eq!(replica.tokens().id_of(TokenKind::PropertyKey, "name"), Some(key));
    assert_eq!(replica.get_or_create_token(TokenKind::Label, "Person")?, label);
    Ok(())
}

#[test]
fn counts_follow_labels_and_relationships() -> Result<()> {
    let engine = RecordStorageEngine::open(EngineConfig::strict())?;
    let person = engine.get_or_create_token(TokenKind::Label, "Person")?;
    let knows = engine.get_or_create_token(TokenKind::RelationshipType, "KNOWS")?;

    let mut tx = engine.new_transaction()?;
    let a = tx.node_create()?;
    let b = tx.node_create()?;
    tx.node_add_label(a, person)?;
    tx.node_add_label(b, person)?;
    tx.relationship_create(knows, a, b)?;
    engine.commit(tx)?;

    let counts = engine.counts();
    assert_eq!(counts.node_count(ANY_LABEL), 2);
    assert_eq!(counts.node_count(person), 2);
    assert_eq!(counts.relationship_count(ANY_LABEL, knows, ANY_LABEL), 1);
    assert_eq!(counts.relationship_count(person, knows, ANY_LABEL), 1);

    let mut tx = engine.new_transaction()?;
    tx.node_remove_label(b, person)?;
    engine.commit(tx)?;
    assert_eq!(counts.node_count(person), 1);
    assert_eq!(counts.relationship_count(ANY_LABEL, knows, person), 0);
    Ok(())
}

#[test]
fn index_entries_follow_property_and_label_changes() -> Result<()> {
    let indexes = Arc::new(MemoryIndexes::new());
    let engine = RecordStorageEngine::with_collaborators(
        EngineConfig::strict(),
        Collaborators::in_memory()?.with_indexes(Arc::clone(&indexes)),
    )?;
    let person = engine.get_or_create_token(TokenKind::Label, "Person")?;
    let name = engine.get_or_create_token(TokenKind::PropertyKey, "name")?;
    let index = engine.create_index("person_name", SchemaDescriptor::for_label(person, &[name]))?;
    assert_eq!(indexes.index_ids(), vec![index]);

    let mut tx = engine.new_transaction()?;
    let n = tx.node_create()?;
    tx.node_add_label(n, person)?;
    tx.node_set_property(n, name, "ada")?;
    engine.commit(tx)?;
    assert_eq!(indexes.entries(index), vec![(n, vec![PropertyValue::from("ada")])]);
    assert_eq!(indexes.entities_with_token(EntityKind::Node, person), vec![n]);

    let mut tx = engine.new_transaction()?;
    tx.node_set_property(n, name, "grace")?;
    engine.commit(tx)?;
    assert_eq!(indexes.entries(index), vec![(n, vec![PropertyValue::from("grace")])]);

    let mut tx = engine.new_transaction()?;
    tx.node_remove_label(n, person)?;
    engine.commit(tx)?;
    assert!(indexes.entries(index).is_empty());
    assert!(indexes.entities_with_token(EntityKind::Node, person).is_empty());

    engine.drop_schema_rule(index)?;
    assert!(indexes.index_ids().is_empty());
    assert!(engine.schema().rule(index).is_none());
    Ok(())
}

#[test]
fn uniqueness_violations_are_rejected_before_any_write() -> Result<()> {
    let indexes = Arc::new(MemoryIndexes::new());
    let metrics = Arc::new(CounterMetrics::default());
    let engine = RecordStorageEngine::with_collaborators(
        EngineConfig::strict(),
        Collaborators::in_memory()?
            .with_indexes(Arc::clone(&indexes))
            .with_metrics(Arc::clone(&metrics) as Arc<dyn EngineMetrics>),
    )?;
    let person = engine.get_or_create_token(TokenKind::Label, "Person")?;
    let email = engine.get_or_create_token(TokenKind::PropertyKey, "email")?;
    let constraint = engine
        .create_uniqueness_constraint("person_email", SchemaDescriptor::for_label(person, &[email]))?;
    let Some(backing) = indexes.index_ids().first().copied() else {
        panic!("constraint has no backing index");
    };
    assert!(indexes.is_constraint_active(backing));
    assert!(engine.schema().rule(constraint).is_some());

    let mut tx = engine.new_transaction()?;
    let first = tx.node_create()?;
    tx.node_add_label(first, person)?;
    tx.node_set_property(first, email, "a@example.com")?;
    engine.commit(tx)?;

    let mut tx = engine.new_transaction()?;
    let clash = tx.node_create()?;
    tx.node_add_label(clash, person)?;
    tx.node_set_property(clash, email, "a@example.com")?;
    let err = engine.commit(tx).expect_err("duplicate email must be rejected");
    assert!(err.is_retryable());
    assert!(!err.is_fatal());

    assert!(engine.health().is_healthy());
    assert!(!engine.node_exists(clash)?);
    assert_eq!(indexes.entries(backing).len(), 1);
    assert_eq!(engine.counts().node_count(person), 1);
    assert_eq!(metrics.transactions_rolled_back.load(Ordering::Relaxed), 1);

    // The freed id and the engine stay usable.
    let mut tx = engine.new_transaction()?;
    let other = tx.node_create()?;
    tx.node_add_label(other, person)?;
    tx.node_set_property(other, email, "b@example.com")?;
    engine.commit(tx)?;
    assert_eq!(indexes.entries(backing).len(), 2);
    Ok(())
}

#[test]
fn constraint_failure_in_a_replicated_batch_panics_the_engine() -> Result<()> {
    let indexes = Arc::new(MemoryIndexes::new());
    let engine = RecordStorageEngine::with_collaborators(
        EngineConfig::strict(),
        Collaborators::in_memory()?.with_indexes(Arc::clone(&indexes)),
    )?;
    let person = engine.get_or_create_token(TokenKind::Label, "Person")?;
    let email = engine.get_or_create_token(TokenKind::PropertyKey, "email")?;
    engine.create_uniqueness_constraint("person_email", SchemaDescriptor::for_label(person, &[email]))?;

    let mut tx = engine.new_transaction()?;
    let first = tx.node_create()?;
    tx.node_add_label(first, person)?;
    tx.node_set_property(first, email, "a")?;
    engine.commit(tx)?;

    let mut innocent = engine.new_transaction()?;
    innocent.node_create()?;
    let innocent_commands = engine.create_commands(&mut innocent)?;
    let mut clash = engine.new_transaction()?;
    let dup = clash.node_create()?;
    clash.node_add_label(dup, person)?;
    clash.node_set_property(dup, email, "a")?;
    let clash_commands = engine.create_commands(&mut clash)?;
    engine.rollback(innocent)?;
    engine.rollback(clash)?;
    let last = engine.last_tx_id();

    let err = engine
        .apply(
            &[
                TransactionToApply::new(100, innocent_commands),
                TransactionToApply::new(101, clash_commands),
            ],
            ApplicationMode::External,
        )
        .expect_err("duplicate email must fail the batch");
    assert!(matches!(err, CoreError::Apply { tx_id: 101, .. }));
    assert!(err.is_fatal());
    assert!(!err.is_retryable());
    assert!(!engine.health().is_healthy());
    assert!(engine.health_report().cause.is_some());
    assert!(matches!(engine.new_transaction(), Err(CoreError::Panicked(_))));
    assert_eq!(engine.last_tx_id(), last);
    Ok(())
}

#[test]
fn group_deleted_while_locking_is_replanned() -> Result<()> {
    let locks = Arc::new(InterleavingLocks::default());
    let engine = Arc::new(RecordStorageEngine::with_collaborators(
        EngineConfig::strict().dense_node_threshold(4),
        Collaborators::in_memory()?.with_locks(Arc::clone(&locks) as Arc<dyn LockManager>),
    )?);

    let mut tx = engine.new_transaction()?;
    let hub = tx.node_create()?;
    let peer = tx.node_create()?;
    engine.commit(tx)?;
    let mut tx = engine.new_transaction()?;
    for _ in 0..6 {
        tx.relationship_create(7, hub, peer)?;
    }
    let lone = tx.relationship_create(5, hub, peer)?;
    engine.commit(tx)?;
    let types = |node| -> Result<Vec<u32>> {
        Ok(engine.groups(node)?.iter().map(|g| g.rel_type).collect())
    };
    assert!(engine.is_dense(hub)?);
    assert_eq!(types(hub)?, vec![5, 7]);

    // The head group of both nodes disappears after the creating
    // transaction planned its locks but before it was granted any.
    let mut tx = engine.new_transaction()?;
    let fresh = tx.relationship_create(5, hub, peer)?;
    let concurrent: Arc<Mutex<Option<Result<TxId>>>> = Arc::default();
    {
        let engine = Arc::clone(&engine);
        let concurrent = Arc::clone(&concurrent);
        locks.arm(move || {
            *concurrent.lock() = Some(delete_relationship(&engine, lone));
        });
    }
    engine.commit(tx)?;

    let Some(deleted) = concurrent.lock().take() else {
        panic!("concurrent delete did not run");
    };
    deleted?;
    assert!(engine.health().is_healthy());
    let typed: Vec<RelId> = engine
        .relationships(hub, Some(&[5]), Direction::Outgoing)?
        .into_iter()
        .map(|r| r.id)
        .collect();
    assert_eq!(typed, vec![fresh]);
    assert_eq!(types(hub)?, vec![5, 7]);
    assert_eq!(types(peer)?, vec![5, 7]);
    engine.verify_node(hub)?;
    engine.verify_node(peer)?;
    Ok(())
}

#[test]
fn fatal_failures_panic_until_healed() -> Result<()> {
    let indexes = Arc::new(MemoryIndexes::new());
    let engine = RecordStorageEngine::with_collaborators(
        EngineConfig::strict(),
        Collaborators::in_memory()?.with_indexes(Arc::clone(&indexes)),
    )?;
    let label = engine.get_or_create_token(TokenKind::Label, "City")?;
    let key = engine.get_or_create_token(TokenKind::PropertyKey, "zip")?;
    let index = engine.create_index("city_zip", SchemaDescriptor::for_label(label, &[key]))?;
    indexes.fail_index(index);

    let mut tx = engine.new_transaction()?;
    let n = tx.node_create()?;
    tx.node_add_label(n, label)?;
    tx.node_set_property(n, key, 1000i64)?;
    let err = engine.commit(tx).expect_err("failed index must reject updates");
    assert!(err.is_fatal());

    let report = engine.health_report();
    assert!(!engine.health().is_healthy());
    assert!(report.cause.is_some());
    assert!(matches!(engine.new_transaction(), Err(CoreError::Panicked(_))));
    assert!(matches!(
        engine.apply(&[], ApplicationMode::Recovery),
        Err(CoreError::Panicked(_))
    ));

    engine.health().heal();
    engine.drop_schema_rule(index)?;
    let mut tx = engine.new_transaction()?;
    tx.node_create()?;
    engine.commit(tx)?;
    Ok(())
}
