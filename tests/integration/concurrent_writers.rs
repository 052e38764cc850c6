#![allow(missing_docs)]

use std::collections::BTreeSet;
use std::sync::{Arc, Barrier};
use std::thread;

use chainstore::storage::TokenKind;
use chainstore::types::{NodeId, RelId, Result};
use chainstore::{Direction, EngineConfig, RecordStorageEngine};

const NUM_THREADS: usize = 8;
const RELS_PER_THREAD: usize = 25;

fn shared_hub(config: EngineConfig) -> Result<(Arc<RecordStorageEngine>, NodeId)> {
    let engine = Arc::new(RecordStorageEngine::open(config)?);
    let mut tx = engine.new_transaction()?;
    let hub = tx.node_create()?;
    engine.commit(tx)?;
    Ok((engine, hub))
}

fn run_writers<F>(engine: &Arc<RecordStorageEngine>, writer: F) -> Result<Vec<Vec<RelId>>>
where
    F: Fn(&RecordStorageEngine, usize) -> Result<Vec<RelId>> + Send + Sync + 'static,
{
    let barrier = Arc::new(Barrier::new(NUM_THREADS));
    let writer = Arc::new(writer);
    let handles: Vec<_> = (0..NUM_THREADS)
        .map(|thread_id| {
            let engine = Arc::clone(engine);
            let barrier = Arc::clone(&barrier);
            let writer = Arc::clone(&writer);
            thread::spawn(move || -> Result<Vec<RelId>> {
                barrier.wait();
                writer(&engine, thread_id)
            })
        })
        .collect();
    handles
        .into_iter()
        .map(|h| h.join().expect("writer thread panicked"))
        .collect()
}

#[test]
fn concurrent_inserts_on_one_hub_stay_linked() -> Result<()> {
    let (engine, hub) = shared_hub(EngineConfig::strict().dense_node_threshold(16))?;

    let created = run_writers(&engine, move |engine, thread_id| {
        let mut tx = engine.new_transaction()?;
        let peer = tx.node_create()?;
        engine.commit(tx)?;
        let mut rels = Vec::with_capacity(RELS_PER_THREAD);
        for i in 0..RELS_PER_THREAD {
            let mut tx = engine.new_transaction()?;
            let rel_type = ((thread_id + i) % 5) as u32;
            let rel = if i % 2 == 0 {
                tx.relationship_create(rel_type, hub, peer)?
            } else {
                tx.relationship_create(rel_type, peer, hub)?
            };
            engine.commit(tx)?;
            rels.push(rel);
        }
        Ok(rels)
    })?;

    let expected: BTreeSet<RelId> = created.into_iter().flatten().collect();
    assert_eq!(expected.len(), NUM_THREADS * RELS_PER_THREAD);
    let seen: Vec<RelId> = engine
        .relationships(hub, None, Direction::Both)?
        .into_iter()
        .map(|r| r.id)
        .collect();
    assert_eq!(seen.len(), expected.len());
    assert_eq!(seen.into_iter().collect::<BTreeSet<_>>(), expected);
    assert!(engine.is_dense(hub)?);
    let types: Vec<u32> = engine.groups(hub)?.iter().map(|g| g.rel_type).collect();
    assert_eq!(types, vec![0, 1, 2, 3, 4]);
    engine.verify_node(hub)?;
    Ok(())
}

#[test]
fn concurrent_inserts_and_deletes_keep_exact_degree() -> Result<()> {
    let (engine, hub) = shared_hub(EngineConfig::strict().dense_node_threshold(40))?;

    let survivors = run_writers(&engine, move |engine, _| {
        let mut tx = engine.new_transaction()?;
        let peer = tx.node_create()?;
        let rels: Vec<RelId> = (0..RELS_PER_THREAD)
            .map(|_| tx.relationship_create(1, hub, peer))
            .collect::<Result<_>>()?;
        engine.commit(tx)?;

        let (doomed, kept): (Vec<_>, Vec<_>) = rels.into_iter().enumerate().partition(|(i, _)| i % 3 == 0);
        for (_, rel) in doomed {
            let mut tx = engine.new_transaction()?;
            tx.relationship_delete(rel)?;
            engine.commit(tx)?;
        }
        engine.verify_node(peer)?;
        Ok(kept.into_iter().map(|(_, rel)| rel).collect())
    })?;

    let expected: BTreeSet<RelId> = survivors.into_iter().flatten().collect();
    assert_eq!(engine.degree(hub, None, Direction::Outgoing)?, expected.len() as u64);
    let seen: BTreeSet<RelId> = engine
        .relationships(hub, Some(&[1]), Direction::Outgoing)?
        .into_iter()
        .map(|r| r.id)
        .collect();
    assert_eq!(seen, expected);
    engine.verify_node(hub)?;
    Ok(())
}

#[test]
fn racing_token_creation_yields_one_id() -> Result<()> {
    let (engine, _) = shared_hub(EngineConfig::strict())?;
    let ids = run_writers(&engine, |engine, _| {
        let id = engine.get_or_create_token(TokenKind::RelationshipType, "FOLLOWS")?;
        Ok(vec![u64::from(id)])
    })?;
    let distinct: BTreeSet<u64> = ids.into_iter().flatten().collect();
    assert_eq!(distinct.len(), 1);
    assert_eq!(engine.tokens().len(TokenKind::RelationshipType), 1);
    Ok(())
}
