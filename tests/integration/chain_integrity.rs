#![allow(missing_docs)]

use std::collections::BTreeSet;

use chainstore::types::{NodeId, RelId, Result};
use chainstore::{Direction, EngineConfig, RecordStorageEngine};
use rand::{Rng, SeedableRng};
use rand_chacha::ChaCha8Rng;

const TYPE_A: u32 = 0;

fn setup_engine() -> Result<RecordStorageEngine> {
    RecordStorageEngine::open(EngineConfig::strict())
}

fn ids(engine: &RecordStorageEngine, node: NodeId, dir: Direction) -> Result<BTreeSet<RelId>> {
    Ok(engine
        .relationships(node, None, dir)?
        .into_iter()
        .map(|r| r.id)
        .collect())
}

#[test]
fn create_then_delete_single_relationship() -> Result<()> {
    let engine = setup_engine()?;

    let mut tx = engine.new_transaction()?;
    let n1 = tx.node_create()?;
    let n2 = tx.node_create()?;
    let rel = tx.relationship_create(TYPE_A, n1, n2)?;
    engine.commit(tx)?;

    assert_eq!(ids(&engine, n1, Direction::Outgoing)?, BTreeSet::from([rel]));
    assert!(ids(&engine, n1, Direction::Incoming)?.is_empty());
    assert_eq!(ids(&engine, n2, Direction::Incoming)?, BTreeSet::from([rel]));

    let mut tx = engine.new_transaction()?;
    tx.relationship_delete(rel)?;
    engine.commit(tx)?;

    assert!(ids(&engine, n1, Direction::Outgoing)?.is_empty());
    assert!(ids(&engine, n2, Direction::Both)?.is_empty());
    engine.verify_node(n1)?;
    engine.verify_node(n2)?;
    Ok(())
}

#[test]
fn loops_appear_once_in_both_directions() -> Result<()> {
    let engine = setup_engine()?;
    let mut tx = engine.new_transaction()?;
    let n = tx.node_create()?;
    let other = tx.node_create()?;
    let looped = tx.relationship_create(TYPE_A, n, n)?;
    let out = tx.relationship_create(TYPE_A, n, other)?;
    engine.commit(tx)?;

    assert_eq!(ids(&engine, n, Direction::Outgoing)?, BTreeSet::from([looped, out]));
    assert_eq!(ids(&engine, n, Direction::Incoming)?, BTreeSet::from([looped]));
    assert_eq!(engine.degree(n, None, Direction::Both)?, 2);
    engine.verify_node(n)?;
    Ok(())
}

#[test]
fn deleting_chain_middle_and_ends_keeps_links_mutual() -> Result<()> {
    let engine = setup_engine()?;
    let mut tx = engine.new_transaction()?;
    let hub = tx.node_create()?;
    let mut rels = Vec::new();
    for _ in 0..6 {
        let other = tx.node_create()?;
        rels.push(tx.relationship_create(TYPE_A, hub, other)?);
    }
    engine.commit(tx)?;

    // Newest relationship heads the chain; remove head, middle and tail.
    let mut tx = engine.new_transaction()?;
    tx.relationship_delete(rels[5])?;
    tx.relationship_delete(rels[2])?;
    tx.relationship_delete(rels[0])?;
    engine.commit(tx)?;

    let expected: BTreeSet<RelId> = [rels[1], rels[3], rels[4]].into_iter().collect();
    assert_eq!(ids(&engine, hub, Direction::Outgoing)?, expected);
    engine.verify_node(hub)?;
    Ok(())
}

#[test]
fn random_interleavings_leave_exactly_the_live_relationships() -> Result<()> {
    let mut rng = ChaCha8Rng::seed_from_u64(0x5eed_c4a1);
    let engine = setup_engine()?;

    let mut tx = engine.new_transaction()?;
    let hub = tx.node_create()?;
    let others: Vec<NodeId> = (0..8).map(|_| tx.node_create()).collect::<Result<_>>()?;
    engine.commit(tx)?;

    let mut live: BTreeSet<RelId> = BTreeSet::new();
    let mut created = 0usize;
    let mut deleted = 0usize;
    for _ in 0..40 {
        let mut tx = engine.new_transaction()?;
        let mut touched = BTreeSet::new();
        for _ in 0..rng.gen_range(1..5) {
            if !live.is_empty() && rng.gen_bool(0.4) {
                let victim = *live
                    .iter()
                    .nth(rng.gen_range(0..live.len()))
                    .expect("non-empty");
                if touched.insert(victim) {
                    tx.relationship_delete(victim)?;
                    live.remove(&victim);
                    deleted += 1;
                }
            } else {
                let other = others[rng.gen_range(0..others.len())];
                let (start, end) = if rng.gen_bool(0.5) { (hub, other) } else { (other, hub) };
                let rel = tx.relationship_create(rng.gen_range(0..3), start, end)?;
                touched.insert(rel);
                live.insert(rel);
                created += 1;
            }
        }
        engine.commit(tx)?;
        engine.verify_node(hub)?;
    }

    let seen = engine.relationships(hub, None, Direction::Both)?;
    assert_eq!(seen.len(), created - deleted);
    let unique: BTreeSet<RelId> = seen.iter().map(|r| r.id).collect();
    assert_eq!(unique.len(), seen.len(), "relationship visited twice");
    assert_eq!(unique, live);
    for node in others {
        engine.verify_node(node)?;
    }
    Ok(())
}

#[test]
fn deleting_a_node_with_relationships_is_rejected() -> Result<()> {
    let engine = setup_engine()?;
    let mut tx = engine.new_transaction()?;
    let a = tx.node_create()?;
    let b = tx.node_create()?;
    let rel = tx.relationship_create(TYPE_A, a, b)?;
    engine.commit(tx)?;

    let mut tx = engine.new_transaction()?;
    tx.node_delete(a)?;
    assert!(engine.commit(tx).is_err());
    assert!(engine.node_exists(a)?);

    let mut tx = engine.new_transaction()?;
    tx.relationship_delete(rel)?;
    tx.node_delete(a)?;
    engine.commit(tx)?;
    assert!(!engine.node_exists(a)?);
    assert!(ids(&engine, b, Direction::Both)?.is_empty());
    Ok(())
}
