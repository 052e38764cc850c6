#![allow(missing_docs)]

use std::collections::{BTreeMap, BTreeSet};

use chainstore::types::{NodeId, RelDirection, RelId, Result, TypeId};
use chainstore::{Direction, EngineConfig, RecordStorageEngine};
use rand::seq::SliceRandom;
use rand::SeedableRng;
use rand_chacha::ChaCha8Rng;

type Adjacency = BTreeMap<(TypeId, bool), BTreeSet<RelId>>;

fn adjacency(engine: &RecordStorageEngine, node: NodeId) -> Result<Adjacency> {
    let mut out = Adjacency::new();
    for rel in engine.relationships(node, None, Direction::Both)? {
        out.entry((rel.rel_type, rel.start == node))
            .or_default()
            .insert(rel.id);
    }
    Ok(out)
}

#[test]
fn sixty_distinct_types_convert_to_groups() -> Result<()> {
    let engine = RecordStorageEngine::open(EngineConfig::strict().dense_node_threshold(50))?;
    let mut tx = engine.new_transaction()?;
    let hub = tx.node_create()?;
    let other = tx.node_create()?;
    for rel_type in 0..60 {
        if rel_type % 3 == 0 {
            tx.relationship_create(rel_type, other, hub)?;
        } else {
            tx.relationship_create(rel_type, hub, other)?;
        }
    }
    engine.commit(tx)?;

    assert!(engine.is_dense(hub)?);
    assert!(engine.is_dense(other)?);
    let groups = engine.groups(hub)?;
    assert_eq!(groups.len(), 60);
    assert_eq!(
        groups.iter().map(|g| g.rel_type).collect::<Vec<_>>(),
        (0..60).collect::<Vec<TypeId>>()
    );
    for rel_type in 0..60u32 {
        let (out, inc) = if rel_type % 3 == 0 { (0, 1) } else { (1, 0) };
        assert_eq!(engine.degree(hub, Some(&[rel_type]), Direction::Outgoing)?, out);
        assert_eq!(engine.degree(hub, Some(&[rel_type]), Direction::Incoming)?, inc);
    }
    engine.verify_node(hub)?;
    engine.verify_node(other)?;
    Ok(())
}

#[test]
fn adjacency_survives_the_sparse_to_dense_transition() -> Result<()> {
    let engine = RecordStorageEngine::open(EngineConfig::strict().dense_node_threshold(10))?;
    let mut tx = engine.new_transaction()?;
    let hub = tx.node_create()?;
    let peers: Vec<NodeId> = (0..4).map(|_| tx.node_create()).collect::<Result<_>>()?;
    for i in 0..9u32 {
        let peer = peers[i as usize % peers.len()];
        if i % 2 == 0 {
            tx.relationship_create(i % 3, hub, peer)?;
        } else {
            tx.relationship_create(i % 3, peer, hub)?;
        }
    }
    tx.relationship_create(1, hub, hub)?;
    engine.commit(tx)?;
    assert!(!engine.is_dense(hub)?);
    let before = adjacency(&engine, hub)?;

    let mut tx = engine.new_transaction()?;
    let added = tx.relationship_create(2, hub, peers[0])?;
    engine.commit(tx)?;
    assert!(engine.is_dense(hub)?);

    let mut after = adjacency(&engine, hub)?;
    assert!(after.get_mut(&(2, true)).is_some_and(|set| set.remove(&added)));
    after.retain(|_, set| !set.is_empty());
    assert_eq!(before, after);
    engine.verify_node(hub)?;
    Ok(())
}

#[test]
fn groups_stay_ordered_under_random_type_insertion() -> Result<()> {
    let mut rng = ChaCha8Rng::seed_from_u64(42);
    let engine = RecordStorageEngine::open(EngineConfig::strict().dense_node_threshold(1))?;
    let mut tx = engine.new_transaction()?;
    let hub = tx.node_create()?;
    let peer = tx.node_create()?;
    tx.relationship_create(100, hub, peer)?;
    engine.commit(tx)?;

    let mut types: Vec<TypeId> = (0..40).collect();
    types.shuffle(&mut rng);
    for chunk in types.chunks(7) {
        let mut tx = engine.new_transaction()?;
        for rel_type in chunk {
            tx.relationship_create(*rel_type, peer, hub)?;
        }
        engine.commit(tx)?;
        let observed: Vec<TypeId> = engine.groups(hub)?.iter().map(|g| g.rel_type).collect();
        let mut sorted = observed.clone();
        sorted.sort_unstable();
        sorted.dedup();
        assert_eq!(observed, sorted);
    }
    assert_eq!(engine.groups(hub)?.len(), 41);
    engine.verify_node(hub)?;
    Ok(())
}

#[test]
fn emptied_groups_are_removed() -> Result<()> {
    let engine = RecordStorageEngine::open(EngineConfig::strict().dense_node_threshold(1))?;
    let mut tx = engine.new_transaction()?;
    let hub = tx.node_create()?;
    let peer = tx.node_create()?;
    let keep = tx.relationship_create(1, hub, peer)?;
    let drop_a = tx.relationship_create(2, hub, peer)?;
    let drop_b = tx.relationship_create(2, peer, hub)?;
    engine.commit(tx)?;
    assert_eq!(engine.groups(hub)?.len(), 2);

    let mut tx = engine.new_transaction()?;
    tx.relationship_delete(drop_a)?;
    tx.relationship_delete(drop_b)?;
    engine.commit(tx)?;

    let groups = engine.groups(hub)?;
    assert_eq!(groups.iter().map(|g| g.rel_type).collect::<Vec<_>>(), vec![1]);
    let rels: Vec<RelId> = engine
        .relationships(hub, None, Direction::Both)?
        .into_iter()
        .map(|r| r.id)
        .collect();
    assert_eq!(rels, vec![keep]);
    engine.verify_node(hub)?;
    Ok(())
}

#[test]
fn external_degrees_track_chain_lengths() -> Result<()> {
    let engine = RecordStorageEngine::open(
        EngineConfig::strict()
            .dense_node_threshold(2)
            .external_degrees_threshold(3),
    )?;
    let mut tx = engine.new_transaction()?;
    let hub = tx.node_create()?;
    let peer = tx.node_create()?;
    let mut rels = Vec::new();
    for _ in 0..8 {
        rels.push(tx.relationship_create(7, hub, peer)?);
    }
    engine.commit(tx)?;

    let mut tx = engine.new_transaction()?;
    tx.relationship_delete(rels[3])?;
    tx.relationship_delete(rels[6])?;
    engine.commit(tx)?;

    let groups = engine.groups(hub)?;
    assert_eq!(groups.len(), 1);
    let group = &groups[0];
    assert!(group.has_external_degrees(RelDirection::Outgoing));
    assert_eq!(engine.degree(hub, Some(&[7]), Direction::Outgoing)?, 6);
    assert_eq!(engine.counts().degree(group.id, RelDirection::Outgoing), 6);
    Ok(())
}
