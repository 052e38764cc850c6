#![allow(missing_docs)]

use chainstore::derive::{
    derive_updates, entity_updates, IndexUpdateKind, PropertyEvent, StorePropertyLoader, Tokens,
};
use chainstore::schema::SchemaDescriptor;
use chainstore::storage::TokenKind;
use chainstore::types::{EntityKind, Result};
use chainstore::{EngineConfig, PropertyValue, RecordStorageEngine};

const P1: u32 = 1;
const P2: u32 = 2;

fn setup_engine() -> Result<RecordStorageEngine> {
    RecordStorageEngine::open(EngineConfig::strict())
}

#[test]
fn set_and_remove_yield_changed_and_removed_only() -> Result<()> {
    let engine = setup_engine()?;
    let mut tx = engine.new_transaction()?;
    let node = tx.node_create()?;
    tx.node_set_property(node, P1, 0i64)?;
    tx.node_set_property(node, P2, 5i64)?;
    tx.node_set_property(node, 3, "untouched")?;
    engine.commit(tx)?;

    let mut tx = engine.new_transaction()?;
    tx.node_set_property(node, P1, 1i64)?;
    tx.node_remove_property(node, P2)?;
    let commands = engine.create_commands(&mut tx)?;

    let mut loader = StorePropertyLoader::new(engine.stores(), engine.config().cycle_detection_threshold);
    let updates = entity_updates(&commands, &mut loader)?;
    engine.rollback(tx)?;

    assert_eq!(updates.len(), 1);
    let update = &updates[0];
    assert_eq!((update.entity, update.id), (EntityKind::Node, node));
    assert!(!update.tokens.changed);
    assert_eq!(
        update.properties,
        vec![
            PropertyEvent::Changed {
                key: P1,
                before: PropertyValue::Int(0),
                after: PropertyValue::Int(1),
            },
            PropertyEvent::Removed {
                key: P2,
                value: PropertyValue::Int(5),
            },
        ]
    );
    Ok(())
}

#[test]
fn rewriting_an_equal_value_produces_no_event() -> Result<()> {
    let engine = setup_engine()?;
    let mut tx = engine.new_transaction()?;
    let node = tx.node_create()?;
    tx.node_set_property(node, P1, "same")?;
    engine.commit(tx)?;

    let mut tx = engine.new_transaction()?;
    tx.node_set_property(node, P1, "same")?;
    let commands = engine.create_commands(&mut tx)?;
    let mut loader = StorePropertyLoader::new(engine.stores(), engine.config().cycle_detection_threshold);
    assert!(entity_updates(&commands, &mut loader)?.is_empty());
    engine.rollback(tx)?;
    Ok(())
}

#[test]
fn label_changes_become_token_updates() -> Result<()> {
    let engine = setup_engine()?;
    let person = engine.get_or_create_token(TokenKind::Label, "Person")?;
    let admin = engine.get_or_create_token(TokenKind::Label, "Admin")?;

    let mut tx = engine.new_transaction()?;
    let node = tx.node_create()?;
    tx.node_add_label(node, person)?;
    engine.commit(tx)?;

    let mut tx = engine.new_transaction()?;
    tx.node_add_label(node, admin)?;
    let commands = engine.create_commands(&mut tx)?;
    let mut loader = StorePropertyLoader::new(engine.stores(), engine.config().cycle_detection_threshold);
    let derived = derive_updates(&commands, engine.schema(), &mut loader)?;
    engine.rollback(tx)?;

    assert!(derived.index.is_empty());
    assert_eq!(derived.tokens.len(), 1);
    let update = &derived.tokens[0];
    assert_eq!(update.entity, node);
    assert_eq!(update.before, Tokens::from_slice(&[person]));
    let mut after = Tokens::from_slice(&[person, admin]);
    after.sort_unstable();
    assert_eq!(update.after, after);
    Ok(())
}

#[test]
fn index_updates_use_stored_values_for_untouched_keys() -> Result<()> {
    let engine = setup_engine()?;
    let city = engine.get_or_create_token(TokenKind::Label, "City")?;
    let name = engine.get_or_create_token(TokenKind::PropertyKey, "name")?;
    let zip = engine.get_or_create_token(TokenKind::PropertyKey, "zip")?;
    let index = engine.create_index("city_name_zip", SchemaDescriptor::for_label(city, &[name, zip]))?;

    let mut tx = engine.new_transaction()?;
    let node = tx.node_create()?;
    tx.node_add_label(node, city)?;
    tx.node_set_property(node, name, "Oslo")?;
    tx.node_set_property(node, zip, 150i64)?;
    engine.commit(tx)?;

    let mut tx = engine.new_transaction()?;
    tx.node_set_property(node, zip, 151i64)?;
    let commands = engine.create_commands(&mut tx)?;
    let mut loader = StorePropertyLoader::new(engine.stores(), engine.config().cycle_detection_threshold);
    let derived = derive_updates(&commands, engine.schema(), &mut loader)?;
    engine.rollback(tx)?;

    assert_eq!(derived.index.len(), 1);
    let update = &derived.index[0];
    assert_eq!((update.index, update.entity), (index, node));
    assert_eq!(
        update.kind,
        IndexUpdateKind::Changed {
            before: vec![PropertyValue::from("Oslo"), PropertyValue::Int(150)],
            after: vec![PropertyValue::from("Oslo"), PropertyValue::Int(151)],
        }
    );
    Ok(())
}

#[test]
fn deleting_an_entity_removes_every_property() -> Result<()> {
    let engine = setup_engine()?;
    let mut tx = engine.new_transaction()?;
    let a = tx.node_create()?;
    let b = tx.node_create()?;
    let rel = tx.relationship_create(4, a, b)?;
    tx.relationship_set_property(rel, P1, true)?;
    tx.relationship_set_property(rel, P2, "x".repeat(40))?;
    engine.commit(tx)?;

    let mut tx = engine.new_transaction()?;
    tx.relationship_delete(rel)?;
    let commands = engine.create_commands(&mut tx)?;
    let mut loader = StorePropertyLoader::new(engine.stores(), engine.config().cycle_detection_threshold);
    let updates = entity_updates(&commands, &mut loader)?;
    engine.rollback(tx)?;

    let rel_update = updates
        .iter()
        .find(|u| u.entity == EntityKind::Relationship)
        .expect("relationship update");
    assert_eq!(rel_update.id, rel);
    assert_eq!(
        rel_update.properties,
        vec![
            PropertyEvent::Removed {
                key: P1,
                value: PropertyValue::Bool(true),
            },
            PropertyEvent::Removed {
                key: P2,
                value: PropertyValue::String("x".repeat(40)),
            },
        ]
    );
    Ok(())
}

#[test]
fn removing_a_relationship_property_leaves_its_type_index() -> Result<()> {
    let engine = setup_engine()?;
    let knows = engine.get_or_create_token(TokenKind::RelationshipType, "KNOWS")?;
    let since = engine.get_or_create_token(TokenKind::PropertyKey, "since")?;
    let index = engine.create_index("knows_since", SchemaDescriptor::for_type(knows, &[since]))?;

    let mut tx = engine.new_transaction()?;
    let a = tx.node_create()?;
    let b = tx.node_create()?;
    let rel = tx.relationship_create(knows, a, b)?;
    tx.relationship_set_property(rel, since, 2019i64)?;
    tx.relationship_set_property(rel, P1, "kept")?;
    engine.commit(tx)?;

    let mut tx = engine.new_transaction()?;
    tx.relationship_remove_property(rel, since)?;
    let commands = engine.create_commands(&mut tx)?;
    let mut loader = StorePropertyLoader::new(engine.stores(), engine.config().cycle_detection_threshold);
    let derived = derive_updates(&commands, engine.schema(), &mut loader)?;
    engine.rollback(tx)?;

    assert_eq!(derived.index.len(), 1);
    let update = &derived.index[0];
    assert_eq!((update.index, update.entity), (index, rel));
    assert_eq!(update.kind, IndexUpdateKind::Removed(vec![PropertyValue::Int(2019)]));
    Ok(())
}
