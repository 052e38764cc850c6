//! Property chains of nodes, relationships and schema rules.

use tracing::trace;

use crate::ids::TransactionIds;
use crate::storage::property::{decode_block, encode_block};
use crate::storage::record::{IdType, PropertyOwner, PropertyRecord};
use crate::txn::chain::CycleGuard;
use crate::txn::changes::RecordChangeSet;
use crate::types::{is_null, CoreError, PropKeyId, PropRecordId, PropertyValue, Result, NULL_REF};

fn owner_head(changes: &mut RecordChangeSet, owner: PropertyOwner) -> Result<PropRecordId> {
    match owner {
        PropertyOwner::Node(id) => Ok(changes.nodes.get_or_load(id)?.for_reading_linkage().next_prop),
        PropertyOwner::Relationship(id) => Ok(changes
            .relationships
            .get_or_load(id)?
            .for_reading_linkage()
            .next_prop),
        PropertyOwner::Schema(id) => Ok(changes.schema.get_or_load(id)?.for_reading_linkage().next_prop),
        PropertyOwner::None => Err(CoreError::Invalid("property chain without owner".into())),
    }
}

fn set_owner_head(
    changes: &mut RecordChangeSet,
    owner: PropertyOwner,
    head: PropRecordId,
) -> Result<()> {
    match owner {
        PropertyOwner::Node(id) => changes.nodes.get_or_load(id)?.for_changing_linkage().next_prop = head,
        PropertyOwner::Relationship(id) => {
            changes
                .relationships
                .get_or_load(id)?
                .for_changing_linkage()
                .next_prop = head
        }
        PropertyOwner::Schema(id) => changes.schema.get_or_load(id)?.for_changing_linkage().next_prop = head,
        PropertyOwner::None => return Err(CoreError::Invalid("property chain without owner".into())),
    }
    Ok(())
}

/// Ids of the property records of `owner`, in chain order.
pub fn chain_ids(
    changes: &mut RecordChangeSet,
    owner: PropertyOwner,
    cycle_threshold: u64,
) -> Result<Vec<PropRecordId>> {
    let mut guard = CycleGuard::new("property", owner_id(owner), cycle_threshold);
    let mut current = owner_head(changes, owner)?;
    let mut out = Vec::new();
    while !is_null(current) {
        guard.step(current)?;
        let record = changes.properties.get_or_load(current)?.into_linkage();
        if record.owner != owner {
            return Err(CoreError::Inconsistency(format!(
                "property record {current} owned by {:?} found in chain of {owner:?}",
                record.owner
            )));
        }
        out.push(current);
        current = record.next_prop;
    }
    Ok(out)
}

fn owner_id(owner: PropertyOwner) -> u64 {
    match owner {
        PropertyOwner::Node(id) | PropertyOwner::Relationship(id) | PropertyOwner::Schema(id) => id,
        PropertyOwner::None => NULL_REF,
    }
}

/// Sets `key = value` on `owner`.
///
/// An existing block for the key is replaced in place. Otherwise the block
/// goes into the first record with space, or into a new record put in front
/// of the chain.
pub fn set_property(
    changes: &mut RecordChangeSet,
    ids: &mut TransactionIds,
    owner: PropertyOwner,
    key: PropKeyId,
    value: PropertyValue,
    cycle_threshold: u64,
) -> Result<()> {
    let mut with_space = None;
    for id in chain_ids(changes, owner, cycle_threshold)? {
        let mut proxy = changes.properties.get_or_load(id)?;
        let linkage = proxy.for_reading_linkage();
        if let Some(index) = linkage.blocks.iter().position(|b| b.key == key) {
            let record = proxy.for_changing_data()?;
            let previous = record.blocks[index].clone();
            let mut alloc = || ids.allocate(IdType::PropertyValue);
            record.blocks[index] = encode_block(key, value, Some(&previous), &mut alloc)?;
            trace!(record = id, key, "property.replaced");
            return Ok(());
        }
        if with_space.is_none() && linkage.has_space() {
            with_space = Some(id);
        }
    }
    let mut alloc = || ids.allocate(IdType::PropertyValue);
    let block = encode_block(key, value, None, &mut alloc)?;
    if let Some(id) = with_space {
        changes
            .properties
            .get_or_load(id)?
            .for_changing_data()?
            .blocks
            .push(block);
        trace!(record = id, key, "property.added");
        return Ok(());
    }
    let head = owner_head(changes, owner)?;
    let id = ids.allocate(IdType::Property)?;
    {
        let mut proxy = changes.properties.create(id)?;
        let record = proxy.for_changing_data()?;
        *record = PropertyRecord {
            created: true,
            next_prop: head,
            blocks: vec![block],
            ..PropertyRecord::new(id, owner)
        };
    }
    if !is_null(head) {
        changes.properties.get_or_load(head)?.for_changing_data()?.prev_prop = id;
    }
    set_owner_head(changes, owner, id)?;
    trace!(record = id, key, "property.record.created");
    Ok(())
}

/// Removes `key` from `owner`; returns false when it was not set.
/// A record left without blocks is unlinked and marked unused.
pub fn remove_property(
    changes: &mut RecordChangeSet,
    owner: PropertyOwner,
    key: PropKeyId,
    cycle_threshold: u64,
) -> Result<bool> {
    for id in chain_ids(changes, owner, cycle_threshold)? {
        let mut proxy = changes.properties.get_or_load(id)?;
        let Some(index) = proxy
            .for_reading_linkage()
            .blocks
            .iter()
            .position(|b| b.key == key)
        else {
            continue;
        };
        let record = proxy.for_changing_data()?;
        record.blocks.remove(index);
        if record.blocks.is_empty() {
            let (prev, next) = (record.prev_prop, record.next_prop);
            record.in_use = false;
            unlink(changes, owner, prev, next)?;
        }
        trace!(record = id, key, "property.removed");
        return Ok(true);
    }
    Ok(false)
}

fn unlink(
    changes: &mut RecordChangeSet,
    owner: PropertyOwner,
    prev: PropRecordId,
    next: PropRecordId,
) -> Result<()> {
    if is_null(prev) {
        set_owner_head(changes, owner, next)?;
    } else {
        changes.properties.get_or_load(prev)?.for_changing_data()?.next_prop = next;
    }
    if !is_null(next) {
        changes.properties.get_or_load(next)?.for_changing_data()?.prev_prop = prev;
    }
    Ok(())
}

/// Marks every property record of `owner` unused, releasing their
/// dynamic value records with them.
pub fn delete_chain(
    changes: &mut RecordChangeSet,
    owner: PropertyOwner,
    cycle_threshold: u64,
) -> Result<()> {
    for id in chain_ids(changes, owner, cycle_threshold)? {
        changes.properties.get_or_load(id)?.for_changing_data()?.in_use = false;
    }
    Ok(())
}

/// Current properties of `owner`, ordered by key.
pub fn read_properties(
    changes: &mut RecordChangeSet,
    owner: PropertyOwner,
    cycle_threshold: u64,
) -> Result<Vec<(PropKeyId, PropertyValue)>> {
    let mut out = Vec::new();
    for id in chain_ids(changes, owner, cycle_threshold)? {
        let mut proxy = changes.properties.get_or_load(id)?;
        for block in &proxy.for_reading_data()?.blocks {
            out.push((block.key, decode_block(block)?));
        }
    }
    out.sort_by_key(|(key, _)| *key);
    Ok(out)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::ids::IdGenerators;
    use crate::storage::record::NodeRecord;
    use crate::storage::store::Stores;

    fn setup() -> Result<(Stores, RecordChangeSet, TransactionIds)> {
        let ids = IdGenerators::in_memory();
        let stores = Stores::in_memory(ids.clone())?;
        stores.nodes.update_record(&NodeRecord::new(1))?;
        let changes = RecordChangeSet::new(&stores);
        Ok((stores, changes, TransactionIds::new(ids)))
    }

    const OWNER: PropertyOwner = PropertyOwner::Node(1);

    #[test]
    fn fills_records_before_prepending() -> Result<()> {
        let (_, mut changes, mut ids) = setup()?;
        for key in 0..6 {
            set_property(&mut changes, &mut ids, OWNER, key, (key as i64).into(), 100)?;
        }
        assert_eq!(chain_ids(&mut changes, OWNER, 100)?.len(), 2);
        set_property(&mut changes, &mut ids, OWNER, 2, "two".into(), 100)?;
        let props = read_properties(&mut changes, OWNER, 100)?;
        assert_eq!(props.len(), 6);
        assert_eq!(props[2], (2, PropertyValue::String("two".into())));
        Ok(())
    }

    #[test]
    fn removing_last_block_unlinks_record() -> Result<()> {
        let (_, mut changes, mut ids) = setup()?;
        for key in 0..5 {
            set_property(&mut changes, &mut ids, OWNER, key, true.into(), 100)?;
        }
        let head = chain_ids(&mut changes, OWNER, 100)?[0];
        assert!(remove_property(&mut changes, OWNER, 4, 100)?);
        assert!(!remove_property(&mut changes, OWNER, 4, 100)?);
        let remaining = chain_ids(&mut changes, OWNER, 100)?;
        assert_eq!(remaining.len(), 1);
        assert_ne!(remaining[0], head);
        assert!(!changes.properties.get_if_loaded(head).map(|r| r.in_use).unwrap_or(true));
        Ok(())
    }

    #[test]
    fn large_values_survive_flush_and_reload() -> Result<()> {
        let (stores, mut changes, mut ids) = setup()?;
        let long = "x".repeat(150);
        set_property(&mut changes, &mut ids, OWNER, 7, long.clone().into(), 100)?;
        changes.flush()?;
        let mut fresh = RecordChangeSet::new(&stores);
        let props = read_properties(&mut fresh, OWNER, 100)?;
        assert_eq!(props, vec![(7, PropertyValue::String(long))]);
        Ok(())
    }
}
