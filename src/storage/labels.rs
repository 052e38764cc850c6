//! Node label field: inline up to four labels, dynamic records beyond.

use smallvec::SmallVec;

use crate::storage::dynamic::{decode_labels, encode_labels, read_chain, write_chain};
use crate::storage::record::{LabelField, NodeRecord, Record, INLINE_LABEL_LIMIT};
use crate::types::{CoreError, LabelId, Result, NULL_REF};

/// Sorted labels of `node`. Dynamic label fields need heavy content loaded.
pub fn node_labels(node: &NodeRecord) -> Result<SmallVec<[LabelId; 4]>> {
    match &node.labels {
        LabelField::Inline(labels) => Ok(labels.clone()),
        LabelField::Dynamic(_) if node.is_light() => Err(CoreError::Invalid(format!(
            "labels of node {} not loaded",
            node.id
        ))),
        LabelField::Dynamic(_) => decode_labels(&read_chain(&node.dynamic_labels)?),
    }
}

/// Replaces the label set, migrating between inline and dynamic storage.
pub fn set_labels(
    node: &mut NodeRecord,
    labels: &[LabelId],
    next_id: &mut dyn FnMut() -> Result<u64>,
) -> Result<()> {
    let mut sorted: SmallVec<[LabelId; 4]> = SmallVec::from_slice(labels);
    sorted.sort_unstable();
    sorted.dedup();
    if sorted.len() <= INLINE_LABEL_LIMIT {
        node.labels = LabelField::Inline(sorted);
        node.dynamic_labels.clear();
    } else {
        let records = write_chain(&node.dynamic_labels, &encode_labels(&sorted), next_id)?;
        node.labels = LabelField::Dynamic(records.first().map(|r| r.id).unwrap_or(NULL_REF));
        node.dynamic_labels = records;
    }
    node.light = false;
    Ok(())
}

/// Adds `label`; returns false when the node already had it.
pub fn add_label(
    node: &mut NodeRecord,
    label: LabelId,
    next_id: &mut dyn FnMut() -> Result<u64>,
) -> Result<bool> {
    let mut labels = node_labels(node)?;
    if labels.contains(&label) {
        return Ok(false);
    }
    labels.push(label);
    set_labels(node, &labels, next_id)?;
    Ok(true)
}

/// Removes `label`; returns false when the node did not have it.
pub fn remove_label(
    node: &mut NodeRecord,
    label: LabelId,
    next_id: &mut dyn FnMut() -> Result<u64>,
) -> Result<bool> {
    let labels = node_labels(node)?;
    if !labels.contains(&label) {
        return Ok(false);
    }
    let remaining: SmallVec<[LabelId; 4]> = labels.into_iter().filter(|l| *l != label).collect();
    set_labels(node, &remaining, next_id)?;
    Ok(true)
}

#[cfg(test)]
mod tests {
    use super::*;

    fn ids() -> impl FnMut() -> Result<u64> {
        let mut next = 100;
        move || {
            next += 1;
            Ok(next)
        }
    }

    #[test]
    fn spills_and_returns_inline() -> Result<()> {
        let mut node = NodeRecord::new(1);
        let mut alloc = ids();
        for label in [9, 3, 7, 1, 5] {
            add_label(&mut node, label, &mut alloc)?;
        }
        assert!(node.labels.is_dynamic());
        assert_eq!(node_labels(&node)?.as_slice(), &[1, 3, 5, 7, 9]);
        assert!(remove_label(&mut node, 7, &mut alloc)?);
        assert!(!node.labels.is_dynamic());
        assert!(node.dynamic_labels.is_empty());
        assert_eq!(node_labels(&node)?.as_slice(), &[1, 3, 5, 9]);
        Ok(())
    }

    #[test]
    fn duplicate_add_and_missing_remove_are_noops() -> Result<()> {
        let mut node = NodeRecord::new(1);
        let mut alloc = ids();
        assert!(add_label(&mut node, 2, &mut alloc)?);
        assert!(!add_label(&mut node, 2, &mut alloc)?);
        assert!(!remove_label(&mut node, 4, &mut alloc)?);
        Ok(())
    }

    #[test]
    fn light_dynamic_field_is_rejected() -> Result<()> {
        let mut node = NodeRecord::new(1);
        set_labels(&mut node, &[1, 2, 3, 4, 5, 6], &mut ids())?;
        node.strip_heavy();
        assert!(node_labels(&node).is_err());
        Ok(())
    }
}
