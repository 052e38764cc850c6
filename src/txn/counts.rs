//! Counts and group degree deltas accumulated by a transaction.

use rustc_hash::FxHashMap;

use crate::types::{GroupId, LabelId, RelDirection, TypeId, ANY_LABEL, ANY_TYPE};

/// Node and relationship count changes keyed by label/type combinations.
#[derive(Debug, Default, Clone)]
pub struct CountsDelta {
    nodes: FxHashMap<LabelId, i64>,
    relationships: FxHashMap<(LabelId, TypeId, LabelId), i64>,
}

impl CountsDelta {
    /// Adds `delta` to the node count of `label`.
    pub fn increment_node(&mut self, label: LabelId, delta: i64) {
        *self.nodes.entry(label).or_insert(0) += delta;
    }

    /// Adds `delta` to the relationship count of `(start, rel_type, end)`.
    pub fn increment_relationship(
        &mut self,
        start: LabelId,
        rel_type: TypeId,
        end: LabelId,
        delta: i64,
    ) {
        *self.relationships.entry((start, rel_type, end)).or_insert(0) += delta;
    }

    /// A node with `labels` appeared (`delta` 1) or disappeared (`delta` -1).
    pub fn node_with_labels(&mut self, labels: &[LabelId], delta: i64) {
        self.increment_node(ANY_LABEL, delta);
        for label in labels {
            self.increment_node(*label, delta);
        }
    }

    /// A relationship appeared or disappeared. Counted under every
    /// combination the counts store can answer: fully wildcarded, by type,
    /// and by one endpoint label with or without the type.
    pub fn relationship_with_labels(
        &mut self,
        start_labels: &[LabelId],
        rel_type: TypeId,
        end_labels: &[LabelId],
        delta: i64,
    ) {
        self.increment_relationship(ANY_LABEL, ANY_TYPE, ANY_LABEL, delta);
        self.increment_relationship(ANY_LABEL, rel_type, ANY_LABEL, delta);
        for label in start_labels {
            self.increment_relationship(*label, ANY_TYPE, ANY_LABEL, delta);
            self.increment_relationship(*label, rel_type, ANY_LABEL, delta);
        }
        for label in end_labels {
            self.increment_relationship(ANY_LABEL, ANY_TYPE, *label, delta);
            self.increment_relationship(ANY_LABEL, rel_type, *label, delta);
        }
    }

    /// Labels of an existing node changed while `rel_type` relationships in
    /// direction `dir` stay attached: move their counts between labels.
    pub fn relationship_label_change(
        &mut self,
        rel_type: TypeId,
        dir: RelDirection,
        removed: &[LabelId],
        added: &[LabelId],
    ) {
        for (labels, delta) in [(removed, -1), (added, 1)] {
            for label in labels {
                if matches!(dir, RelDirection::Outgoing | RelDirection::Loop) {
                    self.increment_relationship(*label, ANY_TYPE, ANY_LABEL, delta);
                    self.increment_relationship(*label, rel_type, ANY_LABEL, delta);
                }
                if matches!(dir, RelDirection::Incoming | RelDirection::Loop) {
                    self.increment_relationship(ANY_LABEL, ANY_TYPE, *label, delta);
                    self.increment_relationship(ANY_LABEL, rel_type, *label, delta);
                }
            }
        }
    }

    /// Non-zero node deltas ordered by label.
    pub fn node_deltas(&self) -> Vec<(LabelId, i64)> {
        let mut out: Vec<_> = self
            .nodes
            .iter()
            .filter(|(_, delta)| **delta != 0)
            .map(|(label, delta)| (*label, *delta))
            .collect();
        out.sort_unstable();
        out
    }

    /// Non-zero relationship deltas ordered by key.
    pub fn relationship_deltas(&self) -> Vec<((LabelId, TypeId, LabelId), i64)> {
        let mut out: Vec<_> = self
            .relationships
            .iter()
            .filter(|(_, delta)| **delta != 0)
            .map(|(key, delta)| (*key, *delta))
            .collect();
        out.sort_unstable();
        out
    }

    /// Whether every delta is zero.
    pub fn is_empty(&self) -> bool {
        self.nodes.values().all(|d| *d == 0) && self.relationships.values().all(|d| *d == 0)
    }
}

/// Degree changes of groups whose degrees live in the counts store.
#[derive(Debug, Default, Clone)]
pub struct DegreeDeltas {
    deltas: FxHashMap<(GroupId, RelDirection), i64>,
}

impl DegreeDeltas {
    /// Adds `delta` to the degree of `group` in `dir`.
    pub fn increment(&mut self, group: GroupId, dir: RelDirection, delta: i64) {
        *self.deltas.entry((group, dir)).or_insert(0) += delta;
    }

    /// Non-zero deltas ordered by group and direction.
    pub fn deltas(&self) -> Vec<(GroupId, RelDirection, i64)> {
        let mut out: Vec<_> = self
            .deltas
            .iter()
            .filter(|(_, delta)| **delta != 0)
            .map(|((group, dir), delta)| (*group, *dir, *delta))
            .collect();
        out.sort_unstable();
        out
    }
}
