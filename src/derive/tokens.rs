use smallvec::SmallVec;

use crate::apply::command::RecordCommand;
use crate::derive::updates::PropertyLoader;
use crate::storage::labels::node_labels;
use crate::storage::record::{NodeRecord, Record, RelationshipRecord};
use crate::types::{EntityKind, Result};

/// Token list of an entity.
pub type Tokens = SmallVec<[u32; 4]>;

/// Labels or relationship type of an entity before and after a batch.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct TokenChange {
    /// Sorted tokens before.
    pub before: Tokens,
    /// Sorted tokens after.
    pub after: Tokens,
    /// Whether the tokens may have changed. Overflow label fields count as
    /// changed even when the field itself is identical.
    pub changed: bool,
}

impl TokenChange {
    /// Tokens that are known not to have changed.
    pub fn unchanged(tokens: Tokens) -> Self {
        Self {
            before: tokens.clone(),
            after: tokens,
            changed: false,
        }
    }

    /// Tokens that may have been gained or lost. A conservative change lists
    /// every token of both sides.
    pub fn changed_tokens(&self) -> Tokens {
        if !self.changed {
            return Tokens::new();
        }
        let mut out: Tokens = self
            .before
            .iter()
            .filter(|t| !self.after.contains(t))
            .chain(self.after.iter().filter(|t| !self.before.contains(t)))
            .copied()
            .collect();
        if out.is_empty() {
            out = self.after.clone();
        }
        out.sort_unstable();
        out
    }

    /// Tokens present on both sides and not reported as changed.
    pub fn unchanged_tokens(&self) -> Tokens {
        let changed = self.changed_tokens();
        self.after
            .iter()
            .filter(|t| self.before.contains(t) && !changed.contains(t))
            .copied()
            .collect()
    }
}

fn labels_of(node: &NodeRecord, loader: &mut dyn PropertyLoader) -> Result<Tokens> {
    if !node.in_use {
        return Ok(Tokens::new());
    }
    if node.is_light() {
        return loader.tokens(EntityKind::Node, node.id);
    }
    node_labels(node)
}

/// Label change carried by a node command. Light images with overflow
/// labels read the current labels through `loader`.
pub fn node_token_change(
    command: &RecordCommand<NodeRecord>,
    loader: &mut dyn PropertyLoader,
) -> Result<TokenChange> {
    let overflow = command.before.labels.is_dynamic() || command.after.labels.is_dynamic();
    let before = labels_of(&command.before, loader)?;
    let after = labels_of(&command.after, loader)?;
    let changed = overflow || before != after;
    Ok(TokenChange {
        before,
        after,
        changed,
    })
}

/// Type change carried by a relationship command; only creation and
/// deletion change it.
pub fn relationship_token_change(command: &RecordCommand<RelationshipRecord>) -> TokenChange {
    let side = |r: &RelationshipRecord| -> Tokens {
        if r.in_use {
            SmallVec::from_slice(&[r.rel_type])
        } else {
            Tokens::new()
        }
    };
    let before = side(&command.before);
    let after = side(&command.after);
    TokenChange {
        changed: before != after,
        before,
        after,
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::storage::labels::set_labels;
    use crate::types::{PropKeyId, PropertyValue};

    struct NoLoads;

    impl PropertyLoader for NoLoads {
        fn properties(
            &mut self,
            _: EntityKind,
            _: u64,
        ) -> Result<Vec<(PropKeyId, PropertyValue)>> {
            Ok(Vec::new())
        }

        fn tokens(&mut self, _: EntityKind, _: u64) -> Result<Tokens> {
            Ok(SmallVec::from_slice(&[42]))
        }
    }

    fn labelled(labels: &[u32]) -> Result<NodeRecord> {
        let mut node = NodeRecord::new(1);
        let mut next = 100u64;
        let mut ids = || -> Result<u64> {
            next += 1;
            Ok(next)
        };
        set_labels(&mut node, labels, &mut ids)?;
        Ok(node)
    }

    #[test]
    fn inline_labels_diff_exactly() -> Result<()> {
        let command = RecordCommand::new(labelled(&[1, 2])?, labelled(&[2, 3])?);
        let change = node_token_change(&command, &mut NoLoads)?;
        assert!(change.changed);
        assert_eq!(change.changed_tokens().as_slice(), &[1, 3]);
        assert_eq!(change.unchanged_tokens().as_slice(), &[2]);

        let same = RecordCommand::new(labelled(&[5])?, labelled(&[5])?);
        assert!(!node_token_change(&same, &mut NoLoads)?.changed);
        Ok(())
    }

    #[test]
    fn overflow_labels_count_as_changed() -> Result<()> {
        let many = labelled(&[1, 2, 3, 4, 5, 6])?;
        let command = RecordCommand::new(many.clone(), many);
        let change = node_token_change(&command, &mut NoLoads)?;
        assert!(change.changed);
        assert_eq!(change.changed_tokens().len(), 6);
        Ok(())
    }

    #[test]
    fn light_overflow_images_use_the_loader() -> Result<()> {
        let mut light = labelled(&[1, 2, 3, 4, 5, 6])?;
        light.strip_heavy();
        let command = RecordCommand::new(light.clone(), light);
        let change = node_token_change(&command, &mut NoLoads)?;
        assert_eq!(change.after.as_slice(), &[42]);
        Ok(())
    }

    #[test]
    fn relationship_type_changes_on_create() {
        let created = RecordCommand::new(
            RelationshipRecord::new_unused(1),
            RelationshipRecord::new(1, 2, 3, 9),
        );
        let change = relationship_token_change(&created);
        assert!(change.changed);
        assert_eq!(change.changed_tokens().as_slice(), &[9]);
    }
}
