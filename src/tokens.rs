//! In-memory name/id registries for labels, relationship types and
//! property keys.

use parking_lot::RwLock;
use rustc_hash::FxHashMap;

use crate::apply::command::{Command, RecordCommand};
use crate::storage::dynamic::read_chain;
use crate::storage::record::{TokenKind, TokenRecord};
use crate::storage::store::{RecordStore, Stores};
use crate::types::{CoreError, Result};

/// One registered token.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct NamedToken {
    /// Token id.
    pub id: u32,
    /// Token name.
    pub name: String,
    /// Hidden from users.
    pub internal: bool,
}

#[derive(Debug, Default)]
struct Registry {
    by_id: FxHashMap<u32, NamedToken>,
    by_name: FxHashMap<String, u32>,
}

/// Registries of every token kind.
#[derive(Debug, Default)]
pub struct TokenHolders {
    labels: RwLock<Registry>,
    types: RwLock<Registry>,
    keys: RwLock<Registry>,
}

impl TokenHolders {
    /// Empty registries.
    pub fn new() -> Self {
        Self::default()
    }

    fn registry(&self, kind: TokenKind) -> &RwLock<Registry> {
        match kind {
            TokenKind::Label => &self.labels,
            TokenKind::RelationshipType => &self.types,
            TokenKind::PropertyKey => &self.keys,
        }
    }

    /// Registers `token`, replacing whatever held its id.
    pub fn add_token(&self, kind: TokenKind, token: NamedToken) {
        let mut registry = self.registry(kind).write();
        if let Some(old) = registry.by_id.remove(&token.id) {
            registry.by_name.remove(&old.name);
        }
        registry.by_name.insert(token.name.clone(), token.id);
        registry.by_id.insert(token.id, token);
    }

    /// Id of the token named `name`.
    pub fn id_of(&self, kind: TokenKind, name: &str) -> Option<u32> {
        self.registry(kind).read().by_name.get(name).copied()
    }

    /// Name of token `id`.
    pub fn name_of(&self, kind: TokenKind, id: u32) -> Option<String> {
        self.registry(kind)
            .read()
            .by_id
            .get(&id)
            .map(|token| token.name.clone())
    }

    /// Number of registered tokens of `kind`.
    pub fn len(&self, kind: TokenKind) -> usize {
        self.registry(kind).read().by_id.len()
    }

    /// Registers the token created or updated by `command`. The name is read
    /// from the command's name records, or from `store` when the image is
    /// light.
    pub fn apply_command(
        &self,
        kind: TokenKind,
        command: &RecordCommand<TokenRecord>,
        store: &dyn RecordStore<TokenRecord>,
    ) -> Result<()> {
        let record = &command.after;
        if !record.in_use {
            return Ok(());
        }
        let id = u32::try_from(record.id)
            .map_err(|_| CoreError::Inconsistency(format!("token id {} out of range", record.id)))?;
        let name = if record.light {
            let mut heavy = record.clone();
            store.ensure_heavy(&mut heavy)?;
            decode_name(&heavy)?
        } else {
            decode_name(record)?
        };
        self.add_token(
            kind,
            NamedToken {
                id,
                name,
                internal: record.internal,
            },
        );
        Ok(())
    }

    /// Registers every token command of `commands`.
    pub fn apply_commands(&self, commands: &[Command], stores: &Stores) -> Result<()> {
        for command in commands {
            if let Command::Token { kind, command } = command {
                self.apply_command(*kind, command, &**stores.tokens(*kind))?;
            }
        }
        Ok(())
    }
}

/// Decodes the name carried by the name records of a heavy token record.
pub fn decode_name(record: &TokenRecord) -> Result<String> {
    let bytes = read_chain(&record.name_records)?;
    String::from_utf8(bytes).map_err(|err| {
        CoreError::Inconsistency(format!("token {} name is not UTF-8: {err}", record.id))
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::ids::IdGenerators;
    use crate::storage::dynamic::write_chain;
    use crate::storage::record::Record;

    fn token(id: u64, name: &str) -> Result<TokenRecord> {
        let mut next = 100 + id * 10;
        let mut record = TokenRecord::new_unused(id);
        record.in_use = true;
        record.name_records = write_chain(&[], name.as_bytes(), &mut || -> Result<u64> {
            next += 1;
            Ok(next)
        })?;
        record.name_id = record.name_records[0].id;
        Ok(record)
    }

    #[test]
    fn registers_created_tokens() -> Result<()> {
        let stores = Stores::in_memory(IdGenerators::in_memory())?;
        let holders = TokenHolders::new();
        let commands = vec![Command::Token {
            kind: TokenKind::Label,
            command: RecordCommand::new(TokenRecord::new_unused(0), token(0, "Person")?),
        }];
        holders.apply_commands(&commands, &stores)?;
        assert_eq!(holders.id_of(TokenKind::Label, "Person"), Some(0));
        assert_eq!(holders.name_of(TokenKind::Label, 0).as_deref(), Some("Person"));
        assert_eq!(holders.len(TokenKind::PropertyKey), 0);
        Ok(())
    }

    #[test]
    fn light_images_read_the_name_from_the_store() -> Result<()> {
        let stores = Stores::in_memory(IdGenerators::in_memory())?;
        let stored = token(3, "KNOWS")?;
        stores.type_tokens.update_record(&stored)?;
        let mut light = stored.clone();
        light.strip_heavy();
        let holders = TokenHolders::new();
        holders.apply_command(
            TokenKind::RelationshipType,
            &RecordCommand::new(light.clone(), light),
            &*stores.type_tokens,
        )?;
        assert_eq!(holders.id_of(TokenKind::RelationshipType, "KNOWS"), Some(3));
        Ok(())
    }
}
