//! Record store collaborator and its in-memory reference implementation.

use std::sync::Arc;

use parking_lot::RwLock;
use rustc_hash::FxHashMap;

use crate::ids::{IdGenerator, IdGenerators};
use crate::storage::record::{
    GroupRecord, IdType, NodeRecord, PropertyRecord, Record, RelationshipRecord, SchemaRecord,
    TokenKind, TokenRecord,
};
use crate::types::{CoreError, Result};

/// How strictly a read treats missing or unused records.
#[derive(Copy, Clone, Debug, PartialEq, Eq)]
pub enum RecordLoad {
    /// The record must be in use; anything else is an error.
    Normal,
    /// Written records are returned whether or not they are in use.
    Check,
    /// Missing or unused records yield `None`; used by scans racing deletes.
    Lenient,
    /// A record is always returned, unused or never written alike; used by
    /// chain-integrity traversal that must see deleted-but-not-reused records.
    Always,
}

/// Store of one record kind.
pub trait RecordStore<R: Record>: Send + Sync {
    /// Reads a light copy of record `id`.
    fn get_record(&self, id: u64, load: RecordLoad) -> Result<Option<R>>;
    /// Loads overflow content into a light record.
    fn ensure_heavy(&self, record: &mut R) -> Result<()>;
    /// Writes a record (in use or not).
    fn update_record(&self, record: &R) -> Result<()>;
    /// One past the highest id written.
    fn high_id(&self) -> u64;
    /// Allocates a new id from the store's id generator.
    fn next_id(&self) -> u64;
}

/// In-memory [`RecordStore`].
pub struct MemoryRecordStore<R> {
    name: &'static str,
    records: RwLock<FxHashMap<u64, R>>,
    ids: Arc<dyn IdGenerator>,
}

impl<R> std::fmt::Debug for MemoryRecordStore<R> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("MemoryRecordStore")
            .field("name", &self.name)
            .field("records", &self.records.read().len())
            .finish()
    }
}

impl<R: Record> MemoryRecordStore<R> {
    /// An empty store allocating ids from `ids`.
    pub fn new(name: &'static str, ids: Arc<dyn IdGenerator>) -> Self {
        Self {
            name,
            records: RwLock::new(FxHashMap::default()),
            ids,
        }
    }
}

impl<R: Record> RecordStore<R> for MemoryRecordStore<R> {
    fn get_record(&self, id: u64, load: RecordLoad) -> Result<Option<R>> {
        let stored = self.records.read().get(&id).cloned();
        let record = match (stored, load) {
            (Some(record), _) if record.in_use() => record,
            (Some(record), RecordLoad::Check | RecordLoad::Always) => record,
            (None, RecordLoad::Always) => R::new_unused(id),
            (_, RecordLoad::Lenient | RecordLoad::Check) => return Ok(None),
            (_, RecordLoad::Normal) => {
                return Err(CoreError::NotFound(format!(
                    "{} record {id} not in use",
                    self.name
                )))
            }
        };
        let mut light = record;
        light.strip_heavy();
        Ok(Some(light))
    }

    fn ensure_heavy(&self, record: &mut R) -> Result<()> {
        if !record.is_light() {
            return Ok(());
        }
        let records = self.records.read();
        match records.get(&record.id()) {
            Some(full) => {
                record.load_heavy_from(full);
                Ok(())
            }
            None => Err(CoreError::NotFound(format!(
                "{} record {} has no stored overflow content",
                self.name,
                record.id()
            ))),
        }
    }

    fn update_record(&self, record: &R) -> Result<()> {
        let mut stored = record.clone();
        stored.clear_transient();
        self.ids.mark_highest_written(record.id());
        self.records.write().insert(record.id(), stored);
        Ok(())
    }

    fn high_id(&self) -> u64 {
        self.records
            .read()
            .keys()
            .max()
            .map(|id| id + 1)
            .unwrap_or(0)
    }

    fn next_id(&self) -> u64 {
        self.ids.next_id()
    }
}

/// Every record store the core reads and writes, plus the id generators.
#[derive(Clone)]
pub struct Stores {
    /// Node records.
    pub nodes: Arc<dyn RecordStore<NodeRecord>>,
    /// Relationship records.
    pub relationships: Arc<dyn RecordStore<RelationshipRecord>>,
    /// Relationship-group records.
    pub groups: Arc<dyn RecordStore<GroupRecord>>,
    /// Property records.
    pub properties: Arc<dyn RecordStore<PropertyRecord>>,
    /// Label token records.
    pub label_tokens: Arc<dyn RecordStore<TokenRecord>>,
    /// Relationship type token records.
    pub type_tokens: Arc<dyn RecordStore<TokenRecord>>,
    /// Property key token records.
    pub key_tokens: Arc<dyn RecordStore<TokenRecord>>,
    /// Schema records.
    pub schema: Arc<dyn RecordStore<SchemaRecord>>,
    /// Id generators backing every store and dynamic record space.
    pub ids: IdGenerators,
}

impl std::fmt::Debug for Stores {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Stores").field("ids", &self.ids).finish()
    }
}

impl Stores {
    /// In-memory stores sharing the generators in `ids`.
    pub fn in_memory(ids: IdGenerators) -> Result<Self> {
        Ok(Self {
            nodes: Arc::new(MemoryRecordStore::new(
                "node",
                Arc::clone(ids.get(IdType::Node)?),
            )),
            relationships: Arc::new(MemoryRecordStore::new(
                "relationship",
                Arc::clone(ids.get(IdType::Relationship)?),
            )),
            groups: Arc::new(MemoryRecordStore::new(
                "relationship group",
                Arc::clone(ids.get(IdType::RelationshipGroup)?),
            )),
            properties: Arc::new(MemoryRecordStore::new(
                "property",
                Arc::clone(ids.get(IdType::Property)?),
            )),
            label_tokens: Arc::new(MemoryRecordStore::new(
                "label token",
                Arc::clone(ids.get(IdType::LabelToken)?),
            )),
            type_tokens: Arc::new(MemoryRecordStore::new(
                "relationship type token",
                Arc::clone(ids.get(IdType::RelationshipTypeToken)?),
            )),
            key_tokens: Arc::new(MemoryRecordStore::new(
                "property key token",
                Arc::clone(ids.get(IdType::PropertyKeyToken)?),
            )),
            schema: Arc::new(MemoryRecordStore::new(
                "schema",
                Arc::clone(ids.get(IdType::Schema)?),
            )),
            ids,
        })
    }

    /// Token store for `kind`.
    pub fn tokens(&self, kind: TokenKind) -> &Arc<dyn RecordStore<TokenRecord>> {
        match kind {
            TokenKind::Label => &self.label_tokens,
            TokenKind::RelationshipType => &self.type_tokens,
            TokenKind::PropertyKey => &self.key_tokens,
        }
    }
}
