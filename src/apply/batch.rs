use std::sync::Arc;

use tracing::debug;

use crate::apply::index::{IndexUpdateListener, IndexUpdatesWork, TokenIndexListener, TokenUpdatesWork};
use crate::apply::worksync::{first_failure, WorkSync};
use crate::derive::{DerivedUpdates, IndexEntryUpdate, TokenIndexUpdate};
use crate::ids::{IdGenerators, IdUpdates};
use crate::types::Result;

/// Dispatchers shared by every batch of an engine.
#[derive(Clone)]
pub struct BatchSinks {
    /// Id generator updates.
    pub ids: Arc<WorkSync<IdGenerators, IdUpdates>>,
    /// Index entry updates.
    pub indexes: Arc<WorkSync<dyn IndexUpdateListener, IndexUpdatesWork>>,
    /// Token index updates.
    pub tokens: Arc<WorkSync<dyn TokenIndexListener, TokenUpdatesWork>>,
}

impl BatchSinks {
    /// Dispatchers over the given targets.
    pub fn new(
        ids: IdGenerators,
        indexes: Arc<dyn IndexUpdateListener>,
        tokens: Arc<dyn TokenIndexListener>,
    ) -> Self {
        Self {
            ids: WorkSync::new("ids", Arc::new(ids)),
            indexes: WorkSync::new("indexes", indexes),
            tokens: WorkSync::new("token_indexes", tokens),
        }
    }
}

/// Work accumulated over the transactions of one batch.
///
/// Appliers hand their buffered work to the context when a transaction
/// closes; [`BatchContext::close`] flushes it once for the whole batch.
pub struct BatchContext {
    sinks: Option<BatchSinks>,
    flush_limit: usize,
    id_updates: IdUpdates,
    index_updates: Vec<IndexEntryUpdate>,
    token_updates: Vec<TokenIndexUpdate>,
    intermediate_flushes: usize,
}

impl std::fmt::Debug for BatchContext {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("BatchContext")
            .field("id_updates", &self.id_updates.0.len())
            .field("index_updates", &self.index_updates.len())
            .field("token_updates", &self.token_updates.len())
            .finish()
    }
}

impl BatchContext {
    /// Context flushing into `sinks`. A `flush_limit` above zero flushes
    /// index updates early once that many are buffered.
    pub fn new(sinks: BatchSinks, flush_limit: usize) -> Self {
        Self {
            sinks: Some(sinks),
            flush_limit,
            id_updates: IdUpdates::default(),
            index_updates: Vec::new(),
            token_updates: Vec::new(),
            intermediate_flushes: 0,
        }
    }

    /// Context that only buffers; closing it drops the buffered work.
    pub fn detached() -> Self {
        Self {
            sinks: None,
            flush_limit: 0,
            id_updates: IdUpdates::default(),
            index_updates: Vec::new(),
            token_updates: Vec::new(),
            intermediate_flushes: 0,
        }
    }

    /// Adds id updates of a closed transaction.
    pub fn add_id_updates(&mut self, updates: IdUpdates) {
        self.id_updates.0.extend(updates.0);
    }

    /// Adds derived index and token index updates.
    pub fn add_updates(&mut self, updates: DerivedUpdates) -> Result<()> {
        self.index_updates.extend(updates.index);
        self.token_updates.extend(updates.tokens);
        if self.flush_limit > 0 && self.index_updates.len() >= self.flush_limit {
            self.flush_index_updates()?;
        }
        Ok(())
    }

    /// Buffered id updates.
    pub fn id_updates(&self) -> &IdUpdates {
        &self.id_updates
    }

    /// Buffered index entry updates.
    pub fn index_updates(&self) -> &[IndexEntryUpdate] {
        &self.index_updates
    }

    /// Buffered token index updates.
    pub fn token_updates(&self) -> &[TokenIndexUpdate] {
        &self.token_updates
    }

    /// Number of flushes forced before the end of the batch.
    pub fn intermediate_flushes(&self) -> usize {
        self.intermediate_flushes
    }

    /// Applies the buffered index and token index updates now and waits for
    /// them. Schema commands flush before reaching the index listener.
    pub fn flush_index_updates(&mut self) -> Result<()> {
        if self.index_updates.is_empty() && self.token_updates.is_empty() {
            return Ok(());
        }
        self.intermediate_flushes += 1;
        debug!(
            index = self.index_updates.len(),
            tokens = self.token_updates.len(),
            "derive.index.flush"
        );
        let index = std::mem::take(&mut self.index_updates);
        let tokens = std::mem::take(&mut self.token_updates);
        let Some(sinks) = &self.sinks else {
            return Ok(());
        };
        let index = sinks.indexes.apply_async(IndexUpdatesWork(index));
        let tokens = sinks.tokens.apply_async(TokenUpdatesWork(tokens));
        first_failure([index.await_done(), tokens.await_done()])
    }

    /// Submits every buffered unit of work and waits for all of them.
    pub fn close(self) -> Result<()> {
        let Some(sinks) = self.sinks else {
            return Ok(());
        };
        debug!(
            ids = self.id_updates.0.len(),
            index = self.index_updates.len(),
            tokens = self.token_updates.len(),
            "apply.batch.flush"
        );
        let mut pending = Vec::with_capacity(3);
        if !self.id_updates.is_empty() {
            pending.push(Pending::Ids(sinks.ids.apply_async(self.id_updates)));
        }
        if !self.index_updates.is_empty() {
            pending.push(Pending::Indexes(
                sinks.indexes.apply_async(IndexUpdatesWork(self.index_updates)),
            ));
        }
        if !self.token_updates.is_empty() {
            pending.push(Pending::Tokens(
                sinks.tokens.apply_async(TokenUpdatesWork(self.token_updates)),
            ));
        }
        first_failure(pending.into_iter().map(Pending::await_done))
    }
}

enum Pending {
    Ids(crate::apply::worksync::AsyncApply<IdGenerators, IdUpdates>),
    Indexes(crate::apply::worksync::AsyncApply<dyn IndexUpdateListener, IndexUpdatesWork>),
    Tokens(crate::apply::worksync::AsyncApply<dyn TokenIndexListener, TokenUpdatesWork>),
}

impl Pending {
    fn await_done(self) -> Result<()> {
        match self {
            Pending::Ids(handle) => handle.await_done(),
            Pending::Indexes(handle) => handle.await_done(),
            Pending::Tokens(handle) => handle.await_done(),
        }
    }
}
