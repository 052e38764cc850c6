use std::sync::Arc;

use tracing::debug;

use crate::apply::command::RecordCommand;
use crate::apply::TransactionApplier;
use crate::storage::record::{TokenKind, TokenRecord};
use crate::storage::store::Stores;
use crate::tokens::TokenHolders;
use crate::types::Result;

/// Teaches the token holders about tokens created elsewhere. Internal
/// commits register their own tokens once applied, so this stage only runs
/// for external and recovered batches.
pub struct CacheInvalidationApplier {
    stores: Stores,
    tokens: Arc<TokenHolders>,
    registered: usize,
}

impl CacheInvalidationApplier {
    /// Applier updating `tokens`.
    pub fn new(stores: Stores, tokens: Arc<TokenHolders>) -> Self {
        Self {
            stores,
            tokens,
            registered: 0,
        }
    }
}

impl TransactionApplier for CacheInvalidationApplier {
    fn name(&self) -> &'static str {
        "cache_invalidation"
    }

    fn visit_token(&mut self, kind: TokenKind, command: &RecordCommand<TokenRecord>) -> Result<()> {
        self.tokens
            .apply_command(kind, command, &**self.stores.tokens(kind))?;
        self.registered += 1;
        Ok(())
    }

    fn close(&mut self, _batch: &mut crate::apply::BatchContext) -> Result<()> {
        if self.registered > 0 {
            debug!(tokens = self.registered, "apply.tokens.registered");
            self.registered = 0;
        }
        Ok(())
    }
}
