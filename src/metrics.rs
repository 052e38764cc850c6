//! Engine metrics hooks.

use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;

/// Trait for tracking commit and apply activity of the engine. The engine
/// calls these hooks on its hot paths, so implementations must be cheap.
pub trait EngineMetrics: Send + Sync {
    /// Records a transaction whose commands were created and applied.
    fn transaction_committed(&self);

    /// Records a transaction rolled back without applying anything.
    fn transaction_rolled_back(&self);

    /// Records an applied batch of `transactions`.
    fn batch_applied(&self, transactions: usize);

    /// Records a batch that failed and panicked the engine.
    fn batch_failed(&self);

    /// Records a sparse node converted to relationship groups.
    fn dense_conversion(&self);
}

/// Discards everything.
#[derive(Default)]
pub struct NoopMetrics;

impl EngineMetrics for NoopMetrics {
    fn transaction_committed(&self) {}
    fn transaction_rolled_back(&self) {}
    fn batch_applied(&self, _transactions: usize) {}
    fn batch_failed(&self) {}
    fn dense_conversion(&self) {}
}

/// Atomic counters.
#[derive(Default)]
pub struct CounterMetrics {
    /// Committed transactions.
    pub transactions_committed: AtomicU64,
    /// Rolled back transactions.
    pub transactions_rolled_back: AtomicU64,
    /// Transactions applied across all batches.
    pub transactions_applied: AtomicU64,
    /// Failed batches.
    pub batches_failed: AtomicU64,
    /// Sparse to dense conversions.
    pub dense_conversions: AtomicU64,
}

impl EngineMetrics for CounterMetrics {
    fn transaction_committed(&self) {
        self.transactions_committed.fetch_add(1, Ordering::Relaxed);
    }

    fn transaction_rolled_back(&self) {
        self.transactions_rolled_back.fetch_add(1, Ordering::Relaxed);
    }

    fn batch_applied(&self, transactions: usize) {
        self.transactions_applied
            .fetch_add(transactions as u64, Ordering::Relaxed);
    }

    fn batch_failed(&self) {
        self.batches_failed.fetch_add(1, Ordering::Relaxed);
    }

    fn dense_conversion(&self) {
        self.dense_conversions.fetch_add(1, Ordering::Relaxed);
    }
}

/// The default metrics implementation, [`NoopMetrics`].
pub fn default_metrics() -> Arc<dyn EngineMetrics> {
    Arc::new(NoopMetrics)
}
