//! Work-combining dispatcher.
//!
//! Threads submit units of work aimed at one shared target. Whoever awaits
//! first while no flush is running drains every pending unit, combines them
//! into one and applies it; the others block until their ticket is covered.
//! Submitting never blocks.

use std::sync::Arc;

use parking_lot::{Condvar, Mutex};
use tracing::{debug, warn};

use crate::types::{CoreError, Result};

/// A unit of work that can be merged with others aimed at the same target.
pub trait Work<M: ?Sized>: Send + Sized {
    /// Folds `other` into `self`.
    fn combine(&mut self, other: Self);
    /// Applies the combined work to `target`.
    fn apply(self, target: &M) -> Result<()>;
}

/// A failed flush covering tickets `lo..=hi`, kept until each of them has
/// collected the error.
struct FailedFlush {
    lo: u64,
    hi: u64,
    unclaimed: u64,
    error: CoreError,
}

struct SyncState<W> {
    pending: Vec<W>,
    next_ticket: u64,
    taken: u64,
    completed: u64,
    applying: bool,
    failures: Vec<FailedFlush>,
}

/// Serializes and coalesces work against a single target.
pub struct WorkSync<M: ?Sized, W> {
    name: &'static str,
    target: Arc<M>,
    state: Mutex<SyncState<W>>,
    done: Condvar,
}

impl<M: ?Sized, W> std::fmt::Debug for WorkSync<M, W> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("WorkSync").field("name", &self.name).finish()
    }
}

/// Handle to submitted work; [`AsyncApply::await_done`] blocks until it is
/// applied. Dropping an unawaited handle waits as well and logs a failure.
#[must_use = "work is only guaranteed to be applied once awaited"]
pub struct AsyncApply<M: ?Sized + Send + Sync, W: Work<M>> {
    sync: Arc<WorkSync<M, W>>,
    ticket: Option<u64>,
}

impl<M: ?Sized + Send + Sync, W: Work<M>> WorkSync<M, W> {
    /// Creates a dispatcher applying to `target`.
    pub fn new(name: &'static str, target: Arc<M>) -> Arc<Self> {
        Arc::new(Self {
            name,
            target,
            state: Mutex::new(SyncState {
                pending: Vec::new(),
                next_ticket: 1,
                taken: 0,
                completed: 0,
                applying: false,
                failures: Vec::new(),
            }),
            done: Condvar::new(),
        })
    }

    /// The shared target.
    pub fn target(&self) -> &Arc<M> {
        &self.target
    }

    /// Enqueues `work` without blocking.
    pub fn apply_async(self: &Arc<Self>, work: W) -> AsyncApply<M, W> {
        let mut state = self.state.lock();
        let ticket = state.next_ticket;
        state.next_ticket += 1;
        state.pending.push(work);
        AsyncApply {
            sync: Arc::clone(self),
            ticket: Some(ticket),
        }
    }

    /// Enqueues `work` and waits for it to be applied.
    pub fn apply(self: &Arc<Self>, work: W) -> Result<()> {
        self.apply_async(work).await_done()
    }

    fn await_ticket(&self, ticket: u64) -> Result<()> {
        let mut state = self.state.lock();
        loop {
            if state.completed >= ticket {
                let Some(pos) = state
                    .failures
                    .iter()
                    .position(|f| f.lo <= ticket && ticket <= f.hi)
                else {
                    return Ok(());
                };
                let failure = &mut state.failures[pos];
                failure.unclaimed -= 1;
                let err = failure.error.duplicate();
                if failure.unclaimed == 0 {
                    state.failures.swap_remove(pos);
                }
                return Err(err);
            }
            if !state.applying && state.taken < ticket {
                let batch = std::mem::take(&mut state.pending);
                let lo = state.taken + 1;
                let hi = state.next_ticket - 1;
                state.taken = hi;
                state.applying = true;
                let outcome = parking_lot::MutexGuard::unlocked(&mut state, || {
                    self.apply_combined(batch)
                });
                state.applying = false;
                state.completed = hi;
                if let Err(err) = outcome {
                    warn!(sync = self.name, error = %err, lo, hi, "worksync.apply.failed");
                    state.failures.push(FailedFlush {
                        lo,
                        hi,
                        unclaimed: hi - lo + 1,
                        error: err,
                    });
                }
                self.done.notify_all();
                continue;
            }
            self.done.wait(&mut state);
        }
    }

    #[cfg(test)]
    fn retained_failures(&self) -> usize {
        self.state.lock().failures.len()
    }

    fn apply_combined(&self, batch: Vec<W>) -> Result<()> {
        let units = batch.len();
        let mut iter = batch.into_iter();
        let Some(mut combined) = iter.next() else {
            return Ok(());
        };
        for work in iter {
            combined.combine(work);
        }
        debug!(sync = self.name, units, "worksync.apply");
        combined
            .apply(&self.target)
            .map_err(|err| err.into_apply(0))
    }
}

impl<M: ?Sized + Send + Sync, W: Work<M>> AsyncApply<M, W> {
    /// Blocks until the submitted work has been applied, returning its outcome.
    pub fn await_done(mut self) -> Result<()> {
        match self.ticket.take() {
            Some(ticket) => self.sync.await_ticket(ticket),
            None => Ok(()),
        }
    }
}

impl<M: ?Sized + Send + Sync, W: Work<M>> Drop for AsyncApply<M, W> {
    fn drop(&mut self) {
        if let Some(ticket) = self.ticket.take() {
            if let Err(err) = self.sync.await_ticket(ticket) {
                warn!(sync = self.sync.name, ticket, error = %err, "worksync.dropped.failed");
            }
        }
    }
}

/// Outcome of several awaited handles, keeping the first failure.
pub fn first_failure(results: impl IntoIterator<Item = Result<()>>) -> Result<()> {
    let mut first: Option<CoreError> = None;
    for result in results {
        if let Err(err) = result {
            if first.is_none() {
                first = Some(err);
            }
        }
    }
    match first {
        Some(err) => Err(err),
        None => Ok(()),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::thread;

    #[derive(Default)]
    struct Sink {
        applied: Mutex<Vec<Vec<u32>>>,
    }

    struct Append(Vec<u32>);

    impl Work<Sink> for Append {
        fn combine(&mut self, other: Self) {
            self.0.extend(other.0);
        }

        fn apply(self, target: &Sink) -> Result<()> {
            if self.0.contains(&u32::MAX) {
                return Err(CoreError::Invalid("poisoned unit".into()));
            }
            target.applied.lock().push(self.0);
            Ok(())
        }
    }

    #[test]
    fn pending_units_combine_into_one_flush() -> Result<()> {
        let sync = WorkSync::new("test", Arc::new(Sink::default()));
        let a = sync.apply_async(Append(vec![1]));
        let b = sync.apply_async(Append(vec![2, 3]));
        b.await_done()?;
        a.await_done()?;
        let applied = sync.target().applied.lock();
        assert_eq!(applied.as_slice(), &[vec![1, 2, 3]]);
        Ok(())
    }

    #[test]
    fn failure_reaches_every_unit_of_the_flush() {
        let sync = WorkSync::new("test", Arc::new(Sink::default()));
        let a = sync.apply_async(Append(vec![1]));
        let b = sync.apply_async(Append(vec![u32::MAX]));
        assert!(matches!(a.await_done(), Err(CoreError::Apply { .. })));
        assert!(matches!(b.await_done(), Err(CoreError::Apply { .. })));
        assert_eq!(sync.retained_failures(), 0);
        assert!(sync.apply(Append(vec![4])).is_ok());
    }

    #[test]
    fn failures_are_released_once_every_ticket_collects() {
        let sync = WorkSync::new("test", Arc::new(Sink::default()));
        for _ in 0..20 {
            let a = sync.apply_async(Append(vec![u32::MAX]));
            let b = sync.apply_async(Append(vec![5]));
            assert!(b.await_done().is_err());
            assert_eq!(sync.retained_failures(), 1);
            drop(a);
            assert_eq!(sync.retained_failures(), 0);
        }
        assert!(sync.target().applied.lock().is_empty());
    }

    #[test]
    fn concurrent_submitters_all_land() {
        let sync = WorkSync::new("test", Arc::new(Sink::default()));
        let handles: Vec<_> = (0..8u32)
            .map(|t| {
                let sync = Arc::clone(&sync);
                thread::spawn(move || {
                    for i in 0..50u32 {
                        sync.apply(Append(vec![t * 100 + i])).unwrap();
                    }
                })
            })
            .collect();
        for handle in handles {
            handle.join().unwrap();
        }
        let total: usize = sync.target().applied.lock().iter().map(Vec::len).sum();
        assert_eq!(total, 400);
    }
}
