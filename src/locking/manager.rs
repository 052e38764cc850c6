use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;

use parking_lot::{Condvar, Mutex};
use rustc_hash::FxHashMap;
use serde::Serialize;
use tracing::trace;

use super::{LockClient, LockManager, LockMode, ResourceType};
use crate::types::Result;

type LockKey = (ResourceType, u64);

#[derive(Debug, Default)]
struct LockEntry {
    shared: FxHashMap<u64, u32>,
    exclusive: Option<(u64, u32)>,
}

impl LockEntry {
    fn can_share(&self, client: u64) -> bool {
        self.exclusive.map(|(owner, _)| owner == client).unwrap_or(true)
    }

    fn can_exclude(&self, client: u64) -> bool {
        self.can_share(client) && self.shared.keys().all(|holder| *holder == client)
    }

    fn is_free(&self) -> bool {
        self.shared.is_empty() && self.exclusive.is_none()
    }
}

#[derive(Default)]
struct TableState {
    locks: FxHashMap<LockKey, LockEntry>,
}

struct TableInner {
    state: Mutex<TableState>,
    released: Condvar,
    next_client: AtomicU64,
}

/// Snapshot of lock table occupancy for observability.
#[derive(Default, Debug, Clone, Copy, Serialize)]
pub struct LockTableSnapshot {
    /// Resources with at least one holder.
    pub locked_resources: usize,
    /// Resources held exclusively.
    pub exclusive: usize,
}

/// In-process lock table shared by every transaction of an engine.
#[derive(Clone)]
pub struct LockTable {
    inner: Arc<TableInner>,
}

impl Default for LockTable {
    fn default() -> Self {
        Self::new()
    }
}

impl std::fmt::Debug for LockTable {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("LockTable")
            .field("snapshot", &self.snapshot())
            .finish()
    }
}

impl LockTable {
    /// An empty table.
    pub fn new() -> Self {
        Self {
            inner: Arc::new(TableInner {
                state: Mutex::new(TableState::default()),
                released: Condvar::new(),
                next_client: AtomicU64::new(1),
            }),
        }
    }

    /// A client of this table.
    pub fn client(&self) -> LockClientHandle {
        LockClientHandle {
            id: self.inner.next_client.fetch_add(1, Ordering::Relaxed),
            inner: Arc::clone(&self.inner),
        }
    }

    /// Current occupancy.
    pub fn snapshot(&self) -> LockTableSnapshot {
        let state = self.inner.state.lock();
        LockTableSnapshot {
            locked_resources: state.locks.len(),
            exclusive: state
                .locks
                .values()
                .filter(|entry| entry.exclusive.is_some())
                .count(),
        }
    }
}

impl LockManager for LockTable {
    fn new_client(&self) -> Arc<dyn LockClient> {
        Arc::new(self.client())
    }
}

/// Lock client bound to a [`LockTable`].
pub struct LockClientHandle {
    id: u64,
    inner: Arc<TableInner>,
}

impl std::fmt::Debug for LockClientHandle {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("LockClientHandle").field("id", &self.id).finish()
    }
}

impl LockClientHandle {
    fn acquire(&self, resource: ResourceType, id: u64, mode: LockMode) {
        let key = (resource, id);
        let mut state = self.inner.state.lock();
        loop {
            let entry = state.locks.entry(key).or_default();
            let grantable = match mode {
                LockMode::Shared => entry.can_share(self.id),
                LockMode::Exclusive => entry.can_exclude(self.id),
            };
            if grantable {
                grant(entry, self.id, mode);
                trace!(client = self.id, ?resource, id, ?mode, "locks.acquire");
                return;
            }
            trace!(client = self.id, ?resource, id, ?mode, "locks.wait");
            self.inner.released.wait(&mut state);
        }
    }

    fn release(&self, resource: ResourceType, id: u64, mode: LockMode) {
        let key = (resource, id);
        let mut state = self.inner.state.lock();
        let Some(entry) = state.locks.get_mut(&key) else {
            return;
        };
        match mode {
            LockMode::Shared => {
                if let Some(count) = entry.shared.get_mut(&self.id) {
                    *count -= 1;
                    if *count == 0 {
                        entry.shared.remove(&self.id);
                    }
                }
            }
            LockMode::Exclusive => {
                if let Some((owner, count)) = entry.exclusive.as_mut() {
                    if *owner == self.id {
                        *count -= 1;
                        if *count == 0 {
                            entry.exclusive = None;
                        }
                    }
                }
            }
        }
        if entry.is_free() {
            state.locks.remove(&key);
        }
        drop(state);
        self.inner.released.notify_all();
    }
}

fn grant(entry: &mut LockEntry, client: u64, mode: LockMode) {
    match mode {
        LockMode::Shared => *entry.shared.entry(client).or_insert(0) += 1,
        LockMode::Exclusive => match entry.exclusive.as_mut() {
            Some((_, count)) => *count += 1,
            None => entry.exclusive = Some((client, 1)),
        },
    }
}

impl LockClient for LockClientHandle {
    fn client_id(&self) -> u64 {
        self.id
    }

    fn acquire_shared(&self, resource: ResourceType, ids: &[u64]) -> Result<()> {
        for id in ids {
            self.acquire(resource, *id, LockMode::Shared);
        }
        Ok(())
    }

    fn acquire_exclusive(&self, resource: ResourceType, ids: &[u64]) -> Result<()> {
        for id in ids {
            self.acquire(resource, *id, LockMode::Exclusive);
        }
        Ok(())
    }

    fn try_exclusive(&self, resource: ResourceType, id: u64) -> Result<bool> {
        let mut state = self.inner.state.lock();
        let entry = state.locks.entry((resource, id)).or_default();
        if entry.can_exclude(self.id) {
            grant(entry, self.id, LockMode::Exclusive);
            trace!(client = self.id, ?resource, id, "locks.try.acquired");
            return Ok(true);
        }
        if entry.is_free() {
            state.locks.remove(&(resource, id));
        }
        Ok(false)
    }

    fn release_shared(&self, resource: ResourceType, id: u64) {
        self.release(resource, id, LockMode::Shared);
    }

    fn release_exclusive(&self, resource: ResourceType, id: u64) {
        self.release(resource, id, LockMode::Exclusive);
    }

    fn holds(&self, resource: ResourceType, id: u64, mode: LockMode) -> bool {
        let state = self.inner.state.lock();
        let Some(entry) = state.locks.get(&(resource, id)) else {
            return false;
        };
        let exclusive = entry
            .exclusive
            .map(|(owner, _)| owner == self.id)
            .unwrap_or(false);
        match mode {
            LockMode::Exclusive => exclusive,
            LockMode::Shared => exclusive || entry.shared.contains_key(&self.id),
        }
    }

    fn release_all(&self) {
        let mut state = self.inner.state.lock();
        state.locks.retain(|_, entry| {
            entry.shared.remove(&self.id);
            if entry.exclusive.map(|(owner, _)| owner == self.id).unwrap_or(false) {
                entry.exclusive = None;
            }
            !entry.is_free()
        });
        drop(state);
        trace!(client = self.id, "locks.release_all");
        self.inner.released.notify_all();
    }
}

impl Drop for LockClientHandle {
    fn drop(&mut self) {
        self.release_all();
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::mpsc;
    use std::thread;
    use std::time::Duration;

    #[test]
    fn shared_holders_coexist() -> Result<()> {
        let table = LockTable::new();
        let a = table.client();
        let b = table.client();
        a.acquire_shared(ResourceType::Node, &[1])?;
        b.acquire_shared(ResourceType::Node, &[1])?;
        assert!(a.holds(ResourceType::Node, 1, LockMode::Shared));
        assert!(!a.holds(ResourceType::Node, 1, LockMode::Exclusive));
        assert!(!b.try_exclusive(ResourceType::Node, 1)?);
        Ok(())
    }

    #[test]
    fn sole_shared_holder_upgrades() -> Result<()> {
        let table = LockTable::new();
        let a = table.client();
        a.acquire_shared(ResourceType::NodeGroupDelete, &[4])?;
        assert!(a.try_exclusive(ResourceType::NodeGroupDelete, 4)?);
        assert!(a.holds(ResourceType::NodeGroupDelete, 4, LockMode::Exclusive));
        a.release_exclusive(ResourceType::NodeGroupDelete, 4);
        assert!(a.holds(ResourceType::NodeGroupDelete, 4, LockMode::Shared));
        Ok(())
    }

    #[test]
    fn exclusive_is_reentrant_and_counted() -> Result<()> {
        let table = LockTable::new();
        let a = table.client();
        a.acquire_exclusive(ResourceType::Relationship, &[9])?;
        a.acquire_exclusive(ResourceType::Relationship, &[9])?;
        a.release_exclusive(ResourceType::Relationship, 9);
        assert!(a.holds(ResourceType::Relationship, 9, LockMode::Exclusive));
        a.release_exclusive(ResourceType::Relationship, 9);
        assert_eq!(table.snapshot().locked_resources, 0);
        Ok(())
    }

    #[test]
    fn waiter_proceeds_after_release() -> Result<()> {
        let table = LockTable::new();
        let a = table.client();
        a.acquire_exclusive(ResourceType::Node, &[1])?;
        let (tx, rx) = mpsc::channel();
        let other = table.clone();
        let handle = thread::spawn(move || -> Result<()> {
            let b = other.client();
            b.acquire_exclusive(ResourceType::Node, &[1])?;
            tx.send(()).ok();
            Ok(())
        });
        assert!(rx.recv_timeout(Duration::from_millis(50)).is_err());
        a.release_all();
        assert!(rx.recv_timeout(Duration::from_secs(5)).is_ok());
        handle.join().ok();
        Ok(())
    }

    #[test]
    fn dropping_client_releases_locks() -> Result<()> {
        let table = LockTable::new();
        {
            let a = table.client();
            a.acquire_exclusive(ResourceType::Degrees, &[2, 3])?;
            assert_eq!(table.snapshot().exclusive, 2);
        }
        assert_eq!(table.snapshot().locked_resources, 0);
        Ok(())
    }
}
