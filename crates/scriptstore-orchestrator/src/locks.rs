use std::sync::Arc;

use dashmap::DashMap;
use scriptstore_core::Identity;
use tokio::sync::{Mutex, OwnedMutexGuard};

/// One async mutex per identity.
///
/// Held for the whole of an execution or a deployment, so a scheduled run
/// and an on-demand run of the same script never overlap, and a run never
/// sees a half-swapped artifact directory.
#[derive(Default)]
pub struct IdentityLocks {
    locks: DashMap<Identity, Arc<Mutex<()>>>,
}

impl IdentityLocks {
    pub fn new() -> Self {
        Self::default()
    }

    /// Wait for exclusive access to `identity`. Released when the guard drops.
    ///
    /// Entries nobody holds or waits on are dropped first, so the map only
    /// tracks identities currently in use.
    pub async fn acquire(&self, identity: &Identity) -> OwnedMutexGuard<()> {
        self.locks.retain(|_, lock| Arc::strong_count(lock) > 1);
        let lock = self
            .locks
            .entry(identity.clone())
            .or_default()
            .clone();
        lock.lock_owned().await
    }

    pub fn is_locked(&self, identity: &Identity) -> bool {
        self.locks
            .get(identity)
            .is_some_and(|lock| lock.try_lock().is_err())
    }

    #[cfg(test)]
    fn tracked(&self) -> usize {
        self.locks.len()
    }
}
