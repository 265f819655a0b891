use std::collections::{HashMap, HashSet};
use std::sync::{Arc, LazyLock, Mutex, MutexGuard, PoisonError};

use tokio::sync::{Mutex as AsyncMutex, OwnedMutexGuard};
use tracing::trace;

use super::model::DeviceAddress;

static GLOBAL: LazyLock<Arc<LinkRegistry>> = LazyLock::new(|| Arc::new(LinkRegistry::default()));

/// Process-wide bookkeeping of which devices have a connect in flight or an
/// open session.
///
/// Connect attempts to one address are serialised through an async lock,
/// and an open session holds a lease that is released when dropped.
#[derive(Debug, Default)]
pub struct LinkRegistry {
    connect_locks: Mutex<HashMap<DeviceAddress, Arc<AsyncMutex<()>>>>,
    active_sessions: Mutex<HashSet<DeviceAddress>>,
}

impl LinkRegistry {
    /// Returns the registry shared by every manager in this process.
    #[must_use]
    pub fn global() -> Arc<Self> {
        Arc::clone(&GLOBAL)
    }

    /// Waits for exclusive connect rights to `address`.
    pub(crate) async fn lock_connect(&self, address: &DeviceAddress) -> ConnectGuard {
        let lock = {
            let mut locks = lock_ignoring_poison(&self.connect_locks);
            Arc::clone(locks.entry(address.clone()).or_default())
        };
        let guard = lock.lock_owned().await;
        trace!(%address, "connect lock acquired");
        ConnectGuard { _guard: guard }
    }

    /// Claims the single session slot for `address`.
    ///
    /// Returns `None` when a session for the address is already open.
    pub(crate) fn claim_session(self: &Arc<Self>, address: &DeviceAddress) -> Option<SessionLease> {
        let inserted = lock_ignoring_poison(&self.active_sessions).insert(address.clone());
        inserted.then(|| SessionLease {
            registry: Arc::clone(self),
            address: address.clone(),
        })
    }

    /// Returns whether a session for `address` is currently open.
    #[must_use]
    pub fn has_session(&self, address: &DeviceAddress) -> bool {
        lock_ignoring_poison(&self.active_sessions).contains(address)
    }

    fn release(&self, address: &DeviceAddress) {
        lock_ignoring_poison(&self.active_sessions).remove(address);
        trace!(%address, "session lease released");
    }
}

fn lock_ignoring_poison<T>(mutex: &Mutex<T>) -> MutexGuard<'_, T> {
    mutex.lock().unwrap_or_else(PoisonError::into_inner)
}

/// Held while a connect attempt for one address is in flight.
#[derive(Debug)]
pub(crate) struct ConnectGuard {
    _guard: OwnedMutexGuard<()>,
}

/// Exclusive claim on the open session for one address.
#[derive(Debug)]
pub(crate) struct SessionLease {
    registry: Arc<LinkRegistry>,
    address: DeviceAddress,
}

impl Drop for SessionLease {
    fn drop(&mut self) {
        self.registry.release(&self.address);
    }
}
