use std::collections::HashMap;
use std::sync::{Arc, Mutex, PoisonError};

use tokio::sync::OwnedMutexGuard;

/// A session's mutex and how many callers hold or wait on it
#[derive(Default)]
struct Slot {
    mutex: Arc<tokio::sync::Mutex<()>>,
    users: usize,
}

type LockMap = HashMap<String, Slot>;

/// One async mutex per session id
///
/// Serializes everything that reads and rewrites a session's history: the
/// chat turn, its persistence and the compression that follows it. Entries
/// are dropped again once nobody holds or waits on them.
#[derive(Clone, Default)]
pub struct SessionLocks {
    map: Arc<Mutex<LockMap>>,
}

/// Registration of one caller in the lock map
///
/// Dropping it, whether after the lock was held or while still waiting,
/// unregisters the caller and removes the entry once it has no users.
struct Lease {
    map: Arc<Mutex<LockMap>>,
    session_id: String,
}

impl Drop for Lease {
    fn drop(&mut self) {
        let mut map = self.map.lock().unwrap_or_else(PoisonError::into_inner);
        if let Some(slot) = map.get_mut(&self.session_id) {
            slot.users = slot.users.saturating_sub(1);
            if slot.users == 0 {
                map.remove(&self.session_id);
            }
        }
    }
}

/// Held lock on one session, released on drop
pub struct SessionGuard {
    _guard: OwnedMutexGuard<()>,
    _lease: Lease,
}

impl SessionLocks {
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Wait for exclusive access to `session_id`
    pub async fn acquire(&self, session_id: &str) -> SessionGuard {
        let (mutex, lease) = {
            let mut map = self.map.lock().unwrap_or_else(PoisonError::into_inner);
            let slot = map.entry(session_id.to_string()).or_default();
            slot.users += 1;
            (
                Arc::clone(&slot.mutex),
                Lease {
                    map: Arc::clone(&self.map),
                    session_id: session_id.to_string(),
                },
            )
        };

        SessionGuard {
            _guard: mutex.lock_owned().await,
            _lease: lease,
        }
    }

    /// Number of sessions currently locked or waited on
    #[must_use]
    pub fn active(&self) -> usize {
        self.map.lock().unwrap_or_else(PoisonError::into_inner).len()
    }
}
