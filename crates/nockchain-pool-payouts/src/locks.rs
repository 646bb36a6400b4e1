use std::collections::HashMap;
use std::sync::{Arc, Mutex, MutexGuard};

use tokio::sync::{Mutex as AsyncMutex, OwnedMutexGuard};

use crate::database::UserId;

/// One async mutex per user, created on first use and dropped once nobody holds or waits on it.
///
/// Holding a user's guard serializes read-modify-write sequences for that user while leaving
/// other users free to proceed.
#[derive(Debug, Default)]
pub struct UserLocks {
    locks: Mutex<HashMap<UserId, Arc<AsyncMutex<()>>>>,
}

/// Releases the user's lock on drop.
pub struct UserGuard<'a> {
    guard: Option<OwnedMutexGuard<()>>,
    user_id: UserId,
    locks: &'a UserLocks,
}

impl Drop for UserGuard<'_> {
    fn drop(&mut self) {
        self.guard.take();
        let mut locks = self.locks.map();
        // Only the map's own reference left: no holder, no waiter
        if locks.get(&self.user_id).is_some_and(|l| Arc::strong_count(l) == 1) {
            locks.remove(&self.user_id);
        }
    }
}

impl UserLocks {
    pub fn new() -> Self {
        Self::default()
    }

    // Poisoning only means another thread panicked mid-insert; the map itself is intact
    fn map(&self) -> MutexGuard<'_, HashMap<UserId, Arc<AsyncMutex<()>>>> {
        self.locks.lock().unwrap_or_else(|e| e.into_inner())
    }

    pub async fn lock(&self, user_id: UserId) -> UserGuard<'_> {
        let lock = self.map().entry(user_id).or_default().clone();
        UserGuard { guard: Some(lock.lock_owned().await), user_id, locks: self }
    }

    pub fn len(&self) -> usize {
        self.map().len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}
