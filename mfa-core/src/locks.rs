//! Per-user mutation guards
//!
//! Every operation that touches a user's methods or challenges holds that
//! user's guard for its whole read-check-commit sequence. Different users map
//! to different mutexes and never contend.

use std::collections::HashMap;
use std::sync::{Arc, Mutex};
use tokio::sync::{Mutex as AsyncMutex, OwnedMutexGuard};

/// Guard held while mutating one user's MFA state
pub type UserGuard = OwnedMutexGuard<()>;

/// Table of async mutexes keyed by user id
#[derive(Debug, Default)]
pub struct UserLocks {
    locks: Mutex<HashMap<String, Arc<AsyncMutex<()>>>>,
}

impl UserLocks {
    pub fn new() -> Self {
        Self::default()
    }

    /// Wait for and take the guard for `user_id`
    pub async fn lock(&self, user_id: &str) -> UserGuard {
        let mutex = {
            let mut locks = self.locks.lock().unwrap_or_else(|e| e.into_inner());
            // Entries nobody holds or waits on can go
            locks.retain(|key, m| key == user_id || Arc::strong_count(m) > 1);
            locks
                .entry(user_id.to_string())
                .or_insert_with(|| Arc::new(AsyncMutex::new(())))
                .clone()
        };
        mutex.lock_owned().await
    }

    /// Number of users with a live lock entry
    pub fn len(&self) -> usize {
        self.locks.lock().unwrap_or_else(|e| e.into_inner()).len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}
