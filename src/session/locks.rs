//! Per-session mutual exclusion
//!
//! Turns for one session run strictly one after another; the guard is
//! owned, so it is released on every exit path including cancellation.

use std::collections::HashMap;
use std::sync::{Arc, Mutex as StdMutex};
use tokio::sync::{Mutex, OwnedMutexGuard};

const CLEANUP_THRESHOLD: usize = 1024;

#[derive(Default)]
pub struct SessionLocks {
    locks: StdMutex<HashMap<String, Arc<Mutex<()>>>>,
}

impl SessionLocks {
    pub fn new() -> Self {
        Self::default()
    }

    fn slot(&self, session_id: &str) -> Arc<Mutex<()>> {
        let mut locks = self
            .locks
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner());

        if locks.len() >= CLEANUP_THRESHOLD {
            // only the map holds an unused lock
            locks.retain(|_, lock| Arc::strong_count(lock) > 1);
        }

        Arc::clone(locks.entry(session_id.to_string()).or_default())
    }

    pub async fn acquire(&self, session_id: &str) -> OwnedMutexGuard<()> {
        self.slot(session_id).lock_owned().await
    }

    pub fn forget(&self, session_id: &str) {
        let mut locks = self
            .locks
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner());
        if let Some(lock) = locks.get(session_id) {
            if Arc::strong_count(lock) == 1 {
                locks.remove(session_id);
            }
        }
    }

    pub fn len(&self) -> usize {
        self.locks
            .lock()
            .map(|l| l.len())
            .unwrap_or_else(|poisoned| poisoned.into_inner().len())
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}
