//! Keyed async mutexes.
//!
//! Mutations on one memory id (and whole `add` calls on one scope) are
//! serialised through a [`KeyedLocks`] table shared by every request on a
//! service instance.

use std::collections::HashMap;
use std::sync::{Arc, Mutex};

use tokio::sync::{Mutex as AsyncMutex, OwnedMutexGuard};

#[derive(Debug, Default)]
pub struct KeyedLocks {
    slots: Mutex<HashMap<String, Arc<AsyncMutex<()>>>>,
}

impl KeyedLocks {
    pub fn new() -> Self {
        Self::default()
    }

    /// Wait for exclusive access to `key`.
    pub async fn lock(&self, key: &str) -> OwnedMutexGuard<()> {
        let slot = {
            let mut slots = self.slots.lock().unwrap_or_else(|poisoned| poisoned.into_inner());
            // Slots nobody holds or waits on are only referenced by the table.
            slots.retain(|_, slot| Arc::strong_count(slot) > 1);
            slots.entry(key.to_string()).or_default().clone()
        };
        slot.lock_owned().await
    }

    /// Number of keys currently tracked.
    pub fn tracked(&self) -> usize {
        self.slots
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner())
            .len()
    }
}
