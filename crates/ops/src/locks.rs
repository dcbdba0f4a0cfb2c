//! Per-name update serialization within one process.

use std::collections::HashMap;
use std::sync::{Arc, Mutex};

use tokio::sync::{Mutex as AsyncMutex, OwnedMutexGuard};

type Slots = Arc<Mutex<HashMap<String, Arc<AsyncMutex<()>>>>>;

/// Keyed async locks. Entries exist only while someone holds or waits on them.
#[derive(Clone, Default)]
pub struct NameLocks {
    slots: Slots,
}

pub struct NameGuard {
    key: String,
    guard: Option<OwnedMutexGuard<()>>,
    slots: Slots,
}

impl NameLocks {
    pub fn new() -> Self { Self::default() }

    pub async fn acquire(&self, key: &str) -> NameGuard {
        let slot = {
            let mut slots = self.slots.lock().unwrap_or_else(|p| p.into_inner());
            slots.entry(key.to_string()).or_default().clone()
        };
        let guard = slot.lock_owned().await;
        NameGuard { key: key.to_string(), guard: Some(guard), slots: self.slots.clone() }
    }

    /// Number of keys currently held or awaited.
    pub fn active(&self) -> usize {
        self.slots.lock().unwrap_or_else(|p| p.into_inner()).len()
    }
}

impl Drop for NameGuard {
    fn drop(&mut self) {
        drop(self.guard.take());
        let mut slots = self.slots.lock().unwrap_or_else(|p| p.into_inner());
        // Only the map's own reference left: nobody holds or waits. Scanning every key also
        // drops slots whose last waiter was cancelled after the holder released.
        slots.retain(|_, s| Arc::strong_count(s) > 1);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::time::Duration;

    #[tokio::test(start_paused = true)]
    async fn same_key_is_serialized_other_keys_are_not() {
        let locks = NameLocks::new();
        let g1 = locks.acquire("Job/ns/x").await;
        let other = tokio::time::timeout(Duration::from_millis(10), locks.acquire("Job/ns/y")).await;
        assert!(other.is_ok());
        drop(other);

        let waiter = {
            let locks = locks.clone();
            tokio::spawn(async move { locks.acquire("Job/ns/x").await; })
        };
        tokio::time::sleep(Duration::from_millis(50)).await;
        assert!(!waiter.is_finished());
        drop(g1);
        tokio::time::timeout(Duration::from_secs(1), waiter).await.expect("waiter proceeds").expect("join");
        assert_eq!(locks.active(), 0);
    }

    #[tokio::test]
    async fn cancelled_waiter_slot_is_reclaimed_on_next_release() {
        let locks = NameLocks::new();
        let g1 = locks.acquire("Pod/ns/a").await;
        let waiter = {
            let locks = locks.clone();
            tokio::spawn(async move { locks.acquire("Pod/ns/a").await; })
        };
        tokio::task::yield_now().await;
        drop(g1);
        waiter.abort();
        let _ = waiter.await;

        drop(locks.acquire("Pod/ns/b").await);
        assert_eq!(locks.active(), 0);
    }
}
