use crate::core::Result;
use std::collections::HashMap;
use std::sync::{Arc, Mutex};
use tokio::sync::{Mutex as AsyncMutex, OwnedMutexGuard};

type LockKey = (String, String);

/// Per-(dataset, key) async locks, created on demand and dropped when idle.
#[derive(Default)]
pub struct KeyLocks {
    locks: Mutex<HashMap<LockKey, Arc<AsyncMutex<()>>>>,
}

impl KeyLocks {
    pub fn new() -> Self {
        Self::default()
    }

    pub async fn acquire(&self, dataset: &str, key: &str) -> Result<KeyGuard<'_>> {
        let lock_key = (dataset.to_string(), key.to_string());
        let lock = {
            let mut locks = self.locks.lock()?;
            locks
                .entry(lock_key.clone())
                .or_insert_with(|| Arc::new(AsyncMutex::new(())))
                .clone()
        };
        let mut waiting = Waiting {
            owner: self,
            lock_key: &lock_key,
            armed: true,
        };
        let guard = lock.lock_owned().await;
        waiting.armed = false;
        drop(waiting);

        Ok(KeyGuard {
            owner: self,
            lock_key,
            guard: Some(guard),
        })
    }

    /// Number of keys with a live lock entry.
    pub fn active(&self) -> usize {
        self.locks.lock().map(|locks| locks.len()).unwrap_or_default()
    }

    fn release(&self, lock_key: &LockKey) {
        let Ok(mut locks) = self.locks.lock() else {
            return;
        };
        // The map holds one reference; any other means a waiter is queued.
        if locks
            .get(lock_key)
            .is_some_and(|lock| Arc::strong_count(lock) == 1)
        {
            locks.remove(lock_key);
        }
    }
}

/// Prunes the entry if an `acquire` is cancelled while queued.
struct Waiting<'a> {
    owner: &'a KeyLocks,
    lock_key: &'a LockKey,
    armed: bool,
}

impl Drop for Waiting<'_> {
    fn drop(&mut self) {
        if self.armed {
            self.owner.release(self.lock_key);
        }
    }
}

pub struct KeyGuard<'a> {
    owner: &'a KeyLocks,
    lock_key: LockKey,
    guard: Option<OwnedMutexGuard<()>>,
}

impl Drop for KeyGuard<'_> {
    fn drop(&mut self) {
        // Drop the owned guard first so its Arc no longer counts.
        self.guard.take();
        self.owner.release(&self.lock_key);
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn test_entries_are_dropped_when_idle() {
        let locks = KeyLocks::new();
        {
            let _guard = locks.acquire("balances", "1").await.unwrap();
            assert_eq!(locks.active(), 1);
        }
        assert_eq!(locks.active(), 0);
    }

    #[tokio::test]
    async fn test_cancelled_waiter_does_not_leave_entry() {
        let locks = KeyLocks::new();
        let holder = locks.acquire("balances", "1").await.unwrap();

        let mut waiter = tokio_test::task::spawn(locks.acquire("balances", "1"));
        assert!(waiter.poll().is_pending());

        drop(holder);
        assert_eq!(locks.active(), 1);

        drop(waiter);
        assert_eq!(locks.active(), 0);
    }

    #[tokio::test]
    async fn test_distinct_keys_do_not_block() {
        let locks = KeyLocks::new();
        let _a = locks.acquire("balances", "1").await.unwrap();
        let _b = locks.acquire("balances", "2").await.unwrap();
        let _c = locks.acquire("bank", "1").await.unwrap();
        assert_eq!(locks.active(), 3);
    }
}
