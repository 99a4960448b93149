//! Keyed async mutexes with reference-counted entries.
//!
//! Modifying operations serialize per path, and blob materialization and
//! unlinking serialize per digest, without any global writer lock. Entries
//! are created on first acquisition and garbage-collected when the last
//! holder (or waiter) goes away.
//!
//! Deadlock freedom rests on a global acquisition order: a digest lock is
//! never requested while a path lock is held. The PUT flow nests
//! digest → path; every unlink flow releases its path lock before touching
//! a digest lock.

use std::{
    collections::HashMap,
    sync::{Arc, Mutex as StdMutex},
};

use ft_core::{Digest, FilePath};
use tokio::sync::{Mutex, OwnedMutexGuard};

#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub enum LockKey {
    Path(FilePath),
    Digest(Digest),
}

#[derive(Debug)]
struct Entry {
    lock: Arc<Mutex<()>>,
    /// Acquirers that have registered interest, holding or waiting. The
    /// entry may only be dropped when this returns to zero.
    holders: usize,
}

type Registry = Arc<StdMutex<HashMap<LockKey, Entry>>>;

#[derive(Debug, Clone, Default)]
pub struct LockManager {
    registry: Registry,
}

impl LockManager {
    pub fn new() -> Self {
        Self::default()
    }

    /// Exclusive lock on `key`. The returned guard releases on drop and
    /// removes the registry entry once nobody holds or awaits it.
    pub async fn acquire(&self, key: LockKey) -> LockGuard {
        let lock = {
            let mut registry = self.registry.lock().unwrap();
            let entry = registry.entry(key.clone()).or_insert_with(|| Entry {
                lock: Arc::new(Mutex::new(())),
                holders: 0,
            });
            entry.holders += 1;
            entry.lock.clone()
        };

        let guard = lock.lock_owned().await;
        LockGuard {
            key: Some(key),
            registry: self.registry.clone(),
            _guard: guard,
        }
    }

    #[cfg(test)]
    fn entries(&self) -> usize {
        self.registry.lock().unwrap().len()
    }
}

#[derive(Debug)]
pub struct LockGuard {
    key: Option<LockKey>,
    registry: Registry,
    _guard: OwnedMutexGuard<()>,
}

impl Drop for LockGuard {
    fn drop(&mut self) {
        let Some(key) = self.key.take() else { return };
        let mut registry = self.registry.lock().unwrap();
        if let Some(entry) = registry.get_mut(&key) {
            entry.holders -= 1;
            if entry.holders == 0 {
                registry.remove(&key);
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::time::Duration;

    fn path_key(raw: &str) -> LockKey {
        LockKey::Path(FilePath::parse(raw).unwrap())
    }

    #[tokio::test]
    async fn same_key_excludes() {
        let locks = LockManager::new();
        let guard = locks.acquire(path_key("a")).await;

        let locks2 = locks.clone();
        let contender = tokio::spawn(async move {
            let _guard = locks2.acquire(path_key("a")).await;
        });

        tokio::time::sleep(Duration::from_millis(20)).await;
        assert!(!contender.is_finished(), "second acquire must wait");

        drop(guard);
        tokio::time::timeout(Duration::from_secs(1), contender)
            .await
            .expect("released lock unblocks waiter")
            .unwrap();
    }

    #[tokio::test]
    async fn distinct_keys_run_concurrently() {
        let locks = LockManager::new();
        let _a = locks.acquire(path_key("a")).await;
        let _b = locks.acquire(path_key("b")).await;
        let _d = locks
            .acquire(LockKey::Digest(Digest::of(b"payload")))
            .await;
        assert_eq!(locks.entries(), 3);
    }

    #[tokio::test]
    async fn path_and_digest_namespaces_are_disjoint() {
        let locks = LockManager::new();
        // A digest lock never contends with a path lock, whatever the
        // underlying bytes look like.
        let _p = locks.acquire(path_key("x")).await;
        let _d = locks.acquire(LockKey::Digest(Digest::of(b"x"))).await;
    }

    #[tokio::test]
    async fn entries_are_garbage_collected() {
        let locks = LockManager::new();
        {
            let _guard = locks.acquire(path_key("transient")).await;
            assert_eq!(locks.entries(), 1);
        }
        assert_eq!(locks.entries(), 0);
    }

    #[tokio::test]
    async fn waiter_keeps_entry_alive() {
        let locks = LockManager::new();
        let guard = locks.acquire(path_key("busy")).await;

        let locks2 = locks.clone();
        let waiter = tokio::spawn(async move {
            let _guard = locks2.acquire(path_key("busy")).await;
        });
        tokio::time::sleep(Duration::from_millis(20)).await;

        assert_eq!(locks.entries(), 1);
        drop(guard);
        waiter.await.unwrap();
        assert_eq!(locks.entries(), 0);
    }
}
