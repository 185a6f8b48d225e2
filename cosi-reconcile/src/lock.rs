//! Registry of per-identity mutexes.
//!
//! Entries are reference counted through the guards handed out by
//! [`LockRegistry::lock`]; the last guard for an identity removes its entry
//! so the map only holds identities with an operation in flight or waiting.

use std::collections::HashMap;
use std::hash::Hash;
use std::sync::{Arc, Mutex, MutexGuard};

use tokio::sync::{Mutex as AsyncMutex, OwnedMutexGuard};

type Entries<T> = Mutex<HashMap<T, Arc<AsyncMutex<()>>>>;

pub struct LockRegistry<T> {
    entries: Arc<Entries<T>>,
}

impl<T> Clone for LockRegistry<T> {
    fn clone(&self) -> Self {
        Self {
            entries: self.entries.clone(),
        }
    }
}

impl<T> Default for LockRegistry<T>
where
    T: Hash + Eq + Clone,
{
    fn default() -> Self {
        Self {
            entries: Arc::new(Mutex::new(HashMap::new())),
        }
    }
}

impl<T> LockRegistry<T>
where
    T: Hash + Eq + Clone,
{
    fn entries(&self) -> MutexGuard<'_, HashMap<T, Arc<AsyncMutex<()>>>> {
        self.entries
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner())
    }

    /// Waits until no other operation holds `key`.
    pub async fn lock(&self, key: T) -> IdentityGuard<T> {
        let mutex = self.entries().entry(key.clone()).or_default().clone();
        let guard = mutex.lock_owned().await;
        IdentityGuard {
            key,
            entries: self.entries.clone(),
            guard: Some(guard),
        }
    }

    /// Number of identities with a live entry.
    pub fn len(&self) -> usize {
        self.entries().len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

pub struct IdentityGuard<T>
where
    T: Hash + Eq,
{
    key: T,
    entries: Arc<Entries<T>>,
    guard: Option<OwnedMutexGuard<()>>,
}

impl<T> IdentityGuard<T>
where
    T: Hash + Eq,
{
    pub fn key(&self) -> &T {
        &self.key
    }
}

impl<T> Drop for IdentityGuard<T>
where
    T: Hash + Eq,
{
    fn drop(&mut self) {
        let mut entries = self
            .entries
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner());
        // map entry + this guard, nobody else is waiting
        if let Some(entry) = entries.get(&self.key)
            && Arc::strong_count(entry) <= 2
        {
            entries.remove(&self.key);
        }
        self.guard.take();
    }
}
