//! In-memory [`EphemeralStore`] backed by a mutex-guarded map.
//!
//! Used by tests and single-node deployments. Expiry is lazy: entries are
//! dropped when touched past their deadline, and [`MemoryStore::purge_expired`]
//! sweeps the rest. All operations hold the map lock for their full
//! duration, which makes `take`, `increment`, and `decrement` atomic.

use std::collections::HashMap;
use std::time::Duration;

use async_trait::async_trait;
use tokio::sync::Mutex;
use tokio::time::Instant;

use super::EphemeralStore;
use crate::error::AuthError;

struct Entry {
    value: String,
    expires_at: Instant,
}

impl Entry {
    fn live(&self, now: Instant) -> bool {
        self.expires_at > now
    }
}

#[derive(Default)]
pub struct MemoryStore {
    entries: Mutex<HashMap<String, Entry>>,
}

impl MemoryStore {
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Drop every expired entry. Safe to run concurrently from multiple
    /// owners since it only deletes.
    pub async fn purge_expired(&self) {
        let now = Instant::now();
        self.entries.lock().await.retain(|_, entry| entry.live(now));
    }

    #[cfg(test)]
    pub(crate) async fn len(&self) -> usize {
        let now = Instant::now();
        self.entries
            .lock()
            .await
            .values()
            .filter(|entry| entry.live(now))
            .count()
    }
}

#[async_trait]
impl EphemeralStore for MemoryStore {
    async fn put(&self, key: &str, value: &str, ttl: Duration) -> Result<(), AuthError> {
        let mut entries = self.entries.lock().await;
        entries.insert(
            key.to_string(),
            Entry {
                value: value.to_string(),
                expires_at: Instant::now() + ttl,
            },
        );
        Ok(())
    }

    async fn get(&self, key: &str) -> Result<Option<String>, AuthError> {
        let now = Instant::now();
        let mut entries = self.entries.lock().await;
        match entries.get(key) {
            Some(entry) if entry.live(now) => Ok(Some(entry.value.clone())),
            Some(_) => {
                entries.remove(key);
                Ok(None)
            }
            None => Ok(None),
        }
    }

    async fn take(&self, key: &str) -> Result<Option<String>, AuthError> {
        let now = Instant::now();
        let mut entries = self.entries.lock().await;
        match entries.remove(key) {
            Some(entry) if entry.live(now) => Ok(Some(entry.value)),
            _ => Ok(None),
        }
    }

    async fn delete(&self, key: &str) -> Result<bool, AuthError> {
        let now = Instant::now();
        let mut entries = self.entries.lock().await;
        Ok(entries.remove(key).is_some_and(|entry| entry.live(now)))
    }

    async fn increment(&self, key: &str, window: Duration) -> Result<i64, AuthError> {
        let now = Instant::now();
        let mut entries = self.entries.lock().await;
        let count = match entries.get(key) {
            Some(entry) if entry.live(now) => entry.value.parse::<i64>().unwrap_or(0) + 1,
            _ => 1,
        };
        let expires_at = match entries.get(key) {
            // Fixed window: the deadline set at first increment sticks.
            Some(entry) if entry.live(now) => entry.expires_at,
            _ => now + window,
        };
        entries.insert(
            key.to_string(),
            Entry {
                value: count.to_string(),
                expires_at,
            },
        );
        Ok(count)
    }

    async fn decrement(&self, key: &str) -> Result<Option<i64>, AuthError> {
        let now = Instant::now();
        let mut entries = self.entries.lock().await;
        match entries.get_mut(key) {
            Some(entry) if entry.live(now) => {
                let count = entry.value.parse::<i64>().unwrap_or(0) - 1;
                entry.value = count.to_string();
                Ok(Some(count))
            }
            Some(_) => {
                entries.remove(key);
                Ok(None)
            }
            None => Ok(None),
        }
    }

    async fn remaining_ttl(&self, key: &str) -> Result<Option<Duration>, AuthError> {
        let now = Instant::now();
        let entries = self.entries.lock().await;
        Ok(entries
            .get(key)
            .filter(|entry| entry.live(now))
            .map(|entry| entry.expires_at - now))
    }

    async fn expire(&self, key: &str, ttl: Duration) -> Result<bool, AuthError> {
        let now = Instant::now();
        let mut entries = self.entries.lock().await;
        match entries.get_mut(key) {
            Some(entry) if entry.live(now) => {
                entry.expires_at = now + ttl;
                Ok(true)
            }
            _ => Ok(false),
        }
    }
}
