//! Ephemeral key/value contract used for OTPs, attempt counters, token
//! blacklists, and fast refresh-token lookup.
//!
//! The contract mirrors the primitives of a TTL store (SET EX, GETDEL,
//! INCR + EXPIRE): per-key TTL, atomic consume, and atomic counters. The
//! rotation and attempt-limiting guarantees in this crate hold only if
//! `take` and `decrement` are atomic, so any implementation must provide
//! them as single operations, not read-modify-write round trips.
//!
//! Store failures surface as `DependencyUnavailable`; callers treat that
//! as a fail-closed rejection, never a fallback to a slower trust path.

mod memory;

pub use memory::MemoryStore;

use std::time::Duration;

use async_trait::async_trait;

use crate::error::AuthError;

#[async_trait]
pub trait EphemeralStore: Send + Sync {
    /// Store `value` under `key`, replacing any prior entry, expiring
    /// after `ttl`.
    async fn put(&self, key: &str, value: &str, ttl: Duration) -> Result<(), AuthError>;

    /// Read a live entry.
    async fn get(&self, key: &str) -> Result<Option<String>, AuthError>;

    /// Atomically read and delete a live entry. Concurrent callers on the
    /// same key observe exactly one `Some`.
    async fn take(&self, key: &str) -> Result<Option<String>, AuthError>;

    /// Delete an entry. Returns whether a live entry existed.
    async fn delete(&self, key: &str) -> Result<bool, AuthError>;

    /// Atomically increment a counter, creating it with `window` as its
    /// TTL on first use. The TTL is not extended on later increments
    /// (fixed window). Returns the post-increment count.
    async fn increment(&self, key: &str, window: Duration) -> Result<i64, AuthError>;

    /// Atomically decrement an existing counter. Returns `None` when the
    /// counter is absent or expired.
    async fn decrement(&self, key: &str) -> Result<Option<i64>, AuthError>;

    /// Remaining lifetime of a live entry.
    async fn remaining_ttl(&self, key: &str) -> Result<Option<Duration>, AuthError>;

    /// Re-arm the TTL of a live entry. Returns `false` when absent.
    async fn expire(&self, key: &str, ttl: Duration) -> Result<bool, AuthError>;
}
