//! Window store trait for abstracting local and shared storage.

use std::time::Duration;

use async_trait::async_trait;

use crate::error::StoreError;

/// One counted event inside a sliding window.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct WindowEntry {
    /// Unique member id, so concurrent events at the same millisecond stay distinct
    pub member: String,
    /// When the event happened, in epoch milliseconds
    pub at_ms: i64,
}

impl WindowEntry {
    /// Create an entry at `at_ms` with a fresh member id.
    pub fn new(at_ms: i64) -> Self {
        Self {
            member: format!("{}-{}", at_ms, uuid::Uuid::new_v4()),
            at_ms,
        }
    }
}

/// Trait for window store implementations.
///
/// This trait abstracts over both the in-process `LocalStore` and the
/// Redis-backed `RedisStore`, so the limiter never branches on which one
/// it holds.
#[async_trait]
pub trait WindowStore: Send + Sync {
    /// Short name used in logs and the CLI.
    fn name(&self) -> &'static str;

    /// Atomically drop entries older than `now - window`, count what is
    /// left, insert `entry`, and refresh the key's expiry to `window`.
    ///
    /// Returns the count before the insert.
    async fn purge_count_insert(
        &self,
        key: &str,
        entry: &WindowEntry,
        window: Duration,
    ) -> Result<u64, StoreError>;

    /// Same as [`purge_count_insert`](Self::purge_count_insert), but `entry`
    /// is only inserted when fewer than `max` entries are live, all within
    /// one atomic step.
    async fn purge_count_admit(
        &self,
        key: &str,
        entry: &WindowEntry,
        window: Duration,
        max: u64,
    ) -> Result<u64, StoreError>;

    /// Remove a previously inserted entry. Returns whether it was present.
    async fn retract(&self, key: &str, entry: &WindowEntry) -> Result<bool, StoreError>;

    /// Timestamps of the entries at or after `window_start_ms`, oldest first.
    ///
    /// Read-only; nothing is inserted or purged.
    async fn live_entries(&self, key: &str, window_start_ms: i64) -> Result<Vec<i64>, StoreError>;

    /// Delete the given keys entirely. Returns how many existed.
    async fn clear(&self, keys: &[String]) -> Result<u64, StoreError>;
}
