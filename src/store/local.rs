//! In-process window store.
//!
//! Windows live in a `DashMap`; the shard guard held by `entry()` is the
//! per-key critical section around purge, count and insert. A background
//! [`Sweeper`] owned by the store drops keys that have been idle long
//! enough, which bounds memory under high identifier cardinality.

use std::collections::VecDeque;
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use dashmap::DashMap;
use parking_lot::Mutex;
use tokio::sync::oneshot;
use tokio::task::JoinHandle;
use tokio::time::MissedTickBehavior;
use tracing::{debug, info, trace};

use crate::error::StoreError;
use crate::ratelimit::clock::{duration_ms, Clock};
use crate::ratelimit::{WindowEntry, WindowStore};

/// Configuration for [`LocalStore`].
#[derive(Debug, Clone)]
pub struct LocalStoreConfig {
    /// How often the sweeper runs
    pub sweep_interval: Duration,
    /// How long a key must hold no live entries before it is dropped
    pub idle_ttl: Duration,
}

impl Default for LocalStoreConfig {
    fn default() -> Self {
        Self {
            sweep_interval: Duration::from_secs(300),
            idle_ttl: Duration::from_secs(60),
        }
    }
}

/// Entries for one key plus what the sweeper needs to judge it.
#[derive(Debug)]
struct KeyWindow {
    entries: VecDeque<WindowEntry>,
    window_ms: i64,
    last_seen_ms: i64,
}

impl KeyWindow {
    fn new(window_ms: i64, now_ms: i64) -> Self {
        Self {
            entries: VecDeque::new(),
            window_ms,
            last_seen_ms: now_ms,
        }
    }

    /// Entries are kept sorted by timestamp, so expired ones sit at the front.
    fn purge(&mut self, window_start_ms: i64) {
        while self
            .entries
            .front()
            .is_some_and(|e| e.at_ms < window_start_ms)
        {
            self.entries.pop_front();
        }
    }

    fn add(&mut self, entry: WindowEntry) {
        // Concurrent checks can read the clock and reach the lock in
        // different orders.
        let at = self.entries.partition_point(|e| e.at_ms <= entry.at_ms);
        self.entries.insert(at, entry);
    }
}

struct LocalInner {
    windows: DashMap<String, KeyWindow>,
    clock: Arc<dyn Clock>,
    idle_ttl_ms: i64,
}

impl LocalInner {
    /// Purge, count and insert under the key's shard lock. With `admit_below`
    /// set, the entry is only inserted while the count is under it.
    fn purge_count_insert(
        &self,
        key: &str,
        entry: &WindowEntry,
        window: Duration,
        admit_below: Option<u64>,
    ) -> u64 {
        let window_ms = duration_ms(window);
        let window_start = entry.at_ms.saturating_sub(window_ms);

        let mut slot = self
            .windows
            .entry(key.to_string())
            .or_insert_with(|| KeyWindow::new(window_ms, entry.at_ms));

        slot.purge(window_start);
        let count = slot.entries.len() as u64;
        if admit_below.map_or(true, |max| count < max) {
            slot.add(entry.clone());
        }
        slot.window_ms = window_ms;
        slot.last_seen_ms = slot.last_seen_ms.max(entry.at_ms);

        trace!(key = %key, count = count, "Local window updated");
        count
    }

    /// Drop every key idle for longer than its window plus the idle TTL.
    fn sweep(&self) -> usize {
        let now = self.clock.now_ms();
        let before = self.windows.len();

        self.windows.retain(|_, w| {
            let idle_for = now.saturating_sub(w.last_seen_ms);
            idle_for < w.window_ms.saturating_add(self.idle_ttl_ms)
        });

        before.saturating_sub(self.windows.len())
    }
}

/// Owned handle to the periodic sweep task.
///
/// Dropping the handle aborts the task; [`Sweeper::shutdown`] stops it
/// cleanly and waits for it.
pub struct Sweeper {
    shutdown: Option<oneshot::Sender<()>>,
    handle: JoinHandle<()>,
}

impl Sweeper {
    fn spawn(inner: Arc<LocalInner>, interval: Duration) -> Self {
        let (tx, mut rx) = oneshot::channel();

        let handle = tokio::spawn(async move {
            let mut ticker = tokio::time::interval(interval.max(Duration::from_millis(1)));
            ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);
            // The first tick completes immediately.
            ticker.tick().await;

            loop {
                tokio::select! {
                    _ = &mut rx => break,
                    _ = ticker.tick() => {
                        let removed = inner.sweep();
                        debug!(
                            removed = removed,
                            remaining = inner.windows.len(),
                            "Swept idle rate limit windows"
                        );
                    }
                }
            }

            debug!("Sweeper stopped");
        });

        Self {
            shutdown: Some(tx),
            handle,
        }
    }

    /// Stop the sweep task and wait for it to finish.
    pub async fn shutdown(mut self) {
        if let Some(tx) = self.shutdown.take() {
            let _ = tx.send(());
        }
        let _ = (&mut self.handle).await;
    }
}

impl Drop for Sweeper {
    fn drop(&mut self) {
        self.handle.abort();
    }
}

/// In-process [`WindowStore`].
///
/// Limits are per process; several instances of a service each enforce
/// their own quota.
pub struct LocalStore {
    inner: Arc<LocalInner>,
    sweeper: Mutex<Option<Sweeper>>,
}

impl LocalStore {
    /// Create the store and start its sweeper.
    ///
    /// Must be called from within a Tokio runtime.
    pub fn start(config: LocalStoreConfig, clock: Arc<dyn Clock>) -> Self {
        let inner = Arc::new(LocalInner {
            windows: DashMap::new(),
            clock,
            idle_ttl_ms: duration_ms(config.idle_ttl),
        });

        let sweeper = Sweeper::spawn(inner.clone(), config.sweep_interval);

        info!(
            sweep_interval = ?config.sweep_interval,
            idle_ttl = ?config.idle_ttl,
            "Local window store started"
        );

        Self {
            inner,
            sweeper: Mutex::new(Some(sweeper)),
        }
    }

    /// Run one sweep pass now. Returns how many keys were dropped.
    pub fn sweep(&self) -> usize {
        self.inner.sweep()
    }

    /// Number of keys currently held.
    pub fn key_count(&self) -> usize {
        self.inner.windows.len()
    }

    /// Stop the sweeper. Stored windows stay usable.
    pub async fn shutdown(&self) {
        let sweeper = self.sweeper.lock().take();
        if let Some(sweeper) = sweeper {
            sweeper.shutdown().await;
            info!("Local window store sweeper shut down");
        }
    }
}

#[async_trait]
impl WindowStore for LocalStore {
    fn name(&self) -> &'static str {
        "local"
    }

    async fn purge_count_insert(
        &self,
        key: &str,
        entry: &WindowEntry,
        window: Duration,
    ) -> Result<u64, StoreError> {
        Ok(self.inner.purge_count_insert(key, entry, window, None))
    }

    async fn purge_count_admit(
        &self,
        key: &str,
        entry: &WindowEntry,
        window: Duration,
        max: u64,
    ) -> Result<u64, StoreError> {
        Ok(self.inner.purge_count_insert(key, entry, window, Some(max)))
    }

    async fn retract(&self, key: &str, entry: &WindowEntry) -> Result<bool, StoreError> {
        let Some(mut slot) = self.inner.windows.get_mut(key) else {
            return Ok(false);
        };

        let before = slot.entries.len();
        slot.entries.retain(|e| e.member != entry.member);
        Ok(slot.entries.len() < before)
    }

    async fn live_entries(&self, key: &str, window_start_ms: i64) -> Result<Vec<i64>, StoreError> {
        let Some(slot) = self.inner.windows.get(key) else {
            return Ok(Vec::new());
        };

        let first_live = slot.entries.partition_point(|e| e.at_ms < window_start_ms);
        Ok(slot.entries.range(first_live..).map(|e| e.at_ms).collect())
    }

    async fn clear(&self, keys: &[String]) -> Result<u64, StoreError> {
        let removed = keys
            .iter()
            .filter(|key| self.inner.windows.remove(key.as_str()).is_some())
            .count();
        Ok(removed as u64)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::ratelimit::clock::ManualClock;

    const START: i64 = 1_700_000_000_000;

    fn store_with_clock() -> (LocalStore, Arc<ManualClock>) {
        let clock = Arc::new(ManualClock::new(START));
        let store = LocalStore::start(LocalStoreConfig::default(), clock.clone());
        (store, clock)
    }

    #[tokio::test]
    async fn test_count_before_insert() {
        let (store, _clock) = store_with_clock();
        let window = Duration::from_secs(1);

        for expected in 0..3 {
            let count = store
                .purge_count_insert("k", &WindowEntry::new(START), window)
                .await
                .unwrap();
            assert_eq!(count, expected);
        }
    }

    #[tokio::test]
    async fn test_expired_entries_are_purged() {
        let (store, _clock) = store_with_clock();
        let window = Duration::from_millis(1000);

        store
            .purge_count_insert("k", &WindowEntry::new(START), window)
            .await
            .unwrap();

        // Still inside the window at exactly START + window.
        let count = store
            .purge_count_insert("k", &WindowEntry::new(START + 1000), window)
            .await
            .unwrap();
        assert_eq!(count, 1);

        let count = store
            .purge_count_insert("k", &WindowEntry::new(START + 2001), window)
            .await
            .unwrap();
        assert_eq!(count, 0);
    }

    #[tokio::test]
    async fn test_out_of_order_entries_stay_sorted() {
        let (store, _clock) = store_with_clock();
        let window = Duration::from_millis(1000);

        for at in [START + 30, START + 10, START + 20] {
            store
                .purge_count_insert("k", &WindowEntry::new(at), window)
                .await
                .unwrap();
        }
        assert_eq!(
            store.live_entries("k", START).await.unwrap(),
            vec![START + 10, START + 20, START + 30]
        );

        // Only the two oldest have left the window.
        let count = store
            .purge_count_insert("k", &WindowEntry::new(START + 1025), window)
            .await
            .unwrap();
        assert_eq!(count, 1);
    }

    #[tokio::test]
    async fn test_rejected_entries_purge_as_the_window_moves() {
        let (store, _clock) = store_with_clock();
        let window = Duration::from_millis(1000);

        for i in 0..5_000 {
            store
                .purge_count_insert("hot", &WindowEntry::new(START + i / 10), window)
                .await
                .unwrap();
        }
        assert_eq!(store.live_entries("hot", START).await.unwrap().len(), 5_000);

        let count = store
            .purge_count_insert("hot", &WindowEntry::new(START + 1_250), window)
            .await
            .unwrap();
        // Entries at START + 250 and later are still live.
        assert_eq!(count, 2_500);
    }

    #[tokio::test]
    async fn test_admit_skips_insert_at_limit() {
        let (store, _clock) = store_with_clock();
        let window = Duration::from_secs(10);

        for expected in 0..2 {
            let count = store
                .purge_count_admit("k", &WindowEntry::new(START), window, 2)
                .await
                .unwrap();
            assert_eq!(count, expected);
        }

        for _ in 0..3 {
            let count = store
                .purge_count_admit("k", &WindowEntry::new(START + 1), window, 2)
                .await
                .unwrap();
            assert_eq!(count, 2);
        }
        assert_eq!(store.live_entries("k", START).await.unwrap(), vec![START, START]);
    }

    #[tokio::test]
    async fn test_retract_removes_only_that_entry() {
        let (store, _clock) = store_with_clock();
        let window = Duration::from_secs(10);
        let first = WindowEntry::new(START);
        let second = WindowEntry::new(START);

        store.purge_count_insert("k", &first, window).await.unwrap();
        store.purge_count_insert("k", &second, window).await.unwrap();

        assert!(store.retract("k", &first).await.unwrap());
        assert!(!store.retract("k", &first).await.unwrap());
        assert_eq!(store.live_entries("k", START - 1).await.unwrap(), vec![START]);
    }

    #[tokio::test]
    async fn test_live_entries_is_read_only() {
        let (store, _clock) = store_with_clock();
        let window = Duration::from_secs(1);

        store
            .purge_count_insert("k", &WindowEntry::new(START), window)
            .await
            .unwrap();
        store
            .purge_count_insert("k", &WindowEntry::new(START + 500), window)
            .await
            .unwrap();

        let live = store.live_entries("k", START + 100).await.unwrap();
        assert_eq!(live, vec![START + 500]);

        // The older entry is filtered, not deleted.
        let all = store.live_entries("k", START).await.unwrap();
        assert_eq!(all, vec![START, START + 500]);
    }

    #[tokio::test]
    async fn test_clear_reports_existing_keys() {
        let (store, _clock) = store_with_clock();
        let window = Duration::from_secs(1);

        store
            .purge_count_insert("a", &WindowEntry::new(START), window)
            .await
            .unwrap();

        let removed = store
            .clear(&["a".to_string(), "b".to_string()])
            .await
            .unwrap();
        assert_eq!(removed, 1);
        assert_eq!(store.key_count(), 0);
    }

    #[tokio::test]
    async fn test_sweep_drops_idle_keys_only() {
        let (store, clock) = store_with_clock();

        store
            .purge_count_insert("short", &WindowEntry::new(START), Duration::from_secs(1))
            .await
            .unwrap();
        store
            .purge_count_insert("long", &WindowEntry::new(START), Duration::from_secs(3600))
            .await
            .unwrap();

        // Past one second of window plus sixty seconds of idle TTL.
        clock.advance(Duration::from_secs(62));
        assert_eq!(store.sweep(), 1);
        assert_eq!(store.key_count(), 1);
        assert!(store.live_entries("long", START).await.unwrap().len() == 1);
    }

    #[tokio::test]
    async fn test_background_sweeper_runs() {
        let clock = Arc::new(ManualClock::new(START));
        let config = LocalStoreConfig {
            sweep_interval: Duration::from_millis(20),
            idle_ttl: Duration::ZERO,
        };
        let store = LocalStore::start(config, clock.clone());

        store
            .purge_count_insert("k", &WindowEntry::new(START), Duration::from_millis(100))
            .await
            .unwrap();
        clock.advance(Duration::from_secs(1));

        tokio::time::sleep(Duration::from_millis(150)).await;
        assert_eq!(store.key_count(), 0);

        store.shutdown().await;
    }

    #[tokio::test]
    async fn test_shutdown_is_idempotent() {
        let (store, _clock) = store_with_clock();
        store.shutdown().await;
        store.shutdown().await;

        // The store keeps working without its sweeper.
        let count = store
            .purge_count_insert("k", &WindowEntry::new(START), Duration::from_secs(1))
            .await
            .unwrap();
        assert_eq!(count, 0);
    }
}
