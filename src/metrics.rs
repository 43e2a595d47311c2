//! In-memory counters describing limiter activity.

use std::collections::BTreeMap;
use std::sync::atomic::{AtomicU64, Ordering};

use dashmap::DashMap;
use serde::Serialize;

/// Totals for one action.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize)]
pub struct ActionCounts {
    /// Checks made
    pub total: u64,
    /// Checks rejected
    pub blocked: u64,
}

/// Totals for one identifier.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
pub struct IdentifierStats {
    /// Checks made by this identifier
    pub total_requests: u64,
    /// Checks rejected for this identifier
    pub blocked_requests: u64,
    /// Breakdown by action
    pub per_action: BTreeMap<String, ActionCounts>,
}

/// Point-in-time copy of all counters.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
pub struct MetricsSnapshot {
    /// Checks made
    pub total_requests: u64,
    /// Checks rejected
    pub blocked_requests: u64,
    /// Checks allowed because the store failed
    pub degraded_requests: u64,
    /// Breakdown by action
    pub per_action: BTreeMap<String, ActionCounts>,
    /// Breakdown by identifier
    pub per_identifier: BTreeMap<String, IdentifierStats>,
}

#[derive(Default)]
struct ActionCounters {
    total: AtomicU64,
    blocked: AtomicU64,
}

impl ActionCounters {
    fn load(&self) -> ActionCounts {
        ActionCounts {
            total: self.total.load(Ordering::Relaxed),
            blocked: self.blocked.load(Ordering::Relaxed),
        }
    }
}

/// Running counters, safe to update from many tasks at once.
///
/// Counters only grow, except through [`MetricsAggregator::clear`] and
/// [`MetricsAggregator::clear_identifier`]. One entry is kept per distinct
/// action and identifier, including actions without a policy.
#[derive(Default)]
pub struct MetricsAggregator {
    total: AtomicU64,
    blocked: AtomicU64,
    degraded: AtomicU64,
    per_action: DashMap<String, ActionCounters>,
    per_identifier: DashMap<String, IdentifierStats>,
}

impl MetricsAggregator {
    /// Create empty counters.
    pub fn new() -> Self {
        Self::default()
    }

    /// Record one check.
    pub fn record(&self, action: &str, identifier: &str, blocked: bool, degraded: bool) {
        self.total.fetch_add(1, Ordering::Relaxed);
        if blocked {
            self.blocked.fetch_add(1, Ordering::Relaxed);
        }
        if degraded {
            self.degraded.fetch_add(1, Ordering::Relaxed);
        }

        {
            let counters = self.per_action.entry(action.to_string()).or_default();
            counters.total.fetch_add(1, Ordering::Relaxed);
            if blocked {
                counters.blocked.fetch_add(1, Ordering::Relaxed);
            }
        }

        let mut guard = self.per_identifier.entry(identifier.to_string()).or_default();
        let stats = &mut *guard;
        stats.total_requests += 1;
        let per_action = stats.per_action.entry(action.to_string()).or_default();
        per_action.total += 1;
        if blocked {
            per_action.blocked += 1;
            stats.blocked_requests += 1;
        }
    }

    /// Copy every counter.
    pub fn snapshot(&self) -> MetricsSnapshot {
        MetricsSnapshot {
            total_requests: self.total.load(Ordering::Relaxed),
            blocked_requests: self.blocked.load(Ordering::Relaxed),
            degraded_requests: self.degraded.load(Ordering::Relaxed),
            per_action: self
                .per_action
                .iter()
                .map(|e| (e.key().clone(), e.value().load()))
                .collect(),
            per_identifier: self
                .per_identifier
                .iter()
                .map(|e| (e.key().clone(), e.value().clone()))
                .collect(),
        }
    }

    /// Counters for one identifier, if it has been seen.
    pub fn identifier(&self, identifier: &str) -> Option<IdentifierStats> {
        self.per_identifier.get(identifier).map(|s| s.value().clone())
    }

    /// Forget one identifier's breakdown. Global totals are kept.
    pub fn clear_identifier(&self, identifier: &str) -> bool {
        self.per_identifier.remove(identifier).is_some()
    }

    /// Reset everything to zero.
    ///
    /// This is primarily useful for testing.
    pub fn clear(&self) {
        self.total.store(0, Ordering::Relaxed);
        self.blocked.store(0, Ordering::Relaxed);
        self.degraded.store(0, Ordering::Relaxed);
        self.per_action.clear();
        self.per_identifier.clear();
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_record_counts_totals_and_breakdowns() {
        let metrics = MetricsAggregator::new();
        metrics.record("messages", "alice", false, false);
        metrics.record("messages", "alice", true, false);
        metrics.record("uploads", "bob", false, true);

        let snapshot = metrics.snapshot();
        assert_eq!(snapshot.total_requests, 3);
        assert_eq!(snapshot.blocked_requests, 1);
        assert_eq!(snapshot.degraded_requests, 1);
        assert_eq!(snapshot.per_action["messages"], ActionCounts { total: 2, blocked: 1 });
        assert_eq!(snapshot.per_action["uploads"], ActionCounts { total: 1, blocked: 0 });

        let alice = &snapshot.per_identifier["alice"];
        assert_eq!(alice.total_requests, 2);
        assert_eq!(alice.blocked_requests, 1);
        assert_eq!(alice.per_action["messages"].blocked, 1);
    }

    #[test]
    fn test_clear_identifier_keeps_totals() {
        let metrics = MetricsAggregator::new();
        metrics.record("messages", "alice", true, false);

        assert!(metrics.clear_identifier("alice"));
        assert!(!metrics.clear_identifier("alice"));
        assert!(metrics.identifier("alice").is_none());
        assert_eq!(metrics.snapshot().total_requests, 1);
    }

    #[test]
    fn test_clear_resets_everything() {
        let metrics = MetricsAggregator::new();
        metrics.record("messages", "alice", true, true);
        metrics.clear();

        assert_eq!(metrics.snapshot(), MetricsSnapshot::default());
    }

    #[test]
    fn test_snapshot_serializes() {
        let metrics = MetricsAggregator::new();
        metrics.record("typing", "carol", false, false);

        let json = serde_json::to_value(metrics.snapshot()).unwrap();
        assert_eq!(json["total_requests"], 1);
        assert_eq!(json["per_identifier"]["carol"]["per_action"]["typing"]["total"], 1);
    }
}
