//! Sliding-window decision logic.
//!
//! Everything here is pure: the store supplies the count, the limiter
//! supplies the clock, and these functions turn them into a [`Decision`].

use std::time::Duration;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use super::clock::duration_ms;

/// Handle to the entry a check logged, for later outcome reporting.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct EntryTicket {
    /// The action the entry was logged under
    pub action: String,
    /// The identifier the entry was logged for
    pub identifier: String,
    /// Member id of the logged entry
    pub member: String,
    /// Timestamp of the logged entry, in epoch milliseconds
    pub at_ms: i64,
}

/// The outcome of one rate limit check.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct Decision {
    /// Whether the action may proceed
    pub allowed: bool,
    /// Quota left in the current window; `u64::MAX` when unlimited
    pub remaining: u64,
    /// Maximum events per window; `u64::MAX` when unlimited
    pub limit: u64,
    /// Window length in milliseconds
    pub window_ms: u64,
    /// When the current attempt leaves the window
    pub reset_at: DateTime<Utc>,
    /// Seconds the caller should wait, only set on rejection
    #[serde(skip_serializing_if = "Option::is_none")]
    pub retry_after_secs: Option<u64>,
    /// Set when the limiter degraded and allowed without consulting the store
    #[serde(skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
    /// Present when an entry was logged and is still in the window
    #[serde(skip_serializing_if = "Option::is_none")]
    pub ticket: Option<EntryTicket>,
}

impl Decision {
    /// Whether this decision carries no quota at all.
    pub fn is_unlimited(&self) -> bool {
        self.limit == u64::MAX
    }

    /// Whether the limiter allowed because the store failed.
    pub fn is_degraded(&self) -> bool {
        self.error.is_some()
    }

    /// An always-allow decision for actions without a policy.
    pub fn unlimited(now_ms: i64) -> Self {
        Self {
            allowed: true,
            remaining: u64::MAX,
            limit: u64::MAX,
            window_ms: 0,
            reset_at: to_datetime(now_ms),
            retry_after_secs: None,
            error: None,
            ticket: None,
        }
    }

    /// A fail-open decision used when the store could not be consulted.
    pub fn degraded(max: u64, window: Duration, now_ms: i64, error: String) -> Self {
        Self {
            allowed: true,
            remaining: 1,
            limit: max,
            window_ms: window_ms(window),
            reset_at: to_datetime(now_ms.saturating_add(duration_ms(window))),
            retry_after_secs: None,
            error: Some(error),
            ticket: None,
        }
    }
}

/// Turn the count observed before this attempt into a decision.
///
/// `count_before == max` rejects: a window admits exactly `max` events.
pub fn decide(count_before: u64, max: u64, window: Duration, now_ms: i64) -> Decision {
    let allowed = count_before < max;
    let reset_at_ms = now_ms.saturating_add(duration_ms(window));

    let (remaining, retry_after_secs) = if allowed {
        (max.saturating_sub(count_before).saturating_sub(1), None)
    } else {
        (0, Some(ceil_secs(reset_at_ms - now_ms)))
    };

    Decision {
        allowed,
        remaining,
        limit: max,
        window_ms: window_ms(window),
        reset_at: to_datetime(reset_at_ms),
        retry_after_secs,
        error: None,
        ticket: None,
    }
}

/// How long until a check against `live` (oldest first) would be admitted.
///
/// An entry at `ts` is purged once `now > ts + window`, so the wait ends one
/// millisecond past the window edge of the entry that must leave.
pub fn wait_time(live: &[i64], max: u64, window: Duration, now_ms: i64) -> Duration {
    let count = live.len() as u64;
    if count < max {
        return Duration::ZERO;
    }

    let idx = (count - max) as usize;
    let frees_at = live[idx]
        .saturating_add(duration_ms(window))
        .saturating_add(1);

    Duration::from_millis(u64::try_from(frees_at - now_ms).unwrap_or(0))
}

fn ceil_secs(ms: i64) -> u64 {
    let ms = u64::try_from(ms).unwrap_or(0);
    ms.div_ceil(1000)
}

fn window_ms(window: Duration) -> u64 {
    u64::try_from(window.as_millis()).unwrap_or(u64::MAX)
}

fn to_datetime(ms: i64) -> DateTime<Utc> {
    DateTime::from_timestamp_millis(ms).unwrap_or_default()
}

#[cfg(test)]
mod tests {
    use super::*;

    const NOW: i64 = 1_700_000_000_000;

    #[test]
    fn test_decide_counts_down_remaining() {
        let window = Duration::from_secs(1);

        let remaining: Vec<u64> = (0..3)
            .map(|count| decide(count, 3, window, NOW).remaining)
            .collect();
        assert_eq!(remaining, vec![2, 1, 0]);

        let rejected = decide(3, 3, window, NOW);
        assert!(!rejected.allowed);
        assert_eq!(rejected.remaining, 0);
    }

    #[test]
    fn test_decide_rejects_exactly_at_limit() {
        let decision = decide(1, 1, Duration::from_secs(60), NOW);
        assert!(!decision.allowed);
        assert_eq!(decision.retry_after_secs, Some(60));
    }

    #[test]
    fn test_decide_rounds_retry_after_up() {
        let decision = decide(5, 5, Duration::from_millis(1500), NOW);
        assert_eq!(decision.retry_after_secs, Some(2));
        assert_eq!(decision.window_ms, 1500);
    }

    #[test]
    fn test_decide_allowed_has_no_retry_after() {
        let decision = decide(0, 5, Duration::from_secs(10), NOW);
        assert!(decision.allowed);
        assert_eq!(decision.retry_after_secs, None);
        assert_eq!(decision.reset_at.timestamp_millis(), NOW + 10_000);
    }

    #[test]
    fn test_decide_clamps_when_count_exceeds_max() {
        // A store that overshot under concurrency must not underflow.
        let decision = decide(7, 3, Duration::from_secs(1), NOW);
        assert!(!decision.allowed);
        assert_eq!(decision.remaining, 0);
    }

    #[test]
    fn test_wait_time_zero_under_limit() {
        let wait = wait_time(&[NOW - 10], 2, Duration::from_secs(1), NOW);
        assert_eq!(wait, Duration::ZERO);
    }

    #[test]
    fn test_wait_time_until_oldest_blocking_entry_leaves() {
        let live = [NOW - 900, NOW - 500, NOW - 100];
        let wait = wait_time(&live, 2, Duration::from_secs(1), NOW);
        // Two entries must remain at most, so NOW - 500 has to leave.
        assert_eq!(wait, Duration::from_millis(501));
    }

    #[test]
    fn test_unlimited_decision() {
        let decision = Decision::unlimited(NOW);
        assert!(decision.allowed);
        assert!(decision.is_unlimited());
        assert!(!decision.is_degraded());
    }

    #[test]
    fn test_degraded_decision() {
        let decision =
            Decision::degraded(10, Duration::from_secs(60), NOW, "timed out".to_string());
        assert!(decision.allowed);
        assert_eq!(decision.remaining, 1);
        assert!(decision.is_degraded());
    }
}
