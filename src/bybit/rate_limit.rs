// =============================================================================
// Rate-Limit Tracker — follows Bybit REST quota headers
// =============================================================================
//
// Every Bybit V5 response carries the per-endpoint quota:
//   - X-Bapi-Limit                  request limit of the current window
//   - X-Bapi-Limit-Status           requests remaining in the window
//   - X-Bapi-Limit-Reset-Timestamp  window reset time (epoch ms)
//
// The tracker keeps the latest values in atomics so any task can read them
// lock-free.
// =============================================================================

use std::sync::atomic::{AtomicI64, AtomicU32, Ordering};

use reqwest::header::HeaderMap;
use serde::Serialize;
use tracing::{debug, warn};

/// Warn once the remaining quota drops below this share of the limit.
const WARN_REMAINING_RATIO: f64 = 0.2;

/// Thread-safe rate-limit tracker backed by atomic counters.
pub struct RateLimitTracker {
    limit: AtomicU32,
    remaining: AtomicU32,
    reset_at_ms: AtomicI64,
}

/// Immutable snapshot of the current quota state.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub struct RateLimitSnapshot {
    pub limit: u32,
    pub remaining: u32,
    pub reset_at_ms: i64,
}

impl RateLimitTracker {
    pub fn new() -> Self {
        Self {
            limit: AtomicU32::new(0),
            remaining: AtomicU32::new(0),
            reset_at_ms: AtomicI64::new(0),
        }
    }

    /// Update counters from the headers of a Bybit response.
    pub fn update_from_headers(&self, headers: &HeaderMap) {
        if let Some(limit) = header_value::<u32>(headers, "X-Bapi-Limit") {
            self.limit.store(limit, Ordering::Relaxed);
        }
        if let Some(reset) = header_value::<i64>(headers, "X-Bapi-Limit-Reset-Timestamp") {
            self.reset_at_ms.store(reset, Ordering::Relaxed);
        }

        let Some(remaining) = header_value::<u32>(headers, "X-Bapi-Limit-Status") else {
            return;
        };
        self.remaining.store(remaining, Ordering::Relaxed);

        let limit = self.limit.load(Ordering::Relaxed);
        if limit > 0 && f64::from(remaining) < f64::from(limit) * WARN_REMAINING_RATIO {
            warn!(
                remaining,
                limit,
                reset_at_ms = self.reset_at_ms.load(Ordering::Relaxed),
                "bybit rate-limit quota running low"
            );
        } else {
            debug!(remaining, limit, "bybit rate-limit quota updated");
        }
    }

    /// True when the last response reported no remaining quota.
    pub fn is_exhausted(&self) -> bool {
        self.limit.load(Ordering::Relaxed) > 0 && self.remaining.load(Ordering::Relaxed) == 0
    }

    pub fn snapshot(&self) -> RateLimitSnapshot {
        RateLimitSnapshot {
            limit: self.limit.load(Ordering::Relaxed),
            remaining: self.remaining.load(Ordering::Relaxed),
            reset_at_ms: self.reset_at_ms.load(Ordering::Relaxed),
        }
    }
}

impl Default for RateLimitTracker {
    fn default() -> Self {
        Self::new()
    }
}

impl std::fmt::Debug for RateLimitTracker {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("RateLimitTracker")
            .field("limit", &self.limit.load(Ordering::Relaxed))
            .field("remaining", &self.remaining.load(Ordering::Relaxed))
            .field("reset_at_ms", &self.reset_at_ms.load(Ordering::Relaxed))
            .finish()
    }
}

fn header_value<T: std::str::FromStr>(headers: &HeaderMap, name: &str) -> Option<T> {
    headers.get(name)?.to_str().ok()?.trim().parse().ok()
}

#[cfg(test)]
mod tests {
    use super::*;
    use reqwest::header::HeaderValue;

    fn headers(limit: &str, remaining: &str) -> HeaderMap {
        let mut map = HeaderMap::new();
        map.insert("X-Bapi-Limit", HeaderValue::from_str(limit).unwrap());
        map.insert("X-Bapi-Limit-Status", HeaderValue::from_str(remaining).unwrap());
        map.insert(
            "X-Bapi-Limit-Reset-Timestamp",
            HeaderValue::from_static("1700000000000"),
        );
        map
    }

    #[test]
    fn tracks_latest_headers() {
        let tracker = RateLimitTracker::new();
        tracker.update_from_headers(&headers("120", "119"));
        assert_eq!(
            tracker.snapshot(),
            RateLimitSnapshot {
                limit: 120,
                remaining: 119,
                reset_at_ms: 1_700_000_000_000,
            }
        );
        assert!(!tracker.is_exhausted());

        tracker.update_from_headers(&headers("120", "0"));
        assert!(tracker.is_exhausted());
    }

    #[test]
    fn ignores_missing_or_garbage_headers() {
        let tracker = RateLimitTracker::new();
        tracker.update_from_headers(&HeaderMap::new());
        let mut bad = HeaderMap::new();
        bad.insert("X-Bapi-Limit-Status", HeaderValue::from_static("lots"));
        tracker.update_from_headers(&bad);
        assert_eq!(tracker.snapshot().remaining, 0);
        assert!(!tracker.is_exhausted());
    }
}
