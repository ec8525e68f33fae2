// =============================================================================
// Request-Weight Tracker — keeps the client under Binance's 1-minute budget
// =============================================================================
//
// Binance reports the weight consumed in the current minute through the
// `X-MBX-USED-WEIGHT-1M` header. The tracker keeps the latest value and
// refuses requests that would cross our own ceiling; the refusal surfaces as
// a transient `RateLimited` error so the retry policy backs off.
// =============================================================================

use std::sync::atomic::{AtomicU32, Ordering};

use tracing::{debug, warn};

use crate::exchange::ExchangeError;

/// Binance allows 6000/min on spot; we stop well before that.
const WEIGHT_HARD_LIMIT: u32 = 5000;
const WEIGHT_WARN_THRESHOLD: u32 = 4000;

pub struct WeightTracker {
    used_weight_1m: AtomicU32,
}

impl WeightTracker {
    pub fn new() -> Self {
        Self {
            used_weight_1m: AtomicU32::new(0),
        }
    }

    pub fn used(&self) -> u32 {
        self.used_weight_1m.load(Ordering::Relaxed)
    }

    /// Record the weight reported by the latest response.
    pub fn update_from_headers(&self, headers: &reqwest::header::HeaderMap) {
        let Some(w) = headers
            .get("X-MBX-USED-WEIGHT-1M")
            .and_then(|v| v.to_str().ok())
            .and_then(|s| s.parse::<u32>().ok())
        else {
            return;
        };
        self.record(w);
    }

    fn record(&self, w: u32) {
        let prev = self.used_weight_1m.swap(w, Ordering::Relaxed);
        if w >= WEIGHT_WARN_THRESHOLD && prev < WEIGHT_WARN_THRESHOLD {
            warn!(used_weight = w, hard_limit = WEIGHT_HARD_LIMIT, "request weight crossed warning threshold");
        }
        debug!(used_weight_1m = w, "request weight updated");
    }

    /// Fail with `RateLimited` if spending `weight` would cross the ceiling.
    pub fn check(&self, weight: u32) -> Result<(), ExchangeError> {
        let current = self.used();
        if current + weight > WEIGHT_HARD_LIMIT {
            warn!(current_weight = current, requested_weight = weight, "request held back by weight limit");
            return Err(ExchangeError::RateLimited(format!(
                "used weight {current} + {weight} exceeds {WEIGHT_HARD_LIMIT}"
            )));
        }
        Ok(())
    }
}

impl Default for WeightTracker {
    fn default() -> Self {
        Self::new()
    }
}

impl std::fmt::Debug for WeightTracker {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("WeightTracker")
            .field("used_weight_1m", &self.used())
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use reqwest::header::{HeaderMap, HeaderValue};

    #[test]
    fn header_updates_used_weight() {
        let tracker = WeightTracker::new();
        let mut headers = HeaderMap::new();
        headers.insert("X-MBX-USED-WEIGHT-1M", HeaderValue::from_static("120"));
        tracker.update_from_headers(&headers);
        assert_eq!(tracker.used(), 120);
    }

    #[test]
    fn garbage_header_is_ignored() {
        let tracker = WeightTracker::new();
        let mut headers = HeaderMap::new();
        headers.insert("X-MBX-USED-WEIGHT-1M", HeaderValue::from_static("lots"));
        tracker.update_from_headers(&headers);
        assert_eq!(tracker.used(), 0);
    }

    #[test]
    fn refuses_past_hard_limit() {
        let tracker = WeightTracker::new();
        tracker.record(WEIGHT_HARD_LIMIT - 10);
        assert!(tracker.check(10).is_ok());
        let err = tracker.check(11).unwrap_err();
        assert!(matches!(err, ExchangeError::RateLimited(_)));
        assert!(err.is_transient());
    }
}
