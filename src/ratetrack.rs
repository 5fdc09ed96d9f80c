//! Sliding-window event rate tracking
//!
//! A ring of per-second bins over a fixed horizon, used for the completion
//! throughput shown by `/counts?window=N`. Bin `N-1` always covers the
//! current second; adding an event first scrolls the ring so that holds.
//! Clock movement is tolerated: a small backwards jump shifts history (losing
//! the bins that are now in the future), a jump outside the window of
//! interest resets the ring entirely.

use chrono::Utc;
use serde::{Deserialize, Serialize};

/// Default number of one-second bins kept by a [`RateTracker`].
pub const DEFAULT_RATE_TRACKER_BINS: usize = 128;

/// Sliding window of per-second event counts.
#[derive(Debug, Clone, PartialEq)]
pub struct RateTracker {
    first_bin_time: i64,
    bins: Vec<i64>,
}

/// Serializable form of a rate tracker.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "PascalCase")]
pub struct EncodedRateTracker {
    pub first_bin_time: i64,
    pub bins: Vec<i64>,
}

impl RateTracker {
    /// Creates a tracker keeping `history_size` seconds of counts. Zero
    /// selects [`DEFAULT_RATE_TRACKER_BINS`].
    pub fn new(history_size: usize) -> Self {
        let size = if history_size == 0 {
            DEFAULT_RATE_TRACKER_BINS
        } else {
            history_size
        };
        Self {
            first_bin_time: 0,
            bins: vec![0; size],
        }
    }

    /// Restores a tracker from its encoded form. An empty encoding yields a
    /// fresh default-sized tracker.
    pub fn decode(obj: EncodedRateTracker) -> Self {
        if obj.bins.is_empty() {
            return Self::new(0);
        }
        Self {
            first_bin_time: obj.first_bin_time,
            bins: obj.bins,
        }
    }

    pub fn encode(&self) -> EncodedRateTracker {
        EncodedRateTracker {
            first_bin_time: self.first_bin_time,
            bins: self.bins.clone(),
        }
    }

    pub fn history_size(&self) -> usize {
        self.bins.len()
    }

    /// Zeroes the counters, keeping the window position.
    pub fn reset(&mut self) {
        self.bins.fill(0);
    }

    /// Adds `n` events to the current second.
    pub fn add(&mut self, n: i64) {
        self.add_at(Utc::now().timestamp(), n);
    }

    /// Like [`RateTracker::add`] with an explicit current time (epoch secs).
    pub fn add_at(&mut self, cur_time: i64, n: i64) {
        self.truncate_and_shift(cur_time);
        let last = self.bins.len() - 1;
        self.bins[last] += n;
    }

    /// Events counted over the last `t` seconds. `t` must not exceed the
    /// history size.
    pub fn count(&self, t: usize) -> i64 {
        self.count_at(Utc::now().timestamp(), t)
    }

    /// Like [`RateTracker::count`] with an explicit current time.
    ///
    /// Sums bins by the absolute second they cover, so it needs no mutable
    /// access: seconds outside the stored window contribute zero, exactly as
    /// if the ring had been scrolled first.
    pub fn count_at(&self, cur_time: i64, t: usize) -> i64 {
        assert!(t <= self.bins.len(), "rate window exceeds history size");
        let mut total = 0;
        for second in (cur_time - t as i64 + 1)..=cur_time {
            let idx = second - self.first_bin_time;
            if (0..self.bins.len() as i64).contains(&idx) {
                total += self.bins[idx as usize];
            }
        }
        total
    }

    fn truncate_and_shift(&mut self, cur_time: i64) {
        let n = self.bins.len() as i64;
        let last_bin_time = self.first_bin_time + n - 1;

        if cur_time < self.first_bin_time || cur_time >= last_bin_time + n {
            // No overlap with the window of interest: start over.
            self.first_bin_time = cur_time - (n - 1);
            self.bins.fill(0);
        } else if cur_time < last_bin_time {
            // The clock moved slightly backwards and the last bin is in the
            // future. Rare, and we lose the newest history when it happens.
            let backtrack = (last_bin_time - cur_time) as usize;
            self.first_bin_time -= backtrack as i64;
            let bins_len = self.bins.len();
            self.bins.copy_within(0..bins_len - backtrack, backtrack);
            self.bins[..backtrack].fill(0);
        } else if cur_time > last_bin_time {
            let forward = (cur_time - last_bin_time) as usize;
            self.first_bin_time += forward as i64;
            self.bins.copy_within(forward.., 0);
            let start = self.bins.len() - forward;
            self.bins[start..].fill(0);
        }
    }
}

impl Default for RateTracker {
    fn default() -> Self {
        Self::new(0)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    const T0: i64 = 1_700_000_000;

    #[test]
    fn test_default_history_size() {
        assert_eq!(RateTracker::new(0).history_size(), DEFAULT_RATE_TRACKER_BINS);
        assert_eq!(RateTracker::new(16).history_size(), 16);
    }

    #[test]
    fn test_add_and_count_single_second() {
        let mut r = RateTracker::new(8);
        r.add_at(T0, 3);
        r.add_at(T0, 2);

        assert_eq!(r.count_at(T0, 1), 5);
        assert_eq!(r.count_at(T0, 8), 5);
    }

    #[test]
    fn test_window_sum_over_multiple_seconds() {
        let mut r = RateTracker::new(8);
        r.add_at(T0, 1);
        r.add_at(T0 + 1, 2);
        r.add_at(T0 + 2, 4);

        assert_eq!(r.count_at(T0 + 2, 1), 4);
        assert_eq!(r.count_at(T0 + 2, 2), 6);
        assert_eq!(r.count_at(T0 + 2, 3), 7);
    }

    #[test]
    fn test_old_events_scroll_out() {
        let mut r = RateTracker::new(4);
        r.add_at(T0, 10);
        r.add_at(T0 + 3, 1);

        // T0 is still the oldest bin of a 4-bin window ending at T0+3.
        assert_eq!(r.count_at(T0 + 3, 4), 11);

        r.add_at(T0 + 4, 1);
        // Now the T0 bin has scrolled off.
        assert_eq!(r.count_at(T0 + 4, 4), 2);
    }

    #[test]
    fn test_large_jump_resets() {
        let mut r = RateTracker::new(8);
        r.add_at(T0, 100);
        r.add_at(T0 + 1_000, 1);

        assert_eq!(r.count_at(T0 + 1_000, 8), 1);
    }

    #[test]
    fn test_backwards_jump_loses_future_bins() {
        let mut r = RateTracker::new(8);
        r.add_at(T0, 5);
        r.add_at(T0 - 2, 1);

        // The T0 bin was two seconds in the future after the jump; its count
        // is gone, the new event remains.
        assert_eq!(r.count_at(T0 - 2, 1), 1);
        assert_eq!(r.count_at(T0 - 2, 8), 1);
    }

    #[test]
    fn test_count_before_window_is_zero() {
        let mut r = RateTracker::new(8);
        r.add_at(T0, 5);
        assert_eq!(r.count_at(T0 - 100, 8), 0);
    }

    #[test]
    #[should_panic(expected = "rate window exceeds history size")]
    fn test_count_beyond_history_panics() {
        let r = RateTracker::new(4);
        r.count_at(T0, 5);
    }

    #[test]
    fn test_reset_keeps_window_position() {
        let mut r = RateTracker::new(8);
        r.add_at(T0, 5);
        r.reset();

        assert_eq!(r.count_at(T0, 8), 0);
        r.add_at(T0, 2);
        assert_eq!(r.count_at(T0, 1), 2);
    }

    #[test]
    fn test_encode_decode_round_trip() {
        let mut r = RateTracker::new(8);
        r.add_at(T0, 3);
        r.add_at(T0 + 1, 4);

        let decoded = RateTracker::decode(r.encode());
        assert_eq!(decoded, r);
        assert_eq!(decoded.count_at(T0 + 1, 2), 7);
    }

    #[test]
    fn test_decode_empty_yields_default() {
        let decoded = RateTracker::decode(EncodedRateTracker {
            first_bin_time: 0,
            bins: Vec::new(),
        });
        assert_eq!(decoded.history_size(), DEFAULT_RATE_TRACKER_BINS);
    }
}
