//! Per-source rate tracker (§4.D): a bounded, LRU-evicted table of
//! exponentially-windowed byte rates keyed by source address prefix.
//!
//! Generalized from the teacher's `security::rate_limit::rate::Rate`
//! dual-buffer (current/previous) sliding window. The teacher's version is
//! lock-free because a `RateLimiter` is shared across many tokio tasks; here
//! the tracker is owned solely by the forwarder's single task (§5), so the
//! dual buffers are plain fields instead of atomics, and capacity is bounded
//! with simple LRU eviction instead of the teacher's fixed-size
//! Count-Min Sketch (which never evicts, only ages out via reset).

use std::collections::HashMap;
use std::time::{Duration, Instant};

use crate::pipe::framing::{Priority, PRIORITY_MAX};

/// Identifies a source by its AllNet address prefix, matching the `nbits`
/// convention used throughout the overlay (only the first `nbits` bits of
/// `bytes` are significant; callers are expected to have already masked
/// trailing bits to zero).
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct SourceKey {
    pub bytes: [u8; 8],
    pub nbits: u8,
}

struct Slot {
    /// Window index this slot's `current` belongs to.
    window_index: u64,
    current: u64,
    previous: u64,
    last_used: u64,
}

impl Slot {
    /// Blends the tail of the previous window with whatever the current one
    /// has accumulated so far, weighted by how far into the current window
    /// `elapsed_fraction` is — the same sliding-window blend the teacher's
    /// `Rate` uses, so a burst is visible before a whole window elapses
    /// rather than only once `roll` shifts it into `previous`.
    fn rate_bytes_per_sec(&self, window_index: u64, elapsed_fraction: f64, window: Duration) -> f64 {
        let age = window_index.saturating_sub(self.window_index);
        let (prev, curr) = match age {
            0 => (self.previous, self.current),
            1 => (self.current, 0),
            _ => return 0.0,
        };
        let effective = prev as f64 * (1.0 - elapsed_fraction) + curr as f64;
        effective / window.as_secs_f64()
    }

    fn roll(&mut self, window_index: u64, bytes: u64) {
        if window_index == self.window_index {
            self.current += bytes;
        } else if window_index == self.window_index + 1 {
            self.previous = self.current;
            self.current = bytes;
            self.window_index = window_index;
        } else {
            self.previous = 0;
            self.current = bytes;
            self.window_index = window_index;
        }
    }
}

pub struct SourceRateTracker {
    window: Duration,
    start: Instant,
    capacity: usize,
    entries: HashMap<SourceKey, Slot>,
    use_counter: u64,
    aggregate: Slot,
}

impl SourceRateTracker {
    pub fn new(window: Duration, capacity: usize) -> Self {
        assert!(capacity > 0, "rate tracker needs at least one slot");
        Self {
            window,
            start: Instant::now(),
            capacity,
            entries: HashMap::new(),
            use_counter: 0,
            aggregate: Slot { window_index: 0, current: 0, previous: 0, last_used: 0 },
        }
    }

    /// Current window index and how far into it we are, as a fraction in
    /// `[0, 1)`.
    fn window_progress(&self) -> (u64, f64) {
        let elapsed_ns = self.start.elapsed().as_nanos();
        let window_ns = self.window.as_nanos().max(1);
        let window_index = (elapsed_ns / window_ns) as u64;
        let fraction = (elapsed_ns % window_ns) as f64 / window_ns as f64;
        (window_index, fraction)
    }

    /// Update the source's rate and return a priority fraction in
    /// `[PRIORITY_MIN, PRIORITY_MAX]` proportional to
    /// `bytes / (bytes + aggregate_rate)` (§4.D `observe`): a source that
    /// dominates the aggregate rate earns a lower priority.
    pub fn observe(&mut self, key: SourceKey, bytes: u64) -> Priority {
        let (window_index, elapsed_fraction) = self.window_progress();
        self.use_counter += 1;
        let use_counter = self.use_counter;

        self.aggregate.roll(window_index, bytes);
        let aggregate_rate = self.aggregate.rate_bytes_per_sec(window_index, elapsed_fraction, self.window);

        if !self.entries.contains_key(&key) && self.entries.len() >= self.capacity {
            self.evict_lru();
        }
        let slot = self.entries.entry(key).or_insert(Slot {
            window_index,
            current: 0,
            previous: 0,
            last_used: use_counter,
        });
        slot.roll(window_index, bytes);
        slot.last_used = use_counter;

        priority_fraction(bytes as f64, aggregate_rate)
    }

    /// Priority fraction to use when the packet's source cannot be
    /// identified (§4.D `largest_rate`): treats the single busiest known
    /// source as if it had just sent more traffic, so an unidentifiable
    /// sender never outranks a source that is already monopolising
    /// bandwidth. Returns `PRIORITY_MAX` when nothing is being tracked yet.
    pub fn largest_rate(&self) -> Priority {
        let (window_index, elapsed_fraction) = self.window_progress();
        let aggregate_rate = self.aggregate.rate_bytes_per_sec(window_index, elapsed_fraction, self.window);
        let busiest = self
            .entries
            .values()
            .map(|slot| slot.rate_bytes_per_sec(window_index, elapsed_fraction, self.window))
            .fold(0.0_f64, f64::max);
        if busiest == 0.0 && aggregate_rate == 0.0 {
            return PRIORITY_MAX;
        }
        priority_fraction(busiest, aggregate_rate)
    }

    fn evict_lru(&mut self) {
        if let Some(victim) = self
            .entries
            .iter()
            .min_by_key(|(_, slot)| slot.last_used)
            .map(|(key, _)| key.clone())
        {
            self.entries.remove(&victim);
        }
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }
}

/// A source monopolising the aggregate rate drives this toward 0, which the
/// forwarder's rate-limit step (§4.F step 4) treats as "drop" — `0` is
/// `PRIORITY_RESERVED` and is never itself sent on a pipe.
fn priority_fraction(bytes: f64, aggregate_rate: f64) -> Priority {
    let denom = bytes + aggregate_rate;
    let fraction = if denom <= 0.0 { 1.0 } else { bytes / denom };
    let scaled = (fraction * PRIORITY_MAX as f64).round();
    (scaled.clamp(0.0, PRIORITY_MAX as f64)) as Priority
}

#[cfg(test)]
mod tests {
    use super::*;

    fn key(byte: u8) -> SourceKey {
        SourceKey { bytes: [byte, 0, 0, 0, 0, 0, 0, 0], nbits: 8 }
    }

    #[test]
    fn observe_returns_priority_in_range() {
        let mut tracker = SourceRateTracker::new(Duration::from_secs(10), 16);
        let p = tracker.observe(key(1), 1000);
        assert!(p >= 1 && p <= PRIORITY_MAX);
    }

    #[test]
    fn largest_rate_is_max_with_no_history() {
        let tracker = SourceRateTracker::new(Duration::from_secs(10), 16);
        assert_eq!(tracker.largest_rate(), PRIORITY_MAX);
    }

    #[test]
    fn bounded_capacity_evicts_least_recently_used() {
        let mut tracker = SourceRateTracker::new(Duration::from_secs(10), 2);
        tracker.observe(key(1), 10);
        tracker.observe(key(2), 10);
        // touch key(1) again so key(2) becomes the LRU victim
        tracker.observe(key(1), 10);
        tracker.observe(key(3), 10);
        assert_eq!(tracker.len(), 2);
        assert!(tracker.entries.contains_key(&key(1)));
        assert!(tracker.entries.contains_key(&key(3)));
        assert!(!tracker.entries.contains_key(&key(2)));
    }
}
