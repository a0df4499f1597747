//! Global topic-alias accounting
//!
//! Every v5 channel that is granted a topic-alias maximum reserves that
//! many slots from one shared pool, so a fleet of connections cannot
//! grow alias tables without bound. Slots are returned when the channel
//! tears down.

use std::sync::atomic::{AtomicU64, Ordering};

/// Tracks topic-alias slots in use across all channels
pub struct TopicAliasLimiter {
    limit: u64,
    in_use: AtomicU64,
}

impl TopicAliasLimiter {
    pub fn new(limit: u64) -> Self {
        Self {
            limit,
            in_use: AtomicU64::new(0),
        }
    }

    /// Whether there is headroom to grant another channel its alias table
    pub fn aliases_available(&self) -> bool {
        self.in_use.load(Ordering::Acquire) < self.limit
    }

    /// Reserve `count` slots for a channel
    pub fn init_usage(&self, count: u16) {
        self.in_use.fetch_add(count as u64, Ordering::AcqRel);
    }

    /// Headroom check and reservation as one atomic step. Concurrent
    /// admissions race on the same pool; checking and reserving in two
    /// calls would let both through past the limit. Returns false when
    /// no headroom is left.
    pub fn try_reserve(&self, count: u16) -> bool {
        let count = count as u64;
        let mut current = self.in_use.load(Ordering::Acquire);
        loop {
            if current >= self.limit {
                return false;
            }
            match self.in_use.compare_exchange_weak(
                current,
                current + count,
                Ordering::AcqRel,
                Ordering::Acquire,
            ) {
                Ok(_) => return true,
                Err(actual) => current = actual,
            }
        }
    }

    /// Return a channel's slots to the pool
    pub fn release_usage(&self, count: u16) {
        let count = count as u64;
        let mut current = self.in_use.load(Ordering::Acquire);
        loop {
            let next = current.saturating_sub(count);
            match self.in_use.compare_exchange_weak(
                current,
                next,
                Ordering::AcqRel,
                Ordering::Acquire,
            ) {
                Ok(_) => return,
                Err(actual) => current = actual,
            }
        }
    }

    /// Slots currently reserved
    pub fn in_use(&self) -> u64 {
        self.in_use.load(Ordering::Acquire)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_limiter_headroom() {
        let limiter = TopicAliasLimiter::new(10);
        assert!(limiter.aliases_available());

        limiter.init_usage(10);
        assert!(!limiter.aliases_available());
        assert_eq!(limiter.in_use(), 10);

        limiter.release_usage(4);
        assert!(limiter.aliases_available());
        assert_eq!(limiter.in_use(), 6);
    }

    #[test]
    fn test_release_never_underflows() {
        let limiter = TopicAliasLimiter::new(10);
        limiter.init_usage(3);
        limiter.release_usage(5);
        assert_eq!(limiter.in_use(), 0);
    }

    #[test]
    fn test_try_reserve_checks_and_reserves_in_one_step() {
        let limiter = TopicAliasLimiter::new(10);
        assert!(limiter.try_reserve(4));
        assert!(limiter.try_reserve(4));
        // 8 slots in use, headroom remains: the last grant may overshoot
        assert!(limiter.try_reserve(4));
        assert_eq!(limiter.in_use(), 12);
        assert!(!limiter.try_reserve(4), "exhausted pool refuses");
        assert_eq!(limiter.in_use(), 12, "a refused reserve changes nothing");

        limiter.release_usage(4);
        assert!(limiter.try_reserve(4));
    }

    #[test]
    fn test_try_reserve_is_race_free() {
        let limiter = std::sync::Arc::new(TopicAliasLimiter::new(1));
        let handles: Vec<_> = (0..8)
            .map(|_| {
                let limiter = limiter.clone();
                std::thread::spawn(move || limiter.try_reserve(1))
            })
            .collect();

        let granted = handles
            .into_iter()
            .map(|handle| handle.join().unwrap())
            .filter(|granted| *granted)
            .count();
        assert_eq!(granted, 1, "a pool of one slot admits exactly one channel");
        assert_eq!(limiter.in_use(), 1);
    }
}
