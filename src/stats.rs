//! Atomic counters, same shape as the teacher's `stats.rs`: current value,
//! observed peak, running totals of increases/decreases. `std`'s
//! `fetch_max`, unlike the teacher's era, is stable, so the peak tracking
//! no longer needs the CAS-retry loop the teacher's comment flags as a
//! workaround.

use std::sync::atomic::{AtomicI64, AtomicU64, Ordering};

#[derive(Debug, Default)]
pub struct StatCount {
    current: AtomicI64,
    peak: AtomicI64,
    allocated: AtomicU64,
    freed: AtomicU64,
}

impl StatCount {
    pub fn increase(&self, amount: i64) {
        self.update(amount)
    }

    pub fn decrease(&self, amount: i64) {
        self.update(-amount)
    }

    fn update(&self, amount: i64) {
        if amount == 0 {
            return;
        }
        let current = self.current.fetch_add(amount, Ordering::Relaxed) + amount;
        self.peak.fetch_max(current, Ordering::Relaxed);

        if amount > 0 {
            self.allocated.fetch_add(amount as u64, Ordering::Relaxed);
        } else {
            self.freed.fetch_add((-amount) as u64, Ordering::Relaxed);
        }
    }

    pub fn current(&self) -> i64 {
        self.current.load(Ordering::Relaxed)
    }

    pub fn peak(&self) -> i64 {
        self.peak.load(Ordering::Relaxed)
    }
}

#[derive(Debug, Default)]
pub struct StatCounter {
    total: AtomicU64,
}

impl StatCounter {
    pub fn increase(&self, amount: u64) {
        self.total.fetch_add(amount, Ordering::Relaxed);
    }

    pub fn total(&self) -> u64 {
        self.total.load(Ordering::Relaxed)
    }
}

/// Allocator-wide counters. One instance lives inside the engine; every
/// bigary/slab/pool/ranking op bumps the counters relevant to it.
#[derive(Debug, Default)]
pub struct Stats {
    pub reserved: StatCount,
    pub committed: StatCount,
    pub mmap_calls: StatCounter,
    pub commit_calls: StatCounter,
    pub promotions: StatCounter,
    pub demotions: StatCounter,
    pub ranking_updates: StatCounter,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn tracks_current_and_peak() {
        let s = StatCount::default();
        s.increase(100);
        s.increase(50);
        s.decrease(30);
        assert_eq!(s.current(), 120);
        assert_eq!(s.peak(), 150);
    }

    #[test]
    fn counter_accumulates() {
        let c = StatCounter::default();
        c.increase(3);
        c.increase(4);
        assert_eq!(c.total(), 7);
    }
}
