//! The migration engine: periodically drains the new-page and touch queues
//! into a near/far pair of [`Ranking`]s, enforces the configured byte
//! limits between them, and runs a "balance hotness" pass that swaps hot
//! far pages for cold near pages.
//!
//! Grounded in `original_source/src/mtt_internals.c`'s
//! `mtt_internals_ranking_update`, which runs the same three phases in the
//! same order: (1) drain queues, (2) enforce `low`/`soft` against the near
//! ranking's total size, (3) balance while the far ranking's hottest page
//! outranks the near ranking's coldest. `hard` is validated by
//! [`crate::config`] but, matching the original's own unfinished
//! direct-to-far placement path, is not yet enforced here -- see the
//! `hard_limit` entry in `DESIGN.md`.

use std::sync::Arc;

use log::{error, info};

use crate::config::{Config, Limits};
use crate::error::Result;
use crate::queues::{MmapTracingQueue, MultithreadedTouchQueue};
use crate::ranking::{PageMetadata, Ranking, Timestamp};
use crate::stats::Stats;

/// Abstracts the OS page-migration primitive so the engine can be tested
/// without root/NUMA privileges. Grounded in
/// `original_source/src/lib/tachanka.c`'s `move_page`, which wraps
/// `move_pages(2)` the same way.
pub trait PageMover: Send + Sync {
    /// Moves `nof_pages` traced pages starting at `addr` to NUMA node
    /// `node`. Returns `Ok(())` on success; the caller has already
    /// committed the ranking move by the time this is called, so a
    /// failure here is logged and surfaced, never rolled back.
    fn move_pages(&self, addr: usize, nof_pages: usize, node: i32) -> Result<()>;
}

/// A mover that does nothing. Used by tests and by any configuration that
/// wants pure bookkeeping without touching physical placement.
pub struct NoopMover;

impl PageMover for NoopMover {
    fn move_pages(&self, _addr: usize, _nof_pages: usize, _node: i32) -> Result<()> {
        Ok(())
    }
}

/// Real `move_pages(2)`-backed mover. On non-Linux targets every call
/// fails, matching [`crate::os::move_pages`]'s fallback.
pub struct SyscallMover;

impl PageMover for SyscallMover {
    fn move_pages(&self, addr: usize, nof_pages: usize, node: i32) -> Result<()> {
        use crate::pagesizes::TRACED_PAGESIZE;

        let addrs: Vec<*mut libc::c_void> =
            (0..nof_pages).map(|i| (addr + i * TRACED_PAGESIZE) as *mut libc::c_void).collect();
        let nodes = vec![node; nof_pages];
        let mut status = vec![0i32; nof_pages];
        if crate::os::move_pages(0, &addrs, &nodes, &mut status) && status.iter().all(|&s| s == 0) {
            Ok(())
        } else {
            Err(crate::error::TierError::unavailable(format!(
                "move_pages failed for {} pages at {:#x}",
                nof_pages, addr
            )))
        }
    }
}

/// NUMA node identifiers the engine moves pages between. Near is where
/// mutators expect their hot data to live; far is the overflow tier.
#[derive(Debug, Clone, Copy)]
pub struct NumaTarget {
    pub near_node: i32,
    pub far_node: i32,
}

struct MttInternals {
    near: Ranking,
    far: Ranking,
    limits: Limits,
}

impl MttInternals {
    fn new(limits: Limits) -> Self {
        MttInternals { near: Ranking::new(), far: Ranking::new(), limits }
    }

    /// Drains `new_pages` into `near` (newly mapped memory is always born
    /// in the near ranking, per `spec.md` §4.7's `near_ranking.add_pages`
    /// step and the §4.7 state machine note "on `add_pages` it is born in
    /// `Near`") and applies every queued touch to whichever ranking
    /// currently owns the page.
    fn drain_queues(
        &mut self,
        new_pages: &MmapTracingQueue,
        touches: &MultithreadedTouchQueue,
        ts: Timestamp,
    ) {
        for (start, nof_pages) in new_pages.take_all() {
            self.near.add_pages(start, nof_pages, ts);
        }
        for addr in touches.take_all() {
            if !self.near.touch(addr) {
                self.far.touch(addr);
            }
        }
    }

    /// Phase 2: keeps the near ranking's total size within `[low, soft]`
    /// by promoting far's hottest pages (when under `low`) or demoting
    /// near's coldest pages (when over `soft`). Mirrors the original's
    /// mutually-exclusive `if (dram < low) ... else if (dram > soft) ...`
    /// branch -- never both in the same update.
    fn enforce_limits(&mut self, mover: &dyn PageMover, target: NumaTarget, stats: &Stats) {
        if self.near.total_size() < self.limits.low {
            while self.near.total_size() < self.limits.low {
                let Some(page) = self.far.pop_hottest() else { break };
                self.move_and_reinsert(page, mover, target.near_node, true, stats);
            }
        } else if self.near.total_size() > self.limits.soft {
            while self.near.total_size() > self.limits.soft {
                let Some(page) = self.near.pop_coldest() else { break };
                self.move_and_reinsert(page, mover, target.far_node, false, stats);
            }
        }
    }

    /// Phase 3: while the far ranking's hottest page is strictly hotter
    /// than the near ranking's coldest, swap them. Strict `>` is what
    /// guarantees termination -- a tie stops the loop rather than
    /// thrashing the same two pages back and forth forever.
    fn balance_hotness(&mut self, mover: &dyn PageMover, target: NumaTarget, stats: &Stats) {
        loop {
            let (Some(far_hot), Some(near_cold)) = (self.far.peek_hottest(), self.near.peek_coldest()) else {
                break;
            };
            if far_hot <= near_cold {
                break;
            }
            let hot = self.far.pop_hottest().expect("peeked above");
            let cold = self.near.pop_coldest().expect("peeked above");
            self.move_and_reinsert(hot, mover, target.near_node, true, stats);
            self.move_and_reinsert(cold, mover, target.far_node, false, stats);
        }
    }

    /// Ranking membership is updated before the mover is invoked, per
    /// `SPEC_FULL.md` §4.7's failure-handling note: a `move_pages` failure
    /// after this point is logged as fatal-to-the-move (not to the
    /// process) and never rolled back, since unwinding the ranking state
    /// would require knowing the page's *physical* location, which the
    /// failed syscall leaves ambiguous.
    fn move_and_reinsert(
        &mut self,
        page: PageMetadata,
        mover: &dyn PageMover,
        node: i32,
        to_near: bool,
        stats: &Stats,
    ) {
        let addr = page.start_addr();
        if to_near {
            self.near.insert_page(page);
            stats.promotions.increase(1);
        } else {
            self.far.insert_page(page);
            stats.demotions.increase(1);
        }
        if let Err(err) = mover.move_pages(addr, 1, node) {
            error!("page move for {:#x} to node {} failed, ranking already updated: {}", addr, node, err);
        }
    }
}

/// The migration engine. Owns both rankings and is driven by
/// [`crate::worker::Worker`] on a fixed period; `spec.md` §5 describes the
/// rankings as owned exclusively by the worker thread, but this crate
/// wraps them in a mutex anyway so that stats can be read from other
/// threads without needing a second, racier bookkeeping path -- see the
/// corresponding `DESIGN.md` resolution.
pub struct Mtt {
    internals: parking_lot::Mutex<MttInternals>,
    new_pages: Arc<MmapTracingQueue>,
    touches: Arc<MultithreadedTouchQueue>,
    mover: Box<dyn PageMover>,
    target: NumaTarget,
    stats: Stats,
}

impl Mtt {
    pub fn new(
        config: &Config,
        new_pages: Arc<MmapTracingQueue>,
        touches: Arc<MultithreadedTouchQueue>,
        mover: Box<dyn PageMover>,
        target: NumaTarget,
    ) -> Self {
        Mtt {
            internals: parking_lot::Mutex::new(MttInternals::new(config.limits)),
            new_pages,
            touches,
            mover,
            target,
            stats: Stats::default(),
        }
    }

    /// Runs one full update cycle: drain queues, enforce limits, balance
    /// hotness. Called periodically by the background worker.
    pub fn ranking_update(&self, ts: Timestamp, stale_cutoff: Timestamp) {
        let mut internals = self.internals.lock();
        internals.drain_queues(&self.new_pages, &self.touches, ts);
        internals.near.update(ts, stale_cutoff);
        internals.far.update(ts, stale_cutoff);
        internals.enforce_limits(self.mover.as_ref(), self.target, &self.stats);
        internals.balance_hotness(self.mover.as_ref(), self.target, &self.stats);
        self.stats.ranking_updates.increase(1);
        info!(
            "ranking_update: near={} bytes, far={} bytes",
            internals.near.total_size(),
            internals.far.total_size()
        );
    }

    pub fn stats(&self) -> &Stats {
        &self.stats
    }

    pub fn near_total_size(&self) -> usize {
        self.internals.lock().near.total_size()
    }

    pub fn far_total_size(&self) -> usize {
        self.internals.lock().far.total_size()
    }

    pub fn push_new_pages(&self, start: usize, nof_pages: usize) -> Result<()> {
        self.new_pages.push((start, nof_pages))
    }

    pub fn push_touch(&self, addr: usize) -> Result<()> {
        self.touches.push(addr)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::pagesizes::TRACED_PAGESIZE;

    fn limits(low: usize, soft: usize, hard: usize) -> Limits {
        Limits { low, soft, hard }
    }

    fn target() -> NumaTarget {
        NumaTarget { near_node: 0, far_node: 1 }
    }

    #[test]
    fn new_pages_start_on_near_ranking() {
        let new_pages = Arc::new(MmapTracingQueue::new().unwrap());
        let touches = Arc::new(MultithreadedTouchQueue::new().unwrap());
        let mtt = Mtt::new(
            &Config {
                policy: crate::config::TierPolicy::DataMovement,
                limits: limits(0, usize::MAX - usize::MAX % TRACED_PAGESIZE, usize::MAX - usize::MAX % TRACED_PAGESIZE),
                tier_ratios: vec![],
                size_thresholds: vec![],
                ranking_update_period_ms: 1000,
                stale_touch_cutoff_ms: 1000,
                hog_memory: false,
            },
            new_pages.clone(),
            touches.clone(),
            Box::new(NoopMover),
            target(),
        );

        mtt.push_new_pages(0x1000, 4).unwrap();
        mtt.ranking_update(0, 1_000_000_000);
        assert_eq!(mtt.near_total_size(), 4 * TRACED_PAGESIZE);
        assert_eq!(mtt.far_total_size(), 0);
    }

    #[test]
    fn over_soft_limit_demotes_near_pages_to_far() {
        let new_pages = Arc::new(MmapTracingQueue::new().unwrap());
        let touches = Arc::new(MultithreadedTouchQueue::new().unwrap());
        // four fresh pages are born in near; with soft capped below that,
        // the first update must immediately demote the excess to far.
        let cfg = Config {
            policy: crate::config::TierPolicy::DataMovement,
            limits: limits(0, 2 * TRACED_PAGESIZE, 8 * TRACED_PAGESIZE),
            tier_ratios: vec![],
            size_thresholds: vec![],
            ranking_update_period_ms: 1000,
            stale_touch_cutoff_ms: 1000,
            hog_memory: false,
        };
        let mtt = Mtt::new(&cfg, new_pages.clone(), touches.clone(), Box::new(NoopMover), target());

        mtt.push_new_pages(0x1000, 4).unwrap();
        mtt.ranking_update(0, 1_000_000_000);
        assert_eq!(mtt.near_total_size(), 2 * TRACED_PAGESIZE);
        assert_eq!(mtt.far_total_size(), 2 * TRACED_PAGESIZE);
    }

    #[test]
    fn under_low_limit_promotes_far_pages_to_near() {
        let new_pages = Arc::new(MmapTracingQueue::new().unwrap());
        let touches = Arc::new(MultithreadedTouchQueue::new().unwrap());
        // demote everything to far first (soft = 0), then raise low above
        // zero and confirm the next update promotes pages back to near.
        let cfg = Config {
            policy: crate::config::TierPolicy::DataMovement,
            limits: limits(0, 0, 8 * TRACED_PAGESIZE),
            tier_ratios: vec![],
            size_thresholds: vec![],
            ranking_update_period_ms: 1000,
            stale_touch_cutoff_ms: 1000,
            hog_memory: false,
        };
        let mtt = Mtt::new(&cfg, new_pages.clone(), touches.clone(), Box::new(NoopMover), target());

        mtt.push_new_pages(0x1000, 4).unwrap();
        mtt.ranking_update(0, 1_000_000_000);
        assert_eq!(mtt.near_total_size(), 0);
        assert_eq!(mtt.far_total_size(), 4 * TRACED_PAGESIZE);

        {
            let mut internals = mtt.internals.lock();
            internals.limits = limits(2 * TRACED_PAGESIZE, 4 * TRACED_PAGESIZE, 8 * TRACED_PAGESIZE);
        }
        mtt.ranking_update(1_000_000_000, 1_000_000_000);
        assert!(mtt.near_total_size() >= 2 * TRACED_PAGESIZE);
    }

    /// Mirrors `spec.md` §8 scenario 1 end-to-end: eight fresh pages land in
    /// near; dropping `soft` to `4·P_T` demotes the four coldest to far;
    /// heavily touching one of the demoted pages promotes it back.
    #[test]
    fn hot_demoted_page_promotes_back_to_near() {
        let new_pages = Arc::new(MmapTracingQueue::new().unwrap());
        let touches = Arc::new(MultithreadedTouchQueue::new().unwrap());
        let cfg = Config {
            policy: crate::config::TierPolicy::DataMovement,
            limits: limits(0, 4 * TRACED_PAGESIZE, 8 * TRACED_PAGESIZE),
            tier_ratios: vec![],
            size_thresholds: vec![],
            ranking_update_period_ms: 1000,
            stale_touch_cutoff_ms: 1000,
            hog_memory: false,
        };
        let mtt = Mtt::new(&cfg, new_pages.clone(), touches.clone(), Box::new(NoopMover), target());

        mtt.push_new_pages(0x1000, 8).unwrap();
        mtt.ranking_update(0, 1_000_000_000);
        assert_eq!(mtt.near_total_size(), 4 * TRACED_PAGESIZE);
        assert_eq!(mtt.far_total_size(), 4 * TRACED_PAGESIZE);

        // demoted pages carry zero hotness; the coldest (first-indexed)
        // four were pushed out, so 0x1000 landed on far.
        let demoted_page = 0x1000usize;
        for _ in 0..1000 {
            mtt.push_touch(demoted_page).unwrap();
        }
        mtt.ranking_update(2_000_000_000, 1_000_000_000);
        // the heavily touched page must have migrated back to near via the
        // balance-hotness pass.
        assert_eq!(mtt.near_total_size(), 4 * TRACED_PAGESIZE);
        assert!(mtt.internals.lock().near.contains(demoted_page));
        assert!(!mtt.internals.lock().far.contains(demoted_page));
    }

    #[test]
    fn balance_hotness_stops_on_tie() {
        // one page promoted to near, one left on far, both at zero
        // hotness: strict `>` in the balance loop must treat the tie as
        // "nothing to do" rather than swapping them back and forth.
        let new_pages = Arc::new(MmapTracingQueue::new().unwrap());
        let touches = Arc::new(MultithreadedTouchQueue::new().unwrap());
        let cfg = Config {
            policy: crate::config::TierPolicy::DataMovement,
            limits: limits(TRACED_PAGESIZE, TRACED_PAGESIZE, 8 * TRACED_PAGESIZE),
            tier_ratios: vec![],
            size_thresholds: vec![],
            ranking_update_period_ms: 1000,
            stale_touch_cutoff_ms: 1000,
            hog_memory: false,
        };
        let mtt = Mtt::new(&cfg, new_pages.clone(), touches.clone(), Box::new(NoopMover), target());

        mtt.push_new_pages(0x1000, 2).unwrap();
        mtt.ranking_update(0, 1_000_000_000);
        assert_eq!(mtt.near_total_size(), TRACED_PAGESIZE);
        assert_eq!(mtt.far_total_size(), TRACED_PAGESIZE);

        mtt.ranking_update(1_000_000_000, 1_000_000_000);
        assert_eq!(mtt.near_total_size(), TRACED_PAGESIZE);
        assert_eq!(mtt.far_total_size(), TRACED_PAGESIZE);
    }
}
