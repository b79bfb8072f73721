//! Background migration worker: a single OS thread parked on a periodic
//! sleep, driving [`crate::tier::TierMemory::ranking_update`] once per
//! period until told to stop.
//!
//! Grounded in `spec.md` §5's "timer-driven task" note and the teacher's
//! convention of modeling background work as a plain `std::thread` rather
//! than a custom scheduler. Shutdown is a `Drop` impl that flips an
//! `AtomicBool` and joins, draining one final cycle first so no queued
//! touch/new-page event is silently lost when the engine is torn down.

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::thread::JoinHandle;
use std::time::{Duration, Instant};

use log::{info, warn};

use crate::tier::TierMemory;

/// Owns the background thread driving periodic `ranking_update` calls.
/// A no-op for ratio/threshold policies, since `TierMemory::ranking_update`
/// itself is a no-op there -- the worker still runs, just does nothing
/// each period, which keeps the shutdown/join path uniform across policies
/// rather than conditionally spawning.
pub struct Worker {
    stop: Arc<AtomicBool>,
    handle: Option<JoinHandle<()>>,
}

impl Worker {
    pub fn spawn(tier: Arc<TierMemory>, period: Duration, stale_cutoff_ns: u64) -> Self {
        let stop = Arc::new(AtomicBool::new(false));
        let stop_for_thread = Arc::clone(&stop);
        let start = Instant::now();

        let handle = std::thread::Builder::new()
            .name("tiermalloc-worker".into())
            .spawn(move || {
                info!("migration worker started, period={:?}", period);
                while !stop_for_thread.load(Ordering::Relaxed) {
                    std::thread::sleep(period);
                    let ts = start.elapsed().as_nanos() as u64;
                    tier.ranking_update(ts, stale_cutoff_ns);
                }
                let ts = start.elapsed().as_nanos() as u64;
                tier.ranking_update(ts, stale_cutoff_ns);
                info!("migration worker stopped");
            })
            .expect("failed to spawn migration worker thread");

        Worker { stop, handle: Some(handle) }
    }

    pub fn stop(&mut self) {
        self.stop.store(true, Ordering::Relaxed);
        if let Some(handle) = self.handle.take() {
            if handle.join().is_err() {
                warn!("migration worker thread panicked during shutdown");
            }
        }
    }
}

impl Drop for Worker {
    fn drop(&mut self) {
        self.stop();
    }
}
