//! Page-granularity hotness ranking: an exponentially decaying "temperature"
//! per traced page, plus ordered views by hotness and by last-touch time.
//!
//! Grounded in `original_source/include/memkind/internal/ranking_internals.hpp`
//! and `ranking_internals.cpp`. The original keys its indexes by raw
//! `PageMetadata*` held in `std::multimap`/`std::unordered_map`; per
//! `SPEC_FULL.md` §4.6 this crate keys by page start address (`usize`)
//! instead, since the migration worker is the ranking's sole owner (§5) and
//! raw pointers buy nothing a `HashMap`/`BTreeMap` keyed by address doesn't
//! already give safely.

use std::collections::{BTreeMap, BTreeSet, HashMap, HashSet};

use crate::pagesizes::TRACED_PAGESIZE;

/// Cap on how many stale (not-recently-touched) pages a single
/// `ranking_update` call will force-refresh. With a 4 KiB traced page this
/// bounds one refresh cycle to 4 MiB of metadata work. Carried over from
/// `ranking_internals.cpp`'s `TO_TOUCH_MAX`.
pub const TO_TOUCH_MAX: usize = 1024;

/// Per-second decay constants for the four parallel hotness accumulators.
/// Carried over verbatim from `EXPONENTIAL_COEFFS_VALS`.
const DECAY: [f64; 4] = [0.9, 0.99, 0.999, 0.9999];

/// Compensation factors equalizing each accumulator's nominal retention
/// time, carried over verbatim from `EXPONENTIAL_COEFFS_CONMPENSATION_COEFFS`.
const COMPENSATION: [f64; 4] = [1.0, 0.0953899645, 0.00949597036, 0.000949169617];

/// Timestamps throughout the migration engine are nanoseconds since an
/// arbitrary epoch (matching the original's `TIMESTAMP_TO_SECONDS_COEFF =
/// 1e-9`), so that the background worker can derive them from
/// `Instant::elapsed` without touching the wall clock.
pub type Timestamp = u64;

const NANOS_PER_SECOND: f64 = 1_000_000_000.0;

#[derive(Debug, Clone, Copy, PartialEq)]
struct HotnessKey(f64);

impl Eq for HotnessKey {}

impl Ord for HotnessKey {
    fn cmp(&self, other: &Self) -> std::cmp::Ordering {
        self.0.total_cmp(&other.0)
    }
}

impl PartialOrd for HotnessKey {
    fn partial_cmp(&self, other: &Self) -> Option<std::cmp::Ordering> {
        Some(self.cmp(other))
    }
}

/// Per-page decaying hotness plus bookkeeping for the current update period.
#[derive(Debug, Clone)]
pub struct PageMetadata {
    start_addr: usize,
    accumulators: [f64; 4],
    touches_this_period: u64,
    touched_this_period: bool,
    last_update_ts: Timestamp,
    last_touch_ts: Timestamp,
}

impl PageMetadata {
    fn new(start_addr: usize, init_hotness: f64, ts: Timestamp) -> Self {
        PageMetadata {
            start_addr,
            accumulators: [init_hotness / DECAY.len() as f64; 4],
            touches_this_period: 0,
            touched_this_period: false,
            last_update_ts: ts,
            last_touch_ts: ts,
        }
    }

    pub fn start_addr(&self) -> usize {
        self.start_addr
    }

    pub fn hotness(&self) -> f64 {
        self.accumulators.iter().sum()
    }

    pub fn last_touch_timestamp(&self) -> Timestamp {
        self.last_touch_ts
    }

    /// Marks a touch in the current period; returns `true` if this is the
    /// first touch since the last `update` (the page needs to move to
    /// `pages-to-update`).
    fn touch(&mut self) -> bool {
        self.touches_this_period += 1;
        self.touch_empty()
    }

    /// Marks the page as needing a refresh without contributing a touch
    /// count -- used by the stale-bucket scan in `ranking_update` step 1,
    /// which wants the decay applied but no hotness bump.
    fn touch_empty(&mut self) -> bool {
        let first = !self.touched_this_period;
        self.touched_this_period = true;
        first
    }

    fn update(&mut self, ts: Timestamp) {
        let seconds = ts.saturating_sub(self.last_update_ts) as f64 / NANOS_PER_SECOND;
        for (acc, decay) in self.accumulators.iter_mut().zip(DECAY) {
            *acc *= decay.powf(seconds);
        }
        if self.touched_this_period {
            let touches = self.touches_this_period as f64;
            for (acc, compensation) in self.accumulators.iter_mut().zip(COMPENSATION) {
                *acc += compensation * touches;
            }
            self.last_touch_ts = ts;
        }
        self.last_update_ts = ts;
        self.touches_this_period = 0;
        self.touched_this_period = false;
    }
}

/// Three indexes over the same set of tracked pages: by hotness, by
/// address, and by last-touch timestamp. Owned exclusively by the
/// migration worker (`spec.md` §5) -- nothing here needs to be `Sync`
/// beyond what `std` gives a plain owned collection for free.
#[derive(Default)]
pub struct Ranking {
    hotness_index: BTreeMap<HotnessKey, BTreeSet<usize>>,
    by_addr: HashMap<usize, PageMetadata>,
    last_touch_index: BTreeMap<Timestamp, BTreeSet<usize>>,
    pages_to_update: HashSet<usize>,
    total_size: usize,
}

impl Ranking {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn total_size(&self) -> usize {
        self.total_size
    }

    pub fn len(&self) -> usize {
        self.by_addr.len()
    }

    pub fn is_empty(&self) -> bool {
        self.by_addr.is_empty()
    }

    pub fn contains(&self, addr: usize) -> bool {
        self.by_addr.contains_key(&addr)
    }

    fn insert_indexes(&mut self, page: &PageMetadata) {
        self.hotness_index
            .entry(HotnessKey(page.hotness()))
            .or_default()
            .insert(page.start_addr);
        self.last_touch_index
            .entry(page.last_touch_ts)
            .or_default()
            .insert(page.start_addr);
    }

    fn remove_indexes(&mut self, addr: usize, hotness: f64, last_touch: Timestamp) {
        if let Some(set) = self.hotness_index.get_mut(&HotnessKey(hotness)) {
            set.remove(&addr);
            if set.is_empty() {
                self.hotness_index.remove(&HotnessKey(hotness));
            }
        }
        if let Some(set) = self.last_touch_index.get_mut(&last_touch) {
            set.remove(&addr);
            if set.is_empty() {
                self.last_touch_index.remove(&last_touch);
            }
        }
    }

    /// Registers `n` newly-mapped traced pages starting at `start`,
    /// inheriting the hotness of the current hottest tracked page (or zero
    /// if this ranking is empty).
    pub fn add_pages(&mut self, start: usize, n: usize, ts: Timestamp) {
        if n == 0 {
            return;
        }
        let init_hotness = self
            .hotness_index
            .iter()
            .next_back()
            .and_then(|(_, set)| set.iter().next())
            .map(|&addr| self.by_addr[&addr].hotness())
            .unwrap_or(0.0);

        for i in 0..n {
            let addr = start + i * TRACED_PAGESIZE;
            let page = PageMetadata::new(addr, init_hotness, ts);
            self.insert_indexes(&page);
            self.by_addr.insert(addr, page);
        }
        self.total_size += n * TRACED_PAGESIZE;
    }

    /// Inserts a page already carrying live hotness state -- used when a
    /// page migrates in from the other ranking. Preserves its indexes as-is
    /// rather than re-deriving an inherited hotness.
    pub fn insert_page(&mut self, page: PageMetadata) {
        self.insert_indexes(&page);
        self.total_size += TRACED_PAGESIZE;
        self.by_addr.insert(page.start_addr, page);
    }

    /// Rounds `addr` down to its traced page and records a touch. Returns
    /// `false` (and does nothing) if the address is not tracked by this
    /// ranking -- a touch on an unregistered page is silently dropped.
    pub fn touch(&mut self, addr: usize) -> bool {
        let page_addr = addr & !(TRACED_PAGESIZE - 1);
        match self.by_addr.get_mut(&page_addr) {
            Some(page) => {
                if page.touch() {
                    self.pages_to_update.insert(page_addr);
                }
                true
            }
            None => false,
        }
    }

    /// Periodic update: refreshes stale pages that have gone untouched
    /// since `ts - stale_cutoff`, then re-derives hotness/indexes for every
    /// page that was touched or refreshed this period.
    pub fn update(&mut self, ts: Timestamp, stale_cutoff: Timestamp) {
        let oldest_allowed = ts.saturating_sub(stale_cutoff);

        let stale_buckets: Vec<Timestamp> = self
            .last_touch_index
            .range(..oldest_allowed)
            .map(|(&ts, _)| ts)
            .collect();

        let mut refreshed = 0usize;
        'buckets: for bucket in stale_buckets {
            let addrs: Vec<usize> = match self.last_touch_index.get(&bucket) {
                Some(set) => set.iter().copied().collect(),
                None => continue,
            };
            for addr in addrs {
                if refreshed >= TO_TOUCH_MAX {
                    break 'buckets;
                }
                refreshed += 1;
                if let Some(page) = self.by_addr.get_mut(&addr) {
                    if page.touch_empty() {
                        self.pages_to_update.insert(addr);
                    }
                }
            }
        }

        let pending: Vec<usize> = self.pages_to_update.drain().collect();
        for addr in pending {
            let (old_hotness, old_last_touch) = {
                let page = &self.by_addr[&addr];
                (page.hotness(), page.last_touch_timestamp())
            };
            self.remove_indexes(addr, old_hotness, old_last_touch);

            let page = self.by_addr.get_mut(&addr).expect("page vanished mid-update");
            page.update(ts);
            self.insert_indexes(page);
        }
    }

    /// Current highest hotness value, if the ranking is non-empty.
    pub fn peek_hottest(&self) -> Option<f64> {
        self.hotness_index.keys().next_back().map(|k| k.0)
    }

    /// Current lowest hotness value, if the ranking is non-empty.
    pub fn peek_coldest(&self) -> Option<f64> {
        self.hotness_index.keys().next().map(|k| k.0)
    }

    fn pop_extreme(&mut self, hottest: bool) -> Option<PageMetadata> {
        let key = if hottest {
            *self.hotness_index.keys().next_back()?
        } else {
            *self.hotness_index.keys().next()?
        };
        let set = self.hotness_index.get_mut(&key).expect("key just read from the map");
        let addr = if hottest {
            *set.iter().next_back().expect("non-empty bucket")
        } else {
            *set.iter().next().expect("non-empty bucket")
        };
        set.remove(&addr);
        if set.is_empty() {
            self.hotness_index.remove(&key);
        }

        let page = self.by_addr.remove(&addr).expect("indexed page must exist");
        if let Some(set) = self.last_touch_index.get_mut(&page.last_touch_ts) {
            set.remove(&addr);
            if set.is_empty() {
                self.last_touch_index.remove(&page.last_touch_ts);
            }
        }
        self.pages_to_update.remove(&addr);
        self.total_size -= TRACED_PAGESIZE;
        Some(page)
    }

    pub fn pop_hottest(&mut self) -> Option<PageMetadata> {
        self.pop_extreme(true)
    }

    pub fn pop_coldest(&mut self) -> Option<PageMetadata> {
        self.pop_extreme(false)
    }
}
