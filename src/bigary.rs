//! `Bigary`: a large, lazily-committed virtual memory region.
//!
//! Grounded in `original_source/src/bigary.c`: reserve `max` bytes up front
//! with `PROT_NONE` (so the address range is spoken for but untouched),
//! then commit forward from a high-water mark (`top`) on demand. Growing
//! the committed region never moves `area`, so every pointer handed out by
//! a [`crate::slab::Slab`]/[`crate::slab::FastSlab`] built on top of a
//! bigary stays valid for the bigary's whole lifetime.
//!
//! The original's `bigary_alloc` only ensures capacity; this crate also
//! exposes [`Bigary::alloc_pages`], which additionally reports the
//! newly-committed address range in [`crate::pagesizes::TRACED_PAGESIZE`]
//! units, since the migration engine needs to know exactly which traced
//! pages just came into existence in order to register them with a
//! [`crate::ranking::Ranking`] (see `SPEC_FULL.md` §4.2).

use std::ptr::NonNull;
use std::sync::atomic::{AtomicUsize, Ordering};

use parking_lot::Mutex;

use crate::error::{fatal, Result, TierError};
use crate::pagesizes::{BIGARY_PAGESIZE, TRACED_PAGESIZE};

fn align_up(value: usize, align: usize) -> usize {
    (value + align - 1) & !(align - 1)
}

pub struct Bigary {
    area: NonNull<u8>,
    declared: usize,
    top: AtomicUsize,
    enlargement: Mutex<()>,
}

// SAFETY: all mutation of `area`'s backing memory goes through
// `enlargement`-guarded `commit` calls at monotonically increasing offsets;
// the pointer itself never moves for the bigary's lifetime.
unsafe impl Send for Bigary {}
unsafe impl Sync for Bigary {}

impl Bigary {
    /// Reserves `max` bytes (rounded up to `BIGARY_PAGESIZE`) of address
    /// space and commits the first page eagerly, matching
    /// `bigary_init`'s unconditional initial `BIGARY_PAGESIZE` commit.
    pub fn new(max: usize) -> Result<Self> {
        let max = align_up(max.max(1), BIGARY_PAGESIZE);
        let area = crate::os::reserve(max)
            .ok_or_else(|| TierError::unavailable("failed to reserve bigary address space"))?;
        if !crate::os::commit(area.as_ptr(), BIGARY_PAGESIZE) {
            fatal("bigary initial commit failed");
        }
        Ok(Bigary {
            area,
            declared: max,
            top: AtomicUsize::new(BIGARY_PAGESIZE),
            enlargement: Mutex::new(()),
        })
    }

    pub fn area(&self) -> *mut u8 {
        self.area.as_ptr()
    }

    pub fn declared(&self) -> usize {
        self.declared
    }

    pub fn top(&self) -> usize {
        self.top.load(Ordering::Acquire)
    }

    /// Ensures at least `top` bytes are committed. Double-checked locking:
    /// the fast path (already-committed) takes no lock at all.
    pub fn alloc(&self, top: usize) -> Result<()> {
        self.alloc_pages(top).map(|_| ())
    }

    /// Like [`Bigary::alloc`], but additionally returns the
    /// `TRACED_PAGESIZE`-granular range that was newly committed by this
    /// call, or `None` if the requested `top` was already covered.
    pub fn alloc_pages(&self, top: usize) -> Result<Option<(usize, usize)>> {
        if self.top.load(Ordering::Acquire) >= top {
            return Ok(None);
        }
        let _guard = self.enlargement.lock();
        let current_top = self.top.load(Ordering::Acquire);
        if current_top >= top {
            return Ok(None);
        }
        let new_top = align_up(top, BIGARY_PAGESIZE);
        if new_top > self.declared {
            return Err(TierError::OutOfMemory { requested: new_top - current_top });
        }
        let commit_addr = unsafe { self.area.as_ptr().add(current_top) };
        if !crate::os::commit(commit_addr, new_top - current_top) {
            fatal("bigary growth commit failed");
        }
        self.top.store(new_top, Ordering::Release);

        let nof_pages = (new_top - current_top) / TRACED_PAGESIZE;
        Ok(Some((self.area.as_ptr() as usize + current_top, nof_pages)))
    }
}

impl Drop for Bigary {
    fn drop(&mut self) {
        crate::os::unreserve(self.area.as_ptr(), self.declared);
    }
}
