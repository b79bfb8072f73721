//! Size-classed pool allocator: one [`Slab`] per rank, installed lazily and
//! raced for with a compare-and-exchange the first time a rank is touched.
//!
//! Grounded in `original_source/src/pool_allocator.c` and
//! `pool_allocator_internal_utils.c`. The size-rank bijection there uses
//! x86 `bsr`/`bsf` inline assembly (`MIN_RANK_SIZE_POW_2 = 4`); this crate
//! gets the same bit position portably from `usize::ilog2`, per the size
//! rank design decision recorded in `DESIGN.md`.
//!
//! The original allocates each per-rank `SlabAllocator` from a bump
//! allocator of its own (`slabSlabAllocator`) rather than the process's
//! general-purpose allocator, to avoid the pool allocator depending on
//! (and potentially re-entering) whatever allocator it might itself be
//! backing. This crate keeps that discipline: per-rank [`Slab`] control
//! blocks are carved out of `meta`, a [`Slab`] sized to hold one
//! `Slab` struct per element, rather than `Box`-ed through the ambient
//! global allocator.
//!
//! `free`/`usable_size`/`realloc` resolve the owning [`Slab`] through a
//! [`SlabTracker`] rather than through `Slab`'s own header (as
//! `original_source/src/pool_allocator.c` and [`crate::slab::Slab`]'s
//! header-based statics both do), per `spec.md` §4.4/§4.5: the tracker is
//! keyed by traced-page address and shared with the migration engine, so a
//! page the tracker resolves is the same page the background worker reads
//! when deciding what to migrate.

use std::mem::size_of;
use std::ptr::NonNull;
use std::sync::atomic::{AtomicPtr, Ordering};

use crate::error::{fatal, Result, TierError};
use crate::pagesizes::TRACED_PAGESIZE;
use crate::slab::Slab;
use crate::slab_tracker::SlabTracker;

fn page_base(ptr: NonNull<u8>) -> usize {
    (ptr.as_ptr() as usize) & !(TRACED_PAGESIZE - 1)
}

const NUM_RANKS: usize = 1 << 16;
const MIN_RANK_SIZE_POW_2: u32 = 4;

fn size_to_rank(size: usize) -> usize {
    let size = size.max(1);
    let msb = usize::BITS - 1 - size.leading_zeros();
    let lsb = size.trailing_zeros();

    if msb == lsb {
        if msb <= MIN_RANK_SIZE_POW_2 {
            0
        } else {
            ((msb - MIN_RANK_SIZE_POW_2) << 1) as usize
        }
    } else {
        let msb_full = msb + 1;
        if msb_full < MIN_RANK_SIZE_POW_2 {
            return 0;
        }
        let mid_is_enough = (size & (1 << (msb - 1))) == 0 || lsb == msb - 1;
        let ranks_to_add = if mid_is_enough { 0 } else { 1 };
        (((msb - MIN_RANK_SIZE_POW_2) << 1) + 1 + ranks_to_add) as usize
    }
}

fn rank_to_size(rank: usize) -> usize {
    let min_pow2 = (rank >> 1) + MIN_RANK_SIZE_POW_2 as usize;
    let min_size = 1usize << min_pow2;
    let rank_is_pow2 = rank & 1 == 0;
    if rank_is_pow2 {
        min_size
    } else {
        min_size + (1usize << (min_pow2 - 1))
    }
}

pub struct PoolAllocator {
    pool: Vec<AtomicPtr<Slab>>,
    meta: Slab,
    tracker: SlabTracker,
}

unsafe impl Send for PoolAllocator {}
unsafe impl Sync for PoolAllocator {}

impl PoolAllocator {
    pub fn new() -> Result<Self> {
        Ok(PoolAllocator {
            pool: (0..NUM_RANKS).map(|_| AtomicPtr::new(std::ptr::null_mut())).collect(),
            meta: Slab::new(size_of::<Slab>(), NUM_RANKS)?,
            tracker: SlabTracker::new()?,
        })
    }

    fn register_new_pages(&self, slab: &Slab, new_pages: Option<(usize, usize)>) -> Result<()> {
        if let Some((start, nof_pages)) = new_pages {
            let owner = slab as *const Slab as usize;
            for i in 0..nof_pages {
                self.tracker.register(start + i * TRACED_PAGESIZE, owner)?;
            }
        }
        Ok(())
    }

    fn slab_for_rank(&self, rank: usize) -> Result<&Slab> {
        let existing = self.pool[rank].load(Ordering::Acquire);
        if !existing.is_null() {
            return Ok(unsafe { &*existing });
        }

        let slab_size = rank_to_size(rank);
        let mem = self.meta.malloc()?;
        let candidate = mem.as_ptr() as *mut Slab;
        unsafe { candidate.write(Slab::new(slab_size, 0)?) };

        match self.pool[rank].compare_exchange(
            std::ptr::null_mut(),
            candidate,
            Ordering::AcqRel,
            Ordering::Acquire,
        ) {
            Ok(_) => Ok(unsafe { &*candidate }),
            Err(installed) => {
                unsafe {
                    std::ptr::drop_in_place(candidate);
                    self.meta.free(NonNull::new_unchecked(candidate as *mut u8));
                }
                Ok(unsafe { &*installed })
            }
        }
    }

    pub fn malloc(&self, size: usize) -> Result<NonNull<u8>> {
        self.malloc_pages(size).map(|(ptr, _)| ptr)
    }

    /// Like [`PoolAllocator::malloc`], but additionally reports the
    /// traced-page range newly committed to back the allocation, if any.
    /// Every allocation, traced or not, is routed through here so that
    /// every live pointer's owning slab is registered in `tracker` before
    /// it is handed to a caller.
    pub fn malloc_pages(&self, size: usize) -> Result<(NonNull<u8>, Option<(usize, usize)>)> {
        if size == 0 {
            return Err(TierError::invalid("zero-size allocation"));
        }
        let slab = self.slab_for_rank(size_to_rank(size))?;
        let (ptr, new_pages) = slab.malloc_pages()?;
        self.register_new_pages(slab, new_pages)?;
        Ok((ptr, new_pages))
    }

    fn resolve(&self, ptr: NonNull<u8>) -> &Slab {
        match self.tracker.get(page_base(ptr)) {
            Some(owner) => unsafe { &*(owner as *const Slab) },
            None => fatal("free/usable_size/realloc on untracked pointer"),
        }
    }

    /// # Safety
    /// `ptr` must have come from this pool's `malloc`/`malloc_pages` and
    /// not have been freed since.
    pub unsafe fn free(&self, ptr: NonNull<u8>) {
        self.resolve(ptr).free(ptr);
    }

    /// # Safety
    /// `ptr` must have come from this pool's `malloc`/`malloc_pages` and
    /// not have been freed since.
    pub unsafe fn usable_size(&self, ptr: NonNull<u8>) -> usize {
        self.resolve(ptr).payload_size()
    }

    /// Frees `ptr` and returns a new allocation of `new_size`, preserving
    /// `min(old_usable_size, new_size)` bytes of content.
    ///
    /// The original's `pool_allocator_realloc` frees and mallocs without
    /// any copy, because at that layer it never learns the old size; here
    /// the tracker makes the old size recoverable, so this copies, which
    /// is what a `realloc` actually needs to do.
    ///
    /// # Safety
    /// `ptr` must have come from this pool's `malloc`/`malloc_pages` and
    /// not have been freed since.
    pub unsafe fn realloc(&self, ptr: NonNull<u8>, new_size: usize) -> Result<NonNull<u8>> {
        let old_slab = self.resolve(ptr);
        let old_size = old_slab.payload_size();
        let new_ptr = self.malloc(new_size)?;
        let copy_len = old_size.min(new_size);
        std::ptr::copy_nonoverlapping(ptr.as_ptr(), new_ptr.as_ptr(), copy_len);
        old_slab.free(ptr);
        Ok(new_ptr)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn rank_size_bijection_roundtrips_for_representative_sizes() {
        for size in [1usize, 4, 15, 16, 17, 31, 32, 100, 1000, 1 << 20] {
            let rank = size_to_rank(size);
            assert!(rank_to_size(rank) >= size, "rank {rank} too small for size {size}");
        }
    }

    /// R3 (`spec.md` §8, `DESIGN.md` open question 3):
    /// `size_to_rank(rank_to_size(r)) == r` for every rank -- `rank_to_size`
    /// always produces the canonical minimum size for its rank, so mapping
    /// that size back must return the same rank.
    #[test]
    fn rank_to_size_then_size_to_rank_is_identity() {
        // stops well short of ranks whose canonical size would overflow
        // `usize` (around rank 117 on a 64-bit target); the mapping's
        // structure repeats at every bit position, so this range exercises
        // every code path (pow2 and non-pow2 ranks, the `msb <= MIN_RANK_SIZE_POW_2`
        // clamp at the bottom) without risking that overflow.
        for rank in 0..64usize {
            let size = rank_to_size(rank);
            assert_eq!(size_to_rank(size), rank, "rank {rank} round-tripped to size {size}");
        }
    }

    #[test]
    fn malloc_returns_distinct_addresses_per_size_class() {
        let pool = PoolAllocator::new().unwrap();
        let small = pool.malloc(16).unwrap();
        let big = pool.malloc(4096).unwrap();
        assert_ne!(small.as_ptr(), big.as_ptr());
    }

    #[test]
    fn free_then_malloc_same_size_reuses_slot() {
        let pool = PoolAllocator::new().unwrap();
        let a = pool.malloc(64).unwrap();
        unsafe { pool.free(a) };
        let b = pool.malloc(64).unwrap();
        assert_eq!(a, b);
    }

    #[test]
    fn realloc_preserves_bytes_up_to_min_size() {
        let pool = PoolAllocator::new().unwrap();
        let a = pool.malloc(16).unwrap();
        unsafe {
            std::ptr::write_bytes(a.as_ptr(), 0x7A, 16);
            let b = pool.realloc(a, 256).unwrap();
            for i in 0..16 {
                assert_eq!(*b.as_ptr().add(i), 0x7A);
            }
        }
    }

    #[test]
    fn usable_size_is_at_least_requested_size() {
        let pool = PoolAllocator::new().unwrap();
        let a = pool.malloc(20).unwrap();
        assert!(unsafe { pool.usable_size(a) } >= 20);
    }

    #[test]
    fn tracker_resolves_live_pointer_to_its_producing_slab() {
        let pool = PoolAllocator::new().unwrap();
        let a = pool.malloc(64).unwrap();
        let rank_slab = pool.slab_for_rank(size_to_rank(64)).unwrap() as *const Slab as usize;
        let resolved = pool.tracker.get(page_base(a)).unwrap();
        assert_eq!(resolved, rank_slab);
    }

    #[test]
    fn concurrent_mallocs_across_ranks_install_each_slab_once() {
        use std::sync::Arc;
        let pool = Arc::new(PoolAllocator::new().unwrap());
        std::thread::scope(|scope| {
            for _ in 0..32 {
                let pool = Arc::clone(&pool);
                scope.spawn(move || {
                    for _ in 0..50 {
                        let p = pool.malloc(128).unwrap();
                        unsafe { pool.free(p) };
                    }
                });
            }
        });
    }
}
