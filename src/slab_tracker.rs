//! Address -> owning-allocator registry, used by the migration engine to
//! find which [`crate::slab::FastSlab`]/[`crate::pool::PoolAllocator`]
//! backs a page it is about to move.
//!
//! Grounded in `original_source/src/slab_tracker.cpp`, which backs this
//! with `std::unordered_map<uintptr_t, FastSlabAllocator *>`. This crate
//! backs it with [`crate::critnib::Critnib`] instead — see the slab
//! tracker entry in `DESIGN.md` for why: a `HashMap` needs `std::sync`
//! locking of its own for concurrent access during migration, whereas
//! critnib already gives lock-free reads, which is what the background
//! worker's per-page lookups want while mutators keep allocating.

use crate::critnib::Critnib;
use crate::error::Result;

pub struct SlabTracker {
    addr_to_owner: Critnib,
}

impl SlabTracker {
    pub fn new() -> Result<Self> {
        Ok(SlabTracker { addr_to_owner: Critnib::new()? })
    }

    /// Registers `addr` (a page base address) as backed by `owner`, an
    /// opaque pointer-sized token (typically a `*const FastSlab` or
    /// `*const Slab` cast to `usize`). Overwrites any prior registration
    /// for the same address.
    pub fn register(&self, addr: usize, owner: usize) -> Result<()> {
        self.addr_to_owner.insert(addr, owner, true)
    }

    pub fn get(&self, addr: usize) -> Option<usize> {
        self.addr_to_owner.get(addr)
    }

    pub fn unregister(&self, addr: usize) -> Option<usize> {
        self.addr_to_owner.remove(addr)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn register_then_get_roundtrips() {
        let tracker = SlabTracker::new().unwrap();
        tracker.register(0x1000, 0xdead_beef).unwrap();
        assert_eq!(tracker.get(0x1000), Some(0xdead_beef));
        assert_eq!(tracker.get(0x2000), None);
    }

    #[test]
    fn re_registering_overwrites() {
        let tracker = SlabTracker::new().unwrap();
        tracker.register(0x1000, 1).unwrap();
        tracker.register(0x1000, 2).unwrap();
        assert_eq!(tracker.get(0x1000), Some(2));
    }

    #[test]
    fn unregister_removes_entry() {
        let tracker = SlabTracker::new().unwrap();
        tracker.register(0x1000, 1).unwrap();
        assert_eq!(tracker.unregister(0x1000), Some(1));
        assert_eq!(tracker.get(0x1000), None);
    }
}
