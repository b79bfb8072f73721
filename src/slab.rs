//! Fixed-size-element allocators over a [`Bigary`].
//!
//! Two flavors, grounded in `original_source/src/slab_allocator.c` and
//! `fast_slab_allocator.c` respectively:
//!
//! - [`Slab`] carries a small header immediately before each element
//!   (a freelist link plus a pointer back to the owning `Slab`) and uses
//!   a mutex-protected freelist. The owner pointer is what lets
//!   [`Slab::free_by_pointer`] recover which slab (and so which size
//!   class) an address belongs to without the caller tracking it
//!   separately — exactly how [`crate::pool::PoolAllocator`] can offer a
//!   `free(ptr)` that takes no size. Used for the pool allocator's
//!   size-classed user-data slabs and for the pool allocator's own
//!   metadata slab.
//! - [`FastSlab`] keeps elements header-free; its freelist nodes live in a
//!   separate `Slab` and are pushed/popped with a lock-free CAS loop
//!   (a Treiber stack). Used where the caller already knows which
//!   allocator an address came from (critnib nodes/leaves, queue nodes),
//!   so the header's owner pointer would be pure overhead.

use std::mem::size_of;
use std::ptr::NonNull;
use std::sync::atomic::{AtomicPtr, AtomicUsize, Ordering};

use parking_lot::Mutex;

use crate::bigary::Bigary;
use crate::error::Result;

const DEFAULT_MAX_ELEMENTS_BYTES: usize = 4 * 1024 * 1024 * 1024;

#[repr(C)]
struct FreelistHeader {
    owner: *const Slab,
    next: Option<NonNull<FreelistHeader>>,
}

/// A metadata-bearing fixed-size-element allocator: each element carries a
/// small header used to thread the freelist through the elements
/// themselves, with no separate node allocator required.
pub struct Slab {
    mapped: Bigary,
    element_size: usize,
    used: AtomicUsize,
    freelist: Mutex<Option<NonNull<FreelistHeader>>>,
}

unsafe impl Send for Slab {}
unsafe impl Sync for Slab {}

impl Slab {
    pub fn new(element_size: usize, max_elements: usize) -> Result<Self> {
        let slot_size = size_of::<FreelistHeader>() + element_size;
        let max_bytes = if max_elements == 0 {
            DEFAULT_MAX_ELEMENTS_BYTES
        } else {
            max_elements * slot_size
        };
        Ok(Slab {
            mapped: Bigary::new(max_bytes)?,
            element_size: slot_size,
            used: AtomicUsize::new(0),
            freelist: Mutex::new(None),
        })
    }

    pub fn malloc(&self) -> Result<NonNull<u8>> {
        {
            let mut freelist = self.freelist.lock();
            if let Some(node) = *freelist {
                *freelist = unsafe { node.as_ref().next };
                return Ok(Self::header_to_addr(node));
            }
        }

        let idx = self.used.fetch_add(1, Ordering::Relaxed);
        self.mapped.alloc((idx + 1) * self.element_size)?;
        let header = unsafe { self.mapped.area().add(idx * self.element_size) } as *mut FreelistHeader;
        let header = unsafe { NonNull::new_unchecked(header) };
        unsafe { header.as_ptr().write(FreelistHeader { owner: self, next: None }) };
        Ok(Self::header_to_addr(header))
    }

    /// Like [`Slab::malloc`], but additionally returns the newly-committed
    /// traced-page range backing this allocation, if any.
    pub fn malloc_pages(&self) -> Result<(NonNull<u8>, Option<(usize, usize)>)> {
        {
            let mut freelist = self.freelist.lock();
            if let Some(node) = *freelist {
                *freelist = unsafe { node.as_ref().next };
                return Ok((Self::header_to_addr(node), None));
            }
        }

        let idx = self.used.fetch_add(1, Ordering::Relaxed);
        let new_pages = self.mapped.alloc_pages((idx + 1) * self.element_size)?;
        let header = unsafe { self.mapped.area().add(idx * self.element_size) } as *mut FreelistHeader;
        let header = unsafe { NonNull::new_unchecked(header) };
        unsafe { header.as_ptr().write(FreelistHeader { owner: self, next: None }) };
        Ok((Self::header_to_addr(header), new_pages))
    }

    /// Frees an element back to the freelist. `addr` must have come from
    /// this slab's `malloc`.
    ///
    /// # Safety
    /// `addr` must be a still-valid, non-aliased pointer previously
    /// returned by `self.malloc()` and not freed since.
    pub unsafe fn free(&self, addr: NonNull<u8>) {
        let header = Self::addr_to_header(addr);
        self.push_free(header);
    }

    fn push_free(&self, header: NonNull<FreelistHeader>) {
        let mut freelist = self.freelist.lock();
        unsafe { header.as_ptr().write(FreelistHeader { owner: self, next: *freelist }) };
        *freelist = Some(header);
    }

    /// The usable payload size of an element from this slab, header
    /// excluded.
    pub fn payload_size(&self) -> usize {
        self.element_size - size_of::<FreelistHeader>()
    }

    /// Frees `addr` back to whichever slab allocated it, read from the
    /// element's own header. Mirrors the original's `slab_allocator_free`,
    /// which takes no allocator argument for exactly this reason.
    ///
    /// # Safety
    /// `addr` must be a still-valid pointer previously returned by some
    /// `Slab::malloc`/`malloc_pages` and not freed since.
    pub unsafe fn free_by_pointer(addr: NonNull<u8>) {
        let header = Self::addr_to_header(addr);
        let owner = header.as_ref().owner;
        (*owner).push_free(header);
    }

    /// The usable payload size of a pointer previously returned by some
    /// `Slab::malloc`/`malloc_pages`, read from its header.
    ///
    /// # Safety
    /// `addr` must be a still-valid pointer previously returned by some
    /// `Slab::malloc`/`malloc_pages` and not freed since.
    pub unsafe fn usable_size_by_pointer(addr: NonNull<u8>) -> usize {
        let header = Self::addr_to_header(addr);
        (*header.as_ref().owner).payload_size()
    }

    fn header_to_addr(header: NonNull<FreelistHeader>) -> NonNull<u8> {
        unsafe { NonNull::new_unchecked((header.as_ptr() as *mut u8).add(size_of::<FreelistHeader>())) }
    }

    fn addr_to_header(addr: NonNull<u8>) -> NonNull<FreelistHeader> {
        unsafe { NonNull::new_unchecked(addr.as_ptr().sub(size_of::<FreelistHeader>()) as *mut FreelistHeader) }
    }
}

#[repr(C)]
struct FastFreeNode {
    address: usize,
    next: *mut FastFreeNode,
}

/// A header-free fixed-size-element allocator with a lock-free freelist.
pub struct FastSlab {
    mapped: Bigary,
    element_size: usize,
    used: AtomicUsize,
    free_head: AtomicPtr<FastFreeNode>,
    node_alloc: Slab,
}

unsafe impl Send for FastSlab {}
unsafe impl Sync for FastSlab {}

impl FastSlab {
    pub fn new(element_size: usize, max_elements: usize) -> Result<Self> {
        let max_bytes = if max_elements == 0 {
            DEFAULT_MAX_ELEMENTS_BYTES
        } else {
            max_elements * element_size
        };
        Ok(FastSlab {
            mapped: Bigary::new(max_bytes)?,
            element_size,
            used: AtomicUsize::new(0),
            free_head: AtomicPtr::new(std::ptr::null_mut()),
            node_alloc: Slab::new(size_of::<FastFreeNode>(), 0)?,
        })
    }

    fn freelist_pop(&self) -> Option<usize> {
        loop {
            let head = self.free_head.load(Ordering::Acquire);
            if head.is_null() {
                return None;
            }
            let next = unsafe { (*head).next };
            if self
                .free_head
                .compare_exchange_weak(head, next, Ordering::AcqRel, Ordering::Acquire)
                .is_ok()
            {
                let addr = unsafe { (*head).address };
                unsafe { self.node_alloc.free(NonNull::new_unchecked(head as *mut u8)) };
                return Some(addr);
            }
        }
    }

    fn freelist_push(&self, addr: usize) -> Result<()> {
        let node = self.node_alloc.malloc()?.as_ptr() as *mut FastFreeNode;
        unsafe { (*node).address = addr };
        loop {
            let head = self.free_head.load(Ordering::Acquire);
            unsafe { (*node).next = head };
            if self
                .free_head
                .compare_exchange_weak(head, node, Ordering::AcqRel, Ordering::Acquire)
                .is_ok()
            {
                return Ok(());
            }
        }
    }

    pub fn malloc(&self) -> Result<NonNull<u8>> {
        if let Some(addr) = self.freelist_pop() {
            return Ok(unsafe { NonNull::new_unchecked(addr as *mut u8) });
        }
        let idx = self.used.fetch_add(1, Ordering::Relaxed);
        self.mapped.alloc((idx + 1) * self.element_size)?;
        let addr = unsafe { self.mapped.area().add(idx * self.element_size) };
        Ok(unsafe { NonNull::new_unchecked(addr) })
    }

    /// Like [`FastSlab::malloc`], but reports the traced-page range that
    /// was newly committed to back this allocation, if any.
    pub fn malloc_pages(&self) -> Result<(NonNull<u8>, Option<(usize, usize)>)> {
        if let Some(addr) = self.freelist_pop() {
            return Ok((unsafe { NonNull::new_unchecked(addr as *mut u8) }, None));
        }
        let idx = self.used.fetch_add(1, Ordering::Relaxed);
        let new_pages = self.mapped.alloc_pages((idx + 1) * self.element_size)?;
        let addr = unsafe { self.mapped.area().add(idx * self.element_size) };
        Ok((unsafe { NonNull::new_unchecked(addr) }, new_pages))
    }

    /// # Safety
    /// `addr` must have come from this slab's `malloc`/`malloc_pages` and
    /// not have been freed since.
    pub unsafe fn free(&self, addr: NonNull<u8>) {
        // best-effort: a failed freelist push only leaks the slot, it never
        // corrupts state, but the node allocator itself cannot run out of
        // backing memory for a push (it grows its own bigary on demand).
        let _ = self.freelist_push(addr.as_ptr() as usize);
    }

    pub fn element_size(&self) -> usize {
        self.element_size
    }

    pub fn area(&self) -> *mut u8 {
        self.mapped.area()
    }

    pub fn contains(&self, addr: usize) -> bool {
        let area = self.mapped.area() as usize;
        addr >= area && addr < area + self.mapped.top()
    }
}
