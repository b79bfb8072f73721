//! A generic lock-free push/drain-all MPSC queue.
//!
//! Grounded in `original_source/src/mmap_tracing_queue.c` and
//! `multithreaded_touch_queue.c`, which implement the same push/take-all
//! shape twice: once with a mutex-protected head/tail pair, once with a
//! genuinely lock-free CAS push and an atomic-exchange take-all. Since
//! the lock-free version is strictly more concurrent and no harder to
//! reason about, this crate keeps only that one and parameterizes it by
//! payload type, rather than carrying two near-identical queues.
//!
//! Both original queues allocate their nodes from a `SlabAllocator`
//! (this crate's header-bearing [`crate::slab::Slab`]) rather than the
//! general-purpose allocator, for the same re-entrancy reason the pool
//! allocator's metadata does; this queue does too.

use std::marker::PhantomData;
use std::mem::size_of;
use std::ptr::NonNull;
use std::sync::atomic::{AtomicPtr, Ordering};

use crate::error::Result;
use crate::slab::Slab;

struct Node<T> {
    value: T,
    next: *mut Node<T>,
}

pub struct LockFreeQueue<T: Copy> {
    head: AtomicPtr<Node<T>>,
    alloc: Slab,
    _marker: PhantomData<T>,
}

unsafe impl<T: Copy + Send> Send for LockFreeQueue<T> {}
unsafe impl<T: Copy + Send> Sync for LockFreeQueue<T> {}

impl<T: Copy> LockFreeQueue<T> {
    pub fn new() -> Result<Self> {
        Ok(LockFreeQueue {
            head: AtomicPtr::new(std::ptr::null_mut()),
            alloc: Slab::new(size_of::<Node<T>>(), 0)?,
            _marker: PhantomData,
        })
    }

    pub fn push(&self, value: T) -> Result<()> {
        let mem = self.alloc.malloc()?;
        let node = mem.as_ptr() as *mut Node<T>;
        loop {
            let head = self.head.load(Ordering::Acquire);
            unsafe {
                (*node).value = value;
                (*node).next = head;
            }
            if self
                .head
                .compare_exchange_weak(head, node, Ordering::AcqRel, Ordering::Acquire)
                .is_ok()
            {
                return Ok(());
            }
        }
    }

    /// Atomically detaches every pending entry. Order is unspecified
    /// (the original's two queues actually disagree with each other: the
    /// mutex-protected one is FIFO, the CAS-based one is LIFO); callers
    /// that care about order must not rely on it.
    pub fn take_all(&self) -> Vec<T> {
        let mut head = self.head.swap(std::ptr::null_mut(), Ordering::AcqRel);
        let mut out = Vec::new();
        while !head.is_null() {
            let value = unsafe { (*head).value };
            let next = unsafe { (*head).next };
            unsafe { self.alloc.free(NonNull::new_unchecked(head as *mut u8)) };
            out.push(value);
            head = next;
        }
        out
    }

    pub fn is_empty(&self) -> bool {
        self.head.load(Ordering::Acquire).is_null()
    }
}

impl<T: Copy> Drop for LockFreeQueue<T> {
    fn drop(&mut self) {
        let _ = self.take_all();
    }
}

/// `(start_addr, nof_pages)` pairs, pushed whenever a bigary commits new
/// traced pages, drained by the migration worker into a [`crate::ranking::Ranking`].
pub type MmapTracingQueue = LockFreeQueue<(usize, usize)>;

/// Touched page addresses, pushed by mutator threads, drained by the
/// migration worker to feed [`crate::ranking::Ranking::touch`].
pub type MultithreadedTouchQueue = LockFreeQueue<usize>;

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn push_then_take_all_returns_everything_once() {
        let q: LockFreeQueue<usize> = LockFreeQueue::new().unwrap();
        for i in 0..10 {
            q.push(i).unwrap();
        }
        let mut drained = q.take_all();
        drained.sort_unstable();
        assert_eq!(drained, (0..10).collect::<Vec<_>>());
        assert!(q.is_empty());
    }

    #[test]
    fn take_all_on_empty_queue_returns_empty() {
        let q: LockFreeQueue<usize> = LockFreeQueue::new().unwrap();
        assert!(q.take_all().is_empty());
    }

    #[test]
    fn mmap_tracing_alias_carries_pairs() {
        let q: MmapTracingQueue = LockFreeQueue::new().unwrap();
        q.push((0x1000, 4)).unwrap();
        assert_eq!(q.take_all(), vec![(0x1000, 4)]);
    }

    #[test]
    fn concurrent_pushes_are_all_observed() {
        use std::sync::Arc;
        let q = Arc::new(LockFreeQueue::<usize>::new().unwrap());
        std::thread::scope(|scope| {
            for t in 0..16 {
                let q = Arc::clone(&q);
                scope.spawn(move || {
                    for i in 0..50 {
                        q.push(t * 50 + i).unwrap();
                    }
                });
            }
        });
        let mut drained = q.take_all();
        drained.sort_unstable();
        assert_eq!(drained, (0..800).collect::<Vec<_>>());
    }
}
