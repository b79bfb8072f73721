//! Public API shim: a `TierHeap` handle (the primary, testable surface),
//! a `unsafe impl GlobalAlloc for TierAllocator` adapter for programs that
//! want to install this as their process allocator, and a thin raw
//! pointer + thread-local errno layer underneath both, matching the
//! calling convention `spec.md` §6/§7 specifies for the C-style entry
//! points.
//!
//! Grounded in the teacher's `lib.rs`, whose `unsafe impl GlobalAlloc for
//! Mimalloc` was a `// TODO: Implement this` stub; this module is that
//! implementation, plus the handle-level API the stub never had a use for
//! since mimalloc-rs's own `malloc`/`free` live in `internal.rs`.

use std::alloc::{GlobalAlloc, Layout};
use std::ptr::NonNull;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;

use once_cell::sync::Lazy;

use crate::config::Config;
use crate::critnib::Critnib;
use crate::error::{Result, TierError};
use crate::mtt::PageMover;
use crate::tier::TierMemory;
use crate::worker::Worker;

/// A tiered heap: the engine plus its background migration worker, bundled
/// so that dropping the handle tears both down together.
pub struct TierHeap {
    tier: Arc<TierMemory>,
    worker: Worker,
    /// `aligned_addr -> raw_addr`, populated by [`TierHeap::posix_memalign`]
    /// for requests whose alignment a plain slab allocation can't
    /// guarantee. A `Critnib` is reused here rather than inventing a
    /// second address-keyed structure, the same "one general-purpose
    /// addr -> value map" discipline [`crate::slab_tracker::SlabTracker`]
    /// already follows.
    aligned: Critnib,
}

impl TierHeap {
    pub fn new(config: Config) -> Result<Self> {
        let period = Duration::from_millis(config.ranking_update_period_ms.max(1));
        let stale_cutoff_ns = config.stale_touch_cutoff_ms.max(1) * 1_000_000;
        let tier = Arc::new(TierMemory::new(&config)?);
        let worker = Worker::spawn(Arc::clone(&tier), period, stale_cutoff_ns);
        Ok(TierHeap { tier, worker, aligned: Critnib::new()? })
    }

    /// Like [`TierHeap::new`], but installs `mover` as the `DataMovement`
    /// policy's page mover instead of the default no-op -- used to wire up
    /// [`crate::mtt::SyscallMover`] for production use.
    pub fn with_mover(config: Config, mover: Box<dyn PageMover>, target: crate::mtt::NumaTarget) -> Result<Self> {
        let period = Duration::from_millis(config.ranking_update_period_ms.max(1));
        let stale_cutoff_ns = config.stale_touch_cutoff_ms.max(1) * 1_000_000;
        let tier = Arc::new(TierMemory::with_mover(&config, mover, target)?);
        let worker = Worker::spawn(Arc::clone(&tier), period, stale_cutoff_ns);
        Ok(TierHeap { tier, worker, aligned: Critnib::new()? })
    }

    pub fn malloc(&self, size: usize) -> Result<NonNull<u8>> {
        self.tier.malloc(size)
    }

    pub fn calloc(&self, nmemb: usize, size: usize) -> Result<NonNull<u8>> {
        self.tier.calloc(nmemb, size)
    }

    /// # Safety
    /// `ptr` must have come from this heap's `malloc`/`calloc`/`realloc`/
    /// `posix_memalign` and not have been freed since.
    pub unsafe fn free(&self, ptr: NonNull<u8>) {
        if let Some(raw) = self.aligned.remove(ptr.as_ptr() as usize) {
            self.tier.free(NonNull::new_unchecked(raw as *mut u8));
        } else {
            self.tier.free(ptr);
        }
    }

    /// # Safety
    /// `ptr` must have come from this heap's `malloc`/`calloc`/`realloc`/
    /// `posix_memalign` and not have been freed since.
    pub unsafe fn usable_size(&self, ptr: NonNull<u8>) -> usize {
        match self.aligned.get(ptr.as_ptr() as usize) {
            Some(raw) => {
                let raw = NonNull::new_unchecked(raw as *mut u8);
                let offset = ptr.as_ptr() as usize - raw.as_ptr() as usize;
                self.tier.usable_size(raw) - offset
            }
            None => self.tier.usable_size(ptr),
        }
    }

    /// # Safety
    /// `ptr` must have come from this heap's `malloc`/`calloc`/`realloc`/
    /// `posix_memalign` and not have been freed since.
    ///
    /// Reallocating a `posix_memalign`-obtained pointer preserves content
    /// but not the original alignment guarantee, since the new allocation
    /// is a plain `malloc` -- callers that need an aligned pointer across a
    /// resize should call `posix_memalign` again and copy themselves.
    ///
    /// Per `spec.md` §4.7/§8: `new_size == 0` frees `ptr` and returns
    /// `Ok(None)`, matching `realloc(ptr, 0) == free(ptr), null`.
    pub unsafe fn realloc(&self, ptr: NonNull<u8>, new_size: usize) -> Result<Option<NonNull<u8>>> {
        if new_size == 0 {
            self.free(ptr);
            return Ok(None);
        }
        if let Some(raw) = self.aligned.remove(ptr.as_ptr() as usize) {
            let raw = NonNull::new_unchecked(raw as *mut u8);
            let offset = ptr.as_ptr() as usize - raw.as_ptr() as usize;
            let old_usable = self.tier.usable_size(raw) - offset;
            let new_ptr = self.tier.malloc(new_size)?;
            let copy_len = old_usable.min(new_size);
            std::ptr::copy_nonoverlapping(ptr.as_ptr(), new_ptr.as_ptr(), copy_len);
            self.tier.free(raw);
            return Ok(Some(new_ptr));
        }
        self.tier.realloc(ptr, new_size)
    }

    /// Over-allocates `size + alignment` bytes and hands back an aligned
    /// pointer within that allocation, recording the raw address so
    /// `free`/`usable_size`/`realloc` can recover it. `alignment` must be
    /// a nonzero power of two.
    pub fn posix_memalign(&self, alignment: usize, size: usize) -> Result<NonNull<u8>> {
        if alignment == 0 || !alignment.is_power_of_two() {
            return Err(TierError::invalid("alignment must be a nonzero power of two"));
        }
        let raw = self.tier.malloc(size + alignment)?;
        let raw_addr = raw.as_ptr() as usize;
        let aligned_addr = (raw_addr + alignment - 1) & !(alignment - 1);
        if aligned_addr != raw_addr {
            self.aligned.insert(aligned_addr, raw_addr, true)?;
        }
        Ok(unsafe { NonNull::new_unchecked(aligned_addr as *mut u8) })
    }

    /// Records a touch of `ptr`'s containing page, feeding the
    /// `DataMovement` policy's hotness tracking (a no-op otherwise).
    pub fn touch(&self, ptr: NonNull<u8>) -> Result<()> {
        self.tier.record_touch(ptr)
    }

    pub fn log_summary(&self) {
        self.tier.log_summary();
    }
}

/// `unsafe impl GlobalAlloc` adapter, for installing a [`TierHeap`] as the
/// process's `#[global_allocator]`.
pub struct TierAllocator {
    heap: Lazy<TierHeap>,
}

impl TierAllocator {
    /// Builds an adapter around a lazily-constructed heap using
    /// `Config::default` equivalent settings (`DataMovement` policy,
    /// unrestricted limits). Programs that need a specific [`Config`]
    /// should build their own [`TierHeap`] and use the handle API
    /// directly instead of installing a global allocator.
    pub const fn new() -> Self {
        TierAllocator {
            heap: Lazy::new(|| {
                let config = crate::config::ConfigBuilder::new().build().expect("default config must be valid");
                TierHeap::new(config).unwrap_or_else(|e| crate::error::fatal(e))
            }),
        }
    }
}

impl Default for TierAllocator {
    fn default() -> Self {
        Self::new()
    }
}

unsafe impl GlobalAlloc for TierAllocator {
    unsafe fn alloc(&self, layout: Layout) -> *mut u8 {
        let result = if layout.align() <= std::mem::align_of::<usize>() {
            self.heap.malloc(layout.size())
        } else {
            self.heap.posix_memalign(layout.align(), layout.size())
        };
        match result {
            Ok(ptr) => ptr.as_ptr(),
            Err(_) => std::ptr::null_mut(),
        }
    }

    unsafe fn dealloc(&self, ptr: *mut u8, _layout: Layout) {
        if let Some(ptr) = NonNull::new(ptr) {
            self.heap.free(ptr);
        }
    }

    unsafe fn alloc_zeroed(&self, layout: Layout) -> *mut u8 {
        let ptr = self.alloc(layout);
        if !ptr.is_null() {
            std::ptr::write_bytes(ptr, 0, layout.size());
        }
        ptr
    }

    unsafe fn realloc(&self, ptr: *mut u8, layout: Layout, new_size: usize) -> *mut u8 {
        let Some(nn) = NonNull::new(ptr) else { return std::ptr::null_mut() };
        if layout.align() <= std::mem::align_of::<usize>() {
            match self.heap.realloc(nn, new_size) {
                Ok(Some(new_ptr)) => new_ptr.as_ptr(),
                Ok(None) => std::ptr::null_mut(),
                Err(_) => std::ptr::null_mut(),
            }
        } else {
            // alignment above the natural guarantee must be preserved
            // across the resize, which a plain `realloc` cannot promise;
            // fall back to allocate-copy-free.
            match self.heap.posix_memalign(layout.align(), new_size) {
                Ok(new_ptr) => {
                    let old_usable = self.heap.usable_size(nn);
                    let copy_len = old_usable.min(new_size);
                    std::ptr::copy_nonoverlapping(ptr, new_ptr.as_ptr(), copy_len);
                    self.heap.free(nn);
                    new_ptr.as_ptr()
                }
                Err(_) => std::ptr::null_mut(),
            }
        }
    }
}

fn set_last_error(err: &TierError) {
    let code = match err {
        TierError::OutOfMemory { .. } => libc::ENOMEM,
        TierError::InvalidArgument(_) => libc::EINVAL,
        TierError::Unavailable(_) => libc::ENOTSUP,
        TierError::Exists => libc::EEXIST,
        TierError::Fatal(_) => libc::EFAULT,
    };
    errno::set_errno(errno::Errno(code));
}

static GLOBAL_HEAP: Lazy<TierHeap> = Lazy::new(|| {
    let config = crate::config::ConfigBuilder::new().build().expect("default config must be valid");
    TierHeap::new(config).unwrap_or_else(|e| crate::error::fatal(e))
});

static GLOBAL_INIT_LOGGED: AtomicBool = AtomicBool::new(false);

fn global_heap() -> &'static TierHeap {
    if !GLOBAL_INIT_LOGGED.swap(true, Ordering::Relaxed) {
        log::info!("tiermalloc global heap initialized");
    }
    &GLOBAL_HEAP
}

/// # Safety
/// Matches the C `malloc` contract: the returned pointer (if non-null)
/// must eventually be passed to [`tier_free`] exactly once.
#[no_mangle]
pub unsafe extern "C" fn tier_malloc(size: usize) -> *mut u8 {
    match global_heap().malloc(size) {
        Ok(ptr) => ptr.as_ptr(),
        Err(err) => {
            set_last_error(&err);
            std::ptr::null_mut()
        }
    }
}

/// # Safety
/// Matches the C `calloc` contract.
#[no_mangle]
pub unsafe extern "C" fn tier_calloc(nmemb: usize, size: usize) -> *mut u8 {
    match global_heap().calloc(nmemb, size) {
        Ok(ptr) => ptr.as_ptr(),
        Err(err) => {
            set_last_error(&err);
            std::ptr::null_mut()
        }
    }
}

/// # Safety
/// `ptr` must be null or have come from `tier_malloc`/`tier_calloc`/
/// `tier_realloc`/`tier_posix_memalign` and not have been freed since.
#[no_mangle]
pub unsafe extern "C" fn tier_free(ptr: *mut u8) {
    if let Some(ptr) = NonNull::new(ptr) {
        global_heap().free(ptr);
    }
}

/// # Safety
/// `ptr` must be null or have come from `tier_malloc`/`tier_calloc`/
/// `tier_realloc`/`tier_posix_memalign` and not have been freed since.
///
/// Matches `spec.md` §6/§8: `ptr == null` behaves as `tier_malloc`;
/// `size == 0` with a non-null `ptr` frees it and returns null.
#[no_mangle]
pub unsafe extern "C" fn tier_realloc(ptr: *mut u8, size: usize) -> *mut u8 {
    let Some(nn) = NonNull::new(ptr) else {
        return tier_malloc(size);
    };
    match global_heap().realloc(nn, size) {
        Ok(Some(new_ptr)) => new_ptr.as_ptr(),
        Ok(None) => std::ptr::null_mut(),
        Err(err) => {
            set_last_error(&err);
            std::ptr::null_mut()
        }
    }
}

/// # Safety
/// `ptr` must be null or have come from `tier_malloc`/`tier_calloc`/
/// `tier_realloc`/`tier_posix_memalign` and not have been freed since.
#[no_mangle]
pub unsafe extern "C" fn tier_usable_size(ptr: *mut u8) -> usize {
    match NonNull::new(ptr) {
        Some(ptr) => global_heap().usable_size(ptr),
        None => 0,
    }
}

/// # Safety
/// `memptr` must be a valid, writable `*mut *mut u8`.
#[no_mangle]
pub unsafe extern "C" fn tier_posix_memalign(memptr: *mut *mut u8, alignment: usize, size: usize) -> i32 {
    match global_heap().posix_memalign(alignment, size) {
        Ok(ptr) => {
            *memptr = ptr.as_ptr();
            0
        }
        Err(err) => {
            let code = match err {
                TierError::InvalidArgument(_) => libc::EINVAL,
                _ => libc::ENOMEM,
            };
            code
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::ConfigBuilder;
    use crate::pagesizes::TRACED_PAGESIZE;

    fn test_config() -> Config {
        ConfigBuilder::new()
            .policy(crate::config::TierPolicy::DataMovement)
            .limits(0, TRACED_PAGESIZE * 1024, TRACED_PAGESIZE * 2048)
            .ranking_update_period_ms(10_000)
            .build()
            .unwrap()
    }

    #[test]
    fn malloc_free_roundtrip() {
        let heap = TierHeap::new(test_config()).unwrap();
        let ptr = heap.malloc(64).unwrap();
        assert!(unsafe { heap.usable_size(ptr) } >= 64);
        unsafe { heap.free(ptr) };
    }

    #[test]
    fn calloc_zeroes_memory() {
        let heap = TierHeap::new(test_config()).unwrap();
        let ptr = heap.calloc(16, 4).unwrap();
        let bytes = unsafe { std::slice::from_raw_parts(ptr.as_ptr(), 64) };
        assert!(bytes.iter().all(|&b| b == 0));
        unsafe { heap.free(ptr) };
    }

    #[test]
    fn posix_memalign_returns_aligned_pointer() {
        let heap = TierHeap::new(test_config()).unwrap();
        let ptr = heap.posix_memalign(4096, 128).unwrap();
        assert_eq!(ptr.as_ptr() as usize % 4096, 0);
        assert!(unsafe { heap.usable_size(ptr) } >= 128);
        unsafe { heap.free(ptr) };
    }

    #[test]
    fn posix_memalign_rejects_non_power_of_two() {
        let heap = TierHeap::new(test_config()).unwrap();
        assert!(heap.posix_memalign(3, 64).is_err());
    }

    #[test]
    fn realloc_preserves_content_for_aligned_pointer() {
        let heap = TierHeap::new(test_config()).unwrap();
        let ptr = heap.posix_memalign(256, 64).unwrap();
        unsafe { std::ptr::write_bytes(ptr.as_ptr(), 0x5A, 64) };
        let new_ptr = unsafe { heap.realloc(ptr, 512).unwrap() }.expect("nonzero size must return Some");
        let bytes = unsafe { std::slice::from_raw_parts(new_ptr.as_ptr(), 64) };
        assert!(bytes.iter().all(|&b| b == 0x5A));
        unsafe { heap.free(new_ptr) };
    }

    #[test]
    fn realloc_to_zero_frees_and_returns_none() {
        let heap = TierHeap::new(test_config()).unwrap();
        let ptr = heap.malloc(64).unwrap();
        assert!(unsafe { heap.realloc(ptr, 0).unwrap() }.is_none());
        // the slot must be reusable now that it has been freed
        let reused = heap.malloc(64).unwrap();
        assert_eq!(ptr, reused);
    }

    #[test]
    fn c_api_realloc_to_zero_returns_null() {
        unsafe {
            let ptr = tier_malloc(64);
            assert!(!ptr.is_null());
            let result = tier_realloc(ptr, 0);
            assert!(result.is_null());
        }
    }

    #[test]
    fn c_api_realloc_null_behaves_as_malloc() {
        unsafe {
            let ptr = tier_realloc(std::ptr::null_mut(), 32);
            assert!(!ptr.is_null());
            tier_free(ptr);
        }
    }

    #[test]
    fn c_api_malloc_then_free_roundtrips() {
        unsafe {
            let ptr = tier_malloc(128);
            assert!(!ptr.is_null());
            tier_free(ptr);
        }
    }

    #[test]
    fn c_api_posix_memalign_reports_success() {
        unsafe {
            let mut out: *mut u8 = std::ptr::null_mut();
            let ret = tier_posix_memalign(&mut out, 64, 32);
            assert_eq!(ret, 0);
            assert!(!out.is_null());
            tier_free(out);
        }
    }
}
