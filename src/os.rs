//! Thin OS memory primitives: reserve a virtual range without committing it,
//! commit pages within an already-reserved range, and unmap.
//!
//! Grounded in the teacher's `os.rs`, trimmed to exactly what [`crate::bigary`]
//! needs: mimalloc's `os.rs` deals with segment-sized general-purpose
//! allocation with alignment tricks and large-page fallbacks; a bigary only
//! ever reserves one big chunk at a fixed base and grows it forward, so the
//! aligned-overallocation dance the teacher does for arbitrary `malloc`
//! requests does not apply here.

use log::warn;
use std::ptr::NonNull;

#[cfg(unix)]
pub fn reserve(size: usize) -> Option<NonNull<u8>> {
    unsafe {
        let p = libc::mmap(
            std::ptr::null_mut(),
            size,
            libc::PROT_NONE,
            libc::MAP_PRIVATE | libc::MAP_ANONYMOUS,
            -1,
            0,
        );
        if p == libc::MAP_FAILED {
            warn!("mmap(PROT_NONE) reserve of {} bytes failed: {}", size, errno::errno());
            return None;
        }
        NonNull::new(p as *mut u8)
    }
}

#[cfg(unix)]
pub fn commit(addr: *mut u8, size: usize) -> bool {
    unsafe {
        let ret = libc::mmap(
            addr as *mut libc::c_void,
            size,
            libc::PROT_READ | libc::PROT_WRITE,
            libc::MAP_FIXED | libc::MAP_PRIVATE | libc::MAP_ANONYMOUS,
            -1,
            0,
        );
        if ret == libc::MAP_FAILED {
            warn!(
                "mmap(MAP_FIXED) commit of {} bytes at {:p} failed: {}",
                size, addr, errno::errno()
            );
            return false;
        }
        true
    }
}

#[cfg(unix)]
pub fn unreserve(addr: *mut u8, size: usize) -> bool {
    unsafe {
        if libc::munmap(addr as *mut libc::c_void, size) == -1 {
            warn!("munmap of {} bytes at {:p} failed: {}", size, addr, errno::errno());
            return false;
        }
        true
    }
}

#[cfg(windows)]
pub fn reserve(size: usize) -> Option<NonNull<u8>> {
    use winapi::um::memoryapi::VirtualAlloc;
    use winapi::um::winnt::{MEM_RESERVE, PAGE_NOACCESS};
    unsafe {
        let p = VirtualAlloc(std::ptr::null_mut(), size, MEM_RESERVE, PAGE_NOACCESS);
        if p.is_null() {
            warn!("VirtualAlloc(MEM_RESERVE) of {} bytes failed", size);
            return None;
        }
        NonNull::new(p as *mut u8)
    }
}

#[cfg(windows)]
pub fn commit(addr: *mut u8, size: usize) -> bool {
    use winapi::um::memoryapi::VirtualAlloc;
    use winapi::um::winnt::{MEM_COMMIT, PAGE_READWRITE};
    unsafe {
        let p = VirtualAlloc(addr as _, size, MEM_COMMIT, PAGE_READWRITE);
        if p.is_null() {
            warn!("VirtualAlloc(MEM_COMMIT) of {} bytes at {:p} failed", size, addr);
            return false;
        }
        true
    }
}

#[cfg(windows)]
pub fn unreserve(addr: *mut u8, _size: usize) -> bool {
    use winapi::um::memoryapi::VirtualFree;
    use winapi::um::winnt::MEM_RELEASE;
    unsafe { VirtualFree(addr as _, 0, MEM_RELEASE) != 0 }
}

pub fn page_size() -> usize {
    crate::pagesizes::system_pagesize()
}

/// Linux's `move_pages(2)`: moves each page in `addrs` to `nodes[i]` in
/// place, writing the outcome (0 on success, a negative `-errno` on
/// per-page failure) to `status`. `addrs`, `nodes` and `status` must all
/// have the same length.
///
/// `libc` does not export `SYS_move_pages` on every target it builds for,
/// so this goes through the raw syscall the way the teacher's `os.rs`
/// falls back to raw `mmap`/`VirtualAlloc` calls rather than a
/// higher-level wrapper. Grounded in `original_source/src/lib/tachanka.c`'s
/// `move_page` helper, which calls the same syscall with `MPOL_MF_MOVE`.
#[cfg(target_os = "linux")]
pub fn move_pages(pid: i32, addrs: &[*mut libc::c_void], nodes: &[i32], status: &mut [i32]) -> bool {
    const SYS_MOVE_PAGES: i64 = 279;
    debug_assert_eq!(addrs.len(), nodes.len());
    debug_assert_eq!(addrs.len(), status.len());

    let ret = unsafe {
        libc::syscall(
            SYS_MOVE_PAGES,
            pid,
            addrs.len() as libc::c_ulong,
            addrs.as_ptr(),
            nodes.as_ptr(),
            status.as_mut_ptr(),
            0 as libc::c_int, // MPOL_MF_MOVE-less: caller already holds the pages it asks to move
        )
    };
    if ret != 0 {
        warn!("move_pages of {} pages failed: {}", addrs.len(), errno::errno());
        return false;
    }
    true
}

/// Non-Linux targets have no `move_pages` syscall; the migration engine's
/// `PageMover` falls back to a no-op mover on these platforms (see
/// `crate::mtt`).
#[cfg(not(target_os = "linux"))]
pub fn move_pages(_pid: i32, _addrs: &[*mut libc::c_void], _nodes: &[i32], status: &mut [i32]) -> bool {
    for s in status.iter_mut() {
        *s = -(libc::ENOSYS as i32);
    }
    false
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn reserve_and_commit_roundtrip() {
        let size = crate::pagesizes::BIGARY_PAGESIZE;
        let area = reserve(size).expect("reserve should succeed");
        assert!(commit(area.as_ptr(), crate::pagesizes::TRACED_PAGESIZE));
        unsafe {
            std::ptr::write_bytes(area.as_ptr(), 0xAB, crate::pagesizes::TRACED_PAGESIZE);
        }
        assert!(unreserve(area.as_ptr(), size));
    }
}
