//! Page-size constants. Three different granularities are in play, same as
//! in the original: the *bigary page* (mmap granularity), the *traced page*
//! (granularity of hotness tracking/metadata) and the *system page*
//! (whatever the OS hands back).

/// Granularity of memory tracing; each traced page carries its own
/// [`crate::ranking::PageMetadata`]. Must be a multiple of the system page
/// size.
pub const TRACED_PAGESIZE: usize = 4 * 1024;

/// Granularity of the bigary's mmap commits.
pub const BIGARY_PAGESIZE: usize = 2 * 1024 * 1024;

fn is_pow2(val: usize) -> bool {
    val > 0 && (val & (val - 1)) == 0
}

pub fn system_pagesize() -> usize {
    #[cfg(unix)]
    {
        let ret = unsafe { libc::sysconf(libc::_SC_PAGESIZE) };
        if ret > 0 {
            return ret as usize;
        }
        4096
    }
    #[cfg(not(unix))]
    {
        4096
    }
}

/// Validates the compile-time page size constants against the runtime
/// system page size. The original checks this once at startup
/// (`traced_pagesize_check_correctness`); here it is run from
/// `ConfigBuilder::build` since the constants are runtime-tunable-by-rebuild
/// rather than `#[cfg]`-gated.
pub fn check_correctness() -> bool {
    let system_pagesize = system_pagesize();
    let alignment_correct =
        TRACED_PAGESIZE % system_pagesize == 0 && BIGARY_PAGESIZE % system_pagesize == 0;
    let relative_size_correct = BIGARY_PAGESIZE >= TRACED_PAGESIZE;
    let size_gt_0 = TRACED_PAGESIZE > 0;
    let pow2_correct = is_pow2(TRACED_PAGESIZE) && is_pow2(BIGARY_PAGESIZE);

    alignment_correct && relative_size_correct && size_gt_0 && pow2_correct
}
