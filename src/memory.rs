//! Process memory sampling and the post-GC heap hint.

use std::sync::atomic::{AtomicU64, Ordering};
use tracing::debug;

/// Current process memory statistics
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct MemoryStats {
    /// Resident Set Size (physical memory in use) in bytes
    pub rss_bytes: u64,
    /// Virtual memory size in bytes
    pub vss_bytes: u64,
}

impl MemoryStats {
    /// Sample the current process. Zeroes on platforms `memory-stats` cannot read.
    #[must_use]
    pub fn current() -> Self {
        match memory_stats::memory_stats() {
            Some(usage) => MemoryStats {
                rss_bytes: usage.physical_mem as u64,
                vss_bytes: usage.virtual_mem as u64,
            },
            None => MemoryStats::default(),
        }
    }
}

static TRIM_HINTS: AtomicU64 = AtomicU64::new(0);

/// Ask the allocator to hand freed pages back to the OS.
///
/// Best effort: only glibc exposes `malloc_trim`; elsewhere this just counts
/// the hint.
pub fn heap_trim_hint() {
    TRIM_HINTS.fetch_add(1, Ordering::Relaxed);
    #[cfg(all(target_os = "linux", target_env = "gnu"))]
    {
        // SAFETY: malloc_trim has no preconditions; it only walks the
        // allocator's own arenas.
        #[allow(unsafe_code)]
        let released = unsafe { libc::malloc_trim(0) };
        debug!(released = released != 0, "Heap trim hint issued");
    }
    #[cfg(not(all(target_os = "linux", target_env = "gnu")))]
    debug!("Heap trim hint not supported on this platform");
}

/// Number of heap hints issued since start.
#[must_use]
pub fn trim_hints() -> u64 {
    TRIM_HINTS.load(Ordering::Relaxed)
}
