//! Allocation statistics.
//!
//! Each tier keeps current bytes, cumulative bytes, alloc and free counts;
//! peak tracking and sleep-cycle accounting only run under the `debug`
//! feature. All counters are relaxed atomics: they are approximate
//! bookkeeping for the status reports, not synchronization.

use std::sync::atomic::Ordering::Relaxed;
use std::sync::atomic::{AtomicU64, AtomicUsize};

use crate::platform;

/// Snapshot of one tier's counters.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct TierStats {
    pub current_bytes: usize,
    pub cumulative_bytes: u64,
    pub peak_bytes: usize,
    pub alloc_count: u64,
    pub free_count: u64,
}

/// Snapshot of the whole heap, as returned by
/// [`current_heap_status`](crate::current_heap_status).
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct HeapStatus {
    pub small: TierStats,
    pub medium: TierStats,
    pub large: TierStats,
    /// Times any allocator lock released its thread to the OS.
    pub sleep_count: u64,
    /// Timestamp-counter cycles spent in those sleeps (`debug` + x86-64
    /// only, zero otherwise).
    pub sleep_cycles: u64,
}

/// Sort order for [`small_block_status`](crate::small_block_status).
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SmallBlockOrder {
    BlockSize,
    TotalAllocations,
    CurrentAllocations,
}

/// One row of the small-block usage report.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct SmallBlockStatus {
    pub block_size: u32,
    /// Cumulative allocations of this class.
    pub total: u64,
    /// Blocks currently allocated.
    pub current: u64,
}

pub(crate) struct TierCounters {
    current_bytes: AtomicUsize,
    cumulative_bytes: AtomicU64,
    peak_bytes: AtomicUsize,
    alloc_count: AtomicU64,
    free_count: AtomicU64,
}

impl TierCounters {
    pub(crate) const fn new() -> Self {
        Self {
            current_bytes: AtomicUsize::new(0),
            cumulative_bytes: AtomicU64::new(0),
            peak_bytes: AtomicUsize::new(0),
            alloc_count: AtomicU64::new(0),
            free_count: AtomicU64::new(0),
        }
    }

    #[inline]
    pub(crate) fn on_alloc(&self, bytes: usize) {
        let current = self.current_bytes.fetch_add(bytes, Relaxed) + bytes;
        self.cumulative_bytes.fetch_add(bytes as u64, Relaxed);
        self.alloc_count.fetch_add(1, Relaxed);

        if cfg!(feature = "debug") {
            self.peak_bytes.fetch_max(current, Relaxed);
        }
    }

    /// In-place reallocation: adjusts the byte gauges without counting an
    /// alloc/free pair.
    #[inline]
    pub(crate) fn on_resize(&self, old_bytes: usize, new_bytes: usize) {
        if new_bytes >= old_bytes {
            let grown = new_bytes - old_bytes;
            let current = self.current_bytes.fetch_add(grown, Relaxed) + grown;
            self.cumulative_bytes.fetch_add(grown as u64, Relaxed);
            if cfg!(feature = "debug") {
                self.peak_bytes.fetch_max(current, Relaxed);
            }
        } else {
            self.current_bytes.fetch_sub(old_bytes - new_bytes, Relaxed);
        }
    }

    #[inline]
    pub(crate) fn on_free(&self, bytes: usize) {
        self.current_bytes.fetch_sub(bytes, Relaxed);
        self.free_count.fetch_add(1, Relaxed);
    }

    pub(crate) fn snapshot(&self) -> TierStats {
        TierStats {
            current_bytes: self.current_bytes.load(Relaxed),
            cumulative_bytes: self.cumulative_bytes.load(Relaxed),
            peak_bytes: self.peak_bytes.load(Relaxed),
            alloc_count: self.alloc_count.load(Relaxed),
            free_count: self.free_count.load(Relaxed),
        }
    }

    pub(crate) fn reset(&self) {
        self.current_bytes.store(0, Relaxed);
        self.cumulative_bytes.store(0, Relaxed);
        self.peak_bytes.store(0, Relaxed);
        self.alloc_count.store(0, Relaxed);
        self.free_count.store(0, Relaxed);
    }
}

pub(crate) static SMALL: TierCounters = TierCounters::new();
pub(crate) static MEDIUM: TierCounters = TierCounters::new();
pub(crate) static LARGE: TierCounters = TierCounters::new();

static SLEEP_COUNT: AtomicU64 = AtomicU64::new(0);
static SLEEP_CYCLES: AtomicU64 = AtomicU64::new(0);

#[inline]
pub(crate) fn record_sleeps(count: u64) {
    if count != 0 {
        SLEEP_COUNT.fetch_add(count, Relaxed);
    }
}

/// Yields to the OS, charging the elapsed timestamp-counter cycles to the
/// sleep statistics when cycle accounting is compiled in. The counter read
/// is skipped entirely otherwise, so virtualized environments with an
/// emulated TSC pay nothing by default.
#[inline]
pub(crate) fn timed_yield() {
    #[cfg(all(feature = "debug", target_arch = "x86_64", not(miri)))]
    {
        let start = unsafe { std::arch::x86_64::_rdtsc() };
        platform::yield_thread();
        let elapsed = unsafe { std::arch::x86_64::_rdtsc() }.wrapping_sub(start);
        SLEEP_CYCLES.fetch_add(elapsed, Relaxed);
        return;
    }

    #[allow(unreachable_code)]
    platform::yield_thread();
}

pub(crate) fn heap_status() -> HeapStatus {
    HeapStatus {
        small: SMALL.snapshot(),
        medium: MEDIUM.snapshot(),
        large: LARGE.snapshot(),
        sleep_count: SLEEP_COUNT.load(Relaxed),
        sleep_cycles: SLEEP_CYCLES.load(Relaxed),
    }
}

/// Zeroes every counter. Initialization leaves a pristine statistics state
/// behind.
pub(crate) fn reset_all() {
    SMALL.reset();
    MEDIUM.reset();
    LARGE.reset();
    SLEEP_COUNT.store(0, Relaxed);
    SLEEP_CYCLES.store(0, Relaxed);
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn tier_counters_balance() {
        let counters = TierCounters::new();
        counters.on_alloc(48);
        counters.on_alloc(112);
        counters.on_free(48);

        let snapshot = counters.snapshot();
        assert_eq!(snapshot.current_bytes, 112);
        assert_eq!(snapshot.cumulative_bytes, 160);
        assert_eq!(snapshot.alloc_count, 2);
        assert_eq!(snapshot.free_count, 1);
    }
}
