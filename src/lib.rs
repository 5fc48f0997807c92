//! A general-purpose, multi-thread-friendly heap allocator for 64-bit
//! systems, built directly on OS virtual memory (no libc).
//!
//! Allocations are organized in four size tiers, each with its own data
//! structures and locking discipline:
//!
//! ```text
//! +--------+----------------+---------------------------------------------+
//! | Tier   | Block size     | Backing                                     |
//! +--------+----------------+---------------------------------------------+
//! | Tiny   | <= 128 B       | round-robin arenas of per-size pools        |
//! | Small  | <= 2608 B      | per-size-class pools fed from the medium    |
//! |        |                | tier                                        |
//! | Medium | <= ~260 KiB    | 1.25 MiB super-pools, bitmap-indexed bins,  |
//! |        |                | immediate coalescing                        |
//! | Large  | anything above | direct OS map/unmap, in-place growth where  |
//! |        |                | the kernel cooperates                       |
//! +--------+----------------+---------------------------------------------+
//! ```
//!
//! Every tier lock is a test-and-set byte that spins briefly and then
//! yields; a `free` that loses the race never blocks, it pushes the block
//! onto a lock-less stack that the next lock holder drains. Tiny classes
//! are replicated over multiple arenas so threads hammering the same size
//! spread over independent locks.
//!
//! The crate exposes the classic C-heap style entry points ([`alloc`],
//! [`alloc_zeroed`], [`free`], [`realloc`], [`size_of`]), status reports
//! for tooling, and a [`TierAlloc`] adapter implementing
//! [`std::alloc::GlobalAlloc`].
//!
//! # Features
//!
//! - `server`: ERMS bulk copies for large moves.
//! - `boost`: tiny tier covers blocks up to 256 bytes; small-pool backing
//!   gets a dedicated medium namespace.
//! - `booster`: 127 tiny arenas with per-thread arena hashing.
//! - `no-remap`: never use the kernel remap primitive.
//! - `debug`: peak tracking and sleep-cycle accounting.
//! - `report-leaks`: walk the heap on shutdown and report live blocks.

use std::ptr::NonNull;

mod allocator;
mod cpu;
mod header;
mod large;
#[cfg(feature = "report-leaks")]
mod leak;
mod list;
mod medium;
mod platform;
mod realloc;
mod size_class;
mod small;
mod stats;
mod sync;

/// Non-null pointer to `T`. We use this in most cases instead of `*mut T`
/// because the compiler will yell at us if we don't write code for the
/// `None` case.
pub(crate) type Pointer<T> = Option<NonNull<T>>;

pub use allocator::{
    alloc, alloc_zeroed, current_heap_status, free, free_sized, init, realloc, shutdown, size_of,
    small_block_contention, small_block_status, TierAlloc,
};
pub use stats::{HeapStatus, SmallBlockOrder, SmallBlockStatus, TierStats};

#[cfg(test)]
pub(crate) mod test_support {
    //! The allocator state is a process-wide singleton, so every test that
    //! touches the heap serializes on this lock.

    use std::sync::{Mutex, MutexGuard, PoisonError};

    static HEAP_TEST_LOCK: Mutex<()> = Mutex::new(());

    pub(crate) fn heap_test_lock() -> MutexGuard<'static, ()> {
        HEAP_TEST_LOCK
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
    }
}
