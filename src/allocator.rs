//! The public allocator surface: tier dispatch, lifecycle, status reports
//! and the `GlobalAlloc` adapter.
//!
//! Dispatch is purely size-driven on allocation and purely header-driven on
//! free: the word in front of every block says which tier owns it, so
//! `free` and `size_of` need nothing but the pointer.

use std::alloc::{GlobalAlloc, Layout};
use std::hint;
use std::ptr::{self, null_mut, NonNull};
use std::sync::atomic::Ordering::{Acquire, Release};
use std::sync::atomic::AtomicU8;

use crate::header::{self, BLOCK_HEADER_SIZE, IS_FREE};
use crate::medium::{self, MAX_MEDIUM_BLOCK_SIZE, MEDIUM_NAMESPACES};
use crate::size_class::{class_for_request, MAX_SMALL_BLOCK_SIZE};
use crate::stats::{HeapStatus, SmallBlockOrder, SmallBlockStatus};
use crate::{large, realloc as realloc_impl, small, stats, Pointer};

const UNINITIALIZED: u8 = 0;
const INITIALIZING: u8 = 1;
const READY: u8 = 2;

static INIT_STATE: AtomicU8 = AtomicU8::new(UNINITIALIZED);

/// Initializes the allocator. Idempotent and thread-safe; the first caller
/// does the work while racing callers spin until the state is ready. Leaves
/// all statistics zeroed, all bins empty and all circular lists
/// self-referencing.
pub fn init() {
    ensure_init();
}

#[inline]
pub(crate) fn ensure_init() {
    if INIT_STATE.load(Acquire) == READY {
        return;
    }

    loop {
        match INIT_STATE.compare_exchange(UNINITIALIZED, INITIALIZING, Acquire, Acquire) {
            Ok(_) => {
                unsafe {
                    for namespace in 0..MEDIUM_NAMESPACES {
                        medium::init_namespace(namespace);
                    }
                }
                small::init_small();
                large::init_large();
                stats::reset_all();

                INIT_STATE.store(READY, Release);
                return;
            }
            Err(READY) => return,
            Err(_) => hint::spin_loop(),
        }
    }
}

/// Tears the heap down: drains the deferred free stacks through the normal
/// paths, reports leaks when compiled to, and returns every mapping to the
/// OS. Must not race any other allocator call.
pub fn shutdown() {
    if INIT_STATE.load(Acquire) != READY {
        return;
    }

    small::drain_all_deferred();
    for namespace in 0..MEDIUM_NAMESPACES {
        medium::drain_deferred(namespace);
    }

    #[cfg(feature = "report-leaks")]
    unsafe {
        crate::leak::report_leaks();
    }

    unsafe {
        for namespace in 0..MEDIUM_NAMESPACES {
            medium::release_all(namespace);
        }
        large::release_all();
    }

    // Reset the small records last; their pools died with the medium tier.
    small::init_small();
    stats::reset_all();

    INIT_STATE.store(UNINITIALIZED, Release);
}

/// Size-tier dispatch shared by `alloc` and the realloc move paths.
pub(crate) unsafe fn allocate_dispatch(size: usize) -> Pointer<u8> {
    let total = size + BLOCK_HEADER_SIZE;

    if total <= MAX_SMALL_BLOCK_SIZE {
        small::alloc_small(class_for_request(size), size)
    } else if total <= MAX_MEDIUM_BLOCK_SIZE {
        medium::alloc_medium(size)
    } else {
        large::alloc_large(size)
    }
}

/// Allocates `size` bytes. A zero size is treated as one byte. Returns null
/// only when the OS refuses to map memory.
pub fn alloc(size: usize) -> *mut u8 {
    ensure_init();
    let size = if size == 0 { 1 } else { size };

    unsafe { allocate_dispatch(size) }.map_or(null_mut(), NonNull::as_ptr)
}

/// Allocates `size` zeroed bytes. Large blocks come straight from a fresh
/// OS mapping and skip the memset.
pub fn alloc_zeroed(size: usize) -> *mut u8 {
    ensure_init();
    let size = if size == 0 { 1 } else { size };

    unsafe {
        if size + BLOCK_HEADER_SIZE > MAX_MEDIUM_BLOCK_SIZE {
            return large::alloc_large(size).map_or(null_mut(), NonNull::as_ptr);
        }

        match allocate_dispatch(size) {
            Some(user) => {
                user.as_ptr().write_bytes(0, size);
                user.as_ptr()
            }
            None => null_mut(),
        }
    }
}

/// Frees the block at `ptr`, returning its nominal block size. Returns 0
/// for a null pointer and for a block whose header already carries the free
/// flag (double free).
///
/// # Safety
///
/// `ptr` must be null or a pointer previously returned by this allocator
/// and not freed since (modulo the double-free guard above).
pub unsafe fn free(ptr: *mut u8) -> usize {
    let Some(user) = NonNull::new(ptr) else {
        return 0;
    };

    free_dispatch(user)
}

pub(crate) unsafe fn free_dispatch(user: NonNull<u8>) -> usize {
    let word = header::read(user);
    if word & IS_FREE != 0 {
        // Double free: refuse without touching anything.
        return 0;
    }

    if header::is_small(word) {
        small::free_small(user)
    } else if header::is_medium(word) {
        medium::free_medium(user)
    } else {
        debug_assert!(header::is_large(word));
        large::free_large(user)
    }
}

/// Frees like [`free`], with the size the caller believes the block has.
/// The header stays authoritative; the size only feeds a debug assertion.
/// Returns the nominal size as a signed value, 0 for null.
///
/// # Safety
///
/// Same contract as [`free`].
pub unsafe fn free_sized(ptr: *mut u8, size: usize) -> isize {
    let Some(user) = NonNull::new(ptr) else {
        return 0;
    };

    debug_assert!(size <= size_of(ptr), "free_sized: size exceeds the block");
    free_dispatch(user) as isize
}

/// Reallocates the block in `*slot` to `size` bytes, writing the surviving
/// pointer back through `slot`.
///
/// A null `*slot` allocates; `size == 0` frees and writes null back. On OS
/// failure the function returns null and leaves `*slot` (and the block)
/// untouched.
///
/// # Safety
///
/// `*slot` must be null or a live pointer from this allocator.
pub unsafe fn realloc(slot: &mut *mut u8, size: usize) -> *mut u8 {
    ensure_init();

    if size == 0 {
        if let Some(user) = NonNull::new(*slot) {
            free_dispatch(user);
        }
        *slot = null_mut();
        return null_mut();
    }

    match NonNull::new(*slot) {
        None => {
            let allocated = allocate_dispatch(size).map_or(null_mut(), NonNull::as_ptr);
            if !allocated.is_null() {
                *slot = allocated;
            }
            allocated
        }
        Some(user) => match realloc_impl::reallocate(user, size) {
            Some(moved) => {
                *slot = moved.as_ptr();
                moved.as_ptr()
            }
            None => null_mut(),
        },
    }
}

/// Usable bytes of the block at `ptr`; 0 for null.
///
/// # Safety
///
/// `ptr` must be null or a live pointer from this allocator.
pub unsafe fn size_of(ptr: *const u8) -> usize {
    let Some(user) = NonNull::new(ptr as *mut u8) else {
        return 0;
    };

    let word = header::read(user);
    if header::is_small(word) {
        small::usable_of(user)
    } else if header::is_medium(word) {
        header::size_of_word(word) - BLOCK_HEADER_SIZE
    } else {
        large::size_of_large(user)
    }
}

/// Snapshot of the per-tier statistics.
pub fn current_heap_status() -> HeapStatus {
    ensure_init();
    stats::heap_status()
}

/// Per-class small block usage, at most `max` rows, in the given order.
pub fn small_block_status(max: usize, order: SmallBlockOrder) -> Vec<SmallBlockStatus> {
    ensure_init();
    small::block_status(max, order)
}

/// Per-class lock contention (sleep counts), worst first, at most `max`
/// rows.
pub fn small_block_contention(max: usize) -> Vec<(u32, u64)> {
    ensure_init();
    small::block_contention(max)
}

/// `GlobalAlloc` adapter.
///
/// The native entry points guarantee word alignment only (user pointers are
/// 8-byte aligned). Layouts with larger alignments over-allocate and stash
/// the real block pointer one word before the aligned address, where
/// `dealloc` finds it again:
///
/// ```text
/// +---------------------------+
/// | header | padding ...      |
/// |    +----------------------+
/// |    | original user ptr    | <- back pointer, aligned address - 8
/// +----+----------------------+ <- aligned address handed to the caller
/// |       caller content      |
/// +---------------------------+
/// ```
///
/// # Examples
///
/// ```no_run
/// use tieralloc::TierAlloc;
///
/// #[global_allocator]
/// static ALLOCATOR: TierAlloc = TierAlloc;
///
/// fn main() {
///     let data = vec![1u8, 2, 3];
///     assert_eq!(data.len(), 3);
/// }
/// ```
pub struct TierAlloc;

/// Alignment the native allocation paths guarantee.
const NATIVE_ALIGN: usize = BLOCK_HEADER_SIZE;

unsafe impl GlobalAlloc for TierAlloc {
    unsafe fn alloc(&self, layout: Layout) -> *mut u8 {
        if layout.align() <= NATIVE_ALIGN {
            return alloc(layout.size());
        }

        // Room for the worst-case padding plus the back pointer.
        let raw = alloc(layout.size() + layout.align() + BLOCK_HEADER_SIZE);
        if raw.is_null() {
            return raw;
        }

        let aligned = (raw as usize + BLOCK_HEADER_SIZE + layout.align() - 1)
            & !(layout.align() - 1);
        let back_pointer = (aligned - BLOCK_HEADER_SIZE) as *mut *mut u8;
        *back_pointer = raw;

        aligned as *mut u8
    }

    unsafe fn dealloc(&self, ptr: *mut u8, layout: Layout) {
        if ptr.is_null() {
            return;
        }

        if layout.align() <= NATIVE_ALIGN {
            free(ptr);
        } else {
            let back_pointer = (ptr as usize - BLOCK_HEADER_SIZE) as *mut *mut u8;
            free(*back_pointer);
        }
    }

    unsafe fn alloc_zeroed(&self, layout: Layout) -> *mut u8 {
        if layout.align() <= NATIVE_ALIGN {
            return alloc_zeroed(layout.size());
        }

        let ptr = self.alloc(layout);
        if !ptr.is_null() {
            ptr.write_bytes(0, layout.size());
        }
        ptr
    }

    unsafe fn realloc(&self, ptr: *mut u8, layout: Layout, new_size: usize) -> *mut u8 {
        if layout.align() <= NATIVE_ALIGN {
            let mut slot = ptr;
            return realloc(&mut slot, new_size);
        }

        // Over-aligned blocks move; the padding offset differs per block,
        // so in-place resizing can't be relied on.
        let new_layout = Layout::from_size_align_unchecked(new_size, layout.align());
        let new_ptr = self.alloc(new_layout);
        if !new_ptr.is_null() {
            ptr::copy_nonoverlapping(ptr, new_ptr, layout.size().min(new_size));
            self.dealloc(ptr, layout);
        }
        new_ptr
    }
}

#[cfg(test)]
mod tests {
    use std::sync::Barrier;
    use std::thread;

    use rand::{seq::SliceRandom, Rng};

    use super::*;
    use crate::test_support::heap_test_lock;

    #[test]
    fn size_of_covers_the_request_across_tiers() {
        let _guard = heap_test_lock();
        init();

        // One size per tier plus the boundaries.
        for size in [
            1usize,
            40,
            2600,
            2601,
            5000,
            MAX_MEDIUM_BLOCK_SIZE - BLOCK_HEADER_SIZE,
            MAX_MEDIUM_BLOCK_SIZE,
            1 << 20,
            1 << 30,
        ] {
            let p = alloc(size);
            assert!(!p.is_null(), "alloc({size})");
            unsafe {
                assert!(size_of(p) >= size, "size_of(alloc({size}))");
                assert!(free(p) > 0);
            }
        }
    }

    #[test]
    fn nominal_small_free_size() {
        let _guard = heap_test_lock();
        init();

        let p = alloc(40);
        unsafe {
            p.write_bytes(0xAA, 40);
            assert_eq!(free(p), 48);
        }
    }

    #[test]
    fn double_free_returns_zero_and_changes_nothing() {
        let _guard = heap_test_lock();
        init();

        unsafe {
            let p = alloc(40);
            let q = alloc(40);
            q.write_bytes(0x77, 40);

            assert_eq!(free(p), 48);
            // Second free of the same pointer is refused.
            assert_eq!(free(p), 0);

            // The neighbour block is untouched.
            for i in 0..40 {
                assert_eq!(q.add(i).read(), 0x77);
            }
            assert_eq!(free(q), 48);
        }
    }

    #[test]
    fn free_and_realloc_of_null() {
        let _guard = heap_test_lock();
        init();

        unsafe {
            assert_eq!(free(null_mut()), 0);
            assert_eq!(free_sized(null_mut(), 10), 0);

            // Realloc on a null slot allocates...
            let mut slot = null_mut();
            let p = realloc(&mut slot, 100);
            assert!(!p.is_null());
            assert_eq!(slot, p);

            // ...and realloc to zero frees and nulls the slot.
            assert!(realloc(&mut slot, 0).is_null());
            assert!(slot.is_null());
        }
    }

    #[test]
    fn alloc_zeroed_is_zeroed_in_every_tier() {
        let _guard = heap_test_lock();
        init();

        for size in [40usize, 5000, 400_000] {
            // Dirty a block first so the small/medium recycling paths have
            // something to scrub.
            let dirty = alloc(size);
            unsafe {
                dirty.write_bytes(0xFF, size);
                free(dirty);
            }

            let p = alloc_zeroed(size);
            unsafe {
                for i in (0..size).step_by(97) {
                    assert_eq!(p.add(i).read(), 0, "byte {i} of {size}");
                }
                free(p);
            }
        }
    }

    #[test]
    fn realloc_preserves_content_across_classes() {
        let _guard = heap_test_lock();
        init();

        unsafe {
            let mut slot = alloc(100);
            for i in 0..100 {
                slot.add(i).write(i as u8);
            }

            let grown = realloc(&mut slot, 200);
            assert_eq!(grown, slot);
            assert!(size_of(slot) >= 200);
            for i in 0..100 {
                assert_eq!(slot.add(i).read(), i as u8);
            }

            free(slot);
        }
    }

    #[test]
    fn heap_status_tracks_tiers() {
        let _guard = heap_test_lock();
        shutdown();
        init();

        let baseline = current_heap_status();
        assert_eq!(baseline.small.current_bytes, 0);
        assert_eq!(baseline.medium.current_bytes, 0);
        assert_eq!(baseline.large.current_bytes, 0);

        let p = alloc(40);
        let q = alloc(10_000);
        let r = alloc(1_000_000);

        let status = current_heap_status();
        assert_eq!(status.small.current_bytes, 48);
        assert!(status.medium.current_bytes >= 10_000);
        assert!(status.large.current_bytes >= 1_000_000);
        assert_eq!(status.small.alloc_count, 1);
        assert_eq!(status.medium.alloc_count, 1);
        assert_eq!(status.large.alloc_count, 1);

        unsafe {
            free(p);
            free(q);
            free(r);
        }

        let drained = current_heap_status();
        assert_eq!(drained.small.current_bytes, 0);
        assert_eq!(drained.medium.current_bytes, 0);
        assert_eq!(drained.large.current_bytes, 0);
    }

    #[test]
    fn small_block_reports() {
        let _guard = heap_test_lock();
        shutdown();
        init();

        let p = alloc(40);
        let rows = small_block_status(usize::MAX, SmallBlockOrder::CurrentAllocations);
        let row = rows.iter().find(|row| row.block_size == 48).unwrap();
        assert!(row.total >= 1);
        assert!(row.current >= 1);

        // Ordered report is sorted by size.
        let by_size = small_block_status(10, SmallBlockOrder::BlockSize);
        assert!(by_size.windows(2).all(|w| w[0].block_size <= w[1].block_size));

        let contention = small_block_contention(5);
        assert!(contention.len() <= 5);

        unsafe {
            free(p);
        }
    }

    #[test]
    fn reinit_leaves_a_pristine_heap() {
        let _guard = heap_test_lock();
        init();

        let p = alloc(40);
        unsafe {
            free(p);
        }

        shutdown();
        init();

        let status = current_heap_status();
        assert_eq!(status, HeapStatus::default());
        assert!(small_block_status(usize::MAX, SmallBlockOrder::BlockSize)
            .iter()
            .all(|row| row.total == 0 && row.current == 0));
    }

    #[test]
    fn global_alloc_honours_large_alignments() {
        let _guard = heap_test_lock();
        init();

        unsafe {
            for align in [16usize, 64, 4096] {
                let layout = Layout::from_size_align(100, align).unwrap();
                let p = TierAlloc.alloc(layout);
                assert!(!p.is_null());
                assert_eq!(p as usize % align, 0, "align {align}");

                p.write_bytes(0xCD, 100);
                TierAlloc.dealloc(p, layout);
            }
        }
    }

    /// Closed working set stress: every slot holds a pattern that is
    /// verified before the slot is freed or reallocated.
    #[test]
    fn random_ops_never_corrupt_the_working_set() {
        let _guard = heap_test_lock();
        init();

        let threads = 4;
        let ops = 2_000;
        let slots_per_thread = 32;
        let barrier = Barrier::new(threads);

        thread::scope(|scope| {
            for seed in 0..threads {
                let barrier = &barrier;
                scope.spawn(move || {
                    let mut rng = rand::thread_rng();
                    let sizes = [16usize, 48, 100, 300, 2600, 5000, 70_000, 400_000];
                    let mut slots: Vec<(*mut u8, usize, u8)> = Vec::new();

                    barrier.wait();

                    for op in 0..ops {
                        let roll: u8 = rng.gen();

                        if slots.len() < slots_per_thread && (roll < 160 || slots.is_empty()) {
                            let size = *sizes.choose(&mut rng).unwrap();
                            let pattern = (seed * 31 + op) as u8;
                            let p = alloc(size);
                            assert!(!p.is_null());
                            unsafe {
                                p.write_bytes(pattern, size);
                            }
                            slots.push((p, size, pattern));
                        } else if roll < 208 || slots.len() == slots_per_thread {
                            let index = rng.gen_range(0..slots.len());
                            let (p, size, pattern) = slots.swap_remove(index);
                            unsafe {
                                for i in (0..size).step_by(131) {
                                    assert_eq!(p.add(i).read(), pattern);
                                }
                                assert!(free(p) > 0);
                            }
                        } else {
                            let index = rng.gen_range(0..slots.len());
                            let (p, size, pattern) = slots[index];
                            let new_size = *sizes.choose(&mut rng).unwrap();
                            let mut slot = p;
                            unsafe {
                                let moved = realloc(&mut slot, new_size);
                                assert!(!moved.is_null());
                                let keep = size.min(new_size);
                                for i in (0..keep).step_by(131) {
                                    assert_eq!(slot.add(i).read(), pattern);
                                }
                                slot.write_bytes(pattern, new_size);
                            }
                            slots[index] = (slot, new_size, pattern);
                        }
                    }

                    for (p, size, pattern) in slots {
                        unsafe {
                            for i in (0..size).step_by(131) {
                                assert_eq!(p.add(i).read(), pattern);
                            }
                            assert!(free(p) > 0);
                        }
                    }
                });
            }
        });

        unsafe {
            crate::medium::check_no_adjacent_free(crate::medium::USER_NAMESPACE);
            crate::medium::check_bin_invariants(crate::medium::USER_NAMESPACE);
        }
    }

    /// Tiny-class contention: the round-robin arenas keep the threads off
    /// each other's locks.
    #[test]
    fn tiny_alloc_free_under_contention() {
        let _guard = heap_test_lock();
        init();

        let threads = 8;
        let iterations = 20_000;
        let barrier = Barrier::new(threads);

        thread::scope(|scope| {
            for _ in 0..threads {
                let barrier = &barrier;
                scope.spawn(move || {
                    barrier.wait();
                    for _ in 0..iterations {
                        let p = alloc(48);
                        assert!(!p.is_null());
                        unsafe {
                            p.write(0xA5);
                            assert_eq!(p.read(), 0xA5);
                            free(p);
                        }
                    }
                });
            }
        });
    }
}
