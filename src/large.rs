//! Large tier: blocks above the medium range map straight from the OS and
//! live in one circular list guarded by a single lock.
//!
//! The large header sits at the end of a pad granule so the user area is an
//! exact multiple of the allocation granularity:
//!
//! ```text
//! +-----------------------------+ <- mapped base
//! |  pad (page / 64 KiB)        |
//! |  ...                        |
//! | prev | next | user | flags  | <- 32 byte header, flags word at user - 8
//! +-----------------------------+ <- user pointer, granularity multiple
//! |  user area (n x 64 KiB)     |
//! +-----------------------------+
//! ```
//!
//! Mapping and unmapping happen outside the lock; the lock only covers the
//! list links. On Linux, blocks of 4 MiB and up round to 2 MiB granularity
//! so the kernel can back them with transparent huge pages and service
//! `mremap` at page-table level.

use std::cell::UnsafeCell;
use std::ptr::{null_mut, NonNull};

use crate::header::{IS_FREE, IS_LARGE, LARGE_SEGMENTED, PAYLOAD_MASK};
use crate::sync::{ByteLock, LARGE_SPIN_LIMIT};
use crate::{platform, stats, Pointer};

/// Large block granularity.
pub(crate) const LARGE_GRANULARITY: usize = 64 * 1024;

/// PMD-aligned granularity used for huge blocks on Linux.
pub(crate) const HUGE_GRANULARITY: usize = 2 * 1024 * 1024;

/// Blocks at least this big use [`HUGE_GRANULARITY`] on Linux.
pub(crate) const HUGE_THRESHOLD: usize = 4 * 1024 * 1024;

#[repr(C)]
struct LargeHeader {
    prev: *mut LargeHeader,
    next: *mut LargeHeader,
    /// Bytes the caller actually asked for; bounds the copy on a move.
    user_size: usize,
    /// Usable size (granularity multiple) tagged with [`IS_LARGE`] and,
    /// after a Windows in-place grow, [`LARGE_SEGMENTED`].
    size_flags: usize,
}

const LARGE_HEADER_SIZE: usize = std::mem::size_of::<LargeHeader>();
const _: () = assert!(LARGE_HEADER_SIZE == 32);

struct LargeState {
    lock: ByteLock,
    /// Sentinel of the circular block list.
    sentinel: UnsafeCell<LargeHeader>,
}

// The sentinel is only touched under `lock`.
unsafe impl Sync for LargeState {}

static LARGE_STATE: LargeState = LargeState {
    lock: ByteLock::new(),
    sentinel: UnsafeCell::new(LargeHeader {
        prev: null_mut(),
        next: null_mut(),
        user_size: 0,
        size_flags: 0,
    }),
};

#[inline]
fn granularity_for(user_size: usize) -> usize {
    if cfg!(target_os = "linux") && user_size >= HUGE_THRESHOLD {
        HUGE_GRANULARITY
    } else {
        LARGE_GRANULARITY
    }
}

#[inline]
fn round_to(size: usize, granularity: usize) -> usize {
    (size + granularity - 1) & !(granularity - 1)
}

/// Pad in front of the user area holding the header. One allocation
/// granule on Windows (VirtualAlloc hands out 64 KiB aligned regions), one
/// page elsewhere.
#[inline]
fn header_pad() -> usize {
    if cfg!(windows) {
        LARGE_GRANULARITY
    } else {
        platform::page_size()
    }
}

#[inline]
unsafe fn header_of(user: NonNull<u8>) -> *mut LargeHeader {
    user.as_ptr().sub(LARGE_HEADER_SIZE) as *mut LargeHeader
}

#[inline]
unsafe fn mapping_of(user: NonNull<u8>, usable: usize) -> (NonNull<u8>, usize) {
    let pad = header_pad();
    (
        NonNull::new_unchecked(user.as_ptr().sub(pad)),
        pad + usable,
    )
}

unsafe fn link(block: *mut LargeHeader) {
    let sleeps = LARGE_STATE.lock.acquire(LARGE_SPIN_LIMIT);
    stats::record_sleeps(sleeps);

    let sentinel = LARGE_STATE.sentinel.get();
    (*block).prev = sentinel;
    (*block).next = (*sentinel).next;
    (*(*sentinel).next).prev = block;
    (*sentinel).next = block;

    LARGE_STATE.lock.release();
}

unsafe fn unlink(block: *mut LargeHeader) {
    let sleeps = LARGE_STATE.lock.acquire(LARGE_SPIN_LIMIT);
    stats::record_sleeps(sleeps);

    (*(*block).prev).next = (*block).next;
    (*(*block).next).prev = (*block).prev;

    LARGE_STATE.lock.release();
}

/// Allocates a large block. The returned user area is zeroed by the OS
/// (fresh anonymous mapping), which `alloc_zeroed` relies on.
pub(crate) unsafe fn alloc_large(user_size: usize) -> Pointer<u8> {
    let usable = round_to(user_size, granularity_for(user_size));
    let pad = header_pad();

    let base = platform::request_memory(pad + usable)?;
    let user = NonNull::new_unchecked(base.as_ptr().add(pad));

    let block = header_of(user);
    (*block).user_size = user_size;
    (*block).size_flags = usable | IS_LARGE;
    link(block);

    stats::LARGE.on_alloc(usable);
    Some(user)
}

/// Frees a large block, returning its usable size. The caller has already
/// rejected double frees via the header flag.
pub(crate) unsafe fn free_large(user: NonNull<u8>) -> usize {
    let block = header_of(user);
    let flags = (*block).size_flags;
    let usable = flags & PAYLOAD_MASK;

    unlink(block);
    // Mark the header in case the mapping lingers (catches a double free
    // until the OS reuses the pages).
    (*block).size_flags = flags | IS_FREE;
    stats::LARGE.on_free(usable);

    let (base, length) = mapping_of(user, usable);
    release_mapping(base, length, flags & LARGE_SEGMENTED != 0);

    usable
}

unsafe fn release_mapping(base: NonNull<u8>, length: usize, segmented: bool) {
    #[cfg(all(windows, not(miri)))]
    if segmented {
        platform::return_segments(base, length);
        return;
    }

    let _ = segmented;
    platform::return_memory(base, length);
}

/// Usable size of a large block.
pub(crate) unsafe fn size_of_large(user: NonNull<u8>) -> usize {
    (*header_of(user)).size_flags & PAYLOAD_MASK
}

/// Reallocates within the large tier. The caller guarantees the new size
/// is still a large size. Returns the new user pointer, null only on OS
/// failure.
pub(crate) unsafe fn realloc_large(user: NonNull<u8>, new_size: usize) -> Pointer<u8> {
    let block = header_of(user);
    let usable = (*block).size_flags & PAYLOAD_MASK;

    // Shrink window: keep the block while at least half stays in use.
    if new_size <= usable {
        if new_size >= usable / 2 {
            (*block).user_size = new_size;
            return Some(user);
        }
        return move_allocation(user, new_size, new_size);
    }

    // Overshoot growth so repeated doubling patterns amortize: 12.5% above
    // 128 MiB, 25% below.
    let overshoot = if usable > 128 * 1024 * 1024 {
        new_size.max(usable + usable / 8)
    } else {
        new_size.max(usable + usable / 4)
    };

    if let Some(grown) = grow_in_place(user, new_size, overshoot) {
        return Some(grown);
    }

    move_allocation(user, new_size, overshoot)
}

/// Platform in-place growth: kernel remap on Linux, adjacent-region commit
/// on Windows. Returns the surviving user pointer (which may have moved on
/// Linux) or `None` when the platform can't help.
unsafe fn grow_in_place(user: NonNull<u8>, new_size: usize, overshoot: usize) -> Pointer<u8> {
    let block = header_of(user);
    let flags = (*block).size_flags;
    let usable = flags & PAYLOAD_MASK;
    let pad = header_pad();
    let new_usable = round_to(overshoot, granularity_for(overshoot));

    #[cfg(all(target_os = "linux", not(miri), not(feature = "no-remap")))]
    {
        // A segment-free mapping can be remapped wholesale; the kernel
        // moves page tables instead of bytes. The block leaves the list for
        // the duration because its address may change.
        unlink(block);
        let (base, length) = mapping_of(user, usable);
        match platform::remap_memory(base, length, pad + new_usable) {
            Some(new_base) => {
                let new_user = NonNull::new_unchecked(new_base.as_ptr().add(pad));
                let new_block = header_of(new_user);
                (*new_block).user_size = new_size;
                (*new_block).size_flags = new_usable | IS_LARGE;
                link(new_block);

                stats::LARGE.on_resize(usable, new_usable);
                return Some(new_user);
            }
            None => {
                link(block);
                return None;
            }
        }
    }

    #[cfg(all(windows, not(miri)))]
    {
        let (base, length) = mapping_of(user, usable);
        let extra = new_usable - usable;
        if platform::free_region_after(base, length) >= extra
            && platform::extend_at(base.as_ptr().add(length), extra)
        {
            (*block).user_size = new_size;
            (*block).size_flags = new_usable | IS_LARGE | LARGE_SEGMENTED;
            stats::LARGE.on_resize(usable, new_usable);
            return Some(user);
        }
        return None;
    }

    #[allow(unreachable_code)]
    {
        let _ = (new_size, new_usable, pad, flags);
        None
    }
}

/// The move fallback: map a new block, copy the live content, release the
/// old mapping.
unsafe fn move_allocation(user: NonNull<u8>, new_size: usize, alloc_size: usize) -> Pointer<u8> {
    let block = header_of(user);
    let live = (*block).user_size.min(new_size);

    let new_user = alloc_large(alloc_size)?;
    crate::cpu::copy_bytes(user.as_ptr(), new_user.as_ptr(), live);
    (*header_of(new_user)).user_size = new_size;
    free_large(user);

    Some(new_user)
}

/// Walks every live large block. Shutdown/leak-walk only.
#[cfg(feature = "report-leaks")]
pub(crate) unsafe fn walk_allocated(mut visit: impl FnMut(NonNull<u8>, usize)) {
    let sentinel = LARGE_STATE.sentinel.get();
    let mut block = (*sentinel).next;
    while !block.is_null() && block != sentinel {
        let user = NonNull::new_unchecked((block as *mut u8).add(LARGE_HEADER_SIZE));
        visit(user, (*block).size_flags & PAYLOAD_MASK);
        block = (*block).next;
    }
}

/// Unmaps every large block and resets the list. Single-threaded shutdown
/// only.
pub(crate) unsafe fn release_all() {
    let sentinel = LARGE_STATE.sentinel.get();
    let mut block = (*sentinel).next;
    while !block.is_null() && block != sentinel {
        let next = (*block).next;
        let flags = (*block).size_flags;
        let usable = flags & PAYLOAD_MASK;
        let user = NonNull::new_unchecked((block as *mut u8).add(LARGE_HEADER_SIZE));
        let (base, length) = mapping_of(user, usable);
        release_mapping(base, length, flags & LARGE_SEGMENTED != 0);
        block = next;
    }

    init_large();
}

/// (Re)initializes the list sentinel. Single-threaded init only.
pub(crate) fn init_large() {
    let sentinel = LARGE_STATE.sentinel.get();
    unsafe {
        (*sentinel).prev = sentinel;
        (*sentinel).next = sentinel;
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::test_support::heap_test_lock;

    #[test]
    fn usable_size_is_a_granularity_multiple() {
        let _guard = heap_test_lock();
        crate::init();

        unsafe {
            let p = alloc_large(1_000_000).unwrap();
            let usable = size_of_large(p);
            assert!(usable >= 1_000_000);
            assert_eq!(usable % LARGE_GRANULARITY, 0);
            assert_eq!(free_large(p), usable);
        }
    }

    #[cfg(target_os = "linux")]
    #[test]
    fn huge_blocks_round_to_pmd_granularity() {
        let _guard = heap_test_lock();
        crate::init();

        unsafe {
            let p = alloc_large(5 * 1024 * 1024).unwrap();
            assert_eq!(size_of_large(p) % HUGE_GRANULARITY, 0);
            free_large(p);
        }
    }

    #[test]
    fn grow_and_shrink_preserve_content() {
        let _guard = heap_test_lock();
        crate::init();

        unsafe {
            let p = alloc_large(500_000).unwrap();
            for i in 0..400_000usize {
                p.as_ptr().add(i).write((i % 251) as u8);
            }

            let q = realloc_large(p, 2_000_000).unwrap();
            for i in 0..400_000usize {
                assert_eq!(q.as_ptr().add(i).read(), (i % 251) as u8);
            }

            let r = realloc_large(q, 400_000).unwrap();
            for i in 0..400_000usize {
                assert_eq!(r.as_ptr().add(i).read(), (i % 251) as u8);
            }

            free_large(r);
        }
    }
}
