//! Medium tier: 1.25 MiB OS-mapped super-pools carved into blocks of
//! 256-byte granularity, with binned free lists and immediate coalescing.
//!
//! A super-pool looks like this in memory:
//!
//! ```text
//! +--------------------------+ <- mapped base (page aligned)
//! | prev | next | reserved   | <- 24 byte pool header, circular list links
//! +--------------------------+ <- body start
//! |  ...feed remainder...    | <- unfed window (raw bytes, no headers yet)
//! +--------------------------+ <- feed cursor (grows downward)
//! | header | block content   |
//! +--------------------------+
//! | header | block content   | <- sequential feed serves top-down
//! +--------------------------+
//! | end sentinel header      | <- 8 bytes, permanently in use, size 0
//! +--------------------------+
//! ```
//!
//! Free blocks keep a `FreeNode { prev, next }` in their content and are
//! linked into one of 1024 bins (32 groups of 32), indexed by quantized
//! size. Two bitmap levels (one u32 of groups, one u32 per group) make the
//! best-fit search two `trailing_zeros` instructions. Every free block also
//! writes its size into its last word so the physically following block can
//! coalesce backwards.

use std::cell::UnsafeCell;
use std::ptr::{null_mut, NonNull};
use std::sync::atomic::Ordering::{Acquire, Relaxed, Release};
use std::sync::atomic::AtomicPtr;

use crate::header::{
    BLOCK_HEADER_SIZE, IS_FREE, IS_MEDIUM, PAYLOAD_MASK, PREV_MEDIUM_FREE, SMALL_POOL_IN_USE,
};
use crate::sync::{ByteLock, FreeStack, FreeStackNode, MEDIUM_SPIN_LIMIT};
use crate::{platform, stats, Pointer};

/// Medium block sizes are quantized to this granularity...
pub(crate) const MEDIUM_GRANULARITY: usize = 256;

/// ...with this offset, so a rounded block size is `256k + 48`.
pub(crate) const MEDIUM_SIZE_OFFSET: usize = 48;

/// Smallest medium block, header included.
pub(crate) const MIN_MEDIUM_BLOCK_SIZE: usize = 11 * MEDIUM_GRANULARITY + MEDIUM_SIZE_OFFSET;

/// Free list bins: 32 groups of 32 bins.
pub(crate) const BIN_COUNT: usize = 1024;
const BINS_PER_GROUP: usize = 32;

/// Largest medium block, header included. Larger requests go to the large
/// tier.
pub(crate) const MAX_MEDIUM_BLOCK_SIZE: usize =
    MIN_MEDIUM_BLOCK_SIZE + (BIN_COUNT - 1) * MEDIUM_GRANULARITY;

/// Super-pool mapping size: 20 x 64 KiB.
pub(crate) const MEDIUM_POOL_SIZE: usize = 20 * 64 * 1024;

/// Pool header: circular list links plus one reserved word that pads the
/// body start so user pointers come out 16-byte aligned.
#[repr(C)]
pub(crate) struct MediumPool {
    prev: *mut MediumPool,
    next: *mut MediumPool,
    _reserved: usize,
}

pub(crate) const MEDIUM_POOL_HEADER_SIZE: usize = std::mem::size_of::<MediumPool>();

/// Usable body: everything between the pool header and the 8-byte end
/// sentinel.
pub(crate) const MEDIUM_POOL_BODY_SIZE: usize =
    MEDIUM_POOL_SIZE - MEDIUM_POOL_HEADER_SIZE - BLOCK_HEADER_SIZE;

const _: () = assert!(MEDIUM_POOL_HEADER_SIZE == 24);
const _: () = assert!(MEDIUM_POOL_BODY_SIZE % 16 == 0);
const _: () = assert!(MAX_MEDIUM_BLOCK_SIZE < MEDIUM_POOL_BODY_SIZE);

/// Number of independent medium namespaces. Namespace 0 always serves user
/// blocks; the extra ones (under `boost`/`booster`) are dedicated to
/// small-pool backing so small-tier refills don't contend with user medium
/// traffic.
#[cfg(not(feature = "boost"))]
pub(crate) const MEDIUM_NAMESPACES: usize = 1;
#[cfg(all(feature = "boost", not(feature = "booster")))]
pub(crate) const MEDIUM_NAMESPACES: usize = 2;
#[cfg(feature = "booster")]
pub(crate) const MEDIUM_NAMESPACES: usize = 4;

/// The namespace user medium blocks live in.
pub(crate) const USER_NAMESPACE: usize = 0;

/// Backing namespace for small pools allocated by the given arena.
#[inline]
pub(crate) fn backing_namespace(arena: usize) -> usize {
    if MEDIUM_NAMESPACES == 1 {
        USER_NAMESPACE
    } else {
        1 + arena % (MEDIUM_NAMESPACES - 1)
    }
}

/// Link living in the content of every free medium block.
#[repr(C)]
struct FreeNode {
    prev: *mut FreeNode,
    next: *mut FreeNode,
}

struct MediumInner {
    /// Sentinel of the circular super-pool list.
    pools: MediumPool,
    /// Pool currently backing the sequential feed window.
    feed_pool: *mut MediumPool,
    /// Header address of the most recently fed block; the window is the
    /// raw bytes below it.
    feed_last: *mut u8,
    /// Bytes left in the window.
    feed_remaining: usize,
    /// Bin sentinels. A bin is non-empty iff its sentinel links to a real
    /// node, iff its bitmap bit is set.
    bins: [FreeNode; BIN_COUNT],
    group_bitmap: u32,
    bin_bitmaps: [u32; BINS_PER_GROUP],
}

pub(crate) struct MediumState {
    lock: ByteLock,
    prefetch_lock: ByteLock,
    /// Speculatively pre-mapped super-pool, consumed by the next refill.
    prefetch: AtomicPtr<u8>,
    deferred: FreeStack,
    inner: UnsafeCell<MediumInner>,
}

// Inner state is only touched while holding `lock`; the remaining fields
// are atomics and locks.
unsafe impl Sync for MediumState {}

impl MediumState {
    const fn new() -> Self {
        const NODE: FreeNode = FreeNode {
            prev: null_mut(),
            next: null_mut(),
        };

        Self {
            lock: ByteLock::new(),
            prefetch_lock: ByteLock::new(),
            prefetch: AtomicPtr::new(null_mut()),
            deferred: FreeStack::new(),
            inner: UnsafeCell::new(MediumInner {
                pools: MediumPool {
                    prev: null_mut(),
                    next: null_mut(),
                    _reserved: 0,
                },
                feed_pool: null_mut(),
                feed_last: null_mut(),
                feed_remaining: 0,
                bins: [NODE; BIN_COUNT],
                group_bitmap: 0,
                bin_bitmaps: [0; BINS_PER_GROUP],
            }),
        }
    }
}

pub(crate) static MEDIUM_STATES: [MediumState; MEDIUM_NAMESPACES] =
    [const { MediumState::new() }; MEDIUM_NAMESPACES];

/// Rounds a total (header included) request up to the medium size grid.
#[inline]
pub(crate) fn round_medium(total: usize) -> usize {
    if total <= MIN_MEDIUM_BLOCK_SIZE {
        return MIN_MEDIUM_BLOCK_SIZE;
    }

    ((total - MEDIUM_SIZE_OFFSET + MEDIUM_GRANULARITY - 1) & !(MEDIUM_GRANULARITY - 1))
        + MEDIUM_SIZE_OFFSET
}

#[inline]
fn bin_index(size: usize) -> usize {
    debug_assert!(size >= MIN_MEDIUM_BLOCK_SIZE);
    ((size - MIN_MEDIUM_BLOCK_SIZE) / MEDIUM_GRANULARITY).min(BIN_COUNT - 1)
}

// --- Raw block word helpers. A "block" pointer is the address of the
// header word; user data starts 8 bytes later. ---

#[inline]
unsafe fn block_word(block: *mut u8) -> usize {
    *(block as *const usize)
}

#[inline]
unsafe fn set_block_word(block: *mut u8, word: usize) {
    *(block as *mut usize) = word;
}

#[inline]
unsafe fn set_trailing_size(block: *mut u8, size: usize) {
    *(block.add(size).sub(BLOCK_HEADER_SIZE) as *mut usize) = size;
}

#[inline]
unsafe fn set_prev_free_flag(block: *mut u8, free: bool) {
    let word = block_word(block);
    set_block_word(
        block,
        if free {
            word | PREV_MEDIUM_FREE
        } else {
            word & !PREV_MEDIUM_FREE
        },
    );
}

// --- Bin list maintenance ---

unsafe fn link_after(sentinel: *mut FreeNode, node: *mut FreeNode) {
    (*node).prev = sentinel;
    (*node).next = (*sentinel).next;
    (*(*sentinel).next).prev = node;
    (*sentinel).next = node;
}

unsafe fn unlink_node(node: *mut FreeNode) {
    (*(*node).prev).next = (*node).next;
    (*(*node).next).prev = (*node).prev;
}

/// Inserts a free block into its bin, writes its header and trailing size
/// word, and flags the physically following block. The block's own
/// predecessor must not be free (coalescing guarantees that before binning).
unsafe fn bin_free_block(inner: &mut MediumInner, block: *mut u8, size: usize) {
    debug_assert!(size >= MIN_MEDIUM_BLOCK_SIZE);

    set_block_word(block, size | IS_MEDIUM | IS_FREE);
    set_trailing_size(block, size);
    set_prev_free_flag(block.add(size), true);

    let bin = bin_index(size);
    let sentinel = &mut inner.bins[bin] as *mut FreeNode;
    link_after(sentinel, block.add(BLOCK_HEADER_SIZE) as *mut FreeNode);

    let group = bin / BINS_PER_GROUP;
    inner.bin_bitmaps[group] |= 1 << (bin % BINS_PER_GROUP);
    inner.group_bitmap |= 1 << group;
}

/// Removes a free block from its bin and clears the bitmap bits when the
/// bin runs empty. Does not touch the block's header; the caller rewrites
/// it right after.
unsafe fn unbin_free_block(inner: &mut MediumInner, block: *mut u8, size: usize) {
    let node = block.add(BLOCK_HEADER_SIZE) as *mut FreeNode;
    unlink_node(node);

    let bin = bin_index(size);
    let sentinel = &mut inner.bins[bin] as *mut FreeNode;
    if (*sentinel).next == sentinel {
        let group = bin / BINS_PER_GROUP;
        inner.bin_bitmaps[group] &= !(1 << (bin % BINS_PER_GROUP));
        if inner.bin_bitmaps[group] == 0 {
            inner.group_bitmap &= !(1 << group);
        }
    }
}

/// Two-level bitmap search for the lowest non-empty bin at or above
/// `min_bin`. First scans the bin bitmap of `min_bin`'s group masking out
/// the lower bins; on a miss, scans the group bitmap above the group and
/// takes the lowest bin of the first non-empty group.
fn find_bin(inner: &MediumInner, min_bin: usize) -> Option<usize> {
    let group = min_bin / BINS_PER_GROUP;
    let sub = min_bin % BINS_PER_GROUP;

    let mut found_group = group;
    let mut mask = inner.bin_bitmaps[group] & (!0u32 << sub);

    if mask == 0 {
        let higher_groups = if group + 1 >= BINS_PER_GROUP {
            0
        } else {
            inner.group_bitmap & (!0u32 << (group + 1))
        };
        if higher_groups == 0 {
            return None;
        }
        found_group = higher_groups.trailing_zeros() as usize;
        mask = inner.bin_bitmaps[found_group];
    }

    Some(found_group * BINS_PER_GROUP + mask.trailing_zeros() as usize)
}

// --- Pool list maintenance ---

unsafe fn link_pool(sentinel: *mut MediumPool, pool: *mut MediumPool) {
    (*pool).prev = sentinel;
    (*pool).next = (*sentinel).next;
    (*(*sentinel).next).prev = pool;
    (*sentinel).next = pool;
}

unsafe fn unlink_pool(pool: *mut MediumPool) {
    (*(*pool).prev).next = (*pool).next;
    (*(*pool).next).prev = (*pool).prev;
}

#[inline]
unsafe fn pool_body_start(pool: *mut MediumPool) -> *mut u8 {
    (pool as *mut u8).add(MEDIUM_POOL_HEADER_SIZE)
}

#[inline]
unsafe fn pool_body_end(pool: *mut MediumPool) -> *mut u8 {
    (pool as *mut u8).add(MEDIUM_POOL_SIZE - BLOCK_HEADER_SIZE)
}

// --- Lock acquisition with pool prefetch ---

/// While the medium lock is contended, a waiter that can grab the prefetch
/// lock maps the next super-pool speculatively, hiding the syscall latency
/// exactly at the moment the allocator is busiest.
fn acquire_medium_lock(state: &MediumState) {
    if state.lock.try_acquire() {
        return;
    }

    let mut sleeps = 0u64;
    'outer: loop {
        try_prefetch(state);

        let mut spins = 0;
        while spins < MEDIUM_SPIN_LIMIT {
            std::hint::spin_loop();
            if state.lock.try_acquire() {
                break 'outer;
            }
            spins += 1;
        }

        stats::timed_yield();
        sleeps += 1;
    }

    stats::record_sleeps(sleeps);
}

fn try_prefetch(state: &MediumState) {
    if !state.prefetch.load(Relaxed).is_null() || !state.prefetch_lock.try_acquire() {
        return;
    }

    if state.prefetch.load(Relaxed).is_null() {
        if let Some(mapping) = unsafe { platform::request_memory(MEDIUM_POOL_SIZE) } {
            state.prefetch.store(mapping.as_ptr(), Release);
        }
    }

    state.prefetch_lock.release();
}

// --- Allocation ---

/// Allocates a user medium block. `user_size` excludes the header.
pub(crate) unsafe fn alloc_medium(user_size: usize) -> Pointer<u8> {
    let block_size = round_medium(user_size + BLOCK_HEADER_SIZE);
    let block = alloc_block(&MEDIUM_STATES[USER_NAMESPACE], block_size, 0)?;
    stats::MEDIUM.on_alloc(block_word(block.as_ptr()) & PAYLOAD_MASK);

    Some(NonNull::new_unchecked(block.as_ptr().add(BLOCK_HEADER_SIZE)))
}

/// Allocates a medium block that will host a small-block pool. Tagged with
/// [`SMALL_POOL_IN_USE`] so heap walks can descend into it; not counted in
/// the medium statistics (the small tier accounts for its own bytes).
pub(crate) unsafe fn alloc_pool_block(namespace: usize, user_size: usize) -> Pointer<u8> {
    let block_size = round_medium(user_size + BLOCK_HEADER_SIZE);
    let block = alloc_block(&MEDIUM_STATES[namespace], block_size, SMALL_POOL_IN_USE)?;

    Some(NonNull::new_unchecked(block.as_ptr().add(BLOCK_HEADER_SIZE)))
}

/// Usable bytes of the block that `alloc_pool_block` would return for a
/// request, so the small tier can size its pools to the real capacity.
#[inline]
pub(crate) fn pool_block_usable(user_size: usize) -> usize {
    round_medium(user_size + BLOCK_HEADER_SIZE) - BLOCK_HEADER_SIZE
}

unsafe fn alloc_block(state: &MediumState, block_size: usize, extra_flags: usize) -> Pointer<u8> {
    debug_assert!(block_size >= MIN_MEDIUM_BLOCK_SIZE);
    debug_assert!(block_size % 16 == 0);

    acquire_medium_lock(state);
    let inner = &mut *state.inner.get();

    let block = alloc_block_locked(state, inner, block_size, extra_flags);

    drain_deferred_locked(state, inner);
    state.lock.release();

    block.map(|b| NonNull::new_unchecked(b))
}

unsafe fn alloc_block_locked(
    state: &MediumState,
    inner: &mut MediumInner,
    block_size: usize,
    extra_flags: usize,
) -> Option<*mut u8> {
    // 1. Binned free block, exact bin preferred, next bin up otherwise.
    if let Some(bin) = find_bin(inner, bin_index(block_size)) {
        let node = inner.bins[bin].next;
        let block = (node as *mut u8).sub(BLOCK_HEADER_SIZE);
        let size = block_word(block) & PAYLOAD_MASK;
        debug_assert!(size >= block_size);

        unbin_free_block(inner, block, size);

        if size >= block_size + MIN_MEDIUM_BLOCK_SIZE {
            // Split: the suffix goes back to a bin.
            set_block_word(block, block_size | IS_MEDIUM | extra_flags);
            bin_free_block(inner, block.add(block_size), size - block_size);
        } else {
            set_block_word(block, size | IS_MEDIUM | extra_flags);
            set_prev_free_flag(block.add(size), false);
        }

        return Some(block);
    }

    // 2. Sequential feed window.
    if inner.feed_remaining >= block_size {
        inner.feed_last = inner.feed_last.sub(block_size);
        inner.feed_remaining -= block_size;
        set_block_word(inner.feed_last, block_size | IS_MEDIUM | extra_flags);
        return Some(inner.feed_last);
    }

    // 3. Fresh super-pool: prefetched if one is ready, mapped otherwise.
    let base = match NonNull::new(state.prefetch.swap(null_mut(), Acquire)) {
        Some(prefetched) => prefetched,
        None => platform::request_memory(MEDIUM_POOL_SIZE)?,
    };

    bin_feed_remainder(inner);

    let pool = base.as_ptr() as *mut MediumPool;
    (*pool)._reserved = 0;
    link_pool(&mut inner.pools as *mut MediumPool, pool);

    // End sentinel: an in-use zero-sized header that stops coalescing and
    // heap walks.
    set_block_word(pool_body_end(pool), IS_MEDIUM);

    let block = pool_body_end(pool).sub(block_size);
    set_block_word(block, block_size | IS_MEDIUM | extra_flags);

    inner.feed_pool = pool;
    inner.feed_last = block;
    inner.feed_remaining = block as usize - pool_body_start(pool) as usize;

    Some(block)
}

/// Turns the unfed window of the current feed pool into a real block: a
/// binned free block when it is big enough, a permanently in-use stub
/// otherwise (reclaimed when the pool is unmapped). Keeps header walks and
/// coalescing consistent once a new pool takes over the feed.
unsafe fn bin_feed_remainder(inner: &mut MediumInner) {
    if inner.feed_pool.is_null() || inner.feed_remaining == 0 {
        inner.feed_remaining = 0;
        return;
    }

    let start = pool_body_start(inner.feed_pool);
    let size = inner.feed_remaining;
    debug_assert_eq!(inner.feed_last as usize - start as usize, size);

    if size >= MIN_MEDIUM_BLOCK_SIZE {
        bin_free_block(inner, start, size);
    } else {
        set_block_word(start, size | IS_MEDIUM);
    }

    inner.feed_remaining = 0;
}

// --- Free ---

/// Frees a user medium block. Returns the nominal block size. Never blocks:
/// when the lock is contended the block goes onto the lock-less stack and
/// the next lock holder re-processes it.
pub(crate) unsafe fn free_medium(user: NonNull<u8>) -> usize {
    let state = &MEDIUM_STATES[USER_NAMESPACE];
    let block = user.as_ptr().sub(BLOCK_HEADER_SIZE);
    let size = block_word(block) & PAYLOAD_MASK;

    stats::MEDIUM.on_free(size);
    free_block(state, block);

    size
}

/// Returns a small-pool hosting block to its backing namespace. Statistics
/// are the small tier's business.
pub(crate) unsafe fn free_pool_block(namespace: usize, user: NonNull<u8>) {
    free_block(
        &MEDIUM_STATES[namespace],
        user.as_ptr().sub(BLOCK_HEADER_SIZE),
    );
}

unsafe fn free_block(state: &MediumState, block: *mut u8) {
    if !state.lock.try_acquire() {
        let node = block.add(BLOCK_HEADER_SIZE) as *mut FreeStackNode;
        state.deferred.push(NonNull::new_unchecked(node));
        return;
    }

    let inner = &mut *state.inner.get();
    free_block_locked(inner, block);
    drain_deferred_locked(state, inner);
    state.lock.release();
}

unsafe fn free_block_locked(inner: &mut MediumInner, mut block: *mut u8) {
    let word = block_word(block);
    let mut size = word & PAYLOAD_MASK;
    debug_assert!(word & IS_MEDIUM != 0 && word & IS_FREE == 0);

    // Coalesce with the following block.
    let next = block.add(size);
    let next_word = block_word(next);
    if next_word & IS_FREE != 0 {
        let next_size = next_word & PAYLOAD_MASK;
        unbin_free_block(inner, next, next_size);
        size += next_size;
    }

    // Coalesce with the preceding block; the block's start moves backwards.
    if word & PREV_MEDIUM_FREE != 0 {
        let prev_size = *(block.sub(BLOCK_HEADER_SIZE) as *const usize);
        let prev = block.sub(prev_size);
        debug_assert!(block_word(prev) & IS_FREE != 0);
        unbin_free_block(inner, prev, prev_size);
        block = prev;
        size += prev_size;
    }

    if size == MEDIUM_POOL_BODY_SIZE {
        let pool = block.sub(MEDIUM_POOL_HEADER_SIZE) as *mut MediumPool;
        if pool == inner.feed_pool {
            // The whole body came back while this pool is still the feeder:
            // reopen the window over it instead of unmapping.
            inner.feed_last = pool_body_end(pool);
            inner.feed_remaining = MEDIUM_POOL_BODY_SIZE;
            set_block_word(pool_body_end(pool), IS_MEDIUM);
        } else {
            unlink_pool(pool);
            platform::return_memory(NonNull::new_unchecked(pool as *mut u8), MEDIUM_POOL_SIZE);
        }
        return;
    }

    bin_free_block(inner, block, size);
}

unsafe fn drain_deferred_locked(state: &MediumState, inner: &mut MediumInner) {
    let mut node = state.deferred.drain();
    while !node.is_null() {
        let next = (*node).next;
        free_block_locked(inner, (node as *mut u8).sub(BLOCK_HEADER_SIZE));
        node = next;
    }
}

/// Drains any pending deferred frees. Called during shutdown so the leak
/// walk doesn't report blocks that were already freed.
pub(crate) fn drain_deferred(namespace: usize) {
    let state = &MEDIUM_STATES[namespace];
    acquire_medium_lock(state);
    unsafe {
        drain_deferred_locked(state, &mut *state.inner.get());
    }
    state.lock.release();
}

// --- Reallocation ---

/// In-place medium reallocation. Returns the surviving user pointer, or
/// `None` when the caller has to move the data (allocate, copy, free). The
/// caller guarantees the new size still belongs to the medium tier.
pub(crate) unsafe fn realloc_medium(user: NonNull<u8>, new_user_size: usize) -> Pointer<u8> {
    let state = &MEDIUM_STATES[USER_NAMESPACE];
    let block = user.as_ptr().sub(BLOCK_HEADER_SIZE);
    let word = block_word(block);
    let size = word & PAYLOAD_MASK;
    let usable = size - BLOCK_HEADER_SIZE;

    if new_user_size <= usable {
        if new_user_size >= usable / 2 {
            // Still at least half used, keep the block as is.
            return Some(user);
        }

        // Shrink in place: split off the tail and give it back.
        let new_size = round_medium(new_user_size + BLOCK_HEADER_SIZE);
        if size - new_size < MIN_MEDIUM_BLOCK_SIZE {
            return Some(user);
        }

        acquire_medium_lock(state);
        let inner = &mut *state.inner.get();

        // Re-read under the lock: a neighbour free may have set our
        // prev-free flag in the meantime.
        let word = block_word(block);
        set_block_word(block, new_size | IS_MEDIUM | (word & PREV_MEDIUM_FREE));
        let tail = block.add(new_size);
        let mut tail_size = size - new_size;

        // Merge the tail with the following block if that one is free.
        let next = block.add(size);
        let next_word = block_word(next);
        if next_word & IS_FREE != 0 {
            let next_size = next_word & PAYLOAD_MASK;
            unbin_free_block(inner, next, next_size);
            tail_size += next_size;
        }
        bin_free_block(inner, tail, tail_size);

        drain_deferred_locked(state, inner);
        state.lock.release();

        stats::MEDIUM.on_resize(size, new_size);
        return Some(user);
    }

    // Grow. Overshoot so repeated growth amortizes.
    let target = new_user_size.max(usable + usable / 4);
    let new_size = round_medium(target + BLOCK_HEADER_SIZE);

    acquire_medium_lock(state);
    let inner = &mut *state.inner.get();

    // Same re-read as in the shrink path.
    let word = block_word(block);
    let next = block.add(size);
    let next_word = block_word(next);
    let mut grown = None;

    if next_word & IS_FREE != 0 {
        let combined = size + (next_word & PAYLOAD_MASK);
        if combined >= new_size {
            unbin_free_block(inner, next, next_word & PAYLOAD_MASK);

            if combined - new_size >= MIN_MEDIUM_BLOCK_SIZE {
                set_block_word(block, new_size | IS_MEDIUM | (word & PREV_MEDIUM_FREE));
                bin_free_block(inner, block.add(new_size), combined - new_size);
                stats::MEDIUM.on_resize(size, new_size);
            } else {
                set_block_word(block, combined | IS_MEDIUM | (word & PREV_MEDIUM_FREE));
                set_prev_free_flag(block.add(combined), false);
                stats::MEDIUM.on_resize(size, combined);
            }

            grown = Some(user);
        }
    }

    drain_deferred_locked(state, inner);
    state.lock.release();

    grown
}

// --- Shutdown and walks ---

/// One entry of a heap walk: a block that is currently allocated.
#[cfg(feature = "report-leaks")]
pub(crate) struct WalkedBlock {
    /// User address of the block.
    pub user: NonNull<u8>,
    /// Full block size, header included.
    pub size: usize,
    /// The block hosts a small-block pool.
    pub hosts_small_pool: bool,
}

/// Walks every allocated block of the namespace, header by header. Must run
/// while no other thread uses the allocator (shutdown, or under test).
#[cfg(feature = "report-leaks")]
pub(crate) unsafe fn walk_allocated(namespace: usize, mut visit: impl FnMut(WalkedBlock)) {
    let state = &MEDIUM_STATES[namespace];
    let inner = &*state.inner.get();

    let sentinel = &inner.pools as *const MediumPool as *mut MediumPool;
    let mut pool = inner.pools.next;
    while !pool.is_null() && pool != sentinel {
        let mut block = if pool == inner.feed_pool && inner.feed_remaining > 0 {
            // The window below the feed cursor holds no headers yet.
            inner.feed_last
        } else {
            pool_body_start(pool)
        };
        let end = pool_body_end(pool);

        while block < end {
            let word = block_word(block);
            let size = word & PAYLOAD_MASK;
            if size == 0 {
                break;
            }

            // Blocks below the minimum medium size are sequential-feed
            // remainder stubs, not allocations.
            if word & IS_FREE == 0 && size >= MIN_MEDIUM_BLOCK_SIZE {
                visit(WalkedBlock {
                    user: NonNull::new_unchecked(block.add(BLOCK_HEADER_SIZE)),
                    size,
                    hosts_small_pool: word & SMALL_POOL_IN_USE != 0,
                });
            }
            block = block.add(size);
        }

        pool = (*pool).next;
    }
}

/// Unmaps every super-pool and resets the namespace to its initial state.
/// Single-threaded shutdown only.
pub(crate) unsafe fn release_all(namespace: usize) {
    let state = &MEDIUM_STATES[namespace];
    let inner = &mut *state.inner.get();

    let sentinel = &mut inner.pools as *mut MediumPool;
    let mut pool = inner.pools.next;
    while !pool.is_null() && pool != sentinel {
        let next = (*pool).next;
        platform::return_memory(NonNull::new_unchecked(pool as *mut u8), MEDIUM_POOL_SIZE);
        pool = next;
    }

    if let Some(prefetched) = NonNull::new(state.prefetch.swap(null_mut(), Relaxed)) {
        platform::return_memory(prefetched, MEDIUM_POOL_SIZE);
    }

    // Anything still on the deferred stack lived inside the pools we just
    // unmapped; dropping the list head forgets it.
    state.deferred.drain();

    init_namespace(namespace);
}

/// (Re)initializes the namespace: self-links every sentinel, clears the
/// bitmaps and the feed window. Single-threaded init only.
pub(crate) unsafe fn init_namespace(namespace: usize) {
    let state = &MEDIUM_STATES[namespace];
    let inner = &mut *state.inner.get();

    let sentinel = &mut inner.pools as *mut MediumPool;
    (*sentinel).prev = sentinel;
    (*sentinel).next = sentinel;

    inner.feed_pool = null_mut();
    inner.feed_last = null_mut();
    inner.feed_remaining = 0;

    for bin in inner.bins.iter_mut() {
        let node = bin as *mut FreeNode;
        (*node).prev = node;
        (*node).next = node;
    }
    inner.group_bitmap = 0;
    inner.bin_bitmaps = [0; BINS_PER_GROUP];
}

// --- Test support ---

/// Checks the bitmap/bin cross-invariants: a group bit is set iff its bin
/// bitmap is non-zero, and a bin bit is set iff the bin's sentinel has a
/// successor other than itself.
#[cfg(test)]
pub(crate) unsafe fn check_bin_invariants(namespace: usize) {
    let inner = &*MEDIUM_STATES[namespace].inner.get();

    for group in 0..BINS_PER_GROUP {
        let group_set = inner.group_bitmap & (1 << group) != 0;
        assert_eq!(group_set, inner.bin_bitmaps[group] != 0);

        for sub in 0..BINS_PER_GROUP {
            let bin = group * BINS_PER_GROUP + sub;
            let sentinel = &inner.bins[bin] as *const FreeNode as *mut FreeNode;
            let non_empty = (*sentinel).next != sentinel;
            let bit_set = inner.bin_bitmaps[group] & (1 << sub) != 0;
            assert_eq!(bit_set, non_empty, "bin {bin} bitmap mismatch");
        }
    }
}

/// Walks every pool and asserts that no two physically adjacent blocks are
/// both free.
#[cfg(test)]
pub(crate) unsafe fn check_no_adjacent_free(namespace: usize) {
    let state = &MEDIUM_STATES[namespace];
    let inner = &*state.inner.get();

    let sentinel = &inner.pools as *const MediumPool as *mut MediumPool;
    let mut pool = inner.pools.next;
    while !pool.is_null() && pool != sentinel {
        let mut block = if pool == inner.feed_pool && inner.feed_remaining > 0 {
            inner.feed_last
        } else {
            pool_body_start(pool)
        };
        let end = pool_body_end(pool);
        let mut prev_free = false;

        while block < end {
            let word = block_word(block);
            let size = word & PAYLOAD_MASK;
            if size == 0 {
                break;
            }

            let free = word & IS_FREE != 0;
            assert!(!(free && prev_free), "adjacent free medium blocks");
            assert_eq!(word & PREV_MEDIUM_FREE != 0, prev_free, "stale prev-free flag");
            if free {
                assert_eq!(
                    *(block.add(size).sub(BLOCK_HEADER_SIZE) as *const usize),
                    size,
                    "trailing size word mismatch"
                );
            }

            prev_free = free;
            block = block.add(size);
        }

        pool = (*pool).next;
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::test_support::heap_test_lock;

    #[test]
    fn rounding_hits_the_grid() {
        assert_eq!(round_medium(1), MIN_MEDIUM_BLOCK_SIZE);
        assert_eq!(round_medium(MIN_MEDIUM_BLOCK_SIZE), MIN_MEDIUM_BLOCK_SIZE);
        assert_eq!(
            round_medium(MIN_MEDIUM_BLOCK_SIZE + 1),
            MIN_MEDIUM_BLOCK_SIZE + MEDIUM_GRANULARITY
        );
        // Rounded sizes are always 256k + 48.
        for total in [3000, 4104, 100_000, MAX_MEDIUM_BLOCK_SIZE] {
            let rounded = round_medium(total);
            assert!(rounded >= total);
            assert_eq!(
                (rounded - MEDIUM_SIZE_OFFSET) % MEDIUM_GRANULARITY,
                0,
                "{rounded}"
            );
        }
    }

    #[test]
    fn bin_index_is_monotonic_and_clamped() {
        assert_eq!(bin_index(MIN_MEDIUM_BLOCK_SIZE), 0);
        assert_eq!(
            bin_index(MIN_MEDIUM_BLOCK_SIZE + MEDIUM_GRANULARITY),
            1
        );
        assert_eq!(bin_index(MAX_MEDIUM_BLOCK_SIZE), BIN_COUNT - 1);
        assert_eq!(bin_index(MEDIUM_POOL_BODY_SIZE), BIN_COUNT - 1);
    }

    #[test]
    fn alloc_free_round_trip_and_coalescing() {
        let _guard = heap_test_lock();
        // The test asserts physical adjacency, so it needs a pristine feed
        // window rather than recycled bin blocks.
        crate::shutdown();
        crate::init();

        unsafe {
            // Three adjacent blocks out of the sequential feed.
            let a = alloc_medium(4096).unwrap();
            let b = alloc_medium(4096).unwrap();
            let c = alloc_medium(4096).unwrap();

            // Fed downward: later allocations sit at lower addresses.
            assert!(b.as_ptr() < a.as_ptr());
            assert!(c.as_ptr() < b.as_ptr());

            let block_size = block_word(a.as_ptr().sub(BLOCK_HEADER_SIZE)) & PAYLOAD_MASK;
            assert_eq!(block_size, round_medium(4096 + BLOCK_HEADER_SIZE));

            // Free outer blocks first, then the middle one: everything must
            // collapse into a single binned block.
            free_medium(a);
            free_medium(c);
            free_medium(b);

            check_no_adjacent_free(USER_NAMESPACE);
            check_bin_invariants(USER_NAMESPACE);

            // The merged block is immediately reusable.
            let merged = alloc_medium(3 * block_size - BLOCK_HEADER_SIZE - MIN_MEDIUM_BLOCK_SIZE)
                .unwrap();
            free_medium(merged);
            check_bin_invariants(USER_NAMESPACE);
        }
    }

    #[test]
    fn split_leaves_consistent_headers() {
        let _guard = heap_test_lock();
        crate::init();

        unsafe {
            // Allocate and free a big block so it lands in a bin, then carve
            // a small one out of it.
            let big = alloc_medium(100_000).unwrap();
            free_medium(big);

            let small = alloc_medium(5000).unwrap();
            check_no_adjacent_free(USER_NAMESPACE);
            check_bin_invariants(USER_NAMESPACE);

            free_medium(small);
            check_no_adjacent_free(USER_NAMESPACE);
        }
    }

    #[test]
    fn double_free_is_detected_by_header() {
        let _guard = heap_test_lock();
        // Fresh heap: the freed block must not coalesce, or its own header
        // word would be interior to a bigger free block.
        crate::shutdown();
        crate::init();

        unsafe {
            let p = alloc_medium(8000).unwrap();
            // Freeing marks the header; the public dispatch refuses the
            // second free based on that flag.
            assert!(free_medium(p) > 0);
            let word = block_word(p.as_ptr().sub(BLOCK_HEADER_SIZE));
            assert!(word & IS_FREE != 0);
        }
    }

    #[test]
    fn grow_in_place_uses_the_following_free_block() {
        let _guard = heap_test_lock();
        // Adjacency matters here too: start from a fresh feed window.
        crate::shutdown();
        crate::init();

        unsafe {
            let a = alloc_medium(4096).unwrap();
            let b = alloc_medium(4096).unwrap();
            // `a` sits above `b`; free `a` so `b` can grow into it... but
            // growth looks at the block *after* `b`, which is `a`.
            free_medium(a);

            let grown = realloc_medium(b, 6000);
            assert_eq!(grown, Some(b));
            let word = block_word(b.as_ptr().sub(BLOCK_HEADER_SIZE));
            assert!((word & PAYLOAD_MASK) >= 6000 + BLOCK_HEADER_SIZE);

            check_no_adjacent_free(USER_NAMESPACE);
            free_medium(b);
        }
    }
}
