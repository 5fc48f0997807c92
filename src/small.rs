//! Tiny/small tier: per-size-class records with byte locks, round-robin (or
//! thread-hashed) arenas for the tiny classes, and small-block pools carved
//! out of the medium tier.
//!
//! A small-block pool is one medium block subdivided into equal slots:
//!
//! ```text
//! +-----------------------------+ <- medium block user address
//! | next | prev | SmallPool     | <- pool header (partial-list links first)
//! +-----------------------------+ <- 48 byte boundary
//! | header | slot content       | <- block_size bytes per slot
//! +-----------------------------+
//! | header | slot content       |
//! +-----------------------------+
//! |            ...              |
//! +-----------------------------+
//! ```
//!
//! Every slot header is the owning pool's address (low bits free for the
//! flag bits). Free slots chain a LIFO list through their content; pools
//! with free slots sit in the class's partially-free list; a pool whose
//! last slot comes back is returned to the medium tier, unless it is the
//! class's current sequential-feed pool, in which case the feed cursor just
//! rewinds.

use std::cell::UnsafeCell;
use std::ptr::{null_mut, NonNull};
use std::sync::atomic::Ordering::Relaxed;
use std::sync::atomic::{AtomicU32, AtomicU64, AtomicUsize};

use crate::header::{pool_of_word, BLOCK_HEADER_SIZE, IS_FREE};
use crate::list::{Header, LinkedList};
use crate::size_class::{
    block_size_of, pool_sizes_for, NUM_SMALL_CLASSES, NUM_TINY_CLASSES, SMALL_BLOCK_SIZES,
    TINY_ARENA_CLASSES, TINY_ARENA_COUNT,
};
#[cfg(feature = "booster")]
use crate::size_class::ARENA_BITS;
use crate::stats::{SmallBlockOrder, SmallBlockStatus};
use crate::sync::{ByteLock, FreeStack, FreeStackNode, SMALL_SPIN_LIMIT};
use crate::{medium, stats, Pointer};

/// Intra-pool free list link, stored in the content of a free slot. The
/// pointers are slot *user* addresses, so the slot header word stays intact
/// while the slot is on the list.
#[repr(C)]
struct FreeSlot {
    next: *mut FreeSlot,
}

/// Pool-specific data. The full pool header is [`Header<SmallPool>`]: the
/// partial-list links come first, this struct after.
pub(crate) struct SmallPool {
    /// Back-reference to the owning size-class record.
    owner: *mut SmallClass,
    /// Head of the intra-pool free list (slot user addresses).
    first_free: *mut FreeSlot,
    /// Slots currently handed out (deferred frees still count until they
    /// are drained).
    blocks_in_use: u32,
    /// Header-size marker, doubles as a corruption check.
    signature: u32,
}

type PoolHeader = Header<SmallPool>;

/// Pool header footprint, rounded so slots start 16-byte aligned.
pub(crate) const POOL_HEADER_SIZE: usize = (std::mem::size_of::<PoolHeader>() + 15) & !15;

const POOL_SIGNATURE: u32 = POOL_HEADER_SIZE as u32;

struct SmallClassInner {
    /// Pools that still have slots on their free list. May include the
    /// sequential-feed pool.
    partial: LinkedList<SmallPool>,
    /// Current sequential-feed pool and its cursor.
    feed_pool: *mut PoolHeader,
    feed_next: *mut u8,
    feed_max: *mut u8,
}

/// One record per size class (and per arena, for the tiny classes).
pub(crate) struct SmallClass {
    lock: ByteLock,
    block_size: AtomicU32,
    min_pool_size: AtomicU32,
    optimal_pool_size: AtomicU32,
    /// Medium namespace this class's pools come from.
    backing: AtomicU32,
    /// Blocks freed while the lock was contended, waiting for a drain.
    deferred: FreeStack,
    getmem_count: AtomicU64,
    freemem_count: AtomicU64,
    sleep_count: AtomicU64,
    inner: UnsafeCell<SmallClassInner>,
}

// Inner state is guarded by `lock`; everything else is atomic.
unsafe impl Sync for SmallClass {}

impl SmallClass {
    const fn new() -> Self {
        Self {
            lock: ByteLock::new(),
            block_size: AtomicU32::new(0),
            min_pool_size: AtomicU32::new(0),
            optimal_pool_size: AtomicU32::new(0),
            backing: AtomicU32::new(0),
            deferred: FreeStack::new(),
            getmem_count: AtomicU64::new(0),
            freemem_count: AtomicU64::new(0),
            sleep_count: AtomicU64::new(0),
            inner: UnsafeCell::new(SmallClassInner {
                partial: LinkedList::new(),
                feed_pool: null_mut(),
                feed_next: null_mut(),
                feed_max: null_mut(),
            }),
        }
    }

    #[inline]
    pub(crate) fn block_size(&self) -> usize {
        self.block_size.load(Relaxed) as usize
    }
}

/// The main "Small" array: one record per size class, sentinels included.
static SMALL_CLASSES: [SmallClass; NUM_SMALL_CLASSES] =
    [const { SmallClass::new() }; NUM_SMALL_CLASSES];

/// Extra tiny arenas: a full record array for the tiny classes only (plus
/// the two overflow sentinels).
static TINY_ARENAS: [[SmallClass; TINY_ARENA_CLASSES]; TINY_ARENA_COUNT] =
    [const { [const { SmallClass::new() }; TINY_ARENA_CLASSES] }; TINY_ARENA_COUNT];

/// Round-robin cursor for tiny arena selection.
static TINY_CURSOR: AtomicUsize = AtomicUsize::new(0);

/// Total arena count is a power of two, so the round-robin cursor masks to
/// `count - 1`, which equals the extra-arena count.
const ARENA_MASK: usize = TINY_ARENA_COUNT;

// --- Thread identity (booster per-thread arenas) ---

#[cfg(feature = "booster")]
static NEXT_THREAD_ID: AtomicU32 = AtomicU32::new(1);

#[cfg(feature = "booster")]
thread_local! {
    static THREAD_ID: std::cell::Cell<u32> = const { std::cell::Cell::new(0) };
}

/// Cheap per-thread identity: a TLS-cached counter, not a syscall.
#[cfg(feature = "booster")]
#[inline]
fn thread_id() -> u32 {
    THREAD_ID.with(|slot| {
        let id = slot.get();
        if id != 0 {
            id
        } else {
            let id = NEXT_THREAD_ID.fetch_add(1, Relaxed);
            slot.set(id);
            id
        }
    })
}

#[cfg(feature = "booster")]
const KNUTH_HASH32: u32 = 2_654_435_761;

/// Picks the record array and starting index for a class. Non-tiny classes
/// always use the main array; tiny classes are spread over the arenas,
/// round-robin by default, by thread hash under `booster`.
#[inline]
fn select(class: usize) -> (&'static [SmallClass], usize) {
    if class >= NUM_TINY_CLASSES {
        return (&SMALL_CLASSES[..], class);
    }

    #[cfg(feature = "booster")]
    let arena = (KNUTH_HASH32.wrapping_mul(thread_id()) >> (32 - ARENA_BITS)) as usize;

    #[cfg(not(feature = "booster"))]
    let arena = TINY_CURSOR.fetch_add(1, Relaxed) & ARENA_MASK;

    if arena == 0 {
        (&SMALL_CLASSES[..], class)
    } else {
        (&TINY_ARENAS[arena - 1][..], class)
    }
}

// --- Allocation ---

/// Allocates a small block for `user_size` bytes from the class `class`.
/// Returns null only on OS mapping failure in the backing medium tier.
pub(crate) unsafe fn alloc_small(class: usize, user_size: usize) -> Pointer<u8> {
    debug_assert!(user_size + BLOCK_HEADER_SIZE <= block_size_of(class));
    let (records, base) = select(class);

    loop {
        // Lock-free fast path: pop one deferred block of the primary class.
        let record = &records[base];
        if let Some(user) = record.pop_deferred() {
            record.getmem_count.fetch_add(1, Relaxed);
            stats::SMALL.on_alloc(record.block_size());
            return Some(user);
        }

        // Up to three lock attempts on consecutive class records; the two
        // sentinel table entries make `base + 2` always valid.
        for candidate in &records[base..base + 3] {
            if candidate.lock.try_acquire() {
                let result = candidate.alloc_locked();
                candidate.drain_deferred_locked();
                candidate.lock.release();

                if let Some(user) = result {
                    candidate.getmem_count.fetch_add(1, Relaxed);
                    stats::SMALL.on_alloc(candidate.block_size());
                    return Some(user);
                }
                return None;
            }
        }

        // Bounded spin on the primary lock, then release the thread to the
        // OS and start over from the deferred-stack check.
        let mut spins = 0;
        while spins < SMALL_SPIN_LIMIT {
            std::hint::spin_loop();
            if record.lock.try_acquire() {
                let result = record.alloc_locked();
                record.drain_deferred_locked();
                record.lock.release();

                if let Some(user) = result {
                    record.getmem_count.fetch_add(1, Relaxed);
                    stats::SMALL.on_alloc(record.block_size());
                    return Some(user);
                }
                return None;
            }
            spins += 1;
        }

        record.sleep_count.fetch_add(1, Relaxed);
        stats::record_sleeps(1);
        stats::timed_yield();
    }
}

impl SmallClass {
    /// Detaches the deferred stack, keeps its head and splices the rest
    /// back. Runs without the lock; the popped block is already formatted
    /// (deferred blocks keep their in-use header).
    unsafe fn pop_deferred(&self) -> Pointer<u8> {
        let head = NonNull::new(self.deferred.drain())?;
        if let Some(rest) = NonNull::new((*head.as_ptr()).next) {
            self.deferred.push_list(rest);
        }

        Some(head.cast())
    }

    /// The allocation slow path. Lock held.
    unsafe fn alloc_locked(&self) -> Pointer<u8> {
        let inner = &mut *self.inner.get();
        let block_size = self.block_size();

        // 1. A partially-free pool.
        if let Some(mut pool) = inner.partial.first() {
            let data = &mut pool.as_mut().data;
            debug_assert_eq!(data.signature, POOL_SIGNATURE);

            let slot = data.first_free;
            data.first_free = (*slot).next;
            data.blocks_in_use += 1;

            if data.first_free.is_null() {
                // Pool is full now, out of the partial list it goes.
                inner.partial.remove(pool);
            }

            let user = NonNull::new_unchecked(slot as *mut u8);
            crate::header::write(user, pool.as_ptr() as usize);
            return Some(user);
        }

        // 2. The sequential-feed pool still has unfed slots.
        if !inner.feed_next.is_null() && inner.feed_next <= inner.feed_max {
            let slot = inner.feed_next;
            inner.feed_next = slot.add(block_size);
            (*inner.feed_pool).data.blocks_in_use += 1;

            *(slot as *mut usize) = inner.feed_pool as usize;
            return Some(NonNull::new_unchecked(slot.add(BLOCK_HEADER_SIZE)));
        }

        // 3. Pull a fresh pool out of the medium tier. Fall back to the
        // minimum pool size when the OS refuses the optimal one.
        let optimal = self.optimal_pool_size.load(Relaxed) as usize;
        let backing = self.backing.load(Relaxed) as usize;
        let (pool_memory, usable) = match medium::alloc_pool_block(backing, optimal) {
            Some(memory) => (memory, medium::pool_block_usable(optimal)),
            None => {
                let min = self.min_pool_size.load(Relaxed) as usize;
                let memory = medium::alloc_pool_block(backing, min)?;
                (memory, medium::pool_block_usable(min))
            }
        };

        let pool = pool_memory.as_ptr() as *mut PoolHeader;
        *pool = PoolHeader {
            next: None,
            prev: None,
            data: SmallPool {
                owner: self as *const SmallClass as *mut SmallClass,
                first_free: null_mut(),
                blocks_in_use: 1,
                signature: POOL_SIGNATURE,
            },
        };

        let slots = (usable - POOL_HEADER_SIZE) / block_size;
        debug_assert!(slots >= 1);
        let first_slot = pool_memory.as_ptr().add(POOL_HEADER_SIZE);

        inner.feed_pool = pool;
        inner.feed_next = first_slot.add(block_size);
        inner.feed_max = first_slot.add((slots - 1) * block_size);

        *(first_slot as *mut usize) = pool as usize;
        Some(NonNull::new_unchecked(first_slot.add(BLOCK_HEADER_SIZE)))
    }

    /// The free slow path. Lock held. Reads the pool from the block header,
    /// so it works for directly-freed and drained blocks alike.
    unsafe fn free_locked(&self, user: NonNull<u8>) {
        let inner = &mut *self.inner.get();
        let word = crate::header::read(user);
        let pool = pool_of_word(word) as *mut PoolHeader;
        let pool_ptr = NonNull::new_unchecked(pool);

        let data = &mut (*pool).data;
        debug_assert_eq!(data.signature, POOL_SIGNATURE);
        debug_assert!(data.blocks_in_use > 0);

        let was_full = data.first_free.is_null();

        crate::header::write(user, pool as usize | IS_FREE);
        let slot = user.as_ptr() as *mut FreeSlot;
        (*slot).next = data.first_free;
        data.first_free = slot;
        data.blocks_in_use -= 1;

        if data.blocks_in_use == 0 {
            if pool == inner.feed_pool {
                // Keep the feeder: drop its free list and rewind the cursor
                // so the whole pool feeds again.
                if !was_full {
                    inner.partial.remove(pool_ptr);
                }
                data.first_free = null_mut();
                inner.feed_next = (pool as *mut u8).add(POOL_HEADER_SIZE);
            } else {
                if !was_full {
                    inner.partial.remove(pool_ptr);
                }
                let backing = self.backing.load(Relaxed) as usize;
                medium::free_pool_block(backing, NonNull::new_unchecked(pool as *mut u8));
            }
            return;
        }

        if was_full {
            inner.partial.push_front(pool_ptr);
        }
    }

    /// Drains the deferred stack: one atomic detach, then the normal free
    /// logic per element. Lock held.
    unsafe fn drain_deferred_locked(&self) {
        let mut node = self.deferred.drain();
        while !node.is_null() {
            let next = (*node).next;
            self.free_locked(NonNull::new_unchecked(node).cast());
            node = next;
        }
    }
}

// --- Free ---

/// Frees a small block. Returns the class's nominal block size. Never
/// blocks: a contended lock turns the free into a deferred-stack push.
pub(crate) unsafe fn free_small(user: NonNull<u8>) -> usize {
    let word = crate::header::read(user);
    debug_assert!(crate::header::is_small(word) && word & IS_FREE == 0);

    let pool = pool_of_word(word) as *mut PoolHeader;
    let class = &*(*pool).data.owner;
    let block_size = class.block_size();

    class.freemem_count.fetch_add(1, Relaxed);
    stats::SMALL.on_free(block_size);

    if !class.lock.try_acquire() {
        class.deferred.push(user.cast::<FreeStackNode>());
        return block_size;
    }

    class.free_locked(user);
    class.drain_deferred_locked();
    class.lock.release();

    block_size
}

/// Usable bytes of a live small block: its class block size minus the
/// header.
pub(crate) unsafe fn usable_of(user: NonNull<u8>) -> usize {
    let word = crate::header::read(user);
    debug_assert!(crate::header::is_small(word));
    let pool = pool_of_word(word) as *mut PoolHeader;
    (*(*pool).data.owner).block_size() - BLOCK_HEADER_SIZE
}

// --- Initialization, shutdown, reports ---

fn init_record(record: &SmallClass, block_size: usize, backing: usize) {
    let (min_pool, optimal_pool) = pool_sizes_for(block_size);
    record.block_size.store(block_size as u32, Relaxed);
    record.min_pool_size.store(min_pool as u32, Relaxed);
    record.optimal_pool_size.store(optimal_pool as u32, Relaxed);
    record.backing.store(backing as u32, Relaxed);
    record.getmem_count.store(0, Relaxed);
    record.freemem_count.store(0, Relaxed);
    record.sleep_count.store(0, Relaxed);

    let inner = unsafe { &mut *record.inner.get() };
    inner.partial = LinkedList::new();
    inner.feed_pool = null_mut();
    inner.feed_next = null_mut();
    inner.feed_max = null_mut();

    // Forget anything still on the deferred stack; the backing pools are
    // gone by the time this runs.
    record.deferred.drain();
}

/// (Re)initializes every size-class record. Single-threaded init only.
pub(crate) fn init_small() {
    for (class, record) in SMALL_CLASSES.iter().enumerate() {
        init_record(record, block_size_of(class), medium::backing_namespace(0));
    }

    for (arena, records) in TINY_ARENAS.iter().enumerate() {
        let backing = medium::backing_namespace(arena + 1);
        for (class, record) in records.iter().enumerate() {
            let size = if class < NUM_TINY_CLASSES {
                SMALL_BLOCK_SIZES[class] as usize
            } else {
                // Overflow sentinels duplicate the last tiny class.
                SMALL_BLOCK_SIZES[NUM_TINY_CLASSES - 1] as usize
            };
            init_record(record, size, backing);
        }
    }

    TINY_CURSOR.store(0, Relaxed);
}

fn for_each_record(mut visit: impl FnMut(&'static SmallClass)) {
    for record in SMALL_CLASSES.iter() {
        visit(record);
    }
    for records in TINY_ARENAS.iter() {
        for record in records.iter() {
            visit(record);
        }
    }
}

/// Drains every class's deferred stack through the normal free path. Part
/// of shutdown, so the leak walk sees the true in-use set.
pub(crate) fn drain_all_deferred() {
    for_each_record(|record| {
        if record.deferred.is_empty() {
            return;
        }
        record.lock.acquire(SMALL_SPIN_LIMIT);
        unsafe {
            record.drain_deferred_locked();
        }
        record.lock.release();
    });
}

/// Aggregated per-class usage, for the status report. Records of the same
/// block size (arenas, sentinels) are merged.
pub(crate) fn block_status(max: usize, order: SmallBlockOrder) -> Vec<SmallBlockStatus> {
    let mut rows: Vec<SmallBlockStatus> = Vec::new();

    for_each_record(|record| {
        let block_size = record.block_size.load(Relaxed);
        let total = record.getmem_count.load(Relaxed);
        let current = total.saturating_sub(record.freemem_count.load(Relaxed));

        match rows.iter_mut().find(|row| row.block_size == block_size) {
            Some(row) => {
                row.total += total;
                row.current += current;
            }
            None => rows.push(SmallBlockStatus {
                block_size,
                total,
                current,
            }),
        }
    });

    match order {
        SmallBlockOrder::BlockSize => rows.sort_by_key(|row| row.block_size),
        SmallBlockOrder::TotalAllocations => rows.sort_by(|a, b| b.total.cmp(&a.total)),
        SmallBlockOrder::CurrentAllocations => rows.sort_by(|a, b| b.current.cmp(&a.current)),
    }

    rows.truncate(max);
    rows
}

/// Aggregated per-class contention (lock sleeps), worst first.
pub(crate) fn block_contention(max: usize) -> Vec<(u32, u64)> {
    let mut rows: Vec<(u32, u64)> = Vec::new();

    for_each_record(|record| {
        let block_size = record.block_size.load(Relaxed);
        let sleeps = record.sleep_count.load(Relaxed);

        match rows.iter_mut().find(|row| row.0 == block_size) {
            Some(row) => row.1 += sleeps,
            None => rows.push((block_size, sleeps)),
        }
    });

    rows.sort_by(|a, b| b.1.cmp(&a.1));
    rows.truncate(max);
    rows
}

/// Walks the allocated slots of a small-block pool hosted in the given
/// medium block. Shutdown/leak-walk only: assumes no concurrent mutation
/// and drained deferred stacks.
#[cfg(feature = "report-leaks")]
pub(crate) unsafe fn walk_pool(
    pool_memory: NonNull<u8>,
    mut visit: impl FnMut(NonNull<u8>, usize),
) {
    let pool = pool_memory.as_ptr() as *mut PoolHeader;
    let data = &(*pool).data;
    debug_assert_eq!(data.signature, POOL_SIGNATURE);

    let class = &*data.owner;
    let inner = &*class.inner.get();
    let block_size = class.block_size();

    // The medium block's header tells us the pool's capacity.
    let medium_word = crate::header::read(pool_memory);
    let usable = crate::header::size_of_word(medium_word) - BLOCK_HEADER_SIZE;
    let slots = (usable - POOL_HEADER_SIZE) / block_size;

    let first_slot = pool_memory.as_ptr().add(POOL_HEADER_SIZE);
    let fed_end = if pool == inner.feed_pool {
        inner.feed_next
    } else {
        first_slot.add(slots * block_size)
    };

    let mut slot = first_slot;
    while slot < fed_end {
        let word = *(slot as *const usize);
        if word & IS_FREE == 0 {
            visit(NonNull::new_unchecked(slot.add(BLOCK_HEADER_SIZE)), block_size);
        }
        slot = slot.add(block_size);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::size_class::class_for_request;
    use crate::test_support::heap_test_lock;

    #[test]
    fn nominal_size_round_trip() {
        let _guard = heap_test_lock();
        crate::init();

        unsafe {
            let class = class_for_request(40);
            let p = alloc_small(class, 40).unwrap();
            p.as_ptr().write_bytes(0xAA, 40);
            assert_eq!(free_small(p), 48);
        }
    }

    #[test]
    fn slots_are_recycled_within_a_pool() {
        let _guard = heap_test_lock();
        crate::init();

        unsafe {
            let class = class_for_request(200);
            let p = alloc_small(class, 200).unwrap();
            free_small(p);
            let q = alloc_small(class, 200).unwrap();
            // LIFO free list hands the same slot back.
            assert_eq!(p, q);
            free_small(q);
        }
    }

    #[test]
    fn exhausting_a_pool_pulls_a_new_one() {
        let _guard = heap_test_lock();
        crate::init();

        unsafe {
            let class = class_for_request(2000);
            let block_size = block_size_of(class);
            let (_, optimal) = pool_sizes_for(block_size);
            // Enough allocations to outgrow at least two pools.
            let count = 3 * (optimal / block_size) + 3;

            let mut blocks = Vec::with_capacity(count);
            for _ in 0..count {
                let p = alloc_small(class, 2000).unwrap();
                p.as_ptr().write_bytes(0x5A, 2000);
                blocks.push(p);
            }

            // Distinct addresses throughout.
            for window in blocks.windows(2) {
                assert_ne!(window[0], window[1]);
            }

            for p in blocks {
                assert_eq!(p.as_ptr().read(), 0x5A);
                assert_eq!(free_small(p), block_size);
            }
        }
    }

    #[test]
    fn contended_free_defers_and_alloc_pops_it() {
        let _guard = heap_test_lock();
        crate::init();

        unsafe {
            let class = class_for_request(300); // above tiny, deterministic record
            let (records, base) = select(class);
            let record = &records[base];

            let p = alloc_small(class, 300).unwrap();

            // Simulate a lock holder: the free must not block, it pushes
            // onto the lock-less stack instead.
            assert!(record.lock.try_acquire());
            let nominal = free_small(p);
            assert_eq!(nominal, record.block_size());
            assert!(!record.deferred.is_empty());
            record.lock.release();

            // The next allocation pops the deferred block without a lock.
            let q = alloc_small(class, 300).unwrap();
            assert_eq!(p, q);
            free_small(q);
        }
    }

    #[test]
    fn accounting_balances() {
        let _guard = heap_test_lock();
        crate::init();

        unsafe {
            let class = class_for_request(500);
            let (records, base) = select(class);
            let record = &records[base];
            let before_get = record.getmem_count.load(Relaxed);
            let before_free = record.freemem_count.load(Relaxed);

            let mut blocks = Vec::new();
            for _ in 0..10 {
                blocks.push(alloc_small(class, 500).unwrap());
            }
            for p in blocks {
                free_small(p);
            }

            assert_eq!(record.getmem_count.load(Relaxed) - before_get, 10);
            assert_eq!(record.freemem_count.load(Relaxed) - before_free, 10);
        }
    }
}
