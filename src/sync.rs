//! Synchronization primitives: the test-and-set byte lock with the
//! spin-then-yield acquire discipline, and the lock-less free stack that
//! keeps `free` from ever blocking on a held lock.

use std::hint;
use std::ptr::{null_mut, NonNull};
use std::sync::atomic::Ordering::{Acquire, Relaxed, Release};
use std::sync::atomic::{AtomicBool, AtomicPtr};

/// Bounded spin counts before releasing the thread to the OS scheduler.
pub(crate) const SMALL_SPIN_LIMIT: u32 = 500;
pub(crate) const MEDIUM_SPIN_LIMIT: u32 = 2500;
pub(crate) const LARGE_SPIN_LIMIT: u32 = 5000;

/// A test-and-set byte lock. Acquire is a fetch-then-exchange, release is a
/// plain store; contended acquires spin with `pause` up to a bounded count
/// and then yield the thread to the OS before retrying.
///
/// A holder must not call back into the same lock's owner structure while
/// holding it; lock ordering is size-class lock -> medium lock, with the
/// large lock as a leaf.
pub(crate) struct ByteLock {
    locked: AtomicBool,
}

impl ByteLock {
    pub(crate) const fn new() -> Self {
        Self {
            locked: AtomicBool::new(false),
        }
    }

    /// Single acquisition attempt. The relaxed pre-check keeps the cache
    /// line shared while the lock is held by somebody else.
    #[inline]
    pub(crate) fn try_acquire(&self) -> bool {
        !self.locked.load(Relaxed) && !self.locked.swap(true, Acquire)
    }

    /// Acquires the lock, spinning up to `spin_limit` pause iterations per
    /// round and yielding to the OS between rounds. Returns the number of
    /// yields, which callers feed into the contention statistics.
    pub(crate) fn acquire(&self, spin_limit: u32) -> u64 {
        let mut sleeps = 0u64;

        loop {
            if self.try_acquire() {
                return sleeps;
            }

            let mut spins = 0;
            while spins < spin_limit {
                hint::spin_loop();
                if !self.locked.load(Relaxed) && self.try_acquire() {
                    return sleeps;
                }
                spins += 1;
            }

            crate::stats::timed_yield();
            sleeps += 1;
        }
    }

    #[inline]
    pub(crate) fn release(&self) {
        self.locked.store(false, Release);
    }
}

/// Link stored in the first word of a deferred-freed block. The block's
/// content is dead memory as far as the caller is concerned, so we can use
/// it for the stack exactly like the intra-pool free lists reuse block
/// content for their links.
#[repr(C)]
pub(crate) struct FreeStackNode {
    pub next: *mut FreeStackNode,
}

/// Lock-less LIFO stack of deferred frees.
///
/// Push is a single CAS on the head and never blocks, which is what makes
/// `free` wait-free when the owning lock is contended. The drain detaches
/// the whole list with one `swap` and is only ever executed by the holder
/// of the owning structure's byte lock, which is also why no ABA protection
/// is needed: detached nodes are re-processed and become reachable again
/// only after the holder finishes its critical section.
pub(crate) struct FreeStack {
    head: AtomicPtr<FreeStackNode>,
}

impl FreeStack {
    pub(crate) const fn new() -> Self {
        Self {
            head: AtomicPtr::new(null_mut()),
        }
    }

    #[inline]
    pub(crate) fn is_empty(&self) -> bool {
        self.head.load(Relaxed).is_null()
    }

    /// Pushes a single node.
    ///
    /// # Safety
    ///
    /// `node` must point to writable memory not reachable by any other
    /// thread (a block the caller just freed).
    pub(crate) unsafe fn push(&self, node: NonNull<FreeStackNode>) {
        loop {
            let current = self.head.load(Relaxed);
            node.as_ptr().write(FreeStackNode { next: current });
            if self
                .head
                .compare_exchange_weak(current, node.as_ptr(), Release, Relaxed)
                .is_ok()
            {
                return;
            }
        }
    }

    /// Atomically prepends a whole detached list. Walks to the tail first;
    /// this path is cold (it only runs when an alloc fast path popped one
    /// element off a detached drain).
    ///
    /// # Safety
    ///
    /// `first` must be the head of a valid, unreachable singly-linked list.
    pub(crate) unsafe fn push_list(&self, first: NonNull<FreeStackNode>) {
        let mut tail = first.as_ptr();
        while !(*tail).next.is_null() {
            tail = (*tail).next;
        }

        loop {
            let current = self.head.load(Relaxed);
            (*tail).next = current;
            if self
                .head
                .compare_exchange_weak(current, first.as_ptr(), Release, Relaxed)
                .is_ok()
            {
                return;
            }
        }
    }

    /// Detaches the entire stack. The returned list is in LIFO push order.
    #[inline]
    pub(crate) fn drain(&self) -> *mut FreeStackNode {
        if self.is_empty() {
            return null_mut();
        }

        self.head.swap(null_mut(), Acquire)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn byte_lock_exclusion() {
        let lock = ByteLock::new();
        assert!(lock.try_acquire());
        assert!(!lock.try_acquire());
        lock.release();
        assert!(lock.try_acquire());
        lock.release();
    }

    #[test]
    fn stack_push_and_drain_is_lifo() {
        let stack = FreeStack::new();
        let mut slots = [FreeStackNode { next: null_mut() }, FreeStackNode { next: null_mut() }];

        unsafe {
            stack.push(NonNull::new_unchecked(&mut slots[0]));
            stack.push(NonNull::new_unchecked(&mut slots[1]));
        }

        let first = stack.drain();
        assert_eq!(first, &mut slots[1] as *mut _);
        let second = unsafe { (*first).next };
        assert_eq!(second, &mut slots[0] as *mut _);
        assert!(unsafe { (*second).next }.is_null());
        assert!(stack.drain().is_null());
    }

    #[test]
    fn stack_push_list_splices_at_head() {
        let stack = FreeStack::new();
        let mut a = FreeStackNode { next: null_mut() };
        let mut b = FreeStackNode { next: null_mut() };
        let mut c = FreeStackNode { next: null_mut() };

        unsafe {
            stack.push(NonNull::new_unchecked(&mut a));
            b.next = &mut c;
            stack.push_list(NonNull::new_unchecked(&mut b));
        }

        let first = stack.drain();
        assert_eq!(first, &mut b as *mut _);
        unsafe {
            assert_eq!((*first).next, &mut c as *mut _);
        }
        assert_eq!(c.next, &mut a as *mut _);
        assert!(a.next.is_null());
    }
}
