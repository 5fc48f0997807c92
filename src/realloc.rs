//! Cross-tier reallocation policy.
//!
//! Each tier has its own in-place window; this module decides whether the
//! block can stay where it is, resize in place within its tier, or has to
//! move (allocate in the right tier, copy, free). Growth overshoots so a
//! caller that grows a buffer repeatedly doesn't pay a copy per step:
//! small blocks double, medium blocks grow by 25%, large blocks by 25%
//! (12.5% above 128 MiB, inside the large tier).

use std::ptr::NonNull;

use crate::header::{self, BLOCK_HEADER_SIZE, PAYLOAD_MASK};
use crate::size_class::MAX_SMALL_BLOCK_SIZE;
use crate::medium::MAX_MEDIUM_BLOCK_SIZE;
use crate::{allocator, cpu, large, medium, small, Pointer};

/// Reallocates `user` to hold `new_size` bytes. Returns the surviving
/// pointer, or `None` on OS failure (the original block is untouched then).
pub(crate) unsafe fn reallocate(user: NonNull<u8>, new_size: usize) -> Pointer<u8> {
    let word = header::read(user);

    if header::is_small(word) {
        realloc_small(user, word, new_size)
    } else if header::is_medium(word) {
        realloc_medium_tier(user, word, new_size)
    } else {
        realloc_large_tier(user, new_size)
    }
}

unsafe fn realloc_small(user: NonNull<u8>, _word: usize, new_size: usize) -> Pointer<u8> {
    let usable = small::usable_of(user);

    if new_size <= usable {
        if new_size >= usable / 2 {
            return Some(user);
        }
        // Shrunk below half: move to a tighter class.
        return move_to(user, usable, new_size, new_size);
    }

    // Small blocks double on growth; a caller growing byte by byte would
    // otherwise copy on every step.
    let target = new_size.max(usable * 2);
    move_to(user, usable, new_size, target)
}

unsafe fn realloc_medium_tier(user: NonNull<u8>, word: usize, new_size: usize) -> Pointer<u8> {
    let usable = (word & PAYLOAD_MASK) - BLOCK_HEADER_SIZE;

    if new_size <= usable {
        if new_size >= usable / 2 {
            return Some(user);
        }

        if new_size + BLOCK_HEADER_SIZE <= MAX_SMALL_BLOCK_SIZE {
            // Dropped into the small range entirely.
            return move_to(user, usable, new_size, new_size);
        }

        // Still medium: split the tail off in place.
        return medium::realloc_medium(user, new_size);
    }

    if new_size + BLOCK_HEADER_SIZE <= MAX_MEDIUM_BLOCK_SIZE {
        // Try to grow into the following free block first.
        if let Some(same) = medium::realloc_medium(user, new_size) {
            return Some(same);
        }
    }

    let target = new_size.max(usable + usable / 4);
    move_to(user, usable, new_size, target)
}

unsafe fn realloc_large_tier(user: NonNull<u8>, new_size: usize) -> Pointer<u8> {
    let usable = large::size_of_large(user);

    if new_size <= usable && new_size >= usable / 2 {
        return large::realloc_large(user, new_size);
    }

    if new_size + BLOCK_HEADER_SIZE > MAX_MEDIUM_BLOCK_SIZE {
        return large::realloc_large(user, new_size);
    }

    // Shrunk into the small/medium range: allocate there, copy, release
    // the mapping.
    let new_user = allocator::allocate_dispatch(new_size)?;
    cpu::copy_bytes(user.as_ptr(), new_user.as_ptr(), new_size);
    large::free_large(user);

    Some(new_user)
}

/// The move fallback shared by the small and medium paths: allocate
/// `target` bytes wherever they belong, copy the live prefix, free the old
/// block through its own tier.
unsafe fn move_to(
    user: NonNull<u8>,
    old_usable: usize,
    new_size: usize,
    target: usize,
) -> Pointer<u8> {
    let new_user = allocator::allocate_dispatch(target)?;
    cpu::copy_bytes(user.as_ptr(), new_user.as_ptr(), old_usable.min(new_size));

    let word = header::read(user);
    if header::is_small(word) {
        small::free_small(user);
    } else {
        medium::free_medium(user);
    }

    Some(new_user)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::test_support::heap_test_lock;

    #[test]
    fn growing_a_small_block_moves_to_a_larger_class() {
        let _guard = heap_test_lock();
        crate::init();

        unsafe {
            let p = crate::alloc(100);
            assert!(!p.is_null());
            for i in 0..100 {
                p.add(i).write(i as u8);
            }

            let q = reallocate(NonNull::new_unchecked(p), 200).unwrap();
            assert_ne!(q.as_ptr(), p);
            // The new class holds at least 200 usable bytes.
            assert!(crate::size_of(q.as_ptr()) >= 200);
            for i in 0..100 {
                assert_eq!(q.as_ptr().add(i).read(), i as u8);
            }

            crate::free(q.as_ptr());
        }
    }

    #[test]
    fn shrinking_within_half_keeps_the_pointer() {
        let _guard = heap_test_lock();
        crate::init();

        unsafe {
            let p = crate::alloc(100);
            let q = reallocate(NonNull::new_unchecked(p), 70).unwrap();
            assert_eq!(q.as_ptr(), p);
            crate::free(p);
        }
    }

    #[test]
    fn medium_to_small_shrink_moves_the_content() {
        let _guard = heap_test_lock();
        crate::init();

        unsafe {
            let p = crate::alloc(10_000);
            for i in 0..10_000 {
                p.add(i).write((i % 253) as u8);
            }

            let q = reallocate(NonNull::new_unchecked(p), 100).unwrap();
            assert!(crate::size_of(q.as_ptr()) >= 100);
            for i in 0..100 {
                assert_eq!(q.as_ptr().add(i).read(), (i % 253) as u8);
            }
            crate::free(q.as_ptr());
        }
    }

    #[test]
    fn medium_grow_prefers_in_place_then_moves() {
        let _guard = heap_test_lock();
        crate::init();

        unsafe {
            let p = crate::alloc(5_000);
            for i in 0..5_000 {
                p.add(i).write((i % 241) as u8);
            }

            let q = reallocate(NonNull::new_unchecked(p), 200_000).unwrap();
            for i in 0..5_000 {
                assert_eq!(q.as_ptr().add(i).read(), (i % 241) as u8);
            }
            crate::free(q.as_ptr());
        }
    }
}
