use std::ptr::NonNull;
use std::sync::atomic::{AtomicUsize, Ordering};

use crate::Pointer;

/// Abstraction for platform specific memory handling. The allocator only
/// needs to request anonymous regions of memory and return them when they
/// are no longer in use, plus a couple of extras for the large tier: the
/// Linux kernel remap primitive and the Windows adjacent-region probe. It
/// doesn't care about the APIs offered by the underlying kernel.
trait PlatformVirtualMemory {
    /// Requests a memory region from the kernel where `length` bytes can be
    /// written safely.
    unsafe fn request_memory(length: usize) -> Pointer<u8>;

    /// Returns `length` bytes starting from `address` to the kernel. This is
    /// called to discard entire regions, so `length` equals the size the
    /// region was mapped with.
    unsafe fn return_memory(address: NonNull<u8>, length: usize);

    /// Virtual memory page size in bytes.
    unsafe fn page_size() -> usize;

    /// Releases the rest of this thread's time slice back to the scheduler.
    fn yield_thread();
}

/// Zero sized type that implements [`PlatformVirtualMemory`] for each OS.
pub(crate) struct Platform;

/// Cached virtual memory page size. 4096 bytes on most computers, but we
/// only know the value at runtime.
static PAGE_SIZE: AtomicUsize = AtomicUsize::new(0);

#[inline]
pub(crate) fn page_size() -> usize {
    let mut size = PAGE_SIZE.load(Ordering::Relaxed);
    if size == 0 {
        size = unsafe { Platform::page_size() };
        PAGE_SIZE.store(size, Ordering::Relaxed);
    }

    size
}

/// Convenience wrapper for [`PlatformVirtualMemory::request_memory`].
#[inline]
pub(crate) unsafe fn request_memory(length: usize) -> Pointer<u8> {
    Platform::request_memory(length)
}

/// Convenience wrapper for [`PlatformVirtualMemory::return_memory`].
#[inline]
pub(crate) unsafe fn return_memory(address: NonNull<u8>, length: usize) {
    Platform::return_memory(address, length)
}

/// Convenience wrapper for [`PlatformVirtualMemory::yield_thread`].
#[inline]
pub(crate) fn yield_thread() {
    Platform::yield_thread()
}

/// Attempts to resize the mapping at `address` from `old_length` to
/// `new_length` bytes, letting the kernel move it if necessary. Returns the
/// (possibly new) base address, or `None` if the primitive is unavailable on
/// this platform or the kernel refused. Only Linux implements this; the
/// `no-remap` feature forces the unavailable path everywhere.
#[inline]
pub(crate) unsafe fn remap_memory(
    address: NonNull<u8>,
    old_length: usize,
    new_length: usize,
) -> Pointer<u8> {
    #[cfg(all(target_os = "linux", not(miri), not(feature = "no-remap")))]
    {
        return linux::remap(address, old_length, new_length);
    }

    #[allow(unreachable_code)]
    {
        let _ = (address, old_length, new_length);
        None
    }
}

#[cfg(all(target_os = "linux", not(miri)))]
mod linux {
    use std::ptr::{self, NonNull};

    use rustix::mm::{mmap_anonymous, munmap, MapFlags, ProtFlags};

    use super::{Platform, PlatformVirtualMemory};
    use crate::Pointer;

    impl PlatformVirtualMemory for Platform {
        unsafe fn request_memory(length: usize) -> Pointer<u8> {
            // Private anonymous mapping, read-write, no swap reservation so
            // sparsely-touched super-pools stay cheap.
            match mmap_anonymous(
                ptr::null_mut(),
                length,
                ProtFlags::READ | ProtFlags::WRITE,
                MapFlags::PRIVATE | MapFlags::NORESERVE,
            ) {
                Ok(address) => NonNull::new(address.cast()),
                Err(_) => None,
            }
        }

        unsafe fn return_memory(address: NonNull<u8>, length: usize) {
            // Nothing sensible to do on failure; the region stays mapped.
            let _ = munmap(address.cast().as_ptr(), length);
        }

        unsafe fn page_size() -> usize {
            rustix::param::page_size()
        }

        fn yield_thread() {
            // A ~10ns sleep compiles down to clock_nanosleep, which releases
            // the core even when the runqueue is otherwise empty.
            std::thread::sleep(std::time::Duration::from_nanos(10));
        }
    }

    pub(super) unsafe fn remap(
        address: NonNull<u8>,
        old_length: usize,
        new_length: usize,
    ) -> Pointer<u8> {
        use rustix::mm::{mremap, MremapFlags};

        match mremap(
            address.cast().as_ptr(),
            old_length,
            new_length,
            MremapFlags::MAYMOVE,
        ) {
            Ok(new_address) => NonNull::new(new_address.cast()),
            Err(_) => None,
        }
    }
}

#[cfg(all(unix, not(target_os = "linux"), not(miri)))]
mod unix_fallback {
    //! Non-Linux Unix systems are not a design target but cost nothing to
    //! keep working for development machines: map through the global
    //! allocator at page alignment.

    use std::{alloc, ptr::NonNull};

    use super::{Platform, PlatformVirtualMemory};
    use crate::Pointer;

    fn to_layout(length: usize) -> alloc::Layout {
        alloc::Layout::from_size_align(length, 4096).unwrap()
    }

    impl PlatformVirtualMemory for Platform {
        unsafe fn request_memory(length: usize) -> Pointer<u8> {
            NonNull::new(alloc::alloc_zeroed(to_layout(length)))
        }

        unsafe fn return_memory(address: NonNull<u8>, length: usize) {
            alloc::dealloc(address.as_ptr(), to_layout(length));
        }

        unsafe fn page_size() -> usize {
            4096
        }

        fn yield_thread() {
            std::thread::yield_now();
        }
    }
}

#[cfg(all(windows, not(miri)))]
mod windows_impl {
    use std::mem::MaybeUninit;
    use std::ptr::NonNull;

    use windows::Win32::System::Memory;
    use windows::Win32::System::SystemInformation;
    use windows::Win32::System::Threading;

    use super::{Platform, PlatformVirtualMemory};
    use crate::Pointer;

    impl PlatformVirtualMemory for Platform {
        unsafe fn request_memory(length: usize) -> Pointer<u8> {
            // Reserve and commit in one call; decommit-on-pressure is not
            // part of this allocator's design.
            let flags = Memory::MEM_RESERVE | Memory::MEM_COMMIT;
            let address = Memory::VirtualAlloc(None, length, flags, Memory::PAGE_READWRITE);

            NonNull::new(address.cast())
        }

        unsafe fn return_memory(address: NonNull<u8>, _length: usize) {
            // Length must be 0 with MEM_RELEASE; the whole allocation goes.
            let _ = Memory::VirtualFree(address.cast().as_ptr(), 0, Memory::MEM_RELEASE);
        }

        unsafe fn page_size() -> usize {
            let mut system_info = MaybeUninit::uninit();
            SystemInformation::GetSystemInfo(system_info.as_mut_ptr());

            system_info.assume_init().dwPageSize as usize
        }

        fn yield_thread() {
            unsafe {
                Threading::SwitchToThread();
            }
        }
    }

    /// Probes the region starting right after `address + length`. Returns
    /// the size of the adjacent free region, or 0 if it is in use.
    pub(crate) unsafe fn free_region_after(address: NonNull<u8>, length: usize) -> usize {
        let mut info = MaybeUninit::<Memory::MEMORY_BASIC_INFORMATION>::uninit();
        let probe = address.as_ptr().add(length);
        let written = Memory::VirtualQuery(
            Some(probe.cast()),
            info.as_mut_ptr(),
            std::mem::size_of::<Memory::MEMORY_BASIC_INFORMATION>(),
        );

        if written == 0 {
            return 0;
        }

        let info = info.assume_init();
        if info.State == Memory::MEM_FREE {
            info.RegionSize
        } else {
            0
        }
    }

    /// Reserves then commits `length` bytes exactly at `address`. Two steps
    /// so a concurrent reservation by another component fails cleanly at the
    /// reserve stage instead of committing foreign memory.
    pub(crate) unsafe fn extend_at(address: *mut u8, length: usize) -> bool {
        let reserved = Memory::VirtualAlloc(
            Some(address.cast()),
            length,
            Memory::MEM_RESERVE,
            Memory::PAGE_NOACCESS,
        );
        if reserved.is_null() {
            return false;
        }

        let committed = Memory::VirtualAlloc(
            Some(address.cast()),
            length,
            Memory::MEM_COMMIT,
            Memory::PAGE_READWRITE,
        );
        !committed.is_null()
    }

    /// Releases a segmented large block: the mapping was grown in place one
    /// or more times, so it consists of several independent allocations that
    /// have to be walked and released one by one.
    pub(crate) unsafe fn return_segments(address: NonNull<u8>, total: usize) {
        let mut released = 0usize;
        while released < total {
            let base = address.as_ptr().add(released);
            let mut info = MaybeUninit::<Memory::MEMORY_BASIC_INFORMATION>::uninit();
            let written = Memory::VirtualQuery(
                Some(base.cast()),
                info.as_mut_ptr(),
                std::mem::size_of::<Memory::MEMORY_BASIC_INFORMATION>(),
            );
            if written == 0 {
                return;
            }

            released += info.assume_init().RegionSize;
            let _ = Memory::VirtualFree(base.cast(), 0, Memory::MEM_RELEASE);
        }
    }
}

#[cfg(all(windows, not(miri)))]
pub(crate) use windows_impl::{extend_at, free_region_after, return_segments};

#[cfg(miri)]
mod miri {
    //! When running under Miri we can't rely on system calls such as `mmap`
    //! because there's no FFI support, so we mock the low level memory
    //! management with the global allocator. This also lets Miri find
    //! regions that we never return to the "kernel".

    use std::{alloc, ptr::NonNull};

    use super::{page_size, Platform, PlatformVirtualMemory};
    use crate::Pointer;

    fn to_layout(length: usize) -> alloc::Layout {
        alloc::Layout::from_size_align(length, page_size()).unwrap()
    }

    impl PlatformVirtualMemory for Platform {
        unsafe fn request_memory(length: usize) -> Pointer<u8> {
            NonNull::new(alloc::alloc_zeroed(to_layout(length)))
        }

        unsafe fn return_memory(address: NonNull<u8>, length: usize) {
            alloc::dealloc(address.as_ptr(), to_layout(length));
        }

        unsafe fn page_size() -> usize {
            4096
        }

        fn yield_thread() {
            std::thread::yield_now();
        }
    }
}
