//! Bulk copy helper. In `server` builds on x86-64 the copy uses
//! `rep movsb` when the CPU advertises ERMS (enhanced rep movsb), which
//! beats the generic copy loop for the multi-hundred-kilobyte moves the
//! large tier does. Everything else falls back to `copy_nonoverlapping`.

#[cfg(all(feature = "server", target_arch = "x86_64", not(miri)))]
mod erms {
    use std::sync::atomic::AtomicU8;
    use std::sync::atomic::Ordering::Relaxed;

    const UNKNOWN: u8 = 0;
    const AVAILABLE: u8 = 1;
    const UNAVAILABLE: u8 = 2;

    static STATE: AtomicU8 = AtomicU8::new(UNKNOWN);

    /// CPUID leaf 7, EBX bit 9: enhanced rep movsb/stosb.
    pub(super) fn available() -> bool {
        match STATE.load(Relaxed) {
            AVAILABLE => true,
            UNAVAILABLE => false,
            _ => {
                let leaf = unsafe { std::arch::x86_64::__cpuid_count(0x7, 0x0) };
                let available = leaf.ebx & (1 << 9) != 0;
                STATE.store(if available { AVAILABLE } else { UNAVAILABLE }, Relaxed);
                available
            }
        }
    }

    pub(super) unsafe fn rep_movsb(src: *const u8, dst: *mut u8, len: usize) {
        std::arch::asm!(
            "rep movsb",
            inout("rsi") src => _,
            inout("rdi") dst => _,
            inout("rcx") len => _,
            options(nostack, preserves_flags)
        );
    }
}

/// Copies `len` bytes between non-overlapping buffers.
///
/// # Safety
///
/// Same contract as [`std::ptr::copy_nonoverlapping`].
#[inline]
pub(crate) unsafe fn copy_bytes(src: *const u8, dst: *mut u8, len: usize) {
    #[cfg(all(feature = "server", target_arch = "x86_64", not(miri)))]
    if len >= 1024 && erms::available() {
        erms::rep_movsb(src, dst, len);
        return;
    }

    std::ptr::copy_nonoverlapping(src, dst, len);
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn copies_exactly() {
        let src: Vec<u8> = (0..4096).map(|i| (i % 255) as u8).collect();
        let mut dst = vec![0u8; 4096];

        unsafe {
            copy_bytes(src.as_ptr(), dst.as_mut_ptr(), 4096);
        }

        assert_eq!(src, dst);
    }
}
