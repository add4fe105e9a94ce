
// some word-tagging helpers not present in Rust std. library
pub trait UIntExtras {
    fn clear_tag(&self, mask: Self) -> Self;
    fn with_tag(&self, mask: Self) -> Self;
    fn has_tag(&self, mask: Self) -> bool;
}

impl UIntExtras for usize {
    #[inline(always)]
    fn clear_tag(&self, mask: Self) -> Self {
        self & !mask
    }

    #[inline(always)]
    fn with_tag(&self, mask: Self) -> Self {
        self | mask
    }

    #[inline(always)]
    fn has_tag(&self, mask: Self) -> bool {
        self & mask != 0
    }
}

impl UIntExtras for u64 {
    #[inline(always)]
    fn clear_tag(&self, mask: Self) -> Self {
        self & !mask
    }

    #[inline(always)]
    fn with_tag(&self, mask: Self) -> Self {
        self | mask
    }

    #[inline(always)]
    fn has_tag(&self, mask: Self) -> bool {
        self & mask != 0
    }
}

// Monotonic wall-clock in nanoseconds, for scan pause accounting.
pub fn hrtime() -> u64 {
    let mut ts = libc::timespec {
        tv_sec: 0,
        tv_nsec: 0,
    };
    unsafe {
        libc::clock_gettime(libc::CLOCK_MONOTONIC, &mut ts as *mut libc::timespec);
    }
    ts.tv_sec as u64 * 1_000_000_000 + ts.tv_nsec as u64
}
