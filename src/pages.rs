// Aligned page allocation for pools. The host's page allocator is
// preferred; without one we fall back to posix_memalign, which hands out
// power-of-two-aligned regions directly, with no over-allocation and
// masking bookkeeping.

use std::ptr;

use crate::runtime::HostHooks;

pub const POOL_LOG_SIZE: usize = 14; // log_2(POOL_SIZE)
pub const POOL_SIZE: usize = 1 << POOL_LOG_SIZE; // 16k

// Recover the base of the power-of-two-aligned region given pointer lies in.
#[inline(always)]
pub fn base_of<T>(p: *const T, size: usize) -> *mut u8 {
    debug_assert_eq!(size, size.next_power_of_two());
    ((p as usize) & !(size - 1)) as *mut u8
}

pub unsafe fn alloc_aligned(h: &HostHooks, size: usize, align: usize) -> *mut u8 {
    debug_assert_eq!(align, align.next_power_of_two());
    match h.alloc_pages {
        Some(f) => f(size, align) as *mut u8,
        None => {
            let mut mem: *mut libc::c_void = ptr::null_mut();
            if libc::posix_memalign(&mut mem as *mut *mut libc::c_void, align, size) != 0 {
                return ptr::null_mut();
            }
            mem as *mut u8
        }
    }
}

pub unsafe fn free_aligned(h: &HostHooks, p: *mut u8, size: usize) {
    match h.free_pages {
        Some(f) => f(p as *mut libc::c_void, size),
        None => libc::free(p as *mut libc::c_void),
    }
}

#[cfg(test)]
mod pages_tests {
    use super::*;

    #[test]
    fn test_alloc_alignment() {
        let h = HostHooks::none();
        for align in &[64usize, 1024, POOL_SIZE] {
            unsafe {
                let p = alloc_aligned(&h, *align, *align);
                assert!(!p.is_null());
                assert_eq!(p as usize % align, 0);
                free_aligned(&h, p, *align);
            }
        }
    }

    #[test]
    fn test_base_recovery() {
        let h = HostHooks::none();
        unsafe {
            let p = alloc_aligned(&h, POOL_SIZE, POOL_SIZE);
            assert!(!p.is_null());
            // any interior pointer masks back to the base
            let interior = p.offset(12345);
            assert_eq!(base_of(interior, POOL_SIZE), p);
            assert_eq!(base_of(p, POOL_SIZE), p);
            free_aligned(&h, p, POOL_SIZE);
        }
    }
}
