// Interface to the host runtime. The engine is linked into the runtime's
// build as a static archive, so the runtime hands its services over as a
// callback table at setup time instead of the engine importing symbols;
// everything the engine consumes from the host goes through this module.

use libc::c_int;
use libc::c_void;

/// A word of the managed runtime: either an immediate (low bit set) or a
/// pointer to a managed block.
pub type Value = usize;

/// A rooted reference: the address of the cell tracking the payload.
/// Opaque to callers; null means allocation failure.
pub type Root = *mut Value;

/// Action supplied by the runtime to a scan. May rewrite `*slot` in place
/// with the forwarded address of `v`.
pub type ScanAction = extern "C" fn(data: *mut c_void, v: Value, slot: *mut Value);

/// The callback the engine registers with the runtime; invoked once per
/// collection, at a safepoint, with no mutator running managed code.
pub type ScanHook = extern "C" fn(action: ScanAction, only_young: c_int, data: *mut c_void);

// Services provided by the host. Every member is optional; see `none` for
// the fallbacks.
#[repr(C)]
#[derive(Copy, Clone)]
pub struct HostHooks {
    // nursery address range, for the inline young check
    pub young_start: *const c_void,
    pub young_end: *const c_void,
    // registration hook for the scan callback
    pub register_scan: Option<extern "C" fn(ScanHook, *mut c_void)>,
    // add a mature-heap location that may hold a nursery pointer to the
    // remembered set of the current domain
    pub remember: Option<extern "C" fn(*mut Value)>,
    // whether the currently running collection is minor
    pub in_minor: Option<extern "C" fn() -> c_int>,
    // page allocator yielding pools aligned to their size
    pub alloc_pages: Option<extern "C" fn(size: usize, align: usize) -> *mut c_void>,
    pub free_pages: Option<extern "C" fn(ptr: *mut c_void, size: usize)>,
}

impl HostHooks {
    /// Hook table for running without a host: empty nursery (nothing
    /// classifies young), no remembered set, libc page allocation, and no
    /// registration (the host calls `triton_scan` directly).
    pub fn none() -> HostHooks {
        HostHooks {
            young_start: ::std::ptr::null(),
            young_end: ::std::ptr::null(),
            register_scan: None,
            remember: None,
            in_minor: None,
            alloc_pages: None,
            free_pages: None,
        }
    }

    #[inline(always)]
    pub fn contains_young(&self, v: Value) -> bool {
        let p = v as *const c_void;
        p >= self.young_start && p < self.young_end
    }
}

// The runtime's value convention: low bit set means immediate. Free-list
// links reuse the same convention so a stray scan skips them.
#[inline(always)]
pub fn is_block(v: Value) -> bool {
    v & 1 == 0
}

#[inline(always)]
pub fn is_young_block(h: &HostHooks, v: Value) -> bool {
    is_block(v) && h.contains_young(v)
}

#[cfg(test)]
mod runtime_tests {
    use super::*;

    #[test]
    fn test_value_convention() {
        assert!(is_block(0x1000));
        assert!(!is_block(0x1001));
        assert!(!is_block(85));
    }

    #[test]
    fn test_young_range() {
        let buf = [0usize; 16];
        let mut h = HostHooks::none();
        h.young_start = buf.as_ptr() as *const c_void;
        h.young_end = unsafe { buf.as_ptr().offset(16) } as *const c_void;

        let inside = &buf[3] as *const usize as Value;
        let first = buf.as_ptr() as Value;
        assert!(is_young_block(&h, inside));
        assert!(h.contains_young(first));
        assert!(!h.contains_young(h.young_end as Value)); // one past the end
    }

    #[test]
    fn test_none_classifies_nothing_young() {
        let h = HostHooks::none();
        assert!(!is_young_block(&h, 0x1000));
        assert!(!h.contains_young(0));
    }
}
