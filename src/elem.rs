// The linked-element engine. Every root is its own malloc'd cell on a
// young, old, or free-cache ring; no pooling, no locality. This is the
// correctness baseline the other engines are measured against.

use libc;
use libc::c_void;
use std::mem;
use std::ptr;

use crate::engine::RootEngine;
use crate::ring;
use crate::ring::RingNode;
use crate::runtime;
use crate::runtime::{HostHooks, Root, ScanAction, Value};
use crate::stats::Stats;

#[repr(usize)]
#[derive(Copy, Clone, PartialEq, Debug)]
pub enum ElemClass {
    Young = 0,
    Old = 1,
    Free = 2,
}

#[repr(C)]
pub struct Elem {
    prev: *mut Elem,
    next: *mut Elem,
    class: ElemClass,
    v: Value,
}

// offset of `v`, for recovering the element from a handle
const ELEM_VALUE_OFFSET: usize = 3 * mem::size_of::<usize>();

impl RingNode for Elem {
    unsafe fn prev(p: *mut Elem) -> *mut Elem {
        (*p).prev
    }
    unsafe fn next(p: *mut Elem) -> *mut Elem {
        (*p).next
    }
    unsafe fn set_prev(p: *mut Elem, q: *mut Elem) {
        (*p).prev = q;
    }
    unsafe fn set_next(p: *mut Elem, q: *mut Elem) {
        (*p).next = q;
    }
}

impl Elem {
    #[inline(always)]
    unsafe fn of_slot(r: Root) -> *mut Elem {
        (r as *mut u8).offset(-(ELEM_VALUE_OFFSET as isize)) as *mut Elem
    }

    #[inline(always)]
    unsafe fn slot(e: *mut Elem) -> *mut Value {
        &mut (*e).v as *mut Value
    }
}

pub struct ListEngine {
    young: *mut Elem,
    old: *mut Elem,
    // free-element cache; drained back to the allocator on major scans
    cache: *mut Elem,
    hooks: HostHooks,
    pub stats: Stats,
}

impl ListEngine {
    pub fn new(hooks: HostHooks) -> ListEngine {
        ListEngine {
            young: ptr::null_mut(),
            old: ptr::null_mut(),
            cache: ptr::null_mut(),
            hooks: hooks,
            stats: Stats::new(),
        }
    }

    unsafe fn scan_elem(
        &mut self,
        e: *mut Elem,
        action: ScanAction,
        data: *mut c_void,
        young_only: bool,
    ) {
        self.stats.slots_visited += 1;
        let cell = Elem::slot(e);
        let w = *cell;
        if !young_only || runtime::is_young_block(&self.hooks, w) {
            action(data, w, cell);
            self.stats.useful_scan_work += 1;
        }
    }

    unsafe fn drain_cache(&mut self) {
        for e in ring::nodes(self.cache) {
            libc::free(e as *mut c_void);
        }
        self.cache = ptr::null_mut();
    }
}

impl RootEngine for ListEngine {
    fn hooks(&self) -> &HostHooks {
        &self.hooks
    }

    fn stats(&self) -> &Stats {
        &self.stats
    }

    fn stats_mut(&mut self) -> &mut Stats {
        &mut self.stats
    }

    fn live_pools(&self) -> usize {
        0 // no pooled storage in this engine
    }

    unsafe fn take_slot(&mut self, young: bool) -> (*mut Value, bool) {
        let e = if !self.cache.is_null() {
            let e = self.cache;
            ring::remove(&mut self.cache, e);
            e
        } else {
            let e = libc::malloc(mem::size_of::<Elem>()) as *mut Elem;
            if e.is_null() {
                return (ptr::null_mut(), false);
            }
            ring::init(e);
            e
        };
        if young {
            (*e).class = ElemClass::Young;
            ring::push_head(&mut self.young, e);
        } else {
            (*e).class = ElemClass::Old;
            ring::push_head(&mut self.old, e);
        }
        self.stats.created += 1;
        self.stats.live += 1;
        (Elem::slot(e), false)
    }

    unsafe fn release_root(&mut self, r: Root) {
        let e = Elem::of_slot(r);
        debug_assert!((*e).class != ElemClass::Free, "delete of a cached element");
        if (*e).class == ElemClass::Young {
            ring::remove(&mut self.young, e);
        } else {
            ring::remove(&mut self.old, e);
        }
        (*e).class = ElemClass::Free;
        ring::push_head(&mut self.cache, e);
        self.stats.deleted += 1;
        self.stats.live -= 1;
    }

    // When the payload changes generation the element is reallocated onto
    // the proper ring and the caller's handle variable is rewritten; this
    // happens at most once per element between two minor collections.
    unsafe fn modify_root(&mut self, r: &mut Root, v: Value) {
        self.stats.modified += 1;
        let e = Elem::of_slot(*r);
        let young = self.classify_young(v);
        let young_now = (*e).class == ElemClass::Young;
        if young == young_now {
            (*e).v = v;
            return;
        }
        // the internal take/release pair below is relocation, not host
        // traffic; the create and delete counts must not move
        let created = self.stats.created;
        let deleted = self.stats.deleted;
        let (s, _) = self.take_slot(young);
        if s.is_null() {
            // out of memory: relink the element in place instead, so the
            // update still cannot fail
            if young_now {
                ring::remove(&mut self.young, e);
                (*e).class = ElemClass::Old;
                ring::push_head(&mut self.old, e);
            } else {
                ring::remove(&mut self.old, e);
                (*e).class = ElemClass::Young;
                ring::push_head(&mut self.young, e);
            }
            (*e).v = v;
            return;
        }
        *s = v;
        self.release_root(*r);
        *r = s;
        self.stats.created = created;
        self.stats.deleted = deleted;
    }

    unsafe fn scan(&mut self, action: ScanAction, minor: bool, data: *mut c_void) {
        if minor {
            for e in ring::nodes(self.young) {
                self.scan_elem(e, action, data, true);
                (*e).class = ElemClass::Old;
            }
            ring::splice_tail(&mut self.old, &mut self.young);
        } else {
            for e in ring::nodes(self.young)
                .into_iter()
                .chain(ring::nodes(self.old).into_iter())
            {
                self.scan_elem(e, action, data, false);
            }
            self.drain_cache();
        }
    }

    unsafe fn teardown(&mut self) {
        for e in ring::nodes(self.young)
            .into_iter()
            .chain(ring::nodes(self.old).into_iter())
            .chain(ring::nodes(self.cache).into_iter())
        {
            libc::free(e as *mut c_void);
        }
        self.young = ptr::null_mut();
        self.old = ptr::null_mut();
        self.cache = ptr::null_mut();
    }

    unsafe fn validate(&mut self) {
        let saved = self.stats;
        let mut live = 0i64;
        for e in ring::nodes(self.young) {
            self.stats.slots_visited += 1;
            assert_eq!((*e).class, ElemClass::Young, "misclassified element on the young ring");
            live += 1;
        }
        for e in ring::nodes(self.old) {
            self.stats.slots_visited += 1;
            assert_eq!((*e).class, ElemClass::Old, "misclassified element on the old ring");
            live += 1;
        }
        for e in ring::nodes(self.cache) {
            self.stats.slots_visited += 1;
            assert_eq!((*e).class, ElemClass::Free, "live element on the free cache");
        }
        assert_eq!(live, self.stats.live, "ring census disagrees with stats");
        self.stats = saved;
    }
}
