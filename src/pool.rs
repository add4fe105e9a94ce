// The pool engine. Pools are pool-size-aligned regions of word cells with
// two free lists each, and the generational fast path leans on the host's
// remembered set: every cell holding a nursery payload is also remembered,
// so the collector updates it through its own remembered-set walk and a
// minor collection does no slot work here at all.
//
// A free cell holds the address of the next free cell with the low bit set,
// which satisfies the runtime's immediate test if a stray scan ever reads
// it. An empty free list is a pointer to the pool itself, never null and
// never a valid cell. A full cell holds the payload verbatim.

use libc::c_void;
use std::mem;
use std::ptr;

use crate::engine::RootEngine;
use crate::pages;
use crate::pages::POOL_SIZE;
use crate::ring;
use crate::ring::RingNode;
use crate::runtime;
use crate::runtime::{HostHooks, Root, ScanAction, Value};
use crate::stats::Stats;
use crate::util::UIntExtras;

const POOL_HEADER_WORDS: usize = 7;

/// Cells per pool.
pub const POOL_CAPACITY: usize = POOL_SIZE / mem::size_of::<Value>() - POOL_HEADER_WORDS;

/// A full-ring pool returns to the available ring when its allocation
/// drops below this.
pub const DEALLOC_THRESHOLD: usize = POOL_CAPACITY * 3 / 4;

#[repr(usize)]
#[derive(Copy, Clone, PartialEq, Debug)]
pub enum PoolClass {
    Available = 0, // on the available ring, allocation candidate
    Full = 1,      // on the full ring, skipped by allocation
}

#[repr(C)]
pub struct Pool {
    prev: *mut Pool,
    next: *mut Pool,
    // head of the major free list, or `base()` when empty
    free_major: *mut Value,
    // head of the minor free list: cells released while holding nursery
    // payloads, still covered by this epoch's remembered-set entries
    free_minor: *mut Value,
    // last cell of the minor list, for the O(1) splice on minor collection
    minor_tail: *mut Value,
    alloc_count: usize,
    class: PoolClass,
    slots: [Value; POOL_CAPACITY],
}

impl RingNode for Pool {
    unsafe fn prev(p: *mut Pool) -> *mut Pool {
        (*p).prev
    }
    unsafe fn next(p: *mut Pool) -> *mut Pool {
        (*p).next
    }
    unsafe fn set_prev(p: *mut Pool, q: *mut Pool) {
        (*p).prev = q;
    }
    unsafe fn set_next(p: *mut Pool, q: *mut Pool) {
        (*p).next = q;
    }
}

impl Pool {
    #[inline(always)]
    pub fn base(&self) -> *mut Value {
        self as *const Pool as *mut Value
    }

    // Recover the owning pool from a cell address by masking the low bits.
    #[inline(always)]
    pub unsafe fn of_slot(r: Root) -> *mut Pool {
        pages::base_of(r, POOL_SIZE) as *mut Pool
    }

    #[inline(always)]
    pub fn is_full(&self) -> bool {
        self.alloc_count == POOL_CAPACITY
    }

    #[inline(always)]
    pub fn alloc_count(&self) -> usize {
        self.alloc_count
    }

    // A free-list link is tagged and its high bits name the owning pool.
    #[inline(always)]
    fn is_free_link(&self, w: usize) -> bool {
        w.has_tag(1) && w.clear_tag(POOL_SIZE - 1) == self.base() as usize
    }

    #[inline(always)]
    unsafe fn pop_major(&mut self) -> *mut Value {
        let s = self.free_major;
        if s == self.base() {
            return ptr::null_mut();
        }
        debug_assert!(self.is_free_link(*s), "major free list reaches a full cell");
        self.free_major = (*s).clear_tag(1) as *mut Value;
        s
    }

    #[inline(always)]
    unsafe fn pop_minor(&mut self) -> *mut Value {
        let s = self.free_minor;
        if s == self.base() {
            return ptr::null_mut();
        }
        debug_assert!(self.is_free_link(*s), "minor free list reaches a full cell");
        let n = (*s).clear_tag(1) as *mut Value;
        self.free_minor = n;
        if n == self.base() {
            self.minor_tail = ptr::null_mut();
        }
        s
    }

    #[inline(always)]
    unsafe fn push_major(&mut self, s: *mut Value) {
        *s = (self.free_major as usize).with_tag(1);
        self.free_major = s;
    }

    #[inline(always)]
    unsafe fn push_minor(&mut self, s: *mut Value) {
        if self.free_minor == self.base() {
            self.minor_tail = s;
        }
        *s = (self.free_minor as usize).with_tag(1);
        self.free_minor = s;
    }

    // Merge the minor free list into the major one, O(1) via the stored
    // tail. Valid once the collection at hand retires this epoch's
    // remembered-set entries.
    pub unsafe fn merge_minor(&mut self) {
        if self.free_minor == self.base() {
            return;
        }
        debug_assert!(!self.minor_tail.is_null(), "non-empty minor list with no tail");
        *self.minor_tail = (self.free_major as usize).with_tag(1);
        self.free_major = self.free_minor;
        self.free_minor = self.base();
        self.minor_tail = ptr::null_mut();
    }

    pub unsafe fn create(h: &HostHooks) -> *mut Pool {
        let mem_ = pages::alloc_aligned(h, POOL_SIZE, POOL_SIZE);
        if mem_.is_null() {
            return ptr::null_mut();
        }
        let p = mem_ as *mut Pool;
        ring::init(p);
        (*p).alloc_count = 0;
        (*p).class = PoolClass::Available;
        (*p).free_minor = (*p).base();
        (*p).minor_tail = ptr::null_mut();
        // chain every cell into the major list in address order
        let slots = (*p).slots.as_mut_ptr();
        for i in 0..POOL_CAPACITY {
            let n = if i + 1 == POOL_CAPACITY {
                (*p).base()
            } else {
                slots.add(i + 1)
            };
            *slots.add(i) = (n as usize).with_tag(1);
        }
        (*p).free_major = slots;
        p
    }

    pub unsafe fn release(p: *mut Pool, h: &HostHooks) {
        pages::free_aligned(h, p as *mut u8, POOL_SIZE);
    }
}

pub struct PoolEngine {
    // pools with free cells; the head is the allocation target
    avail: *mut Pool,
    full: *mut Pool,
    hooks: HostHooks,
    pub stats: Stats,
}

impl PoolEngine {
    pub fn new(hooks: HostHooks) -> PoolEngine {
        PoolEngine {
            avail: ptr::null_mut(),
            full: ptr::null_mut(),
            hooks: hooks,
            stats: Stats::new(),
        }
    }

    // Rotate full pools out of the available ring until one with room
    // surfaces, then fall back to growing.
    #[inline(never)]
    unsafe fn find_available_pool(&mut self) -> *mut Pool {
        while !self.avail.is_null() {
            let p = self.avail;
            if !(*p).is_full() {
                return p;
            }
            ring::remove(&mut self.avail, p);
            (*p).class = PoolClass::Full;
            ring::push_head(&mut self.full, p);
            self.stats.ring_moves += 1;
        }
        self.grow()
    }

    unsafe fn grow(&mut self) -> *mut Pool {
        let p = Pool::create(&self.hooks);
        if p.is_null() {
            return p;
        }
        self.stats.note_pool_alloc();
        ring::push_head(&mut self.avail, p);
        p
    }

    unsafe fn scan_pool(
        p: *mut Pool,
        hooks: &HostHooks,
        stats: &mut Stats,
        action: ScanAction,
        data: *mut c_void,
        young_only: bool,
    ) {
        // walk in address order; the allocation count bounds the walk once
        // every full cell has been seen
        let mut remaining = (*p).alloc_count;
        let slots = (*p).slots.as_mut_ptr();
        let mut i = 0;
        while remaining > 0 && i < POOL_CAPACITY {
            let cell = slots.add(i);
            stats.slots_visited += 1;
            let w = *cell;
            if !(*p).is_free_link(w) {
                remaining -= 1;
                if !young_only || runtime::is_young_block(hooks, w) {
                    action(data, w, cell);
                    stats.useful_scan_work += 1;
                }
            }
            i += 1;
        }
        debug_assert_eq!(remaining, 0, "allocation count exceeds full cells");
    }

    unsafe fn scan_major(&mut self, action: ScanAction, data: *mut c_void) {
        let hooks = self.hooks;
        for p in ring::nodes(self.avail)
            .into_iter()
            .chain(ring::nodes(self.full).into_iter())
        {
            // a major collection empties the nursery and retires the
            // remembered set, so minor-list bookkeeping is stale either way
            (*p).merge_minor();
            PoolEngine::scan_pool(p, &hooks, &mut self.stats, action, data, false);
        }
        self.reclaim_empty_pools();
    }

    // Minor collection with the remembered set in play: every live young
    // cell is already on the collector's own walk, so no slot is visited.
    #[cfg(feature = "generational")]
    unsafe fn scan_minor(&mut self, _action: ScanAction, _data: *mut c_void) {
        for p in ring::nodes(self.avail)
            .into_iter()
            .chain(ring::nodes(self.full).into_iter())
        {
            (*p).merge_minor();
        }
    }

    // Without the fast path, forward every cell that points into the
    // nursery.
    #[cfg(not(feature = "generational"))]
    unsafe fn scan_minor(&mut self, action: ScanAction, data: *mut c_void) {
        let hooks = self.hooks;
        for p in ring::nodes(self.avail)
            .into_iter()
            .chain(ring::nodes(self.full).into_iter())
        {
            PoolEngine::scan_pool(p, &hooks, &mut self.stats, action, data, true);
        }
    }

    // Hand empty pools back after a major collection; keep one around as a
    // buffer against allocator churn.
    unsafe fn reclaim_empty_pools(&mut self) {
        let mut kept = false;
        for p in ring::nodes(self.avail) {
            if (*p).alloc_count != 0 {
                continue;
            }
            if !kept {
                kept = true;
                continue;
            }
            ring::remove(&mut self.avail, p);
            Pool::release(p, &self.hooks);
            self.stats.note_pool_free();
        }
    }

    unsafe fn free_list_len(&mut self, p: *mut Pool, head: *mut Value) -> usize {
        let mut n = 0;
        let mut cur = head;
        while cur != (*p).base() {
            self.stats.slots_visited += 1;
            assert_eq!(Pool::of_slot(cur), p, "free link escapes its pool");
            assert!((*p).is_free_link(*cur), "free list reaches a full cell");
            n += 1;
            assert!(n <= POOL_CAPACITY, "free list cycle");
            cur = (*cur).clear_tag(1) as *mut Value;
        }
        n
    }

    unsafe fn validate_pool(&mut self, p: *mut Pool) {
        let major = self.free_list_len(p, (*p).free_major);
        let minor = self.free_list_len(p, (*p).free_minor);
        assert_eq!(
            major + minor,
            POOL_CAPACITY - (*p).alloc_count,
            "free lists disagree with the allocation count"
        );
        if (*p).free_minor == (*p).base() {
            assert!((*p).minor_tail.is_null());
        } else {
            let tail = (*p).minor_tail;
            assert!(!tail.is_null(), "non-empty minor list with no tail");
            assert_eq!(
                (*tail).clear_tag(1),
                (*p).base() as usize,
                "minor tail does not terminate the list"
            );
        }
    }
}

impl RootEngine for PoolEngine {
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
        self.stats.live_pools as usize
    }

    // Take one free cell for a payload of the given generation. The caller
    // writes the payload and, when asked to, adds the cell to the
    // remembered set, both after dropping the engine lock.
    #[inline(always)]
    unsafe fn take_slot(&mut self, young: bool) -> (*mut Value, bool) {
        let mut p = self.avail;
        if p.is_null() || (*p).is_full() {
            p = self.find_available_pool();
            if p.is_null() {
                return (ptr::null_mut(), false); // the page allocator gave up
            }
        }
        let (s, remember) = if young {
            let s = (*p).pop_minor();
            if !s.is_null() {
                (s, false) // already remembered for this epoch
            } else {
                ((*p).pop_major(), true)
            }
        } else {
            let s = (*p).pop_major();
            if !s.is_null() {
                (s, false)
            } else {
                // leaves a stale remembered-set entry; the next minor
                // collection discards it
                ((*p).pop_minor(), false)
            }
        };
        debug_assert!(!s.is_null(), "non-full pool with two empty free lists");
        (*p).alloc_count += 1;
        self.stats.created += 1;
        self.stats.live += 1;
        if remember {
            self.stats.remembers += 1;
        }
        (s, remember)
    }

    #[inline(always)]
    unsafe fn release_root(&mut self, r: Root) {
        let p = Pool::of_slot(r);
        debug_assert!((*p).alloc_count > 0, "delete on a drained pool");
        if self.classify_young(*r) {
            (*p).push_minor(r);
        } else {
            (*p).push_major(r);
        }
        (*p).alloc_count -= 1;
        if (*p).class == PoolClass::Full && (*p).alloc_count < DEALLOC_THRESHOLD {
            ring::remove(&mut self.full, p);
            (*p).class = PoolClass::Available;
            ring::push_head(&mut self.avail, p);
            self.stats.ring_moves += 1;
        }
        self.stats.deleted += 1;
        self.stats.live -= 1;
    }

    // In-place update; the cell address never changes. Only an old-to-young
    // payload swap owes the remembered set a new entry.
    #[inline(always)]
    unsafe fn modify_root(&mut self, r: &mut Root, v: Value) {
        let s = *r;
        let old = *s;
        *s = v;
        if self.classify_young(v) && !runtime::is_young_block(&self.hooks, old) {
            self.stats.remembers += 1;
            if let Some(f) = self.hooks.remember {
                f(s);
            }
        }
        self.stats.modified += 1;
    }

    unsafe fn scan(&mut self, action: ScanAction, minor: bool, data: *mut c_void) {
        if minor {
            self.scan_minor(action, data);
        } else {
            self.scan_major(action, data);
        }
    }

    unsafe fn teardown(&mut self) {
        for p in ring::nodes(self.avail)
            .into_iter()
            .chain(ring::nodes(self.full).into_iter())
        {
            Pool::release(p, &self.hooks);
            self.stats.note_pool_free();
        }
        self.avail = ptr::null_mut();
        self.full = ptr::null_mut();
    }

    // Structural checks for the memfence builds. The walks below go through
    // the shared counters, so the statistics are snapshotted and restored.
    unsafe fn validate(&mut self) {
        let saved = self.stats;
        let mut pools = 0;
        for p in ring::nodes(self.avail) {
            assert_eq!(
                (*p).class,
                PoolClass::Available,
                "full-class pool on the available ring"
            );
            assert!(!ring::contains(self.full, p), "pool reachable from both rings");
            self.validate_pool(p);
            pools += 1;
        }
        for p in ring::nodes(self.full) {
            assert_eq!((*p).class, PoolClass::Full, "available-class pool on the full ring");
            assert!(
                (*p).alloc_count >= DEALLOC_THRESHOLD,
                "under-filled pool stuck on the full ring"
            );
            self.validate_pool(p);
            pools += 1;
        }
        assert_eq!(pools as u64, self.stats.live_pools, "ring census disagrees with stats");
        self.stats = saved;
    }
}
