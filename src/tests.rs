// Scenario tests that drive the engines the way the host runtime would:
// a fake nursery, a recording remembered set, and a forwarding action that
// plays the collector's part. Structural unit tests live with their
// modules; everything here crosses module boundaries.

use std::cell::Cell;
use std::cell::RefCell;
use std::mem;
use std::ptr;
use std::sync::Mutex;

use libc::{c_int, c_void};

use crate::chunk::{ChunkEngine, CHUNK_SLOTS};
use crate::elem::ListEngine;
use crate::engine;
use crate::engine::RootEngine;
use crate::ffi;
use crate::pool::{PoolEngine, POOL_CAPACITY};
use crate::runtime::{HostHooks, Root, ScanHook, Value};

const NURSERY_WORDS: usize = 4096;
const MATURE_WORDS: usize = 8192;

// One fake heap per test thread. The nursery is evacuated on each minor
// cycle; evacuated cells keep a forwarding pointer until the cycle ends.
struct MockHeap {
    nursery: Vec<Value>,
    mature: Vec<Value>,
    next_young: usize,
    next_mature: usize,
    remset: Vec<*mut Value>,
    remset_visits: u64,
    minor_running: bool,
}

impl MockHeap {
    fn new() -> MockHeap {
        MockHeap {
            nursery: vec![1; NURSERY_WORDS],
            mature: vec![1; MATURE_WORDS],
            next_young: 0,
            next_mature: 0,
            remset: Vec::new(),
            remset_visits: 0,
            minor_running: false,
        }
    }

    fn in_nursery(&self, v: Value) -> bool {
        let base = self.nursery.as_ptr() as usize;
        v >= base && v < base + NURSERY_WORDS * mem::size_of::<Value>()
    }

    fn alloc_young(&mut self) -> Value {
        assert!(self.next_young < NURSERY_WORDS, "mock nursery exhausted");
        let v = &self.nursery[self.next_young] as *const Value as Value;
        self.next_young += 1;
        v
    }

    fn alloc_mature(&mut self) -> Value {
        assert!(self.next_mature < MATURE_WORDS, "mock mature space exhausted");
        let v = &self.mature[self.next_mature] as *const Value as Value;
        self.next_mature += 1;
        v
    }

    fn promote(&mut self, v: Value) -> Value {
        let idx = (v - self.nursery.as_ptr() as usize) / mem::size_of::<Value>();
        let cur = self.nursery[idx];
        if cur & 1 == 0 {
            return cur; // forwarding pointer already installed
        }
        let nv = self.alloc_mature();
        self.nursery[idx] = nv;
        nv
    }
}

thread_local! {
    static HEAP: RefCell<MockHeap> = RefCell::new(MockHeap::new());
    static REGISTERED: Cell<Option<ScanHook>> = Cell::new(None);
}

fn with_heap<R, F: FnOnce(&mut MockHeap) -> R>(f: F) -> R {
    HEAP.with(|h| f(&mut *h.borrow_mut()))
}

fn young_value() -> Value {
    with_heap(|h| h.alloc_young())
}

fn mature_value() -> Value {
    with_heap(|h| h.alloc_mature())
}

extern "C" fn mock_remember(slot: *mut Value) {
    with_heap(|h| h.remset.push(slot));
}

extern "C" fn mock_in_minor() -> c_int {
    with_heap(|h| h.minor_running as c_int)
}

extern "C" fn mock_register(hook: ScanHook, _data: *mut c_void) {
    REGISTERED.with(|r| r.set(Some(hook)));
}

// The runtime's scanning action: immediates are ignored, nursery blocks
// are forwarded in place.
extern "C" fn forward_action(_data: *mut c_void, v: Value, slot: *mut Value) {
    with_heap(|h| {
        if v & 1 == 0 && h.in_nursery(v) {
            let nv = h.promote(v);
            unsafe {
                *slot = nv;
            }
        }
    });
}

fn mock_hooks() -> HostHooks {
    let (start, end) = with_heap(|h| {
        let base = h.nursery.as_ptr();
        (base as *const c_void, unsafe { base.add(NURSERY_WORDS) } as *const c_void)
    });
    let mut hooks = HostHooks::none();
    hooks.young_start = start;
    hooks.young_end = end;
    hooks.register_scan = Some(mock_register);
    hooks.remember = Some(mock_remember);
    hooks.in_minor = Some(mock_in_minor);
    hooks
}

// What the collector does before our callback runs on a minor cycle: walk
// the remembered set and forward every nursery pointer it reaches.
fn walk_remset() {
    let slots: Vec<*mut Value> = with_heap(|h| {
        let s = h.remset.clone();
        h.remset.clear();
        s
    });
    for slot in slots {
        with_heap(|h| {
            h.remset_visits += 1;
            let v = unsafe { *slot };
            if v & 1 == 0 && h.in_nursery(v) {
                let nv = h.promote(v);
                unsafe {
                    *slot = nv;
                }
            }
        });
    }
}

fn evacuate_nursery() {
    with_heap(|h| {
        h.next_young = 0;
        for w in h.nursery.iter_mut() {
            *w = 1;
        }
        h.minor_running = false;
    });
}

fn run_minor<E: RootEngine>(e: &mut E) {
    with_heap(|h| h.minor_running = true);
    walk_remset();
    unsafe {
        e.scan(forward_action, true, ptr::null_mut());
    }
    evacuate_nursery();
}

fn run_major<E: RootEngine>(e: &mut E) {
    unsafe {
        e.scan(forward_action, false, ptr::null_mut());
    }
}

// Create through an engine instance the way the public API does: classify,
// take a slot, write the payload, then settle the remembered-set debt.
unsafe fn icreate<E: RootEngine>(e: &mut E, v: Value) -> Root {
    let young = e.classify_young(v);
    let (s, remember) = e.take_slot(young);
    if s.is_null() {
        return s;
    }
    *s = v;
    if remember {
        if let Some(f) = e.hooks().remember {
            f(s);
        }
    }
    s
}

// Serializes the tests that go through the process-wide engine.
static GLOBAL_ENGINE: Mutex<()> = Mutex::new(());

//------------------------------------------------------------------------------
// Scenarios against the global engine

#[test]
fn test_single_root_lifecycle() {
    let _g = GLOBAL_ENGINE.lock().unwrap();
    assert!(engine::setup(mock_hooks()));
    unsafe {
        let r = engine::create(42);
        assert!(!r.is_null());
        assert_eq!(engine::get(r), 42);
        assert_eq!(engine::get_ref(r), r);
        assert_eq!(engine::live_pools(), 1); // nothing beyond the first pool
        engine::delete(r);
    }
    let s = engine::stats_snapshot().unwrap();
    assert_eq!(s.created, 1);
    assert_eq!(s.deleted, 1);
    assert_eq!(s.live, 0);
    engine::teardown();
    assert_eq!(engine::live_pools(), 0);
}

#[test]
fn test_setup_teardown_idempotent() {
    let _g = GLOBAL_ENGINE.lock().unwrap();
    assert!(engine::setup(HostHooks::none()));
    assert!(!engine::setup(HostHooks::none())); // second setup reports failure
    engine::teardown();
    engine::teardown(); // teardown after teardown is a no-op
    assert!(engine::setup(HostHooks::none()));
    engine::teardown();
}

#[test]
fn test_create_before_setup_is_null() {
    let _g = GLOBAL_ENGINE.lock().unwrap();
    unsafe {
        assert!(engine::create(42).is_null());
    }
}

#[test]
fn test_registered_hook_drives_minor() {
    let _g = GLOBAL_ENGINE.lock().unwrap();
    assert!(engine::setup(mock_hooks()));
    let hook = REGISTERED.with(|r| r.get()).expect("setup did not register the scan hook");

    unsafe {
        let mut roots = Vec::new();
        for _ in 0..100 {
            let r = engine::create(young_value());
            assert!(!r.is_null());
            roots.push(r);
        }
        with_heap(|h| h.minor_running = true);
        walk_remset();
        hook(forward_action, 1, ptr::null_mut());
        evacuate_nursery();

        // every root now points at the promoted copy
        for r in &roots {
            let v = engine::get(*r);
            assert!(v & 1 == 0);
            assert!(!with_heap(|h| h.in_nursery(v)));
        }
        let s = engine::stats_snapshot().unwrap();
        assert_eq!(s.minor_scans, 1);
        assert_eq!(with_heap(|h| h.remset_visits), 100);

        for r in roots {
            engine::delete(r);
        }
    }
    engine::teardown();
}

#[test]
fn test_ffi_surface() {
    let _g = GLOBAL_ENGINE.lock().unwrap();
    unsafe {
        assert_eq!(ffi::triton_setup(ptr::null()), 1);
        assert_eq!(ffi::triton_setup(ptr::null()), 0);

        let mut r = ffi::triton_create(85); // an immediate
        assert!(!r.is_null());
        assert_eq!(ffi::triton_get(r), 85);
        assert_eq!(ffi::triton_get_ref(r), r);

        let addr = r;
        ffi::triton_modify(&mut r as *mut Root, 87);
        assert_eq!(r, addr); // the pool engine never relocates a cell
        assert_eq!(ffi::triton_get(r), 87);

        assert_eq!(ffi::triton_live_pools(), 1);
        let s = ffi::triton_stats();
        assert_eq!(s.created, 1);
        assert_eq!(s.modified, 1);
        ffi::triton_print_stats();

        ffi::triton_delete(r);
        ffi::triton_teardown();
    }
}

#[test]
fn test_concurrent_create_delete() {
    let _g = GLOBAL_ENGINE.lock().unwrap();
    assert!(engine::setup(HostHooks::none()));
    crossbeam::thread::scope(|s| {
        for t in 0..4 {
            s.spawn(move |_| {
                for i in 0..1000 {
                    unsafe {
                        let r = engine::create(((t * 1000 + i) << 1) | 1);
                        assert!(!r.is_null());
                        assert_eq!(engine::get(r) & 1, 1);
                        engine::delete(r);
                    }
                }
            });
        }
    })
    .unwrap();
    let s = engine::stats_snapshot().unwrap();
    assert_eq!(s.created, 4000);
    assert_eq!(s.deleted, 4000);
    assert_eq!(s.live, 0);
    engine::teardown();
}

//------------------------------------------------------------------------------
// Scenarios against a pool engine instance

#[test]
fn test_modify_keeps_the_cell() {
    let mut e = PoolEngine::new(mock_hooks());
    unsafe {
        let a = mature_value();
        let b = mature_value();
        let mut r = icreate(&mut e, a);
        let before = r;
        e.modify_root(&mut r, b);
        assert_eq!(r, before);
        assert_eq!(*r, b);
        e.release_root(r);
        e.teardown();
    }
}

#[test]
fn test_fill_and_drain_two_pools() {
    let mut e = PoolEngine::new(mock_hooks());
    unsafe {
        let mut roots = Vec::new();
        for _ in 0..POOL_CAPACITY + 1 {
            let r = icreate(&mut e, mature_value());
            assert!(!r.is_null());
            roots.push(r);
        }
        assert_eq!(e.stats.live_pools, 2);

        for r in roots {
            e.release_root(r);
        }
        assert_eq!(e.stats.live, 0);
        e.validate();

        // empty pools are handed back after a major collection, one kept
        run_major(&mut e);
        assert!(e.stats.live_pools <= 1);
        e.validate();
        e.teardown();
    }
}

#[test]
fn test_minor_collection_visits_no_slot() {
    let mut e = PoolEngine::new(mock_hooks());
    unsafe {
        let mut roots = Vec::new();
        for _ in 0..1000 {
            let r = icreate(&mut e, young_value());
            assert!(!r.is_null());
            roots.push(r);
        }
        // each young root was added to the remembered set exactly once
        assert_eq!(with_heap(|h| h.remset.len()), 1000);
        assert_eq!(e.stats.remembers, 1000);

        let visited_before = e.stats.slots_visited;
        run_minor(&mut e);
        assert_eq!(e.stats.slots_visited, visited_before); // zero slot work
        assert_eq!(with_heap(|h| h.remset_visits), 1000);

        // the collector forwarded every payload through its own walk
        for r in &roots {
            let v = **r;
            assert!(!with_heap(|h| h.in_nursery(v)));
        }
        e.validate();
        for r in roots {
            e.release_root(r);
        }
        e.teardown();
    }
}

#[test]
fn test_major_scan_visits_exactly_the_full_cells() {
    let mut e = PoolEngine::new(mock_hooks());
    unsafe {
        let mut roots = Vec::new();
        for _ in 0..1000 {
            roots.push(icreate(&mut e, mature_value()));
        }
        for _ in 0..500 {
            roots.push(icreate(&mut e, young_value()));
        }
        let visited_before = e.stats.slots_visited;
        let useful_before = e.stats.useful_scan_work;
        run_major(&mut e);
        assert_eq!(e.stats.useful_scan_work - useful_before, 1500);
        assert_eq!(e.stats.slots_visited - visited_before, 1500); // no free cell seen

        // the young payloads were forwarded by the scan itself
        for r in &roots {
            assert!(!with_heap(|h| h.in_nursery(**r)));
        }
        for r in roots {
            e.release_root(r);
        }
        e.teardown();
    }
}

#[test]
fn test_released_young_cells_retire_on_minor() {
    let mut e = PoolEngine::new(mock_hooks());
    unsafe {
        let mut roots = Vec::new();
        for _ in 0..10 {
            roots.push(icreate(&mut e, young_value()));
        }
        // five roots die young; their cells go to the minor free list while
        // the remembered set still points at them
        for r in roots.drain(..5) {
            e.release_root(r);
        }
        e.validate();

        run_minor(&mut e);
        // the walk saw all ten entries; the five dead cells held tagged
        // links and were skipped as immediates
        assert_eq!(with_heap(|h| h.remset_visits), 10);
        for r in &roots {
            assert!(!with_heap(|h| h.in_nursery(**r)));
        }
        e.validate();

        // the merged cells are plain major-list cells now: a fresh young
        // root pops one and owes the remembered set a new entry
        let before = e.stats.remembers;
        let r = icreate(&mut e, young_value());
        assert_eq!(e.stats.remembers, before + 1);

        e.release_root(r);
        for r in roots {
            e.release_root(r);
        }
        e.teardown();
    }
}

#[test]
fn test_modify_owes_the_remembered_set() {
    let mut e = PoolEngine::new(mock_hooks());
    unsafe {
        let mut r = icreate(&mut e, mature_value());
        assert_eq!(e.stats.remembers, 0);

        // mature -> young: a new entry
        e.modify_root(&mut r, young_value());
        assert_eq!(e.stats.remembers, 1);
        // young -> young: covered by the existing entry
        e.modify_root(&mut r, young_value());
        assert_eq!(e.stats.remembers, 1);
        // young -> mature: nothing owed
        e.modify_root(&mut r, mature_value());
        assert_eq!(e.stats.remembers, 1);

        e.release_root(r);
        e.teardown();
    }
}

#[test]
fn test_round_trip_restores_counts() {
    let mut e = PoolEngine::new(mock_hooks());
    unsafe {
        for round in 0..3 {
            let mut roots = Vec::new();
            for i in 0..2500 {
                let v = if i % 3 == 0 {
                    (i << 1) | 1
                } else {
                    mature_value()
                };
                roots.push(icreate(&mut e, v));
            }
            // interleave some churn
            for _ in 0..500 {
                let r = roots.swap_remove(round * 100);
                e.release_root(r);
            }
            for r in roots {
                e.release_root(r);
            }
            assert_eq!(e.stats.live, 0);
            e.validate();
            run_major(&mut e);
            with_heap(|h| h.next_mature = 0);
        }
        assert!(e.stats.live_pools <= 1);
        e.teardown();
    }
}

//------------------------------------------------------------------------------
// Scenarios against the chunk engine

#[test]
fn test_chunk_minor_migrates_the_young_ring() {
    let mut e = ChunkEngine::new(mock_hooks());
    unsafe {
        let mut roots = Vec::new();
        for _ in 0..3 {
            roots.push(icreate(&mut e, young_value()));
        }
        let visited_before = e.stats.slots_visited;
        let useful_before = e.stats.useful_scan_work;
        run_minor(&mut e);
        // the whole young chunk is walked with the range check
        assert_eq!(e.stats.slots_visited - visited_before, CHUNK_SLOTS as u64);
        assert_eq!(e.stats.useful_scan_work - useful_before, 3);

        for r in &roots {
            assert!(!with_heap(|h| h.in_nursery(**r)));
        }
        // the nursery is evacuated, so the ring went old wholesale
        e.validate();
        let s = e.stats;
        assert_eq!(s.live, 3);

        // a young write into the now-old chunk reclassifies it
        let mut r0 = roots[0];
        e.modify_root(&mut r0, young_value());
        assert_eq!(r0, roots[0]); // cells never move in this engine
        e.validate();

        run_minor(&mut e);
        for r in roots {
            e.release_root(r);
        }
        e.teardown();
    }
}

#[test]
fn test_chunk_major_reclaims_empties() {
    let mut e = ChunkEngine::new(mock_hooks());
    unsafe {
        let mut roots = Vec::new();
        for _ in 0..CHUNK_SLOTS + 1 {
            roots.push(icreate(&mut e, mature_value()));
        }
        assert_eq!(e.stats.live_pools, 2);
        for r in roots {
            e.release_root(r);
        }
        run_major(&mut e);
        assert!(e.stats.live_pools <= 1);
        e.validate();
        e.teardown();
    }
}

//------------------------------------------------------------------------------
// Scenarios against the element engine

#[test]
fn test_elem_modify_reallocates_across_generations() {
    let mut e = ListEngine::new(mock_hooks());
    unsafe {
        let mut r = icreate(&mut e, mature_value());
        let before = r;

        // mature -> young moves the element; the handle variable changes,
        // and only the modify counter does
        e.modify_root(&mut r, young_value());
        assert_ne!(r, before);
        assert_eq!(e.stats.created, 1);
        assert_eq!(e.stats.deleted, 0);
        assert_eq!(e.stats.modified, 1);
        assert_eq!(e.stats.live, 1);
        let relocated = r;

        // young -> young stays put
        e.modify_root(&mut r, young_value());
        assert_eq!(r, relocated);
        e.validate();

        e.release_root(r);
        assert_eq!(e.stats.live, 0);
        e.teardown();
    }
}

#[test]
fn test_elem_minor_splices_and_major_drains() {
    let mut e = ListEngine::new(mock_hooks());
    unsafe {
        let mut roots = Vec::new();
        for _ in 0..5 {
            roots.push(icreate(&mut e, young_value()));
        }
        let useful_before = e.stats.useful_scan_work;
        run_minor(&mut e);
        assert_eq!(e.stats.useful_scan_work - useful_before, 5);
        for r in &roots {
            assert!(!with_heap(|h| h.in_nursery(**r)));
        }
        e.validate(); // every element is on the old ring now

        // releases feed the cache; a major scan drains it
        for r in roots {
            e.release_root(r);
        }
        let a = icreate(&mut e, mature_value());
        run_major(&mut e);
        e.validate();
        e.release_root(a);
        e.teardown();
    }
}
