// The common contract of the three storage engines, the process-wide
// engine instance, and the handle fast paths. The runtime this library
// serves is itself a process singleton, so the engine is one too: a static
// initialized by `setup`, torn down when the runtime shuts down.

use libc::c_int;
use libc::c_void;
use std::ptr;
use std::sync::atomic::{AtomicBool, Ordering};
#[cfg(feature = "threads")]
use std::sync::{Mutex, MutexGuard};

use crate::runtime;
use crate::runtime::{HostHooks, Root, ScanAction, Value};
use crate::stats::Stats;
use crate::util::hrtime;

// Contract shared by the pool, chunk, and element engines. `take_slot`
// hands out the cell and says whether the caller owes the remembered set
// an entry; the payload write itself happens outside the engine lock.
pub trait RootEngine {
    fn hooks(&self) -> &HostHooks;
    fn stats(&self) -> &Stats;
    fn stats_mut(&mut self) -> &mut Stats;
    fn live_pools(&self) -> usize;

    #[inline(always)]
    fn classify_young(&self, v: Value) -> bool {
        cfg!(feature = "generational") && runtime::is_young_block(self.hooks(), v)
    }

    unsafe fn take_slot(&mut self, young: bool) -> (*mut Value, bool);
    unsafe fn release_root(&mut self, r: Root);
    unsafe fn modify_root(&mut self, r: &mut Root, v: Value);
    unsafe fn scan(&mut self, action: ScanAction, minor: bool, data: *mut c_void);
    unsafe fn teardown(&mut self);
    unsafe fn validate(&mut self);
}

// The engine variant behind the public API.
#[cfg(not(any(feature = "chunk_engine", feature = "list_engine")))]
pub type ActiveEngine = crate::pool::PoolEngine;
#[cfg(feature = "chunk_engine")]
pub type ActiveEngine = crate::chunk::ChunkEngine;
#[cfg(all(feature = "list_engine", not(feature = "chunk_engine")))]
pub type ActiveEngine = crate::elem::ListEngine;

#[cfg(not(any(feature = "chunk_engine", feature = "list_engine")))]
const ENGINE_LABEL: &'static str = "triton (pool engine)";
#[cfg(feature = "chunk_engine")]
const ENGINE_LABEL: &'static str = "triton (chunk engine)";
#[cfg(all(feature = "list_engine", not(feature = "chunk_engine")))]
const ENGINE_LABEL: &'static str = "triton (element engine)";

static mut ENGINE: Option<ActiveEngine> = None;

#[cfg(feature = "threads")]
static LOCK: Mutex<()> = Mutex::new(());

// Guards ring and pool structure, and the scan callback in its entirety.
// Payload reads and writes never take it.
#[cfg(feature = "threads")]
#[inline(always)]
fn lock() -> MutexGuard<'static, ()> {
    LOCK.lock().unwrap()
}

#[cfg(not(feature = "threads"))]
#[inline(always)]
fn lock() {}

static COMPLAINED: AtomicBool = AtomicBool::new(false);

#[inline(never)]
fn complain_once() {
    if !COMPLAINED.swap(true, Ordering::Relaxed) {
        eprintln!("triton: root created before setup");
    }
}

/// Bring the engine up. Idempotent: returns false when already set up.
pub fn setup(hooks: HostHooks) -> bool {
    {
        let _g = lock();
        unsafe {
            if ENGINE.is_some() {
                return false;
            }
            ENGINE = Some(ActiveEngine::new(hooks));
        }
    }
    // registration happens after the lock drops; some hosts invoke the
    // hook immediately to prime their callback tables
    if let Some(reg) = hooks.register_scan {
        reg(scan_hook, ptr::null_mut());
    }
    true
}

/// Tear the engine down, releasing every pool. Idempotent; only legal once
/// the runtime is shutting down and no root is in use.
pub fn teardown() {
    let _g = lock();
    unsafe {
        if let Some(e) = ENGINE.as_mut() {
            e.teardown();
        }
        ENGINE = None;
    }
}

/// Root a value. Null on out-of-memory or before setup.
#[inline(always)]
pub unsafe fn create(v: Value) -> Root {
    let (s, remember, hooks) = {
        let _g = lock();
        match ENGINE.as_mut() {
            Some(e) => {
                let young = e.classify_young(v);
                let (s, remember) = e.take_slot(young);
                (s, remember, *e.hooks())
            }
            None => {
                complain_once();
                return ptr::null_mut();
            }
        }
    };
    if s.is_null() {
        return ptr::null_mut();
    }
    // payload write and remembered-set add run outside the lock; the
    // remembered set is the host's own per-domain structure
    *s = v;
    if remember {
        if let Some(f) = hooks.remember {
            f(s);
        }
    }
    s
}

/// Read the rooted value through the handle.
#[inline(always)]
pub unsafe fn get(r: Root) -> Value {
    debug_assert!(!r.is_null(), "get on a null root");
    *r
}

/// Pointer to the cell holding the value; valid until the next modify or
/// delete on this root.
#[inline(always)]
pub unsafe fn get_ref(r: Root) -> *mut Value {
    debug_assert!(!r.is_null(), "get_ref on a null root");
    r
}

/// Release a root. The handle value is invalid afterwards.
#[inline(always)]
pub unsafe fn delete(r: Root) {
    debug_assert!(!r.is_null(), "delete on a null root");
    let _g = lock();
    if let Some(e) = ENGINE.as_mut() {
        e.release_root(r);
    }
}

/// Replace the rooted value. Never fails; the handle variable may be
/// rewritten by engines that relocate cells.
#[cfg(not(any(feature = "chunk_engine", feature = "list_engine")))]
#[inline(always)]
pub unsafe fn modify(r: *mut Root, v: Value) {
    debug_assert!(!(*r).is_null(), "modify on a null root");
    // the pool engine touches no ring structure here, so no lock
    if let Some(e) = ENGINE.as_mut() {
        e.modify_root(&mut *r, v);
    }
}

#[cfg(any(feature = "chunk_engine", feature = "list_engine"))]
#[inline(always)]
pub unsafe fn modify(r: *mut Root, v: Value) {
    debug_assert!(!(*r).is_null(), "modify on a null root");
    let _g = lock();
    if let Some(e) = ENGINE.as_mut() {
        e.modify_root(&mut *r, v);
    }
}

// The callback handed to the host's registration hook; one invocation per
// collection, at a safepoint, with no mutator running managed code.
pub extern "C" fn scan_hook(action: ScanAction, only_young: c_int, data: *mut c_void) {
    let _g = lock();
    let e = unsafe {
        match ENGINE.as_mut() {
            Some(e) => e,
            None => return,
        }
    };
    let minor = match e.hooks().in_minor {
        Some(f) => {
            let m = f() != 0;
            debug_assert_eq!(m, only_young != 0, "host disagrees with the only_young flag");
            m
        }
        None => only_young != 0,
    };
    if cfg!(feature = "memfence") {
        unsafe {
            e.validate();
        }
    }
    let t0 = hrtime();
    unsafe {
        e.scan(action, minor, data);
    }
    let dt = hrtime() - t0;
    e.stats_mut().note_scan(minor, dt);
    if cfg!(feature = "memfence") {
        unsafe {
            e.validate();
        }
    }
}

pub fn print_stats() {
    let _g = lock();
    unsafe {
        if let Some(e) = ENGINE.as_ref() {
            e.stats().print(ENGINE_LABEL);
        }
    }
}

pub fn stats_snapshot() -> Option<Stats> {
    let _g = lock();
    unsafe { ENGINE.as_ref().map(|e| *e.stats()) }
}

pub fn live_pools() -> usize {
    let _g = lock();
    unsafe {
        match ENGINE.as_ref() {
            Some(e) => e.live_pools(),
            None => 0,
        }
    }
}
