// C entry points. The host links the static archive and calls these; each
// one is a thin wrapper over the engine fast paths so it inlines away in
// LTO builds.

use libc::c_int;
use libc::c_void;

use crate::engine;
use crate::runtime::{HostHooks, Root, ScanAction, Value};
use crate::stats::Stats;

#[no_mangle]
pub unsafe extern "C" fn triton_setup(hooks: *const HostHooks) -> c_int {
    let h = if hooks.is_null() {
        HostHooks::none()
    } else {
        *hooks
    };
    engine::setup(h) as c_int
}

#[no_mangle]
pub extern "C" fn triton_teardown() {
    engine::teardown();
}

#[no_mangle]
pub unsafe extern "C" fn triton_create(v: Value) -> Root {
    engine::create(v)
}

#[no_mangle]
pub unsafe extern "C" fn triton_get(r: Root) -> Value {
    engine::get(r)
}

#[no_mangle]
pub unsafe extern "C" fn triton_get_ref(r: Root) -> *mut Value {
    engine::get_ref(r)
}

#[no_mangle]
pub unsafe extern "C" fn triton_delete(r: Root) {
    engine::delete(r)
}

#[no_mangle]
pub unsafe extern "C" fn triton_modify(r: *mut Root, v: Value) {
    engine::modify(r, v)
}

#[no_mangle]
pub extern "C" fn triton_print_stats() {
    engine::print_stats();
}

// Exported directly so hosts without a registration hook can drive the
// scan themselves.
#[no_mangle]
pub extern "C" fn triton_scan(action: ScanAction, only_young: c_int, data: *mut c_void) {
    engine::scan_hook(action, only_young, data);
}

#[no_mangle]
pub extern "C" fn triton_live_pools() -> usize {
    engine::live_pools()
}

#[no_mangle]
pub extern "C" fn triton_stats() -> Stats {
    match engine::stats_snapshot() {
        Some(s) => s,
        None => Stats::new(),
    }
}
