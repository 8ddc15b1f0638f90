//! Stage module loaded by the host's dynamic loading tests.
//!
//! It only speaks the C ABI and does not link the host crate. Every
//! iteration it:
//! - pops the host's `input_bytes` buffer and pushes the same pointer back
//!   under `cur_input_chunks`;
//! - replaces its own `{iteration, input length}` tuple under
//!   `fixture_seen`;
//! - bumps `total_fixture_calls` and logs one line.
#![allow(non_upper_case_globals)]

use std::ffi::{c_char, c_void};

#[repr(transparent)]
#[derive(Clone, Copy, PartialEq, Eq)]
pub struct PluginStatus(u32);

const SUCCESS: PluginStatus = PluginStatus(0);
const ERROR: PluginStatus = PluginStatus(1);

const KIND_BUFFER: u8 = 0;
const KIND_TUPLE: u8 = 3;
const LOG_INFO: u32 = 2;
const STAT_NUMBER: u8 = 3;

const INPUT_BYTES: &[u8] = b"input_bytes";
const CUR_INPUT_CHUNKS: &[u8] = b"cur_input_chunks";
const SEEN: &[u8] = b"fixture_seen";
const CALLS: &[u8] = b"total_fixture_calls";

type StorePushFn =
    unsafe extern "C" fn(*mut c_void, *const u8, usize, u8, *mut c_void) -> PluginStatus;
type StorePopFn = unsafe extern "C" fn(*mut c_void, *const u8, usize) -> *mut c_void;
type StoreGetMutFn = unsafe extern "C" fn(*mut c_void, *const u8, usize, usize) -> *mut c_void;
type StoreLenFn = unsafe extern "C" fn(*mut c_void, *const u8, usize) -> usize;
type LogFn = unsafe extern "C" fn(*mut c_void, u32, *const u8, usize);
type AddStatFn = unsafe extern "C" fn(*mut c_void, *const u8, u16, u8, u16) -> *mut c_void;
type StoreDeclareFn = unsafe extern "C" fn(*mut c_void, *const u8, usize, u8) -> PluginStatus;
type StoreReleaseFn = unsafe extern "C" fn(*mut c_void, *mut c_void) -> PluginStatus;

#[repr(C)]
#[allow(dead_code)]
pub struct CoreInterface {
    priv_data: *mut c_void,
    store_push_back: StorePushFn,
    store_push_front: StorePushFn,
    store_pop_back: StorePopFn,
    store_pop_front: StorePopFn,
    store_get_mut: StoreGetMutFn,
    store_len: StoreLenFn,
    log: LogFn,
    add_stat: AddStatFn,
    ctx: *mut c_void,
    store_declare: StoreDeclareFn,
    store_release: StoreReleaseFn,
}

/// Host `Buffer` layout; only the length is read here.
#[repr(C)]
#[allow(dead_code)]
struct CVec {
    length: usize,
    capacity: usize,
    data: *mut u8,
}

#[repr(C)]
struct CTuple {
    first: usize,
    second: usize,
}

struct State {
    iterations: usize,
    calls: *mut u64,
}

#[repr(transparent)]
pub struct NamePtr(*const c_char);

// SAFETY: points at an immutable string literal.
unsafe impl Sync for NamePtr {}

type InitFn = unsafe extern "C" fn(*mut CoreInterface) -> PluginStatus;
type CallbackFn = unsafe extern "C" fn(*mut CoreInterface, *mut c_void) -> PluginStatus;

#[unsafe(no_mangle)]
pub static __PluginName: NamePtr = NamePtr(c"stagefuzz_test_plugin".as_ptr());
#[unsafe(no_mangle)]
pub static __PluginInitFnPtr: Option<InitFn> = Some(init);
#[unsafe(no_mangle)]
pub static __PluginValidateFnPtr: Option<CallbackFn> = Some(validate);
#[unsafe(no_mangle)]
pub static __PluginDoWorkFnPtr: Option<CallbackFn> = Some(do_work);
#[unsafe(no_mangle)]
pub static __PluginDestroyFnPtr: Option<CallbackFn> = Some(destroy);

unsafe fn log(core: &CoreInterface, msg: &str) {
    unsafe { (core.log)(core.ctx, LOG_INFO, msg.as_ptr(), msg.len()) };
}

unsafe extern "C" fn init(core: *mut CoreInterface) -> PluginStatus {
    let Some(core) = (unsafe { core.as_mut() }) else {
        return ERROR;
    };
    if unsafe { (core.store_declare)(core.ctx, SEEN.as_ptr(), SEEN.len(), KIND_TUPLE) } != SUCCESS
    {
        return ERROR;
    }
    let calls =
        unsafe { (core.add_stat)(core.ctx, CALLS.as_ptr(), CALLS.len() as u16, STAT_NUMBER, 8) };
    if calls.is_null() {
        return ERROR;
    }
    let state = Box::new(State {
        iterations: 0,
        calls: calls.cast(),
    });
    core.priv_data = Box::into_raw(state).cast();
    SUCCESS
}

unsafe extern "C" fn validate(core: *mut CoreInterface, priv_data: *mut c_void) -> PluginStatus {
    if core.is_null() || priv_data.is_null() {
        return ERROR;
    }
    SUCCESS
}

unsafe extern "C" fn do_work(core: *mut CoreInterface, priv_data: *mut c_void) -> PluginStatus {
    let (Some(core), Some(state)) = (unsafe { core.as_mut() }, unsafe {
        priv_data.cast::<State>().as_mut()
    }) else {
        return ERROR;
    };
    state.iterations += 1;

    let input =
        unsafe { (core.store_pop_front)(core.ctx, INPUT_BYTES.as_ptr(), INPUT_BYTES.len()) };
    if input.is_null() {
        return ERROR;
    }
    let length = unsafe { (*input.cast::<CVec>()).length };
    let pushed = unsafe {
        (core.store_push_back)(
            core.ctx,
            CUR_INPUT_CHUNKS.as_ptr(),
            CUR_INPUT_CHUNKS.len(),
            KIND_BUFFER,
            input,
        )
    };
    if pushed != SUCCESS {
        return ERROR;
    }

    free_seen(core);
    let seen = Box::into_raw(Box::new(CTuple {
        first: state.iterations,
        second: length,
    }));
    let pushed = unsafe {
        (core.store_push_back)(core.ctx, SEEN.as_ptr(), SEEN.len(), KIND_TUPLE, seen.cast())
    };
    if pushed != SUCCESS {
        drop(unsafe { Box::from_raw(seen) });
        return ERROR;
    }

    unsafe {
        *state.calls += 1;
        log(core, "fixture iteration done");
    }
    SUCCESS
}

/// Pops and frees every tuple this module pushed under `fixture_seen`.
fn free_seen(core: &CoreInterface) {
    loop {
        let seen = unsafe { (core.store_pop_front)(core.ctx, SEEN.as_ptr(), SEEN.len()) };
        if seen.is_null() {
            return;
        }
        drop(unsafe { Box::from_raw(seen.cast::<CTuple>()) });
    }
}

unsafe extern "C" fn destroy(core: *mut CoreInterface, priv_data: *mut c_void) -> PluginStatus {
    let Some(core) = (unsafe { core.as_mut() }) else {
        return ERROR;
    };
    free_seen(core);
    if !priv_data.is_null() {
        drop(unsafe { Box::from_raw(priv_data.cast::<State>()) });
        core.priv_data = std::ptr::null_mut();
    }
    SUCCESS
}
