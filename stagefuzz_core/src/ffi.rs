//! C ABI of the plugin contract.
//!
//! A module compiled by any toolchain reaches the host through the
//! [`CoreInterface`] function table. Every entry takes the table's `ctx`
//! pointer back unmodified; the host points it at the [`PluginCore`] of the
//! callback in progress and resets it to null afterwards.
//!
//! Ownership across the boundary:
//! - values pushed by a module are stored as [`ForeignValue`]s. The host
//!   reads them through their `#[repr(C)]` layout but never frees them;
//! - popping a foreign value hands the module its pointer back;
//! - popping a host-allocated value returns the address of its `#[repr(C)]`
//!   payload. The value is parked in the plugin's [`ParkedValues`] until the
//!   module pushes that address again, which moves the value back into the
//!   store, or hands it to `store_release`. Whatever is still parked after
//!   `destroy` is dropped;
//! - `store_get_mut` and `add_stat` return borrowed addresses.

use crate::log::LogLevel;
use crate::plugin::{Plugin, PluginCore};
use crate::stats::StatType;
use crate::value::{ForeignValue, Value, ValueKind};
use std::collections::HashMap;
use std::ffi::c_void;
use std::fmt;
use std::ptr;

pub const SYMBOL_PLUGIN_NAME: &str = "__PluginName";
pub const SYMBOL_PLUGIN_INIT: &str = "__PluginInitFnPtr";
pub const SYMBOL_PLUGIN_VALIDATE: &str = "__PluginValidateFnPtr";
pub const SYMBOL_PLUGIN_DO_WORK: &str = "__PluginDoWorkFnPtr";
pub const SYMBOL_PLUGIN_DESTROY: &str = "__PluginDestroyFnPtr";

/// Status returned by every lifecycle callback. Anything but `0` is an error.
#[repr(transparent)]
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct PluginStatus(pub u32);

impl PluginStatus {
    pub const SUCCESS: PluginStatus = PluginStatus(0);
    pub const ERROR: PluginStatus = PluginStatus(1);

    pub fn is_success(self) -> bool {
        self == Self::SUCCESS
    }
}

pub type StorePushFn = unsafe extern "C" fn(
    ctx: *mut c_void,
    key: *const u8,
    key_len: usize,
    kind: u8,
    data: *mut c_void,
) -> PluginStatus;
pub type StorePopFn =
    unsafe extern "C" fn(ctx: *mut c_void, key: *const u8, key_len: usize) -> *mut c_void;
pub type StoreGetMutFn = unsafe extern "C" fn(
    ctx: *mut c_void,
    key: *const u8,
    key_len: usize,
    index: usize,
) -> *mut c_void;
pub type StoreLenFn = unsafe extern "C" fn(ctx: *mut c_void, key: *const u8, key_len: usize) -> usize;
pub type LogFn = unsafe extern "C" fn(ctx: *mut c_void, level: u32, msg: *const u8, msg_len: usize);
pub type AddStatFn = unsafe extern "C" fn(
    ctx: *mut c_void,
    tag: *const u8,
    tag_len: u16,
    stat_type: u8,
    size_required: u16,
) -> *mut c_void;
pub type StoreDeclareFn =
    unsafe extern "C" fn(ctx: *mut c_void, key: *const u8, key_len: usize, kind: u8) -> PluginStatus;
pub type StoreReleaseFn = unsafe extern "C" fn(ctx: *mut c_void, data: *mut c_void) -> PluginStatus;

pub type PluginInitFn = unsafe extern "C" fn(core: *mut CoreInterface) -> PluginStatus;
pub type PluginCallbackFn =
    unsafe extern "C" fn(core: *mut CoreInterface, priv_data: *mut c_void) -> PluginStatus;

/// Function table handed to a module on every callback.
///
/// `priv_data` belongs to the module: it may set it in `init` and gets it
/// back as the second argument of every later callback. `store_declare` and
/// `store_release` sit after `ctx` so the leading fields keep their
/// historical layout.
#[repr(C)]
pub struct CoreInterface {
    pub priv_data: *mut c_void,
    pub store_push_back: StorePushFn,
    pub store_push_front: StorePushFn,
    pub store_pop_back: StorePopFn,
    pub store_pop_front: StorePopFn,
    pub store_get_mut: StoreGetMutFn,
    pub store_len: StoreLenFn,
    pub log: LogFn,
    pub add_stat: AddStatFn,
    pub ctx: *mut c_void,
    pub store_declare: StoreDeclareFn,
    pub store_release: StoreReleaseFn,
}

impl Default for CoreInterface {
    fn default() -> Self {
        Self::new()
    }
}

impl CoreInterface {
    pub fn new() -> Self {
        Self {
            priv_data: ptr::null_mut(),
            store_push_back,
            store_push_front,
            store_pop_back,
            store_pop_front,
            store_get_mut,
            store_len,
            log: log_message,
            add_stat,
            ctx: ptr::null_mut(),
            store_declare,
            store_release,
        }
    }

    /// Points `ctx` at `core` and `parked` while `f` runs.
    pub fn with_core<R>(
        &mut self,
        core: &mut PluginCore<'_>,
        parked: &mut ParkedValues,
        f: impl FnOnce(&mut CoreInterface) -> R,
    ) -> R {
        let mut call = CallContext { core, parked };
        self.ctx = (&mut call as *mut CallContext<'_, '_>).cast();
        let result = f(self);
        self.ctx = ptr::null_mut();
        result
    }
}

/// Host values a module popped and has not given back yet, keyed by the
/// payload address it was handed.
#[derive(Default)]
pub struct ParkedValues {
    // Boxed so a payload keeps its address while the map rehashes.
    values: HashMap<usize, Box<Value>>,
}

impl ParkedValues {
    pub fn new() -> Self {
        Self::default()
    }

    fn park(&mut self, mut boxed: Box<Value>) -> *mut c_void {
        let payload = boxed.payload_ptr();
        self.values.insert(payload as usize, boxed);
        payload
    }

    fn take(&mut self, payload: *mut c_void) -> Option<Box<Value>> {
        self.values.remove(&(payload as usize))
    }

    pub fn contains(&self, payload: *const c_void) -> bool {
        self.values.contains_key(&(payload as usize))
    }

    pub fn len(&self) -> usize {
        self.values.len()
    }

    pub fn is_empty(&self) -> bool {
        self.values.is_empty()
    }

    /// Drops every parked value, returning how many there were.
    pub fn clear(&mut self) -> usize {
        let count = self.values.len();
        self.values.clear();
        count
    }
}

struct CallContext<'c, 'a> {
    core: &'c mut PluginCore<'a>,
    parked: &'c mut ParkedValues,
}

/// Recovers the call context behind a table's `ctx` pointer.
///
/// # Safety
/// `ctx` must be null or the pointer installed by [`CoreInterface::with_core`]
/// for a call that is still running.
unsafe fn call_context<'x>(ctx: *mut c_void) -> Option<&'x mut CallContext<'static, 'static>> {
    // SAFETY: guaranteed by the caller; the lifetimes are only erased.
    unsafe { ctx.cast::<CallContext<'static, 'static>>().as_mut() }
}

/// # Safety
/// `data` must be null with `len == 0`, or valid for `len` bytes.
unsafe fn byte_slice<'x>(data: *const u8, len: usize) -> Option<&'x [u8]> {
    if len == 0 {
        return Some(&[]);
    }
    if data.is_null() {
        return None;
    }
    // SAFETY: guaranteed by the caller.
    Some(unsafe { std::slice::from_raw_parts(data, len) })
}

#[derive(Clone, Copy)]
enum End {
    Front,
    Back,
}

unsafe fn push(
    ctx: *mut c_void,
    key: *const u8,
    key_len: usize,
    kind: u8,
    data: *mut c_void,
    end: End,
) -> PluginStatus {
    // SAFETY: the module passes back the table's own pointers.
    let (Some(call), Some(key)) = (unsafe { call_context(ctx) }, unsafe { byte_slice(key, key_len) })
    else {
        return PluginStatus::ERROR;
    };
    let Some(kind) = ValueKind::from_code(kind) else {
        call.core
            .log(LogLevel::Error, format!("Push with unknown value kind {kind}"));
        return PluginStatus::ERROR;
    };
    let value = match call.parked.take(data) {
        Some(native) => {
            // A host value coming back. It keeps its own kind, so a push that
            // would mislabel it or that the key rejects leaves it parked.
            let expected = call.core.store().expected_kind(key);
            if native.kind() != kind || expected.is_some_and(|expected| expected != kind) {
                call.core.log(
                    LogLevel::Error,
                    format!(
                        "Returned {:?} value cannot be pushed as {:?} to '{}'",
                        native.kind(),
                        kind,
                        crate::store::display_key(key)
                    ),
                );
                call.parked.park(native);
                return PluginStatus::ERROR;
            }
            *native
        }
        // SAFETY: the layout contract is accepted in `ForeignPlugin::new`.
        None => Value::Foreign(unsafe { ForeignValue::new(kind, data) }),
    };
    let result = match end {
        End::Front => call.core.push_front(key, value),
        End::Back => call.core.push_back(key, value),
    };
    match result {
        Ok(()) => PluginStatus::SUCCESS,
        Err(e) => {
            call.core.log(LogLevel::Error, e.to_string());
            PluginStatus::ERROR
        }
    }
}

unsafe fn pop(ctx: *mut c_void, key: *const u8, key_len: usize, end: End) -> *mut c_void {
    // SAFETY: the module passes back the table's own pointers.
    let (Some(call), Some(key)) = (unsafe { call_context(ctx) }, unsafe { byte_slice(key, key_len) })
    else {
        return ptr::null_mut();
    };
    let value = match end {
        End::Front => call.core.pop_front(key),
        End::Back => call.core.pop_back(key),
    };
    match value {
        None => ptr::null_mut(),
        Some(Value::Foreign(foreign)) => foreign.ptr(),
        Some(native) => call.parked.park(Box::new(native)),
    }
}

unsafe extern "C" fn store_release(ctx: *mut c_void, data: *mut c_void) -> PluginStatus {
    // SAFETY: the module passes back the table's own pointer.
    let Some(call) = (unsafe { call_context(ctx) }) else {
        return PluginStatus::ERROR;
    };
    match call.parked.take(data) {
        Some(_) => PluginStatus::SUCCESS,
        None => {
            call.core.log(
                LogLevel::Error,
                format!("Release of {data:p}, which was not popped from the host"),
            );
            PluginStatus::ERROR
        }
    }
}

unsafe extern "C" fn store_push_back(
    ctx: *mut c_void,
    key: *const u8,
    key_len: usize,
    kind: u8,
    data: *mut c_void,
) -> PluginStatus {
    unsafe { push(ctx, key, key_len, kind, data, End::Back) }
}

unsafe extern "C" fn store_push_front(
    ctx: *mut c_void,
    key: *const u8,
    key_len: usize,
    kind: u8,
    data: *mut c_void,
) -> PluginStatus {
    unsafe { push(ctx, key, key_len, kind, data, End::Front) }
}

unsafe extern "C" fn store_pop_back(ctx: *mut c_void, key: *const u8, key_len: usize) -> *mut c_void {
    unsafe { pop(ctx, key, key_len, End::Back) }
}

unsafe extern "C" fn store_pop_front(
    ctx: *mut c_void,
    key: *const u8,
    key_len: usize,
) -> *mut c_void {
    unsafe { pop(ctx, key, key_len, End::Front) }
}

unsafe extern "C" fn store_get_mut(
    ctx: *mut c_void,
    key: *const u8,
    key_len: usize,
    index: usize,
) -> *mut c_void {
    // SAFETY: the module passes back the table's own pointers.
    let (Some(call), Some(key)) = (unsafe { call_context(ctx) }, unsafe { byte_slice(key, key_len) })
    else {
        return ptr::null_mut();
    };
    call.core
        .get_mut(key, index)
        .map_or(ptr::null_mut(), Value::payload_ptr)
}

unsafe extern "C" fn store_len(ctx: *mut c_void, key: *const u8, key_len: usize) -> usize {
    // SAFETY: the module passes back the table's own pointers.
    let (Some(call), Some(key)) = (unsafe { call_context(ctx) }, unsafe { byte_slice(key, key_len) })
    else {
        return 0;
    };
    call.core.len(key)
}

unsafe extern "C" fn store_declare(
    ctx: *mut c_void,
    key: *const u8,
    key_len: usize,
    kind: u8,
) -> PluginStatus {
    // SAFETY: the module passes back the table's own pointers.
    let (Some(call), Some(key)) = (unsafe { call_context(ctx) }, unsafe { byte_slice(key, key_len) })
    else {
        return PluginStatus::ERROR;
    };
    let Some(kind) = ValueKind::from_code(kind) else {
        call.core
            .log(LogLevel::Error, format!("Declare with unknown value kind {kind}"));
        return PluginStatus::ERROR;
    };
    match call.core.declare(key, kind) {
        Ok(()) => PluginStatus::SUCCESS,
        Err(e) => {
            call.core.log(LogLevel::Error, e.to_string());
            PluginStatus::ERROR
        }
    }
}

unsafe extern "C" fn log_message(ctx: *mut c_void, level: u32, msg: *const u8, msg_len: usize) {
    // SAFETY: the module passes back the table's own pointers.
    let (Some(call), Some(msg)) = (unsafe { call_context(ctx) }, unsafe { byte_slice(msg, msg_len) })
    else {
        return;
    };
    // Unknown levels are treated as the most verbose one.
    let level = LogLevel::try_from(level).unwrap_or(LogLevel::Trace);
    call.core.log(level, msg);
}

unsafe extern "C" fn add_stat(
    ctx: *mut c_void,
    tag: *const u8,
    tag_len: u16,
    stat_type: u8,
    size_required: u16,
) -> *mut c_void {
    // SAFETY: the module passes back the table's own pointers.
    let (Some(call), Some(tag)) = (unsafe { call_context(ctx) }, unsafe {
        byte_slice(tag, tag_len as usize)
    }) else {
        return ptr::null_mut();
    };
    let Some(stat_type) = StatType::from_code(stat_type) else {
        call.core
            .log(LogLevel::Error, format!("Unknown stat type {stat_type}"));
        return ptr::null_mut();
    };
    match call.core.add_stat(tag, stat_type, size_required) {
        Ok(handle) => call.core.stats().payload_ptr(handle).cast(),
        Err(e) => {
            call.core.log(LogLevel::Error, e.to_string());
            ptr::null_mut()
        }
    }
}

/// The four lifecycle entry points of a module.
#[derive(Clone, Copy)]
pub struct PluginCallbacks {
    pub init: PluginInitFn,
    pub validate: PluginCallbackFn,
    pub do_work: PluginCallbackFn,
    pub destroy: PluginCallbackFn,
}

#[derive(Debug, Clone, Copy)]
enum Phase {
    Init,
    Validate,
    DoWork,
    Destroy,
}

impl fmt::Display for Phase {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(match self {
            Phase::Init => "init",
            Phase::Validate => "validate",
            Phase::DoWork => "do_work",
            Phase::Destroy => "destroy",
        })
    }
}

/// A plugin implemented behind the C ABI.
pub struct ForeignPlugin {
    name: String,
    callbacks: PluginCallbacks,
    // Boxed so a module may keep the table's address between calls.
    interface: Box<CoreInterface>,
    parked: ParkedValues,
}

impl ForeignPlugin {
    /// # Safety
    /// The callbacks must follow the plugin contract:
    /// - only touch the table passed to them and only free pointers they
    ///   pushed themselves;
    /// - a pushed pointer is null or points at the `#[repr(C)]` layout of
    ///   the kind it is pushed as, and stays valid while it is stored;
    /// - a popped host value is used only until it is pushed back, released
    ///   or the plugin is destroyed.
    pub unsafe fn new(name: impl Into<String>, callbacks: PluginCallbacks) -> Self {
        Self {
            name: name.into(),
            callbacks,
            interface: Box::new(CoreInterface::new()),
            parked: ParkedValues::new(),
        }
    }

    /// Host values popped by the module and not yet pushed back or released.
    pub fn parked(&self) -> &ParkedValues {
        &self.parked
    }

    fn invoke(&mut self, core: &mut PluginCore<'_>, phase: Phase) -> Result<(), anyhow::Error> {
        let callbacks = self.callbacks;
        let status = self.interface.with_core(core, &mut self.parked, |iface| {
            let priv_data = iface.priv_data;
            // SAFETY: upheld by the contract accepted in `ForeignPlugin::new`.
            unsafe {
                match phase {
                    Phase::Init => (callbacks.init)(iface),
                    Phase::Validate => (callbacks.validate)(iface, priv_data),
                    Phase::DoWork => (callbacks.do_work)(iface, priv_data),
                    Phase::Destroy => (callbacks.destroy)(iface, priv_data),
                }
            }
        });
        if let Phase::Destroy = phase {
            let dropped = self.parked.clear();
            if dropped > 0 {
                log::debug!(
                    "Dropped {} value(s) '{}' popped and never returned",
                    dropped,
                    self.name
                );
            }
        }
        if status.is_success() {
            Ok(())
        } else {
            Err(anyhow::anyhow!(
                "Plugin '{}' returned status {} from {}",
                self.name,
                status.0,
                phase
            ))
        }
    }
}

impl Plugin for ForeignPlugin {
    fn name(&self) -> &str {
        &self.name
    }

    fn init(&mut self, core: &mut PluginCore<'_>) -> Result<(), anyhow::Error> {
        self.invoke(core, Phase::Init)
    }

    fn validate(&mut self, core: &mut PluginCore<'_>) -> Result<(), anyhow::Error> {
        self.invoke(core, Phase::Validate)
    }

    fn do_work(&mut self, core: &mut PluginCore<'_>) -> Result<(), anyhow::Error> {
        self.invoke(core, Phase::DoWork)
    }

    fn destroy(&mut self, core: &mut PluginCore<'_>) -> Result<(), anyhow::Error> {
        self.invoke(core, Phase::Destroy)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::log::MemorySink;
    use crate::stats::{StatRecorder, StatSnapshot, StatValue};
    use crate::store::Store;
    use crate::value::{CTuple, CVec};
    use std::sync::atomic::{AtomicUsize, Ordering};

    struct Harness {
        store: Store,
        stats: StatRecorder,
        sink: MemorySink,
    }

    impl Harness {
        fn new() -> Self {
            Self {
                store: Store::new(),
                stats: StatRecorder::anonymous(1024).unwrap(),
                sink: MemorySink::new(),
            }
        }

        fn call(&mut self, plugin: &mut ForeignPlugin, phase: Phase) -> Result<(), anyhow::Error> {
            let component = self.stats.add_component("c_plugin").unwrap();
            let mut core = PluginCore::new(
                "c_plugin",
                component,
                &mut self.store,
                &mut self.stats,
                &self.sink,
            );
            plugin.invoke(&mut core, phase)
        }
    }

    const KEY: &[u8] = b"tuples";

    unsafe extern "C" fn init_declares(core: *mut CoreInterface) -> PluginStatus {
        let core = unsafe { &mut *core };
        let status = unsafe {
            (core.store_declare)(core.ctx, KEY.as_ptr(), KEY.len(), ValueKind::Tuple.code())
        };
        core.priv_data = 0x1234 as *mut c_void;
        status
    }

    unsafe extern "C" fn validate_checks_priv(
        _core: *mut CoreInterface,
        priv_data: *mut c_void,
    ) -> PluginStatus {
        if priv_data as usize == 0x1234 {
            PluginStatus::SUCCESS
        } else {
            PluginStatus::ERROR
        }
    }

    unsafe extern "C" fn work_pushes_tuple(
        core: *mut CoreInterface,
        _priv_data: *mut c_void,
    ) -> PluginStatus {
        let core = unsafe { &mut *core };
        let tuple = Box::into_raw(Box::new(CTuple::new(2, 11)));
        unsafe {
            (core.store_push_back)(
                core.ctx,
                KEY.as_ptr(),
                KEY.len(),
                ValueKind::Tuple.code(),
                tuple.cast(),
            )
        }
    }

    unsafe extern "C" fn destroy_pops_and_frees(
        core: *mut CoreInterface,
        _priv_data: *mut c_void,
    ) -> PluginStatus {
        let core = unsafe { &mut *core };
        loop {
            let ptr = unsafe { (core.store_pop_front)(core.ctx, KEY.as_ptr(), KEY.len()) };
            if ptr.is_null() {
                return PluginStatus::SUCCESS;
            }
            drop(unsafe { Box::from_raw(ptr.cast::<CTuple>()) });
        }
    }

    fn tuple_plugin() -> ForeignPlugin {
        unsafe {
            ForeignPlugin::new(
                "c_plugin",
                PluginCallbacks {
                    init: init_declares,
                    validate: validate_checks_priv,
                    do_work: work_pushes_tuple,
                    destroy: destroy_pops_and_frees,
                },
            )
        }
    }

    #[test]
    fn foreign_plugin_runs_full_lifecycle() {
        let mut harness = Harness::new();
        let mut plugin = tuple_plugin();

        harness.call(&mut plugin, Phase::Init).unwrap();
        assert_eq!(harness.store.expected_kind(KEY), Some(ValueKind::Tuple));
        harness.call(&mut plugin, Phase::Validate).unwrap();

        harness.call(&mut plugin, Phase::DoWork).unwrap();
        harness.call(&mut plugin, Phase::DoWork).unwrap();
        assert_eq!(harness.store.len(KEY), 2);
        assert_eq!(
            harness.store.get(KEY, 0).map(Value::kind),
            Some(ValueKind::Tuple),
            "foreign values keep their declared kind"
        );

        harness.call(&mut plugin, Phase::Destroy).unwrap();
        assert_eq!(harness.store.len(KEY), 0);
        assert!(plugin.interface.ctx.is_null(), "ctx is reset after each call");
    }

    unsafe extern "C" fn push_wrong_kind(
        core: *mut CoreInterface,
        _priv_data: *mut c_void,
    ) -> PluginStatus {
        let core = unsafe { &mut *core };
        unsafe {
            (core.store_push_back)(
                core.ctx,
                KEY.as_ptr(),
                KEY.len(),
                ValueKind::Buffer.code(),
                ptr::null_mut(),
            )
        }
    }

    #[test]
    fn kind_mismatch_through_abi_fails_and_logs() {
        let mut harness = Harness::new();
        let mut plugin = tuple_plugin();
        plugin.callbacks.do_work = push_wrong_kind;

        harness.call(&mut plugin, Phase::Init).unwrap();
        let err = harness.call(&mut plugin, Phase::DoWork).unwrap_err();
        assert!(err.to_string().contains("do_work"), "got: {err}");
        assert_eq!(harness.store.len(KEY), 0);
        assert_eq!(harness.sink.messages(LogLevel::Error).len(), 1);
    }

    static POPPED_LEN: AtomicUsize = AtomicUsize::new(0);
    static POPPED_FIRST: AtomicUsize = AtomicUsize::new(0);

    unsafe extern "C" fn pop_host_buffer(
        core: *mut CoreInterface,
        _priv_data: *mut c_void,
    ) -> PluginStatus {
        let core = unsafe { &mut *core };
        let key = b"host_buf";
        let ptr = unsafe { (core.store_pop_front)(core.ctx, key.as_ptr(), key.len()) };
        if ptr.is_null() {
            return PluginStatus::ERROR;
        }
        let cvec = unsafe { &*ptr.cast::<CVec>() };
        POPPED_LEN.store(cvec.len(), Ordering::SeqCst);
        POPPED_FIRST.store(cvec.as_slice()[0] as usize, Ordering::SeqCst);
        let len = unsafe { (core.store_len)(core.ctx, key.as_ptr(), key.len()) };
        if len == 0 {
            PluginStatus::SUCCESS
        } else {
            PluginStatus::ERROR
        }
    }

    #[test]
    fn host_values_popped_by_module_are_readable_during_call() {
        let mut harness = Harness::new();
        harness
            .store
            .push_back("host_buf", Value::buffer(b"abc".to_vec()))
            .unwrap();
        let mut plugin = tuple_plugin();
        plugin.callbacks.do_work = pop_host_buffer;

        harness.call(&mut plugin, Phase::DoWork).unwrap();
        assert_eq!(POPPED_LEN.load(Ordering::SeqCst), 3);
        assert_eq!(POPPED_FIRST.load(Ordering::SeqCst), b'a' as usize);
        assert_eq!(harness.store.len("host_buf"), 0);
        assert_eq!(plugin.parked().len(), 1, "popped value outlives the call");

        harness.call(&mut plugin, Phase::Destroy).unwrap();
        assert!(plugin.parked().is_empty());
    }

    const INPUT: &[u8] = b"input_bytes";
    const FORWARD: &[u8] = b"fwd";

    unsafe extern "C" fn pop_and_keep(
        core: *mut CoreInterface,
        _priv_data: *mut c_void,
    ) -> PluginStatus {
        let core = unsafe { &mut *core };
        let ptr = unsafe { (core.store_pop_front)(core.ctx, INPUT.as_ptr(), INPUT.len()) };
        if ptr.is_null() {
            return PluginStatus::ERROR;
        }
        core.priv_data = ptr;
        PluginStatus::SUCCESS
    }

    unsafe extern "C" fn push_kept(core: *mut CoreInterface, priv_data: *mut c_void) -> PluginStatus {
        let core = unsafe { &mut *core };
        unsafe {
            (core.store_push_back)(
                core.ctx,
                FORWARD.as_ptr(),
                FORWARD.len(),
                ValueKind::Buffer.code(),
                priv_data,
            )
        }
    }

    unsafe extern "C" fn push_kept_as_tuple(
        core: *mut CoreInterface,
        priv_data: *mut c_void,
    ) -> PluginStatus {
        let core = unsafe { &mut *core };
        unsafe {
            (core.store_push_back)(
                core.ctx,
                FORWARD.as_ptr(),
                FORWARD.len(),
                ValueKind::Tuple.code(),
                priv_data,
            )
        }
    }

    unsafe extern "C" fn release_kept(
        core: *mut CoreInterface,
        priv_data: *mut c_void,
    ) -> PluginStatus {
        let core = unsafe { &mut *core };
        unsafe { (core.store_release)(core.ctx, priv_data) }
    }

    fn harness_with_input() -> Harness {
        let mut harness = Harness::new();
        harness
            .store
            .push_back(INPUT, Value::buffer(b"payload".to_vec()))
            .unwrap();
        harness
    }

    #[test]
    fn popped_host_value_pushed_back_in_later_call_returns_to_store() {
        let mut harness = harness_with_input();
        let mut plugin = tuple_plugin();

        plugin.callbacks.do_work = pop_and_keep;
        harness.call(&mut plugin, Phase::DoWork).unwrap();
        let kept = plugin.interface.priv_data;
        assert!(plugin.parked().contains(kept));

        plugin.callbacks.do_work = push_kept;
        harness.call(&mut plugin, Phase::DoWork).unwrap();
        assert!(plugin.parked().is_empty());

        let forwarded = harness.store.get(FORWARD, 0).unwrap();
        assert!(
            matches!(forwarded, Value::Buffer(_)),
            "the host value moved back instead of being wrapped: {forwarded:?}"
        );
        assert_eq!(forwarded.as_bytes(), Some(&b"payload"[..]));
    }

    #[test]
    fn mislabelled_push_of_popped_value_keeps_it_parked() {
        let mut harness = harness_with_input();
        let mut plugin = tuple_plugin();

        plugin.callbacks.do_work = pop_and_keep;
        harness.call(&mut plugin, Phase::DoWork).unwrap();
        let kept = plugin.interface.priv_data;

        plugin.callbacks.do_work = push_kept_as_tuple;
        assert!(harness.call(&mut plugin, Phase::DoWork).is_err());
        assert_eq!(harness.store.len(FORWARD), 0);
        assert!(plugin.parked().contains(kept));
        assert_eq!(harness.sink.messages(LogLevel::Error).len(), 1);

        // Still readable after the failed push.
        let cvec = unsafe { &*kept.cast::<CVec>() };
        assert_eq!(cvec.as_slice(), b"payload");
    }

    #[test]
    fn release_drops_popped_value_once() {
        let mut harness = harness_with_input();
        let mut plugin = tuple_plugin();

        plugin.callbacks.do_work = pop_and_keep;
        harness.call(&mut plugin, Phase::DoWork).unwrap();

        plugin.callbacks.do_work = release_kept;
        harness.call(&mut plugin, Phase::DoWork).unwrap();
        assert!(plugin.parked().is_empty());

        let err = harness.call(&mut plugin, Phase::DoWork).unwrap_err();
        assert!(err.to_string().contains("do_work"), "got: {err}");
        assert_eq!(harness.sink.messages(LogLevel::Error).len(), 1);
    }

    unsafe extern "C" fn stat_and_log(
        core: *mut CoreInterface,
        _priv_data: *mut c_void,
    ) -> PluginStatus {
        let core = unsafe { &mut *core };
        let tag = b"total_crashes";
        let payload = unsafe {
            (core.add_stat)(core.ctx, tag.as_ptr(), tag.len() as u16, StatType::Number as u8, 8)
        };
        if payload.is_null() {
            return PluginStatus::ERROR;
        }
        unsafe { payload.cast::<u8>().copy_from_nonoverlapping(9u64.to_le_bytes().as_ptr(), 8) };
        let msg = b"counted";
        unsafe { (core.log)(core.ctx, LogLevel::Info as u32, msg.as_ptr(), msg.len()) };
        unsafe { (core.log)(core.ctx, 99, ptr::null(), 0) };
        PluginStatus::SUCCESS
    }

    #[test]
    fn stats_and_logs_through_abi() {
        let mut harness = Harness::new();
        let mut plugin = tuple_plugin();
        plugin.callbacks.do_work = stat_and_log;

        harness.call(&mut plugin, Phase::DoWork).unwrap();
        let snapshot = StatSnapshot::parse(harness.stats.as_bytes()).unwrap();
        assert_eq!(
            snapshot.get("c_plugin", "total_crashes"),
            Some(&StatValue::Number(9))
        );
        assert_eq!(harness.sink.messages(LogLevel::Info), vec!["counted".to_string()]);
        assert_eq!(harness.sink.messages(LogLevel::Trace), vec![String::new()]);
    }

    #[test]
    fn trampolines_tolerate_null_context() {
        let iface = CoreInterface::new();
        let key = b"k";
        unsafe {
            assert_eq!((iface.store_len)(ptr::null_mut(), key.as_ptr(), 1), 0);
            assert!((iface.store_pop_back)(ptr::null_mut(), key.as_ptr(), 1).is_null());
            assert!((iface.store_get_mut)(ptr::null_mut(), key.as_ptr(), 1, 0).is_null());
            assert_eq!(
                (iface.store_push_back)(ptr::null_mut(), key.as_ptr(), 1, 0, ptr::null_mut()),
                PluginStatus::ERROR
            );
            assert_eq!(
                (iface.store_release)(ptr::null_mut(), ptr::null_mut()),
                PluginStatus::ERROR
            );
        }
    }
}
