use serde::{Deserialize, Serialize};
use std::ffi::c_void;
use std::fmt;
use std::mem::ManuallyDrop;
use std::ptr;

use crate::keys::{EXIT_STATUS_CRASH, EXIT_STATUS_NORMAL, EXIT_STATUS_TIMEOUT};

/// Discriminant carried by every value placed in the store.
///
/// The numeric codes are part of the plugin ABI: a module pushing through the
/// C function table passes one of these bytes alongside its pointer.
#[derive(Serialize, Deserialize, Debug, Clone, Copy, PartialEq, Eq, Hash)]
#[serde(rename_all = "kebab-case")]
#[repr(u8)]
pub enum ValueKind {
    /// Growable byte buffer (`CVec`).
    Buffer = 0,
    /// Fixed-length byte buffer (`CBytes`).
    Bytes = 1,
    /// UTF-8 string (`CUtf8`).
    Str = 2,
    /// Two word-sized fields (`CTuple`).
    Tuple = 3,
    /// One-byte boolean.
    Flag = 4,
    /// Plugin-private structure the host knows nothing about.
    Opaque = 5,
}

impl ValueKind {
    pub fn from_code(code: u8) -> Option<Self> {
        match code {
            0 => Some(ValueKind::Buffer),
            1 => Some(ValueKind::Bytes),
            2 => Some(ValueKind::Str),
            3 => Some(ValueKind::Tuple),
            4 => Some(ValueKind::Flag),
            5 => Some(ValueKind::Opaque),
            _ => None,
        }
    }

    pub fn code(self) -> u8 {
        self as u8
    }
}

impl fmt::Display for ValueKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            ValueKind::Buffer => "buffer",
            ValueKind::Bytes => "bytes",
            ValueKind::Str => "str",
            ValueKind::Tuple => "tuple",
            ValueKind::Flag => "flag",
            ValueKind::Opaque => "opaque",
        };
        f.write_str(name)
    }
}

/// Growable byte buffer with a C-compatible layout.
///
/// Owns its allocation exactly like the `Vec<u8>` it was built from.
/// `length <= capacity` always holds and `data` is non-null whenever
/// `capacity > 0`.
#[repr(C)]
pub struct CVec {
    length: usize,
    capacity: usize,
    data: *mut u8,
}

// SAFETY: a `CVec` uniquely owns its allocation, like `Vec<u8>`.
unsafe impl Send for CVec {}
unsafe impl Sync for CVec {}

impl CVec {
    pub fn new() -> Self {
        Vec::new().into()
    }

    pub fn as_slice(&self) -> &[u8] {
        if self.length == 0 {
            return &[];
        }
        // SAFETY: `data` and `length` come from a live `Vec<u8>`.
        unsafe { std::slice::from_raw_parts(self.data, self.length) }
    }

    pub fn as_mut_slice(&mut self) -> &mut [u8] {
        if self.length == 0 {
            return &mut [];
        }
        // SAFETY: see `as_slice`, and we hold the only reference.
        unsafe { std::slice::from_raw_parts_mut(self.data, self.length) }
    }

    /// Gives temporary access to the buffer as a `Vec<u8>` so it can grow.
    pub fn with_vec<R>(&mut self, f: impl FnOnce(&mut Vec<u8>) -> R) -> R {
        let mut vec = std::mem::replace(self, CVec::new()).into_vec();
        let result = f(&mut vec);
        *self = vec.into();
        result
    }

    pub fn into_vec(self) -> Vec<u8> {
        let this = ManuallyDrop::new(self);
        // SAFETY: the parts were taken from a `Vec<u8>` in `From<Vec<u8>>`.
        unsafe { Vec::from_raw_parts(this.data, this.length, this.capacity) }
    }

    pub fn len(&self) -> usize {
        self.length
    }

    pub fn is_empty(&self) -> bool {
        self.length == 0
    }

    pub fn capacity(&self) -> usize {
        self.capacity
    }

    pub fn as_ptr(&self) -> *const u8 {
        self.data
    }
}

impl Default for CVec {
    fn default() -> Self {
        Self::new()
    }
}

impl From<Vec<u8>> for CVec {
    fn from(vec: Vec<u8>) -> Self {
        let mut vec = ManuallyDrop::new(vec);
        CVec {
            length: vec.len(),
            capacity: vec.capacity(),
            data: vec.as_mut_ptr(),
        }
    }
}

impl Drop for CVec {
    fn drop(&mut self) {
        // SAFETY: same provenance argument as `into_vec`.
        unsafe { drop(Vec::from_raw_parts(self.data, self.length, self.capacity)) }
    }
}

impl fmt::Debug for CVec {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("CVec")
            .field("length", &self.length)
            .field("capacity", &self.capacity)
            .finish()
    }
}

/// Fixed-length byte buffer with a C-compatible layout.
#[repr(C)]
pub struct CBytes {
    length: usize,
    data: *mut u8,
}

unsafe impl Send for CBytes {}
unsafe impl Sync for CBytes {}

impl CBytes {
    pub fn as_slice(&self) -> &[u8] {
        if self.length == 0 {
            return &[];
        }
        // SAFETY: `data` and `length` come from a leaked `Box<[u8]>`.
        unsafe { std::slice::from_raw_parts(self.data, self.length) }
    }

    pub fn as_mut_slice(&mut self) -> &mut [u8] {
        if self.length == 0 {
            return &mut [];
        }
        // SAFETY: see `as_slice`.
        unsafe { std::slice::from_raw_parts_mut(self.data, self.length) }
    }

    pub fn into_boxed_slice(self) -> Box<[u8]> {
        let this = ManuallyDrop::new(self);
        // SAFETY: reverses `From<Box<[u8]>>`.
        unsafe { Box::from_raw(ptr::slice_from_raw_parts_mut(this.data, this.length)) }
    }

    pub fn len(&self) -> usize {
        self.length
    }

    pub fn is_empty(&self) -> bool {
        self.length == 0
    }
}

impl From<Box<[u8]>> for CBytes {
    fn from(bytes: Box<[u8]>) -> Self {
        let length = bytes.len();
        let data = Box::into_raw(bytes).cast::<u8>();
        CBytes { length, data }
    }
}

impl From<&[u8]> for CBytes {
    fn from(bytes: &[u8]) -> Self {
        Box::<[u8]>::from(bytes).into()
    }
}

impl Drop for CBytes {
    fn drop(&mut self) {
        // SAFETY: reverses `From<Box<[u8]>>`.
        unsafe {
            drop(Box::from_raw(ptr::slice_from_raw_parts_mut(
                self.data,
                self.length,
            )))
        }
    }
}

impl fmt::Debug for CBytes {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("CBytes")
            .field("length", &self.length)
            .finish()
    }
}

/// UTF-8 string with a C-compatible `{length, data}` layout.
#[repr(transparent)]
pub struct CUtf8(CBytes);

impl CUtf8 {
    /// Returns `None` if a foreign writer broke the UTF-8 contents.
    pub fn as_str(&self) -> Option<&str> {
        std::str::from_utf8(self.0.as_slice()).ok()
    }

    pub fn as_bytes(&self) -> &[u8] {
        self.0.as_slice()
    }

    pub fn len(&self) -> usize {
        self.0.len()
    }

    pub fn is_empty(&self) -> bool {
        self.0.is_empty()
    }
}

impl From<String> for CUtf8 {
    fn from(s: String) -> Self {
        CUtf8(s.into_boxed_str().into_boxed_bytes().into())
    }
}

impl From<&str> for CUtf8 {
    fn from(s: &str) -> Self {
        CUtf8(s.as_bytes().into())
    }
}

impl fmt::Debug for CUtf8 {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "CUtf8({:?})", String::from_utf8_lossy(self.as_bytes()))
    }
}

/// Two word-sized fields, usually a discriminant plus its payload.
#[repr(C)]
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct CTuple {
    pub first: usize,
    pub second: usize,
}

impl CTuple {
    pub fn new(first: usize, second: usize) -> Self {
        Self { first, second }
    }
}

/// A value pushed through the C function table.
///
/// The pointer belongs to the module that pushed it and is never freed by
/// the host. For the `Buffer`, `Bytes`, `Str`, `Tuple` and `Flag` kinds the
/// host reads it through the matching `#[repr(C)]` layout; `Opaque` values
/// are only moved around.
#[derive(Debug)]
pub struct ForeignValue {
    kind: ValueKind,
    ptr: *mut c_void,
}

// SAFETY: the payload is only accessed from the single driver thread.
unsafe impl Send for ForeignValue {}
unsafe impl Sync for ForeignValue {}

impl ForeignValue {
    /// # Safety
    /// `ptr` must be null or point at a live payload laid out as `kind`
    /// describes (`CVec`, `CBytes`, `CUtf8`, `CTuple` or a one-byte flag)
    /// for as long as this value exists. `Opaque` pointers are never read.
    pub unsafe fn new(kind: ValueKind, ptr: *mut c_void) -> Self {
        Self { kind, ptr }
    }

    pub fn kind(&self) -> ValueKind {
        self.kind
    }

    pub fn ptr(&self) -> *mut c_void {
        self.ptr
    }

    fn payload<T>(&self, kind: ValueKind) -> Option<&T> {
        if self.kind != kind {
            return None;
        }
        // SAFETY: layout and liveness are guaranteed by `ForeignValue::new`.
        unsafe { self.ptr.cast::<T>().as_ref() }
    }

    fn payload_mut<T>(&mut self, kind: ValueKind) -> Option<&mut T> {
        if self.kind != kind {
            return None;
        }
        // SAFETY: as in `payload`, and `&mut self` makes the access unique.
        unsafe { self.ptr.cast::<T>().as_mut() }
    }

    /// Bytes of a `Buffer`, `Bytes` or `Str` payload.
    pub fn bytes(&self) -> Option<&[u8]> {
        match self.kind {
            ValueKind::Buffer => self.payload::<CVec>(ValueKind::Buffer).map(CVec::as_slice),
            ValueKind::Bytes => self.payload::<CBytes>(ValueKind::Bytes).map(CBytes::as_slice),
            ValueKind::Str => self.payload::<CUtf8>(ValueKind::Str).map(CUtf8::as_bytes),
            _ => None,
        }
    }

    pub fn bytes_mut(&mut self) -> Option<&mut [u8]> {
        match self.kind {
            ValueKind::Buffer => self
                .payload_mut::<CVec>(ValueKind::Buffer)
                .map(CVec::as_mut_slice),
            ValueKind::Bytes => self
                .payload_mut::<CBytes>(ValueKind::Bytes)
                .map(CBytes::as_mut_slice),
            _ => None,
        }
    }

    pub fn str(&self) -> Option<&str> {
        self.payload::<CUtf8>(ValueKind::Str).and_then(CUtf8::as_str)
    }

    pub fn tuple(&self) -> Option<CTuple> {
        self.payload::<CTuple>(ValueKind::Tuple).copied()
    }

    /// Any non-zero byte is `true`.
    pub fn flag(&self) -> Option<bool> {
        self.payload::<u8>(ValueKind::Flag).map(|byte| *byte != 0)
    }
}

/// Tagged value owned by the store while it sits in a slot.
#[derive(Debug)]
pub enum Value {
    Buffer(CVec),
    Bytes(CBytes),
    Str(CUtf8),
    Tuple(CTuple),
    Flag(bool),
    Foreign(ForeignValue),
}

impl Value {
    pub fn kind(&self) -> ValueKind {
        match self {
            Value::Buffer(_) => ValueKind::Buffer,
            Value::Bytes(_) => ValueKind::Bytes,
            Value::Str(_) => ValueKind::Str,
            Value::Tuple(_) => ValueKind::Tuple,
            Value::Flag(_) => ValueKind::Flag,
            Value::Foreign(foreign) => foreign.kind,
        }
    }

    pub fn buffer(data: Vec<u8>) -> Self {
        Value::Buffer(data.into())
    }

    pub fn bytes(data: &[u8]) -> Self {
        Value::Bytes(data.into())
    }

    pub fn str(s: impl Into<String>) -> Self {
        Value::Str(s.into().into())
    }

    pub fn tuple(first: usize, second: usize) -> Self {
        Value::Tuple(CTuple::new(first, second))
    }

    /// Byte view of `Buffer`, `Bytes` and `Str` values, foreign ones included.
    pub fn as_bytes(&self) -> Option<&[u8]> {
        match self {
            Value::Buffer(v) => Some(v.as_slice()),
            Value::Bytes(b) => Some(b.as_slice()),
            Value::Str(s) => Some(s.as_bytes()),
            Value::Foreign(foreign) => foreign.bytes(),
            _ => None,
        }
    }

    pub fn as_bytes_mut(&mut self) -> Option<&mut [u8]> {
        match self {
            Value::Buffer(v) => Some(v.as_mut_slice()),
            Value::Bytes(b) => Some(b.as_mut_slice()),
            Value::Foreign(foreign) => foreign.bytes_mut(),
            _ => None,
        }
    }

    pub fn as_buffer_mut(&mut self) -> Option<&mut CVec> {
        match self {
            Value::Buffer(v) => Some(v),
            _ => None,
        }
    }

    pub fn as_str(&self) -> Option<&str> {
        match self {
            Value::Str(s) => s.as_str(),
            Value::Foreign(foreign) => foreign.str(),
            _ => None,
        }
    }

    pub fn as_tuple(&self) -> Option<CTuple> {
        match self {
            Value::Tuple(t) => Some(*t),
            Value::Foreign(foreign) => foreign.tuple(),
            _ => None,
        }
    }

    pub fn as_tuple_mut(&mut self) -> Option<&mut CTuple> {
        match self {
            Value::Tuple(t) => Some(t),
            _ => None,
        }
    }

    pub fn as_flag(&self) -> Option<bool> {
        match self {
            Value::Flag(flag) => Some(*flag),
            Value::Foreign(foreign) => foreign.flag(),
            _ => None,
        }
    }

    /// Consumes a byte value into an owned vector.
    ///
    /// Foreign payloads are copied; their memory stays with the module.
    pub fn into_vec(self) -> Option<Vec<u8>> {
        match self {
            Value::Buffer(v) => Some(v.into_vec()),
            Value::Bytes(b) => Some(b.into_boxed_slice().into_vec()),
            Value::Str(s) => Some(s.0.into_boxed_slice().into_vec()),
            Value::Foreign(foreign) => foreign.bytes().map(<[u8]>::to_vec),
            _ => None,
        }
    }

    pub fn into_string(self) -> Option<String> {
        match self {
            Value::Str(s) => String::from_utf8(s.0.into_boxed_slice().into_vec()).ok(),
            Value::Foreign(foreign) => foreign.str().map(str::to_string),
            _ => None,
        }
    }

    /// Address of the `#[repr(C)]` payload as seen by C-ABI consumers.
    ///
    /// Stable for as long as the value stays boxed inside its store slot.
    /// Foreign values yield the pointer their owner pushed.
    pub fn payload_ptr(&mut self) -> *mut c_void {
        match self {
            Value::Buffer(v) => (v as *mut CVec).cast(),
            Value::Bytes(b) => (b as *mut CBytes).cast(),
            Value::Str(s) => (s as *mut CUtf8).cast(),
            Value::Tuple(t) => (t as *mut CTuple).cast(),
            Value::Flag(flag) => (flag as *mut bool).cast(),
            Value::Foreign(foreign) => foreign.ptr,
        }
    }
}

impl From<Vec<u8>> for Value {
    fn from(data: Vec<u8>) -> Self {
        Value::buffer(data)
    }
}

impl From<String> for Value {
    fn from(s: String) -> Self {
        Value::str(s)
    }
}

impl From<&str> for Value {
    fn from(s: &str) -> Self {
        Value::Str(s.into())
    }
}

impl From<CTuple> for Value {
    fn from(t: CTuple) -> Self {
        Value::Tuple(t)
    }
}

impl From<bool> for Value {
    fn from(flag: bool) -> Self {
        Value::Flag(flag)
    }
}

/// Outcome of one target execution as carried by the `exit_status` tuple.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ExitStatus {
    Normal(i32),
    Timeout,
    /// Signal number, or the exit code when the platform reports no signal.
    Crash(i32),
}

impl ExitStatus {
    pub fn is_interesting(&self) -> bool {
        !matches!(self, ExitStatus::Normal(_))
    }

    pub fn to_tuple(self) -> CTuple {
        match self {
            ExitStatus::Normal(code) => CTuple::new(EXIT_STATUS_NORMAL, code as u32 as usize),
            ExitStatus::Timeout => CTuple::new(EXIT_STATUS_TIMEOUT, 0),
            ExitStatus::Crash(signal) => CTuple::new(EXIT_STATUS_CRASH, signal as u32 as usize),
        }
    }

    pub fn from_tuple(tuple: CTuple) -> Option<Self> {
        let value = tuple.second as u32 as i32;
        match tuple.first {
            EXIT_STATUS_NORMAL => Some(ExitStatus::Normal(value)),
            EXIT_STATUS_TIMEOUT => Some(ExitStatus::Timeout),
            EXIT_STATUS_CRASH => Some(ExitStatus::Crash(value)),
            _ => None,
        }
    }
}

impl From<ExitStatus> for Value {
    fn from(status: ExitStatus) -> Self {
        Value::Tuple(status.to_tuple())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn cvec_keeps_vec_parts_and_returns_them() {
        let mut original = Vec::with_capacity(16);
        original.extend_from_slice(b"abc");
        let ptr = original.as_ptr();

        let cvec = CVec::from(original);
        assert_eq!(cvec.length, 3);
        assert_eq!(cvec.capacity, 16);
        assert_eq!(cvec.as_slice(), b"abc");

        let back = cvec.into_vec();
        assert_eq!(back.as_ptr(), ptr, "conversion must not copy the allocation");
        assert_eq!(back.capacity(), 16);
    }

    #[test]
    fn cvec_with_vec_can_grow() {
        let mut cvec = CVec::from(b"ab".to_vec());
        cvec.with_vec(|v| v.extend_from_slice(b"cdef"));
        assert_eq!(cvec.as_slice(), b"abcdef");
        assert!(cvec.length <= cvec.capacity);
    }

    #[test]
    fn empty_values_are_well_formed() {
        let cvec = CVec::new();
        assert!(cvec.is_empty());
        assert_eq!(cvec.as_slice(), b"");

        let bytes = CBytes::from(&b""[..]);
        assert!(bytes.is_empty());
        assert_eq!(bytes.into_boxed_slice().len(), 0);
    }

    #[test]
    fn value_kinds_match_variants() {
        assert_eq!(Value::buffer(vec![1]).kind(), ValueKind::Buffer);
        assert_eq!(Value::bytes(&[1]).kind(), ValueKind::Bytes);
        assert_eq!(Value::str("x").kind(), ValueKind::Str);
        assert_eq!(Value::tuple(1, 2).kind(), ValueKind::Tuple);
        assert_eq!(Value::Flag(true).kind(), ValueKind::Flag);
        // SAFETY: opaque pointers are never read.
        let foreign = Value::Foreign(unsafe {
            ForeignValue::new(ValueKind::Opaque, std::ptr::null_mut())
        });
        assert_eq!(foreign.kind(), ValueKind::Opaque);
        assert_eq!(foreign.as_bytes(), None);
    }

    #[test]
    fn kind_codes_are_stable() {
        for code in 0..=5u8 {
            let kind = ValueKind::from_code(code).expect("known code");
            assert_eq!(kind.code(), code);
        }
        assert_eq!(ValueKind::from_code(6), None);
    }

    #[test]
    fn payload_ptr_points_at_repr_c_payload() {
        let mut value = Value::tuple(7, 9);
        let ptr = value.payload_ptr().cast::<CTuple>();
        // SAFETY: the value is a tuple and is still alive.
        let tuple = unsafe { *ptr };
        assert_eq!(tuple, CTuple::new(7, 9));

        let mut value = Value::buffer(b"xyz".to_vec());
        let ptr = value.payload_ptr().cast::<CVec>();
        // SAFETY: as above.
        let len = unsafe { (*ptr).len() };
        assert_eq!(len, 3);
    }

    #[test]
    fn foreign_payloads_decode_through_their_layout() {
        let buffer = Box::into_raw(Box::new(CVec::from(b"boom".to_vec())));
        let text = Box::into_raw(Box::new(CUtf8::from("name")));
        let tuple = Box::into_raw(Box::new(CTuple::new(EXIT_STATUS_CRASH, 11)));
        let flag = Box::into_raw(Box::new(1u8));

        // SAFETY: every pointer is a live payload of the declared kind until
        // it is freed at the end of the test.
        let (mut as_buffer, as_str, as_tuple, as_flag) = unsafe {
            (
                Value::Foreign(ForeignValue::new(ValueKind::Buffer, buffer.cast())),
                Value::Foreign(ForeignValue::new(ValueKind::Str, text.cast())),
                Value::Foreign(ForeignValue::new(ValueKind::Tuple, tuple.cast())),
                Value::Foreign(ForeignValue::new(ValueKind::Flag, flag.cast())),
            )
        };

        assert_eq!(as_buffer.as_bytes(), Some(&b"boom"[..]));
        as_buffer.as_bytes_mut().unwrap()[0] = b'z';
        assert_eq!(as_str.as_str(), Some("name"));
        assert_eq!(
            ExitStatus::from_tuple(as_tuple.as_tuple().unwrap()),
            Some(ExitStatus::Crash(11))
        );
        assert_eq!(as_flag.as_flag(), Some(true));
        assert_eq!(as_buffer.into_vec().as_deref(), Some(&b"zoom"[..]));
        assert_eq!(as_str.into_string().as_deref(), Some("name"));

        // SAFETY: the foreign values above only borrowed these allocations.
        unsafe {
            assert_eq!((*buffer).as_slice(), b"zoom", "the module's buffer was edited in place");
            drop(Box::from_raw(buffer));
            drop(Box::from_raw(text));
            drop(Box::from_raw(tuple));
            drop(Box::from_raw(flag));
        }
    }

    #[test]
    fn null_foreign_payloads_decode_to_nothing() {
        // SAFETY: null is always allowed.
        let value = Value::Foreign(unsafe {
            ForeignValue::new(ValueKind::Buffer, std::ptr::null_mut())
        });
        assert_eq!(value.as_bytes(), None);
        assert_eq!(value.into_vec(), None);
    }

    #[test]
    fn str_values_round_trip_through_string() {
        let value = Value::str("hello");
        assert_eq!(value.as_str(), Some("hello"));
        assert_eq!(value.into_string().as_deref(), Some("hello"));
    }

    #[test]
    fn exit_status_tuple_conversion() {
        let crash = ExitStatus::Crash(11);
        assert_eq!(crash.to_tuple(), CTuple::new(EXIT_STATUS_CRASH, 11));
        assert_eq!(ExitStatus::from_tuple(crash.to_tuple()), Some(crash));

        let negative = ExitStatus::Normal(-1);
        assert_eq!(ExitStatus::from_tuple(negative.to_tuple()), Some(negative));

        assert_eq!(ExitStatus::from_tuple(CTuple::new(9, 0)), None);
        assert!(ExitStatus::Timeout.is_interesting());
        assert!(!ExitStatus::Normal(0).is_interesting());
    }
}
