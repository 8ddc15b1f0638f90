//! Memory-mapped telemetry region shared with external monitoring tools.
//!
//! Layout, all integers little endian:
//!
//! ```text
//! header  : stat_len u32 | pid u32 | state u8
//! record  : type u8 | tag_len u16 | tag bytes | body
//! body    : Number/Signed -> 8 bytes
//!           Bytes/Str     -> capacity u16 | len u16 | capacity bytes
//!           Component     -> nothing
//! ```
//!
//! Records are only ever appended and never move, so a reader that has seen
//! `stat_len` can keep re-reading payloads at the same offsets. The writer
//! publishes a record by bumping `stat_len` after the record bytes are in place.

pub mod reader;
pub mod tags;

pub use reader::{StatEntry, StatSnapshot, StatValue, aggregate};
pub use tags::{PREFIX_AVG, PREFIX_TOTAL, strip_tag_hints, update_average};

use bincode::{
    Decode, Encode,
    config::{Configuration, Fixint, LittleEndian, NoLimit},
    error::{DecodeError, EncodeError},
};
use memmap2::MmapMut;
use serde::Serialize;
use std::collections::HashMap;
use std::fmt;
use std::fs::OpenOptions;
use std::path::{Path, PathBuf};
use thiserror::Error;

/// Encoded size of [`StatFileHeader`].
pub const STAT_FILE_HEADER_LEN: usize = 9;
/// Encoded size of a record's `{type, tag_len}` prefix.
const RECORD_HEADER_LEN: usize = 3;
/// `capacity` and `len` fields in front of a dynamic payload.
const DYN_PREFIX_LEN: usize = 4;
/// Size of both fixed numeric payloads.
const NUMBER_LEN: u16 = 8;

pub const DEFAULT_STAT_REGION_SIZE: usize = 64 * 1024;

/// Component name used for the host's own stats.
pub const CORE_COMPONENT: &str = "core";

/// The codec shared by the recorder and [`reader`].
pub(crate) fn codec_config() -> Configuration<LittleEndian, Fixint, NoLimit> {
    bincode::config::standard()
        .with_little_endian()
        .with_fixed_int_encoding()
}

#[derive(Error, Debug)]
pub enum StatError {
    #[error("I/O error on stat region: {0}")]
    Io(#[from] std::io::Error),
    #[error("Stat codec error: {0}")]
    Codec(String),
    #[error("Stat region size {size} is unusable (must hold the header and fit a u32 length)")]
    InvalidRegionSize { size: usize },
    #[error("Stat '{tag}' is registered as {existing}, cannot register it as {requested}")]
    TypeConflict {
        tag: String,
        existing: StatType,
        requested: StatType,
    },
    #[error("Stat '{tag}' of type {stat_type} needs size {expected}, got {requested}")]
    SizeMismatch {
        tag: String,
        stat_type: StatType,
        expected: u16,
        requested: u16,
    },
    #[error("Stat region is full: record needs {needed} bytes, {available} left")]
    OutOfSpace { needed: usize, available: usize },
    #[error("Stat region is closed, the host is exiting")]
    Closed,
    #[error("Stat state cannot go back from {from:?} to {to:?}")]
    StateRegression { from: CoreState, to: CoreState },
    #[error("Unknown stat type code {0}")]
    InvalidType(u8),
    #[error("Unknown core state code {0}")]
    InvalidState(u8),
    #[error("Stat handle refers to a {found} stat, expected {expected}")]
    WrongType { expected: StatType, found: StatType },
    #[error("Value of {len} bytes exceeds stat capacity of {capacity}")]
    ValueTooLong { len: usize, capacity: u16 },
    #[error("Stat tag of {0} bytes is too long")]
    TagTooLong(usize),
    #[error("Unknown stat component id {0}")]
    UnknownComponent(usize),
    #[error("Stat region truncated at offset {offset}")]
    Truncated { offset: usize },
}

impl From<EncodeError> for StatError {
    fn from(err: EncodeError) -> Self {
        StatError::Codec(format!("Bincode encoding error: {err}"))
    }
}

impl From<DecodeError> for StatError {
    fn from(err: DecodeError) -> Self {
        StatError::Codec(format!("Bincode decoding error: {err}"))
    }
}

/// Coarse host phase published in the header.
#[derive(Serialize, Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord)]
#[repr(u8)]
pub enum CoreState {
    Initializing = 0,
    Fuzzing = 1,
    Exiting = 2,
}

impl CoreState {
    pub fn from_code(code: u8) -> Option<Self> {
        match code {
            0 => Some(CoreState::Initializing),
            1 => Some(CoreState::Fuzzing),
            2 => Some(CoreState::Exiting),
            _ => None,
        }
    }
}

#[derive(Serialize, Debug, Clone, Copy, PartialEq, Eq, Hash)]
#[repr(u8)]
pub enum StatType {
    /// Marks that the following records belong to a named component.
    Component = 0,
    Bytes = 1,
    Str = 2,
    /// Unsigned 64-bit counter or measurement.
    Number = 3,
    Signed = 4,
}

impl StatType {
    pub fn from_code(code: u8) -> Option<Self> {
        match code {
            0 => Some(StatType::Component),
            1 => Some(StatType::Bytes),
            2 => Some(StatType::Str),
            3 => Some(StatType::Number),
            4 => Some(StatType::Signed),
            _ => None,
        }
    }

    /// Payload size for fixed-size types, `None` for dynamic ones.
    pub fn fixed_size(self) -> Option<u16> {
        match self {
            StatType::Component => Some(0),
            StatType::Number | StatType::Signed => Some(NUMBER_LEN),
            StatType::Bytes | StatType::Str => None,
        }
    }
}

impl fmt::Display for StatType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        fmt::Debug::fmt(self, f)
    }
}

#[derive(Encode, Decode, Serialize, Debug, Clone, Copy, PartialEq, Eq)]
pub struct StatFileHeader {
    /// Bytes of records following the header.
    pub stat_len: u32,
    pub pid: u32,
    pub state: u8,
}

#[derive(Encode, Decode, Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) struct RecordHeader {
    pub stat_type: u8,
    pub tag_len: u16,
}

/// Index of a component registered with [`StatRecorder::add_component`].
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct ComponentId(usize);

/// Location of one registered stat's payload.
///
/// For fixed types `offset` is the first payload byte. For dynamic types it
/// is the `len` field, which is directly followed by `capacity` data bytes.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct StatHandle {
    offset: usize,
    stat_type: StatType,
    capacity: u16,
}

impl StatHandle {
    pub fn offset(&self) -> usize {
        self.offset
    }

    pub fn stat_type(&self) -> StatType {
        self.stat_type
    }

    /// Data capacity of dynamic stats, payload size of fixed ones.
    pub fn capacity(&self) -> u16 {
        self.capacity
    }
}

/// Writer side of the stat region.
///
/// Registration is idempotent per `(component, tag)`: the same tag and type
/// always yield the same handle, and values are overwritten in place.
pub struct StatRecorder {
    map: MmapMut,
    path: Option<PathBuf>,
    cursor: usize,
    state: CoreState,
    components: Vec<String>,
    last_component: Option<ComponentId>,
    registered: HashMap<(ComponentId, Vec<u8>), StatHandle>,
}

impl StatRecorder {
    /// Creates (or truncates) the stat file at `path` and maps `size` bytes of it.
    pub fn create(path: impl AsRef<Path>, size: usize) -> Result<Self, StatError> {
        Self::check_size(size)?;
        let path = path.as_ref();
        let file = OpenOptions::new()
            .read(true)
            .write(true)
            .create(true)
            .truncate(true)
            .open(path)?;
        file.set_len(size as u64)?;
        // SAFETY: the file was just truncated and sized by this process, which
        // is its only writer. External readers map it read-only.
        let map = unsafe { MmapMut::map_mut(&file)? };
        Self::init(map, Some(path.to_path_buf()))
    }

    /// A recorder backed by anonymous memory, for embedding and tests.
    pub fn anonymous(size: usize) -> Result<Self, StatError> {
        Self::check_size(size)?;
        let map = MmapMut::map_anon(size)?;
        Self::init(map, None)
    }

    fn check_size(size: usize) -> Result<(), StatError> {
        if size < STAT_FILE_HEADER_LEN || size - STAT_FILE_HEADER_LEN > u32::MAX as usize {
            return Err(StatError::InvalidRegionSize { size });
        }
        Ok(())
    }

    fn init(map: MmapMut, path: Option<PathBuf>) -> Result<Self, StatError> {
        let mut recorder = Self {
            map,
            path,
            cursor: STAT_FILE_HEADER_LEN,
            state: CoreState::Initializing,
            components: Vec::new(),
            last_component: None,
            registered: HashMap::new(),
        };
        recorder.write_header()?;
        Ok(recorder)
    }

    pub fn path(&self) -> Option<&Path> {
        self.path.as_deref()
    }

    pub fn state(&self) -> CoreState {
        self.state
    }

    /// Bytes of records written so far.
    pub fn used(&self) -> usize {
        self.cursor - STAT_FILE_HEADER_LEN
    }

    pub fn remaining(&self) -> usize {
        self.map.len() - self.cursor
    }

    /// The whole mapped region, header included.
    pub fn as_bytes(&self) -> &[u8] {
        &self.map[..]
    }

    pub fn component_name(&self, id: ComponentId) -> Option<&str> {
        self.components.get(id.0).map(String::as_str)
    }

    /// Advances the published lifecycle state. Going backwards is rejected.
    pub fn set_state(&mut self, state: CoreState) -> Result<(), StatError> {
        if state < self.state {
            return Err(StatError::StateRegression {
                from: self.state,
                to: state,
            });
        }
        self.state = state;
        self.write_header()?;
        if state == CoreState::Exiting {
            self.flush()?;
        }
        Ok(())
    }

    pub fn flush(&self) -> Result<(), StatError> {
        if self.path.is_some() {
            self.map.flush()?;
        }
        Ok(())
    }

    /// Registers a component, or returns the id of the one with this name.
    pub fn add_component(&mut self, name: &str) -> Result<ComponentId, StatError> {
        self.ensure_open()?;
        if let Some(index) = self.components.iter().position(|c| c == name) {
            return Ok(ComponentId(index));
        }
        self.append_record(StatType::Component, name.as_bytes(), 0, &[])?;
        let id = ComponentId(self.components.len());
        self.components.push(name.to_string());
        self.last_component = Some(id);
        log::debug!("Registered stat component '{name}'");
        Ok(id)
    }

    /// Registers `tag` under `component` and returns its payload handle.
    ///
    /// `size_required` must equal the fixed size of numeric types. For `Bytes`
    /// and `Str` it is the data capacity, and must match on re-registration.
    pub fn add_stat(
        &mut self,
        component: ComponentId,
        tag: &[u8],
        stat_type: StatType,
        size_required: u16,
    ) -> Result<StatHandle, StatError> {
        self.ensure_open()?;
        let display_tag = || String::from_utf8_lossy(tag).into_owned();

        if stat_type == StatType::Component {
            return Err(StatError::InvalidType(stat_type as u8));
        }
        if component.0 >= self.components.len() {
            return Err(StatError::UnknownComponent(component.0));
        }

        if let Some(existing) = self.registered.get(&(component, tag.to_vec())) {
            if existing.stat_type != stat_type {
                return Err(StatError::TypeConflict {
                    tag: display_tag(),
                    existing: existing.stat_type,
                    requested: stat_type,
                });
            }
            if existing.capacity != size_required {
                return Err(StatError::SizeMismatch {
                    tag: display_tag(),
                    stat_type,
                    expected: existing.capacity,
                    requested: size_required,
                });
            }
            return Ok(*existing);
        }

        let body_len = match stat_type.fixed_size() {
            Some(fixed) if fixed != size_required => {
                return Err(StatError::SizeMismatch {
                    tag: display_tag(),
                    stat_type,
                    expected: fixed,
                    requested: size_required,
                });
            }
            Some(fixed) => fixed as usize,
            None => DYN_PREFIX_LEN + size_required as usize,
        };

        // A reader attributes records to the most recent component marker.
        if self.last_component != Some(component) {
            let name = self.components[component.0].clone();
            self.append_record(StatType::Component, name.as_bytes(), 0, &[])?;
            self.last_component = Some(component);
        }

        let offset = match stat_type.fixed_size() {
            Some(_) => self.append_record(stat_type, tag, body_len, &[])?,
            None => {
                let capacity = size_required.to_le_bytes();
                self.append_record(stat_type, tag, body_len, &capacity)? + 2
            }
        };

        let handle = StatHandle {
            offset,
            stat_type,
            capacity: size_required,
        };
        self.registered.insert((component, tag.to_vec()), handle);
        Ok(handle)
    }

    pub fn set_number(&mut self, handle: StatHandle, value: u64) -> Result<(), StatError> {
        self.check_write(handle, StatType::Number)?;
        self.map[handle.offset..handle.offset + 8].copy_from_slice(&value.to_le_bytes());
        Ok(())
    }

    pub fn set_signed(&mut self, handle: StatHandle, value: i64) -> Result<(), StatError> {
        self.check_write(handle, StatType::Signed)?;
        self.map[handle.offset..handle.offset + 8].copy_from_slice(&value.to_le_bytes());
        Ok(())
    }

    pub fn set_bytes(&mut self, handle: StatHandle, value: &[u8]) -> Result<(), StatError> {
        self.check_write(handle, StatType::Bytes)?;
        self.write_dynamic(handle, value)
    }

    pub fn set_str(&mut self, handle: StatHandle, value: &str) -> Result<(), StatError> {
        self.check_write(handle, StatType::Str)?;
        self.write_dynamic(handle, value.as_bytes())
    }

    pub fn number(&self, handle: StatHandle) -> Result<u64, StatError> {
        Self::check_type(handle, StatType::Number)?;
        Ok(u64::from_le_bytes(self.read8(handle.offset)))
    }

    pub fn signed(&self, handle: StatHandle) -> Result<i64, StatError> {
        Self::check_type(handle, StatType::Signed)?;
        Ok(i64::from_le_bytes(self.read8(handle.offset)))
    }

    /// Raw address of a payload for modules writing through the C table.
    ///
    /// Valid for as long as the recorder lives.
    pub fn payload_ptr(&mut self, handle: StatHandle) -> *mut u8 {
        self.map.as_mut_ptr().wrapping_add(handle.offset)
    }

    fn read8(&self, offset: usize) -> [u8; 8] {
        let mut out = [0u8; 8];
        out.copy_from_slice(&self.map[offset..offset + 8]);
        out
    }

    fn write_dynamic(&mut self, handle: StatHandle, value: &[u8]) -> Result<(), StatError> {
        if value.len() > handle.capacity as usize {
            return Err(StatError::ValueTooLong {
                len: value.len(),
                capacity: handle.capacity,
            });
        }
        let len_at = handle.offset;
        let data_at = len_at + 2;
        // Zero the length first so a concurrent reader never sees a length
        // larger than the bytes already copied.
        self.map[len_at..data_at].copy_from_slice(&0u16.to_le_bytes());
        self.map[data_at..data_at + value.len()].copy_from_slice(value);
        self.map[len_at..data_at].copy_from_slice(&(value.len() as u16).to_le_bytes());
        Ok(())
    }

    fn check_type(handle: StatHandle, expected: StatType) -> Result<(), StatError> {
        if handle.stat_type != expected {
            return Err(StatError::WrongType {
                expected,
                found: handle.stat_type,
            });
        }
        Ok(())
    }

    fn check_write(&self, handle: StatHandle, expected: StatType) -> Result<(), StatError> {
        self.ensure_open()?;
        Self::check_type(handle, expected)
    }

    fn ensure_open(&self) -> Result<(), StatError> {
        if self.state == CoreState::Exiting {
            return Err(StatError::Closed);
        }
        Ok(())
    }

    /// Appends a record whose body starts with `prefix` and is zeroed after
    /// it, then returns the offset of the body.
    fn append_record(
        &mut self,
        stat_type: StatType,
        tag: &[u8],
        body_len: usize,
        prefix: &[u8],
    ) -> Result<usize, StatError> {
        let tag_len = u16::try_from(tag.len()).map_err(|_| StatError::TagTooLong(tag.len()))?;
        let needed = RECORD_HEADER_LEN + tag.len() + body_len;
        let available = self.remaining();
        if needed > available {
            return Err(StatError::OutOfSpace { needed, available });
        }

        let start = self.cursor;
        let header = RecordHeader {
            stat_type: stat_type as u8,
            tag_len,
        };
        bincode::encode_into_slice(
            header,
            &mut self.map[start..start + RECORD_HEADER_LEN],
            codec_config(),
        )?;
        let tag_at = start + RECORD_HEADER_LEN;
        self.map[tag_at..tag_at + tag.len()].copy_from_slice(tag);
        let body_at = tag_at + tag.len();
        self.map[body_at..body_at + body_len].fill(0);
        self.map[body_at..body_at + prefix.len()].copy_from_slice(prefix);

        self.cursor = start + needed;
        self.write_header()?;
        Ok(body_at)
    }

    fn write_header(&mut self) -> Result<(), StatError> {
        let header = StatFileHeader {
            stat_len: self.used() as u32,
            pid: std::process::id(),
            state: self.state as u8,
        };
        bincode::encode_into_slice(
            header,
            &mut self.map[..STAT_FILE_HEADER_LEN],
            codec_config(),
        )?;
        Ok(())
    }
}

impl fmt::Debug for StatRecorder {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("StatRecorder")
            .field("path", &self.path)
            .field("state", &self.state)
            .field("used", &self.used())
            .field("capacity", &self.map.len())
            .finish()
    }
}

impl Drop for StatRecorder {
    fn drop(&mut self) {
        if self.state != CoreState::Exiting {
            self.state = CoreState::Exiting;
            if let Err(e) = self.write_header() {
                log::warn!("Failed to mark stat region as exiting: {e}");
            }
        }
        if let Err(e) = self.flush() {
            log::warn!("Failed to flush stat region: {e}");
        }
    }
}
