//! Reader side of the stat region, used by monitoring tools.
//!
//! A reader needs no cooperation from the writer. It reads the header once,
//! walks `stat_len` bytes of records and copies the payloads out. The payload
//! written last may be torn; dynamic lengths are clamped to their capacity.

use super::tags::{self, Aggregation};
use super::{
    CoreState, RECORD_HEADER_LEN, RecordHeader, STAT_FILE_HEADER_LEN, StatError, StatFileHeader,
    StatType, codec_config,
};
use memmap2::Mmap;
use serde::Serialize;
use std::collections::BTreeMap;
use std::fmt;
use std::fs::File;
use std::path::Path;

#[derive(Serialize, Debug, Clone, PartialEq, Eq)]
#[serde(untagged)]
pub enum StatValue {
    Number(u64),
    Signed(i64),
    Str(String),
    Bytes(Vec<u8>),
}

#[derive(Serialize, Debug, Clone, PartialEq, Eq)]
pub struct StatEntry {
    pub component: String,
    pub tag: String,
    pub value: StatValue,
}

impl StatEntry {
    /// Renders the value using the unit hint in its tag.
    pub fn display_value(&self) -> String {
        match &self.value {
            StatValue::Number(n) => match tags::duration_of(&self.tag, *n) {
                Some(duration) => format!("{duration:?}"),
                None => n.to_string(),
            },
            StatValue::Signed(n) => n.to_string(),
            StatValue::Str(s) => s.clone(),
            StatValue::Bytes(bytes) if tags::postfix_of(&self.tag) == Some(tags::POSTFIX_HEX) => {
                bytes.iter().map(|b| format!("{b:02x}")).collect()
            }
            StatValue::Bytes(bytes) => format!("{bytes:?}"),
        }
    }
}

impl fmt::Display for StatEntry {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "{}.{} = {}",
            self.component,
            self.tag,
            self.display_value()
        )
    }
}

/// Decoded copy of a stat region at one point in time.
#[derive(Serialize, Debug, Clone)]
pub struct StatSnapshot {
    pub header: StatFileHeader,
    pub state: CoreState,
    pub entries: Vec<StatEntry>,
}

impl StatSnapshot {
    /// Maps the stat file at `path` read-only and parses it.
    pub fn open(path: impl AsRef<Path>) -> Result<Self, StatError> {
        let file = File::open(path.as_ref())?;
        // SAFETY: the writer only ever appends records and overwrites payloads
        // in place; `parse` bounds-checks everything it reads.
        let map = unsafe { Mmap::map(&file)? };
        Self::parse(&map[..])
    }

    pub fn parse(region: &[u8]) -> Result<Self, StatError> {
        let header_bytes = region
            .get(..STAT_FILE_HEADER_LEN)
            .ok_or(StatError::Truncated { offset: 0 })?;
        let (header, _): (StatFileHeader, usize) =
            bincode::decode_from_slice(header_bytes, codec_config())?;
        let state = CoreState::from_code(header.state).ok_or(StatError::InvalidState(header.state))?;

        let end = STAT_FILE_HEADER_LEN + header.stat_len as usize;
        let records = region
            .get(..end)
            .ok_or(StatError::Truncated { offset: region.len() })?;

        let mut entries = Vec::new();
        let mut component = String::new();
        let mut offset = STAT_FILE_HEADER_LEN;
        while offset < end {
            let record_bytes = slice(records, offset, RECORD_HEADER_LEN)?;
            let (record, _): (RecordHeader, usize) =
                bincode::decode_from_slice(record_bytes, codec_config())?;
            let stat_type =
                StatType::from_code(record.stat_type).ok_or(StatError::InvalidType(record.stat_type))?;
            offset += RECORD_HEADER_LEN;

            let tag_bytes = slice(records, offset, record.tag_len as usize)?;
            let tag = String::from_utf8_lossy(tag_bytes).into_owned();
            offset += tag_bytes.len();

            let value = match stat_type {
                StatType::Component => {
                    component = tag;
                    continue;
                }
                StatType::Number => {
                    let n = u64::from_le_bytes(array8(records, offset)?);
                    offset += 8;
                    StatValue::Number(n)
                }
                StatType::Signed => {
                    let n = i64::from_le_bytes(array8(records, offset)?);
                    offset += 8;
                    StatValue::Signed(n)
                }
                StatType::Bytes | StatType::Str => {
                    let capacity = read_u16(records, offset)? as usize;
                    let len = (read_u16(records, offset + 2)? as usize).min(capacity);
                    let data = slice(records, offset + 4, capacity)?;
                    offset += 4 + capacity;
                    if stat_type == StatType::Str {
                        StatValue::Str(String::from_utf8_lossy(&data[..len]).into_owned())
                    } else {
                        StatValue::Bytes(data[..len].to_vec())
                    }
                }
            };
            entries.push(StatEntry {
                component: component.clone(),
                tag,
                value,
            });
        }

        Ok(Self {
            header,
            state,
            entries,
        })
    }

    pub fn get(&self, component: &str, tag: &str) -> Option<&StatValue> {
        self.entries
            .iter()
            .find(|e| e.component == component && e.tag == tag)
            .map(|e| &e.value)
    }
}

fn slice(buf: &[u8], offset: usize, len: usize) -> Result<&[u8], StatError> {
    buf.get(offset..offset + len)
        .ok_or(StatError::Truncated { offset })
}

fn array8(buf: &[u8], offset: usize) -> Result<[u8; 8], StatError> {
    let mut out = [0u8; 8];
    out.copy_from_slice(slice(buf, offset, 8)?);
    Ok(out)
}

fn read_u16(buf: &[u8], offset: usize) -> Result<u16, StatError> {
    let bytes = slice(buf, offset, 2)?;
    Ok(u16::from_le_bytes([bytes[0], bytes[1]]))
}

/// Merges several instances' stats by tag convention.
///
/// `total_` numbers are summed and `avg_` numbers averaged per
/// `(component, tag)`. Other stats are instance specific and left out.
pub fn aggregate(snapshots: &[StatSnapshot]) -> Vec<StatEntry> {
    let mut merged: BTreeMap<(String, String), (i128, i128, bool)> = BTreeMap::new();
    for entry in snapshots.iter().flat_map(|s| s.entries.iter()) {
        let (n, signed) = match entry.value {
            StatValue::Number(n) => (n as i128, false),
            StatValue::Signed(n) => (n as i128, true),
            _ => continue,
        };
        if tags::aggregation_of(&entry.tag) == Aggregation::None {
            continue;
        }
        let slot = merged
            .entry((entry.component.clone(), entry.tag.clone()))
            .or_insert((0, 0, signed));
        slot.0 += n;
        slot.1 += 1;
    }

    merged
        .into_iter()
        .map(|((component, tag), (sum, count, signed))| {
            let n = match tags::aggregation_of(&tag) {
                Aggregation::Average => sum / count,
                _ => sum,
            };
            let value = if signed {
                StatValue::Signed(n.clamp(i64::MIN as i128, i64::MAX as i128) as i64)
            } else {
                StatValue::Number(n.clamp(0, u64::MAX as i128) as u64)
            };
            StatEntry {
                component,
                tag,
                value,
            }
        })
        .collect()
}
