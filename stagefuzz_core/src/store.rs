use crate::value::{Value, ValueKind};
use std::collections::{HashMap, VecDeque};
use thiserror::Error;

/// Errors raised by [`Store`] when a key's declared kind is violated.
#[derive(Error, Debug)]
pub enum StoreError {
    /// A key was declared twice with different kinds.
    #[error("Key '{key}' is already declared as {existing}, cannot redeclare it as {requested}")]
    KindConflict {
        key: String,
        existing: ValueKind,
        requested: ValueKind,
    },
    /// A push carried a value whose kind differs from the key's declaration.
    /// The rejected value is handed back so it is not lost.
    #[error("Key '{key}' holds {expected} values, refusing to push a {found} value")]
    KindMismatch {
        key: String,
        expected: ValueKind,
        found: ValueKind,
        value: Value,
    },
}

impl StoreError {
    /// Recovers the value rejected by a push, if any.
    pub fn into_value(self) -> Option<Value> {
        match self {
            StoreError::KindMismatch { value, .. } => Some(value),
            StoreError::KindConflict { .. } => None,
        }
    }
}

/// Renders a key for messages. Keys are arbitrary bytes.
pub fn display_key(key: &[u8]) -> String {
    String::from_utf8_lossy(key).into_owned()
}

#[derive(Debug, Default)]
struct Slot {
    expected: Option<ValueKind>,
    // Boxed so payload addresses survive `VecDeque` reallocation.
    values: VecDeque<Box<Value>>,
}

/// Keyed, double-ended container used to pass artifacts between plugins.
///
/// A slot is created on first use of its key and lives as long as the store.
/// Unknown keys behave like empty slots: pops and lookups yield `None` and
/// `len` yields zero.
#[derive(Debug, Default)]
pub struct Store {
    slots: HashMap<Vec<u8>, Slot>,
}

impl Store {
    pub fn new() -> Self {
        Self::default()
    }

    /// Registers the kind every value under `key` must have.
    ///
    /// Declaring the same kind again is a no-op.
    pub fn declare(&mut self, key: impl AsRef<[u8]>, kind: ValueKind) -> Result<(), StoreError> {
        let key = key.as_ref();
        let slot = self.slot_mut(key);
        match slot.expected {
            Some(existing) if existing != kind => Err(StoreError::KindConflict {
                key: display_key(key),
                existing,
                requested: kind,
            }),
            _ => {
                slot.expected = Some(kind);
                Ok(())
            }
        }
    }

    pub fn expected_kind(&self, key: impl AsRef<[u8]>) -> Option<ValueKind> {
        self.slots.get(key.as_ref()).and_then(|slot| slot.expected)
    }

    pub fn push_back(&mut self, key: impl AsRef<[u8]>, value: Value) -> Result<(), StoreError> {
        let key = key.as_ref();
        let value = self.check_kind(key, value)?;
        self.slot_mut(key).values.push_back(Box::new(value));
        Ok(())
    }

    pub fn push_front(&mut self, key: impl AsRef<[u8]>, value: Value) -> Result<(), StoreError> {
        let key = key.as_ref();
        let value = self.check_kind(key, value)?;
        self.slot_mut(key).values.push_front(Box::new(value));
        Ok(())
    }

    pub fn pop_back(&mut self, key: impl AsRef<[u8]>) -> Option<Value> {
        self.slots
            .get_mut(key.as_ref())?
            .values
            .pop_back()
            .map(|boxed| *boxed)
    }

    pub fn pop_front(&mut self, key: impl AsRef<[u8]>) -> Option<Value> {
        self.slots
            .get_mut(key.as_ref())?
            .values
            .pop_front()
            .map(|boxed| *boxed)
    }

    /// Borrows the element at `index`, counted from the current front.
    pub fn get(&self, key: impl AsRef<[u8]>, index: usize) -> Option<&Value> {
        self.slots
            .get(key.as_ref())?
            .values
            .get(index)
            .map(|boxed| boxed.as_ref())
    }

    /// Mutably borrows the element at `index`, counted from the current front.
    pub fn get_mut(&mut self, key: impl AsRef<[u8]>, index: usize) -> Option<&mut Value> {
        self.slots
            .get_mut(key.as_ref())?
            .values
            .get_mut(index)
            .map(|boxed| boxed.as_mut())
    }

    pub fn len(&self, key: impl AsRef<[u8]>) -> usize {
        self.slots
            .get(key.as_ref())
            .map_or(0, |slot| slot.values.len())
    }

    pub fn is_empty(&self, key: impl AsRef<[u8]>) -> bool {
        self.len(key) == 0
    }

    /// Drops every value under `key`. The slot and its declaration remain.
    pub fn clear(&mut self, key: impl AsRef<[u8]>) -> usize {
        match self.slots.get_mut(key.as_ref()) {
            Some(slot) => {
                let count = slot.values.len();
                slot.values.clear();
                count
            }
            None => 0,
        }
    }

    pub fn keys(&self) -> impl Iterator<Item = &[u8]> {
        self.slots.keys().map(Vec::as_slice)
    }

    /// Keys that still hold values, with their element counts, sorted by key.
    pub fn leaked(&self) -> Vec<(String, usize)> {
        let mut leaked: Vec<(String, usize)> = self
            .slots
            .iter()
            .filter(|(_, slot)| !slot.values.is_empty())
            .map(|(key, slot)| (display_key(key), slot.values.len()))
            .collect();
        leaked.sort();
        leaked
    }

    fn slot_mut(&mut self, key: &[u8]) -> &mut Slot {
        self.slots.entry(key.to_vec()).or_default()
    }

    fn check_kind(&self, key: &[u8], value: Value) -> Result<Value, StoreError> {
        match self.expected_kind(key) {
            Some(expected) if expected != value.kind() => Err(StoreError::KindMismatch {
                key: display_key(key),
                expected,
                found: value.kind(),
                value,
            }),
            _ => Ok(value),
        }
    }
}
