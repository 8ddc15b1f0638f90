//! Well-known store keys shared by cooperating plugins.
//!
//! Each key carries exactly one element kind. The host declares the whole
//! schema when a runtime is created, so a plugin pushing the wrong kind under
//! one of these keys is rejected instead of corrupting its consumers.

use crate::store::Store;
use crate::value::ValueKind;
use std::collections::{BTreeMap, HashMap};

/// Directory holding the seed inputs. One `Str` element.
pub const INPUT_DIR: &str = "input_dir";
/// Directory for fuzzer state. One `Str` element.
pub const STATE_DIR: &str = "state_dir";
/// Directory where findings are written. One `Str` element.
pub const RESULTS_DIR: &str = "results_dir";
/// Path of the target binary. One `Str` element.
pub const TARGET_BIN: &str = "target_bin";
/// Target arguments, one `Str` element per argument.
pub const TARGET_ARGS: &str = "target_args";
/// Working directory of the host. One `Str` element.
pub const CWD: &str = "cwd";
/// Identifier of this fuzzer instance. One `Str` element.
pub const FUZZER_ID: &str = "fuzzer_id";
/// Plugin configuration, one `name=value` `Str` element per entry.
pub const PLUGIN_CONF: &str = "plugin_conf";
/// Corpus file paths to select from, one `Str` element per file.
pub const INPUT_LIST: &str = "input_list";
/// Path of the input selected this iteration.
pub const INPUT_PATH: &str = "input_path";
/// Contents of the input selected this iteration.
pub const INPUT_BYTES: &str = "input_bytes";
/// Mutated input, one `Buffer` element per chunk.
pub const CUR_INPUT_CHUNKS: &str = "cur_input_chunks";
/// Where the mutated input was written, if a plugin wrote it to disk.
pub const CUR_INPUT_PATH: &str = "cur_input_path";
/// Inputs discovered this iteration that should join the corpus, one
/// `Buffer` per input.
pub const NEW_INPUTS: &str = "new_inputs";
/// Request to keep the current input regardless of its exit status.
pub const SAVE_INPUT: &str = "save_input";
/// `{kind, value}` tuple, see the `EXIT_STATUS_*` constants.
pub const EXIT_STATUS: &str = "exit_status";
/// `{nanoseconds, 0}` tuple of the last target execution.
pub const EXEC_TIME: &str = "exec_time";
/// Reservation flag: skip mutation and only execute this iteration.
pub const EXEC_ONLY: &str = "exec_only";
/// `{count, 0}` tuple mirroring the host iteration counter.
pub const NUM_EXECS: &str = "num_execs";

pub const EXIT_STATUS_NORMAL: usize = 0;
pub const EXIT_STATUS_TIMEOUT: usize = 1;
pub const EXIT_STATUS_CRASH: usize = 2;

/// Keys published and cleared by the host itself.
pub const HOST_KEYS: &[&str] = &[
    INPUT_DIR,
    STATE_DIR,
    RESULTS_DIR,
    TARGET_BIN,
    TARGET_ARGS,
    CWD,
    FUZZER_ID,
    PLUGIN_CONF,
];

const DEFAULT_SCHEMA: &[(&str, ValueKind)] = &[
    (INPUT_DIR, ValueKind::Str),
    (STATE_DIR, ValueKind::Str),
    (RESULTS_DIR, ValueKind::Str),
    (TARGET_BIN, ValueKind::Str),
    (TARGET_ARGS, ValueKind::Str),
    (CWD, ValueKind::Str),
    (FUZZER_ID, ValueKind::Str),
    (PLUGIN_CONF, ValueKind::Str),
    (INPUT_LIST, ValueKind::Str),
    (INPUT_PATH, ValueKind::Str),
    (INPUT_BYTES, ValueKind::Buffer),
    (CUR_INPUT_CHUNKS, ValueKind::Buffer),
    (CUR_INPUT_PATH, ValueKind::Str),
    (NEW_INPUTS, ValueKind::Buffer),
    (SAVE_INPUT, ValueKind::Flag),
    (EXIT_STATUS, ValueKind::Tuple),
    (EXEC_TIME, ValueKind::Tuple),
    (EXEC_ONLY, ValueKind::Flag),
    (NUM_EXECS, ValueKind::Tuple),
];

/// Key to kind map declared on every fresh store.
///
/// Key sets have no version in the plugin ABI, so compatibility between
/// plugins built against different conventions is handled here: the
/// configuration can retype a key or add new ones.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct KeySchema {
    kinds: HashMap<Vec<u8>, ValueKind>,
}

impl Default for KeySchema {
    fn default() -> Self {
        let kinds = DEFAULT_SCHEMA
            .iter()
            .map(|(key, kind)| (key.as_bytes().to_vec(), *kind))
            .collect();
        Self { kinds }
    }
}

impl KeySchema {
    /// A schema with no keys at all.
    pub fn empty() -> Self {
        Self {
            kinds: HashMap::new(),
        }
    }

    pub fn with_overrides(mut self, overrides: &BTreeMap<String, ValueKind>) -> Self {
        for (key, kind) in overrides {
            self.kinds.insert(key.as_bytes().to_vec(), *kind);
        }
        self
    }

    pub fn kind_of(&self, key: impl AsRef<[u8]>) -> Option<ValueKind> {
        self.kinds.get(key.as_ref()).copied()
    }

    pub fn len(&self) -> usize {
        self.kinds.len()
    }

    pub fn is_empty(&self) -> bool {
        self.kinds.is_empty()
    }

    pub fn iter(&self) -> impl Iterator<Item = (&[u8], ValueKind)> {
        self.kinds.iter().map(|(key, kind)| (key.as_slice(), *kind))
    }
}

/// Looks up `name` among the `name=value` entries under [`PLUGIN_CONF`].
///
/// The last matching entry wins.
pub fn conf_value(store: &Store, name: &str) -> Option<String> {
    (0..store.len(PLUGIN_CONF))
        .filter_map(|i| store.get(PLUGIN_CONF, i).and_then(|v| v.as_str()))
        .filter_map(|entry| entry.split_once('='))
        .filter(|(entry_name, _)| entry_name.trim() == name)
        .map(|(_, value)| value.trim().to_string())
        .last()
}

/// Every `Str` element under `key`, in slot order.
pub fn str_values(store: &Store, key: &str) -> Vec<String> {
    (0..store.len(key))
        .filter_map(|i| store.get(key, i).and_then(|v| v.as_str()))
        .map(str::to_string)
        .collect()
}

/// The front `Str` element under `key`.
pub fn first_str(store: &Store, key: &str) -> Option<String> {
    store
        .get(key, 0)
        .and_then(|v| v.as_str())
        .map(str::to_string)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::value::Value;

    #[test]
    fn default_schema_covers_well_known_keys() {
        let schema = KeySchema::default();
        assert_eq!(schema.kind_of(EXIT_STATUS), Some(ValueKind::Tuple));
        assert_eq!(schema.kind_of(INPUT_BYTES), Some(ValueKind::Buffer));
        assert_eq!(schema.kind_of(SAVE_INPUT), Some(ValueKind::Flag));
        assert_eq!(schema.kind_of(INPUT_LIST), Some(ValueKind::Str));
        assert_eq!(schema.kind_of(NEW_INPUTS), Some(ValueKind::Buffer));
        assert_eq!(schema.kind_of("not_a_key"), None);
        assert_eq!(schema.len(), DEFAULT_SCHEMA.len());
    }

    #[test]
    fn overrides_retype_and_extend() {
        let mut overrides = BTreeMap::new();
        overrides.insert(INPUT_BYTES.to_string(), ValueKind::Bytes);
        overrides.insert("coverage_map".to_string(), ValueKind::Opaque);

        let schema = KeySchema::default().with_overrides(&overrides);
        assert_eq!(schema.kind_of(INPUT_BYTES), Some(ValueKind::Bytes));
        assert_eq!(schema.kind_of("coverage_map"), Some(ValueKind::Opaque));
        assert_eq!(schema.len(), DEFAULT_SCHEMA.len() + 1);
    }

    #[test]
    fn conf_value_reads_name_value_pairs() {
        let mut store = Store::new();
        store
            .push_back(PLUGIN_CONF, Value::str("select_input.seed=42"))
            .unwrap();
        store
            .push_back(PLUGIN_CONF, Value::str("run_target.timeout_ms = 100"))
            .unwrap();
        store
            .push_back(PLUGIN_CONF, Value::str("select_input.seed=7"))
            .unwrap();

        assert_eq!(conf_value(&store, "run_target.timeout_ms").as_deref(), Some("100"));
        assert_eq!(conf_value(&store, "select_input.seed").as_deref(), Some("7"));
        assert_eq!(conf_value(&store, "missing"), None);
    }

    #[test]
    fn str_helpers_read_in_order() {
        let mut store = Store::new();
        store.push_back(TARGET_ARGS, Value::str("-a")).unwrap();
        store.push_back(TARGET_ARGS, Value::str("@@")).unwrap();
        assert_eq!(str_values(&store, TARGET_ARGS), vec!["-a", "@@"]);
        assert_eq!(first_str(&store, TARGET_ARGS).as_deref(), Some("-a"));
        assert_eq!(first_str(&store, TARGET_BIN), None);
    }
}
