use super::{conf, drain, scan_files};
use crate::keys;
use crate::log::LogLevel;
use crate::plugin::{Plugin, PluginCore};
use crate::stats::{StatHandle, StatType};
use crate::value::Value;
use anyhow::Context;
use std::collections::HashSet;
use std::path::{Path, PathBuf};

pub const NAME: &str = "fs_store";

const DEFAULT_QUEUE_DIR: &str = "queue";

/// Keeps the corpus on disk.
///
/// `init` fills `input_list` from the input directory and the queue directory
/// (`<state>/queue` unless `fs_store.queue_dir` says otherwise), unless
/// another plugin already published the list. Every iteration drains
/// `new_inputs`, writes each input not seen before to `<queue>/<md5 hex>` and
/// appends its path to `input_list`.
#[derive(Default)]
pub struct FsStore {
    queue_dir: PathBuf,
    seen: HashSet<[u8; 16]>,
    list_owner: bool,
    num_files: Option<StatHandle>,
}

impl FsStore {
    pub fn queue_dir(&self) -> &Path {
        &self.queue_dir
    }

    /// Returns false if a file with the same contents is already known.
    fn remember(&mut self, contents: &[u8]) -> bool {
        self.seen.insert(md5::compute(contents).0)
    }

    fn publish_count(&self, core: &mut PluginCore<'_>) -> Result<(), anyhow::Error> {
        let count = core.len(keys::INPUT_LIST) as u64;
        if let Some(num_files) = self.num_files {
            core.stats().set_number(num_files, count)?;
        }
        Ok(())
    }
}

impl Plugin for FsStore {
    fn name(&self) -> &str {
        NAME
    }

    fn init(&mut self, core: &mut PluginCore<'_>) -> Result<(), anyhow::Error> {
        let state_dir = keys::first_str(core.store(), keys::STATE_DIR)
            .context("No state directory published")?;
        let queue_name =
            conf::<String>(core, "queue_dir")?.unwrap_or_else(|| DEFAULT_QUEUE_DIR.to_string());
        self.queue_dir = PathBuf::from(state_dir).join(queue_name);
        std::fs::create_dir_all(&self.queue_dir)
            .with_context(|| format!("Failed to create directory {:?}", self.queue_dir))?;
        self.num_files = Some(core.add_stat("total_num_files", StatType::Number, 8)?);

        if !core.is_empty(keys::INPUT_LIST) {
            core.log(
                LogLevel::Info,
                format!("Using the existing '{}' in the store", keys::INPUT_LIST),
            );
            return self.publish_count(core);
        }

        let input_dir = keys::first_str(core.store(), keys::INPUT_DIR)
            .context("No input directory published")?;
        let mut files = scan_files(Path::new(&input_dir))?;
        files.extend(scan_files(&self.queue_dir)?);
        for path in files {
            let contents =
                std::fs::read(&path).with_context(|| format!("Failed to read input {path:?}"))?;
            if self.remember(&contents) {
                core.push_back(keys::INPUT_LIST, Value::str(path.to_string_lossy()))?;
            }
        }
        self.list_owner = true;

        let found = core.len(keys::INPUT_LIST);
        if found == 0 {
            anyhow::bail!("No inputs found in {input_dir} or {:?}", self.queue_dir);
        }
        core.log(LogLevel::Info, format!("Found {found} input(s)"));
        self.publish_count(core)
    }

    fn do_work(&mut self, core: &mut PluginCore<'_>) -> Result<(), anyhow::Error> {
        let mut added = 0;
        while let Some(value) = core.pop_front(keys::NEW_INPUTS) {
            let input = value
                .into_vec()
                .context("'new_inputs' holds a value without bytes")?;
            if !self.remember(&input) {
                continue;
            }
            let path = self
                .queue_dir
                .join(format!("{:x}", md5::compute(&input)));
            std::fs::write(&path, &input).with_context(|| format!("Failed to save {path:?}"))?;
            core.push_back(keys::INPUT_LIST, Value::str(path.to_string_lossy()))?;
            added += 1;
        }
        if added > 0 {
            core.log(LogLevel::Debug, format!("Added {added} input(s) to the corpus"));
            self.publish_count(core)?;
        }
        Ok(())
    }

    fn destroy(&mut self, core: &mut PluginCore<'_>) -> Result<(), anyhow::Error> {
        drain(core, keys::NEW_INPUTS);
        if self.list_owner {
            drain(core, keys::INPUT_LIST);
        }
        Ok(())
    }
}
