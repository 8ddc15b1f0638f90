use super::{drain, scan_files, seeded_rng};
use crate::keys;
use crate::plugin::{Plugin, PluginCore};
use crate::stats::{StatHandle, StatType};
use crate::value::Value;
use anyhow::Context;
use rand::Rng;
use rand_chacha::ChaCha8Rng;
use std::path::{Path, PathBuf};

pub const NAME: &str = "select_input";

/// Picks a random corpus file from `input_list` every iteration.
///
/// Pushes its path to `input_path` and its contents to `input_bytes`. When
/// no other plugin published `input_list` by `validate`, the files of the
/// input directory are listed instead.
#[derive(Default)]
pub struct SelectInput {
    rng: Option<ChaCha8Rng>,
    list_owner: bool,
    inputs: Option<StatHandle>,
    selected: Option<StatHandle>,
}

impl Plugin for SelectInput {
    fn name(&self) -> &str {
        NAME
    }

    fn init(&mut self, core: &mut PluginCore<'_>) -> Result<(), anyhow::Error> {
        self.rng = Some(seeded_rng(core)?);
        self.selected = Some(core.add_stat("total_selected", StatType::Number, 8)?);
        Ok(())
    }

    fn validate(&mut self, core: &mut PluginCore<'_>) -> Result<(), anyhow::Error> {
        if core.is_empty(keys::INPUT_LIST) {
            let dir = keys::first_str(core.store(), keys::INPUT_DIR)
                .context("No input directory published")?;
            let inputs = scan_files(Path::new(&dir))?;
            if inputs.is_empty() {
                anyhow::bail!("Input directory {dir} holds no files");
            }
            for path in inputs {
                core.push_back(keys::INPUT_LIST, Value::str(path.to_string_lossy()))?;
            }
            self.list_owner = true;
        }

        let count = core.len(keys::INPUT_LIST);
        let inputs = core.add_stat("total_inputs", StatType::Number, 8)?;
        core.stats().set_number(inputs, count as u64)?;
        self.inputs = Some(inputs);
        core.log(
            crate::log::LogLevel::Info,
            format!("Selecting from {count} input(s)"),
        );
        Ok(())
    }

    fn do_work(&mut self, core: &mut PluginCore<'_>) -> Result<(), anyhow::Error> {
        let rng = self.rng.as_mut().context("select_input used before init")?;
        let count = core.len(keys::INPUT_LIST);
        if count == 0 {
            anyhow::bail!("No inputs to select from");
        }
        let index = rng.random_range(0..count);
        let path = core
            .get(keys::INPUT_LIST, index)
            .and_then(|v| v.as_str())
            .map(PathBuf::from)
            .with_context(|| format!("'input_list' entry {index} is not a path"))?;
        let contents =
            std::fs::read(&path).with_context(|| format!("Failed to read input {path:?}"))?;

        drain(core, keys::INPUT_PATH);
        drain(core, keys::INPUT_BYTES);
        core.push_back(keys::INPUT_PATH, Value::str(path.to_string_lossy()))?;
        core.push_back(keys::INPUT_BYTES, contents)?;

        let stats = core.stats();
        if let Some(inputs) = self.inputs {
            stats.set_number(inputs, count as u64)?;
        }
        if let Some(selected) = self.selected {
            let total = stats.number(selected)?;
            stats.set_number(selected, total + 1)?;
        }
        Ok(())
    }

    fn destroy(&mut self, core: &mut PluginCore<'_>) -> Result<(), anyhow::Error> {
        drain(core, keys::INPUT_PATH);
        drain(core, keys::INPUT_BYTES);
        if self.list_owner {
            drain(core, keys::INPUT_LIST);
        }
        Ok(())
    }
}
