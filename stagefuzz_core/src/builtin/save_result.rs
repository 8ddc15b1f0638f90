use super::{conf, drain};
use crate::keys;
use crate::plugin::{Plugin, PluginCore};
use crate::stats::{StatHandle, StatType};
use crate::value::{ExitStatus, Value};
use anyhow::Context;
use std::path::{Path, PathBuf};

pub const NAME: &str = "save_result";

#[derive(Debug, Clone)]
struct Bucket {
    dir: PathBuf,
    count: StatHandle,
}

impl Bucket {
    fn create(
        core: &mut PluginCore<'_>,
        results_dir: &Path,
        option: &str,
        default_name: &str,
    ) -> Result<Self, anyhow::Error> {
        let name = conf::<String>(core, option)?.unwrap_or_else(|| default_name.to_string());
        let dir = results_dir.join(name);
        std::fs::create_dir_all(&dir)
            .with_context(|| format!("Failed to create directory {dir:?}"))?;

        let shown = dir.to_string_lossy().into_owned();
        let tag = format!("{default_name}_dir");
        if let Ok(capacity) = u16::try_from(shown.len()) {
            let handle = core.add_stat(&tag, StatType::Str, capacity)?;
            core.stats().set_str(handle, &shown)?;
        }
        let count = core.add_stat(format!("total_{default_name}"), StatType::Number, 8)?;
        Ok(Self { dir, count })
    }

    /// Writes `input` as `<md5 hex>`; returns false if it was already saved.
    fn save(&self, core: &mut PluginCore<'_>, input: &[u8]) -> Result<bool, anyhow::Error> {
        let path = self.dir.join(format!("{:x}", md5::compute(input)));
        if path.exists() {
            return Ok(false);
        }
        std::fs::write(&path, input).with_context(|| format!("Failed to save {path:?}"))?;
        let stats = core.stats();
        let total = stats.number(self.count)?;
        stats.set_number(self.count, total + 1)?;
        Ok(true)
    }
}

/// Keeps inputs that crashed or hung the target.
///
/// Consumes the per-iteration values (`exit_status`, `exec_time`,
/// `cur_input_chunks`, `input_path`, `save_input`). Crashes and timeouts go to
/// `crashes/` and `timeouts/` under the results directory; an input flagged by
/// `save_input` goes to `queue/`. Files are named by the input's MD5.
///
/// With `save_result.feed_corpus = true` a flagged input is also pushed to
/// `new_inputs` so a corpus plugin can add it to the selection pool.
#[derive(Default)]
pub struct SaveResult {
    crashes: Option<Bucket>,
    timeouts: Option<Bucket>,
    queue: Option<Bucket>,
    feed_corpus: bool,
}

impl Plugin for SaveResult {
    fn name(&self) -> &str {
        NAME
    }

    fn init(&mut self, core: &mut PluginCore<'_>) -> Result<(), anyhow::Error> {
        let results_dir = keys::first_str(core.store(), keys::RESULTS_DIR)
            .map(PathBuf::from)
            .context("No results directory published")?;
        self.crashes = Some(Bucket::create(core, &results_dir, "crashes_dir", "crashes")?);
        self.timeouts = Some(Bucket::create(core, &results_dir, "timeouts_dir", "timeouts")?);
        self.queue = Some(Bucket::create(core, &results_dir, "queue_dir", "queue")?);
        self.feed_corpus = conf::<bool>(core, "feed_corpus")?.unwrap_or(false);
        Ok(())
    }

    fn do_work(&mut self, core: &mut PluginCore<'_>) -> Result<(), anyhow::Error> {
        let status = core
            .pop_front(keys::EXIT_STATUS)
            .and_then(|v| v.as_tuple())
            .and_then(ExitStatus::from_tuple)
            .context("No exit status to inspect")?;
        drain(core, keys::EXIT_STATUS);
        drain(core, keys::EXEC_TIME);
        drain(core, keys::INPUT_PATH);
        let keep = core
            .pop_front(keys::SAVE_INPUT)
            .and_then(|v| v.as_flag())
            .unwrap_or(false);
        drain(core, keys::SAVE_INPUT);

        let mut input = Vec::new();
        let mut index = 0;
        while let Some(chunk) = core.pop_front(keys::CUR_INPUT_CHUNKS) {
            let bytes = chunk
                .as_bytes()
                .with_context(|| format!("Input chunk {index} holds no readable bytes"))?;
            input.extend_from_slice(bytes);
            index += 1;
        }

        let bucket = match status {
            ExitStatus::Crash(_) => self.crashes.as_ref(),
            ExitStatus::Timeout => self.timeouts.as_ref(),
            ExitStatus::Normal(_) if keep => self.queue.as_ref(),
            ExitStatus::Normal(_) => return Ok(()),
        };
        let bucket = bucket.context("save_result used before init")?;
        if bucket.save(core, &input)? {
            core.log(
                crate::log::LogLevel::Info,
                format!("Saved {status:?} input to {:?}", bucket.dir),
            );
        }
        if keep && self.feed_corpus {
            core.push_back(keys::NEW_INPUTS, input)?;
        }
        Ok(())
    }
}
