//! In-process stage plugins usable by name from the configuration.
//!
//! Together they form a minimal loop: `select_input` picks a file from the
//! corpus, `byte_flip` mutates it, `run_target` executes the target and
//! `save_result` keeps crashing or hanging inputs. `fs_store` keeps the corpus
//! on disk and grows it from `new_inputs`.

pub mod byte_flip;
pub mod fs_store;
pub mod run_target;
pub mod save_result;
pub mod select_input;

use crate::keys;
use crate::plugin::{Plugin, PluginCore};
use anyhow::Context;
use rand_chacha::ChaCha8Rng;
use rand_core::SeedableRng;
use std::path::{Path, PathBuf};
use std::str::FromStr;

pub use byte_flip::ByteFlip;
pub use fs_store::FsStore;
pub use run_target::RunTarget;
pub use save_result::SaveResult;
pub use select_input::SelectInput;

pub const NAMES: &[&str] = &[
    select_input::NAME,
    byte_flip::NAME,
    run_target::NAME,
    save_result::NAME,
    fs_store::NAME,
];

pub fn create(name: &str) -> Option<Box<dyn Plugin>> {
    let plugin: Box<dyn Plugin> = match name {
        select_input::NAME => Box::new(SelectInput::default()),
        byte_flip::NAME => Box::new(ByteFlip::default()),
        run_target::NAME => Box::new(RunTarget::default()),
        save_result::NAME => Box::new(SaveResult::default()),
        fs_store::NAME => Box::new(FsStore::default()),
        _ => return None,
    };
    Some(plugin)
}

/// Parses the `plugin_conf` entry `<plugin>.<option>`, if present.
pub(crate) fn conf<T>(core: &PluginCore<'_>, option: &str) -> Result<Option<T>, anyhow::Error>
where
    T: FromStr,
    T::Err: std::error::Error + Send + Sync + 'static,
{
    let name = format!("{}.{}", core.name(), option);
    keys::conf_value(core.store(), &name)
        .map(|raw| {
            raw.parse::<T>()
                .with_context(|| format!("Invalid value '{raw}' for '{name}'"))
        })
        .transpose()
}

/// RNG seeded from `<plugin>.seed`, or from a random seed that is logged.
pub(crate) fn seeded_rng(core: &PluginCore<'_>) -> Result<ChaCha8Rng, anyhow::Error> {
    let seed = match conf::<u64>(core, "seed")? {
        Some(seed) => seed,
        None => {
            let seed = rand::random::<u64>();
            core.log(
                crate::log::LogLevel::Info,
                format!("No seed configured, using {seed}"),
            );
            seed
        }
    };
    Ok(ChaCha8Rng::seed_from_u64(seed))
}

/// Regular files directly inside `dir`, sorted by path.
pub(crate) fn scan_files(dir: &Path) -> Result<Vec<PathBuf>, anyhow::Error> {
    let mut files = Vec::new();
    for entry in std::fs::read_dir(dir).with_context(|| format!("Cannot list {dir:?}"))? {
        let path = entry?.path();
        if path.is_file() {
            files.push(path);
        }
    }
    files.sort();
    Ok(files)
}

/// Drops every value left under `key` by an earlier iteration.
pub(crate) fn drain(core: &mut PluginCore<'_>, key: &str) -> usize {
    let mut dropped = 0;
    while core.pop_front(key).is_some() {
        dropped += 1;
    }
    dropped
}
