use crate::builtin;
use crate::driver::{
    DEFAULT_AVG_DENOMINATOR, FailurePolicy, HostRuntime, HostValues, Pipeline,
};
use crate::keys::KeySchema;
use crate::loader::DynamicPlugin;
use crate::log::LogSink;
use crate::plugin::Plugin;
use crate::stats::{DEFAULT_STAT_REGION_SIZE, STAT_FILE_HEADER_LEN, StatRecorder};
use crate::value::ValueKind;
use anyhow::Context;
use serde::Deserialize;
use std::collections::BTreeMap;
use std::path::{Path, PathBuf};

#[derive(Deserialize, Debug, Clone)]
#[serde(rename_all = "kebab-case")]
#[serde(deny_unknown_fields)]
pub struct FuzzerSettings {
    /// Run forever when unset.
    #[serde(default)]
    pub max_iterations: Option<u64>,
    #[serde(default)]
    pub failure_policy: FailurePolicy,
    #[serde(default = "default_fuzzer_id")]
    pub fuzzer_id: String,
    #[serde(default = "default_avg_denominator")]
    pub avg_denominator: u64,
}

fn default_fuzzer_id() -> String {
    "stagefuzz".to_string()
}

fn default_avg_denominator() -> u64 {
    DEFAULT_AVG_DENOMINATOR
}

impl Default for FuzzerSettings {
    fn default() -> Self {
        Self {
            max_iterations: None,
            failure_policy: FailurePolicy::default(),
            fuzzer_id: default_fuzzer_id(),
            avg_denominator: default_avg_denominator(),
        }
    }
}

#[derive(Deserialize, Debug, Clone)]
#[serde(rename_all = "kebab-case")]
#[serde(deny_unknown_fields)]
pub struct TargetSettings {
    pub path: PathBuf,
    /// `@@` is replaced by the path of the current input file.
    #[serde(default)]
    pub args: Vec<String>,
    #[serde(default = "default_timeout_ms")]
    pub timeout_ms: u64,
    /// Deliver the input through a file instead of stdin.
    #[serde(default)]
    pub input_file: bool,
}

fn default_timeout_ms() -> u64 {
    2000
}

#[derive(Deserialize, Debug, Clone)]
#[serde(rename_all = "kebab-case")]
#[serde(deny_unknown_fields)]
pub struct DirSettings {
    #[serde(default = "default_input_dir")]
    pub input: PathBuf,
    #[serde(default = "default_state_dir")]
    pub state: PathBuf,
    #[serde(default = "default_results_dir")]
    pub results: PathBuf,
}

fn default_input_dir() -> PathBuf {
    PathBuf::from("./inputs")
}

fn default_state_dir() -> PathBuf {
    PathBuf::from("./state")
}

fn default_results_dir() -> PathBuf {
    PathBuf::from("./results")
}

impl Default for DirSettings {
    fn default() -> Self {
        Self {
            input: default_input_dir(),
            state: default_state_dir(),
            results: default_results_dir(),
        }
    }
}

#[derive(Deserialize, Debug, Clone)]
#[serde(rename_all = "kebab-case")]
#[serde(deny_unknown_fields)]
pub struct StatsSettings {
    /// File name inside the state directory.
    #[serde(default = "default_stats_file")]
    pub file: PathBuf,
    #[serde(default = "default_stats_size")]
    pub size: usize,
}

fn default_stats_file() -> PathBuf {
    PathBuf::from("stats.bin")
}

fn default_stats_size() -> usize {
    DEFAULT_STAT_REGION_SIZE
}

impl Default for StatsSettings {
    fn default() -> Self {
        Self {
            file: default_stats_file(),
            size: default_stats_size(),
        }
    }
}

/// One `[[plugins]]` entry: a built-in by `name` or a module by `path`.
#[derive(Deserialize, Debug, Clone, Default)]
#[serde(rename_all = "kebab-case")]
#[serde(deny_unknown_fields)]
pub struct PluginEntry {
    #[serde(default)]
    pub name: Option<String>,
    #[serde(default)]
    pub path: Option<PathBuf>,
}

impl PluginEntry {
    pub fn builtin(name: &str) -> Self {
        Self {
            name: Some(name.to_string()),
            path: None,
        }
    }

    pub fn module(path: impl Into<PathBuf>) -> Self {
        Self {
            name: None,
            path: Some(path.into()),
        }
    }

    pub fn instantiate(&self) -> Result<Box<dyn Plugin>, anyhow::Error> {
        match (&self.name, &self.path) {
            (Some(name), None) => builtin::create(name).ok_or_else(|| {
                anyhow::anyhow!(
                    "Unknown built-in plugin '{}', expected one of: {}",
                    name,
                    builtin::NAMES.join(", ")
                )
            }),
            (None, Some(path)) => Ok(Box::new(DynamicPlugin::load(path)?)),
            _ => anyhow::bail!("A plugin entry needs exactly one of 'name' or 'path'"),
        }
    }
}

#[derive(Deserialize, Debug, Clone, Default)]
#[serde(rename_all = "kebab-case")]
#[serde(deny_unknown_fields)]
pub struct HostConfig {
    #[serde(default)]
    pub fuzzer: FuzzerSettings,
    #[serde(default)]
    pub target: Option<TargetSettings>,
    #[serde(default)]
    pub dirs: DirSettings,
    #[serde(default)]
    pub stats: StatsSettings,
    /// Plugins that only work in the first iteration, ahead of `plugins`.
    #[serde(default)]
    pub pre_loop: Vec<PluginEntry>,
    #[serde(default)]
    pub plugins: Vec<PluginEntry>,
    /// Published as `name=value` strings under `plugin_conf`.
    #[serde(default)]
    pub plugin_conf: BTreeMap<String, String>,
    /// Overrides the kind expected under a store key.
    #[serde(default)]
    pub keys: BTreeMap<String, ValueKind>,
}

impl HostConfig {
    /// Parses the file and resolves relative paths against its directory.
    pub fn load_from_file(path: &Path) -> Result<Self, anyhow::Error> {
        let content = std::fs::read_to_string(path)
            .map_err(|e| anyhow::anyhow!("Failed to read config file at {:?}: {}", path, e))?;

        let mut config: HostConfig = toml::from_str(&content).map_err(|e| {
            anyhow::anyhow!("Failed to parse TOML from config file {:?}: {}", path, e)
        })?;

        if let Some(base) = path.parent() {
            config.resolve_paths(base);
        }
        Ok(config)
    }

    pub fn resolve_paths(&mut self, base: &Path) {
        let resolve = |p: &mut PathBuf| {
            if p.is_relative() {
                *p = base.join(&*p);
            }
        };
        resolve(&mut self.dirs.input);
        resolve(&mut self.dirs.state);
        resolve(&mut self.dirs.results);
        if let Some(target) = &mut self.target {
            resolve(&mut target.path);
        }
        for entry in self.pre_loop.iter_mut().chain(self.plugins.iter_mut()) {
            if let Some(path) = &mut entry.path {
                resolve(path);
            }
        }
    }

    /// Checks the settings and creates the state and results directories.
    pub fn validate(&self) -> Result<(), anyhow::Error> {
        if self.plugins.is_empty() {
            anyhow::bail!("No plugins configured");
        }
        for (section, entries) in [("pre-loop", &self.pre_loop), ("plugins", &self.plugins)] {
            for (index, entry) in entries.iter().enumerate() {
                if entry.name.is_some() == entry.path.is_some() {
                    anyhow::bail!("{section} entry {index} needs exactly one of 'name' or 'path'");
                }
            }
        }
        if self.fuzzer.avg_denominator == 0 {
            anyhow::bail!("avg-denominator must be at least 1");
        }
        if self.stats.size <= STAT_FILE_HEADER_LEN {
            anyhow::bail!(
                "Stat region of {} bytes cannot hold the {}-byte header",
                self.stats.size,
                STAT_FILE_HEADER_LEN
            );
        }
        if !self.dirs.input.is_dir() {
            anyhow::bail!("Input directory {:?} does not exist", self.dirs.input);
        }
        for dir in [&self.dirs.state, &self.dirs.results] {
            std::fs::create_dir_all(dir)
                .with_context(|| format!("Failed to create directory {dir:?}"))?;
        }
        Ok(())
    }

    pub fn stats_path(&self) -> PathBuf {
        self.dirs.state.join(&self.stats.file)
    }

    pub fn schema(&self) -> KeySchema {
        KeySchema::default().with_overrides(&self.keys)
    }

    /// Target settings come first so explicit `[plugin-conf]` entries win.
    pub fn host_values(&self, cwd: PathBuf) -> HostValues {
        let mut plugin_conf = Vec::new();
        if let Some(target) = &self.target {
            plugin_conf.push(("run_target.timeout_ms".to_string(), target.timeout_ms.to_string()));
            plugin_conf.push(("run_target.input_file".to_string(), target.input_file.to_string()));
        }
        plugin_conf.extend(self.plugin_conf.iter().map(|(k, v)| (k.clone(), v.clone())));

        HostValues {
            input_dir: self.dirs.input.clone(),
            state_dir: self.dirs.state.clone(),
            results_dir: self.dirs.results.clone(),
            target_bin: self.target.as_ref().map(|t| t.path.clone()),
            target_args: self
                .target
                .as_ref()
                .map(|t| t.args.clone())
                .unwrap_or_default(),
            cwd,
            fuzzer_id: self.fuzzer.fuzzer_id.clone(),
            plugin_conf,
        }
    }

    /// Creates the stat file, publishes host values and adds every plugin.
    pub fn build_pipeline(&self, sink: impl LogSink + 'static) -> Result<Pipeline, anyhow::Error> {
        let stats_path = self.stats_path();
        let stats = StatRecorder::create(&stats_path, self.stats.size)
            .with_context(|| format!("Failed to create stat file {stats_path:?}"))?;
        let mut runtime = HostRuntime::with_schema(stats, sink, self.schema())?;
        let cwd = std::env::current_dir().context("Failed to read working directory")?;
        runtime.publish(self.host_values(cwd))?;

        let mut pipeline = Pipeline::new(runtime)?
            .with_policy(self.fuzzer.failure_policy)
            .with_avg_denominator(self.fuzzer.avg_denominator);
        for entry in &self.pre_loop {
            pipeline.add_pre_loop_plugin(entry.instantiate()?)?;
        }
        for entry in &self.plugins {
            pipeline.add_plugin(entry.instantiate()?)?;
        }
        Ok(pipeline)
    }
}
