use crate::keys::{self, HOST_KEYS, KeySchema};
use crate::log::{LogLevel, LogSink};
use crate::plugin::{Plugin, PluginCore};
use crate::stats::{
    CORE_COMPONENT, ComponentId, CoreState, StatError, StatHandle, StatRecorder, StatType,
    update_average,
};
use crate::store::{Store, StoreError};
use crate::value::{CTuple, Value};
use serde::Deserialize;
use std::fmt;
use std::path::PathBuf;
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};
use std::time::{Duration, Instant, SystemTime, UNIX_EPOCH};
use thiserror::Error;

/// Default cap on the rolling-average denominator.
pub const DEFAULT_AVG_DENOMINATOR: u64 = 20;

const EXEC_TIME_STAT: &str = "avg_exec_time_ns";

#[derive(Error, Debug)]
pub enum DriverError {
    /// `init` or `validate` failed. Initialized plugins were already destroyed.
    #[error("Plugin '{plugin}' failed during {phase}: {error:#}")]
    Setup {
        plugin: String,
        phase: LifecyclePhase,
        error: anyhow::Error,
    },
    #[error("Shutdown was requested during startup")]
    Interrupted,
    #[error("Pipeline is {state:?}, cannot {action}")]
    InvalidState {
        state: PipelineState,
        action: &'static str,
    },
    /// A `do_work` failure under [`FailurePolicy::Abort`].
    #[error("Iteration {iteration} aborted, plugin '{plugin}' failed: {error:#}")]
    Aborted {
        iteration: u64,
        plugin: String,
        error: anyhow::Error,
    },
    #[error(transparent)]
    Stats(#[from] StatError),
    #[error(transparent)]
    Store(#[from] StoreError),
}

/// What the driver does after a `do_work` failure.
#[derive(Deserialize, Debug, Clone, Copy, PartialEq, Eq, Default)]
#[serde(rename_all = "kebab-case")]
pub enum FailurePolicy {
    /// Abandon the iteration and start the next one.
    #[default]
    Continue,
    /// Stop running; the caller tears the pipeline down.
    Abort,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum LifecyclePhase {
    Init,
    Validate,
    DoWork,
    Destroy,
}

impl fmt::Display for LifecyclePhase {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(match self {
            LifecyclePhase::Init => "init",
            LifecyclePhase::Validate => "validate",
            LifecyclePhase::DoWork => "do_work",
            LifecyclePhase::Destroy => "destroy",
        })
    }
}

/// Where a single plugin is in its lifecycle.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PluginState {
    Loaded,
    Initialized,
    Validated,
    Running,
    Destroyed,
}

impl PluginState {
    fn needs_destroy(self) -> bool {
        matches!(
            self,
            PluginState::Initialized | PluginState::Validated | PluginState::Running
        )
    }
}

/// Which iterations a plugin's `do_work` takes part in.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Stage {
    /// Runs ahead of the loop plugins in the first iteration only.
    PreLoop,
    /// Runs in every iteration.
    Loop,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PipelineState {
    /// Plugins may still be added.
    Assembling,
    /// `setup` succeeded; iterations may run.
    Ready,
    TornDown,
}

#[derive(Debug)]
pub enum IterationOutcome {
    Completed,
    /// `plugin` failed and the rest of the iteration was skipped.
    Failed {
        plugin: String,
        error: anyhow::Error,
    },
}

#[derive(Debug, Default, Clone, PartialEq, Eq)]
pub struct RunSummary {
    pub iterations: u64,
    pub failures: u64,
    /// The shutdown flag ended the run.
    pub interrupted: bool,
}

#[derive(Debug, Default)]
pub struct TeardownReport {
    /// Plugins whose `destroy` failed, in the order they were destroyed.
    pub failures: Vec<(String, anyhow::Error)>,
    /// Store keys still holding values after teardown.
    pub leaked: Vec<(String, usize)>,
}

impl TeardownReport {
    pub fn is_clean(&self) -> bool {
        self.failures.is_empty() && self.leaked.is_empty()
    }
}

/// Values the host publishes into the store before any plugin runs.
#[derive(Debug, Clone, Default)]
pub struct HostValues {
    pub input_dir: PathBuf,
    pub state_dir: PathBuf,
    pub results_dir: PathBuf,
    pub target_bin: Option<PathBuf>,
    pub target_args: Vec<String>,
    pub cwd: PathBuf,
    pub fuzzer_id: String,
    /// Published as `name=value` entries under [`keys::PLUGIN_CONF`].
    pub plugin_conf: Vec<(String, String)>,
}

impl HostValues {
    pub fn cmd_line(&self) -> String {
        let mut parts: Vec<String> = self
            .target_bin
            .iter()
            .map(|p| p.display().to_string())
            .collect();
        parts.extend(self.target_args.iter().cloned());
        parts.join(" ")
    }
}

/// Everything one pipeline shares with its plugins.
///
/// Owns its store, stat region and log sink; nothing is process global, so
/// several runtimes can live side by side.
pub struct HostRuntime {
    store: Store,
    stats: StatRecorder,
    sink: Box<dyn LogSink>,
    schema: KeySchema,
    host_values: Option<HostValues>,
}

impl HostRuntime {
    pub fn new(stats: StatRecorder, sink: impl LogSink + 'static) -> Result<Self, StoreError> {
        Self::with_schema(stats, sink, KeySchema::default())
    }

    /// Declares every key of `schema` on a fresh store.
    pub fn with_schema(
        stats: StatRecorder,
        sink: impl LogSink + 'static,
        schema: KeySchema,
    ) -> Result<Self, StoreError> {
        let mut store = Store::new();
        for (key, kind) in schema.iter() {
            store.declare(key, kind)?;
        }
        Ok(Self {
            store,
            stats,
            sink: Box::new(sink),
            schema,
            host_values: None,
        })
    }

    /// Replaces the host-owned keys with `values`.
    pub fn publish(&mut self, values: HostValues) -> Result<(), StoreError> {
        self.clear_host_values();
        let path = |p: &PathBuf| Value::str(p.to_string_lossy());
        self.store.push_back(keys::INPUT_DIR, path(&values.input_dir))?;
        self.store.push_back(keys::STATE_DIR, path(&values.state_dir))?;
        self.store
            .push_back(keys::RESULTS_DIR, path(&values.results_dir))?;
        if let Some(target) = &values.target_bin {
            self.store.push_back(keys::TARGET_BIN, path(target))?;
        }
        for arg in &values.target_args {
            self.store.push_back(keys::TARGET_ARGS, Value::str(arg.as_str()))?;
        }
        self.store.push_back(keys::CWD, path(&values.cwd))?;
        self.store
            .push_back(keys::FUZZER_ID, Value::str(values.fuzzer_id.as_str()))?;
        for (name, value) in &values.plugin_conf {
            self.store
                .push_back(keys::PLUGIN_CONF, Value::str(format!("{name}={value}")))?;
        }
        self.host_values = Some(values);
        Ok(())
    }

    fn clear_host_values(&mut self) {
        for key in HOST_KEYS {
            self.store.clear(key);
        }
    }

    fn clear_host_owned(&mut self) {
        self.clear_host_values();
        self.store.clear(keys::NUM_EXECS);
    }

    pub fn store(&self) -> &Store {
        &self.store
    }

    pub fn store_mut(&mut self) -> &mut Store {
        &mut self.store
    }

    pub fn stats(&self) -> &StatRecorder {
        &self.stats
    }

    pub fn stats_mut(&mut self) -> &mut StatRecorder {
        &mut self.stats
    }

    pub fn sink(&self) -> &dyn LogSink {
        &*self.sink
    }

    pub fn schema(&self) -> &KeySchema {
        &self.schema
    }

    pub fn host_values(&self) -> Option<&HostValues> {
        self.host_values.as_ref()
    }
}

struct PluginSlot {
    name: String,
    plugin: Box<dyn Plugin>,
    stage: Stage,
    state: PluginState,
    component: ComponentId,
    exec_time: StatHandle,
}

struct CoreStats {
    num_execs: StatHandle,
    iteration_time: StatHandle,
    core_time: StatHandle,
}

fn call_plugin(
    runtime: &mut HostRuntime,
    slot: &mut PluginSlot,
    phase: LifecyclePhase,
) -> Result<(), anyhow::Error> {
    let mut core = PluginCore::new(
        &slot.name,
        slot.component,
        &mut runtime.store,
        &mut runtime.stats,
        &*runtime.sink,
    );
    match phase {
        LifecyclePhase::Init => slot.plugin.init(&mut core),
        LifecyclePhase::Validate => slot.plugin.validate(&mut core),
        LifecyclePhase::DoWork => slot.plugin.do_work(&mut core),
        LifecyclePhase::Destroy => slot.plugin.destroy(&mut core),
    }
}

/// Drives a chain of plugins through their lifecycle.
///
/// Pre-loop plugins come first, then loop plugins, each group in the order it
/// was added. Every plugin is initialized, validated and destroyed; pre-loop
/// plugins only do work in the first iteration. Dropping a pipeline that was
/// not torn down tears it down, so every initialized plugin gets its
/// `destroy`.
pub struct Pipeline {
    runtime: HostRuntime,
    plugins: Vec<PluginSlot>,
    state: PipelineState,
    policy: FailurePolicy,
    avg_denominator: u64,
    shutdown: Arc<AtomicBool>,
    iterations: u64,
    core: CoreStats,
}

impl Pipeline {
    pub fn new(mut runtime: HostRuntime) -> Result<Self, DriverError> {
        let stats = &mut runtime.stats;
        let component = stats.add_component(CORE_COMPONENT)?;
        let number = |stats: &mut StatRecorder, tag: &str| {
            stats.add_stat(component, tag.as_bytes(), StatType::Number, 8)
        };
        let core = CoreStats {
            num_execs: number(stats, "total_num_execs")?,
            iteration_time: number(stats, "avg_iteration_time_ns")?,
            core_time: number(stats, "avg_core_time_ns")?,
        };
        let uptime = number(stats, "total_uptime_epoch_s")?;
        let now = SystemTime::now()
            .duration_since(UNIX_EPOCH)
            .map_or(0, |d| d.as_secs());
        stats.set_number(uptime, now)?;

        Ok(Self {
            runtime,
            plugins: Vec::new(),
            state: PipelineState::Assembling,
            policy: FailurePolicy::default(),
            avg_denominator: DEFAULT_AVG_DENOMINATOR,
            shutdown: Arc::new(AtomicBool::new(false)),
            iterations: 0,
            core,
        })
    }

    pub fn with_policy(mut self, policy: FailurePolicy) -> Self {
        self.policy = policy;
        self
    }

    /// Caps how many past samples the rolling averages weigh.
    pub fn with_avg_denominator(mut self, denominator: u64) -> Self {
        self.avg_denominator = denominator.max(1);
        self
    }

    /// Appends a loop plugin to the chain and registers its stat component.
    pub fn add_plugin(&mut self, plugin: Box<dyn Plugin>) -> Result<(), DriverError> {
        self.add_staged(plugin, Stage::Loop)
    }

    /// Adds a plugin that only works in the first iteration.
    ///
    /// It is placed after the pre-loop plugins added so far and before every
    /// loop plugin.
    pub fn add_pre_loop_plugin(&mut self, plugin: Box<dyn Plugin>) -> Result<(), DriverError> {
        self.add_staged(plugin, Stage::PreLoop)
    }

    fn add_staged(&mut self, plugin: Box<dyn Plugin>, stage: Stage) -> Result<(), DriverError> {
        self.expect_state(PipelineState::Assembling, "add a plugin")?;
        let name = plugin.name().to_string();
        let stats = &mut self.runtime.stats;
        let component = stats.add_component(&name)?;
        let exec_time = stats.add_stat(component, EXEC_TIME_STAT.as_bytes(), StatType::Number, 8)?;
        let position = match stage {
            Stage::Loop => self.plugins.len(),
            Stage::PreLoop => self
                .plugins
                .iter()
                .take_while(|slot| slot.stage == Stage::PreLoop)
                .count(),
        };
        log::debug!("Added {stage:?} plugin '{name}' at position {position}");
        self.plugins.insert(
            position,
            PluginSlot {
                name,
                plugin,
                stage,
                state: PluginState::Loaded,
                component,
                exec_time,
            },
        );
        Ok(())
    }

    pub fn state(&self) -> PipelineState {
        self.state
    }

    pub fn runtime(&self) -> &HostRuntime {
        &self.runtime
    }

    pub fn runtime_mut(&mut self) -> &mut HostRuntime {
        &mut self.runtime
    }

    pub fn iterations(&self) -> u64 {
        self.iterations
    }

    pub fn plugin_states(&self) -> Vec<(String, PluginState)> {
        self.plugins
            .iter()
            .map(|slot| (slot.name.clone(), slot.state))
            .collect()
    }

    /// Plugin names in calling order, with their stage.
    pub fn plugin_stages(&self) -> Vec<(String, Stage)> {
        self.plugins
            .iter()
            .map(|slot| (slot.name.clone(), slot.stage))
            .collect()
    }

    /// Flag checked between iterations. Setting it stops [`Pipeline::run`].
    pub fn shutdown_handle(&self) -> Arc<AtomicBool> {
        Arc::clone(&self.shutdown)
    }

    /// Calls `init` on every plugin, then `validate` on every plugin.
    ///
    /// On failure every plugin that completed `init` is destroyed in reverse
    /// order before the error is returned, and the pipeline is torn down.
    pub fn setup(&mut self) -> Result<(), DriverError> {
        self.expect_state(PipelineState::Assembling, "set up")?;
        self.register_host_stats()?;

        for phase in [LifecyclePhase::Init, LifecyclePhase::Validate] {
            for index in 0..self.plugins.len() {
                if self.shutdown.load(Ordering::SeqCst) {
                    log::warn!("Shutdown requested during {phase}, aborting startup");
                    self.abort_setup();
                    return Err(DriverError::Interrupted);
                }

                let slot = &mut self.plugins[index];
                log::debug!("Calling {phase} on '{}'", slot.name);
                if let Err(error) = call_plugin(&mut self.runtime, slot, phase) {
                    let plugin = slot.name.clone();
                    log::error!("Plugin '{plugin}' failed during {phase}: {error:#}");
                    self.abort_setup();
                    return Err(DriverError::Setup {
                        plugin,
                        phase,
                        error,
                    });
                }
                slot.state = match phase {
                    LifecyclePhase::Init => PluginState::Initialized,
                    _ => PluginState::Validated,
                };
            }
        }

        self.runtime.stats.set_state(CoreState::Fuzzing)?;
        self.state = PipelineState::Ready;
        log::info!("Pipeline ready with {} plugin(s)", self.plugins.len());
        Ok(())
    }

    /// Runs every plugin's `do_work` once, in order. Pre-loop plugins only
    /// take part in the first iteration.
    ///
    /// A failing plugin ends the iteration early; the failure is logged
    /// through the sink and returned, it is not an `Err`.
    pub fn run_iteration(&mut self) -> Result<IterationOutcome, DriverError> {
        self.expect_state(PipelineState::Ready, "run an iteration")?;
        let iteration_start = Instant::now();
        self.iterations += 1;
        let first = self.iterations == 1;
        let denominator = self.iterations.min(self.avg_denominator);
        self.publish_num_execs()?;

        let mut plugin_time = Duration::ZERO;
        let mut failure = None;
        for slot in self.plugins.iter_mut() {
            if slot.stage == Stage::PreLoop && !first {
                continue;
            }
            slot.state = PluginState::Running;
            let start = Instant::now();
            let result = call_plugin(&mut self.runtime, slot, LifecyclePhase::DoWork);
            let elapsed = start.elapsed();
            plugin_time += elapsed;

            let stats = &mut self.runtime.stats;
            let avg = stats.number(slot.exec_time)?;
            stats.set_number(
                slot.exec_time,
                update_average(avg, elapsed.as_nanos() as u64, denominator),
            )?;

            if let Err(error) = result {
                failure = Some((slot.name.clone(), error));
                break;
            }
        }

        self.record_iteration(iteration_start.elapsed(), plugin_time, denominator)?;

        match failure {
            None => Ok(IterationOutcome::Completed),
            Some((plugin, error)) => {
                let message = format!("Iteration {} abandoned: {error:#}", self.iterations);
                self.runtime
                    .sink
                    .log(&plugin, LogLevel::Error, message.as_bytes());
                Ok(IterationOutcome::Failed { plugin, error })
            }
        }
    }

    /// Iterates until the shutdown flag is set or `limit` iterations ran.
    pub fn run(&mut self, limit: Option<u64>) -> Result<RunSummary, DriverError> {
        self.expect_state(PipelineState::Ready, "run")?;
        let mut summary = RunSummary::default();
        loop {
            if self.shutdown.load(Ordering::SeqCst) {
                log::info!("Shutdown requested after {} iteration(s)", summary.iterations);
                summary.interrupted = true;
                break;
            }
            if limit.is_some_and(|limit| summary.iterations >= limit) {
                break;
            }

            let outcome = self.run_iteration()?;
            summary.iterations += 1;
            if let IterationOutcome::Failed { plugin, error } = outcome {
                summary.failures += 1;
                if self.policy == FailurePolicy::Abort {
                    return Err(DriverError::Aborted {
                        iteration: self.iterations,
                        plugin,
                        error,
                    });
                }
            }
        }
        Ok(summary)
    }

    /// Marks the stat region `Exiting` and destroys every initialized plugin
    /// in reverse order. A failing `destroy` never stops the others.
    ///
    /// Calling it again is a no-op.
    pub fn teardown(&mut self) -> TeardownReport {
        let mut report = TeardownReport::default();
        if self.state == PipelineState::TornDown {
            return report;
        }
        self.state = PipelineState::TornDown;

        if let Err(e) = self.runtime.stats.set_state(CoreState::Exiting) {
            log::warn!("Could not mark stats as exiting: {e}");
        }

        for slot in self.plugins.iter_mut().rev() {
            if !slot.state.needs_destroy() {
                continue;
            }
            log::debug!("Calling destroy on '{}'", slot.name);
            if let Err(error) = call_plugin(&mut self.runtime, slot, LifecyclePhase::Destroy) {
                log::warn!("Plugin '{}' failed during destroy: {error:#}", slot.name);
                report.failures.push((slot.name.clone(), error));
            }
            slot.state = PluginState::Destroyed;
        }

        self.runtime.clear_host_owned();
        report.leaked = self.runtime.store.leaked();
        for (key, count) in &report.leaked {
            log::warn!("Store key '{key}' still holds {count} value(s) at teardown");
        }
        log::info!("Pipeline torn down after {} iteration(s)", self.iterations);
        report
    }

    fn abort_setup(&mut self) {
        let report = self.teardown();
        for (plugin, error) in &report.failures {
            log::warn!("Destroy of '{plugin}' failed while aborting startup: {error:#}");
        }
    }

    fn expect_state(&self, expected: PipelineState, action: &'static str) -> Result<(), DriverError> {
        if self.state != expected {
            return Err(DriverError::InvalidState {
                state: self.state,
                action,
            });
        }
        Ok(())
    }

    fn publish_num_execs(&mut self) -> Result<(), DriverError> {
        let count = self.iterations as usize;
        match self
            .runtime
            .store
            .get_mut(keys::NUM_EXECS, 0)
            .and_then(Value::as_tuple_mut)
        {
            Some(tuple) => tuple.first = count,
            None => self
                .runtime
                .store
                .push_back(keys::NUM_EXECS, CTuple::new(count, 0).into())?,
        }
        self.runtime
            .stats
            .set_number(self.core.num_execs, self.iterations)?;
        Ok(())
    }

    fn record_iteration(
        &mut self,
        total: Duration,
        plugin_time: Duration,
        denominator: u64,
    ) -> Result<(), DriverError> {
        let stats = &mut self.runtime.stats;
        let total_ns = total.as_nanos() as u64;
        let core_ns = total.saturating_sub(plugin_time).as_nanos() as u64;

        let avg = stats.number(self.core.iteration_time)?;
        stats.set_number(
            self.core.iteration_time,
            update_average(avg, total_ns, denominator),
        )?;
        let avg = stats.number(self.core.core_time)?;
        stats.set_number(self.core.core_time, update_average(avg, core_ns, denominator))?;
        Ok(())
    }

    /// One-off stats describing the host, taken from the published values.
    fn register_host_stats(&mut self) -> Result<(), DriverError> {
        let Some(values) = self.runtime.host_values.clone() else {
            return Ok(());
        };
        let stats = &mut self.runtime.stats;
        let core = stats.add_component(CORE_COMPONENT)?;

        let cwd = values.cwd.to_string_lossy().into_owned();
        for (tag, text) in [("working_dir", cwd), ("cmd_line", values.cmd_line())] {
            let Ok(capacity) = u16::try_from(text.len()) else {
                log::warn!("Skipping stat '{tag}', value is too long");
                continue;
            };
            let handle = stats.add_stat(core, tag.as_bytes(), StatType::Str, capacity)?;
            stats.set_str(handle, &text)?;
        }

        if let Some(target) = &values.target_bin {
            match std::fs::read(target) {
                Ok(contents) => {
                    let digest = md5::compute(&contents);
                    let handle = stats.add_stat(core, b"target_md5_hex", StatType::Bytes, 16)?;
                    stats.set_bytes(handle, &digest.0)?;
                }
                Err(e) => log::warn!("Cannot hash target {target:?}: {e}"),
            }
        }
        Ok(())
    }
}

impl Drop for Pipeline {
    fn drop(&mut self) {
        if self.state != PipelineState::TornDown {
            let report = self.teardown();
            for (plugin, error) in &report.failures {
                log::warn!("Destroy of '{plugin}' failed on drop: {error:#}");
            }
        }
    }
}
