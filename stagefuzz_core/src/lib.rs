pub mod builtin;
pub mod config;
pub mod driver;
pub mod ffi;
pub mod keys;
pub mod loader;
pub mod log;
pub mod plugin;
pub mod stats;
pub mod store;
pub mod value;

pub use config::{HostConfig, PluginEntry};
pub use driver::{
    DriverError, FailurePolicy, HostRuntime, HostValues, IterationOutcome, Pipeline, PluginState,
    RunSummary, Stage, TeardownReport,
};
pub use keys::KeySchema;
pub use loader::{DynamicPlugin, LoadError};
pub use log::{FacadeSink, LogLevel, LogSink, MemorySink};
pub use plugin::{Plugin, PluginCore};
pub use stats::{CoreState, StatError, StatRecorder, StatSnapshot, StatType};
pub use store::{Store, StoreError};
pub use value::{ExitStatus, Value, ValueKind};
