use crate::log::{LogLevel, LogSink};
use crate::stats::{ComponentId, StatError, StatHandle, StatRecorder, StatType};
use crate::store::{Store, StoreError};
use crate::value::{Value, ValueKind};

/// One stage of the fuzzing pipeline.
///
/// The host calls `init` once on every plugin, then `validate` once on every
/// plugin, then `do_work` once per iteration in registration order, and
/// finally `destroy` once in reverse order. Every call receives a
/// [`PluginCore`] scoped to that call; it is the plugin's only way to reach
/// the store, the stat region and the log.
///
/// A plugin that wants to keep state between calls keeps it in `self`.
pub trait Plugin {
    /// Name used for logging, stat components and error reports.
    fn name(&self) -> &str;

    /// Declares the store keys this plugin produces and registers its stats.
    fn init(&mut self, core: &mut PluginCore<'_>) -> Result<(), anyhow::Error>;

    /// Runs after every plugin's `init`. Keys declared by others exist now.
    fn validate(&mut self, _core: &mut PluginCore<'_>) -> Result<(), anyhow::Error> {
        Ok(())
    }

    /// One unit of work for the current iteration. Must block until done.
    fn do_work(&mut self, core: &mut PluginCore<'_>) -> Result<(), anyhow::Error>;

    /// Releases whatever `init` acquired. Called even if others failed.
    fn destroy(&mut self, _core: &mut PluginCore<'_>) -> Result<(), anyhow::Error> {
        Ok(())
    }
}

/// The host interface handed to a plugin for the duration of one callback.
pub struct PluginCore<'a> {
    name: &'a str,
    component: ComponentId,
    store: &'a mut Store,
    stats: &'a mut StatRecorder,
    sink: &'a dyn LogSink,
}

impl<'a> PluginCore<'a> {
    pub fn new(
        name: &'a str,
        component: ComponentId,
        store: &'a mut Store,
        stats: &'a mut StatRecorder,
        sink: &'a dyn LogSink,
    ) -> Self {
        Self {
            name,
            component,
            store,
            stats,
            sink,
        }
    }

    pub fn name(&self) -> &str {
        self.name
    }

    /// Declares the kind of every value that may be pushed under `key`.
    pub fn declare(&mut self, key: impl AsRef<[u8]>, kind: ValueKind) -> Result<(), StoreError> {
        self.store.declare(key, kind)
    }

    pub fn push_back(
        &mut self,
        key: impl AsRef<[u8]>,
        value: impl Into<Value>,
    ) -> Result<(), StoreError> {
        self.store.push_back(key, value.into())
    }

    pub fn push_front(
        &mut self,
        key: impl AsRef<[u8]>,
        value: impl Into<Value>,
    ) -> Result<(), StoreError> {
        self.store.push_front(key, value.into())
    }

    pub fn pop_back(&mut self, key: impl AsRef<[u8]>) -> Option<Value> {
        self.store.pop_back(key)
    }

    pub fn pop_front(&mut self, key: impl AsRef<[u8]>) -> Option<Value> {
        self.store.pop_front(key)
    }

    pub fn get(&self, key: impl AsRef<[u8]>, index: usize) -> Option<&Value> {
        self.store.get(key, index)
    }

    pub fn get_mut(&mut self, key: impl AsRef<[u8]>, index: usize) -> Option<&mut Value> {
        self.store.get_mut(key, index)
    }

    pub fn len(&self, key: impl AsRef<[u8]>) -> usize {
        self.store.len(key)
    }

    pub fn is_empty(&self, key: impl AsRef<[u8]>) -> bool {
        self.store.is_empty(key)
    }

    /// Read access to the whole store, for helpers such as
    /// [`crate::keys::conf_value`].
    pub fn store(&self) -> &Store {
        &*self.store
    }

    pub fn log(&self, level: LogLevel, message: impl AsRef<[u8]>) {
        self.sink.log(self.name, level, message.as_ref());
    }

    /// Registers a stat under this plugin's component.
    pub fn add_stat(
        &mut self,
        tag: impl AsRef<[u8]>,
        stat_type: StatType,
        size_required: u16,
    ) -> Result<StatHandle, StatError> {
        self.stats
            .add_stat(self.component, tag.as_ref(), stat_type, size_required)
    }

    /// Direct access to the recorder for writing registered stats.
    pub fn stats(&mut self) -> &mut StatRecorder {
        &mut *self.stats
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::log::MemorySink;
    use crate::stats::{CORE_COMPONENT, StatSnapshot, StatValue};

    #[test]
    fn core_routes_to_store_stats_and_log() {
        let mut store = Store::new();
        let mut stats = StatRecorder::anonymous(1024).unwrap();
        let component = stats.add_component("p").unwrap();
        let sink = MemorySink::new();

        {
            let mut core = PluginCore::new("p", component, &mut store, &mut stats, &sink);
            core.declare("x", ValueKind::Buffer).unwrap();
            core.push_back("x", b"abc".to_vec()).unwrap();
            assert!(core.push_back("x", "not a buffer").is_err());
            core.log(LogLevel::Info, "hello");

            let h = core.add_stat("total_hits", StatType::Number, 8).unwrap();
            core.stats().set_number(h, 3).unwrap();
        }

        assert_eq!(store.len("x"), 1);
        assert_eq!(sink.records()[0].source, "p");
        let snapshot = StatSnapshot::parse(stats.as_bytes()).unwrap();
        assert_eq!(snapshot.get("p", "total_hits"), Some(&StatValue::Number(3)));
        assert_eq!(snapshot.get(CORE_COMPONENT, "total_hits"), None);
    }
}
