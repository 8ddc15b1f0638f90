//! Loading plugin modules from shared libraries.
//!
//! A module exports five variables:
//!
//! ```c
//! const char *const __PluginName = "my_plugin";
//! PluginInitFn __PluginInitFnPtr = my_init;
//! PluginCallbackFn __PluginValidateFnPtr = my_validate;
//! PluginCallbackFn __PluginDoWorkFnPtr = my_do_work;
//! PluginCallbackFn __PluginDestroyFnPtr = my_destroy;
//! ```
//!
//! `__PluginName` is a pointer to the name, not the characters themselves,
//! so its symbol is dereferenced twice. A Rust module exporting a
//! `&'static str` with a trailing NUL has the same first word and loads too.

use crate::ffi::{
    ForeignPlugin, PluginCallbackFn, PluginCallbacks, PluginInitFn, SYMBOL_PLUGIN_DESTROY,
    SYMBOL_PLUGIN_DO_WORK, SYMBOL_PLUGIN_INIT, SYMBOL_PLUGIN_NAME, SYMBOL_PLUGIN_VALIDATE,
};
use crate::plugin::{Plugin, PluginCore};
use libloading::Library;
use std::ffi::{CStr, c_char};
use std::path::{Path, PathBuf};
use thiserror::Error;

#[derive(Error, Debug)]
pub enum LoadError {
    #[error("Failed to open plugin module {path:?}: {source}")]
    Open {
        path: PathBuf,
        #[source]
        source: libloading::Error,
    },
    /// Every required export that was absent or null, not just the first one.
    #[error("Plugin module {path:?} is missing required symbols: {}", .missing.join(", "))]
    MissingSymbols {
        path: PathBuf,
        missing: Vec<&'static str>,
    },
}

/// Reads a callback out of an exported function-pointer variable.
///
/// Records the symbol in `$missing` when it is absent or holds null.
macro_rules! resolve_callback {
    ($library:expr, $symbol:expr, $fn_type:ty, $missing:expr) => {{
        // SAFETY: plugin modules export these symbols as variables holding a
        // nullable function pointer of exactly this type.
        match unsafe { $library.get::<*const Option<$fn_type>>($symbol.as_bytes()) } {
            Ok(symbol) if !(*symbol).is_null() => {
                let callback = unsafe { **symbol };
                if callback.is_none() {
                    $missing.push($symbol);
                }
                callback
            }
            _ => {
                $missing.push($symbol);
                None
            }
        }
    }};
}

/// A plugin living in a dynamically loaded module.
pub struct DynamicPlugin {
    plugin: ForeignPlugin,
    path: PathBuf,
    // Must outlive the callbacks held by `plugin`; fields drop in order.
    _library: Library,
}

impl DynamicPlugin {
    /// Opens the module at `path` and resolves its name and four callbacks.
    pub fn load(path: impl AsRef<Path>) -> Result<Self, LoadError> {
        let path = path.as_ref().to_path_buf();
        // SAFETY: opening a module runs its initialisers. Plugin modules are
        // trusted extensions of the host.
        let library = unsafe { Library::new(&path) }.map_err(|source| LoadError::Open {
            path: path.clone(),
            source,
        })?;

        let mut missing = Vec::new();
        let name = read_name(&library);
        if name.is_none() {
            missing.push(SYMBOL_PLUGIN_NAME);
        }
        let init = resolve_callback!(library, SYMBOL_PLUGIN_INIT, PluginInitFn, missing);
        let validate = resolve_callback!(library, SYMBOL_PLUGIN_VALIDATE, PluginCallbackFn, missing);
        let do_work = resolve_callback!(library, SYMBOL_PLUGIN_DO_WORK, PluginCallbackFn, missing);
        let destroy = resolve_callback!(library, SYMBOL_PLUGIN_DESTROY, PluginCallbackFn, missing);

        let (Some(name), Some(init), Some(validate), Some(do_work), Some(destroy)) =
            (name, init, validate, do_work, destroy)
        else {
            return Err(LoadError::MissingSymbols { path, missing });
        };

        log::debug!("Loaded plugin '{name}' from {path:?}");
        let callbacks = PluginCallbacks {
            init,
            validate,
            do_work,
            destroy,
        };
        // SAFETY: the module exports the plugin contract's symbols, so its
        // callbacks follow that contract.
        let plugin = unsafe { ForeignPlugin::new(name, callbacks) };
        Ok(Self {
            plugin,
            path,
            _library: library,
        })
    }

    pub fn path(&self) -> &Path {
        &self.path
    }
}

/// The module's name, read through the `__PluginName` pointer variable.
fn read_name(library: &Library) -> Option<String> {
    // SAFETY: the symbol is a variable holding a pointer to the name.
    let symbol =
        unsafe { library.get::<*const *const c_char>(SYMBOL_PLUGIN_NAME.as_bytes()) }.ok()?;
    let variable = *symbol;
    if variable.is_null() {
        return None;
    }
    // SAFETY: the variable is a live, aligned pointer inside the module.
    let name = unsafe { *variable };
    if name.is_null() {
        return None;
    }
    // SAFETY: exported names are NUL terminated.
    let name = unsafe { CStr::from_ptr(name) };
    Some(name.to_string_lossy().into_owned())
}

impl Plugin for DynamicPlugin {
    fn name(&self) -> &str {
        self.plugin.name()
    }

    fn init(&mut self, core: &mut PluginCore<'_>) -> Result<(), anyhow::Error> {
        self.plugin.init(core)
    }

    fn validate(&mut self, core: &mut PluginCore<'_>) -> Result<(), anyhow::Error> {
        self.plugin.validate(core)
    }

    fn do_work(&mut self, core: &mut PluginCore<'_>) -> Result<(), anyhow::Error> {
        self.plugin.do_work(core)
    }

    fn destroy(&mut self, core: &mut PluginCore<'_>) -> Result<(), anyhow::Error> {
        self.plugin.destroy(core)
    }
}
