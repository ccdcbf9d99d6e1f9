use super::PuppetError;
use crate::abi::{NameMapTable, ProcMapTable, TransferBlock};
use libloading::Library;
use std::{
    os::raw::{c_char, c_int},
    path::Path,
};
use tracing::{debug, warn};

pub type MainFn = unsafe extern "C" fn(c_int, *mut *mut c_char) -> c_int;
pub type SetContextsFn = unsafe extern "C" fn(*const TransferBlock);
pub type SetProcMapFn = unsafe extern "C" fn(*const ProcMapTable);
pub type SetNameMapFn = unsafe extern "C" fn(*const NameMapTable);
pub type SetStopFn = unsafe extern "C" fn(*const c_int);

/// Entry points a hosted unit exposes, resolved once.
#[derive(Clone, Copy)]
pub struct ModuleHooks {
    pub main: MainFn,
    pub set_contexts: SetContextsFn,
    pub set_procmap: SetProcMapFn,
    pub set_stop: SetStopFn,
    pub set_namemap: Option<SetNameMapFn>,
}

pub const MAIN: &[u8] = b"main\0";
pub const SET_CONTEXTS: &[u8] = b"marionette_set_contexts\0";
pub const SET_PROCMAP: &[u8] = b"marionette_set_procmap\0";
pub const SET_STOP: &[u8] = b"marionette_set_stop\0";
pub const SET_NAMEMAP: &[u8] = b"marionette_set_namemap\0";

pub struct Module {
    name: String,
    hooks: ModuleHooks,
    // dropped last so the hooks never outlive the code they point into
    _library: Option<Library>,
}

fn symbol_name(symbol: &[u8]) -> String {
    String::from_utf8_lossy(symbol.strip_suffix(b"\0").unwrap_or(symbol)).into_owned()
}

impl Module {
    pub fn load(path: &Path) -> Result<Self, PuppetError> {
        let library = unsafe { Library::new(path) }.map_err(|error| PuppetError::Load {
            path: path.to_path_buf(),
            message: error.to_string(),
        })?;

        let hooks = unsafe {
            ModuleHooks {
                main: lookup(&library, path, MAIN)?,
                set_contexts: lookup(&library, path, SET_CONTEXTS)?,
                set_procmap: lookup(&library, path, SET_PROCMAP)?,
                set_stop: lookup(&library, path, SET_STOP)?,
                set_namemap: match lookup(&library, path, SET_NAMEMAP) {
                    Ok(hook) => Some(hook),
                    Err(error) => {
                        warn!(error = %error, "Module does not accept a name map");
                        None
                    }
                },
            }
        };

        debug!("Loaded module {}", path.display());

        Ok(Self {
            name: path
                .file_name()
                .map(|name| name.to_string_lossy().into_owned())
                .unwrap_or_else(|| path.display().to_string()),
            hooks,
            _library: Some(library),
        })
    }

    /// Unit linked into the running image.
    pub fn from_hooks(name: &str, hooks: ModuleHooks) -> Self {
        Self {
            name: name.to_string(),
            hooks,
            _library: None,
        }
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn hooks(&self) -> &ModuleHooks {
        &self.hooks
    }
}

unsafe fn lookup<T: Copy>(library: &Library, path: &Path, symbol: &[u8]) -> Result<T, PuppetError> {
    library
        .get::<T>(symbol)
        .map(|found| *found)
        .map_err(|error| PuppetError::Symbol {
            path: path.to_path_buf(),
            symbol: symbol_name(symbol),
            message: error.to_string(),
        })
}
