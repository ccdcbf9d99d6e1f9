//! A hosted program driven as a coroutine.
//!
//! The program's `main` runs on the coroutine stack. Whenever it calls back
//! into the engine to yield, control returns to whoever called
//! [`Puppet::proceed`]; when `main` returns, the next `proceed` calls it again
//! with the same arguments.

pub mod module;

pub use module::{Module, ModuleHooks};

use crate::{
    abi::{self, NameMapTable, ProcMapBinding, ProcMapTable},
    comm::Communicator,
    coroutine::{Coroutine, CoroutineError},
    diagnostics,
    namemap::NameMap,
    procmap::ProcessMap,
};
use std::{
    cell::RefCell,
    ffi::CString,
    mem,
    os::raw::{c_char, c_int},
    path::{Path, PathBuf},
    ptr,
    rc::Rc,
    time::Duration,
};
use thiserror::Error;
use tracing::{debug, info, instrument, warn};

#[derive(Error, Debug)]
pub enum PuppetError {
    #[error("Could not load {path}: {message}")]
    Load { path: PathBuf, message: String },
    #[error("{path} does not export {symbol}: {message}")]
    Symbol {
        path: PathBuf,
        symbol: String,
        message: String,
    },
    #[error("Argument {0:?} contains a NUL byte")]
    Argument(String),
    #[error(transparent)]
    Coroutine(#[from] CoroutineError),
}

struct Argv {
    strings: Vec<CString>,
}

impl Argv {
    fn new(name: &str, args: &[String]) -> Result<Self, PuppetError> {
        let strings = std::iter::once(name)
            .chain(args.iter().map(String::as_str))
            .map(|arg| CString::new(arg).map_err(|_| PuppetError::Argument(arg.to_string())))
            .collect::<Result<_, _>>()?;

        Ok(Self { strings })
    }

    /// fresh pointer array for every call, `main` may rearrange it
    fn pointers(&self) -> Vec<*mut c_char> {
        self.strings
            .iter()
            .map(|arg| arg.as_ptr() as *mut c_char)
            .chain(std::iter::once(ptr::null_mut()))
            .collect()
    }
}

pub struct Puppet<C: Communicator> {
    coroutine: Option<Coroutine>,
    procmap: Box<ProcMapBinding<C>>,
    procmap_table: Box<ProcMapTable>,
    namemap_table: Box<NameMapTable>,
    _namemap: Rc<RefCell<NameMap>>,
    module: Module,
}

impl<C: Communicator> Puppet<C> {
    pub fn new(
        path: &Path,
        args: &[String],
        procmap: Rc<ProcessMap<C>>,
        namemap: Rc<RefCell<NameMap>>,
        stack_size: usize,
    ) -> Result<Self, PuppetError> {
        let module = Module::load(path)?;

        Self::with_module(module, args, procmap, namemap, stack_size)
    }

    #[instrument(skip_all, fields(module = module.name()))]
    pub fn with_module(
        module: Module,
        args: &[String],
        procmap: Rc<ProcessMap<C>>,
        namemap: Rc<RefCell<NameMap>>,
        stack_size: usize,
    ) -> Result<Self, PuppetError> {
        let argv = Argv::new(module.name(), args)?;
        let main = module.hooks().main;

        let coroutine = Coroutine::new(module.name(), stack_size, move |_| {
            let mut pointers = argv.pointers();
            let argc = (pointers.len() - 1) as c_int;
            unsafe { main(argc, pointers.as_mut_ptr()) }
        })?;

        let procmap = Box::new(ProcMapBinding::new(procmap));
        let procmap_table = Box::new(procmap.table());
        let namemap_table = Box::new(abi::namemap_table(&namemap));

        let puppet = Self {
            coroutine: Some(coroutine),
            procmap,
            procmap_table,
            namemap_table,
            _namemap: namemap,
            module,
        };
        puppet.bind();

        debug!(args = args.len(), "Puppet ready");

        Ok(puppet)
    }

    /// Hand the engine's tables to the module. Several units linked into
    /// one image share the guest globals, so this is repeated before every run.
    fn bind(&self) {
        let hooks = self.module.hooks();
        unsafe {
            if let Some(coroutine) = &self.coroutine {
                (hooks.set_contexts)(coroutine.transfer_block());
                (hooks.set_stop)(coroutine.stop_flag());
            }
            (hooks.set_procmap)(&*self.procmap_table);
            if let Some(set_namemap) = hooks.set_namemap {
                set_namemap(&*self.namemap_table);
            }
        }
    }

    /// Run until the program yields or `main` returns; `true` if it yielded.
    pub fn proceed(&mut self) -> bool {
        self.bind();
        diagnostics::set_active(self.module.name(), self.procmap.procmap.group());

        let running = match self.coroutine.as_mut() {
            Some(coroutine) => {
                coroutine.proceed();
                coroutine.running()
            }
            None => false,
        };

        diagnostics::clear_active();

        running
    }

    pub fn name(&self) -> &str {
        self.module.name()
    }

    pub fn running(&self) -> bool {
        self.coroutine.as_ref().map_or(false, Coroutine::running)
    }

    /// last value `main` returned, `-1` before it first returned
    pub fn result(&self) -> i32 {
        self.coroutine.as_ref().map_or(-1, Coroutine::result)
    }

    pub fn total_time(&self) -> Duration {
        self.coroutine
            .as_ref()
            .map_or(Duration::ZERO, Coroutine::total_time)
    }

    pub fn signal_stop(&self) {
        if let Some(coroutine) = &self.coroutine {
            coroutine.signal_stop();
        }
    }

    pub fn is_finished(&self) -> bool {
        self.coroutine.as_ref().map_or(true, Coroutine::is_finished)
    }
}

impl<C: Communicator> Drop for Puppet<C> {
    fn drop(&mut self) {
        if self.running() {
            info!("Stopping {} before unloading it", self.name());
            self.signal_stop();
            self.proceed();
        }

        if let Some(coroutine) = self.coroutine.take() {
            if coroutine.running() {
                // unwinding through the hosted program's frames is not an option
                warn!(
                    "{} ignored the stop request, leaking its stack",
                    self.module.name()
                );
                mem::forget(coroutine);
            }
        }
    }
}
