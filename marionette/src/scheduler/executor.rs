use super::JobContext;
use crate::{
    comm::Communicator,
    namemap::NameMap,
    puppet::{Module, ModuleHooks, Puppet, PuppetError},
};
use std::{cell::RefCell, collections::BTreeMap, path::PathBuf, rc::Rc};
use thiserror::Error;
use tracing::{debug, info, instrument};

#[derive(Error, Debug)]
pub enum ExecutorError {
    #[error("No function called {0}")]
    UnknownFunction(String),
    #[error("Function {function} failed: {message}")]
    Failed { function: String, message: String },
    #[error(transparent)]
    Puppet(#[from] PuppetError),
}

/// Runs the unit of work a job names.
pub trait Executor<C: Communicator> {
    /// `Ok(None)` when the job has no result to report.
    fn execute(&mut self, function: &str, context: &JobContext<'_, C>) -> Result<Option<f64>, ExecutorError>;
}

type JobFunction<C> = Box<dyn FnMut(&JobContext<'_, C>) -> Result<Option<f64>, ExecutorError>>;

/// Functions registered by name in the running program.
pub struct FunctionRegistry<C: Communicator> {
    functions: BTreeMap<String, JobFunction<C>>,
}

impl<C: Communicator> Default for FunctionRegistry<C> {
    fn default() -> Self {
        Self {
            functions: BTreeMap::new(),
        }
    }
}

impl<C: Communicator> FunctionRegistry<C> {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn register<F>(&mut self, name: &str, function: F) -> &mut Self
    where
        F: FnMut(&JobContext<'_, C>) -> Result<Option<f64>, ExecutorError> + 'static,
    {
        self.functions.insert(name.to_string(), Box::new(function));
        self
    }
}

impl<C: Communicator> Executor<C> for FunctionRegistry<C> {
    fn execute(&mut self, function: &str, context: &JobContext<'_, C>) -> Result<Option<f64>, ExecutorError> {
        let body = self
            .functions
            .get_mut(function)
            .ok_or_else(|| ExecutorError::UnknownFunction(function.to_string()))?;

        body(context)
    }
}

/// Runs the function as a puppet command line (`module arg...`) until its
/// `main` returns once; the job result is `main`'s return value.
pub struct PuppetExecutor {
    prefix: PathBuf,
    stack_size: usize,
    namemap: Rc<RefCell<NameMap>>,
    linked: BTreeMap<String, ModuleHooks>,
}

impl PuppetExecutor {
    pub fn new(prefix: PathBuf, stack_size: usize, namemap: Rc<RefCell<NameMap>>) -> Self {
        Self {
            prefix,
            stack_size,
            namemap,
            linked: BTreeMap::new(),
        }
    }

    /// Resolve `name` to hooks compiled into this image instead of a library.
    pub fn link(&mut self, name: &str, hooks: ModuleHooks) -> &mut Self {
        self.linked.insert(name.to_string(), hooks);
        self
    }
}

impl<C: Communicator> Executor<C> for PuppetExecutor {
    #[instrument(skip(self, context), fields(job = context.name()))]
    fn execute(&mut self, function: &str, context: &JobContext<'_, C>) -> Result<Option<f64>, ExecutorError> {
        let mut words = function.split_whitespace();
        let program = words
            .next()
            .ok_or_else(|| ExecutorError::UnknownFunction(function.to_string()))?;
        let args: Vec<String> = words.map(str::to_string).collect();

        let module = match self.linked.get(program) {
            Some(hooks) => Module::from_hooks(program, *hooks),
            None => Module::load(&self.prefix.join(program))?,
        };

        let mut puppet = Puppet::with_module(
            module,
            &args,
            context.procmap_rc(),
            self.namemap.clone(),
            self.stack_size,
        )?;

        let mut rounds = 0;
        while puppet.proceed() {
            rounds += 1;
        }
        debug!(rounds, "Puppet yielded before returning");

        let result = puppet.result();
        info!(result, "Puppet {program} returned");

        Ok(Some(result as f64))
    }
}
