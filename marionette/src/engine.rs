//! Entry point for programs hosting puppets.

use crate::{
    comm::Communicator,
    config::{ConfigErrors, EngineConfig},
    diagnostics, logging,
    namemap::NameMap,
    procmap::{ProcMapError, ProcessMap},
    puppet::{Module, Puppet, PuppetError},
    scheduler::{PuppetExecutor, Scheduler, SchedulerError},
};
use std::{cell::RefCell, path::PathBuf, rc::Rc};
use thiserror::Error;
use tracing::{info, instrument};

#[derive(Error, Debug)]
pub enum EngineError {
    #[error(transparent)]
    Config(#[from] ConfigErrors),
    #[error(transparent)]
    ProcMap(#[from] ProcMapError),
    #[error(transparent)]
    Puppet(#[from] PuppetError),
    #[error(transparent)]
    Scheduler(#[from] SchedulerError),
    #[error("Empty command line")]
    EmptyCommandLine,
    #[error("No puppet called {0} is configured")]
    UnknownPuppet(String),
}

pub struct Engine<C: Communicator> {
    config: EngineConfig,
    procmap: Rc<ProcessMap<C>>,
    namemap: Rc<RefCell<NameMap>>,
}

impl<C: Communicator> Engine<C> {
    /// Collective over `world`: partitions it into the configured groups.
    #[instrument(skip_all)]
    pub fn new(world: C, mut config: EngineConfig) -> Result<Self, EngineError> {
        logging::initialize(&config.log);
        diagnostics::install_panic_hook();
        config.preflight_checks()?;

        let groups = config.group_spec(world.size())?;
        let procmap = ProcessMap::new(world, groups)?;
        info!(
            rank = procmap.world_rank(),
            group = procmap.group(),
            "Engine ready"
        );

        Ok(Self {
            config,
            procmap: Rc::new(procmap),
            namemap: Rc::new(RefCell::new(NameMap::new())),
        })
    }

    pub fn config(&self) -> &EngineConfig {
        &self.config
    }

    pub fn procmap(&self) -> &Rc<ProcessMap<C>> {
        &self.procmap
    }

    pub fn namemap(&self) -> &Rc<RefCell<NameMap>> {
        &self.namemap
    }

    fn resolve(&self, program: &str) -> PathBuf {
        match &self.config.prefix {
            Some(prefix) => prefix.join(program),
            None => PathBuf::from(program),
        }
    }

    fn split(command_line: &str) -> Result<(&str, Vec<String>), EngineError> {
        let mut words = command_line.split_whitespace();
        let program = words.next().ok_or(EngineError::EmptyCommandLine)?;

        Ok((program, words.map(str::to_string).collect()))
    }

    /// Load `program arg...` as a puppet bound to this rank's group.
    pub fn load(&self, command_line: &str) -> Result<Puppet<C>, EngineError> {
        let (program, args) = Self::split(command_line)?;

        Ok(Puppet::new(
            &self.resolve(program),
            &args,
            self.procmap.clone(),
            self.namemap.clone(),
            self.config.stack_size,
        )?)
    }

    /// Puppet from the `puppets` table of the config.
    pub fn load_named(&self, name: &str) -> Result<Puppet<C>, EngineError> {
        let command_line = self
            .config
            .puppets
            .get(name)
            .ok_or_else(|| EngineError::UnknownPuppet(name.to_string()))?;

        self.load(command_line)
    }

    /// Like [`Engine::load`] for a unit compiled into the host image; the
    /// first word of `command_line` only names it.
    pub fn load_linked(&self, module: Module, command_line: &str) -> Result<Puppet<C>, EngineError> {
        let (_, args) = Self::split(command_line)?;

        Ok(Puppet::with_module(
            module,
            &args,
            self.procmap.clone(),
            self.namemap.clone(),
            self.config.stack_size,
        )?)
    }

    /// Collective over this rank's group.
    pub fn scheduler(&self) -> Result<Scheduler<C>, EngineError> {
        Ok(Scheduler::new(self.procmap.clone())?)
    }

    /// Executor running puppets resolved like [`Engine::load`], sharing this engine's name map.
    pub fn puppet_executor(&self) -> PuppetExecutor {
        PuppetExecutor::new(
            self.config.prefix.clone().unwrap_or_default(),
            self.config.stack_size,
            self.namemap.clone(),
        )
    }
}
