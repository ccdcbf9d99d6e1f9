use crate::procmap::{GroupSpec, ProcMapError};
use serde::{Deserialize, Serialize};
use std::{collections::BTreeMap, fs::File, io::Error, path::PathBuf};
use thiserror::Error;
use tracing::{error, warn};

/// smallest coroutine stack that still fits a call into hosted code
pub const MIN_STACK_SIZE: usize = 64 * 1024;

#[derive(Error, Debug)]
pub enum ConfigErrors {
    #[error("Config file could not be opened")]
    FileNotFound(#[from] Error),
    #[error("Config could not be parsed")]
    Parse(#[from] serde_yaml::Error),
    #[error("Config failed {0} preflight check(s)")]
    Preflight(usize),
    #[error("Invalid process groups")]
    Groups(#[from] ProcMapError),
}

#[derive(Deserialize, Serialize, Clone, Debug)]
#[serde(deny_unknown_fields)]
pub struct EngineConfig {
    #[serde(default)]
    pub log: LogConfig,
    // bytes per puppet stack
    #[serde(default = "default_stack_size")]
    pub stack_size: usize,
    // directory relative puppet paths are resolved against
    #[serde(default)]
    pub prefix: Option<PathBuf>,
    // group entries, `name=size` or a bare `name`
    #[serde(default)]
    pub procs: Vec<String>,
    // every group the workflow uses, unsized ones share the leftover ranks
    #[serde(default)]
    pub groups: Vec<String>,
    // named puppet command lines
    #[serde(default)]
    pub puppets: BTreeMap<String, String>,
}

#[derive(Deserialize, Serialize, Clone, Debug)]
#[serde(deny_unknown_fields)]
pub struct LogConfig {
    #[serde(default = "default_level")]
    pub level: String,
}

impl Default for LogConfig {
    fn default() -> Self {
        Self {
            level: default_level(),
        }
    }
}

impl Default for EngineConfig {
    fn default() -> Self {
        Self {
            log: LogConfig::default(),
            stack_size: default_stack_size(),
            prefix: None,
            procs: Vec::new(),
            groups: Vec::new(),
            puppets: BTreeMap::new(),
        }
    }
}

impl EngineConfig {
    pub fn load(path: &PathBuf) -> Result<Self, ConfigErrors> {
        let file = File::open(path)?;

        Ok(serde_yaml::from_reader(file)?)
    }

    pub fn from_str(config: &str) -> Result<Self, ConfigErrors> {
        Ok(serde_yaml::from_str(config)?)
    }

    /// Check everything at once so users see all problems in one go.
    pub fn preflight_checks(&mut self) -> Result<(), ConfigErrors> {
        let mut errors = 0;

        if self.stack_size < MIN_STACK_SIZE {
            error!(
                "stack_size {} is below the minimum of {MIN_STACK_SIZE} bytes",
                self.stack_size
            );
            errors += 1;
        }

        if let Some(prefix) = &self.prefix {
            if !prefix.is_dir() {
                error!("prefix {} is not a directory", prefix.to_string_lossy());
                errors += 1;
            }
        }

        if self.procs.is_empty() && self.groups.is_empty() {
            warn!("No process groups configured, falling back to a single group `world`");
            self.groups.push("world".to_string());
        }

        for entry in self.procs.iter() {
            if entry.trim().is_empty() {
                error!("procs contains an empty entry");
                errors += 1;
            }
        }

        for (name, command_line) in self.puppets.iter() {
            if command_line.split_whitespace().next().is_none() {
                error!("puppets.{name} has an empty command line");
                errors += 1;
            }
        }

        self.log.level = self.log.level.to_lowercase();
        if !matches!(
            self.log.level.as_str(),
            "trace" | "debug" | "info" | "warn" | "error" | "off"
        ) {
            error!("log.level {} is not a known level", self.log.level);
            errors += 1;
        }

        if errors == 0 {
            Ok(())
        } else {
            Err(ConfigErrors::Preflight(errors))
        }
    }

    pub fn group_spec(&self, world_size: i32) -> Result<GroupSpec, ConfigErrors> {
        let groups = if self.procs.is_empty() && self.groups.is_empty() {
            vec!["world".to_string()]
        } else {
            self.groups.clone()
        };

        Ok(GroupSpec::parse(&self.procs, world_size, &groups)?)
    }
}

fn default_stack_size() -> usize {
    8 * 1024 * 1024
}

fn default_level() -> String {
    "info".to_string()
}
