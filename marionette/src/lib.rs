pub mod abi;
pub mod comm;
pub mod config;
pub mod coroutine;
pub mod diagnostics;
pub mod engine;
pub mod guest;
pub mod logging;
pub mod namemap;
pub mod procmap;
pub mod puppet;
pub mod scheduler;

pub use comm::{CommError, Communicator, OrAbort, Rank, Tag};
pub use config::EngineConfig;
pub use coroutine::Coroutine;
pub use engine::{Engine, EngineError};
pub use namemap::{NameMap, Value};
pub use procmap::{GroupSpec, ProcessMap};
pub use puppet::Puppet;
pub use scheduler::{JobContext, Scheduler};
