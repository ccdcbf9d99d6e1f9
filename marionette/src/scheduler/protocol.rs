//! Message tags on the scheduler communicator.
//!
//! * `INIT`: worker to controller, empty, once at startup.
//! * `JOB`: controller to every rank of a job, five messages in order:
//!   function, group spec (`name=size,...`), `[first, last]` as two `i32`,
//!   job name and the wire encoded argument (empty for none).
//! * `JOB_FINISHED`: job leader to controller, `[size, result]` as two `f64`,
//!   a NaN result meaning the job produced none.
//! * `STOP`: controller to worker, one `i32`.
//! * `INTERCOMM_FIND`: job leader sends a job name, the controller answers
//!   with one `i32`, the parent world rank of that job's leader or `-1`.

use crate::comm::Tag;

pub use crate::procmap::NONCOLLECTIVE_TAG;

pub const JOB: Tag = 1;
pub const STOP: Tag = 2;
pub const JOB_FINISHED: Tag = 3;
pub const INTERCOMM_FIND: Tag = 4;
pub const INIT: Tag = 5;

pub const CONTROLLER: crate::comm::Rank = 0;
