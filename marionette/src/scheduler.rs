//! Distributed job scheduler over the ranks of one group.
//!
//! Rank 0 of the group is the controller; every other rank is a worker that
//! sits in [`Scheduler::listen`] until it is told to stop. The controller
//! hands out contiguous rank ranges first-fit. The ranks of a job assemble
//! their own job world without involving anybody else, so jobs start and
//! finish independently of each other.

pub mod executor;
mod free_ranks;
pub mod protocol;

#[cfg(test)]
mod free_ranks_test;
#[cfg(test)]
mod scheduler_test;

pub use executor::{Executor, ExecutorError, FunctionRegistry, PuppetExecutor};
pub use free_ranks::FreeRanks;

use crate::{
    comm::{decode_i32s, CommError, Communicator, OrAbort, Rank, Tag},
    namemap::{
        wire::{self, WireError},
        Value,
    },
    procmap::{GroupSpec, ProcMapError, ProcessMap},
};
use protocol::{CONTROLLER, INIT, INTERCOMM_FIND, JOB, JOB_FINISHED, STOP};
use std::{
    cell::RefCell,
    collections::{BTreeMap, VecDeque},
    rc::Rc,
    thread,
};
use thiserror::Error;
use tracing::{debug, info, instrument, warn};

#[derive(Error, Debug)]
pub enum SchedulerError {
    #[error("Worker {0} reported ready twice")]
    DuplicateReady(Rank),
    #[error("Completion from rank {0}, which leads no running job")]
    UnknownJob(Rank),
    #[error("No running job called {0}")]
    UnknownJobName(String),
    #[error("Job {job} ran on {expected} ranks but reported {reported}")]
    SizeMismatch {
        job: String,
        expected: i32,
        reported: f64,
    },
    #[error("Rank {0} has no counterpart in the parent world")]
    Untranslatable(Rank),
    #[error("Unexpected message tag {0}")]
    UnexpectedTag(Tag),
    #[error("Invalid job: {0}")]
    InvalidJob(String),
    #[error("Only the controller can do this")]
    NotController,
    #[error("Only workers can do this")]
    NotWorker,
    #[error("Malformed message: {0}")]
    Malformed(String),
    #[error(transparent)]
    Comm(#[from] CommError),
    #[error(transparent)]
    ProcMap(#[from] ProcMapError),
    #[error(transparent)]
    Executor(#[from] ExecutorError),
    #[error(transparent)]
    Wire(#[from] WireError),
}

#[derive(Debug, Clone)]
struct Job {
    name: String,
    function: String,
    groups: GroupSpec,
    procs: i32,
    /// wire encoded, empty without an argument
    argument: Vec<u8>,
}

#[derive(Debug, Clone, Copy)]
struct ActiveJob {
    first: Rank,
    last: Rank,
    start: f64,
}

/// wall time of a finished job as seen by the controller
#[derive(Debug, Clone, PartialEq)]
pub struct JobTime {
    pub name: String,
    pub first: Rank,
    pub last: Rank,
    pub seconds: f64,
}

pub struct Scheduler<C: Communicator> {
    comm: C,
    parent: Rc<ProcessMap<C>>,
    active: bool,
    jobs: VecDeque<Job>,
    running: BTreeMap<String, ActiveJob>,
    free: FreeRanks,
    results: Vec<(String, f64)>,
    times: Vec<JobTime>,
}

impl<C: Communicator> Scheduler<C> {
    /// Collective over the local group of `parent`.
    #[instrument(skip_all, fields(group = parent.group()))]
    pub fn new(parent: Rc<ProcessMap<C>>) -> Result<Self, SchedulerError> {
        let comm = parent.local().dup()?;
        let size = comm.size();

        if comm.rank() == CONTROLLER {
            let mut ready = vec![false; size as usize];
            ready[0] = true;
            for _ in 1..size {
                let (_, status) = comm.recv(None, Some(INIT))?;
                let source = status.source as usize;
                if ready[source] {
                    Err::<(), _>(SchedulerError::DuplicateReady(status.source)).or_abort(&comm);
                }
                ready[source] = true;
            }
            info!(workers = size - 1, "All workers ready");
        } else {
            comm.send(CONTROLLER, INIT, &[])?;
        }

        Ok(Self {
            free: FreeRanks::new(size as usize),
            comm,
            parent,
            active: true,
            jobs: VecDeque::new(),
            running: BTreeMap::new(),
            results: Vec::new(),
            times: Vec::new(),
        })
    }

    pub fn is_controller(&self) -> bool {
        self.comm.rank() == CONTROLLER
    }

    pub fn is_active(&self) -> bool {
        self.active
    }

    pub fn rank(&self) -> Rank {
        self.comm.rank()
    }

    pub fn size(&self) -> i32 {
        self.comm.size()
    }

    pub fn workers(&self) -> i32 {
        self.comm.size() - 1
    }

    pub fn job_queue_empty(&self) -> bool {
        self.jobs.is_empty()
    }

    pub fn results_empty(&self) -> bool {
        self.results.is_empty()
    }

    /// most recently finished result first
    pub fn pop(&mut self) -> Option<(String, f64)> {
        self.results.pop()
    }

    /// Queue `function` on `procs` workers. `groups` partitions the job
    /// world; sizes `<= 0` share what is left, an empty list means one group
    /// called `world`.
    pub fn schedule_job(
        &mut self,
        name: &str,
        function: &str,
        groups: &[(&str, i32)],
        procs: i32,
    ) -> Result<(), SchedulerError> {
        self.enqueue(name, function, Vec::new(), groups, procs)
    }

    /// [`Scheduler::schedule_job`] with a value handed to the job as
    /// [`JobContext::argument`]. Arrays have to own their storage.
    pub fn schedule_job_with_argument(
        &mut self,
        name: &str,
        function: &str,
        argument: &Value,
        groups: &[(&str, i32)],
        procs: i32,
    ) -> Result<(), SchedulerError> {
        if let Value::Array(array) = argument {
            if !array.is_owned() {
                return Err(SchedulerError::InvalidJob(format!(
                    "argument of {name} borrows memory, copy the array first"
                )));
            }
        }
        // owned arrays and scalars are always valid to read
        let argument = unsafe { wire::encode(argument)? };

        self.enqueue(name, function, argument, groups, procs)
    }

    fn enqueue(
        &mut self,
        name: &str,
        function: &str,
        argument: Vec<u8>,
        groups: &[(&str, i32)],
        procs: i32,
    ) -> Result<(), SchedulerError> {
        if !self.is_controller() {
            return Err(SchedulerError::NotController);
        }
        if procs < 1 || procs > self.workers() {
            return Err(SchedulerError::InvalidJob(format!(
                "{name} needs {procs} ranks, there are {} workers",
                self.workers()
            )));
        }
        if self.running.contains_key(name) || self.jobs.iter().any(|job| job.name == name) {
            return Err(SchedulerError::InvalidJob(format!("{name} is already scheduled")));
        }

        let groups = if groups.is_empty() {
            GroupSpec::new([("world", procs)])
        } else {
            GroupSpec::resolve(groups, procs)?
        };
        // every worker of the job has to be able to build its world from this
        if groups.total() != procs {
            return Err(ProcMapError::SizeMismatch {
                requested: groups.total(),
                available: procs,
            }
            .into());
        }

        debug!(procs, %groups, "Queued job {name}");
        self.jobs.push_back(Job {
            name: name.to_string(),
            function: function.to_string(),
            groups,
            procs,
            argument,
        });

        Ok(())
    }

    /// One non-blocking pass; `true` while jobs are queued or running.
    pub fn control(&mut self) -> Result<bool, SchedulerError> {
        self.check_for_complete_jobs()?;
        self.answer_intercomm_queries()?;
        self.dispatch()?;

        Ok(!self.jobs.is_empty() || self.free.any_busy())
    }

    fn check_for_complete_jobs(&mut self) -> Result<(), SchedulerError> {
        while let Some(status) = self.comm.iprobe(None, Some(JOB_FINISHED))? {
            let (report, status) = self.comm.recv_f64s(Some(status.source), Some(JOB_FINISHED))?;
            let end = self.comm.wtime();

            let name = self
                .running
                .iter()
                .find(|(_, job)| job.first == status.source)
                .map(|(name, _)| name.clone())
                .ok_or(SchedulerError::UnknownJob(status.source))
                .or_abort(&self.comm);
            let job = self
                .running
                .remove(&name)
                .ok_or(SchedulerError::UnknownJob(status.source))
                .or_abort(&self.comm);

            let [size, result] = report[..] else {
                return Err(SchedulerError::Malformed(format!(
                    "completion of {name} carries {} values",
                    report.len()
                )));
            };
            let expected = job.last - job.first + 1;
            if size != expected as f64 {
                Err::<(), _>(SchedulerError::SizeMismatch {
                    job: name.clone(),
                    expected,
                    reported: size,
                })
                .or_abort(&self.comm);
            }

            self.free.release(job.first, job.last);
            if !result.is_nan() {
                self.results.push((name.clone(), result));
            }

            debug!(first = job.first, last = job.last, "Job {name} finished");
            self.times.push(JobTime {
                name,
                first: job.first,
                last: job.last,
                seconds: end - job.start,
            });
        }

        Ok(())
    }

    fn answer_intercomm_queries(&mut self) -> Result<(), SchedulerError> {
        while let Some(status) = self.comm.iprobe(None, Some(INTERCOMM_FIND))? {
            let (name, status) = self.comm.recv_string(Some(status.source), Some(INTERCOMM_FIND))?;

            let leader = match self.running.get(&name) {
                Some(job) => self.comm.translate_ranks(&[job.first], self.parent.world())?[0]
                    .ok_or(SchedulerError::Untranslatable(job.first))
                    .or_abort(&self.comm),
                None => {
                    warn!(requester = status.source, "Lookup of unknown job {name}");
                    -1
                }
            };

            self.comm.send_i32s(status.source, INTERCOMM_FIND, &[leader])?;
        }

        Ok(())
    }

    fn dispatch(&mut self) -> Result<(), SchedulerError> {
        while let Some(front) = self.jobs.front() {
            if self.free.longest_run() < front.procs as usize {
                break;
            }
            let Some((first, last)) = self.free.first_fit(front.procs as usize) else {
                break;
            };
            let Some(job) = self.jobs.pop_front() else {
                break;
            };

            let groups = job.groups.to_wire();
            for rank in first..=last {
                self.comm.send_str(rank, JOB, &job.function)?;
                self.comm.send_str(rank, JOB, &groups)?;
                self.comm.send_i32s(rank, JOB, &[first, last])?;
                self.comm.send_str(rank, JOB, &job.name)?;
                self.comm.send(rank, JOB, &job.argument)?;
            }

            self.free.occupy(first, last);
            info!(first, last, function = job.function, "Dispatched job {}", job.name);
            self.running.insert(
                job.name,
                ActiveJob {
                    first,
                    last,
                    start: self.comm.wtime(),
                },
            );
        }

        Ok(())
    }

    /// Run control passes until every job is done, then release the workers.
    ///
    /// Each pass still dispatches whatever is queued, so jobs scheduled before
    /// this call start here if they have not yet.
    pub fn finish(&mut self) -> Result<Vec<JobTime>, SchedulerError> {
        if !self.is_controller() {
            return Err(SchedulerError::NotController);
        }

        while self.control()? {
            thread::yield_now();
        }

        for rank in 1..self.comm.size() {
            self.comm.send_i32s(rank, STOP, &[0])?;
        }
        self.active = false;

        for time in &self.times {
            info!(
                first = time.first,
                last = time.last,
                seconds = time.seconds,
                "Job {} took {:.3}s",
                time.name,
                time.seconds
            );
        }

        Ok(self.times.clone())
    }

    /// Worker loop: run jobs as they come until the controller says stop.
    pub fn listen<E: Executor<C>>(&mut self, executor: &mut E) -> Result<(), SchedulerError> {
        if self.is_controller() {
            return Err(SchedulerError::NotWorker);
        }

        loop {
            let status = self.comm.probe(Some(CONTROLLER), None)?;
            match status.tag {
                STOP => {
                    self.comm.recv_i32s(Some(CONTROLLER), Some(STOP))?;
                    self.active = false;
                    debug!(rank = self.comm.rank(), "Worker stopped");
                    return Ok(());
                }
                JOB => self.run_job(executor)?,
                tag => return Err(SchedulerError::UnexpectedTag(tag)),
            }
        }
    }

    fn run_job<E: Executor<C>>(&mut self, executor: &mut E) -> Result<(), SchedulerError> {
        let (function, _) = self.comm.recv_string(Some(CONTROLLER), Some(JOB))?;
        let (groups, _) = self.comm.recv_string(Some(CONTROLLER), Some(JOB))?;
        let (range, _) = self.comm.recv_i32s(Some(CONTROLLER), Some(JOB))?;
        let (name, _) = self.comm.recv_string(Some(CONTROLLER), Some(JOB))?;
        let (argument, _) = self.comm.recv(Some(CONTROLLER), Some(JOB))?;
        let argument = if argument.is_empty() {
            None
        } else {
            Some(wire::decode(&argument)?)
        };

        let [first, last] = range[..] else {
            return Err(SchedulerError::Malformed(format!("rank range of {name}")));
        };

        // the other ranks of the job would wait for this one forever
        let procmap = GroupSpec::from_wire(&groups)
            .and_then(|spec| ProcessMap::child(&self.comm, first..=last, spec))
            .or_abort(&self.comm);
        let context = JobContext {
            name,
            argument,
            procmap: Rc::new(procmap),
            parent: self.parent.clone(),
            scheduler: &self.comm,
            connections: RefCell::new(BTreeMap::new()),
        };

        let result = executor.execute(&function, &context)?;
        context.procmap.world().barrier()?;

        if context.procmap.world_rank() == 0 {
            let size = (last - first + 1) as f64;
            self.comm
                .send_f64s(CONTROLLER, JOB_FINISHED, &[size, result.unwrap_or(f64::NAN)])?;
        }

        Ok(())
    }
}

/// What a job's function sees of the engine.
pub struct JobContext<'a, C: Communicator> {
    name: String,
    argument: Option<Value>,
    procmap: Rc<ProcessMap<C>>,
    parent: Rc<ProcessMap<C>>,
    scheduler: &'a C,
    connections: RefCell<BTreeMap<String, Rc<C>>>,
}

impl<'a, C: Communicator> JobContext<'a, C> {
    pub fn name(&self) -> &str {
        &self.name
    }

    /// value the job was scheduled with, arrays arrive as owned copies
    pub fn argument(&self) -> Option<&Value> {
        self.argument.as_ref()
    }

    /// the job's own process map
    pub fn procmap(&self) -> &ProcessMap<C> {
        &self.procmap
    }

    pub(crate) fn procmap_rc(&self) -> Rc<ProcessMap<C>> {
        self.procmap.clone()
    }

    pub fn parent(&self) -> &ProcessMap<C> {
        &self.parent
    }

    /// Parent world rank of the leader of running job `name`. Collective
    /// over the job world.
    pub fn find_job(&self, name: &str) -> Result<Option<Rank>, SchedulerError> {
        let mut reply = Vec::new();
        if self.procmap.world_rank() == 0 {
            self.scheduler.send_str(CONTROLLER, INTERCOMM_FIND, name)?;
            let (leader, _) = self.scheduler.recv_i32s(Some(CONTROLLER), Some(INTERCOMM_FIND))?;
            reply = leader.iter().flat_map(|rank| rank.to_le_bytes()).collect();
        }
        self.procmap.world().broadcast(0, &mut reply)?;

        let leader = decode_i32s(&reply)?
            .first()
            .copied()
            .ok_or_else(|| SchedulerError::Malformed(format!("lookup reply for {name}")))?;

        Ok((leader >= 0).then_some(leader))
    }

    /// Intercommunicator between this job's world and running job `name`'s,
    /// which has to connect back with the same tag.
    pub fn connect(&self, name: &str, tag: Tag) -> Result<Rc<C>, SchedulerError> {
        if let Some(comm) = self.connections.borrow().get(name) {
            return Ok(comm.clone());
        }

        let leader = self
            .find_job(name)?
            .ok_or_else(|| SchedulerError::UnknownJobName(name.to_string()))?;
        let comm = Rc::new(
            self.procmap
                .world()
                .intercomm_create(0, self.parent.world(), leader, tag)?,
        );
        info!(job = self.name, peer = name, tag, "Connected jobs");

        self.connections
            .borrow_mut()
            .insert(name.to_string(), comm.clone());

        Ok(comm)
    }
}
