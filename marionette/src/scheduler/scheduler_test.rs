use super::{
    protocol::{CONTROLLER, JOB_FINISHED},
    FunctionRegistry, Scheduler,
};
use crate::{
    comm::thread::{self, Aborted, ThreadComm},
    procmap::{GroupSpec, ProcessMap},
    Communicator,
};
use std::{any::Any, panic, rc::Rc, thread::yield_now};

fn scheduler(world: ThreadComm) -> Scheduler<ThreadComm> {
    let size = world.size();
    let parent = Rc::new(ProcessMap::new(world, GroupSpec::new([("world", size)])).unwrap());
    Scheduler::new(parent).unwrap()
}

fn abort_code(payload: Box<dyn Any + Send>) -> Option<i32> {
    payload.downcast_ref::<Aborted>().map(|aborted| aborted.code)
}

#[test]
pub fn completion_without_a_job_aborts_every_rank() {
    let outcome = panic::catch_unwind(|| {
        thread::run(3, |world| {
            let mut scheduler = scheduler(world);
            if scheduler.is_controller() {
                loop {
                    scheduler.control().unwrap();
                    yield_now();
                }
            } else {
                if scheduler.rank() == 1 {
                    scheduler.comm.send_f64s(CONTROLLER, JOB_FINISHED, &[1.0, 0.5]).unwrap();
                }
                let mut registry: FunctionRegistry<ThreadComm> = FunctionRegistry::new();
                scheduler.listen(&mut registry).unwrap();
            }
        })
    });

    assert_eq!(outcome.err().and_then(abort_code), Some(1));
}

#[test]
pub fn completion_with_the_wrong_size_aborts_every_rank() {
    let outcome = panic::catch_unwind(|| {
        thread::run(3, |world| {
            let mut scheduler = scheduler(world);
            if scheduler.is_controller() {
                scheduler.schedule_job("pair", "liar", &[], 2).unwrap();
                scheduler.finish().unwrap();
            } else {
                let mut registry: FunctionRegistry<ThreadComm> = FunctionRegistry::new();
                registry.register("liar", |context| {
                    if context.procmap().world_rank() == 0 {
                        context.scheduler.send_f64s(CONTROLLER, JOB_FINISHED, &[5.0, 1.0]).unwrap();
                    }
                    Ok(None)
                });
                scheduler.listen(&mut registry).unwrap();
            }
        })
    });

    assert_eq!(outcome.err().and_then(abort_code), Some(1));
}
