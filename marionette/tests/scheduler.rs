use marionette::{
    comm::thread::{self, ThreadComm},
    procmap::{GroupSpec, ProcMapError, ProcessMap},
    scheduler::{FunctionRegistry, Scheduler, SchedulerError},
    namemap::{Array, Value},
    Communicator,
};
use std::rc::Rc;

fn top_level(world: ThreadComm) -> Rc<ProcessMap<ThreadComm>> {
    let size = world.size();
    Rc::new(ProcessMap::new(world, GroupSpec::new([("world", size)])).unwrap())
}

fn registry() -> FunctionRegistry<ThreadComm> {
    let mut registry: FunctionRegistry<ThreadComm> = FunctionRegistry::new();
    registry
        .register("mean", |context| {
            assert_eq!(context.procmap().world().size(), 4);
            Ok(Some(7.5))
        })
        .register("quiet", |_| Ok(None))
        .register("scale", |context| {
            Ok(Some(match context.argument() {
                Some(Value::Double(value)) => value * 2.0,
                Some(Value::Array(array)) => {
                    assert!(array.is_owned());
                    unsafe { array.to_vec::<f64>() }.unwrap_or_default().iter().sum()
                }
                Some(_) => f64::NAN,
                None => -1.0,
            }))
        })
        .register("split", |context| {
            let procmap = context.procmap();
            let other = if procmap.group() == "a" { "b" } else { "a" };
            let bridge = procmap.intercomm(other).unwrap();
            Ok(Some(bridge.remote_size() as f64))
        })
        .register("peer", |context| {
            let other = if context.name() == "left" { "right" } else { "left" };
            let inter = context.connect(other, 5).unwrap();
            assert!(Rc::ptr_eq(&inter, &context.connect(other, 5).unwrap()));
            Ok(Some(inter.remote_size() as f64))
        });
    registry
}

#[test]
pub fn single_job_reports_result() {
    let outcome = thread::run(5, |world| {
        let mut scheduler = Scheduler::new(top_level(world)).unwrap();
        if scheduler.is_controller() {
            assert_eq!(scheduler.workers(), 4);
            scheduler.schedule_job("job", "mean", &[], 4).unwrap();
            assert!(!scheduler.job_queue_empty());

            let times = scheduler.finish().unwrap();
            assert_eq!(times.len(), 1);
            assert_eq!((times[0].first, times[0].last), (1, 4));
            assert!(!scheduler.is_active());

            let result = scheduler.pop();
            assert!(scheduler.results_empty());
            result
        } else {
            scheduler.listen(&mut registry()).unwrap();
            assert!(!scheduler.is_active());
            None
        }
    })
    .unwrap();

    assert_eq!(outcome[0], Some(("job".to_string(), 7.5)));
}

#[test]
pub fn jobs_without_result_are_not_recorded() {
    thread::run(3, |world| {
        let mut scheduler = Scheduler::new(top_level(world)).unwrap();
        if scheduler.is_controller() {
            scheduler.schedule_job("first", "quiet", &[], 2).unwrap();
            scheduler.schedule_job("second", "quiet", &[], 1).unwrap();
            assert_eq!(scheduler.finish().unwrap().len(), 2);
            assert!(scheduler.results_empty());
        } else {
            scheduler.listen(&mut registry()).unwrap();
        }
    })
    .unwrap();
}

#[test]
pub fn job_groups_bridge_inside_the_job() {
    let results = thread::run(5, |world| {
        let mut scheduler = Scheduler::new(top_level(world)).unwrap();
        if scheduler.is_controller() {
            scheduler.schedule_job("grouped", "split", &[("a", 1), ("b", 0)], 4).unwrap();
            scheduler.finish().unwrap();
            scheduler.pop()
        } else {
            scheduler.listen(&mut registry()).unwrap();
            None
        }
    })
    .unwrap();

    // the job leader sits in group a, which bridges to the three ranks of b
    assert_eq!(results[0], Some(("grouped".to_string(), 3.0)));
}

#[test]
pub fn concurrent_jobs_connect() {
    let results = thread::run(5, |world| {
        let mut scheduler = Scheduler::new(top_level(world)).unwrap();
        if scheduler.is_controller() {
            scheduler.schedule_job("left", "peer", &[], 2).unwrap();
            scheduler.schedule_job("right", "peer", &[], 2).unwrap();
            scheduler.finish().unwrap();

            let mut results = Vec::new();
            while let Some(result) = scheduler.pop() {
                results.push(result);
            }
            results.sort_by(|a, b| a.0.cmp(&b.0));
            results
        } else {
            scheduler.listen(&mut registry()).unwrap();
            Vec::new()
        }
    })
    .unwrap();

    assert_eq!(
        results[0],
        vec![("left".to_string(), 2.0), ("right".to_string(), 2.0)]
    );
}

#[test]
pub fn invalid_jobs_are_rejected() {
    thread::run(3, |world| {
        let mut scheduler = Scheduler::new(top_level(world)).unwrap();
        if scheduler.is_controller() {
            assert!(matches!(
                scheduler.schedule_job("big", "mean", &[], 3),
                Err(SchedulerError::InvalidJob(_))
            ));
            assert!(matches!(
                scheduler.schedule_job("none", "mean", &[], 0),
                Err(SchedulerError::InvalidJob(_))
            ));
            assert!(matches!(
                scheduler.schedule_job("short", "quiet", &[("a", 1)], 2),
                Err(SchedulerError::ProcMap(ProcMapError::SizeMismatch {
                    requested: 1,
                    available: 2
                }))
            ));
            assert!(matches!(
                scheduler.schedule_job("commas", "quiet", &[("a,b", 1), ("c", 1)], 2),
                Err(SchedulerError::ProcMap(ProcMapError::InvalidEntry(_)))
            ));
            assert!(scheduler.job_queue_empty());
            scheduler.schedule_job("twice", "quiet", &[], 1).unwrap();
            assert!(matches!(
                scheduler.schedule_job("twice", "quiet", &[], 1),
                Err(SchedulerError::InvalidJob(_))
            ));
            assert!(matches!(
                scheduler.listen(&mut registry()),
                Err(SchedulerError::NotWorker)
            ));
            scheduler.finish().unwrap();
        } else {
            assert!(matches!(
                scheduler.schedule_job("worker", "quiet", &[], 1),
                Err(SchedulerError::NotController)
            ));
            scheduler.listen(&mut registry()).unwrap();
        }
    })
    .unwrap();
}

#[test]
pub fn jobs_receive_their_argument() {
    let results = thread::run(4, |world| {
        let mut scheduler = Scheduler::new(top_level(world)).unwrap();
        if scheduler.is_controller() {
            let data = [1.0f64, 2.0, 3.0];
            assert!(matches!(
                scheduler.schedule_job_with_argument("view", "scale", &Value::Array(Array::from_slice(&data)), &[], 1),
                Err(SchedulerError::InvalidJob(_))
            ));

            scheduler
                .schedule_job_with_argument("double", "scale", &Value::Double(2.5), &[], 1)
                .unwrap();
            scheduler
                .schedule_job_with_argument("sum", "scale", &Value::Array(Array::owned(&data)), &[], 1)
                .unwrap();
            scheduler.schedule_job("plain", "scale", &[], 1).unwrap();
            scheduler.finish().unwrap();

            let mut results = Vec::new();
            while let Some(result) = scheduler.pop() {
                results.push(result);
            }
            results.sort_by(|a, b| a.0.cmp(&b.0));
            results
        } else {
            scheduler.listen(&mut registry()).unwrap();
            Vec::new()
        }
    })
    .unwrap();

    assert_eq!(
        results[0],
        vec![
            ("double".to_string(), 5.0),
            ("plain".to_string(), -1.0),
            ("sum".to_string(), 6.0)
        ]
    );
}
