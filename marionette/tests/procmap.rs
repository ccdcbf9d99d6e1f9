use marionette::{
    comm::thread,
    namemap::{wire, Array, Value},
    procmap::{GroupSpec, ProcMapError, ProcessMap},
    Communicator,
};

#[test]
pub fn size_mismatch_is_reported_before_splitting() {
    let errors = thread::run(3, |world| {
        ProcessMap::new(world, GroupSpec::new([("world", 2)])).err()
    })
    .unwrap();

    for error in errors {
        assert_eq!(
            error,
            Some(ProcMapError::SizeMismatch {
                requested: 2,
                available: 3
            })
        );
    }
}

#[test]
pub fn groups_are_contiguous() {
    let layout = thread::run(5, |world| {
        let procmap = ProcessMap::new(world, GroupSpec::new([("sim", 2), ("ana", 3)])).unwrap();

        assert_eq!(procmap.leader("sim"), Ok(0));
        assert_eq!(procmap.leader("ana"), Ok(2));
        assert_eq!(procmap.size("ana"), Ok(3));
        assert!(procmap.is_leader(2));
        assert!(!procmap.is_leader(3));
        assert_eq!(
            procmap.leader("none"),
            Err(ProcMapError::UnknownGroup("none".to_string()))
        );
        assert_eq!(
            procmap.intercomm(procmap.group()).err(),
            Some(ProcMapError::SelfIntercomm(procmap.group().to_string()))
        );
        // no bridge has been requested yet, not even towards the other group
        let other = if procmap.group() == "sim" { "ana" } else { "sim" };
        assert!(matches!(procmap.intracomm(other), Err(ProcMapError::NoIntracomm(_))));
        assert!(matches!(
            procmap.intracomm(procmap.group()),
            Err(ProcMapError::NoIntracomm(_))
        ));

        (procmap.color(), procmap.local_rank(), procmap.local().size())
    })
    .unwrap();

    assert_eq!(layout, vec![(0, 0, 2), (0, 1, 2), (1, 0, 3), (1, 1, 3), (1, 2, 3)]);
}

#[test]
pub fn values_cross_a_bridge() {
    thread::run(4, |world| {
        let procmap = ProcessMap::new(world, GroupSpec::new([("producer", 2), ("consumer", 2)])).unwrap();

        if procmap.group() == "producer" {
            let bridge = procmap.intercomm("consumer").unwrap();
            let data = [1.5f32, 2.5, 3.5];
            let value = Value::Array(Array::from_slice(&data));
            unsafe { wire::send_value(&*bridge, procmap.local_rank(), 9, &value) }.unwrap();
        } else {
            let bridge = procmap.intercomm("producer").unwrap();
            match wire::recv_value(&*bridge, Some(procmap.local_rank()), Some(9)).unwrap() {
                Value::Array(array) => {
                    assert!(array.is_owned());
                    assert_eq!(unsafe { array.to_vec::<f32>() }, Some(vec![1.5, 2.5, 3.5]));
                }
                other => panic!("expected an array, got {other:?}"),
            }
        }
    })
    .unwrap();
}
