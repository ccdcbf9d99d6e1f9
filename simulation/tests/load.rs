use marionette::{
    comm::thread,
    namemap::Array,
    procmap::{GroupSpec, ProcessMap},
    NameMap, Puppet,
};
use std::{cell::RefCell, env, path::PathBuf, rc::Rc};

const STACK: usize = 1024 * 1024;

/// the library cargo built for this package, next to or above the test binary
fn library() -> PathBuf {
    let name = format!(
        "{}marionette_simulation{}",
        env::consts::DLL_PREFIX,
        env::consts::DLL_SUFFIX
    );
    let exe = env::current_exe().unwrap();

    exe.ancestors()
        .skip(1)
        .take(2)
        .map(|dir| dir.join(&name))
        .find(|path| path.exists())
        .unwrap_or_else(|| panic!("{name} not found near {}", exe.display()))
}

#[test]
pub fn simulation_publishes_every_step() {
    let path = library();

    thread::run(1, |world| {
        let procmap = Rc::new(ProcessMap::new(world, GroupSpec::new([("world", 1)])).unwrap());
        let namemap = Rc::new(RefCell::new(NameMap::new()));
        let args = vec!["4".to_string(), "3".to_string()];
        let mut puppet = Puppet::new(&path, &args, procmap, namemap.clone(), STACK).unwrap();

        for step in 0..3 {
            assert!(puppet.proceed());

            let mut map = namemap.borrow_mut();
            assert_eq!(map.get_as::<i32>("t"), Ok(step));
            let data = map.get_as::<Array>("data").unwrap();
            assert_eq!(data.count(), 4);
            let values = unsafe { data.to_vec::<f32>() }.unwrap();
            assert!(values.iter().all(|value| (0.0..1.0).contains(value)));
        }

        assert!(!puppet.proceed());
        assert_eq!(puppet.result(), 0);
    })
    .unwrap();
}

#[test]
pub fn simulation_honours_a_stop_request() {
    let path = library();

    thread::run(1, |world| {
        let procmap = Rc::new(ProcessMap::new(world, GroupSpec::new([("world", 1)])).unwrap());
        let namemap = Rc::new(RefCell::new(NameMap::new()));
        let args = vec!["8".to_string(), "100".to_string()];
        let mut puppet = Puppet::new(&path, &args, procmap, namemap.clone(), STACK).unwrap();
        assert_eq!(puppet.name(), path.file_name().unwrap().to_string_lossy());

        assert!(puppet.proceed());
        puppet.signal_stop();
        assert!(!puppet.proceed());
        assert!(puppet.is_finished());
        assert_eq!(puppet.result(), 0);
        assert_eq!(namemap.borrow_mut().get_as::<i32>("t"), Ok(0));
    })
    .unwrap();
}
