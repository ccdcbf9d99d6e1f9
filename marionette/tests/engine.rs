use marionette::{
    comm::thread,
    config::{ConfigErrors, EngineConfig},
    guest,
    puppet::Module,
    Engine, EngineError,
};
use std::os::raw::{c_char, c_int};
use tracing_unwrap::{OptionExt, ResultExt};

const CONFIG: &str = r#"
log:
  level: debug
stack_size: 262144
procs:
  - sim=1
groups:
  - sim
  - analysis
puppets:
  producer: producer --fast
"#;

extern "C" fn producer_main(argc: c_int, _argv: *mut *mut c_char) -> c_int {
    guest::save_int("argc", argc);
    if let Some(group) = guest::group() {
        guest::save_size_t("group_length", group.len());
    }
    guest::yield_to_host();
    argc
}

#[test]
pub fn config_defaults_and_unknown_fields() {
    let config = EngineConfig::from_str("{}").unwrap_or_log();
    assert_eq!(config.stack_size, 8 * 1024 * 1024);
    assert_eq!(config.log.level, "info");
    assert!(config.procs.is_empty());

    assert!(matches!(
        EngineConfig::from_str("stack: 12"),
        Err(ConfigErrors::Parse(_))
    ));
}

#[test]
pub fn preflight_reports_every_problem() {
    let mut config = EngineConfig::from_str(
        r#"
stack_size: 16
prefix: /definitely/not/here
log:
  level: loud
puppets:
  empty: "  "
"#,
    )
    .unwrap_or_log();

    assert!(matches!(config.preflight_checks(), Err(ConfigErrors::Preflight(4))));
}

#[test]
pub fn engine_partitions_and_hosts() {
    let groups = thread::run(3, |world| {
        let config = EngineConfig::from_str(CONFIG).unwrap_or_log();
        let engine = Engine::new(world, config).unwrap_or_log();

        let command_line = engine.config().puppets.get("producer").cloned().unwrap_or_log();
        let module = Module::from_hooks("producer", guest::module_hooks(producer_main));
        let mut puppet = engine.load_linked(module, &command_line).unwrap_or_log();

        assert!(puppet.proceed());
        assert!(!puppet.proceed());
        assert_eq!(puppet.result(), 2);

        let mut namemap = engine.namemap().borrow_mut();
        assert_eq!(namemap.get_as::<i32>("argc"), Ok(2));
        assert_eq!(
            namemap.get_as::<usize>("group_length"),
            Ok(engine.procmap().group().len())
        );

        engine.procmap().group().to_string()
    })
    .unwrap_or_log();

    assert_eq!(groups, vec!["sim", "analysis", "analysis"]);
}

#[test]
pub fn engine_errors() {
    thread::run(1, |world| {
        let engine = Engine::new(world, EngineConfig::default()).unwrap_or_log();
        assert_eq!(engine.procmap().group(), "world");

        assert!(matches!(engine.load("   "), Err(EngineError::EmptyCommandLine)));
        assert!(matches!(
            engine.load_named("nothing"),
            Err(EngineError::UnknownPuppet(_))
        ));
        assert!(matches!(
            engine.load("/no/such/library.so"),
            Err(EngineError::Puppet(_))
        ));
    })
    .unwrap_or_log();
}

#[test]
pub fn scheduled_puppets_report_main_result() {
    let results = thread::run(3, |world| {
        let engine = Engine::new(world, EngineConfig::default()).unwrap_or_log();
        let mut scheduler = engine.scheduler().unwrap_or_log();

        if scheduler.is_controller() {
            scheduler.schedule_job("produce", "producer a b c", &[], 2).unwrap_or_log();
            scheduler.finish().unwrap_or_log();
            scheduler.pop()
        } else {
            let mut executor = engine.puppet_executor();
            executor.link("producer", guest::module_hooks(producer_main));
            scheduler.listen(&mut executor).unwrap_or_log();
            None
        }
    })
    .unwrap_or_log();

    // argv is the program name plus three arguments
    assert_eq!(results[0].clone().unwrap_or_log(), ("produce".to_string(), 4.0));
}
