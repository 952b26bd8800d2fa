use std::path::PathBuf;

use peridot::core::conf::{self, ConfContext};
use peridot::core::cycle::Cycle;
use peridot::core::errors::PeridotError;
use peridot::core::module::{CORE_MODULE_INDEX, CoreConf, ModuleRegistry};
use peridot::core::pool::Pool;

/// A cycle with the core module's configuration created, mirroring the state
/// `build_cycle` hands the parser.
fn parse_ready_cycle() -> Cycle {
    let modules = ModuleRegistry::bootstrap(Vec::new());
    let mut cycle = Cycle::bootstrap(
        modules,
        PathBuf::from("."),
        PathBuf::from("peridot.conf"),
        String::new(),
    )
    .unwrap();

    let registry = cycle.modules.clone();
    for slot in registry.iter() {
        if let Some(conf) = slot.module.create_conf(&cycle) {
            cycle.conf_table_put(slot.index, Some(conf));
        }
    }
    cycle
}

fn parse(cycle: &mut Cycle, text: &str) -> Result<(), PeridotError> {
    let temp_pool = Pool::create(4096).unwrap();
    let mut ctx = ConfContext::new(cycle, temp_pool, "test.conf");
    conf::parse_snippet(&mut ctx, text, "test.conf")
}

#[test]
fn test_core_directives_populate_core_conf() {
    let mut cycle = parse_ready_cycle();
    parse(
        &mut cycle,
        "worker_processes 4;\n\
         daemon off;\n\
         master_process off;\n\
         pid run/peridot.pid;\n\
         worker_priority -5;\n\
         worker_rlimit_nofile 8192;\n",
    )
    .unwrap();

    let conf = cycle.conf_ref::<CoreConf>(CORE_MODULE_INDEX).unwrap();
    assert_eq!(conf.worker_processes, 4);
    assert!(!conf.daemon);
    assert!(!conf.master);
    assert_eq!(conf.pid_path, PathBuf::from("run/peridot.pid"));
    assert_eq!(conf.priority, -5);
    assert_eq!(conf.rlimit_nofile, Some(8192));
}

#[test]
fn test_cpu_affinity_masks_parse_as_binary() {
    let mut cycle = parse_ready_cycle();
    parse(&mut cycle, "worker_cpu_affinity 0101 1010;").unwrap();

    let conf = cycle.conf_ref::<CoreConf>(CORE_MODULE_INDEX).unwrap();
    assert_eq!(conf.cpu_affinity, vec![0b0101, 0b1010]);
}

#[test]
fn test_unknown_directive_reports_file_and_line() {
    let mut cycle = parse_ready_cycle();
    let err = parse(&mut cycle, "daemon on;\nbogus_directive on;\n").unwrap_err();

    match err {
        PeridotError::Config { file, line, message } => {
            assert_eq!(file, "test.conf");
            assert_eq!(line, 2);
            assert!(message.contains("unknown directive"), "{message}");
        }
        other => panic!("expected a config error, got {other}"),
    }
}

#[test]
fn test_wrong_argument_count_is_rejected() {
    let mut cycle = parse_ready_cycle();
    let err = parse(&mut cycle, "worker_processes;").unwrap_err();
    assert!(err.to_string().contains("invalid number of arguments"));
}

#[test]
fn test_invalid_flag_value_is_rejected() {
    let mut cycle = parse_ready_cycle();
    let err = parse(&mut cycle, "daemon yes;").unwrap_err();
    assert!(err.to_string().contains("on"), "{err}");
}

#[test]
fn test_block_on_simple_directive_is_rejected() {
    let mut cycle = parse_ready_cycle();
    let err = parse(&mut cycle, "daemon { }").unwrap_err();
    assert!(err.to_string().contains("\";\""), "{err}");
}

#[test]
fn test_missing_semicolon_is_rejected() {
    let mut cycle = parse_ready_cycle();
    let err = parse(&mut cycle, "daemon on").unwrap_err();
    assert!(err.to_string().contains("unexpected end of file"), "{err}");
}

#[test]
fn test_quoted_arguments_and_comments() {
    let mut cycle = parse_ready_cycle();
    parse(
        &mut cycle,
        "# leading comment\npid \"run dir/peridot.pid\"; # trailing\n",
    )
    .unwrap();

    let conf = cycle.conf_ref::<CoreConf>(CORE_MODULE_INDEX).unwrap();
    assert_eq!(conf.pid_path, PathBuf::from("run dir/peridot.pid"));
}

#[test]
fn test_worker_processes_auto_resolves_to_cpu_count() {
    let mut cycle = parse_ready_cycle();
    parse(&mut cycle, "worker_processes auto;").unwrap();

    let conf = cycle.conf_ref::<CoreConf>(CORE_MODULE_INDEX).unwrap();
    assert!(conf.worker_processes >= 1);
}
