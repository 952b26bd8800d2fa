use std::any::Any;
use std::net::SocketAddr;
use std::ptr::NonNull;
use std::sync::atomic::{AtomicUsize, Ordering};

use libc::c_void;
use peridot::core::conf::{Command, ConfContext};
use peridot::core::cycle::{BuildOptions, Cycle, build_cycle};
use peridot::core::errors::PeridotError;
use peridot::core::listening::LsFlags;
use peridot::core::module::{Module, ModuleRegistry};

static FRESH_INITS: AtomicUsize = AtomicUsize::new(0);
static REUSED_INITS: AtomicUsize = AtomicUsize::new(0);
static LAST_OLD_DATA: AtomicUsize = AtomicUsize::new(0);

fn set_listen(
    cf: &mut ConfContext<'_>,
    _cmd: &Command,
    args: &[String],
    _conf: Option<&mut dyn Any>,
) -> Result<(), String> {
    let addr: SocketAddr = args[0]
        .parse()
        .map_err(|_| format!("invalid address \"{}\"", args[0]))?;
    cf.cycle.register_listening(addr).map_err(|e| e.to_string())?;
    Ok(())
}

fn set_zone(
    cf: &mut ConfContext<'_>,
    _cmd: &Command,
    args: &[String],
    _conf: Option<&mut dyn Any>,
) -> Result<(), String> {
    let size: usize = args[1]
        .parse()
        .map_err(|_| format!("invalid size \"{}\"", args[1]))?;

    let zone = cf
        .cycle
        .register_shared_zone(&args[0], size, 42)
        .map_err(|e| e.to_string())?;

    zone.init = Some(Box::new(|zone, old_data: Option<NonNull<c_void>>| {
        match old_data {
            Some(old) => {
                REUSED_INITS.fetch_add(1, Ordering::SeqCst);
                LAST_OLD_DATA.store(old.as_ptr() as usize, Ordering::SeqCst);
            }
            None => {
                FRESH_INITS.fetch_add(1, Ordering::SeqCst);
            }
        }
        // stash a consumer payload so the next generation can find it
        zone.data = zone.addr.unwrap().as_ptr() as *mut c_void;
        Ok(())
    }));
    Ok(())
}

static TEST_COMMANDS: &[Command] = &[
    Command::takes1("listen", set_listen),
    Command::takes_range("zone", 2, 2, set_zone),
];

struct TestModule;

impl Module for TestModule {
    fn name(&self) -> &'static str {
        "test_registrar"
    }

    fn commands(&self) -> &'static [Command] {
        TEST_COMMANDS
    }
}

fn fd_is_open(fd: i32) -> bool {
    unsafe { libc::fcntl(fd, libc::F_GETFD) != -1 }
}

#[test]
fn test_cold_start_reload_resize_and_failed_reload() {
    let dir = tempfile::tempdir().unwrap();
    let conf_path = dir.path().join("peridot.conf");
    let pid_path = dir.path().join("peridot.pid");

    let base = format!(
        "worker_processes 1;\npid {};\nlisten 127.0.0.1:0;\n",
        pid_path.display()
    );

    std::fs::write(&conf_path, format!("{base}zone z1 65536;\n")).unwrap();

    let modules = ModuleRegistry::bootstrap(vec![Box::new(TestModule)]);
    let mut boot = Cycle::bootstrap(
        modules,
        dir.path().to_path_buf(),
        conf_path.clone(),
        String::new(),
    )
    .unwrap();

    // --- cold start ---
    let mut c1 = build_cycle(&mut boot, &BuildOptions::normal()).unwrap();

    assert_eq!(c1.listening.len(), 1);
    let fd = c1.listening[0].fd;
    assert!(fd >= 0);
    assert!(
        c1.listening[0]
            .flags
            .contains(LsFlags::OPEN | LsFlags::BOUND | LsFlags::LISTEN)
    );
    assert!(!c1.listening[0].flags.contains(LsFlags::INHERITED));

    let zone_addr = {
        let zone = c1.shared_zones.iter().next().unwrap();
        assert_eq!(zone.name, "z1");
        assert!(!zone.exists);
        zone.addr.unwrap()
    };
    assert_eq!(FRESH_INITS.load(Ordering::SeqCst), 1);
    assert_eq!(REUSED_INITS.load(Ordering::SeqCst), 0);
    assert!(c1.core_conf().worker_processes == 1);

    // --- reload with an unchanged configuration ---
    let mut c2 = build_cycle(&mut c1, &BuildOptions::normal()).unwrap();
    drop(c1);

    assert_eq!(c2.listening[0].fd, fd, "listening fd must be inherited");
    assert!(c2.listening[0].flags.contains(LsFlags::INHERITED));
    assert!(fd_is_open(fd));

    {
        let zone = c2.shared_zones.iter().next().unwrap();
        assert!(zone.exists);
        assert_eq!(zone.addr.unwrap(), zone_addr, "zone mapping must be preserved");
    }
    assert_eq!(REUSED_INITS.load(Ordering::SeqCst), 1);
    assert_eq!(
        LAST_OLD_DATA.load(Ordering::SeqCst),
        zone_addr.as_ptr() as usize,
        "the old generation's payload pointer must be handed over"
    );

    // reload twice is observationally the same as reloading once
    let mut c3 = build_cycle(&mut c2, &BuildOptions::normal()).unwrap();
    drop(c2);
    assert_eq!(c3.listening[0].fd, fd);
    assert_eq!(REUSED_INITS.load(Ordering::SeqCst), 2);
    assert_eq!(FRESH_INITS.load(Ordering::SeqCst), 1);

    // --- reload with the zone resized ---
    std::fs::write(&conf_path, format!("{base}zone z1 131072;\n")).unwrap();

    let mut c4 = build_cycle(&mut c3, &BuildOptions::normal()).unwrap();
    drop(c3);

    assert_eq!(c4.listening[0].fd, fd, "resizing a zone must not touch sockets");
    {
        let zone = c4.shared_zones.iter().next().unwrap();
        assert!(!zone.exists, "a resized zone is a fresh mapping");
        assert_eq!(zone.size, 131072);
    }
    assert_eq!(FRESH_INITS.load(Ordering::SeqCst), 2);

    // --- reload with a broken configuration ---
    std::fs::write(&conf_path, format!("{base}bogus_directive on;\n")).unwrap();

    let err = build_cycle(&mut c4, &BuildOptions::normal()).unwrap_err();
    match err {
        PeridotError::Config { line, ref message, .. } => {
            assert_eq!(line, 4);
            assert!(message.contains("unknown directive"), "{message}");
        }
        ref other => panic!("expected a config error, got {other}"),
    }

    // the running generation is untouched
    assert!(fd_is_open(fd));
    assert_eq!(c4.listening[0].fd, fd);
    assert!(!c4.listening[0].flags.contains(LsFlags::REMAIN));
    assert!(c4.shared_zones.iter().next().unwrap().addr.is_some());

    // --- a zero-sized zone never commits ---
    std::fs::write(&conf_path, format!("{base}zone z1 0;\n")).unwrap();
    let err = build_cycle(&mut c4, &BuildOptions::normal()).unwrap_err();
    assert!(matches!(err, PeridotError::ZoneSizeConflict(..)));
    assert!(fd_is_open(fd));
}

#[test]
fn test_test_config_mode_writes_pid_and_stops_short() {
    let dir = tempfile::tempdir().unwrap();
    let conf_path = dir.path().join("peridot.conf");
    let pid_path = dir.path().join("test.pid");

    std::fs::write(
        &conf_path,
        format!("worker_processes 2;\npid {};\nlisten 127.0.0.1:0;\n", pid_path.display()),
    )
    .unwrap();

    let modules = ModuleRegistry::bootstrap(vec![Box::new(TestModule)]);
    let mut boot = Cycle::bootstrap(
        modules,
        dir.path().to_path_buf(),
        conf_path,
        String::new(),
    )
    .unwrap();

    let cycle = build_cycle(
        &mut boot,
        &BuildOptions {
            test_config: true,
            signaller: false,
        },
    )
    .unwrap();

    // the pid file exists, but no socket was opened
    assert!(pid_path.exists());
    assert_eq!(cycle.listening[0].fd, -1);
    assert_eq!(cycle.core_conf().worker_processes, 2);
}

#[test]
fn test_file_directives_override_the_command_line() {
    let dir = tempfile::tempdir().unwrap();
    let conf_path = dir.path().join("peridot.conf");
    std::fs::write(&conf_path, "worker_processes 2;\n").unwrap();

    let modules = ModuleRegistry::bootstrap(vec![Box::new(TestModule)]);
    let mut boot = Cycle::bootstrap(
        modules,
        dir.path().to_path_buf(),
        conf_path,
        "worker_processes 8;".to_string(),
    )
    .unwrap();

    let cycle = build_cycle(
        &mut boot,
        &BuildOptions {
            test_config: false,
            signaller: true,
        },
    )
    .unwrap();

    // the file is parsed after the snippet, so the file's value wins; the
    // snippet seeds defaults the file may omit
    assert_eq!(cycle.core_conf().worker_processes, 2);
}
