// src/server/mod.rs

//! Server-side orchestration: the supervisor, the worker bodies, and the
//! plumbing between them.

use std::path::PathBuf;

use tracing::info;

use crate::config::Opts;
use crate::core::cycle::{self, BuildOptions, Cycle, OldCycles};
use crate::core::errors::PeridotError;
use crate::core::module::ModuleRegistry;
use crate::core::pid::create_pidfile;
use crate::core::time;

pub mod channel;
pub mod events;
pub mod master;
pub mod process;
pub mod signals;
pub mod worker;

/// State the supervisor carries outside any one cycle.
pub struct ServerContext {
    /// Original argv, replayed on binary upgrade.
    pub argv: Vec<String>,
    /// The executable to re-exec for a binary upgrade.
    pub binary: PathBuf,
    pub old_cycles: OldCycles,
}

/// The main server startup function, orchestrating all setup phases.
pub fn run(options: Opts, modules: std::rc::Rc<ModuleRegistry>) -> Result<(), PeridotError> {
    signals::init()?;
    time::update();

    let mut init_cycle = Cycle::bootstrap(
        modules,
        options.prefix.clone(),
        options.conf_file(),
        options.directives.clone(),
    )?;

    let build = BuildOptions {
        test_config: options.test_config,
        signaller: false,
    };
    let cycle = cycle::build_cycle(&mut init_cycle, &build)?;

    if options.test_config {
        if !options.quiet {
            println!(
                "configuration file {} test is successful",
                cycle.conf_file.display()
            );
        }
        return Ok(());
    }

    let mut ctx = ServerContext {
        argv: options.argv.clone(),
        binary: options.binary.clone(),
        old_cycles: OldCycles::new(),
    };

    let daemon = cycle.core_conf().daemon;
    let master = cycle.core_conf().master;

    if daemon {
        daemonize()?;
    }

    // after daemonize so the file carries the surviving pid
    create_pidfile(&cycle.core_conf().pid_path, nix::unistd::getpid())?;

    info!(
        master,
        workers = cycle.core_conf().worker_processes,
        "starting"
    );

    if master {
        master::master_process_cycle(cycle, &mut ctx)
    } else {
        master::single_process_cycle(cycle, &mut ctx)
    }
}

/// Forks into the background and detaches from the controlling terminal.
fn daemonize() -> Result<(), PeridotError> {
    use nix::unistd::{ForkResult, fork, setsid};

    match unsafe { fork() }.map_err(|e| PeridotError::sys("fork", e))? {
        ForkResult::Parent { .. } => std::process::exit(0),
        ForkResult::Child => {}
    }

    setsid().map_err(|e| PeridotError::sys("setsid", e))?;

    unsafe {
        let fd = libc::open(c"/dev/null".as_ptr(), libc::O_RDWR);
        if fd == -1 {
            return Err(PeridotError::sys("open", nix::errno::Errno::last()));
        }
        libc::dup2(fd, libc::STDIN_FILENO);
        libc::dup2(fd, libc::STDOUT_FILENO);
        if fd > libc::STDERR_FILENO {
            libc::close(fd);
        }
    }

    Ok(())
}
