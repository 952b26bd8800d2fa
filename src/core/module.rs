// src/core/module.rs

//! The module registry and the built-in core module.
//!
//! Modules are statically enumerated at startup, in a fixed order, and each
//! receives two indices assigned exactly once: a global index (its slot in
//! every cycle's configuration table) and a per-kind index. Lifecycle hooks
//! default to no-ops so a module only implements what it cares about.

use std::any::Any;
use std::path::PathBuf;
use std::rc::Rc;

use nix::unistd::{Gid, Group, Uid, User};
use tracing::warn;

use crate::core::conf::{Command, ConfContext};
use crate::core::cycle::Cycle;
use crate::core::errors::PeridotError;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ModuleKind {
    Core,
    Event,
}

/// A pluggable unit with lifecycle hooks and a configuration command table.
/// Hooks run in registration order; every hook has a default no-op.
pub trait Module {
    fn name(&self) -> &'static str;

    fn kind(&self) -> ModuleKind {
        ModuleKind::Core
    }

    fn commands(&self) -> &'static [Command] {
        &[]
    }

    /// Core modules return a fresh configuration object for each new cycle.
    fn create_conf(&self, _cycle: &Cycle) -> Option<Box<dyn Any>> {
        None
    }

    /// Fills in defaults once the parser has run.
    fn init_conf(&self, _cycle: &Cycle, _conf: &mut dyn Any) -> Result<(), PeridotError> {
        Ok(())
    }

    fn init_master(&self, _cycle: &mut Cycle) -> Result<(), PeridotError> {
        Ok(())
    }

    /// Runs in the master for every module once the cycle is fully built.
    fn init_module(&self, _cycle: &mut Cycle) -> Result<(), PeridotError> {
        Ok(())
    }

    /// Runs in each worker after fork.
    fn init_process(&self, _cycle: &mut Cycle) -> Result<(), PeridotError> {
        Ok(())
    }

    fn init_thread(&self, _cycle: &mut Cycle) -> Result<(), PeridotError> {
        Ok(())
    }

    fn exit_thread(&self, _cycle: &mut Cycle) {}

    fn exit_process(&self, _cycle: &mut Cycle) {}

    fn exit_master(&self, _cycle: &mut Cycle) {}
}

pub struct ModuleSlot {
    pub module: Box<dyn Module>,
    /// Slot in the cycle's configuration table.
    pub index: usize,
    /// Index among the modules of the same kind.
    pub ctx_index: usize,
}

impl std::fmt::Debug for ModuleSlot {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ModuleSlot")
            .field("module", &self.module.name())
            .field("index", &self.index)
            .field("ctx_index", &self.ctx_index)
            .finish()
    }
}

#[derive(Debug)]
pub struct ModuleRegistry {
    slots: Vec<ModuleSlot>,
}

impl ModuleRegistry {
    /// Enumerates `modules` in order, assigning global and per-kind indices.
    /// The built-in core module always occupies slot 0.
    pub fn bootstrap(extra: Vec<Box<dyn Module>>) -> Rc<ModuleRegistry> {
        let mut modules: Vec<Box<dyn Module>> = vec![Box::new(CoreModule)];
        modules.extend(extra);

        let mut slots = Vec::with_capacity(modules.len());
        let mut per_kind = [0usize; 2];

        for (index, module) in modules.into_iter().enumerate() {
            let kind = module.kind() as usize;
            slots.push(ModuleSlot {
                module,
                index,
                ctx_index: per_kind[kind],
            });
            per_kind[kind] += 1;
        }

        Rc::new(ModuleRegistry { slots })
    }

    pub fn len(&self) -> usize {
        self.slots.len()
    }

    pub fn is_empty(&self) -> bool {
        self.slots.is_empty()
    }

    pub fn iter(&self) -> impl Iterator<Item = &ModuleSlot> {
        self.slots.iter()
    }

    pub fn get(&self, index: usize) -> Option<&ModuleSlot> {
        self.slots.get(index)
    }
}

/// Index of the built-in core module in every registry.
pub const CORE_MODULE_INDEX: usize = 0;

/// Configuration owned by the built-in core module.
pub struct CoreConf {
    pub daemon: bool,
    pub master: bool,
    pub worker_processes: usize,
    pub priority: i32,
    pub rlimit_nofile: Option<u64>,
    pub rlimit_core: Option<u64>,
    pub rlimit_sigpending: Option<u64>,
    /// CPU mask per worker slot; workers past the end reuse the last mask.
    pub cpu_affinity: Vec<u64>,
    pub username: Option<String>,
    pub uid: Option<Uid>,
    pub gid: Option<Gid>,
    pub pid_path: PathBuf,
    pub working_directory: Option<PathBuf>,
    pub env: Vec<String>,
}

impl CoreConf {
    fn unset() -> CoreConf {
        CoreConf {
            daemon: true,
            master: true,
            worker_processes: 0,
            priority: 0,
            rlimit_nofile: None,
            rlimit_core: None,
            rlimit_sigpending: None,
            cpu_affinity: Vec::new(),
            username: None,
            uid: None,
            gid: None,
            pid_path: PathBuf::new(),
            working_directory: None,
            env: Vec::new(),
        }
    }
}

pub struct CoreModule;

fn online_cpus() -> usize {
    let n = unsafe { libc::sysconf(libc::_SC_NPROCESSORS_ONLN) };
    if n < 1 { 1 } else { n as usize }
}

fn core<'a>(conf: &'a mut dyn Any) -> &'a mut CoreConf {
    conf.downcast_mut::<CoreConf>()
        .unwrap_or_else(|| unreachable!("core commands dispatch onto CoreConf"))
}

fn parse_flag(arg: &str) -> Result<bool, String> {
    match arg {
        "on" => Ok(true),
        "off" => Ok(false),
        _ => Err(format!("invalid value \"{arg}\", expected \"on\" or \"off\"")),
    }
}

fn set_daemon(
    _cf: &mut ConfContext<'_>,
    _cmd: &Command,
    args: &[String],
    conf: Option<&mut dyn Any>,
) -> Result<(), String> {
    core(conf.ok_or("core configuration missing")?).daemon = parse_flag(&args[0])?;
    Ok(())
}

fn set_master_process(
    _cf: &mut ConfContext<'_>,
    _cmd: &Command,
    args: &[String],
    conf: Option<&mut dyn Any>,
) -> Result<(), String> {
    core(conf.ok_or("core configuration missing")?).master = parse_flag(&args[0])?;
    Ok(())
}

fn set_worker_processes(
    _cf: &mut ConfContext<'_>,
    _cmd: &Command,
    args: &[String],
    conf: Option<&mut dyn Any>,
) -> Result<(), String> {
    let conf = core(conf.ok_or("core configuration missing")?);
    conf.worker_processes = if args[0] == "auto" {
        online_cpus()
    } else {
        args[0]
            .parse()
            .map_err(|_| format!("invalid number \"{}\"", args[0]))?
    };
    Ok(())
}

fn set_pid(
    _cf: &mut ConfContext<'_>,
    _cmd: &Command,
    args: &[String],
    conf: Option<&mut dyn Any>,
) -> Result<(), String> {
    core(conf.ok_or("core configuration missing")?).pid_path = PathBuf::from(&args[0]);
    Ok(())
}

fn set_user(
    _cf: &mut ConfContext<'_>,
    _cmd: &Command,
    args: &[String],
    conf: Option<&mut dyn Any>,
) -> Result<(), String> {
    let conf = core(conf.ok_or("core configuration missing")?);
    conf.username = Some(args[0].clone());

    let user = User::from_name(&args[0])
        .map_err(|e| format!("getpwnam(\"{}\") failed: {e}", args[0]))?
        .ok_or_else(|| format!("user \"{}\" not found", args[0]))?;
    conf.uid = Some(user.uid);

    conf.gid = Some(match args.get(1) {
        Some(group) => {
            Group::from_name(group)
                .map_err(|e| format!("getgrnam(\"{group}\") failed: {e}"))?
                .ok_or_else(|| format!("group \"{group}\" not found"))?
                .gid
        }
        None => user.gid,
    });
    Ok(())
}

fn set_worker_priority(
    _cf: &mut ConfContext<'_>,
    _cmd: &Command,
    args: &[String],
    conf: Option<&mut dyn Any>,
) -> Result<(), String> {
    let prio: i32 = args[0]
        .parse()
        .map_err(|_| format!("invalid priority \"{}\"", args[0]))?;
    if !(-20..=20).contains(&prio) {
        return Err(format!("priority {prio} out of range [-20, 20]"));
    }
    core(conf.ok_or("core configuration missing")?).priority = prio;
    Ok(())
}

fn set_rlimit_nofile(
    _cf: &mut ConfContext<'_>,
    _cmd: &Command,
    args: &[String],
    conf: Option<&mut dyn Any>,
) -> Result<(), String> {
    let n = args[0]
        .parse()
        .map_err(|_| format!("invalid number \"{}\"", args[0]))?;
    core(conf.ok_or("core configuration missing")?).rlimit_nofile = Some(n);
    Ok(())
}

fn set_rlimit_core(
    _cf: &mut ConfContext<'_>,
    _cmd: &Command,
    args: &[String],
    conf: Option<&mut dyn Any>,
) -> Result<(), String> {
    let n = args[0]
        .parse()
        .map_err(|_| format!("invalid size \"{}\"", args[0]))?;
    core(conf.ok_or("core configuration missing")?).rlimit_core = Some(n);
    Ok(())
}

fn set_rlimit_sigpending(
    _cf: &mut ConfContext<'_>,
    _cmd: &Command,
    args: &[String],
    conf: Option<&mut dyn Any>,
) -> Result<(), String> {
    let n = args[0]
        .parse()
        .map_err(|_| format!("invalid number \"{}\"", args[0]))?;
    core(conf.ok_or("core configuration missing")?).rlimit_sigpending = Some(n);
    Ok(())
}

fn set_cpu_affinity(
    _cf: &mut ConfContext<'_>,
    _cmd: &Command,
    args: &[String],
    conf: Option<&mut dyn Any>,
) -> Result<(), String> {
    let conf = core(conf.ok_or("core configuration missing")?);
    conf.cpu_affinity.clear();
    for mask in args {
        let mut bits = 0u64;
        for (i, ch) in mask.chars().rev().enumerate() {
            if i >= 64 {
                return Err(format!("cpu mask \"{mask}\" is too long"));
            }
            match ch {
                '1' => bits |= 1 << i,
                '0' => {}
                _ => return Err(format!("invalid cpu mask \"{mask}\"")),
            }
        }
        conf.cpu_affinity.push(bits);
    }
    Ok(())
}

fn set_working_directory(
    _cf: &mut ConfContext<'_>,
    _cmd: &Command,
    args: &[String],
    conf: Option<&mut dyn Any>,
) -> Result<(), String> {
    core(conf.ok_or("core configuration missing")?).working_directory =
        Some(PathBuf::from(&args[0]));
    Ok(())
}

fn set_env(
    _cf: &mut ConfContext<'_>,
    _cmd: &Command,
    args: &[String],
    conf: Option<&mut dyn Any>,
) -> Result<(), String> {
    core(conf.ok_or("core configuration missing")?)
        .env
        .push(args[0].clone());
    Ok(())
}

static CORE_COMMANDS: &[Command] = &[
    Command::takes1("daemon", set_daemon),
    Command::takes1("master_process", set_master_process),
    Command::takes1("worker_processes", set_worker_processes),
    Command::takes1("pid", set_pid),
    Command::takes_range("user", 1, 2, set_user),
    Command::takes1("worker_priority", set_worker_priority),
    Command::takes1("worker_rlimit_nofile", set_rlimit_nofile),
    Command::takes1("worker_rlimit_core", set_rlimit_core),
    Command::takes1("worker_rlimit_sigpending", set_rlimit_sigpending),
    Command::takes_range("worker_cpu_affinity", 1, 64, set_cpu_affinity),
    Command::takes1("working_directory", set_working_directory),
    Command::takes1("env", set_env),
];

impl Module for CoreModule {
    fn name(&self) -> &'static str {
        "core"
    }

    fn commands(&self) -> &'static [Command] {
        CORE_COMMANDS
    }

    fn create_conf(&self, _cycle: &Cycle) -> Option<Box<dyn Any>> {
        Some(Box::new(CoreConf::unset()))
    }

    fn init_conf(&self, cycle: &Cycle, conf: &mut dyn Any) -> Result<(), PeridotError> {
        let conf = core(conf);

        if conf.worker_processes == 0 {
            conf.worker_processes = 1;
        }
        if conf.pid_path.as_os_str().is_empty() {
            conf.pid_path = cycle.prefix.join("peridot.pid");
        } else if conf.pid_path.is_relative() {
            conf.pid_path = cycle.prefix.join(&conf.pid_path);
        }

        if conf.uid.is_some() && !Uid::effective().is_root() {
            warn!("the \"user\" directive only takes effect when running as root");
        }

        Ok(())
    }
}
