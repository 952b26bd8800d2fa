// src/core/cycle.rs

//! The run context ("cycle"): the reloadable aggregate owning every piece of
//! long-lived server state for one configuration generation, and
//! `build_cycle`, which constructs the next generation from the current one.
//!
//! A build either commits completely or leaves the old cycle untouched:
//! everything is constructed and validated first, and only the commit step
//! releases the old generation's sockets, files and mappings.

use std::any::Any;
use std::cell::{Cell, RefCell};
use std::collections::VecDeque;
use std::net::SocketAddr;
use std::path::{Path, PathBuf};
use std::ptr;
use std::rc::Rc;
use std::sync::atomic::{AtomicPtr, Ordering};
use std::time::Duration;

use nix::unistd::getpid;
use tracing::{debug, error, info};

use crate::core::conf::{self, ConfContext};
use crate::core::errors::PeridotError;
use crate::core::files::{self, OpenFile};
use crate::core::list::List;
use crate::core::listening::{self, INHERIT_ENV, Listening, LsFlags};
use crate::core::module::{CORE_MODULE_INDEX, CoreConf, ModuleKind, ModuleRegistry};
use crate::core::pid::{create_pidfile, delete_pidfile};
use crate::core::pool::Pool;
use crate::core::shm::{self, ShmZone};
use crate::core::{array::Array, time};

/// Size of the pool backing each cycle.
pub const CYCLE_POOL_SIZE: usize = 16 * 1024;

/// Interval of the deferred-retirement sweep for old cycles.
pub const OLD_CYCLE_SWEEP_INTERVAL: Duration = Duration::from_secs(30);

/// Default number of connection slots a cycle accounts for.
pub const DEFAULT_CONNECTIONS: usize = 512;

/// Handler run by a cache-manager or cache-loader helper process; returns
/// the delay before the next invocation.
pub type PathHandler = fn(&Cycle) -> Duration;

/// A filesystem path the configuration requires to exist.
#[derive(Debug)]
pub struct ConfPath {
    pub name: PathBuf,
    pub manager: Option<PathHandler>,
    pub loader: Option<PathHandler>,
}

pub struct BuildOptions {
    /// Check the configuration, write the pid file, and stop short of
    /// touching sockets or zones.
    pub test_config: bool,
    /// Parse only far enough to learn the pid path (`-s` handling); touch
    /// nothing on disk.
    pub signaller: bool,
}

impl BuildOptions {
    pub fn normal() -> BuildOptions {
        BuildOptions {
            test_config: false,
            signaller: false,
        }
    }
}

#[derive(Debug)]
pub struct Cycle {
    pub pool: Rc<Pool>,
    pub modules: Rc<ModuleRegistry>,
    /// Per-module configuration table, indexed by module index.
    conf: Vec<Option<Box<dyn Any>>>,
    pub prefix: PathBuf,
    pub conf_file: PathBuf,
    pub conf_param: String,
    pub paths: Array<ConfPath>,
    pub open_files: List<OpenFile>,
    pub shared_zones: List<ShmZone>,
    pub listening: Array<Listening>,
    /// Connection slots available to each worker consuming this cycle.
    pub connection_n: usize,
    /// Live connections held against this cycle; shared with the event
    /// subsystem, read by the retirement sweep.
    pub active_connections: Rc<Cell<usize>>,
    /// Idle connections the event subsystem may reclaim under pressure.
    pub reusable_connections: RefCell<VecDeque<usize>>,
    /// True only for the bootstrap cycle built from command-line arguments.
    pub is_init: bool,
}

impl Cycle {
    /// Builds the bootstrap cycle from command-line data. It owns no
    /// configuration yet; its job is to seed the first real build.
    pub fn bootstrap(
        modules: Rc<ModuleRegistry>,
        prefix: PathBuf,
        conf_file: PathBuf,
        conf_param: String,
    ) -> Result<Cycle, PeridotError> {
        let pool = Pool::create(CYCLE_POOL_SIZE)?;

        let mut listening = Array::new(&pool, 10)?;
        if let Ok(value) = std::env::var(INHERIT_ENV) {
            for ls in listening::parse_inherited_env(&value)? {
                info!(addr = %ls.addr_text, fd = ls.fd, "inherited listening socket");
                listening.push(ls)?;
            }
        }

        let conf = (0..modules.len()).map(|_| None).collect();

        Ok(Cycle {
            paths: Array::new(&pool, 10)?,
            open_files: List::new(&pool, 20)?,
            shared_zones: List::new(&pool, 1)?,
            listening,
            conf,
            modules,
            prefix,
            conf_file,
            conf_param,
            connection_n: DEFAULT_CONNECTIONS,
            active_connections: Rc::new(Cell::new(0)),
            reusable_connections: RefCell::new(VecDeque::new()),
            is_init: true,
            pool,
        })
    }

    pub fn conf_ref<T: 'static>(&self, index: usize) -> Option<&T> {
        self.conf.get(index)?.as_ref()?.downcast_ref()
    }

    pub fn conf_mut<T: 'static>(&mut self, index: usize) -> Option<&mut T> {
        self.conf.get_mut(index)?.as_mut()?.downcast_mut()
    }

    /// Lifts a module's configuration out of the table; used by the parser
    /// so a command handler can borrow the conf and the cycle together.
    pub fn conf_table_take(&mut self, index: usize) -> Option<Box<dyn Any>> {
        self.conf.get_mut(index)?.take()
    }

    pub fn conf_table_put(&mut self, index: usize, conf: Option<Box<dyn Any>>) {
        if let Some(slot) = self.conf.get_mut(index) {
            *slot = conf;
        }
    }

    /// Appends a listening descriptor for `addr`. At most one socket per
    /// address is kept; re-registering an address returns the existing slot.
    pub fn register_listening(
        &mut self,
        addr: SocketAddr,
    ) -> Result<&mut Listening, PeridotError> {
        if let Some(i) = self.listening.iter().position(|ls| ls.addr == addr) {
            return Ok(&mut self.listening[i]);
        }
        self.listening.push(Listening::new(addr))
    }

    /// Finds or registers a shared zone; see `shm::register_zone`.
    pub fn register_shared_zone(
        &mut self,
        name: &str,
        size: usize,
        tag: u64,
    ) -> Result<&mut ShmZone, PeridotError> {
        shm::register_zone(&mut self.shared_zones, name, size, tag)
    }

    /// Finds or registers a file that is reopened on the reopen signal.
    pub fn register_open_file(&mut self, name: &Path) -> Result<&mut OpenFile, PeridotError> {
        files::register_open_file(&mut self.open_files, name)
    }

    /// Registers a path created at build time, optionally with helper
    /// handlers serviced by the cache-manager and cache-loader processes.
    pub fn register_path(
        &mut self,
        name: PathBuf,
        manager: Option<PathHandler>,
        loader: Option<PathHandler>,
    ) -> Result<&mut ConfPath, PeridotError> {
        if let Some(i) = self.paths.iter().position(|p| p.name == name) {
            return Ok(&mut self.paths[i]);
        }
        self.paths.push(ConfPath {
            name,
            manager,
            loader,
        })
    }

    /// The core module's configuration. Valid on any successfully built
    /// (non-bootstrap) cycle.
    pub fn core_conf(&self) -> &CoreConf {
        self.conf_ref::<CoreConf>(CORE_MODULE_INDEX)
            .unwrap_or_else(|| unreachable!("core conf exists after a successful build"))
    }
}

/// Process-wide pointer to the committed cycle, for diagnostic readers.
/// Stored with release ordering at publish, read with acquire.
static CURRENT_CYCLE: AtomicPtr<Cycle> = AtomicPtr::new(ptr::null_mut());

/// Publishes `cycle` as the process-wide current cycle. Call only once the
/// cycle has reached its final home.
pub fn publish(cycle: &Cycle) {
    CURRENT_CYCLE.store(cycle as *const Cycle as *mut Cycle, Ordering::Release);
}

/// The last published cycle pointer. Only the thread that owns the cycle may
/// dereference it.
pub fn current() -> *const Cycle {
    CURRENT_CYCLE.load(Ordering::Acquire)
}

/// Constructs the next configuration generation from `old`.
///
/// On success the new cycle is committed: the old generation's unmatched
/// sockets, files and mappings are released, and the caller decides whether
/// to drop `old` immediately (master, bootstrap) or hand it to `OldCycles`
/// for deferred retirement. On failure `old` is left fully intact.
pub fn build_cycle(old: &mut Cycle, options: &BuildOptions) -> Result<Cycle, PeridotError> {
    time::update();

    let pool = Pool::create(CYCLE_POOL_SIZE)?;

    let mut cycle = Cycle {
        paths: Array::new(&pool, old.paths.len().max(10))?,
        open_files: List::new(&pool, old.open_files.len().max(20))?,
        shared_zones: List::new(&pool, old.shared_zones.len().max(1))?,
        listening: Array::new(&pool, old.listening.len().max(10))?,
        conf: (0..old.modules.len()).map(|_| None).collect(),
        modules: old.modules.clone(),
        prefix: old.prefix.clone(),
        conf_file: old.conf_file.clone(),
        conf_param: old.conf_param.clone(),
        connection_n: old.connection_n,
        active_connections: Rc::new(Cell::new(0)),
        reusable_connections: RefCell::new(VecDeque::new()),
        is_init: false,
        pool,
    };

    // fresh configuration objects for every core module
    let modules = cycle.modules.clone();
    for slot in modules.iter() {
        if slot.module.kind() != ModuleKind::Core {
            continue;
        }
        if let Some(conf) = slot.module.create_conf(&cycle) {
            cycle.conf[slot.index] = Some(conf);
        }
    }

    // run the configuration parser; the temp pool dies with this scope
    {
        let temp_pool = Pool::create(CYCLE_POOL_SIZE)?;
        let conf_file = cycle.conf_file.clone();
        let conf_param = cycle.conf_param.clone();
        let mut ctx = ConfContext::new(&mut cycle, temp_pool, conf_file.display().to_string());

        if !conf_param.is_empty() {
            conf::parse_snippet(&mut ctx, &conf_param, "command line")?;
        }
        conf::parse_file(&mut ctx, &conf_file)?;
    }

    for slot in modules.iter() {
        if slot.module.kind() != ModuleKind::Core {
            continue;
        }
        if let Some(mut conf) = cycle.conf_table_take(slot.index) {
            let result = slot.module.init_conf(&cycle, conf.as_mut());
            cycle.conf_table_put(slot.index, Some(conf));
            result?;
        }
    }

    if options.signaller {
        return Ok(cycle);
    }

    if options.test_config {
        create_pidfile(&cycle.core_conf().pid_path, getpid())?;
        return Ok(cycle);
    }

    // a moved pid directive takes effect across the reload
    if !old.is_init
        && let Some(old_conf) = old.conf_ref::<CoreConf>(CORE_MODULE_INDEX)
        && old_conf.pid_path != cycle.core_conf().pid_path
    {
        create_pidfile(&cycle.core_conf().pid_path, getpid())?;
        delete_pidfile(&old_conf.pid_path);
    }

    if let Err(e) = create_paths(&cycle) {
        rollback(&mut cycle, old);
        return Err(e);
    }

    if let Err(e) = files::open_files(&mut cycle.open_files) {
        rollback(&mut cycle, old);
        return Err(e);
    }

    if let Err(e) = reconcile_shared_zones(&mut cycle, old) {
        rollback(&mut cycle, old);
        return Err(e);
    }

    reconcile_listening(&mut cycle, old);

    if let Err(e) = listening::open_listening_sockets(&mut cycle.listening) {
        rollback(&mut cycle, old);
        return Err(e);
    }
    listening::configure_listening_sockets(&mut cycle.listening);

    // past this point a failure is fatal: modules may have observed the new
    // configuration, so there is no state to fall back to
    for slot in modules.iter() {
        slot.module
            .init_module(&mut cycle)
            .map_err(|e| PeridotError::Fatal(format!("init_module failed: {e}")))?;
    }

    commit(&mut cycle, old);

    Ok(cycle)
}

/// Step 9: create configured paths, handing ownership to the configured
/// user when running as root.
fn create_paths(cycle: &Cycle) -> Result<(), PeridotError> {
    let conf = cycle.core_conf();
    for path in cycle.paths.iter() {
        if !path.name.exists() {
            std::fs::create_dir_all(&path.name).map_err(|e| PeridotError::io(&path.name, e))?;
        }
        if nix::unistd::Uid::effective().is_root()
            && let (Some(uid), Some(gid)) = (conf.uid, conf.gid)
        {
            nix::unistd::chown(path.name.as_path(), Some(uid), Some(gid))
                .map_err(|e| PeridotError::sys("chown", e))?;
        }
    }
    Ok(())
}

/// Step 11: adopt old mappings where name, tag and size all agree; map the
/// rest afresh. Old mappings left behind are released at commit.
fn reconcile_shared_zones(cycle: &mut Cycle, old: &Cycle) -> Result<(), PeridotError> {
    for zone in cycle.shared_zones.iter_mut() {
        if zone.size == 0 {
            return Err(PeridotError::ZoneSizeConflict(zone.name.clone(), 0, 0));
        }

        let matched = old
            .shared_zones
            .iter()
            .find(|o| o.name == zone.name && o.addr.is_some());

        match matched {
            Some(o) if o.tag == zone.tag && o.size == zone.size => {
                zone.addr = o.addr;
                zone.exists = true;
                debug!(name = %zone.name, "shared zone preserved across reload");
                zone.run_init(ptr::NonNull::new(o.data))?;
            }
            _ => {
                zone.map()?;
                zone.run_init(None)?;
            }
        }
    }
    Ok(())
}

/// Step 12: inherit descriptors from address-matching old entries; a changed
/// backlog re-arms listen() on the inherited fd.
fn reconcile_listening(cycle: &mut Cycle, old: &mut Cycle) {
    for ls in old.listening.iter_mut() {
        ls.flags.remove(LsFlags::REMAIN);
    }

    for (new_index, ls) in cycle.listening.iter_mut().enumerate() {
        if ls.fd != -1 {
            // inherited through the environment at bootstrap
            continue;
        }

        for (old_index, o) in old.listening.iter_mut().enumerate() {
            if o.flags.contains(LsFlags::IGNORE) || o.fd == -1 || o.addr != ls.addr {
                continue;
            }

            ls.fd = o.fd;
            ls.flags |= LsFlags::INHERITED | LsFlags::OPEN | LsFlags::BOUND;
            ls.previous = Some(old_index);
            o.flags |= LsFlags::REMAIN;

            if ls.backlog != o.backlog {
                ls.flags |= LsFlags::LISTEN;
            }

            debug!(addr = %ls.addr_text, fd = ls.fd, new_index, "listening socket inherited");
            break;
        }
    }
}

/// Step 15: the linearization point. The old generation's resources that the
/// new one did not adopt are released here.
fn commit(cycle: &mut Cycle, old: &mut Cycle) {
    listening::close_listening_sockets(&mut old.listening);
    files::close_files(&mut old.open_files);

    for o in old.shared_zones.iter_mut() {
        let adopted = cycle
            .shared_zones
            .iter()
            .any(|z| z.exists && z.name == o.name && z.tag == o.tag && z.size == o.size);
        if !adopted {
            o.unmap();
        } else {
            // the mapping now belongs to the new generation
            o.addr = None;
        }
    }

    info!("configuration committed");
}

/// Unwinds a failed build: everything the new cycle opened or mapped is
/// released, and the old cycle's reload markers are cleared. `old` ends up
/// exactly as it was before the build started.
fn rollback(cycle: &mut Cycle, old: &mut Cycle) {
    for ls in cycle.listening.iter_mut() {
        if ls.flags.contains(LsFlags::OPEN) && !ls.flags.contains(LsFlags::INHERITED) {
            if unsafe { libc::close(ls.fd) } == -1 {
                error!(
                    addr = %ls.addr_text,
                    "close() failed: {}",
                    std::io::Error::last_os_error()
                );
            }
            ls.fd = -1;
            ls.flags.remove(LsFlags::OPEN | LsFlags::BOUND | LsFlags::LISTEN);
        }
    }

    files::close_files(&mut cycle.open_files);

    for zone in cycle.shared_zones.iter_mut() {
        if !zone.exists {
            zone.unmap();
        } else {
            zone.addr = None;
        }
    }

    for ls in old.listening.iter_mut() {
        ls.flags.remove(LsFlags::REMAIN);
    }

    error!("configuration build failed, previous cycle left intact");
}

/// Deferred retirement for superseded cycles: a retired cycle's pool is
/// destroyed only once every connection it owns has closed. The supervisor
/// drives `sweep` from a recurring timer.
#[derive(Default)]
pub struct OldCycles {
    cycles: Vec<Cycle>,
}

impl OldCycles {
    pub fn new() -> OldCycles {
        OldCycles { cycles: Vec::new() }
    }

    pub fn push(&mut self, cycle: Cycle) {
        debug!(
            live = cycle.active_connections.get(),
            "cycle scheduled for retirement"
        );
        self.cycles.push(cycle);
    }

    /// Drops every retired cycle with no live connections. Returns how many
    /// cycles are still waiting.
    pub fn sweep(&mut self) -> usize {
        self.cycles.retain(|c| {
            let live = c.active_connections.get();
            if live == 0 {
                debug!("retired cycle reclaimed");
            }
            live != 0
        });
        self.cycles.len()
    }

    pub fn is_empty(&self) -> bool {
        self.cycles.is_empty()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn old_cycles_sweep_waits_for_connections() {
        let modules = ModuleRegistry::bootstrap(Vec::new());
        let cycle = Cycle::bootstrap(
            modules,
            PathBuf::from("."),
            PathBuf::from("peridot.conf"),
            String::new(),
        )
        .unwrap();

        let counter = cycle.active_connections.clone();
        counter.set(2);

        let mut old = OldCycles::new();
        old.push(cycle);
        assert_eq!(old.sweep(), 1);

        counter.set(0);
        assert_eq!(old.sweep(), 0);
        assert!(old.is_empty());
    }

    #[test]
    fn conf_table_take_and_put_round_trip() {
        let modules = ModuleRegistry::bootstrap(Vec::new());
        let mut cycle = Cycle::bootstrap(
            modules,
            PathBuf::from("."),
            PathBuf::from("peridot.conf"),
            String::new(),
        )
        .unwrap();

        cycle.conf_table_put(0, Some(Box::new(42u32)));
        assert_eq!(cycle.conf_ref::<u32>(0), Some(&42));

        let taken = cycle.conf_table_take(0).unwrap();
        assert!(cycle.conf_ref::<u32>(0).is_none());
        cycle.conf_table_put(0, Some(taken));
        assert_eq!(cycle.conf_ref::<u32>(0), Some(&42));
    }
}
