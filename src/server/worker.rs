// src/server/worker.rs

//! Worker and helper process lifecycle: privilege and limit setup after
//! fork, the serve loop, channel-message handling, and the cache-manager /
//! cache-loader helper bodies.

use std::sync::atomic::Ordering;
use std::time::Duration;

use nix::sys::resource::{Resource, setrlimit};
use nix::unistd::{Pid, chdir, getpid, initgroups, setgid, setuid};
use parking_lot::Mutex;
use rand::rngs::SmallRng;
use rand::SeedableRng;
use tracing::{debug, error, info, warn};

use crate::core::cycle::Cycle;
use crate::core::errors::PeridotError;
use crate::core::files;
use crate::core::listening;
use crate::core::time;
use crate::server::channel::{
    self, CMD_CLOSE_CHANNEL, CMD_OPEN_CHANNEL, CMD_QUIT, CMD_REOPEN, CMD_TERMINATE, ChannelRead,
};
use crate::server::events::{EventProcessor, PollProcessor, wait_channel};
use crate::server::process::{self, CHANNEL_FD, PROCESS_SLOT, Process, ProcessKind, ProcessType};
use crate::server::signals;

/// Delay before the one-shot cache loader runs.
const CACHE_LOADER_DELAY: Duration = Duration::from_secs(60);

/// Fallback cadence for the cache manager when no handler asks for less.
const CACHE_MANAGER_INTERVAL: Duration = Duration::from_secs(10);

/// Connection budget for helper processes.
const HELPER_CONNECTIONS: usize = 512;

/// Per-worker PRNG, reseeded after fork from the pid and the clock.
static WORKER_RNG: Mutex<Option<SmallRng>> = Mutex::new(None);

/// Runs a closure against the worker's PRNG.
pub fn with_rng<T>(f: impl FnOnce(&mut SmallRng) -> T) -> T {
    let mut guard = WORKER_RNG.lock();
    let rng = guard.get_or_insert_with(|| SmallRng::seed_from_u64(rng_seed(getpid())));
    f(rng)
}

fn rng_seed(pid: Pid) -> u64 {
    ((pid.as_raw() as u64) << 16) ^ time::monotonic_ms()
}

/// The worker body entered right after fork. Exits the process, never
/// returns.
pub fn worker_process_cycle(cycle: &mut Cycle, index: usize) -> ! {
    process::set_process_type(ProcessType::Worker);

    if let Err(e) = worker_process_init(cycle, Some(index)) {
        error!("worker init failed: {e}");
        std::process::exit(2);
    }

    info!(index, "worker started");

    let mut processor = PollProcessor::default();
    let mut exiting = false;

    loop {
        if exiting {
            close_idle_connections(cycle);
            if cycle.active_connections.get() == 0 {
                worker_process_exit(cycle);
            }
        }

        processor.process_events_and_timers(cycle);
        time::update();

        if signals::take(&signals::TERMINATE) {
            info!("exiting");
            worker_process_exit(cycle);
        }

        if signals::take(&signals::QUIT) && !exiting {
            info!("gracefully shutting down");
            exiting = true;
            listening::close_listening_sockets(&mut cycle.listening);
        }

        if signals::take(&signals::REOPEN) {
            info!("reopening files");
            files::reopen_files(&mut cycle.open_files);
        }
    }
}

/// Per-worker initialization, in the order the master relies on:
/// environment, priority, limits, credentials, affinity, working directory,
/// signal mask, PRNG, listening bookkeeping, module hooks, channels.
pub fn worker_process_init(
    cycle: &mut Cycle,
    index: Option<usize>,
) -> Result<(), PeridotError> {
    let conf = cycle.core_conf();

    for entry in &conf.env {
        if let Some((key, value)) = entry.split_once('=') {
            unsafe { std::env::set_var(key, value) };
        }
    }

    if conf.priority != 0
        && unsafe { libc::setpriority(libc::PRIO_PROCESS as _, 0, conf.priority) } == -1
    {
        error!(
            "setpriority({}) failed: {}",
            conf.priority,
            std::io::Error::last_os_error()
        );
    }

    if let Some(nofile) = conf.rlimit_nofile
        && let Err(e) = setrlimit(Resource::RLIMIT_NOFILE, nofile, nofile)
    {
        error!("setrlimit(RLIMIT_NOFILE, {nofile}) failed: {e}");
    }

    if let Some(core) = conf.rlimit_core
        && let Err(e) = setrlimit(Resource::RLIMIT_CORE, core, core)
    {
        error!("setrlimit(RLIMIT_CORE, {core}) failed: {e}");
    }

    #[cfg(target_os = "linux")]
    if let Some(sigpending) = conf.rlimit_sigpending
        && let Err(e) = setrlimit(Resource::RLIMIT_SIGPENDING, sigpending, sigpending)
    {
        error!("setrlimit(RLIMIT_SIGPENDING, {sigpending}) failed: {e}");
    }

    if nix::unistd::Uid::effective().is_root()
        && let (Some(uid), Some(gid)) = (conf.uid, conf.gid)
    {
        setgid(gid).map_err(|e| PeridotError::sys("setgid", e))?;

        if let Some(name) = &conf.username
            && let Ok(cname) = std::ffi::CString::new(name.as_str())
            && let Err(e) = initgroups(&cname, gid)
        {
            error!("initgroups({name}) failed: {e}");
        }

        setuid(uid).map_err(|e| PeridotError::sys("setuid", e))?;
    }

    if let Some(index) = index
        && !conf.cpu_affinity.is_empty()
    {
        let mask = conf
            .cpu_affinity
            .get(index)
            .or_else(|| conf.cpu_affinity.last())
            .copied()
            .unwrap_or(0);
        if mask != 0 {
            set_cpu_affinity(mask);
        }
    }

    if let Some(dir) = conf.working_directory.clone()
        && let Err(e) = chdir(dir.as_path())
    {
        error!("chdir(\"{}\") failed: {e}", dir.display());
    }

    signals::unblock_all()?;

    *WORKER_RNG.lock() = Some(SmallRng::seed_from_u64(rng_seed(getpid())));

    for ls in cycle.listening.iter_mut() {
        ls.previous = None;
    }

    let modules = cycle.modules.clone();
    for slot in modules.iter() {
        slot.module.init_process(cycle)?;
    }

    close_sibling_channels();

    // the remaining channel read end is picked up by the event processor
    Ok(())
}

fn set_cpu_affinity(mask: u64) {
    let mut set = nix::sched::CpuSet::new();
    for cpu in 0..64 {
        if mask & (1 << cpu) != 0
            && let Err(e) = set.set(cpu)
        {
            error!("cpu affinity bit {cpu}: {e}");
        }
    }
    info!("set cpu affinity mask {mask:b}");
    if let Err(e) = nix::sched::sched_setaffinity(Pid::from_raw(0), &set) {
        error!("sched_setaffinity() failed: {e}");
    }
}

/// Closes the channel ends this worker must not hold: the worker-side end of
/// every sibling and the master-side end of its own pair.
fn close_sibling_channels() {
    let own_slot = PROCESS_SLOT.load(Ordering::Acquire);
    let mut table = process::processes();

    for (i, p) in table.iter_mut().enumerate() {
        if p.pid == -1 || i == own_slot {
            continue;
        }
        if p.channel[1] != -1 {
            if unsafe { libc::close(p.channel[1]) } == -1 {
                error!("close() sibling channel failed: {}", std::io::Error::last_os_error());
            }
            p.channel[1] = -1;
        }
    }

    if own_slot < table.len() && table[own_slot].channel[0] != -1 {
        if unsafe { libc::close(table[own_slot].channel[0]) } == -1 {
            error!("close() own channel failed: {}", std::io::Error::last_os_error());
        }
        table[own_slot].channel[0] = -1;
    }
}

fn worker_process_exit(cycle: &mut Cycle) -> ! {
    let modules = cycle.modules.clone();
    for slot in modules.iter() {
        slot.module.exit_process(cycle);
    }
    info!("exit");
    std::process::exit(0);
}

/// Force-closes idle connections so a graceful exit is not held up by
/// keepalive peers.
fn close_idle_connections(cycle: &mut Cycle) {
    let mut reusable = cycle.reusable_connections.borrow_mut();
    if reusable.is_empty() {
        return;
    }
    let n = reusable.len();
    reusable.clear();
    let active = cycle.active_connections.get();
    cycle.active_connections.set(active.saturating_sub(n));
    debug!(closed = n, "reclaimed idle connections");
}

/// Drains the command channel, translating each record into the same flags
/// the signal handler sets.
pub fn handle_channel_messages() {
    let fd = CHANNEL_FD.load(Ordering::Acquire);
    if fd == -1 {
        return;
    }

    loop {
        match channel::read_channel(fd) {
            Ok(ChannelRead::Message(msg)) => {
                debug!(command = msg.command, "channel command");
                match msg.command {
                    CMD_QUIT => signals::QUIT.store(true, Ordering::Release),
                    CMD_TERMINATE => signals::TERMINATE.store(true, Ordering::Release),
                    CMD_REOPEN => signals::REOPEN.store(true, Ordering::Release),
                    CMD_OPEN_CHANNEL => register_sibling(msg.slot, msg.pid, msg.fd),
                    CMD_CLOSE_CHANNEL => forget_sibling(msg.slot, msg.pid),
                    other => warn!(command = other, "unknown channel command"),
                }
            }
            Ok(ChannelRead::WouldBlock) => break,
            Ok(ChannelRead::Closed) => {
                // the master is gone; treat it as a termination order
                warn!("command channel closed");
                signals::TERMINATE.store(true, Ordering::Release);
                break;
            }
            Err(e) => {
                error!("channel read failed: {e}");
                break;
            }
        }
    }
}

fn register_sibling(slot: i32, pid: i32, fd: i32) {
    debug!(slot, pid, fd, "register sibling channel");
    let mut table = process::processes();
    let slot = slot as usize;

    while table.len() <= slot {
        table.push(Process {
            pid: -1,
            name: "worker process",
            kind: ProcessKind::Worker { index: 0 },
            channel: [-1, -1],
            status: 0,
            exiting: false,
            exited: false,
            detached: false,
            respawn: false,
            just_spawn: false,
        });
    }

    table[slot].pid = pid;
    table[slot].exited = false;
    table[slot].channel[0] = fd;
}

fn forget_sibling(slot: i32, pid: i32) {
    let mut table = process::processes();
    let slot = slot as usize;
    if slot >= table.len() {
        return;
    }
    if table[slot].pid != pid {
        debug!(slot, pid, recorded = table[slot].pid, "close channel for stale pid");
    }
    if table[slot].channel[0] != -1 {
        if unsafe { libc::close(table[slot].channel[0]) } == -1 {
            error!("close() sibling channel failed: {}", std::io::Error::last_os_error());
        }
        table[slot].channel[0] = -1;
    }
    table[slot].pid = -1;
}

/// The cache-manager / cache-loader helper body. Helpers initialize like a
/// worker, drop every listening socket, and service the configured path
/// handlers on a timer; the loader runs its handlers once and exits.
pub fn cache_helper_cycle(cycle: &mut Cycle, loader: bool) -> ! {
    process::set_process_type(ProcessType::Helper);
    cycle.connection_n = HELPER_CONNECTIONS;

    if let Err(e) = worker_process_init(cycle, None) {
        error!("cache helper init failed: {e}");
        std::process::exit(2);
    }

    // helpers never accept
    for ls in cycle.listening.iter_mut() {
        ls.flags.remove(crate::core::listening::LsFlags::REMAIN);
    }
    listening::close_listening_sockets(&mut cycle.listening);

    let name = if loader { "cache loader" } else { "cache manager" };
    info!("{name} started");

    let mut delay = if loader {
        CACHE_LOADER_DELAY
    } else {
        Duration::ZERO
    };
    let mut deadline = time::monotonic_ms() + delay.as_millis() as u64;

    loop {
        wait_channel(delay.min(Duration::from_millis(500)));
        handle_channel_messages();
        time::update();

        if signals::take(&signals::TERMINATE) || signals::take(&signals::QUIT) {
            info!("exiting");
            worker_process_exit(cycle);
        }
        if signals::take(&signals::REOPEN) {
            files::reopen_files(&mut cycle.open_files);
        }

        if time::monotonic_ms() < deadline {
            continue;
        }

        if loader {
            for i in 0..cycle.paths.len() {
                if let Some(handler) = cycle.paths[i].loader {
                    handler(cycle);
                }
            }
            info!("cache loader done");
            worker_process_exit(cycle);
        }

        let mut next = CACHE_MANAGER_INTERVAL;
        for i in 0..cycle.paths.len() {
            if let Some(handler) = cycle.paths[i].manager {
                next = next.min(handler(cycle));
            }
        }
        delay = next;
        deadline = time::monotonic_ms() + delay.as_millis() as u64;
    }
}
