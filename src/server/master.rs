// src/server/master.rs

//! The master process: signal-driven supervision of the worker cohort,
//! configuration reload, graceful and forced shutdown, and binary upgrade.
//!
//! The loop parks in `sigsuspend`; every state change arrives as a flag set
//! by the signal handler or as a reaped child.

use std::path::PathBuf;
use std::time::Duration;

use nix::sys::signal::{Signal, kill};
use nix::unistd::Pid;
use tracing::{debug, error, info, warn};

use crate::core::cycle::{self, BuildOptions, Cycle};
use crate::core::errors::PeridotError;
use crate::core::files;
use crate::core::listening;
use crate::core::pid::{OLDBIN_SUFFIX, delete_pidfile};
use crate::core::time;
use crate::server::channel::{
    self, CMD_CLOSE_CHANNEL, CMD_OPEN_CHANNEL, CMD_QUIT, CMD_REOPEN, CMD_TERMINATE, ChannelMsg,
};
use crate::server::process::{
    self, NEW_BINARY, ProcessKind, ProcessType, Respawn, Spawned, spawn_process,
};
use crate::server::worker;
use crate::server::{ServerContext, signals};

/// Settling delay between spawning a fresh cohort and asking the old one to
/// quit during a reload.
const RELOAD_SETTLE: Duration = Duration::from_millis(100);

/// First interval of the forced-termination backoff ladder.
const TERMINATE_DELAY_MS: u64 = 50;

/// Once the ladder exceeds this, workers get SIGKILL.
const TERMINATE_KILL_THRESHOLD_MS: u64 = 1000;

/// Runs the master loop; returns when the process should exit.
pub fn master_process_cycle(
    mut cycle: Cycle,
    ctx: &mut ServerContext,
) -> Result<(), PeridotError> {
    process::set_process_type(ProcessType::Master);
    signals::block()?;

    let worker_n = cycle.core_conf().worker_processes;
    start_worker_processes(&mut cycle, worker_n, Respawn::Respawn)?;
    start_cache_manager_processes(&mut cycle, false)?;

    cycle::publish(&cycle);

    let mut delay: u64 = 0;
    let mut sigio: i32 = 0;
    let mut live = true;
    let mut terminating = false;
    let mut quitting = false;
    let mut restart = false;
    let mut noaccepting = false;

    loop {
        if delay > 0 {
            if signals::take(&signals::SIGALRM) {
                sigio = 0;
                delay *= 2;
            }
            debug!(delay, "termination cycle");
            if let Err(e) = signals::arm_timer(delay) {
                error!("{e}");
            }
        }

        debug!("sigsuspend");
        signals::suspend();
        time::update();

        if signals::take(&signals::REAP) {
            process::process_get_status();
            live = reap_children(&mut cycle, terminating, quitting, noaccepting, &mut restart);
        }

        if !live && (terminating || quitting) {
            master_process_exit(&mut cycle);
            return Ok(());
        }

        if signals::take(&signals::TERMINATE) {
            terminating = true;
        }

        if terminating {
            if delay == 0 {
                delay = TERMINATE_DELAY_MS;
            }

            if sigio > 0 {
                sigio -= 1;
                continue;
            }
            sigio = cycle.core_conf().worker_processes as i32 + 2;

            if delay > TERMINATE_KILL_THRESHOLD_MS {
                signal_workers(None, Signal::SIGKILL);
            } else {
                signal_workers(Some(CMD_TERMINATE), Signal::SIGTERM);
            }
            continue;
        }

        if signals::take(&signals::QUIT) {
            quitting = true;
        }

        if quitting {
            signal_workers(Some(CMD_QUIT), Signal::SIGQUIT);
            listening::close_listening_sockets(&mut cycle.listening);
            continue;
        }

        if signals::take(&signals::RECONFIGURE) {
            if NEW_BINARY.load(std::sync::atomic::Ordering::Acquire) != 0 {
                // an upgrade is pending: this HUP only asks for workers that
                // serve the current binary; the reload waits for the handover
                info!("start new workers during binary upgrade");
                let n = cycle.core_conf().worker_processes;
                start_worker_processes(&mut cycle, n, Respawn::Respawn)?;
                start_cache_manager_processes(&mut cycle, false)?;
                noaccepting = false;
                continue;
            }

            info!("reconfiguring");
            match cycle::build_cycle(&mut cycle, &BuildOptions::normal()) {
                Err(e @ PeridotError::Fatal(_)) => return Err(e),
                Err(e) => {
                    error!("reload failed, keeping the running configuration: {e}");
                    continue;
                }
                Ok(new_cycle) => {
                    // in master mode the superseded pool dies immediately;
                    // workers hold their own copy-on-write view
                    let old = std::mem::replace(&mut cycle, new_cycle);
                    drop(old);
                    cycle::publish(&cycle);

                    let n = cycle.core_conf().worker_processes;
                    start_worker_processes(&mut cycle, n, Respawn::JustRespawn)?;
                    start_cache_manager_processes(&mut cycle, true)?;

                    // let the fresh cohort establish before the old one quits
                    std::thread::sleep(RELOAD_SETTLE);

                    live = true;
                    signal_workers(Some(CMD_QUIT), Signal::SIGQUIT);
                }
            }
            continue;
        }

        if restart {
            restart = false;
            let n = cycle.core_conf().worker_processes;
            start_worker_processes(&mut cycle, n, Respawn::Respawn)?;
            start_cache_manager_processes(&mut cycle, false)?;
            live = true;
        }

        if signals::take(&signals::REOPEN) {
            info!("reopening files");
            files::reopen_files(&mut cycle.open_files);
            signal_workers(Some(CMD_REOPEN), Signal::SIGUSR1);
        }

        if signals::take(&signals::CHANGE_BINARY) {
            info!("changing binary");
            match upgrade_binary(&cycle, ctx) {
                Ok(pid) => {
                    NEW_BINARY.store(pid.as_raw(), std::sync::atomic::Ordering::Release)
                }
                Err(e) => error!("binary upgrade failed: {e}"),
            }
        }

        if signals::take(&signals::NOACCEPT) {
            noaccepting = true;
            signal_workers(Some(CMD_QUIT), Signal::SIGQUIT);
        }
    }
}

/// Spawns `n` workers, announcing each one's channel to the rest of the
/// cohort. Never returns in the child.
pub fn start_worker_processes(
    cycle: &mut Cycle,
    n: usize,
    respawn: Respawn,
) -> Result<(), PeridotError> {
    info!(workers = n, "start worker processes");
    for index in 0..n {
        spawn_worker(cycle, index, respawn)?;
    }
    Ok(())
}

fn spawn_worker(cycle: &mut Cycle, index: usize, respawn: Respawn) -> Result<(), PeridotError> {
    match spawn_process("worker process", ProcessKind::Worker { index }, respawn)? {
        Spawned::Parent { slot, .. } => {
            pass_open_channel(slot);
            Ok(())
        }
        Spawned::Child { .. } => worker::worker_process_cycle(cycle, index),
    }
}

/// Spawns the cache-manager (and, at cold start or reload, the one-shot
/// cache-loader) when any configured path registered a handler.
pub fn start_cache_manager_processes(
    cycle: &mut Cycle,
    respawn: bool,
) -> Result<(), PeridotError> {
    let manager_needed = cycle.paths.iter().any(|p| p.manager.is_some());
    let loader_needed = cycle.paths.iter().any(|p| p.loader.is_some());

    if manager_needed {
        let flavor = if respawn {
            Respawn::JustRespawn
        } else {
            Respawn::Respawn
        };
        match spawn_process("cache manager process", ProcessKind::CacheManager, flavor)? {
            Spawned::Parent { slot, .. } => pass_open_channel(slot),
            Spawned::Child { .. } => worker::cache_helper_cycle(cycle, false),
        }
    }

    if loader_needed {
        let flavor = if respawn {
            Respawn::JustSpawn
        } else {
            Respawn::NoRespawn
        };
        match spawn_process("cache loader process", ProcessKind::CacheLoader, flavor)? {
            Spawned::Parent { slot, .. } => pass_open_channel(slot),
            Spawned::Child { .. } => worker::cache_helper_cycle(cycle, true),
        }
    }

    Ok(())
}

/// Announces a newly spawned process to every other live child so each of
/// them can address it directly.
fn pass_open_channel(new_slot: usize) {
    let table = process::processes();
    let new = &table[new_slot];
    let msg = ChannelMsg {
        command: CMD_OPEN_CHANNEL,
        pid: new.pid,
        slot: new_slot as i32,
        fd: new.channel[0],
    };

    for (i, p) in table.iter().enumerate() {
        if i == new_slot || p.pid == -1 || p.exited || p.channel[0] == -1 {
            continue;
        }
        debug!(
            to = p.pid,
            pid = msg.pid,
            fd = msg.fd,
            "pass channel"
        );
        if let Err(e) = channel::write_channel(p.channel[0], &msg) {
            error!(to = p.pid, "pass channel failed: {e}");
        }
    }
}

/// Delivers a command to every worker, preferring the channel and falling
/// back to a signal. Freshly spawned processes are skipped exactly once.
fn signal_workers(command: Option<u32>, sig: Signal) {
    let mut table = process::processes();

    for i in 0..table.len() {
        let p = &mut table[i];
        debug!(
            pid = p.pid,
            exiting = p.exiting,
            exited = p.exited,
            detached = p.detached,
            respawn = p.respawn,
            just_spawn = p.just_spawn,
            "signal worker"
        );

        if p.pid == -1 || p.detached || p.exited {
            continue;
        }
        if p.just_spawn {
            p.just_spawn = false;
            continue;
        }

        if let Some(cmd) = command
            && p.channel[0] != -1
            && !p.exiting
        {
            let msg = ChannelMsg {
                command: cmd,
                pid: 0,
                slot: 0,
                fd: -1,
            };
            match channel::write_channel(p.channel[0], &msg) {
                Ok(()) => {
                    if matches!(cmd, CMD_QUIT | CMD_TERMINATE) {
                        p.exiting = true;
                    }
                    continue;
                }
                Err(e) => warn!(pid = p.pid, "channel write failed, using kill(): {e}"),
            }
        }

        if let Err(e) = kill(Pid::from_raw(p.pid), sig) {
            error!(pid = p.pid, "kill({sig}) failed: {e}");
            if e == nix::errno::Errno::ESRCH {
                p.exited = true;
                signals::REAP.store(true, std::sync::atomic::Ordering::Release);
            }
            continue;
        }

        if matches!(sig, Signal::SIGQUIT | Signal::SIGTERM) {
            p.exiting = true;
        }
    }
}

/// Processes exited children: closes their channels, tells the cohort,
/// respawns what should come back, and detects the upgraded binary's death.
fn reap_children(
    cycle: &mut Cycle,
    terminating: bool,
    quitting: bool,
    noaccepting: bool,
    restart: &mut bool,
) -> bool {
    let mut live = false;
    let mut to_respawn: Vec<ProcessKind> = Vec::new();

    {
        let mut table = process::processes();
        let len = table.len();

        for i in 0..len {
            if table[i].pid == -1 {
                continue;
            }

            if !table[i].exited {
                if !table[i].detached {
                    live = true;
                }
                continue;
            }

            let dead = table[i].clone();

            if !dead.detached {
                channel::close_channel(&dead.channel);
                table[i].channel = [-1, -1];

                let msg = ChannelMsg {
                    command: CMD_CLOSE_CHANNEL,
                    pid: dead.pid,
                    slot: i as i32,
                    fd: -1,
                };
                for j in 0..len {
                    if j == i || table[j].pid == -1 || table[j].exited || table[j].channel[0] == -1
                    {
                        continue;
                    }
                    if let Err(e) = channel::write_channel(table[j].channel[0], &msg) {
                        debug!(to = table[j].pid, "close channel notify failed: {e}");
                    }
                }
            }

            if dead.pid == NEW_BINARY.load(std::sync::atomic::Ordering::Acquire) {
                // the upgraded master died: take the pid file back and, if
                // accepting was stopped for the handover, resume it
                restore_old_pidfile(cycle);
                NEW_BINARY.store(0, std::sync::atomic::Ordering::Release);
                if noaccepting {
                    *restart = true;
                }
            }

            if dead.respawn && !dead.exiting && !terminating && !quitting {
                to_respawn.push(dead.kind);
            }

            table[i].pid = -1;
        }
    }

    for kind in to_respawn {
        let result = match kind {
            ProcessKind::Worker { index } => {
                info!(index, "respawning worker");
                spawn_worker(cycle, index, Respawn::Respawn)
            }
            ProcessKind::CacheManager => {
                match spawn_process("cache manager process", kind, Respawn::Respawn) {
                    Ok(Spawned::Parent { slot, .. }) => {
                        pass_open_channel(slot);
                        Ok(())
                    }
                    Ok(Spawned::Child { .. }) => worker::cache_helper_cycle(cycle, false),
                    Err(e) => Err(e),
                }
            }
            _ => Ok(()),
        };
        if let Err(e) = result {
            error!("could not respawn: {e}");
        } else {
            live = true;
        }
    }

    live
}

/// Renames the pid file aside and execs the new binary with the inherited
/// listening set in the environment. On failure the pid file is restored.
fn upgrade_binary(cycle: &Cycle, ctx: &ServerContext) -> Result<Pid, PeridotError> {
    let pid_path = cycle.core_conf().pid_path.clone();
    let old_path = oldbin_path(&pid_path);

    std::fs::rename(&pid_path, &old_path).map_err(|e| PeridotError::io(&pid_path, e))?;

    match process::exec_new_binary(&ctx.binary, &ctx.argv, &cycle.listening) {
        Ok(pid) => Ok(pid),
        Err(e) => {
            if let Err(re) = std::fs::rename(&old_path, &pid_path) {
                error!(
                    "rename() back to \"{}\" failed: {re}",
                    pid_path.display()
                );
            }
            Err(e)
        }
    }
}

fn oldbin_path(pid_path: &std::path::Path) -> PathBuf {
    let mut s = pid_path.as_os_str().to_owned();
    s.push(OLDBIN_SUFFIX);
    PathBuf::from(s)
}

fn restore_old_pidfile(cycle: &Cycle) {
    let pid_path = cycle.core_conf().pid_path.clone();
    let old_path = oldbin_path(&pid_path);
    if let Err(e) = std::fs::rename(&old_path, &pid_path) {
        error!(
            "rename() \"{}\" back to \"{}\" failed: {e}",
            old_path.display(),
            pid_path.display()
        );
    }
}

fn master_process_exit(cycle: &mut Cycle) {
    delete_pidfile(&cycle.core_conf().pid_path);

    let modules = cycle.modules.clone();
    for slot in modules.iter() {
        slot.module.exit_master(cycle);
    }

    listening::close_listening_sockets(&mut cycle.listening);
    info!("exit");
}

/// Single-process mode: one process both supervises and serves. Signals act
/// directly; superseded cycles go through deferred retirement.
pub fn single_process_cycle(
    mut cycle: Cycle,
    ctx: &mut ServerContext,
) -> Result<(), PeridotError> {
    process::set_process_type(ProcessType::Single);

    let modules = cycle.modules.clone();
    for slot in modules.iter() {
        slot.module
            .init_process(&mut cycle)
            .map_err(|e| PeridotError::Fatal(format!("init_process failed: {e}")))?;
    }

    cycle::publish(&cycle);

    let mut processor = crate::server::events::PollProcessor::default();
    let mut next_sweep = time::monotonic_ms() + cycle::OLD_CYCLE_SWEEP_INTERVAL.as_millis() as u64;

    loop {
        crate::server::events::EventProcessor::process_events_and_timers(
            &mut processor,
            &mut cycle,
        );
        time::update();

        if signals::take(&signals::TERMINATE) || signals::take(&signals::QUIT) {
            for slot in modules.iter() {
                slot.module.exit_process(&mut cycle);
                slot.module.exit_master(&mut cycle);
            }
            delete_pidfile(&cycle.core_conf().pid_path);
            info!("exit");
            return Ok(());
        }

        if signals::take(&signals::RECONFIGURE) {
            info!("reconfiguring");
            match cycle::build_cycle(&mut cycle, &BuildOptions::normal()) {
                Err(e @ PeridotError::Fatal(_)) => return Err(e),
                Err(e) => error!("reload failed, keeping the running configuration: {e}"),
                Ok(new_cycle) => {
                    let old = std::mem::replace(&mut cycle, new_cycle);
                    ctx.old_cycles.push(old);
                    cycle::publish(&cycle);
                    for slot in modules.iter() {
                        slot.module
                            .init_process(&mut cycle)
                            .map_err(|e| PeridotError::Fatal(format!("init_process failed: {e}")))?;
                    }
                }
            }
        }

        if signals::take(&signals::REOPEN) {
            info!("reopening files");
            files::reopen_files(&mut cycle.open_files);
        }

        if time::monotonic_ms() >= next_sweep {
            ctx.old_cycles.sweep();
            next_sweep = time::monotonic_ms() + cycle::OLD_CYCLE_SWEEP_INTERVAL.as_millis() as u64;
        }
    }
}
