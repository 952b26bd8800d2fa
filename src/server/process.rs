// src/server/process.rs

//! The process table and the fork/exec plumbing around it: worker spawning,
//! exit harvesting, and the re-exec used by binary upgrades.

use std::ffi::CString;
use std::os::fd::RawFd;
use std::path::Path;
use std::sync::atomic::{AtomicI32, AtomicU8, AtomicUsize, Ordering};

use nix::sys::wait::{WaitPidFlag, WaitStatus, waitpid};
use nix::unistd::{ForkResult, Pid, execv, fork, getpid};
use once_cell::sync::Lazy;
use parking_lot::{Mutex, MutexGuard};
use tracing::{debug, error, info};

use crate::core::errors::PeridotError;
use crate::core::listening::{self, INHERIT_ENV, Listening};
use crate::server::channel;

pub const MAX_PROCESSES: usize = 1024;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ProcessKind {
    Worker { index: usize },
    CacheManager,
    CacheLoader,
    /// An exec'd binary; supervised for exit only.
    Detached,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Respawn {
    /// Restart when the child dies unexpectedly.
    Respawn,
    /// One-shot helper.
    NoRespawn,
    /// As `Respawn`, but skipped by the next worker broadcast.
    JustRespawn,
    /// As `NoRespawn`, but skipped by the next worker broadcast.
    JustSpawn,
}

#[derive(Debug, Clone)]
pub struct Process {
    pub pid: i32,
    pub name: &'static str,
    pub kind: ProcessKind,
    pub channel: [RawFd; 2],
    pub status: i32,
    pub exiting: bool,
    pub exited: bool,
    pub detached: bool,
    pub respawn: bool,
    pub just_spawn: bool,
}

static PROCESSES: Lazy<Mutex<Vec<Process>>> = Lazy::new(|| Mutex::new(Vec::new()));

/// This process's slot in the table (meaningful in children).
pub static PROCESS_SLOT: AtomicUsize = AtomicUsize::new(usize::MAX);

/// The channel read end of the current worker.
pub static CHANNEL_FD: AtomicI32 = AtomicI32::new(-1);

/// Pid of the upgraded binary's master while a handover is in flight.
pub static NEW_BINARY: AtomicI32 = AtomicI32::new(0);

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(u8)]
pub enum ProcessType {
    Single = 0,
    Master = 1,
    Worker = 2,
    Helper = 3,
}

static PROCESS_TYPE: AtomicU8 = AtomicU8::new(ProcessType::Single as u8);

pub fn set_process_type(t: ProcessType) {
    PROCESS_TYPE.store(t as u8, Ordering::Release);
}

pub fn process_type() -> ProcessType {
    match PROCESS_TYPE.load(Ordering::Acquire) {
        1 => ProcessType::Master,
        2 => ProcessType::Worker,
        3 => ProcessType::Helper,
        _ => ProcessType::Single,
    }
}

pub fn processes() -> MutexGuard<'static, Vec<Process>> {
    PROCESSES.lock()
}

pub enum Spawned {
    Parent { slot: usize, pid: Pid },
    Child { slot: usize },
}

/// Forks a supervised child with a fresh command channel. The table entry is
/// written before the fork so both sides observe it; the parent fills in the
/// child pid afterwards.
pub fn spawn_process(
    name: &'static str,
    kind: ProcessKind,
    respawn: Respawn,
) -> Result<Spawned, PeridotError> {
    let channel = channel::create_channel()?;

    let slot = {
        let mut table = processes();
        let slot = table
            .iter()
            .position(|p| p.pid == -1)
            .unwrap_or(table.len());
        if slot == table.len() {
            if slot >= MAX_PROCESSES {
                channel::close_channel(&channel);
                return Err(PeridotError::ChildSpawn(
                    name.into(),
                    nix::errno::Errno::EAGAIN,
                ));
            }
            table.push(Process {
                pid: 0,
                name,
                kind,
                channel,
                status: 0,
                exiting: false,
                exited: false,
                detached: false,
                respawn: matches!(respawn, Respawn::Respawn | Respawn::JustRespawn),
                just_spawn: matches!(respawn, Respawn::JustRespawn | Respawn::JustSpawn),
            });
        } else {
            table[slot] = Process {
                pid: 0,
                name,
                kind,
                channel,
                status: 0,
                exiting: false,
                exited: false,
                detached: false,
                respawn: matches!(respawn, Respawn::Respawn | Respawn::JustRespawn),
                just_spawn: matches!(respawn, Respawn::JustRespawn | Respawn::JustSpawn),
            };
        }
        slot
    };

    match unsafe { fork() } {
        Ok(ForkResult::Parent { child }) => {
            let mut table = processes();
            table[slot].pid = child.as_raw();
            info!(name, pid = child.as_raw(), slot, "spawned");
            Ok(Spawned::Parent { slot, pid: child })
        }
        Ok(ForkResult::Child) => {
            PROCESS_SLOT.store(slot, Ordering::Release);
            CHANNEL_FD.store(channel[1], Ordering::Release);
            let mut table = processes();
            table[slot].pid = getpid().as_raw();
            Ok(Spawned::Child { slot })
        }
        Err(e) => {
            channel::close_channel(&channel);
            let mut table = processes();
            table[slot].pid = -1;
            Err(PeridotError::ChildSpawn(name.into(), e))
        }
    }
}

/// Harvests every exited child with `waitpid(WNOHANG)`, marking table slots.
/// Runs in the master loop when the reap flag is set.
pub fn process_get_status() {
    loop {
        match waitpid(None, Some(WaitPidFlag::WNOHANG)) {
            Ok(WaitStatus::Exited(pid, code)) => {
                mark_exited(pid, code, None);
            }
            Ok(WaitStatus::Signaled(pid, sig, _)) => {
                mark_exited(pid, -1, Some(sig));
            }
            Ok(WaitStatus::StillAlive) => break,
            Ok(_) => continue,
            Err(nix::errno::Errno::ECHILD) => break,
            Err(nix::errno::Errno::EINTR) => continue,
            Err(e) => {
                error!("waitpid() failed: {e}");
                break;
            }
        }
    }
}

fn mark_exited(pid: Pid, status: i32, signal: Option<nix::sys::signal::Signal>) {
    let mut table = processes();
    for p in table.iter_mut() {
        if p.pid == pid.as_raw() {
            p.exited = true;
            p.status = status;
            match signal {
                Some(sig) => error!(name = p.name, pid = p.pid, %sig, "exited on signal"),
                None if status != 0 => {
                    error!(name = p.name, pid = p.pid, status, "exited with code")
                }
                None => debug!(name = p.name, pid = p.pid, "exited"),
            }
            return;
        }
    }
    debug!(pid = pid.as_raw(), "unknown child exited");
}

/// True while any supervised, non-detached child is still running.
pub fn live() -> bool {
    processes()
        .iter()
        .any(|p| p.pid != -1 && !p.exited && !p.detached)
}

/// Forks and execs `binary` with the listening set serialized into the
/// reserved environment variable, so the new master inherits every socket.
pub fn exec_new_binary(
    binary: &Path,
    args: &[String],
    listening: &[Listening],
) -> Result<Pid, PeridotError> {
    let env_value = listening::format_inherited_env(listening);

    let c_binary = CString::new(binary.to_string_lossy().as_bytes())
        .map_err(|_| PeridotError::Fatal("binary path contains NUL".into()))?;
    let c_args: Vec<CString> = args
        .iter()
        .filter_map(|a| CString::new(a.as_bytes()).ok())
        .collect();
    let c_arg_refs: Vec<&std::ffi::CStr> = c_args.iter().map(|a| a.as_c_str()).collect();

    match unsafe { fork() } {
        Ok(ForkResult::Parent { child }) => {
            info!(pid = child.as_raw(), "new binary started");
            let mut table = processes();
            table.push(Process {
                pid: child.as_raw(),
                name: "new binary process",
                kind: ProcessKind::Detached,
                channel: [-1, -1],
                status: 0,
                exiting: false,
                exited: false,
                detached: true,
                respawn: false,
                just_spawn: false,
            });
            Ok(child)
        }
        Ok(ForkResult::Child) => {
            unsafe { std::env::set_var(INHERIT_ENV, &env_value) };
            let _ = execv(&c_binary, &c_arg_refs);
            error!(
                binary = %binary.display(),
                "execv() failed: {}",
                std::io::Error::last_os_error()
            );
            unsafe { libc::_exit(2) }
        }
        Err(e) => Err(PeridotError::ChildSpawn(
            binary.to_string_lossy().into_owned(),
            e,
        )),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn process_type_round_trips() {
        set_process_type(ProcessType::Master);
        assert_eq!(process_type(), ProcessType::Master);
        set_process_type(ProcessType::Single);
        assert_eq!(process_type(), ProcessType::Single);
    }
}
