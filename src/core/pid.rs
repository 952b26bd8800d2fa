// src/core/pid.rs

//! Pid-file management and the `-s` signal-sending surface.

use std::fs::OpenOptions;
use std::io::Write;
use std::os::unix::fs::OpenOptionsExt;
use std::path::Path;

use nix::sys::signal::{Signal, kill};
use nix::unistd::Pid;
use tracing::error;

use crate::core::errors::PeridotError;

/// Suffix the pid file is renamed to while a binary upgrade is in flight.
pub const OLDBIN_SUFFIX: &str = ".oldbin";

/// Writes `pid` as ASCII decimal followed by a newline, mode 644.
pub fn create_pidfile(path: &Path, pid: Pid) -> Result<(), PeridotError> {
    let mut file = OpenOptions::new()
        .create(true)
        .write(true)
        .truncate(true)
        .mode(0o644)
        .open(path)
        .map_err(|e| PeridotError::io(path, e))?;
    writeln!(file, "{pid}").map_err(|e| PeridotError::io(path, e))
}

/// Removes the pid file; a failure is reported, not propagated.
pub fn delete_pidfile(path: &Path) {
    if let Err(e) = std::fs::remove_file(path)
        && e.kind() != std::io::ErrorKind::NotFound
    {
        error!(path = %path.display(), "unlink() failed: {e}");
    }
}

/// Reads the master pid back from the pid file.
pub fn read_pidfile(path: &Path) -> Result<Pid, PeridotError> {
    let text = std::fs::read_to_string(path).map_err(|e| PeridotError::io(path, e))?;
    let pid: i32 = text.trim().parse().map_err(|_| {
        PeridotError::Signal(format!("invalid pid in \"{}\"", path.display()))
    })?;
    Ok(Pid::from_raw(pid))
}

fn signal_by_name(name: &str) -> Result<Signal, PeridotError> {
    match name {
        "stop" => Ok(Signal::SIGTERM),
        "quit" => Ok(Signal::SIGQUIT),
        "reopen" => Ok(Signal::SIGUSR1),
        "reload" => Ok(Signal::SIGHUP),
        _ => Err(PeridotError::Signal(format!("unknown signal \"{name}\""))),
    }
}

/// The `-s` surface: reads the pid file and delivers the named signal to the
/// running master.
pub fn signal_process(pid_path: &Path, name: &str) -> Result<(), PeridotError> {
    let signal = signal_by_name(name)?;
    let pid = read_pidfile(pid_path)?;
    kill(pid, signal)
        .map_err(|e| PeridotError::Signal(format!("kill({pid}, {signal}) failed: {e}")))
}

#[cfg(test)]
mod tests {
    use super::*;
    use nix::unistd::getpid;

    #[test]
    fn pidfile_round_trips() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("peridot.pid");

        create_pidfile(&path, getpid()).unwrap();
        let text = std::fs::read_to_string(&path).unwrap();
        assert!(text.ends_with('\n'));
        assert_eq!(read_pidfile(&path).unwrap(), getpid());

        delete_pidfile(&path);
        assert!(!path.exists());
    }

    #[test]
    fn unknown_signal_name_is_rejected() {
        let err = signal_by_name("bounce").unwrap_err();
        assert!(matches!(err, PeridotError::Signal(_)));
    }

    #[test]
    fn known_signal_names_map() {
        assert_eq!(signal_by_name("stop").unwrap(), Signal::SIGTERM);
        assert_eq!(signal_by_name("quit").unwrap(), Signal::SIGQUIT);
        assert_eq!(signal_by_name("reopen").unwrap(), Signal::SIGUSR1);
        assert_eq!(signal_by_name("reload").unwrap(), Signal::SIGHUP);
    }
}
