// src/core/errors.rs

//! Defines the primary error type for the entire application.

use std::path::PathBuf;
use thiserror::Error;

/// The main error enum, representing all possible failures within the
/// lifecycle core. Using `thiserror` allows for clean error definitions and
/// automatic `From` trait implementations.
#[derive(Error, Debug)]
pub enum PeridotError {
    #[error("allocation of {0} bytes failed")]
    Alloc(usize),

    #[error("pointer does not belong to this pool's large-allocation list")]
    LargeNotFound,

    #[error("{}: {source}", .path.display())]
    Io {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },

    #[error("{call}() failed: {source}")]
    Sys {
        call: &'static str,
        #[source]
        source: nix::Error,
    },

    #[error("{file}:{line}: {message}")]
    Config {
        file: String,
        line: usize,
        message: String,
    },

    #[error("shared zone \"{0}\" already declared with a different tag")]
    ZoneTagMismatch(String),

    #[error("shared zone \"{0}\" size conflict: {1} != {2}")]
    ZoneSizeConflict(String, usize, usize),

    #[error("configuration reload failed: {0}")]
    Reload(String),

    #[error("bind() to {addr} failed: {source}")]
    Bind {
        addr: String,
        #[source]
        source: nix::Error,
    },

    #[error("failed to spawn child process \"{0}\": {1}")]
    ChildSpawn(String, nix::Error),

    #[error("signal delivery failed: {0}")]
    Signal(String),

    /// Non-recoverable failure; the process exits with code 2.
    #[error("fatal: {0}")]
    Fatal(String),
}

impl PeridotError {
    /// Wraps an `io::Error` together with the path the operation touched.
    pub fn io(path: impl Into<PathBuf>, source: std::io::Error) -> Self {
        PeridotError::Io {
            path: path.into(),
            source,
        }
    }

    /// Wraps a raw syscall failure with the name of the call that raised it.
    pub fn sys(call: &'static str, source: nix::Error) -> Self {
        PeridotError::Sys { call, source }
    }
}
