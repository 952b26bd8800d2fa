// src/core/files.rs

//! Open-file registry: files the cycle holds open for appending (logs and
//! friends), re-opened in place when the reopen signal arrives.

use std::fs::OpenOptions;
use std::os::fd::{IntoRawFd, RawFd};
use std::os::unix::fs::OpenOptionsExt;
use std::path::{Path, PathBuf};

use tracing::{error, info};

use crate::core::errors::PeridotError;
use crate::core::list::List;

/// Flush callback, run before the old descriptor is replaced on reopen.
pub type FlushFn = fn(&mut OpenFile);

#[derive(Debug)]
pub struct OpenFile {
    pub fd: RawFd,
    pub name: PathBuf,
    pub flush: Option<FlushFn>,
}

/// Finds or appends a registry entry for `name`. The returned borrow stays
/// valid for the cycle's lifetime (the registry is a chunked list).
pub fn register_open_file<'a>(
    files: &'a mut List<OpenFile>,
    name: &Path,
) -> Result<&'a mut OpenFile, PeridotError> {
    for file in files.iter_mut() {
        if file.name == name {
            return Ok(unsafe { &mut *(file as *mut OpenFile) });
        }
    }

    files.push(OpenFile {
        fd: -1,
        name: name.to_owned(),
        flush: None,
    })
}

fn open_append(name: &Path) -> Result<RawFd, PeridotError> {
    let file = OpenOptions::new()
        .create(true)
        .append(true)
        .mode(0o644)
        .custom_flags(libc::O_CLOEXEC)
        .open(name)
        .map_err(|e| PeridotError::io(name, e))?;
    Ok(file.into_raw_fd())
}

/// Opens every registered file in append mode with close-on-exec. On error
/// the caller unwinds with `close_files`.
pub fn open_files(files: &mut List<OpenFile>) -> Result<(), PeridotError> {
    for file in files.iter_mut() {
        if file.fd != -1 {
            continue;
        }
        file.fd = open_append(&file.name)?;
    }
    Ok(())
}

/// Closes every open descriptor in the registry.
pub fn close_files(files: &mut List<OpenFile>) {
    for file in files.iter_mut() {
        if file.fd == -1 {
            continue;
        }
        if unsafe { libc::close(file.fd) } == -1 {
            error!(
                name = %file.name.display(),
                "close() failed: {}",
                std::io::Error::last_os_error()
            );
        }
        file.fd = -1;
    }
}

/// Reopens every registered file in place: flush, open the new descriptor,
/// close the old one. Idempotent when nothing moved the files underneath.
pub fn reopen_files(files: &mut List<OpenFile>) {
    for file in files.iter_mut() {
        if let Some(flush) = file.flush {
            flush(file);
        }

        let new_fd = match open_append(&file.name) {
            Ok(fd) => fd,
            Err(e) => {
                error!("reopen failed: {e}");
                continue;
            }
        };

        if file.fd != -1 && unsafe { libc::close(file.fd) } == -1 {
            error!(
                name = %file.name.display(),
                "close() failed: {}",
                std::io::Error::last_os_error()
            );
        }
        file.fd = new_fd;
    }
    info!("reopened {} file(s)", files.len());
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::core::pool::Pool;

    #[test]
    fn register_dedupes_by_name() {
        let pool = Pool::create(4096).unwrap();
        let mut files: List<OpenFile> = List::new(&pool, 4).unwrap();

        let a = register_open_file(&mut files, Path::new("/tmp/x.log")).unwrap() as *const OpenFile;
        let b = register_open_file(&mut files, Path::new("/tmp/x.log")).unwrap() as *const OpenFile;
        assert_eq!(a, b);
        assert_eq!(files.len(), 1);
    }

    #[test]
    fn open_reopen_close_round_trip() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("access.log");

        let pool = Pool::create(4096).unwrap();
        let mut files: List<OpenFile> = List::new(&pool, 4).unwrap();
        register_open_file(&mut files, &path).unwrap();

        open_files(&mut files).unwrap();
        let first = files.iter().next().unwrap().fd;
        assert!(first >= 0);

        reopen_files(&mut files);
        let second = files.iter().next().unwrap().fd;
        assert!(second >= 0);

        close_files(&mut files);
        assert_eq!(files.iter().next().unwrap().fd, -1);
    }
}
