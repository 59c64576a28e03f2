//! Creator election through an advisory lock on a marker file.
//!
//! Before any shared segment exists there is nothing in memory to coordinate
//! on, so the race to initialize is settled by the kernel: whoever takes an
//! exclusive, non-blocking `flock` on the marker file is the Creator. The lock
//! is released when the [`Marker`] is dropped or the process exits.

use std::fs::{File, OpenOptions};
use std::io;
use std::os::fd::AsRawFd;
use std::os::unix::fs::OpenOptionsExt;
use std::path::{Path, PathBuf};

use crate::error::{Error, Result};

/// Which side of the election this process ended up on.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Role {
    /// Won the election and initialized the shared state.
    Creator,
    /// Attached to state initialized by someone else.
    Follower,
}

/// A held advisory lock on a marker file.
#[derive(Debug)]
pub struct Marker {
    file: File,
    path: PathBuf,
}

impl Marker {
    pub fn path(&self) -> &Path {
        &self.path
    }
}

impl Drop for Marker {
    fn drop(&mut self) {
        // SAFETY: plain syscall on a descriptor we own.
        unsafe { libc::flock(self.file.as_raw_fd(), libc::LOCK_UN) };
        tracing::trace!(path = %self.path.display(), "released election marker");
    }
}

/// Election outcome.
#[derive(Debug)]
pub enum Election {
    Creator(Marker),
    Follower,
}

impl Election {
    pub fn role(&self) -> Role {
        match self {
            Election::Creator(_) => Role::Creator,
            Election::Follower => Role::Follower,
        }
    }
}

/// Try once to become the Creator for `path`. Never blocks.
pub fn elect(path: &Path) -> Result<Election> {
    let file = OpenOptions::new()
        .read(true)
        .write(true)
        .create(true)
        .truncate(false)
        .mode(0o666)
        .custom_flags(libc::O_CLOEXEC)
        .open(path)
        .map_err(|e| Error::os("open marker", path.display().to_string(), e))?;

    // SAFETY: plain syscall on a descriptor we own.
    let r = unsafe { libc::flock(file.as_raw_fd(), libc::LOCK_EX | libc::LOCK_NB) };
    if r == 0 {
        tracing::debug!(path = %path.display(), "won election");
        return Ok(Election::Creator(Marker {
            file,
            path: path.to_path_buf(),
        }));
    }

    let err = io::Error::last_os_error();
    match err.raw_os_error() {
        Some(libc::EWOULDBLOCK) => {
            tracing::debug!(path = %path.display(), "lost election");
            Ok(Election::Follower)
        }
        _ => Err(Error::os("flock", path.display().to_string(), err)),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn marker_path(tag: &str) -> PathBuf {
        std::env::temp_dir().join(format!("vfb-elect-{tag}-{}", std::process::id()))
    }

    #[test]
    fn second_attempt_follows_until_creator_drops() {
        let path = marker_path("handoff");
        let first = elect(&path).unwrap();
        assert_eq!(first.role(), Role::Creator);

        // flock is per open file description, so a second open in the same
        // process competes like another process would.
        assert_eq!(elect(&path).unwrap().role(), Role::Follower);

        drop(first);
        let again = elect(&path).unwrap();
        assert_eq!(again.role(), Role::Creator);
        drop(again);
        let _ = std::fs::remove_file(&path);
    }

    #[test]
    fn unopenable_marker_is_an_error() {
        let path = Path::new("/nonexistent-vfb-dir/marker");
        let err = elect(path).unwrap_err();
        assert!(matches!(err, Error::Os { op: "open marker", .. }), "{err}");
    }
}
