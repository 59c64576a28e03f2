//! Cross-process shared-memory primitives.
//!
//! This crate provides the building blocks for handing data between
//! unrelated processes through named POSIX shared memory:
//!
//! - [`Segment`]: a named, page-granular, resizable mapping.
//! - [`PMutex`]: a robust process-shared mutex that reports a dead holder
//!   instead of hanging.
//! - [`ShmMutex`]: a `PMutex` in its own segment, initialized by exactly one
//!   process chosen through an advisory-lock election.
//! - [`GenSemaphore`]: a named counting semaphore whose timed-out waits
//!   reclaim their slot under a fresh generation.
//!
//! All objects for one channel are derived from a single base name by
//! [`ResourceNames`].
//!
//! # Example
//!
//! ```no_run
//! use std::time::Duration;
//! use vfb_ipc::{LockResult, ResourceNames, ShmMutex};
//!
//! let names = ResourceNames::with_default_dir("win42")?;
//! let mu = ShmMutex::create_or_attach(&names)?;
//! match mu.lock(Duration::from_secs(1)) {
//!     LockResult::Locked(_guard) => { /* touch shared state */ }
//!     LockResult::TimedOut => { /* try again later */ }
//!     LockResult::OwnerDied => mu.reset(),
//! }
//! # Ok::<(), vfb_ipc::Error>(())
//! ```

#![forbid(unsafe_op_in_unsafe_fn)]

#[cfg(not(target_os = "linux"))]
compile_error!("vfb-ipc requires Linux (robust futexes, mremap, POSIX named semaphores)");

pub mod bootstrap;
mod error;
pub mod names;
pub mod pmutex;
pub mod segment;
mod shm_mutex;
mod timeout;
pub mod timeout_sem;

pub use bootstrap::{Election, Role};
pub use error::{Error, Result};
pub use names::ResourceNames;
pub use pmutex::{LockResult, PGuard, PMutex};
pub use segment::{page_size, round_up_to_page, Mode, Segment};
pub use shm_mutex::ShmMutex;
pub use timeout::Timeout;
pub use timeout_sem::{GenSemaphore, Generation, NamedSem};

/// Remove every shared object and marker file derived from `names`.
///
/// Missing objects are skipped. Processes that still have them open keep
/// working on the unlinked objects.
pub fn remove_resources(names: &ResourceNames) -> Result<()> {
    for shm in [names.segment(), names.lock(), names.sem_generation()] {
        if Segment::unlink(&shm)? {
            tracing::debug!(name = %shm, "unlinked shm");
        }
    }
    let sem = names.lock();
    if NamedSem::unlink(&sem)? {
        tracing::debug!(name = %sem, "unlinked semaphore");
    }
    for marker in [names.marker(), names.sem_marker()] {
        match std::fs::remove_file(&marker) {
            Ok(()) => tracing::debug!(path = %marker.display(), "removed marker"),
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => {}
            Err(e) => return Err(Error::Os {
                op: "remove marker",
                name: marker.display().to_string(),
                source: e,
            }),
        }
    }
    Ok(())
}
