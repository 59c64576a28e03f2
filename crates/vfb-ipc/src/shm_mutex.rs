//! A [`PMutex`] living in its own named segment, created by election.

use std::ptr::NonNull;

use crate::bootstrap::{self, Election, Marker, Role};
use crate::error::{Error, Result};
use crate::names::ResourceNames;
use crate::pmutex::{LockResult, PMutex};
use crate::segment::{Mode, Segment};
use crate::timeout::Timeout;

/// Handle to the shared robust mutex for one base name.
///
/// Every process that talks about the same base name ends up on the same
/// pthread mutex. Exactly one of them, the Creator, ever constructs it.
pub struct ShmMutex {
    mu: NonNull<PMutex>,
    segment: Segment,
    role: Role,
    // Held for the handle's lifetime so late arrivals always follow.
    _marker: Option<Marker>,
}

// SAFETY: `mu` points into `segment`'s mapping, which is never resized and
// lives as long as this handle. `PMutex` is itself Send + Sync.
unsafe impl Send for ShmMutex {}
unsafe impl Sync for ShmMutex {}

impl ShmMutex {
    /// Elect, then create or attach to the lock segment `/<base>_mu`.
    ///
    /// A Follower that finds the segment missing gets [`Error::NotFound`]; one
    /// that finds it present but not yet initialized gets [`Error::NotReady`].
    /// Neither is retried here.
    pub fn create_or_attach(names: &ResourceNames) -> Result<Self> {
        let lock_name = names.lock();
        let size = std::mem::size_of::<PMutex>();

        let election = bootstrap::elect(&names.marker())?;
        let role = election.role();

        let (segment, marker) = match election {
            Election::Creator(marker) => {
                let segment = Segment::open(&lock_name, Mode::Writer, size)?;
                let mu = segment.map().cast::<PMutex>();
                // SAFETY: the mapping is page aligned and at least one page long.
                let already = unsafe { mu.as_ref() }.is_initialized();
                if already {
                    tracing::debug!(name = %lock_name, "reusing initialized lock");
                } else {
                    // SAFETY: we hold the election marker, so no other process
                    // is constructing or using this memory as a mutex.
                    unsafe { PMutex::init_in_place(mu.as_ptr()) }
                        .map_err(|e| Error::os("pthread_mutex_init", &lock_name, e))?;
                    tracing::debug!(name = %lock_name, "initialized lock");
                }
                (segment, Some(marker))
            }
            Election::Follower => {
                let segment = Segment::open(&lock_name, Mode::Reader, size)?;
                // SAFETY: as above.
                let ready = unsafe { segment.map().cast::<PMutex>().as_ref() }.is_initialized();
                if !ready {
                    return Err(Error::NotReady { name: lock_name });
                }
                (segment, None)
            }
        };

        tracing::debug!(name = %lock_name, ?role, "attached to lock");
        Ok(Self {
            mu: segment.map().cast(),
            segment,
            role,
            _marker: marker,
        })
    }

    pub fn role(&self) -> Role {
        self.role
    }

    pub fn mu(&self) -> &PMutex {
        // SAFETY: see the Send/Sync impls.
        unsafe { self.mu.as_ref() }
    }

    pub fn lock(&self, timeout: impl Into<Timeout>) -> LockResult<'_> {
        self.mu().lock(timeout)
    }

    pub fn reset(&self) {
        self.mu().reset()
    }

    pub fn segment(&self) -> &Segment {
        &self.segment
    }
}

impl std::fmt::Debug for ShmMutex {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ShmMutex")
            .field("name", &self.segment.name())
            .field("role", &self.role)
            .field("mu", self.mu())
            .finish()
    }
}
