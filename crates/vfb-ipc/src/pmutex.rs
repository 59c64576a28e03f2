//! Robust, process-shared mutex placed directly in shared memory.
//!
//! Layout (`#[repr(C)]`, lives at offset 0 of the lock segment):
//!
//! ```text
//! ┌──────────────────────────┬─────────────┬─────────┐
//! │ pthread_mutex_t          │ owner_died  │ magic   │
//! └──────────────────────────┴─────────────┴─────────┘
//! ```
//!
//! The pthread mutex is robust: when a holder dies, the next locker gets
//! `EOWNERDEAD` instead of blocking forever. That locker records the event in
//! `owner_died`, makes the pthread mutex consistent again and releases it, so
//! nobody is left holding the lock after observing a death. Every later lock
//! attempt sees the flag and reports [`LockResult::OwnerDied`] until
//! [`PMutex::reset`] clears it.

use std::cell::UnsafeCell;
use std::io;
use std::marker::PhantomData;
use std::sync::atomic::{AtomicU32, Ordering};

use crate::timeout::Timeout;

/// Written after construction; attachers check it before use.
const MAGIC: u32 = 0x5646_424d; // "VFBM"

/// A robust pthread mutex plus the latched owner-died flag.
#[repr(C)]
pub struct PMutex {
    raw: UnsafeCell<libc::pthread_mutex_t>,
    owner_died: AtomicU32,
    magic: AtomicU32,
}

// SAFETY: all access to `raw` goes through pthread calls, which are
// thread- and process-safe for a PTHREAD_PROCESS_SHARED mutex.
unsafe impl Send for PMutex {}
unsafe impl Sync for PMutex {}

/// Outcome of [`PMutex::lock`].
#[must_use]
#[derive(Debug)]
pub enum LockResult<'a> {
    /// The lock is held until the guard is dropped.
    Locked(PGuard<'a>),
    /// The deadline passed. Nothing is held.
    TimedOut,
    /// A previous holder died inside its critical section. Nothing is held,
    /// and the protected data is suspect until [`PMutex::reset`].
    OwnerDied,
}

impl LockResult<'_> {
    pub fn is_locked(&self) -> bool {
        matches!(self, LockResult::Locked(_))
    }
}

/// Proof of holding a [`PMutex`]. Unlocks on drop.
///
/// Not `Send`: a pthread mutex must be released by the thread that took it.
#[must_use = "dropping the guard releases the lock immediately"]
#[derive(Debug)]
pub struct PGuard<'a> {
    mu: &'a PMutex,
    _not_send: PhantomData<*const ()>,
}

impl Drop for PGuard<'_> {
    fn drop(&mut self) {
        // SAFETY: a guard exists only while this thread holds the lock.
        unsafe { self.mu.unlock() }
    }
}

impl PMutex {
    /// Construct a mutex in place at `this`.
    ///
    /// # Safety
    ///
    /// `this` must be valid for writes of `size_of::<PMutex>()` bytes, suitably
    /// aligned, and no other thread or process may be using the memory as a
    /// mutex while this runs.
    pub unsafe fn init_in_place(this: *mut PMutex) -> io::Result<()> {
        let mut attr = std::mem::MaybeUninit::<libc::pthread_mutexattr_t>::uninit();

        // SAFETY: `attr` is writable storage; every call below operates on it
        // after a successful init and `this` is valid per the caller's contract.
        unsafe {
            check(libc::pthread_mutexattr_init(attr.as_mut_ptr()))?;
            let attr_ptr = attr.as_mut_ptr();
            let res = (|| {
                check(libc::pthread_mutexattr_setpshared(
                    attr_ptr,
                    libc::PTHREAD_PROCESS_SHARED,
                ))?;
                check(libc::pthread_mutexattr_setrobust(
                    attr_ptr,
                    libc::PTHREAD_MUTEX_ROBUST,
                ))?;
                check(libc::pthread_mutexattr_settype(
                    attr_ptr,
                    libc::PTHREAD_MUTEX_ERRORCHECK,
                ))?;
                let raw = std::ptr::addr_of_mut!((*this).raw).cast::<libc::pthread_mutex_t>();
                check(libc::pthread_mutex_init(raw, attr_ptr))
            })();
            libc::pthread_mutexattr_destroy(attr_ptr);
            res?;

            std::ptr::addr_of_mut!((*this).owner_died).write(AtomicU32::new(0));
            std::ptr::addr_of_mut!((*this).magic).write(AtomicU32::new(0));
            (*this).magic.store(MAGIC, Ordering::Release);
        }
        Ok(())
    }

    /// Whether a creator has finished [`PMutex::init_in_place`] on this memory.
    pub fn is_initialized(&self) -> bool {
        self.magic.load(Ordering::Acquire) == MAGIC
    }

    /// Whether a holder death has been observed and not yet reset.
    pub fn is_owner_died(&self) -> bool {
        self.owner_died.load(Ordering::Acquire) != 0
    }

    /// Try to take the lock before `timeout` elapses.
    ///
    /// # Panics
    ///
    /// On any pthread error other than a timeout or an owner death, including
    /// relocking from the thread that already holds it.
    pub fn lock(&self, timeout: impl Into<Timeout>) -> LockResult<'_> {
        let timeout: Timeout = timeout.into();
        let raw = self.raw.get();
        // SAFETY: `raw` points at an initialized process-shared mutex.
        let r = match timeout.deadline() {
            Some(ts) => unsafe { libc::pthread_mutex_timedlock(raw, &ts) },
            None => unsafe { libc::pthread_mutex_lock(raw) },
        };

        match r {
            0 => {
                if self.is_owner_died() {
                    // SAFETY: acquired just above.
                    unsafe { self.unlock() };
                    return LockResult::OwnerDied;
                }
                LockResult::Locked(PGuard {
                    mu: self,
                    _not_send: PhantomData,
                })
            }
            libc::ETIMEDOUT => LockResult::TimedOut,
            libc::EOWNERDEAD => {
                self.owner_died.store(1, Ordering::Release);
                tracing::warn!("lock holder died inside its critical section");
                // SAFETY: EOWNERDEAD means we now hold the lock.
                let c = unsafe { libc::pthread_mutex_consistent(raw) };
                assert_eq!(c, 0, "pthread_mutex_consistent failed: {}", errno_str(c));
                // SAFETY: still held since EOWNERDEAD.
                unsafe { self.unlock() };
                LockResult::OwnerDied
            }
            e => panic!("pthread_mutex lock failed: {}", errno_str(e)),
        }
    }

    /// Clear the owner-died state so later lockers proceed normally.
    ///
    /// A no-op when no death was recorded.
    pub fn reset(&self) {
        if self.owner_died.swap(0, Ordering::AcqRel) != 0 {
            tracing::info!("lock state reset after owner death");
        }
    }

    /// Release the lock.
    ///
    /// # Safety
    ///
    /// The calling thread must hold the lock. Prefer dropping a [`PGuard`].
    pub unsafe fn unlock(&self) {
        // SAFETY: the caller holds the lock.
        let r = unsafe { libc::pthread_mutex_unlock(self.raw.get()) };
        assert_eq!(r, 0, "pthread_mutex_unlock failed: {}", errno_str(r));
    }
}

impl std::fmt::Debug for PMutex {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("PMutex")
            .field("initialized", &self.is_initialized())
            .field("owner_died", &self.is_owner_died())
            .finish_non_exhaustive()
    }
}

fn check(r: libc::c_int) -> io::Result<()> {
    if r == 0 {
        Ok(())
    } else {
        Err(io::Error::from_raw_os_error(r))
    }
}

fn errno_str(e: libc::c_int) -> io::Error {
    io::Error::from_raw_os_error(e)
}

#[cfg(test)]
mod tests {
    use std::mem::MaybeUninit;
    use std::thread;
    use std::time::{Duration, Instant};

    use super::*;

    fn leaked_mutex() -> &'static PMutex {
        let slot: &'static mut MaybeUninit<PMutex> = Box::leak(Box::new(MaybeUninit::uninit()));
        unsafe {
            PMutex::init_in_place(slot.as_mut_ptr()).unwrap();
            slot.assume_init_ref()
        }
    }

    #[test]
    fn fresh_mutex_is_initialized_and_lockable() {
        let mu = leaked_mutex();
        assert!(mu.is_initialized());
        assert!(!mu.is_owner_died());
        let guard = mu.lock(Duration::from_millis(100));
        assert!(guard.is_locked());
        drop(guard);
        assert!(mu.lock(Timeout::Never).is_locked());
    }

    #[test]
    fn uninitialized_memory_reports_no_magic() {
        let zeroed: Box<MaybeUninit<PMutex>> = Box::new(MaybeUninit::zeroed());
        let mu = unsafe { zeroed.assume_init_ref() };
        assert!(!mu.is_initialized());
    }

    #[test]
    fn lock_times_out_while_held_elsewhere() {
        let mu = leaked_mutex();
        let (held_tx, held_rx) = std::sync::mpsc::channel();
        let (release_tx, release_rx) = std::sync::mpsc::channel::<()>();

        let holder = thread::spawn(move || {
            let _g = mu.lock(Timeout::Never);
            held_tx.send(()).unwrap();
            release_rx.recv().unwrap();
        });
        held_rx.recv().unwrap();

        let start = Instant::now();
        assert!(matches!(mu.lock(Duration::from_millis(50)), LockResult::TimedOut));
        let waited = start.elapsed();
        assert!(waited >= Duration::from_millis(40), "{waited:?}");
        assert!(waited < Duration::from_secs(2), "{waited:?}");

        release_tx.send(()).unwrap();
        holder.join().unwrap();
        assert!(mu.lock(Duration::from_millis(100)).is_locked());
    }

    #[test]
    fn thread_death_while_holding_is_latched_until_reset() {
        let mu = leaked_mutex();
        thread::spawn(move || {
            let LockResult::Locked(guard) = mu.lock(Timeout::Never) else {
                panic!("expected to lock a fresh mutex");
            };
            std::mem::forget(guard);
        })
        .join()
        .unwrap();

        assert!(matches!(mu.lock(Duration::from_millis(100)), LockResult::OwnerDied));
        assert!(mu.is_owner_died());
        // Observing the death does not leave the lock held.
        assert!(matches!(mu.lock(Duration::from_millis(100)), LockResult::OwnerDied));

        mu.reset();
        assert!(!mu.is_owner_died());
        assert!(mu.lock(Duration::from_millis(100)).is_locked());
    }

    #[test]
    fn reset_without_owner_death_is_harmless() {
        let mu = leaked_mutex();
        mu.reset();
        mu.reset();
        assert!(mu.lock(Duration::from_millis(100)).is_locked());
        assert!(mu.lock(Duration::from_millis(100)).is_locked());
    }
}
