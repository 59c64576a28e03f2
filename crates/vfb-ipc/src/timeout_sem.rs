//! Generational counting semaphore with self-healing timeouts.
//!
//! A waiter that gives up on [`GenSemaphore::wait`] does not simply walk away:
//! it opens a new generation and rebuilds the count, holding one slot of the
//! new generation itself. Every successful wait hands out the generation that
//! was current when it started, and [`GenSemaphore::post`] only credits the
//! semaphore when that token is still current. A late release from a critical
//! section whose slot was already reclaimed is dropped instead of
//! over-crediting the count. A wait that straddles another waiter's advance
//! gets a stale token too; its slot comes back at the next timeout.
//!
//! Shared objects for base name `b`:
//!
//! ```text
//! /b_mu        counting semaphore
//! /b_mu_gen    shm segment:
//!              ┌──────────────────────────┬────────────┐
//!              │ gate: PMutex             │ generation │
//!              └──────────────────────────┴────────────┘
//! ```
//!
//! The gate serializes posts and generation advances. It is a robust
//! [`PMutex`], so a process dying inside a post or an advance does not leave
//! it held.

use std::ffi::CString;
use std::io;
use std::ptr::NonNull;
use std::sync::atomic::{AtomicI64, Ordering};
use std::time::Duration;

use crate::bootstrap::{self, Election, Marker, Role};
use crate::error::{Error, Result};
use crate::names::ResourceNames;
use crate::pmutex::{LockResult, PGuard, PMutex};
use crate::segment::{Mode, Segment};
use crate::timeout::Timeout;

/// Upper bound on waiting for the gate. The gate is only ever held for a
/// handful of syscalls.
const GATE_TIMEOUT: Duration = Duration::from_secs(1);

/// Fencing token handed out by [`GenSemaphore::wait`].
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub struct Generation(i64);

impl Generation {
    pub const fn new(g: i64) -> Self {
        Self(g)
    }

    pub const fn get(self) -> i64 {
        self.0
    }

    pub const fn next(self) -> Self {
        Self(self.0.wrapping_add(1))
    }
}

impl std::fmt::Display for Generation {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "gen#{}", self.0)
    }
}

/// A POSIX named semaphore handle.
#[derive(Debug)]
pub struct NamedSem {
    sem: NonNull<libc::sem_t>,
    name: String,
}

// SAFETY: sem_* functions are thread-safe on a shared sem_t.
unsafe impl Send for NamedSem {}
unsafe impl Sync for NamedSem {}

impl NamedSem {
    /// Open `name`, creating it with `initial` if `create` is set and it does
    /// not exist yet. An existing semaphore keeps its count.
    pub fn open(name: &str, create: bool, initial: u32) -> Result<Self> {
        let c_name = c_name(name)?;
        let oflag = if create { libc::O_CREAT } else { 0 };
        // SAFETY: `c_name` is NUL-terminated; mode and value are passed as
        // the promoted variadic types sem_open reads.
        let sem = unsafe {
            libc::sem_open(
                c_name.as_ptr(),
                oflag,
                0o644 as libc::c_uint,
                initial as libc::c_uint,
            )
        };
        if sem == libc::SEM_FAILED {
            let err = io::Error::last_os_error();
            return Err(match err.raw_os_error() {
                Some(libc::ENOENT) => Error::NotFound {
                    name: name.to_string(),
                },
                _ => Error::os("sem_open", name, err),
            });
        }
        let sem = NonNull::new(sem)
            .ok_or_else(|| Error::os("sem_open", name, io::Error::from(io::ErrorKind::InvalidData)))?;
        Ok(Self {
            sem,
            name: name.to_string(),
        })
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    /// Block until a count is available.
    pub fn wait(&self) -> Result<()> {
        loop {
            // SAFETY: `sem` is an open semaphore.
            if unsafe { libc::sem_wait(self.sem.as_ptr()) } == 0 {
                return Ok(());
            }
            let err = io::Error::last_os_error();
            if err.kind() != io::ErrorKind::Interrupted {
                return Err(Error::os("sem_wait", &self.name, err));
            }
        }
    }

    /// Wait until the absolute realtime `deadline`. `Ok(false)` on timeout.
    pub fn wait_until(&self, deadline: &libc::timespec) -> Result<bool> {
        loop {
            // SAFETY: `sem` is an open semaphore and `deadline` a valid timespec.
            if unsafe { libc::sem_timedwait(self.sem.as_ptr(), deadline) } == 0 {
                return Ok(true);
            }
            let err = io::Error::last_os_error();
            match err.raw_os_error() {
                Some(libc::ETIMEDOUT) => return Ok(false),
                Some(libc::EINTR) => continue,
                _ => return Err(Error::os("sem_timedwait", &self.name, err)),
            }
        }
    }

    /// Take a count without blocking. `Ok(false)` if none is available.
    pub fn try_wait(&self) -> Result<bool> {
        loop {
            // SAFETY: `sem` is an open semaphore.
            if unsafe { libc::sem_trywait(self.sem.as_ptr()) } == 0 {
                return Ok(true);
            }
            let err = io::Error::last_os_error();
            match err.raw_os_error() {
                Some(libc::EAGAIN) => return Ok(false),
                Some(libc::EINTR) => continue,
                _ => return Err(Error::os("sem_trywait", &self.name, err)),
            }
        }
    }

    pub fn post(&self) -> Result<()> {
        // SAFETY: `sem` is an open semaphore.
        if unsafe { libc::sem_post(self.sem.as_ptr()) } == 0 {
            Ok(())
        } else {
            Err(Error::os("sem_post", &self.name, io::Error::last_os_error()))
        }
    }

    pub fn value(&self) -> Result<i32> {
        let mut v: libc::c_int = 0;
        // SAFETY: `sem` is an open semaphore and `v` is writable.
        if unsafe { libc::sem_getvalue(self.sem.as_ptr(), &mut v) } == 0 {
            Ok(v)
        } else {
            Err(Error::os("sem_getvalue", &self.name, io::Error::last_os_error()))
        }
    }

    /// Remove `name` from the semaphore namespace. `false` if it did not exist.
    pub fn unlink(name: &str) -> Result<bool> {
        let c_name = c_name(name)?;
        // SAFETY: `c_name` is NUL-terminated.
        if unsafe { libc::sem_unlink(c_name.as_ptr()) } == 0 {
            return Ok(true);
        }
        let err = io::Error::last_os_error();
        match err.raw_os_error() {
            Some(libc::ENOENT) => Ok(false),
            _ => Err(Error::os("sem_unlink", name, err)),
        }
    }
}

impl Drop for NamedSem {
    fn drop(&mut self) {
        // SAFETY: `sem` came from sem_open and is closed exactly once.
        unsafe { libc::sem_close(self.sem.as_ptr()) };
    }
}

fn c_name(name: &str) -> Result<CString> {
    CString::new(name).map_err(|_| Error::InvalidName {
        name: name.to_string(),
        reason: "name must not contain NUL",
    })
}

/// Layout of the `/b_mu_gen` segment.
#[repr(C)]
struct SharedState {
    gate: PMutex,
    generation: AtomicI64,
}

/// Named counting semaphore whose timed-out waits reclaim their slot.
pub struct GenSemaphore {
    sem: NamedSem,
    state: NonNull<SharedState>,
    gen_segment: Segment,
    initial: u32,
    role: Role,
    _marker: Option<Marker>,
}

// SAFETY: `state` points into `gen_segment`, which is never resized and lives
// as long as this handle. Its fields are an atomic and a process-shared mutex.
unsafe impl Send for GenSemaphore {}
unsafe impl Sync for GenSemaphore {}

impl GenSemaphore {
    /// Elect, then create or attach to the semaphore objects for `names`.
    ///
    /// The Creator creates missing objects, the counting semaphore with
    /// `initial` counts, and constructs the gate unless a previous Creator
    /// already did. Followers attach and fail with [`Error::NotFound`] or
    /// [`Error::NotReady`] if the Creator has not got that far.
    pub fn create_or_attach(names: &ResourceNames, initial: u32) -> Result<Self> {
        let election = bootstrap::elect(&names.sem_marker())?;
        let role = election.role();
        let (create, marker) = match election {
            Election::Creator(marker) => (true, Some(marker)),
            Election::Follower => (false, None),
        };

        let sem = NamedSem::open(&names.lock(), create, initial)?;
        let mode = if create { Mode::Writer } else { Mode::Reader };
        let gen_segment = Segment::open(
            &names.sem_generation(),
            mode,
            std::mem::size_of::<SharedState>(),
        )?;
        let state = gen_segment.map().cast::<SharedState>();

        // SAFETY: the segment is page aligned and at least one page long, and
        // a fresh object reads as zeroes, which no initialized gate matches.
        let ready = unsafe { state.as_ref() }.gate.is_initialized();
        if !ready {
            if !create {
                return Err(Error::NotReady {
                    name: names.sem_generation(),
                });
            }
            // SAFETY: we are the elected Creator and no gate was constructed,
            // so nobody else is using these bytes as a mutex.
            unsafe { PMutex::init_in_place(std::ptr::addr_of_mut!((*state.as_ptr()).gate)) }
                .map_err(|e| Error::os("pthread_mutex_init", names.sem_generation(), e))?;
        }

        tracing::debug!(name = %names.lock(), ?role, initial, "attached to semaphore");
        Ok(Self {
            sem,
            state,
            gen_segment,
            initial,
            role,
            _marker: marker,
        })
    }

    pub fn role(&self) -> Role {
        self.role
    }

    pub fn initial_value(&self) -> u32 {
        self.initial
    }

    /// Current generation.
    pub fn generation(&self) -> Generation {
        Generation(self.state().generation.load(Ordering::Acquire))
    }

    /// Current count of the underlying semaphore.
    pub fn value(&self) -> Result<i32> {
        self.sem.value()
    }

    /// Consume one count, or reclaim one after `timeout`.
    ///
    /// Either way the caller now holds a slot and gets the generation to pass
    /// back to [`GenSemaphore::post`]. On timeout a new generation is opened
    /// and the count is rebuilt to `initial - 1`, the caller's slot making up
    /// the rest.
    pub fn wait(&self, timeout: impl Into<Timeout>) -> Result<Generation> {
        let token = self.generation();
        self.wait_as(token, timeout.into())
    }

    /// Take a count on behalf of a waiter that read `token` before blocking.
    fn wait_as(&self, token: Generation, timeout: Timeout) -> Result<Generation> {
        match timeout.deadline() {
            None => self.sem.wait()?,
            Some(deadline) => {
                if !self.sem.wait_until(&deadline)? {
                    return self.advance();
                }
            }
        }
        Ok(token)
    }

    /// Return a slot taken in generation `g`.
    ///
    /// Returns `Ok(false)` and leaves the count alone when `g` is stale.
    pub fn post(&self, g: Generation) -> Result<bool> {
        let _gate = self.lock_gate()?;
        let current = self.generation();
        if g != current {
            tracing::trace!(%g, %current, "dropping stale post");
            return Ok(false);
        }
        self.sem.post()?;
        Ok(true)
    }

    fn advance(&self) -> Result<Generation> {
        let _gate = self.lock_gate()?;
        let next = Generation(self.state().generation.fetch_add(1, Ordering::AcqRel)).next();

        let target = i32::try_from(self.initial.saturating_sub(1)).unwrap_or(i32::MAX);
        let mut value = self.sem.value()?;
        while value < target {
            self.sem.post()?;
            value += 1;
        }
        while value > target && self.sem.try_wait()? {
            value -= 1;
        }

        tracing::debug!(name = %self.sem.name(), generation = %next, count = value, "wait timed out, advanced generation");
        Ok(next)
    }

    /// Take the gate. A gate whose holder died is reset and retaken; a count
    /// left half rebuilt by that holder heals at the next timeout.
    fn lock_gate(&self) -> Result<PGuard<'_>> {
        let gate = &self.state().gate;
        for _ in 0..2 {
            match gate.lock(GATE_TIMEOUT) {
                LockResult::Locked(guard) => return Ok(guard),
                LockResult::TimedOut => {
                    tracing::warn!(name = %self.gen_segment.name(), "gate wait timed out");
                    return Err(Error::Timeout);
                }
                LockResult::OwnerDied => {
                    tracing::warn!(name = %self.gen_segment.name(), "gate holder died, resetting gate");
                    gate.reset();
                }
            }
        }
        Err(Error::OwnerDied)
    }

    fn state(&self) -> &SharedState {
        // SAFETY: see the Send/Sync impls.
        unsafe { self.state.as_ref() }
    }
}

impl std::fmt::Debug for GenSemaphore {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("GenSemaphore")
            .field("name", &self.sem.name())
            .field("role", &self.role)
            .field("generation", &self.generation())
            .field("initial", &self.initial)
            .field("segment", &self.gen_segment.name())
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use std::sync::atomic::AtomicUsize;

    use super::*;
    use crate::remove_resources;

    static COUNTER: AtomicUsize = AtomicUsize::new(0);

    struct Scratch(ResourceNames);

    impl Scratch {
        fn new(tag: &str) -> Self {
            let n = COUNTER.fetch_add(1, Ordering::Relaxed);
            let base = format!("vfb-sem-{tag}-{}-{n}", std::process::id());
            Scratch(ResourceNames::new(&base, std::env::temp_dir()).unwrap())
        }
    }

    impl Drop for Scratch {
        fn drop(&mut self) {
            let _ = remove_resources(&self.0);
        }
    }

    #[test]
    fn generation_tokens_order_and_advance() {
        let g = Generation::new(7);
        assert_eq!(g.next().get(), 8);
        assert!(g < g.next());
        assert_eq!(g.to_string(), "gen#7");
    }

    #[test]
    fn wait_and_post_in_same_generation() {
        let s = Scratch::new("basic");
        let sem = GenSemaphore::create_or_attach(&s.0, 2).unwrap();
        assert_eq!(sem.role(), Role::Creator);
        assert_eq!(sem.value().unwrap(), 2);

        let g = sem.wait(Duration::from_millis(100)).unwrap();
        assert_eq!(g, Generation::new(0));
        assert_eq!(sem.value().unwrap(), 1);

        assert!(sem.post(g).unwrap());
        assert_eq!(sem.value().unwrap(), 2);
    }

    #[test]
    fn timed_out_wait_reclaims_and_fences_stale_posts() {
        let s = Scratch::new("heal");
        let sem = GenSemaphore::create_or_attach(&s.0, 1).unwrap();

        let first = sem.wait(Duration::from_millis(100)).unwrap();
        assert_eq!(sem.value().unwrap(), 0);

        // The holder never posts; the next waiter reclaims the slot.
        let second = sem.wait(Duration::from_millis(50)).unwrap();
        assert_eq!(second, first.next());
        assert_eq!(sem.generation(), second);
        assert_eq!(sem.value().unwrap(), 0);

        // The first holder's late post is fenced off.
        assert!(!sem.post(first).unwrap());
        assert_eq!(sem.value().unwrap(), 0);

        assert!(sem.post(second).unwrap());
        assert_eq!(sem.value().unwrap(), 1);
    }

    #[test]
    fn token_is_the_generation_current_when_the_wait_began() {
        let s = Scratch::new("straddle");
        let sem = GenSemaphore::create_or_attach(&s.0, 1).unwrap();

        // A waiter reads its token, then blocks; another waiter's timeout
        // advances the generation before the first one takes the count.
        let token = sem.generation();
        let holder = sem.wait(Duration::from_millis(100)).unwrap();
        let reclaimer = sem.wait(Duration::from_millis(20)).unwrap();
        assert_eq!(reclaimer, token.next());
        assert!(sem.post(holder).is_ok_and(|credited| !credited));
        assert!(sem.post(reclaimer).unwrap());

        let straddler = sem.wait_as(token, Timeout::After(Duration::from_millis(100))).unwrap();
        assert_eq!(straddler, token);
        assert_eq!(sem.value().unwrap(), 0);

        let next = sem.wait(Duration::from_millis(20)).unwrap();
        assert!(!sem.post(straddler).unwrap());
        assert!(sem.post(next).unwrap());
        assert!(sem.value().unwrap() <= sem.initial_value() as i32);
        assert_eq!(sem.value().unwrap(), 1);
    }

    #[test]
    fn gate_held_by_a_dead_thread_is_recovered() {
        let s = Scratch::new("gate");
        let sem = GenSemaphore::create_or_attach(&s.0, 1).unwrap();
        let g = sem.wait(Duration::from_millis(100)).unwrap();

        std::thread::scope(|scope| {
            scope
                .spawn(|| std::mem::forget(sem.lock_gate().unwrap()))
                .join()
                .unwrap();
        });

        let start = std::time::Instant::now();
        assert!(sem.post(g).unwrap());
        assert!(start.elapsed() < GATE_TIMEOUT);
        assert_eq!(sem.value().unwrap(), 1);

        let again = sem.wait(Duration::from_millis(100)).unwrap();
        assert!(sem.post(again).unwrap());
    }

    #[test]
    fn follower_of_unfinished_creator_is_not_ready() {
        let s = Scratch::new("unready");
        let _held = bootstrap::elect(&s.0.sem_marker()).unwrap();
        let _sem = NamedSem::open(&s.0.lock(), true, 1).unwrap();
        let _seg = Segment::open(&s.0.sem_generation(), Mode::Writer, 1).unwrap();
        let err = GenSemaphore::create_or_attach(&s.0, 1).unwrap_err();
        assert!(matches!(err, Error::NotReady { .. }), "{err}");
    }

    #[test]
    fn follower_shares_count_and_generation() {
        let s = Scratch::new("share");
        let creator = GenSemaphore::create_or_attach(&s.0, 1).unwrap();
        let follower = GenSemaphore::create_or_attach(&s.0, 1).unwrap();
        assert_eq!(follower.role(), Role::Follower);

        let g = creator.wait(Duration::from_millis(100)).unwrap();
        let reclaimed = follower.wait(Duration::from_millis(50)).unwrap();
        assert_eq!(creator.generation(), reclaimed);
        assert!(!creator.post(g).unwrap());
        assert!(follower.post(reclaimed).unwrap());
        assert_eq!(creator.value().unwrap(), 1);
    }

    #[test]
    fn follower_without_creator_objects_is_not_found() {
        let s = Scratch::new("orphan");
        // Hold the marker so the next attempt follows, without creating anything.
        let _held = bootstrap::elect(&s.0.sem_marker()).unwrap();
        let err = GenSemaphore::create_or_attach(&s.0, 1).unwrap_err();
        assert!(matches!(err, Error::NotFound { .. }), "{err}");
    }
}
