//! vfb-testkit: shared scenarios for the vfb shared-memory primitives and the
//! frame transport.
//!
//! Each scenario creates its own uniquely named shared objects, runs against
//! real POSIX shm, and removes everything it created when done. Scenarios
//! panic with a descriptive message on failure, so crates call them directly
//! from their integration tests:
//!
//! ```ignore
//! #[test]
//! fn round_trip() {
//!     vfb_testkit::run_round_trip();
//! }
//!
//! #[tokio::test(flavor = "multi_thread")]
//! async fn reader_fails_fast_on_stuck_writer() {
//!     vfb_testkit::run_reader_fails_fast_on_stuck_writer().await;
//! }
//! ```

use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{mpsc, Arc, Barrier, Once};
use std::thread;
use std::time::{Duration, Instant};

use vfb_ipc::{GenSemaphore, LockResult, ResourceNames, Role, ShmMutex, Timeout};
use vfb_pixbuf::layout::pixbuf_struct_size;
use vfb_pixbuf::{PixbufConfig, PixbufReader, PixbufWriter};

/// Error type for test scenarios.
#[derive(Debug)]
pub enum TestError {
    /// Fixture setup failed.
    Setup(String),
    /// A vfb-ipc call failed.
    Ipc(vfb_ipc::Error),
    /// A transport call failed.
    Pixbuf(vfb_pixbuf::Error),
    /// Assertion failed.
    Assertion(String),
}

impl std::fmt::Display for TestError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            TestError::Setup(msg) => write!(f, "setup error: {}", msg),
            TestError::Ipc(e) => write!(f, "ipc error: {}", e),
            TestError::Pixbuf(e) => write!(f, "pixbuf error: {}", e),
            TestError::Assertion(msg) => write!(f, "assertion failed: {}", msg),
        }
    }
}

impl std::error::Error for TestError {}

impl From<vfb_ipc::Error> for TestError {
    fn from(e: vfb_ipc::Error) -> Self {
        TestError::Ipc(e)
    }
}

impl From<vfb_pixbuf::Error> for TestError {
    fn from(e: vfb_pixbuf::Error) -> Self {
        TestError::Pixbuf(e)
    }
}

macro_rules! ensure {
    ($cond:expr, $($fmt:tt)+) => {
        if !$cond {
            return Err(TestError::Assertion(format!($($fmt)+)));
        }
    };
}

// ============================================================================
// Fixtures
// ============================================================================

/// Install a fmt subscriber that writes through the test harness. Idempotent.
pub fn init_tracing() {
    static INIT: Once = Once::new();
    INIT.call_once(|| {
        let _ = tracing_subscriber::fmt()
            .with_test_writer()
            .with_max_level(tracing::Level::DEBUG)
            .try_init();
    });
}

/// A base name no other test in any process is using.
pub fn unique_base(tag: &str) -> String {
    static COUNTER: AtomicUsize = AtomicUsize::new(0);
    let n = COUNTER.fetch_add(1, Ordering::Relaxed);
    format!("vfb-test-{tag}-{}-{n}", std::process::id())
}

/// Uniquely named resources that are removed on drop.
pub struct Scratch {
    base: String,
    names: ResourceNames,
    config: PixbufConfig,
}

impl Scratch {
    pub fn new(tag: &str) -> Result<Self, TestError> {
        init_tracing();
        let base = unique_base(tag);
        let config = PixbufConfig::default().with_marker_dir(std::env::temp_dir());
        let names = config.names(&base)?;
        Ok(Self {
            base,
            names,
            config,
        })
    }

    pub fn base(&self) -> &str {
        &self.base
    }

    pub fn names(&self) -> &ResourceNames {
        &self.names
    }

    pub fn config(&self) -> PixbufConfig {
        self.config.clone()
    }

    pub fn writer(&self) -> Result<PixbufWriter, TestError> {
        Ok(PixbufWriter::with_config(&self.base, self.config())?)
    }

    pub fn reader(&self) -> Result<PixbufReader, TestError> {
        Ok(PixbufReader::with_config(&self.base, self.config())?)
    }
}

impl Drop for Scratch {
    fn drop(&mut self) {
        if let Err(e) = vfb_ipc::remove_resources(&self.names) {
            tracing::warn!(base = %self.base, "cleanup failed: {e}");
        }
    }
}

/// Pixel bytes backed by `u32`s, so they are always 4-byte aligned.
pub struct AlignedPixels {
    words: Vec<u32>,
}

impl AlignedPixels {
    pub fn as_bytes(&self) -> &[u8] {
        bytemuck::cast_slice(&self.words)
    }

    pub fn as_bytes_mut(&mut self) -> &mut [u8] {
        bytemuck::cast_slice_mut(&mut self.words)
    }
}

/// A `width` x `height` frame whose bytes, alpha included, vary with `seed`.
pub fn pattern_frame(width: i32, height: i32, seed: u8) -> AlignedPixels {
    let pixels = (width.max(0) as usize) * (height.max(0) as usize);
    let mut frame = AlignedPixels {
        words: vec![0; pixels],
    };
    for (i, b) in frame.as_bytes_mut().iter_mut().enumerate() {
        *b = (i as u8).wrapping_mul(31).wrapping_add(seed);
    }
    frame
}

/// Fork a child that takes `mu` and exits without releasing it.
///
/// The child only performs the lock and `_exit`, so it is safe to call from a
/// multi-threaded test process.
pub fn die_holding_lock(mu: &ShmMutex) -> Result<(), TestError> {
    // SAFETY: the child touches no allocator or lock other than `mu`.
    let pid = unsafe { libc::fork() };
    match pid {
        -1 => Err(TestError::Setup(format!(
            "fork failed: {}",
            std::io::Error::last_os_error()
        ))),
        0 => {
            let code = match mu.lock(Timeout::Never) {
                LockResult::Locked(guard) => {
                    std::mem::forget(guard);
                    0
                }
                _ => 1,
            };
            // SAFETY: terminate the child without running any destructors.
            unsafe { libc::_exit(code) }
        }
        child => {
            let mut status = 0;
            // SAFETY: waiting on our own child.
            if unsafe { libc::waitpid(child, &mut status, 0) } != child {
                return Err(TestError::Setup(format!(
                    "waitpid failed: {}",
                    std::io::Error::last_os_error()
                )));
            }
            if !libc::WIFEXITED(status) || libc::WEXITSTATUS(status) != 0 {
                return Err(TestError::Setup(format!(
                    "lock-holding child did not take the lock (status {status:#x})"
                )));
            }
            Ok(())
        }
    }
}

/// Attach with retries, the way a caller that lost the election would.
pub fn attach_with_retry(names: &ResourceNames) -> Result<ShmMutex, TestError> {
    let deadline = Instant::now() + Duration::from_secs(5);
    loop {
        match ShmMutex::create_or_attach(names) {
            Ok(mu) => return Ok(mu),
            Err(e) if e.is_transient() || matches!(e, vfb_ipc::Error::NotFound { .. }) => {
                if Instant::now() > deadline {
                    return Err(e.into());
                }
                thread::sleep(Duration::from_millis(1));
            }
            Err(e) => return Err(e.into()),
        }
    }
}

/// Hold `names`' lock from another thread until the returned sender is
/// dropped or signalled.
fn hold_lock_elsewhere(names: &ResourceNames) -> Result<(mpsc::Sender<()>, thread::JoinHandle<()>), TestError> {
    let names = names.clone();
    let (held_tx, held_rx) = mpsc::channel();
    let (release_tx, release_rx) = mpsc::channel::<()>();
    let holder = thread::spawn(move || {
        let mu = match attach_with_retry(&names) {
            Ok(mu) => mu,
            Err(e) => {
                let _ = held_tx.send(Err(e.to_string()));
                return;
            }
        };
        let _guard = match mu.lock(Timeout::Never) {
            LockResult::Locked(g) => g,
            other => {
                let _ = held_tx.send(Err(format!("holder could not lock: {other:?}")));
                return;
            }
        };
        let _ = held_tx.send(Ok(()));
        let _ = release_rx.recv();
    });
    held_rx
        .recv()
        .map_err(|_| TestError::Setup("holder thread exited".into()))?
        .map_err(TestError::Setup)?;
    Ok((release_tx, holder))
}

fn frame_matches(
    got: vfb_pixbuf::Frame<'_>,
    want: &[u8],
    width: i32,
    height: i32,
) -> Result<(), TestError> {
    ensure!(
        (got.width, got.height) == (width, height),
        "expected {width}x{height}, got {}x{}",
        got.width,
        got.height
    );
    ensure!(
        got.pixels == want,
        "{width}x{height} payload differs ({} vs {} bytes)",
        got.pixels.len(),
        want.len()
    );
    Ok(())
}

// ============================================================================
// Frame transport scenarios
// ============================================================================

/// Frames of several sizes survive a write followed by a read unchanged.
pub fn run_round_trip() {
    if let Err(e) = run_round_trip_inner() {
        panic!("run_round_trip failed: {}", e);
    }
}

fn run_round_trip_inner() -> Result<(), TestError> {
    let scratch = Scratch::new("round-trip")?;
    let mut writer = scratch.writer()?;
    let mut reader = scratch.reader()?;

    let empty = reader.read_frame()?;
    ensure!(
        empty.is_empty() && (empty.width, empty.height) == (0, 0),
        "fresh channel should hold an empty frame, got {}x{}",
        empty.width,
        empty.height
    );

    for (i, (w, h)) in [(1, 1), (3, 2), (64, 48), (7, 513)].into_iter().enumerate() {
        let frame = pattern_frame(w, h, i as u8);
        writer.write_frame(frame.as_bytes(), w, h, false)?;
        frame_matches(reader.read_frame()?, frame.as_bytes(), w, h)?;
    }

    // Non-positive dimensions publish nothing.
    let last = pattern_frame(7, 513, 3);
    writer.write_frame(&[], 0, 10, false)?;
    writer.write_frame(&[], 10, -1, false)?;
    frame_matches(reader.read_frame()?, last.as_bytes(), 7, 513)?;

    // Reading twice without a write returns the same frame.
    frame_matches(reader.read_frame()?, last.as_bytes(), 7, 513)?;
    Ok(())
}

/// The reader's mapping grows and shrinks with the published frame.
pub fn run_resize_sequence() {
    if let Err(e) = run_resize_sequence_inner() {
        panic!("run_resize_sequence failed: {}", e);
    }
}

fn run_resize_sequence_inner() -> Result<(), TestError> {
    let scratch = Scratch::new("resize")?;
    let mut writer = scratch.writer()?;
    let mut reader = scratch.reader()?;

    let mut sizes = Vec::new();
    for (i, (w, h)) in [(320, 240), (640, 480), (320, 240)].into_iter().enumerate() {
        let frame = pattern_frame(w, h, i as u8);
        writer.write_frame(frame.as_bytes(), w, h, false)?;
        frame_matches(reader.read_frame()?, frame.as_bytes(), w, h)?;

        let expected = pixbuf_struct_size(w, h)
            .and_then(vfb_ipc::round_up_to_page)
            .ok_or_else(|| TestError::Setup("size overflow".into()))?;
        ensure!(
            reader.mapped_size() == expected,
            "reader mapped {} bytes for {w}x{h}, expected {expected}",
            reader.mapped_size()
        );
        ensure!(
            writer.segment().size() == expected,
            "writer mapped {} bytes for {w}x{h}, expected {expected}",
            writer.segment().size()
        );
        sizes.push(reader.mapped_size());
    }
    ensure!(
        sizes[0] < sizes[1] && sizes[2] == sizes[0],
        "mapping should grow then shrink back, got {sizes:?}"
    );
    Ok(())
}

/// `force_opaque` sets every alpha byte and leaves color bytes alone.
pub fn run_force_opaque() {
    if let Err(e) = run_force_opaque_inner() {
        panic!("run_force_opaque failed: {}", e);
    }
}

fn run_force_opaque_inner() -> Result<(), TestError> {
    let scratch = Scratch::new("opaque")?;
    let mut writer = scratch.writer()?;
    let mut reader = scratch.reader()?;

    let (w, h) = (33, 17);
    let src = pattern_frame(w, h, 0x40);
    ensure!(
        src.as_bytes().chunks(4).any(|px| px[3] != 0xff),
        "pattern should contain non-opaque pixels"
    );
    writer.write_frame(src.as_bytes(), w, h, true)?;

    let frame = reader.read_frame()?;
    ensure!(
        frame.pixels.len() == src.as_bytes().len(),
        "payload length {}",
        frame.pixels.len()
    );
    for (i, (got, sent)) in frame.pixels.chunks(4).zip(src.as_bytes().chunks(4)).enumerate() {
        ensure!(got[3] == 0xff, "pixel {i} alpha is {:#x}", got[3]);
        ensure!(got[..3] == sent[..3], "pixel {i} color changed");
    }
    Ok(())
}

/// A writer that dies holding the lock is reported, then repaired by the
/// next write.
pub fn run_owner_death_recovery() {
    if let Err(e) = run_owner_death_recovery_inner() {
        panic!("run_owner_death_recovery failed: {}", e);
    }
}

fn run_owner_death_recovery_inner() -> Result<(), TestError> {
    let scratch = Scratch::new("owner-death")?;
    let mut writer = scratch.writer()?;
    let mut reader = scratch.reader()?;

    let before = pattern_frame(8, 8, 1);
    writer.write_frame(before.as_bytes(), 8, 8, false)?;

    die_holding_lock(writer.mutex())?;

    for attempt in 0..2 {
        match reader.read_frame() {
            Err(vfb_pixbuf::Error::Ipc(vfb_ipc::Error::OwnerDied)) => {}
            other => {
                return Err(TestError::Assertion(format!(
                    "read {attempt} after owner death: expected OwnerDied, got {:?}",
                    other.map(|f| (f.width, f.height))
                )))
            }
        }
    }

    let after = pattern_frame(4, 4, 2);
    match writer.write_frame(after.as_bytes(), 4, 4, false) {
        Err(vfb_pixbuf::Error::Ipc(vfb_ipc::Error::OwnerDied)) => {}
        other => {
            return Err(TestError::Assertion(format!(
                "first write after owner death: expected OwnerDied, got {other:?}"
            )))
        }
    }
    ensure!(
        !writer.mutex().mu().is_owner_died(),
        "writer should have reset the lock"
    );

    writer.write_frame(after.as_bytes(), 4, 4, false)?;
    frame_matches(reader.read_frame()?, after.as_bytes(), 4, 4)?;
    Ok(())
}

/// A reader blocked by a lock that is never released gives up within its
/// read timeout.
pub async fn run_reader_fails_fast_on_stuck_writer() {
    if let Err(e) = run_reader_fails_fast_on_stuck_writer_inner().await {
        panic!("run_reader_fails_fast_on_stuck_writer failed: {}", e);
    }
}

async fn run_reader_fails_fast_on_stuck_writer_inner() -> Result<(), TestError> {
    let scratch = Scratch::new("stuck")?;
    let read_timeout = Duration::from_millis(200);
    let _writer = scratch.writer()?;
    let mut reader =
        PixbufReader::with_config(scratch.base(), scratch.config().with_read_timeout(read_timeout))?;

    let (release, holder) = hold_lock_elsewhere(scratch.names())?;

    let outcome = tokio::time::timeout(
        Duration::from_secs(5),
        tokio::task::spawn_blocking(move || {
            let start = Instant::now();
            let result = reader.read_frame().map(|_| ());
            (result, start.elapsed())
        }),
    )
    .await
    .map_err(|_| TestError::Assertion("read_frame hung past its timeout".into()))?
    .map_err(|e| TestError::Setup(format!("reader task panicked: {e}")))?;

    let _ = release.send(());
    holder
        .join()
        .map_err(|_| TestError::Setup("holder thread panicked".into()))?;

    let (result, elapsed) = outcome;
    ensure!(
        matches!(result, Err(vfb_pixbuf::Error::Ipc(vfb_ipc::Error::Timeout))),
        "expected Timeout, got {result:?}"
    );
    ensure!(
        elapsed >= read_timeout.mul_f32(0.8) && elapsed < read_timeout + Duration::from_secs(1),
        "read gave up after {elapsed:?} with a {read_timeout:?} timeout"
    );
    Ok(())
}

// ============================================================================
// Primitive scenarios
// ============================================================================

/// `n` concurrent attachers produce exactly one Creator, and all of them end
/// up on the same lock.
pub fn run_single_creator(n: usize) {
    if let Err(e) = run_single_creator_inner(n) {
        panic!("run_single_creator({n}) failed: {}", e);
    }
}

fn run_single_creator_inner(n: usize) -> Result<(), TestError> {
    let scratch = Scratch::new("election")?;
    let barrier = Arc::new(Barrier::new(n));

    let threads: Vec<_> = (0..n)
        .map(|_| {
            let names = scratch.names().clone();
            let barrier = barrier.clone();
            thread::spawn(move || {
                barrier.wait();
                attach_with_retry(&names)
            })
        })
        .collect();

    let mut handles = Vec::with_capacity(n);
    for t in threads {
        let handle = t
            .join()
            .map_err(|_| TestError::Setup("attacher panicked".into()))??;
        handles.push(handle);
    }

    let creators = handles.iter().filter(|h| h.role() == Role::Creator).count();
    ensure!(creators == 1, "expected exactly one creator, got {creators} of {n}");

    // A straggler arriving after the fact still follows.
    let late = attach_with_retry(scratch.names())?;
    ensure!(late.role() == Role::Follower, "late attacher became {:?}", late.role());

    // Every handle addresses the same pthread mutex.
    for (i, h) in handles.iter().enumerate() {
        let LockResult::Locked(_guard) = h.lock(Duration::from_secs(1)) else {
            return Err(TestError::Assertion(format!("handle {i} could not lock")));
        };
        let other = &handles[(i + 1) % n];
        if n > 1 {
            let probe = thread::scope(|s| {
                s.spawn(|| other.lock(Duration::from_millis(20)).is_locked())
                    .join()
            })
            .map_err(|_| TestError::Setup("probe panicked".into()))?;
            ensure!(!probe, "handle {i}'s lock is not shared with its peers");
        }
    }
    Ok(())
}

/// `reset()` on a healthy lock changes nothing.
pub fn run_reset_is_idempotent() {
    if let Err(e) = run_reset_is_idempotent_inner() {
        panic!("run_reset_is_idempotent failed: {}", e);
    }
}

fn run_reset_is_idempotent_inner() -> Result<(), TestError> {
    let scratch = Scratch::new("reset")?;
    let mu = ShmMutex::create_or_attach(scratch.names())?;

    mu.reset();
    mu.reset();
    for _ in 0..2 {
        ensure!(
            mu.lock(Duration::from_millis(100)).is_locked(),
            "healthy lock refused after reset"
        );
    }

    die_holding_lock(&mu)?;
    ensure!(
        matches!(mu.lock(Duration::from_millis(100)), LockResult::OwnerDied),
        "expected OwnerDied after child death"
    );
    mu.reset();
    mu.reset();
    ensure!(
        mu.lock(Duration::from_millis(100)).is_locked(),
        "lock unusable after double reset"
    );
    Ok(())
}

/// Lock and semaphore waits against a resource that is never released return
/// within a bounded overshoot.
pub async fn run_timeouts_are_bounded() {
    if let Err(e) = run_timeouts_are_bounded_inner().await {
        panic!("run_timeouts_are_bounded failed: {}", e);
    }
}

async fn run_timeouts_are_bounded_inner() -> Result<(), TestError> {
    let scratch = Scratch::new("bounded")?;
    let timeout = Duration::from_millis(100);
    let bound = timeout + Duration::from_secs(1);

    let mu = ShmMutex::create_or_attach(scratch.names())?;
    let (release, holder) = hold_lock_elsewhere(scratch.names())?;
    let (timed_out, elapsed) = tokio::time::timeout(
        Duration::from_secs(5),
        tokio::task::spawn_blocking(move || {
            let start = Instant::now();
            let timed_out = matches!(mu.lock(timeout), LockResult::TimedOut);
            (timed_out, start.elapsed())
        }),
    )
    .await
    .map_err(|_| TestError::Assertion("lock hung past its timeout".into()))?
    .map_err(|e| TestError::Setup(format!("lock task panicked: {e}")))?;
    let _ = release.send(());
    holder
        .join()
        .map_err(|_| TestError::Setup("holder thread panicked".into()))?;
    ensure!(timed_out, "lock against a held mutex should time out");
    ensure!(elapsed < bound, "lock took {elapsed:?} with a {timeout:?} timeout");

    let sem = GenSemaphore::create_or_attach(scratch.names(), 1)?;
    let held = sem.wait(timeout)?;
    let (reclaimed, elapsed) = tokio::time::timeout(
        Duration::from_secs(5),
        tokio::task::spawn_blocking(move || {
            let start = Instant::now();
            let g = sem.wait(timeout);
            (g.map(|g| g > held), start.elapsed())
        }),
    )
    .await
    .map_err(|_| TestError::Assertion("semaphore wait hung past its timeout".into()))?
    .map_err(|e| TestError::Setup(format!("wait task panicked: {e}")))?;
    ensure!(
        reclaimed?,
        "timed-out semaphore wait should open a new generation"
    );
    ensure!(elapsed < bound, "wait took {elapsed:?} with a {timeout:?} timeout");
    Ok(())
}

/// A semaphore whose holders never post heals itself on timeout, and stale
/// posts cannot over-credit it.
pub fn run_generational_semaphore_heals() {
    if let Err(e) = run_generational_semaphore_heals_inner() {
        panic!("run_generational_semaphore_heals failed: {}", e);
    }
}

fn run_generational_semaphore_heals_inner() -> Result<(), TestError> {
    let scratch = Scratch::new("gensem")?;
    let initial = 2;
    let a = GenSemaphore::create_or_attach(scratch.names(), initial)?;
    let b = GenSemaphore::create_or_attach(scratch.names(), initial)?;
    ensure!(
        (a.role(), b.role()) == (Role::Creator, Role::Follower),
        "unexpected roles {:?}/{:?}",
        a.role(),
        b.role()
    );

    let wait = Duration::from_millis(50);
    let g1 = a.wait(wait)?;
    let g2 = b.wait(wait)?;
    ensure!(g1 == g2, "same-generation waits disagree: {g1} vs {g2}");
    ensure!(a.value()? == 0, "both slots should be taken");

    // Both holders vanish without posting. The next waiter reclaims.
    let g3 = b.wait(wait)?;
    ensure!(g3 == g1.next(), "expected {}, got {g3}", g1.next());
    ensure!(a.generation() == g3, "generation not shared between handles");
    ensure!(
        a.value()? == initial as i32 - 1,
        "count should be rebuilt to initial - 1, got {}",
        a.value()?
    );

    // The vanished holders come back late. Their posts are fenced off.
    ensure!(!a.post(g1)?, "stale post was honored");
    ensure!(!b.post(g2)?, "stale post was honored");
    ensure!(a.value()? == initial as i32 - 1, "stale posts changed the count");

    ensure!(b.post(g3)?, "current-generation post was dropped");
    ensure!(
        a.value()? == initial as i32,
        "count should be back at initial, got {}",
        a.value()?
    );

    // Normal operation resumes in the new generation.
    let g4 = a.wait(wait)?;
    ensure!(g4 == g3, "healthy wait moved the generation");
    ensure!(a.post(g4)?, "post in current generation dropped");
    Ok(())
}
