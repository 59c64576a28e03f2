//! Primitive scenarios against real POSIX shm.

use std::time::Duration;

use vfb_ipc::{Error, LockResult, Mode, ResourceNames, Role, Segment, ShmMutex};
use vfb_testkit::Scratch;

#[test]
fn single_creator_among_concurrent_attachers() {
    vfb_testkit::run_single_creator(8);
}

#[test]
fn reset_is_idempotent() {
    vfb_testkit::run_reset_is_idempotent();
}

#[test]
fn generational_semaphore_heals() {
    vfb_testkit::run_generational_semaphore_heals();
}

#[tokio::test(flavor = "multi_thread")]
async fn timeouts_are_bounded() {
    vfb_testkit::run_timeouts_are_bounded().await;
}

#[test]
fn owner_death_in_another_process_is_reported_to_every_role() {
    let scratch = Scratch::new("ipc-owner-death").unwrap();
    let creator = ShmMutex::create_or_attach(scratch.names()).unwrap();
    let follower = ShmMutex::create_or_attach(scratch.names()).unwrap();
    assert_eq!(creator.role(), Role::Creator);
    assert_eq!(follower.role(), Role::Follower);

    vfb_testkit::die_holding_lock(&creator).unwrap();

    assert!(matches!(follower.lock(Duration::from_millis(200)), LockResult::OwnerDied));
    assert!(matches!(creator.lock(Duration::from_millis(200)), LockResult::OwnerDied));

    follower.reset();
    assert!(creator.lock(Duration::from_millis(200)).is_locked());
    assert!(follower.lock(Duration::from_millis(200)).is_locked());
}

#[test]
fn follower_before_creator_finishes_is_not_found() {
    let scratch = Scratch::new("ipc-early").unwrap();
    // Win the election without ever creating the lock segment.
    let _marker = vfb_ipc::bootstrap::elect(&scratch.names().marker()).unwrap();
    let err = ShmMutex::create_or_attach(scratch.names()).unwrap_err();
    assert!(matches!(err, Error::NotFound { .. }), "{err}");
}

#[test]
fn follower_on_uninitialized_lock_is_not_ready() {
    let scratch = Scratch::new("ipc-uninit").unwrap();
    let _marker = vfb_ipc::bootstrap::elect(&scratch.names().marker()).unwrap();
    // A creator that crashed after creating the segment, before the mutex.
    let _seg = Segment::open(&scratch.names().lock(), Mode::Writer, 64).unwrap();
    let err = ShmMutex::create_or_attach(scratch.names()).unwrap_err();
    assert!(matches!(err, Error::NotReady { .. }), "{err}");
    assert!(err.is_transient());
}

#[test]
fn new_creator_reuses_a_live_lock() {
    let scratch = Scratch::new("ipc-reuse").unwrap();
    let first = ShmMutex::create_or_attach(scratch.names()).unwrap();
    let follower = ShmMutex::create_or_attach(scratch.names()).unwrap();
    let LockResult::Locked(guard) = follower.lock(Duration::from_millis(200)) else {
        panic!("follower could not lock");
    };
    drop(first);

    // The next creator must not re-initialize a mutex someone is holding.
    let second = ShmMutex::create_or_attach(scratch.names()).unwrap();
    assert_eq!(second.role(), Role::Creator);
    std::thread::scope(|s| {
        let probe = s.spawn(|| second.lock(Duration::from_millis(50)).is_locked());
        assert!(!probe.join().unwrap());
    });
    drop(guard);
    assert!(second.lock(Duration::from_millis(200)).is_locked());
}

#[test]
fn remove_resources_tolerates_missing_objects() {
    let names = ResourceNames::new(&vfb_testkit::unique_base("ipc-clean"), std::env::temp_dir()).unwrap();
    vfb_ipc::remove_resources(&names).unwrap();

    let mu = ShmMutex::create_or_attach(&names).unwrap();
    drop(mu);
    vfb_ipc::remove_resources(&names).unwrap();
    assert!(matches!(
        Segment::open(&names.lock(), Mode::Reader, 1),
        Err(Error::NotFound { .. })
    ));
    assert!(!names.marker().exists());
}
