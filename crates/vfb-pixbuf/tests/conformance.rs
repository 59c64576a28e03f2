//! Frame transport scenarios against real POSIX shm.

use vfb_pixbuf::{Error, PixbufReader, PixbufWriter};
use vfb_testkit::{pattern_frame, Scratch};

#[test]
fn round_trip() {
    vfb_testkit::run_round_trip();
}

#[test]
fn resize_sequence() {
    vfb_testkit::run_resize_sequence();
}

#[test]
fn force_opaque() {
    vfb_testkit::run_force_opaque();
}

#[test]
fn owner_death_recovery() {
    vfb_testkit::run_owner_death_recovery();
}

#[tokio::test(flavor = "multi_thread")]
async fn reader_fails_fast_on_stuck_writer() {
    vfb_testkit::run_reader_fails_fast_on_stuck_writer().await;
}

#[test]
fn reader_never_creates_the_segment() {
    let scratch = Scratch::new("pixbuf-no-writer").unwrap();
    let err = PixbufReader::with_config(scratch.base(), scratch.config()).unwrap_err();
    assert!(
        matches!(err, Error::Ipc(vfb_ipc::Error::NotFound { .. })),
        "{err}"
    );
    assert!(matches!(
        vfb_ipc::Segment::open(&scratch.names().segment(), vfb_ipc::Mode::Reader, 1),
        Err(vfb_ipc::Error::NotFound { .. })
    ));
}

#[test]
fn returned_frame_survives_writer_shrinking_the_segment() {
    let scratch = Scratch::new("pixbuf-stable").unwrap();
    let mut writer = scratch.writer().unwrap();
    let mut reader = scratch.reader().unwrap();

    let big = pattern_frame(256, 256, 9);
    writer.write_frame(big.as_bytes(), 256, 256, false).unwrap();
    let frame = reader.read_frame().unwrap();
    assert_eq!(frame.pixels, big.as_bytes());

    writer.write_frame(pattern_frame(1, 1, 0).as_bytes(), 1, 1, false).unwrap();
    // The copy is untouched by the writer's shrink.
    assert_eq!(reader.last_frame().pixels, big.as_bytes());
    assert_eq!(reader.read_frame().unwrap().width, 1);
}

#[test]
fn later_writer_clears_stale_frame() {
    let scratch = Scratch::new("pixbuf-restart").unwrap();
    let mut first = scratch.writer().unwrap();
    first
        .write_frame(pattern_frame(16, 16, 1).as_bytes(), 16, 16, false)
        .unwrap();
    drop(first);

    let _second = PixbufWriter::with_config(scratch.base(), scratch.config()).unwrap();
    let mut reader = scratch.reader().unwrap();
    let frame = reader.read_frame().unwrap();
    assert_eq!((frame.width, frame.height), (0, 0));
    assert!(frame.is_empty());
}

#[test]
#[should_panic(expected = "frame needs")]
fn short_pixel_slice_panics() {
    let scratch = Scratch::new("pixbuf-short").unwrap();
    let mut writer = scratch.writer().unwrap();
    let _ = writer.write_frame(&[0u8; 15], 2, 2, false);
}
