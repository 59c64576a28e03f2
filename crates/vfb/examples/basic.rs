//! Basic example: one producer thread publishing frames, one consumer
//! polling them.
//!
//! Producer and consumer only share the base name. In real use they live in
//! different processes; threads keep the example self-contained.
//!
//! Run with: `cargo run --example basic -p vfb`

use std::thread;
use std::time::Duration;

use vfb::prelude::*;

const BASE: &str = "vfb-example-basic";

fn main() -> Result<(), Box<dyn std::error::Error>> {
    tracing_subscriber::fmt()
        .with_max_level(tracing::Level::DEBUG)
        .init();

    let config = PixbufConfig::default()
        .with_write_timeout(Duration::from_millis(500))
        .with_read_timeout(Duration::from_millis(250));

    // The writer creates the frame segment; open it first.
    let mut writer = PixbufWriter::with_config(BASE, config.clone())?;

    let producer = thread::spawn(move || -> Result<(), Error> {
        for i in 0..5u8 {
            let (w, h) = (64 * (i as i32 + 1), 48 * (i as i32 + 1));
            let pixels = vec![i; (w * h * 4) as usize];
            writer.write_frame(&pixels, w, h, true)?;
            println!("published frame {i}: {w}x{h}");
            thread::sleep(Duration::from_millis(50));
        }
        Ok(())
    });

    let mut reader = PixbufReader::with_config(BASE, config)?;
    for _ in 0..8 {
        match reader.read_frame() {
            Ok(frame) => println!(
                "read {}x{} frame, first pixel {:?}",
                frame.width,
                frame.height,
                frame.pixels.get(..4)
            ),
            Err(e) if e.is_transient() => println!("transient read failure: {e}"),
            Err(e) => return Err(e.into()),
        }
        thread::sleep(Duration::from_millis(40));
    }

    producer.join().map_err(|_| "producer panicked")??;

    let names = ResourceNames::with_default_dir(BASE)?;
    vfb::ipc::remove_resources(&names)?;
    Ok(())
}
