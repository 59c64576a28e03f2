//! Single-slot RGBA frame channel between unrelated processes.
//!
//! A [`PixbufWriter`] publishes frames into a named shared-memory segment; any
//! number of [`PixbufReader`]s copy the latest one out. Access is serialized
//! by a robust cross-process mutex, so a producer that crashes mid-frame
//! cannot wedge consumers: they see [`vfb_ipc::Error::OwnerDied`] and retry,
//! and the producer's next write repairs the lock.
//!
//! The channel is last-write-wins. A slow reader skips frames.
//!
//! ```no_run
//! use vfb_pixbuf::{PixbufReader, PixbufWriter};
//!
//! let mut writer = PixbufWriter::open("win42")?;
//! writer.write_frame(&[0u8; 2 * 2 * 4], 2, 2, false)?;
//!
//! let mut reader = PixbufReader::open("win42")?;
//! let frame = reader.read_frame()?;
//! assert_eq!((frame.width, frame.height), (2, 2));
//! # Ok::<(), vfb_pixbuf::Error>(())
//! ```

mod config;
mod copy;
mod error;
pub mod layout;
mod reader;
mod writer;

pub use config::PixbufConfig;
pub use copy::copy_pixels;
pub use error::{Error, Result};
pub use reader::{Frame, PixbufReader};
pub use writer::PixbufWriter;
