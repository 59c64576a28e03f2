//! vfb: share RGBA frames between unrelated processes through shared memory.
//!
//! # Quick Start
//!
//! The producer and the consumer each open the channel by base name only.
//! Whichever process comes first creates the shared objects.
//!
//! ```no_run
//! use vfb::prelude::*;
//!
//! // Producer
//! let mut writer = PixbufWriter::open("0x3a00007")?;
//! let pixels = vec![0u8; 640 * 480 * 4];
//! writer.write_frame(&pixels, 640, 480, true)?;
//!
//! // Consumer, typically in another process
//! let mut reader = PixbufReader::open("0x3a00007")?;
//! let frame = reader.read_frame()?;
//! println!("{}x{}", frame.width, frame.height);
//! # Ok::<(), vfb::Error>(())
//! ```
//!
//! # Failure model
//!
//! Every call that can block takes a bounded timeout from [`PixbufConfig`].
//! A producer that dies while publishing never wedges the channel:
//!
//! - consumers get `OwnerDied` from [`PixbufReader::read_frame`] and retry later,
//! - the producer's next [`PixbufWriter::write_frame`] resets the lock, reports
//!   `OwnerDied` once, and the write after that succeeds.
//!
//! Use [`Error::is_transient`] to tell retryable failures apart.
//!
//! # Lower-level primitives
//!
//! The [`ipc`] module exposes the building blocks: resizable segments, the
//! robust process-shared mutex, the creator election and the generational
//! semaphore.

#![forbid(unsafe_op_in_unsafe_fn)]

pub use vfb_pixbuf::{
    copy_pixels, layout, Error, Frame, PixbufConfig, PixbufReader, PixbufWriter, Result,
};

/// Shared-memory primitives.
pub mod ipc {
    pub use vfb_ipc::*;
}

/// Prelude module for convenient imports.
///
/// ```ignore
/// use vfb::prelude::*;
/// ```
pub mod prelude {
    pub use crate::{Error, Frame, PixbufConfig, PixbufReader, PixbufWriter};
    pub use vfb_ipc::{ResourceNames, Timeout};
}
