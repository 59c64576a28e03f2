use std::ptr::NonNull;

use vfb_ipc::{LockResult, Mode, Segment, ShmMutex};

use crate::config::PixbufConfig;
use crate::copy::copy_pixels;
use crate::error::{Error, Result};
use crate::layout::{self, PixbufHeader, HEADER_SIZE};

/// Producer side of a frame channel.
///
/// Owns the frame segment's backing allocation. Each
/// [`write_frame`](PixbufWriter::write_frame) replaces the published frame.
#[derive(Debug)]
pub struct PixbufWriter {
    mu: ShmMutex,
    shm: Segment,
    config: PixbufConfig,
}

impl PixbufWriter {
    /// Open the channel `base` with the default configuration.
    pub fn open(base: &str) -> Result<Self> {
        Self::with_config(base, PixbufConfig::default())
    }

    /// Open the channel `base`, creating its shared objects if needed, and
    /// publish an empty frame.
    pub fn with_config(base: &str, config: PixbufConfig) -> Result<Self> {
        let names = config.names(base)?;
        let mu = ShmMutex::create_or_attach(&names)?;
        let shm = Segment::open(&names.segment(), Mode::Writer, HEADER_SIZE)?;

        let mut writer = Self { mu, shm, config };
        match writer.publish_empty() {
            Ok(()) => {}
            Err(e) if e.is_transient() => {
                tracing::warn!(name = %writer.shm.name(), "could not clear frame on open: {e}");
            }
            Err(e) => return Err(e),
        }
        tracing::debug!(name = %writer.shm.name(), role = ?writer.mu.role(), "pixbuf writer ready");
        Ok(writer)
    }

    /// Publish a 0x0 frame, discarding whatever the segment held.
    pub fn publish_empty(&mut self) -> Result<()> {
        self.locked_publish(&[], 0, 0, false)
    }

    /// Publish a `width` x `height` RGBA8 frame.
    ///
    /// Non-positive dimensions publish nothing and succeed. On lock timeout
    /// the frame is dropped and [`vfb_ipc::Error::Timeout`] returned. If a
    /// previous holder died, the lock is reset, this frame is dropped and
    /// [`vfb_ipc::Error::OwnerDied`] returned; the next write proceeds
    /// normally.
    ///
    /// # Panics
    ///
    /// If `pixels` is shorter than `width * height * 4` bytes, or if
    /// `force_opaque` is set and `pixels` is not 4-byte aligned.
    pub fn write_frame(
        &mut self,
        pixels: &[u8],
        width: i32,
        height: i32,
        force_opaque: bool,
    ) -> Result<()> {
        if width <= 0 || height <= 0 {
            return Ok(());
        }
        let len = layout::pixbuf_size(width, height).ok_or(Error::FrameTooLarge { width, height })?;
        assert!(
            pixels.len() >= len,
            "{width}x{height} frame needs {len} bytes, got {}",
            pixels.len()
        );
        self.locked_publish(&pixels[..len], width, height, force_opaque)
    }

    fn locked_publish(
        &mut self,
        pixels: &[u8],
        width: i32,
        height: i32,
        force_opaque: bool,
    ) -> Result<()> {
        match self.mu.lock(self.config.write_timeout) {
            LockResult::Locked(_guard) => publish(&mut self.shm, pixels, width, height, force_opaque),
            LockResult::TimedOut => {
                tracing::debug!(name = %self.shm.name(), width, height, "lock timed out, dropping frame");
                Err(vfb_ipc::Error::Timeout.into())
            }
            LockResult::OwnerDied => {
                tracing::warn!(name = %self.shm.name(), "previous lock holder died, resetting");
                self.mu.reset();
                Err(vfb_ipc::Error::OwnerDied.into())
            }
        }
    }

    pub fn segment(&self) -> &Segment {
        &self.shm
    }

    pub fn mutex(&self) -> &ShmMutex {
        &self.mu
    }

    pub fn config(&self) -> &PixbufConfig {
        &self.config
    }
}

/// Must be called with the lock held.
fn publish(
    shm: &mut Segment,
    pixels: &[u8],
    width: i32,
    height: i32,
    force_opaque: bool,
) -> Result<()> {
    let total = layout::pixbuf_struct_size(width, height).ok_or(Error::FrameTooLarge { width, height })?;
    shm.resize(total)?;

    let base: NonNull<u8> = shm.map();
    let header = PixbufHeader { width, height };
    // SAFETY: the mapping holds at least `total` bytes, this process is the
    // only one touching it while the lock is held, and `pixels` is a separate
    // allocation.
    unsafe {
        std::ptr::copy_nonoverlapping(
            bytemuck::bytes_of(&header).as_ptr(),
            base.as_ptr(),
            HEADER_SIZE,
        );
        let dst = std::slice::from_raw_parts_mut(base.as_ptr().add(HEADER_SIZE), pixels.len());
        copy_pixels(dst, pixels, force_opaque);
    }
    Ok(())
}
