use vfb_ipc::{LockResult, Mode, Segment, ShmMutex};

use crate::config::PixbufConfig;
use crate::error::{Error, Result};
use crate::layout::{self, PixbufHeader, HEADER_SIZE};

/// A frame copied out of shared memory.
///
/// Borrows the reader's buffer, so it stays valid until the next
/// [`PixbufReader::read_frame`] regardless of what the writer does meanwhile.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Frame<'a> {
    pub width: i32,
    pub height: i32,
    /// `width * height` RGBA8 pixels.
    pub pixels: &'a [u8],
}

impl Frame<'_> {
    pub fn is_empty(&self) -> bool {
        self.pixels.is_empty()
    }
}

/// Consumer side of a frame channel.
#[derive(Debug)]
pub struct PixbufReader {
    mu: ShmMutex,
    shm: Segment,
    config: PixbufConfig,
    pixels: Vec<u8>,
    width: i32,
    height: i32,
}

impl PixbufReader {
    pub fn open(base: &str) -> Result<Self> {
        Self::with_config(base, PixbufConfig::default())
    }

    /// Attach to the channel `base`.
    ///
    /// Fails with [`vfb_ipc::Error::NotFound`] if no writer has created the
    /// frame segment yet. The reader never creates it.
    pub fn with_config(base: &str, config: PixbufConfig) -> Result<Self> {
        let names = config.names(base)?;
        let mu = ShmMutex::create_or_attach(&names)?;
        let shm = Segment::open(&names.segment(), Mode::Reader, HEADER_SIZE)?;
        tracing::debug!(name = %shm.name(), role = ?mu.role(), "pixbuf reader ready");
        Ok(Self {
            mu,
            shm,
            config,
            pixels: Vec::new(),
            width: 0,
            height: 0,
        })
    }

    /// Copy out the currently published frame.
    ///
    /// Fails fast with [`vfb_ipc::Error::Timeout`] or
    /// [`vfb_ipc::Error::OwnerDied`] when the lock cannot be taken cleanly;
    /// the reader never resets the lock itself.
    pub fn read_frame(&mut self) -> Result<Frame<'_>> {
        let _guard = match self.mu.lock(self.config.read_timeout) {
            LockResult::Locked(guard) => guard,
            LockResult::TimedOut => return Err(vfb_ipc::Error::Timeout.into()),
            LockResult::OwnerDied => return Err(vfb_ipc::Error::OwnerDied.into()),
        };

        // SAFETY: the mapping is at least one page and the lock is held.
        let header: PixbufHeader = unsafe {
            bytemuck::pod_read_unaligned(std::slice::from_raw_parts(
                self.shm.map().as_ptr(),
                HEADER_SIZE,
            ))
        };
        let PixbufHeader { width, height } = header;
        let corrupt = || Error::CorruptHeader {
            name: self.shm.name().to_string(),
            width,
            height,
        };
        let len = layout::pixbuf_size(width, height).ok_or_else(corrupt)?;
        let total = layout::pixbuf_struct_size(width, height).ok_or_else(corrupt)?;
        if self.shm.backing_size()? < total {
            return Err(corrupt());
        }

        self.shm.resize(total)?;
        if self.pixels.len() != len {
            self.pixels.resize(len, 0);
        }
        // SAFETY: the mapping now covers `total` bytes, backed by the
        // writer's allocation, and the lock is held.
        let src = unsafe {
            std::slice::from_raw_parts(self.shm.map().as_ptr().add(HEADER_SIZE), len)
        };
        self.pixels.copy_from_slice(src);
        self.width = width;
        self.height = height;

        Ok(Frame {
            width,
            height,
            pixels: &self.pixels,
        })
    }

    /// The frame returned by the last successful read, without touching
    /// shared memory.
    pub fn last_frame(&self) -> Frame<'_> {
        Frame {
            width: self.width,
            height: self.height,
            pixels: &self.pixels,
        }
    }

    /// Bytes of the frame segment currently mapped by this reader.
    pub fn mapped_size(&self) -> usize {
        self.shm.size()
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
