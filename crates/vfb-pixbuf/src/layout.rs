//! Frame segment layout.
//!
//! ```text
//! offset 0   width:  i32
//! offset 4   height: i32
//! offset 8   width * height RGBA8 pixels, row-major, no padding
//! ```

use bytemuck::{Pod, Zeroable};

/// Header at the start of the frame segment.
#[repr(C)]
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Pod, Zeroable)]
pub struct PixbufHeader {
    pub width: i32,
    pub height: i32,
}

pub const HEADER_SIZE: usize = std::mem::size_of::<PixbufHeader>();

pub const BYTES_PER_PIXEL: usize = 4;

/// Payload size of a `width` x `height` frame.
///
/// `None` for negative dimensions or if the size does not fit in `usize`.
pub fn pixbuf_size(width: i32, height: i32) -> Option<usize> {
    let w = usize::try_from(width).ok()?;
    let h = usize::try_from(height).ok()?;
    w.checked_mul(h)?.checked_mul(BYTES_PER_PIXEL)
}

/// Header plus payload: the number of segment bytes a frame occupies.
pub fn pixbuf_struct_size(width: i32, height: i32) -> Option<usize> {
    pixbuf_size(width, height)?.checked_add(HEADER_SIZE)
}
