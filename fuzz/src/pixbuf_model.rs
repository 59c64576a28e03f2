//! In-memory replica of the frame slot.
//!
//! Uses the real header layout, size arithmetic, page rounding and pixel copy
//! on a heap buffer standing in for the mapped segment, so sequences of
//! writes and reads can be fuzzed without mmap.

use vfb_ipc::segment::round_up;
use vfb_pixbuf::copy_pixels;
use vfb_pixbuf::layout::{pixbuf_size, pixbuf_struct_size, PixbufHeader, HEADER_SIZE};

/// Page size used by the model. Small, so a handful of pixels crosses pages.
pub const MODEL_PAGE: usize = 64;

/// Largest edge length fuzzed.
pub const MAX_EDGE: i32 = 24;

/// Fuzzed frames are at most `MAX_EDGE` square, far from overflowing.
fn model_round_up(size: usize) -> usize {
    round_up(size, MODEL_PAGE).unwrap_or(usize::MAX)
}

pub struct SlotModel {
    /// Backing words; keeps the payload 4-byte aligned like a real mapping.
    mem: Vec<u32>,
    writer_mapped: usize,
    reader_mapped: usize,
    reader_copy: Vec<u8>,
}

impl Default for SlotModel {
    fn default() -> Self {
        Self::new()
    }
}

impl SlotModel {
    pub fn new() -> Self {
        let mut m = Self {
            mem: Vec::new(),
            writer_mapped: 0,
            reader_mapped: 0,
            reader_copy: Vec::new(),
        };
        m.resize_backing(HEADER_SIZE);
        m.write_header(PixbufHeader::default());
        m.reader_mapped = m.writer_mapped;
        m
    }

    fn bytes(&self) -> &[u8] {
        &bytemuck::cast_slice::<u32, u8>(&self.mem)[..self.writer_mapped]
    }

    fn bytes_mut(&mut self) -> &mut [u8] {
        let len = self.writer_mapped;
        &mut bytemuck::cast_slice_mut::<u32, u8>(&mut self.mem)[..len]
    }

    fn resize_backing(&mut self, size: usize) {
        self.writer_mapped = model_round_up(size);
        self.mem.resize(self.writer_mapped / 4, 0);
    }

    fn write_header(&mut self, h: PixbufHeader) {
        self.bytes_mut()[..HEADER_SIZE].copy_from_slice(bytemuck::bytes_of(&h));
    }

    pub fn writer_mapped(&self) -> usize {
        self.writer_mapped
    }

    pub fn reader_mapped(&self) -> usize {
        self.reader_mapped
    }

    /// The writer path: no-op on non-positive dimensions, else resize and
    /// publish.
    pub fn write(&mut self, pixels: &[u8], width: i32, height: i32, force_opaque: bool) {
        if width <= 0 || height <= 0 {
            return;
        }
        let (Some(len), Some(total)) = (pixbuf_size(width, height), pixbuf_struct_size(width, height))
        else {
            return;
        };
        self.resize_backing(total);
        self.write_header(PixbufHeader { width, height });
        let dst = &mut self.bytes_mut()[HEADER_SIZE..HEADER_SIZE + len];
        copy_pixels(dst, &pixels[..len], force_opaque);
    }

    /// The reader path: read the header, follow the size, copy out.
    pub fn read(&mut self) -> Result<(i32, i32, &[u8]), String> {
        let h: PixbufHeader = bytemuck::pod_read_unaligned(&self.bytes()[..HEADER_SIZE]);
        let len = pixbuf_size(h.width, h.height).ok_or("corrupt header")?;
        let total = pixbuf_struct_size(h.width, h.height).ok_or("corrupt header")?;
        if total > self.writer_mapped {
            return Err(format!("header claims {total} bytes, backing holds {}", self.writer_mapped));
        }
        self.reader_mapped = model_round_up(total);
        let src = self.bytes()[HEADER_SIZE..HEADER_SIZE + len].to_vec();
        self.reader_copy = src;
        Ok((h.width, h.height, &self.reader_copy))
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SlotOp {
    Write {
        width: i32,
        height: i32,
        seed: u8,
        force_opaque: bool,
    },
    Read,
}

fn pattern(width: i32, height: i32, seed: u8) -> Vec<u32> {
    let len = pixbuf_size(width.max(0), height.max(0)).unwrap_or(0);
    let mut words = vec![0u32; len / 4];
    for (i, b) in bytemuck::cast_slice_mut::<u32, u8>(&mut words).iter_mut().enumerate() {
        *b = (i as u8) ^ seed;
    }
    words
}

/// Run `ops` and check last-write-wins, sizing and alpha forcing.
pub fn execute_and_verify(ops: &[SlotOp]) -> Result<(), String> {
    let mut slot = SlotModel::new();
    // (width, height, expected payload) of the last published frame.
    let mut last: (i32, i32, Vec<u8>) = (0, 0, Vec::new());

    for (step, op) in ops.iter().enumerate() {
        match *op {
            SlotOp::Write {
                width,
                height,
                seed,
                force_opaque,
            } => {
                let src = pattern(width, height, seed);
                let src_bytes: &[u8] = bytemuck::cast_slice(&src);
                slot.write(src_bytes, width, height, force_opaque);
                if width > 0 && height > 0 {
                    let mut expected = src_bytes.to_vec();
                    if force_opaque {
                        for px in expected.chunks_mut(4) {
                            px[3] = 0xff;
                        }
                    }
                    last = (width, height, expected);
                }
            }
            SlotOp::Read => {
                let (w, h, pixels) = slot.read().map_err(|e| format!("step {step}: {e}"))?;
                if (w, h) != (last.0, last.1) {
                    return Err(format!(
                        "step {step}: read {w}x{h}, last write was {}x{}",
                        last.0, last.1
                    ));
                }
                if pixels != last.2.as_slice() {
                    return Err(format!("step {step}: {w}x{h} payload differs"));
                }
                let want = model_round_up(pixbuf_struct_size(w, h).unwrap_or(0));
                if slot.reader_mapped() != want {
                    return Err(format!(
                        "step {step}: reader mapped {} bytes, expected {want}",
                        slot.reader_mapped()
                    ));
                }
            }
        }
        if slot.writer_mapped() % MODEL_PAGE != 0 || slot.writer_mapped() == 0 {
            return Err(format!("step {step}: writer mapping {} not page sized", slot.writer_mapped()));
        }
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn grow_then_shrink() {
        let ops = [
            SlotOp::Write { width: 4, height: 3, seed: 1, force_opaque: false },
            SlotOp::Read,
            SlotOp::Write { width: 20, height: 20, seed: 2, force_opaque: true },
            SlotOp::Read,
            SlotOp::Write { width: 0, height: 9, seed: 3, force_opaque: false },
            SlotOp::Write { width: 4, height: 3, seed: 4, force_opaque: false },
            SlotOp::Read,
        ];
        execute_and_verify(&ops).unwrap();
    }

    #[test]
    fn fresh_slot_reads_empty() {
        let mut slot = SlotModel::new();
        let (w, h, px) = slot.read().unwrap();
        assert_eq!((w, h), (0, 0));
        assert!(px.is_empty());
        assert_eq!(slot.reader_mapped(), MODEL_PAGE);
    }
}
