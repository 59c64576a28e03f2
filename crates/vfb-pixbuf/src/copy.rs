//! Pixel copy with optional alpha forcing.

/// One RGBA8 pixel as a native-endian word with only the alpha byte set.
const ALPHA_MASK: u32 = u32::from_ne_bytes([0, 0, 0, 0xff]);

/// Copy `src` into `dst`. With `force_opaque`, every 4th byte (the alpha of
/// each RGBA8 pixel) is written as `0xff` and all other bytes copied as is.
///
/// # Panics
///
/// If the lengths differ. With `force_opaque`, also if either slice is not
/// 4-byte aligned or its length is not a multiple of 4.
pub fn copy_pixels(dst: &mut [u8], src: &[u8], force_opaque: bool) {
    assert_eq!(dst.len(), src.len(), "pixel copy length mismatch");
    if !force_opaque {
        dst.copy_from_slice(src);
        return;
    }

    let src: &[u32] = bytemuck::cast_slice(src);
    let dst: &mut [u32] = bytemuck::cast_slice_mut(dst);
    for (d, s) in dst.iter_mut().zip(src) {
        *d = *s | ALPHA_MASK;
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn aligned(bytes: &[u8]) -> Vec<u32> {
        let mut words = vec![0u32; bytes.len().div_ceil(4)];
        bytemuck::cast_slice_mut::<u32, u8>(&mut words)[..bytes.len()].copy_from_slice(bytes);
        words
    }

    #[test]
    fn plain_copy_is_verbatim() {
        let src = [1u8, 2, 3, 4, 5, 6, 7, 8];
        let mut dst = [0u8; 8];
        copy_pixels(&mut dst, &src, false);
        assert_eq!(dst, src);
    }

    #[test]
    fn force_opaque_sets_only_alpha() {
        let src = aligned(&[10, 20, 30, 0, 40, 50, 60, 0x7f, 1, 2, 3, 0xff]);
        let mut dst = vec![0u32; 3];
        copy_pixels(
            bytemuck::cast_slice_mut(&mut dst),
            bytemuck::cast_slice(&src),
            true,
        );
        assert_eq!(
            bytemuck::cast_slice::<u32, u8>(&dst),
            [10, 20, 30, 0xff, 40, 50, 60, 0xff, 1, 2, 3, 0xff]
        );
    }

    #[test]
    #[should_panic]
    fn force_opaque_rejects_misaligned_source() {
        let src = aligned(&[0; 12]);
        let mut dst = vec![0u32; 2];
        copy_pixels(
            bytemuck::cast_slice_mut(&mut dst),
            &bytemuck::cast_slice::<u32, u8>(&src)[1..9],
            true,
        );
    }

    #[test]
    #[should_panic(expected = "length mismatch")]
    fn length_mismatch_panics() {
        copy_pixels(&mut [0u8; 4], &[0u8; 8], false);
    }
}
