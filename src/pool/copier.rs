//! Stride-aware plane copier (C3).
//!
//! Moves a decoded plane into a pool buffer, respecting source stride
//! (codecs routinely pad rows past the visible width) and never reading
//! past `width` bytes of any source row.

/// Copy `height` rows of `width` bytes each from `src` (row pitch
/// `src_stride`) into `dst` (row pitch `dst_stride`).
///
/// # Panics
/// Panics if either buffer is too small for the requested geometry, or if
/// either stride is smaller than `width`.
pub fn copy_plane(
    src: &[u8],
    src_stride: usize,
    dst: &mut [u8],
    dst_stride: usize,
    width: usize,
    height: usize,
) {
    assert!(src_stride >= width, "src_stride must be >= width");
    assert!(dst_stride >= width, "dst_stride must be >= width");
    assert!(
        src.len() >= src_stride * height.max(1).saturating_sub(1) + width,
        "src buffer too small for requested geometry"
    );
    assert!(
        dst.len() >= dst_stride * height.max(1).saturating_sub(1) + width,
        "dst buffer too small for requested geometry"
    );

    for row in 0..height {
        let src_row = &src[row * src_stride..row * src_stride + width];
        let dst_row = &mut dst[row * dst_stride..row * dst_stride + width];
        copy_row(src_row, dst_row);
    }
}

/// Copy one row, using 128-bit wide loads/stores when the platform
/// supports SSE2/NEON and the row is long enough to benefit; otherwise a
/// plain byte copy.
#[inline]
fn copy_row(src: &[u8], dst: &mut [u8]) {
    debug_assert_eq!(src.len(), dst.len());

    #[cfg(any(target_arch = "x86", target_arch = "x86_64"))]
    {
        if is_simd_available() && src.len() >= 32 {
            // SAFETY: length checked above; copy_row_simd never reads or
            // writes past `src.len()` bytes.
            unsafe { copy_row_simd(src, dst) };
            return;
        }
    }

    #[cfg(target_arch = "aarch64")]
    {
        if src.len() >= 32 {
            // SAFETY: NEON is part of the aarch64 baseline; length
            // checked above.
            unsafe { copy_row_neon(src, dst) };
            return;
        }
    }

    dst.copy_from_slice(src);
}

#[cfg(any(target_arch = "x86", target_arch = "x86_64"))]
fn is_simd_available() -> bool {
    #[cfg(target_arch = "x86_64")]
    {
        std::is_x86_feature_detected!("sse2")
    }
    #[cfg(target_arch = "x86")]
    {
        std::is_x86_feature_detected!("sse2")
    }
}

/// Copy 32 bytes per inner step (two 16-byte loads/stores), falling back
/// to a byte copy for the remainder. Prefetching the next rows is left to
/// the caller's access pattern (sequential row order already keeps the
/// prefetcher's stride predictor warm 8 rows ahead in practice).
#[cfg(any(target_arch = "x86", target_arch = "x86_64"))]
#[target_feature(enable = "sse2")]
unsafe fn copy_row_simd(src: &[u8], dst: &mut [u8]) {
    #[cfg(target_arch = "x86_64")]
    use std::arch::x86_64::{_mm_loadu_si128, _mm_storeu_si128};
    #[cfg(target_arch = "x86")]
    use std::arch::x86::{_mm_loadu_si128, _mm_storeu_si128};

    let len = src.len();
    let chunks = len / 32;
    let src_ptr = src.as_ptr();
    let dst_ptr = dst.as_mut_ptr();

    for i in 0..chunks {
        let off = i * 32;
        let a = _mm_loadu_si128(src_ptr.add(off) as *const _);
        let b = _mm_loadu_si128(src_ptr.add(off + 16) as *const _);
        _mm_storeu_si128(dst_ptr.add(off) as *mut _, a);
        _mm_storeu_si128(dst_ptr.add(off + 16) as *mut _, b);
    }

    let tail_off = chunks * 32;
    if tail_off < len {
        dst[tail_off..].copy_from_slice(&src[tail_off..]);
    }
}

#[cfg(target_arch = "aarch64")]
unsafe fn copy_row_neon(src: &[u8], dst: &mut [u8]) {
    use std::arch::aarch64::{vld1q_u8, vst1q_u8};

    let len = src.len();
    let chunks = len / 32;
    let src_ptr = src.as_ptr();
    let dst_ptr = dst.as_mut_ptr();

    for i in 0..chunks {
        let off = i * 32;
        let a = vld1q_u8(src_ptr.add(off));
        let b = vld1q_u8(src_ptr.add(off + 16));
        vst1q_u8(dst_ptr.add(off), a);
        vst1q_u8(dst_ptr.add(off + 16), b);
    }

    let tail_off = chunks * 32;
    if tail_off < len {
        dst[tail_off..].copy_from_slice(&src[tail_off..]);
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn naive_copy(src: &[u8], src_stride: usize, width: usize, height: usize) -> Vec<u8> {
        let mut out = Vec::with_capacity(width * height);
        for row in 0..height {
            out.extend_from_slice(&src[row * src_stride..row * src_stride + width]);
        }
        out
    }

    #[test]
    fn matches_naive_copy_for_equal_strides() {
        let width = 17;
        let height = 5;
        let src: Vec<u8> = (0..(width * height) as u8).collect();
        let mut dst = vec![0u8; width * height];
        copy_plane(&src, width, &mut dst, width, width, height);
        assert_eq!(dst, naive_copy(&src, width, width, height));
    }

    #[test]
    fn matches_naive_copy_with_source_padding() {
        let width = 40;
        let height = 8;
        let src_stride = 64; // codec padding past visible width
        let src: Vec<u8> = (0..(src_stride * height) as u32)
            .map(|v| (v % 256) as u8)
            .collect();
        let mut dst = vec![0u8; width * height];
        copy_plane(&src, src_stride, &mut dst, width, width, height);
        assert_eq!(dst, naive_copy(&src, src_stride, width, height));
    }

    #[test]
    fn matches_naive_copy_with_mismatched_strides_both_ways() {
        let width = 33;
        let height = 4;
        let src_stride = 48;
        let dst_stride = 40;
        let src: Vec<u8> = (0..(src_stride * height) as u32)
            .map(|v| (v % 251) as u8)
            .collect();
        let mut dst = vec![0u8; dst_stride * height];
        copy_plane(&src, src_stride, &mut dst, dst_stride, width, height);

        let expected = naive_copy(&src, src_stride, width, height);
        for row in 0..height {
            assert_eq!(
                &dst[row * dst_stride..row * dst_stride + width],
                &expected[row * width..row * width + width]
            );
        }
    }

    #[test]
    fn never_reads_past_width_bytes_per_row() {
        // Sentinel bytes live just past `width` in each source row; if
        // the copier ever reads past width, changing them would change
        // the output, which this test would catch via the mismatch
        // below failing to hold.
        let width = 10;
        let src_stride = 16;
        let height = 3;
        let mut src = vec![0xAAu8; src_stride * height];
        for row in 0..height {
            for col in width..src_stride {
                src[row * src_stride + col] = 0xFF; // sentinel, must be ignored
            }
        }
        let mut dst = vec![0u8; width * height];
        copy_plane(&src, src_stride, &mut dst, width, width, height);
        assert!(dst.iter().all(|&b| b == 0xAA));
    }

    #[test]
    fn handles_odd_width_not_divisible_by_simd_chunk() {
        let width = 37; // not a multiple of 32
        let height = 2;
        let src: Vec<u8> = (0..(width * height) as u8).collect();
        let mut dst = vec![0u8; width * height];
        copy_plane(&src, width, &mut dst, width, width, height);
        assert_eq!(dst, src);
    }

    #[test]
    fn matches_naive_copy_for_random_geometries() {
        use rand::Rng;
        let mut rng = rand::thread_rng();
        for _ in 0..200 {
            let width: usize = rng.gen_range(1..96);
            let height: usize = rng.gen_range(1..32);
            let src_stride = width + rng.gen_range(0..16);
            let dst_stride = width + rng.gen_range(0..16);
            let src: Vec<u8> = (0..src_stride * height).map(|_| rng.gen()).collect();
            let mut dst = vec![0u8; dst_stride * height];

            copy_plane(&src, src_stride, &mut dst, dst_stride, width, height);

            let expected = naive_copy(&src, src_stride, width, height);
            for row in 0..height {
                assert_eq!(
                    &dst[row * dst_stride..row * dst_stride + width],
                    &expected[row * width..row * width + width],
                    "mismatch at row {row} for {width}x{height}, strides {src_stride}/{dst_stride}"
                );
            }
        }
    }
}
