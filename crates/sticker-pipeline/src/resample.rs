//! Bilinear resampling of a mask to a different resolution.
//!
//! Segmentation models usually run at a fixed internal size, so the
//! mask they return rarely matches the photo. Output pixel `(x, y)`
//! samples the source at `(x · srcW / dstW, y · srcH / dstH)` from the
//! four surrounding texels, weighted by the fractional offsets, with
//! the right/bottom neighbours clamped to the last column/row.

use crate::buffer::{check_mask, try_copy, try_filled};
use crate::chunk::{Checkpoint, NoCheckpoint, StageKind, for_each_chunk};
use crate::types::{Dimensions, StickerError};

/// Resample `mask` from `src` to `dst` dimensions.
///
/// Identical dimensions return a copy.
///
/// # Errors
///
/// Returns [`StickerError::InvalidParameters`] if either size has a
/// zero side or `mask.len()` does not match `src`, and
/// [`StickerError::ResourceExhaustion`] if the output cannot be
/// allocated.
pub fn bilinear(mask: &[f64], src: Dimensions, dst: Dimensions) -> Result<Vec<f64>, StickerError> {
    bilinear_chunked(mask, src, dst, usize::MAX, &mut NoCheckpoint)
}

/// [`bilinear`], reporting to `checkpoint` after every `chunk_rows`
/// output rows.
///
/// # Errors
///
/// As [`bilinear`], plus any error returned by `checkpoint`.
pub fn bilinear_chunked(
    mask: &[f64],
    src: Dimensions,
    dst: Dimensions,
    chunk_rows: usize,
    checkpoint: &mut dyn Checkpoint,
) -> Result<Vec<f64>, StickerError> {
    check_mask(mask, src)?;
    let len = dst.pixel_count()?;
    if src == dst {
        return try_copy(mask);
    }

    let (src_w, src_h) = src.as_usize();
    let (dst_w, dst_h) = dst.as_usize();
    let columns: Vec<Tap> = (0..dst_w).map(|x| Tap::new(x, src_w, dst_w)).collect();
    let mut out = try_filled(len, 0.0)?;

    for_each_chunk(dst_h, chunk_rows, StageKind::Resample, checkpoint, |rows| {
        for y in rows {
            let row = Tap::new(y, src_h, dst_h);
            let top = &mask[row.lo * src_w..(row.lo + 1) * src_w];
            let bottom = &mask[row.hi * src_w..(row.hi + 1) * src_w];
            for (value, col) in out[y * dst_w..(y + 1) * dst_w].iter_mut().zip(&columns) {
                let upper = col.mix(top[col.lo], top[col.hi]);
                let lower = col.mix(bottom[col.lo], bottom[col.hi]);
                *value = row.mix(upper, lower);
            }
        }
        Ok(())
    })?;

    Ok(out)
}

/// Source neighbours and weight along one axis.
#[derive(Debug, Clone, Copy)]
struct Tap {
    lo: usize,
    hi: usize,
    frac: f64,
}

impl Tap {
    #[allow(clippy::cast_precision_loss)]
    fn new(i: usize, src_len: usize, dst_len: usize) -> Self {
        let pos = i as f64 * src_len as f64 / dst_len as f64;
        let last = src_len - 1;
        #[allow(clippy::cast_possible_truncation, clippy::cast_sign_loss)]
        let lo = (pos.floor() as usize).min(last);
        let hi = (lo + 1).min(last);
        Self {
            lo,
            hi,
            frac: pos - lo as f64,
        }
    }

    fn mix(self, a: f64, b: f64) -> f64 {
        a * (1.0 - self.frac) + b * self.frac
    }
}

#[cfg(test)]
#[allow(clippy::unwrap_used)]
mod tests {
    use super::*;

    fn close(a: &[f64], b: &[f64]) -> bool {
        a.len() == b.len() && a.iter().zip(b).all(|(x, y)| (x - y).abs() < 1e-12)
    }

    #[test]
    fn same_size_is_a_copy() {
        let mask = vec![0.1, 0.2, 0.3, 0.4];
        let dims = Dimensions::new(2, 2);
        assert_eq!(bilinear(&mask, dims, dims).unwrap(), mask);
    }

    #[test]
    fn upscale_row_interpolates_and_clamps() {
        let out = bilinear(&[0.0, 1.0], Dimensions::new(2, 1), Dimensions::new(4, 1)).unwrap();
        // Positions 0, 0.5, 1, 1.5; the last clamps to the final texel.
        assert!(close(&out, &[0.0, 0.5, 1.0, 1.0]));
    }

    #[test]
    fn downscale_row_picks_sample_positions() {
        let mask = [0.0, 0.2, 0.4, 0.6];
        let out = bilinear(&mask, Dimensions::new(4, 1), Dimensions::new(2, 1)).unwrap();
        assert!(close(&out, &[0.0, 0.4]));
    }

    #[test]
    fn upscale_column() {
        let out = bilinear(&[0.2, 0.6], Dimensions::new(1, 2), Dimensions::new(1, 4)).unwrap();
        assert!(close(&out, &[0.2, 0.4, 0.6, 0.6]));
    }

    #[test]
    fn two_dimensional_weights() {
        // 2x2 source upscaled to 4x4: pixel (1, 1) samples (0.5, 0.5).
        let mask = [0.0, 1.0, 1.0, 0.0];
        let out = bilinear(&mask, Dimensions::new(2, 2), Dimensions::new(4, 4)).unwrap();
        assert!((out[4 + 1] - 0.5).abs() < 1e-12);
        assert!((out[0] - 0.0).abs() < 1e-12);
        assert!((out[2] - 1.0).abs() < 1e-12);
    }

    #[test]
    fn constant_mask_stays_constant() {
        let mask = vec![0.8; 320 * 3];
        let out = bilinear(&mask, Dimensions::new(320, 3), Dimensions::new(77, 41)).unwrap();
        assert_eq!(out.len(), 77 * 41);
        assert!(out.iter().all(|v| (v - 0.8).abs() < 1e-12));
    }

    #[test]
    fn chunking_does_not_change_the_result() {
        let mask: Vec<f64> = (0..36).map(|i| f64::from(i) / 35.0).collect();
        let (src, dst) = (Dimensions::new(6, 6), Dimensions::new(13, 9));
        let whole = bilinear(&mask, src, dst).unwrap();
        let chunked = bilinear_chunked(&mask, src, dst, 2, &mut NoCheckpoint).unwrap();
        assert_eq!(whole, chunked);
    }

    #[test]
    fn source_length_mismatch_is_invalid_parameters() {
        let result = bilinear(&[0.0; 3], Dimensions::new(2, 2), Dimensions::new(4, 4));
        assert!(matches!(result, Err(StickerError::InvalidParameters(_))));
    }

    #[test]
    fn zero_target_is_invalid_parameters() {
        let result = bilinear(&[0.0; 4], Dimensions::new(2, 2), Dimensions::new(0, 4));
        assert!(matches!(result, Err(StickerError::InvalidParameters(_))));
    }
}
