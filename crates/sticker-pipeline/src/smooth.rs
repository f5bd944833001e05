//! Separable box blur of a probability mask.
//!
//! A horizontal mean over `±radius` neighbours followed by a vertical
//! mean over the horizontal result, with `radius = kernel_size / 2`.
//! Windows are truncated at the image edges: out-of-range pixels do not
//! contribute and the divisor shrinks accordingly, so edge pixels are
//! never darkened by implicit zero padding.
//!
//! Both passes are streamed through [`for_each_chunk`]: each chunk of
//! output rows first extends the horizontal pass as far as its vertical
//! window reaches, then emits its own rows.

use crate::buffer::{check_mask, try_copy, try_filled};
use crate::chunk::{Checkpoint, NoCheckpoint, StageKind, for_each_chunk};
use crate::types::{Dimensions, StickerError};

/// Box-blur `mask` with a square window of `kernel_size`.
///
/// A `kernel_size` of 0 or 1 returns an unchanged copy.
///
/// # Errors
///
/// Returns [`StickerError::InvalidParameters`] if `dims` has a zero
/// side or `mask.len() != width * height`, and
/// [`StickerError::ResourceExhaustion`] if a buffer cannot be allocated.
pub fn smooth(mask: &[f64], dims: Dimensions, kernel_size: u32) -> Result<Vec<f64>, StickerError> {
    smooth_chunked(mask, dims, kernel_size, usize::MAX, &mut NoCheckpoint)
}

/// [`smooth`], reporting to `checkpoint` after every `chunk_rows` rows.
///
/// # Errors
///
/// As [`smooth`], plus any error returned by `checkpoint`.
pub fn smooth_chunked(
    mask: &[f64],
    dims: Dimensions,
    kernel_size: u32,
    chunk_rows: usize,
    checkpoint: &mut dyn Checkpoint,
) -> Result<Vec<f64>, StickerError> {
    let len = check_mask(mask, dims)?;
    if kernel_size <= 1 {
        return try_copy(mask);
    }

    let radius = radius_of(kernel_size);
    let (width, height) = dims.as_usize();
    let mut horizontal = try_filled(len, 0.0)?;
    let mut out = try_filled(len, 0.0)?;
    let mut horizontal_done = 0;

    for_each_chunk(height, chunk_rows, StageKind::Smooth, checkpoint, |rows| {
        let needed = rows.end.saturating_add(radius).min(height);
        for y in horizontal_done..needed {
            let span = y * width..(y + 1) * width;
            horizontal_row(&mask[span.clone()], &mut horizontal[span], radius);
        }
        horizontal_done = horizontal_done.max(needed);

        for y in rows {
            vertical_row(
                &horizontal,
                width,
                height,
                y,
                radius,
                &mut out[y * width..(y + 1) * width],
            );
        }
        Ok(())
    })?;

    Ok(out)
}

/// Blur radius for a kernel size.
pub(crate) const fn radius_of(kernel_size: u32) -> usize {
    (kernel_size / 2) as usize
}

/// Horizontal pass over one row: `dst[x]` is the mean of
/// `src[x - radius ..= x + radius]`, clipped to the row.
pub(crate) fn horizontal_row(src: &[f64], dst: &mut [f64], radius: usize) {
    let width = src.len();
    for (x, out) in dst.iter_mut().enumerate() {
        let lo = x.saturating_sub(radius);
        let hi = x.saturating_add(radius).saturating_add(1).min(width);
        let window = &src[lo..hi];
        #[allow(clippy::cast_precision_loss)]
        let count = window.len() as f64;
        *out = window.iter().sum::<f64>() / count;
    }
}

/// Vertical pass producing output row `y` from the full horizontal
/// result `src` (row-major, `width` columns, `height` rows).
///
/// Rows are accumulated top to bottom so every backend gets the same
/// rounding.
pub(crate) fn vertical_row(
    src: &[f64],
    width: usize,
    height: usize,
    y: usize,
    radius: usize,
    dst: &mut [f64],
) {
    let lo = y.saturating_sub(radius);
    let hi = y.saturating_add(radius).saturating_add(1).min(height);
    dst.fill(0.0);
    for row in src[lo * width..hi * width].chunks_exact(width) {
        for (acc, value) in dst.iter_mut().zip(row) {
            *acc += value;
        }
    }
    #[allow(clippy::cast_precision_loss)]
    let count = (hi - lo) as f64;
    for acc in dst.iter_mut() {
        *acc /= count;
    }
}
