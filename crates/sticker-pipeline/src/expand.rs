//! Disc dilation of a thresholded mask.
//!
//! `expanded[p] = 1.0` if some pixel `q` with `mask[q] > THRESHOLD`
//! satisfies `|p - q|² ≤ r²` (inclusive, Euclidean), else `0.0`.
//!
//! Two exact formulations live here:
//!
//! - **Span fill** (used by [`expand`] and the portable backend). For a
//!   row offset `dy` the disc is a horizontal span of half-width
//!   `⌊√(r² − dy²)⌋`, so each output row is the union, over the source
//!   rows within `r`, of every foreground run widened by that span.
//!   Cost is `O(width · height · min(r, height))`.
//! - **Distance transform** (used by the native backend). The squared
//!   Euclidean distance to the nearest foreground pixel is computed
//!   separably: vertical distances per column, then a lower envelope of
//!   parabolas per row. Cost is `O(width · height)` regardless of `r`.

use crate::buffer::{check_mask, try_copy, try_filled};
use crate::chunk::{Checkpoint, NoCheckpoint, StageKind, for_each_chunk};
use crate::types::{Dimensions, StickerError, THRESHOLD};

/// Dilate `mask` by a disc of radius `border_width`.
///
/// A `border_width` of 0 returns an unchanged copy of the input (no
/// thresholding).
///
/// # Errors
///
/// Returns [`StickerError::InvalidParameters`] if `dims` has a zero
/// side or `mask.len() != width * height`, and
/// [`StickerError::ResourceExhaustion`] if the output cannot be
/// allocated.
pub fn expand(mask: &[f64], dims: Dimensions, border_width: u32) -> Result<Vec<f64>, StickerError> {
    expand_chunked(mask, dims, border_width, usize::MAX, &mut NoCheckpoint)
}

/// [`expand`], reporting to `checkpoint` after every `chunk_rows`
/// output rows.
///
/// # Errors
///
/// As [`expand`], plus any error returned by `checkpoint`.
pub fn expand_chunked(
    mask: &[f64],
    dims: Dimensions,
    border_width: u32,
    chunk_rows: usize,
    checkpoint: &mut dyn Checkpoint,
) -> Result<Vec<f64>, StickerError> {
    let len = check_mask(mask, dims)?;
    if border_width == 0 {
        return try_copy(mask);
    }

    let (width, height) = dims.as_usize();
    let spans = disc_spans(border_width, height - 1)?;
    let mut out = try_filled(len, 0.0)?;

    for_each_chunk(height, chunk_rows, StageKind::Expand, checkpoint, |rows| {
        for y in rows {
            span_fill_row(mask, width, height, y, &spans, &mut out[y * width..(y + 1) * width]);
        }
        Ok(())
    })?;

    Ok(out)
}

/// `spans[dy]` is the largest `dx` with `dx² + dy² ≤ r²`, for
/// `dy` in `0..=min(r, max_offset)`.
///
/// Offsets past `max_offset` (the image height minus one) never reach
/// another row, so the table stays bounded by the image, not the radius.
///
/// # Errors
///
/// Returns [`StickerError::ResourceExhaustion`] if the table cannot be
/// allocated.
pub(crate) fn disc_spans(radius: u32, max_offset: usize) -> Result<Vec<usize>, StickerError> {
    let reach = usize::try_from(radius).map_or(max_offset, |r| r.min(max_offset));
    let r2 = u64::from(radius) * u64::from(radius);
    let mut spans = try_filled(reach + 1, 0)?;
    for (dy, span) in (0u64..).zip(spans.iter_mut()) {
        *span = usize::try_from((r2 - dy * dy).isqrt()).unwrap_or(usize::MAX);
    }
    Ok(spans)
}

/// Produce output row `y` by widening every foreground run of the
/// source rows within reach.
pub(crate) fn span_fill_row(
    mask: &[f64],
    width: usize,
    height: usize,
    y: usize,
    spans: &[usize],
    dst: &mut [f64],
) {
    dst.fill(0.0);
    let reach = spans.len().saturating_sub(1);
    let lo = y.saturating_sub(reach);
    let hi = y.saturating_add(reach).min(height - 1);

    for sy in lo..=hi {
        let half = spans[sy.abs_diff(y)];
        let src = &mask[sy * width..(sy + 1) * width];
        let mut x = 0;
        while x < width {
            if src[x] > THRESHOLD {
                let start = x;
                while x < width && src[x] > THRESHOLD {
                    x += 1;
                }
                let fill_lo = start.saturating_sub(half);
                let fill_hi = (x - 1).saturating_add(half).min(width - 1);
                dst[fill_lo..=fill_hi].fill(1.0);
            } else {
                x += 1;
            }
        }
    }
}

/// Vertical distance, per pixel, to the nearest foreground pixel in the
/// same column. `u32::MAX` means the column has none.
pub(crate) fn vertical_distances(mask: &[f64], width: usize, g: &mut [u32]) {
    for (value, out) in mask.iter().zip(g.iter_mut()) {
        *out = if *value > THRESHOLD { 0 } else { u32::MAX };
    }
    // Downward sweep.
    for i in width..g.len() {
        let above = g[i - width].saturating_add(1);
        if above < g[i] {
            g[i] = above;
        }
    }
    // Upward sweep.
    for i in (0..g.len().saturating_sub(width)).rev() {
        let below = g[i + width].saturating_add(1);
        if below < g[i] {
            g[i] = below;
        }
    }
}

/// Scratch state for the per-row lower envelope of parabolas
/// `x ↦ (x − q)² + g[q]²`.
#[derive(Debug, Default)]
pub(crate) struct RowEnvelope {
    /// Apex columns of the parabolas in the envelope, left to right.
    apexes: Vec<usize>,
    /// `starts[k]` is where `apexes[k]` begins to be the minimum.
    starts: Vec<f64>,
}

impl RowEnvelope {
    /// Write `1.0` into `dst[x]` where the squared distance from column
    /// `x` to the nearest foreground pixel is `≤ radius²`, `0.0`
    /// elsewhere. `g` holds this row's vertical distances.
    pub(crate) fn mark_row(&mut self, g: &[u32], radius: u32, dst: &mut [f64]) {
        self.apexes.clear();
        self.starts.clear();
        let r2 = u64::from(radius) * u64::from(radius);

        // Columns with g > r cannot reach any pixel within r.
        for (q, &gq) in g.iter().enumerate() {
            if gq > radius {
                continue;
            }
            let fq = height_at(q, gq);
            let mut start = f64::NEG_INFINITY;
            while let (Some(&p), Some(&p_start)) = (self.apexes.last(), self.starts.last()) {
                let fp = height_at(p, g[p]);
                #[allow(clippy::cast_precision_loss)]
                let s = (fq - fp) / (2.0 * (q - p) as f64);
                if s <= p_start {
                    self.apexes.pop();
                    self.starts.pop();
                } else {
                    start = s;
                    break;
                }
            }
            self.apexes.push(q);
            self.starts.push(start);
        }

        let mut k = 0;
        for (x, out) in dst.iter_mut().enumerate() {
            if self.apexes.is_empty() {
                *out = 0.0;
                continue;
            }
            #[allow(clippy::cast_precision_loss)]
            let xf = x as f64;
            while k + 1 < self.apexes.len() && self.starts[k + 1] < xf {
                k += 1;
            }
            let q = self.apexes[k];
            let dx = x.abs_diff(q) as u64;
            let gq = u64::from(g[q]);
            *out = if dx * dx + gq * gq <= r2 { 1.0 } else { 0.0 };
        }
    }
}

/// `g² + q²`, the parabola height term used for envelope intersections.
#[allow(clippy::cast_precision_loss)]
fn height_at(q: usize, g: u32) -> f64 {
    let g = f64::from(g);
    let q = q as f64;
    g.mul_add(g, q * q)
}

#[cfg(test)]
#[allow(clippy::unwrap_used)]
pub(crate) mod tests {
    use super::*;

    /// Brute-force disc dilation straight from the definition.
    pub(crate) fn brute_force(mask: &[f64], width: usize, height: usize, r: u32) -> Vec<f64> {
        let r2 = i64::from(r) * i64::from(r);
        let mut out = vec![0.0; mask.len()];
        for qy in 0..height {
            for qx in 0..width {
                if mask[qy * width + qx] <= THRESHOLD {
                    continue;
                }
                for py in 0..height {
                    for px in 0..width {
                        let dx = px as i64 - qx as i64;
                        let dy = py as i64 - qy as i64;
                        if dx * dx + dy * dy <= r2 {
                            out[py * width + px] = 1.0;
                        }
                    }
                }
            }
        }
        out
    }

    /// Sequential distance-transform dilation, as the native backend
    /// runs it but without the thread pool.
    fn by_distance(mask: &[f64], width: usize, r: u32) -> Vec<f64> {
        let mut g = vec![0u32; mask.len()];
        vertical_distances(mask, width, &mut g);
        let mut out = vec![0.0; mask.len()];
        let mut envelope = RowEnvelope::default();
        for (g_row, out_row) in g.chunks_exact(width).zip(out.chunks_exact_mut(width)) {
            envelope.mark_row(g_row, r, out_row);
        }
        out
    }

    fn speckle(width: usize, height: usize, seed: u64) -> Vec<f64> {
        let mut state = seed;
        (0..width * height)
            .map(|_| {
                state = state
                    .wrapping_mul(6_364_136_223_846_793_005)
                    .wrapping_add(1_442_695_040_888_963_407);
                if (state >> 33) % 17 == 0 { 0.9 } else { 0.1 }
            })
            .collect()
    }

    fn single_pixel(width: usize, height: usize, x: usize, y: usize) -> Vec<f64> {
        let mut mask = vec![0.0; width * height];
        mask[y * width + x] = 1.0;
        mask
    }

    #[test]
    fn radius_zero_is_identity() {
        let mask = vec![0.2, 0.6, 0.51, 0.0];
        assert_eq!(expand(&mask, Dimensions::new(2, 2), 0).unwrap(), mask);
    }

    #[test]
    fn disc_spans_radius_two() {
        assert_eq!(disc_spans(2, 10).unwrap(), vec![2, 1, 0]);
    }

    #[test]
    fn disc_spans_radius_five() {
        // 5² = 25: dy=3 → 16 → 4, dy=4 → 9 → 3.
        assert_eq!(disc_spans(5, 10).unwrap(), vec![5, 4, 4, 4, 3, 0]);
    }

    #[test]
    fn disc_spans_stop_at_the_image_height() {
        assert_eq!(disc_spans(5, 2).unwrap(), vec![5, 4, 4]);
        assert_eq!(disc_spans(u32::MAX, 0).unwrap(), vec![usize::try_from(u32::MAX).unwrap()]);
    }

    #[test]
    fn huge_radius_on_tiny_mask_marks_everything() {
        let mask = [1.0, 0.0, 0.0, 0.0];
        let out = expand(&mask, Dimensions::new(2, 2), 300_000_000).unwrap();
        assert_eq!(out, vec![1.0; 4]);
        assert_eq!(out, brute_force(&mask, 2, 2, 300_000_000));
    }

    #[test]
    fn radius_one_is_a_plus() {
        let mask = single_pixel(5, 5, 2, 2);
        let out = expand(&mask, Dimensions::new(5, 5), 1).unwrap();
        let marked: Vec<(usize, usize)> = (0..25)
            .filter(|i| out[*i] == 1.0)
            .map(|i| (i % 5, i / 5))
            .collect();
        assert_eq!(marked, vec![(2, 1), (1, 2), (2, 2), (3, 2), (2, 3)]);
    }

    #[test]
    fn radius_two_marks_thirteen_pixels() {
        let mask = single_pixel(7, 7, 3, 3);
        let out = expand(&mask, Dimensions::new(7, 7), 2).unwrap();
        assert_eq!(out.iter().filter(|v| **v == 1.0).count(), 13);
    }

    #[test]
    fn boundary_is_inclusive() {
        // (3, 4) is at distance exactly 5 from the origin pixel.
        let mask = single_pixel(8, 8, 0, 0);
        let out = expand(&mask, Dimensions::new(8, 8), 5).unwrap();
        assert_eq!(out[4 * 8 + 3], 1.0);
        assert_eq!(out[4 * 8 + 4], 0.0);
    }

    #[test]
    fn threshold_is_strict() {
        let mut mask = vec![0.0; 9];
        mask[4] = THRESHOLD;
        let out = expand(&mask, Dimensions::new(3, 3), 1).unwrap();
        assert!(out.iter().all(|v| *v == 0.0));
    }

    #[test]
    fn output_is_binary() {
        let mask = speckle(12, 9, 7);
        for v in expand(&mask, Dimensions::new(12, 9), 2).unwrap() {
            assert!(v == 0.0 || v == 1.0);
        }
    }

    #[test]
    fn span_fill_matches_brute_force() {
        let (width, height) = (17, 13);
        for (seed, r) in [(1, 1), (2, 2), (3, 3), (4, 6), (5, 20)] {
            let mask = speckle(width, height, seed);
            let got = expand(&mask, Dimensions::new(17, 13), r).unwrap();
            assert_eq!(got, brute_force(&mask, width, height, r), "radius {r}");
        }
    }

    #[test]
    fn distance_transform_matches_brute_force() {
        let (width, height) = (19, 11);
        for (seed, r) in [(11, 1), (12, 2), (13, 4), (14, 7), (15, 30)] {
            let mask = speckle(width, height, seed);
            let got = by_distance(&mask, width, r);
            assert_eq!(got, brute_force(&mask, width, height, r), "radius {r}");
        }
    }

    #[test]
    fn distance_transform_of_empty_mask_is_empty() {
        let mask = vec![0.0; 20];
        assert!(by_distance(&mask, 5, 3).iter().all(|v| *v == 0.0));
    }

    #[test]
    fn vertical_distances_sweep_both_ways() {
        // One column: fg at rows 1 and 4.
        let mask = [0.0, 1.0, 0.0, 0.0, 1.0, 0.0, 0.0];
        let mut g = [0u32; 7];
        vertical_distances(&mask, 1, &mut g);
        assert_eq!(g, [1, 0, 1, 1, 0, 1, 2]);
    }

    #[test]
    fn vertical_distances_without_foreground_saturate() {
        let mut g = [0u32; 4];
        vertical_distances(&[0.0; 4], 2, &mut g);
        assert_eq!(g, [u32::MAX; 4]);
    }

    #[test]
    fn chunking_does_not_change_the_result() {
        let dims = Dimensions::new(10, 10);
        let mask = speckle(10, 10, 99);
        let whole = expand(&mask, dims, 3).unwrap();
        let chunked = expand_chunked(&mask, dims, 3, 3, &mut NoCheckpoint).unwrap();
        assert_eq!(whole, chunked);
    }

    #[test]
    fn length_mismatch_is_invalid_parameters() {
        assert!(matches!(
            expand(&[1.0; 3], Dimensions::new(2, 2), 1),
            Err(StickerError::InvalidParameters(_))
        ));
    }
}
