//! Threshold-band compositing of pixels, border color, and transparency.
//!
//! Every pixel falls into exactly one [`Band`], decided by the smoothed
//! mask value `m` and the expanded mask value `e` (which is `m` when no
//! expansion ran):
//!
//! | condition                              | result                     |
//! |----------------------------------------|----------------------------|
//! | `m > 0.55`                             | original RGB, alpha 255    |
//! | `m < 0.45`, border on, `e > 0.5`       | border RGB, alpha 255      |
//! | `m < 0.45` otherwise                   | original RGB, alpha 0      |
//! | `0.45 ≤ m ≤ 0.55`                      | original RGB, ramped alpha |
//!
//! Only the alpha channel and the RGB of border pixels are written, so
//! compositing an already composited buffer again gives the same bytes.

use std::ops::{Add, AddAssign};

use serde::{Deserialize, Serialize};

use crate::buffer::{check_mask, check_pixels};
use crate::chunk::{Checkpoint, NoCheckpoint, StageKind, for_each_chunk};
use crate::types::{
    BorderColor, Dimensions, StickerError, THRESHOLD, THRESHOLD_HIGH, THRESHOLD_LOW,
    THRESHOLD_RANGE,
};

/// The band a pixel is classified into.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Band {
    /// Confidently foreground: opaque, original color.
    Foreground,
    /// Inside the expanded border: opaque, painted.
    Border(BorderColor),
    /// Between the thresholds: original color with this alpha.
    Transition(u8),
    /// Background: fully transparent.
    Transparent,
}

/// Classify one pixel. `border` is `None` when no border is requested.
#[must_use]
pub fn classify(m: f64, e: f64, border: Option<BorderColor>) -> Band {
    if m > THRESHOLD_HIGH {
        Band::Foreground
    } else if m < THRESHOLD_LOW {
        match border {
            Some(color) if e > THRESHOLD => Band::Border(color),
            _ => Band::Transparent,
        }
    } else {
        Band::Transition(alpha_for(m))
    }
}

/// Linear alpha ramp across the transition band:
/// `clamp(round((m − 0.45) / 0.10 · 255), 0, 255)`.
#[must_use]
pub fn alpha_for(m: f64) -> u8 {
    let alpha = ((m - THRESHOLD_LOW) / THRESHOLD_RANGE * 255.0)
        .round()
        .clamp(0.0, 255.0);
    // Clamped to the u8 range above; NaN casts to 0.
    #[allow(clippy::cast_possible_truncation, clippy::cast_sign_loss)]
    let alpha = alpha as u8;
    alpha
}

/// Number of pixels that landed in each band.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct BandCounts {
    pub foreground: u64,
    pub border: u64,
    pub transition: u64,
    pub transparent: u64,
}

impl BandCounts {
    fn record(&mut self, band: Band) {
        match band {
            Band::Foreground => self.foreground += 1,
            Band::Border(_) => self.border += 1,
            Band::Transition(_) => self.transition += 1,
            Band::Transparent => self.transparent += 1,
        }
    }

    /// Sum over all bands (the pixel count).
    #[must_use]
    pub const fn total(&self) -> u64 {
        self.foreground + self.border + self.transition + self.transparent
    }
}

impl Add for BandCounts {
    type Output = Self;

    fn add(self, rhs: Self) -> Self {
        Self {
            foreground: self.foreground + rhs.foreground,
            border: self.border + rhs.border,
            transition: self.transition + rhs.transition,
            transparent: self.transparent + rhs.transparent,
        }
    }
}

impl AddAssign for BandCounts {
    fn add_assign(&mut self, rhs: Self) {
        *self = *self + rhs;
    }
}

/// Composite `pixels` (RGBA8, row-major) in place.
///
/// `expanded` is the dilated mask, or `None` when expansion was skipped.
/// `border` is the border color, or `None` when no border is requested.
///
/// # Errors
///
/// Returns [`StickerError::InvalidParameters`] if `dims` has a zero
/// side, `pixels.len() != width * height * 4`, or either mask length is
/// not `width * height`.
pub fn composite(
    pixels: &mut [u8],
    smoothed: &[f64],
    expanded: Option<&[f64]>,
    dims: Dimensions,
    border: Option<BorderColor>,
) -> Result<BandCounts, StickerError> {
    composite_chunked(pixels, smoothed, expanded, dims, border, usize::MAX, &mut NoCheckpoint)
}

/// [`composite`], reporting to `checkpoint` after every `chunk_rows` rows.
///
/// # Errors
///
/// As [`composite`], plus any error returned by `checkpoint`.
pub fn composite_chunked(
    pixels: &mut [u8],
    smoothed: &[f64],
    expanded: Option<&[f64]>,
    dims: Dimensions,
    border: Option<BorderColor>,
    chunk_rows: usize,
    checkpoint: &mut dyn Checkpoint,
) -> Result<BandCounts, StickerError> {
    check_inputs(pixels, smoothed, expanded, dims)?;
    let (width, height) = dims.as_usize();
    let mut counts = BandCounts::default();

    for_each_chunk(height, chunk_rows, StageKind::Composite, checkpoint, |rows| {
        let span = rows.start * width..rows.end * width;
        counts += composite_row(
            &mut pixels[span.start * 4..span.end * 4],
            &smoothed[span.clone()],
            expanded.map(|e| &e[span]),
            border,
        );
        Ok(())
    })?;

    Ok(counts)
}

/// Validate buffer lengths for a composite call.
pub(crate) fn check_inputs(
    pixels: &[u8],
    smoothed: &[f64],
    expanded: Option<&[f64]>,
    dims: Dimensions,
) -> Result<(), StickerError> {
    check_pixels(pixels, dims)?;
    check_mask(smoothed, dims)?;
    if let Some(expanded) = expanded {
        check_mask(expanded, dims)?;
    }
    Ok(())
}

/// Composite a run of pixels. The slices must describe the same pixels
/// (`pixels.len() == 4 * smoothed.len()`).
pub(crate) fn composite_row(
    pixels: &mut [u8],
    smoothed: &[f64],
    expanded: Option<&[f64]>,
    border: Option<BorderColor>,
) -> BandCounts {
    let mut counts = BandCounts::default();
    for (i, (px, &m)) in pixels.chunks_exact_mut(4).zip(smoothed).enumerate() {
        let e = expanded.and_then(|e| e.get(i).copied()).unwrap_or(m);
        let band = classify(m, e, border);
        match band {
            Band::Foreground => px[3] = 255,
            Band::Border(color) => px.copy_from_slice(&[color.r, color.g, color.b, 255]),
            Band::Transition(alpha) => px[3] = alpha,
            Band::Transparent => px[3] = 0,
        }
        counts.record(band);
    }
    counts
}
