//! Sticker diagnostics: timing and pixel counts for each stage.
//!
//! Collected by
//! [`make_sticker_with_diagnostics`](crate::StickerPipeline::make_sticker_with_diagnostics)
//! for tuning and benchmarking. Timestamps come from `web-time`, so the
//! same code measures with `performance.now()` in a browser worker.
//!
//! Durations serialize as fractional seconds (`f64`).

use std::time::Duration;

use serde::{Deserialize, Serialize};

use crate::backend::BackendKind;
use crate::composite::BandCounts;
use crate::types::{THRESHOLD, duration_serde};

/// Diagnostics collected from one sticker run.
///
/// Stages that can be skipped have `Option` fields.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct StickerDiagnostics {
    /// Backend that finished the run.
    pub backend: BackendKind,
    /// Whether any stage had to be retried on the fallback backend.
    pub fell_back: bool,
    /// Decoding the input image.
    pub decode: StageDiagnostics,
    /// Obtaining the mask from the source (possibly cached).
    pub segment: StageDiagnostics,
    /// Resampling the mask to the image size (only on size mismatch).
    pub resample: Option<StageDiagnostics>,
    /// Box blur.
    pub smooth: StageDiagnostics,
    /// Disc dilation (only with a non-zero border).
    pub expand: Option<StageDiagnostics>,
    /// Band compositing.
    pub composite: StageDiagnostics,
    /// PNG encoding.
    pub encode: StageDiagnostics,
    /// Wall-clock duration of the whole run.
    #[serde(with = "duration_serde")]
    pub total_duration: Duration,
    pub summary: StickerSummary,
}

/// Diagnostics for a single stage.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct StageDiagnostics {
    #[serde(with = "duration_serde")]
    pub duration: Duration,
    pub metrics: StageMetrics,
}

/// Stage-specific metrics.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub enum StageMetrics {
    Decode {
        /// Size of the compressed input.
        input_bytes: usize,
        width: u32,
        height: u32,
    },
    Segment {
        /// Name of the mask source.
        source: String,
        /// Mask resolution as produced by the source.
        mask_width: u32,
        mask_height: u32,
        cache_hit: bool,
    },
    Resample {
        from_width: u32,
        from_height: u32,
        to_width: u32,
        to_height: u32,
        cache_hit: bool,
    },
    Smooth {
        kernel_size: u32,
        backend: BackendKind,
    },
    Expand {
        border_width: u32,
        /// Pixels set to 1.0 in the expanded mask.
        marked_pixels: u64,
        backend: BackendKind,
    },
    Composite {
        counts: BandCounts,
        backend: BackendKind,
    },
    Encode {
        output_bytes: usize,
    },
}

/// High-level counts for the whole run.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct StickerSummary {
    pub image_width: u32,
    pub image_height: u32,
    pub pixel_count: u64,
    /// Pixels per band after compositing.
    pub bands: BandCounts,
}

impl StickerDiagnostics {
    /// Format diagnostics as a human-readable report.
    #[must_use]
    pub fn report(&self) -> String {
        let mut lines = Vec::new();

        lines.push(format!("Sticker Diagnostics Report\n{}", "=".repeat(60)));
        lines.push(format!(
            "Image: {}x{} ({} pixels)",
            self.summary.image_width, self.summary.image_height, self.summary.pixel_count,
        ));
        lines.push(format!(
            "Backend: {}{}",
            self.backend,
            if self.fell_back { " (after fallback)" } else { "" },
        ));
        lines.push(format!(
            "Total duration: {:.3}ms",
            duration_ms(self.total_duration),
        ));
        lines.push(String::new());

        lines.push(format!(
            "{:<16} {:>10} {:>10}  {}",
            "Stage", "Duration", "% Total", "Details"
        ));
        lines.push("-".repeat(80));

        let total_ms = duration_ms(self.total_duration);

        let mut stages: Vec<(&str, &StageDiagnostics)> =
            vec![("Decode", &self.decode), ("Segment", &self.segment)];
        if let Some(ref resample) = self.resample {
            stages.push(("Resample", resample));
        }
        stages.push(("Smooth", &self.smooth));
        if let Some(ref expand) = self.expand {
            stages.push(("Expand", expand));
        }
        stages.push(("Composite", &self.composite));
        stages.push(("Encode", &self.encode));

        for (name, diag) in &stages {
            let ms = duration_ms(diag.duration);
            let pct = if total_ms > 0.0 {
                ms / total_ms * 100.0
            } else {
                0.0
            };
            let details = format_metrics(&diag.metrics);
            lines.push(format!("{name:<16} {ms:>8.3}ms {pct:>9.1}%  {details}"));
        }

        let bands = &self.summary.bands;
        lines.push(String::new());
        lines.push(format!(
            "Foreground: {}  |  Border: {}  |  Transition: {}  |  Transparent: {}",
            bands.foreground, bands.border, bands.transition, bands.transparent,
        ));

        lines.join("\n")
    }
}

/// Convert a `Duration` to milliseconds as `f64`.
fn duration_ms(d: Duration) -> f64 {
    d.as_secs_f64() * 1000.0
}

fn format_metrics(metrics: &StageMetrics) -> String {
    let hit = |cache_hit: bool| if cache_hit { " (cached)" } else { "" };
    match metrics {
        StageMetrics::Decode {
            input_bytes,
            width,
            height,
        } => format!("{input_bytes} bytes -> {width}x{height}"),
        StageMetrics::Segment {
            source,
            mask_width,
            mask_height,
            cache_hit,
        } => format!("{source} {mask_width}x{mask_height}{}", hit(*cache_hit)),
        StageMetrics::Resample {
            from_width,
            from_height,
            to_width,
            to_height,
            cache_hit,
        } => format!(
            "{from_width}x{from_height} -> {to_width}x{to_height}{}",
            hit(*cache_hit)
        ),
        StageMetrics::Smooth {
            kernel_size,
            backend,
        } => format!("kernel={kernel_size} [{backend}]"),
        StageMetrics::Expand {
            border_width,
            marked_pixels,
            backend,
        } => format!("r={border_width} marked={marked_pixels} [{backend}]"),
        StageMetrics::Composite { counts, backend } => {
            #[allow(clippy::cast_precision_loss)]
            let opaque = if counts.total() > 0 {
                (counts.foreground + counts.border) as f64 / counts.total() as f64 * 100.0
            } else {
                0.0
            };
            format!("{opaque:.1}% opaque [{backend}]")
        }
        StageMetrics::Encode { output_bytes } => format!("{output_bytes} bytes"),
    }
}

/// Pixels marked in an expanded mask.
pub(crate) fn count_marked(expanded: &[f64]) -> u64 {
    expanded.iter().map(|&v| u64::from(v > THRESHOLD)).sum()
}
