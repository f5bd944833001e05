//! The sticker coordinator.
//!
//! [`StickerPipeline`] owns the backend chosen at construction, the
//! portable fallback, and the caches. Each stage call goes to the
//! primary backend first; if that reports
//! [`StickerError::BackendUnavailable`] the same call is repeated on
//! the fallback and the rest of the run stays there. No other error is
//! retried.

use std::sync::Arc;
use std::time::Duration;

use image::RgbaImage;
use tracing::{debug, debug_span, warn};
use web_time::Instant;

use crate::backend::{BackendKind, MaskBackend, PortableBackend, select_backend};
use crate::buffer::{check_mask, check_pixels};
use crate::cache::{Fingerprint, MaskKey, ResampleKey, StickerCache};
use crate::chunk::{Checkpoint, Deadline, NoCheckpoint, StageKind};
use crate::codec;
use crate::composite::BandCounts;
use crate::diagnostics::{
    StageDiagnostics, StageMetrics, StickerDiagnostics, StickerSummary, count_marked,
};
use crate::resample;
use crate::source::{MaskSource, SourceMask};
use crate::types::{Dimensions, PipelineConfig, StickerError, StickerOptions, StickerParams};

/// A finished sticker.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct StickerOutput {
    /// PNG bytes with an alpha channel.
    pub png: Vec<u8>,
    pub dimensions: Dimensions,
    /// Backend that completed the run.
    pub backend: BackendKind,
    /// Whether the primary backend failed and the fallback took over.
    pub fell_back: bool,
}

/// Turns photos plus masks into stickers.
///
/// Cheap to share between threads (`&self` everywhere); concurrent runs
/// only contend on the cache lock.
pub struct StickerPipeline {
    config: PipelineConfig,
    primary: Box<dyn MaskBackend>,
    fallback: Box<dyn MaskBackend>,
    cache: Arc<StickerCache>,
}

impl std::fmt::Debug for StickerPipeline {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("StickerPipeline")
            .field("config", &self.config)
            .field("primary", &self.primary.kind())
            .field("fallback", &self.fallback.kind())
            .field("cache", &self.cache)
            .finish()
    }
}

impl StickerPipeline {
    /// Validate `config`, query the platform for a backend, and create
    /// empty caches.
    ///
    /// # Errors
    ///
    /// Returns [`StickerError::InvalidOptions`] if the config is invalid.
    pub fn new(config: PipelineConfig) -> Result<Self, StickerError> {
        config.validate()?;
        let chunk_rows = config.chunk_rows as usize;
        let primary = select_backend(config.backend, chunk_rows);
        Self::with_backends(config, primary, Box::new(PortableBackend::new(chunk_rows)))
    }

    /// Use caller-supplied backends instead of probing.
    ///
    /// # Errors
    ///
    /// Returns [`StickerError::InvalidOptions`] if the config is invalid.
    pub fn with_backends(
        config: PipelineConfig,
        primary: Box<dyn MaskBackend>,
        fallback: Box<dyn MaskBackend>,
    ) -> Result<Self, StickerError> {
        config.validate()?;
        let cache = Arc::new(StickerCache::new(config.cache_capacity));
        Ok(Self {
            config,
            primary,
            fallback,
            cache,
        })
    }

    /// Share an existing cache (for example between several pipelines).
    #[must_use]
    pub fn with_cache(mut self, cache: Arc<StickerCache>) -> Self {
        self.cache = cache;
        self
    }

    #[must_use]
    pub const fn config(&self) -> &PipelineConfig {
        &self.config
    }

    /// Kind of the primary backend.
    #[must_use]
    pub fn backend_kind(&self) -> BackendKind {
        self.primary.kind()
    }

    #[must_use]
    pub const fn cache(&self) -> &Arc<StickerCache> {
        &self.cache
    }

    /// Run smooth → expand (when needed) → composite on raw buffers.
    ///
    /// `pixels` is consumed and returned mutated, so the caller cannot
    /// keep observing the pre-composite buffer through this handle.
    /// `mask` must already have the image's dimensions.
    ///
    /// # Errors
    ///
    /// - [`StickerError::InvalidParameters`] for mismatched buffers or
    ///   zero dimensions
    /// - [`StickerError::ResourceExhaustion`] if an intermediate buffer
    ///   cannot be allocated
    /// - [`StickerError::BackendUnavailable`] only if the fallback also
    ///   failed
    /// - [`StickerError::Timeout`] once the configured budget is spent
    /// - any error returned by `checkpoint`
    pub fn make_sticker_rgba(
        &self,
        mut pixels: Vec<u8>,
        dims: Dimensions,
        mask: &[f64],
        params: &StickerParams,
        checkpoint: &mut dyn Checkpoint,
    ) -> Result<Vec<u8>, StickerError> {
        let mut deadline = Deadline::new(self.config.timeout, checkpoint);
        self.run_core(&mut pixels, dims, mask, params, &mut deadline)?;
        Ok(pixels)
    }

    /// Produce PNG sticker bytes from compressed image bytes.
    ///
    /// Validates `options`, decodes the image, asks `source` for a mask
    /// (cached by image content and source name), resamples the mask if
    /// its size differs (cached too), runs the core stages, and encodes
    /// the result as PNG.
    ///
    /// # Errors
    ///
    /// Boundary errors ([`StickerError::InvalidOptions`],
    /// [`StickerError::EmptyInput`], [`StickerError::UnrecognizedFormat`],
    /// [`StickerError::ImageDecode`]), [`StickerError::UpstreamMaskFailure`]
    /// from the source, [`StickerError::ImageEncode`], and everything
    /// [`make_sticker_rgba`](Self::make_sticker_rgba) can return.
    pub fn make_sticker(
        &self,
        image_bytes: &[u8],
        options: &StickerOptions,
        source: &dyn MaskSource,
        checkpoint: &mut dyn Checkpoint,
    ) -> Result<StickerOutput, StickerError> {
        self.make_sticker_with_diagnostics(image_bytes, options, source, checkpoint)
            .map(|(output, _)| output)
    }

    /// [`make_sticker`](Self::make_sticker), also returning per-stage
    /// diagnostics.
    ///
    /// # Errors
    ///
    /// As [`make_sticker`](Self::make_sticker).
    pub fn make_sticker_with_diagnostics(
        &self,
        image_bytes: &[u8],
        options: &StickerOptions,
        source: &dyn MaskSource,
        checkpoint: &mut dyn Checkpoint,
    ) -> Result<(StickerOutput, StickerDiagnostics), StickerError> {
        let total_start = Instant::now();
        let params = options.validate()?;
        let mut deadline = Deadline::new(self.config.timeout, checkpoint);

        // --- Decode ---
        let start = Instant::now();
        let image = codec::decode_rgba(image_bytes)?;
        let dims = Dimensions::new(image.width(), image.height());
        let decode = StageDiagnostics {
            duration: start.elapsed(),
            metrics: StageMetrics::Decode {
                input_bytes: image_bytes.len(),
                width: dims.width,
                height: dims.height,
            },
        };
        deadline.check()?;

        let _span = debug_span!("make_sticker", %dims, source = source.name()).entered();

        // --- Segment ---
        let fingerprint = Fingerprint::of(image_bytes);
        let start = Instant::now();
        let (source_mask, mask_hit) = self.source_mask(fingerprint, &image, source)?;
        let mask_dims = source_mask.dimensions();
        let segment = StageDiagnostics {
            duration: start.elapsed(),
            metrics: StageMetrics::Segment {
                source: source.name().to_string(),
                mask_width: mask_dims.width,
                mask_height: mask_dims.height,
                cache_hit: mask_hit,
            },
        };
        deadline.check()?;

        // --- Resample ---
        let resampled = if mask_dims == dims {
            None
        } else {
            let start = Instant::now();
            let key = ResampleKey {
                image: fingerprint,
                source: source.name().to_string(),
                target: dims,
            };
            let (values, hit) = self.resampled_mask(key, &source_mask, &mut deadline)?;
            let diag = StageDiagnostics {
                duration: start.elapsed(),
                metrics: StageMetrics::Resample {
                    from_width: mask_dims.width,
                    from_height: mask_dims.height,
                    to_width: dims.width,
                    to_height: dims.height,
                    cache_hit: hit,
                },
            };
            Some((values, diag))
        };
        let mask: &[f64] = resampled
            .as_ref()
            .map_or(source_mask.values(), |(values, _)| values.as_slice());

        // --- Core stages ---
        let mut pixels = image.into_raw();
        let core = self.run_core(&mut pixels, dims, mask, &params, &mut deadline)?;

        // --- Encode ---
        let start = Instant::now();
        let png = codec::encode_png(&pixels, dims)?;
        let encode = StageDiagnostics {
            duration: start.elapsed(),
            metrics: StageMetrics::Encode {
                output_bytes: png.len(),
            },
        };
        deadline.check()?;

        let diagnostics = StickerDiagnostics {
            backend: core.backend,
            fell_back: core.fell_back,
            decode,
            segment,
            resample: resampled.map(|(_, diag)| diag),
            smooth: core.smooth,
            expand: core.expand,
            composite: core.composite,
            encode,
            total_duration: total_start.elapsed(),
            summary: StickerSummary {
                image_width: dims.width,
                image_height: dims.height,
                pixel_count: u64::from(dims.width) * u64::from(dims.height),
                bands: core.counts,
            },
        };
        debug!(
            total_ms = diagnostics.total_duration.as_secs_f64() * 1000.0,
            backend = %core.backend,
            fell_back = core.fell_back,
            "sticker finished"
        );

        let output = StickerOutput {
            png,
            dimensions: dims,
            backend: core.backend,
            fell_back: core.fell_back,
        };
        Ok((output, diagnostics))
    }

    fn source_mask(
        &self,
        image: Fingerprint,
        decoded: &RgbaImage,
        source: &dyn MaskSource,
    ) -> Result<(Arc<SourceMask>, bool), StickerError> {
        let key = MaskKey {
            image,
            source: source.name().to_string(),
        };
        if let Some(mask) = self.cache.masks().get(&key) {
            debug!(source = %key.source, %image, "mask cache hit");
            return Ok((mask, true));
        }
        debug!(source = %key.source, %image, "mask cache miss");
        let mask = source
            .segment(decoded)
            .map_err(|e| StickerError::UpstreamMaskFailure(format!("{}: {e}", source.name())))?;
        Ok((self.cache.masks().insert(key, mask), false))
    }

    fn resampled_mask(
        &self,
        key: ResampleKey,
        mask: &SourceMask,
        checkpoint: &mut dyn Checkpoint,
    ) -> Result<(Arc<Vec<f64>>, bool), StickerError> {
        if let Some(values) = self.cache.resampled().get(&key) {
            debug!(to = %key.target, "resample cache hit");
            return Ok((values, true));
        }
        debug!(from = %mask.dimensions(), to = %key.target, "resample cache miss");
        let values = resample::bilinear_chunked(
            mask.values(),
            mask.dimensions(),
            key.target,
            self.config.chunk_rows as usize,
            checkpoint,
        )?;
        Ok((self.cache.resampled().insert(key, values), false))
    }

    fn run_core(
        &self,
        pixels: &mut [u8],
        dims: Dimensions,
        mask: &[f64],
        params: &StickerParams,
        checkpoint: &mut dyn Checkpoint,
    ) -> Result<CoreReport, StickerError> {
        check_pixels(pixels, dims)?;
        check_mask(mask, dims)?;
        let mut run = FallbackRun::new(self);

        let start = Instant::now();
        let kernel_size = self.config.smoothing_kernel;
        let smoothed = run.stage(StageKind::Smooth, |backend| {
            backend.smooth(mask, dims, kernel_size, checkpoint)
        })?;
        let smooth = run.diagnostics(start.elapsed(), |backend| StageMetrics::Smooth {
            kernel_size,
            backend,
        });

        let (expanded, expand) = if params.needs_expansion() {
            let start = Instant::now();
            let border_width = params.border_width;
            let expanded = run.stage(StageKind::Expand, |backend| {
                backend.expand(&smoothed, dims, border_width, checkpoint)
            })?;
            let marked_pixels = count_marked(&expanded);
            let diag = run.diagnostics(start.elapsed(), |backend| StageMetrics::Expand {
                border_width,
                marked_pixels,
                backend,
            });
            (Some(expanded), Some(diag))
        } else {
            (None, None)
        };

        let start = Instant::now();
        let border = params.border();
        let counts = run.stage(StageKind::Composite, |backend| {
            backend.composite(
                pixels,
                &smoothed,
                expanded.as_deref(),
                dims,
                border,
                checkpoint,
            )
        })?;
        let composite =
            run.diagnostics(start.elapsed(), |backend| StageMetrics::Composite { counts, backend });

        Ok(CoreReport {
            backend: run.backend().kind(),
            fell_back: run.fell_back,
            smooth,
            expand,
            composite,
            counts,
        })
    }
}

/// What the core stages report back for diagnostics.
struct CoreReport {
    backend: BackendKind,
    fell_back: bool,
    smooth: StageDiagnostics,
    expand: Option<StageDiagnostics>,
    composite: StageDiagnostics,
    counts: BandCounts,
}

/// Tracks whether the current run has switched to the fallback.
struct FallbackRun<'p> {
    pipeline: &'p StickerPipeline,
    fell_back: bool,
}

impl<'p> FallbackRun<'p> {
    const fn new(pipeline: &'p StickerPipeline) -> Self {
        Self {
            pipeline,
            fell_back: false,
        }
    }

    fn backend(&self) -> &'p dyn MaskBackend {
        if self.fell_back {
            self.pipeline.fallback.as_ref()
        } else {
            self.pipeline.primary.as_ref()
        }
    }

    /// Run `op` on the current backend, retrying once on the fallback
    /// if the primary reports `BackendUnavailable`.
    fn stage<T>(
        &mut self,
        stage: StageKind,
        mut op: impl FnMut(&dyn MaskBackend) -> Result<T, StickerError>,
    ) -> Result<T, StickerError> {
        if !self.fell_back {
            let primary = self.pipeline.primary.as_ref();
            match op(primary) {
                Err(StickerError::BackendUnavailable(reason)) => {
                    warn!(
                        %stage,
                        failed = %primary.kind(),
                        fallback = %self.pipeline.fallback.kind(),
                        %reason,
                        "backend unavailable, retrying on fallback"
                    );
                    self.fell_back = true;
                }
                other => return other,
            }
        }
        op(self.pipeline.fallback.as_ref())
    }

    fn diagnostics(
        &self,
        duration: Duration,
        metrics: impl FnOnce(BackendKind) -> StageMetrics,
    ) -> StageDiagnostics {
        StageDiagnostics {
            duration,
            metrics: metrics(self.backend().kind()),
        }
    }
}

/// Make a sticker with a default [`StickerPipeline`].
///
/// Builds a fresh pipeline (and its thread pool) per call; keep a
/// [`StickerPipeline`] around to reuse the pool and caches.
///
/// # Errors
///
/// As [`StickerPipeline::make_sticker`].
pub fn make_sticker(
    image_bytes: &[u8],
    options: &StickerOptions,
    source: &dyn MaskSource,
) -> Result<StickerOutput, StickerError> {
    StickerPipeline::new(PipelineConfig::default())?.make_sticker(
        image_bytes,
        options,
        source,
        &mut NoCheckpoint,
    )
}

#[cfg(test)]
#[allow(clippy::unwrap_used)]
mod tests {
    use std::sync::atomic::{AtomicUsize, Ordering};

    use super::*;
    use crate::backend::BackendPreference;
    use crate::types::BorderColor;

    /// Counts calls and fails every one with the given error.
    struct Failing {
        error: StickerError,
        calls: Arc<AtomicUsize>,
    }

    impl Failing {
        fn new(error: StickerError) -> (Self, Arc<AtomicUsize>) {
            let calls = Arc::new(AtomicUsize::new(0));
            (
                Self {
                    error,
                    calls: Arc::clone(&calls),
                },
                calls,
            )
        }

        fn fail<T>(&self) -> Result<T, StickerError> {
            self.calls.fetch_add(1, Ordering::SeqCst);
            Err(self.error.clone())
        }
    }

    impl MaskBackend for Failing {
        fn kind(&self) -> BackendKind {
            BackendKind::Native
        }

        fn smooth(
            &self,
            _: &[f64],
            _: Dimensions,
            _: u32,
            _: &mut dyn Checkpoint,
        ) -> Result<Vec<f64>, StickerError> {
            self.fail()
        }

        fn expand(
            &self,
            _: &[f64],
            _: Dimensions,
            _: u32,
            _: &mut dyn Checkpoint,
        ) -> Result<Vec<f64>, StickerError> {
            self.fail()
        }

        fn composite(
            &self,
            _: &mut [u8],
            _: &[f64],
            _: Option<&[f64]>,
            _: Dimensions,
            _: Option<BorderColor>,
            _: &mut dyn Checkpoint,
        ) -> Result<BandCounts, StickerError> {
            self.fail()
        }
    }

    fn portable_config() -> PipelineConfig {
        PipelineConfig {
            backend: BackendPreference::Portable,
            ..PipelineConfig::default()
        }
    }

    fn run(pipeline: &StickerPipeline, params: &StickerParams) -> Result<Vec<u8>, StickerError> {
        let dims = Dimensions::new(4, 4);
        let mut mask = vec![0.0; 16];
        for i in [5, 6, 9, 10] {
            mask[i] = 1.0;
        }
        pipeline.make_sticker_rgba(vec![100; 64], dims, &mask, params, &mut NoCheckpoint)
    }

    #[test]
    fn new_rejects_invalid_config() {
        let config = PipelineConfig {
            smoothing_kernel: 2,
            ..PipelineConfig::default()
        };
        assert!(matches!(
            StickerPipeline::new(config),
            Err(StickerError::InvalidOptions(_))
        ));
    }

    #[test]
    fn portable_preference_selects_portable() {
        let pipeline = StickerPipeline::new(portable_config()).unwrap();
        assert_eq!(pipeline.backend_kind(), BackendKind::Portable);
    }

    #[test]
    fn unavailable_primary_falls_back_once_and_stays() {
        let (failing, calls) =
            Failing::new(StickerError::BackendUnavailable("no threads".to_string()));
        let pipeline = StickerPipeline::with_backends(
            PipelineConfig::default(),
            Box::new(failing),
            Box::new(PortableBackend::default()),
        )
        .unwrap();

        let with_fallback = run(&pipeline, &StickerParams::default()).unwrap();
        let reference = run(
            &StickerPipeline::new(portable_config()).unwrap(),
            &StickerParams::default(),
        )
        .unwrap();
        assert_eq!(with_fallback, reference);
        // Only the first stage touched the failing backend.
        assert_eq!(calls.load(Ordering::SeqCst), 1);
    }

    #[test]
    fn other_errors_are_not_retried() {
        let (failing, calls) = Failing::new(StickerError::ResourceExhaustion { bytes: 128 });
        let (fallback, fallback_calls) =
            Failing::new(StickerError::InvalidParameters("unreachable".to_string()));
        let pipeline = StickerPipeline::with_backends(
            PipelineConfig::default(),
            Box::new(failing),
            Box::new(fallback),
        )
        .unwrap();

        let result = run(&pipeline, &StickerParams::default());
        assert_eq!(result, Err(StickerError::ResourceExhaustion { bytes: 128 }));
        assert_eq!(calls.load(Ordering::SeqCst), 1);
        assert_eq!(fallback_calls.load(Ordering::SeqCst), 0);
    }

    #[test]
    fn fallback_failure_is_surfaced() {
        let (primary, _) = Failing::new(StickerError::BackendUnavailable("primary".to_string()));
        let (fallback, _) = Failing::new(StickerError::BackendUnavailable("fallback".to_string()));
        let pipeline = StickerPipeline::with_backends(
            PipelineConfig::default(),
            Box::new(primary),
            Box::new(fallback),
        )
        .unwrap();

        assert_eq!(
            run(&pipeline, &StickerParams::default()),
            Err(StickerError::BackendUnavailable("fallback".to_string()))
        );
    }

    #[test]
    fn raw_contract_validates_before_running() {
        let pipeline = StickerPipeline::new(portable_config()).unwrap();
        let result = pipeline.make_sticker_rgba(
            vec![0; 63],
            Dimensions::new(4, 4),
            &[0.0; 16],
            &StickerParams::default(),
            &mut NoCheckpoint,
        );
        assert!(matches!(result, Err(StickerError::InvalidParameters(_))));
    }

    #[test]
    fn zero_border_width_skips_expansion() {
        let pipeline = StickerPipeline::new(portable_config()).unwrap();
        let params = StickerParams {
            add_border: true,
            border_color: BorderColor::new(255, 0, 0),
            border_width: 0,
        };
        let out = run(&pipeline, &params).unwrap();
        // No pixel is painted red.
        assert!(out.chunks_exact(4).all(|p| p[..3] == [100, 100, 100]));
    }

    #[test]
    fn zero_timeout_fails_with_timeout() {
        let pipeline = StickerPipeline::new(PipelineConfig {
            timeout: Some(Duration::ZERO),
            ..portable_config()
        })
        .unwrap();
        assert!(matches!(
            run(&pipeline, &StickerParams::default()),
            Err(StickerError::Timeout { .. })
        ));
    }

    #[test]
    fn shared_cache_is_used() {
        let cache = Arc::new(StickerCache::new(2));
        let pipeline = StickerPipeline::new(portable_config())
            .unwrap()
            .with_cache(Arc::clone(&cache));
        assert!(Arc::ptr_eq(pipeline.cache(), &cache));
    }
}
