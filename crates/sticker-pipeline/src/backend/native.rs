//! Multi-threaded backend on a dedicated `rayon` pool.
//!
//! Rows inside a chunk are processed in parallel; the checkpoint runs
//! on the calling thread between chunks. Expansion uses the exact
//! distance transform instead of span filling so its cost does not grow
//! with the border radius.

use std::any::Any;
use std::panic::{self, AssertUnwindSafe};

use rayon::prelude::*;
use rayon::{ThreadPool, ThreadPoolBuilder};
use tracing::debug;

use crate::buffer::{ScratchPool, check_mask, try_copy, try_filled};
use crate::chunk::{Checkpoint, StageKind, for_each_chunk};
use crate::composite::{BandCounts, check_inputs, composite_row};
use crate::expand::{RowEnvelope, vertical_distances};
use crate::smooth::{horizontal_row, radius_of, vertical_row};
use crate::types::{BorderColor, Dimensions, StickerError};

use super::{BackendKind, MaskBackend};

/// Idle scratch buffers kept per element type.
const RETAINED_SCRATCH: usize = 2;

pub struct NativeBackend {
    pool: ThreadPool,
    chunk_rows: usize,
    blur_scratch: ScratchPool<f64>,
    distance_scratch: ScratchPool<u32>,
}

impl NativeBackend {
    /// Build a backend with its own pool of `threads` workers.
    ///
    /// # Errors
    ///
    /// Returns [`StickerError::BackendUnavailable`] if the pool cannot
    /// be created (for example where threads are not supported).
    pub fn new(threads: usize, chunk_rows: usize) -> Result<Self, StickerError> {
        let pool = ThreadPoolBuilder::new()
            .num_threads(threads)
            .thread_name(|i| format!("sticker-worker-{i}"))
            .build()
            .map_err(|e| StickerError::BackendUnavailable(format!("thread pool: {e}")))?;
        debug!(threads = pool.current_num_threads(), chunk_rows, "native pool built");
        Ok(Self {
            pool,
            chunk_rows: chunk_rows.max(1),
            blur_scratch: ScratchPool::new(RETAINED_SCRATCH),
            distance_scratch: ScratchPool::new(RETAINED_SCRATCH),
        })
    }

    #[must_use]
    pub fn threads(&self) -> usize {
        self.pool.current_num_threads()
    }

    /// Run `op` on the pool. A panic inside becomes `BackendUnavailable`.
    fn run<R: Send>(&self, op: impl FnOnce() -> R + Send) -> Result<R, StickerError> {
        panic::catch_unwind(AssertUnwindSafe(|| self.pool.install(op))).map_err(|payload| {
            StickerError::BackendUnavailable(format!(
                "native worker panicked: {}",
                panic_message(&*payload)
            ))
        })
    }
}

impl std::fmt::Debug for NativeBackend {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("NativeBackend")
            .field("threads", &self.threads())
            .field("chunk_rows", &self.chunk_rows)
            .finish_non_exhaustive()
    }
}

fn panic_message(payload: &(dyn Any + Send)) -> String {
    payload
        .downcast_ref::<&str>()
        .map(|s| (*s).to_string())
        .or_else(|| payload.downcast_ref::<String>().cloned())
        .unwrap_or_else(|| "unknown panic".to_string())
}

impl MaskBackend for NativeBackend {
    fn kind(&self) -> BackendKind {
        BackendKind::Native
    }

    fn smooth(
        &self,
        mask: &[f64],
        dims: Dimensions,
        kernel_size: u32,
        checkpoint: &mut dyn Checkpoint,
    ) -> Result<Vec<f64>, StickerError> {
        let len = check_mask(mask, dims)?;
        if kernel_size <= 1 {
            return try_copy(mask);
        }

        let radius = radius_of(kernel_size);
        let (width, height) = dims.as_usize();
        let mut horizontal = self.blur_scratch.lease(len)?;
        let mut out = try_filled(len, 0.0)?;
        let mut horizontal_done = 0;

        for_each_chunk(height, self.chunk_rows, StageKind::Smooth, checkpoint, |rows| {
            let needed = rows.end.saturating_add(radius).min(height);
            let pending = horizontal_done..needed.max(horizontal_done);
            let source = &mask[pending.start * width..pending.end * width];
            let scratch: &mut [f64] = &mut horizontal;
            let out_rows = &mut out[rows.start * width..rows.end * width];
            let first_row = rows.start;

            self.run(move || {
                scratch[pending.start * width..pending.end * width]
                    .par_chunks_mut(width)
                    .zip(source.par_chunks(width))
                    .for_each(|(dst, src)| horizontal_row(src, dst, radius));

                let blurred: &[f64] = scratch;
                out_rows
                    .par_chunks_mut(width)
                    .enumerate()
                    .for_each(|(i, dst)| {
                        vertical_row(blurred, width, height, first_row + i, radius, dst);
                    });
            })?;

            horizontal_done = horizontal_done.max(needed);
            Ok(())
        })?;

        Ok(out)
    }

    fn expand(
        &self,
        mask: &[f64],
        dims: Dimensions,
        border_width: u32,
        checkpoint: &mut dyn Checkpoint,
    ) -> Result<Vec<f64>, StickerError> {
        let len = check_mask(mask, dims)?;
        if border_width == 0 {
            return try_copy(mask);
        }

        let (width, height) = dims.as_usize();
        let mut distances = self.distance_scratch.lease(len)?;
        vertical_distances(mask, width, &mut distances);
        let distances: &[u32] = &distances;
        let mut out = try_filled(len, 0.0)?;

        for_each_chunk(height, self.chunk_rows, StageKind::Expand, checkpoint, |rows| {
            let g_rows = &distances[rows.start * width..rows.end * width];
            let out_rows = &mut out[rows.start * width..rows.end * width];
            self.run(move || {
                out_rows
                    .par_chunks_mut(width)
                    .zip(g_rows.par_chunks(width))
                    .for_each_init(RowEnvelope::default, |envelope, (dst, g_row)| {
                        envelope.mark_row(g_row, border_width, dst);
                    });
            })
        })?;

        Ok(out)
    }

    fn composite(
        &self,
        pixels: &mut [u8],
        smoothed: &[f64],
        expanded: Option<&[f64]>,
        dims: Dimensions,
        border: Option<BorderColor>,
        checkpoint: &mut dyn Checkpoint,
    ) -> Result<BandCounts, StickerError> {
        check_inputs(pixels, smoothed, expanded, dims)?;
        let (width, height) = dims.as_usize();
        let mut counts = BandCounts::default();

        for_each_chunk(height, self.chunk_rows, StageKind::Composite, checkpoint, |rows| {
            let span = rows.start * width..rows.end * width;
            let px = &mut pixels[span.start * 4..span.end * 4];
            let m = &smoothed[span.clone()];
            let e = expanded.map(|e| &e[span]);
            counts += self.run(move || {
                px.par_chunks_mut(width * 4)
                    .enumerate()
                    .map(|(i, row)| {
                        let cols = i * width..(i + 1) * width;
                        composite_row(row, &m[cols.clone()], e.map(|e| &e[cols]), border)
                    })
                    .reduce(BandCounts::default, |a, b| a + b)
            })?;
            Ok(())
        })?;

        Ok(counts)
    }
}

#[cfg(test)]
#[allow(clippy::unwrap_used, clippy::panic)]
mod tests {
    use super::*;
    use crate::backend::PortableBackend;
    use crate::chunk::{NoCheckpoint, Progress};
    use crate::expand::tests::brute_force;

    fn noise(width: usize, height: usize, seed: u64) -> Vec<f64> {
        let mut state = seed;
        (0..width * height)
            .map(|_| {
                state ^= state << 13;
                state ^= state >> 7;
                state ^= state << 17;
                #[allow(clippy::cast_precision_loss)]
                let v = (state % 1000) as f64 / 999.0;
                v
            })
            .collect()
    }

    fn backend(chunk_rows: usize) -> NativeBackend {
        NativeBackend::new(3, chunk_rows).unwrap()
    }

    #[test]
    fn reports_native_kind_and_threads() {
        let native = backend(8);
        assert_eq!(native.kind(), BackendKind::Native);
        assert_eq!(native.threads(), 3);
    }

    #[test]
    fn smooth_matches_portable_exactly() {
        let dims = Dimensions::new(23, 17);
        let mask = noise(23, 17, 0x9E37_79B9);
        for (kernel, chunk_rows) in [(3, 4), (5, 1), (9, 64), (1, 2)] {
            let native = backend(chunk_rows)
                .smooth(&mask, dims, kernel, &mut NoCheckpoint)
                .unwrap();
            let portable = PortableBackend::new(chunk_rows)
                .smooth(&mask, dims, kernel, &mut NoCheckpoint)
                .unwrap();
            assert_eq!(native, portable, "kernel {kernel}, chunk_rows {chunk_rows}");
        }
    }

    #[test]
    fn expand_matches_brute_force() {
        let (width, height) = (21, 15);
        let mask = noise(width, height, 42)
            .into_iter()
            .map(|v| if v > 0.96 { 1.0 } else { 0.0 })
            .collect::<Vec<_>>();
        let dims = Dimensions::new(21, 15);
        for radius in [1, 2, 3, 5, 12] {
            let got = backend(4).expand(&mask, dims, radius, &mut NoCheckpoint).unwrap();
            assert_eq!(got, brute_force(&mask, width, height, radius), "radius {radius}");
        }
    }

    #[test]
    fn expand_radius_zero_is_identity() {
        let mask = noise(4, 4, 7);
        let got = backend(2)
            .expand(&mask, Dimensions::new(4, 4), 0, &mut NoCheckpoint)
            .unwrap();
        assert_eq!(got, mask);
    }

    #[test]
    fn composite_matches_portable() {
        let dims = Dimensions::new(16, 9);
        let smoothed = noise(16, 9, 5);
        let expanded: Vec<f64> = noise(16, 9, 6).into_iter().map(f64::round).collect();
        let border = Some(BorderColor::new(10, 200, 30));
        let mut a: Vec<u8> = (0..16 * 9 * 4).map(|i| u8::try_from(i % 251).unwrap()).collect();
        let mut b = a.clone();

        let native_counts = backend(2)
            .composite(&mut a, &smoothed, Some(&expanded), dims, border, &mut NoCheckpoint)
            .unwrap();
        let portable_counts = PortableBackend::new(5)
            .composite(&mut b, &smoothed, Some(&expanded), dims, border, &mut NoCheckpoint)
            .unwrap();
        assert_eq!(a, b);
        assert_eq!(native_counts, portable_counts);
        assert_eq!(native_counts.total(), 16 * 9);
    }

    #[test]
    fn checkpoint_runs_between_chunks() {
        let mut rows_done = Vec::new();
        let mut checkpoint = |p: Progress| -> Result<(), StickerError> {
            rows_done.push(p.rows_done);
            Ok(())
        };
        backend(4)
            .smooth(&noise(3, 10, 1), Dimensions::new(3, 10), 3, &mut checkpoint)
            .unwrap();
        assert_eq!(rows_done, vec![4, 8, 10]);
    }

    #[test]
    fn checkpoint_error_aborts() {
        let mut checkpoint = |_: Progress| -> Result<(), StickerError> {
            Err(StickerError::Timeout {
                budget: std::time::Duration::ZERO,
            })
        };
        let result = backend(1).expand(
            &noise(4, 4, 3),
            Dimensions::new(4, 4),
            2,
            &mut checkpoint,
        );
        assert!(matches!(result, Err(StickerError::Timeout { .. })));
    }

    #[test]
    fn panic_in_pool_is_backend_unavailable() {
        let native = backend(1);
        let result: Result<(), _> = native.run(|| panic!("simulated worker fault"));
        match result {
            Err(StickerError::BackendUnavailable(message)) => {
                assert!(message.contains("simulated worker fault"), "{message}");
            }
            other => panic!("expected BackendUnavailable, got {other:?}"),
        }
    }

    #[test]
    fn scratch_is_returned_after_each_stage() {
        let native = backend(2);
        let dims = Dimensions::new(6, 6);
        let mask = noise(6, 6, 11);
        native.smooth(&mask, dims, 3, &mut NoCheckpoint).unwrap();
        native.expand(&mask, dims, 2, &mut NoCheckpoint).unwrap();
        assert_eq!(native.blur_scratch.idle(), 1);
        assert_eq!(native.distance_scratch.idle(), 1);
    }

    #[test]
    fn length_mismatch_is_invalid_parameters() {
        let result = backend(2).smooth(&[0.0; 3], Dimensions::new(2, 2), 3, &mut NoCheckpoint);
        assert!(matches!(result, Err(StickerError::InvalidParameters(_))));
    }
}
