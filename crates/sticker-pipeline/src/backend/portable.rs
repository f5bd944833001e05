//! Sequential backend: plain row loops on the calling thread.

use crate::chunk::Checkpoint;
use crate::composite::{BandCounts, composite_chunked};
use crate::expand::expand_chunked;
use crate::smooth::smooth_chunked;
use crate::types::{BorderColor, Dimensions, PipelineConfig, StickerError};

use super::{BackendKind, MaskBackend};

/// Runs every stage with the free chunked functions. Always available.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct PortableBackend {
    chunk_rows: usize,
}

impl PortableBackend {
    #[must_use]
    pub const fn new(chunk_rows: usize) -> Self {
        Self { chunk_rows }
    }
}

impl Default for PortableBackend {
    fn default() -> Self {
        Self::new(PipelineConfig::DEFAULT_CHUNK_ROWS as usize)
    }
}

impl MaskBackend for PortableBackend {
    fn kind(&self) -> BackendKind {
        BackendKind::Portable
    }

    fn smooth(
        &self,
        mask: &[f64],
        dims: Dimensions,
        kernel_size: u32,
        checkpoint: &mut dyn Checkpoint,
    ) -> Result<Vec<f64>, StickerError> {
        smooth_chunked(mask, dims, kernel_size, self.chunk_rows, checkpoint)
    }

    fn expand(
        &self,
        mask: &[f64],
        dims: Dimensions,
        border_width: u32,
        checkpoint: &mut dyn Checkpoint,
    ) -> Result<Vec<f64>, StickerError> {
        expand_chunked(mask, dims, border_width, self.chunk_rows, checkpoint)
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
        composite_chunked(
            pixels,
            smoothed,
            expanded,
            dims,
            border,
            self.chunk_rows,
            checkpoint,
        )
    }
}
