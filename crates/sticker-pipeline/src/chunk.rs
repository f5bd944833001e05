//! Cooperative chunking of row loops.
//!
//! Every stage walks its output rows through [`for_each_chunk`], which
//! hands control to a [`Checkpoint`] after each block of rows. A
//! checkpoint can report progress to a UI, yield to a scheduler, or
//! abort the run by returning an error (see [`Deadline`]). The stage
//! kernels themselves never know whether they are being chunked.

use std::fmt;
use std::ops::Range;
use std::time::Duration;

use serde::{Deserialize, Serialize};
use web_time::Instant;

use crate::types::StickerError;

/// The pipeline stage a [`Progress`] report belongs to.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum StageKind {
    /// Resampling the source mask to the image resolution.
    Resample,
    /// Box-blurring the mask.
    Smooth,
    /// Dilating the mask by the border radius.
    Expand,
    /// Writing alpha and border colors into the pixels.
    Composite,
}

impl fmt::Display for StageKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Resample => write!(f, "resample"),
            Self::Smooth => write!(f, "smooth"),
            Self::Expand => write!(f, "expand"),
            Self::Composite => write!(f, "composite"),
        }
    }
}

/// Progress of one stage, reported after each completed chunk.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct Progress {
    pub stage: StageKind,
    /// Rows finished so far (exclusive upper bound of the last chunk).
    pub rows_done: usize,
    pub rows_total: usize,
}

impl Progress {
    /// Completed fraction in `[0, 1]`.
    #[must_use]
    pub fn fraction(&self) -> f64 {
        if self.rows_total == 0 {
            return 1.0;
        }
        #[allow(clippy::cast_precision_loss)]
        let fraction = self.rows_done as f64 / self.rows_total as f64;
        fraction
    }
}

/// A yield point between chunks of rows.
///
/// Returning an error aborts the running stage; the error reaches the
/// caller unchanged.
pub trait Checkpoint {
    /// Called on the driving thread after each chunk completes.
    ///
    /// # Errors
    ///
    /// Any error stops the stage and is propagated to the caller.
    fn reached(&mut self, progress: Progress) -> Result<(), StickerError>;
}

/// A checkpoint that never interrupts.
#[derive(Debug, Clone, Copy, Default)]
pub struct NoCheckpoint;

impl Checkpoint for NoCheckpoint {
    fn reached(&mut self, _progress: Progress) -> Result<(), StickerError> {
        Ok(())
    }
}

impl<F> Checkpoint for F
where
    F: FnMut(Progress) -> Result<(), StickerError>,
{
    fn reached(&mut self, progress: Progress) -> Result<(), StickerError> {
        self(progress)
    }
}

/// Enforces an overall time budget, then forwards to an inner checkpoint.
///
/// The budget is measured from construction. Work already running is
/// not interrupted; the next checkpoint after the budget is spent
/// returns [`StickerError::Timeout`].
pub struct Deadline<'a> {
    started: Instant,
    budget: Option<Duration>,
    inner: &'a mut dyn Checkpoint,
}

impl<'a> Deadline<'a> {
    /// Start the clock. `None` means no budget.
    pub fn new(budget: Option<Duration>, inner: &'a mut dyn Checkpoint) -> Self {
        Self {
            started: Instant::now(),
            budget,
            inner,
        }
    }

    /// Fail if the budget has been used up.
    ///
    /// # Errors
    ///
    /// Returns [`StickerError::Timeout`] once the elapsed time reaches
    /// the budget.
    pub fn check(&self) -> Result<(), StickerError> {
        match self.budget {
            Some(budget) if self.started.elapsed() >= budget => {
                Err(StickerError::Timeout { budget })
            }
            _ => Ok(()),
        }
    }

    /// Time since the deadline was created.
    #[must_use]
    pub fn elapsed(&self) -> Duration {
        self.started.elapsed()
    }
}

impl Checkpoint for Deadline<'_> {
    fn reached(&mut self, progress: Progress) -> Result<(), StickerError> {
        self.check()?;
        self.inner.reached(progress)
    }
}

/// Run `body` over `0..rows_total` in blocks of at most `chunk_rows`
/// rows, calling `checkpoint` after each block.
///
/// A `chunk_rows` of zero is treated as one.
///
/// # Errors
///
/// Stops at the first error from `body` or `checkpoint` and returns it.
pub fn for_each_chunk<F>(
    rows_total: usize,
    chunk_rows: usize,
    stage: StageKind,
    checkpoint: &mut dyn Checkpoint,
    mut body: F,
) -> Result<(), StickerError>
where
    F: FnMut(Range<usize>) -> Result<(), StickerError>,
{
    let step = chunk_rows.max(1);
    let mut start = 0;
    while start < rows_total {
        let end = start.saturating_add(step).min(rows_total);
        body(start..end)?;
        checkpoint.reached(Progress {
            stage,
            rows_done: end,
            rows_total,
        })?;
        start = end;
    }
    Ok(())
}
