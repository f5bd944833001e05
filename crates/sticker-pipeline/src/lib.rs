//! sticker-pipeline: Turns a photo and a foreground mask into a sticker.
//!
//! The mask from an upstream segmenter is post-processed through:
//! resample -> box blur -> disc dilation (border) -> band compositing,
//! and the result is encoded as a PNG with an alpha channel.
//!
//! This crate has **no I/O dependencies**. It operates on in-memory
//! byte slices and buffers; reading files or talking to a browser
//! lives in `sticker-bench` and `sticker-worker`.
//!
//! Two backends run the mask stages: a multi-threaded [`NativeBackend`]
//! and a sequential [`PortableBackend`]. Both produce identical output.
//! [`StickerPipeline`] picks one at construction and retries a stage on
//! the portable backend if the native one becomes unavailable.

pub mod backend;
mod buffer;
pub mod cache;
pub mod chunk;
pub mod codec;
pub mod composite;
pub mod diagnostics;
pub mod expand;
pub mod pipeline;
pub mod resample;
pub mod smooth;
pub mod source;
pub mod types;

pub use backend::{BackendKind, BackendPreference, MaskBackend, NativeBackend, PortableBackend};
pub use cache::{Fingerprint, StickerCache};
pub use chunk::{Checkpoint, Deadline, NoCheckpoint, Progress, StageKind};
pub use composite::{Band, BandCounts};
pub use diagnostics::StickerDiagnostics;
pub use pipeline::{StickerOutput, StickerPipeline, make_sticker};
pub use source::{MaskSource, MaskSourceError, MatteImage, PrecomputedMask, SourceMask};
pub use types::{
    BorderColor, Dimensions, ErrorKind, PipelineConfig, StickerError, StickerOptions,
    StickerParams,
};
