//! Interchangeable implementations of the three mask stages.
//!
//! Both backends produce identical results (they share the per-row
//! kernels); they differ only in how rows are scheduled. The
//! [`StickerPipeline`](crate::StickerPipeline) picks one with
//! [`select_backend`] and keeps a [`PortableBackend`] as fallback.

mod native;
mod portable;

use std::fmt;
use std::str::FromStr;

use serde::{Deserialize, Serialize};
use tracing::{info, warn};

pub use native::NativeBackend;
pub use portable::PortableBackend;

use crate::chunk::Checkpoint;
use crate::composite::BandCounts;
use crate::types::{BorderColor, Dimensions, StickerError};

/// Which implementation ran a stage.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum BackendKind {
    /// Multi-threaded on a dedicated `rayon` pool.
    Native,
    /// Sequential loops on the calling thread.
    Portable,
}

impl fmt::Display for BackendKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Native => write!(f, "native"),
            Self::Portable => write!(f, "portable"),
        }
    }
}

/// Which backend to try first.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum BackendPreference {
    /// Native when the platform supports it, portable otherwise.
    #[default]
    Auto,
    /// Always portable.
    Portable,
}

impl fmt::Display for BackendPreference {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Auto => write!(f, "auto"),
            Self::Portable => write!(f, "portable"),
        }
    }
}

impl FromStr for BackendPreference {
    type Err = StickerError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.to_ascii_lowercase().as_str() {
            "auto" => Ok(Self::Auto),
            "portable" => Ok(Self::Portable),
            other => Err(StickerError::InvalidOptions(format!(
                "unknown backend {other:?} (expected \"auto\" or \"portable\")"
            ))),
        }
    }
}

/// One implementation of the smooth / expand / composite stages.
///
/// Implementations report to `checkpoint` between chunks of rows and
/// return [`StickerError::BackendUnavailable`] when they cannot run at
/// all, which is the only error the coordinator retries elsewhere.
pub trait MaskBackend: Send + Sync {
    fn kind(&self) -> BackendKind;

    /// Box-blur `mask` (see [`smooth`](crate::smooth::smooth)).
    ///
    /// # Errors
    ///
    /// `InvalidParameters`, `ResourceExhaustion`, `BackendUnavailable`,
    /// or whatever `checkpoint` returns.
    fn smooth(
        &self,
        mask: &[f64],
        dims: Dimensions,
        kernel_size: u32,
        checkpoint: &mut dyn Checkpoint,
    ) -> Result<Vec<f64>, StickerError>;

    /// Disc-dilate `mask` (see [`expand`](crate::expand::expand)).
    ///
    /// # Errors
    ///
    /// As [`smooth`](Self::smooth).
    fn expand(
        &self,
        mask: &[f64],
        dims: Dimensions,
        border_width: u32,
        checkpoint: &mut dyn Checkpoint,
    ) -> Result<Vec<f64>, StickerError>;

    /// Composite in place (see [`composite`](crate::composite::composite)).
    ///
    /// Must leave `pixels` in a state from which running the same call
    /// again yields the complete result.
    ///
    /// # Errors
    ///
    /// As [`smooth`](Self::smooth).
    fn composite(
        &self,
        pixels: &mut [u8],
        smoothed: &[f64],
        expanded: Option<&[f64]>,
        dims: Dimensions,
        border: Option<BorderColor>,
        checkpoint: &mut dyn Checkpoint,
    ) -> Result<BandCounts, StickerError>;
}

/// Probe the platform once and build the preferred backend.
///
/// Falls back to [`PortableBackend`] when portable is requested, when
/// the hardware parallelism is unknown or below two, or when the thread
/// pool cannot be built.
#[must_use]
pub fn select_backend(preference: BackendPreference, chunk_rows: usize) -> Box<dyn MaskBackend> {
    let portable = || -> Box<dyn MaskBackend> { Box::new(PortableBackend::new(chunk_rows)) };

    if preference == BackendPreference::Portable {
        info!(backend = %BackendKind::Portable, "backend requested by configuration");
        return portable();
    }

    let threads = match std::thread::available_parallelism() {
        Ok(n) => n.get(),
        Err(e) => {
            info!(error = %e, "hardware parallelism unknown, using portable backend");
            return portable();
        }
    };
    if threads < 2 {
        info!(threads, "single hardware thread, using portable backend");
        return portable();
    }

    match NativeBackend::new(threads, chunk_rows) {
        Ok(native) => {
            info!(backend = %BackendKind::Native, threads, "backend selected");
            Box::new(native)
        }
        Err(e) => {
            warn!(error = %e, "native backend unavailable, using portable backend");
            portable()
        }
    }
}

#[cfg(test)]
#[allow(clippy::unwrap_used)]
mod tests {
    use super::*;

    #[test]
    fn portable_preference_is_honoured() {
        let backend = select_backend(BackendPreference::Portable, 16);
        assert_eq!(backend.kind(), BackendKind::Portable);
    }

    #[test]
    fn auto_matches_hardware() {
        let backend = select_backend(BackendPreference::Auto, 16);
        let threads = std::thread::available_parallelism().map_or(1, std::num::NonZero::get);
        let expected = if threads >= 2 {
            BackendKind::Native
        } else {
            BackendKind::Portable
        };
        assert_eq!(backend.kind(), expected);
    }

    #[test]
    fn preference_from_str() {
        assert_eq!("auto".parse::<BackendPreference>().unwrap(), BackendPreference::Auto);
        assert_eq!(
            "Portable".parse::<BackendPreference>().unwrap(),
            BackendPreference::Portable
        );
        assert!("gpu".parse::<BackendPreference>().is_err());
    }

    #[test]
    fn kind_serializes_lowercase() {
        assert_eq!(serde_json::to_string(&BackendKind::Native).unwrap(), "\"native\"");
        assert_eq!(BackendKind::Portable.to_string(), "portable");
    }
}
