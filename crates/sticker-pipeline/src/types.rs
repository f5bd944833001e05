//! Shared types for the sticker pipeline.

use std::fmt;
use std::str::FromStr;
use std::time::Duration;

use serde::{Deserialize, Serialize};

use crate::backend::BackendPreference;

/// Re-export `RgbaImage` so downstream crates can hold decoded images
/// without depending on `image` directly.
pub use image::RgbaImage;

/// Mask value above which a pixel counts as foreground for expansion
/// and as border inside the expanded mask.
pub const THRESHOLD: f64 = 0.5;

/// Mask value above which a pixel is confidently foreground.
pub const THRESHOLD_HIGH: f64 = 0.55;

/// Mask value below which a pixel is background or border.
pub const THRESHOLD_LOW: f64 = 0.45;

/// Width of the linear alpha ramp between [`THRESHOLD_LOW`] and
/// [`THRESHOLD_HIGH`].
pub const THRESHOLD_RANGE: f64 = 0.10;

/// Image dimensions in pixels.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct Dimensions {
    /// Width in pixels.
    pub width: u32,
    /// Height in pixels.
    pub height: u32,
}

impl Dimensions {
    /// Create new dimensions. Zero sizes are representable here and
    /// rejected by [`pixel_count`](Self::pixel_count).
    #[must_use]
    pub const fn new(width: u32, height: u32) -> Self {
        Self { width, height }
    }

    /// Number of pixels, `width * height`.
    ///
    /// # Errors
    ///
    /// Returns [`StickerError::InvalidParameters`] if either side is zero
    /// or the product does not fit in `usize`.
    pub fn pixel_count(self) -> Result<usize, StickerError> {
        if self.width == 0 || self.height == 0 {
            return Err(StickerError::InvalidParameters(format!(
                "dimensions must be positive, got {self}"
            )));
        }
        let (w, h) = self.as_usize();
        w.checked_mul(h).ok_or_else(|| {
            StickerError::InvalidParameters(format!("dimensions {self} overflow the address space"))
        })
    }

    /// Length of an interleaved RGBA8 buffer with these dimensions.
    ///
    /// # Errors
    ///
    /// Same conditions as [`pixel_count`](Self::pixel_count).
    pub fn rgba_len(self) -> Result<usize, StickerError> {
        self.pixel_count()?.checked_mul(4).ok_or_else(|| {
            StickerError::InvalidParameters(format!("dimensions {self} overflow the address space"))
        })
    }

    /// Width and height as `usize` for indexing.
    #[must_use]
    pub const fn as_usize(self) -> (usize, usize) {
        (self.width as usize, self.height as usize)
    }
}

impl fmt::Display for Dimensions {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}x{}", self.width, self.height)
    }
}

/// Solid RGB color painted into the border band. Border pixels are
/// always fully opaque, so there is no alpha component.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct BorderColor {
    pub r: u8,
    pub g: u8,
    pub b: u8,
}

impl BorderColor {
    pub const WHITE: Self = Self::new(255, 255, 255);

    #[must_use]
    pub const fn new(r: u8, g: u8, b: u8) -> Self {
        Self { r, g, b }
    }

    /// Parse a `#RRGGBB` or `RRGGBB` hex string (case-insensitive).
    ///
    /// # Errors
    ///
    /// Returns [`StickerError::InvalidOptions`] unless the input is
    /// exactly six hex digits, optionally preceded by `#`.
    pub fn parse(input: &str) -> Result<Self, StickerError> {
        let digits = input.strip_prefix('#').unwrap_or(input);
        if digits.len() != 6 || !digits.bytes().all(|b| b.is_ascii_hexdigit()) {
            return Err(StickerError::InvalidOptions(format!(
                "border color must be 6 hex digits like #RRGGBB, got {input:?}"
            )));
        }
        let channel = |range: std::ops::Range<usize>| {
            u8::from_str_radix(&digits[range], 16).map_err(|e| {
                StickerError::InvalidOptions(format!("invalid border color {input:?}: {e}"))
            })
        };
        Ok(Self::new(channel(0..2)?, channel(2..4)?, channel(4..6)?))
    }
}

impl FromStr for BorderColor {
    type Err = StickerError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        Self::parse(s)
    }
}

impl fmt::Display for BorderColor {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "#{:02X}{:02X}{:02X}", self.r, self.g, self.b)
    }
}

/// Caller-facing sticker options, as received at the boundary.
///
/// Mirrors the options object of the public `makeSticker` surface:
/// the color is still a string and the width still a float. Call
/// [`validate`](Self::validate) to obtain [`StickerParams`].
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default, rename_all = "camelCase")]
pub struct StickerOptions {
    /// Whether to paint a border band around the subject.
    pub add_border: bool,
    /// Border color as `#RRGGBB` (leading `#` optional).
    pub border_color: String,
    /// Border width in pixels, within `[0, 50]`.
    pub border_width: f64,
}

impl StickerOptions {
    pub const DEFAULT_ADD_BORDER: bool = true;
    pub const DEFAULT_BORDER_COLOR: &'static str = "#FFFFFF";
    pub const DEFAULT_BORDER_WIDTH: f64 = 12.0;
    pub const MAX_BORDER_WIDTH: f64 = 50.0;

    /// Check the options and convert them to pipeline parameters.
    ///
    /// The border width is rounded to the nearest whole pixel after the
    /// range check.
    ///
    /// # Errors
    ///
    /// Returns [`StickerError::InvalidOptions`] if the color is not six
    /// hex digits or the width is outside `[0, 50]` (or not finite).
    pub fn validate(&self) -> Result<StickerParams, StickerError> {
        let border_color = BorderColor::parse(&self.border_color)?;
        if !(0.0..=Self::MAX_BORDER_WIDTH).contains(&self.border_width) {
            return Err(StickerError::InvalidOptions(format!(
                "border width must be within [0, {}], got {}",
                Self::MAX_BORDER_WIDTH,
                self.border_width
            )));
        }
        // Range-checked above, so the rounded value fits.
        #[allow(clippy::cast_possible_truncation, clippy::cast_sign_loss)]
        let border_width = self.border_width.round() as u32;
        Ok(StickerParams {
            add_border: self.add_border,
            border_color,
            border_width,
        })
    }
}

impl Default for StickerOptions {
    fn default() -> Self {
        Self {
            add_border: Self::DEFAULT_ADD_BORDER,
            border_color: Self::DEFAULT_BORDER_COLOR.to_string(),
            border_width: Self::DEFAULT_BORDER_WIDTH,
        }
    }
}

/// Validated sticker parameters consumed by the core pipeline.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct StickerParams {
    pub add_border: bool,
    pub border_color: BorderColor,
    /// Border radius in pixels. `0` disables expansion.
    pub border_width: u32,
}

impl StickerParams {
    /// The border color when a border is requested, `None` otherwise.
    #[must_use]
    pub const fn border(&self) -> Option<BorderColor> {
        if self.add_border {
            Some(self.border_color)
        } else {
            None
        }
    }

    /// Whether the expansion stage has to run.
    #[must_use]
    pub const fn needs_expansion(&self) -> bool {
        self.add_border && self.border_width > 0
    }
}

impl Default for StickerParams {
    fn default() -> Self {
        Self {
            add_border: StickerOptions::DEFAULT_ADD_BORDER,
            border_color: BorderColor::WHITE,
            border_width: 12,
        }
    }
}

/// Configuration of the pipeline coordinator itself (as opposed to the
/// per-sticker [`StickerOptions`]).
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct PipelineConfig {
    /// Box-blur kernel size for mask smoothing. Must be odd.
    pub smoothing_kernel: u32,

    /// Which backend to try first.
    pub backend: BackendPreference,

    /// Rows processed between checkpoints. Smaller values give the
    /// caller more frequent chances to yield or time out.
    pub chunk_rows: u32,

    /// Overall time budget per invocation. `None` means unbounded.
    #[serde(with = "optional_duration_serde")]
    pub timeout: Option<Duration>,

    /// Entries kept per cache. `0` disables caching.
    pub cache_capacity: usize,
}

impl PipelineConfig {
    pub const DEFAULT_SMOOTHING_KERNEL: u32 = 3;
    pub const DEFAULT_CHUNK_ROWS: u32 = 64;
    pub const DEFAULT_CACHE_CAPACITY: usize = 8;

    /// Check invariants that the stages themselves do not enforce.
    ///
    /// # Errors
    ///
    /// Returns [`StickerError::InvalidOptions`] for an even smoothing
    /// kernel or a zero `chunk_rows`.
    pub fn validate(&self) -> Result<(), StickerError> {
        if self.smoothing_kernel % 2 == 0 {
            return Err(StickerError::InvalidOptions(format!(
                "smoothing kernel must be odd, got {}",
                self.smoothing_kernel
            )));
        }
        if self.chunk_rows == 0 {
            return Err(StickerError::InvalidOptions(
                "chunk_rows must be at least 1".to_string(),
            ));
        }
        Ok(())
    }
}

impl Default for PipelineConfig {
    fn default() -> Self {
        Self {
            smoothing_kernel: Self::DEFAULT_SMOOTHING_KERNEL,
            backend: BackendPreference::default(),
            chunk_rows: Self::DEFAULT_CHUNK_ROWS,
            timeout: None,
            cache_capacity: Self::DEFAULT_CACHE_CAPACITY,
        }
    }
}

/// Serde support for `std::time::Duration` as fractional seconds.
pub(crate) mod duration_serde {
    use std::time::Duration;

    use serde::{Deserialize, Deserializer, Serialize, Serializer};

    /// Serialize a `Duration` as fractional seconds (`f64`).
    pub fn serialize<S: Serializer>(duration: &Duration, serializer: S) -> Result<S::Ok, S::Error> {
        duration.as_secs_f64().serialize(serializer)
    }

    /// Deserialize a `Duration` from fractional seconds (`f64`).
    pub fn deserialize<'de, D: Deserializer<'de>>(deserializer: D) -> Result<Duration, D::Error> {
        let secs = f64::deserialize(deserializer)?;
        Duration::try_from_secs_f64(secs).map_err(|_| {
            serde::de::Error::custom(
                "duration seconds must be finite, non-negative, and representable as a Duration",
            )
        })
    }
}

/// Same as [`duration_serde`] for `Option<Duration>` (`null` for `None`).
pub(crate) mod optional_duration_serde {
    use std::time::Duration;

    use serde::{Deserialize, Deserializer, Serialize, Serializer};

    pub fn serialize<S: Serializer>(
        duration: &Option<Duration>,
        serializer: S,
    ) -> Result<S::Ok, S::Error> {
        duration.map(|d| d.as_secs_f64()).serialize(serializer)
    }

    pub fn deserialize<'de, D: Deserializer<'de>>(
        deserializer: D,
    ) -> Result<Option<Duration>, D::Error> {
        Option::<f64>::deserialize(deserializer)?
            .map(|secs| {
                Duration::try_from_secs_f64(secs).map_err(|_| {
                    serde::de::Error::custom(
                        "timeout seconds must be finite, non-negative, and representable as a Duration",
                    )
                })
            })
            .transpose()
    }
}

/// Coarse classification of [`StickerError`] for callers that need to
/// branch on the failure class rather than the message.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum ErrorKind {
    /// Malformed input bytes or options rejected at the boundary.
    InvalidInput,
    /// Malformed buffers or geometry inside the core.
    InvalidParameters,
    /// An intermediate buffer could not be allocated.
    ResourceExhaustion,
    /// Neither backend could run the operation.
    BackendUnavailable,
    /// The caller's time budget ran out.
    Timeout,
    /// The mask source failed.
    UpstreamMaskFailure,
    /// The finished sticker could not be encoded.
    Encode,
}

/// Errors that can occur while producing a sticker.
///
/// Serializable so it can cross the worker boundary as JSON. Decode
/// and encode failures keep only the `image` crate's message.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error, Serialize, Deserialize)]
pub enum StickerError {
    /// The input image bytes were empty.
    #[error("input image data is empty")]
    EmptyInput,

    /// The input bytes carry neither a PNG nor a JPEG signature.
    #[error("input is not a PNG or JPEG image")]
    UnrecognizedFormat,

    /// The image had a valid signature but failed to decode.
    #[error("failed to decode image: {0}")]
    ImageDecode(String),

    /// PNG encoding of the result failed.
    #[error("failed to encode PNG: {0}")]
    ImageEncode(String),

    /// Caller options failed boundary validation.
    #[error("invalid sticker options: {0}")]
    InvalidOptions(String),

    /// Buffer sizes or geometry passed to a stage are inconsistent.
    #[error("invalid parameters: {0}")]
    InvalidParameters(String),

    /// Allocating an intermediate buffer failed.
    #[error("failed to allocate {bytes} bytes for an intermediate buffer")]
    ResourceExhaustion { bytes: usize },

    /// A backend could not be initialised or failed while running.
    #[error("processing backend unavailable: {0}")]
    BackendUnavailable(String),

    /// The invocation exceeded its time budget.
    #[error("processing exceeded the {}ms time budget", .budget.as_millis())]
    Timeout {
        #[serde(with = "duration_serde")]
        budget: Duration,
    },

    /// The mask source failed to produce a mask.
    #[error("mask source failed: {0}")]
    UpstreamMaskFailure(String),
}

impl StickerError {
    /// The failure class of this error.
    #[must_use]
    pub const fn kind(&self) -> ErrorKind {
        match self {
            Self::EmptyInput
            | Self::UnrecognizedFormat
            | Self::ImageDecode(_)
            | Self::InvalidOptions(_) => ErrorKind::InvalidInput,
            Self::InvalidParameters(_) => ErrorKind::InvalidParameters,
            Self::ResourceExhaustion { .. } => ErrorKind::ResourceExhaustion,
            Self::BackendUnavailable(_) => ErrorKind::BackendUnavailable,
            Self::Timeout { .. } => ErrorKind::Timeout,
            Self::UpstreamMaskFailure(_) => ErrorKind::UpstreamMaskFailure,
            Self::ImageEncode(_) => ErrorKind::Encode,
        }
    }
}

impl From<image::ImageError> for StickerError {
    fn from(err: image::ImageError) -> Self {
        Self::ImageDecode(err.to_string())
    }
}
