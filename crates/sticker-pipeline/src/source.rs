//! Mask sources: where the foreground probability mask comes from.
//!
//! Segmentation is out of scope for this crate; a [`MaskSource`] is the
//! seam where a model (or anything else) plugs in. The mask may have
//! any resolution. The coordinator resamples it to the image.

use std::error::Error;

use image::{DynamicImage, GrayImage, RgbaImage};

use crate::buffer::check_mask;
use crate::cache::Fingerprint;
use crate::codec;
use crate::types::{Dimensions, StickerError};

/// Error type returned by mask sources.
pub type MaskSourceError = Box<dyn Error + Send + Sync>;

/// A foreground probability mask at the source's own resolution.
#[derive(Debug, Clone, PartialEq)]
pub struct SourceMask {
    dimensions: Dimensions,
    values: Vec<f64>,
}

impl SourceMask {
    /// Wrap mask values, checking that there is one per pixel.
    ///
    /// # Errors
    ///
    /// Returns [`StickerError::InvalidParameters`] if `values.len()`
    /// does not equal `width * height` or a side is zero.
    pub fn new(dimensions: Dimensions, values: Vec<f64>) -> Result<Self, StickerError> {
        check_mask(&values, dimensions)?;
        Ok(Self { dimensions, values })
    }

    #[must_use]
    pub const fn dimensions(&self) -> Dimensions {
        self.dimensions
    }

    #[must_use]
    pub fn values(&self) -> &[f64] {
        &self.values
    }

    #[must_use]
    pub fn into_values(self) -> Vec<f64> {
        self.values
    }
}

/// Produces a foreground mask for an image.
///
/// Implementations must be deterministic for a given [`name`](Self::name)
/// and input, because results are cached under that name.
pub trait MaskSource: Send + Sync {
    /// Stable identifier for this source, used as part of cache keys and
    /// in error messages.
    fn name(&self) -> &str;

    /// Compute the mask for `image`.
    ///
    /// # Errors
    ///
    /// Any failure. The coordinator reports it as
    /// [`StickerError::UpstreamMaskFailure`] and does not retry.
    fn segment(&self, image: &RgbaImage) -> Result<SourceMask, MaskSourceError>;
}

/// A matte image produced by an external segmenter: luminance / 255 is
/// the foreground probability.
#[derive(Debug, Clone)]
pub struct MatteImage {
    name: String,
    mask: SourceMask,
}

impl MatteImage {
    /// Decode a PNG or JPEG matte.
    ///
    /// # Errors
    ///
    /// Returns the [`codec::decode_rgba`] errors.
    pub fn from_bytes(bytes: &[u8]) -> Result<Self, StickerError> {
        let format = codec::sniff(bytes)?;
        let gray = image::load_from_memory_with_format(bytes, format)?.into_luma8();
        Self::from_gray(&gray, Fingerprint::of(bytes))
    }

    /// Use an already decoded image as the matte.
    ///
    /// # Errors
    ///
    /// Returns [`StickerError::InvalidParameters`] for an empty image.
    pub fn from_image(image: &DynamicImage) -> Result<Self, StickerError> {
        let gray = image.to_luma8();
        Self::from_gray(&gray, Fingerprint::of(gray.as_raw()))
    }

    fn from_gray(gray: &GrayImage, fingerprint: Fingerprint) -> Result<Self, StickerError> {
        let dimensions = Dimensions::new(gray.width(), gray.height());
        let values = gray.as_raw().iter().map(|&v| f64::from(v) / 255.0).collect();
        Ok(Self {
            name: format!("matte:{fingerprint}"),
            mask: SourceMask::new(dimensions, values)?,
        })
    }
}

impl MaskSource for MatteImage {
    fn name(&self) -> &str {
        &self.name
    }

    fn segment(&self, _image: &RgbaImage) -> Result<SourceMask, MaskSourceError> {
        Ok(self.mask.clone())
    }
}

/// A mask computed ahead of time, returned as-is for any image.
#[derive(Debug, Clone)]
pub struct PrecomputedMask {
    name: String,
    mask: SourceMask,
}

impl PrecomputedMask {
    #[must_use]
    pub fn new(mask: SourceMask) -> Self {
        let bytes: Vec<u8> = mask.values().iter().flat_map(|v| v.to_le_bytes()).collect();
        let fingerprint = Fingerprint::of(&bytes);
        Self {
            name: format!("precomputed:{}:{fingerprint}", mask.dimensions()),
            mask,
        }
    }
}

impl MaskSource for PrecomputedMask {
    fn name(&self) -> &str {
        &self.name
    }

    fn segment(&self, _image: &RgbaImage) -> Result<SourceMask, MaskSourceError> {
        Ok(self.mask.clone())
    }
}

#[cfg(test)]
#[allow(clippy::unwrap_used)]
mod tests {
    use super::*;

    fn gray_png(width: u32, height: u32, f: impl Fn(u32, u32) -> u8) -> Vec<u8> {
        let gray = GrayImage::from_fn(width, height, |x, y| image::Luma([f(x, y)]));
        let mut buf = Vec::new();
        image::ImageEncoder::write_image(
            image::codecs::png::PngEncoder::new(&mut buf),
            gray.as_raw(),
            width,
            height,
            image::ExtendedColorType::L8,
        )
        .unwrap();
        buf
    }

    #[test]
    fn source_mask_checks_length() {
        assert!(SourceMask::new(Dimensions::new(2, 2), vec![0.0; 4]).is_ok());
        assert!(matches!(
            SourceMask::new(Dimensions::new(2, 2), vec![0.0; 3]),
            Err(StickerError::InvalidParameters(_))
        ));
    }

    #[test]
    fn matte_luminance_becomes_probability() {
        let bytes = gray_png(3, 1, |x, _| [0, 51, 255][x as usize]);
        let matte = MatteImage::from_bytes(&bytes).unwrap();
        let mask = matte.segment(&RgbaImage::new(1, 1)).unwrap();
        assert_eq!(mask.dimensions(), Dimensions::new(3, 1));
        let expected = [0.0, 0.2, 1.0];
        for (got, want) in mask.values().iter().zip(expected) {
            assert!((got - want).abs() < 1e-12);
        }
    }

    #[test]
    fn matte_name_depends_on_content() {
        let a = MatteImage::from_bytes(&gray_png(2, 2, |_, _| 0)).unwrap();
        let b = MatteImage::from_bytes(&gray_png(2, 2, |_, _| 255)).unwrap();
        let a_again = MatteImage::from_bytes(&gray_png(2, 2, |_, _| 0)).unwrap();
        assert_ne!(a.name(), b.name());
        assert_eq!(a.name(), a_again.name());
        assert!(a.name().starts_with("matte:"));
    }

    #[test]
    fn matte_rejects_garbage() {
        assert!(matches!(
            MatteImage::from_bytes(b"not an image"),
            Err(StickerError::UnrecognizedFormat)
        ));
        assert!(matches!(
            MatteImage::from_bytes(&[]),
            Err(StickerError::EmptyInput)
        ));
    }

    #[test]
    fn matte_from_rgba_image_uses_luma() {
        let rgba = DynamicImage::ImageRgba8(RgbaImage::from_pixel(2, 1, image::Rgba([255, 255, 255, 255])));
        let matte = MatteImage::from_image(&rgba).unwrap();
        let mask = matte.segment(&RgbaImage::new(1, 1)).unwrap();
        assert!(mask.values().iter().all(|v| (v - 1.0).abs() < 1e-12));
    }

    #[test]
    fn precomputed_returns_its_mask() {
        let mask = SourceMask::new(Dimensions::new(1, 2), vec![0.25, 0.75]).unwrap();
        let source = PrecomputedMask::new(mask.clone());
        assert_eq!(source.segment(&RgbaImage::new(9, 9)).unwrap(), mask);
        assert!(source.name().starts_with("precomputed:1x2:"));
    }

    #[test]
    fn precomputed_names_differ_by_values() {
        let a = PrecomputedMask::new(SourceMask::new(Dimensions::new(1, 1), vec![0.0]).unwrap());
        let b = PrecomputedMask::new(SourceMask::new(Dimensions::new(1, 1), vec![1.0]).unwrap());
        assert_ne!(a.name(), b.name());
    }
}
