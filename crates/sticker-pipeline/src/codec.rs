//! Compressed image boundary: signature sniffing, decode, PNG encode.
//!
//! The core only sees raw RGBA8 buffers. Everything that touches
//! compressed bytes happens here, before the first stage or after the
//! last one.

use image::codecs::png::PngEncoder;
use image::{ExtendedColorType, ImageEncoder, ImageFormat, RgbaImage};

use crate::buffer::check_pixels;
use crate::types::{Dimensions, StickerError};

/// PNG file signature.
const PNG_SIGNATURE: [u8; 8] = [0x89, b'P', b'N', b'G', 0x0D, 0x0A, 0x1A, 0x0A];

/// JPEG SOI marker followed by the first marker prefix.
const JPEG_SIGNATURE: [u8; 3] = [0xFF, 0xD8, 0xFF];

/// Identify the container format from its leading bytes.
///
/// # Errors
///
/// Returns [`StickerError::EmptyInput`] if `bytes` is empty and
/// [`StickerError::UnrecognizedFormat`] if it starts with neither the
/// PNG nor the JPEG signature.
pub fn sniff(bytes: &[u8]) -> Result<ImageFormat, StickerError> {
    if bytes.is_empty() {
        return Err(StickerError::EmptyInput);
    }
    if bytes.starts_with(&PNG_SIGNATURE) {
        Ok(ImageFormat::Png)
    } else if bytes.starts_with(&JPEG_SIGNATURE) {
        Ok(ImageFormat::Jpeg)
    } else {
        Err(StickerError::UnrecognizedFormat)
    }
}

/// Decode PNG or JPEG bytes into an RGBA8 image.
///
/// # Errors
///
/// Returns the [`sniff`] errors for unrecognised input and
/// [`StickerError::ImageDecode`] if the data is corrupt.
#[must_use = "returns the decoded image"]
pub fn decode_rgba(bytes: &[u8]) -> Result<RgbaImage, StickerError> {
    let format = sniff(bytes)?;
    let img = image::load_from_memory_with_format(bytes, format)?;
    Ok(img.into_rgba8())
}

/// Encode an RGBA8 buffer as PNG.
///
/// # Errors
///
/// Returns [`StickerError::InvalidParameters`] if the buffer does not
/// match `dims`, and [`StickerError::ImageEncode`] if encoding fails.
pub fn encode_png(pixels: &[u8], dims: Dimensions) -> Result<Vec<u8>, StickerError> {
    check_pixels(pixels, dims)?;
    let mut buf = Vec::new();
    PngEncoder::new(&mut buf)
        .write_image(pixels, dims.width, dims.height, ExtendedColorType::Rgba8)
        .map_err(|e| StickerError::ImageEncode(e.to_string()))?;
    Ok(buf)
}
