//! Buffer validation, fallible allocation, and pooled scratch space.

use std::ops::{Deref, DerefMut};

use parking_lot::Mutex;

use crate::types::{Dimensions, StickerError};

/// Allocate `len` copies of `value` without aborting on OOM.
///
/// # Errors
///
/// Returns [`StickerError::ResourceExhaustion`] if the reservation fails.
pub(crate) fn try_filled<T: Clone>(len: usize, value: T) -> Result<Vec<T>, StickerError> {
    let mut buf = Vec::new();
    reserve(&mut buf, len)?;
    buf.resize(len, value);
    Ok(buf)
}

/// Copy `src` into a freshly reserved vector.
///
/// # Errors
///
/// Returns [`StickerError::ResourceExhaustion`] if the reservation fails.
pub(crate) fn try_copy<T: Copy>(src: &[T]) -> Result<Vec<T>, StickerError> {
    let mut buf = Vec::new();
    reserve(&mut buf, src.len())?;
    buf.extend_from_slice(src);
    Ok(buf)
}

fn reserve<T>(buf: &mut Vec<T>, len: usize) -> Result<(), StickerError> {
    buf.try_reserve_exact(len)
        .map_err(|_| StickerError::ResourceExhaustion {
            bytes: len.saturating_mul(size_of::<T>()),
        })
}

/// Check that a mask holds exactly one value per pixel.
///
/// Returns the pixel count on success.
pub(crate) fn check_mask(mask: &[f64], dims: Dimensions) -> Result<usize, StickerError> {
    let expected = dims.pixel_count()?;
    if mask.len() != expected {
        return Err(StickerError::InvalidParameters(format!(
            "mask has {} values, expected {expected} for {dims}",
            mask.len()
        )));
    }
    Ok(expected)
}

/// Check that an RGBA buffer holds exactly four bytes per pixel.
///
/// Returns the pixel count on success.
pub(crate) fn check_pixels(pixels: &[u8], dims: Dimensions) -> Result<usize, StickerError> {
    let expected = dims.rgba_len()?;
    if pixels.len() != expected {
        return Err(StickerError::InvalidParameters(format!(
            "pixel buffer has {} bytes, expected {expected} for {dims} RGBA",
            pixels.len()
        )));
    }
    Ok(expected / 4)
}

/// A small pool of reusable scratch vectors.
///
/// Leases hand their buffer back when dropped, whichever way the
/// borrowing scope is left. At most `max_retained` idle buffers are
/// kept; extra ones are freed.
#[derive(Debug)]
pub(crate) struct ScratchPool<T> {
    idle: Mutex<Vec<Vec<T>>>,
    max_retained: usize,
}

impl<T: Clone + Default> ScratchPool<T> {
    pub(crate) fn new(max_retained: usize) -> Self {
        Self {
            idle: Mutex::new(Vec::new()),
            max_retained,
        }
    }

    /// Borrow a buffer of exactly `len` default-initialised elements.
    ///
    /// # Errors
    ///
    /// Returns [`StickerError::ResourceExhaustion`] if growing the
    /// buffer fails.
    pub(crate) fn lease(&self, len: usize) -> Result<ScratchLease<'_, T>, StickerError> {
        let reused = self.idle.lock().pop();
        let buf = match reused {
            Some(mut buf) => {
                buf.clear();
                reserve(&mut buf, len)?;
                buf.resize(len, T::default());
                buf
            }
            None => try_filled(len, T::default())?,
        };
        Ok(ScratchLease { pool: self, buf })
    }

    /// Number of idle buffers currently held.
    #[cfg(test)]
    pub(crate) fn idle(&self) -> usize {
        self.idle.lock().len()
    }
}

/// A buffer borrowed from a [`ScratchPool`].
pub(crate) struct ScratchLease<'a, T> {
    pool: &'a ScratchPool<T>,
    buf: Vec<T>,
}

impl<T> Deref for ScratchLease<'_, T> {
    type Target = [T];

    fn deref(&self) -> &[T] {
        &self.buf
    }
}

impl<T> DerefMut for ScratchLease<'_, T> {
    fn deref_mut(&mut self) -> &mut [T] {
        &mut self.buf
    }
}

impl<T> Drop for ScratchLease<'_, T> {
    fn drop(&mut self) {
        let buf = std::mem::take(&mut self.buf);
        let mut idle = self.pool.idle.lock();
        if idle.len() < self.pool.max_retained {
            idle.push(buf);
        }
    }
}

#[cfg(test)]
#[allow(clippy::unwrap_used)]
mod tests {
    use super::*;

    #[test]
    fn try_filled_has_requested_length() {
        let buf = try_filled(5, 0.25_f64).unwrap();
        assert_eq!(buf, vec![0.25; 5]);
    }

    #[test]
    fn impossible_allocation_is_resource_exhaustion() {
        let result = try_filled::<f64>(usize::MAX / 2, 0.0);
        assert!(matches!(
            result,
            Err(StickerError::ResourceExhaustion { .. })
        ));
    }

    #[test]
    fn try_copy_copies() {
        assert_eq!(try_copy(&[1u8, 2, 3]).unwrap(), vec![1, 2, 3]);
    }

    #[test]
    fn check_mask_accepts_exact_length() {
        assert_eq!(check_mask(&[0.0; 6], Dimensions::new(3, 2)).unwrap(), 6);
    }

    #[test]
    fn check_mask_rejects_mismatch() {
        let err = check_mask(&[0.0; 5], Dimensions::new(3, 2)).unwrap_err();
        assert!(matches!(err, StickerError::InvalidParameters(_)));
        assert!(err.to_string().contains("3x2"));
    }

    #[test]
    fn check_mask_rejects_zero_dimensions() {
        assert!(matches!(
            check_mask(&[], Dimensions::new(0, 0)),
            Err(StickerError::InvalidParameters(_))
        ));
    }

    #[test]
    fn check_pixels_requires_four_bytes_per_pixel() {
        let dims = Dimensions::new(2, 2);
        assert_eq!(check_pixels(&[0; 16], dims).unwrap(), 4);
        assert!(check_pixels(&[0; 12], dims).is_err());
        assert!(check_pixels(&[0; 17], dims).is_err());
    }

    #[test]
    fn lease_returns_buffer_on_drop() {
        let pool = ScratchPool::<f64>::new(2);
        {
            let mut lease = pool.lease(4).unwrap();
            lease[0] = 1.0;
            assert_eq!(pool.idle(), 0);
        }
        assert_eq!(pool.idle(), 1);
    }

    #[test]
    fn reused_lease_is_reset() {
        let pool = ScratchPool::<u32>::new(1);
        {
            let mut lease = pool.lease(3).unwrap();
            lease.fill(7);
        }
        let lease = pool.lease(5).unwrap();
        assert_eq!(&*lease, &[0; 5]);
    }

    #[test]
    fn pool_retains_at_most_max() {
        let pool = ScratchPool::<u8>::new(1);
        {
            let _a = pool.lease(1).unwrap();
            let _b = pool.lease(1).unwrap();
        }
        assert_eq!(pool.idle(), 1);
    }

    #[test]
    fn lease_released_on_early_return() {
        fn fails(pool: &ScratchPool<f64>) -> Result<(), StickerError> {
            let _lease = pool.lease(8)?;
            Err(StickerError::InvalidParameters("boom".to_string()))
        }

        let pool = ScratchPool::new(4);
        assert!(fails(&pool).is_err());
        assert_eq!(pool.idle(), 1);
    }
}
