//! Binary segmentation masks.

use serde::{Deserialize, Serialize};

/// Union mask over the dynamic-object classes of one image. Stored row
/// major, one byte per pixel, nonzero meaning masked.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SegmentationMask {
    pub width: u32,
    pub height: u32,
    pub data: Vec<u8>,
}

impl SegmentationMask {
    pub fn new(width: u32, height: u32, data: Vec<u8>) -> SegmentationMask {
        assert_eq!(data.len(), (width as usize) * (height as usize));
        SegmentationMask {
            width,
            height,
            data,
        }
    }

    pub fn from_luma(img: &image::GrayImage) -> SegmentationMask {
        SegmentationMask {
            width: img.width(),
            height: img.height(),
            data: img.as_raw().clone(),
        }
    }

    /// Whether the (sub-pixel) coordinate rounds into a masked pixel.
    /// Out-of-bounds coordinates are never masked.
    pub fn contains(&self, x: f64, y: f64) -> bool {
        if !(x.is_finite() && y.is_finite()) || x < 0.0 || y < 0.0 {
            return false;
        }
        let xi = x.round() as u32;
        let yi = y.round() as u32;
        if xi >= self.width || yi >= self.height {
            return false;
        }
        self.data[(yi as usize) * (self.width as usize) + (xi as usize)] != 0
    }

    pub fn masked_pixel_count(&self) -> usize {
        self.data.iter().filter(|&&v| v != 0).count()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn contains_rounds_and_bounds_checks() {
        let mut data = vec![0u8; 4 * 3];
        data[1 * 4 + 2] = 255; // pixel (x=2, y=1)
        let mask = SegmentationMask::new(4, 3, data);
        assert!(mask.contains(2.0, 1.0));
        assert!(mask.contains(2.4, 0.6));
        assert!(!mask.contains(1.0, 1.0));
        assert!(!mask.contains(-1.0, 1.0));
        assert!(!mask.contains(2.0, 99.0));
        assert!(!mask.contains(f64::NAN, 0.0));
        assert_eq!(mask.masked_pixel_count(), 1);
    }
}
