// src/types.rs

use crate::error::{AnalysisError, Result};
use ndarray::Array2;
use serde::{Deserialize, Serialize};

/// Axis-aligned box `[x1, y1, x2, y2]` in pixel coordinates.
pub type BBox = [f32; 4];

pub fn bbox_center(b: &BBox) -> (f32, f32) {
    ((b[0] + b[2]) * 0.5, (b[1] + b[3]) * 0.5)
}

pub fn bbox_height(b: &BBox) -> f32 {
    (b[3] - b[1]).max(0.0)
}

pub fn bbox_area(b: &BBox) -> f32 {
    (b[2] - b[0]).max(0.0) * (b[3] - b[1]).max(0.0)
}

// ============================================================================
// FRAMES
// ============================================================================

/// A decoded, sampled video frame. Packed RGB, row-major.
#[derive(Debug, Clone)]
pub struct Frame {
    pub data: Vec<u8>,
    pub width: usize,
    pub height: usize,
    /// Native (pre-sampling) frame index, 0-based
    pub index: u64,
    /// Seconds since stream start: `index / native_fps`
    pub timestamp: f64,
}

impl Frame {
    pub fn new(data: Vec<u8>, width: usize, height: usize, index: u64, timestamp: f64) -> Self {
        debug_assert_eq!(data.len(), width * height * 3);
        Self {
            data,
            width,
            height,
            index,
            timestamp,
        }
    }

    #[inline]
    pub fn rgb(&self, x: usize, y: usize) -> [u8; 3] {
        let i = (y * self.width + x) * 3;
        [self.data[i], self.data[i + 1], self.data[i + 2]]
    }

    pub fn to_gray(&self) -> GrayFrame {
        GrayFrame::from_rgb(&self.data, self.width, self.height)
    }
}

/// Single-channel frame. Pixel at (x, y) = data[y * width + x]
#[derive(Debug, Clone)]
pub struct GrayFrame {
    pub data: Vec<u8>,
    pub width: usize,
    pub height: usize,
}

impl GrayFrame {
    pub fn new(data: Vec<u8>, width: usize, height: usize) -> Self {
        debug_assert_eq!(data.len(), width * height);
        Self {
            data,
            width,
            height,
        }
    }

    /// Convert from RGB packed bytes (3 bytes per pixel)
    pub fn from_rgb(rgb: &[u8], width: usize, height: usize) -> Self {
        let mut gray = Vec::with_capacity(width * height);
        for pixel in rgb.chunks_exact(3) {
            // ITU-R BT.601 luma
            let g = 0.299 * pixel[0] as f32 + 0.587 * pixel[1] as f32 + 0.114 * pixel[2] as f32;
            gray.push(g.round().min(255.0) as u8);
        }
        Self::new(gray, width, height)
    }

    #[inline]
    pub fn pixel(&self, x: usize, y: usize) -> u8 {
        self.data[y * self.width + x]
    }

    pub fn crop(&self, rect: &PixelRect) -> GrayFrame {
        let mut data = Vec::with_capacity(rect.width * rect.height);
        for y in rect.y..rect.y + rect.height {
            let row = y * self.width;
            data.extend_from_slice(&self.data[row + rect.x..row + rect.x + rect.width]);
        }
        GrayFrame::new(data, rect.width, rect.height)
    }

    /// Intensities as an (rows, cols) float image.
    pub fn to_array(&self) -> Array2<f32> {
        Array2::from_shape_fn((self.height, self.width), |(y, x)| {
            self.data[y * self.width + x] as f32
        })
    }
}

// ============================================================================
// REGIONS OF INTEREST
// ============================================================================

/// Rectangle in fractions of frame width/height. Resolved against the
/// current frame every time, so it survives resizing.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct FractionalRect {
    pub left: f32,
    pub top: f32,
    pub right: f32,
    pub bottom: f32,
}

impl FractionalRect {
    pub const FULL: FractionalRect = FractionalRect {
        left: 0.0,
        top: 0.0,
        right: 1.0,
        bottom: 1.0,
    };

    pub fn new(left: f32, top: f32, right: f32, bottom: f32) -> Self {
        Self {
            left,
            top,
            right,
            bottom,
        }
    }

    /// Full-width horizontal band between two height fractions.
    pub fn rows(top: f32, bottom: f32) -> Self {
        Self::new(0.0, top, 1.0, bottom)
    }

    /// Horizontally centered box sitting `bottom_gap` above the bottom edge.
    pub fn centered_bottom(width: f32, height: f32, bottom_gap: f32) -> Self {
        let left = (1.0 - width) * 0.5;
        let bottom = 1.0 - bottom_gap;
        Self::new(left, bottom - height, left + width, bottom)
    }

    pub fn validate(&self, name: &str) -> Result<()> {
        let in_unit = |v: f32| (0.0..=1.0).contains(&v);
        if !(in_unit(self.left) && in_unit(self.top) && in_unit(self.right) && in_unit(self.bottom))
        {
            return Err(AnalysisError::InvalidConfig(format!(
                "{name}: fractions must lie in [0, 1]"
            )));
        }
        if self.left >= self.right || self.top >= self.bottom {
            return Err(AnalysisError::InvalidConfig(format!(
                "{name}: empty region ({:.2},{:.2})-({:.2},{:.2})",
                self.left, self.top, self.right, self.bottom
            )));
        }
        Ok(())
    }

    /// Pixel rectangle for a `width` x `height` frame. Never empty for a
    /// non-empty frame.
    pub fn resolve(&self, width: usize, height: usize) -> PixelRect {
        let x0 = ((self.left * width as f32) as usize).min(width.saturating_sub(1));
        let y0 = ((self.top * height as f32) as usize).min(height.saturating_sub(1));
        let x1 = ((self.right * width as f32) as usize).clamp(x0 + 1, width.max(1));
        let y1 = ((self.bottom * height as f32) as usize).clamp(y0 + 1, height.max(1));
        PixelRect {
            x: x0,
            y: y0,
            width: x1 - x0,
            height: y1 - y0,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct PixelRect {
    pub x: usize,
    pub y: usize,
    pub width: usize,
    pub height: usize,
}

impl PixelRect {
    pub fn area(&self) -> usize {
        self.width * self.height
    }
}

// ============================================================================
// EVENT ATTRIBUTES
// ============================================================================

/// Horizontal position of an event relative to the ego vehicle.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Location {
    Left,
    Center,
    Right,
}

impl Location {
    /// Classify a normalized x coordinate against two split points.
    pub fn from_ratio(x_norm: f32, left_split: f32, right_split: f32) -> Self {
        if x_norm < left_split {
            Self::Left
        } else if x_norm > right_split {
            Self::Right
        } else {
            Self::Center
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Direction {
    Left,
    Right,
}

impl Direction {
    /// Non-negative values map to `Right`.
    pub fn from_sign(value: f32) -> Self {
        if value >= 0.0 {
            Self::Right
        } else {
            Self::Left
        }
    }

    pub fn sign(&self) -> f32 {
        match self {
            Self::Left => -1.0,
            Self::Right => 1.0,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_resolve_scales_with_resolution() {
        let roi = FractionalRect::rows(0.6, 0.9);
        let small = roi.resolve(320, 180);
        let large = roi.resolve(1280, 720);
        assert_eq!(small.y, 108);
        assert_eq!(small.height, 54);
        assert_eq!(large.y, 432);
        assert_eq!(large.height, 216);
        assert_eq!(large.width, 1280);
    }

    #[test]
    fn test_resolve_never_empty() {
        let roi = FractionalRect::new(0.5, 0.5, 0.5001, 0.5001);
        let px = roi.resolve(10, 10);
        assert!(px.width >= 1 && px.height >= 1);
    }

    #[test]
    fn test_centered_bottom() {
        let roi = FractionalRect::centered_bottom(0.22, 0.18, 0.04);
        assert!((roi.left - 0.39).abs() < 1e-6);
        assert!((roi.right - 0.61).abs() < 1e-6);
        assert!((roi.bottom - 0.96).abs() < 1e-6);
        assert!((roi.top - 0.78).abs() < 1e-6);
    }

    #[test]
    fn test_validate_rejects_inverted() {
        assert!(FractionalRect::rows(0.9, 0.6).validate("roi").is_err());
        assert!(FractionalRect::rows(0.6, 1.2).validate("roi").is_err());
        assert!(FractionalRect::rows(0.6, 0.9).validate("roi").is_ok());
    }

    #[test]
    fn test_gray_conversion_and_crop() {
        let rgb = vec![255u8; 4 * 2 * 3];
        let gray = GrayFrame::from_rgb(&rgb, 4, 2);
        assert!(gray.data.iter().all(|&p| p == 255));
        let crop = gray.crop(&PixelRect {
            x: 1,
            y: 1,
            width: 2,
            height: 1,
        });
        assert_eq!(crop.data.len(), 2);
    }

    #[test]
    fn test_location_splits() {
        assert_eq!(Location::from_ratio(0.1, 0.33, 0.67), Location::Left);
        assert_eq!(Location::from_ratio(0.5, 0.33, 0.67), Location::Center);
        assert_eq!(Location::from_ratio(0.9, 0.33, 0.67), Location::Right);
    }
}
