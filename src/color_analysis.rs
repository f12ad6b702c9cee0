// src/color_analysis.rs
//
// HSV thresholding and binary morphology for painted-surface detection.
// HSV follows the 8-bit convention: H in [0, 180), S and V in [0, 255].

use crate::types::{Frame, PixelRect};
use serde::{Deserialize, Serialize};

// ============================================================================
// HSV CONVERSION
// ============================================================================

/// Convert RGB to 8-bit HSV. Returns (H: 0-180, S: 0-255, V: 0-255).
#[inline]
pub fn rgb_to_hsv(r: u8, g: u8, b: u8) -> (f32, f32, f32) {
    let r_n = r as f32 / 255.0;
    let g_n = g as f32 / 255.0;
    let b_n = b as f32 / 255.0;

    let max = r_n.max(g_n).max(b_n);
    let min = r_n.min(g_n).min(b_n);
    let delta = max - min;

    let h = if delta < 1e-6 {
        0.0
    } else if max == r_n {
        60.0 * (((g_n - b_n) / delta) % 6.0)
    } else if max == g_n {
        60.0 * (((b_n - r_n) / delta) + 2.0)
    } else {
        60.0 * (((r_n - g_n) / delta) + 4.0)
    };
    let h = if h < 0.0 { h + 360.0 } else { h };

    let s = if max < 1e-6 { 0.0 } else { delta / max * 255.0 };

    (h / 2.0, s, max * 255.0)
}

// ============================================================================
// COLOR TARGET
// ============================================================================

/// Inclusive HSV band. A `hue_min` greater than `hue_max` wraps through 0.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct HueBand {
    pub hue_min: f32,
    pub hue_max: f32,
    pub sat_min: f32,
    pub val_min: f32,
}

impl HueBand {
    /// Painted red: hue 170..180 ∪ 0..10, saturation and value at least 80
    pub fn red() -> Self {
        Self {
            hue_min: 170.0,
            hue_max: 10.0,
            sat_min: 80.0,
            val_min: 80.0,
        }
    }

    /// Split into non-wrapping hue intervals.
    pub fn hue_ranges(&self) -> Vec<(f32, f32)> {
        if self.hue_min <= self.hue_max {
            vec![(self.hue_min, self.hue_max)]
        } else {
            vec![(self.hue_min, 180.0), (0.0, self.hue_max)]
        }
    }

    #[inline]
    pub fn matches(&self, h: f32, s: f32, v: f32) -> bool {
        if s < self.sat_min || v < self.val_min {
            return false;
        }
        if self.hue_min <= self.hue_max {
            h >= self.hue_min && h <= self.hue_max
        } else {
            h >= self.hue_min || h <= self.hue_max
        }
    }
}

// ============================================================================
// MASKS
// ============================================================================

/// Row-major binary mask.
#[derive(Debug, Clone, PartialEq)]
pub struct Mask {
    pub data: Vec<bool>,
    pub width: usize,
    pub height: usize,
}

impl Mask {
    #[inline]
    fn get(&self, x: usize, y: usize) -> bool {
        self.data[y * self.width + x]
    }

    pub fn coverage(&self) -> f32 {
        if self.data.is_empty() {
            return 0.0;
        }
        self.data.iter().filter(|&&b| b).count() as f32 / self.data.len() as f32
    }

    /// Square-kernel erosion; out-of-bounds neighbours are ignored.
    pub fn erode(&self, kernel: usize) -> Mask {
        self.morph(kernel, true)
    }

    /// Square-kernel dilation; out-of-bounds neighbours are ignored.
    pub fn dilate(&self, kernel: usize) -> Mask {
        self.morph(kernel, false)
    }

    pub fn open(&self, kernel: usize) -> Mask {
        self.erode(kernel).dilate(kernel)
    }

    pub fn close(&self, kernel: usize) -> Mask {
        self.dilate(kernel).erode(kernel)
    }

    fn morph(&self, kernel: usize, erode: bool) -> Mask {
        let r = (kernel.max(1) / 2) as isize;
        let (w, h) = (self.width as isize, self.height as isize);
        let mut out = vec![false; self.data.len()];
        for y in 0..h {
            for x in 0..w {
                let mut acc = erode;
                'k: for dy in -r..=r {
                    for dx in -r..=r {
                        let (nx, ny) = (x + dx, y + dy);
                        if nx < 0 || ny < 0 || nx >= w || ny >= h {
                            continue;
                        }
                        let v = self.get(nx as usize, ny as usize);
                        if erode && !v {
                            acc = false;
                            break 'k;
                        }
                        if !erode && v {
                            acc = true;
                            break 'k;
                        }
                    }
                }
                out[(y * w + x) as usize] = acc;
            }
        }
        Mask {
            data: out,
            width: self.width,
            height: self.height,
        }
    }
}

/// Threshold a region of a frame against a hue band.
pub fn threshold_region(frame: &Frame, rect: &PixelRect, band: &HueBand) -> Mask {
    let mut data = Vec::with_capacity(rect.area());
    for y in rect.y..rect.y + rect.height {
        for x in rect.x..rect.x + rect.width {
            let [r, g, b] = frame.rgb(x, y);
            let (h, s, v) = rgb_to_hsv(r, g, b);
            data.push(band.matches(h, s, v));
        }
    }
    Mask {
        data,
        width: rect.width,
        height: rect.height,
    }
}

/// Fraction of `rect` matching `band` after open-then-close cleanup.
pub fn region_coverage(frame: &Frame, rect: &PixelRect, band: &HueBand, kernel: usize) -> f32 {
    let mask = threshold_region(frame, rect, band);
    let cleaned = if kernel > 1 {
        mask.open(kernel).close(kernel)
    } else {
        mask
    };
    cleaned.coverage()
}
