// src/analysis/optical_flow.rs
//
// Dense pyramidal Lucas-Kanade optical flow.
//
// For every pixel of `prev`, estimates the displacement (u, v) such that
// next(x + u, y + v) ≈ prev(x, y). Coarse-to-fine over a 2x pyramid; at
// each level the flow is refined by a few Gauss-Newton steps on windowed
// structure tensors. Textureless pixels (small minimum eigenvalue) keep
// the flow propagated from the coarser level.
//
// No OpenCV dependency; plain ndarray buffers.

use crate::types::GrayFrame;
use ndarray::Array2;
use serde::{Deserialize, Serialize};

// ============================================================================
// CONFIGURATION
// ============================================================================

#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct FlowConfig {
    /// Pyramid levels including the full-resolution one
    pub levels: usize,
    /// Side of the square aggregation window in pixels (odd)
    pub window: usize,
    /// Refinement iterations per level
    pub iterations: usize,
    /// Minimum structure-tensor eigenvalue per window pixel for a valid solve
    pub min_eigen: f32,
}

impl Default for FlowConfig {
    fn default() -> Self {
        Self {
            levels: 3,
            window: 15,
            iterations: 3,
            min_eigen: 1e-2,
        }
    }
}

// ============================================================================
// FLOW FIELD
// ============================================================================

/// Per-pixel displacement in pixels, indexed `[[row, col]]`.
#[derive(Debug, Clone)]
pub struct FlowField {
    pub u: Array2<f32>,
    pub v: Array2<f32>,
}

impl FlowField {
    pub fn zeros(height: usize, width: usize) -> Self {
        Self {
            u: Array2::zeros((height, width)),
            v: Array2::zeros((height, width)),
        }
    }

    pub fn width(&self) -> usize {
        self.u.ncols()
    }

    pub fn height(&self) -> usize {
        self.u.nrows()
    }

    /// Iterate `(x, y, u, v)` over all pixels.
    pub fn vectors(&self) -> impl Iterator<Item = (usize, usize, f32, f32)> + '_ {
        self.u
            .indexed_iter()
            .zip(self.v.iter())
            .map(|(((y, x), &u), &v)| (x, y, u, v))
    }
}

// ============================================================================
// IMAGE HELPERS
// ============================================================================

fn downsample(img: &Array2<f32>) -> Array2<f32> {
    let (h, w) = img.dim();
    let (nh, nw) = ((h / 2).max(1), (w / 2).max(1));
    Array2::from_shape_fn((nh, nw), |(y, x)| {
        let (y0, x0) = ((2 * y).min(h - 1), (2 * x).min(w - 1));
        let (y1, x1) = ((2 * y + 1).min(h - 1), (2 * x + 1).min(w - 1));
        0.25 * (img[[y0, x0]] + img[[y0, x1]] + img[[y1, x0]] + img[[y1, x1]])
    })
}

fn upsample_flow(coarse: &Array2<f32>, h: usize, w: usize) -> Array2<f32> {
    let (ch, cw) = coarse.dim();
    Array2::from_shape_fn((h, w), |(y, x)| {
        2.0 * coarse[[(y / 2).min(ch - 1), (x / 2).min(cw - 1)]]
    })
}

/// Central-difference gradients, one-sided at the borders.
fn gradients(img: &Array2<f32>) -> (Array2<f32>, Array2<f32>) {
    let (h, w) = img.dim();
    let gx = Array2::from_shape_fn((h, w), |(y, x)| {
        let l = x.saturating_sub(1);
        let r = (x + 1).min(w - 1);
        let span = (r - l).max(1) as f32;
        (img[[y, r]] - img[[y, l]]) / span
    });
    let gy = Array2::from_shape_fn((h, w), |(y, x)| {
        let t = y.saturating_sub(1);
        let b = (y + 1).min(h - 1);
        let span = (b - t).max(1) as f32;
        (img[[b, x]] - img[[t, x]]) / span
    });
    (gx, gy)
}

#[inline]
fn sample_bilinear(img: &Array2<f32>, x: f32, y: f32) -> f32 {
    let (h, w) = img.dim();
    let x = x.clamp(0.0, (w - 1) as f32);
    let y = y.clamp(0.0, (h - 1) as f32);
    let x0 = x.floor() as usize;
    let y0 = y.floor() as usize;
    let x1 = (x0 + 1).min(w - 1);
    let y1 = (y0 + 1).min(h - 1);
    let fx = x - x0 as f32;
    let fy = y - y0 as f32;
    img[[y0, x0]] * (1.0 - fx) * (1.0 - fy)
        + img[[y0, x1]] * fx * (1.0 - fy)
        + img[[y1, x0]] * (1.0 - fx) * fy
        + img[[y1, x1]] * fx * fy
}

/// Windowed sum over a `(2r+1)^2` box clipped at the borders, via an
/// integral image.
pub(crate) fn box_sum(img: &Array2<f32>, r: usize) -> Array2<f32> {
    let (h, w) = img.dim();
    let mut integral = Array2::<f64>::zeros((h + 1, w + 1));
    for y in 0..h {
        let mut row = 0.0f64;
        for x in 0..w {
            row += img[[y, x]] as f64;
            integral[[y + 1, x + 1]] = integral[[y, x + 1]] + row;
        }
    }
    Array2::from_shape_fn((h, w), |(y, x)| {
        let y0 = y.saturating_sub(r);
        let x0 = x.saturating_sub(r);
        let y1 = (y + r + 1).min(h);
        let x1 = (x + r + 1).min(w);
        (integral[[y1, x1]] - integral[[y0, x1]] - integral[[y1, x0]] + integral[[y0, x0]]) as f32
    })
}

// ============================================================================
// DENSE FLOW
// ============================================================================

pub fn dense_flow(prev: &GrayFrame, next: &GrayFrame, cfg: &FlowConfig) -> FlowField {
    if prev.width != next.width || prev.height != next.height || prev.data.is_empty() {
        return FlowField::zeros(prev.height, prev.width);
    }

    let mut prev_pyr = vec![prev.to_array()];
    let mut next_pyr = vec![next.to_array()];
    for _ in 1..cfg.levels.max(1) {
        let (h, w) = prev_pyr[prev_pyr.len() - 1].dim();
        if h < 2 * cfg.window || w < 2 * cfg.window {
            break;
        }
        let p = downsample(&prev_pyr[prev_pyr.len() - 1]);
        let n = downsample(&next_pyr[next_pyr.len() - 1]);
        prev_pyr.push(p);
        next_pyr.push(n);
    }

    let radius = cfg.window.max(3) / 2;
    let area = ((2 * radius + 1) * (2 * radius + 1)) as f32;
    let mut u: Option<Array2<f32>> = None;
    let mut v: Option<Array2<f32>> = None;

    for level in (0..prev_pyr.len()).rev() {
        let p = &prev_pyr[level];
        let n = &next_pyr[level];
        let (h, w) = p.dim();

        let mut lu = match &u {
            Some(c) => upsample_flow(c, h, w),
            None => Array2::zeros((h, w)),
        };
        let mut lv = match &v {
            Some(c) => upsample_flow(c, h, w),
            None => Array2::zeros((h, w)),
        };

        let (gx, gy) = gradients(p);
        let sxx = box_sum(&(&gx * &gx), radius);
        let sxy = box_sum(&(&gx * &gy), radius);
        let syy = box_sum(&(&gy * &gy), radius);

        for _ in 0..cfg.iterations.max(1) {
            let it = Array2::from_shape_fn((h, w), |(y, x)| {
                sample_bilinear(n, x as f32 + lu[[y, x]], y as f32 + lv[[y, x]]) - p[[y, x]]
            });
            let sxt = box_sum(&(&gx * &it), radius);
            let syt = box_sum(&(&gy * &it), radius);

            for y in 0..h {
                for x in 0..w {
                    let (a, b, c) = (sxx[[y, x]], sxy[[y, x]], syy[[y, x]]);
                    let half_trace = 0.5 * (a + c);
                    let min_eig =
                        half_trace - (0.25 * (a - c) * (a - c) + b * b).sqrt();
                    if min_eig / area < cfg.min_eigen {
                        continue;
                    }
                    let det = a * c - b * b;
                    if det.abs() < 1e-9 {
                        continue;
                    }
                    let (ex, ey) = (sxt[[y, x]], syt[[y, x]]);
                    let du = -(c * ex - b * ey) / det;
                    let dv = -(a * ey - b * ex) / det;
                    let limit = radius as f32;
                    lu[[y, x]] += du.clamp(-limit, limit);
                    lv[[y, x]] += dv.clamp(-limit, limit);
                }
            }
        }

        u = Some(lu);
        v = Some(lv);
    }

    match (u, v) {
        (Some(u), Some(v)) => FlowField { u, v },
        _ => FlowField::zeros(prev.height, prev.width),
    }
}
