// src/analysis/features.rs
//
// Sparse point correspondences between consecutive frames:
// minimum-eigenvalue (Shi-Tomasi) corners, tracked into the next frame by
// SAD patch matching with parabolic sub-pixel refinement.

use super::optical_flow::box_sum;
use crate::types::{GrayFrame, PixelRect};
use ndarray::Array2;
use serde::{Deserialize, Serialize};

// ============================================================================
// CONFIGURATION
// ============================================================================

#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct CornerConfig {
    pub max_corners: usize,
    /// Fraction of the strongest response a corner must reach
    pub quality_level: f32,
    /// Minimum Euclidean distance between accepted corners (px)
    pub min_distance: f32,
    /// Structure tensor window radius
    pub block_radius: usize,
}

impl Default for CornerConfig {
    fn default() -> Self {
        Self {
            max_corners: 400,
            quality_level: 0.01,
            min_distance: 7.0,
            block_radius: 2,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct PatchTrackConfig {
    /// Patch half-size; patches are (2r+1)^2
    pub patch_radius: usize,
    /// Search half-range in each axis (px)
    pub search_radius: usize,
    /// Reject matches whose mean absolute difference exceeds this
    pub max_mean_abs_diff: f32,
}

impl Default for PatchTrackConfig {
    fn default() -> Self {
        Self {
            patch_radius: 3,
            search_radius: 8,
            max_mean_abs_diff: 18.0,
        }
    }
}

/// A point and where it moved to in the next frame.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct Correspondence {
    pub from: (f32, f32),
    pub to: (f32, f32),
}

impl Correspondence {
    pub fn dx(&self) -> f32 {
        self.to.0 - self.from.0
    }

    pub fn dy(&self) -> f32 {
        self.to.1 - self.from.1
    }
}

// ============================================================================
// CORNERS
// ============================================================================

/// Strongest well-separated corners inside `rect` (whole frame if `None`).
pub fn good_features(img: &GrayFrame, rect: Option<PixelRect>, cfg: &CornerConfig) -> Vec<(f32, f32)> {
    let (w, h) = (img.width, img.height);
    if w < 3 || h < 3 {
        return Vec::new();
    }
    let rect = rect.unwrap_or(PixelRect {
        x: 0,
        y: 0,
        width: w,
        height: h,
    });

    let a = img.to_array();
    let gx = Array2::from_shape_fn((h, w), |(y, x)| {
        let l = x.saturating_sub(1);
        let r = (x + 1).min(w - 1);
        (a[[y, r]] - a[[y, l]]) * 0.5
    });
    let gy = Array2::from_shape_fn((h, w), |(y, x)| {
        let t = y.saturating_sub(1);
        let b = (y + 1).min(h - 1);
        (a[[b, x]] - a[[t, x]]) * 0.5
    });
    let sxx = box_sum(&(&gx * &gx), cfg.block_radius);
    let sxy = box_sum(&(&gx * &gy), cfg.block_radius);
    let syy = box_sum(&(&gy * &gy), cfg.block_radius);

    let response = Array2::from_shape_fn((h, w), |(y, x)| {
        let (p, q, r) = (sxx[[y, x]], sxy[[y, x]], syy[[y, x]]);
        0.5 * (p + r) - (0.25 * (p - r) * (p - r) + q * q).sqrt()
    });

    // Keep a margin so patches around accepted corners stay in bounds
    let margin = cfg.block_radius + 1;
    let x0 = rect.x.max(margin);
    let y0 = rect.y.max(margin);
    let x1 = (rect.x + rect.width).min(w.saturating_sub(margin));
    let y1 = (rect.y + rect.height).min(h.saturating_sub(margin));

    let mut max_resp = 0.0f32;
    for y in y0..y1 {
        for x in x0..x1 {
            max_resp = max_resp.max(response[[y, x]]);
        }
    }
    if max_resp <= 0.0 {
        return Vec::new();
    }
    let floor = max_resp * cfg.quality_level;

    // 3x3 local maxima above the quality floor
    let mut candidates: Vec<(f32, usize, usize)> = Vec::new();
    for y in y0..y1 {
        for x in x0..x1 {
            let r = response[[y, x]];
            if r < floor {
                continue;
            }
            let mut is_max = true;
            'n: for ny in y - 1..=y + 1 {
                for nx in x - 1..=x + 1 {
                    if response[[ny, nx]] > r {
                        is_max = false;
                        break 'n;
                    }
                }
            }
            if is_max {
                candidates.push((r, x, y));
            }
        }
    }
    candidates.sort_by(|a, b| b.0.partial_cmp(&a.0).unwrap_or(std::cmp::Ordering::Equal));

    let min_d2 = cfg.min_distance * cfg.min_distance;
    let mut accepted: Vec<(f32, f32)> = Vec::with_capacity(cfg.max_corners);
    for (_, x, y) in candidates {
        let p = (x as f32, y as f32);
        if accepted
            .iter()
            .all(|q| (q.0 - p.0).powi(2) + (q.1 - p.1).powi(2) >= min_d2)
        {
            accepted.push(p);
            if accepted.len() >= cfg.max_corners {
                break;
            }
        }
    }
    accepted
}

// ============================================================================
// PATCH TRACKING
// ============================================================================

/// SAD between the patch around (px, py) in `a` and (qx, qy) in `b`.
/// Stops early once `bound` is exceeded.
#[inline]
#[allow(clippy::too_many_arguments)]
fn patch_sad(
    a: &GrayFrame,
    b: &GrayFrame,
    px: usize,
    py: usize,
    qx: usize,
    qy: usize,
    r: usize,
    bound: u32,
) -> u32 {
    let mut sum = 0u32;
    for dy in 0..=2 * r {
        let ra = (py + dy - r) * a.width + px - r;
        let rb = (qy + dy - r) * b.width + qx - r;
        for dx in 0..=2 * r {
            sum += (a.data[ra + dx] as i32 - b.data[rb + dx] as i32).unsigned_abs();
        }
        if sum > bound {
            return sum;
        }
    }
    sum
}

/// Vertex offset of the parabola through (-1, l), (0, c), (1, r).
#[inline]
fn parabolic_offset(l: f32, c: f32, r: f32) -> f32 {
    let denom = l - 2.0 * c + r;
    if denom.abs() < 1e-6 {
        0.0
    } else {
        (0.5 * (l - r) / denom).clamp(-0.5, 0.5)
    }
}

/// Track each point from `prev` into `next`. Points whose best match is
/// too dissimilar or too close to the border are dropped.
pub fn track_points(
    prev: &GrayFrame,
    next: &GrayFrame,
    points: &[(f32, f32)],
    cfg: &PatchTrackConfig,
) -> Vec<Correspondence> {
    if prev.width != next.width || prev.height != next.height {
        return Vec::new();
    }
    let r = cfg.patch_radius;
    let s = cfg.search_radius as isize;
    let (w, h) = (prev.width as isize, prev.height as isize);
    let patch_px = ((2 * r + 1) * (2 * r + 1)) as f32;
    let max_sad = (cfg.max_mean_abs_diff * patch_px) as u32;

    let mut out = Vec::with_capacity(points.len());
    for &(fx, fy) in points {
        let (px, py) = (fx.round() as isize, fy.round() as isize);
        let ri = r as isize;
        if px - ri < 0 || py - ri < 0 || px + ri >= w || py + ri >= h {
            continue;
        }

        let mut best = (u32::MAX, 0isize, 0isize);
        for oy in -s..=s {
            let qy = py + oy;
            if qy - ri < 0 || qy + ri >= h {
                continue;
            }
            for ox in -s..=s {
                let qx = px + ox;
                if qx - ri < 0 || qx + ri >= w {
                    continue;
                }
                let cost = patch_sad(
                    prev,
                    next,
                    px as usize,
                    py as usize,
                    qx as usize,
                    qy as usize,
                    r,
                    best.0,
                );
                // Ties prefer the smaller displacement
                if cost < best.0
                    || (cost == best.0 && ox * ox + oy * oy < best.1 * best.1 + best.2 * best.2)
                {
                    best = (cost, ox, oy);
                }
            }
        }

        if best.0 > max_sad {
            continue;
        }
        let (_, bx, by) = best;
        // Full (unbounded) costs around the optimum for sub-pixel refinement
        let cost_at = |ox: isize, oy: isize| -> Option<f32> {
            let (qx, qy) = (px + ox, py + oy);
            if qx - ri < 0 || qy - ri < 0 || qx + ri >= w || qy + ri >= h {
                return None;
            }
            let c = patch_sad(
                prev,
                next,
                px as usize,
                py as usize,
                qx as usize,
                qy as usize,
                r,
                u32::MAX,
            );
            Some(c as f32)
        };
        let c0 = best.0 as f32;
        let sub_x = match (cost_at(bx - 1, by), cost_at(bx + 1, by)) {
            (Some(l), Some(rr)) => parabolic_offset(l, c0, rr),
            _ => 0.0,
        };
        let sub_y = match (cost_at(bx, by - 1), cost_at(bx, by + 1)) {
            (Some(t), Some(b)) => parabolic_offset(t, c0, b),
            _ => 0.0,
        };

        out.push(Correspondence {
            from: (fx, fy),
            to: (
                px as f32 + bx as f32 + sub_x + (fx - px as f32),
                py as f32 + by as f32 + sub_y + (fy - py as f32),
            ),
        });
    }
    out
}

#[cfg(test)]
mod tests {
    use super::*;

    fn checker(width: usize, height: usize, shift_x: i32, shift_y: i32) -> GrayFrame {
        let mut data = Vec::with_capacity(width * height);
        for y in 0..height as i32 {
            for x in 0..width as i32 {
                let (sx, sy) = (x - shift_x, y - shift_y);
                // Irregular blob pattern so every patch is distinctive
                let v = ((sx * 7 + sy * 13) % 31) as f32 * 3.0
                    + if (sx.div_euclid(6) + sy.div_euclid(5)) % 2 == 0 { 100.0 } else { 20.0 };
                data.push(v.clamp(0.0, 255.0) as u8);
            }
        }
        GrayFrame::new(data, width, height)
    }

    #[test]
    fn test_corners_found_on_texture() {
        let img = checker(120, 80, 0, 0);
        let pts = good_features(&img, None, &CornerConfig::default());
        assert!(pts.len() > 10);
        assert!(pts.len() <= 400);
        for (i, a) in pts.iter().enumerate() {
            for b in &pts[i + 1..] {
                let d = ((a.0 - b.0).powi(2) + (a.1 - b.1).powi(2)).sqrt();
                assert!(d >= 7.0);
            }
        }
    }

    #[test]
    fn test_no_corners_on_flat() {
        let flat = GrayFrame::new(vec![77u8; 60 * 40], 60, 40);
        assert!(good_features(&flat, None, &CornerConfig::default()).is_empty());
    }

    #[test]
    fn test_corners_respect_rect() {
        let img = checker(120, 80, 0, 0);
        let rect = PixelRect {
            x: 0,
            y: 40,
            width: 120,
            height: 40,
        };
        let pts = good_features(&img, Some(rect), &CornerConfig::default());
        assert!(!pts.is_empty());
        assert!(pts.iter().all(|p| p.1 >= 40.0));
    }

    #[test]
    fn test_track_integer_shift() {
        let a = checker(120, 80, 0, 0);
        let b = checker(120, 80, 3, -2);
        let pts = good_features(&a, None, &CornerConfig::default());
        let matches = track_points(&a, &b, &pts, &PatchTrackConfig::default());
        assert!(!matches.is_empty());

        let mut dxs: Vec<f32> = matches.iter().map(|m| m.dx()).collect();
        let mut dys: Vec<f32> = matches.iter().map(|m| m.dy()).collect();
        dxs.sort_by(|a, b| a.partial_cmp(b).unwrap());
        dys.sort_by(|a, b| a.partial_cmp(b).unwrap());
        assert!((dxs[dxs.len() / 2] - 3.0).abs() < 0.6);
        assert!((dys[dys.len() / 2] + 2.0).abs() < 0.6);
    }

    #[test]
    fn test_parabolic_offset() {
        assert_eq!(parabolic_offset(10.0, 0.0, 10.0), 0.0);
        assert!(parabolic_offset(4.0, 0.0, 12.0) < 0.0);
    }
}
