// src/analysis/similarity.rs
//
// Robust 4-DOF similarity transform (rotation, uniform scale, translation)
// between matched point sets:
//
//   x' = a·x − b·y + tx
//   y' = b·x + a·y + ty
//
// Minimal samples of two correspondences, deterministic seeded RANSAC with
// adaptive iteration count, then a closed-form least-squares refit on the
// consensus set.

use super::features::Correspondence;
use rand::rngs::StdRng;
use rand::{Rng, SeedableRng};
use serde::{Deserialize, Serialize};

#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct RansacConfig {
    /// Maximum reprojection error for an inlier (px)
    pub reproj_threshold: f32,
    pub max_iterations: usize,
    /// Desired probability of drawing at least one all-inlier sample
    pub confidence: f64,
    pub seed: u64,
}

impl Default for RansacConfig {
    fn default() -> Self {
        Self {
            reproj_threshold: 3.0,
            max_iterations: 1000,
            confidence: 0.99,
            seed: 0x5eed,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq)]
pub struct Similarity {
    pub a: f32,
    pub b: f32,
    pub tx: f32,
    pub ty: f32,
}

impl Similarity {
    pub fn apply(&self, p: (f32, f32)) -> (f32, f32) {
        (
            self.a * p.0 - self.b * p.1 + self.tx,
            self.b * p.0 + self.a * p.1 + self.ty,
        )
    }

    /// Rotation in degrees as `atan2(M01, M00)` of the 2x3 matrix
    /// `[[a, -b, tx], [b, a, ty]]`.
    pub fn rotation_deg(&self) -> f32 {
        (-self.b).atan2(self.a).to_degrees()
    }

    pub fn scale(&self) -> f32 {
        (self.a * self.a + self.b * self.b).sqrt()
    }

    fn from_pair(p: &Correspondence, q: &Correspondence) -> Option<Self> {
        let (dpx, dpy) = (q.from.0 - p.from.0, q.from.1 - p.from.1);
        let (dqx, dqy) = (q.to.0 - p.to.0, q.to.1 - p.to.1);
        let norm = dpx * dpx + dpy * dpy;
        if norm < 1e-6 {
            return None;
        }
        // (a + ib) = dq / dp as complex numbers
        let a = (dqx * dpx + dqy * dpy) / norm;
        let b = (dqy * dpx - dqx * dpy) / norm;
        let tx = p.to.0 - (a * p.from.0 - b * p.from.1);
        let ty = p.to.1 - (b * p.from.0 + a * p.from.1);
        Some(Self { a, b, tx, ty })
    }

    /// Least-squares similarity over all given correspondences.
    pub fn fit(matches: &[&Correspondence]) -> Option<Self> {
        if matches.len() < 2 {
            return None;
        }
        let n = matches.len() as f32;
        let (mut mpx, mut mpy, mut mqx, mut mqy) = (0.0, 0.0, 0.0, 0.0);
        for m in matches {
            mpx += m.from.0;
            mpy += m.from.1;
            mqx += m.to.0;
            mqy += m.to.1;
        }
        mpx /= n;
        mpy /= n;
        mqx /= n;
        mqy /= n;

        let (mut sa, mut sb, mut sp) = (0.0f32, 0.0f32, 0.0f32);
        for m in matches {
            let (px, py) = (m.from.0 - mpx, m.from.1 - mpy);
            let (qx, qy) = (m.to.0 - mqx, m.to.1 - mqy);
            sa += px * qx + py * qy;
            sb += px * qy - py * qx;
            sp += px * px + py * py;
        }
        if sp < 1e-6 {
            return None;
        }
        let (a, b) = (sa / sp, sb / sp);
        Some(Self {
            a,
            b,
            tx: mqx - (a * mpx - b * mpy),
            ty: mqy - (b * mpx + a * mpy),
        })
    }

    fn residual(&self, m: &Correspondence) -> f32 {
        let (x, y) = self.apply(m.from);
        ((x - m.to.0).powi(2) + (y - m.to.1).powi(2)).sqrt()
    }
}

/// A fitted transform with its consensus size.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct SimilarityFit {
    pub transform: Similarity,
    pub inliers: usize,
}

/// Fit a similarity robustly. Needs at least three correspondences.
pub fn estimate_similarity(matches: &[Correspondence], cfg: &RansacConfig) -> Option<SimilarityFit> {
    let n = matches.len();
    if n < 3 {
        return None;
    }

    let mut rng = StdRng::seed_from_u64(cfg.seed);
    let mut best: Option<(Similarity, usize)> = None;
    let mut needed = cfg.max_iterations;
    let mut iter = 0;

    while iter < needed.min(cfg.max_iterations) {
        iter += 1;
        let i = rng.gen_range(0..n);
        let mut j = rng.gen_range(0..n - 1);
        if j >= i {
            j += 1;
        }
        let Some(model) = Similarity::from_pair(&matches[i], &matches[j]) else {
            continue;
        };
        let count = matches
            .iter()
            .filter(|m| model.residual(m) <= cfg.reproj_threshold)
            .count();
        if best.map_or(true, |(_, c)| count > c) {
            best = Some((model, count));
            // Adaptive termination for a 2-point minimal sample
            let w = count as f64 / n as f64;
            let p_fail = 1.0 - w * w;
            if p_fail <= 1e-12 {
                break;
            }
            let k = (1.0 - cfg.confidence).ln() / p_fail.ln();
            if k.is_finite() && k > 0.0 {
                needed = k.ceil() as usize;
            }
        }
    }

    let (model, _) = best?;
    let inliers: Vec<&Correspondence> = matches
        .iter()
        .filter(|m| model.residual(m) <= cfg.reproj_threshold)
        .collect();
    if inliers.len() < 2 {
        return None;
    }
    let refined = Similarity::fit(&inliers).unwrap_or(model);
    let count = matches
        .iter()
        .filter(|m| refined.residual(m) <= cfg.reproj_threshold)
        .count();
    Some(SimilarityFit {
        transform: refined,
        inliers: count,
    })
}

#[cfg(test)]
mod tests {
    use super::*;

    fn rotated_grid(angle_deg: f32, shift: (f32, f32)) -> Vec<Correspondence> {
        let t = Similarity {
            a: angle_deg.to_radians().cos(),
            b: angle_deg.to_radians().sin(),
            tx: shift.0,
            ty: shift.1,
        };
        let mut out = Vec::new();
        for y in 0..6 {
            for x in 0..8 {
                let p = (20.0 + x as f32 * 25.0, 150.0 + y as f32 * 12.0);
                out.push(Correspondence {
                    from: p,
                    to: t.apply(p),
                });
            }
        }
        out
    }

    #[test]
    fn test_recovers_rotation() {
        let matches = rotated_grid(2.0, (3.0, -1.0));
        let fit = estimate_similarity(&matches, &RansacConfig::default()).unwrap();
        // rotation_deg reports atan2(-b, a)
        assert!((fit.transform.rotation_deg() + 2.0).abs() < 0.05);
        assert!((fit.transform.scale() - 1.0).abs() < 1e-3);
        assert_eq!(fit.inliers, matches.len());
    }

    #[test]
    fn test_rejects_outliers() {
        let mut matches = rotated_grid(-1.5, (0.0, 2.0));
        for m in matches.iter_mut().step_by(5) {
            m.to.0 += 40.0;
            m.to.1 -= 25.0;
        }
        let fit = estimate_similarity(&matches, &RansacConfig::default()).unwrap();
        assert!((fit.transform.rotation_deg() - 1.5).abs() < 0.1);
        assert!(fit.inliers < matches.len());
        assert!(fit.inliers >= matches.len() * 3 / 4);
    }

    #[test]
    fn test_deterministic() {
        let mut matches = rotated_grid(1.0, (0.0, 0.0));
        matches[3].to.0 += 30.0;
        let cfg = RansacConfig::default();
        let a = estimate_similarity(&matches, &cfg).unwrap();
        let b = estimate_similarity(&matches, &cfg).unwrap();
        assert_eq!(a, b);
    }

    #[test]
    fn test_too_few_points() {
        let matches = rotated_grid(0.0, (0.0, 0.0));
        assert!(estimate_similarity(&matches[..2], &RansacConfig::default()).is_none());
    }
}
