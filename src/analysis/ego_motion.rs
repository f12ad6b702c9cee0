// src/analysis/ego_motion.rs
//
// Ego-motion signals derived from the road-surface motion field.
//
// Forward speed: while driving forward, road texture below the horizon
// streams DOWN the image. The 75th percentile of perspective-scaled
// downward flow, converted through meters-per-pixel and the sampling
// rate, gives a per-sample speed estimate.
//
// Lateral score: during a lane change the whole road patch slides
// sideways. Horizontal flow that clearly dominates vertical flow over a
// large enough area yields a signed score (positive = scene moving right).

use super::features::Correspondence;
use super::optical_flow::FlowField;
use crate::stats;
use serde::{Deserialize, Serialize};

// ============================================================================
// CONFIGURATION
// ============================================================================

/// Meters-per-pixel multipliers by vertical position inside the road ROI.
/// Rows near the top of the ROI are farther away and cover more ground.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct PerspectiveBands {
    /// ROI-relative row below which the far weight applies
    pub far_until: f32,
    /// ROI-relative row below which the mid weight applies
    pub mid_until: f32,
    pub far_weight: f32,
    pub mid_weight: f32,
    pub near_weight: f32,
}

impl Default for PerspectiveBands {
    fn default() -> Self {
        Self {
            far_until: 1.0 / 3.0,
            mid_until: 2.0 / 3.0,
            far_weight: 1.5,
            mid_weight: 1.0,
            near_weight: 0.6,
        }
    }
}

impl PerspectiveBands {
    #[inline]
    pub fn weight(&self, row_norm: f32) -> f32 {
        if row_norm < self.far_until {
            self.far_weight
        } else if row_norm < self.mid_until {
            self.mid_weight
        } else {
            self.near_weight
        }
    }
}

/// Conversion from processed-frame pixels to ground speed.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct GroundScale {
    /// Meters per pixel at native resolution (mid band)
    pub meters_per_pixel: f32,
    /// native_width / processed_width
    pub native_scale: f32,
    /// Sampled frames per second
    pub effective_hz: f32,
    pub bands: PerspectiveBands,
}

impl GroundScale {
    /// Pixels per sample at `row_norm` → km/h
    #[inline]
    pub fn kmh(&self, px: f32, row_norm: f32) -> f32 {
        px * self.native_scale * self.meters_per_pixel * self.bands.weight(row_norm)
            * self.effective_hz
            * 3.6
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct ForwardFlowConfig {
    /// Flow magnitude floor (processed px) for a pixel to count
    pub min_flow_px: f32,
    /// Percentile of per-pixel speeds reported for the sample
    pub percentile: f64,
    pub max_speed_kmh: f32,
    /// ROI coverage at which the coverage term of the confidence saturates
    pub full_coverage: f32,
    /// Native-pixel displacement at which the magnitude term saturates
    pub full_displacement_px: f32,
}

impl Default for ForwardFlowConfig {
    fn default() -> Self {
        Self {
            min_flow_px: 0.1,
            percentile: 75.0,
            max_speed_kmh: 150.0,
            full_coverage: 0.5,
            full_displacement_px: 10.0,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct LateralFlowConfig {
    /// Flow magnitude (processed px) for a pixel to count as moving
    pub magnitude_threshold: f32,
    /// Minimum fraction of moving pixels
    pub min_coverage: f32,
    /// |mean_u| must exceed this multiple of |mean_v|
    pub dominance_ratio: f32,
    /// Minimum |mean_u| in processed px
    pub min_mean_u: f32,
}

impl Default for LateralFlowConfig {
    fn default() -> Self {
        Self {
            magnitude_threshold: 2.0,
            min_coverage: 0.10,
            dominance_ratio: 1.2,
            min_mean_u: 0.8,
        }
    }
}

// ============================================================================
// TYPES
// ============================================================================

/// One per-sample speed estimate.
#[derive(Debug, Clone, Copy, PartialEq, Serialize)]
pub struct SpeedSample {
    pub time: f64,
    pub speed_kmh: f64,
    pub confidence: f64,
}

// ============================================================================
// SIGNALS
// ============================================================================

fn confidence(coverage_term: f32, displacement_term: f32) -> f64 {
    (0.6 * coverage_term.clamp(0.0, 1.0) + 0.4 * displacement_term.clamp(0.0, 1.0)) as f64
}

/// Speed sample from a dense flow field over the road ROI. A field with no
/// forward motion yields speed 0 and confidence 0.
pub fn forward_speed(
    flow: &FlowField,
    time: f64,
    scale: &GroundScale,
    cfg: &ForwardFlowConfig,
) -> SpeedSample {
    let rows = flow.height().max(1) as f32;
    let total = (flow.width() * flow.height()).max(1) as f32;

    let mut speeds: Vec<f64> = Vec::new();
    let mut displacements: Vec<f64> = Vec::new();
    for (_, y, u, v) in flow.vectors() {
        if v <= 0.0 {
            continue;
        }
        let mag = (u * u + v * v).sqrt();
        if mag <= cfg.min_flow_px {
            continue;
        }
        let row_norm = y as f32 / rows;
        speeds.push(scale.kmh(mag, row_norm) as f64);
        displacements.push((mag * scale.native_scale) as f64);
    }

    if speeds.is_empty() {
        return SpeedSample {
            time,
            speed_kmh: 0.0,
            confidence: 0.0,
        };
    }

    let speed = stats::percentile(&speeds, cfg.percentile)
        .unwrap_or(0.0)
        .clamp(0.0, cfg.max_speed_kmh as f64);
    let disp = stats::percentile(&displacements, cfg.percentile).unwrap_or(0.0) as f32;
    let coverage = speeds.len() as f32 / total;

    SpeedSample {
        time,
        speed_kmh: speed,
        confidence: confidence(
            coverage / cfg.full_coverage,
            disp / cfg.full_displacement_px,
        ),
    }
}

/// Signed lateral-motion score: mean_u / (|mean_v| + ε) when horizontal
/// motion clearly dominates, else 0.
pub fn lateral_score(flow: &FlowField, cfg: &LateralFlowConfig) -> f32 {
    let total = flow.width() * flow.height();
    if total == 0 {
        return 0.0;
    }

    let (mut sum_u, mut sum_v, mut count) = (0.0f64, 0.0f64, 0usize);
    for (_, _, u, v) in flow.vectors() {
        if (u * u + v * v).sqrt() > cfg.magnitude_threshold {
            sum_u += u as f64;
            sum_v += v as f64;
            count += 1;
        }
    }

    let coverage = count as f32 / total as f32;
    if count == 0 || coverage <= cfg.min_coverage {
        return 0.0;
    }
    let mean_u = (sum_u / count as f64) as f32;
    let mean_v = (sum_v / count as f64) as f32;

    if mean_u.abs() > cfg.dominance_ratio * mean_v.abs() && mean_u.abs() > cfg.min_mean_u {
        mean_u / (mean_v.abs() + 1e-6)
    } else {
        0.0
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct FeatureSpeedConfig {
    /// Median vertical displacement (processed px) below which the
    /// vehicle is treated as stationary and no sample is produced
    pub min_displacement_px: f32,
    /// Inliers lie within this many standard deviations of the median
    pub inlier_sigma: f32,
    /// Fewer inliers than this yields no sample
    pub min_inliers: usize,
    /// Inlier count at which the count term of the confidence saturates
    pub full_inliers: usize,
    pub max_speed_kmh: f32,
}

impl Default for FeatureSpeedConfig {
    fn default() -> Self {
        Self {
            min_displacement_px: 0.5,
            inlier_sigma: 2.0,
            min_inliers: 5,
            full_inliers: 50,
            max_speed_kmh: 150.0,
        }
    }
}

/// Speed sample from tracked road features. `roi_top`/`roi_height` locate
/// the road band in processed pixels for the perspective weight.
pub fn feature_speed(
    matches: &[Correspondence],
    time: f64,
    roi_top: f32,
    roi_height: f32,
    scale: &GroundScale,
    cfg: &FeatureSpeedConfig,
) -> Option<SpeedSample> {
    if matches.is_empty() {
        return None;
    }
    let dys: Vec<f64> = matches.iter().map(|m| m.dy() as f64).collect();
    let med = stats::median(&dys)?;
    let sd = stats::std_dev(&dys)?;
    let band = cfg.inlier_sigma as f64 * sd;

    let inliers: Vec<&Correspondence> = matches
        .iter()
        .filter(|m| sd <= 1e-9 || (m.dy() as f64 - med).abs() <= band)
        .collect();
    if inliers.len() < cfg.min_inliers.max(1) {
        return None;
    }
    let inlier_dy: Vec<f64> = inliers.iter().map(|m| m.dy() as f64).collect();
    let d = stats::median(&inlier_dy)? as f32;
    if d.abs() < cfg.min_displacement_px {
        return None;
    }

    let mean_y = inliers.iter().map(|m| m.from.1).sum::<f32>() / inliers.len() as f32;
    let row_norm = ((mean_y - roi_top) / roi_height.max(1.0)).clamp(0.0, 1.0);
    let speed = scale.kmh(d.abs(), row_norm);
    if !(0.0..=cfg.max_speed_kmh).contains(&speed) {
        return None;
    }

    Some(SpeedSample {
        time,
        speed_kmh: speed as f64,
        confidence: confidence(
            inliers.len() as f32 / cfg.full_inliers.max(1) as f32,
            d.abs() * scale.native_scale / 10.0,
        ),
    })
}
