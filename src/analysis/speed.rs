// src/analysis/speed.rs
//
// Ego speed from road-surface motion.
//
// Two per-sample estimators run over the same road band:
//   - sparse: corners tracked by patch matching, median vertical shift
//   - dense:  pyramidal LK flow, 75th percentile of forward motion
// `Auto` reports the sparse estimate when it is successful and falls back
// to the dense one otherwise.

use super::ego_motion::{
    feature_speed, forward_speed, FeatureSpeedConfig, ForwardFlowConfig, GroundScale,
    PerspectiveBands, SpeedSample,
};
use super::features::{good_features, track_points, CornerConfig, PatchTrackConfig};
use super::optical_flow::{dense_flow, FlowConfig};
use super::speed_aggregator::{aggregate, speed_profile, AggregationConfig, ProfilePoint, SpeedEstimate};
use super::{SignalExtractor, StreamTiming};
use crate::detection::round_to;
use crate::error::{AnalysisError, Result};
use crate::types::{Frame, FractionalRect, GrayFrame};
use crate::video_processor::SamplingSpec;
use serde::{Deserialize, Serialize};
use tracing::{debug, info};

// ============================================================================
// CONFIGURATION
// ============================================================================

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum SpeedMethod {
    DenseFlow,
    SparseFeatures,
    Auto,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct SpeedConfig {
    pub method: SpeedMethod,
    pub sample_hz: f64,
    /// Processing width; the flow is rescaled to native pixels
    pub target_width: Option<usize>,
    /// Road band the motion is measured on
    pub roi: FractionalRect,
    /// Ground meters per native pixel in the mid band
    pub meters_per_pixel: f32,
    pub bands: PerspectiveBands,
    pub flow: FlowConfig,
    pub forward: ForwardFlowConfig,
    pub features: FeatureSpeedConfig,
    pub corners: CornerConfig,
    pub tracking: PatchTrackConfig,
    /// Re-detect corners when fewer tracked points survive
    pub min_tracked_points: usize,
    /// Reduction of sparse-feature samples
    pub aggregation: AggregationConfig,
    /// Reduction of dense-flow samples
    pub dense_aggregation: AggregationConfig,
}

impl Default for SpeedConfig {
    fn default() -> Self {
        Self {
            method: SpeedMethod::Auto,
            sample_hz: 5.0,
            target_width: Some(640),
            roi: FractionalRect::rows(0.6, 0.9),
            meters_per_pixel: 0.05,
            bands: PerspectiveBands::default(),
            flow: FlowConfig::default(),
            forward: ForwardFlowConfig::default(),
            features: FeatureSpeedConfig::default(),
            corners: CornerConfig::default(),
            tracking: PatchTrackConfig::default(),
            min_tracked_points: 10,
            aggregation: AggregationConfig::default(),
            dense_aggregation: AggregationConfig::dense(),
        }
    }
}

impl SpeedConfig {
    pub fn validate(&self) -> Result<()> {
        self.roi.validate("speed.roi")?;
        if self.sample_hz.is_nan() || self.sample_hz <= 0.0 {
            return Err(AnalysisError::InvalidConfig(
                "speed.sample_hz must be positive".into(),
            ));
        }
        if self.meters_per_pixel.is_nan() || self.meters_per_pixel <= 0.0 {
            return Err(AnalysisError::InvalidConfig(
                "speed.meters_per_pixel must be positive".into(),
            ));
        }
        Ok(())
    }
}

// ============================================================================
// RESULT
// ============================================================================

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct SpeedResult {
    pub average_speed_kmh: f64,
    pub confidence: f64,
    /// Estimator the reported value came from
    pub method: SpeedMethod,
    pub successful: bool,
    pub samples: usize,
    pub profile: Vec<ProfilePoint>,
}

// ============================================================================
// EXTRACTOR
// ============================================================================

pub struct SpeedExtractor {
    config: SpeedConfig,
    prev: Option<GrayFrame>,
    points: Vec<(f32, f32)>,
    dense: Vec<SpeedSample>,
    sparse: Vec<SpeedSample>,
}

impl SpeedExtractor {
    pub fn new(config: SpeedConfig) -> Self {
        Self {
            config,
            prev: None,
            points: Vec::new(),
            dense: Vec::new(),
            sparse: Vec::new(),
        }
    }

    fn runs(&self, method: SpeedMethod) -> bool {
        self.config.method == method || self.config.method == SpeedMethod::Auto
    }

    fn scale(&self, timing: &StreamTiming) -> GroundScale {
        GroundScale {
            meters_per_pixel: self.config.meters_per_pixel,
            native_scale: timing.width_scale(self.config.target_width),
            effective_hz: timing.effective_hz as f32,
            bands: self.config.bands,
        }
    }

    fn reduce(
        samples: &[SpeedSample],
        cfg: &AggregationConfig,
        timing: &StreamTiming,
    ) -> (SpeedEstimate, Vec<ProfilePoint>) {
        let estimate = match aggregate(samples, cfg) {
            Ok(e) => e,
            Err(e) => {
                debug!("Speed aggregation: {}", e);
                SpeedEstimate::zero()
            }
        };
        (estimate, speed_profile(samples, timing.effective_hz, cfg))
    }
}

impl SignalExtractor for SpeedExtractor {
    type Output = SpeedResult;

    fn name(&self) -> &'static str {
        "speed"
    }

    fn sampling(&self) -> SamplingSpec {
        SamplingSpec {
            target_hz: Some(self.config.sample_hz),
            target_width: self.config.target_width,
            crop: Some(self.config.roi),
        }
    }

    fn process(&mut self, frame: &Frame, timing: &StreamTiming) -> Result<()> {
        let gray = frame.to_gray();
        let Some(prev) = self.prev.take() else {
            self.prev = Some(gray);
            return Ok(());
        };
        let scale = self.scale(timing);

        if self.runs(SpeedMethod::DenseFlow) {
            let flow = dense_flow(&prev, &gray, &self.config.flow);
            self.dense
                .push(forward_speed(&flow, frame.timestamp, &scale, &self.config.forward));
        }

        if self.runs(SpeedMethod::SparseFeatures) {
            if self.points.len() < self.config.min_tracked_points {
                self.points = good_features(&prev, None, &self.config.corners);
            }
            let matches = track_points(&prev, &gray, &self.points, &self.config.tracking);
            if let Some(sample) = feature_speed(
                &matches,
                frame.timestamp,
                0.0,
                gray.height as f32,
                &scale,
                &self.config.features,
            ) {
                self.sparse.push(sample);
            }
            self.points = matches.iter().map(|m| m.to).collect();
        }

        self.prev = Some(gray);
        Ok(())
    }

    fn finish(self, timing: &StreamTiming) -> SpeedResult {
        let sparse_cfg = self.config.aggregation;
        let dense_cfg = self.config.dense_aggregation;
        let dense = || {
            (
                SpeedMethod::DenseFlow,
                Self::reduce(&self.dense, &dense_cfg, timing),
                self.dense.len(),
                dense_cfg,
            )
        };
        let (method, (estimate, profile), samples, agg) = match self.config.method {
            SpeedMethod::DenseFlow => dense(),
            SpeedMethod::SparseFeatures => (
                SpeedMethod::SparseFeatures,
                Self::reduce(&self.sparse, &sparse_cfg, timing),
                self.sparse.len(),
                sparse_cfg,
            ),
            SpeedMethod::Auto => {
                let sparse = Self::reduce(&self.sparse, &sparse_cfg, timing);
                if sparse.0.is_successful(&sparse_cfg) {
                    (SpeedMethod::SparseFeatures, sparse, self.sparse.len(), sparse_cfg)
                } else {
                    debug!(
                        "Sparse speed not reliable (confidence {:.2}), using dense flow",
                        sparse.0.confidence
                    );
                    dense()
                }
            }
        };

        info!(
            "🚗 Speed: {:.1} km/h (confidence {:.2}, {:?}, {} samples)",
            estimate.speed_kmh, estimate.confidence, method, samples
        );

        SpeedResult {
            average_speed_kmh: round_to(estimate.speed_kmh, 2),
            confidence: round_to(estimate.confidence, 2),
            method,
            successful: estimate.is_successful(&agg),
            samples,
            profile,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn timing() -> StreamTiming {
        StreamTiming {
            native_fps: 30.0,
            effective_hz: 5.0,
            native_width: 160,
        }
    }

    fn road(width: usize, height: usize, shift: usize) -> Frame {
        let mut data = Vec::with_capacity(width * height * 3);
        for y in 0..height {
            for x in 0..width {
                let yy = y as f32 - shift as f32;
                let v = 128.0 + 50.0 * (x as f32 * 0.13).sin() + 40.0 * (yy * 0.11).cos()
                    + 20.0 * ((x as f32 + yy) * 0.07).sin();
                let g = v.round().clamp(0.0, 255.0) as u8;
                data.extend_from_slice(&[g, g, g]);
            }
        }
        Frame::new(data, width, height, 0, 0.0)
    }

    #[test]
    fn test_static_scene_is_zero() {
        let mut ex = SpeedExtractor::new(SpeedConfig::default());
        let t = timing();
        for i in 0..6 {
            let mut f = road(160, 60, 0);
            f.timestamp = i as f64 * 0.2;
            ex.process(&f, &t).unwrap();
        }
        let r = ex.finish(&t);
        assert_eq!(r.average_speed_kmh, 0.0);
        assert_eq!(r.confidence, 0.0);
        assert!(!r.successful);
    }

    #[test]
    fn test_moving_road_gives_speed() {
        let cfg = SpeedConfig {
            method: SpeedMethod::DenseFlow,
            meters_per_pixel: 0.5,
            ..SpeedConfig::default()
        };
        let mut ex = SpeedExtractor::new(cfg);
        let t = timing();
        for i in 0..8 {
            let mut f = road(160, 60, 2 * i);
            f.timestamp = i as f64 * 0.2;
            ex.process(&f, &t).unwrap();
        }
        let r = ex.finish(&t);
        assert_eq!(r.method, SpeedMethod::DenseFlow);
        assert_eq!(r.samples, 7);
        // ~2 px/sample: 2 * 0.5 * w * 5 * 3.6 with band weight w in [0.6, 1.5]
        assert!(r.average_speed_kmh > 8.0 && r.average_speed_kmh < 35.0, "{}", r.average_speed_kmh);
        assert!(r.successful);
    }

    #[test]
    fn test_slow_crawl_is_measured() {
        // Same 2 px/sample motion at a tenth of the ground scale: ~1-3 km/h,
        // below the sparse plausibility floor
        let cfg = SpeedConfig {
            method: SpeedMethod::DenseFlow,
            meters_per_pixel: 0.05,
            ..SpeedConfig::default()
        };
        let mut ex = SpeedExtractor::new(cfg);
        let t = timing();
        for i in 0..8 {
            let mut f = road(160, 60, 2 * i);
            f.timestamp = i as f64 * 0.2;
            ex.process(&f, &t).unwrap();
        }
        let r = ex.finish(&t);
        assert!(r.average_speed_kmh > 0.5 && r.average_speed_kmh < 4.0, "{}", r.average_speed_kmh);
        assert!(r.confidence > 0.3);
        assert!(r.successful);
    }

    #[test]
    fn test_sampling_spec() {
        let ex = SpeedExtractor::new(SpeedConfig::default());
        let spec = ex.sampling();
        assert_eq!(spec.target_hz, Some(5.0));
        assert_eq!(spec.crop, Some(FractionalRect::rows(0.6, 0.9)));
    }

    #[test]
    fn test_validate() {
        let mut cfg = SpeedConfig::default();
        assert!(cfg.validate().is_ok());
        cfg.sample_hz = 0.0;
        assert!(cfg.validate().is_err());
    }
}
