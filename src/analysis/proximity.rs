// src/analysis/proximity.rs
//
// Close encounters from tracked vehicles.
//
// Per sampled frame: detector + tracker → per-track history of monocular
// distance estimates. Once a track is long enough, time-to-collision comes
// from the distance trend and lateral drift from the center trend. A track
// is dangerous when it is close, frontal, approaching (or critically close)
// and not merely passing. Each dangerous track becomes one event spanning
// its whole history, peaked at its highest danger score.

use super::vehicle_tracker::{ObjectTracker, TrackedObject, TrackerConfig};
use super::{CapabilityStatus, SignalExtractor, StreamTiming};
use crate::detection::{finalize_events, round_to, Event, FinalizeConfig};
use crate::error::{AnalysisError, Result};
use crate::stats;
use crate::types::{bbox_center, bbox_height, BBox, Frame, Location};
use crate::vehicle_detection::Detector;
use serde::{Deserialize, Serialize};
use serde_json::{json, Map, Value};
use std::collections::BTreeMap;
use std::sync::Arc;
use tracing::{debug, info, warn};

// ============================================================================
// CONFIGURATION
// ============================================================================

/// Typical real-world vehicle heights in meters, by class name.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct VehicleHeights {
    pub car: f32,
    pub truck: f32,
    pub bus: f32,
    pub motorcycle: f32,
    pub default: f32,
}

impl Default for VehicleHeights {
    fn default() -> Self {
        Self {
            car: 1.5,
            truck: 3.0,
            bus: 3.5,
            motorcycle: 1.2,
            default: 1.5,
        }
    }
}

impl VehicleHeights {
    pub fn for_class(&self, class_name: &str) -> f32 {
        match class_name {
            "car" => self.car,
            "truck" => self.truck,
            "bus" => self.bus,
            "motorcycle" => self.motorcycle,
            _ => self.default,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct ProximityConfig {
    pub sample_hz: f64,
    pub target_width: Option<usize>,
    pub min_confidence: f32,
    /// Boxes shorter than this fraction of frame height are ignored
    pub min_box_height_ratio: f32,
    pub dangerous_distance_m: f64,
    pub critical_distance_m: f64,
    pub ttc_threshold_sec: f64,
    /// Samples a track needs before it is evaluated
    pub min_track_samples: usize,
    /// Trailing samples used for the distance and center trends
    pub trend_window: usize,
    /// Closing rate (m/s) below which a track is not approaching
    pub min_closing_rate: f64,
    /// Horizontal center drift (fraction of width) that marks a passing track
    pub lateral_ratio: f32,
    /// Horizontal band (fractions of width) counted as frontal
    pub frontal_band: (f32, f32),
    /// Horizon line as a fraction of frame height
    pub horizon_ratio: f32,
    /// Distance multiplier for boxes centered above the horizon
    pub above_horizon_factor: f32,
    pub min_distance_m: f32,
    pub max_distance_m: f32,
    pub camera_fov_deg: f32,
    pub heights: VehicleHeights,
    /// Left/right split points (fractions of width) for event location
    pub location_splits: (f32, f32),
    pub tracker: TrackerConfig,
    pub finalize: FinalizeConfig,
}

impl Default for ProximityConfig {
    fn default() -> Self {
        Self {
            sample_hz: 15.0,
            target_width: None,
            min_confidence: 0.3,
            min_box_height_ratio: 0.20,
            dangerous_distance_m: 15.0,
            critical_distance_m: 8.0,
            ttc_threshold_sec: 4.0,
            min_track_samples: 5,
            trend_window: 5,
            min_closing_rate: 0.1,
            lateral_ratio: 0.3,
            frontal_band: (0.3, 0.7),
            horizon_ratio: 0.45,
            above_horizon_factor: 1.5,
            min_distance_m: 1.0,
            max_distance_m: 100.0,
            camera_fov_deg: 90.0,
            heights: VehicleHeights::default(),
            location_splits: (0.33, 0.67),
            tracker: TrackerConfig::default(),
            finalize: FinalizeConfig {
                min_duration_secs: 0.2,
                merge_gap_secs: None,
            },
        }
    }
}

impl ProximityConfig {
    pub fn validate(&self) -> Result<()> {
        if !(1.0..179.0).contains(&self.camera_fov_deg) {
            return Err(AnalysisError::InvalidConfig(format!(
                "proximity.camera_fov_deg {} out of range",
                self.camera_fov_deg
            )));
        }
        if self.min_distance_m <= 0.0 || self.min_distance_m >= self.max_distance_m {
            return Err(AnalysisError::InvalidConfig(
                "proximity distance clamp must satisfy 0 < min < max".into(),
            ));
        }
        if self.trend_window < 2 {
            return Err(AnalysisError::InvalidConfig(
                "proximity.trend_window must be at least 2".into(),
            ));
        }
        Ok(())
    }

    /// Focal length in pixels for a frame `width` wide.
    pub fn focal_px(&self, width: f32) -> f32 {
        width / (2.0 * (self.camera_fov_deg.to_radians() / 2.0).tan())
    }
}

// ============================================================================
// GEOMETRY
// ============================================================================

/// Pinhole distance from box height, pushed out for boxes above the
/// horizon, clamped to the configured range.
pub fn estimate_distance(bbox: &BBox, class_name: &str, frame_w: f32, frame_h: f32, cfg: &ProximityConfig) -> f32 {
    let h = bbox_height(bbox);
    if h <= 0.0 {
        return cfg.max_distance_m;
    }
    let mut distance = cfg.heights.for_class(class_name) * cfg.focal_px(frame_w) / h;
    if bbox_center(bbox).1 < frame_h * cfg.horizon_ratio {
        distance *= cfg.above_horizon_factor;
    }
    distance.clamp(cfg.min_distance_m, cfg.max_distance_m)
}

#[derive(Debug, Clone, Copy, PartialEq)]
pub struct TrackSample {
    pub time: f64,
    pub bbox: BBox,
    pub distance: f32,
    pub center: (f32, f32),
}

fn trailing<'a>(history: &'a [TrackSample], window: usize) -> &'a [TrackSample] {
    &history[history.len().saturating_sub(window)..]
}

/// Seconds to collision from the trailing distance trend; `None` when the
/// track is not closing in faster than `min_closing_rate`.
pub fn time_to_collision(history: &[TrackSample], cfg: &ProximityConfig) -> Option<f64> {
    let recent = trailing(history, cfg.trend_window);
    if recent.len() < 2 {
        return None;
    }
    let t0 = recent[0].time;
    let ts: Vec<f64> = recent.iter().map(|s| s.time - t0).collect();
    let ds: Vec<f64> = recent.iter().map(|s| s.distance as f64).collect();
    let slope = stats::linear_slope(&ts, &ds)?;
    if slope >= -cfg.min_closing_rate {
        return None;
    }
    let current = *ds.last()?;
    Some(current / slope.abs())
}

/// Whether the track drifted sideways across the trailing window.
pub fn is_lateral(history: &[TrackSample], frame_w: f32, cfg: &ProximityConfig) -> bool {
    let recent = trailing(history, cfg.trend_window);
    match (recent.first(), recent.last()) {
        (Some(a), Some(b)) if recent.len() >= 2 => (b.center.0 - a.center.0).abs() > frame_w * cfg.lateral_ratio,
        _ => false,
    }
}

// ============================================================================
// TRACK RECORDS
// ============================================================================

#[derive(Debug, Clone, Copy, PartialEq)]
struct DangerPeak {
    time: f64,
    score: f64,
    ttc: Option<f64>,
}

#[derive(Debug, Clone)]
struct TrackRecord {
    class_name: String,
    history: Vec<TrackSample>,
    min_distance: f32,
    max_box_height_norm: f32,
    peak: Option<DangerPeak>,
}

impl TrackRecord {
    fn new(class_name: String) -> Self {
        Self {
            class_name,
            history: Vec::new(),
            min_distance: f32::INFINITY,
            max_box_height_norm: 0.0,
            peak: None,
        }
    }
}

// ============================================================================
// EXTRACTOR
// ============================================================================

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct ProximityResult {
    pub status: CapabilityStatus,
    pub method: String,
    pub close_encounters: Vec<Event>,
    pub event_count: usize,
}

pub struct ProximityExtractor {
    config: ProximityConfig,
    tracker: Option<ObjectTracker>,
    tracks: BTreeMap<u32, TrackRecord>,
    frame_size: (f32, f32),
}

impl ProximityExtractor {
    pub fn new(config: ProximityConfig, detector: Option<Arc<dyn Detector>>) -> Self {
        if detector.is_none() {
            warn!("⚠️  Proximity: no detector available, reporting no encounters");
        }
        let tracker = detector
            .map(|d| ObjectTracker::new(d, config.tracker.clone(), config.min_confidence));
        Self {
            config,
            tracker,
            tracks: BTreeMap::new(),
            frame_size: (0.0, 0.0),
        }
    }

    /// Feed the tracked vehicles of one sampled frame.
    pub fn observe(&mut self, time: f64, frame_w: f32, frame_h: f32, objects: &[TrackedObject]) {
        self.frame_size = (frame_w, frame_h);
        let cfg = &self.config;

        for obj in objects {
            let box_h = bbox_height(&obj.bbox);
            if box_h < frame_h * cfg.min_box_height_ratio {
                continue;
            }
            let distance = estimate_distance(&obj.bbox, &obj.class_name, frame_w, frame_h, cfg);
            let center = bbox_center(&obj.bbox);
            let box_norm = box_h / frame_h.max(1.0);

            let record = self
                .tracks
                .entry(obj.track_id)
                .or_insert_with(|| TrackRecord::new(obj.class_name.clone()));
            record.history.push(TrackSample {
                time,
                bbox: obj.bbox,
                distance,
                center,
            });
            record.min_distance = record.min_distance.min(distance);
            record.max_box_height_norm = record.max_box_height_norm.max(box_norm);

            if record.history.len() < cfg.min_track_samples {
                continue;
            }

            let ttc = time_to_collision(&record.history, cfg);
            let lateral = is_lateral(&record.history, frame_w, cfg);
            let frontal = center.0 > frame_w * cfg.frontal_band.0 && center.0 < frame_w * cfg.frontal_band.1;
            let d = distance as f64;
            let close = d < cfg.dangerous_distance_m;
            let critical = d < cfg.critical_distance_m;
            let approaching = ttc.is_some_and(|t| t < cfg.ttc_threshold_sec);

            if !(close && frontal && (approaching || critical) && !lateral) {
                continue;
            }

            let ttc_factor = ttc.map_or(0.5, |t| 1.0 / t.max(0.5));
            let score = 0.5 / d.max(0.5) + 0.3 * ttc_factor + 0.2 * box_norm as f64;
            if record.peak.map_or(true, |p| score > p.score) {
                debug!(
                    "⚠️  Track {} dangerous at {:.2}s: d={:.1}m ttc={:?} score={:.3}",
                    obj.track_id, time, d, ttc, score
                );
                record.peak = Some(DangerPeak { time, score, ttc });
            }
        }
    }

    fn location(&self, record: &TrackRecord) -> Location {
        let xs: Vec<f64> = record.history.iter().map(|s| s.center.0 as f64).collect();
        let mean_x = stats::mean(&xs).unwrap_or(0.0) as f32;
        let w = self.frame_size.0.max(1.0);
        Location::from_ratio(mean_x / w, self.config.location_splits.0, self.config.location_splits.1)
    }

    fn encounter(&self, track_id: u32, record: &TrackRecord) -> Option<Event> {
        let peak = record.peak?;
        let first = record.history.first()?;
        let last = record.history.last()?;

        let mut extra = Map::new();
        extra.insert(
            "max_box_height_norm".into(),
            json!(round_to(record.max_box_height_norm as f64, 3)),
        );
        extra.insert(
            "min_distance_m".into(),
            json!(round_to(record.min_distance as f64, 2)),
        );
        extra.insert(
            "ttc_sec".into(),
            peak.ttc.map_or(Value::Null, |t| json!(round_to(t, 2))),
        );
        extra.insert("track_id".into(), json!(track_id));
        extra.insert("class".into(), json!(record.class_name));

        Some(Event {
            start_time: first.time,
            end_time: last.time,
            peak_time: peak.time,
            peak_score: peak.score.min(1.0) as f32,
            direction: None,
            location: Some(self.location(record)),
            extra,
        })
    }
}

impl SignalExtractor for ProximityExtractor {
    type Output = ProximityResult;

    fn name(&self) -> &'static str {
        "proximity"
    }

    fn sampling(&self) -> crate::video_processor::SamplingSpec {
        crate::video_processor::SamplingSpec {
            target_hz: Some(self.config.sample_hz),
            target_width: self.config.target_width,
            crop: None,
        }
    }

    fn process(&mut self, frame: &Frame, _timing: &StreamTiming) -> Result<()> {
        let Some(tracker) = self.tracker.as_mut() else {
            return Ok(());
        };
        let objects = match tracker.track(frame) {
            Ok(objects) => objects,
            Err(e) => {
                warn!("⚠️  Frame {}: detector failed, skipping: {}", frame.index, e);
                return Ok(());
            }
        };
        self.observe(frame.timestamp, frame.width as f32, frame.height as f32, &objects);
        Ok(())
    }

    fn finish(self, _timing: &StreamTiming) -> ProximityResult {
        let Some(tracker) = self.tracker.as_ref() else {
            return ProximityResult {
                status: CapabilityStatus::CapabilityUnavailable,
                method: "unavailable".into(),
                close_encounters: Vec::new(),
                event_count: 0,
            };
        };
        let method = format!("{}+iou_tracking", tracker.detector_name());

        let raw: Vec<Event> = self
            .tracks
            .iter()
            .filter_map(|(&id, record)| self.encounter(id, record))
            .collect();
        let events = finalize_events(raw, &self.config.finalize);
        info!(
            "🚨 Close encounters: {} ({} tracks seen)",
            events.len(),
            self.tracks.len()
        );

        ProximityResult {
            status: CapabilityStatus::Ok,
            method,
            event_count: events.len(),
            close_encounters: events,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::vehicle_detection::{Detection, FlakyDetector, ScriptedDetector};

    const W: f32 = 1280.0;
    const H: f32 = 720.0;

    fn obj(id: u32, bbox: BBox) -> TrackedObject {
        TrackedObject {
            track_id: id,
            class_id: 2,
            class_name: "car".into(),
            bbox,
            confidence: 0.9,
        }
    }

    /// Centered car box of height `h` with its center at y = 450.
    fn centered(h: f32, cx: f32) -> BBox {
        [cx - h, 450.0 - h / 2.0, cx + h, 450.0 + h / 2.0]
    }

    fn extractor(cfg: ProximityConfig) -> ProximityExtractor {
        ProximityExtractor::new(cfg, Some(Arc::new(ScriptedDetector::new())))
    }

    fn timing() -> StreamTiming {
        StreamTiming {
            native_fps: 30.0,
            effective_hz: 15.0,
            native_width: 1280,
        }
    }

    #[test]
    fn test_distance_model() {
        let cfg = ProximityConfig::default();
        // focal = 640 px at 90° FOV; 1.5 m car at 96 px → 10 m
        let d = estimate_distance(&centered(96.0, 640.0), "car", W, H, &cfg);
        assert!((d - 10.0).abs() < 1e-3);
        // Above the horizon the estimate is pushed out
        let high = [600.0, 100.0, 680.0, 196.0];
        assert!((estimate_distance(&high, "car", W, H, &cfg) - 15.0).abs() < 1e-3);
        // Clamped
        assert_eq!(estimate_distance(&centered(2000.0, 640.0), "car", W, H, &cfg), 1.0);
    }

    #[test]
    fn test_constant_distance_never_dangerous() {
        let cfg = ProximityConfig {
            min_box_height_ratio: 0.0,
            ..ProximityConfig::default()
        };
        let mut ex = extractor(cfg);
        // 1.5 * 640 / 19.2 = 50 m
        for i in 0..30 {
            ex.observe(i as f64 / 15.0, W, H, &[obj(1, centered(19.2, 640.0))]);
        }
        let r = ex.finish(&timing());
        assert_eq!(r.status, CapabilityStatus::Ok);
        assert_eq!(r.event_count, 0);
    }

    #[test]
    fn test_approaching_vehicle_is_encounter() {
        let mut ex = extractor(ProximityConfig::default());
        for i in 0..10 {
            let h = 150.0 + 16.0 * i as f32;
            ex.observe(i as f64 / 15.0, W, H, &[obj(7, centered(h, 640.0))]);
        }
        let r = ex.finish(&timing());
        assert_eq!(r.event_count, 1);
        let e = &r.close_encounters[0];
        assert_eq!(e.location, Some(Location::Center));
        assert_eq!(e.start_time, 0.0);
        assert!((e.end_time - 9.0 / 15.0).abs() < 1e-9);
        assert!(e.is_well_ordered());
        assert!(e.peak_score > 0.0 && e.peak_score <= 1.0);
        assert_eq!(e.extra["track_id"], json!(7));
        assert_eq!(e.extra["class"], json!("car"));
        assert!(e.extra["ttc_sec"].is_number());
    }

    #[test]
    fn test_lateral_track_not_dangerous() {
        let mut ex = extractor(ProximityConfig::default());
        for i in 0..10 {
            let h = 150.0 + 16.0 * i as f32;
            // Sweeps across the frontal band quickly
            let cx = 400.0 + 100.0 * i as f32;
            ex.observe(i as f64 / 15.0, W, H, &[obj(3, centered(h, cx))]);
        }
        assert_eq!(ex.finish(&timing()).event_count, 0);
    }

    #[test]
    fn test_small_boxes_ignored() {
        let mut ex = extractor(ProximityConfig::default());
        for i in 0..10 {
            ex.observe(i as f64 / 15.0, W, H, &[obj(1, centered(100.0, 640.0))]);
        }
        let r = ex.finish(&timing());
        assert_eq!(r.event_count, 0);
    }

    #[test]
    fn test_missing_detector_degrades() {
        let mut ex = ProximityExtractor::new(ProximityConfig::default(), None);
        let frame = Frame::new(vec![0; 12], 2, 2, 0, 0.0);
        ex.process(&frame, &timing()).unwrap();
        let r = ex.finish(&timing());
        assert_eq!(r.status, CapabilityStatus::CapabilityUnavailable);
        assert_eq!(r.event_count, 0);
    }

    #[test]
    fn test_ttc_requires_closing() {
        let cfg = ProximityConfig::default();
        let hist: Vec<TrackSample> = (0..5)
            .map(|i| TrackSample {
                time: i as f64 * 0.1,
                bbox: [0.0; 4],
                distance: 10.0 - i as f32,
                center: (0.0, 0.0),
            })
            .collect();
        // Closing at 10 m/s from 6 m
        let ttc = time_to_collision(&hist, &cfg).unwrap();
        assert!((ttc - 0.6).abs() < 1e-6);

        let receding: Vec<TrackSample> = hist
            .iter()
            .map(|s| TrackSample {
                distance: 20.0 - s.distance,
                ..*s
            })
            .collect();
        assert!(time_to_collision(&receding, &cfg).is_none());
    }

    #[test]
    fn test_detector_failure_skips_frame() {
        let mut script = ScriptedDetector::new();
        for i in 0..10u64 {
            let h = 150.0 + 16.0 * i as f32;
            script = script.with_frame(i, vec![Detection::new(centered(h, 640.0), 0.9, 2)]);
        }
        let detector = FlakyDetector {
            inner: script,
            fail_on: vec![4],
        };
        let mut ex = ProximityExtractor::new(ProximityConfig::default(), Some(Arc::new(detector)));
        let t = timing();
        for i in 0..10u64 {
            let frame = Frame::new(vec![0; 1280 * 720 * 3], 1280, 720, i, i as f64 / 15.0);
            assert!(ex.process(&frame, &t).is_ok());
        }
        let r = ex.finish(&t);
        assert_eq!(r.status, CapabilityStatus::Ok);
        assert_eq!(r.event_count, 1);
        let e = &r.close_encounters[0];
        assert_eq!(e.start_time, 0.0);
        assert!((e.end_time - 9.0 / 15.0).abs() < 1e-9);
        // The gap did not split the track
        assert_eq!(e.extra["track_id"], json!(1));
    }
}
