// src/analysis/band_encounters.rs
//
// Close encounters from the lower frame bands.
//
// Three overlapping horizontal bands (left / center / right) sit in the
// lower part of the frame. Per sample and per band:
//   score = tallest overlapping vehicle box (÷ band height)
//         + weight × max(median radial feature expansion, 0)
// Each band score is EMA-smoothed and kept in a short rolling baseline.
// The fused score is the strongest band; it enters over the median of the
// band baselines, needs a rising edge and a tall enough box to arm.

use super::features::{good_features, track_points, CornerConfig, PatchTrackConfig};
use super::vehicle_tracker::{ObjectTracker, TrackedObject, TrackerConfig};
use super::{CapabilityStatus, SignalExtractor, StreamTiming};
use crate::detection::{
    finalize_events, round_to, EntryStamp, Event, FinalizeConfig, HysteresisConfig,
    HysteresisMachine, Observation, PeakAttributes,
};
use crate::error::{AnalysisError, Result};
use crate::smoother::{Ema, EmaSeed, RollingMedian};
use crate::stats;
use crate::types::{bbox_center, Frame, FractionalRect, GrayFrame, Location, PixelRect};
use crate::vehicle_detection::Detector;
use crate::video_processor::SamplingSpec;
use serde::{Deserialize, Serialize};
use std::sync::Arc;
use tracing::{debug, info, warn};

const BAND_LOCATIONS: [Location; 3] = [Location::Left, Location::Center, Location::Right];

// ============================================================================
// CONFIGURATION
// ============================================================================

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct BandEncounterConfig {
    pub sample_hz: f64,
    pub target_width: Option<usize>,
    pub min_confidence: f32,
    /// Vertical extent shared by all bands (fractions of height)
    pub band_rows: (f32, f32),
    /// Left, center and right horizontal extents (fractions of width)
    pub band_columns: [(f32, f32); 3],
    /// Boxes centered outside this horizontal range are ignored
    pub center_columns: (f32, f32),
    /// Boxes centered above this height fraction are ignored
    pub min_center_row: f32,
    pub ema_alpha: f32,
    pub baseline_secs: f64,
    pub expansion_weight: f32,
    /// Fewer tracked features than this yields zero expansion
    pub min_expansion_points: usize,
    pub corners: CornerConfig,
    pub tracking: PatchTrackConfig,
    /// Offsets over the baseline; `min_rise` and `min_evidence` gate arming
    pub hysteresis: HysteresisConfig,
    pub tracker: TrackerConfig,
    pub finalize: FinalizeConfig,
}

impl Default for BandEncounterConfig {
    fn default() -> Self {
        Self {
            sample_hz: 8.0,
            target_width: Some(896),
            min_confidence: 0.25,
            band_rows: (0.60, 0.95),
            band_columns: [(0.12, 0.40), (0.35, 0.65), (0.60, 0.88)],
            center_columns: (0.22, 0.78),
            min_center_row: 0.45,
            ema_alpha: 0.25,
            baseline_secs: 1.5,
            expansion_weight: 1.0,
            min_expansion_points: 6,
            corners: CornerConfig {
                max_corners: 250,
                ..CornerConfig::default()
            },
            tracking: PatchTrackConfig::default(),
            hysteresis: HysteresisConfig {
                enter_threshold: 0.18,
                exit_threshold: 0.10,
                min_rise: Some(0.04),
                min_evidence: Some(0.14 * 0.9),
                arm_samples: 1,
                release_samples: 1,
                signed: false,
                entry_stamp: EntryStamp::Confirmation,
                ..HysteresisConfig::default()
            },
            tracker: TrackerConfig::default(),
            finalize: FinalizeConfig {
                min_duration_secs: 0.2,
                merge_gap_secs: Some(2.0),
            },
        }
    }
}

impl BandEncounterConfig {
    pub fn validate(&self) -> Result<()> {
        for (i, &(l, r)) in self.band_columns.iter().enumerate() {
            self.band_rect(l, r).validate(&format!("band_encounters.band_columns[{i}]"))?;
        }
        self.hysteresis.validate("band_encounters.hysteresis")?;
        if !(0.0..=1.0).contains(&self.ema_alpha) || self.ema_alpha == 0.0 {
            return Err(AnalysisError::InvalidConfig(
                "band_encounters.ema_alpha must lie in (0, 1]".into(),
            ));
        }
        Ok(())
    }

    fn band_rect(&self, left: f32, right: f32) -> FractionalRect {
        FractionalRect::new(left, self.band_rows.0, right, self.band_rows.1)
    }

    fn baseline_window(&self) -> usize {
        ((self.baseline_secs * self.sample_hz) as usize).max(3)
    }
}

// ============================================================================
// BAND GEOMETRY
// ============================================================================

/// Tallest box overlapping each band, as a fraction of the band height.
pub fn band_box_heights(bands: &[PixelRect; 3], objects: &[TrackedObject]) -> [f32; 3] {
    let mut out = [0.0f32; 3];
    for (slot, band) in out.iter_mut().zip(bands) {
        let (bx0, by0) = (band.x as f32, band.y as f32);
        let (bx1, by1) = (bx0 + band.width as f32, by0 + band.height as f32);
        for obj in objects {
            let [x0, y0, x1, y1] = obj.bbox;
            if x1.min(bx1) > x0.max(bx0) && y1.min(by1) > y0.max(by0) {
                *slot = slot.max((y1 - y0) / band.height.max(1) as f32);
            }
        }
    }
    out
}

/// Median radial motion of features inside `band`, relative to the band
/// center and normalized by its larger side. Positive means expanding.
pub fn radial_expansion(
    prev: &GrayFrame,
    cur: &GrayFrame,
    band: PixelRect,
    cfg: &BandEncounterConfig,
) -> f32 {
    let points = good_features(prev, Some(band), &cfg.corners);
    if points.len() < cfg.min_expansion_points {
        return 0.0;
    }
    let matches = track_points(prev, cur, &points, &cfg.tracking);
    if matches.len() < cfg.min_expansion_points {
        return 0.0;
    }

    let cx = band.x as f32 + band.width as f32 / 2.0;
    let cy = band.y as f32 + band.height as f32 / 2.0;
    let scale = band.width.max(band.height).max(1) as f32;
    let radial: Vec<f32> = matches
        .iter()
        .map(|m| {
            let (rx, ry) = (m.from.0 - cx, m.from.1 - cy);
            let norm = (rx * rx + ry * ry).sqrt() + 1e-6;
            (m.dx() * rx + m.dy() * ry) / norm / scale
        })
        .collect();
    stats::median_f32(&radial).unwrap_or(0.0)
}

// ============================================================================
// EXTRACTOR
// ============================================================================

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct BandEncounterResult {
    pub status: CapabilityStatus,
    pub method: String,
    pub close_encounters: Vec<Event>,
    pub event_count: usize,
}

pub struct BandEncounterExtractor {
    config: BandEncounterConfig,
    tracker: Option<ObjectTracker>,
    ema: [Ema; 3],
    baselines: [RollingMedian; 3],
    machine: HysteresisMachine,
    prev: Option<GrayFrame>,
}

impl BandEncounterExtractor {
    pub fn new(config: BandEncounterConfig, detector: Option<Arc<dyn Detector>>) -> Self {
        if detector.is_none() {
            warn!("⚠️  Band encounters: no detector available, reporting no encounters");
        }
        let tracker = detector
            .map(|d| ObjectTracker::new(d, config.tracker.clone(), config.min_confidence));
        let window = config.baseline_window();
        let alpha = config.ema_alpha;
        Self {
            tracker,
            ema: std::array::from_fn(|_| Ema::new(alpha, EmaSeed::FirstSample)),
            baselines: std::array::from_fn(|_| RollingMedian::new(window)),
            machine: HysteresisMachine::new(config.hysteresis.clone()),
            config,
            prev: None,
        }
    }

    fn bands(&self, width: usize, height: usize) -> [PixelRect; 3] {
        self.config
            .band_columns
            .map(|(l, r)| self.config.band_rect(l, r).resolve(width, height))
    }

    /// Vehicles centered in the lower middle of the frame.
    fn relevant(&self, objects: &[TrackedObject], width: f32, height: f32) -> Vec<TrackedObject> {
        let (lo, hi) = self.config.center_columns;
        objects
            .iter()
            .filter(|o| {
                let (cx, cy) = bbox_center(&o.bbox);
                let (cxn, cyn) = (cx / width.max(1.0), cy / height.max(1.0));
                (lo..=hi).contains(&cxn) && cyn >= self.config.min_center_row
            })
            .cloned()
            .collect()
    }

    /// Feed one sample: tracked vehicles plus per-band expansion.
    pub fn observe(
        &mut self,
        time: f64,
        width: usize,
        height: usize,
        objects: &[TrackedObject],
        expansion: [f32; 3],
    ) {
        let kept = self.relevant(objects, width as f32, height as f32);
        let bands = self.bands(width, height);
        let box_h = band_box_heights(&bands, &kept);

        let mut scores = [0.0f32; 3];
        let mut medians = [0.0f32; 3];
        for b in 0..3 {
            let raw = box_h[b].max(0.0) + self.config.expansion_weight * expansion[b].max(0.0);
            scores[b] = self.ema[b].update(raw);
            self.baselines[b].push(scores[b]);
            medians[b] = if self.baselines[b].len() >= 3 {
                self.baselines[b].median().unwrap_or(0.0)
            } else {
                0.0
            };
        }

        let peak_band = (0..3)
            .max_by(|&a, &b| scores[a].total_cmp(&scores[b]))
            .unwrap_or(1);
        let fused = scores[peak_band];
        let baseline = stats::median_f32(&medians).unwrap_or(0.0);

        let obs = Observation {
            time,
            score: fused,
            evidence: Some(box_h[peak_band]),
            baseline: Some(baseline),
            attributes: PeakAttributes::default()
                .with_location(BAND_LOCATIONS[peak_band])
                .with("max_box_height_norm", round_to(box_h[peak_band] as f64, 3)),
        };
        if let Some(transition) = self.machine.update(obs) {
            debug!("🚗 Band transition at {:.2}s: {:?}", time, transition);
        }
    }
}

impl SignalExtractor for BandEncounterExtractor {
    type Output = BandEncounterResult;

    fn name(&self) -> &'static str {
        "band_encounters"
    }

    fn sampling(&self) -> SamplingSpec {
        SamplingSpec {
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

        let gray = frame.to_gray();
        let mut expansion = [0.0f32; 3];
        if let Some(prev) = self.prev.as_ref() {
            let bands = self.bands(frame.width, frame.height);
            for (slot, band) in expansion.iter_mut().zip(bands) {
                *slot = radial_expansion(prev, &gray, band, &self.config);
            }
        }
        self.prev = Some(gray);

        self.observe(frame.timestamp, frame.width, frame.height, &objects, expansion);
        Ok(())
    }

    fn finish(self, _timing: &StreamTiming) -> BandEncounterResult {
        let Some(tracker) = self.tracker.as_ref() else {
            return BandEncounterResult {
                status: CapabilityStatus::CapabilityUnavailable,
                method: "unavailable".into(),
                close_encounters: Vec::new(),
                event_count: 0,
            };
        };
        let method = format!("{}+band_expansion", tracker.detector_name());
        let events = finalize_events(self.machine.finish(), &self.config.finalize);
        info!("🚗 Band close encounters: {}", events.len());
        BandEncounterResult {
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
    use serde_json::json;

    const W: usize = 896;
    const H: usize = 504;

    fn car(id: u32, bbox: [f32; 4]) -> TrackedObject {
        TrackedObject {
            track_id: id,
            class_id: 2,
            class_name: "car".into(),
            bbox,
            confidence: 0.9,
        }
    }

    fn extractor() -> BandEncounterExtractor {
        BandEncounterExtractor::new(
            BandEncounterConfig::default(),
            Some(Arc::new(ScriptedDetector::new())),
        )
    }

    fn timing() -> StreamTiming {
        StreamTiming {
            native_fps: 32.0,
            effective_hz: 8.0,
            native_width: W,
        }
    }

    #[test]
    fn test_band_box_heights() {
        let cfg = BandEncounterConfig::default();
        let ex = extractor();
        let bands = ex.bands(W, H);
        // Left band only (x 107..358)
        let objs = [car(1, [150.0, 340.0, 250.0, 428.0])];
        let h = band_box_heights(&bands, &objs);
        let band_h = bands[0].height as f32;
        assert!((h[0] - 88.0 / band_h).abs() < 1e-6);
        assert_eq!(h[1], 0.0);
        assert_eq!(h[2], 0.0);
        assert!(cfg.validate().is_ok());
    }

    #[test]
    fn test_growing_center_vehicle() {
        let mut ex = extractor();
        for i in 0..30 {
            let t = i as f64 / 8.0;
            let objs: Vec<TrackedObject> = match i {
                8 => vec![car(1, [400.0, 380.0, 496.0, 420.0])],
                9 => vec![car(1, [400.0, 360.0, 496.0, 440.0])],
                10..=14 => vec![car(1, [400.0, 340.0, 496.0, 460.0])],
                _ => Vec::new(),
            };
            ex.observe(t, W, H, &objs, [0.0; 3]);
        }
        let r = ex.finish(&timing());
        assert_eq!(r.status, CapabilityStatus::Ok);
        assert_eq!(r.event_count, 1);
        let e = &r.close_encounters[0];
        assert_eq!(e.location, Some(Location::Center));
        assert!((e.start_time - 1.25).abs() < 1e-9);
        assert!(e.is_well_ordered());
        assert!(e.end_time > e.peak_time);
        assert!(e.extra["max_box_height_norm"].as_f64().unwrap_or(0.0) > 0.5);
    }

    #[test]
    fn test_static_vehicle_absorbed_by_baseline() {
        let mut ex = extractor();
        let objs = [car(1, [400.0, 340.0, 496.0, 460.0])];
        for i in 0..30 {
            ex.observe(i as f64 / 8.0, W, H, &objs, [0.0; 3]);
        }
        assert_eq!(ex.finish(&timing()).event_count, 0);
    }

    #[test]
    fn test_off_center_boxes_ignored() {
        let mut ex = extractor();
        for i in 0..30 {
            // Centered at x = 0.1 of width
            let objs = if i >= 8 {
                vec![car(1, [40.0, 300.0, 140.0, 480.0])]
            } else {
                Vec::new()
            };
            ex.observe(i as f64 / 8.0, W, H, &objs, [0.0; 3]);
        }
        assert_eq!(ex.finish(&timing()).event_count, 0);
    }

    #[test]
    fn test_expansion_alone_lacks_box_evidence() {
        let mut ex = extractor();
        for i in 0..30 {
            let e = if (8..14).contains(&i) { 0.5 } else { 0.0 };
            ex.observe(i as f64 / 8.0, W, H, &[], [e; 3]);
        }
        assert_eq!(ex.finish(&timing()).event_count, 0);
    }

    #[test]
    fn test_missing_detector_degrades() {
        let ex = BandEncounterExtractor::new(BandEncounterConfig::default(), None);
        let r = ex.finish(&timing());
        assert_eq!(r.status, CapabilityStatus::CapabilityUnavailable);
        assert_eq!(serde_json::to_value(&r).unwrap()["status"], json!("capability_unavailable"));
    }

    #[test]
    fn test_detector_failure_skips_frame() {
        let script = ScriptedDetector::new()
            .with_frame(8, vec![Detection::new([400.0, 380.0, 496.0, 420.0], 0.9, 2)])
            .with_frame(9, vec![Detection::new([400.0, 360.0, 496.0, 440.0], 0.9, 2)]);
        let script = (10..=14).fold(script, |s, i| {
            s.with_frame(i, vec![Detection::new([400.0, 340.0, 496.0, 460.0], 0.9, 2)])
        });
        let detector = FlakyDetector {
            inner: script,
            fail_on: vec![3],
        };
        let mut ex = BandEncounterExtractor::new(BandEncounterConfig::default(), Some(Arc::new(detector)));
        let t = timing();
        for i in 0..30u64 {
            let frame = Frame::new(vec![0; W * H * 3], W, H, i, i as f64 / 8.0);
            assert!(ex.process(&frame, &t).is_ok());
        }
        let r = ex.finish(&t);
        assert_eq!(r.status, CapabilityStatus::Ok);
        assert_eq!(r.event_count, 1);
        assert!((r.close_encounters[0].start_time - 1.25).abs() < 1e-9);
    }
}
