// src/analysis/vehicle_tracker.rs
//
// IoU-based multi-object tracker giving detections a stable identity
// across sampled frames.
//
// Design:
//   - Greedy IoU matching (sufficient for <20 objects per frame)
//   - Centroid-distance fallback for same-class boxes that jumped
//   - Tracks coast through brief detection gaps, then are pruned
//   - Identities are never reused within a pass

use crate::error::Result;
use crate::types::{bbox_center, BBox, Frame};
use crate::vehicle_detection::{class_id_to_name, iou, is_vehicle_class, Detection, Detector};
use serde::{Deserialize, Serialize};
use std::sync::Arc;
use tracing::debug;

// ============================================================================
// CONFIGURATION
// ============================================================================

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct TrackerConfig {
    /// Minimum IoU to match a detection to an existing track
    pub min_iou: f32,
    /// Samples a track survives without a detection before deletion
    pub max_coast_samples: u32,
    /// Consecutive hits that lock a track's class
    pub min_hits_to_confirm: u32,
    /// Maximum centroid distance (fraction of frame width) for the fallback
    pub max_centroid_distance_ratio: f32,
    /// Maximum samples since last hit for the centroid fallback to apply
    pub centroid_fallback_max_coast: u32,
}

impl Default for TrackerConfig {
    fn default() -> Self {
        Self {
            min_iou: 0.2,
            max_coast_samples: 8,
            min_hits_to_confirm: 3,
            max_centroid_distance_ratio: 0.10,
            centroid_fallback_max_coast: 3,
        }
    }
}

/// IoU multiplier when a detection's class differs from a confirmed track's
const CROSS_CLASS_IOU_PENALTY: f32 = 0.5;

// ============================================================================
// TYPES
// ============================================================================

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TrackState {
    Tentative,
    Confirmed,
}

/// A detection with its track identity, as seen in the current frame.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct TrackedObject {
    pub track_id: u32,
    pub class_id: usize,
    pub class_name: String,
    pub bbox: BBox,
    pub confidence: f32,
}

#[derive(Debug, Clone)]
struct Track {
    id: u32,
    bbox: BBox,
    state: TrackState,
    class_id: usize,
    confidence: f32,
    consecutive_hits: u32,
    samples_since_hit: u32,
}

impl Track {
    fn new(id: u32, det: &Detection) -> Self {
        Self {
            id,
            bbox: det.bbox,
            state: TrackState::Tentative,
            class_id: det.class_id,
            confidence: det.confidence,
            consecutive_hits: 1,
            samples_since_hit: 0,
        }
    }

    fn update_with_detection(&mut self, det: &Detection, min_hits: u32) {
        self.bbox = det.bbox;
        self.confidence = det.confidence;
        self.consecutive_hits += 1;
        self.samples_since_hit = 0;

        // Class is locked once confirmed
        if self.state == TrackState::Tentative {
            self.class_id = det.class_id;
            if self.consecutive_hits >= min_hits {
                self.state = TrackState::Confirmed;
                debug!("✅ Track {} confirmed with class={}", self.id, self.class_id);
            }
        }
    }

    fn mark_missed(&mut self) {
        self.samples_since_hit += 1;
        self.consecutive_hits = 0;
    }

    fn observed(&self) -> TrackedObject {
        TrackedObject {
            track_id: self.id,
            class_id: self.class_id,
            class_name: class_id_to_name(self.class_id),
            bbox: self.bbox,
            confidence: self.confidence,
        }
    }
}

// ============================================================================
// MAIN TRACKER
// ============================================================================

pub struct VehicleTracker {
    config: TrackerConfig,
    tracks: Vec<Track>,
    next_id: u32,
}

impl VehicleTracker {
    pub fn new(config: TrackerConfig) -> Self {
        Self {
            config,
            tracks: Vec::with_capacity(32),
            next_id: 1,
        }
    }

    /// Associate one frame of detections. Returns the tracks hit in this
    /// frame, ordered by track id.
    pub fn update(&mut self, detections: &[Detection], frame_w: f32) -> Vec<TrackedObject> {
        let valid: Vec<&Detection> = detections
            .iter()
            .filter(|d| is_vehicle_class(d.class_id))
            .collect();

        let mut matched_tracks = vec![false; self.tracks.len()];
        let mut matched_dets = vec![false; valid.len()];

        // ── Phase 1: IoU ──
        let mut iou_pairs: Vec<(usize, usize, f32)> = Vec::new();
        for (ti, track) in self.tracks.iter().enumerate() {
            for (di, det) in valid.iter().enumerate() {
                let raw = iou(&track.bbox, &det.bbox);
                let effective = if track.state == TrackState::Confirmed && track.class_id != det.class_id {
                    raw * CROSS_CLASS_IOU_PENALTY
                } else {
                    raw
                };
                if effective >= self.config.min_iou {
                    iou_pairs.push((ti, di, effective));
                }
            }
        }
        iou_pairs.sort_by(|a, b| b.2.partial_cmp(&a.2).unwrap_or(std::cmp::Ordering::Equal));
        for &(ti, di, _) in &iou_pairs {
            if matched_tracks[ti] || matched_dets[di] {
                continue;
            }
            matched_tracks[ti] = true;
            matched_dets[di] = true;
            self.tracks[ti].update_with_detection(valid[di], self.config.min_hits_to_confirm);
        }

        // ── Phase 2: centroid fallback, same class only ──
        let max_dist = frame_w * self.config.max_centroid_distance_ratio;
        let max_dist_sq = max_dist * max_dist;
        let mut centroid_pairs: Vec<(usize, usize, f32)> = Vec::new();
        for (ti, track) in self.tracks.iter().enumerate() {
            if matched_tracks[ti] || track.samples_since_hit > self.config.centroid_fallback_max_coast {
                continue;
            }
            let (tcx, tcy) = bbox_center(&track.bbox);
            for (di, det) in valid.iter().enumerate() {
                if matched_dets[di] || det.class_id != track.class_id {
                    continue;
                }
                let (dcx, dcy) = bbox_center(&det.bbox);
                let dist_sq = (tcx - dcx).powi(2) + (tcy - dcy).powi(2);
                if dist_sq < max_dist_sq {
                    centroid_pairs.push((ti, di, dist_sq));
                }
            }
        }
        centroid_pairs.sort_by(|a, b| a.2.partial_cmp(&b.2).unwrap_or(std::cmp::Ordering::Equal));
        for &(ti, di, dist_sq) in &centroid_pairs {
            if matched_tracks[ti] || matched_dets[di] {
                continue;
            }
            matched_tracks[ti] = true;
            matched_dets[di] = true;
            debug!(
                "🔗 Centroid rescue: Track {} ↔ det (dist={:.0}px, class={})",
                self.tracks[ti].id,
                dist_sq.sqrt(),
                valid[di].class_id
            );
            self.tracks[ti].update_with_detection(valid[di], self.config.min_hits_to_confirm);
        }

        // ── Unmatched tracks coast ──
        for (ti, matched) in matched_tracks.iter().enumerate() {
            if !matched {
                self.tracks[ti].mark_missed();
            }
        }

        // ── Unmatched detections start tracks ──
        for (di, matched) in matched_dets.iter().enumerate() {
            if !matched {
                let track = Track::new(self.next_id, valid[di]);
                debug!(
                    "🆕 Track T{} created: class={}, bbox=[{:.0},{:.0},{:.0},{:.0}]",
                    self.next_id, track.class_id, track.bbox[0], track.bbox[1], track.bbox[2], track.bbox[3]
                );
                self.next_id += 1;
                self.tracks.push(track);
            }
        }

        let max_coast = self.config.max_coast_samples;
        self.tracks.retain(|t| {
            let keep = t.samples_since_hit <= max_coast;
            if !keep {
                debug!("🗑️  Track {} pruned after {} missed samples", t.id, t.samples_since_hit);
            }
            keep
        });

        let mut hit: Vec<TrackedObject> = self
            .tracks
            .iter()
            .filter(|t| t.samples_since_hit == 0)
            .map(Track::observed)
            .collect();
        hit.sort_by_key(|o| o.track_id);
        hit
    }

    pub fn active_count(&self) -> usize {
        self.tracks.len()
    }
}

// ============================================================================
// DETECTION + TRACKING
// ============================================================================

/// Detector and tracker combined: frame in, identified vehicles out.
pub struct ObjectTracker {
    detector: Arc<dyn Detector>,
    tracker: VehicleTracker,
    min_confidence: f32,
}

impl ObjectTracker {
    pub fn new(detector: Arc<dyn Detector>, config: TrackerConfig, min_confidence: f32) -> Self {
        Self {
            detector,
            tracker: VehicleTracker::new(config),
            min_confidence,
        }
    }

    pub fn track(&mut self, frame: &Frame) -> Result<Vec<TrackedObject>> {
        let detections = self.detector.detect(frame, self.min_confidence)?;
        Ok(self.tracker.update(&detections, frame.width as f32))
    }

    pub fn detector_name(&self) -> &str {
        self.detector.name()
    }
}

// ============================================================================
// TESTS
// ============================================================================

#[cfg(test)]
mod tests {
    use super::*;

    fn det(x1: f32, y1: f32, x2: f32, y2: f32) -> Detection {
        Detection::new([x1, y1, x2, y2], 0.8, 2)
    }

    #[test]
    fn test_identity_kept_across_frames() {
        let mut tracker = VehicleTracker::new(TrackerConfig::default());
        let a = tracker.update(&[det(500.0, 200.0, 600.0, 300.0)], 1280.0);
        let b = tracker.update(&[det(505.0, 202.0, 606.0, 304.0)], 1280.0);
        assert_eq!(a.len(), 1);
        assert_eq!(a[0].track_id, b[0].track_id);
    }

    #[test]
    fn test_two_vehicles_distinct_ids() {
        let mut tracker = VehicleTracker::new(TrackerConfig::default());
        let out = tracker.update(
            &[det(100.0, 200.0, 200.0, 300.0), det(800.0, 200.0, 900.0, 300.0)],
            1280.0,
        );
        assert_eq!(out.len(), 2);
        assert_ne!(out[0].track_id, out[1].track_id);
    }

    #[test]
    fn test_ids_never_reused() {
        let cfg = TrackerConfig {
            max_coast_samples: 1,
            ..TrackerConfig::default()
        };
        let mut tracker = VehicleTracker::new(cfg);
        let first = tracker.update(&[det(100.0, 100.0, 200.0, 200.0)], 1280.0)[0].track_id;
        tracker.update(&[], 1280.0);
        tracker.update(&[], 1280.0);
        assert_eq!(tracker.active_count(), 0);
        let second = tracker.update(&[det(100.0, 100.0, 200.0, 200.0)], 1280.0)[0].track_id;
        assert!(second > first);
    }

    #[test]
    fn test_coasting_track_recovers() {
        let mut tracker = VehicleTracker::new(TrackerConfig::default());
        let id = tracker.update(&[det(100.0, 100.0, 200.0, 200.0)], 1280.0)[0].track_id;
        let gap = tracker.update(&[], 1280.0);
        assert!(gap.is_empty());
        let back = tracker.update(&[det(104.0, 100.0, 204.0, 200.0)], 1280.0);
        assert_eq!(back[0].track_id, id);
    }

    #[test]
    fn test_centroid_rescue() {
        let mut tracker = VehicleTracker::new(TrackerConfig::default());
        let id = tracker.update(&[det(100.0, 100.0, 140.0, 140.0)], 1280.0)[0].track_id;
        // Jumped 60 px: no overlap, within 10% of frame width
        let out = tracker.update(&[det(160.0, 100.0, 200.0, 140.0)], 1280.0);
        assert_eq!(out[0].track_id, id);
    }

    #[test]
    fn test_non_vehicle_ignored() {
        let mut tracker = VehicleTracker::new(TrackerConfig::default());
        let person = Detection::new([0.0, 0.0, 50.0, 100.0], 0.9, 0);
        assert!(tracker.update(&[person], 1280.0).is_empty());
    }
}
