// src/analysis/mod.rs
//
// Per-modality signal extractors.
//
// Signal flow (one independent pass per modality):
//   FrameSampler → optical_flow   → ego_motion ──→ speed (aggregator)
//                                              └─→ lane_change
//                → features + similarity       ──→ turn_detector
//                → Detector + vehicle_tracker  ──→ proximity / band_encounters
//                → color_analysis              ──→ lane_color
//
// Every extractor turns its scores into events through
// detection::HysteresisMachine, except speed which is aggregated directly.

pub mod band_encounters;
pub mod ego_motion;
pub mod features;
pub mod lane_change;
pub mod lane_color;
pub mod optical_flow;
pub mod proximity;
pub mod similarity;
pub mod speed;
pub mod speed_aggregator;
pub mod turn_detector;
pub mod vehicle_tracker;

use crate::error::Result;
use crate::types::Frame;
use crate::video_processor::SamplingSpec;
use serde::Serialize;

pub use band_encounters::{BandEncounterConfig, BandEncounterExtractor, BandEncounterResult};
pub use lane_change::{LaneChangeConfig, LaneChangeExtractor, LaneChangeResult};
pub use lane_color::{LaneColorConfig, LaneColorExtractor, LaneColorResult};
pub use proximity::{ProximityConfig, ProximityExtractor, ProximityResult};
pub use speed::{SpeedConfig, SpeedExtractor, SpeedMethod, SpeedResult};
pub use turn_detector::{TurnConfig, TurnExtractor, TurnResult};
pub use vehicle_tracker::{ObjectTracker, TrackedObject, TrackerConfig, VehicleTracker};

/// Timing of the sampled stream an extractor is fed from.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct StreamTiming {
    pub native_fps: f64,
    /// Rate at which sampled frames arrive
    pub effective_hz: f64,
    /// Source width before any resize
    pub native_width: usize,
}

impl StreamTiming {
    /// Native / processed width ratio for a sampler resizing to `target`.
    pub fn width_scale(&self, target: Option<usize>) -> f32 {
        match target {
            Some(w) if w > 0 && w < self.native_width => self.native_width as f32 / w as f32,
            _ => 1.0,
        }
    }
}

/// Whether a modality ran with everything it needs.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum CapabilityStatus {
    Ok,
    /// A required capability (the detector) was missing; results are empty
    CapabilityUnavailable,
}

/// One modality: consumes sampled frames in order, then reduces its state
/// to a serializable result.
pub trait SignalExtractor {
    type Output: Serialize;

    fn name(&self) -> &'static str;

    /// How frames should be sampled for this modality.
    fn sampling(&self) -> SamplingSpec;

    fn process(&mut self, frame: &Frame, timing: &StreamTiming) -> Result<()>;

    fn finish(self, timing: &StreamTiming) -> Self::Output;
}
