// src/analysis/turn_detector.rs
//
// Turn counting from the rotation of the lower scene between samples.
//
//   corners (prev) → patch tracking → RANSAC similarity → rotation angle
//   yaw rate = angle × effective Hz → centered median → hysteresis
//
// A turn commits early once the integrated heading since the arming sample
// reaches the angle threshold in the turn's direction and the turn has
// lasted long enough; otherwise it ends on the normal release window.

use super::features::{good_features, track_points, CornerConfig, PatchTrackConfig};
use super::similarity::{estimate_similarity, RansacConfig};
use super::{SignalExtractor, StreamTiming};
use crate::detection::{
    finalize_events, Event, EntryStamp, FinalizeConfig, HysteresisConfig, HysteresisMachine,
    Observation, Transition,
};
use crate::error::{AnalysisError, Result};
use crate::smoother::CenteredMedian;
use crate::types::{Direction, Frame, FractionalRect, GrayFrame};
use crate::video_processor::SamplingSpec;
use serde::{Deserialize, Serialize};
use std::collections::VecDeque;
use tracing::{debug, info};

// ============================================================================
// CONFIGURATION
// ============================================================================

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct TurnConfig {
    pub sample_hz: f64,
    pub target_width: Option<usize>,
    pub roi: FractionalRect,
    pub corners: CornerConfig,
    pub tracking: PatchTrackConfig,
    pub ransac: RansacConfig,
    /// Samples with fewer correspondences produce no angle
    pub min_matches: usize,
    /// Re-detect corners when fewer tracked points survive
    pub min_tracked_points: usize,
    /// Centered median window over the yaw rate (samples)
    pub smoothing_window: usize,
    /// Yaw-rate thresholds in deg/s
    pub hysteresis: HysteresisConfig,
    /// Heading change (deg) that commits a turn early
    pub commit_angle_deg: f64,
    /// Minimum elapsed time before the heading commit applies
    pub min_turn_secs: f64,
    /// Fewer angle measurements than this yields no turns
    pub min_angles: usize,
    pub finalize: FinalizeConfig,
}

impl Default for TurnConfig {
    fn default() -> Self {
        Self {
            sample_hz: 10.0,
            target_width: Some(480),
            roi: FractionalRect::rows(0.45, 1.0),
            corners: CornerConfig::default(),
            tracking: PatchTrackConfig {
                search_radius: 12,
                ..PatchTrackConfig::default()
            },
            ransac: RansacConfig::default(),
            min_matches: 6,
            min_tracked_points: 40,
            smoothing_window: 5,
            hysteresis: HysteresisConfig {
                enter_threshold: 8.0,
                exit_threshold: 8.0,
                arm_samples: 6,
                release_samples: 6,
                signed: true,
                entry_stamp: EntryStamp::ArmStart,
                ..HysteresisConfig::default()
            },
            commit_angle_deg: 25.0,
            min_turn_secs: 0.7,
            min_angles: 3,
            finalize: FinalizeConfig {
                min_duration_secs: 0.7,
                merge_gap_secs: None,
            },
        }
    }
}

impl TurnConfig {
    pub fn validate(&self) -> Result<()> {
        self.roi.validate("turn.roi")?;
        self.hysteresis.validate("turn.hysteresis")?;
        if self.min_matches < 3 {
            return Err(AnalysisError::InvalidConfig(
                "turn.min_matches must be at least 3".into(),
            ));
        }
        Ok(())
    }
}

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct TurnResult {
    pub turn_count: usize,
    pub left: usize,
    pub right: usize,
    pub events: Vec<Event>,
}

impl TurnResult {
    fn empty() -> Self {
        Self {
            turn_count: 0,
            left: 0,
            right: 0,
            events: Vec::new(),
        }
    }
}

// ============================================================================
// EXTRACTOR
// ============================================================================

pub struct TurnExtractor {
    config: TurnConfig,
    prev: Option<GrayFrame>,
    points: Vec<(f32, f32)>,
    smoother: CenteredMedian<f64>,
    machine: HysteresisMachine,
    heading: f64,
    /// Heading after each recent sample, for the arming baseline
    recent: VecDeque<(f64, f64)>,
    start_heading: Option<f64>,
    angles: usize,
    effective_hz: f64,
}

impl TurnExtractor {
    pub fn new(config: TurnConfig) -> Self {
        let window = config.smoothing_window;
        let recent_cap = config.hysteresis.arm_samples + 1;
        Self {
            machine: HysteresisMachine::new(config.hysteresis.clone()),
            smoother: CenteredMedian::new(window),
            config,
            prev: None,
            points: Vec::new(),
            heading: 0.0,
            recent: VecDeque::with_capacity(recent_cap),
            start_heading: None,
            angles: 0,
            effective_hz: 0.0,
        }
    }

    /// Feed the inter-sample rotation measured at `time`.
    pub fn observe_rotation(&mut self, time: f64, angle_deg: f32, effective_hz: f64) {
        self.angles += 1;
        self.effective_hz = effective_hz;
        let yaw_rate = angle_deg * effective_hz as f32;
        for (t, omega) in self.smoother.push(yaw_rate, time) {
            self.step(t, omega);
        }
    }

    fn step(&mut self, time: f64, omega: f32) {
        if self.effective_hz > 0.0 {
            self.heading += omega as f64 / self.effective_hz;
        }
        self.recent.push_back((time, self.heading));
        if self.recent.len() > self.config.hysteresis.arm_samples + 1 {
            self.recent.pop_front();
        }

        match self.machine.update(Observation::new(time, omega)) {
            Some(Transition::Entered { start_time, direction }) => {
                self.start_heading = self
                    .recent
                    .iter()
                    .find(|&&(t, _)| t >= start_time)
                    .map(|&(_, h)| h);
                debug!("↻ Turn armed at {:.2}s ({:?})", start_time, direction);
            }
            Some(Transition::Exited(e)) => {
                self.start_heading = None;
                debug!("↻ Turn released {:.2}s-{:.2}s", e.start_time, e.end_time);
            }
            None => {}
        }

        self.try_commit(time);
    }

    fn try_commit(&mut self, time: f64) {
        let (Some(base), Some(since), Some(dir)) = (
            self.start_heading,
            self.machine.active_since(),
            self.machine.direction(),
        ) else {
            return;
        };
        let delta = (self.heading - base) * dir.sign() as f64;
        if delta >= self.config.commit_angle_deg && time - since >= self.config.min_turn_secs {
            if let Some(e) = self.machine.close(time) {
                debug!(
                    "↻ Turn committed {:.2}s-{:.2}s ({:.1}°)",
                    e.start_time, e.end_time, delta
                );
            }
            self.start_heading = None;
        }
    }

    fn measure(&mut self, prev: &GrayFrame, cur: &GrayFrame) -> Option<f32> {
        if self.points.len() < self.config.min_tracked_points {
            self.points = good_features(prev, None, &self.config.corners);
        }
        let matches = track_points(prev, cur, &self.points, &self.config.tracking);
        self.points = matches.iter().map(|m| m.to).collect();
        if matches.len() < self.config.min_matches {
            return None;
        }
        estimate_similarity(&matches, &self.config.ransac).map(|fit| fit.transform.rotation_deg())
    }
}

impl SignalExtractor for TurnExtractor {
    type Output = TurnResult;

    fn name(&self) -> &'static str {
        "turns"
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
        if let Some(prev) = self.prev.take() {
            if let Some(angle) = self.measure(&prev, &gray) {
                self.observe_rotation(frame.timestamp, angle, timing.effective_hz);
            }
        }
        self.prev = Some(gray);
        Ok(())
    }

    fn finish(mut self, _timing: &StreamTiming) -> TurnResult {
        if self.angles < self.config.min_angles {
            info!("↻ Turns: too few rotation measurements ({})", self.angles);
            return TurnResult::empty();
        }
        for (t, omega) in self.smoother.flush() {
            self.step(t, omega);
        }

        let events = finalize_events(self.machine.finish(), &self.config.finalize);
        let left = events
            .iter()
            .filter(|e| e.direction == Some(Direction::Left))
            .count();
        let right = events.len() - left;
        info!("↻ Turns: {} (left {}, right {})", events.len(), left, right);
        TurnResult {
            turn_count: events.len(),
            left,
            right,
            events,
        }
    }
}
