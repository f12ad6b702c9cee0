// src/analysis/lane_change.rs
//
// Lane changes from sustained lateral motion of the road band.
//
// Per sample: dense flow over a narrow mid-frame band → signed lateral
// score → EMA → signed hysteresis. The event direction is the sign of the
// smoothed score when the machine arms.

use super::ego_motion::{lateral_score, LateralFlowConfig};
use super::optical_flow::{dense_flow, FlowConfig};
use super::{SignalExtractor, StreamTiming};
use crate::detection::{
    finalize_events, Event, FinalizeConfig, HysteresisConfig, HysteresisMachine, Observation,
    Transition,
};
use crate::error::Result;
use crate::smoother::{EmaSeed, ScoreSmoother, SmoothingConfig};
use crate::types::{Direction, Frame, FractionalRect, GrayFrame};
use crate::video_processor::SamplingSpec;
use serde::{Deserialize, Serialize};
use tracing::{debug, info};

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct LaneChangeConfig {
    pub sample_hz: f64,
    pub target_width: Option<usize>,
    pub roi: FractionalRect,
    pub flow: FlowConfig,
    pub lateral: LateralFlowConfig,
    pub smoothing: SmoothingConfig,
    pub hysteresis: HysteresisConfig,
    pub finalize: FinalizeConfig,
}

impl Default for LaneChangeConfig {
    fn default() -> Self {
        Self {
            sample_hz: 8.0,
            target_width: Some(320),
            roi: FractionalRect::rows(0.35, 0.65),
            flow: FlowConfig::default(),
            lateral: LateralFlowConfig::default(),
            smoothing: SmoothingConfig::Exponential {
                alpha: 0.12,
                seed: EmaSeed::Zero,
            },
            hysteresis: HysteresisConfig {
                enter_threshold: 0.5,
                exit_threshold: 0.3,
                signed: true,
                ..HysteresisConfig::default()
            },
            finalize: FinalizeConfig {
                min_duration_secs: 1.0,
                merge_gap_secs: None,
            },
        }
    }
}

impl LaneChangeConfig {
    pub fn validate(&self) -> Result<()> {
        self.roi.validate("lane_change.roi")?;
        self.hysteresis.validate("lane_change.hysteresis")
    }
}

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct LaneChangeResult {
    pub lane_change_count: usize,
    pub left: usize,
    pub right: usize,
    pub events: Vec<Event>,
}

impl LaneChangeResult {
    fn from_events(events: Vec<Event>) -> Self {
        let left = events
            .iter()
            .filter(|e| e.direction == Some(Direction::Left))
            .count();
        let right = events
            .iter()
            .filter(|e| e.direction == Some(Direction::Right))
            .count();
        Self {
            lane_change_count: events.len(),
            left,
            right,
            events,
        }
    }
}

pub struct LaneChangeExtractor {
    config: LaneChangeConfig,
    prev: Option<GrayFrame>,
    smoother: ScoreSmoother,
    machine: HysteresisMachine,
}

impl LaneChangeExtractor {
    pub fn new(config: LaneChangeConfig) -> Self {
        Self {
            smoother: ScoreSmoother::from_config(&config.smoothing),
            machine: HysteresisMachine::new(config.hysteresis.clone()),
            prev: None,
            config,
        }
    }

    /// Feed one raw lateral score.
    pub fn observe(&mut self, time: f64, raw_score: f32) {
        let smoothed = self.smoother.smooth(raw_score);
        match self.machine.update(Observation::new(time, smoothed)) {
            Some(Transition::Entered { direction, .. }) => {
                debug!("↔ Lane change candidate at {:.2}s ({:?})", time, direction);
            }
            Some(Transition::Exited(e)) => {
                debug!(
                    "↔ Lane change {:.2}s-{:.2}s ({:?})",
                    e.start_time, e.end_time, e.direction
                );
            }
            None => {}
        }
    }
}

impl SignalExtractor for LaneChangeExtractor {
    type Output = LaneChangeResult;

    fn name(&self) -> &'static str {
        "lane_change"
    }

    fn sampling(&self) -> SamplingSpec {
        SamplingSpec {
            target_hz: Some(self.config.sample_hz),
            target_width: self.config.target_width,
            crop: Some(self.config.roi),
        }
    }

    fn process(&mut self, frame: &Frame, _timing: &StreamTiming) -> Result<()> {
        let gray = frame.to_gray();
        if let Some(prev) = self.prev.take() {
            let flow = dense_flow(&prev, &gray, &self.config.flow);
            let score = lateral_score(&flow, &self.config.lateral);
            self.observe(frame.timestamp, score);
        }
        self.prev = Some(gray);
        Ok(())
    }

    fn finish(self, _timing: &StreamTiming) -> LaneChangeResult {
        let events = finalize_events(self.machine.finish(), &self.config.finalize);
        let result = LaneChangeResult::from_events(events);
        info!(
            "↔ Lane changes: {} (left {}, right {})",
            result.lane_change_count, result.left, result.right
        );
        result
    }
}
