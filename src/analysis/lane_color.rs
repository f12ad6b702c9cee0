// src/analysis/lane_color.rs
//
// Restricted-lane occupancy from painted-surface color.
//
// Every native frame: HSV threshold of a small bottom-center ROI, open then
// close, coverage fraction. A frame is "on the lane" at or above the
// coverage threshold. Occupancy starts once a full buffer of frames agrees
// and ends once a full buffer disagrees.

use super::{SignalExtractor, StreamTiming};
use crate::color_analysis::{region_coverage, HueBand};
use crate::detection::{
    finalize_events, round_to, EntryStamp, Event, FinalizeConfig, HysteresisConfig,
    HysteresisMachine, Observation, PeakAttributes,
};
use crate::error::{AnalysisError, Result};
use crate::types::{Frame, FractionalRect};
use crate::video_processor::SamplingSpec;
use serde::{Deserialize, Serialize};
use tracing::{debug, info};

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct LaneColorConfig {
    pub roi: FractionalRect,
    pub target: HueBand,
    pub min_coverage: f32,
    /// Morphology kernel size (square)
    pub kernel: usize,
    /// Frames that must agree before the state flips
    pub buffer_frames: usize,
    pub finalize: FinalizeConfig,
}

impl Default for LaneColorConfig {
    fn default() -> Self {
        Self {
            roi: FractionalRect::centered_bottom(0.22, 0.18, 0.04),
            target: HueBand::red(),
            min_coverage: 0.12,
            kernel: 3,
            buffer_frames: 12,
            finalize: FinalizeConfig {
                min_duration_secs: 1.0,
                merge_gap_secs: None,
            },
        }
    }
}

impl LaneColorConfig {
    pub fn validate(&self) -> Result<()> {
        self.roi.validate("lane_color.roi")?;
        if self.buffer_frames == 0 {
            return Err(AnalysisError::InvalidConfig(
                "lane_color.buffer_frames must be at least 1".into(),
            ));
        }
        Ok(())
    }

    /// Unanimous-buffer policy expressed as a binary hysteresis.
    fn hysteresis(&self) -> HysteresisConfig {
        HysteresisConfig {
            enter_threshold: 1.0,
            exit_threshold: 0.0,
            arm_samples: self.buffer_frames,
            release_samples: self.buffer_frames,
            signed: false,
            entry_stamp: EntryStamp::Confirmation,
            ..HysteresisConfig::default()
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct LaneColorResult {
    pub violation_detected: bool,
    pub violation_ranges: Vec<Event>,
    pub event_count: usize,
}

pub struct LaneColorExtractor {
    config: LaneColorConfig,
    machine: HysteresisMachine,
    frames_on_lane: usize,
}

impl LaneColorExtractor {
    pub fn new(config: LaneColorConfig) -> Self {
        Self {
            machine: HysteresisMachine::new(config.hysteresis()),
            config,
            frames_on_lane: 0,
        }
    }

    /// Matching fraction of the ROI for one frame.
    pub fn coverage(&self, frame: &Frame) -> f32 {
        let rect = self.config.roi.resolve(frame.width, frame.height);
        region_coverage(frame, &rect, &self.config.target, self.config.kernel)
    }

    pub fn observe(&mut self, time: f64, coverage: f32) {
        let on_lane = coverage >= self.config.min_coverage;
        if on_lane {
            self.frames_on_lane += 1;
        }
        let obs = Observation {
            attributes: PeakAttributes::default().with("coverage", round_to(coverage as f64, 3)),
            ..Observation::new(time, if on_lane { 1.0 } else { 0.0 })
        };
        if let Some(transition) = self.machine.update(obs) {
            debug!("🟥 Lane color transition at {:.2}s: {:?}", time, transition);
        }
    }
}

impl SignalExtractor for LaneColorExtractor {
    type Output = LaneColorResult;

    fn name(&self) -> &'static str {
        "lane_color"
    }

    fn sampling(&self) -> SamplingSpec {
        SamplingSpec {
            target_hz: None,
            target_width: None,
            crop: None,
        }
    }

    fn process(&mut self, frame: &Frame, _timing: &StreamTiming) -> Result<()> {
        let coverage = self.coverage(frame);
        self.observe(frame.timestamp, coverage);
        Ok(())
    }

    fn finish(self, _timing: &StreamTiming) -> LaneColorResult {
        let on_lane = self.frames_on_lane;
        let events = finalize_events(self.machine.finish(), &self.config.finalize);
        info!(
            "🟥 Lane color: {} occupancy ranges ({} frames on lane)",
            events.len(),
            on_lane
        );
        LaneColorResult {
            violation_detected: !events.is_empty(),
            event_count: events.len(),
            violation_ranges: events,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    const FPS: f64 = 30.0;

    fn timing() -> StreamTiming {
        StreamTiming {
            native_fps: FPS,
            effective_hz: FPS,
            native_width: 64,
        }
    }

    fn frame(index: u64, red: bool) -> Frame {
        let rgb: [u8; 3] = if red { [200, 20, 20] } else { [90, 90, 90] };
        let data = rgb.iter().copied().cycle().take(64 * 48 * 3).collect();
        Frame::new(data, 64, 48, index, index as f64 / FPS)
    }

    fn run(pattern: &[(bool, usize)]) -> LaneColorResult {
        let mut ex = LaneColorExtractor::new(LaneColorConfig::default());
        let mut index = 0;
        for &(red, n) in pattern {
            for _ in 0..n {
                ex.process(&frame(index, red), &timing()).unwrap();
                index += 1;
            }
        }
        ex.finish(&timing())
    }

    #[test]
    fn test_coverage_on_solid_frames() {
        let ex = LaneColorExtractor::new(LaneColorConfig::default());
        assert!(ex.coverage(&frame(0, true)) > 0.99);
        assert_eq!(ex.coverage(&frame(0, false)), 0.0);
    }

    #[test]
    fn test_sustained_occupancy() {
        let r = run(&[(false, 30), (true, 60), (false, 30)]);
        assert!(r.violation_detected);
        assert_eq!(r.event_count, 1);
        let e = &r.violation_ranges[0];
        // Confirmed on the 12th red frame, released on the 12th clear one
        assert!((e.start_time - 41.0 / FPS).abs() < 1e-9);
        assert!((e.end_time - 101.0 / FPS).abs() < 1e-9);
    }

    #[test]
    fn test_short_burst_ignored() {
        let r = run(&[(false, 30), (true, 10), (false, 30)]);
        assert!(!r.violation_detected);
        assert_eq!(r.event_count, 0);
    }

    #[test]
    fn test_full_buffer_shorter_than_min_duration() {
        // 12 frames confirm the state but span only 0.4 s
        let r = run(&[(false, 30), (true, 12), (false, 30)]);
        assert!(!r.violation_detected);
        assert_eq!(r.event_count, 0);
    }

    #[test]
    fn test_buffered_run_past_min_duration() {
        let r = run(&[(false, 30), (true, 36), (false, 30)]);
        assert_eq!(r.event_count, 1);
        let e = &r.violation_ranges[0];
        assert!((e.start_time - 41.0 / FPS).abs() < 1e-9);
        assert!((e.end_time - 77.0 / FPS).abs() < 1e-9);
        assert!(e.duration() >= 1.0);
    }

    #[test]
    fn test_flicker_never_unanimous() {
        let mut pattern = vec![(false, 10)];
        for _ in 0..20 {
            pattern.push((true, 8));
            pattern.push((false, 1));
        }
        assert_eq!(run(&pattern).event_count, 0);
    }

    #[test]
    fn test_open_range_closed_at_end() {
        let r = run(&[(false, 30), (true, 60)]);
        assert_eq!(r.event_count, 1);
        assert!((r.violation_ranges[0].end_time - 89.0 / FPS).abs() < 1e-9);
    }
}
