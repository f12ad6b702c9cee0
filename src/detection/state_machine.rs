// src/detection/state_machine.rs
//
// Two-threshold hysteresis machine shared by every event detector.
//
//   IDLE ──(score ≥ enter for arm_samples)──▶ ACTIVE
//   ACTIVE ──(score ≤ exit or direction flip for release_samples)──▶ IDLE
//
// Thresholds are offsets over a baseline that is fixed, a rolling median
// of the score itself, or supplied by the caller per observation.

use super::types::{Event, PeakAttributes};
use crate::error::{AnalysisError, Result};
use crate::smoother::RollingMedian;
use crate::stats;
use crate::types::Direction;
use serde::{Deserialize, Serialize};
use std::collections::VecDeque;
use tracing::debug;

// ============================================================================
// CONFIGURATION
// ============================================================================

#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum Baseline {
    Fixed { value: f32 },
    /// Median of the last `window` scores; 0 until `min_samples` are seen
    RollingMedian { window: usize, min_samples: usize },
}

/// Which time becomes the event start.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum EntryStamp {
    /// First sample of the arming window
    ArmStart,
    /// Sample that completed the arming window
    Confirmation,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct HysteresisConfig {
    /// Offset over baseline a score must reach to arm
    pub enter_threshold: f32,
    /// Offset over baseline at or below which a sample counts toward release
    pub exit_threshold: f32,
    /// Minimum sample-to-sample rise required to arm
    pub min_rise: Option<f32>,
    /// Minimum auxiliary evidence (e.g. box height) required to arm
    pub min_evidence: Option<f32>,
    /// Consecutive qualifying samples needed to enter
    pub arm_samples: usize,
    /// Consecutive releasing samples needed to exit
    pub release_samples: usize,
    /// Scores carry a direction in their sign
    pub signed: bool,
    pub entry_stamp: EntryStamp,
    pub baseline: Baseline,
}

impl Default for HysteresisConfig {
    fn default() -> Self {
        Self {
            enter_threshold: 0.18,
            exit_threshold: 0.10,
            min_rise: None,
            min_evidence: None,
            arm_samples: 1,
            release_samples: 1,
            signed: false,
            entry_stamp: EntryStamp::ArmStart,
            baseline: Baseline::Fixed { value: 0.0 },
        }
    }
}

impl HysteresisConfig {
    pub fn validate(&self, name: &str) -> Result<()> {
        if self.arm_samples == 0 || self.release_samples == 0 {
            return Err(AnalysisError::InvalidConfig(format!(
                "{name}: arm/release sample counts must be at least 1"
            )));
        }
        if self.exit_threshold > self.enter_threshold {
            return Err(AnalysisError::InvalidConfig(format!(
                "{name}: exit threshold {:.3} above enter threshold {:.3}",
                self.exit_threshold, self.enter_threshold
            )));
        }
        if self.exit_threshold == self.enter_threshold && self.release_samples < 2 {
            return Err(AnalysisError::InvalidConfig(format!(
                "{name}: equal enter/exit thresholds need a release window longer than one sample"
            )));
        }
        if let Baseline::RollingMedian { window, .. } = self.baseline {
            if window == 0 {
                return Err(AnalysisError::InvalidConfig(format!(
                    "{name}: baseline window must be non-empty"
                )));
            }
        }
        Ok(())
    }
}

// ============================================================================
// TYPES
// ============================================================================

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Phase {
    Idle,
    Active,
}

/// One smoothed sample fed to the machine.
#[derive(Debug, Clone, Default)]
pub struct Observation {
    pub time: f64,
    pub score: f32,
    /// Auxiliary evidence compared against `min_evidence`
    pub evidence: Option<f32>,
    /// Per-sample baseline; overrides the configured one
    pub baseline: Option<f32>,
    pub attributes: PeakAttributes,
}

impl Observation {
    pub fn new(time: f64, score: f32) -> Self {
        Self {
            time,
            score,
            ..Default::default()
        }
    }
}

#[derive(Debug, Clone, PartialEq)]
pub enum Transition {
    Entered {
        start_time: f64,
        direction: Option<Direction>,
    },
    Exited(Event),
}

#[derive(Debug, Clone)]
struct OpenEvent {
    start_time: f64,
    peak_time: f64,
    peak_score: f32,
    direction: Option<Direction>,
    attributes: PeakAttributes,
}

impl OpenEvent {
    fn close(self, end_time: f64) -> Event {
        Event {
            start_time: self.start_time,
            end_time: end_time.max(self.peak_time),
            peak_time: self.peak_time,
            peak_score: self.peak_score,
            direction: self.direction,
            location: self.attributes.location,
            extra: self.attributes.extra,
        }
    }
}

// ============================================================================
// MACHINE
// ============================================================================

pub struct HysteresisMachine {
    config: HysteresisConfig,
    phase: Phase,
    arm_window: VecDeque<(f64, f32)>,
    release_count: usize,
    baseline_window: Option<RollingMedian>,
    baseline_min_samples: usize,
    prev_score: Option<f32>,
    last_time: Option<f64>,
    open: Option<OpenEvent>,
    completed: Vec<Event>,
}

impl HysteresisMachine {
    pub fn new(config: HysteresisConfig) -> Self {
        let (baseline_window, baseline_min_samples) = match config.baseline {
            Baseline::RollingMedian {
                window,
                min_samples,
            } => (Some(RollingMedian::new(window)), min_samples),
            Baseline::Fixed { .. } => (None, 0),
        };
        Self {
            arm_window: VecDeque::with_capacity(config.arm_samples),
            config,
            phase: Phase::Idle,
            release_count: 0,
            baseline_window,
            baseline_min_samples,
            prev_score: None,
            last_time: None,
            open: None,
            completed: Vec::new(),
        }
    }

    pub fn phase(&self) -> Phase {
        self.phase
    }

    pub fn is_active(&self) -> bool {
        self.phase == Phase::Active
    }

    /// Direction of the active event, if any.
    pub fn direction(&self) -> Option<Direction> {
        self.open.as_ref().and_then(|o| o.direction)
    }

    /// Start time of the active event, if any.
    pub fn active_since(&self) -> Option<f64> {
        self.open.as_ref().map(|o| o.start_time)
    }

    pub fn events(&self) -> &[Event] {
        &self.completed
    }

    fn baseline_for(&mut self, obs: &Observation) -> f32 {
        if let Some(b) = obs.baseline {
            return b;
        }
        match (&mut self.baseline_window, self.config.baseline) {
            (Some(window), _) => {
                window.push(obs.score);
                if window.len() >= self.baseline_min_samples {
                    window.median().unwrap_or(0.0)
                } else {
                    0.0
                }
            }
            (None, Baseline::Fixed { value }) => value,
            (None, _) => 0.0,
        }
    }

    /// Feed one observation. Returns a transition when the phase changes.
    pub fn update(&mut self, obs: Observation) -> Option<Transition> {
        let baseline = self.baseline_for(&obs);
        let magnitude = if self.config.signed {
            obs.score.abs()
        } else {
            obs.score
        };
        let rise = magnitude - self.prev_score.unwrap_or(magnitude);
        self.prev_score = Some(magnitude);
        self.last_time = Some(obs.time);

        match self.phase {
            Phase::Idle => self.step_idle(obs, magnitude, rise, baseline),
            Phase::Active => self.step_active(obs, magnitude, baseline),
        }
    }

    fn step_idle(
        &mut self,
        obs: Observation,
        magnitude: f32,
        rise: f32,
        baseline: f32,
    ) -> Option<Transition> {
        let qualifies = magnitude >= baseline + self.config.enter_threshold
            && self.config.min_rise.map_or(true, |r| rise >= r)
            && self
                .config
                .min_evidence
                .map_or(true, |m| obs.evidence.unwrap_or(0.0) >= m);

        if !qualifies {
            self.arm_window.clear();
            return None;
        }

        self.arm_window.push_back((obs.time, obs.score));
        if self.arm_window.len() > self.config.arm_samples {
            self.arm_window.pop_front();
        }
        if self.arm_window.len() < self.config.arm_samples {
            return None;
        }

        let direction = if self.config.signed {
            let scores: Vec<f32> = self.arm_window.iter().map(|&(_, s)| s).collect();
            Some(Direction::from_sign(stats::median_f32(&scores).unwrap_or(0.0)))
        } else {
            None
        };
        let start_time = match self.config.entry_stamp {
            EntryStamp::ArmStart => self.arm_window.front().map_or(obs.time, |&(t, _)| t),
            EntryStamp::Confirmation => obs.time,
        };

        self.open = Some(OpenEvent {
            start_time,
            peak_time: obs.time,
            peak_score: magnitude,
            direction,
            attributes: obs.attributes,
        });
        self.phase = Phase::Active;
        self.arm_window.clear();
        self.release_count = 0;
        debug!(
            "▶ Entered at {:.2}s (score={:.3}, baseline={:.3})",
            start_time, magnitude, baseline
        );
        Some(Transition::Entered {
            start_time,
            direction,
        })
    }

    fn step_active(&mut self, obs: Observation, magnitude: f32, baseline: f32) -> Option<Transition> {
        let mut direction_flipped = false;
        if let Some(open) = self.open.as_mut() {
            if let Some(dir) = open.direction {
                direction_flipped = obs.score != 0.0 && Direction::from_sign(obs.score) != dir;
            }
            if magnitude > open.peak_score && !direction_flipped {
                open.peak_score = magnitude;
                open.peak_time = obs.time;
                open.attributes = obs.attributes;
            }
        }

        let releasing = magnitude <= baseline + self.config.exit_threshold || direction_flipped;
        if releasing {
            self.release_count += 1;
        } else {
            self.release_count = 0;
        }

        if self.release_count >= self.config.release_samples {
            return self.close(obs.time).map(Transition::Exited);
        }
        None
    }

    /// Close the active event at `time`, regardless of the score.
    pub fn close(&mut self, time: f64) -> Option<Event> {
        let open = self.open.take()?;
        let event = open.close(time);
        self.phase = Phase::Idle;
        self.arm_window.clear();
        self.release_count = 0;
        debug!(
            "■ Exited at {:.2}s (peak={:.3} @ {:.2}s)",
            event.end_time, event.peak_score, event.peak_time
        );
        self.completed.push(event.clone());
        Some(event)
    }

    /// End of stream: force-close any active event at the last observed
    /// time and hand back every completed event.
    pub fn finish(mut self) -> Vec<Event> {
        if let Some(t) = self.last_time {
            self.close(t);
        }
        self.completed
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn run(machine: &mut HysteresisMachine, scores: &[f32]) -> Vec<Transition> {
        scores
            .iter()
            .enumerate()
            .filter_map(|(i, &s)| machine.update(Observation::new(i as f64, s)))
            .collect()
    }

    #[test]
    fn test_single_event_with_peak() {
        let mut m = HysteresisMachine::new(HysteresisConfig::default());
        let transitions = run(&mut m, &[0.05, 0.20, 0.25, 0.08, 0.05]);
        assert_eq!(transitions.len(), 2);

        let events = m.finish();
        assert_eq!(events.len(), 1);
        let e = &events[0];
        assert_eq!(e.start_time, 1.0);
        assert_eq!(e.peak_time, 2.0);
        assert!((e.peak_score - 0.25).abs() < 1e-6);
        assert_eq!(e.end_time, 3.0);
    }

    #[test]
    fn test_never_two_exits_in_a_row() {
        let mut m = HysteresisMachine::new(HysteresisConfig::default());
        let scores = [0.0, 0.3, 0.0, 0.0, 0.3, 0.3, 0.05, 0.3, 0.0, 0.0];
        let transitions = run(&mut m, &scores);
        let mut last_was_exit = true;
        for t in &transitions {
            match t {
                Transition::Entered { .. } => {
                    assert!(last_was_exit);
                    last_was_exit = false;
                }
                Transition::Exited(_) => {
                    assert!(!last_was_exit);
                    last_was_exit = true;
                }
            }
        }
    }

    #[test]
    fn test_arm_window_requires_consecutive_samples() {
        let cfg = HysteresisConfig {
            enter_threshold: 1.0,
            exit_threshold: 0.0,
            arm_samples: 3,
            release_samples: 3,
            entry_stamp: EntryStamp::Confirmation,
            ..Default::default()
        };
        let mut m = HysteresisMachine::new(cfg.clone());
        run(&mut m, &[1.0, 1.0, 0.0, 1.0, 1.0, 0.0]);
        assert!(!m.is_active());
        assert!(m.finish().is_empty());

        let mut m = HysteresisMachine::new(cfg);
        let t = run(&mut m, &[0.0, 1.0, 1.0, 1.0]);
        assert_eq!(
            t,
            vec![Transition::Entered {
                start_time: 3.0,
                direction: None
            }]
        );
    }

    #[test]
    fn test_signed_direction_and_flip_release() {
        let cfg = HysteresisConfig {
            enter_threshold: 0.5,
            exit_threshold: 0.3,
            signed: true,
            ..Default::default()
        };
        let mut m = HysteresisMachine::new(cfg);
        run(&mut m, &[0.0, -0.8, -0.9, 0.6]);
        let events = m.finish();
        assert_eq!(events.len(), 1);
        assert_eq!(events[0].direction, Some(Direction::Left));
        assert_eq!(events[0].end_time, 3.0);
        assert!((events[0].peak_score - 0.9).abs() < 1e-6);
    }

    #[test]
    fn test_min_rise_gate() {
        let cfg = HysteresisConfig {
            min_rise: Some(0.04),
            ..Default::default()
        };
        let mut m = HysteresisMachine::new(cfg);
        // Score is already high at the first sample: rise is zero
        run(&mut m, &[0.3, 0.3, 0.3]);
        assert!(!m.is_active());
    }

    #[test]
    fn test_evidence_gate() {
        let cfg = HysteresisConfig {
            min_evidence: Some(0.14),
            ..Default::default()
        };
        let mut m = HysteresisMachine::new(cfg);
        let mut obs = Observation::new(0.0, 0.5);
        obs.evidence = Some(0.05);
        assert!(m.update(obs).is_none());
        let mut obs = Observation::new(1.0, 0.5);
        obs.evidence = Some(0.2);
        assert!(matches!(m.update(obs), Some(Transition::Entered { .. })));
    }

    #[test]
    fn test_rolling_baseline_raises_threshold() {
        let cfg = HysteresisConfig {
            baseline: Baseline::RollingMedian {
                window: 5,
                min_samples: 1,
            },
            ..Default::default()
        };
        let mut m = HysteresisMachine::new(cfg);
        // A steady 0.5 level becomes the baseline and never triggers
        assert!(run(&mut m, &[0.5, 0.5, 0.5, 0.5, 0.5]).is_empty());
        assert!(!m.is_active());

        // A jump well above the median does
        let t = m.update(Observation::new(5.0, 0.9));
        assert!(matches!(t, Some(Transition::Entered { .. })));
    }

    #[test]
    fn test_finish_force_closes_at_last_time() {
        let mut m = HysteresisMachine::new(HysteresisConfig::default());
        run(&mut m, &[0.0, 0.5, 0.6, 0.7]);
        assert!(m.is_active());
        let events = m.finish();
        assert_eq!(events.len(), 1);
        assert_eq!(events[0].end_time, 3.0);
        assert!(events[0].is_well_ordered());
    }

    #[test]
    fn test_validate() {
        let bad = HysteresisConfig {
            enter_threshold: 0.1,
            exit_threshold: 0.2,
            ..Default::default()
        };
        assert!(bad.validate("x").is_err());

        let equal_needs_window = HysteresisConfig {
            enter_threshold: 8.0,
            exit_threshold: 8.0,
            ..Default::default()
        };
        assert!(equal_needs_window.validate("x").is_err());

        let equal_ok = HysteresisConfig {
            release_samples: 6,
            ..equal_needs_window
        };
        assert!(equal_ok.validate("x").is_ok());
    }
}
