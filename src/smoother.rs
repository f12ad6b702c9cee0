// src/smoother.rs
//
// Temporal filters applied to raw per-frame scores before they reach the
// hysteresis state machine.

use crate::stats;
use serde::{Deserialize, Serialize};
use std::collections::VecDeque;

/// Exponential moving average.
#[derive(Debug, Clone)]
pub struct Ema {
    alpha: f32,
    value: Option<f32>,
    seed: EmaSeed,
}

/// How the first sample initializes the average.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum EmaSeed {
    /// Start from zero and blend the first sample in like any other
    Zero,
    /// Take the first sample as-is
    FirstSample,
}

impl Ema {
    pub fn new(alpha: f32, seed: EmaSeed) -> Self {
        Self {
            alpha: alpha.clamp(0.0, 1.0),
            value: None,
            seed,
        }
    }

    pub fn update(&mut self, x: f32) -> f32 {
        let next = match (self.value, self.seed) {
            (Some(prev), _) => self.alpha * x + (1.0 - self.alpha) * prev,
            (None, EmaSeed::FirstSample) => x,
            (None, EmaSeed::Zero) => self.alpha * x,
        };
        self.value = Some(next);
        next
    }

    pub fn value(&self) -> f32 {
        self.value.unwrap_or(0.0)
    }
}

/// Trailing median over the last `window` samples.
#[derive(Debug, Clone)]
pub struct RollingMedian {
    window: usize,
    history: VecDeque<f32>,
}

impl RollingMedian {
    pub fn new(window: usize) -> Self {
        Self {
            window: window.max(1),
            history: VecDeque::with_capacity(window.max(1)),
        }
    }

    pub fn push(&mut self, x: f32) {
        self.history.push_back(x);
        if self.history.len() > self.window {
            self.history.pop_front();
        }
    }

    pub fn len(&self) -> usize {
        self.history.len()
    }

    pub fn is_empty(&self) -> bool {
        self.history.is_empty()
    }

    pub fn median(&self) -> Option<f32> {
        let v: Vec<f32> = self.history.iter().copied().collect();
        stats::median_f32(&v)
    }
}

/// Streaming centered median filter.
///
/// Output for sample `i` is available once `i + window/2` has been pushed,
/// so outputs lag inputs by half a window. Edges use the truncated window,
/// which matches a batch median filter over the whole series.
#[derive(Debug, Clone)]
pub struct CenteredMedian<T> {
    half: usize,
    values: VecDeque<f32>,
    pending: VecDeque<T>,
    /// Number of values already dropped from the front of `values`
    dropped: usize,
    emitted: usize,
}

impl<T> CenteredMedian<T> {
    pub fn new(window: usize) -> Self {
        let half = window.max(1) / 2;
        Self {
            half,
            values: VecDeque::new(),
            pending: VecDeque::new(),
            dropped: 0,
            emitted: 0,
        }
    }

    /// Push a sample with its payload; returns the payloads whose median is
    /// now final, paired with that median.
    pub fn push(&mut self, value: f32, payload: T) -> Vec<(T, f32)> {
        self.values.push_back(value);
        self.pending.push_back(payload);
        let mut out = Vec::new();
        let total = self.dropped + self.values.len();
        while self.emitted + self.half < total {
            if let Some(item) = self.emit_next(total) {
                out.push(item);
            }
        }
        out
    }

    /// Drain the tail once the stream has ended.
    pub fn flush(&mut self) -> Vec<(T, f32)> {
        let total = self.dropped + self.values.len();
        let mut out = Vec::new();
        while self.emitted < total {
            if let Some(item) = self.emit_next(total) {
                out.push(item);
            }
        }
        out
    }

    fn emit_next(&mut self, total: usize) -> Option<(T, f32)> {
        let center = self.emitted;
        let lo = center.saturating_sub(self.half);
        let hi = (center + self.half + 1).min(total);
        let window: Vec<f32> = (lo..hi)
            .map(|i| self.values[i - self.dropped])
            .collect();
        let med = stats::median_f32(&window).unwrap_or(0.0);
        self.emitted += 1;

        // Values left of the next window's start are no longer needed
        let next_lo = self.emitted.saturating_sub(self.half);
        while self.dropped < next_lo {
            self.values.pop_front();
            self.dropped += 1;
        }
        self.pending.pop_front().map(|p| (p, med))
    }
}

/// Score smoothing policy selectable from configuration.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum SmoothingConfig {
    None,
    Exponential { alpha: f32, seed: EmaSeed },
    Median { window: usize },
}

/// Causal smoother built from a [`SmoothingConfig`].
#[derive(Debug, Clone)]
pub enum ScoreSmoother {
    Passthrough,
    Exponential(Ema),
    Median(RollingMedian),
}

impl ScoreSmoother {
    pub fn from_config(cfg: &SmoothingConfig) -> Self {
        match *cfg {
            SmoothingConfig::None => Self::Passthrough,
            SmoothingConfig::Exponential { alpha, seed } => Self::Exponential(Ema::new(alpha, seed)),
            SmoothingConfig::Median { window } => Self::Median(RollingMedian::new(window)),
        }
    }

    pub fn smooth(&mut self, x: f32) -> f32 {
        match self {
            Self::Passthrough => x,
            Self::Exponential(ema) => ema.update(x),
            Self::Median(m) => {
                m.push(x);
                m.median().unwrap_or(x)
            }
        }
    }
}
