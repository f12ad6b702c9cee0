// src/analysis/speed_aggregator.rs
//
// Robust reduction of a noisy per-sample speed stream to one value.
//
//   1. keep samples inside the plausible range
//   2. confidence-weighted mean as the fallback answer
//   3. IQR fence; if enough samples survive, report their median
//
// Also builds the smoothed per-second speed profile reported alongside it.

use super::ego_motion::SpeedSample;
use crate::error::{AnalysisError, Result};
use crate::stats;
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;

#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct AggregationConfig {
    pub min_speed_kmh: f64,
    pub max_speed_kmh: f64,
    /// Fewer plausible samples than this yields no estimate
    pub min_samples: usize,
    /// IQR fence multiplier
    pub iqr_k: f64,
    /// An estimate is successful above this confidence
    pub success_confidence: f64,
    /// Moving-average window of the speed profile, in seconds
    pub profile_window_secs: f64,
}

impl Default for AggregationConfig {
    fn default() -> Self {
        Self {
            min_speed_kmh: 3.0,
            max_speed_kmh: 150.0,
            min_samples: 3,
            iqr_k: 1.5,
            success_confidence: 0.3,
            profile_window_secs: 0.5,
        }
    }
}

impl AggregationConfig {
    /// Dense-flow reduction keeps the full [0, max] range; a slow crawl is
    /// still a measurement.
    pub fn dense() -> Self {
        Self {
            min_speed_kmh: 0.0,
            ..Self::default()
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Serialize)]
pub struct SpeedEstimate {
    pub speed_kmh: f64,
    pub confidence: f64,
    /// Samples that passed the plausibility range
    pub samples_used: usize,
    /// Samples that survived the IQR fence
    pub inliers: usize,
}

impl SpeedEstimate {
    pub fn zero() -> Self {
        Self {
            speed_kmh: 0.0,
            confidence: 0.0,
            samples_used: 0,
            inliers: 0,
        }
    }

    pub fn is_successful(&self, cfg: &AggregationConfig) -> bool {
        self.confidence > cfg.success_confidence
    }
}

/// Aggregate samples into one speed. `InsufficientSignal` when too few
/// plausible samples exist.
pub fn aggregate(samples: &[SpeedSample], cfg: &AggregationConfig) -> Result<SpeedEstimate> {
    if samples.len() < cfg.min_samples {
        return Err(AnalysisError::InsufficientSignal(format!(
            "{} speed samples, need {}",
            samples.len(),
            cfg.min_samples
        )));
    }

    let plausible: Vec<&SpeedSample> = samples
        .iter()
        .filter(|s| s.speed_kmh.is_finite())
        .filter(|s| (cfg.min_speed_kmh..=cfg.max_speed_kmh).contains(&s.speed_kmh))
        .collect();
    if plausible.is_empty() {
        return Err(AnalysisError::InsufficientSignal(
            "no speed sample inside the plausible range".into(),
        ));
    }

    let speeds: Vec<f64> = plausible.iter().map(|s| s.speed_kmh).collect();
    let confidences: Vec<f64> = plausible.iter().map(|s| s.confidence.max(0.0)).collect();

    let weighted = if confidences.iter().sum::<f64>() > 0.0 {
        stats::weighted_mean(&speeds, &confidences).unwrap_or(0.0)
    } else {
        stats::median(&speeds).unwrap_or(0.0)
    };
    let confidence = stats::mean(&confidences).unwrap_or(0.0);

    let filtered: Vec<f64> = match stats::iqr_bounds(&speeds, cfg.iqr_k) {
        Some((lo, hi)) => speeds.iter().copied().filter(|s| (lo..=hi).contains(s)).collect(),
        None => Vec::new(),
    };

    let speed = if filtered.len() >= cfg.min_samples {
        stats::median(&filtered).unwrap_or(weighted)
    } else {
        weighted
    };

    Ok(SpeedEstimate {
        speed_kmh: speed,
        confidence,
        samples_used: speeds.len(),
        inliers: filtered.len(),
    })
}

/// One bucket of the per-second speed profile.
#[derive(Debug, Clone, Copy, PartialEq, Serialize)]
pub struct ProfilePoint {
    pub second: u64,
    pub speed_kmh: f64,
}

/// Moving average over `profile_window_secs` of samples (full windows
/// only), then the mean per whole second of video time.
pub fn speed_profile(
    samples: &[SpeedSample],
    sample_hz: f64,
    cfg: &AggregationConfig,
) -> Vec<ProfilePoint> {
    let window = ((sample_hz * cfg.profile_window_secs) as usize).max(1);
    if samples.len() < window {
        return Vec::new();
    }

    let mut buckets: BTreeMap<u64, (f64, usize)> = BTreeMap::new();
    for chunk in samples.windows(window) {
        let avg = chunk.iter().map(|s| s.speed_kmh).sum::<f64>() / window as f64;
        let t = chunk[window - 1].time.max(0.0);
        let entry = buckets.entry(t.floor() as u64).or_insert((0.0, 0));
        entry.0 += avg;
        entry.1 += 1;
    }

    buckets
        .into_iter()
        .map(|(second, (sum, n))| ProfilePoint {
            second,
            speed_kmh: sum / n as f64,
        })
        .collect()
}

#[cfg(test)]
mod tests {
    use super::*;

    fn samples(speeds: &[f64], conf: f64) -> Vec<SpeedSample> {
        speeds
            .iter()
            .enumerate()
            .map(|(i, &s)| SpeedSample {
                time: i as f64 * 0.2,
                speed_kmh: s,
                confidence: conf,
            })
            .collect()
    }

    #[test]
    fn test_median_after_iqr() {
        let s = samples(&[40.0, 42.0, 41.0, 43.0, 39.0, 140.0], 0.8);
        let est = aggregate(&s, &AggregationConfig::default()).unwrap();
        assert!((est.speed_kmh - 41.0).abs() < 1e-9);
        assert_eq!(est.samples_used, 6);
        assert_eq!(est.inliers, 5);
        assert!((est.confidence - 0.8).abs() < 1e-9);
    }

    #[test]
    fn test_out_of_range_dropped() {
        let s = samples(&[1.0, 2.0, 200.0, 50.0, 52.0, 51.0], 0.5);
        let est = aggregate(&s, &AggregationConfig::default()).unwrap();
        assert_eq!(est.samples_used, 3);
        assert!((est.speed_kmh - 51.0).abs() < 1e-9);
    }

    #[test]
    fn test_weighted_fallback() {
        // Two plausible samples: too few for the median path
        let mut s = samples(&[0.0, 30.0, 60.0], 1.0);
        s[2].confidence = 3.0;
        let est = aggregate(&s, &AggregationConfig::default()).unwrap();
        assert!((est.speed_kmh - 52.5).abs() < 1e-9);
    }

    #[test]
    fn test_insufficient_samples() {
        let s = samples(&[50.0, 51.0], 0.9);
        assert!(matches!(
            aggregate(&s, &AggregationConfig::default()),
            Err(AnalysisError::InsufficientSignal(_))
        ));
        let s = samples(&[0.0, 0.0, 0.0, 0.0], 0.0);
        assert!(aggregate(&s, &AggregationConfig::default()).is_err());
    }

    #[test]
    fn test_dense_keeps_low_speeds() {
        let s = samples(&[2.0; 10], 0.5);
        assert!(aggregate(&s, &AggregationConfig::default()).is_err());

        let est = aggregate(&s, &AggregationConfig::dense()).unwrap();
        assert!((est.speed_kmh - 2.0).abs() < 1e-9);
        assert_eq!(est.samples_used, 10);
        assert!(est.is_successful(&AggregationConfig::dense()));
    }

    #[test]
    fn test_dense_zero_confidence_stays_zero() {
        let s = samples(&[0.0; 6], 0.0);
        let est = aggregate(&s, &AggregationConfig::dense()).unwrap();
        assert_eq!(est.speed_kmh, 0.0);
        assert_eq!(est.confidence, 0.0);
    }

    #[test]
    fn test_deterministic() {
        let s = samples(&[33.0, 35.5, 31.2, 90.0, 34.4, 36.1, 32.8], 0.6);
        let cfg = AggregationConfig::default();
        assert_eq!(aggregate(&s, &cfg).unwrap(), aggregate(&s, &cfg).unwrap());
    }

    #[test]
    fn test_success_threshold() {
        let cfg = AggregationConfig::default();
        let mut est = SpeedEstimate::zero();
        assert!(!est.is_successful(&cfg));
        est.confidence = 0.31;
        assert!(est.is_successful(&cfg));
    }

    #[test]
    fn test_profile_buckets() {
        // 5 Hz, window 2 samples
        let s = samples(&[10.0, 20.0, 30.0, 40.0, 50.0, 60.0, 70.0], 1.0);
        let profile = speed_profile(&s, 5.0, &AggregationConfig::default());
        // Window ends at t=0.2,0.4,0.6,0.8 → second 0; t=1.0,1.2 → second 1
        assert_eq!(profile.len(), 2);
        assert_eq!(profile[0].second, 0);
        assert!((profile[0].speed_kmh - 30.0).abs() < 1e-9);
        assert!((profile[1].speed_kmh - 60.0).abs() < 1e-9);
    }
}
