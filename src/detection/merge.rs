// src/detection/merge.rs

use super::types::Event;
use serde::{Deserialize, Serialize};
use std::cmp::Ordering;
use tracing::debug;

#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct FinalizeConfig {
    /// Events shorter than this are discarded
    pub min_duration_secs: f64,
    /// Events separated by at most this gap are merged; `None` disables merging
    pub merge_gap_secs: Option<f64>,
}

impl Default for FinalizeConfig {
    fn default() -> Self {
        Self {
            min_duration_secs: 0.2,
            merge_gap_secs: Some(2.0),
        }
    }
}

/// Drop short events, order chronologically, and merge neighbours whose
/// gap is within `merge_gap_secs`. The merged event keeps the stronger
/// peak's attributes and the later end time.
pub fn finalize_events(mut events: Vec<Event>, cfg: &FinalizeConfig) -> Vec<Event> {
    let before = events.len();
    events.retain(|e| e.duration() >= cfg.min_duration_secs && e.is_well_ordered());
    events.sort_by(|a, b| {
        a.start_time
            .partial_cmp(&b.start_time)
            .unwrap_or(Ordering::Equal)
    });

    let mut merged: Vec<Event> = Vec::with_capacity(events.len());
    for event in events {
        let Some(gap) = cfg.merge_gap_secs else {
            merged.push(event);
            continue;
        };
        match merged.last_mut() {
            Some(last) if event.start_time - last.end_time <= gap => {
                let end_time = last.end_time.max(event.end_time);
                if event.peak_score > last.peak_score {
                    let start_time = last.start_time;
                    *last = event;
                    last.start_time = start_time;
                }
                last.end_time = end_time;
            }
            _ => merged.push(event),
        }
    }

    if merged.len() != before {
        debug!("Finalized {} raw events into {}", before, merged.len());
    }
    merged
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::types::Location;
    use serde_json::Map;

    fn event(start: f64, end: f64, peak_time: f64, peak: f32) -> Event {
        Event {
            start_time: start,
            end_time: end,
            peak_time,
            peak_score: peak,
            direction: None,
            location: None,
            extra: Map::new(),
        }
    }

    #[test]
    fn test_drops_short_events() {
        let cfg = FinalizeConfig {
            min_duration_secs: 1.0,
            merge_gap_secs: None,
        };
        let out = finalize_events(vec![event(0.0, 0.5, 0.2, 1.0), event(2.0, 3.5, 3.0, 1.0)], &cfg);
        assert_eq!(out.len(), 1);
        assert_eq!(out[0].start_time, 2.0);
    }

    #[test]
    fn test_merge_keeps_stronger_peak_and_later_end() {
        let cfg = FinalizeConfig::default();
        let mut strong = event(4.0, 6.0, 5.0, 0.9);
        strong.location = Some(Location::Right);
        let mut weak = event(1.0, 3.0, 2.0, 0.4);
        weak.location = Some(Location::Left);

        let out = finalize_events(vec![strong, weak], &cfg);
        assert_eq!(out.len(), 1);
        let e = &out[0];
        assert_eq!(e.start_time, 1.0);
        assert_eq!(e.end_time, 6.0);
        assert_eq!(e.peak_time, 5.0);
        assert!((e.peak_score - 0.9).abs() < 1e-6);
        assert_eq!(e.location, Some(Location::Right));
        assert!(e.is_well_ordered());
    }

    #[test]
    fn test_gap_above_threshold_stays_separate() {
        let cfg = FinalizeConfig::default();
        let out = finalize_events(vec![event(0.0, 1.0, 0.5, 0.5), event(3.5, 4.0, 3.7, 0.5)], &cfg);
        assert_eq!(out.len(), 2);
    }

    #[test]
    fn test_merge_when_earlier_peak_wins() {
        let cfg = FinalizeConfig::default();
        let out = finalize_events(vec![event(0.0, 1.0, 0.5, 0.8), event(2.0, 3.0, 2.5, 0.3)], &cfg);
        assert_eq!(out.len(), 1);
        assert_eq!(out[0].end_time, 3.0);
        assert_eq!(out[0].peak_time, 0.5);
    }
}
