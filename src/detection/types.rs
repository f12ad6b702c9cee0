// src/detection/types.rs

use crate::types::{Direction, Location};
use serde::{Serialize, Serializer};
use serde_json::{Map, Value};

/// A finalized driving event. Immutable once emitted by a state machine.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct Event {
    #[serde(serialize_with = "round_secs")]
    pub start_time: f64,
    #[serde(serialize_with = "round_secs")]
    pub end_time: f64,
    #[serde(serialize_with = "round_secs")]
    pub peak_time: f64,
    #[serde(serialize_with = "round_score")]
    pub peak_score: f32,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub direction: Option<Direction>,
    #[serde(rename = "where", skip_serializing_if = "Option::is_none")]
    pub location: Option<Location>,
    /// Modality-specific primitive attributes captured at the peak
    #[serde(flatten)]
    pub extra: Map<String, Value>,
}

impl Event {
    pub fn duration(&self) -> f64 {
        self.end_time - self.start_time
    }

    pub fn is_well_ordered(&self) -> bool {
        self.start_time <= self.peak_time && self.peak_time <= self.end_time
    }
}

/// Peak attributes carried alongside a score.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct PeakAttributes {
    pub location: Option<Location>,
    pub extra: Map<String, Value>,
}

impl PeakAttributes {
    pub fn with_location(mut self, location: Location) -> Self {
        self.location = Some(location);
        self
    }

    pub fn with(mut self, key: &str, value: impl Into<Value>) -> Self {
        self.extra.insert(key.to_string(), value.into());
        self
    }
}

pub fn round_to(value: f64, places: i32) -> f64 {
    let factor = 10f64.powi(places);
    (value * factor).round() / factor
}

fn round_secs<S: Serializer>(value: &f64, s: S) -> Result<S::Ok, S::Error> {
    s.serialize_f64(round_to(*value, 2))
}

fn round_score<S: Serializer>(value: &f32, s: S) -> Result<S::Ok, S::Error> {
    s.serialize_f64(round_to(*value as f64, 3))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_event_serializes_flat() {
        let event = Event {
            start_time: 1.234,
            end_time: 2.0,
            peak_time: 1.5,
            peak_score: 0.87654,
            direction: None,
            location: Some(Location::Center),
            extra: PeakAttributes::default()
                .with("min_distance_m", 7.5)
                .extra,
        };
        let json = serde_json::to_value(&event).unwrap();
        assert_eq!(json["start_time"], 1.23);
        assert_eq!(json["peak_score"], 0.877);
        assert_eq!(json["where"], "center");
        assert_eq!(json["min_distance_m"], 7.5);
        assert!(json.get("direction").is_none());
    }
}
