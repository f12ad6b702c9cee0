// src/config.rs
//
// Top-level configuration: one section per modality, every field optional
// in YAML and defaulting to the documented values.

use crate::analysis::{
    BandEncounterConfig, LaneChangeConfig, LaneColorConfig, ProximityConfig, SpeedConfig,
    TurnConfig,
};
use crate::error::{AnalysisError, Result};
use crate::vehicle_detection::DetectorConfig;
use crate::video_processor::SourceConfig;
use serde::{Deserialize, Serialize};
use std::fs;
use std::path::Path;
use tracing::debug;

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct VideoConfig {
    pub input_dir: String,
    pub output_dir: String,
}

impl Default for VideoConfig {
    fn default() -> Self {
        Self {
            input_dir: "videos".to_string(),
            output_dir: "output".to_string(),
        }
    }
}

/// Which modalities run for each video.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct ModalityToggles {
    pub speed: bool,
    pub lane_change: bool,
    pub turns: bool,
    pub proximity: bool,
    pub band_encounters: bool,
    pub lane_color: bool,
}

impl Default for ModalityToggles {
    fn default() -> Self {
        Self {
            speed: true,
            lane_change: true,
            turns: true,
            proximity: true,
            band_encounters: false,
            lane_color: true,
        }
    }
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct AnalysisConfig {
    pub video: VideoConfig,
    pub source: SourceConfig,
    pub detector: DetectorConfig,
    pub modalities: ModalityToggles,
    /// Run the modalities of one video on the rayon pool
    pub parallel: bool,
    pub speed: SpeedConfig,
    pub lane_change: LaneChangeConfig,
    pub turns: TurnConfig,
    pub proximity: ProximityConfig,
    pub band_encounters: BandEncounterConfig,
    pub lane_color: LaneColorConfig,
}

impl AnalysisConfig {
    pub fn load(path: impl AsRef<Path>) -> Result<Self> {
        let path = path.as_ref();
        let contents = fs::read_to_string(path)?;
        let config: AnalysisConfig = serde_yaml::from_str(&contents).map_err(|e| {
            AnalysisError::InvalidConfig(format!("{}: {}", path.display(), e))
        })?;
        config.validate()?;
        debug!("Configuration loaded from {}", path.display());
        Ok(config)
    }

    pub fn validate(&self) -> Result<()> {
        self.speed.validate()?;
        self.lane_change.validate()?;
        self.turns.validate()?;
        self.proximity.validate()?;
        self.band_encounters.validate()?;
        self.lane_color.validate()?;
        if self.source.image_sequence_fps.is_nan() || self.source.image_sequence_fps <= 0.0 {
            return Err(AnalysisError::InvalidConfig(
                "source.image_sequence_fps must be positive".into(),
            ));
        }
        Ok(())
    }
}
