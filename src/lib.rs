// src/lib.rs
//
// Driving-behaviour event detection from dashcam video.
//
// Independent per-modality extractors (speed, lane changes, turns, close
// encounters, lane-color occupancy) each scan a sampled frame stream and
// turn noisy per-frame scores into timestamped events through a shared
// hysteresis machine.

pub mod analysis;
pub mod color_analysis;
pub mod config;
pub mod detection;
pub mod error;
#[cfg(feature = "yolo")]
pub mod inference;
pub mod pipeline;
pub mod preprocessing;
pub mod smoother;
pub mod stats;
pub mod types;
pub mod vehicle_detection;
pub mod video_processor;

pub use config::AnalysisConfig;
pub use error::{AnalysisError, Result};
pub use pipeline::{BatchReport, VideoAnalyzer, VideoReport};
