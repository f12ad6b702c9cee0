// src/pipeline/metrics.rs
//
// Per-extractor throughput, reported alongside each modality's result.

use crate::video_processor::SamplerStats;
use serde::Serialize;
use std::time::Duration;

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct ExtractorStats {
    pub modality: String,
    pub frames_read: u64,
    pub frames_sampled: u64,
    pub effective_hz: f64,
    pub elapsed_secs: f64,
    /// Sampled frames processed per wall-clock second
    pub processing_fps: f64,
}

impl ExtractorStats {
    pub fn new(modality: &str, sampler: SamplerStats, effective_hz: f64, elapsed: Duration) -> Self {
        let elapsed_secs = elapsed.as_secs_f64();
        let processing_fps = if elapsed_secs > 0.01 {
            sampler.frames_sampled as f64 / elapsed_secs
        } else {
            0.0
        };
        Self {
            modality: modality.to_string(),
            frames_read: sampler.frames_read,
            frames_sampled: sampler.frames_sampled,
            effective_hz,
            elapsed_secs,
            processing_fps,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_processing_fps() {
        let s = ExtractorStats::new(
            "speed",
            SamplerStats {
                frames_read: 300,
                frames_sampled: 50,
            },
            5.0,
            Duration::from_secs(2),
        );
        assert_eq!(s.processing_fps, 25.0);
        assert_eq!(s.frames_read, 300);
    }

    #[test]
    fn test_instant_run_reports_zero_fps() {
        let s = ExtractorStats::new("turns", SamplerStats::default(), 10.0, Duration::ZERO);
        assert_eq!(s.processing_fps, 0.0);
    }
}
