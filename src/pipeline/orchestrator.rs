// src/pipeline/orchestrator.rs
//
// Runs every enabled modality over one video and assembles the report.
//
//   probe source (fatal on failure)
//     ├─ speed          ─┐
//     ├─ lane_change     │  one sampler + extractor each,
//     ├─ turns           ├─ own source handle, rayon when parallel
//     ├─ proximity       │
//     ├─ band_encounters │
//     └─ lane_color     ─┘
//
// A failing modality is recorded on that modality only.

use super::metrics::ExtractorStats;
use crate::analysis::{
    BandEncounterExtractor, BandEncounterResult, LaneChangeExtractor, LaneChangeResult,
    LaneColorExtractor, LaneColorResult, ProximityExtractor, ProximityResult, SignalExtractor,
    SpeedExtractor, SpeedResult, StreamTiming, TurnExtractor, TurnResult,
};
use crate::config::AnalysisConfig;
use crate::error::Result;
use crate::vehicle_detection::Detector;
use crate::video_processor::{open_source, FrameSampler, FrameSource, SourceInfo};
use chrono::Utc;
use serde::Serialize;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::Instant;
use tracing::{error, info, warn};

// ============================================================================
// SINGLE EXTRACTOR
// ============================================================================

/// Drive one extractor over an open source to completion.
pub fn run_extractor<E: SignalExtractor>(
    source: Box<dyn FrameSource>,
    mut extractor: E,
) -> Result<(E::Output, ExtractorStats)> {
    let started = Instant::now();
    let name = extractor.name();
    let mut sampler = FrameSampler::new(source, extractor.sampling());
    let timing = StreamTiming {
        native_fps: sampler.native_fps(),
        effective_hz: sampler.effective_hz(),
        native_width: sampler.native_width(),
    };

    for frame in sampler.by_ref() {
        extractor.process(&frame, &timing)?;
    }

    let output = extractor.finish(&timing);
    let stats = ExtractorStats::new(name, sampler.stats(), timing.effective_hz, started.elapsed());
    info!(
        "✓ {}: {} of {} frames in {:.2}s ({:.1} FPS)",
        name, stats.frames_sampled, stats.frames_read, stats.elapsed_secs, stats.processing_fps
    );
    Ok((output, stats))
}

// ============================================================================
// REPORT TYPES
// ============================================================================

#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(tag = "status", rename_all = "snake_case")]
pub enum ModalityOutcome<T> {
    Completed { result: T, stats: ExtractorStats },
    Failed { error: String },
    Skipped,
}

impl<T> ModalityOutcome<T> {
    pub fn result(&self) -> Option<&T> {
        match self {
            Self::Completed { result, .. } => Some(result),
            _ => None,
        }
    }

    pub fn is_failed(&self) -> bool {
        matches!(self, Self::Failed { .. })
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Serialize)]
pub struct VideoMetadata {
    /// Frame rate used for timestamps
    pub fps: f64,
    pub reported_fps: Option<f64>,
    pub frame_count: Option<u64>,
    pub duration_secs: Option<f64>,
    pub width: usize,
    pub height: usize,
}

impl From<SourceInfo> for VideoMetadata {
    fn from(info: SourceInfo) -> Self {
        let fps = info.effective_fps();
        Self {
            fps,
            reported_fps: info.fps,
            frame_count: info.frame_count,
            duration_secs: info.frame_count.map(|n| n as f64 / fps),
            width: info.width,
            height: info.height,
        }
    }
}

#[derive(Debug, Clone, Default, PartialEq, Serialize)]
pub struct ReportSummary {
    pub average_speed_kmh: Option<f64>,
    pub lane_changes: usize,
    pub turns: usize,
    pub close_encounters: usize,
    pub lane_color_violations: usize,
    /// Any traffic-rule violation. Close encounters are counted on their own
    /// and do not raise it.
    pub safety_violation: bool,
    pub failed_modalities: Vec<String>,
}

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct VideoReport {
    pub video: String,
    pub analyzed_at: String,
    pub metadata: VideoMetadata,
    pub summary: ReportSummary,
    pub speed: ModalityOutcome<SpeedResult>,
    pub lane_changes: ModalityOutcome<LaneChangeResult>,
    pub turns: ModalityOutcome<TurnResult>,
    pub close_encounters: ModalityOutcome<ProximityResult>,
    pub band_encounters: ModalityOutcome<BandEncounterResult>,
    pub lane_color: ModalityOutcome<LaneColorResult>,
}

impl VideoReport {
    fn summarize(&mut self) {
        let failed_modalities = [
            ("speed", self.speed.is_failed()),
            ("lane_changes", self.lane_changes.is_failed()),
            ("turns", self.turns.is_failed()),
            ("close_encounters", self.close_encounters.is_failed()),
            ("band_encounters", self.band_encounters.is_failed()),
            ("lane_color", self.lane_color.is_failed()),
        ]
        .into_iter()
        .filter(|&(_, failed)| failed)
        .map(|(name, _)| name.to_string())
        .collect();

        let proximity = self.close_encounters.result().map_or(0, |r| r.event_count);
        let bands = self.band_encounters.result().map_or(0, |r| r.event_count);
        let lane_color_violations = self.lane_color.result().map_or(0, |r| r.event_count);
        self.summary = ReportSummary {
            average_speed_kmh: self
                .speed
                .result()
                .filter(|r| r.successful)
                .map(|r| r.average_speed_kmh),
            lane_changes: self.lane_changes.result().map_or(0, |r| r.lane_change_count),
            turns: self.turns.result().map_or(0, |r| r.turn_count),
            close_encounters: proximity.max(bands),
            lane_color_violations,
            safety_violation: lane_color_violations > 0,
            failed_modalities,
        };
    }
}

#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(tag = "status", rename_all = "snake_case")]
pub enum VideoOutcome {
    Completed { report: Box<VideoReport> },
    Failed { video: String, error: String },
}

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct BatchReport {
    pub generated_at: String,
    pub videos_total: usize,
    pub videos_succeeded: usize,
    pub videos_failed: usize,
    pub results: Vec<VideoOutcome>,
}

impl BatchReport {
    pub fn new(results: Vec<VideoOutcome>) -> Self {
        let videos_failed = results
            .iter()
            .filter(|r| matches!(r, VideoOutcome::Failed { .. }))
            .count();
        Self {
            generated_at: Utc::now().to_rfc3339(),
            videos_total: results.len(),
            videos_succeeded: results.len() - videos_failed,
            videos_failed,
            results,
        }
    }
}

// ============================================================================
// ANALYZER
// ============================================================================

pub struct VideoAnalyzer {
    config: AnalysisConfig,
    detector: Option<Arc<dyn Detector>>,
}

impl VideoAnalyzer {
    pub fn new(config: AnalysisConfig, detector: Option<Arc<dyn Detector>>) -> Result<Self> {
        config.validate()?;
        Ok(Self { config, detector })
    }

    pub fn config(&self) -> &AnalysisConfig {
        &self.config
    }

    fn run_modality<E: SignalExtractor>(
        &self,
        path: &Path,
        enabled: bool,
        make: impl FnOnce() -> E,
    ) -> ModalityOutcome<E::Output> {
        if !enabled {
            return ModalityOutcome::Skipped;
        }
        let outcome = open_source(path, &self.config.source).and_then(|src| run_extractor(src, make()));
        match outcome {
            Ok((result, stats)) => ModalityOutcome::Completed { result, stats },
            Err(e) => {
                warn!("⚠️  {}: modality failed: {}", path.display(), e);
                ModalityOutcome::Failed {
                    error: e.to_string(),
                }
            }
        }
    }

    /// Analyze one video. Fails only when the source cannot be opened.
    pub fn analyze(&self, path: &Path) -> Result<VideoReport> {
        let metadata = {
            let probe = open_source(path, &self.config.source)?;
            VideoMetadata::from(probe.info())
        };
        info!(
            "🎬 {}: {}x{} @ {:.2} FPS, {} frames",
            path.display(),
            metadata.width,
            metadata.height,
            metadata.fps,
            metadata.frame_count.map_or("?".to_string(), |n| n.to_string())
        );

        let cfg = &self.config;
        let on = &cfg.modalities;
        let speed = || self.run_modality(path, on.speed, || SpeedExtractor::new(cfg.speed.clone()));
        let lane = || {
            self.run_modality(path, on.lane_change, || {
                LaneChangeExtractor::new(cfg.lane_change.clone())
            })
        };
        let turns = || self.run_modality(path, on.turns, || TurnExtractor::new(cfg.turns.clone()));
        let proximity = || {
            self.run_modality(path, on.proximity, || {
                ProximityExtractor::new(cfg.proximity.clone(), self.detector.clone())
            })
        };
        let bands = || {
            self.run_modality(path, on.band_encounters, || {
                BandEncounterExtractor::new(cfg.band_encounters.clone(), self.detector.clone())
            })
        };
        let color = || {
            self.run_modality(path, on.lane_color, || {
                LaneColorExtractor::new(cfg.lane_color.clone())
            })
        };

        let (speed, lane_changes, turns, close_encounters, band_encounters, lane_color) = if cfg.parallel {
            let ((speed, lane), ((turns, proximity), (bands, color))) = rayon::join(
                || rayon::join(speed, lane),
                || rayon::join(|| rayon::join(turns, proximity), || rayon::join(bands, color)),
            );
            (speed, lane, turns, proximity, bands, color)
        } else {
            (speed(), lane(), turns(), proximity(), bands(), color())
        };

        let mut report = VideoReport {
            video: path.display().to_string(),
            analyzed_at: Utc::now().to_rfc3339(),
            metadata,
            summary: ReportSummary::default(),
            speed,
            lane_changes,
            turns,
            close_encounters,
            band_encounters,
            lane_color,
        };
        report.summarize();
        info!(
            "📊 {}: lane changes {}, turns {}, close encounters {}, lane color {}",
            path.display(),
            report.summary.lane_changes,
            report.summary.turns,
            report.summary.close_encounters,
            report.summary.lane_color_violations
        );
        Ok(report)
    }

    /// Analyze one video, folding a fatal error into a failure record.
    pub fn analyze_outcome(&self, path: &Path) -> VideoOutcome {
        match self.analyze(path) {
            Ok(report) => VideoOutcome::Completed {
                report: Box::new(report),
            },
            Err(e) => {
                error!("❌ {}: {}", path.display(), e);
                VideoOutcome::Failed {
                    video: path.display().to_string(),
                    error: e.to_string(),
                }
            }
        }
    }

    /// Analyze every video; one failure never stops the rest.
    pub fn analyze_batch(&self, paths: &[PathBuf]) -> BatchReport {
        let results = paths
            .iter()
            .enumerate()
            .map(|(i, p)| {
                info!("Processing video {}/{}: {}", i + 1, paths.len(), p.display());
                self.analyze_outcome(p)
            })
            .collect();
        BatchReport::new(results)
    }
}
