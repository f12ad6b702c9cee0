// src/main.rs

use anyhow::{Context, Result};
use chrono::Local;
use drive_events::config::AnalysisConfig;
use drive_events::pipeline::{VideoAnalyzer, VideoOutcome};
use drive_events::vehicle_detection::{Detector, DetectorConfig};
use drive_events::video_processor::find_video_files;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use tracing::{error, info, warn};
use tracing_subscriber::EnvFilter;

fn main() -> Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| EnvFilter::new("drive_events=info,ort=warn")),
        )
        .init();

    info!("🚗 Driving Event Detection Starting");

    let config_path =
        std::env::var("DRIVE_EVENTS_CONFIG").unwrap_or_else(|_| "config.yaml".to_string());
    let config = if Path::new(&config_path).exists() {
        AnalysisConfig::load(&config_path)
            .with_context(|| format!("loading configuration from {config_path}"))?
    } else {
        warn!("⚠️  {} not found, using default configuration", config_path);
        AnalysisConfig::default()
    };
    info!("✓ Configuration loaded");

    let input_dir = std::env::args()
        .nth(1)
        .unwrap_or_else(|| config.video.input_dir.clone());
    let output_dir = PathBuf::from(&config.video.output_dir);

    let videos = find_video_files(Path::new(&input_dir), &config.source.video_extensions);
    if videos.is_empty() {
        error!("No video files found in {}", input_dir);
        return Ok(());
    }

    let detector = build_detector(&config.detector);
    let analyzer = VideoAnalyzer::new(config, detector).context("invalid configuration")?;

    std::fs::create_dir_all(&output_dir)
        .with_context(|| format!("creating output directory {}", output_dir.display()))?;

    let batch = analyzer.analyze_batch(&videos);

    for outcome in &batch.results {
        if let VideoOutcome::Completed { report } = outcome {
            let stem = Path::new(&report.video)
                .file_stem()
                .map(|s| s.to_string_lossy().into_owned())
                .unwrap_or_else(|| "video".to_string());
            let path = output_dir.join(format!("{stem}_analysis.json"));
            write_json(&path, report)?;
            info!("💾 {}", path.display());
        }
    }

    let merged = output_dir.join(format!(
        "batch_report_{}.json",
        Local::now().format("%Y%m%d_%H%M%S")
    ));
    write_json(&merged, &batch)?;

    info!("\n========================================");
    info!("✓ Batch complete: {}/{} videos analyzed", batch.videos_succeeded, batch.videos_total);
    if batch.videos_failed > 0 {
        warn!("  ❌ Failed: {}", batch.videos_failed);
    }
    info!("  💾 Merged report: {}", merged.display());
    info!("========================================");

    Ok(())
}

fn write_json<T: serde::Serialize>(path: &Path, value: &T) -> Result<()> {
    let file = std::fs::File::create(path)
        .with_context(|| format!("creating {}", path.display()))?;
    serde_json::to_writer_pretty(file, value)
        .with_context(|| format!("writing {}", path.display()))?;
    Ok(())
}

/// Build the shared vehicle detector once; proximity degrades without it.
#[cfg(feature = "yolo")]
fn build_detector(cfg: &DetectorConfig) -> Option<Arc<dyn Detector>> {
    use drive_events::vehicle_detection::YoloDetector;

    match YoloDetector::new(cfg) {
        Ok(detector) => {
            info!("✓ YOLO vehicle detector ready");
            Some(Arc::new(detector))
        }
        Err(e) => {
            warn!("⚠️  Vehicle detector unavailable: {}. Continuing without it.", e);
            None
        }
    }
}

#[cfg(not(feature = "yolo"))]
fn build_detector(cfg: &DetectorConfig) -> Option<Arc<dyn Detector>> {
    if cfg.model_path.is_some() {
        warn!("⚠️  Detector model configured but built without the `yolo` feature");
    } else {
        info!("⚪ No vehicle detector configured");
    }
    None
}
