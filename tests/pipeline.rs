// tests/pipeline.rs
//
// End-to-end runs over an image-sequence directory with scripted vehicles.

use drive_events::analysis::CapabilityStatus;
use drive_events::config::AnalysisConfig;
use drive_events::pipeline::{ModalityOutcome, VideoAnalyzer, VideoOutcome};
use drive_events::types::Location;
use drive_events::vehicle_detection::{Detection, Detector, ScriptedDetector};
use image::RgbImage;
use std::path::Path;
use std::sync::Arc;

const W: u32 = 160;
const H: u32 = 120;
const FRAMES: u64 = 60;

/// Textured gray frames; rows 90.. are painted red for frames 10..50.
fn write_sequence(dir: &Path) {
    for i in 0..FRAMES {
        let red = (10..50).contains(&i);
        let mut img = RgbImage::new(W, H);
        for (x, y, px) in img.enumerate_pixels_mut() {
            *px = if red && y >= 90 {
                image::Rgb([200, 20, 20])
            } else {
                let v = ((x * 7 + y * 13) % 97 + 60) as u8;
                image::Rgb([v, v, v])
            };
        }
        img.save(dir.join(format!("frame_{i:04}.png"))).unwrap();
    }
}

/// A car straight ahead growing from 30 to 60 px tall.
fn approaching_car() -> ScriptedDetector {
    (0..FRAMES).fold(ScriptedDetector::new(), |det, i| {
        let h = 30.0 + i as f32 / 2.0;
        let bbox = [80.0 - h, 80.0 - h / 2.0, 80.0 + h, 80.0 + h / 2.0];
        det.with_frame(i, vec![Detection::new(bbox, 0.9, 2)])
    })
}

fn config(parallel: bool) -> AnalysisConfig {
    let mut cfg = AnalysisConfig::default();
    cfg.parallel = parallel;
    cfg.modalities.band_encounters = true;
    cfg
}

#[test]
fn test_full_analysis_over_image_sequence() {
    let dir = tempfile::tempdir().unwrap();
    write_sequence(dir.path());

    let detector: Arc<dyn Detector> = Arc::new(approaching_car());
    let analyzer = VideoAnalyzer::new(config(true), Some(detector)).unwrap();
    let report = analyzer.analyze(dir.path()).unwrap();

    assert_eq!(report.metadata.frame_count, Some(FRAMES));
    assert_eq!(report.metadata.fps, 30.0);
    assert_eq!(report.metadata.width, W as usize);
    assert!(report.summary.failed_modalities.is_empty());

    assert!(matches!(report.speed, ModalityOutcome::Completed { .. }));
    assert!(matches!(report.lane_changes, ModalityOutcome::Completed { .. }));
    assert!(matches!(report.turns, ModalityOutcome::Completed { .. }));

    let color = report.lane_color.result().unwrap();
    assert!(color.violation_detected);
    assert_eq!(color.event_count, 1);
    let range = &color.violation_ranges[0];
    assert!((range.start_time - 21.0 / 30.0).abs() < 1e-9);

    let proximity = report.close_encounters.result().unwrap();
    assert_eq!(proximity.status, CapabilityStatus::Ok);
    assert_eq!(proximity.event_count, 1);
    assert_eq!(proximity.close_encounters[0].location, Some(Location::Center));
    assert_eq!(report.summary.lane_color_violations, 1);

    let bands = report.band_encounters.result().unwrap();
    assert_eq!(bands.status, CapabilityStatus::Ok);

    let json = serde_json::to_value(&report).unwrap();
    assert_eq!(json["lane_color"]["status"], "completed");
    assert!(json["close_encounters"]["result"]["close_encounters"][0]["where"] == "center");
}

#[test]
fn test_sequential_matches_parallel() {
    let dir = tempfile::tempdir().unwrap();
    write_sequence(dir.path());

    let run = |parallel: bool| {
        let detector: Arc<dyn Detector> = Arc::new(approaching_car());
        let analyzer = VideoAnalyzer::new(config(parallel), Some(detector)).unwrap();
        analyzer.analyze(dir.path()).unwrap()
    };
    let (a, b) = (run(true), run(false));
    assert_eq!(a.summary, b.summary);
    assert_eq!(a.lane_color.result(), b.lane_color.result());
    assert_eq!(a.close_encounters.result(), b.close_encounters.result());
}

#[test]
fn test_missing_detector_degrades_proximity() {
    let dir = tempfile::tempdir().unwrap();
    write_sequence(dir.path());

    let analyzer = VideoAnalyzer::new(config(false), None).unwrap();
    let report = analyzer.analyze(dir.path()).unwrap();
    let proximity = report.close_encounters.result().unwrap();
    assert_eq!(proximity.status, CapabilityStatus::CapabilityUnavailable);
    assert_eq!(proximity.event_count, 0);
    // Other modalities are unaffected
    assert_eq!(report.lane_color.result().unwrap().event_count, 1);
}

#[test]
fn test_batch_isolates_failures() {
    let dir = tempfile::tempdir().unwrap();
    write_sequence(dir.path());
    let missing = dir.path().join("does_not_exist");

    let analyzer = VideoAnalyzer::new(config(false), None).unwrap();
    let batch = analyzer.analyze_batch(&[missing, dir.path().to_path_buf()]);
    assert_eq!(batch.videos_total, 2);
    assert_eq!(batch.videos_failed, 1);
    assert_eq!(batch.videos_succeeded, 1);
    assert!(matches!(batch.results[0], VideoOutcome::Failed { .. }));
    assert!(matches!(batch.results[1], VideoOutcome::Completed { .. }));
}
