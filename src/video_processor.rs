// src/video_processor.rs
//
// Frame sources and the fixed-rate sampler every extractor reads from.
//
// A source yields decoded frames in native order. The sampler keeps every
// `step`-th frame, where step = max(1, round(native_fps / target_hz)), and
// stamps it with t = index / native_fps. Sources are forward-only and
// release their handles on drop.

use crate::error::{AnalysisError, Result};
use crate::preprocessing::{crop_rgb, resize_to_width};
use crate::types::{Frame, FractionalRect};
use serde::{Deserialize, Serialize};
use std::collections::VecDeque;
use std::path::{Path, PathBuf};
use tracing::{debug, info, warn};
use walkdir::WalkDir;

/// Frame rate assumed when a source does not report a usable one.
pub const FALLBACK_FPS: f64 = 30.0;

// ============================================================================
// SOURCES
// ============================================================================

#[derive(Debug, Clone, Copy, PartialEq, Serialize)]
pub struct SourceInfo {
    /// Native frame rate as reported by the container, if any
    pub fps: Option<f64>,
    pub frame_count: Option<u64>,
    pub width: usize,
    pub height: usize,
}

impl SourceInfo {
    /// Reported fps, or the fallback when missing or non-positive.
    pub fn effective_fps(&self) -> f64 {
        match self.fps {
            Some(f) if f.is_finite() && f > 0.0 => f,
            _ => FALLBACK_FPS,
        }
    }
}

pub trait FrameSource: Send {
    fn info(&self) -> SourceInfo;

    /// Decode the next frame. `Ok(None)` at end of stream.
    fn read(&mut self) -> Result<Option<Frame>>;

    /// Advance past the next frame without keeping it. Returns false at
    /// end of stream.
    fn skip(&mut self) -> Result<bool> {
        Ok(self.read()?.is_some())
    }
}

/// Frames held in memory, for embedding and tests.
pub struct MemorySource {
    frames: VecDeque<Frame>,
    info: SourceInfo,
}

impl MemorySource {
    pub fn new(frames: Vec<Frame>, fps: Option<f64>) -> Self {
        let (width, height) = frames.first().map_or((0, 0), |f| (f.width, f.height));
        let info = SourceInfo {
            fps,
            frame_count: Some(frames.len() as u64),
            width,
            height,
        };
        Self {
            frames: frames.into(),
            info,
        }
    }
}

impl FrameSource for MemorySource {
    fn info(&self) -> SourceInfo {
        self.info
    }

    fn read(&mut self) -> Result<Option<Frame>> {
        Ok(self.frames.pop_front())
    }
}

/// A directory of still images decoded in file-name order.
pub struct ImageSequenceSource {
    paths: VecDeque<PathBuf>,
    info: SourceInfo,
    next_index: u64,
}

const IMAGE_EXTENSIONS: [&str; 3] = ["png", "jpg", "jpeg"];

impl ImageSequenceSource {
    pub fn open(dir: &Path, fps: f64) -> Result<Self> {
        let mut paths: Vec<PathBuf> = std::fs::read_dir(dir)
            .map_err(|e| AnalysisError::source_unavailable(dir.display().to_string(), e))?
            .filter_map(|e| e.ok().map(|e| e.path()))
            .filter(|p| {
                p.extension()
                    .and_then(|e| e.to_str())
                    .is_some_and(|e| IMAGE_EXTENSIONS.contains(&e.to_ascii_lowercase().as_str()))
            })
            .collect();
        paths.sort();

        let first = paths.first().ok_or_else(|| {
            AnalysisError::source_unavailable(dir.display().to_string(), "no image frames")
        })?;
        let (width, height) = image::image_dimensions(first)
            .map_err(|e| AnalysisError::source_unavailable(first.display().to_string(), e))?;

        info!(
            "Image sequence: {} frames {}x{} @ {:.1} FPS",
            paths.len(),
            width,
            height,
            fps
        );
        Ok(Self {
            info: SourceInfo {
                fps: Some(fps),
                frame_count: Some(paths.len() as u64),
                width: width as usize,
                height: height as usize,
            },
            paths: paths.into(),
            next_index: 0,
        })
    }
}

impl FrameSource for ImageSequenceSource {
    fn info(&self) -> SourceInfo {
        self.info
    }

    fn read(&mut self) -> Result<Option<Frame>> {
        let Some(path) = self.paths.pop_front() else {
            return Ok(None);
        };
        let img = image::open(&path)
            .map_err(|e| AnalysisError::Decode(format!("{}: {e}", path.display())))?
            .to_rgb8();
        let (w, h) = (img.width() as usize, img.height() as usize);
        let index = self.next_index;
        self.next_index += 1;
        Ok(Some(Frame::new(img.into_raw(), w, h, index, 0.0)))
    }

    fn skip(&mut self) -> Result<bool> {
        self.next_index += 1;
        Ok(self.paths.pop_front().is_some())
    }
}

#[cfg(feature = "opencv")]
mod capture {
    use super::{FrameSource, SourceInfo};
    use crate::error::{AnalysisError, Result};
    use crate::types::Frame;
    use opencv::{
        core::Mat,
        imgproc,
        prelude::*,
        videoio::{self, VideoCapture, VideoCaptureTrait, VideoCaptureTraitConst},
    };
    use std::path::Path;
    use tracing::{debug, info};

    /// Video file decoded through OpenCV.
    pub struct CaptureSource {
        cap: VideoCapture,
        info: SourceInfo,
        next_index: u64,
    }

    impl CaptureSource {
        pub fn open(path: &Path) -> Result<Self> {
            let name = path.display().to_string();
            let unavailable = |e: opencv::Error| AnalysisError::source_unavailable(name.clone(), e);

            let cap = VideoCapture::from_file(&name, videoio::CAP_ANY).map_err(unavailable)?;
            if !cap.is_opened().map_err(unavailable)? {
                return Err(AnalysisError::source_unavailable(name.clone(), "failed to open video file"));
            }

            let fps = VideoCaptureTraitConst::get(&cap, videoio::CAP_PROP_FPS).map_err(unavailable)?;
            let total = VideoCaptureTraitConst::get(&cap, videoio::CAP_PROP_FRAME_COUNT)
                .map_err(unavailable)?;
            let width = VideoCaptureTraitConst::get(&cap, videoio::CAP_PROP_FRAME_WIDTH)
                .map_err(unavailable)? as usize;
            let height = VideoCaptureTraitConst::get(&cap, videoio::CAP_PROP_FRAME_HEIGHT)
                .map_err(unavailable)? as usize;

            info!(
                "Video properties: {}x{} @ {:.1} FPS, {} frames",
                width, height, fps, total
            );

            Ok(Self {
                cap,
                info: SourceInfo {
                    fps: (fps > 0.0).then_some(fps),
                    frame_count: (total > 0.0).then_some(total as u64),
                    width,
                    height,
                },
                next_index: 0,
            })
        }
    }

    impl FrameSource for CaptureSource {
        fn info(&self) -> SourceInfo {
            self.info
        }

        fn read(&mut self) -> Result<Option<Frame>> {
            let decode = |e: opencv::Error| AnalysisError::Decode(e.to_string());
            let mut mat = Mat::default();
            if !VideoCaptureTrait::read(&mut self.cap, &mut mat).map_err(decode)? || mat.empty() {
                return Ok(None);
            }

            let mut rgb = Mat::default();
            imgproc::cvt_color(&mat, &mut rgb, imgproc::COLOR_BGR2RGB, 0).map_err(decode)?;
            let data = rgb.data_bytes().map_err(decode)?.to_vec();
            let (w, h) = (rgb.cols() as usize, rgb.rows() as usize);

            let index = self.next_index;
            self.next_index += 1;
            Ok(Some(Frame::new(data, w, h, index, 0.0)))
        }

        fn skip(&mut self) -> Result<bool> {
            let grabbed = VideoCaptureTrait::grab(&mut self.cap)
                .map_err(|e| AnalysisError::Decode(e.to_string()))?;
            if grabbed {
                self.next_index += 1;
            }
            Ok(grabbed)
        }
    }

    impl Drop for CaptureSource {
        fn drop(&mut self) {
            if let Err(e) = self.cap.release() {
                debug!("VideoCapture release failed: {}", e);
            }
        }
    }
}

#[cfg(feature = "opencv")]
pub use capture::CaptureSource;

// ============================================================================
// OPENING
// ============================================================================

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct SourceConfig {
    /// Frame rate assigned to image-sequence directories
    pub image_sequence_fps: f64,
    /// File extensions picked up when scanning for videos
    pub video_extensions: Vec<String>,
}

impl Default for SourceConfig {
    fn default() -> Self {
        Self {
            image_sequence_fps: FALLBACK_FPS,
            video_extensions: ["mp4", "avi", "mov", "mkv"]
                .iter()
                .map(|s| s.to_string())
                .collect(),
        }
    }
}

/// Open a video file, or an image-sequence directory.
pub fn open_source(path: &Path, cfg: &SourceConfig) -> Result<Box<dyn FrameSource>> {
    if !path.exists() {
        return Err(AnalysisError::source_unavailable(
            path.display().to_string(),
            "no such file or directory",
        ));
    }
    if path.is_dir() {
        return Ok(Box::new(ImageSequenceSource::open(path, cfg.image_sequence_fps)?));
    }
    open_video_file(path)
}

#[cfg(feature = "opencv")]
fn open_video_file(path: &Path) -> Result<Box<dyn FrameSource>> {
    Ok(Box::new(CaptureSource::open(path)?))
}

#[cfg(not(feature = "opencv"))]
fn open_video_file(path: &Path) -> Result<Box<dyn FrameSource>> {
    Err(AnalysisError::source_unavailable(
        path.display().to_string(),
        "video file decoding requires the `opencv` feature",
    ))
}

/// Recursively collect video files (case-insensitive extension match).
pub fn find_video_files(input_dir: &Path, extensions: &[String]) -> Vec<PathBuf> {
    let mut videos: Vec<PathBuf> = WalkDir::new(input_dir)
        .follow_links(true)
        .into_iter()
        .filter_map(|e| e.ok())
        .filter(|e| e.file_type().is_file())
        .map(|e| e.into_path())
        .filter(|p| {
            p.extension()
                .and_then(|e| e.to_str())
                .is_some_and(|e| extensions.iter().any(|x| x.eq_ignore_ascii_case(e)))
        })
        .collect();
    videos.sort();

    info!("Found {} video files", videos.len());
    videos
}

// ============================================================================
// SAMPLER
// ============================================================================

/// Keep every `step`-th native frame so that the sampled rate approximates
/// `target_hz`. Without a target every frame is kept.
pub fn sampling_step(native_fps: Option<f64>, target_hz: Option<f64>) -> usize {
    let fps = match native_fps {
        Some(f) if f.is_finite() && f > 0.0 => f,
        _ => FALLBACK_FPS,
    };
    match target_hz {
        Some(t) if t.is_finite() && t > 0.0 => ((fps / t).round() as usize).max(1),
        _ => 1,
    }
}

/// How an extractor wants its frames.
#[derive(Debug, Clone, Copy, Default, PartialEq)]
pub struct SamplingSpec {
    pub target_hz: Option<f64>,
    /// Downscale to this width (aspect preserved) before cropping
    pub target_width: Option<usize>,
    pub crop: Option<FractionalRect>,
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Serialize)]
pub struct SamplerStats {
    pub frames_read: u64,
    pub frames_sampled: u64,
}

/// Lazy, finite, forward-only sequence of sampled frames.
pub struct FrameSampler {
    source: Box<dyn FrameSource>,
    spec: SamplingSpec,
    native_fps: f64,
    native_width: usize,
    step: usize,
    position: u64,
    stats: SamplerStats,
    done: bool,
}

impl FrameSampler {
    pub fn new(source: Box<dyn FrameSource>, spec: SamplingSpec) -> Self {
        let info = source.info();
        let step = sampling_step(info.fps, spec.target_hz);
        debug!(
            "Sampler: native {:.2} FPS, step {}, effective {:.2} Hz",
            info.effective_fps(),
            step,
            info.effective_fps() / step as f64
        );
        Self {
            source,
            spec,
            native_fps: info.effective_fps(),
            native_width: info.width,
            step,
            position: 0,
            stats: SamplerStats::default(),
            done: false,
        }
    }

    pub fn step(&self) -> usize {
        self.step
    }

    pub fn native_fps(&self) -> f64 {
        self.native_fps
    }

    /// Rate at which sampled frames arrive.
    pub fn effective_hz(&self) -> f64 {
        self.native_fps / self.step as f64
    }

    pub fn native_width(&self) -> usize {
        self.native_width
    }

    pub fn stats(&self) -> SamplerStats {
        self.stats
    }

    fn prepare(&self, frame: Frame) -> Frame {
        let frame = match self.spec.target_width {
            Some(w) => resize_to_width(&frame, w),
            None => frame,
        };
        match self.spec.crop {
            Some(roi) => crop_rgb(&frame, &roi.resolve(frame.width, frame.height)),
            None => frame,
        }
    }
}

impl Iterator for FrameSampler {
    type Item = Frame;

    fn next(&mut self) -> Option<Frame> {
        while !self.done {
            let index = self.position;
            let keep = index % self.step as u64 == 0;
            let outcome = if keep {
                self.source.read().map(|f| f.map(Some))
            } else {
                self.source.skip().map(|more| more.then_some(None))
            };

            match outcome {
                Ok(Some(frame)) => {
                    self.position += 1;
                    self.stats.frames_read += 1;
                    if let Some(mut frame) = frame {
                        frame.index = index;
                        frame.timestamp = index as f64 / self.native_fps;
                        self.stats.frames_sampled += 1;
                        return Some(self.prepare(frame));
                    }
                }
                Ok(None) => self.done = true,
                Err(e) => {
                    warn!("Frame {} unreadable, ending stream early: {}", index, e);
                    self.done = true;
                }
            }
        }
        None
    }
}
