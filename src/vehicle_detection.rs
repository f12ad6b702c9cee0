// src/vehicle_detection.rs
//
// Object detection as a capability: frame in, vehicle boxes out.
//
// The `Detector` trait is the seam; `YoloDetector` (feature "yolo") runs a
// YOLOv8 ONNX export through ort, `ScriptedDetector` replays fixed boxes.
// Output decoding and NMS are plain functions so they work without a model.

use crate::error::Result;
use crate::preprocessing::Letterbox;
use crate::types::{BBox, Frame};
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use tracing::debug;

pub const YOLO_INPUT_SIZE: usize = 640;
const YOLO_CLASSES: usize = 80;

// COCO class IDs for vehicles
pub const VEHICLE_CLASSES: [usize; 4] = [2, 3, 5, 7]; // car, motorcycle, bus, truck

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct Detection {
    pub bbox: BBox, // [x1, y1, x2, y2] in frame coordinates
    pub confidence: f32,
    pub class_id: usize,
    pub class_name: String,
}

impl Detection {
    pub fn new(bbox: BBox, confidence: f32, class_id: usize) -> Self {
        Self {
            bbox,
            confidence,
            class_id,
            class_name: class_id_to_name(class_id),
        }
    }
}

/// Anything that finds vehicles in a frame. Shared read-only across
/// extractors, so implementations synchronize internally.
pub trait Detector: Send + Sync {
    fn name(&self) -> &str;

    /// Vehicle detections at or above `min_confidence`, in the coordinates
    /// of `frame`.
    fn detect(&self, frame: &Frame, min_confidence: f32) -> Result<Vec<Detection>>;
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct DetectorConfig {
    /// ONNX model; no detector is built when absent
    pub model_path: Option<String>,
    pub input_size: usize,
    pub use_cuda: bool,
    pub num_threads: usize,
    pub nms_iou: f32,
}

impl Default for DetectorConfig {
    fn default() -> Self {
        Self {
            model_path: None,
            input_size: YOLO_INPUT_SIZE,
            use_cuda: false,
            num_threads: 4,
            nms_iou: 0.45,
        }
    }
}

pub fn class_id_to_name(class_id: usize) -> String {
    match class_id {
        2 => "car",
        3 => "motorcycle",
        5 => "bus",
        7 => "truck",
        _ => "unknown",
    }
    .to_string()
}

pub fn is_vehicle_class(class_id: usize) -> bool {
    VEHICLE_CLASSES.contains(&class_id)
}

pub fn iou(a: &BBox, b: &BBox) -> f32 {
    let x1 = a[0].max(b[0]);
    let y1 = a[1].max(b[1]);
    let x2 = a[2].min(b[2]);
    let y2 = a[3].min(b[3]);

    let intersection = (x2 - x1).max(0.0) * (y2 - y1).max(0.0);
    if intersection <= 0.0 {
        return 0.0;
    }
    let area1 = (a[2] - a[0]).max(0.0) * (a[3] - a[1]).max(0.0);
    let area2 = (b[2] - b[0]).max(0.0) * (b[3] - b[1]).max(0.0);
    let union = area1 + area2 - intersection;

    if union > 0.0 {
        intersection / union
    } else {
        0.0
    }
}

/// Greedy NMS, highest confidence first.
pub fn nms(mut detections: Vec<Detection>, iou_threshold: f32) -> Vec<Detection> {
    detections.sort_by(|a, b| {
        b.confidence
            .partial_cmp(&a.confidence)
            .unwrap_or(std::cmp::Ordering::Equal)
    });

    let mut keep: Vec<Detection> = Vec::with_capacity(detections.len());
    for det in detections {
        if keep.iter().all(|k| iou(&k.bbox, &det.bbox) < iou_threshold) {
            keep.push(det);
        }
    }
    keep
}

/// Decode a YOLOv8 head laid out as `[4 + classes, predictions]`, keep
/// vehicle classes above `conf_thresh`, map boxes back through the
/// letterbox and suppress overlaps.
pub fn decode_yolo_output(
    output: &[f32],
    letterbox: &Letterbox,
    conf_thresh: f32,
    nms_iou: f32,
) -> Vec<Detection> {
    let stride = 4 + YOLO_CLASSES;
    if output.len() < stride || output.len() % stride != 0 {
        return Vec::new();
    }
    let n = output.len() / stride;

    let mut detections = Vec::new();
    for i in 0..n {
        // Find best class
        let mut max_conf = 0.0f32;
        let mut best_class = 0;
        for c in 0..YOLO_CLASSES {
            let conf = output[n * (4 + c) + i];
            if conf > max_conf {
                max_conf = conf;
                best_class = c;
            }
        }
        if max_conf < conf_thresh || !is_vehicle_class(best_class) {
            continue;
        }

        let (cx, cy) = (output[i], output[n + i]);
        let (w, h) = (output[2 * n + i], output[3 * n + i]);
        let bbox = letterbox.unmap([cx - w / 2.0, cy - h / 2.0, cx + w / 2.0, cy + h / 2.0]);
        detections.push(Detection::new(bbox, max_conf, best_class));
    }

    let kept = nms(detections, nms_iou);
    debug!("Decoded {} vehicle detections from {} predictions", kept.len(), n);
    kept
}

// ============================================================================
// SCRIPTED DETECTOR
// ============================================================================

/// Replays fixed detections keyed by native frame index.
#[derive(Debug, Clone, Default)]
pub struct ScriptedDetector {
    script: HashMap<u64, Vec<Detection>>,
}

impl ScriptedDetector {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_frame(mut self, index: u64, detections: Vec<Detection>) -> Self {
        self.script.insert(index, detections);
        self
    }
}

impl Detector for ScriptedDetector {
    fn name(&self) -> &str {
        "scripted"
    }

    fn detect(&self, frame: &Frame, min_confidence: f32) -> Result<Vec<Detection>> {
        Ok(self
            .script
            .get(&frame.index)
            .map(|dets| {
                dets.iter()
                    .filter(|d| d.confidence >= min_confidence)
                    .cloned()
                    .collect()
            })
            .unwrap_or_default())
    }
}

/// Fails on the listed frames and replays `inner` on the rest.
#[cfg(test)]
pub(crate) struct FlakyDetector {
    pub inner: ScriptedDetector,
    pub fail_on: Vec<u64>,
}

#[cfg(test)]
impl Detector for FlakyDetector {
    fn name(&self) -> &str {
        "flaky"
    }

    fn detect(&self, frame: &Frame, min_confidence: f32) -> Result<Vec<Detection>> {
        if self.fail_on.contains(&frame.index) {
            return Err(crate::error::AnalysisError::CapabilityUnavailable(format!(
                "inference failed on frame {}",
                frame.index
            )));
        }
        self.inner.detect(frame, min_confidence)
    }
}

// ============================================================================
// YOLO (ONNX)
// ============================================================================

#[cfg(feature = "yolo")]
pub use yolo::YoloDetector;

#[cfg(feature = "yolo")]
mod yolo {
    use super::{decode_yolo_output, Detection, Detector, DetectorConfig};
    use crate::error::{AnalysisError, Result};
    use crate::inference::{build_session, unavailable};
    use crate::preprocessing::letterbox;
    use crate::types::Frame;
    use ort::session::Session;
    use std::sync::Mutex;
    use tracing::debug;

    pub struct YoloDetector {
        session: Mutex<Session>,
        input_size: usize,
        nms_iou: f32,
    }

    impl YoloDetector {
        pub fn new(cfg: &DetectorConfig) -> Result<Self> {
            Ok(Self {
                session: Mutex::new(build_session(cfg)?),
                input_size: cfg.input_size,
                nms_iou: cfg.nms_iou,
            })
        }

        fn infer(&self, input: Vec<f32>) -> Result<Vec<f32>> {
            let shape = [1, 3, self.input_size, self.input_size];
            let input_value =
                ort::value::Value::from_array((shape.as_slice(), input.into_boxed_slice()))
                    .map_err(unavailable)?;

            let mut session = self
                .session
                .lock()
                .map_err(|_| AnalysisError::CapabilityUnavailable("detector session poisoned".into()))?;
            let outputs = session
                .run(ort::inputs!["images" => input_value])
                .map_err(unavailable)?;
            let (_, data) = outputs[0].try_extract_tensor::<f32>().map_err(unavailable)?;
            Ok(data.to_vec())
        }
    }

    impl Detector for YoloDetector {
        fn name(&self) -> &str {
            "yolov8-onnx"
        }

        fn detect(&self, frame: &Frame, min_confidence: f32) -> Result<Vec<Detection>> {
            let mut lb = letterbox(&frame.data, frame.width, frame.height, self.input_size);
            let output = self.infer(std::mem::take(&mut lb.input))?;
            let detections = decode_yolo_output(&output, &lb, min_confidence, self.nms_iou);
            debug!("Frame {}: {} vehicles", frame.index, detections.len());
            Ok(detections)
        }
    }
}
