// src/inference.rs
//
// ONNX Runtime session construction for the detector.

use crate::error::{AnalysisError, Result};
use crate::vehicle_detection::DetectorConfig;
use ort::{
    execution_providers::CUDAExecutionProvider,
    session::{builder::GraphOptimizationLevel, Session},
};
use std::path::Path;
use tracing::info;

pub fn build_session(cfg: &DetectorConfig) -> Result<Session> {
    let model_path = cfg
        .model_path
        .as_deref()
        .ok_or_else(|| AnalysisError::CapabilityUnavailable("no detector model configured".into()))?;
    if !Path::new(model_path).exists() {
        return Err(AnalysisError::CapabilityUnavailable(format!(
            "detector model not found: {model_path}"
        )));
    }
    info!("Loading detector model: {}", model_path);

    let mut builder = Session::builder().map_err(unavailable)?;
    if cfg.use_cuda {
        info!("Enabling CUDA execution provider");
        builder = builder
            .with_execution_providers([CUDAExecutionProvider::default()
                .with_device_id(0)
                .build()])
            .map_err(unavailable)?;
    }

    let session = builder
        .with_optimization_level(GraphOptimizationLevel::Level3)
        .map_err(unavailable)?
        .with_intra_threads(cfg.num_threads.max(1))
        .map_err(unavailable)?
        .commit_from_file(model_path)
        .map_err(unavailable)?;

    info!("✓ Detector session ready");
    Ok(session)
}

/// Any ort failure leaves the detector unusable.
pub(crate) fn unavailable(e: impl std::fmt::Display) -> AnalysisError {
    AnalysisError::CapabilityUnavailable(e.to_string())
}
