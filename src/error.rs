// src/error.rs

use thiserror::Error;

/// Failures surfaced by the analysis engine.
///
/// Only `SourceUnavailable` and `InvalidConfig` are fatal to a video.
/// `CapabilityUnavailable` and `InsufficientSignal` degrade a single
/// modality to an empty, clearly-marked result.
#[derive(Debug, Error)]
pub enum AnalysisError {
    #[error("video source unavailable: {path}: {reason}")]
    SourceUnavailable { path: String, reason: String },

    #[error("capability unavailable: {0}")]
    CapabilityUnavailable(String),

    #[error("insufficient signal: {0}")]
    InsufficientSignal(String),

    #[error("invalid configuration: {0}")]
    InvalidConfig(String),

    #[error("frame decode failed: {0}")]
    Decode(String),

    #[error(transparent)]
    Io(#[from] std::io::Error),
}

impl AnalysisError {
    pub fn source_unavailable(path: impl Into<String>, reason: impl ToString) -> Self {
        Self::SourceUnavailable {
            path: path.into(),
            reason: reason.to_string(),
        }
    }

    /// Whether this error should abort the whole video rather than one modality.
    pub fn is_fatal(&self) -> bool {
        matches!(self, Self::SourceUnavailable { .. } | Self::InvalidConfig(_))
    }
}

pub type Result<T> = std::result::Result<T, AnalysisError>;

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_fatal_classification() {
        assert!(AnalysisError::source_unavailable("a.mp4", "missing").is_fatal());
        assert!(AnalysisError::InvalidConfig("x".into()).is_fatal());
        assert!(!AnalysisError::CapabilityUnavailable("yolo".into()).is_fatal());
        assert!(!AnalysisError::InsufficientSignal("no flow".into()).is_fatal());
    }

    #[test]
    fn test_display_includes_path() {
        let err = AnalysisError::source_unavailable("clips/a.mp4", "not found");
        assert_eq!(
            err.to_string(),
            "video source unavailable: clips/a.mp4: not found"
        );
    }
}
