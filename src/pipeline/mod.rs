// src/pipeline/mod.rs

pub mod metrics;
pub mod orchestrator;

pub use metrics::ExtractorStats;
pub use orchestrator::{
    run_extractor, BatchReport, ModalityOutcome, ReportSummary, VideoAnalyzer, VideoMetadata,
    VideoOutcome, VideoReport,
};
