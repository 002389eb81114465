//! ingest-pipeline crate
//!
//! Configuration, the per-chain backfill/poller state machine and the
//! multi-chain orchestrator.

pub mod config;
pub mod error;
pub mod orchestrator;
pub mod pipeline;

pub use config::{
    load_config, parse_config, ChainConfig, ConfigError, ConfigFormat, IngestConfig, SinkConfig,
};
pub use error::{ErrorCategory, PipelineError};
pub use orchestrator::{build_pipelines, open_sink, Orchestrator, RunMode};
pub use pipeline::{
    BatchResult, ChainPhase, ChainPipeline, ChainProgress, ChainReport, PipelineSettings,
};
