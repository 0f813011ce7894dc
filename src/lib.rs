//! Chunked media synthesis pipeline: text goes in, per-language narrated
//! video comes out.
//!
//! The stages: transform the source text per target language, split it into
//! ordered chunks, synthesize speech per chunk (through a bounded worker
//! pool, or through a rate-limited submit-then-poll backend), transcribe
//! each audio chunk into subtitles, render one video segment per chunk in
//! parallel, and concatenate the segments in index order.
//!
//! `WorkflowManager` is the entry point; everything else is reachable
//! through [`ProviderSet`] and the service traits.

pub mod config;
pub mod errors;
pub mod models;
pub mod pipeline;
pub mod services;
pub mod utils;

pub use config::{AppConfig, PipelineConfig};
pub use errors::{AppError, AppResult};
pub use models::{
    LanguageReport, LanguageSpec, LanguageTaskKey, PipelineStep, RunReport, StepStatus,
    StepToggles, Task, TaskSource,
};
pub use pipeline::{CancelFlag, PauseGate, ProgressTracker, ProviderSet, WorkflowManager};
