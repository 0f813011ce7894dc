// TTS services module
// Contains the two structurally different speech backend shapes: the
// synchronous kind served through the bounded worker pool, and the
// quota-constrained submit-then-poll kind served through the rate-limited
// submitter.

use crate::config::AppConfig;
use crate::errors::{AppError, AppResult};
use crate::models::TtsEngine;
use async_trait::async_trait;
use std::path::Path;
use std::sync::Arc;

pub mod openai;
pub mod replica;

pub use openai::OpenAiTts;
pub use replica::ReplicaClient;

/// Synchronous speech backend: one call produces one audio file.
#[async_trait]
pub trait TtsService: Send + Sync {
    async fn synthesize(&self, text: &str, voice: &str, output: &Path) -> AppResult<()>;
}

/// Asynchronous speech backend: work is created, completes in the
/// background, and is polled and downloaded later. The provider forbids
/// concurrent submission bursts, so callers must space out `create_task`.
#[async_trait]
pub trait AsyncTtsService: Send + Sync {
    /// Submit one synthesis task; returns the backend's task id.
    async fn create_task(&self, text: &str, voice: &str) -> AppResult<String>;

    /// Ids of all tasks currently ready for download, across all groups.
    async fn ready_tasks(&self) -> AppResult<Vec<String>>;

    /// Download one completed task's audio to `dest`.
    async fn download(&self, task_id: &str, dest: &Path) -> AppResult<()>;
}

/// Build the synchronous service for an engine. The choice is made once per
/// language task at construction time, not re-dispatched per call.
pub fn sync_engine(engine: TtsEngine, config: &AppConfig) -> AppResult<Arc<dyn TtsService>> {
    match engine {
        TtsEngine::OpenAi => Ok(Arc::new(OpenAiTts::new(&config.openai_api_key))),
        TtsEngine::Replica => Err(AppError::ConfigurationError(
            "replica is a submit-then-poll backend and cannot run in the synchronous pool"
                .to_string(),
        )),
    }
}

/// Whether an engine must go through the rate-limited submitter instead of
/// the synchronous worker pool.
pub fn is_quota_constrained(engine: TtsEngine) -> bool {
    matches!(engine, TtsEngine::Replica)
}
