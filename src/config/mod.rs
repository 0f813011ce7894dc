// Configuration module
// Centralized management of pipeline configuration

use serde::{Deserialize, Serialize};
use std::path::PathBuf;

/// Tuning knobs for the chunked synthesis pipeline.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct PipelineConfig {
    /// Number of synthesis workers in the bounded pool.
    pub worker_count: usize,
    /// Target parallelism P: chunk count for balanced chunking, merge-group
    /// count for the quota backend, and the video render pool size.
    pub chunk_parallelism: usize,
    /// Character limit per request for synchronous TTS backends.
    pub chunk_char_limit: usize,
    /// Character limit per request for the quota-constrained backend.
    pub quota_chunk_char_limit: usize,
    /// Spacing between submissions to the quota-constrained backend, seconds.
    pub submit_spacing_secs: u64,
    /// Interval between completion polls for the quota backend, seconds.
    pub poll_interval_secs: u64,
    /// How long `stop()` waits for workers to drain, seconds.
    pub shutdown_timeout_secs: u64,
    /// Bounded retry attempts for calls inside a wait loop.
    pub retry_attempts: usize,
    /// Base delay between retries, seconds.
    pub retry_delay_secs: u64,
    /// Consecutive failures on one image prompt before switching backend.
    pub image_failures_before_switch: usize,
}

impl Default for PipelineConfig {
    fn default() -> Self {
        Self {
            worker_count: 4,
            chunk_parallelism: 3,
            chunk_char_limit: 4000,
            quota_chunk_char_limit: 1000,
            submit_spacing_secs: 1,
            poll_interval_secs: 3,
            shutdown_timeout_secs: 10,
            retry_attempts: 3,
            retry_delay_secs: 2,
            image_failures_before_switch: 2,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct AppConfig {
    pub openai_api_key: String,
    pub replica_api_key: String,
    pub stability_api_key: String,
    /// Chat model used for translation/rewrite and auxiliary texts.
    pub text_model: String,
    /// Working directory for per-task artifacts.
    pub workspace_dir: PathBuf,
    /// Block Stage 5 on an external review confirmation.
    pub review_required: bool,
    pub pipeline: PipelineConfig,
}

impl Default for AppConfig {
    fn default() -> Self {
        Self {
            openai_api_key: String::new(),
            replica_api_key: String::new(),
            stability_api_key: String::new(),
            text_model: "gpt-4o-mini".to_string(),
            workspace_dir: PathBuf::from("workspace"),
            review_required: false,
            pipeline: PipelineConfig::default(),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_config_roundtrip() {
        let config = AppConfig::default();
        let json = serde_json::to_string(&config).unwrap();
        let parsed: AppConfig = serde_json::from_str(&json).unwrap();
        assert_eq!(parsed.pipeline.worker_count, config.pipeline.worker_count);
        assert_eq!(parsed.text_model, config.text_model);
    }
}
