//! Client for the quota-constrained speech backend.
//!
//! The provider forbids concurrent submission bursts but completes work
//! asynchronously: create a task, let it finish in the background, poll the
//! global ready list, then download. Submission spacing is enforced by the
//! `RateLimitedSubmitter`, not here.

use crate::errors::AppResult;
use crate::services::tts::AsyncTtsService;
use crate::utils::retry::classify_response;
use async_trait::async_trait;
use log::{debug, info};
use once_cell::sync::Lazy;
use reqwest::Client;
use serde::Deserialize;
use serde_json::json;
use std::path::Path;
use std::time::Duration;

const API_BASE: &str = "https://api.replicastudio.io/v1";

static HTTP_CLIENT: Lazy<Client> = Lazy::new(|| {
    Client::builder()
        .timeout(Duration::from_secs(120))
        .build()
        .unwrap_or_default()
});

#[derive(Debug, Deserialize)]
struct CreateTaskResponse {
    task_id: String,
}

#[derive(Debug, Deserialize)]
struct ReadyTasksResponse {
    ready: Vec<String>,
}

pub struct ReplicaClient {
    api_key: String,
}

impl ReplicaClient {
    pub fn new(api_key: impl Into<String>) -> Self {
        Self {
            api_key: api_key.into(),
        }
    }

    fn retry_after(response: &reqwest::Response) -> Option<Duration> {
        response
            .headers()
            .get(reqwest::header::RETRY_AFTER)
            .and_then(|v| v.to_str().ok())
            .and_then(|v| v.parse::<u64>().ok())
            .map(Duration::from_secs)
    }
}

#[async_trait]
impl AsyncTtsService for ReplicaClient {
    async fn create_task(&self, text: &str, voice: &str) -> AppResult<String> {
        debug!("Creating async TTS task, {} chars", text.chars().count());
        let response = HTTP_CLIENT
            .post(format!("{}/tts/tasks", API_BASE))
            .header("Authorization", format!("Bearer {}", self.api_key))
            .json(&json!({
                "text": text,
                "voice": voice,
                "format": "mp3",
            }))
            .send()
            .await?;

        let status = response.status();
        if !status.is_success() {
            let retry_after = Self::retry_after(&response);
            let body = response.text().await.unwrap_or_default();
            return Err(classify_response(status, &body, retry_after).into());
        }

        let created: CreateTaskResponse = response.json().await?;
        info!("Async TTS task created: {}", created.task_id);
        Ok(created.task_id)
    }

    async fn ready_tasks(&self) -> AppResult<Vec<String>> {
        let response = HTTP_CLIENT
            .get(format!("{}/tts/tasks/ready", API_BASE))
            .header("Authorization", format!("Bearer {}", self.api_key))
            .send()
            .await?;

        let status = response.status();
        if !status.is_success() {
            let retry_after = Self::retry_after(&response);
            let body = response.text().await.unwrap_or_default();
            return Err(classify_response(status, &body, retry_after).into());
        }

        let ready: ReadyTasksResponse = response.json().await?;
        Ok(ready.ready)
    }

    async fn download(&self, task_id: &str, dest: &Path) -> AppResult<()> {
        debug!("Downloading async TTS task {}", task_id);
        let response = HTTP_CLIENT
            .get(format!("{}/tts/tasks/{}/audio", API_BASE, task_id))
            .header("Authorization", format!("Bearer {}", self.api_key))
            .send()
            .await?;

        let status = response.status();
        if !status.is_success() {
            let retry_after = Self::retry_after(&response);
            let body = response.text().await.unwrap_or_default();
            return Err(classify_response(status, &body, retry_after).into());
        }

        let bytes = response.bytes().await?;
        if let Some(parent) = dest.parent() {
            tokio::fs::create_dir_all(parent).await?;
        }
        tokio::fs::write(dest, &bytes).await?;
        info!("Downloaded async TTS task {} to {}", task_id, dest.display());
        Ok(())
    }
}
