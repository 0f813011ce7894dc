// Image generation services.
// Two interchangeable backends; a per-prompt failover wrapper can switch
// backend on repeated failure and eventually skip the prompt rather than
// fail the whole language task.

use crate::errors::AppResult;
use crate::pipeline::control::CancelFlag;
use crate::utils::retry::classify_response;
use async_trait::async_trait;
use log::{info, warn};
use once_cell::sync::Lazy;
use reqwest::Client;
use serde::Deserialize;
use serde_json::json;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::Duration;

static HTTP_CLIENT: Lazy<Client> = Lazy::new(|| {
    Client::builder()
        .timeout(Duration::from_secs(300))
        .build()
        .unwrap_or_default()
});

#[async_trait]
pub trait ImageProvider: Send + Sync {
    async fn generate(&self, prompt: &str, output: &Path) -> AppResult<()>;
}

#[derive(Debug, Deserialize)]
struct DalleResponse {
    data: Vec<DalleImage>,
}

#[derive(Debug, Deserialize)]
struct DalleImage {
    url: String,
}

pub struct DalleClient {
    api_key: String,
}

impl DalleClient {
    pub fn new(api_key: impl Into<String>) -> Self {
        Self {
            api_key: api_key.into(),
        }
    }
}

#[async_trait]
impl ImageProvider for DalleClient {
    async fn generate(&self, prompt: &str, output: &Path) -> AppResult<()> {
        let response = HTTP_CLIENT
            .post("https://api.openai.com/v1/images/generations")
            .header("Authorization", format!("Bearer {}", self.api_key))
            .json(&json!({
                "model": "dall-e-3",
                "prompt": prompt,
                "n": 1,
                "size": "1792x1024",
                "response_format": "url",
            }))
            .send()
            .await?;

        let status = response.status();
        if !status.is_success() {
            let body = response.text().await.unwrap_or_default();
            return Err(classify_response(status, &body, None).into());
        }

        let parsed: DalleResponse = response.json().await?;
        let url = parsed
            .data
            .first()
            .map(|i| i.url.clone())
            .ok_or_else(|| crate::errors::BackendError::transient("empty image response"))?;

        let image = HTTP_CLIENT.get(&url).send().await?;
        let status = image.status();
        if !status.is_success() {
            let body = image.text().await.unwrap_or_default();
            return Err(classify_response(status, &body, None).into());
        }
        let bytes = image.bytes().await?;
        if let Some(parent) = output.parent() {
            tokio::fs::create_dir_all(parent).await?;
        }
        tokio::fs::write(output, &bytes).await?;
        Ok(())
    }
}

pub struct StabilityClient {
    api_key: String,
}

impl StabilityClient {
    pub fn new(api_key: impl Into<String>) -> Self {
        Self {
            api_key: api_key.into(),
        }
    }
}

#[async_trait]
impl ImageProvider for StabilityClient {
    async fn generate(&self, prompt: &str, output: &Path) -> AppResult<()> {
        let response = HTTP_CLIENT
            .post("https://api.stability.ai/v2beta/stable-image/generate/core")
            .header("Authorization", format!("Bearer {}", self.api_key))
            .header("Accept", "image/*")
            .multipart(
                reqwest::multipart::Form::new()
                    .text("prompt", prompt.to_string())
                    .text("aspect_ratio", "16:9")
                    .text("output_format", "png"),
            )
            .send()
            .await?;

        let status = response.status();
        if !status.is_success() {
            let body = response.text().await.unwrap_or_default();
            return Err(classify_response(status, &body, None).into());
        }

        let bytes = response.bytes().await?;
        if let Some(parent) = output.parent() {
            tokio::fs::create_dir_all(parent).await?;
        }
        tokio::fs::write(output, &bytes).await?;
        Ok(())
    }
}

/// Outcome of one prompt after failover handling.
#[derive(Debug, Clone)]
pub enum ImageOutcome {
    Generated(PathBuf),
    Skipped,
}

/// Per-language image generation wrapper: tries the primary backend a fixed
/// number of times, switches to the fallback, and finally skips the prompt.
pub struct ImageGenerator {
    primary: Arc<dyn ImageProvider>,
    fallback: Option<Arc<dyn ImageProvider>>,
    failures_before_switch: usize,
}

impl ImageGenerator {
    pub fn new(
        primary: Arc<dyn ImageProvider>,
        fallback: Option<Arc<dyn ImageProvider>>,
        failures_before_switch: usize,
    ) -> Self {
        Self {
            primary,
            fallback,
            failures_before_switch: failures_before_switch.max(1),
        }
    }

    pub async fn generate_with_failover(
        &self,
        prompt: &str,
        output: &Path,
        cancel: &CancelFlag,
    ) -> AppResult<ImageOutcome> {
        let backends: Vec<&Arc<dyn ImageProvider>> =
            std::iter::once(&self.primary).chain(self.fallback.iter()).collect();

        for (backend_index, backend) in backends.iter().enumerate() {
            for attempt in 1..=self.failures_before_switch {
                if cancel.is_cancelled() {
                    return Err(crate::errors::AppError::Cancelled);
                }
                match backend.generate(prompt, output).await {
                    Ok(()) => {
                        info!("Image generated for prompt: {:.60}", prompt);
                        return Ok(ImageOutcome::Generated(output.to_path_buf()));
                    }
                    Err(e) => {
                        warn!(
                            "Image backend {} attempt {}/{} failed: {}",
                            backend_index, attempt, self.failures_before_switch, e
                        );
                    }
                }
            }
        }

        warn!("All image backends failed, skipping prompt: {:.60}", prompt);
        Ok(ImageOutcome::Skipped)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::errors::BackendError;
    use std::sync::atomic::{AtomicUsize, Ordering};

    struct FailingBackend {
        calls: Arc<AtomicUsize>,
    }

    #[async_trait]
    impl ImageProvider for FailingBackend {
        async fn generate(&self, _prompt: &str, _output: &Path) -> AppResult<()> {
            self.calls.fetch_add(1, Ordering::SeqCst);
            Err(BackendError::transient("down").into())
        }
    }

    struct WorkingBackend;

    #[async_trait]
    impl ImageProvider for WorkingBackend {
        async fn generate(&self, _prompt: &str, output: &Path) -> AppResult<()> {
            tokio::fs::write(output, b"png").await?;
            Ok(())
        }
    }

    #[tokio::test]
    async fn test_failover_switches_backend() {
        let dir = tempfile::tempdir().unwrap();
        let calls = Arc::new(AtomicUsize::new(0));
        let generator = ImageGenerator::new(
            Arc::new(FailingBackend { calls: calls.clone() }),
            Some(Arc::new(WorkingBackend)),
            2,
        );
        let output = dir.path().join("img.png");
        let cancel = CancelFlag::new();
        let outcome = generator
            .generate_with_failover("a test prompt", &output, &cancel)
            .await
            .unwrap();
        assert!(matches!(outcome, ImageOutcome::Generated(_)));
        assert_eq!(calls.load(Ordering::SeqCst), 2);
    }

    #[tokio::test]
    async fn test_failover_skips_when_all_fail() {
        let dir = tempfile::tempdir().unwrap();
        let generator = ImageGenerator::new(
            Arc::new(FailingBackend {
                calls: Arc::new(AtomicUsize::new(0)),
            }),
            None,
            2,
        );
        let output = dir.path().join("img.png");
        let cancel = CancelFlag::new();
        let outcome = generator
            .generate_with_failover("a test prompt", &output, &cancel)
            .await
            .unwrap();
        assert!(matches!(outcome, ImageOutcome::Skipped));
    }
}
