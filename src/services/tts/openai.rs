use crate::errors::AppResult;
use crate::services::tts::TtsService;
use crate::utils::retry::classify_response;
use async_trait::async_trait;
use log::info;
use once_cell::sync::Lazy;
use reqwest::Client;
use serde_json::json;
use std::path::Path;
use std::time::Duration;

static HTTP_CLIENT: Lazy<Client> = Lazy::new(|| {
    Client::builder()
        .timeout(Duration::from_secs(300))
        .build()
        .unwrap_or_default()
});

/// Client for the OpenAI TTS API.
pub struct OpenAiTts {
    api_key: String,
    model: String,
    speed: f32,
}

impl OpenAiTts {
    pub fn new(api_key: impl Into<String>) -> Self {
        Self {
            api_key: api_key.into(),
            model: "tts-1".to_string(),
            speed: 1.0,
        }
    }
}

#[async_trait]
impl TtsService for OpenAiTts {
    async fn synthesize(&self, text: &str, voice: &str, output: &Path) -> AppResult<()> {
        info!(
            "Generating speech, {} chars, voice {}",
            text.chars().count(),
            voice
        );

        let response = HTTP_CLIENT
            .post("https://api.openai.com/v1/audio/speech")
            .header("Authorization", format!("Bearer {}", self.api_key))
            .json(&json!({
                "model": self.model,
                "voice": voice,
                "input": text,
                "speed": self.speed,
            }))
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
