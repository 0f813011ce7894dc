// Translation and rewrite services.
// The primary text transformation plus the auxiliary texts derived from it.

use crate::errors::{AppResult, BackendError};
use crate::utils::retry::classify_response;
use async_trait::async_trait;
use log::{debug, info};
use once_cell::sync::Lazy;
use reqwest::Client;
use serde::{Deserialize, Serialize};
use std::time::Duration;

static HTTP_CLIENT: Lazy<Client> = Lazy::new(|| {
    Client::builder()
        .timeout(Duration::from_secs(120))
        .build()
        .unwrap_or_default()
});

/// How the primary transformation treats the source text.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TransformMode {
    Translate,
    Rewrite,
}

/// Auxiliary texts derived from the primary transformation's output.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum AuxKind {
    CallToAction,
    /// One image-description prompt per line.
    ImagePrompts,
}

#[async_trait]
pub trait TranslationProvider: Send + Sync {
    /// Run the primary text transformation for one language task.
    async fn transform(
        &self,
        text: &str,
        target_language: &str,
        mode: TransformMode,
    ) -> AppResult<String>;

    /// Generate an auxiliary text from the primary transformation's output.
    async fn auxiliary(&self, primary: &str, language: &str, kind: AuxKind) -> AppResult<String>;
}

// Chat message structure for the OpenAI API
#[derive(Debug, Serialize, Deserialize)]
struct Message {
    role: String,
    content: String,
}

#[derive(Debug, Serialize)]
struct ChatRequest {
    model: String,
    messages: Vec<Message>,
    temperature: f32,
}

#[derive(Debug, Deserialize)]
struct ChatCompletion {
    choices: Vec<Choice>,
}

#[derive(Debug, Deserialize)]
struct Choice {
    message: ResponseMessage,
}

#[derive(Debug, Deserialize)]
struct ResponseMessage {
    content: String,
}

/// Chat-completion based translator/rewriter.
pub struct OpenAiTranslator {
    api_key: String,
    model: String,
}

impl OpenAiTranslator {
    pub fn new(api_key: impl Into<String>, model: impl Into<String>) -> Self {
        Self {
            api_key: api_key.into(),
            model: model.into(),
        }
    }

    async fn chat(&self, system: String, user: String) -> AppResult<String> {
        let request = ChatRequest {
            model: self.model.clone(),
            messages: vec![
                Message {
                    role: "system".to_string(),
                    content: system,
                },
                Message {
                    role: "user".to_string(),
                    content: user,
                },
            ],
            temperature: 0.3,
        };

        debug!("Sending chat request to OpenAI API, model {}", self.model);
        let response = HTTP_CLIENT
            .post("https://api.openai.com/v1/chat/completions")
            .header("Authorization", format!("Bearer {}", self.api_key))
            .json(&request)
            .send()
            .await?;

        let status = response.status();
        if !status.is_success() {
            let body = response.text().await.unwrap_or_default();
            return Err(classify_response(status, &body, None).into());
        }

        let completion: ChatCompletion = response.json().await?;
        let content = completion
            .choices
            .first()
            .map(|c| c.message.content.trim().to_string())
            .ok_or_else(|| BackendError::transient("empty chat completion"))?;
        Ok(content)
    }
}

#[async_trait]
impl TranslationProvider for OpenAiTranslator {
    async fn transform(
        &self,
        text: &str,
        target_language: &str,
        mode: TransformMode,
    ) -> AppResult<String> {
        let system = match mode {
            TransformMode::Translate => format!(
                "You are a professional translator. Translate the following text into {}. \
                 Keep the translation natural and accurate, preserve paragraph structure, \
                 and respond with the translated text only.",
                target_language
            ),
            TransformMode::Rewrite => format!(
                "You are a professional editor. Rewrite the following text in {} so it \
                 reads naturally when narrated aloud, preserving all facts. Respond with \
                 the rewritten text only.",
                target_language
            ),
        };
        info!("Transforming text for language {}", target_language);
        self.chat(system, text.to_string()).await
    }

    async fn auxiliary(&self, primary: &str, language: &str, kind: AuxKind) -> AppResult<String> {
        let system = match kind {
            AuxKind::CallToAction => format!(
                "Write a short, friendly call to action in {} for the narration below. \
                 One or two sentences, no hashtags. Respond with the call to action only.",
                language
            ),
            AuxKind::ImagePrompts => format!(
                "Read the narration below and write visual image-description prompts in \
                 English that illustrate it, one prompt per line, in narration order. \
                 Respond with the prompts only. The narration is in {}.",
                language
            ),
        };
        self.chat(system, primary.to_string()).await
    }
}

/// Split an image-prompt auxiliary text into individual prompts.
pub fn split_prompts(text: &str) -> Vec<String> {
    text.lines()
        .map(|line| line.trim().trim_start_matches(['-', '*', '•']).trim())
        .map(|line| {
            // Strip "1." style numbering.
            match line.split_once('.') {
                Some((head, rest)) if head.chars().all(|c| c.is_ascii_digit()) && !head.is_empty() => {
                    rest.trim()
                }
                _ => line,
            }
        })
        .filter(|line| !line.is_empty())
        .map(|line| line.to_string())
        .collect()
}
