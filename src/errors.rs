use std::time::Duration;
use thiserror::Error;

/// Coarse classification used by the retry helpers to decide whether an
/// operation is worth repeating.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ErrorClass {
    /// Network hiccup, 5xx, 429: retry after a delay.
    Transient,
    /// Balance or quota exhausted: block and retry until resolved.
    QuotaExhausted,
    /// Auth failure, malformed request: do not retry.
    Fatal,
}

/// Error returned by a speech/translation/image/transcription backend call.
#[derive(Debug, Error)]
#[error("{message}")]
pub struct BackendError {
    pub class: ErrorClass,
    pub message: String,
    /// Delay suggested by the backend (Retry-After), if any.
    pub retry_after: Option<Duration>,
}

impl BackendError {
    pub fn transient(message: impl Into<String>) -> Self {
        Self {
            class: ErrorClass::Transient,
            message: message.into(),
            retry_after: None,
        }
    }

    pub fn fatal(message: impl Into<String>) -> Self {
        Self {
            class: ErrorClass::Fatal,
            message: message.into(),
            retry_after: None,
        }
    }

    pub fn quota(message: impl Into<String>) -> Self {
        Self {
            class: ErrorClass::QuotaExhausted,
            message: message.into(),
            retry_after: None,
        }
    }

    pub fn with_retry_after(mut self, delay: Duration) -> Self {
        self.retry_after = Some(delay);
        self
    }
}

#[derive(Debug, Error)]
pub enum AppError {
    #[error("Configuration error: {0}")]
    ConfigurationError(String),

    #[error("Backend error: {0}")]
    Backend(#[from] BackendError),

    #[error("Media tool error: {0}")]
    MediaToolError(String),

    #[error("Pipeline error: {0}")]
    PipelineError(String),

    #[error("Operation cancelled")]
    Cancelled,

    #[error("I/O error: {0}")]
    IoError(#[from] std::io::Error),

    #[error("HTTP error: {0}")]
    HttpError(#[from] reqwest::Error),

    #[error(transparent)]
    Other(#[from] anyhow::Error),
}

impl From<String> for AppError {
    fn from(message: String) -> Self {
        AppError::PipelineError(message)
    }
}

impl From<&str> for AppError {
    fn from(message: &str) -> Self {
        AppError::PipelineError(message.to_string())
    }
}

impl AppError {
    /// Classification used by the retry helpers. Anything that is not an
    /// explicitly classified backend error counts as transient, except
    /// cancellation which always wins.
    pub fn class(&self) -> ErrorClass {
        match self {
            AppError::Backend(e) => e.class,
            AppError::Cancelled => ErrorClass::Fatal,
            AppError::ConfigurationError(_) => ErrorClass::Fatal,
            _ => ErrorClass::Transient,
        }
    }

    pub fn retry_after(&self) -> Option<Duration> {
        match self {
            AppError::Backend(e) => e.retry_after,
            _ => None,
        }
    }
}

pub type AppResult<T> = Result<T, AppError>;
