// Audio transcription services.
// Each audio chunk is transcribed independently; the resulting subtitle
// artifact carries timestamps relative to the chunk's own start, so it can
// be muxed against its paired audio chunk without whole-file offsets.

use crate::errors::{AppResult, BackendError};
use crate::utils::retry::classify_response;
use async_trait::async_trait;
use log::{debug, info};
use once_cell::sync::Lazy;
use reqwest::Client;
use reqwest::multipart;
use serde::Deserialize;
use std::path::Path;
use std::time::Duration;

static HTTP_CLIENT: Lazy<Client> = Lazy::new(|| {
    Client::builder()
        .timeout(Duration::from_secs(600))
        .build()
        .unwrap_or_default()
});

/// One timed segment of a transcript.
#[derive(Debug, Clone, Deserialize)]
pub struct TranscriptSegment {
    pub start: f32,
    pub end: f32,
    pub text: String,
}

#[async_trait]
pub trait TranscriptionProvider: Send + Sync {
    async fn transcribe(&self, audio_path: &Path) -> AppResult<Vec<TranscriptSegment>>;
}

#[derive(Debug, Deserialize)]
struct VerboseTranscription {
    segments: Vec<TranscriptSegment>,
}

/// Whisper-style HTTP transcription client.
pub struct WhisperClient {
    api_key: String,
    model: String,
}

impl WhisperClient {
    pub fn new(api_key: impl Into<String>) -> Self {
        Self {
            api_key: api_key.into(),
            model: "whisper-1".to_string(),
        }
    }
}

#[async_trait]
impl TranscriptionProvider for WhisperClient {
    async fn transcribe(&self, audio_path: &Path) -> AppResult<Vec<TranscriptSegment>> {
        info!("Transcribing {}", audio_path.display());
        let bytes = tokio::fs::read(audio_path).await?;
        let filename = audio_path
            .file_name()
            .map(|n| n.to_string_lossy().to_string())
            .unwrap_or_else(|| "audio.mp3".to_string());

        let form = multipart::Form::new()
            .text("model", self.model.clone())
            .text("response_format", "verbose_json")
            .text("timestamp_granularities[]", "segment")
            .part(
                "file",
                multipart::Part::bytes(bytes)
                    .file_name(filename)
                    .mime_str("audio/mpeg")
                    .map_err(|e| BackendError::fatal(format!("invalid mime type: {}", e)))?,
            );

        let response = HTTP_CLIENT
            .post("https://api.openai.com/v1/audio/transcriptions")
            .header("Authorization", format!("Bearer {}", self.api_key))
            .multipart(form)
            .send()
            .await?;

        let status = response.status();
        if !status.is_success() {
            let body = response.text().await.unwrap_or_default();
            return Err(classify_response(status, &body, None).into());
        }

        let transcription: VerboseTranscription = response.json().await?;
        debug!(
            "Transcribed {} segments from {}",
            transcription.segments.len(),
            audio_path.display()
        );
        Ok(transcription.segments)
    }
}

/// Format seconds as a WebVTT timestamp (HH:MM:SS.mmm).
pub fn format_timestamp(seconds: f32) -> String {
    let total_millis = (seconds.max(0.0) * 1000.0).round() as u64;
    let hours = total_millis / 3_600_000;
    let minutes = (total_millis % 3_600_000) / 60_000;
    let secs = (total_millis % 60_000) / 1000;
    let millis = total_millis % 1000;
    format!("{:02}:{:02}:{:02}.{:03}", hours, minutes, secs, millis)
}

/// Write segments to a WebVTT file. Timestamps are written exactly as
/// provided, i.e. relative to the start of the audio that was transcribed.
pub async fn write_vtt(segments: &[TranscriptSegment], dest: &Path) -> AppResult<()> {
    let mut content = String::from("WEBVTT\n\n");
    for segment in segments {
        content.push_str(&format!(
            "{} --> {}\n{}\n\n",
            format_timestamp(segment.start),
            format_timestamp(segment.end),
            segment.text.trim()
        ));
    }
    if let Some(parent) = dest.parent() {
        tokio::fs::create_dir_all(parent).await?;
    }
    tokio::fs::write(dest, content.as_bytes()).await?;
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_format_timestamp() {
        assert_eq!(format_timestamp(0.0), "00:00:00.000");
        assert_eq!(format_timestamp(1.5), "00:00:01.500");
        assert_eq!(format_timestamp(61.25), "00:01:01.250");
        assert_eq!(format_timestamp(3661.0), "01:01:01.000");
        // Negative input clamps to zero.
        assert_eq!(format_timestamp(-3.0), "00:00:00.000");
    }

    #[tokio::test]
    async fn test_write_vtt() {
        let dir = tempfile::tempdir().unwrap();
        let dest = dir.path().join("out.vtt");
        let segments = vec![
            TranscriptSegment {
                start: 0.0,
                end: 2.5,
                text: "Hello there.".to_string(),
            },
            TranscriptSegment {
                start: 2.5,
                end: 4.0,
                text: "Second line.".to_string(),
            },
        ];
        write_vtt(&segments, &dest).await.unwrap();
        let content = tokio::fs::read_to_string(&dest).await.unwrap();
        assert!(content.starts_with("WEBVTT\n\n"));
        assert!(content.contains("00:00:00.000 --> 00:00:02.500\nHello there."));
        assert!(content.contains("00:00:02.500 --> 00:00:04.000\nSecond line."));
    }
}
