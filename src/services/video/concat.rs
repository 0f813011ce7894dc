//! Lossless concatenation of media segments via the ffmpeg concat demuxer.
//!
//! Inputs must share codec and container compatibility; the join is a stream
//! copy, no re-encode. Callers are responsible for passing segments already
//! sorted by chunk index.

use crate::errors::{AppError, AppResult};
use async_trait::async_trait;
use log::info;
use std::path::{Path, PathBuf};
use std::process::Stdio;
use tokio::io::AsyncWriteExt;
use tokio::process::Command as TokioCommand;

/// Stream-copy concatenation seam, also what the chunk-group merger joins
/// audio with.
#[async_trait]
pub trait Concatenator: Send + Sync {
    async fn concatenate(&self, inputs: &[PathBuf], output: &Path) -> AppResult<PathBuf>;
}

/// ffmpeg concat-demuxer implementation.
pub struct FfmpegConcatenator {
    ffmpeg: PathBuf,
}

impl FfmpegConcatenator {
    pub fn new(ffmpeg: PathBuf) -> Self {
        Self { ffmpeg }
    }
}

#[async_trait]
impl Concatenator for FfmpegConcatenator {
    async fn concatenate(&self, inputs: &[PathBuf], output: &Path) -> AppResult<PathBuf> {
        concat_media(&self.ffmpeg, inputs, output).await
    }
}

/// Join `inputs` in the given order into `output` with a stream copy.
pub async fn concat_media(ffmpeg: &Path, inputs: &[PathBuf], output: &Path) -> AppResult<PathBuf> {
    if inputs.is_empty() {
        return Err(AppError::MediaToolError(
            "concat requires at least one input".to_string(),
        ));
    }
    if inputs.len() == 1 {
        tokio::fs::copy(&inputs[0], output).await?;
        return Ok(output.to_path_buf());
    }

    if let Some(parent) = output.parent() {
        tokio::fs::create_dir_all(parent).await?;
    }

    // Concat demuxer list file; single quotes in paths are escaped the
    // ffmpeg way ('\'' ).
    let list_path = output.with_extension("concat.txt");
    let mut list = tokio::fs::File::create(&list_path).await?;
    for input in inputs {
        let escaped = input.to_string_lossy().replace('\'', "'\\''");
        list.write_all(format!("file '{}'\n", escaped).as_bytes())
            .await?;
    }
    list.flush().await?;
    drop(list);

    info!(
        "Concatenating {} segments into {}",
        inputs.len(),
        output.display()
    );

    let output_result = TokioCommand::new(ffmpeg)
        .args(["-f", "concat", "-safe", "0", "-i"])
        .arg(&list_path)
        .args(["-c", "copy", "-y"])
        .arg(output)
        .stdout(Stdio::piped())
        .stderr(Stdio::piped())
        .output()
        .await?;

    let _ = tokio::fs::remove_file(&list_path).await;

    if !output_result.status.success() {
        let stderr = String::from_utf8_lossy(&output_result.stderr);
        return Err(AppError::MediaToolError(format!(
            "ffmpeg concat failed with status {}: {}",
            output_result.status,
            stderr.trim()
        )));
    }

    Ok(output.to_path_buf())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn test_concat_rejects_empty_input() {
        let result = concat_media(Path::new("ffmpeg"), &[], Path::new("/tmp/out.mp4")).await;
        assert!(result.is_err());
    }

    #[tokio::test]
    async fn test_concat_single_input_copies() {
        let dir = tempfile::tempdir().unwrap();
        let input = dir.path().join("only.mp3");
        tokio::fs::write(&input, b"audio-bytes").await.unwrap();
        let output = dir.path().join("out.mp3");
        // With one input no ffmpeg invocation happens at all.
        let result = concat_media(Path::new("ffmpeg"), &[input], &output)
            .await
            .unwrap();
        assert_eq!(result, output);
        assert_eq!(tokio::fs::read(&output).await.unwrap(), b"audio-bytes");
    }
}
