//! Discovery of the external media tools and small ffprobe helpers.

use crate::errors::{AppError, AppResult};
use log::info;
use std::path::{Path, PathBuf};
use std::process::Stdio;
use tokio::process::Command as TokioCommand;

/// Resolved paths of the external tools the pipeline shells out to.
#[derive(Debug, Clone)]
pub struct MediaTools {
    pub ffmpeg: PathBuf,
    pub ffprobe: PathBuf,
}

impl MediaTools {
    /// Locate ffmpeg and ffprobe in PATH.
    pub fn discover() -> AppResult<Self> {
        let ffmpeg = which::which("ffmpeg")
            .map_err(|e| AppError::MediaToolError(format!("ffmpeg not found in PATH: {}", e)))?;
        let ffprobe = which::which("ffprobe")
            .map_err(|e| AppError::MediaToolError(format!("ffprobe not found in PATH: {}", e)))?;
        info!("Found ffmpeg at {}", ffmpeg.display());
        Ok(Self { ffmpeg, ffprobe })
    }
}

/// Duration of a media file in seconds, via ffprobe.
pub async fn probe_duration(ffprobe: &Path, media: &Path) -> AppResult<f32> {
    let output = TokioCommand::new(ffprobe)
        .args([
            "-v",
            "error",
            "-show_entries",
            "format=duration",
            "-of",
            "default=noprint_wrappers=1:nokey=1",
        ])
        .arg(media)
        .stdout(Stdio::piped())
        .stderr(Stdio::piped())
        .output()
        .await?;

    if !output.status.success() {
        let stderr = String::from_utf8_lossy(&output.stderr);
        return Err(AppError::MediaToolError(format!(
            "ffprobe failed for {}: {}",
            media.display(),
            stderr.trim()
        )));
    }

    let stdout = String::from_utf8_lossy(&output.stdout);
    stdout.trim().parse::<f32>().map_err(|e| {
        AppError::MediaToolError(format!(
            "could not parse duration {:?} for {}: {}",
            stdout.trim(),
            media.display(),
            e
        ))
    })
}

/// Parse an "HH:MM:SS.cs" time value from an ffmpeg progress line.
pub fn parse_ffmpeg_time(value: &str) -> Option<f32> {
    let parts: Vec<&str> = value.trim().split(':').collect();
    if parts.len() != 3 {
        return None;
    }
    let hours: f32 = parts[0].parse().ok()?;
    let minutes: f32 = parts[1].parse().ok()?;
    let seconds: f32 = parts[2].parse().ok()?;
    Some(hours * 3600.0 + minutes * 60.0 + seconds)
}
