//! Rendering of one video segment per (image slice, audio chunk, subtitle
//! chunk) triple.

use crate::errors::{AppError, AppResult};
use crate::services::video::tools::{MediaTools, parse_ffmpeg_time, probe_duration};
use async_trait::async_trait;
use log::{debug, info, warn};
use std::path::{Path, PathBuf};
use std::process::Stdio;
use std::time::Duration;
use tokio::io::{AsyncBufReadExt, AsyncWriteExt, BufReader};
use tokio::process::Command as TokioCommand;
use tokio::sync::mpsc;
use tokio::time::timeout;

const RENDER_TIMEOUT: Duration = Duration::from_secs(1800);

#[async_trait]
pub trait VideoRenderer: Send + Sync {
    /// Render one segment: the image slice shown across the duration of the
    /// audio chunk, subtitles burned in. Fractional progress (0.0..=1.0) is
    /// reported through `progress` when provided.
    async fn render_segment(
        &self,
        images: &[PathBuf],
        audio: &Path,
        subtitles: &Path,
        output: &Path,
        progress: Option<mpsc::Sender<f32>>,
    ) -> AppResult<PathBuf>;
}

/// ffmpeg-based segment renderer.
pub struct FfmpegRenderer {
    tools: MediaTools,
    width: u32,
    height: u32,
}

impl FfmpegRenderer {
    pub fn new(tools: MediaTools) -> Self {
        Self {
            tools,
            width: 1920,
            height: 1080,
        }
    }

    /// Slideshow list file: each image shown for an equal share of the audio
    /// duration. The last image is repeated without a duration directive, as
    /// the concat demuxer requires.
    async fn write_slideshow_list(
        &self,
        images: &[PathBuf],
        total_secs: f32,
        list_path: &Path,
    ) -> AppResult<()> {
        let per_image = total_secs / images.len() as f32;
        let mut list = tokio::fs::File::create(list_path).await?;
        for image in images {
            let escaped = image.to_string_lossy().replace('\'', "'\\''");
            list.write_all(format!("file '{}'\nduration {:.3}\n", escaped, per_image).as_bytes())
                .await?;
        }
        if let Some(last) = images.last() {
            let escaped = last.to_string_lossy().replace('\'', "'\\''");
            list.write_all(format!("file '{}'\n", escaped).as_bytes())
                .await?;
        }
        list.flush().await?;
        Ok(())
    }
}

#[async_trait]
impl VideoRenderer for FfmpegRenderer {
    async fn render_segment(
        &self,
        images: &[PathBuf],
        audio: &Path,
        subtitles: &Path,
        output: &Path,
        progress: Option<mpsc::Sender<f32>>,
    ) -> AppResult<PathBuf> {
        let duration = probe_duration(&self.tools.ffprobe, audio).await?;
        if let Some(parent) = output.parent() {
            tokio::fs::create_dir_all(parent).await?;
        }

        let list_path = output.with_extension("slides.txt");
        let mut args: Vec<String> = Vec::new();

        if images.is_empty() {
            // No images fell to this chunk; render on a plain background.
            args.extend([
                "-f".into(),
                "lavfi".into(),
                "-i".into(),
                format!("color=c=black:s={}x{}:d={:.3}", self.width, self.height, duration),
            ]);
        } else {
            self.write_slideshow_list(images, duration, &list_path).await?;
            args.extend([
                "-f".into(),
                "concat".into(),
                "-safe".into(),
                "0".into(),
                "-i".into(),
                list_path.to_string_lossy().to_string(),
            ]);
        }

        let subtitles_escaped = subtitles
            .to_string_lossy()
            .replace('\\', "\\\\")
            .replace(':', "\\:")
            .replace('\'', "\\'");
        args.extend([
            "-i".into(),
            audio.to_string_lossy().to_string(),
            "-vf".into(),
            format!(
                "scale={w}:{h}:force_original_aspect_ratio=decrease,pad={w}:{h}:(ow-iw)/2:(oh-ih)/2,fps=30,subtitles='{subs}'",
                w = self.width,
                h = self.height,
                subs = subtitles_escaped
            ),
            "-map".into(),
            "0:v:0".into(),
            "-map".into(),
            "1:a:0".into(),
            "-c:v".into(),
            "libx264".into(),
            "-pix_fmt".into(),
            "yuv420p".into(),
            "-c:a".into(),
            "aac".into(),
            "-b:a".into(),
            "192k".into(),
            "-shortest".into(),
            "-y".into(),
            output.to_string_lossy().to_string(),
        ]);

        info!(
            "Rendering segment {} ({} images, {:.1}s audio)",
            output.display(),
            images.len(),
            duration
        );
        debug!("ffmpeg {}", args.join(" "));

        let mut child = TokioCommand::new(&self.tools.ffmpeg)
            .args(&args)
            .stdout(Stdio::piped())
            .stderr(Stdio::piped())
            .spawn()
            .map_err(|e| AppError::MediaToolError(format!("failed to start ffmpeg: {}", e)))?;

        // ffmpeg reports progress on stderr as "time=HH:MM:SS.cs".
        let mut stderr_tail = String::new();
        if let Some(stderr) = child.stderr.take() {
            let progress_tx = progress.clone();
            let mut lines = BufReader::new(stderr).lines();
            let reader = tokio::spawn(async move {
                let mut tail = String::new();
                while let Ok(Some(line)) = lines.next_line().await {
                    if let Some(time_str) = line.split("time=").nth(1) {
                        if let Some(time) = time_str.split(' ').next().and_then(parse_ffmpeg_time) {
                            if let Some(tx) = &progress_tx {
                                let fraction = (time / duration.max(0.001)).clamp(0.0, 1.0);
                                let _ = tx.send(fraction).await;
                            }
                        }
                    }
                    tail = line;
                }
                tail
            });
            stderr_tail = reader.await.unwrap_or_default();
        }

        let status = match timeout(RENDER_TIMEOUT, child.wait()).await {
            Ok(status) => status?,
            Err(_) => {
                warn!("ffmpeg render timed out, killing process");
                let _ = child.kill().await;
                let _ = tokio::fs::remove_file(&list_path).await;
                return Err(AppError::MediaToolError(
                    "ffmpeg render timed out".to_string(),
                ));
            }
        };

        let _ = tokio::fs::remove_file(&list_path).await;

        if !status.success() {
            return Err(AppError::MediaToolError(format!(
                "ffmpeg render failed with status {}: {}",
                status, stderr_tail
            )));
        }

        if let Some(tx) = &progress {
            let _ = tx.send(1.0).await;
        }
        Ok(output.to_path_buf())
    }
}
