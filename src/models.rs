// Core data model shared by the pipeline stages.

use serde::{Deserialize, Serialize};
use std::path::PathBuf;

/// Speech backends selectable per language task.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum TtsEngine {
    /// Synchronous HTTP backend, served through the bounded worker pool.
    OpenAi,
    /// Quota-constrained submit-then-poll backend, served through the
    /// rate-limited submitter.
    Replica,
}

/// Image backends selectable per language task.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ImageEngine {
    Dalle,
    Stability,
}

/// Where the source text of a task comes from.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub enum TaskSource {
    /// Text typed or pasted by the user.
    Text(String),
    /// Local audio/video file that must be transcribed first.
    Media(PathBuf),
}

/// Which optional steps are enabled for a task.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct StepToggles {
    /// Rewrite in the same language instead of translating.
    pub rewrite: bool,
    pub call_to_action: bool,
    pub image_prompts: bool,
    pub generate_images: bool,
}

/// One target language of a task, with its backend choices fixed up front.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct LanguageSpec {
    pub code: String,
    pub voice: String,
    pub tts_engine: TtsEngine,
    pub image_engine: ImageEngine,
    /// Distinguishes a second rendition of the same language within one task.
    pub variant: bool,
}

/// One unit of user work. `task_index` is assigned at enqueue time and never
/// changes afterwards.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Task {
    pub task_index: usize,
    pub source: TaskSource,
    pub target_languages: Vec<LanguageSpec>,
    pub steps: StepToggles,
}

/// Unique identity of "this language within this task". Every downstream
/// structure is keyed by this.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct LanguageTaskKey {
    pub task_index: usize,
    pub language_code: String,
    pub variant: bool,
}

impl LanguageTaskKey {
    pub fn new(task_index: usize, language_code: impl Into<String>, variant: bool) -> Self {
        Self {
            task_index,
            language_code: language_code.into(),
            variant,
        }
    }
}

impl std::fmt::Display for LanguageTaskKey {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        if self.variant {
            write!(f, "task{}-{}-alt", self.task_index, self.language_code)
        } else {
            write!(f, "task{}-{}", self.task_index, self.language_code)
        }
    }
}

/// One chunk of work for the synthesis or transcription queue.
///
/// For synthesis `text` carries the input and `output_path` names the audio
/// file to produce. For transcription `audio_path` carries the input (`None`
/// when upstream synthesis failed and only an accounting entry is needed) and
/// `output_path` names the subtitle file to produce.
#[derive(Debug, Clone)]
pub struct ChunkItem {
    pub owner: LanguageTaskKey,
    pub chunk_index: usize,
    pub total_chunks: usize,
    pub text: Option<String>,
    pub audio_path: Option<PathBuf>,
    pub output_path: PathBuf,
    pub voice: String,
    /// Set when this item is the product of a chunk-group merge.
    pub merged: bool,
}

/// Emitted exactly once per submitted `ChunkItem`.
#[derive(Debug, Clone)]
pub struct WorkerResult {
    pub success: bool,
    pub item: ChunkItem,
}

/// Status of one pipeline step for one language task.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum StepStatus {
    Pending,
    InProgress,
    Done,
    Failed,
    Skipped,
}

/// The named steps tracked per language task.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum PipelineStep {
    TransformText,
    AuxiliaryTexts,
    GenerateImages,
    GenerateAudio,
    TranscribeChunks,
    RenderVideo,
}

impl PipelineStep {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::TransformText => "transform_text",
            Self::AuxiliaryTexts => "auxiliary_texts",
            Self::GenerateImages => "generate_images",
            Self::GenerateAudio => "generate_audio",
            Self::TranscribeChunks => "transcribe_chunks",
            Self::RenderVideo => "render_video",
        }
    }
}

/// Subtitle artifact produced for one audio chunk. Timestamps inside the file
/// are relative to the chunk's own start, so it stays consistent when muxed
/// against its paired audio chunk.
#[derive(Debug, Clone)]
pub struct SubtitleChunk {
    pub subs_path: Option<PathBuf>,
    pub audio_path: Option<PathBuf>,
    pub chunk_index: usize,
    pub merged: bool,
}

/// Outcome summary for one language task, emitted by the assembly stage.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct LanguageReport {
    pub key: LanguageTaskKey,
    pub final_video: Option<PathBuf>,
    pub failed_step: Option<PipelineStep>,
    pub finished_at: chrono::DateTime<chrono::Utc>,
}

/// Outcome summary for a whole run.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RunReport {
    pub languages: Vec<LanguageReport>,
    pub started_at: chrono::DateTime<chrono::Utc>,
    pub finished_at: chrono::DateTime<chrono::Utc>,
    pub cancelled: bool,
}
