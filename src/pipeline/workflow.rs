//! Top-level orchestrator: sequences the pipeline stages across the whole
//! task queue and exposes pause, cancel and the review barrier.
//!
//! Stages are run-wide barriers, not per-task loops: every language task
//! moves through text transformation before any of them starts media
//! generation. A language task that fails its text transform is excluded
//! from the later stages without aborting its siblings.

use crate::config::AppConfig;
use crate::errors::{AppError, AppResult};
use crate::models::{
    ChunkItem, ImageEngine, LanguageReport, LanguageSpec, LanguageTaskKey, PipelineStep,
    RunReport, StepStatus, StepToggles, SubtitleChunk, Task, TaskSource, TtsEngine,
};
use crate::pipeline::control::{CancelFlag, PauseGate};
use crate::pipeline::merger::ChunkGroupMerger;
use crate::pipeline::pool::AudioWorkerPool;
use crate::pipeline::progress::{CounterKind, ProgressTracker};
use crate::pipeline::submitter::RateLimitedSubmitter;
use crate::services::chunking::{chunk_balanced, chunk_for_quota_backend, partition_front_loaded};
use crate::services::image::{ImageGenerator, ImageOutcome, ImageProvider};
use crate::services::transcription::TranscriptionProvider;
use crate::services::translation::{AuxKind, TransformMode, TranslationProvider, split_prompts};
use crate::services::tts::{AsyncTtsService, TtsService, is_quota_constrained};
use crate::services::video::{Concatenator, FfmpegConcatenator, FfmpegRenderer, MediaTools, VideoRenderer};
use crate::utils::common::{check_file_exists_and_valid, content_key, sanitize_filename};
use chrono::Utc;
use futures::stream::{self, StreamExt};
use log::{error, info, warn};
use std::collections::HashMap;
use std::path::PathBuf;
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};
use std::time::Duration;
use tokio::sync::{Notify, mpsc};
use tokio::time::Instant;
use uuid::Uuid;

/// Concrete backends the orchestrator dispatches to. Engine selection
/// happens once per language task at construction time; after that the
/// pipeline only ever sees trait objects.
pub struct ProviderSet {
    pub translator: Arc<dyn TranslationProvider>,
    pub sync_tts: HashMap<TtsEngine, Arc<dyn TtsService>>,
    pub async_tts: Option<Arc<dyn AsyncTtsService>>,
    pub transcriber: Arc<dyn TranscriptionProvider>,
    pub image_backends: HashMap<ImageEngine, Arc<dyn ImageProvider>>,
    pub renderer: Arc<dyn VideoRenderer>,
    pub concatenator: Arc<dyn Concatenator>,
}

impl ProviderSet {
    /// Wire up the production backends from the configuration. Fails when
    /// ffmpeg/ffprobe are missing from PATH.
    pub fn from_config(config: &AppConfig) -> AppResult<Self> {
        use crate::services::image::{DalleClient, StabilityClient};
        use crate::services::transcription::WhisperClient;
        use crate::services::translation::OpenAiTranslator;
        use crate::services::tts::{ReplicaClient, sync_engine};

        let tools = MediaTools::discover()?;

        let mut sync_tts: HashMap<TtsEngine, Arc<dyn TtsService>> = HashMap::new();
        sync_tts.insert(TtsEngine::OpenAi, sync_engine(TtsEngine::OpenAi, config)?);

        let mut image_backends: HashMap<ImageEngine, Arc<dyn ImageProvider>> = HashMap::new();
        image_backends.insert(
            ImageEngine::Dalle,
            Arc::new(DalleClient::new(&config.openai_api_key)),
        );
        if !config.stability_api_key.is_empty() {
            image_backends.insert(
                ImageEngine::Stability,
                Arc::new(StabilityClient::new(&config.stability_api_key)),
            );
        }

        let async_tts: Option<Arc<dyn AsyncTtsService>> = if config.replica_api_key.is_empty() {
            None
        } else {
            Some(Arc::new(ReplicaClient::new(&config.replica_api_key)))
        };

        Ok(Self {
            translator: Arc::new(OpenAiTranslator::new(
                &config.openai_api_key,
                &config.text_model,
            )),
            sync_tts,
            async_tts,
            transcriber: Arc::new(WhisperClient::new(&config.openai_api_key)),
            image_backends,
            renderer: Arc::new(FfmpegRenderer::new(tools.clone())),
            concatenator: Arc::new(FfmpegConcatenator::new(tools.ffmpeg)),
        })
    }
}

/// A language task that survived text transformation and moves on to media
/// generation.
struct LanguageWork {
    key: LanguageTaskKey,
    lang: LanguageSpec,
    steps: StepToggles,
    dir: PathBuf,
    text: String,
    image_prompts: Vec<String>,
}

/// Bookkeeping for one owner key inside the audio wait loop.
struct OwnerState {
    expected: usize,
    received: usize,
    audio_failed: usize,
    subs: Vec<SubtitleChunk>,
    subs_dir: PathBuf,
    quota: Option<QuotaGroup>,
}

struct QuotaGroup {
    group_key: Uuid,
    raw_total: usize,
    merge_dir: PathBuf,
}

pub struct WorkflowManager {
    config: AppConfig,
    providers: ProviderSet,
    tracker: Arc<ProgressTracker>,
    cancel: CancelFlag,
    pause: PauseGate,
    review_confirmed: AtomicBool,
    review_notify: Notify,
}

impl WorkflowManager {
    pub fn new(config: AppConfig, providers: ProviderSet) -> Self {
        Self {
            config,
            providers,
            tracker: Arc::new(ProgressTracker::new()),
            cancel: CancelFlag::new(),
            pause: PauseGate::new(),
            review_confirmed: AtomicBool::new(false),
            review_notify: Notify::new(),
        }
    }

    pub fn tracker(&self) -> Arc<ProgressTracker> {
        Arc::clone(&self.tracker)
    }

    pub fn cancel_flag(&self) -> CancelFlag {
        self.cancel.clone()
    }

    pub fn cancel(&self) {
        self.cancel.cancel();
    }

    pub fn pause(&self) {
        self.pause.pause();
    }

    pub fn resume(&self) {
        self.pause.resume();
    }

    /// Release the review barrier. Safe to call before the run reaches it.
    pub fn confirm_review(&self) {
        self.review_confirmed.store(true, Ordering::SeqCst);
        self.review_notify.notify_waiters();
    }

    fn language_dir(&self, key: &LanguageTaskKey) -> PathBuf {
        let lang = sanitize_filename(&if key.variant {
            format!("{}-alt", key.language_code)
        } else {
            key.language_code.clone()
        });
        self.config
            .workspace_dir
            .join(format!("task{}", key.task_index))
            .join(lang)
    }

    /// Run the full pipeline over `tasks` and emit a per-language report.
    pub async fn run(&self, tasks: Vec<Task>) -> AppResult<RunReport> {
        let started_at = Utc::now();

        let mut keys = Vec::new();
        for task in &tasks {
            for lang in &task.target_languages {
                let key = LanguageTaskKey::new(task.task_index, &lang.code, lang.variant);
                self.tracker.register(&key);
                keys.push(key);
            }
        }
        info!("run started: {} tasks, {} language tasks", tasks.len(), keys.len());

        // Stage 1: acquire source text (transcribing media sources).
        let sources = self.acquire_sources(&tasks).await;

        // Stage 2: text transforms plus auxiliary texts, bounded concurrency.
        let works = self.transform_texts(&tasks, &sources).await;

        let mut images = HashMap::new();
        let mut subs = HashMap::new();
        if !self.cancel.is_cancelled() {
            // Stage 3: images and audio→transcription, concurrently across
            // every surviving language task.
            let (image_map, subs_map) =
                tokio::join!(self.generate_images(&works), self.run_audio_pipeline(&works));
            images = image_map;
            subs = subs_map;
        }

        // Stage 4: optional review barrier.
        if !self.cancel.is_cancelled() && self.config.review_required {
            self.wait_for_review().await;
        }

        // Stage 5: assembly.
        let mut finals: HashMap<LanguageTaskKey, PathBuf> = HashMap::new();
        if !self.cancel.is_cancelled() {
            finals = self.assemble(&works, &images, &subs).await;
        }

        let finished_at = Utc::now();
        let cancelled = self.cancel.is_cancelled();
        let languages = keys
            .into_iter()
            .map(|key| LanguageReport {
                final_video: finals.get(&key).cloned(),
                failed_step: self.first_failed_step(&key),
                finished_at,
                key,
            })
            .collect();

        info!("run finished (cancelled: {})", cancelled);
        Ok(RunReport {
            languages,
            started_at,
            finished_at,
            cancelled,
        })
    }

    fn first_failed_step(&self, key: &LanguageTaskKey) -> Option<PipelineStep> {
        [
            PipelineStep::TransformText,
            PipelineStep::AuxiliaryTexts,
            PipelineStep::GenerateImages,
            PipelineStep::GenerateAudio,
            PipelineStep::TranscribeChunks,
            PipelineStep::RenderVideo,
        ]
        .into_iter()
        .find(|step| self.tracker.step_status(key, *step) == StepStatus::Failed)
    }

    async fn acquire_sources(&self, tasks: &[Task]) -> HashMap<usize, String> {
        let mut sources = HashMap::new();
        for task in tasks {
            if self.cancel.is_cancelled() {
                break;
            }
            self.pause.wait_if_paused(&self.cancel).await;
            match &task.source {
                TaskSource::Text(text) => {
                    sources.insert(task.task_index, text.clone());
                }
                TaskSource::Media(path) => {
                    info!("task {}: transcribing source {}", task.task_index, path.display());
                    match self.providers.transcriber.transcribe(path).await {
                        Ok(segments) => {
                            let text = segments
                                .iter()
                                .map(|s| s.text.trim())
                                .filter(|t| !t.is_empty())
                                .collect::<Vec<_>>()
                                .join(" ");
                            sources.insert(task.task_index, text);
                        }
                        Err(e) => {
                            error!("task {}: source transcription failed: {}", task.task_index, e);
                        }
                    }
                }
            }
        }
        sources
    }

    /// Stage 2. Each language task runs its primary transform and, when
    /// enabled, the auxiliary texts derived from the transform's output. A
    /// failed transform excludes only that key from the later stages.
    async fn transform_texts(
        &self,
        tasks: &[Task],
        sources: &HashMap<usize, String>,
    ) -> Vec<LanguageWork> {
        let mut jobs = Vec::new();
        for task in tasks {
            let source = match sources.get(&task.task_index) {
                Some(text) => text,
                None => {
                    for lang in &task.target_languages {
                        let key = LanguageTaskKey::new(task.task_index, &lang.code, lang.variant);
                        self.tracker
                            .set_step(&key, PipelineStep::TransformText, StepStatus::Failed);
                    }
                    continue;
                }
            };
            for lang in &task.target_languages {
                let key = LanguageTaskKey::new(task.task_index, &lang.code, lang.variant);
                jobs.push((key, lang.clone(), task.steps.clone(), source.clone()));
            }
        }

        let concurrency = self.config.pipeline.worker_count.max(1);
        let results: Vec<Option<LanguageWork>> = stream::iter(jobs.into_iter().map(
            |(key, lang, steps, source)| {
                let translator = Arc::clone(&self.providers.translator);
                let tracker = Arc::clone(&self.tracker);
                let cancel = self.cancel.clone();
                let dir = self.language_dir(&key);
                async move {
                    if cancel.is_cancelled() {
                        return None;
                    }
                    tracker.set_step(&key, PipelineStep::TransformText, StepStatus::InProgress);
                    let mode = if steps.rewrite {
                        TransformMode::Rewrite
                    } else {
                        TransformMode::Translate
                    };
                    let text = match translator.transform(&source, &lang.code, mode).await {
                        Ok(text) => text,
                        Err(e) => {
                            error!("{}: text transform failed: {}", key, e);
                            tracker.set_step(&key, PipelineStep::TransformText, StepStatus::Failed);
                            return None;
                        }
                    };
                    tracker.set_step(&key, PipelineStep::TransformText, StepStatus::Done);

                    if let Err(e) = tokio::fs::create_dir_all(&dir).await {
                        error!("{}: cannot create work directory: {}", key, e);
                        tracker.set_step(&key, PipelineStep::TransformText, StepStatus::Failed);
                        return None;
                    }

                    let mut image_prompts = Vec::new();
                    if steps.call_to_action || steps.image_prompts {
                        tracker.set_step(&key, PipelineStep::AuxiliaryTexts, StepStatus::InProgress);
                        let mut aux_failed = false;
                        if steps.call_to_action {
                            match translator
                                .auxiliary(&text, &lang.code, AuxKind::CallToAction)
                                .await
                            {
                                Ok(cta) => {
                                    if let Err(e) =
                                        tokio::fs::write(dir.join("call_to_action.txt"), cta).await
                                    {
                                        warn!("{}: could not store call to action: {}", key, e);
                                        aux_failed = true;
                                    }
                                }
                                Err(e) => {
                                    warn!("{}: call to action failed: {}", key, e);
                                    aux_failed = true;
                                }
                            }
                        }
                        if steps.image_prompts {
                            match translator
                                .auxiliary(&text, &lang.code, AuxKind::ImagePrompts)
                                .await
                            {
                                Ok(raw) => image_prompts = split_prompts(&raw),
                                Err(e) => {
                                    warn!("{}: image prompts failed: {}", key, e);
                                    aux_failed = true;
                                }
                            }
                        }
                        let status = if aux_failed { StepStatus::Failed } else { StepStatus::Done };
                        tracker.set_step(&key, PipelineStep::AuxiliaryTexts, status);
                    } else {
                        tracker.set_step(&key, PipelineStep::AuxiliaryTexts, StepStatus::Skipped);
                    }

                    Some(LanguageWork {
                        key,
                        lang,
                        steps,
                        dir,
                        text,
                        image_prompts,
                    })
                }
            },
        ))
        .buffer_unordered(concurrency)
        .collect()
        .await;

        results.into_iter().flatten().collect()
    }

    /// Stage 3a. One prompt at a time per language, all languages at once.
    async fn generate_images(
        &self,
        works: &[LanguageWork],
    ) -> HashMap<LanguageTaskKey, Vec<PathBuf>> {
        let futures = works.iter().map(|work| {
            let tracker = Arc::clone(&self.tracker);
            let cancel = self.cancel.clone();
            let pause = self.pause.clone();
            let backends = &self.providers.image_backends;
            let failures_before_switch = self.config.pipeline.image_failures_before_switch;
            async move {
                let key = work.key.clone();
                if !work.steps.generate_images || work.image_prompts.is_empty() {
                    tracker.set_step(&key, PipelineStep::GenerateImages, StepStatus::Skipped);
                    return (key, Vec::new());
                }
                let primary = match backends.get(&work.lang.image_engine) {
                    Some(backend) => Arc::clone(backend),
                    None => {
                        error!("{}: no image backend for {:?}", key, work.lang.image_engine);
                        tracker.set_step(&key, PipelineStep::GenerateImages, StepStatus::Failed);
                        return (key, Vec::new());
                    }
                };
                let fallback = backends
                    .iter()
                    .find(|(engine, _)| **engine != work.lang.image_engine)
                    .map(|(_, backend)| Arc::clone(backend));
                let generator = ImageGenerator::new(primary, fallback, failures_before_switch);

                tracker.set_step(&key, PipelineStep::GenerateImages, StepStatus::InProgress);
                tracker.set_total(&key, CounterKind::Images, work.image_prompts.len());
                let image_dir = work.dir.join("images");
                if let Err(e) = tokio::fs::create_dir_all(&image_dir).await {
                    error!("{}: cannot create image directory: {}", key, e);
                    tracker.set_step(&key, PipelineStep::GenerateImages, StepStatus::Failed);
                    return (key, Vec::new());
                }

                let mut images = Vec::new();
                for (index, prompt) in work.image_prompts.iter().enumerate() {
                    if cancel.is_cancelled() {
                        return (key, images);
                    }
                    pause.wait_if_paused(&cancel).await;
                    // Content-keyed name, so an already generated prompt is
                    // reused on a re-run.
                    let output = image_dir.join(format!("{}.png", content_key(prompt)));
                    if check_file_exists_and_valid(&output).await {
                        images.push(output);
                        tracker.increment(&key, CounterKind::Images);
                        continue;
                    }
                    match generator.generate_with_failover(prompt, &output, &cancel).await {
                        Ok(ImageOutcome::Generated(path)) => {
                            images.push(path);
                            tracker.increment(&key, CounterKind::Images);
                        }
                        Ok(ImageOutcome::Skipped) => {}
                        Err(AppError::Cancelled) => return (key, images),
                        Err(e) => warn!("{}: image prompt {} failed: {}", key, index, e),
                    }
                }
                tracker.set_step(&key, PipelineStep::GenerateImages, StepStatus::Done);
                (key, images)
            }
        });

        futures::future::join_all(futures).await.into_iter().collect()
    }

    /// Stage 3b. Audio synthesis and chunk transcription for every surviving
    /// language task, reconciling the pool's push-based result channels with
    /// the submitter's pull-based polling in one wait loop.
    async fn run_audio_pipeline(
        &self,
        works: &[LanguageWork],
    ) -> HashMap<LanguageTaskKey, Vec<SubtitleChunk>> {
        let pipeline = &self.config.pipeline;
        let (pool, mut audio_rx, mut trans_rx) = AudioWorkerPool::new(
            Arc::clone(&self.providers.transcriber),
            self.cancel.clone(),
            pipeline,
        );
        pool.start(pipeline.worker_count);

        let submitter = self
            .providers
            .async_tts
            .as_ref()
            .map(|backend| RateLimitedSubmitter::new(Arc::clone(backend), self.cancel.clone(), pipeline));
        let merger = ChunkGroupMerger::new(Arc::clone(&self.providers.concatenator));

        let parallelism = pipeline.chunk_parallelism.max(1);
        let mut states: HashMap<LanguageTaskKey, OwnerState> = HashMap::new();

        for work in works {
            let key = work.key.clone();
            let audio_dir = work.dir.join("audio");
            let subs_dir = work.dir.join("subs");
            if let Err(e) = tokio::fs::create_dir_all(&audio_dir).await {
                error!("{}: cannot create audio directory: {}", key, e);
                self.tracker.set_step(&key, PipelineStep::GenerateAudio, StepStatus::Failed);
                continue;
            }
            if let Err(e) = tokio::fs::create_dir_all(&subs_dir).await {
                error!("{}: cannot create subtitle directory: {}", key, e);
                self.tracker.set_step(&key, PipelineStep::GenerateAudio, StepStatus::Failed);
                continue;
            }

            if is_quota_constrained(work.lang.tts_engine) {
                let submitter = match submitter.as_ref() {
                    Some(s) => s,
                    None => {
                        error!("{}: quota backend selected but not configured", key);
                        self.tracker
                            .set_step(&key, PipelineStep::GenerateAudio, StepStatus::Failed);
                        continue;
                    }
                };
                let chunks = chunk_for_quota_backend(
                    &work.text,
                    pipeline.quota_chunk_char_limit,
                    parallelism,
                );
                let raw_total = chunks.len();
                // Expected transcription count is fixed here, before any
                // backend outcome is known.
                let expected = parallelism.min(raw_total);
                let items = chunks
                    .into_iter()
                    .enumerate()
                    .map(|(index, text)| ChunkItem {
                        owner: key.clone(),
                        chunk_index: index,
                        total_chunks: raw_total,
                        text: Some(text),
                        audio_path: None,
                        output_path: audio_dir.join(format!("raw_{}.mp3", index)),
                        voice: work.lang.voice.clone(),
                        merged: false,
                    })
                    .collect();
                let group_key = submitter.submit_group(items).await;

                self.tracker.set_step(&key, PipelineStep::GenerateAudio, StepStatus::InProgress);
                self.tracker.set_total(&key, CounterKind::Audio, raw_total);
                self.tracker.set_total(&key, CounterKind::Subs, expected);
                states.insert(
                    key,
                    OwnerState {
                        expected,
                        received: 0,
                        audio_failed: 0,
                        subs: Vec::new(),
                        subs_dir,
                        quota: Some(QuotaGroup {
                            group_key,
                            raw_total,
                            merge_dir: audio_dir.join("merged"),
                        }),
                    },
                );
            } else {
                let engine = match self.providers.sync_tts.get(&work.lang.tts_engine) {
                    Some(engine) => Arc::clone(engine),
                    None => {
                        error!("{}: no synthesis backend for {:?}", key, work.lang.tts_engine);
                        self.tracker
                            .set_step(&key, PipelineStep::GenerateAudio, StepStatus::Failed);
                        continue;
                    }
                };
                pool.bind_engine(key.clone(), engine);

                let chunks = chunk_balanced(&work.text, parallelism);
                let expected = chunks.len();
                self.tracker.set_step(&key, PipelineStep::GenerateAudio, StepStatus::InProgress);
                self.tracker.set_total(&key, CounterKind::Audio, expected);
                self.tracker.set_total(&key, CounterKind::Subs, expected);
                for (index, text) in chunks.into_iter().enumerate() {
                    let item = ChunkItem {
                        owner: key.clone(),
                        chunk_index: index,
                        total_chunks: expected,
                        text: Some(text),
                        audio_path: None,
                        output_path: audio_dir.join(format!("chunk_{}.mp3", index)),
                        voice: work.lang.voice.clone(),
                        merged: false,
                    };
                    if let Err(e) = pool.submit_audio(item) {
                        error!("{}: could not enqueue chunk {}: {}", key, index, e);
                    }
                }
                states.insert(
                    key,
                    OwnerState {
                        expected,
                        received: 0,
                        audio_failed: 0,
                        subs: Vec::new(),
                        subs_dir,
                        quota: None,
                    },
                );
            }
        }

        let poll_interval = Duration::from_secs(pipeline.poll_interval_secs);
        let mut last_poll: Option<Instant> = None;
        let quota_owners: Vec<LanguageTaskKey> = states
            .iter()
            .filter(|(_, state)| state.quota.is_some())
            .map(|(key, _)| key.clone())
            .collect();

        loop {
            if self.cancel.is_cancelled() {
                warn!("audio pipeline stopped by cancellation");
                break;
            }
            self.pause.wait_if_paused(&self.cancel).await;

            // Push side: synthesis results become transcription work.
            while let Ok(result) = audio_rx.try_recv() {
                let item = result.item;
                let Some(state) = states.get_mut(&item.owner) else { continue };
                if result.success {
                    self.tracker.increment(&item.owner, CounterKind::Audio);
                } else {
                    state.audio_failed += 1;
                }
                let trans_item = ChunkItem {
                    audio_path: if result.success { item.audio_path.clone() } else { None },
                    output_path: state.subs_dir.join(format!("chunk_{}.vtt", item.chunk_index)),
                    text: None,
                    ..item
                };
                if let Err(e) = pool.submit_transcription(trans_item) {
                    error!("could not enqueue transcription: {}", e);
                }
            }

            // Pull side: poll quota groups, merge once complete.
            if last_poll.is_none_or(|at| at.elapsed() >= poll_interval) {
                last_poll = Some(Instant::now());
                for owner in &quota_owners {
                    let Some(submitter) = submitter.as_ref() else { break };
                    let (group_key, raw_total, merge_dir) = {
                        let Some(state) = states.get(owner) else { continue };
                        match &state.quota {
                            Some(group) => {
                                (group.group_key, group.raw_total, group.merge_dir.clone())
                            }
                            None => continue,
                        }
                    };
                    match submitter.poll_group(group_key).await {
                        Ok(downloaded) => {
                            for _ in &downloaded {
                                self.tracker.increment(owner, CounterKind::Audio);
                            }
                        }
                        Err(e) => {
                            warn!("{}: poll failed: {}", owner, e);
                            continue;
                        }
                    }
                    if submitter.try_mark_processed(group_key, raw_total).await {
                        let raw = submitter.completed_items(group_key).await;
                        match merger.merge_groups(raw, parallelism, &merge_dir).await {
                            Ok(merged) => {
                                for mut item in merged {
                                    if let Some(state) = states.get(owner) {
                                        item.output_path = state
                                            .subs_dir
                                            .join(format!("chunk_{}.vtt", item.chunk_index));
                                    }
                                    if let Err(e) = pool.submit_transcription(item) {
                                        error!("could not enqueue merged group: {}", e);
                                    }
                                }
                            }
                            Err(e) => {
                                error!("{}: chunk-group merge failed: {}", owner, e);
                                if let Some(state) = states.get_mut(owner) {
                                    // Unblock the wait loop; the key is failed.
                                    state.audio_failed += raw_total;
                                    state.received = state.expected;
                                }
                            }
                        }
                    } else if let Ok(progress) = submitter.progress(group_key).await {
                        // Permanently failed submissions never download, so a
                        // group with any of them can never reach raw_total.
                        // Abandon it once every item is accounted for, or the
                        // wait loop would spin on this key forever.
                        if progress.failed > 0
                            && progress.completed + progress.failed >= raw_total
                        {
                            error!(
                                "{}: {} of {} quota submissions failed permanently",
                                owner, progress.failed, raw_total
                            );
                            if let Some(state) = states.get_mut(owner) {
                                state.audio_failed += progress.failed;
                                state.received = state.expected;
                                state.quota = None;
                            }
                        }
                    }
                }
            }

            // Transcription results close the loop.
            while let Ok(result) = trans_rx.try_recv() {
                let item = result.item;
                let Some(state) = states.get_mut(&item.owner) else { continue };
                state.received += 1;
                if result.success {
                    self.tracker.increment(&item.owner, CounterKind::Subs);
                }
                state.subs.push(SubtitleChunk {
                    subs_path: result.success.then(|| item.output_path.clone()),
                    audio_path: item.audio_path.clone(),
                    chunk_index: item.chunk_index,
                    merged: item.merged,
                });
            }

            if states.values().all(|state| state.received >= state.expected) {
                break;
            }
            tokio::time::sleep(Duration::from_millis(200)).await;
        }

        pool.stop().await;

        let mut subs_by_key = HashMap::new();
        for (key, state) in states {
            if self.cancel.is_cancelled() && state.received < state.expected {
                continue;
            }
            let audio_status = if state.audio_failed > 0 {
                StepStatus::Failed
            } else {
                StepStatus::Done
            };
            self.tracker.set_step(&key, PipelineStep::GenerateAudio, audio_status);
            let complete = state.received >= state.expected
                && state.subs.len() == state.expected
                && state.subs.iter().all(|s| s.subs_path.is_some() && s.audio_path.is_some());
            let trans_status = if complete { StepStatus::Done } else { StepStatus::Failed };
            self.tracker
                .set_step(&key, PipelineStep::TranscribeChunks, trans_status);
            if complete {
                subs_by_key.insert(key, state.subs);
            }
        }
        subs_by_key
    }

    async fn wait_for_review(&self) {
        info!("waiting for review confirmation");
        loop {
            if self.review_confirmed.load(Ordering::SeqCst) {
                return;
            }
            if self.cancel.is_cancelled() {
                warn!("review barrier released by cancellation");
                return;
            }
            tokio::select! {
                _ = self.review_notify.notified() => {}
                _ = tokio::time::sleep(Duration::from_millis(200)) => {}
            }
        }
    }

    /// Stage 5. Per language task: bounded parallel segment renders, then a
    /// single concatenation performed only when every segment succeeded.
    async fn assemble(
        &self,
        works: &[LanguageWork],
        images: &HashMap<LanguageTaskKey, Vec<PathBuf>>,
        subs: &HashMap<LanguageTaskKey, Vec<SubtitleChunk>>,
    ) -> HashMap<LanguageTaskKey, PathBuf> {
        let parallelism = self.config.pipeline.chunk_parallelism.max(1);
        let mut finals = HashMap::new();

        for work in works {
            if self.cancel.is_cancelled() {
                break;
            }
            self.pause.wait_if_paused(&self.cancel).await;

            let key = work.key.clone();
            let Some(chunks) = subs.get(&key) else { continue };
            let mut chunks = chunks.clone();
            chunks.sort_by_key(|chunk| chunk.chunk_index);

            self.tracker.set_step(&key, PipelineStep::RenderVideo, StepStatus::InProgress);
            let video_dir = work.dir.join("video");
            if let Err(e) = tokio::fs::create_dir_all(&video_dir).await {
                error!("{}: cannot create video directory: {}", key, e);
                self.tracker.set_step(&key, PipelineStep::RenderVideo, StepStatus::Failed);
                continue;
            }

            let language_images = images.get(&key).cloned().unwrap_or_default();
            let slice_sizes = partition_front_loaded(language_images.len(), chunks.len());
            let mut cursor = 0;
            let mut jobs = Vec::new();
            for (chunk, slice_size) in chunks.iter().zip(slice_sizes) {
                let slice = language_images[cursor..cursor + slice_size].to_vec();
                cursor += slice_size;
                // Completeness was checked when the subtitle set was built.
                let (Some(audio), Some(subtitles)) = (&chunk.audio_path, &chunk.subs_path) else {
                    continue;
                };
                jobs.push((
                    chunk.chunk_index,
                    slice,
                    audio.clone(),
                    subtitles.clone(),
                    video_dir.join(format!("segment_{}.mp4", chunk.chunk_index)),
                ));
            }

            let results: Vec<AppResult<(usize, PathBuf)>> =
                stream::iter(jobs.into_iter().map(|(index, slice, audio, subtitles, output)| {
                    let renderer = Arc::clone(&self.providers.renderer);
                    let tracker = Arc::clone(&self.tracker);
                    let cancel = self.cancel.clone();
                    let key = key.clone();
                    async move {
                        if cancel.is_cancelled() {
                            return Err(AppError::Cancelled);
                        }
                        let (tx, mut rx) = mpsc::channel::<f32>(16);
                        let forwarder = {
                            let tracker = Arc::clone(&tracker);
                            let key = key.clone();
                            tokio::spawn(async move {
                                while let Some(fraction) = rx.recv().await {
                                    tracker.set_render_progress(&key, index, fraction);
                                }
                            })
                        };
                        let rendered = renderer
                            .render_segment(&slice, &audio, &subtitles, &output, Some(tx))
                            .await;
                        let _ = forwarder.await;
                        rendered.map(|path| (index, path))
                    }
                }))
                .buffer_unordered(parallelism)
                .collect()
                .await;

            let mut segments = Vec::with_capacity(results.len());
            let mut failed = false;
            for result in results {
                match result {
                    Ok(segment) => segments.push(segment),
                    Err(e) => {
                        error!("{}: segment render failed: {}", key, e);
                        failed = true;
                    }
                }
            }
            if failed || segments.len() != chunks.len() {
                // No partial video is ever exposed.
                self.tracker.set_step(&key, PipelineStep::RenderVideo, StepStatus::Failed);
                continue;
            }

            segments.sort_by_key(|(index, _)| *index);
            let inputs: Vec<PathBuf> = segments.into_iter().map(|(_, path)| path).collect();
            let final_path = work.dir.join("final.mp4");
            match self.providers.concatenator.concatenate(&inputs, &final_path).await {
                Ok(path) => {
                    info!("{}: final video at {}", key, path.display());
                    self.tracker.set_step(&key, PipelineStep::RenderVideo, StepStatus::Done);
                    finals.insert(key, path);
                }
                Err(e) => {
                    error!("{}: concatenation failed: {}", key, e);
                    self.tracker.set_step(&key, PipelineStep::RenderVideo, StepStatus::Failed);
                }
            }
        }
        finals
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::PipelineConfig;
    use crate::services::transcription::TranscriptSegment;
    use async_trait::async_trait;
    use std::path::Path;
    use std::sync::Mutex;
    use std::sync::atomic::AtomicUsize;

    struct StubTranslator;

    #[async_trait]
    impl TranslationProvider for StubTranslator {
        async fn transform(
            &self,
            text: &str,
            target_language: &str,
            _mode: TransformMode,
        ) -> AppResult<String> {
            Ok(format!("[{}] {}", target_language, text))
        }

        async fn auxiliary(&self, _primary: &str, _language: &str, kind: AuxKind) -> AppResult<String> {
            Ok(match kind {
                AuxKind::CallToAction => "Subscribe now.".to_string(),
                AuxKind::ImagePrompts => "a red door\na green hill".to_string(),
            })
        }
    }

    struct StubTts;

    #[async_trait]
    impl TtsService for StubTts {
        async fn synthesize(&self, text: &str, _voice: &str, output: &Path) -> AppResult<()> {
            tokio::fs::write(output, text.as_bytes()).await?;
            Ok(())
        }
    }

    #[derive(Default)]
    struct StubAsyncTts {
        tasks: Mutex<HashMap<String, String>>,
        counter: AtomicUsize,
    }

    #[async_trait]
    impl AsyncTtsService for StubAsyncTts {
        async fn create_task(&self, text: &str, _voice: &str) -> AppResult<String> {
            let id = format!("task-{}", self.counter.fetch_add(1, Ordering::SeqCst));
            self.tasks.lock().unwrap().insert(id.clone(), text.to_string());
            Ok(id)
        }

        async fn ready_tasks(&self) -> AppResult<Vec<String>> {
            Ok(self.tasks.lock().unwrap().keys().cloned().collect())
        }

        async fn download(&self, task_id: &str, dest: &Path) -> AppResult<()> {
            let text = self
                .tasks
                .lock()
                .unwrap()
                .get(task_id)
                .cloned()
                .ok_or_else(|| AppError::PipelineError("unknown task".to_string()))?;
            tokio::fs::write(dest, text.as_bytes()).await?;
            Ok(())
        }
    }

    /// Async backend whose create call always fails permanently.
    struct FatalAsyncTts;

    #[async_trait]
    impl AsyncTtsService for FatalAsyncTts {
        async fn create_task(&self, _text: &str, _voice: &str) -> AppResult<String> {
            Err(crate::errors::BackendError::fatal("voice rejected").into())
        }

        async fn ready_tasks(&self) -> AppResult<Vec<String>> {
            Ok(Vec::new())
        }

        async fn download(&self, _task_id: &str, _dest: &Path) -> AppResult<()> {
            Err(crate::errors::BackendError::fatal("nothing to download").into())
        }
    }

    struct StubTranscriber;

    #[async_trait]
    impl TranscriptionProvider for StubTranscriber {
        async fn transcribe(&self, _audio_path: &Path) -> AppResult<Vec<TranscriptSegment>> {
            Ok(vec![TranscriptSegment {
                start: 0.0,
                end: 1.0,
                text: "spoken line".to_string(),
            }])
        }
    }

    struct StubImage;

    #[async_trait]
    impl ImageProvider for StubImage {
        async fn generate(&self, _prompt: &str, output: &Path) -> AppResult<()> {
            tokio::fs::write(output, b"img").await?;
            Ok(())
        }
    }

    /// Renders a marker file; fails for outputs whose path contains
    /// `fail_marker`.
    struct StubRenderer {
        fail_marker: Option<&'static str>,
    }

    #[async_trait]
    impl VideoRenderer for StubRenderer {
        async fn render_segment(
            &self,
            _images: &[PathBuf],
            _audio: &Path,
            _subtitles: &Path,
            output: &Path,
            progress: Option<mpsc::Sender<f32>>,
        ) -> AppResult<PathBuf> {
            if let Some(marker) = self.fail_marker {
                if output.to_string_lossy().contains(marker) {
                    return Err(AppError::MediaToolError("render exploded".to_string()));
                }
            }
            tokio::fs::write(output, b"segment").await?;
            if let Some(tx) = progress {
                let _ = tx.send(1.0).await;
            }
            Ok(output.to_path_buf())
        }
    }

    struct ByteConcat;

    #[async_trait]
    impl Concatenator for ByteConcat {
        async fn concatenate(&self, inputs: &[PathBuf], output: &Path) -> AppResult<PathBuf> {
            let mut joined = Vec::new();
            for input in inputs {
                joined.extend(tokio::fs::read(input).await?);
            }
            tokio::fs::write(output, joined).await?;
            Ok(output.to_path_buf())
        }
    }

    fn providers(fail_marker: Option<&'static str>) -> ProviderSet {
        let mut sync_tts: HashMap<TtsEngine, Arc<dyn TtsService>> = HashMap::new();
        sync_tts.insert(TtsEngine::OpenAi, Arc::new(StubTts));
        let mut image_backends: HashMap<ImageEngine, Arc<dyn ImageProvider>> = HashMap::new();
        image_backends.insert(ImageEngine::Dalle, Arc::new(StubImage));
        image_backends.insert(ImageEngine::Stability, Arc::new(StubImage));
        ProviderSet {
            translator: Arc::new(StubTranslator),
            sync_tts,
            async_tts: Some(Arc::new(StubAsyncTts::default())),
            transcriber: Arc::new(StubTranscriber),
            image_backends,
            renderer: Arc::new(StubRenderer { fail_marker }),
            concatenator: Arc::new(ByteConcat),
        }
    }

    fn config(workspace: &Path) -> AppConfig {
        AppConfig {
            workspace_dir: workspace.to_path_buf(),
            pipeline: PipelineConfig {
                worker_count: 2,
                chunk_parallelism: 3,
                chunk_char_limit: 4000,
                quota_chunk_char_limit: 60,
                submit_spacing_secs: 0,
                poll_interval_secs: 0,
                shutdown_timeout_secs: 5,
                retry_attempts: 2,
                retry_delay_secs: 0,
                image_failures_before_switch: 2,
            },
            ..AppConfig::default()
        }
    }

    fn language(code: &str, engine: TtsEngine) -> LanguageSpec {
        LanguageSpec {
            code: code.to_string(),
            voice: "alloy".to_string(),
            tts_engine: engine,
            image_engine: ImageEngine::Dalle,
            variant: false,
        }
    }

    fn six_sentences() -> String {
        (1..=6)
            .map(|n| format!("This is sentence number {}.", n))
            .collect::<Vec<_>>()
            .join(" ")
    }

    #[tokio::test]
    async fn test_text_task_end_to_end() {
        let dir = tempfile::tempdir().unwrap();
        let manager = WorkflowManager::new(config(dir.path()), providers(None));
        let task = Task {
            task_index: 0,
            source: TaskSource::Text(six_sentences()),
            target_languages: vec![language("es", TtsEngine::OpenAi)],
            steps: StepToggles::default(),
        };

        let report = manager.run(vec![task]).await.unwrap();
        assert!(!report.cancelled);
        assert_eq!(report.languages.len(), 1);
        let lang = &report.languages[0];
        assert_eq!(lang.failed_step, None);
        let final_video = lang.final_video.as_ref().unwrap();
        assert!(final_video.exists());

        let key = LanguageTaskKey::new(0, "es", false);
        let snapshot = manager.tracker().snapshot(&key).unwrap();
        assert_eq!(snapshot.audio_generated, 3);
        assert_eq!(snapshot.subs_generated, 3);
        assert_eq!(
            snapshot.steps.get(&PipelineStep::RenderVideo),
            Some(&StepStatus::Done)
        );
        // Three segments of "segment" bytes.
        let joined = tokio::fs::read(final_video).await.unwrap();
        assert_eq!(joined, b"segmentsegmentsegment");
    }

    #[tokio::test]
    async fn test_render_failure_leaves_sibling_language_unaffected() {
        let dir = tempfile::tempdir().unwrap();
        let manager = WorkflowManager::new(config(dir.path()), providers(Some("/fr/")));
        let task = Task {
            task_index: 0,
            source: TaskSource::Text(six_sentences()),
            target_languages: vec![
                language("es", TtsEngine::OpenAi),
                language("fr", TtsEngine::OpenAi),
            ],
            steps: StepToggles::default(),
        };

        let report = manager.run(vec![task]).await.unwrap();
        let by_code: HashMap<&str, &LanguageReport> = report
            .languages
            .iter()
            .map(|l| (l.key.language_code.as_str(), l))
            .collect();

        let es = by_code["es"];
        assert!(es.final_video.as_ref().unwrap().exists());
        assert_eq!(es.failed_step, None);

        let fr = by_code["fr"];
        assert_eq!(fr.final_video, None);
        assert_eq!(fr.failed_step, Some(PipelineStep::RenderVideo));
        assert!(!dir.path().join("task0").join("fr").join("final.mp4").exists());
    }

    #[tokio::test]
    async fn test_quota_backend_end_to_end() {
        let dir = tempfile::tempdir().unwrap();
        let manager = WorkflowManager::new(config(dir.path()), providers(None));
        let text = (1..=12)
            .map(|n| format!("Quota sentence number {} here.", n))
            .collect::<Vec<_>>()
            .join(" ");
        let task = Task {
            task_index: 0,
            source: TaskSource::Text(text),
            target_languages: vec![language("de", TtsEngine::Replica)],
            steps: StepToggles::default(),
        };

        let report = manager.run(vec![task]).await.unwrap();
        let lang = &report.languages[0];
        assert_eq!(lang.failed_step, None);
        assert!(lang.final_video.as_ref().unwrap().exists());

        let key = LanguageTaskKey::new(0, "de", false);
        let snapshot = manager.tracker().snapshot(&key).unwrap();
        // Raw chunks exceed the parallelism, so transcription ran on the
        // merged groups only.
        assert!(snapshot.audio_total > 3);
        assert_eq!(snapshot.subs_total, 3);
        assert_eq!(snapshot.subs_generated, 3);
    }

    #[tokio::test]
    async fn test_fatal_quota_submissions_do_not_stall_sibling() {
        let dir = tempfile::tempdir().unwrap();
        let mut providers = providers(None);
        providers.async_tts = Some(Arc::new(FatalAsyncTts));
        let manager = WorkflowManager::new(config(dir.path()), providers);
        let task = Task {
            task_index: 0,
            source: TaskSource::Text(six_sentences()),
            target_languages: vec![
                language("es", TtsEngine::OpenAi),
                language("de", TtsEngine::Replica),
            ],
            steps: StepToggles::default(),
        };

        // Every quota submission fails at creation, so nothing for "de" can
        // ever download; the run must still finish and deliver "es".
        let report = tokio::time::timeout(Duration::from_secs(10), manager.run(vec![task]))
            .await
            .expect("run stalled on the failed quota group")
            .unwrap();
        assert!(!report.cancelled);
        let by_code: HashMap<&str, &LanguageReport> = report
            .languages
            .iter()
            .map(|l| (l.key.language_code.as_str(), l))
            .collect();

        let es = by_code["es"];
        assert_eq!(es.failed_step, None);
        assert!(es.final_video.as_ref().unwrap().exists());

        let de = by_code["de"];
        assert_eq!(de.failed_step, Some(PipelineStep::GenerateAudio));
        assert_eq!(de.final_video, None);
    }

    #[tokio::test]
    async fn test_cancelled_before_start_reports_cancelled() {
        let dir = tempfile::tempdir().unwrap();
        let manager = WorkflowManager::new(config(dir.path()), providers(None));
        manager.cancel();
        let task = Task {
            task_index: 0,
            source: TaskSource::Text(six_sentences()),
            target_languages: vec![language("es", TtsEngine::OpenAi)],
            steps: StepToggles::default(),
        };

        let report = manager.run(vec![task]).await.unwrap();
        assert!(report.cancelled);
        assert_eq!(report.languages[0].final_video, None);
    }

    #[tokio::test]
    async fn test_review_barrier_blocks_until_confirmed() {
        let dir = tempfile::tempdir().unwrap();
        let mut config = config(dir.path());
        config.review_required = true;
        let manager = Arc::new(WorkflowManager::new(config, providers(None)));
        let task = Task {
            task_index: 0,
            source: TaskSource::Text(six_sentences()),
            target_languages: vec![language("es", TtsEngine::OpenAi)],
            steps: StepToggles::default(),
        };

        let confirmer = {
            let manager = Arc::clone(&manager);
            tokio::spawn(async move {
                tokio::time::sleep(Duration::from_millis(150)).await;
                manager.confirm_review();
            })
        };
        let report = manager.run(vec![task]).await.unwrap();
        confirmer.await.unwrap();
        assert!(report.languages[0].final_video.as_ref().unwrap().exists());
    }

    #[tokio::test]
    async fn test_images_generated_and_sliced_into_final() {
        let dir = tempfile::tempdir().unwrap();
        let manager = WorkflowManager::new(config(dir.path()), providers(None));
        let task = Task {
            task_index: 0,
            source: TaskSource::Text(six_sentences()),
            target_languages: vec![language("es", TtsEngine::OpenAi)],
            steps: StepToggles {
                rewrite: false,
                call_to_action: true,
                image_prompts: true,
                generate_images: true,
            },
        };

        let report = manager.run(vec![task]).await.unwrap();
        assert!(report.languages[0].final_video.is_some());

        let key = LanguageTaskKey::new(0, "es", false);
        let snapshot = manager.tracker().snapshot(&key).unwrap();
        // Two prompts from the stub translator, both rendered to disk.
        assert_eq!(snapshot.images_generated, 2);
        assert!(dir
            .path()
            .join("task0")
            .join("es")
            .join("call_to_action.txt")
            .exists());
    }
}
