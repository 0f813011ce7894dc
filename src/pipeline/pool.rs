//! Bounded pool of synthesis workers plus one transcription worker.
//!
//! Workers consume FIFO queues and publish `WorkerResult`s to result
//! channels, exactly once per submitted item. A failed backend call never
//! crashes a worker; it publishes `success = false` and moves on.

use crate::config::PipelineConfig;
use crate::errors::AppResult;
use crate::models::{ChunkItem, LanguageTaskKey, WorkerResult};
use crate::pipeline::control::CancelFlag;
use crate::services::transcription::{TranscriptionProvider, write_vtt};
use crate::services::tts::TtsService;
use crate::utils::retry::retry_bounded;
use log::{debug, error, info, warn};
use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex, RwLock};
use std::time::Duration;
use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tokio::time::timeout;

/// One entry in a worker queue. The shutdown sentinel makes a worker exit
/// without acknowledging further work.
pub enum WorkItem {
    Chunk(ChunkItem),
    Shutdown,
}

type SharedQueue = Arc<tokio::sync::Mutex<mpsc::UnboundedReceiver<WorkItem>>>;

pub struct AudioWorkerPool {
    audio_tx: mpsc::UnboundedSender<WorkItem>,
    audio_rx: SharedQueue,
    trans_tx: mpsc::UnboundedSender<WorkItem>,
    trans_rx: SharedQueue,
    audio_results_tx: mpsc::UnboundedSender<WorkerResult>,
    trans_results_tx: mpsc::UnboundedSender<WorkerResult>,
    engines: Arc<RwLock<HashMap<LanguageTaskKey, Arc<dyn TtsService>>>>,
    transcriber: Arc<dyn TranscriptionProvider>,
    cancel: CancelFlag,
    started: AtomicBool,
    worker_count: Mutex<usize>,
    handles: Mutex<Vec<JoinHandle<()>>>,
    retry_attempts: usize,
    retry_delay: Duration,
    shutdown_timeout: Duration,
}

impl AudioWorkerPool {
    /// Build a pool. Returns the pool plus the audio and transcription
    /// result channels, which the orchestrator drains from its outer wait
    /// loop.
    pub fn new(
        transcriber: Arc<dyn TranscriptionProvider>,
        cancel: CancelFlag,
        config: &PipelineConfig,
    ) -> (
        Arc<Self>,
        mpsc::UnboundedReceiver<WorkerResult>,
        mpsc::UnboundedReceiver<WorkerResult>,
    ) {
        let (audio_tx, audio_rx) = mpsc::unbounded_channel();
        let (trans_tx, trans_rx) = mpsc::unbounded_channel();
        let (audio_results_tx, audio_results_rx) = mpsc::unbounded_channel();
        let (trans_results_tx, trans_results_rx) = mpsc::unbounded_channel();

        let pool = Arc::new(Self {
            audio_tx,
            audio_rx: Arc::new(tokio::sync::Mutex::new(audio_rx)),
            trans_tx,
            trans_rx: Arc::new(tokio::sync::Mutex::new(trans_rx)),
            audio_results_tx,
            trans_results_tx,
            engines: Arc::new(RwLock::new(HashMap::new())),
            transcriber,
            cancel,
            started: AtomicBool::new(false),
            worker_count: Mutex::new(0),
            handles: Mutex::new(Vec::new()),
            retry_attempts: config.retry_attempts,
            retry_delay: Duration::from_secs(config.retry_delay_secs),
            shutdown_timeout: Duration::from_secs(config.shutdown_timeout_secs),
        });

        (pool, audio_results_rx, trans_results_rx)
    }

    /// Bind the synthesis engine for one language task. Done once at task
    /// construction; workers look the engine up by the item's owner key.
    pub fn bind_engine(&self, key: LanguageTaskKey, engine: Arc<dyn TtsService>) {
        self.engines.write().unwrap().insert(key, engine);
    }

    /// Launch `worker_count` synthesis workers and exactly one transcription
    /// worker. No-op if the pool is already running.
    pub fn start(self: &Arc<Self>, worker_count: usize) {
        if self.started.swap(true, Ordering::SeqCst) {
            debug!("worker pool already running");
            return;
        }
        let worker_count = worker_count.max(1);
        *self.worker_count.lock().unwrap() = worker_count;

        let mut handles = self.handles.lock().unwrap();
        for worker_id in 0..worker_count {
            let pool = Arc::clone(self);
            handles.push(tokio::spawn(async move {
                pool.audio_worker_loop(worker_id).await;
            }));
        }
        let pool = Arc::clone(self);
        handles.push(tokio::spawn(async move {
            pool.transcription_worker_loop().await;
        }));
        info!("worker pool started with {} synthesis workers", worker_count);
    }

    /// Enqueue a chunk for synthesis; non-blocking.
    pub fn submit_audio(&self, item: ChunkItem) -> AppResult<()> {
        self.audio_tx
            .send(WorkItem::Chunk(item))
            .map_err(|_| "audio queue closed".into())
    }

    /// Enqueue a chunk for transcription; non-blocking.
    pub fn submit_transcription(&self, item: ChunkItem) -> AppResult<()> {
        self.trans_tx
            .send(WorkItem::Chunk(item))
            .map_err(|_| "transcription queue closed".into())
    }

    /// Send one shutdown sentinel per worker into each queue, then wait
    /// (bounded) for all workers to exit. Safe to call once processing is
    /// drained.
    pub async fn stop(&self) {
        let worker_count = *self.worker_count.lock().unwrap();
        for _ in 0..worker_count {
            let _ = self.audio_tx.send(WorkItem::Shutdown);
        }
        let _ = self.trans_tx.send(WorkItem::Shutdown);

        let handles: Vec<JoinHandle<()>> = std::mem::take(&mut *self.handles.lock().unwrap());
        for handle in handles {
            if timeout(self.shutdown_timeout, handle).await.is_err() {
                warn!("worker did not exit within shutdown timeout");
            }
        }
        info!("worker pool stopped");
    }

    async fn audio_worker_loop(&self, worker_id: usize) {
        debug!("synthesis worker {} started", worker_id);
        loop {
            let next = {
                let mut rx = self.audio_rx.lock().await;
                rx.recv().await
            };
            let mut item = match next {
                None | Some(WorkItem::Shutdown) => break,
                Some(WorkItem::Chunk(item)) => item,
            };

            // Cancellation is observed before starting a unit, never mid-unit.
            if self.cancel.is_cancelled() {
                let _ = self.audio_results_tx.send(WorkerResult { success: false, item });
                continue;
            }

            let engine = self.engines.read().unwrap().get(&item.owner).cloned();
            let success = match engine {
                None => {
                    error!(
                        "synthesis worker {}: no engine bound for {}",
                        worker_id, item.owner
                    );
                    false
                }
                Some(engine) => {
                    let text = item.text.clone().unwrap_or_default();
                    let voice = item.voice.clone();
                    let output = item.output_path.clone();
                    let result = retry_bounded(
                        "synthesize",
                        self.retry_attempts,
                        self.retry_delay,
                        &self.cancel,
                        move || {
                            let engine = engine.clone();
                            let text = text.clone();
                            let voice = voice.clone();
                            let output = output.clone();
                            async move { engine.synthesize(&text, &voice, &output).await }
                        },
                    )
                    .await;
                    match result {
                        Ok(()) => {
                            item.audio_path = Some(item.output_path.clone());
                            debug!(
                                "synthesis worker {}: {} chunk {}/{} done",
                                worker_id,
                                item.owner,
                                item.chunk_index + 1,
                                item.total_chunks
                            );
                            true
                        }
                        Err(e) => {
                            error!(
                                "synthesis worker {}: {} chunk {} failed: {}",
                                worker_id, item.owner, item.chunk_index, e
                            );
                            false
                        }
                    }
                }
            };
            let _ = self.audio_results_tx.send(WorkerResult { success, item });
        }
        debug!("synthesis worker {} exited", worker_id);
    }

    async fn transcription_worker_loop(&self) {
        debug!("transcription worker started");
        loop {
            let next = {
                let mut rx = self.trans_rx.lock().await;
                rx.recv().await
            };
            let item = match next {
                None | Some(WorkItem::Shutdown) => break,
                Some(WorkItem::Chunk(item)) => item,
            };

            if self.cancel.is_cancelled() {
                let _ = self.trans_results_tx.send(WorkerResult { success: false, item });
                continue;
            }

            // A missing audio path means upstream synthesis failed; publish
            // the accounting entry immediately.
            let audio_path = match &item.audio_path {
                Some(path) => path.clone(),
                None => {
                    debug!(
                        "transcription worker: null audio for {} chunk {}",
                        item.owner, item.chunk_index
                    );
                    let _ = self.trans_results_tx.send(WorkerResult { success: false, item });
                    continue;
                }
            };

            let transcriber = self.transcriber.clone();
            let result = retry_bounded(
                "transcribe",
                self.retry_attempts,
                self.retry_delay,
                &self.cancel,
                move || {
                    let transcriber = transcriber.clone();
                    let audio_path = audio_path.clone();
                    async move { transcriber.transcribe(&audio_path).await }
                },
            )
            .await;

            let success = match result {
                Ok(segments) => match write_vtt(&segments, &item.output_path).await {
                    Ok(()) => true,
                    Err(e) => {
                        error!(
                            "transcription worker: failed to write subtitles for {} chunk {}: {}",
                            item.owner, item.chunk_index, e
                        );
                        false
                    }
                },
                Err(e) => {
                    error!(
                        "transcription worker: {} chunk {} failed: {}",
                        item.owner, item.chunk_index, e
                    );
                    false
                }
            };
            let _ = self.trans_results_tx.send(WorkerResult { success, item });
        }
        debug!("transcription worker exited");
    }
}
