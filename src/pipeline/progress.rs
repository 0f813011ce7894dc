//! Per-task / per-language / per-step progress tracking.
//!
//! `TaskStatus` is the only structure mutated from multiple threads
//! concurrently: workers increment counters while the reporting layer reads
//! snapshots. Counters are atomics; step statuses sit behind an `RwLock`.
//! Everything is exposed through a narrow increment/read API.

use crate::models::{LanguageTaskKey, PipelineStep, StepStatus};
use log::debug;
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Mutex, RwLock};

/// Which numeric counter to touch.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CounterKind {
    Images,
    Audio,
    Subs,
}

#[derive(Debug, Default)]
struct Counter {
    generated: AtomicUsize,
    total: AtomicUsize,
}

impl Counter {
    fn snapshot(&self) -> (usize, usize) {
        (
            self.generated.load(Ordering::SeqCst),
            self.total.load(Ordering::SeqCst),
        )
    }
}

/// Mutable status record for one language task.
#[derive(Debug, Default)]
pub struct TaskStatus {
    steps: RwLock<HashMap<PipelineStep, StepStatus>>,
    images: Counter,
    audio: Counter,
    subs: Counter,
    /// Fractional render progress per chunk index, 0.0..=1.0.
    render_progress: Mutex<HashMap<usize, f32>>,
}

impl TaskStatus {
    fn counter(&self, kind: CounterKind) -> &Counter {
        match kind {
            CounterKind::Images => &self.images,
            CounterKind::Audio => &self.audio,
            CounterKind::Subs => &self.subs,
        }
    }
}

/// Read-only copy of a `TaskStatus`, safe to hand to a UI layer.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct TaskStatusSnapshot {
    pub steps: HashMap<PipelineStep, StepStatus>,
    pub images_generated: usize,
    pub images_total: usize,
    pub audio_generated: usize,
    pub audio_total: usize,
    pub subs_generated: usize,
    pub subs_total: usize,
    /// Mean fractional progress across chunk renders, 0.0..=1.0.
    pub render_progress: f32,
}

/// Tracker for all language tasks in one run.
#[derive(Default)]
pub struct ProgressTracker {
    tasks: RwLock<HashMap<LanguageTaskKey, Arc<TaskStatus>>>,
}

impl ProgressTracker {
    pub fn new() -> Self {
        Self::default()
    }

    /// Create the status record for a key. Called when the key's text phase
    /// starts; re-registering an existing key is a no-op.
    pub fn register(&self, key: &LanguageTaskKey) {
        let mut tasks = self.tasks.write().unwrap();
        tasks.entry(key.clone()).or_default();
    }

    fn status(&self, key: &LanguageTaskKey) -> Option<Arc<TaskStatus>> {
        self.tasks.read().unwrap().get(key).cloned()
    }

    pub fn set_step(&self, key: &LanguageTaskKey, step: PipelineStep, status: StepStatus) {
        if let Some(task) = self.status(key) {
            debug!("{}: {} -> {:?}", key, step.as_str(), status);
            task.steps.write().unwrap().insert(step, status);
        }
    }

    pub fn step_status(&self, key: &LanguageTaskKey, step: PipelineStep) -> StepStatus {
        self.status(key)
            .and_then(|task| task.steps.read().unwrap().get(&step).copied())
            .unwrap_or(StepStatus::Pending)
    }

    pub fn set_total(&self, key: &LanguageTaskKey, kind: CounterKind, total: usize) {
        if let Some(task) = self.status(key) {
            task.counter(kind).total.store(total, Ordering::SeqCst);
        }
    }

    pub fn increment(&self, key: &LanguageTaskKey, kind: CounterKind) {
        if let Some(task) = self.status(key) {
            task.counter(kind).generated.fetch_add(1, Ordering::SeqCst);
        }
    }

    pub fn set_render_progress(&self, key: &LanguageTaskKey, chunk_index: usize, fraction: f32) {
        if let Some(task) = self.status(key) {
            task.render_progress
                .lock()
                .unwrap()
                .insert(chunk_index, fraction.clamp(0.0, 1.0));
        }
    }

    pub fn snapshot(&self, key: &LanguageTaskKey) -> Option<TaskStatusSnapshot> {
        let task = self.status(key)?;
        let steps = task.steps.read().unwrap().clone();
        let (images_generated, images_total) = task.images.snapshot();
        let (audio_generated, audio_total) = task.audio.snapshot();
        let (subs_generated, subs_total) = task.subs.snapshot();
        let render = task.render_progress.lock().unwrap();
        let render_progress = if render.is_empty() {
            0.0
        } else {
            render.values().sum::<f32>() / render.len() as f32
        };
        Some(TaskStatusSnapshot {
            steps,
            images_generated,
            images_total,
            audio_generated,
            audio_total,
            subs_generated,
            subs_total,
            render_progress,
        })
    }

    pub fn snapshot_all(&self) -> Vec<(LanguageTaskKey, TaskStatusSnapshot)> {
        let keys: Vec<LanguageTaskKey> = self.tasks.read().unwrap().keys().cloned().collect();
        keys.into_iter()
            .filter_map(|key| self.snapshot(&key).map(|snap| (key, snap)))
            .collect()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn key() -> LanguageTaskKey {
        LanguageTaskKey::new(0, "es", false)
    }

    #[test]
    fn test_register_and_steps() {
        let tracker = ProgressTracker::new();
        let key = key();
        assert_eq!(
            tracker.step_status(&key, PipelineStep::TransformText),
            StepStatus::Pending
        );
        tracker.register(&key);
        tracker.set_step(&key, PipelineStep::TransformText, StepStatus::InProgress);
        assert_eq!(
            tracker.step_status(&key, PipelineStep::TransformText),
            StepStatus::InProgress
        );
        tracker.set_step(&key, PipelineStep::TransformText, StepStatus::Done);
        assert_eq!(
            tracker.step_status(&key, PipelineStep::TransformText),
            StepStatus::Done
        );
    }

    #[test]
    fn test_counters_from_many_threads() {
        let tracker = Arc::new(ProgressTracker::new());
        let key = key();
        tracker.register(&key);
        tracker.set_total(&key, CounterKind::Audio, 40);

        let mut handles = Vec::new();
        for _ in 0..4 {
            let tracker = tracker.clone();
            let key = key.clone();
            handles.push(std::thread::spawn(move || {
                for _ in 0..10 {
                    tracker.increment(&key, CounterKind::Audio);
                }
            }));
        }
        for handle in handles {
            handle.join().unwrap();
        }

        let snap = tracker.snapshot(&key).unwrap();
        assert_eq!(snap.audio_generated, 40);
        assert_eq!(snap.audio_total, 40);
    }

    #[test]
    fn test_render_progress_mean() {
        let tracker = ProgressTracker::new();
        let key = key();
        tracker.register(&key);
        tracker.set_render_progress(&key, 0, 1.0);
        tracker.set_render_progress(&key, 1, 0.5);
        let snap = tracker.snapshot(&key).unwrap();
        assert!((snap.render_progress - 0.75).abs() < 1e-6);
    }

    #[test]
    fn test_snapshot_unknown_key() {
        let tracker = ProgressTracker::new();
        assert!(tracker.snapshot(&key()).is_none());
    }
}
