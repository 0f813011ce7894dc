//! Rate-limited submit-then-poll management for the quota-constrained
//! speech backend.
//!
//! The backend forbids concurrent submission bursts, so one background loop
//! submits a group's items in strict index order with enforced spacing. It
//! never pushes into the synchronous pool's channels; the orchestrator polls
//! it from the outer wait loop instead.

use crate::config::PipelineConfig;
use crate::errors::{AppError, AppResult};
use crate::models::ChunkItem;
use crate::pipeline::control::CancelFlag;
use crate::services::tts::AsyncTtsService;
use crate::utils::retry::retry_until_cancelled;
use log::{debug, error, info, warn};
use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::Mutex;
use uuid::Uuid;

/// Submission bookkeeping for one owner key.
#[derive(Default)]
struct SubmissionGroup {
    /// backend task id → (chunk index, item), for items not yet downloaded.
    submitted: HashMap<String, (usize, ChunkItem)>,
    /// Items downloaded so far, in completion order; consumers re-sort by
    /// chunk index before combining.
    completed: Vec<ChunkItem>,
    /// Count of items handed to the submission loop.
    expected: usize,
    /// Count of create calls that have succeeded so far.
    submitted_count: usize,
    /// Count of create calls that failed permanently (fatal, not retried).
    /// These items will never appear in `completed`; consumers add this to
    /// the completed count when deciding whether the group can still grow.
    failed: usize,
    /// Guards the merge step: transitions false→true exactly once.
    processed: bool,
}

/// Snapshot of a group's progress.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct GroupProgress {
    pub submitted: usize,
    pub completed: usize,
    pub ready: usize,
    pub pending: usize,
    /// Items whose create call failed permanently; they never complete.
    pub failed: usize,
}

pub struct RateLimitedSubmitter {
    backend: Arc<dyn AsyncTtsService>,
    groups: Arc<Mutex<HashMap<Uuid, SubmissionGroup>>>,
    cancel: CancelFlag,
    spacing: Duration,
    retry_interval: Duration,
}

impl RateLimitedSubmitter {
    pub fn new(
        backend: Arc<dyn AsyncTtsService>,
        cancel: CancelFlag,
        config: &PipelineConfig,
    ) -> Self {
        Self {
            backend,
            groups: Arc::new(Mutex::new(HashMap::new())),
            cancel,
            spacing: Duration::from_secs(config.submit_spacing_secs),
            retry_interval: Duration::from_secs(config.retry_delay_secs.max(1)),
        }
    }

    /// Start submitting a group of items in strict index order with enforced
    /// spacing between create calls. Returns immediately; submission runs in
    /// a background task.
    pub async fn submit_group(&self, mut items: Vec<ChunkItem>) -> Uuid {
        items.sort_by_key(|item| item.chunk_index);
        let group_key = Uuid::new_v4();
        {
            let mut groups = self.groups.lock().await;
            groups.insert(
                group_key,
                SubmissionGroup {
                    expected: items.len(),
                    ..SubmissionGroup::default()
                },
            );
        }

        let backend = self.backend.clone();
        let groups = self.groups.clone();
        let cancel = self.cancel.clone();
        let spacing = self.spacing;
        let retry_interval = self.retry_interval;
        let total = items.len();

        tokio::spawn(async move {
            info!("submitting group {} ({} items)", group_key, total);
            for (position, item) in items.into_iter().enumerate() {
                if cancel.is_cancelled() {
                    warn!("group {} submission stopped by cancellation", group_key);
                    break;
                }
                let text = item.text.clone().unwrap_or_default();
                let voice = item.voice.clone();
                let backend_ref = backend.clone();
                let created = retry_until_cancelled(
                    "create async tts task",
                    retry_interval,
                    &cancel,
                    move || {
                        let backend = backend_ref.clone();
                        let text = text.clone();
                        let voice = voice.clone();
                        async move { backend.create_task(&text, &voice).await }
                    },
                )
                .await;

                match created {
                    Ok(task_id) => {
                        let mut groups = groups.lock().await;
                        if let Some(group) = groups.get_mut(&group_key) {
                            group.submitted.insert(task_id, (item.chunk_index, item));
                            group.submitted_count += 1;
                        }
                    }
                    Err(AppError::Cancelled) => break,
                    Err(e) => {
                        error!(
                            "group {}: create failed for chunk {}: {}",
                            group_key, item.chunk_index, e
                        );
                        let mut groups = groups.lock().await;
                        if let Some(group) = groups.get_mut(&group_key) {
                            group.failed += 1;
                        }
                    }
                }

                if position + 1 < total {
                    tokio::time::sleep(spacing).await;
                }
            }
            debug!("group {} submission loop finished", group_key);
        });

        group_key
    }

    /// Query the backend for ready tasks, download the ones belonging to
    /// this group, and return the items that became completed on this call.
    /// Safe to call repeatedly; returns an empty list when nothing new is
    /// ready.
    pub async fn poll_group(&self, group_key: Uuid) -> AppResult<Vec<ChunkItem>> {
        let ready_ids = self.backend.ready_tasks().await?;

        // Pick out the ready ids that belong to this group.
        let candidates: Vec<(String, usize, ChunkItem)> = {
            let groups = self.groups.lock().await;
            let group = groups
                .get(&group_key)
                .ok_or_else(|| AppError::PipelineError(format!("unknown group {}", group_key)))?;
            ready_ids
                .iter()
                .filter_map(|id| {
                    group
                        .submitted
                        .get(id)
                        .map(|(index, item)| (id.clone(), *index, item.clone()))
                })
                .collect()
        };

        let mut newly_completed = Vec::new();
        for (task_id, index, mut item) in candidates {
            match self.backend.download(&task_id, &item.output_path).await {
                Ok(()) => {
                    item.audio_path = Some(item.output_path.clone());
                    let mut groups = self.groups.lock().await;
                    if let Some(group) = groups.get_mut(&group_key) {
                        // The submission map is the source of truth; a racing
                        // poll may already have claimed this id.
                        if group.submitted.remove(&task_id).is_some() {
                            group.completed.push(item.clone());
                            newly_completed.push(item);
                        }
                    }
                }
                Err(e) => {
                    // Left pending; the next poll retries the download.
                    warn!(
                        "group {}: download failed for chunk {} ({}): {}",
                        group_key, index, task_id, e
                    );
                }
            }
        }

        Ok(newly_completed)
    }

    pub async fn progress(&self, group_key: Uuid) -> AppResult<GroupProgress> {
        let ready_ids = self.backend.ready_tasks().await.unwrap_or_default();
        let groups = self.groups.lock().await;
        let group = groups
            .get(&group_key)
            .ok_or_else(|| AppError::PipelineError(format!("unknown group {}", group_key)))?;
        let ready = ready_ids
            .iter()
            .filter(|id| group.submitted.contains_key(*id))
            .count();
        Ok(GroupProgress {
            submitted: group.submitted_count,
            completed: group.completed.len(),
            ready,
            pending: group.submitted.len().saturating_sub(ready),
            failed: group.failed,
        })
    }

    /// True iff the group has downloaded at least `expected_total` items.
    pub async fn is_group_complete(&self, group_key: Uuid, expected_total: usize) -> bool {
        let groups = self.groups.lock().await;
        groups
            .get(&group_key)
            .map(|group| group.completed.len() >= expected_total)
            .unwrap_or(false)
    }

    /// Atomically check completion and claim the merge step: returns true
    /// exactly once, on the call that first observes the group complete.
    /// The check and the flag transition happen under one lock so a racing
    /// poller can neither double-trigger nor starve the merge.
    pub async fn try_mark_processed(&self, group_key: Uuid, expected_total: usize) -> bool {
        let mut groups = self.groups.lock().await;
        match groups.get_mut(&group_key) {
            Some(group) if !group.processed && group.completed.len() >= expected_total => {
                group.processed = true;
                true
            }
            _ => false,
        }
    }

    /// All items downloaded so far for a group, sorted by chunk index.
    pub async fn completed_items(&self, group_key: Uuid) -> Vec<ChunkItem> {
        let groups = self.groups.lock().await;
        let mut items = groups
            .get(&group_key)
            .map(|group| group.completed.clone())
            .unwrap_or_default();
        items.sort_by_key(|item| item.chunk_index);
        items
    }
}
