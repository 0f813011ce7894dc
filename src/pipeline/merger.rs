//! Chunk-group reassembly for the quota-constrained backend.
//!
//! When that backend produced more raw chunks than the pipeline's configured
//! parallelism, the raw chunks are repartitioned into exactly `P` contiguous
//! groups and each multi-member group is losslessly concatenated (stream
//! copy, shared codec) before transcription. Triggered exactly once per
//! owner key, guarded by the submitter's processed flag.

use crate::errors::{AppError, AppResult};
use crate::models::ChunkItem;
use crate::services::chunking::partition_front_loaded;
use crate::services::video::Concatenator;
use log::{debug, info};
use std::path::{Path, PathBuf};
use std::sync::Arc;

pub struct ChunkGroupMerger {
    concatenator: Arc<dyn Concatenator>,
}

impl ChunkGroupMerger {
    pub fn new(concatenator: Arc<dyn Concatenator>) -> Self {
        Self { concatenator }
    }

    /// Merge `raw` chunks (any completion order) into `min(target_groups,
    /// raw count)` transcription-ready items. Single-member groups pass
    /// their audio through untouched; larger groups are concatenated in
    /// index order into `out_dir`.
    pub async fn merge_groups(
        &self,
        mut raw: Vec<ChunkItem>,
        target_groups: usize,
        out_dir: &Path,
    ) -> AppResult<Vec<ChunkItem>> {
        if raw.is_empty() {
            return Err(AppError::PipelineError(
                "cannot merge an empty chunk group".to_string(),
            ));
        }
        // Completion order is never combination order.
        raw.sort_by_key(|item| item.chunk_index);
        let owner = raw[0].owner.clone();
        let voice = raw[0].voice.clone();

        let group_count = target_groups.min(raw.len()).max(1);
        let sizes = partition_front_loaded(raw.len(), group_count);
        debug!("merging {} raw chunks into groups {:?}", raw.len(), sizes);

        tokio::fs::create_dir_all(out_dir).await?;

        let mut merged = Vec::with_capacity(group_count);
        let mut cursor = 0;
        for (group_index, size) in sizes.into_iter().enumerate() {
            let members = &raw[cursor..cursor + size];
            cursor += size;

            let audio_path = if members.len() == 1 {
                members[0]
                    .audio_path
                    .clone()
                    .ok_or_else(|| AppError::PipelineError(format!(
                        "raw chunk {} of {} has no audio",
                        members[0].chunk_index, owner
                    )))?
            } else {
                let inputs: Vec<PathBuf> = members
                    .iter()
                    .map(|member| {
                        member.audio_path.clone().ok_or_else(|| {
                            AppError::PipelineError(format!(
                                "raw chunk {} of {} has no audio",
                                member.chunk_index, owner
                            ))
                        })
                    })
                    .collect::<AppResult<_>>()?;
                let output = out_dir.join(format!("merged_{}.mp3", group_index));
                self.concatenator.concatenate(&inputs, &output).await?
            };

            merged.push(ChunkItem {
                owner: owner.clone(),
                chunk_index: group_index,
                total_chunks: group_count,
                text: None,
                audio_path: Some(audio_path),
                output_path: out_dir.join(format!("chunk_{}.vtt", group_index)),
                voice: voice.clone(),
                merged: true,
            });
        }

        info!(
            "merged {} raw chunks of {} into {} transcription groups",
            raw.len(),
            owner,
            group_count
        );
        Ok(merged)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::models::LanguageTaskKey;
    use async_trait::async_trait;

    /// Byte-level concatenation stand-in for the ffmpeg stream copy.
    struct StubConcatenator;

    #[async_trait]
    impl Concatenator for StubConcatenator {
        async fn concatenate(&self, inputs: &[PathBuf], output: &Path) -> AppResult<PathBuf> {
            let mut joined = Vec::new();
            for input in inputs {
                joined.extend(tokio::fs::read(input).await?);
            }
            tokio::fs::write(output, joined).await?;
            Ok(output.to_path_buf())
        }
    }

    fn merger() -> ChunkGroupMerger {
        ChunkGroupMerger::new(Arc::new(StubConcatenator))
    }

    async fn raw_items(dir: &Path, count: usize) -> Vec<ChunkItem> {
        let key = LanguageTaskKey::new(1, "it", false);
        let mut items = Vec::new();
        for i in 0..count {
            let path = dir.join(format!("raw_{}.mp3", i));
            tokio::fs::write(&path, format!("audio{}", i)).await.unwrap();
            items.push(ChunkItem {
                owner: key.clone(),
                chunk_index: i,
                total_chunks: count,
                text: None,
                audio_path: Some(path.clone()),
                output_path: path,
                voice: "v".to_string(),
                merged: false,
            });
        }
        items
    }

    #[test]
    fn test_partition_seven_into_three() {
        // 7 raw chunks into 3 groups: sizes [3,2,2] over indices
        // [0,1,2],[3,4],[5,6].
        assert_eq!(partition_front_loaded(7, 3), vec![3, 2, 2]);
    }

    #[test]
    fn test_partition_sizes_sum_and_balance() {
        for r in 1..=20 {
            for p in 1..=r {
                let sizes = partition_front_loaded(r, p);
                assert_eq!(sizes.iter().sum::<usize>(), r);
                let max = sizes.iter().max().unwrap();
                let min = sizes.iter().min().unwrap();
                assert!(max - min <= 1, "r={} p={} sizes={:?}", r, p, sizes);
            }
        }
    }

    #[tokio::test]
    async fn test_single_member_groups_pass_through() {
        let dir = tempfile::tempdir().unwrap();
        let merger = merger();
        // R=3, P=3: every group has one member, nothing is concatenated.
        let raw = raw_items(dir.path(), 3).await;
        let expected: Vec<PathBuf> = raw
            .iter()
            .map(|item| item.audio_path.clone().unwrap())
            .collect();

        let merged = merger
            .merge_groups(raw, 3, &dir.path().join("merged"))
            .await
            .unwrap();
        assert_eq!(merged.len(), 3);
        for (group_index, item) in merged.iter().enumerate() {
            assert_eq!(item.chunk_index, group_index);
            assert_eq!(item.total_chunks, 3);
            assert!(item.merged);
            assert_eq!(item.audio_path.as_ref().unwrap(), &expected[group_index]);
        }
    }

    #[tokio::test]
    async fn test_merge_preserves_index_order_despite_completion_order() {
        let dir = tempfile::tempdir().unwrap();
        let merger = merger();
        // Deliver raw chunks in reverse completion order; pass-through
        // grouping must still come back sorted by index.
        let mut raw = raw_items(dir.path(), 4).await;
        raw.reverse();

        let merged = merger
            .merge_groups(raw, 4, &dir.path().join("merged"))
            .await
            .unwrap();
        let indices: Vec<usize> = merged.iter().map(|item| item.chunk_index).collect();
        assert_eq!(indices, vec![0, 1, 2, 3]);
        for (i, item) in merged.iter().enumerate() {
            let content = tokio::fs::read_to_string(item.audio_path.as_ref().unwrap())
                .await
                .unwrap();
            assert_eq!(content, format!("audio{}", i));
        }
    }

    #[tokio::test]
    async fn test_multi_member_groups_concatenate_in_index_order() {
        let dir = tempfile::tempdir().unwrap();
        let merger = merger();
        let raw = raw_items(dir.path(), 7).await;

        let merged = merger
            .merge_groups(raw, 3, &dir.path().join("merged"))
            .await
            .unwrap();
        assert_eq!(merged.len(), 3);
        let contents = [
            "audio0audio1audio2",
            "audio3audio4",
            "audio5audio6",
        ];
        for (item, expected) in merged.iter().zip(contents) {
            let content = tokio::fs::read_to_string(item.audio_path.as_ref().unwrap())
                .await
                .unwrap();
            assert_eq!(content, expected);
        }
    }

    #[tokio::test]
    async fn test_missing_audio_is_an_error() {
        let dir = tempfile::tempdir().unwrap();
        let merger = merger();
        let mut raw = raw_items(dir.path(), 2).await;
        raw[1].audio_path = None;
        let result = merger.merge_groups(raw, 2, &dir.path().join("merged")).await;
        assert!(result.is_err());
    }
}
