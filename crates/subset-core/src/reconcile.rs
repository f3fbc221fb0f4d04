//! Recomputes the manifest's scalar fields for a truncated episode set.
//!
//! Prior split structure is not projected onto the prefix: every subset gets
//! a single `train` split covering all kept episodes. Callers that rely on
//! named test/validation splits need to re-split the result themselves.

use crate::{EpisodeSelection, EpisodeTable, Manifest, SplitRange, TRAIN_SPLIT};
use std::collections::BTreeMap;
use thiserror::Error;

#[derive(Debug, Error, PartialEq, Eq)]
pub enum ReconcileError {
    #[error("cannot reconcile a manifest for an empty episode selection")]
    EmptyManifest,
    #[error("manifest chunks_size must be positive")]
    InvalidChunkSize,
    #[error("projected episode table holds {found} episodes but the selection has {expected}")]
    SelectionMismatch { expected: usize, found: usize },
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ManifestScalars {
    pub total_episodes: usize,
    pub total_frames: u64,
    pub total_videos: usize,
    pub total_chunks: usize,
    pub splits: BTreeMap<String, SplitRange>,
}

pub fn reconcile_manifest(
    source: &Manifest,
    selection: &EpisodeSelection,
    episodes: &EpisodeTable,
) -> Result<ManifestScalars, ReconcileError> {
    let Some(last_episode) = selection.last() else {
        return Err(ReconcileError::EmptyManifest);
    };
    if source.chunks_size == 0 {
        return Err(ReconcileError::InvalidChunkSize);
    }
    let selected = episodes
        .keys()
        .filter(|episode| selection.contains(**episode))
        .count();
    if selected != selection.len() || episodes.len() != selection.len() {
        return Err(ReconcileError::SelectionMismatch {
            expected: selection.len(),
            found: episodes.len(),
        });
    }

    let total_episodes = selection.len();
    let total_frames = episodes.values().map(|episode| episode.length).sum();
    let total_videos = source.video_keys().len() * total_episodes;
    let total_chunks = source.episode_chunk(last_episode) + 1;

    let mut splits = BTreeMap::new();
    splits.insert(TRAIN_SPLIT.to_string(), selection.as_split());

    Ok(ManifestScalars {
        total_episodes,
        total_frames,
        total_videos,
        total_chunks,
        splits,
    })
}
