mod local;
pub mod template;

pub use local::LocalDatasetStore;
pub use template::{render_path_template, TemplateVars};

use serde::Serialize;
use std::path::{Path, PathBuf};
use subset_core::{
    EpisodeDescriptor, EpisodeId, EpisodeSelection, EpisodeTable, Manifest, StatisticRecord,
    StatisticTable,
};
use thiserror::Error;

pub const INFO_PATH: &str = "meta/info.json";
pub const EPISODES_PATH: &str = "meta/episodes.jsonl";
pub const EPISODES_STATS_PATH: &str = "meta/episodes_stats.jsonl";
pub const STATS_PATH: &str = "meta/stats.json";
pub const TASKS_PATH: &str = "meta/tasks.jsonl";

/// Metadata files regenerated for every subset and never copied from the source.
pub const GENERATED_METADATA: [&str; 4] = [INFO_PATH, EPISODES_PATH, EPISODES_STATS_PATH, STATS_PATH];

#[derive(Debug, Error)]
pub enum StorageError {
    #[error("io error at {path}: {source}")]
    Io {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },
    #[error("malformed {path} line {line}: {reason}")]
    Malformed {
        path: PathBuf,
        line: usize,
        reason: String,
    },
    #[error("duplicate episode {episode} in {path}")]
    DuplicateEpisode { path: PathBuf, episode: EpisodeId },
    #[error("serialization error: {0}")]
    Serialization(String),
    #[error("invalid path template {template:?}: {reason}")]
    Template { template: String, reason: String },
    #[error("destination {0} is the source dataset")]
    DestinationIsSource(PathBuf),
    #[error("walk error: {0}")]
    Walk(#[from] ignore::Error),
}

impl StorageError {
    pub(crate) fn io(path: impl Into<PathBuf>, source: std::io::Error) -> Self {
        Self::Io {
            path: path.into(),
            source,
        }
    }
}

/// Which episode-owned files a copy has to carry over.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CopyPlan {
    pub selection: EpisodeSelection,
    pub chunks_size: usize,
    pub data_path: String,
    pub video_path: Option<String>,
    pub video_keys: Vec<String>,
}

impl CopyPlan {
    pub fn for_manifest(manifest: &Manifest, selection: EpisodeSelection) -> Self {
        Self {
            selection,
            chunks_size: manifest.chunks_size,
            data_path: manifest.data_path.clone(),
            video_path: manifest.video_template().map(str::to_string),
            video_keys: manifest
                .video_keys()
                .into_iter()
                .map(str::to_string)
                .collect(),
        }
    }

    /// Relative paths of every data and video file belonging to the selection.
    pub fn episode_files(&self) -> Result<Vec<String>, StorageError> {
        if self.chunks_size == 0 {
            return Err(StorageError::Template {
                template: self.data_path.clone(),
                reason: "chunks_size must be positive".to_string(),
            });
        }
        let mut files = Vec::new();
        for episode_index in self.selection.ids() {
            let episode_chunk = episode_index / self.chunks_size;
            files.push(render_path_template(
                &self.data_path,
                &TemplateVars {
                    episode_chunk,
                    episode_index,
                    video_key: None,
                },
            )?);
            let Some(video_path) = &self.video_path else {
                continue;
            };
            for video_key in &self.video_keys {
                files.push(render_path_template(
                    video_path,
                    &TemplateVars {
                        episode_chunk,
                        episode_index,
                        video_key: Some(video_key.as_str()),
                    },
                )?);
            }
        }
        Ok(files)
    }

    /// Leading directories that hold only episode-owned files (`data`, `videos`).
    pub fn episode_roots(&self) -> Vec<String> {
        let mut roots: Vec<String> = std::iter::once(self.data_path.as_str())
            .chain(self.video_path.as_deref())
            .filter_map(|template| {
                let (head, _) = template.split_once('/')?;
                (!head.contains('{')).then(|| head.to_string())
            })
            .collect();
        roots.sort();
        roots.dedup();
        roots
    }
}

#[derive(Debug, Default, Clone, PartialEq, Eq, Serialize)]
pub struct CopyReport {
    pub episode_files: usize,
    pub auxiliary_files: usize,
    pub bytes_copied: u64,
}

/// Storage collaborator for reading a source dataset and materializing the
/// subset. Calls block and are never retried by the caller.
pub trait DatasetStore {
    fn load_manifest(&self, root: &Path) -> Result<Manifest, StorageError>;

    fn load_episode_table(&self, root: &Path) -> Result<EpisodeTable, StorageError>;

    fn load_statistic_table(&self, root: &Path) -> Result<StatisticTable, StorageError>;

    /// Duplicates the files the plan needs, replacing `destination` if it exists.
    fn copy_repository(
        &self,
        source: &Path,
        destination: &Path,
        plan: &CopyPlan,
    ) -> Result<CopyReport, StorageError>;

    fn delete_stale_metadata_artifacts(&self, destination: &Path) -> Result<(), StorageError>;

    fn write_manifest(&self, manifest: &Manifest, destination: &Path) -> Result<(), StorageError>;

    fn write_episode_descriptor(
        &self,
        descriptor: &EpisodeDescriptor,
        destination: &Path,
    ) -> Result<(), StorageError>;

    fn write_statistic_record(
        &self,
        episode: EpisodeId,
        record: &StatisticRecord,
        destination: &Path,
    ) -> Result<(), StorageError>;

    fn write_dataset_statistic(
        &self,
        record: &StatisticRecord,
        destination: &Path,
    ) -> Result<(), StorageError>;
}

/// Renders a JSON document with four-space indentation.
pub fn render_json_document<T: Serialize>(value: &T) -> Result<Vec<u8>, StorageError> {
    let mut out = Vec::new();
    let formatter = serde_json::ser::PrettyFormatter::with_indent(b"    ");
    let mut serializer = serde_json::Serializer::with_formatter(&mut out, formatter);
    value
        .serialize(&mut serializer)
        .map_err(|err| StorageError::Serialization(err.to_string()))?;
    Ok(out)
}
