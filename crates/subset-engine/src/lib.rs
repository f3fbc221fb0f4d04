//! Builds a dataset holding only the first K episodes of a source dataset.
//!
//! All derivation happens in memory before the destination is touched: the
//! episode tables are projected, statistics re-aggregated and the manifest
//! reconciled first, then the kept files are copied and fresh metadata is
//! written. A failure while persisting leaves the destination with whatever
//! was already written; nothing is rolled back, and the returned error names
//! the stage that failed. `meta/info.json` is written last, so a destination
//! without it never finished.

mod config;
mod publish;

pub use config::{DatasetRoots, SubsetConfig};
pub use publish::{PublishError, PublishOptions, Publisher, Visibility};

use chrono::{DateTime, Utc};
use serde::Serialize;
use std::fmt;
use std::path::{Path, PathBuf};
use subset_core::{
    aggregate_stats, project_episodes, reconcile_manifest, sha256_hex, EpisodeId,
    EpisodeSelection, EpisodeTableKind, Manifest, ProjectedEpisodes, ProjectionError,
    ReconcileError, StatisticRecord, StatsError,
};
use subset_storage::{render_json_document, CopyPlan, CopyReport, DatasetStore, StorageError};
use thiserror::Error;
use tracing::{debug, info, warn};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Stage {
    LoadManifest,
    LoadEpisodes,
    LoadStatistics,
    CopyFiles,
    ClearMetadata,
    WriteEpisodes,
    WriteStatistics,
    WriteDatasetStatistic,
    WriteManifest,
}

impl Stage {
    pub fn as_str(&self) -> &'static str {
        match self {
            Stage::LoadManifest => "load_manifest",
            Stage::LoadEpisodes => "load_episodes",
            Stage::LoadStatistics => "load_statistics",
            Stage::CopyFiles => "copy_files",
            Stage::ClearMetadata => "clear_metadata",
            Stage::WriteEpisodes => "write_episodes",
            Stage::WriteStatistics => "write_statistics",
            Stage::WriteDatasetStatistic => "write_dataset_statistic",
            Stage::WriteManifest => "write_manifest",
        }
    }
}

impl fmt::Display for Stage {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

#[derive(Debug, Error)]
pub enum SubsetError {
    #[error("invalid configuration: {0}")]
    Config(String),
    #[error("episode {episode} is missing from the source {table}")]
    MissingEpisode {
        episode: EpisodeId,
        table: EpisodeTableKind,
    },
    #[error("cannot aggregate statistics over an empty episode set")]
    EmptyAggregation,
    #[error("cannot build a manifest for an empty episode selection")]
    EmptyManifest,
    #[error("keep_first {requested} exceeds the {available} episodes of the source dataset")]
    SelectionOutOfRange { requested: usize, available: usize },
    #[error("statistics error: {0}")]
    Statistics(#[source] StatsError),
    #[error("manifest error: {0}")]
    Reconcile(#[source] ReconcileError),
    #[error("failed to render manifest: {0}")]
    Render(#[source] StorageError),
    #[error("storage error during {stage}: {source}")]
    Storage {
        stage: Stage,
        #[source]
        source: StorageError,
    },
    #[error("publish failed: {0}")]
    Publish(#[from] PublishError),
}

impl SubsetError {
    /// Stage of a storage failure, if this error came from the storage collaborator.
    pub fn stage(&self) -> Option<Stage> {
        match self {
            SubsetError::Storage { stage, .. } => Some(*stage),
            _ => None,
        }
    }
}

impl From<ProjectionError> for SubsetError {
    fn from(err: ProjectionError) -> Self {
        match err {
            ProjectionError::MissingEpisode { episode, table } => {
                SubsetError::MissingEpisode { episode, table }
            }
        }
    }
}

impl From<StatsError> for SubsetError {
    fn from(err: StatsError) -> Self {
        match err {
            StatsError::EmptyAggregation => SubsetError::EmptyAggregation,
            other => SubsetError::Statistics(other),
        }
    }
}

impl From<ReconcileError> for SubsetError {
    fn from(err: ReconcileError) -> Self {
        match err {
            ReconcileError::EmptyManifest => SubsetError::EmptyManifest,
            other => SubsetError::Reconcile(other),
        }
    }
}

fn missing_publisher() -> SubsetError {
    SubsetError::Config("push_to_hub is set but no publisher is configured".to_string())
}

fn at(stage: Stage) -> impl FnOnce(StorageError) -> SubsetError {
    move |source| SubsetError::Storage { stage, source }
}

/// Everything the destination needs, derived before anything is written.
#[derive(Debug, Clone, PartialEq)]
pub struct SubsetPlan {
    pub roots: DatasetRoots,
    pub selection: EpisodeSelection,
    pub manifest: Manifest,
    pub episodes: ProjectedEpisodes,
    pub dataset_stats: StatisticRecord,
}

impl SubsetPlan {
    pub fn copy_plan(&self) -> CopyPlan {
        CopyPlan::for_manifest(&self.manifest, self.selection)
    }

    pub fn manifest_digest(&self) -> Result<String, SubsetError> {
        let rendered = render_json_document(&self.manifest).map_err(SubsetError::Render)?;
        Ok(sha256_hex(&rendered))
    }
}

#[derive(Debug, Clone, Serialize)]
pub struct SubsetReport {
    pub source: PathBuf,
    pub destination: PathBuf,
    pub total_episodes: usize,
    pub total_frames: u64,
    pub total_chunks: usize,
    pub total_videos: usize,
    pub copy: CopyReport,
    pub manifest_sha256: String,
    pub published: bool,
    pub completed_at: DateTime<Utc>,
}

pub struct SubsetRunner<'a, S: DatasetStore> {
    store: &'a S,
    publisher: Option<&'a dyn Publisher>,
    dataset_home: PathBuf,
}

impl<'a, S: DatasetStore> SubsetRunner<'a, S> {
    pub fn new(store: &'a S, dataset_home: impl Into<PathBuf>) -> Self {
        Self {
            store,
            publisher: None,
            dataset_home: dataset_home.into(),
        }
    }

    pub fn with_publisher(mut self, publisher: &'a dyn Publisher) -> Self {
        self.publisher = Some(publisher);
        self
    }

    /// Loads the source and derives the destination metadata without writing.
    pub fn plan(&self, config: &SubsetConfig) -> Result<SubsetPlan, SubsetError> {
        config.validate()?;
        let selection = EpisodeSelection::first(config.keep_first);
        let roots = config.resolve_roots(&self.dataset_home);
        info!(
            event = "subset_plan_start",
            source = %roots.source.display(),
            destination = %roots.destination.display(),
            keep_first = config.keep_first
        );

        let source_manifest = self
            .store
            .load_manifest(&roots.source)
            .map_err(at(Stage::LoadManifest))?;
        if selection.len() > source_manifest.total_episodes {
            return Err(SubsetError::SelectionOutOfRange {
                requested: selection.len(),
                available: source_manifest.total_episodes,
            });
        }
        let descriptors = self
            .store
            .load_episode_table(&roots.source)
            .map_err(at(Stage::LoadEpisodes))?;
        let statistics = self
            .store
            .load_statistic_table(&roots.source)
            .map_err(at(Stage::LoadStatistics))?;
        debug!(
            event = "subset_source_loaded",
            episodes = descriptors.len(),
            statistics = statistics.len(),
            chunks_size = source_manifest.chunks_size
        );

        let episodes = project_episodes(&descriptors, &statistics, &selection)?;
        let dataset_stats = aggregate_stats(episodes.statistic_records())?;
        let scalars = reconcile_manifest(&source_manifest, &selection, &episodes.episodes)?;
        let manifest = source_manifest.with_scalars(&scalars);

        info!(
            event = "subset_plan_ready",
            episodes = manifest.total_episodes,
            frames = manifest.total_frames,
            chunks = manifest.total_chunks,
            videos = manifest.total_videos
        );

        Ok(SubsetPlan {
            roots,
            selection,
            manifest,
            episodes,
            dataset_stats,
        })
    }

    /// Materializes a plan at its destination root.
    pub fn persist(&self, plan: &SubsetPlan) -> Result<CopyReport, SubsetError> {
        let result = self.persist_inner(plan);
        if let Err(err) = &result {
            warn!(
                event = "subset_persist_failed",
                stage = err.stage().map(|stage| stage.as_str()).unwrap_or("unknown"),
                destination = %plan.roots.destination.display(),
                error = %err,
                "destination may hold partial data; metadata is incomplete"
            );
        }
        result
    }

    fn persist_inner(&self, plan: &SubsetPlan) -> Result<CopyReport, SubsetError> {
        let destination = plan.roots.destination.as_path();
        let copy = self
            .store
            .copy_repository(&plan.roots.source, destination, &plan.copy_plan())
            .map_err(at(Stage::CopyFiles))?;
        info!(
            event = "subset_files_copied",
            episode_files = copy.episode_files,
            auxiliary_files = copy.auxiliary_files,
            bytes = copy.bytes_copied
        );

        self.store
            .delete_stale_metadata_artifacts(destination)
            .map_err(at(Stage::ClearMetadata))?;
        for descriptor in plan.episodes.episodes.values() {
            self.store
                .write_episode_descriptor(descriptor, destination)
                .map_err(at(Stage::WriteEpisodes))?;
        }
        for (episode, record) in &plan.episodes.statistics {
            self.store
                .write_statistic_record(*episode, record, destination)
                .map_err(at(Stage::WriteStatistics))?;
        }
        self.store
            .write_dataset_statistic(&plan.dataset_stats, destination)
            .map_err(at(Stage::WriteDatasetStatistic))?;
        self.store
            .write_manifest(&plan.manifest, destination)
            .map_err(at(Stage::WriteManifest))?;
        info!(event = "subset_metadata_written", destination = %destination.display());
        Ok(copy)
    }

    pub fn run(&self, config: &SubsetConfig) -> Result<SubsetReport, SubsetError> {
        if config.push_to_hub && self.publisher.is_none() {
            return Err(missing_publisher());
        }
        let plan = self.plan(config)?;
        let manifest_sha256 = plan.manifest_digest()?;
        let copy = self.persist(&plan)?;

        let published = if config.push_to_hub {
            self.publish(&plan, config)?;
            true
        } else {
            false
        };

        Ok(SubsetReport {
            source: plan.roots.source,
            destination: plan.roots.destination,
            total_episodes: plan.manifest.total_episodes,
            total_frames: plan.manifest.total_frames,
            total_chunks: plan.manifest.total_chunks,
            total_videos: plan.manifest.total_videos,
            copy,
            manifest_sha256,
            published,
            completed_at: Utc::now(),
        })
    }

    fn publish(&self, plan: &SubsetPlan, config: &SubsetConfig) -> Result<(), SubsetError> {
        let Some(publisher) = self.publisher else {
            return Err(missing_publisher());
        };
        let options = PublishOptions {
            branch: config.branch.clone(),
            visibility: config.visibility(),
            tag: Some(plan.manifest.codebase_version.clone()),
        };
        publisher.publish(&plan.roots.destination, &config.dst_repo_id, &options)?;
        info!(
            event = "subset_published",
            repo_id = %config.dst_repo_id,
            visibility = %options.visibility,
            branch = options.branch.as_deref().unwrap_or("main")
        );
        Ok(())
    }
}

/// Dataset home used when no explicit root is given.
pub fn default_dataset_home(cache_dir: &Path) -> PathBuf {
    cache_dir.join("huggingface").join("lerobot")
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;
    use std::cell::RefCell;
    use std::collections::BTreeMap;
    use subset_core::{EpisodeDescriptor, EpisodeTable, FeatureStats, StatArray, StatisticTable};

    struct MemoryStore {
        manifest: Manifest,
        episodes: EpisodeTable,
        statistics: StatisticTable,
        fail_at: Option<Stage>,
        calls: RefCell<Vec<String>>,
    }

    impl MemoryStore {
        fn new(lengths: &[u64], chunks_size: usize) -> Self {
            let manifest: Manifest = serde_json::from_value(json!({
                "codebase_version": "v2.1",
                "total_episodes": lengths.len(),
                "total_frames": lengths.iter().sum::<u64>(),
                "total_videos": lengths.len(),
                "total_chunks": (lengths.len() - 1) / chunks_size + 1,
                "chunks_size": chunks_size,
                "splits": {"train": format!("0:{}", lengths.len())},
                "data_path": "data/chunk-{episode_chunk:03d}/episode_{episode_index:06d}.parquet",
                "video_path": "videos/chunk-{episode_chunk:03d}/{video_key}/episode_{episode_index:06d}.mp4",
                "features": {"observation.image": {"dtype": "video", "shape": [64, 64, 3]}}
            }))
            .expect("manifest");
            let mut episodes = EpisodeTable::new();
            let mut statistics = StatisticTable::new();
            for (idx, length) in lengths.iter().enumerate() {
                episodes.insert(
                    idx,
                    EpisodeDescriptor {
                        episode_index: idx,
                        tasks: vec!["push".to_string()],
                        length: *length,
                        extra: BTreeMap::new(),
                    },
                );
                let value = idx as f64 * 10.0;
                statistics.insert(
                    idx,
                    BTreeMap::from([(
                        "state".to_string(),
                        FeatureStats {
                            min: StatArray::vector(vec![value]),
                            max: StatArray::vector(vec![value]),
                            mean: StatArray::vector(vec![value]),
                            std: StatArray::vector(vec![0.0]),
                            count: *length,
                            extra: BTreeMap::new(),
                        },
                    )]),
                );
            }
            Self {
                manifest,
                episodes,
                statistics,
                fail_at: None,
                calls: RefCell::new(Vec::new()),
            }
        }

        fn record(&self, stage: Stage) -> Result<(), StorageError> {
            self.calls.borrow_mut().push(stage.as_str().to_string());
            if self.fail_at == Some(stage) {
                return Err(StorageError::Serialization(format!("injected at {stage}")));
            }
            Ok(())
        }

        fn calls(&self) -> Vec<String> {
            self.calls.borrow().clone()
        }
    }

    impl DatasetStore for MemoryStore {
        fn load_manifest(&self, _root: &Path) -> Result<Manifest, StorageError> {
            self.record(Stage::LoadManifest)?;
            Ok(self.manifest.clone())
        }

        fn load_episode_table(&self, _root: &Path) -> Result<EpisodeTable, StorageError> {
            self.record(Stage::LoadEpisodes)?;
            Ok(self.episodes.clone())
        }

        fn load_statistic_table(&self, _root: &Path) -> Result<StatisticTable, StorageError> {
            self.record(Stage::LoadStatistics)?;
            Ok(self.statistics.clone())
        }

        fn copy_repository(
            &self,
            _source: &Path,
            _destination: &Path,
            plan: &CopyPlan,
        ) -> Result<CopyReport, StorageError> {
            self.record(Stage::CopyFiles)?;
            Ok(CopyReport {
                episode_files: plan.episode_files()?.len(),
                ..CopyReport::default()
            })
        }

        fn delete_stale_metadata_artifacts(&self, _destination: &Path) -> Result<(), StorageError> {
            self.record(Stage::ClearMetadata)
        }

        fn write_manifest(&self, _manifest: &Manifest, _destination: &Path) -> Result<(), StorageError> {
            self.record(Stage::WriteManifest)
        }

        fn write_episode_descriptor(
            &self,
            _descriptor: &EpisodeDescriptor,
            _destination: &Path,
        ) -> Result<(), StorageError> {
            self.record(Stage::WriteEpisodes)
        }

        fn write_statistic_record(
            &self,
            _episode: EpisodeId,
            _record: &StatisticRecord,
            _destination: &Path,
        ) -> Result<(), StorageError> {
            self.record(Stage::WriteStatistics)
        }

        fn write_dataset_statistic(
            &self,
            _record: &StatisticRecord,
            _destination: &Path,
        ) -> Result<(), StorageError> {
            self.record(Stage::WriteDatasetStatistic)
        }
    }

    struct RecordingPublisher {
        calls: RefCell<Vec<(PathBuf, String, PublishOptions)>>,
    }

    impl Publisher for RecordingPublisher {
        fn publish(
            &self,
            root: &Path,
            repo_id: &str,
            options: &PublishOptions,
        ) -> Result<(), PublishError> {
            self.calls
                .borrow_mut()
                .push((root.to_path_buf(), repo_id.to_string(), options.clone()));
            Ok(())
        }
    }

    fn config(keep_first: usize) -> SubsetConfig {
        let mut config = SubsetConfig::new("lab/src", "lab/dst", keep_first);
        config.push_to_hub = false;
        config
    }

    #[test]
    fn plan_recomputes_manifest_and_stats() {
        let store = MemoryStore::new(&[10, 20, 30, 40], 2);
        let runner = SubsetRunner::new(&store, "/home");
        let plan = runner.plan(&config(3)).expect("plan");

        assert_eq!(plan.manifest.total_episodes, 3);
        assert_eq!(plan.manifest.total_frames, 60);
        assert_eq!(plan.manifest.total_chunks, 2);
        assert_eq!(plan.manifest.total_videos, 3);
        assert_eq!(plan.manifest.splits["train"].to_string(), "0:3");
        assert_eq!(plan.episodes.episodes.len(), 3);
        assert_eq!(plan.dataset_stats["state"].count, 60);
        assert_eq!(plan.roots.destination, PathBuf::from("/home/lab/dst"));
        assert_eq!(
            store.calls(),
            vec!["load_manifest", "load_episodes", "load_statistics"]
        );
    }

    #[test]
    fn run_writes_metadata_with_manifest_last() {
        let store = MemoryStore::new(&[5, 5, 5], 1000);
        let report = SubsetRunner::new(&store, "/home")
            .run(&config(2))
            .expect("run");

        assert_eq!(report.total_episodes, 2);
        assert_eq!(report.copy.episode_files, 4);
        assert!(!report.published);
        assert_eq!(report.manifest_sha256.len(), 64);
        assert_eq!(
            store.calls(),
            vec![
                "load_manifest",
                "load_episodes",
                "load_statistics",
                "copy_files",
                "clear_metadata",
                "write_episodes",
                "write_episodes",
                "write_statistics",
                "write_statistics",
                "write_dataset_statistic",
                "write_manifest",
            ]
        );
    }

    #[test]
    fn missing_statistics_abort_before_any_write() {
        let mut store = MemoryStore::new(&[5, 5, 5], 2);
        store.statistics.remove(&1);
        let err = SubsetRunner::new(&store, "/home")
            .run(&config(3))
            .expect_err("missing episode");
        assert!(matches!(
            err,
            SubsetError::MissingEpisode {
                episode: 1,
                table: EpisodeTableKind::Statistics
            }
        ));
        assert!(!store.calls().iter().any(|call| call.starts_with("copy") || call.starts_with("write")));
    }

    #[test]
    fn selection_beyond_source_is_rejected() {
        let store = MemoryStore::new(&[5, 5], 2);
        let err = SubsetRunner::new(&store, "/home")
            .plan(&config(3))
            .expect_err("too many");
        assert!(matches!(
            err,
            SubsetError::SelectionOutOfRange {
                requested: 3,
                available: 2
            }
        ));
    }

    #[test]
    fn empty_selection_is_rejected_before_loading() {
        let store = MemoryStore::new(&[5, 5], 2);
        let err = SubsetRunner::new(&store, "/home")
            .plan(&config(0))
            .expect_err("empty");
        assert!(matches!(err, SubsetError::EmptyManifest));
        assert!(store.calls().is_empty());
    }

    #[test]
    fn storage_failures_carry_their_stage() {
        let mut store = MemoryStore::new(&[5, 5, 5], 2);
        store.fail_at = Some(Stage::WriteStatistics);
        let err = SubsetRunner::new(&store, "/home")
            .run(&config(2))
            .expect_err("injected");
        assert_eq!(err.stage(), Some(Stage::WriteStatistics));
        assert!(err.to_string().contains("write_statistics"));
        assert!(!store.calls().contains(&"write_manifest".to_string()));

        let mut store = MemoryStore::new(&[5, 5, 5], 2);
        store.fail_at = Some(Stage::LoadEpisodes);
        let err = SubsetRunner::new(&store, "/home")
            .run(&config(2))
            .expect_err("injected");
        assert_eq!(err.stage(), Some(Stage::LoadEpisodes));
    }

    #[test]
    fn publishing_is_gated_and_tagged() {
        let store = MemoryStore::new(&[5, 5, 5], 2);
        let publisher = RecordingPublisher {
            calls: RefCell::new(Vec::new()),
        };
        let mut config = config(1);
        config.push_to_hub = true;
        config.private = true;
        config.branch = Some("subset".to_string());

        let report = SubsetRunner::new(&store, "/home")
            .with_publisher(&publisher)
            .run(&config)
            .expect("run");
        assert!(report.published);

        let calls = publisher.calls.borrow();
        assert_eq!(calls.len(), 1);
        let (root, repo_id, options) = &calls[0];
        assert_eq!(root, &PathBuf::from("/home/lab/dst"));
        assert_eq!(repo_id, "lab/dst");
        assert_eq!(options.visibility, Visibility::Private);
        assert_eq!(options.branch.as_deref(), Some("subset"));
        assert_eq!(options.tag.as_deref(), Some("v2.1"));
    }

    #[test]
    fn push_without_publisher_is_a_config_error() {
        let store = MemoryStore::new(&[5], 2);
        let mut config = config(1);
        config.push_to_hub = true;
        let err = SubsetRunner::new(&store, "/home")
            .run(&config)
            .expect_err("no publisher");
        assert!(matches!(err, SubsetError::Config(_)));
        assert!(store.calls().is_empty());
    }

    #[test]
    fn wrapped_core_errors_keep_their_source() {
        use std::error::Error as _;

        let err = SubsetError::from(StatsError::ZeroCount {
            feature: "state".to_string(),
        });
        assert!(err.source().is_some());
        let err = SubsetError::from(ReconcileError::InvalidChunkSize);
        assert!(err
            .source()
            .is_some_and(|source| source.to_string().contains("chunks_size")));
        let err = SubsetError::Render(StorageError::Serialization("bad float".to_string()));
        assert_eq!(err.stage(), None);
        assert!(err.source().is_some());
    }
}
