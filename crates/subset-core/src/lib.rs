pub mod projection;
pub mod reconcile;
pub mod stats;

use serde::{Deserialize, Deserializer, Serialize};
use serde_json::Value;
use sha2::{Digest, Sha256};
use std::collections::BTreeMap;
use std::fmt;
use std::str::FromStr;

pub use projection::{project_episodes, EpisodeTableKind, ProjectedEpisodes, ProjectionError};
pub use reconcile::{reconcile_manifest, ManifestScalars, ReconcileError};
pub use stats::{aggregate_stats, FeatureStats, StatArray, StatisticRecord, StatsError};

pub const TRAIN_SPLIT: &str = "train";
pub const VIDEO_DTYPE: &str = "video";

/// Zero-based index of an episode inside a dataset.
pub type EpisodeId = usize;

pub type EpisodeTable = BTreeMap<EpisodeId, EpisodeDescriptor>;
pub type StatisticTable = BTreeMap<EpisodeId, StatisticRecord>;

/// The contiguous prefix `[0, keep_first)` of a dataset's episodes.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct EpisodeSelection {
    keep_first: usize,
}

impl EpisodeSelection {
    pub fn first(keep_first: usize) -> Self {
        Self { keep_first }
    }

    pub fn len(&self) -> usize {
        self.keep_first
    }

    pub fn is_empty(&self) -> bool {
        self.keep_first == 0
    }

    pub fn ids(&self) -> impl Iterator<Item = EpisodeId> {
        0..self.keep_first
    }

    /// Highest selected identifier, `None` for an empty selection.
    pub fn last(&self) -> Option<EpisodeId> {
        self.keep_first.checked_sub(1)
    }

    pub fn contains(&self, episode: EpisodeId) -> bool {
        episode < self.keep_first
    }

    pub fn as_split(&self) -> SplitRange {
        SplitRange {
            start: 0,
            end: self.keep_first,
        }
    }
}

/// Half-open episode range, written as `"start:end"` in the manifest.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(try_from = "String", into = "String")]
pub struct SplitRange {
    pub start: EpisodeId,
    pub end: EpisodeId,
}

impl fmt::Display for SplitRange {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}:{}", self.start, self.end)
    }
}

impl FromStr for SplitRange {
    type Err = String;

    fn from_str(input: &str) -> Result<Self, Self::Err> {
        let (start, end) = input
            .trim()
            .split_once(':')
            .ok_or_else(|| format!("split range must look like start:end, got {input:?}"))?;
        let start = start
            .trim()
            .parse::<usize>()
            .map_err(|err| format!("invalid split start {start:?}: {err}"))?;
        let end = end
            .trim()
            .parse::<usize>()
            .map_err(|err| format!("invalid split end {end:?}: {err}"))?;
        if end < start {
            return Err(format!("split range {input:?} ends before it starts"));
        }
        Ok(Self { start, end })
    }
}

impl TryFrom<String> for SplitRange {
    type Error = String;

    fn try_from(value: String) -> Result<Self, Self::Error> {
        value.parse()
    }
}

impl From<SplitRange> for String {
    fn from(value: SplitRange) -> Self {
        value.to_string()
    }
}

/// One feature entry of the manifest's `features` map.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct FeatureSpec {
    pub dtype: String,
    #[serde(default)]
    pub shape: Vec<usize>,
    #[serde(default, flatten)]
    pub extra: BTreeMap<String, Value>,
}

impl FeatureSpec {
    pub fn is_video(&self) -> bool {
        self.dtype == VIDEO_DTYPE
    }
}

/// Dataset manifest (`meta/info.json`). Fields the subset logic does not
/// interpret (`robot_type`, `fps`, ...) are carried through `extra`
/// untouched, and optional keys absent from the source stay absent.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Manifest {
    pub codebase_version: String,
    pub total_episodes: usize,
    pub total_frames: u64,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub total_tasks: Option<usize>,
    #[serde(default)]
    pub total_videos: usize,
    pub total_chunks: usize,
    pub chunks_size: usize,
    #[serde(default)]
    pub splits: BTreeMap<String, SplitRange>,
    pub data_path: String,
    /// `None` when the key is absent, `Some(None)` for an explicit `null`.
    #[serde(
        default,
        deserialize_with = "present",
        skip_serializing_if = "Option::is_none"
    )]
    pub video_path: Option<Option<String>>,
    #[serde(default)]
    pub features: BTreeMap<String, FeatureSpec>,
    #[serde(default, flatten)]
    pub extra: BTreeMap<String, Value>,
}

fn present<'de, D, T>(deserializer: D) -> Result<Option<T>, D::Error>
where
    D: Deserializer<'de>,
    T: Deserialize<'de>,
{
    T::deserialize(deserializer).map(Some)
}

impl Manifest {
    pub fn video_template(&self) -> Option<&str> {
        self.video_path.as_ref().and_then(|path| path.as_deref())
    }

    pub fn video_keys(&self) -> Vec<&str> {
        self.features
            .iter()
            .filter(|(_, spec)| spec.is_video())
            .map(|(key, _)| key.as_str())
            .collect()
    }

    /// Chunk holding `episode`; callers must have rejected `chunks_size == 0`.
    pub fn episode_chunk(&self, episode: EpisodeId) -> usize {
        episode / self.chunks_size
    }

    /// Returns a copy of this manifest with the recomputed scalar fields.
    pub fn with_scalars(&self, scalars: &ManifestScalars) -> Manifest {
        Manifest {
            total_episodes: scalars.total_episodes,
            total_frames: scalars.total_frames,
            total_videos: scalars.total_videos,
            total_chunks: scalars.total_chunks,
            splits: scalars.splits.clone(),
            ..self.clone()
        }
    }
}

/// One line of `meta/episodes.jsonl`.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct EpisodeDescriptor {
    pub episode_index: EpisodeId,
    #[serde(default)]
    pub tasks: Vec<String>,
    pub length: u64,
    #[serde(default, flatten)]
    pub extra: BTreeMap<String, Value>,
}

pub fn sha256_hex(bytes: &[u8]) -> String {
    let mut hasher = Sha256::new();
    hasher.update(bytes);
    let digest = hasher.finalize();
    let mut out = String::with_capacity(digest.len() * 2);
    for byte in digest {
        out.push_str(&format!("{byte:02x}"));
    }
    out
}
