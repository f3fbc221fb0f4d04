use crate::{
    render_json_document, CopyPlan, CopyReport, DatasetStore, StorageError, EPISODES_PATH,
    EPISODES_STATS_PATH, GENERATED_METADATA, INFO_PATH, STATS_PATH,
};
use ignore::WalkBuilder;
use serde::de::DeserializeOwned;
use serde::{Deserialize, Serialize};
use std::fs::{self, OpenOptions};
use std::io::{ErrorKind, Write};
use std::path::{Component, Path, PathBuf};
use subset_core::{
    EpisodeDescriptor, EpisodeId, EpisodeTable, Manifest, StatisticRecord, StatisticTable,
};

const SKIP_DIRS: [&str; 2] = [".git", ".cache"];

#[derive(Deserialize)]
struct EpisodeStatsLine {
    episode_index: EpisodeId,
    stats: StatisticRecord,
}

#[derive(Serialize)]
struct EpisodeStatsLineRef<'a> {
    episode_index: EpisodeId,
    stats: &'a StatisticRecord,
}

/// Reads and writes datasets laid out on the local filesystem.
#[derive(Debug, Default, Clone, Copy)]
pub struct LocalDatasetStore;

impl LocalDatasetStore {
    pub fn new() -> Self {
        Self
    }
}

impl DatasetStore for LocalDatasetStore {
    fn load_manifest(&self, root: &Path) -> Result<Manifest, StorageError> {
        let path = root.join(INFO_PATH);
        let bytes = fs::read(&path).map_err(|err| StorageError::io(&path, err))?;
        serde_json::from_slice(&bytes).map_err(|err| StorageError::Malformed {
            line: err.line(),
            reason: err.to_string(),
            path,
        })
    }

    fn load_episode_table(&self, root: &Path) -> Result<EpisodeTable, StorageError> {
        let path = root.join(EPISODES_PATH);
        let mut table = EpisodeTable::new();
        for descriptor in read_json_lines::<EpisodeDescriptor>(&path)? {
            let episode = descriptor.episode_index;
            if table.insert(episode, descriptor).is_some() {
                return Err(StorageError::DuplicateEpisode { path, episode });
            }
        }
        Ok(table)
    }

    fn load_statistic_table(&self, root: &Path) -> Result<StatisticTable, StorageError> {
        let path = root.join(EPISODES_STATS_PATH);
        let mut table = StatisticTable::new();
        for line in read_json_lines::<EpisodeStatsLine>(&path)? {
            let episode = line.episode_index;
            if table.insert(episode, line.stats).is_some() {
                return Err(StorageError::DuplicateEpisode { path, episode });
            }
        }
        Ok(table)
    }

    fn copy_repository(
        &self,
        source: &Path,
        destination: &Path,
        plan: &CopyPlan,
    ) -> Result<CopyReport, StorageError> {
        ensure_disjoint(source, destination)?;
        let episode_files = plan.episode_files()?;

        if destination.exists() {
            fs::remove_dir_all(destination).map_err(|err| StorageError::io(destination, err))?;
        }
        fs::create_dir_all(destination).map_err(|err| StorageError::io(destination, err))?;

        let mut report = CopyReport::default();
        for rel in &episode_files {
            report.bytes_copied += copy_file(&source.join(rel), &destination.join(rel))?;
            report.episode_files += 1;
        }

        let episode_roots = plan.episode_roots();
        let walker = WalkBuilder::new(source)
            .standard_filters(false)
            .follow_links(false)
            .filter_entry(|entry| {
                entry
                    .file_name()
                    .to_str()
                    .map_or(true, |name| !SKIP_DIRS.contains(&name))
            })
            .build();

        for entry in walker {
            let entry = entry?;
            if !entry.file_type().is_some_and(|kind| kind.is_file()) {
                continue;
            }
            let path = entry.path();
            let Ok(rel) = path.strip_prefix(source) else {
                continue;
            };
            if is_episode_owned(rel, &episode_roots) || is_generated_metadata(rel) {
                continue;
            }
            report.bytes_copied += copy_file(path, &destination.join(rel))?;
            report.auxiliary_files += 1;
        }

        Ok(report)
    }

    fn delete_stale_metadata_artifacts(&self, destination: &Path) -> Result<(), StorageError> {
        for rel in GENERATED_METADATA {
            let path = destination.join(rel);
            match fs::remove_file(&path) {
                Ok(()) => {}
                Err(err) if err.kind() == ErrorKind::NotFound => {}
                Err(err) => return Err(StorageError::io(path, err)),
            }
        }
        Ok(())
    }

    fn write_manifest(&self, manifest: &Manifest, destination: &Path) -> Result<(), StorageError> {
        let payload = render_json_document(manifest)?;
        write_atomic(&destination.join(INFO_PATH), &payload)
    }

    fn write_episode_descriptor(
        &self,
        descriptor: &EpisodeDescriptor,
        destination: &Path,
    ) -> Result<(), StorageError> {
        append_json_line(&destination.join(EPISODES_PATH), descriptor)
    }

    fn write_statistic_record(
        &self,
        episode: EpisodeId,
        record: &StatisticRecord,
        destination: &Path,
    ) -> Result<(), StorageError> {
        append_json_line(
            &destination.join(EPISODES_STATS_PATH),
            &EpisodeStatsLineRef {
                episode_index: episode,
                stats: record,
            },
        )
    }

    fn write_dataset_statistic(
        &self,
        record: &StatisticRecord,
        destination: &Path,
    ) -> Result<(), StorageError> {
        let payload = render_json_document(record)?;
        write_atomic(&destination.join(STATS_PATH), &payload)
    }
}

fn read_json_lines<T: DeserializeOwned>(path: &Path) -> Result<Vec<T>, StorageError> {
    let content = fs::read_to_string(path).map_err(|err| StorageError::io(path, err))?;
    let mut rows = Vec::new();
    for (idx, line) in content.lines().enumerate() {
        let line = line.trim();
        if line.is_empty() {
            continue;
        }
        let row = serde_json::from_str(line).map_err(|err| StorageError::Malformed {
            path: path.to_path_buf(),
            line: idx + 1,
            reason: err.to_string(),
        })?;
        rows.push(row);
    }
    Ok(rows)
}

fn append_json_line<T: Serialize>(path: &Path, value: &T) -> Result<(), StorageError> {
    if let Some(parent) = path.parent() {
        fs::create_dir_all(parent).map_err(|err| StorageError::io(parent, err))?;
    }
    let mut line =
        serde_json::to_string(value).map_err(|err| StorageError::Serialization(err.to_string()))?;
    line.push('\n');
    let mut file = OpenOptions::new()
        .create(true)
        .append(true)
        .open(path)
        .map_err(|err| StorageError::io(path, err))?;
    file.write_all(line.as_bytes())
        .map_err(|err| StorageError::io(path, err))
}

fn write_atomic(path: &Path, payload: &[u8]) -> Result<(), StorageError> {
    if let Some(parent) = path.parent() {
        fs::create_dir_all(parent).map_err(|err| StorageError::io(parent, err))?;
    }

    let temp_path = match path.file_name() {
        Some(name) => path.with_file_name(format!("{}.tmp", name.to_string_lossy())),
        None => path.with_extension("tmp"),
    };

    fs::write(&temp_path, payload).map_err(|err| StorageError::io(&temp_path, err))?;
    fs::rename(&temp_path, path).map_err(|err| StorageError::io(path, err))
}

fn copy_file(from: &Path, to: &Path) -> Result<u64, StorageError> {
    if let Some(parent) = to.parent() {
        fs::create_dir_all(parent).map_err(|err| StorageError::io(parent, err))?;
    }
    fs::copy(from, to).map_err(|err| StorageError::io(from, err))
}

fn is_episode_owned(rel: &Path, episode_roots: &[String]) -> bool {
    let Some(Component::Normal(head)) = rel.components().next() else {
        return false;
    };
    // a file sitting directly at the top level is never episode-owned
    if rel.components().count() < 2 {
        return false;
    }
    head.to_str()
        .is_some_and(|head| episode_roots.iter().any(|root| root == head))
}

fn is_generated_metadata(rel: &Path) -> bool {
    GENERATED_METADATA
        .iter()
        .any(|generated| rel == Path::new(generated))
}

/// Refuses copies that would delete or recurse into the source.
fn ensure_disjoint(source: &Path, destination: &Path) -> Result<(), StorageError> {
    let source = fs::canonicalize(source).map_err(|err| StorageError::io(source, err))?;
    let resolved = resolve_path(destination)?;
    if source.starts_with(&resolved) || resolved.starts_with(&source) {
        return Err(StorageError::DestinationIsSource(destination.to_path_buf()));
    }
    Ok(())
}

/// Canonical form of a path whose trailing components may not exist yet.
/// The deepest existing ancestor is canonicalized and the rest is applied
/// lexically, `..` included.
fn resolve_path(path: &Path) -> Result<PathBuf, StorageError> {
    let absolute = if path.is_absolute() {
        path.to_path_buf()
    } else {
        std::env::current_dir()
            .map_err(|err| StorageError::io(path, err))?
            .join(path)
    };

    for ancestor in absolute.ancestors() {
        let Ok(mut resolved) = fs::canonicalize(ancestor) else {
            continue;
        };
        let Ok(rest) = absolute.strip_prefix(ancestor) else {
            continue;
        };
        for component in rest.components() {
            match component {
                Component::ParentDir => {
                    resolved.pop();
                }
                Component::Normal(name) => resolved.push(name),
                _ => {}
            }
        }
        return Ok(resolved);
    }
    Ok(absolute)
}
