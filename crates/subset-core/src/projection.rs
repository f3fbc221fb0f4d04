use crate::stats::StatisticRecord;
use crate::{EpisodeId, EpisodeSelection, EpisodeTable, StatisticTable};
use std::fmt;
use thiserror::Error;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum EpisodeTableKind {
    Descriptors,
    Statistics,
}

impl EpisodeTableKind {
    pub fn as_str(&self) -> &'static str {
        match self {
            EpisodeTableKind::Descriptors => "episode table",
            EpisodeTableKind::Statistics => "episode statistics table",
        }
    }
}

impl fmt::Display for EpisodeTableKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

#[derive(Debug, Error, PartialEq, Eq)]
pub enum ProjectionError {
    #[error("episode {episode} is missing from the source {table}")]
    MissingEpisode {
        episode: EpisodeId,
        table: EpisodeTableKind,
    },
}

/// Descriptor and statistic tables restricted to a selection. Both tables
/// hold exactly the same identifiers.
#[derive(Debug, Clone, PartialEq)]
pub struct ProjectedEpisodes {
    pub episodes: EpisodeTable,
    pub statistics: StatisticTable,
}

impl ProjectedEpisodes {
    pub fn len(&self) -> usize {
        self.episodes.len()
    }

    pub fn is_empty(&self) -> bool {
        self.episodes.is_empty()
    }

    pub fn total_frames(&self) -> u64 {
        self.episodes.values().map(|episode| episode.length).sum()
    }

    pub fn statistic_records(&self) -> impl Iterator<Item = &StatisticRecord> {
        self.statistics.values()
    }
}

pub fn project_episodes(
    descriptors: &EpisodeTable,
    statistics: &StatisticTable,
    selection: &EpisodeSelection,
) -> Result<ProjectedEpisodes, ProjectionError> {
    let mut projected = ProjectedEpisodes {
        episodes: EpisodeTable::new(),
        statistics: StatisticTable::new(),
    };

    for episode in selection.ids() {
        let descriptor = descriptors
            .get(&episode)
            .ok_or(ProjectionError::MissingEpisode {
                episode,
                table: EpisodeTableKind::Descriptors,
            })?;
        let record = statistics
            .get(&episode)
            .ok_or(ProjectionError::MissingEpisode {
                episode,
                table: EpisodeTableKind::Statistics,
            })?;
        projected.episodes.insert(episode, descriptor.clone());
        projected.statistics.insert(episode, record.clone());
    }

    Ok(projected)
}
