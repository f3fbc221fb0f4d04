use crate::publish::Visibility;
use crate::SubsetError;
use serde::Deserialize;
use std::path::{Path, PathBuf};

fn default_push_to_hub() -> bool {
    true
}

#[derive(Debug, Clone, PartialEq, Eq, Deserialize)]
pub struct SubsetConfig {
    pub src_repo_id: String,
    pub dst_repo_id: String,
    pub keep_first: usize,
    /// Source dataset directory; defaults to `<dataset home>/<src_repo_id>`.
    #[serde(default)]
    pub root: Option<PathBuf>,
    /// Destination directory; defaults to a sibling of the source named after `dst_repo_id`.
    #[serde(default)]
    pub dst_root: Option<PathBuf>,
    #[serde(default = "default_push_to_hub")]
    pub push_to_hub: bool,
    #[serde(default)]
    pub private: bool,
    #[serde(default)]
    pub branch: Option<String>,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct DatasetRoots {
    pub source: PathBuf,
    pub destination: PathBuf,
}

impl SubsetConfig {
    pub fn new(
        src_repo_id: impl Into<String>,
        dst_repo_id: impl Into<String>,
        keep_first: usize,
    ) -> Self {
        Self {
            src_repo_id: src_repo_id.into(),
            dst_repo_id: dst_repo_id.into(),
            keep_first,
            root: None,
            dst_root: None,
            push_to_hub: default_push_to_hub(),
            private: false,
            branch: None,
        }
    }

    pub fn visibility(&self) -> Visibility {
        Visibility::from_private(self.private)
    }

    pub fn validate(&self) -> Result<(), SubsetError> {
        if self.src_repo_id.trim().is_empty() {
            return Err(SubsetError::Config("src_repo_id cannot be empty".to_string()));
        }
        if self.dst_repo_id.trim().is_empty() {
            return Err(SubsetError::Config("dst_repo_id cannot be empty".to_string()));
        }
        if self.keep_first == 0 {
            return Err(SubsetError::EmptyManifest);
        }
        if let Some(branch) = &self.branch {
            if branch.trim().is_empty() {
                return Err(SubsetError::Config("branch cannot be blank".to_string()));
            }
        }
        Ok(())
    }

    pub fn resolve_roots(&self, dataset_home: &Path) -> DatasetRoots {
        let source = self
            .root
            .clone()
            .unwrap_or_else(|| dataset_home.join(&self.src_repo_id));
        let destination = match (&self.dst_root, &self.root) {
            (Some(dst_root), _) => dst_root.clone(),
            (None, Some(root)) => root
                .parent()
                .unwrap_or_else(|| Path::new("."))
                .join(&self.dst_repo_id),
            (None, None) => dataset_home.join(&self.dst_repo_id),
        };
        DatasetRoots {
            source,
            destination,
        }
    }
}
