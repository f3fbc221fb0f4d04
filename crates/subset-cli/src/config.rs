use anyhow::{bail, Context, Result};
use serde::Deserialize;
use std::fs;
use std::path::{Path, PathBuf};
use subset_engine::SubsetConfig;

/// Partial subset settings from a TOML file or the command line. Later
/// layers win field by field.
#[derive(Debug, Default, Clone, PartialEq, Eq, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct ConfigLayer {
    pub src_repo_id: Option<String>,
    pub dst_repo_id: Option<String>,
    pub keep_first: Option<usize>,
    pub root: Option<PathBuf>,
    pub dst_root: Option<PathBuf>,
    pub push_to_hub: Option<bool>,
    pub private: Option<bool>,
    pub branch: Option<String>,
}

impl ConfigLayer {
    pub fn load(path: &Path) -> Result<Self> {
        let content = fs::read_to_string(path)
            .with_context(|| format!("Failed to read config {}", path.display()))?;
        toml::from_str(&content)
            .with_context(|| format!("Failed to parse config {}", path.display()))
    }

    pub fn overlay(self, top: ConfigLayer) -> ConfigLayer {
        ConfigLayer {
            src_repo_id: top.src_repo_id.or(self.src_repo_id),
            dst_repo_id: top.dst_repo_id.or(self.dst_repo_id),
            keep_first: top.keep_first.or(self.keep_first),
            root: top.root.or(self.root),
            dst_root: top.dst_root.or(self.dst_root),
            push_to_hub: top.push_to_hub.or(self.push_to_hub),
            private: top.private.or(self.private),
            branch: top.branch.or(self.branch),
        }
    }

    pub fn into_subset_config(self) -> Result<SubsetConfig> {
        let Some(src_repo_id) = self.src_repo_id else {
            bail!("Missing src_repo_id (pass --src-repo-id or set it in the config file)");
        };
        let Some(dst_repo_id) = self.dst_repo_id else {
            bail!("Missing dst_repo_id (pass --dst-repo-id or set it in the config file)");
        };
        let Some(keep_first) = self.keep_first else {
            bail!("Missing keep_first (pass --keep-first or set it in the config file)");
        };

        let mut config = SubsetConfig::new(src_repo_id, dst_repo_id, keep_first);
        config.root = self.root;
        config.dst_root = self.dst_root;
        if let Some(push_to_hub) = self.push_to_hub {
            config.push_to_hub = push_to_hub;
        }
        config.private = self.private.unwrap_or(false);
        config.branch = self.branch;
        Ok(config)
    }
}
