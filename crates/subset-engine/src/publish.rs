use serde::Serialize;
use std::fmt;
use std::path::Path;
use thiserror::Error;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum Visibility {
    Public,
    Private,
}

impl Visibility {
    pub fn from_private(private: bool) -> Self {
        if private {
            Self::Private
        } else {
            Self::Public
        }
    }

    pub fn as_str(&self) -> &'static str {
        match self {
            Visibility::Public => "public",
            Visibility::Private => "private",
        }
    }
}

impl fmt::Display for Visibility {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PublishOptions {
    pub branch: Option<String>,
    pub visibility: Visibility,
    /// Tag attached to the uploaded revision, normally the codebase version.
    pub tag: Option<String>,
}

#[derive(Debug, Error)]
pub enum PublishError {
    #[error("failed to launch {program}: {source}")]
    Launch {
        program: String,
        #[source]
        source: std::io::Error,
    },
    #[error("{program} {action} exited with {status}: {stderr}")]
    Failed {
        program: String,
        action: String,
        status: String,
        stderr: String,
    },
}

/// Uploads a finished dataset directory to a remote repository.
pub trait Publisher {
    fn publish(
        &self,
        root: &Path,
        repo_id: &str,
        options: &PublishOptions,
    ) -> Result<(), PublishError>;
}
