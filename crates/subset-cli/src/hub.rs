use std::ffi::OsString;
use std::path::Path;
use std::process::Command;
use subset_engine::{PublishError, PublishOptions, Publisher, Visibility};
use tracing::{debug, info};

const DEFAULT_PROGRAM: &str = "huggingface-cli";

/// Publishes through the `huggingface-cli` binary, which carries its own
/// token handling and retries.
#[derive(Debug, Clone)]
pub struct HubCliPublisher {
    program: String,
}

impl Default for HubCliPublisher {
    fn default() -> Self {
        Self::new(DEFAULT_PROGRAM)
    }
}

impl HubCliPublisher {
    pub fn new(program: impl Into<String>) -> Self {
        Self {
            program: program.into(),
        }
    }

    fn run(&self, action: &str, args: Vec<OsString>) -> Result<(), PublishError> {
        debug!(event = "hub_command", program = %self.program, action, ?args);
        let output = Command::new(&self.program)
            .args(&args)
            .output()
            .map_err(|source| PublishError::Launch {
                program: self.program.clone(),
                source,
            })?;
        if !output.status.success() {
            let mut message = String::from_utf8_lossy(&output.stderr).trim().to_string();
            if message.is_empty() {
                message = String::from_utf8_lossy(&output.stdout).trim().to_string();
            }
            return Err(PublishError::Failed {
                program: self.program.clone(),
                action: action.to_string(),
                status: output.status.to_string(),
                stderr: message,
            });
        }
        Ok(())
    }

    /// Drops `tag` from the repo so it can be recreated on the new revision.
    /// A tag that does not exist yet is not an error.
    fn clear_tag(&self, repo_id: &str, tag: &str) -> Result<(), PublishError> {
        match self.run("delete tag", delete_tag_args(repo_id, tag)) {
            Err(PublishError::Failed { stderr, .. }) if is_missing_tag(&stderr) => {
                debug!(event = "hub_tag_absent", repo_id, tag);
                Ok(())
            }
            other => other,
        }
    }
}

impl Publisher for HubCliPublisher {
    fn publish(
        &self,
        root: &Path,
        repo_id: &str,
        options: &PublishOptions,
    ) -> Result<(), PublishError> {
        info!(event = "hub_upload_start", repo_id, root = %root.display());
        self.run("upload", upload_args(root, repo_id, options))?;
        if let Some(tag) = &options.tag {
            self.clear_tag(repo_id, tag)?;
            self.run("tag", tag_args(repo_id, tag, options))?;
        }
        Ok(())
    }
}

fn upload_args(root: &Path, repo_id: &str, options: &PublishOptions) -> Vec<OsString> {
    let mut args: Vec<OsString> = vec![
        "upload".into(),
        repo_id.into(),
        root.as_os_str().to_owned(),
        ".".into(),
        "--repo-type".into(),
        "dataset".into(),
    ];
    if let Some(branch) = &options.branch {
        args.push("--revision".into());
        args.push(branch.into());
    }
    if options.visibility == Visibility::Private {
        args.push("--private".into());
    }
    args
}

fn tag_args(repo_id: &str, tag: &str, options: &PublishOptions) -> Vec<OsString> {
    let mut args: Vec<OsString> = vec![
        "tag".into(),
        repo_id.into(),
        tag.into(),
        "--repo-type".into(),
        "dataset".into(),
    ];
    if let Some(branch) = &options.branch {
        args.push("--revision".into());
        args.push(branch.into());
    }
    args
}

fn delete_tag_args(repo_id: &str, tag: &str) -> Vec<OsString> {
    ["tag", repo_id, tag, "--repo-type", "dataset", "-d", "-y"]
        .into_iter()
        .map(OsString::from)
        .collect()
}

fn is_missing_tag(message: &str) -> bool {
    let message = message.to_ascii_lowercase();
    message.contains("not found") || message.contains("does not exist")
}

#[cfg(test)]
mod tests {
    use super::*;

    fn options(branch: Option<&str>, visibility: Visibility) -> PublishOptions {
        PublishOptions {
            branch: branch.map(str::to_string),
            visibility,
            tag: Some("v2.1".to_string()),
        }
    }

    #[test]
    fn upload_args_carry_branch_and_visibility() {
        let args = upload_args(
            Path::new("/data/lab/subset"),
            "lab/subset",
            &options(Some("trimmed"), Visibility::Private),
        );
        assert_eq!(
            args,
            vec![
                "upload",
                "lab/subset",
                "/data/lab/subset",
                ".",
                "--repo-type",
                "dataset",
                "--revision",
                "trimmed",
                "--private",
            ]
            .into_iter()
            .map(OsString::from)
            .collect::<Vec<_>>()
        );
    }

    #[test]
    fn public_upload_on_default_branch_has_no_extras() {
        let args = upload_args(
            Path::new("out"),
            "lab/subset",
            &options(None, Visibility::Public),
        );
        assert_eq!(args.len(), 6);
        let args = tag_args("lab/subset", "v2.1", &options(None, Visibility::Public));
        assert_eq!(args.last(), Some(&OsString::from("dataset")));
    }

    #[test]
    fn existing_tag_is_deleted_without_prompting() {
        assert_eq!(
            delete_tag_args("lab/subset", "v2.1"),
            ["tag", "lab/subset", "v2.1", "--repo-type", "dataset", "-d", "-y"]
                .into_iter()
                .map(OsString::from)
                .collect::<Vec<_>>()
        );
    }

    #[test]
    fn only_a_missing_tag_is_tolerated_on_delete() {
        assert!(is_missing_tag("Tag v2.1 not found on 'lab/subset'"));
        assert!(is_missing_tag("404 Client Error: Revision Not Found"));
        assert!(!is_missing_tag("401 Unauthorized: invalid token"));
    }

    #[test]
    fn missing_program_is_a_launch_error() {
        let publisher = HubCliPublisher::new("dataset-subset-no-such-binary");
        let err = publisher
            .publish(
                Path::new("."),
                "lab/subset",
                &options(None, Visibility::Public),
            )
            .expect_err("launch");
        assert!(matches!(err, PublishError::Launch { .. }));
    }
}
