use crate::StorageError;
use regex::{Captures, Regex};
use std::sync::OnceLock;
use subset_core::EpisodeId;

/// Values substituted into `data_path` / `video_path` templates such as
/// `data/chunk-{episode_chunk:03d}/episode_{episode_index:06d}.parquet`.
#[derive(Debug, Clone, Copy)]
pub struct TemplateVars<'a> {
    pub episode_chunk: usize,
    pub episode_index: EpisodeId,
    pub video_key: Option<&'a str>,
}

fn placeholder_regex() -> &'static Regex {
    static PLACEHOLDER: OnceLock<Regex> = OnceLock::new();
    PLACEHOLDER.get_or_init(|| {
        Regex::new(r"\{([A-Za-z_][A-Za-z0-9_]*)(?::(0?)([0-9]+)d)?\}").expect("valid regex")
    })
}

pub fn render_path_template(template: &str, vars: &TemplateVars<'_>) -> Result<String, StorageError> {
    let mut failure: Option<String> = None;
    let rendered = placeholder_regex().replace_all(template, |caps: &Captures<'_>| {
        let name = &caps[1];
        let value = match name {
            "episode_chunk" => Some(vars.episode_chunk.to_string()),
            "episode_index" => Some(vars.episode_index.to_string()),
            "video_key" => vars.video_key.map(str::to_string),
            _ => None,
        };
        let Some(value) = value else {
            failure.get_or_insert_with(|| format!("no value for placeholder {{{name}}}"));
            return String::new();
        };
        let width = caps
            .get(3)
            .and_then(|width| width.as_str().parse::<usize>().ok())
            .unwrap_or(0);
        let zero_pad = caps.get(2).is_some_and(|flag| !flag.as_str().is_empty());
        if zero_pad {
            format!("{value:0>width$}")
        } else {
            format!("{value:>width$}")
        }
    });

    if let Some(reason) = failure {
        return Err(StorageError::Template {
            template: template.to_string(),
            reason,
        });
    }
    if rendered.contains('{') || rendered.contains('}') {
        return Err(StorageError::Template {
            template: template.to_string(),
            reason: "unsupported placeholder syntax".to_string(),
        });
    }
    Ok(rendered.into_owned())
}
