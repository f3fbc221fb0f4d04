mod config;
mod hub;

use anyhow::{anyhow, Context, Result};
use clap::Parser;
use config::ConfigLayer;
use hub::HubCliPublisher;
use std::path::PathBuf;
use subset_engine::{default_dataset_home, SubsetRunner};
use subset_storage::LocalDatasetStore;
use tracing::error;
use tracing_subscriber::EnvFilter;

#[derive(Parser, Debug)]
#[command(name = "dataset-subset")]
#[command(about = "Keep the first K episodes of a LeRobot dataset", long_about = None)]
struct Cli {
    /// TOML file with default settings; flags override it
    #[arg(long)]
    config: Option<PathBuf>,
    #[arg(long)]
    src_repo_id: Option<String>,
    #[arg(long)]
    dst_repo_id: Option<String>,
    /// Number of leading episodes to keep
    #[arg(long)]
    keep_first: Option<usize>,
    /// Source dataset directory
    #[arg(long)]
    root: Option<PathBuf>,
    /// Destination directory
    #[arg(long)]
    dst_root: Option<PathBuf>,
    #[arg(long, value_name = "BOOL")]
    push_to_hub: Option<bool>,
    #[arg(long, value_name = "BOOL")]
    private: Option<bool>,
    #[arg(long)]
    branch: Option<String>,
    /// Directory holding datasets by repo id
    #[arg(long, env = "HF_LEROBOT_HOME")]
    dataset_home: Option<PathBuf>,
    /// Derive and print the plan without writing anything
    #[arg(long)]
    dry_run: bool,
    /// Print the report as JSON
    #[arg(long)]
    json: bool,
    #[arg(long)]
    debug: bool,
}

impl Cli {
    fn overrides(&self) -> ConfigLayer {
        ConfigLayer {
            src_repo_id: self.src_repo_id.clone(),
            dst_repo_id: self.dst_repo_id.clone(),
            keep_first: self.keep_first,
            root: self.root.clone(),
            dst_root: self.dst_root.clone(),
            push_to_hub: self.push_to_hub,
            private: self.private,
            branch: self.branch.clone(),
        }
    }
}

fn main() -> Result<()> {
    let cli = Cli::parse();
    init_logging(cli.debug);

    let file_layer = match &cli.config {
        Some(path) => ConfigLayer::load(path)?,
        None => ConfigLayer::default(),
    };
    let config = file_layer.overlay(cli.overrides()).into_subset_config()?;
    let dataset_home = resolve_dataset_home(cli.dataset_home.clone())?;

    let store = LocalDatasetStore::new();
    let publisher = HubCliPublisher::default();
    let runner = SubsetRunner::new(&store, dataset_home).with_publisher(&publisher);

    if cli.dry_run {
        let plan = runner.plan(&config).context("Failed to plan subset")?;
        let files = plan
            .copy_plan()
            .episode_files()
            .context("Failed to render episode paths")?;
        if cli.json {
            println!("{}", serde_json::to_string_pretty(&plan.manifest)?);
        } else {
            println!("source:      {}", plan.roots.source.display());
            println!("destination: {}", plan.roots.destination.display());
            println!(
                "episodes {}  frames {}  chunks {}  videos {}  files {}",
                plan.manifest.total_episodes,
                plan.manifest.total_frames,
                plan.manifest.total_chunks,
                plan.manifest.total_videos,
                files.len()
            );
        }
        return Ok(());
    }

    let report = match runner.run(&config) {
        Ok(report) => report,
        Err(err) => {
            error!(
                event = "subset_failed",
                stage = err.stage().map(|stage| stage.as_str()).unwrap_or("none"),
                error = %err
            );
            return Err(err).context("Subset failed");
        }
    };

    if cli.json {
        println!("{}", serde_json::to_string_pretty(&report)?);
    } else {
        println!(
            "Wrote {} episodes ({} frames) to {}",
            report.total_episodes,
            report.total_frames,
            report.destination.display()
        );
        println!(
            "Copied {} episode files and {} other files ({} bytes)",
            report.copy.episode_files, report.copy.auxiliary_files, report.copy.bytes_copied
        );
        if report.published {
            println!("Published to {}", config.dst_repo_id);
        }
    }
    Ok(())
}

fn resolve_dataset_home(explicit: Option<PathBuf>) -> Result<PathBuf> {
    if let Some(home) = explicit {
        return Ok(home);
    }
    dirs::cache_dir()
        .map(|cache| default_dataset_home(&cache))
        .ok_or_else(|| anyhow!("Could not determine a cache directory; pass --dataset-home"))
}

fn init_logging(debug: bool) {
    let level = if debug {
        "debug".to_string()
    } else if let Ok(level) = std::env::var("SUBSET_LOG_LEVEL") {
        level
    } else {
        "info".to_string()
    };
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(level));
    let _ = tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_writer(std::io::stderr)
        .try_init();
}
