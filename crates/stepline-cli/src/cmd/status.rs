//! Status subcommand: stored watermark and batch files on disk

use std::path::{Path, PathBuf};

use anyhow::{Context, Result};
use clap::Args;
use stepline_core::{FileWatermarkStore, WatermarkStore, fmt_num};

use super::print_summary;
use crate::config::Config;

#[derive(Args, Debug)]
pub struct StatusArgs {
    /// Output directory (overrides [output].dir)
    #[arg(short, long)]
    pub output: Option<PathBuf>,
}

/// Batch files under `dir`, oldest name first
fn batch_files(dir: &Path) -> Result<Vec<PathBuf>> {
    let pattern = dir.join("issues_*_batch_*.csv");
    let pattern = pattern
        .to_str()
        .context("Output path is not valid UTF-8")?;
    let mut files: Vec<PathBuf> = glob::glob(pattern)
        .with_context(|| format!("Invalid glob pattern: {pattern}"))?
        .filter_map(|entry| entry.ok())
        .collect();
    files.sort();
    Ok(files)
}

pub fn run(args: StatusArgs, mut config: Config) -> Result<()> {
    if let Some(dir) = args.output {
        config.output.dir = dir;
    }
    let state_path = config.state_path();
    let watermark = match FileWatermarkStore::new(&state_path).read() {
        Ok(Some(w)) => w.to_string(),
        Ok(None) => format!("none (starts at {})", config.extract.default_since),
        Err(e) => format!("unreadable: {e}"),
    };

    let artifact_dir = config.artifact_dir();
    let files = batch_files(&artifact_dir)?;
    let total_bytes: u64 = files
        .iter()
        .filter_map(|f| std::fs::metadata(f).ok())
        .map(|m| m.len())
        .sum();

    let mut rows = vec![
        ("State file", state_path.display().to_string()),
        ("Watermark", watermark),
        ("Output", artifact_dir.display().to_string()),
        ("Batch files", fmt_num(files.len())),
        ("Total size", format!("{} bytes", fmt_num(total_bytes as usize))),
    ];
    if let Some(last) = files.last().and_then(|f| f.file_name()) {
        rows.push(("Latest", last.to_string_lossy().into_owned()));
    }
    print_summary("Status", &rows);
    Ok(())
}
