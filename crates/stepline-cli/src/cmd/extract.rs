//! Extract subcommand

use std::path::PathBuf;
use std::process::ExitCode;
use std::sync::atomic::Ordering;

use anyhow::{Context, Result};
use clap::Args;
use stepline_core::{
    ArtifactStore, CsvSink, ExtractionController, ExtractionResult, ExtractionSettings,
    FileWatermarkStore, LocalDirStore, MemoryArtifactStore, MemoryWatermarkStore, PageSource,
    SharedProgress, TerminationReason, WatermarkStore, cleanup_tmp_files, fmt_num, shutdown_flag,
};
use stepline_github::GithubIssuesSource;

use super::print_summary;
use crate::EXIT_CONFIG;
use crate::config::Config;

#[derive(Args, Debug)]
pub struct ExtractArgs {
    /// Repository owner (overrides [github].owner)
    #[arg(long)]
    pub owner: Option<String>,

    /// Repository name (overrides [github].repo)
    #[arg(long)]
    pub repo: Option<String>,

    /// Output directory (overrides [output].dir)
    #[arg(short, long)]
    pub output: Option<PathBuf>,

    /// Pages fetched concurrently per batch
    #[arg(long)]
    pub step_size: Option<u32>,

    /// Issues per page (1-100)
    #[arg(long)]
    pub per_page: Option<u32>,

    /// Starting watermark when no state file exists (RFC 3339)
    #[arg(long)]
    pub since: Option<String>,

    /// Stop after N batches
    #[arg(long)]
    pub max_batches: Option<u32>,

    /// Fetch without writing batch files or the state file
    #[arg(long)]
    pub dry_run: bool,
}

impl ExtractArgs {
    fn apply(&self, config: &mut Config) {
        if let Some(owner) = &self.owner {
            config.github.owner = owner.clone();
        }
        if let Some(repo) = &self.repo {
            config.github.repo = repo.clone();
        }
        if let Some(dir) = &self.output {
            config.output.dir = dir.clone();
        }
        if let Some(step) = self.step_size {
            config.extract.step_size = step;
        }
        if let Some(per_page) = self.per_page {
            config.extract.per_page = per_page;
        }
        if let Some(since) = &self.since {
            config.extract.default_since = since.clone();
        }
    }
}

/// Register SIGINT/SIGTERM: the first stops after the current batch, the second exits.
fn install_signal_handlers() -> Result<()> {
    for signal in [signal_hook::consts::SIGINT, signal_hook::consts::SIGTERM] {
        // SAFETY: AtomicBool::swap and process::exit are async-signal-safe
        unsafe {
            signal_hook::low_level::register(signal, || {
                if shutdown_flag().swap(true, Ordering::Relaxed) {
                    std::process::exit(130);
                }
            })
        }
        .with_context(|| format!("Failed to register handler for signal {signal}"))?;
    }
    Ok(())
}

fn exit_status(reason: TerminationReason) -> u8 {
    match reason {
        TerminationReason::EndOfData | TerminationReason::BatchLimit => 0,
        TerminationReason::TooManyFailures => 1,
        TerminationReason::Interrupted => 130,
    }
}

pub fn run(args: ExtractArgs, mut config: Config, progress: &SharedProgress) -> Result<ExitCode> {
    args.apply(&mut config);
    let github = config.github_settings();
    let settings = config.extraction_settings(args.max_batches);

    let source = match github
        .validate(settings.per_page)
        .and_then(|()| settings.validate())
        .and_then(|()| GithubIssuesSource::new(&github))
    {
        Ok(source) => source,
        Err(e) => {
            log::error!("{e}");
            return Ok(ExitCode::from(EXIT_CONFIG));
        }
    };

    install_signal_handlers()?;

    let artifact_dir = config.artifact_dir();
    if !args.dry_run {
        let removed = cleanup_tmp_files(&artifact_dir)
            .with_context(|| format!("Cannot clean {}", artifact_dir.display()))?;
        if removed > 0 {
            log::info!("Removed {removed} stale tmp files");
        }
    }

    log::info!("Extracting issues of {}", github.slug());
    log::info!("  Output: {}", artifact_dir.display());
    log::info!("  State: {}", config.state_path().display());

    let state = FileWatermarkStore::new(config.state_path());
    let result = if args.dry_run {
        log::info!("Dry run: nothing will be written");
        let store = dry_run_store(&state);
        let sink = CsvSink::new(MemoryArtifactStore::new(), &config.output.prefix);
        extract(source, store, sink, &settings, progress)?
    } else {
        let sink = CsvSink::new(LocalDirStore::new(&config.output.dir), &config.output.prefix);
        extract(source, state, sink, &settings, progress)?
    };

    report(&result);
    println!(
        "{}",
        serde_json::to_string_pretty(&result).context("Cannot encode result")?
    );
    Ok(ExitCode::from(exit_status(result.terminated_reason)))
}

/// In-memory copy of the persisted watermark for dry runs
fn dry_run_store(state: &FileWatermarkStore) -> MemoryWatermarkStore {
    match state.read() {
        Ok(Some(w)) => MemoryWatermarkStore::with_value(w),
        Ok(None) => MemoryWatermarkStore::new(),
        Err(e) => {
            log::error!(
                "cannot read watermark at {}: {e}; dry run starts from the default",
                state.location()
            );
            MemoryWatermarkStore::new()
        }
    }
}

fn extract<W: WatermarkStore, A: ArtifactStore>(
    source: GithubIssuesSource,
    store: W,
    sink: CsvSink<A>,
    settings: &ExtractionSettings,
    progress: &SharedProgress,
) -> Result<ExtractionResult> {
    let target = source.target();
    let mut controller = ExtractionController::new(source, store, sink, settings)?
        .with_progress(progress.stage_line(&target));
    Ok(controller.run())
}

fn report(result: &ExtractionResult) {
    print_summary(
        "Extraction",
        &[
            ("Repository", result.target.clone()),
            ("Records saved", fmt_num(result.total_saved)),
            ("Batches", result.batches.to_string()),
            ("Failed pages", result.failed_pages.to_string()),
            ("Watermark", result.final_watermark.to_string()),
            ("Stopped", result.terminated_reason.to_string()),
            ("Storage", result.storage.clone()),
        ],
    );
}
