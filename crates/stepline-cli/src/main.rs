//! stepline - incremental GitHub issue extraction
//!
//! Pages through a repository's issues in concurrent batches, writes each batch
//! as a CSV file, and checkpoints progress so reruns only fetch what changed.

use std::process::ExitCode;
use std::sync::Arc;

use anyhow::Result;
use clap::{Parser, Subcommand};

mod cmd;
mod config;

use config::Config;

/// Exit status for invalid configuration
const EXIT_CONFIG: u8 = 2;

#[derive(Parser)]
#[command(name = "stepline")]
#[command(about = "Incremental, watermark-checkpointed GitHub issue extraction")]
#[command(version)]
struct Cli {
    #[command(subcommand)]
    command: Command,

    /// Enable debug logging
    #[arg(long, global = true)]
    debug: bool,

    /// Config file path (default: ./stepline.toml or ~/.config/stepline/config.toml)
    #[arg(short, long, global = true)]
    config: Option<std::path::PathBuf>,

    /// Read timeout in seconds
    #[arg(long, global = true)]
    read_timeout: Option<u64>,

    /// Maximum attempts per page, including the first
    #[arg(long, global = true)]
    max_attempts: Option<u32>,
}

#[derive(Subcommand)]
enum Command {
    /// Fetch issues updated since the stored watermark
    Extract(cmd::extract::ExtractArgs),
    /// Show the stored watermark and written batch files
    Status(cmd::status::StatusArgs),
    /// Show current configuration
    Config,
}

fn main() -> Result<ExitCode> {
    let cli = Cli::parse();

    // Progress context (TTY auto-detect)
    let progress = Arc::new(stepline_core::ProgressContext::new());

    // Logging:
    //   TTY:     quiet (warn) unless --debug, the spinner shows activity
    //   non-TTY: info unless --debug, logs are the only progress indicator
    let is_tty = progress.is_tty();
    let multi = if is_tty { Some(progress.multi()) } else { None };
    let quiet = is_tty && !cli.debug;
    stepline_core::init_logging(quiet, cli.debug, multi);

    let loaded = match &cli.config {
        Some(path) => Config::from_file(path),
        None => Config::load(),
    };
    let mut config = match loaded {
        Ok(config) => config,
        Err(e) => {
            log::error!("{e:#}");
            return Ok(ExitCode::from(EXIT_CONFIG));
        }
    };

    // CLI overrides
    if let Some(secs) = cli.read_timeout {
        config.http.read_timeout = secs;
    }
    if let Some(attempts) = cli.max_attempts {
        config.retry.max_attempts = attempts;
    }

    match cli.command {
        Command::Extract(args) => cmd::extract::run(args, config, &progress),
        Command::Status(args) => cmd::status::run(args, config).map(|()| ExitCode::SUCCESS),
        Command::Config => {
            print_config(&config);
            Ok(ExitCode::SUCCESS)
        }
    }
}

fn print_config(config: &Config) {
    use comfy_table::{Cell, Color, Table, modifiers::UTF8_ROUND_CORNERS, presets::UTF8_FULL};

    let mut table = Table::new();
    table
        .load_preset(UTF8_FULL)
        .apply_modifier(UTF8_ROUND_CORNERS)
        .set_header(vec![
            Cell::new("Setting").fg(Color::Cyan),
            Cell::new("Value").fg(Color::Cyan),
        ]);

    let unset = |s: &str| {
        if s.is_empty() {
            "(not set)".to_string()
        } else {
            s.to_string()
        }
    };
    table.add_row(vec!["API URL", &config.github.api_url]);
    table.add_row(vec!["Repository owner", &unset(&config.github.owner)]);
    table.add_row(vec!["Repository name", &unset(&config.github.repo)]);
    table.add_row(vec![
        "Token",
        if config.github.token.as_deref().is_some_and(|t| !t.is_empty()) {
            "configured"
        } else {
            "not set"
        },
    ]);
    table.add_row(vec![
        "Step size",
        &format!("{} pages", config.extract.step_size),
    ]);
    table.add_row(vec!["Per page", &config.extract.per_page.to_string()]);
    table.add_row(vec!["Default since", &config.extract.default_since]);
    table.add_row(vec![
        "Give up after",
        &format!(
            "{} fully failed batches",
            config.extract.max_consecutive_failed_batches
        ),
    ]);
    table.add_row(vec![
        "Retry",
        &format!(
            "{} attempts, {}ms..{}ms (+{}ms jitter), server waits up to {}ms",
            config.retry.max_attempts,
            config.retry.base_delay_ms,
            config.retry.max_delay_ms,
            config.retry.jitter_ms,
            config.retry.max_hint_ms
        ),
    ]);
    table.add_row(vec![
        "Timeouts",
        &format!(
            "connect {}s, read {}s",
            config.http.connect_timeout, config.http.read_timeout
        ),
    ]);
    table.add_row(vec![
        "Output directory",
        &config.artifact_dir().display().to_string(),
    ]);
    table.add_row(vec![
        "State file",
        &config.state_path().display().to_string(),
    ]);

    eprintln!("\n{table}");
}
