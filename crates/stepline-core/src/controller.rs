//! Extraction control loop: batches, flushes, watermark commits, termination

use std::fmt;

use indicatif::ProgressBar;
use serde::Serialize;

use crate::error::SettingsError;
use crate::fetcher::{PageFetcher, PageSource};
use crate::progress::fmt_num;
use crate::record::Watermark;
use crate::retry::BackoffPolicy;
use crate::shutdown::is_shutdown_requested;
use crate::sink::{ArtifactStore, CsvSink};
use crate::stepper::{Batch, Stepper};
use crate::watermark::{WatermarkStore, read_or_default};

/// Knobs for one extraction run, validated before any network I/O.
#[derive(Debug, Clone)]
pub struct ExtractionSettings {
    /// Pages fetched concurrently per batch (also the worker count)
    pub step_size: u32,
    pub per_page: u32,
    /// Watermark used when the store holds none
    pub default_since: Watermark,
    pub backoff: BackoffPolicy,
    /// Stop after this many batches
    pub max_batches: Option<u32>,
    /// Consecutive batches with every page failed before giving up
    pub max_consecutive_failed_batches: u32,
}

impl Default for ExtractionSettings {
    fn default() -> Self {
        Self {
            step_size: 3,
            per_page: 100,
            default_since: Watermark::from("2024-01-01T00:00:00Z"),
            backoff: BackoffPolicy::default(),
            max_batches: None,
            max_consecutive_failed_batches: 3,
        }
    }
}

impl ExtractionSettings {
    pub fn validate(&self) -> Result<(), SettingsError> {
        if self.step_size == 0 {
            return Err(SettingsError("step_size must be at least 1".into()));
        }
        if self.per_page == 0 {
            return Err(SettingsError("per_page must be at least 1".into()));
        }
        if !self.default_since.is_timestamp() {
            return Err(SettingsError(format!(
                "default_since {:?} is not an RFC 3339 timestamp",
                self.default_since.as_str()
            )));
        }
        if self.max_batches == Some(0) {
            return Err(SettingsError("max_batches must be at least 1".into()));
        }
        if self.max_consecutive_failed_batches == 0 {
            return Err(SettingsError(
                "max_consecutive_failed_batches must be at least 1".into(),
            ));
        }
        self.backoff.validate()
    }
}

/// Why a run stopped.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum TerminationReason {
    EndOfData,
    Interrupted,
    BatchLimit,
    TooManyFailures,
}

impl fmt::Display for TerminationReason {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            Self::EndOfData => "end of data",
            Self::Interrupted => "interrupted",
            Self::BatchLimit => "batch limit reached",
            Self::TooManyFailures => "too many failed batches",
        };
        f.write_str(s)
    }
}

/// Summary of one run
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct ExtractionResult {
    pub target: String,
    pub total_saved: usize,
    pub final_watermark: Watermark,
    pub storage: String,
    pub terminated_reason: TerminationReason,
    pub batches: u32,
    pub failed_pages: usize,
}

type ShutdownCheck = Box<dyn Fn() -> bool + Send + Sync>;

/// Drives batches over advancing page windows until the data runs out.
///
/// The watermark only moves after a batch with no failed page whose records
/// were all flushed, so a crash or failure resumes from the last trusted point.
pub struct ExtractionController<S, W, A> {
    stepper: Stepper<S>,
    store: W,
    sink: CsvSink<A>,
    default_since: Watermark,
    max_batches: Option<u32>,
    max_consecutive_failed_batches: u32,
    progress: ProgressBar,
    shutdown: ShutdownCheck,
}

impl<S, W, A> ExtractionController<S, W, A>
where
    S: PageSource,
    W: WatermarkStore,
    A: ArtifactStore,
{
    pub fn new(
        source: S,
        store: W,
        sink: CsvSink<A>,
        settings: &ExtractionSettings,
    ) -> Result<Self, SettingsError> {
        settings.validate()?;
        let fetcher = PageFetcher::new(source, settings.per_page, settings.backoff);
        Self::with_fetcher(fetcher, store, sink, settings)
    }

    /// Build around a preconfigured fetcher (custom sleeper, shared source)
    pub fn with_fetcher(
        fetcher: PageFetcher<S>,
        store: W,
        sink: CsvSink<A>,
        settings: &ExtractionSettings,
    ) -> Result<Self, SettingsError> {
        settings.validate()?;
        Ok(Self {
            stepper: Stepper::new(fetcher, settings.step_size)?,
            store,
            sink,
            default_since: settings.default_since.clone(),
            max_batches: settings.max_batches,
            max_consecutive_failed_batches: settings.max_consecutive_failed_batches,
            progress: ProgressBar::hidden(),
            shutdown: Box::new(is_shutdown_requested),
        })
    }

    /// Report progress on this bar (see `ProgressContext::stage_line`)
    pub fn with_progress(mut self, progress: ProgressBar) -> Self {
        self.progress = progress;
        self
    }

    /// Replace the check polled after each batch barrier
    pub fn with_shutdown(mut self, check: impl Fn() -> bool + Send + Sync + 'static) -> Self {
        self.shutdown = Box::new(check);
        self
    }

    fn target(&self) -> String {
        self.stepper.fetcher().source().target()
    }

    /// Persist `watermark`; a failed write is logged and the run continues.
    fn commit(&self, watermark: &Watermark) {
        match self.store.write(watermark) {
            Ok(()) => log::info!("watermark committed: {watermark}"),
            Err(e) => log::error!(
                "watermark commit not confirmed at {}: {e}",
                self.store.location()
            ),
        }
    }

    /// Flush a settled batch and return (records written, trusted for the watermark)
    fn settle(&mut self, batch: &Batch) -> (usize, bool) {
        let written = if batch.records.is_empty() {
            0
        } else {
            self.sink.flush(&batch.records)
        };
        if batch.had_failure {
            log::warn!(
                "pages {:?} failed; watermark not advanced for this batch",
                batch.failed_pages
            );
            return (written, false);
        }
        if written < batch.records.len() {
            log::warn!(
                "flushed {written} of {} records; watermark not advanced for this batch",
                batch.records.len()
            );
            return (written, false);
        }
        (written, true)
    }

    /// Run until end of data, interruption, the batch limit, or a stuck upstream.
    pub fn run(&mut self) -> ExtractionResult {
        let target = self.target();
        let step = self.stepper.step_size();
        let start = read_or_default(&self.store, &self.default_since);
        self.sink
            .start_run(chrono::Local::now().format("%Y-%m-%d").to_string());
        log::info!(
            "extracting {target} since {start} (step {step}, {} per page)",
            self.stepper.fetcher().per_page()
        );

        let mut high_water = start.clone();
        let mut page = 1u32;
        let mut total_saved = 0usize;
        let mut batches = 0u32;
        let mut failed_pages = 0usize;
        let mut dead_streak = 0u32;

        let reason = loop {
            let batch = self.stepper.run_batch(page, &start);
            batches += 1;
            failed_pages += batch.failed_pages.len();

            let (written, trusted) = self.settle(&batch);
            total_saved += written;
            let advanced = batch
                .max_record_timestamp
                .as_ref()
                .filter(|max| trusted && **max > high_water);
            if let Some(max) = advanced {
                high_water = max.clone();
                self.commit(&high_water);
            }

            self.progress.set_message(format!(
                "pages {}..={} | {} saved | watermark {high_water}",
                batch.pages.start,
                batch.pages.end.saturating_sub(1),
                fmt_num(total_saved)
            ));

            if batch.end_of_data {
                break TerminationReason::EndOfData;
            }
            if batch.all_failed() {
                dead_streak += 1;
                if dead_streak >= self.max_consecutive_failed_batches {
                    log::error!(
                        "{dead_streak} consecutive batches failed on every page, giving up"
                    );
                    break TerminationReason::TooManyFailures;
                }
            } else {
                dead_streak = 0;
            }
            if self.max_batches.is_some_and(|limit| batches >= limit) {
                break TerminationReason::BatchLimit;
            }
            if (self.shutdown)() {
                log::warn!("shutdown requested, stopping after page {}", batch.pages.end - 1);
                break TerminationReason::Interrupted;
            }
            page = page.saturating_add(step);
        };

        if high_water > start {
            self.commit(&high_water);
        }
        self.progress.finish_and_clear();
        log::info!(
            "{target}: {reason}; {} records saved in {batches} batches, watermark {high_water}",
            fmt_num(total_saved)
        );

        ExtractionResult {
            target,
            total_saved,
            final_watermark: high_water,
            storage: self.sink.store().location(),
            terminated_reason: reason,
            batches,
            failed_pages,
        }
    }
}
