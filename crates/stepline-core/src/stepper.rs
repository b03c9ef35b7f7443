//! Batch orchestration: a fixed window of pages fetched concurrently behind a barrier

use std::ops::Range;
use std::sync::Mutex;

use crate::error::SettingsError;
use crate::fetcher::{PageFetcher, PageOutcome, PageSource};
use crate::record::{Record, Watermark, max_updated_at};

/// One settled window of pages and its verdict.
#[derive(Debug, Clone, Default)]
pub struct Batch {
    pub pages: Range<u32>,
    /// Records from every `Data` page, in completion order
    pub records: Vec<Record>,
    /// At least one page ended `Failed`
    pub had_failure: bool,
    /// Some page hit the end, or came back short
    pub end_of_data: bool,
    pub max_record_timestamp: Option<Watermark>,
    pub failed_pages: Vec<u32>,
}

impl Batch {
    /// Reduce settled page outcomes into a batch verdict.
    pub fn from_outcomes(
        pages: Range<u32>,
        outcomes: impl IntoIterator<Item = (u32, PageOutcome)>,
    ) -> Self {
        let mut batch = Batch {
            pages,
            ..Batch::default()
        };
        for (page, outcome) in outcomes {
            match outcome {
                PageOutcome::Data { records, full } => {
                    batch.end_of_data |= !full;
                    batch.records.extend(records);
                }
                PageOutcome::EndOfData => batch.end_of_data = true,
                PageOutcome::Failed { .. } => {
                    batch.had_failure = true;
                    batch.failed_pages.push(page);
                }
            }
        }
        batch.failed_pages.sort_unstable();
        batch.max_record_timestamp = max_updated_at(&batch.records);
        batch
    }

    /// Every page in the window failed
    pub fn all_failed(&self) -> bool {
        !self.pages.is_empty() && self.failed_pages.len() == self.pages.len()
    }
}

/// Runs page windows on a worker pool sized to the step, reused across batches.
pub struct Stepper<S> {
    fetcher: PageFetcher<S>,
    pool: rayon::ThreadPool,
    step_size: u32,
}

impl<S: PageSource> Stepper<S> {
    pub fn new(fetcher: PageFetcher<S>, step_size: u32) -> Result<Self, SettingsError> {
        if step_size == 0 {
            return Err(SettingsError("step_size must be at least 1".into()));
        }
        let pool = rayon::ThreadPoolBuilder::new()
            .num_threads(step_size as usize)
            .thread_name(|i| format!("page-worker-{i}"))
            .build()
            .map_err(|e| SettingsError(format!("cannot build worker pool: {e}")))?;
        Ok(Self {
            fetcher,
            pool,
            step_size,
        })
    }

    pub fn step_size(&self) -> u32 {
        self.step_size
    }

    pub fn fetcher(&self) -> &PageFetcher<S> {
        &self.fetcher
    }

    /// Fetch pages `[start, start + step_size)` concurrently and wait for all of them.
    pub fn run_batch(&self, start: u32, since: &Watermark) -> Batch {
        let pages = start..start.saturating_add(self.step_size);
        let settled: Mutex<Vec<(u32, PageOutcome)>> =
            Mutex::new(Vec::with_capacity(self.step_size as usize));

        log::info!("launching batch: pages {}..={}", pages.start, pages.end - 1);
        self.pool.scope(|s| {
            for page in pages.clone() {
                let settled = &settled;
                let fetcher = &self.fetcher;
                s.spawn(move |_| {
                    let outcome = fetcher.fetch(page, since);
                    settled
                        .lock()
                        .expect("page worker panicked")
                        .push((page, outcome));
                });
            }
        });

        let settled = settled.into_inner().expect("page worker panicked");
        let batch = Batch::from_outcomes(pages, settled);
        if batch.had_failure {
            log::warn!("batch incomplete: pages {:?} failed", batch.failed_pages);
        }
        batch
    }
}
