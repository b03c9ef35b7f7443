//! Single-page fetch with classification and retry

use std::sync::Arc;
use std::time::Duration;

use crate::error::TransportError;
use crate::http::RateLimit;
use crate::record::{Record, Watermark};
use crate::retry::{Attempt, BackoffPolicy, classify};

/// One paginated request. Immutable once issued.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PageRequest {
    /// 1-indexed
    pub page: u32,
    pub per_page: u32,
    pub since: Watermark,
}

/// Raw HTTP response for one page attempt
#[derive(Debug, Clone, Default)]
pub struct RawResponse {
    pub status: u16,
    pub body: String,
    pub rate_limit: RateLimit,
}

/// Executes one page request against the upstream resource.
///
/// Implementations carry their own credentials; the fetcher never sees them.
pub trait PageSource: Send + Sync {
    fn get_page(&self, request: &PageRequest) -> Result<RawResponse, TransportError>;

    /// Identifier of the extracted resource, e.g. `owner/repo`
    fn target(&self) -> String;
}

impl<S: PageSource + ?Sized> PageSource for Arc<S> {
    fn get_page(&self, request: &PageRequest) -> Result<RawResponse, TransportError> {
        (**self).get_page(request)
    }

    fn target(&self) -> String {
        (**self).target()
    }
}

/// Resolved result of one page.
#[derive(Debug, Clone, PartialEq)]
pub enum PageOutcome {
    /// `full` = exactly `per_page` items came back, more pages may exist
    Data { records: Vec<Record>, full: bool },
    /// Empty page or out-of-range pagination
    EndOfData,
    /// Retries exhausted or a non-retryable client error
    Failed { reason: String },
}

impl PageOutcome {
    pub fn is_failed(&self) -> bool {
        matches!(self, Self::Failed { .. })
    }
}

type Sleeper = Arc<dyn Fn(Duration) + Send + Sync>;

/// Fetches one page, retrying transient failures within its backoff budget.
pub struct PageFetcher<S> {
    source: S,
    per_page: u32,
    backoff: BackoffPolicy,
    sleep: Sleeper,
}

impl<S: PageSource> PageFetcher<S> {
    pub fn new(source: S, per_page: u32, backoff: BackoffPolicy) -> Self {
        Self {
            source,
            per_page,
            backoff,
            sleep: Arc::new(std::thread::sleep),
        }
    }

    /// Replace the blocking sleep used between attempts
    pub fn with_sleeper(mut self, sleep: impl Fn(Duration) + Send + Sync + 'static) -> Self {
        self.sleep = Arc::new(sleep);
        self
    }

    pub fn source(&self) -> &S {
        &self.source
    }

    pub fn per_page(&self) -> u32 {
        self.per_page
    }

    /// Fetch `page` of records updated since `since`.
    ///
    /// Never panics or errors: every path resolves to a [`PageOutcome`].
    pub fn fetch(&self, page: u32, since: &Watermark) -> PageOutcome {
        let request = PageRequest {
            page,
            per_page: self.per_page,
            since: since.clone(),
        };
        let max_attempts = self.backoff.max_attempts.max(1);
        let mut last_error = String::new();

        for attempt in 0..max_attempts {
            let hint = match self.source.get_page(&request) {
                Ok(response) => match classify(response.status) {
                    Attempt::Success => match Record::parse_page(&response.body) {
                        Ok(records) if records.is_empty() => {
                            log::debug!("page {page}: empty, end of data");
                            return PageOutcome::EndOfData;
                        }
                        Ok(records) => {
                            let full = records.len() >= self.per_page as usize;
                            log::debug!("page {page}: {} records (full={full})", records.len());
                            return PageOutcome::Data { records, full };
                        }
                        Err(e) => {
                            last_error = format!("invalid page body: {e}");
                            None
                        }
                    },
                    Attempt::EndOfData => {
                        log::info!("page {page}: reached end (status {})", response.status);
                        return PageOutcome::EndOfData;
                    }
                    Attempt::Fatal => {
                        log::error!("page {page}: fatal status {}", response.status);
                        return PageOutcome::Failed {
                            reason: format!("HTTP {}", response.status),
                        };
                    }
                    Attempt::RateLimited => {
                        last_error = format!(
                            "HTTP {} rate limited (remaining {})",
                            response.status,
                            response
                                .rate_limit
                                .remaining
                                .map_or("?".to_string(), |r| r.to_string())
                        );
                        response.rate_limit.retry_hint(chrono::Utc::now().timestamp())
                    }
                    Attempt::ServerError => {
                        last_error = format!("HTTP {} server error", response.status);
                        response.rate_limit.retry_hint(chrono::Utc::now().timestamp())
                    }
                },
                Err(e) => {
                    last_error = e.to_string();
                    None
                }
            };

            if attempt + 1 == max_attempts {
                break;
            }
            let delay = self.backoff.next_delay(attempt, hint);
            log::warn!(
                "page {page}: {last_error}, retry {}/{} in {:.2}s",
                attempt + 1,
                max_attempts - 1,
                delay.as_secs_f64()
            );
            (self.sleep)(delay);
        }

        log::error!("page {page}: failed after {max_attempts} attempts: {last_error}");
        PageOutcome::Failed {
            reason: format!("{last_error} (after {max_attempts} attempts)"),
        }
    }
}
