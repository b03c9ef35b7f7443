//! Stepline Core - stepped, watermark-checkpointed incremental extraction
//!
//! Pages of a time-ordered HTTP collection are fetched in fixed-size concurrent
//! windows, flushed to CSV artifacts, and checkpointed by a watermark that only
//! advances past batches where every page succeeded.

pub mod controller;
pub mod error;
pub mod fetcher;
pub mod http;
pub mod logging;
pub mod progress;
pub mod record;
pub mod retry;
pub mod shutdown;
pub mod sink;
pub mod stepper;
pub mod watermark;

// Re-exports for convenience
pub use controller::{ExtractionController, ExtractionResult, ExtractionSettings, TerminationReason};
pub use error::{SettingsError, StoreError, TransportError};
pub use fetcher::{PageFetcher, PageOutcome, PageRequest, PageSource, RawResponse};
pub use http::{HttpConfig, RateLimit, SHARED_RUNTIME, build_client};
pub use logging::{IndicatifLogger, init_logging};
pub use progress::{ProgressContext, SharedProgress, fmt_num};
pub use record::{Record, Watermark};
pub use retry::{Attempt, BackoffPolicy, classify};
pub use shutdown::{is_shutdown_requested, shutdown_flag};
pub use sink::{ArtifactStore, CsvSink, LocalDirStore, MemoryArtifactStore, cleanup_tmp_files};
pub use stepper::{Batch, Stepper};
pub use watermark::{FileWatermarkStore, MemoryWatermarkStore, WatermarkStore};
