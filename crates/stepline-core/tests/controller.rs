use std::collections::HashSet;
use std::sync::atomic::{AtomicU32, Ordering};
use std::sync::{Arc, Mutex};

use serde_json::json;
use stepline_core::{
    ArtifactStore, BackoffPolicy, CsvSink, ExtractionController, ExtractionSettings,
    FileWatermarkStore, LocalDirStore, MemoryArtifactStore, MemoryWatermarkStore, PageRequest,
    PageSource, RateLimit, RawResponse, TerminationReason, TransportError, Watermark,
    WatermarkStore,
};
use tempfile::TempDir;

const T0: &str = "2024-01-01T00:00:00Z";
const T1: &str = "2024-02-01T00:00:00Z";
const T2: &str = "2024-03-01T00:00:00Z";
const T3: &str = "2024-04-01T00:00:00Z";

type Responder = Box<dyn Fn(&PageRequest) -> Result<RawResponse, TransportError> + Send + Sync>;

/// Upstream whose answer depends only on the requested page.
struct Upstream {
    respond: Responder,
    requests: Mutex<Vec<PageRequest>>,
}

impl Upstream {
    fn new<F>(respond: F) -> Arc<Self>
    where
        F: Fn(&PageRequest) -> Result<RawResponse, TransportError> + Send + Sync + 'static,
    {
        Arc::new(Self {
            respond: Box::new(respond),
            requests: Mutex::new(Vec::new()),
        })
    }

    fn pages_requested(&self) -> Vec<u32> {
        let mut pages: Vec<u32> = self.requests.lock().unwrap().iter().map(|r| r.page).collect();
        pages.sort_unstable();
        pages
    }

    fn sinces(&self) -> HashSet<String> {
        self.requests
            .lock()
            .unwrap()
            .iter()
            .map(|r| r.since.to_string())
            .collect()
    }
}

impl PageSource for Upstream {
    fn get_page(&self, request: &PageRequest) -> Result<RawResponse, TransportError> {
        self.requests.lock().unwrap().push(request.clone());
        (self.respond)(request)
    }

    fn target(&self) -> String {
        "acme/widgets".to_string()
    }
}

fn issues(page: u32, n: usize, updated_at: &str) -> Result<RawResponse, TransportError> {
    let items: Vec<_> = (0..n)
        .map(|i| {
            let number = page as usize * 1000 + i;
            json!({
                "id": number,
                "number": number,
                "title": format!("issue {number}"),
                "user": {"login": "octocat", "id": 1},
                "state": "open",
                "created_at": T0,
                "updated_at": updated_at,
                "body": "text",
                "html_url": format!("https://example.test/acme/widgets/issues/{number}"),
                "labels": [],
            })
        })
        .collect();
    Ok(RawResponse {
        status: 200,
        body: serde_json::to_string(&items).unwrap(),
        ..RawResponse::default()
    })
}

fn empty() -> Result<RawResponse, TransportError> {
    Ok(RawResponse {
        status: 200,
        body: "[]".into(),
        ..RawResponse::default()
    })
}

fn status(code: u16) -> Result<RawResponse, TransportError> {
    Ok(RawResponse {
        status: code,
        ..RawResponse::default()
    })
}

fn settings() -> ExtractionSettings {
    ExtractionSettings {
        step_size: 3,
        per_page: 100,
        default_since: Watermark::from(T0),
        backoff: BackoffPolicy::immediate(3),
        max_batches: None,
        max_consecutive_failed_batches: 3,
    }
}

fn controller<'a>(
    upstream: &Arc<Upstream>,
    store: &'a MemoryWatermarkStore,
    artifacts: &'a MemoryArtifactStore,
    settings: &ExtractionSettings,
) -> ExtractionController<Arc<Upstream>, &'a MemoryWatermarkStore, &'a MemoryArtifactStore> {
    ExtractionController::new(
        upstream.clone(),
        store,
        CsvSink::new(artifacts, "data"),
        settings,
    )
    .unwrap()
    .with_shutdown(|| false)
}

fn rows(artifacts: &MemoryArtifactStore) -> usize {
    artifacts
        .names()
        .iter()
        .map(|name| {
            let bytes = artifacts.get(name).unwrap();
            csv::Reader::from_reader(bytes.as_slice()).records().count()
        })
        .sum()
}

#[test]
fn full_batch_commits_max_timestamp_and_continues() {
    let upstream = Upstream::new(|req| match req.page {
        1 => issues(1, 100, T1),
        2 => issues(2, 100, T2),
        3 => issues(3, 100, T3),
        _ => empty(),
    });
    let store = MemoryWatermarkStore::new();
    let artifacts = MemoryArtifactStore::new();

    let result = controller(&upstream, &store, &artifacts, &settings()).run();

    assert_eq!(result.total_saved, 300);
    assert_eq!(result.final_watermark, Watermark::from(T3));
    assert_eq!(result.terminated_reason, TerminationReason::EndOfData);
    assert_eq!(result.batches, 2);
    assert_eq!(result.target, "acme/widgets");
    assert_eq!(upstream.pages_requested(), vec![1, 2, 3, 4, 5, 6]);
    assert_eq!(store.read().unwrap(), Some(Watermark::from(T3)));
    assert!(store.history().iter().all(|w| *w == Watermark::from(T3)));

    assert_eq!(artifacts.names().len(), 1);
    assert!(artifacts.names()[0].starts_with("data/issues_"));
    assert!(artifacts.names()[0].ends_with("_batch_001.csv"));
    assert_eq!(rows(&artifacts), 300);
}

#[test]
fn failed_page_flushes_siblings_but_holds_watermark() {
    let upstream = Upstream::new(|req| match req.page {
        1 => issues(1, 100, T1),
        2 => status(401),
        3 => issues(3, 100, T3),
        _ => empty(),
    });
    let store = MemoryWatermarkStore::new();
    let artifacts = MemoryArtifactStore::new();

    let result = controller(&upstream, &store, &artifacts, &settings()).run();

    assert_eq!(result.total_saved, 200);
    assert_eq!(result.failed_pages, 1);
    assert_eq!(result.final_watermark, Watermark::from(T0));
    assert!(store.history().is_empty());
    assert_eq!(rows(&artifacts), 200);
}

#[test]
fn short_page_ends_the_run_after_its_batch() {
    let upstream = Upstream::new(|req| match req.page {
        1 => issues(1, 100, T1),
        2 => issues(2, 37, T2),
        3 => empty(),
        _ => issues(req.page, 100, T3),
    });
    let store = MemoryWatermarkStore::new();
    let artifacts = MemoryArtifactStore::new();

    let result = controller(&upstream, &store, &artifacts, &settings()).run();

    assert_eq!(result.terminated_reason, TerminationReason::EndOfData);
    assert_eq!(result.total_saved, 137);
    assert_eq!(result.batches, 1);
    assert_eq!(result.final_watermark, Watermark::from(T2));
    assert_eq!(upstream.pages_requested(), vec![1, 2, 3]);
}

#[test]
fn end_of_data_independent_of_step_size() {
    for step_size in 1..=5 {
        let upstream = Upstream::new(|req| match req.page {
            1..=3 => issues(req.page, 10, T1),
            4 => issues(4, 3, T2),
            _ => empty(),
        });
        let store = MemoryWatermarkStore::new();
        let artifacts = MemoryArtifactStore::new();
        let settings = ExtractionSettings {
            step_size,
            per_page: 10,
            ..settings()
        };

        let result = controller(&upstream, &store, &artifacts, &settings).run();

        assert_eq!(result.terminated_reason, TerminationReason::EndOfData);
        assert_eq!(result.total_saved, 33, "step {step_size}");
        assert_eq!(result.final_watermark, Watermark::from(T2), "step {step_size}");
        let last_batch_start = (4 - 1) / step_size * step_size + 1;
        assert_eq!(
            *upstream.pages_requested().last().unwrap(),
            last_batch_start + step_size - 1,
            "step {step_size}"
        );
    }
}

#[test]
fn resumes_from_persisted_watermark() {
    let upstream = Upstream::new(|req| match req.page {
        1 => issues(1, 5, T3),
        _ => empty(),
    });
    let store = MemoryWatermarkStore::with_value(Watermark::from(T2));
    let artifacts = MemoryArtifactStore::new();

    let result = controller(&upstream, &store, &artifacts, &settings()).run();

    assert_eq!(upstream.sinces(), HashSet::from([T2.to_string()]));
    assert_eq!(result.final_watermark, Watermark::from(T3));
    assert_eq!(result.total_saved, 5);
}

#[test]
fn stale_records_never_lower_the_watermark() {
    let upstream = Upstream::new(|req| match req.page {
        1 => issues(1, 4, T1),
        _ => empty(),
    });
    let store = MemoryWatermarkStore::with_value(Watermark::from(T3));
    let artifacts = MemoryArtifactStore::new();

    let result = controller(&upstream, &store, &artifacts, &settings()).run();

    assert_eq!(result.total_saved, 4);
    assert_eq!(result.final_watermark, Watermark::from(T3));
    assert_eq!(store.history(), vec![Watermark::from(T3)]);
}

#[test]
fn persistent_rejection_stops_after_dead_batches() {
    let upstream = Upstream::new(|_| status(401));
    let store = MemoryWatermarkStore::new();
    let artifacts = MemoryArtifactStore::new();

    let result = controller(&upstream, &store, &artifacts, &settings()).run();

    assert_eq!(result.terminated_reason, TerminationReason::TooManyFailures);
    assert_eq!(result.batches, 3);
    assert_eq!(result.failed_pages, 9);
    assert_eq!(result.total_saved, 0);
    assert_eq!(upstream.pages_requested(), (1..=9).collect::<Vec<_>>());
    assert!(artifacts.names().is_empty());
    assert!(store.history().is_empty());
}

#[test]
fn partial_batch_breaks_the_dead_streak() {
    // Batches 1-2 fail outright, batch 3 has one good page, batches 4-6 fail outright.
    let upstream = Upstream::new(|req| match req.page {
        7 => issues(7, 100, T1),
        _ => status(500),
    });
    let store = MemoryWatermarkStore::new();
    let artifacts = MemoryArtifactStore::new();
    let settings = ExtractionSettings {
        backoff: BackoffPolicy::immediate(1),
        ..settings()
    };

    let result = controller(&upstream, &store, &artifacts, &settings).run();

    assert_eq!(result.terminated_reason, TerminationReason::TooManyFailures);
    assert_eq!(result.batches, 6);
    assert_eq!(result.total_saved, 100);
    assert_eq!(result.final_watermark, Watermark::from(T0));
}

#[test]
fn transient_errors_are_retried_within_the_page() {
    let flaky = AtomicU32::new(0);
    let upstream = Upstream::new(move |req| match req.page {
        1 if flaky.fetch_add(1, Ordering::SeqCst) < 2 => status(502),
        1 => issues(1, 100, T1),
        2 => Err(TransportError::new("connection reset")),
        _ => empty(),
    });
    let store = MemoryWatermarkStore::new();
    let artifacts = MemoryArtifactStore::new();

    let result = controller(&upstream, &store, &artifacts, &settings()).run();

    // Page 1 recovers on its third attempt; page 2 exhausts all three.
    assert_eq!(result.total_saved, 100);
    assert_eq!(result.failed_pages, 1);
    assert_eq!(result.final_watermark, Watermark::from(T0));
    let requested = upstream.pages_requested();
    assert_eq!(requested.iter().filter(|p| **p == 1).count(), 3);
    assert_eq!(requested.iter().filter(|p| **p == 2).count(), 3);
}

#[test]
fn absurd_retry_after_fails_the_page_instead_of_the_run() {
    let upstream = Upstream::new(|req| match req.page {
        1 => issues(1, 100, T1),
        2 => Ok(RawResponse {
            status: 429,
            rate_limit: RateLimit {
                retry_after: Some(u64::MAX),
                ..RateLimit::default()
            },
            ..RawResponse::default()
        }),
        _ => empty(),
    });
    let store = MemoryWatermarkStore::new();
    let artifacts = MemoryArtifactStore::new();

    let result = controller(&upstream, &store, &artifacts, &settings()).run();

    assert_eq!(result.terminated_reason, TerminationReason::EndOfData);
    assert_eq!(result.failed_pages, 1);
    assert_eq!(result.total_saved, 100);
    assert_eq!(result.final_watermark, Watermark::from(T0));
}

#[test]
fn batch_limit_stops_early() {
    let upstream = Upstream::new(|req| issues(req.page, 100, T1));
    let store = MemoryWatermarkStore::new();
    let artifacts = MemoryArtifactStore::new();
    let settings = ExtractionSettings {
        max_batches: Some(2),
        ..settings()
    };

    let result = controller(&upstream, &store, &artifacts, &settings).run();

    assert_eq!(result.terminated_reason, TerminationReason::BatchLimit);
    assert_eq!(result.total_saved, 600);
    assert_eq!(artifacts.names().len(), 2);
    assert_eq!(result.final_watermark, Watermark::from(T1));
}

#[test]
fn shutdown_stops_after_the_current_batch() {
    let upstream = Upstream::new(|req| issues(req.page, 100, T2));
    let store = MemoryWatermarkStore::new();
    let artifacts = MemoryArtifactStore::new();

    let result = ExtractionController::new(
        upstream.clone(),
        &store,
        CsvSink::new(&artifacts, "data"),
        &settings(),
    )
    .unwrap()
    .with_shutdown(|| true)
    .run();

    assert_eq!(result.terminated_reason, TerminationReason::Interrupted);
    assert_eq!(result.batches, 1);
    assert_eq!(result.total_saved, 300);
    assert_eq!(store.read().unwrap(), Some(Watermark::from(T2)));
}

#[test]
fn failed_flush_is_not_trusted() {
    let upstream = Upstream::new(|req| match req.page {
        1 => issues(1, 100, T1),
        _ => empty(),
    });
    let store = MemoryWatermarkStore::new();
    let artifacts = MemoryArtifactStore::failing();

    let result = controller(&upstream, &store, &artifacts, &settings()).run();

    assert_eq!(result.total_saved, 0);
    assert_eq!(result.final_watermark, Watermark::from(T0));
    assert!(store.history().is_empty());
}

#[test]
fn unconfirmed_commits_do_not_stop_the_run() {
    let upstream = Upstream::new(|req| match req.page {
        1..=3 => issues(req.page, 100, T1),
        4 => issues(4, 100, T2),
        5 => issues(5, 20, T3),
        _ => empty(),
    });
    let store = MemoryWatermarkStore::failing();
    let artifacts = MemoryArtifactStore::new();

    let result = controller(&upstream, &store, &artifacts, &settings()).run();

    assert_eq!(result.terminated_reason, TerminationReason::EndOfData);
    assert_eq!(result.batches, 2);
    assert_eq!(result.total_saved, 420);
    assert_eq!(rows(&artifacts), 420);
    assert_eq!(artifacts.names().len(), 2);
    // The in-run high-water mark still advances; only persistence failed.
    assert_eq!(result.final_watermark, Watermark::from(T3));
    assert!(store.read().unwrap().is_none());
}

#[test]
fn file_backed_reruns_never_overwrite_artifacts() {
    let dir = TempDir::new().unwrap();
    let state_path = dir.path().join("issue_state.json");
    let out = LocalDirStore::new(dir.path().join("out"));

    for (run, ts) in [T1, T2].into_iter().enumerate() {
        let upstream = Upstream::new(move |req| match req.page {
            1 => issues(1, 10, ts),
            _ => empty(),
        });
        let store = FileWatermarkStore::new(&state_path);
        let result = ExtractionController::new(
            upstream.clone(),
            store,
            CsvSink::new(out.clone(), "data"),
            &settings(),
        )
        .unwrap()
        .with_shutdown(|| false)
        .run();

        assert_eq!(result.total_saved, 10, "run {run}");
        assert_eq!(result.final_watermark, Watermark::from(ts));
        assert_eq!(result.storage, out.location());
    }

    let written: Vec<_> = csv_files(&dir.path().join("out/data"));
    assert_eq!(written.len(), 2);
    assert!(written[0].ends_with("_batch_001.csv"));
    assert!(written[1].ends_with("_batch_002.csv"));
    assert_eq!(
        FileWatermarkStore::new(&state_path).read().unwrap(),
        Some(Watermark::from(T2))
    );
}

fn csv_files(dir: &std::path::Path) -> Vec<String> {
    let mut names: Vec<String> = std::fs::read_dir(dir)
        .unwrap()
        .map(|e| e.unwrap().file_name().to_string_lossy().into_owned())
        .filter(|n| n.ends_with(".csv"))
        .collect();
    names.sort();
    names
}
