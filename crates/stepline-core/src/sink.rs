//! Output sinks: one CSV artifact per flushed batch

use std::collections::BTreeMap;
use std::fs;
use std::io;
use std::path::{Path, PathBuf};
use std::sync::Mutex;

use serde_json::Value;

use crate::record::Record;

/// Columns kept in CSV artifacts, in output order
pub const CSV_COLUMNS: &[&str] = &[
    "id",
    "number",
    "title",
    "user",
    "state",
    "created_at",
    "updated_at",
    "body",
    "html_url",
];

/// Named, write-once blob storage (local directory, object store, ...).
pub trait ArtifactStore {
    fn write(&self, name: &str, bytes: &[u8]) -> io::Result<()>;

    fn exists(&self, name: &str) -> bool;

    /// Human-readable location for logs and summaries
    fn location(&self) -> String;
}

/// Artifacts as files under a root directory, written tmp → rename.
#[derive(Debug, Clone)]
pub struct LocalDirStore {
    root: PathBuf,
}

impl LocalDirStore {
    pub fn new(root: impl Into<PathBuf>) -> Self {
        Self { root: root.into() }
    }

    pub fn root(&self) -> &Path {
        &self.root
    }
}

impl ArtifactStore for LocalDirStore {
    fn write(&self, name: &str, bytes: &[u8]) -> io::Result<()> {
        let final_path = self.root.join(name);
        if final_path.exists() {
            return Err(io::Error::new(
                io::ErrorKind::AlreadyExists,
                format!("{} already exists", final_path.display()),
            ));
        }
        if let Some(parent) = final_path.parent() {
            fs::create_dir_all(parent)?;
        }
        let tmp_path = self.root.join(format!("{name}.tmp"));
        fs::write(&tmp_path, bytes)?;
        fs::rename(&tmp_path, &final_path)
    }

    fn exists(&self, name: &str) -> bool {
        self.root.join(name).exists()
    }

    fn location(&self) -> String {
        self.root.display().to_string()
    }
}

/// Remove stale .tmp artifacts left by an interrupted write
pub fn cleanup_tmp_files(dir: &Path) -> io::Result<usize> {
    let mut removed = 0;
    if !dir.exists() {
        return Ok(0);
    }
    for entry in fs::read_dir(dir)? {
        let path = entry?.path();
        if path.extension().is_some_and(|ext| ext == "tmp") {
            log::warn!("Removing stale tmp file: {}", path.display());
            fs::remove_file(&path)?;
            removed += 1;
        }
    }
    Ok(removed)
}

/// In-memory artifact store
#[derive(Debug, Default)]
pub struct MemoryArtifactStore {
    artifacts: Mutex<BTreeMap<String, Vec<u8>>>,
    fail_writes: bool,
}

impl MemoryArtifactStore {
    pub fn new() -> Self {
        Self::default()
    }

    /// Store that rejects every write (sink failure paths)
    pub fn failing() -> Self {
        Self {
            fail_writes: true,
            ..Self::default()
        }
    }

    pub fn names(&self) -> Vec<String> {
        self.artifacts
            .lock()
            .expect("artifact lock poisoned")
            .keys()
            .cloned()
            .collect()
    }

    pub fn get(&self, name: &str) -> Option<Vec<u8>> {
        self.artifacts
            .lock()
            .expect("artifact lock poisoned")
            .get(name)
            .cloned()
    }
}

impl ArtifactStore for MemoryArtifactStore {
    fn write(&self, name: &str, bytes: &[u8]) -> io::Result<()> {
        if self.fail_writes {
            return Err(io::Error::other("store unavailable"));
        }
        let mut artifacts = self.artifacts.lock().expect("artifact lock poisoned");
        if artifacts.contains_key(name) {
            return Err(io::Error::new(io::ErrorKind::AlreadyExists, name.to_string()));
        }
        artifacts.insert(name.to_string(), bytes.to_vec());
        Ok(())
    }

    fn exists(&self, name: &str) -> bool {
        self.artifacts
            .lock()
            .expect("artifact lock poisoned")
            .contains_key(name)
    }

    fn location(&self) -> String {
        "memory".to_string()
    }
}

impl<A: ArtifactStore + ?Sized> ArtifactStore for &A {
    fn write(&self, name: &str, bytes: &[u8]) -> io::Result<()> {
        (**self).write(name, bytes)
    }

    fn exists(&self, name: &str) -> bool {
        (**self).exists(name)
    }

    fn location(&self) -> String {
        (**self).location()
    }
}

/// Writes each batch as `<prefix>/issues_<date>_batch_<seq:03>.csv`.
///
/// The sequence and date are per-run state; see [`CsvSink::start_run`].
pub struct CsvSink<A> {
    store: A,
    prefix: String,
    date: String,
    sequence: u32,
}

impl<A: ArtifactStore> CsvSink<A> {
    pub fn new(store: A, prefix: impl Into<String>) -> Self {
        Self {
            store,
            prefix: prefix.into(),
            date: chrono::Local::now().format("%Y-%m-%d").to_string(),
            sequence: 0,
        }
    }

    pub fn store(&self) -> &A {
        &self.store
    }

    /// Reset the batch counter and date stamp for a new run
    pub fn start_run(&mut self, date: impl Into<String>) {
        self.date = date.into();
        self.sequence = 0;
    }

    /// Next free artifact name; never reuses a name present in the store
    fn next_name(&mut self) -> String {
        loop {
            self.sequence += 1;
            let name = artifact_name(&self.prefix, &self.date, self.sequence);
            if !self.store.exists(&name) {
                return name;
            }
        }
    }

    /// Persist `records` as one new artifact.
    ///
    /// Returns the number of records written; 0 for empty input or a failed write
    /// (logged, never raised).
    pub fn flush(&mut self, records: &[Record]) -> usize {
        if records.is_empty() {
            return 0;
        }
        let bytes = match render_csv(records) {
            Ok(b) => b,
            Err(e) => {
                log::error!("cannot encode batch as CSV: {e}");
                return 0;
            }
        };
        let name = self.next_name();
        match self.store.write(&name, &bytes) {
            Ok(()) => {
                log::info!(
                    "saved {} records to {}/{name}",
                    records.len(),
                    self.store.location()
                );
                records.len()
            }
            Err(e) => {
                log::error!("cannot write {name} to {}: {e}", self.store.location());
                0
            }
        }
    }
}

pub fn artifact_name(prefix: &str, date: &str, sequence: u32) -> String {
    let file = format!("issues_{date}_batch_{sequence:03}.csv");
    if prefix.is_empty() {
        file
    } else {
        format!("{}/{file}", prefix.trim_end_matches('/'))
    }
}

fn cell(value: Option<&Value>) -> String {
    match value {
        None | Some(Value::Null) => String::new(),
        Some(Value::String(s)) => s.clone(),
        Some(other) => other.to_string(),
    }
}

/// Encode normalized records with the allow-listed columns that occur in the input.
pub fn render_csv(records: &[Record]) -> Result<Vec<u8>, csv::Error> {
    let columns: Vec<&str> = CSV_COLUMNS
        .iter()
        .copied()
        .filter(|c| records.iter().any(|r| r.contains(c)))
        .collect();

    let mut writer = csv::Writer::from_writer(Vec::new());
    writer.write_record(&columns)?;
    for record in records {
        let record = record.clone().normalized();
        writer.write_record(columns.iter().map(|c| cell(record.get(c))))?;
    }
    writer
        .into_inner()
        .map_err(|e| csv::Error::from(e.into_error()))
}
