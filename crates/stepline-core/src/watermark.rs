//! Durable storage of the resumption cursor for one resource

use std::fs;
use std::path::{Path, PathBuf};
use std::sync::Mutex;

use serde::{Deserialize, Serialize};

use crate::error::StoreError;
use crate::record::Watermark;

/// Persisted form: `{"last_updated": "<token>"}`
#[derive(Debug, Serialize, Deserialize)]
struct WatermarkState {
    last_updated: Watermark,
}

/// Storage for a single watermark. Written only by the extraction controller.
pub trait WatermarkStore {
    /// `Ok(None)` when nothing has been persisted yet
    fn read(&self) -> Result<Option<Watermark>, StoreError>;

    fn write(&self, watermark: &Watermark) -> Result<(), StoreError>;

    /// Human-readable location for logs and summaries
    fn location(&self) -> String;
}

/// Read the stored watermark, falling back to `default` when absent or unreadable.
pub fn read_or_default(store: &dyn WatermarkStore, default: &Watermark) -> Watermark {
    match store.read() {
        Ok(Some(w)) => w,
        Ok(None) => {
            log::info!(
                "no watermark at {}, starting from {default}",
                store.location()
            );
            default.clone()
        }
        Err(e) => {
            log::error!(
                "cannot read watermark at {}: {e}; starting from {default}",
                store.location()
            );
            default.clone()
        }
    }
}

/// JSON state file on local disk, replaced atomically (tmp → rename).
#[derive(Debug, Clone)]
pub struct FileWatermarkStore {
    path: PathBuf,
}

impl FileWatermarkStore {
    pub fn new(path: impl Into<PathBuf>) -> Self {
        Self { path: path.into() }
    }

    pub fn path(&self) -> &Path {
        &self.path
    }
}

impl WatermarkStore for FileWatermarkStore {
    fn read(&self) -> Result<Option<Watermark>, StoreError> {
        let content = match fs::read_to_string(&self.path) {
            Ok(c) => c,
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => return Ok(None),
            Err(e) => return Err(e.into()),
        };
        let state: WatermarkState = serde_json::from_str(&content)
            .map_err(|e| StoreError::Corrupt(format!("{}: {e}", self.path.display())))?;
        Ok(Some(state.last_updated))
    }

    fn write(&self, watermark: &Watermark) -> Result<(), StoreError> {
        if let Some(parent) = self.path.parent().filter(|p| !p.as_os_str().is_empty()) {
            fs::create_dir_all(parent)?;
        }
        let state = WatermarkState {
            last_updated: watermark.clone(),
        };
        let json = serde_json::to_string_pretty(&state)
            .map_err(|e| StoreError::Encode(e.to_string()))?;

        let mut tmp = self.path.clone().into_os_string();
        tmp.push(".tmp");
        let tmp = PathBuf::from(tmp);
        fs::write(&tmp, json)?;
        fs::rename(&tmp, &self.path)?;
        Ok(())
    }

    fn location(&self) -> String {
        self.path.display().to_string()
    }
}

/// Process-local store; keeps every committed value for inspection.
#[derive(Debug, Default)]
pub struct MemoryWatermarkStore {
    history: Mutex<Vec<Watermark>>,
    fail_writes: bool,
}

impl MemoryWatermarkStore {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_value(watermark: Watermark) -> Self {
        Self {
            history: Mutex::new(vec![watermark]),
            fail_writes: false,
        }
    }

    /// Store that rejects every write (commit failure paths)
    pub fn failing() -> Self {
        Self {
            fail_writes: true,
            ..Self::default()
        }
    }

    /// All values ever held, oldest first
    pub fn history(&self) -> Vec<Watermark> {
        self.history.lock().expect("watermark lock poisoned").clone()
    }
}

impl WatermarkStore for MemoryWatermarkStore {
    fn read(&self) -> Result<Option<Watermark>, StoreError> {
        Ok(self.history().last().cloned())
    }

    fn write(&self, watermark: &Watermark) -> Result<(), StoreError> {
        if self.fail_writes {
            return Err(std::io::Error::other("store unavailable").into());
        }
        self.history
            .lock()
            .expect("watermark lock poisoned")
            .push(watermark.clone());
        Ok(())
    }

    fn location(&self) -> String {
        "memory".to_string()
    }
}

impl<W: WatermarkStore + ?Sized> WatermarkStore for &W {
    fn read(&self) -> Result<Option<Watermark>, StoreError> {
        (**self).read()
    }

    fn write(&self, watermark: &Watermark) -> Result<(), StoreError> {
        (**self).write(watermark)
    }

    fn location(&self) -> String {
        (**self).location()
    }
}
