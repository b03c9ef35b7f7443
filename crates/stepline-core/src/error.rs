//! Error types for page transport, state persistence, and run settings

use std::fmt;

/// Request never produced an HTTP status (timeout, reset, unreadable body).
///
/// Always retryable from the fetcher's point of view.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct TransportError {
    pub message: String,
    pub timeout: bool,
}

impl TransportError {
    pub fn new(message: impl Into<String>) -> Self {
        Self {
            message: message.into(),
            timeout: false,
        }
    }

    /// Build from reqwest error, dropping the request URL and keeping the root cause
    pub fn from_reqwest(e: reqwest::Error) -> Self {
        let timeout = e.is_timeout();
        let e = e.without_url();
        let message = match std::error::Error::source(&e) {
            Some(cause) => format!("{e}: {cause}"),
            None => e.to_string(),
        };
        Self { message, timeout }
    }
}

impl fmt::Display for TransportError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        if self.timeout {
            write!(f, "timeout: {}", self.message)
        } else {
            write!(f, "transport: {}", self.message)
        }
    }
}

impl std::error::Error for TransportError {}

/// Failure reading or writing durable state (watermark or artifacts).
#[derive(Debug)]
pub enum StoreError {
    Io(std::io::Error),
    /// Persisted state exists but cannot be decoded
    Corrupt(String),
    /// State could not be encoded for writing
    Encode(String),
}

impl fmt::Display for StoreError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Io(e) => write!(f, "IO: {e}"),
            Self::Corrupt(msg) => write!(f, "corrupt state: {msg}"),
            Self::Encode(msg) => write!(f, "cannot encode state: {msg}"),
        }
    }
}

impl std::error::Error for StoreError {
    fn source(&self) -> Option<&(dyn std::error::Error + 'static)> {
        match self {
            Self::Io(e) => Some(e),
            Self::Corrupt(_) | Self::Encode(_) => None,
        }
    }
}

impl From<std::io::Error> for StoreError {
    fn from(e: std::io::Error) -> Self {
        Self::Io(e)
    }
}

/// Invalid run configuration, reported before any network activity.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SettingsError(pub String);

impl fmt::Display for SettingsError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "invalid configuration: {}", self.0)
    }
}

impl std::error::Error for SettingsError {}
