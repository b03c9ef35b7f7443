//! Record and watermark types shared by every pipeline stage

use std::fmt;

use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};

/// Fields holding a nested account object that is reduced to its login.
const AUTHOR_FIELDS: &[&str] = &["user", "author"];

/// Resumption cursor: data updated at or after this point is not yet confirmed extracted.
///
/// Tokens are ISO-8601 UTC timestamps as returned by the upstream API
/// (`2024-01-01T00:00:00Z`), so lexical order equals chronological order.
#[derive(Clone, Debug, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(transparent)]
pub struct Watermark(String);

impl Watermark {
    pub fn new(token: impl Into<String>) -> Self {
        Self(token.into())
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }

    /// Check that the token is a valid RFC 3339 timestamp
    pub fn is_timestamp(&self) -> bool {
        chrono::DateTime::parse_from_rfc3339(&self.0).is_ok()
    }
}

impl fmt::Display for Watermark {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

impl From<&str> for Watermark {
    fn from(s: &str) -> Self {
        Self::new(s)
    }
}

/// One upstream item (an issue), kept as the raw JSON object.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
#[serde(transparent)]
pub struct Record(Map<String, Value>);

impl Record {
    /// Parse a JSON array body into records. Non-object elements are rejected.
    pub fn parse_page(body: &str) -> Result<Vec<Record>, serde_json::Error> {
        serde_json::from_str(body)
    }

    pub fn get(&self, field: &str) -> Option<&Value> {
        self.0.get(field)
    }

    pub fn contains(&self, field: &str) -> bool {
        self.0.contains_key(field)
    }

    /// `updated_at` as a watermark candidate
    pub fn updated_at(&self) -> Option<Watermark> {
        self.0
            .get("updated_at")
            .and_then(Value::as_str)
            .map(Watermark::new)
    }

    /// Flatten nested author objects (`user`, `author`) to their login string.
    ///
    /// An object without a `login` becomes `null`; scalars are left alone.
    pub fn normalized(mut self) -> Self {
        for field in AUTHOR_FIELDS {
            if let Some(value) = self.0.get_mut(*field) {
                if value.is_object() {
                    *value = value
                        .get("login")
                        .and_then(Value::as_str)
                        .map(|login| Value::String(login.to_string()))
                        .unwrap_or(Value::Null);
                }
            }
        }
        self
    }
}

/// Maximum `updated_at` across records, if any carries one.
pub fn max_updated_at<'a>(records: impl IntoIterator<Item = &'a Record>) -> Option<Watermark> {
    records.into_iter().filter_map(Record::updated_at).max()
}
