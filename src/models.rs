//! Core data models used throughout the harvester.
//!
//! These types describe connector kinds, configured instances, and the
//! normalized documents that flow from harvesters into the indexing queue.

use std::sync::atomic::{AtomicI64, Ordering};

use chrono::{DateTime, TimeZone, Utc};
use serde::{Deserialize, Serialize};

/// Input widget hint for a configuration field.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum FieldType {
    Text,
    Password,
    Url,
    Path,
}

/// Describes one configuration key a connector kind expects.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ConfigField {
    pub name: String,
    pub label: String,
    pub input_type: FieldType,
    pub required: bool,
    #[serde(default)]
    pub help: Option<String>,
}

impl ConfigField {
    pub fn required(name: &str, label: &str, input_type: FieldType) -> Self {
        Self {
            name: name.to_string(),
            label: label.to_string(),
            input_type,
            required: true,
            help: None,
        }
    }

    pub fn optional(name: &str, label: &str, input_type: FieldType) -> Self {
        Self {
            required: false,
            ..Self::required(name, label, input_type)
        }
    }

    pub fn with_help(mut self, help: &str) -> Self {
        self.help = Some(help.to_string());
        self
    }
}

/// A connector kind as stored in the type catalog.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ConnectorType {
    pub id: i64,
    pub name: String,
    pub display_name: String,
    pub config_fields: Vec<ConfigField>,
}

/// Kind of content a [`Document`] was harvested from.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum DocumentType {
    Document,
    Message,
    Comment,
    Issue,
}

impl DocumentType {
    pub fn as_str(&self) -> &'static str {
        match self {
            DocumentType::Document => "document",
            DocumentType::Message => "message",
            DocumentType::Comment => "comment",
            DocumentType::Issue => "issue",
        }
    }
}

/// Normalized unit of content handed to the indexing queue.
///
/// Re-harvesting a changed item produces a new `Document` with the same
/// `source_id`; the queue is responsible for upsert semantics.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Document {
    pub title: String,
    pub content: String,
    pub author: Option<String>,
    pub author_image_url: Option<String>,
    pub timestamp: DateTime<Utc>,
    pub source_id: String,
    pub data_source_id: i64,
    pub location: String,
    pub url: String,
    pub doc_type: DocumentType,
}

/// Last-successful-sync timestamp of one connector instance.
///
/// Stored as milliseconds since the epoch. [`advance`](Watermark::advance)
/// never moves the value backwards.
#[derive(Debug)]
pub struct Watermark(AtomicI64);

impl Watermark {
    /// A watermark starting at `at`, or at the epoch when the instance has
    /// never synced.
    pub fn new(at: Option<DateTime<Utc>>) -> Self {
        Self(AtomicI64::new(at.map(|t| t.timestamp_millis()).unwrap_or(0)))
    }

    pub fn get(&self) -> DateTime<Utc> {
        from_millis(self.0.load(Ordering::Acquire))
    }

    /// `None` until the first successful sync.
    pub fn last_synced(&self) -> Option<DateTime<Utc>> {
        match self.0.load(Ordering::Acquire) {
            0 => None,
            ms => Some(from_millis(ms)),
        }
    }

    /// Move the watermark forward to `to`. Returns the resulting value.
    pub fn advance(&self, to: DateTime<Utc>) -> DateTime<Utc> {
        let to = to.timestamp_millis();
        let prev = self.0.fetch_max(to, Ordering::AcqRel);
        from_millis(prev.max(to))
    }
}

pub(crate) fn from_millis(ms: i64) -> DateTime<Utc> {
    Utc.timestamp_millis_opt(ms)
        .single()
        .unwrap_or(DateTime::<Utc>::UNIX_EPOCH)
}
