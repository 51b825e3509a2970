//! In this module are declared the entities manipulated by this program

use std::fmt;

use chrono::{DateTime, NaiveDateTime, Utc};
use serde::Deserialize;
use serde_json::Value;

/// The format of the timestamps exchanged with the API and saved on disk.
/// Example: 2024-03-01T08:15:00Z
pub const TIMESTAMP_FORMAT: &str = "%Y-%m-%dT%H:%M:%SZ";

/// Represents the time of a run, with a precision of one second.
#[derive(Clone, Copy, Debug, PartialEq, Eq, PartialOrd, Ord)]
pub struct Checkpoint(DateTime<Utc>);

impl Checkpoint {
    /// Creates a checkpoint from a date, the sub-second part is dropped.
    pub fn new(date: DateTime<Utc>) -> Self {
        let seconds = date.timestamp();
        Checkpoint(DateTime::from_timestamp(seconds, 0).unwrap_or(date))
    }

    /// Parses a timestamp formatted as `YYYY-MM-DDTHH:MM:SSZ`.
    pub fn parse(text: &str) -> Option<Self> {
        NaiveDateTime::parse_from_str(text.trim(), TIMESTAMP_FORMAT)
            .ok()
            .map(|naive| Checkpoint(naive.and_utc()))
    }

    /// The date of the checkpoint.
    pub fn date(&self) -> DateTime<Utc> {
        self.0
    }
}

impl fmt::Display for Checkpoint {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0.format(TIMESTAMP_FORMAT))
    }
}

/// The range of modification dates asked to the API.
///
/// Without a start, the API returns everything modified before the end.
#[derive(Clone, Debug, PartialEq)]
pub struct QueryWindow {
    /// The lower bound, the last successful run if any.
    pub start: Option<Checkpoint>,
    /// The upper bound, the time at which the run started.
    pub end: Checkpoint,
}

impl QueryWindow {
    /// Creates a new window
    pub fn new(start: Option<Checkpoint>, end: Checkpoint) -> Self {
        QueryWindow { start, end }
    }

    /// The window as query string parameters.
    pub fn to_params(&self) -> Vec<(&'static str, String)> {
        let mut params = Vec::new();
        if let Some(start) = self.start {
            params.push(("lastModStartDate", start.to_string()));
        }
        params.push(("lastModEndDate", self.end.to_string()));
        params
    }
}

/// Represents a vulnerability as returned by the API.
///
/// The content is kept as is, only the identifier is read to know in which
/// file the record goes.
#[derive(Clone, Debug, Deserialize, PartialEq)]
#[serde(transparent)]
pub struct Record(Value);

impl Record {
    /// Wraps a JSON value
    pub fn new(value: Value) -> Self {
        Record(value)
    }

    /// The CVE identifier.
    /// Example: CVE-2012-6708
    pub fn id(&self) -> Option<&str> {
        self.0.get("cve")?.get("id")?.as_str()
    }

    /// The year embedded in the identifier, the second segment of
    /// `CVE-YYYY-NNNN`. None if the identifier is missing or malformed.
    pub fn year(&self) -> Option<i32> {
        let segment = self.id()?.split('-').nth(1)?;
        if segment.len() != 4 || !segment.chars().all(|c| c.is_ascii_digit()) {
            return None;
        }
        segment.parse().ok()
    }

    /// The raw JSON content.
    pub fn value(&self) -> &Value {
        &self.0
    }
}

/// Represents one page of the CVE API response.
/// Only the fields used by the updater are read.
#[derive(Debug, Default, Deserialize)]
pub struct Page {
    /// The number of records matching the query, across all pages.
    #[serde(rename = "totalResults", default)]
    pub total_results: u64,
    /// The records of this page.
    #[serde(rename = "vulnerabilities", default)]
    pub records: Vec<Record>,
}
