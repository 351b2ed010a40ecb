//! Core record model and civil-time helpers for the cosmic progress tracker.

use std::collections::HashMap;
use std::fmt;

use chrono::{DateTime, Duration, FixedOffset, NaiveDateTime, Timelike, Utc};
use serde::{Deserialize, Serialize};

pub const CRATE_NAME: &str = "cosmic-core";

/// Offset of the civil clock every timestamp is expressed in (UTC+8).
pub const CIVIL_OFFSET_SECS: i32 = 8 * 3600;

/// Canonical `lastUpdate` / `changeTime` layout.
pub const TIMESTAMP_FORMAT: &str = "%Y-%m-%d %H:%M:%S";

/// Layout of the stem of every snapshot filename.
pub const FILE_STEM_FORMAT: &str = "%Y-%m-%d-%H-%M";

pub const CHANGELOG_KIND: &str = "progress_changes";

/// Which upstream produced a record.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum SourceKind {
    /// JSON API of the mainland service.
    Cn,
    /// Lodestone HTML report of the global service.
    Na,
}

impl SourceKind {
    pub fn as_str(self) -> &'static str {
        match self {
            Self::Cn => "cn",
            Self::Na => "na",
        }
    }
}

impl fmt::Display for SourceKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// One server's progress at fetch time, after source-specific normalization.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct NormalizedRecord {
    pub region: String,
    pub server: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub dc: Option<String>,
    pub progress: f64,
    pub level: u32,
    #[serde(rename = "lastUpdate")]
    pub last_update: String,
    pub source: SourceKind,
}

impl NormalizedRecord {
    pub fn identity_key(&self) -> String {
        identity_key(&self.region, &self.server)
    }
}

/// Key that ties one server's records together across runs.
pub fn identity_key(region: &str, server: &str) -> String {
    format!("{region}-{server}")
}

/// Identity key -> progress of one snapshot.
pub type ProgressIndex = HashMap<String, f64>;

/// One detected progress delta between two consecutive snapshots.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ChangeEvent {
    pub server_id: String,
    pub old_progress: f64,
    pub new_progress: f64,
    pub change_time: String,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ChangeLog {
    #[serde(rename = "type")]
    pub kind: String,
    pub count: usize,
    pub changes: Vec<ChangeEvent>,
}

impl ChangeLog {
    pub fn from_events(changes: Vec<ChangeEvent>) -> Self {
        Self {
            kind: CHANGELOG_KIND.to_string(),
            count: changes.len(),
            changes,
        }
    }
}

/// Clamp a raw percentage into `[0, 100]`; non-finite input becomes 0.
pub fn clamp_progress(value: f64) -> f64 {
    if value.is_nan() {
        return 0.0;
    }
    value.clamp(0.0, 100.0)
}

const CIVIL_OFFSET: FixedOffset = match FixedOffset::east_opt(CIVIL_OFFSET_SECS) {
    Some(offset) => offset,
    None => panic!("civil offset out of range"),
};

pub fn civil_offset() -> FixedOffset {
    CIVIL_OFFSET
}

/// Now, on the fixed UTC+8 civil clock regardless of the host zone.
pub fn current_instant() -> DateTime<FixedOffset> {
    Utc::now().with_timezone(&civil_offset())
}

/// Truncate to the enclosing `:00` or `:30` boundary.
pub fn round_down_to_half_hour(instant: DateTime<FixedOffset>) -> DateTime<FixedOffset> {
    let excess = Duration::minutes(i64::from(instant.minute() % 30))
        + Duration::seconds(i64::from(instant.second()))
        + Duration::nanoseconds(i64::from(instant.nanosecond()));
    instant - excess
}

pub fn format_timestamp(instant: DateTime<FixedOffset>) -> String {
    instant.format(TIMESTAMP_FORMAT).to_string()
}

pub fn format_file_stem(instant: DateTime<FixedOffset>) -> String {
    instant.format(FILE_STEM_FORMAT).to_string()
}

pub fn parse_file_stem(stem: &str) -> Option<NaiveDateTime> {
    NaiveDateTime::parse_from_str(stem, FILE_STEM_FORMAT).ok()
}
