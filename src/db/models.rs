//! Database model types.

use chrono::{DateTime, Utc};
use serde::Serialize;
use std::collections::BTreeMap;

/// One probe outcome for a check.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct CheckResult {
    pub check: String,
    /// Probe start time.
    pub timestamp: DateTime<Utc>,
    /// Response time in seconds.
    pub duration: f64,
    /// Response body size in bytes.
    pub size: i64,
    pub status: u16,
    pub passed: bool,
    /// Human readable failure reasons, empty when the check passed.
    pub errors: Vec<String>,
}

/// Full response captured for a failing check.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct Snapshot {
    pub id: String,
    pub check: String,
    pub timestamp: DateTime<Utc>,
    pub duration: f64,
    pub size: i64,
    pub status: u16,
    pub headers: BTreeMap<String, String>,
    pub content: String,
}

/// Identifying columns of a stored snapshot, without the payload.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct SnapshotRef {
    pub id: String,
    pub check: String,
    pub timestamp: DateTime<Utc>,
}

impl From<&Snapshot> for SnapshotRef {
    fn from(snap: &Snapshot) -> Self {
        Self {
            id: snap.id.clone(),
            check: snap.check.clone(),
            timestamp: snap.timestamp,
        }
    }
}

/// What a probe hands to the writer.
#[derive(Debug, Clone, Serialize)]
#[serde(tag = "kind", content = "data", rename_all = "snake_case")]
pub enum Outcome {
    Result(CheckResult),
    Snapshot(Snapshot),
    Both(CheckResult, Snapshot),
}

impl Outcome {
    pub fn result(&self) -> Option<&CheckResult> {
        match self {
            Outcome::Result(res) | Outcome::Both(res, _) => Some(res),
            Outcome::Snapshot(_) => None,
        }
    }

    pub fn snapshot(&self) -> Option<&Snapshot> {
        match self {
            Outcome::Snapshot(snap) | Outcome::Both(_, snap) => Some(snap),
            Outcome::Result(_) => None,
        }
    }
}

/// All-time statistics for one check.
#[derive(Debug, Clone, Copy, PartialEq, Serialize)]
pub struct TotalStats {
    pub uptime: f64,
    /// Geometric mean of all recorded durations.
    pub latency: f64,
    pub max_latency: f64,
}

/// A maximal run of failing results for one check.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct Incident {
    pub check: String,
    pub start: DateTime<Utc>,
    pub end: DateTime<Utc>,
    /// Status code of the first failing result.
    pub status: u16,
    /// Number of failing results in the run.
    pub failures: usize,
    /// A passing result was recorded after the run.
    pub resolved: bool,
    pub snapshots: Vec<String>,
}
