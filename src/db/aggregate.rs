//! Time-bucketed aggregation of check results.
//!
//! Uptime is the mean of `passed` per bucket. Latency is the geometric mean
//! of durations, so a few very slow responses do not dominate a bucket.

use chrono::{DateTime, Duration as ChronoDuration, Utc};
use rusqlite::Connection;
use serde::Serialize;
use std::collections::BTreeMap;
use thiserror::Error;

use super::models::TotalStats;
use super::store::{all_time_stats, results_between, to_epoch, DbError};

/// Durations are floored to this before taking their logarithm.
pub const MIN_DURATION: f64 = 1e-6;

/// Rejected dashboard query parameters.
#[derive(Error, Debug, Clone, PartialEq)]
pub enum QueryError {
    #[error("bucket count must be at least 1")]
    NoBuckets,
    #[error("timespan must be positive")]
    EmptyTimespan,
    #[error("invalid duration {0:?}: {1}")]
    Duration(String, String),
    #[error("invalid end time {0:?}")]
    EndTime(String),
}

/// Running sums for uptime and geometric-mean latency.
#[derive(Debug, Default, Clone, Copy, PartialEq)]
pub(crate) struct Tally {
    count: u64,
    passed: u64,
    log_sum: f64,
    max: f64,
}

impl Tally {
    pub(crate) fn add(&mut self, passed: bool, duration: f64) {
        self.count += 1;
        if passed {
            self.passed += 1;
        }
        self.log_sum += duration.max(MIN_DURATION).ln();
        self.max = self.max.max(duration);
    }

    fn merge(&mut self, other: &Tally) {
        self.count += other.count;
        self.passed += other.passed;
        self.log_sum += other.log_sum;
        self.max = self.max.max(other.max);
    }

    /// NaN when empty.
    fn uptime(&self) -> f64 {
        if self.count == 0 {
            return f64::NAN;
        }
        self.passed as f64 / self.count as f64
    }

    /// NaN when empty.
    fn latency(&self) -> f64 {
        if self.count == 0 {
            return f64::NAN;
        }
        (self.log_sum / self.count as f64).exp()
    }

    fn max_latency(&self) -> f64 {
        if self.count == 0 {
            return f64::NAN;
        }
        self.max
    }

    pub(crate) fn totals(&self) -> TotalStats {
        TotalStats {
            uptime: self.uptime(),
            latency: self.latency(),
            max_latency: self.max_latency(),
        }
    }
}

/// A validated histogram request: `buckets` windows ending at `end`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct HistogramQuery {
    buckets: usize,
    timespan: ChronoDuration,
    end: DateTime<Utc>,
}

impl HistogramQuery {
    pub fn new(
        buckets: usize,
        timespan: ChronoDuration,
        end: DateTime<Utc>,
    ) -> Result<Self, QueryError> {
        if buckets == 0 {
            return Err(QueryError::NoBuckets);
        }
        if timespan <= ChronoDuration::zero() {
            return Err(QueryError::EmptyTimespan);
        }
        Ok(Self {
            buckets,
            timespan,
            end,
        })
    }

    pub fn buckets(&self) -> usize {
        self.buckets
    }

    pub fn timespan(&self) -> ChronoDuration {
        self.timespan
    }

    pub fn end(&self) -> DateTime<Utc> {
        self.end
    }

    pub fn start(&self) -> DateTime<Utc> {
        self.end - self.timespan
    }

    pub fn seconds_per_bucket(&self) -> f64 {
        self.timespan.num_milliseconds() as f64 / 1000.0 / self.buckets as f64
    }

    /// Bucket index for a timestamp, clamped to the valid range.
    pub fn bucket_of(&self, ts: DateTime<Utc>) -> usize {
        let offset = to_epoch(ts) - to_epoch(self.start());
        let idx = (offset / self.seconds_per_bucket()).floor();
        // Negative offsets saturate to 0 in the cast.
        (idx as usize).min(self.buckets - 1)
    }

    /// Start time of every bucket, oldest first.
    pub fn bucket_starts(&self) -> Vec<DateTime<Utc>> {
        let step_ms = self.timespan.num_milliseconds() as f64 / self.buckets as f64;
        (0..self.buckets)
            .map(|i| {
                self.start() + ChronoDuration::milliseconds((step_ms * i as f64).round() as i64)
            })
            .collect()
    }
}

/// Dashboard statistics for one check. NaN marks "no data".
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct CheckSummary {
    /// Per-bucket uptime ratio.
    pub uptime: Vec<f64>,
    /// Per-bucket geometric-mean latency in seconds.
    pub latency: Vec<f64>,
    pub window_uptime: f64,
    pub window_max_latency: f64,
    pub total_uptime: f64,
    pub total_latency: f64,
    pub max_latency: f64,
}

impl CheckSummary {
    fn from_tallies(buckets: &[Tally], totals: Option<TotalStats>) -> Self {
        let mut window = Tally::default();
        for bucket in buckets {
            window.merge(bucket);
        }
        let totals = totals.unwrap_or(TotalStats {
            uptime: f64::NAN,
            latency: f64::NAN,
            max_latency: f64::NAN,
        });

        Self {
            uptime: buckets.iter().map(Tally::uptime).collect(),
            latency: buckets.iter().map(Tally::latency).collect(),
            window_uptime: window.uptime(),
            window_max_latency: window.max_latency(),
            total_uptime: totals.uptime,
            total_latency: totals.latency,
            max_latency: totals.max_latency,
        }
    }
}

/// Aggregated statistics keyed by check name.
pub type Summary = BTreeMap<String, CheckSummary>;

/// Bucket every result in the query window and attach all-time totals.
///
/// Every name in `checks` is present in the output, with all-NaN buckets if
/// it has no data yet.
pub fn aggregate<'a, I>(
    conn: &Connection,
    checks: I,
    query: &HistogramQuery,
) -> Result<Summary, DbError>
where
    I: IntoIterator<Item = &'a str>,
{
    let empty = vec![Tally::default(); query.buckets];
    let mut tallies: BTreeMap<String, Vec<Tally>> = checks
        .into_iter()
        .map(|name| (name.to_string(), empty.clone()))
        .collect();

    for row in results_between(conn, query.start(), query.end)? {
        let bucket = query.bucket_of(row.timestamp);
        tallies.entry(row.check).or_insert_with(|| empty.clone())[bucket]
            .add(row.passed, row.duration);
    }

    let totals = all_time_stats(conn)?;
    Ok(tallies
        .into_iter()
        .map(|(name, buckets)| {
            let summary = CheckSummary::from_tallies(&buckets, totals.get(&name).copied());
            (name, summary)
        })
        .collect())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::db::{initialize, save_check, CheckResult, Store};
    use chrono::TimeZone;

    fn at(h: u32, m: u32) -> DateTime<Utc> {
        Utc.with_ymd_and_hms(2024, 5, 1, h, m, 0).unwrap()
    }

    fn result(check: &str, ts: DateTime<Utc>, passed: bool, duration: f64) -> CheckResult {
        CheckResult {
            check: check.to_string(),
            timestamp: ts,
            duration,
            size: 0,
            status: if passed { 200 } else { 500 },
            passed,
            errors: vec![],
        }
    }

    fn store_with(results: &[CheckResult]) -> (tempfile::TempDir, Store) {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("upcheck.db");
        initialize(&path, false).unwrap();
        let store = Store::open(&path).unwrap();
        store
            .with_connection(false, |conn| {
                for res in results {
                    save_check(conn, res)?;
                }
                Ok(())
            })
            .unwrap();
        (dir, store)
    }

    #[test]
    fn test_query_validation() {
        assert_eq!(
            HistogramQuery::new(0, ChronoDuration::hours(1), at(0, 0)),
            Err(QueryError::NoBuckets)
        );
        assert_eq!(
            HistogramQuery::new(4, ChronoDuration::zero(), at(0, 0)),
            Err(QueryError::EmptyTimespan)
        );
    }

    #[test]
    fn test_bucket_of_clamps() {
        let q = HistogramQuery::new(4, ChronoDuration::hours(4), at(4, 0)).unwrap();
        assert_eq!(q.seconds_per_bucket(), 3600.0);
        assert_eq!(q.bucket_of(at(0, 0)), 0);
        assert_eq!(q.bucket_of(at(0, 59)), 0);
        assert_eq!(q.bucket_of(at(1, 0)), 1);
        assert_eq!(q.bucket_of(at(3, 59)), 3);
        assert_eq!(q.bucket_of(at(4, 0)), 3);
        assert_eq!(q.bucket_of(at(0, 0) - ChronoDuration::minutes(5)), 0);
        assert_eq!(q.bucket_starts(), vec![at(0, 0), at(1, 0), at(2, 0), at(3, 0)]);
    }

    #[test]
    fn test_mixed_bucket_uptime_and_empty_bucket() {
        let (_dir, store) = store_with(&[
            result("web", at(0, 10), true, 0.2),
            result("web", at(0, 40), false, 0.2),
        ]);
        let q = HistogramQuery::new(4, ChronoDuration::hours(4), at(4, 0)).unwrap();

        let summary = store
            .with_connection(true, |conn| aggregate(conn, ["web"], &q))
            .unwrap();
        let web = &summary["web"];

        assert_eq!(web.uptime.len(), 4);
        assert_eq!(web.uptime[0], 0.5);
        assert!(web.uptime[1].is_nan());
        assert!(web.latency[1].is_nan());
        assert_eq!(web.window_uptime, 0.5);
    }

    #[test]
    fn test_always_failing_is_zero_not_nan() {
        let (_dir, store) = store_with(&[result("web", at(2, 0), false, 0.2)]);
        let q = HistogramQuery::new(4, ChronoDuration::hours(4), at(4, 0)).unwrap();

        let summary = store
            .with_connection(true, |conn| aggregate(conn, ["web"], &q))
            .unwrap();
        assert_eq!(summary["web"].uptime[2], 0.0);
    }

    #[test]
    fn test_latency_is_geometric_mean() {
        let (_dir, store) = store_with(&[
            result("web", at(1, 5), true, 1.0),
            result("web", at(1, 10), true, 4.0),
        ]);
        let q = HistogramQuery::new(4, ChronoDuration::hours(4), at(4, 0)).unwrap();

        let summary = store
            .with_connection(true, |conn| aggregate(conn, ["web"], &q))
            .unwrap();
        let web = &summary["web"];
        assert!((web.latency[1] - 2.0).abs() < 1e-9);
        assert_eq!(web.window_max_latency, 4.0);
        assert!((web.total_latency - 2.0).abs() < 1e-9);
    }

    #[test]
    fn test_zero_duration_is_floored() {
        let mut tally = Tally::default();
        tally.add(true, 0.0);
        let latency = tally.latency();
        assert!(latency.is_finite());
        assert!((latency - MIN_DURATION).abs() < 1e-12);
    }

    #[test]
    fn test_totals_cover_history_outside_window() {
        let (_dir, store) = store_with(&[
            result("web", at(0, 30), false, 8.0),
            result("web", at(3, 30), true, 0.5),
        ]);
        // Window only covers the last hour.
        let q = HistogramQuery::new(2, ChronoDuration::hours(1), at(4, 0)).unwrap();

        let summary = store
            .with_connection(true, |conn| aggregate(conn, ["web"], &q))
            .unwrap();
        let web = &summary["web"];
        assert_eq!(web.window_uptime, 1.0);
        assert_eq!(web.total_uptime, 0.5);
        assert_eq!(web.max_latency, 8.0);
        assert_eq!(web.window_max_latency, 0.5);
    }

    #[test]
    fn test_configured_check_without_data_is_listed() {
        let (_dir, store) = store_with(&[result("web", at(1, 0), true, 0.1)]);
        let q = HistogramQuery::new(4, ChronoDuration::hours(4), at(4, 0)).unwrap();

        let summary = store
            .with_connection(true, |conn| aggregate(conn, ["web", "api"], &q))
            .unwrap();
        let api = &summary["api"];
        assert!(api.uptime.iter().all(|u| u.is_nan()));
        assert!(api.latency.iter().all(|l| l.is_nan()));
        assert!(api.window_uptime.is_nan());
        assert!(api.total_uptime.is_nan());
    }
}
