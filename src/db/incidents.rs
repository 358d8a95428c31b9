//! Incident derivation.
//!
//! An incident is a maximal run of consecutive failing results for one check.
//! Incidents are computed on read and never stored.

use chrono::{DateTime, Utc};
use rusqlite::Connection;

use super::models::{CheckResult, Incident, SnapshotRef};
use super::store::{results_between, snapshots_between, DbError};

/// Group failing results into incidents and attach matching snapshots.
///
/// A snapshot belongs to an incident when it is for the same check and its
/// timestamp falls within the incident's first and last failure.
pub fn derive_incidents(results: &[CheckResult], snapshots: &[SnapshotRef]) -> Vec<Incident> {
    let mut ordered: Vec<&CheckResult> = results.iter().collect();
    ordered.sort_by(|a, b| (&a.check, a.timestamp).cmp(&(&b.check, b.timestamp)));

    let mut incidents = Vec::new();
    let mut open: Option<Incident> = None;

    for res in ordered {
        if let Some(current) = open.take() {
            if current.check != res.check {
                incidents.push(current);
            } else {
                open = Some(current);
            }
        }

        if res.passed {
            if let Some(mut current) = open.take() {
                current.resolved = true;
                incidents.push(current);
            }
        } else if let Some(current) = open.as_mut() {
            current.end = res.timestamp;
            current.failures += 1;
        } else {
            open = Some(Incident {
                check: res.check.clone(),
                start: res.timestamp,
                end: res.timestamp,
                status: res.status,
                failures: 1,
                resolved: false,
                snapshots: Vec::new(),
            });
        }
    }
    incidents.extend(open);

    for incident in &mut incidents {
        incident.snapshots = snapshots
            .iter()
            .filter(|s| {
                s.check == incident.check
                    && s.timestamp >= incident.start
                    && s.timestamp <= incident.end
            })
            .map(|s| s.id.clone())
            .collect();
    }

    incidents
}

/// Incidents among the results recorded in `start <= timestamp < end`.
pub fn incidents_between(
    conn: &Connection,
    start: DateTime<Utc>,
    end: DateTime<Utc>,
) -> Result<Vec<Incident>, DbError> {
    let results = results_between(conn, start, end)?;
    let snapshots = snapshots_between(conn, start, end)?;
    Ok(derive_incidents(&results, &snapshots))
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::TimeZone;

    fn at(m: u32) -> DateTime<Utc> {
        Utc.with_ymd_and_hms(2024, 5, 1, 12, m, 0).unwrap()
    }

    fn res(check: &str, m: u32, passed: bool, status: u16) -> CheckResult {
        CheckResult {
            check: check.to_string(),
            timestamp: at(m),
            duration: 0.1,
            size: 0,
            status,
            passed,
            errors: vec![],
        }
    }

    fn snap(id: &str, check: &str, m: u32) -> SnapshotRef {
        SnapshotRef {
            id: id.to_string(),
            check: check.to_string(),
            timestamp: at(m),
        }
    }

    #[test]
    fn test_no_failures_no_incidents() {
        let results = vec![res("web", 0, true, 200), res("web", 5, true, 200)];
        assert!(derive_incidents(&results, &[]).is_empty());
    }

    #[test]
    fn test_groups_contiguous_failures() {
        let results = vec![
            res("web", 0, true, 200),
            res("web", 5, false, 503),
            res("web", 10, false, 500),
            res("web", 15, true, 200),
            res("web", 20, false, 408),
        ];
        let snaps = vec![snap("a", "web", 5), snap("b", "web", 10), snap("c", "api", 10)];

        let incidents = derive_incidents(&results, &snaps);
        assert_eq!(incidents.len(), 2);

        let first = &incidents[0];
        assert_eq!((first.start, first.end), (at(5), at(10)));
        assert_eq!(first.status, 503);
        assert_eq!(first.failures, 2);
        assert!(first.resolved);
        assert_eq!(first.snapshots, vec!["a", "b"]);

        let second = &incidents[1];
        assert_eq!((second.start, second.end), (at(20), at(20)));
        assert!(!second.resolved);
        assert!(second.snapshots.is_empty());
    }

    #[test]
    fn test_runs_do_not_span_checks() {
        // Unordered input, interleaved checks.
        let results = vec![
            res("web", 5, false, 500),
            res("api", 0, false, 502),
            res("web", 0, false, 500),
            res("api", 5, true, 200),
        ];

        let incidents = derive_incidents(&results, &[]);
        assert_eq!(incidents.len(), 2);
        assert_eq!(incidents[0].check, "api");
        assert!(incidents[0].resolved);
        assert_eq!(incidents[1].check, "web");
        assert_eq!(incidents[1].failures, 2);
        assert!(!incidents[1].resolved);
    }
}
