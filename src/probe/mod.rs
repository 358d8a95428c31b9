//! Probe module for endpoint checks.
//!
//! The scheduler only sees the [`Probe`] trait; [`HttpProbe`] is the real
//! network implementation.

mod http;

pub use http::*;

use chrono::{DateTime, Utc};
use std::future::Future;
use thiserror::Error;

use crate::config::CheckSpec;
use crate::db::{CheckResult, Outcome};

/// Status recorded when the request timed out client-side.
pub const TIMEOUT_STATUS: u16 = 408;
/// Status recorded when no response was received at all.
pub const NO_RESPONSE_STATUS: u16 = 0;

/// Probe error types.
#[derive(Error, Debug)]
pub enum ProbeError {
    #[error("failed to build HTTP client: {0}")]
    Client(#[from] reqwest::Error),
}

/// Something that can run one check against its endpoint.
///
/// Failures of the endpoint are reported inside the returned [`Outcome`],
/// never as an error.
pub trait Probe: Send + Sync + 'static {
    fn probe(&self, spec: &CheckSpec, user_agent: &str) -> impl Future<Output = Outcome> + Send;
}

/// Decide whether a response satisfies the check.
///
/// Returns the verdict and one reason per failed criterion.
pub fn evaluate(spec: &CheckSpec, status: u16, body: &str) -> (bool, Vec<String>) {
    let mut errors = Vec::new();

    if !spec.status.contains(&status) {
        errors.push("Status check failed".to_string());
    }

    if let Some(pattern) = &spec.body {
        if !pattern.is_match(body) {
            errors.push("Body check failed".to_string());
        }
    }

    (errors.is_empty(), errors)
}

/// Result recorded when the request did not finish within the check timeout.
pub fn timed_out(spec: &CheckSpec, timestamp: DateTime<Utc>) -> CheckResult {
    CheckResult {
        check: spec.name.clone(),
        timestamp,
        duration: spec.timeout.as_secs_f64(),
        size: 0,
        status: TIMEOUT_STATUS,
        passed: false,
        errors: vec!["Connection timed out".to_string()],
    }
}
