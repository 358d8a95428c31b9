//! HTTP probe implementation.

use chrono::Utc;
use reqwest::header::USER_AGENT;
use std::collections::BTreeMap;
use std::time::{Duration, Instant};
use uuid::Uuid;

use super::{evaluate, timed_out, Probe, ProbeError, NO_RESPONSE_STATUS};
use crate::config::CheckSpec;
use crate::db::{CheckResult, Outcome, Snapshot};

/// Redirects followed before giving up.
const MAX_REDIRECTS: usize = 10;

/// Probe that performs one HTTP request per check.
#[derive(Debug, Clone)]
pub struct HttpProbe {
    client: reqwest::Client,
}

impl HttpProbe {
    pub fn new() -> Result<Self, ProbeError> {
        let client = reqwest::Client::builder()
            .redirect(reqwest::redirect::Policy::limited(MAX_REDIRECTS))
            .build()?;
        Ok(Self { client })
    }
}

impl Probe for HttpProbe {
    async fn probe(&self, spec: &CheckSpec, user_agent: &str) -> Outcome {
        let timestamp = Utc::now();
        let start = Instant::now();

        let response = match self
            .client
            .request(spec.method.clone(), &spec.url)
            .timeout(spec.timeout)
            .header(USER_AGENT, user_agent)
            .send()
            .await
        {
            Ok(response) => response,
            Err(e) if e.is_timeout() => return Outcome::Result(timed_out(spec, timestamp)),
            Err(e) => return Outcome::Result(no_response(spec, timestamp, start.elapsed(), &e)),
        };

        let status = response.status().as_u16();
        let headers: BTreeMap<String, String> = response
            .headers()
            .iter()
            .map(|(name, value)| {
                (
                    name.as_str().to_string(),
                    String::from_utf8_lossy(value.as_bytes()).into_owned(),
                )
            })
            .collect();

        // Read the full body so the duration covers the complete transfer.
        let body = match response.bytes().await {
            Ok(body) => body,
            Err(e) if e.is_timeout() => return Outcome::Result(timed_out(spec, timestamp)),
            Err(e) => return Outcome::Result(no_response(spec, timestamp, start.elapsed(), &e)),
        };
        let duration = start.elapsed().as_secs_f64();
        let content = String::from_utf8_lossy(&body).into_owned();
        let (passed, errors) = evaluate(spec, status, &content);

        let result = CheckResult {
            check: spec.name.clone(),
            timestamp,
            duration,
            size: body.len() as i64,
            status,
            passed,
            errors,
        };

        if passed {
            return Outcome::Result(result);
        }

        tracing::debug!("Check {} failed with status {}, capturing snapshot", spec.name, status);
        let snapshot = Snapshot {
            id: Uuid::new_v4().to_string(),
            check: spec.name.clone(),
            timestamp,
            duration,
            size: result.size,
            status,
            headers,
            content,
        };
        Outcome::Both(result, snapshot)
    }
}

fn no_response(
    spec: &CheckSpec,
    timestamp: chrono::DateTime<Utc>,
    elapsed: Duration,
    err: &reqwest::Error,
) -> CheckResult {
    CheckResult {
        check: spec.name.clone(),
        timestamp,
        duration: elapsed.as_secs_f64(),
        size: 0,
        status: NO_RESPONSE_STATUS,
        passed: false,
        errors: vec![format!("Connection failed: {}", err)],
    }
}
