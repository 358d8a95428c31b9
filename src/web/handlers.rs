//! HTTP request handlers.

use super::AppState;
use crate::config::Config;
use crate::db::{
    aggregate, incidents_between, CheckSummary, DbError, HistogramQuery, Incident, QueryError,
    Summary,
};

use axum::{
    extract::{Query, State},
    http::{header, HeaderMap, StatusCode},
    response::{Html, IntoResponse, Json, Response},
};
use chrono::{DateTime, Duration as ChronoDuration, NaiveDate, NaiveDateTime, Timelike, Utc};
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::sync::Arc;

// ============================================================================
// Templates (plain string replacement)
// ============================================================================

const DASHBOARD_TEMPLATE: &str = include_str!("templates/dashboard.html");
const LAYOUT_TEMPLATE: &str = include_str!("templates/layout.html");

/// Upper bound and default for the `buckets` parameter.
pub const MAX_BUCKETS: usize = 24 * 4;
const DEFAULT_DURATION: &str = "1d";
/// The end of a dashboard window is rounded up to a multiple of this.
const END_ALIGNMENT_SECS: u32 = 5 * 60;
/// Uptime below this is shown in red.
pub const UPTIME_GOAL: f64 = 0.99;
const MIN_LATENCY_SCALE: f64 = 1e-5;
const TIME_FORMAT: &str = "%Y-%m-%d %H:%M UTC";

// ============================================================================
// Query parameters
// ============================================================================

/// Raw dashboard parameters as they appear in the query string.
#[derive(Debug, Default, Deserialize)]
pub struct DashboardQuery {
    pub buckets: Option<i64>,
    pub duration: Option<String>,
    pub end: Option<String>,
}

impl DashboardQuery {
    /// Validate the parameters, filling in defaults relative to `now`.
    pub fn resolve(&self, now: DateTime<Utc>) -> Result<HistogramQuery, QueryError> {
        let buckets = self
            .buckets
            .unwrap_or(MAX_BUCKETS as i64)
            .clamp(1, MAX_BUCKETS as i64) as usize;

        let duration = self.duration.as_deref().unwrap_or(DEFAULT_DURATION);
        let timespan = parse_duration(duration)?;

        let end = match &self.end {
            Some(text) => parse_end(text)?,
            None => now,
        };
        let end = align_end(end);

        if end.checked_sub_signed(timespan).is_none() {
            return Err(QueryError::Duration(duration.to_string(), "too long".to_string()));
        }
        HistogramQuery::new(buckets, timespan, end)
    }
}

/// Parse `<number><unit>` where unit is `m`, `h` or `d`, e.g. `90m` or `1.5d`.
pub fn parse_duration(text: &str) -> Result<ChronoDuration, QueryError> {
    let invalid = |reason: &str| QueryError::Duration(text.to_string(), reason.to_string());

    let Some(unit) = text.chars().last() else {
        return Err(invalid("empty"));
    };
    let seconds_per_unit = match unit {
        'm' => 60.0,
        'h' => 60.0 * 60.0,
        'd' => 24.0 * 60.0 * 60.0,
        _ => return Err(invalid("unit must be one of m, h or d")),
    };

    let number = &text[..text.len() - unit.len_utf8()];
    let value: f64 = number.trim().parse().map_err(|_| invalid("not a number"))?;
    if value.is_nan() || value < 0.0 {
        return Err(invalid("must not be negative"));
    }

    let millis = value * seconds_per_unit * 1000.0;
    if !millis.is_finite() || millis >= i64::MAX as f64 {
        return Err(invalid("too long"));
    }
    Ok(ChronoDuration::milliseconds(millis.round() as i64))
}

/// Parse an RFC 3339 timestamp, or a naive ISO-8601 one taken as UTC.
pub fn parse_end(text: &str) -> Result<DateTime<Utc>, QueryError> {
    if let Ok(dt) = DateTime::parse_from_rfc3339(text) {
        return Ok(dt.with_timezone(&Utc));
    }

    for format in [
        "%Y-%m-%dT%H:%M:%S%.f",
        "%Y-%m-%d %H:%M:%S%.f",
        "%Y-%m-%dT%H:%M",
        "%Y-%m-%d %H:%M",
    ] {
        if let Ok(naive) = NaiveDateTime::parse_from_str(text, format) {
            return Ok(naive.and_utc());
        }
    }

    NaiveDate::parse_from_str(text, "%Y-%m-%d")
        .ok()
        .and_then(|date| date.and_hms_opt(0, 0, 0))
        .map(|naive| naive.and_utc())
        .ok_or_else(|| QueryError::EndTime(text.to_string()))
}

/// Drop sub-second precision and round up to the next 5-minute boundary.
pub fn align_end(end: DateTime<Utc>) -> DateTime<Utc> {
    let truncated = end.with_nanosecond(0).unwrap_or(end);
    let secs = truncated.num_seconds_from_midnight();
    let roundup = (END_ALIGNMENT_SECS - secs % END_ALIGNMENT_SECS) % END_ALIGNMENT_SECS;
    truncated
        .checked_add_signed(ChronoDuration::seconds(roundup as i64))
        .unwrap_or(truncated)
}

/// True when the Accept header ranks JSON above HTML.
pub fn prefers_json(headers: &HeaderMap) -> bool {
    let Some(accept) = headers.get(header::ACCEPT).and_then(|v| v.to_str().ok()) else {
        return false;
    };
    accept_quality(accept, "application/json") > accept_quality(accept, "text/html")
}

fn accept_quality(accept: &str, mime: &str) -> f32 {
    accept
        .split(',')
        .filter_map(|part| {
            let mut params = part.split(';');
            let media = params.next()?.trim();
            let q = params
                .find_map(|p| p.trim().strip_prefix("q="))
                .and_then(|q| q.parse().ok())
                .unwrap_or(1.0);
            media_matches(media, mime).then_some(q)
        })
        .fold(0.0, f32::max)
}

fn media_matches(media: &str, mime: &str) -> bool {
    if media == mime || media == "*/*" {
        return true;
    }
    match media.strip_suffix("/*") {
        Some(kind) => mime.split('/').next() == Some(kind),
        None => false,
    }
}

// ============================================================================
// Colors
// ============================================================================

pub fn lat_to_color(latency: f64, degraded: f64) -> &'static str {
    if latency.is_nan() {
        "gray"
    } else if latency > 2.0 * degraded {
        "red"
    } else if latency > degraded {
        "orange"
    } else {
        "green"
    }
}

pub fn uptime_to_color(uptime: f64, goal: f64) -> &'static str {
    if uptime.is_nan() {
        "gray"
    } else if uptime >= 1.0 {
        "green"
    } else if uptime < goal {
        "red"
    } else {
        "orange"
    }
}

// ============================================================================
// Views
// ============================================================================

/// Dashboard payload. NaN statistics serialize as `null`.
#[derive(Debug, Serialize)]
pub struct DashboardView<'a> {
    pub start: DateTime<Utc>,
    pub end: DateTime<Utc>,
    pub buckets: usize,
    pub bucket_starts: Vec<DateTime<Utc>>,
    pub uptime_goal: f64,
    pub checks: BTreeMap<&'a str, CheckView<'a>>,
}

/// One check on the dashboard. Checks that only exist in storage have no
/// url, method or degraded latency.
#[derive(Debug, Serialize)]
pub struct CheckView<'a> {
    pub url: Option<&'a str>,
    pub method: Option<&'a str>,
    pub degraded_latency: Option<f64>,
    /// Largest per-bucket latency in the window.
    pub max_bucket_latency: f64,
    #[serde(flatten)]
    pub summary: &'a CheckSummary,
}

impl<'a> DashboardView<'a> {
    pub fn new(config: &'a Config, query: &HistogramQuery, summary: &'a Summary) -> Self {
        let checks = summary
            .iter()
            .map(|(name, stats)| {
                let spec = config.checks.get(name);
                let view = CheckView {
                    url: spec.map(|s| s.url.as_str()),
                    method: spec.map(|s| s.method.as_str()),
                    degraded_latency: spec.map(|s| s.timeout_degraded.as_secs_f64()),
                    max_bucket_latency: stats
                        .latency
                        .iter()
                        .copied()
                        .filter(|l| !l.is_nan())
                        .fold(MIN_LATENCY_SCALE, f64::max),
                    summary: stats,
                };
                (name.as_str(), view)
            })
            .collect();

        Self {
            start: query.start(),
            end: query.end(),
            buckets: query.buckets(),
            bucket_starts: query.bucket_starts(),
            uptime_goal: UPTIME_GOAL,
            checks,
        }
    }
}

fn render_dashboard(view: &DashboardView) -> String {
    let rows = view
        .checks
        .iter()
        .map(|(name, check)| render_row(name, check, view))
        .collect::<Vec<_>>()
        .join("\n");

    let content = DASHBOARD_TEMPLATE
        .replace("{{start_time}}", &view.start.format(TIME_FORMAT).to_string())
        .replace("{{end_time}}", &view.end.format(TIME_FORMAT).to_string())
        .replace("{{bucket_count}}", &view.buckets.to_string())
        .replace("{{rows}}", &rows);

    LAYOUT_TEMPLATE
        .replace("{{title}}", "Status")
        .replace("{{content}}", &content)
}

fn render_row(name: &str, check: &CheckView, view: &DashboardView) -> String {
    let stats = check.summary;
    let degraded = check.degraded_latency.unwrap_or(check.max_bucket_latency);

    let uptime_bars: String = stats
        .uptime
        .iter()
        .zip(&view.bucket_starts)
        .map(|(uptime, start)| {
            format!(
                r#"<div class="bar {}" title="{}: {} up"></div>"#,
                uptime_to_color(*uptime, view.uptime_goal),
                start.format(TIME_FORMAT),
                format_ratio(*uptime),
            )
        })
        .collect();

    let latency_bars: String = stats
        .latency
        .iter()
        .zip(&view.bucket_starts)
        .map(|(latency, start)| {
            format!(
                r#"<div class="bar {}" title="{}: {}"></div>"#,
                lat_to_color(*latency, degraded),
                start.format(TIME_FORMAT),
                format_latency(*latency),
            )
        })
        .collect();

    let target = match (check.method, check.url) {
        (Some(method), Some(url)) => format!("{} {}", method, escape_html(url)),
        _ => "no longer configured".to_string(),
    };

    format!(
        r#"    <tr>
        <td><strong>{}</strong><div class="muted">{}</div></td>
        <td class="stat {}">{}</td>
        <td class="stat {}">{}</td>
        <td>
            <div class="bars uptime">{}</div>
            <div class="bars latency">{}</div>
        </td>
        <td class="muted">{} up, {} typical, {} max</td>
    </tr>"#,
        escape_html(name),
        target,
        uptime_to_color(stats.window_uptime, view.uptime_goal),
        format_ratio(stats.window_uptime),
        lat_to_color(stats.window_max_latency, degraded),
        format_latency(stats.window_max_latency),
        uptime_bars,
        latency_bars,
        format_ratio(stats.total_uptime),
        format_latency(stats.total_latency),
        format_latency(stats.max_latency),
    )
}

fn format_ratio(ratio: f64) -> String {
    if ratio.is_nan() {
        return "n/a".to_string();
    }
    format!("{:.2}%", ratio * 100.0)
}

fn format_latency(secs: f64) -> String {
    if secs.is_nan() {
        "n/a".to_string()
    } else if secs < 1.0 {
        format!("{:.0} ms", secs * 1000.0)
    } else {
        format!("{:.2} s", secs)
    }
}

fn escape_html(text: &str) -> String {
    text.replace('&', "&amp;")
        .replace('<', "&lt;")
        .replace('>', "&gt;")
        .replace('"', "&quot;")
        .replace('\'', "&#39;")
}

// ============================================================================
// Handlers
// ============================================================================

fn bad_request(e: QueryError) -> Response {
    (StatusCode::BAD_REQUEST, e.to_string()).into_response()
}

fn server_error(e: DbError) -> Response {
    tracing::error!("Dashboard query failed: {}", e);
    (StatusCode::INTERNAL_SERVER_ERROR, e.to_string()).into_response()
}

/// Aggregate through the cache; identical queries within the TTL share one result.
fn load_summary(state: &AppState, query: HistogramQuery) -> Result<Arc<Summary>, DbError> {
    state.cache.get_or_try_insert_with(query, || {
        let summary = state
            .store
            .with_connection(true, |conn| aggregate(conn, state.config.check_names(), &query))?;
        Ok(Arc::new(summary))
    })
}

pub async fn handle_dashboard(
    State(state): State<AppState>,
    headers: HeaderMap,
    Query(params): Query<DashboardQuery>,
) -> Response {
    let query = match params.resolve(Utc::now()) {
        Ok(q) => q,
        Err(e) => return bad_request(e),
    };
    let summary = match load_summary(&state, query) {
        Ok(s) => s,
        Err(e) => return server_error(e),
    };

    let view = DashboardView::new(&state.config, &query, &summary);
    if prefers_json(&headers) {
        Json(view).into_response()
    } else {
        Html(render_dashboard(&view)).into_response()
    }
}

pub async fn handle_summary(
    State(state): State<AppState>,
    Query(params): Query<DashboardQuery>,
) -> Response {
    let query = match params.resolve(Utc::now()) {
        Ok(q) => q,
        Err(e) => return bad_request(e),
    };
    match load_summary(&state, query) {
        Ok(summary) => Json(DashboardView::new(&state.config, &query, &summary)).into_response(),
        Err(e) => server_error(e),
    }
}

#[derive(Debug, Serialize)]
pub struct IncidentsResponse {
    pub start: DateTime<Utc>,
    pub end: DateTime<Utc>,
    pub incidents: Vec<Incident>,
}

pub async fn handle_incidents(
    State(state): State<AppState>,
    Query(params): Query<DashboardQuery>,
) -> Response {
    let query = match params.resolve(Utc::now()) {
        Ok(q) => q,
        Err(e) => return bad_request(e),
    };
    let (start, end) = (query.start(), query.end());

    match state
        .store
        .with_connection(true, |conn| incidents_between(conn, start, end))
    {
        Ok(incidents) => Json(IncidentsResponse { start, end, incidents }).into_response(),
        Err(e) => server_error(e),
    }
}

pub async fn handle_favicon() -> impl IntoResponse {
    let svg = r##"<svg xmlns="http://www.w3.org/2000/svg" viewBox="0 0 100 100">
        <circle cx="50" cy="50" r="45" fill="#3fb950"/>
        <path d="M30 52 L45 67 L72 36" stroke="white" stroke-width="9" fill="none"/>
    </svg>"##;

    ([(header::CONTENT_TYPE, "image/svg+xml")], svg)
}
