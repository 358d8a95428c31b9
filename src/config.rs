//! Configuration module for upcheck.
//!
//! Loads a TOML file with a `[core]` table and one `[host.<name>]` table per
//! check. A few settings can be overridden from environment variables.

use regex::Regex;
use reqwest::Method;
use serde::{de::Error as _, Deserialize, Deserializer};
use std::collections::{BTreeMap, BTreeSet};
use std::env;
use std::path::Path;
use std::time::Duration;
use thiserror::Error;

/// Configuration error types.
#[derive(Error, Debug)]
pub enum ConfigError {
    #[error("failed to read config: {0}")]
    Io(#[from] std::io::Error),
    #[error("failed to parse config: {0}")]
    Toml(#[from] toml::de::Error),
    #[error("invalid config: {0}")]
    Invalid(String),
}

/// Complete runtime configuration, immutable after load.
#[derive(Debug, Clone, Deserialize)]
pub struct Config {
    pub core: CoreConfig,
    #[serde(rename = "host", default)]
    pub checks: BTreeMap<String, CheckSpec>,
}

/// Settings shared by every check and the web server.
#[derive(Debug, Clone, Deserialize)]
pub struct CoreConfig {
    /// Public address of this instance, substituted into the user agent.
    pub domain: String,
    #[serde(default = "default_port")]
    pub port: u16,
    /// User agent template; `{domain}` is replaced on load.
    #[serde(default = "default_user_agent")]
    pub user_agent: String,
    /// Time between two probes of the same check.
    #[serde(default = "default_interval", deserialize_with = "deserialize_seconds")]
    pub interval: Duration,
    /// Upper bound of the random delay before a check's first probe.
    #[serde(default = "default_jitter", deserialize_with = "deserialize_seconds")]
    pub jitter: Duration,
    #[serde(default = "default_db_path")]
    pub db_path: String,
    /// How long aggregated dashboard data is served from cache.
    #[serde(default = "default_cache_ttl", deserialize_with = "deserialize_seconds")]
    pub cache_ttl: Duration,
}

/// One monitored endpoint.
#[derive(Debug, Clone, Deserialize)]
pub struct CheckSpec {
    /// Filled in from the table key.
    #[serde(skip)]
    pub name: String,
    #[serde(default = "default_method", deserialize_with = "deserialize_method")]
    pub method: Method,
    pub url: String,
    #[serde(default = "default_timeout", deserialize_with = "deserialize_seconds")]
    pub timeout: Duration,
    /// Latency above which the dashboard shows the check as degraded.
    #[serde(default = "default_timeout_degraded", deserialize_with = "deserialize_seconds")]
    pub timeout_degraded: Duration,
    /// Accepted status codes. A single integer is accepted too.
    #[serde(default = "default_status", deserialize_with = "deserialize_status")]
    pub status: BTreeSet<u16>,
    /// Pattern the response body must match.
    #[serde(default, deserialize_with = "deserialize_pattern")]
    pub body: Option<Regex>,
}

impl CheckSpec {
    /// A `GET` check with default criteria.
    pub fn new(name: &str, url: &str) -> Self {
        Self {
            name: name.to_string(),
            method: default_method(),
            url: url.to_string(),
            timeout: default_timeout(),
            timeout_degraded: default_timeout_degraded(),
            status: default_status(),
            body: None,
        }
    }
}

fn default_port() -> u16 {
    8080
}

fn default_user_agent() -> String {
    "Mozilla/5.0 (compatible; upcheck-bot; +{domain})".to_string()
}

fn default_interval() -> Duration {
    Duration::from_secs(5 * 60)
}

fn default_jitter() -> Duration {
    Duration::from_secs(5)
}

fn default_db_path() -> String {
    "upcheck.db".to_string()
}

fn default_cache_ttl() -> Duration {
    Duration::from_secs(30)
}

fn default_method() -> Method {
    Method::GET
}

fn default_timeout() -> Duration {
    Duration::from_secs(60)
}

fn default_timeout_degraded() -> Duration {
    Duration::from_secs(2)
}

fn default_status() -> BTreeSet<u16> {
    BTreeSet::from([200])
}

fn deserialize_seconds<'de, D: Deserializer<'de>>(d: D) -> Result<Duration, D::Error> {
    let secs = f64::deserialize(d)?;
    Duration::try_from_secs_f64(secs)
        .map_err(|_| D::Error::custom(format!("invalid number of seconds: {secs}")))
}

fn deserialize_method<'de, D: Deserializer<'de>>(d: D) -> Result<Method, D::Error> {
    let name = String::deserialize(d)?;
    Method::from_bytes(name.to_uppercase().as_bytes())
        .map_err(|_| D::Error::custom(format!("invalid HTTP method: {name}")))
}

fn deserialize_status<'de, D: Deserializer<'de>>(d: D) -> Result<BTreeSet<u16>, D::Error> {
    #[derive(Deserialize)]
    #[serde(untagged)]
    enum StatusSet {
        One(u16),
        Many(Vec<u16>),
    }

    Ok(match StatusSet::deserialize(d)? {
        StatusSet::One(code) => BTreeSet::from([code]),
        StatusSet::Many(codes) => codes.into_iter().collect(),
    })
}

fn deserialize_pattern<'de, D: Deserializer<'de>>(d: D) -> Result<Option<Regex>, D::Error> {
    Option::<String>::deserialize(d)?
        .map(|pattern| Regex::new(&pattern).map_err(D::Error::custom))
        .transpose()
}

impl Config {
    /// Load from the file named by `UPCHECK_CONFIG` (default: "upcheck.toml").
    ///
    /// Environment overrides:
    /// - `UPCHECK_DB_PATH`: database file path
    /// - `UPCHECK_HTTP_PORT`: HTTP port
    pub fn load() -> Result<Self, ConfigError> {
        let path = env::var("UPCHECK_CONFIG").unwrap_or_else(|_| "upcheck.toml".to_string());
        let mut cfg = Self::from_file(&path)?;

        if let Ok(db_path) = env::var("UPCHECK_DB_PATH") {
            cfg.core.db_path = db_path;
        }

        if let Ok(port_str) = env::var("UPCHECK_HTTP_PORT") {
            match port_str.parse() {
                Ok(port) => cfg.core.port = port,
                Err(_) => tracing::warn!("Ignoring invalid UPCHECK_HTTP_PORT {:?}", port_str),
            }
        }

        Ok(cfg)
    }

    pub fn from_file<P: AsRef<Path>>(path: P) -> Result<Self, ConfigError> {
        let text = std::fs::read_to_string(path)?;
        Self::from_toml_str(&text)
    }

    pub fn from_toml_str(text: &str) -> Result<Self, ConfigError> {
        let mut cfg: Config = toml::from_str(text)?;

        cfg.core.user_agent = cfg.core.user_agent.replace("{domain}", &cfg.core.domain);
        for (name, check) in cfg.checks.iter_mut() {
            check.name = name.clone();
        }

        cfg.validate()?;
        Ok(cfg)
    }

    fn validate(&self) -> Result<(), ConfigError> {
        if self.core.interval.is_zero() {
            return Err(ConfigError::Invalid("interval must be positive".to_string()));
        }
        for check in self.checks.values() {
            reqwest::Url::parse(&check.url).map_err(|e| {
                ConfigError::Invalid(format!(
                    "check {}: bad url {:?}: {}",
                    check.name, check.url, e
                ))
            })?;
            if check.timeout.is_zero() {
                return Err(ConfigError::Invalid(format!(
                    "check {}: timeout must be positive",
                    check.name
                )));
            }
            if check.status.is_empty() {
                return Err(ConfigError::Invalid(format!(
                    "check {}: no accepted status codes",
                    check.name
                )));
            }
        }
        Ok(())
    }

    /// Configured check names, in order.
    pub fn check_names(&self) -> impl Iterator<Item = &str> {
        self.checks.keys().map(String::as_str)
    }
}
