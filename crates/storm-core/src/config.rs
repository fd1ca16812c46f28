use reqwest::header::{HeaderName, HeaderValue};
use reqwest::Method;
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::path::Path;
use std::time::Duration;
use thiserror::Error;
use url::Url;

/// Upper bound for generated request bodies.
pub const MAX_GENERATED_PAYLOAD_BYTES: usize = 16 * 1024 * 1024;

/// Immutable description of one load run.
///
/// Built once (from a TOML file, the command line, or code) and shared
/// read-only with every worker for the lifetime of the run.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct RunConfig {
    /// Target URL, must be http:// or https://
    pub url: String,
    /// HTTP method (GET, POST, PUT, ...)
    pub method: String,
    /// Number of concurrent workers
    pub workers: u32,
    /// Target requests per second, 0 means unlimited
    pub rate: f64,
    /// Token bucket capacity; defaults to the rate rounded up
    pub burst: Option<u32>,
    /// Stop after this many seconds
    pub duration_secs: Option<u64>,
    /// Stop after this many attempts
    pub max_requests: Option<u64>,
    /// Per-request timeout in milliseconds
    pub timeout_ms: u64,
    /// How long in-flight exchanges may run after a stop signal
    pub grace_ms: u64,
    /// Interval between live snapshot publications
    pub report_interval_ms: u64,
    /// Verify TLS certificates of the target
    pub verify_tls: bool,
    /// Seed for request randomization; drawn from entropy when absent
    pub seed: Option<u64>,
    /// Static headers, applied after (and overriding) randomized ones
    pub headers: BTreeMap<String, String>,
    pub randomize: RandomizeConfig,
    pub proxies: ProxyConfig,
}

impl Default for RunConfig {
    fn default() -> Self {
        Self {
            url: String::new(),
            method: "GET".to_string(),
            workers: 50,
            rate: 0.0,
            burst: None,
            duration_secs: None,
            max_requests: None,
            timeout_ms: 10_000,
            grace_ms: 5_000,
            report_interval_ms: 5_000,
            verify_tls: true,
            seed: None,
            headers: BTreeMap::new(),
            randomize: RandomizeConfig::default(),
            proxies: ProxyConfig::default(),
        }
    }
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct RandomizeConfig {
    /// Vary Accept, Accept-Language, Cache-Control and friends per request
    pub headers: bool,
    /// Rotate the User-Agent header
    pub user_agent: bool,
    /// User-Agent candidates; the built-in list is used when empty
    pub user_agents: Vec<String>,
    /// Request bodies to pick from for methods that carry one
    pub payloads: Vec<String>,
    /// Generate a random alphanumeric body of this size instead
    pub payload_bytes: Option<usize>,
    /// Random pause before each exchange (stealth mode)
    pub delay: Option<DelayRange>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct DelayRange {
    pub min_ms: u64,
    pub max_ms: u64,
}

impl Default for DelayRange {
    fn default() -> Self {
        Self {
            min_ms: 10,
            max_ms: 500,
        }
    }
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct ProxyConfig {
    /// Proxy endpoints, e.g. "http://10.0.0.1:3128"
    pub urls: Vec<String>,
    pub selection: ProxySelection,
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ProxySelection {
    #[default]
    RoundRobin,
    Random,
}

#[derive(Debug, Error, PartialEq)]
pub enum ConfigError {
    #[error("invalid target URL {url:?}: {reason}")]
    InvalidUrl { url: String, reason: String },
    #[error("target URL must be http:// or https:// (got scheme {0:?})")]
    UnsupportedScheme(String),
    #[error("invalid HTTP method {0:?}")]
    InvalidMethod(String),
    #[error("worker count must be positive")]
    NoWorkers,
    #[error("rate must be a finite, non-negative number (got {0})")]
    InvalidRate(f64),
    #[error("burst must be positive")]
    ZeroBurst,
    #[error("either duration_secs or max_requests must be set")]
    NoStopCondition,
    #[error("duration_secs must be positive")]
    ZeroDuration,
    #[error("max_requests must be positive")]
    ZeroMaxRequests,
    #[error("timeout_ms must be positive")]
    ZeroTimeout,
    #[error("report_interval_ms must be positive")]
    ZeroReportInterval,
    #[error("delay range min_ms ({min_ms}) exceeds max_ms ({max_ms})")]
    InvalidDelayRange { min_ms: u64, max_ms: u64 },
    #[error("invalid proxy {url:?}: {reason}")]
    InvalidProxy { url: String, reason: String },
    #[error("invalid header {name:?}: {reason}")]
    InvalidHeader { name: String, reason: String },
    #[error("generated payload of {0} bytes exceeds the 16 MiB limit")]
    PayloadTooLarge(usize),
}

impl RunConfig {
    pub fn from_file(path: impl AsRef<Path>) -> anyhow::Result<Self> {
        let contents = std::fs::read_to_string(path)?;
        let config: RunConfig = toml::from_str(&contents)?;
        Ok(config)
    }

    /// Check every option; a run never starts from a config that fails here.
    pub fn validate(&self) -> Result<(), ConfigError> {
        self.target_url()?;
        self.http_method()?;

        if self.workers == 0 {
            return Err(ConfigError::NoWorkers);
        }
        if !self.rate.is_finite() || self.rate < 0.0 {
            return Err(ConfigError::InvalidRate(self.rate));
        }
        if self.burst == Some(0) {
            return Err(ConfigError::ZeroBurst);
        }

        match (self.duration_secs, self.max_requests) {
            (None, None) => return Err(ConfigError::NoStopCondition),
            (Some(0), _) => return Err(ConfigError::ZeroDuration),
            (_, Some(0)) => return Err(ConfigError::ZeroMaxRequests),
            _ => {}
        }

        if self.timeout_ms == 0 {
            return Err(ConfigError::ZeroTimeout);
        }
        if self.report_interval_ms == 0 {
            return Err(ConfigError::ZeroReportInterval);
        }

        if let Some(range) = self.randomize.delay {
            if range.min_ms > range.max_ms {
                return Err(ConfigError::InvalidDelayRange {
                    min_ms: range.min_ms,
                    max_ms: range.max_ms,
                });
            }
        }
        if let Some(size) = self.randomize.payload_bytes {
            if size > MAX_GENERATED_PAYLOAD_BYTES {
                return Err(ConfigError::PayloadTooLarge(size));
            }
        }

        for (name, value) in &self.headers {
            parse_header(name, value)?;
        }

        for proxy in &self.proxies.urls {
            reqwest::Proxy::all(proxy.as_str()).map_err(|e| ConfigError::InvalidProxy {
                url: proxy.clone(),
                reason: e.to_string(),
            })?;
        }

        Ok(())
    }

    pub fn target_url(&self) -> Result<Url, ConfigError> {
        let url = Url::parse(&self.url).map_err(|e| ConfigError::InvalidUrl {
            url: self.url.clone(),
            reason: e.to_string(),
        })?;
        match url.scheme() {
            "http" | "https" => {}
            other => return Err(ConfigError::UnsupportedScheme(other.to_string())),
        }
        if url.host_str().is_none() {
            return Err(ConfigError::InvalidUrl {
                url: self.url.clone(),
                reason: "missing host".to_string(),
            });
        }
        Ok(url)
    }

    pub fn http_method(&self) -> Result<Method, ConfigError> {
        let upper = self.method.trim().to_ascii_uppercase();
        if upper.is_empty() {
            return Err(ConfigError::InvalidMethod(self.method.clone()));
        }
        Method::from_bytes(upper.as_bytes())
            .map_err(|_| ConfigError::InvalidMethod(self.method.clone()))
    }

    /// Token bucket capacity actually used by the rate limiter.
    pub fn effective_burst(&self) -> u64 {
        match self.burst {
            Some(burst) => burst as u64,
            None => (self.rate.ceil() as u64).max(1),
        }
    }

    pub fn duration(&self) -> Option<Duration> {
        self.duration_secs.map(Duration::from_secs)
    }

    pub fn request_timeout(&self) -> Duration {
        Duration::from_millis(self.timeout_ms)
    }

    pub fn grace_period(&self) -> Duration {
        Duration::from_millis(self.grace_ms)
    }

    pub fn report_interval(&self) -> Duration {
        Duration::from_millis(self.report_interval_ms)
    }
}

pub(crate) fn parse_header(name: &str, value: &str) -> Result<(HeaderName, HeaderValue), ConfigError> {
    let header_name =
        HeaderName::from_bytes(name.as_bytes()).map_err(|e| ConfigError::InvalidHeader {
            name: name.to_string(),
            reason: e.to_string(),
        })?;
    let header_value = HeaderValue::from_str(value).map_err(|e| ConfigError::InvalidHeader {
        name: name.to_string(),
        reason: e.to_string(),
    })?;
    Ok((header_name, header_value))
}
