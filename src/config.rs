use std::net::SocketAddr;
use std::path::PathBuf;
use std::time::Duration;

/// Runtime configuration, read from CHARTHOUSE_* environment variables.
#[derive(Debug, Clone)]
pub struct Config {
    /// Root directory of the artifact storage.
    pub storage_root: PathBuf,
    /// Hostname artifact URLs are advertised under.
    pub storage_hostname: String,
    /// Artifacts younger than this survive garbage collection.
    pub artifact_retention_ttl: Duration,
    /// Number of recent artifacts that survive garbage collection.
    pub artifact_retention_records: usize,
    /// Concurrent reconciliations per kind.
    pub workers: usize,
    /// Requeue interval when the object does not set one.
    pub default_requeue_interval: Duration,
    /// Default timeout for network operations.
    pub default_timeout: Duration,
    /// Listen address of the metrics endpoint.
    pub metrics_addr: SocketAddr,
}

impl Default for Config {
    fn default() -> Self {
        Self {
            storage_root: PathBuf::from("./data"),
            storage_hostname: "localhost:9090".to_string(),
            artifact_retention_ttl: Duration::from_secs(60),
            artifact_retention_records: 2,
            workers: 2,
            default_requeue_interval: Duration::from_secs(600),
            default_timeout: Duration::from_secs(60),
            metrics_addr: "0.0.0.0:9402".parse().unwrap(),
        }
    }
}

fn env_parse<T: std::str::FromStr>(key: &str) -> Option<T> {
    std::env::var(key).ok().and_then(|v| v.parse().ok())
}

impl Config {
    pub fn from_env() -> Self {
        let defaults = Self::default();
        Self {
            storage_root: env_parse("CHARTHOUSE_STORAGE_ROOT").unwrap_or(defaults.storage_root),
            storage_hostname: std::env::var("CHARTHOUSE_STORAGE_HOSTNAME")
                .unwrap_or(defaults.storage_hostname),
            artifact_retention_ttl: env_parse("CHARTHOUSE_ARTIFACT_RETENTION_TTL")
                .map(Duration::from_secs)
                .unwrap_or(defaults.artifact_retention_ttl),
            artifact_retention_records: env_parse("CHARTHOUSE_ARTIFACT_RETENTION_RECORDS")
                .unwrap_or(defaults.artifact_retention_records),
            workers: env_parse("CHARTHOUSE_WORKERS").unwrap_or(defaults.workers),
            default_requeue_interval: env_parse("CHARTHOUSE_REQUEUE_INTERVAL")
                .map(Duration::from_secs)
                .unwrap_or(defaults.default_requeue_interval),
            default_timeout: env_parse("CHARTHOUSE_TIMEOUT")
                .map(Duration::from_secs)
                .unwrap_or(defaults.default_timeout),
            metrics_addr: env_parse("CHARTHOUSE_METRICS_ADDR").unwrap_or(defaults.metrics_addr),
        }
    }
}

/// Parses a duration string like "60s", "5m" or "1h30m". Used for the
/// interval and timeout fields on specs.
pub fn parse_duration(value: &str) -> Option<Duration> {
    let mut total = Duration::ZERO;
    let mut number = String::new();
    for c in value.trim().chars() {
        if c.is_ascii_digit() {
            number.push(c);
            continue;
        }
        let amount: u64 = number.parse().ok()?;
        number.clear();
        let unit = match c {
            's' => Duration::from_secs(1),
            'm' => Duration::from_secs(60),
            'h' => Duration::from_secs(3600),
            _ => return None,
        };
        total += unit * amount as u32;
    }
    if !number.is_empty() {
        // A bare number is seconds.
        total += Duration::from_secs(number.parse().ok()?);
    }
    if total.is_zero() {
        None
    } else {
        Some(total)
    }
}
