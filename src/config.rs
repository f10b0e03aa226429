//! Configuration module for wpsmon.
//!
//! Loads configuration from environment variables with sensible defaults.

use chrono::NaiveTime;
use std::env;
use std::str::FromStr;
use std::time::Duration;

/// Server configuration loaded from environment variables.
#[derive(Debug, Clone)]
pub struct ServerConfig {
    /// HTTP port for the REST interface (default: 8080)
    pub http_port: u16,
    /// Path to the SQLite database file (default: "wpsmon.db")
    pub db_path: String,
    /// Connect/read timeout for a single WPS probe (default: 30s)
    pub probe_timeout: Duration,
    /// Consecutive failed firings before a process is paused (default: 3)
    pub max_errors: u32,
    /// Measurements older than this many days are deleted; 0 disables cleanup (default: 30)
    pub retention_days: u32,
    /// UTC time of day at which the cleanup job runs (default: 03:00)
    pub cleanup_time: NaiveTime,
    /// Maximum number of firings executing at once across all jobs (default: 10)
    pub worker_pool_size: usize,
    /// How long shutdown waits for in-flight firings (default: 10s)
    pub shutdown_grace: Duration,
}

impl Default for ServerConfig {
    fn default() -> Self {
        Self {
            http_port: 8080,
            db_path: "wpsmon.db".to_string(),
            probe_timeout: Duration::from_secs(30),
            max_errors: 3,
            retention_days: 30,
            cleanup_time: NaiveTime::from_hms_opt(3, 0, 0).unwrap_or_default(),
            worker_pool_size: 10,
            shutdown_grace: Duration::from_secs(10),
        }
    }
}

impl ServerConfig {
    /// Load configuration from environment variables.
    ///
    /// Environment variables:
    /// - `WPSMON_HTTP_PORT`: HTTP port (default: 8080)
    /// - `WPSMON_DB_PATH`: Database file path (default: "wpsmon.db")
    /// - `WPSMON_PROBE_TIMEOUT`: probe timeout in seconds (default: 30)
    /// - `WPSMON_MAX_ERRORS`: failure threshold (default: 3)
    /// - `WPSMON_RETENTION_DAYS`: measurement retention, 0 = off (default: 30)
    /// - `WPSMON_CLEANUP_TIME`: "HH:MM" in UTC (default: "03:00")
    /// - `WPSMON_WORKER_POOL_SIZE`: concurrent firings (default: 10)
    /// - `WPSMON_SHUTDOWN_GRACE`: seconds to wait on shutdown (default: 10)
    pub fn load() -> Self {
        Self::from_lookup(|key| env::var(key).ok())
    }

    fn from_lookup<F>(lookup: F) -> Self
    where
        F: Fn(&str) -> Option<String>,
    {
        let mut cfg = Self::default();

        if let Some(port) = parse_var(&lookup, "WPSMON_HTTP_PORT") {
            cfg.http_port = port;
        }

        if let Some(db_path) = lookup("WPSMON_DB_PATH") {
            cfg.db_path = db_path;
        }

        if let Some(secs) = parse_var::<u64, _>(&lookup, "WPSMON_PROBE_TIMEOUT") {
            if secs > 0 {
                cfg.probe_timeout = Duration::from_secs(secs);
            }
        }

        if let Some(max_errors) = parse_var::<u32, _>(&lookup, "WPSMON_MAX_ERRORS") {
            cfg.max_errors = max_errors.max(1);
        }

        if let Some(days) = parse_var(&lookup, "WPSMON_RETENTION_DAYS") {
            cfg.retention_days = days;
        }

        if let Some(raw) = lookup("WPSMON_CLEANUP_TIME") {
            match NaiveTime::parse_from_str(&raw, "%H:%M") {
                Ok(t) => cfg.cleanup_time = t,
                Err(e) => tracing::warn!("Ignoring WPSMON_CLEANUP_TIME={:?}: {}", raw, e),
            }
        }

        if let Some(size) = parse_var::<usize, _>(&lookup, "WPSMON_WORKER_POOL_SIZE") {
            cfg.worker_pool_size = size.max(1);
        }

        if let Some(secs) = parse_var(&lookup, "WPSMON_SHUTDOWN_GRACE") {
            cfg.shutdown_grace = Duration::from_secs(secs);
        }

        cfg
    }
}

fn parse_var<T, F>(lookup: &F, key: &str) -> Option<T>
where
    T: FromStr,
    T::Err: std::fmt::Display,
    F: Fn(&str) -> Option<String>,
{
    let raw = lookup(key)?;
    match raw.trim().parse() {
        Ok(v) => Some(v),
        Err(e) => {
            tracing::warn!("Ignoring {}={:?}: {}", key, raw, e);
            None
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::HashMap;

    #[test]
    fn test_default_config() {
        let cfg = ServerConfig::default();
        assert_eq!(cfg.http_port, 8080);
        assert_eq!(cfg.db_path, "wpsmon.db");
        assert_eq!(cfg.max_errors, 3);
        assert_eq!(cfg.retention_days, 30);
        assert_eq!(cfg.cleanup_time, NaiveTime::from_hms_opt(3, 0, 0).unwrap());
    }

    #[test]
    fn test_overrides_and_bad_values() {
        let vars: HashMap<&str, &str> = [
            ("WPSMON_HTTP_PORT", "9090"),
            ("WPSMON_PROBE_TIMEOUT", "5"),
            ("WPSMON_MAX_ERRORS", "0"),
            ("WPSMON_RETENTION_DAYS", "not-a-number"),
            ("WPSMON_CLEANUP_TIME", "23:15"),
        ]
        .into_iter()
        .collect();

        let cfg = ServerConfig::from_lookup(|k| vars.get(k).map(|v| v.to_string()));
        assert_eq!(cfg.http_port, 9090);
        assert_eq!(cfg.probe_timeout, Duration::from_secs(5));
        // Threshold is clamped to at least one failure
        assert_eq!(cfg.max_errors, 1);
        // Unparseable value keeps the default
        assert_eq!(cfg.retention_days, 30);
        assert_eq!(cfg.cleanup_time, NaiveTime::from_hms_opt(23, 15, 0).unwrap());
    }
}
