//! Runtime configuration.
//!
//! Values come from environment variables; the CLI may override the
//! network and output settings afterwards.

use std::path::PathBuf;
use std::str::FromStr;
use std::time::Duration;

use thiserror::Error;

#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("Invalid value for {key}: {value:?}")]
    InvalidValue { key: &'static str, value: String },
}

/// Default retention of finished sessions before the sweeper evicts them.
const DEFAULT_RETENTION_SECS: u64 = 3600;

/// Default capacity of the per-session progress broadcast.
const DEFAULT_PROGRESS_BUFFER: usize = 256;

#[derive(Debug, Clone)]
pub struct Config {
    /// Address the HTTP server binds to
    pub host: String,
    pub port: u16,
    /// Per-session scratch files and materialized bundles are written here
    pub output_dir: PathBuf,
    /// Upper bound on tasks executing at once, across all sessions
    pub max_concurrency: usize,
    /// How long a finished session stays queryable
    pub session_retention: Duration,
    /// Optional bound imposed by the server; exceeded sessions get cancelled
    pub session_timeout: Option<Duration>,
    /// Broadcast capacity per session, raised to fit every snapshot a
    /// session can publish
    pub progress_buffer: usize,
}

impl Default for Config {
    fn default() -> Self {
        Self {
            host: "127.0.0.1".to_string(),
            port: 8080,
            output_dir: PathBuf::from("hostdiag-output"),
            max_concurrency: default_concurrency(),
            session_retention: Duration::from_secs(DEFAULT_RETENTION_SECS),
            session_timeout: None,
            progress_buffer: DEFAULT_PROGRESS_BUFFER,
        }
    }
}

impl Config {
    /// Load configuration from environment variables.
    ///
    /// - `HOSTDIAG_HOST`, `HOSTDIAG_PORT`
    /// - `HOSTDIAG_OUTPUT_DIR`
    /// - `HOSTDIAG_MAX_CONCURRENCY`
    /// - `HOSTDIAG_SESSION_RETENTION_SECS`
    /// - `HOSTDIAG_SESSION_TIMEOUT_SECS`
    /// - `HOSTDIAG_PROGRESS_BUFFER`
    pub fn from_env() -> Result<Self, ConfigError> {
        Self::from_lookup(|key| std::env::var(key).ok())
    }

    fn from_lookup<F>(lookup: F) -> Result<Self, ConfigError>
    where
        F: Fn(&str) -> Option<String>,
    {
        let defaults = Self::default();

        let host = lookup("HOSTDIAG_HOST")
            .filter(|h| !h.trim().is_empty())
            .unwrap_or(defaults.host);
        let port = parse_var(&lookup, "HOSTDIAG_PORT")?.unwrap_or(defaults.port);
        let output_dir = lookup("HOSTDIAG_OUTPUT_DIR")
            .filter(|p| !p.trim().is_empty())
            .map(PathBuf::from)
            .unwrap_or(defaults.output_dir);
        let max_concurrency = parse_var::<usize, _>(&lookup, "HOSTDIAG_MAX_CONCURRENCY")?
            .map(|n| n.max(1))
            .unwrap_or(defaults.max_concurrency);
        let session_retention = parse_var(&lookup, "HOSTDIAG_SESSION_RETENTION_SECS")?
            .map(Duration::from_secs)
            .unwrap_or(defaults.session_retention);
        let session_timeout = parse_var(&lookup, "HOSTDIAG_SESSION_TIMEOUT_SECS")?
            .filter(|secs: &u64| *secs > 0)
            .map(Duration::from_secs);
        let progress_buffer = parse_var::<usize, _>(&lookup, "HOSTDIAG_PROGRESS_BUFFER")?
            .map(|n| n.max(1))
            .unwrap_or(defaults.progress_buffer);

        Ok(Self {
            host,
            port,
            output_dir,
            max_concurrency,
            session_retention,
            session_timeout,
            progress_buffer,
        })
    }
}

fn parse_var<T, F>(lookup: &F, key: &'static str) -> Result<Option<T>, ConfigError>
where
    T: FromStr,
    F: Fn(&str) -> Option<String>,
{
    match lookup(key) {
        None => Ok(None),
        Some(raw) if raw.trim().is_empty() => Ok(None),
        Some(raw) => raw
            .trim()
            .parse()
            .map(Some)
            .map_err(|_| ConfigError::InvalidValue { key, value: raw }),
    }
}

fn default_concurrency() -> usize {
    std::thread::available_parallelism()
        .map(|n| n.get() * 2)
        .unwrap_or(4)
        .max(2)
}
