use std::path::PathBuf;
use std::time::Duration;

use anyhow::{Context, Result};
use trainjob_reconcile::{DEFAULT_REQUEUE_BASE, DEFAULT_REQUEUE_MAX, DEFAULT_RESYNC_INTERVAL};

#[derive(Debug, Clone)]
pub struct Config {
    pub log_level: String,
    pub workers: usize,
    pub resync_interval: Duration,
    pub requeue_base: Duration,
    pub requeue_max: Duration,
    pub shutdown_timeout: Duration,
    /// Directory of job manifests loaded at startup.
    pub manifest_dir: Option<PathBuf>,
    pub dev_mode: bool,
}

impl Default for Config {
    fn default() -> Self {
        Self {
            log_level: "info".to_string(),
            workers: 4,
            resync_interval: DEFAULT_RESYNC_INTERVAL,
            requeue_base: DEFAULT_REQUEUE_BASE,
            requeue_max: DEFAULT_REQUEUE_MAX,
            shutdown_timeout: Duration::from_secs(10),
            manifest_dir: None,
            dev_mode: false,
        }
    }
}

impl Config {
    pub fn from_env() -> Result<Self> {
        let defaults = Self::default();

        let log_level = std::env::var("TRAINJOB_LOG_LEVEL").unwrap_or_else(|_| "info".to_string());

        let workers = parse_var("TRAINJOB_WORKERS")?.unwrap_or(defaults.workers);

        let resync_interval = parse_var("TRAINJOB_RESYNC_INTERVAL_SECS")?
            .map(Duration::from_secs)
            .unwrap_or(defaults.resync_interval);

        let requeue_base = parse_var("TRAINJOB_REQUEUE_BASE_MS")?
            .map(Duration::from_millis)
            .unwrap_or(defaults.requeue_base);

        let requeue_max = parse_var("TRAINJOB_REQUEUE_MAX_SECS")?
            .map(Duration::from_secs)
            .unwrap_or(defaults.requeue_max);

        let shutdown_timeout = parse_var("TRAINJOB_SHUTDOWN_TIMEOUT_SECS")?
            .map(Duration::from_secs)
            .unwrap_or(defaults.shutdown_timeout);

        let manifest_dir = std::env::var("TRAINJOB_MANIFEST_DIR").ok().map(PathBuf::from);

        let dev_mode = std::env::var("TRAINJOB_DEV")
            .map(|v| v == "1" || v.to_lowercase() == "true")
            .unwrap_or(false);

        if resync_interval.is_zero() {
            anyhow::bail!("TRAINJOB_RESYNC_INTERVAL_SECS must be positive");
        }

        Ok(Self {
            log_level,
            workers,
            resync_interval,
            requeue_base,
            requeue_max,
            shutdown_timeout,
            manifest_dir,
            dev_mode,
        })
    }
}

fn parse_var<T>(name: &str) -> Result<Option<T>>
where
    T: std::str::FromStr,
    T::Err: std::error::Error + Send + Sync + 'static,
{
    match std::env::var(name) {
        Ok(value) => value
            .trim()
            .parse()
            .map(Some)
            .with_context(|| format!("invalid {name}: {value:?}")),
        Err(_) => Ok(None),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_defaults() {
        let config = Config::default();
        assert_eq!(config.workers, 4);
        assert_eq!(config.resync_interval, Duration::from_secs(30));
        assert_eq!(config.requeue_base, Duration::from_millis(100));
        assert!(config.manifest_dir.is_none());
    }

    #[test]
    fn test_parse_var() {
        std::env::set_var("TRAINJOB_TEST_PARSE_OK", " 12 ");
        std::env::set_var("TRAINJOB_TEST_PARSE_BAD", "twelve");
        assert_eq!(parse_var::<u64>("TRAINJOB_TEST_PARSE_OK").unwrap(), Some(12));
        assert!(parse_var::<u64>("TRAINJOB_TEST_PARSE_BAD").is_err());
        assert_eq!(parse_var::<u64>("TRAINJOB_TEST_PARSE_UNSET").unwrap(), None);
    }
}
