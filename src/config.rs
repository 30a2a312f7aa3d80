//! Pool configuration.

use crate::error::{GenError, Result};

/// Default number of items handed out per request.
pub const DEFAULT_WORKER_CONCURRENCY: usize = 500;

/// How a run is sized and how strictly it treats item errors.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RunConfig {
    /// Worker process count; `None` means one per CPU.
    pub workers: Option<usize>,
    /// Items per request while the queue is long.
    pub concurrency: usize,
    /// Workers exit on the first unhandled item error.
    pub fail_on_page_error: bool,
}

impl Default for RunConfig {
    fn default() -> Self {
        Self {
            workers: None,
            concurrency: DEFAULT_WORKER_CONCURRENCY,
            fail_on_page_error: false,
        }
    }
}

impl RunConfig {
    pub fn new() -> Self {
        Self::default()
    }

    /// Zero means "use the default".
    pub fn with_workers(mut self, workers: usize) -> Self {
        self.workers = (workers > 0).then_some(workers);
        self
    }

    /// Zero means "use the default".
    pub fn with_concurrency(mut self, concurrency: usize) -> Self {
        self.concurrency = if concurrency > 0 {
            concurrency
        } else {
            DEFAULT_WORKER_CONCURRENCY
        };
        self
    }

    pub fn with_fail_on_page_error(mut self, enabled: bool) -> Self {
        self.fail_on_page_error = enabled;
        self
    }

    /// Fill unset values from the environment:
    /// - `GENPOOL_WORKERS`
    /// - `GENPOOL_WORKER_CONCURRENCY`
    /// - `GENPOOL_FAIL_ON_PAGE_ERROR` (`1`/`true`/`yes`)
    ///
    /// Only values still at their default are replaced.
    pub fn with_env_overrides(mut self) -> Result<Self> {
        if self.workers.is_none()
            && let Some(workers) = env_usize("GENPOOL_WORKERS")?
        {
            self = self.with_workers(workers);
        }
        if self.concurrency == DEFAULT_WORKER_CONCURRENCY
            && let Some(concurrency) = env_usize("GENPOOL_WORKER_CONCURRENCY")?
        {
            self = self.with_concurrency(concurrency);
        }
        if !self.fail_on_page_error
            && let Ok(value) = std::env::var("GENPOOL_FAIL_ON_PAGE_ERROR")
        {
            self.fail_on_page_error = parse_flag(&value);
        }
        Ok(self)
    }

    /// Effective worker count.
    pub fn worker_count(&self) -> usize {
        self.workers.unwrap_or_else(default_workers)
    }
}

/// One worker per available CPU.
pub fn default_workers() -> usize {
    std::thread::available_parallelism()
        .map(|n| n.get())
        .unwrap_or(1)
}

fn env_usize(name: &str) -> Result<Option<usize>> {
    match std::env::var(name) {
        Ok(value) if value.trim().is_empty() => Ok(None),
        Ok(value) => value
            .trim()
            .parse()
            .map(Some)
            .map_err(|_| GenError::Config(format!("{} must be a number, got '{}'", name, value))),
        Err(_) => Ok(None),
    }
}

fn parse_flag(value: &str) -> bool {
    matches!(value.trim().to_lowercase().as_str(), "1" | "true" | "yes" | "on")
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_defaults() {
        let config = RunConfig::default();
        assert_eq!(config.concurrency, 500);
        assert!(config.workers.is_none());
        assert!(config.worker_count() >= 1);
        assert!(!config.fail_on_page_error);
    }

    #[test]
    fn test_zero_means_default() {
        let config = RunConfig::new().with_workers(0).with_concurrency(0);
        assert!(config.workers.is_none());
        assert_eq!(config.concurrency, DEFAULT_WORKER_CONCURRENCY);

        let config = RunConfig::new().with_workers(3).with_concurrency(10);
        assert_eq!(config.worker_count(), 3);
        assert_eq!(config.concurrency, 10);
    }

    #[test]
    fn test_parse_flag() {
        assert!(parse_flag("1"));
        assert!(parse_flag("TRUE"));
        assert!(parse_flag(" yes "));
        assert!(!parse_flag("0"));
        assert!(!parse_flag(""));
    }
}
