use std::path::Path;
use std::time::Duration;

use serde::{Deserialize, Serialize};

use crate::error::{CoreError, Result};

/// Configuration for the processing core. Constructed once and passed by
/// reference into each component's constructor; components copy the fields
/// they need, so there is no shared mutable settings object.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct CoreConfig {
    /// Maximum number of processor invocations in flight at once.
    pub max_concurrent: usize,
    /// Additional attempts after a failed first attempt.
    pub max_retries: u32,
    /// Backoff base; the delay before retry `k` is `base * 2^k`.
    pub retry_base_delay_ms: u64,
    /// Hard per-file ceiling in bytes. Larger files are refused outright.
    pub max_file_size: u64,
    /// Files at or above this size are served but never cached.
    pub cache_file_max_size: u64,
    /// Aggregate cache ceiling in megabytes.
    pub max_memory_mb: usize,
    /// Search results are truncated to this many records.
    pub max_search_results: usize,
    /// Path components containing any of these substrings are skipped
    /// during candidate enumeration.
    pub skip_patterns: Vec<String>,
}

impl Default for CoreConfig {
    fn default() -> Self {
        Self {
            max_concurrent: 10,
            max_retries: 3,
            retry_base_delay_ms: 100,
            max_file_size: 10_000_000,
            cache_file_max_size: 1_000_000,
            max_memory_mb: 500,
            max_search_results: 50,
            skip_patterns: default_skip_patterns(),
        }
    }
}

impl CoreConfig {
    pub fn with_max_concurrent(mut self, max_concurrent: usize) -> Self {
        self.max_concurrent = max_concurrent;
        self
    }

    pub fn with_max_retries(mut self, max_retries: u32) -> Self {
        self.max_retries = max_retries;
        self
    }

    pub fn with_retry_base_delay(mut self, delay: Duration) -> Self {
        self.retry_base_delay_ms = delay.as_millis() as u64;
        self
    }

    pub fn with_max_file_size(mut self, bytes: u64) -> Self {
        self.max_file_size = bytes;
        self
    }

    pub fn with_max_memory_mb(mut self, mb: usize) -> Self {
        self.max_memory_mb = mb;
        self
    }

    pub fn with_max_search_results(mut self, limit: usize) -> Self {
        self.max_search_results = limit;
        self
    }

    pub fn with_skip_patterns(mut self, patterns: Vec<String>) -> Self {
        self.skip_patterns = patterns;
        self
    }

    pub fn retry_base_delay(&self) -> Duration {
        Duration::from_millis(self.retry_base_delay_ms)
    }

    pub fn max_memory_bytes(&self) -> u64 {
        self.max_memory_mb as u64 * 1024 * 1024
    }

    /// Load configuration from a TOML file. Missing fields fall back to
    /// their defaults.
    pub fn from_file(path: &Path) -> Result<Self> {
        let raw = std::fs::read_to_string(path)?;
        let config: Self = toml::from_str(&raw)
            .map_err(|e| CoreError::Config(format!("{}: {}", path.display(), e)))?;
        config.validate()?;
        Ok(config)
    }

    pub fn validate(&self) -> Result<()> {
        if self.max_concurrent == 0 {
            return Err(CoreError::Config(
                "max_concurrent must be at least 1".to_string(),
            ));
        }
        if self.cache_file_max_size > self.max_file_size {
            return Err(CoreError::Config(
                "cache_file_max_size cannot exceed max_file_size".to_string(),
            ));
        }
        Ok(())
    }
}

fn default_skip_patterns() -> Vec<String> {
    [
        ".git",
        "__pycache__",
        ".pyc",
        ".pyo",
        ".pyd",
        ".so",
        ".dll",
        ".dylib",
        ".exe",
        ".bin",
        ".jpg",
        ".jpeg",
        ".png",
        ".gif",
        ".bmp",
        ".mp3",
        ".mp4",
        ".avi",
        ".mov",
        ".pdf",
        ".zip",
        ".tar",
        ".gz",
        ".bz2",
        ".7z",
        "node_modules",
        "target",
        ".venv",
        "venv",
        ".env",
    ]
    .iter()
    .map(|s| s.to_string())
    .collect()
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::Write;

    #[test]
    fn test_defaults() {
        let config = CoreConfig::default();
        assert_eq!(config.max_concurrent, 10);
        assert_eq!(config.max_retries, 3);
        assert_eq!(config.max_memory_bytes(), 500 * 1024 * 1024);
        assert!(config.skip_patterns.contains(&".git".to_string()));
        assert!(config.validate().is_ok());
    }

    #[test]
    fn test_builder_chain() {
        let config = CoreConfig::default()
            .with_max_concurrent(4)
            .with_max_retries(1)
            .with_retry_base_delay(Duration::from_millis(20))
            .with_max_search_results(10);

        assert_eq!(config.max_concurrent, 4);
        assert_eq!(config.max_retries, 1);
        assert_eq!(config.retry_base_delay(), Duration::from_millis(20));
        assert_eq!(config.max_search_results, 10);
    }

    #[test]
    fn test_zero_concurrency_rejected() {
        let config = CoreConfig::default().with_max_concurrent(0);
        assert!(config.validate().is_err());
    }

    #[test]
    fn test_cache_threshold_must_fit_file_ceiling() {
        let mut config = CoreConfig::default();
        config.cache_file_max_size = config.max_file_size + 1;
        assert!(config.validate().is_err());
    }

    #[test]
    fn test_from_file_partial_overrides() {
        let mut file = tempfile::NamedTempFile::new().unwrap();
        writeln!(file, "max_concurrent = 3\nmax_search_results = 7").unwrap();

        let config = CoreConfig::from_file(file.path()).unwrap();
        assert_eq!(config.max_concurrent, 3);
        assert_eq!(config.max_search_results, 7);
        // Untouched fields keep their defaults.
        assert_eq!(config.max_retries, 3);
    }

    #[test]
    fn test_from_file_missing() {
        let result = CoreConfig::from_file(Path::new("/nonexistent/taskmill.toml"));
        assert!(result.is_err());
    }
}
