//! Tunables for the upload core.
//!
//! Every constant the backend protocol documents lives here as a field of
//! [`UploadConfig`] so tests and embedders can shrink timers or caps without
//! touching component code.

use std::path::PathBuf;
use std::time::Duration;

/// Environment variable holding the backend base URL.
pub const BASE_URL_ENV: &str = "MEDIALIFT_API_BASE_URL";

/// Fallback backend base URL when the environment does not provide one.
pub const DEFAULT_BASE_URL: &str = "http://localhost:8000";

/// Runtime configuration for the upload pipeline.
#[derive(Debug, Clone)]
pub struct UploadConfig {
    /// Preferred chunk size offered to the server (the server's `initiate`
    /// response is authoritative).
    pub chunk_size: u64,
    /// Upper bound on chunks in flight across all sessions.
    pub max_concurrent_chunks: usize,
    /// Retries per chunk after the initial attempt.
    pub max_retries: u32,
    /// Base delay for exponential backoff between chunk retries.
    pub initial_retry_delay: Duration,
    /// Trailing window for coalescing per-item progress updates.
    pub progress_debounce: Duration,
    /// Trailing window for coalescing durable-state writes.
    pub persistence_debounce: Duration,
    /// Age after which a persisted session is discarded on load.
    pub session_expiry: Duration,
    /// Requests allowed per rate-limit window, across all endpoints.
    pub rate_limit_max_requests: usize,
    /// Rolling window the request quota applies to.
    pub rate_limit_window: Duration,
    /// Maximum descriptors accepted by a single enqueue call.
    pub max_files_per_batch: usize,
    /// Maximum size of a single file in bytes.
    pub max_file_size: u64,
}

impl Default for UploadConfig {
    fn default() -> Self {
        Self {
            chunk_size: 1024 * 1024,
            max_concurrent_chunks: 3,
            max_retries: 3,
            initial_retry_delay: Duration::from_secs(1),
            progress_debounce: Duration::from_millis(100),
            persistence_debounce: Duration::from_secs(1),
            session_expiry: Duration::from_secs(24 * 60 * 60),
            rate_limit_max_requests: 10,
            rate_limit_window: Duration::from_secs(60),
            max_files_per_batch: 10,
            max_file_size: 100 * 1024 * 1024,
        }
    }
}

/// Resolve the backend base URL from the environment.
pub fn api_base_url() -> String {
    std::env::var(BASE_URL_ENV).unwrap_or_else(|_| DEFAULT_BASE_URL.to_string())
}

/// Directory where durable upload state is kept.
pub fn state_dir() -> PathBuf {
    dirs::data_dir()
        .or_else(dirs::home_dir)
        .unwrap_or_else(|| PathBuf::from("."))
        .join("medialift")
        .join("state")
}

/// Directory where rotated log files are written.
pub fn log_dir() -> PathBuf {
    dirs::home_dir()
        .unwrap_or_else(|| PathBuf::from("."))
        .join(".medialift")
        .join("logs")
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn defaults_match_documented_constants() {
        let config = UploadConfig::default();
        assert_eq!(config.chunk_size, 1024 * 1024);
        assert_eq!(config.max_concurrent_chunks, 3);
        assert_eq!(config.max_retries, 3);
        assert_eq!(config.initial_retry_delay, Duration::from_secs(1));
        assert_eq!(config.rate_limit_max_requests, 10);
        assert_eq!(config.rate_limit_window, Duration::from_secs(60));
        assert_eq!(config.max_file_size, 100 * 1024 * 1024);
    }

    #[test]
    fn base_url_falls_back_to_default() {
        // The variable is unset in the test environment.
        if std::env::var(BASE_URL_ENV).is_err() {
            assert_eq!(api_base_url(), DEFAULT_BASE_URL);
        }
    }
}
