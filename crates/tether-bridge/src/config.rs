//! Bridge configuration loaded from environment variables.
//!
//! Every setting has a default so the bridge starts with zero configuration.

use std::path::PathBuf;
use std::str::FromStr;
use std::time::Duration;

use tether_shared::constants::{
    DEFAULT_INGEST_IDLE_SECS, DEFAULT_INGEST_QUEUE, DEFAULT_MAX_MEDIA_SIZE,
    DEFAULT_PAIRING_TIMEOUT_SECS, DEFAULT_STORAGE_RETRIES, MEDIA_DIR_NAME,
};
use tether_store::Database;

use crate::backoff::BackoffConfig;

#[derive(Debug, Clone)]
pub struct BridgeConfig {
    /// Directory holding `messages.db` and the media cache.
    /// Env: `TETHER_STORE_DIR`
    /// Default: platform data dir, e.g. `~/.local/share/tether/store`
    pub store_dir: PathBuf,

    /// How long a pairing token stays valid.
    /// Env: `TETHER_PAIRING_TIMEOUT_SECS`
    /// Default: 120 seconds
    pub pairing_timeout: Duration,

    /// Reconnect backoff.
    /// Env: `TETHER_RECONNECT_BASE_MS`, `TETHER_RECONNECT_MAX_MS`,
    /// `TETHER_RECONNECT_MAX_ATTEMPTS`
    pub reconnect: BackoffConfig,

    /// Capacity of each chat's ingestion queue.
    /// Env: `TETHER_INGEST_QUEUE`
    /// Default: 64
    pub ingest_queue: usize,

    /// How long a chat's ingestion worker may sit idle before it stops.
    /// Env: `TETHER_INGEST_IDLE_SECS`
    /// Default: 300 seconds
    pub ingest_idle_timeout: Duration,

    /// Attempts for one ingestion work item before it is dropped as fatal.
    /// Env: `TETHER_STORAGE_RETRIES`
    /// Default: 3
    pub storage_retries: u32,

    /// Base delay between storage retries.
    pub storage_retry_base: Duration,

    /// Largest file accepted for sending or downloading.
    /// Env: `TETHER_MAX_MEDIA_BYTES`
    /// Default: 64 MiB
    pub max_media_bytes: usize,

    /// ffmpeg binary used to transcode voice notes.
    /// Env: `TETHER_FFMPEG`
    /// Default: `ffmpeg` on `PATH`
    pub ffmpeg_path: PathBuf,
}

impl Default for BridgeConfig {
    fn default() -> Self {
        Self {
            store_dir: Database::default_store_dir().unwrap_or_else(|_| PathBuf::from("./store")),
            pairing_timeout: Duration::from_secs(DEFAULT_PAIRING_TIMEOUT_SECS),
            reconnect: BackoffConfig::default(),
            ingest_queue: DEFAULT_INGEST_QUEUE,
            ingest_idle_timeout: Duration::from_secs(DEFAULT_INGEST_IDLE_SECS),
            storage_retries: DEFAULT_STORAGE_RETRIES,
            storage_retry_base: Duration::from_millis(50),
            max_media_bytes: DEFAULT_MAX_MEDIA_SIZE,
            ffmpeg_path: PathBuf::from("ffmpeg"),
        }
    }
}

impl BridgeConfig {
    /// Load configuration from environment variables, falling back to defaults.
    pub fn from_env() -> Self {
        let mut config = Self::default();

        if let Ok(dir) = std::env::var("TETHER_STORE_DIR") {
            if !dir.trim().is_empty() {
                config.store_dir = PathBuf::from(dir);
            }
        }

        if let Some(secs) = env_parse::<u64>("TETHER_PAIRING_TIMEOUT_SECS") {
            config.pairing_timeout = Duration::from_secs(secs);
        }
        if let Some(ms) = env_parse::<u64>("TETHER_RECONNECT_BASE_MS") {
            config.reconnect.base_delay_ms = ms;
        }
        if let Some(ms) = env_parse::<u64>("TETHER_RECONNECT_MAX_MS") {
            config.reconnect.max_delay_ms = ms;
        }
        if let Some(n) = env_parse::<u32>("TETHER_RECONNECT_MAX_ATTEMPTS") {
            config.reconnect.max_attempts = n.max(1);
        }
        if let Some(n) = env_parse::<usize>("TETHER_INGEST_QUEUE") {
            config.ingest_queue = n.max(1);
        }
        if let Some(secs) = env_parse::<u64>("TETHER_INGEST_IDLE_SECS") {
            config.ingest_idle_timeout = Duration::from_secs(secs.max(1));
        }
        if let Some(n) = env_parse::<u32>("TETHER_STORAGE_RETRIES") {
            config.storage_retries = n.max(1);
        }
        if let Some(n) = env_parse::<usize>("TETHER_MAX_MEDIA_BYTES") {
            config.max_media_bytes = n;
        }

        if let Ok(path) = std::env::var("TETHER_FFMPEG") {
            if !path.trim().is_empty() {
                config.ffmpeg_path = PathBuf::from(path);
            }
        }

        config
    }

    /// Root of the content-addressed media cache.
    pub fn media_dir(&self) -> PathBuf {
        self.store_dir.join(MEDIA_DIR_NAME)
    }
}

fn env_parse<T: FromStr>(key: &str) -> Option<T> {
    let raw = std::env::var(key).ok()?;
    match raw.trim().parse::<T>() {
        Ok(value) => Some(value),
        Err(_) => {
            tracing::warn!(key, value = %raw, "Invalid value, using default");
            None
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_default_config() {
        let config = BridgeConfig::default();
        assert_eq!(config.pairing_timeout, Duration::from_secs(120));
        assert_eq!(config.reconnect.max_attempts, 10);
        assert_eq!(config.ingest_queue, 64);
        assert_eq!(config.ingest_idle_timeout, Duration::from_secs(300));
        assert_eq!(config.max_media_bytes, 64 * 1024 * 1024);
        assert!(config.media_dir().ends_with("media"));
    }

    #[test]
    fn test_env_parse_rejects_garbage() {
        std::env::set_var("TETHER_TEST_ENV_PARSE", "twelve");
        assert_eq!(env_parse::<u64>("TETHER_TEST_ENV_PARSE"), None);
        std::env::set_var("TETHER_TEST_ENV_PARSE", " 12 ");
        assert_eq!(env_parse::<u64>("TETHER_TEST_ENV_PARSE"), Some(12));
        std::env::remove_var("TETHER_TEST_ENV_PARSE");
    }
}
