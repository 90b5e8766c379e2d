use std::env;
use std::time::Duration;

/// Orchestrator configuration.
#[derive(Debug, Clone)]
pub struct PipelineConfig {
    /// Base URL of the masking service (default: "http://127.0.0.1:8080")
    pub base_url: String,

    /// Owner account the files belong to (default: "demo")
    pub owner: String,

    /// Remote folder for this owner's files (default: "uploads")
    pub folder: String,

    /// Progress poll interval in milliseconds (default: 1000)
    pub poll_interval_ms: u64,

    /// Consecutive transport failures tolerated by a poller before the
    /// stage is declared failed (default: 5)
    pub max_transport_failures: u32,

    /// Chunk size for streamed uploads in bytes (default: 64 KB)
    pub upload_chunk_size: usize,
}

impl Default for PipelineConfig {
    fn default() -> Self {
        Self {
            base_url: "http://127.0.0.1:8080".to_string(),
            owner: "demo".to_string(),
            folder: "uploads".to_string(),
            poll_interval_ms: 1000,
            max_transport_failures: 5,
            upload_chunk_size: 64 * 1024, // 64 KB
        }
    }
}

impl PipelineConfig {
    /// Load configuration from environment variables
    pub fn from_env() -> Self {
        let default = Self::default();

        Self {
            base_url: env::var("MASK_BASE_URL")
                .map(|v| v.trim_end_matches('/').to_string())
                .unwrap_or(default.base_url),

            owner: env::var("MASK_OWNER").unwrap_or(default.owner),

            folder: env::var("MASK_FOLDER").unwrap_or(default.folder),

            poll_interval_ms: env::var("MASK_POLL_INTERVAL_MS")
                .ok()
                .and_then(|v| v.parse().ok())
                .unwrap_or(default.poll_interval_ms),

            max_transport_failures: env::var("MASK_MAX_TRANSPORT_FAILURES")
                .ok()
                .and_then(|v| v.parse().ok())
                .unwrap_or(default.max_transport_failures),

            upload_chunk_size: env::var("MASK_UPLOAD_CHUNK_SIZE")
                .ok()
                .and_then(|v| v.parse().ok())
                .unwrap_or(default.upload_chunk_size),
        }
    }

    pub fn poll_interval(&self) -> Duration {
        Duration::from_millis(self.poll_interval_ms)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_default_config() {
        let config = PipelineConfig::default();
        assert_eq!(config.base_url, "http://127.0.0.1:8080");
        assert_eq!(config.poll_interval_ms, 1000);
        assert_eq!(config.max_transport_failures, 5);
        assert_eq!(config.upload_chunk_size, 64 * 1024);
    }

    #[test]
    fn test_poll_interval_duration() {
        let config = PipelineConfig {
            poll_interval_ms: 250,
            ..Default::default()
        };
        assert_eq!(config.poll_interval(), Duration::from_millis(250));
    }
}
