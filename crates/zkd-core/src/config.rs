use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};

use crate::error::{ZkdError, ZkdResult};

/// Hard ceiling for automatically chosen upload concurrency
pub const MAX_AUTO_CONCURRENCY: usize = 16;

const MIB: u64 = 1024 * 1024;

/// Top-level client configuration (loaded from zkd.toml)
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct ZkdConfig {
    pub log: LogConfig,
    pub api: ApiConfig,
    pub storage: StorageConfig,
    pub transfer: TransferConfig,
    pub chunking: ChunkingConfig,
    pub queue: QueueConfig,
    pub crypto: CryptoConfig,
}

impl ZkdConfig {
    /// Load from a TOML file; a missing file yields defaults.
    pub fn load(path: &Path) -> ZkdResult<Self> {
        if !path.exists() {
            tracing::warn!("config file not found: {}  (using defaults)", path.display());
            return Ok(Self::default());
        }
        let content = std::fs::read_to_string(path)?;
        toml::from_str(&content)
            .map_err(|e| ZkdError::Config(format!("parsing {}: {e}", path.display())))
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct LogConfig {
    /// Log level (default: info)
    pub level: String,
    /// Log format: "json" or "text"
    pub format: String,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct ApiConfig {
    /// Base URL of the object API
    pub endpoint: String,
    /// Environment variable holding the bearer token
    pub token_env: String,
    /// Per-request timeout in seconds
    pub request_timeout_secs: u64,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct StorageConfig {
    /// "presigned" (URLs issued by the API) or "s3" (targets are bucket keys)
    pub backend: String,
    /// S3 endpoint for the direct-bucket backend
    pub endpoint: String,
    /// S3 region (default: us-east-1)
    pub region: String,
    /// Bucket for the direct-bucket backend
    pub bucket: String,
    /// Enforce HTTPS for S3 connections
    pub enforce_tls: bool,
}

/// Tunables for chunk transfer
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct TransferConfig {
    /// Client-side attempts per chunk PUT before the chunk fails
    pub max_chunk_retries: u32,
    /// Default window for open-ended range reads
    pub stream_window_bytes: u64,
    /// Concurrent chunk tasks (0 = 2 x cores, capped at 16)
    pub upload_concurrency: usize,
    /// Confirm/re-upload rounds before an upload is declared incomplete
    pub confirm_rounds: u32,
    /// First retry delay in milliseconds
    pub retry_base_ms: u64,
    /// Retry delay cap in milliseconds
    pub retry_max_ms: u64,
}

impl TransferConfig {
    /// Resolve `upload_concurrency`, applying the automatic default.
    pub fn effective_concurrency(&self) -> usize {
        if self.upload_concurrency > 0 {
            return self.upload_concurrency;
        }
        let cores = std::thread::available_parallelism()
            .map(|n| n.get())
            .unwrap_or(4);
        (cores * 2).clamp(1, MAX_AUTO_CONCURRENCY)
    }
}

/// Chunk sizing and compression probing
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct ChunkingConfig {
    pub small_chunk_bytes: u64,
    pub medium_chunk_bytes: u64,
    pub large_chunk_bytes: u64,
    /// Objects at or above this size use medium chunks
    pub medium_threshold_bytes: u64,
    /// Objects at or above this size use large chunks
    pub large_threshold_bytes: u64,
    /// Leading bytes compressed to decide compressibility
    pub compression_sample_bytes: u64,
    /// Minimum savings (percent) for compression to be enabled
    pub min_compression_savings_pct: u8,
    pub zstd_level: i32,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct QueueConfig {
    /// Durable queue file
    pub path: PathBuf,
    /// Backoff base in milliseconds
    pub base_delay_ms: u64,
    /// Backoff cap in milliseconds
    pub max_delay_ms: u64,
    /// Periodic replay interval in seconds
    pub tick_secs: u64,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct CryptoConfig {
    /// Passphrase-sealed keyring file
    pub keyring_file: PathBuf,
    /// Argon2id memory cost in KiB (default: 65536 = 64 MiB)
    pub argon2_mem_cost_kib: u32,
    /// Argon2id time cost (iterations, default: 3)
    pub argon2_time_cost: u32,
    /// Argon2id parallelism (default: 4)
    pub argon2_parallelism: u32,
}

impl Default for LogConfig {
    fn default() -> Self {
        Self {
            level: "info".into(),
            format: "text".into(),
        }
    }
}

impl Default for ApiConfig {
    fn default() -> Self {
        Self {
            endpoint: "http://localhost:8080".into(),
            token_env: "ZKD_TOKEN".into(),
            request_timeout_secs: 30,
        }
    }
}

impl Default for StorageConfig {
    fn default() -> Self {
        Self {
            backend: "presigned".into(),
            endpoint: "http://localhost:8333".into(),
            region: "us-east-1".into(),
            bucket: "zkd".into(),
            enforce_tls: false,
        }
    }
}

impl Default for TransferConfig {
    fn default() -> Self {
        Self {
            max_chunk_retries: 5,
            stream_window_bytes: 2 * MIB,
            upload_concurrency: 0,
            confirm_rounds: 3,
            retry_base_ms: 250,
            retry_max_ms: 30_000,
        }
    }
}

impl Default for ChunkingConfig {
    fn default() -> Self {
        Self {
            small_chunk_bytes: 4 * MIB,
            medium_chunk_bytes: 6 * MIB,
            large_chunk_bytes: 8 * MIB,
            medium_threshold_bytes: 256 * MIB,
            large_threshold_bytes: 2048 * MIB,
            compression_sample_bytes: 64 * 1024,
            min_compression_savings_pct: 8,
            zstd_level: 3,
        }
    }
}

impl Default for QueueConfig {
    fn default() -> Self {
        Self {
            path: PathBuf::from("~/.local/share/zkd/queue.json"),
            base_delay_ms: 1_000,
            max_delay_ms: 300_000,
            tick_secs: 30,
        }
    }
}

impl Default for CryptoConfig {
    fn default() -> Self {
        Self {
            keyring_file: PathBuf::from("~/.config/zkd/keyring.json"),
            argon2_mem_cost_kib: 65536,
            argon2_time_cost: 3,
            argon2_parallelism: 4,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_parse_full_config() {
        let toml_str = r#"
[log]
level = "debug"
format = "json"

[api]
endpoint = "https://api.example.com"
token_env = "MY_TOKEN"

[storage]
backend = "s3"
bucket = "my-bucket"
enforce_tls = true

[transfer]
max_chunk_retries = 7
stream_window_bytes = 1048576
upload_concurrency = 4
confirm_rounds = 2

[chunking]
small_chunk_bytes = 1048576
min_compression_savings_pct = 12

[queue]
path = "/var/lib/zkd/queue.json"
tick_secs = 5

[crypto]
keyring_file = "/etc/zkd/keyring.json"
argon2_mem_cost_kib = 131072
"#;
        let config: ZkdConfig = toml::from_str(toml_str).unwrap();

        assert_eq!(config.log.level, "debug");
        assert_eq!(config.api.endpoint, "https://api.example.com");
        assert_eq!(config.storage.backend, "s3");
        assert!(config.storage.enforce_tls);
        assert_eq!(config.transfer.max_chunk_retries, 7);
        assert_eq!(config.transfer.effective_concurrency(), 4);
        assert_eq!(config.chunking.small_chunk_bytes, 1048576);
        assert_eq!(config.chunking.min_compression_savings_pct, 12);
        assert_eq!(config.queue.tick_secs, 5);
        assert_eq!(config.crypto.argon2_mem_cost_kib, 131072);
    }

    #[test]
    fn test_parse_defaults() {
        let config: ZkdConfig = toml::from_str("").unwrap();

        assert_eq!(config.transfer.max_chunk_retries, 5);
        assert_eq!(config.transfer.stream_window_bytes, 2 * 1024 * 1024);
        assert_eq!(config.transfer.upload_concurrency, 0);
        assert_eq!(config.chunking.small_chunk_bytes, 4 * 1024 * 1024);
        assert_eq!(config.chunking.min_compression_savings_pct, 8);
        assert_eq!(config.storage.backend, "presigned");
        assert_eq!(config.log.format, "text");
    }

    #[test]
    fn test_auto_concurrency_is_clamped() {
        let cfg = TransferConfig::default();
        let n = cfg.effective_concurrency();
        assert!(n >= 1 && n <= MAX_AUTO_CONCURRENCY);
    }

    #[test]
    fn test_load_missing_file_uses_defaults() {
        let dir = tempfile::tempdir().unwrap();
        let config = ZkdConfig::load(&dir.path().join("absent.toml")).unwrap();
        assert_eq!(config.api.token_env, "ZKD_TOKEN");
    }

    #[test]
    fn test_load_rejects_malformed() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("bad.toml");
        std::fs::write(&path, "[transfer\nmax_chunk_retries = ").unwrap();
        assert!(matches!(ZkdConfig::load(&path), Err(ZkdError::Config(_))));
    }

    #[test]
    fn test_serialize_roundtrip() {
        let config = ZkdConfig::default();
        let toml_str = toml::to_string(&config).unwrap();
        let parsed: ZkdConfig = toml::from_str(&toml_str).unwrap();

        assert_eq!(config.api.endpoint, parsed.api.endpoint);
        assert_eq!(config.queue.path, parsed.queue.path);
    }
}
