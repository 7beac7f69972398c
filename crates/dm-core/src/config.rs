use serde::{Deserialize, Serialize};
use std::path::PathBuf;

/// Top-level configuration (loaded from drivemerge.toml)
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct DmConfig {
    pub chunking: ChunkingConfig,
    pub crypto: CryptoConfig,
    pub store: StoreConfig,
    pub jobs: JobsConfig,
    pub log: LogConfig,
}

impl DmConfig {
    /// Parse a TOML document. Missing sections and keys take their defaults.
    pub fn from_toml(s: &str) -> crate::DmResult<Self> {
        toml::from_str(s).map_err(|e| crate::DmError::Config(e.to_string()))
    }

    pub fn to_toml(&self) -> crate::DmResult<String> {
        toml::to_string_pretty(self).map_err(|e| crate::DmError::Config(e.to_string()))
    }
}

/// Content-defined chunking parameters (bytes)
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct ChunkingConfig {
    pub min_chunk: u32,
    pub avg_chunk: u32,
    pub max_chunk: u32,
    /// Producer read granularity; does not affect boundaries
    pub read_block: usize,
}

impl Default for ChunkingConfig {
    fn default() -> Self {
        Self {
            min_chunk: 16 * 1024,
            avg_chunk: 64 * 1024,
            max_chunk: 256 * 1024,
            read_block: 256 * 1024,
        }
    }
}

/// Passphrase KDF cost parameters and key-service timeouts
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct CryptoConfig {
    /// Argon2id memory cost in KiB (default: 65536 = 64 MiB)
    pub argon2_mem_cost_kib: u32,
    /// Argon2id time cost (iterations, default: 3)
    pub argon2_time_cost: u32,
    /// Argon2id parallelism (default: 1)
    pub argon2_parallelism: u32,
    /// PBKDF2-HMAC-SHA256 iterations for the fallback path
    pub pbkdf2_iterations: u32,
    pub derive_timeout_secs: u64,
    pub wrap_timeout_secs: u64,
}

impl Default for CryptoConfig {
    fn default() -> Self {
        Self {
            argon2_mem_cost_kib: 65536,
            argon2_time_cost: 3,
            argon2_parallelism: 1,
            pbkdf2_iterations: 250_000,
            derive_timeout_secs: 15,
            wrap_timeout_secs: 15,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum StoreBackendKind {
    Memory,
    Rocksdb,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct StoreConfig {
    pub backend: StoreBackendKind,
    /// RocksDB directory (ignored by the memory backend)
    pub path: PathBuf,
}

impl Default for StoreConfig {
    fn default() -> Self {
        Self {
            backend: StoreBackendKind::Rocksdb,
            path: PathBuf::from("~/.local/share/drivemerge/db"),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum QueueKind {
    Local,
    Nats,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct JobsConfig {
    pub queue: QueueKind,
    /// NATS JetStream endpoint (queue = "nats")
    pub nats_url: String,
    /// Upload destinations are `{upload_base}/{hash}`
    pub upload_base: String,
    /// Attempts per job before it is reported as faulted
    pub max_attempts: u32,
    /// First retry delay; doubles on each further attempt
    pub backoff_ms: u64,
    /// Worker concurrency (0 = cpu_count)
    pub workers: usize,
    /// Seconds a job may hold `url_ready` items before `dm sweep` faults it
    pub upload_deadline_secs: u64,
}

impl Default for JobsConfig {
    fn default() -> Self {
        Self {
            queue: QueueKind::Local,
            nats_url: "nats://localhost:4222".into(),
            upload_base: "https://uploads.example.com/upload".into(),
            max_attempts: 3,
            backoff_ms: 500,
            workers: 0,
            upload_deadline_secs: 86_400,
        }
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

impl Default for LogConfig {
    fn default() -> Self {
        Self {
            level: "info".into(),
            format: "text".into(),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_parse_full_config() {
        let toml_str = r#"
[chunking]
min_chunk = 4096
avg_chunk = 8192
max_chunk = 32768
read_block = 65536

[crypto]
argon2_mem_cost_kib = 131072
argon2_time_cost = 4
argon2_parallelism = 2
pbkdf2_iterations = 600000
derive_timeout_secs = 30

[store]
backend = "memory"
path = "/var/lib/drivemerge"

[jobs]
queue = "nats"
nats_url = "tls://nats.example.com:4222"
upload_base = "https://cdn.example.com/put"
max_attempts = 5
backoff_ms = 100
workers = 4
upload_deadline_secs = 3600

[log]
level = "debug"
format = "json"
"#;
        let config = DmConfig::from_toml(toml_str).unwrap();

        assert_eq!(config.chunking.avg_chunk, 8192);
        assert_eq!(config.chunking.read_block, 65536);
        assert_eq!(config.crypto.argon2_mem_cost_kib, 131072);
        assert_eq!(config.crypto.pbkdf2_iterations, 600_000);
        assert_eq!(config.crypto.derive_timeout_secs, 30);
        assert_eq!(config.crypto.wrap_timeout_secs, 15);
        assert_eq!(config.store.backend, StoreBackendKind::Memory);
        assert_eq!(config.store.path, PathBuf::from("/var/lib/drivemerge"));
        assert_eq!(config.jobs.queue, QueueKind::Nats);
        assert_eq!(config.jobs.upload_base, "https://cdn.example.com/put");
        assert_eq!(config.jobs.max_attempts, 5);
        assert_eq!(config.jobs.workers, 4);
        assert_eq!(config.jobs.upload_deadline_secs, 3600);
        assert_eq!(config.log.format, "json");
    }

    #[test]
    fn test_parse_defaults() {
        let config = DmConfig::from_toml("").unwrap();

        assert_eq!(config.chunking.min_chunk, 16 * 1024);
        assert_eq!(config.chunking.avg_chunk, 64 * 1024);
        assert_eq!(config.chunking.max_chunk, 256 * 1024);
        assert_eq!(config.crypto.argon2_time_cost, 3);
        assert_eq!(config.crypto.argon2_parallelism, 1);
        assert_eq!(config.crypto.pbkdf2_iterations, 250_000);
        assert_eq!(config.store.backend, StoreBackendKind::Rocksdb);
        assert_eq!(config.jobs.queue, QueueKind::Local);
        assert_eq!(config.jobs.upload_base, "https://uploads.example.com/upload");
        assert_eq!(config.jobs.max_attempts, 3);
        assert_eq!(config.jobs.upload_deadline_secs, 86_400);
        assert_eq!(config.log.level, "info");
    }

    #[test]
    fn test_parse_partial_config() {
        let toml_str = r#"
[jobs]
max_attempts = 7
"#;
        let config = DmConfig::from_toml(toml_str).unwrap();

        // Overridden
        assert_eq!(config.jobs.max_attempts, 7);
        // Defaults
        assert_eq!(config.jobs.backoff_ms, 500);
        assert_eq!(config.chunking.avg_chunk, 64 * 1024);
    }

    #[test]
    fn test_unknown_backend_is_config_error() {
        let err = DmConfig::from_toml("[store]\nbackend = \"postgres\"\n").unwrap_err();
        assert!(matches!(err, crate::DmError::Config(_)));
    }

    #[test]
    fn test_serialize_roundtrip() {
        let config = DmConfig::default();
        let toml_str = config.to_toml().unwrap();
        let parsed = DmConfig::from_toml(&toml_str).unwrap();

        assert_eq!(config.chunking.max_chunk, parsed.chunking.max_chunk);
        assert_eq!(config.store.path, parsed.store.path);
        assert_eq!(config.jobs.nats_url, parsed.jobs.nats_url);
    }
}
