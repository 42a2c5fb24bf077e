use std::path::PathBuf;
use std::time::Duration;

use crate::util::env::{env_opt, env_parse};

pub const DEFAULT_CHUNK_SIZE: usize = 50_000;
pub const DEFAULT_BULK_BASE_URL: &str = "https://www.fec.gov/files/bulk-downloads";

/// Import tuning, read from `FEC_*` environment variables.
#[derive(Debug, Clone)]
pub struct ImportConfig {
    pub chunk_size: usize,
    pub max_concurrent_jobs: usize,
    pub parse_workers: usize,
    pub data_dir: PathBuf,
    pub staging_dir: PathBuf,
    pub bulk_base_url: String,
    pub max_file_bytes: u64,
    pub http_timeout: Duration,
    pub db_max_connections: u32,
    pub db_acquire_timeout: Duration,
}

impl Default for ImportConfig {
    fn default() -> Self {
        let data_dir = PathBuf::from("./data/fec");
        Self {
            chunk_size: DEFAULT_CHUNK_SIZE,
            max_concurrent_jobs: 2,
            parse_workers: 4,
            staging_dir: data_dir.join("staging"),
            data_dir,
            bulk_base_url: DEFAULT_BULK_BASE_URL.to_string(),
            max_file_bytes: 16 << 30,
            http_timeout: Duration::from_secs(3600),
            db_max_connections: 10,
            db_acquire_timeout: Duration::from_secs(10),
        }
    }
}

impl ImportConfig {
    pub fn from_env() -> Self {
        let d = Self::default();
        let data_dir = env_opt("FEC_DATA_DIR").map(PathBuf::from).unwrap_or(d.data_dir);
        let staging_dir = env_opt("FEC_STAGING_DIR")
            .map(PathBuf::from)
            .unwrap_or_else(|| data_dir.join("staging"));
        Self {
            chunk_size: env_parse("FEC_CHUNK_SIZE", d.chunk_size).max(1),
            max_concurrent_jobs: env_parse("FEC_MAX_CONCURRENT_JOBS", d.max_concurrent_jobs).max(1),
            parse_workers: env_parse("FEC_PARSE_WORKERS", d.parse_workers).max(1),
            data_dir,
            staging_dir,
            bulk_base_url: env_opt("FEC_BULK_BASE_URL").unwrap_or(d.bulk_base_url),
            max_file_bytes: env_parse("FEC_MAX_FILE_BYTES", d.max_file_bytes),
            http_timeout: Duration::from_secs(env_parse(
                "FEC_HTTP_TIMEOUT_SECS",
                d.http_timeout.as_secs(),
            )),
            db_max_connections: env_parse("FEC_DB_MAX_CONNECTIONS", d.db_max_connections).max(1),
            db_acquire_timeout: Duration::from_secs(env_parse(
                "FEC_DB_ACQUIRE_TIMEOUT_SECS",
                d.db_acquire_timeout.as_secs(),
            )),
        }
    }

    /// Keys included in the startup configuration snapshot.
    pub const LOGGED_KEYS: &'static [&'static str] = &[
        "FEC_CHUNK_SIZE",
        "FEC_MAX_CONCURRENT_JOBS",
        "FEC_PARSE_WORKERS",
        "FEC_DATA_DIR",
        "FEC_STAGING_DIR",
        "FEC_BULK_BASE_URL",
        "FEC_MAX_FILE_BYTES",
        "FEC_DATABASE_URL",
        "DATABASE_URL",
        "AUTO_MIGRATE",
    ];
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn defaults_match_documented_values() {
        let cfg = ImportConfig::default();
        assert_eq!(cfg.chunk_size, 50_000);
        assert_eq!(cfg.max_concurrent_jobs, 2);
        assert_eq!(cfg.staging_dir, PathBuf::from("./data/fec/staging"));
        assert_eq!(cfg.max_file_bytes, 17_179_869_184);
    }
}
