use serde::Deserialize;
use std::fs;
use std::path::{Path, PathBuf};

fn default_polling_interval() -> u64 {
    30
}

fn default_batch_size() -> usize {
    1_000
}

fn default_command_timeout() -> u64 {
    6_000
}

fn default_max_concurrent_jobs() -> usize {
    5
}

fn default_port() -> u16 {
    1433
}

fn default_key_path() -> PathBuf {
    PathBuf::from("dbshuttle.key")
}

/// Job repository endpoint, the database holding ImportData / Scheduler /
/// DataSource. This password is plaintext in the config file; only stored
/// data-source passwords are encrypted.
#[derive(Debug, Clone, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct RepositorySettings {
    pub host: String,
    #[serde(default = "default_port")]
    pub port: u16,
    pub database: String,
    pub username: String,
    #[serde(default)]
    pub password: String,
}

#[derive(Debug, Clone, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct WorkerSettings {
    pub repository: RepositorySettings,
    #[serde(default = "default_polling_interval")]
    pub polling_interval_seconds: u64,
    #[serde(default = "default_batch_size")]
    pub batch_size: usize,
    #[serde(default = "default_command_timeout")]
    pub command_timeout_seconds: u64,
    /// Accepted for config compatibility; the worker currently runs jobs
    /// sequentially within a cycle.
    #[serde(default = "default_max_concurrent_jobs")]
    pub max_concurrent_jobs: usize,
    #[serde(default = "default_key_path")]
    pub encryption_key_path: PathBuf,
}

impl WorkerSettings {
    pub fn load(path: &Path) -> Result<Self, String> {
        let content = fs::read_to_string(path)
            .map_err(|e| format!("Failed to read config file {}: {}", path.display(), e))?;
        serde_json::from_str(&content)
            .map_err(|e| format!("Failed to parse config file {}: {}", path.display(), e))
    }
}
