use std::path::PathBuf;

use serde::{Deserialize, Serialize};

/// What recovery does with a manifest that cannot be parsed.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, Default)]
#[serde(rename_all = "snake_case")]
pub enum RecoveryPolicy {
    /// Refuse to start.
    #[default]
    Abort,
    /// Log the record and carry on without it.
    Skip,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct DaemonConfig {
    #[serde(default = "default_host")]
    pub host: String,
    #[serde(default = "default_port")]
    pub port: u16,
    #[serde(default)]
    pub data_dir: Option<PathBuf>,
    /// Upper bound on a single fetch, in seconds. 0 disables the limit.
    #[serde(default)]
    pub fetch_timeout_secs: u64,
    #[serde(default = "default_connect_timeout_secs")]
    pub connect_timeout_secs: u64,
    #[serde(default = "default_persist_retry_attempts")]
    pub persist_retry_attempts: u32,
    #[serde(default = "default_persist_retry_backoff_ms")]
    pub persist_retry_backoff_ms: u64,
    #[serde(default = "default_store_queue_capacity")]
    pub store_queue_capacity: usize,
    #[serde(default = "default_broadcast_capacity")]
    pub broadcast_capacity: usize,
    #[serde(default = "default_shutdown_grace_secs")]
    pub shutdown_grace_secs: u64,
    #[serde(default)]
    pub recovery_policy: RecoveryPolicy,
    #[serde(default = "default_user_agent")]
    pub user_agent: String,
}

fn default_host() -> String {
    "127.0.0.1".to_string()
}

fn default_port() -> u16 {
    8080
}

fn default_connect_timeout_secs() -> u64 {
    30
}

fn default_persist_retry_attempts() -> u32 {
    3
}

fn default_persist_retry_backoff_ms() -> u64 {
    100
}

fn default_store_queue_capacity() -> usize {
    256
}

fn default_broadcast_capacity() -> usize {
    1024
}

fn default_shutdown_grace_secs() -> u64 {
    10
}

fn default_user_agent() -> String {
    concat!("resource-downloader/", env!("CARGO_PKG_VERSION")).to_string()
}

impl Default for DaemonConfig {
    fn default() -> Self {
        Self {
            host: default_host(),
            port: default_port(),
            data_dir: None,
            fetch_timeout_secs: 0,
            connect_timeout_secs: default_connect_timeout_secs(),
            persist_retry_attempts: default_persist_retry_attempts(),
            persist_retry_backoff_ms: default_persist_retry_backoff_ms(),
            store_queue_capacity: default_store_queue_capacity(),
            broadcast_capacity: default_broadcast_capacity(),
            shutdown_grace_secs: default_shutdown_grace_secs(),
            recovery_policy: RecoveryPolicy::default(),
            user_agent: default_user_agent(),
        }
    }
}
