//! Engine and escalator configuration.

use std::time::Duration;

use serde::Deserialize;

/// Engine configuration loaded from environment variables.
///
/// Environment variables are prefixed with `WORKORDER_`:
/// - `WORKORDER_POLL_INTERVAL_SECS`: Escalation scan cadence (default: 30)
/// - `WORKORDER_LOOKUP_TIMEOUT_MS`: Directory call deadline (default: 2000)
/// - `WORKORDER_NOTIFY_TIMEOUT_MS`: Notification dispatch deadline (default: 2000)
/// - `WORKORDER_NATS_URL`: NATS server; events are only logged when unset
/// - `WORKORDER_NATS_SUBJECT_PREFIX`: Event subject prefix (default: "workorder.events")
/// - `WORKORDER_SYSTEM_ACTOR`: Actor id used for engine-initiated actions (default: "system")
/// - `WORKORDER_SCAN_BATCH`: Max overdue instances handled per tick (default: 500)
/// - `WORKORDER_DIRECTORY_FILE`: YAML role/department tables for the escalator
#[derive(Debug, Clone, Deserialize)]
pub struct EngineConfig {
    #[serde(default = "default_poll_interval")]
    pub poll_interval_secs: u64,

    #[serde(default = "default_timeout_ms")]
    pub lookup_timeout_ms: u64,

    #[serde(default = "default_timeout_ms")]
    pub notify_timeout_ms: u64,

    #[serde(default)]
    pub nats_url: Option<String>,

    #[serde(default = "default_subject_prefix")]
    pub nats_subject_prefix: String,

    #[serde(default = "default_system_actor")]
    pub system_actor: String,

    #[serde(default = "default_scan_batch")]
    pub scan_batch: usize,

    #[serde(default)]
    pub directory_file: Option<String>,
}

fn default_poll_interval() -> u64 {
    30
}

fn default_timeout_ms() -> u64 {
    2000
}

fn default_subject_prefix() -> String {
    "workorder.events".to_string()
}

fn default_system_actor() -> String {
    "system".to_string()
}

fn default_scan_batch() -> usize {
    500
}

impl EngineConfig {
    /// Load configuration from environment variables.
    pub fn from_env() -> Result<Self, envy::Error> {
        envy::prefixed("WORKORDER_").from_env::<EngineConfig>()
    }

    pub fn poll_interval(&self) -> Duration {
        Duration::from_secs(self.poll_interval_secs.max(1))
    }

    pub fn lookup_timeout(&self) -> Duration {
        Duration::from_millis(self.lookup_timeout_ms)
    }

    pub fn notify_timeout(&self) -> Duration {
        Duration::from_millis(self.notify_timeout_ms)
    }
}

impl Default for EngineConfig {
    fn default() -> Self {
        Self {
            poll_interval_secs: default_poll_interval(),
            lookup_timeout_ms: default_timeout_ms(),
            notify_timeout_ms: default_timeout_ms(),
            nats_url: None,
            nats_subject_prefix: default_subject_prefix(),
            system_actor: default_system_actor(),
            scan_batch: default_scan_batch(),
            directory_file: None,
        }
    }
}
