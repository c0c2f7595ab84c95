use std::fs;
use std::path::Path;
use std::time::Duration;

use serde::{Deserialize, Serialize};
use thiserror::Error;

/// Suffix appended to the liveness marker of a replica that recovered but is still behind.
pub const REPLICA_UNSYNCED_MARKER: &str = "\tUNSYNCED";

/// Tunables of the replicated DDL worker.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default, deny_unknown_fields)]
pub struct ReplicationSettings {
    /// Treat a local/stored digest mismatch as a lost replica.
    pub check_consistency: bool,
    /// Lag (in entries) above which the replica refuses new initial queries.
    pub max_replication_lag_to_enqueue: u64,
    /// Consecutive identical failures before the digest is invalidated (0 disables).
    pub max_retries_before_automatic_recovery: u64,
    /// How long a replica waits for an initiator to commit or roll back an entry.
    pub wait_entry_committed_timeout_ms: u64,
    /// Re-check interval while waiting on a watch (stop flag, slot changes).
    pub commit_poll_interval_ms: u64,
    /// How long an initiator waits for the applier to reach its entry.
    pub initial_query_timeout_ms: u64,
    /// Retention window seeded into the coordination service on database creation.
    pub logs_to_keep: u64,
    pub recovery_retry_backoff_ms: u64,
    pub error_retry_backoff_ms: u64,
    pub session_retry_backoff_ms: u64,
    pub enqueue_max_attempts: u32,
    pub enqueue_retry_backoff_ms: u64,
    pub cleanup_interval_ms: u64,
    /// Upper bound on a single wait for queue updates before re-checking the stop flag.
    pub queue_poll_interval_ms: u64,
}

impl Default for ReplicationSettings {
    fn default() -> Self {
        Self {
            check_consistency: true,
            max_replication_lag_to_enqueue: 50,
            max_retries_before_automatic_recovery: 10,
            wait_entry_committed_timeout_ms: 3_600_000,
            commit_poll_interval_ms: 1_000,
            initial_query_timeout_ms: 300_000,
            logs_to_keep: 1_000,
            recovery_retry_backoff_ms: 5_000,
            error_retry_backoff_ms: 5_000,
            session_retry_backoff_ms: 1_000,
            enqueue_max_attempts: 1_000,
            enqueue_retry_backoff_ms: 50,
            cleanup_interval_ms: 60_000,
            queue_poll_interval_ms: 1_000,
        }
    }
}

impl ReplicationSettings {
    /// Parses settings from a JSON document; missing keys keep their defaults.
    pub fn from_json_str(raw: &str) -> Result<Self, ConfigError> {
        let settings: Self = serde_json::from_str(raw)?;
        settings.validate()?;
        Ok(settings)
    }

    pub fn load(path: impl AsRef<Path>) -> Result<Self, ConfigError> {
        let path = path.as_ref();
        let raw = fs::read_to_string(path).map_err(|source| ConfigError::Read {
            path: path.display().to_string(),
            source,
        })?;
        Self::from_json_str(&raw)
    }

    /// Rejects values that would turn waits into busy loops or disable retention.
    pub fn validate(&self) -> Result<(), ConfigError> {
        let non_zero = [
            ("wait_entry_committed_timeout_ms", self.wait_entry_committed_timeout_ms),
            ("commit_poll_interval_ms", self.commit_poll_interval_ms),
            ("initial_query_timeout_ms", self.initial_query_timeout_ms),
            ("logs_to_keep", self.logs_to_keep),
            ("enqueue_max_attempts", u64::from(self.enqueue_max_attempts)),
            ("queue_poll_interval_ms", self.queue_poll_interval_ms),
            ("cleanup_interval_ms", self.cleanup_interval_ms),
        ];
        for (field, value) in non_zero {
            if value == 0 {
                return Err(ConfigError::Invalid {
                    field,
                    reason: "must be greater than zero",
                });
            }
        }
        if self.commit_poll_interval_ms > self.wait_entry_committed_timeout_ms {
            return Err(ConfigError::Invalid {
                field: "commit_poll_interval_ms",
                reason: "must not exceed wait_entry_committed_timeout_ms",
            });
        }
        Ok(())
    }

    pub fn wait_entry_committed_timeout(&self) -> Duration {
        Duration::from_millis(self.wait_entry_committed_timeout_ms)
    }

    pub fn commit_poll_interval(&self) -> Duration {
        Duration::from_millis(self.commit_poll_interval_ms)
    }

    pub fn initial_query_timeout(&self) -> Duration {
        Duration::from_millis(self.initial_query_timeout_ms)
    }

    pub fn recovery_retry_backoff(&self) -> Duration {
        Duration::from_millis(self.recovery_retry_backoff_ms)
    }

    pub fn error_retry_backoff(&self) -> Duration {
        Duration::from_millis(self.error_retry_backoff_ms)
    }

    pub fn session_retry_backoff(&self) -> Duration {
        Duration::from_millis(self.session_retry_backoff_ms)
    }

    pub fn enqueue_retry_backoff(&self) -> Duration {
        Duration::from_millis(self.enqueue_retry_backoff_ms)
    }

    pub fn cleanup_interval(&self) -> Duration {
        Duration::from_millis(self.cleanup_interval_ms)
    }

    pub fn queue_poll_interval(&self) -> Duration {
        Duration::from_millis(self.queue_poll_interval_ms)
    }
}

/// Identity of one replica of a replicated database.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ReplicaIdentity {
    pub database: String,
    pub shard: String,
    pub replica: String,
    /// Stable id of the hosting server, published in the liveness marker.
    pub host_id: String,
}

impl ReplicaIdentity {
    pub fn new(
        database: impl Into<String>,
        shard: impl Into<String>,
        replica: impl Into<String>,
        host_id: impl Into<String>,
    ) -> Self {
        Self {
            database: database.into(),
            shard: shard.into(),
            replica: replica.into(),
            host_id: host_id.into(),
        }
    }

    /// `shard|replica`, used as the node name under `replicas/` and as initiator identity.
    pub fn full_name(&self) -> String {
        format!("{}|{}", self.shard, self.replica)
    }

    /// Liveness marker content, optionally flagged as unsynced.
    pub fn active_marker(&self, unsynced: bool) -> String {
        if unsynced {
            format!("{}{}", self.host_id, REPLICA_UNSYNCED_MARKER)
        } else {
            self.host_id.clone()
        }
    }

    /// True when `content` is a liveness marker written by this host, synced or not.
    pub fn owns_active_marker(&self, content: &str) -> bool {
        content
            .strip_suffix(REPLICA_UNSYNCED_MARKER)
            .unwrap_or(content)
            == self.host_id
    }
}

/// Errors raised while loading settings.
#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("failed to read settings from {path}: {source}")]
    Read {
        path: String,
        #[source]
        source: std::io::Error,
    },
    #[error("failed to parse settings: {0}")]
    Parse(#[from] serde_json::Error),
    #[error("invalid setting {field}: {reason}")]
    Invalid {
        field: &'static str,
        reason: &'static str,
    },
}
