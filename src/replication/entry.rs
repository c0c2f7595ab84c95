use std::sync::atomic::{AtomicU64, Ordering};
use std::time::{SystemTime, UNIX_EPOCH};

use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};

use crate::coordination::CoordinationError;

static ID_SEQUENCE: AtomicU64 = AtomicU64::new(0);

/// Hex identifier of `bytes` random-looking bytes derived from time, a process
/// sequence and `seed`.
pub fn generate_id(seed: &str, bytes: usize) -> String {
    let nanos = SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .map(|elapsed| elapsed.as_nanos())
        .unwrap_or_default();
    let sequence = ID_SEQUENCE.fetch_add(1, Ordering::Relaxed);
    let mut hasher = Sha256::new();
    hasher.update(seed.as_bytes());
    hasher.update(nanos.to_le_bytes());
    hasher.update(sequence.to_le_bytes());
    hasher.update(std::process::id().to_le_bytes());
    let digest = hasher.finalize();
    hex::encode(&digest[..bytes.min(digest.len())])
}

/// Distributed trace context carried by an entry to every replica.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct TraceContext {
    pub trace_id: String,
    pub span_id: String,
}

impl TraceContext {
    /// Starts a new trace rooted at the initiator.
    pub fn new_root(seed: &str) -> Self {
        Self {
            trace_id: generate_id(seed, 16),
            span_id: generate_id(seed, 8),
        }
    }
}

/// One statement published in the shared log.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct LogEntry {
    /// Statement text; empty marks a topology refresh.
    pub statement: String,
    /// Full name of the replica that published the entry.
    #[serde(default)]
    pub initiator: String,
    /// Object that must still exist for the entry to apply.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub parent: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub tracing_context: Option<TraceContext>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub initial_query_id: Option<String>,
}

impl LogEntry {
    pub fn new(statement: impl Into<String>) -> Self {
        Self {
            statement: statement.into(),
            ..Self::default()
        }
    }

    /// Marker telling replicas to re-read the replica set.
    pub fn topology_refresh(initiator: impl Into<String>) -> Self {
        Self {
            initiator: initiator.into(),
            ..Self::default()
        }
    }

    pub fn with_parent(mut self, parent: impl Into<String>) -> Self {
        self.parent = Some(parent.into());
        self
    }

    pub fn is_topology_refresh(&self) -> bool {
        self.statement.trim().is_empty()
    }

    pub fn to_payload(&self) -> String {
        // Plain strings and options only; serialization cannot fail.
        serde_json::to_string(self).expect("log entry serializes to json")
    }

    /// Parses a stored payload; an empty payload is a topology refresh.
    pub fn from_payload(path: &str, payload: &str) -> Result<Self, CoordinationError> {
        if payload.trim().is_empty() {
            return Ok(Self::default());
        }
        serde_json::from_str(payload).map_err(|_| CoordinationError::Malformed {
            path: path.to_string(),
            data: payload.to_string(),
        })
    }
}
