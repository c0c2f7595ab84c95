//! Collaborators the worker drives: the local schema metadata and the
//! statement executor.

pub mod catalog;

use serde::{Deserialize, Serialize};
use thiserror::Error;

use crate::coordination::{CoordinationClient, CoordinationError, Op};
use crate::replication::entry::LogEntry;

/// Locally materialized schema metadata of one replica.
pub trait ReplicatedMetadata: Send + Sync {
    /// Digest of the local metadata, compared against `replicas/<r>/digest`.
    fn local_digest(&self) -> u64;

    /// Rebuilds local metadata from the shared copy after the replica was declared lost.
    ///
    /// Returns the `max_log_ptr` the rebuilt metadata corresponds to. It can be
    /// ahead of `max_log_ptr` when entries were committed during recovery.
    fn recover_lost_replica(
        &self,
        client: &dyn CoordinationClient,
        our_log_ptr: u64,
        max_log_ptr: u64,
    ) -> Result<u64, MetadataError>;

    /// True when the cached digest matches a full recomputation.
    fn check_digest_valid(&self) -> bool;

    /// Re-reads the replica set after a topology-refresh marker.
    fn refresh_cluster_topology(&self, client: &dyn CoordinationClient) -> Result<(), MetadataError>;

    /// Whether the object referenced by an entry still exists locally.
    fn parent_exists(&self, reference: &str) -> bool;
}

/// Everything an executor may need to apply one entry.
#[derive(Debug, Clone, Copy)]
pub struct ExecutionContext<'a> {
    pub entry_name: &'a str,
    pub entry_number: u64,
    pub entry: &'a LogEntry,
    /// True only on the replica that originated the statement.
    pub is_initial_query: bool,
    /// Root of the database in the coordination service.
    pub database_root: &'a str,
}

/// A statement validated against local metadata but not applied yet.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PreparedChange {
    /// Coordination ops that commit atomically with the entry (may be empty).
    pub ops: Vec<Op>,
    /// Local digest once the change is applied; persisted by the commit.
    pub digest: u64,
}

/// Parses and applies one statement in two phases.
///
/// `prepare` must leave local metadata untouched. Only a change whose commit
/// transaction succeeded is handed to `apply`.
pub trait StatementExecutor: Send + Sync {
    fn prepare(&self, ctx: &ExecutionContext<'_>) -> Result<PreparedChange, ExecutionFailure>;

    /// Applies a committed change locally.
    fn apply(&self, ctx: &ExecutionContext<'_>, change: &PreparedChange) -> Result<(), ExecutionFailure>;
}

/// Statement-level failure reported by an executor.
#[derive(Debug, Clone, Error, PartialEq, Eq)]
pub enum ExecutionFailure {
    #[error("cannot parse statement '{statement}': {reason}")]
    Syntax { statement: String, reason: String },
    #[error("object '{name}' already exists")]
    AlreadyExists { name: String },
    #[error("object '{name}' does not exist")]
    UnknownObject { name: String },
    #[error("{0}")]
    Rejected(String),
}

impl ExecutionFailure {
    /// Stable numeric code written into `finished/<replica>`.
    pub fn code(&self) -> i32 {
        match self {
            ExecutionFailure::Syntax { .. } => 62,
            ExecutionFailure::AlreadyExists { .. } => 57,
            ExecutionFailure::UnknownObject { .. } => 60,
            ExecutionFailure::Rejected(_) => 1,
        }
    }
}

/// Execution status persisted under `finished/`.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ExecutionStatus {
    pub code: i32,
    #[serde(default, skip_serializing_if = "String::is_empty")]
    pub message: String,
}

impl ExecutionStatus {
    pub fn success() -> Self {
        Self {
            code: 0,
            message: String::new(),
        }
    }

    pub fn is_success(&self) -> bool {
        self.code == 0
    }

    pub fn to_json(&self) -> String {
        serde_json::to_string(self).unwrap_or_else(|_| format!("{{\"code\":{}}}", self.code))
    }
}

impl From<&ExecutionFailure> for ExecutionStatus {
    fn from(failure: &ExecutionFailure) -> Self {
        Self {
            code: failure.code(),
            message: failure.to_string(),
        }
    }
}

/// Errors raised by metadata collaborators.
#[derive(Debug, Clone, Error, PartialEq, Eq)]
pub enum MetadataError {
    #[error("metadata recovery failed: {0}")]
    Recovery(String),
    #[error("stored definition of '{name}' is invalid: {reason}")]
    InvalidDefinition { name: String, reason: String },
    #[error(transparent)]
    Coordination(#[from] CoordinationError),
}
