use thiserror::Error;

use crate::coordination::CoordinationError;
use crate::metadata::MetadataError;

/// Failures surfaced by the replicated DDL worker and its initiator path.
#[derive(Debug, Clone, Error, PartialEq, Eq)]
pub enum ReplicationError {
    #[error("coordination session expired while {context}")]
    SessionExpired { context: String },
    #[error("replication is stopped")]
    ReplicationStopped,
    #[error("could not allocate a log entry after {attempts} attempts, try again later")]
    EnqueueContention { attempts: u32 },
    #[error(
        "replica is {lag} entries behind (log_ptr {log_ptr}, max_log_ptr {max_log_ptr}), \
         not a good target for initial queries, try another replica"
    )]
    ReplicationLagTooHigh {
        log_ptr: u64,
        max_log_ptr: u64,
        lag: u64,
    },
    #[error("timed out after {timeout_ms}ms waiting for replica to reach {entry}, try again later")]
    InitialQueryTimeout { entry: String, timeout_ms: u64 },
    #[error("query for {entry} was cancelled")]
    Cancelled { entry: String },
    #[error("object '{reference}' referenced by {entry} was dropped")]
    ReferenceGone { entry: String, reference: String },
    #[error("entry {entry} was aborted: {reason}")]
    EntryAborted { entry: String, reason: String },
    #[error("execution of {entry} failed: {message}")]
    ExecutionFailed { entry: String, message: String },
    #[error("invalid replication settings: {0}")]
    InvalidSettings(String),
    #[error("failed to spawn thread {name}: {reason}")]
    ThreadSpawn { name: String, reason: String },
    #[error("logical inconsistency: {0}")]
    LogicalInconsistency(String),
    #[error("coordination failure: {0}")]
    Coordination(#[from] CoordinationError),
    #[error("metadata failure: {0}")]
    Metadata(#[from] MetadataError),
}

impl ReplicationError {
    /// True when resubmitting the statement (possibly elsewhere) may succeed.
    pub fn is_retryable(&self) -> bool {
        match self {
            ReplicationError::SessionExpired { .. }
            | ReplicationError::EnqueueContention { .. }
            | ReplicationError::ReplicationLagTooHigh { .. }
            | ReplicationError::InitialQueryTimeout { .. }
            | ReplicationError::EntryAborted { .. } => true,
            ReplicationError::Coordination(err)
            | ReplicationError::Metadata(MetadataError::Coordination(err)) => err.is_hardware_error(),
            ReplicationError::ReplicationStopped
            | ReplicationError::Cancelled { .. }
            | ReplicationError::ReferenceGone { .. }
            | ReplicationError::ExecutionFailed { .. }
            | ReplicationError::InvalidSettings(_)
            | ReplicationError::ThreadSpawn { .. }
            | ReplicationError::LogicalInconsistency(_)
            | ReplicationError::Metadata(_) => false,
        }
    }

    /// Session or connection loss, directly or through a coordination error
    /// raised inside a metadata collaborator.
    pub fn is_session_error(&self) -> bool {
        match self {
            ReplicationError::SessionExpired { .. } => true,
            ReplicationError::Coordination(err)
            | ReplicationError::Metadata(MetadataError::Coordination(err)) => err.is_hardware_error(),
            _ => false,
        }
    }

    pub fn is_logical_inconsistency(&self) -> bool {
        matches!(self, ReplicationError::LogicalInconsistency(_))
    }
}
