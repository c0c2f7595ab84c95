use std::fmt;

use crate::error::ReplicationError;
use crate::metadata::ExecutionStatus;

use super::entry::LogEntry;
use super::paths::parse_entry_number;

/// Lifecycle of one entry while the applier evaluates it.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum EntryState {
    Pending,
    AwaitingCommit,
    Executing,
    Applied,
    Skipped,
    Aborted,
}

impl EntryState {
    fn can_move_to(self, next: EntryState) -> bool {
        use EntryState::*;
        matches!(
            (self, next),
            (Pending, AwaitingCommit | Executing | Skipped | Aborted)
                | (AwaitingCommit, Executing | Skipped | Aborted)
                | (Executing, Applied)
        )
    }
}

/// Why an entry was passed over without executing it.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum SkipReason {
    /// Entry number is not above the log pointer.
    AlreadyApplied { log_ptr: u64 },
    /// Empty payload: the replica set changed.
    TopologyRefresh,
    /// `finished/<replica>` already exists.
    AlreadyFinished,
}

/// Why an entry will never apply on this replica.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum AbortReason {
    /// The initiator neither committed nor rolled back in time; `/try` was removed.
    CommitTimeout,
    /// `/try` disappeared without `/committed` appearing.
    NotCommitted,
    /// The object the statement depends on no longer exists.
    ReferenceGone { reference: String },
}

/// Resolution of one log entry.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum TaskOutcome {
    Applied,
    Skipped(SkipReason),
    Aborted(AbortReason),
    Failed { code: i32, message: String },
}

impl TaskOutcome {
    pub fn is_applied(&self) -> bool {
        matches!(self, TaskOutcome::Applied)
    }

    /// Final outcomes move the in-memory log pointer past the entry.
    pub fn is_final(&self) -> bool {
        !matches!(self, TaskOutcome::Failed { .. })
    }
}

impl fmt::Display for TaskOutcome {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            TaskOutcome::Applied => write!(f, "applied"),
            TaskOutcome::Skipped(SkipReason::AlreadyApplied { log_ptr }) => {
                write!(f, "skipped: already applied (log_ptr {log_ptr})")
            }
            TaskOutcome::Skipped(SkipReason::TopologyRefresh) => {
                write!(f, "skipped: topology refresh")
            }
            TaskOutcome::Skipped(SkipReason::AlreadyFinished) => {
                write!(f, "skipped: already finished")
            }
            TaskOutcome::Aborted(AbortReason::CommitTimeout) => {
                write!(f, "aborted: forcefully cancelled after commit timeout")
            }
            TaskOutcome::Aborted(AbortReason::NotCommitted) => {
                write!(f, "aborted: not committed")
            }
            TaskOutcome::Aborted(AbortReason::ReferenceGone { reference }) => {
                write!(f, "aborted: '{reference}' no longer exists")
            }
            TaskOutcome::Failed { code, message } => write!(f, "failed ({code}): {message}"),
        }
    }
}

/// Applier-owned record of the entry currently under evaluation.
#[derive(Debug)]
pub struct Task {
    pub name: String,
    pub number: u64,
    pub entry: Option<LogEntry>,
    pub is_initial_query: bool,
    pub was_executed: bool,
    pub status: Option<ExecutionStatus>,
    state: EntryState,
}

impl Task {
    pub fn new(name: &str) -> Result<Self, ReplicationError> {
        let number = parse_entry_number(name).ok_or_else(|| {
            ReplicationError::LogicalInconsistency(format!("malformed log entry name {name}"))
        })?;
        Ok(Self {
            name: name.to_string(),
            number,
            entry: None,
            is_initial_query: false,
            was_executed: false,
            status: None,
            state: EntryState::Pending,
        })
    }

    pub fn state(&self) -> EntryState {
        self.state
    }

    pub fn transition(&mut self, next: EntryState) -> Result<(), ReplicationError> {
        if !self.state.can_move_to(next) {
            return Err(ReplicationError::LogicalInconsistency(format!(
                "entry {} cannot move from {:?} to {:?}",
                self.name, self.state, next
            )));
        }
        self.state = next;
        Ok(())
    }

    /// Moves to the terminal state matching `outcome`.
    pub fn resolve(&mut self, outcome: &TaskOutcome) -> Result<(), ReplicationError> {
        match outcome {
            TaskOutcome::Applied => self.transition(EntryState::Applied),
            TaskOutcome::Skipped(_) => self.transition(EntryState::Skipped),
            TaskOutcome::Aborted(_) => self.transition(EntryState::Aborted),
            TaskOutcome::Failed { .. } => Ok(()),
        }
    }
}
