//! Capability surface of the hierarchical coordination service.
//!
//! The replication protocol only relies on the primitives below: persistent,
//! ephemeral and sequential nodes, optimistic versions, one-shot watches and an
//! atomic multi-operation. Anything that offers those semantics (a real
//! ZooKeeper-like ensemble or [`memory::InMemoryCoordination`]) can host the log.

pub mod ephemeral;
pub mod memory;

use std::sync::{Arc, Condvar, Mutex};
use std::time::{Duration, Instant};

use thiserror::Error;

/// Width of the zero-padded suffix appended to sequential nodes.
pub const SEQUENTIAL_SUFFIX_WIDTH: usize = 10;

/// Node creation flavour.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CreateMode {
    Persistent,
    Ephemeral,
    PersistentSequential,
    EphemeralSequential,
}

impl CreateMode {
    pub fn is_ephemeral(self) -> bool {
        matches!(self, CreateMode::Ephemeral | CreateMode::EphemeralSequential)
    }

    pub fn is_sequential(self) -> bool {
        matches!(
            self,
            CreateMode::PersistentSequential | CreateMode::EphemeralSequential
        )
    }
}

/// Node metadata returned alongside reads and writes.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct Stat {
    /// Data version, bumped on every `set`.
    pub version: i32,
    /// Number of children ever created; seeds sequential suffixes.
    pub cversion: i32,
    pub num_children: usize,
    /// Session owning the node when it is ephemeral.
    pub ephemeral_owner: Option<u64>,
}

/// Single request inside an atomic [`CoordinationClient::multi`].
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Op {
    Create {
        path: String,
        data: String,
        mode: CreateMode,
    },
    Remove {
        path: String,
        version: Option<i32>,
    },
    Set {
        path: String,
        data: String,
        version: Option<i32>,
    },
    Check {
        path: String,
        version: Option<i32>,
    },
}

impl Op {
    pub fn create(path: impl Into<String>, data: impl Into<String>, mode: CreateMode) -> Self {
        Op::Create {
            path: path.into(),
            data: data.into(),
            mode,
        }
    }

    pub fn remove(path: impl Into<String>) -> Self {
        Op::Remove {
            path: path.into(),
            version: None,
        }
    }

    pub fn set(path: impl Into<String>, data: impl Into<String>) -> Self {
        Op::Set {
            path: path.into(),
            data: data.into(),
            version: None,
        }
    }

    pub fn set_versioned(path: impl Into<String>, data: impl Into<String>, version: i32) -> Self {
        Op::Set {
            path: path.into(),
            data: data.into(),
            version: Some(version),
        }
    }

    pub fn check(path: impl Into<String>) -> Self {
        Op::Check {
            path: path.into(),
            version: None,
        }
    }

    pub fn path(&self) -> &str {
        match self {
            Op::Create { path, .. }
            | Op::Remove { path, .. }
            | Op::Set { path, .. }
            | Op::Check { path, .. } => path,
        }
    }
}

/// Per-op response of a successful multi.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum OpResult {
    Created { path: String },
    Removed,
    Set(Stat),
    Checked,
}

impl OpResult {
    /// Path assigned to a created node (differs from the request for sequential nodes).
    pub fn created_path(&self) -> Option<&str> {
        match self {
            OpResult::Created { path } => Some(path),
            _ => None,
        }
    }
}

/// Errors surfaced by the coordination service.
#[derive(Debug, Clone, Error, PartialEq, Eq)]
pub enum CoordinationError {
    #[error("node {path} does not exist")]
    NoNode { path: String },
    #[error("node {path} already exists")]
    NodeExists { path: String },
    #[error("node {path} has children")]
    NotEmpty { path: String },
    #[error("version mismatch on {path}: expected {expected}, actual {actual}")]
    BadVersion {
        path: String,
        expected: i32,
        actual: i32,
    },
    #[error("ephemeral node {path} cannot have children")]
    NoChildrenForEphemerals { path: String },
    #[error("invalid node path {path:?}")]
    BadPath { path: String },
    #[error("node {path} holds malformed data {data:?}")]
    Malformed { path: String, data: String },
    #[error("coordination session expired")]
    SessionExpired,
    #[error("connection to coordination service lost")]
    ConnectionLoss,
    #[error("multi-op failed at op #{index}: {source}")]
    Multi {
        index: usize,
        source: Box<CoordinationError>,
    },
}

impl CoordinationError {
    /// Session-level failures: the caller must reconnect before retrying.
    pub fn is_hardware_error(&self) -> bool {
        match self {
            CoordinationError::SessionExpired | CoordinationError::ConnectionLoss => true,
            CoordinationError::Multi { source, .. } => source.is_hardware_error(),
            _ => false,
        }
    }

    /// Underlying error, unwrapping multi-op failures.
    pub fn root_cause(&self) -> &CoordinationError {
        match self {
            CoordinationError::Multi { source, .. } => source.root_cause(),
            other => other,
        }
    }

    /// Index of the failed op when this error came out of a multi.
    pub fn failed_op(&self) -> Option<usize> {
        match self {
            CoordinationError::Multi { index, .. } => Some(*index),
            _ => None,
        }
    }

    pub fn is_no_node(&self) -> bool {
        matches!(self.root_cause(), CoordinationError::NoNode { .. })
    }

    pub fn is_node_exists(&self) -> bool {
        matches!(self.root_cause(), CoordinationError::NodeExists { .. })
    }

    pub fn is_bad_version(&self) -> bool {
        matches!(self.root_cause(), CoordinationError::BadVersion { .. })
    }
}

/// Reason a watch fired.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum WatchEvent {
    Created,
    Deleted,
    DataChanged,
    ChildrenChanged,
    SessionExpired,
}

#[derive(Debug, Default)]
struct WatchInner {
    fired: Mutex<Option<WatchEvent>>,
    cv: Condvar,
}

/// One-shot notification armed by a watched read.
#[derive(Debug, Clone, Default)]
pub struct Watch {
    inner: Arc<WatchInner>,
}

impl Watch {
    pub fn new() -> Self {
        Self::default()
    }

    /// Fires the watch; only the first event is retained.
    pub fn trigger(&self, event: WatchEvent) {
        let mut fired = self.inner.fired.lock().unwrap();
        if fired.is_none() {
            *fired = Some(event);
            self.inner.cv.notify_all();
        }
    }

    pub fn event(&self) -> Option<WatchEvent> {
        *self.inner.fired.lock().unwrap()
    }

    pub fn is_triggered(&self) -> bool {
        self.event().is_some()
    }

    /// True when no handle other than this one is left to observe the watch.
    pub(crate) fn is_orphaned(&self) -> bool {
        Arc::strong_count(&self.inner) == 1
    }

    /// Blocks until the watch fires or `timeout` elapses.
    pub fn wait_timeout(&self, timeout: Duration) -> Option<WatchEvent> {
        let deadline = Instant::now() + timeout;
        let mut fired = self.inner.fired.lock().unwrap();
        loop {
            if let Some(event) = *fired {
                return Some(event);
            }
            let now = Instant::now();
            if now >= deadline {
                return None;
            }
            let (next, _) = self.inner.cv.wait_timeout(fired, deadline - now).unwrap();
            fired = next;
        }
    }
}

/// Session-scoped client of the coordination service.
///
/// Ephemeral nodes created through a client vanish when its session ends.
pub trait CoordinationClient: Send + Sync {
    fn session_id(&self) -> u64;

    fn is_expired(&self) -> bool;

    /// Creates a node and returns its final path (sequential suffix included).
    fn create(&self, path: &str, data: &str, mode: CreateMode) -> Result<String, CoordinationError>;

    fn get_with_stat(&self, path: &str) -> Result<(String, Stat), CoordinationError>;

    fn exists(&self, path: &str) -> Result<Option<Stat>, CoordinationError>;

    fn set(&self, path: &str, data: &str, version: Option<i32>) -> Result<Stat, CoordinationError>;

    fn remove(&self, path: &str, version: Option<i32>) -> Result<(), CoordinationError>;

    /// Child names (not full paths) in lexicographic order.
    fn children(&self, path: &str) -> Result<Vec<String>, CoordinationError>;

    /// Reads a node (if present) and arms a watch on its creation, removal or change.
    fn watch_data(&self, path: &str) -> Result<(Option<String>, Watch), CoordinationError>;

    /// Lists children and arms a watch on the child set.
    fn watch_children(&self, path: &str) -> Result<(Vec<String>, Watch), CoordinationError>;

    /// Applies every op or none of them.
    fn multi(&self, ops: &[Op]) -> Result<Vec<OpResult>, CoordinationError>;
}

/// Opens fresh sessions, used to reconnect after expiry.
pub trait SessionFactory: Send + Sync {
    fn connect(&self) -> Result<Arc<dyn CoordinationClient>, CoordinationError>;
}

/// Convenience operations layered over the raw client.
pub trait CoordinationClientExt: CoordinationClient {
    fn get(&self, path: &str) -> Result<String, CoordinationError> {
        self.get_with_stat(path).map(|(data, _)| data)
    }

    fn try_get(&self, path: &str) -> Result<Option<String>, CoordinationError> {
        match self.get(path) {
            Ok(data) => Ok(Some(data)),
            Err(CoordinationError::NoNode { .. }) => Ok(None),
            Err(err) => Err(err),
        }
    }

    fn node_exists(&self, path: &str) -> Result<bool, CoordinationError> {
        self.exists(path).map(|stat| stat.is_some())
    }

    /// Removes a node, returning `false` when it was already gone.
    fn try_remove(&self, path: &str) -> Result<bool, CoordinationError> {
        match self.remove(path, None) {
            Ok(()) => Ok(true),
            Err(CoordinationError::NoNode { .. }) => Ok(false),
            Err(err) => Err(err),
        }
    }

    /// Creates a node, returning `false` when it already existed.
    fn try_create(&self, path: &str, data: &str, mode: CreateMode) -> Result<bool, CoordinationError> {
        match self.create(path, data, mode) {
            Ok(_) => Ok(true),
            Err(CoordinationError::NodeExists { .. }) => Ok(false),
            Err(err) => Err(err),
        }
    }

    /// Reads a node holding a decimal counter.
    fn get_number(&self, path: &str) -> Result<u64, CoordinationError> {
        let data = self.get(path)?;
        parse_number(path, &data)
    }

    /// Creates every missing ancestor of `path` as an empty persistent node.
    fn create_ancestors(&self, path: &str) -> Result<(), CoordinationError> {
        let mut prefix = String::new();
        let segments: Vec<&str> = path.split('/').filter(|s| !s.is_empty()).collect();
        for segment in segments.iter().take(segments.len().saturating_sub(1)) {
            prefix.push('/');
            prefix.push_str(segment);
            self.try_create(&prefix, "", CreateMode::Persistent)?;
        }
        Ok(())
    }

    /// Removes an ephemeral node left by a previous incarnation of this process.
    fn delete_ephemeral_if_content_matches<F>(
        &self,
        path: &str,
        matches: F,
    ) -> Result<bool, CoordinationError>
    where
        F: Fn(&str) -> bool,
    {
        let Some(content) = self.try_get(path)? else {
            return Ok(false);
        };
        if !matches(&content) {
            return Ok(false);
        }
        self.try_remove(path)
    }
}

impl<T: CoordinationClient + ?Sized> CoordinationClientExt for T {}

/// Joins a parent path and a child name.
pub fn join_path(parent: &str, child: &str) -> String {
    if parent.ends_with('/') {
        format!("{parent}{child}")
    } else {
        format!("{parent}/{child}")
    }
}

/// Last path segment.
pub fn node_name(path: &str) -> &str {
    path.rsplit('/').next().unwrap_or(path)
}

pub fn parse_number(path: &str, data: &str) -> Result<u64, CoordinationError> {
    data.trim()
        .parse::<u64>()
        .map_err(|_| CoordinationError::Malformed {
            path: path.to_string(),
            data: data.to_string(),
        })
}
