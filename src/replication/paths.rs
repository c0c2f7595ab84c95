use crate::coordination::{join_path, SEQUENTIAL_SUFFIX_WIDTH};

/// Prefix of every log entry node name.
pub const ENTRY_PREFIX: &str = "query-";
/// Prefix of the transient counter nodes used for numbering.
pub const COUNTER_PREFIX: &str = "cnt-";

/// Canonical name of entry `number`, e.g. `query-0000000042`.
pub fn entry_name(number: u64) -> String {
    format!(
        "{ENTRY_PREFIX}{number:0width$}",
        width = SEQUENTIAL_SUFFIX_WIDTH
    )
}

/// Entry number encoded in a log entry name.
pub fn parse_entry_number(name: &str) -> Option<u64> {
    let digits = name.strip_prefix(ENTRY_PREFIX)?;
    if digits.is_empty() || !digits.bytes().all(|b| b.is_ascii_digit()) {
        return None;
    }
    digits.parse().ok()
}

/// Node layout of one replicated database, seen from one replica.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct DatabasePaths {
    root: String,
    replica: String,
}

impl DatabasePaths {
    /// Trailing slashes on `root` are dropped.
    pub fn new(root: impl Into<String>, replica_full_name: impl Into<String>) -> Self {
        let mut root = root.into();
        while root.len() > 1 && root.ends_with('/') {
            root.pop();
        }
        Self {
            root,
            replica: replica_full_name.into(),
        }
    }

    /// Database root in the coordination service.
    pub fn root(&self) -> &str {
        &self.root
    }

    /// `shard|replica` of the replica these paths belong to.
    pub fn replica_name(&self) -> &str {
        &self.replica
    }

    /// `log`, parent of every `query-<n>` entry.
    pub fn log_dir(&self) -> String {
        join_path(&self.root, "log")
    }

    /// `log/<name>`, holding the serialized entry.
    pub fn entry(&self, name: &str) -> String {
        join_path(&self.log_dir(), name)
    }

    /// Ephemeral marker owned by the initiator until it commits or rolls back.
    pub fn entry_try(&self, name: &str) -> String {
        join_path(&self.entry(name), "try")
    }

    /// Persistent marker; its presence admits the entry.
    pub fn entry_committed(&self, name: &str) -> String {
        join_path(&self.entry(name), "committed")
    }

    /// One of the `active`, `finished` and `synced` directories of an entry.
    pub fn entry_status_dir(&self, name: &str, status: &str) -> String {
        join_path(&self.entry(name), status)
    }

    /// Held by this replica while it executes the entry.
    pub fn entry_active(&self, name: &str) -> String {
        join_path(&self.entry_status_dir(name, "active"), &self.replica)
    }

    /// Execution status written by this replica's commit.
    pub fn entry_finished(&self, name: &str) -> String {
        join_path(&self.entry_status_dir(name, "finished"), &self.replica)
    }

    /// Created once this replica applied the entry.
    pub fn entry_synced(&self, name: &str) -> String {
        join_path(&self.entry_status_dir(name, "synced"), &self.replica)
    }

    /// Namespace of the transient numbering nodes.
    pub fn counter_dir(&self) -> String {
        join_path(&self.root, "counter")
    }

    /// Prefix handed to sequential creates under `counter/`.
    pub fn counter_prefix(&self) -> String {
        join_path(&self.counter_dir(), COUNTER_PREFIX)
    }

    /// Short-lived ephemeral lock taken while a number is allocated.
    pub fn counter_lock(&self) -> String {
        join_path(&self.root, "counter_lock")
    }

    /// Highest committed entry number.
    pub fn max_log_ptr(&self) -> String {
        join_path(&self.root, "max_log_ptr")
    }

    /// Retention window, in entries.
    pub fn logs_to_keep(&self) -> String {
        join_path(&self.root, "logs_to_keep")
    }

    /// Shared object definitions used to rebuild lost replicas.
    pub fn metadata_dir(&self) -> String {
        join_path(&self.root, "metadata")
    }

    /// Parent of every registered replica.
    pub fn replicas_dir(&self) -> String {
        join_path(&self.root, "replicas")
    }

    /// This replica's own directory.
    pub fn replica_dir(&self) -> String {
        join_path(&self.replicas_dir(), &self.replica)
    }

    /// Last entry number this replica committed.
    pub fn replica_log_ptr(&self) -> String {
        join_path(&self.replica_dir(), "log_ptr")
    }

    /// Digest of this replica's metadata as of its last commit.
    pub fn replica_digest(&self) -> String {
        join_path(&self.replica_dir(), "digest")
    }

    /// Liveness marker, ephemeral while the worker is initialized.
    pub fn replica_active(&self) -> String {
        join_path(&self.replica_dir(), "active")
    }
}
