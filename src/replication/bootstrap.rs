//! Database creation and replica registration.

use tracing::info;

use crate::config::{ReplicaIdentity, ReplicationSettings};
use crate::coordination::{CoordinationClient, CoordinationClientExt, CreateMode, Op};
use crate::error::ReplicationError;
use crate::metadata::ReplicatedMetadata;

use super::enqueue::{enqueue_entry, EnqueueMode};
use super::entry::LogEntry;
use super::paths::DatabasePaths;

/// Sequential numbers consumed before the first real entry, so entries start above
/// the initial `max_log_ptr` of 1.
const PRIMED_COUNTER_NODES: usize = 2;

/// Creates the shared layout of a database. Returns `false` if it already existed.
pub fn create_database(
    client: &dyn CoordinationClient,
    root: &str,
    settings: &ReplicationSettings,
) -> Result<bool, ReplicationError> {
    let paths = DatabasePaths::new(root, "");
    client.create_ancestors(paths.root())?;
    let ops = vec![
        Op::create(paths.root(), "", CreateMode::Persistent),
        Op::create(paths.log_dir(), "", CreateMode::Persistent),
        Op::create(paths.replicas_dir(), "", CreateMode::Persistent),
        Op::create(paths.counter_dir(), "", CreateMode::Persistent),
        Op::create(paths.metadata_dir(), "", CreateMode::Persistent),
        Op::create(paths.max_log_ptr(), "1", CreateMode::Persistent),
        Op::create(
            paths.logs_to_keep(),
            settings.logs_to_keep.to_string(),
            CreateMode::Persistent,
        ),
    ];
    match client.multi(&ops) {
        Ok(_) => {}
        Err(err) if err.failed_op() == Some(0) && err.is_node_exists() => return Ok(false),
        Err(err) => return Err(err.into()),
    }
    for _ in 0..PRIMED_COUNTER_NODES {
        let path = client.create(&paths.counter_prefix(), "", CreateMode::PersistentSequential)?;
        client.remove(&path, None)?;
    }
    info!(root = %paths.root(), logs_to_keep = settings.logs_to_keep, "created replicated database");
    Ok(true)
}

/// Registers a replica and announces it with a topology-refresh entry.
///
/// Returns the path of the announcement, or `None` if the replica was already
/// registered by this host.
pub fn register_replica(
    client: &dyn CoordinationClient,
    root: &str,
    identity: &ReplicaIdentity,
    metadata: &dyn ReplicatedMetadata,
    settings: &ReplicationSettings,
) -> Result<Option<String>, ReplicationError> {
    let paths = DatabasePaths::new(root, identity.full_name());
    if let Some(host_id) = client.try_get(&paths.replica_dir())? {
        if host_id == identity.host_id {
            return Ok(None);
        }
        return Err(ReplicationError::LogicalInconsistency(format!(
            "replica {} is already registered by host {host_id}",
            identity.full_name()
        )));
    }
    let register_ops = [
        Op::create(paths.replica_dir(), identity.host_id.as_str(), CreateMode::Persistent),
        Op::create(paths.replica_log_ptr(), "0", CreateMode::Persistent),
        Op::create(
            paths.replica_digest(),
            metadata.local_digest().to_string(),
            CreateMode::Persistent,
        ),
    ];
    let announcement = LogEntry::topology_refresh(identity.full_name());
    let entry_path = enqueue_entry(
        client,
        &paths,
        &announcement,
        EnqueueMode::Committed,
        &register_ops,
        settings,
    )?;
    info!(replica = %identity.full_name(), entry = %entry_path, "registered replica");
    Ok(Some(entry_path))
}
