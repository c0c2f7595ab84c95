//! Publishing entries into the shared log.
//!
//! Numbering and entry creation happen in two transactions. The first takes
//! the short-lived `counter_lock` and creates a sequential node under
//! `counter/`; its suffix becomes the entry number. The second creates the
//! entry with its status directories and drops both transient nodes.

use std::thread;

use tracing::{debug, trace};

use crate::config::ReplicationSettings;
use crate::coordination::{CoordinationClient, CreateMode, Op};
use crate::error::ReplicationError;

use super::entry::LogEntry;
use super::paths::{DatabasePaths, ENTRY_PREFIX};

/// How the published entry starts its life.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum EnqueueMode {
    /// `/committed` is written immediately (administrative entries).
    Committed,
    /// `/try` is tied to the caller's session until it commits or vanishes.
    Tentative,
}

/// Appends `entry` to the log and returns the full path of the new entry.
///
/// `extra_ops` run atomically with number allocation, so their checks (for
/// example "the source object still exists") gate the whole enqueue.
pub fn enqueue_entry(
    client: &dyn CoordinationClient,
    paths: &DatabasePaths,
    entry: &LogEntry,
    mode: EnqueueMode,
    extra_ops: &[Op],
    settings: &ReplicationSettings,
) -> Result<String, ReplicationError> {
    let counter_path = allocate_counter(client, paths, extra_ops, settings)?;
    let counter_prefix = paths.counter_prefix();
    let suffix = counter_path
        .strip_prefix(&counter_prefix)
        .ok_or_else(|| {
            ReplicationError::LogicalInconsistency(format!(
                "sequential node {counter_path} does not start with {counter_prefix}"
            ))
        })?;
    let entry_path = paths.entry(&format!("{ENTRY_PREFIX}{suffix}"));

    let marker = match mode {
        EnqueueMode::Committed => Op::create(
            format!("{entry_path}/committed"),
            paths.replica_name(),
            CreateMode::Persistent,
        ),
        EnqueueMode::Tentative => Op::create(
            format!("{entry_path}/try"),
            paths.replica_name(),
            CreateMode::Ephemeral,
        ),
    };
    let ops = vec![
        Op::create(entry_path.clone(), entry.to_payload(), CreateMode::Persistent),
        marker,
        Op::remove(counter_path),
        Op::remove(paths.counter_lock()),
        Op::create(format!("{entry_path}/active"), "", CreateMode::Persistent),
        Op::create(format!("{entry_path}/finished"), "", CreateMode::Persistent),
        Op::create(format!("{entry_path}/synced"), "", CreateMode::Persistent),
    ];
    client.multi(&ops)?;
    debug!(entry = %entry_path, ?mode, "enqueued log entry");
    Ok(entry_path)
}

fn allocate_counter(
    client: &dyn CoordinationClient,
    paths: &DatabasePaths,
    extra_ops: &[Op],
    settings: &ReplicationSettings,
) -> Result<String, ReplicationError> {
    let mut ops = Vec::with_capacity(extra_ops.len() + 2);
    ops.push(Op::create(
        paths.counter_lock(),
        paths.replica_name(),
        CreateMode::Ephemeral,
    ));
    ops.push(Op::create(
        paths.counter_prefix(),
        "",
        CreateMode::EphemeralSequential,
    ));
    ops.extend_from_slice(extra_ops);

    let attempts = settings.enqueue_max_attempts;
    for attempt in 1..=attempts {
        match client.multi(&ops) {
            Ok(results) => {
                return results
                    .get(1)
                    .and_then(|result| result.created_path())
                    .map(str::to_string)
                    .ok_or_else(|| {
                        ReplicationError::LogicalInconsistency(
                            "counter allocation returned no sequential path".to_string(),
                        )
                    });
            }
            Err(err) if err.failed_op() == Some(0) && err.is_node_exists() => {
                trace!(attempt, "counter lock is held, retrying");
                if attempt < attempts {
                    thread::sleep(settings.enqueue_retry_backoff());
                }
            }
            Err(err) => return Err(err.into()),
        }
    }
    Err(ReplicationError::EnqueueContention { attempts })
}
