use tracing::{debug, trace};

use crate::coordination::{join_path, CoordinationClient, CoordinationClientExt, CoordinationError};
use crate::error::ReplicationError;

use super::paths::{parse_entry_number, DatabasePaths};

/// Removes `path` and everything below it; nodes deleted concurrently are ignored.
fn remove_recursive(client: &dyn CoordinationClient, path: &str) -> Result<(), CoordinationError> {
    let children = match client.children(path) {
        Ok(children) => children,
        Err(CoordinationError::NoNode { .. }) => return Ok(()),
        Err(err) => return Err(err),
    };
    for child in children {
        remove_recursive(client, &join_path(path, &child))?;
    }
    client.try_remove(path).map(|_| ())
}

/// Whether an entry has fallen out of the retained window.
pub fn can_remove_entry(number: u64, logs_to_keep: u64, max_log_ptr: u64) -> bool {
    number.saturating_add(logs_to_keep) < max_log_ptr
}

/// Deletes log entries every replica has passed by more than `logs_to_keep`.
///
/// An entry some replica is still executing (non-empty `active/`) is kept.
pub fn cleanup_queue(
    client: &dyn CoordinationClient,
    paths: &DatabasePaths,
) -> Result<usize, ReplicationError> {
    let max_log_ptr = client.get_number(&paths.max_log_ptr())?;
    let logs_to_keep = client.get_number(&paths.logs_to_keep())?;
    let mut removed = 0;
    for name in client.children(&paths.log_dir())? {
        let Some(number) = parse_entry_number(&name) else {
            continue;
        };
        if !can_remove_entry(number, logs_to_keep, max_log_ptr) {
            continue;
        }
        let entry_path = paths.entry(&name);
        // Removing `active` first fails while any replica holds a marker in it.
        match client.remove(&paths.entry_status_dir(&name, "active"), None) {
            Ok(()) | Err(CoordinationError::NoNode { .. }) => {}
            Err(CoordinationError::NotEmpty { .. }) => {
                trace!(entry = %name, "entry is being executed, keeping it");
                continue;
            }
            Err(err) => return Err(err.into()),
        }
        remove_recursive(client, &entry_path)?;
        removed += 1;
        trace!(entry = %name, "removed outdated entry");
    }
    if removed > 0 {
        debug!(removed, max_log_ptr, logs_to_keep, "cleaned up log queue");
    }
    Ok(removed)
}
