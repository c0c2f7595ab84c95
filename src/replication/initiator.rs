//! Path taken by the replica that originates a statement.
//!
//! The initiator publishes a tentative entry and then blocks until its own
//! applier reaches it. The applier stays the only executor: once it reaches
//! the entry it hands control back, the initiator checks the parent reference
//! and either lets the applier execute and commit, or walks away so `/try`
//! disappears and every replica aborts the entry.

use std::sync::Arc;
use std::time::{Duration, Instant};

use tracing::{debug, trace};

use crate::cancellation::CancellationToken;
use crate::coordination::ephemeral::EphemeralNodeGuard;
use crate::coordination::{CoordinationClient, CoordinationClientExt};
use crate::error::ReplicationError;

use super::enqueue::{enqueue_entry, EnqueueMode};
use super::entry::{generate_id, LogEntry, TraceContext};
use super::paths::{parse_entry_number, ENTRY_PREFIX};
use super::state::{ApplierState, InitialQueryState};
use super::task::TaskOutcome;
use super::worker::ReplicaContext;

/// Removes the initial-query slot on every exit path.
struct SlotRegistration<'a> {
    state: &'a ApplierState,
    query_id: String,
}

impl<'a> SlotRegistration<'a> {
    fn new(state: &'a ApplierState, query_id: String) -> Self {
        state.register_initial_query(&query_id);
        Self { state, query_id }
    }
}

impl Drop for SlotRegistration<'_> {
    fn drop(&mut self) {
        self.state.unregister_initial_query(&self.query_id);
    }
}

/// Fails fast when this replica is too far behind to accept new statements.
pub(crate) fn check_replication_lag(
    ctx: &ReplicaContext,
    client: &dyn CoordinationClient,
) -> Result<(), ReplicationError> {
    let log_ptr = ctx.state.log_ptr();
    let max_log_ptr = client.get_number(&ctx.paths.max_log_ptr())?;
    if log_ptr.saturating_add(ctx.settings.max_replication_lag_to_enqueue) < max_log_ptr {
        return Err(ReplicationError::ReplicationLagTooHigh {
            log_ptr,
            max_log_ptr,
            lag: max_log_ptr - log_ptr,
        });
    }
    Ok(())
}

/// Publishes `entry`, waits for the local applier to execute it and returns
/// the entry path.
pub(crate) fn enqueue_and_execute(
    ctx: &ReplicaContext,
    mut entry: LogEntry,
    timeout: Duration,
    cancellation: &CancellationToken,
) -> Result<String, ReplicationError> {
    if ctx.state.is_stopped() {
        return Err(ReplicationError::ReplicationStopped);
    }
    let client = ctx.client();
    check_replication_lag(ctx, client.as_ref())?;

    let query_id = generate_id(&ctx.full_name, 16);
    entry.initiator = ctx.full_name.clone();
    entry.initial_query_id = Some(query_id.clone());
    if entry.tracing_context.is_none() {
        entry.tracing_context = Some(TraceContext::new_root(&ctx.full_name));
    }

    let _slot = SlotRegistration::new(&ctx.state, query_id.clone());
    let entry_path = enqueue_entry(
        client.as_ref(),
        &ctx.paths,
        &entry,
        EnqueueMode::Tentative,
        &[],
        &ctx.settings,
    )?;
    let mut try_node = EphemeralNodeGuard::existing(client.clone(), format!("{entry_path}/try"));
    let entry_name = entry_path
        .rsplit('/')
        .next()
        .filter(|name| name.starts_with(ENTRY_PREFIX))
        .unwrap_or_default()
        .to_string();
    if parse_entry_number(&entry_name).is_none() {
        return Err(ReplicationError::LogicalInconsistency(format!(
            "enqueue returned malformed entry path {entry_path}"
        )));
    }

    let state = Arc::clone(&ctx.state);
    let registration = cancellation.on_cancel(move || state.notify_all());
    debug!(
        entry = %entry_name,
        timeout_ms = timeout.as_millis() as u64,
        "waiting for worker thread to reach entry"
    );
    let result = wait_and_execute(ctx, &client, &entry, &entry_name, &query_id, timeout, cancellation);
    drop(registration);

    let outcome = result?;
    if !outcome.is_applied() {
        return Err(ReplicationError::LogicalInconsistency(format!(
            "entry {entry_name} was processed but not executed: {outcome}"
        )));
    }
    // The commit transaction consumed `/try`.
    try_node.set_already_removed();
    Ok(entry_path)
}

fn wait_and_execute(
    ctx: &ReplicaContext,
    client: &Arc<dyn CoordinationClient>,
    entry: &LogEntry,
    entry_name: &str,
    query_id: &str,
    timeout: Duration,
    cancellation: &CancellationToken,
) -> Result<TaskOutcome, ReplicationError> {
    wait_until_reached(ctx, client.as_ref(), entry_name, query_id, timeout, cancellation)?;

    if let Some(reference) = &entry.parent {
        if !ctx.metadata.parent_exists(reference) {
            abandon(ctx, query_id);
            return Err(ReplicationError::ReferenceGone {
                entry: entry_name.to_string(),
                reference: reference.clone(),
            });
        }
    }

    {
        let mut cursor = ctx.state.lock_cursor();
        match cursor.initial_queries.get_mut(query_id) {
            Some(state @ InitialQueryState::Reached { .. }) => *state = InitialQueryState::Proceed,
            _ => {
                return Err(ReplicationError::EntryAborted {
                    entry: entry_name.to_string(),
                    reason: "the worker gave up waiting for the initiator".to_string(),
                })
            }
        }
    }
    ctx.state.notify_all();
    wait_until_finished(ctx, client.as_ref(), entry_name, query_id)
}

fn abandon(ctx: &ReplicaContext, query_id: &str) {
    {
        let mut cursor = ctx.state.lock_cursor();
        if let Some(state) = cursor.initial_queries.get_mut(query_id) {
            *state = InitialQueryState::Abandoned;
        }
    }
    ctx.state.notify_all();
}

/// Blocks until the applier reaches `entry_name` and offers it back.
fn wait_until_reached(
    ctx: &ReplicaContext,
    client: &dyn CoordinationClient,
    entry_name: &str,
    query_id: &str,
    timeout: Duration,
    cancellation: &CancellationToken,
) -> Result<(), ReplicationError> {
    let deadline = Instant::now() + timeout;
    let poll = ctx.settings.queue_poll_interval();
    let mut cursor = ctx.state.lock_cursor();
    loop {
        if client.is_expired() {
            trace!(entry = %entry_name, "coordination session expired while waiting");
            return Err(ReplicationError::SessionExpired {
                context: format!("waiting for the worker to reach {entry_name}"),
            });
        }
        if ctx.state.is_stopped() {
            trace!(entry = %entry_name, "replication stopped while waiting");
            return Err(ReplicationError::ReplicationStopped);
        }
        if cancellation.is_cancelled() {
            trace!(entry = %entry_name, "query was cancelled");
            return Err(ReplicationError::Cancelled {
                entry: entry_name.to_string(),
            });
        }
        match cursor.initial_queries.get(query_id) {
            Some(InitialQueryState::Reached { entry }) if entry == entry_name => return Ok(()),
            Some(InitialQueryState::Abandoned) | None => {
                return Err(ReplicationError::EntryAborted {
                    entry: entry_name.to_string(),
                    reason: "the worker gave up waiting for the initiator".to_string(),
                })
            }
            _ => {}
        }
        if cursor.current_task.as_str() > entry_name {
            return Err(ReplicationError::EntryAborted {
                entry: entry_name.to_string(),
                reason: format!("the worker moved past it to {}", cursor.current_task),
            });
        }
        let now = Instant::now();
        if now >= deadline {
            return Err(ReplicationError::InitialQueryTimeout {
                entry: entry_name.to_string(),
                timeout_ms: timeout.as_millis() as u64,
            });
        }
        cursor = ctx.state.wait_cursor(cursor, poll.min(deadline - now));
    }
}

/// Blocks until the applier reports the outcome of an entry it agreed to execute.
fn wait_until_finished(
    ctx: &ReplicaContext,
    client: &dyn CoordinationClient,
    entry_name: &str,
    query_id: &str,
) -> Result<TaskOutcome, ReplicationError> {
    let poll = ctx.settings.queue_poll_interval();
    let mut cursor = ctx.state.lock_cursor();
    loop {
        match cursor.initial_queries.get(query_id) {
            Some(InitialQueryState::Finished(TaskOutcome::Failed { message, .. })) => {
                return Err(ReplicationError::ExecutionFailed {
                    entry: entry_name.to_string(),
                    message: message.clone(),
                })
            }
            Some(InitialQueryState::Finished(outcome)) => return Ok(outcome.clone()),
            Some(InitialQueryState::Proceed) => {}
            _ => return Err(ReplicationError::ReplicationStopped),
        }
        if ctx.state.is_stopped() {
            return Err(ReplicationError::ReplicationStopped);
        }
        if client.is_expired() {
            return Err(ReplicationError::SessionExpired {
                context: format!("waiting for {entry_name} to execute"),
            });
        }
        cursor = ctx.state.wait_cursor(cursor, poll);
    }
}
