//! Evaluation and execution of one log entry by the sequential applier.

use std::sync::Arc;
use std::time::Instant;

use tracing::{debug, info_span, trace, warn};

use crate::coordination::ephemeral::EphemeralNodeGuard;
use crate::coordination::{
    parse_number, CoordinationClient, CoordinationClientExt, CreateMode, Op,
};
use crate::error::ReplicationError;
use crate::metadata::{ExecutionContext, ExecutionStatus, PreparedChange};

use super::entry::LogEntry;
use super::recovery::refresh_unsynced_flag;
use super::state::{ApplierActivity, HandOff};
use super::task::{AbortReason, EntryState, SkipReason, Task, TaskOutcome};
use super::worker::ReplicaContext;

const MAX_LOG_PTR_RACE_RETRIES: usize = 16;

/// How the wait for the initiator ended.
#[derive(Debug, Clone, PartialEq, Eq)]
enum CommitWait {
    Committed,
    /// Our own initiator asked the applier to execute its entry.
    OwnInitialQuery(String),
    Aborted(AbortReason),
}

/// Runs admission for `entry_name` and, when admitted, executes and commits it.
///
/// Returns the outcome for final resolutions. Execution failures of entries
/// published by other replicas are returned as errors so the main loop retries.
pub(crate) fn process_entry(
    ctx: &ReplicaContext,
    entry_name: &str,
) -> Result<TaskOutcome, ReplicationError> {
    let mut task = Task::new(entry_name)?;
    ctx.state.advance_cursor(entry_name);

    let log_ptr = ctx.state.log_ptr();
    if task.number <= log_ptr {
        let outcome = TaskOutcome::Skipped(SkipReason::AlreadyApplied { log_ptr });
        task.resolve(&outcome)?;
        return Ok(outcome);
    }

    refresh_unsynced_flag(ctx)?;

    let client = ctx.client();
    let entry_path = ctx.paths.entry(entry_name);
    let payload = client.get(&entry_path)?;
    let entry = LogEntry::from_payload(&entry_path, &payload)?;

    let (trace_id, parent_span_id) = entry
        .tracing_context
        .as_ref()
        .map(|context| (context.trace_id.as_str(), context.span_id.as_str()))
        .unwrap_or_default();
    let span = info_span!("ddl_entry", entry = %entry_name, trace_id, parent_span_id);
    let _entered = span.enter();

    task.entry = Some(entry.clone());
    task.transition(EntryState::AwaitingCommit)?;

    let outcome = match await_commit(ctx, client.as_ref(), &task, &entry)? {
        CommitWait::Aborted(reason) => TaskOutcome::Aborted(reason),
        CommitWait::OwnInitialQuery(query_id) => {
            task.is_initial_query = true;
            let result = execute_and_commit(ctx, &client, &mut task, &entry);
            let verdict = match &result {
                Ok(outcome) => outcome.clone(),
                Err(err) => TaskOutcome::Failed {
                    code: -1,
                    message: err.to_string(),
                },
            };
            ctx.state.complete_initial_query(&query_id, verdict);
            let outcome = result?;
            if !outcome.is_applied() {
                // The initiator rolls back; `/try` vanishes and the next pass aborts the entry.
                debug!(entry = %entry_name, %outcome, "initial query was not applied");
                return Ok(outcome);
            }
            outcome
        }
        CommitWait::Committed => admit_committed(ctx, &client, &mut task, &entry)?,
    };
    task.resolve(&outcome)?;
    Ok(outcome)
}

fn admit_committed(
    ctx: &ReplicaContext,
    client: &Arc<dyn CoordinationClient>,
    task: &mut Task,
    entry: &LogEntry,
) -> Result<TaskOutcome, ReplicationError> {
    if entry.is_topology_refresh() {
        ctx.metadata.refresh_cluster_topology(client.as_ref())?;
        return Ok(TaskOutcome::Skipped(SkipReason::TopologyRefresh));
    }
    if client.node_exists(&ctx.paths.entry_finished(&task.name))? {
        return Ok(TaskOutcome::Skipped(SkipReason::AlreadyFinished));
    }
    if let Some(reference) = &entry.parent {
        if !ctx.metadata.parent_exists(reference) {
            return Ok(TaskOutcome::Aborted(AbortReason::ReferenceGone {
                reference: reference.clone(),
            }));
        }
    }
    match execute_and_commit(ctx, client, task, entry)? {
        TaskOutcome::Failed { message, .. } => Err(ReplicationError::ExecutionFailed {
            entry: task.name.clone(),
            message,
        }),
        outcome => Ok(outcome),
    }
}

/// Waits until the entry is committed, rolled back, or handed to us by our initiator.
fn await_commit(
    ctx: &ReplicaContext,
    client: &dyn CoordinationClient,
    task: &Task,
    entry: &LogEntry,
) -> Result<CommitWait, ReplicationError> {
    let try_path = ctx.paths.entry_try(&task.name);
    let committed_path = ctx.paths.entry_committed(&task.name);
    let timeout = ctx.settings.wait_entry_committed_timeout();
    let poll = ctx.settings.commit_poll_interval();
    let deadline = Instant::now() + timeout;

    loop {
        // Committed-mode entries never had `/try`; do not leave a watch behind on them.
        if !client.node_exists(&try_path)? {
            break;
        }
        let (initiator, watch) = client.watch_data(&try_path)?;
        let Some(initiator) = initiator else {
            break;
        };

        if initiator == ctx.full_name {
            if let Some(query_id) = entry.initial_query_id.as_deref() {
                match ctx
                    .state
                    .hand_off_initial_query(query_id, &task.name, deadline, poll)
                {
                    HandOff::Proceed => {
                        return Ok(CommitWait::OwnInitialQuery(query_id.to_string()))
                    }
                    HandOff::Stopped => return Err(ReplicationError::ReplicationStopped),
                    HandOff::NotRegistered | HandOff::Abandoned | HandOff::TimedOut => {}
                }
            }
        }

        trace!(entry = %task.name, %initiator, "waiting for initiator to commit or roll back");
        let mut fired = false;
        while !fired {
            if watch.wait_timeout(poll).is_some() {
                fired = true;
                continue;
            }
            if ctx.state.is_stopped() {
                return Err(ReplicationError::ReplicationStopped);
            }
            if Instant::now() >= deadline {
                // Several replicas (and the initiator) may race to remove it.
                client.try_remove(&try_path)?;
                if !client.node_exists(&committed_path)? {
                    warn!(entry = %task.name, "entry was forcefully cancelled due to commit timeout");
                    return Ok(CommitWait::Aborted(AbortReason::CommitTimeout));
                }
                fired = true;
            }
        }
    }

    if client.node_exists(&committed_path)? {
        Ok(CommitWait::Committed)
    } else {
        Ok(CommitWait::Aborted(AbortReason::NotCommitted))
    }
}

/// Creates `active/<replica>`, replacing a leftover from a previous session.
fn acquire_active_node(
    ctx: &ReplicaContext,
    client: &Arc<dyn CoordinationClient>,
    path: &str,
) -> Result<EphemeralNodeGuard, ReplicationError> {
    match EphemeralNodeGuard::create(client.clone(), path, &ctx.identity.host_id) {
        Ok(guard) => Ok(guard),
        Err(err) if err.is_node_exists() => {
            let host_id = ctx.identity.host_id.as_str();
            client.delete_ephemeral_if_content_matches(path, |content| content == host_id)?;
            Ok(EphemeralNodeGuard::create(client.clone(), path, host_id)?)
        }
        Err(err) => Err(err.into()),
    }
}

fn execute_and_commit(
    ctx: &ReplicaContext,
    client: &Arc<dyn CoordinationClient>,
    task: &mut Task,
    entry: &LogEntry,
) -> Result<TaskOutcome, ReplicationError> {
    let active_path = ctx.paths.entry_active(&task.name);
    let mut active = acquire_active_node(ctx, client, &active_path)?;
    task.transition(EntryState::Executing)?;

    debug!(entry = %task.name, statement = %entry.statement, initial = task.is_initial_query, "executing entry");
    let exec_ctx = ExecutionContext {
        entry_name: &task.name,
        entry_number: task.number,
        entry,
        is_initial_query: task.is_initial_query,
        database_root: ctx.paths.root(),
    };
    let change = match ctx.executor.prepare(&exec_ctx) {
        Ok(change) => change,
        Err(failure) => {
            let status = ExecutionStatus::from(&failure);
            warn!(entry = %task.name, error = %failure, "entry was not executed successfully");
            task.status = Some(status.clone());
            return Ok(TaskOutcome::Failed {
                code: status.code,
                message: status.message,
            });
        }
    };
    task.status = Some(ExecutionStatus::success());

    // Local metadata changes only after the entry is durably committed.
    commit(ctx, client.as_ref(), task, &change)?;
    active.set_already_removed();
    ctx.executor.apply(&exec_ctx, &change).map_err(|failure| {
        ReplicationError::LogicalInconsistency(format!(
            "{} was committed but could not be applied locally: {failure}",
            task.name
        ))
    })?;
    task.was_executed = true;

    client.try_create(&ctx.paths.entry_synced(&task.name), "", CreateMode::Persistent)?;
    ctx.state.advance_log_ptr(task.number);
    ctx.state.reset_failures();
    debug!(entry = %task.name, log_ptr = task.number, "entry applied");
    Ok(TaskOutcome::Applied)
}

/// Persists the execution result, the new log pointer and digest in one transaction.
fn commit(
    ctx: &ReplicaContext,
    client: &dyn CoordinationClient,
    task: &Task,
    change: &PreparedChange,
) -> Result<(), ReplicationError> {
    let paths = &ctx.paths;
    let status = task.status.clone().unwrap_or_else(ExecutionStatus::success);
    let mut base = change.ops.clone();
    base.push(Op::set(paths.replica_log_ptr(), task.number.to_string()));
    base.push(Op::set(paths.replica_digest(), change.digest.to_string()));
    base.push(Op::remove(paths.entry_active(&task.name)));
    base.push(Op::create(
        paths.entry_finished(&task.name),
        status.to_json(),
        CreateMode::Persistent,
    ));
    if !task.is_initial_query {
        client.multi(&base)?;
        return Ok(());
    }

    base.push(Op::remove(paths.entry_try(&task.name)));
    base.push(Op::create(
        paths.entry_committed(&task.name),
        ctx.full_name.as_str(),
        CreateMode::Persistent,
    ));
    let max_log_ptr_path = paths.max_log_ptr();
    for _ in 0..MAX_LOG_PTR_RACE_RETRIES {
        let (current, stat) = client.get_with_stat(&max_log_ptr_path)?;
        let current = parse_number(&max_log_ptr_path, &current)?;
        let mut ops = base.clone();
        let raise_index = ops.len();
        ops.push(Op::set_versioned(
            max_log_ptr_path.clone(),
            current.max(task.number).to_string(),
            stat.version,
        ));
        match client.multi(&ops) {
            Ok(_) => return Ok(()),
            Err(err) if err.failed_op() == Some(raise_index) && err.is_bad_version() => {
                trace!(entry = %task.name, "max_log_ptr changed concurrently, retrying commit");
            }
            Err(err) => return Err(err.into()),
        }
    }
    Err(ReplicationError::LogicalInconsistency(format!(
        "could not raise max_log_ptr for {} after {MAX_LOG_PTR_RACE_RETRIES} attempts",
        task.name
    )))
}

/// Records an outcome in the activity log and moves the in-memory pointer.
pub(crate) fn finish_entry(ctx: &ReplicaContext, entry_name: &str, number: u64, outcome: TaskOutcome) {
    if outcome.is_final() {
        ctx.state.advance_log_ptr(number);
    }
    debug!(entry = %entry_name, %outcome, "entry processed");
    ctx.state.record(ApplierActivity::Processed {
        entry: entry_name.to_string(),
        outcome,
    });
}
