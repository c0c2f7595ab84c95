//! Per-replica worker: the sequential applier thread, the queue cleanup
//! thread and the public entry points used by initiators.

use std::sync::{Arc, Mutex};
use std::thread;
use std::time::{Duration, Instant};

use tracing::{debug, error, info, warn};

use crate::cancellation::CancellationToken;
use crate::config::{ReplicaIdentity, ReplicationSettings};
use crate::coordination::ephemeral::EphemeralNodeGuard;
use crate::coordination::{
    parse_number, CoordinationClient, CoordinationClientExt, CoordinationError, Op,
    SessionFactory, Watch, WatchEvent,
};
use crate::error::ReplicationError;
use crate::metadata::{ReplicatedMetadata, StatementExecutor};

use super::admission::{finish_entry, process_entry};
use super::cleanup::cleanup_queue;
use super::enqueue::{enqueue_entry, EnqueueMode};
use super::entry::LogEntry;
use super::initiator::enqueue_and_execute;
use super::paths::{entry_name, parse_entry_number, DatabasePaths};
use super::recovery::{initialize_replication, invalidate_digest};
use super::state::{ApplierActivity, ApplierActivityLog, ApplierState};

/// Everything the worker threads and initiator calls share for one replica.
pub(crate) struct ReplicaContext {
    pub(crate) identity: ReplicaIdentity,
    pub(crate) full_name: String,
    pub(crate) settings: ReplicationSettings,
    pub(crate) paths: DatabasePaths,
    pub(crate) metadata: Arc<dyn ReplicatedMetadata>,
    pub(crate) executor: Arc<dyn StatementExecutor>,
    pub(crate) state: Arc<ApplierState>,
    /// Liveness marker `replicas/<r>/active`, owned while initialized.
    pub(crate) active_marker: Mutex<Option<EphemeralNodeGuard>>,
    sessions: Arc<dyn SessionFactory>,
    client: Mutex<Arc<dyn CoordinationClient>>,
}

impl ReplicaContext {
    /// Current session; may be expired until the main loop reconnects.
    pub(crate) fn client(&self) -> Arc<dyn CoordinationClient> {
        self.client.lock().unwrap().clone()
    }

    /// Returns a live session, opening a new one if the current session expired.
    pub(crate) fn live_client(&self) -> Result<Arc<dyn CoordinationClient>, ReplicationError> {
        let mut client = self.client.lock().unwrap();
        if client.is_expired() {
            let fresh = self.sessions.connect()?;
            info!(
                replica = %self.full_name,
                session_id = fresh.session_id(),
                "reconnected to coordination service"
            );
            self.state.record(ApplierActivity::Reconnected {
                session_id: fresh.session_id(),
            });
            *client = fresh;
        }
        Ok(client.clone())
    }
}

/// Replicated DDL worker of one replica.
///
/// One thread applies log entries strictly in order; a second thread trims
/// entries that every replica has passed. Initiators call
/// [`ReplicatedDdlWorker::enqueue_and_execute`] from any thread.
pub struct ReplicatedDdlWorker {
    ctx: Arc<ReplicaContext>,
    threads: Mutex<Vec<thread::JoinHandle<()>>>,
}

impl ReplicatedDdlWorker {
    /// Validates `settings` and opens the first coordination session.
    ///
    /// The replica must already be registered; no thread runs until [`Self::start`].
    pub fn new(
        identity: ReplicaIdentity,
        settings: ReplicationSettings,
        database_root: impl Into<String>,
        sessions: Arc<dyn SessionFactory>,
        metadata: Arc<dyn ReplicatedMetadata>,
        executor: Arc<dyn StatementExecutor>,
    ) -> Result<Self, ReplicationError> {
        settings
            .validate()
            .map_err(|err| ReplicationError::InvalidSettings(err.to_string()))?;
        let client = sessions.connect()?;
        let full_name = identity.full_name();
        let paths = DatabasePaths::new(database_root, full_name.clone());
        let ctx = ReplicaContext {
            identity,
            full_name,
            settings,
            paths,
            metadata,
            executor,
            state: Arc::new(ApplierState::new()),
            active_marker: Mutex::new(None),
            sessions,
            client: Mutex::new(client),
        };
        Ok(Self {
            ctx: Arc::new(ctx),
            threads: Mutex::new(Vec::new()),
        })
    }

    /// Spawns the applier and cleanup threads. Calling it twice is a no-op.
    pub fn start(&self) -> Result<(), ReplicationError> {
        let mut threads = self.threads.lock().unwrap();
        if !threads.is_empty() {
            return Ok(());
        }
        threads.push(self.spawn_thread("ddl_worker", run_main_thread)?);
        match self.spawn_thread("ddl_cleanup", run_cleanup_thread) {
            Ok(handle) => threads.push(handle),
            Err(err) => {
                self.ctx.state.request_stop();
                for handle in threads.drain(..) {
                    let _ = handle.join();
                }
                return Err(err);
            }
        }
        info!(replica = %self.ctx.full_name, root = %self.ctx.paths.root(), "started replicated DDL worker");
        Ok(())
    }

    fn spawn_thread(
        &self,
        role: &str,
        body: fn(&ReplicaContext),
    ) -> Result<thread::JoinHandle<()>, ReplicationError> {
        let name = format!("{role}_{}", self.ctx.identity.replica);
        let ctx = Arc::clone(&self.ctx);
        thread::Builder::new()
            .name(name.clone())
            .spawn(move || body(&ctx))
            .map_err(|err| ReplicationError::ThreadSpawn {
                name,
                reason: err.to_string(),
            })
    }

    /// Stops both threads, releases waiting initiators and drops the liveness marker.
    pub fn shutdown(&self) {
        self.ctx.state.request_stop();
        self.ctx.state.abandon_initial_queries();
        let handles: Vec<_> = self.threads.lock().unwrap().drain(..).collect();
        for handle in handles {
            let _ = handle.join();
        }
        let marker = self.ctx.active_marker.lock().unwrap().take();
        drop(marker);
    }

    /// Database, shard, replica and host this worker runs as.
    pub fn identity(&self) -> &ReplicaIdentity {
        &self.ctx.identity
    }

    /// Node layout seen from this replica.
    pub fn paths(&self) -> &DatabasePaths {
        &self.ctx.paths
    }

    /// Validated settings the worker was built with.
    pub fn settings(&self) -> &ReplicationSettings {
        &self.ctx.settings
    }

    /// Coordination session currently used by the worker.
    pub fn client(&self) -> Arc<dyn CoordinationClient> {
        self.ctx.client()
    }

    /// Last entry number applied or explicitly skipped.
    pub fn log_pointer(&self) -> u64 {
        self.ctx.state.log_ptr()
    }

    /// Entry the applier is currently evaluating.
    pub fn current_task(&self) -> String {
        self.ctx.state.current_task()
    }

    /// True while the applier is past initialization and processing the log.
    pub fn is_initialized(&self) -> bool {
        self.ctx.state.is_initialized()
    }

    /// True while the liveness marker carries the unsynced suffix.
    pub fn is_unsynced_after_recovery(&self) -> bool {
        self.ctx.state.is_unsynced_after_recovery()
    }

    /// Identical failures in a row, reset by the next successful apply.
    pub fn consecutive_failures(&self) -> u64 {
        self.ctx.state.consecutive_failures()
    }

    /// Error that stopped the worker for good, if any.
    pub fn fatal_error(&self) -> Option<String> {
        self.ctx.state.fatal_error()
    }

    /// Shared handle to the applier's recent activity.
    pub fn activity_log(&self) -> ApplierActivityLog {
        self.ctx.state.activity_log()
    }

    /// Shared applier state, for waiting on the cursor from outside.
    pub fn state(&self) -> Arc<ApplierState> {
        self.ctx.state.clone()
    }

    /// Publishes an entry without waiting for it to apply.
    pub fn enqueue_query(
        &self,
        mut entry: LogEntry,
        mode: EnqueueMode,
        extra_ops: &[Op],
    ) -> Result<String, ReplicationError> {
        let client = self.ctx.client();
        if entry.initiator.is_empty() {
            entry.initiator = self.ctx.full_name.clone();
        }
        enqueue_entry(
            client.as_ref(),
            &self.ctx.paths,
            &entry,
            mode,
            extra_ops,
            &self.ctx.settings,
        )
    }

    /// Submits a statement through this replica and waits for it to apply here.
    ///
    /// Uses the configured initial-query timeout.
    pub fn enqueue_and_execute(
        &self,
        entry: LogEntry,
        cancellation: &CancellationToken,
    ) -> Result<String, ReplicationError> {
        let timeout = self.ctx.settings.initial_query_timeout();
        self.enqueue_and_execute_with_timeout(entry, timeout, cancellation)
    }

    /// Like [`Self::enqueue_and_execute`], waiting at most `timeout` for the
    /// applier to reach the entry.
    pub fn enqueue_and_execute_with_timeout(
        &self,
        entry: LogEntry,
        timeout: Duration,
        cancellation: &CancellationToken,
    ) -> Result<String, ReplicationError> {
        if let Some(message) = self.ctx.state.fatal_error() {
            warn!(error = %message, "rejecting query, worker stopped after a fatal error");
            return Err(ReplicationError::ReplicationStopped);
        }
        enqueue_and_execute(&self.ctx, entry, timeout, cancellation)
    }

    /// Waits until the persisted log pointer reaches `max_log_ptr`.
    ///
    /// Returns `Ok(true)` at once when the replica is already caught up.
    pub fn wait_for_replica_to_process_all_entries(
        &self,
        timeout: Duration,
    ) -> Result<bool, ReplicationError> {
        let client = self.ctx.client();
        let log_ptr_path = self.ctx.paths.replica_log_ptr();
        let our_log_ptr = client.get_number(&log_ptr_path)?;
        let max_log_ptr = client.get_number(&self.ctx.paths.max_log_ptr())?;
        if our_log_ptr == max_log_ptr {
            return Ok(true);
        }

        let deadline = Instant::now() + timeout;
        let max_log = entry_name(max_log_ptr);
        {
            let poll = self.ctx.settings.queue_poll_interval();
            let mut cursor = self.ctx.state.lock_cursor();
            debug!(
                max_log = %max_log,
                current_task = %cursor.current_task,
                "waiting for worker thread to process all entries"
            );
            loop {
                if client.is_expired() {
                    return Err(ReplicationError::SessionExpired {
                        context: format!("waiting for the worker to reach {max_log}"),
                    });
                }
                if self.ctx.state.is_stopped() {
                    return Err(ReplicationError::ReplicationStopped);
                }
                if cursor.current_task >= max_log {
                    break;
                }
                let now = Instant::now();
                if now >= deadline {
                    return Ok(false);
                }
                cursor = self.ctx.state.wait_cursor(cursor, poll.min(deadline - now));
            }
        }

        loop {
            let (data, watch) = client.watch_data(&log_ptr_path)?;
            let reached = match data {
                Some(data) => parse_number(&log_ptr_path, &data)? >= max_log_ptr,
                None => false,
            };
            if reached {
                return Ok(true);
            }
            let now = Instant::now();
            if now >= deadline || watch.wait_timeout(deadline - now).is_none() {
                return Ok(false);
            }
        }
    }
}

impl Drop for ReplicatedDdlWorker {
    fn drop(&mut self) {
        self.shutdown();
    }
}

impl std::fmt::Debug for ReplicatedDdlWorker {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ReplicatedDdlWorker")
            .field("replica", &self.ctx.full_name)
            .field("root", &self.ctx.paths.root())
            .field("log_ptr", &self.ctx.state.log_ptr())
            .finish()
    }
}

/// Retries initialization until it succeeds, the worker stops, or a fatal error occurs.
fn initialize_main_thread(ctx: &ReplicaContext) -> bool {
    while !ctx.state.is_stopped() {
        let attempt = ctx.live_client().and_then(|_| {
            let max_retries = ctx.settings.max_retries_before_automatic_recovery;
            let failures = ctx.state.consecutive_failures();
            if max_retries > 0 && failures >= max_retries {
                invalidate_digest(ctx, failures)?;
                ctx.state.reset_failures();
            }
            initialize_replication(ctx)
        });
        match attempt {
            Ok(report) => {
                info!(
                    log_ptr = report.log_ptr,
                    max_log_ptr = report.max_log_ptr,
                    lost = ?report.lost,
                    unsynced = report.unsynced,
                    "replication initialized"
                );
                ctx.state.set_initialized(true);
                return true;
            }
            Err(err) if err.is_logical_inconsistency() => {
                error!(error = %err, "fatal error during initialization, stopping replication");
                ctx.state.set_fatal_error(err.to_string());
                ctx.state.request_stop();
                ctx.state.abandon_initial_queries();
                return false;
            }
            Err(err) => {
                warn!(error = %err, "error on initialization, retrying");
                let backoff = if err.is_session_error() {
                    ctx.settings.session_retry_backoff()
                } else {
                    ctx.settings.recovery_retry_backoff()
                };
                ctx.state.sleep_unless_stopped(backoff);
            }
        }
    }
    false
}

/// Evaluates every entry above the log pointer, in order.
///
/// Stops early when an entry is left unresolved so the next pass retries it
/// before anything that follows.
fn schedule_tasks(ctx: &ReplicaContext) -> Result<Watch, ReplicationError> {
    let client = ctx.client();
    let (mut names, watch) = client.watch_children(&ctx.paths.log_dir())?;
    names.sort();
    let log_ptr = ctx.state.log_ptr();
    for name in names {
        if ctx.state.is_stopped() {
            break;
        }
        let Some(number) = parse_entry_number(&name) else {
            continue;
        };
        if number <= log_ptr {
            continue;
        }
        let outcome = process_entry(ctx, &name)?;
        let unresolved = !outcome.is_final();
        finish_entry(ctx, &name, number, outcome);
        if unresolved {
            // Re-arm immediately so the rollback is observed on the next pass.
            let retry = Watch::new();
            retry.trigger(WatchEvent::ChildrenChanged);
            return Ok(retry);
        }
    }
    Ok(watch)
}

fn handle_error(ctx: &ReplicaContext, err: ReplicationError) {
    if err.is_session_error() {
        warn!(error = %err, "coordination session error, reinitializing");
        ctx.state.set_initialized(false);
        ctx.state.sleep_unless_stopped(ctx.settings.session_retry_backoff());
        return;
    }
    if matches!(err, ReplicationError::Coordination(_)) {
        error!(error = %err, "unexpected coordination error, restarting main thread");
        ctx.state.set_initialized(false);
        return;
    }
    if matches!(err, ReplicationError::ReplicationStopped) && ctx.state.is_stopped() {
        return;
    }
    let message = err.to_string();
    let consecutive = ctx.state.record_failure(&message);
    ctx.state.record(ApplierActivity::Failure {
        message: message.clone(),
        consecutive,
    });
    if err.is_logical_inconsistency() {
        error!(error = %message, consecutive, "logical inconsistency while processing queue");
    } else {
        error!(error = %message, consecutive, "unexpected error, will retry");
    }
    ctx.state.sleep_unless_stopped(ctx.settings.error_retry_backoff());
    ctx.state.set_initialized(false);
}

fn run_main_thread(ctx: &ReplicaContext) {
    debug!(replica = %ctx.full_name, "started main thread");
    while !ctx.state.is_stopped() {
        if !ctx.state.is_initialized() && !initialize_main_thread(ctx) {
            break;
        }
        match schedule_tasks(ctx) {
            Ok(queue_updated) => {
                queue_updated.wait_timeout(ctx.settings.queue_poll_interval());
            }
            Err(err) => handle_error(ctx, err),
        }
    }
    ctx.state.abandon_initial_queries();
    debug!(replica = %ctx.full_name, "main thread stopped");
}

fn run_cleanup_thread(ctx: &ReplicaContext) {
    while !ctx.state.is_stopped() {
        ctx.state.sleep_unless_stopped(ctx.settings.cleanup_interval());
        if ctx.state.is_stopped() || !ctx.state.is_initialized() {
            continue;
        }
        let client = ctx.client();
        match cleanup_queue(client.as_ref(), &ctx.paths) {
            Ok(removed) if removed > 0 => {
                ctx.state.record(ApplierActivity::CleanedUp { removed });
            }
            Ok(_) => {}
            Err(err) => {
                if !matches!(&err, ReplicationError::Coordination(CoordinationError::SessionExpired)) {
                    warn!(error = %err, "queue cleanup failed");
                }
            }
        }
    }
}
