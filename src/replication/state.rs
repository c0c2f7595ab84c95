//! In-memory state shared by the applier thread and initiator callers.

use std::collections::{HashMap, VecDeque};
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::{Arc, Condvar, Mutex, MutexGuard};
use std::time::{Duration, Instant};

use super::recovery::LostReason;
use super::task::TaskOutcome;

const ACTIVITY_LOG_CAPACITY: usize = 1024;

/// Progress of one initial query handed from its initiator to the applier.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum InitialQueryState {
    /// Registered, entry not reached yet.
    Waiting,
    /// The applier reached `entry` and waits for the initiator's go-ahead.
    Reached { entry: String },
    /// The initiator asked the applier to execute the entry.
    Proceed,
    /// The initiator gave up, or the applier is shutting down.
    Abandoned,
    Finished(TaskOutcome),
}

/// Result of the applier offering an entry to its initiator.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum HandOff {
    Proceed,
    /// No live initiator on this replica; wait for `/try` like any other replica.
    NotRegistered,
    Abandoned,
    TimedOut,
    Stopped,
}

#[derive(Debug, Default)]
pub(crate) struct CursorState {
    /// Name of the entry the applier is evaluating (empty before the first one).
    pub(crate) current_task: String,
    pub(crate) initial_queries: HashMap<String, InitialQueryState>,
}

/// Counts consecutive failures carrying the same message.
#[derive(Debug, Default)]
struct FailureTracker {
    last_message: Option<String>,
    consecutive: u64,
}

/// Diagnostic events recorded by the worker.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ApplierActivity {
    Initialized {
        log_ptr: u64,
        lost: Option<LostReason>,
        unsynced: bool,
    },
    Processed {
        entry: String,
        outcome: TaskOutcome,
    },
    BecameSynced {
        log_ptr: u64,
    },
    DigestInvalidated {
        failures: u64,
    },
    Failure {
        message: String,
        consecutive: u64,
    },
    Reconnected {
        session_id: u64,
    },
    CleanedUp {
        removed: usize,
    },
}

/// Bounded, thread-safe record of worker activity.
#[derive(Debug, Clone)]
pub struct ApplierActivityLog {
    entries: Arc<Mutex<VecDeque<ApplierActivity>>>,
    capacity: usize,
}

impl Default for ApplierActivityLog {
    fn default() -> Self {
        Self::with_capacity(ACTIVITY_LOG_CAPACITY)
    }
}

impl ApplierActivityLog {
    /// Keeps at most `capacity` records, dropping the oldest first.
    pub fn with_capacity(capacity: usize) -> Self {
        Self {
            entries: Arc::new(Mutex::new(VecDeque::with_capacity(capacity.min(64)))),
            capacity: capacity.max(1),
        }
    }

    pub fn record(&self, activity: ApplierActivity) {
        let mut guard = self.entries.lock().unwrap();
        if guard.len() == self.capacity {
            guard.pop_front();
        }
        guard.push_back(activity);
    }

    /// Records in the order they happened.
    pub fn snapshot(&self) -> Vec<ApplierActivity> {
        self.entries.lock().unwrap().iter().cloned().collect()
    }

    /// `(entry, outcome)` pairs in processing order.
    pub fn processed(&self) -> Vec<(String, TaskOutcome)> {
        self.entries
            .lock()
            .unwrap()
            .iter()
            .filter_map(|activity| match activity {
                ApplierActivity::Processed { entry, outcome } => {
                    Some((entry.clone(), outcome.clone()))
                }
                _ => None,
            })
            .collect()
    }

    /// Latest outcome recorded for `entry`.
    pub fn outcome_of(&self, entry: &str) -> Option<TaskOutcome> {
        self.processed()
            .into_iter()
            .rev()
            .find(|(name, _)| name == entry)
            .map(|(_, outcome)| outcome)
    }
}

/// Replica progress shared between the applier and any number of initiators.
///
/// The applier is the only writer of the log pointer and the cursor. Readers
/// load the pointer without locking; cursor waiters block on the condvar.
#[derive(Debug)]
pub struct ApplierState {
    log_ptr: AtomicU64,
    logs_to_keep: AtomicU64,
    cursor: Mutex<CursorState>,
    cursor_changed: Condvar,
    stop: AtomicBool,
    initialized: AtomicBool,
    unsynced_after_recovery: AtomicBool,
    failures: Mutex<FailureTracker>,
    fatal_error: Mutex<Option<String>>,
    activity: ApplierActivityLog,
}

impl Default for ApplierState {
    fn default() -> Self {
        Self::new()
    }
}

impl ApplierState {
    pub fn new() -> Self {
        Self {
            log_ptr: AtomicU64::new(0),
            logs_to_keep: AtomicU64::new(0),
            cursor: Mutex::new(CursorState::default()),
            cursor_changed: Condvar::new(),
            stop: AtomicBool::new(false),
            initialized: AtomicBool::new(false),
            unsynced_after_recovery: AtomicBool::new(false),
            failures: Mutex::new(FailureTracker::default()),
            fatal_error: Mutex::new(None),
            activity: ApplierActivityLog::default(),
        }
    }

    /// Last entry applied or explicitly skipped; lock-free.
    pub fn log_ptr(&self) -> u64 {
        self.log_ptr.load(Ordering::Acquire)
    }

    /// Moves the pointer forward; never lowers it.
    pub(crate) fn advance_log_ptr(&self, number: u64) {
        self.log_ptr.fetch_max(number, Ordering::AcqRel);
    }

    /// Reseats the pointer during initialization.
    pub(crate) fn reset_log_ptr(&self, number: u64) {
        self.log_ptr.store(number, Ordering::Release);
    }

    /// Retention window read at the last initialization.
    pub fn logs_to_keep(&self) -> u64 {
        self.logs_to_keep.load(Ordering::Relaxed)
    }

    pub(crate) fn set_logs_to_keep(&self, value: u64) {
        self.logs_to_keep.store(value, Ordering::Relaxed);
    }

    /// Name of the entry the applier is on, empty before the first one.
    pub fn current_task(&self) -> String {
        self.cursor.lock().unwrap().current_task.clone()
    }

    /// Advances the cursor to `entry` and wakes every waiter.
    pub(crate) fn advance_cursor(&self, entry: &str) {
        let mut cursor = self.cursor.lock().unwrap();
        if cursor.current_task.as_str() < entry {
            cursor.current_task = entry.to_string();
            self.cursor_changed.notify_all();
        }
    }

    /// True once shutdown was requested or a fatal error stopped the worker.
    pub fn is_stopped(&self) -> bool {
        self.stop.load(Ordering::SeqCst)
    }

    pub(crate) fn request_stop(&self) {
        self.stop.store(true, Ordering::SeqCst);
        self.notify_all();
    }

    /// True between a successful initialization and the next reset.
    pub fn is_initialized(&self) -> bool {
        self.initialized.load(Ordering::SeqCst)
    }

    pub(crate) fn set_initialized(&self, value: bool) {
        self.initialized.store(value, Ordering::SeqCst);
        self.notify_all();
    }

    /// Set when a resync left the replica further behind than the enqueue lag.
    pub fn is_unsynced_after_recovery(&self) -> bool {
        self.unsynced_after_recovery.load(Ordering::SeqCst)
    }

    pub(crate) fn set_unsynced_after_recovery(&self, value: bool) {
        self.unsynced_after_recovery.store(value, Ordering::SeqCst);
    }

    /// Records a failure and returns how many identical failures happened in a row.
    pub(crate) fn record_failure(&self, message: &str) -> u64 {
        let mut failures = self.failures.lock().unwrap();
        if failures.last_message.as_deref() == Some(message) {
            failures.consecutive += 1;
        } else {
            failures.last_message = Some(message.to_string());
            failures.consecutive = 1;
        }
        failures.consecutive
    }

    /// Clears the failure streak after a successful apply or a forced recovery.
    pub(crate) fn reset_failures(&self) {
        let mut failures = self.failures.lock().unwrap();
        failures.consecutive = 0;
        failures.last_message = None;
    }

    /// Length of the current streak of identical failures.
    pub fn consecutive_failures(&self) -> u64 {
        self.failures.lock().unwrap().consecutive
    }

    /// Message of the most recent failure in the streak.
    pub fn last_failure(&self) -> Option<String> {
        self.failures.lock().unwrap().last_message.clone()
    }

    /// Error that stopped the worker for good.
    pub fn fatal_error(&self) -> Option<String> {
        self.fatal_error.lock().unwrap().clone()
    }

    pub(crate) fn set_fatal_error(&self, message: String) {
        *self.fatal_error.lock().unwrap() = Some(message);
    }

    /// Shared handle to the bounded activity log.
    pub fn activity_log(&self) -> ApplierActivityLog {
        self.activity.clone()
    }

    pub(crate) fn record(&self, activity: ApplierActivity) {
        self.activity.record(activity);
    }

    /// Wakes every cursor waiter so it re-evaluates its predicate.
    pub fn notify_all(&self) {
        let _cursor = self.cursor.lock().unwrap();
        self.cursor_changed.notify_all();
    }

    /// Sleeps for `duration` unless a stop is requested first.
    pub(crate) fn sleep_unless_stopped(&self, duration: Duration) {
        let deadline = Instant::now() + duration;
        let mut cursor = self.cursor.lock().unwrap();
        while !self.is_stopped() {
            let now = Instant::now();
            if now >= deadline {
                break;
            }
            cursor = self.cursor_changed.wait_timeout(cursor, deadline - now).unwrap().0;
        }
    }

    pub(crate) fn lock_cursor(&self) -> MutexGuard<'_, CursorState> {
        self.cursor.lock().unwrap()
    }

    /// Waits on the cursor condvar for at most `timeout`.
    pub(crate) fn wait_cursor<'a>(
        &self,
        guard: MutexGuard<'a, CursorState>,
        timeout: Duration,
    ) -> MutexGuard<'a, CursorState> {
        self.cursor_changed.wait_timeout(guard, timeout).unwrap().0
    }

    pub(crate) fn register_initial_query(&self, query_id: &str) {
        let mut cursor = self.cursor.lock().unwrap();
        cursor
            .initial_queries
            .insert(query_id.to_string(), InitialQueryState::Waiting);
    }

    pub(crate) fn unregister_initial_query(&self, query_id: &str) {
        let mut cursor = self.cursor.lock().unwrap();
        cursor.initial_queries.remove(query_id);
        self.cursor_changed.notify_all();
    }

    /// Hand-off state of a registered initial query, if any.
    pub fn initial_query_state(&self, query_id: &str) -> Option<InitialQueryState> {
        self.cursor.lock().unwrap().initial_queries.get(query_id).cloned()
    }

    /// Offers `entry` to its waiting initiator and blocks until it decides.
    pub(crate) fn hand_off_initial_query(
        &self,
        query_id: &str,
        entry: &str,
        deadline: Instant,
        poll_interval: Duration,
    ) -> HandOff {
        let mut cursor = self.cursor.lock().unwrap();
        match cursor.initial_queries.get_mut(query_id) {
            Some(state) if *state == InitialQueryState::Waiting => {
                *state = InitialQueryState::Reached {
                    entry: entry.to_string(),
                };
                self.cursor_changed.notify_all();
            }
            Some(InitialQueryState::Reached { .. }) => {}
            Some(InitialQueryState::Proceed) => return HandOff::Proceed,
            _ => return HandOff::NotRegistered,
        }
        loop {
            match cursor.initial_queries.get(query_id) {
                Some(InitialQueryState::Proceed) => return HandOff::Proceed,
                Some(InitialQueryState::Reached { .. }) => {}
                _ => return HandOff::Abandoned,
            }
            if self.is_stopped() {
                return HandOff::Stopped;
            }
            let now = Instant::now();
            if now >= deadline {
                if let Some(state) = cursor.initial_queries.get_mut(query_id) {
                    *state = InitialQueryState::Abandoned;
                }
                self.cursor_changed.notify_all();
                return HandOff::TimedOut;
            }
            cursor = self.wait_cursor(cursor, poll_interval.min(deadline - now));
        }
    }

    /// Publishes the applier's verdict on an initial query.
    pub(crate) fn complete_initial_query(&self, query_id: &str, outcome: TaskOutcome) {
        let mut cursor = self.cursor.lock().unwrap();
        if let Some(state) = cursor.initial_queries.get_mut(query_id) {
            *state = InitialQueryState::Finished(outcome);
        }
        self.cursor_changed.notify_all();
    }

    /// Releases every initiator still waiting on the applier.
    pub(crate) fn abandon_initial_queries(&self) {
        let mut cursor = self.cursor.lock().unwrap();
        for state in cursor.initial_queries.values_mut() {
            if !matches!(state, InitialQueryState::Finished(_)) {
                *state = InitialQueryState::Abandoned;
            }
        }
        self.cursor_changed.notify_all();
    }
}
