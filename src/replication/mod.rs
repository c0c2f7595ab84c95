//! Replicated DDL log: publication, sequential application and recovery.

pub mod admission;
pub mod bootstrap;
pub mod cleanup;
pub mod enqueue;
pub mod entry;
pub mod initiator;
pub mod paths;
pub mod recovery;
pub mod state;
pub mod task;
pub mod worker;

pub use bootstrap::{create_database, register_replica};
pub use cleanup::{can_remove_entry, cleanup_queue};
pub use enqueue::{enqueue_entry, EnqueueMode};
pub use entry::{generate_id, LogEntry, TraceContext};
pub use paths::{entry_name, parse_entry_number, DatabasePaths, COUNTER_PREFIX, ENTRY_PREFIX};
pub use recovery::{InitReport, LostReason, StalenessProbe, FORCE_AUTO_RECOVERY_DIGEST};
pub use state::{ApplierActivity, ApplierActivityLog, ApplierState, HandOff, InitialQueryState};
pub use task::{AbortReason, EntryState, SkipReason, Task, TaskOutcome};
pub use worker::ReplicatedDdlWorker;
