//! Replicated DDL worker: keeps the metadata of every replica of a database in
//! sync by applying a totally ordered statement log stored in a ZooKeeper-style
//! coordination service.

pub mod app;
pub mod cancellation;
pub mod config;
pub mod coordination;
pub mod error;
pub mod metadata;
pub mod replication;

pub use cancellation::{CancellationRegistration, CancellationToken};
pub use config::{ConfigError, ReplicaIdentity, ReplicationSettings, REPLICA_UNSYNCED_MARKER};
pub use coordination::ephemeral::EphemeralNodeGuard;
pub use coordination::memory::{InMemoryCoordination, InMemorySession};
pub use coordination::{
    join_path, node_name, parse_number, CoordinationClient, CoordinationClientExt,
    CoordinationError, CreateMode, Op, OpResult, SessionFactory, Stat, Watch, WatchEvent,
};
pub use error::ReplicationError;
pub use metadata::catalog::{object_hash, CatalogStatement, InMemoryCatalog};
pub use metadata::{
    ExecutionContext, ExecutionFailure, ExecutionStatus, MetadataError, PreparedChange,
    ReplicatedMetadata, StatementExecutor,
};
pub use replication::{
    can_remove_entry, cleanup_queue, create_database, enqueue_entry, entry_name, generate_id,
    parse_entry_number, register_replica, AbortReason, ApplierActivity, ApplierActivityLog,
    ApplierState, DatabasePaths, EnqueueMode, EntryState, HandOff, InitReport,
    InitialQueryState, LogEntry, LostReason, ReplicatedDdlWorker, SkipReason, StalenessProbe,
    Task, TaskOutcome, TraceContext, COUNTER_PREFIX, ENTRY_PREFIX, FORCE_AUTO_RECOVERY_DIGEST,
};
