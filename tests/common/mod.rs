#![allow(dead_code)]

use std::sync::Arc;
use std::thread;
use std::time::{Duration, Instant};

use ddl_replicator::{
    create_database, node_name, register_replica, CancellationToken, CoordinationClient,
    DatabasePaths, InMemoryCatalog, InMemoryCoordination, InMemorySession, LogEntry,
    ReplicaIdentity, ReplicatedDdlWorker, ReplicatedMetadata, ReplicationError,
    ReplicationSettings, StatementExecutor, TaskOutcome,
};

pub const ROOT: &str = "/clickhouse/databases/db1";
pub const SHARD: &str = "s1";

pub fn wait_for<F>(timeout: Duration, mut predicate: F)
where
    F: FnMut() -> bool,
{
    let deadline = Instant::now() + timeout;
    while Instant::now() < deadline {
        if predicate() {
            return;
        }
        thread::sleep(Duration::from_millis(5));
    }
    panic!("condition not met within {:?}", timeout);
}

/// Settings with millisecond-scale waits so failure paths resolve quickly.
pub fn fast_settings() -> ReplicationSettings {
    ReplicationSettings {
        wait_entry_committed_timeout_ms: 2_000,
        commit_poll_interval_ms: 10,
        initial_query_timeout_ms: 5_000,
        recovery_retry_backoff_ms: 20,
        error_retry_backoff_ms: 20,
        session_retry_backoff_ms: 20,
        enqueue_retry_backoff_ms: 1,
        cleanup_interval_ms: 50,
        queue_poll_interval_ms: 20,
        ..ReplicationSettings::default()
    }
}

pub fn identity(replica: &str) -> ReplicaIdentity {
    ReplicaIdentity::new("db1", SHARD, replica, format!("host-{replica}:9000"))
}

pub fn full_name(replica: &str) -> String {
    format!("{SHARD}|{replica}")
}

pub struct Replica {
    pub worker: ReplicatedDdlWorker,
    pub catalog: Arc<InMemoryCatalog>,
}

impl Replica {
    pub fn submit(&self, statement: &str) -> Result<String, ReplicationError> {
        self.worker
            .enqueue_and_execute(LogEntry::new(statement), &CancellationToken::new())
    }

    pub fn outcome_of(&self, entry_path: &str) -> Option<TaskOutcome> {
        self.worker.activity_log().outcome_of(node_name(entry_path))
    }

    pub fn wait_caught_up(&self) {
        let caught_up = self
            .worker
            .wait_for_replica_to_process_all_entries(Duration::from_secs(5))
            .expect("wait for replica");
        assert!(caught_up, "{} did not catch up", self.worker.identity().full_name());
    }
}

/// One in-memory coordination service hosting a freshly created database.
pub struct Cluster {
    pub service: InMemoryCoordination,
    pub admin: Arc<InMemorySession>,
    pub settings: ReplicationSettings,
}

impl Cluster {
    pub fn new(settings: ReplicationSettings) -> Self {
        let service = InMemoryCoordination::new();
        let admin = service.session();
        assert!(create_database(admin.as_ref(), ROOT, &settings).expect("create database"));
        Self {
            service,
            admin,
            settings,
        }
    }

    pub fn paths(&self) -> DatabasePaths {
        DatabasePaths::new(ROOT, "")
    }

    pub fn paths_for(&self, replica: &str) -> DatabasePaths {
        DatabasePaths::new(ROOT, full_name(replica))
    }

    /// Registers a replica and builds its worker without starting it.
    pub fn replica(&self, name: &str) -> Replica {
        let catalog = Arc::new(InMemoryCatalog::new(ROOT));
        let worker = self.worker_with(name, catalog.clone(), catalog.clone());
        Replica { worker, catalog }
    }

    pub fn start_replica(&self, name: &str) -> Replica {
        let replica = self.replica(name);
        replica.worker.start().expect("start worker");
        wait_for(Duration::from_secs(5), || replica.worker.is_initialized());
        replica
    }

    pub fn worker_with(
        &self,
        name: &str,
        metadata: Arc<dyn ReplicatedMetadata>,
        executor: Arc<dyn StatementExecutor>,
    ) -> ReplicatedDdlWorker {
        register_replica(
            self.admin.as_ref(),
            ROOT,
            &identity(name),
            metadata.as_ref(),
            &self.settings,
        )
        .expect("register replica");
        ReplicatedDdlWorker::new(
            identity(name),
            self.settings.clone(),
            ROOT,
            Arc::new(self.service.clone()),
            metadata,
            executor,
        )
        .expect("build worker")
    }

    pub fn log_entries(&self) -> Vec<String> {
        self.admin
            .children(&self.paths().log_dir())
            .expect("list log entries")
    }

    pub fn max_log_ptr(&self) -> u64 {
        let data = self
            .admin
            .get_with_stat(&self.paths().max_log_ptr())
            .expect("read max_log_ptr")
            .0;
        data.parse().expect("numeric max_log_ptr")
    }

    pub fn persisted_log_ptr(&self, replica: &str) -> u64 {
        let data = self
            .admin
            .get_with_stat(&self.paths_for(replica).replica_log_ptr())
            .expect("read log_ptr")
            .0;
        data.parse().expect("numeric log_ptr")
    }
}
