mod common;

use std::sync::{mpsc, Arc, Mutex};
use std::thread;
use std::time::Duration;

use common::{fast_settings, full_name, wait_for, Cluster, Replica, ROOT};
use ddl_replicator::{
    cleanup_queue, create_database, enqueue_entry, entry_name, node_name, parse_entry_number,
    AbortReason, ApplierActivity, CoordinationClient, CoordinationClientExt, CreateMode,
    DatabasePaths, EnqueueMode, InMemoryCatalog, InMemoryCoordination, LogEntry, LostReason,
    MetadataError, Op, ReplicatedMetadata, ReplicationError, ReplicationSettings, SkipReason,
    TaskOutcome, REPLICA_UNSYNCED_MARKER,
};

const WAIT: Duration = Duration::from_secs(5);

fn assert_same_catalogs(replicas: &[&Replica]) {
    let first = replicas[0];
    for replica in &replicas[1..] {
        assert_eq!(replica.catalog.objects(), first.catalog.objects());
        assert_eq!(replica.catalog.local_digest(), first.catalog.local_digest());
        assert_eq!(replica.catalog.applied_entries(), first.catalog.applied_entries());
    }
}

#[test]
fn registration_announces_replicas_to_the_cluster() {
    let cluster = Cluster::new(fast_settings());
    let r1 = cluster.start_replica("r1");
    let _r2 = cluster.start_replica("r2");

    wait_for(WAIT, || r1.catalog.replicas().len() == 2);
    assert_eq!(r1.catalog.replicas(), vec![full_name("r1"), full_name("r2")]);
    assert!(r1.catalog.topology_refreshes() >= 1);
    let announcement = cluster.log_entries().last().cloned().unwrap();
    wait_for(WAIT, || {
        r1.worker.activity_log().outcome_of(&announcement)
            == Some(TaskOutcome::Skipped(SkipReason::TopologyRefresh))
    });
}

#[test]
fn statements_apply_in_log_order_on_every_replica() {
    let cluster = Cluster::new(fast_settings());
    let replicas: Vec<Replica> = ["r1", "r2", "r3"]
        .into_iter()
        .map(|name| cluster.start_replica(name))
        .collect();

    let mut entries = Vec::new();
    for i in 0..9 {
        let replica = &replicas[i % replicas.len()];
        let path = replica.submit(&format!("CREATE t{i} (id UInt64)")).unwrap();
        entries.push(node_name(&path).to_string());
    }
    for replica in &replicas {
        replica.wait_caught_up();
    }

    let applied = replicas[0].catalog.applied_entries();
    assert_eq!(applied, entries);
    assert_same_catalogs(&replicas.iter().collect::<Vec<_>>());
    assert_eq!(replicas[2].catalog.objects().len(), 9);
    let last = parse_entry_number(entries.last().unwrap()).unwrap();
    assert_eq!(cluster.max_log_ptr(), last);
    for name in ["r1", "r2", "r3"] {
        assert_eq!(cluster.persisted_log_ptr(name), last);
    }
}

#[test]
fn concurrent_initiators_converge() {
    let cluster = Cluster::new(fast_settings());
    let replicas: Vec<Replica> = ["r1", "r2", "r3"]
        .into_iter()
        .map(|name| cluster.start_replica(name))
        .collect();

    thread::scope(|scope| {
        for (index, replica) in replicas.iter().enumerate() {
            scope.spawn(move || {
                for i in 0..4 {
                    replica
                        .submit(&format!("CREATE t_{index}_{i} (id UInt64)"))
                        .unwrap();
                }
            });
        }
    });
    for replica in &replicas {
        replica.wait_caught_up();
    }

    let applied = replicas[0].catalog.applied_entries();
    assert_eq!(applied.len(), 12);
    let mut sorted = applied.clone();
    sorted.sort();
    assert_eq!(applied, sorted);
    assert_same_catalogs(&replicas.iter().collect::<Vec<_>>());
}

#[test]
fn uncommitted_entry_is_aborted_after_commit_timeout() {
    let settings = ReplicationSettings {
        wait_entry_committed_timeout_ms: 300,
        ..fast_settings()
    };
    let cluster = Cluster::new(settings.clone());
    let r1 = cluster.start_replica("r1");

    let ghost = cluster.service.session();
    let ghost_paths = DatabasePaths::new(ROOT, "s1|ghost");
    let path = enqueue_entry(
        ghost.as_ref(),
        &ghost_paths,
        &LogEntry::new("CREATE t1 (id UInt64)"),
        EnqueueMode::Tentative,
        &[],
        &settings,
    )
    .unwrap();
    let name = node_name(&path).to_string();

    wait_for(WAIT, || {
        r1.outcome_of(&path) == Some(TaskOutcome::Aborted(AbortReason::CommitTimeout))
    });
    assert!(!cluster.admin.node_exists(&ghost_paths.entry_try(&name)).unwrap());
    assert!(r1.catalog.definition("t1").is_none());
    assert!(r1.worker.log_pointer() >= parse_entry_number(&name).unwrap());

    // The late initiator can no longer commit.
    let late_commit = ghost.multi(&[
        Op::remove(ghost_paths.entry_try(&name)),
        Op::create(ghost_paths.entry_committed(&name), "s1|ghost", CreateMode::Persistent),
    ]);
    assert!(late_commit.unwrap_err().is_no_node());
}

#[test]
fn entry_committed_by_another_initiator_is_applied() {
    let cluster = Cluster::new(fast_settings());
    let r1 = cluster.start_replica("r1");

    let ghost = cluster.service.session();
    let ghost_paths = DatabasePaths::new(ROOT, "s1|ghost");
    let path = enqueue_entry(
        ghost.as_ref(),
        &ghost_paths,
        &LogEntry::new("CREATE t1 (id UInt64)"),
        EnqueueMode::Tentative,
        &[],
        &cluster.settings,
    )
    .unwrap();
    let name = node_name(&path).to_string();
    ghost
        .multi(&[
            Op::remove(ghost_paths.entry_try(&name)),
            Op::create(ghost_paths.entry_committed(&name), "s1|ghost", CreateMode::Persistent),
        ])
        .unwrap();

    wait_for(WAIT, || r1.outcome_of(&path) == Some(TaskOutcome::Applied));
    assert_eq!(r1.catalog.definition("t1").as_deref(), Some("(id UInt64)"));
    let finished = cluster
        .admin
        .get(&cluster.paths_for("r1").entry_finished(&name))
        .unwrap();
    assert_eq!(finished, r#"{"code":0}"#);
    assert!(cluster
        .admin
        .node_exists(&cluster.paths_for("r1").entry_synced(&name))
        .unwrap());
}

#[test]
fn initiator_whose_entry_was_cancelled_keeps_its_metadata() {
    let settings = ReplicationSettings {
        check_consistency: false,
        wait_entry_committed_timeout_ms: 300,
        ..fast_settings()
    };
    let cluster = Cluster::new(settings);
    let r1 = cluster.start_replica("r1");
    let r2 = cluster.start_replica("r2");
    r1.catalog.set_execution_delay(Some(Duration::from_millis(800)));

    // r2 gives up on the slow initiator and removes `/try` before it commits.
    let err = r1.submit("CREATE t1 (id UInt64)").unwrap_err();
    assert!(matches!(err, ReplicationError::ExecutionFailed { .. }), "{err}");
    let name = cluster.log_entries().last().cloned().unwrap();

    assert!(r1.catalog.definition("t1").is_none());
    assert!(r1.catalog.applied_entries().is_empty());
    assert!(!cluster
        .admin
        .node_exists(&cluster.paths_for("r1").entry_finished(&name))
        .unwrap());
    wait_for(WAIT, || {
        r2.worker.activity_log().outcome_of(&name)
            == Some(TaskOutcome::Aborted(AbortReason::CommitTimeout))
    });
    wait_for(WAIT, || {
        r1.worker.activity_log().outcome_of(&name)
            == Some(TaskOutcome::Aborted(AbortReason::NotCommitted))
    });

    r1.catalog.set_execution_delay(None);
    r1.submit("CREATE t1 (id UInt64)").unwrap();
    r2.wait_caught_up();
    assert_same_catalogs(&[&r1, &r2]);
    assert_eq!(r1.catalog.applied_entries().len(), 1);
}

#[test]
fn topology_refresh_entries_between_statements_are_skipped_in_order() {
    let cluster = Cluster::new(fast_settings());
    let r1 = cluster.start_replica("r1");
    let r2 = cluster.start_replica("r2");

    let mut statements = Vec::new();
    let mut refreshes = Vec::new();
    for i in 0..3 {
        let path = r1.submit(&format!("CREATE t{i} (id UInt64)")).unwrap();
        statements.push(node_name(&path).to_string());
        let refresh = r2
            .worker
            .enqueue_query(
                LogEntry::topology_refresh(full_name("r2")),
                EnqueueMode::Committed,
                &[],
            )
            .unwrap();
        refreshes.push(node_name(&refresh).to_string());
    }
    let path = r2.submit("ALTER t0 (id UInt64, ts DateTime)").unwrap();
    statements.push(node_name(&path).to_string());
    r1.wait_caught_up();
    r2.wait_caught_up();

    for replica in [&r1, &r2] {
        assert_eq!(replica.catalog.applied_entries(), statements);
        for refresh in &refreshes {
            assert_eq!(
                replica.worker.activity_log().outcome_of(refresh),
                Some(TaskOutcome::Skipped(SkipReason::TopologyRefresh))
            );
        }
    }
    let last = parse_entry_number(statements.last().unwrap()).unwrap();
    assert_eq!(cluster.max_log_ptr(), last);
    for name in ["r1", "r2"] {
        assert_eq!(cluster.persisted_log_ptr(name), last);
    }
    assert_eq!(
        r1.catalog.definition("t0").as_deref(),
        Some("(id UInt64, ts DateTime)")
    );
    assert_same_catalogs(&[&r1, &r2]);
}

#[test]
fn committed_entries_leave_no_watches_behind() {
    let cluster = Cluster::new(fast_settings());
    let r1 = cluster.start_replica("r1");

    for _ in 0..20 {
        r1.worker
            .enqueue_query(
                LogEntry::topology_refresh(full_name("r1")),
                EnqueueMode::Committed,
                &[],
            )
            .unwrap();
    }
    let last = cluster.log_entries().last().cloned().unwrap();
    wait_for(WAIT, || r1.worker.activity_log().outcome_of(&last).is_some());

    // Only the applier's watch on the log directory stays armed.
    wait_for(WAIT, || cluster.service.registered_watches() <= 2);
}

#[test]
fn starting_twice_is_a_no_op() {
    let cluster = Cluster::new(fast_settings());
    let r1 = cluster.replica("r1");
    r1.worker.start().unwrap();
    r1.worker.start().unwrap();
    wait_for(WAIT, || r1.worker.is_initialized());
    r1.submit("CREATE t1 (id UInt64)").unwrap();
    assert_eq!(r1.catalog.applied_entries().len(), 1);
}

#[test]
fn caught_up_replica_returns_immediately() {
    let cluster = Cluster::new(fast_settings());
    let r1 = cluster.start_replica("r1");
    assert!(r1
        .worker
        .wait_for_replica_to_process_all_entries(Duration::ZERO)
        .unwrap());

    let r2 = cluster.start_replica("r2");
    r2.catalog.set_execution_delay(Some(Duration::from_millis(500)));
    r1.submit("CREATE t1 (id UInt64)").unwrap();

    assert!(!r2
        .worker
        .wait_for_replica_to_process_all_entries(Duration::from_millis(20))
        .unwrap());
    r2.wait_caught_up();
    assert_eq!(r2.catalog.definition("t1").as_deref(), Some("(id UInt64)"));
}

#[test]
fn expired_session_is_replaced_and_work_resumes() {
    let cluster = Cluster::new(fast_settings());
    let r1 = cluster.start_replica("r1");
    let _r2 = cluster.start_replica("r2");
    r1.submit("CREATE t1 (id UInt64)").unwrap();

    let expired = r1.worker.client().session_id();
    cluster.service.expire_session(expired);

    wait_for(WAIT, || {
        r1.worker
            .activity_log()
            .snapshot()
            .iter()
            .any(|activity| matches!(activity, ApplierActivity::Reconnected { .. }))
            && r1.worker.is_initialized()
    });
    assert_ne!(r1.worker.client().session_id(), expired);
    let marker = cluster
        .admin
        .get(&cluster.paths_for("r1").replica_active())
        .unwrap();
    assert_eq!(marker, "host-r1:9000");

    r1.submit("CREATE t2 (id UInt64)").unwrap();
    assert_eq!(r1.catalog.objects().len(), 2);
    // Work done before the expiry is not repeated.
    assert_eq!(r1.catalog.applied_entries().len(), 2);
}

#[test]
fn replica_outside_retained_window_resyncs_from_shared_metadata() {
    let settings = ReplicationSettings {
        logs_to_keep: 2,
        ..fast_settings()
    };
    let cluster = Cluster::new(settings);
    let r1 = cluster.start_replica("r1");
    let r2 = cluster.start_replica("r2");
    r1.submit("CREATE t0 (id UInt64)").unwrap();
    r2.wait_caught_up();

    let catalog = r2.catalog.clone();
    drop(r2);
    for i in 1..5 {
        r1.submit(&format!("CREATE t{i} (id UInt64)")).unwrap();
    }
    r1.submit("DROP t0").unwrap();

    let worker = cluster.worker_with("r2", catalog.clone(), catalog.clone());
    worker.start().unwrap();
    let r2 = Replica { worker, catalog };
    wait_for(WAIT, || r2.worker.is_initialized());
    r2.wait_caught_up();

    assert_eq!(r2.catalog.objects(), r1.catalog.objects());
    assert_eq!(r2.catalog.local_digest(), r1.catalog.local_digest());
    assert_eq!(r2.catalog.recoveries(), 2);
    let lost = r2.worker.activity_log().snapshot().into_iter().find_map(|activity| match activity {
        ApplierActivity::Initialized { lost, .. } => lost,
        _ => None,
    });
    assert!(matches!(lost, Some(LostReason::OutsideRetainedWindow { .. })));
}

/// Catalog whose recovery runs a hook right after taking its snapshot.
struct PausingRecovery {
    catalog: Arc<InMemoryCatalog>,
    after_snapshot: Mutex<Option<Box<dyn FnOnce() + Send>>>,
}

impl ReplicatedMetadata for PausingRecovery {
    fn local_digest(&self) -> u64 {
        self.catalog.local_digest()
    }

    fn recover_lost_replica(
        &self,
        client: &dyn CoordinationClient,
        our_log_ptr: u64,
        max_log_ptr: u64,
    ) -> Result<u64, MetadataError> {
        let snapshot_log_ptr = self
            .catalog
            .recover_lost_replica(client, our_log_ptr, max_log_ptr)?;
        if let Some(hook) = self.after_snapshot.lock().unwrap().take() {
            hook();
        }
        Ok(snapshot_log_ptr)
    }

    fn check_digest_valid(&self) -> bool {
        self.catalog.check_digest_valid()
    }

    fn refresh_cluster_topology(&self, client: &dyn CoordinationClient) -> Result<(), MetadataError> {
        self.catalog.refresh_cluster_topology(client)
    }

    fn parent_exists(&self, reference: &str) -> bool {
        self.catalog.parent_exists(reference)
    }
}

#[test]
fn recovered_replica_far_behind_is_unsynced_until_it_catches_up() {
    let settings = ReplicationSettings {
        max_replication_lag_to_enqueue: 2,
        ..fast_settings()
    };
    let cluster = Cluster::new(settings);
    let r1 = cluster.start_replica("r1");

    let (snapshot_taken, snapshot_rx) = mpsc::channel();
    let (resume_tx, resume) = mpsc::channel::<()>();
    let catalog = Arc::new(InMemoryCatalog::new(ROOT));
    catalog.set_execution_delay(Some(Duration::from_millis(300)));
    let hook: Box<dyn FnOnce() + Send> = Box::new(move || {
        snapshot_taken.send(()).unwrap();
        resume.recv().unwrap();
    });
    let metadata = Arc::new(PausingRecovery {
        catalog: catalog.clone(),
        after_snapshot: Mutex::new(Some(hook)),
    });
    let worker = cluster.worker_with("r2", metadata, catalog.clone());
    worker.start().unwrap();
    let r2 = Replica { worker, catalog };

    // Commit more than the allowed lag while r2 is still recovering.
    snapshot_rx.recv_timeout(WAIT).unwrap();
    for i in 0..4 {
        r1.submit(&format!("CREATE t{i} (id UInt64)")).unwrap();
    }
    resume_tx.send(()).unwrap();

    wait_for(WAIT, || r2.worker.is_initialized());
    assert!(r2.worker.is_unsynced_after_recovery());
    let marker_path = cluster.paths_for("r2").replica_active();
    assert_eq!(
        cluster.admin.get(&marker_path).unwrap(),
        format!("host-r2:9000{REPLICA_UNSYNCED_MARKER}")
    );

    wait_for(WAIT, || !r2.worker.is_unsynced_after_recovery());
    assert_eq!(cluster.admin.get(&marker_path).unwrap(), "host-r2:9000");
    r2.wait_caught_up();

    let activity = r2.worker.activity_log().snapshot();
    assert!(activity.iter().any(|a| matches!(
        a,
        ApplierActivity::Initialized {
            lost: Some(LostReason::NewReplica),
            unsynced: true,
            ..
        }
    )));
    assert!(activity
        .iter()
        .any(|a| matches!(a, ApplierActivity::BecameSynced { .. })));
    // Statements committed after the snapshot are executed exactly once.
    assert_eq!(r2.catalog.applied_entries().len(), 4);
    assert_eq!(r2.catalog.recoveries(), 1);
    assert_eq!(r2.catalog.objects(), r1.catalog.objects());
    assert_eq!(r2.catalog.local_digest(), r1.catalog.local_digest());
}

#[test]
fn repeatedly_failing_replica_forces_its_own_recovery() {
    let settings = ReplicationSettings {
        max_retries_before_automatic_recovery: 3,
        ..fast_settings()
    };
    let cluster = Cluster::new(settings);
    let r1 = cluster.start_replica("r1");
    let r2 = cluster.start_replica("r2");
    r2.catalog.reject_statements_containing("poison");

    r1.submit("CREATE poison (id UInt64)").unwrap();

    wait_for(WAIT, || r2.catalog.definition("poison").is_some());
    let activity = r2.worker.activity_log().snapshot();
    assert!(activity
        .iter()
        .any(|a| matches!(a, ApplierActivity::DigestInvalidated { failures } if *failures >= 3)));
    assert!(activity.iter().any(|a| matches!(
        a,
        ApplierActivity::Initialized {
            lost: Some(LostReason::DigestMismatch { stored: 42, .. }),
            ..
        }
    )));
    // The poisoned statement was never executed locally; it came from the shared copy.
    assert!(r2.catalog.applied_entries().is_empty());

    r2.wait_caught_up();
    r1.submit("CREATE t2 (id UInt64)").unwrap();
    r2.wait_caught_up();
    assert_eq!(r2.catalog.objects(), r1.catalog.objects());
}

/// Metadata whose cached digest never matches a recomputation.
struct CorruptedMetadata(InMemoryCatalog);

impl ReplicatedMetadata for CorruptedMetadata {
    fn local_digest(&self) -> u64 {
        self.0.local_digest()
    }

    fn recover_lost_replica(
        &self,
        client: &dyn CoordinationClient,
        our_log_ptr: u64,
        max_log_ptr: u64,
    ) -> Result<u64, MetadataError> {
        self.0.recover_lost_replica(client, our_log_ptr, max_log_ptr)
    }

    fn check_digest_valid(&self) -> bool {
        false
    }

    fn refresh_cluster_topology(&self, client: &dyn CoordinationClient) -> Result<(), MetadataError> {
        self.0.refresh_cluster_topology(client)
    }

    fn parent_exists(&self, reference: &str) -> bool {
        self.0.parent_exists(reference)
    }
}

#[test]
fn inconsistent_local_metadata_stops_replication() {
    let cluster = Cluster::new(fast_settings());
    let executor = Arc::new(InMemoryCatalog::new(ROOT));
    let worker = cluster.worker_with(
        "r1",
        Arc::new(CorruptedMetadata(InMemoryCatalog::new(ROOT))),
        executor,
    );
    worker.start().unwrap();

    wait_for(WAIT, || worker.fatal_error().is_some());
    assert!(!worker.is_initialized());
    let err = worker
        .enqueue_and_execute(LogEntry::new("CREATE t1 x"), &Default::default())
        .unwrap_err();
    assert_eq!(err, ReplicationError::ReplicationStopped);
}

#[test]
fn cleanup_thread_trims_entries_outside_the_window() {
    let settings = ReplicationSettings {
        logs_to_keep: 2,
        ..fast_settings()
    };
    let cluster = Cluster::new(settings);
    let r1 = cluster.start_replica("r1");
    for i in 0..6 {
        r1.submit(&format!("CREATE t{i} (id UInt64)")).unwrap();
    }
    let max = cluster.max_log_ptr();

    wait_for(WAIT, || {
        cluster
            .log_entries()
            .iter()
            .filter_map(|name| parse_entry_number(name))
            .all(|number| number + 2 >= max)
    });
    assert!(cluster.log_entries().contains(&entry_name(max)));
    assert!(r1
        .worker
        .activity_log()
        .snapshot()
        .iter()
        .any(|a| matches!(a, ApplierActivity::CleanedUp { .. })));
}

#[test]
fn cleanup_keeps_entries_still_being_executed() {
    let service = InMemoryCoordination::new();
    let client = service.session();
    let settings = ReplicationSettings {
        logs_to_keep: 1,
        ..fast_settings()
    };
    create_database(client.as_ref(), ROOT, &settings).unwrap();
    let paths = DatabasePaths::new(ROOT, "s1|r9");
    for i in 0..4 {
        enqueue_entry(
            client.as_ref(),
            &paths,
            &LogEntry::new(format!("CREATE t{i} x")),
            EnqueueMode::Committed,
            &[],
            &settings,
        )
        .unwrap();
    }
    client.set(&paths.max_log_ptr(), "5", None).unwrap();
    client
        .create(&paths.entry_active(&entry_name(2)), "host-9", CreateMode::Ephemeral)
        .unwrap();

    assert_eq!(cleanup_queue(client.as_ref(), &paths).unwrap(), 1);
    let remaining = client.children(&paths.log_dir()).unwrap();
    assert_eq!(remaining, vec![entry_name(2), entry_name(4), entry_name(5)]);
}

#[test]
fn recreating_an_existing_database_is_a_no_op() {
    let cluster = Cluster::new(fast_settings());
    assert!(!create_database(cluster.admin.as_ref(), ROOT, &cluster.settings).unwrap());
    assert_eq!(cluster.max_log_ptr(), 1);
}
