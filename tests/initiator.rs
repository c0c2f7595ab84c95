mod common;

use std::thread;
use std::time::Duration;

use common::{fast_settings, full_name, wait_for, Cluster};
use ddl_replicator::{
    node_name, parse_entry_number, AbortReason, CancellationToken, CoordinationClientExt,
    CoordinationError, LogEntry, MetadataError, ReplicatedMetadata, ReplicationError,
    ReplicationSettings,
    TaskOutcome,
};

const WAIT: Duration = Duration::from_secs(5);

#[test]
fn initial_query_is_applied_before_returning() {
    let cluster = Cluster::new(fast_settings());
    let r1 = cluster.start_replica("r1");
    let r2 = cluster.start_replica("r2");

    let path = r1.submit("CREATE events (id UInt64)").unwrap();
    let name = node_name(&path).to_string();
    let number = parse_entry_number(&name).unwrap();

    assert_eq!(r1.catalog.definition("events").as_deref(), Some("(id UInt64)"));
    wait_for(WAIT, || r1.outcome_of(&path) == Some(TaskOutcome::Applied));
    assert_eq!(cluster.max_log_ptr(), number);
    assert_eq!(cluster.persisted_log_ptr("r1"), number);

    let paths = cluster.paths_for("r1");
    assert_eq!(cluster.admin.get(&paths.entry_committed(&name)).unwrap(), full_name("r1"));
    assert!(!cluster.admin.node_exists(&paths.entry_try(&name)).unwrap());
    assert_eq!(
        cluster.admin.get(&format!("{}/events", paths.metadata_dir())).unwrap(),
        "(id UInt64)"
    );
    let stored = LogEntry::from_payload(&path, &cluster.admin.get(&path).unwrap()).unwrap();
    assert_eq!(stored.initiator, full_name("r1"));
    assert!(stored.initial_query_id.is_some());
    assert!(stored.tracing_context.is_some());

    r2.wait_caught_up();
    assert_eq!(r2.catalog.definition("events").as_deref(), Some("(id UInt64)"));
}

#[test]
fn lagging_replica_refuses_new_statements() {
    let settings = ReplicationSettings {
        max_replication_lag_to_enqueue: 2,
        ..fast_settings()
    };
    let cluster = Cluster::new(settings);
    let r1 = cluster.start_replica("r1");
    // Registered but never started: its pointer stays at zero.
    let r2 = cluster.replica("r2");
    for i in 0..3 {
        r1.submit(&format!("CREATE t{i} x")).unwrap();
    }
    let entries_before = cluster.log_entries().len();

    let err = r2.submit("CREATE t9 x").unwrap_err();
    match err {
        ReplicationError::ReplicationLagTooHigh {
            log_ptr,
            max_log_ptr,
            lag,
        } => {
            assert_eq!(log_ptr, 0);
            assert_eq!(max_log_ptr, cluster.max_log_ptr());
            assert_eq!(lag, max_log_ptr);
        }
        other => panic!("expected lag rejection, got {other:?}"),
    }
    assert_eq!(cluster.log_entries().len(), entries_before);
}

#[test]
fn cancelled_wait_rolls_the_entry_back() {
    let cluster = Cluster::new(fast_settings());
    let r1 = cluster.replica("r1");
    let token = CancellationToken::new();

    let canceller = token.clone();
    let handle = thread::spawn(move || {
        thread::sleep(Duration::from_millis(100));
        canceller.cancel();
    });
    let err = r1
        .worker
        .enqueue_and_execute(LogEntry::new("CREATE t1 x"), &token)
        .unwrap_err();
    handle.join().unwrap();

    let entry = match err {
        ReplicationError::Cancelled { entry } => entry,
        other => panic!("expected cancellation, got {other:?}"),
    };
    let paths = cluster.paths_for("r1");
    assert!(cluster.admin.node_exists(&paths.entry(&entry)).unwrap());
    assert!(!cluster.admin.node_exists(&paths.entry_try(&entry)).unwrap());
    assert!(!cluster.admin.node_exists(&paths.entry_committed(&entry)).unwrap());
}

#[test]
fn already_cancelled_token_fails_fast() {
    let cluster = Cluster::new(fast_settings());
    let r1 = cluster.replica("r1");
    let token = CancellationToken::new();
    token.cancel();

    let err = r1
        .worker
        .enqueue_and_execute(LogEntry::new("CREATE t1 x"), &token)
        .unwrap_err();
    assert!(matches!(err, ReplicationError::Cancelled { .. }));
    assert!(!err.is_retryable());
}

#[test]
fn unreached_entry_times_out() {
    let cluster = Cluster::new(fast_settings());
    let r1 = cluster.replica("r1");

    let err = r1
        .worker
        .enqueue_and_execute_with_timeout(
            LogEntry::new("CREATE t1 x"),
            Duration::from_millis(100),
            &CancellationToken::new(),
        )
        .unwrap_err();
    assert!(matches!(
        err,
        ReplicationError::InitialQueryTimeout {
            timeout_ms: 100,
            ..
        }
    ));
    assert!(err.is_retryable());
}

#[test]
fn missing_parent_aborts_on_every_replica() {
    let cluster = Cluster::new(fast_settings());
    let r1 = cluster.start_replica("r1");
    let r2 = cluster.start_replica("r2");

    let err = r1
        .worker
        .enqueue_and_execute(
            LogEntry::new("ALTER t9 (id UInt64)").with_parent("t9"),
            &CancellationToken::new(),
        )
        .unwrap_err();
    let entry = match err {
        ReplicationError::ReferenceGone { entry, reference } => {
            assert_eq!(reference, "t9");
            entry
        }
        other => panic!("expected missing reference, got {other:?}"),
    };

    let aborted = Some(TaskOutcome::Aborted(AbortReason::NotCommitted));
    wait_for(WAIT, || r1.outcome_of(&entry) == aborted);
    wait_for(WAIT, || r2.outcome_of(&entry) == aborted);

    r1.submit("CREATE t9 (id UInt64)").unwrap();
    r2.wait_caught_up();
    assert!(r2.catalog.definition("t9").is_some());
}

#[test]
fn failed_initial_query_is_rolled_back_everywhere() {
    let cluster = Cluster::new(fast_settings());
    let r1 = cluster.start_replica("r1");
    let r2 = cluster.start_replica("r2");
    r1.submit("CREATE t1 a").unwrap();
    r2.wait_caught_up();

    let err = r2.submit("CREATE t1 b").unwrap_err();
    let entry = match err {
        ReplicationError::ExecutionFailed { entry, message } => {
            assert!(message.contains("already exists"), "{message}");
            entry
        }
        other => panic!("expected execution failure, got {other:?}"),
    };

    let aborted = Some(TaskOutcome::Aborted(AbortReason::NotCommitted));
    wait_for(WAIT, || r1.outcome_of(&entry) == aborted);
    wait_for(WAIT, || r2.outcome_of(&entry) == aborted);
    assert_eq!(r1.catalog.definition("t1").as_deref(), Some("a"));
    assert_eq!(r2.catalog.definition("t1").as_deref(), Some("a"));

    r2.submit("ALTER t1 c").unwrap();
    r1.wait_caught_up();
    assert_eq!(r1.catalog.definition("t1").as_deref(), Some("c"));
    assert_eq!(r1.catalog.local_digest(), r2.catalog.local_digest());
}

#[test]
fn shutdown_releases_waiting_initiators() {
    let cluster = Cluster::new(fast_settings());
    let r1 = cluster.replica("r1");

    thread::scope(|scope| {
        let waiter = scope.spawn(|| r1.submit("CREATE t1 x"));
        thread::sleep(Duration::from_millis(100));
        r1.worker.shutdown();
        let err = waiter.join().unwrap().unwrap_err();
        assert_eq!(err, ReplicationError::ReplicationStopped);
    });

    assert_eq!(
        r1.submit("CREATE t2 x").unwrap_err(),
        ReplicationError::ReplicationStopped
    );
}

#[test]
fn session_loss_inside_metadata_is_a_session_error() {
    let expired = ReplicationError::from(MetadataError::Coordination(CoordinationError::SessionExpired));
    assert!(expired.is_session_error());
    assert!(expired.is_retryable());

    let lost_in_multi = ReplicationError::from(MetadataError::Coordination(CoordinationError::Multi {
        index: 1,
        source: Box::new(CoordinationError::ConnectionLoss),
    }));
    assert!(lost_in_multi.is_session_error());

    let corrupt = ReplicationError::from(MetadataError::Recovery("gone".to_string()));
    assert!(!corrupt.is_session_error());
    assert!(!corrupt.is_retryable());
}

#[test]
fn thread_spawn_failure_is_not_retryable() {
    let err = ReplicationError::ThreadSpawn {
        name: "ddl_worker_r1".to_string(),
        reason: "Resource temporarily unavailable".to_string(),
    };
    assert!(!err.is_retryable());
    assert!(!err.is_session_error());
    assert_eq!(
        err.to_string(),
        "failed to spawn thread ddl_worker_r1: Resource temporarily unavailable"
    );
}
