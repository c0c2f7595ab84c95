use std::env;
use std::fs;
use std::sync::Arc;
use std::time::Duration;

use anyhow::{anyhow, bail, Context, Result};
use tracing::{info, warn};
use tracing_subscriber::EnvFilter;

use crate::cancellation::CancellationToken;
use crate::config::{ReplicaIdentity, ReplicationSettings};
use crate::coordination::memory::InMemoryCoordination;
use crate::metadata::catalog::InMemoryCatalog;
use crate::metadata::ReplicatedMetadata;
use crate::replication::{create_database, register_replica, LogEntry, ReplicatedDdlWorker};

const USAGE: &str = "usage:\n  \
    ddl-replicator demo <replicas> <statements-file> [settings.json]\n  \
    ddl-replicator settings [settings.json]";

const DEMO_ROOT: &str = "/clickhouse/databases/demo";
const CATCH_UP_TIMEOUT: Duration = Duration::from_secs(30);

/// Application entrypoint: install logging and dispatch the subcommand.
pub fn run() -> Result<()> {
    tracing_subscriber::fmt()
        .with_target(false)
        .with_env_filter(
            EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| EnvFilter::new("ddl_replicator=info,warn")),
        )
        .init();

    let args: Vec<String> = env::args().skip(1).collect();
    match args.first().map(String::as_str) {
        Some("demo") => {
            let replicas = args
                .get(1)
                .ok_or_else(|| anyhow!("missing replica count\n{USAGE}"))?
                .parse::<usize>()
                .context("replica count must be a positive integer")?;
            let statements = args
                .get(2)
                .ok_or_else(|| anyhow!("missing statements file\n{USAGE}"))?;
            let settings = load_settings(args.get(3).map(String::as_str))?;
            run_demo(replicas, statements, settings)
        }
        Some("settings") => {
            let settings = load_settings(args.get(1).map(String::as_str))?;
            println!("{}", serde_json::to_string_pretty(&settings)?);
            Ok(())
        }
        _ => bail!("{USAGE}"),
    }
}

fn load_settings(path: Option<&str>) -> Result<ReplicationSettings> {
    match path {
        Some(path) => ReplicationSettings::load(path)
            .with_context(|| format!("loading settings from {path}")),
        None => Ok(ReplicationSettings::default()),
    }
}

fn read_statements(path: &str) -> Result<Vec<String>> {
    let raw = fs::read_to_string(path).with_context(|| format!("reading {path}"))?;
    Ok(raw
        .lines()
        .map(str::trim)
        .filter(|line| !line.is_empty() && !line.starts_with('#'))
        .map(str::to_string)
        .collect())
}

/// Runs a cluster of in-process replicas, submits every statement round-robin
/// and reports the resulting catalogs.
fn run_demo(replicas: usize, statements_path: &str, settings: ReplicationSettings) -> Result<()> {
    if replicas == 0 {
        bail!("at least one replica is required");
    }
    let statements = read_statements(statements_path)?;
    let service = InMemoryCoordination::new();
    let admin = service.session();
    create_database(admin.as_ref(), DEMO_ROOT, &settings)?;

    let mut cluster = Vec::with_capacity(replicas);
    for index in 0..replicas {
        let identity = ReplicaIdentity::new(
            "demo",
            "s1",
            format!("r{}", index + 1),
            format!("host-{}:9000", index + 1),
        );
        let catalog = Arc::new(InMemoryCatalog::new(DEMO_ROOT));
        register_replica(admin.as_ref(), DEMO_ROOT, &identity, catalog.as_ref(), &settings)?;
        let worker = ReplicatedDdlWorker::new(
            identity,
            settings.clone(),
            DEMO_ROOT,
            Arc::new(service.clone()),
            catalog.clone(),
            catalog.clone(),
        )?;
        worker.start()?;
        cluster.push((worker, catalog));
    }

    let cancellation = CancellationToken::new();
    for (index, statement) in statements.iter().enumerate() {
        let (worker, _) = &cluster[index % cluster.len()];
        match worker.enqueue_and_execute(LogEntry::new(statement.as_str()), &cancellation) {
            Ok(entry) => info!(replica = %worker.identity().full_name(), %entry, %statement, "statement applied"),
            Err(err) => warn!(replica = %worker.identity().full_name(), %statement, error = %err, "statement failed"),
        }
    }

    for (worker, catalog) in &cluster {
        let caught_up = worker.wait_for_replica_to_process_all_entries(CATCH_UP_TIMEOUT)?;
        println!(
            "{} log_ptr={} caught_up={} digest={} objects={}",
            worker.identity().full_name(),
            worker.log_pointer(),
            caught_up,
            catalog.local_digest(),
            catalog.objects().len()
        );
        for (name, definition) in catalog.objects() {
            println!("  {name}: {definition}");
        }
    }
    for (worker, _) in &cluster {
        worker.shutdown();
    }
    Ok(())
}
