//! Reference metadata store and executor backed by an in-memory object map.
//!
//! Understands three statement shapes:
//!
//! ```text
//! CREATE <name> <definition...>
//! ALTER  <name> <definition...>
//! DROP   <name>
//! ```
//!
//! The initiating replica also mirrors every change into `<root>/metadata/<name>`
//! so lost replicas can rebuild from the shared copy. Changes reach the object
//! map only through `apply`, after the entry's commit transaction succeeded.

use std::collections::BTreeMap;
use std::sync::Mutex;
use std::thread;
use std::time::Duration;

use sha2::{Digest, Sha256};
use tracing::{debug, info};

use super::{
    ExecutionContext, ExecutionFailure, MetadataError, PreparedChange, ReplicatedMetadata,
    StatementExecutor,
};
use crate::coordination::{
    join_path, parse_number, CoordinationClient, CoordinationClientExt, CreateMode, Op,
};

const RECOVERY_SNAPSHOT_ATTEMPTS: usize = 10;

/// Parsed form of a catalog statement.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum CatalogStatement {
    Create { name: String, definition: String },
    Alter { name: String, definition: String },
    Drop { name: String },
}

impl CatalogStatement {
    pub fn parse(statement: &str) -> Result<Self, ExecutionFailure> {
        let syntax = |reason: &str| ExecutionFailure::Syntax {
            statement: statement.to_string(),
            reason: reason.to_string(),
        };
        let trimmed = statement.trim();
        let (keyword, rest) = trimmed
            .split_once(char::is_whitespace)
            .unwrap_or((trimmed, ""));
        let rest = rest.trim();
        let (name, definition) = rest
            .split_once(char::is_whitespace)
            .map(|(name, definition)| (name, definition.trim()))
            .unwrap_or((rest, ""));
        if name.is_empty() {
            return Err(syntax("missing object name"));
        }
        if name.contains('/') {
            return Err(syntax("object name must not contain '/'"));
        }
        let name = name.to_string();
        match keyword.to_ascii_uppercase().as_str() {
            "CREATE" | "ALTER" if definition.is_empty() => Err(syntax("missing definition")),
            "CREATE" => Ok(CatalogStatement::Create {
                name,
                definition: definition.to_string(),
            }),
            "ALTER" => Ok(CatalogStatement::Alter {
                name,
                definition: definition.to_string(),
            }),
            "DROP" if !definition.is_empty() => Err(syntax("unexpected tokens after name")),
            "DROP" => Ok(CatalogStatement::Drop { name }),
            _ => Err(syntax("expected CREATE, ALTER or DROP")),
        }
    }

    pub fn name(&self) -> &str {
        match self {
            CatalogStatement::Create { name, .. }
            | CatalogStatement::Alter { name, .. }
            | CatalogStatement::Drop { name } => name,
        }
    }
}

/// Contribution of one object to the catalog digest.
pub fn object_hash(name: &str, definition: &str) -> u64 {
    let mut hasher = Sha256::new();
    hasher.update(name.as_bytes());
    hasher.update([0u8]);
    hasher.update(definition.as_bytes());
    let digest = hasher.finalize();
    let mut bytes = [0u8; 8];
    bytes.copy_from_slice(&digest[..8]);
    u64::from_le_bytes(bytes)
}

fn full_digest(objects: &BTreeMap<String, String>) -> u64 {
    objects
        .iter()
        .fold(0u64, |acc, (name, definition)| {
            acc.wrapping_add(object_hash(name, definition))
        })
}

#[derive(Debug, Default)]
struct CatalogState {
    objects: BTreeMap<String, String>,
    digest: u64,
    applied: Vec<String>,
    replicas: Vec<String>,
    topology_refreshes: u64,
    recoveries: u64,
    rejected_patterns: Vec<String>,
    execution_delay: Option<Duration>,
}

impl CatalogState {
    fn insert(&mut self, name: &str, definition: &str) {
        if let Some(previous) = self.objects.insert(name.to_string(), definition.to_string()) {
            self.digest = self.digest.wrapping_sub(object_hash(name, &previous));
        }
        self.digest = self.digest.wrapping_add(object_hash(name, definition));
    }

    fn remove(&mut self, name: &str) {
        if let Some(previous) = self.objects.remove(name) {
            self.digest = self.digest.wrapping_sub(object_hash(name, &previous));
        }
    }

    fn check(&self, statement: &CatalogStatement) -> Result<(), ExecutionFailure> {
        let exists = self.objects.contains_key(statement.name());
        match statement {
            CatalogStatement::Create { name, .. } if exists => {
                Err(ExecutionFailure::AlreadyExists { name: name.clone() })
            }
            CatalogStatement::Alter { name, .. } | CatalogStatement::Drop { name } if !exists => {
                Err(ExecutionFailure::UnknownObject { name: name.clone() })
            }
            _ => Ok(()),
        }
    }

    /// Digest the catalog would have after `statement`.
    fn digest_after(&self, statement: &CatalogStatement) -> u64 {
        let name = statement.name();
        let digest = match self.objects.get(name) {
            Some(previous) => self.digest.wrapping_sub(object_hash(name, previous)),
            None => self.digest,
        };
        match statement {
            CatalogStatement::Create { definition, .. } | CatalogStatement::Alter { definition, .. } => {
                digest.wrapping_add(object_hash(name, definition))
            }
            CatalogStatement::Drop { .. } => digest,
        }
    }

    fn apply(&mut self, statement: &CatalogStatement) {
        match statement {
            CatalogStatement::Create { name, definition } | CatalogStatement::Alter { name, definition } => {
                self.insert(name, definition)
            }
            CatalogStatement::Drop { name } => self.remove(name),
        }
    }
}

/// In-memory catalog acting as both the metadata store and the executor.
#[derive(Debug)]
pub struct InMemoryCatalog {
    database_root: String,
    state: Mutex<CatalogState>,
}

impl InMemoryCatalog {
    pub fn new(database_root: impl Into<String>) -> Self {
        Self {
            database_root: database_root.into(),
            state: Mutex::new(CatalogState::default()),
        }
    }

    pub fn objects(&self) -> BTreeMap<String, String> {
        self.state.lock().unwrap().objects.clone()
    }

    pub fn definition(&self, name: &str) -> Option<String> {
        self.state.lock().unwrap().objects.get(name).cloned()
    }

    /// Entry names in the order they were executed.
    pub fn applied_entries(&self) -> Vec<String> {
        self.state.lock().unwrap().applied.clone()
    }

    pub fn replicas(&self) -> Vec<String> {
        self.state.lock().unwrap().replicas.clone()
    }

    pub fn topology_refreshes(&self) -> u64 {
        self.state.lock().unwrap().topology_refreshes
    }

    pub fn recoveries(&self) -> u64 {
        self.state.lock().unwrap().recoveries
    }

    /// Fails every statement containing `pattern` until cleared.
    pub fn reject_statements_containing(&self, pattern: impl Into<String>) {
        self.state
            .lock()
            .unwrap()
            .rejected_patterns
            .push(pattern.into());
    }

    pub fn clear_rejections(&self) {
        self.state.lock().unwrap().rejected_patterns.clear();
    }

    /// Slows every execution down, to widen race windows in tests.
    pub fn set_execution_delay(&self, delay: Option<Duration>) {
        self.state.lock().unwrap().execution_delay = delay;
    }

    /// Applies a definition directly, bypassing the log.
    pub fn force_definition(&self, name: &str, definition: Option<&str>) {
        let mut state = self.state.lock().unwrap();
        match definition {
            Some(definition) => state.insert(name, definition),
            None => state.remove(name),
        }
    }

    fn metadata_path(root: &str, name: &str) -> String {
        join_path(&join_path(root, "metadata"), name)
    }

    fn read_shared_metadata(
        &self,
        client: &dyn CoordinationClient,
    ) -> Result<BTreeMap<String, String>, MetadataError> {
        let metadata_root = join_path(&self.database_root, "metadata");
        let mut objects = BTreeMap::new();
        for name in client.children(&metadata_root)? {
            let path = join_path(&metadata_root, &name);
            if let Some(definition) = client.try_get(&path)? {
                if definition.is_empty() {
                    return Err(MetadataError::InvalidDefinition {
                        name,
                        reason: "empty definition".to_string(),
                    });
                }
                objects.insert(name, definition);
            }
        }
        Ok(objects)
    }
}

impl ReplicatedMetadata for InMemoryCatalog {
    fn local_digest(&self) -> u64 {
        self.state.lock().unwrap().digest
    }

    fn recover_lost_replica(
        &self,
        client: &dyn CoordinationClient,
        our_log_ptr: u64,
        max_log_ptr: u64,
    ) -> Result<u64, MetadataError> {
        let max_log_ptr_path = join_path(&self.database_root, "max_log_ptr");
        for _ in 0..RECOVERY_SNAPSHOT_ATTEMPTS {
            let (_, before) = client.get_with_stat(&max_log_ptr_path)?;
            let objects = self.read_shared_metadata(client)?;
            let (current, after) = client.get_with_stat(&max_log_ptr_path)?;
            if before.version != after.version {
                debug!(
                    max_log_ptr = %current,
                    "shared metadata changed while reading, retrying snapshot"
                );
                continue;
            }
            let snapshot_log_ptr = parse_number(&max_log_ptr_path, &current)?.max(max_log_ptr);
            let mut state = self.state.lock().unwrap();
            state.digest = full_digest(&objects);
            state.objects = objects;
            state.recoveries += 1;
            info!(
                our_log_ptr,
                max_log_ptr,
                snapshot_log_ptr,
                objects = state.objects.len(),
                digest = state.digest,
                "recovered catalog from shared metadata"
            );
            return Ok(snapshot_log_ptr);
        }
        Err(MetadataError::Recovery(format!(
            "shared metadata kept changing after {RECOVERY_SNAPSHOT_ATTEMPTS} snapshot attempts"
        )))
    }

    fn check_digest_valid(&self) -> bool {
        let state = self.state.lock().unwrap();
        full_digest(&state.objects) == state.digest
    }

    fn refresh_cluster_topology(&self, client: &dyn CoordinationClient) -> Result<(), MetadataError> {
        let replicas = client.children(&join_path(&self.database_root, "replicas"))?;
        let mut state = self.state.lock().unwrap();
        debug!(replicas = replicas.len(), "refreshed cluster topology");
        state.replicas = replicas;
        state.topology_refreshes += 1;
        Ok(())
    }

    fn parent_exists(&self, reference: &str) -> bool {
        self.state.lock().unwrap().objects.contains_key(reference)
    }
}

impl StatementExecutor for InMemoryCatalog {
    fn prepare(&self, ctx: &ExecutionContext<'_>) -> Result<PreparedChange, ExecutionFailure> {
        let statement = CatalogStatement::parse(&ctx.entry.statement)?;
        let delay = {
            let state = self.state.lock().unwrap();
            if let Some(pattern) = state
                .rejected_patterns
                .iter()
                .find(|pattern| ctx.entry.statement.contains(pattern.as_str()))
            {
                return Err(ExecutionFailure::Rejected(format!(
                    "statement matches rejected pattern '{pattern}'"
                )));
            }
            state.execution_delay
        };
        if let Some(delay) = delay {
            thread::sleep(delay);
        }

        let state = self.state.lock().unwrap();
        state.check(&statement)?;
        let mut ops = Vec::new();
        if ctx.is_initial_query {
            let path = Self::metadata_path(ctx.database_root, statement.name());
            ops.push(match &statement {
                CatalogStatement::Create { definition, .. } => {
                    Op::create(path, definition.clone(), CreateMode::Persistent)
                }
                CatalogStatement::Alter { definition, .. } => Op::set(path, definition.clone()),
                CatalogStatement::Drop { .. } => Op::remove(path),
            });
        }
        Ok(PreparedChange {
            ops,
            digest: state.digest_after(&statement),
        })
    }

    fn apply(&self, ctx: &ExecutionContext<'_>, change: &PreparedChange) -> Result<(), ExecutionFailure> {
        let statement = CatalogStatement::parse(&ctx.entry.statement)?;
        let mut state = self.state.lock().unwrap();
        state.check(&statement)?;
        if state.digest_after(&statement) != change.digest {
            return Err(ExecutionFailure::Rejected(format!(
                "catalog changed between prepare and apply of {}",
                ctx.entry_name
            )));
        }
        state.apply(&statement);
        state.applied.push(ctx.entry_name.to_string());
        debug!(entry = ctx.entry_name, object = statement.name(), "applied statement");
        Ok(())
    }
}
