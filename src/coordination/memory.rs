//! In-process coordination service with ZooKeeper-style semantics.
//!
//! Used by the integration tests and the demo binary. Every session shares one
//! tree; ephemeral nodes are owned by the creating session and disappear (with
//! watches firing) once that session is closed or expired.

use std::collections::{BTreeMap, BTreeSet, HashMap};
use std::fmt;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex};

use super::{
    CoordinationClient, CoordinationError, CreateMode, Op, OpResult,
    SessionFactory, Stat, Watch, WatchEvent, SEQUENTIAL_SUFFIX_WIDTH,
};

#[derive(Debug, Clone)]
struct Node {
    data: String,
    version: i32,
    cversion: i32,
    ephemeral_owner: Option<u64>,
    children: BTreeSet<String>,
}

impl Node {
    fn new(data: &str, ephemeral_owner: Option<u64>) -> Self {
        Self {
            data: data.to_string(),
            version: 0,
            cversion: 0,
            ephemeral_owner,
            children: BTreeSet::new(),
        }
    }

    fn stat(&self) -> Stat {
        Stat {
            version: self.version,
            cversion: self.cversion,
            num_children: self.children.len(),
            ephemeral_owner: self.ephemeral_owner,
        }
    }
}

type Nodes = BTreeMap<String, Node>;

#[derive(Debug, Default)]
struct Tree {
    nodes: Nodes,
    live_sessions: BTreeSet<u64>,
    data_watches: HashMap<String, Vec<(u64, Watch)>>,
    child_watches: HashMap<String, Vec<(u64, Watch)>>,
}

impl Tree {
    fn new() -> Self {
        let mut nodes = BTreeMap::new();
        nodes.insert("/".to_string(), Node::new("", None));
        Self {
            nodes,
            ..Self::default()
        }
    }

    fn ensure_live(&self, session: u64) -> Result<(), CoordinationError> {
        if self.live_sessions.contains(&session) {
            Ok(())
        } else {
            Err(CoordinationError::SessionExpired)
        }
    }

    fn fire(&mut self, events: Vec<(String, WatchEvent)>) {
        for (path, event) in events {
            let data_targets = match event {
                WatchEvent::Created | WatchEvent::Deleted | WatchEvent::DataChanged => {
                    self.data_watches.remove(&path)
                }
                _ => None,
            };
            for (_, watch) in data_targets.into_iter().flatten() {
                watch.trigger(event);
            }
            let child_targets = match event {
                WatchEvent::ChildrenChanged | WatchEvent::Deleted => {
                    self.child_watches.remove(&path)
                }
                _ => None,
            };
            for (_, watch) in child_targets.into_iter().flatten() {
                watch.trigger(event);
            }
        }
    }

    fn close_session(&mut self, session: u64) {
        if !self.live_sessions.remove(&session) {
            return;
        }
        let owned: Vec<String> = self
            .nodes
            .iter()
            .filter(|(_, node)| node.ephemeral_owner == Some(session))
            .map(|(path, _)| path.clone())
            .collect();
        let mut events = Vec::new();
        for path in owned {
            // Ephemerals never have children, so removal cannot fail on NotEmpty.
            let _ = apply_op(&mut self.nodes, session, &Op::remove(path), &mut events);
        }
        self.fire(events);
        for watches in [&mut self.data_watches, &mut self.child_watches] {
            for registered in watches.values_mut() {
                registered.retain(|(owner, watch)| {
                    if *owner == session {
                        watch.trigger(WatchEvent::SessionExpired);
                        false
                    } else {
                        true
                    }
                });
            }
        }
    }
}

fn validate_path(path: &str) -> Result<(), CoordinationError> {
    let valid = path == "/"
        || (path.starts_with('/')
            && !path.ends_with('/')
            && !path[1..].split('/').any(|segment| segment.is_empty()));
    if valid {
        Ok(())
    } else {
        Err(CoordinationError::BadPath {
            path: path.to_string(),
        })
    }
}

fn parent_of(path: &str) -> &str {
    match path.rfind('/') {
        Some(0) | None => "/",
        Some(idx) => &path[..idx],
    }
}

fn child_name(path: &str) -> &str {
    path.rsplit('/').next().unwrap_or(path)
}

fn check_version(path: &str, node: &Node, expected: Option<i32>) -> Result<(), CoordinationError> {
    match expected {
        Some(expected) if expected != node.version => Err(CoordinationError::BadVersion {
            path: path.to_string(),
            expected,
            actual: node.version,
        }),
        _ => Ok(()),
    }
}

fn no_node(path: &str) -> CoordinationError {
    CoordinationError::NoNode {
        path: path.to_string(),
    }
}

fn apply_op(
    nodes: &mut Nodes,
    session: u64,
    op: &Op,
    events: &mut Vec<(String, WatchEvent)>,
) -> Result<OpResult, CoordinationError> {
    match op {
        Op::Create { path, data, mode } => {
            if mode.is_sequential() {
                // The sequential prefix may end with a separator-free stem such as `cnt-`.
                validate_path(parent_of(path))?;
            } else {
                validate_path(path)?;
            }
            if path == "/" {
                return Err(CoordinationError::NodeExists { path: path.clone() });
            }
            let parent_path = parent_of(path).to_string();
            let parent = nodes.get(&parent_path).ok_or_else(|| no_node(path))?;
            if parent.ephemeral_owner.is_some() {
                return Err(CoordinationError::NoChildrenForEphemerals { path: path.clone() });
            }
            let full_path = if mode.is_sequential() {
                format!(
                    "{path}{:0width$}",
                    parent.cversion,
                    width = SEQUENTIAL_SUFFIX_WIDTH
                )
            } else {
                path.clone()
            };
            if nodes.contains_key(&full_path) {
                return Err(CoordinationError::NodeExists { path: full_path });
            }
            let owner = mode.is_ephemeral().then_some(session);
            nodes.insert(full_path.clone(), Node::new(data, owner));
            if let Some(parent) = nodes.get_mut(&parent_path) {
                parent.children.insert(child_name(&full_path).to_string());
                parent.cversion += 1;
            }
            events.push((full_path.clone(), WatchEvent::Created));
            events.push((parent_path, WatchEvent::ChildrenChanged));
            Ok(OpResult::Created { path: full_path })
        }
        Op::Remove { path, version } => {
            validate_path(path)?;
            let node = nodes.get(path).ok_or_else(|| no_node(path))?;
            check_version(path, node, *version)?;
            if !node.children.is_empty() {
                return Err(CoordinationError::NotEmpty { path: path.clone() });
            }
            nodes.remove(path);
            let parent_path = parent_of(path).to_string();
            if let Some(parent) = nodes.get_mut(&parent_path) {
                parent.children.remove(child_name(path));
            }
            events.push((path.clone(), WatchEvent::Deleted));
            events.push((parent_path, WatchEvent::ChildrenChanged));
            Ok(OpResult::Removed)
        }
        Op::Set {
            path,
            data,
            version,
        } => {
            validate_path(path)?;
            let node = nodes.get_mut(path).ok_or_else(|| no_node(path))?;
            check_version(path, node, *version)?;
            node.data = data.clone();
            node.version += 1;
            events.push((path.clone(), WatchEvent::DataChanged));
            Ok(OpResult::Set(node.stat()))
        }
        Op::Check { path, version } => {
            validate_path(path)?;
            let node = nodes.get(path).ok_or_else(|| no_node(path))?;
            check_version(path, node, *version)?;
            Ok(OpResult::Checked)
        }
    }
}

/// Shared coordination tree; cheap to clone.
#[derive(Clone)]
pub struct InMemoryCoordination {
    tree: Arc<Mutex<Tree>>,
    next_session: Arc<AtomicU64>,
}

impl InMemoryCoordination {
    pub fn new() -> Self {
        Self {
            tree: Arc::new(Mutex::new(Tree::new())),
            next_session: Arc::new(AtomicU64::new(1)),
        }
    }

    /// Opens a new session against the shared tree.
    pub fn session(&self) -> Arc<InMemorySession> {
        let id = self.next_session.fetch_add(1, Ordering::Relaxed);
        self.tree.lock().unwrap().live_sessions.insert(id);
        Arc::new(InMemorySession {
            id,
            tree: self.tree.clone(),
        })
    }

    /// Expires a session as the service would after a missed heartbeat.
    pub fn expire_session(&self, session_id: u64) {
        self.tree.lock().unwrap().close_session(session_id);
    }

    /// Number of armed data and child watches still registered.
    pub fn registered_watches(&self) -> usize {
        let tree = self.tree.lock().unwrap();
        [&tree.data_watches, &tree.child_watches]
            .into_iter()
            .flat_map(|registry| registry.values())
            .map(Vec::len)
            .sum()
    }

    /// Full paths of every node below `prefix` (inclusive), sorted.
    pub fn paths_under(&self, prefix: &str) -> Vec<String> {
        let tree = self.tree.lock().unwrap();
        tree.nodes
            .keys()
            .filter(|path| path.as_str() == prefix || path.starts_with(&format!("{prefix}/")))
            .cloned()
            .collect()
    }
}

impl Default for InMemoryCoordination {
    fn default() -> Self {
        Self::new()
    }
}

impl fmt::Debug for InMemoryCoordination {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let tree = self.tree.lock().unwrap();
        f.debug_struct("InMemoryCoordination")
            .field("nodes", &tree.nodes.len())
            .field("live_sessions", &tree.live_sessions.len())
            .finish()
    }
}

impl SessionFactory for InMemoryCoordination {
    fn connect(&self) -> Result<Arc<dyn CoordinationClient>, CoordinationError> {
        Ok(self.session())
    }
}

/// Client bound to one session of an [`InMemoryCoordination`].
pub struct InMemorySession {
    id: u64,
    tree: Arc<Mutex<Tree>>,
}

impl InMemorySession {
    /// Ends the session, dropping its ephemeral nodes.
    pub fn close(&self) {
        self.tree.lock().unwrap().close_session(self.id);
    }

    fn register(
        registry: &mut HashMap<String, Vec<(u64, Watch)>>,
        path: &str,
        session: u64,
    ) -> Watch {
        // Watches on nodes that never change would otherwise stay registered forever.
        registry.retain(|_, registered| {
            registered.retain(|(_, watch)| !watch.is_orphaned());
            !registered.is_empty()
        });
        let watch = Watch::new();
        registry
            .entry(path.to_string())
            .or_default()
            .push((session, watch.clone()));
        watch
    }
}

impl fmt::Debug for InMemorySession {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("InMemorySession").field("id", &self.id).finish()
    }
}

impl Drop for InMemorySession {
    fn drop(&mut self) {
        if let Ok(mut tree) = self.tree.lock() {
            tree.close_session(self.id);
        }
    }
}

impl CoordinationClient for InMemorySession {
    fn session_id(&self) -> u64 {
        self.id
    }

    fn is_expired(&self) -> bool {
        !self.tree.lock().unwrap().live_sessions.contains(&self.id)
    }

    fn create(&self, path: &str, data: &str, mode: CreateMode) -> Result<String, CoordinationError> {
        let mut tree = self.tree.lock().unwrap();
        tree.ensure_live(self.id)?;
        let mut events = Vec::new();
        let result = apply_op(
            &mut tree.nodes,
            self.id,
            &Op::create(path, data, mode),
            &mut events,
        )?;
        tree.fire(events);
        match result {
            OpResult::Created { path } => Ok(path),
            _ => unreachable!("create always yields a created path"),
        }
    }

    fn get_with_stat(&self, path: &str) -> Result<(String, Stat), CoordinationError> {
        let tree = self.tree.lock().unwrap();
        tree.ensure_live(self.id)?;
        validate_path(path)?;
        tree.nodes
            .get(path)
            .map(|node| (node.data.clone(), node.stat()))
            .ok_or_else(|| no_node(path))
    }

    fn exists(&self, path: &str) -> Result<Option<Stat>, CoordinationError> {
        let tree = self.tree.lock().unwrap();
        tree.ensure_live(self.id)?;
        validate_path(path)?;
        Ok(tree.nodes.get(path).map(Node::stat))
    }

    fn set(&self, path: &str, data: &str, version: Option<i32>) -> Result<Stat, CoordinationError> {
        let mut tree = self.tree.lock().unwrap();
        tree.ensure_live(self.id)?;
        let mut events = Vec::new();
        let op = Op::Set {
            path: path.to_string(),
            data: data.to_string(),
            version,
        };
        let result = apply_op(&mut tree.nodes, self.id, &op, &mut events)?;
        tree.fire(events);
        match result {
            OpResult::Set(stat) => Ok(stat),
            _ => unreachable!("set always yields a stat"),
        }
    }

    fn remove(&self, path: &str, version: Option<i32>) -> Result<(), CoordinationError> {
        let mut tree = self.tree.lock().unwrap();
        tree.ensure_live(self.id)?;
        let mut events = Vec::new();
        let op = Op::Remove {
            path: path.to_string(),
            version,
        };
        apply_op(&mut tree.nodes, self.id, &op, &mut events)?;
        tree.fire(events);
        Ok(())
    }

    fn children(&self, path: &str) -> Result<Vec<String>, CoordinationError> {
        let tree = self.tree.lock().unwrap();
        tree.ensure_live(self.id)?;
        validate_path(path)?;
        tree.nodes
            .get(path)
            .map(|node| node.children.iter().cloned().collect())
            .ok_or_else(|| no_node(path))
    }

    fn watch_data(&self, path: &str) -> Result<(Option<String>, Watch), CoordinationError> {
        let mut tree = self.tree.lock().unwrap();
        tree.ensure_live(self.id)?;
        validate_path(path)?;
        let data = tree.nodes.get(path).map(|node| node.data.clone());
        let watch = Self::register(&mut tree.data_watches, path, self.id);
        Ok((data, watch))
    }

    fn watch_children(&self, path: &str) -> Result<(Vec<String>, Watch), CoordinationError> {
        let mut tree = self.tree.lock().unwrap();
        tree.ensure_live(self.id)?;
        validate_path(path)?;
        let children = tree
            .nodes
            .get(path)
            .map(|node| node.children.iter().cloned().collect::<Vec<_>>())
            .ok_or_else(|| no_node(path))?;
        let watch = Self::register(&mut tree.child_watches, path, self.id);
        Ok((children, watch))
    }

    fn multi(&self, ops: &[Op]) -> Result<Vec<OpResult>, CoordinationError> {
        let mut tree = self.tree.lock().unwrap();
        tree.ensure_live(self.id)?;
        let mut scratch = tree.nodes.clone();
        let mut events = Vec::new();
        let mut results = Vec::with_capacity(ops.len());
        for (index, op) in ops.iter().enumerate() {
            match apply_op(&mut scratch, self.id, op, &mut events) {
                Ok(result) => results.push(result),
                Err(err) => {
                    return Err(CoordinationError::Multi {
                        index,
                        source: Box::new(err),
                    })
                }
            }
        }
        tree.nodes = scratch;
        tree.fire(events);
        Ok(results)
    }
}
