use std::sync::Arc;

use tracing::warn;

use super::{CoordinationClient, CoordinationClientExt, CoordinationError, CreateMode};

/// Scoped owner of one ephemeral node.
///
/// The node is removed exactly once when the guard is dropped, unless the
/// owner reports that it was already consumed (for example by a multi-op that
/// removed it as part of a commit).
pub struct EphemeralNodeGuard {
    path: String,
    client: Arc<dyn CoordinationClient>,
    released: bool,
}

impl EphemeralNodeGuard {
    /// Creates the node and takes ownership of it.
    pub fn create(
        client: Arc<dyn CoordinationClient>,
        path: impl Into<String>,
        data: &str,
    ) -> Result<Self, CoordinationError> {
        let path = path.into();
        client.create(&path, data, CreateMode::Ephemeral)?;
        Ok(Self::existing(client, path))
    }

    /// Adopts a node that was created elsewhere (typically inside a multi-op).
    pub fn existing(client: Arc<dyn CoordinationClient>, path: impl Into<String>) -> Self {
        Self {
            path: path.into(),
            client,
            released: false,
        }
    }

    pub fn path(&self) -> &str {
        &self.path
    }

    /// Overwrites the node content without giving up ownership.
    pub fn set_data(&self, data: &str) -> Result<(), CoordinationError> {
        self.client.set(&self.path, data, None).map(|_| ())
    }

    /// Records that the node no longer needs removal.
    pub fn set_already_removed(&mut self) {
        self.released = true;
    }

    pub fn is_released(&self) -> bool {
        self.released
    }

    /// Removes the node now; a missing node counts as success.
    pub fn release(&mut self) -> Result<(), CoordinationError> {
        if self.released {
            return Ok(());
        }
        self.released = true;
        self.client.try_remove(&self.path).map(|_| ())
    }
}

impl Drop for EphemeralNodeGuard {
    fn drop(&mut self) {
        if self.released || self.client.is_expired() {
            return;
        }
        if let Err(err) = self.release() {
            warn!(path = %self.path, error = %err, "failed to remove ephemeral node");
        }
    }
}

impl std::fmt::Debug for EphemeralNodeGuard {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("EphemeralNodeGuard")
            .field("path", &self.path)
            .field("released", &self.released)
            .finish()
    }
}
