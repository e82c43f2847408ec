//! # Shardline Coordination
//! The boundary between shardline and the coordination service which records
//! cluster membership.
//!
//! The coordination service is a hierarchical, watchable key registry in the
//! style of ZooKeeper. Shardline only relies on the capabilities exposed by the
//! [Coordinator] trait:
//!
//! - Creating persistent path nodes, including intermediate segments (see [ensure_path]).
//! - Listing the children of a path and watching it for changes.
//! - Registering session scoped (ephemeral) presence nodes.
//! - Closing the session.
//!
//! [MemoryRegistry] provides an in-process implementation which is used for
//! testing and for single process deployments.

mod error;
mod memory;
pub mod path;

use async_trait::async_trait;
pub use error::CoordError;
pub use memory::{MemoryCoordinator, MemoryRegistry};
use tokio::sync::watch;

#[derive(Debug, Copy, Clone, PartialEq, Eq)]
/// The lifetime of a created node.
pub enum CreateMode {
    /// The node lives until it is explicitly deleted.
    Persistent,
    /// The node is removed when the session which created it closes.
    Ephemeral,
    /// Like [CreateMode::Ephemeral], with a monotonically increasing,
    /// zero padded sequence number appended to the node name.
    EphemeralSequential,
}

impl CreateMode {
    #[inline]
    pub fn is_ephemeral(&self) -> bool {
        !matches!(self, Self::Persistent)
    }

    #[inline]
    pub fn is_sequential(&self) -> bool {
        matches!(self, Self::EphemeralSequential)
    }
}

#[derive(Debug, Copy, Clone, PartialEq, Eq)]
/// Which changes trigger a watch notification.
pub enum WatchScope {
    /// The watched node being created or deleted, or one of its
    /// direct children being created or deleted.
    Children,
    /// Any change to the watched node or anything beneath it.
    Subtree,
}

#[async_trait]
/// A session with the coordination service.
pub trait Coordinator: Send + Sync + 'static {
    /// Returns if a node exists at the given path.
    async fn exists(&self, path: &str) -> Result<bool, CoordError>;

    /// Creates a node at the given path, returning the path actually created.
    ///
    /// The parent node must already exist. For sequential nodes the returned
    /// path includes the assigned sequence suffix.
    async fn create(
        &self,
        path: &str,
        data: Option<Vec<u8>>,
        mode: CreateMode,
    ) -> Result<String, CoordError>;

    /// Deletes a leaf node.
    async fn delete(&self, path: &str) -> Result<(), CoordError>;

    /// Lists the names of the direct children of a node, sorted.
    async fn children(&self, path: &str) -> Result<Vec<String>, CoordError>;

    /// Reads the payload of a node.
    async fn data(&self, path: &str) -> Result<Option<Vec<u8>>, CoordError>;

    /// Registers a change watch on the given path.
    ///
    /// The path does not need to exist yet, it being created is reported as
    /// a change. The watch is released when the returned watcher is dropped
    /// or the session closes.
    fn watch(&self, path: &str, scope: WatchScope) -> Result<TreeWatcher, CoordError>;

    /// Closes the session, removing any ephemeral nodes it owns.
    ///
    /// Closing an already closed session is a no-op.
    async fn close(&self);
}

/// A handle to a registered watch.
///
/// Notifications carry no payload, a receiver is expected to re-read the
/// current state of the registry. Several changes which happen before the
/// receiver observes them are reported as a single notification.
pub struct TreeWatcher {
    path: String,
    scope: WatchScope,
    changes: watch::Receiver<u64>,
}

impl TreeWatcher {
    /// Creates a new watcher from the receiving end of a change counter.
    pub fn new(path: impl Into<String>, scope: WatchScope, changes: watch::Receiver<u64>) -> Self {
        Self {
            path: path.into(),
            scope,
            changes,
        }
    }

    #[inline]
    pub fn path(&self) -> &str {
        &self.path
    }

    #[inline]
    pub fn scope(&self) -> WatchScope {
        self.scope
    }

    /// The number of changes the watch has been notified of so far.
    pub fn version(&self) -> u64 {
        *self.changes.borrow()
    }

    /// Waits for the next change notification.
    ///
    /// Returns [CoordError::SessionClosed] once the watch has been released
    /// by the coordination service.
    pub async fn changed(&mut self) -> Result<(), CoordError> {
        self.changes
            .changed()
            .await
            .map_err(|_| CoordError::SessionClosed)
    }
}

/// Ensures the given path exists, creating any missing segments as persistent
/// nodes.
///
/// Another session creating a segment concurrently is not an error.
pub async fn ensure_path(coordinator: &dyn Coordinator, path: &str) -> Result<(), CoordError> {
    let path = path::normalize(path)?;
    if coordinator.exists(&path).await? {
        return Ok(());
    }

    let mut current = String::with_capacity(path.len());
    for segment in path::segments(&path) {
        current.push('/');
        current.push_str(segment);

        match coordinator
            .create(&current, None, CreateMode::Persistent)
            .await
        {
            Ok(_) | Err(CoordError::NodeExists(_)) => {},
            Err(e) => return Err(e),
        }
    }

    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn test_ensure_path_creates_segments() -> anyhow::Result<()> {
        let registry = MemoryRegistry::default();
        let session = registry.connect();

        ensure_path(&session, "zu/core/clusters").await?;
        assert!(session.exists("/zu").await?);
        assert!(session.exists("/zu/core").await?);
        assert!(session.exists("/zu/core/clusters").await?);

        // A second call, or a call racing with another session, is a no-op.
        let other = registry.connect();
        ensure_path(&other, "/zu/core/clusters").await?;
        ensure_path(&session, "/zu/core/clusters/extra").await?;
        assert_eq!(session.children("/zu/core/clusters").await?, vec!["extra"]);

        Ok(())
    }

    #[tokio::test]
    async fn test_ensure_path_rejects_bad_paths() {
        let registry = MemoryRegistry::default();
        let session = registry.connect();

        let err = ensure_path(&session, "/zu//clusters")
            .await
            .expect_err("Path should be rejected.");
        assert!(matches!(err, CoordError::InvalidPath { .. }));
    }
}
