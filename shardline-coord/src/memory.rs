use std::collections::{BTreeMap, HashMap};
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::Arc;

use async_trait::async_trait;
use parking_lot::Mutex;
use tokio::sync::watch;
use tracing::{debug, info, trace};

use crate::path::{self, ROOT};
use crate::{CoordError, Coordinator, CreateMode, TreeWatcher, WatchScope};

type SessionId = u64;

#[derive(Clone, Default)]
/// An in-process coordination registry.
///
/// The registry plays the role of the coordination server, sessions are
/// opened against it with [MemoryRegistry::connect]. This handle is cheap
/// to clone.
pub struct MemoryRegistry {
    inner: Arc<RegistryInner>,
}

#[derive(Default)]
struct RegistryInner {
    tree: Mutex<Tree>,
    next_session: AtomicU64,
    unavailable: AtomicBool,
}

impl MemoryRegistry {
    /// Opens a new session against the registry.
    pub fn connect(&self) -> MemoryCoordinator {
        let session = self.inner.next_session.fetch_add(1, Ordering::Relaxed) + 1;
        debug!(session = session, "Opened coordination session.");
        MemoryCoordinator {
            registry: self.clone(),
            session,
            closed: AtomicBool::new(false),
        }
    }

    /// Simulates the registry becoming unreachable.
    ///
    /// While unavailable every operation fails with [CoordError::Unavailable].
    pub fn set_available(&self, available: bool) {
        self.inner.unavailable.store(!available, Ordering::Relaxed);
    }

    /// The total number of nodes stored, excluding the root.
    pub fn num_nodes(&self) -> usize {
        self.inner.tree.lock().nodes.len()
    }

    /// The number of watches which are still registered.
    pub fn num_watches(&self) -> usize {
        let mut tree = self.inner.tree.lock();
        tree.prune_watches();
        tree.watches.len()
    }

    fn check_available(&self) -> Result<(), CoordError> {
        if self.inner.unavailable.load(Ordering::Relaxed) {
            Err(CoordError::Unavailable("registry is not reachable".to_string()))
        } else {
            Ok(())
        }
    }
}

struct Node {
    data: Option<Vec<u8>>,
    owner: Option<SessionId>,
}

struct WatchEntry {
    path: String,
    scope: WatchScope,
    session: SessionId,
    tx: watch::Sender<u64>,
}

impl WatchEntry {
    fn matches(&self, changed: &str) -> bool {
        match self.scope {
            WatchScope::Subtree => path::is_within(&self.path, changed),
            WatchScope::Children => {
                changed == self.path || path::parent(changed) == Some(self.path.as_str())
            },
        }
    }
}

#[derive(Default)]
struct Tree {
    nodes: BTreeMap<String, Node>,
    sequences: HashMap<String, u64>,
    watches: Vec<WatchEntry>,
}

impl Tree {
    fn contains(&self, path: &str) -> bool {
        path == ROOT || self.nodes.contains_key(path)
    }

    fn children(&self, path: &str) -> Result<Vec<String>, CoordError> {
        if !self.contains(path) {
            return Err(CoordError::NoNode(path.to_string()));
        }

        let prefix = if path == ROOT {
            ROOT.to_string()
        } else {
            format!("{}/", path)
        };

        let children = self
            .nodes
            .range(prefix.clone()..)
            .map(|(key, _)| key)
            .take_while(|key| key.starts_with(&prefix))
            .filter_map(|key| {
                let rest = &key[prefix.len()..];
                (!rest.contains('/')).then(|| rest.to_string())
            })
            .collect();

        Ok(children)
    }

    fn has_children(&self, path: &str) -> bool {
        let prefix = format!("{}/", path);
        self.nodes
            .range(prefix.clone()..)
            .next()
            .map(|(key, _)| key.starts_with(&prefix))
            .unwrap_or(false)
    }

    fn create(
        &mut self,
        path: &str,
        data: Option<Vec<u8>>,
        mode: CreateMode,
        session: SessionId,
    ) -> Result<String, CoordError> {
        let parent = match path::parent(path) {
            Some(parent) => parent,
            None => return Err(CoordError::NodeExists(path.to_string())),
        };

        if !self.contains(parent) {
            return Err(CoordError::NoNode(parent.to_string()));
        }

        if self
            .nodes
            .get(parent)
            .map(|node| node.owner.is_some())
            .unwrap_or(false)
        {
            return Err(CoordError::NoChildrenForEphemerals(parent.to_string()));
        }

        let path = if mode.is_sequential() {
            let counter = self.sequences.entry(parent.to_string()).or_default();
            let sequence = *counter;
            *counter += 1;
            format!("{}{:010}", path, sequence)
        } else {
            path.to_string()
        };

        if self.nodes.contains_key(&path) {
            return Err(CoordError::NodeExists(path));
        }

        let owner = mode.is_ephemeral().then_some(session);
        self.nodes.insert(path.clone(), Node { data, owner });
        self.notify(&path);

        Ok(path)
    }

    fn delete(&mut self, path: &str) -> Result<(), CoordError> {
        if !self.nodes.contains_key(path) {
            return Err(CoordError::NoNode(path.to_string()));
        }

        if self.has_children(path) {
            return Err(CoordError::NotEmpty(path.to_string()));
        }

        self.nodes.remove(path);
        self.notify(path);
        Ok(())
    }

    fn close_session(&mut self, session: SessionId) {
        let owned = self
            .nodes
            .iter()
            .filter(|(_, node)| node.owner == Some(session))
            .map(|(key, _)| key.clone())
            .collect::<Vec<_>>();

        for path in owned {
            self.nodes.remove(&path);
            self.notify(&path);
        }

        // Dropping the senders wakes the watchers with an error.
        self.watches.retain(|entry| entry.session != session);
    }

    fn register_watch(
        &mut self,
        path: &str,
        scope: WatchScope,
        session: SessionId,
    ) -> watch::Receiver<u64> {
        self.prune_watches();

        let (tx, rx) = watch::channel(0);
        self.watches.push(WatchEntry {
            path: path.to_string(),
            scope,
            session,
            tx,
        });
        rx
    }

    fn notify(&mut self, changed: &str) {
        self.prune_watches();

        for entry in self.watches.iter().filter(|entry| entry.matches(changed)) {
            trace!(watch_path = %entry.path, changed = %changed, "Notifying watch.");
            entry.tx.send_modify(|version| *version += 1);
        }
    }

    fn prune_watches(&mut self) {
        self.watches.retain(|entry| !entry.tx.is_closed());
    }
}

/// A session opened against a [MemoryRegistry].
///
/// Dropping the session closes it, which behaves like the session expiring.
pub struct MemoryCoordinator {
    registry: MemoryRegistry,
    session: SessionId,
    closed: AtomicBool,
}

impl MemoryCoordinator {
    #[inline]
    /// The unique ID of this session.
    pub fn session_id(&self) -> u64 {
        self.session
    }

    #[inline]
    /// Returns if the session has been closed.
    pub fn is_closed(&self) -> bool {
        self.closed.load(Ordering::Relaxed)
    }

    #[inline]
    /// The registry this session belongs to.
    pub fn registry(&self) -> &MemoryRegistry {
        &self.registry
    }

    fn check(&self) -> Result<(), CoordError> {
        if self.is_closed() {
            return Err(CoordError::SessionClosed);
        }
        self.registry.check_available()
    }

    fn close_session(&self) {
        if self.closed.swap(true, Ordering::Relaxed) {
            return;
        }

        info!(session = self.session, "Closing coordination session.");
        self.registry.inner.tree.lock().close_session(self.session);
    }
}

impl Drop for MemoryCoordinator {
    fn drop(&mut self) {
        self.close_session();
    }
}

#[async_trait]
impl Coordinator for MemoryCoordinator {
    async fn exists(&self, path: &str) -> Result<bool, CoordError> {
        self.check()?;
        let path = path::normalize(path)?;
        Ok(self.registry.inner.tree.lock().contains(&path))
    }

    async fn create(
        &self,
        path: &str,
        data: Option<Vec<u8>>,
        mode: CreateMode,
    ) -> Result<String, CoordError> {
        self.check()?;
        let path = path::normalize(path)?;
        let created =
            self.registry
                .inner
                .tree
                .lock()
                .create(&path, data, mode, self.session)?;

        trace!(session = self.session, path = %created, mode = ?mode, "Created node.");
        Ok(created)
    }

    async fn delete(&self, path: &str) -> Result<(), CoordError> {
        self.check()?;
        let path = path::normalize(path)?;
        self.registry.inner.tree.lock().delete(&path)?;

        trace!(session = self.session, path = %path, "Deleted node.");
        Ok(())
    }

    async fn children(&self, path: &str) -> Result<Vec<String>, CoordError> {
        self.check()?;
        let path = path::normalize(path)?;
        self.registry.inner.tree.lock().children(&path)
    }

    async fn data(&self, path: &str) -> Result<Option<Vec<u8>>, CoordError> {
        self.check()?;
        let path = path::normalize(path)?;
        let tree = self.registry.inner.tree.lock();
        match tree.nodes.get(&path) {
            Some(node) => Ok(node.data.clone()),
            None if path == ROOT => Ok(None),
            None => Err(CoordError::NoNode(path)),
        }
    }

    fn watch(&self, path: &str, scope: WatchScope) -> Result<TreeWatcher, CoordError> {
        self.check()?;
        let path = path::normalize(path)?;
        let rx = self
            .registry
            .inner
            .tree
            .lock()
            .register_watch(&path, scope, self.session);

        debug!(session = self.session, path = %path, scope = ?scope, "Registered watch.");
        Ok(TreeWatcher::new(path, scope, rx))
    }

    async fn close(&self) {
        self.close_session();
    }
}
