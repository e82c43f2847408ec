use std::collections::{BTreeMap, BTreeSet};
use std::fmt::Display;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::{Arc, Weak};
use std::time::Duration;

use arc_swap::ArcSwap;
use shardline_coord::{
    ensure_path,
    path,
    CoordError,
    Coordinator,
    CreateMode,
    TreeWatcher,
    WatchScope,
};
use tokio::sync::watch;
use tokio::task::JoinHandle;
use tokio_stream::wrappers::WatchStream;
use tracing::{debug, error, info, warn};

use crate::listener::{deliver, Listeners};
use crate::member::{MemberRecord, MEMBER_PREFIX};
use crate::registry::EndpointRegistry;
use crate::view::EndpointList;
use crate::{
    Address,
    ClusterError,
    ClusterEventListener,
    ClusterStatistics,
    ClusterView,
    Decorator,
    Endpoint,
    ListenerId,
    Partition,
    DEFAULT_NAMESPACE,
};

/// View generations are drawn from one sequence shared by every cluster in
/// the process, so the views of a re-created cluster always rank above the
/// final view of the cluster it replaces.
static GENERATIONS: AtomicU64 = AtomicU64::new(1);

fn next_generation() -> u64 {
    GENERATIONS.fetch_add(1, Ordering::SeqCst)
}

/// Configures and connects a [Cluster].
pub struct ClusterBuilder {
    coordinator: Arc<dyn Coordinator>,
    name: String,
    namespace: String,
    close_on_shutdown: bool,
}

impl ClusterBuilder {
    /// Creates a new builder for the cluster with the given name.
    pub fn new(coordinator: Arc<dyn Coordinator>, name: impl Into<String>) -> Self {
        Self {
            coordinator,
            name: name.into(),
            namespace: DEFAULT_NAMESPACE.to_string(),
            close_on_shutdown: false,
        }
    }

    /// Sets the path under which the cluster is registered.
    pub fn with_namespace(mut self, namespace: impl Display) -> Self {
        self.namespace = namespace.to_string();
        self
    }

    /// Close the coordination session when the cluster is shut down.
    ///
    /// Only enable this if the cluster is the sole user of the session.
    pub fn close_on_shutdown(mut self, close: bool) -> Self {
        self.close_on_shutdown = close;
        self
    }

    /// Starts watching the cluster.
    ///
    /// The membership is read once before returning, so the first view is
    /// immediately available. If that read fails the error is logged and
    /// the cluster starts with an empty view, which is corrected by the
    /// next change notification.
    pub async fn connect<D: Decorator>(
        self,
        decorator: Arc<D>,
    ) -> Result<Cluster<D>, ClusterError> {
        path::validate_segment(&self.name).map_err(|reason| ClusterError::InvalidName {
            name: self.name.clone(),
            reason,
        })?;

        let namespace = path::normalize(&self.namespace)?;
        let base_path = path::join(&namespace, &self.name);
        let watcher = self.coordinator.watch(&base_path, WatchScope::Subtree)?;

        let (changes, _) = watch::channel(Arc::new(ClusterView::empty(0)));
        let inner = Arc::new(ClusterInner {
            name: self.name,
            base_path,
            coordinator: self.coordinator,
            registry: EndpointRegistry::new(decorator),
            view: ArcSwap::from_pointee(ClusterView::empty(0)),
            listeners: Listeners::new(),
            changes,
            statistics: ClusterStatistics::default(),
            rebuild_lock: tokio::sync::Mutex::new(()),
            shutdown: AtomicBool::new(false),
            close_on_shutdown: self.close_on_shutdown,
            watch_task: parking_lot::Mutex::new(None),
        });

        if let Err(e) = inner.rebuild().await {
            error!(
                cluster = %inner.name,
                error = %e,
                "Failed to read the initial cluster membership, starting with an empty view.",
            );
        }

        let task = tokio::spawn(watch_cluster_changes(Arc::downgrade(&inner), watcher));
        *inner.watch_task.lock() = Some(task);

        info!(
            cluster = %inner.name,
            path = %inner.base_path,
            generation = inner.view.load().generation(),
            "Cluster connected."
        );

        Ok(Cluster { inner })
    }
}

/// A live, partitioned view of a named cluster.
///
/// The view is rebuilt whenever the membership recorded in the coordination
/// service changes. Readers always observe a complete view, either the one
/// before a change or the one after it. This handle is cheap to clone.
pub struct Cluster<D: Decorator> {
    inner: Arc<ClusterInner<D>>,
}

impl<D: Decorator> Clone for Cluster<D> {
    fn clone(&self) -> Self {
        Self {
            inner: self.inner.clone(),
        }
    }
}

impl<D: Decorator> Cluster<D> {
    #[inline]
    /// The name of the cluster.
    pub fn name(&self) -> &str {
        &self.inner.name
    }

    #[inline]
    /// The path of the cluster within the coordination service.
    pub fn path(&self) -> &str {
        &self.inner.base_path
    }

    #[inline]
    /// The current view of the cluster.
    pub fn view(&self) -> Arc<ClusterView<D::Endpoint>> {
        self.inner.view.load_full()
    }

    /// Gets a stream of published views, starting with the current one.
    ///
    /// Views published faster than the stream is consumed are skipped,
    /// the stream always yields the latest view.
    pub fn view_changes(&self) -> WatchStream<Arc<ClusterView<D::Endpoint>>> {
        WatchStream::new(self.inner.changes.subscribe())
    }

    /// Waits until the current view satisfies the predicate.
    ///
    /// Returns `None` if no such view is published within the timeout.
    pub async fn wait_for_view<F>(
        &self,
        timeout: Duration,
        mut predicate: F,
    ) -> Option<Arc<ClusterView<D::Endpoint>>>
    where
        F: FnMut(&ClusterView<D::Endpoint>) -> bool,
    {
        let mut changes = self.inner.changes.subscribe();
        let wait = async move {
            loop {
                let view = changes.borrow_and_update().clone();
                if predicate(&view) {
                    return Some(view);
                }

                if changes.changed().await.is_err() {
                    return None;
                }
            }
        };

        tokio::time::timeout(timeout, wait).await.ok().flatten()
    }

    /// Registers a listener for changes to the cluster.
    ///
    /// The listener is handed the current view straight away.
    pub fn add_listener(
        &self,
        listener: Arc<dyn ClusterEventListener<D::Endpoint>>,
    ) -> ListenerId {
        let id = self.inner.listeners.add(listener.clone());
        let view = self.view();
        deliver(&self.inner.name, id, "cluster_changed", || {
            listener.on_cluster_changed(&view)
        });
        id
    }

    /// Unregisters a listener, returning if it was registered.
    pub fn remove_listener(&self, id: ListenerId) -> bool {
        self.inner.listeners.remove(id)
    }

    #[inline]
    /// The number of registered listeners.
    pub fn num_listeners(&self) -> usize {
        self.inner.listeners.len()
    }

    #[inline]
    /// Gets the live cluster statistics.
    pub fn statistics(&self) -> ClusterStatistics {
        self.inner.statistics.clone()
    }

    #[inline]
    /// The cache of decorated endpoints.
    pub fn registry(&self) -> &EndpointRegistry<D> {
        &self.inner.registry
    }

    #[inline]
    pub fn decorator(&self) -> &Arc<D> {
        self.inner.registry.decorator()
    }

    /// Re-reads the membership and publishes a new view.
    pub async fn refresh(&self) -> Result<Arc<ClusterView<D::Endpoint>>, ClusterError> {
        self.inner.rebuild().await
    }

    /// Registers the given node as a member of the partitions.
    pub async fn join(
        &self,
        address: &Address,
        partitions: impl IntoIterator<Item = Partition>,
    ) -> Result<Membership, ClusterError> {
        self.join_with_metadata(address, partitions, Vec::new()).await
    }

    /// Registers the given node as a member of the partitions, attaching
    /// metadata which is passed to the decorator.
    ///
    /// A member node is created for each partition. The nodes belong to the
    /// coordination session and disappear when it closes. If any partition
    /// cannot be joined, the nodes already created are removed again.
    pub async fn join_with_metadata(
        &self,
        address: &Address,
        partitions: impl IntoIterator<Item = Partition>,
        metadata: Vec<u8>,
    ) -> Result<Membership, ClusterError> {
        if self.is_shutdown() {
            return Err(ClusterError::ShutDown);
        }

        let partitions = partitions.into_iter().collect::<BTreeSet<_>>();
        let payload = MemberRecord::new(address, metadata).encode()?;

        let mut membership = Membership {
            coordinator: self.inner.coordinator.clone(),
            address: address.clone(),
            nodes: Vec::with_capacity(partitions.len()),
        };
        for partition in partitions {
            match self.inner.register_member(partition, &payload).await {
                Ok(node) => membership.nodes.push((partition, node)),
                Err(e) => {
                    if let Err(cleanup) = membership.remove_nodes().await {
                        warn!(
                            cluster = %self.inner.name,
                            error = %cleanup,
                            "Failed to remove member nodes after a failed join.",
                        );
                    }
                    return Err(e);
                },
            }
        }

        info!(
            cluster = %self.inner.name,
            address = %address,
            partitions = ?membership.partitions(),
            "Joined cluster."
        );

        Ok(membership)
    }

    #[inline]
    pub fn is_shutdown(&self) -> bool {
        self.inner.shutdown.load(Ordering::SeqCst)
    }

    /// Stops watching the cluster and discards the view.
    ///
    /// Listeners are notified with a final, empty view. Calling this more
    /// than once is a no-op.
    pub async fn shutdown(&self) {
        if self.inner.shutdown.swap(true, Ordering::SeqCst) {
            return;
        }

        let task = self.inner.watch_task.lock().take();
        if let Some(task) = task {
            task.abort();
        }

        {
            let _guard = self.inner.rebuild_lock.lock().await;
            let previous = self.inner.view.load_full();
            let view = Arc::new(ClusterView::empty(next_generation()));
            self.inner.view.store(view.clone());

            let released = self.inner.registry.generation().commit();
            self.inner.publish(&previous, &view, 0, released);
        }

        if self.inner.close_on_shutdown {
            self.inner.coordinator.close().await;
        }

        info!(cluster = %self.inner.name, "Cluster shut down.");
    }
}

/// The partitions a node has joined.
///
/// Dropping the handle does not leave the cluster, the member nodes live
/// until [Membership::leave] is called or the coordination session closes.
pub struct Membership {
    coordinator: Arc<dyn Coordinator>,
    address: Address,
    nodes: Vec<(Partition, String)>,
}

impl Membership {
    #[inline]
    pub fn address(&self) -> &Address {
        &self.address
    }

    /// The joined partitions.
    pub fn partitions(&self) -> Vec<Partition> {
        self.nodes.iter().map(|(partition, _)| *partition).collect()
    }

    /// Removes the node from every joined partition.
    pub async fn leave(mut self) -> Result<(), ClusterError> {
        self.remove_nodes().await?;
        info!(address = %self.address, "Left cluster.");
        Ok(())
    }

    async fn remove_nodes(&mut self) -> Result<(), ClusterError> {
        while let Some((partition, node)) = self.nodes.pop() {
            match self.coordinator.delete(&node).await {
                Ok(()) | Err(CoordError::NoNode(_)) => {
                    debug!(partition = partition, node = %node, "Removed member node.");
                },
                Err(e) => {
                    self.nodes.push((partition, node));
                    return Err(e.into());
                },
            }
        }

        Ok(())
    }
}

struct ClusterInner<D: Decorator> {
    name: String,
    base_path: String,
    coordinator: Arc<dyn Coordinator>,
    registry: EndpointRegistry<D>,
    view: ArcSwap<ClusterView<D::Endpoint>>,
    listeners: Listeners<D::Endpoint>,
    changes: watch::Sender<Arc<ClusterView<D::Endpoint>>>,
    statistics: ClusterStatistics,
    rebuild_lock: tokio::sync::Mutex<()>,
    shutdown: AtomicBool,
    close_on_shutdown: bool,
    watch_task: parking_lot::Mutex<Option<JoinHandle<()>>>,
}

impl<D: Decorator> ClusterInner<D> {
    fn is_shutdown(&self) -> bool {
        self.shutdown.load(Ordering::SeqCst)
    }

    async fn rebuild(&self) -> Result<Arc<ClusterView<D::Endpoint>>, ClusterError> {
        let _guard = self.rebuild_lock.lock().await;
        if self.is_shutdown() {
            return Err(ClusterError::ShutDown);
        }

        let members = read_members(self.coordinator.as_ref(), &self.base_path).await?;

        let mut generation = self.registry.generation();
        let mut partitions = BTreeMap::new();
        for (partition, records) in members {
            let mut endpoints = EndpointList::new();
            for record in records {
                let address = record.address();
                if endpoints
                    .iter()
                    .any(|endpoint: &Endpoint<D::Endpoint>| endpoint.address() == &address)
                {
                    continue;
                }

                if let Some(endpoint) = generation.resolve(&address, &record.metadata) {
                    endpoints.push(endpoint);
                }
            }
            partitions.insert(partition, endpoints);
        }

        let failures = generation.failures();
        let released = generation.commit();

        let previous = self.view.load_full();
        let view = Arc::new(ClusterView::from_lists(next_generation(), partitions));
        self.view.store(view.clone());

        info!(
            cluster = %self.name,
            generation = view.generation(),
            num_partitions = view.len(),
            num_nodes = view.num_nodes(),
            "Published cluster view."
        );

        self.publish(&previous, &view, failures, released);
        Ok(view)
    }

    /// Notifies everyone interested of a view which has just been stored.
    fn publish(
        &self,
        previous: &ClusterView<D::Endpoint>,
        view: &Arc<ClusterView<D::Endpoint>>,
        failures: usize,
        released: Vec<Endpoint<D::Endpoint>>,
    ) {
        self.statistics
            .num_partitions
            .store(view.len() as u64, Ordering::Relaxed);
        self.statistics
            .num_nodes
            .store(view.num_nodes() as u64, Ordering::Relaxed);
        self.statistics.num_rebuilds.fetch_add(1, Ordering::Relaxed);
        self.statistics
            .num_decorate_failures
            .fetch_add(failures as u64, Ordering::Relaxed);

        self.changes.send_replace(view.clone());

        let removed = view.removed_since(previous);
        if !removed.is_empty() {
            debug!(cluster = %self.name, removed = ?removed, "Nodes left the cluster.");
            self.listeners.notify_removed(&self.name, &removed);
        }
        self.listeners.notify_changed(&self.name, view);

        for endpoint in released {
            self.registry.decorator().release(endpoint);
        }
    }

    async fn register_member(
        &self,
        partition: Partition,
        payload: &[u8],
    ) -> Result<String, ClusterError> {
        let partition_path = path::join(&self.base_path, &partition.to_string());
        ensure_path(self.coordinator.as_ref(), &partition_path).await?;

        let node = self
            .coordinator
            .create(
                &path::join(&partition_path, MEMBER_PREFIX),
                Some(payload.to_vec()),
                CreateMode::EphemeralSequential,
            )
            .await?;

        Ok(node)
    }
}

impl<D: Decorator> Drop for ClusterInner<D> {
    fn drop(&mut self) {
        if let Some(task) = self.watch_task.get_mut().take() {
            task.abort();
        }
    }
}

/// Reads every member record of the cluster, grouped by partition.
///
/// Records keep the order of their member nodes. Nodes which cannot be
/// understood are logged and skipped.
async fn read_members(
    coordinator: &dyn Coordinator,
    base_path: &str,
) -> Result<BTreeMap<Partition, Vec<MemberRecord>>, ClusterError> {
    let children = match coordinator.children(base_path).await {
        Ok(children) => children,
        Err(CoordError::NoNode(_)) => return Ok(BTreeMap::new()),
        Err(e) => return Err(e.into()),
    };

    let mut members = BTreeMap::new();
    for child in children {
        let partition = match child.parse::<Partition>() {
            Ok(partition) => partition,
            Err(_) => {
                warn!(path = %base_path, node = %child, "Ignoring non-partition node.");
                continue;
            },
        };

        let partition_path = path::join(base_path, &child);
        let nodes = match coordinator.children(&partition_path).await {
            Ok(nodes) => nodes,
            Err(CoordError::NoNode(_)) => continue,
            Err(e) => return Err(e.into()),
        };

        let mut records = Vec::with_capacity(nodes.len());
        for node in nodes {
            let member_path = path::join(&partition_path, &node);
            match coordinator.data(&member_path).await {
                Ok(Some(data)) => match MemberRecord::decode(&member_path, &data) {
                    Ok(record) => records.push(record),
                    Err(e) => warn!(error = %e, "Skipping member node."),
                },
                Ok(None) => warn!(path = %member_path, "Skipping member node without payload."),
                // The member left while the partition was being read.
                Err(CoordError::NoNode(_)) => {},
                Err(e) => return Err(e.into()),
            }
        }

        members.insert(partition, records);
    }

    Ok(members)
}

/// Rebuilds the view each time the cluster's subtree changes.
///
/// Notifications arriving during a rebuild are coalesced into one
/// follow-up rebuild.
async fn watch_cluster_changes<D: Decorator>(
    inner: Weak<ClusterInner<D>>,
    mut watcher: TreeWatcher,
) {
    loop {
        if let Err(e) = watcher.changed().await {
            info!(path = %watcher.path(), error = %e, "Cluster watch closed.");
            break;
        }

        let inner = match inner.upgrade() {
            Some(inner) => inner,
            None => break,
        };

        if inner.is_shutdown() {
            break;
        }

        debug!(cluster = %inner.name, version = watcher.version(), "Cluster membership changed.");
        match inner.rebuild().await {
            Ok(_) | Err(ClusterError::ShutDown) => {},
            Err(e) => {
                error!(
                    cluster = %inner.name,
                    error = %e,
                    "Failed to rebuild cluster view, keeping the previous view.",
                );
            },
        }
    }
}

#[cfg(test)]
mod tests {
    use shardline_coord::MemoryRegistry;

    use super::*;
    use crate::test_utils::{local_addr, RecordingListener, TestDecorator};

    #[tokio::test]
    async fn test_rejects_invalid_names() {
        let registry = MemoryRegistry::default();
        let coordinator: Arc<dyn Coordinator> = Arc::new(registry.connect());

        for name in ["", "a/b", "."] {
            let result = ClusterBuilder::new(coordinator.clone(), name)
                .connect(Arc::new(TestDecorator::default()))
                .await;
            assert!(
                matches!(result, Err(ClusterError::InvalidName { .. })),
                "Name {name:?} should be rejected.",
            );
        }
    }

    #[tokio::test]
    async fn test_join_orders_and_dedupes_members() -> anyhow::Result<()> {
        let registry = MemoryRegistry::default();
        let coordinator: Arc<dyn Coordinator> = Arc::new(registry.connect());
        let cluster = ClusterBuilder::new(coordinator, "search")
            .connect(Arc::new(TestDecorator::default()))
            .await?;

        let _b = cluster.join(&local_addr(2), [0]).await?;
        let _a = cluster.join(&local_addr(1), [0]).await?;
        let _a_again = cluster.join(&local_addr(1), [0]).await?;

        let view = cluster.refresh().await?;
        let addresses = view
            .endpoints(0)
            .iter()
            .map(|endpoint| endpoint.address().port())
            .collect::<Vec<_>>();
        assert_eq!(addresses, vec![2, 1], "Members should be listed in join order once.");

        Ok(())
    }

    #[tokio::test]
    async fn test_listener_receives_current_view() -> anyhow::Result<()> {
        let registry = MemoryRegistry::default();
        let coordinator: Arc<dyn Coordinator> = Arc::new(registry.connect());
        let cluster = ClusterBuilder::new(coordinator, "search")
            .with_namespace("/tests")
            .connect(Arc::new(TestDecorator::default()))
            .await?;
        assert_eq!(cluster.path(), "/tests/search");

        let _member = cluster.join(&local_addr(1), [0, 1]).await?;
        let view = cluster.refresh().await?;

        let listener = Arc::new(RecordingListener::default());
        let id = cluster.add_listener(listener.clone());
        let delivered = listener.last_view().expect("View should be delivered immediately.");
        assert_eq!(delivered.generation(), view.generation());
        assert_eq!(cluster.num_listeners(), 1);

        assert!(cluster.remove_listener(id));
        assert_eq!(cluster.num_listeners(), 0);

        Ok(())
    }

    #[tokio::test]
    async fn test_recreated_cluster_supersedes_shut_down_views() -> anyhow::Result<()> {
        let registry = MemoryRegistry::default();
        let coordinator: Arc<dyn Coordinator> = Arc::new(registry.connect());

        let old = ClusterBuilder::new(coordinator.clone(), "search")
            .connect(Arc::new(TestDecorator::default()))
            .await?;
        let _member = old.join(&local_addr(1), [0]).await?;
        old.refresh().await?;
        old.shutdown().await;
        let final_generation = old.view().generation();

        let new = ClusterBuilder::new(coordinator, "search")
            .connect(Arc::new(TestDecorator::default()))
            .await?;
        let view = new.view();
        assert_eq!(view.partition_ids().into_iter().collect::<Vec<_>>(), vec![0]);
        assert!(
            view.generation() > final_generation,
            "A new cluster must not reuse generations of the one it replaces.",
        );

        Ok(())
    }

    #[tokio::test]
    async fn test_join_fails_after_shutdown() -> anyhow::Result<()> {
        let registry = MemoryRegistry::default();
        let coordinator: Arc<dyn Coordinator> = Arc::new(registry.connect());
        let cluster = ClusterBuilder::new(coordinator, "search")
            .connect(Arc::new(TestDecorator::default()))
            .await?;

        cluster.shutdown().await;
        let result = cluster.join(&local_addr(1), [0]).await;
        assert!(matches!(result, Err(ClusterError::ShutDown)));
        assert!(matches!(cluster.refresh().await, Err(ClusterError::ShutDown)));

        Ok(())
    }
}
