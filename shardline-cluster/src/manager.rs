use std::collections::{BTreeMap, BTreeSet};
use std::fmt::Display;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Weak};

use arc_swap::ArcSwap;
use shardline_coord::{ensure_path, path, CoordError, Coordinator, TreeWatcher, WatchScope};
use tokio::task::JoinHandle;
use tracing::{debug, error, info, warn};

use crate::{Cluster, ClusterBuilder, ClusterError, Decorator, DEFAULT_NAMESPACE};

/// Configures and connects a [ClusterManager].
pub struct ClusterManagerBuilder {
    coordinator: Arc<dyn Coordinator>,
    namespace: String,
    close_on_shutdown: bool,
}

impl ClusterManagerBuilder {
    pub fn new(coordinator: Arc<dyn Coordinator>) -> Self {
        Self {
            coordinator,
            namespace: DEFAULT_NAMESPACE.to_string(),
            close_on_shutdown: false,
        }
    }

    /// Sets the path under which clusters are registered.
    ///
    /// Defaults to [DEFAULT_NAMESPACE].
    pub fn with_namespace(mut self, namespace: impl Display) -> Self {
        self.namespace = namespace.to_string();
        self
    }

    /// Close the coordination session once the manager is shut down.
    ///
    /// Enable this when the session was opened for the manager alone.
    pub fn close_on_shutdown(mut self, close: bool) -> Self {
        self.close_on_shutdown = close;
        self
    }

    /// Starts the manager, connecting to every cluster in the namespace.
    ///
    /// The namespace is created if it does not exist yet.
    pub async fn connect<D: Decorator>(
        self,
        decorator: Arc<D>,
    ) -> Result<ClusterManager<D>, ClusterError> {
        let namespace = path::normalize(&self.namespace)?;

        if let Err(e) = ensure_path(self.coordinator.as_ref(), &namespace).await {
            error!(
                namespace = %namespace,
                error = %e,
                "Failed to create the cluster namespace.",
            );
        }

        let watcher = self.coordinator.watch(&namespace, WatchScope::Children)?;

        let inner = Arc::new(ManagerInner {
            namespace,
            coordinator: self.coordinator,
            decorator,
            clusters: parking_lot::RwLock::new(BTreeMap::new()),
            names: ArcSwap::from_pointee(BTreeSet::new()),
            close_on_shutdown: self.close_on_shutdown,
            shutdown: AtomicBool::new(false),
            refresh_lock: tokio::sync::Mutex::new(()),
            watch_task: parking_lot::Mutex::new(None),
        });

        if let Err(e) = inner.refresh().await {
            error!(
                namespace = %inner.namespace,
                error = %e,
                "Failed to list the initial clusters.",
            );
        }

        let task = tokio::spawn(watch_namespace_changes(Arc::downgrade(&inner), watcher));
        *inner.watch_task.lock() = Some(task);

        info!(
            namespace = %inner.namespace,
            num_clusters = inner.names.load().len(),
            "Cluster manager connected."
        );

        Ok(ClusterManager { inner })
    }
}

/// Keeps a [Cluster] for every cluster registered in a namespace.
///
/// Clusters appearing in the namespace are connected, and clusters which
/// disappear from it are shut down and discarded. This handle is cheap
/// to clone.
pub struct ClusterManager<D: Decorator> {
    inner: Arc<ManagerInner<D>>,
}

impl<D: Decorator> Clone for ClusterManager<D> {
    fn clone(&self) -> Self {
        Self {
            inner: self.inner.clone(),
        }
    }
}

impl<D: Decorator> ClusterManager<D> {
    /// Connects a manager using the default settings.
    pub async fn connect(
        coordinator: Arc<dyn Coordinator>,
        decorator: Arc<D>,
    ) -> Result<Self, ClusterError> {
        ClusterManagerBuilder::new(coordinator)
            .connect(decorator)
            .await
    }

    #[inline]
    /// The normalized namespace path.
    pub fn namespace(&self) -> &str {
        &self.inner.namespace
    }

    /// Gets the cluster with the given name, if it is currently held.
    pub fn cluster(&self, name: &str) -> Option<Cluster<D>> {
        self.inner.clusters.read().get(name).cloned()
    }

    /// The names of the clusters currently held.
    pub fn available_clusters(&self) -> Arc<BTreeSet<String>> {
        self.inner.names.load_full()
    }

    /// Re-lists the namespace and reconciles the held clusters with it.
    pub async fn refresh(&self) -> Result<(), ClusterError> {
        self.inner.refresh().await
    }

    #[inline]
    pub fn is_shutdown(&self) -> bool {
        self.inner.shutdown.load(Ordering::SeqCst)
    }

    /// Shuts down every held cluster.
    ///
    /// The coordination session is only closed if the manager was configured
    /// to own it. Calling this more than once is a no-op.
    pub async fn shutdown(&self) {
        if self.inner.shutdown.swap(true, Ordering::SeqCst) {
            return;
        }

        {
            // A running refresh finishes shutting down the clusters it removed.
            let _guard = self.inner.refresh_lock.lock().await;
            let task = self.inner.watch_task.lock().take();
            if let Some(task) = task {
                task.abort();
            }

            let clusters = std::mem::take(&mut *self.inner.clusters.write());
            self.inner.names.store(Arc::new(BTreeSet::new()));
            for cluster in clusters.values() {
                cluster.shutdown().await;
            }
        }

        if self.inner.close_on_shutdown {
            self.inner.coordinator.close().await;
        }

        info!(namespace = %self.inner.namespace, "Cluster manager shut down.");
    }
}

struct ManagerInner<D: Decorator> {
    namespace: String,
    coordinator: Arc<dyn Coordinator>,
    decorator: Arc<D>,
    clusters: parking_lot::RwLock<BTreeMap<String, Cluster<D>>>,
    names: ArcSwap<BTreeSet<String>>,
    close_on_shutdown: bool,
    shutdown: AtomicBool,
    refresh_lock: tokio::sync::Mutex<()>,
    watch_task: parking_lot::Mutex<Option<JoinHandle<()>>>,
}

impl<D: Decorator> ManagerInner<D> {
    async fn refresh(&self) -> Result<(), ClusterError> {
        let _guard = self.refresh_lock.lock().await;
        if self.shutdown.load(Ordering::SeqCst) {
            return Err(ClusterError::ShutDown);
        }

        let listed = match self.coordinator.children(&self.namespace).await {
            Ok(children) => children.into_iter().collect::<BTreeSet<_>>(),
            Err(CoordError::NoNode(_)) => BTreeSet::new(),
            Err(e) => return Err(e.into()),
        };

        let held = self.clusters.read().keys().cloned().collect::<BTreeSet<_>>();

        let removed = {
            let mut clusters = self.clusters.write();
            held.difference(&listed)
                .filter_map(|name| clusters.remove(name))
                .collect::<Vec<_>>()
        };
        for cluster in removed {
            info!(namespace = %self.namespace, cluster = %cluster.name(), "Cluster removed.");
            cluster.shutdown().await;
        }

        for name in listed.difference(&held) {
            let result = ClusterBuilder::new(self.coordinator.clone(), name.as_str())
                .with_namespace(&self.namespace)
                .connect(self.decorator.clone())
                .await;

            match result {
                Ok(cluster) => {
                    info!(namespace = %self.namespace, cluster = %name, "Cluster added.");
                    self.clusters.write().insert(name.clone(), cluster);
                },
                Err(e) => {
                    error!(
                        namespace = %self.namespace,
                        cluster = %name,
                        error = %e,
                        "Failed to connect to cluster, it will be retried on the next change.",
                    );
                },
            }
        }

        let names = self.clusters.read().keys().cloned().collect::<BTreeSet<_>>();
        debug!(namespace = %self.namespace, clusters = ?names, "Published available clusters.");
        self.names.store(Arc::new(names));

        Ok(())
    }
}

impl<D: Decorator> Drop for ManagerInner<D> {
    fn drop(&mut self) {
        if let Some(task) = self.watch_task.get_mut().take() {
            task.abort();
        }
    }
}

/// Reconciles the held clusters each time the namespace's children change.
async fn watch_namespace_changes<D: Decorator>(
    inner: Weak<ManagerInner<D>>,
    mut watcher: TreeWatcher,
) {
    loop {
        if let Err(e) = watcher.changed().await {
            info!(path = %watcher.path(), error = %e, "Namespace watch closed.");
            break;
        }

        let inner = match inner.upgrade() {
            Some(inner) => inner,
            None => break,
        };

        match inner.refresh().await {
            Ok(()) => {},
            Err(ClusterError::ShutDown) => break,
            Err(e) => {
                warn!(
                    namespace = %inner.namespace,
                    error = %e,
                    "Failed to refresh the cluster list.",
                );
            },
        }
    }
}
