use std::any::Any;
use std::collections::BTreeMap;
use std::panic::{self, AssertUnwindSafe};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;

use parking_lot::RwLock;
use tracing::error;

use crate::{Address, ClusterView};

/// Receives the changes of a cluster.
///
/// Callbacks are invoked from the task which rebuilds the view, so they
/// should return quickly.
pub trait ClusterEventListener<T>: Send + Sync + 'static {
    /// A new view has been published.
    fn on_cluster_changed(&self, view: &Arc<ClusterView<T>>);

    /// Nodes have left every partition of the cluster.
    ///
    /// This is invoked after the new view is published and before
    /// [ClusterEventListener::on_cluster_changed] is called with it.
    fn on_nodes_removed(&self, _removed: &[Address]) {}
}

#[derive(Debug, Copy, Clone, PartialEq, Eq, Hash, PartialOrd, Ord)]
/// Identifies a registered listener.
pub struct ListenerId(u64);

type SharedListener<T> = Arc<dyn ClusterEventListener<T>>;

pub(crate) struct Listeners<T> {
    next_id: AtomicU64,
    listeners: RwLock<BTreeMap<ListenerId, SharedListener<T>>>,
}

impl<T: 'static> Listeners<T> {
    pub(crate) fn new() -> Self {
        Self {
            next_id: AtomicU64::new(0),
            listeners: RwLock::new(BTreeMap::new()),
        }
    }

    pub(crate) fn add(&self, listener: SharedListener<T>) -> ListenerId {
        let id = ListenerId(self.next_id.fetch_add(1, Ordering::Relaxed));
        self.listeners.write().insert(id, listener);
        id
    }

    pub(crate) fn remove(&self, id: ListenerId) -> bool {
        self.listeners.write().remove(&id).is_some()
    }

    pub(crate) fn len(&self) -> usize {
        self.listeners.read().len()
    }

    pub(crate) fn notify_changed(&self, cluster: &str, view: &Arc<ClusterView<T>>) {
        for (id, listener) in self.snapshot() {
            deliver(cluster, id, "cluster_changed", || listener.on_cluster_changed(view));
        }
    }

    pub(crate) fn notify_removed(&self, cluster: &str, removed: &[Address]) {
        for (id, listener) in self.snapshot() {
            deliver(cluster, id, "nodes_removed", || listener.on_nodes_removed(removed));
        }
    }

    /// Copies the listeners so callbacks run without holding the lock.
    fn snapshot(&self) -> Vec<(ListenerId, SharedListener<T>)> {
        self.listeners
            .read()
            .iter()
            .map(|(id, listener)| (*id, listener.clone()))
            .collect()
    }
}

/// Invokes a listener callback, containing any panic it raises.
pub(crate) fn deliver(cluster: &str, id: ListenerId, event: &str, callback: impl FnOnce()) {
    if let Err(panic) = panic::catch_unwind(AssertUnwindSafe(callback)) {
        error!(
            cluster = %cluster,
            listener_id = id.0,
            event = event,
            reason = %panic_reason(&*panic),
            "Cluster listener panicked while handling event.",
        );
    }
}

fn panic_reason(panic: &(dyn Any + Send)) -> &str {
    if let Some(reason) = panic.downcast_ref::<&'static str>() {
        reason
    } else if let Some(reason) = panic.downcast_ref::<String>() {
        reason.as_str()
    } else {
        "unknown"
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::test_utils::RecordingListener;

    struct PanickingListener;

    impl ClusterEventListener<u16> for PanickingListener {
        fn on_cluster_changed(&self, _view: &Arc<ClusterView<u16>>) {
            panic!("listener bug");
        }
    }

    #[test]
    fn test_panicking_listener_is_contained() {
        let listeners = Listeners::<u16>::new();
        let recorder = Arc::new(RecordingListener::default());

        listeners.add(Arc::new(PanickingListener));
        let id = listeners.add(recorder.clone());
        assert_eq!(listeners.len(), 2);

        let view = Arc::new(ClusterView::empty(1));
        listeners.notify_changed("test", &view);
        assert_eq!(recorder.views().len(), 1, "Other listeners should still be notified.");

        assert!(listeners.remove(id));
        assert!(!listeners.remove(id));
        listeners.notify_changed("test", &view);
        assert_eq!(recorder.views().len(), 1);
    }
}
