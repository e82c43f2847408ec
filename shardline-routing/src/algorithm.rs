use std::collections::BTreeSet;
use std::sync::Arc;

use arc_swap::ArcSwap;
use shardline_cluster::{ClusterEventListener, ClusterView, Endpoint, Partition};
use tracing::trace;

/// Selects the endpoint which should serve a request.
///
/// Algorithms are registered as listeners of a
/// [Cluster](shardline_cluster::Cluster) and derive their routing state
/// from the views it publishes.
pub trait RoutingAlgorithm<T>: ClusterEventListener<T> {
    /// Picks an endpoint serving the given partition.
    ///
    /// Returns `None` if the partition is unknown or currently has no
    /// endpoints, in which case the partition cannot be served.
    fn route(&self, key: &[u8], partition: Partition) -> Option<Endpoint<T>>;

    /// The partitions known to the latest view.
    fn shards(&self) -> BTreeSet<Partition>;
}

/// The view a routing algorithm currently routes against.
///
/// Views are swapped in atomically, and a view older than the one already
/// held is ignored.
pub struct RoutingTable<T> {
    view: ArcSwap<ClusterView<T>>,
}

impl<T> Default for RoutingTable<T> {
    fn default() -> Self {
        Self {
            view: ArcSwap::from_pointee(ClusterView::empty(0)),
        }
    }
}

impl<T> RoutingTable<T> {
    #[inline]
    /// The view routed against.
    pub fn load(&self) -> Arc<ClusterView<T>> {
        self.view.load_full()
    }

    /// The partitions listed by the current view.
    pub fn shards(&self) -> BTreeSet<Partition> {
        self.view.load().partition_ids()
    }

    /// Replaces the view, returning if it was applied.
    pub fn update(&self, view: &Arc<ClusterView<T>>) -> bool {
        let mut current = self.view.load();
        loop {
            if view.generation() <= current.generation() {
                trace!(
                    current = current.generation(),
                    received = view.generation(),
                    "Ignoring stale view."
                );
                return false;
            }

            let previous = self.view.compare_and_swap(&*current, view.clone());
            if Arc::ptr_eq(&*previous, &*current) {
                return true;
            }
            current = previous;
        }
    }
}

#[cfg(test)]
mod tests {
    use shardline_cluster::Address;

    use super::*;

    fn view(generation: u64, partitions: &[Partition]) -> Arc<ClusterView<u16>> {
        let endpoint = Endpoint::new(Address::new("127.0.0.1", 1), 1);
        Arc::new(ClusterView::new(
            generation,
            partitions
                .iter()
                .map(|partition| (*partition, vec![endpoint.clone()])),
        ))
    }

    #[test]
    fn test_table_ignores_stale_views() {
        let table = RoutingTable::default();
        assert!(table.shards().is_empty());

        assert!(table.update(&view(2, &[0, 1])));
        assert_eq!(table.shards(), BTreeSet::from([0, 1]));

        assert!(!table.update(&view(1, &[5])), "Older views should be ignored.");
        assert!(!table.update(&view(2, &[5])), "Same generation should be ignored.");
        assert_eq!(table.load().generation(), 2);

        assert!(table.update(&view(3, &[])));
        assert!(table.shards().is_empty());
    }
}
