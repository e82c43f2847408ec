use std::collections::{BTreeSet, HashMap};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;

use parking_lot::RwLock;
use shardline_cluster::{ClusterEventListener, ClusterView, Endpoint, Partition};

use crate::{RoutingAlgorithm, RoutingTable};

/// Cycles through the endpoints of each partition in view order.
///
/// Every partition has its own counter, which starts at zero the first
/// time the partition is routed to and is kept across view changes.
pub struct RoundRobinAlgorithm<T> {
    table: RoutingTable<T>,
    counters: RwLock<HashMap<Partition, AtomicU64>>,
}

impl<T> RoundRobinAlgorithm<T> {
    pub fn new() -> Self {
        Self {
            table: RoutingTable::default(),
            counters: RwLock::new(HashMap::new()),
        }
    }

    fn next_count(&self, partition: Partition) -> u64 {
        if let Some(counter) = self.counters.read().get(&partition) {
            return counter.fetch_add(1, Ordering::Relaxed);
        }

        self.counters
            .write()
            .entry(partition)
            .or_default()
            .fetch_add(1, Ordering::Relaxed)
    }
}

impl<T> Default for RoundRobinAlgorithm<T> {
    fn default() -> Self {
        Self::new()
    }
}

impl<T: Send + Sync + 'static> ClusterEventListener<T> for RoundRobinAlgorithm<T> {
    fn on_cluster_changed(&self, view: &Arc<ClusterView<T>>) {
        self.table.update(view);
    }
}

impl<T: Send + Sync + 'static> RoutingAlgorithm<T> for RoundRobinAlgorithm<T> {
    fn route(&self, _key: &[u8], partition: Partition) -> Option<Endpoint<T>> {
        let view = self.table.load();
        let endpoints = view.endpoints(partition);
        if endpoints.is_empty() {
            return None;
        }

        let idx = self.next_count(partition) % endpoints.len() as u64;
        Some(endpoints[idx as usize].clone())
    }

    fn shards(&self) -> BTreeSet<Partition> {
        self.table.shards()
    }
}

#[cfg(test)]
mod tests {
    use std::collections::BTreeMap;

    use shardline_cluster::test_utils::local_addr;

    use super::*;

    fn view(generation: u64, partitions: &[(Partition, &[u16])]) -> Arc<ClusterView<u16>> {
        Arc::new(ClusterView::new(
            generation,
            partitions.iter().map(|(partition, ports)| {
                let endpoints = ports
                    .iter()
                    .map(|port| Endpoint::new(local_addr(*port), *port))
                    .collect();
                (*partition, endpoints)
            }),
        ))
    }

    fn route(algorithm: &RoundRobinAlgorithm<u16>, partition: Partition) -> u16 {
        *algorithm.route(&[], partition).expect("Partition has endpoints.")
    }

    #[test]
    fn test_round_robin_cycles_from_first_endpoint() {
        let algorithm = RoundRobinAlgorithm::new();
        algorithm.on_cluster_changed(&view(1, &[(0, &[1, 2, 3]), (1, &[4, 5])]));

        let picks = (0..7).map(|_| route(&algorithm, 0)).collect::<Vec<_>>();
        assert_eq!(picks, vec![1, 2, 3, 1, 2, 3, 1]);

        // Partitions keep independent counters.
        assert_eq!(route(&algorithm, 1), 4);
        assert_eq!(route(&algorithm, 1), 5);
        assert_eq!(route(&algorithm, 0), 2);
    }

    #[test]
    fn test_round_robin_is_fair() {
        let algorithm = RoundRobinAlgorithm::new();
        algorithm.on_cluster_changed(&view(1, &[(0, &[1, 2, 3])]));

        let calls = 10;
        let mut hits = BTreeMap::<u16, usize>::new();
        for _ in 0..calls {
            *hits.entry(route(&algorithm, 0)).or_default() += 1;
        }

        assert_eq!(hits.len(), 3);
        for count in hits.values() {
            assert!(*count == calls / 3 || *count == calls / 3 + 1, "Unfair split: {hits:?}");
        }
    }

    #[test]
    fn test_counters_persist_across_views() {
        let algorithm = RoundRobinAlgorithm::new();
        algorithm.on_cluster_changed(&view(1, &[(0, &[1, 2, 3])]));
        assert_eq!(route(&algorithm, 0), 1);
        assert_eq!(route(&algorithm, 0), 2);

        algorithm.on_cluster_changed(&view(2, &[(0, &[1, 2, 3, 4])]));
        assert_eq!(route(&algorithm, 0), 3);
        assert_eq!(route(&algorithm, 0), 4);

        assert!(algorithm.route(&[], 8).is_none());
        algorithm.on_cluster_changed(&view(3, &[(0, &[1]), (8, &[6, 7])]));
        assert_eq!(route(&algorithm, 8), 6, "A new partition starts at its first endpoint.");
    }

    #[test]
    fn test_concurrent_routes_lose_no_updates() {
        let algorithm = Arc::new(RoundRobinAlgorithm::new());
        algorithm.on_cluster_changed(&view(1, &[(0, &[1, 2, 3, 4])]));

        let handles = (0..4)
            .map(|_| {
                let algorithm = algorithm.clone();
                std::thread::spawn(move || {
                    let mut hits = BTreeMap::<u16, usize>::new();
                    for _ in 0..1_000 {
                        *hits.entry(route(&algorithm, 0)).or_default() += 1;
                    }
                    hits
                })
            })
            .collect::<Vec<_>>();

        let mut total = BTreeMap::<u16, usize>::new();
        for handle in handles {
            for (port, count) in handle.join().expect("Thread should not panic.") {
                *total.entry(port).or_default() += count;
            }
        }

        assert_eq!(total.values().sum::<usize>(), 4_000);
        assert!(total.values().all(|count| *count == 1_000), "Uneven split: {total:?}");
    }
}
