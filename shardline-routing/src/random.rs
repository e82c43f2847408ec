use std::collections::BTreeSet;
use std::sync::Arc;

use parking_lot::Mutex;
use rand::rngs::StdRng;
use rand::{Rng, SeedableRng};
use shardline_cluster::{ClusterEventListener, ClusterView, Endpoint, Partition};

use crate::{RoutingAlgorithm, RoutingTable};

/// Picks an endpoint of the partition uniformly at random.
///
/// The routing key is ignored.
pub struct RandomAlgorithm<T> {
    table: RoutingTable<T>,
    rng: Mutex<StdRng>,
}

impl<T> RandomAlgorithm<T> {
    pub fn new() -> Self {
        Self::from_rng(StdRng::from_entropy())
    }

    /// Creates an algorithm making a reproducible sequence of choices.
    pub fn with_seed(seed: u64) -> Self {
        Self::from_rng(StdRng::seed_from_u64(seed))
    }

    fn from_rng(rng: StdRng) -> Self {
        Self {
            table: RoutingTable::default(),
            rng: Mutex::new(rng),
        }
    }
}

impl<T> Default for RandomAlgorithm<T> {
    fn default() -> Self {
        Self::new()
    }
}

impl<T: Send + Sync + 'static> ClusterEventListener<T> for RandomAlgorithm<T> {
    fn on_cluster_changed(&self, view: &Arc<ClusterView<T>>) {
        self.table.update(view);
    }
}

impl<T: Send + Sync + 'static> RoutingAlgorithm<T> for RandomAlgorithm<T> {
    fn route(&self, _key: &[u8], partition: Partition) -> Option<Endpoint<T>> {
        let view = self.table.load();
        let endpoints = view.endpoints(partition);
        if endpoints.is_empty() {
            return None;
        }

        let idx = self.rng.lock().gen_range(0..endpoints.len());
        Some(endpoints[idx].clone())
    }

    fn shards(&self) -> BTreeSet<Partition> {
        self.table.shards()
    }
}
