use std::ops::Deref;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;

pub type Counter = AtomicU64;

#[derive(Debug, Clone, Default)]
/// Live metrics around a single cluster.
pub struct ClusterStatistics(Arc<ClusterStatisticsInner>);

impl Deref for ClusterStatistics {
    type Target = ClusterStatisticsInner;

    fn deref(&self) -> &Self::Target {
        &self.0
    }
}

#[derive(Debug, Default)]
pub struct ClusterStatisticsInner {
    /// The number of partitions in the current view.
    pub(crate) num_partitions: Counter,
    /// The number of distinct nodes in the current view.
    pub(crate) num_nodes: Counter,
    /// The number of views which have been published.
    pub(crate) num_rebuilds: Counter,
    /// The number of nodes which failed to be decorated.
    pub(crate) num_decorate_failures: Counter,
}

impl ClusterStatisticsInner {
    /// The number of partitions in the current view.
    pub fn num_partitions(&self) -> u64 {
        self.num_partitions.load(Ordering::Relaxed)
    }

    /// The number of distinct nodes in the current view.
    pub fn num_nodes(&self) -> u64 {
        self.num_nodes.load(Ordering::Relaxed)
    }

    /// The number of views which have been published.
    pub fn num_rebuilds(&self) -> u64 {
        self.num_rebuilds.load(Ordering::Relaxed)
    }

    /// The number of nodes which failed to be decorated.
    pub fn num_decorate_failures(&self) -> u64 {
        self.num_decorate_failures.load(Ordering::Relaxed)
    }
}
