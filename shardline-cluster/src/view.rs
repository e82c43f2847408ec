use std::collections::{BTreeMap, BTreeSet};
use std::fmt::{self, Debug};
use std::ops::Deref;
use std::sync::Arc;

use smallvec::SmallVec;

use crate::Address;

/// The ID of a partition (shard) of the cluster.
pub type Partition = u32;

pub(crate) type EndpointList<T> = SmallVec<[Endpoint<T>; 4]>;

/// A decorated node handle, for example a ready to use RPC client.
///
/// Endpoints are created and cached by the [EndpointRegistry](crate::EndpointRegistry)
/// and shared by every view which lists the node. This handle is cheap to clone.
pub struct Endpoint<T> {
    address: Address,
    handle: Arc<T>,
}

impl<T> Endpoint<T> {
    pub fn new(address: Address, handle: T) -> Self {
        Self {
            address,
            handle: Arc::new(handle),
        }
    }

    #[inline]
    /// The address the endpoint was decorated from.
    pub fn address(&self) -> &Address {
        &self.address
    }

    #[inline]
    /// The shared handle.
    pub fn handle(&self) -> &Arc<T> {
        &self.handle
    }

    #[inline]
    /// Returns if both endpoints share the same decorated handle.
    pub fn ptr_eq(&self, other: &Self) -> bool {
        Arc::ptr_eq(&self.handle, &other.handle)
    }
}

impl<T> Clone for Endpoint<T> {
    fn clone(&self) -> Self {
        Self {
            address: self.address.clone(),
            handle: self.handle.clone(),
        }
    }
}

impl<T> Deref for Endpoint<T> {
    type Target = T;

    fn deref(&self) -> &Self::Target {
        &self.handle
    }
}

impl<T> Debug for Endpoint<T> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Endpoint")
            .field("address", &self.address)
            .finish()
    }
}

/// An immutable snapshot of the cluster, mapping each partition
/// to the ordered list of endpoints serving it.
///
/// A view is never changed once it has been published, each membership
/// change produces a new view with a higher generation.
pub struct ClusterView<T> {
    generation: u64,
    partitions: BTreeMap<Partition, EndpointList<T>>,
}

impl<T> ClusterView<T> {
    /// Creates a view from a partition mapping.
    ///
    /// Partitions without any endpoints are kept, they are still known
    /// partitions even though nothing can currently serve them.
    pub fn new(
        generation: u64,
        partitions: impl IntoIterator<Item = (Partition, Vec<Endpoint<T>>)>,
    ) -> Self {
        Self {
            generation,
            partitions: partitions
                .into_iter()
                .map(|(partition, endpoints)| (partition, SmallVec::from_vec(endpoints)))
                .collect(),
        }
    }

    pub(crate) fn from_lists(
        generation: u64,
        partitions: BTreeMap<Partition, EndpointList<T>>,
    ) -> Self {
        Self {
            generation,
            partitions,
        }
    }

    /// An empty view, the state before any membership has been read.
    pub fn empty(generation: u64) -> Self {
        Self {
            generation,
            partitions: BTreeMap::new(),
        }
    }

    #[inline]
    /// The generation of the view, strictly increasing per cluster and never
    /// reused by another cluster in the same process.
    pub fn generation(&self) -> u64 {
        self.generation
    }

    /// The endpoints serving the given partition.
    ///
    /// Unknown partitions have no endpoints.
    pub fn endpoints(&self, partition: Partition) -> &[Endpoint<T>] {
        self.partitions
            .get(&partition)
            .map(|endpoints| endpoints.as_slice())
            .unwrap_or_default()
    }

    /// Iterates the known partitions in ascending order.
    pub fn partitions(&self) -> impl Iterator<Item = Partition> + '_ {
        self.partitions.keys().copied()
    }

    /// The set of known partitions.
    pub fn partition_ids(&self) -> BTreeSet<Partition> {
        self.partitions.keys().copied().collect()
    }

    /// Iterates every partition along with its endpoints.
    pub fn iter(&self) -> impl Iterator<Item = (Partition, &[Endpoint<T>])> + '_ {
        self.partitions
            .iter()
            .map(|(partition, endpoints)| (*partition, endpoints.as_slice()))
    }

    /// The number of known partitions.
    pub fn len(&self) -> usize {
        self.partitions.len()
    }

    pub fn is_empty(&self) -> bool {
        self.partitions.is_empty()
    }

    /// The number of distinct node addresses across all partitions.
    pub fn num_nodes(&self) -> usize {
        self.addresses().len()
    }

    /// The set of distinct node addresses across all partitions.
    pub fn addresses(&self) -> BTreeSet<Address> {
        self.partitions
            .values()
            .flat_map(|endpoints| endpoints.iter())
            .map(|endpoint| endpoint.address().clone())
            .collect()
    }

    /// Returns if the node is listed in any partition.
    pub fn contains(&self, address: &Address) -> bool {
        self.find(address).is_some()
    }

    /// Finds the endpoint for the given node, if listed.
    pub fn find(&self, address: &Address) -> Option<&Endpoint<T>> {
        self.partitions
            .values()
            .flat_map(|endpoints| endpoints.iter())
            .find(|endpoint| endpoint.address() == address)
    }

    /// The nodes listed in `previous` which are no longer listed in this view.
    pub fn removed_since(&self, previous: &ClusterView<T>) -> Vec<Address> {
        let current = self.addresses();
        previous
            .addresses()
            .into_iter()
            .filter(|address| !current.contains(address))
            .collect()
    }
}

impl<T> Debug for ClusterView<T> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let partitions = self
            .partitions
            .iter()
            .map(|(partition, endpoints)| {
                let addresses = endpoints
                    .iter()
                    .map(|endpoint| endpoint.address().to_string())
                    .collect::<Vec<_>>();
                (*partition, addresses)
            })
            .collect::<BTreeMap<_, _>>();

        f.debug_struct("ClusterView")
            .field("generation", &self.generation)
            .field("partitions", &partitions)
            .finish()
    }
}
