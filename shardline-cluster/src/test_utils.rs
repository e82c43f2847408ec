//! Decorators and listeners used to test clusters and the systems built on them.

use std::collections::BTreeSet;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;

use anyhow::anyhow;
use parking_lot::Mutex;

use crate::{
    Address,
    ClusterEventListener,
    ClusterView,
    DecorateError,
    Decorator,
    Endpoint,
};

#[derive(Debug, Clone, PartialEq, Eq)]
/// The endpoint produced by the test decorators.
pub struct TestNode {
    pub address: Address,
    pub metadata: Vec<u8>,
}

#[derive(Default)]
/// A decorator which records how often it was asked to decorate
/// and release nodes.
pub struct TestDecorator {
    decorated: AtomicUsize,
    released: Mutex<Vec<Address>>,
}

impl TestDecorator {
    /// The number of nodes decorated so far.
    pub fn num_decorated(&self) -> usize {
        self.decorated.load(Ordering::Relaxed)
    }

    /// The nodes released so far, in release order.
    pub fn released(&self) -> Vec<Address> {
        self.released.lock().clone()
    }
}

impl Decorator for TestDecorator {
    type Endpoint = TestNode;

    fn decorate(
        &self,
        address: &Address,
        metadata: &[u8],
    ) -> Result<Self::Endpoint, DecorateError> {
        self.decorated.fetch_add(1, Ordering::Relaxed);
        Ok(TestNode {
            address: address.clone(),
            metadata: metadata.to_vec(),
        })
    }

    fn release(&self, endpoint: Endpoint<Self::Endpoint>) {
        self.released.lock().push(endpoint.address().clone());
    }
}

/// A decorator which refuses to decorate nodes listening on specific ports.
pub struct FailingDecorator {
    ports: BTreeSet<u16>,
}

impl FailingDecorator {
    pub fn new(ports: impl IntoIterator<Item = u16>) -> Self {
        Self {
            ports: ports.into_iter().collect(),
        }
    }
}

impl Decorator for FailingDecorator {
    type Endpoint = TestNode;

    fn decorate(
        &self,
        address: &Address,
        metadata: &[u8],
    ) -> Result<Self::Endpoint, DecorateError> {
        if self.ports.contains(&address.port()) {
            return Err(DecorateError::new(
                address.clone(),
                anyhow!("port {} is blocked", address.port()),
            ));
        }

        Ok(TestNode {
            address: address.clone(),
            metadata: metadata.to_vec(),
        })
    }
}

/// A listener which keeps every event it receives.
pub struct RecordingListener<T> {
    views: Mutex<Vec<Arc<ClusterView<T>>>>,
    removed: Mutex<Vec<Vec<Address>>>,
}

impl<T> Default for RecordingListener<T> {
    fn default() -> Self {
        Self {
            views: Mutex::new(Vec::new()),
            removed: Mutex::new(Vec::new()),
        }
    }
}

impl<T> RecordingListener<T> {
    /// Every view received, in delivery order.
    pub fn views(&self) -> Vec<Arc<ClusterView<T>>> {
        self.views.lock().clone()
    }

    /// The most recently received view.
    pub fn last_view(&self) -> Option<Arc<ClusterView<T>>> {
        self.views.lock().last().cloned()
    }

    /// Every removal notification received, in delivery order.
    pub fn removed(&self) -> Vec<Vec<Address>> {
        self.removed.lock().clone()
    }
}

impl<T: Send + Sync + 'static> ClusterEventListener<T> for RecordingListener<T> {
    fn on_cluster_changed(&self, view: &Arc<ClusterView<T>>) {
        self.views.lock().push(view.clone());
    }

    fn on_nodes_removed(&self, removed: &[Address]) {
        self.removed.lock().push(removed.to_vec());
    }
}

/// Creates an address on the loopback interface.
pub fn local_addr(port: u16) -> Address {
    Address::new("127.0.0.1", port)
}
