#![allow(dead_code)]

use std::collections::BTreeSet;
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::Arc;

use async_trait::async_trait;
use parking_lot::Mutex;
use shardline_cluster::{
    Address,
    ClusterEventListener,
    ClusterView,
    DecorateError,
    Decorator,
    Endpoint,
};
use shardline_coord::{CoordError, Coordinator, CreateMode, MemoryCoordinator, TreeWatcher, WatchScope};

pub fn addr(port: u16) -> Address {
    Address::new("127.0.0.1", port)
}

/// Collects the ports serving a partition, in view order.
pub fn ports(view: &ClusterView<Client>, partition: u32) -> Vec<u16> {
    view.endpoints(partition)
        .iter()
        .map(|endpoint| endpoint.address().port())
        .collect()
}

#[derive(Debug)]
pub struct Client {
    pub address: Address,
}

#[derive(Default)]
pub struct Connector {
    blocked: BTreeSet<u16>,
    decorated: AtomicUsize,
    released: Mutex<Vec<Address>>,
}

impl Connector {
    pub fn blocking(ports: impl IntoIterator<Item = u16>) -> Self {
        Self {
            blocked: ports.into_iter().collect(),
            ..Default::default()
        }
    }

    pub fn num_decorated(&self) -> usize {
        self.decorated.load(Ordering::SeqCst)
    }

    pub fn released(&self) -> Vec<Address> {
        self.released.lock().clone()
    }
}

impl Decorator for Connector {
    type Endpoint = Client;

    fn decorate(&self, address: &Address, _metadata: &[u8]) -> Result<Client, DecorateError> {
        if self.blocked.contains(&address.port()) {
            return Err(DecorateError::new(address.clone(), "connection refused"));
        }

        self.decorated.fetch_add(1, Ordering::SeqCst);
        Ok(Client {
            address: address.clone(),
        })
    }

    fn release(&self, endpoint: Endpoint<Client>) {
        self.released.lock().push(endpoint.address().clone());
    }
}

pub struct Recorder {
    pub views: Mutex<Vec<Arc<ClusterView<Client>>>>,
    pub removed: Mutex<Vec<Address>>,
}

impl Default for Recorder {
    fn default() -> Self {
        Self {
            views: Mutex::new(Vec::new()),
            removed: Mutex::new(Vec::new()),
        }
    }
}

impl ClusterEventListener<Client> for Recorder {
    fn on_cluster_changed(&self, view: &Arc<ClusterView<Client>>) {
        self.views.lock().push(view.clone());
    }

    fn on_nodes_removed(&self, removed: &[Address]) {
        self.removed.lock().extend_from_slice(removed);
    }
}

/// A session which can be told to fail specific operations.
pub struct FaultyCoordinator {
    session: MemoryCoordinator,
    fail_reads: AtomicBool,
    broken_watches: Mutex<BTreeSet<String>>,
}

impl FaultyCoordinator {
    pub fn new(session: MemoryCoordinator) -> Self {
        Self {
            session,
            fail_reads: AtomicBool::new(false),
            broken_watches: Mutex::new(BTreeSet::new()),
        }
    }

    /// Makes listing children fail until reset.
    pub fn fail_reads(&self, fail: bool) {
        self.fail_reads.store(fail, Ordering::SeqCst);
    }

    /// Makes registering a watch on the path fail.
    pub fn break_watch(&self, path: &str) {
        self.broken_watches.lock().insert(path.to_string());
    }
}

#[async_trait]
impl Coordinator for FaultyCoordinator {
    async fn exists(&self, path: &str) -> Result<bool, CoordError> {
        self.session.exists(path).await
    }

    async fn create(
        &self,
        path: &str,
        data: Option<Vec<u8>>,
        mode: CreateMode,
    ) -> Result<String, CoordError> {
        self.session.create(path, data, mode).await
    }

    async fn delete(&self, path: &str) -> Result<(), CoordError> {
        self.session.delete(path).await
    }

    async fn children(&self, path: &str) -> Result<Vec<String>, CoordError> {
        if self.fail_reads.load(Ordering::SeqCst) {
            return Err(CoordError::Unavailable("reads disabled".to_string()));
        }
        self.session.children(path).await
    }

    async fn data(&self, path: &str) -> Result<Option<Vec<u8>>, CoordError> {
        self.session.data(path).await
    }

    fn watch(&self, path: &str, scope: WatchScope) -> Result<TreeWatcher, CoordError> {
        if self.broken_watches.lock().contains(path) {
            return Err(CoordError::Unavailable(format!("cannot watch {path}")));
        }
        self.session.watch(path, scope)
    }

    async fn close(&self) {
        self.session.close().await
    }
}
