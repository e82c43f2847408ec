//! # Shardline Routing
//! Routing and scatter-gather execution over the views published by a
//! [Cluster](shardline_cluster::Cluster).
//!
//! A [RoutingAlgorithm] is registered as a cluster listener and answers which
//! endpoint should serve a `(key, partition)` pair. Two baseline algorithms are
//! provided, [RandomAlgorithm] and [RoundRobinAlgorithm].
//!
//! A [ScatterGatherService] uses an algorithm to send a request to one endpoint
//! of every partition concurrently, merging whatever results arrive within the
//! partial result timeout.
//!
//! ## Basic Example
//!
//! ```rust
//! use std::collections::BTreeMap;
//! use std::convert::Infallible;
//! use std::sync::Arc;
//!
//! use async_trait::async_trait;
//! use shardline_cluster::{Address, ClusterBuilder, DecorateError, Decorator, Partition};
//! use shardline_coord::{Coordinator, MemoryRegistry};
//! use shardline_routing::{RoundRobinAlgorithm, ScatterGatherBuilder, Service};
//!
//! struct Shard(u16);
//!
//! #[async_trait]
//! impl Service<u32> for Shard {
//!     type Response = u32;
//!     type Error = Infallible;
//!
//!     async fn call(&self, request: u32) -> Result<u32, Infallible> {
//!         Ok(request + self.0 as u32)
//!     }
//! }
//!
//! struct Connector;
//!
//! impl Decorator for Connector {
//!     type Endpoint = Shard;
//!
//!     fn decorate(&self, address: &Address, _metadata: &[u8]) -> Result<Shard, DecorateError> {
//!         Ok(Shard(address.port()))
//!     }
//! }
//!
//! #[tokio::main]
//! async fn main() -> anyhow::Result<()> {
//!     let registry = MemoryRegistry::default();
//!     let session: Arc<dyn Coordinator> = Arc::new(registry.connect());
//!     let cluster = ClusterBuilder::new(session, "counters")
//!         .connect(Arc::new(Connector))
//!         .await?;
//!
//!     let _first = cluster.join(&Address::new("127.0.0.1", 1), [0]).await?;
//!     let _second = cluster.join(&Address::new("127.0.0.1", 2), [1]).await?;
//!     cluster.refresh().await?;
//!
//!     let router = Arc::new(RoundRobinAlgorithm::<Shard>::new());
//!     cluster.add_listener(router.clone());
//!
//!     let sum = |results: BTreeMap<Partition, u32>| results.values().sum::<u32>();
//!     let service = ScatterGatherBuilder::new(router, (|req: &u32, _: Partition| *req, sum)).build();
//!
//!     assert_eq!(service.execute(10).await, 23);
//!     Ok(())
//! }
//! ```

mod algorithm;
mod error;
mod random;
mod round_robin;
mod scatter;
mod service;

pub use algorithm::{RoutingAlgorithm, RoutingTable};
pub use error::CallError;
pub use random::RandomAlgorithm;
pub use round_robin::RoundRobinAlgorithm;
pub use scatter::{
    ScatterGatherBuilder,
    ScatterGatherService,
    DEFAULT_NUM_THREADS,
    DEFAULT_PARTIAL_RESULT_TIMEOUT,
    DEFAULT_REQUEST_TIMEOUT,
};
pub use service::{ScatterGather, Service};
