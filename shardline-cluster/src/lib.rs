//! # Shardline Cluster
//! Live, partitioned views of the clusters registered in a coordination service.
//!
//! Each member of a cluster registers a presence node per partition it serves:
//!
//! ```text
//! <namespace>/<cluster>/<partition>/member_0000000007
//! ```
//!
//! A [Cluster] watches that subtree and turns it into a [ClusterView], a
//! snapshot mapping every partition to the ordered endpoints serving it.
//! Endpoints are produced by a user supplied [Decorator], for example turning
//! an address into an RPC client, and are cached across views.
//! A [ClusterManager] keeps a [Cluster] for every cluster in a namespace.
//!
//! ## Basic Example
//!
//! ```rust
//! use std::sync::Arc;
//! use shardline_cluster::{Address, ClusterBuilder, DecorateError, Decorator};
//! use shardline_coord::{Coordinator, MemoryRegistry};
//!
//! struct Client(Address);
//!
//! struct Connector;
//!
//! impl Decorator for Connector {
//!     type Endpoint = Client;
//!
//!     fn decorate(&self, address: &Address, _metadata: &[u8]) -> Result<Client, DecorateError> {
//!         Ok(Client(address.clone()))
//!     }
//! }
//!
//! #[tokio::main]
//! async fn main() -> anyhow::Result<()> {
//!     let registry = MemoryRegistry::default();
//!     let session: Arc<dyn Coordinator> = Arc::new(registry.connect());
//!
//!     let cluster = ClusterBuilder::new(session, "search")
//!         .connect(Arc::new(Connector))
//!         .await?;
//!
//!     let _membership = cluster.join(&"127.0.0.1:9000".parse::<Address>()?, [0, 1]).await?;
//!     let view = cluster.refresh().await?;
//!     assert_eq!(view.endpoints(1)[0].0.port(), 9000);
//!
//!     cluster.shutdown().await;
//!     Ok(())
//! }
//! ```

mod address;
mod cluster;
mod error;
mod listener;
mod manager;
mod member;
mod registry;
mod statistics;
mod view;

#[cfg(any(test, feature = "test-utils"))]
pub mod test_utils;

pub use address::Address;
pub use cluster::{Cluster, ClusterBuilder, Membership};
pub use error::{ClusterError, DecorateError};
pub use listener::{ClusterEventListener, ListenerId};
pub use manager::{ClusterManager, ClusterManagerBuilder};
pub use member::MemberRecord;
pub use registry::{Decorator, EndpointRegistry};
pub use statistics::ClusterStatistics;
pub use view::{ClusterView, Endpoint, Partition};

/// The namespace clusters are registered under unless configured otherwise.
pub static DEFAULT_NAMESPACE: &str = "/shardline";
