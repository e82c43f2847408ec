use std::collections::BTreeMap;
use std::convert::Infallible;
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use shardline_cluster::{
    Address,
    ClusterBuilder,
    ClusterManagerBuilder,
    DecorateError,
    Decorator,
    Partition,
};
use shardline_coord::{Coordinator, MemoryRegistry};
use shardline_routing::{RoundRobinAlgorithm, RoutingAlgorithm, ScatterGatherBuilder, Service};
use test_helper::wait_for;

const TIMEOUT: Duration = Duration::from_secs(5);

/// A node answering how many documents it holds for a term.
struct SearchNode {
    address: Address,
}

#[async_trait]
impl Service<String> for SearchNode {
    type Response = usize;
    type Error = Infallible;

    async fn call(&self, term: String) -> Result<usize, Infallible> {
        Ok(term.len() * self.address.port() as usize)
    }
}

struct Connector;

impl Decorator for Connector {
    type Endpoint = SearchNode;

    fn decorate(&self, address: &Address, _metadata: &[u8]) -> Result<SearchNode, DecorateError> {
        Ok(SearchNode {
            address: address.clone(),
        })
    }
}

fn count(results: BTreeMap<Partition, usize>) -> usize {
    results.values().sum()
}

#[tokio::test]
async fn test_search_across_managed_cluster() -> anyhow::Result<()> {
    let _ = tracing_subscriber::fmt::try_init();

    let registry = MemoryRegistry::default();

    let node_session: Arc<dyn Coordinator> = Arc::new(registry.connect());
    let nodes = ClusterBuilder::new(node_session, "search")
        .connect(Arc::new(Connector))
        .await?;
    let _first = nodes.join(&Address::new("10.0.0.1", 1), [0, 1]).await?;
    let _second = nodes.join(&Address::new("10.0.0.2", 2), [2]).await?;

    let client_session: Arc<dyn Coordinator> = Arc::new(registry.connect());
    let manager = ClusterManagerBuilder::new(client_session)
        .close_on_shutdown(true)
        .connect(Arc::new(Connector))
        .await?;
    let cluster = manager.cluster("search").expect("The cluster should be discovered.");
    cluster
        .wait_for_view(TIMEOUT, |view| view.len() == 3)
        .await
        .expect("Every partition should be visible.");

    let router = Arc::new(RoundRobinAlgorithm::<SearchNode>::new());
    cluster.add_listener(router.clone());

    let search = ScatterGatherBuilder::new(router, (|term: &String, _: Partition| term.clone(), count))
        .with_partial_result_timeout(Duration::from_secs(1))
        .build();

    // Partitions 0 and 1 are served by port 1, partition 2 by port 2.
    assert_eq!(search.execute("rust".to_string()).await, 4 + 4 + 8);
    assert_eq!(search.call("go".to_string()).await, Ok(2 + 2 + 4));

    manager.shutdown().await;
    assert!(cluster.is_shutdown());
    assert_eq!(search.execute("rust".to_string()).await, 0);

    nodes.shutdown().await;
    Ok(())
}

#[tokio::test]
async fn test_router_follows_recreated_cluster() -> anyhow::Result<()> {
    let _ = tracing_subscriber::fmt::try_init();

    let registry = MemoryRegistry::default();
    let admin = registry.connect();

    let node_session: Arc<dyn Coordinator> = Arc::new(registry.connect());
    let nodes = ClusterBuilder::new(node_session, "search")
        .connect(Arc::new(Connector))
        .await?;
    let first = nodes.join(&Address::new("10.0.0.1", 1), [0]).await?;

    let client_session: Arc<dyn Coordinator> = Arc::new(registry.connect());
    let manager = ClusterManagerBuilder::new(client_session)
        .connect(Arc::new(Connector))
        .await?;
    let old = manager.cluster("search").expect("The cluster should be discovered.");

    let router = Arc::new(RoundRobinAlgorithm::<SearchNode>::new());
    old.add_listener(router.clone());
    assert!(router.route(&[], 0).is_some());

    // Tear the cluster down completely.
    first.leave().await?;
    admin.delete("/shardline/search/0").await?;
    admin.delete("/shardline/search").await?;
    let removed = wait_for(TIMEOUT, || manager.available_clusters().is_empty()).await;
    assert!(removed, "The manager should drop the deleted cluster.");
    assert!(old.is_shutdown());
    assert!(router.shards().is_empty());

    // Joining registers the cluster again under the same name.
    let _second = nodes.join(&Address::new("10.0.0.2", 2), [0]).await?;
    let recreated = wait_for(TIMEOUT, || manager.cluster("search").is_some()).await;
    assert!(recreated, "The manager should pick up the recreated cluster.");

    let new = manager.cluster("search").expect("The cluster should be held.");
    new.wait_for_view(TIMEOUT, |view| !view.endpoints(0).is_empty())
        .await
        .expect("The new member should be visible.");
    new.add_listener(router.clone());

    assert_eq!(router.shards().into_iter().collect::<Vec<_>>(), vec![0]);
    let endpoint = router.route(&[], 0).expect("The new member should be routable.");
    assert_eq!(endpoint.address().port(), 2);

    manager.shutdown().await;
    nodes.shutdown().await;
    Ok(())
}
