use std::collections::BTreeMap;
use std::fmt::Debug;

use async_trait::async_trait;
use shardline_cluster::Partition;

#[async_trait]
/// A request/response invocation against a single node.
///
/// This is usually implemented by the endpoint produced by a
/// [Decorator](shardline_cluster::Decorator), wrapping an RPC client.
pub trait Service<Req>: Send + Sync + 'static {
    type Response: Send + 'static;
    type Error: Debug + Send + 'static;

    async fn call(&self, request: Req) -> Result<Self::Response, Self::Error>;
}

/// Splits a request across partitions and combines the partial results.
pub trait ScatterGather<Req, Res>: Send + Sync + 'static {
    /// Produces the request sent to the given partition.
    fn rewrite(&self, request: &Req, partition: Partition) -> Req;

    /// Combines the results of the partitions which responded in time.
    ///
    /// Partitions which failed, timed out or could not be routed to are
    /// absent from `results`, which may be empty.
    fn merge(&self, results: BTreeMap<Partition, Res>) -> Res;
}

impl<Req, Res, R, M> ScatterGather<Req, Res> for (R, M)
where
    R: Fn(&Req, Partition) -> Req + Send + Sync + 'static,
    M: Fn(BTreeMap<Partition, Res>) -> Res + Send + Sync + 'static,
{
    fn rewrite(&self, request: &Req, partition: Partition) -> Req {
        (self.0)(request, partition)
    }

    fn merge(&self, results: BTreeMap<Partition, Res>) -> Res {
        (self.1)(results)
    }
}
