use std::collections::{BTreeMap, BTreeSet};
use std::convert::Infallible;
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use shardline_cluster::{Endpoint, Partition};
use tokio::sync::Semaphore;
use tokio::time::{timeout, timeout_at, Instant};
use tracing::{debug, trace, warn};

use crate::{CallError, RoutingAlgorithm, ScatterGather, Service};

/// The default number of sub-requests which may run at once.
pub const DEFAULT_NUM_THREADS: usize = 8;
/// The default time to wait for partial results before merging.
pub const DEFAULT_PARTIAL_RESULT_TIMEOUT: Duration = Duration::from_secs(10);
/// The default time a single sub-request may take.
pub const DEFAULT_REQUEST_TIMEOUT: Duration = Duration::from_secs(10);

/// Configures a [ScatterGatherService].
pub struct ScatterGatherBuilder<T, S> {
    router: Arc<dyn RoutingAlgorithm<T>>,
    strategy: S,
    shards: Option<BTreeSet<Partition>>,
    routing_key: Vec<u8>,
    partial_result_timeout: Duration,
    request_timeout: Duration,
    num_threads: usize,
}

impl<T, S> ScatterGatherBuilder<T, S> {
    /// Creates a new builder routing through the given algorithm and
    /// splitting requests with the given strategy.
    pub fn new(router: Arc<dyn RoutingAlgorithm<T>>, strategy: S) -> Self {
        Self {
            router,
            strategy,
            shards: None,
            routing_key: Vec::new(),
            partial_result_timeout: DEFAULT_PARTIAL_RESULT_TIMEOUT,
            request_timeout: DEFAULT_REQUEST_TIMEOUT,
            num_threads: DEFAULT_NUM_THREADS,
        }
    }

    /// Only target the given partitions.
    ///
    /// By default every partition known to the router is targeted, as
    /// evaluated on each call.
    pub fn with_shards(mut self, shards: impl IntoIterator<Item = Partition>) -> Self {
        self.shards = Some(shards.into_iter().collect());
        self
    }

    /// Sets the key passed to the router.
    pub fn with_routing_key(mut self, key: impl Into<Vec<u8>>) -> Self {
        self.routing_key = key.into();
        self
    }

    /// Sets how long a call waits for partial results before merging
    /// whatever has arrived.
    pub fn with_partial_result_timeout(mut self, timeout: Duration) -> Self {
        self.partial_result_timeout = timeout;
        self
    }

    /// Sets how long a single sub-request may run.
    ///
    /// Sub-requests still running after the partial result timeout are
    /// abandoned, this bounds how long they keep holding a concurrency slot.
    pub fn with_request_timeout(mut self, timeout: Duration) -> Self {
        self.request_timeout = timeout;
        self
    }

    /// Sets the number of sub-requests which may run at once.
    pub fn with_num_threads(mut self, num_threads: usize) -> Self {
        self.num_threads = num_threads.max(1);
        self
    }

    pub fn build(self) -> ScatterGatherService<T, S> {
        ScatterGatherService {
            router: self.router,
            strategy: self.strategy,
            shards: self.shards,
            routing_key: self.routing_key,
            partial_result_timeout: self.partial_result_timeout,
            request_timeout: self.request_timeout,
            permits: Arc::new(Semaphore::new(self.num_threads)),
        }
    }
}

/// Fans a request out to one endpoint per partition and merges the results
/// which arrive within the partial result timeout.
///
/// Sub-requests which fail, time out or cannot be routed are logged and
/// left out of the merge, a call never fails as a whole.
pub struct ScatterGatherService<T, S> {
    router: Arc<dyn RoutingAlgorithm<T>>,
    strategy: S,
    shards: Option<BTreeSet<Partition>>,
    routing_key: Vec<u8>,
    partial_result_timeout: Duration,
    request_timeout: Duration,
    permits: Arc<Semaphore>,
}

impl<T: Send + Sync + 'static, S> ScatterGatherService<T, S> {
    #[inline]
    pub fn router(&self) -> &Arc<dyn RoutingAlgorithm<T>> {
        &self.router
    }

    /// The partitions a call is sent to.
    pub fn shards(&self) -> BTreeSet<Partition> {
        match &self.shards {
            Some(shards) => shards.clone(),
            None => self.router.shards(),
        }
    }

    /// Executes the request against the configured partitions.
    pub async fn execute<Req>(&self, request: Req) -> T::Response
    where
        T: Service<Req>,
        S: ScatterGather<Req, T::Response>,
        Req: Send + 'static,
    {
        let shards = self.shards();
        self.execute_on(request, &self.routing_key, shards).await
    }

    /// Executes the request against the given partitions, routing with
    /// the given key.
    pub async fn execute_on<Req>(
        &self,
        request: Req,
        routing_key: &[u8],
        partitions: impl IntoIterator<Item = Partition>,
    ) -> T::Response
    where
        T: Service<Req>,
        S: ScatterGather<Req, T::Response>,
        Req: Send + 'static,
    {
        let deadline = Instant::now() + self.partial_result_timeout;
        let (tx, rx) = flume::unbounded();

        let mut num_dispatched = 0;
        for partition in partitions {
            let endpoint = match self.router.route(routing_key, partition) {
                Some(endpoint) => endpoint,
                None => {
                    debug!(partition = partition, "No endpoint available, skipping partition.");
                    continue;
                },
            };

            let sub_request = self.strategy.rewrite(&request, partition);
            let permits = self.permits.clone();
            let request_timeout = self.request_timeout;
            let tx = tx.clone();
            tokio::spawn(async move {
                let result = call_endpoint(permits, endpoint, sub_request, request_timeout).await;
                if tx.send((partition, result)).is_err() {
                    trace!(partition = partition, "Discarding late partition result.");
                }
            });
            num_dispatched += 1;
        }
        drop(tx);

        let mut results = BTreeMap::new();
        let mut num_pending = num_dispatched;
        while num_pending > 0 {
            let (partition, result) = match timeout_at(deadline, rx.recv_async()).await {
                Ok(Ok(message)) => message,
                Ok(Err(_)) => break,
                Err(_) => {
                    warn!(
                        num_pending = num_pending,
                        timeout = ?self.partial_result_timeout,
                        "Partial result timeout elapsed, merging available results.",
                    );
                    break;
                },
            };
            num_pending -= 1;

            match result {
                Ok(response) => {
                    results.insert(partition, response);
                },
                Err(e) => {
                    warn!(
                        partition = partition,
                        error = %e,
                        "Partition call failed, excluding it from the result.",
                    );
                },
            }
        }

        debug!(
            num_dispatched = num_dispatched,
            num_results = results.len(),
            "Merging scatter-gather results."
        );
        self.strategy.merge(results)
    }
}

async fn call_endpoint<T, Req>(
    permits: Arc<Semaphore>,
    endpoint: Endpoint<T>,
    request: Req,
    request_timeout: Duration,
) -> Result<T::Response, CallError<T::Error>>
where
    T: Service<Req>,
{
    let _permit = permits.acquire_owned().await.map_err(|_| CallError::Aborted)?;

    match timeout(request_timeout, endpoint.call(request)).await {
        Ok(Ok(response)) => Ok(response),
        Ok(Err(e)) => Err(CallError::Service(e)),
        Err(_) => Err(CallError::Timeout(request_timeout)),
    }
}

#[async_trait]
impl<T, S, Req> Service<Req> for ScatterGatherService<T, S>
where
    T: Service<Req>,
    S: ScatterGather<Req, T::Response>,
    Req: Send + 'static,
{
    type Response = T::Response;
    type Error = Infallible;

    async fn call(&self, request: Req) -> Result<Self::Response, Self::Error> {
        Ok(self.execute(request).await)
    }
}
