use std::collections::HashMap;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;

use parking_lot::Mutex;
use tracing::{trace, warn};

use crate::error::DecorateError;
use crate::{Address, Endpoint};

/// Converts a node address into an application specific handle.
///
/// Decoration should be deterministic for a given address. The
/// [EndpointRegistry] caches the produced handles, so a node is only
/// decorated again once it has left every view and rejoined.
pub trait Decorator: Send + Sync + 'static {
    type Endpoint: Send + Sync + 'static;

    /// Produces the handle for the given node.
    ///
    /// `metadata` is the opaque payload the node registered when joining,
    /// it is empty if the node registered none.
    fn decorate(
        &self,
        address: &Address,
        metadata: &[u8],
    ) -> Result<Self::Endpoint, DecorateError>;

    /// Called once a node is no longer listed in the published view.
    ///
    /// This is the point to dispose of any resources held by the handle.
    fn release(&self, _endpoint: Endpoint<Self::Endpoint>) {}
}

/// A cache of decorated endpoints, keyed by node address.
pub struct EndpointRegistry<D: Decorator> {
    decorator: Arc<D>,
    endpoints: Mutex<HashMap<Address, Endpoint<D::Endpoint>>>,
    num_decorated: AtomicU64,
    num_failures: AtomicU64,
}

impl<D: Decorator> EndpointRegistry<D> {
    pub fn new(decorator: Arc<D>) -> Self {
        Self {
            decorator,
            endpoints: Mutex::new(HashMap::new()),
            num_decorated: AtomicU64::new(0),
            num_failures: AtomicU64::new(0),
        }
    }

    #[inline]
    pub fn decorator(&self) -> &Arc<D> {
        &self.decorator
    }

    /// Gets the cached endpoint for a node, if any.
    pub fn get(&self, address: &Address) -> Option<Endpoint<D::Endpoint>> {
        self.endpoints.lock().get(address).cloned()
    }

    /// The number of cached endpoints.
    pub fn len(&self) -> usize {
        self.endpoints.lock().len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// The total number of successful decorations.
    pub fn num_decorated(&self) -> u64 {
        self.num_decorated.load(Ordering::Relaxed)
    }

    /// The total number of failed decorations.
    pub fn num_failures(&self) -> u64 {
        self.num_failures.load(Ordering::Relaxed)
    }

    /// Starts resolving the endpoints of a new view.
    ///
    /// Nodes already cached keep their existing endpoint, the cache is
    /// only replaced once the generation is committed.
    pub(crate) fn generation(&self) -> Generation<'_, D> {
        Generation {
            registry: self,
            resolved: HashMap::new(),
            failures: 0,
        }
    }

    fn decorate(
        &self,
        address: &Address,
        metadata: &[u8],
    ) -> Result<Endpoint<D::Endpoint>, DecorateError> {
        let handle = self.decorator.decorate(address, metadata)?;
        self.num_decorated.fetch_add(1, Ordering::Relaxed);
        Ok(Endpoint::new(address.clone(), handle))
    }
}

/// The endpoints resolved for a single view rebuild.
pub(crate) struct Generation<'a, D: Decorator> {
    registry: &'a EndpointRegistry<D>,
    resolved: HashMap<Address, Endpoint<D::Endpoint>>,
    failures: usize,
}

impl<'a, D: Decorator> Generation<'a, D> {
    /// Resolves the endpoint for a node.
    ///
    /// Returns `None` if the node could not be decorated, the node is
    /// then left out of the view.
    pub(crate) fn resolve(
        &mut self,
        address: &Address,
        metadata: &[u8],
    ) -> Option<Endpoint<D::Endpoint>> {
        if let Some(endpoint) = self.resolved.get(address) {
            return Some(endpoint.clone());
        }

        if let Some(endpoint) = self.registry.get(address) {
            trace!(address = %address, "Reusing cached endpoint.");
            self.resolved.insert(address.clone(), endpoint.clone());
            return Some(endpoint);
        }

        match self.registry.decorate(address, metadata) {
            Ok(endpoint) => {
                self.resolved.insert(address.clone(), endpoint.clone());
                Some(endpoint)
            },
            Err(error) => {
                self.failures += 1;
                self.registry.num_failures.fetch_add(1, Ordering::Relaxed);
                warn!(
                    address = %address,
                    error = %error,
                    "Failed to decorate node, leaving it out of the cluster view.",
                );
                None
            },
        }
    }

    #[inline]
    pub(crate) fn failures(&self) -> usize {
        self.failures
    }

    /// Replaces the cache with the endpoints of this generation.
    ///
    /// Returns the endpoints which are no longer referenced.
    pub(crate) fn commit(self) -> Vec<Endpoint<D::Endpoint>> {
        let mut endpoints = self.registry.endpoints.lock();
        let previous = std::mem::replace(&mut *endpoints, self.resolved);

        previous
            .into_iter()
            .filter(|(address, _)| !endpoints.contains_key(address))
            .map(|(_, endpoint)| endpoint)
            .collect()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::test_utils::{FailingDecorator, TestDecorator};

    #[test]
    fn test_generation_reuses_cached_endpoints() {
        let registry = EndpointRegistry::new(Arc::new(TestDecorator::default()));
        let a = Address::new("127.0.0.1", 1);
        let b = Address::new("127.0.0.1", 2);

        let mut generation = registry.generation();
        let first_a = generation.resolve(&a, &[]).expect("Decorate a.");
        let again_a = generation.resolve(&a, &[]).expect("Decorate a.");
        assert!(first_a.ptr_eq(&again_a));
        generation.resolve(&b, &[]).expect("Decorate b.");
        assert!(generation.commit().is_empty());
        assert_eq!(registry.num_decorated(), 2);

        let mut generation = registry.generation();
        let second_a = generation.resolve(&a, &[]).expect("Decorate a.");
        assert!(first_a.ptr_eq(&second_a), "Cached endpoint should be reused.");

        let released = generation.commit();
        assert_eq!(released.len(), 1);
        assert_eq!(released[0].address(), &b);
        assert_eq!(registry.len(), 1);
        assert_eq!(registry.num_decorated(), 2);
    }

    #[test]
    fn test_failed_decoration_is_skipped() {
        let registry = EndpointRegistry::new(Arc::new(FailingDecorator::new([2])));
        let mut generation = registry.generation();

        assert!(generation.resolve(&Address::new("127.0.0.1", 1), &[]).is_some());
        assert!(generation.resolve(&Address::new("127.0.0.1", 2), &[]).is_none());
        assert!(generation.resolve(&Address::new("127.0.0.1", 3), &[]).is_some());
        assert_eq!(generation.failures(), 1);

        generation.commit();
        assert_eq!(registry.len(), 2);
        assert_eq!(registry.num_failures(), 1);
    }
}
