use std::error::Error as StdError;
use std::fmt::Debug;

use shardline_coord::CoordError;
use thiserror::Error;

use crate::Address;

#[derive(Debug, Error)]
pub enum ClusterError {
    #[error("{0}")]
    /// An error has occurred within the coordination service.
    Coordination(#[from] CoordError),

    #[error("Invalid cluster name `{name}`: {reason}")]
    /// The cluster name cannot be used as a path segment.
    InvalidName { name: String, reason: &'static str },

    #[error("Invalid address `{0}`")]
    InvalidAddress(String),

    #[error("Invalid member record at `{path}`: {reason}")]
    /// A member node's payload could not be decoded.
    InvalidMember { path: String, reason: String },

    #[error("Failed to encode the member record for {0}")]
    Encode(String),

    #[error("The cluster has been shut down.")]
    ShutDown,
}

#[derive(Debug, Error)]
#[error("Failed to decorate {address}: {source}")]
/// Converting an address into an endpoint handle failed.
pub struct DecorateError {
    pub address: Address,
    #[source]
    pub source: Box<dyn StdError + Send + Sync + 'static>,
}

impl DecorateError {
    pub fn new(
        address: Address,
        source: impl Into<Box<dyn StdError + Send + Sync + 'static>>,
    ) -> Self {
        Self {
            address,
            source: source.into(),
        }
    }
}
