use thiserror::Error;

#[derive(Debug, Clone, Error, PartialEq, Eq)]
pub enum CoordError {
    #[error("Node `{0}` does not exist.")]
    /// The target node, or the parent of a node being created, is missing.
    NoNode(String),

    #[error("Node `{0}` already exists.")]
    /// A node already exists at the target path.
    NodeExists(String),

    #[error("Node `{0}` still has children.")]
    /// Only leaf nodes can be deleted.
    NotEmpty(String),

    #[error("Node `{0}` is ephemeral and cannot have children.")]
    NoChildrenForEphemerals(String),

    #[error("Invalid path `{path}`: {reason}")]
    InvalidPath { path: String, reason: &'static str },

    #[error("The coordination session has been closed.")]
    /// The session was closed locally or expired, any watches registered
    /// through it are released.
    SessionClosed,

    #[error("The coordination service is unavailable: {0}")]
    Unavailable(String),
}
