//! Error types for the coordination core.

use thiserror::Error;

use crate::node::NodeId;
use crate::routes::RouteId;

/// Failure to derive a node's DNS name.
///
/// Only the map of the node being composed fails; other nodes are
/// unaffected.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum NamingError {
    #[error("failed to create valid FQDN: node has no given name")]
    NoGivenName,

    #[error("failed to create valid FQDN: node user has no name")]
    NoUserName,
}

/// Rejected address or port pattern in an access rule.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum PatternError {
    #[error("invalid address pattern '{0}'")]
    Address(String),

    #[error("invalid port range '{0}'")]
    Ports(String),
}

/// Errors surfaced by [`crate::coordinator::Coordinator`] operations.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum CoordinatorError {
    /// An administrative command named an advertisement that does not exist.
    #[error("route {0} not found")]
    RouteNotFound(RouteId),

    #[error("node {0} not found")]
    NodeNotFound(NodeId),

    #[error("cannot compose map for node {node}: {source}")]
    Naming {
        node: NodeId,
        #[source]
        source: NamingError,
    },
}

/// Result type alias for coordinator operations
pub type Result<T> = std::result::Result<T, CoordinatorError>;
