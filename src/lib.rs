//! Network-map coordination core for a private overlay network.
//!
//! The crate tracks registered nodes, filters who may reach whom under an
//! already-parsed access policy, elects one primary advertiser per subnet
//! route, and turns all of it into per-node maps pushed to a distribution
//! layer as full maps or minimal peer deltas.

pub mod acl;
pub mod config;
pub mod coordinator;
pub mod distribution;
pub mod dns_server;
pub mod error;
pub mod feed;
pub mod mapper;
pub mod node;
pub mod routes;
pub mod snapshot;
pub mod types;

pub use coordinator::Coordinator;
pub use error::{CoordinatorError, NamingError};
pub use types::{Event, MapUpdate, PeerChange};
