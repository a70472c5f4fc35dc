//! Messages exchanged with the coordinator.
//!
//! [`Event`]s flow in from connection workers, the storage layer and
//! administrators. [`MapUpdate`]s flow out to the distribution layer. Both are
//! serialised with [`serde`](https://serde.rs/) so that they can be fed from
//! and logged as JSON lines.

use std::net::SocketAddr;

use ipnet::IpNet;
use serde::{Deserialize, Serialize};

use crate::acl::AccessRule;
use crate::mapper::MapResponse;
use crate::node::{Node, NodeId, SelfReport};
use crate::routes::RouteId;

/// Something that happened to the coordinated state.
///
/// Events touching the same prefix or node are applied in the order they
/// are handed to the coordinator.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum Event {
    NodeOnline { node: NodeId },
    NodeOffline { node: NodeId },
    /// A node sent its connectivity descriptor and advertised routes.
    SelfReport { node: NodeId, report: SelfReport },
    EnableRoute { route: RouteId },
    DisableRoute { route: RouteId },
    DeleteRoute { route: RouteId },
    /// The policy loader produced a new rule set.
    PolicyReloaded { rules: Vec<AccessRule> },
    NodeAdded { node: Node },
    NodeRemoved { node: NodeId },
}

/// Fields of a node that changed since peers were last told about it.
///
/// `None` means "unchanged".
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct PeerChange {
    pub node_id: NodeId,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub relay_region: Option<u32>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub endpoints: Option<Vec<SocketAddr>>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub online: Option<bool>,
    /// Prefixes the node now serves. An empty list means it serves none.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub primary_routes: Option<Vec<IpNet>>,
}

impl PeerChange {
    pub fn new(node_id: NodeId) -> Self {
        Self {
            node_id,
            ..Default::default()
        }
    }

    pub fn has_changes(&self) -> bool {
        self.relay_region.is_some()
            || self.endpoints.is_some()
            || self.online.is_some()
            || self.primary_routes.is_some()
    }
}

/// Work handed to the distribution layer.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum MapUpdate {
    /// Complete map for one node.
    Full { node: NodeId, map: MapResponse },
    /// Deltas about peers of `node`.
    Patch {
        node: NodeId,
        changes: Vec<PeerChange>,
    },
    /// The node left the network; forget anything sent to it.
    Removed { node: NodeId },
}

impl MapUpdate {
    pub fn node(&self) -> NodeId {
        match self {
            MapUpdate::Full { node, .. }
            | MapUpdate::Patch { node, .. }
            | MapUpdate::Removed { node } => *node,
        }
    }
}
