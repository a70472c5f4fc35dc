//! Subnet route ownership.
//!
//! [`PrefixRoutes`] is the failover state machine for a single prefix.
//! [`RouteTable`] holds one of them per prefix behind its own lock so that
//! events for disjoint prefixes never contend.

use std::collections::BTreeMap;

use ipnet::IpNet;
use serde::{Deserialize, Serialize};

use crate::node::NodeId;

pub mod failover;
pub mod table;

pub use failover::PrefixRoutes;
pub use table::RouteTable;

/// Identifier of a route advertisement.
pub type RouteId = u64;

/// Prefixes each node currently serves to its peers.
pub type ServedRoutes = BTreeMap<NodeId, Vec<IpNet>>;

/// Per-advertisement state. Primary is derived from the prefix's single
/// primary slot and cannot be set directly.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum RouteState {
    Advertised,
    EnabledSecondary,
    EnabledPrimary,
}

/// Storage view of an advertisement, as loaded at start-up and as listed
/// for administrators.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct RouteRecord {
    pub id: RouteId,
    pub node: NodeId,
    pub prefix: IpNet,
    #[serde(default = "default_advertised")]
    pub advertised: bool,
    #[serde(default)]
    pub enabled: bool,
    #[serde(default)]
    pub primary: bool,
}

fn default_advertised() -> bool {
    true
}

impl RouteRecord {
    pub fn state(&self) -> RouteState {
        match (self.enabled, self.primary) {
            (true, true) => RouteState::EnabledPrimary,
            (true, false) => RouteState::EnabledSecondary,
            (false, _) => RouteState::Advertised,
        }
    }
}

/// Change in which nodes serve a prefix.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RouteChange {
    pub prefix: IpNet,
    /// Nodes serving the prefix before the transition.
    pub previous: Vec<NodeId>,
    /// Nodes serving the prefix after the transition.
    pub current: Vec<NodeId>,
    /// Every node advertising the prefix after the transition.
    pub advertisers: Vec<NodeId>,
}

impl RouteChange {
    /// Nodes whose own route set moved.
    pub fn servers(&self) -> impl Iterator<Item = NodeId> + '_ {
        self.previous.iter().chain(self.current.iter()).copied()
    }
}

/// Exit routes are distributed from every enabled advertiser and never
/// take part in primary election.
pub fn is_exit_route(prefix: &IpNet) -> bool {
    prefix.prefix_len() == 0
}
