//! Per-node network map composition.

use std::net::SocketAddr;

use ipnet::IpNet;
use serde::{Deserialize, Serialize};

use crate::acl::AccessRule;
use crate::error::NamingError;
use crate::node::{Node, NodeId};
use crate::routes::ServedRoutes;

/// Name distribution settings for the tailnet domain.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct DnsSettings {
    /// Distribute `<given>.<user>.<domain>` names instead of bare labels.
    pub magic_dns: bool,
    pub base_domain: String,
}

/// How one node appears in a map.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct PeerEntry {
    pub id: NodeId,
    pub name: String,
    pub addresses: Vec<String>,
    /// Host prefixes of the node plus every route it currently serves.
    pub allowed_ips: Vec<IpNet>,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub primary_routes: Vec<IpNet>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub relay_region: Option<u32>,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub endpoints: Vec<SocketAddr>,
    pub online: bool,
}

/// The map payload sent to one node.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct MapResponse {
    pub node: PeerEntry,
    pub peers: Vec<PeerEntry>,
    #[serde(default, skip_serializing_if = "String::is_empty")]
    pub domain: String,
}

#[derive(Debug, Clone, Default)]
pub struct Mapper {
    dns: DnsSettings,
}

impl Mapper {
    pub fn new(dns: DnsSettings) -> Self {
        Self { dns }
    }

    pub fn dns(&self) -> &DnsSettings {
        &self.dns
    }

    /// Build the map for `target`.
    ///
    /// Peers are the other nodes that `target` may reach or that may reach
    /// `target`, ordered by id. A naming failure on any entry fails this map
    /// only.
    pub fn compose(
        &self,
        target: &Node,
        nodes: &[Node],
        rules: &[AccessRule],
        routes: &ServedRoutes,
    ) -> Result<MapResponse, NamingError> {
        let peers = visible_peers(target, nodes, rules)
            .into_iter()
            .map(|peer| self.entry(peer, routes))
            .collect::<Result<Vec<_>, _>>()?;

        Ok(MapResponse {
            node: self.entry(target, routes)?,
            peers,
            domain: if self.dns.magic_dns {
                self.dns.base_domain.clone()
            } else {
                String::new()
            },
        })
    }

    fn entry(&self, node: &Node, routes: &ServedRoutes) -> Result<PeerEntry, NamingError> {
        let primary_routes = routes.get(&node.id).cloned().unwrap_or_default();
        let mut allowed_ips = node.addresses.prefixes();
        allowed_ips.extend(primary_routes.iter().copied());

        Ok(PeerEntry {
            id: node.id,
            name: node.fqdn(&self.dns)?,
            addresses: node.addresses.string_slice(),
            allowed_ips,
            primary_routes,
            relay_region: node.preferred_relay(),
            endpoints: node.endpoints.clone(),
            online: node.online,
        })
    }
}

/// Nodes `target` may exchange traffic with in either direction, excluding
/// itself, ordered by id.
pub fn visible_peers<'a>(target: &Node, nodes: &'a [Node], rules: &[AccessRule]) -> Vec<&'a Node> {
    let mut peers: Vec<&Node> = nodes
        .iter()
        .filter(|peer| peer.id != target.id)
        .filter(|peer| target.can_access(rules, peer) || peer.can_access(rules, target))
        .collect();
    peers.sort_by_key(|peer| peer.id);
    peers
}
