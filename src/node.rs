//! Node records and the per-node operations the coordinator builds on:
//! canonical address ordering, reachability checks, DNS naming and the
//! peer-change delta computed from a self-report.

use std::fmt;
use std::net::{IpAddr, SocketAddr};

use ipnet::IpNet;
use serde::{Deserialize, Serialize};

use crate::acl::AccessRule;
use crate::error::NamingError;
use crate::mapper::DnsSettings;
use crate::types::PeerChange;

/// Stable, monotonically assigned node identifier.
pub type NodeId = u64;

/// Owner of a node.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct User {
    #[serde(default)]
    pub id: u64,
    #[serde(default)]
    pub name: String,
}

/// Network conditions observed by the node itself.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct NetInfo {
    /// Relay region the node prefers. Zero means the node has no preference.
    #[serde(default)]
    pub preferred_relay: u32,
}

/// Connectivity descriptor a node sends with every self-report.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct HostInfo {
    #[serde(default)]
    pub hostname: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub net_info: Option<NetInfo>,
    /// Subnet routes the node currently offers to relay.
    #[serde(default)]
    pub routable_ips: Vec<IpNet>,
}

/// A node's self-report as received from its connection.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct SelfReport {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub host_info: Option<HostInfo>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub endpoints: Option<Vec<SocketAddr>>,
}

impl SelfReport {
    fn net_info(&self) -> Option<&NetInfo> {
        self.host_info.as_ref().and_then(|h| h.net_info.as_ref())
    }

    /// Advertised prefixes, if the report carries a connectivity descriptor.
    pub fn advertised_routes(&self) -> Option<&[IpNet]> {
        self.host_info.as_ref().map(|h| h.routable_ips.as_slice())
    }
}

/// Overlay addresses assigned to a node, kept in canonical order:
/// IPv4 ascending, then IPv6 ascending.
///
/// The first IPv4 and first IPv6 entries are the node's primary addresses.
#[derive(Debug, Clone, Default, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(from = "Vec<IpAddr>", into = "Vec<IpAddr>")]
pub struct NodeAddresses(Vec<IpAddr>);

impl NodeAddresses {
    pub fn new(addrs: impl IntoIterator<Item = IpAddr>) -> Self {
        // `IpAddr` orders every V4 before every V6, numerically within a family.
        let mut addrs: Vec<IpAddr> = addrs.into_iter().collect();
        addrs.sort();
        addrs.dedup();
        Self(addrs)
    }

    pub fn as_slice(&self) -> &[IpAddr] {
        &self.0
    }

    pub fn iter(&self) -> impl Iterator<Item = &IpAddr> {
        self.0.iter()
    }

    pub fn is_empty(&self) -> bool {
        self.0.is_empty()
    }

    pub fn string_slice(&self) -> Vec<String> {
        self.0.iter().map(ToString::to_string).collect()
    }

    pub fn primary_v4(&self) -> Option<IpAddr> {
        self.0.iter().copied().find(IpAddr::is_ipv4)
    }

    pub fn primary_v6(&self) -> Option<IpAddr> {
        self.0.iter().copied().find(IpAddr::is_ipv6)
    }

    /// Host prefixes (/32 and /128) covering every address.
    pub fn prefixes(&self) -> Vec<IpNet> {
        self.0.iter().copied().map(IpNet::from).collect()
    }
}

impl From<Vec<IpAddr>> for NodeAddresses {
    fn from(addrs: Vec<IpAddr>) -> Self {
        Self::new(addrs)
    }
}

impl From<NodeAddresses> for Vec<IpAddr> {
    fn from(addrs: NodeAddresses) -> Self {
        addrs.0
    }
}

impl fmt::Display for NodeAddresses {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.string_slice().join(","))
    }
}

/// A registered endpoint of the overlay network.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct Node {
    pub id: NodeId,
    #[serde(default)]
    pub given_name: String,
    #[serde(default)]
    pub user: User,
    pub addresses: NodeAddresses,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub host_info: Option<HostInfo>,
    #[serde(default)]
    pub endpoints: Vec<SocketAddr>,
    #[serde(default)]
    pub online: bool,
}

impl Node {
    /// Whether this node may reach `destination` under `rules`.
    ///
    /// Rules are evaluated in order and the first match wins. An empty rule
    /// set denies everything. The relation is directional.
    pub fn can_access(&self, rules: &[AccessRule], destination: &Node) -> bool {
        rules
            .iter()
            .any(|rule| rule.matches(&self.addresses, &destination.addresses))
    }

    /// Name distributed to peers for this node.
    pub fn fqdn(&self, dns: &DnsSettings) -> Result<String, NamingError> {
        if self.given_name.is_empty() {
            return Err(NamingError::NoGivenName);
        }

        if !dns.magic_dns {
            return Ok(self.given_name.clone());
        }

        if self.user.name.is_empty() {
            return Err(NamingError::NoUserName);
        }

        let domain = dns.base_domain.trim_matches('.');
        if domain.is_empty() {
            return Ok(format!("{}.{}", self.given_name, self.user.name));
        }
        Ok(format!("{}.{}.{}", self.given_name, self.user.name, domain))
    }

    pub fn preferred_relay(&self) -> Option<u32> {
        self.host_info
            .as_ref()
            .and_then(|h| h.net_info.as_ref())
            .map(|n| n.preferred_relay)
            .filter(|region| *region != 0)
    }

    /// Minimal delta to send to peers for `report`.
    ///
    /// Only the preferred relay region is tracked. `None` in the result means
    /// "unchanged", never "reset". The node itself is not modified.
    pub fn peer_change(&self, report: &SelfReport) -> PeerChange {
        let mut change = PeerChange::new(self.id);

        if let Some(incoming) = report.net_info() {
            let region = incoming.preferred_relay;
            if region != 0 && self.preferred_relay() != Some(region) {
                change.relay_region = Some(region);
            }
        }

        change
    }

    /// Store `report` as the node's latest known state.
    pub fn apply_report(&mut self, report: SelfReport) {
        if let Some(host_info) = report.host_info {
            self.host_info = Some(host_info);
        }
        if let Some(endpoints) = report.endpoints {
            self.endpoints = endpoints;
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn addr(s: &str) -> IpAddr {
        s.parse().unwrap()
    }

    fn node_with_relay(region: Option<u32>) -> Node {
        Node {
            id: 1,
            addresses: NodeAddresses::new([addr("100.64.0.1")]),
            host_info: Some(HostInfo {
                net_info: region.map(|preferred_relay| NetInfo { preferred_relay }),
                ..Default::default()
            }),
            ..Default::default()
        }
    }

    fn report_with_relay(region: Option<u32>) -> SelfReport {
        SelfReport {
            host_info: Some(HostInfo {
                net_info: region.map(|preferred_relay| NetInfo { preferred_relay }),
                ..Default::default()
            }),
            endpoints: None,
        }
    }

    fn dns(magic_dns: bool) -> DnsSettings {
        DnsSettings {
            magic_dns,
            base_domain: "example.com".into(),
        }
    }

    fn named(given: &str, user: &str) -> Node {
        Node {
            given_name: given.into(),
            user: User {
                id: 1,
                name: user.into(),
            },
            ..Default::default()
        }
    }

    #[test]
    fn test_addresses_order() {
        let addrs = NodeAddresses::new([
            addr("2001:db8::2"),
            addr("100.64.0.2"),
            addr("2001:db8::1"),
            addr("100.64.0.1"),
        ]);

        assert_eq!(
            addrs.string_slice(),
            vec!["100.64.0.1", "100.64.0.2", "2001:db8::1", "2001:db8::2"]
        );
        assert_eq!(addrs.primary_v4(), Some(addr("100.64.0.1")));
        assert_eq!(addrs.primary_v6(), Some(addr("2001:db8::1")));
        assert_eq!(addrs.to_string(), "100.64.0.1,100.64.0.2,2001:db8::1,2001:db8::2");
    }

    #[test]
    fn test_addresses_empty() {
        let addrs = NodeAddresses::new([]);
        assert!(addrs.is_empty());
        assert!(addrs.string_slice().is_empty());
        assert_eq!(addrs.primary_v4(), None);
    }

    #[test]
    fn test_addresses_deserialize_canonicalizes() {
        let addrs: NodeAddresses =
            serde_json::from_str(r#"["fd7a:115c:a1e0::1", "100.64.0.9", "100.64.0.3"]"#).unwrap();
        assert_eq!(
            addrs.string_slice(),
            vec!["100.64.0.3", "100.64.0.9", "fd7a:115c:a1e0::1"]
        );
    }

    #[test]
    fn test_host_prefixes() {
        let addrs = NodeAddresses::new([addr("100.64.0.1"), addr("fd7a::1")]);
        let prefixes: Vec<String> = addrs.prefixes().iter().map(ToString::to_string).collect();
        assert_eq!(prefixes, vec!["100.64.0.1/32", "fd7a::1/128"]);
    }

    #[test]
    fn test_fqdn_all_set() {
        assert_eq!(
            named("test", "user").fqdn(&dns(true)).unwrap(),
            "test.user.example.com"
        );
    }

    #[test]
    fn test_fqdn_without_magic_dns() {
        assert_eq!(named("test", "user").fqdn(&dns(false)).unwrap(), "test");
        assert_eq!(named("test", "").fqdn(&dns(false)).unwrap(), "test");
    }

    #[test]
    fn test_fqdn_no_given_name() {
        let err = named("", "user").fqdn(&dns(true)).unwrap_err();
        assert_eq!(err, NamingError::NoGivenName);
        assert_eq!(
            err.to_string(),
            "failed to create valid FQDN: node has no given name"
        );
    }

    #[test]
    fn test_fqdn_no_user_name() {
        let err = named("test", "").fqdn(&dns(true)).unwrap_err();
        assert_eq!(
            err.to_string(),
            "failed to create valid FQDN: node user has no name"
        );
    }

    #[test]
    fn test_peer_change_relay_changed() {
        let change = node_with_relay(Some(998)).peer_change(&report_with_relay(Some(999)));
        assert_eq!(change.node_id, 1);
        assert_eq!(change.relay_region, Some(999));
    }

    #[test]
    fn test_peer_change_relay_unchanged() {
        let change = node_with_relay(Some(100)).peer_change(&report_with_relay(Some(100)));
        assert_eq!(change.relay_region, None);
        assert!(!change.has_changes());
    }

    #[test]
    fn test_peer_change_report_without_net_info() {
        let change = node_with_relay(Some(200)).peer_change(&report_with_relay(None));
        assert_eq!(change.relay_region, None);

        let change = node_with_relay(Some(200)).peer_change(&SelfReport::default());
        assert_eq!(change.relay_region, None);
    }

    #[test]
    fn test_peer_change_node_without_net_info() {
        let change = node_with_relay(None).peer_change(&report_with_relay(Some(200)));
        assert_eq!(change.relay_region, Some(200));
    }

    #[test]
    fn test_peer_change_ignores_untracked_fields() {
        let node = node_with_relay(Some(7));
        let report = SelfReport {
            host_info: Some(HostInfo {
                hostname: "renamed".into(),
                net_info: Some(NetInfo { preferred_relay: 7 }),
                routable_ips: vec!["10.0.0.0/24".parse().unwrap()],
            }),
            endpoints: Some(vec!["192.0.2.1:41641".parse().unwrap()]),
        };

        assert!(!node.peer_change(&report).has_changes());
    }

    #[test]
    fn test_apply_report_keeps_missing_fields() {
        let mut node = node_with_relay(Some(5));
        node.endpoints = vec!["192.0.2.1:41641".parse().unwrap()];

        node.apply_report(SelfReport::default());
        assert_eq!(node.preferred_relay(), Some(5));
        assert_eq!(node.endpoints.len(), 1);

        node.apply_report(report_with_relay(Some(6)));
        assert_eq!(node.preferred_relay(), Some(6));
    }
}
