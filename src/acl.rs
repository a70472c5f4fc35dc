//! Access rules and the reachability filter.
//!
//! Rules arrive already parsed from the policy loader. Each rule pairs a list
//! of source patterns with a list of destination patterns; a pattern is `*`,
//! a CIDR block or a single address. Destination port ranges are carried for
//! the downstream packet filter and never consulted here.

use std::fmt;
use std::net::IpAddr;
use std::str::FromStr;

use ipnet::{IpNet, Ipv4Net, Ipv6Net};
use serde::{Deserialize, Serialize};

use crate::error::PatternError;
use crate::node::NodeAddresses;

/// One side of an access rule.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(try_from = "String", into = "String")]
pub enum AddressPattern {
    /// Every IPv4 and IPv6 address.
    Any,
    Prefix(IpNet),
}

impl AddressPattern {
    /// CIDR blocks covered by this pattern.
    pub fn expand(&self) -> Vec<IpNet> {
        match self {
            AddressPattern::Any => vec![
                IpNet::V4(Ipv4Net::default()),
                IpNet::V6(Ipv6Net::default()),
            ],
            AddressPattern::Prefix(net) => vec![*net],
        }
    }
}

impl FromStr for AddressPattern {
    type Err = PatternError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let s = s.trim();
        if s == "*" {
            return Ok(AddressPattern::Any);
        }
        if s.contains('/') {
            return s
                .parse::<IpNet>()
                .map(AddressPattern::Prefix)
                .map_err(|_| PatternError::Address(s.to_string()));
        }
        s.parse::<IpAddr>()
            .map(|addr| AddressPattern::Prefix(IpNet::from(addr)))
            .map_err(|_| PatternError::Address(s.to_string()))
    }
}

impl TryFrom<String> for AddressPattern {
    type Error = PatternError;

    fn try_from(s: String) -> Result<Self, Self::Error> {
        s.parse()
    }
}

impl From<AddressPattern> for String {
    fn from(pattern: AddressPattern) -> Self {
        pattern.to_string()
    }
}

impl fmt::Display for AddressPattern {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            AddressPattern::Any => write!(f, "*"),
            AddressPattern::Prefix(net) => write!(f, "{}", net),
        }
    }
}

/// Inclusive port range attached to a destination pattern.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(try_from = "String", into = "String")]
pub struct PortRange {
    pub first: u16,
    pub last: u16,
}

impl PortRange {
    pub const ANY: PortRange = PortRange {
        first: 0,
        last: u16::MAX,
    };
}

impl Default for PortRange {
    fn default() -> Self {
        Self::ANY
    }
}

impl FromStr for PortRange {
    type Err = PatternError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let s = s.trim();
        if s == "*" {
            return Ok(Self::ANY);
        }
        let invalid = || PatternError::Ports(s.to_string());
        let (first, last) = match s.split_once('-') {
            Some((a, b)) => (
                a.parse().map_err(|_| invalid())?,
                b.parse().map_err(|_| invalid())?,
            ),
            None => {
                let port = s.parse().map_err(|_| invalid())?;
                (port, port)
            }
        };
        if first > last {
            return Err(invalid());
        }
        Ok(PortRange { first, last })
    }
}

impl TryFrom<String> for PortRange {
    type Error = PatternError;

    fn try_from(s: String) -> Result<Self, Self::Error> {
        s.parse()
    }
}

impl From<PortRange> for String {
    fn from(range: PortRange) -> Self {
        range.to_string()
    }
}

impl fmt::Display for PortRange {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        if *self == Self::ANY {
            write!(f, "*")
        } else if self.first == self.last {
            write!(f, "{}", self.first)
        } else {
            write!(f, "{}-{}", self.first, self.last)
        }
    }
}

/// Destination address pattern with the ports it opens.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct DestinationPattern {
    pub ip: AddressPattern,
    #[serde(default)]
    pub ports: PortRange,
}

/// A single access rule. Immutable once loaded.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct AccessRule {
    pub sources: Vec<AddressPattern>,
    pub destinations: Vec<DestinationPattern>,
}

impl AccessRule {
    pub fn source_set(&self) -> PrefixSet {
        PrefixSet::from_patterns(self.sources.iter())
    }

    pub fn destination_set(&self) -> PrefixSet {
        PrefixSet::from_patterns(self.destinations.iter().map(|d| &d.ip))
    }

    /// True when any source address falls in the source set and any
    /// destination address falls in the destination set.
    pub fn matches(&self, source: &NodeAddresses, destination: &NodeAddresses) -> bool {
        self.source_set().contains_any(source) && self.destination_set().contains_any(destination)
    }
}

/// Expanded CIDR blocks of one side of a rule.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct PrefixSet(Vec<IpNet>);

impl PrefixSet {
    fn from_patterns<'a>(patterns: impl Iterator<Item = &'a AddressPattern>) -> Self {
        Self(patterns.flat_map(AddressPattern::expand).collect())
    }

    pub fn contains(&self, addr: &IpAddr) -> bool {
        self.0.iter().any(|net| net.contains(addr))
    }

    pub fn contains_any(&self, addrs: &NodeAddresses) -> bool {
        addrs.iter().any(|addr| self.contains(addr))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::node::Node;

    fn node(addr: &str) -> Node {
        Node {
            addresses: NodeAddresses::new([addr.parse().unwrap()]),
            ..Default::default()
        }
    }

    fn rule(src: &str, dst: &str) -> AccessRule {
        AccessRule {
            sources: vec![src.parse().unwrap()],
            destinations: vec![DestinationPattern {
                ip: dst.parse().unwrap(),
                ports: PortRange::ANY,
            }],
        }
    }

    #[test]
    fn test_no_rules_denies() {
        assert!(!node("10.0.0.1").can_access(&[], &node("10.0.0.2")));
    }

    #[test]
    fn test_wildcard_allows() {
        let rules = [rule("*", "*")];
        assert!(node("10.0.0.1").can_access(&rules, &node("10.0.0.2")));
        assert!(node("fd7a::1").can_access(&rules, &node("100.64.0.9")));
    }

    #[test]
    fn test_other_cannot_access() {
        let rules = [rule("100.64.0.2/32", "100.64.0.3/32")];
        assert!(!node("100.64.0.1").can_access(&rules, &node("100.64.0.3")));
    }

    #[test]
    fn test_destination_cannot_access_source() {
        let rules = [rule("100.64.0.2/32", "100.64.0.3/32")];
        assert!(!node("100.64.0.3").can_access(&rules, &node("100.64.0.2")));
    }

    #[test]
    fn test_source_can_access_destination() {
        let rules = [rule("100.64.0.2/32", "100.64.0.3/32")];
        assert!(node("100.64.0.2").can_access(&rules, &node("100.64.0.3")));
    }

    #[test]
    fn test_first_matching_rule_wins() {
        let rules = [
            rule("100.64.0.9/32", "100.64.0.3/32"),
            rule("100.64.0.0/24", "100.64.0.0/24"),
        ];
        assert!(node("100.64.0.2").can_access(&rules, &node("100.64.0.3")));
    }

    #[test]
    fn test_any_address_of_node_matches() {
        let src = Node {
            addresses: NodeAddresses::new([
                "100.64.0.5".parse().unwrap(),
                "fd7a::5".parse().unwrap(),
            ]),
            ..Default::default()
        };
        let rules = [rule("fd7a::/64", "100.64.0.3")];
        assert!(src.can_access(&rules, &node("100.64.0.3")));
    }

    #[test]
    fn test_ports_do_not_affect_reachability() {
        let rules = [AccessRule {
            sources: vec![AddressPattern::Any],
            destinations: vec![DestinationPattern {
                ip: "100.64.0.3/32".parse().unwrap(),
                ports: "22".parse().unwrap(),
            }],
        }];
        assert!(node("100.64.0.1").can_access(&rules, &node("100.64.0.3")));
    }

    #[test]
    fn test_wildcard_expands_both_families() {
        let expanded: Vec<String> = AddressPattern::Any
            .expand()
            .iter()
            .map(ToString::to_string)
            .collect();
        assert_eq!(expanded, vec!["0.0.0.0/0", "::/0"]);
    }

    #[test]
    fn test_parse_patterns() {
        assert_eq!("*".parse::<AddressPattern>().unwrap(), AddressPattern::Any);
        assert_eq!(
            "100.64.0.2".parse::<AddressPattern>().unwrap().to_string(),
            "100.64.0.2/32"
        );
        assert!("not-an-ip".parse::<AddressPattern>().is_err());
        assert!("10.0.0.0/33".parse::<AddressPattern>().is_err());
    }

    #[test]
    fn test_parse_port_ranges() {
        assert_eq!("*".parse::<PortRange>().unwrap(), PortRange::ANY);
        let range: PortRange = "80-443".parse().unwrap();
        assert_eq!((range.first, range.last), (80, 443));
        assert_eq!(range.to_string(), "80-443");
        assert!("443-80".parse::<PortRange>().is_err());
    }

    #[test]
    fn test_rule_deserialize() {
        let json = r#"{
            "sources": ["*"],
            "destinations": [{"ip": "10.0.0.0/8", "ports": "22"}, {"ip": "fd7a::1"}]
        }"#;
        let rule: AccessRule = serde_json::from_str(json).unwrap();
        assert_eq!(rule.sources, vec![AddressPattern::Any]);
        assert_eq!(rule.destinations[0].ports, PortRange { first: 22, last: 22 });
        assert_eq!(rule.destinations[1].ports, PortRange::ANY);
    }
}
