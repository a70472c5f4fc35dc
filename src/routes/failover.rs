//! Primary election for one prefix.
//!
//! An advertisement is eligible when it is advertised, enabled and its node
//! is online. Election rules, applied after every change:
//!
//! 1. An eligible incumbent keeps primary, whatever else became eligible.
//! 2. Otherwise the eligible advertisement with the lowest node id wins,
//!    ties broken by the lowest advertisement id.
//! 3. With nothing eligible, an incumbent that is still advertised and
//!    enabled (only offline) keeps primary as the last known good path.
//!    A deleted or disabled incumbent leaves the prefix without a primary.

use std::collections::BTreeMap;

use ipnet::IpNet;
use log::{debug, info};

use super::{is_exit_route, RouteChange, RouteId, RouteRecord};
use crate::node::NodeId;

#[derive(Debug, Clone, PartialEq, Eq)]
struct Slot {
    node: NodeId,
    advertised: bool,
    enabled: bool,
    online: bool,
}

impl Slot {
    fn is_eligible(&self) -> bool {
        self.advertised && self.enabled && self.online
    }

    fn is_distributable(&self) -> bool {
        self.advertised && self.enabled
    }
}

/// Advertisements of a single prefix and its current primary.
#[derive(Debug, Clone)]
pub struct PrefixRoutes {
    prefix: IpNet,
    slots: BTreeMap<RouteId, Slot>,
    primary: Option<RouteId>,
}

impl PrefixRoutes {
    pub fn new(prefix: IpNet) -> Self {
        Self {
            prefix,
            slots: BTreeMap::new(),
            primary: None,
        }
    }

    pub fn prefix(&self) -> IpNet {
        self.prefix
    }

    pub fn is_empty(&self) -> bool {
        self.slots.is_empty()
    }

    pub fn is_exit(&self) -> bool {
        is_exit_route(&self.prefix)
    }

    pub fn primary(&self) -> Option<RouteId> {
        self.primary
    }

    pub fn primary_node(&self) -> Option<NodeId> {
        self.primary
            .and_then(|id| self.slots.get(&id))
            .map(|slot| slot.node)
    }

    pub fn contains(&self, id: RouteId) -> bool {
        self.slots.contains_key(&id)
    }

    /// Advertisement of this prefix by `node`, if any.
    pub fn find(&self, node: NodeId) -> Option<RouteId> {
        self.slots
            .iter()
            .find(|(_, slot)| slot.node == node)
            .map(|(id, _)| *id)
    }

    /// Nodes this prefix is currently distributed from.
    pub fn served_by(&self) -> Vec<NodeId> {
        if self.is_exit() {
            let mut nodes: Vec<NodeId> = self
                .slots
                .values()
                .filter(|slot| slot.is_distributable())
                .map(|slot| slot.node)
                .collect();
            nodes.sort_unstable();
            nodes.dedup();
            return nodes;
        }
        self.primary_node().into_iter().collect()
    }

    pub fn advertisers(&self) -> Vec<NodeId> {
        let mut nodes: Vec<NodeId> = self.slots.values().map(|slot| slot.node).collect();
        nodes.sort_unstable();
        nodes.dedup();
        nodes
    }

    pub fn records(&self) -> Vec<RouteRecord> {
        self.slots
            .iter()
            .map(|(id, slot)| RouteRecord {
                id: *id,
                node: slot.node,
                prefix: self.prefix,
                advertised: slot.advertised,
                enabled: slot.enabled,
                primary: self.primary == Some(*id),
            })
            .collect()
    }

    /// Add (or replace) an advertisement.
    ///
    /// A record loaded with `primary` set restores that primary when the
    /// prefix has none, so the last known good path survives a restart.
    pub fn insert(&mut self, record: &RouteRecord, online: bool) -> Option<RouteChange> {
        self.transition(|routes| {
            routes.slots.insert(
                record.id,
                Slot {
                    node: record.node,
                    advertised: record.advertised,
                    enabled: record.enabled,
                    online,
                },
            );
            if record.primary && routes.primary.is_none() && !routes.is_exit() {
                routes.primary = Some(record.id);
            }
        })
    }

    pub fn set_enabled(&mut self, id: RouteId, enabled: bool) -> Option<RouteChange> {
        self.transition(|routes| {
            if let Some(slot) = routes.slots.get_mut(&id) {
                slot.enabled = enabled;
            }
        })
    }

    pub fn set_advertised(&mut self, id: RouteId, advertised: bool) -> Option<RouteChange> {
        self.transition(|routes| {
            if let Some(slot) = routes.slots.get_mut(&id) {
                slot.advertised = advertised;
            }
        })
    }

    /// Record connectivity of every advertisement owned by `node`.
    pub fn set_online(&mut self, node: NodeId, online: bool) -> Option<RouteChange> {
        self.transition(|routes| {
            for slot in routes.slots.values_mut().filter(|slot| slot.node == node) {
                slot.online = online;
            }
        })
    }

    /// Delete an advertisement outright.
    pub fn remove(&mut self, id: RouteId) -> Option<RouteChange> {
        self.transition(|routes| {
            routes.slots.remove(&id);
        })
    }

    fn transition(&mut self, apply: impl FnOnce(&mut Self)) -> Option<RouteChange> {
        let previous_primary = self.primary;
        let previous = self.served_by();

        apply(self);
        self.elect();

        if self.primary != previous_primary {
            info!(
                "route {}: primary moved from {:?} to {:?}",
                self.prefix, previous_primary, self.primary
            );
        }

        let current = self.served_by();
        if previous == current {
            return None;
        }

        debug!(
            "route {}: served by {:?}, was {:?}",
            self.prefix, current, previous
        );
        Some(RouteChange {
            prefix: self.prefix,
            previous,
            current,
            advertisers: self.advertisers(),
        })
    }

    fn elect(&mut self) {
        if self.is_exit() {
            self.primary = None;
            return;
        }

        if let Some(slot) = self.primary.and_then(|id| self.slots.get(&id)) {
            if slot.is_eligible() {
                return;
            }
        }

        let winner = self
            .slots
            .iter()
            .filter(|(_, slot)| slot.is_eligible())
            .min_by_key(|(id, slot)| (slot.node, **id))
            .map(|(id, _)| *id);

        match winner {
            Some(id) => self.primary = Some(id),
            None => {
                let last_known_good = self
                    .primary
                    .and_then(|id| self.slots.get(&id))
                    .is_some_and(Slot::is_distributable);
                if !last_known_good {
                    self.primary = None;
                }
            }
        }
    }
}
