//! The coordination service.
//!
//! One [`Coordinator`] owns the node directory, the route ownership table and
//! the current rule set. Connection workers share it through an `Arc` and
//! hand it [`Event`]s; it answers with [`MapUpdate`]s on the distribution
//! channel and never waits for them to be delivered.

use std::collections::{BTreeMap, BTreeSet};
use std::net::IpAddr;
use std::sync::Arc;

use ipnet::IpNet;
use log::{debug, info, warn};
use tokio::sync::{mpsc, RwLock};

use crate::acl::AccessRule;
use crate::error::{CoordinatorError, Result};
use crate::mapper::{visible_peers, DnsSettings, MapResponse, Mapper};
use crate::node::{Node, NodeId, SelfReport};
use crate::routes::{RouteChange, RouteId, RouteRecord, RouteTable};
use crate::snapshot::Snapshot;
use crate::types::{Event, MapUpdate, PeerChange};

type NodeHandle = Arc<RwLock<Node>>;

pub struct Coordinator {
    nodes: RwLock<BTreeMap<NodeId, NodeHandle>>,
    routes: RouteTable,
    rules: RwLock<Arc<Vec<AccessRule>>>,
    mapper: Mapper,
    updates: mpsc::UnboundedSender<MapUpdate>,
}

impl Coordinator {
    pub fn new(mapper: Mapper, updates: mpsc::UnboundedSender<MapUpdate>) -> Self {
        Self {
            nodes: RwLock::new(BTreeMap::new()),
            routes: RouteTable::new(),
            rules: RwLock::new(Arc::new(Vec::new())),
            mapper,
            updates,
        }
    }

    /// Load persisted state and push a full map to every node.
    pub async fn seed(&self, snapshot: Snapshot) {
        *self.rules.write().await = Arc::new(snapshot.rules);

        {
            let mut nodes = self.nodes.write().await;
            for node in snapshot.nodes {
                nodes.insert(node.id, Arc::new(RwLock::new(node)));
            }
        }

        let mut loaded = 0;
        for record in snapshot.routes {
            let Some(node) = self.node(record.node).await else {
                warn!(
                    "Ignoring route {} for unknown node {}",
                    record.id, record.node
                );
                continue;
            };
            self.routes.insert(record, node.online).await;
            loaded += 1;
        }

        info!(
            "Seeded {} nodes and {} routes",
            self.nodes.read().await.len(),
            loaded
        );
        self.recompute_all().await;
    }

    /// Apply events until the channel closes.
    pub async fn run(self: Arc<Self>, mut events: mpsc::Receiver<Event>) {
        while let Some(event) = events.recv().await {
            if let Err(e) = self.handle(event).await {
                warn!("Event rejected: {}", e);
            }
        }
        info!("Event channel closed, coordinator stopping");
    }

    pub async fn handle(&self, event: Event) -> Result<()> {
        debug!("Handling event: {:?}", event);
        match event {
            Event::NodeOnline { node } => self.set_online(node, true).await,
            Event::NodeOffline { node } => self.set_online(node, false).await,
            Event::SelfReport { node, report } => self.apply_report(node, report).await,
            Event::EnableRoute { route } => self.enable_route(route).await,
            Event::DisableRoute { route } => self.disable_route(route).await,
            Event::DeleteRoute { route } => self.delete_route(route).await,
            Event::PolicyReloaded { rules } => {
                self.reload_policy(rules).await;
                Ok(())
            }
            Event::NodeAdded { node } => {
                self.add_node(node).await;
                Ok(())
            }
            Event::NodeRemoved { node } => self.remove_node(node).await,
        }
    }

    pub async fn enable_route(&self, id: RouteId) -> Result<()> {
        let change = self.routes.set_enabled(id, true).await?;
        info!("Route {} enabled", id);
        self.publish_route_changes(change.into_iter().collect()).await;
        Ok(())
    }

    pub async fn disable_route(&self, id: RouteId) -> Result<()> {
        let change = self.routes.set_enabled(id, false).await?;
        info!("Route {} disabled", id);
        self.publish_route_changes(change.into_iter().collect()).await;
        Ok(())
    }

    pub async fn delete_route(&self, id: RouteId) -> Result<()> {
        let change = self.routes.delete(id).await?;
        info!("Route {} deleted", id);
        self.publish_route_changes(change.into_iter().collect()).await;
        Ok(())
    }

    pub async fn list_routes(&self) -> Vec<RouteRecord> {
        self.routes.list().await
    }

    pub async fn reload_policy(&self, rules: Vec<AccessRule>) {
        info!("Policy reloaded with {} rules", rules.len());
        *self.rules.write().await = Arc::new(rules);
        self.recompute_all().await;
    }

    pub async fn add_node(&self, node: Node) {
        let id = node.id;
        let online = node.online;
        if node.addresses.is_empty() {
            warn!("Node {} registered without overlay addresses", id);
        }
        let replaced = self
            .nodes
            .write()
            .await
            .insert(id, Arc::new(RwLock::new(node)))
            .is_some();
        if replaced {
            warn!("Node {} re-registered, replacing previous record", id);
        } else {
            info!("Node {} registered", id);
        }
        self.routes.set_online(id, online).await;
        self.recompute_all().await;
    }

    pub async fn remove_node(&self, id: NodeId) -> Result<()> {
        self.nodes
            .write()
            .await
            .remove(&id)
            .ok_or(CoordinatorError::NodeNotFound(id))?;
        info!("Node {} removed", id);

        self.routes.remove_node(id).await;
        self.send(MapUpdate::Removed { node: id });
        self.recompute_all().await;
        Ok(())
    }

    pub fn dns_settings(&self) -> &DnsSettings {
        self.mapper.dns()
    }

    pub async fn node(&self, id: NodeId) -> Option<Node> {
        let handle = self.nodes.read().await.get(&id).cloned()?;
        let node = handle.read().await.clone();
        Some(node)
    }

    /// Current map for a single node.
    pub async fn map_for(&self, id: NodeId) -> Result<MapResponse> {
        let nodes = self.nodes().await;
        let target = nodes
            .iter()
            .find(|n| n.id == id)
            .ok_or(CoordinatorError::NodeNotFound(id))?;
        let rules = self.rules.read().await.clone();
        let served = self.routes.served().await;
        self.mapper
            .compose(target, &nodes, &rules, &served)
            .map_err(|source| CoordinatorError::Naming { node: id, source })
    }

    /// Primary addresses of the node answering to `name`.
    ///
    /// The distributed FQDN is tried first. A bare given name only answers
    /// when exactly one node carries it; given names are unique per user,
    /// not across users.
    pub async fn resolve(&self, name: &str) -> Option<Vec<IpAddr>> {
        let wanted = name.trim_end_matches('.');
        if wanted.is_empty() {
            return None;
        }
        let nodes = self.nodes().await;
        let dns = self.mapper.dns();

        let node = match nodes
            .iter()
            .find(|n| n.fqdn(dns).is_ok_and(|fqdn| fqdn.eq_ignore_ascii_case(wanted)))
        {
            Some(node) => node,
            None => {
                let mut labelled = nodes
                    .iter()
                    .filter(|n| n.given_name.eq_ignore_ascii_case(wanted));
                let node = labelled.next()?;
                if labelled.next().is_some() {
                    warn!("Name {} matches several nodes, not answering", wanted);
                    return None;
                }
                node
            }
        };

        Some(
            [node.addresses.primary_v4(), node.addresses.primary_v6()]
                .into_iter()
                .flatten()
                .collect(),
        )
    }

    /// Every node, ordered by id.
    pub async fn nodes(&self) -> Vec<Node> {
        let handles: Vec<NodeHandle> = self.nodes.read().await.values().cloned().collect();
        let mut nodes = Vec::with_capacity(handles.len());
        for handle in handles {
            nodes.push(handle.read().await.clone());
        }
        nodes
    }

    async fn handle_for(&self, id: NodeId) -> Result<NodeHandle> {
        self.nodes
            .read()
            .await
            .get(&id)
            .cloned()
            .ok_or(CoordinatorError::NodeNotFound(id))
    }

    async fn set_online(&self, id: NodeId, online: bool) -> Result<()> {
        let handle = self.handle_for(id).await?;
        let changes = {
            let mut node = handle.write().await;
            if node.online == online {
                debug!("Node {} already {}", id, status(online));
                return Ok(());
            }
            node.online = online;
            info!("Node {} is {}", id, status(online));
            self.routes.set_online(id, online).await
        };

        let mut change = PeerChange::new(id);
        change.online = Some(online);
        self.broadcast_patch(change).await;
        self.recompute(&BTreeSet::from([id])).await;
        self.publish_route_changes(changes).await;
        Ok(())
    }

    async fn apply_report(&self, id: NodeId, report: SelfReport) -> Result<()> {
        let handle = self.handle_for(id).await?;
        // The node lock stays held through the route sync so two reports
        // from the same node cannot interleave.
        let (change, route_changes) = {
            let mut node = handle.write().await;
            let mut change = node.peer_change(&report);
            if let Some(endpoints) = report.endpoints.as_ref() {
                if *endpoints != node.endpoints {
                    change.endpoints = Some(endpoints.clone());
                }
            }
            let advertised: Option<Vec<IpNet>> = report.advertised_routes().map(<[IpNet]>::to_vec);
            node.apply_report(report);

            let route_changes = match advertised {
                Some(prefixes) => {
                    self.routes
                        .sync_advertised(id, &prefixes, node.online)
                        .await
                }
                None => Vec::new(),
            };
            (change, route_changes)
        };

        if change.has_changes() {
            self.broadcast_patch(change).await;
        }
        self.publish_route_changes(route_changes).await;
        Ok(())
    }

    /// Tell peers of every old and new server what it serves now, and
    /// recompute the maps of every advertiser of the changed prefixes.
    async fn publish_route_changes(&self, changes: Vec<RouteChange>) {
        if changes.is_empty() {
            return;
        }

        let mut servers = BTreeSet::new();
        let mut owners = BTreeSet::new();
        for change in &changes {
            servers.extend(change.servers());
            owners.extend(change.advertisers.iter().copied());
        }

        let served = self.routes.served().await;
        for server in &servers {
            let mut change = PeerChange::new(*server);
            change.primary_routes = Some(served.get(server).cloned().unwrap_or_default());
            self.broadcast_patch(change).await;
        }

        owners.extend(servers);
        self.recompute(&owners).await;
    }

    async fn peers_of(&self, id: NodeId) -> Vec<NodeId> {
        let nodes = self.nodes().await;
        let rules = self.rules.read().await.clone();
        nodes
            .iter()
            .find(|n| n.id == id)
            .map(|node| visible_peers(node, &nodes, &rules).iter().map(|p| p.id).collect())
            .unwrap_or_default()
    }

    async fn broadcast_patch(&self, change: PeerChange) {
        let peers = self.peers_of(change.node_id).await;
        debug!(
            "Patching {} peers of node {}: {:?}",
            peers.len(),
            change.node_id,
            change
        );
        for peer in peers {
            self.send(MapUpdate::Patch {
                node: peer,
                changes: vec![change.clone()],
            });
        }
    }

    async fn recompute_all(&self) {
        let all: BTreeSet<NodeId> = self.nodes.read().await.keys().copied().collect();
        self.recompute(&all).await;
    }

    /// Compose and enqueue full maps for `targets`. A node whose map cannot
    /// be built is skipped; the others still get theirs.
    async fn recompute(&self, targets: &BTreeSet<NodeId>) {
        if targets.is_empty() {
            return;
        }
        let nodes = self.nodes().await;
        let rules = self.rules.read().await.clone();
        let served = self.routes.served().await;

        for target in nodes.iter().filter(|n| targets.contains(&n.id)) {
            match self.mapper.compose(target, &nodes, &rules, &served) {
                Ok(map) => self.send(MapUpdate::Full {
                    node: target.id,
                    map,
                }),
                Err(e) => warn!("Cannot compose map for node {}: {}", target.id, e),
            }
        }
        debug!("Recomputed maps for {} nodes", targets.len());
    }

    fn send(&self, update: MapUpdate) {
        if self.updates.send(update).is_err() {
            debug!("Distribution channel closed, dropping update");
        }
    }
}

fn status(online: bool) -> &'static str {
    if online {
        "online"
    } else {
        "offline"
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn coordinator() -> (Coordinator, mpsc::UnboundedReceiver<MapUpdate>) {
        let (tx, rx) = mpsc::unbounded_channel();
        let mapper = Mapper::new(DnsSettings {
            magic_dns: true,
            base_domain: "example.com".into(),
        });
        (Coordinator::new(mapper, tx), rx)
    }

    fn drain(rx: &mut mpsc::UnboundedReceiver<MapUpdate>) -> Vec<MapUpdate> {
        let mut updates = Vec::new();
        while let Ok(update) = rx.try_recv() {
            updates.push(update);
        }
        updates
    }

    #[tokio::test]
    async fn test_unknown_node_events_are_rejected() {
        let (coord, _rx) = coordinator();
        assert_eq!(
            coord.handle(Event::NodeOnline { node: 9 }).await,
            Err(CoordinatorError::NodeNotFound(9))
        );
        assert_eq!(
            coord.handle(Event::EnableRoute { route: 1 }).await,
            Err(CoordinatorError::RouteNotFound(1))
        );
    }

    #[tokio::test]
    async fn test_repeated_online_event_is_a_no_op() {
        let (coord, mut rx) = coordinator();
        let mut node = Node {
            id: 1,
            given_name: "a".into(),
            ..Default::default()
        };
        node.user.name = "alice".into();
        coord.add_node(node).await;
        drain(&mut rx);

        coord.handle(Event::NodeOnline { node: 1 }).await.unwrap();
        assert!(!drain(&mut rx).is_empty());

        coord.handle(Event::NodeOnline { node: 1 }).await.unwrap();
        assert!(drain(&mut rx).is_empty());
    }
}
