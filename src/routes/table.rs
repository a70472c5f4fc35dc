//! Route ownership table shared by every connection worker.
//!
//! Lock order: the prefix map, then a single prefix entry. A task holding an
//! entry lock never waits on the prefix map. The route index is never held
//! together with an entry lock.

use std::collections::{BTreeMap, BTreeSet, HashMap};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;

use ipnet::IpNet;
use log::{debug, info};
use tokio::sync::{Mutex, OwnedMutexGuard, RwLock};

use super::{PrefixRoutes, RouteChange, RouteId, RouteRecord, ServedRoutes};
use crate::error::{CoordinatorError, Result};
use crate::node::NodeId;

type Entry = Arc<Mutex<PrefixRoutes>>;

#[derive(Debug, Clone, Copy)]
struct Location {
    node: NodeId,
    prefix: IpNet,
}

#[derive(Debug)]
pub struct RouteTable {
    prefixes: RwLock<HashMap<IpNet, Entry>>,
    index: RwLock<HashMap<RouteId, Location>>,
    next_id: AtomicU64,
}

impl Default for RouteTable {
    fn default() -> Self {
        Self::new()
    }
}

impl RouteTable {
    pub fn new() -> Self {
        Self {
            prefixes: RwLock::new(HashMap::new()),
            index: RwLock::new(HashMap::new()),
            next_id: AtomicU64::new(1),
        }
    }

    /// Load an advertisement from storage.
    pub async fn insert(&self, record: RouteRecord, online: bool) -> Option<RouteChange> {
        self.next_id.fetch_max(record.id.saturating_add(1), Ordering::SeqCst);

        let change = self
            .lock_or_create(record.prefix)
            .await
            .insert(&record, online);
        self.index.write().await.insert(
            record.id,
            Location {
                node: record.node,
                prefix: record.prefix,
            },
        );
        change
    }

    /// Make the node's advertised set equal to `prefixes`.
    ///
    /// New prefixes get a fresh, not yet enabled advertisement; prefixes the
    /// node no longer announces are deleted.
    pub async fn sync_advertised(
        &self,
        node: NodeId,
        prefixes: &[IpNet],
        online: bool,
    ) -> Vec<RouteChange> {
        let wanted: BTreeSet<IpNet> = prefixes.iter().map(IpNet::trunc).collect();
        let existing = self.routes_of(node).await;
        let mut changes = Vec::new();

        for (id, prefix) in &existing {
            if !wanted.contains(prefix) {
                info!("node {} withdrew route {} ({})", node, prefix, id);
                if let Ok(Some(change)) = self.delete(*id).await {
                    changes.push(change);
                }
            }
        }

        for prefix in wanted {
            if existing.values().any(|p| *p == prefix) {
                continue;
            }
            let id = self.next_id.fetch_add(1, Ordering::SeqCst);
            info!("node {} advertised route {} ({})", node, prefix, id);
            let record = RouteRecord {
                id,
                node,
                prefix,
                advertised: true,
                enabled: false,
                primary: false,
            };
            if let Some(change) = self.insert(record, online).await {
                changes.push(change);
            }
        }

        changes
    }

    pub async fn set_enabled(&self, id: RouteId, enabled: bool) -> Result<Option<RouteChange>> {
        let location = self.locate(id).await?;
        let entry = self
            .entry(location.prefix)
            .await
            .ok_or(CoordinatorError::RouteNotFound(id))?;
        let mut routes = entry.lock().await;
        if !routes.contains(id) {
            return Err(CoordinatorError::RouteNotFound(id));
        }
        Ok(routes.set_enabled(id, enabled))
    }

    /// Propagate a node's connectivity to every prefix it advertises.
    pub async fn set_online(&self, node: NodeId, online: bool) -> Vec<RouteChange> {
        let prefixes: BTreeSet<IpNet> = self.routes_of(node).await.into_values().collect();
        let mut changes = Vec::new();
        for prefix in prefixes {
            if let Some(entry) = self.entry(prefix).await {
                if let Some(change) = entry.lock().await.set_online(node, online) {
                    changes.push(change);
                }
            }
        }
        changes
    }

    /// Delete an advertisement. The prefix disappears with its last one.
    pub async fn delete(&self, id: RouteId) -> Result<Option<RouteChange>> {
        let location = self
            .index
            .write()
            .await
            .remove(&id)
            .ok_or(CoordinatorError::RouteNotFound(id))?;

        let Some(entry) = self.entry(location.prefix).await else {
            return Ok(None);
        };

        let (change, empty) = {
            let mut routes = entry.lock().await;
            (routes.remove(id), routes.is_empty())
        };

        if empty {
            let mut prefixes = self.prefixes.write().await;
            let still_empty = match prefixes.get(&location.prefix) {
                Some(current) if Arc::ptr_eq(current, &entry) => current.lock().await.is_empty(),
                _ => false,
            };
            if still_empty {
                prefixes.remove(&location.prefix);
                debug!("route {} has no advertisers left", location.prefix);
            }
        }

        Ok(change)
    }

    /// Delete every advertisement owned by `node`.
    pub async fn remove_node(&self, node: NodeId) -> Vec<RouteChange> {
        let mut changes = Vec::new();
        for id in self.routes_of(node).await.into_keys() {
            if let Ok(Some(change)) = self.delete(id).await {
                changes.push(change);
            }
        }
        changes
    }

    /// Every advertisement, sorted by id.
    pub async fn list(&self) -> Vec<RouteRecord> {
        let mut records = Vec::new();
        for entry in self.entries().await {
            records.extend(entry.lock().await.records());
        }
        records.sort_by_key(|r| r.id);
        records
    }

    /// Prefixes each node distributes right now.
    pub async fn served(&self) -> ServedRoutes {
        let mut served = ServedRoutes::new();
        for entry in self.entries().await {
            let routes = entry.lock().await;
            for node in routes.served_by() {
                served.entry(node).or_default().push(routes.prefix());
            }
        }
        for prefixes in served.values_mut() {
            prefixes.sort();
        }
        served
    }

    async fn routes_of(&self, node: NodeId) -> BTreeMap<RouteId, IpNet> {
        self.index
            .read()
            .await
            .iter()
            .filter(|(_, location)| location.node == node)
            .map(|(id, location)| (*id, location.prefix))
            .collect()
    }

    async fn locate(&self, id: RouteId) -> Result<Location> {
        self.index
            .read()
            .await
            .get(&id)
            .copied()
            .ok_or(CoordinatorError::RouteNotFound(id))
    }

    async fn entry(&self, prefix: IpNet) -> Option<Entry> {
        self.prefixes.read().await.get(&prefix).cloned()
    }

    /// Lock the entry for `prefix`, creating it if needed. The entry is
    /// locked before the prefix map is released so a concurrent delete
    /// cannot drop it in between.
    async fn lock_or_create(&self, prefix: IpNet) -> OwnedMutexGuard<PrefixRoutes> {
        {
            let prefixes = self.prefixes.read().await;
            if let Some(entry) = prefixes.get(&prefix) {
                return Arc::clone(entry).lock_owned().await;
            }
        }
        let mut prefixes = self.prefixes.write().await;
        let entry = Arc::clone(
            prefixes
                .entry(prefix)
                .or_insert_with(|| Arc::new(Mutex::new(PrefixRoutes::new(prefix)))),
        );
        entry.lock_owned().await
    }

    async fn entries(&self) -> Vec<Entry> {
        self.prefixes.read().await.values().cloned().collect()
    }
}
