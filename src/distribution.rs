//! Map distribution subsystem.
//!
//! Consumes [`MapUpdate`]s produced by the coordinator and hands them to a
//! [`MapSink`]. A full map identical to the last one delivered to the same
//! node is dropped, so recomputations that change nothing cost nothing on
//! the wire.

use std::collections::HashMap;

use async_trait::async_trait;
use log::{debug, error, info};
use sha2::{Digest, Sha256};
use tokio::sync::mpsc;

use crate::mapper::MapResponse;
use crate::node::NodeId;
use crate::types::MapUpdate;

/// Destination of map updates, usually the per-node connection writers.
#[async_trait]
pub trait MapSink: Send + Sync {
    async fn deliver(&self, update: &MapUpdate) -> anyhow::Result<()>;
}

/// Sink that only logs what would be sent.
#[derive(Debug, Default, Clone, Copy)]
pub struct LogSink;

#[async_trait]
impl MapSink for LogSink {
    async fn deliver(&self, update: &MapUpdate) -> anyhow::Result<()> {
        let json = serde_json::to_string(update)?;
        info!("Map update for node {}: {}", update.node(), json);
        Ok(())
    }
}

/// SHA-256 of the JSON encoding of `map`, hex encoded.
pub fn fingerprint(map: &MapResponse) -> Result<String, serde_json::Error> {
    let bytes = serde_json::to_vec(map)?;
    Ok(hex::encode(Sha256::digest(&bytes)))
}

/// Remembers the last full map sent to each node.
#[derive(Debug, Default)]
pub struct Deduplicator {
    last: HashMap<NodeId, String>,
}

impl Deduplicator {
    pub fn new() -> Self {
        Self::default()
    }

    /// Whether `update` carries anything the node has not already received.
    pub fn admit(&mut self, update: &MapUpdate) -> bool {
        match update {
            MapUpdate::Full { node, map } => match fingerprint(map) {
                Ok(digest) => {
                    if self.last.get(node) == Some(&digest) {
                        return false;
                    }
                    self.last.insert(*node, digest);
                    true
                }
                Err(e) => {
                    error!("Failed to fingerprint map for node {}: {}", node, e);
                    self.last.remove(node);
                    true
                }
            },
            // A patched node no longer holds the last full map.
            MapUpdate::Patch { node, .. } | MapUpdate::Removed { node } => {
                self.last.remove(node);
                true
            }
        }
    }
}

/// Runs the distribution loop until the coordinator drops its sender.
pub async fn run_distribution<S: MapSink>(
    mut update_rx: mpsc::UnboundedReceiver<MapUpdate>,
    sink: S,
) -> anyhow::Result<()> {
    let mut dedup = Deduplicator::new();

    while let Some(update) = update_rx.recv().await {
        if !dedup.admit(&update) {
            debug!("Map for node {} unchanged, not resending", update.node());
            continue;
        }
        if let Err(e) = sink.deliver(&update).await {
            error!("Failed to deliver update to node {}: {}", update.node(), e);
        }
    }

    info!("Update channel closed, distribution stopping");
    Ok(())
}

#[cfg(test)]
mod tests {
    use std::sync::Arc;

    use tokio::sync::Mutex;

    use super::*;
    use crate::mapper::PeerEntry;
    use crate::types::PeerChange;

    fn map(name: &str) -> MapResponse {
        MapResponse {
            node: PeerEntry {
                id: 1,
                name: name.into(),
                addresses: vec!["100.64.0.1".into()],
                allowed_ips: vec!["100.64.0.1/32".parse().unwrap()],
                primary_routes: Vec::new(),
                relay_region: None,
                endpoints: Vec::new(),
                online: true,
            },
            peers: Vec::new(),
            domain: String::new(),
        }
    }

    #[derive(Default, Clone)]
    struct RecordingSink {
        delivered: Arc<Mutex<Vec<MapUpdate>>>,
    }

    #[async_trait]
    impl MapSink for RecordingSink {
        async fn deliver(&self, update: &MapUpdate) -> anyhow::Result<()> {
            self.delivered.lock().await.push(update.clone());
            Ok(())
        }
    }

    #[test]
    fn test_fingerprint_is_stable() {
        let a = fingerprint(&map("a")).unwrap();
        assert_eq!(a, fingerprint(&map("a")).unwrap());
        assert_ne!(a, fingerprint(&map("b")).unwrap());
        assert_eq!(a.len(), 64);
    }

    #[test]
    fn test_dedup_drops_identical_maps() {
        let mut dedup = Deduplicator::new();
        let full = MapUpdate::Full { node: 1, map: map("a") };

        assert!(dedup.admit(&full));
        assert!(!dedup.admit(&full));
        assert!(dedup.admit(&MapUpdate::Full { node: 1, map: map("b") }));
        assert!(dedup.admit(&MapUpdate::Full { node: 2, map: map("b") }));
    }

    #[test]
    fn test_dedup_forgets_removed_nodes() {
        let mut dedup = Deduplicator::new();
        let full = MapUpdate::Full { node: 1, map: map("a") };
        assert!(dedup.admit(&full));
        assert!(dedup.admit(&MapUpdate::Removed { node: 1 }));
        assert!(dedup.admit(&full));
    }

    #[test]
    fn test_dedup_resends_full_map_after_patch() {
        let mut dedup = Deduplicator::new();
        let full = MapUpdate::Full { node: 1, map: map("a") };
        assert!(dedup.admit(&full));
        assert!(dedup.admit(&MapUpdate::Patch {
            node: 1,
            changes: vec![PeerChange::new(2)],
        }));
        assert!(dedup.admit(&full));
    }

    #[tokio::test]
    async fn test_run_distribution_delivers_in_order() {
        let (tx, rx) = mpsc::unbounded_channel();
        let sink = RecordingSink::default();

        tx.send(MapUpdate::Full { node: 1, map: map("a") }).unwrap();
        tx.send(MapUpdate::Full { node: 1, map: map("a") }).unwrap();
        tx.send(MapUpdate::Patch {
            node: 1,
            changes: vec![PeerChange::new(2)],
        })
        .unwrap();
        drop(tx);

        run_distribution(rx, sink.clone()).await.unwrap();

        let delivered = sink.delivered.lock().await;
        assert_eq!(delivered.len(), 2);
        assert!(matches!(delivered[0], MapUpdate::Full { .. }));
        assert!(matches!(delivered[1], MapUpdate::Patch { .. }));
    }
}
