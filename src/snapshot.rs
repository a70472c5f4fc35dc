//! Start-up state exported by the storage layer.

use std::path::Path;

use serde::{Deserialize, Serialize};

use crate::acl::AccessRule;
use crate::node::Node;
use crate::routes::RouteRecord;

/// Nodes, route advertisements and the parsed rule set, as persisted.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct Snapshot {
    #[serde(default)]
    pub nodes: Vec<Node>,
    #[serde(default)]
    pub routes: Vec<RouteRecord>,
    #[serde(default)]
    pub rules: Vec<AccessRule>,
}

impl Snapshot {
    /// Load a snapshot from a JSON file
    pub async fn load(path: &Path) -> anyhow::Result<Self> {
        let contents = tokio::fs::read_to_string(path)
            .await
            .map_err(|e| anyhow::anyhow!("Failed to read seed file {}: {}", path.display(), e))?;
        let snapshot = serde_json::from_str(&contents)
            .map_err(|e| anyhow::anyhow!("Invalid seed file {}: {}", path.display(), e))?;
        Ok(snapshot)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_parse_snapshot() {
        let json = r#"{
            "nodes": [
                {"id": 1, "given_name": "router", "user": {"id": 1, "name": "ops"},
                 "addresses": ["fd7a::1", "100.64.0.1"], "online": true}
            ],
            "routes": [{"id": 1, "node": 1, "prefix": "10.0.0.0/24", "enabled": true}],
            "rules": [{"sources": ["*"], "destinations": [{"ip": "*"}]}]
        }"#;
        let snapshot: Snapshot = serde_json::from_str(json).unwrap();

        assert_eq!(snapshot.nodes[0].addresses.string_slice(), vec!["100.64.0.1", "fd7a::1"]);
        assert!(snapshot.routes[0].advertised);
        assert!(!snapshot.routes[0].primary);
        assert_eq!(snapshot.rules.len(), 1);
    }

    #[tokio::test]
    async fn test_load_missing_file() {
        let err = Snapshot::load(Path::new("/nonexistent/netmapd-seed.json"))
            .await
            .unwrap_err();
        assert!(err.to_string().contains("Failed to read seed file"));
    }
}
