//! Inventory file: seeds client endpoints before any heartbeat arrives.
//!
//! The deployer and the proxy routes need `(host, api_port)` for clients
//! that may not have reported yet; `inventory.yaml` supplies them.

use std::path::Path;

use serde::Deserialize;
use tracing::info;

use crate::fleet_store::{FleetStore, FleetStoreError};

#[derive(Debug, Deserialize)]
struct InventoryDoc {
    #[serde(default)]
    clients: Vec<InventoryClient>,
}

#[derive(Debug, Deserialize)]
struct InventoryClient {
    name: String,
    host: String,
    #[serde(default = "default_api_port")]
    api_port: u16,
}

fn default_api_port() -> u16 {
    9100
}

#[derive(Debug, thiserror::Error)]
pub enum InventoryError {
    #[error("{path}: {source}")]
    Io {
        path: std::path::PathBuf,
        #[source]
        source: std::io::Error,
    },
    #[error("{path}: invalid YAML: {source}")]
    Yaml {
        path: std::path::PathBuf,
        #[source]
        source: serde_yaml::Error,
    },
    #[error(transparent)]
    Store(#[from] FleetStoreError),
}

/// Loads `inventory.yaml` into the fleet store. A missing file is not an
/// error; the fleet then relies on heartbeats alone.
pub fn seed_from_file(store: &FleetStore, path: &Path) -> Result<usize, InventoryError> {
    if !path.exists() {
        return Ok(0);
    }
    let raw = std::fs::read_to_string(path).map_err(|source| InventoryError::Io {
        path: path.to_path_buf(),
        source,
    })?;
    let doc: InventoryDoc =
        serde_yaml::from_str(&raw).map_err(|source| InventoryError::Yaml {
            path: path.to_path_buf(),
            source,
        })?;
    for client in &doc.clients {
        store.upsert_client_endpoint(&client.name, &client.host, client.api_port)?;
    }
    info!(count = doc.clients.len(), "seeded clients from inventory");
    Ok(doc.clients.len())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn seeds_endpoints_from_yaml() {
        let dir = tempfile::tempdir().unwrap();
        let store = FleetStore::open(&dir.path().join("fleet.db")).unwrap();
        let path = dir.path().join("inventory.yaml");
        std::fs::write(
            &path,
            concat!(
                "clients:\n",
                "  - name: edge-01\n",
                "    host: 10.0.0.5\n",
                "  - name: edge-02\n",
                "    host: 10.0.0.6\n",
                "    api_port: 9200\n",
            ),
        )
        .unwrap();

        assert_eq!(seed_from_file(&store, &path).unwrap(), 2);
        assert_eq!(
            store.resolve_endpoint("edge-01").unwrap(),
            Some(("10.0.0.5".to_string(), 9100))
        );
        assert_eq!(
            store.resolve_endpoint("edge-02").unwrap(),
            Some(("10.0.0.6".to_string(), 9200))
        );
    }

    #[test]
    fn missing_file_seeds_nothing() {
        let dir = tempfile::tempdir().unwrap();
        let store = FleetStore::open(&dir.path().join("fleet.db")).unwrap();
        assert_eq!(
            seed_from_file(&store, &dir.path().join("absent.yaml")).unwrap(),
            0
        );
    }
}
