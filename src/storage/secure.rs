// Copyright 2026 Daniel Pelikan
//
// Licensed under the Apache License, Version 2.0 (the "License");
// you may not use this file except in compliance with the License.
// You may obtain a copy of the License at
//
//     http://www.apache.org/licenses/LICENSE-2.0
//
// Unless required by applicable law or agreed to in writing, software
// distributed under the License is distributed on an "AS IS" BASIS,
// WITHOUT WARRANTIES OR CONDITIONS OF ANY KIND, either express or implied.
// See the License for the specific language governing permissions and
// limitations under the License.

//! Persistent pairing credentials.
//!
//! One record per peer device. Records are what allow silent auto-approval
//! on reconnect; removing a record forces the full pairing flow. A corrupt
//! store is treated as empty for the same reason.

use base64::{engine::general_purpose::STANDARD as BASE64, Engine};
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::path::{Path, PathBuf};
use tracing::{info, warn};

use crate::crypto;
use crate::protocol::LinkError;

/// A paired peer and its session secret.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct PairedPeer {
    /// BLE address, where known (the central records it; the peripheral may
    /// not learn it and leaves it empty).
    pub peer_address: String,
    pub peer_device_id: String,
    pub self_device_id: String,
    /// Derived 32-byte session key, Base64 at rest.
    pub shared_secret: String,
    pub paired_at: chrono::DateTime<chrono::Local>,
}

impl PairedPeer {
    /// Decode the stored session key.
    pub fn secret_key(&self) -> Result<[u8; 32], LinkError> {
        let bytes = BASE64
            .decode(&self.shared_secret)
            .map_err(|e| LinkError::Storage(format!("corrupt stored secret: {}", e)))?;
        if bytes.len() != 32 {
            return Err(LinkError::Storage(format!(
                "stored secret has {} bytes, expected 32",
                bytes.len()
            )));
        }
        let mut key = [0u8; 32];
        key.copy_from_slice(&bytes);
        Ok(key)
    }
}

/// Credential store backed by a JSON file in the data directory.
pub struct SecureStore {
    path: PathBuf,
    device_id_path: PathBuf,
    peers: HashMap<String, PairedPeer>,
}

impl SecureStore {
    /// Open (or create) the store under the given data directory.
    pub fn open(data_dir: &Path) -> Result<Self, LinkError> {
        std::fs::create_dir_all(data_dir)
            .map_err(|e| LinkError::Storage(format!("cannot create data dir: {}", e)))?;

        let path = data_dir.join("paired_devices.json");
        let peers = if path.exists() {
            let content = std::fs::read_to_string(&path)
                .map_err(|e| LinkError::Storage(format!("cannot read {}: {}", path.display(), e)))?;
            match serde_json::from_str(&content) {
                Ok(peers) => peers,
                Err(e) => {
                    // Unreadable credentials force a re-pair rather than a
                    // broken session.
                    warn!("Corrupt credential store ({}), starting empty", e);
                    HashMap::new()
                }
            }
        } else {
            HashMap::new()
        };

        Ok(Self {
            device_id_path: data_dir.join("device_id"),
            path,
            peers,
        })
    }

    /// Load the persistent device ID, generating one on first run.
    pub fn load_or_create_device_id(&self, platform: &str) -> Result<String, LinkError> {
        if self.device_id_path.exists() {
            let id = std::fs::read_to_string(&self.device_id_path)
                .map_err(|e| LinkError::Storage(format!("cannot read device id: {}", e)))?;
            let id = id.trim();
            if !id.is_empty() {
                return Ok(id.to_string());
            }
        }

        let id = crypto::generate_device_id(platform);
        std::fs::write(&self.device_id_path, &id)
            .map_err(|e| LinkError::Storage(format!("cannot write device id: {}", e)))?;
        info!("Generated device ID {}", id);
        Ok(id)
    }

    /// Store (or replace) the record for a peer.
    pub fn store_peer(
        &mut self,
        peer_address: &str,
        peer_device_id: &str,
        self_device_id: &str,
        key: &[u8; 32],
    ) -> Result<(), LinkError> {
        let record = PairedPeer {
            peer_address: peer_address.to_string(),
            peer_device_id: peer_device_id.to_string(),
            self_device_id: self_device_id.to_string(),
            shared_secret: BASE64.encode(key),
            paired_at: chrono::Local::now(),
        };
        self.peers.insert(record.peer_device_id.clone(), record);
        self.save()?;
        info!("Stored pairing for device {}", peer_device_id);
        Ok(())
    }

    pub fn peer_by_device_id(&self, peer_device_id: &str) -> Option<&PairedPeer> {
        self.peers.get(peer_device_id)
    }

    pub fn peer_by_address(&self, peer_address: &str) -> Option<&PairedPeer> {
        if peer_address.is_empty() {
            return None;
        }
        self.peers
            .values()
            .find(|p| p.peer_address == peer_address)
    }

    pub fn remove_peer_by_device_id(&mut self, peer_device_id: &str) -> Result<(), LinkError> {
        self.peers.remove(peer_device_id);
        self.save()
    }

    pub fn peers(&self) -> impl Iterator<Item = &PairedPeer> {
        self.peers.values()
    }

    fn save(&self) -> Result<(), LinkError> {
        let content = serde_json::to_string_pretty(&self.peers)
            .map_err(|e| LinkError::Storage(e.to_string()))?;
        std::fs::write(&self.path, content)
            .map_err(|e| LinkError::Storage(format!("cannot write {}: {}", self.path.display(), e)))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::tempdir;

    #[test]
    fn test_store_and_lookup() {
        let dir = tempdir().unwrap();
        let mut store = SecureStore::open(dir.path()).unwrap();

        let key = [42u8; 32];
        store
            .store_peer("AA:BB:CC:DD:EE:FF", "android-abc", "linux-xyz", &key)
            .unwrap();

        let record = store.peer_by_device_id("android-abc").unwrap();
        assert_eq!(record.peer_address, "AA:BB:CC:DD:EE:FF");
        assert_eq!(record.secret_key().unwrap(), key);

        let by_addr = store.peer_by_address("AA:BB:CC:DD:EE:FF").unwrap();
        assert_eq!(by_addr.peer_device_id, "android-abc");
    }

    #[test]
    fn test_persists_across_open() {
        let dir = tempdir().unwrap();
        let key = [7u8; 32];
        {
            let mut store = SecureStore::open(dir.path()).unwrap();
            store.store_peer("", "android-abc", "linux-xyz", &key).unwrap();
        }

        let store = SecureStore::open(dir.path()).unwrap();
        assert_eq!(
            store
                .peer_by_device_id("android-abc")
                .unwrap()
                .secret_key()
                .unwrap(),
            key
        );
    }

    #[test]
    fn test_remove_forces_repair() {
        let dir = tempdir().unwrap();
        let mut store = SecureStore::open(dir.path()).unwrap();
        store.store_peer("", "android-abc", "linux-xyz", &[1u8; 32]).unwrap();

        store.remove_peer_by_device_id("android-abc").unwrap();
        assert!(store.peer_by_device_id("android-abc").is_none());

        let reopened = SecureStore::open(dir.path()).unwrap();
        assert!(reopened.peer_by_device_id("android-abc").is_none());
    }

    #[test]
    fn test_corrupt_store_starts_empty() {
        let dir = tempdir().unwrap();
        std::fs::write(dir.path().join("paired_devices.json"), "not json at all").unwrap();

        let store = SecureStore::open(dir.path()).unwrap();
        assert_eq!(store.peers().count(), 0);
    }

    #[test]
    fn test_device_id_is_stable() {
        let dir = tempdir().unwrap();
        let store = SecureStore::open(dir.path()).unwrap();

        let first = store.load_or_create_device_id("linux").unwrap();
        let second = store.load_or_create_device_id("linux").unwrap();
        assert_eq!(first, second);
        assert!(first.starts_with("linux-"));
    }
}
