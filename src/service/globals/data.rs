// =============================================================================
// Matrixon Matrix NextServer - Globals Data Module
// =============================================================================
//
// Project: Matrixon - Ultra High Performance Matrix NextServer (Synapse Alternative)
// Author: arkSong (arksong2018@gmail.com) - Founder of Matrixon Innovation Project
// Contributors: Matrixon Development Team
// Date: 2024-12-11
// Version: 0.11.0-alpha
// License: Apache 2.0 / MIT
//
// Description:
//   Durable storage seam for remote server signing keys, plus the wire
//   shapes of /_matrix/key/v2 documents. Rows are keyed by
//   (server_name, key_id); expired keys are retained because they still
//   validate historical signatures.
//
// =============================================================================

use std::collections::{BTreeMap, HashMap};

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use tokio::sync::RwLock;

use crate::{crypto::Ed25519KeyPair, identifiers::ServerName, utils, Result};

/// A currently valid public key in a server's key document.
#[derive(Deserialize, Serialize, Debug, Clone, PartialEq, Eq)]
pub struct VerifyKey {
    /// Unpadded base64 of the raw 32-byte Ed25519 public key.
    pub key: String,
}

/// A rotated-out public key, usable only for signatures made before
/// `expired_ts`.
#[derive(Deserialize, Serialize, Debug, Clone, PartialEq, Eq)]
pub struct OldVerifyKey {
    pub expired_ts: u64,
    pub key: String,
}

/// The signed key document served at `/_matrix/key/v2/server`.
#[derive(Deserialize, Serialize, Debug, Clone)]
pub struct ServerSigningKeys {
    pub server_name: ServerName,
    pub verify_keys: BTreeMap<String, VerifyKey>,
    #[serde(default)]
    pub old_verify_keys: BTreeMap<String, OldVerifyKey>,
    pub valid_until_ts: u64,
    #[serde(default)]
    pub signatures: BTreeMap<String, BTreeMap<String, String>>,
}

/// Similar to ServerSigningKeys, but drops a few unnecessary fields we don't
/// require post-validation.
#[derive(Deserialize, Serialize, Debug, Clone, PartialEq, Eq)]
pub struct SigningKeys {
    pub verify_keys: BTreeMap<String, VerifyKey>,
    pub old_verify_keys: BTreeMap<String, OldVerifyKey>,
    pub valid_until_ts: u64,
    /// When this record was fetched from the origin. Durable writes compare
    /// on this so a stale fetch never overwrites a fresher one.
    pub fetched_ts: u64,
}

impl SigningKeys {
    /// Creates the SigningKeys struct, using the keys of the current server.
    pub fn load_own_keys(keypair: &Ed25519KeyPair, valid_until_ts: u64) -> Self {
        let mut keys = Self {
            verify_keys: BTreeMap::new(),
            old_verify_keys: BTreeMap::new(),
            valid_until_ts,
            fetched_ts: utils::millis_since_unix_epoch(),
        };
        keys.verify_keys.insert(
            keypair.key_id(),
            VerifyKey {
                key: keypair.public_key_base64(),
            },
        );
        keys
    }

    /// Look up the base64 public key for a key ID, honoring the expiry gate
    /// on rotated-out keys: an old key only validates signatures made before
    /// it expired.
    pub fn key_for(&self, key_id: &str, signed_at_ts: u64) -> Option<&str> {
        if let Some(key) = self.verify_keys.get(key_id) {
            return Some(&key.key);
        }
        match self.old_verify_keys.get(key_id) {
            Some(old) if signed_at_ts < old.expired_ts => Some(&old.key),
            _ => None,
        }
    }
}

impl From<ServerSigningKeys> for SigningKeys {
    fn from(value: ServerSigningKeys) -> Self {
        let ServerSigningKeys {
            verify_keys,
            old_verify_keys,
            valid_until_ts,
            ..
        } = value;

        Self {
            verify_keys,
            old_verify_keys,
            valid_until_ts,
            fetched_ts: utils::millis_since_unix_epoch(),
        }
    }
}

#[async_trait]
pub trait Data: Send + Sync {
    /// This returns `Ok(None)` when there are no keys stored for the server.
    async fn signing_keys_for(&self, origin: &ServerName) -> Result<Option<SigningKeys>>;

    /// Only extends the cached keys, not moving any verify_keys to
    /// old_verify_keys, as if we suddenly receive requests from the origin
    /// server, we want to be able to accept requests from them.
    async fn add_signing_key_from_trusted_server(
        &self,
        origin: &ServerName,
        new_keys: ServerSigningKeys,
    ) -> Result<SigningKeys>;

    /// Extends cached keys, as well as moving verify_keys that are not
    /// present in these new keys to old_verify_keys, so that potentially
    /// compromised keys cannot be used to make requests.
    async fn add_signing_key_from_origin(
        &self,
        origin: &ServerName,
        new_keys: ServerSigningKeys,
    ) -> Result<SigningKeys>;
}

/// In-memory reference implementation of [`Data`].
///
/// Embedding servers provide a database-backed implementation with the same
/// compare-and-set behavior on `fetched_ts`.
#[derive(Default)]
pub struct MemoryKeyStore {
    keys: RwLock<HashMap<ServerName, SigningKeys>>,
}

impl MemoryKeyStore {
    pub fn new() -> Self {
        Self::default()
    }

    async fn merge(
        &self,
        origin: &ServerName,
        new_keys: ServerSigningKeys,
        rotate_missing: bool,
    ) -> Result<SigningKeys> {
        let incoming = SigningKeys::from(new_keys);
        let mut store = self.keys.write().await;
        let entry = store.entry(origin.clone());

        let merged = match entry {
            std::collections::hash_map::Entry::Vacant(vacant) => {
                vacant.insert(incoming).clone()
            }
            std::collections::hash_map::Entry::Occupied(mut occupied) => {
                let current = occupied.get_mut();
                // Compare-and-set on fetched_ts: never let a stale fetch
                // clobber a fresher record.
                if incoming.fetched_ts < current.fetched_ts {
                    return Ok(current.clone());
                }

                if rotate_missing {
                    let rotated_out: Vec<(String, VerifyKey)> = current
                        .verify_keys
                        .iter()
                        .filter(|(key_id, _)| !incoming.verify_keys.contains_key(*key_id))
                        .map(|(key_id, key)| (key_id.clone(), key.clone()))
                        .collect();
                    for (key_id, key) in rotated_out {
                        current.old_verify_keys.insert(
                            key_id,
                            OldVerifyKey {
                                expired_ts: incoming.fetched_ts,
                                key: key.key,
                            },
                        );
                    }
                    current.verify_keys = incoming.verify_keys;
                } else {
                    current.verify_keys.extend(incoming.verify_keys);
                }
                current.old_verify_keys.extend(incoming.old_verify_keys);
                current.valid_until_ts = current.valid_until_ts.max(incoming.valid_until_ts);
                current.fetched_ts = incoming.fetched_ts;
                current.clone()
            }
        };

        Ok(merged)
    }
}

#[async_trait]
impl Data for MemoryKeyStore {
    async fn signing_keys_for(&self, origin: &ServerName) -> Result<Option<SigningKeys>> {
        Ok(self.keys.read().await.get(origin).cloned())
    }

    async fn add_signing_key_from_trusted_server(
        &self,
        origin: &ServerName,
        new_keys: ServerSigningKeys,
    ) -> Result<SigningKeys> {
        self.merge(origin, new_keys, false).await
    }

    async fn add_signing_key_from_origin(
        &self,
        origin: &ServerName,
        new_keys: ServerSigningKeys,
    ) -> Result<SigningKeys> {
        self.merge(origin, new_keys, true).await
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn server() -> ServerName {
        ServerName::parse("remote.example.com").unwrap()
    }

    fn keys(ids: &[(&str, &str)], valid_until_ts: u64) -> ServerSigningKeys {
        ServerSigningKeys {
            server_name: server(),
            verify_keys: ids
                .iter()
                .map(|(id, key)| ((*id).to_owned(), VerifyKey { key: (*key).to_owned() }))
                .collect(),
            old_verify_keys: BTreeMap::new(),
            valid_until_ts,
            signatures: BTreeMap::new(),
        }
    }

    /// Test: Verify origin updates rotate absent keys into old_verify_keys
    #[tokio::test]
    async fn test_origin_update_rotates_old_keys() {
        let store = MemoryKeyStore::new();
        store
            .add_signing_key_from_origin(&server(), keys(&[("ed25519:a", "AAAA")], 100))
            .await
            .unwrap();

        let merged = store
            .add_signing_key_from_origin(&server(), keys(&[("ed25519:b", "BBBB")], 200))
            .await
            .unwrap();

        assert!(!merged.verify_keys.contains_key("ed25519:a"));
        assert!(merged.verify_keys.contains_key("ed25519:b"));
        let old = merged.old_verify_keys.get("ed25519:a").expect("rotated out");
        assert_eq!(old.key, "AAAA");
        assert!(old.expired_ts > 0);
    }

    /// Test: Verify trusted-server updates only extend
    #[tokio::test]
    async fn test_trusted_server_update_extends_only() {
        let store = MemoryKeyStore::new();
        store
            .add_signing_key_from_origin(&server(), keys(&[("ed25519:a", "AAAA")], 100))
            .await
            .unwrap();

        let merged = store
            .add_signing_key_from_trusted_server(&server(), keys(&[("ed25519:b", "BBBB")], 200))
            .await
            .unwrap();

        // Both keys stay usable; nothing was rotated out by the notary.
        assert!(merged.verify_keys.contains_key("ed25519:a"));
        assert!(merged.verify_keys.contains_key("ed25519:b"));
        assert!(merged.old_verify_keys.is_empty());
        assert_eq!(merged.valid_until_ts, 200);
    }

    #[tokio::test]
    async fn test_missing_server_returns_none() {
        let store = MemoryKeyStore::new();
        assert!(store.signing_keys_for(&server()).await.unwrap().is_none());
    }

    #[test]
    fn test_key_for_honors_expiry_gate() {
        let mut signing = SigningKeys {
            verify_keys: BTreeMap::new(),
            old_verify_keys: BTreeMap::new(),
            valid_until_ts: 1000,
            fetched_ts: 1,
        };
        signing
            .verify_keys
            .insert("ed25519:current".to_owned(), VerifyKey { key: "CUR".to_owned() });
        signing.old_verify_keys.insert(
            "ed25519:old".to_owned(),
            OldVerifyKey { expired_ts: 500, key: "OLD".to_owned() },
        );

        // Current keys validate at any time.
        assert_eq!(signing.key_for("ed25519:current", 9999), Some("CUR"));
        // Old keys only validate signatures made before they expired.
        assert_eq!(signing.key_for("ed25519:old", 499), Some("OLD"));
        assert_eq!(signing.key_for("ed25519:old", 500), None);
        assert_eq!(signing.key_for("ed25519:old", 501), None);
        assert_eq!(signing.key_for("ed25519:unknown", 0), None);
    }

    #[test]
    fn test_load_own_keys() {
        let keypair = Ed25519KeyPair::generate();
        let own = SigningKeys::load_own_keys(&keypair, 12345);
        assert_eq!(own.valid_until_ts, 12345);
        let key = own.verify_keys.get(&keypair.key_id()).expect("own key present");
        assert_eq!(key.key, keypair.public_key_base64());
    }
}
