// =============================================================================
// Matrixon Matrix NextServer - Globals Module
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
//   Federation key management: this server's signing identity and the store
//   of remote server signing keys with three lookup layers (hot in-process
//   cache, durable cache behind the Data trait, origin fetch). Concurrent
//   fetches for the same server coalesce into a single inflight request.
//
// Performance Targets:
//   • Cache hits answer without suspension
//   • One outbound fetch per server per rotation, regardless of caller count
//
// Features:
//   • Self-verifying key document fetches
//   • Stale-cache fallback when the origin is unreachable
//   • Notary re-signing of remote key documents
//   • Cancellation-aware suspending operations
//
// Architecture:
//   • Async/await native implementation
//   • Single-writer-per-key semantics in the durable cache
//
// Dependencies:
//   • Tokio async runtime
//   • reqwest federation HTTP client
//   • Structured logging with tracing
//
// References:
//   • Matrix spec: https://spec.matrix.org/ (server-server API, key exchange)
//
// =============================================================================

pub mod data;

use std::{
    collections::HashMap,
    sync::{Arc, RwLock as StdRwLock},
};

use async_trait::async_trait;
use tokio::sync::{RwLock, Semaphore};
use tokio_util::sync::CancellationToken;
use tracing::{debug, instrument, warn};

pub use data::{Data, MemoryKeyStore, OldVerifyKey, ServerSigningKeys, SigningKeys, VerifyKey};

use crate::{
    canonical_json::{self, CanonicalJsonObject, CanonicalJsonValue},
    config::Config,
    crypto::{self, Ed25519KeyPair},
    identifiers::ServerName,
    utils, Error, Result,
};

/// Fetches a remote server's key document. The default implementation talks
/// HTTPS; tests substitute their own.
#[async_trait]
pub trait KeyFetcher: Send + Sync {
    /// Fetch `/_matrix/key/v2/server` from the origin, returning the raw
    /// signed document.
    async fn fetch_server_keys(&self, origin: &ServerName) -> Result<CanonicalJsonObject>;
}

/// The production fetcher over reqwest.
pub struct FederationKeyFetcher {
    client: reqwest::Client,
}

impl FederationKeyFetcher {
    pub fn new(config: &Config) -> Result<Self> {
        let client = reqwest::Client::builder()
            .timeout(config.federation_timeout())
            .build()
            .map_err(|_| Error::bad_config("Failed to build federation HTTP client"))?;
        Ok(Self { client })
    }
}

#[async_trait]
impl KeyFetcher for FederationKeyFetcher {
    async fn fetch_server_keys(&self, origin: &ServerName) -> Result<CanonicalJsonObject> {
        let url = format!("https://{}/_matrix/key/v2/server", origin.as_str());
        debug!(%origin, "🌐 Fetching server keys");

        let response = self.client.get(&url).send().await.map_err(|e| {
            if e.is_timeout() || e.is_connect() {
                Error::NotReachable(format!("{origin}: {e}"))
            } else {
                Error::BadServerResponse(format!("{origin}: {e}"))
            }
        })?;
        if !response.status().is_success() {
            return Err(Error::BadServerResponse(format!(
                "{origin} answered the key request with {}",
                response.status()
            )));
        }

        let value: serde_json::Value = response
            .json()
            .await
            .map_err(|e| Error::BadServerResponse(format!("{origin} sent invalid JSON: {e}")))?;
        match CanonicalJsonValue::try_from(value)? {
            CanonicalJsonValue::Object(object) => Ok(object),
            _ => Err(Error::BadServerResponse(format!(
                "{origin} sent a non-object key response"
            ))),
        }
    }
}

pub struct Service {
    pub db: Arc<dyn Data>,
    pub config: Config,
    keypair: Arc<Ed25519KeyPair>,
    fetcher: Arc<dyn KeyFetcher>,
    hot_cache: StdRwLock<HashMap<ServerName, SigningKeys>>,
    servername_ratelimiter: RwLock<HashMap<ServerName, Arc<Semaphore>>>,
}

impl Service {
    /// Load the service with the production fetcher.
    pub fn load(config: Config, keypair: Ed25519KeyPair, db: Arc<dyn Data>) -> Result<Self> {
        config.validate()?;
        let fetcher = Arc::new(FederationKeyFetcher::new(&config)?);
        Ok(Self::with_fetcher(config, keypair, db, fetcher))
    }

    /// Load the service with a custom key fetcher.
    pub fn with_fetcher(
        config: Config,
        keypair: Ed25519KeyPair,
        db: Arc<dyn Data>,
        fetcher: Arc<dyn KeyFetcher>,
    ) -> Self {
        Self {
            db,
            config,
            keypair: Arc::new(keypair),
            fetcher,
            hot_cache: StdRwLock::new(HashMap::new()),
            servername_ratelimiter: RwLock::new(HashMap::new()),
        }
    }

    pub fn server_name(&self) -> &ServerName {
        &self.config.server_name
    }

    pub fn keypair(&self) -> &Ed25519KeyPair {
        &self.keypair
    }

    /// This server's own signed key document, as served from
    /// `GET /_matrix/key/v2/server`.
    pub fn own_server_keys(&self) -> Result<CanonicalJsonObject> {
        let own = SigningKeys::load_own_keys(
            &self.keypair,
            utils::millis_since_unix_epoch() + self.config.own_key_validity_s * 1000,
        );
        let mut object = canonical_json::to_canonical_object(ServerSigningKeys {
            server_name: self.config.server_name.clone(),
            verify_keys: own.verify_keys,
            old_verify_keys: own.old_verify_keys,
            valid_until_ts: own.valid_until_ts,
            signatures: Default::default(),
        })?;
        object.remove("signatures");
        crypto::sign_json(&self.keypair, &self.config.server_name, &mut object)?;
        Ok(object)
    }

    /// Signing keys for a remote server, valid until at least
    /// `min_valid_until_ts` when the origin cooperates.
    ///
    /// Lookup layers: hot cache, durable cache, origin fetch. A fetch
    /// failure falls back to the latest cached entry even past its TTL with
    /// a staleness warning; a miss with no reachable origin surfaces the
    /// fetch error.
    #[instrument(skip(self, cancel), fields(origin = %origin))]
    pub async fn get_signing_keys(
        &self,
        origin: &ServerName,
        min_valid_until_ts: u64,
        cancel: &CancellationToken,
    ) -> Result<SigningKeys> {
        if let Some(keys) = self.cached_keys(origin).await? {
            if keys.valid_until_ts >= min_valid_until_ts {
                return Ok(keys);
            }
        }

        // Coalesce concurrent fetches for the same server into one inflight
        // request.
        let semaphore = {
            let mut limiter = self.servername_ratelimiter.write().await;
            limiter
                .entry(origin.clone())
                .or_insert_with(|| Arc::new(Semaphore::new(1)))
                .clone()
        };
        let _permit = tokio::select! {
            _ = cancel.cancelled() => return Err(Error::Cancelled),
            permit = semaphore.acquire() => permit.expect("semaphore never closed"),
        };

        // Another caller may have completed the fetch while we waited.
        if let Some(keys) = self.db.signing_keys_for(origin).await? {
            if keys.valid_until_ts >= min_valid_until_ts {
                self.hot_cache
                    .write()
                    .expect("hot cache lock poisoned")
                    .insert(origin.clone(), keys.clone());
                return Ok(keys);
            }
        }

        match self.fetch_and_store(origin, cancel).await {
            Ok(keys) => Ok(keys),
            Err(Error::Cancelled) => Err(Error::Cancelled),
            Err(e) => {
                // Stale fallback: a key that validated yesterday is better
                // than no key while the origin is down.
                if let Some(stale) = self.cached_keys(origin).await? {
                    warn!(
                        %origin,
                        error = %e,
                        valid_until_ts = stale.valid_until_ts,
                        "⚠️ Origin unreachable, serving stale signing keys"
                    );
                    return Ok(stale);
                }
                Err(e)
            }
        }
    }

    async fn cached_keys(&self, origin: &ServerName) -> Result<Option<SigningKeys>> {
        if let Some(keys) = self
            .hot_cache
            .read()
            .expect("hot cache lock poisoned")
            .get(origin)
        {
            return Ok(Some(keys.clone()));
        }
        let keys = self.db.signing_keys_for(origin).await?;
        if let Some(keys) = &keys {
            self.hot_cache
                .write()
                .expect("hot cache lock poisoned")
                .insert(origin.clone(), keys.clone());
        }
        Ok(keys)
    }

    async fn fetch_and_store(
        &self,
        origin: &ServerName,
        cancel: &CancellationToken,
    ) -> Result<SigningKeys> {
        let raw = tokio::select! {
            _ = cancel.cancelled() => return Err(Error::Cancelled),
            result = tokio::time::timeout(
                self.config.federation_timeout(),
                self.fetcher.fetch_server_keys(origin),
            ) => result.map_err(|_| {
                Error::NotReachable(format!(
                    "{origin} did not answer the key request within {}s",
                    self.config.federation_timeout_s
                ))
            })??,
        };

        let response = Self::validate_key_response(origin, &raw)?;
        let merged = self.db.add_signing_key_from_origin(origin, response).await?;
        self.hot_cache
            .write()
            .expect("hot cache lock poisoned")
            .insert(origin.clone(), merged.clone());
        debug!(%origin, "✅ Stored fresh signing keys");
        Ok(merged)
    }

    /// A key response must self-verify: at least one of its listed current
    /// keys must validly sign the response itself.
    fn validate_key_response(
        origin: &ServerName,
        raw: &CanonicalJsonObject,
    ) -> Result<ServerSigningKeys> {
        let response: ServerSigningKeys =
            serde_json::from_value(serde_json::Value::from(CanonicalJsonValue::Object(
                raw.clone(),
            )))
            .map_err(|e| Error::BadServerResponse(format!("malformed key response: {e}")))?;

        if response.server_name != *origin {
            return Err(Error::BadServerResponse(format!(
                "key response claims to be for {}, fetched from {origin}",
                response.server_name
            )));
        }

        let self_verified = response.verify_keys.iter().any(|(key_id, key)| {
            crypto::verify_json(&key.key, origin.as_str(), key_id, raw).is_ok()
        });
        if !self_verified {
            return Err(Error::InvalidSignature(format!(
                "key response from {origin} does not verify under any of its own keys"
            )));
        }

        Ok(response)
    }

    /// Verify every signature a PDU carries.
    ///
    /// Each `(server, key_id)` entry must resolve to a known key and match.
    /// Old keys validate only signatures made before their rotation; a key
    /// that cannot be found at all is a [`Error::MissingKey`] so the caller
    /// can retry after rotation.
    #[instrument(skip(self, object, cancel))]
    pub async fn verify_event(
        &self,
        object: &CanonicalJsonObject,
        cancel: &CancellationToken,
    ) -> Result<()> {
        let signatures = object
            .get("signatures")
            .and_then(|v| v.as_object())
            .ok_or_else(|| Error::InvalidSignature("event carries no signatures".to_owned()))?;
        if signatures.is_empty() {
            return Err(Error::InvalidSignature("event carries no signatures".to_owned()));
        }

        let now = utils::millis_since_unix_epoch();
        let signed_at = object
            .get("origin_server_ts")
            .and_then(|v| v.as_integer())
            .map(|ts| ts.max(0) as u64)
            .unwrap_or(now);

        for (server, server_signatures) in signatures {
            let origin = ServerName::parse(server.as_str())?;
            let key_ids = server_signatures
                .as_object()
                .ok_or_else(|| Error::invalid_json("per-server signatures must be an object"))?;

            for key_id in key_ids.keys() {
                if !key_id.starts_with("ed25519:") {
                    continue;
                }
                let keys = self
                    .get_signing_keys(&origin, signed_at.min(now), cancel)
                    .await
                    .map_err(|e| match e {
                        Error::Cancelled => Error::Cancelled,
                        Error::NotReachable(_) | Error::BadServerResponse(_) => {
                            Error::missing_key(server.clone(), key_id.clone())
                        }
                        other => other,
                    })?;

                match keys.key_for(key_id, signed_at) {
                    Some(public_key) => {
                        crypto::verify_json(public_key, server, key_id, object)?;
                    }
                    None if keys.old_verify_keys.contains_key(key_id) => {
                        // The key exists but rotated out before this event
                        // was signed: that is a bad signature, not a gap in
                        // our key knowledge.
                        return Err(Error::InvalidSignature(format!(
                            "key {key_id} of {server} had already expired when this event was signed"
                        )));
                    }
                    None => {
                        return Err(Error::missing_key(server.clone(), key_id.clone()));
                    }
                }
            }
        }

        Ok(())
    }

    /// Opt-in downgrade of verification failures (including missing keys) to
    /// a boolean decision.
    pub async fn is_event_verified(
        &self,
        object: &CanonicalJsonObject,
        cancel: &CancellationToken,
    ) -> bool {
        self.verify_event(object, cancel).await.is_ok()
    }

    /// Fetch a remote server's key response, optionally narrow it to one key
    /// ID, and attach our own notary signature. Backs the key query
    /// endpoint.
    #[instrument(skip(self, cancel), fields(target = %target))]
    pub async fn notary_resign(
        &self,
        target: &ServerName,
        key_id: Option<&str>,
        min_valid_until_ts: u64,
        cancel: &CancellationToken,
    ) -> Result<CanonicalJsonObject> {
        let raw = tokio::select! {
            _ = cancel.cancelled() => return Err(Error::Cancelled),
            result = tokio::time::timeout(
                self.config.federation_timeout(),
                self.fetcher.fetch_server_keys(target),
            ) => result.map_err(|_| {
                Error::NotReachable(format!("{target} did not answer the key request"))
            })??,
        };

        let response = Self::validate_key_response(target, &raw)?;
        if response.valid_until_ts < min_valid_until_ts {
            warn!(
                %target,
                valid_until_ts = response.valid_until_ts,
                min_valid_until_ts,
                "Notary response expires before the requested validity"
            );
        }
        self.db.add_signing_key_from_origin(target, response).await?;

        let mut resigned = raw;
        if let Some(wanted) = key_id {
            if let Some(verify_keys) = resigned
                .get_mut("verify_keys")
                .and_then(|v| v.as_object_mut())
            {
                verify_keys.retain(|id, _| id == wanted);
            }
        }
        crypto::sign_json(&self.keypair, &self.config.server_name, &mut resigned)?;
        Ok(resigned)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicUsize, Ordering};
    use tokio::sync::Mutex;

    fn server(name: &str) -> ServerName {
        ServerName::parse(name).unwrap()
    }

    fn config() -> Config {
        let mut config = Config::new(server("matrixon.example.com"));
        config.federation_timeout_s = 1;
        config
    }

    /// Build a self-signed key response for `origin`, optionally rotating an
    /// old key out at `expired_ts`.
    fn key_response(
        origin: &ServerName,
        keypair: &Ed25519KeyPair,
        old: Option<(&Ed25519KeyPair, u64)>,
    ) -> CanonicalJsonObject {
        let mut verify_keys = std::collections::BTreeMap::new();
        verify_keys.insert(
            keypair.key_id(),
            VerifyKey { key: keypair.public_key_base64() },
        );
        let mut object = canonical_json::to_canonical_object(ServerSigningKeys {
            server_name: origin.clone(),
            verify_keys,
            old_verify_keys: Default::default(),
            valid_until_ts: utils::millis_since_unix_epoch() + 86_400_000,
            signatures: Default::default(),
        })
        .unwrap();
        object.remove("signatures");
        if let Some((old_keypair, expired_ts)) = old {
            let old_entry = canonical_json::to_canonical_object(serde_json::json!({
                "expired_ts": expired_ts,
                "key": old_keypair.public_key_base64(),
            }))
            .unwrap();
            object
                .get_mut("old_verify_keys")
                .and_then(|v| v.as_object_mut())
                .unwrap()
                .insert(old_keypair.key_id(), CanonicalJsonValue::Object(old_entry));
        }
        crypto::sign_json(keypair, origin, &mut object).unwrap();
        object
    }

    struct StaticFetcher {
        responses: Mutex<HashMap<ServerName, CanonicalJsonObject>>,
        fetches: AtomicUsize,
    }

    impl StaticFetcher {
        fn new() -> Self {
            Self {
                responses: Mutex::new(HashMap::new()),
                fetches: AtomicUsize::new(0),
            }
        }

        async fn insert(&self, origin: ServerName, response: CanonicalJsonObject) {
            self.responses.lock().await.insert(origin, response);
        }
    }

    #[async_trait]
    impl KeyFetcher for StaticFetcher {
        async fn fetch_server_keys(&self, origin: &ServerName) -> Result<CanonicalJsonObject> {
            self.fetches.fetch_add(1, Ordering::SeqCst);
            self.responses
                .lock()
                .await
                .get(origin)
                .cloned()
                .ok_or_else(|| Error::NotReachable(format!("{origin} is down")))
        }
    }

    fn service_with(fetcher: Arc<StaticFetcher>) -> Service {
        Service::with_fetcher(
            config(),
            Ed25519KeyPair::generate(),
            Arc::new(MemoryKeyStore::new()),
            fetcher,
        )
    }

    #[tokio::test]
    async fn test_fetch_verifies_and_caches() {
        let remote = server("remote.example.com");
        let remote_keypair = Ed25519KeyPair::generate();
        let fetcher = Arc::new(StaticFetcher::new());
        fetcher
            .insert(remote.clone(), key_response(&remote, &remote_keypair, None))
            .await;
        let service = service_with(fetcher.clone());

        let cancel = CancellationToken::new();
        let keys = service.get_signing_keys(&remote, 0, &cancel).await.unwrap();
        assert!(keys.verify_keys.contains_key(&remote_keypair.key_id()));
        assert_eq!(fetcher.fetches.load(Ordering::SeqCst), 1);

        // Second call is served from cache.
        service.get_signing_keys(&remote, 0, &cancel).await.unwrap();
        assert_eq!(fetcher.fetches.load(Ordering::SeqCst), 1);
    }

    #[tokio::test]
    async fn test_unsigned_response_rejected() {
        let remote = server("remote.example.com");
        let remote_keypair = Ed25519KeyPair::generate();
        let mut response = key_response(&remote, &remote_keypair, None);
        response.remove("signatures");

        let fetcher = Arc::new(StaticFetcher::new());
        fetcher.insert(remote.clone(), response).await;
        let service = service_with(fetcher);

        let result = service
            .get_signing_keys(&remote, 0, &CancellationToken::new())
            .await;
        assert!(matches!(result, Err(Error::InvalidSignature(_))));
    }

    #[tokio::test]
    async fn test_unreachable_origin_with_no_cache_fails() {
        let remote = server("down.example.com");
        let service = service_with(Arc::new(StaticFetcher::new()));
        let result = service
            .get_signing_keys(&remote, 0, &CancellationToken::new())
            .await;
        assert!(matches!(result, Err(Error::NotReachable(_))));
    }

    #[tokio::test]
    async fn test_stale_fallback_when_origin_goes_down() {
        let remote = server("remote.example.com");
        let remote_keypair = Ed25519KeyPair::generate();
        let fetcher = Arc::new(StaticFetcher::new());
        fetcher
            .insert(remote.clone(), key_response(&remote, &remote_keypair, None))
            .await;
        let service = service_with(fetcher.clone());
        let cancel = CancellationToken::new();

        let fresh = service.get_signing_keys(&remote, 0, &cancel).await.unwrap();

        // The origin disappears; a demand for fresher keys still returns the
        // stale record instead of failing.
        fetcher.responses.lock().await.clear();
        let stale = service
            .get_signing_keys(&remote, fresh.valid_until_ts + 1, &cancel)
            .await
            .unwrap();
        assert_eq!(stale.verify_keys, fresh.verify_keys);
    }

    #[tokio::test]
    async fn test_concurrent_fetches_coalesce() {
        let remote = server("remote.example.com");
        let remote_keypair = Ed25519KeyPair::generate();
        let fetcher = Arc::new(StaticFetcher::new());
        fetcher
            .insert(remote.clone(), key_response(&remote, &remote_keypair, None))
            .await;
        let service = Arc::new(service_with(fetcher.clone()));
        let cancel = CancellationToken::new();

        let (a, b) = tokio::join!(
            service.get_signing_keys(&remote, 0, &cancel),
            service.get_signing_keys(&remote, 0, &cancel),
        );
        a.unwrap();
        b.unwrap();
        assert_eq!(fetcher.fetches.load(Ordering::SeqCst), 1);
    }

    #[tokio::test]
    async fn test_cancellation_returns_promptly() {
        struct HangingFetcher;
        #[async_trait]
        impl KeyFetcher for HangingFetcher {
            async fn fetch_server_keys(&self, _origin: &ServerName) -> Result<CanonicalJsonObject> {
                tokio::time::sleep(std::time::Duration::from_secs(600)).await;
                unreachable!("the fetch should have been cancelled")
            }
        }

        let service = Service::with_fetcher(
            config(),
            Ed25519KeyPair::generate(),
            Arc::new(MemoryKeyStore::new()),
            Arc::new(HangingFetcher),
        );
        let cancel = CancellationToken::new();
        cancel.cancel();
        let result = service
            .get_signing_keys(&server("slow.example.com"), 0, &cancel)
            .await;
        assert!(matches!(result, Err(Error::Cancelled)));
    }

    /// Test: Verify the key rotation scenario
    ///
    /// An event signed by a rotated-out key still verifies when it predates
    /// the rotation and fails with InvalidSignature afterwards.
    #[tokio::test]
    async fn test_key_rotation_window() {
        let remote = server("remote.example.com");
        let key_a = Ed25519KeyPair::generate();
        let key_b = Ed25519KeyPair::generate();
        let rotation_ts: u64 = 1_700_000_000_000;

        let fetcher = Arc::new(StaticFetcher::new());
        fetcher
            .insert(
                remote.clone(),
                key_response(&remote, &key_b, Some((&key_a, rotation_ts))),
            )
            .await;
        let service = service_with(fetcher);
        let cancel = CancellationToken::new();

        let mut event_before = canonical_json::to_canonical_object(serde_json::json!({
            "type": "m.room.message",
            "room_id": "!r:remote.example.com",
            "sender": "@user:remote.example.com",
            "origin_server_ts": rotation_ts - 1,
            "content": {"body": "old but valid"},
        }))
        .unwrap();
        crypto::sign_json(&key_a, &remote, &mut event_before).unwrap();
        service.verify_event(&event_before, &cancel).await.unwrap();

        let mut event_after = event_before.clone();
        event_after.remove("signatures");
        event_after.insert(
            "origin_server_ts".to_owned(),
            CanonicalJsonValue::Integer((rotation_ts + 1) as i64),
        );
        crypto::sign_json(&key_a, &remote, &mut event_after).unwrap();
        let result = service.verify_event(&event_after, &cancel).await;
        assert!(matches!(result, Err(Error::InvalidSignature(_))));
    }

    #[tokio::test]
    async fn test_verify_event_unknown_key_is_missing_key() {
        let remote = server("remote.example.com");
        let current = Ed25519KeyPair::generate();
        let rogue = Ed25519KeyPair::generate();

        let fetcher = Arc::new(StaticFetcher::new());
        fetcher
            .insert(remote.clone(), key_response(&remote, &current, None))
            .await;
        let service = service_with(fetcher);
        let cancel = CancellationToken::new();

        let mut event = canonical_json::to_canonical_object(serde_json::json!({
            "type": "m.room.message",
            "sender": "@user:remote.example.com",
            "origin_server_ts": utils::millis_since_unix_epoch(),
            "content": {},
        }))
        .unwrap();
        crypto::sign_json(&rogue, &remote, &mut event).unwrap();

        let result = service.verify_event(&event, &cancel).await;
        assert!(matches!(result, Err(Error::MissingKey { .. })));
        // The opt-in downgrade turns the same failure into a decision.
        assert!(!service.is_event_verified(&event, &cancel).await);
    }

    #[tokio::test]
    async fn test_own_server_keys_self_verify() {
        let service = service_with(Arc::new(StaticFetcher::new()));
        let document = service.own_server_keys().unwrap();
        let parsed = Service::validate_key_response(service.server_name(), &document).unwrap();
        assert!(parsed.verify_keys.contains_key(&service.keypair().key_id()));
    }

    #[tokio::test]
    async fn test_notary_resign_adds_our_signature() {
        let remote = server("remote.example.com");
        let remote_keypair = Ed25519KeyPair::generate();
        let fetcher = Arc::new(StaticFetcher::new());
        fetcher
            .insert(remote.clone(), key_response(&remote, &remote_keypair, None))
            .await;
        let service = service_with(fetcher);

        let resigned = service
            .notary_resign(&remote, None, 0, &CancellationToken::new())
            .await
            .unwrap();

        // Both the origin's own signature and ours are present and valid.
        crypto::verify_json(
            &remote_keypair.public_key_base64(),
            remote.as_str(),
            &remote_keypair.key_id(),
            &resigned,
        )
        .unwrap();
        crypto::verify_json(
            &service.keypair().public_key_base64(),
            service.server_name().as_str(),
            &service.keypair().key_id(),
            &resigned,
        )
        .unwrap();
    }

    #[tokio::test]
    async fn test_notary_resign_narrows_to_key_id() {
        let remote = server("remote.example.com");
        let key_a = Ed25519KeyPair::generate();
        let key_b = Ed25519KeyPair::generate();

        // A response listing two current keys, signed by both.
        let mut verify_keys = std::collections::BTreeMap::new();
        verify_keys.insert(key_a.key_id(), VerifyKey { key: key_a.public_key_base64() });
        verify_keys.insert(key_b.key_id(), VerifyKey { key: key_b.public_key_base64() });
        let mut response = canonical_json::to_canonical_object(ServerSigningKeys {
            server_name: remote.clone(),
            verify_keys,
            old_verify_keys: Default::default(),
            valid_until_ts: utils::millis_since_unix_epoch() + 86_400_000,
            signatures: Default::default(),
        })
        .unwrap();
        response.remove("signatures");
        crypto::sign_json(&key_a, &remote, &mut response).unwrap();
        crypto::sign_json(&key_b, &remote, &mut response).unwrap();

        let fetcher = Arc::new(StaticFetcher::new());
        fetcher.insert(remote.clone(), response).await;
        let service = service_with(fetcher);

        let resigned = service
            .notary_resign(&remote, Some(&key_a.key_id()), 0, &CancellationToken::new())
            .await
            .unwrap();
        let verify_keys = resigned.get("verify_keys").and_then(|v| v.as_object()).unwrap();
        assert!(verify_keys.contains_key(&key_a.key_id()));
        assert!(!verify_keys.contains_key(&key_b.key_id()));
    }
}
