// =============================================================================
// Matrixon Matrix NextServer - Federation Signing Module
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
//   X-Matrix request authentication for server-to-server traffic. Outbound
//   requests sign the canonical {method, uri, origin, destination, content?}
//   object; inbound requests reconstruct the same object and verify it
//   against the origin's stored signing key. Also carries the federation
//   wire envelopes the core's callers exchange.
//
// =============================================================================

use std::collections::BTreeMap;

use serde::{Deserialize, Serialize};
use serde_json::value::RawValue as RawJsonValue;
use tokio_util::sync::CancellationToken;
use tracing::{debug, instrument, warn};

use crate::{
    canonical_json::{self, CanonicalJsonObject, CanonicalJsonValue},
    crypto::{self, Ed25519KeyPair},
    identifiers::ServerName,
    service::globals,
    utils, Error, Result,
};

/// Maximum PDUs accepted in one federation transaction.
pub const TRANSACTION_PDU_LIMIT: usize = 50;
/// Maximum EDUs accepted in one federation transaction.
pub const TRANSACTION_EDU_LIMIT: usize = 100;

/// A parsed `X-Matrix` Authorization header.
///
/// ```text
/// X-Matrix origin="origin.hs.example.com",destination="dest.hs.example.com",
///          key="ed25519:key1",sig="ABCDEF..."
/// ```
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct XMatrix {
    pub origin: ServerName,
    pub destination: Option<ServerName>,
    pub key_id: String,
    pub sig: String,
}

impl XMatrix {
    /// Render the header value for an outbound request.
    pub fn to_header(&self) -> String {
        let destination = self
            .destination
            .as_ref()
            .map(|d| format!("destination=\"{d}\","))
            .unwrap_or_default();
        format!(
            "X-Matrix origin=\"{}\",{}key=\"{}\",sig=\"{}\"",
            self.origin, destination, self.key_id, self.sig,
        )
    }

    /// Parse an `X-Matrix` header tolerantly: fields in any order, optional
    /// quoting, surplus whitespace accepted.
    pub fn parse(header: &str) -> Result<Self> {
        let rest = header
            .trim()
            .strip_prefix("X-Matrix")
            .ok_or_else(|| Error::unauthorized_request("Authorization scheme is not X-Matrix"))?
            .trim_start();

        let mut origin = None;
        let mut destination = None;
        let mut key_id = None;
        let mut sig = None;

        for part in rest.split(',') {
            let Some((name, value)) = part.split_once('=') else {
                continue;
            };
            let value = value.trim().trim_matches('"').to_owned();
            match name.trim().to_ascii_lowercase().as_str() {
                "origin" => origin = Some(value),
                "destination" => destination = Some(value),
                "key" => key_id = Some(value),
                "sig" => sig = Some(value),
                unknown => debug!(field = unknown, "Ignoring unknown X-Matrix field"),
            }
        }

        let origin = origin
            .ok_or_else(|| Error::unauthorized_request("X-Matrix header is missing `origin`"))
            .and_then(ServerName::parse)?;
        let destination = destination.map(ServerName::parse).transpose()?;
        Ok(Self {
            origin,
            destination,
            key_id: key_id
                .ok_or_else(|| Error::unauthorized_request("X-Matrix header is missing `key`"))?,
            sig: sig
                .ok_or_else(|| Error::unauthorized_request("X-Matrix header is missing `sig`"))?,
        })
    }
}

/// Build the canonical object whose signature authenticates a federation
/// request. `content` is included iff the request has a body.
fn build_signing_object(
    method: &str,
    uri: &str,
    origin: &ServerName,
    destination: &ServerName,
    content: Option<&CanonicalJsonValue>,
) -> CanonicalJsonObject {
    let mut object = CanonicalJsonObject::new();
    object.insert(
        "method".to_owned(),
        CanonicalJsonValue::String(method.to_uppercase()),
    );
    object.insert("uri".to_owned(), CanonicalJsonValue::String(uri.to_owned()));
    object.insert(
        "origin".to_owned(),
        CanonicalJsonValue::String(origin.as_str().to_owned()),
    );
    object.insert(
        "destination".to_owned(),
        CanonicalJsonValue::String(destination.as_str().to_owned()),
    );
    if let Some(content) = content {
        object.insert("content".to_owned(), content.clone());
    }
    object
}

/// Sign an outbound federation request, producing the `X-Matrix` header
/// material.
pub fn sign_request(
    keypair: &Ed25519KeyPair,
    origin: &ServerName,
    destination: &ServerName,
    method: &str,
    uri: &str,
    content: Option<&CanonicalJsonValue>,
) -> XMatrix {
    let object = build_signing_object(method, uri, origin, destination, content);
    let signature = keypair.sign(&canonical_json::to_canonical_bytes(&object));
    XMatrix {
        origin: origin.clone(),
        destination: Some(destination.clone()),
        key_id: keypair.key_id(),
        sig: utils::unpadded_base64url(&signature),
    }
}

/// Verify an inbound federation request.
///
/// Reconstructs the canonical request object and checks the claimed
/// signature against the origin's stored key. The signed destination must be
/// present and must be this server's canonical name. Returns the
/// authenticated origin.
#[instrument(skip(globals, authorization, content, cancel), fields(method = method, uri = uri))]
pub async fn verify_request(
    globals: &globals::Service,
    authorization: &str,
    method: &str,
    uri: &str,
    content: Option<&CanonicalJsonValue>,
    cancel: &CancellationToken,
) -> Result<ServerName> {
    let parsed = XMatrix::parse(authorization)?;

    let destination = parsed
        .destination
        .as_ref()
        .ok_or_else(|| Error::unauthorized_request("X-Matrix header is missing `destination`"))?;
    if destination != globals.server_name() {
        return Err(Error::unauthorized_request(format!(
            "request was signed for {destination}, but we are {}",
            globals.server_name()
        )));
    }

    let signature = utils::decode_unpadded_base64url(&parsed.sig)
        .or_else(|_| utils::decode_unpadded_base64(&parsed.sig))
        .map_err(|_| Error::unauthorized_request("X-Matrix signature is not valid base64"))?;

    let now = utils::millis_since_unix_epoch();
    let keys = globals
        .get_signing_keys(&parsed.origin, now, cancel)
        .await?;
    let public_key = keys.key_for(&parsed.key_id, now).ok_or_else(|| {
        Error::missing_key(parsed.origin.as_str(), parsed.key_id.clone())
    })?;
    let public_key = utils::decode_unpadded_base64(public_key)
        .map_err(|_| Error::InvalidSignature(format!("stored key for {} is corrupt", parsed.origin)))?;

    let object = build_signing_object(method, uri, &parsed.origin, destination, content);
    if !crypto::verify_ed25519(
        &public_key,
        &signature,
        &canonical_json::to_canonical_bytes(&object),
    ) {
        warn!(origin = %parsed.origin, "❌ X-Matrix signature mismatch");
        return Err(Error::unauthorized_request(format!(
            "X-Matrix signature by {} does not match the request",
            parsed.origin
        )));
    }

    debug!(origin = %parsed.origin, "✅ Federation request authenticated");
    Ok(parsed.origin)
}

/// The body of `PUT /_matrix/federation/v1/send/<txn_id>`. Receivers treat
/// the pair `(origin, txn_id)` as idempotent.
#[derive(Debug, Serialize, Deserialize)]
pub struct Transaction {
    pub origin: ServerName,
    pub origin_server_ts: u64,
    pub pdus: Vec<Box<RawJsonValue>>,
    #[serde(default)]
    pub edus: Vec<Box<RawJsonValue>>,
}

impl Transaction {
    pub fn validate(&self) -> Result<()> {
        if self.pdus.len() > TRANSACTION_PDU_LIMIT {
            return Err(Error::invalid_event(format!(
                "transaction carries {} PDUs, limit is {TRANSACTION_PDU_LIMIT}",
                self.pdus.len()
            )));
        }
        if self.edus.len() > TRANSACTION_EDU_LIMIT {
            return Err(Error::invalid_event(format!(
                "transaction carries {} EDUs, limit is {TRANSACTION_EDU_LIMIT}",
                self.edus.len()
            )));
        }
        Ok(())
    }
}

/// Selection criteria in a `POST /_matrix/key/v2/query` request.
#[derive(Debug, Default, Serialize, Deserialize)]
pub struct QueryCriteria {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub minimum_valid_until_ts: Option<u64>,
}

/// The body of `POST /_matrix/key/v2/query`.
#[derive(Debug, Default, Serialize, Deserialize)]
pub struct QueryKeysRequest {
    pub server_keys: BTreeMap<ServerName, BTreeMap<String, QueryCriteria>>,
}

/// The notary's answer: re-signed key documents.
#[derive(Debug, Default, Serialize, Deserialize)]
pub struct QueryKeysResponse {
    pub server_keys: Vec<CanonicalJsonObject>,
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::{
        config::Config,
        service::globals::{data::Data, MemoryKeyStore, Service, ServerSigningKeys, VerifyKey},
    };
    use std::sync::Arc;

    fn server(name: &str) -> ServerName {
        ServerName::parse(name).unwrap()
    }

    /// A local service that already knows the remote's signing key.
    async fn service_knowing(remote: &ServerName, remote_keypair: &Ed25519KeyPair) -> Service {
        let db = Arc::new(MemoryKeyStore::new());
        let mut verify_keys = BTreeMap::new();
        verify_keys.insert(
            remote_keypair.key_id(),
            VerifyKey {
                key: remote_keypair.public_key_base64(),
            },
        );
        db.add_signing_key_from_origin(
            remote,
            ServerSigningKeys {
                server_name: remote.clone(),
                verify_keys,
                old_verify_keys: Default::default(),
                valid_until_ts: utils::millis_since_unix_epoch() + 86_400_000,
                signatures: Default::default(),
            },
        )
        .await
        .unwrap();

        struct NoFetcher;
        #[async_trait::async_trait]
        impl crate::service::globals::KeyFetcher for NoFetcher {
            async fn fetch_server_keys(
                &self,
                origin: &ServerName,
            ) -> Result<CanonicalJsonObject> {
                Err(Error::NotReachable(format!("{origin} is not fetchable in tests")))
            }
        }

        Service::with_fetcher(
            Config::new(server("local.example.com")),
            Ed25519KeyPair::generate(),
            db,
            Arc::new(NoFetcher),
        )
    }

    #[test]
    fn test_header_round_trip() {
        let header = XMatrix {
            origin: server("origin.example.com"),
            destination: Some(server("dest.example.com")),
            key_id: "ed25519:key1".to_owned(),
            sig: "c2lnbmF0dXJl".to_owned(),
        };
        let parsed = XMatrix::parse(&header.to_header()).unwrap();
        assert_eq!(parsed, header);
    }

    #[test]
    fn test_parse_is_tolerant() {
        // Reordered fields, no quotes, stray spaces.
        let parsed = XMatrix::parse(
            "X-Matrix sig=abc , key = \"ed25519:k\", origin=origin.example.com, destination=dest.example.com",
        )
        .unwrap();
        assert_eq!(parsed.origin.as_str(), "origin.example.com");
        assert_eq!(parsed.destination.unwrap().as_str(), "dest.example.com");
        assert_eq!(parsed.key_id, "ed25519:k");
        assert_eq!(parsed.sig, "abc");

        // Destination may be absent at parse time; verify_request insists on it.
        let parsed =
            XMatrix::parse("X-Matrix origin=\"o.example.com\",key=\"ed25519:k\",sig=\"abc\"").unwrap();
        assert!(parsed.destination.is_none());

        assert!(XMatrix::parse("Bearer token").is_err());
        assert!(XMatrix::parse("X-Matrix origin=\"o.example.com\",key=\"ed25519:k\"").is_err());
    }

    #[tokio::test]
    async fn test_request_round_trip() {
        let remote = server("origin.example.com");
        let remote_keypair = Ed25519KeyPair::generate();
        let service = service_knowing(&remote, &remote_keypair).await;
        let cancel = CancellationToken::new();

        let body = canonical_json::to_canonical_value(serde_json::json!({
            "origin": remote.as_str(),
            "origin_server_ts": 1_700_000_000_000u64,
            "pdus": [],
        }))
        .unwrap();

        let header = sign_request(
            &remote_keypair,
            &remote,
            service.server_name(),
            "PUT",
            "/_matrix/federation/v1/send/txn1",
            Some(&body),
        );

        let origin = verify_request(
            &service,
            &header.to_header(),
            "PUT",
            "/_matrix/federation/v1/send/txn1",
            Some(&body),
            &cancel,
        )
        .await
        .unwrap();
        assert_eq!(origin, remote);
    }

    #[tokio::test]
    async fn test_tampered_request_rejected() {
        let remote = server("origin.example.com");
        let remote_keypair = Ed25519KeyPair::generate();
        let service = service_knowing(&remote, &remote_keypair).await;
        let cancel = CancellationToken::new();

        let body = canonical_json::to_canonical_value(serde_json::json!({"a": 1})).unwrap();
        let tampered = canonical_json::to_canonical_value(serde_json::json!({"a": 2})).unwrap();
        let header = sign_request(
            &remote_keypair,
            &remote,
            service.server_name(),
            "PUT",
            "/_matrix/federation/v1/send/txn1",
            Some(&body),
        );

        for (method, uri, content) in [
            ("PUT", "/_matrix/federation/v1/send/txn1", Some(&tampered)),
            ("PUT", "/_matrix/federation/v1/send/txn2", Some(&body)),
            ("GET", "/_matrix/federation/v1/send/txn1", Some(&body)),
        ] {
            let result = verify_request(
                &service,
                &header.to_header(),
                method,
                uri,
                content,
                &cancel,
            )
            .await;
            assert!(
                matches!(result, Err(Error::Unauthorized { .. })),
                "{method} {uri} should fail verification"
            );
        }
    }

    #[tokio::test]
    async fn test_wrong_or_missing_destination_rejected() {
        let remote = server("origin.example.com");
        let remote_keypair = Ed25519KeyPair::generate();
        let service = service_knowing(&remote, &remote_keypair).await;
        let cancel = CancellationToken::new();

        // Signed for some other server.
        let header = sign_request(
            &remote_keypair,
            &remote,
            &server("someone-else.example.com"),
            "GET",
            "/_matrix/federation/v1/version",
            None,
        );
        let result = verify_request(
            &service,
            &header.to_header(),
            "GET",
            "/_matrix/federation/v1/version",
            None,
            &cancel,
        )
        .await;
        assert!(matches!(result, Err(Error::Unauthorized { .. })));

        // Destination omitted entirely.
        let mut no_dest = sign_request(
            &remote_keypair,
            &remote,
            service.server_name(),
            "GET",
            "/_matrix/federation/v1/version",
            None,
        );
        no_dest.destination = None;
        let result = verify_request(
            &service,
            &no_dest.to_header(),
            "GET",
            "/_matrix/federation/v1/version",
            None,
            &cancel,
        )
        .await;
        assert!(matches!(result, Err(Error::Unauthorized { .. })));
    }

    #[tokio::test]
    async fn test_unknown_key_is_missing_key() {
        let remote = server("origin.example.com");
        let known = Ed25519KeyPair::generate();
        let rogue = Ed25519KeyPair::generate();
        let service = service_knowing(&remote, &known).await;

        let header = sign_request(
            &rogue,
            &remote,
            service.server_name(),
            "GET",
            "/_matrix/federation/v1/version",
            None,
        );
        let result = verify_request(
            &service,
            &header.to_header(),
            "GET",
            "/_matrix/federation/v1/version",
            None,
            &CancellationToken::new(),
        )
        .await;
        assert!(matches!(result, Err(Error::MissingKey { .. })));
    }

    #[test]
    fn test_transaction_limits() {
        let transaction = Transaction {
            origin: server("origin.example.com"),
            origin_server_ts: 1,
            pdus: vec![],
            edus: vec![],
        };
        transaction.validate().unwrap();

        let pdu = serde_json::value::to_raw_value(&serde_json::json!({})).unwrap();
        let oversized = Transaction {
            origin: server("origin.example.com"),
            origin_server_ts: 1,
            pdus: (0..=TRANSACTION_PDU_LIMIT).map(|_| pdu.clone()).collect(),
            edus: vec![],
        };
        assert!(oversized.validate().is_err());
    }

    #[test]
    fn test_query_request_shape() {
        let json = r#"{"server_keys": {"remote.example.com": {"ed25519:abc": {"minimum_valid_until_ts": 1234}}}}"#;
        let request: QueryKeysRequest = serde_json::from_str(json).unwrap();
        let criteria = &request.server_keys[&server("remote.example.com")]["ed25519:abc"];
        assert_eq!(criteria.minimum_valid_until_ts, Some(1234));
    }
}
