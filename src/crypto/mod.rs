// =============================================================================
// Matrixon Matrix NextServer - Crypto Primitives Module
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
//   Cryptographic primitives for the protocol core: Ed25519 signing keys and
//   signature verification, SHA-256 digests, the password KDF, token hashing
//   and canonical-JSON object signing. Verification never panics on
//   malformed input; a bad signature is a decision, not a fault.
//
// Dependencies:
//   • ed25519-dalek for Ed25519 keys and signatures
//   • sha2 for SHA-256
//   • pbkdf2 for the password KDF
//   • subtle for constant-time comparison
//
// =============================================================================

use std::collections::BTreeMap;

use ed25519_dalek::{Signature, Signer, SigningKey, Verifier, VerifyingKey};
use rand::Rng;
use rand_core::OsRng;
use sha2::{Digest, Sha256};
use subtle::ConstantTimeEq;
use tracing::{debug, warn};

use crate::{
    canonical_json::{to_canonical_bytes, CanonicalJsonObject, CanonicalJsonValue},
    identifiers::ServerName,
    utils, Error, Result,
};

/// PBKDF2 iteration count for password hashing.
const PBKDF2_ITERATIONS: u32 = 100_000;

/// Separator between the key version prefix and the seed in the persisted
/// keypair document.
const KEYPAIR_SEPARATOR: u8 = 0xff;

/// An Ed25519 signing key pair with its Matrix key version.
///
/// The version is the part after `ed25519:` in the key ID. The pair is the
/// single source of truth for all outbound federation signatures.
pub struct Ed25519KeyPair {
    signing_key: SigningKey,
    version: String,
}

impl std::fmt::Debug for Ed25519KeyPair {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        // The private scalar never reaches logs.
        f.debug_struct("Ed25519KeyPair")
            .field("version", &self.version)
            .field("public_key", &self.public_key_base64())
            .finish()
    }
}

impl Ed25519KeyPair {
    /// Generate a brand-new random key pair with a random 8-character version.
    pub fn generate() -> Self {
        let signing_key = SigningKey::generate(&mut OsRng);
        let version = utils::random_string(8);
        debug!("🔑 Generated new Ed25519 keypair, version {}", version);
        Self { signing_key, version }
    }

    /// Reconstruct a key pair from a raw 32-byte seed and its version.
    pub fn from_seed(seed: &[u8], version: impl Into<String>) -> Result<Self> {
        let bytes: [u8; 32] = seed
            .try_into()
            .map_err(|_| Error::bad_config("Ed25519 seed must be exactly 32 bytes"))?;
        Ok(Self {
            signing_key: SigningKey::from_bytes(&bytes),
            version: version.into(),
        })
    }

    /// Serialize as the persisted document: `<version> 0xff <seed>`.
    pub fn to_document(&self) -> Vec<u8> {
        let mut document = self.version.as_bytes().to_vec();
        document.push(KEYPAIR_SEPARATOR);
        document.extend_from_slice(&self.signing_key.to_bytes());
        document
    }

    /// Parse the persisted document form produced by [`Self::to_document`].
    pub fn from_document(document: &[u8]) -> Result<Self> {
        let mut parts = document.splitn(2, |&b| b == KEYPAIR_SEPARATOR);
        let version = parts
            .next()
            .filter(|v| !v.is_empty())
            .and_then(|v| std::str::from_utf8(v).ok())
            .ok_or_else(|| Error::bad_config("Invalid keypair document: missing version"))?;
        let seed = parts
            .next()
            .ok_or_else(|| Error::bad_config("Invalid keypair document: missing seed"))?;
        Self::from_seed(seed, version)
    }

    /// The key version (the part of the key ID after `ed25519:`).
    pub fn version(&self) -> &str {
        &self.version
    }

    /// The full key ID, e.g. `ed25519:a1b2c3d4`.
    pub fn key_id(&self) -> String {
        format!("ed25519:{}", self.version)
    }

    /// The raw 32-byte public key.
    pub fn public_key(&self) -> [u8; 32] {
        self.signing_key.verifying_key().to_bytes()
    }

    /// The public key as unpadded base64, as published in key documents.
    pub fn public_key_base64(&self) -> String {
        utils::unpadded_base64(&self.public_key())
    }

    /// Sign a message, returning the 64-byte signature.
    pub fn sign(&self, message: &[u8]) -> [u8; 64] {
        self.signing_key.sign(message).to_bytes()
    }
}

/// SHA-256 digest.
pub fn sha256(bytes: &[u8]) -> [u8; 32] {
    Sha256::digest(bytes).into()
}

/// SHA-256 digest, hex encoded.
pub fn sha256_hex(bytes: &[u8]) -> String {
    hex::encode(sha256(bytes))
}

/// Verify an Ed25519 signature over a message.
///
/// Returns `false` for any length or decode failure; this function never
/// fails in a way that is distinguishable from a wrong signature.
pub fn verify_ed25519(public_key: &[u8], signature: &[u8], message: &[u8]) -> bool {
    let Ok(key_bytes) = <[u8; 32]>::try_from(public_key) else {
        return false;
    };
    let Ok(verifying_key) = VerifyingKey::from_bytes(&key_bytes) else {
        return false;
    };
    let Ok(sig_bytes) = <[u8; 64]>::try_from(signature) else {
        return false;
    };
    let signature = Signature::from_bytes(&sig_bytes);
    verifying_key.verify(message, &signature).is_ok()
}

/// Calculate a new PBKDF2-SHA256 hash for the given password
///
/// Generates `$pbkdf2-sha256$100000$<salt_b64>$<hash_b64>` with a 16-byte
/// random salt and a 32-byte derived key. Intentionally slow to resist brute
/// force.
///
/// # Examples
/// ```
/// use matrixon_protocol::crypto::calculate_password_hash;
///
/// let hash = calculate_password_hash("secret123");
/// assert!(hash.starts_with("$pbkdf2-sha256$100000$"));
/// ```
pub fn calculate_password_hash(password: &str) -> String {
    let salt: [u8; 16] = rand::thread_rng().gen();
    let mut derived = [0u8; 32];
    pbkdf2::pbkdf2_hmac::<Sha256>(password.as_bytes(), &salt, PBKDF2_ITERATIONS, &mut derived);
    format!(
        "$pbkdf2-sha256${}${}${}",
        PBKDF2_ITERATIONS,
        utils::unpadded_base64(&salt),
        utils::unpadded_base64(&derived),
    )
}

/// Verify a password against a stored `$pbkdf2-sha256$...` hash.
///
/// The comparison over the derived bytes is constant time. Any parse failure
/// of the stored hash verifies as `false`.
pub fn verify_password(password: &str, stored: &str) -> bool {
    let mut parts = stored.split('$');
    let ok = parts.next() == Some("") && parts.next() == Some("pbkdf2-sha256");
    if !ok {
        return false;
    }
    let Some(iterations) = parts.next().and_then(|s| s.parse::<u32>().ok()) else {
        return false;
    };
    let Some(salt) = parts
        .next()
        .and_then(|s| utils::decode_unpadded_base64(s).ok())
    else {
        return false;
    };
    let Some(expected) = parts
        .next()
        .and_then(|s| utils::decode_unpadded_base64(s).ok())
    else {
        return false;
    };
    if parts.next().is_some() || expected.is_empty() {
        return false;
    }

    let mut derived = vec![0u8; expected.len()];
    pbkdf2::pbkdf2_hmac::<Sha256>(password.as_bytes(), &salt, iterations, &mut derived);
    derived.ct_eq(&expected).into()
}

/// Hash an access token for storage: unpadded base64url of its SHA-256.
pub fn hash_token(token: &str) -> String {
    utils::unpadded_base64url(&sha256(token.as_bytes()))
}

/// The canonical signable form of a JSON object: everything except
/// `signatures` and `unsigned`.
pub fn signable_bytes(object: &CanonicalJsonObject) -> Vec<u8> {
    let mut signable = object.clone();
    signable.remove("signatures");
    signable.remove("unsigned");
    to_canonical_bytes(&signable)
}

/// Sign a canonical JSON object in place.
///
/// The signature covers the canonical form with `signatures` and `unsigned`
/// removed; the new `(server, key_id) -> sig` entry is merged into any
/// existing signature map without disturbing other entries.
pub fn sign_json(
    keypair: &Ed25519KeyPair,
    server_name: &ServerName,
    object: &mut CanonicalJsonObject,
) -> Result<()> {
    let signature = keypair.sign(&signable_bytes(object));

    let signatures = object
        .entry("signatures".to_owned())
        .or_insert_with(|| CanonicalJsonValue::Object(BTreeMap::new()))
        .as_object_mut()
        .ok_or_else(|| Error::invalid_json("`signatures` must be an object"))?;
    let server_signatures = signatures
        .entry(server_name.as_str().to_owned())
        .or_insert_with(|| CanonicalJsonValue::Object(BTreeMap::new()))
        .as_object_mut()
        .ok_or_else(|| Error::invalid_json("per-server signatures must be an object"))?;
    server_signatures.insert(
        keypair.key_id(),
        CanonicalJsonValue::String(utils::unpadded_base64(&signature)),
    );
    Ok(())
}

/// Extract the signature `signatures[server][key_id]` from an object.
pub fn extract_signature(
    object: &CanonicalJsonObject,
    server_name: &str,
    key_id: &str,
) -> Result<Vec<u8>> {
    let encoded = object
        .get("signatures")
        .and_then(|v| v.as_object())
        .and_then(|sigs| sigs.get(server_name))
        .and_then(|v| v.as_object())
        .and_then(|keys| keys.get(key_id))
        .and_then(|v| v.as_str())
        .ok_or_else(|| {
            Error::InvalidSignature(format!("no signature by {server_name} with key {key_id}"))
        })?;
    utils::decode_unpadded_base64(encoded)
        .map_err(|_| Error::InvalidSignature(format!("signature by {server_name} is not valid base64")))
}

/// Verify the signature `signatures[server][key_id]` on a canonical JSON
/// object against the given unpadded-base64 public key.
pub fn verify_json(
    public_key_base64: &str,
    server_name: &str,
    key_id: &str,
    object: &CanonicalJsonObject,
) -> Result<()> {
    let signature = extract_signature(object, server_name, key_id)?;
    let public_key = utils::decode_unpadded_base64(public_key_base64)
        .map_err(|_| Error::InvalidSignature(format!("public key for {server_name} is not valid base64")))?;

    if verify_ed25519(&public_key, &signature, &signable_bytes(object)) {
        Ok(())
    } else {
        warn!(server = %server_name, key = %key_id, "❌ Signature verification failed");
        Err(Error::InvalidSignature(format!(
            "signature by {server_name} with key {key_id} does not match"
        )))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::canonical_json::to_canonical_object;

    #[test]
    fn test_sign_verify_round_trip() {
        let keypair = Ed25519KeyPair::generate();
        let message = b"hello matrixon federation";
        let signature = keypair.sign(message);
        assert!(verify_ed25519(&keypair.public_key(), &signature, message));
    }

    #[test]
    fn test_flipped_byte_falsifies_signature() {
        let keypair = Ed25519KeyPair::generate();
        let message = b"hello matrixon federation";
        let mut signature = keypair.sign(message);
        signature[10] ^= 0x01;
        assert!(!verify_ed25519(&keypair.public_key(), &signature, message));

        let signature = keypair.sign(message);
        let mut tampered = message.to_vec();
        tampered[0] ^= 0x01;
        assert!(!verify_ed25519(&keypair.public_key(), &signature, &tampered));
    }

    #[test]
    fn test_verify_never_panics_on_garbage() {
        assert!(!verify_ed25519(b"short", &[0u8; 64], b"msg"));
        assert!(!verify_ed25519(&[0u8; 32], b"short", b"msg"));
        assert!(!verify_ed25519(&[0xffu8; 32], &[0u8; 64], b"msg"));
    }

    #[test]
    fn test_keypair_document_round_trip() {
        let keypair = Ed25519KeyPair::generate();
        let document = keypair.to_document();
        let restored = Ed25519KeyPair::from_document(&document).unwrap();
        assert_eq!(keypair.version(), restored.version());
        assert_eq!(keypair.public_key(), restored.public_key());
        assert!(Ed25519KeyPair::from_document(b"garbage-without-separator").is_err());
    }

    #[test]
    fn test_password_hash_and_verify() {
        let hash = calculate_password_hash("correct horse battery staple");
        assert!(hash.starts_with("$pbkdf2-sha256$100000$"));
        assert!(verify_password("correct horse battery staple", &hash));
        assert!(!verify_password("wrong password", &hash));
        assert!(!verify_password("anything", "$pbkdf2-sha256$notanumber$a$b"));
        assert!(!verify_password("anything", "not a hash at all"));
    }

    #[test]
    fn test_token_hash_is_stable() {
        let hashed = hash_token("syt_secret_token");
        assert_eq!(hashed, hash_token("syt_secret_token"));
        assert_ne!(hashed, hash_token("syt_other_token"));
        // Unpadded base64url of 32 bytes is 43 characters.
        assert_eq!(hashed.len(), 43);
        assert!(!hashed.contains('='));
    }

    #[test]
    fn test_sign_json_merges_signatures() {
        let server_a = ServerName::parse("a.example.com").unwrap();
        let server_b = ServerName::parse("b.example.com").unwrap();
        let keypair_a = Ed25519KeyPair::generate();
        let keypair_b = Ed25519KeyPair::generate();

        let mut object =
            to_canonical_object(serde_json::json!({"content": {"body": "hi"}, "unsigned": {"age": 5}}))
                .unwrap();
        sign_json(&keypair_a, &server_a, &mut object).unwrap();
        sign_json(&keypair_b, &server_b, &mut object).unwrap();

        // Both signatures present, both valid.
        verify_json(&keypair_a.public_key_base64(), server_a.as_str(), &keypair_a.key_id(), &object)
            .unwrap();
        verify_json(&keypair_b.public_key_base64(), server_b.as_str(), &keypair_b.key_id(), &object)
            .unwrap();
    }

    #[test]
    fn test_signature_ignores_unsigned() {
        let server = ServerName::parse("example.com").unwrap();
        let keypair = Ed25519KeyPair::generate();
        let mut object = to_canonical_object(serde_json::json!({"content": 1})).unwrap();
        sign_json(&keypair, &server, &mut object).unwrap();

        // Adding unsigned data afterwards must not invalidate the signature.
        object.insert(
            "unsigned".to_owned(),
            CanonicalJsonValue::Object(BTreeMap::from([(
                "age".to_owned(),
                CanonicalJsonValue::Integer(1000),
            )])),
        );
        verify_json(&keypair.public_key_base64(), server.as_str(), &keypair.key_id(), &object)
            .unwrap();
    }

    #[test]
    fn test_verify_json_missing_signature() {
        let object = to_canonical_object(serde_json::json!({"content": 1})).unwrap();
        let result = verify_json("AA", "example.com", "ed25519:x", &object);
        assert!(matches!(result, Err(Error::InvalidSignature(_))));
    }
}
