// =============================================================================
// Matrixon Matrix NextServer - Protocol Utils Module
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
//   Small shared helpers for the protocol core: timestamps, random strings
//   and the base64 flavors Matrix uses on the wire.
//
// =============================================================================

pub mod error;

use std::time::{SystemTime, UNIX_EPOCH};

use base64::{
    engine::general_purpose::{STANDARD_NO_PAD, URL_SAFE_NO_PAD},
    Engine as _,
};
use rand::{distributions::Alphanumeric, thread_rng, Rng};
use tracing::instrument;

pub use error::{AuthRule, Error, Result};

/// Returns the current time in milliseconds since Unix epoch
///
/// This function provides high-precision timestamp generation for Matrix
/// events and server operations. Critical for event ordering and
/// `origin_server_ts` stamping.
///
/// # Returns
/// * `u64` - Milliseconds since Unix epoch (January 1, 1970)
///
/// # Examples
/// ```
/// use matrixon_protocol::utils::millis_since_unix_epoch;
///
/// let timestamp = millis_since_unix_epoch();
/// assert!(timestamp > 1640995200000); // After 2022-01-01
/// ```
#[instrument(level = "trace")]
pub fn millis_since_unix_epoch() -> u64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .expect("time is valid")
        .as_millis() as u64
}

/// Returns the current time in seconds since Unix epoch
///
/// Provides second-precision timestamps for less time-critical operations
/// where millisecond precision is not required.
#[instrument(level = "trace")]
pub fn secs_since_unix_epoch() -> u64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .expect("time is valid")
        .as_secs()
}

/// Generates a cryptographically secure random string
///
/// Creates random alphanumeric strings for key version identifiers, tokens
/// and salts. The `Alphanumeric` distribution samples the 62-character
/// alphabet `[A-Za-z0-9]` with rejection sampling, so the output carries no
/// modulo bias.
///
/// # Arguments
/// * `length` - Desired length of the random string
///
/// # Examples
/// ```
/// use matrixon_protocol::utils::random_string;
///
/// let token = random_string(32);
/// assert_eq!(token.len(), 32);
/// assert!(token.chars().all(|c| c.is_ascii_alphanumeric()));
/// ```
pub fn random_string(length: usize) -> String {
    thread_rng()
        .sample_iter(Alphanumeric)
        .take(length)
        .map(char::from)
        .collect()
}

/// Encodes bytes as unpadded standard base64, the encoding Matrix uses for
/// signatures, content hashes and public keys inside JSON documents.
pub fn unpadded_base64(bytes: &[u8]) -> String {
    STANDARD_NO_PAD.encode(bytes)
}

/// Decodes unpadded standard base64. Padding is tolerated on input since some
/// older servers still emit it.
pub fn decode_unpadded_base64(input: &str) -> Result<Vec<u8>> {
    let trimmed = input.trim_end_matches('=');
    STANDARD_NO_PAD
        .decode(trimmed)
        .map_err(|e| Error::InvalidJson(format!("invalid base64: {e}")))
}

/// Encodes bytes as unpadded URL-safe base64, used for room v4+ event IDs and
/// hashed tokens.
pub fn unpadded_base64url(bytes: &[u8]) -> String {
    URL_SAFE_NO_PAD.encode(bytes)
}

/// Decodes unpadded URL-safe base64.
pub fn decode_unpadded_base64url(input: &str) -> Result<Vec<u8>> {
    let trimmed = input.trim_end_matches('=');
    URL_SAFE_NO_PAD
        .decode(trimmed)
        .map_err(|e| Error::InvalidJson(format!("invalid base64url: {e}")))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_millis_are_monotonic_enough() {
        let a = millis_since_unix_epoch();
        let b = millis_since_unix_epoch();
        assert!(b >= a);
        assert!(a > 1_600_000_000_000, "clock should be past 2020");
    }

    #[test]
    fn test_random_string_length_and_alphabet() {
        for length in [0, 1, 16, 64] {
            let s = random_string(length);
            assert_eq!(s.len(), length);
            assert!(s.chars().all(|c| c.is_ascii_alphanumeric()));
        }
    }

    #[test]
    fn test_random_strings_differ() {
        // Collisions of two 32-char tokens would indicate a broken RNG.
        assert_ne!(random_string(32), random_string(32));
    }

    #[test]
    fn test_base64_round_trips() {
        let bytes = b"matrixon federation";
        assert_eq!(
            decode_unpadded_base64(&unpadded_base64(bytes)).unwrap(),
            bytes
        );
        assert_eq!(
            decode_unpadded_base64url(&unpadded_base64url(bytes)).unwrap(),
            bytes
        );
    }

    #[test]
    fn test_base64_accepts_padded_input() {
        // 1-byte input needs two padding chars in padded form.
        assert_eq!(decode_unpadded_base64("AA==").unwrap(), vec![0u8]);
        assert_eq!(decode_unpadded_base64("AA").unwrap(), vec![0u8]);
    }
}
