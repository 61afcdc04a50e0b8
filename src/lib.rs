// =============================================================================
// Matrixon Matrix NextServer - Protocol Core Library
// =============================================================================
//
// Project: Matrixon - Ultra High Performance Matrix NextServer (Synapse Alternative)
// Author: arkSong (arksong2018@gmail.com) - Founder of Matrixon Innovation Project
// Date: 2024-12-11
// Version: 0.11.0-alpha
// License: Apache 2.0 / MIT
//
// Description:
//   The protocol core of the Matrixon NextServer: canonical JSON, Ed25519
//   event signing, the event authorization rules, state resolution and
//   federation key management. Everything else in Matrixon (routing,
//   persistence, sync, media, push) is a collaborator calling into this
//   crate; bugs here cause permanently diverging room state across the
//   federation, so correctness outranks every other concern.
//
// =============================================================================

pub mod canonical_json;
pub mod config;
pub mod crypto;
pub mod federation;
pub mod identifiers;
pub mod room_version;
pub mod service;
pub mod utils;

// Re-export common types
pub use tokio;
pub use tracing;

pub use canonical_json::{CanonicalJsonObject, CanonicalJsonValue};
pub use config::Config;
pub use identifiers::{EventId, RoomId, ServerName, UserId};
pub use service::{pdu::PduEvent, Services};
pub use utils::error::{AuthRule, Error, Result};
