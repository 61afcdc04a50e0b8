// =============================================================================
// Matrixon Matrix NextServer - Protocol Error Module
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
//   Error surface of the protocol core. Every failure the core can produce is
//   a value of this enum; the core never panics on untrusted input.
//
// =============================================================================

use std::fmt;

use thiserror::Error;

/// The authorization rule that rejected an event.
///
/// Rules are numbered as they are applied; the first failing rule wins and is
/// carried inside [`Error::Unauthorized`] so federation ingress can log which
/// check an incoming PDU tripped over.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum AuthRule {
    /// Rule 1: `m.room.create` shape, and create presence for everything else.
    CreateEvent,
    /// Rule 2: the `m.room.member` state machine.
    Membership,
    /// Rule 3: the sender of a non-membership event must be joined.
    SenderMembership,
    /// Rule 4: `m.room.third_party_invite` power check.
    ThirdPartyInvite,
    /// Rule 5: state event power check.
    StatePowerLevel,
    /// Rule 6: message event power check.
    MessagePowerLevel,
    /// Rule 7: `m.room.power_levels` escalation guard.
    PowerLevelChange,
    /// Rule 8: `m.room.redaction` power check.
    Redaction,
}

impl AuthRule {
    /// The rule number as applied in order.
    pub fn number(&self) -> u8 {
        match self {
            AuthRule::CreateEvent => 1,
            AuthRule::Membership => 2,
            AuthRule::SenderMembership => 3,
            AuthRule::ThirdPartyInvite => 4,
            AuthRule::StatePowerLevel => 5,
            AuthRule::MessagePowerLevel => 6,
            AuthRule::PowerLevelChange => 7,
            AuthRule::Redaction => 8,
        }
    }
}

impl fmt::Display for AuthRule {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            AuthRule::CreateEvent => "create event",
            AuthRule::Membership => "membership",
            AuthRule::SenderMembership => "sender membership",
            AuthRule::ThirdPartyInvite => "third-party invite",
            AuthRule::StatePowerLevel => "state power level",
            AuthRule::MessagePowerLevel => "message power level",
            AuthRule::PowerLevelChange => "power level change",
            AuthRule::Redaction => "redaction",
        };
        write!(f, "{} ({})", self.number(), name)
    }
}

fn rule_suffix(rule: &Option<AuthRule>) -> String {
    match rule {
        Some(rule) => format!(" by rule {rule}"),
        None => String::new(),
    }
}

/// Matrixon protocol core error type.
///
/// Errors are surfaced to callers as values, never as process faults.
/// Authorization and state resolution never perform I/O and therefore can
/// only produce the pure kinds (`Unauthorized`, `InvalidEvent`, ...).
#[derive(Debug, Error)]
pub enum Error {
    #[error("Invalid JSON: {0}")]
    InvalidJson(String),

    #[error("Invalid signature: {0}")]
    InvalidSignature(String),

    #[error("No usable signing key for {server} ({key_id})")]
    MissingKey { server: String, key_id: String },

    #[error("Not authorized{}: {reason}", rule_suffix(.rule))]
    Unauthorized {
        /// The failing authorization rule; `None` for request-level
        /// authorization failures such as a bad `X-Matrix` header.
        rule: Option<AuthRule>,
        reason: String,
    },

    #[error("Unsupported room version: {0}")]
    UnsupportedRoomVersion(String),

    #[error("Invalid event: {0}")]
    InvalidEvent(String),

    #[error("Remote server not reachable: {0}")]
    NotReachable(String),

    #[error("Operation cancelled")]
    Cancelled,

    #[error("Configuration error: {0}")]
    BadConfig(String),

    #[error("Bad server response: {0}")]
    BadServerResponse(String),
}

impl Error {
    pub fn bad_config(msg: &str) -> Self {
        Error::BadConfig(msg.to_owned())
    }

    pub fn invalid_json(msg: impl Into<String>) -> Self {
        Error::InvalidJson(msg.into())
    }

    pub fn invalid_event(msg: impl Into<String>) -> Self {
        Error::InvalidEvent(msg.into())
    }

    pub fn unauthorized(rule: AuthRule, reason: impl Into<String>) -> Self {
        Error::Unauthorized {
            rule: Some(rule),
            reason: reason.into(),
        }
    }

    /// Request-level rejection, not tied to an event authorization rule.
    pub fn unauthorized_request(reason: impl Into<String>) -> Self {
        Error::Unauthorized {
            rule: None,
            reason: reason.into(),
        }
    }

    pub fn missing_key(server: impl Into<String>, key_id: impl Into<String>) -> Self {
        Error::MissingKey {
            server: server.into(),
            key_id: key_id.into(),
        }
    }

    /// Whether this error is an authorization rejection (as opposed to a
    /// structural or infrastructure failure).
    pub fn is_unauthorized(&self) -> bool {
        matches!(self, Error::Unauthorized { .. })
    }
}

/// Matrixon protocol core result type.
pub type Result<T, E = Error> = std::result::Result<T, E>;
