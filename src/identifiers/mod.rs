// =============================================================================
// Matrixon Matrix NextServer - Protocol Identifiers Module
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
//   Matrix identifier newtypes: user IDs, room IDs, event IDs and server
//   names. The protocol core derives and validates identifiers itself, so
//   they are owned, cheaply clonable strings with their grammar enforced at
//   construction.
//
// =============================================================================

use std::fmt;

use serde::{de, Deserialize, Deserializer, Serialize, Serializer};

use crate::{Error, Result};

macro_rules! identifier_common {
    ($name:ident) => {
        impl $name {
            /// The identifier as a string slice.
            pub fn as_str(&self) -> &str {
                &self.0
            }

            pub fn as_bytes(&self) -> &[u8] {
                self.0.as_bytes()
            }
        }

        impl fmt::Display for $name {
            fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
                f.write_str(&self.0)
            }
        }

        impl AsRef<str> for $name {
            fn as_ref(&self) -> &str {
                &self.0
            }
        }

        impl From<$name> for String {
            fn from(id: $name) -> Self {
                id.0.into()
            }
        }

        impl PartialEq<str> for $name {
            fn eq(&self, other: &str) -> bool {
                self.as_str() == other
            }
        }

        impl PartialEq<&str> for $name {
            fn eq(&self, other: &&str) -> bool {
                self.as_str() == *other
            }
        }

        impl Serialize for $name {
            fn serialize<S: Serializer>(&self, serializer: S) -> std::result::Result<S::Ok, S::Error> {
                serializer.serialize_str(&self.0)
            }
        }

        impl<'de> Deserialize<'de> for $name {
            fn deserialize<D: Deserializer<'de>>(
                deserializer: D,
            ) -> std::result::Result<Self, D::Error> {
                let s = String::deserialize(deserializer)?;
                $name::parse(s).map_err(de::Error::custom)
            }
        }
    };
}

/// Characters permitted in a server name (hostname or IP literal, optionally
/// with a port).
fn is_valid_server_name(s: &str) -> bool {
    !s.is_empty()
        && !s.starts_with(':')
        && s.chars()
            .all(|c| c.is_ascii_alphanumeric() || matches!(c, '-' | '.' | ':' | '[' | ']' | '_'))
}

/// The DNS-ish name a homeserver federates under, e.g. `matrix.example.com`
/// or `example.com:8448`.
#[derive(Debug, Clone, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub struct ServerName(Box<str>);

identifier_common!(ServerName);

impl ServerName {
    pub fn parse(s: impl Into<String>) -> Result<Self> {
        let s = s.into();
        if !is_valid_server_name(&s) {
            return Err(Error::invalid_event(format!("invalid server name `{s}`")));
        }
        Ok(Self(s.into_boxed_str()))
    }

    /// The host part, with any port stripped.
    pub fn host(&self) -> &str {
        match self.0.rfind(':') {
            Some(idx) if self.0[idx + 1..].chars().all(|c| c.is_ascii_digit()) => &self.0[..idx],
            _ => &self.0,
        }
    }
}

/// A fully qualified Matrix user ID, e.g. `@alice:example.com`.
#[derive(Debug, Clone, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub struct UserId(Box<str>);

identifier_common!(UserId);

impl UserId {
    pub fn parse(s: impl Into<String>) -> Result<Self> {
        let s = s.into();
        let rest = s
            .strip_prefix('@')
            .ok_or_else(|| Error::invalid_event(format!("user ID `{s}` is missing the @ sigil")))?;
        let colon = rest
            .find(':')
            .ok_or_else(|| Error::invalid_event(format!("user ID `{s}` is missing a server name")))?;
        if colon == 0 {
            return Err(Error::invalid_event(format!("user ID `{s}` has an empty localpart")));
        }
        if !is_valid_server_name(&rest[colon + 1..]) {
            return Err(Error::invalid_event(format!("user ID `{s}` has an invalid server name")));
        }
        Ok(Self(s.into_boxed_str()))
    }

    /// The part between the sigil and the first colon.
    pub fn localpart(&self) -> &str {
        let rest = &self.0[1..];
        &rest[..rest.find(':').expect("validated at construction")]
    }

    /// The server this user belongs to.
    pub fn server_name(&self) -> ServerName {
        let rest = &self.0[1..];
        let idx = rest.find(':').expect("validated at construction");
        ServerName(rest[idx + 1..].into())
    }
}

/// A Matrix room ID, e.g. `!vZwkQCibmZobHzdgKV:example.com`.
#[derive(Debug, Clone, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub struct RoomId(Box<str>);

identifier_common!(RoomId);

impl RoomId {
    pub fn parse(s: impl Into<String>) -> Result<Self> {
        let s = s.into();
        let rest = s
            .strip_prefix('!')
            .ok_or_else(|| Error::invalid_event(format!("room ID `{s}` is missing the ! sigil")))?;
        let colon = rest
            .find(':')
            .ok_or_else(|| Error::invalid_event(format!("room ID `{s}` is missing a server name")))?;
        if colon == 0 || !is_valid_server_name(&rest[colon + 1..]) {
            return Err(Error::invalid_event(format!("room ID `{s}` is malformed")));
        }
        Ok(Self(s.into_boxed_str()))
    }

    pub fn server_name(&self) -> ServerName {
        let rest = &self.0[1..];
        let idx = rest.find(':').expect("validated at construction");
        ServerName(rest[idx + 1..].into())
    }
}

/// A Matrix event ID.
///
/// Three shapes exist across room versions: `$opaque:server` (rooms v1/v2),
/// a bare unpadded base64 reference hash (room v3) and `$` plus an unpadded
/// URL-safe base64 reference hash (rooms v4+). Validation is accordingly
/// lenient; the room version decides which shape is derived.
#[derive(Debug, Clone, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub struct EventId(Box<str>);

identifier_common!(EventId);

impl EventId {
    pub fn parse(s: impl Into<String>) -> Result<Self> {
        let s = s.into();
        if s.is_empty() {
            return Err(Error::invalid_event("event ID must not be empty"));
        }
        if s.chars().any(|c| c.is_whitespace() || c.is_control()) {
            return Err(Error::invalid_event(format!("event ID `{s}` contains invalid characters")));
        }
        Ok(Self(s.into_boxed_str()))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_user_id_parts() {
        let user = UserId::parse("@alice:matrixon.example.com").unwrap();
        assert_eq!(user.localpart(), "alice");
        assert_eq!(user.server_name().as_str(), "matrixon.example.com");
        assert_eq!(user, "@alice:matrixon.example.com");
    }

    #[test]
    fn test_user_id_rejects_malformed() {
        assert!(UserId::parse("alice:example.com").is_err());
        assert!(UserId::parse("@alice").is_err());
        assert!(UserId::parse("@:example.com").is_err());
        assert!(UserId::parse("@alice:").is_err());
    }

    #[test]
    fn test_room_id() {
        let room = RoomId::parse("!room:example.com").unwrap();
        assert_eq!(room.server_name().as_str(), "example.com");
        assert!(RoomId::parse("room:example.com").is_err());
    }

    #[test]
    fn test_server_name_with_port() {
        let server = ServerName::parse("example.com:8448").unwrap();
        assert_eq!(server.host(), "example.com");
        assert_eq!(ServerName::parse("example.com").unwrap().host(), "example.com");
        assert!(ServerName::parse("").is_err());
        assert!(ServerName::parse("has space.com").is_err());
    }

    #[test]
    fn test_event_id_shapes() {
        // v1 style
        assert!(EventId::parse("$143273582443PhrSn:example.org").is_ok());
        // v3 style, no sigil
        assert!(EventId::parse("acR1l0raoZnm60CBwAVgqbZqoO/mYU81xysh1u7XcJk").is_ok());
        // v4 style
        assert!(EventId::parse("$Rqnc-F-dvnEYJTyHq_iKxU2bZ1CI92-kuZq3a5lr5Zg").is_ok());
        assert!(EventId::parse("").is_err());
        assert!(EventId::parse("$ev with space").is_err());
    }

    #[test]
    fn test_serde_round_trip() {
        let user = UserId::parse("@bob:example.com").unwrap();
        let json = serde_json::to_string(&user).unwrap();
        assert_eq!(json, "\"@bob:example.com\"");
        let back: UserId = serde_json::from_str(&json).unwrap();
        assert_eq!(user, back);

        let bad: std::result::Result<UserId, _> = serde_json::from_str("\"not-a-user\"");
        assert!(bad.is_err());
    }
}
