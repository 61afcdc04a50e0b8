// =============================================================================
// Matrixon Matrix NextServer - Event Content Module
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
//   Typed content for the event types the authorization rules branch on.
//   Unknown event types keep their content opaque and fall through to the
//   generic power level checks.
//
// =============================================================================

use std::collections::BTreeMap;

use serde::{Deserialize, Serialize};
use serde_json::value::RawValue as RawJsonValue;

use crate::{identifiers::UserId, Error, Result};

/// Membership states of an `m.room.member` event.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub enum Membership {
    #[serde(rename = "join")]
    Join,
    #[serde(rename = "invite")]
    Invite,
    #[serde(rename = "leave")]
    Leave,
    #[serde(rename = "ban")]
    Ban,
    #[serde(rename = "knock")]
    Knock,
    #[serde(untagged)]
    Other(String),
}

/// `m.room.member` content, restricted to the fields authorization reads.
#[derive(Clone, Debug, Deserialize)]
pub struct RoomMemberEventContent {
    pub membership: Membership,
    #[serde(default)]
    pub join_authorised_via_users_server: Option<UserId>,
    #[serde(default)]
    pub third_party_invite: Option<serde_json::Value>,
}

/// `m.room.create` content.
#[derive(Clone, Debug, Deserialize)]
pub struct RoomCreateEventContent {
    #[serde(default)]
    pub creator: Option<UserId>,
    #[serde(default)]
    pub room_version: Option<String>,
}

/// Join rules of a room.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub enum JoinRule {
    #[serde(rename = "public")]
    Public,
    #[serde(rename = "invite")]
    Invite,
    #[serde(rename = "knock")]
    Knock,
    #[serde(rename = "restricted")]
    Restricted,
    #[serde(rename = "knock_restricted")]
    KnockRestricted,
    #[serde(rename = "private")]
    Private,
    #[serde(untagged)]
    Other(String),
}

/// `m.room.join_rules` content. The `allow` list is carried opaquely; the
/// authorising-user check is what gates restricted joins here.
#[derive(Clone, Debug, Deserialize)]
pub struct RoomJoinRulesEventContent {
    pub join_rule: JoinRule,
    #[serde(default)]
    pub allow: Option<serde_json::Value>,
}

/// Parsed `m.room.power_levels` content with defaults applied.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct PowerLevelsContent {
    pub ban: i64,
    pub invite: i64,
    pub kick: i64,
    pub redact: i64,
    pub events_default: i64,
    pub state_default: i64,
    pub users_default: i64,
    pub events: BTreeMap<String, i64>,
    pub users: BTreeMap<String, i64>,
    pub notifications: BTreeMap<String, i64>,
}

impl Default for PowerLevelsContent {
    fn default() -> Self {
        Self {
            ban: 50,
            invite: 0,
            kick: 50,
            redact: 50,
            events_default: 0,
            state_default: 50,
            users_default: 0,
            events: BTreeMap::new(),
            users: BTreeMap::new(),
            notifications: BTreeMap::new(),
        }
    }
}

impl PowerLevelsContent {
    /// The power level of a user under this power level content.
    pub fn user_power(&self, user: &UserId) -> i64 {
        self.users
            .get(user.as_str())
            .copied()
            .unwrap_or(self.users_default)
    }

    /// The level required to send an event of the given type.
    pub fn required_power(&self, event_type: &str, is_state: bool) -> i64 {
        self.events.get(event_type).copied().unwrap_or(if is_state {
            self.state_default
        } else {
            self.events_default
        })
    }
}

/// Interpret a power level value.
///
/// Room versions below 10 tolerate string-encoded integers; from v10 every
/// numeric field must be a true JSON integer.
fn power_value(field: &str, value: &serde_json::Value, strict_integers: bool) -> Result<i64> {
    if let Some(i) = value.as_i64() {
        return Ok(i);
    }
    if strict_integers {
        return Err(Error::invalid_event(format!(
            "power level field `{field}` must be an integer"
        )));
    }
    if let Some(f) = value.as_f64() {
        if f.fract() == 0.0 {
            return Ok(f as i64);
        }
    }
    if let Some(s) = value.as_str() {
        if let Ok(i) = s.trim().parse::<i64>() {
            return Ok(i);
        }
    }
    Err(Error::invalid_event(format!(
        "power level field `{field}` is not an integer"
    )))
}

fn power_map(
    field: &str,
    value: &serde_json::Value,
    strict_integers: bool,
) -> Result<BTreeMap<String, i64>> {
    let object = value
        .as_object()
        .ok_or_else(|| Error::invalid_event(format!("power level field `{field}` must be an object")))?;
    object
        .iter()
        .map(|(key, v)| Ok((key.clone(), power_value(field, v, strict_integers)?)))
        .collect()
}

/// Parse `m.room.power_levels` content from its raw JSON form.
pub fn parse_power_levels(raw: &RawJsonValue, strict_integers: bool) -> Result<PowerLevelsContent> {
    let value: serde_json::Value = serde_json::from_str(raw.get())
        .map_err(|e| Error::invalid_event(format!("power levels content does not parse: {e}")))?;
    let object = value
        .as_object()
        .ok_or_else(|| Error::invalid_event("power levels content must be an object"))?;

    let mut levels = PowerLevelsContent::default();
    for (field, slot) in [
        ("ban", &mut levels.ban as &mut i64),
        ("invite", &mut levels.invite),
        ("kick", &mut levels.kick),
        ("redact", &mut levels.redact),
        ("events_default", &mut levels.events_default),
        ("state_default", &mut levels.state_default),
        ("users_default", &mut levels.users_default),
    ] {
        if let Some(value) = object.get(field) {
            *slot = power_value(field, value, strict_integers)?;
        }
    }
    if let Some(value) = object.get("events") {
        levels.events = power_map("events", value, strict_integers)?;
    }
    if let Some(value) = object.get("users") {
        levels.users = power_map("users", value, strict_integers)?;
    }
    if let Some(value) = object.get("notifications") {
        levels.notifications = power_map("notifications", value, strict_integers)?;
    }

    Ok(levels)
}
