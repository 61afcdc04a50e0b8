// =============================================================================
// Matrixon Matrix NextServer - Event Authorization Module
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
//   The authorization rules deciding whether a PDU is allowed given the room
//   state referenced by its auth_events. Rules apply in order; the first
//   failure wins and is reported with its rule number and reason.
//   Authorization is referentially transparent: the decision depends only on
//   the contents of the referenced auth events.
//
// Performance Targets:
//   • <100μs per authorization decision
//   • No I/O, no allocation beyond content parsing
//
// References:
//   • Matrix.org specification: https://matrix.org/
//   • Matrix spec: https://spec.matrix.org/ (server-server API, §auth rules)
//
// =============================================================================

pub mod content;

use std::{collections::HashMap, sync::Arc};

use tracing::{debug, instrument};

use crate::{
    identifiers::UserId,
    room_version::RoomVersion,
    service::pdu::{PduEvent, TimelineEventType},
    utils::error::AuthRule,
    Error, Result,
};

pub use content::{
    parse_power_levels, JoinRule, Membership, PowerLevelsContent, RoomCreateEventContent,
    RoomJoinRulesEventContent, RoomMemberEventContent,
};

/// A room state slot: event type plus state key.
pub type StateKey = (TimelineEventType, String);

/// The subset of room state an authorization decision reads.
pub type AuthStateMap = HashMap<StateKey, Arc<PduEvent>>;

fn slot(kind: TimelineEventType, state_key: &str) -> StateKey {
    (kind, state_key.to_owned())
}

/// The state slots needed to authorize the given event, used both to select
/// `auth_events` when minting and to assemble the auth subset during state
/// resolution.
pub fn auth_types_for_event(
    kind: &TimelineEventType,
    sender: &UserId,
    state_key: Option<&str>,
    content: &serde_json::value::RawValue,
) -> Vec<StateKey> {
    if *kind == TimelineEventType::RoomCreate {
        return Vec::new();
    }

    let mut types = vec![
        slot(TimelineEventType::RoomPowerLevels, ""),
        slot(TimelineEventType::RoomMember, sender.as_str()),
        slot(TimelineEventType::RoomCreate, ""),
    ];

    if *kind == TimelineEventType::RoomMember {
        if let Ok(member) = serde_json::from_str::<RoomMemberEventContent>(content.get()) {
            if let Some(target) = state_key {
                let target_slot = slot(TimelineEventType::RoomMember, target);
                if !types.contains(&target_slot) {
                    types.push(target_slot);
                }
            }

            if matches!(
                member.membership,
                Membership::Join | Membership::Invite | Membership::Knock
            ) {
                types.push(slot(TimelineEventType::RoomJoinRules, ""));
            }

            if let Some(authoriser) = &member.join_authorised_via_users_server {
                let authoriser_slot = slot(TimelineEventType::RoomMember, authoriser.as_str());
                if !types.contains(&authoriser_slot) {
                    types.push(authoriser_slot);
                }
            }

            if member.membership == Membership::Invite {
                if let Some(token) = member
                    .third_party_invite
                    .as_ref()
                    .and_then(|tpi| tpi.get("signed"))
                    .and_then(|signed| signed.get("token"))
                    .and_then(|token| token.as_str())
                {
                    types.push(slot(TimelineEventType::RoomThirdPartyInvite, token));
                }
            }
        }
    }

    types
}

/// Context assembled from the auth state once and consulted by every rule.
struct AuthContext<'a> {
    version: &'a RoomVersion,
    create: &'a PduEvent,
    power_levels: Option<PowerLevelsContent>,
    auth_state: &'a AuthStateMap,
}

impl<'a> AuthContext<'a> {
    fn new(
        version: &'a RoomVersion,
        auth_state: &'a AuthStateMap,
    ) -> Result<Self> {
        let create = auth_state
            .get(&slot(TimelineEventType::RoomCreate, ""))
            .ok_or_else(|| {
                Error::unauthorized(AuthRule::CreateEvent, "no create event in auth state")
            })?;

        let power_levels = auth_state
            .get(&slot(TimelineEventType::RoomPowerLevels, ""))
            .map(|pdu| parse_power_levels(&pdu.content, version.integer_power_levels))
            .transpose()?;

        Ok(Self {
            version,
            create,
            power_levels,
            auth_state,
        })
    }

    /// The room creator: `content.creator` when present, else the sender of
    /// the create event.
    fn creator(&self) -> UserId {
        self.create
            .parse_content::<RoomCreateEventContent>()
            .ok()
            .and_then(|c| c.creator)
            .unwrap_or_else(|| self.create.sender.clone())
    }

    /// Effective power of a user: the power levels entry, or the
    /// creator-power bootstrap when no power levels event exists yet.
    fn user_power(&self, user: &UserId) -> i64 {
        match &self.power_levels {
            Some(levels) => levels.user_power(user),
            None => {
                if *user == self.creator() {
                    100
                } else {
                    0
                }
            }
        }
    }

    /// Effective power level content, defaults applied when absent.
    fn levels(&self) -> PowerLevelsContent {
        self.power_levels.clone().unwrap_or_default()
    }

    fn membership_of(&self, user: &UserId) -> Membership {
        self.auth_state
            .get(&slot(TimelineEventType::RoomMember, user.as_str()))
            .and_then(|pdu| pdu.parse_content::<RoomMemberEventContent>().ok())
            .map(|content| content.membership)
            .unwrap_or(Membership::Leave)
    }

    fn join_rule(&self) -> JoinRule {
        self.auth_state
            .get(&slot(TimelineEventType::RoomJoinRules, ""))
            .and_then(|pdu| pdu.parse_content::<RoomJoinRulesEventContent>().ok())
            .map(|content| content.join_rule)
            .unwrap_or(JoinRule::Invite)
    }
}

/// Authorize a PDU against the state referenced by its `auth_events`.
///
/// `redacts_own_event` is supplied by the caller for `m.room.redaction`
/// events by comparing the senders of the redaction and its target; the core
/// does not look the target up itself.
#[instrument(skip(version, event, auth_state), fields(event_id = %event.event_id, kind = %event.kind))]
pub fn auth_check(
    version: &RoomVersion,
    event: &PduEvent,
    auth_state: &AuthStateMap,
    redacts_own_event: bool,
) -> Result<()> {
    debug!("🔍 Authorizing event");

    // Rule 1: the create event itself.
    if event.kind == TimelineEventType::RoomCreate {
        if !event.prev_events.is_empty() {
            return Err(Error::unauthorized(
                AuthRule::CreateEvent,
                "create event must have no prev_events",
            ));
        }
        if event.state_key.as_deref() != Some("") {
            return Err(Error::unauthorized(
                AuthRule::CreateEvent,
                "create event must have an empty state_key",
            ));
        }
        let content: RoomCreateEventContent = event.parse_content()?;
        if content.creator.is_none() && content.room_version.is_none() {
            return Err(Error::unauthorized(
                AuthRule::CreateEvent,
                "create event needs either creator or room_version in content",
            ));
        }
        return Ok(());
    }

    // Rule 1, second half: everything else needs the create event.
    let ctx = AuthContext::new(version, auth_state)?;

    // Rule 2: the membership state machine.
    if event.kind == TimelineEventType::RoomMember {
        return check_membership(&ctx, event);
    }

    // Rule 3: the sender of anything else must be joined. The check binds on
    // the sender's member event; a sender with no member state at all only
    // occurs during room bootstrap, where the power rules below govern.
    if let Some(member) = ctx
        .auth_state
        .get(&slot(TimelineEventType::RoomMember, event.sender.as_str()))
    {
        let membership = member
            .parse_content::<RoomMemberEventContent>()
            .map(|c| c.membership)
            .unwrap_or(Membership::Leave);
        if membership != Membership::Join {
            return Err(Error::unauthorized(
                AuthRule::SenderMembership,
                format!("sender {} is not joined", event.sender),
            ));
        }
    }

    let levels = ctx.levels();
    let sender_power = ctx.user_power(&event.sender);

    // Rule 4: third-party invites need invite power.
    if event.kind == TimelineEventType::RoomThirdPartyInvite {
        if sender_power < levels.invite {
            return Err(Error::unauthorized(
                AuthRule::ThirdPartyInvite,
                format!("have {} need {}", sender_power, levels.invite),
            ));
        }
        return Ok(());
    }

    // Rules 5/6: the generic power checks for state and message events.
    let is_state = event.is_state_event();
    let required = levels.required_power(event.kind.as_str(), is_state);
    if sender_power < required {
        let rule = if is_state {
            AuthRule::StatePowerLevel
        } else {
            AuthRule::MessagePowerLevel
        };
        return Err(Error::unauthorized(
            rule,
            format!("have {sender_power} need {required}"),
        ));
    }

    // Rule 7: the power level escalation guard.
    if event.kind == TimelineEventType::RoomPowerLevels {
        check_power_levels(&ctx, event, sender_power)?;
    }

    // Rule 8: redactions need redact power unless the sender redacts their
    // own event.
    if event.kind == TimelineEventType::RoomRedaction && !redacts_own_event {
        if sender_power < levels.redact {
            return Err(Error::unauthorized(
                AuthRule::Redaction,
                format!("have {} need {}", sender_power, levels.redact),
            ));
        }
    }

    debug!("✅ Event authorized");
    Ok(())
}

/// Rule 2: the `m.room.member` state machine.
fn check_membership(ctx: &AuthContext<'_>, event: &PduEvent) -> Result<()> {
    let reject = |reason: String| Err(Error::unauthorized(AuthRule::Membership, reason));

    let target = event
        .state_key
        .as_deref()
        .filter(|sk| !sk.is_empty())
        .ok_or_else(|| {
            Error::invalid_event("member event must carry the target user as state_key")
        })
        .and_then(UserId::parse)?;
    let content: RoomMemberEventContent = event.parse_content()?;

    let sender = &event.sender;
    let levels = ctx.levels();
    let sender_power = ctx.user_power(sender);
    let target_power = ctx.user_power(&target);
    let sender_membership = ctx.membership_of(sender);
    let target_membership = ctx.membership_of(&target);
    let join_rule = ctx.join_rule();

    match content.membership.clone() {
        Membership::Join => {
            if *sender != target {
                return reject("sender and state_key must match for joins".to_owned());
            }

            // The creator's first join: the only prev event is the create
            // event and no member state exists yet.
            if event.prev_events.len() == 1
                && *event.prev_events[0] == *ctx.create.event_id
                && ctx.creator() == target
            {
                return Ok(());
            }

            if target_membership == Membership::Ban {
                return reject(format!("{target} is banned from the room"));
            }
            if matches!(target_membership, Membership::Join | Membership::Invite) {
                return Ok(());
            }

            match join_rule {
                JoinRule::Public => Ok(()),
                JoinRule::Restricted if ctx.version.allow_restricted_join => {
                    check_restricted_join(ctx, &content, &levels)
                }
                JoinRule::KnockRestricted if ctx.version.allow_knock_restricted_join => {
                    check_restricted_join(ctx, &content, &levels)
                }
                other => reject(format!("join rule {other:?} does not permit this join")),
            }
        }
        Membership::Invite => {
            if sender_membership != Membership::Join {
                return reject(format!("inviter {sender} is not joined"));
            }
            if target_membership == Membership::Ban {
                return reject(format!("{target} is banned and cannot be invited"));
            }
            if target_membership == Membership::Join {
                return reject(format!("{target} is already joined"));
            }
            if sender_power < levels.invite {
                return reject(format!("have {} need {}", sender_power, levels.invite));
            }
            Ok(())
        }
        Membership::Leave => {
            if *sender == target {
                let can_leave = matches!(
                    sender_membership,
                    Membership::Join | Membership::Invite
                ) || (ctx.version.allow_knocking && sender_membership == Membership::Knock);
                if can_leave {
                    Ok(())
                } else {
                    reject(format!("{sender} has nothing to leave"))
                }
            } else {
                if sender_membership != Membership::Join {
                    return reject(format!("kicker {sender} is not joined"));
                }
                // Removing a ban requires ban power, a plain kick requires
                // kick power.
                let required = if target_membership == Membership::Ban {
                    levels.ban
                } else {
                    levels.kick
                };
                if sender_power < required {
                    return reject(format!("have {sender_power} need {required}"));
                }
                if sender_power <= target_power {
                    return reject(format!(
                        "cannot kick a user with equal or higher power ({target_power})"
                    ));
                }
                Ok(())
            }
        }
        Membership::Ban => {
            if sender_membership != Membership::Join {
                return reject(format!("banner {sender} is not joined"));
            }
            if sender_power < levels.ban {
                return reject(format!("have {} need {}", sender_power, levels.ban));
            }
            if sender_power <= target_power {
                return reject(format!(
                    "cannot ban a user with equal or higher power ({target_power})"
                ));
            }
            Ok(())
        }
        Membership::Knock => {
            if !ctx.version.allow_knocking {
                return reject("room version does not support knocking".to_owned());
            }
            if *sender != target {
                return reject("sender and state_key must match for knocks".to_owned());
            }
            let rule_allows = join_rule == JoinRule::Knock
                || (ctx.version.allow_knock_restricted_join
                    && join_rule == JoinRule::KnockRestricted);
            if !rule_allows {
                return reject(format!("join rule {join_rule:?} does not permit knocking"));
            }
            if matches!(sender_membership, Membership::Ban | Membership::Join) {
                return reject(format!("{sender} cannot knock while banned or joined"));
            }
            Ok(())
        }
        Membership::Other(other) => reject(format!("unknown membership `{other}`")),
    }
}

/// Restricted joins are authorized via an already-joined user with invite
/// power. The co-signature of that user's server is validated by federation
/// before the event reaches the core.
fn check_restricted_join(
    ctx: &AuthContext<'_>,
    content: &RoomMemberEventContent,
    levels: &PowerLevelsContent,
) -> Result<()> {
    let authoriser = content.join_authorised_via_users_server.as_ref().ok_or_else(|| {
        Error::unauthorized(
            AuthRule::Membership,
            "restricted join requires join_authorised_via_users_server",
        )
    })?;

    if ctx.membership_of(authoriser) != Membership::Join {
        return Err(Error::unauthorized(
            AuthRule::Membership,
            format!("authorising user {authoriser} is not joined"),
        ));
    }
    let authoriser_power = ctx.user_power(authoriser);
    if authoriser_power < levels.invite {
        return Err(Error::unauthorized(
            AuthRule::Membership,
            format!(
                "authorising user {} has {} but needs {}",
                authoriser, authoriser_power, levels.invite
            ),
        ));
    }
    Ok(())
}

/// Rule 7: no field of `m.room.power_levels` may move past the sender.
fn check_power_levels(
    ctx: &AuthContext<'_>,
    event: &PduEvent,
    sender_power: i64,
) -> Result<()> {
    let reject = |reason: String| Err(Error::unauthorized(AuthRule::PowerLevelChange, reason));

    let new = parse_power_levels(&event.content, ctx.version.integer_power_levels)?;
    let old = ctx.levels();

    // Scalars: a changed value must stay within the sender's reach on both
    // sides.
    for (field, old_value, new_value) in [
        ("ban", old.ban, new.ban),
        ("invite", old.invite, new.invite),
        ("kick", old.kick, new.kick),
        ("redact", old.redact, new.redact),
        ("events_default", old.events_default, new.events_default),
        ("state_default", old.state_default, new.state_default),
        ("users_default", old.users_default, new.users_default),
    ] {
        if old_value == new_value {
            continue;
        }
        if old_value > sender_power {
            return reject(format!(
                "cannot change `{field}` from {old_value}, which is above own power {sender_power}"
            ));
        }
        if new_value > sender_power {
            return reject(format!(
                "cannot raise `{field}` to {new_value}, above own power {sender_power}"
            ));
        }
    }

    for (field, old_map, new_map) in [
        ("events", &old.events, &new.events),
        ("notifications", &old.notifications, &new.notifications),
    ] {
        let keys: std::collections::BTreeSet<&String> =
            old_map.keys().chain(new_map.keys()).collect();
        for key in keys {
            let old_value = old_map.get(key);
            let new_value = new_map.get(key);
            if old_value == new_value {
                continue;
            }
            if let Some(&old_value) = old_value {
                if old_value > sender_power {
                    return reject(format!(
                        "cannot change `{field}.{key}` from {old_value}, above own power {sender_power}"
                    ));
                }
            }
            if let Some(&new_value) = new_value {
                if new_value > sender_power {
                    return reject(format!(
                        "cannot set `{field}.{key}` to {new_value}, above own power {sender_power}"
                    ));
                }
            }
        }
    }

    // Users: same bounds, plus changing someone else's entry demands the old
    // value be strictly below the sender.
    let keys: std::collections::BTreeSet<&String> =
        old.users.keys().chain(new.users.keys()).collect();
    for key in keys {
        let old_value = old.users.get(key);
        let new_value = new.users.get(key);
        if old_value == new_value {
            continue;
        }
        let is_own_entry = key.as_str() == event.sender.as_str();
        if let Some(&old_value) = old_value {
            if is_own_entry {
                if old_value > sender_power {
                    return reject(format!(
                        "cannot change own entry from {old_value}, above own power {sender_power}"
                    ));
                }
            } else if old_value >= sender_power {
                return reject(format!(
                    "cannot change `users.{key}` from {old_value}, not below own power {sender_power}"
                ));
            }
        }
        if let Some(&new_value) = new_value {
            if new_value > sender_power {
                return reject(format!(
                    "cannot set `users.{key}` to {new_value}, above own power {sender_power}"
                ));
            }
        }
    }

    Ok(())
}
