// =============================================================================
// Matrixon Matrix NextServer - Room Version Registry Module
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
//   Static registry of per-room-version behavior. A room version is a
//   behavioral contract selected at room creation and immutable thereafter;
//   differences between versions are plain fields on the record, checked
//   where they matter. New versions add a row.
//
// =============================================================================

use crate::{Error, Result};

/// Which state resolution algorithm a room version uses.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum StateResolutionVersion {
    /// Greatest depth wins, event ID tiebreak. Room v1 only.
    V1,
    /// Iterative auth checks with power ordering and mainline ordering.
    V2,
}

/// How event IDs are derived for a room version.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum EventIdFormat {
    /// `$opaque:host`, assigned by the originating server.
    V1,
    /// Unpadded base64 of the reference hash, no sigil.
    V3,
    /// `$` followed by unpadded URL-safe base64 of the reference hash.
    V4,
}

/// Which redaction rule set applies.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RedactionRules {
    V1,
    /// v11 additionally retains `third_party_invite` (member), `room_version`
    /// (create), `notifications` (power levels) and `redacts` (redaction).
    V11,
}

/// Per-version behavior record.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RoomVersion {
    pub id: &'static str,
    pub state_res: StateResolutionVersion,
    pub event_format: EventIdFormat,
    pub redaction: RedactionRules,
    /// `knock` membership and the `knock` join rule (v7+).
    pub allow_knocking: bool,
    /// The `restricted` join rule (v8+).
    pub allow_restricted_join: bool,
    /// The `knock_restricted` join rule (v10+).
    pub allow_knock_restricted_join: bool,
    /// Power level values must be true JSON integers (v10+); older versions
    /// tolerate string-encoded integers.
    pub integer_power_levels: bool,
}

#[allow(clippy::too_many_arguments)]
const fn row(
    id: &'static str,
    state_res: StateResolutionVersion,
    event_format: EventIdFormat,
    redaction: RedactionRules,
    allow_knocking: bool,
    allow_restricted_join: bool,
    allow_knock_restricted_join: bool,
    integer_power_levels: bool,
) -> RoomVersion {
    RoomVersion {
        id,
        state_res,
        event_format,
        redaction,
        allow_knocking,
        allow_restricted_join,
        allow_knock_restricted_join,
        integer_power_levels,
    }
}

use self::EventIdFormat as F;
use self::RedactionRules as R;
use self::StateResolutionVersion as S;

#[rustfmt::skip]
static REGISTRY: [RoomVersion; 12] = [
    row("1",  S::V1, F::V1, R::V1,  false, false, false, false),
    row("2",  S::V2, F::V1, R::V1,  false, false, false, false),
    row("3",  S::V2, F::V3, R::V1,  false, false, false, false),
    row("4",  S::V2, F::V4, R::V1,  false, false, false, false),
    row("5",  S::V2, F::V4, R::V1,  false, false, false, false),
    row("6",  S::V2, F::V4, R::V1,  false, false, false, false),
    row("7",  S::V2, F::V4, R::V1,  true,  false, false, false),
    row("8",  S::V2, F::V4, R::V1,  false, true,  false, false),
    row("9",  S::V2, F::V4, R::V1,  true,  true,  false, false),
    row("10", S::V2, F::V4, R::V1,  true,  true,  true,  true),
    row("11", S::V2, F::V4, R::V11, true,  true,  true,  true),
    row("12", S::V2, F::V4, R::V11, true,  true,  true,  true),
];

/// Look up the behavior record for a room version string.
pub fn get(version: &str) -> Result<&'static RoomVersion> {
    REGISTRY
        .iter()
        .find(|row| row.id == version)
        .ok_or_else(|| Error::UnsupportedRoomVersion(version.to_owned()))
}

/// Room versions this server offers for new rooms.
pub fn stable_room_versions() -> Vec<&'static str> {
    vec!["6", "7", "8", "9", "10", "11"]
}

/// Room versions supported for federation but not offered for creation.
pub fn unstable_room_versions() -> Vec<&'static str> {
    vec!["1", "2", "3", "4", "5", "12"]
}
