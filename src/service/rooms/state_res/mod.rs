// =============================================================================
// Matrixon Matrix NextServer - State Resolution Module
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
//   Merging divergent room state branches into a single state. Two
//   algorithms, dispatched by room version: v1 picks the deepest event per
//   slot; v2 partitions the inputs into unconflicted and conflicted slots,
//   applies the conflicted auth events in reverse topological power order
//   and the rest in mainline order, each gated by the authorization rules.
//
//   Resolution is a pure function of its inputs: given the same state sets
//   and the same auth event corpus, every honest participant derives the
//   identical state. All orderings are total, with the event ID as the final
//   lexicographic tiebreak.
//
// Performance Targets:
//   • Linear passes over the conflicted set outside of sorting
//   • No I/O; the caller supplies the full event arena
//
// References:
//   • Matrix spec: https://spec.matrix.org/ (rooms, state resolution v2)
//
// =============================================================================

use std::{
    collections::{BTreeMap, BTreeSet, HashMap, HashSet},
    sync::Arc,
};

use tracing::{debug, instrument, warn};

use crate::{
    identifiers::{EventId, UserId},
    room_version::{RoomVersion, StateResolutionVersion},
    service::{
        pdu::{PduEvent, TimelineEventType},
        rooms::event_auth::{
            self, parse_power_levels, PowerLevelsContent, RoomCreateEventContent, StateKey,
        },
    },
    Error, Result,
};

/// Room state: a mapping from state slot to the occupying event's ID.
pub type StateMap = BTreeMap<StateKey, Arc<EventId>>;

/// The event arena: every event that may be consulted during resolution,
/// keyed by ID. References between events are IDs, never pointers.
pub type EventArena = HashMap<Arc<EventId>, Arc<PduEvent>>;

/// The outcome of state resolution.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ResolvedState {
    /// The winning state map.
    pub state: StateMap,
    /// Events that lost to the authorization gate, retained by the caller's
    /// event store so operators can reconstruct what happened.
    pub rejected: Vec<Arc<EventId>>,
}

/// Resolve the given state sets into a single state.
#[instrument(skip(version, state_sets, arena), fields(sets = state_sets.len(), room_version = version.id))]
pub fn resolve(
    version: &RoomVersion,
    state_sets: &[StateMap],
    arena: &EventArena,
) -> Result<ResolvedState> {
    debug!("🔀 Resolving {} state set(s)", state_sets.len());
    match version.state_res {
        StateResolutionVersion::V1 => resolve_v1(state_sets, arena),
        StateResolutionVersion::V2 => resolve_v2(version, state_sets, arena),
    }
}

/// Incremental form: a single new state event against the current state.
///
/// Equivalent to the full algorithm over the two-element input and
/// guaranteed to agree with it; corner cases are never decided by a separate
/// comparison path.
pub fn resolve_incremental(
    version: &RoomVersion,
    current_state: &StateMap,
    new_event: &Arc<PduEvent>,
    arena: &EventArena,
) -> Result<ResolvedState> {
    let state_key = new_event
        .state_key
        .clone()
        .ok_or_else(|| Error::invalid_event("only state events take part in state resolution"))?;

    let mut with_new = current_state.clone();
    with_new.insert((new_event.kind.clone(), state_key), new_event.event_id.clone());

    resolve(version, &[current_state.clone(), with_new], arena)
}

/// Room v1: for each conflicting slot pick the event with the greatest
/// depth, tiebreaking on the ascending event ID.
fn resolve_v1(state_sets: &[StateMap], arena: &EventArena) -> Result<ResolvedState> {
    let mut state = StateMap::new();

    for set in state_sets {
        for (key, candidate) in set {
            match state.get(key) {
                None => {
                    state.insert(key.clone(), candidate.clone());
                }
                Some(current) if current == candidate => {}
                Some(current) => {
                    let current_depth = depth_of(current, arena)?;
                    let candidate_depth = depth_of(candidate, arena)?;
                    let replace = candidate_depth > current_depth
                        || (candidate_depth == current_depth && candidate < current);
                    if replace {
                        state.insert(key.clone(), candidate.clone());
                    }
                }
            }
        }
    }

    Ok(ResolvedState {
        state,
        rejected: Vec::new(),
    })
}

fn depth_of(event_id: &Arc<EventId>, arena: &EventArena) -> Result<u64> {
    arena
        .get(event_id)
        .map(|pdu| pdu.depth)
        .ok_or_else(|| Error::invalid_event(format!("event {event_id} missing from the arena")))
}

/// Room v2.
fn resolve_v2(
    version: &RoomVersion,
    state_sets: &[StateMap],
    arena: &EventArena,
) -> Result<ResolvedState> {
    // ── 1. Partition into unconflicted and conflicted slots ──
    let mut all_keys: BTreeSet<StateKey> = BTreeSet::new();
    for set in state_sets {
        all_keys.extend(set.keys().cloned());
    }

    let mut unconflicted = StateMap::new();
    let mut conflicted: BTreeMap<StateKey, BTreeSet<Arc<EventId>>> = BTreeMap::new();
    for key in all_keys {
        let mut ids: BTreeSet<Arc<EventId>> = BTreeSet::new();
        for set in state_sets {
            if let Some(id) = set.get(&key) {
                ids.insert(id.clone());
            }
        }
        match ids.len() {
            0 => {}
            1 => {
                unconflicted.insert(key, ids.into_iter().next().expect("one element"));
            }
            _ => {
                conflicted.insert(key, ids);
            }
        }
    }

    if conflicted.is_empty() {
        debug!("✅ Nothing conflicted, state sets already agree");
        return Ok(ResolvedState {
            state: unconflicted,
            rejected: Vec::new(),
        });
    }
    debug!(
        conflicted = conflicted.len(),
        unconflicted = unconflicted.len(),
        "Partitioned state slots"
    );

    // ── 2. Split the conflicted events by auth relevance of their type ──
    let mut conflicted_auth: Vec<Arc<PduEvent>> = Vec::new();
    let mut conflicted_other: Vec<Arc<PduEvent>> = Vec::new();
    for ids in conflicted.values() {
        for id in ids {
            let pdu = arena.get(id).ok_or_else(|| {
                Error::invalid_event(format!("conflicted event {id} missing from the arena"))
            })?;
            if pdu.kind.is_auth_state_type() {
                conflicted_auth.push(pdu.clone());
            } else {
                conflicted_other.push(pdu.clone());
            }
        }
    }

    let mut partial = unconflicted.clone();
    let mut rejected: Vec<Arc<EventId>> = Vec::new();

    // ── 3. Reverse topological power ordering over the auth-relevant part ──
    let power_cache: HashMap<Arc<EventId>, i64> = conflicted_auth
        .iter()
        .map(|pdu| {
            (
                pdu.event_id.clone(),
                sender_power_in(&pdu.sender, &unconflicted, version, arena),
            )
        })
        .collect();
    conflicted_auth.sort_by(|a, b| {
        power_cache[&b.event_id]
            .cmp(&power_cache[&a.event_id])
            .then(a.origin_server_ts.cmp(&b.origin_server_ts))
            .then(a.event_id.cmp(&b.event_id))
    });

    for pdu in conflicted_auth {
        apply_gated(version, pdu, &mut partial, &mut rejected, arena);
    }

    // ── 4. Mainline ordering over the rest ──
    // Events are applied in ascending order and the slot keeps the last
    // authorized write, so the losing side of every comparison sorts first:
    // older mainline anchor, then lower sender power, then the younger
    // timestamp, then the larger event ID.
    let mainline_index = build_mainline_index(&partial, arena);
    let position_cache: HashMap<Arc<EventId>, usize> = conflicted_other
        .iter()
        .map(|pdu| (pdu.event_id.clone(), mainline_position(pdu, &mainline_index, arena)))
        .collect();
    let other_power: HashMap<Arc<EventId>, i64> = conflicted_other
        .iter()
        .map(|pdu| {
            (
                pdu.event_id.clone(),
                sender_power_in(&pdu.sender, &unconflicted, version, arena),
            )
        })
        .collect();
    conflicted_other.sort_by(|a, b| {
        position_cache[&a.event_id]
            .cmp(&position_cache[&b.event_id])
            .then(other_power[&a.event_id].cmp(&other_power[&b.event_id]))
            .then(b.origin_server_ts.cmp(&a.origin_server_ts))
            .then(b.event_id.cmp(&a.event_id))
    });

    for pdu in conflicted_other {
        apply_gated(version, pdu, &mut partial, &mut rejected, arena);
    }

    debug!(
        rejected = rejected.len(),
        "✅ State resolution complete"
    );
    Ok(ResolvedState {
        state: partial,
        rejected,
    })
}

/// Run the authorization gate for one candidate against the current partial
/// state; apply it on success, record it on rejection.
fn apply_gated(
    version: &RoomVersion,
    pdu: Arc<PduEvent>,
    partial: &mut StateMap,
    rejected: &mut Vec<Arc<EventId>>,
    arena: &EventArena,
) {
    let auth_state = auth_subset_for(&pdu, partial, arena);
    match event_auth::auth_check(version, &pdu, &auth_state, false) {
        Ok(()) => {
            let state_key = pdu.state_key.clone().unwrap_or_default();
            partial.insert((pdu.kind.clone(), state_key), pdu.event_id.clone());
        }
        Err(e) => {
            warn!(event_id = %pdu.event_id, error = %e, "Conflicted event failed the auth gate");
            rejected.push(pdu.event_id.clone());
        }
    }
}

/// Assemble the auth subset for an event from the current partial state.
fn auth_subset_for(
    pdu: &PduEvent,
    partial: &StateMap,
    arena: &EventArena,
) -> event_auth::AuthStateMap {
    let mut subset = event_auth::AuthStateMap::new();
    for slot in event_auth::auth_types_for_event(
        &pdu.kind,
        &pdu.sender,
        pdu.state_key.as_deref(),
        &pdu.content,
    ) {
        if let Some(id) = partial.get(&slot) {
            if let Some(event) = arena.get(id) {
                subset.insert(slot, event.clone());
            }
        }
    }
    subset
}

/// Power of a sender as seen by the given state map: the power levels entry,
/// or the creator-power bootstrap when no power levels event resolves.
fn sender_power_in(
    sender: &UserId,
    state: &StateMap,
    version: &RoomVersion,
    arena: &EventArena,
) -> i64 {
    let levels: Option<PowerLevelsContent> = state
        .get(&(TimelineEventType::RoomPowerLevels, String::new()))
        .and_then(|id| arena.get(id))
        .and_then(|pdu| parse_power_levels(&pdu.content, version.integer_power_levels).ok());

    if let Some(levels) = levels {
        return levels.user_power(sender);
    }

    let creator = state
        .get(&(TimelineEventType::RoomCreate, String::new()))
        .and_then(|id| arena.get(id))
        .map(|create| {
            create
                .parse_content::<RoomCreateEventContent>()
                .ok()
                .and_then(|c| c.creator)
                .unwrap_or_else(|| create.sender.clone())
        });
    if creator.as_ref() == Some(sender) {
        100
    } else {
        0
    }
}

/// Index the power level mainline: the chain of `m.room.power_levels`
/// events reachable from the resolved power levels event via auth_events.
/// Positions count from the oldest link; events that never reach the
/// mainline sort before all of it at position 0.
fn build_mainline_index(
    partial: &StateMap,
    arena: &EventArena,
) -> HashMap<Arc<EventId>, usize> {
    let mut chain: Vec<Arc<EventId>> = Vec::new();
    let mut seen: HashSet<Arc<EventId>> = HashSet::new();

    let mut current = partial
        .get(&(TimelineEventType::RoomPowerLevels, String::new()))
        .and_then(|id| arena.get(id))
        .cloned();
    while let Some(pdu) = current {
        if !seen.insert(pdu.event_id.clone()) {
            warn!(event_id = %pdu.event_id, "Cycle in power level mainline");
            break;
        }
        chain.push(pdu.event_id.clone());
        current = pdu
            .auth_events
            .iter()
            .filter_map(|id| arena.get(id))
            .find(|parent| parent.kind == TimelineEventType::RoomPowerLevels)
            .cloned();
    }

    // Oldest link first, positions starting at 1.
    chain
        .into_iter()
        .rev()
        .enumerate()
        .map(|(index, id)| (id, index + 1))
        .collect()
}

/// The mainline position of an event: the position of the closest power
/// levels event reachable through its auth chain.
fn mainline_position(
    pdu: &Arc<PduEvent>,
    mainline_index: &HashMap<Arc<EventId>, usize>,
    arena: &EventArena,
) -> usize {
    let mut seen: HashSet<Arc<EventId>> = HashSet::new();
    let mut current = Some(pdu.clone());
    while let Some(event) = current {
        if let Some(position) = mainline_index.get(&event.event_id) {
            return *position;
        }
        if !seen.insert(event.event_id.clone()) {
            break;
        }
        current = event
            .auth_events
            .iter()
            .filter_map(|id| arena.get(id))
            .find(|parent| parent.kind == TimelineEventType::RoomPowerLevels)
            .cloned();
    }
    0
}
