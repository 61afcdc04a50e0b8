// =============================================================================
// Matrixon Matrix NextServer - Auth Chain Module
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
//   Transitive closure of auth_events over the event arena. State resolution
//   consumes the full auth chain of its inputs; federation answers
//   /get_auth_chain style queries from the same closure.
//
// =============================================================================

use std::{collections::HashSet, sync::Arc};

use tracing::{debug, instrument};

use crate::{
    identifiers::{EventId, RoomId},
    service::rooms::state_res::EventArena,
    Error, Result,
};

/// Compute the auth chain of the given starting events: every event
/// reachable by following `auth_events`, not including the starting events
/// themselves.
///
/// Events from a different room hiding in the chain are an attack on state
/// resolution and abort the walk.
#[instrument(skip(starting_events, arena), fields(room_id = %room_id, starting = starting_events.len()))]
pub fn get_auth_chain(
    room_id: &RoomId,
    starting_events: &[Arc<EventId>],
    arena: &EventArena,
) -> Result<HashSet<Arc<EventId>>> {
    let mut todo: Vec<Arc<EventId>> = Vec::new();
    let mut found: HashSet<Arc<EventId>> = HashSet::new();

    for start in starting_events {
        if let Some(pdu) = arena.get(start) {
            if pdu.room_id != *room_id {
                return Err(Error::invalid_event("Evil event in auth chain"));
            }
            todo.extend(pdu.auth_events.iter().cloned());
        }
    }

    while let Some(event_id) = todo.pop() {
        if !found.insert(event_id.clone()) {
            continue;
        }
        let Some(pdu) = arena.get(&event_id) else {
            // The arena is allowed to be partial here; missing links simply
            // terminate that branch of the walk.
            debug!(event_id = %event_id, "Auth chain link missing from the arena");
            continue;
        };
        if pdu.room_id != *room_id {
            return Err(Error::invalid_event("Evil event in auth chain"));
        }
        todo.extend(pdu.auth_events.iter().cloned());
    }

    debug!(chain_length = found.len(), "Auth chain computed");
    Ok(found)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::{
        identifiers::UserId,
        service::pdu::{EventHash, PduEvent, TimelineEventType},
        utils,
    };
    use serde_json::{json, value::to_raw_value};

    fn add_event(
        arena: &mut EventArena,
        id: &str,
        room: &str,
        auth_events: &[&str],
    ) -> Arc<EventId> {
        let event_id = Arc::new(EventId::parse(id).unwrap());
        let pdu = Arc::new(PduEvent {
            event_id: event_id.clone(),
            room_id: RoomId::parse(room).unwrap(),
            sender: UserId::parse("@a:x").unwrap(),
            origin_server_ts: 1,
            kind: TimelineEventType::RoomMessage,
            content: to_raw_value(&json!({})).unwrap(),
            state_key: None,
            prev_events: vec![],
            depth: 1,
            auth_events: auth_events
                .iter()
                .map(|id| Arc::new(EventId::parse(*id).unwrap()))
                .collect(),
            redacts: None,
            unsigned: None,
            hashes: EventHash {
                sha256: utils::unpadded_base64(&[0u8; 32]),
            },
            signatures: None,
        });
        arena.insert(event_id.clone(), pdu);
        event_id
    }

    #[test]
    fn test_transitive_closure() {
        let mut arena = EventArena::new();
        let room = "!room:x";
        add_event(&mut arena, "$create:x", room, &[]);
        add_event(&mut arena, "$power:x", room, &["$create:x"]);
        add_event(&mut arena, "$join:x", room, &["$create:x", "$power:x"]);
        let msg = add_event(&mut arena, "$msg:x", room, &["$join:x", "$power:x"]);

        let chain =
            get_auth_chain(&RoomId::parse(room).unwrap(), &[msg], &arena).unwrap();
        let ids: HashSet<&str> = chain.iter().map(|id| id.as_str()).collect();
        assert_eq!(
            ids,
            HashSet::from(["$create:x", "$power:x", "$join:x"])
        );
    }

    #[test]
    fn test_cycles_terminate() {
        let mut arena = EventArena::new();
        let room = "!room:x";
        // A malicious pair of events referencing each other.
        add_event(&mut arena, "$a:x", room, &["$b:x"]);
        let b = add_event(&mut arena, "$b:x", room, &["$a:x"]);

        let chain = get_auth_chain(&RoomId::parse(room).unwrap(), &[b], &arena).unwrap();
        assert!(chain.iter().any(|id| id.as_str() == "$a:x"));
    }

    #[test]
    fn test_foreign_room_event_rejected() {
        let mut arena = EventArena::new();
        add_event(&mut arena, "$evil:y", "!other:y", &[]);
        let here = add_event(&mut arena, "$here:x", "!room:x", &["$evil:y"]);

        let result = get_auth_chain(&RoomId::parse("!room:x").unwrap(), &[here], &arena);
        assert!(result.is_err());
    }

    #[test]
    fn test_missing_links_are_tolerated() {
        let mut arena = EventArena::new();
        let top = add_event(&mut arena, "$top:x", "!room:x", &["$gone:x"]);
        let chain =
            get_auth_chain(&RoomId::parse("!room:x").unwrap(), &[top], &arena).unwrap();
        assert_eq!(chain.len(), 1); // the missing link itself is still listed
    }
}
