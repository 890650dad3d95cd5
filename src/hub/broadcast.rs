//! Fan-out of events to the connections registered in one room.
//!
//! Delivery is a non-blocking push onto each connection's bounded queue. A
//! connection whose queue is full or gone misses the event and has to catch
//! up from history. Callers emit while holding the room lock, which is what
//! gives every member the same per-room order.

use std::collections::HashMap;

use time::OffsetDateTime;
use tokio::sync::mpsc::{self, error::TrySendError};

use crate::{identity::{Identity, RoomKey}, protocol::{PresenceInfo, ServerEvent}};

use super::ConnectionId;

pub(crate) struct Member {
    pub(crate) identity: Identity,
    pub(crate) joined_at: OffsetDateTime,
    pub(crate) tx: mpsc::Sender<ServerEvent>,
}

impl Member {
    pub(crate) fn presence(&self) -> PresenceInfo {
        PresenceInfo {
            email: self.identity.email.clone(),
            user_type: self.identity.role,
            joined_at: self.joined_at,
        }
    }
}

/// Pushes one event onto a connection's queue. Returns whether it was queued.
pub(crate) fn deliver(tx: &mpsc::Sender<ServerEvent>, event: ServerEvent) -> bool {
    match tx.try_send(event) {
        Ok(()) => true,
        Err(TrySendError::Full(event)) => {
            tracing::warn!(event = ?event, "outbound queue full, event dropped");
            false
        }
        Err(TrySendError::Closed(_)) => false,
    }
}

/// Delivers `event` to every member of `room` except `exclude`.
pub(crate) fn emit_to_room(
    room: &RoomKey,
    members: &HashMap<ConnectionId, Member>,
    event: &ServerEvent,
    exclude: Option<ConnectionId>,
) -> usize {
    let delivered = members
        .iter()
        .filter(|(id, _)| Some(**id) != exclude)
        .filter(|(_, member)| deliver(&member.tx, event.clone()))
        .count();
    tracing::trace!(room = %room, delivered, "room event emitted");
    delivered
}

/// Delivers `event` only to the connections of one party in the room.
pub(crate) fn emit_to_party(
    members: &HashMap<ConnectionId, Member>,
    email: &str,
    event: &ServerEvent,
) -> usize {
    members
        .values()
        .filter(|member| member.identity.email == email)
        .filter(|member| deliver(&member.tx, event.clone()))
        .count()
}
