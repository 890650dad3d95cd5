//! JSON frames exchanged over a connection's event channel.

use serde::{Deserialize, Serialize};
use time::OffsetDateTime;
use uuid::Uuid;

use crate::{
    calls::{CallInfo, CallKind, EndReason},
    error::ChatError,
    identity::{Identity, Role, RoomKey},
    store::Message,
};

/// Frames a client sends.
#[derive(Debug, Clone, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum ClientEvent {
    JoinRoom {
        dealer_email: String,
        technician_email: String,
        user_type: Role,
    },
    LeaveRoom,
    SendMessage {
        room_id: RoomKey,
        message: String,
        #[serde(default)]
        sender_type: Option<Role>,
    },
    MarkRead {
        message_id: i64,
    },
    Typing {
        is_typing: bool,
    },
    CallInitiate {
        kind: CallKind,
    },
    CallAccept {
        call_id: Uuid,
    },
    CallReject {
        call_id: Uuid,
    },
    CallEnd {
        call_id: Uuid,
    },
    CallFail {
        call_id: Uuid,
        #[serde(default)]
        reason: Option<String>,
    },
}

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct PresenceInfo {
    pub email: String,
    pub user_type: Role,
    #[serde(with = "time::serde::rfc3339")]
    pub joined_at: OffsetDateTime,
}

/// Frames the server sends.
#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum ServerEvent {
    RoomJoined {
        room_id: RoomKey,
        members: Vec<PresenceInfo>,
        active_call: Option<CallInfo>,
    },
    UserJoined {
        room_id: RoomKey,
        #[serde(flatten)]
        user: Identity,
    },
    UserLeft {
        room_id: RoomKey,
        #[serde(flatten)]
        user: Identity,
    },
    NewMessage(Message),
    MessageRead {
        room_id: RoomKey,
        message_id: i64,
        reader_email: String,
    },
    RoomRead {
        room_id: RoomKey,
        reader_email: String,
        updated: u64,
    },
    UserTyping {
        room_id: RoomKey,
        #[serde(flatten)]
        user: Identity,
        is_typing: bool,
    },
    CallInitiated(CallInfo),
    IncomingCall(CallInfo),
    CallAccepted(CallInfo),
    CallRejected(CallInfo),
    CallTimeout(CallInfo),
    CallEnded {
        #[serde(flatten)]
        call: CallInfo,
        reason: EndReason,
    },
    CallFailed {
        #[serde(flatten)]
        call: CallInfo,
        reason: Option<String>,
    },
    Error {
        code: &'static str,
        message: String,
    },
}

impl From<&ChatError> for ServerEvent {
    fn from(err: &ChatError) -> Self {
        ServerEvent::Error {
            code: err.code(),
            message: err.to_string(),
        }
    }
}
