//! Process-wide room coordinator.
//!
//! Every room gets its own `tokio::sync::Mutex<RoomState>`. Presence changes,
//! call-slot transitions and the persist-then-broadcast of a message all run
//! while holding that room's lock, so a room's events reach every member in
//! one order and rooms never wait on each other. The room index itself is
//! only held long enough to clone an `Arc` out of it.

mod broadcast;
mod messaging;
mod presence;
mod signaling;

use std::{
    collections::{HashMap, HashSet},
    fmt,
    sync::Arc,
    time::Duration,
};

use time::OffsetDateTime;
use tokio::sync::{Mutex, Notify, OwnedMutexGuard, RwLock};
use uuid::Uuid;

pub use presence::Connection;

use crate::{
    calls::{CallInfo, CallSlot, DEFAULT_CALL_TIMEOUT},
    config::Config,
    error::{ChatError, ChatResult},
    identity::{Identity, RoomKey},
    protocol::{ClientEvent, PresenceInfo},
    store::{MessageStore, Room},
};

use broadcast::Member;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct ConnectionId(Uuid);

impl ConnectionId {
    pub fn new() -> Self {
        Self(Uuid::now_v7())
    }
}

impl Default for ConnectionId {
    fn default() -> Self {
        Self::new()
    }
}

impl fmt::Display for ConnectionId {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        fmt::Display::fmt(&self.0, f)
    }
}

#[derive(Debug, Clone)]
pub struct HubConfig {
    /// How long an unanswered call may ring.
    pub call_timeout: Duration,
    /// Events queued per connection before further ones are dropped.
    pub outbox_capacity: usize,
}

impl Default for HubConfig {
    fn default() -> Self {
        Self {
            call_timeout: DEFAULT_CALL_TIMEOUT,
            outbox_capacity: 256,
        }
    }
}

impl From<&Config> for HubConfig {
    fn from(config: &Config) -> Self {
        Self {
            call_timeout: config.call_timeout,
            outbox_capacity: config.outbox_capacity.max(1),
        }
    }
}

pub(crate) struct RoomState {
    key: RoomKey,
    room: Option<Room>,
    members: HashMap<ConnectionId, Member>,
    calls: CallSlot,
    /// Set once the state is dropped from the index; a task that was
    /// waiting on the lock must look the room up again.
    closed: bool,
}

impl RoomState {
    fn new(key: RoomKey) -> Self {
        Self {
            key,
            room: None,
            members: HashMap::new(),
            calls: CallSlot::default(),
            closed: false,
        }
    }

    /// Connected parties, one entry per email, earliest join first.
    fn roster(&self) -> Vec<PresenceInfo> {
        let mut roster: Vec<_> = self.members.values().map(Member::presence).collect();
        roster.sort_by(|a, b| a.joined_at.cmp(&b.joined_at).then_with(|| a.email.cmp(&b.email)));
        let mut seen = HashSet::new();
        roster.retain(|p| seen.insert(p.email.clone()));
        roster
    }
}

#[derive(Debug, Clone)]
struct Presence {
    room: RoomKey,
    identity: Identity,
    joined_at: OffsetDateTime,
}

/// A connection opened under a login scope (the session id, over HTTP).
struct Scoped {
    scope: String,
    signed_out: Arc<Notify>,
}

struct Inner {
    store: MessageStore,
    config: HubConfig,
    rooms: RwLock<HashMap<RoomKey, Arc<Mutex<RoomState>>>>,
    connections: RwLock<HashMap<ConnectionId, Presence>>,
    scopes: RwLock<HashMap<ConnectionId, Scoped>>,
}

#[derive(Clone)]
pub struct Hub {
    inner: Arc<Inner>,
}

impl Hub {
    pub fn new(store: MessageStore, config: HubConfig) -> Self {
        Self {
            inner: Arc::new(Inner {
                store,
                config,
                rooms: RwLock::new(HashMap::new()),
                connections: RwLock::new(HashMap::new()),
                scopes: RwLock::new(HashMap::new()),
            }),
        }
    }

    pub fn store(&self) -> &MessageStore {
        &self.inner.store
    }

    pub fn config(&self) -> &HubConfig {
        &self.inner.config
    }

    /// Parties currently connected to `room`.
    pub async fn members_of(&self, room: &RoomKey) -> Vec<PresenceInfo> {
        let Some(state) = self.peek_room(room).await else {
            return Vec::new();
        };
        let state = state.lock().await;
        state.roster()
    }

    /// The non-terminal call in `room`, if any.
    pub async fn active_call(&self, room: &RoomKey) -> Option<CallInfo> {
        let state = self.peek_room(room).await?;
        let state = state.lock().await;
        state.calls.current().cloned()
    }

    /// Number of connections that have joined a room.
    pub async fn joined_connections(&self) -> usize {
        self.inner.connections.read().await.len()
    }

    pub(crate) async fn dispatch(&self, conn: &Connection, event: ClientEvent) -> ChatResult<()> {
        match event {
            ClientEvent::JoinRoom { dealer_email, technician_email, user_type } => self
                .join_room(conn, &dealer_email, &technician_email, user_type)
                .await
                .map(drop),
            ClientEvent::LeaveRoom => {
                self.unregister(conn.id()).await;
                Ok(())
            }
            ClientEvent::SendMessage { room_id, message, sender_type } => self
                .send_message(conn, &room_id, &message, sender_type)
                .await
                .map(drop),
            ClientEvent::MarkRead { message_id } => self.mark_read(conn, message_id).await.map(drop),
            ClientEvent::Typing { is_typing } => self.typing(conn, is_typing).await,
            ClientEvent::CallInitiate { kind } => self.initiate_call(conn, kind).await.map(drop),
            ClientEvent::CallAccept { call_id } => self.accept_call(conn, call_id).await.map(drop),
            ClientEvent::CallReject { call_id } => {
                swallow_resolved(self.reject_call(conn, call_id).await)
            }
            ClientEvent::CallEnd { call_id } => swallow_resolved(self.end_call(conn, call_id).await),
            ClientEvent::CallFail { call_id, reason } => {
                swallow_resolved(self.fail_call(conn, call_id, reason).await)
            }
        }
    }

    async fn presence_of(&self, id: ConnectionId) -> ChatResult<Presence> {
        self.inner
            .connections
            .read()
            .await
            .get(&id)
            .cloned()
            .ok_or_else(|| ChatError::validation("join a room first"))
    }

    async fn peek_room(&self, key: &RoomKey) -> Option<Arc<Mutex<RoomState>>> {
        self.inner.rooms.read().await.get(key).cloned()
    }

    /// Locks a room's state, creating it on first use.
    async fn lock_room(&self, key: &RoomKey) -> OwnedMutexGuard<RoomState> {
        loop {
            let room = match self.peek_room(key).await {
                Some(room) => room,
                None => self
                    .inner
                    .rooms
                    .write()
                    .await
                    .entry(key.clone())
                    .or_insert_with(|| Arc::new(Mutex::new(RoomState::new(key.clone()))))
                    .clone(),
            };
            let guard = room.lock_owned().await;
            if !guard.closed {
                return guard;
            }
        }
    }

    /// Drops a room from the index once nobody is connected and no call is
    /// pending. Must be called with the room's lock held.
    async fn release_if_idle(&self, state: &mut RoomState) {
        if state.closed || !state.members.is_empty() || !state.calls.is_idle() {
            return;
        }
        state.closed = true;
        self.inner.rooms.write().await.remove(&state.key);
        tracing::debug!(room = %state.key, "room released");
    }
}

fn swallow_resolved<T>(result: ChatResult<T>) -> ChatResult<()> {
    match result {
        Ok(_) => Ok(()),
        Err(ChatError::CallAlreadyResolved(call_id)) => {
            tracing::debug!(%call_id, "call already resolved, ignoring");
            Ok(())
        }
        Err(err) => Err(err),
    }
}
