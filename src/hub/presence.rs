use std::sync::Arc;

use time::OffsetDateTime;
use tokio::{
    runtime::Handle,
    sync::{Notify, mpsc},
};

use crate::{
    calls::EndReason,
    error::{ChatError, ChatResult},
    identity::{Identity, Role, RoomKey},
    protocol::{ClientEvent, ServerEvent},
    store::Room,
};

use super::{
    ConnectionId, Hub, Presence, Scoped,
    broadcast::{Member, deliver, emit_to_room},
};

/// One live client. Holding it is holding the connection's presence: `close`
/// releases it, and so does dropping it on any other exit path.
pub struct Connection {
    id: ConnectionId,
    identity: Identity,
    tx: mpsc::Sender<ServerEvent>,
    hub: Hub,
    signed_out: Arc<Notify>,
    closed: bool,
}

impl Connection {
    pub fn id(&self) -> ConnectionId {
        self.id
    }

    pub fn identity(&self) -> &Identity {
        &self.identity
    }

    pub async fn handle(&self, event: ClientEvent) -> ChatResult<()> {
        self.hub.dispatch(self, event).await
    }

    /// Reports a failed operation to this connection only.
    pub fn reply_error(&self, err: &ChatError) {
        deliver(&self.tx, err.into());
    }

    /// Resolves once the session this connection was opened under signs out.
    /// The connection has already left its room by then.
    pub async fn signed_out(&self) {
        self.signed_out.notified().await;
    }

    pub async fn close(mut self) {
        self.closed = true;
        self.hub.release(self.id).await;
        tracing::debug!(connection = %self.id, "connection closed");
    }
}

impl Drop for Connection {
    fn drop(&mut self) {
        if self.closed {
            return;
        }
        let Ok(runtime) = Handle::try_current() else {
            tracing::warn!(connection = %self.id, "connection dropped outside a runtime, presence not released");
            return;
        };
        let hub = self.hub.clone();
        let id = self.id;
        runtime.spawn(async move { hub.release(id).await });
    }
}

impl Hub {
    /// Opens a connection for an identity the auth layer has already vouched for.
    pub fn connect(&self, identity: Identity) -> (Connection, mpsc::Receiver<ServerEvent>) {
        let (tx, rx) = mpsc::channel(self.inner.config.outbox_capacity);
        let conn = Connection {
            id: ConnectionId::new(),
            identity,
            tx,
            hub: self.clone(),
            signed_out: Arc::new(Notify::new()),
            closed: false,
        };
        tracing::debug!(connection = %conn.id, identity = %conn.identity, "connection opened");
        (conn, rx)
    }

    /// Like `connect`, but ties the connection to a login `scope` so that
    /// `sign_out(scope)` can end it.
    pub async fn connect_in_scope(
        &self,
        identity: Identity,
        scope: impl Into<String>,
    ) -> (Connection, mpsc::Receiver<ServerEvent>) {
        let (conn, rx) = self.connect(identity);
        let scoped = Scoped { scope: scope.into(), signed_out: conn.signed_out.clone() };
        self.inner.scopes.write().await.insert(conn.id, scoped);
        (conn, rx)
    }

    /// Ends every connection opened under `scope`: each leaves its room and
    /// its `signed_out` future resolves. Returns how many were ended.
    pub async fn sign_out(&self, scope: &str) -> usize {
        let mut ended = Vec::new();
        self.inner.scopes.write().await.retain(|id, scoped| {
            if scoped.scope != scope {
                return true;
            }
            ended.push((*id, scoped.signed_out.clone()));
            false
        });

        for (id, signed_out) in &ended {
            self.unregister(*id).await;
            signed_out.notify_one();
        }
        if !ended.is_empty() {
            tracing::info!(connections = ended.len(), "session signed out, connections ended");
        }
        ended.len()
    }

    /// Forgets a connection entirely. Used when it closes or is dropped.
    async fn release(&self, id: ConnectionId) {
        self.inner.scopes.write().await.remove(&id);
        self.unregister(id).await;
    }

    pub(crate) async fn join_room(
        &self,
        conn: &Connection,
        dealer_email: &str,
        technician_email: &str,
        user_type: Role,
    ) -> ChatResult<RoomKey> {
        let identity = conn.identity();
        if user_type != identity.role {
            return Err(ChatError::validation(format!(
                "user_type {user_type} does not match the signed-in role {}",
                identity.role
            )));
        }
        let own_email = match identity.role {
            Role::Dealer => dealer_email.trim(),
            Role::Technician => technician_email.trim(),
        };
        if own_email != identity.email {
            return Err(ChatError::validation("signed-in party is not part of this room"));
        }

        let room = self.inner.store.get_or_create_room(dealer_email, technician_email).await?;
        let key = room.room_id.clone();
        self.register(conn, room).await;
        Ok(key)
    }

    /// Puts `conn` into `room`, replacing whatever room it was in before.
    pub(crate) async fn register(&self, conn: &Connection, room: Room) {
        let key = room.room_id.clone();
        let joined_at = OffsetDateTime::now_utc();

        let previous = self.inner.connections.write().await.insert(
            conn.id,
            Presence { room: key.clone(), identity: conn.identity.clone(), joined_at },
        );
        if let Some(previous) = previous {
            if previous.room != key {
                self.leave(conn.id, &previous.room).await;
            }
        }

        let mut guard = self.lock_room(&key).await;
        let state = &mut *guard;
        state.room.get_or_insert(room);

        let member = Member { identity: conn.identity.clone(), joined_at, tx: conn.tx.clone() };
        let rejoined = state.members.insert(conn.id, member).is_some();
        if !rejoined {
            let event = ServerEvent::UserJoined { room_id: key.clone(), user: conn.identity.clone() };
            emit_to_room(&key, &state.members, &event, Some(conn.id));
            tracing::info!(room = %key, connection = %conn.id, identity = %conn.identity, "joined room");
        }

        deliver(
            &conn.tx,
            ServerEvent::RoomJoined {
                room_id: key,
                members: state.roster(),
                active_call: state.calls.current().cloned(),
            },
        );
    }

    /// Releases a connection's presence. Unknown connections are ignored.
    pub async fn unregister(&self, id: ConnectionId) {
        let removed = self.inner.connections.write().await.remove(&id);
        if let Some(presence) = removed {
            self.leave(id, &presence.room).await;
        }
    }

    async fn leave(&self, id: ConnectionId, key: &RoomKey) {
        let mut guard = self.lock_room(key).await;
        let state = &mut *guard;

        let Some(member) = state.members.remove(&id) else {
            self.release_if_idle(state).await;
            return;
        };
        let user = member.identity;
        tracing::info!(room = %key, connection = %id, identity = %user, "left room");

        let event = ServerEvent::UserLeft { room_id: key.clone(), user: user.clone() };
        emit_to_room(key, &state.members, &event, None);

        let still_here = state.members.values().any(|m| m.identity.email == user.email);
        if !still_here {
            if let Some(call) = state.calls.force_end(&user.email) {
                tracing::info!(room = %key, call_id = %call.call_id, "call ended by disconnect");
                let event = ServerEvent::CallEnded { call, reason: EndReason::PeerDisconnected };
                emit_to_room(key, &state.members, &event, None);
            }
        }

        self.release_if_idle(state).await;
    }
}
