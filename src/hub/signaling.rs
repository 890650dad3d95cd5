use tokio::task::AbortHandle;
use uuid::Uuid;

use crate::{
    calls::{CallInfo, CallKind, EndReason},
    error::{ChatError, ChatResult},
    identity::RoomKey,
    protocol::ServerEvent,
};

use super::{
    Connection, Hub,
    broadcast::{emit_to_party, emit_to_room},
};

impl Hub {
    pub(crate) async fn initiate_call(&self, conn: &Connection, kind: CallKind) -> ChatResult<CallInfo> {
        let presence = self.presence_of(conn.id()).await?;
        let mut guard = self.lock_room(&presence.room).await;
        let state = &mut *guard;

        state.calls.ensure_idle()?;
        let callee = state
            .room
            .as_ref()
            .and_then(|room| room.counterpart(&presence.identity.email))
            .map(str::to_owned)
            .ok_or_else(|| ChatError::validation("there is no other party in this room"))?;

        let info = CallInfo::new(presence.room.clone(), &presence.identity, callee, kind);
        let call_id = info.call_id;
        let timer = self.spawn_call_timer(presence.room.clone(), call_id);
        let incoming = state.calls.begin(info, Some(timer))?.clone();

        let reached = emit_to_party(&state.members, &incoming.callee_email, &ServerEvent::IncomingCall(incoming.clone()));
        if reached > 0 {
            state.calls.ringing(call_id);
        }

        let info = state.calls.current().cloned().unwrap_or(incoming);
        emit_to_party(&state.members, &info.caller_email, &ServerEvent::CallInitiated(info.clone()));

        tracing::info!(
            room = %presence.room,
            %call_id,
            kind = ?kind,
            caller = %info.caller_email,
            ringing = reached > 0,
            "call initiated"
        );
        Ok(info)
    }

    pub(crate) async fn accept_call(&self, conn: &Connection, call_id: Uuid) -> ChatResult<CallInfo> {
        let presence = self.presence_of(conn.id()).await?;
        let mut guard = self.lock_room(&presence.room).await;
        let state = &mut *guard;

        let info = state.calls.accept(call_id, &presence.identity)?;
        emit_to_room(&presence.room, &state.members, &ServerEvent::CallAccepted(info.clone()), Some(conn.id()));
        tracing::info!(room = %presence.room, %call_id, "call connected");
        Ok(info)
    }

    pub(crate) async fn reject_call(&self, conn: &Connection, call_id: Uuid) -> ChatResult<CallInfo> {
        let presence = self.presence_of(conn.id()).await?;
        let mut guard = self.lock_room(&presence.room).await;
        let state = &mut *guard;

        let info = state.calls.reject(call_id, &presence.identity)?;
        emit_to_room(&presence.room, &state.members, &ServerEvent::CallRejected(info.clone()), Some(conn.id()));
        tracing::info!(room = %presence.room, %call_id, "call rejected");
        Ok(info)
    }

    pub(crate) async fn end_call(&self, conn: &Connection, call_id: Uuid) -> ChatResult<CallInfo> {
        let presence = self.presence_of(conn.id()).await?;
        let mut guard = self.lock_room(&presence.room).await;
        let state = &mut *guard;

        let info = state.calls.end(call_id, &presence.identity)?;
        let event = ServerEvent::CallEnded { call: info.clone(), reason: EndReason::Hangup };
        emit_to_room(&presence.room, &state.members, &event, Some(conn.id()));
        tracing::info!(room = %presence.room, %call_id, by = %presence.identity.email, "call ended");
        Ok(info)
    }

    pub(crate) async fn fail_call(
        &self,
        conn: &Connection,
        call_id: Uuid,
        reason: Option<String>,
    ) -> ChatResult<CallInfo> {
        let presence = self.presence_of(conn.id()).await?;
        let mut guard = self.lock_room(&presence.room).await;
        let state = &mut *guard;

        let info = state.calls.fail(call_id, &presence.identity)?;
        tracing::warn!(room = %presence.room, %call_id, reason = ?reason, "call failed");
        let event = ServerEvent::CallFailed { call: info.clone(), reason };
        emit_to_room(&presence.room, &state.members, &event, Some(conn.id()));
        Ok(info)
    }

    fn spawn_call_timer(&self, room: RoomKey, call_id: Uuid) -> AbortHandle {
        let hub = self.clone();
        let timeout = self.inner.config.call_timeout;
        tokio::spawn(async move {
            tokio::time::sleep(timeout).await;
            hub.expire_call(&room, call_id).await;
        })
        .abort_handle()
    }

    /// Timer side of the race with accept/reject/end: whichever takes the room
    /// lock first wins, and a timer for a call that is gone does nothing.
    async fn expire_call(&self, room: &RoomKey, call_id: Uuid) {
        let mut guard = self.lock_room(room).await;
        let state = &mut *guard;

        if let Some(info) = state.calls.expire(call_id) {
            tracing::info!(%room, %call_id, "call timed out");
            emit_to_room(room, &state.members, &ServerEvent::CallTimeout(info), None);
        }
        self.release_if_idle(state).await;
    }
}
