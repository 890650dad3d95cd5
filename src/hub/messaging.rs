use crate::{
    error::{ChatError, ChatResult},
    identity::{Identity, Role, RoomKey},
    protocol::ServerEvent,
    store::Message,
};

use super::{Connection, Hub, broadcast::emit_to_room};

impl Hub {
    /// Stores a message and then fans it out to the whole room, sender
    /// included. Nothing is broadcast if the store refuses it.
    pub(crate) async fn send_message(
        &self,
        conn: &Connection,
        room_id: &RoomKey,
        content: &str,
        sender_type: Option<Role>,
    ) -> ChatResult<Message> {
        let presence = self.presence_of(conn.id()).await?;
        if &presence.room != room_id {
            return Err(ChatError::validation(format!("not joined to room {room_id}")));
        }
        if let Some(sender_type) = sender_type {
            if sender_type != presence.identity.role {
                return Err(ChatError::validation(format!(
                    "sender_type {sender_type} does not match the signed-in role"
                )));
            }
        }

        let state = self.lock_room(room_id).await;
        let message = self
            .inner
            .store
            .append(room_id, &presence.identity.email, presence.identity.role, content)
            .await
            .inspect_err(|err| {
                if let ChatError::StoreUnavailable(source) = err {
                    tracing::warn!(room = %room_id, error = %source, "message not stored");
                }
            })?;

        emit_to_room(room_id, &state.members, &ServerEvent::NewMessage(message.clone()), None);
        tracing::debug!(room = %room_id, id = message.id, "message delivered");
        Ok(message)
    }

    pub(crate) async fn mark_read(&self, conn: &Connection, message_id: i64) -> ChatResult<bool> {
        let presence = self.presence_of(conn.id()).await?;
        let state = self.lock_room(&presence.room).await;

        let changed = self.inner.store.mark_read(&presence.room, message_id).await?;
        if changed {
            let event = ServerEvent::MessageRead {
                room_id: presence.room.clone(),
                message_id,
                reader_email: presence.identity.email.clone(),
            };
            emit_to_room(&presence.room, &state.members, &event, Some(conn.id()));
        }
        Ok(changed)
    }

    /// Marks every message from the other party read on behalf of `reader`,
    /// whether or not the reader is connected.
    pub async fn mark_room_read(&self, room_id: &RoomKey, reader: &Identity) -> ChatResult<u64> {
        let mut guard = self.lock_room(room_id).await;
        let state = &mut *guard;

        let updated = self.inner.store.mark_room_read(room_id, &reader.email).await;
        match updated {
            Ok(count) if count > 0 => {
                let event = ServerEvent::RoomRead {
                    room_id: room_id.clone(),
                    reader_email: reader.email.clone(),
                    updated: count,
                };
                emit_to_room(room_id, &state.members, &event, None);
            }
            _ => {}
        }

        self.release_if_idle(state).await;
        updated
    }

    pub(crate) async fn typing(&self, conn: &Connection, is_typing: bool) -> ChatResult<()> {
        let presence = self.presence_of(conn.id()).await?;
        let state = self.lock_room(&presence.room).await;
        let event = ServerEvent::UserTyping {
            room_id: presence.room.clone(),
            user: presence.identity,
            is_typing,
        };
        emit_to_room(&presence.room, &state.members, &event, Some(conn.id()));
        Ok(())
    }
}
