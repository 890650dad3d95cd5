//! Durable rooms and the per-room ordered message log.
//!
//! The store is the only place ids and timestamps are assigned. Within a room
//! `sent_at` never goes backwards, so ordering by `(sent_at, id)` agrees with
//! insertion order even if the wall clock steps back.

use serde::Serialize;
use sqlx::SqlitePool;
use time::OffsetDateTime;

use crate::{
    db::{from_millis, now_millis},
    error::{ChatError, ChatResult},
    identity::{Role, RoomKey},
};

pub const DEFAULT_PAGE_SIZE: u32 = 50;
pub const MAX_PAGE_SIZE: u32 = 500;

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct Room {
    pub room_id: RoomKey,
    pub dealer_email: String,
    pub technician_email: String,
    #[serde(with = "time::serde::rfc3339")]
    pub created_at: OffsetDateTime,
    #[serde(with = "time::serde::rfc3339")]
    pub last_activity: OffsetDateTime,
}

impl Room {
    /// The party in this room that is not `email`.
    pub fn counterpart(&self, email: &str) -> Option<&str> {
        if email == self.dealer_email {
            Some(&self.technician_email)
        } else if email == self.technician_email {
            Some(&self.dealer_email)
        } else {
            None
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct Message {
    pub id: i64,
    pub room_id: RoomKey,
    pub sender_email: String,
    pub sender_type: Role,
    pub content: String,
    #[serde(with = "time::serde::rfc3339")]
    pub sent_at: OffsetDateTime,
    pub read_status: bool,
}

type RoomRow = (String, String, String, i64, i64);
type MessageRow = (i64, String, String, String, String, i64, bool);

fn room_from_row((room_id, dealer_email, technician_email, created_at, last_activity): RoomRow) -> Room {
    Room {
        room_id: RoomKey::for_stored(room_id),
        dealer_email,
        technician_email,
        created_at: from_millis(created_at),
        last_activity: from_millis(last_activity),
    }
}

fn message_from_row(
    (id, room_id, sender_email, sender_type, content, sent_at, read_status): MessageRow,
) -> ChatResult<Message> {
    let sender_type = sender_type
        .parse::<Role>()
        .map_err(|e| sqlx::Error::Decode(Box::new(e)))?;
    Ok(Message {
        id,
        room_id: RoomKey::for_stored(room_id),
        sender_email,
        sender_type,
        content,
        sent_at: from_millis(sent_at),
        read_status,
    })
}

const ROOM_COLUMNS: &str = "room_id,dealer_email,technician_email,created_at,last_activity";
const MESSAGE_COLUMNS: &str =
    "id,room_id,sender_email,sender_type,message_content,sent_at,read_status";

#[derive(Clone)]
pub struct MessageStore {
    db_pool: SqlitePool,
}

impl MessageStore {
    pub fn new(db_pool: SqlitePool) -> Self {
        Self { db_pool }
    }

    pub async fn get_or_create_room(
        &self,
        dealer_email: &str,
        technician_email: &str,
    ) -> ChatResult<Room> {
        let key = RoomKey::for_pair(dealer_email, technician_email)?;
        let (dealer_email, technician_email) = (dealer_email.trim(), technician_email.trim());
        if dealer_email == technician_email {
            return Err(ChatError::InvalidIdentity);
        }
        let now = now_millis();

        let created = sqlx::query(
            "INSERT OR IGNORE INTO chat_rooms (room_id,dealer_email,technician_email,created_at,last_activity) VALUES (?,?,?,?,?)",
        )
        .bind(key.as_str())
        .bind(dealer_email)
        .bind(technician_email)
        .bind(now)
        .bind(now)
        .execute(&self.db_pool)
        .await?
        .rows_affected()
            > 0;
        if created {
            tracing::info!(room = %key, "room created");
        }

        let room = self.room(&key).await?.ok_or(sqlx::Error::RowNotFound)?;
        if room.dealer_email != dealer_email || room.technician_email != technician_email {
            tracing::warn!(room = %key, "room key is held by a different pair");
            return Err(ChatError::validation(format!("room {key} belongs to a different pair")));
        }
        Ok(room)
    }

    pub async fn room(&self, key: &RoomKey) -> ChatResult<Option<Room>> {
        let row: Option<RoomRow> =
            sqlx::query_as(&format!("SELECT {ROOM_COLUMNS} FROM chat_rooms WHERE room_id=?"))
                .bind(key.as_str())
                .fetch_optional(&self.db_pool)
                .await?;
        Ok(row.map(room_from_row))
    }

    /// Rooms the given party belongs to, most recently active first.
    pub async fn rooms_for(&self, email: &str) -> ChatResult<Vec<Room>> {
        let rows: Vec<RoomRow> = sqlx::query_as(&format!(
            "SELECT {ROOM_COLUMNS} FROM chat_rooms WHERE dealer_email=? OR technician_email=? ORDER BY last_activity DESC, room_id"
        ))
        .bind(email.trim())
        .bind(email.trim())
        .fetch_all(&self.db_pool)
        .await?;
        Ok(rows.into_iter().map(room_from_row).collect())
    }

    /// Persists a message. Id, timestamp and the room's last-activity bump are
    /// committed together; callers broadcast only after this returns.
    pub async fn append(
        &self,
        room: &RoomKey,
        sender_email: &str,
        sender_type: Role,
        content: &str,
    ) -> ChatResult<Message> {
        if room.as_str().trim().is_empty() {
            return Err(ChatError::validation("room id must not be empty"));
        }
        let sender_email = sender_email.trim();
        if sender_email.is_empty() {
            return Err(ChatError::validation("sender must not be empty"));
        }
        if content.trim().is_empty() {
            return Err(ChatError::validation("message must not be empty"));
        }

        let mut tx = self.db_pool.begin().await?;

        let bumped = sqlx::query("UPDATE chat_rooms SET last_activity=MAX(last_activity, ?) WHERE room_id=?")
            .bind(now_millis())
            .bind(room.as_str())
            .execute(&mut *tx)
            .await?
            .rows_affected();
        if bumped == 0 {
            return Err(ChatError::validation(format!("room {room} does not exist")));
        }

        let (last,): (Option<i64>,) =
            sqlx::query_as("SELECT MAX(sent_at) FROM chat_messages WHERE room_id=?")
                .bind(room.as_str())
                .fetch_one(&mut *tx)
                .await?;
        let sent_at = last.map_or(now_millis(), |last| last.max(now_millis()));

        let id = sqlx::query(
            "INSERT INTO chat_messages (room_id,sender_email,sender_type,message_content,sent_at,read_status) VALUES (?,?,?,?,?,0)",
        )
        .bind(room.as_str())
        .bind(sender_email)
        .bind(sender_type.as_str())
        .bind(content)
        .bind(sent_at)
        .execute(&mut *tx)
        .await?
        .last_insert_rowid();

        tx.commit().await?;

        tracing::debug!(room = %room, id, sender = sender_email, "message stored");
        Ok(Message {
            id,
            room_id: room.clone(),
            sender_email: sender_email.to_owned(),
            sender_type,
            content: content.to_owned(),
            sent_at: from_millis(sent_at),
            read_status: false,
        })
    }

    /// Flips the read flag of one message in `room`. Returns whether anything
    /// changed; unknown ids and already-read messages are not errors.
    pub async fn mark_read(&self, room: &RoomKey, message_id: i64) -> ChatResult<bool> {
        let changed = sqlx::query(
            "UPDATE chat_messages SET read_status=1 WHERE id=? AND room_id=? AND read_status=0",
        )
        .bind(message_id)
        .bind(room.as_str())
        .execute(&self.db_pool)
        .await?
        .rows_affected();
        Ok(changed > 0)
    }

    /// Marks everything the other party sent in `room` as read by `reader_email`.
    pub async fn mark_room_read(&self, room: &RoomKey, reader_email: &str) -> ChatResult<u64> {
        let changed = sqlx::query(
            "UPDATE chat_messages SET read_status=1 WHERE room_id=? AND sender_email<>? AND read_status=0",
        )
        .bind(room.as_str())
        .bind(reader_email.trim())
        .execute(&self.db_pool)
        .await?
        .rows_affected();
        Ok(changed)
    }

    pub async fn unread_count(&self, room: &RoomKey, reader_email: &str) -> ChatResult<i64> {
        let (count,): (i64,) = sqlx::query_as(
            "SELECT COUNT(*) FROM chat_messages WHERE room_id=? AND sender_email<>? AND read_status=0",
        )
        .bind(room.as_str())
        .bind(reader_email.trim())
        .fetch_one(&self.db_pool)
        .await?;
        Ok(count)
    }

    /// Oldest-first page of a room's messages.
    pub async fn history(
        &self,
        room: &RoomKey,
        limit: Option<u32>,
        offset: Option<u32>,
    ) -> ChatResult<Vec<Message>> {
        let limit = limit.unwrap_or(DEFAULT_PAGE_SIZE).min(MAX_PAGE_SIZE);
        let offset = offset.unwrap_or(0);

        let rows: Vec<MessageRow> = sqlx::query_as(&format!(
            "SELECT {MESSAGE_COLUMNS} FROM chat_messages WHERE room_id=? ORDER BY sent_at ASC, id ASC LIMIT ? OFFSET ?"
        ))
        .bind(room.as_str())
        .bind(limit)
        .bind(offset)
        .fetch_all(&self.db_pool)
        .await?;

        rows.into_iter().map(message_from_row).collect()
    }
}
