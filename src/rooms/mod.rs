mod msg;
mod room;
mod ws;

use axum::{
    Json, Router,
    http::StatusCode,
    response::{IntoResponse, Response},
    routing::{get, post},
};
use serde_json::json;

use crate::{
    AppState,
    appresult::AppResult,
    identity::{Identity, RoomKey},
    store::{MessageStore, Room},
};

pub use ws::room_ws;

pub fn router() -> Router<AppState> {
    Router::new()
        .route("/", get(room::my_rooms).post(room::open_room))
        .route("/{room_id}", get(room::room))
        .route("/{room_id}/members", get(room::members))
        .route("/{room_id}/messages", get(msg::history))
        .route("/{room_id}/read", post(msg::mark_read))
}

/// The room behind `key`, if `me` is one of its two parties.
async fn room_for(store: &MessageStore, key: &RoomKey, me: &Identity) -> AppResult<Option<Room>> {
    let room = store.room(key).await?;
    Ok(room.filter(|room| room.counterpart(&me.email).is_some()))
}

/// Same answer for a room that doesn't exist and one the caller isn't in.
fn sorry(key: &RoomKey) -> Response {
    (
        StatusCode::NOT_FOUND,
        Json(json!({ "code": "NOT_FOUND", "message": format!("no room {key}") })),
    )
        .into_response()
}
