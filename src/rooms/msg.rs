use axum::{
    Json, debug_handler,
    extract::{Path, Query, State},
    response::{IntoResponse, Response},
};
use serde::Deserialize;
use serde_json::json;

use crate::{
    AppState,
    appresult::AppResult,
    hub::Hub,
    identity::RoomKey,
    session::CurrentIdentity,
    store::MessageStore,
};

use super::{room_for, sorry};

#[derive(Deserialize)]
pub(crate) struct HistoryQuery {
    limit: Option<u32>,
    offset: Option<u32>,
}

#[debug_handler(state = AppState)]
pub(crate) async fn history(
    State(store): State<MessageStore>,
    CurrentIdentity(me): CurrentIdentity,
    Path(room_id): Path<RoomKey>,
    Query(HistoryQuery { limit, offset }): Query<HistoryQuery>,
) -> AppResult<Response> {
    if room_for(&store, &room_id, &me).await?.is_none() {
        return Ok(sorry(&room_id));
    }
    let messages = store.history(&room_id, limit, offset).await?;
    Ok(Json(messages).into_response())
}

/// Marks everything the other party sent as read and tells whoever is connected.
#[debug_handler(state = AppState)]
pub(crate) async fn mark_read(
    State(store): State<MessageStore>,
    State(hub): State<Hub>,
    CurrentIdentity(me): CurrentIdentity,
    Path(room_id): Path<RoomKey>,
) -> AppResult<Response> {
    if room_for(&store, &room_id, &me).await?.is_none() {
        return Ok(sorry(&room_id));
    }
    let updated = hub.mark_room_read(&room_id, &me).await?;
    Ok(Json(json!({ "room_id": room_id, "updated": updated })).into_response())
}
