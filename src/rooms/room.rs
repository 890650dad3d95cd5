use axum::{
    Json, debug_handler,
    extract::{Path, State},
    response::{IntoResponse, Response},
};
use serde::{Deserialize, Serialize};

use crate::{
    AppState,
    appresult::AppResult,
    calls::CallInfo,
    hub::Hub,
    identity::{Role, RoomKey},
    protocol::PresenceInfo,
    session::CurrentIdentity,
    store::{MessageStore, Room},
};

use super::{room_for, sorry};

#[derive(Serialize)]
pub(crate) struct RoomSummary {
    #[serde(flatten)]
    room: Room,
    unread: i64,
}

#[derive(Serialize)]
pub(crate) struct RoomView {
    #[serde(flatten)]
    room: Room,
    unread: i64,
    members: Vec<PresenceInfo>,
    active_call: Option<CallInfo>,
}

#[derive(Deserialize)]
pub(crate) struct OpenRoomBody {
    counterpart_email: String,
}

#[debug_handler(state = AppState)]
pub(crate) async fn my_rooms(
    State(store): State<MessageStore>,
    CurrentIdentity(me): CurrentIdentity,
) -> AppResult<Json<Vec<RoomSummary>>> {
    let rooms = store.rooms_for(&me.email).await?;

    let mut summaries = Vec::with_capacity(rooms.len());
    for room in rooms {
        let unread = store.unread_count(&room.room_id, &me.email).await?;
        summaries.push(RoomSummary { room, unread });
    }
    Ok(Json(summaries))
}

#[debug_handler(state = AppState)]
pub(crate) async fn open_room(
    State(store): State<MessageStore>,
    CurrentIdentity(me): CurrentIdentity,
    Json(OpenRoomBody { counterpart_email }): Json<OpenRoomBody>,
) -> AppResult<Json<Room>> {
    let room = match me.role {
        Role::Dealer => store.get_or_create_room(&me.email, &counterpart_email).await?,
        Role::Technician => store.get_or_create_room(&counterpart_email, &me.email).await?,
    };
    Ok(Json(room))
}

#[debug_handler(state = AppState)]
pub(crate) async fn room(
    State(store): State<MessageStore>,
    State(hub): State<Hub>,
    CurrentIdentity(me): CurrentIdentity,
    Path(room_id): Path<RoomKey>,
) -> AppResult<Response> {
    let Some(room) = room_for(&store, &room_id, &me).await? else {
        return Ok(sorry(&room_id));
    };

    let view = RoomView {
        unread: store.unread_count(&room_id, &me.email).await?,
        members: hub.members_of(&room_id).await,
        active_call: hub.active_call(&room_id).await,
        room,
    };
    Ok(Json(view).into_response())
}

#[debug_handler(state = AppState)]
pub(crate) async fn members(
    State(store): State<MessageStore>,
    State(hub): State<Hub>,
    CurrentIdentity(me): CurrentIdentity,
    Path(room_id): Path<RoomKey>,
) -> AppResult<Response> {
    if room_for(&store, &room_id, &me).await?.is_none() {
        return Ok(sorry(&room_id));
    }
    Ok(Json(hub.members_of(&room_id).await).into_response())
}
