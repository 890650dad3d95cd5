use axum::{Json, debug_handler, extract::State};
use serde::Deserialize;
use tower_sessions::Session;

use crate::{
    AppState,
    appresult::AppResult,
    hub::Hub,
    identity::{Identity, Role},
    session::{EMAIL, USER_TYPE},
};

#[derive(Deserialize)]
pub(crate) struct LoginBody {
    email: String,
    user_type: Role,
}

/// Records who is on this session. Whatever vouched for the party has done so
/// before this request; the socket handshake only ever trusts what is stored here.
/// Sockets opened under a previous identity on this session are ended.
#[debug_handler(state = AppState)]
pub(crate) async fn login(
    State(hub): State<Hub>,
    session: Session,
    Json(LoginBody { email, user_type }): Json<LoginBody>,
) -> AppResult<Json<Identity>> {
    let identity = Identity::new(email, user_type)?;

    if let Some(id) = session.id() {
        hub.sign_out(&id.to_string()).await;
    }
    session.cycle_id().await?;
    session.insert(EMAIL, &identity.email).await?;
    session.insert(USER_TYPE, identity.role).await?;

    tracing::info!(identity = %identity, "signed in");
    Ok(Json(identity))
}
