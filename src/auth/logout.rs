use axum::{debug_handler, extract::State, http::StatusCode};
use tower_sessions::Session;

use crate::{AppState, appresult::AppResult, hub::Hub};

/// Clears the session and ends every socket that was opened with it.
#[debug_handler(state = AppState)]
pub(crate) async fn logout(State(hub): State<Hub>, session: Session) -> AppResult<StatusCode> {
    if let Some(id) = session.id() {
        hub.sign_out(&id.to_string()).await;
    }
    session.flush().await?;
    Ok(StatusCode::NO_CONTENT)
}
