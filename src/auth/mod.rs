mod login;
mod logout;

use axum::{Router, routing::post};

use crate::AppState;

pub fn router() -> Router<AppState> {
    Router::new().route("/session", post(login::login).delete(logout::logout))
}
