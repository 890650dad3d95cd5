pub mod appresult;
pub mod auth;
pub mod calls;
pub mod config;
pub mod db;
pub mod error;
pub mod hub;
pub mod identity;
pub mod protocol;
pub mod rooms;
pub mod session;
pub mod store;

use axum::extract::FromRef;

pub use appresult::{AppError, AppResult};

#[derive(Clone, FromRef)]
pub struct AppState {
    pub store: store::MessageStore,
    pub hub: hub::Hub,
}
