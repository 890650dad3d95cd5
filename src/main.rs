use axum::{Router, routing::get};
use techlink::{
    AppState, auth,
    config::Config,
    db,
    hub::{Hub, HubConfig},
    rooms,
    store::MessageStore,
};
use tower_http::{cors::CorsLayer, trace::TraceLayer};
use tower_sessions::{Expiry, MemoryStore, SessionManagerLayer, cookie::SameSite};
use tracing_subscriber::EnvFilter;

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    dotenv::dotenv().ok();

    tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| EnvFilter::new("techlink=info,tower_http=info")),
        )
        .init();

    let config = Config::from_env()?;

    let session_store = MemoryStore::default();
    let session_layer = SessionManagerLayer::new(session_store)
        .with_secure(config.secure_cookies)
        .with_same_site(SameSite::Lax)
        .with_expiry(Expiry::OnInactivity(time::Duration::minutes(
            config.session_inactivity_minutes,
        )));

    let db_pool = db::connect(&config).await?;
    db::migrate(&db_pool).await?;

    let store = MessageStore::new(db_pool);
    let hub = Hub::new(store.clone(), HubConfig::from(&config));
    let app_state = AppState { store, hub };

    let app = Router::new()
        .route("/ws", get(rooms::room_ws))
        .merge(auth::router())
        .nest("/rooms", rooms::router())
        .with_state(app_state)
        .layer(session_layer)
        .layer(CorsLayer::very_permissive())
        .layer(TraceLayer::new_for_http());

    let listener = tokio::net::TcpListener::bind(&config.bind_addr).await?;
    tracing::info!(addr = %config.bind_addr, call_timeout = ?config.call_timeout, "listening");
    axum::serve(listener, app).await?;
    Ok(())
}
