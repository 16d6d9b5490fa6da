pub mod auth;
pub mod messages;
pub mod middleware;

use std::sync::Arc;

use axum::{
    Json, Router,
    extract::{State, WebSocketUpgrade},
    middleware as axum_middleware,
    response::IntoResponse,
    routing::{get, patch, post},
};
use tower_http::cors::CorsLayer;
use tower_http::trace::TraceLayer;

use atelier_db::Database;
use atelier_relay::Relay;
use atelier_relay::connection;
use atelier_types::api::HealthResponse;

pub type AppState = Arc<AppStateInner>;

pub struct AppStateInner {
    pub db: Arc<Database>,
    pub jwt_secret: String,
    pub relay: Relay,
}

impl AppStateInner {
    /// Wires the relay to the database for both storage and identity lookups.
    /// REST and chat handshakes verify tokens with the same secret.
    pub fn new(db: Arc<Database>, jwt_secret: String) -> AppState {
        let relay = Relay::new(db.clone(), db.clone(), jwt_secret.clone());
        Arc::new(Self {
            db,
            jwt_secret,
            relay,
        })
    }
}

pub fn router(state: AppState) -> Router {
    let public_routes = Router::new()
        .route("/health", get(health))
        .route("/auth/register", post(auth::register))
        .route("/auth/login", post(auth::login))
        .with_state(state.clone());

    let protected_routes = Router::new()
        .route("/messages", get(messages::list_messages))
        .route("/messages/{message_id}/read", patch(messages::mark_read))
        .layer(axum_middleware::from_fn_with_state(
            state.clone(),
            middleware::require_auth,
        ))
        .with_state(state.clone());

    let ws_route = Router::new()
        .route("/ws", get(ws_upgrade))
        .with_state(state);

    Router::new()
        .merge(public_routes)
        .merge(protected_routes)
        .merge(ws_route)
        .layer(CorsLayer::permissive())
        .layer(TraceLayer::new_for_http())
}

async fn health() -> Json<HealthResponse> {
    Json(HealthResponse {
        status: "healthy".to_string(),
        version: env!("CARGO_PKG_VERSION").to_string(),
    })
}

async fn ws_upgrade(State(state): State<AppState>, ws: WebSocketUpgrade) -> impl IntoResponse {
    let relay = state.relay.clone();
    ws.on_upgrade(move |socket| connection::handle_connection(socket, relay))
}
