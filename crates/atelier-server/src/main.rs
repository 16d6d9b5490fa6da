mod config;

use std::sync::Arc;

use tracing::info;

use atelier_api::{AppStateInner, auth, router};
use atelier_db::Database;

use crate::config::Config;

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    // Load .env if present
    let _ = dotenvy::dotenv();

    // Init logging
    tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| "atelier=debug,tower_http=debug".into()),
        )
        .init();

    let config = Config::from_env()?;

    // Init database
    let db = Arc::new(Database::open(&config.db_path)?);

    if let Some((username, password)) = &config.bootstrap_admin {
        auth::ensure_admin(&db, username, password)?;
    }

    // Shared state: one relay per process, owned by the app state
    let state = AppStateInner::new(db, config.jwt_secret.clone());
    let app = router(state);

    let addr = config.server_address()?;
    info!("Atelier server listening on {}", addr);
    info!("Chat relay at ws://{}/ws", addr);

    let listener = tokio::net::TcpListener::bind(addr).await?;
    axum::serve(listener, app).await?;

    Ok(())
}
