use argon2::{
    Argon2, PasswordHash, PasswordHasher, PasswordVerifier,
    password_hash::{SaltString, rand_core::OsRng},
};
use axum::{Json, extract::State, http::StatusCode, response::IntoResponse};
use tracing::{error, info, warn};

use atelier_db::Database;
use atelier_relay::token;
use atelier_types::api::{LoginRequest, LoginResponse, RegisterRequest, RegisterResponse};
use atelier_types::models::UserRole;

use crate::AppState;

pub async fn register(
    State(state): State<AppState>,
    Json(req): Json<RegisterRequest>,
) -> Result<impl IntoResponse, StatusCode> {
    // Validate input
    if req.username.len() < 3 || req.username.len() > 32 {
        return Err(StatusCode::BAD_REQUEST);
    }
    if req.password.len() < 8 {
        return Err(StatusCode::BAD_REQUEST);
    }

    let db = state.db.clone();
    let username = req.username.clone();
    let password = req.password;
    let user_id = tokio::task::spawn_blocking(move || -> anyhow::Result<Option<i64>> {
        if db.get_user_by_username(&username)?.is_some() {
            return Ok(None);
        }
        let password_hash = hash_password(&password)?;
        db.create_user(&username, &password_hash, UserRole::User.as_str())
            .map(Some)
    })
    .await
    .map_err(|e| { error!("spawn_blocking join error: {}", e); StatusCode::INTERNAL_SERVER_ERROR })?
    .map_err(|e| { error!("register failed: {:#}", e); StatusCode::INTERNAL_SERVER_ERROR })?
    .ok_or(StatusCode::CONFLICT)?;

    let token = token::issue(&state.jwt_secret, user_id, &req.username)
        .map_err(|_| StatusCode::INTERNAL_SERVER_ERROR)?;

    info!("registered user {} ({})", req.username, user_id);

    Ok((
        StatusCode::CREATED,
        Json(RegisterResponse { user_id, token }),
    ))
}

pub async fn login(
    State(state): State<AppState>,
    Json(req): Json<LoginRequest>,
) -> Result<impl IntoResponse, StatusCode> {
    let db = state.db.clone();
    let username = req.username.clone();
    let user = tokio::task::spawn_blocking(move || db.get_user_by_username(&username))
        .await
        .map_err(|e| { error!("spawn_blocking join error: {}", e); StatusCode::INTERNAL_SERVER_ERROR })?
        .map_err(|_| StatusCode::INTERNAL_SERVER_ERROR)?
        .ok_or(StatusCode::UNAUTHORIZED)?;

    // Verify password
    let parsed_hash =
        PasswordHash::new(&user.password).map_err(|_| StatusCode::INTERNAL_SERVER_ERROR)?;

    Argon2::default()
        .verify_password(req.password.as_bytes(), &parsed_hash)
        .map_err(|_| StatusCode::UNAUTHORIZED)?;

    let user = user.into_user().map_err(|e| {
        error!("corrupt user row: {:#}", e);
        StatusCode::INTERNAL_SERVER_ERROR
    })?;

    let token = token::issue(&state.jwt_secret, user.id, &user.username)
        .map_err(|_| StatusCode::INTERNAL_SERVER_ERROR)?;

    Ok(Json(LoginResponse {
        user_id: user.id,
        username: user.username,
        role: user.role,
        token,
    }))
}

/// Make sure an admin account with these credentials exists. An existing
/// account is left untouched.
pub fn ensure_admin(db: &Database, username: &str, password: &str) -> anyhow::Result<i64> {
    if let Some(existing) = db.get_user_by_username(username)? {
        if existing.role != UserRole::Admin.as_str() {
            warn!("bootstrap admin '{}' exists with role '{}'", username, existing.role);
        }
        return Ok(existing.id);
    }

    let password_hash = hash_password(password)?;
    let id = db.create_user(username, &password_hash, UserRole::Admin.as_str())?;
    info!("created bootstrap admin '{}' ({})", username, id);
    Ok(id)
}

fn hash_password(password: &str) -> anyhow::Result<String> {
    // Hash password with Argon2id
    let salt = SaltString::generate(&mut OsRng);
    let hash = Argon2::default()
        .hash_password(password.as_bytes(), &salt)
        .map_err(|e| anyhow::anyhow!("password hashing failed: {}", e))?;
    Ok(hash.to_string())
}
