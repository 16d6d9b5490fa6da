use axum::{
    Extension, Json,
    extract::{Path, State},
    http::StatusCode,
    response::IntoResponse,
};
use tracing::error;

use atelier_relay::MessageStore;
use atelier_types::api::{Claims, MarkReadRequest, MarkReadResponse};
use atelier_types::models::User;

use crate::AppState;

/// GET /messages — admins see every conversation, users only their own.
pub async fn list_messages(
    State(state): State<AppState>,
    Extension(claims): Extension<Claims>,
) -> Result<impl IntoResponse, StatusCode> {
    let user = current_user(&state, &claims).await?;
    let scope = if user.is_admin() { None } else { Some(user.id) };

    let db = state.db.clone();
    let messages = tokio::task::spawn_blocking(move || db.list_messages(scope))
        .await
        .map_err(|e| { error!("spawn_blocking join error: {}", e); StatusCode::INTERNAL_SERVER_ERROR })?
        .map_err(|e| { error!("list_messages failed: {:#}", e); StatusCode::INTERNAL_SERVER_ERROR })?;

    Ok(Json(messages))
}

/// PATCH /messages/{message_id}/read — admin-only read receipt toggle.
pub async fn mark_read(
    State(state): State<AppState>,
    Path(message_id): Path<i64>,
    Extension(claims): Extension<Claims>,
    Json(req): Json<MarkReadRequest>,
) -> Result<impl IntoResponse, StatusCode> {
    let user = current_user(&state, &claims).await?;
    if !user.is_admin() {
        return Err(StatusCode::FORBIDDEN);
    }

    let db = state.db.clone();
    let read = req.read;
    let found = tokio::task::spawn_blocking(move || db.mark_read(message_id, read))
        .await
        .map_err(|e| { error!("spawn_blocking join error: {}", e); StatusCode::INTERNAL_SERVER_ERROR })?
        .map_err(|e| { error!("mark_read failed: {:#}", e); StatusCode::INTERNAL_SERVER_ERROR })?;

    if !found {
        return Err(StatusCode::NOT_FOUND);
    }

    Ok(Json(MarkReadResponse { id: message_id, read }))
}

/// Resolve the token's subject to a live account. Deleted users get 401.
async fn current_user(state: &AppState, claims: &Claims) -> Result<User, StatusCode> {
    let db = state.db.clone();
    let user_id = claims.sub;
    let row = tokio::task::spawn_blocking(move || db.get_user_by_id(user_id))
        .await
        .map_err(|e| { error!("spawn_blocking join error: {}", e); StatusCode::INTERNAL_SERVER_ERROR })?
        .map_err(|_| StatusCode::INTERNAL_SERVER_ERROR)?
        .ok_or(StatusCode::UNAUTHORIZED)?;

    row.into_user().map_err(|e| {
        error!("corrupt user row {}: {:#}", user_id, e);
        StatusCode::INTERNAL_SERVER_ERROR
    })
}
