use axum::{
    extract::{Path, Query, State},
    http::StatusCode,
    Json,
};
use serde::Deserialize;
use souk_core::{conversation, dispatch, message, AppState};
use souk_models::message::Message;
use souk_util::pagination::AfterParams;

use crate::error::ApiError;
use crate::middleware::AuthUser;

#[derive(Debug, Deserialize)]
pub struct SendMessageRequest {
    pub content: String,
    /// Client-generated; a retry with the same nonce returns the original
    /// message instead of posting twice.
    #[serde(default)]
    pub nonce: Option<String>,
}

pub async fn list_messages(
    State(state): State<AppState>,
    auth: AuthUser,
    Path(conversation_id): Path<i64>,
    Query(params): Query<AfterParams>,
) -> Result<Json<Vec<Message>>, ApiError> {
    conversation::ensure_participant(&state.db, conversation_id, auth.user_id).await?;
    let messages =
        message::list_since(&state.db, conversation_id, params.after, params.limit()).await?;
    Ok(Json(messages))
}

pub async fn send_message(
    State(state): State<AppState>,
    auth: AuthUser,
    Path(conversation_id): Path<i64>,
    Json(body): Json<SendMessageRequest>,
) -> Result<(StatusCode, Json<Message>), ApiError> {
    let nonce = body.nonce.as_deref().filter(|n| !n.is_empty());
    let message =
        dispatch::send_message(&state, conversation_id, auth.user_id, &body.content, nonce)
            .await?;
    Ok((StatusCode::CREATED, Json(message)))
}
