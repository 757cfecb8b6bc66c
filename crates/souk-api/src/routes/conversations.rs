use axum::{
    extract::{Path, State},
    http::StatusCode,
    Json,
};
use serde::Deserialize;
use souk_core::{conversation, AppState};
use souk_models::conversation::{Conversation, ReadState};

use crate::error::ApiError;
use crate::middleware::AuthUser;

#[derive(Debug, Deserialize)]
pub struct StartConversationRequest {
    #[serde(with = "souk_models::ids")]
    pub listing_id: i64,
    /// Lets a seller open a conversation with a specific buyer.
    #[serde(default, with = "souk_models::ids::option")]
    pub peer_id: Option<i64>,
}

#[derive(Debug, Deserialize)]
pub struct MarkReadRequest {
    #[serde(with = "souk_models::ids")]
    pub last_message_id: i64,
}

pub async fn start_conversation(
    State(state): State<AppState>,
    auth: AuthUser,
    Json(body): Json<StartConversationRequest>,
) -> Result<(StatusCode, Json<Conversation>), ApiError> {
    let outcome = conversation::start_or_get_conversation(
        &state.db,
        &state.listings,
        body.listing_id,
        auth.user_id,
        body.peer_id,
    )
    .await?;
    let status = if outcome.created {
        StatusCode::CREATED
    } else {
        StatusCode::OK
    };
    Ok((status, Json(outcome.conversation)))
}

pub async fn list_conversations(
    State(state): State<AppState>,
    auth: AuthUser,
) -> Result<Json<Vec<Conversation>>, ApiError> {
    let conversations =
        conversation::list_conversations(&state.db, &state.listings, auth.user_id).await?;
    Ok(Json(conversations))
}

pub async fn get_conversation(
    State(state): State<AppState>,
    auth: AuthUser,
    Path(conversation_id): Path<i64>,
) -> Result<Json<Conversation>, ApiError> {
    let view = conversation::get_conversation(
        &state.db,
        &state.listings,
        conversation_id,
        auth.user_id,
    )
    .await?;
    Ok(Json(view))
}

pub async fn mark_read(
    State(state): State<AppState>,
    auth: AuthUser,
    Path(conversation_id): Path<i64>,
    Json(body): Json<MarkReadRequest>,
) -> Result<Json<ReadState>, ApiError> {
    let read =
        conversation::mark_read(&state.db, conversation_id, auth.user_id, body.last_message_id)
            .await?;
    Ok(Json(read))
}
