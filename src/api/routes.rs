//! Request handlers for the client-facing surface.
//!
//! Thin by design: validation and shape-shifting happen here, everything
//! else lives in the pipeline modules. The streaming handler ranks
//! candidates through the classifier and hands off to the fallback
//! orchestrator; the chat handlers are the minimal slice of the persistence
//! surface the ownership guard protects.

use std::sync::Arc;

use axum::{
    extract::{rejection::JsonRejection, Path, State},
    response::Response,
    Extension, Json,
};
use chrono::Utc;
use serde::Deserialize;

use crate::{
    error::ApiError,
    gateway::{stream_completion, GatewayState, StreamContext},
    identity::Principal,
    limiter::Classification,
    providers::{Conversation, HistoryEntry, Role},
    repository::ChatRecord,
};

use super::request_id::RequestId;

/// Upper bound on the trimmed prompt length.
const MAX_PROMPT_CHARS: usize = 32 * 1024;

#[derive(Debug, Deserialize)]
pub struct CompleteRequest {
    prompt: String,
    #[serde(default)]
    previous_messages: Vec<PreviousMessage>,
    #[serde(default)]
    profile_context: Option<String>,
}

/// One prior conversation turn. Clients may also send a `model_name` per
/// assistant message; it is irrelevant to provider requests and ignored.
#[derive(Debug, Deserialize)]
pub struct PreviousMessage {
    role: Role,
    content: String,
}

/// `POST /v1/complete` — the streaming completion endpoint.
pub async fn complete(
    State(state): State<Arc<GatewayState>>,
    Extension(RequestId(request_id)): Extension<RequestId>,
    Extension(principal): Extension<Principal>,
    Extension(classification): Extension<Classification>,
    body: Result<Json<CompleteRequest>, JsonRejection>,
) -> Result<Response, ApiError> {
    let Json(request) = body.map_err(|_| ApiError::BadRequest("invalid request body".into()))?;

    let prompt = request.prompt.trim().to_owned();
    if prompt.is_empty() {
        return Err(ApiError::BadRequest("prompt must not be empty".into()));
    }
    if prompt.chars().count() > MAX_PROMPT_CHARS {
        return Err(ApiError::BadRequest("prompt too long".into()));
    }

    let ranked = state
        .classifier
        .rank(&prompt, classification)
        .await
        .map_err(|err| {
            tracing::warn!(request_id, principal = %principal.uid, error = %err, "model ranking failed");
            ApiError::ModelsUnavailable
        })?;

    let mut candidates = ranked.candidates();
    if candidates.is_empty() {
        tracing::warn!(request_id, "classifier metadata absent, using the fallback model");
        candidates.push(state.fallback_candidate());
    }

    let history = request
        .previous_messages
        .into_iter()
        .map(|message| HistoryEntry {
            role: message.role,
            content: message.content,
        })
        .collect();

    let conversation = Conversation::new(
        state.config.gateway.system_prompt.clone(),
        request.profile_context,
        history,
        prompt,
        classification == Classification::Pro,
        state.config.gateway.history_limit,
    );

    let ctx = StreamContext {
        request_id,
        principal: principal.bucket_key(),
        classification,
    };
    Ok(stream_completion(state, ctx, candidates, conversation))
}

/// `GET /v1/chats/by-user-id/{uid}` — the caller's chats, newest first.
pub async fn chats_by_user(
    State(state): State<Arc<GatewayState>>,
    Path(uid): Path<String>,
) -> Result<Json<Vec<ChatRecord>>, ApiError> {
    Ok(Json(state.chats.chats_by_owner(&uid).await?))
}

/// `GET /v1/chats/by-chat-id/{chat_id}` — one chat, ownership pre-checked.
pub async fn chat_by_id(
    State(state): State<Arc<GatewayState>>,
    Path(chat_id): Path<String>,
) -> Result<Json<ChatRecord>, ApiError> {
    state
        .chats
        .chat_by_id(&chat_id)
        .await?
        .map(Json)
        .ok_or(ApiError::NotFound)
}

#[derive(Debug, Deserialize)]
pub struct UpsertChatRequest {
    title: String,
    /// Accepted for wire compatibility; the stored owner is always the
    /// authenticated principal.
    #[serde(default)]
    owner_uid: Option<String>,
}

/// `PUT /v1/chats/by-chat-id/{chat_id}` — create or update a chat.
pub async fn upsert_chat(
    State(state): State<Arc<GatewayState>>,
    Extension(principal): Extension<Principal>,
    Path(chat_id): Path<String>,
    body: Result<Json<UpsertChatRequest>, JsonRejection>,
) -> Result<Json<ChatRecord>, ApiError> {
    let Json(request) = body.map_err(|_| ApiError::BadRequest("invalid request body".into()))?;
    if request.title.trim().is_empty() {
        return Err(ApiError::BadRequest("title must not be empty".into()));
    }
    if request
        .owner_uid
        .as_deref()
        .is_some_and(|uid| uid != principal.uid)
    {
        tracing::debug!(chat_id, "ignoring client-supplied owner_uid");
    }

    let chat = ChatRecord {
        chat_id,
        owner_uid: principal.uid.clone(),
        title: request.title,
        updated_at: Utc::now(),
    };
    Ok(Json(state.chats.upsert_chat(chat).await?))
}
