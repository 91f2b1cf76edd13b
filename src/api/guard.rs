//! Resource-ownership guard for user-scoped paths.
//!
//! Paths embedding a user id (`…/by-user-id/{uid}`) must match the
//! authenticated principal. Paths embedding a chat id
//! (`…/by-chat-id/{cid}`) are checked against the chat's stored owner; a
//! mismatch answers 404 rather than 403 so callers cannot probe which chat
//! ids exist. A chat id that does not resolve passes through; the handler
//! decides between "create" and "not found".

use std::sync::Arc;

use axum::{
    extract::{Request, State},
    middleware::Next,
    response::{IntoResponse, Response},
};

use crate::{error::ApiError, gateway::GatewayState, identity::Principal};

/// Axum middleware enforcing "actor owns resource" on user-scoped routes.
pub async fn guard_middleware(
    State(state): State<Arc<GatewayState>>,
    req: Request,
    next: Next,
) -> Response {
    let Some(principal) = req.extensions().get::<Principal>().cloned() else {
        // The auth middleware always runs first; a missing principal is a
        // routing misconfiguration, not a client error.
        return ApiError::Internal(anyhow::anyhow!("guard invoked without principal"))
            .into_response();
    };

    let path = req.uri().path();

    if let Some(uid) = segment_after(path, "/by-user-id/") {
        if uid != principal.uid {
            tracing::warn!(
                principal = %principal.uid,
                requested = %uid,
                "cross-user access denied"
            );
            return ApiError::Forbidden.into_response();
        }
    }

    if let Some(chat_id) = segment_after(path, "/by-chat-id/") {
        match state.chats.chat_by_id(chat_id).await {
            Ok(Some(chat)) if chat.owner_uid != principal.uid => {
                tracing::warn!(
                    principal = %principal.uid,
                    chat_id,
                    "chat ownership mismatch"
                );
                return ApiError::NotFound.into_response();
            }
            Ok(_) => {}
            Err(err) => return ApiError::Internal(err).into_response(),
        }
    }

    next.run(req).await
}

/// The single path segment following `marker`, if present.
fn segment_after<'a>(path: &'a str, marker: &str) -> Option<&'a str> {
    let rest = path.split_once(marker)?.1;
    let segment = rest.split('/').next().unwrap_or(rest);
    (!segment.is_empty()).then_some(segment)
}

#[cfg(test)]
mod tests {
    use std::sync::Arc;

    use axum::{
        body::Body,
        http::{Request, StatusCode},
        middleware,
        routing::get,
        Router,
    };
    use chrono::Utc;
    use tower::ServiceExt;

    use crate::{
        config::Config,
        gateway::GatewayState,
        identity::Principal,
        repository::{ChatRecord, ChatRepository, MemoryChatRepository},
    };

    use super::segment_after;

    fn principal(uid: &str) -> Principal {
        Principal {
            uid: uid.into(),
            anonymous: false,
            email: Some(format!("{uid}@example.com")),
        }
    }

    async fn state_with_chat(chat_id: &str, owner: &str) -> Arc<GatewayState> {
        let config: Config = toml::from_str(
            r#"
            [classifier]
            url = "http://127.0.0.1:1/classify"
            "#,
        )
        .unwrap();
        let repo = MemoryChatRepository::new();
        repo.upsert_chat(ChatRecord {
            chat_id: chat_id.into(),
            owner_uid: owner.into(),
            title: "t".into(),
            updated_at: Utc::now(),
        })
        .await
        .unwrap();
        Arc::new(GatewayState::new(Arc::new(config), Arc::new(repo)))
    }

    /// Router with the principal pre-injected, mimicking the auth layer.
    fn app(state: Arc<GatewayState>, as_user: &str) -> Router {
        let who = principal(as_user);
        Router::new()
            .route("/v1/chats/by-user-id/{uid}", get(|| async { "ok" }))
            .route("/v1/chats/by-chat-id/{cid}", get(|| async { "ok" }))
            .layer(middleware::from_fn_with_state(
                state.clone(),
                super::guard_middleware,
            ))
            .layer(middleware::from_fn(move |mut req: Request<Body>, next: axum::middleware::Next| {
                let who = who.clone();
                async move {
                    req.extensions_mut().insert(who);
                    next.run(req).await
                }
            }))
            .with_state(state)
    }

    #[tokio::test]
    async fn own_user_id_path_passes() {
        let state = state_with_chat("c1", "u1").await;
        let resp = app(state, "u1")
            .oneshot(
                Request::get("/v1/chats/by-user-id/u1")
                    .body(Body::empty())
                    .unwrap(),
            )
            .await
            .unwrap();
        assert_eq!(resp.status(), StatusCode::OK);
    }

    #[tokio::test]
    async fn foreign_user_id_path_is_masked_as_404() {
        let state = state_with_chat("c1", "u1").await;
        let resp = app(state, "u2")
            .oneshot(
                Request::get("/v1/chats/by-user-id/u1")
                    .body(Body::empty())
                    .unwrap(),
            )
            .await
            .unwrap();
        assert_eq!(resp.status(), StatusCode::NOT_FOUND);
    }

    #[tokio::test]
    async fn owned_chat_passes() {
        let state = state_with_chat("c1", "u1").await;
        let resp = app(state, "u1")
            .oneshot(
                Request::get("/v1/chats/by-chat-id/c1")
                    .body(Body::empty())
                    .unwrap(),
            )
            .await
            .unwrap();
        assert_eq!(resp.status(), StatusCode::OK);
    }

    #[tokio::test]
    async fn foreign_chat_answers_404_not_403() {
        let state = state_with_chat("c1", "u1").await;
        let resp = app(state, "u2")
            .oneshot(
                Request::get("/v1/chats/by-chat-id/c1")
                    .body(Body::empty())
                    .unwrap(),
            )
            .await
            .unwrap();
        assert_eq!(resp.status(), StatusCode::NOT_FOUND);
    }

    #[tokio::test]
    async fn unknown_chat_passes_through_to_the_handler() {
        let state = state_with_chat("c1", "u1").await;
        let resp = app(state, "u1")
            .oneshot(
                Request::get("/v1/chats/by-chat-id/brand-new")
                    .body(Body::empty())
                    .unwrap(),
            )
            .await
            .unwrap();
        assert_eq!(resp.status(), StatusCode::OK);
    }

    #[test]
    fn segment_extraction() {
        assert_eq!(segment_after("/v1/chats/by-user-id/u1", "/by-user-id/"), Some("u1"));
        assert_eq!(
            segment_after("/v1/chats/by-chat-id/c9/messages", "/by-chat-id/"),
            Some("c9")
        );
        assert_eq!(segment_after("/v1/chats/by-user-id/", "/by-user-id/"), None);
        assert_eq!(segment_after("/v1/complete", "/by-user-id/"), None);
    }
}
