//! Bearer-token authentication middleware.
//!
//! Every protected request must carry `Authorization: Bearer <token>` minted
//! by the identity provider. On success the verified [`Principal`] is
//! attached as a request extension for the guard, the rate limiter, and the
//! handlers. Failures terminate the chain with a 401; a broken verifier
//! configuration terminates with a 500.

use std::sync::Arc;

use axum::{
    extract::{Request, State},
    http::header,
    middleware::Next,
    response::{IntoResponse, Response},
};

use crate::{error::ApiError, gateway::GatewayState, identity::IdentityError};

/// Axum middleware enforcing bearer-token authentication.
pub async fn auth_middleware(
    State(state): State<Arc<GatewayState>>,
    mut req: Request,
    next: Next,
) -> Response {
    let header_value = match req.headers().get(header::AUTHORIZATION) {
        Some(value) => value,
        None => {
            return ApiError::Unauthenticated("Authorization header required".into())
                .into_response();
        }
    };

    let token = header_value
        .to_str()
        .ok()
        .and_then(|v| v.strip_prefix("Bearer "))
        .map(str::trim)
        .filter(|t| !t.is_empty());
    let Some(token) = token else {
        return ApiError::Unauthenticated("malformed Authorization header".into()).into_response();
    };

    let verifier = match state.verifier().await {
        Ok(verifier) => verifier,
        Err(err) => {
            tracing::error!(error = %err, "identity verifier initialization failed");
            return ApiError::Internal(err).into_response();
        }
    };

    match verifier.verify(token) {
        Ok(principal) => {
            tracing::debug!(
                uid = %principal.uid,
                email = principal.email.as_deref(),
                anonymous = principal.anonymous,
                "request authenticated"
            );
            req.extensions_mut().insert(principal);
            next.run(req).await
        }
        Err(IdentityError::InvalidToken) => {
            ApiError::Unauthenticated("invalid or expired token".into()).into_response()
        }
        Err(IdentityError::UnknownUser) => {
            ApiError::Unauthenticated("user not found".into()).into_response()
        }
    }
}
