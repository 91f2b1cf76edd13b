//! HTTP surface composition.
//!
//! Handlers are only ever reachable through the middleware chain, outermost
//! first: CORS → request ID → [authentication](auth) → ([ownership
//! guard](guard) on user-scoped paths | [rate limiting](rate_limit) on the
//! completion path) → handler. `/health` and `/metrics` sit outside the
//! authenticated surface.

pub mod auth;
pub mod guard;
pub mod health;
pub mod metrics;
pub mod rate_limit;
pub mod request_id;
pub mod routes;

use std::sync::Arc;

use axum::{
    extract::DefaultBodyLimit,
    http::Method,
    middleware,
    routing::get,
    routing::post,
    Router,
};
use tower_http::cors::{Any, CorsLayer};

use crate::gateway::GatewayState;

/// Request body hard limit.
const MAX_BODY_BYTES: usize = 1024 * 1024;

/// Build the gateway router with the full middleware chain attached.
pub fn router(state: Arc<GatewayState>) -> Router {
    let completion = Router::new()
        .route("/v1/complete", post(routes::complete))
        .layer(middleware::from_fn_with_state(
            Arc::clone(&state),
            rate_limit::rate_limit_middleware,
        ));

    let chats = Router::new()
        .route("/v1/chats/by-user-id/{uid}", get(routes::chats_by_user))
        .route(
            "/v1/chats/by-chat-id/{chat_id}",
            get(routes::chat_by_id).put(routes::upsert_chat),
        )
        .layer(middleware::from_fn_with_state(
            Arc::clone(&state),
            guard::guard_middleware,
        ));

    let protected = Router::new()
        .merge(completion)
        .merge(chats)
        .route("/v1/rate-limit-status", get(rate_limit::rate_limit_status))
        .layer(middleware::from_fn_with_state(
            Arc::clone(&state),
            auth::auth_middleware,
        ));

    Router::new()
        .route("/health", get(health::health))
        .route("/metrics", get(metrics::metrics))
        .merge(protected)
        .layer(DefaultBodyLimit::max(MAX_BODY_BYTES))
        .layer(middleware::from_fn(request_id::request_id_middleware))
        .layer(cors_layer())
        .with_state(state)
}

fn cors_layer() -> CorsLayer {
    CorsLayer::new()
        .allow_origin(Any)
        .allow_methods([
            Method::GET,
            Method::POST,
            Method::PUT,
            Method::DELETE,
            Method::OPTIONS,
        ])
        .allow_headers(Any)
}

#[cfg(test)]
mod tests {
    use std::sync::Arc;

    use axum::{
        body::{to_bytes, Body},
        http::{Request, StatusCode},
    };
    use jsonwebtoken::{encode, EncodingKey, Header};
    use serde_json::json;
    use tower::ServiceExt;
    use wiremock::matchers::{method, path};
    use wiremock::{Mock, MockServer, ResponseTemplate};

    use crate::{
        config::Config, gateway::GatewayState, limiter::LimitTier,
        repository::MemoryChatRepository,
    };

    const SECRET: &str = "router-integration-secret";

    fn build_state(classifier_url: &str, groq_url: &str) -> Arc<GatewayState> {
        let mut config: Config = toml::from_str(&format!(
            r#"
            [classifier]
            url = "{classifier_url}"
            timeout_secs = 5

            [breaker]
            failure_threshold = 2
            recovery_timeout_secs = 300

            [limits.authenticated]
            requests_per_day = 50
            requests_per_minute = 3
            suspicious_threshold = 40
            suspicious_window_secs = 300
            block_duration_secs = 3600
            tracking_window_secs = 600
            cleanup_interval_secs = 3600
            cleanup_ttl_secs = 86400
            hard_daily_cap = false

            [providers.groq]
            base_url = "{groq_url}"
            model = "model-c-8b"
            "#
        ))
        .unwrap();
        config.identity.credentials_json = Some(json!({ "secret": SECRET }).to_string());
        Arc::new(GatewayState::new(
            Arc::new(config),
            Arc::new(MemoryChatRepository::new()),
        ))
    }

    fn bearer(uid: &str) -> String {
        let token = encode(
            &Header::default(),
            &json!({
                "sub": uid,
                "email": format!("{uid}@example.com"),
                "exp": chrono::Utc::now().timestamp() + 3_600,
            }),
            &EncodingKey::from_secret(SECRET.as_bytes()),
        )
        .unwrap();
        format!("Bearer {token}")
    }

    fn ranked_body() -> serde_json::Value {
        json!({
            "primary_model": "model-c",
            "secondary_model": "",
            "default_model": "model-c",
            "metadata": { "model_scores": {
                "model-c": {
                    "provider": "groq",
                    "display_name": "Model C*",
                    "provider_model_name": "model-c-8b",
                    "is_thinking_model": false,
                },
            }},
        })
    }

    fn groq_sse() -> String {
        let chunks = ["he", "ll", "o"].map(|t| {
            format!(
                "data: {}\n\n",
                json!({ "choices": [{ "delta": { "content": t } }] })
            )
        });
        format!("{}data: [DONE]\n\n", chunks.concat())
    }

    async fn mount_happy_upstreams(classifier: &MockServer, groq: &MockServer) {
        Mock::given(method("POST"))
            .and(path("/classify"))
            .respond_with(ResponseTemplate::new(200).set_body_json(ranked_body()))
            .mount(classifier)
            .await;
        Mock::given(method("POST"))
            .and(path("/chat/completions"))
            .respond_with(
                ResponseTemplate::new(200).set_body_raw(groq_sse(), "text/event-stream"),
            )
            .mount(groq)
            .await;
    }

    fn complete_request(auth: &str) -> Request<Body> {
        Request::post("/v1/complete")
            .header("authorization", auth)
            .header("content-type", "application/json")
            .body(Body::from(r#"{ "prompt": "hi" }"#))
            .unwrap()
    }

    // -----------------------------------------------------------------------
    // End-to-end streaming
    // -----------------------------------------------------------------------

    #[tokio::test]
    async fn complete_streams_ranked_model_output_as_sse() {
        let classifier = MockServer::start().await;
        let groq = MockServer::start().await;
        mount_happy_upstreams(&classifier, &groq).await;

        let state = build_state(
            &format!("{}/classify", classifier.uri()),
            &groq.uri(),
        );
        let app = super::router(Arc::clone(&state));

        let resp = app.oneshot(complete_request(&bearer("u1"))).await.unwrap();
        assert_eq!(resp.status(), StatusCode::OK);
        assert_eq!(resp.headers()["content-type"], "text/event-stream");
        assert_eq!(resp.headers()["x-request-type"], "pro");
        assert_eq!(resp.headers()["x-accel-buffering"], "no");
        assert!(resp.headers().contains_key("x-request-id"));

        let body = to_bytes(resp.into_body(), 64 * 1024).await.unwrap();
        let text = String::from_utf8(body.to_vec()).unwrap();
        let events: Vec<serde_json::Value> = text
            .split("\n\n")
            .filter(|f| !f.is_empty())
            .map(|f| serde_json::from_str(f.strip_prefix("data: ").unwrap()).unwrap())
            .collect();

        let types: Vec<&str> = events.iter().map(|e| e["type"].as_str().unwrap()).collect();
        assert_eq!(types, ["start", "chunk", "chunk", "chunk", "end"]);
        assert_eq!(events[0]["model"], "Model C*");
        assert_eq!(events[1]["message"], "he");
        assert_eq!(events[3]["message"], "o");

        // The bucket recorded exactly one admitted request.
        let snapshot = state
            .limiter
            .peek("user:u1", LimitTier::Authenticated, chrono::Utc::now());
        assert_eq!(snapshot.used_day, 1);
    }

    #[tokio::test]
    async fn completion_requires_authentication() {
        let state = build_state("http://127.0.0.1:1/classify", "http://127.0.0.1:1");
        let app = super::router(state);

        let resp = app
            .oneshot(
                Request::post("/v1/complete")
                    .header("content-type", "application/json")
                    .body(Body::from(r#"{ "prompt": "hi" }"#))
                    .unwrap(),
            )
            .await
            .unwrap();
        assert_eq!(resp.status(), StatusCode::UNAUTHORIZED);
    }

    #[tokio::test]
    async fn minute_cap_answers_429_through_the_full_chain() {
        let classifier = MockServer::start().await;
        let groq = MockServer::start().await;
        mount_happy_upstreams(&classifier, &groq).await;

        let state = build_state(
            &format!("{}/classify", classifier.uri()),
            &groq.uri(),
        );
        let app = super::router(state);

        for _ in 0..3 {
            let resp = app
                .clone()
                .oneshot(complete_request(&bearer("u2")))
                .await
                .unwrap();
            assert_eq!(resp.status(), StatusCode::OK);
        }

        let resp = app.oneshot(complete_request(&bearer("u2"))).await.unwrap();
        assert_eq!(resp.status(), StatusCode::TOO_MANY_REQUESTS);
        let body: serde_json::Value =
            serde_json::from_slice(&to_bytes(resp.into_body(), 4096).await.unwrap()).unwrap();
        assert_eq!(body["code"], "RATE_LIMIT_EXCEEDED");
        assert_eq!(body["reason"], "minute_limit");
    }

    #[tokio::test]
    async fn open_breaker_fails_fast_without_reaching_providers() {
        let classifier = MockServer::start().await;
        let groq = MockServer::start().await;
        // failure_threshold = 2: only two calls may reach the classifier.
        Mock::given(method("POST"))
            .and(path("/classify"))
            .respond_with(ResponseTemplate::new(500))
            .expect(2)
            .mount(&classifier)
            .await;
        Mock::given(method("POST"))
            .respond_with(ResponseTemplate::new(200))
            .expect(0)
            .mount(&groq)
            .await;

        let state = build_state(
            &format!("{}/classify", classifier.uri()),
            &groq.uri(),
        );
        let app = super::router(state);

        for _ in 0..3 {
            let resp = app
                .clone()
                .oneshot(complete_request(&bearer("u3")))
                .await
                .unwrap();
            assert_eq!(resp.status(), StatusCode::INTERNAL_SERVER_ERROR);
            let body: serde_json::Value =
                serde_json::from_slice(&to_bytes(resp.into_body(), 4096).await.unwrap())
                    .unwrap();
            assert_eq!(
                body["error"],
                crate::error::MODELS_UNAVAILABLE
            );
        }
        classifier.verify().await;
        groq.verify().await;
    }

    // -----------------------------------------------------------------------
    // Unauthenticated surface
    // -----------------------------------------------------------------------

    #[tokio::test]
    async fn health_needs_no_credentials() {
        let state = build_state("http://127.0.0.1:1/classify", "http://127.0.0.1:1");
        let resp = super::router(state)
            .oneshot(Request::get("/health").body(Body::empty()).unwrap())
            .await
            .unwrap();
        assert_eq!(resp.status(), StatusCode::OK);
    }

    #[tokio::test]
    async fn preflight_options_terminates_with_success() {
        let state = build_state("http://127.0.0.1:1/classify", "http://127.0.0.1:1");
        let resp = super::router(state)
            .oneshot(
                Request::builder()
                    .method("OPTIONS")
                    .uri("/v1/complete")
                    .header("origin", "https://app.example.com")
                    .header("access-control-request-method", "POST")
                    .body(Body::empty())
                    .unwrap(),
            )
            .await
            .unwrap();
        assert_eq!(resp.status(), StatusCode::OK);
        let allowed = resp.headers()["access-control-allow-methods"]
            .to_str()
            .unwrap()
            .to_owned();
        assert!(allowed.contains("POST") && allowed.contains("DELETE"));
    }

    #[tokio::test]
    async fn rate_limit_status_is_authenticated_but_not_counted() {
        let state = build_state("http://127.0.0.1:1/classify", "http://127.0.0.1:1");
        let app = super::router(Arc::clone(&state));

        let unauthenticated = app
            .clone()
            .oneshot(
                Request::get("/v1/rate-limit-status")
                    .body(Body::empty())
                    .unwrap(),
            )
            .await
            .unwrap();
        assert_eq!(unauthenticated.status(), StatusCode::UNAUTHORIZED);

        let resp = app
            .oneshot(
                Request::get("/v1/rate-limit-status")
                    .header("authorization", bearer("u9"))
                    .body(Body::empty())
                    .unwrap(),
            )
            .await
            .unwrap();
        assert_eq!(resp.status(), StatusCode::OK);
        let body: serde_json::Value =
            serde_json::from_slice(&to_bytes(resp.into_body(), 8192).await.unwrap()).unwrap();
        assert_eq!(body["daily"]["used"], 0);
    }
}
