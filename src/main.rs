use std::{net::SocketAddr, path::PathBuf, sync::Arc};

use anyhow::Context;
use tokio::signal;
use tracing::{debug, info, warn};

mod api;
mod breaker;
mod classifier;
mod config;
mod error;
mod gateway;
mod identity;
mod limiter;
mod providers;
mod repository;
mod sse;
mod traffic;

pub use config::Config;
pub use error::ApiError;
pub use gateway::GatewayState;

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    // When invoked as a container HEALTHCHECK, hit /health and exit
    // immediately. This avoids needing curl/wget in the image.
    if std::env::args().nth(1).as_deref() == Some("--healthcheck") {
        return healthcheck().await;
    }

    let config_path = std::env::var("GATEWAY_CONFIG").map(PathBuf::from).ok();
    let config = Config::load(config_path.as_deref()).with_context(|| {
        format!(
            "failed to load config{}",
            config_path
                .as_ref()
                .map(|p| format!(" from {}", p.display()))
                .unwrap_or_default()
        )
    })?;

    init_tracing(&config.gateway);

    if config.gateway.redis_url.is_some() {
        warn!("REDIS_URL is set but limiter state is in-process on this build; counters are not shared across nodes");
    }

    info!(port = config.gateway.port, "streamgate starting");

    let config = Arc::new(config);
    let state = Arc::new(GatewayState::new(
        Arc::clone(&config),
        Arc::new(repository::MemoryChatRepository::new()),
    ));

    // Periodically drop rate-limit buckets nobody has touched in a day.
    tokio::spawn(bucket_reaper(Arc::clone(&state)));

    let addr: SocketAddr = format!("0.0.0.0:{}", config.gateway.port).parse()?;
    let listener = tokio::net::TcpListener::bind(addr).await?;
    info!(%addr, "listening");

    let trace_layer = tower_http::trace::TraceLayer::new_for_http()
        .make_span_with(tower_http::trace::DefaultMakeSpan::new().level(tracing::Level::INFO))
        .on_response(tower_http::trace::DefaultOnResponse::new().level(tracing::Level::INFO));

    let app = api::router(Arc::clone(&state)).layer(trace_layer);

    tokio::select! {
        result = axum::serve(listener, app) => {
            result.context("server error")?;
        }
        _ = shutdown_signal() => {
            info!("shutdown signal received");
        }
    }

    Ok(())
}

fn init_tracing(cfg: &config::GatewayConfig) {
    let default_filter = cfg
        .log_level
        .clone()
        .unwrap_or_else(|| "streamgate=info,tower_http=warn".to_owned());
    let filter = tracing_subscriber::EnvFilter::try_from_default_env()
        .unwrap_or_else(|_| default_filter.into());

    let builder = tracing_subscriber::fmt().with_env_filter(filter);
    match cfg.log_format {
        config::LogFormat::Json => builder.json().init(),
        config::LogFormat::Text => builder.init(),
    }
}

async fn shutdown_signal() {
    let ctrl_c = async {
        signal::ctrl_c().await.expect("failed to install Ctrl+C handler");
    };

    #[cfg(unix)]
    let terminate = async {
        signal::unix::signal(signal::unix::SignalKind::terminate())
            .expect("failed to install SIGTERM handler")
            .recv()
            .await;
    };

    #[cfg(not(unix))]
    let terminate = std::future::pending::<()>();

    tokio::select! {
        _ = ctrl_c => {},
        _ = terminate => {},
    }
}

/// Lightweight healthcheck: GET /health and exit 0 on 200, 1 otherwise.
/// Invoked via `streamgate --healthcheck` from a container HEALTHCHECK.
async fn healthcheck() -> anyhow::Result<()> {
    let port = std::env::var("PORT")
        .ok()
        .and_then(|v| v.parse::<u16>().ok())
        .unwrap_or(8080);

    let url = format!("http://127.0.0.1:{port}/health");
    let resp = reqwest::get(&url).await?;

    if resp.status().is_success() {
        std::process::exit(0);
    } else {
        std::process::exit(1);
    }
}

/// Background task: sweeps idle rate-limit buckets on the configured
/// cadence. The initial tick fires immediately; skip it so startup does not
/// race a sweep against the first requests.
async fn bucket_reaper(state: Arc<GatewayState>) {
    let mut interval = tokio::time::interval(state.limiter.cleanup_interval());
    interval.tick().await;

    loop {
        interval.tick().await;
        let removed = state.limiter.sweep(chrono::Utc::now());
        if removed > 0 {
            debug!(removed, "reaped idle rate-limit buckets");
        }
    }
}
