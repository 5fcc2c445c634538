//! Catalog-enrichment pipeline backend.
//!
//! Boots the datastore, provider clients, queue workers, and the HTTP API.

mod analyst;
mod api;
mod auth;
mod cache;
mod confidence;
mod crossval;
mod middleware;
mod models;
mod pipeline;
mod providers;
mod scoring;
mod source_map;
mod storage;
mod validation;

use anyhow::{Context, Result};
use axum::{
    middleware as axum_mw,
    routing::{get, post},
    Json, Router,
};
use clap::Parser;
use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Duration;
use tokio::net::TcpListener;
use tower_http::cors::CorsLayer;
use tracing::{info, warn};
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt};

use crate::{
    auth::{api as auth_api, auth_middleware, AuthState, JwtHandler, UserStore},
    cache::Cache,
    middleware::rate_limit::{rate_limit_middleware, RateLimitConfig, RateLimitLayer},
    models::Config,
    pipeline::{broadcaster::Broadcaster, queue::QueueManager, Deps},
    providers::Providers,
    storage::Store,
};

#[derive(Parser, Debug)]
#[command(name = "cadastro", about = "Catalog enrichment pipeline backend")]
struct Cli {
    /// Override the listen port.
    #[arg(long, env = "PORT")]
    port: Option<u16>,
    /// Boot without queue workers (read-only mode).
    #[arg(long, env = "QUEUE_STORE_DISABLED")]
    no_queues: bool,
}

fn init_tracing() {
    let filter = tracing_subscriber::EnvFilter::try_from_default_env()
        .unwrap_or_else(|_| "info,cadastro_backend=debug".into());
    tracing_subscriber::registry()
        .with(filter)
        .with(tracing_subscriber::fmt::layer())
        .init();
}

async fn health() -> Json<serde_json::Value> {
    Json(serde_json::json!({
        "status": "ok",
        "service": "cadastro-backend",
        "version": env!("CARGO_PKG_VERSION"),
    }))
}

#[tokio::main]
async fn main() -> Result<()> {
    dotenv::dotenv().ok();
    init_tracing();

    let cli = Cli::parse();
    let mut config = Config::from_env()?;
    if let Some(port) = cli.port {
        config.port = port;
    }

    info!("Starting catalog enrichment pipeline backend");

    let store = Store::open(&config.database_path)
        .with_context(|| format!("Failed to open datastore at {}", config.database_path))?;
    let cache = Cache::new(store.clone());

    let user_store = Arc::new(UserStore::new(store.clone()));
    user_store.seed_admin(&config.admin_email, "Operator", &config.admin_password)?;
    let jwt_handler = Arc::new(JwtHandler::new(config.jwt_secret.clone()));
    let auth_state = AuthState {
        user_store,
        jwt_handler: jwt_handler.clone(),
    };

    let providers = Providers::from_config(&config)?;
    let broadcaster = Broadcaster::new();
    let queues = if cli.no_queues {
        warn!("Queue store disabled; pipeline runs in read-only mode");
        Arc::new(QueueManager::disabled(broadcaster.clone()))
    } else {
        Arc::new(QueueManager::new(
            broadcaster.clone(),
            config.backoff_base_ms,
            config.backoff_cap_ms,
        ))
    };

    let port = config.port;
    let deps = Arc::new(Deps {
        config,
        store,
        cache,
        providers,
        queues,
        broadcaster,
    });
    deps.start_pipeline();

    let rate_limiter = RateLimitLayer::new(RateLimitConfig::default());
    {
        let limiter = rate_limiter.clone();
        tokio::spawn(async move {
            let mut tick = tokio::time::interval(Duration::from_secs(60));
            loop {
                tick.tick().await;
                limiter.cleanup();
            }
        });
    }

    let protected_api = Router::new()
        // Pipeline control
        .route("/pipeline/start-doc", post(api::pipeline::start_doc))
        .route(
            "/pipeline/start-normalization",
            post(api::pipeline::start_normalization),
        )
        .route(
            "/pipeline/start-geocoding",
            post(api::pipeline::start_geocoding),
        )
        .route("/pipeline/start-places", post(api::pipeline::start_places))
        .route(
            "/pipeline/start-analysis",
            post(api::pipeline::start_analysis),
        )
        .route("/pipeline/start-analyst", post(api::pipeline::start_analyst))
        .route("/pipeline/retry-failed", post(api::pipeline::retry_failed))
        .route("/pipeline/pause/:queue", post(api::pipeline::pause_queue))
        .route("/pipeline/resume/:queue", post(api::pipeline::resume_queue))
        .route("/pipeline/paused-status", get(api::pipeline::paused_status))
        .route("/pipeline/status", get(api::pipeline::status))
        .route("/pipeline/queue-logs/:queue", get(api::pipeline::queue_logs))
        .route(
            "/pipeline/queue-logs-stream/:queue",
            get(api::pipeline::queue_logs_stream),
        )
        // Admin
        .route("/pipeline/reset-stuck", post(api::admin::reset_stuck))
        .route("/pipeline/unlock", post(api::admin::unlock))
        .route(
            "/pipeline/merge-duplicates",
            post(api::admin::merge_duplicates),
        )
        // Records
        .route("/records/ingest", post(api::records::ingest))
        .route("/records", get(api::records::list))
        .route(
            "/records/:id",
            get(api::records::get).delete(api::records::delete),
        )
        .route("/records/:id/result", get(api::records::result))
        .route("/records/:id/sources", get(api::records::sources))
        .route("/records/:id/real-quality", get(api::records::real_quality))
        .route(
            "/records/:id/analyst-context",
            get(api::records::analyst_context),
        )
        .route("/records/:id/force-fail", post(api::records::force_fail))
        // Structured logs & metrics
        .route("/logs/correlation/:id", get(api::logs::by_correlation))
        .route("/logs/record/:id", get(api::logs::by_record))
        .route("/metrics/:stage", get(api::logs::stage_metrics))
        .with_state(deps.clone());

    let refresh_router = Router::new()
        .route("/auth/refresh", post(auth_api::refresh))
        .with_state(auth_state.clone());

    let protected = protected_api
        .merge(refresh_router)
        .layer(axum_mw::from_fn_with_state(
            jwt_handler.clone(),
            auth_middleware,
        ));

    let public = Router::new()
        .route("/health", get(health))
        .merge(
            Router::new()
                .route("/auth/login", post(auth_api::login))
                .with_state(auth_state),
        );

    let app = Router::new()
        .merge(public)
        .merge(protected)
        .layer(axum_mw::from_fn_with_state(
            rate_limiter.clone(),
            rate_limit_middleware,
        ))
        .layer(axum_mw::from_fn(middleware::request_logging))
        .layer(CorsLayer::permissive());

    let addr = SocketAddr::from(([0, 0, 0, 0], port));
    let listener = TcpListener::bind(addr)
        .await
        .with_context(|| format!("Failed to bind {}", addr))?;
    info!(%addr, "HTTP API listening");

    axum::serve(
        listener,
        app.into_make_service_with_connect_info::<SocketAddr>(),
    )
    .with_graceful_shutdown(async {
        let _ = tokio::signal::ctrl_c().await;
        info!("Shutdown signal received");
    })
    .await
    .context("Server error")?;

    Ok(())
}
