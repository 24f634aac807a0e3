mod cache;
mod config;
mod dispatch;
mod http;
mod metrics;
mod models;
mod notify;
mod orchestrator;
mod spend;
mod stage;
mod store;
mod stream;
mod subscriber;
mod workers;

use axum::{
    Json, Router,
    extract::{Path, State, WebSocketUpgrade},
    http::StatusCode,
    response::{IntoResponse, Response},
    routing::{get, post},
};
use config::BusinessRules;
use metrics_exporter_prometheus::{PrometheusBuilder, PrometheusHandle};
use models::{ApiError, OfferView, SubmitOfferRequest, SubmitOfferResponse};
use orchestrator::{OfferError, OfferOrchestrator};
use serde_json::json;
use std::{net::SocketAddr, sync::Arc};
use subscriber::{HttpOfferPoll, ProgressSubscriber, ProgressUpdate};
use tower_http::{
    cors::{Any, CorsLayer},
    trace::TraceLayer,
};
use tracing::{error, info};
use tracing_subscriber::{EnvFilter, fmt};
use uuid::Uuid;

#[tokio::main]
async fn main() {
    dotenvy::dotenv().ok();
    init_tracing();

    let mut args = std::env::args().skip(1);
    let result = match args.next().as_deref() {
        Some("follow") => follow(args.next()).await,
        _ => serve().await,
    };
    if let Err(err) = result {
        error!(target = "pawnshop.api", "fatal: {err}");
        std::process::exit(1);
    }
}

async fn serve() -> Result<(), Box<dyn std::error::Error + Send + Sync>> {
    let rules = BusinessRules::from_env();
    let shared_cache: Arc<dyn cache::Cache> = match cache::RedisCache::from_env() {
        Some(redis) => {
            info!(target = "pawnshop.api", "using redis cache");
            Arc::new(redis)
        }
        None => {
            info!(target = "pawnshop.api", "REDIS_URL not set, using in-process cache");
            Arc::new(cache::MemoryCache::new())
        }
    };
    let offer_store = Arc::new(store::MemoryStore::new());
    let (queue, jobs_rx) = dispatch::InProcessQueue::new();
    let orchestrator = Arc::new(OfferOrchestrator::new(
        offer_store,
        shared_cache,
        Arc::new(queue),
        Arc::new(workers::DemoFraudScorer),
        Arc::new(notify::LogNotifier),
        rules.clone(),
    ));
    let _worker = dispatch::spawn_worker(
        jobs_rx,
        Arc::new(workers::DemoWorkers),
        orchestrator.clone(),
    );

    let openapi_raw = include_str!("../docs/openapi.yaml");
    let openapi: serde_json::Value =
        serde_yaml::from_str(openapi_raw).unwrap_or(json!({"openapi": "3.0.3"}));
    let prometheus_handle = PrometheusBuilder::new()
        .install_recorder()
        .expect("prom recorder");

    let state = AppState {
        orchestrator,
        rules,
        openapi: Arc::new(openapi),
        prometheus_handle,
    };

    let cors = CorsLayer::new()
        .allow_headers(Any)
        .allow_methods(Any)
        .allow_origin(Any);

    let app = Router::new()
        .route("/health", get(health))
        .route("/metrics", get(metrics_endpoint))
        .route("/openapi.json", get(openapi_json))
        .route("/docs", get(swagger_ui))
        .route("/api/v1/offers", post(submit_offer))
        .route("/api/v1/offers/{id}", get(get_offer))
        .route("/api/v1/offers/{id}/stream", get(offer_stream))
        .with_state(state)
        .layer(cors)
        .layer(TraceLayer::new_for_http())
        .layer(axum::extract::DefaultBodyLimit::max(body_limit_from_env()));

    let port: u16 = std::env::var("PORT")
        .ok()
        .and_then(|value| value.parse().ok())
        .unwrap_or(8000);
    let addr: SocketAddr = ([0, 0, 0, 0], port).into();
    info!(target = "pawnshop.api", "listening on {addr}");

    let listener = tokio::net::TcpListener::bind(addr).await?;
    axum::serve(listener, app.into_make_service()).await?;
    Ok(())
}

/// `follow <offer-id>`: tail one offer's progress from the terminal over
/// the polling transport, against `BASE_URL` (default localhost).
async fn follow(raw_id: Option<String>) -> Result<(), Box<dyn std::error::Error + Send + Sync>> {
    let raw_id = raw_id.ok_or("usage: follow <offer-id>")?;
    let offer_id = Uuid::parse_str(raw_id.trim()).map_err(|_| "invalid offer id")?;
    let base_url =
        std::env::var("BASE_URL").unwrap_or_else(|_| "http://localhost:8000".to_string());
    let rules = BusinessRules::from_env();

    let poller = ProgressSubscriber::new(
        None,
        Arc::new(HttpOfferPoll::new(base_url, http::build_client())),
        rules.push_connect_timeout,
        rules.fallback_poll_interval,
    );
    let (tx, mut rx) = tokio::sync::mpsc::channel(16);
    let runner = tokio::spawn(async move { poller.run(offer_id, tx).await });

    while let Some(update) = rx.recv().await {
        match update {
            ProgressUpdate::Phase {
                phase,
                jake_message,
                ..
            } => {
                println!("[{phase:?}]");
                if let Some(line) = jake_message {
                    println!("  Jake: {line}");
                }
            }
            ProgressUpdate::Complete => {
                println!("offer ready");
                break;
            }
            ProgressUpdate::Halted { message } => {
                println!("{message}");
                break;
            }
        }
    }
    runner.abort();
    Ok(())
}

#[derive(Clone)]
struct AppState {
    orchestrator: Arc<OfferOrchestrator>,
    rules: BusinessRules,
    openapi: Arc<serde_json::Value>,
    prometheus_handle: PrometheusHandle,
}

/// Health and readiness check.
///
/// - Method: `GET`
/// - Path: `/health`
/// - Auth: none
async fn health() -> Json<serde_json::Value> {
    Json(json!({
        "status": "ok",
        "service": "pawnshop-api-rs",
    }))
}

/// Submit photos of an item and start the evaluation pipeline.
///
/// - Method: `POST`
/// - Path: `/api/v1/offers`
/// - Body: `SubmitOfferRequest`
/// - Response: `201` with the new offer id
async fn submit_offer(
    State(state): State<AppState>,
    Json(payload): Json<SubmitOfferRequest>,
) -> Result<(StatusCode, Json<SubmitOfferResponse>), AppError> {
    crate::metrics::inc_requests("/api/v1/offers");
    let offer_id = state.orchestrator.create_offer(payload).await?;
    Ok((StatusCode::CREATED, Json(SubmitOfferResponse { offer_id })))
}

/// Read model for one offer, including the live processing stage when the
/// ledger still has it.
async fn get_offer(
    State(state): State<AppState>,
    Path(id): Path<String>,
) -> Result<Json<OfferView>, AppError> {
    crate::metrics::inc_requests("/api/v1/offers/{id}");
    let offer_id = Uuid::parse_str(id.trim()).map_err(|_| AppError(OfferError::InvalidId))?;
    let view = state.orchestrator.offer_view(offer_id).await?;
    Ok(Json(view))
}

/// Live progress stream for one offer.
///
/// - Method: `GET` upgrade
/// - Path: `/api/v1/offers/{id}/stream`
async fn offer_stream(
    State(state): State<AppState>,
    Path(id): Path<String>,
    ws: WebSocketUpgrade,
) -> Response {
    crate::metrics::inc_requests("/api/v1/offers/{id}/stream");
    ws.on_upgrade(move |socket| async move {
        stream::run(socket, state.orchestrator.clone(), &state.rules, &id).await;
    })
}

async fn openapi_json(
    State(state): State<AppState>,
    headers: axum::http::HeaderMap,
) -> Response {
    if let Ok(key) = std::env::var("OPENAPI_KEY") {
        let presented = headers
            .get("X-Docs-Key")
            .and_then(|v| v.to_str().ok())
            .unwrap_or("");
        if presented != key {
            return (StatusCode::UNAUTHORIZED, "unauthorized").into_response();
        }
    }
    Json((*state.openapi).clone()).into_response()
}

async fn swagger_ui() -> axum::http::Response<String> {
    let html = r#"<!doctype html>
<html>
<head>
  <meta charset='utf-8'/>
  <title>Pawn Shop API Docs</title>
  <link rel="stylesheet" href="https://unpkg.com/swagger-ui-dist@5/swagger-ui.css" />
</head>
<body>
  <div id="swagger-ui"></div>
  <script src="https://unpkg.com/swagger-ui-dist@5/swagger-ui-bundle.js"></script>
  <script>
    window.onload = () => {
      window.ui = SwaggerUIBundle({ url: '/openapi.json', dom_id: '#swagger-ui' });
    };
  </script>
</body>
</html>"#;
    axum::http::Response::builder()
        .header("Content-Type", "text/html; charset=utf-8")
        .body(html.to_string())
        .unwrap_or_default()
}

async fn metrics_endpoint(
    State(state): State<AppState>,
    headers: axum::http::HeaderMap,
) -> Response {
    if let Ok(secret) = std::env::var("METRICS_KEY") {
        let presented = headers
            .get("X-Metrics-Key")
            .and_then(|v| v.to_str().ok())
            .unwrap_or("");
        if presented != secret {
            return (StatusCode::UNAUTHORIZED, "unauthorized").into_response();
        }
    }
    let body = state.prometheus_handle.render();
    ([("Content-Type", "text/plain; version=0.0.4")], body).into_response()
}

fn body_limit_from_env() -> usize {
    std::env::var("REQUEST_MAX_BYTES")
        .ok()
        .and_then(|v| v.parse::<usize>().ok())
        .filter(|v| *v > 0)
        .unwrap_or(256 * 1024)
}

#[derive(Debug)]
struct AppError(OfferError);

impl From<OfferError> for AppError {
    fn from(value: OfferError) -> Self {
        Self(value)
    }
}

impl IntoResponse for AppError {
    fn into_response(self) -> Response {
        let (status, code, detail) = match &self.0 {
            OfferError::InvalidId => (StatusCode::BAD_REQUEST, "invalid_offer_id", None),
            OfferError::InvalidInput(message) => {
                (StatusCode::BAD_REQUEST, "invalid_input", Some(message.clone()))
            }
            OfferError::NotFound(_) => (StatusCode::NOT_FOUND, "not_found", None),
            other => {
                error!(target = "pawnshop.api", error = %other, "request failed");
                (StatusCode::INTERNAL_SERVER_ERROR, "internal", None)
            }
        };
        let payload = ApiError {
            error: code.to_string(),
            detail,
        };
        (status, Json(payload)).into_response()
    }
}

fn init_tracing() {
    let filter = EnvFilter::try_from_default_env()
        .unwrap_or_else(|_| EnvFilter::new("info,tower_http=debug"));
    let _ = fmt().with_env_filter(filter).try_init();
}
