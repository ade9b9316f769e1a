//! Build bot HTTP routes: ingest, retrieval, health.

pub mod build;

use std::sync::Arc;

use axum::extract::multipart::MultipartRejection;
use axum::extract::{DefaultBodyLimit, Multipart, Query, State};
use axum::http::{Method, StatusCode};
use axum::response::Response;
use axum::routing::get;
use axum::Router;
use tower_http::trace::TraceLayer;

use crate::config::BotConfig;
use crate::services::github_service::GitHost;
use crate::services::ingest_service::{self, IngestOutcome};
use crate::services::object_store::ObjectStore;
use crate::services::publisher::GitPublisher;
use crate::services::retrieval_service::{self, BuildQuery};

/// Shared state for route handlers. Both clients are built once at startup.
#[derive(Clone)]
pub struct BotRouterState {
    pub store: Arc<dyn ObjectStore>,
    pub publisher: Arc<GitPublisher>,
    pub config: BotConfig,
}

impl BotRouterState {
    pub fn new(store: Arc<dyn ObjectStore>, git: Arc<dyn GitHost>, config: BotConfig) -> Self {
        let publisher = GitPublisher::new(
            git,
            crate::config::AUTHOR_NAME,
            crate::config::AUTHOR_EMAIL,
            config.call_timeout,
        );
        Self {
            store,
            publisher: Arc::new(publisher),
            config,
        }
    }
}

/// Build the bot's Axum router.
pub fn bot_router(state: BotRouterState) -> Router {
    let body_limit = state.config.max_upload_bytes;
    Router::new()
        .route(
            "/build",
            get(get_build_handler)
                .head(method_not_allowed)
                .post(post_build_handler)
                .fallback(method_not_allowed),
        )
        .route("/health", get(health))
        .layer(DefaultBodyLimit::max(body_limit))
        .layer(TraceLayer::new_for_http())
        .with_state(state)
}

type HandlerError = (StatusCode, String);

fn build_error(err: impl std::fmt::Display) -> HandlerError {
    (
        StatusCode::INTERNAL_SERVER_ERROR,
        format!("failed to handle the build: {err}"),
    )
}

// ── Build ──

async fn post_build_handler(
    State(state): State<BotRouterState>,
    Query(query): Query<build::IngestQuery>,
    multipart: Result<Multipart, MultipartRejection>,
) -> Result<StatusCode, HandlerError> {
    let multipart = multipart.map_err(|e| {
        tracing::error!("Failed to parse multipart form: {e}");
        build_error(format!("failed to parse multipart form: {e}"))
    })?;
    let request = build::read_ingest_request(multipart, query.is_dry_run())
        .await
        .map_err(|e| {
            tracing::error!("Failed to read multipart form: {e}");
            build_error(format!("failed to read multipart form: {e}"))
        })?;

    let outcome = ingest_service::ingest(
        state.store.as_ref(),
        &state.publisher,
        &state.config,
        request,
    )
    .await
    .map_err(build_error)?;

    if let IngestOutcome::Published { build, report } = &outcome {
        tracing::info!(
            project = %build.project,
            commit = %build.commit,
            branch = %report.branch,
            pull = report.pull_number,
            url = %report.pull_url,
            "Build published"
        );
    }
    Ok(StatusCode::OK)
}

async fn get_build_handler(
    State(state): State<BotRouterState>,
    Query(query): Query<BuildQuery>,
) -> Result<Response, HandlerError> {
    let artifact = retrieval_service::fetch_artifact(state.store.as_ref(), &state.config, &query)
        .await
        .map_err(|e| {
            tracing::warn!("Build lookup failed: {e}");
            build_error(e)
        })?;

    build::artifact_response(artifact).map_err(build_error)
}

async fn method_not_allowed(method: Method) -> HandlerError {
    (
        StatusCode::METHOD_NOT_ALLOWED,
        format!("Bad Request: {method} method not supported\n"),
    )
}

// ── Health ──

async fn health() -> &'static str {
    "ok"
}
