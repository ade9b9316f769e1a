//! Build Bot: ingests CI build artifacts and records them in git.
//!
//! `POST /build` stores uploaded artifacts and a build manifest in the
//! object store, then publishes the manifest to the tracking repository
//! through a pull request. `GET /build` serves a stored artifact back.

mod config;
mod metrics;
mod models;
mod routes;
mod services;
#[cfg(test)]
mod testing;

use std::net::SocketAddr;
use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;

use anyhow::Context;
use clap::Parser;

use config::BotConfig;
use routes::BotRouterState;
use services::github_service::GithubClient;
use services::s3_store::S3ObjectStore;

#[derive(Parser)]
#[command(name = "build-bot", about = "CI build artifact ingest bot")]
struct Cli {
    /// Server port
    #[arg(short, long, env = "BOT_PORT", default_value_t = config::DEFAULT_PORT)]
    port: u16,

    /// GitHub organization owning the tracking repository
    #[arg(long, env = "BOT_GITHUB_OWNER", default_value = config::DEFAULT_OWNER)]
    owner: String,

    /// Tracking repository manifests are committed to
    #[arg(long, env = "BOT_GITHUB_REPO", default_value = config::DEFAULT_REPO)]
    repo: String,

    /// Branch pull requests merge into
    #[arg(long, env = "BOT_BASE_BRANCH", default_value = config::DEFAULT_BASE_BRANCH)]
    base_branch: String,

    /// Bucket holding artifacts and manifests
    #[arg(long, env = "BOT_BUCKET", default_value = config::DEFAULT_BUCKET)]
    bucket: String,

    /// GitHub REST API base URL
    #[arg(long, env = "BOT_GITHUB_API_URL", default_value = config::DEFAULT_GITHUB_API_URL)]
    github_api_url: String,

    /// File holding the GitHub token (GITHUB_AUTH_TOKEN wins when set)
    #[arg(long, env = "BOT_GITHUB_TOKEN_PATH")]
    github_token_path: Option<PathBuf>,

    /// JSON file with S3 region, endpoint and keys
    #[arg(long, env = "BOT_S3_CREDENTIALS_FILE")]
    s3_credentials_file: Option<PathBuf>,

    /// Timeout for each object store or GitHub call
    #[arg(long, env = "BOT_CALL_TIMEOUT_SECS", default_value_t = config::DEFAULT_CALL_TIMEOUT_SECS)]
    call_timeout_secs: u64,

    /// Largest accepted upload body
    #[arg(long, env = "BOT_MAX_UPLOAD_MB", default_value_t = config::DEFAULT_MAX_UPLOAD_MB)]
    max_upload_mb: usize,
}

impl Cli {
    fn bot_config(&self) -> BotConfig {
        BotConfig {
            owner: self.owner.clone(),
            repo: self.repo.clone(),
            base_branch: self.base_branch.clone(),
            bucket: self.bucket.clone(),
            github_api_url: self.github_api_url.clone(),
            call_timeout: Duration::from_secs(self.call_timeout_secs),
            max_upload_bytes: self.max_upload_mb.saturating_mul(1024 * 1024),
        }
    }
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    // Initialize tracing
    let log_format = std::env::var("LOG_FORMAT").unwrap_or_default();
    if log_format == "json" {
        tracing_subscriber::fmt()
            .json()
            .with_env_filter(
                tracing_subscriber::EnvFilter::try_from_default_env()
                    .unwrap_or_else(|_| "info".into()),
            )
            .init();
    } else {
        tracing_subscriber::fmt()
            .with_env_filter(
                tracing_subscriber::EnvFilter::try_from_default_env()
                    .unwrap_or_else(|_| "info".into()),
            )
            .init();
    }

    let cli = Cli::parse();
    let bot_config = cli.bot_config();

    tracing::info!(
        owner = %bot_config.owner,
        repo = %bot_config.repo,
        bucket = %bot_config.bucket,
        "Starting Build Bot..."
    );

    // GitHub client
    let token = config::resolve_github_token(
        std::env::var(config::GITHUB_TOKEN_ENV).ok(),
        cli.github_token_path.as_deref(),
    )?;
    let github = GithubClient::new(
        &bot_config.github_api_url,
        &bot_config.owner,
        &bot_config.repo,
        token,
        bot_config.call_timeout,
    )
    .context("failed to build the GitHub client")?;

    // Object store client
    let credentials = config::load_s3_credentials(cli.s3_credentials_file.as_deref())?;
    tracing::info!(?credentials, "Connecting to object store");
    let store = S3ObjectStore::connect(&credentials).await;

    let state = BotRouterState::new(Arc::new(store), Arc::new(github), bot_config);
    let app = routes::bot_router(state);

    // Initialize metrics
    metrics::init_metrics();

    // Start server
    let addr = SocketAddr::from(([0, 0, 0, 0], cli.port));
    tracing::info!("Build Bot listening on {}", addr);

    let listener = tokio::net::TcpListener::bind(addr).await?;
    axum::serve(listener, app)
        .with_graceful_shutdown(shutdown_signal())
        .await?;

    tracing::info!("Shutdown complete");

    Ok(())
}

async fn shutdown_signal() {
    let ctrl_c = async {
        if let Err(e) = tokio::signal::ctrl_c().await {
            tracing::error!("Failed to install Ctrl+C handler: {e}");
            std::future::pending::<()>().await;
        }
    };

    #[cfg(unix)]
    let terminate = async {
        match tokio::signal::unix::signal(tokio::signal::unix::SignalKind::terminate()) {
            Ok(mut signal) => {
                signal.recv().await;
            }
            Err(e) => {
                tracing::error!("Failed to install SIGTERM handler: {e}");
                std::future::pending::<()>().await;
            }
        }
    };

    #[cfg(not(unix))]
    let terminate = std::future::pending::<()>();

    tokio::select! {
        _ = ctrl_c => tracing::info!("Received SIGINT, shutting down..."),
        _ = terminate => tracing::info!("Received SIGTERM, shutting down..."),
    }
}
