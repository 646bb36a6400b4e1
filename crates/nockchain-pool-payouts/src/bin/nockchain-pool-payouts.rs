use std::net::SocketAddr;
use std::path::PathBuf;
use std::sync::Arc;

use anyhow::Context;
use axum::extract::{Path, Query, State};
use axum::http::StatusCode;
use axum::routing::get;
use axum::{Json, Router};
use clap::Parser;
use serde::Deserialize;
use serde_json::{json, Value};
use tokio::signal;
use tokio_util::sync::CancellationToken;
use tracing::{error, info};
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt};

use nockchain_pool_payouts::{
    database::{Amount, PendingPayout, RedisStore, UserId},
    metrics::{metrics_handler, register_metrics},
    notifier::RedisBlockNotifier,
    queue::PayoutStatistics,
    Backends, ExecutorStats, PayoutConfig, PayoutError, PayoutOrchestrator,
};

#[derive(Parser, Debug)]
#[clap(name = "nockchain-pool-payouts")]
#[clap(about = "Nockchain mining pool payout engine", long_about = None)]
struct Args {
    /// Redis URL for balances, payouts and shares
    #[clap(long, env = "POOL_REDIS_URL", default_value = "redis://localhost:6379")]
    redis_url: String,

    /// JSON payout configuration; built-in defaults when omitted
    #[clap(long, env = "POOL_PAYOUT_CONFIG")]
    config: Option<PathBuf>,

    /// Redis pub/sub channel carrying confirmed blocks
    #[clap(long, env = "POOL_BLOCK_CHANNEL", default_value = "pool:blocks:confirmed")]
    block_channel: String,

    /// HTTP API bind address
    #[clap(long, env = "POOL_HTTP_BIND", default_value = "0.0.0.0:8080")]
    http_bind: SocketAddr,
}

type ApiError = (StatusCode, String);

fn api_error(e: PayoutError) -> ApiError {
    error!("API request failed: {}", e);
    (StatusCode::INTERNAL_SERVER_ERROR, e.to_string())
}

#[derive(Debug, Deserialize)]
struct PendingQuery {
    limit: Option<usize>,
}

#[derive(Debug, Deserialize)]
struct EstimateQuery {
    reward: Amount,
}

#[derive(Debug, Deserialize)]
struct StatisticsQuery {
    days: Option<i64>,
}

async fn stats(State(orchestrator): State<Arc<PayoutOrchestrator>>) -> Json<ExecutorStats> {
    Json(orchestrator.get_stats().await)
}

async fn balance(
    State(orchestrator): State<Arc<PayoutOrchestrator>>,
    Path(user_id): Path<UserId>,
) -> Result<Json<Value>, ApiError> {
    let balance = orchestrator.get_user_balance(user_id).await.map_err(api_error)?;
    Ok(Json(json!({ "user_id": user_id, "balance": balance })))
}

async fn pending_payouts(
    State(orchestrator): State<Arc<PayoutOrchestrator>>,
    Query(query): Query<PendingQuery>,
) -> Result<Json<Vec<PendingPayout>>, ApiError> {
    let limit = query.limit.unwrap_or(100).min(1_000);
    orchestrator.get_pending_payouts(limit).await.map(Json).map_err(api_error)
}

async fn estimate(
    State(orchestrator): State<Arc<PayoutOrchestrator>>,
    Path(user_id): Path<UserId>,
    Query(query): Query<EstimateQuery>,
) -> Result<Json<Value>, ApiError> {
    let estimate = orchestrator.estimate_payout(user_id, query.reward).await.map_err(api_error)?;
    Ok(Json(json!({ "user_id": user_id, "reward": query.reward, "estimated_payout": estimate })))
}

async fn payout_statistics(
    State(orchestrator): State<Arc<PayoutOrchestrator>>,
    Path(user_id): Path<UserId>,
    Query(query): Query<StatisticsQuery>,
) -> Result<Json<PayoutStatistics>, ApiError> {
    let since = chrono::Utc::now() - chrono::Duration::days(query.days.unwrap_or(30).clamp(1, 365));
    orchestrator.get_payout_statistics(user_id, since).await.map(Json).map_err(api_error)
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    // Initialize tracing
    tracing_subscriber::registry()
        .with(tracing_subscriber::EnvFilter::new(
            std::env::var("RUST_LOG").unwrap_or_else(|_| "info".into()),
        ))
        .with(tracing_subscriber::fmt::layer())
        .init();

    let args = Args::parse();

    let config = match &args.config {
        Some(path) => PayoutConfig::from_json_file(path)
            .with_context(|| format!("loading payout config from {}", path.display()))?,
        None => PayoutConfig::default(),
    };
    info!("Starting payout engine, default mode {}", config.default_mode);
    info!("Redis URL: {}", args.redis_url);

    register_metrics().context("registering metrics")?;

    let shutdown = CancellationToken::new();
    let store = Arc::new(RedisStore::new(&args.redis_url, config.default_min_payout).await?);
    let backends = Backends {
        shares: store.clone(),
        settings: store.clone(),
        ledger: store.clone(),
        queue: store.clone(),
        wallets: store.clone(),
        registry: store.clone(),
    };
    let notifier =
        Arc::new(RedisBlockNotifier::connect(&args.redis_url, &args.block_channel, shutdown.clone()).await?);

    let orchestrator = Arc::new(PayoutOrchestrator::new(&config, backends, notifier)?);
    orchestrator.start()?;

    // Share index maintenance
    let maintenance_store = store.clone();
    let maintenance_shutdown = shutdown.clone();
    tokio::spawn(async move {
        let mut interval = tokio::time::interval(tokio::time::Duration::from_secs(3600));
        loop {
            tokio::select! {
                _ = maintenance_shutdown.cancelled() => break,
                _ = interval.tick() => {
                    let cutoff = chrono::Utc::now() - chrono::Duration::days(7);
                    if let Err(e) = maintenance_store.cleanup_old_shares(cutoff).await {
                        error!("Maintenance error: {}", e);
                    }
                }
            }
        }
    });

    let app = Router::new()
        .route("/metrics", get(|| async { metrics_handler() }))
        .route("/stats", get(stats))
        .route("/balances/{user_id}", get(balance))
        .route("/payouts/pending", get(pending_payouts))
        .route("/payouts/estimate/{user_id}", get(estimate))
        .route("/payouts/statistics/{user_id}", get(payout_statistics))
        .with_state(orchestrator.clone());

    let listener = tokio::net::TcpListener::bind(args.http_bind)
        .await
        .with_context(|| format!("binding {}", args.http_bind))?;
    info!("HTTP API listening on {}", args.http_bind);

    let server_shutdown = shutdown.clone();
    let server = tokio::spawn(async move {
        axum::serve(listener, app)
            .with_graceful_shutdown(async move { server_shutdown.cancelled().await })
            .await
    });

    signal::ctrl_c().await?;
    info!("Received shutdown signal");
    shutdown.cancel();

    if let Err(e) = orchestrator.stop().await {
        error!("Payout orchestrator did not drain cleanly: {}", e);
    }
    match server.await {
        Ok(Err(e)) => error!("HTTP server error: {}", e),
        Err(e) => error!("HTTP server task failed: {}", e),
        Ok(Ok(())) => {}
    }

    info!("Payout engine shut down");
    Ok(())
}
