// Vetra Pool - Stratum front end
//
// Wires config, logging, the upstream work manager, the stratum server and
// the metrics endpoint. Everything interesting lives in the library.

use anyhow::Result;
use axum::http::{header, StatusCode};
use axum::response::IntoResponse;
use axum::routing::get;
use axum::{Json, Router};
use serde_json::json;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::mpsc;

use vetra_pool::config::Config;
use vetra_pool::metrics::prometheus as metrics;
use vetra_pool::stratum::StratumServer;
use vetra_pool::upstream::{NodeClient, WorkManager};

async fn health() -> Json<serde_json::Value> {
    Json(json!({"status": "ok"}))
}

async fn metrics_endpoint() -> impl IntoResponse {
    (
        StatusCode::OK,
        [(
            header::CONTENT_TYPE,
            "text/plain; version=0.0.4; charset=utf-8",
        )],
        metrics::render(),
    )
}

#[tokio::main]
async fn main() -> Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| tracing_subscriber::EnvFilter::new("info")),
        )
        .init();

    let config = Arc::new(Config::load());
    tracing::info!(
        "🚀 vetra-pool starting: stratum {}:{} public {}:{} node {}",
        config.host,
        config.port,
        config.public_host,
        config.public_port,
        config.node_rpc_url
    );

    let node = Arc::new(NodeClient::new(config.node_rpc_url.clone()));
    let server = Arc::new(StratumServer::new(config.clone()));

    // Validated shares stream out to the accounting collaborator; this
    // process only logs them.
    let (shares_tx, mut shares_rx) = mpsc::unbounded_channel();
    server.set_share_sink(shares_tx).await;
    tokio::spawn(async move {
        while let Some(event) = shares_rx.recv().await {
            tracing::debug!(
                "share event: user={} job={} diff={} block={}",
                event.username,
                event.job_id,
                event.difficulty,
                event.block
            );
        }
    });

    let manager = Arc::new(WorkManager::new(
        node,
        Duration::from_secs(config.template_poll_secs),
    ));
    manager.start(server.clone()).await;

    let app = Router::new()
        .route("/health", get(health))
        .route("/metrics", get(metrics_endpoint));
    let metrics_listen = config.metrics_listen.clone();
    tokio::spawn(async move {
        match tokio::net::TcpListener::bind(&metrics_listen).await {
            Ok(listener) => {
                tracing::info!("📈 metrics on http://{}/metrics", metrics_listen);
                if let Err(e) = axum::serve(listener, app).await {
                    tracing::error!("metrics server failed: {e}");
                }
            }
            Err(e) => tracing::error!("metrics bind failed on {}: {}", metrics_listen, e),
        }
    });

    server.start().await
}
