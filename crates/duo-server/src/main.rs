mod config;

use std::sync::Arc;

use axum::{
    Json, Router,
    extract::{State, WebSocketUpgrade},
    http::{HeaderMap, StatusCode, header},
    response::{IntoResponse, Response},
    routing::get,
};
use futures_util::StreamExt;
use serde_json::json;
use tokio_util::sync::CancellationToken;
use tower_http::trace::TraceLayer;
use tracing::{info, warn};

use duo_db::Database;
use duo_gateway::config::SUBPROTOCOL;
use duo_gateway::{ConnectionContext, Registry, handle_connection};

use crate::config::ServerConfig;

#[derive(Clone)]
struct ServerState {
    config: Arc<ServerConfig>,
    gateway: ConnectionContext,
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    // Load .env if present
    let _ = dotenvy::dotenv();

    tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| "duo=debug,duo_gateway=debug,tower_http=debug".into()),
        )
        .init();

    let config = ServerConfig::from_env()?;
    let addr = config.addr()?;

    let db = Arc::new(Database::open(&config.db_path)?);
    info!("Database ready at {}", config.db_path.display());

    let shutdown = CancellationToken::new();
    let state = ServerState {
        gateway: ConnectionContext {
            registry: Registry::new(db.clone()),
            resolver: db,
            config: config.gateway.clone(),
            shutdown: shutdown.clone(),
        },
        config: Arc::new(config),
    };

    let app = Router::new()
        .route("/chat", get(ws_upgrade))
        .route("/health", get(health))
        .with_state(state)
        .layer(TraceLayer::new_for_http());

    info!("Duo server listening on {}", addr);
    let listener = tokio::net::TcpListener::bind(addr).await?;
    axum::serve(listener, app)
        .with_graceful_shutdown(shutdown_signal(shutdown))
        .await?;

    info!("Duo server stopped");
    Ok(())
}

async fn ws_upgrade(
    State(state): State<ServerState>,
    headers: HeaderMap,
    ws: WebSocketUpgrade,
) -> Response {
    let origin = headers
        .get(header::ORIGIN)
        .and_then(|value| value.to_str().ok());
    if !state.config.origin_allowed(origin) {
        warn!("Rejected WebSocket upgrade from origin {:?}", origin);
        return StatusCode::FORBIDDEN.into_response();
    }

    let mut ctx = state.gateway.clone();
    // Each connection watches its own child of the process token.
    ctx.shutdown = state.gateway.shutdown.child_token();

    ws.protocols([SUBPROTOCOL])
        .on_upgrade(move |socket| {
            let (sender, receiver) = socket.split();
            handle_connection(sender, receiver, ctx)
        })
        .into_response()
}

async fn health(State(state): State<ServerState>) -> impl IntoResponse {
    let online = state.gateway.registry.online_users().await;
    Json(json!({ "status": "ok", "online_users": online }))
}

/// Resolves on Ctrl+C or SIGTERM and cancels every live session.
async fn shutdown_signal(shutdown: CancellationToken) {
    let ctrl_c = tokio::signal::ctrl_c();
    #[cfg(unix)]
    {
        match tokio::signal::unix::signal(tokio::signal::unix::SignalKind::terminate()) {
            Ok(mut sigterm) => {
                tokio::select! {
                    _ = ctrl_c => info!("Received Ctrl+C, shutting down..."),
                    _ = sigterm.recv() => info!("Received SIGTERM, shutting down..."),
                }
            }
            Err(e) => {
                warn!("Failed to install SIGTERM handler: {}", e);
                ctrl_c.await.ok();
                info!("Received Ctrl+C, shutting down...");
            }
        }
    }
    #[cfg(not(unix))]
    {
        ctrl_c.await.ok();
        info!("Received Ctrl+C, shutting down...");
    }
    shutdown.cancel();
}
