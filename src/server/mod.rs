//! Router assembly and the state shared across every WebSocket connection.
//!
//! Grounded in the teacher's `src/server/mod.rs::start` for the
//! bind/serve/tracing idiom, trimmed to the one route this crate's scope
//! actually needs — auth, device pairing, and the REST chat/HTML surfaces
//! are out of scope (spec §1 Non-goals).

pub mod ws;

use std::net::SocketAddr;
use std::sync::Arc;

use anyhow::{Context, Result};
use axum::routing::get;
use axum::Router;
use tower_http::cors::{Any, CorsLayer};
use tower_http::trace::TraceLayer;
use tracing::info;

use crate::config::VoiceConfig;
use crate::voice::session::SessionManager;

/// Shared across every connection: the normalized config tree and the
/// session registry keyed by connection id.
#[derive(Clone)]
pub struct ServerState {
    pub config: Arc<VoiceConfig>,
    pub sessions: Arc<SessionManager>,
}

/// Bind and serve the voice-call WebSocket endpoint at `/ws`.
pub async fn start(host: &str, port: u16, config: VoiceConfig) -> Result<()> {
    let state = ServerState {
        config: Arc::new(config),
        sessions: Arc::new(SessionManager::new()),
    };

    let addr: SocketAddr = format!("{host}:{port}")
        .parse()
        .context("invalid bind address")?;

    let cors = CorsLayer::new()
        .allow_origin(Any)
        .allow_methods(Any)
        .allow_headers(Any);

    let app = Router::new()
        .route("/ws", get(ws::ws_handler))
        .layer(cors)
        .layer(TraceLayer::new_for_http())
        .with_state(state);

    info!(%addr, "[Server] listening for voice-call WebSocket connections");
    axum::serve(tokio::net::TcpListener::bind(addr).await?, app).await?;
    Ok(())
}
