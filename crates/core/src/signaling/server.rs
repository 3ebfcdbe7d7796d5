//! HTTP surface: the signaling WebSocket, detached publishing and restream
//! provisioning.

use std::sync::Arc;

use axum::extract::ws::WebSocketUpgrade;
use axum::extract::State;
use axum::http::{HeaderMap, StatusCode};
use axum::response::{IntoResponse, Response};
use axum::routing::{get, post};
use axum::{Json, Router};
use serde::{Deserialize, Serialize};
use tokio::net::TcpListener;
use tokio_util::sync::CancellationToken;

use super::handler;
use crate::auth::ConnectionGate;
use crate::config::RelayConfig;
use crate::error::{RelayError, Result};
use crate::registry::{Registry, SyncConfig};
use crate::restream::{Orchestrator, Restream};
use crate::storage::AssetStore;

/// Everything a request handler needs, cloned per request.
#[derive(Clone)]
pub struct AppState {
    pub config: Arc<RelayConfig>,
    pub registry: Arc<Registry>,
    pub orchestrator: Orchestrator,
    pub assets: Arc<dyn AssetStore>,
    pub gate: Arc<dyn ConnectionGate>,
    /// Root of every connection, publish and restream token.
    pub shutdown: CancellationToken,
}

impl AppState {
    pub fn new(
        config: RelayConfig,
        assets: Arc<dyn AssetStore>,
        gate: Arc<dyn ConnectionGate>,
        shutdown: CancellationToken,
    ) -> Self {
        let config = Arc::new(config);
        Self {
            registry: Registry::new(SyncConfig::from_relay(&config), shutdown.clone()),
            orchestrator: Orchestrator::new(config.clone()),
            config,
            assets,
            gate,
            shutdown,
        }
    }
}

pub fn router(state: AppState) -> Router {
    Router::new()
        .route("/websocket", get(websocket))
        .route("/publish", post(publish_stream))
        .route("/stream", post(provision_stream))
        .with_state(state)
}

/// Serve the router on `listener` until the state's shutdown token fires.
pub async fn serve(state: AppState, listener: TcpListener) -> Result<()> {
    let shutdown = state.shutdown.clone();
    tracing::info!(addr = ?listener.local_addr().ok(), "signaling server listening");
    axum::serve(listener, router(state))
        .with_graceful_shutdown(async move { shutdown.cancelled().await })
        .await?;
    Ok(())
}

async fn websocket(
    State(state): State<AppState>,
    headers: HeaderMap,
    ws: WebSocketUpgrade,
) -> Response {
    if !state.gate.is_authorized(&headers) {
        tracing::info!("rejected unauthorized signaling connection");
        return StatusCode::UNAUTHORIZED.into_response();
    }
    ws.on_upgrade(move |socket| handler::serve_socket(socket, state))
}

#[derive(Debug, Deserialize)]
pub struct StreamRequest {
    pub source_video: String,
}

#[derive(Debug, Serialize, Deserialize)]
pub struct StreamResponse {
    pub rtsp_url: String,
}

#[derive(Debug, Deserialize)]
pub struct PublishRequest {
    pub rtsp_url: String,
}

#[derive(Debug, Serialize, Deserialize)]
pub struct PublishResponse {
    pub track_id: String,
}

#[derive(Debug, Serialize)]
struct ErrorBody {
    error: String,
}

fn error_response(status: StatusCode, error: &RelayError) -> Response {
    (
        status,
        Json(ErrorBody {
            error: error.to_string(),
        }),
    )
        .into_response()
}

async fn publish_stream(
    State(state): State<AppState>,
    Json(request): Json<PublishRequest>,
) -> Response {
    let url = request.rtsp_url.trim();
    match handler::publish_detached(&state, url).await {
        Ok(track_id) => Json(PublishResponse { track_id }).into_response(),
        Err(e) => {
            tracing::warn!(%url, error = %e, "publish request failed");
            let status = match e {
                RelayError::InvalidUrl(_)
                | RelayError::Sdp(_)
                | RelayError::UnsupportedCodec(_) => StatusCode::BAD_REQUEST,
                RelayError::Cancelled => StatusCode::SERVICE_UNAVAILABLE,
                _ => StatusCode::BAD_GATEWAY,
            };
            error_response(status, &e)
        }
    }
}

/// Restream a stored asset. The restream lives until shutdown or until its
/// stream ends.
async fn restream_asset(state: &AppState, name: &str) -> Result<Restream> {
    let asset = state.assets.fetch(name).await?;
    state
        .orchestrator
        .provision(asset, name, &state.shutdown.child_token())
        .await
}

async fn provision_stream(
    State(state): State<AppState>,
    Json(request): Json<StreamRequest>,
) -> Response {
    let name = request.source_video.trim();
    match restream_asset(&state, name).await {
        Ok(restream) => Json(StreamResponse {
            rtsp_url: restream.url,
        })
        .into_response(),
        Err(e) => {
            tracing::warn!(asset = name, error = %e, "restream request failed");
            let status = match e {
                RelayError::AssetNotFound(_) => StatusCode::NOT_FOUND,
                RelayError::InvalidAssetName(_) => StatusCode::BAD_REQUEST,
                RelayError::PortRangeExhausted { .. } => StatusCode::SERVICE_UNAVAILABLE,
                _ => StatusCode::INTERNAL_SERVER_ERROR,
            };
            error_response(status, &e)
        }
    }
}
