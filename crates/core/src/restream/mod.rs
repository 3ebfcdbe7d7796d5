//! Ephemeral RTSP re-streaming of stored assets.
//!
//! [`Orchestrator::provision`] turns an asset into a live RTSP URL:
//!
//! ```text
//! asset bytes ──► split into access units ──► Mount (SPS/PPS observed)
//!                                               │
//!      endpoint task: bind port in range ───────┤──► startup: Ok(port) | Err
//!                                               │
//!      pump task: wait for a viewer, then one access unit per frame
//! ```
//!
//! The caller only gets the URL once the endpoint is actually accepting
//! connections. Every task of a restream hangs off a child of the owner's
//! [`CancellationToken`]; cancelling the owner tears the restream down.

mod pump;

use std::path::Path;
use std::sync::Arc;

use bytes::Bytes;
use tokio::sync::oneshot;
use tokio_util::sync::CancellationToken;

use crate::config::RelayConfig;
use crate::error::{RelayError, Result};
use crate::media::h264::{self, H264Packetizer};
use crate::mount::Mount;
use crate::server::{RestreamEndpoint, ServerConfig};

/// A running restream.
#[derive(Debug, Clone)]
pub struct Restream {
    /// `"{rtsp_host_pattern}:{port}/{stem}"`.
    pub url: String,
    pub port: u16,
    /// Cancelling this token stops the endpoint and the pump.
    pub token: CancellationToken,
}

/// Provisions restream endpoints on ports from the configured range.
#[derive(Debug, Clone)]
pub struct Orchestrator {
    config: Arc<RelayConfig>,
}

impl Orchestrator {
    pub fn new(config: Arc<RelayConfig>) -> Self {
        Self { config }
    }

    /// Start restreaming `asset` under the mount named after `name`
    /// without its extension (`clip.mp4` → `/clip`).
    ///
    /// Returns once the endpoint reported its bound port. On failure
    /// nothing is left running. A pump failure later on cancels `owner`.
    pub async fn provision(
        &self,
        asset: Bytes,
        name: &str,
        owner: &CancellationToken,
    ) -> Result<Restream> {
        let stem = asset_stem(name)?;
        let units = h264::split_access_units(&asset);
        let Some(first) = units.first() else {
            return Err(RelayError::StartupFailed(format!(
                "{name} holds no H.264 access units"
            )));
        };

        let mount = Arc::new(Mount::new(
            &format!("/{stem}"),
            Box::new(H264Packetizer::with_random_ssrc(96)),
        ));
        mount.observe(first);

        let token = owner.child_token();
        let (started_tx, started_rx) = oneshot::channel();
        tokio::spawn(run_endpoint(
            self.config.clone(),
            mount.clone(),
            token.clone(),
            started_tx,
        ));

        let started = tokio::select! {
            _ = token.cancelled() => Err(RelayError::Cancelled),
            started = started_rx => started.unwrap_or_else(|_| {
                Err(RelayError::StartupFailed("endpoint task exited before binding".into()))
            }),
        };
        let handle = match started {
            Ok(handle) => handle,
            Err(e) => {
                token.cancel();
                tracing::warn!(asset = name, error = %e, "restream startup failed");
                return Err(e);
            }
        };

        let port = handle.port;
        let url = format!("{}:{}/{}", self.config.rtsp_host_pattern, port, stem);
        tracing::info!(asset = name, %url, frames = units.len(), "restream ready");

        tokio::spawn(pump::run(
            pump::PumpConfig::from_relay(&self.config),
            handle.endpoint,
            units,
            token.clone(),
            owner.clone(),
        ));

        Ok(Restream { url, port, token })
    }
}

struct Started {
    port: u16,
    endpoint: crate::server::EndpointHandle,
}

/// Bind, report the outcome exactly once, then serve until cancelled.
async fn run_endpoint(
    config: Arc<RelayConfig>,
    mount: Arc<Mount>,
    token: CancellationToken,
    started: oneshot::Sender<Result<Started>>,
) {
    let endpoint = match RestreamEndpoint::bind(
        &config.restream_bind_host,
        config.restream_ports,
        mount,
        ServerConfig::default(),
    )
    .await
    {
        Ok(endpoint) => endpoint,
        Err(e) => {
            let _ = started.send(Err(e));
            return;
        }
    };

    let report = Started {
        port: endpoint.local_addr().port(),
        endpoint: endpoint.handle(),
    };
    if started.send(Ok(report)).is_err() {
        tracing::debug!("restream requester went away before startup");
        return;
    }
    endpoint.serve(token).await;
}

/// File name without directories or extension.
fn asset_stem(name: &str) -> Result<String> {
    Path::new(name)
        .file_stem()
        .and_then(|stem| stem.to_str())
        .filter(|stem| !stem.is_empty() && !stem.starts_with('.'))
        .map(str::to_string)
        .ok_or_else(|| RelayError::InvalidAssetName(name.to_string()))
}
