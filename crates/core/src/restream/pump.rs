use std::time::Duration;

use tokio::time::MissedTickBehavior;
use tokio_util::sync::CancellationToken;

use crate::config::RelayConfig;
use crate::error::{RelayError, Result};
use crate::media::h264;
use crate::server::EndpointHandle;

#[derive(Debug, Clone, Copy)]
pub(super) struct PumpConfig {
    pub fps: u32,
    pub start_timeout: Duration,
}

impl PumpConfig {
    pub fn from_relay(config: &RelayConfig) -> Self {
        Self {
            fps: config.restream_fps.max(1),
            start_timeout: config.restream_start_timeout,
        }
    }
}

/// Feed access units into the endpoint, then shut it down.
///
/// Ending the stream only stops this restream (`token`). A failure also
/// cancels `owner`, taking down whatever requested it.
pub(super) async fn run(
    config: PumpConfig,
    endpoint: EndpointHandle,
    units: Vec<Vec<u8>>,
    token: CancellationToken,
    owner: CancellationToken,
) {
    let mount = endpoint.mount.path().to_string();
    match pump(config, &endpoint, &units, &token).await {
        Ok(()) => tracing::info!(%mount, frames = units.len(), "restream finished"),
        Err(RelayError::Cancelled) => tracing::debug!(%mount, "restream cancelled"),
        Err(e) => {
            tracing::warn!(%mount, error = %e, "restream pump failed");
            owner.cancel();
        }
    }
    token.cancel();
}

async fn pump(
    config: PumpConfig,
    endpoint: &EndpointHandle,
    units: &[Vec<u8>],
    token: &CancellationToken,
) -> Result<()> {
    tokio::select! {
        _ = token.cancelled() => return Err(RelayError::Cancelled),
        waited = tokio::time::timeout(config.start_timeout, endpoint.sessions.wait_for_playing()) => {
            waited.map_err(|_| RelayError::Timeout("waiting for the first restream viewer"))?;
        }
    }

    let timestamp_increment = endpoint.mount.clock_rate() / config.fps;
    let mut ticker = tokio::time::interval(Duration::from_secs(1) / config.fps);
    ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);

    // A key frame request is answered by repeating the latest key frame on
    // the next tick, which delays the rest of the clip by one frame.
    let mut next = 0;
    let mut last_key: Option<usize> = None;
    while next < units.len() {
        tokio::select! {
            _ = token.cancelled() => return Err(RelayError::Cancelled),
            _ = ticker.tick() => {}
        }
        let mut index = next;
        if endpoint.take_keyframe_request() && !h264::is_key_frame(&units[next]) {
            match last_key {
                Some(key) => {
                    tracing::debug!(frame = next, key_frame = key, "repeating key frame on request");
                    index = key;
                }
                None => tracing::debug!(frame = next, "key frame requested before the first one"),
            }
        }
        if index == next {
            next += 1;
        }
        if h264::is_key_frame(&units[index]) {
            last_key = Some(index);
        }

        let packets = endpoint.mount.packetize(&units[index], timestamp_increment);
        let reached = endpoint.broadcast(&packets).await;
        tracing::trace!(packets = packets.len(), reached, "frame delivered");
    }
    Ok(())
}
