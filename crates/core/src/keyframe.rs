//! Periodic key frame requests for every published track.

use std::sync::Arc;
use std::time::Duration;

use tokio::time::MissedTickBehavior;
use tokio_util::sync::CancellationToken;

use crate::registry::Registry;

/// Ask every track's source for a key frame each `interval` until
/// cancelled. Sources coalesce requests, so a slow source sees at most one.
pub async fn run(registry: Arc<Registry>, interval: Duration, cancel: CancellationToken) {
    let mut ticker = tokio::time::interval(interval);
    ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);
    // The first tick completes immediately.
    ticker.tick().await;

    loop {
        tokio::select! {
            _ = cancel.cancelled() => break,
            _ = ticker.tick() => {
                let listening = registry.dispatch_keyframes();
                tracing::trace!(tracks = listening, "keyframe requests dispatched");
            }
        }
    }
    tracing::debug!("keyframe dispatcher stopped");
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::registry::{LocalTrack, SyncConfig, TrackCodec};

    #[tokio::test(start_paused = true)]
    async fn ticks_until_cancelled() {
        let cancel = CancellationToken::new();
        let registry = Registry::new(SyncConfig::default(), cancel.clone());
        let codec = TrackCodec {
            mime_type: "video/H264".into(),
            clock_rate: 90_000,
            fmtp: String::new(),
        };
        let (track, mut requests) = LocalTrack::new(codec, "relay");
        registry.add_track(track).await;
        // Drain the request issued by the pass itself.
        assert_eq!(requests.recv().await, Some(()));

        let task = tokio::spawn(run(registry, Duration::from_secs(2), cancel.clone()));

        tokio::time::sleep(Duration::from_millis(1_900)).await;
        assert!(tokio::time::timeout(Duration::ZERO, requests.recv()).await.is_err());

        tokio::time::sleep(Duration::from_millis(200)).await;
        assert_eq!(requests.recv().await, Some(()));

        cancel.cancel();
        task.await.unwrap();
    }
}
