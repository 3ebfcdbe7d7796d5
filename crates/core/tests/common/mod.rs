#![allow(dead_code)]

use std::collections::HashMap;
use std::time::Duration;

use async_trait::async_trait;
use bytes::Bytes;
use relay::config::PortRange;
use relay::{AssetStore, RelayConfig, RelayError, Result};

const SPS: &[u8] = &[0x67, 0x42, 0x00, 0x1e, 0x8d, 0x68, 0x05, 0x00, 0x5b, 0xa1];
const PPS: &[u8] = &[0x68, 0xce, 0x38, 0x80];

/// Annex-B H.264 stream of `frames` access units with an IDR every 30.
pub fn h264_clip(frames: usize) -> Bytes {
    let mut stream = Vec::new();
    for i in 0..frames {
        if i % 30 == 0 {
            for nal in [SPS, PPS, &[0x65, 0x88, 0x84, 0x21, 0xa0][..]] {
                stream.extend_from_slice(&[0, 0, 0, 1]);
                stream.extend_from_slice(nal);
            }
        } else {
            stream.extend_from_slice(&[0, 0, 0, 1, 0x41, 0x9a, (i % 256) as u8, 0x11]);
        }
    }
    Bytes::from(stream)
}

/// Assets held in memory.
#[derive(Default)]
pub struct MemoryStore {
    assets: HashMap<String, Bytes>,
}

impl MemoryStore {
    pub fn with(name: &str, data: Bytes) -> Self {
        let mut assets = HashMap::new();
        assets.insert(name.to_string(), data);
        Self { assets }
    }
}

#[async_trait]
impl AssetStore for MemoryStore {
    async fn fetch(&self, name: &str) -> Result<Bytes> {
        self.assets
            .get(name)
            .cloned()
            .ok_or_else(|| RelayError::AssetNotFound(name.to_string()))
    }
}

/// Loopback-only configuration with OS-assigned restream ports.
pub fn local_config() -> RelayConfig {
    RelayConfig {
        listen_addr: "127.0.0.1:0".to_string(),
        restream_ports: PortRange::ephemeral(),
        restream_start_timeout: Duration::from_secs(5),
        ice_servers: Vec::new(),
        ..RelayConfig::default()
    }
}

/// Poll `condition` every 20 ms for up to five seconds.
pub async fn eventually(mut condition: impl FnMut() -> bool) -> bool {
    for _ in 0..250 {
        if condition() {
            return true;
        }
        tokio::time::sleep(Duration::from_millis(20)).await;
    }
    condition()
}
