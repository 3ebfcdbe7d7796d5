pub mod auth;
pub mod bridge;
pub mod config;
pub mod error;
pub mod keyframe;
pub mod media;
pub mod mount;
pub mod protocol;
pub mod registry;
pub mod restream;
pub mod server;
pub mod session;
pub mod signaling;
pub mod storage;
pub mod transport;

pub use auth::{AllowAll, ConnectionGate, CookieTokenGate};
pub use bridge::{BridgeConfig, MediaBridge};
pub use config::{PortRange, RelayConfig};
pub use error::{RelayError, Result};
pub use media::Packetizer;
pub use registry::{LocalTrack, PeerSession, Registry, RegistrySnapshot, SyncOutcome};
pub use restream::{Orchestrator, Restream};
pub use signaling::{AppState, SignalingMessage, SignalingState};
pub use storage::{AssetStore, DirectoryStore};
