use std::path::PathBuf;
use std::process::ExitCode;
use std::sync::Arc;
use std::time::Duration;

use clap::Parser;
use relay::{
    AllowAll, AppState, ConnectionGate, CookieTokenGate, DirectoryStore, PortRange, RelayConfig,
};
use tokio::net::TcpListener;
use tokio_util::sync::CancellationToken;
use tracing_subscriber::EnvFilter;

#[derive(Parser)]
#[command(
    name = "relay-server",
    about = "Relay RTSP cameras and stored H.264 clips to WebRTC viewers"
)]
struct Args {
    /// Signaling HTTP listen address (host:port)
    #[arg(long, short, env = "RELAY_LISTEN", default_value = "0.0.0.0:8080")]
    listen: String,

    /// Directory stored assets are read from
    #[arg(long, env = "RELAY_ASSET_DIR", default_value = "assets")]
    asset_dir: PathBuf,

    /// Prefix of restream URLs; the port and mount are appended
    #[arg(long, env = "RELAY_RTSP_HOST", default_value = "rtsp://127.0.0.1")]
    rtsp_host: String,

    /// Interface restream endpoints bind on
    #[arg(long, env = "RELAY_RESTREAM_BIND", default_value = "127.0.0.1")]
    restream_bind: String,

    /// Restream port range, e.g. 8600-8700, or 0 for OS-assigned ports
    #[arg(long, env = "RELAY_RESTREAM_PORTS", default_value = "8600-8700", value_parser = parse_port_range)]
    restream_ports: PortRange,

    /// Frame rate stored assets are paced at
    #[arg(long, env = "RELAY_RESTREAM_FPS", default_value_t = 30)]
    restream_fps: u32,

    /// Seconds a restream waits for its first viewer
    #[arg(long, env = "RELAY_RESTREAM_START_TIMEOUT", default_value_t = 10)]
    restream_start_timeout: u64,

    /// Seconds allowed for an RTSP TCP connect
    #[arg(long, env = "RELAY_DIAL_TIMEOUT", default_value_t = 3)]
    dial_timeout: u64,

    /// Seconds allowed for each RTSP request/response exchange
    #[arg(long, env = "RELAY_READ_TIMEOUT", default_value_t = 3)]
    read_timeout: u64,

    /// Seconds of media silence after which a source is dropped
    #[arg(long, env = "RELAY_MEDIA_TIMEOUT", default_value_t = 10)]
    media_timeout: u64,

    /// Seconds between RTSP keepalives
    #[arg(long, env = "RELAY_KEEPALIVE_INTERVAL", default_value_t = 20)]
    keepalive_interval: u64,

    /// Milliseconds between keyframe requests to every source
    #[arg(long, env = "RELAY_KEYFRAME_INTERVAL_MS", default_value_t = 2000)]
    keyframe_interval_ms: u64,

    /// Attempts a renegotiation pass makes before deferring
    #[arg(long, env = "RELAY_SYNC_ATTEMPTS", default_value_t = 25)]
    sync_attempts: u32,

    /// Seconds before a deferred renegotiation retry
    #[arg(long, env = "RELAY_SYNC_BACKOFF", default_value_t = 3)]
    sync_backoff: u64,

    /// STUN/TURN server URLs
    #[arg(
        long = "ice-server",
        env = "RELAY_ICE_SERVERS",
        value_delimiter = ',',
        default_value = "stun:stun.l.google.com:19302"
    )]
    ice_servers: Vec<String>,

    /// Cookie that must carry one of --auth-tokens; open access when unset
    #[arg(long, env = "RELAY_AUTH_COOKIE", requires = "auth_tokens")]
    auth_cookie: Option<String>,

    /// Accepted signaling tokens
    #[arg(long, env = "RELAY_AUTH_TOKENS", value_delimiter = ',')]
    auth_tokens: Vec<String>,
}

fn parse_port_range(value: &str) -> Result<PortRange, String> {
    PortRange::parse(value).ok_or_else(|| format!("invalid port range: {value}"))
}

impl Args {
    fn relay_config(&self) -> RelayConfig {
        RelayConfig {
            listen_addr: self.listen.clone(),
            rtsp_host_pattern: self.rtsp_host.trim_end_matches('/').to_string(),
            restream_bind_host: self.restream_bind.clone(),
            restream_ports: self.restream_ports,
            restream_fps: self.restream_fps.max(1),
            restream_start_timeout: Duration::from_secs(self.restream_start_timeout),
            dial_timeout: Duration::from_secs(self.dial_timeout),
            read_timeout: Duration::from_secs(self.read_timeout),
            media_timeout: Duration::from_secs(self.media_timeout),
            keepalive_interval: Duration::from_secs(self.keepalive_interval.max(1)),
            keyframe_interval: Duration::from_millis(self.keyframe_interval_ms.max(1)),
            sync_max_attempts: self.sync_attempts.max(1),
            sync_backoff: Duration::from_secs(self.sync_backoff),
            ice_servers: self.ice_servers.clone(),
        }
    }

    fn gate(&self) -> Arc<dyn ConnectionGate> {
        match &self.auth_cookie {
            Some(cookie) => Arc::new(CookieTokenGate::new(cookie, self.auth_tokens.clone())),
            None => Arc::new(AllowAll),
        }
    }
}

/// Cancel `shutdown` once `interrupt` fires. Without a signal handler the
/// relay keeps running until stopped some other way.
async fn cancel_on_interrupt<F>(interrupt: F, shutdown: CancellationToken)
where
    F: Future<Output = std::io::Result<()>>,
{
    match interrupt.await {
        Ok(()) => {
            tracing::info!("shutting down");
            shutdown.cancel();
        }
        Err(e) => tracing::error!(error = %e, "cannot listen for ctrl-c, ignoring it"),
    }
}

#[tokio::main]
async fn main() -> ExitCode {
    tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")),
        )
        .init();

    let args = Args::parse();
    match run(args).await {
        Ok(()) => ExitCode::SUCCESS,
        Err(e) => {
            eprintln!("relay-server: {e}");
            ExitCode::FAILURE
        }
    }
}

async fn run(args: Args) -> relay::Result<()> {
    let config = args.relay_config();
    let listener = TcpListener::bind(&config.listen_addr).await?;
    let keyframe_interval = config.keyframe_interval;

    let shutdown = CancellationToken::new();
    let assets = Arc::new(DirectoryStore::new(&args.asset_dir));
    let state = AppState::new(config, assets, args.gate(), shutdown.clone());

    tokio::spawn(relay::keyframe::run(
        state.registry.clone(),
        keyframe_interval,
        shutdown.clone(),
    ));

    tokio::spawn(cancel_on_interrupt(tokio::signal::ctrl_c(), shutdown.clone()));

    tracing::info!(
        asset_dir = %args.asset_dir.display(),
        restream_ports = ?state.config.restream_ports,
        "relay starting"
    );
    relay::signaling::serve(state, listener).await
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn interrupt_cancels_shutdown() {
        let shutdown = CancellationToken::new();
        cancel_on_interrupt(std::future::ready(Ok(())), shutdown.clone()).await;
        assert!(shutdown.is_cancelled());
    }

    #[tokio::test]
    async fn failed_signal_handler_keeps_running() {
        let shutdown = CancellationToken::new();
        let failed = std::future::ready(Err(std::io::Error::other("no signal support")));
        cancel_on_interrupt(failed, shutdown.clone()).await;
        assert!(!shutdown.is_cancelled());
    }
}
