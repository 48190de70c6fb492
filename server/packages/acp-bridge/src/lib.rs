use std::io;
use std::net::{IpAddr, Ipv4Addr, SocketAddr};
use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;

use acp_bridge_error::BridgeError;
use thiserror::Error;
use tokio::sync::oneshot;
use tokio::task::JoinHandle;

use app::build_router;
use bridge::Bridge;
use provider::ProviderRegistry;

pub mod app;
pub mod bridge;
pub mod fs;
pub mod notifications;
pub mod permission;
pub mod provider;
pub mod sessions;
pub mod stream;
pub mod supervisor;
pub mod terminal;
pub mod transport;

pub const DEFAULT_PORT: u16 = 7591;
pub const DEFAULT_COMMANDS_WAIT: Duration = Duration::from_millis(1_500);
pub const REQUEST_TIMEOUT_ENV: &str = "ACP_BRIDGE_REQUEST_TIMEOUT_MS";
pub const COMMANDS_WAIT_ENV: &str = "ACP_BRIDGE_COMMANDS_WAIT_MS";

const STOP_GRACE: Duration = Duration::from_secs(5);

#[derive(Debug, Clone)]
pub struct BridgeConfig {
    pub host: String,
    pub port: u16,
    pub project_root: PathBuf,
    pub request_timeout: Duration,
    pub commands_wait: Duration,
    pub client_name: String,
    pub client_version: String,
}

impl Default for BridgeConfig {
    fn default() -> Self {
        Self {
            host: Ipv4Addr::LOCALHOST.to_string(),
            port: DEFAULT_PORT,
            project_root: std::env::current_dir().unwrap_or_else(|_| PathBuf::from(".")),
            request_timeout: transport::DEFAULT_REQUEST_TIMEOUT,
            commands_wait: DEFAULT_COMMANDS_WAIT,
            client_name: env!("CARGO_PKG_NAME").to_string(),
            client_version: env!("CARGO_PKG_VERSION").to_string(),
        }
    }
}

impl BridgeConfig {
    /// The listen address. Only loopback hosts are accepted.
    pub fn addr(&self) -> Result<SocketAddr, BridgeError> {
        let host = if self.host.eq_ignore_ascii_case("localhost") {
            "127.0.0.1"
        } else {
            self.host.as_str()
        };
        let ip: IpAddr = host.parse().map_err(|_| BridgeError::InvalidRequest {
            message: format!("invalid host `{}`", self.host),
        })?;
        if !ip.is_loopback() {
            return Err(BridgeError::InvalidRequest {
                message: format!("host `{}` is not a loopback address", self.host),
            });
        }
        Ok(SocketAddr::new(ip, self.port))
    }
}

pub fn duration_from_env_ms(var_name: &str, default: Duration) -> Duration {
    std::env::var(var_name)
        .ok()
        .and_then(|value| value.trim().parse::<u64>().ok())
        .filter(|value| *value > 0)
        .map(Duration::from_millis)
        .unwrap_or(default)
}

#[derive(Debug, Error)]
pub enum ServerError {
    #[error(transparent)]
    Bridge(#[from] BridgeError),
    #[error("failed to bind {addr}: {source}")]
    Bind {
        addr: SocketAddr,
        #[source]
        source: io::Error,
    },
    #[error("http server failed: {0}")]
    Serve(#[source] io::Error),
    #[error("http server task failed: {0}")]
    Join(#[from] tokio::task::JoinError),
}

/// A running bridge bound to its loopback port.
#[derive(Debug)]
pub struct BridgeServer {
    addr: SocketAddr,
    bridge: Arc<Bridge>,
    shutdown: Option<oneshot::Sender<()>>,
    task: JoinHandle<io::Result<()>>,
}

impl BridgeServer {
    pub async fn start(
        config: BridgeConfig,
        registry: ProviderRegistry,
    ) -> Result<Self, ServerError> {
        let addr = config.addr()?;
        let listener = tokio::net::TcpListener::bind(addr)
            .await
            .map_err(|source| ServerError::Bind { addr, source })?;
        let addr = listener
            .local_addr()
            .map_err(|source| ServerError::Bind { addr, source })?;

        let bridge = Arc::new(Bridge::new(config, registry));
        let app = build_router(bridge.clone());
        let (shutdown_tx, shutdown_rx) = oneshot::channel::<()>();

        tracing::info!(addr = %addr, "acp-bridge listening");
        let task = tokio::spawn(async move {
            axum::serve(listener, app)
                .with_graceful_shutdown(async move {
                    let _ = shutdown_rx.await;
                })
                .await
        });

        Ok(Self {
            addr,
            bridge,
            shutdown: Some(shutdown_tx),
            task,
        })
    }

    pub fn addr(&self) -> SocketAddr {
        self.addr
    }

    pub fn base_url(&self) -> String {
        format!("http://{}", self.addr)
    }

    pub fn bridge(&self) -> &Arc<Bridge> {
        &self.bridge
    }

    /// Stops accepting connections, then kills every agent and terminal.
    pub async fn stop(mut self) -> Result<(), ServerError> {
        if let Some(shutdown) = self.shutdown.take() {
            let _ = shutdown.send(());
        }
        self.bridge.shutdown().await;

        match tokio::time::timeout(STOP_GRACE, &mut self.task).await {
            Ok(joined) => joined?.map_err(ServerError::Serve),
            Err(_) => {
                tracing::warn!("connections still open after shutdown grace; aborting");
                self.task.abort();
                Ok(())
            }
        }
    }
}

/// Serves until ctrl-c.
pub async fn run_server(
    config: BridgeConfig,
    registry: ProviderRegistry,
) -> Result<(), ServerError> {
    let server = BridgeServer::start(config, registry).await?;
    let _ = tokio::signal::ctrl_c().await;
    tracing::info!("received ctrl-c");
    server.stop().await
}
