//! wirescript robot.
//!
//! Production glue around [`wirescript_core`]: a TCP control listener that
//! speaks the control protocol, a [`TcpProvider`] that gives scripts real
//! sockets, and a session runtime that executes [`ControlSession`] actions.
//!
//! # Components
//!
//! - [`Robot`]: accepts controller connections and serves each in its own
//!   task
//! - [`drive_session`]: runtime for one controller connection, usable over
//!   any byte stream
//! - [`TcpProvider`]: `tcp`/`http` channel provider
//!
//! [`ControlSession`]: wirescript_core::ControlSession

#![forbid(unsafe_code)]
#![warn(missing_docs)]

mod error;
mod scripts;
mod session;
mod transport;

use std::{net::SocketAddr, path::PathBuf, sync::Arc};

pub use error::ServerError;
pub use scripts::load_script;
pub use session::drive_session;
use tokio::net::TcpListener;
pub use transport::{TcpProvider, socket_address};
use wirescript_core::engine::ChannelProvider;

/// Default control listener address.
pub const DEFAULT_CONTROL_ADDRESS: &str = "127.0.0.1:11642";

/// Robot configuration.
#[derive(Debug, Clone)]
pub struct RobotConfig {
    /// Address the control listener binds to
    pub control_address: String,
    /// Directory that PREPARE `name` headers are resolved against
    pub script_root: Option<PathBuf>,
}

impl Default for RobotConfig {
    fn default() -> Self {
        Self { control_address: DEFAULT_CONTROL_ADDRESS.to_string(), script_root: None }
    }
}

/// Control-protocol server.
pub struct Robot {
    listener: TcpListener,
    config: Arc<RobotConfig>,
    provider: Arc<dyn ChannelProvider>,
}

impl Robot {
    /// Bind the control listener. Scripts get real TCP channels.
    pub async fn bind(config: RobotConfig) -> Result<Self, ServerError> {
        Self::bind_with_provider(config, Arc::new(TcpProvider::new())).await
    }

    /// Bind the control listener with a custom channel provider.
    pub async fn bind_with_provider(
        config: RobotConfig,
        provider: Arc<dyn ChannelProvider>,
    ) -> Result<Self, ServerError> {
        if let Some(root) = &config.script_root {
            if !root.is_dir() {
                let message = format!("script root {} is not a directory", root.display());
                return Err(ServerError::Config(message));
            }
        }
        let listener = TcpListener::bind(&config.control_address).await.map_err(|err| {
            ServerError::Config(format!("cannot bind {}: {err}", config.control_address))
        })?;
        Ok(Self { listener, config: Arc::new(config), provider })
    }

    /// Bound control address.
    pub fn local_addr(&self) -> Result<SocketAddr, ServerError> {
        Ok(self.listener.local_addr()?)
    }

    /// Accept controller connections until the listener fails.
    pub async fn run(self) -> Result<(), ServerError> {
        tracing::info!("Robot listening on {}", self.local_addr()?);

        loop {
            let (stream, peer) = self.listener.accept().await?;
            tracing::info!("Controller connected from {peer}");

            let provider = Arc::clone(&self.provider);
            let config = Arc::clone(&self.config);
            tokio::spawn(async move {
                if let Err(e) = drive_session(stream, provider, config).await {
                    tracing::error!("Session error: {}", e);
                }
                tracing::info!("Controller {peer} disconnected");
            });
        }
    }
}
