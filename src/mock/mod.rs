//! Loopback server speaking the subset of the hive protocol the harness drives.
//!
//! Used by the integration tests and the `hive-harness` binary so scenarios can
//! run without a deployed backend.

mod api;
mod hub;
mod router;
mod server;

use std::net::SocketAddr;

use log::{error, info};
use tokio::sync::mpsc;
use tokio::task::JoinHandle;

pub use hub::MALFORMED_JSON;
pub use server::{REST_PATH, WS_PATH};

use crate::error::{Error, Result};

use self::router::{Command, HubRequest, HubResponse, HubRouter};

/// Credentials the mock server accepts.
#[derive(Clone, Debug)]
pub struct MockConfig {
    pub tokens: Vec<String>,
    pub access_keys: Vec<String>,
    pub logins: Vec<(String, String)>,
    /// Pre-registered `(device id, device key)` pairs.
    pub devices: Vec<(String, String)>,
    /// Closes the first session that sends this many frames with code 1011.
    pub close_once_after: Option<usize>,
}

/// Counters exposed for assertions.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
pub struct MockStats {
    pub sessions: usize,
    pub subscriptions: usize,
    pub unsubscribes: u64,
}

impl Default for MockConfig {
    fn default() -> Self {
        MockConfig {
            tokens: vec!["test-token".to_string()],
            access_keys: vec!["test-access-key".to_string()],
            logins: vec![("admin".to_string(), "admin_pass".to_string())],
            devices: Vec::new(),
            close_once_after: None,
        }
    }
}

impl MockConfig {
    pub fn with_device(mut self, id: &str, key: &str) -> Self {
        self.devices.push((id.to_string(), key.to_string()));
        self
    }

    pub fn close_once_after(mut self, frames: usize) -> Self {
        self.close_once_after = Some(frames);
        self
    }
}

pub struct MockServer {
    addr: SocketAddr,
    hub: HubRouter,
    handle: JoinHandle<()>,
}

impl MockServer {
    /// Binds to an ephemeral loopback port.
    pub async fn start(config: MockConfig) -> Result<Self> {
        Self::bind("127.0.0.1:0", config).await
    }

    pub async fn bind(addr: &str, config: MockConfig) -> Result<Self> {
        let listener = std::net::TcpListener::bind(addr)
            .map_err(|e| Error::Transport(format!("bind {}: {}", addr, e)))?;
        listener
            .set_nonblocking(true)
            .map_err(|e| Error::Transport(e.to_string()))?;
        let addr = listener
            .local_addr()
            .map_err(|e| Error::Transport(e.to_string()))?;

        let (tx, rx) = mpsc::channel::<Command>(1024);
        let hub = HubRouter::new(tx, rx, config);

        let server = axum::Server::from_tcp(listener)
            .map_err(|e| Error::Transport(e.to_string()))?
            .serve(server::app(hub.clone()).into_make_service_with_connect_info::<SocketAddr>());

        info!("Listening on: {}", addr);
        let handle = tokio::spawn(async move {
            if let Err(e) = server.await {
                error!("Server exited unexpectedly: {}", e);
            }
        });

        Ok(MockServer { addr, hub, handle })
    }

    pub fn addr(&self) -> SocketAddr {
        self.addr
    }

    pub fn ws_url(&self) -> String {
        format!("ws://{}{}", self.addr, WS_PATH)
    }

    pub fn rest_url(&self) -> String {
        format!("http://{}{}", self.addr, REST_PATH)
    }

    pub async fn stats(&self) -> Result<MockStats> {
        match self.hub.send_command(HubRequest::Stats).await {
            Ok(HubResponse::Stats(stats)) => Ok(stats),
            Ok(other) => Err(Error::Transport(format!("unexpected hub response: {:?}", other))),
            Err(e) => Err(Error::Transport(e)),
        }
    }

    /// Serves until the listener fails.
    pub async fn wait(mut self) {
        if let Err(e) = (&mut self.handle).await {
            error!("Server task failed: {}", e);
        }
    }
}

impl Drop for MockServer {
    fn drop(&mut self) {
        self.handle.abort();
    }
}
