use std::net::SocketAddr;

use serde_json::Value;
use tokio::sync::mpsc::{Receiver, Sender};
use tokio::sync::oneshot::Sender as OneshotSender;

use super::hub::{Hub, Sender as SessionSender};
use super::{MockConfig, MockStats};

pub enum HubRequest {
    Connect {
        addr: SocketAddr,
        sender: SessionSender,
        device: Option<(String, String)>,
    },
    Frame {
        addr: SocketAddr,
        text: String,
    },
    Disconnect {
        addr: SocketAddr,
    },
    PutDevice {
        token: Option<String>,
        id: String,
        body: Value,
    },
    GetDevice {
        token: Option<String>,
        id: String,
    },
    Stats,
}

pub struct Command {
    pub request: HubRequest,
    pub result: Option<OneshotSender<HubResult>>,
}

pub type HubResult = Result<HubResponse, String>;

#[derive(Debug, PartialEq)]
pub enum HubResponse {
    Ok,
    Unauthorized,
    Device(Option<Value>),
    Stats(MockStats),
}

/// Handle to the hub task. A wrapper around the MPSC sender feeding it.
#[derive(Clone)]
pub struct HubRouter {
    sender: Sender<Command>,
}

impl HubRouter {
    pub fn new(tx: Sender<Command>, rx: Receiver<Command>, config: MockConfig) -> Self {
        let hub = Hub::new(rx, config);
        hub.run();

        HubRouter { sender: tx }
    }

    pub async fn send_command(&self, request: HubRequest) -> HubResult {
        let (result, rx) = tokio::sync::oneshot::channel::<HubResult>();
        let cmd = Command {
            request,
            result: Some(result),
        };

        self.sender
            .send(cmd)
            .await
            .map_err(|_| "hub is gone".to_string())?;

        rx.await.map_err(|e| e.to_string())?
    }

    /// Queues a request without waiting for the hub to process it.
    pub async fn notify(&self, request: HubRequest) -> HubResult {
        self.sender
            .send(Command {
                request,
                result: None,
            })
            .await
            .map_err(|_| "hub is gone".to_string())?;

        Ok(HubResponse::Ok)
    }
}
