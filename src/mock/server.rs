use std::net::SocketAddr;

use axum::{
    extract::{
        ws::{Message as WebSocketMessage, WebSocket},
        ConnectInfo, Extension, WebSocketUpgrade,
    },
    http::HeaderMap,
    response::IntoResponse,
    routing::get,
    Router,
};
use futures_util::{future, pin_mut, StreamExt, TryStreamExt};
use log::{debug, error, info, warn};

use crate::auth::{DEVICE_ID_HEADER, DEVICE_KEY_HEADER};

use super::api::rest_routes;
use super::router::{HubRequest, HubRouter};

pub const WS_PATH: &str = "/api/websocket";
pub const REST_PATH: &str = "/api/rest";

pub fn app(hub: HubRouter) -> Router {
    Router::new()
        .route(WS_PATH, get(ws_handler))
        .nest(REST_PATH, rest_routes())
        .layer(Extension(hub))
}

fn device_headers(headers: &HeaderMap) -> Option<(String, String)> {
    let id = headers.get(DEVICE_ID_HEADER)?.to_str().ok()?;
    let key = headers.get(DEVICE_KEY_HEADER)?.to_str().ok()?;

    Some((id.to_string(), key.to_string()))
}

async fn ws_handler(
    ws: WebSocketUpgrade,
    ConnectInfo(addr): ConnectInfo<SocketAddr>,
    Extension(hub): Extension<HubRouter>,
    headers: HeaderMap,
) -> impl IntoResponse {
    info!("New connection from: {}", addr);
    let device = device_headers(&headers);

    ws.on_upgrade(move |socket| async move {
        if let Err(e) = handle_connection(socket, addr, device, hub).await {
            error!("Connection {} ended with error: {}", addr, e);
        }
    })
}

async fn handle_connection(
    stream: WebSocket,
    addr: SocketAddr,
    device: Option<(String, String)>,
    hub: HubRouter,
) -> Result<(), String> {
    let (sender, receiver) = futures_channel::mpsc::unbounded::<WebSocketMessage>();

    hub.send_command(HubRequest::Connect {
        addr,
        sender,
        device,
    })
    .await?;

    let (write, read) = stream.split();

    let handle_incoming = read.try_for_each(|msg| {
        let hub = hub.clone();

        async move {
            match msg {
                WebSocketMessage::Text(text) => {
                    if let Err(e) = hub.notify(HubRequest::Frame { addr, text }).await {
                        error!("Failed to forward frame: {}", e);
                    }
                }
                WebSocketMessage::Binary(_) => warn!("Received a non-text message"),
                WebSocketMessage::Close(frame) => debug!("{} closing: {:?}", addr, frame),
                _ => {}
            }

            Ok(())
        }
    });

    let receive_from_hub = receiver.map(Ok).forward(write);

    pin_mut!(handle_incoming, receive_from_hub);
    future::select(handle_incoming, receive_from_hub).await;

    hub.send_command(HubRequest::Disconnect { addr }).await?;

    Ok(())
}
