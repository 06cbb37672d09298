use std::time::Duration;

use log::{debug, warn};
use serde_json::{json, Value};

use crate::connection::{ConnectOptions, Connection};
use crate::error::{Error, Result};
use crate::message::Message;

pub const DEVICE_ID_HEADER: &str = "Auth-DeviceID";
pub const DEVICE_KEY_HEADER: &str = "Auth-DeviceKey";

#[derive(Clone, Debug, PartialEq, Eq)]
pub enum Credentials {
    Token(String),
    Login { login: String, password: String },
    AccessKey(String),
    Device { device_id: String, device_key: String },
}

impl Credentials {
    /// Fields merged into the `authenticate` frame.
    pub fn fields(&self) -> Value {
        match self {
            Credentials::Token(token) => json!({ "token": token }),
            Credentials::Login { login, password } => {
                json!({ "login": login, "password": password })
            }
            Credentials::AccessKey(key) => json!({ "accessKey": key }),
            Credentials::Device {
                device_id,
                device_key,
            } => json!({ "deviceId": device_id, "deviceKey": device_key }),
        }
    }

    /// Handshake headers carried by device identities.
    pub fn headers(&self) -> Vec<(String, String)> {
        match self {
            Credentials::Device {
                device_id,
                device_key,
            } => vec![
                (DEVICE_ID_HEADER.to_string(), device_id.clone()),
                (DEVICE_KEY_HEADER.to_string(), device_key.clone()),
            ],
            _ => Vec::new(),
        }
    }
}

/// Sends `authenticate` on an open connection and waits for the answer.
///
/// A rejected authentication surfaces the server's frame as
/// [`Error::Protocol`]. The connection is left open either way; callers
/// decide whether to close it.
pub async fn authenticate(
    conn: &Connection,
    credentials: &Credentials,
    timeout: Duration,
) -> Result<Message> {
    debug!("[{}] authenticating", conn.id());

    match conn.request("authenticate", credentials.fields(), timeout).await {
        Ok(response) => Ok(response),
        Err(e) => {
            warn!("[{}] authentication failed: {}", conn.id(), e);
            Err(e)
        }
    }
}

/// Connects and authenticates in one step.
///
/// If authentication fails the freshly opened connection is closed, since
/// nobody else holds it.
pub async fn connect_authenticated(
    url: &str,
    credentials: &Credentials,
    mut options: ConnectOptions,
    timeout: Duration,
) -> Result<Connection> {
    options.headers.extend(credentials.headers());

    let conn = Connection::connect(url, options).await?;

    match authenticate(&conn, credentials, timeout).await {
        Ok(_) => Ok(conn),
        Err(e) => {
            conn.close();
            Err(e)
        }
    }
}

/// True when `error` is the server refusing the credentials.
pub fn is_rejection(error: &Error) -> bool {
    matches!(error, Error::Protocol { code: Some(401 | 403), .. })
}
