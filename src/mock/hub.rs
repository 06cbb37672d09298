use std::borrow::Cow;
use std::collections::HashMap;
use std::net::SocketAddr;
use std::time::{SystemTime, UNIX_EPOCH};

use axum::extract::ws::{CloseFrame, Message as WebSocketMessage};
use futures_channel::mpsc::UnboundedSender;
use log::{debug, info, warn};
use serde_json::{json, Map, Value};
use tokio::sync::mpsc::Receiver;

use super::router::{Command, HubRequest, HubResponse, HubResult};
use super::{MockConfig, MockStats};

pub type Sender = UnboundedSender<WebSocketMessage>;

pub const MALFORMED_JSON: &str = "Malformed Json received.";

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
enum Kind {
    Command,
    Notification,
}

impl Kind {
    fn from_action(action: &str) -> Option<(Kind, &str)> {
        let (prefix, verb) = action.split_once('/')?;
        let kind = match prefix {
            "command" => Kind::Command,
            "notification" => Kind::Notification,
            _ => return None,
        };
        Some((kind, verb))
    }

    fn prefix(self) -> &'static str {
        match self {
            Kind::Command => "command",
            Kind::Notification => "notification",
        }
    }
}

struct Session {
    sender: Sender,
    authenticated: bool,
    frames: usize,
}

struct SubscriptionEntry {
    addr: SocketAddr,
    kind: Kind,
    device_ids: Vec<String>,
    names: Vec<String>,
}

impl SubscriptionEntry {
    fn accepts(&self, kind: Kind, device_id: &str, name: &str) -> bool {
        self.kind == kind
            && (self.device_ids.is_empty() || self.device_ids.iter().any(|d| d == device_id))
            && (self.names.is_empty() || self.names.iter().any(|n| n == name))
    }
}

/// A protocol-level failure answered to the client as `{code, error}`.
struct Rejection {
    code: u16,
    error: String,
}

impl Rejection {
    fn new(code: u16, error: &str) -> Self {
        Rejection {
            code,
            error: error.to_string(),
        }
    }
}

type Reply = Result<Map<String, Value>, Rejection>;

/// Owns every session, subscription, device and command of the mock server.
/// Runs as a single task fed through [`super::router::HubRouter`].
pub struct Hub {
    receiver: Receiver<Command>,
    config: MockConfig,
    sessions: HashMap<SocketAddr, Session>,
    subscriptions: HashMap<u64, SubscriptionEntry>,
    devices: HashMap<String, Value>,
    commands: HashMap<u64, Value>,
    next_subscription_id: u64,
    next_record_id: u64,
    unsubscribes: u64,
    dropped_session: bool,
}

fn now_millis() -> u64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .map(|d| d.as_millis() as u64)
        .unwrap_or_default()
}

fn string_list(fields: &Map<String, Value>, single: &str, plural: &str) -> Vec<String> {
    let mut out: Vec<String> = fields
        .get(plural)
        .and_then(Value::as_array)
        .map(|items| {
            items
                .iter()
                .filter_map(Value::as_str)
                .map(str::to_string)
                .collect()
        })
        .unwrap_or_default();

    if let Some(single) = fields.get(single).and_then(Value::as_str) {
        out.push(single.to_string());
    }

    out
}

impl Hub {
    pub fn new(rx: Receiver<Command>, config: MockConfig) -> Self {
        let devices = config
            .devices
            .iter()
            .map(|(id, key)| (id.clone(), json!({ "id": id, "key": key })))
            .collect();

        Hub {
            receiver: rx,
            config,
            sessions: HashMap::new(),
            subscriptions: HashMap::new(),
            devices,
            commands: HashMap::new(),
            next_subscription_id: 0,
            next_record_id: 0,
            unsubscribes: 0,
            dropped_session: false,
        }
    }

    pub fn run(mut self) {
        tokio::spawn(async move {
            while let Some(cmd) = self.receiver.recv().await {
                let Command { request, result } = cmd;

                let response: HubResult = match request {
                    HubRequest::Connect {
                        addr,
                        sender,
                        device,
                    } => self.handle_connect(addr, sender, device),
                    HubRequest::Frame { addr, text } => self.handle_frame(addr, &text),
                    HubRequest::Disconnect { addr } => self.handle_disconnect(addr),
                    HubRequest::PutDevice { token, id, body } => {
                        self.handle_put_device(token, id, body)
                    }
                    HubRequest::GetDevice { token, id } => self.handle_get_device(token, id),
                    HubRequest::Stats => Ok(HubResponse::Stats(MockStats {
                        sessions: self.sessions.len(),
                        subscriptions: self.subscriptions.len(),
                        unsubscribes: self.unsubscribes,
                    })),
                };

                if let Some(result) = result {
                    let _ = result.send(response);
                }
            }
        });
    }

    fn send_to(&self, addr: SocketAddr, frame: Value) {
        if let Some(session) = self.sessions.get(&addr) {
            if let Err(e) = session.sender.unbounded_send(WebSocketMessage::Text(frame.to_string())) {
                debug!("Failed to send to {}: {}", addr, e);
            }
        }
    }

    fn device_key_matches(&self, id: &str, key: &str) -> bool {
        self.devices
            .get(id)
            .and_then(|d| d.get("key"))
            .and_then(Value::as_str)
            == Some(key)
    }

    // Session handlers

    fn handle_connect(
        &mut self,
        addr: SocketAddr,
        sender: Sender,
        device: Option<(String, String)>,
    ) -> HubResult {
        let authenticated = match device {
            Some((ref id, ref key)) => self.device_key_matches(id, key),
            None => false,
        };

        info!("Session opened for {} (authenticated: {})", addr, authenticated);
        self.sessions.insert(
            addr,
            Session {
                sender,
                authenticated,
                frames: 0,
            },
        );

        Ok(HubResponse::Ok)
    }

    fn handle_disconnect(&mut self, addr: SocketAddr) -> HubResult {
        self.sessions.remove(&addr);
        self.subscriptions.retain(|_, sub| sub.addr != addr);
        info!("Session closed for {}", addr);

        Ok(HubResponse::Ok)
    }

    fn handle_frame(&mut self, addr: SocketAddr, text: &str) -> HubResult {
        let fields = match serde_json::from_str::<Value>(text) {
            Ok(Value::Object(fields)) => fields,
            _ => {
                warn!("Received an invalid message from {}", addr);
                self.send_to(addr, json!({ "code": 400, "error": MALFORMED_JSON }));
                return Ok(HubResponse::Ok);
            }
        };

        let action = fields
            .get("action")
            .and_then(Value::as_str)
            .unwrap_or_default()
            .to_string();
        let request_id = fields.get("requestId").cloned();

        let reply = self.dispatch(addr, &action, &fields);

        let mut frame = match reply {
            Ok(mut body) => {
                body.insert("status".into(), json!("success"));
                body
            }
            Err(rejection) => {
                let mut body = Map::new();
                body.insert("status".into(), json!("error"));
                body.insert("code".into(), json!(rejection.code));
                body.insert("error".into(), json!(rejection.error));
                body
            }
        };
        frame.insert("action".into(), json!(action));
        if let Some(request_id) = request_id {
            frame.insert("requestId".into(), request_id);
        }

        self.send_to(addr, Value::Object(frame));
        self.maybe_drop_session(addr);
        Ok(HubResponse::Ok)
    }

    /// Kills the first session reaching `close_once_after` frames with an
    /// internal-error close, once per server.
    fn maybe_drop_session(&mut self, addr: SocketAddr) {
        let Some(limit) = self.config.close_once_after else {
            return;
        };
        if self.dropped_session {
            return;
        }
        let reached = match self.sessions.get_mut(&addr) {
            Some(session) => {
                session.frames += 1;
                session.frames >= limit
            }
            None => false,
        };
        if !reached {
            return;
        }

        self.dropped_session = true;
        warn!("Dropping session {} after {} frames", addr, limit);
        if let Some(session) = self.sessions.remove(&addr) {
            let _ = session.sender.unbounded_send(WebSocketMessage::Close(Some(CloseFrame {
                code: 1011,
                reason: Cow::from("mock session dropped"),
            })));
        }
        self.subscriptions.retain(|_, sub| sub.addr != addr);
    }

    fn dispatch(&mut self, addr: SocketAddr, action: &str, fields: &Map<String, Value>) -> Reply {
        if action.is_empty() {
            return Err(Rejection::new(400, "Action is required"));
        }

        if action == "authenticate" {
            return self.handle_authenticate(addr, fields);
        }

        let authenticated = self
            .sessions
            .get(&addr)
            .map(|s| s.authenticated)
            .unwrap_or(false);
        if !authenticated {
            return Err(Rejection::new(401, "Unauthorized"));
        }

        if action == "server/info" {
            let mut body = Map::new();
            body.insert(
                "info".into(),
                json!({ "apiVersion": "mock", "serverTimestamp": now_millis() }),
            );
            return Ok(body);
        }

        match Kind::from_action(action) {
            Some((kind, "subscribe")) => self.handle_subscribe(addr, kind, fields),
            Some((_, "unsubscribe")) => self.handle_unsubscribe(addr, fields),
            Some((kind, "insert")) => self.handle_insert(kind, fields),
            Some((Kind::Command, "update")) => self.handle_command_update(fields),
            _ => Err(Rejection::new(404, "Unsupported action")),
        }
    }

    // Message handlers

    fn handle_authenticate(&mut self, addr: SocketAddr, fields: &Map<String, Value>) -> Reply {
        let text = |key: &str| fields.get(key).and_then(Value::as_str);

        let accepted = if let Some(token) = text("token") {
            self.config.tokens.iter().any(|t| t == token)
        } else if let Some(key) = text("accessKey") {
            self.config.access_keys.iter().any(|k| k == key)
        } else if let (Some(login), Some(password)) = (text("login"), text("password")) {
            self.config
                .logins
                .iter()
                .any(|(l, p)| l == login && p == password)
        } else if let (Some(id), Some(key)) = (text("deviceId"), text("deviceKey")) {
            self.device_key_matches(id, key)
        } else {
            false
        };

        if !accepted {
            return Err(Rejection::new(401, "Invalid credentials"));
        }

        if let Some(session) = self.sessions.get_mut(&addr) {
            session.authenticated = true;
        }

        Ok(Map::new())
    }

    fn handle_subscribe(
        &mut self,
        addr: SocketAddr,
        kind: Kind,
        fields: &Map<String, Value>,
    ) -> Reply {
        self.next_subscription_id += 1;
        let id = self.next_subscription_id;

        self.subscriptions.insert(
            id,
            SubscriptionEntry {
                addr,
                kind,
                device_ids: string_list(fields, "deviceId", "deviceIds"),
                names: string_list(fields, "name", "names"),
            },
        );
        debug!("{} subscribed to {} ({})", addr, kind.prefix(), id);

        let mut body = Map::new();
        body.insert("subscriptionId".into(), json!(id));
        Ok(body)
    }

    fn handle_unsubscribe(&mut self, addr: SocketAddr, fields: &Map<String, Value>) -> Reply {
        let id = fields.get("subscriptionId").and_then(Value::as_u64);

        match id {
            Some(id) if self.subscriptions.get(&id).map(|s| s.addr) == Some(addr) => {
                self.subscriptions.remove(&id);
                self.unsubscribes += 1;
                Ok(Map::new())
            }
            _ => Err(Rejection::new(404, "Subscription not found")),
        }
    }

    fn handle_insert(&mut self, kind: Kind, fields: &Map<String, Value>) -> Reply {
        let prefix = kind.prefix();
        let device_id = fields
            .get("deviceId")
            .and_then(Value::as_str)
            .ok_or_else(|| Rejection::new(400, "deviceId is required"))?
            .to_string();
        let mut record = fields
            .get(prefix)
            .and_then(Value::as_object)
            .cloned()
            .ok_or_else(|| Rejection::new(400, &format!("{} is required", prefix)))?;
        let name = record
            .get(prefix)
            .and_then(Value::as_str)
            .ok_or_else(|| Rejection::new(400, &format!("{} name is required", prefix)))?
            .to_string();

        self.next_record_id += 1;
        let id = self.next_record_id;
        let timestamp = now_millis();

        record.insert("id".into(), json!(id));
        record.insert("deviceId".into(), json!(device_id));
        record.insert("timestamp".into(), json!(timestamp));
        let record = Value::Object(record);

        if kind == Kind::Command {
            self.commands.insert(id, record.clone());
        }

        let push_action = format!("{}/insert", prefix);
        let targets: Vec<(u64, SocketAddr)> = self
            .subscriptions
            .iter()
            .filter(|(_, sub)| sub.accepts(kind, &device_id, &name))
            .map(|(sub_id, sub)| (*sub_id, sub.addr))
            .collect();

        for (subscription_id, addr) in targets {
            self.send_to(
                addr,
                json!({
                    "action": push_action,
                    "subscriptionId": subscription_id,
                    prefix: record,
                }),
            );
        }

        let mut body = Map::new();
        body.insert(prefix.into(), json!({ "id": id, "timestamp": timestamp }));
        Ok(body)
    }

    fn handle_command_update(&mut self, fields: &Map<String, Value>) -> Reply {
        let id = fields
            .get("commandId")
            .and_then(Value::as_u64)
            .ok_or_else(|| Rejection::new(400, "commandId is required"))?;

        let command = self
            .commands
            .get_mut(&id)
            .and_then(Value::as_object_mut)
            .ok_or_else(|| Rejection::new(404, "Command not found"))?;

        if let Some(update) = fields.get("command").and_then(Value::as_object) {
            for (key, value) in update {
                command.insert(key.clone(), value.clone());
            }
        }

        Ok(Map::new())
    }

    // REST handlers

    fn handle_put_device(&mut self, token: Option<String>, id: String, body: Value) -> HubResult {
        if !self.token_valid(token.as_deref()) {
            return Ok(HubResponse::Unauthorized);
        }

        let mut device = match body {
            Value::Object(map) => map,
            _ => Map::new(),
        };
        device.insert("id".into(), json!(id));

        info!("Registered device {}", id);
        self.devices.insert(id, Value::Object(device));

        Ok(HubResponse::Ok)
    }

    fn handle_get_device(&self, token: Option<String>, id: String) -> HubResult {
        if !self.token_valid(token.as_deref()) {
            return Ok(HubResponse::Unauthorized);
        }

        Ok(HubResponse::Device(self.devices.get(&id).cloned()))
    }

    fn token_valid(&self, token: Option<&str>) -> bool {
        match token {
            Some(token) => self.config.tokens.iter().any(|t| t == token),
            None => false,
        }
    }
}
