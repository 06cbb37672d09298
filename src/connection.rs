use std::fmt;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::{Arc, Mutex, MutexGuard, PoisonError, Weak};
use std::time::Duration;

use futures_util::stream::SplitStream;
use futures_util::StreamExt;
use log::{debug, info, trace, warn};
use serde_json::{json, Value};
use tokio::net::TcpStream;
use tokio::sync::mpsc::{unbounded_channel, UnboundedSender};
use tokio::sync::{broadcast, watch};
use tokio::task::JoinHandle;
use tokio_stream::wrappers::UnboundedReceiverStream;
use tokio_tungstenite::{connect_async, MaybeTlsStream, WebSocketStream};
use tungstenite::client::IntoClientRequest;
use tungstenite::http::{HeaderName, HeaderValue};
use tungstenite::Message as WebSocketMessage;

use crate::correlator::{Correlator, Expectation, ExpectationMode};
use crate::error::{Error, Result};
use crate::ids::RequestIds;
use crate::message::Message;
use crate::metrics::Metrics;

pub const DEFAULT_TIMEOUT: Duration = Duration::from_millis(5000);

type Reader = SplitStream<WebSocketStream<MaybeTlsStream<TcpStream>>>;

/// Invoked on transport errors and abnormal closes.
pub type ErrorHook = Arc<dyn Fn(&Error, &Connection) + Send + Sync>;

static NEXT_CONNECTION_ID: AtomicU64 = AtomicU64::new(1);

#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash)]
pub struct ConnectionId(u64);

impl ConnectionId {
    #[cfg(test)]
    pub(crate) fn from_raw(id: u64) -> Self {
        ConnectionId(id)
    }
}

impl fmt::Display for ConnectionId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "conn-{}", self.0)
    }
}

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum ConnectionState {
    Connecting,
    Open,
    Closed,
    Errored,
}

impl ConnectionState {
    pub fn is_terminal(self) -> bool {
        matches!(self, ConnectionState::Closed | ConnectionState::Errored)
    }
}

/// What `send` does once the socket is gone.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Default)]
pub enum SendPolicy {
    /// Fail with [`Error::Closed`].
    #[default]
    Strict,
    /// Silently drop the frame, so late timer ticks cannot fail.
    Lenient,
}

#[derive(Clone)]
pub struct ConnectOptions {
    pub ids: Arc<RequestIds>,
    pub expectations: ExpectationMode,
    pub send_policy: SendPolicy,
    /// Extra handshake headers, e.g. device identity.
    pub headers: Vec<(String, String)>,
    pub on_error: Option<ErrorHook>,
    pub frame_capacity: usize,
}

impl Default for ConnectOptions {
    fn default() -> Self {
        ConnectOptions {
            ids: RequestIds::global(),
            expectations: ExpectationMode::default(),
            send_policy: SendPolicy::default(),
            headers: Vec::new(),
            on_error: None,
            frame_capacity: 1024,
        }
    }
}

impl ConnectOptions {
    /// Options used by simulated load clients: pipelined waits, lenient sends.
    pub fn load() -> Self {
        ConnectOptions {
            expectations: ExpectationMode::Queue,
            send_policy: SendPolicy::Lenient,
            ..Default::default()
        }
    }

    pub fn with_ids(mut self, ids: Arc<RequestIds>) -> Self {
        self.ids = ids;
        self
    }

    pub fn with_header(mut self, name: &str, value: &str) -> Self {
        self.headers.push((name.to_string(), value.to_string()));
        self
    }

    pub fn on_error<F>(mut self, hook: F) -> Self
    where
        F: Fn(&Error, &Connection) + Send + Sync + 'static,
    {
        self.on_error = Some(Arc::new(hook));
        self
    }
}

struct Shared {
    id: ConnectionId,
    url: String,
    ids: Arc<RequestIds>,
    send_policy: SendPolicy,
    correlator: Arc<Correlator>,
    outgoing: Mutex<Option<UnboundedSender<WebSocketMessage>>>,
    state: watch::Sender<ConnectionState>,
    frames: broadcast::Sender<Message>,
    closing: AtomicBool,
    reader: Mutex<Option<JoinHandle<()>>>,
    on_error: Option<ErrorHook>,
}

impl Metrics for Shared {}

impl Shared {
    fn outgoing(&self) -> MutexGuard<'_, Option<UnboundedSender<WebSocketMessage>>> {
        self.outgoing.lock().unwrap_or_else(PoisonError::into_inner)
    }

    /// Moves to `next` unless the state is already terminal. Returns the
    /// state left behind, or `None` when nothing changed.
    fn set_state(&self, next: ConnectionState) -> Option<ConnectionState> {
        let mut previous = None;
        self.state.send_if_modified(|state| {
            if state.is_terminal() || *state == next {
                return false;
            }
            previous = Some(std::mem::replace(state, next));
            true
        });

        if let Some(previous) = previous {
            debug!("[{}] {:?} -> {:?}", self.id, previous, next);
            if previous == ConnectionState::Open {
                self.decrement_open_connections();
            }
            if next == ConnectionState::Open {
                self.increment_open_connections();
            }
        }
        previous
    }
}

/// One live WebSocket to the server.
///
/// Cheap to clone; all clones share the same socket, expectation registry and
/// state.
#[derive(Clone)]
pub struct Connection {
    inner: Arc<Shared>,
}

impl fmt::Debug for Connection {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Connection")
            .field("id", &self.inner.id)
            .field("url", &self.inner.url)
            .field("state", &self.state())
            .finish_non_exhaustive()
    }
}

impl Connection {
    /// Opens the socket. Resolves once the WebSocket handshake completed.
    pub async fn connect(url: &str, options: ConnectOptions) -> Result<Connection> {
        let (state, _) = watch::channel(ConnectionState::Connecting);
        let (frames, _) = broadcast::channel(options.frame_capacity.max(1));

        let shared = Arc::new(Shared {
            id: ConnectionId(NEXT_CONNECTION_ID.fetch_add(1, Ordering::Relaxed)),
            url: url.to_string(),
            ids: options.ids,
            send_policy: options.send_policy,
            correlator: Arc::new(Correlator::new(options.expectations)),
            outgoing: Mutex::new(None),
            state,
            frames,
            closing: AtomicBool::new(false),
            reader: Mutex::new(None),
            on_error: options.on_error,
        });
        let conn = Connection { inner: shared };

        match Self::open_socket(url, &options.headers).await {
            Ok(stream) => {
                conn.start(stream);
                info!("[{}] connected to {}", conn.id(), url);
                Ok(conn)
            }
            Err(e) => {
                warn!("[{}] failed to connect to {}: {}", conn.id(), url, e);
                conn.fail(e.clone());
                Err(e)
            }
        }
    }

    async fn open_socket(
        url: &str,
        headers: &[(String, String)],
    ) -> Result<WebSocketStream<MaybeTlsStream<TcpStream>>> {
        let mut request = url.into_client_request()?;

        for (name, value) in headers {
            let name = HeaderName::from_bytes(name.as_bytes())
                .map_err(|e| Error::Config(format!("bad header name {}: {}", name, e)))?;
            let value = HeaderValue::from_str(value)
                .map_err(|e| Error::Config(format!("bad header value for {}: {}", name, e)))?;
            request.headers_mut().insert(name, value);
        }

        let (stream, _) = connect_async(request).await?;
        Ok(stream)
    }

    /// Splits the socket and spawns the writer and reader tasks.
    fn start(&self, stream: WebSocketStream<MaybeTlsStream<TcpStream>>) {
        let (sender, receiver) = unbounded_channel::<WebSocketMessage>();
        let (write, read) = stream.split();

        *self.inner.outgoing() = Some(sender);
        self.inner.set_state(ConnectionState::Open);

        let id = self.id();
        let forward_outgoing = UnboundedReceiverStream::new(receiver).map(Ok).forward(write);
        tokio::spawn(async move {
            if let Err(e) = forward_outgoing.await {
                debug!("[{}] writer stopped: {}", id, e);
            }
        });

        let reader = tokio::spawn(Self::read_frames(Arc::downgrade(&self.inner), read));
        *self
            .inner
            .reader
            .lock()
            .unwrap_or_else(PoisonError::into_inner) = Some(reader);
    }

    async fn read_frames(weak: Weak<Shared>, mut read: Reader) {
        let outcome = loop {
            let next = read.next().await;

            let Some(shared) = weak.upgrade() else {
                return;
            };

            match next {
                Some(Ok(WebSocketMessage::Text(text))) => {
                    shared.increment_frames_received();
                    trace!("<- [{}] {}", shared.id, text);

                    match text.parse::<Message>() {
                        Ok(frame) => {
                            shared.correlator.deliver(&frame);
                            // No subscribers is fine.
                            let _ = shared.frames.send(frame);
                        }
                        Err(e) => warn!("[{}] received an invalid frame: {}", shared.id, e),
                    }
                }
                Some(Ok(WebSocketMessage::Close(frame))) => {
                    debug!("[{}] server closed the socket: {:?}", shared.id, frame);
                    let abnormal = frame
                        .as_ref()
                        .map(|f| !matches!(u16::from(f.code), 1000 | 1001))
                        .unwrap_or(false);
                    break if abnormal {
                        Some(Error::Transport(format!("abnormal close: {:?}", frame)))
                    } else {
                        None
                    };
                }
                Some(Ok(_)) => {}
                Some(Err(e)) => break Some(Error::from(e)),
                None => {
                    break if shared.closing.load(Ordering::Acquire) {
                        None
                    } else {
                        Some(Error::Transport("socket ended without a close frame".into()))
                    };
                }
            }
        };

        let Some(shared) = weak.upgrade() else {
            return;
        };
        let conn = Connection { inner: shared };

        match outcome {
            Some(e) if !conn.inner.closing.load(Ordering::Acquire) => conn.fail(e),
            _ => conn.shutdown(),
        }
    }

    /// Moves to `Errored`, fails pending waits and runs the error hook.
    fn fail(&self, error: Error) {
        if self.inner.set_state(ConnectionState::Errored).is_none() {
            return;
        }

        self.inner.increment_transport_errors();
        warn!("[{}] transport error: {}", self.id(), error);

        self.inner.outgoing().take();
        self.inner.correlator.fail_all(|| error.clone());

        if let Some(hook) = self.inner.on_error.as_ref() {
            hook(&error, self);
        }
    }

    /// Moves to `Closed` and releases the writer.
    fn shutdown(&self) {
        if let Some(sender) = self.inner.outgoing().take() {
            let _ = sender.send(WebSocketMessage::Close(None));
        }

        // An errored connection keeps reporting `Errored`.
        if self.inner.set_state(ConnectionState::Closed).is_some() {
            self.inner.correlator.fail_all(|| Error::Closed);
        }
    }

    pub fn id(&self) -> ConnectionId {
        self.inner.id
    }

    pub fn url(&self) -> &str {
        &self.inner.url
    }

    pub fn state(&self) -> ConnectionState {
        *self.inner.state.borrow()
    }

    pub fn is_open(&self) -> bool {
        self.state() == ConnectionState::Open
    }

    pub fn next_request_id(&self) -> u64 {
        self.inner.ids.next_id()
    }

    pub fn pending_expectations(&self) -> usize {
        self.inner.correlator.pending()
    }

    /// Every decoded inbound frame, from now on.
    pub fn frames(&self) -> broadcast::Receiver<Message> {
        self.inner.frames.subscribe()
    }

    /// Serializes and writes one frame.
    pub fn send(&self, message: &Message) -> Result<()> {
        self.send_text(message.to_string())
    }

    /// Writes an arbitrary text frame, valid JSON or not.
    pub fn send_raw(&self, text: &str) -> Result<()> {
        self.send_text(text.to_string())
    }

    fn send_text(&self, text: String) -> Result<()> {
        debug!("-> [{}] {}", self.id(), text);

        let outgoing = self.inner.outgoing();
        let sent = match outgoing.as_ref() {
            Some(sender) if self.is_open() => sender.send(WebSocketMessage::Text(text)).is_ok(),
            _ => false,
        };

        if sent {
            self.inner.increment_frames_sent();
            return Ok(());
        }

        match self.inner.send_policy {
            SendPolicy::Strict => Err(Error::Closed),
            SendPolicy::Lenient => {
                debug!("[{}] dropping frame, connection is {:?}", self.id(), self.state());
                Ok(())
            }
        }
    }

    /// Registers a wait for a frame matching `pattern` without blocking.
    ///
    /// Register before sending the request the frame answers, then
    /// [`Expectation::wait`] on it.
    pub fn expect(&self, pattern: Value) -> Expectation {
        self.inner.correlator.expect(pattern)
    }

    /// Waits for the next frame that structurally matches `pattern`.
    pub async fn await_message(&self, pattern: Value, timeout: Duration) -> Result<Message> {
        self.expect(pattern).wait(timeout).await
    }

    /// Sends `fields` as `action` with a fresh request ID and waits for the
    /// correlated response.
    pub async fn request(&self, action: &str, fields: Value, timeout: Duration) -> Result<Message> {
        let request_id = self.next_request_id();
        let message = Message::request(action, request_id, fields)?;

        let expectation = self.expect(json!({ "action": action, "requestId": request_id }));
        self.send(&message)?;

        let response = expectation.wait(timeout).await?;
        match response.status() {
            Some("success") | None => Ok(response),
            Some(_) => Err(Error::from_frame(&response)),
        }
    }

    /// Closes the socket. Idempotent.
    pub fn close(&self) {
        if self.inner.closing.swap(true, Ordering::AcqRel) {
            return;
        }

        debug!("[{}] closing", self.id());
        self.shutdown();

        if let Some(reader) = self
            .inner
            .reader
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .take()
        {
            reader.abort();
        }
    }

    /// Resolves once the connection reached `Closed` or `Errored`.
    pub async fn closed(&self) -> ConnectionState {
        let mut state = self.inner.state.subscribe();
        loop {
            let current = *state.borrow_and_update();
            if current.is_terminal() {
                return current;
            }
            if state.changed().await.is_err() {
                return self.state();
            }
        }
    }
}
