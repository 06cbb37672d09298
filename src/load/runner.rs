//! Drives one load scenario end to end.
//!
//! Setup (devices, then clients) runs phase by phase on the caller's task.
//! Once clients are sending, a single event loop owns the [`Statistics`] and
//! the send timestamps; client timers, reply waits, device listeners and
//! connection error hooks all report to it over an mpsc channel.

use std::collections::{HashMap, HashSet};
use std::fmt;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::Duration;

use futures::future::join_all;
use log::{debug, info, warn};
use serde::Serialize;
use serde_json::json;
use tokio::sync::broadcast::error::RecvError;
use tokio::sync::mpsc::{unbounded_channel, UnboundedReceiver, UnboundedSender};
use tokio::task::{JoinHandle, JoinSet};
use tokio::time::{interval, sleep_until, Instant, MissedTickBehavior};

use crate::auth::{self, Credentials};
use crate::connection::{ConnectOptions, Connection, ConnectionId};
use crate::error::{Error, Result};
use crate::ids::RequestIds;
use crate::stats::Statistics;
use crate::subscription::Subscription;

use super::report::ScenarioRunResult;
use super::scenario::{self, Device, Scenario};
use super::ScenarioConfig;

#[derive(Serialize, Clone, Copy, Debug, PartialEq, Eq)]
pub enum ScenarioPhase {
    Created,
    DevicesConnecting,
    DevicesAuthenticating,
    DevicesSubscribing,
    ClientsConnecting,
    ClientsAuthenticating,
    Sending,
    Draining,
    Completed,
}

impl fmt::Display for ScenarioPhase {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        fmt::Debug::fmt(self, f)
    }
}

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
enum Role {
    Device,
    Client,
}

#[derive(Debug)]
enum Event {
    Sent {
        request_id: u64,
        at: Instant,
        name: String,
        target: Option<String>,
    },
    Reply {
        request_id: u64,
        at: Instant,
    },
    ReplyFailed {
        request_id: u64,
        error: Error,
    },
    Delivered,
    ClientFinished {
        id: ConnectionId,
    },
    ConnectionFailed {
        id: ConnectionId,
        error: Error,
    },
}

/// Everything the event loop mutates. Only the loop (or setup, before the
/// loop starts) touches it.
struct RunState {
    stats: Statistics,
    sent_at: HashMap<u64, Instant>,
    sent: usize,
    failed: HashSet<ConnectionId>,
    finished: HashSet<ConnectionId>,
    roles: HashMap<ConnectionId, Role>,
    timers: HashMap<ConnectionId, JoinHandle<()>>,
    phases: Vec<ScenarioPhase>,
}

impl RunState {
    fn new() -> Self {
        RunState {
            stats: Statistics::new(),
            sent_at: HashMap::new(),
            sent: 0,
            failed: HashSet::new(),
            finished: HashSet::new(),
            roles: HashMap::new(),
            timers: HashMap::new(),
            phases: vec![ScenarioPhase::Created],
        }
    }

    fn enter(&mut self, name: &str, phase: ScenarioPhase) {
        info!("[{}] {}", name, phase);
        self.phases.push(phase);
    }

    fn phase(&self) -> ScenarioPhase {
        self.phases
            .last()
            .copied()
            .unwrap_or(ScenarioPhase::Created)
    }

    /// Records a connection failure once per connection.
    fn connection_failed(&mut self, id: ConnectionId, error: &Error) {
        if !self.failed.insert(id) {
            return;
        }

        let role = self.roles.get(&id).copied();
        warn!("{} ({:?}) failed: {}", id, role, error);
        self.stats.add_error();

        if let Some(timer) = self.timers.remove(&id) {
            timer.abort();
        }
    }

    /// Setup failure with no connection to pin it on.
    fn setup_failed(&mut self, what: &str, error: &Error) {
        warn!("{} failed: {}", what, error);
        self.stats.add_error();
    }

    /// Replies and failures seen so far.
    fn progress(&self) -> (u64, u64) {
        (self.stats.received(), self.stats.error_count())
    }

    fn live_clients(&self) -> usize {
        self.timers
            .keys()
            .filter(|id| !self.failed.contains(id) && !self.finished.contains(id))
            .count()
    }

    fn apply(&mut self, event: Event) {
        match event {
            Event::Sent {
                request_id,
                at,
                name,
                target,
            } => {
                self.sent += 1;
                self.sent_at.insert(request_id, at);
                self.stats.add_expected(&name, target.as_deref());
            }
            Event::Reply { request_id, at } => match self.sent_at.remove(&request_id) {
                Some(sent) => {
                    let latency = at.saturating_duration_since(sent);
                    self.stats.add(latency.as_secs_f64() * 1000.0);
                    self.stats.add_received();
                }
                None => debug!("reply for unknown request {}", request_id),
            },
            Event::ReplyFailed { request_id, error } => {
                self.sent_at.remove(&request_id);
                debug!("request {} failed: {}", request_id, error);
                self.stats.add_error();
            }
            Event::Delivered => self.stats.add_delivered(),
            Event::ClientFinished { id } => {
                self.finished.insert(id);
            }
            Event::ConnectionFailed { id, error } => self.connection_failed(id, &error),
        }
    }
}

/// Runs one [`Scenario`] against a server.
pub struct ScenarioRunner {
    scenario: Arc<dyn Scenario>,
    url: String,
    credentials: Credentials,
    ids: Arc<RequestIds>,
    timeout: Duration,
}

impl ScenarioRunner {
    pub fn new(scenario: Arc<dyn Scenario>, url: &str, credentials: Credentials) -> Self {
        ScenarioRunner {
            scenario,
            url: url.to_string(),
            credentials,
            ids: RequestIds::global(),
            timeout: Duration::from_millis(5000),
        }
    }

    /// Runner for a configured kind.
    pub fn from_config(config: ScenarioConfig, url: &str, credentials: Credentials) -> Self {
        Self::new(scenario::for_config(config), url, credentials)
    }

    pub fn with_ids(mut self, ids: Arc<RequestIds>) -> Self {
        self.ids = ids;
        self
    }

    /// Bound on connect, authenticate and subscribe round trips.
    pub fn with_timeout(mut self, timeout: Duration) -> Self {
        self.timeout = timeout;
        self
    }

    fn config(&self) -> &ScenarioConfig {
        self.scenario.config()
    }

    fn options(&self, events: &UnboundedSender<Event>) -> ConnectOptions {
        let events = events.clone();

        let mut options = ConnectOptions::load()
            .with_ids(Arc::clone(&self.ids))
            .on_error(move |error, conn| {
                let _ = events.send(Event::ConnectionFailed {
                    id: conn.id(),
                    error: error.clone(),
                });
            });
        options.headers.extend(self.credentials.headers());
        options
    }

    /// Connects `count` sockets concurrently. Refused connects are reported
    /// by the error hook; connects that hang past the timeout are counted
    /// here.
    async fn connect_all(
        &self,
        state: &mut RunState,
        count: usize,
        events: &UnboundedSender<Event>,
    ) -> Vec<Option<Connection>> {
        let attempts = (0..count).map(|_| {
            tokio::time::timeout(self.timeout, Connection::connect(&self.url, self.options(events)))
        });

        join_all(attempts)
            .await
            .into_iter()
            .map(|result| match result {
                Ok(Ok(conn)) => Some(conn),
                Ok(Err(_)) => None,
                Err(_) => {
                    let error = Error::Transport(format!("connect timed out after {:?}", self.timeout));
                    state.setup_failed(&self.url, &error);
                    None
                }
            })
            .collect()
    }

    /// Authenticates every open connection; failures are recorded and the
    /// connection is closed.
    async fn authenticate_all(
        &self,
        state: &mut RunState,
        conns: Vec<Option<Connection>>,
    ) -> Vec<Option<Connection>> {
        let results = join_all(conns.iter().map(|conn| async move {
            match conn {
                Some(conn) => Some(auth::authenticate(conn, &self.credentials, self.timeout).await),
                None => None,
            }
        }))
        .await;

        conns
            .into_iter()
            .zip(results)
            .map(|(conn, result)| match (conn, result) {
                (Some(conn), Some(Ok(_))) => Some(conn),
                (Some(conn), Some(Err(e))) => {
                    state.connection_failed(conn.id(), &e);
                    conn.close();
                    None
                }
                _ => None,
            })
            .collect()
    }

    pub async fn run(self) -> Result<ScenarioRunResult> {
        let config = self.config().clone();
        if config.total > 0 && config.clients == 0 {
            return Err(Error::Config(format!(
                "scenario {} sends {} messages but has no clients",
                config.name, config.total
            )));
        }

        let started = Instant::now();
        let name = config.name.clone();
        let (events_tx, mut events_rx) = unbounded_channel::<Event>();
        let mut state = RunState::new();
        let mut connections: Vec<Connection> = Vec::new();
        let mut listeners: Vec<JoinHandle<()>> = Vec::new();
        let mut device_subscriptions: Vec<(Connection, Subscription)> = Vec::new();

        // Devices
        let devices: Vec<Device> = (0..config.devices).map(|i| Device::new(i, &config)).collect();

        state.enter(&name, ScenarioPhase::DevicesConnecting);
        let device_conns = self.connect_all(&mut state, devices.len(), &events_tx).await;
        for conn in device_conns.iter().flatten() {
            state.roles.insert(conn.id(), Role::Device);
            connections.push(conn.clone());
        }

        state.enter(&name, ScenarioPhase::DevicesAuthenticating);
        let device_conns = self.authenticate_all(&mut state, device_conns).await;

        state.enter(&name, ScenarioPhase::DevicesSubscribing);
        let subscribed = AtomicUsize::new(0);
        let runner = &self;
        let subscriptions = join_all(devices.iter().zip(device_conns.iter()).map(|(device, conn)| {
            let subscribed = &subscribed;
            async move {
                let conn = conn.as_ref()?;
                let result = runner
                    .scenario
                    .subscribe_device(conn, device, runner.timeout)
                    .await;
                if result.is_ok() {
                    subscribed.fetch_add(1, Ordering::Relaxed);
                }
                Some((conn.clone(), result))
            }
        }))
        .await;

        for (device, outcome) in devices.iter().zip(subscriptions) {
            match outcome {
                Some((conn, Ok(Some(sub)))) => {
                    for topic in &device.names {
                        state.stats.add_subscribed(topic, &[device.id.clone()]);
                    }
                    device_subscriptions.push((conn.clone(), sub.clone()));
                    listeners.push(self.listen(conn, device.clone(), sub, events_tx.clone()));
                }
                Some((_, Ok(None))) => {}
                Some((conn, Err(e))) => state.connection_failed(conn.id(), &e),
                None => {}
            }
        }
        info!(
            "[{}] {}/{} devices subscribed",
            name,
            subscribed.load(Ordering::Relaxed),
            devices.len()
        );

        // Clients
        state.enter(&name, ScenarioPhase::ClientsConnecting);
        let client_conns = self.connect_all(&mut state, config.clients, &events_tx).await;
        for conn in client_conns.iter().flatten() {
            state.roles.insert(conn.id(), Role::Client);
            connections.push(conn.clone());
        }

        state.enter(&name, ScenarioPhase::ClientsAuthenticating);
        let client_conns = self.authenticate_all(&mut state, client_conns).await;

        state.enter(&name, ScenarioPhase::Sending);
        let devices = Arc::new(devices);
        let sent_counter = Arc::new(AtomicUsize::new(0));
        for conn in client_conns.into_iter().flatten() {
            let timer = tokio::spawn(drive_client(ClientDriver {
                conn: conn.clone(),
                scenario: Arc::clone(&self.scenario),
                devices: Arc::clone(&devices),
                sent: Arc::clone(&sent_counter),
                events: events_tx.clone(),
            }));
            state.timers.insert(conn.id(), timer);
        }
        if state.timers.is_empty() && config.clients > 0 {
            state.setup_failed(&format!("[{}] every client", name), &Error::Closed);
        }
        drop(events_tx);

        self.event_loop(&mut state, &mut events_rx, started).await;

        // Teardown
        for (_, timer) in state.timers.drain() {
            timer.abort();
        }
        for listener in listeners {
            listener.abort();
        }
        self.unsubscribe_all(&device_subscriptions).await;
        for conn in &connections {
            conn.close();
        }
        state.enter(&name, ScenarioPhase::Completed);

        Ok(ScenarioRunResult::new(
            &config,
            &mut state.stats,
            state.sent,
            started.elapsed(),
            state.phases,
        ))
    }

    /// Best effort: failures are logged, never counted.
    async fn unsubscribe_all(&self, subscriptions: &[(Connection, Subscription)]) {
        join_all(subscriptions.iter().map(|(conn, sub)| async move {
            if !conn.is_open() {
                return;
            }
            if let Err(e) = sub.unsubscribe(conn, self.timeout).await {
                debug!("[{}] unsubscribe {} failed: {}", conn.id(), sub.id, e);
            }
        }))
        .await;
    }

    /// Consumes events until the quiet-period rule (or the optional maximum
    /// duration) ends the run.
    async fn event_loop(
        &self,
        state: &mut RunState,
        events: &mut UnboundedReceiver<Event>,
        started: Instant,
    ) {
        let config = self.config();
        let deadline = config.max_duration().map(|d| started + d);
        // Set once draining; pushed back by every reply or failure.
        let mut quiet_until: Option<Instant> = None;
        let mut progress = state.progress();

        loop {
            let done_sending = state.sent >= config.total || state.live_clients() == 0;

            if quiet_until.is_none() && done_sending {
                state.enter(&config.name, ScenarioPhase::Draining);
                quiet_until = Some(Instant::now() + config.wait_delay());
                progress = state.progress();
            }

            tokio::select! {
                event = events.recv() => match event {
                    Some(event) => {
                        state.apply(event);
                        if quiet_until.is_some() && state.progress() != progress {
                            progress = state.progress();
                            quiet_until = Some(Instant::now() + config.wait_delay());
                        }
                    }
                    // Every sender is gone; nothing else can change.
                    None => break,
                },
                _ = sleep_until(quiet_until.unwrap_or(started)), if quiet_until.is_some() => {
                    info!(
                        "[{}] quiet for {:?}, {} received",
                        config.name,
                        config.wait_delay(),
                        state.stats.received()
                    );
                    break;
                }
                _ = sleep_until(deadline.unwrap_or(started)), if deadline.is_some() => {
                    warn!("[{}] stopped after {:?} in phase {}", config.name, started.elapsed(), state.phase());
                    break;
                }
            }
        }
    }

    /// Reacts to every frame a device sees for the rest of the run.
    fn listen(
        &self,
        conn: Connection,
        device: Device,
        subscription: Subscription,
        events: UnboundedSender<Event>,
    ) -> JoinHandle<()> {
        let scenario = Arc::clone(&self.scenario);
        let mut frames = conn.frames();

        tokio::spawn(async move {
            loop {
                match frames.recv().await {
                    Ok(frame) => {
                        if scenario.on_device_frame(&conn, &device, &subscription, &frame) {
                            let _ = events.send(Event::Delivered);
                        }
                    }
                    Err(RecvError::Lagged(skipped)) => {
                        warn!("[{}] device {} lagged, {} frames skipped", conn.id(), device.id, skipped);
                    }
                    Err(RecvError::Closed) => break,
                }
            }
        })
    }
}

struct ClientDriver {
    conn: Connection,
    scenario: Arc<dyn Scenario>,
    devices: Arc<Vec<Device>>,
    sent: Arc<AtomicUsize>,
    events: UnboundedSender<Event>,
}

/// Sends one message per interval until the scenario-wide total is reached,
/// then waits for the outstanding replies.
async fn drive_client(driver: ClientDriver) {
    let ClientDriver {
        conn,
        scenario,
        devices,
        sent,
        events,
    } = driver;
    let config = scenario.config();
    let action = scenario.action();
    let total = config.total;
    let reply_timeout = config.reply_timeout();

    let mut ticker = interval(config.interval());
    ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);
    // The first tick completes immediately; sends start one interval in.
    ticker.tick().await;

    let mut waits = JoinSet::new();

    loop {
        ticker.tick().await;

        if !conn.is_open() {
            break;
        }

        // Claim a slot before sending so the total is never exceeded.
        let tick = match sent.fetch_update(Ordering::AcqRel, Ordering::Acquire, |n| {
            (n < total).then_some(n + 1)
        }) {
            Ok(previous) => previous,
            Err(_) => break,
        };

        let request_id = conn.next_request_id();
        let publish = match scenario.build_publish(tick, &devices, request_id) {
            Ok(publish) => publish,
            Err(e) => {
                // A template that cannot render never will; hand the slot back.
                sent.fetch_sub(1, Ordering::AcqRel);
                warn!("[{}] cannot build message {}: {}", conn.id(), tick, e);
                let _ = events.send(Event::ReplyFailed {
                    request_id,
                    error: e,
                });
                break;
            }
        };

        let expectation = conn.expect(json!({ "action": action, "requestId": request_id }));
        let _ = events.send(Event::Sent {
            request_id,
            at: Instant::now(),
            name: publish.name,
            target: publish.target,
        });

        if let Err(e) = conn.send(&publish.message) {
            let _ = events.send(Event::ReplyFailed {
                request_id,
                error: e,
            });
            continue;
        }

        let events = events.clone();
        waits.spawn(async move {
            let event = match expectation.wait(reply_timeout).await {
                Ok(_) => Event::Reply {
                    request_id,
                    at: Instant::now(),
                },
                Err(error) => Event::ReplyFailed { request_id, error },
            };
            let _ = events.send(event);
        });
    }

    while waits.join_next().await.is_some() {}
    debug!("[{}] client finished sending", conn.id());
    let _ = events.send(Event::ClientFinished { id: conn.id() });
}
