//! Per-connection registry of pending expectations.
//!
//! A [`Correlator`] holds the waits registered on one connection. Every
//! decoded inbound frame is offered to it through [`Correlator::deliver`];
//! the first expectation whose pattern structurally matches the frame is
//! resolved with it. Each expectation is resolved exactly once: by a match,
//! by an error frame, by its timeout, by being superseded, or by the
//! connection going away.

use std::sync::{Arc, Mutex, MutexGuard, PoisonError};
use std::time::Duration;

use log::{debug, trace};
use serde_json::Value;
use tokio::sync::oneshot;
use tokio::time::Instant;

use crate::error::{Error, Result};
use crate::message::Message;
use crate::metrics::Metrics;
use crate::pattern;

/// How a connection treats a wait registered while another is outstanding.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Default)]
pub enum ExpectationMode {
    /// One outstanding wait; a newer registration replaces the older one,
    /// which resolves with [`Error::Superseded`].
    #[default]
    SingleSlot,
    /// Any number of outstanding waits, offered frames in registration order.
    Queue,
}

struct Pending {
    id: u64,
    pattern: Value,
    expects_error: bool,
    request_id: Option<u64>,
    created_at: Instant,
    resolve: oneshot::Sender<Result<Message>>,
}

impl Pending {
    fn finish(self, result: Result<Message>) {
        trace!(
            "resolving expectation {} after {:?} (ok: {})",
            self.id,
            self.created_at.elapsed(),
            result.is_ok()
        );
        // The waiter may have been dropped already; nothing left to notify.
        let _ = self.resolve.send(result);
    }

    /// Whether an error frame belongs to this wait.
    fn owns_error(&self, frame: &Message) -> bool {
        if self.expects_error {
            return false;
        }

        match (self.request_id, frame.request_id()) {
            (Some(expected), Some(actual)) => expected == actual,
            _ => true,
        }
    }
}

#[derive(Default)]
struct Registry {
    next_id: u64,
    pending: Vec<Pending>,
}

pub struct Correlator {
    mode: ExpectationMode,
    registry: Mutex<Registry>,
}

impl Metrics for Correlator {}

impl Correlator {
    pub fn new(mode: ExpectationMode) -> Self {
        Correlator {
            mode,
            registry: Mutex::new(Registry::default()),
        }
    }

    pub fn mode(&self) -> ExpectationMode {
        self.mode
    }

    fn registry(&self) -> MutexGuard<'_, Registry> {
        self.registry.lock().unwrap_or_else(PoisonError::into_inner)
    }

    /// Registers a wait for a frame matching `pattern`.
    ///
    /// The returned [`Expectation`] must be awaited with
    /// [`Expectation::wait`]; dropping it removes the registration.
    pub fn expect(self: &Arc<Self>, pattern: Value) -> Expectation {
        let (resolve, receiver) = oneshot::channel();
        let created_at = Instant::now();

        let (id, superseded) = {
            let mut registry = self.registry();
            registry.next_id += 1;
            let id = registry.next_id;

            let superseded = match self.mode {
                ExpectationMode::SingleSlot => std::mem::take(&mut registry.pending),
                ExpectationMode::Queue => Vec::new(),
            };

            registry.pending.push(Pending {
                id,
                expects_error: pattern::expects_error(&pattern),
                request_id: pattern.get("requestId").and_then(Value::as_u64),
                pattern: pattern.clone(),
                created_at,
                resolve,
            });

            (id, superseded)
        };

        for old in superseded {
            debug!("expectation {} superseded by {}", old.id, id);
            old.finish(Err(Error::Superseded));
        }

        Expectation {
            id,
            pattern,
            created_at,
            receiver,
            correlator: Arc::clone(self),
        }
    }

    /// Offers one inbound frame to the registered waits. Returns true when a
    /// wait was resolved by it.
    pub fn deliver(&self, frame: &Message) -> bool {
        let resolved = {
            let mut registry = self.registry();
            let pending = &mut registry.pending;

            let position = if frame.is_error_frame() {
                pending
                    .iter()
                    .position(|p| p.expects_error && pattern::matches(frame.value(), &p.pattern))
                    .map(|i| (i, true))
                    .or_else(|| pending.iter().position(|p| p.owns_error(frame)).map(|i| (i, false)))
            } else {
                pending
                    .iter()
                    .position(|p| pattern::matches(frame.value(), &p.pattern))
                    .map(|i| (i, true))
            };

            position.map(|(index, matched)| (pending.remove(index), matched))
        };

        match resolved {
            Some((pending, true)) => {
                pending.finish(Ok(frame.clone()));
                true
            }
            Some((pending, false)) => {
                debug!("error frame resolves expectation {}: {}", pending.id, frame);
                pending.finish(Err(Error::from_frame(frame)));
                true
            }
            None => false,
        }
    }

    /// Removes a wait without resolving it. Returns false when it was already
    /// resolved.
    fn cancel(&self, id: u64) -> bool {
        let mut registry = self.registry();
        match registry.pending.iter().position(|p| p.id == id) {
            Some(index) => {
                registry.pending.remove(index);
                true
            }
            None => false,
        }
    }

    /// Resolves every outstanding wait with an error built by `make_error`.
    pub fn fail_all<F>(&self, make_error: F)
    where
        F: Fn() -> Error,
    {
        let drained = std::mem::take(&mut self.registry().pending);
        for pending in drained {
            pending.finish(Err(make_error()));
        }
    }

    pub fn pending(&self) -> usize {
        self.registry().pending.len()
    }
}

/// A registered wait; resolves at most once.
pub struct Expectation {
    id: u64,
    pattern: Value,
    created_at: Instant,
    receiver: oneshot::Receiver<Result<Message>>,
    correlator: Arc<Correlator>,
}

impl Expectation {
    pub fn pattern(&self) -> &Value {
        &self.pattern
    }

    /// Waits for the matching frame, or fails with [`Error::Timeout`] once
    /// `timeout` elapses.
    pub async fn wait(mut self, timeout: Duration) -> Result<Message> {
        match tokio::time::timeout(timeout, &mut self.receiver).await {
            Ok(Ok(result)) => result,
            Ok(Err(_)) => Err(Error::Closed),
            Err(_) => {
                if self.correlator.cancel(self.id) {
                    self.correlator.increment_wait_timeouts();
                    return Err(Error::Timeout {
                        elapsed: self.created_at.elapsed(),
                        pattern: self.pattern.clone(),
                    });
                }

                // Resolved between the deadline and the cancel.
                match self.receiver.try_recv() {
                    Ok(result) => result,
                    Err(_) => Err(Error::Closed),
                }
            }
        }
    }
}

impl Drop for Expectation {
    fn drop(&mut self) {
        self.correlator.cancel(self.id);
    }
}

#[cfg(test)]
mod tests {
    use serde_json::json;

    use super::*;

    fn frame(value: Value) -> Message {
        Message::new(value)
    }

    #[tokio::test]
    async fn matching_frame_resolves_wait() {
        let correlator = Arc::new(Correlator::new(ExpectationMode::SingleSlot));
        let expectation = correlator.expect(json!({ "action": "x", "status": "success" }));

        assert!(!correlator.deliver(&frame(json!({ "action": "y" }))));
        assert!(correlator.deliver(&frame(json!({ "action": "x", "status": "success", "foo": 1 }))));

        let msg = expectation.wait(Duration::from_secs(1)).await.unwrap();
        assert_eq!(msg.get("foo"), Some(&json!(1)));
        assert_eq!(correlator.pending(), 0);
    }

    #[tokio::test(start_paused = true)]
    async fn timeout_fires_once_and_late_frame_is_ignored() {
        let correlator = Arc::new(Correlator::new(ExpectationMode::SingleSlot));
        let expectation = correlator.expect(json!({ "action": "never" }));

        let started = tokio::time::Instant::now();
        let err = expectation.wait(Duration::from_millis(500)).await.unwrap_err();

        assert!(err.is_timeout());
        assert!(started.elapsed() >= Duration::from_millis(500));
        assert!(err.to_string().contains("timed out after"));
        assert_eq!(correlator.pending(), 0);
        assert!(!correlator.deliver(&frame(json!({ "action": "never" }))));
    }

    #[tokio::test]
    async fn error_frame_fails_plain_wait() {
        let correlator = Arc::new(Correlator::new(ExpectationMode::SingleSlot));
        let expectation = correlator.expect(json!({ "action": "authenticate", "requestId": 3 }));

        correlator.deliver(&frame(json!({ "code": 401, "error": "Invalid credentials" })));

        match expectation.wait(Duration::from_secs(1)).await {
            Err(Error::Protocol { code, message, .. }) => {
                assert_eq!(code, Some(401));
                assert_eq!(message, "Invalid credentials");
            }
            other => panic!("unexpected result: {:?}", other),
        }
    }

    #[tokio::test]
    async fn error_pattern_matches_error_frame() {
        let correlator = Arc::new(Correlator::new(ExpectationMode::SingleSlot));
        let expectation = correlator.expect(json!({ "code": 400 }));

        correlator.deliver(&frame(json!({ "code": 400, "error": "Malformed Json received." })));

        let msg = expectation.wait(Duration::from_secs(1)).await.unwrap();
        assert_eq!(msg.error_text(), Some("Malformed Json received."));
    }

    #[tokio::test]
    async fn single_slot_supersedes_previous_wait() {
        let correlator = Arc::new(Correlator::new(ExpectationMode::SingleSlot));
        let first = correlator.expect(json!({ "action": "a" }));
        let second = correlator.expect(json!({ "action": "b" }));

        assert_eq!(correlator.pending(), 1);
        assert!(!correlator.deliver(&frame(json!({ "action": "a" }))));
        assert!(correlator.deliver(&frame(json!({ "action": "b" }))));

        assert!(matches!(
            first.wait(Duration::from_secs(1)).await,
            Err(Error::Superseded)
        ));
        assert!(second.wait(Duration::from_secs(1)).await.is_ok());
    }

    #[tokio::test]
    async fn queue_mode_routes_by_pattern() {
        let correlator = Arc::new(Correlator::new(ExpectationMode::Queue));
        let first = correlator.expect(json!({ "requestId": 1 }));
        let second = correlator.expect(json!({ "requestId": 2 }));

        correlator.deliver(&frame(json!({ "requestId": 2, "status": "success" })));
        correlator.deliver(&frame(json!({ "requestId": 1, "status": "success" })));

        assert_eq!(first.wait(Duration::from_secs(1)).await.unwrap().request_id(), Some(1));
        assert_eq!(second.wait(Duration::from_secs(1)).await.unwrap().request_id(), Some(2));
    }

    #[tokio::test]
    async fn queue_mode_error_frame_only_hits_its_request() {
        let correlator = Arc::new(Correlator::new(ExpectationMode::Queue));
        let first = correlator.expect(json!({ "requestId": 1 }));
        let second = correlator.expect(json!({ "requestId": 2 }));

        correlator.deliver(&frame(json!({ "requestId": 2, "code": 404, "error": "Not found" })));

        assert!(matches!(
            second.wait(Duration::from_secs(1)).await,
            Err(Error::Protocol { code: Some(404), .. })
        ));
        assert_eq!(correlator.pending(), 1);
        drop(first);
        assert_eq!(correlator.pending(), 0);
    }

    #[tokio::test]
    async fn fail_all_resolves_everything() {
        let correlator = Arc::new(Correlator::new(ExpectationMode::Queue));
        let first = correlator.expect(json!({ "action": "a" }));
        let second = correlator.expect(json!({ "action": "b" }));

        correlator.fail_all(|| Error::Closed);

        assert!(matches!(first.wait(Duration::from_secs(1)).await, Err(Error::Closed)));
        assert!(matches!(second.wait(Duration::from_secs(1)).await, Err(Error::Closed)));
    }
}
