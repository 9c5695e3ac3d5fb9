//! Scripted in-memory transport.
//!
//! Every operation is recorded as a [`WireEvent`] on shared state so tests
//! can assert ordering and retry counts. Replies to data requests come from
//! a responder closure; pushed stream packets are queued with
//! [`MockState::push_inbound`].

// ============================================================================
// Imports
// ============================================================================

use std::collections::VecDeque;
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};

use async_trait::async_trait;
use parking_lot::Mutex;
use serde_json::{Value, json};

use crate::config::ChannelKind;
use crate::error::{Error, Result};

use super::{Readiness, Transport, TransportFactory};

// ============================================================================
// Types
// ============================================================================

/// Maps a sent request to an optional reply.
pub(crate) type Responder = Arc<dyn Fn(&Value) -> Option<Value> + Send + Sync>;

/// One recorded transport operation.
#[derive(Debug, Clone, PartialEq)]
pub(crate) enum WireEvent {
    Create,
    Open,
    Send(Value),
    Receive,
    Close,
}

impl WireEvent {
    /// Command of a sent request.
    pub(crate) fn command(&self) -> Option<&str> {
        match self {
            Self::Send(value) => value.get("command").and_then(Value::as_str),
            _ => None,
        }
    }
}

// ============================================================================
// MockState
// ============================================================================

/// State shared between a test and its transport.
pub(crate) struct MockState {
    events: Mutex<Vec<WireEvent>>,
    responder: Responder,
    inbound: Mutex<VecDeque<String>>,
    healthy: AtomicBool,
    fail_next_sends: AtomicUsize,
    fail_opens: AtomicUsize,
}

impl MockState {
    pub(crate) fn new(responder: Responder) -> Arc<Self> {
        Arc::new(Self {
            events: Mutex::new(Vec::new()),
            responder,
            inbound: Mutex::new(VecDeque::new()),
            healthy: AtomicBool::new(true),
            fail_next_sends: AtomicUsize::new(0),
            fail_opens: AtomicUsize::new(0),
        })
    }

    /// Snapshot of the recorded events.
    pub(crate) fn events(&self) -> Vec<WireEvent> {
        self.events.lock().clone()
    }

    /// Commands of every sent request, in order.
    pub(crate) fn sent_commands(&self) -> Vec<String> {
        self.events
            .lock()
            .iter()
            .filter_map(|e| e.command().map(str::to_string))
            .collect()
    }

    /// Number of sends of `command`.
    pub(crate) fn count_sent(&self, command: &str) -> usize {
        self.sent_commands().iter().filter(|c| *c == command).count()
    }

    /// Number of recorded `event`s.
    pub(crate) fn count(&self, event: &WireEvent) -> usize {
        self.events.lock().iter().filter(|e| *e == event).count()
    }

    /// Simulates the peer severing the socket.
    pub(crate) fn sever(&self) {
        self.healthy.store(false, Ordering::SeqCst);
    }

    /// Makes the next `count` sends fail as transport errors.
    pub(crate) fn fail_sends(&self, count: usize) {
        self.fail_next_sends.store(count, Ordering::SeqCst);
    }

    /// Makes the next `count` opens fail.
    pub(crate) fn fail_opens(&self, count: usize) {
        self.fail_opens.store(count, Ordering::SeqCst);
    }

    /// Queues a pushed stream packet.
    pub(crate) fn push_inbound(&self, packet: Value) {
        self.inbound.lock().push_back(packet.to_string());
    }

    fn record(&self, event: WireEvent) {
        self.events.lock().push(event);
    }

    fn take(counter: &AtomicUsize) -> bool {
        counter
            .fetch_update(Ordering::SeqCst, Ordering::SeqCst, |n| n.checked_sub(1))
            .is_ok()
    }
}

// ============================================================================
// Responders
// ============================================================================

/// Server-like responder.
///
/// Login yields token `"token-1"`, data commands echo their name under
/// `returnData`, stream traffic and unsubscribes get no reply.
pub(crate) fn xapi_responder() -> Responder {
    Arc::new(|request: &Value| {
        let command = request.get("command").and_then(Value::as_str)?;
        if request.get("streamSessionId").is_some() || command.starts_with("stop") {
            return None;
        }

        match command {
            "login" => Some(json!({"status": true, "streamSessionId": "token-1"})),
            "logout" | "ping" => Some(json!({"status": true})),
            _ => Some(json!({
                "status": true,
                "returnData": {"command": command, "arguments": request.get("arguments")},
            })),
        }
    })
}

// ============================================================================
// MockTransport
// ============================================================================

/// Transport backed by [`MockState`].
pub(crate) struct MockTransport {
    state: Arc<MockState>,
    streaming: bool,
    open: bool,
    replies: VecDeque<String>,
}

impl MockTransport {
    pub(crate) fn new(state: Arc<MockState>, streaming: bool) -> Self {
        Self {
            state,
            streaming,
            open: false,
            replies: VecDeque::new(),
        }
    }

    fn is_healthy(&self) -> bool {
        self.open && self.state.healthy.load(Ordering::SeqCst)
    }
}

#[async_trait]
impl Transport for MockTransport {
    fn check_ready(&mut self, mode: Readiness) -> bool {
        match mode {
            Readiness::Basic | Readiness::Writable => self.is_healthy(),
            Readiness::Readable => {
                self.is_healthy()
                    && (!self.replies.is_empty()
                        || (self.streaming && !self.state.inbound.lock().is_empty()))
            }
        }
    }

    async fn create(&mut self) -> Result<()> {
        self.state.record(WireEvent::Create);
        self.open = false;
        self.replies.clear();
        Ok(())
    }

    async fn open(&mut self) -> Result<()> {
        self.state.record(WireEvent::Open);
        tokio::task::yield_now().await;

        if MockState::take(&self.state.fail_opens) {
            return Err(Error::connection("scripted open failure"));
        }

        self.open = true;
        self.state.healthy.store(true, Ordering::SeqCst);
        Ok(())
    }

    async fn send(&mut self, message: &str) -> Result<()> {
        let value: Value = serde_json::from_str(message)?;
        self.state.record(WireEvent::Send(value.clone()));
        tokio::task::yield_now().await;

        if !self.is_healthy() {
            return Err(Error::NotWritable);
        }

        if MockState::take(&self.state.fail_next_sends) {
            self.state.sever();
            return Err(Error::ConnectionClosed);
        }

        if let Some(reply) = (self.state.responder)(&value) {
            self.replies.push_back(reply.to_string());
        }
        Ok(())
    }

    async fn receive(&mut self) -> Result<String> {
        self.state.record(WireEvent::Receive);
        tokio::task::yield_now().await;

        if !self.is_healthy() {
            return Err(Error::ConnectionClosed);
        }

        if let Some(reply) = self.replies.pop_front() {
            return Ok(reply);
        }

        if self.streaming {
            if let Some(packet) = self.state.inbound.lock().pop_front() {
                return Ok(packet);
            }
        }

        Err(Error::connection_timeout(0))
    }

    async fn close(&mut self) {
        if !self.open {
            return;
        }
        self.state.record(WireEvent::Close);
        self.open = false;
        self.replies.clear();
    }

    fn is_streaming(&self) -> bool {
        self.streaming
    }
}

// ============================================================================
// MockFactory
// ============================================================================

/// Builds mock transports and keeps their state for inspection.
pub(crate) struct MockFactory {
    responder: Responder,
    states: Mutex<Vec<(ChannelKind, Arc<MockState>)>>,
}

impl MockFactory {
    pub(crate) fn new(responder: Responder) -> Arc<Self> {
        Arc::new(Self {
            responder,
            states: Mutex::new(Vec::new()),
        })
    }

    /// State of every transport built so far for `kind`.
    pub(crate) fn states(&self, kind: ChannelKind) -> Vec<Arc<MockState>> {
        self.states
            .lock()
            .iter()
            .filter(|(k, _)| *k == kind)
            .map(|(_, s)| Arc::clone(s))
            .collect()
    }
}

impl TransportFactory for MockFactory {
    fn transport(&self, kind: ChannelKind) -> Box<dyn Transport> {
        let state = MockState::new(Arc::clone(&self.responder));
        self.states.lock().push((kind, Arc::clone(&state)));
        Box::new(MockTransport::new(state, kind == ChannelKind::Stream))
    }
}
