//! Push-stream multiplexer.
//!
//! A [`StreamMultiplexer`] carries several subscriptions over one streaming
//! socket. The server requires the keepalive stream as the very first
//! subscription on a fresh socket, so [`StreamMultiplexer::connect`] issues
//! it before returning.
//!
//! Pushed packets carry no subscription id. Every packet goes to one
//! channel, see [`StreamMultiplexer::take_packets`]; routing rows to
//! subscriptions is up to the caller.
//!
//! # Example
//!
//! ```no_run
//! use xapi_link::config::ClientConfig;
//! use xapi_link::HandlerPool;
//!
//! # async fn example(config: ClientConfig) -> xapi_link::Result<()> {
//! let pool = HandlerPool::new(config)?;
//! let stream = pool.provide_multiplexer().await?;
//!
//! let mut packets = stream.take_packets().expect("first taker");
//! stream.subscribe("Balance", None).await?;
//!
//! while let Some(packet) = packets.recv().await {
//!     println!("{:?}: {}", packet.command, packet.data);
//! }
//! # Ok(())
//! # }
//! ```

// ============================================================================
// Imports
// ============================================================================

use std::fmt;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Weak};
use std::time::Duration;

use async_trait::async_trait;
use parking_lot::{Mutex, RwLock};
use rustc_hash::FxHashMap;
use serde_json::Value;
use tokio::sync::mpsc::{self, UnboundedReceiver, UnboundedSender};
use tokio::task::JoinHandle;
use tokio::time::{sleep, timeout};
use tracing::{debug, error, info, trace, warn};

use crate::error::{Error, Result};
use crate::identifiers::{HandlerId, SubscriptionId};
use crate::protocol::{
    Arguments, JOIN_TIMEOUT, Link, ProtocolChannel, Reconnect, Request, readable_command,
};
use crate::transport::{Readiness, Transport};

use super::session::Session;
use super::{HandlerStatus, RepairOutcome};

// ============================================================================
// Constants
// ============================================================================

/// The mandatory first subscription of every stream socket.
pub const KEEP_ALIVE: &str = "KeepAlive";

// ============================================================================
// StreamPacket
// ============================================================================

/// One pushed row.
#[derive(Debug, Clone, PartialEq)]
pub struct StreamPacket {
    /// Stream the row belongs to, as named by the server.
    pub command: Option<String>,
    /// Row payload, never empty.
    pub data: Value,
}

// ============================================================================
// Registry
// ============================================================================

/// A registered subscription.
#[derive(Debug, Clone)]
struct Subscription {
    command: String,
    arguments: Arguments,
}

impl Subscription {
    /// Unsubscribe request, carrying the symbol if the subscription had one.
    fn stop_request(&self) -> Request {
        let mut fields = Arguments::new();
        if let Some(symbol) = self.arguments.get("symbol") {
            fields.insert("symbol".to_string(), symbol.clone());
        }
        Request::new(format!("stop{}", self.command)).with_fields(fields)
    }
}

#[derive(Debug, Default)]
struct Registry {
    entries: FxHashMap<SubscriptionId, Subscription>,
    next_index: u32,
    /// Registry entry of the keepalive stream.
    keepalive: Option<SubscriptionId>,
    /// Keepalive subscribed on the current socket.
    keepalive_live: bool,
}

impl Registry {
    fn register(&mut self, command: &str, arguments: Arguments) -> SubscriptionId {
        if command == KEEP_ALIVE {
            self.keepalive_live = true;
            if let Some(id) = self.keepalive {
                return id;
            }
        }

        let id = SubscriptionId::new(self.next_index);
        self.next_index += 1;
        self.entries.insert(
            id,
            Subscription {
                command: command.to_string(),
                arguments,
            },
        );

        if command == KEEP_ALIVE {
            self.keepalive = Some(id);
        }
        id
    }

    /// Removes every entry, oldest first.
    fn drain(&mut self) -> Vec<(SubscriptionId, Subscription)> {
        let mut entries: Vec<_> = self.entries.drain().collect();
        entries.sort_by_key(|(id, _)| *id);
        self.keepalive = None;
        self.keepalive_live = false;
        entries
    }
}

/// Read loop state.
#[derive(Debug, Default)]
struct Reader {
    running: Arc<AtomicBool>,
    handle: Option<JoinHandle<()>>,
}

// ============================================================================
// StreamMultiplexer
// ============================================================================

/// Streaming socket carrying several subscriptions of one session.
pub struct StreamMultiplexer {
    /// Unique handler id.
    id: HandlerId,
    /// Handler name for logs and bookkeeping.
    name: String,
    /// Session providing the token and repaired alongside.
    session: Arc<Session>,
    /// Stream channel.
    channel: Arc<ProtocolChannel>,
    /// Self reference handed to the read loop.
    this: Weak<Self>,
    /// Lifecycle state.
    status: RwLock<HandlerStatus>,
    /// Registered subscriptions.
    registry: Mutex<Registry>,
    /// Read loop.
    reader: Mutex<Reader>,
    /// Packet sink, dropped on delete so receivers see the end.
    packets_tx: Mutex<Option<UnboundedSender<StreamPacket>>>,
    /// Packet source until taken.
    packets_rx: Mutex<Option<UnboundedReceiver<StreamPacket>>>,
    /// Subscription budget.
    max_subscriptions: usize,
    /// Read loop idle pause.
    interval: Duration,
    /// Set once by [`StreamMultiplexer::delete`].
    deleted: AtomicBool,
}

// ============================================================================
// StreamMultiplexer - Construction
// ============================================================================

impl StreamMultiplexer {
    fn build(name: String, session: Arc<Session>, transport: Box<dyn Transport>) -> Arc<Self> {
        let (packets_tx, packets_rx) = mpsc::unbounded_channel();
        let config = Arc::clone(session.config());

        Arc::new_cyclic(move |weak: &Weak<Self>| {
            let strategy: Weak<dyn Reconnect> = weak.clone();
            let channel = Arc::new(ProtocolChannel::new(
                name.clone(),
                transport,
                strategy,
                &config,
            ));

            Self {
                id: HandlerId::next(),
                name,
                session,
                channel,
                this: weak.clone(),
                status: RwLock::new(HandlerStatus::Inactive),
                registry: Mutex::new(Registry::default()),
                reader: Mutex::new(Reader::default()),
                packets_tx: Mutex::new(Some(packets_tx)),
                packets_rx: Mutex::new(Some(packets_rx)),
                max_subscriptions: config.max_streams_per_multiplexer(),
                interval: config.send_interval(),
                deleted: AtomicBool::new(false),
            }
        })
    }

    /// Opens the streaming socket, subscribes the keepalive stream, starts
    /// the token-scoped keepalive and attaches to `session`.
    ///
    /// # Errors
    ///
    /// - [`Error::NotLoggedIn`] if the session holds no token
    /// - Transport errors of the open or of the keepalive subscription
    pub async fn connect(
        name: impl Into<String>,
        session: Arc<Session>,
        transport: Box<dyn Transport>,
    ) -> Result<Arc<Self>> {
        let token = session.token().ok_or(Error::NotLoggedIn)?;
        let mux = Self::build(name.into(), Arc::clone(&session), transport);

        let opened = {
            let mut link = mux.channel.lock().await;
            match link.transport().open().await {
                Ok(()) => {
                    mux.set_status(HandlerStatus::Active);
                    mux.subscribe_on(&mut link, KEEP_ALIVE, Arguments::new(), false)
                        .await
                        .map(|_| ())
                }
                Err(e) => Err(e),
            }
        };

        if let Err(e) = opened {
            error!(handler = %mux.name, error = %e, "Stream connect failed");
            mux.stop_reader(false).await;
            mux.channel.lock().await.transport().close().await;
            mux.set_status(HandlerStatus::Inactive);
            return Err(e);
        }

        mux.channel.start_ping(Some(token));
        session.attach_stream(&mux);

        info!(handler = %mux.name, session = %session.name(), "Stream multiplexer ready");
        Ok(mux)
    }
}

// ============================================================================
// StreamMultiplexer - Accessors
// ============================================================================

impl StreamMultiplexer {
    /// Handler id.
    #[inline]
    #[must_use]
    pub fn id(&self) -> HandlerId {
        self.id
    }

    /// Handler name.
    #[inline]
    #[must_use]
    pub fn name(&self) -> &str {
        &self.name
    }

    /// Parent session.
    #[inline]
    #[must_use]
    pub fn session(&self) -> &Arc<Session> {
        &self.session
    }

    /// Current lifecycle state.
    #[must_use]
    pub fn status(&self) -> HandlerStatus {
        *self.status.read()
    }

    /// Returns `true` once deleted.
    #[inline]
    #[must_use]
    pub fn is_deleted(&self) -> bool {
        self.deleted.load(Ordering::SeqCst)
    }

    /// Number of registered subscriptions, keepalive included.
    #[must_use]
    pub fn subscription_count(&self) -> usize {
        self.registry.lock().entries.len()
    }

    /// Subscription budget of this multiplexer.
    #[inline]
    #[must_use]
    pub fn max_subscriptions(&self) -> usize {
        self.max_subscriptions
    }

    /// Returns `true` while another subscription fits.
    #[must_use]
    pub fn has_capacity(&self) -> bool {
        self.subscription_count() < self.max_subscriptions
    }

    /// Takes the receiver of pushed packets. Only the first call gets it.
    #[must_use]
    pub fn take_packets(&self) -> Option<UnboundedReceiver<StreamPacket>> {
        self.packets_rx.lock().take()
    }

    fn set_status(&self, status: HandlerStatus) {
        let mut current = self.status.write();
        if *current != HandlerStatus::Deleted {
            *current = status;
        }
    }

    fn ensure_alive(&self) -> Result<()> {
        if self.is_deleted() {
            return Err(Error::handler_deleted(&self.name));
        }
        Ok(())
    }
}

// ============================================================================
// StreamMultiplexer - Subscriptions
// ============================================================================

impl StreamMultiplexer {
    /// Subscribes to `get<command>`.
    ///
    /// Transport failures reconnect and resend once.
    ///
    /// # Errors
    ///
    /// - [`Error::NotLoggedIn`] if the session holds no token
    /// - [`Error::KeepAliveRequired`] before the keepalive subscription
    /// - [`Error::SubscriptionLimit`] once the budget is used up
    /// - Transport errors of the retry
    pub async fn subscribe(
        &self,
        command: &str,
        arguments: Option<Arguments>,
    ) -> Result<SubscriptionId> {
        self.ensure_alive()?;
        let mut link = self.channel.lock().await;
        self.subscribe_on(&mut link, command, arguments.unwrap_or_default(), true)
            .await
    }

    async fn subscribe_on(
        &self,
        link: &mut Link<'_>,
        command: &str,
        arguments: Arguments,
        retry: bool,
    ) -> Result<SubscriptionId> {
        let token = self.session.token().ok_or_else(|| {
            error!(handler = %self.name, "No session token");
            Error::NotLoggedIn
        })?;

        {
            let registry = self.registry.lock();
            let is_keepalive = command == KEEP_ALIVE;

            if !is_keepalive && !registry.keepalive_live {
                return Err(Error::keep_alive_required(command));
            }

            let reuses_entry = is_keepalive && registry.keepalive.is_some();
            if !reuses_entry && registry.entries.len() >= self.max_subscriptions {
                return Err(Error::SubscriptionLimit {
                    limit: self.max_subscriptions,
                });
            }
        }

        info!(handler = %self.name, command = %readable_command(command), "Starting stream");

        let request = Request::new(format!("get{command}"))
            .with_stream_session(token)
            .with_fields(arguments.clone());
        link.request(retry, &request).await?;

        let id = self.registry.lock().register(command, arguments);
        self.ensure_reader();

        info!(
            handler = %self.name,
            command = %readable_command(command),
            subscription = %id,
            "Stream started"
        );
        Ok(id)
    }

    /// Stops reading and unsubscribes everything, then subscribes the
    /// keepalive stream again so the multiplexer stays usable.
    ///
    /// Unsubscribe failures are logged and the remaining entries are still
    /// processed. If the keepalive cannot be restored the multiplexer is
    /// deleted.
    pub async fn end_stream(&self) {
        if self.is_deleted() {
            debug!(handler = %self.name, "Stream already deleted");
            return;
        }

        self.unsubscribe_all(false).await;

        let restored = {
            let mut link = self.channel.lock().await;
            self.subscribe_on(&mut link, KEEP_ALIVE, Arguments::new(), false)
                .await
        };

        match restored {
            Ok(_) => info!(handler = %self.name, "Stream ended, keepalive restored"),
            Err(e) => {
                warn!(handler = %self.name, error = %e, "Could not restore keepalive");
                self.teardown(false).await;
            }
        }
    }

    async fn unsubscribe_all(&self, from_reader: bool) {
        info!(handler = %self.name, "Stopping stream");
        self.stop_reader(from_reader).await;

        let subscriptions = self.registry.lock().drain();
        if !subscriptions.is_empty() {
            let mut link = self.channel.lock().await;
            for (id, subscription) in subscriptions {
                // no reconnect while tearing down
                if let Err(e) = link.request(false, &subscription.stop_request()).await {
                    warn!(
                        handler = %self.name,
                        subscription = %id,
                        command = %subscription.command,
                        error = %e,
                        "Failed to end stream"
                    );
                }
            }
        }

        info!(handler = %self.name, "Subscriptions ended");
    }
}

// ============================================================================
// StreamMultiplexer - Read Loop
// ============================================================================

impl StreamMultiplexer {
    /// Starts the read loop unless one is running.
    fn ensure_reader(&self) {
        let mut reader = self.reader.lock();
        if reader.running.load(Ordering::SeqCst) {
            return;
        }

        let running = Arc::new(AtomicBool::new(true));
        reader.handle = Some(tokio::spawn(read_loop(
            self.this.clone(),
            Arc::clone(&running),
        )));
        reader.running = running;

        debug!(handler = %self.name, "Read loop started");
    }

    async fn stop_reader(&self, from_reader: bool) {
        let handle = {
            let mut reader = self.reader.lock();
            if !reader.running.swap(false, Ordering::SeqCst) {
                debug!(handler = %self.name, "Read loop already stopped");
            }
            reader.handle.take()
        };

        // the loop cannot await itself
        if from_reader {
            return;
        }

        if let Some(handle) = handle
            && timeout(JOIN_TIMEOUT, handle).await.is_err()
        {
            warn!(handler = %self.name, "Read loop did not stop in time");
        }
    }

    /// One read attempt. Returns `Ok(false)` when nothing was pending.
    async fn read_once(&self, running: &AtomicBool) -> Result<bool> {
        let packets = {
            let mut link = self.channel.lock().await;
            if !running.load(Ordering::SeqCst) {
                return Ok(false);
            }

            if !link.check_ready(Readiness::Basic) {
                warn!(handler = %self.name, "Stream socket unhealthy");
                link.recover().await;
                if !link.check_ready(Readiness::Basic) {
                    return Err(Error::ConnectionClosed);
                }
                return Ok(false);
            }

            if !link.check_ready(Readiness::Readable) {
                return Ok(false);
            }

            link.receive_packets(true).await?
        };

        for packet in packets {
            let data = packet
                .data
                .filter(|data| !is_empty_payload(data))
                .ok_or(Error::MissingField { field: "data" })?;

            trace!(handler = %self.name, command = ?packet.command, "Packet received");
            let delivered = self.packets_tx.lock().as_ref().is_some_and(|tx| {
                tx.send(StreamPacket {
                    command: packet.command,
                    data,
                })
                .is_ok()
            });
            if !delivered {
                trace!(handler = %self.name, "Packet receiver dropped");
            }
        }

        Ok(true)
    }
}

async fn read_loop(mux: Weak<StreamMultiplexer>, running: Arc<AtomicBool>) {
    while running.load(Ordering::SeqCst) {
        let Some(mux) = mux.upgrade() else {
            break;
        };

        match mux.read_once(&running).await {
            Ok(true) => {}
            Ok(false) => sleep(mux.interval).await,
            Err(e) => {
                // pushed packets carry no subscription id, so the whole stream ends
                error!(handler = %mux.name, error = %e, "Failed to read stream");
                mux.teardown(true).await;
                break;
            }
        }
    }
}

/// Empty payloads end the stream.
fn is_empty_payload(data: &Value) -> bool {
    match data {
        Value::Null => true,
        Value::Object(map) => map.is_empty(),
        Value::Array(items) => items.is_empty(),
        Value::String(text) => text.is_empty(),
        _ => false,
    }
}

// ============================================================================
// StreamMultiplexer - Repair
// ============================================================================

impl StreamMultiplexer {
    /// Repairs the session if possible, then this multiplexer's socket.
    ///
    /// # Errors
    ///
    /// Returns the error of the session repair or of reopening the socket.
    pub async fn reconnect(&self) -> Result<()> {
        self.ensure_alive()?;
        let mut link = self.channel.lock().await;
        Reconnect::reconnect(self, &mut link).await
    }
}

#[async_trait]
impl Reconnect for StreamMultiplexer {
    async fn reconnect(&self, link: &mut Link<'_>) -> Result<()> {
        // phase one: repair the shared session unless someone else is at it
        match self.session.try_repair().await? {
            RepairOutcome::Repaired => {
                info!(handler = %self.name, "Session repaired by stream");
            }
            RepairOutcome::Healthy => {
                debug!(handler = %self.name, "Session connection already active");
            }
            RepairOutcome::Skipped => {
                info!(handler = %self.name, "Session repair in progress elsewhere");
            }
        }

        // phase two: waits out a running session repair, so the token is fresh
        let _guard = self.session.reconnect_lock().lock().await;

        if link.check_ready(Readiness::Basic) {
            debug!(handler = %self.name, "Stream connection already active");
            return Ok(());
        }

        warn!(handler = %self.name, "Stream socket unhealthy, reconnecting");
        self.set_status(HandlerStatus::Inactive);

        link.transport().create().await?;
        link.transport().open().await?;

        self.registry.lock().keepalive_live = false;
        self.set_status(HandlerStatus::Active);
        self.subscribe_on(link, KEEP_ALIVE, Arguments::new(), false)
            .await?;
        self.channel.start_ping(self.session.token());

        info!(handler = %self.name, "Stream reconnected");
        Ok(())
    }
}

// ============================================================================
// StreamMultiplexer - Teardown
// ============================================================================

impl StreamMultiplexer {
    /// Tears down the multiplexer. Idempotent.
    ///
    /// Ends all subscriptions, stops the keepalive, closes the socket,
    /// closes the packet channel and detaches from the session. A read fault
    /// does the same from inside the read loop.
    pub async fn delete(&self) {
        self.teardown(false).await;
    }

    async fn teardown(&self, from_reader: bool) {
        if self.deleted.swap(true, Ordering::SeqCst) {
            debug!(handler = %self.name, "Stream already deleted");
            return;
        }

        info!(handler = %self.name, "Deleting stream");

        self.unsubscribe_all(from_reader).await;
        self.channel.stop_ping(false).await;
        self.channel.lock().await.transport().close().await;
        self.packets_tx.lock().take();
        self.session.detach_stream(self.id);
        *self.status.write() = HandlerStatus::Deleted;

        info!(handler = %self.name, "Stream deleted");
    }
}

impl fmt::Debug for StreamMultiplexer {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("StreamMultiplexer")
            .field("id", &self.id)
            .field("name", &self.name)
            .field("session", &self.session.name())
            .field("status", &self.status())
            .finish_non_exhaustive()
    }
}

// ============================================================================
// Tests
// ============================================================================

#[cfg(test)]
mod tests {
    use super::*;

    use std::sync::atomic::AtomicUsize;

    use serde_json::json;

    use crate::config::{ClientConfig, Credentials};
    use crate::transport::mock::{MockState, MockTransport, WireEvent, xapi_responder};

    fn config(send_interval_ms: u64) -> Arc<ClientConfig> {
        Arc::new(ClientConfig {
            send_interval_ms,
            credentials: Credentials::new("1000", "secret"),
            ..Default::default()
        })
    }

    async fn session(send_interval_ms: u64) -> (Arc<Session>, Arc<MockState>) {
        let state = MockState::new(xapi_responder());
        let transport = Box::new(MockTransport::new(Arc::clone(&state), false));
        let session = Session::connect("session-0", config(send_interval_ms), transport)
            .await
            .expect("session");
        (session, state)
    }

    async fn multiplexer(session: &Arc<Session>, name: &str) -> (Arc<StreamMultiplexer>, Arc<MockState>) {
        let state = MockState::new(xapi_responder());
        let transport = Box::new(MockTransport::new(Arc::clone(&state), true));
        let mux = StreamMultiplexer::connect(name, Arc::clone(session), transport)
            .await
            .expect("multiplexer");
        (mux, state)
    }

    fn sent(state: &MockState) -> Vec<Value> {
        state
            .events()
            .into_iter()
            .filter_map(|e| match e {
                WireEvent::Send(value) => Some(value),
                _ => None,
            })
            .collect()
    }

    fn args(value: Value) -> Arguments {
        match value {
            Value::Object(map) => map,
            _ => panic!("not an object"),
        }
    }

    async fn wait_for(mut condition: impl FnMut() -> bool) {
        for _ in 0..200 {
            if condition() {
                return;
            }
            sleep(Duration::from_millis(5)).await;
        }
        panic!("condition not met");
    }

    #[tokio::test]
    async fn test_connect_subscribes_keepalive_first() {
        let (session, _) = session(10).await;
        let (mux, state) = multiplexer(&session, "stream-0").await;

        let first = sent(&state).into_iter().next().expect("request");
        assert_eq!(first, json!({"command": "getKeepAlive", "streamSessionId": "token-1"}));

        assert_eq!(mux.status(), HandlerStatus::Active);
        assert_eq!(mux.subscription_count(), 1);
        assert_eq!(session.attached_streams(), 1);
        mux.delete().await;
    }

    #[tokio::test]
    async fn test_subscribe_sends_flat_stream_request() {
        let (session, _) = session(10).await;
        let (mux, state) = multiplexer(&session, "stream-0").await;

        let id = mux
            .subscribe("TickPrices", Some(args(json!({"symbol": "EURUSD", "minArrivalTime": 1}))))
            .await
            .expect("subscribe");

        assert_eq!(id, SubscriptionId::new(1));
        assert_eq!(
            sent(&state).last().cloned().expect("request"),
            json!({
                "command": "getTickPrices",
                "streamSessionId": "token-1",
                "symbol": "EURUSD",
                "minArrivalTime": 1
            })
        );
        assert_eq!(mux.subscription_count(), 2);
        mux.delete().await;
    }

    #[tokio::test]
    async fn test_subscription_before_keepalive_is_rejected() {
        let (session, _) = session(10).await;
        let state = MockState::new(xapi_responder());
        let mut transport = MockTransport::new(Arc::clone(&state), true);
        transport.open().await.expect("open");

        let mux = StreamMultiplexer::build("stream-0".to_string(), session, Box::new(transport));
        let err = mux.subscribe("TickPrices", None).await.unwrap_err();

        assert!(matches!(err, Error::KeepAliveRequired { .. }));
        assert!(sent(&state).is_empty());
    }

    #[tokio::test]
    async fn test_subscription_limit() {
        // 1000 / 500 leaves room for keepalive plus one
        let (session, _) = session(500).await;
        let (mux, _state) = multiplexer(&session, "stream-0").await;
        assert_eq!(mux.max_subscriptions(), 2);

        mux.subscribe("Balance", None).await.expect("subscribe");
        assert!(!mux.has_capacity());

        let err = mux.subscribe("Trades", None).await.unwrap_err();
        assert!(matches!(err, Error::SubscriptionLimit { limit: 2 }));
        assert_eq!(mux.subscription_count(), 2);
        mux.delete().await;
    }

    #[tokio::test]
    async fn test_packets_are_delivered() {
        let (session, _) = session(10).await;
        let (mux, state) = multiplexer(&session, "stream-0").await;
        let mut packets = mux.take_packets().expect("receiver");
        assert!(mux.take_packets().is_none());

        state.push_inbound(json!({"command": "tickPrices", "data": {"symbol": "EURUSD", "ask": 1.1}}));

        let packet = timeout(Duration::from_secs(1), packets.recv())
            .await
            .expect("in time")
            .expect("packet");
        assert_eq!(packet.command.as_deref(), Some("tickPrices"));
        assert_eq!(packet.data["ask"], 1.1);
        mux.delete().await;
    }

    #[tokio::test]
    async fn test_empty_payload_ends_stream() {
        let (session, _) = session(10).await;
        let (mux, state) = multiplexer(&session, "stream-0").await;
        mux.subscribe("TickPrices", Some(args(json!({"symbol": "EURUSD"}))))
            .await
            .expect("subscribe");

        let mut packets = mux.take_packets().expect("receiver");
        state.push_inbound(json!({"command": "tickPrices", "data": {}}));
        wait_for(|| mux.status() == HandlerStatus::Deleted).await;

        assert!(mux.is_deleted());
        assert_eq!(mux.subscription_count(), 0);
        assert_eq!(session.attached_streams(), 0);
        assert!(!mux.channel.is_pinging());
        assert_eq!(state.count(&WireEvent::Close), 1);

        let commands = state.sent_commands();
        assert!(commands.contains(&"stopKeepAlive".to_string()));
        assert!(commands.contains(&"stopTickPrices".to_string()));

        let end = timeout(Duration::from_secs(1), packets.recv())
            .await
            .expect("in time");
        assert!(end.is_none());

        mux.delete().await;
        assert_eq!(state.count(&WireEvent::Close), 1);
    }

    #[tokio::test]
    async fn test_end_stream_carries_symbol() {
        let (session, _) = session(10).await;
        let (mux, state) = multiplexer(&session, "stream-0").await;
        mux.subscribe("TickPrices", Some(args(json!({"symbol": "EURUSD", "level": 0}))))
            .await
            .expect("subscribe");

        mux.end_stream().await;

        let stops: Vec<Value> = sent(&state)
            .into_iter()
            .filter(|v| v["command"].as_str().is_some_and(|c| c.starts_with("stop")))
            .collect();
        assert_eq!(
            stops,
            vec![
                json!({"command": "stopKeepAlive"}),
                json!({"command": "stopTickPrices", "symbol": "EURUSD"}),
            ]
        );
        assert_eq!(mux.status(), HandlerStatus::Active);
        mux.delete().await;
    }

    #[tokio::test]
    async fn test_end_stream_keeps_multiplexer_usable() {
        let (session, _) = session(500).await;
        let (mux, state) = multiplexer(&session, "stream-0").await;
        mux.subscribe("Balance", None).await.expect("subscribe");
        assert!(!mux.has_capacity());

        mux.end_stream().await;

        assert_eq!(mux.status(), HandlerStatus::Active);
        assert_eq!(mux.subscription_count(), 1);
        assert!(mux.has_capacity());
        assert!(mux.channel.is_pinging());
        assert_eq!(state.count_sent("getKeepAlive"), 2);
        assert_eq!(state.count(&WireEvent::Close), 0);

        mux.subscribe("Balance", None).await.expect("subscribe again");
        assert_eq!(state.count_sent("getBalance"), 2);
        mux.delete().await;
    }

    #[tokio::test]
    async fn test_end_stream_deletes_when_keepalive_fails() {
        let (session, _) = session(10).await;
        let (mux, state) = multiplexer(&session, "stream-0").await;
        state.fail_opens(5);
        state.sever();

        mux.end_stream().await;

        // the read loop may get to the dead socket first, either way it ends
        wait_for(|| mux.status() == HandlerStatus::Deleted).await;
        assert!(mux.is_deleted());
        assert_eq!(session.attached_streams(), 0);
    }

    /// Counts overlapping wire calls on a wrapped mock.
    struct Exclusive {
        inner: MockTransport,
        active: Arc<AtomicUsize>,
        peak: Arc<AtomicUsize>,
    }

    impl Exclusive {
        async fn enter(&self) {
            let now = self.active.fetch_add(1, Ordering::SeqCst) + 1;
            self.peak.fetch_max(now, Ordering::SeqCst);
            for _ in 0..3 {
                tokio::task::yield_now().await;
            }
        }

        fn leave(&self) {
            self.active.fetch_sub(1, Ordering::SeqCst);
        }
    }

    #[async_trait]
    impl Transport for Exclusive {
        fn check_ready(&mut self, mode: Readiness) -> bool {
            self.inner.check_ready(mode)
        }

        async fn create(&mut self) -> Result<()> {
            self.inner.create().await
        }

        async fn open(&mut self) -> Result<()> {
            self.inner.open().await
        }

        async fn send(&mut self, message: &str) -> Result<()> {
            self.enter().await;
            let result = self.inner.send(message).await;
            self.leave();
            result
        }

        async fn receive(&mut self) -> Result<String> {
            self.enter().await;
            let result = self.inner.receive().await;
            self.leave();
            result
        }

        async fn close(&mut self) {
            self.inner.close().await;
        }

        fn is_streaming(&self) -> bool {
            self.inner.is_streaming()
        }
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 4)]
    async fn test_concurrent_subscribes_do_not_interleave() {
        let (session, _) = session(10).await;
        let state = MockState::new(xapi_responder());
        let peak = Arc::new(AtomicUsize::new(0));
        let transport = Exclusive {
            inner: MockTransport::new(Arc::clone(&state), true),
            active: Arc::new(AtomicUsize::new(0)),
            peak: Arc::clone(&peak),
        };
        let mux = StreamMultiplexer::connect("stream-0", Arc::clone(&session), Box::new(transport))
            .await
            .expect("multiplexer");

        // packets keep the reader busy on the same socket meanwhile
        for i in 0..6 {
            state.push_inbound(json!({"command": "balance", "data": {"balance": i}}));
        }

        let commands = ["Balance", "Trades", "News", "Profits", "TradeStatus", "Candles"];
        let tasks: Vec<_> = commands
            .into_iter()
            .map(|command| {
                let mux = Arc::clone(&mux);
                tokio::spawn(async move { mux.subscribe(command, None).await })
            })
            .collect();
        for task in tasks {
            task.await.expect("join").expect("subscribe");
        }

        assert_eq!(peak.load(Ordering::SeqCst), 1);
        for command in commands {
            assert_eq!(state.count_sent(&format!("get{command}")), 1);
        }
        assert_eq!(
            sent(&state).first().cloned().expect("request")["command"],
            "getKeepAlive"
        );
        assert_eq!(mux.subscription_count(), commands.len() + 1);
        mux.delete().await;
    }

    #[tokio::test]
    async fn test_reconnect_resubscribes_keepalive_once() {
        let (session, data_state) = session(10).await;
        let (mux, state) = multiplexer(&session, "stream-0").await;
        state.sever();

        mux.reconnect().await.expect("reconnect");

        assert_eq!(state.count(&WireEvent::Create), 1);
        assert_eq!(state.count_sent("getKeepAlive"), 2);
        assert_eq!(mux.subscription_count(), 1);
        assert_eq!(mux.status(), HandlerStatus::Active);
        assert_eq!(data_state.count(&WireEvent::Create), 0);
        mux.delete().await;
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 4)]
    async fn test_concurrent_stream_reconnects_repair_session_once() {
        let (session, data_state) = session(10).await;
        let (first, _) = multiplexer(&session, "stream-0").await;
        let (second, _) = multiplexer(&session, "stream-1").await;
        data_state.sever();

        let (a, b) = tokio::join!(first.reconnect(), second.reconnect());
        a.expect("first");
        b.expect("second");

        assert_eq!(data_state.count(&WireEvent::Create), 1);
        assert_eq!(data_state.count_sent("login"), 2);
        assert_eq!(session.status(), HandlerStatus::Active);
        session.delete().await;
    }

    #[tokio::test]
    async fn test_stream_reconnect_skips_while_session_repairs() {
        let (session, data_state) = session(10).await;
        let (mux, state) = multiplexer(&session, "stream-0").await;
        data_state.sever();

        let guard = session.reconnect_lock().lock().await;
        let outcome = session.try_repair().await.expect("try");
        assert_eq!(outcome, RepairOutcome::Skipped);
        drop(guard);

        mux.reconnect().await.expect("reconnect");
        assert_eq!(data_state.count(&WireEvent::Create), 1);
        assert_eq!(state.count(&WireEvent::Create), 0);
        mux.delete().await;
    }

    #[tokio::test]
    async fn test_delete_detaches_and_is_idempotent() {
        let (session, _) = session(10).await;
        let (mux, state) = multiplexer(&session, "stream-0").await;

        mux.delete().await;
        mux.delete().await;

        assert_eq!(mux.status(), HandlerStatus::Deleted);
        assert_eq!(session.attached_streams(), 0);
        assert_eq!(state.count(&WireEvent::Close), 1);
        assert_eq!(state.count_sent("stopKeepAlive"), 1);
        assert!(matches!(
            mux.subscribe("Balance", None).await,
            Err(Error::HandlerDeleted { .. })
        ));
    }

    #[tokio::test]
    async fn test_session_delete_cascades() {
        let (session, _) = session(10).await;
        let (mux, _) = multiplexer(&session, "stream-0").await;

        session.delete().await;

        assert_eq!(mux.status(), HandlerStatus::Deleted);
        assert_eq!(session.status(), HandlerStatus::Deleted);
        assert_eq!(session.attached_streams(), 0);
    }
}
