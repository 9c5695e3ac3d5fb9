//! JSON request/response channel over one transport.
//!
//! The wire carries no correlation id, so every exchange on a handler must
//! run under its ping lock. [`ProtocolChannel::lock`] hands out a [`Link`],
//! the only way to reach the transport.
//!
//! # Retry Policy
//!
//! `request`, `receive_validated` and `receive_packets` take a `retry` flag.
//! On a transport error with `retry` set, the injected [`Reconnect`]
//! strategy runs once and the operation is attempted once more. Server
//! rejections never trigger it.

// ============================================================================
// Imports
// ============================================================================

use std::sync::{Arc, Weak};
use std::time::Duration;

use async_trait::async_trait;
use parking_lot::Mutex;
use tokio::sync::{Mutex as AsyncMutex, MutexGuard};
use tokio::time::timeout;
use tracing::{debug, warn};

use crate::config::ClientConfig;
use crate::error::{Error, Result};
use crate::transport::{Readiness, Transport};

use super::keepalive::{JOIN_TIMEOUT, Keepalive};
use super::request::{Request, Response, readable_command};

// ============================================================================
// Reconnect
// ============================================================================

/// Repair strategy injected into a channel.
///
/// Called with the ping lock already held, through the same [`Link`] whose
/// operation failed.
#[async_trait]
pub trait Reconnect: Send + Sync {
    /// Restores the connection behind `link`.
    async fn reconnect(&self, link: &mut Link<'_>) -> Result<()>;
}

// ============================================================================
// ProtocolChannel
// ============================================================================

/// Transport, ping lock, keepalive state and reconnect strategy of one
/// handler.
pub struct ProtocolChannel {
    /// Handler name for logs.
    name: String,
    /// Transport behind the ping lock.
    wire: AsyncMutex<Box<dyn Transport>>,
    /// Injected repair strategy.
    reconnect: Weak<dyn Reconnect>,
    /// Ping loop state.
    keepalive: Mutex<Keepalive>,
    /// Keepalive period.
    ping_interval: Duration,
    /// Keepalive wake-up period.
    poll_interval: Duration,
}

impl ProtocolChannel {
    /// Creates a channel.
    ///
    /// The keepalive loop polls at a tenth of the send interval.
    #[must_use]
    pub fn new(
        name: impl Into<String>,
        transport: Box<dyn Transport>,
        reconnect: Weak<dyn Reconnect>,
        config: &ClientConfig,
    ) -> Self {
        Self {
            name: name.into(),
            wire: AsyncMutex::new(transport),
            reconnect,
            keepalive: Mutex::new(Keepalive::default()),
            ping_interval: config.ping_interval(),
            poll_interval: (config.send_interval() / 10).max(Duration::from_millis(1)),
        }
    }

    /// Handler name.
    #[inline]
    #[must_use]
    pub fn name(&self) -> &str {
        &self.name
    }

    /// Keepalive period.
    #[inline]
    #[must_use]
    pub fn ping_interval(&self) -> Duration {
        self.ping_interval
    }

    /// Keepalive wake-up period.
    #[inline]
    #[must_use]
    pub fn poll_interval(&self) -> Duration {
        self.poll_interval
    }

    /// Waits for the ping lock.
    pub async fn lock(&self) -> Link<'_> {
        Link {
            transport: self.wire.lock().await,
            channel: self,
        }
    }

    /// Takes the ping lock if it is free.
    #[must_use]
    pub fn try_lock(&self) -> Option<Link<'_>> {
        self.wire.try_lock().ok().map(|transport| Link {
            transport,
            channel: self,
        })
    }

    // ========================================================================
    // Keepalive
    // ========================================================================

    /// Starts (or restarts) the ping loop.
    ///
    /// With a token the pings are stream-scoped and expect no response.
    pub fn start_ping(self: &Arc<Self>, token: Option<String>) {
        debug!(handler = %self.name, stream = token.is_some(), "Starting keepalive");
        self.keepalive.lock().restart(Arc::downgrade(self), token);
    }

    /// Stops the ping loop. Idempotent.
    ///
    /// Waits up to [`JOIN_TIMEOUT`] for the loop to finish, except when
    /// called from inside the loop itself.
    pub async fn stop_ping(&self, from_within: bool) {
        let handle = self.keepalive.lock().signal_stop();
        let Some(handle) = handle else {
            debug!(handler = %self.name, "Keepalive already stopped");
            return;
        };

        if from_within {
            return;
        }

        if timeout(JOIN_TIMEOUT, handle).await.is_err() {
            warn!(handler = %self.name, "Keepalive did not stop in time");
        }
    }

    /// Returns `true` while the ping loop runs.
    #[must_use]
    pub fn is_pinging(&self) -> bool {
        self.keepalive.lock().is_running()
    }

    /// Token of the running ping loop.
    #[must_use]
    pub fn ping_token(&self) -> Option<String> {
        self.keepalive.lock().token().map(str::to_string)
    }
}

impl std::fmt::Debug for ProtocolChannel {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ProtocolChannel")
            .field("name", &self.name)
            .field("ping_interval", &self.ping_interval)
            .finish_non_exhaustive()
    }
}

// ============================================================================
// Link
// ============================================================================

/// Held ping lock of a channel.
///
/// Dropping the link releases the lock.
pub struct Link<'a> {
    transport: MutexGuard<'a, Box<dyn Transport>>,
    channel: &'a ProtocolChannel,
}

impl Link<'_> {
    /// The locked transport.
    #[inline]
    pub fn transport(&mut self) -> &mut dyn Transport {
        self.transport.as_mut()
    }

    /// Zero-timeout readiness check of the locked transport.
    #[inline]
    pub fn check_ready(&mut self, mode: Readiness) -> bool {
        self.transport.check_ready(mode)
    }

    /// Name of the owning handler.
    #[inline]
    #[must_use]
    pub fn handler_name(&self) -> &str {
        &self.channel.name
    }

    /// Encodes and sends one request.
    ///
    /// # Errors
    ///
    /// Returns the transport's error, or [`Error::Json`] if encoding fails.
    pub async fn send_request(&mut self, request: &Request) -> Result<()> {
        let text = request.encode()?;
        debug!(
            handler = %self.channel.name,
            command = %readable_command(&request.command),
            "Sending request"
        );
        self.transport.send(&text).await
    }

    /// Receives and decodes one response.
    ///
    /// # Errors
    ///
    /// Returns the transport's error, or [`Error::MalformedResponse`].
    pub async fn receive_response(&mut self) -> Result<Response> {
        let text = self.transport.receive().await?;
        let response = Response::decode(&text)?;
        debug!(handler = %self.channel.name, status = ?response.status, "Received response");
        Ok(response)
    }

    /// Sends a request, reconnecting and resending once if allowed.
    ///
    /// # Errors
    ///
    /// Returns the error of the last attempt.
    pub async fn request(&mut self, retry: bool, request: &Request) -> Result<()> {
        match self.send_request(request).await {
            Err(e) if retry && e.is_transport_error() => {
                warn!(
                    handler = %self.channel.name,
                    command = %request.command,
                    error = %e,
                    "Request failed, reconnecting"
                );
                self.recover().await;
                self.send_request(request).await
            }
            result => result,
        }
    }

    /// Receives a response, reconnecting and receiving once more if allowed,
    /// then checks its status.
    ///
    /// # Errors
    ///
    /// - Transport errors of the last attempt
    /// - [`Error::Server`] on `status: false`
    /// - [`Error::MissingField`] if `expect_status` is set and `status` is absent
    pub async fn receive_validated(&mut self, retry: bool, expect_status: bool) -> Result<Response> {
        let response = match self.receive_response().await {
            Err(e) if retry && e.is_transport_error() => {
                warn!(handler = %self.channel.name, error = %e, "Receive failed, reconnecting");
                self.recover().await;
                self.receive_response().await?
            }
            result => result?,
        };

        response.validate(expect_status)
    }

    /// Receives every pushed packet of one stream read.
    ///
    /// # Errors
    ///
    /// Returns the transport's error of the last attempt, or
    /// [`Error::MalformedResponse`].
    pub async fn receive_packets(&mut self, retry: bool) -> Result<Vec<Response>> {
        match self.receive_all().await {
            Err(e) if retry && e.is_transport_error() => {
                warn!(handler = %self.channel.name, error = %e, "Stream read failed, reconnecting");
                self.recover().await;
                self.receive_all().await
            }
            result => result,
        }
    }

    /// Sends a keepalive ping.
    ///
    /// A stream-scoped ping carries the token and gets no response; a data
    /// ping is answered and validated.
    ///
    /// # Errors
    ///
    /// Returns the error of the request or of the response.
    pub async fn ping(&mut self, token: Option<&str>) -> Result<()> {
        let mut request = Request::new("ping");
        if let Some(token) = token {
            request = request.with_stream_session(token);
        }

        self.request(true, &request).await?;
        if token.is_none() {
            self.receive_validated(true, true).await?;
        }
        Ok(())
    }

    async fn receive_all(&mut self) -> Result<Vec<Response>> {
        let text = self.transport.receive().await?;
        Response::decode_all(&text)
    }

    /// Runs the injected strategy once. Failures are logged only, the caller
    /// retries regardless.
    pub(crate) async fn recover(&mut self) {
        let Some(strategy) = self.channel.reconnect.upgrade() else {
            warn!(handler = %self.channel.name, error = %Error::ReconnectUnavailable, "Cannot reconnect");
            return;
        };

        if let Err(e) = strategy.reconnect(self).await {
            warn!(handler = %self.channel.name, error = %e, "Reconnect failed");
        }
    }
}

// ============================================================================
// Tests
// ============================================================================

#[cfg(test)]
mod tests {
    use super::*;

    use std::sync::atomic::{AtomicUsize, Ordering};

    use serde_json::{Value, json};

    use crate::transport::mock::{MockState, MockTransport, WireEvent, xapi_responder};

    /// Reopens the transport and counts invocations.
    #[derive(Default)]
    struct Reopen {
        calls: AtomicUsize,
    }

    #[async_trait]
    impl Reconnect for Reopen {
        async fn reconnect(&self, link: &mut Link<'_>) -> Result<()> {
            self.calls.fetch_add(1, Ordering::SeqCst);
            link.transport().create().await?;
            link.transport().open().await
        }
    }

    fn config() -> ClientConfig {
        ClientConfig {
            send_interval_ms: 10,
            ping_interval_ms: 30,
            ..Default::default()
        }
    }

    async fn channel(
        strategy: &Arc<Reopen>,
        responder: crate::transport::mock::Responder,
    ) -> (Arc<ProtocolChannel>, Arc<MockState>) {
        let state = MockState::new(responder);
        let mut transport = MockTransport::new(Arc::clone(&state), false);
        transport.open().await.expect("open");

        let weak: Weak<Reopen> = Arc::downgrade(strategy);
        let channel = Arc::new(ProtocolChannel::new("session-0", Box::new(transport), weak, &config()));
        (channel, state)
    }

    #[tokio::test]
    async fn test_request_and_validated_response() {
        let strategy = Arc::new(Reopen::default());
        let (channel, state) = channel(&strategy, xapi_responder()).await;

        let mut link = channel.lock().await;
        link.request(false, &Request::new("getVersion")).await.expect("send");
        let response = link.receive_validated(false, true).await.expect("receive");

        assert_eq!(response.status, Some(true));
        assert_eq!(state.sent_commands(), vec!["getVersion"]);
        assert_eq!(strategy.calls.load(Ordering::SeqCst), 0);
    }

    #[tokio::test]
    async fn test_transport_failure_reconnects_once_and_retries_once() {
        let strategy = Arc::new(Reopen::default());
        let (channel, state) = channel(&strategy, xapi_responder()).await;
        state.fail_sends(1);

        let mut link = channel.lock().await;
        link.request(true, &Request::new("getVersion")).await.expect("retried send");

        assert_eq!(strategy.calls.load(Ordering::SeqCst), 1);
        assert_eq!(state.count_sent("getVersion"), 2);
    }

    #[tokio::test]
    async fn test_no_retry_when_disabled() {
        let strategy = Arc::new(Reopen::default());
        let (channel, state) = channel(&strategy, xapi_responder()).await;
        state.fail_sends(1);

        let mut link = channel.lock().await;
        let result = link.request(false, &Request::new("getVersion")).await;

        assert!(result.is_err());
        assert_eq!(strategy.calls.load(Ordering::SeqCst), 0);
        assert_eq!(state.count_sent("getVersion"), 1);
    }

    #[tokio::test]
    async fn test_retry_is_single_shot() {
        let strategy = Arc::new(Reopen::default());
        let (channel, state) = channel(&strategy, xapi_responder()).await;
        state.fail_sends(5);

        let mut link = channel.lock().await;
        let result = link.request(true, &Request::new("getVersion")).await;

        assert!(result.unwrap_err().is_transport_error());
        assert_eq!(strategy.calls.load(Ordering::SeqCst), 1);
        assert_eq!(state.count_sent("getVersion"), 2);
    }

    #[tokio::test]
    async fn test_server_rejection_does_not_reconnect() {
        let strategy = Arc::new(Reopen::default());
        let responder: crate::transport::mock::Responder = Arc::new(|_: &Value| {
            Some(json!({"status": false, "errorCode": "E1", "errorDescr": "bad"}))
        });
        let (channel, _state) = channel(&strategy, responder).await;

        let mut link = channel.lock().await;
        link.request(true, &Request::new("getVersion")).await.expect("send");
        let err = link.receive_validated(true, true).await.unwrap_err();

        assert!(err.is_server_error());
        assert_eq!(strategy.calls.load(Ordering::SeqCst), 0);
    }

    #[tokio::test]
    async fn test_missing_status_is_not_retried() {
        let strategy = Arc::new(Reopen::default());
        let responder: crate::transport::mock::Responder =
            Arc::new(|_: &Value| Some(json!({"returnData": 1})));
        let (channel, _state) = channel(&strategy, responder).await;

        let mut link = channel.lock().await;
        link.request(true, &Request::new("getVersion")).await.expect("send");
        let err = link.receive_validated(true, true).await.unwrap_err();

        assert!(matches!(err, Error::MissingField { field: "status" }));
        assert_eq!(strategy.calls.load(Ordering::SeqCst), 0);
    }

    #[tokio::test]
    async fn test_try_lock_fails_while_held() {
        let strategy = Arc::new(Reopen::default());
        let (channel, _state) = channel(&strategy, xapi_responder()).await;

        let link = channel.lock().await;
        assert!(channel.try_lock().is_none());
        drop(link);
        assert!(channel.try_lock().is_some());
    }

    #[tokio::test]
    async fn test_keepalive_pings_and_stops() {
        let strategy = Arc::new(Reopen::default());
        let (channel, state) = channel(&strategy, xapi_responder()).await;

        channel.start_ping(None);
        assert!(channel.is_pinging());

        tokio::time::sleep(Duration::from_millis(150)).await;
        channel.stop_ping(false).await;
        assert!(!channel.is_pinging());

        let pings = state.count_sent("ping");
        assert!(pings >= 1);
        // data pings are answered and validated
        assert!(state.count(&WireEvent::Receive) >= pings);

        tokio::time::sleep(Duration::from_millis(100)).await;
        assert_eq!(state.count_sent("ping"), pings);
    }

    #[tokio::test]
    async fn test_stream_ping_carries_token_without_response() {
        let strategy = Arc::new(Reopen::default());
        let (channel, state) = channel(&strategy, xapi_responder()).await;

        channel.start_ping(Some("token-1".to_string()));
        assert_eq!(channel.ping_token().as_deref(), Some("token-1"));
        tokio::time::sleep(Duration::from_millis(100)).await;
        channel.stop_ping(false).await;

        let events = state.events();
        let ping = events
            .iter()
            .find_map(|e| match e {
                WireEvent::Send(value) if value["command"] == "ping" => Some(value.clone()),
                _ => None,
            })
            .expect("ping sent");

        assert_eq!(ping["streamSessionId"], "token-1");
        assert_eq!(state.count(&WireEvent::Receive), 0);
    }

    #[tokio::test]
    async fn test_stop_ping_is_idempotent() {
        let strategy = Arc::new(Reopen::default());
        let (channel, _state) = channel(&strategy, xapi_responder()).await;

        channel.stop_ping(false).await;
        channel.start_ping(None);
        channel.stop_ping(false).await;
        channel.stop_ping(false).await;
        channel.stop_ping(true).await;

        assert!(!channel.is_pinging());
    }

    #[tokio::test]
    async fn test_restart_supersedes_previous_loop() {
        let strategy = Arc::new(Reopen::default());
        let (channel, _state) = channel(&strategy, xapi_responder()).await;

        channel.start_ping(None);
        let link = channel.lock().await;
        // restarting while the lock is held must not wait for the old loop
        channel.start_ping(Some("token-2".to_string()));
        drop(link);

        assert!(channel.is_pinging());
        assert_eq!(channel.ping_token().as_deref(), Some("token-2"));
        channel.stop_ping(false).await;
    }
}
