//! Authenticated data session.
//!
//! A [`Session`] logs in over its data socket, holds the session token and
//! serves generic `get<Command>` requests. It also owns the reconnect lock
//! that every attached [`StreamMultiplexer`] repairs it under.
//!
//! # Example
//!
//! ```no_run
//! use std::sync::Arc;
//!
//! use xapi_link::config::{ChannelKind, ClientConfig};
//! use xapi_link::transport::TcpTransport;
//! use xapi_link::Session;
//!
//! # async fn example() -> xapi_link::Result<()> {
//! let config = Arc::new(
//!     ClientConfig::builder()
//!         .credentials("1000", "secret")
//!         .build()?,
//! );
//!
//! let transport = TcpTransport::from_config(&config, ChannelKind::Data);
//! let session = Session::connect("session-0", config, Box::new(transport)).await?;
//!
//! let version = session.fetch_data("Version", None).await?;
//! println!("{version}");
//!
//! session.delete().await;
//! # Ok(())
//! # }
//! ```

// ============================================================================
// Imports
// ============================================================================

use std::fmt;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Weak};

use async_trait::async_trait;
use parking_lot::{Mutex, RwLock};
use rustc_hash::FxHashMap;
use serde_json::Value;
use tokio::sync::Mutex as AsyncMutex;
use tracing::{debug, error, info, warn};

use crate::config::ClientConfig;
use crate::error::{Error, Result};
use crate::identifiers::HandlerId;
use crate::protocol::{Arguments, Link, ProtocolChannel, Reconnect, Request, readable_command};
use crate::transport::{Readiness, Transport};

use super::stream::StreamMultiplexer;
use super::{HandlerStatus, RepairOutcome};

// ============================================================================
// Session
// ============================================================================

/// Logged-in request/response connection.
pub struct Session {
    /// Unique handler id.
    id: HandlerId,
    /// Handler name for logs and bookkeeping.
    name: String,
    /// Shared configuration.
    config: Arc<ClientConfig>,
    /// Data channel.
    channel: Arc<ProtocolChannel>,
    /// Token issued at login.
    token: RwLock<Option<String>>,
    /// Lifecycle state.
    status: RwLock<HandlerStatus>,
    /// Serializes repair of this session and its multiplexers.
    reconnect_lock: AsyncMutex<()>,
    /// Attached multiplexers.
    streams: Mutex<FxHashMap<HandlerId, Weak<StreamMultiplexer>>>,
    /// Set once by [`Session::delete`].
    deleted: AtomicBool,
}

// ============================================================================
// Session - Construction
// ============================================================================

impl Session {
    /// Opens the transport, logs in and starts the keepalive.
    ///
    /// # Errors
    ///
    /// Returns the transport or server error of the login. The transport is
    /// closed again on failure.
    pub async fn connect(
        name: impl Into<String>,
        config: Arc<ClientConfig>,
        transport: Box<dyn Transport>,
    ) -> Result<Arc<Self>> {
        let name = name.into();

        let session = Arc::new_cyclic(move |weak: &Weak<Self>| {
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
                config,
                channel,
                token: RwLock::new(None),
                status: RwLock::new(HandlerStatus::Inactive),
                reconnect_lock: AsyncMutex::new(()),
                streams: Mutex::new(FxHashMap::default()),
                deleted: AtomicBool::new(false),
            }
        });

        if let Err(e) = session.login().await {
            error!(handler = %session.name, error = %e, "Login failed");
            session.channel.lock().await.transport().close().await;
            return Err(e);
        }

        session.channel.start_ping(None);
        info!(handler = %session.name, id = %session.id, "Session ready");
        Ok(session)
    }
}

// ============================================================================
// Session - Accessors
// ============================================================================

impl Session {
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

    /// Shared configuration.
    #[inline]
    #[must_use]
    pub fn config(&self) -> &Arc<ClientConfig> {
        &self.config
    }

    /// Current session token.
    #[must_use]
    pub fn token(&self) -> Option<String> {
        self.token.read().clone()
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

    /// Number of attached multiplexers.
    #[must_use]
    pub fn attached_streams(&self) -> usize {
        self.streams.lock().len()
    }

    /// Returns `true` while the session holds a socket: active, or
    /// mid-repair with its token still set.
    #[must_use]
    pub fn is_connected(&self) -> bool {
        !self.is_deleted()
            && (self.status() == HandlerStatus::Active || self.token.read().is_some())
    }

    /// Returns `true` while the keepalive loop runs.
    #[must_use]
    pub fn is_pinging(&self) -> bool {
        self.channel.is_pinging()
    }

    pub(crate) fn reconnect_lock(&self) -> &AsyncMutex<()> {
        &self.reconnect_lock
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
// Session - Login
// ============================================================================

impl Session {
    /// Opens the transport and logs in with the configured credentials.
    ///
    /// # Errors
    ///
    /// Returns the transport error, [`Error::Server`] if the credentials
    /// are rejected or [`Error::MissingField`] if no token is returned.
    pub async fn login(&self) -> Result<()> {
        self.ensure_alive()?;
        let mut link = self.channel.lock().await;
        self.login_on(&mut link).await
    }

    async fn login_on(&self, link: &mut Link<'_>) -> Result<()> {
        info!(handler = %self.name, "Logging in");
        link.transport().open().await?;

        let credentials = &self.config.credentials;
        let request = Request::login(&credentials.user_id, &credentials.password);
        link.request(false, &request).await?;

        let response = link.receive_validated(false, true).await?;
        let token = response
            .stream_session_id
            .filter(|token| !token.is_empty())
            .ok_or(Error::MissingField {
                field: "streamSessionId",
            })?;

        *self.token.write() = Some(token);
        self.set_status(HandlerStatus::Active);

        info!(handler = %self.name, "Logged in");
        Ok(())
    }

    /// Logs out and closes the transport.
    ///
    /// Best effort: a failed logout is logged and cleanup still runs.
    pub async fn logout(&self) {
        let mut link = self.channel.lock().await;
        self.logout_on(&mut link).await;
    }

    async fn logout_on(&self, link: &mut Link<'_>) {
        info!(handler = %self.name, "Logging out");

        let logged_in = self.token.read().is_some();
        if logged_in {
            match link.request(false, &Request::new("logout")).await {
                Ok(()) => {
                    if let Err(e) = link.receive_validated(false, true).await {
                        warn!(handler = %self.name, error = %e, "Logout not confirmed");
                    }
                }
                Err(e) => warn!(handler = %self.name, error = %e, "Could not send logout"),
            }
        } else {
            debug!(handler = %self.name, "Not logged in");
        }

        link.transport().close().await;
        *self.token.write() = None;
        self.set_status(HandlerStatus::Inactive);

        info!(handler = %self.name, "Logged out");
    }
}

// ============================================================================
// Session - Data
// ============================================================================

impl Session {
    /// Sends `get<command>` and returns its `returnData`.
    ///
    /// Transport failures reconnect and resend once; server rejections are
    /// returned as they are.
    ///
    /// # Errors
    ///
    /// - [`Error::HandlerDeleted`] after [`Session::delete`]
    /// - [`Error::NotLoggedIn`] without a token
    /// - [`Error::Server`] if the server answers `status: false`
    /// - [`Error::MissingField`] if `status` or `returnData` is absent
    /// - Transport errors of the retry
    pub async fn fetch_data(&self, command: &str, arguments: Option<Arguments>) -> Result<Value> {
        self.ensure_alive()?;
        if self.token().is_none() {
            error!(handler = %self.name, "No session token");
            return Err(Error::NotLoggedIn);
        }

        let mut request = Request::new(format!("get{command}"));
        if let Some(arguments) = arguments {
            request = request.with_arguments(arguments);
        }

        let mut link = self.channel.lock().await;
        debug!(handler = %self.name, command = %readable_command(command), "Fetching data");

        link.request(true, &request).await?;
        let response = link.receive_validated(true, true).await?;

        debug!(handler = %self.name, command = %readable_command(command), "Data received");
        response.into_return_data()
    }
}

// ============================================================================
// Session - Repair
// ============================================================================

impl Session {
    /// Repairs the data socket if it is unhealthy.
    ///
    /// Takes the ping lock, then the reconnect lock.
    ///
    /// # Errors
    ///
    /// Returns the error of recreating the socket or of the login.
    pub async fn reconnect(&self) -> Result<RepairOutcome> {
        self.ensure_alive()?;
        let mut link = self.channel.lock().await;
        self.repair(&mut link).await
    }

    /// Repairs only if both locks are free, otherwise skips.
    ///
    /// Used by multiplexers: a held lock means the repair is under way.
    pub(crate) async fn try_repair(&self) -> Result<RepairOutcome> {
        let Ok(_guard) = self.reconnect_lock.try_lock() else {
            info!(handler = %self.name, "Session repair already in progress");
            return Ok(RepairOutcome::Skipped);
        };

        let Some(mut link) = self.channel.try_lock() else {
            info!(handler = %self.name, "Session busy, skipping repair");
            return Ok(RepairOutcome::Skipped);
        };

        self.repair_locked(&mut link).await
    }

    async fn repair(&self, link: &mut Link<'_>) -> Result<RepairOutcome> {
        let _guard = self.reconnect_lock.lock().await;
        self.repair_locked(link).await
    }

    async fn repair_locked(&self, link: &mut Link<'_>) -> Result<RepairOutcome> {
        self.ensure_alive()?;

        if link.check_ready(Readiness::Basic) {
            debug!(handler = %self.name, "Session connection already active");
            self.set_status(HandlerStatus::Active);
            return Ok(RepairOutcome::Healthy);
        }

        warn!(handler = %self.name, "Session socket unhealthy, reconnecting");
        self.set_status(HandlerStatus::Inactive);

        let relogged = match link.transport().create().await {
            Ok(()) => self.login_on(link).await,
            Err(e) => Err(e),
        };

        if let Err(e) = relogged {
            error!(handler = %self.name, error = %e, "Session repair failed");
            link.transport().close().await;
            *self.token.write() = None;
            return Err(e);
        }

        self.channel.start_ping(None);

        info!(handler = %self.name, "Session reconnected");
        Ok(RepairOutcome::Repaired)
    }
}

#[async_trait]
impl Reconnect for Session {
    async fn reconnect(&self, link: &mut Link<'_>) -> Result<()> {
        self.repair(link).await.map(|_| ())
    }
}

// ============================================================================
// Session - Streams
// ============================================================================

impl Session {
    /// Registers a multiplexer. A duplicate attach is logged only.
    pub fn attach_stream(&self, stream: &Arc<StreamMultiplexer>) {
        let previous = self
            .streams
            .lock()
            .insert(stream.id(), Arc::downgrade(stream));

        if previous.is_some() {
            warn!(handler = %self.name, stream = %stream.name(), "Stream already attached");
        } else {
            debug!(handler = %self.name, stream = %stream.name(), "Stream attached");
        }
    }

    /// Unregisters a multiplexer. A missing entry is logged only.
    pub fn detach_stream(&self, id: HandlerId) {
        if self.streams.lock().remove(&id).is_some() {
            debug!(handler = %self.name, stream = %id, "Stream detached");
        } else {
            warn!(handler = %self.name, stream = %id, "Stream was not attached");
        }
    }

    /// Tears down the session. Idempotent.
    ///
    /// Deletes attached multiplexers, stops the keepalive and logs out.
    /// Every step runs even if an earlier one failed.
    pub async fn delete(&self) {
        if self.deleted.swap(true, Ordering::SeqCst) {
            debug!(handler = %self.name, "Session already deleted");
            return;
        }

        info!(handler = %self.name, "Deleting session");

        let streams: Vec<Arc<StreamMultiplexer>> = self
            .streams
            .lock()
            .values()
            .filter_map(Weak::upgrade)
            .collect();

        for stream in streams {
            stream.delete().await;
        }

        self.channel.stop_ping(false).await;
        self.logout().await;
        *self.status.write() = HandlerStatus::Deleted;

        info!(handler = %self.name, "Session deleted");
    }
}

impl fmt::Debug for Session {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Session")
            .field("id", &self.id)
            .field("name", &self.name)
            .field("status", &self.status())
            .finish_non_exhaustive()
    }
}

// ============================================================================
// Tests
// ============================================================================
