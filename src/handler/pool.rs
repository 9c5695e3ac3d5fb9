//! Handler allocation under connection and subscription budgets.
//!
//! # Architecture
//!
//! ```text
//! ┌───────────────────────────────────────────────┐
//! │                 HandlerPool                   │
//! │        (max_connections, shared budget)       │
//! │  ┌─────────────────┐   ┌───────────────────┐  │
//! │  │ session-0       │◄──│ stream-0          │  │
//! │  │ session-1       │   │ stream-1          │  │
//! │  └─────────────────┘   └───────────────────┘  │
//! └───────────────────────────────────────────────┘
//! ```
//!
//! Both `provide_*` calls hand out the first active handler that still has
//! room and only open a new connection when none fits.
//!
//! # Example
//!
//! ```no_run
//! use xapi_link::{ClientConfig, HandlerPool};
//!
//! # async fn example() -> xapi_link::Result<()> {
//! let config = ClientConfig::builder()
//!     .credentials("1000", "secret")
//!     .max_connections(4)
//!     .build()?;
//!
//! let pool = HandlerPool::new(config)?;
//! let session = pool.provide_session().await?;
//! let symbols = session.fetch_data("AllSymbols", None).await?;
//! println!("{symbols}");
//!
//! pool.delete().await;
//! # Ok(())
//! # }
//! ```

// ============================================================================
// Imports
// ============================================================================

use std::fmt;
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};

use parking_lot::RwLock;
use tokio::sync::Mutex as AsyncMutex;
use tracing::{debug, info, warn};

use crate::config::{ChannelKind, ClientConfig};
use crate::error::{Error, Result};
use crate::identifiers::HandlerId;
use crate::transport::{TcpTransportFactory, TransportFactory};

use super::HandlerStatus;
use super::session::Session;
use super::stream::StreamMultiplexer;

// ============================================================================
// HandlerRecord
// ============================================================================

/// A pooled handler and the name it was registered under.
struct HandlerRecord<H> {
    name: String,
    handler: Arc<H>,
}

/// Common view on pooled handlers.
trait Pooled {
    fn id(&self) -> HandlerId;
    /// Still holds its socket and so a slot of the budget.
    fn holds_connection(&self) -> bool;
}

impl Pooled for Session {
    fn id(&self) -> HandlerId {
        Session::id(self)
    }

    fn holds_connection(&self) -> bool {
        self.is_connected()
    }
}

impl Pooled for StreamMultiplexer {
    fn id(&self) -> HandlerId {
        StreamMultiplexer::id(self)
    }

    fn holds_connection(&self) -> bool {
        !self.is_deleted()
    }
}

/// Registry of one handler kind.
struct Registry<H> {
    records: RwLock<Vec<HandlerRecord<H>>>,
    next_index: AtomicUsize,
    prefix: &'static str,
}

impl<H: Pooled> Registry<H> {
    fn new(prefix: &'static str) -> Self {
        Self {
            records: RwLock::new(Vec::new()),
            next_index: AtomicUsize::new(0),
            prefix,
        }
    }

    fn next_name(&self) -> String {
        let index = self.next_index.fetch_add(1, Ordering::SeqCst);
        format!("{}-{index}", self.prefix)
    }

    /// First handler matching `accept`.
    fn find(&self, accept: impl Fn(&H) -> bool) -> Option<Arc<H>> {
        self.records
            .read()
            .iter()
            .find(|r| accept(&*r.handler))
            .map(|r| Arc::clone(&r.handler))
    }

    fn insert(&self, name: String, handler: &Arc<H>) {
        self.records.write().push(HandlerRecord {
            name,
            handler: Arc::clone(handler),
        });
    }

    fn remove(&self, id: HandlerId) -> bool {
        let mut records = self.records.write();
        let before = records.len();
        records.retain(|r| r.handler.id() != id);
        records.len() != before
    }

    fn name_of(&self, id: HandlerId) -> Option<String> {
        self.records
            .read()
            .iter()
            .find(|r| r.handler.id() == id)
            .map(|r| r.name.clone())
    }

    fn live(&self) -> usize {
        self.records
            .read()
            .iter()
            .filter(|r| r.handler.holds_connection())
            .count()
    }

    /// Unregisters handlers without a connection and returns them.
    fn take_spent(&self) -> Vec<HandlerRecord<H>> {
        let mut records = self.records.write();
        let (spent, kept): (Vec<_>, Vec<_>) = std::mem::take(&mut *records)
            .into_iter()
            .partition(|r| !r.handler.holds_connection());
        *records = kept;
        spent
    }

    fn handlers(&self) -> Vec<Arc<H>> {
        self.records
            .read()
            .iter()
            .map(|r| Arc::clone(&r.handler))
            .collect()
    }
}

// ============================================================================
// HandlerPool
// ============================================================================

/// Allocates and caches sessions and stream multiplexers.
///
/// Sessions and multiplexers draw from one `max_connections` budget since
/// each holds its own socket.
pub struct HandlerPool {
    /// Shared configuration.
    config: Arc<ClientConfig>,
    /// Builds transports for new handlers.
    factory: Arc<dyn TransportFactory>,
    /// Registered sessions.
    sessions: Registry<Session>,
    /// Registered multiplexers.
    multiplexers: Registry<StreamMultiplexer>,
    /// Serializes allocation so the budget cannot be overshot.
    allocation: AsyncMutex<()>,
    /// Subscription budget per multiplexer.
    max_streams: usize,
    /// Set once by [`HandlerPool::delete`].
    deleted: AtomicBool,
}

// ============================================================================
// HandlerPool - Constructor
// ============================================================================

impl HandlerPool {
    /// Creates a pool that connects over TCP.
    ///
    /// # Errors
    ///
    /// Returns [`Error::Config`] if the configuration is invalid.
    pub fn new(config: ClientConfig) -> Result<Self> {
        let factory = Arc::new(TcpTransportFactory::new(config.clone()));
        Self::with_factory(config, factory)
    }

    /// Creates a pool whose transports come from `factory`.
    ///
    /// # Errors
    ///
    /// Returns [`Error::Config`] if the configuration is invalid.
    pub fn with_factory(config: ClientConfig, factory: Arc<dyn TransportFactory>) -> Result<Self> {
        config.validate()?;

        let max_streams = config.max_streams_per_multiplexer();
        debug!(
            max_connections = config.max_connections,
            max_streams, "HandlerPool created"
        );

        Ok(Self {
            config: Arc::new(config),
            factory,
            sessions: Registry::new("session"),
            multiplexers: Registry::new("stream"),
            allocation: AsyncMutex::new(()),
            max_streams,
            deleted: AtomicBool::new(false),
        })
    }
}

// ============================================================================
// HandlerPool - Public API
// ============================================================================

impl HandlerPool {
    /// Shared configuration.
    #[inline]
    #[must_use]
    pub fn config(&self) -> &Arc<ClientConfig> {
        &self.config
    }

    /// Subscription budget of each multiplexer.
    #[inline]
    #[must_use]
    pub fn max_streams_per_multiplexer(&self) -> usize {
        self.max_streams
    }

    /// Number of registered handlers that still hold a connection.
    #[must_use]
    pub fn connection_count(&self) -> usize {
        self.sessions.live() + self.multiplexers.live()
    }

    /// Name a handler was registered under.
    #[must_use]
    pub fn name_of(&self, id: HandlerId) -> Option<String> {
        self.sessions
            .name_of(id)
            .or_else(|| self.multiplexers.name_of(id))
    }

    /// Returns `true` once deleted.
    #[inline]
    #[must_use]
    pub fn is_deleted(&self) -> bool {
        self.deleted.load(Ordering::SeqCst)
    }

    /// Returns the first active session, or logs in a new one.
    ///
    /// # Errors
    ///
    /// - [`Error::HandlerDeleted`] if the pool was deleted
    /// - [`Error::ConnectionLimit`] if the budget is exhausted
    /// - Transport or server errors of the login
    pub async fn provide_session(&self) -> Result<Arc<Session>> {
        self.ensure_alive()?;

        if let Some(session) = self.active_session() {
            return Ok(session);
        }

        let _guard = self.allocation.lock().await;
        self.ensure_alive()?;
        self.reap().await;

        // Another caller may have allocated while we waited.
        if let Some(session) = self.active_session() {
            return Ok(session);
        }

        self.check_budget(1)?;
        self.open_session().await
    }

    /// Returns the first active multiplexer with a free subscription slot,
    /// or opens a new one on the first active session.
    ///
    /// When no session is active either, both are opened and the budget
    /// must fit both connections.
    ///
    /// # Errors
    ///
    /// - [`Error::HandlerDeleted`] if the pool was deleted
    /// - [`Error::ConnectionLimit`] if the budget is exhausted
    /// - Transport or server errors of the login or stream connect
    pub async fn provide_multiplexer(&self) -> Result<Arc<StreamMultiplexer>> {
        self.ensure_alive()?;

        if let Some(mux) = self.active_multiplexer() {
            return Ok(mux);
        }

        let _guard = self.allocation.lock().await;
        self.ensure_alive()?;
        self.reap().await;

        if let Some(mux) = self.active_multiplexer() {
            return Ok(mux);
        }

        let session = match self.active_session() {
            Some(session) => {
                self.check_budget(1)?;
                session
            }
            None => {
                self.check_budget(2)?;
                self.open_session().await?
            }
        };

        self.open_multiplexer(session).await
    }

    /// Deletes one multiplexer and frees its slot.
    pub async fn release_multiplexer(&self, mux: &Arc<StreamMultiplexer>) {
        mux.delete().await;
        if self.multiplexers.remove(mux.id()) {
            debug!(handler = %mux.name(), "Multiplexer released");
        }
    }

    /// Deletes every session, which cascades to their multiplexers.
    ///
    /// Idempotent.
    pub async fn delete(&self) {
        if self.deleted.swap(true, Ordering::SeqCst) {
            debug!("HandlerPool already deleted");
            return;
        }

        let _guard = self.allocation.lock().await;
        info!(
            sessions = self.sessions.live(),
            multiplexers = self.multiplexers.live(),
            "Deleting HandlerPool"
        );

        for session in self.sessions.handlers() {
            session.delete().await;
        }

        // Multiplexers whose session went away before the pool.
        for mux in self.multiplexers.handlers() {
            if !mux.is_deleted() {
                mux.delete().await;
            }
        }

        info!("HandlerPool deleted");
    }
}

// ============================================================================
// HandlerPool - Internal
// ============================================================================

impl HandlerPool {
    fn ensure_alive(&self) -> Result<()> {
        if self.is_deleted() {
            return Err(Error::handler_deleted("pool"));
        }
        Ok(())
    }

    /// Drops handlers that lost their connection for good.
    ///
    /// Logged-out sessions and sessions whose repair failed are deleted
    /// here, which also ends their multiplexers.
    async fn reap(&self) {
        for record in self.sessions.take_spent() {
            info!(handler = %record.name, "Releasing disconnected session");
            record.handler.delete().await;
        }

        // includes multiplexers ended by the session deletes above
        for record in self.multiplexers.take_spent() {
            debug!(handler = %record.name, "Releasing ended multiplexer");
        }
    }

    fn active_session(&self) -> Option<Arc<Session>> {
        self.sessions
            .find(|s| s.status() == HandlerStatus::Active)
    }

    fn active_multiplexer(&self) -> Option<Arc<StreamMultiplexer>> {
        self.multiplexers
            .find(|m| m.status() == HandlerStatus::Active && m.has_capacity())
    }

    fn check_budget(&self, needed: usize) -> Result<()> {
        let live = self.connection_count();
        let limit = self.config.max_connections;

        if live + needed > limit {
            warn!(live, needed, limit, "Connection limit reached");
            return Err(Error::ConnectionLimit { limit });
        }
        Ok(())
    }

    async fn open_session(&self) -> Result<Arc<Session>> {
        let name = self.sessions.next_name();
        let transport = self.factory.transport(ChannelKind::Data);

        let session = Session::connect(name.clone(), Arc::clone(&self.config), transport).await?;
        self.sessions.insert(name, &session);
        Ok(session)
    }

    async fn open_multiplexer(&self, session: Arc<Session>) -> Result<Arc<StreamMultiplexer>> {
        let name = self.multiplexers.next_name();
        let transport = self.factory.transport(ChannelKind::Stream);

        let mux = StreamMultiplexer::connect(name.clone(), session, transport).await?;
        self.multiplexers.insert(name, &mux);
        Ok(mux)
    }
}

impl fmt::Debug for HandlerPool {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("HandlerPool")
            .field("connections", &self.connection_count())
            .field("max_connections", &self.config.max_connections)
            .field("max_streams", &self.max_streams)
            .field("deleted", &self.is_deleted())
            .finish_non_exhaustive()
    }
}

// ============================================================================
// Tests
// ============================================================================
