//! Background ping loop.
//!
//! One loop per handler. It wakes every poll interval so a stop request is
//! seen promptly, and pings once per ping interval under the handler's ping
//! lock.

// ============================================================================
// Imports
// ============================================================================

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Weak};
use std::time::Duration;

use tokio::task::JoinHandle;
use tokio::time::{Instant, sleep};
use tracing::{debug, error, trace};

use super::channel::ProtocolChannel;

// ============================================================================
// Constants
// ============================================================================

/// Bound on waiting for a stopped loop to finish.
pub const JOIN_TIMEOUT: Duration = Duration::from_secs(5);

// ============================================================================
// Keepalive
// ============================================================================

/// State of a handler's ping loop.
///
/// Every start gets a fresh running flag, so a superseded loop keeps
/// seeing its own flag cleared.
#[derive(Debug, Default)]
pub struct Keepalive {
    /// Running flag of the current loop.
    running: Arc<AtomicBool>,
    /// Task of the current loop.
    handle: Option<JoinHandle<()>>,
    /// Session token for stream-scoped pings.
    token: Option<String>,
}

impl Keepalive {
    /// Returns `true` while the current loop is running.
    #[inline]
    #[must_use]
    pub fn is_running(&self) -> bool {
        self.running.load(Ordering::SeqCst)
    }

    /// Token the current loop pings with.
    #[inline]
    #[must_use]
    pub fn token(&self) -> Option<&str> {
        self.token.as_deref()
    }

    /// Signals the current loop and spawns a new one.
    ///
    /// The previous task is detached, not awaited: a restart may come from
    /// a reconnect that holds the ping lock the old loop is waiting on.
    pub(crate) fn restart(&mut self, channel: Weak<ProtocolChannel>, token: Option<String>) {
        self.running.store(false, Ordering::SeqCst);
        if self.handle.take().is_some() {
            trace!("Previous keepalive loop detached");
        }

        let running = Arc::new(AtomicBool::new(true));
        let handle = tokio::spawn(ping_loop(channel, Arc::clone(&running), token.clone()));

        self.running = running;
        self.handle = Some(handle);
        self.token = token;
    }

    /// Clears the running flag and hands out the task for joining.
    ///
    /// Returns `None` if no loop was running.
    pub(crate) fn signal_stop(&mut self) -> Option<JoinHandle<()>> {
        self.running.store(false, Ordering::SeqCst);
        self.token = None;
        self.handle.take()
    }
}

// ============================================================================
// Loop
// ============================================================================

async fn ping_loop(channel: Weak<ProtocolChannel>, running: Arc<AtomicBool>, token: Option<String>) {
    let (name, ping_interval, poll_interval) = match channel.upgrade() {
        Some(channel) => (
            channel.name().to_string(),
            channel.ping_interval(),
            channel.poll_interval(),
        ),
        None => return,
    };

    debug!(handler = %name, stream = token.is_some(), "Keepalive started");
    let mut last_ping = Instant::now();

    while running.load(Ordering::SeqCst) {
        if last_ping.elapsed() >= ping_interval {
            let Some(channel) = channel.upgrade() else {
                break;
            };

            let mut link = channel.lock().await;
            // stop may have been requested while waiting for the lock
            if !running.load(Ordering::SeqCst) {
                break;
            }

            if let Err(e) = link.ping(token.as_deref()).await {
                error!(handler = %name, error = %e, "Ping failed, stopping keepalive");
                running.store(false, Ordering::SeqCst);
                break;
            }

            trace!(handler = %name, "Ping sent");
            last_ping = Instant::now();
        }

        sleep(poll_interval).await;
    }

    debug!(handler = %name, "Keepalive stopped");
}
