//! Authenticated sessions, stream multiplexers and their pool.
//!
//! # Ownership
//!
//! ```text
//! HandlerPool
//!   ├── Session ────────── ProtocolChannel ── data transport
//!   │     ▲  (weak refs to attached multiplexers)
//!   │     │
//!   └── StreamMultiplexer ─ ProtocolChannel ── stream transport
//! ```
//!
//! A multiplexer shares only the session token with its session, never the
//! socket.
//!
//! # Locking
//!
//! Every handler has a ping lock (its channel's transport mutex). A session
//! additionally has a reconnect lock serializing repair across itself and
//! all attached multiplexers. Locks are always taken ping first, then
//! reconnect. A multiplexer only ever `try_lock`s its session's locks.
//!
//! # Modules
//!
//! | Module | Description |
//! |--------|-------------|
//! | `pool` | Allocation under connection and subscription budgets |
//! | `session` | Login, data requests, session repair |
//! | `stream` | Push-stream multiplexer |

// ============================================================================
// Submodules
// ============================================================================

/// Allocation under connection and subscription budgets.
pub mod pool;

/// Login, data requests, session repair.
pub mod session;

/// Push-stream multiplexer.
pub mod stream;

// ============================================================================
// Re-exports
// ============================================================================

pub use pool::HandlerPool;
pub use session::Session;
pub use stream::{KEEP_ALIVE, StreamMultiplexer, StreamPacket};

// ============================================================================
// HandlerStatus
// ============================================================================

/// Lifecycle state of a session or multiplexer.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub enum HandlerStatus {
    /// Connected and usable.
    Active,
    /// Logged out, failed repair or mid-repair.
    #[default]
    Inactive,
    /// Torn down for good.
    Deleted,
}

// ============================================================================
// RepairOutcome
// ============================================================================

/// Result of a repair attempt.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RepairOutcome {
    /// The socket was healthy, nothing was done.
    Healthy,
    /// The socket was recreated and the session re-established.
    Repaired,
    /// Another task is repairing already.
    Skipped,
}
