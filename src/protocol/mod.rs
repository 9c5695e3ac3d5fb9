//! JSON protocol layer.
//!
//! Encodes requests, decodes responses and serializes a handler's wire
//! traffic. Also runs the keepalive loop and applies the single
//! reconnect-and-retry policy.
//!
//! # Message Shapes
//!
//! | Message | Direction | Shape |
//! |---------|-----------|-------|
//! | Data request | Client → Server | `{command, arguments?, customTag?}` |
//! | Stream request | Client → Server | `{command, streamSessionId, <flat args>}` |
//! | Response | Server → Client | `{status, errorCode?, errorDescr?, returnData?, streamSessionId?}` |
//! | Stream packet | Server → Client | `{command, data}` |
//!
//! # Modules
//!
//! | Module | Description |
//! |--------|-------------|
//! | `channel` | Ping lock, retry policy, reconnect seam |
//! | `keepalive` | Background ping loop |
//! | `request` | Request and Response types |

// ============================================================================
// Submodules
// ============================================================================

/// Ping lock, retry policy and reconnect seam.
pub mod channel;

/// Background ping loop.
pub mod keepalive;

/// Request and Response message types.
pub mod request;

// ============================================================================
// Re-exports
// ============================================================================

pub use channel::{Link, ProtocolChannel, Reconnect};
pub use keepalive::{JOIN_TIMEOUT, Keepalive};
pub use request::{Arguments, Request, Response, readable_command};
