//! Realtime update modules.
//!
//! - `registry`: named-event fan-out to listener callbacks.
//! - `proto`: wire envelopes and well-known event names.
//! - `transport`: connector seam and the websocket transport.
//! - `session`: connection lifecycle, reconnection, and outbound sends.
//! - `client`: facade with domain subscription helpers.

/// Update client facade.
pub mod client;
/// Realtime protocol messages and event names.
pub mod proto;
/// Event registry and listener handles.
pub mod registry;
/// Connection session state machine.
pub mod session;
/// Transport abstraction and websocket connector.
pub mod transport;

pub use client::UpdateClient;
pub use registry::{listener, EventRegistry, Listener};
pub use session::{ConnectionSession, ConnectionState, RealtimeConfig};
