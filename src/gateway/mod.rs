//! Real-time gateway connection manager.
//!
//! - `client`: consumer handles (`Gateway`, `EventStream`, `PendingReply`).
//! - `config`: gateway configuration and defaults.
//! - `proto`: wire envelope decoding and outbound frames.
//! - `router`: frame dispatch and acknowledgeable inbound events.
//! - `supervisor`: connection lifecycle and reconnect handling.

/// Gateway control handle, event stream, and send replies.
pub mod client;
/// Gateway configuration.
pub mod config;
mod correlator;
/// Gateway error taxonomy.
pub mod error;
mod heartbeat;
/// Wire envelope types.
pub mod proto;
/// Frame routing and inbound events.
pub mod router;
/// Connection lifecycle state machine.
pub mod supervisor;
mod transport;

pub use client::{EventStream, Gateway, PendingReply};
pub use config::{GatewayConfig, GatewayDefaults, GatewayMode, Handshake};
pub use error::GatewayError;
pub use proto::{ApplicationEvent, InboundFrame, OutgoingMessage};
pub use router::InboundEvent;
pub use supervisor::ConnectionState;
