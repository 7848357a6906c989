//! User-facing Rust SDK for Slack's Web API and real-time gateway.
//!
//! The crate is organized by transport surface:
//! - `web_api`: HTTP client for Web API methods and the gateway handshake.
//! - `gateway`: managed websocket connection (Socket Mode or RTM) with
//!   reconnects, heartbeats, acknowledgements, and send correlation.
//! - `retry`: shared retry, timeout, and reconnect backoff utilities.

/// Real-time gateway connection manager.
pub mod gateway;
/// Retry, timeout, and backoff helpers used across the SDK.
pub mod retry;
/// Web API client and request/response types.
pub mod web_api;
