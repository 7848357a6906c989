use std::time::Duration;

use thiserror::Error;
use tokio_tungstenite::tungstenite::Error as WsError;

use crate::web_api::WebApiError;

/// Errors produced by the real-time gateway.
///
/// Connection-level variants drive the supervisor (reconnect or close);
/// per-send variants only ever reach the [`PendingReply`] they belong to.
///
/// [`PendingReply`]: crate::gateway::PendingReply
#[derive(Debug, Error)]
pub enum GatewayError {
    /// Connect, read or write failure on the physical connection.
    #[error("transport error: {0}")]
    Transport(String),

    #[error("websocket error: {0}")]
    WebSocket(#[from] WsError),

    /// Handshake call failed for a reason other than rejected credentials.
    #[error("handshake failed: {0}")]
    Handshake(#[source] WebApiError),

    /// Credentials were rejected. Terminal.
    #[error("authentication rejected: {0}")]
    AuthRejected(String),

    #[error("no liveness reply within {0:?}")]
    HeartbeatTimeout(Duration),

    /// The platform asked the client to move to a new session.
    #[error("server requested disconnect: {reason}")]
    ServerDisconnect { reason: String },

    #[error("send {id} was not acknowledged within {after:?}")]
    AckTimeout { id: u64, after: Duration },

    #[error("session carrying send {id} was lost before acknowledgement")]
    SessionLost { id: u64 },

    /// The platform acknowledged a send with `ok: false`.
    #[error("send {id} rejected: {code} {message}")]
    Rejected { id: u64, code: i64, message: String },

    #[error("acknowledgement for {envelope_id} targets a session that has rotated")]
    StaleAcknowledgement { envelope_id: String },

    #[error("envelope {envelope_id} was already acknowledged")]
    AlreadyAcknowledged { envelope_id: String },

    #[error("malformed frame: {0}")]
    MalformedFrame(String),

    #[error("session is closed")]
    SessionClosed,

    #[error("outbound payload must be a JSON object")]
    InvalidPayload,

    #[error("json error: {0}")]
    Json(#[from] serde_json::Error),

    /// The manager shut down before the operation completed.
    #[error("gateway is shutting down")]
    Shutdown,

    /// The manager is closed; no further events will be produced.
    #[error("gateway is closed")]
    Closed,
}

impl GatewayError {
    /// Whether a fault of this kind should lead to a reconnect rather than a
    /// terminal close.
    pub fn is_recoverable(&self) -> bool {
        !matches!(self, Self::AuthRejected(_) | Self::Closed)
    }

    /// Classifies a failed handshake.
    pub(crate) fn from_handshake(error: WebApiError) -> Self {
        if error.is_auth_failure() {
            return Self::AuthRejected(error.to_string());
        }
        Self::Handshake(error)
    }
}

#[cfg(test)]
mod tests {
    use super::GatewayError;
    use crate::web_api::WebApiError;

    #[test]
    fn invalid_auth_handshake_is_terminal() {
        let error = GatewayError::from_handshake(WebApiError::Platform {
            error: "invalid_auth".to_string(),
        });
        assert!(matches!(error, GatewayError::AuthRejected(ref code) if code == "invalid_auth"));
        assert!(!error.is_recoverable());
    }

    #[test]
    fn rate_limited_handshake_is_recoverable() {
        let error = GatewayError::from_handshake(WebApiError::RateLimited { retry_after: None });
        assert!(matches!(error, GatewayError::Handshake(_)));
        assert!(error.is_recoverable());
    }

    #[test]
    fn disconnect_notice_is_recoverable() {
        let error = GatewayError::ServerDisconnect {
            reason: "refresh_requested".to_string(),
        };
        assert!(error.is_recoverable());
    }
}
