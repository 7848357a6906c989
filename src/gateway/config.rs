//! Immutable gateway configuration.

use std::time::Duration;

use crate::retry::ReconnectPolicy;

/// Which real-time surface the gateway speaks.
#[derive(Clone, Copy, Debug, Eq, PartialEq)]
pub enum GatewayMode {
    /// Socket Mode: `apps.connections.open`, envelopes acknowledged by id.
    SocketMode,
    /// Legacy real-time messaging: `rtm.connect`, replies correlated by `reply_to`.
    Rtm,
}

impl GatewayMode {
    pub fn default_handshake_method(&self) -> &'static str {
        match self {
            Self::SocketMode => "apps.connections.open",
            Self::Rtm => "rtm.connect",
        }
    }
}

/// Parameters for the handshake call that yields a connection URL.
#[derive(Clone, Debug, Eq, PartialEq)]
pub struct Handshake {
    pub mode: GatewayMode,
    /// Overrides the Web API method used for the handshake.
    pub method: Option<String>,
    /// Asks the platform to rotate sessions quickly (Socket Mode only).
    pub debug_reconnects: bool,
}

#[derive(Clone, Copy, Debug, Eq, PartialEq)]
pub struct GatewayDefaults;

impl GatewayDefaults {
    pub const HEARTBEAT_INTERVAL: Duration = Duration::from_secs(30);
    pub const HEARTBEAT_DEADLINE: Duration = Duration::from_secs(10);
    pub const ACK_TIMEOUT: Duration = Duration::from_secs(30);
    pub const SWEEP_INTERVAL: Duration = Duration::from_secs(1);
    pub const CONNECT_TIMEOUT: Duration = Duration::from_secs(10);
    pub const SHUTDOWN_GRACE: Duration = Duration::from_secs(2);
}

/// Configuration handed to the connection supervisor at construction.
#[derive(Clone, Debug)]
pub struct GatewayConfig {
    pub handshake: Handshake,
    /// Interval between liveness probes while connected.
    pub heartbeat_interval: Duration,
    /// How long a probe may go unanswered before the session is declared dead.
    pub heartbeat_deadline: Duration,
    /// Deadline for an outbound submission to be acknowledged.
    pub ack_timeout: Duration,
    /// Upper bound between timeout sweeps when nothing is pending.
    pub sweep_interval: Duration,
    /// Timeout for opening the websocket after a successful handshake.
    pub connect_timeout: Duration,
    /// Time in-flight submissions get to resolve during `stop()`.
    pub shutdown_grace: Duration,
    pub reconnect: ReconnectPolicy,
    /// Logs every raw inbound and outbound frame at `debug`.
    pub debug: bool,
}

impl GatewayConfig {
    pub fn new(mode: GatewayMode) -> Self {
        Self {
            handshake: Handshake {
                mode,
                method: None,
                debug_reconnects: false,
            },
            heartbeat_interval: GatewayDefaults::HEARTBEAT_INTERVAL,
            heartbeat_deadline: GatewayDefaults::HEARTBEAT_DEADLINE,
            ack_timeout: GatewayDefaults::ACK_TIMEOUT,
            sweep_interval: GatewayDefaults::SWEEP_INTERVAL,
            connect_timeout: GatewayDefaults::CONNECT_TIMEOUT,
            shutdown_grace: GatewayDefaults::SHUTDOWN_GRACE,
            reconnect: ReconnectPolicy::default(),
            debug: false,
        }
    }

    pub fn socket_mode() -> Self {
        Self::new(GatewayMode::SocketMode)
    }

    pub fn rtm() -> Self {
        Self::new(GatewayMode::Rtm)
    }

    pub fn mode(&self) -> GatewayMode {
        self.handshake.mode
    }

    /// Uses a custom Web API method for the handshake.
    pub fn with_handshake_method(mut self, method: impl Into<String>) -> Self {
        self.handshake.method = Some(method.into());
        self
    }

    pub fn with_debug_reconnects(mut self, enabled: bool) -> Self {
        self.handshake.debug_reconnects = enabled;
        self
    }

    pub fn with_heartbeat(mut self, interval: Duration, deadline: Duration) -> Self {
        self.heartbeat_interval = interval;
        self.heartbeat_deadline = deadline;
        self
    }

    pub fn with_ack_timeout(mut self, ack_timeout: Duration) -> Self {
        self.ack_timeout = ack_timeout;
        self
    }

    pub fn with_sweep_interval(mut self, sweep_interval: Duration) -> Self {
        self.sweep_interval = sweep_interval;
        self
    }

    pub fn with_connect_timeout(mut self, connect_timeout: Duration) -> Self {
        self.connect_timeout = connect_timeout;
        self
    }

    pub fn with_shutdown_grace(mut self, shutdown_grace: Duration) -> Self {
        self.shutdown_grace = shutdown_grace;
        self
    }

    pub fn with_reconnect_policy(mut self, reconnect: ReconnectPolicy) -> Self {
        self.reconnect = reconnect;
        self
    }

    pub fn with_debug(mut self, debug: bool) -> Self {
        self.debug = debug;
        self
    }
}

impl Default for GatewayConfig {
    fn default() -> Self {
        Self::socket_mode()
    }
}
