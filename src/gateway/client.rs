//! Consumer-facing handles for the real-time gateway.
//!
//! [`Gateway::new`] returns a cloneable control handle and the single
//! [`EventStream`]. Nothing touches the network until [`Gateway::start`].

use std::sync::{Arc, Mutex, PoisonError};

use serde_json::Value;
use tokio::sync::{mpsc, oneshot, watch};
use tokio::time::Instant;
use tracing::info;

use crate::gateway::config::GatewayConfig;
use crate::gateway::correlator::{Correlator, UNSENT_EPOCH};
use crate::gateway::error::GatewayError;
use crate::gateway::proto::OutgoingMessage;
use crate::gateway::router::{Delivery, InboundEvent};
use crate::gateway::supervisor::{Command, ConnectionState, Supervisor};
use crate::web_api::WebApiClient;

/// Control handle for one managed gateway connection.
///
/// Clones share the same connection. Dropping every clone has the same
/// effect as [`Gateway::stop`], without waiting for it to finish.
#[derive(Clone)]
pub struct Gateway {
    commands: mpsc::UnboundedSender<Command>,
    state: Arc<watch::Sender<ConnectionState>>,
    correlator: Arc<Correlator>,
    supervisor: Arc<Mutex<Option<Supervisor>>>,
}

impl Gateway {
    pub fn new(api: WebApiClient, config: GatewayConfig) -> (Self, EventStream) {
        let (commands_tx, commands_rx) = mpsc::unbounded_channel();
        let (events_tx, events_rx) = mpsc::unbounded_channel();
        let (state, _) = watch::channel(ConnectionState::Disconnected);
        let state = Arc::new(state);
        let correlator = Arc::new(Correlator::new(config.ack_timeout));

        let supervisor = Supervisor::new(
            api,
            config,
            commands_rx,
            events_tx,
            Arc::clone(&state),
            Arc::clone(&correlator),
        );

        let gateway = Self {
            commands: commands_tx,
            state,
            correlator,
            supervisor: Arc::new(Mutex::new(Some(supervisor))),
        };
        (gateway, EventStream { rx: events_rx })
    }

    /// Spawns the connection supervisor onto the current Tokio runtime.
    ///
    /// Calling it again while running is a no-op; once the gateway is closed
    /// it returns [`GatewayError::Closed`].
    pub fn start(&self) -> Result<(), GatewayError> {
        if self.state().is_closed() {
            return Err(GatewayError::Closed);
        }

        let supervisor = self
            .supervisor
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .take();
        if let Some(supervisor) = supervisor {
            info!(event = "gateway_started");
            tokio::spawn(supervisor.run());
        }
        Ok(())
    }

    /// Stops the gateway and waits until it is closed.
    ///
    /// In-flight sends get the configured shutdown grace to be acknowledged;
    /// whatever is still pending afterwards fails with
    /// [`GatewayError::Shutdown`]. Idempotent.
    pub async fn stop(&self) {
        let unstarted = self
            .supervisor
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .take();
        if let Some(supervisor) = unstarted {
            supervisor.close_unstarted();
            return;
        }
        if self.state().is_closed() {
            return;
        }

        let (done_tx, done_rx) = oneshot::channel();
        if self.commands.send(Command::Stop { done: done_tx }).is_ok() {
            let _ = done_rx.await;
        }
    }

    pub fn state(&self) -> ConnectionState {
        *self.state.borrow()
    }

    /// Subscribes to connection state transitions.
    pub fn watch_state(&self) -> watch::Receiver<ConnectionState> {
        self.state.subscribe()
    }

    /// Submits a JSON object for correlated delivery.
    ///
    /// The payload is stamped with a fresh `id`. The returned handle resolves
    /// with the platform's reply, or fails with `Rejected`, `AckTimeout`,
    /// `SessionLost` or `Shutdown`. Submissions made while disconnected are
    /// held until a session opens; the acknowledgement deadline still counts
    /// from now.
    pub fn submit(&self, payload: Value) -> Result<PendingReply, GatewayError> {
        let Value::Object(payload) = payload else {
            return Err(GatewayError::InvalidPayload);
        };
        if self.state().is_closed() {
            return Err(GatewayError::Closed);
        }

        let id = self.correlator.next_id();
        let (reply_tx, reply_rx) = oneshot::channel();
        self.correlator
            .register(id, UNSENT_EPOCH, Instant::now(), reply_tx);

        if self.commands.send(Command::Submit { id, payload }).is_err() {
            self.correlator.fail(id, GatewayError::Closed);
            return Err(GatewayError::Closed);
        }
        Ok(PendingReply { id, rx: reply_rx })
    }

    /// Sends a chat message over an RTM connection.
    pub fn send_message(
        &self,
        channel: impl Into<String>,
        text: impl Into<String>,
    ) -> Result<PendingReply, GatewayError> {
        self.send_outgoing(&OutgoingMessage::new(channel, text))
    }

    pub fn send_outgoing(&self, message: &OutgoingMessage) -> Result<PendingReply, GatewayError> {
        self.submit(serde_json::to_value(message)?)
    }
}

/// Outcome of one submitted send.
#[derive(Debug)]
pub struct PendingReply {
    id: u64,
    rx: oneshot::Receiver<Result<Value, GatewayError>>,
}

impl PendingReply {
    /// Correlation id stamped on the outgoing frame.
    pub fn id(&self) -> u64 {
        self.id
    }

    /// Waits for the reply body of a positive acknowledgement.
    pub async fn wait(self) -> Result<Value, GatewayError> {
        self.rx.await.unwrap_or(Err(GatewayError::Shutdown))
    }
}

/// Ordered stream of inbound application events.
#[derive(Debug)]
pub struct EventStream {
    rx: mpsc::UnboundedReceiver<Delivery>,
}

impl EventStream {
    /// Waits for the next event.
    ///
    /// A non-recoverable fault is returned once as its own error; after that,
    /// and after a graceful stop, every call returns [`GatewayError::Closed`].
    pub async fn recv(&mut self) -> Result<InboundEvent, GatewayError> {
        match self.rx.recv().await {
            Some(delivery) => delivery.into_result(),
            None => Err(GatewayError::Closed),
        }
    }

    /// Returns the next event if one is already queued.
    pub fn try_recv(&mut self) -> Result<Option<InboundEvent>, GatewayError> {
        match self.rx.try_recv() {
            Ok(delivery) => delivery.into_result().map(Some),
            Err(mpsc::error::TryRecvError::Empty) => Ok(None),
            Err(mpsc::error::TryRecvError::Disconnected) => Err(GatewayError::Closed),
        }
    }
}

impl Delivery {
    fn into_result(self) -> Result<InboundEvent, GatewayError> {
        match self {
            Self::Event(event) => Ok(event),
            Self::Terminal(error) => Err(error),
        }
    }
}
