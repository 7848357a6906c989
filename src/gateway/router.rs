//! Frame classification and dispatch for one session.
//!
//! The read loop hands each text frame to [`Router::route`]; control frames
//! go to the supervisor, heartbeat, or correlator, and application frames are
//! queued for the consumer in arrival order as [`InboundEvent`]s.

use std::fmt;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::Arc;

use serde_json::Value;
use tokio::sync::{mpsc, oneshot};
use tracing::{debug, info, warn};

use crate::gateway::correlator::Correlator;
use crate::gateway::error::GatewayError;
use crate::gateway::proto::{encode_envelope_ack, ApplicationEvent, EventFrame, InboundFrame};
use crate::gateway::supervisor::SessionSignal;
use crate::gateway::transport::{SessionReader, SessionWriter};

/// Item on the consumer queue.
#[derive(Debug)]
pub(crate) enum Delivery {
    Event(InboundEvent),
    /// Non-recoverable fault; the stream ends after it.
    Terminal(GatewayError),
}

#[derive(Debug, PartialEq, Eq)]
pub(crate) enum RouteOutcome {
    Continue,
    Disconnect(String),
}

pub(crate) struct Router {
    epoch: u64,
    events: mpsc::UnboundedSender<Delivery>,
    pongs: mpsc::UnboundedSender<u64>,
    correlator: Arc<Correlator>,
    writer: SessionWriter,
    current_epoch: Arc<AtomicU64>,
    signals: mpsc::UnboundedSender<SessionSignal>,
}

impl Router {
    pub(crate) fn new(
        epoch: u64,
        events: mpsc::UnboundedSender<Delivery>,
        pongs: mpsc::UnboundedSender<u64>,
        correlator: Arc<Correlator>,
        writer: SessionWriter,
        current_epoch: Arc<AtomicU64>,
        signals: mpsc::UnboundedSender<SessionSignal>,
    ) -> Self {
        Self {
            epoch,
            events,
            pongs,
            correlator,
            writer,
            current_epoch,
            signals,
        }
    }

    pub(crate) fn route(&self, text: &str) -> RouteOutcome {
        let frame = match InboundFrame::decode(text) {
            Ok(frame) => frame,
            Err(err) => {
                warn!(event = "gateway_frame_skipped", epoch = self.epoch, error = %err);
                return RouteOutcome::Continue;
            }
        };

        match frame {
            InboundFrame::Hello(hello) => {
                let ttl = hello.approximate_connection_time();
                debug!(
                    event = "gateway_hello",
                    epoch = self.epoch,
                    ttl_secs = ttl.map(|ttl| ttl.as_secs())
                );
                let _ = self.signals.send(SessionSignal::Hello { ttl });
            }
            InboundFrame::Pong { reply_to } => {
                let _ = self.pongs.send(reply_to);
            }
            InboundFrame::Disconnect { reason } => return RouteOutcome::Disconnect(reason),
            InboundFrame::Ack(ack) => {
                if ack.ok {
                    self.correlator.resolve(ack.reply_to, Value::Object(ack.body));
                } else {
                    let (code, message) = ack
                        .error
                        .map(|error| (error.code, error.msg))
                        .unwrap_or_default();
                    self.correlator.fail(
                        ack.reply_to,
                        GatewayError::Rejected {
                            id: ack.reply_to,
                            code,
                            message,
                        },
                    );
                }
            }
            InboundFrame::Event(frame) => {
                let ack = frame.envelope_id.clone().map(|envelope_id| Acknowledger {
                    envelope_id,
                    epoch: self.epoch,
                    writer: self.writer.clone(),
                    current_epoch: Arc::clone(&self.current_epoch),
                    used: AtomicBool::new(false),
                });
                let event = InboundEvent {
                    epoch: self.epoch,
                    frame,
                    ack,
                };
                if self.events.send(Delivery::Event(event)).is_err() {
                    debug!(event = "gateway_event_dropped_no_consumer", epoch = self.epoch);
                }
            }
        }
        RouteOutcome::Continue
    }
}

/// Reads frames until the session fails, the server asks to move, or `stop`
/// fires. Faults are reported to the supervisor through the router's signal
/// channel.
pub(crate) async fn run_read_loop(
    mut reader: SessionReader,
    router: Router,
    mut stop: oneshot::Receiver<()>,
) {
    loop {
        tokio::select! {
            biased;
            _ = &mut stop => return,
            frame = reader.next_frame() => match frame {
                Ok(text) => {
                    if let RouteOutcome::Disconnect(reason) = router.route(&text) {
                        info!(event = "gateway_server_disconnect", epoch = router.epoch, reason = %reason);
                        let _ = router
                            .signals
                            .send(SessionSignal::Fault(GatewayError::ServerDisconnect { reason }));
                        return;
                    }
                }
                Err(err) => {
                    debug!(event = "gateway_read_failed", epoch = router.epoch, error = %err);
                    let _ = router.signals.send(SessionSignal::Fault(err));
                    return;
                }
            }
        }
    }
}

/// An application event delivered to the consumer.
///
/// Events that arrived in a delivery envelope carry a one-shot
/// acknowledgement bound to the session they arrived on.
#[derive(Debug)]
pub struct InboundEvent {
    epoch: u64,
    frame: EventFrame,
    ack: Option<Acknowledger>,
}

impl InboundEvent {
    /// Session epoch the event arrived on.
    pub fn epoch(&self) -> u64 {
        self.epoch
    }

    pub fn envelope_id(&self) -> Option<&str> {
        self.frame.envelope_id.as_deref()
    }

    pub fn event(&self) -> &ApplicationEvent {
        &self.frame.event
    }

    pub fn frame(&self) -> &EventFrame {
        &self.frame
    }

    pub fn into_event(self) -> ApplicationEvent {
        self.frame.event
    }

    /// Whether the platform expects this delivery to be acknowledged.
    pub fn requires_ack(&self) -> bool {
        self.ack.is_some()
    }

    /// Acknowledges the delivery on the session it arrived on.
    ///
    /// Returns `StaleAcknowledgement` if that session has been replaced and
    /// `AlreadyAcknowledged` on a second call. Events without an envelope
    /// have nothing to acknowledge and return `Ok(())`.
    pub async fn acknowledge(&self) -> Result<(), GatewayError> {
        match &self.ack {
            Some(ack) => ack.send(None).await,
            None => Ok(()),
        }
    }

    /// Acknowledges with a response payload, for envelopes that accept one.
    pub async fn acknowledge_with(&self, payload: Value) -> Result<(), GatewayError> {
        match &self.ack {
            Some(ack) => ack.send(Some(&payload)).await,
            None => Ok(()),
        }
    }
}

struct Acknowledger {
    envelope_id: String,
    epoch: u64,
    writer: SessionWriter,
    current_epoch: Arc<AtomicU64>,
    used: AtomicBool,
}

impl Acknowledger {
    async fn send(&self, payload: Option<&Value>) -> Result<(), GatewayError> {
        if self.current_epoch.load(Ordering::SeqCst) != self.epoch || self.writer.is_closed() {
            return Err(self.stale());
        }
        if self.used.swap(true, Ordering::SeqCst) {
            return Err(GatewayError::AlreadyAcknowledged {
                envelope_id: self.envelope_id.clone(),
            });
        }

        let frame = encode_envelope_ack(&self.envelope_id, payload)?;
        match self.writer.send_text(frame).await {
            Ok(()) => Ok(()),
            Err(GatewayError::SessionClosed) => Err(self.stale()),
            Err(err) => {
                self.used.store(false, Ordering::SeqCst);
                Err(err)
            }
        }
    }

    fn stale(&self) -> GatewayError {
        warn!(
            event = "gateway_stale_acknowledgement",
            envelope_id = %self.envelope_id,
            epoch = self.epoch,
            current_epoch = self.current_epoch.load(Ordering::SeqCst)
        );
        GatewayError::StaleAcknowledgement {
            envelope_id: self.envelope_id.clone(),
        }
    }
}

impl fmt::Debug for Acknowledger {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Acknowledger")
            .field("envelope_id", &self.envelope_id)
            .field("epoch", &self.epoch)
            .field("used", &self.used.load(Ordering::SeqCst))
            .finish()
    }
}
