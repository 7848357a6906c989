//! Application-level liveness probing for one session.

use std::sync::Arc;
use std::time::Duration;

use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tokio::time::{Instant, MissedTickBehavior};
use tracing::{debug, warn};

use crate::gateway::correlator::Correlator;
use crate::gateway::error::GatewayError;
use crate::gateway::proto::encode_ping;
use crate::gateway::supervisor::SessionSignal;
use crate::gateway::transport::SessionWriter;

/// Sends a ping every interval and reports a single fault when a reply does
/// not arrive in time. The task exits after reporting.
pub(crate) struct HeartbeatMonitor {
    task: JoinHandle<()>,
}

impl HeartbeatMonitor {
    pub(crate) fn spawn(
        writer: SessionWriter,
        correlator: Arc<Correlator>,
        mut replies: mpsc::UnboundedReceiver<u64>,
        interval: Duration,
        deadline: Duration,
        signals: mpsc::UnboundedSender<SessionSignal>,
    ) -> Self {
        let task = tokio::spawn(async move {
            let mut ticker = tokio::time::interval_at(Instant::now() + interval, interval);
            ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);

            loop {
                ticker.tick().await;

                let id = correlator.next_id();
                let sent = match encode_ping(id) {
                    Ok(frame) => writer.send_text(frame).await,
                    Err(err) => Err(err),
                };
                if let Err(err) = sent {
                    debug!(event = "gateway_ping_write_failed", id, error = %err);
                    let _ = signals.send(SessionSignal::Fault(err));
                    return;
                }

                let expiry = tokio::time::sleep(deadline);
                tokio::pin!(expiry);
                loop {
                    tokio::select! {
                        _ = &mut expiry => {
                            warn!(
                                event = "gateway_heartbeat_missed",
                                id,
                                deadline_ms = deadline.as_millis() as u64
                            );
                            let _ = signals.send(SessionSignal::Fault(
                                GatewayError::HeartbeatTimeout(deadline),
                            ));
                            return;
                        }
                        reply = replies.recv() => match reply {
                            Some(reply_to) if reply_to == id => break,
                            Some(reply_to) => {
                                debug!(event = "gateway_stale_pong", reply_to, expected = id);
                            }
                            None => return,
                        }
                    }
                }
            }
        });

        Self { task }
    }

    /// Aborts the probe task and waits for it to finish.
    pub(crate) async fn stop(self) {
        self.task.abort();
        let _ = self.task.await;
    }
}
