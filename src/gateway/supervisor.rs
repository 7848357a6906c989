//! Connection supervisor.
//!
//! A single task owns the lifecycle: handshake, open, serve, tear down, back
//! off, and reconnect. Only one session is ever live; the previous session's
//! read loop and heartbeat are stopped, and its unacknowledged sends failed,
//! before the next handshake starts.

use std::collections::VecDeque;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;

use serde_json::{Map, Value};
use tokio::sync::{mpsc, oneshot, watch};
use tokio::task::JoinHandle;
use tokio::time::Instant;
use tracing::{debug, error, info, warn};

use crate::gateway::config::GatewayConfig;
use crate::gateway::correlator::{spawn_sweeper, Correlator};
use crate::gateway::error::GatewayError;
use crate::gateway::heartbeat::HeartbeatMonitor;
use crate::gateway::proto::encode_submission;
use crate::gateway::router::{run_read_loop, Delivery, Router};
use crate::gateway::transport::{self, SessionReader, SessionWriter};
use crate::retry::ReconnectBackoff;
use crate::web_api::WebApiClient;

/// Lifecycle state of the gateway. Exactly one is active at a time.
#[derive(Clone, Copy, Debug, Eq, PartialEq)]
pub enum ConnectionState {
    Disconnected,
    Handshaking,
    Connecting,
    Connected,
    Reconnecting,
    /// Terminal; no further sessions will be opened.
    Closed,
}

impl ConnectionState {
    pub fn is_closed(&self) -> bool {
        matches!(self, Self::Closed)
    }
}

/// Report from a session's read loop or heartbeat to the supervisor.
#[derive(Debug)]
pub(crate) enum SessionSignal {
    Hello { ttl: Option<Duration> },
    Fault(GatewayError),
}

pub(crate) enum Command {
    /// Write a registered send once a session is available.
    Submit { id: u64, payload: Map<String, Value> },
    Stop { done: oneshot::Sender<()> },
}

enum Exit {
    Stopped(oneshot::Sender<()>),
    HandlesDropped,
    Terminal(GatewayError),
}

enum Attempt {
    Opened(SessionWriter, SessionReader),
    Failed(GatewayError),
    Exit(Exit),
}

enum SessionEnd {
    Fault {
        error: GatewayError,
        lifetime: Duration,
    },
    Exit(Exit),
}

pub(crate) struct Supervisor {
    api: WebApiClient,
    config: GatewayConfig,
    commands: mpsc::UnboundedReceiver<Command>,
    events: mpsc::UnboundedSender<Delivery>,
    state: Arc<watch::Sender<ConnectionState>>,
    correlator: Arc<Correlator>,
    current_epoch: Arc<AtomicU64>,
    backoff: ReconnectBackoff,
    queued: VecDeque<(u64, Map<String, Value>)>,
    epoch: u64,
}

impl Supervisor {
    pub(crate) fn new(
        api: WebApiClient,
        config: GatewayConfig,
        commands: mpsc::UnboundedReceiver<Command>,
        events: mpsc::UnboundedSender<Delivery>,
        state: Arc<watch::Sender<ConnectionState>>,
        correlator: Arc<Correlator>,
    ) -> Self {
        let backoff = ReconnectBackoff::new(config.reconnect.clone());
        Self {
            api,
            config,
            commands,
            events,
            state,
            correlator,
            current_epoch: Arc::new(AtomicU64::new(0)),
            backoff,
            queued: VecDeque::new(),
            epoch: 0,
        }
    }

    /// Closes a supervisor that was never started.
    pub(crate) fn close_unstarted(self) {
        self.correlator.fail_all();
        self.state.send_replace(ConnectionState::Closed);
        info!(event = "gateway_closed", started = false);
    }

    pub(crate) async fn run(mut self) {
        let sweeper = spawn_sweeper(Arc::clone(&self.correlator), self.config.sweep_interval);
        let exit = self.drive().await;
        self.finish(exit, sweeper);
    }

    async fn drive(&mut self) -> Exit {
        let mut delay: Option<Duration> = None;

        loop {
            if let Some(delay) = delay.take() {
                self.set_state(ConnectionState::Reconnecting);
                debug!(
                    event = "gateway_reconnect_wait",
                    delay_ms = delay.as_millis() as u64,
                    attempt = self.backoff.attempt()
                );
                if let Some(exit) = self.wait(delay).await {
                    return exit;
                }
            }

            self.set_state(ConnectionState::Handshaking);
            let (writer, reader) = match self.attempt().await {
                Attempt::Opened(writer, reader) => (writer, reader),
                Attempt::Exit(exit) => return exit,
                Attempt::Failed(err) if !err.is_recoverable() => {
                    error!(event = "gateway_handshake_rejected", error = %err);
                    return Exit::Terminal(err);
                }
                Attempt::Failed(err) => {
                    let mut wait = self.backoff.next_delay();
                    if let Some(retry_after) = retry_after(&err) {
                        wait = wait.max(retry_after);
                    }
                    warn!(
                        event = "gateway_connect_failed",
                        error = %err,
                        retry_in_ms = wait.as_millis() as u64
                    );
                    delay = Some(wait);
                    continue;
                }
            };

            match self.serve(writer, reader).await {
                SessionEnd::Exit(exit) => return exit,
                SessionEnd::Fault {
                    error: GatewayError::ServerDisconnect { reason },
                    lifetime,
                } => {
                    // Only a session that outlived the dwell time migrates
                    // without waiting.
                    let settled = self.backoff.record_session_end(lifetime);
                    let wait = (!settled).then(|| self.backoff.next_delay());
                    info!(
                        event = "gateway_migrating",
                        reason = %reason,
                        lifetime_ms = lifetime.as_millis() as u64,
                        retry_in_ms = wait.map_or(0, |wait| wait.as_millis() as u64)
                    );
                    self.set_state(ConnectionState::Reconnecting);
                    delay = wait;
                }
                SessionEnd::Fault { error, lifetime } => {
                    self.backoff.record_session_end(lifetime);
                    let wait = self.backoff.next_delay();
                    warn!(
                        event = "gateway_session_failed",
                        error = %error,
                        lifetime_ms = lifetime.as_millis() as u64,
                        retry_in_ms = wait.as_millis() as u64
                    );
                    delay = Some(wait);
                }
            }
        }
    }

    /// Runs the handshake and opens the websocket, queueing submissions that
    /// arrive meanwhile.
    async fn attempt(&mut self) -> Attempt {
        let api = self.api.clone();
        let handshake = self.config.handshake.clone();
        let connect_timeout = self.config.connect_timeout;
        let debug = self.config.debug;
        let state = Arc::clone(&self.state);

        let open = async move {
            let ticket = api
                .open_gateway(&handshake)
                .await
                .map_err(GatewayError::from_handshake)?;
            publish(&state, ConnectionState::Connecting);
            transport::open(&ticket.url, connect_timeout, debug).await
        };
        tokio::pin!(open);

        loop {
            tokio::select! {
                result = &mut open => {
                    return match result {
                        Ok((writer, reader)) => Attempt::Opened(writer, reader),
                        Err(err) => Attempt::Failed(err),
                    };
                }
                command = self.commands.recv() => {
                    if let Some(exit) = self.queue_command(command) {
                        return Attempt::Exit(exit);
                    }
                }
            }
        }
    }

    /// Sleeps out a backoff delay, queueing submissions that arrive meanwhile.
    async fn wait(&mut self, delay: Duration) -> Option<Exit> {
        let sleep = tokio::time::sleep(delay);
        tokio::pin!(sleep);

        loop {
            tokio::select! {
                _ = &mut sleep => return None,
                command = self.commands.recv() => {
                    if let Some(exit) = self.queue_command(command) {
                        return Some(exit);
                    }
                }
            }
        }
    }

    fn queue_command(&mut self, command: Option<Command>) -> Option<Exit> {
        match command {
            Some(Command::Submit { id, payload }) => {
                self.queued.push_back((id, payload));
                None
            }
            Some(Command::Stop { done }) => Some(Exit::Stopped(done)),
            None => Some(Exit::HandlesDropped),
        }
    }

    async fn serve(&mut self, writer: SessionWriter, reader: SessionReader) -> SessionEnd {
        self.epoch += 1;
        let epoch = self.epoch;
        self.current_epoch.store(epoch, Ordering::SeqCst);
        let started = Instant::now();

        let (signals_tx, mut signals) = mpsc::unbounded_channel();
        let (pongs_tx, pongs_rx) = mpsc::unbounded_channel();
        let router = Router::new(
            epoch,
            self.events.clone(),
            pongs_tx,
            Arc::clone(&self.correlator),
            writer.clone(),
            Arc::clone(&self.current_epoch),
            signals_tx.clone(),
        );
        let (stop_tx, stop_rx) = oneshot::channel();
        let read_loop = tokio::spawn(run_read_loop(reader, router, stop_rx));
        let heartbeat = HeartbeatMonitor::spawn(
            writer.clone(),
            Arc::clone(&self.correlator),
            pongs_rx,
            self.config.heartbeat_interval,
            self.config.heartbeat_deadline,
            signals_tx,
        );

        self.set_state(ConnectionState::Connected);
        info!(event = "gateway_connected", epoch);

        let outcome = match self.flush_queued(&writer, epoch).await {
            Err(error) => Err(error),
            Ok(()) => loop {
                tokio::select! {
                    command = self.commands.recv() => match command {
                        Some(Command::Submit { id, payload }) => {
                            if let Err(error) = self.write_submission(&writer, epoch, id, payload).await {
                                break Err(error);
                            }
                        }
                        Some(Command::Stop { done }) => break Ok(Exit::Stopped(done)),
                        None => break Ok(Exit::HandlesDropped),
                    },
                    signal = signals.recv() => match signal {
                        Some(SessionSignal::Hello { ttl }) => {
                            if let Some(ttl) = ttl {
                                debug!(event = "gateway_session_expiry_hint", epoch, ttl_secs = ttl.as_secs());
                            }
                        }
                        Some(SessionSignal::Fault(error)) => break Err(error),
                        None => break Err(GatewayError::SessionClosed),
                    },
                }
            },
        };

        if outcome.is_ok() {
            self.drain_in_flight().await;
        }

        heartbeat.stop().await;
        let _ = stop_tx.send(());
        let _ = read_loop.await;
        writer.close().await;
        self.correlator.fail_epoch(epoch);
        debug!(event = "gateway_session_closed", epoch);

        match outcome {
            Ok(exit) => SessionEnd::Exit(exit),
            Err(error) => SessionEnd::Fault {
                error,
                lifetime: started.elapsed(),
            },
        }
    }

    async fn flush_queued(&mut self, writer: &SessionWriter, epoch: u64) -> Result<(), GatewayError> {
        if !self.queued.is_empty() {
            debug!(event = "gateway_flush_queued", epoch, count = self.queued.len());
        }
        while let Some((id, payload)) = self.queued.pop_front() {
            self.write_submission(writer, epoch, id, payload).await?;
        }
        Ok(())
    }

    /// Writes one send on the live session. A write failure is a session
    /// fault; the send itself is failed when the session is torn down.
    async fn write_submission(
        &self,
        writer: &SessionWriter,
        epoch: u64,
        id: u64,
        payload: Map<String, Value>,
    ) -> Result<(), GatewayError> {
        if !self.correlator.assign_epoch(id, epoch) {
            debug!(event = "gateway_send_expired_before_write", id);
            return Ok(());
        }
        let frame = match encode_submission(id, payload) {
            Ok(frame) => frame,
            Err(err) => {
                self.correlator.fail(id, err);
                return Ok(());
            }
        };
        writer.send_text(frame).await
    }

    /// Gives in-flight sends the shutdown grace period to be acknowledged.
    ///
    /// Sends never written to a session cannot be acknowledged and fail with
    /// `Shutdown` up front.
    async fn drain_in_flight(&self) {
        let unsent = self.correlator.fail_unsent();
        if unsent > 0 {
            debug!(event = "gateway_unsent_sends_dropped", count = unsent);
        }

        let grace = self.config.shutdown_grace;
        if tokio::time::timeout(grace, self.correlator.drained())
            .await
            .is_err()
        {
            warn!(
                event = "gateway_shutdown_grace_elapsed",
                pending = self.correlator.len(),
                grace_ms = grace.as_millis() as u64
            );
        }
        self.correlator.fail_all();
    }

    fn finish(mut self, exit: Exit, sweeper: JoinHandle<()>) {
        let mut waiters = Vec::new();
        match exit {
            Exit::Stopped(done) => waiters.push(done),
            Exit::HandlesDropped => {}
            Exit::Terminal(error) => {
                let _ = self.events.send(Delivery::Terminal(error));
            }
        }

        self.commands.close();
        while let Ok(command) = self.commands.try_recv() {
            if let Command::Stop { done } = command {
                waiters.push(done);
            }
        }

        self.queued.clear();
        self.correlator.fail_all();
        sweeper.abort();
        self.set_state(ConnectionState::Closed);
        info!(event = "gateway_closed", sessions = self.epoch);

        drop(self.events);
        for done in waiters {
            let _ = done.send(());
        }
    }

    fn set_state(&self, next: ConnectionState) {
        publish(&self.state, next);
    }
}

fn publish(state: &watch::Sender<ConnectionState>, next: ConnectionState) {
    let previous = state.send_replace(next);
    if previous != next {
        debug!(event = "gateway_state", from = ?previous, to = ?next);
    }
}

fn retry_after(error: &GatewayError) -> Option<Duration> {
    match error {
        GatewayError::Handshake(inner) => inner.retry_after(),
        _ => None,
    }
}

#[cfg(test)]
mod tests {
    use std::time::Duration;

    use super::{retry_after, ConnectionState};
    use crate::gateway::error::GatewayError;
    use crate::web_api::WebApiError;

    #[test]
    fn only_closed_is_terminal() {
        assert!(ConnectionState::Closed.is_closed());
        for state in [
            ConnectionState::Disconnected,
            ConnectionState::Handshaking,
            ConnectionState::Connecting,
            ConnectionState::Connected,
            ConnectionState::Reconnecting,
        ] {
            assert!(!state.is_closed(), "{state:?}");
        }
    }

    #[test]
    fn rate_limited_handshake_sets_minimum_wait() {
        let limited = GatewayError::Handshake(WebApiError::RateLimited {
            retry_after: Some(Duration::from_secs(7)),
        });
        assert_eq!(retry_after(&limited), Some(Duration::from_secs(7)));
        assert_eq!(
            retry_after(&GatewayError::Transport("reset".to_string())),
            None
        );
    }
}
