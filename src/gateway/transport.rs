//! One physical websocket session.
//!
//! The socket is split into a cloneable [`SessionWriter`], which serializes
//! every writer (submissions, acknowledgements, probes) through an async
//! mutex, and a [`SessionReader`] owned by the read loop.

use std::pin::Pin;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;

use futures_util::{Sink, SinkExt, Stream, StreamExt};
use tokio::sync::Mutex;
use tokio_tungstenite::connect_async;
use tokio_tungstenite::tungstenite::{Error as WsError, Message};
use tracing::debug;

use crate::gateway::error::GatewayError;
use crate::retry::with_timeout;

const CLOSE_TIMEOUT: Duration = Duration::from_secs(1);

type FrameSink = Pin<Box<dyn Sink<Message, Error = WsError> + Send>>;
type FrameSource = Pin<Box<dyn Stream<Item = Result<Message, WsError>> + Send>>;

/// Opens a websocket to `url` and splits it into writer and reader halves.
pub(crate) async fn open(
    url: &str,
    connect_timeout: Duration,
    debug: bool,
) -> Result<(SessionWriter, SessionReader), GatewayError> {
    let (socket, _) = match with_timeout(connect_timeout, connect_async(url)).await {
        Ok(result) => result?,
        Err(_) => {
            return Err(GatewayError::Transport(format!(
                "connect timed out after {connect_timeout:?}"
            )))
        }
    };

    let (sink, source) = socket.split();
    Ok(from_parts(Box::pin(sink), Box::pin(source), debug))
}

pub(crate) fn from_parts(
    sink: FrameSink,
    source: FrameSource,
    debug: bool,
) -> (SessionWriter, SessionReader) {
    let writer = SessionWriter {
        sink: Arc::new(Mutex::new(sink)),
        closed: Arc::new(AtomicBool::new(false)),
        debug,
    };
    let reader = SessionReader {
        source,
        writer: writer.clone(),
        debug,
    };
    (writer, reader)
}

#[derive(Clone)]
pub(crate) struct SessionWriter {
    sink: Arc<Mutex<FrameSink>>,
    closed: Arc<AtomicBool>,
    debug: bool,
}

impl SessionWriter {
    pub(crate) async fn send_text(&self, text: String) -> Result<(), GatewayError> {
        if self.debug {
            debug!(event = "gateway_frame_out", frame = %text);
        }
        self.send_message(Message::Text(text)).await
    }

    async fn send_message(&self, message: Message) -> Result<(), GatewayError> {
        if self.is_closed() {
            return Err(GatewayError::SessionClosed);
        }

        let mut sink = self.sink.lock().await;
        if self.is_closed() {
            return Err(GatewayError::SessionClosed);
        }
        if let Err(err) = sink.send(message).await {
            self.mark_closed();
            return Err(GatewayError::WebSocket(err));
        }
        Ok(())
    }

    pub(crate) fn is_closed(&self) -> bool {
        self.closed.load(Ordering::SeqCst)
    }

    fn mark_closed(&self) {
        self.closed.store(true, Ordering::SeqCst);
    }

    /// Sends a close frame once; later calls return immediately.
    pub(crate) async fn close(&self) {
        if self.closed.swap(true, Ordering::SeqCst) {
            return;
        }

        let sink = Arc::clone(&self.sink);
        let result = tokio::time::timeout(CLOSE_TIMEOUT, async move {
            let mut sink = sink.lock().await;
            let _ = sink.send(Message::Close(None)).await;
            let _ = sink.close().await;
        })
        .await;
        if result.is_err() {
            debug!(event = "gateway_close_timed_out");
        }
    }
}

pub(crate) struct SessionReader {
    source: FrameSource,
    writer: SessionWriter,
    debug: bool,
}

impl SessionReader {
    /// Waits for the next text frame, answering websocket pings on the way.
    pub(crate) async fn next_frame(&mut self) -> Result<String, GatewayError> {
        loop {
            if self.writer.is_closed() {
                return Err(GatewayError::SessionClosed);
            }

            match self.source.next().await {
                Some(Ok(Message::Text(text))) => {
                    if self.debug {
                        debug!(event = "gateway_frame_in", frame = %text);
                    }
                    return Ok(text);
                }
                Some(Ok(Message::Ping(payload))) => {
                    self.writer.send_message(Message::Pong(payload)).await?;
                }
                Some(Ok(Message::Pong(_))) | Some(Ok(Message::Frame(_))) => {}
                Some(Ok(Message::Binary(data))) => {
                    debug!(event = "gateway_binary_frame_skipped", len = data.len());
                }
                Some(Ok(Message::Close(frame))) => {
                    self.writer.mark_closed();
                    let reason = frame
                        .map(|frame| format!("{} {}", frame.code, frame.reason))
                        .unwrap_or_else(|| "no close frame".to_string());
                    return Err(GatewayError::Transport(format!("closed by peer: {reason}")));
                }
                Some(Err(err)) => {
                    self.writer.mark_closed();
                    return Err(GatewayError::WebSocket(err));
                }
                None => {
                    self.writer.mark_closed();
                    return Err(GatewayError::Transport("connection ended".to_string()));
                }
            }
        }
    }
}
