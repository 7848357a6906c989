//! Wire envelope exchanged over the gateway connection.
//!
//! Inbound text frames decode into [`InboundFrame`], a sum type over the
//! control and application frame kinds. Kinds the SDK does not know yet are
//! surfaced as [`ApplicationEvent::Unknown`] rather than rejected.

use std::time::Duration;

use serde::de::DeserializeOwned;
use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};

use crate::gateway::error::GatewayError;

#[derive(Debug, Clone, PartialEq)]
pub enum InboundFrame {
    /// Session confirmed live.
    Hello(Hello),
    /// Liveness reply to a probe with the same id.
    Pong { reply_to: u64 },
    /// Server-initiated migration (`disconnect`, or `goodbye` on RTM).
    Disconnect { reason: String },
    /// Reply correlated with a consumer-submitted frame.
    Ack(Ack),
    Event(EventFrame),
}

#[derive(Debug, Clone, Default, Serialize, Deserialize, PartialEq)]
pub struct Hello {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub num_connections: Option<u32>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub debug_info: Option<DebugInfo>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub connection_info: Option<ConnectionInfo>,
}

impl Hello {
    /// Expected lifetime of the session, when the platform announces one.
    pub fn approximate_connection_time(&self) -> Option<Duration> {
        self.debug_info
            .as_ref()
            .and_then(|info| info.approximate_connection_time)
            .map(Duration::from_secs)
    }
}

#[derive(Debug, Clone, Default, Serialize, Deserialize, PartialEq)]
pub struct DebugInfo {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub host: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub build_number: Option<u64>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub approximate_connection_time: Option<u64>,
}

#[derive(Debug, Clone, Default, Serialize, Deserialize, PartialEq)]
pub struct ConnectionInfo {
    #[serde(default)]
    pub app_id: String,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct Ack {
    pub reply_to: u64,
    #[serde(default = "default_ok")]
    pub ok: bool,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub error: Option<AckError>,
    /// Remaining fields of the reply (for example `ts` and `text`).
    #[serde(flatten)]
    pub body: Map<String, Value>,
}

#[derive(Debug, Clone, Default, Serialize, Deserialize, PartialEq)]
pub struct AckError {
    #[serde(default)]
    pub code: i64,
    #[serde(default)]
    pub msg: String,
}

fn default_ok() -> bool {
    true
}

/// An application frame plus its delivery metadata.
#[derive(Debug, Clone, PartialEq)]
pub struct EventFrame {
    /// Delivery identifier; present when the platform expects an acknowledgement.
    pub envelope_id: Option<String>,
    pub accepts_response_payload: bool,
    pub retry_attempt: Option<u32>,
    pub retry_reason: Option<String>,
    pub event: ApplicationEvent,
}

#[derive(Debug, Clone, PartialEq)]
pub enum ApplicationEvent {
    EventsApi(EventsApiPayload),
    Interactive(Value),
    SlashCommand(SlashCommandPayload),
    /// RTM event; the whole frame is the event body.
    Rtm { kind: String, body: Value },
    Unknown { kind: String, payload: Value },
}

impl ApplicationEvent {
    pub fn kind(&self) -> &str {
        match self {
            Self::EventsApi(_) => "events_api",
            Self::Interactive(_) => "interactive",
            Self::SlashCommand(_) => "slash_commands",
            Self::Rtm { kind, .. } | Self::Unknown { kind, .. } => kind,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct EventsApiPayload {
    #[serde(rename = "type")]
    pub kind: String,
    #[serde(default)]
    pub team_id: String,
    #[serde(default)]
    pub api_app_id: String,
    #[serde(default)]
    pub event_id: String,
    #[serde(default)]
    pub event_time: i64,
    #[serde(default)]
    pub event: Value,
}

impl EventsApiPayload {
    /// `type` of the wrapped callback event, e.g. `message` or `app_mention`.
    pub fn inner_type(&self) -> Option<&str> {
        self.event.get("type").and_then(Value::as_str)
    }
}

#[derive(Debug, Clone, Default, Serialize, Deserialize, PartialEq)]
pub struct SlashCommandPayload {
    #[serde(default)]
    pub command: String,
    #[serde(default)]
    pub text: String,
    #[serde(default)]
    pub user_id: String,
    #[serde(default)]
    pub channel_id: String,
    #[serde(default)]
    pub team_id: String,
    #[serde(default)]
    pub response_url: String,
    #[serde(default)]
    pub trigger_id: String,
}

#[derive(Debug, Deserialize)]
struct SocketEnvelope {
    envelope_id: String,
    #[serde(default)]
    payload: Value,
    #[serde(default)]
    accepts_response_payload: bool,
    #[serde(default)]
    retry_attempt: Option<u32>,
    #[serde(default)]
    retry_reason: Option<String>,
}

impl InboundFrame {
    /// Classifies one text frame.
    pub fn decode(text: &str) -> Result<Self, GatewayError> {
        let value: Value = serde_json::from_str(text).map_err(malformed)?;
        let Value::Object(object) = value else {
            return Err(GatewayError::MalformedFrame(
                "frame is not a JSON object".to_string(),
            ));
        };

        let kind = object
            .get("type")
            .and_then(Value::as_str)
            .map(str::to_owned);

        match kind.as_deref() {
            None if object.contains_key("reply_to") => from_object(object).map(Self::Ack),
            None => Err(GatewayError::MalformedFrame(
                "frame has no type discriminator".to_string(),
            )),
            Some("hello") => from_object(object).map(Self::Hello),
            Some("pong") => object
                .get("reply_to")
                .and_then(Value::as_u64)
                .map(|reply_to| Self::Pong { reply_to })
                .ok_or_else(|| GatewayError::MalformedFrame("pong without reply_to".to_string())),
            Some("disconnect") => Ok(Self::Disconnect {
                reason: object
                    .get("reason")
                    .and_then(Value::as_str)
                    .unwrap_or("unspecified")
                    .to_string(),
            }),
            Some("goodbye") => Ok(Self::Disconnect {
                reason: "goodbye".to_string(),
            }),
            Some(kind) if object.contains_key("envelope_id") => decode_envelope(kind, object),
            Some(kind) => Ok(Self::Event(EventFrame {
                envelope_id: None,
                accepts_response_payload: false,
                retry_attempt: None,
                retry_reason: None,
                event: ApplicationEvent::Rtm {
                    kind: kind.to_string(),
                    body: Value::Object(object),
                },
            })),
        }
    }
}

fn decode_envelope(kind: &str, object: Map<String, Value>) -> Result<InboundFrame, GatewayError> {
    let envelope: SocketEnvelope = from_object(object)?;
    let event = match kind {
        "events_api" => {
            ApplicationEvent::EventsApi(serde_json::from_value(envelope.payload).map_err(malformed)?)
        }
        "interactive" => ApplicationEvent::Interactive(envelope.payload),
        "slash_commands" => ApplicationEvent::SlashCommand(
            serde_json::from_value(envelope.payload).map_err(malformed)?,
        ),
        other => ApplicationEvent::Unknown {
            kind: other.to_string(),
            payload: envelope.payload,
        },
    };

    Ok(InboundFrame::Event(EventFrame {
        envelope_id: Some(envelope.envelope_id),
        accepts_response_payload: envelope.accepts_response_payload,
        retry_attempt: envelope.retry_attempt,
        retry_reason: envelope.retry_reason,
        event,
    }))
}

fn from_object<T: DeserializeOwned>(object: Map<String, Value>) -> Result<T, GatewayError> {
    serde_json::from_value(Value::Object(object)).map_err(malformed)
}

fn malformed(err: serde_json::Error) -> GatewayError {
    GatewayError::MalformedFrame(err.to_string())
}

#[derive(Debug, Serialize)]
struct PingFrame {
    id: u64,
    #[serde(rename = "type")]
    kind: &'static str,
}

#[derive(Debug, Serialize)]
struct EnvelopeAckFrame<'a> {
    envelope_id: &'a str,
    #[serde(skip_serializing_if = "Option::is_none")]
    payload: Option<&'a Value>,
}

pub(crate) fn encode_ping(id: u64) -> Result<String, GatewayError> {
    Ok(serde_json::to_string(&PingFrame { id, kind: "ping" })?)
}

pub(crate) fn encode_envelope_ack(
    envelope_id: &str,
    payload: Option<&Value>,
) -> Result<String, GatewayError> {
    Ok(serde_json::to_string(&EnvelopeAckFrame {
        envelope_id,
        payload,
    })?)
}

/// Stamps a consumer payload with its correlation id.
pub(crate) fn encode_submission(
    id: u64,
    mut payload: Map<String, Value>,
) -> Result<String, GatewayError> {
    payload.insert("id".to_string(), Value::from(id));
    Ok(serde_json::to_string(&payload)?)
}

/// RTM outgoing chat message.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct OutgoingMessage {
    #[serde(rename = "type")]
    kind: String,
    pub channel: String,
    pub text: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub thread_ts: Option<String>,
}

impl OutgoingMessage {
    pub fn new(channel: impl Into<String>, text: impl Into<String>) -> Self {
        Self {
            kind: "message".to_string(),
            channel: channel.into(),
            text: text.into(),
            thread_ts: None,
        }
    }

    pub fn in_thread(mut self, thread_ts: impl Into<String>) -> Self {
        self.thread_ts = Some(thread_ts.into());
        self
    }
}
