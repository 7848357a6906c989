use std::time::Duration;

use reqwest::header::{CONTENT_TYPE, RETRY_AFTER};
use reqwest::{Client, RequestBuilder, StatusCode};
use secrecy::{ExposeSecret, SecretString};
use serde::de::DeserializeOwned;
use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};
use thiserror::Error;
use tracing::debug;

use crate::gateway::config::{GatewayMode, Handshake};
use crate::retry::{retry_async, RetryPolicy};

const ERROR_BODY_SNIPPET_LEN: usize = 220;
const FORM_CONTENT_TYPE: &str = "application/x-www-form-urlencoded";
pub const SLACK_API_BASE_URL: &str = "https://slack.com/api/";

const AUTH_FAILURE_CODES: &[&str] = &[
    "invalid_auth",
    "not_authed",
    "account_inactive",
    "token_revoked",
    "token_expired",
    "not_allowed_token_type",
];

#[derive(Clone, Copy, Debug, Eq, PartialEq)]
pub struct WebApiDefaults;

impl WebApiDefaults {
    pub const CONNECT_TIMEOUT: Duration = Duration::from_secs(5);
    pub const ATTEMPT_TIMEOUT: Duration = Duration::from_secs(30);
    pub const MAX_ATTEMPTS: usize = 3;
    pub const BACKOFF: Duration = Duration::from_millis(250);
    pub const MAX_BACKOFF: Duration = Duration::from_secs(2);
    pub const JITTER: Duration = Duration::from_millis(100);
}

#[derive(Clone, Debug)]
pub struct WebApiClientOptions {
    pub connect_timeout: Duration,
    pub attempt_timeout: Duration,
    pub retry_policy: RetryPolicy,
    /// Logs request bodies (tokens redacted) and response bodies at `debug`.
    pub debug: bool,
}

impl Default for WebApiClientOptions {
    fn default() -> Self {
        Self {
            connect_timeout: WebApiDefaults::CONNECT_TIMEOUT,
            attempt_timeout: WebApiDefaults::ATTEMPT_TIMEOUT,
            retry_policy: RetryPolicy {
                max_attempts: WebApiDefaults::MAX_ATTEMPTS,
                initial_backoff: WebApiDefaults::BACKOFF,
                max_backoff: WebApiDefaults::MAX_BACKOFF,
                jitter: WebApiDefaults::JITTER,
            },
            debug: false,
        }
    }
}

#[derive(Clone)]
pub struct WebApiClient {
    http: Client,
    token: SecretString,
    app_token: Option<SecretString>,
    base_url: String,
    attempt_timeout: Duration,
    retry_policy: RetryPolicy,
    debug: bool,
}

enum Payload<'a> {
    Form(&'a [(String, String)]),
    Query(&'a [(String, String)]),
    Json(&'a Value),
}

impl WebApiClient {
    pub fn new(token: SecretString) -> Result<Self, WebApiError> {
        Self::with_options(token, WebApiClientOptions::default())
    }

    pub fn with_options(
        token: SecretString,
        options: WebApiClientOptions,
    ) -> Result<Self, WebApiError> {
        let http = Client::builder()
            .no_proxy()
            .connect_timeout(options.connect_timeout)
            .build()
            .map_err(WebApiError::Transport)?;

        Ok(Self {
            http,
            token,
            app_token: None,
            base_url: SLACK_API_BASE_URL.to_string(),
            attempt_timeout: options.attempt_timeout,
            retry_policy: options.retry_policy,
            debug: options.debug,
        })
    }

    /// Sets the app-level token used for the Socket Mode handshake.
    pub fn with_app_token(mut self, app_token: SecretString) -> Self {
        self.app_token = Some(app_token);
        self
    }

    /// Overrides the API base URL. A trailing `/` is appended when missing.
    pub fn with_base_url(mut self, base_url: impl Into<String>) -> Self {
        let mut base_url = base_url.into().trim_end().to_string();
        if !base_url.ends_with('/') {
            base_url.push('/');
        }
        self.base_url = base_url;
        self
    }

    pub fn base_url(&self) -> &str {
        &self.base_url
    }

    pub async fn auth_test(&self) -> Result<AuthTestResponse, WebApiError> {
        self.call_form("auth.test", Vec::new()).await
    }

    /// Posts a message built from composable options.
    ///
    /// When a response-URL option is present the message is sent as JSON to
    /// that URL instead of `chat.postMessage`, and the returned channel and
    /// timestamp are empty.
    pub async fn post_message(
        &self,
        channel: &str,
        options: &[MsgOption],
    ) -> Result<PostMessageResponse, WebApiError> {
        let request = MessageRequest::build(channel, options);
        if let Some(response_url) = request.response_url.as_deref() {
            let body = Value::Object(request.response_url_body());
            self.execute_raw(response_url, "response_url", &Payload::Json(&body), None)
                .await
                .and_then(|body| parse_response_url_reply(&body))?;
            return Ok(PostMessageResponse {
                channel: String::new(),
                ts: String::new(),
            });
        }

        self.call_form("chat.postMessage", request.form).await
    }

    pub async fn update_message(
        &self,
        channel: &str,
        ts: &str,
        options: &[MsgOption],
    ) -> Result<PostMessageResponse, WebApiError> {
        let mut request = MessageRequest::build(channel, options);
        request.form.push(("ts".to_string(), ts.to_string()));
        self.call_form("chat.update", request.form).await
    }

    pub async fn get_permalink(&self, params: &PermalinkParameters) -> Result<String, WebApiError> {
        let query = vec![
            ("channel".to_string(), params.channel.clone()),
            ("message_ts".to_string(), params.ts.clone()),
        ];
        let response: PermalinkResponse = self
            .call("chat.getPermalink", Payload::Query(&query), Some(&self.token))
            .await?;
        Ok(response.permalink)
    }

    /// Requests a fresh gateway URL for the configured mode.
    pub async fn open_gateway(&self, handshake: &Handshake) -> Result<GatewayTicket, WebApiError> {
        let method = handshake
            .method
            .as_deref()
            .unwrap_or_else(|| handshake.mode.default_handshake_method());

        let mut ticket: GatewayTicket = match handshake.mode {
            GatewayMode::SocketMode => {
                let app_token = self.app_token.as_ref().ok_or(WebApiError::MissingAppToken)?;
                self.call(method, Payload::Form(&[]), Some(app_token)).await?
            }
            GatewayMode::Rtm => self.call_form(method, Vec::new()).await?,
        };

        if handshake.debug_reconnects {
            let separator = if ticket.url.contains('?') { '&' } else { '?' };
            ticket.url = format!("{}{separator}debug_reconnects=true", ticket.url);
        }
        Ok(ticket)
    }

    /// Calls a Web API method with a form body carrying the bot token.
    pub async fn call_form<T>(
        &self,
        method: &str,
        mut form: Vec<(String, String)>,
    ) -> Result<T, WebApiError>
    where
        T: DeserializeOwned,
    {
        form.push((
            "token".to_string(),
            self.token.expose_secret().to_string(),
        ));
        self.call(method, Payload::Form(&form), None).await
    }

    /// Calls a Web API method with a JSON body and bearer authentication.
    pub async fn call_json<T>(&self, method: &str, body: &Value) -> Result<T, WebApiError>
    where
        T: DeserializeOwned,
    {
        self.call(method, Payload::Json(body), Some(&self.token))
            .await
    }

    async fn call<T>(
        &self,
        method: &str,
        payload: Payload<'_>,
        bearer: Option<&SecretString>,
    ) -> Result<T, WebApiError>
    where
        T: DeserializeOwned,
    {
        let endpoint = self.endpoint(method);
        let body = self.execute_raw(&endpoint, method, &payload, bearer).await?;
        parse_envelope(&body)
    }

    async fn execute_raw(
        &self,
        endpoint: &str,
        label: &str,
        payload: &Payload<'_>,
        bearer: Option<&SecretString>,
    ) -> Result<String, WebApiError> {
        if self.debug {
            debug!(
                event = "web_api_request",
                method = label,
                body = %describe_payload(payload)
            );
        }

        let policy = self.retry_policy.clone();
        let body = retry_async(
            &policy,
            |_| async move { self.send_attempt(endpoint, payload, bearer).await },
            WebApiError::is_retryable,
        )
        .await?;

        if self.debug {
            debug!(event = "web_api_response", method = label, body = %body);
        }
        Ok(body)
    }

    fn endpoint(&self, method: &str) -> String {
        format!("{}{}", self.base_url, method)
    }

    async fn send_attempt(
        &self,
        endpoint: &str,
        payload: &Payload<'_>,
        bearer: Option<&SecretString>,
    ) -> Result<String, WebApiError> {
        let mut builder: RequestBuilder = match payload {
            Payload::Form(form) => self.http.post(endpoint).form(form),
            Payload::Query(query) => self
                .http
                .get(endpoint)
                .query(query)
                .header(CONTENT_TYPE, FORM_CONTENT_TYPE),
            Payload::Json(body) => self.http.post(endpoint).json(body),
        };
        builder = builder.timeout(self.attempt_timeout);

        if let Some(token) = bearer {
            builder = builder.bearer_auth(token.expose_secret());
        }

        let response = builder.send().await.map_err(WebApiError::Transport)?;
        let status = response.status();

        if status == StatusCode::TOO_MANY_REQUESTS {
            let retry_after = response
                .headers()
                .get(RETRY_AFTER)
                .and_then(|value| value.to_str().ok())
                .and_then(|value| value.trim().parse::<u64>().ok())
                .map(Duration::from_secs);
            return Err(WebApiError::RateLimited { retry_after });
        }

        let body = response.text().await.map_err(WebApiError::Transport)?;

        if !status.is_success() {
            return Err(WebApiError::HttpStatus {
                status,
                body: summarize_error_body(&body),
            });
        }

        Ok(body)
    }
}

/// Composable option for `chat.postMessage` / `chat.update` calls.
#[derive(Clone, Debug, PartialEq)]
pub enum MsgOption {
    /// Message text, optionally escaping `&`, `<` and `>`.
    Text { text: String, escape: bool },
    /// Layout blocks, passed through as JSON.
    Blocks(Value),
    /// Legacy attachments, passed through as JSON.
    Attachments(Value),
    Metadata { event_type: String, event_payload: Value },
    /// Reply in the thread rooted at this timestamp.
    ThreadTs(String),
    /// Also post a threaded reply to the channel.
    Broadcast,
    LinkNames(bool),
    FileIds(Vec<String>),
    /// Send through an interaction response URL instead of the Web API.
    ResponseUrl { url: String, response_type: ResponseType },
    ReplaceOriginal(String),
    DeleteOriginal(String),
}

impl MsgOption {
    pub fn text(text: impl Into<String>, escape: bool) -> Self {
        Self::Text {
            text: text.into(),
            escape,
        }
    }
}

#[derive(Clone, Copy, Debug, Eq, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ResponseType {
    InChannel,
    Ephemeral,
}

struct MessageRequest {
    form: Vec<(String, String)>,
    response_url: Option<String>,
    text: Option<String>,
    blocks: Option<Value>,
    attachments: Option<Value>,
    thread_ts: Option<String>,
    response_type: Option<ResponseType>,
    replace_original: bool,
    delete_original: bool,
}

impl MessageRequest {
    fn build(channel: &str, options: &[MsgOption]) -> Self {
        let mut request = Self {
            form: vec![("channel".to_string(), channel.to_string())],
            response_url: None,
            text: None,
            blocks: None,
            attachments: None,
            thread_ts: None,
            response_type: None,
            replace_original: false,
            delete_original: false,
        };

        for option in options {
            match option {
                MsgOption::Text { text, escape } => {
                    let text = if *escape {
                        escape_message(text)
                    } else {
                        text.clone()
                    };
                    request.form.push(("text".to_string(), text.clone()));
                    request.text = Some(text);
                }
                MsgOption::Blocks(blocks) => {
                    request.form.push(("blocks".to_string(), blocks.to_string()));
                    request.blocks = Some(blocks.clone());
                }
                MsgOption::Attachments(attachments) => {
                    request
                        .form
                        .push(("attachments".to_string(), attachments.to_string()));
                    request.attachments = Some(attachments.clone());
                }
                MsgOption::Metadata {
                    event_type,
                    event_payload,
                } => {
                    let metadata = serde_json::json!({
                        "event_type": event_type,
                        "event_payload": event_payload,
                    });
                    request
                        .form
                        .push(("metadata".to_string(), metadata.to_string()));
                }
                MsgOption::ThreadTs(ts) => {
                    request.form.push(("thread_ts".to_string(), ts.clone()));
                    request.thread_ts = Some(ts.clone());
                }
                MsgOption::Broadcast => {
                    request
                        .form
                        .push(("reply_broadcast".to_string(), "true".to_string()));
                }
                MsgOption::LinkNames(link) => {
                    request
                        .form
                        .push(("link_names".to_string(), link.to_string()));
                }
                MsgOption::FileIds(ids) => {
                    let encoded = Value::from(ids.clone()).to_string();
                    request.form.push(("file_ids".to_string(), encoded));
                }
                MsgOption::ResponseUrl { url, response_type } => {
                    request.response_url = Some(url.clone());
                    request.response_type = Some(*response_type);
                }
                MsgOption::ReplaceOriginal(url) => {
                    request.response_url = Some(url.clone());
                    request.replace_original = true;
                }
                MsgOption::DeleteOriginal(url) => {
                    request.response_url = Some(url.clone());
                    request.delete_original = true;
                }
            }
        }

        request
    }

    fn response_url_body(&self) -> Map<String, Value> {
        let mut body = Map::new();
        if let Some(text) = &self.text {
            body.insert("text".to_string(), Value::from(text.clone()));
        }
        if let Some(blocks) = &self.blocks {
            body.insert("blocks".to_string(), blocks.clone());
        }
        if let Some(attachments) = &self.attachments {
            body.insert("attachments".to_string(), attachments.clone());
        }
        if let Some(thread_ts) = &self.thread_ts {
            body.insert("thread_ts".to_string(), Value::from(thread_ts.clone()));
        }
        if let Some(response_type) = self.response_type {
            body.insert(
                "response_type".to_string(),
                serde_json::to_value(response_type).unwrap_or(Value::Null),
            );
        }
        if self.replace_original {
            body.insert("replace_original".to_string(), Value::Bool(true));
        }
        if self.delete_original {
            body.insert("delete_original".to_string(), Value::Bool(true));
        }
        body
    }
}

#[derive(Clone, Debug, Serialize, Deserialize, PartialEq)]
pub struct PermalinkParameters {
    pub channel: String,
    pub ts: String,
}

#[derive(Clone, Debug, Deserialize, PartialEq)]
struct PermalinkResponse {
    permalink: String,
}

#[derive(Clone, Debug, Serialize, Deserialize, PartialEq)]
pub struct PostMessageResponse {
    #[serde(default)]
    pub channel: String,
    #[serde(default)]
    pub ts: String,
}

#[derive(Clone, Debug, Serialize, Deserialize, PartialEq)]
pub struct AuthTestResponse {
    #[serde(default)]
    pub url: String,
    #[serde(default)]
    pub team: String,
    #[serde(default)]
    pub user: String,
    #[serde(default)]
    pub team_id: String,
    #[serde(default)]
    pub user_id: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub bot_id: Option<String>,
}

/// Result of a gateway handshake: a short-lived URL to open a session on.
#[derive(Clone, Debug, Serialize, Deserialize, PartialEq)]
pub struct GatewayTicket {
    pub url: String,
    #[serde(default, rename = "self", skip_serializing_if = "Option::is_none")]
    pub self_info: Option<Value>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub team: Option<Value>,
}

#[derive(Debug, Error)]
pub enum WebApiError {
    #[error("request failed: {0}")]
    Transport(reqwest::Error),

    #[error("http status {status}: {body}")]
    HttpStatus { status: StatusCode, body: String },

    #[error("rate limited (retry after {retry_after:?})")]
    RateLimited { retry_after: Option<Duration> },

    /// The platform answered with `"ok": false`; displays the bare error code.
    #[error("{error}")]
    Platform { error: String },

    #[error("socket mode handshake requires an app-level token")]
    MissingAppToken,

    #[error("failed to parse response: {0}")]
    Parse(String),
}

impl WebApiError {
    /// Whether the client retries the call on its own.
    ///
    /// Rate limits are not: the caller paces them with
    /// [`retry_after`](Self::retry_after).
    pub fn is_retryable(&self) -> bool {
        match self {
            Self::Transport(err) => err.is_timeout() || err.is_connect(),
            Self::HttpStatus { status, .. } => status.is_server_error(),
            Self::RateLimited { .. }
            | Self::Platform { .. }
            | Self::MissingAppToken
            | Self::Parse(_) => false,
        }
    }

    /// Whether the credentials themselves were rejected.
    pub fn is_auth_failure(&self) -> bool {
        match self {
            Self::Platform { error } => AUTH_FAILURE_CODES.contains(&error.as_str()),
            Self::HttpStatus { status, .. } => *status == StatusCode::UNAUTHORIZED,
            Self::MissingAppToken => true,
            _ => false,
        }
    }

    pub fn retry_after(&self) -> Option<Duration> {
        match self {
            Self::RateLimited { retry_after } => *retry_after,
            _ => None,
        }
    }
}

#[derive(Debug, Deserialize)]
struct ResponseEnvelope {
    ok: bool,
    #[serde(default)]
    error: Option<String>,
    #[serde(default)]
    warning: Option<String>,
}

fn parse_envelope<T: DeserializeOwned>(body: &str) -> Result<T, WebApiError> {
    let envelope: ResponseEnvelope = serde_json::from_str(body)
        .map_err(|err| WebApiError::Parse(format!("invalid response envelope: {err}")))?;

    if !envelope.ok {
        return Err(WebApiError::Platform {
            error: envelope
                .error
                .unwrap_or_else(|| "unknown_error".to_string()),
        });
    }
    if let Some(warning) = envelope.warning {
        debug!(event = "web_api_warning", warning = %warning);
    }

    serde_json::from_str(body).map_err(|err| WebApiError::Parse(err.to_string()))
}

fn parse_response_url_reply(body: &str) -> Result<(), WebApiError> {
    let trimmed = body.trim();
    if trimmed.is_empty() || trimmed.eq_ignore_ascii_case("ok") {
        return Ok(());
    }
    parse_envelope::<Value>(trimmed).map(|_| ())
}

fn summarize_error_body(body: &str) -> String {
    #[derive(Debug, Deserialize)]
    struct ErrorBody {
        #[serde(default)]
        error: Option<String>,
        #[serde(default)]
        message: Option<String>,
    }

    if let Ok(parsed) = serde_json::from_str::<ErrorBody>(body) {
        if let Some(message) = parsed.error.or(parsed.message) {
            return message;
        }
    }

    body.chars().take(ERROR_BODY_SNIPPET_LEN).collect()
}

fn escape_message(text: &str) -> String {
    text.replace('&', "&amp;")
        .replace('<', "&lt;")
        .replace('>', "&gt;")
}

/// Redacts a token for logging, keeping only the prefix before the first `-`.
pub(crate) fn redact_token(token: &str) -> String {
    match token.find('-') {
        Some(index) => format!("{}REDACTED", &token[..=index]),
        None => "REDACTED".to_string(),
    }
}

fn describe_payload(payload: &Payload<'_>) -> String {
    match payload {
        Payload::Form(pairs) | Payload::Query(pairs) => pairs
            .iter()
            .map(|(key, value)| {
                if key == "token" {
                    format!("{key}={}", redact_token(value))
                } else {
                    format!("{key}={value}")
                }
            })
            .collect::<Vec<_>>()
            .join("&"),
        Payload::Json(body) => body.to_string(),
    }
}
