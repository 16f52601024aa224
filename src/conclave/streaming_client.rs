//! Streaming client for the completion endpoint.
//!
//! One [`StreamingClient`] owns the HTTP plumbing for a configured endpoint:
//! [`send_streaming`](CompletionClient::send_streaming) opens a single POST,
//! reads the body incrementally, and emits decoded [`StreamEvent`]s in arrival
//! order on one stream; [`send_unary`](CompletionClient::send_unary) performs
//! the same request without streaming and returns the parsed [`FullResponse`].
//!
//! Both operations observe a [`CancellationToken`].  On cancellation the
//! underlying connection is closed and no further events are emitted after the
//! first [`ClientError::Cancelled`] acknowledgement.
//!
//! The [`CompletionClient`] trait fronts the concrete client so agent runtimes
//! and tests can substitute scripted implementations.

use crate::conclave::config::ConclaveConfig;
use crate::conclave::http_pool::get_shared_http_client;
use crate::conclave::wire::{self, CompletionRequest, FullResponse, StreamEvent};
use async_trait::async_trait;
use futures_util::stream::Stream;
use futures_util::StreamExt;
use std::error::Error;
use std::fmt;
use std::pin::Pin;
use std::time::Duration;
use tokio::sync::mpsc;
use tokio_util::sync::CancellationToken;

/// Errors surfaced by the streaming client.
#[derive(Debug, Clone)]
pub enum ClientError {
    /// Network or protocol-level failure talking to the endpoint
    /// (connection errors, non-success status codes, exceeded time budget).
    /// Retryable by the caller.
    Transport(String),
    /// The stream itself was malformed (e.g. it ended before `message_stop`).
    Protocol(String),
    /// A well-formed error event decoded from the stream.  Not retryable
    /// without a policy decision.
    Remote {
        /// Machine-readable error class from the endpoint.
        error_type: String,
        /// Human-readable message from the endpoint.
        message: String,
    },
    /// The operation was cancelled cooperatively.
    Cancelled,
}

impl fmt::Display for ClientError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            ClientError::Transport(msg) => write!(f, "transport error: {}", msg),
            ClientError::Protocol(msg) => write!(f, "protocol error: {}", msg),
            ClientError::Remote {
                error_type,
                message,
            } => write!(f, "remote error ({}): {}", error_type, message),
            ClientError::Cancelled => write!(f, "cancelled"),
        }
    }
}

impl Error for ClientError {}

/// Boxed stream of decoded events, `Send` so it can cross task boundaries.
pub type EventStream = Pin<Box<dyn Stream<Item = Result<StreamEvent, ClientError>> + Send>>;

/// Trait-driven abstraction over the completion endpoint.
///
/// The concrete [`StreamingClient`] talks HTTP; tests and higher layers can
/// substitute scripted implementations.  All implementations must be
/// thread-safe (`Send + Sync`) so they can be shared between agent tasks.
#[async_trait]
pub trait CompletionClient: Send + Sync {
    /// Open a streaming completion and return the decoded event stream.
    ///
    /// Events arrive in wire order.  The stream ends after `message_stop`
    /// (or the `[DONE]` sentinel), after an error item, or after
    /// [`ClientError::Cancelled`] when the token fires mid-stream.
    async fn send_streaming(
        &self,
        req: CompletionRequest,
        cancel: &CancellationToken,
    ) -> Result<EventStream, ClientError>;

    /// Send a request/response style completion and return the full body.
    async fn send_unary(
        &self,
        req: CompletionRequest,
        cancel: &CancellationToken,
    ) -> Result<FullResponse, ClientError>;
}

/// HTTP streaming client for one configured completion endpoint.
pub struct StreamingClient {
    endpoint_url: String,
    api_key: String,
    protocol_version: String,
    request_timeout: Duration,
    http: reqwest::Client,
}

/// Default protocol version header value.  Opaque to the core.
const DEFAULT_PROTOCOL_VERSION: &str = "2023-06-01";

impl StreamingClient {
    /// Create a client for the given endpoint URL and API key.
    ///
    /// Uses the shared pooled HTTP client, the default protocol version, and
    /// a five minute wall-clock budget per call.
    pub fn new(endpoint_url: impl Into<String>, api_key: impl Into<String>) -> Self {
        StreamingClient {
            endpoint_url: endpoint_url.into(),
            api_key: api_key.into(),
            protocol_version: DEFAULT_PROTOCOL_VERSION.to_string(),
            request_timeout: Duration::from_secs(300),
            http: get_shared_http_client().clone(),
        }
    }

    /// Create a client from the runtime configuration and an API key.
    ///
    /// Picks up the endpoint URL and the per-call wall-clock budget; the key
    /// itself is managed by the embedding application.
    pub fn from_config(config: &ConclaveConfig, api_key: impl Into<String>) -> Self {
        StreamingClient::new(config.completion_endpoint_url.clone(), api_key)
            .with_timeout(Duration::from_secs(config.request_timeout_seconds))
    }

    /// Override the per-call wall-clock budget (builder pattern).
    pub fn with_timeout(mut self, timeout: Duration) -> Self {
        self.request_timeout = timeout;
        self
    }

    /// Override the protocol version header value (builder pattern).
    pub fn with_protocol_version(mut self, version: impl Into<String>) -> Self {
        self.protocol_version = version.into();
        self
    }

    /// Build the POST with auth and protocol headers attached.
    fn post(&self, body: &serde_json::Value) -> reqwest::RequestBuilder {
        self.http
            .post(&self.endpoint_url)
            .header("x-api-key", &self.api_key)
            .header("anthropic-version", &self.protocol_version)
            .header("Content-Type", "application/json")
            .json(body)
    }
}

/// Map a non-success HTTP response into a [`ClientError`].
///
/// Error bodies that decode as a protocol `error` event become
/// [`ClientError::Remote`]; everything else is [`ClientError::Transport`].
fn status_error(status: reqwest::StatusCode, body: &str) -> ClientError {
    if let Ok(value) = serde_json::from_str::<serde_json::Value>(body) {
        if value["type"].as_str() == Some("error") {
            return ClientError::Remote {
                error_type: value["error"]["type"]
                    .as_str()
                    .unwrap_or("unknown")
                    .to_string(),
                message: value["error"]["message"].as_str().unwrap_or("").to_string(),
            };
        }
    }
    ClientError::Transport(format!("HTTP {}: {}", status, body))
}

#[async_trait]
impl CompletionClient for StreamingClient {
    async fn send_streaming(
        &self,
        mut req: CompletionRequest,
        cancel: &CancellationToken,
    ) -> Result<EventStream, ClientError> {
        req.stream = true;
        let body = req.to_json();
        let deadline = tokio::time::Instant::now() + self.request_timeout;

        let response = tokio::select! {
            _ = cancel.cancelled() => return Err(ClientError::Cancelled),
            _ = tokio::time::sleep_until(deadline) => {
                return Err(ClientError::Transport("request timed out".to_string()));
            }
            resp = self.post(&body).send() => {
                resp.map_err(|e| ClientError::Transport(e.to_string()))?
            }
        };

        let status = response.status();
        if !status.is_success() {
            let text = response.text().await.unwrap_or_default();
            log::error!(
                "StreamingClient::send_streaming(...): HTTP {} from {}: {}",
                status,
                self.endpoint_url,
                text
            );
            return Err(status_error(status, &text));
        }

        // Reader task: decodes complete SSE lines from the byte stream and
        // forwards events over a channel.  Dropping the byte stream (on
        // cancellation or deadline) closes the upstream connection.
        let (tx, rx) = mpsc::unbounded_channel::<Result<StreamEvent, ClientError>>();
        let cancel = cancel.clone();
        tokio::spawn(async move {
            let mut bytes = response.bytes_stream();
            // SSE lines can be split across TCP chunks, so carry a remainder
            // buffer forward.  Only complete lines are parsed.
            let mut buf = String::new();
            loop {
                let chunk = tokio::select! {
                    _ = cancel.cancelled() => {
                        let _ = tx.send(Err(ClientError::Cancelled));
                        return;
                    }
                    _ = tokio::time::sleep_until(deadline) => {
                        let _ = tx.send(Err(ClientError::Transport(
                            "stream exceeded time budget".to_string(),
                        )));
                        return;
                    }
                    chunk = bytes.next() => chunk,
                };
                match chunk {
                    None => {
                        // The reader returns as soon as message_stop (or the
                        // [DONE] sentinel) is seen, so reaching EOF here means
                        // the stream was cut short.
                        let _ = tx.send(Err(ClientError::Protocol(
                            "stream ended before message_stop".to_string(),
                        )));
                        return;
                    }
                    Some(Err(e)) => {
                        let _ = tx.send(Err(ClientError::Transport(e.to_string())));
                        return;
                    }
                    Some(Ok(data)) => {
                        buf.push_str(&String::from_utf8_lossy(&data));
                        while let Some(pos) = buf.find('\n') {
                            let line = buf[..pos].to_string();
                            buf.drain(..=pos);
                            let event = match wire::parse_sse_line(&line) {
                                Some(event) => event,
                                None => continue,
                            };
                            match event {
                                StreamEvent::Error {
                                    error_type,
                                    message,
                                } => {
                                    let _ = tx.send(Err(ClientError::Remote {
                                        error_type,
                                        message,
                                    }));
                                    return;
                                }
                                StreamEvent::Done => return,
                                StreamEvent::MessageStop => {
                                    let _ = tx.send(Ok(StreamEvent::MessageStop));
                                    return;
                                }
                                other => {
                                    if tx.send(Ok(other)).is_err() {
                                        // Receiver gone; stop reading.
                                        return;
                                    }
                                }
                            }
                        }
                    }
                }
            }
        });

        let stream = futures_util::stream::unfold(rx, |mut rx| async move {
            rx.recv().await.map(|item| (item, rx))
        });
        Ok(Box::pin(stream))
    }

    async fn send_unary(
        &self,
        mut req: CompletionRequest,
        cancel: &CancellationToken,
    ) -> Result<FullResponse, ClientError> {
        req.stream = false;
        let body = req.to_json();

        let send = async {
            let response = self
                .post(&body)
                .timeout(self.request_timeout)
                .send()
                .await
                .map_err(|e| ClientError::Transport(e.to_string()))?;
            let status = response.status();
            let text = response
                .text()
                .await
                .map_err(|e| ClientError::Transport(e.to_string()))?;
            if !status.is_success() {
                log::error!(
                    "StreamingClient::send_unary(...): HTTP {} from {}: {}",
                    status,
                    self.endpoint_url,
                    text
                );
                return Err(status_error(status, &text));
            }
            serde_json::from_str::<FullResponse>(&text)
                .map_err(|e| ClientError::Protocol(format!("malformed response body: {}", e)))
        };

        tokio::select! {
            _ = cancel.cancelled() => Err(ClientError::Cancelled),
            result = send => result,
        }
    }
}
