//! Agent runtime.
//!
//! An [`AgentRuntime`] owns one agent's system prompt, its persistent message
//! history, and the streaming session used to produce completions.  A call to
//! [`AgentRuntime::request`] converts an input into a streamed completion
//! while emitting lifecycle [`RuntimeEvent`]s on the runtime's event bus.
//!
//! # History modes
//!
//! - **Conversational** — the input is appended to the persistent history and
//!   the whole history is sent; on success the assistant reply is appended
//!   too (exactly two messages per successful call).
//! - **SessionAware** — an injected history slice plus the input are sent;
//!   the persistent history is never mutated.
//! - **Stateless** — exactly the input is sent; the persistent history is
//!   never mutated.
//!
//! # Example
//!
//! ```rust,no_run
//! use std::sync::Arc;
//! use conclave::conclave::agent_runtime::{AgentRuntime, HistoryMode};
//! use conclave::conclave::streaming_client::StreamingClient;
//! use tokio_util::sync::CancellationToken;
//!
//! # async {
//! let client = Arc::new(StreamingClient::new(
//!     "https://api.anthropic.com/v1/messages",
//!     "key",
//! ));
//! let mut runtime = AgentRuntime::new(
//!     "Evaluator",
//!     "You evaluate feasibility.",
//!     client,
//!     "claude-sonnet-4-0",
//!     4096,
//! );
//! let reply = runtime
//!     .request("Is this plan sound?", HistoryMode::Conversational, None, &CancellationToken::new())
//!     .await
//!     .unwrap();
//! println!("{}", reply);
//! # };
//! ```

use crate::conclave::event::{EventBus, RuntimeEvent};
use crate::conclave::streaming_client::{ClientError, CompletionClient};
use crate::conclave::wire::{ChatMessage, CompletionRequest, StreamEvent};
use futures_util::StreamExt;
use std::error::Error;
use std::fmt;
use std::sync::Arc;
use tokio::sync::mpsc::UnboundedReceiver;
use tokio_util::sync::CancellationToken;

/// Controls which prior messages an activation sees and whether new ones
/// persist.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum HistoryMode {
    /// Append to and send the agent's persistent history.
    Conversational,
    /// Send an injected slice of the session transcript; do not persist.
    SessionAware,
    /// Send only the current input; do not persist.
    Stateless,
}

impl HistoryMode {
    /// Parse the wire spelling used in Chief directives.
    pub fn parse(s: &str) -> Option<HistoryMode> {
        match s.trim().to_ascii_uppercase().as_str() {
            "CONVERSATIONAL" => Some(HistoryMode::Conversational),
            "SESSION_AWARE" => Some(HistoryMode::SessionAware),
            "STATELESS" => Some(HistoryMode::Stateless),
            _ => None,
        }
    }

    /// The wire spelling used in Chief directives.
    pub fn as_str(&self) -> &'static str {
        match self {
            HistoryMode::Conversational => "CONVERSATIONAL",
            HistoryMode::SessionAware => "SESSION_AWARE",
            HistoryMode::Stateless => "STATELESS",
        }
    }
}

impl fmt::Display for HistoryMode {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Errors returned by [`AgentRuntime::request`].
#[derive(Debug)]
pub enum RuntimeError {
    /// The runtime was disposed before the call.
    Disposed,
    /// The underlying streaming call failed.
    Client(ClientError),
}

impl fmt::Display for RuntimeError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            RuntimeError::Disposed => write!(f, "agent runtime is disposed"),
            RuntimeError::Client(e) => write!(f, "completion failed: {}", e),
        }
    }
}

impl Error for RuntimeError {
    fn source(&self) -> Option<&(dyn Error + 'static)> {
        match self {
            RuntimeError::Disposed => None,
            RuntimeError::Client(e) => Some(e),
        }
    }
}

/// One agent's prompt, history, and streaming session.
pub struct AgentRuntime {
    /// Agent name, unique within an orchestrator session.
    pub name: String,
    prompt_text: String,
    history: Vec<ChatMessage>,
    response_buffer: String,
    disposed: bool,
    client: Arc<dyn CompletionClient>,
    events: EventBus,
    model: String,
    max_tokens: u32,
    temperature: Option<f32>,
}

impl AgentRuntime {
    /// Create a runtime with an empty history.
    pub fn new(
        name: impl Into<String>,
        prompt_text: impl Into<String>,
        client: Arc<dyn CompletionClient>,
        model: impl Into<String>,
        max_tokens: u32,
    ) -> Self {
        AgentRuntime {
            name: name.into(),
            prompt_text: prompt_text.into(),
            history: Vec::new(),
            response_buffer: String::new(),
            disposed: false,
            client,
            events: EventBus::new(),
            model: model.into(),
            max_tokens,
            temperature: None,
        }
    }

    /// Override the sampling temperature (builder pattern).
    pub fn with_temperature(mut self, temperature: f32) -> Self {
        self.temperature = Some(temperature);
        self
    }

    /// Subscribe to this runtime's event stream.
    ///
    /// Events from a single runtime are totally ordered on the returned
    /// channel.  Listeners must not block the receiving task.
    pub fn subscribe(&self) -> UnboundedReceiver<RuntimeEvent> {
        self.events.subscribe()
    }

    /// The current system prompt text.
    pub fn prompt_text(&self) -> &str {
        &self.prompt_text
    }

    /// The persistent conversation history.
    pub fn history(&self) -> &[ChatMessage] {
        &self.history
    }

    /// Whether [`dispose`](AgentRuntime::dispose) has been called.
    pub fn is_disposed(&self) -> bool {
        self.disposed
    }

    /// Mark the runtime unusable.  Subsequent requests are rejected.
    pub fn dispose(&mut self) {
        self.disposed = true;
    }

    /// Run one completion for `input` under the given history mode.
    ///
    /// Lifecycle events are emitted on the runtime's bus: `Request`, a
    /// processing `Status`, zero or more `Text` deltas, then on success
    /// `Response` followed by exactly one `Completed(true)` and a final
    /// `Status`.  Failures emit `Error` (or a cancellation `Status`) before
    /// `Completed(false)`.
    ///
    /// `injected_session_history` is only consulted in
    /// [`HistoryMode::SessionAware`]; it is passed verbatim ahead of the
    /// input.
    pub async fn request(
        &mut self,
        input: &str,
        history_mode: HistoryMode,
        injected_session_history: Option<&[ChatMessage]>,
        cancel: &CancellationToken,
    ) -> Result<String, RuntimeError> {
        self.request_with_prompt(input, history_mode, injected_session_history, None, cancel)
            .await
    }

    /// Like [`request`](AgentRuntime::request), but with per-call system
    /// prompt selection.
    ///
    /// `prompt_override` replaces the runtime's base prompt for this single
    /// call without touching runtime state; the orchestrator uses it to route
    /// an interaction to one arm of a running A/B test.
    pub async fn request_with_prompt(
        &mut self,
        input: &str,
        history_mode: HistoryMode,
        injected_session_history: Option<&[ChatMessage]>,
        prompt_override: Option<&str>,
        cancel: &CancellationToken,
    ) -> Result<String, RuntimeError> {
        if self.disposed {
            return Err(RuntimeError::Disposed);
        }
        self.response_buffer.clear();
        self.events.emit(RuntimeEvent::Request {
            agent_name: self.name.clone(),
            input: input.to_string(),
        });

        let messages = match history_mode {
            HistoryMode::Conversational => {
                self.history.push(ChatMessage::user(input));
                self.history.clone()
            }
            HistoryMode::SessionAware => {
                let mut messages = injected_session_history
                    .map(|slice| slice.to_vec())
                    .unwrap_or_default();
                messages.push(ChatMessage::user(input));
                messages
            }
            HistoryMode::Stateless => vec![ChatMessage::user(input)],
        };

        self.status("Processing", 25);

        let system = prompt_override.unwrap_or(&self.prompt_text).to_string();
        let request = CompletionRequest {
            model: self.model.clone(),
            max_tokens: self.max_tokens,
            temperature: self.temperature,
            system: Some(system),
            messages,
            stream: true,
        };

        let mut stream = match self.client.send_streaming(request, cancel).await {
            Ok(stream) => stream,
            Err(e) => return Err(self.fail(input, history_mode, e)),
        };

        let mut stopped = false;
        while let Some(item) = stream.next().await {
            match item {
                Ok(StreamEvent::TextDelta { text }) => {
                    self.response_buffer.push_str(&text);
                    self.events.emit(RuntimeEvent::Text {
                        agent_name: self.name.clone(),
                        delta: text,
                    });
                }
                Ok(StreamEvent::MessageStop) => {
                    stopped = true;
                    break;
                }
                Ok(_) => {}
                Err(e) => return Err(self.fail(input, history_mode, e)),
            }
        }
        if !stopped {
            let e = ClientError::Protocol("stream ended before message_stop".to_string());
            return Err(self.fail(input, history_mode, e));
        }

        let final_text = std::mem::take(&mut self.response_buffer);
        if history_mode == HistoryMode::Conversational {
            self.history.push(ChatMessage::assistant(final_text.clone()));
        }
        self.events.emit(RuntimeEvent::Response {
            agent_name: self.name.clone(),
            input: input.to_string(),
            text: final_text.clone(),
        });
        self.events.emit(RuntimeEvent::Completed {
            agent_name: self.name.clone(),
            success: true,
        });
        self.status("Processing complete", 100);
        Ok(final_text)
    }

    /// Emit failure events and roll back the conversational user turn.
    ///
    /// A failed conversational call must not leave a dangling user message in
    /// the persistent history, otherwise retries would double the input.
    fn fail(&mut self, input: &str, history_mode: HistoryMode, e: ClientError) -> RuntimeError {
        if history_mode == HistoryMode::Conversational {
            if let Some(last) = self.history.last() {
                if last.text() == input {
                    self.history.pop();
                }
            }
        }
        match &e {
            ClientError::Cancelled => {
                self.status("Cancelled", 0);
            }
            other => {
                log::error!("AgentRuntime[{}]: completion failed: {}", self.name, other);
                self.events.emit(RuntimeEvent::Error {
                    agent_name: self.name.clone(),
                    message: other.to_string(),
                });
            }
        }
        self.events.emit(RuntimeEvent::Completed {
            agent_name: self.name.clone(),
            success: false,
        });
        RuntimeError::Client(e)
    }

    fn status(&self, message: &str, percent: u8) {
        self.events.emit(RuntimeEvent::Status {
            agent_name: self.name.clone(),
            message: message.to_string(),
            percent,
        });
    }
}
