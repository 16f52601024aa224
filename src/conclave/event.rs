//! Agent runtime event system.
//!
//! Each [`AgentRuntime`](crate::conclave::agent_runtime::AgentRuntime) emits a
//! totally ordered stream of [`RuntimeEvent`]s over per-subscriber channels.
//! Subscribers consume at their own pace; emission never blocks the emitting
//! task (the channels are unbounded and closed subscribers are pruned).
//!
//! # Event flow for one `request()` call
//!
//! ```text
//! Request
//!   └─ Status { "Processing", 25 }
//!   └─ Text*                          (one per streamed delta)
//!   └─ Response                       (at most once)
//! Completed { success }               (exactly once)
//! ```
//!
//! # Example
//!
//! ```rust,no_run
//! use conclave::conclave::event::{EventBus, RuntimeEvent};
//!
//! # async {
//! let bus = EventBus::new();
//! let mut rx = bus.subscribe();
//! bus.emit(RuntimeEvent::Status {
//!     agent_name: "Evaluator".to_string(),
//!     message: "Processing".to_string(),
//!     percent: 25,
//! });
//! if let Some(event) = rx.recv().await {
//!     println!("{:?}", event);
//! }
//! # };
//! ```

use std::sync::Mutex;
use tokio::sync::mpsc::{unbounded_channel, UnboundedReceiver, UnboundedSender};

/// Events emitted by an agent runtime during its lifecycle.
///
/// Every variant carries `agent_name` so handlers can identify the source
/// without external state.
#[derive(Debug, Clone, PartialEq)]
pub enum RuntimeEvent {
    /// A request was accepted for processing.
    Request {
        /// Emitting agent.
        agent_name: String,
        /// The user input that started the call.
        input: String,
    },
    /// Coarse progress indication.
    Status {
        /// Emitting agent.
        agent_name: String,
        /// Human-readable progress message.
        message: String,
        /// Progress percentage in `0..=100`.
        percent: u8,
    },
    /// An incremental piece of generated text.
    Text {
        /// Emitting agent.
        agent_name: String,
        /// The text fragment.
        delta: String,
    },
    /// The final response for a request.  At most once per call.
    Response {
        /// Emitting agent.
        agent_name: String,
        /// The input the response answers.
        input: String,
        /// The complete generated text.
        text: String,
    },
    /// A failure during the call, emitted before the terminal `Completed`.
    Error {
        /// Emitting agent.
        agent_name: String,
        /// The error description.
        message: String,
    },
    /// Terminal event for a call.  Exactly once per call.
    Completed {
        /// Emitting agent.
        agent_name: String,
        /// Whether the call produced a response.
        success: bool,
    },
}

impl RuntimeEvent {
    /// Name of the agent that emitted this event.
    pub fn agent_name(&self) -> &str {
        match self {
            RuntimeEvent::Request { agent_name, .. }
            | RuntimeEvent::Status { agent_name, .. }
            | RuntimeEvent::Text { agent_name, .. }
            | RuntimeEvent::Response { agent_name, .. }
            | RuntimeEvent::Error { agent_name, .. }
            | RuntimeEvent::Completed { agent_name, .. } => agent_name,
        }
    }
}

/// Fan-out channel hub for [`RuntimeEvent`]s.
///
/// Listeners subscribe with [`EventBus::subscribe`] and receive every event
/// emitted afterwards.  Events from a single bus are totally ordered per
/// subscriber; there is no ordering guarantee across buses.
pub struct EventBus {
    subscribers: Mutex<Vec<UnboundedSender<RuntimeEvent>>>,
}

impl EventBus {
    /// Create a bus with no subscribers.
    pub fn new() -> Self {
        EventBus {
            subscribers: Mutex::new(Vec::new()),
        }
    }

    /// Register a new subscriber and return its receiving end.
    pub fn subscribe(&self) -> UnboundedReceiver<RuntimeEvent> {
        let (tx, rx) = unbounded_channel();
        self.subscribers.lock().unwrap().push(tx);
        rx
    }

    /// Deliver an event to every live subscriber.
    ///
    /// Subscribers whose receiver has been dropped are pruned.  Emission is
    /// non-blocking by construction.
    pub fn emit(&self, event: RuntimeEvent) {
        let mut subscribers = self.subscribers.lock().unwrap();
        subscribers.retain(|tx| tx.send(event.clone()).is_ok());
    }

    /// Number of live subscribers (drops are only observed on emit).
    pub fn subscriber_count(&self) -> usize {
        self.subscribers.lock().unwrap().len()
    }
}

impl Default for EventBus {
    fn default() -> Self {
        Self::new()
    }
}
