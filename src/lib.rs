// src/lib.rs

// Import the top-level `conclave` module.
pub mod conclave;

// Re-exporting key items for easier external access.
pub use conclave::agent_runtime::{AgentRuntime, HistoryMode};
pub use conclave::config::ConclaveConfig;
pub use conclave::event::RuntimeEvent;
pub use conclave::orchestrator::Orchestrator;
pub use conclave::store::Store;
pub use conclave::streaming_client::{CompletionClient, StreamingClient};
pub use conclave::wire::{ChatMessage, ChatRole, ContentBlock};
