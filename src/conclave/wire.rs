//! Wire codec for the completion endpoint.
//!
//! This module owns the JSON request shape sent to the remote model and the
//! parsing of its server-sent-event stream into typed [`StreamEvent`]s.  It is
//! deliberately pure: no I/O and no concurrency live here, which keeps the
//! codec unit-testable without a network.  The [`StreamingClient`]
//! (`crate::conclave::streaming_client`) feeds raw SSE lines into
//! [`parse_sse_line`] and forwards the decoded events.
//!
//! # Stream shape
//!
//! Each non-empty SSE line is prefixed `data: ` and carries a JSON object
//! whose `type` field selects the event:
//!
//! ```text
//! data: {"type":"message_start","message":{"usage":{"input_tokens":12}}}
//! data: {"type":"content_block_start","index":0}
//! data: {"type":"content_block_delta","delta":{"type":"text_delta","text":"Hi"}}
//! data: {"type":"content_block_stop","index":0}
//! data: {"type":"message_delta","delta":{"stop_reason":"end_turn"},"usage":{"output_tokens":4}}
//! data: {"type":"message_stop"}
//! data: [DONE]
//! ```
//!
//! Malformed JSON lines are skipped silently; a decoded `error` event is
//! surfaced as [`StreamEvent::Error`].

use serde::{Deserialize, Serialize};

/// Prefix carried by every SSE payload line.
pub const SSE_DATA_PREFIX: &str = "data: ";

/// Sentinel payload that terminates the stream.
pub const SSE_DONE_MARKER: &str = "[DONE]";

/// Conversation role of a [`ChatMessage`].
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ChatRole {
    /// A user authored message (the orchestrator speaks as the user).
    User,
    /// A model authored message.
    Assistant,
}

/// A single block of message content.
///
/// Histories are ordered sequences of blocks so that text and images can be
/// interleaved inside one conversational turn.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum ContentBlock {
    /// Plain text.
    Text {
        /// The text payload.
        text: String,
    },
    /// Base64-encoded image data.
    Image {
        /// MIME type, e.g. `"image/png"`.
        media_type: String,
        /// Base64 payload.
        data: String,
    },
}

impl ContentBlock {
    /// Convenience constructor for a text block.
    pub fn text(text: impl Into<String>) -> Self {
        ContentBlock::Text { text: text.into() }
    }
}

/// One message in a conversation history.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ChatMessage {
    /// Who authored the message.
    pub role: ChatRole,
    /// Ordered content blocks.
    pub content: Vec<ContentBlock>,
}

impl ChatMessage {
    /// Build a user message from plain text.
    pub fn user(text: impl Into<String>) -> Self {
        ChatMessage {
            role: ChatRole::User,
            content: vec![ContentBlock::text(text)],
        }
    }

    /// Build an assistant message from plain text.
    pub fn assistant(text: impl Into<String>) -> Self {
        ChatMessage {
            role: ChatRole::Assistant,
            content: vec![ContentBlock::text(text)],
        }
    }

    /// Concatenate the text blocks of this message, ignoring images.
    pub fn text(&self) -> String {
        let mut out = String::new();
        for block in &self.content {
            if let ContentBlock::Text { text } = block {
                out.push_str(text);
            }
        }
        out
    }
}

/// The JSON body of a completion request.
#[derive(Debug, Clone, Serialize)]
pub struct CompletionRequest {
    /// Upstream model identifier.
    pub model: String,
    /// Hard cap on generated tokens.
    pub max_tokens: u32,
    /// Optional sampling temperature.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub temperature: Option<f32>,
    /// Optional system prompt, sent as a top-level field rather than a turn.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub system: Option<String>,
    /// Conversation turns, oldest first.
    pub messages: Vec<ChatMessage>,
    /// Whether the endpoint should stream the response as SSE.
    pub stream: bool,
}

impl CompletionRequest {
    /// Serialise the request to its wire JSON.
    pub fn to_json(&self) -> serde_json::Value {
        // CompletionRequest derives Serialize with no fallible fields.
        serde_json::to_value(self).unwrap_or(serde_json::Value::Null)
    }
}

/// Token accounting reported by the endpoint.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Deserialize)]
pub struct Usage {
    /// Prompt tokens billed.
    #[serde(default)]
    pub input_tokens: u64,
    /// Generated tokens billed.
    #[serde(default)]
    pub output_tokens: u64,
}

/// The JSON body of a non-streaming (unary) completion response.
#[derive(Debug, Clone, Deserialize)]
pub struct FullResponse {
    /// Provider-assigned response id.
    pub id: String,
    /// Token accounting for the call.
    #[serde(default)]
    pub usage: Usage,
    /// Generated content blocks.
    #[serde(default)]
    pub content: Vec<ContentBlock>,
}

impl FullResponse {
    /// Concatenate the text blocks of the response.
    pub fn text(&self) -> String {
        let mut out = String::new();
        for block in &self.content {
            if let ContentBlock::Text { text } = block {
                out.push_str(text);
            }
        }
        out
    }
}

/// A decoded server-sent event from the completion stream.
#[derive(Debug, Clone, PartialEq)]
pub enum StreamEvent {
    /// The message envelope opened; carries prompt-side token usage.
    MessageStart {
        /// Prompt tokens reported in `message.usage`.
        input_tokens: u64,
    },
    /// A content block opened.
    ContentBlockStart,
    /// An incremental piece of generated text.
    TextDelta {
        /// The text fragment.
        text: String,
    },
    /// A content block closed.
    ContentBlockStop,
    /// Mid-stream metadata: stop reason and output-side token usage.
    MessageDelta {
        /// Why generation stopped, when known (e.g. `"end_turn"`).
        stop_reason: Option<String>,
        /// The stop sequence that fired, if any.
        stop_sequence: Option<String>,
        /// Generated tokens reported so far.
        output_tokens: u64,
    },
    /// The message is complete.  The accumulated deltas form the final text.
    MessageStop,
    /// A well-formed error event from the endpoint.
    Error {
        /// Machine-readable error class reported by the endpoint.
        error_type: String,
        /// Human-readable message.
        message: String,
    },
    /// The `[DONE]` sentinel terminating the stream.
    Done,
}

/// Parse one SSE line into a [`StreamEvent`].
///
/// Returns `None` for lines that carry no event: empty lines, lines without
/// the `data: ` prefix, malformed JSON (skipped silently per the stream
/// contract), and events of unknown type.
pub fn parse_sse_line(line: &str) -> Option<StreamEvent> {
    let line = line.trim_end_matches('\r');
    let data = line.strip_prefix(SSE_DATA_PREFIX)?.trim();
    if data.is_empty() {
        return None;
    }
    if data == SSE_DONE_MARKER {
        return Some(StreamEvent::Done);
    }
    let value: serde_json::Value = serde_json::from_str(data).ok()?;
    parse_event(&value)
}

/// Decode a JSON event object into a [`StreamEvent`] by its `type` field.
///
/// Unknown event types return `None` so future additions to the protocol do
/// not break the stream.
pub fn parse_event(value: &serde_json::Value) -> Option<StreamEvent> {
    match value["type"].as_str()? {
        "message_start" => {
            let input_tokens = value["message"]["usage"]["input_tokens"]
                .as_u64()
                .unwrap_or(0);
            Some(StreamEvent::MessageStart { input_tokens })
        }
        "content_block_start" => Some(StreamEvent::ContentBlockStart),
        "content_block_delta" => {
            let delta = &value["delta"];
            match delta["type"].as_str().unwrap_or("") {
                "text_delta" => Some(StreamEvent::TextDelta {
                    text: delta["text"].as_str().unwrap_or("").to_string(),
                }),
                // Non-text deltas carry nothing the runtime accumulates.
                _ => None,
            }
        }
        "content_block_stop" => Some(StreamEvent::ContentBlockStop),
        "message_delta" => Some(StreamEvent::MessageDelta {
            stop_reason: value["delta"]["stop_reason"].as_str().map(str::to_string),
            stop_sequence: value["delta"]["stop_sequence"]
                .as_str()
                .map(str::to_string),
            output_tokens: value["usage"]["output_tokens"].as_u64().unwrap_or(0),
        }),
        "message_stop" => Some(StreamEvent::MessageStop),
        "error" => Some(StreamEvent::Error {
            error_type: value["error"]["type"]
                .as_str()
                .unwrap_or("unknown")
                .to_string(),
            message: value["error"]["message"].as_str().unwrap_or("").to_string(),
        }),
        _ => None,
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn request_serialises_expected_fields() {
        let req = CompletionRequest {
            model: "test-model".to_string(),
            max_tokens: 1024,
            temperature: Some(0.3),
            system: Some("You are terse.".to_string()),
            messages: vec![ChatMessage::user("hello")],
            stream: true,
        };
        let v = req.to_json();
        assert_eq!(v["model"], "test-model");
        assert_eq!(v["max_tokens"], 1024);
        assert_eq!(v["stream"], true);
        assert_eq!(v["system"], "You are terse.");
        assert_eq!(v["messages"][0]["role"], "user");
        assert_eq!(v["messages"][0]["content"][0]["type"], "text");
        assert_eq!(v["messages"][0]["content"][0]["text"], "hello");
    }

    #[test]
    fn optional_fields_are_omitted_when_absent() {
        let req = CompletionRequest {
            model: "m".to_string(),
            max_tokens: 100,
            temperature: None,
            system: None,
            messages: vec![],
            stream: false,
        };
        let v = req.to_json();
        assert!(v.get("temperature").is_none());
        assert!(v.get("system").is_none());
    }

    #[test]
    fn text_delta_round_trip() {
        let ev = parse_sse_line(
            r#"data: {"type":"content_block_delta","delta":{"type":"text_delta","text":"world"}}"#,
        );
        assert_eq!(
            ev,
            Some(StreamEvent::TextDelta {
                text: "world".to_string()
            })
        );
    }

    #[test]
    fn done_marker_terminates() {
        assert_eq!(parse_sse_line("data: [DONE]"), Some(StreamEvent::Done));
    }

    #[test]
    fn malformed_json_is_skipped_silently() {
        assert_eq!(parse_sse_line("data: {not json"), None);
        assert_eq!(parse_sse_line("event: ping"), None);
        assert_eq!(parse_sse_line(""), None);
    }

    #[test]
    fn message_delta_carries_stop_reason_and_usage() {
        let ev = parse_sse_line(
            r#"data: {"type":"message_delta","delta":{"stop_reason":"end_turn"},"usage":{"output_tokens":42}}"#,
        )
        .unwrap();
        assert_eq!(
            ev,
            StreamEvent::MessageDelta {
                stop_reason: Some("end_turn".to_string()),
                stop_sequence: None,
                output_tokens: 42,
            }
        );
    }

    #[test]
    fn error_event_is_surfaced() {
        let ev = parse_sse_line(
            r#"data: {"type":"error","error":{"type":"overloaded_error","message":"busy"}}"#,
        )
        .unwrap();
        assert_eq!(
            ev,
            StreamEvent::Error {
                error_type: "overloaded_error".to_string(),
                message: "busy".to_string(),
            }
        );
    }

    #[test]
    fn unknown_event_types_are_ignored() {
        assert_eq!(parse_sse_line(r#"data: {"type":"ping"}"#), None);
    }

    #[test]
    fn unary_response_parses_and_concatenates_text() {
        let body = r#"{
            "id": "msg_01",
            "usage": {"input_tokens": 7, "output_tokens": 3},
            "content": [
                {"type": "text", "text": "Hello, "},
                {"type": "text", "text": "world."}
            ]
        }"#;
        let resp: FullResponse = serde_json::from_str(body).unwrap();
        assert_eq!(resp.id, "msg_01");
        assert_eq!(resp.usage.input_tokens, 7);
        assert_eq!(resp.text(), "Hello, world.");
    }
}
