use async_trait::async_trait;
use conclave::conclave::agent_runtime::{AgentRuntime, HistoryMode, RuntimeError};
use conclave::conclave::streaming_client::{ClientError, CompletionClient, EventStream};
use conclave::conclave::wire::{ChatMessage, CompletionRequest, FullResponse, StreamEvent, Usage};
use conclave::RuntimeEvent;
use std::sync::{Arc, Mutex};
use tokio_util::sync::CancellationToken;

/// Scripted client: emits the configured text as deltas, or fails.
struct MockClient {
    deltas: Vec<String>,
    fail_with: Option<ClientError>,
    /// Requests seen, for asserting what the runtime sent.
    requests: Mutex<Vec<CompletionRequest>>,
}

impl MockClient {
    fn replying(deltas: &[&str]) -> Arc<Self> {
        Arc::new(MockClient {
            deltas: deltas.iter().map(|d| d.to_string()).collect(),
            fail_with: None,
            requests: Mutex::new(Vec::new()),
        })
    }

    fn failing(error: ClientError) -> Arc<Self> {
        Arc::new(MockClient {
            deltas: Vec::new(),
            fail_with: Some(error),
            requests: Mutex::new(Vec::new()),
        })
    }

    fn last_request_messages(&self) -> Vec<ChatMessage> {
        self.requests.lock().unwrap().last().unwrap().messages.clone()
    }
}

#[async_trait]
impl CompletionClient for MockClient {
    async fn send_streaming(
        &self,
        req: CompletionRequest,
        cancel: &CancellationToken,
    ) -> Result<EventStream, ClientError> {
        self.requests.lock().unwrap().push(req);
        if cancel.is_cancelled() {
            return Err(ClientError::Cancelled);
        }
        if let Some(error) = &self.fail_with {
            let items: Vec<Result<StreamEvent, ClientError>> = vec![Err(error.clone())];
            return Ok(Box::pin(futures_util::stream::iter(items)));
        }
        let mut items: Vec<Result<StreamEvent, ClientError>> = vec![
            Ok(StreamEvent::MessageStart { input_tokens: 1 }),
            Ok(StreamEvent::ContentBlockStart),
        ];
        for delta in &self.deltas {
            items.push(Ok(StreamEvent::TextDelta {
                text: delta.clone(),
            }));
        }
        items.push(Ok(StreamEvent::ContentBlockStop));
        items.push(Ok(StreamEvent::MessageStop));
        Ok(Box::pin(futures_util::stream::iter(items)))
    }

    async fn send_unary(
        &self,
        req: CompletionRequest,
        _cancel: &CancellationToken,
    ) -> Result<FullResponse, ClientError> {
        self.requests.lock().unwrap().push(req);
        Ok(FullResponse {
            id: "msg_mock".to_string(),
            usage: Usage::default(),
            content: vec![],
        })
    }
}

fn runtime_with(client: Arc<MockClient>) -> AgentRuntime {
    AgentRuntime::new("Evaluator", "You evaluate.", client, "mock-model", 1024)
}

fn drain(rx: &mut tokio::sync::mpsc::UnboundedReceiver<RuntimeEvent>) -> Vec<RuntimeEvent> {
    let mut events = Vec::new();
    while let Ok(event) = rx.try_recv() {
        events.push(event);
    }
    events
}

#[tokio::test]
async fn conversational_appends_exactly_two_messages_on_success() {
    let client = MockClient::replying(&["Looks ", "feasible."]);
    let mut runtime = runtime_with(client.clone());

    let reply = runtime
        .request("Is it sound?", HistoryMode::Conversational, None, &CancellationToken::new())
        .await
        .unwrap();
    assert_eq!(reply, "Looks feasible.");

    let history = runtime.history();
    assert_eq!(history.len(), 2);
    assert_eq!(history[0].text(), "Is it sound?");
    assert_eq!(history[1].text(), "Looks feasible.");

    // The whole history was sent.
    assert_eq!(client.last_request_messages().len(), 1);
}

#[tokio::test]
async fn conversational_history_accumulates_across_calls() {
    let client = MockClient::replying(&["ok"]);
    let mut runtime = runtime_with(client.clone());
    let cancel = CancellationToken::new();

    runtime
        .request("first", HistoryMode::Conversational, None, &cancel)
        .await
        .unwrap();
    runtime
        .request("second", HistoryMode::Conversational, None, &cancel)
        .await
        .unwrap();

    assert_eq!(runtime.history().len(), 4);
    // The second call carried the full prior exchange plus the new input.
    assert_eq!(client.last_request_messages().len(), 3);
}

#[tokio::test]
async fn stateless_sends_only_the_input_and_keeps_history_unchanged() {
    let client = MockClient::replying(&["ok"]);
    let mut runtime = runtime_with(client.clone());
    let cancel = CancellationToken::new();

    runtime
        .request("warmup", HistoryMode::Conversational, None, &cancel)
        .await
        .unwrap();
    let before = runtime.history().len();

    runtime
        .request("one-off", HistoryMode::Stateless, None, &cancel)
        .await
        .unwrap();
    assert_eq!(runtime.history().len(), before);

    let sent = client.last_request_messages();
    assert_eq!(sent.len(), 1);
    assert_eq!(sent[0].text(), "one-off");
}

#[tokio::test]
async fn session_aware_injects_history_verbatim_without_persisting() {
    let client = MockClient::replying(&["ok"]);
    let mut runtime = runtime_with(client.clone());

    let injected = vec![
        ChatMessage::user("earlier question"),
        ChatMessage::assistant("earlier answer"),
    ];
    runtime
        .request(
            "follow-up",
            HistoryMode::SessionAware,
            Some(&injected),
            &CancellationToken::new(),
        )
        .await
        .unwrap();

    assert!(runtime.history().is_empty());
    let sent = client.last_request_messages();
    assert_eq!(sent.len(), 3);
    assert_eq!(sent[0].text(), "earlier question");
    assert_eq!(sent[2].text(), "follow-up");
}

#[tokio::test]
async fn event_stream_follows_the_lifecycle_contract() {
    let client = MockClient::replying(&["Hello"]);
    let mut runtime = runtime_with(client);
    let mut rx = runtime.subscribe();

    runtime
        .request("hi", HistoryMode::Stateless, None, &CancellationToken::new())
        .await
        .unwrap();

    let events = drain(&mut rx);
    assert!(matches!(events[0], RuntimeEvent::Request { .. }));
    assert!(matches!(
        events[1],
        RuntimeEvent::Status { percent: 25, .. }
    ));
    let responses = events
        .iter()
        .filter(|e| matches!(e, RuntimeEvent::Response { .. }))
        .count();
    let completions: Vec<bool> = events
        .iter()
        .filter_map(|e| match e {
            RuntimeEvent::Completed { success, .. } => Some(*success),
            _ => None,
        })
        .collect();
    assert_eq!(responses, 1);
    assert_eq!(completions, vec![true]);
}

#[tokio::test]
async fn remote_error_emits_error_then_completed_false() {
    let client = MockClient::failing(ClientError::Remote {
        error_type: "overloaded_error".to_string(),
        message: "busy".to_string(),
    });
    let mut runtime = runtime_with(client);
    let mut rx = runtime.subscribe();

    let result = runtime
        .request("hi", HistoryMode::Conversational, None, &CancellationToken::new())
        .await;
    assert!(matches!(result, Err(RuntimeError::Client(ClientError::Remote { .. }))));

    // A failed conversational call leaves the persistent history untouched.
    assert!(runtime.history().is_empty());

    let events = drain(&mut rx);
    let error_at = events
        .iter()
        .position(|e| matches!(e, RuntimeEvent::Error { .. }))
        .expect("error event");
    let completed_at = events
        .iter()
        .position(|e| matches!(e, RuntimeEvent::Completed { success: false, .. }))
        .expect("completed event");
    assert!(error_at < completed_at);
    assert!(!events.iter().any(|e| matches!(e, RuntimeEvent::Response { .. })));
}

#[tokio::test]
async fn cancellation_emits_status_then_completed_false() {
    let client = MockClient::replying(&["never delivered"]);
    let mut runtime = runtime_with(client);
    let mut rx = runtime.subscribe();

    let cancel = CancellationToken::new();
    cancel.cancel();
    let result = runtime
        .request("hi", HistoryMode::Stateless, None, &cancel)
        .await;
    assert!(matches!(
        result,
        Err(RuntimeError::Client(ClientError::Cancelled))
    ));

    let events = drain(&mut rx);
    assert!(events.iter().any(|e| matches!(
        e,
        RuntimeEvent::Status { message, percent: 0, .. } if message == "Cancelled"
    )));
    assert!(events
        .iter()
        .any(|e| matches!(e, RuntimeEvent::Completed { success: false, .. })));
}

#[tokio::test]
async fn disposed_runtime_rejects_requests() {
    let client = MockClient::replying(&["ok"]);
    let mut runtime = runtime_with(client);
    runtime.dispose();

    let result = runtime
        .request("hi", HistoryMode::Stateless, None, &CancellationToken::new())
        .await;
    assert!(matches!(result, Err(RuntimeError::Disposed)));
}

#[tokio::test]
async fn prompt_override_reaches_the_wire_without_touching_runtime_state() {
    let client = MockClient::replying(&["ok"]);
    let mut runtime = runtime_with(client.clone());

    runtime
        .request_with_prompt(
            "hi",
            HistoryMode::Stateless,
            None,
            Some("VARIANT PROMPT"),
            &CancellationToken::new(),
        )
        .await
        .unwrap();

    let sent = client.requests.lock().unwrap().last().unwrap().system.clone();
    assert_eq!(sent.as_deref(), Some("VARIANT PROMPT"));
    // The base prompt is untouched and used again on plain requests.
    assert_eq!(runtime.prompt_text(), "You evaluate.");

    runtime
        .request("hi again", HistoryMode::Stateless, None, &CancellationToken::new())
        .await
        .unwrap();
    let sent = client.requests.lock().unwrap().last().unwrap().system.clone();
    assert_eq!(sent.as_deref(), Some("You evaluate."));
}

#[tokio::test]
async fn response_buffer_resets_between_calls() {
    let client = MockClient::replying(&["same"]);
    let mut runtime = runtime_with(client);
    let cancel = CancellationToken::new();

    let first = runtime
        .request("a", HistoryMode::Stateless, None, &cancel)
        .await
        .unwrap();
    let second = runtime
        .request("b", HistoryMode::Stateless, None, &cancel)
        .await
        .unwrap();
    assert_eq!(first, "same");
    assert_eq!(second, "same");
}
