use async_trait::async_trait;
use conclave::conclave::bootstrap::{initialize, seed_agents, BootstrapAgent};
use conclave::conclave::store::Store;
use conclave::conclave::streaming_client::{ClientError, CompletionClient, EventStream};
use conclave::conclave::wire::{CompletionRequest, FullResponse, StreamEvent, Usage};
use conclave::{ConclaveConfig, Orchestrator};
use std::sync::Arc;
use tokio_util::sync::CancellationToken;

struct OkClient;

#[async_trait]
impl CompletionClient for OkClient {
    async fn send_streaming(
        &self,
        _req: CompletionRequest,
        _cancel: &CancellationToken,
    ) -> Result<EventStream, ClientError> {
        let items: Vec<Result<StreamEvent, ClientError>> = vec![
            Ok(StreamEvent::TextDelta {
                text: "ok".to_string(),
            }),
            Ok(StreamEvent::MessageStop),
        ];
        Ok(Box::pin(futures_util::stream::iter(items)))
    }

    async fn send_unary(
        &self,
        _req: CompletionRequest,
        _cancel: &CancellationToken,
    ) -> Result<FullResponse, ClientError> {
        Ok(FullResponse {
            id: "msg_ok".to_string(),
            usage: Usage::default(),
            content: vec![],
        })
    }
}

fn canonical_agents() -> Vec<BootstrapAgent> {
    [
        ("Chief", "Executive coordination"),
        ("Evaluator", "Feasibility and quality judgement"),
        ("Coder", "Implementation work"),
        ("Designer", "Architecture and structure"),
        ("Tester", "Verification and validation"),
        ("Optimizer", "Refinement of existing work"),
        ("Researcher", "Background investigation"),
    ]
    .into_iter()
    .map(|(name, purpose)| {
        BootstrapAgent::new(name, purpose, format!("PROMPT for {}", name))
    })
    .collect()
}

#[tokio::test]
async fn seeding_is_idempotent() {
    let store = Store::open_in_memory().await.unwrap();
    let agents = canonical_agents();

    let created = seed_agents(&store, &agents).await.unwrap();
    assert_eq!(created.len(), 7);

    // A second pass creates nothing and keeps existing rows intact.
    let created = seed_agents(&store, &agents).await.unwrap();
    assert!(created.is_empty());
    assert_eq!(store.list_agents(true).await.unwrap().len(), 7);
}

#[tokio::test]
async fn seeding_keeps_refined_prompts_authoritative() {
    let store = Store::open_in_memory().await.unwrap();
    let agents = canonical_agents();
    seed_agents(&store, &agents).await.unwrap();

    let chief = store.find_agent_by_name("Chief").await.unwrap().unwrap();
    store
        .add_agent_version(chief.id, "REFINED", "refined", "better", "refiner", 0.4)
        .await
        .unwrap();

    // Re-seeding does not clobber the refined version.
    seed_agents(&store, &agents).await.unwrap();
    let current = store.get_current_agent_version(chief.id).await.unwrap();
    assert_eq!(current.prompt_text, "REFINED");
}

#[tokio::test]
async fn initialize_registers_runtimes_with_active_prompts() {
    let store = Arc::new(Store::open_in_memory().await.unwrap());
    let mut orchestrator = Orchestrator::new(
        store.clone(),
        Arc::new(OkClient),
        ConclaveConfig::default(),
    );

    let registered = initialize(&mut orchestrator, &store, &canonical_agents())
        .await
        .unwrap();
    assert_eq!(registered, 7);

    let chief = orchestrator.runtime("Chief").unwrap();
    assert_eq!(chief.lock().await.prompt_text(), "PROMPT for Chief");
}
