use async_trait::async_trait;
use conclave::conclave::directive::{parse_directive, ActivationInfo, Directive};
use conclave::conclave::orchestrator::{
    BlockStatus, Orchestrator, OrchestratorError, SessionEnd, UserInputProvider,
};
use conclave::conclave::store::Store;
use conclave::conclave::streaming_client::{ClientError, CompletionClient, EventStream};
use conclave::conclave::task_type::TaskType;
use conclave::conclave::wire::{CompletionRequest, FullResponse, StreamEvent, Usage};
use conclave::{ConclaveConfig, HistoryMode};
use std::collections::{HashMap, VecDeque};
use std::sync::{Arc, Mutex};
use std::time::Duration;
use tokio_util::sync::CancellationToken;

/// One scripted reply for an agent, keyed by its system prompt.
#[derive(Clone)]
struct Reply {
    text: String,
    delay_ms: u64,
    fail: bool,
}

impl Reply {
    fn text(text: &str) -> Self {
        Reply {
            text: text.to_string(),
            delay_ms: 0,
            fail: false,
        }
    }

    fn slow(text: &str, delay_ms: u64) -> Self {
        Reply {
            text: text.to_string(),
            delay_ms,
            fail: false,
        }
    }

    fn failure() -> Self {
        Reply {
            text: String::new(),
            delay_ms: 0,
            fail: true,
        }
    }
}

/// Routes each request by the system prompt it carries, so every agent
/// registered with a distinct prompt gets its own script.  Records a log of
/// `start:<prompt>` / `end:<prompt>` markers for ordering assertions.
struct ScriptedClient {
    scripts: Mutex<HashMap<String, VecDeque<Reply>>>,
    log: Mutex<Vec<String>>,
}

impl ScriptedClient {
    fn new() -> Arc<Self> {
        Arc::new(ScriptedClient {
            scripts: Mutex::new(HashMap::new()),
            log: Mutex::new(Vec::new()),
        })
    }

    fn script(&self, system_prompt: &str, replies: Vec<Reply>) {
        self.scripts
            .lock()
            .unwrap()
            .insert(system_prompt.to_string(), replies.into());
    }

    fn log_entries(&self) -> Vec<String> {
        self.log.lock().unwrap().clone()
    }

    fn position(&self, entry: &str) -> usize {
        self.log_entries()
            .iter()
            .position(|e| e == entry)
            .unwrap_or_else(|| panic!("no log entry '{}'", entry))
    }
}

#[async_trait]
impl CompletionClient for ScriptedClient {
    async fn send_streaming(
        &self,
        req: CompletionRequest,
        cancel: &CancellationToken,
    ) -> Result<EventStream, ClientError> {
        let key = req.system.clone().unwrap_or_default();
        let reply = self
            .scripts
            .lock()
            .unwrap()
            .get_mut(&key)
            .and_then(VecDeque::pop_front)
            .unwrap_or_else(|| Reply::text("ok"));

        self.log.lock().unwrap().push(format!("start:{}", key));
        if reply.delay_ms > 0 {
            tokio::select! {
                _ = cancel.cancelled() => return Err(ClientError::Cancelled),
                _ = tokio::time::sleep(Duration::from_millis(reply.delay_ms)) => {}
            }
        }
        self.log.lock().unwrap().push(format!("end:{}", key));

        if reply.fail {
            let items: Vec<Result<StreamEvent, ClientError>> = vec![Err(ClientError::Remote {
                error_type: "overloaded_error".to_string(),
                message: "scripted failure".to_string(),
            })];
            return Ok(Box::pin(futures_util::stream::iter(items)));
        }
        let items: Vec<Result<StreamEvent, ClientError>> = vec![
            Ok(StreamEvent::TextDelta { text: reply.text }),
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
            id: "msg_scripted".to_string(),
            usage: Usage::default(),
            content: vec![],
        })
    }
}

async fn orchestrator_with(client: Arc<ScriptedClient>) -> (Orchestrator, Arc<Store>) {
    let _ = env_logger::builder().is_test(true).try_init();
    let store = Arc::new(Store::open_in_memory().await.unwrap());
    let orchestrator = Orchestrator::new(store.clone(), client, ConclaveConfig::default());
    (orchestrator, store)
}

fn activation(name: &str, focus: &str) -> ActivationInfo {
    let parsed = parse_directive(&format!(
        "[ACTIVATION_DIRECTIVES][ACTIVATE]{}:{}[/ACTIVATE][/ACTIVATION_DIRECTIVES]",
        name, focus
    ))
    .unwrap();
    match parsed {
        Directive::Activations(mut activations) => activations.remove(0),
        _ => unreachable!(),
    }
}

#[tokio::test]
async fn phase_two_starts_only_after_phase_one_completes() {
    let client = ScriptedClient::new();
    client.script("EVAL", vec![Reply::slow("feasible", 80)]);
    client.script("SCOUT", vec![Reply::slow("scouted", 40)]);
    client.script("CODE", vec![Reply::text("implemented")]);

    let (mut orchestrator, store) = orchestrator_with(client.clone()).await;
    store.add_agent("Evaluator", "p", "EVAL", "b").await.unwrap();
    store.add_agent("Scout", "p", "SCOUT", "b").await.unwrap();
    store.add_agent("Coder", "p", "CODE", "b").await.unwrap();
    orchestrator.register_agents_from_store().await.unwrap();

    let mut coder = activation("Coder", "implement it");
    coder.execution_phase = 2;
    let block = orchestrator
        .execute_block(vec![
            activation("Evaluator", "judge it"),
            activation("Scout", "scan it"),
            coder,
        ])
        .await
        .unwrap();

    assert_eq!(block.status, BlockStatus::Completed);
    assert_eq!(block.outcomes.len(), 3);

    // No phase-2 event precedes the completion of either phase-1 activation.
    let start_coder = client.position("start:CODE");
    assert!(client.position("end:EVAL") < start_coder);
    assert!(client.position("end:SCOUT") < start_coder);
}

#[tokio::test]
async fn in_phase_dependency_serialises_the_dependent() {
    let client = ScriptedClient::new();
    client.script("EVAL", vec![Reply::slow("feasible", 60)]);
    client.script("CODE", vec![Reply::text("implemented")]);

    let (mut orchestrator, store) = orchestrator_with(client.clone()).await;
    store.add_agent("Evaluator", "p", "EVAL", "b").await.unwrap();
    store.add_agent("Coder", "p", "CODE", "b").await.unwrap();
    orchestrator.register_agents_from_store().await.unwrap();

    let evaluator = activation("Evaluator", "judge it");
    let mut coder = activation("Coder", "implement it");
    coder.depends_on.insert("Evaluator".to_string());

    let block = orchestrator
        .execute_block(vec![evaluator, coder])
        .await
        .unwrap();
    assert_eq!(block.status, BlockStatus::Completed);
    assert!(client.position("end:EVAL") < client.position("start:CODE"));
}

#[tokio::test]
async fn dependency_cycles_fail_the_whole_block() {
    let client = ScriptedClient::new();
    let (mut orchestrator, store) = orchestrator_with(client).await;
    store.add_agent("A", "p", "PA", "b").await.unwrap();
    store.add_agent("B", "p", "PB", "b").await.unwrap();
    orchestrator.register_agents_from_store().await.unwrap();

    let mut a = activation("A", "x");
    a.depends_on.insert("B".to_string());
    let mut b = activation("B", "y");
    b.depends_on.insert("A".to_string());

    let err = orchestrator.execute_block(vec![a, b]).await.unwrap_err();
    assert!(matches!(err, OrchestratorError::CycleDetected(_)));
}

#[tokio::test]
async fn failed_activation_yields_partial_failure_and_is_recorded() {
    let client = ScriptedClient::new();
    client.script("EVAL", vec![Reply::failure()]);
    client.script("CODE", vec![Reply::text("implemented")]);

    let (mut orchestrator, store) = orchestrator_with(client).await;
    let eval_id = store.add_agent("Evaluator", "p", "EVAL", "b").await.unwrap();
    store.add_agent("Coder", "p", "CODE", "b").await.unwrap();
    orchestrator.register_agents_from_store().await.unwrap();

    let block = orchestrator
        .execute_block(vec![
            activation("Evaluator", "judge it"),
            activation("Coder", "implement it"),
        ])
        .await
        .unwrap();

    assert_eq!(block.status, BlockStatus::PartialFailure);
    let failed = block
        .outcomes
        .iter()
        .find(|o| o.agent_name == "Evaluator")
        .unwrap();
    assert!(!failed.success);
    assert!(!failed.fatal);

    // A failed run is recorded as an incorrect interaction, never dropped.
    let interactions = store.interactions_for_agent(eval_id, 10).await.unwrap();
    assert_eq!(interactions.len(), 1);
    assert_eq!(interactions[0].is_correct, Some(false));
}

#[tokio::test]
async fn unknown_agent_is_fatal_and_skips_later_phases() {
    let client = ScriptedClient::new();
    client.script("CODE", vec![Reply::text("implemented")]);

    let (mut orchestrator, store) = orchestrator_with(client.clone()).await;
    store.add_agent("Coder", "p", "CODE", "b").await.unwrap();
    orchestrator.register_agents_from_store().await.unwrap();

    let ghost = activation("Ghost", "haunt");
    let mut coder = activation("Coder", "implement it");
    coder.execution_phase = 2;

    let block = orchestrator.execute_block(vec![ghost, coder]).await.unwrap();
    assert_eq!(block.status, BlockStatus::PartialFailure);
    assert_eq!(block.outcomes.len(), 1);
    assert!(block.outcomes[0].fatal);
    // The phase-2 agent never ran.
    assert!(client.log_entries().iter().all(|e| !e.contains("CODE")));
}

#[tokio::test]
async fn team_expansion_places_the_chief_first() {
    let client = ScriptedClient::new();
    let (mut orchestrator, store) = orchestrator_with(client).await;
    let chief = store.add_agent("Chief", "exec", "CHIEF", "b").await.unwrap();
    let coder = store.add_agent("Coder", "code", "CODE", "b").await.unwrap();
    let team_id = store.create_team("BuildSquad", chief, None).await.unwrap();
    store.add_to_team(team_id, coder, "Builder", None).await.unwrap();
    orchestrator.register_agents_from_store().await.unwrap();

    let directive =
        parse_directive("[ACTIVATE_TEAM]BuildSquad:ship it[HISTORY_MODE=STATELESS][/ACTIVATE_TEAM]")
            .unwrap();
    let Directive::ActivateTeam(team) = directive else {
        panic!("expected team directive");
    };
    let activations = orchestrator.expand_team(&team).await.unwrap();

    assert_eq!(activations.len(), 2);
    assert_eq!(activations[0].module_name, "Chief");
    assert_eq!(activations[1].module_name, "Coder");
    for a in &activations {
        assert_eq!(a.focus, "ship it");
        assert_eq!(a.history_mode, HistoryMode::Stateless);
        assert_eq!(a.execution_phase, 1);
        assert!(a.depends_on.is_empty());
    }
}

#[tokio::test]
async fn session_runs_to_a_final_directive() {
    let client = ScriptedClient::new();
    client.script(
        "CHIEF",
        vec![
            Reply::text(
                "Delegating.\n[ACTIVATION_DIRECTIVES][ACTIVATE]Evaluator:analyze the goal\
                 [/ACTIVATE][/ACTIVATION_DIRECTIVES]",
            ),
            Reply::text("[FINAL_ANSWER]shipped[/FINAL_ANSWER]"),
        ],
    );
    client.script("EVAL", vec![Reply::text("Feasible.")]);

    let (mut orchestrator, store) = orchestrator_with(client).await;
    store.add_agent("Chief", "exec", "CHIEF", "b").await.unwrap();
    let eval_id = store.add_agent("Evaluator", "judge", "EVAL", "b").await.unwrap();
    orchestrator.register_agents_from_store().await.unwrap();

    let result = orchestrator.run_session("build it", 5, None).await.unwrap();
    assert_eq!(
        result.end,
        SessionEnd::Final {
            tag: "ANSWER".to_string(),
            payload: "shipped".to_string(),
        }
    );
    assert_eq!(result.ticks, 2);

    // The specialist's reply was recorded against its store row.
    let interactions = store.interactions_for_agent(eval_id, 10).await.unwrap();
    assert_eq!(interactions.len(), 1);
    assert_eq!(interactions[0].task_type, "Analysis");
    assert_eq!(interactions[0].response, "Feasible.");

    // The transcript carries the Chief turns and the formatted feedback.
    let transcript = orchestrator.transcript();
    assert_eq!(transcript.len(), 4);
    assert!(transcript[2]
        .text()
        .contains("[AGENT]Evaluator[/AGENT][RESPONSE]Feasible.[/RESPONSE]"));
}

#[tokio::test]
async fn unparseable_chief_reply_triggers_a_correction_prompt() {
    let client = ScriptedClient::new();
    client.script(
        "CHIEF",
        vec![
            Reply::text("I will get to it eventually, no directive here."),
            Reply::text("[ACTION_HALT]giving up[/ACTION_HALT]"),
        ],
    );

    let (mut orchestrator, store) = orchestrator_with(client).await;
    store.add_agent("Chief", "exec", "CHIEF", "b").await.unwrap();
    orchestrator.register_agents_from_store().await.unwrap();

    let result = orchestrator.run_session("build it", 5, None).await.unwrap();
    assert_eq!(
        result.end,
        SessionEnd::Halted {
            reason: "giving up".to_string(),
        }
    );
    // Tick 1 failed to parse, tick 2 halted.
    assert_eq!(result.ticks, 2);

    // The correction prompt was fed back as the Chief's next input.
    let transcript = orchestrator.transcript();
    assert!(transcript[2].text().contains("could not be interpreted"));
}

#[tokio::test]
async fn agent_creation_directive_persists_and_registers() {
    let client = ScriptedClient::new();
    client.script(
        "CHIEF",
        vec![
            Reply::text(
                "[REQUEST_AGENT_CREATION][NAME]Researcher[/NAME]\
                 [PURPOSE]Literature digging[/PURPOSE]\
                 [CAPABILITIES]search,summarize[/CAPABILITIES]\
                 [PROMPT]RESEARCH[/PROMPT][/REQUEST_AGENT_CREATION]",
            ),
            Reply::text("[ACTION_HALT]done[/ACTION_HALT]"),
        ],
    );

    let (mut orchestrator, store) = orchestrator_with(client).await;
    store.add_agent("Chief", "exec", "CHIEF", "b").await.unwrap();
    orchestrator.register_agents_from_store().await.unwrap();

    orchestrator.run_session("expand the team", 5, None).await.unwrap();

    let agent = store
        .find_agent_by_name("Researcher")
        .await
        .unwrap()
        .expect("researcher persisted");
    let capabilities = store.list_capabilities(agent.id).await.unwrap();
    assert_eq!(capabilities.len(), 2);
    assert!(orchestrator.runtime("researcher").is_some());
}

#[tokio::test]
async fn ask_user_routes_through_the_input_provider() {
    struct CannedInput;

    #[async_trait]
    impl UserInputProvider for CannedInput {
        async fn ask(
            &self,
            question: &str,
        ) -> Result<String, Box<dyn std::error::Error + Send + Sync>> {
            assert_eq!(question, "Which database?");
            Ok("sqlite".to_string())
        }
    }

    let client = ScriptedClient::new();
    client.script(
        "CHIEF",
        vec![
            Reply::text("[ACTION_ASK_USER]Which database?[/ACTION_ASK_USER]"),
            Reply::text("[FINAL_PLAN]use sqlite[/FINAL_PLAN]"),
        ],
    );

    let (mut orchestrator, store) = orchestrator_with(client).await;
    store.add_agent("Chief", "exec", "CHIEF", "b").await.unwrap();
    orchestrator.register_agents_from_store().await.unwrap();

    let result = orchestrator
        .run_session("decide storage", 5, Some(Arc::new(CannedInput)))
        .await
        .unwrap();
    assert_eq!(
        result.end,
        SessionEnd::Final {
            tag: "PLAN".to_string(),
            payload: "use sqlite".to_string(),
        }
    );
    // The user's answer became the Chief's next input.
    assert_eq!(orchestrator.transcript()[2].text(), "sqlite");
}

#[tokio::test]
async fn ask_user_without_a_provider_halts_the_session() {
    let client = ScriptedClient::new();
    client.script(
        "CHIEF",
        vec![Reply::text("[ACTION_ASK_USER]Anyone there?[/ACTION_ASK_USER]")],
    );

    let (mut orchestrator, store) = orchestrator_with(client).await;
    store.add_agent("Chief", "exec", "CHIEF", "b").await.unwrap();
    orchestrator.register_agents_from_store().await.unwrap();

    let result = orchestrator.run_session("hello", 5, None).await.unwrap();
    assert!(matches!(result.end, SessionEnd::Halted { .. }));
}

#[tokio::test]
async fn session_aware_activation_receives_the_transcript_slice() {
    let client = ScriptedClient::new();
    client.script(
        "CHIEF",
        vec![
            Reply::text(
                "[ACTIVATION_DIRECTIVES][ACTIVATE]Evaluator:review progress\
                 [HISTORY_MODE=SESSION_AWARE][SESSION_HISTORY_COUNT=2][/ACTIVATE]\
                 [/ACTIVATION_DIRECTIVES]",
            ),
            Reply::text("[ACTION_HALT]done[/ACTION_HALT]"),
        ],
    );
    client.script("EVAL", vec![Reply::text("On track.")]);

    let (mut orchestrator, store) = orchestrator_with(client).await;
    store.add_agent("Chief", "exec", "CHIEF", "b").await.unwrap();
    store.add_agent("Evaluator", "judge", "EVAL", "b").await.unwrap();
    orchestrator.register_agents_from_store().await.unwrap();

    orchestrator.run_session("kick off", 5, None).await.unwrap();

    // The evaluator never gained persistent history in session-aware mode.
    let evaluator = orchestrator.runtime("Evaluator").unwrap();
    assert!(evaluator.lock().await.history().is_empty());
}

#[tokio::test]
async fn ab_test_routes_activations_and_reverts_on_a_tie() {
    let client = ScriptedClient::new();
    // Both arms answer successfully, so the challenger cannot clear the
    // promotion margin (nor the sample floor).
    client.script(
        "PROMPT_A",
        vec![Reply::text("from a"), Reply::text("from a")],
    );
    client.script(
        "PROMPT_B",
        vec![Reply::text("from b"), Reply::text("from b")],
    );

    let (mut orchestrator, store) = orchestrator_with(client.clone()).await;
    store.add_agent("Coder", "codes", "PROMPT_A", "b").await.unwrap();
    orchestrator.register_agents_from_store().await.unwrap();

    orchestrator.start_ab_test("Coder", "PROMPT_B", "try b").await.unwrap();

    for _ in 0..4 {
        let block = orchestrator
            .execute_block(vec![activation("Coder", "implement it")])
            .await
            .unwrap();
        assert_eq!(block.status, BlockStatus::Completed);
    }

    // The fair split sent two interactions to each arm's prompt.
    let log = client.log_entries();
    assert_eq!(log.iter().filter(|e| *e == "start:PROMPT_A").count(), 2);
    assert_eq!(log.iter().filter(|e| *e == "start:PROMPT_B").count(), 2);

    let outcome = orchestrator.conclude_ab_test("Coder").await.unwrap();
    assert!(!outcome.promoted);
    assert_eq!(outcome.total_a, 2);
    assert_eq!(outcome.total_b, 2);

    // The revert superseded with the incumbent prompt and the live runtime
    // was swapped to it.
    let coder = store.find_agent_by_name("Coder").await.unwrap().unwrap();
    let current = store.get_current_agent_version(coder.id).await.unwrap();
    assert_eq!(current.prompt_text, "PROMPT_A");
    assert_eq!(current.version_number, 3);
    let runtime = orchestrator.runtime("Coder").unwrap();
    assert_eq!(runtime.lock().await.prompt_text(), "PROMPT_A");
}

#[tokio::test]
async fn ab_test_promotes_a_winning_challenger() {
    let client = ScriptedClient::new();
    // The incumbent arm fails every interaction; the challenger succeeds.
    client.script("PROMPT_A", (0..10).map(|_| Reply::failure()).collect());
    client.script("PROMPT_B", (0..10).map(|_| Reply::text("good")).collect());

    let (mut orchestrator, store) = orchestrator_with(client).await;
    store.add_agent("Coder", "codes", "PROMPT_A", "b").await.unwrap();
    orchestrator.register_agents_from_store().await.unwrap();

    orchestrator.start_ab_test("Coder", "PROMPT_B", "try b").await.unwrap();
    for _ in 0..20 {
        orchestrator
            .execute_block(vec![activation("Coder", "implement it")])
            .await
            .unwrap();
    }

    let outcome = orchestrator.conclude_ab_test("Coder").await.unwrap();
    assert!(outcome.promoted);
    assert_eq!(outcome.total_a, 10);
    assert_eq!(outcome.total_b, 10);
    assert!(outcome.rate_b > outcome.rate_a);

    // The challenger stays active and the live runtime now carries it.
    let coder = store.find_agent_by_name("Coder").await.unwrap().unwrap();
    let current = store.get_current_agent_version(coder.id).await.unwrap();
    assert_eq!(current.prompt_text, "PROMPT_B");
    assert_eq!(current.version_number, 2);
    let runtime = orchestrator.runtime("Coder").unwrap();
    assert_eq!(runtime.lock().await.prompt_text(), "PROMPT_B");
}

#[tokio::test]
async fn refine_agent_bumps_the_version_and_swaps_the_runtime() {
    let client = ScriptedClient::new();
    client.script(
        "CHIEF",
        vec![Reply::text("[SUGGESTION]You write careful code.[/SUGGESTION]")],
    );

    let (mut orchestrator, store) = orchestrator_with(client).await;
    store.add_agent("Chief", "exec", "CHIEF", "b").await.unwrap();
    let coder = store.add_agent("Coder", "codes", "OLD", "b").await.unwrap();
    let tester = store.add_agent("Tester", "tests", "TESTER", "b").await.unwrap();
    for _ in 0..3 {
        store
            .record_interaction(coder, TaskType::Implementation, "build", "r", Some(false), 1.0, None)
            .await
            .unwrap();
        store
            .record_interaction(tester, TaskType::Testing, "verify", "r", Some(true), 1.0, None)
            .await
            .unwrap();
    }
    orchestrator.register_agents_from_store().await.unwrap();

    // The weak performer is refined through the Chief and swapped live.
    let version = orchestrator.refine_agent("Coder").await.unwrap();
    assert_eq!(version, Some(2));
    let current = store.get_current_agent_version(coder).await.unwrap();
    assert_eq!(current.prompt_text, "You write careful code.");
    let runtime = orchestrator.runtime("Coder").unwrap();
    assert_eq!(runtime.lock().await.prompt_text(), "You write careful code.");

    // The strong performer is left alone.
    assert_eq!(orchestrator.refine_agent("Tester").await.unwrap(), None);
    let current = store.get_current_agent_version(tester).await.unwrap();
    assert_eq!(current.version_number, 1);
}

#[tokio::test]
async fn replace_agent_prompt_swaps_the_runtime() {
    let client = ScriptedClient::new();
    let (mut orchestrator, store) = orchestrator_with(client).await;
    store.add_agent("Coder", "code", "OLD", "b").await.unwrap();
    orchestrator.register_agents_from_store().await.unwrap();

    assert!(orchestrator.replace_agent_prompt("Coder", "NEW"));
    let runtime = orchestrator.runtime("coder").unwrap();
    assert_eq!(runtime.lock().await.prompt_text(), "NEW");

    assert!(!orchestrator.replace_agent_prompt("Nobody", "X"));
}
