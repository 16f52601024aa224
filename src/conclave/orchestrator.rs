//! Chief-directed orchestration.
//!
//! The [`Orchestrator`] owns the agent runtimes for a session, parses the
//! Chief's trailing directives, and schedules phase-ordered parallel
//! activations:
//!
//! - Activations are grouped by `phase` in ascending order; phases run
//!   strictly sequentially, activations within one phase run in parallel via
//!   `tokio::spawn`.
//! - Inside a phase, an activation with dependencies waits until every named
//!   agent's activation has completed (success or failure).  Dependency
//!   cycles inside one phase fail the whole block.
//! - A fatal activation lets its phase drain naturally but stops later phases
//!   from starting; the block result is then a partial failure.
//!
//! Completed activations are recorded as interactions in the
//! [`Store`](crate::Store), fed to the [`ResponseCollector`], and folded into
//! the in-memory [`MetricsRegistry`].  While an A/B test runs for an agent,
//! every activation of that agent is routed to one arm of the test: the
//! arm's prompt overrides the runtime's base prompt for that call and the
//! outcome is recorded against the arm.  `refine_agent`, `start_ab_test`,
//! and `conclude_ab_test` drive the feedback loop end to end.
//!
//! The session loop (`run_session`) ticks the Chief conversationally, parses
//! its directive, executes it, and feeds the specialists' replies back as the
//! Chief's next input until a `[FINAL_*]` or `[ACTION_HALT]` block ends the
//! session.

use crate::conclave::agent_runtime::{AgentRuntime, HistoryMode, RuntimeError};
use crate::conclave::collector::ResponseCollector;
use crate::conclave::config::ConclaveConfig;
use crate::conclave::directive::{
    parse_directive, ActivationInfo, Directive, ParseError, TeamActivationInfo,
};
use crate::conclave::metrics::{MetricsRegistry, PerformanceAnalyzer};
use crate::conclave::refinement::{AbArm, AbOutcome, AbTestManager, PromptRefiner, RefineError};
use crate::conclave::store::{Store, StoreError};
use crate::conclave::streaming_client::{ClientError, CompletionClient};
use crate::conclave::task_type::TaskType;
use crate::conclave::wire::ChatMessage;
use async_trait::async_trait;
use std::collections::{BTreeMap, HashMap, HashSet};
use std::error::Error;
use std::fmt;
use std::sync::Arc;
use std::time::{Duration, Instant};
use tokio::sync::watch;
use tokio::sync::Mutex as TokioMutex;
use tokio_util::sync::CancellationToken;

/// Evaluation window for A/B tests unless overridden with
/// [`Orchestrator::with_ab_test_duration`].
const DEFAULT_AB_TEST_DURATION: Duration = Duration::from_secs(60 * 60);

/// External collaborator that relays `[ACTION_ASK_USER]` questions.
#[async_trait]
pub trait UserInputProvider: Send + Sync {
    /// Ask the user and return their answer.
    async fn ask(&self, question: &str) -> Result<String, Box<dyn Error + Send + Sync>>;
}

/// External capability that judges whether a response answered its request.
///
/// `None` means the interaction is recorded unevaluated.
#[async_trait]
pub trait Evaluator: Send + Sync {
    /// Judge one interaction.
    async fn is_correct(&self, agent_name: &str, request: &str, response: &str) -> Option<bool>;
}

/// Errors surfaced by the orchestrator.
#[derive(Debug)]
pub enum OrchestratorError {
    /// An activation names an agent with no registered runtime.
    UnknownAgent(String),
    /// A team directive names a team the store does not know.
    UnknownTeam(String),
    /// Dependencies within one phase form a cycle.
    CycleDetected(String),
    /// The Chief's reply could not be parsed.
    Parse(ParseError),
    /// A store operation failed.
    Storage(StoreError),
    /// A runtime-level failure outside any single activation.
    Runtime(String),
}

impl fmt::Display for OrchestratorError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            OrchestratorError::UnknownAgent(name) => write!(f, "unknown agent: {}", name),
            OrchestratorError::UnknownTeam(name) => write!(f, "unknown team: {}", name),
            OrchestratorError::CycleDetected(names) => {
                write!(f, "dependency cycle within a phase: {}", names)
            }
            OrchestratorError::Parse(e) => write!(f, "directive parse error: {}", e),
            OrchestratorError::Storage(e) => write!(f, "storage error: {}", e),
            OrchestratorError::Runtime(msg) => write!(f, "runtime error: {}", msg),
        }
    }
}

impl Error for OrchestratorError {
    fn source(&self) -> Option<&(dyn Error + 'static)> {
        match self {
            OrchestratorError::Parse(e) => Some(e),
            OrchestratorError::Storage(e) => Some(e),
            _ => None,
        }
    }
}

impl From<StoreError> for OrchestratorError {
    fn from(e: StoreError) -> Self {
        OrchestratorError::Storage(e)
    }
}

/// Per-agent result of one activation.
#[derive(Debug, Clone)]
pub struct ActivationOutcome {
    /// The activated agent.
    pub agent_name: String,
    /// The focus instruction it received.
    pub focus: String,
    /// Whether a response was produced.
    pub success: bool,
    /// The response text, when successful.
    pub response: Option<String>,
    /// The failure description, when not.
    pub error: Option<String>,
    /// Fatal failures stop later phases (unknown agent, disposed runtime,
    /// cancellation).  A plain model failure is not fatal.
    pub fatal: bool,
    /// The A/B arm this activation was routed to, when a test is running
    /// for the agent.
    pub ab_arm: Option<AbArm>,
    /// Wall-clock seconds spent on the activation.
    pub processing_time: f64,
}

/// Aggregate status of a scheduling block.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum BlockStatus {
    /// Every phase ran and every activation succeeded.
    Completed,
    /// At least one activation failed, or later phases were skipped.
    PartialFailure,
}

/// Result of executing one activation block.
#[derive(Debug, Clone)]
pub struct BlockResult {
    pub status: BlockStatus,
    /// Per-agent outcomes in completion order.
    pub outcomes: Vec<ActivationOutcome>,
    /// The collector key the block's responses were filed under.
    pub request_key: String,
}

/// How a session ended.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum SessionEnd {
    /// The Chief produced a `[FINAL_*]` block.
    Final {
        /// The tag suffix after `FINAL_`.
        tag: String,
        /// The block payload.
        payload: String,
    },
    /// The Chief halted, or a session-level fatal error was recorded.
    Halted {
        /// The recorded reason.
        reason: String,
    },
    /// The tick budget ran out before a terminal directive.
    TickLimit,
}

/// Result of a full session run.
#[derive(Debug, Clone)]
pub struct SessionResult {
    pub end: SessionEnd,
    /// Chief ticks consumed.
    pub ticks: usize,
}

/// Coordinates agent runtimes under the Chief's direction.
pub struct Orchestrator {
    store: Arc<Store>,
    client: Arc<dyn CompletionClient>,
    config: ConclaveConfig,
    collector: Arc<ResponseCollector>,
    metrics: Arc<MetricsRegistry>,
    ab_tests: Arc<AbTestManager>,
    evaluator: Option<Arc<dyn Evaluator>>,
    /// Runtimes keyed by lower-cased agent name.
    runtimes: HashMap<String, Arc<TokioMutex<AgentRuntime>>>,
    /// Transcript of the Chief's turns and synthesized specialist replies.
    transcript: Vec<ChatMessage>,
    chief_name: String,
    cancel: CancellationToken,
    /// Stable id distinguishing this session's collector keys and logs.
    session_id: String,
    request_counter: u64,
}

impl Orchestrator {
    /// Create an orchestrator with no registered runtimes.
    pub fn new(
        store: Arc<Store>,
        client: Arc<dyn CompletionClient>,
        config: ConclaveConfig,
    ) -> Self {
        let ab_tests = Arc::new(AbTestManager::new(
            store.clone(),
            config.ab_test_minimum_samples,
            DEFAULT_AB_TEST_DURATION,
        ));
        Orchestrator {
            store,
            client,
            config,
            collector: Arc::new(ResponseCollector::new()),
            metrics: Arc::new(MetricsRegistry::new()),
            ab_tests,
            evaluator: None,
            runtimes: HashMap::new(),
            transcript: Vec::new(),
            chief_name: "Chief".to_string(),
            cancel: CancellationToken::new(),
            session_id: uuid::Uuid::new_v4().to_string(),
            request_counter: 0,
        }
    }

    /// Stable identifier of this orchestration session.
    pub fn session_id(&self) -> &str {
        &self.session_id
    }

    /// Attach a correctness evaluator (builder pattern).
    pub fn with_evaluator(mut self, evaluator: Arc<dyn Evaluator>) -> Self {
        self.evaluator = Some(evaluator);
        self
    }

    /// Override which agent plays the Chief (builder pattern).
    pub fn with_chief(mut self, name: impl Into<String>) -> Self {
        self.chief_name = name.into();
        self
    }

    /// Override the A/B evaluation window (builder pattern).
    ///
    /// Must be called before any test is started; the manager is recreated.
    pub fn with_ab_test_duration(mut self, duration: Duration) -> Self {
        self.ab_tests = Arc::new(AbTestManager::new(
            self.store.clone(),
            self.config.ab_test_minimum_samples,
            duration,
        ));
        self
    }

    /// The response collector the orchestrator files replies into.
    pub fn collector(&self) -> Arc<ResponseCollector> {
        self.collector.clone()
    }

    /// The in-memory metrics registry.
    pub fn metrics(&self) -> Arc<MetricsRegistry> {
        self.metrics.clone()
    }

    /// The A/B test manager whose running tests route activations.
    pub fn ab_tests(&self) -> Arc<AbTestManager> {
        self.ab_tests.clone()
    }

    /// The session transcript so far.
    pub fn transcript(&self) -> &[ChatMessage] {
        &self.transcript
    }

    /// The token that cancels everything this orchestrator spawned.
    pub fn cancellation_token(&self) -> CancellationToken {
        self.cancel.clone()
    }

    /// Request cooperative cancellation of all in-flight activations.
    pub fn cancel(&self) {
        self.cancel.cancel();
    }

    /// Create and register a runtime for an agent name.
    ///
    /// Replaces any existing runtime for the same name (the old one is
    /// disposed implicitly by dropping the registry handle).
    pub fn register_agent(
        &mut self,
        name: &str,
        prompt_text: &str,
    ) -> Arc<TokioMutex<AgentRuntime>> {
        let runtime = Arc::new(TokioMutex::new(AgentRuntime::new(
            name,
            prompt_text,
            self.client.clone(),
            self.config.default_model.clone(),
            self.config.max_tokens,
        )));
        self.runtimes.insert(name.to_lowercase(), runtime.clone());
        runtime
    }

    /// Look up a runtime by name, case-insensitively.
    pub fn runtime(&self, name: &str) -> Option<Arc<TokioMutex<AgentRuntime>>> {
        self.runtimes.get(&name.to_lowercase()).cloned()
    }

    /// Swap an agent's runtime for one carrying a new prompt.
    ///
    /// The swap is atomic from the registry's point of view: lookups either
    /// see the old runtime or the new one, never an agent-less gap.  The new
    /// runtime starts with a fresh history.
    pub fn replace_agent_prompt(&mut self, name: &str, new_prompt: &str) -> bool {
        if !self.runtimes.contains_key(&name.to_lowercase()) {
            return false;
        }
        self.register_agent(name, new_prompt);
        true
    }

    /// Registered agent names, in registry order.
    pub fn agent_names(&self) -> Vec<String> {
        self.runtimes.keys().cloned().collect()
    }

    // ── Scheduling ───────────────────────────────────────────────────────

    /// Execute one activation block per the scheduling contract.
    pub async fn execute_block(
        &mut self,
        activations: Vec<ActivationInfo>,
    ) -> Result<BlockResult, OrchestratorError> {
        // Validate dependency graphs up front: a cycle anywhere fails the
        // whole block before any agent runs.
        let mut phases: BTreeMap<u32, Vec<ActivationInfo>> = BTreeMap::new();
        for activation in activations {
            phases
                .entry(activation.execution_phase)
                .or_default()
                .push(activation);
        }
        for phase_activations in phases.values() {
            if let Some(cycle) = find_phase_cycle(phase_activations) {
                return Err(OrchestratorError::CycleDetected(cycle));
            }
        }

        self.request_counter += 1;
        let request_key = format!("{}-block-{}", self.session_id, self.request_counter);
        let expected: Vec<String> = phases
            .values()
            .flatten()
            .map(|activation| activation.module_name.clone())
            .collect();
        let barrier = self.collector.expect_responses(&request_key, expected);

        let mut outcomes: Vec<ActivationOutcome> = Vec::new();
        let mut aborted = false;

        for (phase, phase_activations) in phases {
            if aborted {
                log::warn!(
                    "Orchestrator: skipping phase {} after a fatal activation",
                    phase
                );
                break;
            }
            log::info!(
                "Orchestrator: phase {} — {} activation(s)",
                phase,
                phase_activations.len()
            );

            // One completion flag per activation in this phase; dependents
            // wait on the flags of their in-phase dependencies.  Earlier
            // phases are complete by construction and cross-block names
            // resolve immediately.
            let mut flags: HashMap<String, watch::Receiver<bool>> = HashMap::new();
            let mut senders: Vec<watch::Sender<bool>> = Vec::new();
            for activation in &phase_activations {
                let (tx, rx) = watch::channel(false);
                // Duplicate activations of one agent share the name slot; a
                // dependent then waits on the last of them.
                flags.insert(activation.module_name.to_lowercase(), rx);
                senders.push(tx);
            }

            let mut handles = Vec::new();
            for (activation, done_tx) in phase_activations.into_iter().zip(senders) {
                let key = activation.module_name.to_lowercase();
                let deps: Vec<watch::Receiver<bool>> = activation
                    .depends_on
                    .iter()
                    .filter_map(|dep| {
                        let dep_key = dep.to_lowercase();
                        if dep_key == key {
                            // Self-dependency would have been caught as a cycle.
                            return None;
                        }
                        flags.get(&dep_key).cloned()
                    })
                    .collect();

                let runtime = self.runtime(&activation.module_name);
                let injected = if activation.history_mode == HistoryMode::SessionAware {
                    Some(self.session_history_slice(activation.session_history_count))
                } else {
                    None
                };
                // A running A/B test claims every interaction of its agent:
                // the routed arm's prompt overrides the runtime's base prompt
                // for this single call.
                let ab = if runtime.is_some() {
                    self.ab_route(&activation.module_name).await
                } else {
                    None
                };
                let cancel = self.cancel.child_token();

                handles.push(tokio::spawn(run_activation(
                    activation,
                    runtime,
                    injected,
                    ab,
                    deps,
                    done_tx,
                    cancel,
                )));
            }

            for handle in handles {
                let outcome = handle.await.map_err(|e| {
                    OrchestratorError::Runtime(format!("activation task join error: {}", e))
                })?;
                if outcome.fatal {
                    aborted = true;
                }
                self.finish_activation(&request_key, &outcome).await;
                outcomes.push(outcome);
            }
        }

        // The barrier fires once every expected agent has been filed; when a
        // phase was skipped the receiver is simply dropped unfired.
        drop(barrier);

        let status = if aborted || outcomes.iter().any(|outcome| !outcome.success) {
            BlockStatus::PartialFailure
        } else {
            BlockStatus::Completed
        };
        Ok(BlockResult {
            status,
            outcomes,
            request_key,
        })
    }

    /// Expand a team directive into one activation per member, Chief first.
    pub async fn expand_team(
        &self,
        team: &TeamActivationInfo,
    ) -> Result<Vec<ActivationInfo>, OrchestratorError> {
        let record = self
            .store
            .find_team_by_name(&team.team_name)
            .await?
            .ok_or_else(|| OrchestratorError::UnknownTeam(team.team_name.clone()))?;
        let members = self.store.team_members(record.id).await?;

        let mut activations = Vec::with_capacity(members.len());
        for member in members {
            let agent = self.store.get_agent(member.agent_id).await?;
            activations.push(ActivationInfo {
                module_name: agent.name,
                focus: team.focus.clone(),
                history_mode: team.history_mode,
                session_history_count: team.session_history_count,
                execution_phase: team.execution_phase,
                depends_on: team.depends_on.clone(),
            });
        }
        Ok(activations)
    }

    /// Pick the A/B arm and prompt for the next interaction of an agent,
    /// when a test is running for it.
    async fn ab_route(&self, agent_name: &str) -> Option<(AbArm, String)> {
        let agent = match self.store.find_agent_by_name(agent_name).await {
            Ok(Some(agent)) => agent,
            Ok(None) => return None,
            Err(e) => {
                log::warn!("Orchestrator: A/B lookup failed for '{}': {}", agent_name, e);
                return None;
            }
        };
        let arm = self.ab_tests.route(agent.id)?;
        match self.ab_tests.prompt_for(agent.id, arm).await {
            Ok(prompt) => Some((arm, prompt)),
            Err(e) => {
                log::warn!(
                    "Orchestrator: A/B prompt lookup failed for '{}': {}",
                    agent_name,
                    e
                );
                None
            }
        }
    }

    /// Record an outcome durably and feed the collector, metrics, and any
    /// running A/B test.
    async fn finish_activation(&self, request_key: &str, outcome: &ActivationOutcome) {
        let reply_text = outcome
            .response
            .clone()
            .or_else(|| outcome.error.clone())
            .unwrap_or_default();
        self.collector
            .add_response(request_key, &outcome.agent_name, &reply_text);
        self.metrics
            .record_request(&outcome.agent_name, outcome.success, outcome.processing_time);

        // A failed run is still an interaction: recorded with is_correct
        // false, never silently dropped.
        let is_correct = if !outcome.success {
            Some(false)
        } else {
            match &self.evaluator {
                Some(evaluator) => {
                    evaluator
                        .is_correct(&outcome.agent_name, &outcome.focus, &reply_text)
                        .await
                }
                None => None,
            }
        };
        match self.store.find_agent_by_name(&outcome.agent_name).await {
            Ok(Some(agent)) => {
                if let Some(arm) = outcome.ab_arm {
                    self.ab_tests.record(agent.id, arm, outcome.success);
                }
                let result = self
                    .store
                    .record_interaction(
                        agent.id,
                        TaskType::classify(&outcome.focus),
                        &outcome.focus,
                        &reply_text,
                        is_correct,
                        outcome.processing_time,
                        outcome.error.as_deref(),
                    )
                    .await;
                if let Err(e) = result {
                    log::error!(
                        "Orchestrator: failed to record interaction for '{}': {}",
                        outcome.agent_name,
                        e
                    );
                }
            }
            Ok(None) => {
                log::warn!(
                    "Orchestrator: agent '{}' has no store record; interaction not persisted",
                    outcome.agent_name
                );
            }
            Err(e) => {
                log::error!(
                    "Orchestrator: store lookup failed for '{}': {}",
                    outcome.agent_name,
                    e
                );
            }
        }
    }

    /// The last `count` transcript messages, additionally capped by the
    /// configured session-history maximum.
    pub fn session_history_slice(&self, count: usize) -> Vec<ChatMessage> {
        let count = count.min(self.config.max_session_history_count);
        let start = self.transcript.len().saturating_sub(count);
        self.transcript[start..].to_vec()
    }

    // ── Session loop ─────────────────────────────────────────────────────

    /// Drive a full session for a user goal.
    ///
    /// Each tick submits the pending input to the Chief (conversationally),
    /// parses the trailing directive of its reply, and executes it.  Parse
    /// failures are reported back to the Chief as a correction prompt on the
    /// next tick.  The session ends on a `[FINAL_*]` block, an
    /// `[ACTION_HALT]`, a session-level fatal error (recorded as a halt
    /// reason), or after `max_ticks` Chief turns.
    pub async fn run_session(
        &mut self,
        goal: &str,
        max_ticks: usize,
        input_provider: Option<Arc<dyn UserInputProvider>>,
    ) -> Result<SessionResult, OrchestratorError> {
        let chief_name = self.chief_name.clone();
        let chief = self
            .runtime(&chief_name)
            .ok_or_else(|| OrchestratorError::UnknownAgent(chief_name.clone()))?;

        let mut next_input = goal.to_string();
        for tick in 1..=max_ticks {
            log::info!("Orchestrator: session tick {}/{}", tick, max_ticks);
            self.transcript.push(ChatMessage::user(next_input.clone()));

            let cancel = self.cancel.child_token();
            let started = Instant::now();
            let reply = {
                let mut chief_runtime = chief.lock().await;
                chief_runtime
                    .request(&next_input, HistoryMode::Conversational, None, &cancel)
                    .await
            };
            let elapsed = started.elapsed().as_secs_f64();
            let reply = match reply {
                Ok(reply) => reply,
                Err(RuntimeError::Client(ClientError::Cancelled)) => {
                    return Ok(SessionResult {
                        end: SessionEnd::Halted {
                            reason: "session cancelled".to_string(),
                        },
                        ticks: tick,
                    });
                }
                Err(e) => {
                    log::error!("Orchestrator: chief turn failed: {}", e);
                    return Ok(SessionResult {
                        end: SessionEnd::Halted {
                            reason: format!("chief turn failed: {}", e),
                        },
                        ticks: tick,
                    });
                }
            };
            self.transcript.push(ChatMessage::assistant(reply.clone()));
            self.metrics.record_request(&chief_name, true, elapsed);

            let directive = match parse_directive(&reply) {
                Ok(directive) => directive,
                Err(e) => {
                    log::warn!("Orchestrator: unparseable chief reply: {}", e);
                    next_input = format!(
                        "Your previous reply could not be interpreted ({}). Reply again, \
                         ending with exactly one directive block and nothing after it.",
                        e
                    );
                    continue;
                }
            };

            match directive {
                Directive::Activations(activations) => {
                    next_input = self.run_block_for_session(activations).await;
                }
                Directive::ActivateTeam(team) => match self.expand_team(&team).await {
                    Ok(activations) => {
                        next_input = self.run_block_for_session(activations).await;
                    }
                    Err(e) => {
                        log::warn!("Orchestrator: team expansion failed: {}", e);
                        next_input = format!(
                            "The team activation could not be executed ({}). \
                             Choose a known team or activate agents directly.",
                            e
                        );
                    }
                },
                Directive::RequestAgentCreation(request) => {
                    next_input = match self.create_agent(&request).await {
                        Ok(()) => format!(
                            "Agent '{}' was created and is available for activation.",
                            request.name
                        ),
                        Err(e) => {
                            log::warn!("Orchestrator: agent creation failed: {}", e);
                            format!("Agent creation failed ({}).", e)
                        }
                    };
                }
                Directive::AskUser(question) => match &input_provider {
                    Some(provider) => match provider.ask(&question).await {
                        Ok(answer) => next_input = answer,
                        Err(e) => {
                            return Ok(SessionResult {
                                end: SessionEnd::Halted {
                                    reason: format!("user input failed: {}", e),
                                },
                                ticks: tick,
                            });
                        }
                    },
                    None => {
                        return Ok(SessionResult {
                            end: SessionEnd::Halted {
                                reason: "the Chief asked the user but no input collaborator \
                                         is attached"
                                    .to_string(),
                            },
                            ticks: tick,
                        });
                    }
                },
                Directive::Final { tag, payload } => {
                    return Ok(SessionResult {
                        end: SessionEnd::Final { tag, payload },
                        ticks: tick,
                    });
                }
                Directive::Halt(reason) => {
                    return Ok(SessionResult {
                        end: SessionEnd::Halted { reason },
                        ticks: tick,
                    });
                }
            }
        }
        Ok(SessionResult {
            end: SessionEnd::TickLimit,
            ticks: max_ticks,
        })
    }

    /// Execute a block and format the specialists' replies as the Chief's
    /// next input.  Scheduling errors become correction prompts.
    async fn run_block_for_session(&mut self, activations: Vec<ActivationInfo>) -> String {
        match self.execute_block(activations).await {
            Ok(result) => format_block_replies(&result),
            Err(e) => {
                log::warn!("Orchestrator: block execution failed: {}", e);
                format!(
                    "The activation block could not be scheduled ({}). \
                     Issue a corrected directive.",
                    e
                )
            }
        }
    }

    /// Perform a `[REQUEST_AGENT_CREATION]` directive: persist the agent and
    /// its capabilities, then register a runtime for it.
    async fn create_agent(
        &mut self,
        request: &crate::conclave::directive::AgentCreationRequest,
    ) -> Result<(), OrchestratorError> {
        let agent_id = self
            .store
            .add_agent(&request.name, &request.purpose, &request.prompt, "chief")
            .await?;
        for capability in &request.capabilities {
            // Chief-declared capabilities start at a neutral rating.
            if let Err(e) = self
                .store
                .add_capability(agent_id, capability, None, 0.5)
                .await
            {
                log::warn!(
                    "Orchestrator: capability '{}' for agent '{}' not stored: {}",
                    capability,
                    request.name,
                    e
                );
            }
        }
        self.register_agent(&request.name, &request.prompt);
        Ok(())
    }

    /// Register runtimes for every active agent in the store, using each
    /// agent's active prompt version.
    pub async fn register_agents_from_store(&mut self) -> Result<usize, OrchestratorError> {
        let agents = self.store.list_agents(true).await?;
        let mut registered = 0;
        for agent in agents {
            match self.store.get_current_agent_version(agent.id).await {
                Ok(version) => {
                    self.register_agent(&agent.name, &version.prompt_text);
                    registered += 1;
                }
                Err(e) => {
                    log::warn!(
                        "Orchestrator: agent '{}' skipped, no active version: {}",
                        agent.name,
                        e
                    );
                }
            }
        }
        Ok(registered)
    }

    // ── Refinement & A/B drivers ─────────────────────────────────────────

    /// Start an A/B test for an agent.
    ///
    /// The challenger is persisted as a new active version and every
    /// subsequent activation of the agent is routed to one arm or the other
    /// by [`execute_block`](Orchestrator::execute_block) until the test is
    /// concluded.
    pub async fn start_ab_test(
        &mut self,
        agent_name: &str,
        alternate_prompt: &str,
        reason: &str,
    ) -> Result<(), OrchestratorError> {
        let agent = self.agent_by_name(agent_name).await?;
        self.ab_tests
            .start(agent.id, alternate_prompt, reason)
            .await?;
        Ok(())
    }

    /// Conclude an agent's A/B test and swap the live runtime to whichever
    /// prompt version ended up active (the promoted challenger, or the
    /// reverted incumbent).
    pub async fn conclude_ab_test(
        &mut self,
        agent_name: &str,
    ) -> Result<AbOutcome, OrchestratorError> {
        let agent = self.agent_by_name(agent_name).await?;
        let outcome = self.ab_tests.conclude(agent.id).await?;
        let current = self.store.get_current_agent_version(agent.id).await?;
        self.replace_agent_prompt(&agent.name, &current.prompt_text);
        Ok(outcome)
    }

    /// Run the full refinement pipeline for an agent: analyze its stored
    /// performance, ask the refining agent for an improved prompt, persist
    /// it as a new version, and swap the live runtime to it.
    ///
    /// A dedicated `PromptEngineer` refines when one is registered,
    /// otherwise the Chief does.  Returns `Ok(None)` when the agent already
    /// performs at or above `prompt_refinement_threshold`; otherwise the new
    /// version number.
    pub async fn refine_agent(
        &mut self,
        agent_name: &str,
    ) -> Result<Option<i64>, OrchestratorError> {
        let agent = self.agent_by_name(agent_name).await?;
        let analyzer = PerformanceAnalyzer::new(
            self.store.clone(),
            self.config.strong_performance_threshold,
            self.config.weak_performance_threshold,
        );
        let analysis = analyzer.analyze(agent.id).await?;
        if !analysis.needs_refinement(self.config.prompt_refinement_threshold) {
            log::debug!(
                "Orchestrator: agent '{}' performs above the refinement threshold",
                agent_name
            );
            return Ok(None);
        }

        let refining_runtime = self
            .runtime("PromptEngineer")
            .or_else(|| self.runtime(&self.chief_name))
            .ok_or_else(|| OrchestratorError::UnknownAgent(self.chief_name.clone()))?;
        let refiner = PromptRefiner::new(
            self.store.clone(),
            Duration::from_secs(self.config.request_timeout_seconds),
        );
        let cancel = self.cancel.child_token();
        let version_number = refiner
            .refine(agent.id, &analysis, refining_runtime, &cancel)
            .await
            .map_err(|e| match e {
                RefineError::Storage(e) => OrchestratorError::Storage(e),
                other => OrchestratorError::Runtime(other.to_string()),
            })?;

        let current = self.store.get_current_agent_version(agent.id).await?;
        self.replace_agent_prompt(&agent.name, &current.prompt_text);
        Ok(Some(version_number))
    }

    /// Resolve an agent's store row by name or fail with `UnknownAgent`.
    async fn agent_by_name(
        &self,
        agent_name: &str,
    ) -> Result<crate::conclave::store::AgentRecord, OrchestratorError> {
        self.store
            .find_agent_by_name(agent_name)
            .await?
            .ok_or_else(|| OrchestratorError::UnknownAgent(agent_name.to_string()))
    }
}

/// Format per-agent outcomes as the Chief's next user input.
fn format_block_replies(result: &BlockResult) -> String {
    let mut formatted = String::new();
    for outcome in &result.outcomes {
        let text = match (&outcome.response, &outcome.error) {
            (Some(response), _) => response.clone(),
            (None, Some(error)) => format!("(activation failed: {})", error),
            (None, None) => String::new(),
        };
        formatted.push_str(&format!(
            "[AGENT]{}[/AGENT][RESPONSE]{}[/RESPONSE]\n",
            outcome.agent_name, text
        ));
    }
    formatted
}

/// One spawned activation: wait for in-phase dependencies, run the agent
/// (on the routed A/B prompt when a test is running), then flip the
/// completion flag whatever the outcome.
async fn run_activation(
    activation: ActivationInfo,
    runtime: Option<Arc<TokioMutex<AgentRuntime>>>,
    injected: Option<Vec<ChatMessage>>,
    ab: Option<(AbArm, String)>,
    deps: Vec<watch::Receiver<bool>>,
    done_tx: watch::Sender<bool>,
    cancel: CancellationToken,
) -> ActivationOutcome {
    for mut dep in deps {
        // A closed sender means the dependency task is gone; treat it as
        // completed rather than deadlocking the phase.
        let _ = dep.wait_for(|done| *done).await;
    }

    let (ab_arm, prompt_override) = match ab {
        Some((arm, prompt)) => (Some(arm), Some(prompt)),
        None => (None, None),
    };

    let started = Instant::now();
    let outcome = match runtime {
        None => ActivationOutcome {
            agent_name: activation.module_name.clone(),
            focus: activation.focus.clone(),
            success: false,
            response: None,
            error: Some("no runtime registered for this agent".to_string()),
            fatal: true,
            ab_arm: None,
            processing_time: 0.0,
        },
        Some(runtime) => {
            let mut guard = runtime.lock().await;
            let result = guard
                .request_with_prompt(
                    &activation.focus,
                    activation.history_mode,
                    injected.as_deref(),
                    prompt_override.as_deref(),
                    &cancel,
                )
                .await;
            let processing_time = started.elapsed().as_secs_f64();
            match result {
                Ok(response) => ActivationOutcome {
                    agent_name: activation.module_name.clone(),
                    focus: activation.focus.clone(),
                    success: true,
                    response: Some(response),
                    error: None,
                    fatal: false,
                    ab_arm,
                    processing_time,
                },
                Err(e) => {
                    let fatal = matches!(
                        e,
                        RuntimeError::Disposed
                            | RuntimeError::Client(ClientError::Cancelled)
                    );
                    ActivationOutcome {
                        agent_name: activation.module_name.clone(),
                        focus: activation.focus.clone(),
                        success: false,
                        response: None,
                        error: Some(e.to_string()),
                        fatal,
                        ab_arm,
                        processing_time,
                    }
                }
            }
        }
    };
    let _ = done_tx.send(true);
    outcome
}

/// Kahn's algorithm over the in-phase dependency edges.  Returns the names
/// stuck in a cycle, or `None` when the phase is schedulable.
fn find_phase_cycle(activations: &[ActivationInfo]) -> Option<String> {
    let names: HashSet<String> = activations
        .iter()
        .map(|activation| activation.module_name.to_lowercase())
        .collect();

    let mut indegree: HashMap<String, usize> = names.iter().map(|name| (name.clone(), 0)).collect();
    let mut edges: HashMap<String, Vec<String>> = HashMap::new();
    for activation in activations {
        let to = activation.module_name.to_lowercase();
        for dep in &activation.depends_on {
            let from = dep.to_lowercase();
            if from == to {
                return Some(activation.module_name.clone());
            }
            if names.contains(&from) {
                edges.entry(from).or_default().push(to.clone());
                *indegree.get_mut(&to).unwrap() += 1;
            }
        }
    }

    let mut ready: Vec<String> = indegree
        .iter()
        .filter(|(_, degree)| **degree == 0)
        .map(|(name, _)| name.clone())
        .collect();
    let mut processed = 0;
    while let Some(name) = ready.pop() {
        processed += 1;
        if let Some(next) = edges.get(&name) {
            for to in next.clone() {
                let degree = indegree.get_mut(&to).unwrap();
                *degree -= 1;
                if *degree == 0 {
                    ready.push(to);
                }
            }
        }
    }
    if processed == names.len() {
        None
    } else {
        let stuck: Vec<String> = indegree
            .into_iter()
            .filter(|(_, degree)| *degree > 0)
            .map(|(name, _)| name)
            .collect();
        Some(stuck.join(", "))
    }
}
