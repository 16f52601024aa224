//! Prompt refinement and A/B testing.
//!
//! The feedback half of the runtime: [`PromptRefiner`] turns a performance
//! analysis into a candidate prompt by asking a refining agent (the Chief, or
//! a dedicated prompt engineer when one exists) and persisting the suggestion
//! as a new active version.  [`AbTestManager`] evaluates an alternate prompt
//! against the incumbent with a fair traffic split and promotes or reverts it
//! once enough samples accumulate.
//!
//! Both are driven by the orchestrator: `Orchestrator::refine_agent` chains
//! analysis → refinement → live runtime swap, and `Orchestrator`'s scheduler
//! routes every activation of a tested agent to one arm, records the outcome,
//! and swaps the runtime when `conclude_ab_test` settles the test.

use crate::conclave::agent_runtime::{AgentRuntime, HistoryMode, RuntimeError};
use crate::conclave::metrics::{AgentAnalysis, PerformanceClass};
use crate::conclave::store::{Store, StoreError};
use chrono::{DateTime, Utc};
use std::collections::HashMap;
use std::error::Error;
use std::fmt;
use std::sync::Arc;
use std::sync::Mutex;
use std::time::Duration;
use tokio_util::sync::CancellationToken;

/// Tag wrapping each suggestion in the refining agent's reply.
const SUGGESTION_OPEN: &str = "[SUGGESTION]";
const SUGGESTION_CLOSE: &str = "[/SUGGESTION]";

/// Errors from the refinement flow.
#[derive(Debug)]
pub enum RefineError {
    /// The refining agent did not answer within the time budget.
    Timeout,
    /// The refining agent's run failed.
    Runtime(RuntimeError),
    /// Persisting the refined prompt failed.
    Storage(StoreError),
    /// The reply contained no usable suggestion.
    EmptySuggestion,
}

impl fmt::Display for RefineError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            RefineError::Timeout => write!(f, "refinement timed out awaiting the model"),
            RefineError::Runtime(e) => write!(f, "refinement run failed: {}", e),
            RefineError::Storage(e) => write!(f, "refinement storage failed: {}", e),
            RefineError::EmptySuggestion => write!(f, "refinement produced no suggestion"),
        }
    }
}

impl Error for RefineError {
    fn source(&self) -> Option<&(dyn Error + 'static)> {
        match self {
            RefineError::Runtime(e) => Some(e),
            RefineError::Storage(e) => Some(e),
            _ => None,
        }
    }
}

/// Extract `[SUGGESTION]…[/SUGGESTION]` bodies from a reply, falling back to
/// the whole trimmed text when no tags are present.
pub fn extract_suggestions(text: &str) -> Vec<String> {
    let mut suggestions = Vec::new();
    let mut cursor = 0;
    while let Some(open) = text[cursor..].find(SUGGESTION_OPEN) {
        let start = cursor + open + SUGGESTION_OPEN.len();
        match text[start..].find(SUGGESTION_CLOSE) {
            Some(close) => {
                let body = text[start..start + close].trim();
                if !body.is_empty() {
                    suggestions.push(body.to_string());
                }
                cursor = start + close + SUGGESTION_CLOSE.len();
            }
            None => break,
        }
    }
    if suggestions.is_empty() {
        let trimmed = text.trim();
        if !trimmed.is_empty() {
            suggestions.push(trimmed.to_string());
        }
    }
    suggestions
}

/// Build the meta-prompt embedding the current prompt and analysis summary.
pub fn build_meta_prompt(current_prompt: &str, analysis: &AgentAnalysis) -> String {
    let mut prompt = String::new();
    prompt.push_str(&format!(
        "You are improving the system prompt of the agent \"{}\".\n\n",
        analysis.agent_name
    ));
    prompt.push_str("Current prompt:\n---\n");
    prompt.push_str(current_prompt);
    prompt.push_str("\n---\n\n");
    prompt.push_str(&format!(
        "Measured overall success rate: {:.1}%\n",
        analysis.overall_success_rate * 100.0
    ));
    for rate in &analysis.task_rates {
        let label = match rate.class {
            PerformanceClass::Strong => "strong",
            PerformanceClass::Weak => "weak",
            PerformanceClass::Neutral => "neutral",
        };
        prompt.push_str(&format!(
            "- {}: {}/{} correct ({:.1}%, {})\n",
            rate.task_type,
            rate.correct,
            rate.attempts,
            rate.rate * 100.0,
            label
        ));
    }
    if !analysis.capabilities.is_empty() {
        prompt.push_str("\nDeclared capabilities:\n");
        for capability in &analysis.capabilities {
            prompt.push_str(&format!(
                "- {} (rating {:.2})\n",
                capability.name, capability.rating
            ));
        }
    }
    prompt.push_str(
        "\nRewrite the prompt to shore up the weak task types without losing \
         the strong ones. Reply with the complete replacement prompt inside \
         [SUGGESTION]...[/SUGGESTION] tags.",
    );
    prompt
}

/// Metrics-driven prompt refinement.
pub struct PromptRefiner {
    store: Arc<Store>,
    timeout: Duration,
}

impl PromptRefiner {
    /// Create a refiner with the given await budget for the model reply.
    pub fn new(store: Arc<Store>, timeout: Duration) -> Self {
        PromptRefiner { store, timeout }
    }

    /// Ask `refining_runtime` for an improved prompt and persist it as a new
    /// active version.  Returns the new version number.
    ///
    /// The reply is awaited for real (one-shot request with a timeout); the
    /// refining runtime converses in its own persistent history so repeated
    /// refinements build on earlier exchanges.  The caller swaps the target
    /// agent's runtime to the new prompt — in production that caller is
    /// `Orchestrator::refine_agent`, which performs the swap atomically.
    pub async fn refine(
        &self,
        agent_id: i64,
        analysis: &AgentAnalysis,
        refining_runtime: Arc<tokio::sync::Mutex<AgentRuntime>>,
        cancel: &CancellationToken,
    ) -> Result<i64, RefineError> {
        let current = self
            .store
            .get_current_agent_version(agent_id)
            .await
            .map_err(RefineError::Storage)?;

        let meta_prompt = build_meta_prompt(&current.prompt_text, analysis);
        let reply = {
            let mut runtime = refining_runtime.lock().await;
            match tokio::time::timeout(
                self.timeout,
                runtime.request(&meta_prompt, HistoryMode::Conversational, None, cancel),
            )
            .await
            {
                Err(_) => return Err(RefineError::Timeout),
                Ok(Err(e)) => return Err(RefineError::Runtime(e)),
                Ok(Ok(reply)) => reply,
            }
        };

        let suggestion = extract_suggestions(&reply)
            .into_iter()
            .next()
            .ok_or(RefineError::EmptySuggestion)?;

        let weak = analysis.weak_task_types().join(", ");
        let change_summary = if weak.is_empty() {
            "general refinement".to_string()
        } else {
            format!("targets weak task types: {}", weak)
        };
        let version_number = self
            .store
            .add_agent_version(
                agent_id,
                &suggestion,
                "performance-driven refinement",
                &change_summary,
                "refiner",
                analysis.overall_success_rate,
            )
            .await
            .map_err(RefineError::Storage)?;
        log::info!(
            "Refiner: agent {} now at version {} (success rate was {:.2})",
            agent_id,
            version_number,
            analysis.overall_success_rate
        );
        Ok(version_number)
    }
}

/// Which prompt a routed interaction should use.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum AbArm {
    /// The incumbent prompt.
    A,
    /// The challenger prompt.
    B,
}

/// Outcome of concluding an A/B test.
#[derive(Debug, Clone)]
pub struct AbOutcome {
    /// Whether the challenger was kept.
    pub promoted: bool,
    pub rate_a: f64,
    pub rate_b: f64,
    /// Arm sample counts at conclusion.
    pub total_a: u64,
    pub total_b: u64,
}

/// State of one running A/B test.
#[derive(Debug, Clone)]
pub struct AbTest {
    pub agent_id: i64,
    /// Version id of the incumbent prompt.
    pub version_a: i64,
    /// Version id of the challenger prompt (currently active).
    pub version_b: i64,
    prompt_a: String,
    successful_a: u64,
    total_a: u64,
    successful_b: u64,
    total_b: u64,
    counter: u64,
    pub started_at: DateTime<Utc>,
    pub duration: Duration,
}

impl AbTest {
    /// Fair split: alternate arms on a per-request counter bit.
    fn route(&mut self) -> AbArm {
        let arm = if self.counter % 2 == 0 { AbArm::A } else { AbArm::B };
        self.counter += 1;
        arm
    }

    fn record(&mut self, arm: AbArm, success: bool) {
        match arm {
            AbArm::A => {
                self.total_a += 1;
                if success {
                    self.successful_a += 1;
                }
            }
            AbArm::B => {
                self.total_b += 1;
                if success {
                    self.successful_b += 1;
                }
            }
        }
    }

    fn rate(successful: u64, total: u64) -> f64 {
        if total == 0 {
            0.0
        } else {
            successful as f64 / total as f64
        }
    }

    /// Whether the configured wall-clock window has elapsed.
    pub fn expired(&self, now: DateTime<Utc>) -> bool {
        now.signed_duration_since(self.started_at).to_std().map_or(false, |age| age >= self.duration)
    }

    /// The promotion rule: both arms sampled at least `minimum_samples`
    /// times and the challenger beats the incumbent by more than 5%.
    fn challenger_wins(&self, minimum_samples: u64) -> bool {
        self.total_a >= minimum_samples
            && self.total_b >= minimum_samples
            && Self::rate(self.successful_b, self.total_b)
                > Self::rate(self.successful_a, self.total_a) * 1.05
    }
}

/// Owns all running A/B tests, keyed by agent id.
pub struct AbTestManager {
    store: Arc<Store>,
    tests: Mutex<HashMap<i64, AbTest>>,
    minimum_samples: u64,
    duration: Duration,
}

impl AbTestManager {
    /// Create a manager.  `minimum_samples` is the per-arm floor before a
    /// promotion may happen; `duration` is the evaluation window.
    pub fn new(store: Arc<Store>, minimum_samples: u64, duration: Duration) -> Self {
        AbTestManager {
            store,
            tests: Mutex::new(HashMap::new()),
            minimum_samples,
            duration,
        }
    }

    /// Start a test: persist the challenger as a new active version and begin
    /// splitting traffic.  Fails with [`StoreError::InvalidState`] when a
    /// test is already running for the agent.
    pub async fn start(
        &self,
        agent_id: i64,
        alternate_prompt: &str,
        reason: &str,
    ) -> Result<(), StoreError> {
        {
            let tests = self.tests.lock().unwrap();
            if tests.contains_key(&agent_id) {
                return Err(StoreError::InvalidState(format!(
                    "agent {} already has a running A/B test",
                    agent_id
                )));
            }
        }
        let incumbent = self.store.get_current_agent_version(agent_id).await?;
        self.store
            .add_agent_version(
                agent_id,
                alternate_prompt,
                reason,
                "A/B challenger",
                "ab-test",
                incumbent.performance_score,
            )
            .await?;
        let challenger = self.store.get_current_agent_version(agent_id).await?;

        let test = AbTest {
            agent_id,
            version_a: incumbent.id,
            version_b: challenger.id,
            prompt_a: incumbent.prompt_text,
            successful_a: 0,
            total_a: 0,
            successful_b: 0,
            total_b: 0,
            counter: 0,
            started_at: Utc::now(),
            duration: self.duration,
        };
        self.tests.lock().unwrap().insert(agent_id, test);
        log::info!("AbTest: started for agent {}", agent_id);
        Ok(())
    }

    /// Route the next interaction for an agent, if a test is running.
    pub fn route(&self, agent_id: i64) -> Option<AbArm> {
        self.tests
            .lock()
            .unwrap()
            .get_mut(&agent_id)
            .map(AbTest::route)
    }

    /// The prompt text the routed arm should use, if a test is running.
    pub async fn prompt_for(&self, agent_id: i64, arm: AbArm) -> Result<String, StoreError> {
        let version_id = {
            let tests = self.tests.lock().unwrap();
            let test = tests.get(&agent_id).ok_or_else(|| {
                StoreError::NotFound(format!("A/B test for agent {}", agent_id))
            })?;
            match arm {
                AbArm::A => test.version_a,
                AbArm::B => test.version_b,
            }
        };
        Ok(self.store.get_version(version_id).await?.prompt_text)
    }

    /// Record an interaction outcome against an arm.
    pub fn record(&self, agent_id: i64, arm: AbArm, success: bool) {
        if let Some(test) = self.tests.lock().unwrap().get_mut(&agent_id) {
            test.record(arm, success);
        }
    }

    /// Whether the agent's test (if any) has outlived its window.
    pub fn is_expired(&self, agent_id: i64) -> bool {
        self.tests
            .lock()
            .unwrap()
            .get(&agent_id)
            .map_or(false, |test| test.expired(Utc::now()))
    }

    /// Conclude an agent's test: promote the challenger when the rule holds,
    /// otherwise revert by superseding with the incumbent's prompt.  Final
    /// rates are written to both version rows.
    pub async fn conclude(&self, agent_id: i64) -> Result<AbOutcome, StoreError> {
        let test = self
            .tests
            .lock()
            .unwrap()
            .remove(&agent_id)
            .ok_or_else(|| StoreError::NotFound(format!("A/B test for agent {}", agent_id)))?;

        let rate_a = AbTest::rate(test.successful_a, test.total_a);
        let rate_b = AbTest::rate(test.successful_b, test.total_b);
        let promoted = test.challenger_wins(self.minimum_samples);

        if !promoted {
            // Revert: the incumbent's prompt comes back as a fresh version so
            // the full history is retained.
            self.store
                .add_agent_version(
                    agent_id,
                    &test.prompt_a,
                    "A/B test revert",
                    "challenger did not beat the incumbent",
                    "ab-test",
                    rate_b,
                )
                .await?;
        }
        self.store
            .set_version_performance_score(test.version_a, rate_a)
            .await?;
        self.store
            .set_version_performance_score(test.version_b, rate_b)
            .await?;

        log::info!(
            "AbTest: agent {} concluded — A {:.2} ({} samples), B {:.2} ({} samples), promoted={}",
            agent_id,
            rate_a,
            test.total_a,
            rate_b,
            test.total_b,
            promoted
        );
        Ok(AbOutcome {
            promoted,
            rate_a,
            rate_b,
            total_a: test.total_a,
            total_b: test.total_b,
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn suggestions_are_extracted_in_order() {
        let reply = "Thinking...\n[SUGGESTION]First prompt[/SUGGESTION]\n\
                     maybe also\n[SUGGESTION]Second prompt[/SUGGESTION]";
        assert_eq!(
            extract_suggestions(reply),
            vec!["First prompt".to_string(), "Second prompt".to_string()]
        );
    }

    #[test]
    fn raw_text_is_the_fallback_suggestion() {
        assert_eq!(
            extract_suggestions("  just a prompt  "),
            vec!["just a prompt".to_string()]
        );
        assert!(extract_suggestions("   ").is_empty());
    }

    #[test]
    fn routing_alternates_fairly() {
        let mut test = AbTest {
            agent_id: 1,
            version_a: 1,
            version_b: 2,
            prompt_a: String::new(),
            successful_a: 0,
            total_a: 0,
            successful_b: 0,
            total_b: 0,
            counter: 0,
            started_at: Utc::now(),
            duration: Duration::from_secs(60),
        };
        let arms: Vec<AbArm> = (0..6).map(|_| test.route()).collect();
        assert_eq!(arms.iter().filter(|arm| **arm == AbArm::A).count(), 3);
        assert_eq!(arms.iter().filter(|arm| **arm == AbArm::B).count(), 3);
    }

    #[test]
    fn challenger_needs_samples_and_margin() {
        let mut test = AbTest {
            agent_id: 1,
            version_a: 1,
            version_b: 2,
            prompt_a: String::new(),
            successful_a: 7,
            total_a: 10,
            successful_b: 9,
            total_b: 10,
            counter: 0,
            started_at: Utc::now(),
            duration: Duration::from_secs(60),
        };
        assert!(test.challenger_wins(10));

        // Equal rates fail the 5% margin.
        test.successful_a = 9;
        assert!(!test.challenger_wins(10));

        // Too few samples on one arm blocks promotion regardless of rate.
        test.successful_a = 0;
        test.total_a = 5;
        assert!(!test.challenger_wins(10));
    }
}
