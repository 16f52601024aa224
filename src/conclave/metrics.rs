//! Running performance aggregates and analysis.
//!
//! The [`MetricsRegistry`] keeps in-memory per-agent aggregates: request
//! counts, a running response-time mean, and four running quality scores
//! whose mean is the agent's effectiveness.  The [`PerformanceAnalyzer`]
//! reads the durable [`Store`](crate::Store) aggregates and classifies task
//! types and capabilities as strong, weak, or neutral against configured
//! thresholds — the input to prompt refinement.

use crate::conclave::store::{Store, StoreError};
use std::collections::HashMap;
use std::sync::Arc;
use std::sync::Mutex;

/// A numerically stable running mean: `new = (old·(n−1) + sample) / n`.
#[derive(Debug, Clone, Copy, Default, PartialEq)]
pub struct RunningMean {
    mean: f64,
    samples: u64,
}

impl RunningMean {
    /// Fold one sample into the mean.
    pub fn record(&mut self, sample: f64) {
        self.samples += 1;
        self.mean = (self.mean * (self.samples - 1) as f64 + sample) / self.samples as f64;
    }

    /// The current mean, 0 before any samples.
    pub fn mean(&self) -> f64 {
        self.mean
    }

    /// How many samples were folded in.
    pub fn samples(&self) -> u64 {
        self.samples
    }
}

/// Which running quality score a sample feeds.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum QualityDimension {
    Relevance,
    Creativity,
    Accuracy,
    Consensus,
}

/// Per-agent in-memory aggregates.
#[derive(Debug, Clone, Default)]
pub struct AgentAggregates {
    /// Requests observed, successful or not.
    pub total_requests: u64,
    /// Requests that produced a response.
    pub successful: u64,
    /// Requests that failed.
    pub failed: u64,
    /// Running mean of response wall-clock time.
    pub response_time_seconds: RunningMean,
    /// Running quality scores.
    pub relevance: RunningMean,
    pub creativity: RunningMean,
    pub accuracy: RunningMean,
    pub consensus: RunningMean,
}

impl AgentAggregates {
    /// Mean of the four quality means.
    pub fn effectiveness(&self) -> f64 {
        (self.relevance.mean()
            + self.creativity.mean()
            + self.accuracy.mean()
            + self.consensus.mean())
            / 4.0
    }
}

/// Thread-safe registry of per-agent aggregates, keyed by agent name.
pub struct MetricsRegistry {
    agents: Mutex<HashMap<String, AgentAggregates>>,
}

impl MetricsRegistry {
    /// Create an empty registry.
    pub fn new() -> Self {
        MetricsRegistry {
            agents: Mutex::new(HashMap::new()),
        }
    }

    /// Record one request outcome with its wall-clock duration.
    pub fn record_request(&self, agent_name: &str, success: bool, response_time_seconds: f64) {
        let mut agents = self.agents.lock().unwrap();
        let aggregates = agents.entry(agent_name.to_string()).or_default();
        aggregates.total_requests += 1;
        if success {
            aggregates.successful += 1;
        } else {
            aggregates.failed += 1;
        }
        aggregates.response_time_seconds.record(response_time_seconds);
    }

    /// Fold one quality sample into the named dimension.
    pub fn record_quality(&self, agent_name: &str, dimension: QualityDimension, sample: f64) {
        let mut agents = self.agents.lock().unwrap();
        let aggregates = agents.entry(agent_name.to_string()).or_default();
        let target = match dimension {
            QualityDimension::Relevance => &mut aggregates.relevance,
            QualityDimension::Creativity => &mut aggregates.creativity,
            QualityDimension::Accuracy => &mut aggregates.accuracy,
            QualityDimension::Consensus => &mut aggregates.consensus,
        };
        target.record(sample);
    }

    /// Copy of an agent's aggregates, if any were recorded.
    pub fn snapshot(&self, agent_name: &str) -> Option<AgentAggregates> {
        self.agents.lock().unwrap().get(agent_name).cloned()
    }

    /// Copy of every agent's aggregates.
    pub fn all(&self) -> HashMap<String, AgentAggregates> {
        self.agents.lock().unwrap().clone()
    }
}

impl Default for MetricsRegistry {
    fn default() -> Self {
        Self::new()
    }
}

/// Strong / weak / neutral classification against thresholds.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PerformanceClass {
    /// Rate above the strong threshold.
    Strong,
    /// Rate below the weak threshold.
    Weak,
    /// Everything in between.
    Neutral,
}

/// Success rate for one task type, with its classification.
#[derive(Debug, Clone)]
pub struct TaskTypeRate {
    pub task_type: String,
    pub correct: i64,
    pub attempts: i64,
    pub rate: f64,
    pub class: PerformanceClass,
}

/// A capability with its rating classification.
#[derive(Debug, Clone)]
pub struct CapabilityRating {
    pub name: String,
    pub rating: f64,
    pub class: PerformanceClass,
}

/// The analysis summary for one agent; the input to prompt refinement.
#[derive(Debug, Clone)]
pub struct AgentAnalysis {
    pub agent_id: i64,
    pub agent_name: String,
    /// Correct over attempted, across all task types.
    pub overall_success_rate: f64,
    /// Per task type rates, classified.
    pub task_rates: Vec<TaskTypeRate>,
    /// Capabilities, classified by rating.
    pub capabilities: Vec<CapabilityRating>,
}

impl AgentAnalysis {
    /// Task types classified weak, the refinement targets.
    pub fn weak_task_types(&self) -> Vec<&str> {
        self.task_rates
            .iter()
            .filter(|rate| rate.class == PerformanceClass::Weak)
            .map(|rate| rate.task_type.as_str())
            .collect()
    }

    /// Task types classified strong.
    pub fn strong_task_types(&self) -> Vec<&str> {
        self.task_rates
            .iter()
            .filter(|rate| rate.class == PerformanceClass::Strong)
            .map(|rate| rate.task_type.as_str())
            .collect()
    }

    /// Whether the agent falls below the configured refinement threshold
    /// (`ConclaveConfig::prompt_refinement_threshold`) and is a candidate
    /// for a prompt rewrite.
    pub fn needs_refinement(&self, threshold: f64) -> bool {
        self.overall_success_rate < threshold
    }
}

/// Reads durable aggregates and classifies them against thresholds.
pub struct PerformanceAnalyzer {
    store: Arc<Store>,
    strong_threshold: f64,
    weak_threshold: f64,
}

impl PerformanceAnalyzer {
    /// Create an analyzer with the given classification thresholds.
    pub fn new(store: Arc<Store>, strong_threshold: f64, weak_threshold: f64) -> Self {
        PerformanceAnalyzer {
            store,
            strong_threshold,
            weak_threshold,
        }
    }

    fn classify(&self, rate: f64) -> PerformanceClass {
        if rate > self.strong_threshold {
            PerformanceClass::Strong
        } else if rate < self.weak_threshold {
            PerformanceClass::Weak
        } else {
            PerformanceClass::Neutral
        }
    }

    /// Build the analysis summary for an agent from its stored aggregates.
    pub async fn analyze(&self, agent_id: i64) -> Result<AgentAnalysis, StoreError> {
        let agent = self.store.get_agent(agent_id).await?;
        let rows = self.store.performance_for_agent(agent_id).await?;

        // Collapse per-version rows into per-task totals.
        let mut by_task: HashMap<String, (i64, i64)> = HashMap::new();
        for row in &rows {
            let entry = by_task.entry(row.task_type.clone()).or_insert((0, 0));
            entry.0 += row.correct_responses;
            entry.1 += row.total_attempts;
        }

        let mut task_rates: Vec<TaskTypeRate> = by_task
            .into_iter()
            .map(|(task_type, (correct, attempts))| {
                let rate = if attempts == 0 {
                    0.0
                } else {
                    correct as f64 / attempts as f64
                };
                TaskTypeRate {
                    task_type,
                    correct,
                    attempts,
                    rate,
                    class: self.classify(rate),
                }
            })
            .collect();
        task_rates.sort_by(|a, b| a.task_type.cmp(&b.task_type));

        let total_correct: i64 = task_rates.iter().map(|rate| rate.correct).sum();
        let total_attempts: i64 = task_rates.iter().map(|rate| rate.attempts).sum();
        let overall_success_rate = if total_attempts == 0 {
            0.0
        } else {
            total_correct as f64 / total_attempts as f64
        };

        let capabilities = self
            .store
            .list_capabilities(agent_id)
            .await?
            .into_iter()
            .map(|capability| CapabilityRating {
                class: self.classify(capability.rating),
                name: capability.name,
                rating: capability.rating,
            })
            .collect();

        Ok(AgentAnalysis {
            agent_id,
            agent_name: agent.name,
            overall_success_rate,
            task_rates,
            capabilities,
        })
    }
}
