//! Bootstrap seeding.
//!
//! The embedding application supplies the canonical agents (name, purpose,
//! and an opaque prompt string loaded from its prompts directory); this
//! module seeds any that are missing from the store and registers runtimes
//! for all of them.  The prompt *content* is never interpreted here.

use crate::conclave::orchestrator::{Orchestrator, OrchestratorError};
use crate::conclave::store::{Store, StoreError};

/// One canonical agent definition supplied at bootstrap.
#[derive(Debug, Clone)]
pub struct BootstrapAgent {
    /// Unique agent name, e.g. `"Chief"`.
    pub name: String,
    /// What the agent is for.
    pub purpose: String,
    /// The opaque system prompt.
    pub prompt: String,
}

impl BootstrapAgent {
    /// Convenience constructor.
    pub fn new(
        name: impl Into<String>,
        purpose: impl Into<String>,
        prompt: impl Into<String>,
    ) -> Self {
        BootstrapAgent {
            name: name.into(),
            purpose: purpose.into(),
            prompt: prompt.into(),
        }
    }
}

/// Ensure every bootstrap agent exists in the store.
///
/// Agents that already exist are left untouched (their versioned prompts are
/// authoritative once created).  Returns the ids of the agents that were
/// newly created.
pub async fn seed_agents(
    store: &Store,
    agents: &[BootstrapAgent],
) -> Result<Vec<i64>, StoreError> {
    let mut created = Vec::new();
    for agent in agents {
        if store.find_agent_by_name(&agent.name).await?.is_some() {
            log::debug!("Bootstrap: agent '{}' already exists", agent.name);
            continue;
        }
        let id = store
            .add_agent(&agent.name, &agent.purpose, &agent.prompt, "bootstrap")
            .await?;
        created.push(id);
    }
    if !created.is_empty() {
        log::info!("Bootstrap: seeded {} agent(s)", created.len());
    }
    Ok(created)
}

/// Seed the store and register a runtime for every active stored agent.
///
/// Runtimes pick up each agent's *active* prompt version, so a previously
/// refined prompt wins over the bootstrap default.
pub async fn initialize(
    orchestrator: &mut Orchestrator,
    store: &Store,
    agents: &[BootstrapAgent],
) -> Result<usize, OrchestratorError> {
    seed_agents(store, agents)
        .await
        .map_err(OrchestratorError::Storage)?;
    orchestrator.register_agents_from_store().await
}
