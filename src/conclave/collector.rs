//! Response collector.
//!
//! Thread-safe, request-keyed aggregation of per-agent responses with a
//! barrier signal: callers declare the set of agents they expect for a request
//! key via [`ResponseCollector::expect_responses`], and the returned channel
//! fires exactly once when the last expected agent has responded.
//!
//! The collector also tracks per-response votes so callers can pick a
//! [`winner`](ResponseCollector::winner) among competing agent answers.

use chrono::{DateTime, Utc};
use std::collections::{HashMap, HashSet};
use std::sync::Mutex;
use tokio::sync::oneshot;

/// One agent's answer for a request key.
#[derive(Debug, Clone)]
pub struct CollectedResponse {
    /// Responding agent.
    pub agent_name: String,
    /// The response text.
    pub response_text: String,
    /// When the response was collected.
    pub timestamp: DateTime<Utc>,
    /// Votes cast for this response.
    pub votes: u32,
}

#[derive(Default)]
struct CollectorState {
    responses: HashMap<String, Vec<CollectedResponse>>,
    pending: HashMap<String, HashSet<String>>,
    waiters: HashMap<String, Vec<oneshot::Sender<()>>>,
    completed: HashSet<String>,
}

/// Request-keyed response aggregation with barrier completion.
pub struct ResponseCollector {
    state: Mutex<CollectorState>,
}

impl ResponseCollector {
    /// Create an empty collector.
    pub fn new() -> Self {
        ResponseCollector {
            state: Mutex::new(CollectorState::default()),
        }
    }

    /// Declare the agents expected to respond for `request_key`.
    ///
    /// Returns a channel that fires exactly once, when the pending set drains.
    /// An empty expected set fires immediately.  Calling this again for the
    /// same key replaces the pending set and re-arms the barrier.
    pub fn expect_responses<I, S>(&self, request_key: &str, agents: I) -> oneshot::Receiver<()>
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        let (tx, rx) = oneshot::channel();
        let expected: HashSet<String> = agents.into_iter().map(Into::into).collect();
        let mut state = self.state.lock().unwrap();
        state.completed.remove(request_key);
        if expected.is_empty() {
            let _ = tx.send(());
            state.completed.insert(request_key.to_string());
        } else {
            state.pending.insert(request_key.to_string(), expected);
            state
                .waiters
                .entry(request_key.to_string())
                .or_default()
                .push(tx);
        }
        rx
    }

    /// Record an agent's response for a request key.
    ///
    /// Removes the agent from the pending set; when the set becomes empty the
    /// completion barrier fires (once).  Responses from agents that were not
    /// expected are still collected.
    pub fn add_response(&self, request_key: &str, agent_name: &str, response_text: &str) {
        let mut state = self.state.lock().unwrap();
        state
            .responses
            .entry(request_key.to_string())
            .or_default()
            .push(CollectedResponse {
                agent_name: agent_name.to_string(),
                response_text: response_text.to_string(),
                timestamp: Utc::now(),
                votes: 0,
            });

        let drained = match state.pending.get_mut(request_key) {
            Some(pending) => {
                pending.remove(agent_name);
                pending.is_empty()
            }
            None => false,
        };
        if drained && !state.completed.contains(request_key) {
            state.pending.remove(request_key);
            state.completed.insert(request_key.to_string());
            if let Some(waiters) = state.waiters.remove(request_key) {
                for waiter in waiters {
                    let _ = waiter.send(());
                }
            }
        }
    }

    /// Responses collected so far for a request key, in arrival order.
    pub fn list_for_request(&self, request_key: &str) -> Vec<CollectedResponse> {
        self.state
            .lock()
            .unwrap()
            .responses
            .get(request_key)
            .cloned()
            .unwrap_or_default()
    }

    /// Drop all state for a request key.
    pub fn clear_for_request(&self, request_key: &str) {
        let mut state = self.state.lock().unwrap();
        state.responses.remove(request_key);
        state.pending.remove(request_key);
        state.waiters.remove(request_key);
        state.completed.remove(request_key);
    }

    /// Cast a vote for an agent's response.  Returns `false` when no response
    /// from that agent exists for the key.
    pub fn add_vote(&self, request_key: &str, agent_name: &str) -> bool {
        let mut state = self.state.lock().unwrap();
        if let Some(responses) = state.responses.get_mut(request_key) {
            for response in responses.iter_mut() {
                if response.agent_name == agent_name {
                    response.votes += 1;
                    return true;
                }
            }
        }
        false
    }

    /// The response with the most votes for a request key.
    ///
    /// Ties break toward the earliest response.  Returns `None` when no
    /// responses were collected.
    pub fn winner(&self, request_key: &str) -> Option<CollectedResponse> {
        let state = self.state.lock().unwrap();
        state
            .responses
            .get(request_key)?
            .iter()
            .max_by(|a, b| {
                a.votes
                    .cmp(&b.votes)
                    // Earlier timestamp wins a vote tie.
                    .then_with(|| b.timestamp.cmp(&a.timestamp))
            })
            .cloned()
    }
}

impl Default for ResponseCollector {
    fn default() -> Self {
        Self::new()
    }
}
