//! Persistence store.
//!
//! Transactional SQLite storage for agents, versioned prompts, interactions,
//! performance aggregates, capabilities, and teams.  The store is the only
//! shared mutable durable resource in the runtime: every public operation
//! owns one transaction, and a process-wide async lock serialises writers
//! (SQLite is single-writer, so the lock costs nothing in practice).
//!
//! # Invariants enforced here
//!
//! - Agent and team names are unique case-insensitively.
//! - Exactly one version per agent is active; version numbers are monotonic
//!   per agent starting at 1.
//! - `successful_interactions <= total_interactions` for every agent
//!   (backed by a table CHECK constraint).
//! - The team chief is always a member with role `"Chief"` and cannot be
//!   removed; a team's score is the mean of its members' scores.
//!
//! # Example
//!
//! ```rust,no_run
//! use conclave::Store;
//!
//! # async {
//! let store = Store::open("conclave.db").await.unwrap();
//! let agent_id = store
//!     .add_agent("Chief", "Executive coordination", "You are the Chief.", "bootstrap")
//!     .await
//!     .unwrap();
//! let version = store.get_current_agent_version(agent_id).await.unwrap();
//! assert_eq!(version.version_number, 1);
//! # };
//! ```

use crate::conclave::task_type::TaskType;
use chrono::{DateTime, Duration, Utc};
use rusqlite::{params, Connection, OptionalExtension, Row, Transaction};
use std::error::Error;
use std::fmt;
use std::path::Path;
use std::sync::Arc;
use tokio::sync::Mutex;

/// Errors surfaced by store operations.
#[derive(Debug)]
pub enum StoreError {
    /// The referenced row does not exist.
    NotFound(String),
    /// A uniqueness constraint (agent name, team name, capability name,
    /// membership) would be violated.
    Duplicate(String),
    /// The operation is not valid in the current state
    /// (e.g. no active version, removing a team's chief).
    InvalidState(String),
    /// The storage engine failed; the operation was rolled back.
    Storage(rusqlite::Error),
}

impl fmt::Display for StoreError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            StoreError::NotFound(what) => write!(f, "not found: {}", what),
            StoreError::Duplicate(what) => write!(f, "duplicate: {}", what),
            StoreError::InvalidState(what) => write!(f, "invalid state: {}", what),
            StoreError::Storage(e) => write!(f, "storage failure: {}", e),
        }
    }
}

impl Error for StoreError {
    fn source(&self) -> Option<&(dyn Error + 'static)> {
        match self {
            StoreError::Storage(e) => Some(e),
            _ => None,
        }
    }
}

impl From<rusqlite::Error> for StoreError {
    fn from(e: rusqlite::Error) -> Self {
        StoreError::Storage(e)
    }
}

/// How [`Store::remove_agent_completely`] treats teams whose chief is the
/// agent being removed.
///
/// The policy is explicit because each choice is defensible: cascading
/// destroys teams that may still carry history, rejecting blocks cleanup,
/// and leaving the reference dangling (the historical behaviour) produces a
/// team whose `chief_agent_id` no longer resolves.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ChiefRemovalPolicy {
    /// Delete the teams the agent chairs along with their memberships.
    Cascade,
    /// Fail with [`StoreError::InvalidState`] when the agent chairs a team.
    Reject,
    /// Keep the teams; their `chief_agent_id` will no longer resolve.
    LeaveDangling,
}

/// An agent row.
#[derive(Debug, Clone)]
pub struct AgentRecord {
    pub id: i64,
    /// Unique (case-insensitive) display name.
    pub name: String,
    pub purpose: String,
    pub active: bool,
    pub created_at: DateTime<Utc>,
    pub last_modified_at: DateTime<Utc>,
    /// Mirror of the active version's performance score, in `[0, 1]`.
    pub base_score: f64,
    pub total_interactions: i64,
    pub successful_interactions: i64,
}

/// A prompt version row.  Versions are immutable snapshots; exactly one per
/// agent is active.
#[derive(Debug, Clone)]
pub struct AgentVersionRecord {
    pub id: i64,
    pub agent_id: i64,
    /// Monotonic per agent, starting at 1.
    pub version_number: i64,
    pub prompt_text: String,
    pub comments: Option<String>,
    pub known_issues: Option<String>,
    pub created_at: DateTime<Utc>,
    pub created_by: String,
    pub performance_score: f64,
    pub active: bool,
}

/// An audit row linking a version to the one it superseded.
#[derive(Debug, Clone)]
pub struct PromptModificationRecord {
    pub id: i64,
    pub version_id: i64,
    /// Cleared (not cascaded) when the superseded version row is deleted.
    pub previous_version_id: Option<i64>,
    pub reason: String,
    pub change_summary: String,
    pub performance_before: f64,
    pub performance_after: Option<f64>,
    pub modified_at: DateTime<Utc>,
}

/// Per `(agent, version, task type)` performance aggregate.
#[derive(Debug, Clone)]
pub struct AgentPerformanceRecord {
    pub agent_id: i64,
    pub version_id: i64,
    pub task_type: String,
    pub correct_responses: i64,
    pub total_attempts: i64,
    /// Running mean over recorded samples.
    pub average_response_time: f64,
    pub last_evaluation_date: DateTime<Utc>,
}

/// An immutable interaction record.
#[derive(Debug, Clone)]
pub struct InteractionRecord {
    pub id: i64,
    pub agent_id: i64,
    /// The version that was active at insertion time.
    pub version_id: i64,
    pub task_type: String,
    pub request: String,
    pub response: String,
    pub is_correct: Option<bool>,
    /// Seconds spent producing the response.
    pub processing_time: f64,
    pub created_at: DateTime<Utc>,
    pub evaluation_notes: Option<String>,
}

/// A capability row; names are unique per agent, case-insensitively.
#[derive(Debug, Clone)]
pub struct AgentCapabilityRecord {
    pub id: i64,
    pub agent_id: i64,
    pub name: String,
    pub description: Option<String>,
    /// Self-assessed strength in `[0, 1]`.
    pub rating: f64,
}

/// A team row.
#[derive(Debug, Clone)]
pub struct TeamRecord {
    pub id: i64,
    /// Globally unique (case-insensitive) team name.
    pub name: String,
    pub chief_agent_id: i64,
    pub description: Option<String>,
    pub created_at: DateTime<Utc>,
    /// Mean of the members' `performance_in_team`.
    pub performance_score: f64,
}

/// A team membership row.
#[derive(Debug, Clone)]
pub struct TeamMemberRecord {
    pub team_id: i64,
    pub agent_id: i64,
    pub role: String,
    pub assignment_reason: Option<String>,
    pub performance_in_team: f64,
}

/// Quick-access summary row from the flat metrics view.
#[derive(Debug, Clone)]
pub struct PerformanceSummaryRecord {
    pub agent_id: i64,
    pub total_requests: i64,
    pub successful_requests: i64,
    pub average_response_time: f64,
    pub updated_at: DateTime<Utc>,
}

/// Transactional relational store over SQLite.
pub struct Store {
    conn: Arc<Mutex<Connection>>,
}

impl Store {
    /// Open (or create) the database at `path` and initialise the schema.
    pub async fn open(path: impl AsRef<Path>) -> Result<Self, StoreError> {
        let conn = Connection::open(path)?;
        Self::from_connection(conn)
    }

    /// Open an in-memory database.  Used by tests.
    pub async fn open_in_memory() -> Result<Self, StoreError> {
        let conn = Connection::open_in_memory()?;
        Self::from_connection(conn)
    }

    fn from_connection(conn: Connection) -> Result<Self, StoreError> {
        conn.busy_timeout(std::time::Duration::from_secs(10))?;
        // WAL for concurrent readers; PRAGMA journal_mode returns a row.
        conn.query_row("PRAGMA journal_mode = WAL", [], |_| Ok(()))?;
        conn.execute("PRAGMA synchronous = NORMAL", [])?;
        conn.execute("PRAGMA foreign_keys = ON", [])?;
        init_schema(&conn)?;
        Ok(Store {
            conn: Arc::new(Mutex::new(conn)),
        })
    }

    // ── Agents ───────────────────────────────────────────────────────────

    /// Insert an agent together with its version 1 (active) atomically.
    ///
    /// Fails with [`StoreError::Duplicate`] when the name collides
    /// case-insensitively.  Returns the new agent id.
    pub async fn add_agent(
        &self,
        name: &str,
        purpose: &str,
        initial_prompt: &str,
        created_by: &str,
    ) -> Result<i64, StoreError> {
        let mut conn = self.conn.lock().await;
        let tx = conn.transaction()?;
        if row_exists(&tx, "SELECT 1 FROM agents WHERE name = ?1", name)? {
            return Err(StoreError::Duplicate(format!("agent '{}'", name)));
        }
        let now = Utc::now();
        tx.execute(
            "INSERT INTO agents (name, purpose, active, created_at, last_modified_at,
                                 base_score, total_interactions, successful_interactions)
             VALUES (?1, ?2, 1, ?3, ?3, 0, 0, 0)",
            params![name, purpose, now],
        )?;
        let agent_id = tx.last_insert_rowid();
        tx.execute(
            "INSERT INTO agent_versions (agent_id, version_number, prompt_text, created_at,
                                         created_by, performance_score, active)
             VALUES (?1, 1, ?2, ?3, ?4, 0, 1)",
            params![agent_id, initial_prompt, now, created_by],
        )?;
        tx.commit()?;
        log::info!("Store: added agent '{}' (id {})", name, agent_id);
        Ok(agent_id)
    }

    /// Fetch an agent by id.
    pub async fn get_agent(&self, agent_id: i64) -> Result<AgentRecord, StoreError> {
        let conn = self.conn.lock().await;
        conn.query_row(
            "SELECT id, name, purpose, active, created_at, last_modified_at,
                    base_score, total_interactions, successful_interactions
             FROM agents WHERE id = ?1",
            params![agent_id],
            agent_from_row,
        )
        .optional()?
        .ok_or_else(|| StoreError::NotFound(format!("agent {}", agent_id)))
    }

    /// Look up an agent by name, case-insensitively.
    pub async fn find_agent_by_name(&self, name: &str) -> Result<Option<AgentRecord>, StoreError> {
        let conn = self.conn.lock().await;
        Ok(conn
            .query_row(
                "SELECT id, name, purpose, active, created_at, last_modified_at,
                        base_score, total_interactions, successful_interactions
                 FROM agents WHERE name = ?1",
                params![name],
                agent_from_row,
            )
            .optional()?)
    }

    /// List agents, optionally restricted to active ones, ordered by name.
    pub async fn list_agents(&self, active_only: bool) -> Result<Vec<AgentRecord>, StoreError> {
        let conn = self.conn.lock().await;
        let sql = if active_only {
            "SELECT id, name, purpose, active, created_at, last_modified_at,
                    base_score, total_interactions, successful_interactions
             FROM agents WHERE active = 1 ORDER BY name"
        } else {
            "SELECT id, name, purpose, active, created_at, last_modified_at,
                    base_score, total_interactions, successful_interactions
             FROM agents ORDER BY name"
        };
        let mut stmt = conn.prepare(sql)?;
        let rows = stmt.query_map([], agent_from_row)?;
        Ok(rows.collect::<Result<Vec<_>, _>>()?)
    }

    /// Soft-activate or deactivate an agent.
    pub async fn set_agent_active(&self, agent_id: i64, active: bool) -> Result<(), StoreError> {
        let conn = self.conn.lock().await;
        let changed = conn.execute(
            "UPDATE agents SET active = ?2, last_modified_at = ?3 WHERE id = ?1",
            params![agent_id, active, Utc::now()],
        )?;
        if changed == 0 {
            return Err(StoreError::NotFound(format!("agent {}", agent_id)));
        }
        Ok(())
    }

    /// Hard-remove an agent and every dependent row.
    ///
    /// `policy` decides what happens to teams whose chief is this agent; the
    /// membership row itself is always removed.
    pub async fn remove_agent_completely(
        &self,
        agent_id: i64,
        policy: ChiefRemovalPolicy,
    ) -> Result<(), StoreError> {
        let mut conn = self.conn.lock().await;
        let tx = conn.transaction()?;
        if !row_exists_i64(&tx, "SELECT 1 FROM agents WHERE id = ?1", agent_id)? {
            return Err(StoreError::NotFound(format!("agent {}", agent_id)));
        }

        let chaired: Vec<i64> = {
            let mut stmt =
                tx.prepare("SELECT id FROM team_compositions WHERE chief_agent_id = ?1")?;
            let rows = stmt.query_map(params![agent_id], |row| row.get(0))?;
            rows.collect::<Result<Vec<_>, _>>()?
        };
        if !chaired.is_empty() {
            match policy {
                ChiefRemovalPolicy::Reject => {
                    return Err(StoreError::InvalidState(format!(
                        "agent {} is chief of {} team(s)",
                        agent_id,
                        chaired.len()
                    )));
                }
                ChiefRemovalPolicy::Cascade => {
                    tx.execute(
                        "DELETE FROM team_compositions WHERE chief_agent_id = ?1",
                        params![agent_id],
                    )?;
                }
                ChiefRemovalPolicy::LeaveDangling => {
                    log::warn!(
                        "Store: removing agent {} leaves {} team(s) with a dangling chief",
                        agent_id,
                        chaired.len()
                    );
                }
            }
        }

        tx.execute(
            "DELETE FROM agent_performance WHERE agent_id = ?1",
            params![agent_id],
        )?;
        tx.execute(
            "DELETE FROM interaction_history WHERE agent_id = ?1",
            params![agent_id],
        )?;
        tx.execute(
            "DELETE FROM prompt_modifications
             WHERE version_id IN (SELECT id FROM agent_versions WHERE agent_id = ?1)
                OR previous_version_id IN (SELECT id FROM agent_versions WHERE agent_id = ?1)",
            params![agent_id],
        )?;
        tx.execute(
            "DELETE FROM agent_capabilities WHERE agent_id = ?1",
            params![agent_id],
        )?;
        tx.execute(
            "DELETE FROM team_members WHERE agent_id = ?1",
            params![agent_id],
        )?;
        tx.execute(
            "DELETE FROM agent_versions WHERE agent_id = ?1",
            params![agent_id],
        )?;
        tx.execute(
            "DELETE FROM agent_performance_log WHERE agent_id = ?1",
            params![agent_id],
        )?;
        tx.execute(
            "DELETE FROM performance_summary WHERE agent_id = ?1",
            params![agent_id],
        )?;
        tx.execute("DELETE FROM agents WHERE id = ?1", params![agent_id])?;
        tx.commit()?;
        Ok(())
    }

    // ── Versions ─────────────────────────────────────────────────────────

    /// Add a new prompt version and make it the active one.
    ///
    /// Within one transaction: all previous versions are deactivated, the new
    /// version gets `max + 1`, a [`PromptModificationRecord`] links it to the
    /// superseded version, and the agent's `last_modified_at` is touched.
    /// Returns the new version number.
    pub async fn add_agent_version(
        &self,
        agent_id: i64,
        new_prompt: &str,
        reason: &str,
        change_summary: &str,
        created_by: &str,
        performance_before: f64,
    ) -> Result<i64, StoreError> {
        let mut conn = self.conn.lock().await;
        let tx = conn.transaction()?;
        if !row_exists_i64(&tx, "SELECT 1 FROM agents WHERE id = ?1", agent_id)? {
            return Err(StoreError::NotFound(format!("agent {}", agent_id)));
        }
        let max_version: i64 = tx.query_row(
            "SELECT COALESCE(MAX(version_number), 0) FROM agent_versions WHERE agent_id = ?1",
            params![agent_id],
            |row| row.get(0),
        )?;
        let previous_version_id: Option<i64> = tx
            .query_row(
                "SELECT id FROM agent_versions WHERE agent_id = ?1 AND active = 1",
                params![agent_id],
                |row| row.get(0),
            )
            .optional()?;

        tx.execute(
            "UPDATE agent_versions SET active = 0 WHERE agent_id = ?1",
            params![agent_id],
        )?;
        let now = Utc::now();
        let new_number = max_version + 1;
        tx.execute(
            "INSERT INTO agent_versions (agent_id, version_number, prompt_text, created_at,
                                         created_by, performance_score, active)
             VALUES (?1, ?2, ?3, ?4, ?5, 0, 1)",
            params![agent_id, new_number, new_prompt, now, created_by],
        )?;
        let new_version_id = tx.last_insert_rowid();
        tx.execute(
            "INSERT INTO prompt_modifications (version_id, previous_version_id, reason,
                                               change_summary, performance_before, modified_at)
             VALUES (?1, ?2, ?3, ?4, ?5, ?6)",
            params![
                new_version_id,
                previous_version_id,
                reason,
                change_summary,
                performance_before,
                now
            ],
        )?;
        tx.execute(
            "UPDATE agents SET last_modified_at = ?2 WHERE id = ?1",
            params![agent_id, now],
        )?;
        tx.commit()?;
        log::info!(
            "Store: agent {} advanced to prompt version {}",
            agent_id,
            new_number
        );
        Ok(new_number)
    }

    /// The active version of an agent.
    pub async fn get_current_agent_version(
        &self,
        agent_id: i64,
    ) -> Result<AgentVersionRecord, StoreError> {
        let conn = self.conn.lock().await;
        conn.query_row(
            "SELECT id, agent_id, version_number, prompt_text, comments, known_issues,
                    created_at, created_by, performance_score, active
             FROM agent_versions WHERE agent_id = ?1 AND active = 1",
            params![agent_id],
            version_from_row,
        )
        .optional()?
        .ok_or_else(|| StoreError::InvalidState(format!("agent {} has no active version", agent_id)))
    }

    /// Fetch a version by id.
    pub async fn get_version(&self, version_id: i64) -> Result<AgentVersionRecord, StoreError> {
        let conn = self.conn.lock().await;
        conn.query_row(
            "SELECT id, agent_id, version_number, prompt_text, comments, known_issues,
                    created_at, created_by, performance_score, active
             FROM agent_versions WHERE id = ?1",
            params![version_id],
            version_from_row,
        )
        .optional()?
        .ok_or_else(|| StoreError::NotFound(format!("version {}", version_id)))
    }

    /// All versions of an agent, oldest first.
    pub async fn list_agent_versions(
        &self,
        agent_id: i64,
    ) -> Result<Vec<AgentVersionRecord>, StoreError> {
        let conn = self.conn.lock().await;
        let mut stmt = conn.prepare(
            "SELECT id, agent_id, version_number, prompt_text, comments, known_issues,
                    created_at, created_by, performance_score, active
             FROM agent_versions WHERE agent_id = ?1 ORDER BY version_number",
        )?;
        let rows = stmt.query_map(params![agent_id], version_from_row)?;
        Ok(rows.collect::<Result<Vec<_>, _>>()?)
    }

    /// Modification audit rows for an agent's versions, newest first.
    pub async fn list_prompt_modifications(
        &self,
        agent_id: i64,
    ) -> Result<Vec<PromptModificationRecord>, StoreError> {
        let conn = self.conn.lock().await;
        let mut stmt = conn.prepare(
            "SELECT m.id, m.version_id, m.previous_version_id, m.reason, m.change_summary,
                    m.performance_before, m.performance_after, m.modified_at
             FROM prompt_modifications m
             JOIN agent_versions v ON v.id = m.version_id
             WHERE v.agent_id = ?1
             ORDER BY m.modified_at DESC, m.id DESC",
        )?;
        let rows = stmt.query_map(params![agent_id], modification_from_row)?;
        Ok(rows.collect::<Result<Vec<_>, _>>()?)
    }

    /// Overwrite a version's performance score directly.
    ///
    /// Used when a score is produced outside the interaction path, e.g. at
    /// the end of an A/B test.
    pub async fn set_version_performance_score(
        &self,
        version_id: i64,
        score: f64,
    ) -> Result<(), StoreError> {
        let conn = self.conn.lock().await;
        let changed = conn.execute(
            "UPDATE agent_versions SET performance_score = ?2 WHERE id = ?1",
            params![version_id, score],
        )?;
        if changed == 0 {
            return Err(StoreError::NotFound(format!("version {}", version_id)));
        }
        Ok(())
    }

    // ── Interactions & performance ───────────────────────────────────────

    /// Record one interaction against the agent's active version.
    ///
    /// Within one transaction: the interaction row is inserted, the agent's
    /// counters advance, the `(agent, version, task type)` aggregate is
    /// upserted with a running response-time mean, the version's score is
    /// recomputed as total correct over total attempts, and the flat metrics
    /// view is updated.  Fails with [`StoreError::InvalidState`] when the
    /// agent has no active version.  Returns the interaction id.
    pub async fn record_interaction(
        &self,
        agent_id: i64,
        task_type: TaskType,
        request: &str,
        response: &str,
        is_correct: Option<bool>,
        processing_time: f64,
        evaluation_notes: Option<&str>,
    ) -> Result<i64, StoreError> {
        let mut conn = self.conn.lock().await;
        let tx = conn.transaction()?;
        let version_id: i64 = tx
            .query_row(
                "SELECT id FROM agent_versions WHERE agent_id = ?1 AND active = 1",
                params![agent_id],
                |row| row.get(0),
            )
            .optional()?
            .ok_or_else(|| {
                StoreError::InvalidState(format!("agent {} has no active version", agent_id))
            })?;

        let now = Utc::now();
        let success = is_correct == Some(true);
        tx.execute(
            "INSERT INTO interaction_history (agent_id, version_id, task_type, request, response,
                                              is_correct, processing_time, created_at,
                                              evaluation_notes)
             VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9)",
            params![
                agent_id,
                version_id,
                task_type.as_str(),
                request,
                response,
                is_correct,
                processing_time,
                now,
                evaluation_notes
            ],
        )?;
        let interaction_id = tx.last_insert_rowid();

        tx.execute(
            "UPDATE agents
             SET total_interactions = total_interactions + 1,
                 successful_interactions = successful_interactions + ?2
             WHERE id = ?1",
            params![agent_id, success as i64],
        )?;

        upsert_performance(&tx, agent_id, version_id, task_type.as_str(), success, processing_time, now)?;

        let score = version_score(&tx, version_id)?;
        tx.execute(
            "UPDATE agent_versions SET performance_score = ?2 WHERE id = ?1",
            params![version_id, score],
        )?;

        // Flat quick-access metrics view.
        tx.execute(
            "INSERT INTO agent_performance_log (agent_id, task_type, success, response_time, logged_at)
             VALUES (?1, ?2, ?3, ?4, ?5)",
            params![agent_id, task_type.as_str(), success, processing_time, now],
        )?;
        upsert_summary(&tx, agent_id, success, processing_time, now)?;

        tx.commit()?;
        Ok(interaction_id)
    }

    /// Recompute a version's score from its aggregates, propagate it to any
    /// modification rows referencing the version, and mirror it into the
    /// parent agent's base score.  Returns the score.
    pub async fn recompute_scores(&self, version_id: i64) -> Result<f64, StoreError> {
        let mut conn = self.conn.lock().await;
        let tx = conn.transaction()?;
        let agent_id: i64 = tx
            .query_row(
                "SELECT agent_id FROM agent_versions WHERE id = ?1",
                params![version_id],
                |row| row.get(0),
            )
            .optional()?
            .ok_or_else(|| StoreError::NotFound(format!("version {}", version_id)))?;

        let score = version_score(&tx, version_id)?;
        tx.execute(
            "UPDATE agent_versions SET performance_score = ?2 WHERE id = ?1",
            params![version_id, score],
        )?;
        tx.execute(
            "UPDATE prompt_modifications SET performance_after = ?2 WHERE version_id = ?1",
            params![version_id, score],
        )?;
        tx.execute(
            "UPDATE agents SET base_score = ?2 WHERE id = ?1",
            params![agent_id, score],
        )?;
        tx.commit()?;
        Ok(score)
    }

    /// Performance aggregates recorded for an agent, across versions.
    pub async fn performance_for_agent(
        &self,
        agent_id: i64,
    ) -> Result<Vec<AgentPerformanceRecord>, StoreError> {
        let conn = self.conn.lock().await;
        let mut stmt = conn.prepare(
            "SELECT agent_id, version_id, task_type, correct_responses, total_attempts,
                    average_response_time, last_evaluation_date
             FROM agent_performance WHERE agent_id = ?1
             ORDER BY version_id, task_type",
        )?;
        let rows = stmt.query_map(params![agent_id], performance_from_row)?;
        Ok(rows.collect::<Result<Vec<_>, _>>()?)
    }

    /// Most recent interactions for an agent, newest first.
    pub async fn interactions_for_agent(
        &self,
        agent_id: i64,
        limit: usize,
    ) -> Result<Vec<InteractionRecord>, StoreError> {
        let conn = self.conn.lock().await;
        let mut stmt = conn.prepare(
            "SELECT id, agent_id, version_id, task_type, request, response, is_correct,
                    processing_time, created_at, evaluation_notes
             FROM interaction_history WHERE agent_id = ?1
             ORDER BY created_at DESC, id DESC LIMIT ?2",
        )?;
        let rows = stmt.query_map(params![agent_id, limit as i64], interaction_from_row)?;
        Ok(rows.collect::<Result<Vec<_>, _>>()?)
    }

    /// The quick-access summary row for an agent, if any interactions were
    /// recorded.
    pub async fn performance_summary(
        &self,
        agent_id: i64,
    ) -> Result<Option<PerformanceSummaryRecord>, StoreError> {
        let conn = self.conn.lock().await;
        Ok(conn
            .query_row(
                "SELECT agent_id, total_requests, successful_requests, average_response_time,
                        updated_at
                 FROM performance_summary WHERE agent_id = ?1",
                params![agent_id],
                |row| {
                    Ok(PerformanceSummaryRecord {
                        agent_id: row.get(0)?,
                        total_requests: row.get(1)?,
                        successful_requests: row.get(2)?,
                        average_response_time: row.get(3)?,
                        updated_at: row.get(4)?,
                    })
                },
            )
            .optional()?)
    }

    /// Delete flat performance-log rows older than `retention_days`.
    /// Returns the number of rows removed.
    pub async fn prune_metrics(&self, retention_days: u32) -> Result<usize, StoreError> {
        let cutoff = Utc::now() - Duration::days(i64::from(retention_days));
        let conn = self.conn.lock().await;
        let removed = conn.execute(
            "DELETE FROM agent_performance_log WHERE logged_at < ?1",
            params![cutoff],
        )?;
        if removed > 0 {
            log::info!("Store: pruned {} performance-log rows", removed);
        }
        Ok(removed)
    }

    // ── Capabilities ─────────────────────────────────────────────────────

    /// Register a capability for an agent.  Names are unique per agent,
    /// case-insensitively; ratings must lie in `[0, 1]`.
    pub async fn add_capability(
        &self,
        agent_id: i64,
        name: &str,
        description: Option<&str>,
        rating: f64,
    ) -> Result<i64, StoreError> {
        if !(0.0..=1.0).contains(&rating) {
            return Err(StoreError::InvalidState(format!(
                "capability rating {} outside [0, 1]",
                rating
            )));
        }
        let mut conn = self.conn.lock().await;
        let tx = conn.transaction()?;
        if !row_exists_i64(&tx, "SELECT 1 FROM agents WHERE id = ?1", agent_id)? {
            return Err(StoreError::NotFound(format!("agent {}", agent_id)));
        }
        let dup: Option<i64> = tx
            .query_row(
                "SELECT id FROM agent_capabilities WHERE agent_id = ?1 AND name = ?2",
                params![agent_id, name],
                |row| row.get(0),
            )
            .optional()?;
        if dup.is_some() {
            return Err(StoreError::Duplicate(format!(
                "capability '{}' for agent {}",
                name, agent_id
            )));
        }
        tx.execute(
            "INSERT INTO agent_capabilities (agent_id, name, description, rating)
             VALUES (?1, ?2, ?3, ?4)",
            params![agent_id, name, description, rating],
        )?;
        let id = tx.last_insert_rowid();
        tx.commit()?;
        Ok(id)
    }

    /// Capabilities registered for an agent, ordered by name.
    pub async fn list_capabilities(
        &self,
        agent_id: i64,
    ) -> Result<Vec<AgentCapabilityRecord>, StoreError> {
        let conn = self.conn.lock().await;
        let mut stmt = conn.prepare(
            "SELECT id, agent_id, name, description, rating
             FROM agent_capabilities WHERE agent_id = ?1 ORDER BY name",
        )?;
        let rows = stmt.query_map(params![agent_id], |row| {
            Ok(AgentCapabilityRecord {
                id: row.get(0)?,
                agent_id: row.get(1)?,
                name: row.get(2)?,
                description: row.get(3)?,
                rating: row.get(4)?,
            })
        })?;
        Ok(rows.collect::<Result<Vec<_>, _>>()?)
    }

    /// Update a capability's rating.
    pub async fn update_capability_rating(
        &self,
        agent_id: i64,
        name: &str,
        rating: f64,
    ) -> Result<(), StoreError> {
        if !(0.0..=1.0).contains(&rating) {
            return Err(StoreError::InvalidState(format!(
                "capability rating {} outside [0, 1]",
                rating
            )));
        }
        let conn = self.conn.lock().await;
        let changed = conn.execute(
            "UPDATE agent_capabilities SET rating = ?3 WHERE agent_id = ?1 AND name = ?2",
            params![agent_id, name, rating],
        )?;
        if changed == 0 {
            return Err(StoreError::NotFound(format!(
                "capability '{}' for agent {}",
                name, agent_id
            )));
        }
        Ok(())
    }

    // ── Teams ────────────────────────────────────────────────────────────

    /// Create a team and enrol its chief as a member with role `"Chief"`
    /// atomically.  Fails with [`StoreError::Duplicate`] on a name collision.
    pub async fn create_team(
        &self,
        name: &str,
        chief_agent_id: i64,
        description: Option<&str>,
    ) -> Result<i64, StoreError> {
        let mut conn = self.conn.lock().await;
        let tx = conn.transaction()?;
        if row_exists(&tx, "SELECT 1 FROM team_compositions WHERE name = ?1", name)? {
            return Err(StoreError::Duplicate(format!("team '{}'", name)));
        }
        if !row_exists_i64(&tx, "SELECT 1 FROM agents WHERE id = ?1", chief_agent_id)? {
            return Err(StoreError::NotFound(format!("agent {}", chief_agent_id)));
        }
        tx.execute(
            "INSERT INTO team_compositions (name, chief_agent_id, description, created_at,
                                            performance_score)
             VALUES (?1, ?2, ?3, ?4, 0)",
            params![name, chief_agent_id, description, Utc::now()],
        )?;
        let team_id = tx.last_insert_rowid();
        tx.execute(
            "INSERT INTO team_members (team_id, agent_id, role, performance_in_team)
             VALUES (?1, ?2, 'Chief', 0)",
            params![team_id, chief_agent_id],
        )?;
        tx.commit()?;
        log::info!("Store: created team '{}' (id {})", name, team_id);
        Ok(team_id)
    }

    /// Fetch a team by id.
    pub async fn get_team(&self, team_id: i64) -> Result<TeamRecord, StoreError> {
        let conn = self.conn.lock().await;
        conn.query_row(
            "SELECT id, name, chief_agent_id, description, created_at, performance_score
             FROM team_compositions WHERE id = ?1",
            params![team_id],
            team_from_row,
        )
        .optional()?
        .ok_or_else(|| StoreError::NotFound(format!("team {}", team_id)))
    }

    /// Look up a team by name, case-insensitively.
    pub async fn find_team_by_name(&self, name: &str) -> Result<Option<TeamRecord>, StoreError> {
        let conn = self.conn.lock().await;
        Ok(conn
            .query_row(
                "SELECT id, name, chief_agent_id, description, created_at, performance_score
                 FROM team_compositions WHERE name = ?1",
                params![name],
                team_from_row,
            )
            .optional()?)
    }

    /// Members of a team.  The chief sorts first, then by agent id.
    pub async fn team_members(&self, team_id: i64) -> Result<Vec<TeamMemberRecord>, StoreError> {
        let conn = self.conn.lock().await;
        let mut stmt = conn.prepare(
            "SELECT team_id, agent_id, role, assignment_reason, performance_in_team
             FROM team_members WHERE team_id = ?1
             ORDER BY CASE WHEN role = 'Chief' THEN 0 ELSE 1 END, agent_id",
        )?;
        let rows = stmt.query_map(params![team_id], |row| {
            Ok(TeamMemberRecord {
                team_id: row.get(0)?,
                agent_id: row.get(1)?,
                role: row.get(2)?,
                assignment_reason: row.get(3)?,
                performance_in_team: row.get(4)?,
            })
        })?;
        Ok(rows.collect::<Result<Vec<_>, _>>()?)
    }

    /// Add a member to a team and refresh the team score.
    pub async fn add_to_team(
        &self,
        team_id: i64,
        agent_id: i64,
        role: &str,
        assignment_reason: Option<&str>,
    ) -> Result<(), StoreError> {
        let mut conn = self.conn.lock().await;
        let tx = conn.transaction()?;
        if !row_exists_i64(&tx, "SELECT 1 FROM team_compositions WHERE id = ?1", team_id)? {
            return Err(StoreError::NotFound(format!("team {}", team_id)));
        }
        if !row_exists_i64(&tx, "SELECT 1 FROM agents WHERE id = ?1", agent_id)? {
            return Err(StoreError::NotFound(format!("agent {}", agent_id)));
        }
        let dup: Option<i64> = tx
            .query_row(
                "SELECT 1 FROM team_members WHERE team_id = ?1 AND agent_id = ?2",
                params![team_id, agent_id],
                |row| row.get(0),
            )
            .optional()?;
        if dup.is_some() {
            return Err(StoreError::Duplicate(format!(
                "agent {} in team {}",
                agent_id, team_id
            )));
        }
        tx.execute(
            "INSERT INTO team_members (team_id, agent_id, role, assignment_reason,
                                       performance_in_team)
             VALUES (?1, ?2, ?3, ?4, 0)",
            params![team_id, agent_id, role, assignment_reason],
        )?;
        refresh_team_score(&tx, team_id)?;
        tx.commit()?;
        Ok(())
    }

    /// Remove a member from a team.  Refuses to remove the chief.
    pub async fn remove_from_team(&self, team_id: i64, agent_id: i64) -> Result<(), StoreError> {
        let mut conn = self.conn.lock().await;
        let tx = conn.transaction()?;
        let chief_agent_id: i64 = tx
            .query_row(
                "SELECT chief_agent_id FROM team_compositions WHERE id = ?1",
                params![team_id],
                |row| row.get(0),
            )
            .optional()?
            .ok_or_else(|| StoreError::NotFound(format!("team {}", team_id)))?;
        if agent_id == chief_agent_id {
            return Err(StoreError::InvalidState(format!(
                "agent {} is the chief of team {} and cannot be removed",
                agent_id, team_id
            )));
        }
        let removed = tx.execute(
            "DELETE FROM team_members WHERE team_id = ?1 AND agent_id = ?2",
            params![team_id, agent_id],
        )?;
        if removed == 0 {
            return Err(StoreError::NotFound(format!(
                "agent {} in team {}",
                agent_id, team_id
            )));
        }
        refresh_team_score(&tx, team_id)?;
        tx.commit()?;
        Ok(())
    }

    /// Update a member's in-team performance and refresh the team score
    /// (mean over members).  Returns the new team score.
    pub async fn update_team_member_performance(
        &self,
        team_id: i64,
        agent_id: i64,
        performance: f64,
    ) -> Result<f64, StoreError> {
        let mut conn = self.conn.lock().await;
        let tx = conn.transaction()?;
        let changed = tx.execute(
            "UPDATE team_members SET performance_in_team = ?3
             WHERE team_id = ?1 AND agent_id = ?2",
            params![team_id, agent_id, performance],
        )?;
        if changed == 0 {
            return Err(StoreError::NotFound(format!(
                "agent {} in team {}",
                agent_id, team_id
            )));
        }
        let score = refresh_team_score(&tx, team_id)?;
        tx.commit()?;
        Ok(score)
    }
}

// ── Row mapping & transaction helpers ────────────────────────────────────

fn agent_from_row(row: &Row<'_>) -> rusqlite::Result<AgentRecord> {
    Ok(AgentRecord {
        id: row.get(0)?,
        name: row.get(1)?,
        purpose: row.get(2)?,
        active: row.get(3)?,
        created_at: row.get(4)?,
        last_modified_at: row.get(5)?,
        base_score: row.get(6)?,
        total_interactions: row.get(7)?,
        successful_interactions: row.get(8)?,
    })
}

fn version_from_row(row: &Row<'_>) -> rusqlite::Result<AgentVersionRecord> {
    Ok(AgentVersionRecord {
        id: row.get(0)?,
        agent_id: row.get(1)?,
        version_number: row.get(2)?,
        prompt_text: row.get(3)?,
        comments: row.get(4)?,
        known_issues: row.get(5)?,
        created_at: row.get(6)?,
        created_by: row.get(7)?,
        performance_score: row.get(8)?,
        active: row.get(9)?,
    })
}

fn modification_from_row(row: &Row<'_>) -> rusqlite::Result<PromptModificationRecord> {
    Ok(PromptModificationRecord {
        id: row.get(0)?,
        version_id: row.get(1)?,
        previous_version_id: row.get(2)?,
        reason: row.get(3)?,
        change_summary: row.get(4)?,
        performance_before: row.get(5)?,
        performance_after: row.get(6)?,
        modified_at: row.get(7)?,
    })
}

fn performance_from_row(row: &Row<'_>) -> rusqlite::Result<AgentPerformanceRecord> {
    Ok(AgentPerformanceRecord {
        agent_id: row.get(0)?,
        version_id: row.get(1)?,
        task_type: row.get(2)?,
        correct_responses: row.get(3)?,
        total_attempts: row.get(4)?,
        average_response_time: row.get(5)?,
        last_evaluation_date: row.get(6)?,
    })
}

fn interaction_from_row(row: &Row<'_>) -> rusqlite::Result<InteractionRecord> {
    Ok(InteractionRecord {
        id: row.get(0)?,
        agent_id: row.get(1)?,
        version_id: row.get(2)?,
        task_type: row.get(3)?,
        request: row.get(4)?,
        response: row.get(5)?,
        is_correct: row.get(6)?,
        processing_time: row.get(7)?,
        created_at: row.get(8)?,
        evaluation_notes: row.get(9)?,
    })
}

fn team_from_row(row: &Row<'_>) -> rusqlite::Result<TeamRecord> {
    Ok(TeamRecord {
        id: row.get(0)?,
        name: row.get(1)?,
        chief_agent_id: row.get(2)?,
        description: row.get(3)?,
        created_at: row.get(4)?,
        performance_score: row.get(5)?,
    })
}

fn row_exists(tx: &Transaction<'_>, sql: &str, key: &str) -> rusqlite::Result<bool> {
    let found: Option<i64> = tx.query_row(sql, params![key], |row| row.get(0)).optional()?;
    Ok(found.is_some())
}

fn row_exists_i64(tx: &Transaction<'_>, sql: &str, key: i64) -> rusqlite::Result<bool> {
    let found: Option<i64> = tx.query_row(sql, params![key], |row| row.get(0)).optional()?;
    Ok(found.is_some())
}

/// Upsert the `(agent, version, task type)` aggregate, maintaining the
/// running response-time mean `(old·n + sample) / (n + 1)`.
fn upsert_performance(
    tx: &Transaction<'_>,
    agent_id: i64,
    version_id: i64,
    task_type: &str,
    success: bool,
    sample_seconds: f64,
    now: DateTime<Utc>,
) -> rusqlite::Result<()> {
    let existing: Option<(i64, i64, f64)> = tx
        .query_row(
            "SELECT correct_responses, total_attempts, average_response_time
             FROM agent_performance
             WHERE agent_id = ?1 AND version_id = ?2 AND task_type = ?3",
            params![agent_id, version_id, task_type],
            |row| Ok((row.get(0)?, row.get(1)?, row.get(2)?)),
        )
        .optional()?;
    match existing {
        Some((correct, attempts, average)) => {
            let new_average =
                (average * attempts as f64 + sample_seconds) / (attempts as f64 + 1.0);
            tx.execute(
                "UPDATE agent_performance
                 SET correct_responses = ?4, total_attempts = ?5,
                     average_response_time = ?6, last_evaluation_date = ?7
                 WHERE agent_id = ?1 AND version_id = ?2 AND task_type = ?3",
                params![
                    agent_id,
                    version_id,
                    task_type,
                    correct + success as i64,
                    attempts + 1,
                    new_average,
                    now
                ],
            )?;
        }
        None => {
            tx.execute(
                "INSERT INTO agent_performance (agent_id, version_id, task_type,
                                                correct_responses, total_attempts,
                                                average_response_time, last_evaluation_date)
                 VALUES (?1, ?2, ?3, ?4, 1, ?5, ?6)",
                params![agent_id, version_id, task_type, success as i64, sample_seconds, now],
            )?;
        }
    }
    Ok(())
}

/// A version's score: total correct over total attempts across its
/// aggregates, 0 when no attempts were recorded.
fn version_score(tx: &Transaction<'_>, version_id: i64) -> rusqlite::Result<f64> {
    let (correct, attempts): (i64, i64) = tx.query_row(
        "SELECT COALESCE(SUM(correct_responses), 0), COALESCE(SUM(total_attempts), 0)
         FROM agent_performance WHERE version_id = ?1",
        params![version_id],
        |row| Ok((row.get(0)?, row.get(1)?)),
    )?;
    if attempts == 0 {
        Ok(0.0)
    } else {
        Ok(correct as f64 / attempts as f64)
    }
}

/// Recompute a team's score as the mean of member scores.  Returns it.
fn refresh_team_score(tx: &Transaction<'_>, team_id: i64) -> rusqlite::Result<f64> {
    let score: f64 = tx.query_row(
        "SELECT COALESCE(AVG(performance_in_team), 0) FROM team_members WHERE team_id = ?1",
        params![team_id],
        |row| row.get(0),
    )?;
    tx.execute(
        "UPDATE team_compositions SET performance_score = ?2 WHERE id = ?1",
        params![team_id, score],
    )?;
    Ok(score)
}

/// Maintain the quick-access summary row for an agent.
fn upsert_summary(
    tx: &Transaction<'_>,
    agent_id: i64,
    success: bool,
    sample_seconds: f64,
    now: DateTime<Utc>,
) -> rusqlite::Result<()> {
    let existing: Option<(i64, i64, f64)> = tx
        .query_row(
            "SELECT total_requests, successful_requests, average_response_time
             FROM performance_summary WHERE agent_id = ?1",
            params![agent_id],
            |row| Ok((row.get(0)?, row.get(1)?, row.get(2)?)),
        )
        .optional()?;
    match existing {
        Some((total, successful, average)) => {
            let new_average = (average * total as f64 + sample_seconds) / (total as f64 + 1.0);
            tx.execute(
                "UPDATE performance_summary
                 SET total_requests = ?2, successful_requests = ?3,
                     average_response_time = ?4, updated_at = ?5
                 WHERE agent_id = ?1",
                params![agent_id, total + 1, successful + success as i64, new_average, now],
            )?;
        }
        None => {
            tx.execute(
                "INSERT INTO performance_summary (agent_id, total_requests, successful_requests,
                                                  average_response_time, updated_at)
                 VALUES (?1, 1, ?2, ?3, ?4)",
                params![agent_id, success as i64, sample_seconds, now],
            )?;
        }
    }
    Ok(())
}

/// Create the schema if it does not exist.
fn init_schema(conn: &Connection) -> rusqlite::Result<()> {
    conn.execute_batch(
        "CREATE TABLE IF NOT EXISTS agents (
             id INTEGER PRIMARY KEY AUTOINCREMENT,
             name TEXT NOT NULL COLLATE NOCASE UNIQUE,
             purpose TEXT NOT NULL,
             active INTEGER NOT NULL DEFAULT 1,
             created_at TEXT NOT NULL,
             last_modified_at TEXT NOT NULL,
             base_score REAL NOT NULL DEFAULT 0,
             total_interactions INTEGER NOT NULL DEFAULT 0,
             successful_interactions INTEGER NOT NULL DEFAULT 0,
             CHECK (successful_interactions <= total_interactions)
         );

         CREATE TABLE IF NOT EXISTS agent_versions (
             id INTEGER PRIMARY KEY AUTOINCREMENT,
             agent_id INTEGER NOT NULL REFERENCES agents(id) ON DELETE CASCADE,
             version_number INTEGER NOT NULL,
             prompt_text TEXT NOT NULL,
             comments TEXT,
             known_issues TEXT,
             created_at TEXT NOT NULL,
             created_by TEXT NOT NULL,
             performance_score REAL NOT NULL DEFAULT 0,
             active INTEGER NOT NULL DEFAULT 0,
             UNIQUE (agent_id, version_number)
         );
         CREATE INDEX IF NOT EXISTS idx_versions_agent_active
             ON agent_versions (agent_id, active, version_number);

         CREATE TABLE IF NOT EXISTS prompt_modifications (
             id INTEGER PRIMARY KEY AUTOINCREMENT,
             version_id INTEGER NOT NULL
                 REFERENCES agent_versions(id) ON DELETE CASCADE,
             previous_version_id INTEGER
                 REFERENCES agent_versions(id) ON DELETE SET NULL,
             reason TEXT NOT NULL,
             change_summary TEXT NOT NULL,
             performance_before REAL NOT NULL,
             performance_after REAL,
             modified_at TEXT NOT NULL
         );

         CREATE TABLE IF NOT EXISTS agent_performance (
             agent_id INTEGER NOT NULL REFERENCES agents(id) ON DELETE CASCADE,
             version_id INTEGER NOT NULL
                 REFERENCES agent_versions(id) ON DELETE CASCADE,
             task_type TEXT NOT NULL,
             correct_responses INTEGER NOT NULL DEFAULT 0,
             total_attempts INTEGER NOT NULL DEFAULT 0,
             average_response_time REAL NOT NULL DEFAULT 0,
             last_evaluation_date TEXT NOT NULL,
             PRIMARY KEY (agent_id, version_id, task_type)
         );

         CREATE TABLE IF NOT EXISTS interaction_history (
             id INTEGER PRIMARY KEY AUTOINCREMENT,
             agent_id INTEGER NOT NULL REFERENCES agents(id) ON DELETE CASCADE,
             version_id INTEGER NOT NULL
                 REFERENCES agent_versions(id) ON DELETE CASCADE,
             task_type TEXT NOT NULL,
             request TEXT NOT NULL,
             response TEXT NOT NULL,
             is_correct INTEGER,
             processing_time REAL NOT NULL,
             created_at TEXT NOT NULL,
             evaluation_notes TEXT
         );
         CREATE INDEX IF NOT EXISTS idx_interactions_agent_version_created
             ON interaction_history (agent_id, version_id, created_at);

         CREATE TABLE IF NOT EXISTS agent_capabilities (
             id INTEGER PRIMARY KEY AUTOINCREMENT,
             agent_id INTEGER NOT NULL REFERENCES agents(id) ON DELETE CASCADE,
             name TEXT NOT NULL COLLATE NOCASE,
             description TEXT,
             rating REAL NOT NULL DEFAULT 0.5,
             UNIQUE (agent_id, name)
         );

         -- chief_agent_id deliberately has no foreign key: the removal
         -- policy may leave it dangling.
         CREATE TABLE IF NOT EXISTS team_compositions (
             id INTEGER PRIMARY KEY AUTOINCREMENT,
             name TEXT NOT NULL COLLATE NOCASE UNIQUE,
             chief_agent_id INTEGER NOT NULL,
             description TEXT,
             created_at TEXT NOT NULL,
             performance_score REAL NOT NULL DEFAULT 0
         );

         CREATE TABLE IF NOT EXISTS team_members (
             team_id INTEGER NOT NULL
                 REFERENCES team_compositions(id) ON DELETE CASCADE,
             agent_id INTEGER NOT NULL REFERENCES agents(id) ON DELETE CASCADE,
             role TEXT NOT NULL,
             assignment_reason TEXT,
             performance_in_team REAL NOT NULL DEFAULT 0,
             PRIMARY KEY (team_id, agent_id)
         );

         CREATE TABLE IF NOT EXISTS agent_performance_log (
             id INTEGER PRIMARY KEY AUTOINCREMENT,
             agent_id INTEGER NOT NULL,
             task_type TEXT NOT NULL,
             success INTEGER NOT NULL,
             response_time REAL NOT NULL,
             logged_at TEXT NOT NULL
         );

         CREATE TABLE IF NOT EXISTS performance_summary (
             agent_id INTEGER PRIMARY KEY,
             total_requests INTEGER NOT NULL DEFAULT 0,
             successful_requests INTEGER NOT NULL DEFAULT 0,
             average_response_time REAL NOT NULL DEFAULT 0,
             updated_at TEXT NOT NULL
         );",
    )
}
