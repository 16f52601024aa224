//! Chief directive parsing.
//!
//! The Chief's reply must END with exactly one directive block; anything after
//! the closing tag is a parse error that is reported back to the Chief as a
//! correction prompt.  The parser is greedy on the *last* occurrence, so
//! directive-shaped text quoted earlier in the reply does not confuse it.
//!
//! Recognised blocks:
//!
//! ```text
//! [ACTIVATION_DIRECTIVES] [ACTIVATE]name:focus[MOD]*[/ACTIVATE] ... [/ACTIVATION_DIRECTIVES]
//! [ACTIVATE_TEAM]teamName:focus[MOD]*[/ACTIVATE_TEAM]
//! [REQUEST_AGENT_CREATION] [NAME]..[/NAME][PURPOSE]..[/PURPOSE]
//!     [CAPABILITIES]c1,c2[/CAPABILITIES][PROMPT]..[/PROMPT] [/REQUEST_AGENT_CREATION]
//! [ACTION_ASK_USER]question[/ACTION_ASK_USER]
//! [FINAL_*]payload[/FINAL_*]
//! [ACTION_HALT]reason[/ACTION_HALT]
//! ```
//!
//! `[MOD]` modifiers on an activation are `[HISTORY_MODE=..]`,
//! `[SESSION_HISTORY_COUNT=N]` (clamped into `0..=25` with a warning),
//! `[PHASE=K]` (K >= 1, default 1), and `[DEPENDS_ON=a,b,..]`.

use crate::conclave::agent_runtime::HistoryMode;
use crate::conclave::config::SESSION_HISTORY_LIMIT;
use std::collections::BTreeSet;
use std::error::Error;
use std::fmt;

/// One parsed `[ACTIVATE]` entry.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ActivationInfo {
    /// Name of the agent to activate.
    pub module_name: String,
    /// The focus instruction handed to the agent.
    pub focus: String,
    /// Which prior messages the agent sees and whether new ones persist.
    pub history_mode: HistoryMode,
    /// Injected transcript length for session-aware activations, `0..=25`.
    pub session_history_count: usize,
    /// Phase bucket; phases run sequentially, activations within one phase
    /// run in parallel.  Always `>= 1`.
    pub execution_phase: u32,
    /// Agents whose current-session activation must complete first.
    pub depends_on: BTreeSet<String>,
}

/// One parsed `[ACTIVATE_TEAM]` entry; expands to one activation per member.
///
/// Expanded activations land in phase 1 with no dependencies unless the team
/// entry overrides them.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct TeamActivationInfo {
    /// Name of the team to activate.
    pub team_name: String,
    /// The focus instruction inherited by every member.
    pub focus: String,
    /// History mode inherited by every member.
    pub history_mode: HistoryMode,
    /// Session-history count inherited by every member.
    pub session_history_count: usize,
    /// Phase bucket inherited by every member.  Defaults to 1.
    pub execution_phase: u32,
    /// Dependencies inherited by every member.  Default empty.
    pub depends_on: BTreeSet<String>,
}

/// A parsed `[REQUEST_AGENT_CREATION]` block.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct AgentCreationRequest {
    /// Name for the new agent.
    pub name: String,
    /// What the agent is for.
    pub purpose: String,
    /// Capability names, possibly empty.
    pub capabilities: Vec<String>,
    /// The full prompt body, verbatim (sub-tags such as `[HEADER]` are kept).
    pub prompt: String,
}

/// The single trailing directive selected from a Chief reply.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Directive {
    /// Schedule the contained activations.
    Activations(Vec<ActivationInfo>),
    /// Expand and schedule a whole team.
    ActivateTeam(TeamActivationInfo),
    /// Create a new agent in the store.
    RequestAgentCreation(AgentCreationRequest),
    /// Forward a question to the external input collaborator.
    AskUser(String),
    /// Terminal result; `tag` is the suffix after `FINAL_`.
    Final {
        /// Tag suffix, e.g. `"ANSWER"` for `[FINAL_ANSWER]`.
        tag: String,
        /// The payload between the tags.
        payload: String,
    },
    /// Stop the session.
    Halt(String),
}

/// Why a Chief reply failed to parse.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ParseError {
    /// No recognised directive block was found.
    NoDirective,
    /// Text follows the closing tag of the final block.
    TrailingText(String),
    /// A block was structurally invalid (missing closing tag, missing
    /// required sub-tags, empty name).
    MalformedBlock(String),
}

impl fmt::Display for ParseError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            ParseError::NoDirective => write!(f, "reply contains no directive block"),
            ParseError::TrailingText(text) => {
                write!(f, "unexpected text after the directive block: {:?}", text)
            }
            ParseError::MalformedBlock(msg) => write!(f, "malformed directive block: {}", msg),
        }
    }
}

impl Error for ParseError {}

/// Substring between `open` and the next matching `close`, searched from
/// `from`.  Returns the inner text plus the index just past `close`.
fn extract_from(text: &str, open: &str, close: &str, from: usize) -> Option<(String, usize)> {
    let start = text[from..].find(open)? + from + open.len();
    let end = text[start..].find(close)? + start;
    Some((text[start..end].to_string(), end + close.len()))
}

/// The last occurrence of `open` in `text`.
fn last_open(text: &str, open: &str) -> Option<usize> {
    text.rfind(open)
}

/// Parse the trailing directive block from a Chief reply.
pub fn parse_directive(text: &str) -> Result<Directive, ParseError> {
    // Locate the last occurrence of each block opener; the right-most one is
    // the directive the reply ends with.
    let candidates: [(&str, usize); 6] = [
        ("[ACTIVATION_DIRECTIVES]", 0),
        ("[ACTIVATE_TEAM]", 1),
        ("[REQUEST_AGENT_CREATION]", 2),
        ("[ACTION_ASK_USER]", 3),
        ("[FINAL_", 4),
        ("[ACTION_HALT]", 5),
    ];
    let mut best: Option<(usize, usize)> = None; // (start, kind)
    for (open, kind) in candidates {
        if let Some(at) = last_open(text, open) {
            if best.map_or(true, |(start, _)| at > start) {
                best = Some((at, kind));
            }
        }
    }
    let (start, kind) = best.ok_or(ParseError::NoDirective)?;

    let (directive, after) = match kind {
        0 => parse_activation_block(text, start)?,
        1 => parse_team_block(text, start)?,
        2 => parse_creation_block(text, start)?,
        3 => {
            let (question, after) = extract_from(text, "[ACTION_ASK_USER]", "[/ACTION_ASK_USER]", start)
                .ok_or_else(|| missing_close("ACTION_ASK_USER"))?;
            (Directive::AskUser(question.trim().to_string()), after)
        }
        4 => parse_final_block(text, start)?,
        _ => {
            let (reason, after) = extract_from(text, "[ACTION_HALT]", "[/ACTION_HALT]", start)
                .ok_or_else(|| missing_close("ACTION_HALT"))?;
            (Directive::Halt(reason.trim().to_string()), after)
        }
    };

    let trailing = text[after..].trim();
    if !trailing.is_empty() {
        return Err(ParseError::TrailingText(preview(trailing)));
    }
    Ok(directive)
}

fn missing_close(tag: &str) -> ParseError {
    ParseError::MalformedBlock(format!("missing [/{}]", tag))
}

/// First ~80 characters, for error messages.
fn preview(text: &str) -> String {
    if text.len() <= 80 {
        text.to_string()
    } else {
        let mut cut = 80;
        while !text.is_char_boundary(cut) {
            cut -= 1;
        }
        format!("{}…", &text[..cut])
    }
}

fn parse_activation_block(text: &str, start: usize) -> Result<(Directive, usize), ParseError> {
    let (body, after) = extract_from(
        text,
        "[ACTIVATION_DIRECTIVES]",
        "[/ACTIVATION_DIRECTIVES]",
        start,
    )
    .ok_or_else(|| missing_close("ACTIVATION_DIRECTIVES"))?;

    let mut activations = Vec::new();
    let mut cursor = 0;
    while let Some((entry, next)) = extract_from(&body, "[ACTIVATE]", "[/ACTIVATE]", cursor) {
        activations.push(parse_activation_entry(&entry)?);
        cursor = next;
    }
    if activations.is_empty() {
        return Err(ParseError::MalformedBlock(
            "activation block contains no [ACTIVATE] entries".to_string(),
        ));
    }
    Ok((Directive::Activations(activations), after))
}

/// Parse `name:focus[MOD]*` inside an `[ACTIVATE]` entry.
fn parse_activation_entry(entry: &str) -> Result<ActivationInfo, ParseError> {
    let head_end = entry.find('[').unwrap_or(entry.len());
    let head = &entry[..head_end];
    let (name, focus) = split_name_focus(head)?;

    let mut info = ActivationInfo {
        module_name: name,
        focus,
        history_mode: HistoryMode::Conversational,
        session_history_count: 0,
        execution_phase: 1,
        depends_on: BTreeSet::new(),
    };
    apply_modifiers(&entry[head_end..], &mut info)?;
    Ok(info)
}

fn split_name_focus(head: &str) -> Result<(String, String), ParseError> {
    let colon = head.find(':').ok_or_else(|| {
        ParseError::MalformedBlock(format!("activation '{}' lacks a name:focus separator", head))
    })?;
    let name = head[..colon].trim();
    let focus = head[colon + 1..].trim();
    if name.is_empty() {
        return Err(ParseError::MalformedBlock(
            "activation has an empty name".to_string(),
        ));
    }
    Ok((name.to_string(), focus.to_string()))
}

/// Apply `[KEY=VALUE]` modifiers to an activation.
fn apply_modifiers(tail: &str, info: &mut ActivationInfo) -> Result<(), ParseError> {
    let mut cursor = 0;
    while let Some(open) = tail[cursor..].find('[') {
        let open = cursor + open;
        let close = match tail[open..].find(']') {
            Some(close) => open + close,
            None => {
                return Err(ParseError::MalformedBlock(format!(
                    "unterminated modifier in '{}'",
                    preview(tail)
                )));
            }
        };
        let modifier = &tail[open + 1..close];
        cursor = close + 1;

        let (key, value) = match modifier.split_once('=') {
            Some((key, value)) => (key.trim(), value.trim()),
            None => {
                log::warn!("Directive: ignoring malformed modifier [{}]", modifier);
                continue;
            }
        };
        match key {
            "HISTORY_MODE" => match HistoryMode::parse(value) {
                Some(mode) => info.history_mode = mode,
                None => {
                    log::warn!("Directive: unknown history mode '{}', keeping default", value);
                }
            },
            "SESSION_HISTORY_COUNT" => {
                info.session_history_count = clamp_history_count(value);
            }
            "PHASE" => match value.parse::<u32>() {
                Ok(phase) if phase >= 1 => info.execution_phase = phase,
                _ => {
                    log::warn!("Directive: invalid phase '{}', defaulting to 1", value);
                    info.execution_phase = 1;
                }
            },
            "DEPENDS_ON" => {
                info.depends_on = value
                    .split(',')
                    .map(str::trim)
                    .filter(|name| !name.is_empty())
                    .map(str::to_string)
                    .collect();
            }
            other => {
                log::warn!("Directive: ignoring unknown modifier '{}'", other);
            }
        }
    }
    Ok(())
}

/// Parse and clamp a session-history count into `0..=25`, warning on
/// out-of-range or unparseable values.
fn clamp_history_count(value: &str) -> usize {
    match value.parse::<i64>() {
        Ok(count) if (0..=SESSION_HISTORY_LIMIT as i64).contains(&count) => count as usize,
        Ok(count) => {
            let clamped = count.clamp(0, SESSION_HISTORY_LIMIT as i64) as usize;
            log::warn!(
                "Directive: session history count {} outside 0..={}, clamped to {}",
                count,
                SESSION_HISTORY_LIMIT,
                clamped
            );
            clamped
        }
        Err(_) => {
            log::warn!("Directive: unparseable session history count '{}', using 0", value);
            0
        }
    }
}

fn parse_team_block(text: &str, start: usize) -> Result<(Directive, usize), ParseError> {
    let (body, after) = extract_from(text, "[ACTIVATE_TEAM]", "[/ACTIVATE_TEAM]", start)
        .ok_or_else(|| missing_close("ACTIVATE_TEAM"))?;

    let head_end = body.find('[').unwrap_or(body.len());
    let (team_name, focus) = split_name_focus(&body[..head_end])?;

    // Team modifiers reuse the activation machinery.
    let mut scratch = ActivationInfo {
        module_name: team_name.clone(),
        focus: focus.clone(),
        history_mode: HistoryMode::Conversational,
        session_history_count: 0,
        execution_phase: 1,
        depends_on: BTreeSet::new(),
    };
    apply_modifiers(&body[head_end..], &mut scratch)?;

    Ok((
        Directive::ActivateTeam(TeamActivationInfo {
            team_name,
            focus,
            history_mode: scratch.history_mode,
            session_history_count: scratch.session_history_count,
            execution_phase: scratch.execution_phase,
            depends_on: scratch.depends_on,
        }),
        after,
    ))
}

fn parse_creation_block(text: &str, start: usize) -> Result<(Directive, usize), ParseError> {
    let (body, after) = extract_from(
        text,
        "[REQUEST_AGENT_CREATION]",
        "[/REQUEST_AGENT_CREATION]",
        start,
    )
    .ok_or_else(|| missing_close("REQUEST_AGENT_CREATION"))?;

    let name = extract_from(&body, "[NAME]", "[/NAME]", 0)
        .map(|(s, _)| s.trim().to_string())
        .ok_or_else(|| ParseError::MalformedBlock("agent creation lacks [NAME]".to_string()))?;
    if name.is_empty() {
        return Err(ParseError::MalformedBlock(
            "agent creation has an empty [NAME]".to_string(),
        ));
    }
    let purpose = extract_from(&body, "[PURPOSE]", "[/PURPOSE]", 0)
        .map(|(s, _)| s.trim().to_string())
        .ok_or_else(|| ParseError::MalformedBlock("agent creation lacks [PURPOSE]".to_string()))?;
    let capabilities = extract_from(&body, "[CAPABILITIES]", "[/CAPABILITIES]", 0)
        .map(|(s, _)| {
            s.split(',')
                .map(str::trim)
                .filter(|c| !c.is_empty())
                .map(str::to_string)
                .collect()
        })
        .unwrap_or_default();
    let prompt = extract_from(&body, "[PROMPT]", "[/PROMPT]", 0)
        .map(|(s, _)| s.trim().to_string())
        .ok_or_else(|| ParseError::MalformedBlock("agent creation lacks [PROMPT]".to_string()))?;

    Ok((
        Directive::RequestAgentCreation(AgentCreationRequest {
            name,
            purpose,
            capabilities,
            prompt,
        }),
        after,
    ))
}

fn parse_final_block(text: &str, start: usize) -> Result<(Directive, usize), ParseError> {
    // start points at "[FINAL_"; recover the full tag name.
    let tag_end = text[start..]
        .find(']')
        .map(|i| start + i)
        .ok_or_else(|| ParseError::MalformedBlock("unterminated [FINAL_*] tag".to_string()))?;
    let tag = text[start + "[FINAL_".len()..tag_end].to_string();
    let open = format!("[FINAL_{}]", tag);
    let close = format!("[/FINAL_{}]", tag);
    let (payload, after) = extract_from(text, &open, &close, start)
        .ok_or_else(|| missing_close(&format!("FINAL_{}", tag)))?;
    Ok((
        Directive::Final {
            tag,
            payload: payload.trim().to_string(),
        },
        after,
    ))
}
