//! Picks the backend that services a turn.
//!
//! An explicit switch always wins. Otherwise the model may be asked to name a
//! backend with a `SELECT:<name>` line at the very start of its reply. That
//! line is parsed strictly: anything ambiguous, malformed or naming an
//! unknown backend is ignored and the previous or default backend is used.

use crate::api::ChatMessage;
use crate::core::config::data::BackendConfig;
use std::fmt;

pub const DIRECTIVE_SENTINEL: &str = "SELECT:";

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DecisionSource {
    Explicit,
    Directive,
    Previous,
    Default,
}

impl DecisionSource {
    pub fn as_str(self) -> &'static str {
        match self {
            DecisionSource::Explicit => "explicit",
            DecisionSource::Directive => "directive",
            DecisionSource::Previous => "previous",
            DecisionSource::Default => "default",
        }
    }
}

impl fmt::Display for DecisionSource {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RouterDecision {
    pub backend: String,
    pub source: DecisionSource,
}

impl RouterDecision {
    pub fn new(backend: impl Into<String>, source: DecisionSource) -> Self {
        Self {
            backend: backend.into(),
            source,
        }
    }
}

/// What the start of a model reply says about backend selection.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Directive {
    Select(String),
    Absent,
    /// A sentinel was present but could not be trusted.
    Malformed(String),
}

fn is_backend_name_char(c: char) -> bool {
    c.is_ascii_alphanumeric() || matches!(c, '_' | '-' | '.')
}

/// Parses the selection directive from the first non-blank line of `reply`.
pub fn parse_directive(reply: &str) -> Directive {
    let occurrences = reply.matches(DIRECTIVE_SENTINEL).count();
    let Some(first_line) = reply.lines().map(str::trim).find(|line| !line.is_empty()) else {
        return Directive::Absent;
    };
    let Some(rest) = first_line.strip_prefix(DIRECTIVE_SENTINEL) else {
        return if occurrences == 0 {
            Directive::Absent
        } else {
            Directive::Malformed("directive not at start of reply".to_string())
        };
    };
    if occurrences > 1 {
        return Directive::Malformed("more than one directive".to_string());
    }

    let rest = rest.trim_start();
    let name: String = rest.chars().take_while(|c| is_backend_name_char(*c)).collect();
    let trailing = &rest[name.len()..];
    // A full stop ending the sentence is not part of the name.
    let selected = name.trim_end_matches('.');
    if selected.is_empty() {
        return Directive::Malformed("directive names no backend".to_string());
    }
    // Only whitespace or sentence punctuation may follow the name.
    match trailing.chars().next() {
        None => Directive::Select(selected.to_string()),
        Some(c) if c.is_whitespace() || matches!(c, ',' | ';' | ':' | '!') => {
            Directive::Select(selected.to_string())
        }
        Some(_) => Directive::Malformed(format!("unexpected text after '{name}'")),
    }
}

/// Removes every directive line so it is never shown to the user.
pub fn strip_directive(reply: &str) -> String {
    reply
        .lines()
        .filter(|line| !line.trim_start().starts_with(DIRECTIVE_SENTINEL))
        .collect::<Vec<_>>()
        .join("\n")
        .trim()
        .to_string()
}

/// Fallback when no explicit switch or trusted directive is available.
pub fn fallback(active: Option<&str>, default: Option<&str>) -> Option<RouterDecision> {
    active
        .map(|name| RouterDecision::new(name, DecisionSource::Previous))
        .or_else(|| default.map(|name| RouterDecision::new(name, DecisionSource::Default)))
}

/// Turns a selection reply into a decision, failing closed on anything that
/// does not name a known backend.
pub fn decide_from_reply(
    reply: &str,
    known: &[String],
    active: Option<&str>,
    default: Option<&str>,
) -> Option<RouterDecision> {
    match parse_directive(reply) {
        Directive::Select(name) if known.iter().any(|known| *known == name) => {
            Some(RouterDecision::new(name, DecisionSource::Directive))
        }
        Directive::Select(name) => {
            tracing::debug!(backend = %name, "Directive names an unknown backend");
            fallback(active, default)
        }
        Directive::Malformed(reason) => {
            tracing::debug!(reason = %reason, "Ignoring malformed directive");
            fallback(active, default)
        }
        Directive::Absent => fallback(active, default),
    }
}

/// Messages for the one-shot selection call.
pub fn selection_messages(
    system_message: &str,
    backends: &[BackendConfig],
    active: Option<&str>,
    query: &str,
) -> Vec<ChatMessage> {
    let mut instructions = String::from(system_message.trim());
    instructions.push_str("\n\nAvailable tool backends:\n");
    for backend in backends {
        instructions.push_str(&format!(
            "- {}: {}\n",
            backend.name,
            backend.display_description()
        ));
    }
    if let Some(active) = active {
        instructions.push_str(&format!("Current backend: {active}\n"));
    }
    instructions.push_str(&format!(
        "\nBefore anything else, reply with one line of the form {DIRECTIVE_SENTINEL}<backend> \
naming the backend best suited to the user's request. Use a name from the list exactly."
    ));

    vec![
        ChatMessage::new("system", instructions),
        ChatMessage::new("user", query),
    ]
}
