//! Inbound command parser.
//!
//! Raw channel text degrades gracefully: anything without a recognized
//! prefix is a chat command carrying the original text, so the orchestrator
//! always has something to route.

use serde::Serialize;
use std::fmt;

/// Marker a sender writes to state a structured field has no value.
/// Normalized to absent, never to an empty string.
const MISSING_FIELD_SENTINEL: &str = "<none>";

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum CommandKind {
    Chat,
    Task,
    Project,
    Approve,
    Deny,
    Status,
    History,
    Health,
    SystemControl,
}

impl CommandKind {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Chat => "chat",
            Self::Task => "task",
            Self::Project => "project",
            Self::Approve => "approve",
            Self::Deny => "deny",
            Self::Status => "status",
            Self::History => "history",
            Self::Health => "health",
            Self::SystemControl => "system_control",
        }
    }

    /// Mutating kinds can change external state and must pass the approval
    /// gate before the connector sees them.
    pub fn is_mutating(&self) -> bool {
        matches!(self, Self::Task | Self::Project)
    }

    pub fn is_approval_control(&self) -> bool {
        matches!(self, Self::Approve | Self::Deny)
    }
}

impl fmt::Display for CommandKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ParsedCommand {
    pub kind: CommandKind,
    /// Remaining free text after prefix/selector extraction. For chat this
    /// is the original text unchanged.
    pub payload: String,
    /// `@alias` workspace selector, stripped from the payload.
    pub workspace: Option<String>,
    /// Approval/run id argument for approve/deny and system cancel.
    pub target: Option<String>,
    /// Structured due field for tasks. `Some` is always non-empty; the
    /// `<none>` sentinel and a missing field both normalize to `None`.
    pub due: Option<String>,
}

/// Parse one normalized inbound item. Title-bearing channels contribute the
/// title ahead of the body so a command in a mail subject routes correctly.
/// Never fails.
pub fn parse(title: Option<&str>, body: &str) -> ParsedCommand {
    let composed = compose(title, body);
    let (text, workspace) = extract_workspace(&composed);
    let trimmed = text.trim();

    if let Some(rest) = strip_prefix_ci(trimmed, "task:") {
        let (payload, due) = extract_due(rest.trim());
        return ParsedCommand {
            kind: CommandKind::Task,
            payload,
            workspace,
            target: None,
            due,
        };
    }
    if let Some(rest) = strip_prefix_ci(trimmed, "project:") {
        return ParsedCommand {
            kind: CommandKind::Project,
            payload: rest.trim().to_string(),
            workspace,
            target: None,
            due: None,
        };
    }
    if let Some(rest) = strip_prefix_ci(trimmed, "system:") {
        return ParsedCommand {
            kind: CommandKind::SystemControl,
            payload: rest.trim().to_string(),
            workspace,
            target: None,
            due: None,
        };
    }
    if let Some(rest) = strip_prefix_ci(trimmed, "chat:") {
        return ParsedCommand {
            kind: CommandKind::Chat,
            payload: rest.trim().to_string(),
            workspace,
            target: None,
            due: None,
        };
    }

    let mut words = trimmed.split_whitespace();
    let first = words.next().unwrap_or_default();
    let rest = words.collect::<Vec<_>>().join(" ");
    match first.to_ascii_lowercase().as_str() {
        "approve" => {
            return ParsedCommand {
                kind: CommandKind::Approve,
                payload: String::new(),
                workspace,
                target: non_empty(&rest),
                due: None,
            };
        }
        "deny" => {
            return ParsedCommand {
                kind: CommandKind::Deny,
                payload: String::new(),
                workspace,
                target: non_empty(&rest),
                due: None,
            };
        }
        "status" if rest.is_empty() => {
            return ParsedCommand {
                kind: CommandKind::Status,
                payload: String::new(),
                workspace,
                target: None,
                due: None,
            };
        }
        "history" => {
            return ParsedCommand {
                kind: CommandKind::History,
                payload: String::new(),
                workspace,
                target: non_empty(&rest),
                due: None,
            };
        }
        "health" if rest.is_empty() => {
            return ParsedCommand {
                kind: CommandKind::Health,
                payload: String::new(),
                workspace,
                target: None,
                due: None,
            };
        }
        _ => {}
    }

    // Unrecognized input is chat with the (selector-stripped) text intact.
    ParsedCommand {
        kind: CommandKind::Chat,
        payload: trimmed.to_string(),
        workspace,
        target: None,
        due: None,
    }
}

fn compose(title: Option<&str>, body: &str) -> String {
    match title.map(str::trim).filter(|t| !t.is_empty()) {
        Some(title) if body.trim().is_empty() => title.to_string(),
        Some(title) => format!("{title}\n\n{}", body.trim()),
        None => body.trim().to_string(),
    }
}

/// Pull the first `@alias` token out of the text. The alias may appear
/// anywhere; the remaining text is re-joined without it.
fn extract_workspace(text: &str) -> (String, Option<String>) {
    let mut alias = None;
    let mut kept: Vec<&str> = Vec::new();
    for token in text.split_whitespace() {
        if alias.is_none() {
            if let Some(candidate) = token.strip_prefix('@') {
                let candidate = candidate.trim_end_matches([',', ':', ';', '.']);
                if !candidate.is_empty()
                    && candidate
                        .chars()
                        .all(|ch| ch.is_ascii_alphanumeric() || ch == '-' || ch == '_')
                {
                    alias = Some(candidate.to_ascii_lowercase());
                    continue;
                }
            }
        }
        kept.push(token);
    }
    if alias.is_none() {
        return (text.to_string(), None);
    }
    (kept.join(" "), alias)
}

/// Extract a trailing `due: <value>` field from a task payload. Only a
/// whole-word `due:` counts, so "overdue: reports" stays in the payload.
fn extract_due(payload: &str) -> (String, Option<String>) {
    let lower = payload.to_ascii_lowercase();
    let Some(pos) = lower
        .rfind("due:")
        .filter(|&pos| pos == 0 || lower[..pos].ends_with(char::is_whitespace))
    else {
        return (payload.to_string(), None);
    };
    let value = payload[pos + "due:".len()..].trim();
    let head = payload[..pos].trim().to_string();
    if value.is_empty() || value.eq_ignore_ascii_case(MISSING_FIELD_SENTINEL) {
        return (head, None);
    }
    (head, Some(value.to_string()))
}

fn strip_prefix_ci<'a>(text: &'a str, prefix: &str) -> Option<&'a str> {
    let head = text.get(..prefix.len())?;
    if head.eq_ignore_ascii_case(prefix) {
        return Some(&text[prefix.len()..]);
    }
    None
}

fn non_empty(value: &str) -> Option<String> {
    let trimmed = value.trim();
    if trimmed.is_empty() {
        None
    } else {
        Some(trimmed.to_string())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn unmatched_text_defaults_to_chat_with_text_preserved() {
        let parsed = parse(None, "what's on my calendar today?");
        assert_eq!(parsed.kind, CommandKind::Chat);
        assert_eq!(parsed.payload, "what's on my calendar today?");
        assert!(parsed.workspace.is_none());
    }

    #[test]
    fn prefixes_match_case_insensitively() {
        let parsed = parse(None, "TASK: deploy service");
        assert_eq!(parsed.kind, CommandKind::Task);
        assert_eq!(parsed.payload, "deploy service");

        let parsed = parse(None, "Project: spring cleaning");
        assert_eq!(parsed.kind, CommandKind::Project);
        assert_eq!(parsed.payload, "spring cleaning");
    }

    #[test]
    fn workspace_alias_is_extracted_anywhere_and_stripped() {
        let parsed = parse(None, "task: deploy @work the service");
        assert_eq!(parsed.kind, CommandKind::Task);
        assert_eq!(parsed.workspace.as_deref(), Some("work"));
        assert_eq!(parsed.payload, "deploy the service");
    }

    #[test]
    fn approve_and_deny_carry_a_target_id() {
        let parsed = parse(None, "approve 3f6c2a");
        assert_eq!(parsed.kind, CommandKind::Approve);
        assert_eq!(parsed.target.as_deref(), Some("3f6c2a"));

        let parsed = parse(None, "DENY 3f6c2a");
        assert_eq!(parsed.kind, CommandKind::Deny);
        assert_eq!(parsed.target.as_deref(), Some("3f6c2a"));

        let parsed = parse(None, "approve");
        assert_eq!(parsed.kind, CommandKind::Approve);
        assert!(parsed.target.is_none());
    }

    #[test]
    fn due_sentinel_normalizes_to_absent() {
        let parsed = parse(None, "task: water plants due: <none>");
        assert_eq!(parsed.kind, CommandKind::Task);
        assert_eq!(parsed.payload, "water plants");
        assert!(parsed.due.is_none());

        let parsed = parse(None, "task: water plants due: friday");
        assert_eq!(parsed.due.as_deref(), Some("friday"));
        assert_eq!(parsed.payload, "water plants");
    }

    #[test]
    fn title_joins_ahead_of_body_for_title_bearing_channels() {
        let parsed = parse(Some("task: book flights"), "");
        assert_eq!(parsed.kind, CommandKind::Task);
        assert_eq!(parsed.payload, "book flights");

        let parsed = parse(Some("Lunch plans"), "let's do noon");
        assert_eq!(parsed.kind, CommandKind::Chat);
        assert_eq!(parsed.payload, "Lunch plans\n\nlet's do noon");
    }

    #[test]
    fn status_with_trailing_text_is_chat_not_status() {
        let parsed = parse(None, "status update please");
        assert_eq!(parsed.kind, CommandKind::Chat);
    }
}
