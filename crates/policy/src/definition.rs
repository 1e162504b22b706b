use std::collections::BTreeSet;
use std::time::Duration;

use serde::{Deserialize, Serialize};

use crate::schema::ArgsSchema;

/// Outcome classes a tool can subscribe to for push notifications.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum NotifyTrigger {
    Success,
    Failure,
    NeedConfirm,
}

/// How a tool is carried out once it has passed validation: either a
/// child process built from an argv template, or a named in-process
/// handler registered on the engine at startup.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ToolBackend {
    Command(Vec<String>),
    Builtin(String),
}

/// A single validated tool entry from the policy file.
#[derive(Debug, Clone)]
pub struct ToolDefinition {
    pub name: String,
    pub description: String,
    pub args_schema: ArgsSchema,
    pub backend: ToolBackend,
    pub mutates: bool,
    pub requires_confirm: bool,
    pub timeout_sec: Option<u64>,
    pub max_output_bytes: Option<usize>,
    pub notify: BTreeSet<NotifyTrigger>,
}

impl ToolDefinition {
    /// Confirmation-gated tools are treated as mutating even when the
    /// author forgot to mark them, so the audit trail never understates
    /// what a call could have changed.
    pub fn is_mutating(&self) -> bool {
        self.mutates || self.requires_confirm
    }

    pub fn timeout(&self, default_sec: u64) -> Duration {
        Duration::from_secs(self.timeout_sec.unwrap_or(default_sec))
    }

    pub fn output_cap(&self, default_bytes: usize) -> usize {
        self.max_output_bytes.unwrap_or(default_bytes)
    }

    pub fn notifies_on(&self, trigger: NotifyTrigger) -> bool {
        self.notify.contains(&trigger)
    }
}

/// Extracts `{name}` placeholders from one argv template element.
///
/// A placeholder is a brace-wrapped identifier (`[A-Za-z_][A-Za-z0-9_]*`).
/// Brace pairs that do not wrap a plain identifier are left alone, so
/// literal braces in commands survive as long as they do not look like
/// an argument reference.
pub fn placeholders(element: &str) -> Vec<String> {
    let mut found = Vec::new();
    let bytes = element.as_bytes();
    let mut i = 0;
    while i < bytes.len() {
        if bytes[i] != b'{' {
            i += 1;
            continue;
        }
        let start = i + 1;
        let mut end = start;
        while end < bytes.len() && bytes[end] != b'}' && bytes[end] != b'{' {
            end += 1;
        }
        if end < bytes.len() && bytes[end] == b'}' && is_identifier(&element[start..end]) {
            found.push(element[start..end].to_string());
            i = end + 1;
        } else {
            i = start;
        }
    }
    found
}

fn is_identifier(s: &str) -> bool {
    let mut chars = s.chars();
    match chars.next() {
        Some(c) if c.is_ascii_alphabetic() || c == '_' => {}
        _ => return false,
    }
    chars.all(|c| c.is_ascii_alphanumeric() || c == '_')
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_placeholder_extraction() {
        assert_eq!(placeholders("{message}"), vec!["message"]);
        assert_eq!(placeholders("--msg={message}"), vec!["message"]);
        assert_eq!(placeholders("{a}:{b}"), vec!["a", "b"]);
    }

    #[test]
    fn test_non_placeholder_braces_ignored() {
        assert!(placeholders("plain").is_empty());
        assert!(placeholders("{print $1}").is_empty());
        assert!(placeholders("{}").is_empty());
        assert!(placeholders("{1abc}").is_empty());
    }

    #[test]
    fn test_unclosed_brace() {
        assert!(placeholders("{message").is_empty());
        assert_eq!(placeholders("{{inner}"), vec!["inner"]);
    }

    #[test]
    fn test_confirm_gated_tool_counts_as_mutating() {
        let def = ToolDefinition {
            name: "t".into(),
            description: "d".into(),
            args_schema: ArgsSchema::default(),
            backend: ToolBackend::Builtin("h".into()),
            mutates: false,
            requires_confirm: true,
            timeout_sec: None,
            max_output_bytes: None,
            notify: BTreeSet::new(),
        };
        assert!(def.is_mutating());
    }
}
