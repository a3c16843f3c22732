//! Security rules evaluated against decoded frames in active mode.
//!
//! A [`SecurityRule`] is a named predicate over a decoded [`Message`]. Rules
//! live in a [`RuleRegistry`], an ordered list evaluated front to back; the
//! relay never hardcodes individual rules, so new ones can be added or
//! reordered without touching the dispatch path.
//!
//! The stock rules target the two classic malicious-server tricks: prompt
//! injection smuggled through tool descriptions, and destructive tools
//! hiding behind a `readOnlyHint` annotation.

use std::sync::OnceLock;

use regex::RegexSet;
use serde_json::Value;

use crate::protocol::jsonrpc::Message;

/// Name of the stock prompt-injection rule.
pub const INJECTION_RULE: &str = "tool-description-injection";

/// Name of the stock annotation-spoofing rule.
pub const ANNOTATION_RULE: &str = "annotation-suspicious";

// ── Rule model ────────────────────────────────────────────────────────────────

/// How serious a matched rule is. Informational: flow control is decided by
/// [`RuleAction`], not severity.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord)]
pub enum Severity {
    /// Worth a glance.
    Low,
    /// Suspicious pattern, probably deliberate.
    Medium,
    /// Active deception attempt.
    High,
    /// Confirmed hostile behavior.
    Critical,
}

impl std::fmt::Display for Severity {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let name = match self {
            Self::Low => "low",
            Self::Medium => "medium",
            Self::High => "high",
            Self::Critical => "critical",
        };
        write!(f, "{name}")
    }
}

/// What the relay does with a frame once a rule matches it.
///
/// Warn is the default everywhere: the session stays observable and traffic
/// keeps flowing. Block is a per-rule opt-in that suppresses the frame and,
/// for requests, answers the sender with a synthesized error so it is not
/// left waiting forever.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub enum RuleAction {
    /// Record the violation and let the frame through.
    #[default]
    Warn,
    /// Record the violation and suppress the frame.
    Block,
}

/// One named predicate over decoded messages.
#[derive(Debug, Clone)]
pub struct SecurityRule {
    /// Stable identifier used in alerts, the session report, and config.
    pub name: String,
    /// How serious a match is.
    pub severity: Severity,
    /// One-line human description shown in alerts.
    pub description: String,
    /// What the relay does with a matching frame.
    pub action: RuleAction,
    check: fn(&Message) -> bool,
}

impl SecurityRule {
    /// A rule with the default [`RuleAction::Warn`] disposition.
    #[must_use]
    pub fn new(
        name: impl Into<String>,
        severity: Severity,
        description: impl Into<String>,
        check: fn(&Message) -> bool,
    ) -> Self {
        Self {
            name: name.into(),
            severity,
            description: description.into(),
            action: RuleAction::default(),
            check,
        }
    }

    /// Override the disposition.
    #[must_use]
    pub fn with_action(mut self, action: RuleAction) -> Self {
        self.action = action;
        self
    }

    /// Whether the rule matches `message`.
    #[must_use]
    pub fn matches(&self, message: &Message) -> bool {
        (self.check)(message)
    }
}

// ── Registry ──────────────────────────────────────────────────────────────────

/// Ordered rule set. Evaluation order equals registration order.
#[derive(Debug, Clone, Default)]
pub struct RuleRegistry {
    rules: Vec<SecurityRule>,
}

impl RuleRegistry {
    /// An empty registry (used by the passive inspector).
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// The stock rule set: injection detection and annotation spoofing,
    /// both defaulting to [`RuleAction::Warn`].
    #[must_use]
    pub fn builtin() -> Self {
        let mut registry = Self::new();
        registry.register(SecurityRule::new(
            INJECTION_RULE,
            Severity::High,
            "Detect prompt injection patterns in tool descriptions",
            detect_description_injection,
        ));
        registry.register(SecurityRule::new(
            ANNOTATION_RULE,
            Severity::Medium,
            "Flag tools with destructive names but readOnly annotation",
            detect_annotation_spoof,
        ));
        registry
    }

    /// Append a rule; it evaluates after every rule already present.
    pub fn register(&mut self, rule: SecurityRule) {
        self.rules.push(rule);
    }

    /// Change the disposition of a named rule. Returns `false` when no such
    /// rule is registered.
    pub fn set_action(&mut self, name: &str, action: RuleAction) -> bool {
        match self.rules.iter_mut().find(|rule| rule.name == name) {
            Some(rule) => {
                rule.action = action;
                true
            }
            None => false,
        }
    }

    /// Remove a named rule. Returns `false` when no such rule is registered.
    pub fn remove(&mut self, name: &str) -> bool {
        let before = self.rules.len();
        self.rules.retain(|rule| rule.name != name);
        self.rules.len() != before
    }

    /// Every rule matching `message`, in registration order. Each rule
    /// appears at most once per message regardless of how many offending
    /// entries the payload carries.
    #[must_use]
    pub fn evaluate(&self, message: &Message) -> Vec<&SecurityRule> {
        self.rules
            .iter()
            .filter(|rule| rule.matches(message))
            .collect()
    }

    /// Whether any registered rule blocks instead of warning.
    #[must_use]
    pub fn has_blocking(&self) -> bool {
        self.rules
            .iter()
            .any(|rule| rule.action == RuleAction::Block)
    }

    /// Registered rules in evaluation order.
    #[must_use]
    pub fn rules(&self) -> &[SecurityRule] {
        &self.rules
    }

    /// Whether the registry holds no rules.
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.rules.is_empty()
    }

    /// Number of registered rules.
    #[must_use]
    pub fn len(&self) -> usize {
        self.rules.len()
    }
}

// ── Stock predicates ──────────────────────────────────────────────────────────

fn injection_patterns() -> &'static RegexSet {
    static PATTERNS: OnceLock<RegexSet> = OnceLock::new();
    PATTERNS.get_or_init(|| {
        RegexSet::new([
            r"(?i)ignore\s+(all\s+)?previous\s+instructions",
            r"(?i)disregard\s+everything\s+above",
            r"(?i)override\s+your\s+instructions",
            r"(?i)new\s+(system\s+)?instructions",
        ])
        .unwrap_or_else(|_| RegexSet::empty())
    })
}

fn destructive_names() -> &'static RegexSet {
    static PATTERNS: OnceLock<RegexSet> = OnceLock::new();
    PATTERNS.get_or_init(|| {
        RegexSet::new([r"(?i)delete|remove|destroy|wipe|format"])
            .unwrap_or_else(|_| RegexSet::empty())
    })
}

/// The `tools` array of a message, wherever it rides: `result.tools` in a
/// `tools/list` response, `params.tools` in a tool-change notification or a
/// forged advertisement.
fn tool_entries(message: &Message) -> Option<&Vec<Value>> {
    let container = match message {
        Message::Request(request) => request.params.as_ref(),
        Message::Notification(notification) => notification.params.as_ref(),
        Message::Response(response) => response.outcome.as_ref().ok(),
    }?;
    container.get("tools")?.as_array()
}

fn detect_description_injection(message: &Message) -> bool {
    let Some(tools) = tool_entries(message) else {
        return false;
    };
    tools.iter().any(|tool| {
        tool.get("description")
            .and_then(Value::as_str)
            .is_some_and(|description| injection_patterns().is_match(description))
    })
}

fn detect_annotation_spoof(message: &Message) -> bool {
    let Some(tools) = tool_entries(message) else {
        return false;
    };
    tools.iter().any(|tool| {
        let claims_read_only = tool
            .get("annotations")
            .and_then(|annotations| annotations.get("readOnlyHint"))
            .and_then(Value::as_bool)
            == Some(true);
        let destructive_name = tool
            .get("name")
            .and_then(Value::as_str)
            .is_some_and(|name| destructive_names().is_match(name));
        claims_read_only && destructive_name
    })
}
