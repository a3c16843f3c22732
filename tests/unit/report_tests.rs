//! Unit tests for session counters and end-of-session summary rendering.

use serde_json::json;

use mcp_intercept::protocol::jsonrpc::{Message, Response};
use mcp_intercept::proxy::report::{SessionReport, SessionStats, Violation};
use mcp_intercept::proxy::rules::{SecurityRule, Severity};
use mcp_intercept::proxy::{Direction, ProxyMode};

fn never_matches(_: &Message) -> bool {
    false
}

fn sample_rule(name: &str, severity: Severity) -> SecurityRule {
    SecurityRule::new(name, severity, format!("Description of {name}"), never_matches)
}

fn sample_violation(name: &str, severity: Severity) -> Violation {
    let rule = sample_rule(name, severity);
    let message = Message::Response(Response::success(1, json!({})));
    Violation::new(&rule, Direction::FromServer, &message)
}

// ── Counters ──────────────────────────────────────────────────────────────────

/// Frame and byte counters accumulate per direction; totals sum both.
#[test]
fn stats_accumulate_per_direction() {
    let mut stats = SessionStats::default();

    stats.record_frame(Direction::ToServer);
    stats.record_frame(Direction::ToServer);
    stats.record_frame(Direction::FromServer);
    stats.record_bytes(Direction::ToServer, 120);
    stats.record_bytes(Direction::FromServer, 64);
    stats.record_bytes(Direction::FromServer, 36);
    stats.record_decode_failure();
    stats.record_blocked();

    assert_eq!(stats.frames_to_server, 2);
    assert_eq!(stats.frames_from_server, 1);
    assert_eq!(stats.total_frames(), 3);
    assert_eq!(stats.bytes_to_server, 120);
    assert_eq!(stats.bytes_from_server, 100);
    assert_eq!(stats.decode_failures, 1);
    assert_eq!(stats.blocked_frames, 1);
}

/// A violation copies the rule's identity and captures the message method.
#[test]
fn violation_captures_rule_and_message_details() {
    let rule = sample_rule("sample-rule", Severity::High);
    let message = Message::Response(Response::success(5, json!({"tools": []})));

    let violation = Violation::new(&rule, Direction::FromServer, &message);

    assert_eq!(violation.rule, "sample-rule");
    assert_eq!(violation.severity, Severity::High);
    assert_eq!(violation.direction, Direction::FromServer);
    assert!(
        violation.method.is_none(),
        "responses carry no method: {:?}",
        violation.method
    );
    assert_eq!(violation.detail, "Description of sample-rule");
}

// ── Passive summary ───────────────────────────────────────────────────────────

/// The passive summary is a plain statistics block, without the security
/// framing.
#[test]
fn passive_summary_renders_statistics_only() {
    let mut stats = SessionStats::default();
    for _ in 0..3 {
        stats.record_frame(Direction::ToServer);
    }
    for _ in 0..5 {
        stats.record_frame(Direction::FromServer);
    }

    let report = SessionReport {
        mode: ProxyMode::Passive,
        stats,
        violations: Vec::new(),
    };
    let rendered = report.render();

    assert!(rendered.contains("📊 Statistics:"), "got: {rendered}");
    assert!(rendered.contains("Messages sent: 3"), "got: {rendered}");
    assert!(rendered.contains("Messages received: 5"), "got: {rendered}");
    assert!(
        !rendered.contains("SECURITY REPORT"),
        "passive summaries carry no security framing: {rendered}"
    );
    assert!(
        !rendered.contains("Undecodable"),
        "the undecodable line is omitted at zero: {rendered}"
    );
}

/// Decode failures surface in the passive summary once they occur.
#[test]
fn passive_summary_shows_decode_failures_when_present() {
    let mut stats = SessionStats::default();
    stats.record_decode_failure();

    let report = SessionReport {
        mode: ProxyMode::Passive,
        stats,
        violations: Vec::new(),
    };

    assert!(report.render().contains("Undecodable frames: 1"));
}

// ── Security summary ──────────────────────────────────────────────────────────

/// A clean active session renders the all-clear verdict inside the ruler
/// block.
#[test]
fn clean_security_summary_renders_all_clear() {
    let report = SessionReport {
        mode: ProxyMode::Active,
        stats: SessionStats::default(),
        violations: Vec::new(),
    };
    let rendered = report.render();

    assert!(rendered.contains("📊 SECURITY REPORT"), "got: {rendered}");
    assert!(rendered.contains(&"=".repeat(80)), "missing ruler: {rendered}");
    assert!(
        rendered.contains("✅ No security violations detected"),
        "got: {rendered}"
    );
    assert!(
        !rendered.contains("RECOMMENDATION"),
        "a clean session needs no recommendation: {rendered}"
    );
}

/// Violations render as a counted list with severity tags and the final
/// recommendation.
#[test]
fn security_summary_lists_violations_with_verdict() {
    let report = SessionReport {
        mode: ProxyMode::Active,
        stats: SessionStats::default(),
        violations: vec![
            sample_violation("tool-description-injection", Severity::High),
            sample_violation("annotation-suspicious", Severity::Medium),
        ],
    };
    let rendered = report.render();

    assert!(
        rendered.contains("❌ Found 2 security violation(s):"),
        "got: {rendered}"
    );
    assert!(
        rendered.contains("- [high] tool-description-injection: "),
        "got: {rendered}"
    );
    assert!(
        rendered.contains("- [medium] annotation-suspicious: "),
        "got: {rendered}"
    );
    assert!(
        rendered.contains("⚠️  RECOMMENDATION: Do not trust this server"),
        "got: {rendered}"
    );
}

/// Blocked-frame counts surface in the security summary once they occur.
#[test]
fn security_summary_shows_blocked_frames_when_present() {
    let mut stats = SessionStats::default();
    stats.record_blocked();

    let report = SessionReport {
        mode: ProxyMode::Active,
        stats,
        violations: Vec::new(),
    };

    assert!(report.render().contains("Blocked frames: 1"));
}
