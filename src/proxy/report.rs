//! Session statistics and the end-of-session summary.
//!
//! Counters accumulate inside the inspector task for the lifetime of one
//! proxy session and are consumed exactly once, when the downstream server
//! exits and the summary is printed to stderr.

use std::fmt::Write as _;

use chrono::{DateTime, Utc};

use crate::protocol::jsonrpc::Message;
use crate::proxy::rules::{SecurityRule, Severity};
use crate::proxy::{Direction, ProxyMode};

/// One matched security rule, recorded for the session report.
#[derive(Debug, Clone)]
pub struct Violation {
    /// Name of the rule that matched.
    pub rule: String,
    /// Severity copied from the rule at match time.
    pub severity: Severity,
    /// Direction the offending frame was traveling.
    pub direction: Direction,
    /// Method of the offending message, when it carried one.
    pub method: Option<String>,
    /// Rule description, shown in the report.
    pub detail: String,
    /// When the match happened.
    pub timestamp: DateTime<Utc>,
}

impl Violation {
    /// Record a match of `rule` against `message`.
    #[must_use]
    pub fn new(rule: &SecurityRule, direction: Direction, message: &Message) -> Self {
        Self {
            rule: rule.name.clone(),
            severity: rule.severity,
            direction,
            method: message.method().map(ToOwned::to_owned),
            detail: rule.description.clone(),
            timestamp: Utc::now(),
        }
    }
}

/// Per-session relay counters.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct SessionStats {
    /// Complete frames observed traveling host → server.
    pub frames_to_server: usize,
    /// Complete frames observed traveling server → host.
    pub frames_from_server: usize,
    /// Frames that did not decode as JSON-RPC.
    pub decode_failures: usize,
    /// Bytes observed traveling host → server.
    pub bytes_to_server: usize,
    /// Bytes observed traveling server → host.
    pub bytes_from_server: usize,
    /// Frames suppressed by a blocking rule.
    pub blocked_frames: usize,
}

impl SessionStats {
    /// Count one complete frame in `direction`.
    pub fn record_frame(&mut self, direction: Direction) {
        match direction {
            Direction::ToServer => self.frames_to_server += 1,
            Direction::FromServer => self.frames_from_server += 1,
        }
    }

    /// Count `len` observed bytes in `direction`.
    pub fn record_bytes(&mut self, direction: Direction, len: usize) {
        match direction {
            Direction::ToServer => self.bytes_to_server += len,
            Direction::FromServer => self.bytes_from_server += len,
        }
    }

    /// Count one frame that failed to decode.
    pub fn record_decode_failure(&mut self) {
        self.decode_failures += 1;
    }

    /// Count one frame suppressed by a blocking rule.
    pub fn record_blocked(&mut self) {
        self.blocked_frames += 1;
    }

    /// Total complete frames across both directions.
    #[must_use]
    pub fn total_frames(&self) -> usize {
        self.frames_to_server + self.frames_from_server
    }
}

/// Everything the summary prints: counters plus the violation list.
#[derive(Debug, Clone)]
pub struct SessionReport {
    /// Whether the session ran passive or active.
    pub mode: ProxyMode,
    /// Relay counters.
    pub stats: SessionStats,
    /// Matched rules, in the order they fired.
    pub violations: Vec<Violation>,
}

impl SessionReport {
    /// Render the summary text. Passive sessions get plain statistics;
    /// active sessions get the full security report with the verdict line.
    #[must_use]
    pub fn render(&self) -> String {
        match self.mode {
            ProxyMode::Passive => self.render_statistics(),
            ProxyMode::Active => self.render_security(),
        }
    }

    /// Print the summary to stderr, keeping the relayed stream untouched.
    pub fn print(&self) {
        eprintln!("{}", self.render());
    }

    fn render_statistics(&self) -> String {
        let mut out = String::new();
        let _ = writeln!(out, "📊 Statistics:");
        let _ = writeln!(out, "  Messages sent: {}", self.stats.frames_to_server);
        let _ = writeln!(out, "  Messages received: {}", self.stats.frames_from_server);
        if self.stats.decode_failures > 0 {
            let _ = writeln!(out, "  Undecodable frames: {}", self.stats.decode_failures);
        }
        out
    }

    fn render_security(&self) -> String {
        let ruler = "=".repeat(80);
        let mut out = String::new();
        let _ = writeln!(out, "{ruler}");
        let _ = writeln!(out, "📊 SECURITY REPORT");
        let _ = writeln!(out, "{ruler}");
        let _ = writeln!(out, "Messages sent: {}", self.stats.frames_to_server);
        let _ = writeln!(out, "Messages received: {}", self.stats.frames_from_server);
        if self.stats.decode_failures > 0 {
            let _ = writeln!(out, "Undecodable frames: {}", self.stats.decode_failures);
        }
        if self.stats.blocked_frames > 0 {
            let _ = writeln!(out, "Blocked frames: {}", self.stats.blocked_frames);
        }
        let _ = writeln!(out);

        if self.violations.is_empty() {
            let _ = writeln!(out, "✅ No security violations detected");
        } else {
            let _ = writeln!(
                out,
                "❌ Found {} security violation(s):",
                self.violations.len()
            );
            let _ = writeln!(out);
            for violation in &self.violations {
                let _ = writeln!(
                    out,
                    "- [{}] {}: {}",
                    violation.severity, violation.rule, violation.detail
                );
            }
            let _ = writeln!(out);
            let _ = writeln!(
                out,
                "⚠️  RECOMMENDATION: Do not trust this server with sensitive operations"
            );
        }
        let _ = write!(out, "{ruler}");
        out
    }
}
