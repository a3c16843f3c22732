//! Human-readable frame transcript, written to stderr.
//!
//! The transcript is a side channel: one line per decoded frame (direction
//! arrow, timestamp, kind tag, detail) plus an indented, truncated payload
//! preview for requests and results. It never touches the relayed stream on
//! stdout, so it can be piped, colored, or discarded without disturbing the
//! protocol.

use chrono::Utc;
use serde_json::Value;

use crate::errors::AppError;
use crate::protocol::jsonrpc::{self, Message};
use crate::proxy::rules::SecurityRule;
use crate::proxy::Direction;

/// Payload previews are cut off after this many characters by default.
pub const DEFAULT_TRUNCATE_CHARS: usize = 200;

/// ANSI SGR fragments used by the transcript.
mod sgr {
    pub const RESET: &str = "\x1b[0m";
    pub const DIM: &str = "\x1b[2m";
    pub const RED: &str = "\x1b[31m";
    pub const GREEN: &str = "\x1b[32m";
    pub const YELLOW: &str = "\x1b[33m";
    pub const BLUE: &str = "\x1b[34m";
    pub const MAGENTA: &str = "\x1b[35m";
    pub const CYAN: &str = "\x1b[36m";
}

/// Formats and prints transcript lines.
#[derive(Debug, Clone)]
pub struct FrameTracer {
    color: bool,
    truncate_chars: usize,
}

impl FrameTracer {
    /// A tracer; `color` should be false when stderr is not a terminal.
    #[must_use]
    pub fn new(color: bool, truncate_chars: usize) -> Self {
        Self {
            color,
            truncate_chars,
        }
    }

    /// Print the startup banner: tool name, monitored command, ruler.
    pub fn banner(&self, title: &str, command_line: &str) {
        eprintln!("{}", self.paint(title, sgr::CYAN));
        eprintln!("{}", self.paint(command_line, sgr::DIM));
        eprintln!("{}", self.paint(&"─".repeat(80), sgr::DIM));
    }

    /// Print one decoded frame: the kind line, then the payload preview when
    /// the message carries one.
    pub fn frame(&self, direction: Direction, message: &Message) {
        eprintln!("{}", self.render_frame(direction, message));
        if let Some(preview) = self.render_payload(message) {
            eprintln!("{preview}");
        }
    }

    /// The kind line for one decoded frame.
    #[must_use]
    pub fn render_frame(&self, direction: Direction, message: &Message) -> String {
        let (kind, kind_color, detail) = match message {
            Message::Request(request) => (
                "REQUEST",
                sgr::YELLOW,
                format!("id={} {}", request.id, request.method),
            ),
            Message::Response(response) => match &response.outcome {
                Ok(_) => ("RESULT_RESPONSE", sgr::BLUE, format!("id={}", response.id)),
                Err(error) => (
                    "ERROR_RESPONSE",
                    sgr::RED,
                    format!("id={} [{}] {}", response.id, error.code, error.message),
                ),
            },
            Message::Notification(notification) => {
                ("NOTIFICATION", sgr::CYAN, notification.method.clone())
            }
        };
        self.transcript_line(direction, kind, kind_color, &detail)
    }

    /// The indented payload preview: request params or response result.
    /// Notifications and error responses carry their detail on the kind line.
    #[must_use]
    pub fn render_payload(&self, message: &Message) -> Option<String> {
        let (label, value) = match message {
            Message::Request(request) => ("params", request.params.as_ref()?),
            Message::Response(response) => ("result", response.outcome.as_ref().ok()?),
            Message::Notification(_) => return None,
        };
        let rendered = self.truncate(pretty(value));
        Some(format!(
            "  {}",
            self.paint(&format!("{label}: {rendered}"), sgr::DIM)
        ))
    }

    /// Print a frame that failed to decode. Logged only; the raw bytes were
    /// already forwarded untouched.
    pub fn decode_failure(&self, direction: Direction, error: &AppError, raw: &str) {
        eprintln!(
            "{}",
            self.transcript_line(direction, "UNDECODABLE", sgr::MAGENTA, &error.to_string())
        );
        eprintln!(
            "  {}",
            self.paint(&self.truncate(format!("raw: {raw}")), sgr::DIM)
        );
    }

    /// Print a security alert for a matched rule.
    pub fn violation(&self, rule: &SecurityRule, message: &Message, blocked: bool) {
        let severity = rule.severity.to_string().to_uppercase();
        eprintln!(
            "{}",
            self.paint(
                &format!("🚨 SECURITY VIOLATION [{severity}]: {}", rule.name),
                sgr::RED
            )
        );
        eprintln!("   {}", rule.description);
        let rendered = serde_json::to_string_pretty(&jsonrpc::encode_value(message))
            .unwrap_or_else(|_| jsonrpc::encode(message));
        eprintln!("   Message: {rendered}");
        if blocked {
            eprintln!("   {}", self.paint("Action: frame blocked", sgr::RED));
        }
    }

    fn transcript_line(
        &self,
        direction: Direction,
        kind: &str,
        kind_color: &str,
        detail: &str,
    ) -> String {
        let arrow_color = match direction {
            Direction::ToServer => sgr::GREEN,
            Direction::FromServer => sgr::BLUE,
        };
        let timestamp = Utc::now().format("%H:%M:%S%.3f").to_string();
        format!(
            "{} {} {} {}",
            self.paint(&format!("{:<2}", direction.arrow()), arrow_color),
            self.paint(&timestamp, sgr::DIM),
            self.paint(&format!("{kind:<15}"), kind_color),
            self.paint(detail, kind_color),
        )
    }

    fn paint(&self, text: &str, color: &str) -> String {
        if self.color {
            format!("{color}{text}{}", sgr::RESET)
        } else {
            text.to_owned()
        }
    }

    fn truncate(&self, text: String) -> String {
        if text.chars().count() <= self.truncate_chars {
            return text;
        }
        let cut: String = text.chars().take(self.truncate_chars).collect();
        format!("{cut}\n... (truncated)")
    }
}

fn pretty(value: &Value) -> String {
    serde_json::to_string_pretty(value).unwrap_or_else(|_| value.to_string())
}
