//! Relay tasks: pumps, writers, and the inspector.
//!
//! A session wires four small tasks per direction pair:
//!
//! - one **pump** per direction reads the source stream and hands bytes to
//!   the destination's writer channel;
//! - one **writer** per destination drains its channel into the sink, one
//!   queued chunk at a time, so a frame is never interleaved mid-write; in
//!   gated mode the writer also drains a reply channel of synthesized block
//!   responses, but its lifetime follows the forward channel alone, so a
//!   source hangup always reaches the destination as EOF;
//! - one shared **inspector** consumes copies of everything on a side
//!   channel, assembles frames, decodes them, traces them, and evaluates
//!   security rules.
//!
//! The forwarding path is the source of truth. In chunk mode (passive, or
//! active with warn-only rules) the pump forwards raw chunks verbatim and
//! inspection rides a copy, so the relayed bytes are exactly the received
//! bytes. Only when a blocking rule is registered does the pump switch to
//! frame gating, where forwarding is per assembled frame and a matching
//! frame can be withheld.
//!
//! All tasks exit on stream closure; channel closure then cascades through
//! the writers and the inspector, which returns the session's counters and
//! violations.

use std::sync::Arc;

use tokio::io::{AsyncRead, AsyncReadExt, AsyncWrite, AsyncWriteExt};
use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tracing::{debug, warn};

use crate::protocol::framing::FrameAssembler;
use crate::protocol::jsonrpc::{self, error_codes, ErrorObject, Message, Response};
use crate::proxy::report::{SessionStats, Violation};
use crate::proxy::rules::{RuleAction, RuleRegistry};
use crate::proxy::trace::FrameTracer;
use crate::proxy::{Direction, ProxyMode};

/// Pump read buffer size.
const READ_CHUNK_BYTES: usize = 8 * 1024;

/// What the pumps feed the inspector.
#[derive(Debug)]
pub enum InspectEvent {
    /// Raw bytes copied from a chunk-mode pump; framing happens in the
    /// inspector.
    Chunk {
        /// Direction the bytes were traveling.
        direction: Direction,
        /// Verbatim copy of the forwarded chunk.
        bytes: Vec<u8>,
    },
    /// A complete frame a gating pump forwarded.
    Frame {
        /// Direction the frame was traveling.
        direction: Direction,
        /// The frame text, delimiter stripped.
        line: String,
    },
    /// A complete frame a gating pump suppressed.
    Blocked {
        /// Direction the frame was traveling.
        direction: Direction,
        /// The frame text, delimiter stripped.
        line: String,
    },
}

// ── Writers ───────────────────────────────────────────────────────────────────

/// Drain `rx` into `sink`, flushing after every chunk so frames reach the
/// peer promptly. Exits when the channel closes or the sink fails; dropping
/// the sink is what signals EOF to the peer.
pub fn spawn_writer<W>(mut sink: W, mut rx: mpsc::UnboundedReceiver<Vec<u8>>) -> JoinHandle<()>
where
    W: AsyncWrite + Unpin + Send + 'static,
{
    tokio::spawn(async move {
        while let Some(chunk) = rx.recv().await {
            if let Err(err) = write_chunk(&mut sink, &chunk).await {
                debug!(%err, "relay sink closed, stopping writer");
                break;
            }
        }
    })
}

/// Gated-mode writer: drains the forward channel and a separate reply
/// channel carrying synthesized block responses from the opposite pump.
///
/// Lifetime follows the *forward* channel alone: when the forwarding source
/// hangs up, the writer exits and drops the sink, propagating EOF to the
/// peer even though the opposite pump (and thus the reply sender) may still
/// be running. Replies only matter while the peer is in the conversation,
/// and the peer's side of it just ended.
pub fn spawn_gated_writer<W>(
    mut sink: W,
    mut forward_rx: mpsc::UnboundedReceiver<Vec<u8>>,
    mut reply_rx: mpsc::UnboundedReceiver<Vec<u8>>,
) -> JoinHandle<()>
where
    W: AsyncWrite + Unpin + Send + 'static,
{
    tokio::spawn(async move {
        loop {
            let chunk = tokio::select! {
                forward = forward_rx.recv() => match forward {
                    Some(chunk) => chunk,
                    None => break,
                },
                Some(chunk) = reply_rx.recv() => chunk,
            };
            if let Err(err) = write_chunk(&mut sink, &chunk).await {
                debug!(%err, "relay sink closed, stopping gated writer");
                break;
            }
        }
    })
}

async fn write_chunk<W>(sink: &mut W, chunk: &[u8]) -> std::io::Result<()>
where
    W: AsyncWrite + Unpin + Send,
{
    sink.write_all(chunk).await?;
    sink.flush().await
}

// ── Pumps ─────────────────────────────────────────────────────────────────────

/// Read `source` in chunks, forward each chunk verbatim, and copy it to the
/// inspector. The forwarded bytes are authoritative; inspection can never
/// delay, reorder, or alter them.
pub fn spawn_chunk_pump<R>(
    mut source: R,
    direction: Direction,
    forward_tx: mpsc::UnboundedSender<Vec<u8>>,
    inspect_tx: mpsc::UnboundedSender<InspectEvent>,
) -> JoinHandle<()>
where
    R: AsyncRead + Unpin + Send + 'static,
{
    tokio::spawn(async move {
        let mut buf = vec![0_u8; READ_CHUNK_BYTES];
        loop {
            match source.read(&mut buf).await {
                Ok(0) => break,
                Ok(n) => {
                    let chunk = buf[..n].to_vec();
                    if forward_tx.send(chunk.clone()).is_err() {
                        break;
                    }
                    let _ = inspect_tx.send(InspectEvent::Chunk {
                        direction,
                        bytes: chunk,
                    });
                }
                Err(err) => {
                    warn!(%err, direction = %direction, "relay read failed");
                    break;
                }
            }
        }
        debug!(direction = %direction, "relay pump finished");
    })
}

/// Read `source` in chunks but forward per assembled frame, withholding any
/// frame a blocking rule matches. A blocked request is answered toward its
/// sender with a synthesized error response on `reply_tx` so the sender is
/// not left waiting on a correlation id that will never resolve.
///
/// Frames that fail to decode flow through untouched; rules only judge what
/// they can read. Trailing bytes that never formed a frame are forwarded
/// verbatim at EOF.
pub fn spawn_frame_pump<R>(
    mut source: R,
    direction: Direction,
    forward_tx: mpsc::UnboundedSender<Vec<u8>>,
    reply_tx: mpsc::UnboundedSender<Vec<u8>>,
    rules: Arc<RuleRegistry>,
    inspect_tx: mpsc::UnboundedSender<InspectEvent>,
) -> JoinHandle<()>
where
    R: AsyncRead + Unpin + Send + 'static,
{
    tokio::spawn(async move {
        let mut assembler = FrameAssembler::default();
        let mut discarded = 0_u64;
        let mut buf = vec![0_u8; READ_CHUNK_BYTES];
        'read: loop {
            match source.read(&mut buf).await {
                Ok(0) => break,
                Ok(n) => {
                    for line in assembler.feed(&buf[..n]) {
                        if !gate_frame(line, direction, &forward_tx, &reply_tx, &rules, &inspect_tx)
                        {
                            break 'read;
                        }
                    }
                    if assembler.oversized() > discarded {
                        discarded = assembler.oversized();
                        warn!(direction = %direction, "oversized frame discarded before inspection");
                    }
                }
                Err(err) => {
                    warn!(%err, direction = %direction, "relay read failed");
                    break;
                }
            }
        }
        if let Some(tail) = assembler.finish() {
            // never formed a frame, so the rules cannot judge it
            let _ = forward_tx.send(tail.into_bytes());
        }
        debug!(direction = %direction, "relay pump finished");
    })
}

/// Forward one assembled frame unless a blocking rule matches it. Returns
/// `false` when the forward channel is gone and the pump should stop.
fn gate_frame(
    line: String,
    direction: Direction,
    forward_tx: &mpsc::UnboundedSender<Vec<u8>>,
    reply_tx: &mpsc::UnboundedSender<Vec<u8>>,
    rules: &RuleRegistry,
    inspect_tx: &mpsc::UnboundedSender<InspectEvent>,
) -> bool {
    if let Ok(message) = jsonrpc::decode(&line) {
        let blocking = rules
            .evaluate(&message)
            .into_iter()
            .find(|rule| rule.action == RuleAction::Block);
        if let Some(rule) = blocking {
            if let Message::Request(request) = &message {
                let error = ErrorObject::new(
                    error_codes::RULE_BLOCKED,
                    format!("blocked by security rule '{}'", rule.name),
                );
                let response = Response::error(request.id.clone(), error);
                let mut bytes = jsonrpc::encode_response(&response).into_bytes();
                bytes.push(b'\n');
                let _ = reply_tx.send(bytes);
            }
            let _ = inspect_tx.send(InspectEvent::Blocked { direction, line });
            return true;
        }
    }
    let mut bytes = line.clone().into_bytes();
    bytes.push(b'\n');
    if forward_tx.send(bytes).is_err() {
        return false;
    }
    let _ = inspect_tx.send(InspectEvent::Frame { direction, line });
    true
}

// ── Inspector ─────────────────────────────────────────────────────────────────

/// Consume inspect events until both pumps hang up, then return the
/// session's counters and violations.
pub fn spawn_inspector(
    mode: ProxyMode,
    rules: Arc<RuleRegistry>,
    tracer: FrameTracer,
    mut events: mpsc::UnboundedReceiver<InspectEvent>,
) -> JoinHandle<(SessionStats, Vec<Violation>)> {
    tokio::spawn(async move {
        let mut inspector = Inspector::new(mode, rules, tracer);
        while let Some(event) = events.recv().await {
            inspector.handle(event);
        }
        inspector.finish()
    })
}

/// Single-owner inspection state: per-direction assemblers, counters, and
/// the violation list. Living in one task keeps the transcript unscrambled
/// and the counters free of locks.
struct Inspector {
    mode: ProxyMode,
    rules: Arc<RuleRegistry>,
    tracer: FrameTracer,
    to_server: FrameAssembler,
    from_server: FrameAssembler,
    stats: SessionStats,
    violations: Vec<Violation>,
}

impl Inspector {
    fn new(mode: ProxyMode, rules: Arc<RuleRegistry>, tracer: FrameTracer) -> Self {
        Self {
            mode,
            rules,
            tracer,
            to_server: FrameAssembler::default(),
            from_server: FrameAssembler::default(),
            stats: SessionStats::default(),
            violations: Vec::new(),
        }
    }

    fn handle(&mut self, event: InspectEvent) {
        match event {
            InspectEvent::Chunk { direction, bytes } => {
                self.stats.record_bytes(direction, bytes.len());
                let frames = match direction {
                    Direction::ToServer => self.to_server.feed(&bytes),
                    Direction::FromServer => self.from_server.feed(&bytes),
                };
                for line in frames {
                    self.inspect_frame(direction, &line, false);
                }
            }
            InspectEvent::Frame { direction, line } => {
                self.stats.record_bytes(direction, line.len() + 1);
                self.inspect_frame(direction, &line, false);
            }
            InspectEvent::Blocked { direction, line } => {
                self.stats.record_bytes(direction, line.len() + 1);
                self.inspect_frame(direction, &line, true);
            }
        }
    }

    fn inspect_frame(&mut self, direction: Direction, line: &str, blocked: bool) {
        self.stats.record_frame(direction);
        if blocked {
            self.stats.record_blocked();
        }
        match jsonrpc::decode(line) {
            Ok(message) => {
                self.tracer.frame(direction, &message);
                if self.mode == ProxyMode::Active {
                    for rule in self.rules.evaluate(&message) {
                        self.tracer.violation(rule, &message, blocked);
                        self.violations.push(Violation::new(rule, direction, &message));
                    }
                }
            }
            Err(err) => {
                self.stats.record_decode_failure();
                self.tracer.decode_failure(direction, &err, line);
            }
        }
    }

    fn finish(self) -> (SessionStats, Vec<Violation>) {
        // trailing partial input never became a frame; nothing to inspect
        (self.stats, self.violations)
    }
}
