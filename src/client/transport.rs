//! Child-process stdio transport with request/response correlation.
//!
//! Owns a spawned MCP server process and multiplexes JSON-RPC traffic over
//! its stdin/stdout:
//!
//! - one **writer task** drains an outbound queue, so concurrent callers can
//!   never interleave bytes inside a frame;
//! - one **reader task** drives a [`FramedRead`] over stdout, resolving
//!   responses against the pending table and handing every other inbound
//!   message to the caller's inbound channel;
//! - one **sweeper task** expires overdue pending requests in a single
//!   periodic pass over the arena — there is no per-request timer;
//! - one **exit monitor** polls the child and fails everything in flight
//!   when the process dies.
//!
//! All four wind down through a shared [`CancellationToken`]. The same
//! machinery runs over arbitrary streams via [`StdioTransport::over_streams`]
//! (in-memory duplex pipes in tests), in which case only the process-bound
//! pieces are absent.

use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, AtomicI64, Ordering};
use std::sync::Arc;
use std::time::Duration;

use futures_util::StreamExt;
use serde_json::Value;
use tokio::io::{AsyncRead, AsyncWrite, AsyncWriteExt};
use tokio::process::{Child, Command};
use tokio::sync::{mpsc, oneshot, Mutex};
use tokio::time::Instant;
use tokio_util::codec::FramedRead;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use crate::protocol::framing::LineFrameCodec;
use crate::protocol::jsonrpc::{self, Message, Notification, Request, RequestId};
use crate::{AppError, Result};

/// Default deadline for a correlated request.
pub const DEFAULT_REQUEST_TIMEOUT: Duration = Duration::from_secs(30);

/// Interval between sweeps of the pending-request arena.
const SWEEP_INTERVAL: Duration = Duration::from_millis(100);

/// Interval between child-exit polls.
const EXIT_POLL_INTERVAL: Duration = Duration::from_millis(200);

/// Grace period between SIGTERM and SIGKILL during [`StdioTransport::stop`].
const SHUTDOWN_GRACE: Duration = Duration::from_secs(5);

// ── Options ───────────────────────────────────────────────────────────────────

/// Configuration for connecting a transport to a server process.
#[derive(Debug, Clone)]
pub struct TransportOptions {
    /// Server executable to spawn.
    pub command: String,
    /// Arguments passed to the server executable.
    pub args: Vec<String>,
    /// Deadline applied to [`StdioTransport::request`].
    pub request_timeout: Duration,
}

impl TransportOptions {
    /// Options for `command` with the default request timeout.
    #[must_use]
    pub fn new(command: impl Into<String>, args: Vec<String>) -> Self {
        Self {
            command: command.into(),
            args,
            request_timeout: DEFAULT_REQUEST_TIMEOUT,
        }
    }
}

// ── Pending arena ─────────────────────────────────────────────────────────────

/// One in-flight request awaiting its correlated response.
#[derive(Debug)]
struct PendingEntry {
    /// Method name, for timeout diagnostics.
    method: String,
    /// Absolute expiry instant enforced by the sweeper.
    deadline: Instant,
    /// Resolver; consumed exactly once by response, timeout, or close.
    tx: oneshot::Sender<Result<Value>>,
}

/// Shared arena of in-flight requests keyed by correlation id.
type PendingArena = Arc<Mutex<HashMap<RequestId, PendingEntry>>>;

// ── Transport ─────────────────────────────────────────────────────────────────

/// Correlated JSON-RPC transport over a child process's stdio (or any
/// byte-stream pair).
#[derive(Debug)]
pub struct StdioTransport {
    /// Short id carried on every log line of this transport's tasks.
    transport_id: String,
    write_tx: mpsc::UnboundedSender<String>,
    pending: PendingArena,
    next_id: AtomicI64,
    inbound_rx: Option<mpsc::UnboundedReceiver<Message>>,
    cancel: CancellationToken,
    child: Arc<Mutex<Option<Child>>>,
    closed: Arc<AtomicBool>,
    request_timeout: Duration,
}

impl StdioTransport {
    /// Spawn the server process described by `options` and wire the
    /// transport over its stdio.
    ///
    /// The child is launched with piped stdin/stdout, inherited stderr (its
    /// diagnostics interleave with ours on the terminal), and
    /// `kill_on_drop` as a last-resort cleanup.
    ///
    /// # Errors
    ///
    /// Returns [`AppError::Spawn`] when the process cannot be started or a
    /// stdio pipe cannot be captured. Spawn failure is fatal: no transport
    /// is constructed.
    pub async fn connect(options: &TransportOptions) -> Result<Self> {
        let mut cmd = Command::new(&options.command);
        cmd.args(&options.args)
            .stdin(std::process::Stdio::piped())
            .stdout(std::process::Stdio::piped())
            .stderr(std::process::Stdio::inherit())
            .kill_on_drop(true);

        let mut child = cmd.spawn().map_err(|err| {
            AppError::Spawn(format!("failed to spawn '{}': {err}", options.command))
        })?;

        let stdin = child
            .stdin
            .take()
            .ok_or_else(|| AppError::Spawn("failed to capture server stdin".into()))?;
        let stdout = child
            .stdout
            .take()
            .ok_or_else(|| AppError::Spawn("failed to capture server stdout".into()))?;

        let transport =
            Self::over_streams(stdout, stdin).with_request_timeout(options.request_timeout);
        info!(
            transport_id = %transport.transport_id,
            command = %options.command,
            pid = ?child.id(),
            "server process spawned"
        );

        *transport.child.lock().await = Some(child);
        spawn_exit_monitor(
            transport.transport_id.clone(),
            Arc::clone(&transport.child),
            Arc::clone(&transport.pending),
            Arc::clone(&transport.closed),
            transport.cancel.clone(),
        );

        Ok(transport)
    }

    /// Wire the transport over an arbitrary read/write pair.
    ///
    /// No process is owned in this mode; closure is detected through EOF on
    /// `reader` or an explicit [`StdioTransport::stop`].
    #[must_use]
    pub fn over_streams<R, W>(reader: R, writer: W) -> Self
    where
        R: AsyncRead + Unpin + Send + 'static,
        W: AsyncWrite + Unpin + Send + 'static,
    {
        let transport_id = uuid::Uuid::new_v4().to_string()[..8].to_owned();
        let (write_tx, write_rx) = mpsc::unbounded_channel();
        let (inbound_tx, inbound_rx) = mpsc::unbounded_channel();
        let pending: PendingArena = Arc::new(Mutex::new(HashMap::new()));
        let cancel = CancellationToken::new();
        let closed = Arc::new(AtomicBool::new(false));

        tokio::spawn(run_writer(
            transport_id.clone(),
            writer,
            write_rx,
            Arc::clone(&pending),
            Arc::clone(&closed),
            cancel.clone(),
        ));
        tokio::spawn(run_reader(
            transport_id.clone(),
            reader,
            inbound_tx,
            Arc::clone(&pending),
            Arc::clone(&closed),
            cancel.clone(),
        ));
        tokio::spawn(run_sweeper(
            transport_id.clone(),
            Arc::clone(&pending),
            cancel.clone(),
        ));

        Self {
            transport_id,
            write_tx,
            pending,
            next_id: AtomicI64::new(1),
            inbound_rx: Some(inbound_rx),
            cancel,
            child: Arc::new(Mutex::new(None)),
            closed,
            request_timeout: DEFAULT_REQUEST_TIMEOUT,
        }
    }

    /// Override the default request timeout (builder style).
    #[must_use]
    pub fn with_request_timeout(mut self, timeout: Duration) -> Self {
        self.request_timeout = timeout;
        self
    }

    /// Send `method` and await its correlated response under the transport's
    /// default timeout.
    ///
    /// # Errors
    ///
    /// See [`StdioTransport::request_with_timeout`].
    pub async fn request(&self, method: &str, params: Option<Value>) -> Result<Value> {
        self.request_with_timeout(method, params, self.request_timeout)
            .await
    }

    /// Send `method` and await its correlated response.
    ///
    /// Ids come from a monotonically increasing counter and are never
    /// reused, so a late response to an expired id can only ever be dropped,
    /// not mis-delivered.
    ///
    /// # Errors
    ///
    /// - [`AppError::Protocol`] when the peer answers with an error object.
    /// - [`AppError::Timeout`] when `timeout` elapses first; the pending
    ///   entry is gone by the time this returns.
    /// - [`AppError::TransportClosed`] when the process exits, the stream
    ///   closes, or the transport is stopped while the request is in flight.
    pub async fn request_with_timeout(
        &self,
        method: &str,
        params: Option<Value>,
        timeout: Duration,
    ) -> Result<Value> {
        if self.closed.load(Ordering::SeqCst) {
            return Err(AppError::TransportClosed("transport stopped".into()));
        }

        let id = RequestId::Number(self.next_id.fetch_add(1, Ordering::SeqCst));
        let request = Request::new(id.clone(), method, params);
        let frame = jsonrpc::encode_request(&request);

        let (tx, rx) = oneshot::channel();
        {
            let mut pending = self.pending.lock().await;
            pending.insert(
                id.clone(),
                PendingEntry {
                    method: method.to_owned(),
                    deadline: Instant::now() + timeout,
                    tx,
                },
            );
        }

        if self.write_tx.send(frame).is_err() {
            // Writer is gone; withdraw the entry we just parked.
            self.pending.lock().await.remove(&id);
            return Err(AppError::TransportClosed(
                "transport stopped before request could be written".into(),
            ));
        }

        // stop() may have drained the arena between the closed check above
        // and the insert; once closed is set the sweeper is cancelled, so an
        // entry parked after the drain has nothing left to reject it.
        // Withdraw it here; a missing entry means something already
        // resolved the oneshot and the await below returns immediately.
        if self.closed.load(Ordering::SeqCst) && self.pending.lock().await.remove(&id).is_some() {
            return Err(AppError::TransportClosed("transport stopped".into()));
        }
        debug!(
            transport_id = %self.transport_id,
            %id,
            method,
            "request enqueued"
        );

        match rx.await {
            Ok(outcome) => outcome,
            // Entry dropped without resolution; treated as closure.
            Err(_) => Err(AppError::TransportClosed(
                "transport stopped while request was in flight".into(),
            )),
        }
    }

    /// Enqueue a fire-and-forget notification.
    ///
    /// # Errors
    ///
    /// Returns [`AppError::TransportClosed`] when the transport has stopped.
    pub fn notify(&self, method: &str, params: Option<Value>) -> Result<()> {
        if self.closed.load(Ordering::SeqCst) {
            return Err(AppError::TransportClosed("transport stopped".into()));
        }
        let frame = jsonrpc::encode_notification(&Notification::new(method, params));
        self.write_tx
            .send(frame)
            .map_err(|_| AppError::TransportClosed("transport stopped".into()))
    }

    /// Take the inbound channel delivering server-initiated requests and
    /// notifications in arrival order.
    ///
    /// Ignoring (or never taking) the channel can never stall response
    /// correlation; undelivered messages simply accumulate until dropped
    /// with the transport.
    pub fn take_inbound(&mut self) -> Option<mpsc::UnboundedReceiver<Message>> {
        self.inbound_rx.take()
    }

    /// Whether the transport has been stopped or lost its peer.
    #[must_use]
    pub fn is_closed(&self) -> bool {
        self.closed.load(Ordering::SeqCst)
    }

    /// Stop the transport: fail everything in flight, stop the tasks, and
    /// shut the child down — SIGTERM first, SIGKILL after a grace period.
    ///
    /// Idempotent; repeated calls are no-ops.
    pub async fn stop(&self) {
        if self.closed.swap(true, Ordering::SeqCst) {
            return;
        }
        fail_all_pending(&self.pending, || {
            AppError::TransportClosed("transport stopped".into())
        })
        .await;
        self.cancel.cancel();

        let child = self.child.lock().await.take();
        if let Some(child) = child {
            shutdown_child(&self.transport_id, child).await;
        }
        info!(transport_id = %self.transport_id, "transport stopped");
    }
}

// ── Tasks ─────────────────────────────────────────────────────────────────────

/// Writer task — drains the outbound queue onto the peer's stdin.
///
/// Exits on cancellation, queue closure, or a write failure (which also
/// fails everything pending, since nothing can complete without a writable
/// pipe).
async fn run_writer<W>(
    transport_id: String,
    mut writer: W,
    mut write_rx: mpsc::UnboundedReceiver<String>,
    pending: PendingArena,
    closed: Arc<AtomicBool>,
    cancel: CancellationToken,
) where
    W: AsyncWrite + Unpin + Send,
{
    loop {
        tokio::select! {
            biased;

            () = cancel.cancelled() => {
                debug!(transport_id, "writer: cancellation received, stopping");
                break;
            }

            frame = write_rx.recv() => {
                let Some(frame) = frame else {
                    debug!(transport_id, "writer: queue closed, stopping");
                    break;
                };
                let mut bytes = frame.into_bytes();
                bytes.push(b'\n');
                if let Err(err) = writer.write_all(&bytes).await {
                    warn!(transport_id, error = %err, "writer: write to peer failed");
                    closed.store(true, Ordering::SeqCst);
                    fail_all_pending(&pending, || {
                        AppError::TransportClosed(format!("write failed: {err}"))
                    })
                    .await;
                    cancel.cancel();
                    break;
                }
            }
        }
    }
}

/// Reader task — decodes inbound frames, resolves responses against the
/// pending arena, and forwards everything else to the inbound channel.
async fn run_reader<R>(
    transport_id: String,
    reader: R,
    inbound_tx: mpsc::UnboundedSender<Message>,
    pending: PendingArena,
    closed: Arc<AtomicBool>,
    cancel: CancellationToken,
) where
    R: AsyncRead + Unpin + Send,
{
    let mut framed = FramedRead::new(reader, LineFrameCodec::new());

    loop {
        tokio::select! {
            biased;

            () = cancel.cancelled() => {
                debug!(transport_id, "reader: cancellation received, stopping");
                break;
            }

            item = framed.next() => {
                match item {
                    None => {
                        debug!(transport_id, "reader: EOF detected");
                        closed.store(true, Ordering::SeqCst);
                        fail_all_pending(&pending, || {
                            AppError::TransportClosed("stream closed".into())
                        })
                        .await;
                        break;
                    }

                    Some(Err(AppError::Codec(ref msg))) => {
                        // Framing-level error (line too long) — log and continue.
                        warn!(
                            transport_id,
                            error = msg.as_str(),
                            "reader: framing error, skipping"
                        );
                    }

                    Some(Err(err)) => {
                        warn!(transport_id, error = %err, "reader: IO error, stopping");
                        closed.store(true, Ordering::SeqCst);
                        fail_all_pending(&pending, || {
                            AppError::TransportClosed(format!("stream error: {err}"))
                        })
                        .await;
                        break;
                    }

                    Some(Ok(line)) => {
                        dispatch_frame(&transport_id, &line, &inbound_tx, &pending).await;
                    }
                }
            }
        }
    }
}

/// Route one decoded frame: responses resolve their pending entry, anything
/// else goes to the inbound channel, undecodable frames are logged and
/// skipped.
async fn dispatch_frame(
    transport_id: &str,
    line: &str,
    inbound_tx: &mpsc::UnboundedSender<Message>,
    pending: &PendingArena,
) {
    match jsonrpc::decode(line) {
        Ok(Message::Response(response)) => {
            let entry = pending.lock().await.remove(&response.id);
            match entry {
                Some(entry) => {
                    let outcome = response
                        .outcome
                        .map_err(AppError::Protocol);
                    // Requester may have given up; nothing left to do then.
                    let _ = entry.tx.send(outcome);
                }
                None => {
                    debug!(
                        transport_id,
                        id = %response.id,
                        "reader: orphan response dropped (no pending request)"
                    );
                }
            }
        }
        Ok(message) => {
            if inbound_tx.send(message).is_err() {
                debug!(transport_id, "reader: inbound channel dropped by caller");
            }
        }
        Err(err) => {
            warn!(
                transport_id,
                error = %err,
                raw_line = %line,
                "reader: undecodable frame, skipping"
            );
        }
    }
}

/// Sweeper task — one periodic pass expiring every overdue pending entry.
async fn run_sweeper(transport_id: String, pending: PendingArena, cancel: CancellationToken) {
    loop {
        tokio::select! {
            biased;

            () = cancel.cancelled() => {
                debug!(transport_id, "sweeper: cancellation received, stopping");
                break;
            }

            () = tokio::time::sleep(SWEEP_INTERVAL) => {}
        }

        let now = Instant::now();
        let expired: Vec<(RequestId, PendingEntry)> = {
            let mut guard = pending.lock().await;
            let ids: Vec<RequestId> = guard
                .iter()
                .filter(|(_, entry)| entry.deadline <= now)
                .map(|(id, _)| id.clone())
                .collect();
            ids.into_iter()
                .filter_map(|id| guard.remove(&id).map(|entry| (id, entry)))
                .collect()
        };

        for (id, entry) in expired {
            warn!(
                transport_id,
                %id,
                method = %entry.method,
                "request timed out"
            );
            let _ = entry.tx.send(Err(AppError::Timeout(format!(
                "request '{}' (id {id}) received no response in time",
                entry.method
            ))));
        }
    }
}

/// Spawn the exit monitor: polls the child and fails everything in flight
/// the moment it is gone.
fn spawn_exit_monitor(
    transport_id: String,
    child: Arc<Mutex<Option<Child>>>,
    pending: PendingArena,
    closed: Arc<AtomicBool>,
    cancel: CancellationToken,
) {
    tokio::spawn(async move {
        loop {
            tokio::select! {
                () = cancel.cancelled() => {
                    debug!(transport_id, "exit monitor: cancellation received");
                    break;
                }
                () = tokio::time::sleep(EXIT_POLL_INTERVAL) => {}
            }

            let polled = {
                let mut guard = child.lock().await;
                let result = guard.as_mut().map(Child::try_wait);
                match result {
                    None => None, // stop() took the child.
                    Some(Ok(None)) => {
                        continue;
                    }
                    Some(Ok(Some(status))) => {
                        guard.take();
                        Some(Some(status))
                    }
                    Some(Err(err)) => {
                        warn!(transport_id, %err, "exit monitor: poll failed");
                        guard.take();
                        Some(None)
                    }
                }
            };
            let Some(status) = polled else {
                break;
            };

            let reason = status.map_or_else(
                || "server process unobservable".to_owned(),
                |s| {
                    s.code().map_or_else(
                        || "server process terminated by signal".to_owned(),
                        |code| format!("server process exited with code {code}"),
                    )
                },
            );
            info!(transport_id, reason = %reason, "server process gone");
            closed.store(true, Ordering::SeqCst);
            fail_all_pending(&pending, || AppError::TransportClosed(reason.clone())).await;
            break;
        }
    });
}

// ── Helpers ───────────────────────────────────────────────────────────────────

/// Drain the pending arena, rejecting every entry with `make_err`.
///
/// Each oneshot is consumed exactly once; entries already resolved are no
/// longer in the arena, so double rejection is impossible by construction.
async fn fail_all_pending<F>(pending: &PendingArena, make_err: F)
where
    F: Fn() -> AppError,
{
    let drained: Vec<(RequestId, PendingEntry)> = {
        let mut guard = pending.lock().await;
        guard.drain().collect()
    };
    for (id, entry) in drained {
        debug!(%id, method = %entry.method, "rejecting in-flight request");
        let _ = entry.tx.send(Err(make_err()));
    }
}

/// Terminate the child gracefully: SIGTERM, then SIGKILL after
/// [`SHUTDOWN_GRACE`] if it is still alive.
async fn shutdown_child(transport_id: &str, mut child: Child) {
    #[cfg(unix)]
    {
        if let Some(pid) = child.id().and_then(|pid| i32::try_from(pid).ok()) {
            let _ = nix::sys::signal::kill(
                nix::unistd::Pid::from_raw(pid),
                nix::sys::signal::Signal::SIGTERM,
            );
            match tokio::time::timeout(SHUTDOWN_GRACE, child.wait()).await {
                Ok(Ok(status)) => {
                    debug!(transport_id, ?status, "server exited after SIGTERM");
                    return;
                }
                Ok(Err(err)) => {
                    warn!(transport_id, %err, "wait after SIGTERM failed");
                }
                Err(_) => {
                    warn!(transport_id, "server ignored SIGTERM, sending SIGKILL");
                }
            }
        }
    }

    if let Err(err) = child.kill().await {
        warn!(transport_id, %err, "failed to kill server process");
    }
}
