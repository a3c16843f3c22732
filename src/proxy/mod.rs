//! Interception proxy: a transparent relay with a parsing side channel.
//!
//! The proxy sits between an MCP host (talking on our stdin/stdout) and a
//! spawned MCP server, relaying bytes in both directions. Every relayed
//! chunk is also copied into an inspector task that assembles frames,
//! decodes them, writes the stderr transcript, and — in active mode —
//! evaluates security rules.
//!
//! Submodules:
//! - `relay`: the pump/writer/inspector tasks.
//! - `rules`: the ordered security-rule registry.
//! - `trace`: stderr transcript formatting.
//! - `report`: session counters and the exit summary.

pub mod relay;
pub mod report;
pub mod rules;
pub mod trace;

use std::process::{ExitStatus, Stdio};
use std::sync::Arc;
use std::time::Duration;

use tokio::process::{Child, Command};
use tokio::sync::mpsc;
use tracing::{debug, info, warn};

use crate::{AppError, Result};
use report::SessionReport;
use rules::RuleRegistry;
use trace::FrameTracer;

/// How long to wait for the server to exit on its own after the host hangs
/// up, before escalating to termination.
const EXIT_GRACE: Duration = Duration::from_secs(5);

/// How long a terminated server gets to honor SIGTERM before SIGKILL.
const TERMINATE_GRACE: Duration = Duration::from_secs(5);

// ── Shared vocabulary ─────────────────────────────────────────────────────────

/// Which way a frame is traveling through the proxy.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Direction {
    /// Host → server: bytes read from our stdin.
    ToServer,
    /// Server → host: bytes read from the server's stdout.
    FromServer,
}

impl Direction {
    /// Transcript arrow for this direction.
    #[must_use]
    pub fn arrow(self) -> &'static str {
        match self {
            Self::ToServer => "→",
            Self::FromServer => "←",
        }
    }

    /// Log-friendly name for this direction.
    #[must_use]
    pub fn label(self) -> &'static str {
        match self {
            Self::ToServer => "host → server",
            Self::FromServer => "server → host",
        }
    }
}

impl std::fmt::Display for Direction {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.label())
    }
}

/// Whether the session only observes or also judges.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ProxyMode {
    /// Trace every frame; never evaluate rules. Forwarding is byte-exact.
    Passive,
    /// Trace every frame and evaluate the rule registry against it.
    Active,
}

// ── Session ───────────────────────────────────────────────────────────────────

/// Configuration for one proxy session.
#[derive(Debug, Clone)]
pub struct ProxyOptions {
    /// Server executable to spawn.
    pub command: String,
    /// Arguments passed to the server executable.
    pub args: Vec<String>,
    /// Observe only, or evaluate rules too.
    pub mode: ProxyMode,
    /// Rules consulted in active mode. Ignored when passive.
    pub registry: RuleRegistry,
    /// Colorize the stderr transcript.
    pub color: bool,
    /// Payload preview cutoff for the transcript.
    pub truncate_chars: usize,
}

impl ProxyOptions {
    /// Passive defaults for `command`: no rules, no color, standard preview
    /// cutoff.
    #[must_use]
    pub fn new(command: impl Into<String>, args: Vec<String>) -> Self {
        Self {
            command: command.into(),
            args,
            mode: ProxyMode::Passive,
            registry: RuleRegistry::new(),
            color: false,
            truncate_chars: trace::DEFAULT_TRUNCATE_CHARS,
        }
    }
}

/// What a finished session leaves behind.
#[derive(Debug)]
pub struct SessionOutcome {
    /// Counters and violations for the summary.
    pub report: SessionReport,
    /// The server's exit code, which the CLI mirrors.
    pub exit_code: i32,
    /// Human-readable exit cause ("code=0", "signal=15").
    pub exit_description: String,
}

/// Run one proxy session to completion: spawn the server, relay both
/// directions between it and our own stdio, and return the summary once the
/// server exits.
///
/// # Errors
///
/// Returns [`AppError::Spawn`] when the server cannot start — fatal, before
/// any byte is relayed. I/O errors while waiting on the server process
/// surface as [`AppError::Io`].
pub async fn run(options: ProxyOptions) -> Result<SessionOutcome> {
    let ProxyOptions {
        command,
        args,
        mode,
        registry,
        color,
        truncate_chars,
    } = options;

    let registry = Arc::new(registry);
    let gated = mode == ProxyMode::Active && registry.has_blocking();

    let mut child = Command::new(&command)
        .args(&args)
        .stdin(Stdio::piped())
        .stdout(Stdio::piped())
        .stderr(Stdio::inherit())
        .kill_on_drop(true)
        .spawn()
        .map_err(|err| AppError::Spawn(format!("failed to spawn '{command}': {err}")))?;
    let child_stdin = child
        .stdin
        .take()
        .ok_or_else(|| AppError::Spawn("failed to capture server stdin".into()))?;
    let child_stdout = child
        .stdout
        .take()
        .ok_or_else(|| AppError::Spawn("failed to capture server stdout".into()))?;
    info!(pid = ?child.id(), command = %command, gated, "server spawned");

    let (to_server_tx, to_server_rx) = mpsc::unbounded_channel();
    let (to_host_tx, to_host_rx) = mpsc::unbounded_channel();
    let (inspect_tx, inspect_rx) = mpsc::unbounded_channel();

    let tracer = FrameTracer::new(color, truncate_chars);
    let inspector = relay::spawn_inspector(mode, Arc::clone(&registry), tracer, inspect_rx);

    // In gated mode the synthesized block replies travel on their own
    // channels: a writer's lifetime must follow its forward channel only, so
    // host stdin EOF still cascades to child-stdin closure while the
    // opposite pump is alive.
    let (writer_to_server, writer_to_host, mut pump_to_server, pump_from_server) = if gated {
        let (reply_to_server_tx, reply_to_server_rx) = mpsc::unbounded_channel();
        let (reply_to_host_tx, reply_to_host_rx) = mpsc::unbounded_channel();
        (
            relay::spawn_gated_writer(child_stdin, to_server_rx, reply_to_server_rx),
            relay::spawn_gated_writer(tokio::io::stdout(), to_host_rx, reply_to_host_rx),
            relay::spawn_frame_pump(
                tokio::io::stdin(),
                Direction::ToServer,
                to_server_tx.clone(),
                reply_to_host_tx,
                Arc::clone(&registry),
                inspect_tx.clone(),
            ),
            relay::spawn_frame_pump(
                child_stdout,
                Direction::FromServer,
                to_host_tx.clone(),
                reply_to_server_tx,
                Arc::clone(&registry),
                inspect_tx.clone(),
            ),
        )
    } else {
        (
            relay::spawn_writer(child_stdin, to_server_rx),
            relay::spawn_writer(tokio::io::stdout(), to_host_rx),
            relay::spawn_chunk_pump(
                tokio::io::stdin(),
                Direction::ToServer,
                to_server_tx.clone(),
                inspect_tx.clone(),
            ),
            relay::spawn_chunk_pump(
                child_stdout,
                Direction::FromServer,
                to_host_tx.clone(),
                inspect_tx.clone(),
            ),
        )
    };
    // only the pumps may keep the channels alive; closure must cascade once
    // the streams end
    drop((to_server_tx, to_host_tx, inspect_tx));

    let shutdown = shutdown_signal();
    tokio::pin!(shutdown);

    let status = tokio::select! {
        status = child.wait() => {
            status.map_err(|err| AppError::Io(format!("failed to wait on server: {err}")))?
        }
        () = &mut shutdown => {
            info!("shutdown signal received, terminating server");
            terminate_child(&mut child).await?
        }
        _ = &mut pump_to_server => {
            // the host hung up; a well-behaved server sees stdin EOF and
            // exits on its own
            debug!("host closed its end, waiting for server exit");
            match tokio::time::timeout(EXIT_GRACE, child.wait()).await {
                Ok(status) => {
                    status.map_err(|err| AppError::Io(format!("failed to wait on server: {err}")))?
                }
                Err(_) => {
                    warn!("server still running after host hangup, terminating");
                    terminate_child(&mut child).await?
                }
            }
        }
    };

    // drain whatever the server flushed before exiting, then tear down
    let _ = pump_from_server.await;
    pump_to_server.abort();
    let _ = writer_to_server.await;
    let _ = writer_to_host.await;
    let (stats, violations) = inspector
        .await
        .map_err(|err| AppError::Io(format!("inspector task failed: {err}")))?;

    let exit_code = status.code().unwrap_or(1);
    let exit_description = describe_exit(status);
    info!(exit = %exit_description, frames = stats.total_frames(), "session finished");

    Ok(SessionOutcome {
        report: SessionReport {
            mode,
            stats,
            violations,
        },
        exit_code,
        exit_description,
    })
}

/// "code=N" when the server exited, "signal=N" when a signal took it.
fn describe_exit(status: ExitStatus) -> String {
    if let Some(code) = status.code() {
        return format!("code={code}");
    }
    #[cfg(unix)]
    {
        use std::os::unix::process::ExitStatusExt;
        if let Some(signal) = status.signal() {
            return format!("signal={signal}");
        }
    }
    "unknown".into()
}

/// SIGTERM first, SIGKILL after [`TERMINATE_GRACE`]. Off unix it goes
/// straight to kill.
async fn terminate_child(child: &mut Child) -> Result<ExitStatus> {
    #[cfg(unix)]
    {
        use nix::sys::signal::{kill, Signal};
        use nix::unistd::Pid;

        if let Some(pid) = child.id() {
            if let Ok(pid) = i32::try_from(pid) {
                let _ = kill(Pid::from_raw(pid), Signal::SIGTERM);
                if let Ok(status) = tokio::time::timeout(TERMINATE_GRACE, child.wait()).await {
                    return status
                        .map_err(|err| AppError::Io(format!("failed to wait on server: {err}")));
                }
                warn!("server ignored SIGTERM, killing");
            }
        }
    }
    child
        .start_kill()
        .map_err(|err| AppError::Io(format!("failed to kill server: {err}")))?;
    child
        .wait()
        .await
        .map_err(|err| AppError::Io(format!("failed to wait on server: {err}")))
}

/// Resolves on ctrl-c, or on SIGTERM where that exists.
async fn shutdown_signal() {
    let ctrl_c = tokio::signal::ctrl_c();

    #[cfg(unix)]
    {
        match tokio::signal::unix::signal(tokio::signal::unix::SignalKind::terminate()) {
            Ok(mut sigterm) => {
                tokio::select! {
                    _ = ctrl_c => {}
                    _ = sigterm.recv() => {}
                }
            }
            Err(err) => {
                warn!(%err, "failed to register SIGTERM handler, using ctrl-c only");
                let _ = ctrl_c.await;
            }
        }
    }

    #[cfg(not(unix))]
    {
        if let Err(err) = ctrl_c.await {
            tracing::error!(%err, "ctrl-c signal handler failed");
        }
    }
}
